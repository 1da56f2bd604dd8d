//! Startup failures that stop the process.
//!
//! Each variant maps to a fixed exit status so operators can tell failure
//! classes apart without reading logs:
//!
//! | status | variant                    |
//! |--------|----------------------------|
//! | 1      | `TokenUnusable`            |
//! | 2      | `UnrecognizedShardStatus`  |
//! | 3      | `ShardFetch`               |
//! | 4      | `ConduitFetch`             |
//! | 5      | `Startup`                  |

#[derive(Debug, thiserror::Error)]
pub enum FatalError {
    #[error("no usable app access token: {0}")]
    TokenUnusable(String),

    #[error("own shard {shard_id} is in unrecognized status {status:?}")]
    UnrecognizedShardStatus { shard_id: u32, status: String },

    #[error("failed to fetch conduit shards: {0:#}")]
    ShardFetch(anyhow::Error),

    #[error("failed to fetch conduit details: {0:#}")]
    ConduitFetch(anyhow::Error),

    #[error("startup failed: {0:#}")]
    Startup(#[from] anyhow::Error),
}

impl FatalError {
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::TokenUnusable(_) => 1,
            Self::UnrecognizedShardStatus { .. } => 2,
            Self::ShardFetch(_) => 3,
            Self::ConduitFetch(_) => 4,
            Self::Startup(_) => 5,
        }
    }
}
