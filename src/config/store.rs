//! Process-wide configuration handle.
//!
//! Every component holds an `Arc<ConfigStore>` instead of its own copy. A
//! mutation swaps in a new `Arc<Config>` and wakes every subscriber; nothing
//! reaches disk until [`ConfigStore::persist`] is called.

use super::Config;
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::watch;

pub struct ConfigStore {
    tx: watch::Sender<Arc<Config>>,
    save_lock: tokio::sync::Mutex<()>,
}

impl ConfigStore {
    pub fn new(config: Config) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(config));
        Self {
            tx,
            save_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Snapshot of the current configuration.
    pub fn current(&self) -> Arc<Config> {
        self.tx.borrow().clone()
    }

    /// Apply `f` to the shared configuration and notify subscribers.
    pub fn update(&self, f: impl FnOnce(&mut Config)) {
        self.tx.send_modify(|current| f(Arc::make_mut(current)));
    }

    /// Receiver that observes every subsequent [`ConfigStore::update`].
    pub fn subscribe(&self) -> watch::Receiver<Arc<Config>> {
        self.tx.subscribe()
    }

    /// Write the current configuration back to its `config.toml`.
    pub async fn persist(&self) -> Result<()> {
        let _guard = self.save_lock.lock().await;
        let snapshot = self.current();
        snapshot.save().await
    }
}
