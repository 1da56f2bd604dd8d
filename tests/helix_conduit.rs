//! Helix conduit client and shard reconciler against a mocked Helix API.

use nepbot::conduit::{ReconcileOutcome, ShardReconciler};
use nepbot::config::{Config, ConfigStore};
use nepbot::helix::{build_http_client, ConduitApi, HelixClient, ShardStatus};
use nepbot::FatalError;
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use wiremock::matchers::{body_json, body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

const SECRET: &str = "0123456789abcdef";
const HOST: &str = "bot.example.com";

struct Fixture {
    helix: Arc<HelixClient>,
    store: Arc<ConfigStore>,
    tmp: TempDir,
}

impl Fixture {
    fn reconciler(&self) -> ShardReconciler {
        let api: Arc<dyn ConduitApi> = self.helix.clone();
        ShardReconciler::new(api, Arc::clone(&self.store))
    }
}

fn fixture(server: &MockServer, conduit_id: &str) -> Fixture {
    let tmp = TempDir::new().unwrap();
    let mut config = Config::default();
    config.config_path = tmp.path().join("config.toml");
    config.twitch.client_id = "nepbot-client".into();
    config.twitch.last_token = "app-token".into();
    config.twitch.api_base_url = server.uri();
    config.twitch.eventsub.secret = SECRET.into();
    config.twitch.eventsub.host = HOST.into();
    config.twitch.eventsub.conduit_id = conduit_id.into();

    let store = Arc::new(ConfigStore::new(config));
    let helix = Arc::new(HelixClient::new(Arc::clone(&store), build_http_client(5).unwrap()));
    Fixture {
        helix,
        store,
        tmp,
    }
}

fn shard(id: u32, host: &str, status: &str) -> Value {
    json!({
        "id": id.to_string(),
        "status": status,
        "transport": {
            "method": "webhook",
            "callback": format!("https://{host}/twitch/callback")
        }
    })
}

/// Serves shard pages keyed by the `after` cursor of the request.
struct ShardPages {
    pages: Vec<Vec<Value>>,
}

impl Respond for ShardPages {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let index = request
            .url
            .query_pairs()
            .find(|(k, _)| k == "after")
            .and_then(|(_, v)| v.strip_prefix("page-").and_then(|n| n.parse::<usize>().ok()))
            .unwrap_or(0);
        let data = self.pages.get(index).cloned().unwrap_or_default();
        let pagination = if index + 1 < self.pages.len() {
            json!({ "cursor": format!("page-{}", index + 1) })
        } else {
            json!({})
        };
        ResponseTemplate::new(200).set_body_json(json!({ "data": data, "pagination": pagination }))
    }
}

async fn mount_conduits(server: &MockServer, conduits: Value) {
    Mock::given(method("GET"))
        .and(path("/eventsub/conduits"))
        .and(header("Authorization", "Bearer app-token"))
        .and(header("Client-Id", "nepbot-client"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": conduits })))
        .mount(server)
        .await;
}

async fn mount_shards(server: &MockServer, pages: Vec<Vec<Value>>) {
    Mock::given(method("GET"))
        .and(path("/eventsub/conduits/shards"))
        .and(query_param("conduit_id", "conduit-1"))
        .respond_with(ShardPages { pages })
        .mount(server)
        .await;
}

fn our_transport() -> Value {
    json!({
        "method": "webhook",
        "callback": format!("https://{HOST}/twitch/callback"),
        "secret": SECRET
    })
}

#[tokio::test]
async fn shard_listing_follows_cursor_sequentially() {
    let server = MockServer::start().await;
    mount_shards(
        &server,
        vec![
            vec![shard(0, "a.example", "enabled"), shard(1, "b.example", "enabled")],
            vec![shard(2, "c.example", "enabled")],
            vec![shard(3, HOST, "webhook_callback_verification_failed")],
        ],
    )
    .await;
    let fx = fixture(&server, "conduit-1");

    let shards = fx.reconciler().fetch_shards("conduit-1").await.unwrap();

    let ids: Vec<u32> = shards.iter().map(|s| s.id).collect();
    assert_eq!(ids, vec![0, 1, 2, 3]);
    assert_eq!(shards[3].status, ShardStatus::WebhookCallbackVerificationFailed);
}

#[tokio::test]
async fn foreign_shard_only_grows_conduit_then_claims_top_slot() {
    let server = MockServer::start().await;
    mount_conduits(&server, json!([{ "id": "conduit-1", "shard_count": 2 }])).await;
    mount_shards(&server, vec![vec![shard(0, "other.example", "enabled")]]).await;
    Mock::given(method("PATCH"))
        .and(path("/eventsub/conduits"))
        .and(body_json(json!({ "id": "conduit-1", "shard_count": 3 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{ "id": "conduit-1", "shard_count": 3 }]
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/eventsub/conduits/shards"))
        .and(body_partial_json(json!({
            "conduit_id": "conduit-1",
            "shards": [{ "id": "2", "transport": our_transport() }]
        })))
        .respond_with(ResponseTemplate::new(202).set_body_json(json!({
            "data": [{ "id": "2", "status": "webhook_callback_verification_pending" }],
            "errors": []
        })))
        .expect(1)
        .mount(&server)
        .await;
    let fx = fixture(&server, "conduit-1");

    let outcome = fx.reconciler().run().await.unwrap();

    assert_eq!(
        outcome,
        ReconcileOutcome::Claimed {
            shard_id: 2,
            shard_count: 3
        }
    );
}

#[tokio::test]
async fn enabled_own_shard_makes_no_mutating_calls() {
    let server = MockServer::start().await;
    mount_conduits(&server, json!([{ "id": "conduit-1", "shard_count": 2 }])).await;
    mount_shards(
        &server,
        vec![vec![shard(0, "other.example", "enabled"), shard(1, HOST, "enabled")]],
    )
    .await;
    Mock::given(method("PATCH"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;
    let fx = fixture(&server, "conduit-1");

    let outcome = fx.reconciler().run().await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::AlreadyEnabled { shard_id: 1 });
}

#[tokio::test]
async fn shard_update_error_entry_aborts_reconciliation() {
    let server = MockServer::start().await;
    mount_conduits(&server, json!([{ "id": "conduit-1", "shard_count": 1 }])).await;
    mount_shards(
        &server,
        vec![vec![shard(0, HOST, "notification_failures_exceeded")]],
    )
    .await;
    Mock::given(method("PATCH"))
        .and(path("/eventsub/conduits/shards"))
        .respond_with(ResponseTemplate::new(202).set_body_json(json!({
            "data": [],
            "errors": [{ "id": "0", "message": "callback verification failed", "code": "verification_failed" }]
        })))
        .expect(1)
        .mount(&server)
        .await;
    let fx = fixture(&server, "conduit-1");

    let outcome = fx.reconciler().run().await.unwrap();

    match outcome {
        ReconcileOutcome::Aborted { reason } => {
            assert!(reason.contains("callback verification failed"), "{reason}");
        }
        other => panic!("expected Aborted, got {other:?}"),
    }
}

#[tokio::test]
async fn conduit_listing_failure_is_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/eventsub/conduits"))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream exploded"))
        .mount(&server)
        .await;
    let fx = fixture(&server, "conduit-1");

    let err = fx.reconciler().run().await.unwrap_err();

    assert!(matches!(err, FatalError::ConduitFetch(_)));
    assert_eq!(err.exit_code(), 4);
}

#[tokio::test]
async fn missing_conduit_is_created_and_persisted() {
    let server = MockServer::start().await;
    mount_conduits(&server, json!([])).await;
    Mock::given(method("POST"))
        .and(path("/eventsub/conduits"))
        .and(body_json(json!({ "shard_count": 1 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{ "id": "conduit-new", "shard_count": 1 }]
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/eventsub/conduits/shards"))
        .and(body_partial_json(json!({
            "conduit_id": "conduit-new",
            "shards": [{ "id": "0" }]
        })))
        .respond_with(ResponseTemplate::new(202).set_body_json(json!({ "data": [], "errors": [] })))
        .expect(1)
        .mount(&server)
        .await;
    let fx = fixture(&server, "");

    let outcome = fx.reconciler().run().await.unwrap();

    assert_eq!(
        outcome,
        ReconcileOutcome::Claimed {
            shard_id: 0,
            shard_count: 1
        }
    );
    assert_eq!(fx.store.current().twitch.eventsub.conduit_id, "conduit-new");
    let saved = Config::load_or_init(fx.tmp.path()).await.unwrap();
    assert_eq!(saved.twitch.eventsub.conduit_id, "conduit-new");
}

#[tokio::test]
async fn rotated_token_is_used_by_next_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/eventsub/conduits"))
        .and(header("Authorization", "Bearer rotated-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [] })))
        .expect(1)
        .mount(&server)
        .await;
    let fx = fixture(&server, "conduit-1");
    fx.store.update(|cfg| cfg.twitch.last_token = "rotated-token".into());

    assert!(fx.helix.list_conduits().await.unwrap().is_empty());
}

#[tokio::test]
async fn chat_reply_is_threaded_under_parent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/messages"))
        .and(body_json(json!({
            "broadcaster_id": "100",
            "sender_id": "900",
            "message": "pong",
            "reply_parent_message_id": "chat-1"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{ "message_id": "m-2", "is_sent": true }]
        })))
        .expect(1)
        .mount(&server)
        .await;
    let fx = fixture(&server, "conduit-1");

    fx.helix
        .send_chat_message("100", "900", "pong", Some("chat-1"))
        .await
        .unwrap();
}

#[tokio::test]
async fn dropped_chat_message_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{
                "message_id": "",
                "is_sent": false,
                "drop_reason": { "code": "msg_duplicate", "message": "duplicate message" }
            }]
        })))
        .mount(&server)
        .await;
    let fx = fixture(&server, "conduit-1");

    let err = fx
        .helix
        .send_chat_message("100", "900", "pong", None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("duplicate message"));
}
