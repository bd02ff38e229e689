//! End-to-end behaviour of the gateway facade with an in-memory connection
//! factory. Network servers are always available; the process server points
//! at a binary that does not exist, so it never becomes available.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use nimbus_switchyard::{
    ConnectionFactory, EventSink, Gateway, GatewayConfig, GatewayError, GatewayEvent, RuleConfig,
    ServerDescriptor, Strategy, TransportHandle,
};

/// Hands out numbered in-memory connections.
#[derive(Default)]
struct MemoryFactory {
    created: AtomicU64,
}

impl ConnectionFactory for MemoryFactory {
    fn connect<'a>(
        &'a self,
        _descriptor: &'a ServerDescriptor,
    ) -> BoxFuture<'a, nimbus_switchyard::Result<TransportHandle>> {
        Box::pin(async move {
            let n = self.created.fetch_add(1, Ordering::SeqCst);
            Ok(TransportHandle::Custom(Arc::new(n)))
        })
    }
}

const CONFIG: &str = r#"
[pool]
acquire_timeout_ms = 100
drain_timeout_ms = 200

[[servers]]
id = "a"
transport = "network"
url = "http://127.0.0.1:7101/mcp"
priority = 10
max_connections = 2
category = "vcs"

[[servers]]
id = "b"
transport = "network"
url = "http://127.0.0.1:7102/mcp"
priority = 5
max_connections = 1
auth_required = true

[[servers]]
id = "broken"
transport = "process"
command = "/nonexistent/switchyard-integration-binary"
priority = 50

[[rules]]
pattern = "^git\\."
regex = true
target = "a"

[[rules]]
pattern = "^(search|fetch)\\."
regex = true
target = "a"

[[rules]]
pattern = "^(search|fetch)\\."
regex = true
target = "b"

[[rules]]
pattern = "build."
target = "broken"
priority = 10

[[rules]]
pattern = "build."
target = "a"

[[rules]]
pattern = "deploy."
target = "broken"
"#;

async fn started_gateway() -> (Gateway, tokio::sync::mpsc::Receiver<GatewayEvent>) {
    let config = GatewayConfig::from_toml_str(CONFIG).unwrap();
    let (events, rx) = EventSink::channel(256);
    let gateway =
        Gateway::with_factory(config, events, Arc::new(MemoryFactory::default())).unwrap();
    gateway.start_all().await;
    (gateway, rx)
}

#[tokio::test]
async fn test_saturated_server_times_out_third_acquire() {
    let (gw, _events) = started_gateway().await;

    let first = gw.dispatch("git.status", None).await.unwrap();
    let second = gw.dispatch("git.log", None).await.unwrap();
    assert_eq!(first.server_id(), "a");
    assert_eq!(second.server_id(), "a");

    let started = Instant::now();
    let third = gw.acquire("a").await;
    assert!(matches!(third, Err(GatewayError::Timeout(ref id, _)) if id == "a"));
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert!(third.as_ref().unwrap_err().is_retryable());

    let stats = gw.pool_stats("a").await.unwrap();
    assert_eq!(stats.active, 2);
    assert_eq!(stats.max_connections, 2);

    gw.release(&first).await;
    gw.release(&second).await;
    gw.stop_all().await;
}

#[tokio::test]
async fn test_search_methods_round_robin() {
    let (gw, _events) = started_gateway().await;

    let decision = gw.test_routing("search.x").await.unwrap();
    assert_eq!(decision.strategy, Strategy::RoundRobin);
    assert_eq!(decision.candidates, vec!["a", "b"]);

    let mut picks = Vec::new();
    for _ in 0..4 {
        picks.push(gw.route("search.x", None).await.unwrap());
    }
    assert_eq!(picks, vec!["a", "b", "a", "b"]);
    gw.stop_all().await;
}

#[tokio::test]
async fn test_explicit_unknown_server_is_unavailable() {
    let (gw, _events) = started_gateway().await;
    let result = gw.route("any.method", Some("z")).await;
    assert!(matches!(result, Err(GatewayError::Unavailable(id, _)) if id == "z"));
    gw.stop_all().await;
}

#[tokio::test]
async fn test_unmatched_method_is_not_found() {
    let (gw, _events) = started_gateway().await;
    let result = gw.route("unknown.op", None).await;
    assert!(matches!(result, Err(GatewayError::NotFound(method)) if method == "unknown.op"));
    gw.stop_all().await;
}

#[tokio::test]
async fn test_unavailable_targets_are_skipped() {
    let (gw, _events) = started_gateway().await;

    // "broken" has the higher rule priority but never started
    assert_eq!(gw.route("build.release", None).await.unwrap(), "a");
    assert_eq!(gw.available_servers("build.release").await, vec!["a"]);

    let only_broken = gw.route("deploy.prod", None).await;
    assert!(matches!(only_broken, Err(GatewayError::Unavailable(..))));

    let explicit = gw.route("build.release", Some("broken")).await;
    assert!(matches!(explicit, Err(GatewayError::Unavailable(id, _)) if id == "broken"));
    gw.stop_all().await;
}

#[tokio::test]
async fn test_drain_clean_after_release() {
    let (gw, mut events) = started_gateway().await;
    let conn = gw.acquire("a").await.unwrap();
    let id = conn.id();

    let releaser = async {
        tokio::time::sleep(Duration::from_millis(30)).await;
        gw.release(&conn).await;
    };
    let (forced, ()) = tokio::join!(gw.drain_server("a"), releaser);
    assert_eq!(forced, 0);

    let stats = gw.pool_stats("a").await.unwrap();
    assert_eq!(stats.total, 0);

    let mut released = false;
    let mut disposed = false;
    while let Ok(event) = events.try_recv() {
        match event {
            GatewayEvent::ConnectionReleased { connection_id, .. } => released |= connection_id == id,
            GatewayEvent::ConnectionDisposed { connection_id, .. } => disposed |= connection_id == id,
            _ => {}
        }
    }
    assert!(released);
    assert!(disposed);
    gw.stop_all().await;
}

#[tokio::test]
async fn test_drain_forces_active_and_rejects_waiters() {
    let config = GatewayConfig::from_toml_str(&CONFIG.replace(
        "acquire_timeout_ms = 100",
        "acquire_timeout_ms = 5000",
    ))
    .unwrap();
    let gw = Gateway::with_factory(config, EventSink::disabled(), Arc::new(MemoryFactory::default()))
        .unwrap();
    gw.start_all().await;

    let _held = gw.acquire("b").await.unwrap();
    let waiter = gw.acquire("b");
    let drainer = async {
        // Let the waiter queue up first
        tokio::time::sleep(Duration::from_millis(20)).await;
        gw.drain_server("b").await
    };
    let (waited, forced) = tokio::join!(waiter, drainer);

    assert!(matches!(waited, Err(GatewayError::Drained(id)) if id == "b"));
    assert_eq!(forced, 1);
    assert_eq!(gw.pool_stats("b").await.unwrap().total, 0);
    gw.stop_all().await;
}

#[tokio::test]
async fn test_rule_mutation_changes_routing() {
    let (gw, _events) = started_gateway().await;
    assert!(matches!(
        gw.route("cache.get", None).await,
        Err(GatewayError::NotFound(_))
    ));

    gw.add_routing_rule(&RuleConfig::literal("cache.", "b", 0))
        .await
        .unwrap();
    assert_eq!(gw.route("cache.get", None).await.unwrap(), "b");
    assert!(gw
        .list_routing_rules()
        .await
        .iter()
        .any(|r| r.pattern == "cache." && r.target == "b"));

    assert_eq!(gw.remove_routing_rule("cache.").await, 1);
    assert!(matches!(
        gw.route("cache.get", None).await,
        Err(GatewayError::NotFound(_))
    ));

    let bad_target = gw
        .add_routing_rule(&RuleConfig::literal("x.", "nowhere", 0))
        .await;
    assert!(matches!(bad_target, Err(GatewayError::Configuration(..))));
    gw.stop_all().await;
}

#[tokio::test]
async fn test_status_reports_every_enabled_server() {
    let (gw, _events) = started_gateway().await;
    let status = gw.get_status().await;
    let ids: Vec<&str> = status.iter().map(|s| s.server_id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b", "broken"]);

    let broken = status.iter().find(|s| s.server_id == "broken").unwrap();
    assert!(broken.last_error.is_some());
    assert!(broken.pid.is_none());

    assert_eq!(gw.all_pool_stats().await.len(), 3);
    gw.stop_all().await;
    assert!(gw.get_status().await.is_empty());
}
