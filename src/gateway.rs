//! Gateway: the single public entry point tying the supervisor, pool and
//! router together.
//!
//! Lifecycle is explicit: build with `from_config` (or `with_factory`), call
//! `start_all`, serve requests, then `stop_all`.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{GatewayConfig, RuleConfig, ServerDescriptor};
use crate::error::GatewayError;
use crate::events::EventSink;
use crate::pool::connection::{Connection, PoolStats};
use crate::pool::factory::{ConnectionFactory, McpConnectionFactory};
use crate::pool::ConnectionPool;
use crate::router::rules::RuleSummary;
use crate::router::{Router, RoutingDecision};
use crate::supervisor::{ServerStatus, Supervisor};

pub struct Gateway {
    /// Enabled servers in config order.
    servers: Vec<ServerDescriptor>,
    supervisor: Arc<Supervisor>,
    pool: Arc<ConnectionPool>,
    router: Router,
    /// Root token; cancelling it tears down MCP sessions and the sweep.
    cancel: CancellationToken,
    sweeper: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl Gateway {
    /// Build a gateway that connects to servers over MCP.
    ///
    /// Calls `config.validate()` first and returns an error without spawning
    /// anything if the config is invalid.
    pub fn from_config(config: GatewayConfig, events: EventSink) -> crate::Result<Self> {
        config.validate()?;
        let cancel = CancellationToken::new();
        let supervisor = Arc::new(Supervisor::new(config.supervisor.clone(), events.clone()));
        let factory = Arc::new(McpConnectionFactory::new(
            Arc::clone(&supervisor),
            cancel.child_token(),
        ));
        Self::assemble(config, events, supervisor, factory, cancel)
    }

    /// Build a gateway whose pool creates connections through `factory`.
    pub fn with_factory(
        config: GatewayConfig,
        events: EventSink,
        factory: Arc<dyn ConnectionFactory>,
    ) -> crate::Result<Self> {
        config.validate()?;
        let supervisor = Arc::new(Supervisor::new(config.supervisor.clone(), events.clone()));
        Self::assemble(config, events, supervisor, factory, CancellationToken::new())
    }

    fn assemble(
        config: GatewayConfig,
        events: EventSink,
        supervisor: Arc<Supervisor>,
        factory: Arc<dyn ConnectionFactory>,
        cancel: CancellationToken,
    ) -> crate::Result<Self> {
        let servers: Vec<ServerDescriptor> = config.enabled_servers().cloned().collect();
        let router = Router::new(&servers, &config.rules, supervisor.clone())?;
        let pool = Arc::new(ConnectionPool::new(config.pool, factory, events));

        tracing::debug!(
            servers = servers.len(),
            rules = config.rules.len(),
            "gateway assembled"
        );

        Ok(Self {
            servers,
            supervisor,
            pool,
            router,
            cancel,
            sweeper: Mutex::new(None),
        })
    }

    /// Start every enabled server and the expiry sweep.
    ///
    /// Returns one launch result per server. Failures are per server; the
    /// supervisor keeps retrying failed ones in the background.
    pub async fn start_all(&self) -> Vec<(String, crate::Result<()>)> {
        let results = self.supervisor.start(&self.servers).await;

        for (id, result) in &results {
            if let Err(e) = result {
                tracing::warn!(server = %id, error = %e, "server failed to start");
            }
        }

        let mut sweeper = self.sweeper.lock().await;
        if sweeper.is_none() {
            let token = self.cancel.child_token();
            let handle = self.pool.spawn_sweeper(token.clone());
            *sweeper = Some((token, handle));
        }

        let started = results.iter().filter(|(_, r)| r.is_ok()).count();
        tracing::info!(started, total = results.len(), "gateway started");
        results
    }

    /// Stop the sweep, drain every pool concurrently, then stop all processes.
    ///
    /// Always completes.
    pub async fn stop_all(&self) {
        if let Some((token, handle)) = self.sweeper.lock().await.take() {
            token.cancel();
            if let Err(e) = handle.await {
                tracing::debug!(error = %e, "expiry sweep task ended abnormally");
            }
        }

        let ids = self.pool.server_ids().await;
        let forced: usize = join_all(ids.iter().map(|id| self.pool.drain(id)))
            .await
            .into_iter()
            .sum();
        if forced > 0 {
            tracing::warn!(forced, "connections force-disposed during shutdown");
        }

        self.supervisor.stop().await;
        self.cancel.cancel();
        tracing::info!("gateway stopped");
    }

    /// Per-server lifecycle status, sorted by id.
    pub async fn get_status(&self) -> Vec<ServerStatus> {
        self.supervisor.status().await
    }

    /// Pick a server for `method`, or validate an explicit one.
    pub async fn route(&self, method: &str, explicit: Option<&str>) -> crate::Result<String> {
        self.router.route(method, explicit).await
    }

    /// Check out a connection to `server_id`.
    ///
    /// Fails `Unavailable` for unknown servers and servers that are not running.
    pub async fn acquire(&self, server_id: &str) -> crate::Result<Connection> {
        let descriptor = self.descriptor(server_id).ok_or_else(|| {
            GatewayError::Unavailable(server_id.to_string(), "server is not configured".to_string())
        })?;
        if !self.supervisor.is_available(server_id).await {
            return Err(GatewayError::Unavailable(
                server_id.to_string(),
                "server is not running".to_string(),
            ));
        }
        self.pool.acquire(descriptor).await
    }

    /// Route `method` and check out a connection to the chosen server.
    pub async fn dispatch(&self, method: &str, explicit: Option<&str>) -> crate::Result<Connection> {
        let server_id = self.route(method, explicit).await?;
        self.acquire(&server_id).await
    }

    pub async fn release(&self, connection: &Connection) {
        self.pool.release(connection).await;
    }

    /// Remove a broken connection from its pool.
    pub async fn dispose(&self, connection: &Connection, reason: Option<&str>) -> bool {
        self.pool.dispose(connection, reason).await
    }

    pub async fn mark_error(&self, connection: &Connection, reason: &str) {
        self.pool.mark_error(connection, reason).await;
    }

    /// Pool stats for a configured server; empty stats if nothing was pooled yet.
    pub async fn pool_stats(&self, server_id: &str) -> Option<PoolStats> {
        if let Some(stats) = self.pool.stats(server_id).await {
            return Some(stats);
        }
        self.descriptor(server_id)
            .map(|d| PoolStats::empty(server_id, d.max_connections(self.pool.config())))
    }

    /// Pool stats for every configured server, in config order.
    pub async fn all_pool_stats(&self) -> Vec<PoolStats> {
        let mut all = Vec::with_capacity(self.servers.len());
        for server in &self.servers {
            if let Some(stats) = self.pool_stats(&server.id).await {
                all.push(stats);
            }
        }
        all
    }

    pub async fn add_routing_rule(&self, rule: &RuleConfig) -> crate::Result<()> {
        self.router.add_rule(rule).await
    }

    /// Remove every rule with this pattern. Returns how many were removed.
    pub async fn remove_routing_rule(&self, pattern: &str) -> usize {
        self.router.remove_rule(pattern).await
    }

    pub async fn list_routing_rules(&self) -> Vec<RuleSummary> {
        self.router.rules().await
    }

    /// Dry-run routing: same decision as `route`, no counters touched.
    pub async fn test_routing(&self, method: &str) -> crate::Result<RoutingDecision> {
        self.router.test_routing(method).await
    }

    pub async fn available_servers(&self, method: &str) -> Vec<String> {
        self.router.available_servers(method).await
    }

    /// Drain one server's pool. Returns how many active connections had to
    /// be force-disposed.
    pub async fn drain_server(&self, server_id: &str) -> usize {
        self.pool.drain(server_id).await
    }

    /// Recent stderr output of a process server.
    pub async fn recent_stderr(&self, server_id: &str) -> Vec<String> {
        self.supervisor.recent_stderr(server_id).await
    }

    fn descriptor(&self, server_id: &str) -> Option<&ServerDescriptor> {
        self.servers.iter().find(|s| s.id == server_id)
    }
}
