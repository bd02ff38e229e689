//! Bounded, reusable connections per server id.
//!
//! Each server gets its own `ServerPool` behind its own mutex, so operations on
//! different servers never serialize against each other. Per server:
//! - `active + idle <= max_connections`, with in-flight creations counted too.
//! - Saturated acquires queue FIFO with a deadline; `release` hands the
//!   connection straight to the oldest waiter without it ever becoming idle.
//! - A periodic sweep disposes aged or long-idle connections (never active ones).

pub mod connection;
pub mod factory;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, Mutex, Notify, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::{PoolConfig, ServerDescriptor};
use crate::error::GatewayError;
use crate::events::{EventSink, GatewayEvent};
use crate::pool::connection::{Connection, ConnectionStatus, PoolStats, PooledConnection};
use crate::pool::factory::ConnectionFactory;

/// What a queued acquire is woken with.
enum Grant {
    /// A released connection, handed over while still active.
    Connection(Connection),
    /// A reserved creation slot; the waiter creates its own connection.
    Slot,
    Drained,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Grant>,
}

/// Receiving end of a queued acquire.
///
/// If the acquire is dropped after a grant was sent but before it was read,
/// the grant goes back to the pool instead of being lost with the receiver.
struct PendingGrant {
    pool: Arc<ConnectionPool>,
    server: Arc<Mutex<ServerPool>>,
    rx: oneshot::Receiver<Grant>,
}

impl Drop for PendingGrant {
    fn drop(&mut self) {
        self.rx.close();
        let Ok(grant) = self.rx.try_recv() else {
            return;
        };
        if let Ok(mut guard) = self.server.try_lock() {
            self.pool.reclaim(&mut guard, grant);
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let pool = Arc::clone(&self.pool);
        let server = Arc::clone(&self.server);
        runtime.spawn(async move {
            let mut guard = server.lock().await;
            pool.reclaim(&mut guard, grant);
        });
    }
}

/// Connections and waiting queue for one server.
struct ServerPool {
    server_id: String,
    max_connections: usize,
    connections: Vec<PooledConnection>,
    /// Creations in flight; they count toward the bound.
    creating: usize,
    waiters: VecDeque<Waiter>,
    draining: bool,
    /// Signalled whenever an active connection stops being active.
    quiesced: Arc<Notify>,
}

impl ServerPool {
    fn new(server_id: &str, max_connections: usize) -> Self {
        Self {
            server_id: server_id.to_string(),
            max_connections,
            connections: Vec::new(),
            creating: 0,
            waiters: VecDeque::new(),
            draining: false,
            quiesced: Arc::new(Notify::new()),
        }
    }

    fn count(&self, status: ConnectionStatus) -> usize {
        self.connections.iter().filter(|c| c.status == status).count()
    }

    fn live(&self) -> usize {
        self.count(ConnectionStatus::Active) + self.count(ConnectionStatus::Idle)
    }

    fn has_capacity(&self) -> bool {
        self.live() + self.creating < self.max_connections
    }

    fn position(&self, connection_id: u64) -> Option<usize> {
        self.connections.iter().position(|c| c.id == connection_id)
    }

    fn remove(&mut self, connection_id: u64) -> Option<PooledConnection> {
        self.position(connection_id)
            .map(|idx| self.connections.remove(idx))
    }

    fn stats(&self) -> PoolStats {
        let active = self.count(ConnectionStatus::Active);
        PoolStats {
            server_id: self.server_id.clone(),
            total: self.connections.len(),
            active,
            idle: self.count(ConnectionStatus::Idle),
            error: self.count(ConnectionStatus::Error),
            waiting: self.waiters.len(),
            max_connections: self.max_connections,
            utilization: active as f64 / self.max_connections as f64,
        }
    }
}

/// Per-server connection pools sharing one factory and one set of limits.
pub struct ConnectionPool {
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    events: EventSink,
    pools: RwLock<HashMap<String, Arc<Mutex<ServerPool>>>>,
    next_connection_id: AtomicU64,
    next_waiter_id: AtomicU64,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig, factory: Arc<dyn ConnectionFactory>, events: EventSink) -> Self {
        Self {
            config,
            factory,
            events,
            pools: RwLock::new(HashMap::new()),
            next_connection_id: AtomicU64::new(1),
            next_waiter_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Check out a connection for `descriptor`'s server.
    ///
    /// Reuses an idle connection, else creates one if under the bound, else
    /// waits FIFO until a release hands one over or `acquire_timeout` elapses.
    pub async fn acquire(self: &Arc<Self>, descriptor: &ServerDescriptor) -> crate::Result<Connection> {
        let server_id = descriptor.id.as_str();
        let pool = self.server_pool(descriptor).await;

        let (waiter_id, rx) = {
            let mut guard = pool.lock().await;
            if guard.draining {
                return Err(GatewayError::Drained(server_id.to_string()));
            }

            if let Some(conn) = self.take_idle(&mut guard) {
                tracing::trace!(server = %server_id, connection = conn.id(), "reusing idle connection");
                return Ok(conn);
            }

            if guard.has_capacity() {
                guard.creating += 1;
                drop(guard);
                return self.create(&pool, descriptor).await;
            }

            // Callers that gave up no longer hold a place in the queue
            guard.waiters.retain(|w| !w.tx.is_closed());
            if guard.waiters.len() >= self.config.max_waiting_requests {
                return Err(GatewayError::Unavailable(
                    server_id.to_string(),
                    format!(
                        "pool saturated with {} waiting requests",
                        guard.waiters.len()
                    ),
                ));
            }

            let (tx, rx) = oneshot::channel();
            let id = self.next_waiter_id.fetch_add(1, Ordering::Relaxed);
            guard.waiters.push_back(Waiter { id, tx });
            tracing::debug!(
                server = %server_id,
                waiting = guard.waiters.len(),
                "pool saturated, queueing acquire"
            );
            (id, rx)
        };

        self.wait(&pool, descriptor, waiter_id, rx).await
    }

    /// Return a connection. Hands it to the oldest waiter if there is one.
    ///
    /// No-op unless the connection is currently active and `conn` is the
    /// handle of its current checkout.
    pub async fn release(&self, conn: &Connection) {
        let Some(pool) = self.existing_pool(conn.server_id()).await else {
            return;
        };
        let mut guard = pool.lock().await;
        self.release_locked(&mut guard, conn);
    }

    /// Remove a connection from its pool unconditionally.
    ///
    /// Returns whether the connection was still pooled.
    pub async fn dispose(&self, conn: &Connection, reason: Option<&str>) -> bool {
        let Some(pool) = self.existing_pool(conn.server_id()).await else {
            return false;
        };
        let mut guard = pool.lock().await;
        let Some(mut pooled) = guard.remove(conn.id()) else {
            return false;
        };
        pooled.status = ConnectionStatus::Disposed;
        self.emit_disposed(&pooled, reason.map(str::to_string));
        self.grant_slots(&mut guard);
        guard.quiesced.notify_waiters();
        true
    }

    /// Flag a connection as broken. It stops counting toward the bound and
    /// is disposed by the next sweep.
    pub async fn mark_error(&self, conn: &Connection, reason: &str) {
        let Some(pool) = self.existing_pool(conn.server_id()).await else {
            return;
        };
        let mut guard = pool.lock().await;
        let Some(idx) = guard.position(conn.id()) else {
            return;
        };
        let pooled = &mut guard.connections[idx];
        if pooled.status == ConnectionStatus::Disposed || pooled.status == ConnectionStatus::Error {
            return;
        }
        pooled.status = ConnectionStatus::Error;
        pooled.last_error = Some(reason.to_string());
        tracing::warn!(
            server = %conn.server_id(),
            connection = conn.id(),
            reason = %reason,
            "connection marked as errored"
        );
        self.grant_slots(&mut guard);
        guard.quiesced.notify_waiters();
    }

    /// Dispose expired idle connections and errored ones across every server.
    ///
    /// Returns how many connections were disposed.
    pub async fn sweep(&self) -> usize {
        let pools: Vec<Arc<Mutex<ServerPool>>> = self.pools.read().await.values().cloned().collect();
        let max_age = self.config.max_connection_age();
        let max_idle = self.config.max_idle_time();
        let mut disposed = 0;

        for pool in pools {
            let mut guard = pool.lock().await;
            let now = Instant::now();

            // Snapshot ids under the lock so overlapping sweeps never double-dispose
            let doomed: Vec<(u64, Option<String>)> = guard
                .connections
                .iter()
                .filter_map(|c| match c.status {
                    ConnectionStatus::Idle if c.is_expired(now, max_age, max_idle) => {
                        Some((c.id, Some("expired".to_string())))
                    }
                    ConnectionStatus::Error => Some((c.id, c.last_error.clone())),
                    _ => None,
                })
                .collect();

            for (id, reason) in doomed {
                if let Some(mut pooled) = guard.remove(id) {
                    pooled.status = ConnectionStatus::Disposed;
                    self.emit_disposed(&pooled, reason);
                    disposed += 1;
                }
            }
            self.grant_slots(&mut guard);

            let live = guard.live();
            if live < self.config.min_connections && !guard.draining {
                tracing::debug!(
                    server = %guard.server_id,
                    current = live,
                    minimum = self.config.min_connections,
                    "pool below minimum"
                );
                self.events.emit(GatewayEvent::PoolBelowMinimum {
                    server_id: guard.server_id.clone(),
                    current: live,
                    minimum: self.config.min_connections,
                });
            }
        }

        disposed
    }

    /// Run `sweep` on the configured interval until `cancel` fires.
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let pool = Arc::clone(self);
        let period = self.config.sweep_interval().max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let disposed = pool.sweep().await;
                        if disposed > 0 {
                            tracing::debug!(disposed, "expiry sweep disposed connections");
                        }
                    }
                    _ = cancel.cancelled() => {
                        tracing::debug!("expiry sweep stopped");
                        return;
                    }
                }
            }
        })
    }

    /// Shut down one server's pool.
    ///
    /// Rejects queued waiters with `Drained`, blocks new acquires, waits up to
    /// `drain_timeout` for active connections to be released, then disposes
    /// everything left. Returns how many connections were still active when
    /// the wait ended.
    pub async fn drain(&self, server_id: &str) -> usize {
        let Some(pool) = self.existing_pool(server_id).await else {
            return 0;
        };

        let quiesced = {
            let mut guard = pool.lock().await;
            guard.draining = true;
            for waiter in guard.waiters.drain(..) {
                let _ = waiter.tx.send(Grant::Drained);
            }
            Arc::clone(&guard.quiesced)
        };

        let deadline = tokio::time::Instant::now() + self.config.drain_timeout();
        loop {
            // Register interest before checking so a release in between is not missed
            let notified = quiesced.notified();
            if pool.lock().await.count(ConnectionStatus::Active) == 0 {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }

        let mut guard = pool.lock().await;
        let still_active = guard.count(ConnectionStatus::Active);
        if still_active > 0 {
            tracing::warn!(
                server = %server_id,
                active = still_active,
                "drain grace period elapsed, force-disposing active connections"
            );
        }
        for mut pooled in std::mem::take(&mut guard.connections) {
            let reason = if pooled.status == ConnectionStatus::Active {
                "drained while active"
            } else {
                "drained"
            };
            pooled.status = ConnectionStatus::Disposed;
            self.emit_disposed(&pooled, Some(reason.to_string()));
        }
        drop(guard);

        let mut pools = self.pools.write().await;
        if pools.get(server_id).is_some_and(|p| Arc::ptr_eq(p, &pool)) {
            pools.remove(server_id);
        }
        tracing::info!(server = %server_id, "pool drained");
        still_active
    }

    /// Stats for one server, or `None` if it has no pool yet.
    pub async fn stats(&self, server_id: &str) -> Option<PoolStats> {
        let pool = self.existing_pool(server_id).await?;
        let guard = pool.lock().await;
        Some(guard.stats())
    }

    /// Stats for every server with a pool, sorted by server id.
    pub async fn all_stats(&self) -> Vec<PoolStats> {
        let pools: Vec<Arc<Mutex<ServerPool>>> = self.pools.read().await.values().cloned().collect();
        let mut stats = Vec::with_capacity(pools.len());
        for pool in pools {
            stats.push(pool.lock().await.stats());
        }
        stats.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        stats
    }

    /// Ids of servers that currently have a pool.
    pub async fn server_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.pools.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn existing_pool(&self, server_id: &str) -> Option<Arc<Mutex<ServerPool>>> {
        self.pools.read().await.get(server_id).cloned()
    }

    async fn server_pool(&self, descriptor: &ServerDescriptor) -> Arc<Mutex<ServerPool>> {
        if let Some(pool) = self.existing_pool(&descriptor.id).await {
            return pool;
        }
        let mut pools = self.pools.write().await;
        Arc::clone(pools.entry(descriptor.id.clone()).or_insert_with(|| {
            Arc::new(Mutex::new(ServerPool::new(
                &descriptor.id,
                descriptor.max_connections(&self.config),
            )))
        }))
    }

    /// Check out the first idle connection that has not expired, disposing
    /// expired ones found on the way.
    fn take_idle(&self, guard: &mut ServerPool) -> Option<Connection> {
        let now = Instant::now();
        let max_age = self.config.max_connection_age();
        let max_idle = self.config.max_idle_time();
        loop {
            let idx = guard
                .connections
                .iter()
                .position(|c| c.status == ConnectionStatus::Idle)?;
            if guard.connections[idx].is_expired(now, max_age, max_idle) {
                let mut pooled = guard.connections.remove(idx);
                pooled.status = ConnectionStatus::Disposed;
                self.emit_disposed(&pooled, Some("expired".to_string()));
                continue;
            }
            return Some(guard.connections[idx].checkout());
        }
    }

    /// Create a connection in a detached task, so an abandoned acquire still
    /// settles the reserved slot.
    async fn create(
        self: &Arc<Self>,
        pool: &Arc<Mutex<ServerPool>>,
        descriptor: &ServerDescriptor,
    ) -> crate::Result<Connection> {
        let (tx, rx) = oneshot::channel::<crate::Result<Connection>>();
        let this = Arc::clone(self);
        let pool = Arc::clone(pool);
        let descriptor = descriptor.clone();
        let server_id = descriptor.id.clone();

        tokio::spawn(async move {
            let result = this.establish(&descriptor).await;

            let mut guard = pool.lock().await;
            guard.creating = guard.creating.saturating_sub(1);

            let outcome = match result {
                Ok(_) if guard.draining => {
                    Err(GatewayError::Drained(descriptor.id.clone()))
                }
                Ok(transport) => {
                    let id = this.next_connection_id.fetch_add(1, Ordering::Relaxed);
                    let pooled = PooledConnection::new(id, &descriptor.id, transport);
                    let conn = pooled.handle();
                    guard.connections.push(pooled);
                    tracing::debug!(
                        server = %descriptor.id,
                        connection = id,
                        live = guard.live(),
                        "connection created"
                    );
                    Ok(conn)
                }
                Err(e) => {
                    tracing::warn!(server = %descriptor.id, error = %e, "connection creation failed");
                    this.grant_slots(&mut guard);
                    Err(e)
                }
            };

            if let Err(Ok(conn)) = tx.send(outcome) {
                // Caller went away mid-creation; the connection goes back into rotation
                this.release_locked(&mut guard, &conn);
            }
        });

        rx.await.unwrap_or_else(|_| {
            Err(GatewayError::Spawn(
                server_id,
                "connection task aborted".to_string(),
            ))
        })
    }

    /// Invoke the factory, bounded by the acquire timeout.
    async fn establish(
        &self,
        descriptor: &ServerDescriptor,
    ) -> crate::Result<factory::TransportHandle> {
        let timeout = self.config.acquire_timeout();
        match tokio::time::timeout(timeout, self.factory.connect(descriptor)).await {
            Ok(Ok(transport)) => Ok(transport),
            Ok(Err(GatewayError::Spawn(id, msg))) => Err(GatewayError::Spawn(id, msg)),
            Ok(Err(other)) => Err(GatewayError::Spawn(descriptor.id.clone(), other.to_string())),
            Err(_) => Err(GatewayError::Spawn(
                descriptor.id.clone(),
                format!("connection attempt timed out after {}ms", timeout.as_millis()),
            )),
        }
    }

    /// Wait for a grant, the deadline, or a drain.
    async fn wait(
        self: &Arc<Self>,
        pool: &Arc<Mutex<ServerPool>>,
        descriptor: &ServerDescriptor,
        waiter_id: u64,
        rx: oneshot::Receiver<Grant>,
    ) -> crate::Result<Connection> {
        let timeout = self.config.acquire_timeout();
        let server_id = descriptor.id.as_str();
        let mut pending = PendingGrant {
            pool: Arc::clone(self),
            server: Arc::clone(pool),
            rx,
        };

        let grant = match tokio::time::timeout(timeout, &mut pending.rx).await {
            Ok(Ok(grant)) => grant,
            // Pool was torn down without answering
            Ok(Err(_)) => return Err(GatewayError::Drained(server_id.to_string())),
            Err(_elapsed) => {
                let mut guard = pool.lock().await;
                let before = guard.waiters.len();
                guard.waiters.retain(|w| w.id != waiter_id);
                if guard.waiters.len() < before {
                    tracing::debug!(server = %server_id, "acquire deadline elapsed");
                    return Err(GatewayError::Timeout(server_id.to_string(), timeout));
                }
                drop(guard);
                // Already dequeued: a grant was sent under the lock and is waiting in rx
                match pending.rx.try_recv() {
                    Ok(grant) => grant,
                    Err(_) => return Err(GatewayError::Timeout(server_id.to_string(), timeout)),
                }
            }
        };

        match grant {
            Grant::Connection(conn) => Ok(conn),
            Grant::Slot => self.create(pool, descriptor).await,
            Grant::Drained => Err(GatewayError::Drained(server_id.to_string())),
        }
    }

    fn release_locked(&self, guard: &mut ServerPool, conn: &Connection) {
        let connection_id = conn.id();
        let Some(idx) = guard.position(connection_id) else {
            return;
        };
        let pooled = &guard.connections[idx];
        // A stale handle from an earlier checkout must not release the current one
        if pooled.status != ConnectionStatus::Active || pooled.use_count != conn.use_count() {
            return;
        }

        while let Some(waiter) = guard.waiters.pop_front() {
            let conn = guard.connections[idx].checkout();
            match waiter.tx.send(Grant::Connection(conn)) {
                Ok(()) => {
                    tracing::trace!(
                        server = %guard.server_id,
                        connection = connection_id,
                        "connection handed to waiter"
                    );
                    self.emit_released(&guard.connections[idx]);
                    return;
                }
                Err(_) => {
                    // Waiter abandoned its acquire; undo the checkout bump
                    guard.connections[idx].use_count -= 1;
                }
            }
        }

        let pooled = &mut guard.connections[idx];
        pooled.status = ConnectionStatus::Idle;
        pooled.last_used_at = Instant::now();
        self.emit_released(pooled);
        guard.quiesced.notify_waiters();
    }

    /// Put back a grant whose waiter went away before reading it.
    fn reclaim(&self, guard: &mut ServerPool, grant: Grant) {
        match grant {
            Grant::Connection(conn) => {
                tracing::debug!(
                    server = %guard.server_id,
                    connection = conn.id(),
                    "reclaiming connection from abandoned acquire"
                );
                self.release_locked(guard, &conn);
            }
            Grant::Slot => {
                guard.creating = guard.creating.saturating_sub(1);
                self.grant_slots(guard);
            }
            Grant::Drained => {}
        }
    }

    /// Give freed creation slots to the oldest waiters.
    fn grant_slots(&self, guard: &mut ServerPool) {
        while guard.has_capacity() {
            let Some(waiter) = guard.waiters.pop_front() else {
                break;
            };
            guard.creating += 1;
            if waiter.tx.send(Grant::Slot).is_err() {
                guard.creating -= 1;
            }
        }
    }

    fn emit_released(&self, pooled: &PooledConnection) {
        self.events.emit(GatewayEvent::ConnectionReleased {
            server_id: pooled.server_id.clone(),
            connection_id: pooled.id,
        });
    }

    fn emit_disposed(&self, pooled: &PooledConnection, reason: Option<String>) {
        tracing::debug!(
            server = %pooled.server_id,
            connection = pooled.id,
            uses = pooled.use_count,
            age_ms = pooled.created_at.elapsed().as_millis() as u64,
            reason = reason.as_deref().unwrap_or("disposed"),
            "connection disposed"
        );
        self.events.emit(GatewayEvent::ConnectionDisposed {
            server_id: pooled.server_id.clone(),
            connection_id: pooled.id,
            reason,
        });
    }
}
