//! Pooled connection records and the caller-facing connection handle.

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::pool::factory::TransportHandle;

/// Lifecycle state of a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Idle,
    Active,
    Error,
    Disposed,
}

/// A connection checked out of the pool.
///
/// Hand it back with `release` when done, or `dispose` it if it is broken.
#[derive(Debug, Clone)]
pub struct Connection {
    id: u64,
    server_id: String,
    use_count: u64,
    transport: TransportHandle,
}

impl Connection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// How many times this connection had been checked out, this checkout included.
    pub fn use_count(&self) -> u64 {
        self.use_count
    }

    pub fn transport(&self) -> &TransportHandle {
        &self.transport
    }
}

/// The pool's own record of a connection. Mutated only by the pool.
#[derive(Debug)]
pub(crate) struct PooledConnection {
    pub id: u64,
    pub server_id: String,
    pub status: ConnectionStatus,
    pub created_at: Instant,
    pub last_used_at: Instant,
    pub use_count: u64,
    pub last_error: Option<String>,
    pub transport: TransportHandle,
}

impl PooledConnection {
    /// A freshly created connection, already checked out once.
    pub fn new(id: u64, server_id: &str, transport: TransportHandle) -> Self {
        let now = Instant::now();
        Self {
            id,
            server_id: server_id.to_string(),
            status: ConnectionStatus::Active,
            created_at: now,
            last_used_at: now,
            use_count: 1,
            last_error: None,
            transport,
        }
    }

    /// Mark active and bump usage, returning the caller handle.
    pub fn checkout(&mut self) -> Connection {
        self.status = ConnectionStatus::Active;
        self.use_count += 1;
        self.last_used_at = Instant::now();
        self.handle()
    }

    pub fn handle(&self) -> Connection {
        Connection {
            id: self.id,
            server_id: self.server_id.clone(),
            use_count: self.use_count,
            transport: self.transport.clone(),
        }
    }

    /// Too old or idle for too long.
    pub fn is_expired(&self, now: Instant, max_age: Duration, max_idle: Duration) -> bool {
        now.duration_since(self.created_at) > max_age
            || now.duration_since(self.last_used_at) > max_idle
    }
}

/// Point-in-time statistics for one server's pool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStats {
    pub server_id: String,
    pub total: usize,
    pub active: usize,
    pub idle: usize,
    pub error: usize,
    pub waiting: usize,
    pub max_connections: usize,
    /// `active / max_connections`
    pub utilization: f64,
}

impl PoolStats {
    /// Stats for a server that has no pool yet.
    pub fn empty(server_id: &str, max_connections: usize) -> Self {
        Self {
            server_id: server_id.to_string(),
            total: 0,
            active: 0,
            idle: 0,
            error: 0,
            waiting: 0,
            max_connections,
            utilization: 0.0,
        }
    }
}
