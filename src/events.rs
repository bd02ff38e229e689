//! Lifecycle and usage notifications for an external observability consumer.
//!
//! Events are fire-and-forget: the sink pushes into a bounded queue with
//! `try_send` and drops the event when the queue is full, so a slow subscriber
//! never stalls the supervisor or the pool.

use serde::Serialize;
use tokio::sync::mpsc;

/// A single lifecycle or usage notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GatewayEvent {
    ServerStarted {
        server_id: String,
        pid: Option<u32>,
    },
    ServerError {
        server_id: String,
        error: String,
    },
    ServerExit {
        server_id: String,
        code: Option<i32>,
        signal: Option<i32>,
    },
    ConnectionReleased {
        server_id: String,
        connection_id: u64,
    },
    ConnectionDisposed {
        server_id: String,
        connection_id: u64,
        reason: Option<String>,
    },
    PoolBelowMinimum {
        server_id: String,
        current: usize,
        minimum: usize,
    },
}

impl GatewayEvent {
    pub fn server_id(&self) -> &str {
        match self {
            Self::ServerStarted { server_id, .. }
            | Self::ServerError { server_id, .. }
            | Self::ServerExit { server_id, .. }
            | Self::ConnectionReleased { server_id, .. }
            | Self::ConnectionDisposed { server_id, .. }
            | Self::PoolBelowMinimum { server_id, .. } => server_id,
        }
    }
}

/// Sending side of the observability channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Option<mpsc::Sender<GatewayEvent>>,
}

impl EventSink {
    /// Create a sink and the receiver the subscriber drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<GatewayEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that discards every event.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Publish an event without waiting.
    pub fn emit(&self, event: GatewayEvent) {
        tracing::debug!(server = %event.server_id(), ?event, "gateway event");
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                tracing::debug!(
                    server = %event.server_id(),
                    "event queue full, dropping notification"
                );
            }
            // Subscriber went away, nothing left to notify
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}
