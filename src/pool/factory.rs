//! Connection factories: how the pool obtains a new transport for a server.
//!
//! The pool treats the returned `TransportHandle` as opaque. The bundled
//! `McpConnectionFactory` speaks MCP over Streamable HTTP to network servers
//! and attaches to the supervisor's stdio channel for process servers.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use rmcp::service::RunningService;
use rmcp::transport::StreamableHttpClientTransport;
use rmcp::{Peer, RoleClient, ServiceExt};
use tokio_util::sync::CancellationToken;

use crate::config::{ServerDescriptor, TransportKind};
use crate::error::GatewayError;
use crate::supervisor::process::StdioChannel;
use crate::supervisor::Supervisor;

/// Default MCP handshake timeout for network servers.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Creates new connections for the pool.
pub trait ConnectionFactory: Send + Sync {
    fn connect<'a>(
        &'a self,
        descriptor: &'a ServerDescriptor,
    ) -> BoxFuture<'a, crate::Result<TransportHandle>>;
}

/// An established channel to one tool server instance.
#[derive(Clone)]
pub enum TransportHandle {
    /// MCP client session to a network server.
    Mcp(Arc<RunningService<RoleClient, ()>>),
    /// Line channel onto a supervised process.
    Stdio(StdioChannel),
    /// Anything an embedder's own factory produces.
    Custom(Arc<dyn Any + Send + Sync>),
}

impl fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mcp(_) => f.write_str("TransportHandle::Mcp"),
            Self::Stdio(channel) => f
                .debug_tuple("TransportHandle::Stdio")
                .field(&channel.server_id())
                .finish(),
            Self::Custom(_) => f.write_str("TransportHandle::Custom"),
        }
    }
}

impl TransportHandle {
    /// The MCP peer, for network connections.
    pub fn mcp_peer(&self) -> Option<&Peer<RoleClient>> {
        match self {
            Self::Mcp(running) => Some(running.peer()),
            _ => None,
        }
    }

    pub fn stdio(&self) -> Option<&StdioChannel> {
        match self {
            Self::Stdio(channel) => Some(channel),
            _ => None,
        }
    }

    /// Downcast a custom handle to its concrete type.
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        match self {
            Self::Custom(inner) => Arc::clone(inner).downcast::<T>().ok(),
            _ => None,
        }
    }
}

/// Factory for MCP tool servers managed by a `Supervisor`.
pub struct McpConnectionFactory {
    supervisor: Arc<Supervisor>,
    handshake_timeout: Duration,
    cancel: CancellationToken,
}

impl McpConnectionFactory {
    pub fn new(supervisor: Arc<Supervisor>, cancel: CancellationToken) -> Self {
        Self {
            supervisor,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            cancel,
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Connect to a remote Streamable HTTP MCP server and perform the handshake.
    async fn connect_network(&self, descriptor: &ServerDescriptor) -> crate::Result<TransportHandle> {
        let id = &descriptor.id;
        let url = descriptor.url.as_ref().ok_or_else(|| {
            GatewayError::Configuration(
                id.clone(),
                "network transport requires 'url' field".to_string(),
            )
        })?;

        let transport = StreamableHttpClientTransport::from_uri(url.as_str());

        let handshake_result = tokio::time::timeout(
            self.handshake_timeout,
            ().serve_with_ct(transport, self.cancel.child_token()),
        )
        .await;

        match handshake_result {
            Err(_elapsed) => Err(GatewayError::Spawn(
                id.clone(),
                format!(
                    "MCP handshake timed out after {}s",
                    self.handshake_timeout.as_secs()
                ),
            )),
            Ok(Err(e)) => Err(GatewayError::Spawn(id.clone(), e.to_string())),
            Ok(Ok(running)) => {
                tracing::debug!(server = %id, url = %url, "MCP session established");
                Ok(TransportHandle::Mcp(Arc::new(running)))
            }
        }
    }

    async fn connect_process(&self, descriptor: &ServerDescriptor) -> crate::Result<TransportHandle> {
        self.supervisor
            .stdio_channel(&descriptor.id)
            .await
            .map(TransportHandle::Stdio)
            .ok_or_else(|| {
                GatewayError::Spawn(descriptor.id.clone(), "process is not running".to_string())
            })
    }
}

impl ConnectionFactory for McpConnectionFactory {
    fn connect<'a>(
        &'a self,
        descriptor: &'a ServerDescriptor,
    ) -> BoxFuture<'a, crate::Result<TransportHandle>> {
        Box::pin(async move {
            match descriptor.transport {
                TransportKind::Network => self.connect_network(descriptor).await,
                TransportKind::Process => self.connect_process(descriptor).await,
            }
        })
    }
}
