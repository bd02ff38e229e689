//! Switchyard: local gateway in front of a fleet of MCP tool servers.
//! Supervises process-backed servers, pools connections per server, and
//! routes each request to one server by rule, availability and load.

pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod pool;
pub mod router;
pub mod supervisor;

pub use config::{
    parse_env_ref, resolve_env_vars, GatewayConfig, HealthCheckConfig, PoolConfig, RuleConfig,
    ServerDescriptor, SupervisorConfig, TransportKind,
};
pub use error::{GatewayError, Result};
pub use events::{EventSink, GatewayEvent};
pub use gateway::Gateway;
pub use pool::connection::{Connection, ConnectionStatus, PoolStats};
pub use pool::factory::{ConnectionFactory, McpConnectionFactory, TransportHandle};
pub use pool::ConnectionPool;
pub use router::rules::{RuleCondition, RuleSummary};
pub use router::strategy::Strategy;
pub use router::{Availability, Router, RoutingDecision};
pub use supervisor::process::StdioChannel;
pub use supervisor::{ProcessStatus, ServerStatus, Supervisor};
