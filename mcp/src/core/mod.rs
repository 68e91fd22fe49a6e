//! Core backend infrastructure: configuration, connections, metrics.

pub mod config;
pub mod connection;
pub mod metrics;
pub mod pool;
pub mod proxy;

pub use config::{
    BackendConfig, BackendTransport, CacheConfig, DiscoveryConfig, GatewayConfig, PersonaSettings,
    ProxyConfig, RoutingConfig,
};
pub use connection::{
    BackendConnection, BackendConnector, BackendStatus, RmcpConnection, RmcpConnector,
    StaticConnector, ToolDescriptor, ToolOutput,
};
pub use metrics::{CallOutcomeKind, GatewayMetrics, LatencySnapshot, MetricsSnapshot};
pub use pool::{BackendEntry, BackendIdentity, ConnectionSet};
