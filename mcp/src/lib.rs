//! MCP tool gateway.
//!
//! Aggregates tools from many Model Context Protocol backends, exposes a
//! curated toolset, and routes calls to the owning backend.
//!
//! ## Modules
//!
//! - [`cache`]: TTL + LRU cache bounded by entry count and memory
//! - [`core`]: configuration, backend connections, metrics
//! - [`discovery`]: tool discovery, structure hashes, tool references
//! - [`toolset`]: toolset specifications and conflict resolution
//! - [`router`]: reference to backend routing
//! - [`persona`]: persona loading, archives and activation
//! - [`gateway`]: the facade tying these together

pub mod cache;
pub mod core;
pub mod discovery;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod persona;
pub mod router;
pub mod toolset;

pub use cache::{CacheEvent, CacheKey, CacheLimits, CacheStatistics, EvictionReason, TtlCache};
pub use core::{
    BackendConfig, BackendConnection, BackendConnector, BackendStatus, BackendTransport,
    CacheConfig, DiscoveryConfig, GatewayConfig, GatewayMetrics, PersonaSettings, RoutingConfig,
    StaticConnector, ToolDescriptor, ToolOutput,
};
pub use discovery::{
    DiscoveredTool, DiscoveryEngine, DiscoveryReport, QualifiedToolName, ToolReference,
};
pub use error::{
    GatewayError, GatewayResult, PersonaError, PersonaErrorKind, ReferenceError, ResolutionError,
    RoutingError, ValidationLayer,
};
pub use gateway::{Gateway, GatewayStats, ToolCallOutcome};
pub use logging::{init_logging, LoggingConfig};
pub use persona::{
    ActivationOptions, ActivePersonaState, PersonaArchive, PersonaEvent, PersonaManager,
    PersonaState,
};
pub use router::{route, RouteTarget};
pub use toolset::{
    ConflictStrategy, ResolutionOutcome, ResolvedTool, ResolvedToolset, ToolsetSpecification,
};
