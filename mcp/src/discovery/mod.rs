//! Tool discovery across backends.

mod engine;
mod types;

pub use engine::{
    resolve_in, BackendDiscovery, BackendHealth, BackendOutcome, DiscoveryEngine, DiscoveryReport,
    DiscoverySnapshot, DiscoveryStats, ReferenceResolution, ResolveOptions,
};
pub use types::{
    full_hash, structure_hash, DiscoveredTool, NameRef, QualifiedToolName, ToolReference,
    MIN_HASH_PREFIX_LEN, TOOL_ID_LEN,
};
