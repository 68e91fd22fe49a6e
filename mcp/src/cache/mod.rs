//! Bounded TTL cache shared by tool discovery and the persona registry.

mod events;
mod store;
mod watch;

pub use events::{CacheEvent, EvictionReason};
pub use store::{
    CacheKey, CacheLimits, CacheStatistics, CacheWeight, EntryMetadata, TtlCache,
};
pub use watch::{Invalidation, WatchDiagnostic};
