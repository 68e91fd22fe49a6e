//! Typed cache notifications.

use std::fmt;

use serde::Serialize;

use super::store::CacheKey;

/// Why an entry left the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EvictionReason {
    /// Read or swept at or after its expiry time
    TtlExpired,
    /// Global entry count or memory ceiling exceeded
    Lru,
    /// Per-namespace entry limit exceeded
    Capacity,
    /// A watched source file changed
    SourceChanged,
    /// Replaced wholesale by a newer generation of the same namespace
    Superseded,
    Manual,
    Cleared,
}

impl fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EvictionReason::TtlExpired => "ttl-expired",
            EvictionReason::Lru => "lru",
            EvictionReason::Capacity => "capacity",
            EvictionReason::SourceChanged => "source-changed",
            EvictionReason::Superseded => "superseded",
            EvictionReason::Manual => "manual",
            EvictionReason::Cleared => "cleared",
        })
    }
}

/// Published after the corresponding mutation has been applied.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    Inserted { key: CacheKey, size_bytes: usize },
    Hit { key: CacheKey },
    Miss { key: CacheKey },
    Evicted { key: CacheKey, reason: EvictionReason },
    MemoryPressure { used_bytes: usize, limit_bytes: usize },
}

impl CacheEvent {
    pub fn key(&self) -> Option<&CacheKey> {
        match self {
            CacheEvent::Inserted { key, .. }
            | CacheEvent::Hit { key }
            | CacheEvent::Miss { key }
            | CacheEvent::Evicted { key, .. } => Some(key),
            CacheEvent::MemoryPressure { .. } => None,
        }
    }
}
