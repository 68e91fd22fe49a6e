//! TTL + LRU cache with per-namespace and global bounds.
//!
//! Entries live in one access-ordered [`LruCache`]; reads promote, they never
//! extend expiry. All mutation happens under a single mutex, and events are
//! published on a broadcast channel only after the lock is released.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{Arc, Weak},
    time::Duration,
};

use lru::LruCache;
use notify::RecommendedWatcher;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    events::{CacheEvent, EvictionReason},
    watch::Invalidation,
};
use crate::core::config::CacheConfig;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Estimated heap footprint of a cached value.
pub trait CacheWeight {
    fn estimated_size(&self) -> usize;
}

impl CacheWeight for String {
    fn estimated_size(&self) -> usize {
        std::mem::size_of::<String>() + self.len()
    }
}

impl CacheWeight for serde_json::Value {
    fn estimated_size(&self) -> usize {
        // serialized length is a close enough proxy
        serde_json::to_string(self).map(|s| s.len()).unwrap_or(0)
    }
}

/// Cache key: a namespace (one per backend) plus a name within it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CacheKey {
    pub namespace: String,
    pub name: String,
}

impl CacheKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone)]
pub struct CacheLimits {
    pub ttl: Duration,
    pub max_entries_per_namespace: usize,
    pub max_entries: usize,
    pub max_memory_bytes: usize,
    pub memory_warning_ratio: f64,
}

impl From<&CacheConfig> for CacheLimits {
    fn from(config: &CacheConfig) -> Self {
        Self {
            ttl: config.ttl(),
            max_entries_per_namespace: config.max_entries_per_namespace,
            max_entries: config.max_entries,
            max_memory_bytes: config.max_memory_bytes,
            memory_warning_ratio: config.memory_warning_ratio,
        }
    }
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self::from(&CacheConfig::default())
    }
}

impl CacheLimits {
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    fn memory_warning_threshold(&self) -> usize {
        (self.max_memory_bytes as f64 * self.memory_warning_ratio) as usize
    }
}

pub(super) struct CacheEntry<V> {
    value: V,
    created_at: Instant,
    last_accessed: Instant,
    expires_at: Instant,
    access_count: u64,
    size_bytes: usize,
    pub(super) generation: u64,
    pub(super) watchers: Vec<RecommendedWatcher>,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Read-only view of an entry's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryMetadata {
    pub created_at: Instant,
    pub last_accessed: Instant,
    pub expires_at: Instant,
    pub access_count: u64,
    pub size_bytes: usize,
    /// Increases on every insert, so a replaced entry never shares it.
    pub generation: u64,
    pub watched: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStatistics {
    pub entries: usize,
    pub namespaces: usize,
    pub total_bytes: usize,
    pub max_memory_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub evictions: BTreeMap<EvictionReason, u64>,
}

impl CacheStatistics {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }

    pub fn evictions_for(&self, reason: EvictionReason) -> u64 {
        self.evictions.get(&reason).copied().unwrap_or(0)
    }

    pub fn total_evictions(&self) -> u64 {
        self.evictions.values().sum()
    }
}

pub(super) struct CacheState<V> {
    pub(super) entries: LruCache<CacheKey, CacheEntry<V>>,
    namespace_counts: HashMap<String, usize>,
    total_bytes: usize,
    hits: u64,
    misses: u64,
    inserts: u64,
    evictions: BTreeMap<EvictionReason, u64>,
    memory_warned: bool,
    last_generation: u64,
}

impl<V> CacheState<V> {
    fn new() -> Self {
        Self {
            entries: LruCache::unbounded(),
            namespace_counts: HashMap::new(),
            total_bytes: 0,
            hits: 0,
            misses: 0,
            inserts: 0,
            evictions: BTreeMap::new(),
            memory_warned: false,
            last_generation: 0,
        }
    }

    fn forget(&mut self, key: &CacheKey, entry: &CacheEntry<V>) {
        self.total_bytes = self.total_bytes.saturating_sub(entry.size_bytes);
        if let Some(count) = self.namespace_counts.get_mut(&key.namespace) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.namespace_counts.remove(&key.namespace);
            }
        }
    }

    fn record_eviction(
        &mut self,
        key: CacheKey,
        reason: EvictionReason,
        events: &mut Vec<CacheEvent>,
    ) {
        *self.evictions.entry(reason).or_insert(0) += 1;
        debug!(key = %key, reason = %reason, "Cache entry evicted");
        events.push(CacheEvent::Evicted { key, reason });
    }

    pub(super) fn evict(
        &mut self,
        key: &CacheKey,
        reason: EvictionReason,
        events: &mut Vec<CacheEvent>,
    ) -> bool {
        match self.entries.pop(key) {
            Some(entry) => {
                self.forget(key, &entry);
                self.record_eviction(key.clone(), reason, events);
                true
            }
            None => false,
        }
    }

    fn evict_lru(&mut self, reason: EvictionReason, events: &mut Vec<CacheEvent>) -> bool {
        match self.entries.pop_lru() {
            Some((key, entry)) => {
                self.forget(&key, &entry);
                self.record_eviction(key, reason, events);
                true
            }
            None => false,
        }
    }

    /// Least recently used key of one namespace.
    fn lru_in_namespace(&self, namespace: &str) -> Option<CacheKey> {
        self.entries
            .iter()
            .rev()
            .find(|(key, _)| key.namespace == namespace)
            .map(|(key, _)| key.clone())
    }

    fn namespace_len(&self, namespace: &str) -> usize {
        self.namespace_counts.get(namespace).copied().unwrap_or(0)
    }

    fn keys_in_namespace(&self, namespace: &str) -> Vec<CacheKey> {
        self.entries
            .iter()
            .filter(|(key, _)| key.namespace == namespace)
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn insert(
        &mut self,
        key: CacheKey,
        value: V,
        size_bytes: usize,
        ttl: Duration,
        limits: &CacheLimits,
        events: &mut Vec<CacheEvent>,
    ) where
        V: CacheWeight,
    {
        let now = Instant::now();

        if let Some(previous) = self.entries.pop(&key) {
            self.forget(&key, &previous);
        }

        while self.namespace_len(&key.namespace) >= limits.max_entries_per_namespace {
            match self.lru_in_namespace(&key.namespace) {
                Some(victim) => {
                    self.evict(&victim, EvictionReason::Capacity, events);
                }
                None => break,
            }
        }

        self.last_generation += 1;
        self.entries.put(
            key.clone(),
            CacheEntry {
                value,
                created_at: now,
                last_accessed: now,
                expires_at: now + ttl,
                access_count: 0,
                size_bytes,
                generation: self.last_generation,
                watchers: Vec::new(),
            },
        );
        *self.namespace_counts.entry(key.namespace.clone()).or_insert(0) += 1;
        self.total_bytes += size_bytes;
        self.inserts += 1;
        events.push(CacheEvent::Inserted { key, size_bytes });

        while self.entries.len() > limits.max_entries {
            if !self.evict_lru(EvictionReason::Lru, events) {
                break;
            }
        }

        // the newest entry is most recently used and is never the victim here
        while self.total_bytes > limits.max_memory_bytes && self.entries.len() > 1 {
            if !self.evict_lru(EvictionReason::Lru, events) {
                break;
            }
        }
    }

    fn check_memory_pressure(
        &mut self,
        label: &str,
        limits: &CacheLimits,
        events: &mut Vec<CacheEvent>,
    ) {
        if self.total_bytes >= limits.memory_warning_threshold() {
            if !self.memory_warned {
                self.memory_warned = true;
                warn!(
                    cache = %label,
                    used_bytes = self.total_bytes,
                    limit_bytes = limits.max_memory_bytes,
                    "Cache memory usage above warning threshold"
                );
                events.push(CacheEvent::MemoryPressure {
                    used_bytes: self.total_bytes,
                    limit_bytes: limits.max_memory_bytes,
                });
            }
        } else {
            self.memory_warned = false;
        }
    }
}

pub(super) struct CacheInner<V> {
    pub(super) label: String,
    pub(super) limits: CacheLimits,
    pub(super) state: Mutex<CacheState<V>>,
    events: broadcast::Sender<CacheEvent>,
    pub(super) invalidation_tx: mpsc::UnboundedSender<Invalidation>,
    pub(super) invalidation_rx: Mutex<Option<mpsc::UnboundedReceiver<Invalidation>>>,
}

/// Thread-safe TTL cache. Cloning shares the underlying store.
pub struct TtlCache<V> {
    pub(super) inner: Arc<CacheInner<V>>,
}

impl<V> Clone for TtlCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> TtlCache<V>
where
    V: Clone + CacheWeight + Send + 'static,
{
    pub fn new(label: impl Into<String>, limits: CacheLimits) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (invalidation_tx, invalidation_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(CacheInner {
                label: label.into(),
                limits,
                state: Mutex::new(CacheState::new()),
                events,
                invalidation_tx,
                invalidation_rx: Mutex::new(Some(invalidation_rx)),
            }),
        }
    }

    pub(super) fn from_inner(inner: Arc<CacheInner<V>>) -> Self {
        Self { inner }
    }

    pub(super) fn downgrade(&self) -> Weak<CacheInner<V>> {
        Arc::downgrade(&self.inner)
    }

    pub fn limits(&self) -> &CacheLimits {
        &self.inner.limits
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.inner.events.subscribe()
    }

    pub(super) fn publish(&self, events: Vec<CacheEvent>) {
        for event in events {
            // no subscribers is fine
            let _ = self.inner.events.send(event);
        }
    }

    /// Insert with the default TTL.
    pub fn put(&self, key: CacheKey, value: V) {
        self.put_with_ttl(key, value, self.inner.limits.ttl);
    }

    pub fn put_with_ttl(&self, key: CacheKey, value: V, ttl: Duration) {
        let size_bytes = value.estimated_size();
        let mut events = Vec::new();
        {
            let mut state = self.inner.state.lock();
            state.insert(key, value, size_bytes, ttl, &self.inner.limits, &mut events);
            state.check_memory_pressure(&self.inner.label, &self.inner.limits, &mut events);
        }
        self.publish(events);
    }

    /// Lookup. An expired entry is evicted and reported as a miss.
    pub fn get(&self, key: &CacheKey) -> Option<V> {
        let now = Instant::now();
        let mut events = Vec::new();
        let result = {
            let mut state = self.inner.state.lock();
            let expired = state.entries.peek(key).map(|entry| entry.is_expired(now));
            match expired {
                Some(false) => {
                    let value = state.entries.get_mut(key).map(|entry| {
                        entry.last_accessed = now;
                        entry.access_count += 1;
                        entry.value.clone()
                    });
                    state.hits += 1;
                    events.push(CacheEvent::Hit { key: key.clone() });
                    value
                }
                Some(true) => {
                    state.evict(key, EvictionReason::TtlExpired, &mut events);
                    state.misses += 1;
                    events.push(CacheEvent::Miss { key: key.clone() });
                    None
                }
                None => {
                    state.misses += 1;
                    events.push(CacheEvent::Miss { key: key.clone() });
                    None
                }
            }
        };
        self.publish(events);
        result
    }

    /// Presence check without promotion. Expired entries are evicted.
    pub fn has(&self, key: &CacheKey) -> bool {
        let now = Instant::now();
        let mut events = Vec::new();
        let present = {
            let mut state = self.inner.state.lock();
            match state.entries.peek(key).map(|entry| entry.is_expired(now)) {
                Some(false) => true,
                Some(true) => {
                    state.evict(key, EvictionReason::TtlExpired, &mut events);
                    false
                }
                None => false,
            }
        };
        self.publish(events);
        present
    }

    pub fn delete(&self, key: &CacheKey) -> bool {
        self.invalidate(key, EvictionReason::Manual)
    }

    pub fn invalidate(&self, key: &CacheKey, reason: EvictionReason) -> bool {
        let mut events = Vec::new();
        let removed = self.inner.state.lock().evict(key, reason, &mut events);
        self.publish(events);
        removed
    }

    pub fn invalidate_namespace(&self, namespace: &str, reason: EvictionReason) -> usize {
        let mut events = Vec::new();
        let removed = {
            let mut state = self.inner.state.lock();
            let keys = state.keys_in_namespace(namespace);
            keys.iter()
                .filter(|key| state.evict(key, reason, &mut events))
                .count()
        };
        self.publish(events);
        removed
    }

    /// Replace every entry of `namespace` with `items` in one critical section.
    pub fn replace_namespace(&self, namespace: &str, items: Vec<(String, V)>) {
        let ttl = self.inner.limits.ttl;
        let mut events = Vec::new();
        {
            let mut state = self.inner.state.lock();
            for key in state.keys_in_namespace(namespace) {
                state.evict(&key, EvictionReason::Superseded, &mut events);
            }
            if items.len() > self.inner.limits.max_entries_per_namespace {
                warn!(
                    cache = %self.inner.label,
                    namespace = %namespace,
                    count = items.len(),
                    limit = self.inner.limits.max_entries_per_namespace,
                    "Namespace exceeds capacity, oldest entries will be evicted"
                );
            }
            for (name, value) in items {
                let size_bytes = value.estimated_size();
                state.insert(
                    CacheKey::new(namespace, name),
                    value,
                    size_bytes,
                    ttl,
                    &self.inner.limits,
                    &mut events,
                );
            }
            state.check_memory_pressure(&self.inner.label, &self.inner.limits, &mut events);
        }
        self.publish(events);
    }

    /// Remove everything. Returns the number of entries dropped.
    pub fn clear(&self) -> usize {
        let mut events = Vec::new();
        let removed = {
            let mut state = self.inner.state.lock();
            let mut removed = 0;
            while state.evict_lru(EvictionReason::Cleared, &mut events) {
                removed += 1;
            }
            state.memory_warned = false;
            removed
        };
        self.publish(events);
        removed
    }

    /// Set a new expiry of `now + ttl` and mark the entry accessed. The value
    /// is untouched. Returns false when the entry is absent or already expired.
    pub fn update_ttl(&self, key: &CacheKey, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut events = Vec::new();
        let updated = {
            let mut state = self.inner.state.lock();
            match state.entries.peek(key).map(|entry| entry.is_expired(now)) {
                Some(false) => {
                    if let Some(entry) = state.entries.get_mut(key) {
                        entry.expires_at = now + ttl;
                        entry.last_accessed = now;
                    }
                    true
                }
                Some(true) => {
                    state.evict(key, EvictionReason::TtlExpired, &mut events);
                    false
                }
                None => false,
            }
        };
        self.publish(events);
        updated
    }

    /// Evict every expired entry. Returns the number evicted.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut events = Vec::new();
        let removed = {
            let mut state = self.inner.state.lock();
            let expired: Vec<CacheKey> = state
                .entries
                .iter()
                .filter(|(_, entry)| entry.is_expired(now))
                .map(|(key, _)| key.clone())
                .collect();
            for key in &expired {
                state.evict(key, EvictionReason::TtlExpired, &mut events);
            }
            expired.len()
        };
        if removed > 0 {
            debug!(cache = %self.inner.label, removed, "Swept expired entries");
        }
        self.publish(events);
        removed
    }

    /// Peek at an entry's bookkeeping without promoting it.
    pub fn metadata(&self, key: &CacheKey) -> Option<EntryMetadata> {
        let state = self.inner.state.lock();
        state.entries.peek(key).map(|entry| EntryMetadata {
            created_at: entry.created_at,
            last_accessed: entry.last_accessed,
            expires_at: entry.expires_at,
            access_count: entry.access_count,
            size_bytes: entry.size_bytes,
            generation: entry.generation,
            watched: !entry.watchers.is_empty(),
        })
    }

    /// Live entries of one namespace sorted by name. Does not promote or
    /// count as a lookup.
    pub fn snapshot_namespace(&self, namespace: &str) -> Vec<(String, V)> {
        let now = Instant::now();
        let state = self.inner.state.lock();
        let mut items: Vec<(String, V)> = state
            .entries
            .iter()
            .filter(|(key, entry)| key.namespace == namespace && !entry.is_expired(now))
            .map(|(key, entry)| (key.name.clone(), entry.value.clone()))
            .collect();
        items.sort_by(|a, b| a.0.cmp(&b.0));
        items
    }

    pub fn namespaces(&self) -> Vec<String> {
        let state = self.inner.state.lock();
        let mut namespaces: Vec<String> = state.namespace_counts.keys().cloned().collect();
        namespaces.sort();
        namespaces
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn statistics(&self) -> CacheStatistics {
        let state = self.inner.state.lock();
        CacheStatistics {
            entries: state.entries.len(),
            namespaces: state.namespace_counts.len(),
            total_bytes: state.total_bytes,
            max_memory_bytes: self.inner.limits.max_memory_bytes,
            hits: state.hits,
            misses: state.misses,
            inserts: state.inserts,
            evictions: state.evictions.clone(),
        }
    }

    /// Periodically evict expired entries until `token` is cancelled or the
    /// cache is dropped.
    pub fn spawn_sweeper(&self, interval: Duration, token: CancellationToken) -> JoinHandle<()>
    where
        V: Sync,
    {
        let weak = self.downgrade();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Cache sweeper shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        TtlCache::from_inner(inner).sweep_expired();
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Blob(usize);

    impl CacheWeight for Blob {
        fn estimated_size(&self) -> usize {
            self.0
        }
    }

    fn limits() -> CacheLimits {
        CacheLimits {
            ttl: Duration::from_secs(60),
            max_entries_per_namespace: 100,
            max_entries: 100,
            max_memory_bytes: 1_000_000,
            memory_warning_ratio: 0.8,
        }
    }

    fn key(ns: &str, name: &str) -> CacheKey {
        CacheKey::new(ns, name)
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_before_and_after_expiry() {
        let cache = TtlCache::new("test", limits().with_ttl(Duration::from_secs(10)));
        cache.put(key("git", "status"), Blob(1));

        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(cache.get(&key("git", "status")), Some(Blob(1)));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.get(&key("git", "status")), None);
        assert!(cache.is_empty());

        let stats = cache.statistics();
        assert_eq!(stats.evictions_for(EvictionReason::TtlExpired), 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reads_do_not_extend_ttl() {
        let cache = TtlCache::new("test", limits().with_ttl(Duration::from_secs(10)));
        cache.put(key("git", "log"), Blob(1));

        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(2)).await;
            let _ = cache.get(&key("git", "log"));
        }
        assert!(!cache.has(&key("git", "log")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_ttl_extends_expiry() {
        let cache = TtlCache::new("test", limits().with_ttl(Duration::from_secs(10)));
        cache.put(key("git", "log"), Blob(1));

        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(cache.update_ttl(&key("git", "log"), Duration::from_secs(10)));

        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(cache.get(&key("git", "log")), Some(Blob(1)));

        let meta = cache.metadata(&key("git", "log")).unwrap();
        assert_eq!(meta.access_count, 1);
        assert!(!cache.update_ttl(&key("git", "missing"), Duration::from_secs(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lru_evicts_least_recently_accessed() {
        let mut l = limits();
        l.max_entries = 3;
        let cache = TtlCache::new("test", l);

        cache.put(key("a", "1"), Blob(1));
        tokio::time::advance(Duration::from_millis(1)).await;
        cache.put(key("a", "2"), Blob(1));
        tokio::time::advance(Duration::from_millis(1)).await;
        cache.put(key("a", "3"), Blob(1));

        // oldest created, but most recently accessed
        assert!(cache.get(&key("a", "1")).is_some());
        cache.put(key("a", "4"), Blob(1));

        assert!(cache.has(&key("a", "1")));
        assert!(!cache.has(&key("a", "2")));
        assert!(cache.has(&key("a", "3")));
        assert!(cache.has(&key("a", "4")));
        assert_eq!(cache.statistics().evictions_for(EvictionReason::Lru), 1);
    }

    #[test]
    fn test_namespace_capacity_only_evicts_within_namespace() {
        let mut l = limits();
        l.max_entries_per_namespace = 2;
        let cache = TtlCache::new("test", l);

        cache.put(key("git", "status"), Blob(1));
        cache.put(key("docker", "ps"), Blob(1));
        cache.put(key("git", "log"), Blob(1));
        cache.put(key("git", "diff"), Blob(1));

        assert!(!cache.has(&key("git", "status")));
        assert!(cache.has(&key("docker", "ps")));
        assert!(cache.has(&key("git", "log")));
        assert!(cache.has(&key("git", "diff")));
        assert_eq!(cache.statistics().evictions_for(EvictionReason::Capacity), 1);
    }

    #[test]
    fn test_memory_ceiling_evicts_before_entry_limit() {
        let mut l = limits();
        l.max_memory_bytes = 100;
        let cache = TtlCache::new("test", l);

        cache.put(key("a", "1"), Blob(40));
        cache.put(key("a", "2"), Blob(40));
        cache.put(key("a", "3"), Blob(40));

        assert!(!cache.has(&key("a", "1")));
        let stats = cache.statistics();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.total_bytes, 80);
    }

    #[test]
    fn test_memory_pressure_warns_once() {
        let mut l = limits();
        l.max_memory_bytes = 100;
        let cache = TtlCache::new("test", l);
        let mut rx = cache.subscribe();

        cache.put(key("a", "1"), Blob(85));
        cache.put(key("a", "2"), Blob(5));

        let pressure: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter(|e| matches!(e, CacheEvent::MemoryPressure { .. }))
            .collect();
        assert_eq!(pressure.len(), 1);
    }

    #[test]
    fn test_events_follow_mutations() {
        let cache = TtlCache::new("test", limits());
        let mut rx = cache.subscribe();

        cache.put(key("git", "status"), Blob(3));
        let _ = cache.get(&key("git", "status"));
        cache.delete(&key("git", "status"));

        assert_eq!(
            rx.try_recv().unwrap(),
            CacheEvent::Inserted {
                key: key("git", "status"),
                size_bytes: 3
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            CacheEvent::Hit {
                key: key("git", "status")
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            CacheEvent::Evicted {
                key: key("git", "status"),
                reason: EvictionReason::Manual
            }
        );
    }

    #[test]
    fn test_replace_namespace_is_wholesale() {
        let cache = TtlCache::new("test", limits());
        cache.put(key("git", "status"), Blob(1));
        cache.put(key("git", "log"), Blob(1));
        cache.put(key("docker", "ps"), Blob(1));

        cache.replace_namespace("git", vec![("blame".to_string(), Blob(2))]);

        let git: Vec<String> = cache
            .snapshot_namespace("git")
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(git, vec!["blame".to_string()]);
        assert!(cache.has(&key("docker", "ps")));
        assert_eq!(
            cache.statistics().evictions_for(EvictionReason::Superseded),
            2
        );
    }

    #[test]
    fn test_invalidate_namespace_and_clear() {
        let cache = TtlCache::new("test", limits());
        cache.put(key("git", "status"), Blob(1));
        cache.put(key("git", "log"), Blob(1));
        cache.put(key("docker", "ps"), Blob(1));

        assert_eq!(
            cache.invalidate_namespace("git", EvictionReason::Manual),
            2
        );
        assert_eq!(cache.namespaces(), vec!["docker".to_string()]);
        assert_eq!(cache.clear(), 1);
        assert!(cache.is_empty());
        assert_eq!(cache.statistics().total_bytes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_expired() {
        let cache = TtlCache::new("test", limits());
        cache.put_with_ttl(key("a", "short"), Blob(1), Duration::from_secs(1));
        cache.put_with_ttl(key("a", "long"), Blob(1), Duration::from_secs(100));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.sweep_expired(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweeper() {
        let cache = TtlCache::new("test", limits());
        cache.put_with_ttl(key("a", "short"), Blob(1), Duration::from_secs(1));

        let token = CancellationToken::new();
        let handle = cache.spawn_sweeper(Duration::from_secs(5), token.clone());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(cache.len(), 0);

        token.cancel();
        handle.await.unwrap();
    }
}
