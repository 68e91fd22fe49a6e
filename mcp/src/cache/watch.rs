//! Filesystem-change invalidation.
//!
//! Watcher callbacks run on notify's own thread and only enqueue an
//! [`Invalidation`]. A single consumer task applies them through the cache's
//! normal locking, so watch events never race foreground reads and writes.

use std::{
    fmt,
    path::{Path, PathBuf},
};

use notify::{Event, EventKind, RecursiveMode, Watcher};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    events::EvictionReason,
    store::{CacheKey, CacheWeight, TtlCache},
};

/// Request to drop one entry because its source changed.
///
/// With a `generation`, only the entry inserted at that generation is
/// dropped; a newer entry under the same key was loaded after the change
/// and stays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invalidation {
    pub key: CacheKey,
    pub path: PathBuf,
    pub generation: Option<u64>,
}

impl Invalidation {
    pub fn new(key: CacheKey, path: impl Into<PathBuf>) -> Self {
        Self {
            key,
            path: path.into(),
            generation: None,
        }
    }

    #[must_use]
    pub fn for_generation(mut self, generation: u64) -> Self {
        self.generation = Some(generation);
        self
    }
}

/// Non-fatal watch setup failure. The entry stays cached without
/// invalidation-on-change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchDiagnostic {
    pub key: CacheKey,
    pub path: PathBuf,
    pub message: String,
}

impl fmt::Display for WatchDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cannot watch {} for {}: {}",
            self.path.display(),
            self.key,
            self.message
        )
    }
}

fn is_modification(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

impl<V> TtlCache<V>
where
    V: Clone + CacheWeight + Send + Sync + 'static,
{
    /// Watch `path` and evict `key` with reason `source-changed` when it is
    /// modified. The watch lives as long as the entry does.
    pub fn watch_source(&self, key: &CacheKey, path: &Path) -> Result<(), WatchDiagnostic> {
        let diagnostic = |message: String| WatchDiagnostic {
            key: key.clone(),
            path: path.to_path_buf(),
            message,
        };

        if !self.has(key) {
            return Err(diagnostic("entry is not cached".to_string()));
        }
        let Some(generation) = self.metadata(key).map(|m| m.generation) else {
            return Err(diagnostic("entry is not cached".to_string()));
        };

        let tx = self.inner.invalidation_tx.clone();
        let invalidation = Invalidation::new(key.clone(), path).for_generation(generation);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            if let Ok(event) = res {
                if is_modification(&event.kind) {
                    let _ = tx.send(invalidation.clone());
                }
            }
        })
        .map_err(|e| diagnostic(e.to_string()))?;

        watcher
            .watch(path, RecursiveMode::Recursive)
            .map_err(|e| diagnostic(e.to_string()))?;

        let mut state = self.inner.state.lock();
        match state.entries.peek_mut(key) {
            Some(entry) if entry.generation == generation => {
                entry.watchers.push(watcher);
                Ok(())
            }
            Some(_) => Err(diagnostic("entry replaced during watch setup".to_string())),
            None => Err(diagnostic("entry evicted during watch setup".to_string())),
        }
    }

    /// Like [`watch_source`](Self::watch_source) but logs the diagnostic
    /// instead of returning it.
    pub fn watch_source_or_warn(&self, key: &CacheKey, path: &Path) -> bool {
        match self.watch_source(key, path) {
            Ok(()) => true,
            Err(diagnostic) => {
                warn!(
                    cache = %self.inner.label,
                    "{}; continuing without invalidation", diagnostic
                );
                false
            }
        }
    }

    /// Sender for enqueueing invalidations from outside a watcher.
    pub fn invalidation_sender(&self) -> mpsc::UnboundedSender<Invalidation> {
        self.inner.invalidation_tx.clone()
    }

    /// Apply one invalidation. Returns whether an entry was removed.
    pub fn apply_invalidation(&self, invalidation: &Invalidation) -> bool {
        let mut events = Vec::new();
        let removed = {
            let mut state = self.inner.state.lock();
            let current = state.entries.peek(&invalidation.key).map(|e| e.generation);
            match (current, invalidation.generation) {
                (None, _) => false,
                (Some(current), Some(observed)) if current != observed => {
                    debug!(
                        key = %invalidation.key,
                        current,
                        observed,
                        "Entry reloaded after the change, invalidation skipped"
                    );
                    false
                }
                _ => state.evict(&invalidation.key, EvictionReason::SourceChanged, &mut events),
            }
        };
        self.publish(events);
        if removed {
            debug!(
                key = %invalidation.key,
                path = %invalidation.path.display(),
                "Source changed, entry invalidated"
            );
        }
        removed
    }

    /// Start the single invalidation consumer. Returns `None` if it was
    /// already started.
    pub fn spawn_invalidation_consumer(&self, token: CancellationToken) -> Option<JoinHandle<()>> {
        let mut rx = self.inner.invalidation_rx.lock().take()?;
        let weak = self.downgrade();

        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Invalidation consumer shutting down");
                        break;
                    }
                    received = rx.recv() => {
                        let Some(invalidation) = received else { break };
                        let Some(inner) = weak.upgrade() else { break };
                        TtlCache::from_inner(inner).apply_invalidation(&invalidation);
                    }
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cache::{CacheEvent, CacheLimits};

    fn cache() -> TtlCache<String> {
        TtlCache::new("watch-test", CacheLimits::default())
    }

    #[test]
    fn test_watch_missing_path_is_diagnostic() {
        let cache = cache();
        let key = CacheKey::new("personas", "dev");
        cache.put(key.clone(), "dev".to_string());

        let missing = std::env::temp_dir().join("toolgate-definitely-missing-dir/persona.yaml");
        let err = cache.watch_source(&key, &missing).unwrap_err();
        assert_eq!(err.key, key);
        assert!(cache.has(&key), "entry survives watch failure");
        assert!(!cache.watch_source_or_warn(&key, &missing));
    }

    #[test]
    fn test_watch_uncached_key_is_diagnostic() {
        let cache = cache();
        let dir = tempfile::tempdir().unwrap();
        let key = CacheKey::new("personas", "ghost");
        assert!(cache.watch_source(&key, dir.path()).is_err());
    }

    #[test]
    fn test_watch_marks_entry_watched() {
        let cache = cache();
        let dir = tempfile::tempdir().unwrap();
        let key = CacheKey::new("personas", "dev");
        cache.put(key.clone(), "dev".to_string());

        cache.watch_source(&key, dir.path()).unwrap();
        assert!(cache.metadata(&key).unwrap().watched);
    }

    #[tokio::test]
    async fn test_consumer_applies_invalidations() {
        let cache = cache();
        let key = CacheKey::new("personas", "dev");
        cache.put(key.clone(), "dev".to_string());
        let mut events = cache.subscribe();

        let token = CancellationToken::new();
        let handle = cache.spawn_invalidation_consumer(token.clone()).unwrap();
        assert!(cache.spawn_invalidation_consumer(token.clone()).is_none());

        cache
            .invalidation_sender()
            .send(Invalidation::new(key.clone(), "/tmp/dev/persona.yaml"))
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            CacheEvent::Evicted {
                key: key.clone(),
                reason: EvictionReason::SourceChanged
            }
        );
        assert!(!cache.has(&key));

        token.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn test_invalidation_skips_reloaded_entry() {
        let cache = cache();
        let key = CacheKey::new("personas", "dev");
        cache.put(key.clone(), "v1".to_string());
        let observed = cache.metadata(&key).unwrap().generation;

        cache.put(key.clone(), "v2".to_string());
        let stale = Invalidation::new(key.clone(), "/tmp/dev").for_generation(observed);
        assert!(!cache.apply_invalidation(&stale));
        assert_eq!(cache.get(&key).as_deref(), Some("v2"));

        let current = cache.metadata(&key).unwrap().generation;
        assert!(current > observed);
        let fresh = Invalidation::new(key.clone(), "/tmp/dev").for_generation(current);
        assert!(cache.apply_invalidation(&fresh));
        assert!(!cache.has(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_invalidation_does_not_evict_newer_put() {
        let cache = cache();
        let key = CacheKey::new("personas", "dev");
        cache.put(key.clone(), "v1".to_string());
        let observed = cache.metadata(&key).unwrap().generation;

        let token = CancellationToken::new();
        let handle = cache.spawn_invalidation_consumer(token.clone()).unwrap();

        // the change is queued before the reload but consumed after it
        cache
            .invalidation_sender()
            .send(Invalidation::new(key.clone(), "/tmp/dev").for_generation(observed))
            .unwrap();
        cache.put(key.clone(), "v2".to_string());
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(cache.get(&key).as_deref(), Some("v2"));
        assert_eq!(
            cache.statistics().evictions_for(EvictionReason::SourceChanged),
            0
        );

        token.cancel();
        handle.await.unwrap();
    }
}
