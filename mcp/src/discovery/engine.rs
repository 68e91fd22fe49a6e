//! Discovery engine: queries backends, normalizes tools into the cache and
//! tracks per-backend health.
//!
//! A pass is split into [`DiscoveryEngine::probe`], which only talks to
//! backends, and a commit step that writes the cache. Persona activation
//! probes a candidate connection set and commits only after validation.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::types::{DiscoveredTool, NameRef, ToolReference};
use crate::{
    cache::{CacheKey, EvictionReason, TtlCache},
    core::{
        config::DiscoveryConfig,
        connection::{BackendConnection, BackendStatus},
        pool::ConnectionSet,
    },
    error::{GatewayError, ReferenceError},
};

/// Result of querying one backend.
#[derive(Debug, Clone)]
pub enum BackendOutcome {
    Discovered {
        tools: Vec<DiscoveredTool>,
        /// Descriptors dropped as malformed
        skipped: Vec<String>,
    },
    Failed {
        error: String,
        status: BackendStatus,
    },
}

#[derive(Debug, Clone)]
pub struct BackendDiscovery {
    pub server: String,
    pub latency_ms: u64,
    pub outcome: BackendOutcome,
}

impl BackendDiscovery {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, BackendOutcome::Discovered { .. })
    }

    pub fn tool_count(&self) -> usize {
        match &self.outcome {
            BackendOutcome::Discovered { tools, .. } => tools.len(),
            BackendOutcome::Failed { .. } => 0,
        }
    }
}

/// Per-backend results of one pass against one connection set. Nothing is
/// written to the cache until the report is committed.
#[derive(Debug, Clone)]
pub struct DiscoveryReport {
    pub connections: Arc<ConnectionSet>,
    pub backends: Vec<BackendDiscovery>,
    pub completed_at: DateTime<Utc>,
}

impl DiscoveryReport {
    pub fn backend(&self, server: &str) -> Option<&BackendDiscovery> {
        self.backends.iter().find(|b| b.server == server)
    }

    pub fn failed(&self) -> impl Iterator<Item = &BackendDiscovery> {
        self.backends.iter().filter(|b| !b.is_success())
    }

    pub fn total_tools(&self) -> usize {
        self.backends.iter().map(BackendDiscovery::tool_count).sum()
    }

    /// Tools this report would publish, sorted by backend then tool name.
    pub fn tools(&self) -> Vec<DiscoveredTool> {
        let mut tools: Vec<DiscoveredTool> = self
            .backends
            .iter()
            .filter_map(|b| match &b.outcome {
                BackendOutcome::Discovered { tools, .. } => Some(tools.iter().cloned()),
                BackendOutcome::Failed { .. } => None,
            })
            .flatten()
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendHealth {
    pub status: BackendStatus,
    pub last_error: Option<String>,
    pub last_latency_ms: Option<u64>,
    pub consecutive_failures: u32,
    pub tool_count: usize,
    pub last_checked: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryStats {
    pub total_backends: usize,
    pub connected_backends: usize,
    pub total_tools: usize,
    pub cache_hit_rate: f64,
    pub average_latency_ms: f64,
    pub last_discovery: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ResolveOptions {
    /// Accept a reference whose name and hash disagree, preferring the name
    pub allow_stale_refs: bool,
}

#[derive(Debug, Clone)]
pub struct ReferenceResolution {
    pub tool: DiscoveredTool,
    pub stale: bool,
    pub warnings: Vec<String>,
}

/// Captured discovery view, restorable after a later activation.
#[derive(Debug, Clone)]
pub struct DiscoverySnapshot {
    connections: Arc<ConnectionSet>,
    tools: Vec<(String, Vec<(String, DiscoveredTool)>)>,
    health: Vec<(String, BackendHealth)>,
}

impl DiscoverySnapshot {
    pub fn connections(&self) -> &Arc<ConnectionSet> {
        &self.connections
    }
}

pub struct DiscoveryEngine {
    cache: TtlCache<DiscoveredTool>,
    connections: ArcSwap<ConnectionSet>,
    health: DashMap<String, BackendHealth>,
    config: DiscoveryConfig,
    /// Serializes commits so a stale refresh cannot overwrite an activation
    commit_lock: Mutex<()>,
    latency_total_ms: AtomicU64,
    latency_samples: AtomicU64,
    last_discovery: Mutex<Option<DateTime<Utc>>>,
    /// Bumped after every commit or restore
    generation: watch::Sender<u64>,
}

impl DiscoveryEngine {
    pub fn new(
        cache: TtlCache<DiscoveredTool>,
        connections: ConnectionSet,
        config: DiscoveryConfig,
    ) -> Self {
        Self {
            cache,
            connections: ArcSwap::from_pointee(connections),
            health: DashMap::new(),
            config,
            commit_lock: Mutex::new(()),
            latency_total_ms: AtomicU64::new(0),
            latency_samples: AtomicU64::new(0),
            last_discovery: Mutex::new(None),
            generation: watch::Sender::new(0),
        }
    }

    /// Receiver that observes a new value after each committed pass.
    pub fn subscribe_commits(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    pub fn cache(&self) -> &TtlCache<DiscoveredTool> {
        &self.cache
    }

    pub fn connections(&self) -> Arc<ConnectionSet> {
        self.connections.load_full()
    }

    pub fn backend_health(&self, server: &str) -> Option<BackendHealth> {
        self.health.get(server).map(|h| h.clone())
    }

    pub fn all_health(&self) -> Vec<(String, BackendHealth)> {
        let mut all: Vec<_> = self
            .health
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Query every backend in `connections` concurrently. Each backend has
    /// its own timeout; one failure never affects the others.
    pub async fn probe(&self, connections: Arc<ConnectionSet>) -> DiscoveryReport {
        let queries = connections.iter().map(|entry| {
            let timeout = entry
                .config
                .discovery_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| self.config.timeout());
            Self::probe_backend(
                entry.config.name.clone(),
                Arc::clone(&entry.connection),
                timeout,
            )
        });
        let backends = join_all(queries).await;

        DiscoveryReport {
            connections,
            backends,
            completed_at: Utc::now(),
        }
    }

    async fn probe_backend(
        server: String,
        connection: Arc<dyn BackendConnection>,
        timeout: Duration,
    ) -> BackendDiscovery {
        let started = Instant::now();

        if connection.status() == BackendStatus::Disconnected {
            return BackendDiscovery {
                server: server.clone(),
                latency_ms: 0,
                outcome: BackendOutcome::Failed {
                    error: GatewayError::ServerDisconnected(server).to_string(),
                    status: BackendStatus::Disconnected,
                },
            };
        }

        let listed = match tokio::time::timeout(timeout, connection.list_tools()).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout {
                operation: format!("list tools on '{}'", server),
                timeout_ms: timeout.as_millis() as u64,
            }),
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        let outcome = match listed {
            Ok(descriptors) => {
                let now = Utc::now();
                let mut tools = Vec::with_capacity(descriptors.len());
                let mut skipped = Vec::new();
                let mut seen = HashSet::new();
                for descriptor in descriptors {
                    let name = descriptor.name.clone();
                    if !seen.insert(name.clone()) {
                        warn!(server = %server, tool = %name, "Duplicate tool descriptor skipped");
                        skipped.push(name);
                        continue;
                    }
                    match DiscoveredTool::from_descriptor(&server, descriptor, now) {
                        Ok(tool) => tools.push(tool),
                        Err(e) => {
                            warn!(server = %server, error = %e, "Skipping malformed tool descriptor");
                            skipped.push(name);
                        }
                    }
                }
                tools.sort_by(|a, b| a.name.cmp(&b.name));
                debug!(server = %server, tools = tools.len(), latency_ms, "Backend discovered");
                BackendOutcome::Discovered { tools, skipped }
            }
            Err(e) => {
                let status = if e.is_unreachable() {
                    BackendStatus::Disconnected
                } else {
                    BackendStatus::Degraded
                };
                warn!(server = %server, error = %e, status = %status, "Discovery failed");
                BackendOutcome::Failed {
                    error: e.to_string(),
                    status,
                }
            }
        };

        BackendDiscovery {
            server,
            latency_ms,
            outcome,
        }
    }

    /// Probe the current connection set and commit the results.
    pub async fn discover_all(&self) -> DiscoveryReport {
        let report = self.probe(self.connections()).await;
        if !self.commit(&report) {
            debug!("Connection set changed during discovery, results discarded");
        }
        report
    }

    /// Apply `report` if it was probed against the current connection set.
    pub fn commit(&self, report: &DiscoveryReport) -> bool {
        let _guard = self.commit_lock.lock();
        let current = self.connections.load();
        if !Arc::ptr_eq(&*current, &report.connections) {
            return false;
        }
        self.apply(report);
        true
    }

    /// Make `report.connections` the current set and apply `report`.
    pub fn commit_and_swap(&self, report: &DiscoveryReport) {
        let _guard = self.commit_lock.lock();
        self.connections.store(Arc::clone(&report.connections));
        self.apply(report);
    }

    fn apply(&self, report: &DiscoveryReport) {
        let current: HashSet<&str> = report.connections.names().collect();

        // backends that left the set lose their tools and health
        for namespace in self.cache.namespaces() {
            if !current.contains(namespace.as_str()) {
                self.cache
                    .invalidate_namespace(&namespace, EvictionReason::Manual);
            }
        }
        self.health.retain(|name, _| current.contains(name.as_str()));

        for backend in &report.backends {
            if !current.contains(backend.server.as_str()) {
                continue;
            }
            self.apply_backend(backend, report.completed_at);
        }

        *self.last_discovery.lock() = Some(report.completed_at);
        self.generation.send_modify(|g| *g += 1);
        info!(
            backends = report.backends.len(),
            failed = report.failed().count(),
            tools = report.total_tools(),
            "Discovery pass committed"
        );
    }

    fn apply_backend(&self, backend: &BackendDiscovery, at: DateTime<Utc>) {
        let previous_failures = self
            .health
            .get(&backend.server)
            .map_or(0, |h| h.consecutive_failures);

        match &backend.outcome {
            BackendOutcome::Discovered { tools, .. } => {
                let previous: HashMap<String, DiscoveredTool> = self
                    .cache
                    .snapshot_namespace(&backend.server)
                    .into_iter()
                    .collect();

                let items = tools
                    .iter()
                    .map(|tool| {
                        let mut tool = tool.clone();
                        if let Some(old) = previous.get(tool.local_name()) {
                            tool.discovered_at = old.discovered_at;
                            if old.full_hash == tool.full_hash {
                                tool.updated_at = old.updated_at;
                            } else {
                                debug!(tool = %tool.name, "Tool definition changed");
                            }
                        }
                        (tool.local_name().to_string(), tool)
                    })
                    .collect();
                self.cache.replace_namespace(&backend.server, items);

                self.latency_total_ms
                    .fetch_add(backend.latency_ms, Ordering::Relaxed);
                self.latency_samples.fetch_add(1, Ordering::Relaxed);

                self.health.insert(
                    backend.server.clone(),
                    BackendHealth {
                        status: BackendStatus::Connected,
                        last_error: None,
                        last_latency_ms: Some(backend.latency_ms),
                        consecutive_failures: 0,
                        tool_count: tools.len(),
                        last_checked: at,
                    },
                );
            }
            BackendOutcome::Failed { error, status } => {
                let tool_count = if *status == BackendStatus::Disconnected {
                    self.cache
                        .invalidate_namespace(&backend.server, EvictionReason::Manual);
                    0
                } else {
                    // degraded backends keep serving their last known tools
                    self.cache.snapshot_namespace(&backend.server).len()
                };

                self.health.insert(
                    backend.server.clone(),
                    BackendHealth {
                        status: *status,
                        last_error: Some(error.clone()),
                        last_latency_ms: Some(backend.latency_ms),
                        consecutive_failures: previous_failures.saturating_add(1),
                        tool_count,
                        last_checked: at,
                    },
                );
            }
        }
    }

    fn status_of(&self, server: &str) -> BackendStatus {
        self.health
            .get(server)
            .map_or(BackendStatus::Connected, |h| h.status)
    }

    /// Every cached tool of the current backends, sorted by backend then
    /// name. Tools of disconnected backends are only included when
    /// `include_disabled` is set.
    pub fn get_all_tools(&self, include_disabled: bool) -> Vec<DiscoveredTool> {
        let connections = self.connections();
        let mut tools = Vec::new();
        for server in connections.names() {
            let status = self.status_of(server);
            if status == BackendStatus::Disconnected && !include_disabled {
                continue;
            }
            tools.extend(
                self.cache
                    .snapshot_namespace(server)
                    .into_iter()
                    .map(|(_, mut tool)| {
                        tool.status = status;
                        tool
                    }),
            );
        }
        tools
    }

    /// Resolve and fetch one tool through the cache.
    pub fn get_tool(&self, reference: &str) -> Result<DiscoveredTool, ReferenceError> {
        let resolution = self.resolve_tool_reference(reference, ResolveOptions::default())?;
        let key = CacheKey::new(resolution.tool.server(), resolution.tool.local_name());
        self.cache
            .get(&key)
            .ok_or_else(|| ReferenceError::NotFound(reference.to_string()))
    }

    pub fn resolve_tool_reference(
        &self,
        reference: &str,
        options: ResolveOptions,
    ) -> Result<ReferenceResolution, ReferenceError> {
        let parsed = ToolReference::parse(reference)?;
        resolve_in(&parsed, &self.get_all_tools(false), options)
    }

    pub fn stats(&self) -> DiscoveryStats {
        let connections = self.connections();
        let connected_backends = connections
            .names()
            .filter(|name| {
                self.health
                    .get(*name)
                    .is_some_and(|h| h.status == BackendStatus::Connected)
            })
            .count();
        let samples = self.latency_samples.load(Ordering::Relaxed);
        let total = self.latency_total_ms.load(Ordering::Relaxed);

        DiscoveryStats {
            total_backends: connections.len(),
            connected_backends,
            total_tools: self.get_all_tools(true).len(),
            cache_hit_rate: self.cache.statistics().hit_rate(),
            average_latency_ms: if samples == 0 {
                0.0
            } else {
                total as f64 / samples as f64
            },
            last_discovery: *self.last_discovery.lock(),
        }
    }

    pub fn snapshot(&self) -> DiscoverySnapshot {
        let _guard = self.commit_lock.lock();
        let connections = self.connections();
        let tools = connections
            .names()
            .map(|server| (server.to_string(), self.cache.snapshot_namespace(server)))
            .collect();
        DiscoverySnapshot {
            connections,
            tools,
            health: self.all_health(),
        }
    }

    /// Reinstate a captured view. Restored tools get a fresh TTL.
    pub fn restore(&self, snapshot: &DiscoverySnapshot) {
        let _guard = self.commit_lock.lock();
        self.connections.store(Arc::clone(&snapshot.connections));

        let keep: HashSet<&str> = snapshot.tools.iter().map(|(s, _)| s.as_str()).collect();
        for namespace in self.cache.namespaces() {
            if !keep.contains(namespace.as_str()) {
                self.cache
                    .invalidate_namespace(&namespace, EvictionReason::Manual);
            }
        }
        for (server, tools) in &snapshot.tools {
            self.cache.replace_namespace(server, tools.clone());
        }

        self.health.clear();
        for (server, health) in &snapshot.health {
            self.health.insert(server.clone(), health.clone());
        }
        self.generation.send_modify(|g| *g += 1);
        info!(backends = snapshot.tools.len(), "Discovery view restored");
    }

    /// Rediscover on a fixed interval until `token` is cancelled.
    pub fn spawn_background_refresh(
        self: Arc<Self>,
        refresh_interval: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(refresh_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Background refresh shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        let report = self.discover_all().await;
                        debug!(
                            tools = report.total_tools(),
                            failed = report.failed().count(),
                            "Background refresh completed"
                        );
                    }
                }
            }
        })
    }
}

/// Resolve `reference` against `tools`.
pub fn resolve_in(
    reference: &ToolReference,
    tools: &[DiscoveredTool],
    options: ResolveOptions,
) -> Result<ReferenceResolution, ReferenceError> {
    let raw = reference.as_str().to_string();

    let by_hash: Option<Vec<&DiscoveredTool>> = reference
        .hash()
        .map(|hash| tools.iter().filter(|t| t.matches_hash(hash)).collect());

    let by_name: Option<Vec<&DiscoveredTool>> = reference.name().map(|name| match name {
        NameRef::Qualified(qualified) => {
            let exact: Vec<_> = tools.iter().filter(|t| &t.name == qualified).collect();
            let server_known = tools.iter().any(|t| t.server() == qualified.server);
            if exact.is_empty() && !server_known {
                // `a.b` may be a bare tool name that contains a dot
                let bare = reference.name_text();
                tools.iter().filter(|t| t.local_name() == bare).collect()
            } else {
                exact
            }
        }
        NameRef::Bare(bare) => tools.iter().filter(|t| t.local_name() == bare).collect(),
    });

    let ok = |tool: &DiscoveredTool| ReferenceResolution {
        tool: tool.clone(),
        stale: false,
        warnings: Vec::new(),
    };
    let names = |candidates: &[&DiscoveredTool]| -> Vec<String> {
        candidates.iter().map(|t| t.name.to_string()).collect()
    };

    match (by_name, by_hash) {
        (Some(named), None) => match named.as_slice() {
            [] => Err(ReferenceError::NotFound(raw)),
            [one] => Ok(ok(one)),
            many => Err(ReferenceError::Ambiguous {
                reference: raw,
                candidates: names(many),
            }),
        },
        (None, Some(hashed)) => match hashed.as_slice() {
            [] => Err(ReferenceError::NotFound(raw)),
            [one] => Ok(ok(one)),
            many => Err(ReferenceError::Ambiguous {
                reference: raw,
                candidates: names(many),
            }),
        },
        (Some(named), Some(hashed)) => {
            let agreed: Vec<&DiscoveredTool> = named
                .iter()
                .filter(|t| hashed.iter().any(|h| h.name == t.name))
                .copied()
                .collect();
            match agreed.as_slice() {
                [one] => return Ok(ok(one)),
                [] => {}
                many => {
                    return Err(ReferenceError::Ambiguous {
                        reference: raw,
                        candidates: names(many),
                    })
                }
            }

            let mismatch = || ReferenceError::HashMismatch {
                reference: raw.clone(),
                by_name: named.first().map(|t| t.name.to_string()),
                by_hash: hashed.first().map(|t| t.name.to_string()),
            };

            if !options.allow_stale_refs {
                return Err(mismatch());
            }

            // stale refs follow the name when it is unambiguous, else the hash
            let chosen = match (named.as_slice(), hashed.as_slice()) {
                ([one], _) => *one,
                ([], [one]) => *one,
                ([], []) => return Err(ReferenceError::NotFound(raw.clone())),
                (many, _) if many.len() > 1 => {
                    return Err(ReferenceError::Ambiguous {
                        reference: raw.clone(),
                        candidates: names(many),
                    })
                }
                _ => return Err(mismatch()),
            };
            let warning = format!(
                "reference '{}' is stale: hash no longer matches, using '{}' (current id {})",
                raw,
                chosen.name,
                chosen.id()
            );
            warn!("{}", warning);
            Ok(ReferenceResolution {
                tool: chosen.clone(),
                stale: true,
                warnings: vec![warning],
            })
        }
        (None, None) => Err(ReferenceError::Malformed(raw)),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::{json, Map, Value};

    use super::*;
    use crate::{
        cache::CacheLimits,
        core::{
            config::BackendConfig,
            connection::{ToolDescriptor, ToolOutput},
            pool::BackendEntry,
        },
        error::GatewayResult,
    };

    #[derive(Clone, Copy)]
    enum Failure {
        Unreachable,
        Errored,
    }

    struct FakeBackend {
        name: String,
        tools: Mutex<Result<Vec<ToolDescriptor>, Failure>>,
        delay: Option<Duration>,
    }

    impl FakeBackend {
        fn new(name: &str, tools: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                tools: Mutex::new(Ok(tools.iter().map(|t| ToolDescriptor::new(*t)).collect())),
                delay: None,
            })
        }

        fn slow(name: &str, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                tools: Mutex::new(Ok(vec![ToolDescriptor::new("slow_tool")])),
                delay: Some(delay),
            })
        }

        fn set(&self, result: Result<Vec<ToolDescriptor>, Failure>) {
            *self.tools.lock() = result;
        }
    }

    #[async_trait]
    impl BackendConnection for FakeBackend {
        fn name(&self) -> &str {
            &self.name
        }

        async fn list_tools(&self) -> GatewayResult<Vec<ToolDescriptor>> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            match &*self.tools.lock() {
                Ok(tools) => Ok(tools.clone()),
                Err(Failure::Unreachable) => Err(GatewayError::Transport("refused".into())),
                Err(Failure::Errored) => Err(GatewayError::ToolExecution("list failed".into())),
            }
        }

        async fn invoke(
            &self,
            _tool_name: &str,
            _arguments: Option<Map<String, Value>>,
        ) -> GatewayResult<ToolOutput> {
            Ok(ToolOutput::success(json!({})))
        }

        fn status(&self) -> BackendStatus {
            BackendStatus::Connected
        }
    }

    fn set_of(backends: &[Arc<FakeBackend>]) -> ConnectionSet {
        ConnectionSet::from_entries(backends.iter().map(|b| {
            BackendEntry::new(
                BackendConfig::stdio(b.name.clone(), "unused", vec![]),
                Arc::clone(b) as Arc<dyn BackendConnection>,
            )
        }))
    }

    fn engine(backends: &[Arc<FakeBackend>]) -> DiscoveryEngine {
        DiscoveryEngine::new(
            TtlCache::new("tools", CacheLimits::default()),
            set_of(backends),
            DiscoveryConfig {
                timeout_ms: 500,
                ..DiscoveryConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn test_discover_all_and_sorted_view() {
        let git = FakeBackend::new("git", &["status", "log"]);
        let docker = FakeBackend::new("docker", &["ps", "status"]);
        let engine = engine(&[git, docker]);

        let report = engine.discover_all().await;
        assert_eq!(report.total_tools(), 4);

        let names: Vec<String> = engine
            .get_all_tools(false)
            .iter()
            .map(|t| t.name.to_string())
            .collect();
        assert_eq!(
            names,
            vec!["docker.ps", "docker.status", "git.log", "git.status"]
        );

        let stats = engine.stats();
        assert_eq!(stats.total_backends, 2);
        assert_eq!(stats.connected_backends, 2);
        assert_eq!(stats.total_tools, 4);
    }

    #[tokio::test]
    async fn test_one_backend_failure_does_not_block_others() {
        let git = FakeBackend::new("git", &["status"]);
        let broken = FakeBackend::new("broken", &[]);
        broken.set(Err(Failure::Unreachable));
        let engine = engine(&[git, broken]);

        let report = engine.discover_all().await;
        assert_eq!(report.failed().count(), 1);
        assert_eq!(engine.get_all_tools(false).len(), 1);
        let health = engine.backend_health("broken").unwrap();
        assert_eq!(health.status, BackendStatus::Disconnected);
        assert_eq!(health.consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_backend_times_out_alone() {
        let git = FakeBackend::new("git", &["status"]);
        let slow = FakeBackend::slow("slow", Duration::from_secs(10));
        let engine = engine(&[git, slow]);

        let report = engine.discover_all().await;
        let slow_result = report.backend("slow").unwrap();
        assert!(matches!(
            &slow_result.outcome,
            BackendOutcome::Failed { error, .. } if error.contains("Timed out")
        ));
        assert!(report.backend("git").unwrap().is_success());
    }

    #[tokio::test]
    async fn test_pass_replaces_backend_tools_wholesale() {
        let git = FakeBackend::new("git", &["status", "log"]);
        let engine = engine(&[Arc::clone(&git)]);
        engine.discover_all().await;

        git.set(Ok(vec![ToolDescriptor::new("blame")]));
        engine.discover_all().await;

        let names: Vec<String> = engine
            .get_all_tools(false)
            .iter()
            .map(|t| t.local_name().to_string())
            .collect();
        assert_eq!(names, vec!["blame"]);
    }

    #[tokio::test]
    async fn test_degraded_backend_keeps_tools_and_include_disabled() {
        let git = FakeBackend::new("git", &["status"]);
        let engine = engine(&[Arc::clone(&git)]);
        engine.discover_all().await;

        // a backend-reported failure is not an unreachable backend
        git.set(Err(Failure::Errored));
        let report = engine.probe(engine.connections()).await;
        assert!(!report.backend("git").unwrap().is_success());
        assert!(engine.commit(&report));

        let tools = engine.get_all_tools(false);
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].status, BackendStatus::Degraded);
    }

    #[tokio::test]
    async fn test_commit_rejects_report_for_replaced_set() {
        let git = FakeBackend::new("git", &["status"]);
        let engine = engine(&[Arc::clone(&git)]);

        let stale = engine.probe(engine.connections()).await;
        let fresh = engine
            .probe(Arc::new(set_of(&[FakeBackend::new("docker", &["ps"])])))
            .await;
        engine.commit_and_swap(&fresh);

        assert!(!engine.commit(&stale));
        let names: Vec<String> = engine
            .get_all_tools(true)
            .iter()
            .map(|t| t.name.to_string())
            .collect();
        assert_eq!(names, vec!["docker.ps"]);
    }

    #[tokio::test]
    async fn test_unchanged_tools_keep_discovery_time() {
        let git = FakeBackend::new("git", &["status"]);
        let engine = engine(&[git]);
        engine.discover_all().await;
        let first = engine.get_tool("git.status").unwrap();

        engine.discover_all().await;
        let second = engine.get_tool("git.status").unwrap();
        assert_eq!(first.discovered_at, second.discovered_at);
        assert_eq!(first.updated_at, second.updated_at);
        assert!(engine.stats().cache_hit_rate > 0.0);
    }

    #[tokio::test]
    async fn test_snapshot_restore() {
        let git = FakeBackend::new("git", &["status"]);
        let engine = engine(&[git]);
        engine.discover_all().await;
        let snapshot = engine.snapshot();

        let other = engine
            .probe(Arc::new(set_of(&[FakeBackend::new("docker", &["ps"])])))
            .await;
        engine.commit_and_swap(&other);
        assert!(engine.get_tool("git.status").is_err());

        engine.restore(&snapshot);
        assert!(engine.get_tool("git.status").is_ok());
        assert!(engine.get_tool("docker.ps").is_err());
    }

    fn tools_for_resolution() -> Vec<DiscoveredTool> {
        let now = Utc::now();
        let mk = |server: &str, name: &str, schema: Value| {
            DiscoveredTool::from_descriptor(
                server,
                ToolDescriptor::new(name).with_schema(schema),
                now,
            )
            .unwrap()
        };
        vec![
            mk("docker", "ps", json!({"type": "object"})),
            mk("docker", "status", json!({"type": "object", "x": 1})),
            mk("git", "status", json!({"type": "object"})),
            mk("git", "log", json!({"type": "object", "y": 2})),
        ]
    }

    fn resolve(raw: &str, allow_stale: bool) -> Result<ReferenceResolution, ReferenceError> {
        resolve_in(
            &ToolReference::parse(raw).unwrap(),
            &tools_for_resolution(),
            ResolveOptions {
                allow_stale_refs: allow_stale,
            },
        )
    }

    #[test]
    fn test_resolve_by_name_and_bare_name() {
        assert_eq!(
            resolve("git.status", false).unwrap().tool.name.to_string(),
            "git.status"
        );
        assert_eq!(resolve("ps", false).unwrap().tool.server(), "docker");
        assert!(matches!(
            resolve("status", false),
            Err(ReferenceError::Ambiguous { .. })
        ));
        assert!(matches!(
            resolve("git.push", false),
            Err(ReferenceError::NotFound(_))
        ));
    }

    #[test]
    fn test_resolve_by_hash() {
        let tools = tools_for_resolution();
        let log = tools.iter().find(|t| t.local_name() == "log").unwrap();

        let resolved = resolve(&format!("#{}", log.id()), false).unwrap();
        assert_eq!(resolved.tool.name, log.name);
        assert!(!resolved.stale);
    }

    #[test]
    fn test_name_and_hash_disagreement() {
        let tools = tools_for_resolution();
        let log = tools.iter().find(|t| t.local_name() == "log").unwrap();
        let raw = format!("git.status#{}", log.id());

        match resolve(&raw, false) {
            Err(ReferenceError::HashMismatch {
                by_name, by_hash, ..
            }) => {
                assert_eq!(by_name.as_deref(), Some("git.status"));
                assert_eq!(by_hash.as_deref(), Some("git.log"));
            }
            other => panic!("expected mismatch, got {other:?}"),
        }

        let stale = resolve(&raw, true).unwrap();
        assert!(stale.stale);
        assert_eq!(stale.tool.name.to_string(), "git.status");
        assert_eq!(stale.warnings.len(), 1);
    }

    #[test]
    fn test_hash_disambiguates_shared_structure() {
        // name and hash agree
        let tools = tools_for_resolution();
        let git_status = tools.iter().find(|t| t.name.to_string() == "git.status").unwrap();
        let resolved = resolve(&format!("git.status#{}", git_status.id()), false).unwrap();
        assert_eq!(resolved.tool.name, git_status.name);
    }
}
