//! Gateway facade: owns the cache, discovery engine and persona manager,
//! and turns routed calls into typed outcomes.

use std::{path::Path, sync::Arc, time::Instant};

use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    cache::{CacheLimits, CacheStatistics, TtlCache},
    core::{
        config::{BackendConfig, GatewayConfig},
        connection::{BackendConnector, RmcpConnector, ToolOutput},
        metrics::{CallOutcomeKind, GatewayMetrics, MetricsSnapshot},
        pool::{BackendEntry, ConnectionSet},
    },
    discovery::{BackendHealth, DiscoveredTool, DiscoveryEngine, DiscoveryReport, DiscoveryStats, QualifiedToolName},
    error::{GatewayError, GatewayResult, PersonaError, RoutingError},
    persona::{
        ActivationOptions, ActivePersonaState, PersonaEvent, PersonaManager, PersonaRegistry,
        PersonaState,
    },
    router,
    toolset::{ResolutionOutcome, ResolvedTool, ResolvedToolset, ToolsetSpecification},
};

const TOOL_CACHE_LABEL: &str = "tools";

/// Result of one tool call through the gateway.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ToolCallOutcome {
    Success {
        tool: QualifiedToolName,
        output: ToolOutput,
    },
    /// Not routable: no active toolset, not in it, or a stale hash
    NotFoundInToolset {
        reference: String,
        message: String,
    },
    AmbiguousReference {
        reference: String,
        candidates: Vec<String>,
    },
    /// Reached the backend, which reported a failure
    BackendError {
        tool: QualifiedToolName,
        message: String,
        output: Option<ToolOutput>,
    },
    BackendUnreachable {
        server: String,
        message: String,
    },
}

impl ToolCallOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ToolCallOutcome::Success { .. })
    }

    /// True when the call never reached a backend.
    pub fn is_routing_failure(&self) -> bool {
        matches!(
            self,
            ToolCallOutcome::NotFoundInToolset { .. } | ToolCallOutcome::AmbiguousReference { .. }
        )
    }

    fn from_routing(reference: &str, err: RoutingError) -> Self {
        match err {
            RoutingError::AmbiguousReference {
                reference,
                candidates,
            } => ToolCallOutcome::AmbiguousReference {
                reference,
                candidates,
            },
            RoutingError::BackendUnavailable(server) => ToolCallOutcome::BackendUnreachable {
                message: format!("server '{}' has no live connection", server),
                server,
            },
            other @ (RoutingError::NoActiveToolset
            | RoutingError::ToolNotInActiveToolset { .. }
            | RoutingError::StaleReference { .. }) => ToolCallOutcome::NotFoundInToolset {
                reference: reference.to_string(),
                message: other.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GatewayStats {
    pub discovery: DiscoveryStats,
    pub tool_cache: CacheStatistics,
    pub calls: MetricsSnapshot,
    pub persona: PersonaState,
    pub active_toolset: Option<String>,
    pub active_tools: usize,
    pub backends: Vec<(String, BackendHealth)>,
}

pub struct Gateway {
    config: GatewayConfig,
    cache: TtlCache<DiscoveredTool>,
    discovery: Arc<DiscoveryEngine>,
    personas: Arc<PersonaManager>,
    metrics: Arc<GatewayMetrics>,
    shutdown_token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Connect every configured backend concurrently. A required backend that
/// fails aborts startup; others are logged and left out.
async fn connect_all(
    servers: &[BackendConfig],
    connector: &dyn BackendConnector,
) -> GatewayResult<ConnectionSet> {
    let attempts = join_all(servers.iter().map(|config| async move {
        (config, connector.connect(config).await)
    }))
    .await;

    let mut set = ConnectionSet::new();
    for (config, result) in attempts {
        match result {
            Ok(connection) => {
                info!("Connected to MCP server '{}'", config.name);
                set.insert(BackendEntry::new(config.clone(), connection));
            }
            Err(e) if config.required => {
                return Err(GatewayError::ConnectionFailed(format!(
                    "required server '{}': {}",
                    config.name, e
                )));
            }
            Err(e) => {
                warn!(
                    "Failed to connect to optional server '{}': {}, continuing without it",
                    config.name, e
                );
            }
        }
    }
    Ok(set)
}

impl Gateway {
    /// Connect with the rmcp transports.
    pub async fn new(config: GatewayConfig) -> GatewayResult<Self> {
        let connector = Arc::new(RmcpConnector::new(config.proxy.clone()));
        Self::with_connector(config, connector).await
    }

    pub async fn with_connector(
        config: GatewayConfig,
        connector: Arc<dyn BackendConnector>,
    ) -> GatewayResult<Self> {
        config.validate()?;

        let connections = connect_all(&config.servers, connector.as_ref()).await?;
        let metrics = Arc::new(GatewayMetrics::new());
        let cache = TtlCache::new(TOOL_CACHE_LABEL, CacheLimits::from(&config.cache));
        let discovery = Arc::new(DiscoveryEngine::new(
            cache.clone(),
            connections,
            config.discovery.clone(),
        ));

        let report = discovery.discover_all().await;
        metrics.record_discovery(report.failed().count());

        let registry = Arc::new(PersonaRegistry::from_settings(
            &config.personas,
            &config.cache,
        ));
        let personas = Arc::new(PersonaManager::new(
            Arc::clone(&discovery),
            Arc::clone(&registry),
            connector,
            config.personas.clone(),
            Arc::clone(&metrics),
        ));

        let token = CancellationToken::new();
        let sweep = config.cache.sweep_interval();
        let mut tasks = vec![
            cache.spawn_sweeper(sweep, token.child_token()),
            registry.cache().spawn_sweeper(sweep, token.child_token()),
            Arc::clone(&personas).spawn_view_refresh(token.child_token()),
        ];
        tasks.extend(cache.spawn_invalidation_consumer(token.child_token()));
        tasks.extend(
            registry
                .cache()
                .spawn_invalidation_consumer(token.child_token()),
        );
        if config.discovery.enable_refresh {
            tasks.push(Arc::clone(&discovery).spawn_background_refresh(
                std::time::Duration::from_secs(config.discovery.refresh_interval),
                token.child_token(),
            ));
        }

        info!(
            backends = discovery.connections().len(),
            tools = report.total_tools(),
            "Gateway started"
        );

        Ok(Self {
            config,
            cache,
            discovery,
            personas,
            metrics,
            shutdown_token: token,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn discovery(&self) -> &Arc<DiscoveryEngine> {
        &self.discovery
    }

    pub fn personas(&self) -> &Arc<PersonaManager> {
        &self.personas
    }

    pub fn metrics(&self) -> &Arc<GatewayMetrics> {
        &self.metrics
    }

    pub fn tool_cache(&self) -> &TtlCache<DiscoveredTool> {
        &self.cache
    }

    /// Route `reference` through the active toolset and invoke it.
    pub async fn call_tool(
        &self,
        reference: &str,
        arguments: Option<Map<String, Value>>,
    ) -> ToolCallOutcome {
        let routed = match self.personas.view() {
            Some(view) => router::route(reference, &view.toolset, &view.connections),
            None => Err(RoutingError::NoActiveToolset),
        };
        let target = match routed {
            Ok(target) => target,
            Err(err) => {
                self.metrics.record_call_rejected();
                debug!(reference = %reference, error = %err, "Tool call not routable");
                return ToolCallOutcome::from_routing(reference, err);
            }
        };

        let tool = target.tool.reference.clone();
        let timeout = self.config.routing.call_timeout();
        self.metrics.record_call_start();
        let started = Instant::now();

        let result = tokio::time::timeout(
            timeout,
            target
                .connection
                .invoke(&target.tool.original_name, arguments),
        )
        .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let (outcome, kind) = match result {
            Err(_) => {
                let err = GatewayError::Timeout {
                    operation: format!("call {}", tool),
                    timeout_ms: self.config.routing.call_timeout_ms,
                };
                (
                    ToolCallOutcome::BackendUnreachable {
                        server: tool.server.clone(),
                        message: err.to_string(),
                    },
                    CallOutcomeKind::Unreachable,
                )
            }
            Ok(Err(err)) if err.is_unreachable() => (
                ToolCallOutcome::BackendUnreachable {
                    server: tool.server.clone(),
                    message: err.to_string(),
                },
                CallOutcomeKind::Unreachable,
            ),
            Ok(Err(err)) => (
                ToolCallOutcome::BackendError {
                    tool: tool.clone(),
                    message: err.to_string(),
                    output: None,
                },
                CallOutcomeKind::BackendError,
            ),
            Ok(Ok(output)) if output.is_error => (
                ToolCallOutcome::BackendError {
                    tool: tool.clone(),
                    message: format!("tool '{}' reported an error", tool),
                    output: Some(output),
                },
                CallOutcomeKind::BackendError,
            ),
            Ok(Ok(output)) => (
                ToolCallOutcome::Success {
                    tool: tool.clone(),
                    output,
                },
                CallOutcomeKind::Success,
            ),
        };

        self.metrics.record_call_end(&tool, kind, elapsed_ms);
        debug!(tool = %tool, elapsed_ms, success = outcome.is_success(), "Tool call finished");
        outcome
    }

    /// Tools of the active toolset, in resolution order.
    pub fn list_tools(&self) -> Vec<ResolvedTool> {
        self.personas
            .view()
            .map(|view| view.toolset.tools().to_vec())
            .unwrap_or_default()
    }

    pub fn active_toolset(&self) -> Option<Arc<ResolvedToolset>> {
        self.personas.view().map(|view| Arc::clone(&view.toolset))
    }

    pub async fn apply_toolset(
        &self,
        spec: ToolsetSpecification,
    ) -> GatewayResult<ResolutionOutcome> {
        self.personas.apply_toolset(spec).await
    }

    /// Load a toolset file and apply it. An empty server list falls back to
    /// every connected backend.
    pub async fn load_toolset(&self, path: &Path) -> GatewayResult<ResolutionOutcome> {
        let connections = self.discovery.connections();
        let spec = ToolsetSpecification::load_with_fallback(path, connections.names()).await?;
        self.apply_toolset(spec).await
    }

    pub async fn activate_persona(
        &self,
        name: &str,
        options: ActivationOptions,
    ) -> Result<ActivePersonaState, PersonaError> {
        self.personas.activate(name, options).await
    }

    pub async fn deactivate_persona(&self) -> Result<Option<String>, PersonaError> {
        self.personas.deactivate().await
    }

    pub async fn restore_previous_persona(
        &self,
    ) -> Result<Option<ActivePersonaState>, PersonaError> {
        self.personas.restore_previous().await
    }

    pub fn active_persona(&self) -> Option<ActivePersonaState> {
        self.personas.active()
    }

    pub fn persona_state(&self) -> PersonaState {
        self.personas.state()
    }

    pub fn subscribe_persona_events(&self) -> broadcast::Receiver<PersonaEvent> {
        self.personas.subscribe()
    }

    /// Rediscover now. The active toolset is re-resolved in the background.
    pub async fn refresh(&self) -> DiscoveryReport {
        let report = self.discovery.discover_all().await;
        self.metrics.record_discovery(report.failed().count());
        report
    }

    pub fn stats(&self) -> GatewayStats {
        let view = self.personas.view();
        GatewayStats {
            discovery: self.discovery.stats(),
            tool_cache: self.cache.statistics(),
            calls: self.metrics.snapshot(),
            persona: self.personas.state(),
            active_toolset: view.as_ref().map(|v| v.toolset.name().to_string()),
            active_tools: view.as_ref().map_or(0, |v| v.toolset.len()),
            backends: self.discovery.all_health(),
        }
    }

    /// Stop background tasks and close every backend connection.
    pub async fn shutdown(&self) {
        self.shutdown_token.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for result in join_all(tasks).await {
            if let Err(e) = result {
                warn!("Background task ended abnormally: {}", e);
            }
        }

        let base = self.discovery.connections();
        self.personas.shutdown().await;
        for entry in base.iter() {
            entry.connection.close().await;
        }
        info!("Gateway shut down");
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.shutdown_token.cancel();
    }
}
