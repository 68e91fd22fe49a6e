//! Persona activation state machine.
//!
//! The routable state is one [`ActiveView`] behind an `ArcSwapOption`:
//! the resolved toolset together with the connection set it routes to.
//! Activation validates and probes a candidate configuration without
//! touching shared state, then commits discovery and swaps the view in one
//! step. A failure at any point leaves the previous view in place.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use scopeguard::ScopeGuard;
use tokio::{
    sync::{broadcast, Mutex as AsyncMutex, MutexGuard},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    registry::PersonaRegistry,
    types::{
        ActivationMetadata, ActivationOptions, ActivationSource, ActivePersonaState,
        LoadedPersona, PersonaEvent, PersonaState, PersonaToolset,
    },
    validation::{self, BackendPlan},
};
use crate::{
    core::{
        config::PersonaSettings,
        connection::{BackendConnection, BackendConnector, BackendStatus},
        metrics::GatewayMetrics,
        pool::{BackendEntry, ConnectionSet},
    },
    discovery::{BackendOutcome, DiscoveredTool, DiscoveryEngine, DiscoveryReport, DiscoverySnapshot},
    error::{GatewayError, GatewayResult, PersonaError, PersonaErrorKind, ValidationLayer},
    toolset::{self, ResolutionOutcome, ResolvedToolset, ToolsetSpecification},
};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Everything a tool call needs, swapped as one unit.
#[derive(Debug, Clone)]
pub struct ActiveView {
    pub spec: Arc<ToolsetSpecification>,
    pub toolset: Arc<ResolvedToolset>,
    pub connections: Arc<ConnectionSet>,
    pub persona: Option<ActivePersonaState>,
    pub warnings: Vec<String>,
}

struct PreservedState {
    view: Option<Arc<ActiveView>>,
    discovery: DiscoverySnapshot,
}

type Connections = Vec<Arc<dyn BackendConnection>>;

/// Connections opened for a candidate. Closed in the background if the
/// guard drops before commit takes them over.
type FreshConnections = ScopeGuard<Connections, fn(Connections)>;

fn close_abandoned(connections: Connections) {
    if connections.is_empty() {
        return;
    }
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            debug!(count = connections.len(), "Closing connections of an abandoned activation");
            handle.spawn(close_all(connections));
        }
        Err(_) => warn!(
            count = connections.len(),
            "No runtime to close connections of an abandoned activation"
        ),
    }
}

fn fresh_connections() -> FreshConnections {
    scopeguard::guard(Vec::new(), close_abandoned as fn(Connections))
}

/// Validated activation, ready to commit.
struct Prepared {
    persona: LoadedPersona,
    fresh: FreshConnections,
    toolset: String,
    report: DiscoveryReport,
    spec: ToolsetSpecification,
    outcome: ResolutionOutcome,
    warnings: Vec<String>,
    validation_passed: bool,
}

fn same_connection(a: &Arc<dyn BackendConnection>, b: &Arc<dyn BackendConnection>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

async fn close_all(connections: Connections) {
    for connection in connections {
        connection.close().await;
    }
}

pub struct PersonaManager {
    discovery: Arc<DiscoveryEngine>,
    registry: Arc<PersonaRegistry>,
    connector: Arc<dyn BackendConnector>,
    /// Backends connected at startup; every persona builds on these
    base: Arc<ConnectionSet>,
    settings: PersonaSettings,
    metrics: Arc<GatewayMetrics>,
    view: ArcSwapOption<ActiveView>,
    /// Toolset applied without a persona, reinstated on deactivation
    baseline: ArcSwapOption<ToolsetSpecification>,
    state: RwLock<PersonaState>,
    transition: AsyncMutex<()>,
    preserved: Mutex<Option<PreservedState>>,
    events: broadcast::Sender<PersonaEvent>,
}

impl PersonaManager {
    pub fn new(
        discovery: Arc<DiscoveryEngine>,
        registry: Arc<PersonaRegistry>,
        connector: Arc<dyn BackendConnector>,
        settings: PersonaSettings,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            base: discovery.connections(),
            discovery,
            registry,
            connector,
            settings,
            metrics,
            view: ArcSwapOption::empty(),
            baseline: ArcSwapOption::empty(),
            state: RwLock::new(PersonaState::Inactive),
            transition: AsyncMutex::new(()),
            preserved: Mutex::new(None),
            events,
        }
    }

    pub fn registry(&self) -> &Arc<PersonaRegistry> {
        &self.registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PersonaEvent> {
        self.events.subscribe()
    }

    /// Current routable view. Never blocks on a running activation.
    pub fn view(&self) -> Option<Arc<ActiveView>> {
        self.view.load_full()
    }

    pub fn active(&self) -> Option<ActivePersonaState> {
        self.view.load().as_ref().and_then(|v| v.persona.clone())
    }

    pub fn state(&self) -> PersonaState {
        self.state.read().clone()
    }

    pub fn has_preserved_state(&self) -> bool {
        self.preserved.lock().is_some()
    }

    fn emit(&self, event: PersonaEvent) {
        let _ = self.events.send(event);
    }

    fn set_state(&self, state: PersonaState) {
        *self.state.write() = state;
    }

    /// State matching the published view.
    fn stable_state(&self) -> PersonaState {
        match self.active() {
            Some(active) => PersonaState::Active {
                persona: active.persona,
                toolset: active.toolset,
            },
            None => PersonaState::Inactive,
        }
    }

    fn begin_transition(&self, persona: &str) -> Result<MutexGuard<'_, ()>, PersonaError> {
        self.transition.try_lock().map_err(|_| {
            PersonaError::new(
                PersonaErrorKind::ActivationInProgress,
                format!(
                    "cannot switch to '{}' while another persona transition is running",
                    persona
                ),
            )
            .with_suggestion("Retry once the current activation has finished")
        })
    }

    /// Activate persona `name`. Deactivates the current persona as part of
    /// the same swap; on failure the current persona stays active.
    pub async fn activate(
        &self,
        name: &str,
        options: ActivationOptions,
    ) -> Result<ActivePersonaState, PersonaError> {
        let _transition = self.begin_transition(name)?;

        let previous = self.view.load_full();
        let previous_persona = previous
            .as_ref()
            .and_then(|v| v.persona.as_ref())
            .map(|p| p.persona.clone());

        self.set_state(PersonaState::Activating {
            persona: name.to_string(),
            previous: previous_persona.clone(),
        });
        self.emit(PersonaEvent::Activating {
            persona: name.to_string(),
        });
        info!(persona = %name, previous = ?previous_persona, force = options.force, "Activating persona");

        // a dropped activation future must not leave the machine mid-transition
        let reset = scopeguard::guard((), |_| {
            let mut state = self.state.write();
            if state.is_transitioning() {
                *state = self.stable_state();
            }
        });

        let result = match self.prepare(name, &options).await {
            Ok(prepared) => Ok(self.commit(prepared, previous, &options)),
            Err(err) => {
                self.metrics.record_activation(false);
                warn!(
                    persona = %name,
                    layer = ?err.layer(),
                    error = %err,
                    "Persona activation failed, previous state kept"
                );
                self.set_state(PersonaState::ActivationFailed {
                    persona: name.to_string(),
                    previous: previous_persona,
                    layer: err.layer(),
                    error: err.message().to_string(),
                });
                self.emit(PersonaEvent::ActivationFailed {
                    persona: name.to_string(),
                    layer: err.layer(),
                    error: err.message().to_string(),
                });
                Err(err)
            }
        };
        ScopeGuard::into_inner(reset);
        result
    }

    async fn prepare(
        &self,
        name: &str,
        options: &ActivationOptions,
    ) -> Result<Prepared, PersonaError> {
        let persona = self.registry.get(name).await?;

        validation::validate_schema(&persona)?;
        let target = validation::validate_business_rules(
            &persona.config,
            options.toolset.as_deref(),
            self.registry.sources_with_name(name),
        )?
        .clone();

        let allow_override = options
            .allow_backend_override
            .unwrap_or(self.settings.allow_backend_override);
        let plan = validation::plan_backends(&persona.backends, &self.base, allow_override);
        let (candidate, fresh) = self.connect_candidate(&plan).await?;

        let report = self.discovery.probe(Arc::new(candidate)).await;
        let tools = self.candidate_tools(&report);

        match Self::finish_validation(&persona, &target, &plan, &tools, options) {
            Ok((spec, outcome, warnings, validation_passed)) => Ok(Prepared {
                toolset: target.name.clone(),
                persona,
                fresh,
                report,
                spec,
                outcome,
                warnings,
                validation_passed,
            }),
            Err(err) => {
                close_all(ScopeGuard::into_inner(fresh)).await;
                Err(err)
            }
        }
    }

    /// Layers 3 and 4, then resolution.
    fn finish_validation(
        persona: &LoadedPersona,
        target: &PersonaToolset,
        plan: &BackendPlan,
        tools: &[DiscoveredTool],
        options: &ActivationOptions,
    ) -> Result<(ToolsetSpecification, ResolutionOutcome, Vec<String>, bool), PersonaError> {
        let allow_stale = options.force || options.allow_stale_refs;
        let resolution = validation::resolve_tool_ids(target, tools, allow_stale);
        let mut warnings = validation::check_tool_resolution(&target.name, &resolution, options.force)?;

        validation::check_backend_plan(persona.name(), plan)?;

        let spec = validation::persona_toolset_spec(persona.name(), &target.name, &resolution.resolved);
        let outcome = toolset::apply(&spec, tools).map_err(|e| {
            PersonaError::new(PersonaErrorKind::ToolResolutionFailed, e.to_string())
                .with_layer(ValidationLayer::ToolResolution)
        })?;
        warnings.extend(outcome.warnings.iter().cloned());

        let passed = resolution.unresolved.is_empty() && resolution.warnings.is_empty();
        Ok((spec, outcome, warnings, passed))
    }

    /// Base connections plus the persona's bundled backends. Returns the
    /// connections opened here, guarded until commit.
    async fn connect_candidate(
        &self,
        plan: &BackendPlan,
    ) -> Result<(ConnectionSet, FreshConnections), PersonaError> {
        let mut candidate = (*self.base).clone();
        let mut fresh = fresh_connections();

        for config in &plan.connect {
            match self.connector.connect(config).await {
                Ok(connection) => {
                    fresh.push(Arc::clone(&connection));
                    candidate.insert(BackendEntry::new(config.clone(), connection));
                }
                Err(e) if config.required => {
                    close_all(ScopeGuard::into_inner(fresh)).await;
                    return Err(PersonaError::new(
                        PersonaErrorKind::ValidationFailed,
                        format!("required backend '{}' could not connect: {}", config.name, e),
                    )
                    .with_layer(ValidationLayer::BackendConfig)
                    .with_suggestion("Check the backend entry in mcp.json"));
                }
                Err(e) => {
                    warn!(backend = %config.name, error = %e, "Optional persona backend unavailable");
                }
            }
        }
        Ok((candidate, fresh))
    }

    /// Tools a report would publish, plus the cached tools of degraded
    /// backends whose connection carries over unchanged.
    fn candidate_tools(&self, report: &DiscoveryReport) -> Vec<DiscoveredTool> {
        let current = self.discovery.connections();
        let mut tools = report.tools();
        for backend in report.failed() {
            let BackendOutcome::Failed {
                status: BackendStatus::Degraded,
                ..
            } = &backend.outcome
            else {
                continue;
            };
            let carried_over = match (
                current.get(&backend.server),
                report.connections.get(&backend.server),
            ) {
                (Some(old), Some(new)) => same_connection(&old.connection, &new.connection),
                _ => false,
            };
            if carried_over {
                tools.extend(
                    self.discovery
                        .cache()
                        .snapshot_namespace(&backend.server)
                        .into_iter()
                        .map(|(_, tool)| tool),
                );
            }
        }
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    fn commit(
        &self,
        prepared: Prepared,
        previous: Option<Arc<ActiveView>>,
        options: &ActivationOptions,
    ) -> ActivePersonaState {
        let previous_persona = previous
            .as_ref()
            .and_then(|v| v.persona.as_ref())
            .map(|p| p.persona.clone());
        if let Some(persona) = &previous_persona {
            self.set_state(PersonaState::Deactivating {
                persona: persona.clone(),
            });
        }

        let preserved = options.preserve_state.then(|| PreservedState {
            view: previous.clone(),
            discovery: self.discovery.snapshot(),
        });

        self.discovery.commit_and_swap(&prepared.report);
        // the new view owns them from here
        ScopeGuard::into_inner(prepared.fresh);

        let state = ActivePersonaState {
            activation_id: Uuid::new_v4().to_string(),
            persona: prepared.persona.name().to_string(),
            toolset: prepared.toolset.clone(),
            activated_at: Utc::now(),
            metadata: ActivationMetadata {
                source: options.source,
                validation_passed: prepared.validation_passed,
                resolved_tool_count: prepared.outcome.toolset.len(),
                warnings: prepared.warnings.clone(),
            },
        };
        let view = Arc::new(ActiveView {
            spec: Arc::new(prepared.spec),
            toolset: Arc::new(prepared.outcome.toolset),
            connections: Arc::clone(&prepared.report.connections),
            persona: Some(state.clone()),
            warnings: prepared.warnings,
        });
        self.view.store(Some(Arc::clone(&view)));

        let dropped = std::mem::replace(&mut *self.preserved.lock(), preserved);
        let mut retiring: Vec<Arc<ConnectionSet>> = previous
            .iter()
            .map(|v| Arc::clone(&v.connections))
            .collect();
        if let Some(dropped) = dropped {
            retiring.push(Arc::clone(dropped.discovery.connections()));
        }
        self.retire(&retiring);

        self.set_state(PersonaState::Active {
            persona: state.persona.clone(),
            toolset: state.toolset.clone(),
        });
        self.metrics.record_activation(true);
        if let Some(persona) = previous_persona {
            self.emit(PersonaEvent::Deactivated { persona });
        }
        self.emit(PersonaEvent::Activated {
            state: state.clone(),
        });
        info!(
            activation_id = %state.activation_id,
            persona = %state.persona,
            toolset = %state.toolset,
            tools = state.metadata.resolved_tool_count,
            warnings = state.metadata.warnings.len(),
            "Persona activated"
        );
        state
    }

    /// Close connections in `sets` that no live or preserved view uses.
    fn retire(&self, sets: &[Arc<ConnectionSet>]) {
        let mut keep: Vec<Arc<ConnectionSet>> = vec![Arc::clone(&self.base), self.discovery.connections()];
        if let Some(preserved) = self.preserved.lock().as_ref() {
            keep.push(Arc::clone(preserved.discovery.connections()));
            if let Some(view) = &preserved.view {
                keep.push(Arc::clone(&view.connections));
            }
        }

        let mut closing: Vec<Arc<dyn BackendConnection>> = Vec::new();
        for entry in sets.iter().flat_map(|s| s.iter()) {
            let in_use = keep
                .iter()
                .flat_map(|s| s.iter())
                .any(|kept| same_connection(&kept.connection, &entry.connection));
            let queued = closing.iter().any(|c| same_connection(c, &entry.connection));
            if !in_use && !queued {
                closing.push(Arc::clone(&entry.connection));
            }
        }

        if !closing.is_empty() {
            debug!(count = closing.len(), "Closing retired backend connections");
            tokio::spawn(close_all(closing));
        }
    }

    /// Deactivate the current persona. The base backends and any toolset
    /// applied without a persona come back. Returns the deactivated name.
    pub async fn deactivate(&self) -> Result<Option<String>, PersonaError> {
        let Some(current) = self.view.load_full() else {
            return Ok(None);
        };
        let Some(active) = current.persona.clone() else {
            return Ok(None);
        };
        let _transition = self.begin_transition(&active.persona)?;

        self.set_state(PersonaState::Deactivating {
            persona: active.persona.clone(),
        });
        let reset = scopeguard::guard((), |_| {
            let mut state = self.state.write();
            if state.is_transitioning() {
                *state = self.stable_state();
            }
        });

        let report = self.discovery.probe(Arc::clone(&self.base)).await;
        self.discovery.commit_and_swap(&report);
        let view = self.baseline.load_full().and_then(|spec| {
            match self.resolve_view((*spec).clone()) {
                Ok((view, _)) => Some(view),
                Err(e) => {
                    warn!(error = %e, "Baseline toolset no longer resolves, no toolset active");
                    None
                }
            }
        });
        self.view.store(view);
        self.retire(&[Arc::clone(&current.connections)]);

        ScopeGuard::into_inner(reset);
        self.set_state(PersonaState::Inactive);
        self.emit(PersonaEvent::Deactivated {
            persona: active.persona.clone(),
        });
        info!(persona = %active.persona, "Persona deactivated");
        Ok(Some(active.persona))
    }

    /// Reinstate the view preserved by the last `preserve_state` activation.
    pub async fn restore_previous(&self) -> Result<Option<ActivePersonaState>, PersonaError> {
        let _transition = self.begin_transition("previous state")?;
        let preserved = self.preserved.lock().take().ok_or_else(|| {
            PersonaError::new(PersonaErrorKind::NotFound, "no preserved state to restore")
                .with_suggestion("Activate with preserve_state to keep the previous persona")
        })?;

        let current = self.view.load_full();
        self.discovery.restore(&preserved.discovery);

        let view = preserved.view.map(|view| {
            let mut view = (*view).clone();
            if let Some(persona) = &mut view.persona {
                persona.activated_at = Utc::now();
                persona.metadata.source = ActivationSource::Restored;
            }
            Arc::new(view)
        });
        self.view.store(view.clone());
        if let Some(current) = current {
            self.retire(&[Arc::clone(&current.connections)]);
        }

        let restored = view.and_then(|v| v.persona.clone());
        self.set_state(self.stable_state());
        self.emit(PersonaEvent::Restored {
            persona: restored.as_ref().map(|p| p.persona.clone()),
        });
        info!(persona = ?restored.as_ref().map(|p| &p.persona), "Previous state restored");
        Ok(restored)
    }

    /// Resolve `spec` against the current discovery view and publish it
    /// without a persona. Waits for a running transition to finish.
    pub async fn apply_toolset(&self, spec: ToolsetSpecification) -> GatewayResult<ResolutionOutcome> {
        let _transition = self.transition.lock().await;
        if let Some(active) = self.active() {
            return Err(GatewayError::Config(format!(
                "persona '{}' is active; deactivate it before applying a toolset",
                active.persona
            )));
        }
        spec.validate_structure()?;

        let (view, outcome) = self.resolve_view(spec.clone())?;
        self.view.store(Some(view));
        self.baseline.store(Some(Arc::new(spec)));
        info!(
            toolset = %outcome.toolset.name(),
            tools = outcome.toolset.len(),
            conflicts = outcome.conflicts.len(),
            "Toolset applied"
        );
        Ok(outcome)
    }

    fn resolve_view(
        &self,
        spec: ToolsetSpecification,
    ) -> GatewayResult<(Arc<ActiveView>, ResolutionOutcome)> {
        let connections = self.discovery.connections();
        let outcome = toolset::apply(&spec, &self.discovery.get_all_tools(false))?;
        let view = Arc::new(ActiveView {
            spec: Arc::new(spec),
            toolset: Arc::new(outcome.toolset.clone()),
            connections,
            persona: None,
            warnings: outcome.warnings.clone(),
        });
        Ok((view, outcome))
    }

    /// Re-resolve the active toolset after a discovery pass. Skipped while
    /// a transition runs. Returns whether the view changed.
    pub fn reapply(&self) -> bool {
        let Ok(_transition) = self.transition.try_lock() else {
            return false;
        };
        let Some(current) = self.view.load_full() else {
            return false;
        };
        let connections = self.discovery.connections();
        if !Arc::ptr_eq(&current.connections, &connections) {
            return false;
        }

        let outcome = match toolset::apply(&current.spec, &self.discovery.get_all_tools(false)) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "Active toolset no longer resolves, keeping previous tools");
                return false;
            }
        };
        if outcome.toolset.tools() == current.toolset.tools() {
            return false;
        }

        let mut view = (*current).clone();
        if let Some(persona) = &mut view.persona {
            persona.metadata.resolved_tool_count = outcome.toolset.len();
        }
        view.toolset = Arc::new(outcome.toolset);
        view.warnings = outcome.warnings;
        info!(tools = view.toolset.len(), "Active toolset re-resolved after discovery");
        self.view.store(Some(Arc::new(view)));
        true
    }

    /// Re-resolve the active toolset whenever discovery commits.
    pub fn spawn_view_refresh(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let mut commits = self.discovery.subscribe_commits();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("View refresh shutting down");
                        break;
                    }
                    changed = commits.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        self.reapply();
                    }
                }
            }
        })
    }

    /// Close every connection this manager opened.
    pub async fn shutdown(&self) {
        let mut sets: Vec<Arc<ConnectionSet>> = vec![self.discovery.connections()];
        if let Some(view) = self.view.load_full() {
            sets.push(Arc::clone(&view.connections));
        }
        if let Some(preserved) = self.preserved.lock().take() {
            sets.push(Arc::clone(preserved.discovery.connections()));
        }
        self.view.store(None);

        let mut closing: Vec<Arc<dyn BackendConnection>> = Vec::new();
        for entry in sets.iter().flat_map(|s| s.iter()) {
            let base = self
                .base
                .iter()
                .any(|b| same_connection(&b.connection, &entry.connection));
            if !base && !closing.iter().any(|c| same_connection(c, &entry.connection)) {
                closing.push(Arc::clone(&entry.connection));
            }
        }
        close_all(closing).await;
    }
}
