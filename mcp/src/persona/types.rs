//! Persona definitions and activation state.

use std::{
    fmt,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    cache::CacheWeight,
    core::config::BackendConfig,
    error::{PersonaError, PersonaErrorKind, ValidationLayer},
};

/// `persona.yaml`.
///
/// ```yaml
/// name: backend-dev
/// description: Day-to-day backend work
/// version: 1.0.0
/// toolsets:
///   - name: coding
///     toolIds: [git.status, git.log, "docker.ps#3fa2b9c1"]
/// defaultToolset: coding
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonaConfig {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default)]
    pub toolsets: Vec<PersonaToolset>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_toolset: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonaToolset {
    pub name: String,
    /// Ordered tool references: `backend.tool`, `tool`, `#hash` or `name#hash`
    #[serde(default)]
    pub tool_ids: Vec<String>,
}

impl PersonaConfig {
    pub fn from_yaml_str(content: &str) -> Result<Self, PersonaError> {
        serde_yaml::from_str(content).map_err(|e| {
            PersonaError::schema(format!("cannot parse persona definition: {}", e))
                .with_suggestion("Check persona.yaml against the documented fields")
        })
    }

    pub fn toolset(&self, name: &str) -> Option<&PersonaToolset> {
        self.toolsets.iter().find(|t| t.name == name)
    }

    /// The toolset activated when none is requested explicitly.
    pub fn default_toolset(&self) -> Result<&PersonaToolset, PersonaError> {
        match &self.default_toolset {
            Some(name) => self.toolset(name).ok_or_else(|| {
                PersonaError::new(
                    PersonaErrorKind::ToolsetNotFound,
                    format!(
                        "default toolset '{}' is not defined by persona '{}'",
                        name, self.name
                    ),
                )
                .with_layer(ValidationLayer::BusinessRules)
            }),
            None => self.toolsets.first().ok_or_else(|| {
                PersonaError::schema(format!("persona '{}' defines no toolsets", self.name))
            }),
        }
    }
}

/// Where a persona was loaded from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "path", rename_all = "snake_case")]
pub enum PersonaSource {
    Directory(PathBuf),
    Archive(PathBuf),
    /// Registered programmatically
    Inline,
}

impl PersonaSource {
    pub fn path(&self) -> Option<&Path> {
        match self {
            PersonaSource::Directory(p) | PersonaSource::Archive(p) => Some(p),
            PersonaSource::Inline => None,
        }
    }
}

impl fmt::Display for PersonaSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.path() {
            Some(p) => write!(f, "{}", p.display()),
            None => f.write_str("<inline>"),
        }
    }
}

/// A persona definition plus its bundled backend configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedPersona {
    pub config: PersonaConfig,
    pub backends: Vec<BackendConfig>,
    pub source: PersonaSource,
    /// Asset files shipped alongside the definition, relative to the root
    pub assets: Vec<PathBuf>,
}

impl LoadedPersona {
    pub fn inline(config: PersonaConfig) -> Self {
        Self {
            config,
            backends: Vec::new(),
            source: PersonaSource::Inline,
            assets: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_backend(mut self, backend: BackendConfig) -> Self {
        self.backends.push(backend);
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }
}

impl CacheWeight for LoadedPersona {
    fn estimated_size(&self) -> usize {
        let toolsets: usize = self
            .config
            .toolsets
            .iter()
            .map(|t| t.name.len() + t.tool_ids.iter().map(String::len).sum::<usize>())
            .sum();
        std::mem::size_of::<Self>()
            + self.config.name.len()
            + self.config.description.len()
            + toolsets
            + self.backends.len() * std::mem::size_of::<BackendConfig>()
            + self
                .assets
                .iter()
                .map(|a| a.as_os_str().len())
                .sum::<usize>()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationSource {
    #[default]
    Manual,
    Automatic,
    Restored,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivationMetadata {
    pub source: ActivationSource,
    /// False when `force` let unresolved tool references through
    pub validation_passed: bool,
    pub resolved_tool_count: usize,
    pub warnings: Vec<String>,
}

/// The persona currently serving calls.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivePersonaState {
    /// Unique per activation; restores keep the original id
    pub activation_id: String,
    pub persona: String,
    pub toolset: String,
    pub activated_at: DateTime<Utc>,
    pub metadata: ActivationMetadata,
}

/// Activation state machine.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PersonaState {
    #[default]
    Inactive,
    Activating {
        persona: String,
        previous: Option<String>,
    },
    Active {
        persona: String,
        toolset: String,
    },
    Deactivating {
        persona: String,
    },
    /// The previous persona (if any) is still the active one
    ActivationFailed {
        persona: String,
        previous: Option<String>,
        layer: Option<ValidationLayer>,
        error: String,
    },
}

impl PersonaState {
    pub fn is_transitioning(&self) -> bool {
        matches!(
            self,
            PersonaState::Activating { .. } | PersonaState::Deactivating { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PersonaEvent {
    Activating {
        persona: String,
    },
    Activated {
        state: ActivePersonaState,
    },
    Deactivated {
        persona: String,
    },
    ActivationFailed {
        persona: String,
        layer: Option<ValidationLayer>,
        error: String,
    },
    Restored {
        persona: Option<String>,
    },
}

/// Options for [`PersonaManager::activate`](super::PersonaManager::activate).
#[derive(Debug, Clone, Default)]
pub struct ActivationOptions {
    /// Toolset to activate instead of the persona's default
    pub toolset: Option<String>,
    /// Skip tool-resolution failures; implies stale references are accepted
    pub force: bool,
    /// Accept references whose name and hash disagree, with a warning
    pub allow_stale_refs: bool,
    /// Keep the previous view so it can be restored later
    pub preserve_state: bool,
    pub source: ActivationSource,
    /// Overrides `personas.allow_backend_override` for this activation
    pub allow_backend_override: Option<bool>,
}

impl ActivationOptions {
    pub fn forced() -> Self {
        Self {
            force: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_toolset(mut self, toolset: impl Into<String>) -> Self {
        self.toolset = Some(toolset.into());
        self
    }

    #[must_use]
    pub fn preserving(mut self) -> Self {
        self.preserve_state = true;
        self
    }
}
