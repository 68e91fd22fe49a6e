//! Gateway error types.
//!
//! Defines the crate-wide [`GatewayError`] plus the typed outcomes of the
//! subsystems that surface structured errors to the activation state machine:
//! tool references, toolset resolution, routing and personas.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Server not found: {0}")]
    ServerNotFound(String),

    #[error("Server disconnected: {0}")]
    ServerDisconnected(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Tool execution failed: {0}")]
    ToolExecution(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Timed out after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Malformed tool descriptor from '{server}': {message}")]
    MalformedDescriptor { server: String, message: String },

    #[error(transparent)]
    Reference(#[from] ReferenceError),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Persona(#[from] PersonaError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl GatewayError {
    /// True when the backend could not be reached at all, as opposed to a
    /// backend that answered with a failure.
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            GatewayError::ServerDisconnected(_)
                | GatewayError::ConnectionFailed(_)
                | GatewayError::Timeout { .. }
                | GatewayError::Transport(_)
                | GatewayError::Io(_)
                | GatewayError::Http(_)
        )
    }
}

/// Failure to resolve a tool reference against the discovered tool view.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReferenceError {
    #[error("Malformed tool reference '{0}'")]
    Malformed(String),

    #[error("Tool reference '{0}' does not match any discovered tool")]
    NotFound(String),

    #[error("Tool reference '{reference}' is ambiguous, candidates: {candidates:?}")]
    Ambiguous {
        reference: String,
        candidates: Vec<String>,
    },

    #[error(
        "Tool reference '{reference}' is stale: name resolves to {by_name:?} but hash resolves to {by_hash:?}"
    )]
    HashMismatch {
        reference: String,
        by_name: Option<String>,
        by_hash: Option<String>,
    },
}

/// Failure of the toolset resolution engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error("Unresolved tool name collision: '{name}' exposed by servers {servers:?}")]
    UnresolvedConflict { name: String, servers: Vec<String> },

    #[error("Invalid include pattern '{pattern}' for server '{server}': {message}")]
    InvalidPattern {
        server: String,
        pattern: String,
        message: String,
    },

    #[error("Invalid toolset specification: {0}")]
    InvalidSpecification(String),
}

/// Typed routing outcome. Never escapes the router as a panic; callers match
/// on it to distinguish "not routable" from "routed but failed".
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    #[error("No toolset is active")]
    NoActiveToolset,

    #[error("Tool '{reference}' is not in the active toolset '{toolset}'")]
    ToolNotInActiveToolset { reference: String, toolset: String },

    #[error("Tool reference '{reference}' is ambiguous, candidates: {candidates:?}")]
    AmbiguousReference {
        reference: String,
        candidates: Vec<String>,
    },

    #[error("Tool reference '{reference}' is stale: '{resolved}' now has hash {current_hash}")]
    StaleReference {
        reference: String,
        resolved: String,
        current_hash: String,
    },

    #[error("Server '{0}' has no live connection")]
    BackendUnavailable(String),
}

/// Validation layer of persona activation, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValidationLayer {
    Schema,
    BusinessRules,
    ToolResolution,
    BackendConfig,
}

impl fmt::Display for ValidationLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ValidationLayer::Schema => "schema",
            ValidationLayer::BusinessRules => "business-rules",
            ValidationLayer::ToolResolution => "tool-resolution",
            ValidationLayer::BackendConfig => "backend-config",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PersonaErrorKind {
    NotFound,
    SchemaInvalid,
    ValidationFailed,
    ToolsetNotFound,
    ToolResolutionFailed,
    ConfigConflict,
    ArchiveExtractionFailed,
    ActivationInProgress,
    Io,
}

impl PersonaErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PersonaErrorKind::NotFound => "persona not found",
            PersonaErrorKind::SchemaInvalid => "persona schema invalid",
            PersonaErrorKind::ValidationFailed => "persona validation failed",
            PersonaErrorKind::ToolsetNotFound => "toolset not found",
            PersonaErrorKind::ToolResolutionFailed => "tool resolution failed",
            PersonaErrorKind::ConfigConflict => "backend configuration conflict",
            PersonaErrorKind::ArchiveExtractionFailed => "archive extraction failed",
            PersonaErrorKind::ActivationInProgress => "activation already in progress",
            PersonaErrorKind::Io => "persona i/o error",
        }
    }
}

impl fmt::Display for PersonaErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured persona error with remediation hints.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct PersonaError {
    kind: PersonaErrorKind,
    message: String,
    layer: Option<ValidationLayer>,
    suggestions: Vec<String>,
}

impl PersonaError {
    pub fn new(kind: PersonaErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            layer: None,
            suggestions: Vec::new(),
        }
    }

    pub fn not_found(name: &str) -> Self {
        Self::new(
            PersonaErrorKind::NotFound,
            format!("no persona named '{}'", name),
        )
        .with_suggestion("List available personas and check the spelling")
        .with_suggestion("Make sure the persona directory contains a persona.yaml")
    }

    pub fn schema(message: impl Into<String>) -> Self {
        Self::new(PersonaErrorKind::SchemaInvalid, message).with_layer(ValidationLayer::Schema)
    }

    pub fn archive(message: impl Into<String>) -> Self {
        Self::new(PersonaErrorKind::ArchiveExtractionFailed, message)
    }

    pub fn io(context: &str, err: std::io::Error) -> Self {
        Self::new(PersonaErrorKind::Io, format!("{}: {}", context, err))
    }

    #[must_use]
    pub fn with_layer(mut self, layer: ValidationLayer) -> Self {
        self.layer = Some(layer);
        self
    }

    #[must_use]
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn kind(&self) -> PersonaErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn layer(&self) -> Option<ValidationLayer> {
        self.layer
    }

    pub fn suggestions(&self) -> &[String] {
        &self.suggestions
    }

    /// Input errors can be retried once fixed; activation-time conflicts and
    /// resolution failures cannot be retried as-is.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self.kind,
            PersonaErrorKind::ToolResolutionFailed | PersonaErrorKind::ConfigConflict
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persona_error_recoverability() {
        assert!(PersonaError::not_found("x").is_recoverable());
        assert!(PersonaError::schema("bad").is_recoverable());
        assert!(
            !PersonaError::new(PersonaErrorKind::ToolResolutionFailed, "missing").is_recoverable()
        );
        assert!(!PersonaError::new(PersonaErrorKind::ConfigConflict, "dup").is_recoverable());
    }

    #[test]
    fn test_persona_error_display_and_layer() {
        let err = PersonaError::schema("name must not be empty");
        assert_eq!(err.layer(), Some(ValidationLayer::Schema));
        assert_eq!(
            err.to_string(),
            "persona schema invalid: name must not be empty"
        );
        assert!(!PersonaError::not_found("dev").suggestions().is_empty());
    }

    #[test]
    fn test_unreachable_classification() {
        assert!(GatewayError::ConnectionFailed("refused".into()).is_unreachable());
        assert!(GatewayError::Timeout {
            operation: "call".into(),
            timeout_ms: 10
        }
        .is_unreachable());
        assert!(!GatewayError::ToolExecution("boom".into()).is_unreachable());
    }
}
