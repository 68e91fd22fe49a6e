//! Activation validation layers, evaluated in order:
//! schema, business rules, tool resolution, backend configuration.

use std::collections::{BTreeMap, HashSet};

use super::types::{LoadedPersona, PersonaConfig, PersonaToolset};
use crate::{
    core::{
        config::{validate_backend_name, BackendConfig},
        pool::{BackendIdentity, ConnectionSet},
    },
    discovery::{resolve_in, DiscoveredTool, QualifiedToolName, ResolveOptions, ToolReference},
    error::{PersonaError, PersonaErrorKind, ReferenceError, ValidationLayer},
    toolset::{ServerSelection, ToolSelection, ToolsetSpecification},
};

const MAX_NAME_LEN: usize = 64;

/// ASCII letter first, then letters, digits, `-` or `_`.
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && name.len() <= MAX_NAME_LEN
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Layer 1: structure of the definition and its bundled backends.
pub fn validate_schema(persona: &LoadedPersona) -> Result<(), PersonaError> {
    let config = &persona.config;

    if !is_valid_identifier(&config.name) {
        return Err(PersonaError::schema(format!(
            "persona name '{}' is not a valid identifier",
            config.name
        ))
        .with_suggestion("Use letters, digits, '-' and '_', starting with a letter"));
    }

    if config.toolsets.is_empty() {
        return Err(
            PersonaError::schema(format!("persona '{}' defines no toolsets", config.name))
                .with_suggestion("Add at least one entry under 'toolsets'"),
        );
    }

    let mut seen = HashSet::new();
    for toolset in &config.toolsets {
        if toolset.name.trim().is_empty() {
            return Err(PersonaError::schema("toolset name must not be empty"));
        }
        if !seen.insert(toolset.name.as_str()) {
            return Err(PersonaError::schema(format!(
                "toolset '{}' is defined more than once",
                toolset.name
            )));
        }
        if toolset.tool_ids.is_empty() {
            return Err(PersonaError::schema(format!(
                "toolset '{}' lists no tools",
                toolset.name
            ))
            .with_suggestion("Add tool references such as 'git.status' under 'toolIds'"));
        }
        let malformed: Vec<&str> = toolset
            .tool_ids
            .iter()
            .filter(|id| ToolReference::parse(id).is_err())
            .map(String::as_str)
            .collect();
        if !malformed.is_empty() {
            return Err(PersonaError::schema(format!(
                "toolset '{}' has malformed tool references: {:?}",
                toolset.name, malformed
            ))
            .with_suggestion("Use 'backend.tool', 'tool', '#<hash>' or 'name#<hash>'"));
        }
    }

    let mut backends = HashSet::new();
    for backend in &persona.backends {
        validate_backend_name(&backend.name).map_err(PersonaError::schema)?;
        if !backends.insert(backend.name.as_str()) {
            return Err(PersonaError::schema(format!(
                "backend '{}' is bundled more than once",
                backend.name
            )));
        }
    }
    Ok(())
}

/// Layer 2: default toolset exists, the persona name is unique and the
/// requested toolset exists. Returns the toolset to activate.
pub fn validate_business_rules<'a>(
    config: &'a PersonaConfig,
    requested: Option<&str>,
    sources_with_name: usize,
) -> Result<&'a PersonaToolset, PersonaError> {
    let default = config.default_toolset()?;

    if sources_with_name > 1 {
        return Err(PersonaError::new(
            PersonaErrorKind::ValidationFailed,
            format!(
                "persona name '{}' is defined by {} sources",
                config.name, sources_with_name
            ),
        )
        .with_layer(ValidationLayer::BusinessRules)
        .with_suggestion("Rename or remove the duplicate persona"));
    }

    match requested {
        None => Ok(default),
        Some(name) => config.toolset(name).ok_or_else(|| {
            let available: Vec<&str> = config.toolsets.iter().map(|t| t.name.as_str()).collect();
            PersonaError::new(
                PersonaErrorKind::ToolsetNotFound,
                format!("persona '{}' has no toolset '{}'", config.name, name),
            )
            .with_layer(ValidationLayer::BusinessRules)
            .with_suggestion(format!("Available toolsets: {}", available.join(", ")))
        }),
    }
}

/// Outcome of resolving a persona toolset's references.
#[derive(Debug, Clone, Default)]
pub struct ToolIdResolution {
    /// Resolved tools in reference order, without duplicates
    pub resolved: Vec<QualifiedToolName>,
    pub unresolved: Vec<ReferenceError>,
    pub warnings: Vec<String>,
}

pub fn resolve_tool_ids(
    toolset: &PersonaToolset,
    tools: &[DiscoveredTool],
    allow_stale_refs: bool,
) -> ToolIdResolution {
    let options = ResolveOptions { allow_stale_refs };
    let mut out = ToolIdResolution::default();
    let mut seen = HashSet::new();

    for id in &toolset.tool_ids {
        let resolution = ToolReference::parse(id).and_then(|r| resolve_in(&r, tools, options));
        match resolution {
            Ok(resolution) => {
                out.warnings.extend(resolution.warnings);
                if seen.insert(resolution.tool.name.clone()) {
                    out.resolved.push(resolution.tool.name);
                }
            }
            Err(err) => out.unresolved.push(err),
        }
    }
    out
}

/// Layer 3. With `force`, unresolved references become warnings.
pub fn check_tool_resolution(
    toolset: &str,
    resolution: &ToolIdResolution,
    force: bool,
) -> Result<Vec<String>, PersonaError> {
    let mut warnings = resolution.warnings.clone();
    if resolution.unresolved.is_empty() {
        return Ok(warnings);
    }

    if force {
        warnings.extend(
            resolution
                .unresolved
                .iter()
                .map(|e| format!("skipped unresolved reference: {}", e)),
        );
        return Ok(warnings);
    }

    let details: Vec<String> = resolution.unresolved.iter().map(|e| e.to_string()).collect();
    let mut err = PersonaError::new(
        PersonaErrorKind::ToolResolutionFailed,
        format!(
            "{} tool reference(s) in toolset '{}' did not resolve: {}",
            details.len(),
            toolset,
            details.join("; ")
        ),
    )
    .with_layer(ValidationLayer::ToolResolution)
    .with_suggestion("Check that the owning backends are connected and list these tools");
    if resolution
        .unresolved
        .iter()
        .any(|e| matches!(e, ReferenceError::HashMismatch { .. }))
    {
        err = err.with_suggestion("A backend changed its tool schema; update the hash or allow stale references");
    }
    Err(err.with_suggestion("Activate with force to skip unresolved tools"))
}

/// How a persona's bundled backends map onto the base connection set.
#[derive(Debug, Clone, Default)]
pub struct BackendPlan {
    /// Same name and identity as a base backend; the live connection is kept
    pub reuse: Vec<String>,
    /// Need a new connection
    pub connect: Vec<BackendConfig>,
    /// Replace a base backend of the same name
    pub overrides: Vec<String>,
    pub conflicts: Vec<String>,
}

pub fn plan_backends(
    bundled: &[BackendConfig],
    base: &ConnectionSet,
    allow_override: bool,
) -> BackendPlan {
    let mut plan = BackendPlan::default();
    for backend in bundled {
        match base.get(&backend.name) {
            None => plan.connect.push(backend.clone()),
            Some(entry) if entry.identity == BackendIdentity::from_config(backend) => {
                plan.reuse.push(backend.name.clone());
            }
            Some(_) if allow_override => {
                plan.overrides.push(backend.name.clone());
                plan.connect.push(backend.clone());
            }
            Some(_) => plan.conflicts.push(backend.name.clone()),
        }
    }
    plan
}

/// Layer 4.
pub fn check_backend_plan(persona: &str, plan: &BackendPlan) -> Result<(), PersonaError> {
    if plan.conflicts.is_empty() {
        return Ok(());
    }
    Err(PersonaError::new(
        PersonaErrorKind::ConfigConflict,
        format!(
            "persona '{}' bundles backends that conflict with connected ones: {}",
            persona,
            plan.conflicts.join(", ")
        ),
    )
    .with_layer(ValidationLayer::BackendConfig)
    .with_suggestion("Rename the bundled backends in mcp.json")
    .with_suggestion("Or enable allow_backend_override to replace the connected backends"))
}

/// Toolset specification for a persona toolset: one explicit include list
/// per backend, no namespacing, collisions namespaced.
pub fn persona_toolset_spec(
    persona: &str,
    toolset: &str,
    resolved: &[QualifiedToolName],
) -> ToolsetSpecification {
    let mut by_server: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for name in resolved {
        by_server.entry(&name.server).or_default().push(&name.tool);
    }
    by_server.into_iter().fold(
        ToolsetSpecification::new(format!("{}/{}", persona, toolset)),
        |spec, (server, tools)| {
            spec.with_server(ServerSelection::new(server).with_tools(ToolSelection::only(tools)))
        },
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::{Map, Value};

    use super::*;
    use crate::{
        core::{
            connection::{BackendConnection, BackendStatus, ToolDescriptor, ToolOutput},
            pool::BackendEntry,
        },
        error::GatewayResult,
    };

    fn config(yaml: &str) -> LoadedPersona {
        LoadedPersona::inline(PersonaConfig::from_yaml_str(yaml).unwrap())
    }

    fn tools() -> Vec<DiscoveredTool> {
        let now = Utc::now();
        [("git", "status"), ("git", "log"), ("docker", "ps")]
            .into_iter()
            .map(|(s, n)| DiscoveredTool::from_descriptor(s, ToolDescriptor::new(n), now).unwrap())
            .collect()
    }

    #[test]
    fn test_identifier_rules() {
        assert!(is_valid_identifier("backend-dev_2"));
        assert!(!is_valid_identifier("2fast"));
        assert!(!is_valid_identifier("has space"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier(&"a".repeat(65)));
    }

    #[test]
    fn test_schema_layer() {
        let ok = config("name: dev\ntoolsets:\n  - name: a\n    toolIds: [git.status]\n");
        assert!(validate_schema(&ok).is_ok());

        let empty = config("name: dev\ntoolsets: []\n");
        assert_eq!(
            validate_schema(&empty).unwrap_err().layer(),
            Some(ValidationLayer::Schema)
        );

        let malformed = config("name: dev\ntoolsets:\n  - name: a\n    toolIds: ['#zz']\n");
        assert!(validate_schema(&malformed).is_err());

        let dup_backend = ok
            .clone()
            .with_backend(BackendConfig::stdio("x", "a", vec![]))
            .with_backend(BackendConfig::stdio("x", "b", vec![]));
        assert!(validate_schema(&dup_backend).is_err());
    }

    #[test]
    fn test_business_rules_layer() {
        let persona = config(
            "name: dev\ntoolsets:\n  - name: a\n    toolIds: [git.status]\n  - name: b\n    toolIds: [docker.ps]\ndefaultToolset: a\n",
        );
        let cfg = &persona.config;
        assert_eq!(validate_business_rules(cfg, None, 1).unwrap().name, "a");
        assert_eq!(validate_business_rules(cfg, Some("b"), 1).unwrap().name, "b");
        assert_eq!(
            validate_business_rules(cfg, Some("c"), 1).unwrap_err().kind(),
            PersonaErrorKind::ToolsetNotFound
        );
        assert_eq!(
            validate_business_rules(cfg, None, 2).unwrap_err().kind(),
            PersonaErrorKind::ValidationFailed
        );

        let bad_default =
            config("name: dev\ntoolsets:\n  - name: a\n    toolIds: [x]\ndefaultToolset: zzz\n");
        assert_eq!(
            validate_business_rules(&bad_default.config, None, 1)
                .unwrap_err()
                .kind(),
            PersonaErrorKind::ToolsetNotFound
        );
    }

    #[test]
    fn test_tool_resolution_layer_and_force() {
        let toolset = PersonaToolset {
            name: "a".into(),
            tool_ids: vec!["git.status".into(), "ps".into(), "git.status".into(), "nope".into()],
        };
        let resolution = resolve_tool_ids(&toolset, &tools(), false);
        assert_eq!(
            resolution.resolved,
            vec![
                QualifiedToolName::new("git", "status"),
                QualifiedToolName::new("docker", "ps")
            ]
        );
        assert_eq!(resolution.unresolved.len(), 1);

        let err = check_tool_resolution("a", &resolution, false).unwrap_err();
        assert_eq!(err.kind(), PersonaErrorKind::ToolResolutionFailed);
        assert!(!err.is_recoverable());

        let warnings = check_tool_resolution("a", &resolution, true).unwrap();
        assert_eq!(warnings.len(), 1);
    }

    struct Idle;

    #[async_trait]
    impl BackendConnection for Idle {
        fn name(&self) -> &str {
            "git"
        }

        async fn list_tools(&self) -> GatewayResult<Vec<ToolDescriptor>> {
            Ok(Vec::new())
        }

        async fn invoke(
            &self,
            _tool_name: &str,
            _arguments: Option<Map<String, Value>>,
        ) -> GatewayResult<ToolOutput> {
            Ok(ToolOutput::success(Value::Null))
        }

        fn status(&self) -> BackendStatus {
            BackendStatus::Connected
        }
    }

    #[test]
    fn test_backend_plan() {
        let git = BackendConfig::stdio("git", "mcp-git", vec![]);
        let base = ConnectionSet::new().with(BackendEntry::new(git.clone(), Arc::new(Idle)));

        let bundled = vec![
            git.clone(),
            BackendConfig::stdio("git", "other-git", vec![]),
            BackendConfig::stdio("search", "mcp-search", vec![]),
        ];
        let plan = plan_backends(&bundled, &base, false);
        assert_eq!(plan.reuse, vec!["git"]);
        assert_eq!(plan.conflicts, vec!["git"]);
        assert_eq!(plan.connect.len(), 1);
        assert_eq!(
            check_backend_plan("dev", &plan).unwrap_err().kind(),
            PersonaErrorKind::ConfigConflict
        );

        let plan = plan_backends(&bundled[1..], &base, true);
        assert_eq!(plan.overrides, vec!["git"]);
        assert_eq!(plan.connect.len(), 2);
        assert!(check_backend_plan("dev", &plan).is_ok());
    }

    #[test]
    fn test_persona_spec_groups_by_server() {
        let spec = persona_toolset_spec(
            "dev",
            "coding",
            &[
                QualifiedToolName::new("git", "status"),
                QualifiedToolName::new("docker", "ps"),
                QualifiedToolName::new("git", "log"),
            ],
        );
        assert_eq!(spec.name, "dev/coding");
        assert_eq!(spec.servers.len(), 2);
        assert_eq!(spec.server("git").unwrap().tools.include, vec!["status", "log"]);
        assert!(!spec.server("docker").unwrap().enable_namespacing);
    }
}
