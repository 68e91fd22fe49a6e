//! Declarative toolset specification.
//!
//! ```yaml
//! name: dev
//! servers:
//!   - serverName: git
//!   - serverName: docker
//!     tools:
//!       include: [ps]
//!     enableNamespacing: true
//! options:
//!   conflictResolution: prefix-server
//! ```

use std::{collections::HashSet, path::Path};

use serde::{Deserialize, Serialize};

use crate::{
    core::config::validate_backend_name,
    error::{GatewayError, GatewayResult, ResolutionError},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsetSpecification {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default)]
    pub servers: Vec<ServerSelection>,

    #[serde(default)]
    pub options: ToolsetOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSelection {
    pub server_name: String,

    /// Missing means include everything
    #[serde(default)]
    pub tools: ToolSelection,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub enable_namespacing: bool,

    /// Namespace used instead of the server name when namespacing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_namespace: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSelection {
    /// Defaults to true when neither `include` nor `includePattern` is given
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_all: Option<bool>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,

    /// Regex matched against the local tool name, widening `include`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_pattern: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    /// Expose colliding tools as `server.tool`
    #[default]
    Namespace,
    /// Expose colliding tools as `server_tool`
    PrefixServer,
    /// Fail resolution
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsetOptions {
    #[serde(default)]
    pub conflict_resolution: ConflictStrategy,

    /// When false any collision fails resolution regardless of strategy
    #[serde(default = "default_true")]
    pub auto_resolve: bool,
}

impl Default for ToolsetOptions {
    fn default() -> Self {
        Self {
            conflict_resolution: ConflictStrategy::default(),
            auto_resolve: true,
        }
    }
}

fn default_true() -> bool {
    true
}

impl ToolSelection {
    pub fn all() -> Self {
        Self {
            include_all: Some(true),
            ..Self::default()
        }
    }

    pub fn only<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            include_all: Some(false),
            include: names.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn matching(pattern: impl Into<String>) -> Self {
        Self {
            include_all: Some(false),
            include_pattern: Some(pattern.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn excluding<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn includes_all(&self) -> bool {
        self.include_all
            .unwrap_or(self.include.is_empty() && self.include_pattern.is_none())
    }
}

impl ServerSelection {
    pub fn new(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            tools: ToolSelection::default(),
            enabled: true,
            enable_namespacing: false,
            custom_namespace: None,
        }
    }

    #[must_use]
    pub fn with_tools(mut self, tools: ToolSelection) -> Self {
        self.tools = tools;
        self
    }

    #[must_use]
    pub fn namespaced(mut self, custom: Option<&str>) -> Self {
        self.enable_namespacing = true;
        self.custom_namespace = custom.map(str::to_string);
        self
    }

    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Namespace applied to every exposed tool, if namespacing is on.
    pub fn namespace(&self) -> Option<&str> {
        self.enable_namespacing
            .then(|| {
                self.custom_namespace
                    .as_deref()
                    .unwrap_or(self.server_name.as_str())
            })
    }
}

impl ToolsetSpecification {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            version: None,
            servers: Vec::new(),
            options: ToolsetOptions::default(),
        }
    }

    /// Include every tool of every listed backend, without namespacing.
    pub fn include_all<'a>(name: impl Into<String>, servers: impl IntoIterator<Item = &'a str>) -> Self {
        let mut spec = Self::new(name);
        spec.servers = servers
            .into_iter()
            .map(|s| ServerSelection::new(s).with_tools(ToolSelection::all()))
            .collect();
        spec
    }

    #[must_use]
    pub fn with_server(mut self, server: ServerSelection) -> Self {
        self.servers.push(server);
        self
    }

    #[must_use]
    pub fn with_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.options.conflict_resolution = strategy;
        self
    }

    pub fn server(&self, name: &str) -> Option<&ServerSelection> {
        self.servers.iter().find(|s| s.server_name == name)
    }

    pub fn from_yaml_str(content: &str) -> GatewayResult<Self> {
        let spec: Self = serde_yaml::from_str(content)?;
        spec.validate_structure()?;
        Ok(spec)
    }

    pub fn from_json_str(content: &str) -> GatewayResult<Self> {
        let spec: Self = serde_json::from_str(content)?;
        spec.validate_structure()?;
        Ok(spec)
    }

    /// Load a `.json`, `.yaml` or `.yml` file. Rejects an empty server list.
    pub async fn load(path: &Path) -> GatewayResult<Self> {
        let spec = Self::read(path).await?;
        spec.ensure_servers()?;
        Ok(spec)
    }

    /// Load a file; an empty server list becomes include-all over `backends`.
    pub async fn load_with_fallback<'a>(
        path: &Path,
        backends: impl IntoIterator<Item = &'a str>,
    ) -> GatewayResult<Self> {
        Ok(Self::read(path).await?.with_fallback(backends))
    }

    async fn read(path: &Path) -> GatewayResult<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&content),
            Some("yaml") | Some("yml") => Self::from_yaml_str(&content),
            other => Err(GatewayError::Config(format!(
                "unsupported toolset file extension {:?} for {}",
                other,
                path.display()
            ))),
        }
    }

    #[must_use]
    pub fn with_fallback<'a>(mut self, backends: impl IntoIterator<Item = &'a str>) -> Self {
        if self.servers.is_empty() {
            self.servers = backends
                .into_iter()
                .map(|s| ServerSelection::new(s).with_tools(ToolSelection::all()))
                .collect();
        }
        self
    }

    pub fn ensure_servers(&self) -> Result<(), ResolutionError> {
        if self.servers.is_empty() {
            return Err(ResolutionError::InvalidSpecification(format!(
                "toolset '{}' lists no servers",
                self.name
            )));
        }
        Ok(())
    }

    /// Structural checks that do not depend on discovery.
    pub fn validate_structure(&self) -> Result<(), ResolutionError> {
        let invalid = ResolutionError::InvalidSpecification;

        if self.name.trim().is_empty() {
            return Err(invalid("toolset name must not be empty".to_string()));
        }

        let mut seen = HashSet::new();
        for server in &self.servers {
            validate_backend_name(&server.server_name).map_err(invalid)?;
            if !seen.insert(server.server_name.as_str()) {
                return Err(invalid(format!(
                    "server '{}' is listed more than once",
                    server.server_name
                )));
            }
            if let Some(ns) = &server.custom_namespace {
                validate_backend_name(ns)
                    .map_err(|e| invalid(format!("custom namespace: {}", e)))?;
            }
        }
        Ok(())
    }
}
