//! Gateway configuration types and utilities.
//!
//! Defines configuration structures for backends, transports, proxies, the
//! tool cache, discovery, personas and logging.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    path::PathBuf,
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    error::{GatewayError, GatewayResult},
    logging::LoggingConfig,
};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct GatewayConfig {
    /// Backends connected at startup. Personas may add more.
    #[serde(default)]
    pub servers: Vec<BackendConfig>,

    /// Global MCP proxy configuration (default for all servers)
    /// Can be overridden per-server
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub discovery: DiscoveryConfig,

    #[serde(default)]
    pub routing: RoutingConfig,

    #[serde(default)]
    pub personas: PersonaSettings,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BackendConfig {
    pub name: String,
    #[serde(flatten)]
    pub transport: BackendTransport,

    /// Per-server proxy override (overrides global proxy)
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,

    /// - true: gateway startup fails if this server cannot be reached
    /// - false: log warning but continue (default)
    #[serde(default)]
    pub required: bool,

    /// Per-backend override of `discovery.timeout_ms`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovery_timeout_ms: Option<u64>,
}

impl BackendConfig {
    pub fn stdio(name: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self::with_transport(
            name,
            BackendTransport::Stdio {
                command: command.into(),
                args,
                envs: HashMap::new(),
            },
        )
    }

    pub fn streamable(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self::with_transport(
            name,
            BackendTransport::Streamable {
                url: url.into(),
                token: None,
                headers: HashMap::new(),
            },
        )
    }

    pub fn with_transport(name: impl Into<String>, transport: BackendTransport) -> Self {
        Self {
            name: name.into(),
            transport,
            proxy: None,
            required: false,
            discovery_timeout_ms: None,
        }
    }
}

#[derive(Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum BackendTransport {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        envs: HashMap<String, String>,
    },
    Sse {
        url: String,
        /// Bearer token for Authorization header
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        /// These affect backend identity and are hashed, never compared in plaintext
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
    },
    Streamable {
        url: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
    },
}

impl fmt::Debug for BackendTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendTransport::Stdio {
                command,
                args,
                envs,
            } => f
                .debug_struct("Stdio")
                .field("command", command)
                .field("args", args)
                .field("envs", &format!("{} vars", envs.len()))
                .finish(),
            BackendTransport::Sse {
                url,
                token,
                headers,
            } => f
                .debug_struct("Sse")
                .field("url", url)
                .field("token", &token.as_ref().map(|_| "****"))
                .field("headers", &format!("{} headers", headers.len()))
                .finish(),
            BackendTransport::Streamable {
                url,
                token,
                headers,
            } => f
                .debug_struct("Streamable")
                .field("url", url)
                .field("token", &token.as_ref().map(|_| "****"))
                .field("headers", &format!("{} headers", headers.len()))
                .finish(),
        }
    }
}

/// MCP-specific proxy configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// HTTP proxy URL (e.g., "http://proxy.internal:8080")
    pub http: Option<String>,

    pub https: Option<String>,

    /// Comma-separated hosts to exclude from proxying
    pub no_proxy: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl ProxyConfig {
    /// Load proxy config from standard environment variables
    pub fn from_env() -> Option<Self> {
        let http = std::env::var("MCP_HTTP_PROXY")
            .ok()
            .or_else(|| std::env::var("HTTP_PROXY").ok());

        let https = std::env::var("MCP_HTTPS_PROXY")
            .ok()
            .or_else(|| std::env::var("HTTPS_PROXY").ok());

        let no_proxy = std::env::var("MCP_NO_PROXY")
            .ok()
            .or_else(|| std::env::var("NO_PROXY").ok());

        if http.is_some() || https.is_some() {
            Some(Self {
                http,
                https,
                no_proxy,
                username: None,
                password: None,
            })
        } else {
            None
        }
    }
}

/// Tool and persona cache limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Entry TTL (seconds)
    #[serde(default = "default_tool_ttl")]
    pub tool_ttl: u64,

    /// Maximum entries per namespace (one namespace per backend)
    #[serde(default = "default_max_entries_per_namespace")]
    pub max_entries_per_namespace: usize,

    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Estimated memory ceiling across all entries (bytes)
    #[serde(default = "default_max_memory_bytes")]
    pub max_memory_bytes: usize,

    /// Background TTL sweep interval (seconds)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: u64,

    /// Fraction of `max_memory_bytes` that triggers a memory pressure warning
    #[serde(default = "default_memory_warning_ratio")]
    pub memory_warning_ratio: f64,
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.tool_ttl)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DiscoveryConfig {
    /// Per-backend `list_tools` timeout (milliseconds)
    #[serde(default = "default_discovery_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_true")]
    pub enable_refresh: bool,

    /// Background rediscovery interval (seconds)
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: u64,
}

impl DiscoveryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RoutingConfig {
    /// Per-call backend timeout (milliseconds)
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

impl RoutingConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PersonaSettings {
    /// Directory scanned for persona directories and `.htp` archives
    #[serde(default)]
    pub directory: Option<PathBuf>,

    /// Loaded persona cache TTL (seconds)
    #[serde(default = "default_persona_ttl")]
    pub cache_ttl: u64,

    /// Invalidate cached personas when their source files change
    #[serde(default = "default_true")]
    pub watch_sources: bool,

    /// Allow persona-bundled backends to replace a connected backend of the same name
    #[serde(default)]
    pub allow_backend_override: bool,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_tool_ttl() -> u64 {
    300 // 5 minutes
}

fn default_max_entries_per_namespace() -> usize {
    500
}

fn default_max_entries() -> usize {
    5_000
}

fn default_max_memory_bytes() -> usize {
    64 * 1024 * 1024
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_memory_warning_ratio() -> f64 {
    0.8
}

fn default_discovery_timeout_ms() -> u64 {
    10_000
}

fn default_refresh_interval() -> u64 {
    60 // 1 minute
}

fn default_call_timeout_ms() -> u64 {
    60_000
}

fn default_persona_ttl() -> u64 {
    600
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            tool_ttl: default_tool_ttl(),
            max_entries_per_namespace: default_max_entries_per_namespace(),
            max_entries: default_max_entries(),
            max_memory_bytes: default_max_memory_bytes(),
            sweep_interval: default_sweep_interval(),
            memory_warning_ratio: default_memory_warning_ratio(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_discovery_timeout_ms(),
            enable_refresh: true,
            refresh_interval: default_refresh_interval(),
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

impl Default for PersonaSettings {
    fn default() -> Self {
        Self {
            directory: None,
            cache_ttl: default_persona_ttl(),
            watch_sources: true,
            allow_backend_override: false,
        }
    }
}

/// Backend names become namespaces (`backend.tool`), so they must not
/// contain the namespace separator.
pub fn validate_backend_name(name: &str) -> Result<(), String> {
    if name.trim().is_empty() {
        return Err("backend name must not be empty".to_string());
    }
    if name.contains('.') || name.contains('#') || name.chars().any(char::is_whitespace) {
        return Err(format!(
            "backend name '{}' must not contain '.', '#' or whitespace",
            name
        ));
    }
    Ok(())
}

impl GatewayConfig {
    /// Load configuration from a YAML file
    pub async fn from_file(path: &str) -> GatewayResult<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> GatewayResult<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Merge with environment-based proxy config
    #[must_use]
    pub fn with_env_proxy(mut self) -> Self {
        if self.proxy.is_none() {
            self.proxy = ProxyConfig::from_env();
        }
        self
    }

    pub fn validate(&self) -> GatewayResult<()> {
        let mut seen = HashSet::new();
        for server in &self.servers {
            validate_backend_name(&server.name).map_err(GatewayError::Config)?;
            if !seen.insert(server.name.as_str()) {
                return Err(GatewayError::Config(format!(
                    "duplicate server name '{}'",
                    server.name
                )));
            }
        }

        let cache = &self.cache;
        if cache.max_entries == 0 || cache.max_entries_per_namespace == 0 {
            return Err(GatewayError::Config(
                "cache capacities must be greater than zero".to_string(),
            ));
        }
        if cache.max_memory_bytes == 0 {
            return Err(GatewayError::Config(
                "cache.max_memory_bytes must be greater than zero".to_string(),
            ));
        }
        if !(cache.memory_warning_ratio > 0.0 && cache.memory_warning_ratio <= 1.0) {
            return Err(GatewayError::Config(format!(
                "cache.memory_warning_ratio must be in (0, 1], got {}",
                cache.memory_warning_ratio
            )));
        }
        if self.discovery.timeout_ms == 0 {
            return Err(GatewayError::Config(
                "discovery.timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_cache_config() {
        let config = CacheConfig::default();
        assert_eq!(config.tool_ttl, 300);
        assert_eq!(config.max_entries_per_namespace, 500);
        assert!((config.memory_warning_ratio - 0.8).abs() < f64::EPSILON);
        assert_eq!(config.ttl(), Duration::from_secs(300));
    }

    #[test]
    fn test_yaml_minimal_config() {
        let yaml = r#"
servers:
  - name: "git"
    protocol: stdio
    command: "mcp-git"
"#;

        let config = GatewayConfig::from_yaml_str(yaml).expect("Failed to parse YAML");
        assert_eq!(config.servers.len(), 1);
        assert_eq!(config.servers[0].name, "git");
        assert!(!config.servers[0].required);
        assert!(config.servers[0].proxy.is_none());
        assert_eq!(config.cache.tool_ttl, 300);
        assert_eq!(config.discovery.timeout_ms, 10_000);
        assert!(config.personas.watch_sources);
        assert!(!config.personas.allow_backend_override);
    }

    #[test]
    fn test_yaml_full_config() {
        let yaml = r#"
proxy:
  http: "http://global-proxy:8080"
  no_proxy: "localhost,127.0.0.1"

cache:
  tool_ttl: 60
  max_entries_per_namespace: 10
  max_entries: 100
  max_memory_bytes: 1048576
  sweep_interval: 5

discovery:
  timeout_ms: 2500
  refresh_interval: 120

routing:
  call_timeout_ms: 1000

personas:
  directory: "/etc/toolgate/personas"
  cache_ttl: 30
  allow_backend_override: true

logging:
  level: debug
  json: true

servers:
  - name: "docker"
    protocol: streamable
    url: "https://mcp.example.com/mcp"
    token: "secret-token"
    required: true
    discovery_timeout_ms: 500

  - name: "git"
    protocol: stdio
    command: "mcp-git"
    args: ["--repo", "."]
    proxy:
      http: "http://server-specific-proxy:9090"
"#;

        let config = GatewayConfig::from_yaml_str(yaml).expect("Failed to parse YAML");
        assert_eq!(config.cache.max_entries_per_namespace, 10);
        assert_eq!(config.discovery.timeout(), Duration::from_millis(2500));
        assert_eq!(config.routing.call_timeout(), Duration::from_secs(1));
        assert_eq!(
            config.personas.directory,
            Some(PathBuf::from("/etc/toolgate/personas"))
        );
        assert!(config.personas.allow_backend_override);
        assert!(config.logging.json);

        assert!(config.servers[0].required);
        assert_eq!(config.servers[0].discovery_timeout_ms, Some(500));
        match &config.servers[0].transport {
            BackendTransport::Streamable { url, token, .. } => {
                assert_eq!(url, "https://mcp.example.com/mcp");
                assert_eq!(token.as_deref(), Some("secret-token"));
            }
            other => panic!("Expected Streamable transport, got {:?}", other),
        }
        assert!(config.servers[1].proxy.is_some());
    }

    #[test]
    fn test_duplicate_server_names_rejected() {
        let yaml = r#"
servers:
  - name: "git"
    protocol: stdio
    command: "a"
  - name: "git"
    protocol: stdio
    command: "b"
"#;
        let err = GatewayConfig::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("duplicate server name"));
    }

    #[test]
    fn test_backend_name_with_separator_rejected() {
        assert!(validate_backend_name("git").is_ok());
        assert!(validate_backend_name("my-server_2").is_ok());
        assert!(validate_backend_name("git.hub").is_err());
        assert!(validate_backend_name("").is_err());
        assert!(validate_backend_name("a b").is_err());
    }

    #[test]
    fn test_invalid_warning_ratio_rejected() {
        let mut config = GatewayConfig::default();
        config.cache.memory_warning_ratio = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_transport_debug_masks_token() {
        let transport = BackendTransport::Sse {
            url: "http://localhost:3000/sse".to_string(),
            token: Some("super-secret".to_string()),
            headers: HashMap::new(),
        };
        let rendered = format!("{:?}", transport);
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("****"));
    }

    #[test]
    #[serial_test::serial]
    fn test_proxy_from_env_with_vars() {
        std::env::set_var("MCP_HTTP_PROXY", "http://test-proxy:8080");
        std::env::set_var("MCP_NO_PROXY", "localhost,127.0.0.1");

        let proxy = ProxyConfig::from_env().expect("proxy from env");
        assert_eq!(proxy.http.as_deref(), Some("http://test-proxy:8080"));
        assert_eq!(proxy.no_proxy.as_deref(), Some("localhost,127.0.0.1"));

        std::env::remove_var("MCP_HTTP_PROXY");
        std::env::remove_var("MCP_NO_PROXY");
    }
}
