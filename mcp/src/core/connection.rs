//! Backend connection abstraction and the rmcp-backed implementation.
//!
//! The gateway core only sees [`BackendConnection`]: list tools, invoke a tool,
//! report status. Establishing connections is the job of a [`BackendConnector`].

use std::{borrow::Cow, collections::HashMap, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use parking_lot::{Mutex, RwLock};
use rmcp::{
    model::{CallToolRequestParam, Tool},
    service::{ClientInitializeError, Peer, RunningService, ServiceError},
    transport::{
        sse_client::SseClientConfig, streamable_http_client::StreamableHttpClientTransportConfig,
        ConfigureCommandExt, SseClientTransport, StreamableHttpClientTransport, TokioChildProcess,
    },
    RoleClient, ServiceExt,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{error, info, warn};

use super::{
    config::{BackendConfig, BackendTransport, ProxyConfig},
    proxy,
};
use crate::error::{GatewayError, GatewayResult};

type McpClient = RunningService<RoleClient, ()>;

/// Connection health as reported by a backend or observed by discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendStatus {
    #[default]
    Connected,
    Degraded,
    Disconnected,
}

impl fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendStatus::Connected => "connected",
            BackendStatus::Degraded => "degraded",
            BackendStatus::Disconnected => "disconnected",
        })
    }
}

/// One tool as listed by a backend, before normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "empty_schema")]
    pub input_schema: Value,
}

fn empty_schema() -> Value {
    Value::Object(Map::new())
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            input_schema: empty_schema(),
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn with_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }
}

impl From<Tool> for ToolDescriptor {
    fn from(tool: Tool) -> Self {
        Self {
            name: tool.name.to_string(),
            description: tool.description.map(|d| d.to_string()),
            input_schema: Value::Object((*tool.input_schema).clone()),
        }
    }
}

/// Structured result of a tool invocation, passed through unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub content: Value,
    /// Backend-reported tool failure (the call itself reached the backend).
    #[serde(default)]
    pub is_error: bool,
}

impl ToolOutput {
    pub fn success(content: Value) -> Self {
        Self {
            content,
            is_error: false,
        }
    }
}

/// A live connection to one MCP backend.
#[async_trait]
pub trait BackendConnection: Send + Sync {
    fn name(&self) -> &str;

    async fn list_tools(&self) -> GatewayResult<Vec<ToolDescriptor>>;

    async fn invoke(
        &self,
        tool_name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> GatewayResult<ToolOutput>;

    fn status(&self) -> BackendStatus;

    /// Release the underlying transport. Default is a no-op.
    async fn close(&self) {}
}

/// Establishes backend connections from configuration.
#[async_trait]
pub trait BackendConnector: Send + Sync {
    async fn connect(&self, config: &BackendConfig) -> GatewayResult<Arc<dyn BackendConnection>>;
}

/// Connection over an rmcp client session.
pub struct RmcpConnection {
    name: String,
    peer: Peer<RoleClient>,
    /// Taken on close
    session: Mutex<Option<McpClient>>,
    status: RwLock<BackendStatus>,
}

impl RmcpConnection {
    fn new(name: String, client: McpClient) -> Self {
        Self {
            name,
            peer: client.peer().clone(),
            session: Mutex::new(Some(client)),
            status: RwLock::new(BackendStatus::Connected),
        }
    }

    fn record(&self, ok: bool) {
        let mut status = self.status.write();
        *status = if ok {
            BackendStatus::Connected
        } else {
            BackendStatus::Degraded
        };
    }
}

#[async_trait]
impl BackendConnection for RmcpConnection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_tools(&self) -> GatewayResult<Vec<ToolDescriptor>> {
        let result = self.peer.list_all_tools().await;
        self.record(result.is_ok());
        let tools = result.map_err(|e| service_error(&self.name, "list tools", e))?;
        Ok(tools.into_iter().map(ToolDescriptor::from).collect())
    }

    async fn invoke(
        &self,
        tool_name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> GatewayResult<ToolOutput> {
        let request = CallToolRequestParam {
            name: Cow::Owned(tool_name.to_string()),
            arguments,
        };

        let result = self.peer.call_tool(request).await;
        self.record(result.is_ok());
        let result = result.map_err(|e| service_error(&self.name, tool_name, e))?;

        let is_error = result.is_error.unwrap_or(false);
        Ok(ToolOutput {
            content: serde_json::to_value(&result)?,
            is_error,
        })
    }

    fn status(&self) -> BackendStatus {
        *self.status.read()
    }

    async fn close(&self) {
        let session = self.session.lock().take();
        if let Some(session) = session {
            if let Err(e) = session.cancel().await {
                warn!("Error disconnecting from server '{}': {}", self.name, e);
            }
        }
        *self.status.write() = BackendStatus::Disconnected;
    }
}

/// Classify an rmcp request failure. Only an error the backend answered with
/// is a tool failure; a closed or broken session means the backend is gone.
fn service_error(server: &str, operation: &str, error: ServiceError) -> GatewayError {
    match error {
        ServiceError::McpError(e) => GatewayError::ToolExecution(format!(
            "'{}' on '{}' failed with MCP error {}: {}",
            operation, server, e.code.0, e.message
        )),
        ServiceError::TransportClosed | ServiceError::Cancelled { .. } => {
            GatewayError::ServerDisconnected(server.to_string())
        }
        ServiceError::TransportSend(e) => {
            GatewayError::Transport(format!("'{}' on '{}': {}", operation, server, e))
        }
        ServiceError::Timeout { timeout } => GatewayError::Timeout {
            operation: format!("'{}' on '{}'", operation, server),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        },
        other => GatewayError::ToolExecution(format!(
            "'{}' on '{}': {}",
            operation, server, other
        )),
    }
}

const HANDSHAKE_REJECTED: &str = "handshake rejected";

/// A server that answered initialize with something other than an MCP
/// initialize result will not do better on retry.
fn handshake_error(transport: &str, error: ClientInitializeError) -> GatewayError {
    match error {
        ClientInitializeError::ExpectedInitResponse(_)
        | ClientInitializeError::ExpectedInitResult(_)
        | ClientInitializeError::ConflictInitResponseId(..) => GatewayError::ConnectionFailed(
            format!("{} by {} server: {}", HANDSHAKE_REJECTED, transport, error),
        ),
        other => GatewayError::ConnectionFailed(format!("initialize {} client: {}", transport, other)),
    }
}

/// Connects to stdio, SSE and streamable HTTP backends with rmcp.
#[derive(Debug, Clone, Default)]
pub struct RmcpConnector {
    global_proxy: Option<ProxyConfig>,
}

impl RmcpConnector {
    pub fn new(global_proxy: Option<ProxyConfig>) -> Self {
        Self { global_proxy }
    }

    /// Connect with exponential backoff retry for remote servers
    async fn connect_with_retry(&self, config: &BackendConfig) -> GatewayResult<McpClient> {
        let backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_secs(1))
            .with_max_interval(Duration::from_secs(30))
            .with_max_elapsed_time(Some(Duration::from_secs(30)))
            .build();

        backoff::future::retry(backoff, || async {
            match self.connect_impl(config).await {
                Ok(client) => Ok(client),
                Err(e) => {
                    if is_permanent_error(&e) {
                        error!(
                            server = %config.name,
                            error = %e,
                            "Permanent error connecting - not retrying"
                        );
                        Err(backoff::Error::permanent(e))
                    } else {
                        warn!(server = %config.name, error = %e, "Failed to connect, retrying");
                        Err(backoff::Error::transient(e))
                    }
                }
            }
        })
        .await
    }

    async fn connect_impl(&self, config: &BackendConfig) -> GatewayResult<McpClient> {
        info!(
            "Connecting to MCP server '{}' via {:?}",
            config.name, config.transport
        );

        match &config.transport {
            BackendTransport::Stdio {
                command,
                args,
                envs,
            } => {
                let transport = TokioChildProcess::new(
                    tokio::process::Command::new(command).configure(|cmd| {
                        cmd.args(args)
                            .envs(envs.iter())
                            .stderr(std::process::Stdio::inherit());
                    }),
                )
                .map_err(|e| GatewayError::Transport(format!("create stdio transport: {}", e)))?;

                ().serve(transport)
                    .await
                    .map_err(|e| handshake_error("stdio", e))
            }

            BackendTransport::Sse {
                url,
                token,
                headers,
            } => {
                let proxy_config = proxy::resolve_proxy_config(config, self.global_proxy.as_ref());
                let http_client = proxy::build_http_client(proxy_config, token, headers)?;

                let sse_config = SseClientConfig {
                    sse_endpoint: url.clone().into(),
                    ..Default::default()
                };

                let transport = SseClientTransport::start_with_client(http_client, sse_config)
                    .await
                    .map_err(|e| GatewayError::Transport(format!("create SSE transport: {}", e)))?;

                ().serve(transport)
                    .await
                    .map_err(|e| handshake_error("SSE", e))
            }

            BackendTransport::Streamable {
                url,
                token,
                headers,
            } => {
                let proxy_config = proxy::resolve_proxy_config(config, self.global_proxy.as_ref());
                let http_client = proxy::build_http_client(proxy_config, token, headers)?;
                let cfg = StreamableHttpClientTransportConfig::with_uri(url.as_str());

                let transport = StreamableHttpClientTransport::with_client(http_client, cfg);

                ().serve(transport)
                    .await
                    .map_err(|e| handshake_error("streamable", e))
            }
        }
    }
}

#[async_trait]
impl BackendConnector for RmcpConnector {
    async fn connect(&self, config: &BackendConfig) -> GatewayResult<Arc<dyn BackendConnection>> {
        let needs_retry = matches!(
            &config.transport,
            BackendTransport::Sse { .. } | BackendTransport::Streamable { .. }
        );
        let client = if needs_retry {
            self.connect_with_retry(config).await?
        } else {
            self.connect_impl(config).await?
        };

        info!(server = %config.name, "Connected to MCP server");
        Ok(Arc::new(RmcpConnection::new(config.name.clone(), client)))
    }
}

/// Bad configuration and rejected handshakes are final. Transport and
/// session failures are retried until the back-off budget runs out.
fn is_permanent_error(error: &GatewayError) -> bool {
    match error {
        GatewayError::Config(_) | GatewayError::ServerNotFound(_) => true,
        GatewayError::ConnectionFailed(msg) => msg.starts_with(HANDSHAKE_REJECTED),
        _ => false,
    }
}

/// Connector that hands out pre-built connections by backend name.
///
/// Used to embed in-process backends and in tests.
#[derive(Default, Clone)]
pub struct StaticConnector {
    connections: HashMap<String, Arc<dyn BackendConnection>>,
}

impl StaticConnector {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_connection(mut self, connection: Arc<dyn BackendConnection>) -> Self {
        self.connections
            .insert(connection.name().to_string(), connection);
        self
    }
}

#[async_trait]
impl BackendConnector for StaticConnector {
    async fn connect(&self, config: &BackendConfig) -> GatewayResult<Arc<dyn BackendConnection>> {
        self.connections
            .get(&config.name)
            .cloned()
            .ok_or_else(|| GatewayError::ServerNotFound(config.name.clone()))
    }
}
