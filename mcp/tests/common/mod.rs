//! Shared fixtures for gateway integration tests: in-process backends and
//! gateway construction without any real transport.

#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use toolgate_mcp::{
    BackendConfig, BackendConnection, BackendStatus, Gateway, GatewayConfig, GatewayError,
    GatewayResult, StaticConnector, ToolDescriptor, ToolOutput,
};

/// How an in-memory backend answers `invoke`.
#[derive(Debug, Clone)]
pub enum Reply {
    Echo,
    ToolError(String),
    Fail(String),
    Unreachable,
    Hang,
}

/// Backend living in the test process. Records every invocation.
pub struct MemoryBackend {
    name: String,
    tools: Mutex<Vec<ToolDescriptor>>,
    reply: Mutex<Reply>,
    calls: Mutex<Vec<String>>,
    closed: Mutex<bool>,
    list_delay: Mutex<Option<Duration>>,
}

impl MemoryBackend {
    pub fn new(name: &str, tools: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            tools: Mutex::new(
                tools
                    .iter()
                    .map(|t| ToolDescriptor::new(*t).with_description(format!("{name} {t}")))
                    .collect(),
            ),
            reply: Mutex::new(Reply::Echo),
            calls: Mutex::new(Vec::new()),
            closed: Mutex::new(false),
            list_delay: Mutex::new(None),
        })
    }

    pub fn set_reply(&self, reply: Reply) {
        *self.reply.lock() = reply;
    }

    /// Delay every `list_tools` answer.
    pub fn set_list_delay(&self, delay: Duration) {
        *self.list_delay.lock() = Some(delay);
    }

    pub fn set_tools(&self, tools: &[&str]) {
        *self.tools.lock() = tools.iter().map(|t| ToolDescriptor::new(*t)).collect();
    }

    /// Replace one tool's schema, changing its structure hash.
    pub fn reshape(&self, tool: &str, schema: Value) {
        for descriptor in self.tools.lock().iter_mut() {
            if descriptor.name == tool {
                descriptor.input_schema = schema.clone();
            }
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }

    pub fn config(&self) -> BackendConfig {
        BackendConfig::stdio(self.name.clone(), format!("{}-server", self.name), vec![])
    }
}

#[async_trait]
impl BackendConnection for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_tools(&self) -> GatewayResult<Vec<ToolDescriptor>> {
        let delay = *self.list_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.tools.lock().clone())
    }

    async fn invoke(
        &self,
        tool_name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> GatewayResult<ToolOutput> {
        self.calls.lock().push(tool_name.to_string());
        let reply = self.reply.lock().clone();
        match reply {
            Reply::Echo => Ok(ToolOutput::success(json!({
                "backend": self.name,
                "tool": tool_name,
                "arguments": arguments.map(Value::Object).unwrap_or(Value::Null),
            }))),
            Reply::ToolError(message) => Ok(ToolOutput {
                content: json!({ "error": message }),
                is_error: true,
            }),
            Reply::Fail(message) => Err(GatewayError::ToolExecution(message)),
            Reply::Unreachable => Err(GatewayError::ServerDisconnected(self.name.clone())),
            Reply::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(ToolOutput::success(Value::Null))
            }
        }
    }

    fn status(&self) -> BackendStatus {
        BackendStatus::Connected
    }

    async fn close(&self) {
        *self.closed.lock() = true;
    }
}

/// Configuration for `backends` with background refresh off, so tests
/// control when discovery runs.
pub fn config_for(backends: &[&Arc<MemoryBackend>]) -> GatewayConfig {
    let mut config = GatewayConfig {
        servers: backends.iter().map(|b| b.config()).collect(),
        ..GatewayConfig::default()
    };
    config.discovery.enable_refresh = false;
    config.personas.watch_sources = false;
    config
}

pub fn connector_for(backends: &[&Arc<MemoryBackend>]) -> StaticConnector {
    backends.iter().fold(StaticConnector::new(), |connector, b| {
        connector.with_connection(Arc::clone(*b) as Arc<dyn BackendConnection>)
    })
}

pub async fn gateway_with(backends: &[&Arc<MemoryBackend>]) -> Gateway {
    Gateway::with_connector(config_for(backends), Arc::new(connector_for(backends)))
        .await
        .unwrap()
}

/// The git, docker and fs backends used across the gateway tests.
pub struct Fleet {
    pub git: Arc<MemoryBackend>,
    pub docker: Arc<MemoryBackend>,
    pub fs: Arc<MemoryBackend>,
}

impl Fleet {
    pub fn new() -> Self {
        Self {
            git: MemoryBackend::new("git", &["status", "log", "diff"]),
            docker: MemoryBackend::new("docker", &["ps", "status", "logs"]),
            fs: MemoryBackend::new("fs", &["read_file", "write_file"]),
        }
    }

    pub fn all(&self) -> [&Arc<MemoryBackend>; 3] {
        [&self.git, &self.docker, &self.fs]
    }

    pub async fn gateway(&self) -> Gateway {
        gateway_with(&self.all()).await
    }
}
