//! Maps a tool reference to its backend connection through the active
//! toolset only. Discovery is never consulted, so a toolset is a hard
//! boundary on what can be called.

use std::{fmt, sync::Arc};

use tracing::debug;

use crate::{
    core::{connection::BackendConnection, pool::ConnectionSet},
    discovery::ToolReference,
    error::RoutingError,
    toolset::{ResolvedTool, ResolvedToolset},
};

/// Where a call goes. The router only maps; it never invokes.
#[derive(Clone)]
pub struct RouteTarget {
    pub connection: Arc<dyn BackendConnection>,
    pub tool: ResolvedTool,
}

impl fmt::Debug for RouteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteTarget")
            .field("backend", &self.connection.name())
            .field("tool", &self.tool.reference)
            .finish()
    }
}

/// Resolve `reference` against `toolset` and find the owning connection.
///
/// Accepted forms: an exposed name, `server.tool`, `#<hash>`, or either name
/// form followed by `#<hash>`.
pub fn route(
    reference: &str,
    toolset: &ResolvedToolset,
    connections: &ConnectionSet,
) -> Result<RouteTarget, RoutingError> {
    let not_in_toolset = || RoutingError::ToolNotInActiveToolset {
        reference: reference.to_string(),
        toolset: toolset.name().to_string(),
    };

    let tool = if reference.contains('#') {
        let parsed = ToolReference::parse(reference).map_err(|_| not_in_toolset())?;
        let hash = parsed.hash().ok_or_else(not_in_toolset)?;
        let name = parsed.name_text();

        if name.is_empty() {
            match toolset.by_hash(hash).as_slice() {
                [] => return Err(not_in_toolset()),
                [one] => (*one).clone(),
                many => {
                    return Err(RoutingError::AmbiguousReference {
                        reference: reference.to_string(),
                        candidates: many.iter().map(|t| t.exposed_name.clone()).collect(),
                    })
                }
            }
        } else {
            let tool = toolset.get(name).ok_or_else(not_in_toolset)?;
            if !tool.matches_hash(hash) {
                return Err(RoutingError::StaleReference {
                    reference: reference.to_string(),
                    resolved: tool.reference.to_string(),
                    current_hash: tool.hash_id().to_string(),
                });
            }
            tool.clone()
        }
    } else {
        toolset.get(reference).ok_or_else(not_in_toolset)?.clone()
    };

    let connection = connections
        .connection(&tool.server)
        .ok_or_else(|| RoutingError::BackendUnavailable(tool.server.clone()))?;

    debug!(reference = %reference, target = %tool.reference, "Routed tool call");
    Ok(RouteTarget { connection, tool })
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::{json, Map, Value};

    use super::*;
    use crate::{
        core::{
            config::BackendConfig,
            connection::{BackendStatus, ToolDescriptor, ToolOutput},
            pool::BackendEntry,
        },
        discovery::DiscoveredTool,
        error::GatewayResult,
        toolset::{self, ServerSelection, ToolSelection, ToolsetSpecification},
    };

    struct Named(&'static str);

    #[async_trait]
    impl BackendConnection for Named {
        fn name(&self) -> &str {
            self.0
        }

        async fn list_tools(&self) -> GatewayResult<Vec<ToolDescriptor>> {
            Ok(Vec::new())
        }

        async fn invoke(
            &self,
            _tool_name: &str,
            _arguments: Option<Map<String, Value>>,
        ) -> GatewayResult<ToolOutput> {
            Ok(ToolOutput::success(json!(null)))
        }

        fn status(&self) -> BackendStatus {
            BackendStatus::Connected
        }
    }

    fn discovered() -> Vec<DiscoveredTool> {
        let now = Utc::now();
        [("git", "status"), ("git", "log"), ("docker", "ps"), ("docker", "status")]
            .into_iter()
            .map(|(server, name)| {
                DiscoveredTool::from_descriptor(server, ToolDescriptor::new(name), now).unwrap()
            })
            .collect()
    }

    fn connections() -> ConnectionSet {
        ConnectionSet::from_entries(["git", "docker"].into_iter().map(|name| {
            let conn: Arc<dyn BackendConnection> = Arc::new(Named(name));
            BackendEntry::new(BackendConfig::stdio(name, "unused", vec![]), conn)
        }))
    }

    fn scenario_toolset() -> ResolvedToolset {
        let spec = ToolsetSpecification::new("dev")
            .with_server(ServerSelection::new("git"))
            .with_server(ServerSelection::new("docker").with_tools(ToolSelection::only(["ps"])));
        toolset::apply(&spec, &discovered()).unwrap().toolset
    }

    #[test]
    fn test_routes_exposed_and_qualified_names() {
        let toolset = scenario_toolset();
        let conns = connections();

        let target = route("status", &toolset, &conns).unwrap();
        assert_eq!(target.connection.name(), "git");
        assert_eq!(target.tool.original_name, "status");

        let target = route("docker.ps", &toolset, &conns).unwrap();
        assert_eq!(target.connection.name(), "docker");
    }

    #[test]
    fn test_excluded_tool_is_not_routable() {
        let toolset = scenario_toolset();
        let err = route("docker.status", &toolset, &connections()).unwrap_err();
        assert_eq!(
            err,
            RoutingError::ToolNotInActiveToolset {
                reference: "docker.status".into(),
                toolset: "dev".into(),
            }
        );
    }

    #[test]
    fn test_hash_references() {
        let toolset = scenario_toolset();
        let conns = connections();
        let log = toolset.get("log").unwrap().clone();

        let by_hash = route(&format!("#{}", log.hash_id()), &toolset, &conns).unwrap();
        assert_eq!(by_hash.tool.exposed_name, "log");

        let agreed = route(&format!("log#{}", log.hash_id()), &toolset, &conns).unwrap();
        assert_eq!(agreed.tool.reference, log.reference);

        let stale = route(&format!("status#{}", log.hash_id()), &toolset, &conns).unwrap_err();
        assert!(matches!(stale, RoutingError::StaleReference { .. }));
    }

    #[test]
    fn test_ambiguous_hash() {
        // same name and schema on two backends gives the same structure hash
        let spec = ToolsetSpecification::include_all("all", ["git", "docker"]);
        let toolset = toolset::apply(&spec, &discovered()).unwrap().toolset;
        let hash = toolset.get("git.status").unwrap().hash_id().to_string();

        let err = route(&format!("#{}", hash), &toolset, &connections()).unwrap_err();
        match err {
            RoutingError::AmbiguousReference { candidates, .. } => {
                assert_eq!(candidates, vec!["docker.status", "git.status"]);
            }
            other => panic!("expected ambiguity, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_connection() {
        let toolset = scenario_toolset();
        let only_git = ConnectionSet::new().with(BackendEntry::new(
            BackendConfig::stdio("git", "unused", vec![]),
            Arc::new(Named("git")),
        ));
        assert_eq!(
            route("ps", &toolset, &only_git).unwrap_err(),
            RoutingError::BackendUnavailable("docker".into())
        );
    }
}
