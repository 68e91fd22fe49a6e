//! Toolset resolution: filter discovered tools per backend, namespace them
//! and resolve cross-backend name collisions.
//!
//! Output order is always (backend, local name), so identical inputs give
//! identical toolsets.

use std::collections::{BTreeMap, HashMap, HashSet};

use regex::Regex;
use tracing::{debug, warn};

use super::{
    spec::{ConflictStrategy, ServerSelection, ToolsetSpecification},
    types::{ResolutionOutcome, ResolutionStats, ResolvedConflict, ResolvedTool, ResolvedToolset},
};
use crate::{discovery::DiscoveredTool, error::ResolutionError};

struct Selected<'a> {
    tool: &'a DiscoveredTool,
    namespace: Option<String>,
    exposed: String,
}

/// Resolve `spec` against a discovery snapshot.
pub fn apply(
    spec: &ToolsetSpecification,
    discovered: &[DiscoveredTool],
) -> Result<ResolutionOutcome, ResolutionError> {
    spec.validate_structure()?;

    let mut by_server: BTreeMap<&str, Vec<&DiscoveredTool>> = BTreeMap::new();
    for tool in discovered {
        by_server.entry(tool.server()).or_default().push(tool);
    }
    for tools in by_server.values_mut() {
        tools.sort_by(|a, b| a.local_name().cmp(b.local_name()));
    }

    let mut warnings = Vec::new();
    let mut selected: Vec<Selected<'_>> = Vec::new();
    let mut per_backend = BTreeMap::new();

    for server in spec.servers.iter().filter(|s| s.enabled) {
        let Some(tools) = by_server.get(server.server_name.as_str()) else {
            let warning = format!(
                "server '{}' is not among the discovered backends",
                server.server_name
            );
            warn!(toolset = %spec.name, "{}", warning);
            warnings.push(warning);
            per_backend.insert(server.server_name.clone(), 0);
            continue;
        };

        let chosen = select_for_server(server, tools, &mut warnings)?;
        per_backend.insert(server.server_name.clone(), chosen.len());
        selected.extend(chosen);
    }

    let conflicts = resolve_collisions(spec, &mut selected)?;

    selected.sort_by(|a, b| a.tool.name.cmp(&b.tool.name));
    let tools: Vec<ResolvedTool> = selected
        .into_iter()
        .map(|s| ResolvedTool {
            original_name: s.tool.local_name().to_string(),
            exposed_name: s.exposed,
            server: s.tool.server().to_string(),
            namespace: s.namespace,
            reference: s.tool.name.clone(),
            structure_hash: s.tool.structure_hash.clone(),
            description: s.tool.description.clone(),
            input_schema: s.tool.input_schema.clone(),
        })
        .collect();

    let stats = ResolutionStats {
        total_discovered: discovered.len(),
        total_included: tools.len(),
        total_excluded: discovered.len().saturating_sub(tools.len()),
        per_backend,
    };

    debug!(
        toolset = %spec.name,
        included = stats.total_included,
        excluded = stats.total_excluded,
        conflicts = conflicts.len(),
        "Toolset resolved"
    );

    Ok(ResolutionOutcome {
        toolset: ResolvedToolset::new(spec.name.clone(), tools),
        conflicts,
        warnings,
        stats,
    })
}

fn select_for_server<'a>(
    server: &ServerSelection,
    tools: &[&'a DiscoveredTool],
    warnings: &mut Vec<String>,
) -> Result<Vec<Selected<'a>>, ResolutionError> {
    let selection = &server.tools;
    let pattern = selection
        .include_pattern
        .as_deref()
        .map(|p| {
            Regex::new(p).map_err(|e| ResolutionError::InvalidPattern {
                server: server.server_name.clone(),
                pattern: p.to_string(),
                message: e.to_string(),
            })
        })
        .transpose()?;

    let include_all = selection.includes_all();
    let include: HashSet<&str> = selection.include.iter().map(String::as_str).collect();
    let exclude: HashSet<&str> = selection.exclude.iter().map(String::as_str).collect();

    let known: HashSet<&str> = tools.iter().map(|t| t.local_name()).collect();
    for name in &selection.include {
        if !known.contains(name.as_str()) {
            warnings.push(format!(
                "tool '{}' listed for server '{}' was not discovered",
                name, server.server_name
            ));
        }
    }

    let namespace = server.namespace().map(str::to_string);

    Ok(tools
        .iter()
        .filter(|tool| {
            let name = tool.local_name();
            include.contains(name)
                || pattern.as_ref().is_some_and(|re| re.is_match(name))
                || include_all
        })
        .filter(|tool| !exclude.contains(tool.local_name()))
        .map(|&tool| Selected {
            tool,
            exposed: match &namespace {
                Some(ns) => format!("{}.{}", ns, tool.local_name()),
                None => tool.local_name().to_string(),
            },
            namespace: namespace.clone(),
        })
        .collect())
}

fn collision_servers(selected: &[Selected<'_>], members: &[usize]) -> Vec<String> {
    let mut servers: Vec<String> = members
        .iter()
        .map(|&i| selected[i].tool.server().to_string())
        .collect();
    servers.sort();
    servers
}

fn resolve_collisions(
    spec: &ToolsetSpecification,
    selected: &mut [Selected<'_>],
) -> Result<Vec<ResolvedConflict>, ResolutionError> {
    let strategy = spec.options.conflict_resolution;

    let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (i, s) in selected.iter().enumerate() {
        groups.entry(s.exposed.clone()).or_default().push(i);
    }

    let mut conflicts = Vec::new();
    for (name, mut members) in groups.into_iter().filter(|(_, m)| m.len() > 1) {
        if !spec.options.auto_resolve || strategy == ConflictStrategy::Error {
            return Err(ResolutionError::UnresolvedConflict {
                servers: collision_servers(selected, &members),
                name,
            });
        }

        members.sort_by(|&a, &b| selected[a].tool.name.cmp(&selected[b].tool.name));
        let mut renamed = Vec::with_capacity(members.len());
        for &i in &members {
            let entry = &mut selected[i];
            let server = entry.tool.server().to_string();
            let local = entry.tool.local_name();
            let (exposed, namespace) = if entry.namespace.is_some() {
                // namespaced tools that still collide share a custom namespace
                (format!("{}.{}", server, local), Some(server.clone()))
            } else {
                match strategy {
                    ConflictStrategy::PrefixServer => (format!("{}_{}", server, local), None),
                    _ => (format!("{}.{}", server, local), Some(server.clone())),
                }
            };
            entry.exposed = exposed.clone();
            entry.namespace = namespace;
            renamed.push((server, exposed));
        }

        warn!(
            toolset = %spec.name,
            tool = %name,
            strategy = ?strategy,
            "Resolved tool name collision"
        );
        conflicts.push(ResolvedConflict {
            name,
            strategy,
            renamed,
        });
    }

    // renaming can itself collide with an untouched name
    let mut seen: HashMap<&str, usize> = HashMap::new();
    for (i, s) in selected.iter().enumerate() {
        if let Some(&first) = seen.get(s.exposed.as_str()) {
            return Err(ResolutionError::UnresolvedConflict {
                name: s.exposed.clone(),
                servers: collision_servers(selected, &[first, i]),
            });
        }
        seen.insert(s.exposed.as_str(), i);
    }

    Ok(conflicts)
}
