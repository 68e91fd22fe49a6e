//! Resolved toolset values. Immutable once produced.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use serde_json::Value;

use super::spec::ConflictStrategy;
use crate::discovery::{QualifiedToolName, MIN_HASH_PREFIX_LEN, TOOL_ID_LEN};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedTool {
    pub original_name: String,
    /// Name clients call; unique within the toolset
    pub exposed_name: String,
    pub server: String,
    pub namespace: Option<String>,
    /// Stable `server.tool` reference
    pub reference: QualifiedToolName,
    pub structure_hash: String,
    pub description: Option<String>,
    pub input_schema: Value,
}

impl ResolvedTool {
    pub fn hash_id(&self) -> &str {
        let end = TOOL_ID_LEN.min(self.structure_hash.len());
        &self.structure_hash[..end]
    }

    pub fn matches_hash(&self, hash: &str) -> bool {
        hash.len() >= MIN_HASH_PREFIX_LEN && self.structure_hash.starts_with(hash)
    }
}

/// A collision that was resolved by renaming.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedConflict {
    pub name: String,
    pub strategy: ConflictStrategy,
    /// `(server, exposed name)` for every member of the collision
    pub renamed: Vec<(String, String)>,
}

impl ResolvedConflict {
    pub fn servers(&self) -> Vec<&str> {
        self.renamed.iter().map(|(s, _)| s.as_str()).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResolutionStats {
    pub total_discovered: usize,
    pub total_included: usize,
    pub total_excluded: usize,
    pub per_backend: BTreeMap<String, usize>,
}

/// Conflict-free tool list with lookup indexes.
#[derive(Debug, Clone, Default)]
pub struct ResolvedToolset {
    name: String,
    tools: Vec<ResolvedTool>,
    by_exposed: HashMap<String, usize>,
    by_reference: HashMap<String, usize>,
}

impl ResolvedToolset {
    /// Exposed names must already be unique.
    pub(crate) fn new(name: impl Into<String>, tools: Vec<ResolvedTool>) -> Self {
        let by_exposed = tools
            .iter()
            .enumerate()
            .map(|(i, t)| (t.exposed_name.clone(), i))
            .collect();
        let by_reference = tools
            .iter()
            .enumerate()
            .map(|(i, t)| (t.reference.to_string(), i))
            .collect();
        Self {
            name: name.into(),
            tools,
            by_exposed,
            by_reference,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tools(&self) -> &[ResolvedTool] {
        &self.tools
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.iter().map(|t| t.exposed_name.as_str())
    }

    pub fn by_exposed_name(&self, name: &str) -> Option<&ResolvedTool> {
        self.by_exposed.get(name).and_then(|&i| self.tools.get(i))
    }

    pub fn by_reference(&self, reference: &str) -> Option<&ResolvedTool> {
        self.by_reference.get(reference).and_then(|&i| self.tools.get(i))
    }

    pub fn by_hash(&self, hash: &str) -> Vec<&ResolvedTool> {
        self.tools.iter().filter(|t| t.matches_hash(hash)).collect()
    }

    /// Exposed name first, then `server.tool`.
    pub fn get(&self, name: &str) -> Option<&ResolvedTool> {
        self.by_exposed_name(name)
            .or_else(|| self.by_reference(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }
}

/// Output of one resolution run.
#[derive(Debug, Clone)]
pub struct ResolutionOutcome {
    pub toolset: ResolvedToolset,
    pub conflicts: Vec<ResolvedConflict>,
    pub warnings: Vec<String>,
    pub stats: ResolutionStats,
}
