//! Discovered tools, content hashes and tool references.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    cache::CacheWeight,
    core::connection::{BackendStatus, ToolDescriptor},
    error::{GatewayError, GatewayResult, ReferenceError},
};

/// Length of the short content-hash id (hex chars).
pub const TOOL_ID_LEN: usize = 16;

/// Shortest hash prefix accepted in a reference.
pub const MIN_HASH_PREFIX_LEN: usize = 8;

/// Backend name plus local tool name, displayed as `backend.tool`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QualifiedToolName {
    pub server: String,
    pub tool: String,
}

impl QualifiedToolName {
    pub fn new(server: impl Into<String>, tool: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            tool: tool.into(),
        }
    }

    /// Parse `backend.tool`. Backend names never contain a dot, so the first
    /// dot separates them; the tool part may contain further dots.
    pub fn parse(s: &str) -> Option<Self> {
        let (server, tool) = s.split_once('.')?;
        if server.is_empty() || tool.is_empty() {
            return None;
        }
        Some(Self::new(server, tool))
    }
}

impl fmt::Display for QualifiedToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.server, self.tool)
    }
}

/// One tool as seen from exactly one backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveredTool {
    pub name: QualifiedToolName,
    pub description: Option<String>,
    pub input_schema: Value,
    /// Hash of name + schema; changes on breaking changes
    pub structure_hash: String,
    /// Hash of structure + description; changes on any change
    pub full_hash: String,
    pub discovered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: BackendStatus,
}

impl DiscoveredTool {
    /// Normalize a backend descriptor. Rejects descriptors without a usable
    /// name or with a non-object input schema.
    pub fn from_descriptor(
        server: &str,
        descriptor: ToolDescriptor,
        now: DateTime<Utc>,
    ) -> GatewayResult<Self> {
        let malformed = |message: String| GatewayError::MalformedDescriptor {
            server: server.to_string(),
            message,
        };

        if descriptor.name.trim().is_empty() {
            return Err(malformed("tool name is empty".to_string()));
        }
        if descriptor.name.contains('#') || descriptor.name.chars().any(char::is_whitespace) {
            return Err(malformed(format!(
                "tool name '{}' contains '#' or whitespace",
                descriptor.name
            )));
        }
        let input_schema = match descriptor.input_schema {
            Value::Object(map) => Value::Object(map),
            Value::Null => Value::Object(serde_json::Map::new()),
            other => {
                return Err(malformed(format!(
                    "input schema of '{}' is not an object: {}",
                    descriptor.name, other
                )))
            }
        };

        let structure_hash = structure_hash(&descriptor.name, &input_schema);
        let full_hash = full_hash(&structure_hash, descriptor.description.as_deref());

        Ok(Self {
            name: QualifiedToolName::new(server, descriptor.name),
            description: descriptor.description,
            input_schema,
            structure_hash,
            full_hash,
            discovered_at: now,
            updated_at: now,
            status: BackendStatus::Connected,
        })
    }

    pub fn server(&self) -> &str {
        &self.name.server
    }

    pub fn local_name(&self) -> &str {
        &self.name.tool
    }

    /// Stable content-hash id, usable as `#<id>` in references.
    pub fn id(&self) -> &str {
        let end = TOOL_ID_LEN.min(self.structure_hash.len());
        &self.structure_hash[..end]
    }

    /// Full structure hash or a prefix of at least [`MIN_HASH_PREFIX_LEN`].
    pub fn matches_hash(&self, hash: &str) -> bool {
        hash.len() >= MIN_HASH_PREFIX_LEN && self.structure_hash.starts_with(hash)
    }
}

impl CacheWeight for DiscoveredTool {
    fn estimated_size(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.name.server.len()
            + self.name.tool.len()
            + self.description.as_ref().map_or(0, String::len)
            + self.input_schema.estimated_size()
            + self.structure_hash.len()
            + self.full_hash.len()
    }
}

/// blake3 over the canonical (key-sorted) JSON of name and schema.
pub fn structure_hash(name: &str, schema: &Value) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"name:");
    hasher.update(name.as_bytes());
    hasher.update(b"\nschema:");
    let mut canonical = String::new();
    write_canonical(schema, &mut canonical);
    hasher.update(canonical.as_bytes());
    hasher.finalize().to_hex().to_string()
}

pub fn full_hash(structure_hash: &str, description: Option<&str>) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(structure_hash.as_bytes());
    hasher.update(b"\ndescription:");
    hasher.update(description.unwrap_or_default().as_bytes());
    hasher.finalize().to_hex().to_string()
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                if let Some(v) = map.get(key) {
                    write_canonical(v, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Name part of a reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameRef {
    /// `backend.tool`
    Qualified(QualifiedToolName),
    /// `tool`, must be unique across backends
    Bare(String),
}

/// Parsed tool reference: `backend.tool`, `tool`, `#<hash>`, or a name
/// followed by `#<hash>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolReference {
    raw: String,
    name: Option<NameRef>,
    hash: Option<String>,
}

impl ToolReference {
    pub fn parse(raw: &str) -> Result<Self, ReferenceError> {
        let trimmed = raw.trim();
        let malformed = || ReferenceError::Malformed(raw.to_string());
        if trimmed.is_empty() {
            return Err(malformed());
        }

        let (name_part, hash) = match trimmed.rsplit_once('#') {
            Some((name, hash)) => {
                let hash = hash.to_ascii_lowercase();
                if hash.len() < MIN_HASH_PREFIX_LEN || !hash.chars().all(|c| c.is_ascii_hexdigit())
                {
                    return Err(malformed());
                }
                (name, Some(hash))
            }
            None => (trimmed, None),
        };

        let name = if name_part.is_empty() {
            None
        } else if name_part.contains('.') {
            Some(NameRef::Qualified(
                QualifiedToolName::parse(name_part).ok_or_else(malformed)?,
            ))
        } else {
            Some(NameRef::Bare(name_part.to_string()))
        };

        if name.is_none() && hash.is_none() {
            return Err(malformed());
        }

        Ok(Self {
            raw: trimmed.to_string(),
            name,
            hash,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn name(&self) -> Option<&NameRef> {
        self.name.as_ref()
    }

    pub fn hash(&self) -> Option<&str> {
        self.hash.as_deref()
    }

    /// Text before `#`, empty for hash-only references.
    pub fn name_text(&self) -> &str {
        self.raw
            .rsplit_once('#')
            .map_or(self.raw.as_str(), |(name, _)| name)
    }
}

impl fmt::Display for ToolReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
