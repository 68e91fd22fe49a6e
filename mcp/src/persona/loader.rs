//! Loading personas from directories and `.htp` archives.
//!
//! A persona directory holds `persona.yaml`, an optional `mcp.json` with the
//! backends it bundles, and any number of asset files:
//!
//! ```json
//! {
//!   "mcpServers": {
//!     "git":    { "command": "mcp-git", "args": ["--repo", "."] },
//!     "search": { "url": "https://search.example.com/mcp", "token": "..." },
//!     "legacy": { "url": "http://localhost:3000/sse" }
//!   }
//! }
//! ```

use std::{
    collections::{BTreeMap, HashMap},
    fs, io,
    path::{Path, PathBuf},
};

use serde::Deserialize;
use tracing::{debug, warn};

use super::{
    archive,
    types::{LoadedPersona, PersonaConfig, PersonaSource},
};
use crate::{
    core::config::{BackendConfig, BackendTransport},
    error::{PersonaError, PersonaErrorKind},
};

pub const PERSONA_FILE: &str = "persona.yaml";
const PERSONA_FILE_ALT: &str = "persona.yml";
pub const BACKEND_FILE: &str = "mcp.json";
pub const ARCHIVE_EXTENSION: &str = "htp";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BackendDocument {
    #[serde(default)]
    mcp_servers: BTreeMap<String, BackendEntryDocument>,
}

#[derive(Debug, Deserialize)]
struct BackendEntryDocument {
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default, alias = "envs")]
    env: HashMap<String, String>,
    url: Option<String>,
    token: Option<String>,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    required: bool,
}

impl BackendEntryDocument {
    fn into_config(self, name: String) -> Result<BackendConfig, PersonaError> {
        let transport = match (self.command, self.url) {
            (Some(command), None) => BackendTransport::Stdio {
                command,
                args: self.args,
                envs: self.env,
            },
            (None, Some(url)) if url.trim_end_matches('/').ends_with("/sse") => {
                BackendTransport::Sse {
                    url,
                    token: self.token,
                    headers: self.headers,
                }
            }
            (None, Some(url)) => BackendTransport::Streamable {
                url,
                token: self.token,
                headers: self.headers,
            },
            (Some(_), Some(_)) => {
                return Err(PersonaError::schema(format!(
                    "backend '{}' sets both 'command' and 'url'",
                    name
                )))
            }
            (None, None) => {
                return Err(PersonaError::schema(format!(
                    "backend '{}' needs either 'command' or 'url'",
                    name
                )))
            }
        };
        let mut config = BackendConfig::with_transport(name, transport);
        config.required = self.required;
        Ok(config)
    }
}

/// Personas found under one directory.
#[derive(Debug, Default)]
pub struct PersonaCatalog {
    pub personas: Vec<LoadedPersona>,
    /// Entries that looked like personas but failed to load
    pub errors: Vec<(PathBuf, PersonaError)>,
}

impl PersonaCatalog {
    pub fn get(&self, name: &str) -> Option<&LoadedPersona> {
        self.personas.iter().find(|p| p.name() == name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.personas.iter().map(LoadedPersona::name).collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    /// Names defined by more than one source.
    pub fn duplicates(&self) -> BTreeMap<String, Vec<String>> {
        let mut by_name: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for persona in &self.personas {
            by_name
                .entry(persona.name().to_string())
                .or_default()
                .push(persona.source.to_string());
        }
        by_name.retain(|_, sources| sources.len() > 1);
        by_name
    }
}

#[derive(Debug, Clone, Default)]
pub struct PersonaLoader {
    directory: Option<PathBuf>,
}

impl PersonaLoader {
    pub fn new(directory: Option<PathBuf>) -> Self {
        Self { directory }
    }

    pub fn directory(&self) -> Option<&Path> {
        self.directory.as_deref()
    }

    /// Load every persona directory and archive directly under the
    /// configured directory. Broken entries are collected, not fatal.
    pub fn discover(&self) -> Result<PersonaCatalog, PersonaError> {
        let Some(dir) = &self.directory else {
            return Ok(PersonaCatalog::default());
        };

        let mut candidates: Vec<PathBuf> = fs::read_dir(dir)
            .map_err(|e| PersonaError::io(&format!("reading {}", dir.display()), e))?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| is_archive(path) || find_definition(path).is_some())
            .collect();
        candidates.sort();

        let mut catalog = PersonaCatalog::default();
        for path in candidates {
            match Self::load(&path) {
                Ok(persona) => {
                    debug!(persona = %persona.name(), source = %persona.source, "Loaded persona");
                    catalog.personas.push(persona);
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "Skipping unloadable persona");
                    catalog.errors.push((path, err));
                }
            }
        }
        Ok(catalog)
    }

    /// Load a persona directory or `.htp` archive.
    pub fn load(path: &Path) -> Result<LoadedPersona, PersonaError> {
        if is_archive(path) {
            Self::load_archive(path)
        } else {
            Self::load_dir(path)
        }
    }

    pub fn load_dir(dir: &Path) -> Result<LoadedPersona, PersonaError> {
        load_from_root(dir, PersonaSource::Directory(dir.to_path_buf()))
    }

    /// Extract to a scratch directory and load from there.
    pub fn load_archive(path: &Path) -> Result<LoadedPersona, PersonaError> {
        let scratch = tempfile::tempdir()
            .map_err(|e| PersonaError::io("creating scratch directory", e))?;
        archive::extract_into(path, scratch.path())?;
        load_from_root(scratch.path(), PersonaSource::Archive(path.to_path_buf()))
    }
}

pub fn is_archive(path: &Path) -> bool {
    path.is_file() && path.extension().and_then(|e| e.to_str()) == Some(ARCHIVE_EXTENSION)
}

fn find_definition(dir: &Path) -> Option<PathBuf> {
    [PERSONA_FILE, PERSONA_FILE_ALT]
        .iter()
        .map(|f| dir.join(f))
        .find(|p| p.is_file())
}

fn load_from_root(root: &Path, source: PersonaSource) -> Result<LoadedPersona, PersonaError> {
    if !root.is_dir() {
        return Err(PersonaError::new(
            PersonaErrorKind::NotFound,
            format!("{} is not a persona directory or .htp archive", root.display()),
        ));
    }
    let definition = find_definition(root).ok_or_else(|| {
        PersonaError::schema(format!("{} has no {}", source, PERSONA_FILE))
            .with_suggestion(format!("Add a {} with at least a name and one toolset", PERSONA_FILE))
    })?;

    let content = fs::read_to_string(&definition)
        .map_err(|e| PersonaError::io(&format!("reading {}", definition.display()), e))?;
    let config = PersonaConfig::from_yaml_str(&content)?;

    let backend_file = root.join(BACKEND_FILE);
    let backends = if backend_file.is_file() {
        let content = fs::read_to_string(&backend_file)
            .map_err(|e| PersonaError::io(&format!("reading {}", backend_file.display()), e))?;
        parse_backends(&content)?
    } else {
        Vec::new()
    };

    let assets = walk_files(root)
        .map_err(|e| PersonaError::io(&format!("listing {}", root.display()), e))?
        .into_iter()
        .filter(|p| {
            let name = p.to_str().unwrap_or_default();
            name != PERSONA_FILE && name != PERSONA_FILE_ALT && name != BACKEND_FILE
        })
        .collect();

    Ok(LoadedPersona {
        config,
        backends,
        source,
        assets,
    })
}

/// Parse an `mcp.json` companion document.
pub fn parse_backends(content: &str) -> Result<Vec<BackendConfig>, PersonaError> {
    let document: BackendDocument = serde_json::from_str(content).map_err(|e| {
        PersonaError::schema(format!("cannot parse {}: {}", BACKEND_FILE, e))
            .with_suggestion("Backends go under a top-level \"mcpServers\" object")
    })?;
    document
        .mcp_servers
        .into_iter()
        .map(|(name, entry)| entry.into_config(name))
        .collect()
}

/// Every regular file under `root`, relative and sorted. Symlinks are skipped.
pub(super) fn walk_files(root: &Path) -> io::Result<Vec<PathBuf>> {
    walk(root).map(|tree| tree.files)
}

/// Relative paths under a persona directory, each list sorted.
pub(super) struct Tree {
    pub dirs: Vec<PathBuf>,
    pub files: Vec<PathBuf>,
}

pub(super) fn walk(root: &Path) -> io::Result<Tree> {
    let mut tree = Tree {
        dirs: Vec::new(),
        files: Vec::new(),
    };
    let mut pending = vec![PathBuf::new()];
    while let Some(relative) = pending.pop() {
        for entry in fs::read_dir(root.join(&relative))? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let child = relative.join(entry.file_name());
            if file_type.is_dir() {
                tree.dirs.push(child.clone());
                pending.push(child);
            } else if file_type.is_file() {
                tree.files.push(child);
            }
        }
    }
    tree.dirs.sort();
    tree.files.sort();
    Ok(tree)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_persona(dir: &Path, name: &str) {
        fs::create_dir_all(dir.join("prompts")).unwrap();
        fs::write(
            dir.join(PERSONA_FILE),
            format!(
                "name: {name}\ndescription: test persona\nversion: 1.0.0\ntoolsets:\n  - name: coding\n    toolIds: [git.status]\ndefaultToolset: coding\n"
            ),
        )
        .unwrap();
        fs::write(dir.join("prompts").join("system.md"), "be helpful").unwrap();
    }

    #[test]
    fn test_load_directory_with_backends() {
        let dir = tempfile::tempdir().unwrap();
        write_persona(dir.path(), "dev");
        fs::write(
            dir.path().join(BACKEND_FILE),
            r#"{"mcpServers": {
                "git": {"command": "mcp-git", "args": ["--repo", "."]},
                "search": {"url": "https://search.example.com/mcp", "token": "t"},
                "legacy": {"url": "http://localhost:3000/sse"}
            }}"#,
        )
        .unwrap();

        let persona = PersonaLoader::load(dir.path()).unwrap();
        assert_eq!(persona.name(), "dev");
        assert_eq!(persona.config.default_toolset.as_deref(), Some("coding"));
        assert_eq!(persona.assets, vec![PathBuf::from("prompts/system.md")]);

        let kinds: Vec<(&str, &str)> = persona
            .backends
            .iter()
            .map(|b| {
                let kind = match b.transport {
                    BackendTransport::Stdio { .. } => "stdio",
                    BackendTransport::Sse { .. } => "sse",
                    BackendTransport::Streamable { .. } => "streamable",
                };
                (b.name.as_str(), kind)
            })
            .collect();
        assert_eq!(
            kinds,
            vec![("git", "stdio"), ("legacy", "sse"), ("search", "streamable")]
        );
    }

    #[test]
    fn test_backend_entry_needs_exactly_one_transport() {
        assert!(parse_backends(r#"{"mcpServers": {"x": {}}}"#).is_err());
        assert!(
            parse_backends(r#"{"mcpServers": {"x": {"command": "a", "url": "http://b"}}}"#)
                .is_err()
        );
        assert!(parse_backends(r#"{}"#).unwrap().is_empty());
    }

    #[test]
    fn test_missing_definition_is_schema_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = PersonaLoader::load_dir(dir.path()).unwrap_err();
        assert_eq!(err.kind(), PersonaErrorKind::SchemaInvalid);
    }

    #[test]
    fn test_discover_collects_errors_and_duplicates() {
        let root = tempfile::tempdir().unwrap();
        write_persona(&root.path().join("a"), "dev");
        write_persona(&root.path().join("b"), "dev");
        write_persona(&root.path().join("c"), "ops");
        fs::create_dir_all(root.path().join("broken")).unwrap();
        fs::write(root.path().join("broken").join(PERSONA_FILE), "name: [").unwrap();
        fs::create_dir_all(root.path().join("not-a-persona")).unwrap();

        let catalog = PersonaLoader::new(Some(root.path().to_path_buf()))
            .discover()
            .unwrap();
        assert_eq!(catalog.personas.len(), 3);
        assert_eq!(catalog.names(), vec!["dev", "ops"]);
        assert_eq!(catalog.errors.len(), 1);
        assert_eq!(catalog.duplicates().get("dev").map(Vec::len), Some(2));
    }
}
