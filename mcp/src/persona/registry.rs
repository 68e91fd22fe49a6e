//! Cached persona lookup by name.

use std::{
    collections::{BTreeMap, HashMap},
    time::Duration,
};

use parking_lot::RwLock;
use tracing::{debug, info};

use super::{
    loader::{PersonaCatalog, PersonaLoader},
    types::{LoadedPersona, PersonaSource},
};
use crate::{
    cache::{CacheKey, CacheLimits, TtlCache},
    core::config::{CacheConfig, PersonaSettings},
    error::{PersonaError, PersonaErrorKind},
};

pub const PERSONA_NAMESPACE: &str = "personas";

/// Personas loaded from the persona directory, plus inline registrations.
///
/// Loaded personas live in a [`TtlCache`]; a miss rescans the directory.
/// With source watching enabled, editing a persona on disk evicts it.
pub struct PersonaRegistry {
    loader: PersonaLoader,
    cache: TtlCache<LoadedPersona>,
    watch_sources: bool,
    sources: RwLock<BTreeMap<String, Vec<PersonaSource>>>,
    inline: RwLock<HashMap<String, LoadedPersona>>,
}

impl PersonaRegistry {
    pub fn new(loader: PersonaLoader, limits: CacheLimits, watch_sources: bool) -> Self {
        Self {
            loader,
            cache: TtlCache::new(PERSONA_NAMESPACE, limits),
            watch_sources,
            sources: RwLock::new(BTreeMap::new()),
            inline: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_settings(settings: &PersonaSettings, cache: &CacheConfig) -> Self {
        let limits =
            CacheLimits::from(cache).with_ttl(Duration::from_secs(settings.cache_ttl));
        Self::new(
            PersonaLoader::new(settings.directory.clone()),
            limits,
            settings.watch_sources,
        )
    }

    pub fn cache(&self) -> &TtlCache<LoadedPersona> {
        &self.cache
    }

    fn key(name: &str) -> CacheKey {
        CacheKey::new(PERSONA_NAMESPACE, name)
    }

    /// Register a persona that does not come from the persona directory.
    /// Registering the same name again replaces the earlier registration.
    pub fn register(&self, persona: LoadedPersona) {
        let name = persona.name().to_string();
        self.inline.write().insert(name.clone(), persona.clone());
        {
            let mut sources = self.sources.write();
            let defined = sources.entry(name.clone()).or_default();
            if !defined.contains(&PersonaSource::Inline) {
                defined.push(PersonaSource::Inline);
            }
        }
        self.cache.put(Self::key(&name), persona);
    }

    /// Rescan the persona directory and replace the cached personas.
    pub async fn refresh(&self) -> Result<PersonaCatalog, PersonaError> {
        let loader = self.loader.clone();
        let catalog = tokio::task::spawn_blocking(move || loader.discover())
            .await
            .map_err(|e| {
                PersonaError::new(PersonaErrorKind::Io, format!("persona scan failed: {}", e))
            })??;

        let mut sources: BTreeMap<String, Vec<PersonaSource>> = BTreeMap::new();
        let mut items: Vec<(String, LoadedPersona)> = Vec::new();
        for persona in &catalog.personas {
            sources
                .entry(persona.name().to_string())
                .or_default()
                .push(persona.source.clone());
            // first source wins; duplicates are rejected at activation
            if !items.iter().any(|(name, _)| name == persona.name()) {
                items.push((persona.name().to_string(), persona.clone()));
            }
        }

        let inline = self.inline.read().clone();
        for (name, persona) in inline {
            sources.entry(name.clone()).or_default().push(PersonaSource::Inline);
            if !items.iter().any(|(n, _)| *n == name) {
                items.push((name, persona));
            }
        }

        let watched: Vec<(String, PersonaSource)> = items
            .iter()
            .map(|(name, p)| (name.clone(), p.source.clone()))
            .collect();
        self.cache.replace_namespace(PERSONA_NAMESPACE, items);
        *self.sources.write() = sources;

        if self.watch_sources {
            for (name, source) in watched {
                if let Some(path) = source.path() {
                    self.cache.watch_source_or_warn(&Self::key(&name), path);
                }
            }
        }

        info!(
            personas = catalog.personas.len(),
            errors = catalog.errors.len(),
            "Persona directory scanned"
        );
        Ok(catalog)
    }

    /// Fetch a persona, rescanning on a cache miss.
    pub async fn get(&self, name: &str) -> Result<LoadedPersona, PersonaError> {
        let key = Self::key(name);
        if let Some(persona) = self.cache.get(&key) {
            return Ok(persona);
        }

        debug!(persona = %name, "Persona cache miss, rescanning");
        self.refresh().await?;
        self.cache
            .get(&key)
            .ok_or_else(|| PersonaError::not_found(name))
    }

    /// Number of sources that define `name`, as of the last scan.
    pub fn sources_with_name(&self, name: &str) -> usize {
        self.sources.read().get(name).map_or(0, Vec::len)
    }

    pub fn names(&self) -> Vec<String> {
        self.sources.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::{
        cache::EvictionReason,
        persona::{loader::PERSONA_FILE, types::PersonaConfig},
    };

    fn write_persona(dir: &std::path::Path, name: &str, tool: &str) {
        fs::create_dir_all(dir).unwrap();
        fs::write(
            dir.join(PERSONA_FILE),
            format!("name: {name}\ntoolsets:\n  - name: main\n    toolIds: [{tool}]\n"),
        )
        .unwrap();
    }

    fn registry(dir: &std::path::Path, watch: bool) -> PersonaRegistry {
        PersonaRegistry::new(
            PersonaLoader::new(Some(dir.to_path_buf())),
            CacheLimits::default(),
            watch,
        )
    }

    #[tokio::test]
    async fn test_get_scans_on_miss() {
        let root = tempfile::tempdir().unwrap();
        write_persona(&root.path().join("dev"), "dev", "git.status");
        let registry = registry(root.path(), false);

        let persona = registry.get("dev").await.unwrap();
        assert_eq!(persona.config.toolsets[0].tool_ids, vec!["git.status"]);
        assert_eq!(registry.sources_with_name("dev"), 1);

        let err = registry.get("ghost").await.unwrap_err();
        assert_eq!(err.kind(), PersonaErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_duplicates_are_counted() {
        let root = tempfile::tempdir().unwrap();
        write_persona(&root.path().join("a"), "dev", "git.status");
        write_persona(&root.path().join("b"), "dev", "git.log");
        let registry = registry(root.path(), false);

        registry.refresh().await.unwrap();
        assert_eq!(registry.sources_with_name("dev"), 2);
        assert_eq!(registry.names(), vec!["dev"]);
    }

    #[tokio::test]
    async fn test_inline_personas_survive_rescans() {
        let root = tempfile::tempdir().unwrap();
        let registry = registry(root.path(), false);
        let yaml = "name: inline\ntoolsets:\n  - name: main\n    toolIds: [x]\n";
        registry.register(LoadedPersona::inline(PersonaConfig::from_yaml_str(yaml).unwrap()));

        registry.refresh().await.unwrap();
        assert!(registry.get("inline").await.is_ok());
    }

    #[tokio::test]
    async fn test_reregistering_inline_persona_replaces_it() {
        let root = tempfile::tempdir().unwrap();
        let registry = registry(root.path(), false);
        let first = "name: inline\ntoolsets:\n  - name: main\n    toolIds: [x]\n";
        let second = "name: inline\ntoolsets:\n  - name: main\n    toolIds: [y]\n";
        registry.register(LoadedPersona::inline(PersonaConfig::from_yaml_str(first).unwrap()));
        registry.register(LoadedPersona::inline(PersonaConfig::from_yaml_str(second).unwrap()));

        assert_eq!(registry.sources_with_name("inline"), 1);
        let persona = registry.get("inline").await.unwrap();
        assert_eq!(persona.config.toolsets[0].tool_ids, vec!["y"]);

        registry.refresh().await.unwrap();
        assert_eq!(registry.sources_with_name("inline"), 1);
    }

    #[tokio::test]
    async fn test_source_change_evicts_persona() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("dev");
        write_persona(&dir, "dev", "git.status");
        let registry = registry(root.path(), true);
        let mut events = registry.cache().subscribe();
        let consumer = registry
            .cache()
            .spawn_invalidation_consumer(tokio_util::sync::CancellationToken::new())
            .unwrap();

        registry.get("dev").await.unwrap();
        write_persona(&dir, "dev", "git.log");

        let evicted = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match events.recv().await {
                    Ok(crate::cache::CacheEvent::Evicted { reason, .. })
                        if reason == EvictionReason::SourceChanged =>
                    {
                        break true
                    }
                    Ok(_) => continue,
                    Err(_) => break false,
                }
            }
        })
        .await
        .unwrap_or(false);
        assert!(evicted);

        let reloaded = registry.get("dev").await.unwrap();
        assert_eq!(reloaded.config.toolsets[0].tool_ids, vec!["git.log"]);
        consumer.abort();
    }
}
