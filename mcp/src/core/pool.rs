//! Connection sets and backend identity.
//!
//! A [`ConnectionSet`] is an immutable snapshot of live backend connections.
//! Activation builds a new set and swaps it in, so readers never observe a
//! partially-updated pool.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
};

use super::{
    config::{BackendConfig, BackendTransport},
    connection::BackendConnection,
};

/// Identity of a backend endpoint (address + auth hash).
///
/// Two configs with the same name but different identity are a conflict.
/// Credentials are hashed, not stored as plaintext.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendIdentity {
    pub address: String,
    pub auth_hash: u64,
}

impl BackendIdentity {
    pub fn from_config(config: &BackendConfig) -> Self {
        let (address, auth_hash) = match &config.transport {
            BackendTransport::Streamable {
                url,
                token,
                headers,
            } => (format!("streamable:{}", url), Self::hash_auth(token, headers)),
            BackendTransport::Sse {
                url,
                token,
                headers,
            } => (format!("sse:{}", url), Self::hash_auth(token, headers)),
            BackendTransport::Stdio {
                command,
                args,
                envs,
            } => (
                format!("stdio:{}:{}", command, args.join(" ")),
                Self::hash_auth(&None, envs),
            ),
        };
        Self { address, auth_hash }
    }

    /// Hash token and headers. Returns 0 if no auth info.
    fn hash_auth(token: &Option<String>, headers: &HashMap<String, String>) -> u64 {
        if token.is_none() && headers.is_empty() {
            return 0;
        }

        let mut hasher = std::collections::hash_map::DefaultHasher::new();

        if let Some(t) = token {
            t.hash(&mut hasher);
        }

        let mut sorted_headers: Vec<_> = headers.iter().collect();
        sorted_headers.sort_by_key(|(k, _)| *k);
        for (key, value) in sorted_headers {
            key.hash(&mut hasher);
            value.hash(&mut hasher);
        }

        hasher.finish()
    }
}

/// One live backend plus the config and identity it was created from.
#[derive(Clone)]
pub struct BackendEntry {
    pub config: BackendConfig,
    pub identity: BackendIdentity,
    pub connection: Arc<dyn BackendConnection>,
}

impl BackendEntry {
    pub fn new(config: BackendConfig, connection: Arc<dyn BackendConnection>) -> Self {
        Self {
            identity: BackendIdentity::from_config(&config),
            config,
            connection,
        }
    }
}

impl fmt::Debug for BackendEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendEntry")
            .field("name", &self.config.name)
            .field("identity", &self.identity)
            .field("status", &self.connection.status())
            .finish()
    }
}

/// Immutable snapshot of backend connections keyed by backend name.
#[derive(Clone, Default, Debug)]
pub struct ConnectionSet {
    entries: BTreeMap<String, BackendEntry>,
}

impl ConnectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = BackendEntry>) -> Self {
        let mut set = Self::new();
        for entry in entries {
            set.insert(entry);
        }
        set
    }

    /// Insert or replace the entry for `entry.config.name`.
    pub fn insert(&mut self, entry: BackendEntry) -> Option<BackendEntry> {
        self.entries.insert(entry.config.name.clone(), entry)
    }

    pub fn remove(&mut self, name: &str) -> Option<BackendEntry> {
        self.entries.remove(name)
    }

    #[must_use]
    pub fn with(mut self, entry: BackendEntry) -> Self {
        self.insert(entry);
        self
    }

    pub fn get(&self, name: &str) -> Option<&BackendEntry> {
        self.entries.get(name)
    }

    pub fn connection(&self, name: &str) -> Option<Arc<dyn BackendConnection>> {
        self.entries.get(name).map(|e| Arc::clone(&e.connection))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Backend names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BackendEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
