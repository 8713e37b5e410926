use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use nest_codec::{decode, hasher::split_frame, hash, Object};
use nest_types::ObjectId;
use tracing::debug;

use crate::config::RepoConfig;
use crate::error::{StoreError, StoreResult};
use crate::names::validate_ref_name;
use crate::traits::{ConfigStore, RepoFactory, RepoHandle};

/// In-memory repository: framed object bytes plus a ref table.
///
/// Intended for tests and embedding. Objects are held as their framed
/// encoding, so every load re-hashes the bytes and detects corruption.
pub struct InMemoryRepo {
    objects: RwLock<HashMap<ObjectId, Vec<u8>>>,
    refs: RwLock<BTreeMap<String, ObjectId>>,
}

impl InMemoryRepo {
    /// Create a new empty repository.
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            refs: RwLock::new(BTreeMap::new()),
        }
    }

    /// Number of objects currently stored.
    pub fn len(&self) -> usize {
        self.objects.read().expect("lock poisoned").len()
    }

    /// Returns `true` if no objects are stored.
    pub fn is_empty(&self) -> bool {
        self.objects.read().expect("lock poisoned").is_empty()
    }

    /// Returns `true` if an object with this hash is stored.
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.objects.read().expect("lock poisoned").contains_key(id)
    }

    /// Snapshot of the ref table.
    pub fn refs(&self) -> BTreeMap<String, ObjectId> {
        self.refs.read().expect("lock poisoned").clone()
    }

    /// File raw framed bytes under `id` without checking them.
    pub fn insert_raw(&self, id: ObjectId, framed: Vec<u8>) {
        self.objects.write().expect("lock poisoned").insert(id, framed);
    }
}

impl Default for InMemoryRepo {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RepoHandle for InMemoryRepo {
    async fn load_object(&self, id: &ObjectId) -> StoreResult<Option<Object>> {
        let framed = match self.objects.read().expect("lock poisoned").get(id) {
            Some(bytes) => bytes.clone(),
            None => return Ok(None),
        };
        let (kind, body) = split_frame(&framed)?;
        let computed = hash(kind, body);
        if computed != *id {
            return Err(StoreError::HashMismatch {
                expected: *id,
                computed,
            });
        }
        Ok(Some(decode(kind, body)?))
    }

    async fn save_object(&self, object: &Object) -> StoreResult<ObjectId> {
        let id = object.id();
        let mut map = self.objects.write().expect("lock poisoned");
        if !map.contains_key(&id) {
            debug!(%id, kind = %object.kind(), "saving object");
            map.insert(id, object.encode_framed());
        }
        Ok(id)
    }

    async fn read_ref(&self, name: &str) -> StoreResult<Option<ObjectId>> {
        Ok(self.refs.read().expect("lock poisoned").get(name).copied())
    }

    async fn update_ref(&self, name: &str, id: &ObjectId) -> StoreResult<()> {
        validate_ref_name(name)?;
        debug!(name, %id, "updating ref");
        self.refs
            .write()
            .expect("lock poisoned")
            .insert(name.to_string(), *id);
        Ok(())
    }
}

impl std::fmt::Debug for InMemoryRepo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryRepo")
            .field("object_count", &self.len())
            .field("refs", &self.refs())
            .finish()
    }
}

/// Factory handing out one shared [`InMemoryRepo`] per origin.
///
/// Roots with a `url` share the repository registered for that url; roots
/// without one are keyed by their global path.
#[derive(Default)]
pub struct InMemoryFactory {
    repos: RwLock<HashMap<String, Arc<InMemoryRepo>>>,
    opened: RwLock<Vec<String>>,
}

impl InMemoryFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The repository for `key` (a url or root path), created on first use.
    pub fn repo(&self, key: &str) -> Arc<InMemoryRepo> {
        self.repos
            .write()
            .expect("lock poisoned")
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    /// Root paths passed to [`RepoFactory::open`], in call order.
    pub fn opened(&self) -> Vec<String> {
        self.opened.read().expect("lock poisoned").clone()
    }
}

#[async_trait]
impl RepoFactory for InMemoryFactory {
    async fn open(&self, root: &str, config: &RepoConfig) -> StoreResult<Arc<dyn RepoHandle>> {
        let key = config.url().unwrap_or(root);
        debug!(root, key, "opening in-memory repository");
        self.opened
            .write()
            .expect("lock poisoned")
            .push(root.to_string());
        let repo: Arc<dyn RepoHandle> = self.repo(key);
        Ok(repo)
    }
}

/// Config store holding every root's config in memory.
#[derive(Debug, Default)]
pub struct InMemoryConfigStore {
    configs: RwLock<BTreeMap<String, RepoConfig>>,
}

impl InMemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a config without going through the async interface.
    pub fn insert(&self, root: &str, config: RepoConfig) {
        self.configs
            .write()
            .expect("lock poisoned")
            .insert(root.to_string(), config);
    }

    /// The stored config for `root`, if any.
    pub fn get(&self, root: &str) -> Option<RepoConfig> {
        self.configs.read().expect("lock poisoned").get(root).cloned()
    }
}

#[async_trait]
impl ConfigStore for InMemoryConfigStore {
    async fn load(&self, root: &str) -> StoreResult<Option<RepoConfig>> {
        Ok(self.get(root))
    }

    async fn save(&self, root: &str, config: &RepoConfig) -> StoreResult<()> {
        self.insert(root, config.clone());
        Ok(())
    }
}
