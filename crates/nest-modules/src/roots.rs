use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use nest_store::{RepoConfig, RepoHandle};
use nest_types::ObjectId;

/// A live repository exposed at a global path.
pub struct RepoRoot {
    path: String,
    handle: Arc<dyn RepoHandle>,
    config: RwLock<RepoConfig>,
}

impl RepoRoot {
    pub fn new(path: impl Into<String>, handle: Arc<dyn RepoHandle>, config: RepoConfig) -> Self {
        Self {
            path: path.into(),
            handle,
            config: RwLock::new(config),
        }
    }

    /// Global path of the root (`""` for the top root).
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn repo(&self) -> &dyn RepoHandle {
        self.handle.as_ref()
    }

    pub fn handle(&self) -> Arc<dyn RepoHandle> {
        self.handle.clone()
    }

    /// Snapshot of the config.
    pub fn config(&self) -> RepoConfig {
        self.config.read().expect("lock poisoned").clone()
    }

    pub fn current(&self) -> Option<ObjectId> {
        self.config.read().expect("lock poisoned").current
    }

    pub fn head(&self) -> Option<ObjectId> {
        self.config.read().expect("lock poisoned").head
    }

    pub fn is_dirty(&self) -> bool {
        self.config.read().expect("lock poisoned").is_dirty()
    }

    /// Edit the config in place and return the result.
    pub fn update_config(&self, edit: impl FnOnce(&mut RepoConfig)) -> RepoConfig {
        let mut config = self.config.write().expect("lock poisoned");
        edit(&mut config);
        config.clone()
    }

    /// Path of `global` relative to this root, if the root contains it.
    pub fn local_path<'a>(&self, global: &'a str) -> Option<&'a str> {
        if self.path.is_empty() {
            return Some(global);
        }
        let rest = global.strip_prefix(self.path.as_str())?;
        if rest.is_empty() {
            Some(rest)
        } else {
            rest.strip_prefix('/')
        }
    }
}

impl std::fmt::Debug for RepoRoot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepoRoot")
            .field("path", &self.path)
            .field("config", &self.config())
            .finish()
    }
}

/// `prefix` equals `path` or is an ancestor of it, segment-wise.
/// The empty path is an ancestor of everything.
pub fn is_path_prefix(prefix: &str, path: &str) -> bool {
    prefix.is_empty()
        || path == prefix
        || (path.starts_with(prefix) && path.as_bytes().get(prefix.len()) == Some(&b'/'))
}

/// Live roots keyed by global path, alive for the life of the forest.
#[derive(Default)]
pub struct RootTable {
    roots: RwLock<BTreeMap<String, Arc<RepoRoot>>>,
}

impl RootTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<Arc<RepoRoot>> {
        self.roots.read().expect("lock poisoned").get(path).cloned()
    }

    /// Register a root. If one is already live at the same path, it is kept
    /// and returned instead.
    pub fn insert(&self, root: RepoRoot) -> Arc<RepoRoot> {
        self.roots
            .write()
            .expect("lock poisoned")
            .entry(root.path.clone())
            .or_insert_with(|| Arc::new(root))
            .clone()
    }

    /// Drop the root at `path` and every root nested under it. Returns the
    /// removed paths. The top root is never removed.
    pub fn remove_subtree(&self, path: &str) -> Vec<String> {
        if path.is_empty() {
            return Vec::new();
        }
        let mut roots = self.roots.write().expect("lock poisoned");
        let doomed: Vec<String> = roots
            .keys()
            .filter(|root| is_path_prefix(path, root))
            .cloned()
            .collect();
        for root in &doomed {
            roots.remove(root);
        }
        doomed
    }

    /// The longest live root whose path is a prefix of `path`.
    pub fn owning_root(&self, path: &str) -> Option<Arc<RepoRoot>> {
        self.roots
            .read()
            .expect("lock poisoned")
            .iter()
            .filter(|(root, _)| is_path_prefix(root, path))
            .max_by_key(|(root, _)| root.len())
            .map(|(_, root)| root.clone())
    }

    /// All live roots, ordered by path.
    pub fn roots(&self) -> Vec<Arc<RepoRoot>> {
        self.roots
            .read()
            .expect("lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.roots.read().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
