use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use nest_codec::{validate_entry_name, Commit, Object, Tree, TreeEntry};
use nest_types::{EntryMode, ObjectId, ObjectKind};

use crate::config::RepoConfig;
use crate::error::{StoreError, StoreResult};

/// One change to apply while building a tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeMutation {
    /// Path relative to the tree being built, `/`-separated, no empty segments.
    pub path: String,
    /// New entry, or `None` to delete the path.
    pub entry: Option<(EntryMode, ObjectId)>,
}

impl TreeMutation {
    pub fn set(path: impl Into<String>, mode: EntryMode, id: ObjectId) -> Self {
        Self {
            path: path.into(),
            entry: Some((mode, id)),
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            entry: None,
        }
    }
}

/// Access to one repository: an object store plus a ref table.
///
/// Implementations must satisfy:
/// - Objects are immutable once saved; saving is idempotent.
/// - `load_object` returns `Ok(None)` for an unknown hash and `Err` only on
///   backend failure or corruption.
/// - Timeouts, retries, and backoff are the implementation's concern.
#[async_trait]
pub trait RepoHandle: Send + Sync {
    /// Load an object by hash.
    async fn load_object(&self, id: &ObjectId) -> StoreResult<Option<Object>>;

    /// Save an object and return its hash.
    async fn save_object(&self, object: &Object) -> StoreResult<ObjectId>;

    /// Read a named ref.
    async fn read_ref(&self, name: &str) -> StoreResult<Option<ObjectId>>;

    /// Point a named ref at a hash.
    async fn update_ref(&self, name: &str, id: &ObjectId) -> StoreResult<()>;

    /// Load an object that must be a tree.
    async fn load_tree(&self, id: &ObjectId) -> StoreResult<Tree> {
        match self.load_object(id).await? {
            Some(Object::Tree(tree)) => Ok(tree),
            Some(other) => Err(StoreError::WrongKind {
                id: *id,
                expected: ObjectKind::Tree,
                actual: other.kind(),
            }),
            None => Err(StoreError::MissingTree(*id)),
        }
    }

    /// Load an object that must be a commit.
    async fn load_commit(&self, id: &ObjectId) -> StoreResult<Commit> {
        match self.load_object(id).await? {
            Some(Object::Commit(commit)) => Ok(commit),
            Some(other) => Err(StoreError::WrongKind {
                id: *id,
                expected: ObjectKind::Commit,
                actual: other.kind(),
            }),
            None => Err(StoreError::MissingCommit(*id)),
        }
    }

    /// Apply `mutations` on top of `base` (or an empty tree) and return the
    /// hash of the new root tree.
    ///
    /// Intermediate directories are created as needed and subtrees left empty
    /// are removed. Backends with a native tree-building API may override
    /// this; the default works in terms of `load_tree` and `save_object`.
    async fn create_tree(
        &self,
        base: Option<&ObjectId>,
        mutations: &[TreeMutation],
    ) -> StoreResult<ObjectId> {
        // Every directory touched by a mutation, keyed by its path ("" = root).
        let mut dirs: BTreeMap<String, Tree> = BTreeMap::new();
        let root = match base {
            Some(id) => self.load_tree(id).await?,
            None => Tree::empty(),
        };
        dirs.insert(String::new(), root);

        for mutation in mutations {
            let (parent, name) = split_last(&mutation.path);
            validate_entry_name(name)?;
            let mut dir = String::new();
            for segment in parent.split('/').filter(|s| !s.is_empty()) {
                validate_entry_name(segment)?;
                let child = join(&dir, segment);
                if !dirs.contains_key(&child) {
                    let existing = dirs
                        .get(&dir)
                        .and_then(|t| t.get(segment))
                        .filter(|e| e.mode.is_tree())
                        .map(|e| e.object_id);
                    let subtree = match existing {
                        Some(id) => self.load_tree(&id).await?,
                        None => Tree::empty(),
                    };
                    dirs.insert(child.clone(), subtree);
                }
                dir = child;
            }
        }

        for mutation in mutations {
            let (parent, name) = split_last(&mutation.path);
            if let Some(tree) = dirs.get_mut(parent) {
                match mutation.entry {
                    Some((mode, id)) => tree.insert(TreeEntry::new(name, mode, id)),
                    None => {
                        tree.remove(name);
                    }
                }
            }
        }

        // Save deepest directories first so parents embed fresh hashes.
        let mut order: Vec<String> = dirs.keys().filter(|d| !d.is_empty()).cloned().collect();
        order.sort_by_key(|d| Reverse(d.matches('/').count()));

        for dir in order {
            let Some(tree) = dirs.remove(&dir) else {
                continue;
            };
            let (parent, name) = split_last(&dir);
            let subtree_id = if tree.is_empty() {
                None
            } else {
                Some(self.save_object(&Object::Tree(tree)).await?)
            };
            if let Some(parent_tree) = dirs.get_mut(parent) {
                match subtree_id {
                    Some(id) => parent_tree.insert(TreeEntry::new(name, EntryMode::Tree, id)),
                    None => {
                        parent_tree.remove(name);
                    }
                }
            }
        }

        let root = dirs.remove("").unwrap_or_default();
        self.save_object(&Object::Tree(root)).await
    }
}

/// Builds repository handles from root configs.
#[async_trait]
pub trait RepoFactory: Send + Sync {
    /// Open the repository for the root at `root` (a global path).
    async fn open(&self, root: &str, config: &RepoConfig) -> StoreResult<Arc<dyn RepoHandle>>;
}

/// Persists per-root configs, keyed by global root path.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn load(&self, root: &str) -> StoreResult<Option<RepoConfig>>;

    async fn save(&self, root: &str, config: &RepoConfig) -> StoreResult<()>;
}

/// Split `"a/b/c"` into `("a/b", "c")` and `"c"` into `("", "c")`.
fn split_last(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(at) => (&path[..at], &path[at + 1..]),
        None => ("", path),
    }
}

fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}
