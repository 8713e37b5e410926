use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use nest_codec::{Blob, Commit, Object, Tree};
use nest_types::{ObjectId, ObjectKind};
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::traits::RepoHandle;

/// Hash-keyed cache of immutable objects, shared by every root.
///
/// Entries are never edited or evicted: content addressing means a hash
/// always maps to the same object, whichever store it came from. The cache
/// starts out holding the empty tree so roots without a commit resolve as an
/// empty directory.
pub struct ObjectCache {
    objects: RwLock<HashMap<ObjectId, Arc<Object>>>,
}

impl ObjectCache {
    pub fn new() -> Self {
        let empty = Object::Tree(Tree::empty());
        let mut objects = HashMap::new();
        objects.insert(empty.id(), Arc::new(empty));
        Self {
            objects: RwLock::new(objects),
        }
    }

    /// Hash of the empty tree.
    pub fn empty_tree_id() -> ObjectId {
        Object::Tree(Tree::empty()).id()
    }

    pub fn get(&self, id: &ObjectId) -> Option<Arc<Object>> {
        self.objects.read().expect("lock poisoned").get(id).cloned()
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.objects.read().expect("lock poisoned").contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.objects.read().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cache an object that exists in no store (e.g. generated content) and
    /// return its hash.
    pub fn insert(&self, object: Object) -> ObjectId {
        let id = object.id();
        self.objects
            .write()
            .expect("lock poisoned")
            .entry(id)
            .or_insert_with(|| Arc::new(object));
        id
    }

    /// Fetch `id` from the cache, or load it through `repo` and cache it.
    pub async fn load(&self, repo: &dyn RepoHandle, id: &ObjectId) -> StoreResult<Arc<Object>> {
        if let Some(object) = self.get(id) {
            return Ok(object);
        }
        let object = repo
            .load_object(id)
            .await?
            .ok_or(StoreError::MissingObject(*id))?;
        let computed = object.id();
        if computed != *id {
            return Err(StoreError::HashMismatch {
                expected: *id,
                computed,
            });
        }
        debug!(%id, kind = %object.kind(), "cached object");
        let object = Arc::new(object);
        self.objects
            .write()
            .expect("lock poisoned")
            .insert(*id, object.clone());
        Ok(object)
    }

    /// Load an object that must be a tree.
    pub async fn load_tree(&self, repo: &dyn RepoHandle, id: &ObjectId) -> StoreResult<Tree> {
        match self.load_kind(repo, id, ObjectKind::Tree).await?.as_ref() {
            Object::Tree(tree) => Ok(tree.clone()),
            _ => Err(StoreError::MissingTree(*id)),
        }
    }

    /// Load an object that must be a commit.
    pub async fn load_commit(&self, repo: &dyn RepoHandle, id: &ObjectId) -> StoreResult<Commit> {
        match self.load_kind(repo, id, ObjectKind::Commit).await?.as_ref() {
            Object::Commit(commit) => Ok(commit.clone()),
            _ => Err(StoreError::MissingCommit(*id)),
        }
    }

    /// Load an object that must be a blob.
    pub async fn load_blob(&self, repo: &dyn RepoHandle, id: &ObjectId) -> StoreResult<Blob> {
        match self.load_kind(repo, id, ObjectKind::Blob).await?.as_ref() {
            Object::Blob(blob) => Ok(blob.clone()),
            _ => Err(StoreError::MissingObject(*id)),
        }
    }

    /// Save `object` through `repo`, checking the store agrees on its hash,
    /// and cache it.
    pub async fn save(&self, repo: &dyn RepoHandle, object: Object) -> StoreResult<ObjectId> {
        let computed = object.id();
        let returned = repo.save_object(&object).await?;
        if returned != computed {
            return Err(StoreError::RepoMismatch { returned, computed });
        }
        self.objects
            .write()
            .expect("lock poisoned")
            .entry(computed)
            .or_insert_with(|| Arc::new(object));
        Ok(computed)
    }

    async fn load_kind(
        &self,
        repo: &dyn RepoHandle,
        id: &ObjectId,
        expected: ObjectKind,
    ) -> StoreResult<Arc<Object>> {
        let object = match self.load(repo, id).await {
            Err(StoreError::MissingObject(_)) => {
                return Err(match expected {
                    ObjectKind::Tree => StoreError::MissingTree(*id),
                    ObjectKind::Commit => StoreError::MissingCommit(*id),
                    _ => StoreError::MissingObject(*id),
                })
            }
            other => other?,
        };
        if object.kind() != expected {
            return Err(StoreError::WrongKind {
                id: *id,
                expected,
                actual: object.kind(),
            });
        }
        Ok(object)
    }
}

impl Default for ObjectCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ObjectCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectCache")
            .field("object_count", &self.len())
            .finish()
    }
}
