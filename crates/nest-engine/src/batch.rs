//! Batch flushing.
//!
//! A flush runs under the forest's write lock and is all-or-nothing with
//! respect to bookmarks: every root's new `current` (and `head`) is computed
//! first, and configs are only touched once every root has succeeded.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use nest_codec::{Blob, Commit, Object, Person};
use nest_modules::{apply_edits, is_path_prefix, ModuleEdit, RepoRoot, Submodule, GITMODULES};
use nest_resolve::path::{join, split_last};
use nest_resolve::ResolveError;
use nest_store::{ObjectCache, RepoHandle, TreeMutation};
use nest_types::{EntryMode, ObjectId};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::error::{EngineError, EngineResult};
use crate::event::RootChanged;
use crate::forest::Inner;

/// A tree entry to place at a path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Entry {
    pub mode: EntryMode,
    pub id: ObjectId,
}

impl Entry {
    pub fn new(mode: EntryMode, id: ObjectId) -> Self {
        Self { mode, id }
    }
}

/// Completes when the batch holding a write has been applied, yielding the
/// top root's new `current`.
#[must_use = "a write is only known to be applied once its ticket resolves"]
pub struct WriteTicket {
    rx: oneshot::Receiver<EngineResult<Option<ObjectId>>>,
}

impl WriteTicket {
    pub(crate) fn new(rx: oneshot::Receiver<EngineResult<Option<ObjectId>>>) -> Self {
        Self { rx }
    }

    /// A ticket that fails without joining a batch.
    pub(crate) fn failed(err: EngineError) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(err));
        Self { rx }
    }
}

impl Future for WriteTicket {
    type Output = EngineResult<Option<ObjectId>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(EngineError::Closed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) enum WriteOp {
    /// Set (`Some`) or delete (`None`) the entry at the path.
    Put(Option<Entry>),
    /// Re-point a root's `current`, and its `head` too when `commit` is set.
    Root {
        current: Option<ObjectId>,
        commit: bool,
    },
    /// Record the root's working state as a real commit.
    Commit {
        message: String,
        author: Option<Person>,
    },
}

#[derive(Clone, Debug)]
pub(crate) struct PendingWrite {
    /// Global, normalized path.
    pub path: String,
    pub op: WriteOp,
}

#[derive(Clone, Debug)]
pub(crate) enum ModuleRequest {
    Add { path: String, url: String },
    Remove { path: String },
}

impl ModuleRequest {
    fn path(&self) -> &str {
        match self {
            Self::Add { path, .. } | Self::Remove { path } => path,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct RootUpdate {
    current: Option<ObjectId>,
    commit: bool,
}

/// Everything a batch does to one root.
struct Group {
    root: Arc<RepoRoot>,
    /// Root-relative path to new entry; later writes replace earlier ones.
    mutations: BTreeMap<String, Option<Entry>>,
    update: Option<RootUpdate>,
    commit: Option<(String, Option<Person>)>,
}

impl Group {
    fn new(root: Arc<RepoRoot>) -> Self {
        Self {
            root,
            mutations: BTreeMap::new(),
            update: None,
            commit: None,
        }
    }
}

/// New bookmarks for one root.
struct Outcome {
    root: Arc<RepoRoot>,
    current: Option<ObjectId>,
    head: Option<ObjectId>,
    changed: bool,
}

fn group_for(groups: &mut BTreeMap<String, Group>, root: Arc<RepoRoot>) -> &mut Group {
    groups
        .entry(root.path().to_string())
        .or_insert_with(|| Group::new(root))
}

impl Inner {
    /// Apply one batch. The caller holds the write lock.
    pub(crate) async fn flush(
        self: &Arc<Self>,
        mut writes: Vec<PendingWrite>,
        modules: Vec<ModuleRequest>,
    ) -> EngineResult<Option<ObjectId>> {
        let replaced = self.replaced_roots(&modules);
        if !modules.is_empty() {
            self.fold_module_edits(modules, &mut writes).await?;
        }
        let mut detached = Vec::new();
        let mut groups = self.partition(writes, &replaced, &mut detached).await?;
        self.add_ancestor_groups(&mut groups);

        let outcomes = self.propagate(groups).await?;
        self.apply(&outcomes).await?;

        for path in detached {
            let removed = self.roots.remove_subtree(&path);
            if !removed.is_empty() {
                info!(?removed, "detached submodule roots");
            }
        }

        let top = self.roots.get("").ok_or(ResolveError::NoRoot)?;
        let hash = top.current();
        let event = RootChanged {
            hash,
            roots: outcomes
                .iter()
                .filter(|o| o.changed)
                .map(|o| o.root.path().to_string())
                .collect(),
        };
        info!(hash = ?hash, roots = ?event.roots, "batch applied");
        // No subscribers is not an error.
        let _ = self.events.send(event);
        Ok(hash)
    }

    /// Live roots that a submodule request points at a different origin.
    fn replaced_roots(&self, requests: &[ModuleRequest]) -> BTreeSet<String> {
        requests
            .iter()
            .filter_map(|request| match request {
                ModuleRequest::Add { path, url } => {
                    let live = self.roots.get(path)?;
                    (live.config().url() != Some(url.as_str())).then(|| path.clone())
                }
                ModuleRequest::Remove { .. } => None,
            })
            .collect()
    }

    /// Turn submodule requests into `.gitmodules` writes, one per owning root.
    async fn fold_module_edits(
        &self,
        requests: Vec<ModuleRequest>,
        writes: &mut Vec<PendingWrite>,
    ) -> EngineResult<()> {
        let mut by_owner: BTreeMap<String, (Arc<RepoRoot>, Vec<ModuleEdit>)> = BTreeMap::new();
        for request in &requests {
            let path = request.path();
            let owner = self.resolver.owning_root(split_last(path).0).await?;
            let local = owner.local_path(path).unwrap_or_default().to_string();
            let edit = match request {
                ModuleRequest::Add { url, .. } => {
                    ModuleEdit::Add(Submodule::new(local.clone(), local, url.clone()))
                }
                ModuleRequest::Remove { .. } => ModuleEdit::Remove { path: local },
            };
            by_owner
                .entry(owner.path().to_string())
                .or_insert_with(|| (owner.clone(), Vec::new()))
                .1
                .push(edit);
        }

        for (owner_path, (owner, edits)) in by_owner {
            let existing = self.lifecycle.read_gitmodules_text(&owner).await?;
            let path = join(&owner_path, GITMODULES);
            match apply_edits(existing.as_deref(), &edits)? {
                Some(text) => {
                    let blob = Object::Blob(Blob::new(text.into_bytes()));
                    let id = self.cache.save(owner.repo(), blob).await?;
                    writes.push(PendingWrite {
                        path,
                        op: WriteOp::Put(Some(Entry::new(EntryMode::Regular, id))),
                    });
                }
                None if existing.is_some() => writes.push(PendingWrite {
                    path,
                    op: WriteOp::Put(None),
                }),
                None => {}
            }
        }
        Ok(())
    }

    /// Group writes by the root that owns them.
    ///
    /// A write is owned by the root holding its parent directory, so writing
    /// a commit link never opens the repository it points at. A commit entry
    /// written at a live root's own path re-points that root instead, unless
    /// the root is being `replaced`. Anything else written there replaces the
    /// submodule in its parent, and the root is detached once the batch
    /// succeeds.
    async fn partition(
        &self,
        writes: Vec<PendingWrite>,
        replaced: &BTreeSet<String>,
        detached: &mut Vec<String>,
    ) -> EngineResult<BTreeMap<String, Group>> {
        let mut groups = BTreeMap::new();
        for write in writes {
            let entry = match write.op {
                WriteOp::Root { current, commit } => {
                    let root = self.live_root(&write.path).await?;
                    group_for(&mut groups, root).update = Some(RootUpdate { current, commit });
                    continue;
                }
                WriteOp::Commit { message, author } => {
                    let root = self.live_root(&write.path).await?;
                    group_for(&mut groups, root).commit = Some((message, author));
                    continue;
                }
                WriteOp::Put(entry) => entry,
            };

            if let Some(live) = self.roots.get(&write.path) {
                let repoint = entry
                    .filter(|e| e.mode.is_commit() && !replaced.contains(&write.path));
                if let Some(entry) = repoint {
                    group_for(&mut groups, live).update = Some(RootUpdate {
                        current: Some(entry.id),
                        commit: true,
                    });
                    continue;
                }
                if write.path.is_empty() {
                    return Err(EngineError::InvalidPath {
                        path: write.path,
                        reason: "the top root can only be replaced by a commit".into(),
                    });
                }
                detached.push(write.path.clone());
            }
            let owner = self.resolver.owning_root(split_last(&write.path).0).await?;
            let local = owner.local_path(&write.path).unwrap_or_default().to_string();
            group_for(&mut groups, owner).mutations.insert(local, entry);
        }
        Ok(groups)
    }

    /// Every root above a touched root must re-embed it, so it gets a group
    /// even if nothing else in the batch touches it.
    fn add_ancestor_groups(&self, groups: &mut BTreeMap<String, Group>) {
        let touched: Vec<String> = groups.keys().cloned().collect();
        for mut path in touched {
            while !path.is_empty() {
                let Some(parent) = self.roots.owning_root(split_last(&path).0) else {
                    break;
                };
                path = parent.path().to_string();
                groups
                    .entry(path.clone())
                    .or_insert_with(|| Group::new(parent));
            }
        }
    }

    /// Commit groups innermost first. Groups with no nested group pending are
    /// independent and run concurrently; each result is folded into the
    /// nearest enclosing group as a commit entry.
    async fn propagate(
        self: &Arc<Self>,
        mut groups: BTreeMap<String, Group>,
    ) -> EngineResult<Vec<Outcome>> {
        let mut outcomes = Vec::new();
        while !groups.is_empty() {
            let leaves: Vec<String> = groups
                .keys()
                .filter(|p| !groups.keys().any(|q| q != *p && is_path_prefix(p, q)))
                .cloned()
                .collect();

            let mut tasks = JoinSet::new();
            for path in &leaves {
                if let Some(group) = groups.remove(path) {
                    tasks.spawn(self.clone().commit_group(group));
                }
            }

            let mut round = Vec::with_capacity(leaves.len());
            let mut failure = None;
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(Ok(outcome)) => round.push(outcome),
                    Ok(Err(err)) => {
                        failure.get_or_insert(err);
                    }
                    Err(err) => {
                        failure.get_or_insert(EngineError::Task(err.to_string()));
                    }
                }
            }
            if let Some(err) = failure {
                return Err(err);
            }

            for outcome in &round {
                let path = outcome.root.path();
                let (false, true, Some(current)) = (path.is_empty(), outcome.changed, outcome.current)
                else {
                    continue;
                };
                let parent = groups
                    .iter_mut()
                    .filter(|(q, _)| is_path_prefix(q, path))
                    .max_by_key(|(q, _)| q.len())
                    .map(|(_, group)| group);
                if let Some(parent) = parent {
                    let local = parent.root.local_path(path).unwrap_or_default().to_string();
                    // An explicit write at a detached root's path wins.
                    parent
                        .mutations
                        .entry(local)
                        .or_insert(Some(Entry::new(EntryMode::Commit, current)));
                }
            }
            outcomes.extend(round);
        }
        Ok(outcomes)
    }

    /// Compute one root's new bookmarks. Nothing is persisted here.
    async fn commit_group(self: Arc<Self>, group: Group) -> EngineResult<Outcome> {
        let Group {
            root,
            mutations,
            update,
            commit,
        } = group;
        let repo = root.repo();
        let previous = root.current();
        let (base, mut head) = match update {
            Some(u) if u.commit => (u.current, u.current),
            Some(u) => (u.current, root.head()),
            None => (previous, root.head()),
        };

        let mut current = base;
        if !mutations.is_empty() {
            let base_tree = self.tree_of(repo, base).await?;
            let edits: Vec<TreeMutation> = mutations
                .into_iter()
                .map(|(path, entry)| match entry {
                    Some(e) => TreeMutation::set(path, e.mode, e.id),
                    None => TreeMutation::delete(path),
                })
                .collect();
            let start = base_tree.filter(|t| *t != ObjectCache::empty_tree_id());
            let tree = repo.create_tree(start.as_ref(), &edits).await?;

            current = if Some(tree) == self.tree_of(repo, head).await? {
                head
            } else if Some(tree) == base_tree {
                base
            } else if base.is_none() && head.is_none() && tree == ObjectCache::empty_tree_id() {
                None
            } else {
                let identity = &self.config.identity;
                let author = Person::now(&identity.name, &identity.email);
                let message = self.config.uncommitted_message.clone();
                Some(self.save_commit(repo, tree, head, author, message).await?)
            };
        }

        if let Some((message, author)) = commit {
            if current != head {
                let tree = self
                    .tree_of(repo, current)
                    .await?
                    .unwrap_or_else(ObjectCache::empty_tree_id);
                let author = author.unwrap_or_else(|| {
                    Person::now(&self.config.identity.name, &self.config.identity.email)
                });
                let id = self.save_commit(repo, tree, head, author, message).await?;
                info!(root = root.path(), commit = %id, "committed working state");
                current = Some(id);
                head = Some(id);
            }
        }

        Ok(Outcome {
            changed: current != previous || head != root.head(),
            root,
            current,
            head,
        })
    }

    async fn save_commit(
        &self,
        repo: &dyn RepoHandle,
        tree: ObjectId,
        parent: Option<ObjectId>,
        author: Person,
        message: String,
    ) -> EngineResult<ObjectId> {
        let commit = Commit::new(tree, parent.into_iter().collect(), author, message);
        let id = self.cache.save(repo, Object::Commit(commit)).await?;
        debug!(commit = %id, tree = %tree, "saved commit");
        Ok(id)
    }

    async fn tree_of(
        &self,
        repo: &dyn RepoHandle,
        commit: Option<ObjectId>,
    ) -> EngineResult<Option<ObjectId>> {
        match commit {
            Some(id) => Ok(Some(self.cache.load_commit(repo, &id).await?.tree)),
            None => Ok(None),
        }
    }

    /// Move bookmarks, update refs whose head moved, and persist configs.
    async fn apply(&self, outcomes: &[Outcome]) -> EngineResult<()> {
        let moved: Vec<(&Outcome, bool)> = outcomes
            .iter()
            .filter(|o| o.changed)
            .map(|o| (o, o.head != o.root.head()))
            .collect();

        for (outcome, head_moved) in moved {
            let config = outcome.root.update_config(|config| {
                config.current = outcome.current;
                config.head = outcome.head;
            });
            if head_moved {
                if let (Some(head), Some(ref_name)) = (outcome.head, config.ref_name.as_deref()) {
                    outcome.root.repo().update_ref(ref_name, &head).await?;
                }
            }
            self.lifecycle
                .configs()
                .save(outcome.root.path(), &config)
                .await?;
            debug!(root = outcome.root.path(), current = ?outcome.current, "bookmarks moved");
        }
        Ok(())
    }
}
