use std::collections::VecDeque;
use std::mem;
use std::sync::{Arc, Mutex};

use nest_codec::{validate_entry_name, Blob, Object, Person, Tree};
use nest_modules::{RepoRoot, RootTable, SubmoduleLifecycle};
use nest_resolve::path::{normalize, segments, split_last};
use nest_resolve::{Fetched, Generator, GeneratorRegistry, Resolved, Resolver};
use nest_store::{
    ConfigStore, InMemoryConfigStore, InMemoryFactory, ObjectCache, RepoConfig, RepoFactory,
};
use nest_types::{EntryMode, ObjectId};
use tokio::sync::{broadcast, oneshot, RwLock, RwLockReadGuard};
use tracing::{info, warn};

use crate::batch::{Entry, ModuleRequest, PendingWrite, WriteOp, WriteTicket};
use crate::config::ForestConfig;
use crate::error::{EngineError, EngineResult};
use crate::event::{EventStream, RootChanged};

type Waiter = oneshot::Sender<EngineResult<Option<ObjectId>>>;

/// Queue shared by writers, readers, and the flush task.
#[derive(Default)]
pub(crate) struct EngineState {
    writes: Vec<PendingWrite>,
    modules: Vec<ModuleRequest>,
    waiters: Vec<Waiter>,
    /// A flush task exists and has not yet taken the open batch.
    scheduled: bool,
    /// A batch is being applied.
    flushing: bool,
    queued_reads: VecDeque<oneshot::Sender<()>>,
}

pub(crate) struct Inner {
    pub(crate) config: ForestConfig,
    pub(crate) roots: Arc<RootTable>,
    pub(crate) cache: Arc<ObjectCache>,
    pub(crate) lifecycle: Arc<SubmoduleLifecycle>,
    pub(crate) resolver: Resolver,
    state: Mutex<EngineState>,
    /// Held exclusively while a batch is applied or a head is moved.
    write_lock: RwLock<()>,
    pub(crate) events: broadcast::Sender<RootChanged>,
}

impl Inner {
    /// The live root at exactly `path`, materializing it if needed.
    pub(crate) async fn live_root(&self, path: &str) -> EngineResult<Arc<RepoRoot>> {
        let root = self.resolver.owning_root(path).await?;
        if root.path() != path {
            return Err(EngineError::NotARoot(path.to_string()));
        }
        Ok(root)
    }
}

/// A mutable view over a top repository and every submodule reachable from
/// it.
///
/// Cloning is cheap; clones share the same batch queue and caches.
///
/// Batching assumes a current-thread runtime: a batch takes every write
/// issued before the flush task is next polled, which on a current-thread
/// runtime means every write issued in the same turn. On a multi-thread
/// runtime the flush task may run on another worker while writes are still
/// being issued, so one turn's writes can land in consecutive batches. Each
/// batch is still applied atomically.
#[derive(Clone)]
pub struct Forest {
    inner: Arc<Inner>,
}

impl Forest {
    /// Open a forest whose top root is described by `top`.
    pub async fn open(
        config: ForestConfig,
        factory: Arc<dyn RepoFactory>,
        configs: Arc<dyn ConfigStore>,
        top: RepoConfig,
    ) -> EngineResult<Self> {
        let cache = Arc::new(ObjectCache::new());
        let roots = Arc::new(RootTable::new());
        let lifecycle = Arc::new(SubmoduleLifecycle::new(
            factory,
            configs,
            roots.clone(),
            cache.clone(),
            config.default_ref.clone(),
        ));
        let root = lifecycle.attach("", top).await?;
        let resolver = Resolver::new(
            lifecycle.clone(),
            cache.clone(),
            Arc::new(GeneratorRegistry::with_builtins()),
            config.max_redirects,
        );
        let (events, _) = broadcast::channel(config.event_capacity);

        info!(current = ?root.current(), head = ?root.head(), "forest opened");
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                roots,
                cache,
                lifecycle,
                resolver,
                state: Mutex::new(EngineState::default()),
                write_lock: RwLock::new(()),
                events,
            }),
        })
    }

    /// A forest backed entirely by memory, starting from an empty top root.
    pub async fn in_memory(config: ForestConfig) -> EngineResult<Self> {
        Self::open(
            config,
            Arc::new(InMemoryFactory::new()),
            Arc::new(InMemoryConfigStore::new()),
            RepoConfig::default(),
        )
        .await
    }

    pub fn config(&self) -> &ForestConfig {
        &self.inner.config
    }

    pub fn cache(&self) -> &Arc<ObjectCache> {
        &self.inner.cache
    }

    /// Receive one [`RootChanged`] per completed batch from now on.
    pub fn subscribe(&self) -> EventStream {
        self.inner.events.subscribe()
    }

    /// Make a generator available to rules under `name`.
    pub fn register_generator(&self, name: impl Into<String>, generator: Arc<dyn Generator>) {
        self.inner.resolver.generators().register(name, generator);
    }

    /// Paths of every live root, ordered.
    pub fn roots(&self) -> Vec<String> {
        self.inner
            .roots
            .roots()
            .iter()
            .map(|root| root.path().to_string())
            .collect()
    }

    /// Config snapshot of a live root.
    pub fn root_config(&self, root: &str) -> Option<RepoConfig> {
        self.inner.roots.get(&normalize(root)).map(|r| r.config())
    }

    /// The top root's `current`.
    pub fn root_hash(&self) -> Option<ObjectId> {
        self.inner.roots.get("").and_then(|root| root.current())
    }

    /// Whether a live root has working state that differs from its head.
    pub fn is_dirty(&self, root: &str) -> EngineResult<bool> {
        let path = normalize(root);
        match self.inner.roots.get(&path) {
            Some(root) => Ok(root.is_dirty()),
            None => Err(EngineError::NotARoot(path)),
        }
    }

    /// Set (`Some`) or delete (`None`) the entry at `path`.
    ///
    /// The write joins the open batch, or opens one. The returned ticket
    /// completes once the whole batch has been applied.
    pub fn write(&self, path: &str, entry: Option<Entry>) -> WriteTicket {
        let path = normalize(path);
        if let Err(err) = check_put(&path, entry.as_ref()) {
            return WriteTicket::failed(err);
        }
        self.enqueue(
            vec![PendingWrite {
                path,
                op: WriteOp::Put(entry),
            }],
            Vec::new(),
        )
    }

    /// Store `data` as a blob in the owning repository and write it at `path`.
    pub async fn write_file(
        &self,
        path: &str,
        data: impl Into<Vec<u8>>,
        mode: EntryMode,
    ) -> EngineResult<Option<ObjectId>> {
        let path = normalize(path);
        if !mode.is_blob() {
            return Err(EngineError::InvalidPath {
                path,
                reason: format!("{mode:?} entries do not hold file data"),
            });
        }
        check_put(&path, None)?;
        let owner = self.inner.resolver.owning_root(split_last(&path).0).await?;
        let id = self
            .inner
            .cache
            .save(owner.repo(), Object::Blob(Blob::new(data)))
            .await?;
        self.write(&path, Some(Entry::new(mode, id))).await
    }

    /// Delete whatever is at `path`.
    pub fn remove(&self, path: &str) -> WriteTicket {
        self.write(path, None)
    }

    /// Link `commit` of the repository at `url` into the tree at `path` and
    /// declare it in the owning root's `.gitmodules`, in one batch.
    pub fn add_submodule(&self, path: &str, url: &str, commit: ObjectId) -> WriteTicket {
        let path = normalize(path);
        let entry = Entry::new(EntryMode::Commit, commit);
        if let Err(err) = check_put(&path, Some(&entry)).and_then(|_| check_nested(&path)) {
            return WriteTicket::failed(err);
        }
        self.enqueue(
            vec![PendingWrite {
                path: path.clone(),
                op: WriteOp::Put(Some(entry)),
            }],
            vec![ModuleRequest::Add {
                path,
                url: url.to_string(),
            }],
        )
    }

    /// Drop the submodule at `path` from its parent's tree and `.gitmodules`.
    pub fn remove_submodule(&self, path: &str) -> WriteTicket {
        let path = normalize(path);
        if let Err(err) = check_nested(&path) {
            return WriteTicket::failed(err);
        }
        self.enqueue(
            vec![PendingWrite {
                path: path.clone(),
                op: WriteOp::Put(None),
            }],
            vec![ModuleRequest::Remove { path }],
        )
    }

    /// Re-point a root's working state. Parents re-embed the new commit.
    pub fn set_current(&self, root: &str, current: Option<ObjectId>) -> WriteTicket {
        self.enqueue(
            vec![PendingWrite {
                path: normalize(root),
                op: WriteOp::Root {
                    current,
                    commit: false,
                },
            }],
            Vec::new(),
        )
    }

    /// Discard a root's working state by moving `current` back to `head`.
    pub async fn revert(&self, root: &str) -> EngineResult<Option<ObjectId>> {
        let path = normalize(root);
        let head = {
            let _read = self.read_barrier().await;
            self.inner.live_root(&path).await?.head()
        };
        self.set_current(&path, head).await
    }

    /// Record a root's working tree as a commit on top of its head, then
    /// move both bookmarks and the ref to it. Returns the root's new head.
    ///
    /// A clean root is left alone.
    pub async fn commit(
        &self,
        root: &str,
        message: &str,
        author: Option<Person>,
    ) -> EngineResult<Option<ObjectId>> {
        let path = normalize(root);
        self.enqueue(
            vec![PendingWrite {
                path: path.clone(),
                op: WriteOp::Commit {
                    message: message.to_string(),
                    author,
                },
            }],
            Vec::new(),
        )
        .await?;
        Ok(self.inner.live_root(&path).await?.head())
    }

    /// Move a root's `head` and its ref directly, leaving `current` and the
    /// parents untouched.
    pub async fn set_head(&self, root: &str, head: ObjectId) -> EngineResult<()> {
        let path = normalize(root);
        let _write = self.inner.write_lock.write().await;
        let root = self.inner.live_root(&path).await?;
        self.inner.cache.load_commit(root.repo(), &head).await?;

        let ref_name = root
            .config()
            .ref_name
            .unwrap_or_else(|| self.inner.config.default_ref.clone());
        root.repo().update_ref(&ref_name, &head).await?;
        let config = root.update_config(|config| config.head = Some(head));
        self.inner.lifecycle.configs().save(&path, &config).await?;
        info!(root = %path, head = %head, ref_name = %ref_name, "head moved");
        Ok(())
    }

    /// Resolve `path`. `bake` follows symlinks and applies rules.
    pub async fn resolve(&self, path: &str, bake: bool) -> EngineResult<Option<Resolved>> {
        let _read = self.read_barrier().await;
        Ok(self.inner.resolver.resolve(path, bake).await?)
    }

    /// Load the content of an earlier resolution.
    pub async fn fetch(&self, resolved: &Resolved) -> EngineResult<Fetched> {
        let _read = self.read_barrier().await;
        Ok(self.inner.resolver.fetch(resolved).await?)
    }

    /// Resolve and fetch against the same state.
    pub async fn read(&self, path: &str, bake: bool) -> EngineResult<Option<(Resolved, Fetched)>> {
        let _read = self.read_barrier().await;
        let Some(resolved) = self.inner.resolver.resolve(path, bake).await? else {
            return Ok(None);
        };
        let fetched = self.inner.resolver.fetch(&resolved).await?;
        Ok(Some((resolved, fetched)))
    }

    /// File content at `path`, or `None` if nothing is there.
    pub async fn read_file(&self, path: &str, bake: bool) -> EngineResult<Option<Vec<u8>>> {
        match self.read(path, bake).await? {
            None => Ok(None),
            Some((_, Fetched::Blob(blob))) => Ok(Some(blob.data)),
            Some((resolved, Fetched::Tree(_))) => Err(EngineError::InvalidPath {
                path: resolved.path,
                reason: "is a directory".into(),
            }),
        }
    }

    /// Directory listing at `path`, or `None` if nothing is there.
    pub async fn read_tree(&self, path: &str, bake: bool) -> EngineResult<Option<Tree>> {
        match self.read(path, bake).await? {
            None => Ok(None),
            Some((_, Fetched::Tree(tree))) => Ok(Some(tree)),
            Some((resolved, Fetched::Blob(_))) => Err(EngineError::InvalidPath {
                path: resolved.path,
                reason: "is not a directory".into(),
            }),
        }
    }

    fn enqueue(&self, writes: Vec<PendingWrite>, modules: Vec<ModuleRequest>) -> WriteTicket {
        let (tx, rx) = oneshot::channel();
        let spawn = {
            let mut state = self.inner.state.lock().expect("lock poisoned");
            state.writes.extend(writes);
            state.modules.extend(modules);
            state.waiters.push(tx);
            let spawn = !state.scheduled && !state.flushing;
            if spawn {
                state.scheduled = true;
            }
            spawn
        };
        if spawn {
            tokio::spawn(run_batches(self.inner.clone()));
        }
        WriteTicket::new(rx)
    }

    /// Wait out any open or in-flight batch, then hold off new ones.
    async fn read_barrier(&self) -> RwLockReadGuard<'_, ()> {
        let queued = {
            let mut state = self.inner.state.lock().expect("lock poisoned");
            if state.scheduled || state.flushing {
                let (tx, rx) = oneshot::channel();
                state.queued_reads.push_back(tx);
                Some(rx)
            } else {
                None
            }
        };
        if let Some(rx) = queued {
            let _ = rx.await;
        }
        self.inner.write_lock.read().await
    }
}

/// Flush batches until no writes are waiting.
async fn run_batches(inner: Arc<Inner>) {
    loop {
        // Writes issued in the same turn as the first one join this batch
        // (on a current-thread runtime; see [`Forest`]).
        tokio::task::yield_now().await;

        let (writes, modules, waiters) = {
            let mut state = inner.state.lock().expect("lock poisoned");
            state.scheduled = false;
            state.flushing = true;
            (
                mem::take(&mut state.writes),
                mem::take(&mut state.modules),
                mem::take(&mut state.waiters),
            )
        };

        let guard = inner.write_lock.write().await;
        match inner.flush(writes, modules).await {
            Ok(hash) => {
                for waiter in waiters {
                    let _ = waiter.send(Ok(hash));
                }
            }
            Err(err) => {
                warn!(error = %err, writers = waiters.len(), "batch failed");
                let cause = Arc::new(err);
                for waiter in waiters {
                    let _ = waiter.send(Err(EngineError::BatchFailed(cause.clone())));
                }
            }
        }
        drop(guard);

        let (reads, more) = {
            let mut state = inner.state.lock().expect("lock poisoned");
            let more = !state.writes.is_empty() || !state.modules.is_empty();
            if !more {
                state.flushing = false;
            }
            (mem::take(&mut state.queued_reads), more)
        };
        for read in reads {
            let _ = read.send(());
        }
        if !more {
            break;
        }
    }
}

fn check_put(path: &str, entry: Option<&Entry>) -> EngineResult<()> {
    if path.is_empty() && !entry.is_some_and(|e| e.mode.is_commit()) {
        return Err(EngineError::InvalidPath {
            path: String::new(),
            reason: "the top root can only be replaced by a commit".into(),
        });
    }
    for name in segments(path) {
        validate_entry_name(&name).map_err(|e| EngineError::InvalidPath {
            path: path.to_string(),
            reason: e.to_string(),
        })?;
    }
    Ok(())
}

fn check_nested(path: &str) -> EngineResult<()> {
    if path.is_empty() {
        return Err(EngineError::InvalidPath {
            path: String::new(),
            reason: "the top root is not a submodule".into(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use nest_codec::Commit;
    use nest_modules::Gitmodules;
    use nest_resolve::{GenerateContext, ResolveResult, VirtualNode};
    use nest_store::{RepoHandle, TreeMutation};
    use serde_json::Value;
    use tokio::sync::broadcast::error::TryRecvError;

    struct Fixture {
        factory: Arc<InMemoryFactory>,
        configs: Arc<InMemoryConfigStore>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                factory: Arc::new(InMemoryFactory::new()),
                configs: Arc::new(InMemoryConfigStore::new()),
            }
        }

        async fn open(&self, head: Option<ObjectId>) -> Forest {
            let mut top = RepoConfig::default();
            top.head = head;
            Forest::open(
                ForestConfig::default(),
                self.factory.clone(),
                self.configs.clone(),
                top,
            )
            .await
            .unwrap()
        }
    }

    async fn blob(repo: &dyn RepoHandle, text: &str) -> ObjectId {
        repo.save_object(&Object::Blob(Blob::new(text.as_bytes())))
            .await
            .unwrap()
    }

    async fn commit_tree(repo: &dyn RepoHandle, mutations: &[TreeMutation]) -> ObjectId {
        let tree = repo.create_tree(None, mutations).await.unwrap();
        let author = Person::new("Test", "test@example.com", 0, 0);
        repo.save_object(&Object::Commit(Commit::new(tree, vec![], author, "seed")))
            .await
            .unwrap()
    }

    /// Top root holding `README` and a submodule at `lib` whose repository
    /// (`mem://lib`) holds `lib.txt`. Returns (top head, child head).
    async fn seed_with_child(fx: &Fixture) -> (ObjectId, ObjectId) {
        let child_repo = fx.factory.repo("mem://lib");
        let lib_txt = blob(child_repo.as_ref(), "lib").await;
        let child = commit_tree(
            child_repo.as_ref(),
            &[TreeMutation::set("lib.txt", EntryMode::Regular, lib_txt)],
        )
        .await;

        let top_repo = fx.factory.repo("");
        let mut modules = Gitmodules::new();
        modules.add(nest_modules::Submodule::new("lib", "lib", "mem://lib"));
        let gitmodules = blob(top_repo.as_ref(), &modules.encode()).await;
        let readme = blob(top_repo.as_ref(), "hello").await;
        let top = commit_tree(
            top_repo.as_ref(),
            &[
                TreeMutation::set(".gitmodules", EntryMode::Regular, gitmodules),
                TreeMutation::set("README", EntryMode::Regular, readme),
                TreeMutation::set("lib", EntryMode::Commit, child),
            ],
        )
        .await;
        (top, child)
    }

    async fn tree_entry(forest: &Forest, path: &str) -> Option<(EntryMode, ObjectId)> {
        forest
            .resolve(path, false)
            .await
            .unwrap()
            .map(|r| (r.mode, r.id))
    }

    #[tokio::test]
    async fn writes_in_one_turn_share_a_batch_and_revert_discards_them() {
        let forest = Forest::in_memory(ForestConfig::default()).await.unwrap();
        assert_eq!(forest.root_hash(), None);

        let (first, second) = tokio::join!(
            forest.write_file("a/b.txt", "b", EntryMode::Regular),
            forest.write_file("a/c.txt", "c", EntryMode::Regular),
        );
        let hash = first.unwrap();
        assert!(hash.is_some());
        assert_eq!(second.unwrap(), hash);

        let tree = forest.read_tree("a", false).await.unwrap().unwrap();
        assert_eq!(tree.len(), 2);
        assert!(forest.is_dirty("").unwrap());

        let head = forest.root_config("").unwrap().head;
        forest.set_current("", head).await.unwrap();
        assert!(forest.read_tree("a", false).await.unwrap().is_none());
        assert!(!forest.is_dirty("").unwrap());
    }

    #[tokio::test]
    async fn working_commit_sits_on_head_with_system_identity() {
        let fx = Fixture::new();
        let (top, _) = seed_with_child(&fx).await;
        let forest = fx.open(Some(top)).await;

        let hash = forest
            .write_file("notes.txt", "n", EntryMode::Regular)
            .await
            .unwrap()
            .unwrap();
        let repo = fx.factory.repo("");
        let commit = forest.cache().load_commit(repo.as_ref(), &hash).await.unwrap();
        assert_eq!(commit.parents, vec![top]);
        assert_eq!(commit.message, "uncommitted changes");
        assert_eq!(commit.author.name, "nest");
        assert_eq!(forest.root_config("").unwrap().head, Some(top));
    }

    #[tokio::test]
    async fn rewriting_head_content_is_not_dirty() {
        let fx = Fixture::new();
        let (top, _) = seed_with_child(&fx).await;
        let forest = fx.open(Some(top)).await;

        let hash = forest
            .write_file("README", "hello", EntryMode::Regular)
            .await
            .unwrap();
        assert_eq!(hash, Some(top));
        assert!(!forest.is_dirty("").unwrap());

        forest
            .write_file("README", "changed", EntryMode::Regular)
            .await
            .unwrap();
        assert!(forest.is_dirty("").unwrap());
        let hash = forest
            .write_file("README", "hello", EntryMode::Regular)
            .await
            .unwrap();
        assert_eq!(hash, Some(top));
        assert!(!forest.is_dirty("").unwrap());
    }

    #[tokio::test]
    async fn child_commits_fold_into_parent() {
        let fx = Fixture::new();
        let (top, child_head) = seed_with_child(&fx).await;
        let forest = fx.open(Some(top)).await;

        let (inner, outer) = tokio::join!(
            forest.write_file("lib/new.txt", "x", EntryMode::Regular),
            forest.write_file("top.txt", "y", EntryMode::Regular),
        );
        assert_eq!(inner.unwrap(), outer.unwrap());

        let child = forest.root_config("lib").unwrap();
        assert_eq!(child.head, Some(child_head));
        let child_current = child.current.unwrap();
        assert_ne!(child_current, child_head);

        // Raw resolution enters the child, so the entry reads as a tree.
        let (mode, _) = tree_entry(&forest, "lib").await.unwrap();
        assert_eq!(mode, EntryMode::Tree);
        assert_eq!(
            tree_entry_in_top(&forest, &fx, "lib").await,
            Some(child_current)
        );

        let child_commit = forest
            .cache()
            .load_commit(fx.factory.repo("mem://lib").as_ref(), &child_current)
            .await
            .unwrap();
        assert_eq!(child_commit.parents, vec![child_head]);
        assert!(forest.is_dirty("lib").unwrap());
        assert!(forest.is_dirty("").unwrap());
        assert_eq!(
            forest.read_file("lib/new.txt", false).await.unwrap(),
            Some(b"x".to_vec())
        );
    }

    #[tokio::test]
    async fn child_only_write_still_moves_the_top_root() {
        let fx = Fixture::new();
        let (top, _) = seed_with_child(&fx).await;
        let forest = fx.open(Some(top)).await;
        let mut events = forest.subscribe();

        let hash = forest
            .write_file("lib/lib.txt", "edited", EntryMode::Regular)
            .await
            .unwrap();
        assert_ne!(hash, Some(top));

        let event = events.recv().await.unwrap();
        assert_eq!(event.hash, hash);
        assert_eq!(event.roots, vec!["lib".to_string(), String::new()]);
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn one_event_per_batch() {
        let forest = Forest::in_memory(ForestConfig::default()).await.unwrap();
        let mut events = forest.subscribe();

        let (a, b, c) = tokio::join!(
            forest.write_file("a", "1", EntryMode::Regular),
            forest.write_file("b", "2", EntryMode::Executable),
            forest.write_file("c", "a", EntryMode::Symlink),
        );
        let hash = a.unwrap();
        assert_eq!(b.unwrap(), hash);
        assert_eq!(c.unwrap(), hash);

        assert_eq!(events.recv().await.unwrap().hash, hash);
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));

        forest.remove("a").await.unwrap();
        assert_ne!(events.recv().await.unwrap().hash, hash);
    }

    #[tokio::test]
    async fn later_write_to_same_path_wins() {
        let forest = Forest::in_memory(ForestConfig::default()).await.unwrap();
        let (first, second) = tokio::join!(
            forest.write_file("f", "one", EntryMode::Regular),
            forest.write_file("f", "two", EntryMode::Regular),
        );
        assert_eq!(first.unwrap(), second.unwrap());
        assert_eq!(
            forest.read_file("f", false).await.unwrap(),
            Some(b"two".to_vec())
        );
    }

    #[tokio::test]
    async fn reads_wait_for_the_open_batch() {
        let forest = Forest::in_memory(ForestConfig::default()).await.unwrap();
        let repo = fx_repo(&forest).await;
        let id = blob(repo.as_ref(), "v").await;

        let ticket = forest.write("dir/v", Some(Entry::new(EntryMode::Regular, id)));
        let read = forest.read_file("dir/v", false).await.unwrap();
        assert_eq!(read, Some(b"v".to_vec()));
        ticket.await.unwrap();
    }

    /// Top root repository of an in-memory forest.
    async fn fx_repo(forest: &Forest) -> Arc<dyn RepoHandle> {
        forest.inner.live_root("").await.unwrap().handle()
    }

    #[tokio::test]
    async fn failed_batch_fails_every_writer_and_keeps_bookmarks() {
        let fx = Fixture::new();
        let top_repo = fx.factory.repo("");
        let dangling = ObjectId::from_hash([7; 20]);
        // Commit entry with no .gitmodules declaration.
        let top = commit_tree(
            top_repo.as_ref(),
            &[TreeMutation::set("orphan", EntryMode::Commit, dangling)],
        )
        .await;
        let forest = fx.open(Some(top)).await;

        let (good, bad) = tokio::join!(
            forest.write_file("ok.txt", "fine", EntryMode::Regular),
            async {
                forest
                    .write("orphan/x", Some(Entry::new(EntryMode::Regular, dangling)))
                    .await
            },
        );
        let good = good.unwrap_err();
        assert!(matches!(good, EngineError::BatchFailed(_)));
        assert!(matches!(
            bad.unwrap_err().root_cause(),
            EngineError::Resolve(_)
        ));

        let config = forest.root_config("").unwrap();
        assert_eq!(config.current, Some(top));
        assert_eq!(config.head, Some(top));
        assert!(forest.read_file("ok.txt", false).await.unwrap().is_none());

        // The forest keeps working after a failure.
        forest
            .write_file("ok.txt", "fine", EntryMode::Regular)
            .await
            .unwrap();
        assert!(forest.is_dirty("").unwrap());
    }

    #[tokio::test]
    async fn invalid_paths_fail_without_a_batch() {
        let forest = Forest::in_memory(ForestConfig::default()).await.unwrap();
        assert!(matches!(
            forest.remove("").await.unwrap_err(),
            EngineError::InvalidPath { .. }
        ));
        assert!(matches!(
            forest.remove("a/b\0c").await.unwrap_err(),
            EngineError::InvalidPath { .. }
        ));
        assert!(forest
            .write_file("d", "x", EntryMode::Tree)
            .await
            .is_err());
        assert!(matches!(
            forest.remove_submodule("/").await.unwrap_err(),
            EngineError::InvalidPath { .. }
        ));
        assert_eq!(forest.root_hash(), None);
    }

    #[tokio::test]
    async fn commit_records_working_state() {
        let fx = Fixture::new();
        let (top, _) = seed_with_child(&fx).await;
        let forest = fx.open(Some(top)).await;

        forest
            .write_file("new.txt", "n", EntryMode::Regular)
            .await
            .unwrap();
        let author = Person::new("Ada", "ada@example.com", 100, 60);
        let head = forest
            .commit("", "add new.txt", Some(author.clone()))
            .await
            .unwrap()
            .unwrap();

        let config = forest.root_config("").unwrap();
        assert_eq!(config.head, Some(head));
        assert_eq!(config.current, Some(head));
        assert!(!forest.is_dirty("").unwrap());

        let repo = fx.factory.repo("");
        assert_eq!(repo.refs().get("refs/heads/master"), Some(&head));
        let commit = forest.cache().load_commit(repo.as_ref(), &head).await.unwrap();
        assert_eq!(commit.parents, vec![top]);
        assert_eq!(commit.message, "add new.txt");
        assert_eq!(commit.author, author);
        assert_eq!(fx.configs.get("").unwrap().head, Some(head));

        // Nothing left to commit.
        assert_eq!(forest.commit("", "again", None).await.unwrap(), Some(head));
    }

    #[tokio::test]
    async fn committing_a_child_dirties_the_parent() {
        let fx = Fixture::new();
        let (top, child_head) = seed_with_child(&fx).await;
        let forest = fx.open(Some(top)).await;

        forest
            .write_file("lib/lib.txt", "v2", EntryMode::Regular)
            .await
            .unwrap();
        let new_head = forest.commit("lib", "v2", None).await.unwrap().unwrap();
        assert_ne!(new_head, child_head);
        assert!(!forest.is_dirty("lib").unwrap());
        assert!(forest.is_dirty("").unwrap());
        assert_eq!(
            fx.factory.repo("mem://lib").refs().get("refs/heads/master"),
            Some(&new_head)
        );
        assert_eq!(
            tree_entry_in_top(&forest, &fx, "lib").await,
            Some(new_head)
        );
    }

    async fn tree_entry_in_top(forest: &Forest, fx: &Fixture, name: &str) -> Option<ObjectId> {
        let repo = fx.factory.repo("");
        let commit = forest
            .cache()
            .load_commit(repo.as_ref(), &forest.root_hash()?)
            .await
            .unwrap();
        let tree = forest.cache().load_tree(repo.as_ref(), &commit.tree).await.unwrap();
        tree.get(name).map(|e| e.object_id)
    }

    #[tokio::test]
    async fn set_head_moves_ref_without_touching_current() {
        let fx = Fixture::new();
        let (top, _) = seed_with_child(&fx).await;
        let forest = fx.open(Some(top)).await;

        let working = forest
            .write_file("w", "w", EntryMode::Regular)
            .await
            .unwrap()
            .unwrap();
        forest.set_head("", working).await.unwrap();

        let config = forest.root_config("").unwrap();
        assert_eq!(config.head, Some(working));
        assert_eq!(config.current, Some(working));
        assert_eq!(
            fx.factory.repo("").refs().get("refs/heads/master"),
            Some(&working)
        );
        assert!(forest.set_head("", ObjectId::from_hash([3; 20])).await.is_err());
        assert!(matches!(
            forest.set_head("nowhere", working).await.unwrap_err(),
            EngineError::NotARoot(_)
        ));
    }

    #[tokio::test]
    async fn revert_child_restores_parent_entry() {
        let fx = Fixture::new();
        let (top, child_head) = seed_with_child(&fx).await;
        let forest = fx.open(Some(top)).await;

        forest
            .write_file("lib/lib.txt", "scratch", EntryMode::Regular)
            .await
            .unwrap();
        assert!(forest.is_dirty("lib").unwrap());

        let hash = forest.revert("lib").await.unwrap();
        assert_eq!(hash, Some(top));
        assert!(!forest.is_dirty("lib").unwrap());
        assert!(!forest.is_dirty("").unwrap());
        assert_eq!(
            forest.root_config("lib").unwrap().current,
            Some(child_head)
        );
    }

    #[tokio::test]
    async fn submodules_can_be_added_and_removed() {
        let fx = Fixture::new();
        let child_repo = fx.factory.repo("mem://extra");
        let data = blob(child_repo.as_ref(), "extra").await;
        let child = commit_tree(
            child_repo.as_ref(),
            &[TreeMutation::set("extra.txt", EntryMode::Regular, data)],
        )
        .await;
        let forest = fx.open(None).await;

        forest
            .add_submodule("vendor/extra", "mem://extra", child)
            .await
            .unwrap();
        let text = forest.read_file(".gitmodules", false).await.unwrap().unwrap();
        let modules = Gitmodules::parse(std::str::from_utf8(&text).unwrap()).unwrap();
        assert_eq!(
            modules.find_by_path("vendor/extra").unwrap().url.as_deref(),
            Some("mem://extra")
        );
        assert_eq!(
            forest.read_file("vendor/extra/extra.txt", false).await.unwrap(),
            Some(b"extra".to_vec())
        );
        assert!(forest.roots().contains(&"vendor/extra".to_string()));

        forest.remove_submodule("vendor/extra").await.unwrap();
        assert!(forest.resolve("vendor/extra", false).await.unwrap().is_none());
        assert!(forest.read_file(".gitmodules", false).await.unwrap().is_none());
        assert_eq!(forest.roots(), vec![String::new()]);
    }

    #[tokio::test]
    async fn writing_a_commit_at_a_root_path_repoints_it() {
        let fx = Fixture::new();
        let (top, _) = seed_with_child(&fx).await;
        let child_repo = fx.factory.repo("mem://lib");
        let other = commit_tree(child_repo.as_ref(), &[]).await;
        let forest = fx.open(Some(top)).await;
        // Make the child live.
        assert!(forest.resolve("lib/lib.txt", false).await.unwrap().is_some());

        forest
            .write("lib", Some(Entry::new(EntryMode::Commit, other)))
            .await
            .unwrap();
        let child = forest.root_config("lib").unwrap();
        assert_eq!(child.current, Some(other));
        assert_eq!(child.head, Some(other));
        assert!(forest.resolve("lib/lib.txt", false).await.unwrap().is_none());
        assert_eq!(tree_entry_in_top(&forest, &fx, "lib").await, Some(other));
    }

    #[tokio::test]
    async fn re_adding_a_submodule_with_a_new_url_reopens_it() {
        let fx = Fixture::new();
        let one_repo = fx.factory.repo("mem://one");
        let data = blob(one_repo.as_ref(), "one").await;
        let one = commit_tree(
            one_repo.as_ref(),
            &[TreeMutation::set("one.txt", EntryMode::Regular, data)],
        )
        .await;
        let two_repo = fx.factory.repo("mem://two");
        let data = blob(two_repo.as_ref(), "two").await;
        let two = commit_tree(
            two_repo.as_ref(),
            &[TreeMutation::set("two.txt", EntryMode::Regular, data)],
        )
        .await;
        let forest = fx.open(None).await;

        forest.add_submodule("lib", "mem://one", one).await.unwrap();
        assert_eq!(
            forest.read_file("lib/one.txt", false).await.unwrap(),
            Some(b"one".to_vec())
        );

        forest.add_submodule("lib", "mem://two", two).await.unwrap();
        assert_eq!(tree_entry_in_top(&forest, &fx, "lib").await, Some(two));
        assert_eq!(
            forest.read_file("lib/two.txt", false).await.unwrap(),
            Some(b"two".to_vec())
        );
        assert!(forest.read_file("lib/one.txt", false).await.unwrap().is_none());

        let child = forest.root_config("lib").unwrap();
        assert_eq!(child.url(), Some("mem://two"));
        assert_eq!(child.current, Some(two));
        assert_eq!(child.head, Some(two));
        assert!(!forest.is_dirty("lib").unwrap());
    }

    #[tokio::test]
    async fn undeclared_commit_links_can_be_repointed_and_removed() {
        let fx = Fixture::new();
        let top_repo = fx.factory.repo("");
        let dangling = ObjectId::from_hash([7; 20]);
        let other = ObjectId::from_hash([8; 20]);
        // No .gitmodules, so the link can never be opened.
        let top = commit_tree(
            top_repo.as_ref(),
            &[TreeMutation::set("orphan", EntryMode::Commit, dangling)],
        )
        .await;
        let forest = fx.open(Some(top)).await;

        forest
            .write("orphan", Some(Entry::new(EntryMode::Commit, other)))
            .await
            .unwrap();
        assert_eq!(tree_entry_in_top(&forest, &fx, "orphan").await, Some(other));

        forest.remove("orphan").await.unwrap();
        assert_eq!(tree_entry_in_top(&forest, &fx, "orphan").await, None);
        assert_eq!(forest.roots(), vec![String::new()]);
    }

    #[tokio::test]
    async fn failing_leaf_keeps_every_bookmark_including_siblings() {
        let fx = Fixture::new();
        let good_repo = fx.factory.repo("mem://good");
        let data = blob(good_repo.as_ref(), "good").await;
        let good = commit_tree(
            good_repo.as_ref(),
            &[TreeMutation::set("a.txt", EntryMode::Regular, data)],
        )
        .await;
        // A commit whose tree was never stored.
        let bad_repo = fx.factory.repo("mem://bad");
        let author = Person::new("Test", "test@example.com", 0, 0);
        let bad = bad_repo
            .save_object(&Object::Commit(Commit::new(
                ObjectId::from_hash([9; 20]),
                vec![],
                author,
                "broken",
            )))
            .await
            .unwrap();

        let top_repo = fx.factory.repo("");
        let mut modules = Gitmodules::new();
        modules.add(nest_modules::Submodule::new("good", "good", "mem://good"));
        modules.add(nest_modules::Submodule::new("bad", "bad", "mem://bad"));
        let gitmodules = blob(top_repo.as_ref(), &modules.encode()).await;
        let top = commit_tree(
            top_repo.as_ref(),
            &[
                TreeMutation::set(".gitmodules", EntryMode::Regular, gitmodules),
                TreeMutation::set("good", EntryMode::Commit, good),
                TreeMutation::set("bad", EntryMode::Commit, bad),
            ],
        )
        .await;
        let forest = fx.open(Some(top)).await;
        let mut events = forest.subscribe();

        let (ok, broken) = tokio::join!(
            forest.write_file("good/new.txt", "new", EntryMode::Regular),
            forest.write_file("bad/new.txt", "new", EntryMode::Regular),
        );
        let ok = ok.unwrap_err();
        assert!(matches!(ok, EngineError::BatchFailed(_)));
        assert!(matches!(ok.root_cause(), EngineError::Store(_)), "{ok}");
        assert!(matches!(
            broken.unwrap_err(),
            EngineError::BatchFailed(_)
        ));
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));

        for (root, commit) in [("", top), ("good", good), ("bad", bad)] {
            let config = forest.root_config(root).unwrap();
            assert_eq!(config.current, Some(commit), "{root:?}");
            assert_eq!(config.head, Some(commit), "{root:?}");
        }
        assert!(forest.read_file("good/new.txt", false).await.unwrap().is_none());
        assert_eq!(tree_entry_in_top(&forest, &fx, "good").await, Some(good));
    }

    struct Greeting;

    #[async_trait]
    impl Generator for Greeting {
        async fn generate(
            &self,
            ctx: &GenerateContext,
            _args: &[Value],
        ) -> ResolveResult<Option<VirtualNode>> {
            Ok(Some(VirtualNode::file(format!("made {}", ctx.target))))
        }
    }

    #[tokio::test]
    async fn registered_generators_serve_baked_reads() {
        let forest = Forest::in_memory(ForestConfig::default()).await.unwrap();
        forest.register_generator("greet", Arc::new(Greeting));
        forest
            .write_file(
                "docs/hello.txt.rule",
                r#"{"generator": "greet"}"#,
                EntryMode::Executable,
            )
            .await
            .unwrap();

        assert!(forest.read_file("docs/hello.txt", false).await.unwrap().is_none());
        assert_eq!(
            forest.read_file("docs/hello.txt", true).await.unwrap(),
            Some(b"made docs/hello.txt".to_vec())
        );
        let listing = forest.read_tree("docs", true).await.unwrap().unwrap();
        assert!(listing.get("hello.txt").is_some());
    }

    #[tokio::test]
    async fn configs_are_persisted_for_touched_roots() {
        let fx = Fixture::new();
        let (top, _) = seed_with_child(&fx).await;
        let forest = fx.open(Some(top)).await;

        let hash = forest
            .write_file("lib/more.txt", "m", EntryMode::Regular)
            .await
            .unwrap();
        assert_eq!(fx.configs.get("").unwrap().current, hash);
        let child = forest.root_config("lib").unwrap();
        assert_eq!(fx.configs.get("lib").unwrap(), child);
        assert_eq!(child.url(), Some("mem://lib"));
    }
}
