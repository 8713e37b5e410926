use std::sync::Arc;

use nest_store::{ConfigStore, ObjectCache, RepoConfig, RepoFactory};
use nest_types::ObjectId;
use tracing::{debug, info};

use crate::error::{ModuleError, ModuleResult};
use crate::gitmodules::{Gitmodules, GITMODULES};
use crate::roots::{RepoRoot, RootTable};

/// Opens repository roots and keeps them live in a [`RootTable`].
pub struct SubmoduleLifecycle {
    factory: Arc<dyn RepoFactory>,
    configs: Arc<dyn ConfigStore>,
    roots: Arc<RootTable>,
    cache: Arc<ObjectCache>,
    default_ref: String,
}

impl SubmoduleLifecycle {
    pub fn new(
        factory: Arc<dyn RepoFactory>,
        configs: Arc<dyn ConfigStore>,
        roots: Arc<RootTable>,
        cache: Arc<ObjectCache>,
        default_ref: impl Into<String>,
    ) -> Self {
        Self {
            factory,
            configs,
            roots,
            cache,
            default_ref: default_ref.into(),
        }
    }

    pub fn roots(&self) -> &Arc<RootTable> {
        &self.roots
    }

    pub fn configs(&self) -> &Arc<dyn ConfigStore> {
        &self.configs
    }

    /// Open a root from an explicit config, merged with whatever the config
    /// store already knows for `path`.
    ///
    /// A root with no bookmarks starts from its ref, so a repository that
    /// already has history opens clean at its tip.
    pub async fn attach(&self, path: &str, config: RepoConfig) -> ModuleResult<Arc<RepoRoot>> {
        if let Some(root) = self.roots.get(path) {
            return Ok(root);
        }
        let mut config = config;
        if let Some(known) = self.configs.load(path).await? {
            config.merge_known(&known);
        }
        let ref_name = config
            .ref_name
            .get_or_insert_with(|| self.default_ref.clone())
            .clone();

        let handle = self.factory.open(path, &config).await?;
        if config.head.is_none() && config.current.is_none() {
            if let Some(tip) = handle.read_ref(&ref_name).await? {
                config.head = Some(tip);
                config.current = Some(tip);
            }
        }
        if config.current.is_none() {
            config.current = config.head;
        }

        info!(root = path, current = ?config.current, "attached root");
        self.configs.save(path, &config).await?;
        Ok(self.roots.insert(RepoRoot::new(path, handle, config)))
    }

    /// The live child root mounted at `local_path` inside `parent`, opening
    /// it on first use.
    ///
    /// `commit` is the commit-mode entry found in the parent's tree; it
    /// becomes the child's `current`. The child's origin comes from the
    /// parent's `.gitmodules`.
    pub async fn materialize(
        &self,
        parent: &RepoRoot,
        local_path: &str,
        commit: &ObjectId,
    ) -> ModuleResult<Arc<RepoRoot>> {
        let global = join(parent.path(), local_path);
        if let Some(root) = self.roots.get(&global) {
            return Ok(root);
        }

        let modules = self.read_gitmodules(parent).await?;
        let module = modules
            .find_by_path(local_path)
            .ok_or_else(|| ModuleError::MissingSubmoduleConfig {
                path: global.clone(),
                reason: format!("no {GITMODULES} entry for {local_path:?}"),
            })?;
        let url = module
            .url
            .clone()
            .ok_or_else(|| ModuleError::MissingSubmoduleConfig {
                path: global.clone(),
                reason: format!("submodule {:?} has no url", module.name),
            })?;

        let mut config = RepoConfig::with_url(url.clone());
        config.current = Some(*commit);
        match self.configs.load(&global).await? {
            // A config left behind by a repository this path used to hold.
            Some(known) if known.url().is_some_and(|old| old != url) => {
                debug!(
                    root = %global,
                    stale = ?known.url(),
                    "ignoring config of replaced submodule"
                );
            }
            Some(known) => config.merge_known(&known),
            None => {}
        }
        if config.head.is_none() {
            config.head = Some(*commit);
        }
        if config.ref_name.is_none() {
            config.ref_name = Some(self.default_ref.clone());
        }

        let handle = self.factory.open(&global, &config).await?;
        self.configs.save(&global, &config).await?;
        info!(root = %global, current = %commit, "materialized submodule");
        Ok(self.roots.insert(RepoRoot::new(global, handle, config)))
    }

    /// The `.gitmodules` of a root's current tree (empty if absent).
    pub async fn read_gitmodules(&self, root: &RepoRoot) -> ModuleResult<Gitmodules> {
        match self.read_gitmodules_text(root).await? {
            Some(text) => Gitmodules::parse(&text),
            None => Ok(Gitmodules::new()),
        }
    }

    /// Raw `.gitmodules` text of a root's current tree.
    pub async fn read_gitmodules_text(&self, root: &RepoRoot) -> ModuleResult<Option<String>> {
        let Some(current) = root.current() else {
            return Ok(None);
        };
        let commit = self.cache.load_commit(root.repo(), &current).await?;
        let tree = self.cache.load_tree(root.repo(), &commit.tree).await?;
        let Some(entry) = tree.get(GITMODULES) else {
            return Ok(None);
        };
        let blob = self.cache.load_blob(root.repo(), &entry.object_id).await?;
        debug!(root = root.path(), "read {GITMODULES}");
        let text = String::from_utf8(blob.data).map_err(|_| ModuleError::MalformedGitmodules {
            line: 0,
            reason: "not valid UTF-8".into(),
        })?;
        Ok(Some(text))
    }
}

fn join(parent: &str, local: &str) -> String {
    if parent.is_empty() {
        local.to_string()
    } else {
        format!("{parent}/{local}")
    }
}
