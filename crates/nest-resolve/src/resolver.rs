use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use nest_codec::{Blob, Tree, TreeEntry};
use nest_modules::{RepoRoot, SubmoduleLifecycle};
use nest_store::ObjectCache;
use nest_types::{EntryMode, ObjectId};
use tracing::debug;

use crate::error::{ResolveError, ResolveResult};
use crate::generator::{GenerateContext, GeneratorRegistry, VirtualNode};
use crate::path::{self, depth, join, resolve_relative, split_last};
use crate::rule::{parse_rule, rule_target, Rule, RULE_SUFFIX};

/// A rule recorded during a baked walk, not yet applied.
#[derive(Clone, Debug)]
pub struct PendingRule {
    /// Global path of the `.rule` entry.
    pub rule_path: String,
    /// Global path the rule produces.
    pub target: String,
    /// Root holding the rule.
    pub root: Arc<RepoRoot>,
    /// Blob holding the rule text.
    pub blob: ObjectId,
}

/// Metadata for a resolved path. Content is loaded by [`Resolver::fetch`].
#[derive(Clone, Debug)]
pub struct Resolved {
    /// Global path reached, after any redirects.
    pub path: String,
    /// Root that owns the entry.
    pub root: Arc<RepoRoot>,
    /// `path` relative to `root`.
    pub local_path: String,
    pub mode: EntryMode,
    pub id: ObjectId,
    /// Ancestor rules to overlay onto a tree, nearest first.
    pub overlays: Vec<PendingRule>,
    pub baked: bool,
}

/// Content of a resolved path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Fetched {
    Blob(Blob),
    Tree(Tree),
}

/// Position of a walk.
struct Cursor {
    root: Arc<RepoRoot>,
    path: String,
    mode: EntryMode,
    id: ObjectId,
}

/// Resolves global paths across the live roots of a forest.
pub struct Resolver {
    lifecycle: Arc<SubmoduleLifecycle>,
    cache: Arc<ObjectCache>,
    generators: Arc<GeneratorRegistry>,
    rules: RwLock<HashMap<ObjectId, Arc<Rule>>>,
    max_redirects: usize,
}

impl Resolver {
    pub fn new(
        lifecycle: Arc<SubmoduleLifecycle>,
        cache: Arc<ObjectCache>,
        generators: Arc<GeneratorRegistry>,
        max_redirects: usize,
    ) -> Self {
        Self {
            lifecycle,
            cache,
            generators,
            rules: RwLock::new(HashMap::new()),
            max_redirects,
        }
    }

    pub fn generators(&self) -> &Arc<GeneratorRegistry> {
        &self.generators
    }

    /// Tree of a root's `current` commit, or the empty tree.
    pub async fn root_tree(&self, root: &RepoRoot) -> ResolveResult<ObjectId> {
        match root.current() {
            Some(current) => Ok(self.cache.load_commit(root.repo(), &current).await?.tree),
            None => Ok(ObjectCache::empty_tree_id()),
        }
    }

    /// Resolve `path`. `Ok(None)` means not found.
    pub async fn resolve(&self, path: &str, bake: bool) -> ResolveResult<Option<Resolved>> {
        let mut target = path::normalize(path);
        let mut redirects = 0usize;

        'restart: loop {
            let segments = path::segments(&target);
            let top = self.lifecycle.roots().get("").ok_or(ResolveError::NoRoot)?;
            let mut cursor = Cursor {
                id: self.root_tree(&top).await?,
                root: top,
                path: String::new(),
                mode: EntryMode::Tree,
            };
            let mut pending: Vec<PendingRule> = Vec::new();
            let mut index = 0;

            while index < segments.len() {
                let name = &segments[index];

                if cursor.mode.is_symlink() && bake {
                    target = self.redirect(&cursor, &segments[index..]).await?;
                    redirects = self.count_redirect(redirects, &target)?;
                    continue 'restart;
                }

                let child = if cursor.mode.is_tree() {
                    let tree = self.cache.load_tree(cursor.root.repo(), &cursor.id).await?;
                    if bake {
                        if let Some(rule) = rule_entry(&tree, name) {
                            pending.push(PendingRule {
                                rule_path: join(&cursor.path, &rule.name),
                                target: join(&cursor.path, name),
                                root: cursor.root.clone(),
                                blob: rule.object_id,
                            });
                        }
                    }
                    tree.get(name).cloned()
                } else {
                    None
                };

                match child {
                    Some(entry) => {
                        cursor.path = join(&cursor.path, name);
                        cursor.mode = entry.mode;
                        cursor.id = entry.object_id;
                        index += 1;
                        if entry.mode.is_commit() {
                            self.enter_child(&mut cursor).await?;
                        }
                    }
                    None if bake => {
                        // Most specific rule first; each attempt counts as a redirect.
                        let mut applied = false;
                        while let Some(rule) = pending.pop() {
                            redirects = self.count_redirect(redirects, &target)?;
                            let Some(node) = self.run_rule(&rule).await? else {
                                continue;
                            };
                            let (mode, id) = self.plant(&rule, &node)?;
                            debug!(rule = %rule.rule_path, target = %rule.target, "rule supplies missing path");
                            index = depth(&rule.target);
                            cursor = Cursor {
                                root: rule.root,
                                path: rule.target,
                                mode,
                                id,
                            };
                            applied = true;
                            break;
                        }
                        if !applied {
                            return Ok(None);
                        }
                    }
                    None => return Ok(None),
                }
            }

            if cursor.mode.is_symlink() && bake {
                target = self.redirect(&cursor, &[]).await?;
                redirects = self.count_redirect(redirects, &target)?;
                continue 'restart;
            }

            pending.reverse();
            let local_path = cursor
                .root
                .local_path(&cursor.path)
                .unwrap_or_default()
                .to_string();
            return Ok(Some(Resolved {
                path: cursor.path,
                root: cursor.root,
                local_path,
                mode: cursor.mode,
                id: cursor.id,
                overlays: if bake { pending } else { Vec::new() },
                baked: bake,
            }));
        }
    }

    /// Load the content of a resolved path. Baked trees get their local
    /// rules and ancestor overlays merged in, each filling only names that
    /// are still absent.
    pub async fn fetch(&self, resolved: &Resolved) -> ResolveResult<Fetched> {
        let repo = resolved.root.repo();
        let tree_id = match resolved.mode {
            EntryMode::Tree => resolved.id,
            EntryMode::Commit => self.cache.load_commit(repo, &resolved.id).await?.tree,
            _ => return Ok(Fetched::Blob(self.cache.load_blob(repo, &resolved.id).await?)),
        };
        let mut tree = self.cache.load_tree(repo, &tree_id).await?;
        if resolved.baked {
            self.merge_local_rules(resolved, &mut tree).await?;
            self.merge_overlays(resolved, &mut tree).await?;
        }
        Ok(Fetched::Tree(tree))
    }

    /// The deepest root reached by a raw walk of `path`, materializing child
    /// roots along the way. Stops at the first missing or non-tree segment.
    pub async fn owning_root(&self, path: &str) -> ResolveResult<Arc<RepoRoot>> {
        let top = self.lifecycle.roots().get("").ok_or(ResolveError::NoRoot)?;
        let mut cursor = Cursor {
            id: self.root_tree(&top).await?,
            root: top,
            path: String::new(),
            mode: EntryMode::Tree,
        };
        for name in path::segments(&path::normalize(path)) {
            let tree = self.cache.load_tree(cursor.root.repo(), &cursor.id).await?;
            let Some(entry) = tree.get(&name).cloned() else {
                break;
            };
            cursor.path = join(&cursor.path, &name);
            cursor.mode = entry.mode;
            cursor.id = entry.object_id;
            match entry.mode {
                EntryMode::Tree => {}
                EntryMode::Commit => self.enter_child(&mut cursor).await?,
                _ => break,
            }
        }
        Ok(cursor.root)
    }

    /// Step from a commit-mode entry into the child root's tree.
    async fn enter_child(&self, cursor: &mut Cursor) -> ResolveResult<()> {
        let local = cursor
            .root
            .local_path(&cursor.path)
            .unwrap_or_default()
            .to_string();
        let child = self
            .lifecycle
            .materialize(&cursor.root, &local, &cursor.id)
            .await?;
        cursor.id = self.root_tree(&child).await?;
        cursor.mode = EntryMode::Tree;
        cursor.root = child;
        Ok(())
    }

    /// The path a symlink at the cursor points to, with `rest` appended.
    async fn redirect(&self, cursor: &Cursor, rest: &[String]) -> ResolveResult<String> {
        let blob = self.cache.load_blob(cursor.root.repo(), &cursor.id).await?;
        let link = String::from_utf8_lossy(&blob.data).trim_end().to_string();
        let (dir, _) = split_last(&cursor.path);
        let mut target = resolve_relative(dir, &link);
        for segment in rest {
            target = join(&target, segment);
        }
        debug!(from = %cursor.path, to = %target, "following symlink");
        Ok(target)
    }

    fn count_redirect(&self, redirects: usize, target: &str) -> ResolveResult<usize> {
        let next = redirects + 1;
        if next > self.max_redirects {
            return Err(ResolveError::TooManyRedirects {
                path: target.to_string(),
                limit: self.max_redirects,
            });
        }
        Ok(next)
    }

    async fn merge_local_rules(&self, resolved: &Resolved, tree: &mut Tree) -> ResolveResult<()> {
        let locals: Vec<(String, TreeEntry)> = tree
            .entries()
            .iter()
            .filter(|e| e.mode.is_executable())
            .filter_map(|e| rule_target(&e.name).map(|t| (t.to_string(), e.clone())))
            .filter(|(target, _)| tree.get(target).is_none())
            .collect();

        for (name, entry) in locals {
            let rule = PendingRule {
                rule_path: join(&resolved.path, &entry.name),
                target: join(&resolved.path, &name),
                root: resolved.root.clone(),
                blob: entry.object_id,
            };
            if let Some(node) = self.run_rule(&rule).await? {
                let (mode, id) = self.plant(&rule, &node)?;
                tree.insert(TreeEntry::new(name, mode, id));
            }
        }
        Ok(())
    }

    async fn merge_overlays(&self, resolved: &Resolved, tree: &mut Tree) -> ResolveResult<()> {
        for rule in &resolved.overlays {
            let Some(node) = self.run_rule(rule).await? else {
                continue;
            };
            let (mode, id) = self.plant(rule, &node)?;
            let rest = resolved
                .path
                .strip_prefix(rule.target.as_str())
                .unwrap_or_default();
            let Some(layer) = self.descend(rule, mode, id, rest).await? else {
                continue;
            };
            for entry in layer.entries() {
                if tree.get(&entry.name).is_none() {
                    tree.insert(entry.clone());
                }
            }
        }
        Ok(())
    }

    /// Walk generated output down `rest`, through trees only.
    async fn descend(
        &self,
        rule: &PendingRule,
        mode: EntryMode,
        id: ObjectId,
        rest: &str,
    ) -> ResolveResult<Option<Tree>> {
        if !mode.is_tree() {
            return Ok(None);
        }
        let repo = rule.root.repo();
        let mut tree = self.cache.load_tree(repo, &id).await?;
        for name in path::segments(rest) {
            let next = match tree.get(&name) {
                Some(entry) if entry.mode.is_tree() => entry.object_id,
                _ => return Ok(None),
            };
            tree = self.cache.load_tree(repo, &next).await?;
        }
        Ok(Some(tree))
    }

    async fn run_rule(&self, rule: &PendingRule) -> ResolveResult<Option<VirtualNode>> {
        let parsed = self.load_rule(rule).await?;
        let generator = self.generators.get(&parsed.generator).ok_or_else(|| {
            ResolveError::UnknownGenerator {
                rule_path: rule.rule_path.clone(),
                name: parsed.generator.clone(),
            }
        })?;
        let ctx = GenerateContext {
            rule_path: rule.rule_path.clone(),
            target: rule.target.clone(),
            root: rule.root.path().to_string(),
        };
        debug!(rule = %rule.rule_path, generator = %parsed.generator, "running rule");
        generator.generate(&ctx, &parsed.args).await
    }

    /// Parsed rule text, cached by blob hash.
    async fn load_rule(&self, rule: &PendingRule) -> ResolveResult<Arc<Rule>> {
        let cached = self
            .rules
            .read()
            .expect("lock poisoned")
            .get(&rule.blob)
            .cloned();
        if let Some(parsed) = cached {
            return Ok(parsed);
        }
        let blob = self.cache.load_blob(rule.root.repo(), &rule.blob).await?;
        let malformed = |reason: String| ResolveError::MalformedRule {
            rule_path: rule.rule_path.clone(),
            reason,
        };
        let text = String::from_utf8(blob.data).map_err(|_| malformed("not valid UTF-8".into()))?;
        let parsed = Arc::new(parse_rule(&text).map_err(malformed)?);
        self.rules
            .write()
            .expect("lock poisoned")
            .insert(rule.blob, parsed.clone());
        Ok(parsed)
    }

    fn plant(&self, rule: &PendingRule, node: &VirtualNode) -> ResolveResult<(EntryMode, ObjectId)> {
        node.plant(&self.cache)
            .map_err(|reason| ResolveError::MalformedRule {
                rule_path: rule.rule_path.clone(),
                reason,
            })
    }
}

/// The executable `<name>.rule` entry in `tree`, if any.
fn rule_entry(tree: &Tree, name: &str) -> Option<TreeEntry> {
    tree.get(&format!("{name}{RULE_SUFFIX}"))
        .filter(|e| e.mode.is_executable())
        .cloned()
}
