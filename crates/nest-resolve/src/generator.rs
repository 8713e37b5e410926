use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use nest_codec::{validate_entry_name, Blob, Object, Tree, TreeEntry};
use nest_store::ObjectCache;
use nest_types::{EntryMode, ObjectId};
use serde_json::Value;

use crate::error::{ResolveError, ResolveResult};

/// Content synthesized by a rule.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VirtualNode {
    File { data: Vec<u8>, executable: bool },
    Tree(BTreeMap<String, VirtualNode>),
    /// A symlink; baked resolution follows it like a literal one.
    Link(String),
}

impl VirtualNode {
    pub fn file(data: impl Into<Vec<u8>>) -> Self {
        Self::File {
            data: data.into(),
            executable: false,
        }
    }

    /// Store the node (and everything under it) in `cache` as ordinary
    /// objects and return the entry that refers to it.
    pub fn plant(&self, cache: &ObjectCache) -> Result<(EntryMode, ObjectId), String> {
        match self {
            Self::File { data, executable } => {
                let mode = if *executable {
                    EntryMode::Executable
                } else {
                    EntryMode::Regular
                };
                Ok((mode, cache.insert(Object::Blob(Blob::new(data.clone())))))
            }
            Self::Link(target) => Ok((
                EntryMode::Symlink,
                cache.insert(Object::Blob(Blob::new(target.as_bytes()))),
            )),
            Self::Tree(children) => {
                let mut entries = Vec::with_capacity(children.len());
                for (name, child) in children {
                    validate_entry_name(name).map_err(|e| e.to_string())?;
                    let (mode, id) = child.plant(cache)?;
                    entries.push(TreeEntry::new(name.clone(), mode, id));
                }
                Ok((EntryMode::Tree, cache.insert(Object::Tree(Tree::new(entries)))))
            }
        }
    }
}

/// What a generator knows about the rule it runs for.
#[derive(Clone, Debug)]
pub struct GenerateContext {
    /// Global path of the rule file.
    pub rule_path: String,
    /// Global path the rule produces.
    pub target: String,
    /// Global path of the root holding the rule.
    pub root: String,
}

impl GenerateContext {
    /// A `MalformedRule` error for this rule.
    pub fn malformed(&self, reason: impl Into<String>) -> ResolveError {
        ResolveError::MalformedRule {
            rule_path: self.rule_path.clone(),
            reason: reason.into(),
        }
    }
}

/// Produces virtual content from rule arguments.
///
/// `Ok(None)` means the rule defines nothing for its target, and resolution
/// falls back to less specific rules.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(
        &self,
        ctx: &GenerateContext,
        args: &[Value],
    ) -> ResolveResult<Option<VirtualNode>>;
}

/// Generators by name.
pub struct GeneratorRegistry {
    generators: RwLock<HashMap<String, Arc<dyn Generator>>>,
}

impl GeneratorRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            generators: RwLock::new(HashMap::new()),
        }
    }

    /// A registry holding `text`, `json`, and `link`.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register("text", Arc::new(TextGenerator));
        registry.register("json", Arc::new(JsonGenerator));
        registry.register("link", Arc::new(LinkGenerator));
        registry
    }

    /// Register (or replace) a generator.
    pub fn register(&self, name: impl Into<String>, generator: Arc<dyn Generator>) {
        self.generators
            .write()
            .expect("lock poisoned")
            .insert(name.into(), generator);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Generator>> {
        self.generators.read().expect("lock poisoned").get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .generators
            .read()
            .expect("lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

impl Default for GeneratorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// `text(content, executable?)`: a file with literal content.
struct TextGenerator;

#[async_trait]
impl Generator for TextGenerator {
    async fn generate(
        &self,
        ctx: &GenerateContext,
        args: &[Value],
    ) -> ResolveResult<Option<VirtualNode>> {
        let data = match args.first() {
            Some(Value::String(s)) => s.as_bytes().to_vec(),
            Some(Value::Null) | None => return Ok(None),
            Some(_) => return Err(ctx.malformed("text: first argument must be a string")),
        };
        let executable = matches!(args.get(1), Some(Value::Bool(true)));
        Ok(Some(VirtualNode::File { data, executable }))
    }
}

/// `json(value)`: objects become directories, strings become files, and
/// any other value becomes a file holding its JSON text.
struct JsonGenerator;

impl JsonGenerator {
    fn node(value: &Value) -> VirtualNode {
        match value {
            Value::Object(map) => VirtualNode::Tree(
                map.iter()
                    .map(|(key, value)| (key.clone(), Self::node(value)))
                    .collect(),
            ),
            Value::String(s) => VirtualNode::file(s.as_bytes()),
            other => VirtualNode::file(other.to_string().into_bytes()),
        }
    }
}

#[async_trait]
impl Generator for JsonGenerator {
    async fn generate(
        &self,
        _ctx: &GenerateContext,
        args: &[Value],
    ) -> ResolveResult<Option<VirtualNode>> {
        match args.first() {
            Some(Value::Null) | None => Ok(None),
            Some(value) => Ok(Some(Self::node(value))),
        }
    }
}

/// `link(target)`: a symlink to another path.
struct LinkGenerator;

#[async_trait]
impl Generator for LinkGenerator {
    async fn generate(
        &self,
        ctx: &GenerateContext,
        args: &[Value],
    ) -> ResolveResult<Option<VirtualNode>> {
        match args.first() {
            Some(Value::String(target)) if !target.is_empty() => {
                Ok(Some(VirtualNode::Link(target.clone())))
            }
            _ => Err(ctx.malformed("link: first argument must be a non-empty path")),
        }
    }
}
