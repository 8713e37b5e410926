//! `.gitmodules` codec.
//!
//! ```text
//! [submodule "lib"]
//! 	path = vendor/lib
//! 	url = https://example.com/lib.git
//! ```
//!
//! Sections keep their file order and keys their in-section order, so
//! `parse(encode(m)) == m` and the engine can rewrite the file as part of an
//! ordinary batch.

use std::fmt;

use crate::error::{ModuleError, ModuleResult};

/// File name of the submodule metadata blob at the top of a root.
pub const GITMODULES: &str = ".gitmodules";

/// One `[submodule "name"]` section.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Submodule {
    pub name: String,
    /// Path of the child root, relative to the parent root.
    pub path: String,
    pub url: Option<String>,
    /// Any other keys, in file order.
    pub extra: Vec<(String, String)>,
}

impl Submodule {
    pub fn new(name: impl Into<String>, path: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            url: Some(url.into()),
            extra: Vec::new(),
        }
    }
}

/// Parsed `.gitmodules`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Gitmodules {
    modules: Vec<Submodule>,
}

impl Gitmodules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `.gitmodules` text.
    pub fn parse(text: &str) -> ModuleResult<Self> {
        let mut modules: Vec<Submodule> = Vec::new();
        let mut current: Option<(usize, Submodule)> = None;

        for (index, raw) in text.lines().enumerate() {
            let line_no = index + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            let malformed = |reason: &str| ModuleError::MalformedGitmodules {
                line: line_no,
                reason: reason.to_string(),
            };

            if line.starts_with('[') {
                if let Some(done) = current.take() {
                    modules.push(finish(done)?);
                }
                let name = line
                    .strip_prefix("[submodule \"")
                    .and_then(|rest| rest.strip_suffix("\"]"))
                    .ok_or_else(|| malformed("expected [submodule \"name\"]"))?;
                current = Some((
                    line_no,
                    Submodule {
                        name: name.to_string(),
                        path: String::new(),
                        url: None,
                        extra: Vec::new(),
                    },
                ));
                continue;
            }

            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| malformed("expected key = value"))?;
            let key = key.trim();
            let value = unquote(value.trim());
            let Some((_, module)) = current.as_mut() else {
                return Err(malformed("key outside of a submodule section"));
            };
            match key {
                "path" => module.path = value.to_string(),
                "url" => module.url = Some(value.to_string()),
                _ => module.extra.push((key.to_string(), value.to_string())),
            }
        }

        if let Some(done) = current.take() {
            modules.push(finish(done)?);
        }
        Ok(Self { modules })
    }

    /// Encode back to text. An empty set encodes to an empty string.
    pub fn encode(&self) -> String {
        self.to_string()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Submodule> {
        self.modules.iter()
    }

    pub fn get(&self, name: &str) -> Option<&Submodule> {
        self.modules.iter().find(|m| m.name == name)
    }

    /// The submodule mounted at `path`.
    pub fn find_by_path(&self, path: &str) -> Option<&Submodule> {
        self.modules.iter().find(|m| m.path == path)
    }

    /// Add a submodule, replacing any with the same name or path in place.
    pub fn add(&mut self, module: Submodule) {
        let existing = self
            .modules
            .iter()
            .position(|m| m.name == module.name || m.path == module.path);
        match existing {
            Some(at) => {
                self.modules[at] = module;
                let path = self.modules[at].path.clone();
                let name = self.modules[at].name.clone();
                let mut index = 0;
                self.modules.retain(|m| {
                    let keep = index == at || (m.path != path && m.name != name);
                    index += 1;
                    keep
                });
            }
            None => self.modules.push(module),
        }
    }

    /// Remove the submodule mounted at `path`.
    pub fn remove_path(&mut self, path: &str) -> Option<Submodule> {
        let at = self.modules.iter().position(|m| m.path == path)?;
        Some(self.modules.remove(at))
    }
}

impl fmt::Display for Gitmodules {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for module in &self.modules {
            writeln!(f, "[submodule \"{}\"]", module.name)?;
            writeln!(f, "\tpath = {}", module.path)?;
            if let Some(url) = &module.url {
                writeln!(f, "\turl = {url}")?;
            }
            for (key, value) in &module.extra {
                writeln!(f, "\t{key} = {value}")?;
            }
        }
        Ok(())
    }
}

/// A pending change to a root's `.gitmodules`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModuleEdit {
    Add(Submodule),
    Remove { path: String },
}

/// Apply `edits` to existing `.gitmodules` text (or none).
///
/// Returns the new text, or `None` when no submodules remain and the file
/// should be deleted.
pub fn apply_edits(existing: Option<&str>, edits: &[ModuleEdit]) -> ModuleResult<Option<String>> {
    let mut modules = match existing {
        Some(text) => Gitmodules::parse(text)?,
        None => Gitmodules::new(),
    };
    for edit in edits {
        match edit {
            ModuleEdit::Add(module) => modules.add(module.clone()),
            ModuleEdit::Remove { path } => {
                modules.remove_path(path);
            }
        }
    }
    Ok((!modules.is_empty()).then(|| modules.encode()))
}

fn finish((line, module): (usize, Submodule)) -> ModuleResult<Submodule> {
    if module.path.is_empty() {
        return Err(ModuleError::MalformedGitmodules {
            line,
            reason: format!("submodule {:?} has no path", module.name),
        });
    }
    Ok(module)
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}
