//! Path resolution for nest.
//!
//! [`Resolver::resolve`] walks a global path through one or more repository
//! roots, crossing into child roots at commit-mode entries.
//!
//! - *Raw* mode is a literal lookup: a missing segment is `Ok(None)`.
//! - *Baked* mode also consults rule files (`<name>.rule`, executable) found
//!   along the walk. When a segment is missing, recorded rules are tried
//!   most specific first. Symlinks redirect the walk. Terminal trees carry
//!   their pending rules as overlays, merged lazily by [`Resolver::fetch`]
//!   with precedence literal > local rule > nearest ancestor rule.

pub mod error;
pub mod generator;
pub mod path;
pub mod resolver;
pub mod rule;

pub use error::{ResolveError, ResolveResult};
pub use generator::{GenerateContext, Generator, GeneratorRegistry, VirtualNode};
pub use resolver::{Fetched, PendingRule, Resolved, Resolver};
pub use rule::{parse_rule, Rule, RULE_SUFFIX};
