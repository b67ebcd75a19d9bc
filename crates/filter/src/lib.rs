//! Inclusion and exclusion predicates over directory entries.
//!
//! A [`RuleSet`] is compiled once from command-line [`RuleSpec`]s and then
//! evaluated against every entry a walk produces. Rules come in two
//! polarities: positive rules must all match for an entry to be selected,
//! and any matching negative (`exclude-`) rule rejects it outright.
//!
//! Selection never influences traversal; callers walk everything and ask
//! the rule set about each entry.
//!
//! ```
//! use fastdbfs_filter::{RuleSet, RuleSpec};
//! use fastdbfs_storage::{DirEntry, FileInfo};
//! use time::OffsetDateTime;
//!
//! let rules = RuleSet::compile([
//!     RuleSpec::new("iname", "*.jpg"),
//!     RuleSpec::new("exclude-iwholere", "/tmp/"),
//! ]).unwrap();
//! let entry = |relpath: &str| DirEntry::new(relpath, FileInfo::file(relpath, 1, OffsetDateTime::now_utc()));
//! assert!(rules.evaluate(&entry("a/photo.jpg")));
//! assert!(!rules.evaluate(&entry("a/tmp/photo.jpg")));
//! assert!(!rules.evaluate(&entry("a/photo.png")));
//! ```

pub mod error;
mod external;
mod rule;
mod value;

pub use crate::rule::{EXCLUDE_PREFIX, Rule, RuleKind, RuleSpec};
use crate::error::Result;
use fastdbfs_storage::DirEntry;
use time::OffsetDateTime;

/// A compiled, ordered collection of rules.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}
impl RuleSet {
    /// Compile rule specifications, resolving relative times against the current instant.
    pub fn compile(specs: impl IntoIterator<Item = RuleSpec>) -> Result<Self> {
        Self::compile_at(specs, OffsetDateTime::now_utc())
    }

    /// Compile with an explicit reference instant for `newer-than` / `older-than`.
    pub fn compile_at(specs: impl IntoIterator<Item = RuleSpec>, now: OffsetDateTime) -> Result<Self> {
        let mut rules = specs.into_iter().map(|spec| Rule::compile(&spec, now)).collect::<Result<Vec<_>>>()?;
        // Stable, so rules of equal cost keep their command-line order.
        rules.sort_by_key(Rule::cost);
        tracing::debug!(rules = rules.len(), "compiled rule set");
        Ok(Self { rules })
    }

    /// A rule set that selects everything.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rules in processing order.
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Whether `entry` is selected: every applicable positive rule matches
    /// and no applicable negative rule does.
    pub fn evaluate(&self, entry: &DirEntry) -> bool {
        self.rules.iter().all(|rule| match rule.test(entry) {
            None => true,
            Some(matched) => matched != rule.is_negated(),
        })
    }
}
