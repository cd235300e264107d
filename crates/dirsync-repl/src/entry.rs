//! Directory entry model shared by both engines.
//!
//! Only what replication needs: a DN, a stable uuid, multi-valued attributes,
//! the CSN of the last change, and a small attribute-change vocabulary.

use crate::csn::Csn;
use crate::error::ApplyError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

/// Stable identifier of an entry, independent of its DN.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryUuid(Uuid);

impl EntryUuid {
    /// Generate a fresh random uuid.
    pub fn new_v4() -> Self {
        EntryUuid(Uuid::new_v4())
    }

    /// Wrap an existing uuid.
    pub fn from_uuid(uuid: Uuid) -> Self {
        EntryUuid(uuid)
    }

    /// Deterministic uuid from a number (tests and fixtures).
    pub fn from_u128(v: u128) -> Self {
        EntryUuid(Uuid::from_u128(v))
    }

    /// The wrapped uuid.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for EntryUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A distinguished name, normalized to lowercase with no spaces around commas.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Dn(String);

impl Dn {
    /// Normalize and wrap a DN string.
    pub fn new(raw: &str) -> Self {
        let norm = raw
            .split(',')
            .map(|rdn| rdn.trim().to_ascii_lowercase())
            .filter(|rdn| !rdn.is_empty())
            .collect::<Vec<_>>()
            .join(",");
        Dn(norm)
    }

    /// The normalized string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Number of RDN components.
    pub fn depth(&self) -> usize {
        if self.0.is_empty() {
            0
        } else {
            self.0.split(',').count()
        }
    }

    /// The immediate parent, or `None` for a single-component DN.
    pub fn parent(&self) -> Option<Dn> {
        self.0.split_once(',').map(|(_, rest)| Dn(rest.to_string()))
    }

    /// True when `self` equals `base` or sits below it.
    pub fn is_within(&self, base: &Dn) -> bool {
        if base.0.is_empty() || self.0 == base.0 {
            return true;
        }
        self.0.len() > base.0.len()
            && self.0.ends_with(&base.0)
            && self.0.as_bytes()[self.0.len() - base.0.len() - 1] == b','
    }
}

impl fmt::Display for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Dn {
    fn from(raw: &str) -> Self {
        Dn::new(raw)
    }
}

impl From<String> for Dn {
    fn from(raw: String) -> Self {
        Dn::new(&raw)
    }
}

impl From<Dn> for String {
    fn from(dn: Dn) -> String {
        dn.0
    }
}

/// Search scope relative to a base DN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// The base entry only.
    Base,
    /// Immediate children of the base.
    One,
    /// The base and everything below it.
    #[default]
    Subtree,
}

impl Scope {
    /// True when `dn` is in this scope below `base`.
    pub fn contains(&self, base: &Dn, dn: &Dn) -> bool {
        match self {
            Scope::Base => dn == base,
            Scope::One => dn.parent().as_ref() == Some(base),
            Scope::Subtree => dn.is_within(base),
        }
    }
}

/// Attribute change operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModOp {
    /// Add values.
    Add,
    /// Delete values (all values when the list is empty).
    Delete,
    /// Replace the value set.
    Replace,
}

/// One attribute change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modification {
    /// Operation kind.
    pub op: ModOp,
    /// Attribute name (lowercase).
    pub attr: String,
    /// Values the operation applies to.
    pub values: Vec<String>,
}

impl Modification {
    /// Build a modification, normalizing the attribute name.
    pub fn new(op: ModOp, attr: &str, values: &[&str]) -> Self {
        Self {
            op,
            attr: attr.to_ascii_lowercase(),
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }
}

/// A directory entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Stable identifier.
    pub uuid: EntryUuid,
    /// Current DN.
    pub dn: Dn,
    /// Attribute values (names lowercase).
    pub attrs: BTreeMap<String, BTreeSet<String>>,
    /// CSN of the last change applied to this entry.
    pub csn: Option<Csn>,
    /// Structural placeholder standing in for a deleted non-leaf entry or a
    /// missing parent.
    pub glue: bool,
}

impl Entry {
    /// New entry with no attributes.
    pub fn new(uuid: EntryUuid, dn: Dn) -> Self {
        Self {
            uuid,
            dn,
            attrs: BTreeMap::new(),
            csn: None,
            glue: false,
        }
    }

    /// Structural placeholder.
    pub fn glue(uuid: EntryUuid, dn: Dn, csn: Option<Csn>) -> Self {
        let mut entry = Entry::new(uuid, dn).with_attr("objectclass", &["glue"]);
        entry.csn = csn;
        entry.glue = true;
        entry
    }

    /// Builder: add attribute values.
    pub fn with_attr(mut self, attr: &str, values: &[&str]) -> Self {
        let set = self.attrs.entry(attr.to_ascii_lowercase()).or_default();
        set.extend(values.iter().map(|v| v.to_string()));
        self
    }

    /// Builder: set the change CSN.
    pub fn with_csn(mut self, csn: Csn) -> Self {
        self.csn = Some(csn);
        self
    }

    /// Values of one attribute.
    pub fn values(&self, attr: &str) -> Option<&BTreeSet<String>> {
        self.attrs.get(&attr.to_ascii_lowercase())
    }

    /// Apply a modification list in order.
    pub fn apply_mods(&mut self, mods: &[Modification]) -> Result<(), ApplyError> {
        for m in mods {
            let attr = m.attr.to_ascii_lowercase();
            match m.op {
                ModOp::Add => {
                    if m.values.is_empty() {
                        return Err(ApplyError::ConstraintViolation {
                            attr,
                            msg: "add without values".to_string(),
                        });
                    }
                    self.attrs
                        .entry(attr)
                        .or_default()
                        .extend(m.values.iter().cloned());
                }
                ModOp::Delete => {
                    if m.values.is_empty() {
                        self.attrs.remove(&attr);
                        continue;
                    }
                    if let Some(set) = self.attrs.get_mut(&attr) {
                        for v in &m.values {
                            set.remove(v);
                        }
                        if set.is_empty() {
                            self.attrs.remove(&attr);
                        }
                    }
                }
                ModOp::Replace => {
                    if m.values.is_empty() {
                        self.attrs.remove(&attr);
                    } else {
                        self.attrs.insert(attr, m.values.iter().cloned().collect());
                    }
                }
            }
        }
        Ok(())
    }

    /// Value-level changes turning `self` into `newer`.
    pub fn diff(&self, newer: &Entry) -> Vec<Modification> {
        let mut mods = Vec::new();
        for (attr, old_values) in &self.attrs {
            match newer.attrs.get(attr) {
                None => mods.push(Modification {
                    op: ModOp::Delete,
                    attr: attr.clone(),
                    values: Vec::new(),
                }),
                Some(new_values) => {
                    let removed: Vec<String> = old_values.difference(new_values).cloned().collect();
                    let added: Vec<String> = new_values.difference(old_values).cloned().collect();
                    if !removed.is_empty() {
                        mods.push(Modification {
                            op: ModOp::Delete,
                            attr: attr.clone(),
                            values: removed,
                        });
                    }
                    if !added.is_empty() {
                        mods.push(Modification {
                            op: ModOp::Add,
                            attr: attr.clone(),
                            values: added,
                        });
                    }
                }
            }
        }
        for (attr, new_values) in &newer.attrs {
            if !self.attrs.contains_key(attr) {
                mods.push(Modification {
                    op: ModOp::Add,
                    attr: attr.clone(),
                    values: new_values.iter().cloned().collect(),
                });
            }
        }
        mods
    }
}

/// Minimal entry predicate for persistent-search matching.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Filter {
    /// Every entry.
    #[default]
    All,
    /// Attribute has at least one value.
    Present(String),
    /// Attribute holds the value (case-insensitive).
    Equals(String, String),
    /// All sub-filters match.
    And(Vec<Filter>),
}

impl Filter {
    /// Evaluate against an entry.
    pub fn matches(&self, entry: &Entry) -> bool {
        match self {
            Filter::All => true,
            Filter::Present(attr) => entry.values(attr).is_some_and(|v| !v.is_empty()),
            Filter::Equals(attr, value) => entry
                .values(attr)
                .is_some_and(|vals| vals.iter().any(|v| v.eq_ignore_ascii_case(value))),
            Filter::And(parts) => parts.iter().all(|f| f.matches(entry)),
        }
    }
}
