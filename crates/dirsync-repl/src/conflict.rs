//! Attribute-level conflict resolution for replicated modifications.
//!
//! An incoming modification carries the CSN it was made with. Anything the
//! local store committed to the same entry with a newer CSN wins: the incoming
//! change is trimmed so it cannot undo those later writes.

use crate::entry::{ModOp, Modification};
use crate::store::AppliedChange;
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Default)]
struct AttrHistory {
    replaced: bool,
    added: BTreeSet<String>,
    deleted: BTreeSet<String>,
}

impl AttrHistory {
    fn add(&mut self, v: &str) {
        self.deleted.remove(v);
        self.added.insert(v.to_string());
    }

    fn delete(&mut self, v: &str) {
        self.added.remove(v);
        self.deleted.insert(v.to_string());
    }
}

/// Result of trimming an incoming modification list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Modifications that are still safe to apply.
    pub mods: Vec<Modification>,
    /// Modifications dropped entirely.
    pub dropped: usize,
    /// Modifications applied with some values removed or added.
    pub trimmed: usize,
}

fn summarize(later: &[AppliedChange]) -> HashMap<String, AttrHistory> {
    let mut attrs: HashMap<String, AttrHistory> = HashMap::new();
    for change in later {
        for m in &change.mods {
            let h = attrs.entry(m.attr.to_ascii_lowercase()).or_default();
            match m.op {
                ModOp::Add => m.values.iter().for_each(|v| h.add(v)),
                ModOp::Delete if m.values.is_empty() => {
                    h.replaced = true;
                    h.added.clear();
                }
                ModOp::Delete => m.values.iter().for_each(|v| h.delete(v)),
                ModOp::Replace => {
                    h.replaced = true;
                    h.added = m.values.iter().cloned().collect();
                    h.deleted.clear();
                }
            }
        }
    }
    attrs
}

/// Trim `incoming` against the `later` changes already committed locally.
///
/// - a modification of an attribute replaced later is dropped;
/// - added values that were deleted later are removed;
/// - deleted values that were re-added later are removed;
/// - a replaced value set loses later-deleted values and keeps later-added
///   ones.
pub fn resolve(incoming: &[Modification], later: &[AppliedChange]) -> Resolution {
    if later.is_empty() {
        return Resolution {
            mods: incoming.to_vec(),
            ..Default::default()
        };
    }
    let history = summarize(later);
    let mut out = Resolution::default();
    for m in incoming {
        let attr = m.attr.to_ascii_lowercase();
        let Some(h) = history.get(&attr) else {
            out.mods.push(m.clone());
            continue;
        };
        if h.replaced {
            out.dropped += 1;
            continue;
        }
        let resolved = match m.op {
            ModOp::Add => {
                let values: Vec<String> = m
                    .values
                    .iter()
                    .filter(|v| !h.deleted.contains(*v))
                    .cloned()
                    .collect();
                (!values.is_empty()).then(|| Modification {
                    op: ModOp::Add,
                    attr: attr.clone(),
                    values,
                })
            }
            ModOp::Delete if m.values.is_empty() => Some(if h.added.is_empty() {
                m.clone()
            } else {
                Modification {
                    op: ModOp::Replace,
                    attr: attr.clone(),
                    values: h.added.iter().cloned().collect(),
                }
            }),
            ModOp::Delete => {
                let values: Vec<String> = m
                    .values
                    .iter()
                    .filter(|v| !h.added.contains(*v))
                    .cloned()
                    .collect();
                (!values.is_empty()).then(|| Modification {
                    op: ModOp::Delete,
                    attr: attr.clone(),
                    values,
                })
            }
            ModOp::Replace => {
                let mut values: BTreeSet<String> = m
                    .values
                    .iter()
                    .filter(|v| !h.deleted.contains(*v))
                    .cloned()
                    .collect();
                values.extend(h.added.iter().cloned());
                Some(Modification {
                    op: ModOp::Replace,
                    attr: attr.clone(),
                    values: values.into_iter().collect(),
                })
            }
        };
        match resolved {
            Some(r) => {
                if &r != m {
                    out.trimmed += 1;
                }
                out.mods.push(r);
            }
            None => out.dropped += 1,
        }
    }
    out
}
