//! The local-apply interface the engines write through, plus an in-memory
//! implementation used by tests and the demo binary.

use crate::cookie::SyncCookie;
use crate::csn::Csn;
use crate::entry::{Dn, Entry, EntryUuid, ModOp, Modification, Scope};
use crate::error::ApplyError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

/// Kind of a committed write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// Entry created.
    Add,
    /// Attributes changed.
    Modify,
    /// Entry removed.
    Delete,
    /// DN changed.
    Rename,
}

/// One change the store has committed, kept for conflict resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedChange {
    /// Target entry.
    pub uuid: EntryUuid,
    /// CSN the change was committed with.
    pub csn: Csn,
    /// Change kind.
    pub kind: ChangeKind,
    /// Attribute changes (empty for delete and plain rename).
    pub mods: Vec<Modification>,
}

/// Storage operations the replication engines depend on.
///
/// Implementations must be internally synchronized.
pub trait LocalStore: Send + Sync {
    /// Create an entry. Its parent must exist unless it is a root entry.
    fn add(&self, entry: Entry) -> Result<(), ApplyError>;

    /// Apply attribute changes and stamp `csn`. Returns the post-image.
    fn modify(
        &self,
        uuid: &EntryUuid,
        mods: &[Modification],
        csn: &Csn,
    ) -> Result<Entry, ApplyError>;

    /// Remove a leaf entry. Returns the removed entry.
    fn delete(&self, uuid: &EntryUuid, csn: &Csn) -> Result<Entry, ApplyError>;

    /// Move an entry to `new_dn`, applying `mods` in the same step.
    fn rename(
        &self,
        uuid: &EntryUuid,
        new_dn: &Dn,
        mods: &[Modification],
        csn: &Csn,
    ) -> Result<Entry, ApplyError>;

    /// Replace the glue placeholder `placeholder` with `entry` in place,
    /// keeping the placeholder's children.
    fn adopt(&self, placeholder: &EntryUuid, entry: Entry) -> Result<(), ApplyError>;

    /// Look up by uuid.
    fn get(&self, uuid: &EntryUuid) -> Result<Option<Entry>, ApplyError>;

    /// Look up by DN.
    fn get_by_dn(&self, dn: &Dn) -> Result<Option<Entry>, ApplyError>;

    /// Every entry in scope, parents before children.
    fn search(&self, base: &Dn, scope: Scope) -> Result<Vec<Entry>, ApplyError>;

    /// True when some entry sits directly below `dn`.
    fn has_children(&self, dn: &Dn) -> Result<bool, ApplyError>;

    /// Changes to `uuid` committed with a CSN newer than `csn`, oldest first.
    fn changes_since(&self, uuid: &EntryUuid, csn: &Csn) -> Result<Vec<AppliedChange>, ApplyError>;

    /// The checkpointed context position for a suffix.
    fn context_cookie(&self, suffix: &Dn) -> Result<Option<SyncCookie>, ApplyError>;

    /// Persist the context position for a suffix.
    fn store_context_cookie(&self, suffix: &Dn, cookie: &SyncCookie) -> Result<(), ApplyError>;
}

const DEFAULT_HISTORY: usize = 10_000;

fn is_glue_class(entry: &Entry) -> bool {
    entry
        .values("objectclass")
        .is_some_and(|v| v.contains("glue"))
}

#[derive(Debug, Default)]
struct MemoryInner {
    entries: HashMap<EntryUuid, Entry>,
    by_dn: BTreeMap<Dn, EntryUuid>,
    history: VecDeque<AppliedChange>,
    contexts: HashMap<Dn, SyncCookie>,
    unavailable: bool,
    checkpoint_writes: u64,
}

/// In-memory [`LocalStore`].
#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
    history_limit: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryInner::default()),
            history_limit: DEFAULT_HISTORY,
        }
    }

    /// Simulate the backing storage going away (or coming back).
    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.unavailable = unavailable;
        }
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.entries.len()).unwrap_or(0)
    }

    /// True when no entries are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many times a context cookie was written.
    pub fn checkpoint_writes(&self) -> u64 {
        self.inner.lock().map(|i| i.checkpoint_writes).unwrap_or(0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryInner>, ApplyError> {
        let inner = self.inner.lock().map_err(|_| ApplyError::Unavailable {
            msg: "store lock poisoned".to_string(),
        })?;
        if inner.unavailable {
            return Err(ApplyError::Unavailable {
                msg: "store offline".to_string(),
            });
        }
        Ok(inner)
    }

    fn record(&self, inner: &mut MemoryInner, change: AppliedChange) {
        inner.history.push_back(change);
        while inner.history.len() > self.history_limit {
            inner.history.pop_front();
        }
    }
}

impl MemoryInner {
    fn parent_ok(&self, dn: &Dn) -> bool {
        match dn.parent() {
            None => true,
            Some(parent) => self.by_dn.contains_key(&parent) || !self.has_any_ancestor(dn),
        }
    }

    // An entry whose ancestors are all absent is a context root.
    fn has_any_ancestor(&self, dn: &Dn) -> bool {
        let mut cur = dn.parent();
        while let Some(p) = cur {
            if self.by_dn.contains_key(&p) {
                return true;
            }
            cur = p.parent();
        }
        false
    }

    fn children_of(&self, dn: &Dn) -> bool {
        self.by_dn
            .keys()
            .any(|k| k.parent().as_ref() == Some(dn))
    }

    fn entry_mut(&mut self, uuid: &EntryUuid) -> Result<&mut Entry, ApplyError> {
        self.entries
            .get_mut(uuid)
            .ok_or_else(|| ApplyError::NoSuchObject {
                target: uuid.to_string(),
            })
    }
}

impl LocalStore for MemoryStore {
    fn add(&self, entry: Entry) -> Result<(), ApplyError> {
        let mut inner = self.lock()?;
        if inner.entries.contains_key(&entry.uuid) || inner.by_dn.contains_key(&entry.dn) {
            return Err(ApplyError::AlreadyExists {
                dn: entry.dn.to_string(),
            });
        }
        if !inner.parent_ok(&entry.dn) {
            return Err(ApplyError::NoSuchObject {
                target: entry.dn.parent().map(|p| p.to_string()).unwrap_or_default(),
            });
        }
        if let Some(csn) = entry.csn.clone() {
            let mods = entry
                .attrs
                .iter()
                .map(|(attr, vals)| Modification {
                    op: ModOp::Add,
                    attr: attr.clone(),
                    values: vals.iter().cloned().collect(),
                })
                .collect();
            let change = AppliedChange {
                uuid: entry.uuid,
                csn,
                kind: ChangeKind::Add,
                mods,
            };
            self.record(&mut inner, change);
        }
        inner.by_dn.insert(entry.dn.clone(), entry.uuid);
        inner.entries.insert(entry.uuid, entry);
        Ok(())
    }

    fn modify(
        &self,
        uuid: &EntryUuid,
        mods: &[Modification],
        csn: &Csn,
    ) -> Result<Entry, ApplyError> {
        let mut inner = self.lock()?;
        let entry = inner.entry_mut(uuid)?;
        let mut updated = entry.clone();
        updated.apply_mods(mods)?;
        // a late-arriving older change never moves the entry's stamp back
        if updated.csn.as_ref().map_or(true, |held| csn.is_newer_than(held)) {
            updated.csn = Some(csn.clone());
        }
        updated.glue = is_glue_class(&updated);
        *entry = updated.clone();
        let change = AppliedChange {
            uuid: *uuid,
            csn: csn.clone(),
            kind: ChangeKind::Modify,
            mods: mods.to_vec(),
        };
        self.record(&mut inner, change);
        Ok(updated)
    }

    fn delete(&self, uuid: &EntryUuid, csn: &Csn) -> Result<Entry, ApplyError> {
        let mut inner = self.lock()?;
        let dn = inner.entry_mut(uuid)?.dn.clone();
        if inner.children_of(&dn) {
            return Err(ApplyError::NotAllowedOnNonLeaf { dn: dn.to_string() });
        }
        inner.by_dn.remove(&dn);
        let removed = inner
            .entries
            .remove(uuid)
            .ok_or_else(|| ApplyError::NoSuchObject {
                target: uuid.to_string(),
            })?;
        let change = AppliedChange {
            uuid: *uuid,
            csn: csn.clone(),
            kind: ChangeKind::Delete,
            mods: Vec::new(),
        };
        self.record(&mut inner, change);
        Ok(removed)
    }

    fn rename(
        &self,
        uuid: &EntryUuid,
        new_dn: &Dn,
        mods: &[Modification],
        csn: &Csn,
    ) -> Result<Entry, ApplyError> {
        let mut inner = self.lock()?;
        let old_dn = inner.entry_mut(uuid)?.dn.clone();
        if &old_dn != new_dn {
            if inner.by_dn.contains_key(new_dn) {
                return Err(ApplyError::AlreadyExists {
                    dn: new_dn.to_string(),
                });
            }
            if inner.children_of(&old_dn) {
                return Err(ApplyError::NotAllowedOnNonLeaf {
                    dn: old_dn.to_string(),
                });
            }
            if !inner.parent_ok(new_dn) {
                return Err(ApplyError::NoSuchObject {
                    target: new_dn.parent().map(|p| p.to_string()).unwrap_or_default(),
                });
            }
        }
        let entry = inner.entry_mut(uuid)?;
        let mut updated = entry.clone();
        updated.apply_mods(mods)?;
        updated.dn = new_dn.clone();
        if updated.csn.as_ref().map_or(true, |held| csn.is_newer_than(held)) {
            updated.csn = Some(csn.clone());
        }
        *entry = updated.clone();
        inner.by_dn.remove(&old_dn);
        inner.by_dn.insert(new_dn.clone(), *uuid);
        let change = AppliedChange {
            uuid: *uuid,
            csn: csn.clone(),
            kind: ChangeKind::Rename,
            mods: mods.to_vec(),
        };
        self.record(&mut inner, change);
        Ok(updated)
    }

    fn adopt(&self, placeholder: &EntryUuid, entry: Entry) -> Result<(), ApplyError> {
        let mut inner = self.lock()?;
        let old = inner.entry_mut(placeholder)?.clone();
        if !old.glue {
            return Err(ApplyError::AlreadyExists {
                dn: old.dn.to_string(),
            });
        }
        if old.dn != entry.dn || (entry.uuid != *placeholder && inner.entries.contains_key(&entry.uuid)) {
            return Err(ApplyError::ConstraintViolation {
                attr: "entryuuid".to_string(),
                msg: format!("cannot adopt {} into {}", entry.uuid, old.dn),
            });
        }
        inner.entries.remove(placeholder);
        inner.by_dn.insert(entry.dn.clone(), entry.uuid);
        if let Some(csn) = entry.csn.clone() {
            let change = AppliedChange {
                uuid: entry.uuid,
                csn,
                kind: ChangeKind::Add,
                mods: Vec::new(),
            };
            self.record(&mut inner, change);
        }
        inner.entries.insert(entry.uuid, entry);
        Ok(())
    }

    fn get(&self, uuid: &EntryUuid) -> Result<Option<Entry>, ApplyError> {
        Ok(self.lock()?.entries.get(uuid).cloned())
    }

    fn get_by_dn(&self, dn: &Dn) -> Result<Option<Entry>, ApplyError> {
        let inner = self.lock()?;
        Ok(inner.by_dn.get(dn).and_then(|u| inner.entries.get(u)).cloned())
    }

    fn search(&self, base: &Dn, scope: Scope) -> Result<Vec<Entry>, ApplyError> {
        let inner = self.lock()?;
        let mut found: Vec<Entry> = inner
            .entries
            .values()
            .filter(|e| scope.contains(base, &e.dn))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.dn.depth().cmp(&b.dn.depth()).then_with(|| a.dn.cmp(&b.dn)));
        Ok(found)
    }

    fn has_children(&self, dn: &Dn) -> Result<bool, ApplyError> {
        Ok(self.lock()?.children_of(dn))
    }

    fn changes_since(&self, uuid: &EntryUuid, csn: &Csn) -> Result<Vec<AppliedChange>, ApplyError> {
        let inner = self.lock()?;
        let mut changes: Vec<AppliedChange> = inner
            .history
            .iter()
            .filter(|c| &c.uuid == uuid && c.csn.is_newer_than(csn))
            .cloned()
            .collect();
        changes.sort_by(|a, b| a.csn.cmp(&b.csn));
        Ok(changes)
    }

    fn context_cookie(&self, suffix: &Dn) -> Result<Option<SyncCookie>, ApplyError> {
        Ok(self.lock()?.contexts.get(suffix).cloned())
    }

    fn store_context_cookie(&self, suffix: &Dn, cookie: &SyncCookie) -> Result<(), ApplyError> {
        let mut inner = self.lock()?;
        inner.contexts.insert(suffix.clone(), cookie.positions());
        inner.checkpoint_writes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csn::test_util::csn;

    fn person(n: u128, dn: &str, at: u32) -> Entry {
        Entry::new(EntryUuid::from_u128(n), Dn::new(dn))
            .with_attr("cn", &["x"])
            .with_csn(csn(at, 1))
    }

    fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        store.add(person(1, "dc=example", 1)).unwrap();
        store.add(person(2, "ou=people,dc=example", 2)).unwrap();
        store.add(person(3, "cn=a,ou=people,dc=example", 3)).unwrap();
        store
    }

    #[test]
    fn test_add_requires_parent() {
        let store = seeded();
        let err = store
            .add(person(9, "cn=z,ou=missing,dc=example", 9))
            .unwrap_err();
        assert!(matches!(err, ApplyError::NoSuchObject { .. }));
    }

    #[test]
    fn test_add_duplicate() {
        let store = seeded();
        assert!(matches!(
            store.add(person(7, "cn=a,ou=people,dc=example", 9)),
            Err(ApplyError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn test_delete_non_leaf_refused() {
        let store = seeded();
        let err = store.delete(&EntryUuid::from_u128(2), &csn(10, 1)).unwrap_err();
        assert!(matches!(err, ApplyError::NotAllowedOnNonLeaf { .. }));
        store.delete(&EntryUuid::from_u128(3), &csn(11, 1)).unwrap();
        store.delete(&EntryUuid::from_u128(2), &csn(12, 1)).unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_search_orders_parents_first() {
        let store = seeded();
        let found = store.search(&Dn::new("dc=example"), Scope::Subtree).unwrap();
        let depths: Vec<usize> = found.iter().map(|e| e.dn.depth()).collect();
        assert_eq!(depths, vec![1, 2, 3]);
        let one = store.search(&Dn::new("dc=example"), Scope::One).unwrap();
        assert_eq!(one.len(), 1);
    }

    #[test]
    fn test_changes_since() {
        let store = seeded();
        let uuid = EntryUuid::from_u128(3);
        store
            .modify(&uuid, &[Modification::new(ModOp::Add, "mail", &["a@x"])], &csn(20, 2))
            .unwrap();
        store
            .modify(&uuid, &[Modification::new(ModOp::Delete, "mail", &["a@x"])], &csn(30, 1))
            .unwrap();
        let newer = store.changes_since(&uuid, &csn(20, 2)).unwrap();
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].csn, csn(30, 1));
        assert_eq!(store.changes_since(&uuid, &csn(1, 1)).unwrap().len(), 3);
    }

    #[test]
    fn test_rename() {
        let store = seeded();
        let uuid = EntryUuid::from_u128(3);
        let moved = store
            .rename(&uuid, &Dn::new("cn=b,ou=people,dc=example"), &[], &csn(40, 1))
            .unwrap();
        assert_eq!(moved.dn.as_str(), "cn=b,ou=people,dc=example");
        assert!(store.get_by_dn(&Dn::new("cn=a,ou=people,dc=example")).unwrap().is_none());
    }

    #[test]
    fn test_older_rename_keeps_stamp() {
        let store = seeded();
        let uuid = EntryUuid::from_u128(3);
        store
            .rename(&uuid, &Dn::new("cn=b,ou=people,dc=example"), &[], &csn(10, 2))
            .unwrap();
        store
            .rename(&uuid, &Dn::new("cn=a,ou=people,dc=example"), &[], &csn(7, 1))
            .unwrap();
        let e = store.get(&uuid).unwrap().unwrap();
        assert_eq!(e.csn, Some(csn(10, 2)));
    }

    #[test]
    fn test_unavailable() {
        let store = seeded();
        store.set_unavailable(true);
        assert!(matches!(
            store.get(&EntryUuid::from_u128(1)),
            Err(ApplyError::Unavailable { .. })
        ));
        store.set_unavailable(false);
        assert!(store.get(&EntryUuid::from_u128(1)).unwrap().is_some());
    }

    #[test]
    fn test_glue_flag_follows_objectclass() {
        let store = seeded();
        let uuid = EntryUuid::from_u128(2);
        let glued = store
            .modify(
                &uuid,
                &[
                    Modification::new(ModOp::Delete, "cn", &[]),
                    Modification::new(ModOp::Add, "objectclass", &["glue"]),
                ],
                &csn(50, 1),
            )
            .unwrap();
        assert!(glued.glue);
    }

    #[test]
    fn test_adopt_replaces_placeholder() {
        let store = MemoryStore::new();
        store.add(person(1, "dc=example", 1)).unwrap();
        let glue = Entry::glue(EntryUuid::from_u128(70), Dn::new("ou=people,dc=example"), None);
        store.add(glue).unwrap();
        store.add(person(3, "cn=a,ou=people,dc=example", 3)).unwrap();

        let real = person(2, "ou=people,dc=example", 2);
        store.adopt(&EntryUuid::from_u128(70), real).unwrap();
        assert!(store.get(&EntryUuid::from_u128(70)).unwrap().is_none());
        let adopted = store.get_by_dn(&Dn::new("ou=people,dc=example")).unwrap().unwrap();
        assert_eq!(adopted.uuid, EntryUuid::from_u128(2));
        assert!(store.has_children(&adopted.dn).unwrap());

        // a real entry cannot be adopted over
        assert!(store
            .adopt(&EntryUuid::from_u128(2), person(9, "ou=people,dc=example", 9))
            .is_err());
    }

    #[test]
    fn test_context_cookie() {
        let store = MemoryStore::new();
        let suffix = Dn::new("dc=example");
        assert!(store.context_cookie(&suffix).unwrap().is_none());
        let cookie = SyncCookie::from_csns([csn(1, 1)]).with_rid(3);
        store.store_context_cookie(&suffix, &cookie).unwrap();
        assert_eq!(store.context_cookie(&suffix).unwrap().unwrap(), cookie.positions());
        assert_eq!(store.checkpoint_writes(), 1);
    }
}
