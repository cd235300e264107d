//! Present lists, non-present reconciliation and glue placeholders.
//!
//! During a present-phase refresh the provider only names the entries that
//! still exist. Anything in scope locally that was not named, and that is not
//! newer than the round's final cookie, was deleted on the provider side.

use crate::cookie::SyncCookie;
use crate::csn::Csn;
use crate::entry::{Dn, Entry, EntryUuid, Filter, ModOp, Modification, Scope};
use crate::error::{ApplyError, Result};
use crate::store::LocalStore;
use std::collections::HashSet;
use tracing::{debug, warn};

/// Uuids confirmed present during one refresh round.
#[derive(Debug, Clone, Default)]
pub struct PresentList {
    uuids: HashSet<EntryUuid>,
}

impl PresentList {
    /// Empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one uuid.
    pub fn insert(&mut self, uuid: EntryUuid) {
        self.uuids.insert(uuid);
    }

    /// Record a batch.
    pub fn extend<I: IntoIterator<Item = EntryUuid>>(&mut self, uuids: I) {
        self.uuids.extend(uuids);
    }

    /// Membership test.
    pub fn contains(&self, uuid: &EntryUuid) -> bool {
        self.uuids.contains(uuid)
    }

    /// Number of uuids.
    pub fn len(&self) -> usize {
        self.uuids.len()
    }

    /// True when nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.uuids.is_empty()
    }

    /// Forget the round.
    pub fn clear(&mut self) {
        self.uuids.clear();
    }
}

/// What reconciliation did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Entries removed.
    pub deleted: Vec<EntryUuid>,
    /// Non-leaf entries turned into glue placeholders.
    pub glued: Vec<EntryUuid>,
    /// Absent entries kept because they are newer than the final cookie.
    pub skipped_newer: usize,
}

fn is_newer_than_cookie(entry: &Entry, cookie: &SyncCookie) -> bool {
    match &entry.csn {
        Some(csn) => !cookie.covers(csn),
        None => false,
    }
}

/// Modifications that strip an entry down to a glue placeholder.
pub fn glue_mods(entry: &Entry) -> Vec<Modification> {
    let mut mods: Vec<Modification> = entry
        .attrs
        .keys()
        .map(|attr| Modification {
            op: ModOp::Delete,
            attr: attr.clone(),
            values: Vec::new(),
        })
        .collect();
    mods.push(Modification::new(ModOp::Add, "objectclass", &["glue"]));
    mods
}

/// Delete `uuid`, or turn it into glue when it still has children.
/// Returns true when the entry was glued rather than removed.
pub fn delete_or_glue(store: &dyn LocalStore, uuid: &EntryUuid, csn: &Csn) -> Result<bool> {
    match store.delete(uuid, csn) {
        Ok(_) => Ok(false),
        Err(ApplyError::NotAllowedOnNonLeaf { dn }) => {
            let Some(entry) = store.get(uuid)? else {
                return Ok(false);
            };
            if !entry.glue {
                store.modify(uuid, &glue_mods(&entry), csn)?;
                debug!(%dn, "non-leaf delete turned into glue");
            }
            Ok(true)
        }
        Err(e) => Err(e.into()),
    }
}

/// Create glue placeholders for every missing ancestor of `dn` below `base`.
/// Returns the number of placeholders created.
pub fn ensure_parents(store: &dyn LocalStore, base: &Dn, dn: &Dn, csn: &Csn) -> Result<usize> {
    let mut missing = Vec::new();
    let mut cur = dn.parent();
    while let Some(p) = cur {
        if !p.is_within(base) || store.get_by_dn(&p)?.is_some() {
            break;
        }
        cur = p.parent();
        missing.push(p);
    }
    let created = missing.len();
    for p in missing.into_iter().rev() {
        store.add(Entry::glue(EntryUuid::new_v4(), p, Some(csn.clone())))?;
    }
    Ok(created)
}

/// Remove every in-view local entry that was not confirmed present.
///
/// Entries outside `filter` were never part of the round and are left alone.
/// Entries are visited deepest first so children go before their parents;
/// a parent that still has (newer) children is turned into glue instead.
/// Running it again with the same present list changes nothing.
pub fn reconcile(
    store: &dyn LocalStore,
    base: &Dn,
    scope: Scope,
    filter: &Filter,
    present: &PresentList,
    final_cookie: &SyncCookie,
    csn: &Csn,
) -> Result<ReconcileReport> {
    let mut report = ReconcileReport::default();
    let mut candidates: Vec<Entry> = Vec::new();
    for entry in store.search(base, scope)? {
        if present.contains(&entry.uuid) || !(entry.glue || filter.matches(&entry)) {
            continue;
        }
        if is_newer_than_cookie(&entry, final_cookie) {
            report.skipped_newer += 1;
            continue;
        }
        candidates.push(entry);
    }
    candidates.sort_by(|a, b| b.dn.depth().cmp(&a.dn.depth()));
    for entry in candidates {
        // already a placeholder and still needed
        if entry.glue && store.has_children(&entry.dn)? {
            continue;
        }
        match delete_or_glue(store, &entry.uuid, csn) {
            Ok(false) => report.deleted.push(entry.uuid),
            Ok(true) => report.glued.push(entry.uuid),
            Err(e) => {
                warn!(dn = %entry.dn, error = %e, "reconcile delete failed");
                return Err(e);
            }
        }
    }
    if !report.deleted.is_empty() || !report.glued.is_empty() {
        debug!(
            base = %base,
            deleted = report.deleted.len(),
            glued = report.glued.len(),
            "non-present entries reconciled"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csn::test_util::csn;
    use crate::store::MemoryStore;

    fn entry(n: u128, dn: &str, at: u32) -> Entry {
        Entry::new(EntryUuid::from_u128(n), Dn::new(dn))
            .with_attr("cn", &["v"])
            .with_csn(csn(at, 1))
    }

    fn store_xyz() -> MemoryStore {
        let store = MemoryStore::new();
        store.add(entry(100, "dc=example", 1)).unwrap();
        store.add(entry(1, "cn=x,dc=example", 2)).unwrap();
        store.add(entry(2, "cn=y,dc=example", 3)).unwrap();
        store.add(entry(3, "cn=z,dc=example", 4)).unwrap();
        store
    }

    #[test]
    fn test_deletes_exactly_the_absent_entry() {
        let store = store_xyz();
        let mut present = PresentList::new();
        present.extend([
            EntryUuid::from_u128(100),
            EntryUuid::from_u128(1),
            EntryUuid::from_u128(3),
        ]);
        let cookie = SyncCookie::from_csns([csn(10, 1)]);
        let report = reconcile(
            &store,
            &Dn::new("dc=example"),
            Scope::Subtree,
            &Filter::All,
            &present,
            &cookie,
            &csn(10, 1),
        )
        .unwrap();
        assert_eq!(report.deleted, vec![EntryUuid::from_u128(2)]);
        assert_eq!(store.len(), 3);

        let again = reconcile(
            &store,
            &Dn::new("dc=example"),
            Scope::Subtree,
            &Filter::All,
            &present,
            &cookie,
            &csn(10, 1),
        )
        .unwrap();
        assert_eq!(again, ReconcileReport::default());
    }

    #[test]
    fn test_newer_entries_survive() {
        let store = store_xyz();
        store.add(entry(4, "cn=w,dc=example", 20)).unwrap();
        let mut present = PresentList::new();
        present.insert(EntryUuid::from_u128(100));
        let report = reconcile(
            &store,
            &Dn::new("dc=example"),
            Scope::Subtree,
            &Filter::All,
            &present,
            &SyncCookie::from_csns([csn(10, 1)]),
            &csn(10, 1),
        )
        .unwrap();
        assert_eq!(report.deleted.len(), 3);
        assert_eq!(report.skipped_newer, 1);
        assert!(store.get(&EntryUuid::from_u128(4)).unwrap().is_some());
    }

    #[test]
    fn test_parent_with_newer_child_becomes_glue() {
        let store = store_xyz();
        store.add(entry(5, "cn=c,cn=y,dc=example", 30)).unwrap();
        let mut present = PresentList::new();
        present.extend([
            EntryUuid::from_u128(100),
            EntryUuid::from_u128(1),
            EntryUuid::from_u128(3),
        ]);
        let report = reconcile(
            &store,
            &Dn::new("dc=example"),
            Scope::Subtree,
            &Filter::All,
            &present,
            &SyncCookie::from_csns([csn(10, 1)]),
            &csn(10, 1),
        )
        .unwrap();
        assert_eq!(report.glued, vec![EntryUuid::from_u128(2)]);
        assert!(store.get(&EntryUuid::from_u128(2)).unwrap().unwrap().glue);
    }

    #[test]
    fn test_filtered_out_entries_untouched() {
        let store = store_xyz();
        store
            .add(entry(6, "cn=m,dc=example", 5).with_attr("mail", &["m@x"]))
            .unwrap();
        let report = reconcile(
            &store,
            &Dn::new("dc=example"),
            Scope::Subtree,
            &Filter::Present("mail".into()),
            &PresentList::new(),
            &SyncCookie::from_csns([csn(10, 1)]),
            &csn(10, 1),
        )
        .unwrap();
        assert_eq!(report.deleted, vec![EntryUuid::from_u128(6)]);
        assert_eq!(store.len(), 4);
    }

    #[test]
    fn test_ensure_parents_creates_glue_chain() {
        let store = MemoryStore::new();
        store.add(entry(100, "dc=example", 1)).unwrap();
        let dn = Dn::new("cn=leaf,ou=b,ou=a,dc=example");
        let created = ensure_parents(&store, &Dn::new("dc=example"), &dn, &csn(2, 1)).unwrap();
        assert_eq!(created, 2);
        store.add(entry(7, dn.as_str(), 2)).unwrap();
        assert!(store.get_by_dn(&Dn::new("ou=a,dc=example")).unwrap().unwrap().glue);
        assert_eq!(
            ensure_parents(&store, &Dn::new("dc=example"), &dn, &csn(3, 1)).unwrap(),
            0
        );
    }
}
