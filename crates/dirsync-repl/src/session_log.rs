//! Provider session log: a bounded replay buffer of recent writes.
//!
//! A consumer that was away briefly can catch up from the log instead of a
//! full present-phase scan, as long as its cookie is at or past the log's
//! retained horizon (the newest CSN per origin that has been evicted).

use crate::cookie::SyncCookie;
use crate::csn::Csn;
use crate::entry::EntryUuid;
use crate::store::ChangeKind;
use std::collections::{HashMap, VecDeque};

/// One logged write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Target entry.
    pub uuid: EntryUuid,
    /// Commit CSN.
    pub csn: Csn,
    /// Write kind.
    pub kind: ChangeKind,
}

/// Net effect of the log past some cookie.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Replay {
    /// Entries whose last logged write was not a delete, oldest change first.
    pub changed: Vec<EntryUuid>,
    /// Entries whose last logged write was a delete.
    pub deleted: Vec<EntryUuid>,
}

impl Replay {
    /// True when nothing needs sending.
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.deleted.is_empty()
    }
}

/// Bounded FIFO of recent writes plus the retained horizon.
#[derive(Debug)]
pub struct SessionLog {
    depth: usize,
    entries: VecDeque<LogEntry>,
    retained: SyncCookie,
    appended: u64,
}

impl SessionLog {
    /// Create a log holding at most `depth` writes. `start` is the position
    /// the provider had before the first logged write.
    pub fn new(depth: usize, start: SyncCookie) -> Self {
        Self {
            depth,
            entries: VecDeque::with_capacity(depth.min(4096)),
            retained: start.positions(),
            appended: 0,
        }
    }

    /// Record a write, evicting the oldest entries beyond the depth.
    pub fn append(&mut self, entry: LogEntry) {
        if self.depth == 0 {
            self.retained.merge_csn(&entry.csn);
            return;
        }
        self.entries.push_back(entry);
        self.appended += 1;
        while self.entries.len() > self.depth {
            if let Some(evicted) = self.entries.pop_front() {
                self.retained.merge_csn(&evicted.csn);
            }
        }
    }

    /// Horizon below which the log can no longer replay.
    pub fn retained(&self) -> &SyncCookie {
        &self.retained
    }

    /// Number of entries currently held.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no entries are held.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total writes ever appended.
    pub fn appended(&self) -> u64 {
        self.appended
    }

    /// True when a consumer at `cookie` can be served from the log alone.
    pub fn covers(&self, cookie: &SyncCookie) -> bool {
        self.depth > 0 && !cookie.is_empty() && cookie.dominates(&self.retained)
    }

    /// Collapse the writes newer than `cookie` into per-entry outcomes.
    pub fn replay(&self, cookie: &SyncCookie) -> Replay {
        let mut last: HashMap<EntryUuid, (usize, ChangeKind)> = HashMap::new();
        for (i, e) in self.entries.iter().enumerate() {
            if cookie.covers(&e.csn) {
                continue;
            }
            last.insert(e.uuid, (i, e.kind));
        }
        let mut ordered: Vec<(usize, EntryUuid, ChangeKind)> =
            last.into_iter().map(|(u, (i, k))| (i, u, k)).collect();
        ordered.sort_by_key(|(i, _, _)| *i);
        let mut replay = Replay::default();
        for (_, uuid, kind) in ordered {
            if kind == ChangeKind::Delete {
                replay.deleted.push(uuid);
            } else {
                replay.changed.push(uuid);
            }
        }
        replay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csn::test_util::csn;

    fn log_entry(n: u128, at: u32, kind: ChangeKind) -> LogEntry {
        LogEntry {
            uuid: EntryUuid::from_u128(n),
            csn: csn(at, 1),
            kind,
        }
    }

    #[test]
    fn test_eviction_folds_into_retained() {
        let mut log = SessionLog::new(2, SyncCookie::new());
        log.append(log_entry(1, 1, ChangeKind::Add));
        log.append(log_entry(2, 2, ChangeKind::Add));
        assert!(log.retained().is_empty());
        log.append(log_entry(3, 3, ChangeKind::Add));
        assert_eq!(log.len(), 2);
        assert_eq!(log.retained().csn_for(1), Some(&csn(1, 1)));
        assert_eq!(log.appended(), 3);
    }

    #[test]
    fn test_covers_requires_horizon() {
        let mut log = SessionLog::new(2, SyncCookie::from_csns([csn(0, 1)]));
        for i in 1..=4 {
            log.append(log_entry(i, i as u32, ChangeKind::Modify));
        }
        // evicted up to csn 2
        assert!(log.covers(&SyncCookie::from_csns([csn(2, 1)])));
        assert!(!log.covers(&SyncCookie::from_csns([csn(1, 1)])));
        assert!(!log.covers(&SyncCookie::new()));
    }

    #[test]
    fn test_replay_collapses_per_entry() {
        let mut log = SessionLog::new(10, SyncCookie::from_csns([csn(0, 1)]));
        log.append(log_entry(1, 1, ChangeKind::Add));
        log.append(log_entry(2, 2, ChangeKind::Add));
        log.append(log_entry(1, 3, ChangeKind::Modify));
        log.append(log_entry(2, 4, ChangeKind::Delete));
        log.append(log_entry(3, 5, ChangeKind::Add));

        let replay = log.replay(&SyncCookie::from_csns([csn(1, 1)]));
        assert_eq!(
            replay.changed,
            vec![EntryUuid::from_u128(1), EntryUuid::from_u128(3)]
        );
        assert_eq!(replay.deleted, vec![EntryUuid::from_u128(2)]);

        let none = log.replay(&SyncCookie::from_csns([csn(5, 1)]));
        assert!(none.is_empty());
    }

    #[test]
    fn test_zero_depth_never_covers() {
        let mut log = SessionLog::new(0, SyncCookie::new());
        log.append(log_entry(1, 1, ChangeKind::Add));
        assert!(log.is_empty());
        assert!(!log.covers(&SyncCookie::from_csns([csn(1, 1)])));
        assert_eq!(log.retained().csn_for(1), Some(&csn(1, 1)));
    }
}
