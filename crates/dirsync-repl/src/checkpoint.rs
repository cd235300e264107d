//! Context-cookie checkpoints.
//!
//! The provider persists its context cookie into the store every
//! `checkpoint_ops` writes or `checkpoint_interval`, whichever comes first, so a
//! restart can resume serving delta refreshes without rescanning the suffix.

use crate::cookie::SyncCookie;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// A persisted context position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextCheckpoint {
    /// Unique identifier for this checkpoint.
    pub checkpoint_id: u64,
    /// Microseconds since the Unix epoch.
    pub created_at_us: u64,
    /// Position that was written.
    pub cookie: SyncCookie,
    /// Writes folded into the position since the previous checkpoint.
    pub ops: u64,
}

/// Decides when the context cookie must be written back.
#[derive(Debug)]
pub struct CheckpointPolicy {
    ops_threshold: u64,
    interval: Option<Duration>,
    ops_since: u64,
    last_at: Instant,
    next_id: u64,
    history: Vec<ContextCheckpoint>,
    max_history: usize,
}

impl CheckpointPolicy {
    /// Zero for either threshold disables that trigger.
    pub fn new(ops_threshold: u64, interval: Duration) -> Self {
        Self {
            ops_threshold,
            interval: (!interval.is_zero()).then_some(interval),
            ops_since: 0,
            last_at: Instant::now(),
            next_id: 1,
            history: Vec::new(),
            max_history: 8,
        }
    }

    /// Count one write. Returns true when a checkpoint is due now.
    ///
    /// A write that targets the context root entry never triggers: the
    /// checkpoint itself lives on that entry.
    pub fn record_write(&mut self, targets_context_root: bool) -> bool {
        self.ops_since += 1;
        if targets_context_root {
            return false;
        }
        self.due()
    }

    /// True when a threshold has been crossed.
    pub fn due(&self) -> bool {
        if self.ops_since == 0 {
            return false;
        }
        let by_ops = self.ops_threshold > 0 && self.ops_since >= self.ops_threshold;
        let by_time = self
            .interval
            .is_some_and(|iv| self.last_at.elapsed() >= iv);
        by_ops || by_time
    }

    /// Writes counted since the last checkpoint.
    pub fn pending_ops(&self) -> u64 {
        self.ops_since
    }

    /// Note that `cookie` was written and reset the counters.
    pub fn mark_written(&mut self, cookie: &SyncCookie, created_at_us: u64) -> &ContextCheckpoint {
        let checkpoint = ContextCheckpoint {
            checkpoint_id: self.next_id,
            created_at_us,
            cookie: cookie.positions(),
            ops: self.ops_since,
        };
        self.next_id += 1;
        self.ops_since = 0;
        self.last_at = Instant::now();
        self.history.push(checkpoint);
        if self.history.len() > self.max_history {
            self.history.remove(0);
        }
        &self.history[self.history.len() - 1]
    }

    /// Latest checkpoint written by this policy.
    pub fn latest(&self) -> Option<&ContextCheckpoint> {
        self.history.last()
    }

    /// Number of checkpoints written.
    pub fn written(&self) -> u64 {
        self.next_id - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csn::test_util::csn;

    #[test]
    fn test_ops_threshold() {
        let mut policy = CheckpointPolicy::new(3, Duration::ZERO);
        assert!(!policy.record_write(false));
        assert!(!policy.record_write(false));
        assert!(policy.record_write(false));
        policy.mark_written(&SyncCookie::from_csns([csn(3, 1)]), 0);
        assert_eq!(policy.pending_ops(), 0);
        assert_eq!(policy.written(), 1);
        assert_eq!(policy.latest().unwrap().ops, 3);
    }

    #[test]
    fn test_context_root_write_never_triggers() {
        let mut policy = CheckpointPolicy::new(1, Duration::ZERO);
        assert!(!policy.record_write(true));
        assert!(policy.due());
        assert!(policy.record_write(false));
    }

    #[test]
    fn test_interval_threshold() {
        let mut policy = CheckpointPolicy::new(0, Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        assert!(policy.record_write(false));
    }

    #[test]
    fn test_disabled() {
        let mut policy = CheckpointPolicy::new(0, Duration::ZERO);
        for _ in 0..100 {
            assert!(!policy.record_write(false));
        }
    }

    #[test]
    fn test_checkpoint_strips_tags() {
        let mut policy = CheckpointPolicy::new(1, Duration::ZERO);
        policy.record_write(false);
        let cp = policy.mark_written(&SyncCookie::from_csns([csn(1, 1)]).with_rid(4), 99);
        assert_eq!(cp.cookie.rid, None);
        assert_eq!(cp.created_at_us, 99);
    }
}
