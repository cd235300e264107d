//! Backend-wide replication position shared by every consumer attached to
//! the same local store.
//!
//! Readers take snapshots at any time. Publishers are serialized by a
//! single-writer flag: a publisher holds it for the duration of one commit and
//! wakes every waiter when it lets go.

use crate::cookie::{MergeOutcome, SyncCookie};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::debug;

/// A record of one committed advance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRecord {
    /// Agreement that published.
    pub rid: u16,
    /// Wire form of the position after the commit.
    pub cookie: String,
    /// Microseconds since the Unix epoch.
    pub published_at_us: u64,
}

#[derive(Debug, Default)]
struct PositionState {
    cookie: SyncCookie,
    publishing: bool,
    publishes: u64,
    history: Vec<PublishRecord>,
}

const HISTORY_LIMIT: usize = 64;

/// The shared position holder. Hand it out as `Arc<SharedPosition>`.
#[derive(Debug, Default)]
pub struct SharedPosition {
    state: Mutex<PositionState>,
    changed: Notify,
}

impl SharedPosition {
    /// Start from a known position (typically the backend's checkpoint).
    pub fn new(initial: SyncCookie) -> Self {
        Self {
            state: Mutex::new(PositionState {
                cookie: initial.positions(),
                ..Default::default()
            }),
            changed: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PositionState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Current committed position.
    pub fn snapshot(&self) -> SyncCookie {
        self.lock().cookie.clone()
    }

    /// Number of commits that advanced the position.
    pub fn publishes(&self) -> u64 {
        self.lock().publishes
    }

    /// Recent commits, oldest first.
    pub fn history(&self) -> Vec<PublishRecord> {
        self.lock().history.clone()
    }

    /// Wait for the single-writer flag.
    pub async fn begin_publish(&self) -> PublishGuard<'_> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if !state.publishing {
                    state.publishing = true;
                    return PublishGuard { holder: self };
                }
            }
            notified.await;
        }
    }

    /// Acquire the writer flag and merge `cookie` in one step.
    pub async fn publish(&self, rid: u16, cookie: &SyncCookie) -> MergeOutcome {
        let guard = self.begin_publish().await;
        guard.commit(rid, cookie)
    }

    /// Wait until the committed position dominates `target`.
    pub async fn wait_until_covers(&self, target: &SyncCookie) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.lock().cookie.dominates(target) {
                return;
            }
            notified.await;
        }
    }
}

/// Exclusive right to publish; releases the flag and wakes waiters on drop.
#[derive(Debug)]
pub struct PublishGuard<'a> {
    holder: &'a SharedPosition,
}

impl PublishGuard<'_> {
    /// Position at the time of the call.
    pub fn current(&self) -> SyncCookie {
        self.holder.snapshot()
    }

    /// Merge `cookie` in; never moves any origin backward.
    pub fn commit(&self, rid: u16, cookie: &SyncCookie) -> MergeOutcome {
        let mut state = self.holder.lock();
        let outcome = state.cookie.merge(cookie);
        if outcome.advanced {
            state.publishes += 1;
            let record = PublishRecord {
                rid,
                cookie: state.cookie.render(),
                published_at_us: now_us(),
            };
            state.history.push(record);
            if state.history.len() > HISTORY_LIMIT {
                state.history.remove(0);
            }
            debug!(rid, cookie = %state.cookie, leader = ?outcome.leader, "position advanced");
        }
        outcome
    }
}

impl Drop for PublishGuard<'_> {
    fn drop(&mut self) {
        self.holder.lock().publishing = false;
        self.holder.changed.notify_waiters();
    }
}

pub(crate) fn now_us() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
