//! Persistent search sessions held by the provider.
//!
//! A registration lives in the [`SessionRegistry`] for as long as its
//! consumer is attached. The write path, the draining task and the closer
//! all share it by `Arc`; whichever of them removes it from the registry is
//! the one that releases it.

use crate::csn::{Csn, Sid};
use crate::entry::{Dn, Entry, EntryUuid, Filter, Scope};
use crate::transport::Conduit;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

/// Registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ps-{}", self.0)
    }
}

/// Lifecycle of a persistent search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Refresh content is being sent; writes are queued.
    Refreshing,
    /// Refresh done; the serving task drains the backlog.
    Steady,
    /// Backlog drained; the write path schedules delivery.
    Detached,
    /// Finished or failed.
    Dead,
}

impl SessionState {
    /// Whether moving to `next` is allowed.
    pub fn can_transition(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Refreshing, Steady) | (Steady, Detached) | (Refreshing | Steady | Detached, Dead)
        )
    }
}

/// Notification kind as delivered to the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyKind {
    /// Entry entered the session's view.
    Add,
    /// Entry changed inside the view.
    Modify,
    /// Entry left the view or was removed.
    Delete,
}

/// One change, shared across every matching session queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Kind.
    pub kind: NotifyKind,
    /// Target.
    pub uuid: EntryUuid,
    /// DN at the time of the change.
    pub dn: Dn,
    /// Commit CSN.
    pub csn: Csn,
    /// After-image (absent for deletes).
    pub entry: Option<Entry>,
}

/// An item waiting in a session queue.
#[derive(Debug, Clone)]
pub enum Pending {
    /// An entry change.
    Change(Arc<Notification>),
    /// Position moved without anything in view changing.
    Cookie(Csn),
}

impl Pending {
    /// CSN carried by the item.
    pub fn csn(&self) -> &Csn {
        match self {
            Pending::Change(n) => &n.csn,
            Pending::Cookie(c) => c,
        }
    }
}

/// A live persist-phase session.
#[derive(Debug)]
pub struct PersistentSearch {
    id: SessionId,
    /// Agreement id from the consumer's cookie.
    pub rid: Option<u16>,
    /// Consumer replica id, used to avoid echoing its own changes back.
    pub consumer_sid: Option<Sid>,
    /// Search base.
    pub base: Dn,
    /// Search scope.
    pub scope: Scope,
    /// Search filter.
    pub filter: Filter,
    conduit: Conduit,
    state: Mutex<SessionState>,
    queue: Mutex<VecDeque<Pending>>,
    draining: AtomicBool,
    enqueued: AtomicU64,
    delivered: AtomicU64,
}

impl PersistentSearch {
    /// Registration id.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The provider end of the session.
    pub fn conduit(&self) -> &Conduit {
        &self.conduit
    }

    /// True when `entry` is visible to this session.
    pub fn matches(&self, entry: &Entry) -> bool {
        self.scope.contains(&self.base, &entry.dn) && (entry.glue || self.filter.matches(entry))
    }

    /// True when the change came from this session's own consumer.
    pub fn is_echo(&self, csn: &Csn) -> bool {
        self.consumer_sid == Some(csn.sid())
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_queue(&self) -> MutexGuard<'_, VecDeque<Pending>> {
        self.queue.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        *self.lock_state()
    }

    /// Move to `next`. Returns false for a disallowed transition.
    pub fn transition(&self, next: SessionState) -> bool {
        let mut state = self.lock_state();
        if !state.can_transition(next) {
            return false;
        }
        debug!(session = %self.id, from = ?*state, to = ?next, "session state");
        *state = next;
        true
    }

    /// Queue an item. Returns the queue length afterward, or `None` when the
    /// session is dead.
    pub fn enqueue(&self, item: Pending) -> Option<usize> {
        if self.state() == SessionState::Dead {
            return None;
        }
        let mut queue = self.lock_queue();
        queue.push_back(item);
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        Some(queue.len())
    }

    /// Take up to `max` queued items, oldest first.
    pub fn take_batch(&self, max: usize) -> Vec<Pending> {
        let mut queue = self.lock_queue();
        let n = max.min(queue.len());
        queue.drain(..n).collect()
    }

    /// Items waiting.
    pub fn pending(&self) -> usize {
        self.lock_queue().len()
    }

    /// Claim the draining role. Only one draining task runs per session.
    pub fn try_start_drain(&self) -> bool {
        self.draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Give the draining role back.
    pub fn finish_drain(&self) {
        self.draining.store(false, Ordering::Release);
    }

    /// Count delivered items.
    pub fn mark_delivered(&self, n: usize) {
        self.delivered.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// (enqueued, delivered) totals.
    pub fn counters(&self) -> (u64, u64) {
        (
            self.enqueued.load(Ordering::Relaxed),
            self.delivered.load(Ordering::Relaxed),
        )
    }
}

/// Parameters of a new registration.
#[derive(Debug, Clone)]
pub struct Registration {
    /// Agreement id.
    pub rid: Option<u16>,
    /// Consumer replica id.
    pub consumer_sid: Option<Sid>,
    /// Search base.
    pub base: Dn,
    /// Search scope.
    pub scope: Scope,
    /// Search filter.
    pub filter: Filter,
}

/// All live persistent searches of one provider.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, Arc<PersistentSearch>>>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, Arc<PersistentSearch>>> {
        self.sessions.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Add a session in the `Refreshing` state.
    pub fn register(&self, reg: Registration, conduit: Conduit) -> Arc<PersistentSearch> {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let session = Arc::new(PersistentSearch {
            id,
            rid: reg.rid,
            consumer_sid: reg.consumer_sid,
            base: reg.base,
            scope: reg.scope,
            filter: reg.filter,
            conduit,
            state: Mutex::new(SessionState::Refreshing),
            queue: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
            enqueued: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
        });
        self.lock().insert(id, Arc::clone(&session));
        info!(session = %id, rid = ?session.rid, base = %session.base, "persistent search registered");
        session
    }

    /// Remove and release a session. Only the first caller gets `Some`; it
    /// marks the session dead, drops its queue and closes its conduit.
    pub fn remove(&self, id: SessionId) -> Option<Arc<PersistentSearch>> {
        let session = self.lock().remove(&id)?;
        session.transition(SessionState::Dead);
        session.lock_queue().clear();
        session.conduit.close();
        let (enqueued, delivered) = session.counters();
        info!(session = %id, enqueued, delivered, "persistent search released");
        Some(session)
    }

    /// Look up a session.
    pub fn get(&self, id: SessionId) -> Option<Arc<PersistentSearch>> {
        self.lock().get(&id).cloned()
    }

    /// All live sessions.
    pub fn snapshot(&self) -> Vec<Arc<PersistentSearch>> {
        self.lock().values().cloned().collect()
    }

    /// Live session count.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release every session.
    pub fn clear(&self) -> usize {
        let ids: Vec<SessionId> = self.lock().keys().copied().collect();
        ids.into_iter().filter_map(|id| self.remove(id)).count()
    }
}
