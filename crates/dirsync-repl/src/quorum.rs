//! Replica quorum voting.
//!
//! Tracks the status of every replication link attached to a backend and
//! decides whether enough required replicas are reachable for the local copy
//! to answer authoritatively. Also bounds how many refresh rounds may run at
//! once per backend.

use crate::csn::Sid;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

const CACHE_UNKNOWN: u8 = 0;
const CACHE_LACK: u8 = 1;
const CACHE_HAVE: u8 = 2;

/// Status of one replication link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    /// Registered but not yet synchronized.
    Dirty,
    /// Unreachable.
    Dead,
    /// Running a refresh round.
    Refreshing,
    /// Caught up.
    Ready,
    /// Caught up and applying a change.
    Processing,
}

impl LinkStatus {
    /// Whether a link in this status votes "present".
    pub fn is_ready(self) -> bool {
        matches!(self, LinkStatus::Ready | LinkStatus::Processing)
    }
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkStatus::Dirty => "dirty",
            LinkStatus::Dead => "dead",
            LinkStatus::Refreshing => "refreshing",
            LinkStatus::Ready => "ready",
            LinkStatus::Processing => "processing",
        };
        f.write_str(s)
    }
}

/// Who a requirement refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoterId {
    /// A replication agreement.
    Rid(u16),
    /// An origin replica.
    Sid(Sid),
}

/// How strongly a voter is required.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteMode {
    /// Counts toward the majority.
    Vote,
    /// Must be ready, otherwise quorum is lost outright.
    Demand,
    /// Discovered from traffic; votes once enough links exist.
    Auto,
}

/// One quorum requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Requirement {
    /// Voter.
    pub id: VoterId,
    /// Mode.
    pub mode: VoteMode,
}

/// Static quorum settings for one backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuorumConfig {
    /// Requirements known up front.
    pub requirements: Vec<Requirement>,
    /// Add an auto requirement for every registered link.
    pub auto_rid: bool,
    /// Add an auto requirement for every origin learned from traffic.
    pub auto_sid: bool,
    /// Auto voters only count once this many links are registered.
    pub auto_min_links: usize,
    /// Maximum concurrent refresh rounds (0 = unlimited).
    pub max_concurrent_refresh: usize,
}

impl Default for QuorumConfig {
    fn default() -> Self {
        Self {
            requirements: Vec::new(),
            auto_rid: false,
            auto_sid: false,
            auto_min_links: 2,
            max_concurrent_refresh: 0,
        }
    }
}

#[derive(Debug, Clone)]
struct Link {
    rid: u16,
    sid: Option<Sid>,
    status: LinkStatus,
}

#[derive(Debug)]
struct BackendTable {
    config: QuorumConfig,
    links: Vec<Link>,
    requirements: Vec<Requirement>,
    refreshing: HashSet<u16>,
    last_state: Option<bool>,
}

impl BackendTable {
    fn new(config: QuorumConfig) -> Self {
        let mut requirements = Vec::new();
        for req in &config.requirements {
            if !requirements.contains(req) {
                requirements.push(*req);
            }
        }
        Self {
            config,
            links: Vec::new(),
            requirements,
            refreshing: HashSet::new(),
            last_state: None,
        }
    }

    fn voter_ready(&self, id: VoterId) -> bool {
        self.links.iter().any(|l| {
            l.status.is_ready()
                && match id {
                    VoterId::Rid(rid) => l.rid == rid,
                    VoterId::Sid(sid) => l.sid == Some(sid),
                }
        })
    }

    fn add_requirement(&mut self, req: Requirement) -> bool {
        if self.requirements.iter().any(|r| r.id == req.id && r.mode == req.mode) {
            return false;
        }
        self.requirements.push(req);
        true
    }

    fn compute(&self) -> bool {
        for req in &self.requirements {
            if req.mode == VoteMode::Demand && !self.voter_ready(req.id) {
                return false;
            }
        }
        let auto_counts = self.links.len() >= self.config.auto_min_links;
        let voters: BTreeSet<VoterId> = self
            .requirements
            .iter()
            .filter(|r| r.mode != VoteMode::Auto || auto_counts)
            .map(|r| r.id)
            .collect();
        if voters.is_empty() {
            return true;
        }
        let ready = voters.iter().filter(|id| self.voter_ready(**id)).count();
        ready * 2 > voters.len()
    }
}

#[derive(Debug, Default)]
struct Registry {
    tables: HashMap<String, BackendTable>,
}

/// Process-wide quorum registry, shared by `Arc`.
#[derive(Debug, Default)]
pub struct Quorum {
    registry: Mutex<Registry>,
    caches: Mutex<HashMap<String, Arc<AtomicU8>>>,
}

impl Quorum {
    /// Create an empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a backend and return its handle. Re-attaching keeps the table.
    pub fn attach(self: &Arc<Self>, backend: &str, config: QuorumConfig) -> QuorumHandle {
        let cache = {
            let mut caches = lock(&self.caches);
            caches
                .entry(backend.to_string())
                .or_insert_with(|| Arc::new(AtomicU8::new(CACHE_UNKNOWN)))
                .clone()
        };
        lock(&self.registry)
            .tables
            .entry(backend.to_string())
            .or_insert_with(|| BackendTable::new(config));
        cache.store(CACHE_UNKNOWN, Ordering::Release);
        QuorumHandle {
            backend: backend.to_string(),
            quorum: Arc::clone(self),
            cache,
        }
    }

    /// Drop a backend's table at shutdown.
    pub fn detach(&self, backend: &str) {
        lock(&self.registry).tables.remove(backend);
        lock(&self.caches).remove(backend);
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Per-backend view of the quorum registry.
#[derive(Debug, Clone)]
pub struct QuorumHandle {
    backend: String,
    quorum: Arc<Quorum>,
    cache: Arc<AtomicU8>,
}

impl QuorumHandle {
    /// Backend this handle votes for.
    pub fn backend(&self) -> &str {
        &self.backend
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut BackendTable) -> R) -> Option<R> {
        let mut registry = lock(&self.quorum.registry);
        let result = registry.tables.get_mut(&self.backend).map(f);
        self.cache.store(CACHE_UNKNOWN, Ordering::Release);
        result
    }

    /// Register a replication link in `Dirty` state.
    pub fn register_link(&self, rid: u16) {
        self.mutate(|t| {
            if !t.links.iter().any(|l| l.rid == rid) {
                t.links.push(Link {
                    rid,
                    sid: None,
                    status: LinkStatus::Dirty,
                });
            }
            if t.config.auto_rid {
                t.add_requirement(Requirement {
                    id: VoterId::Rid(rid),
                    mode: VoteMode::Auto,
                });
            }
        });
        debug!(backend = %self.backend, rid, "quorum link registered");
    }

    /// Remove a link.
    pub fn unregister_link(&self, rid: u16) {
        self.mutate(|t| {
            t.links.retain(|l| l.rid != rid);
            t.refreshing.remove(&rid);
        });
        debug!(backend = %self.backend, rid, "quorum link unregistered");
    }

    /// Update a link's status.
    pub fn set_status(&self, rid: u16, status: LinkStatus) {
        let changed = self
            .mutate(|t| match t.links.iter_mut().find(|l| l.rid == rid) {
                Some(link) if link.status != status => {
                    link.status = status;
                    true
                }
                _ => false,
            })
            .unwrap_or(false);
        if changed {
            debug!(backend = %self.backend, rid, %status, "quorum link status");
        }
    }

    /// Record the origin a link speaks for, once learned.
    pub fn set_link_sid(&self, rid: u16, sid: Sid) {
        self.mutate(|t| {
            if let Some(link) = t.links.iter_mut().find(|l| l.rid == rid) {
                link.sid = Some(sid);
            }
            if t.config.auto_sid {
                t.add_requirement(Requirement {
                    id: VoterId::Sid(sid),
                    mode: VoteMode::Auto,
                });
            }
        });
    }

    /// Add a requirement. Returns false when it was already present.
    pub fn add_requirement(&self, req: Requirement) -> bool {
        self.mutate(|t| t.add_requirement(req)).unwrap_or(false)
    }

    /// Remove every requirement for `id` with the given mode.
    pub fn remove_requirement(&self, id: VoterId, mode: VoteMode) {
        self.mutate(|t| t.requirements.retain(|r| !(r.id == id && r.mode == mode)));
    }

    /// Current quorum decision (cached until the next mutation).
    pub fn has_quorum(&self) -> bool {
        match self.cache.load(Ordering::Acquire) {
            CACHE_HAVE => return true,
            CACHE_LACK => return false,
            _ => {}
        }
        let mut registry = lock(&self.quorum.registry);
        let Some(table) = registry.tables.get_mut(&self.backend) else {
            return true;
        };
        let have = table.compute();
        if table.last_state != Some(have) {
            if table.last_state.is_some() {
                info!(backend = %self.backend, have, "quorum state changed");
            }
            table.last_state = Some(have);
        }
        self.cache
            .store(if have { CACHE_HAVE } else { CACHE_LACK }, Ordering::Release);
        have
    }

    /// Try to start a refresh round for `rid`. Returns `None` when the
    /// concurrent-refresh limit is reached or `rid` already holds a permit.
    pub fn try_begin_refresh(&self, rid: u16) -> Option<RefreshPermit> {
        let admitted = self
            .mutate(|t| {
                let limit = t.config.max_concurrent_refresh;
                if t.refreshing.contains(&rid) {
                    return false;
                }
                if limit > 0 && t.refreshing.len() >= limit {
                    return false;
                }
                t.refreshing.insert(rid);
                true
            })
            .unwrap_or(true);
        if !admitted {
            debug!(backend = %self.backend, rid, "refresh admission deferred");
            return None;
        }
        Some(RefreshPermit {
            handle: self.clone(),
            rid,
        })
    }

    /// Number of refresh rounds currently admitted.
    pub fn refreshes_in_progress(&self) -> usize {
        lock(&self.quorum.registry)
            .tables
            .get(&self.backend)
            .map(|t| t.refreshing.len())
            .unwrap_or(0)
    }

    /// Per-link readiness, sorted by rid.
    pub fn links(&self) -> Vec<(u16, Option<Sid>, LinkStatus)> {
        let registry = lock(&self.quorum.registry);
        let mut links: Vec<_> = registry
            .tables
            .get(&self.backend)
            .map(|t| t.links.iter().map(|l| (l.rid, l.sid, l.status)).collect())
            .unwrap_or_default();
        links.sort_by_key(|l| l.0);
        links
    }

    /// Human-readable summary, for observability only.
    pub fn summary(&self) -> String {
        let have = self.has_quorum();
        let registry = lock(&self.quorum.registry);
        let Some(table) = registry.tables.get(&self.backend) else {
            return format!("{}: detached", self.backend);
        };
        let mut links: Vec<String> = table
            .links
            .iter()
            .map(|l| match l.sid {
                Some(sid) => format!("rid={:03}/sid={:03x}:{}", l.rid, sid, l.status),
                None => format!("rid={:03}:{}", l.rid, l.status),
            })
            .collect();
        links.sort();
        let reqs: Vec<String> = table
            .requirements
            .iter()
            .map(|r| {
                let id = match r.id {
                    VoterId::Rid(rid) => format!("rid={:03}", rid),
                    VoterId::Sid(sid) => format!("sid={:03x}", sid),
                };
                format!("{}:{:?}", id, r.mode).to_lowercase()
            })
            .collect();
        format!(
            "{}: quorum={} links=[{}] requirements=[{}] refreshing={}",
            self.backend,
            if have { "have" } else { "lack" },
            links.join(" "),
            reqs.join(" "),
            table.refreshing.len()
        )
    }
}

/// Admission to run one refresh round; released on drop.
#[derive(Debug)]
pub struct RefreshPermit {
    handle: QuorumHandle,
    rid: u16,
}

impl Drop for RefreshPermit {
    fn drop(&mut self) {
        let rid = self.rid;
        self.handle.mutate(|t| t.refreshing.remove(&rid));
    }
}
