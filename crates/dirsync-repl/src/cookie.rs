//! Sync cookies: per-origin replication positions.
//!
//! Wire form: `rid=<int>[,sid=<int>][,csn=<id>[;<id>]*]`. The csn list is kept
//! sorted by origin with one entry per origin.

use crate::csn::{self, Csn, Sid, MAX_SID};
use crate::error::{ReplError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Largest replication agreement id (three decimal digits on the wire).
pub const MAX_RID: u16 = 999;

/// A replication position: the newest CSN seen from each origin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SyncCookie {
    /// Replication agreement id the cookie belongs to.
    pub rid: Option<u16>,
    /// Replica id of the server holding the cookie.
    pub sid: Option<Sid>,
    csns: Vec<Csn>,
}

/// Result of merging one cookie into another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MergeOutcome {
    /// True when any origin moved forward or was added.
    pub advanced: bool,
    /// Origin whose new CSN is the newest among the ones that advanced.
    pub leader: Option<Sid>,
}

/// Partial order between two cookies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CookieOrder {
    /// Same CSN for every origin.
    Equal,
    /// Left dominates right and differs.
    Newer,
    /// Right dominates left and differs.
    Older,
    /// Each side is ahead for some origin.
    Diverged,
}

/// Canonicalize a list of raw CSNs: drop malformed ones, keep the newest per
/// origin, sort by origin.
pub fn sort_and_dedup<S: AsRef<str>>(ids: &[S]) -> Vec<Csn> {
    let mut newest: BTreeMap<Sid, Csn> = BTreeMap::new();
    for raw in ids {
        let Ok(parsed) = Csn::parse(raw.as_ref()) else {
            continue;
        };
        match newest.get(&parsed.sid()) {
            Some(existing) if !parsed.is_newer_than(existing) => {}
            _ => {
                newest.insert(parsed.sid(), parsed);
            }
        }
    }
    newest.into_values().collect()
}

impl SyncCookie {
    /// An empty cookie.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cookie from a set of CSNs (canonicalized).
    pub fn from_csns<I: IntoIterator<Item = Csn>>(csns: I) -> Self {
        let mut cookie = Self::new();
        for c in csns {
            cookie.merge_csn(&c);
        }
        cookie
    }

    /// Builder: tag with an agreement id.
    pub fn with_rid(mut self, rid: u16) -> Self {
        self.rid = Some(rid);
        self
    }

    /// Builder: tag with the holder's replica id.
    pub fn with_sid(mut self, sid: Sid) -> Self {
        self.sid = Some(sid);
        self
    }

    /// Parse the wire form.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut cookie = SyncCookie::new();
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(cookie);
        }
        for field in raw.split(',') {
            let (key, value) = field
                .split_once('=')
                .ok_or_else(|| ReplError::protocol(format!("cookie field without '=': {:?}", field)))?;
            match key {
                "rid" => {
                    let rid = parse_field(value, 10, "rid")?;
                    if rid > MAX_RID {
                        return Err(ReplError::protocol(format!("rid {} out of range", rid)));
                    }
                    cookie.rid = Some(rid);
                }
                "sid" => {
                    let sid = parse_field(value, 16, "sid")?;
                    if sid > MAX_SID {
                        return Err(ReplError::protocol(format!("sid {} out of range", sid)));
                    }
                    cookie.sid = Some(sid);
                }
                "csn" => {
                    for id in value.split(';') {
                        let parsed = Csn::parse(id)?;
                        cookie.merge_csn(&parsed);
                    }
                }
                other => {
                    return Err(ReplError::protocol(format!("unknown cookie field {:?}", other)));
                }
            }
        }
        Ok(cookie)
    }

    /// Render the wire form.
    pub fn render(&self) -> String {
        let mut fields = Vec::with_capacity(3);
        if let Some(rid) = self.rid {
            fields.push(format!("rid={:03}", rid));
        }
        if let Some(sid) = self.sid {
            fields.push(format!("sid={:03x}", sid));
        }
        if !self.csns.is_empty() {
            let ids: Vec<&str> = self.csns.iter().map(Csn::as_str).collect();
            fields.push(format!("csn={}", ids.join(";")));
        }
        fields.join(",")
    }

    /// CSNs, sorted by origin.
    pub fn csns(&self) -> &[Csn] {
        &self.csns
    }

    /// Origins present, strictly increasing.
    pub fn sids(&self) -> Vec<Sid> {
        self.csns.iter().map(Csn::sid).collect()
    }

    /// True when no origin is recorded.
    pub fn is_empty(&self) -> bool {
        self.csns.is_empty()
    }

    /// Number of origins.
    pub fn len(&self) -> usize {
        self.csns.len()
    }

    /// Position recorded for one origin.
    pub fn csn_for(&self, sid: Sid) -> Option<&Csn> {
        self.index_of(sid).ok().map(|i| &self.csns[i])
    }

    /// The newest CSN across all origins.
    pub fn max_csn(&self) -> Option<&Csn> {
        self.csns.iter().max()
    }

    /// True when this cookie already covers `csn` (its origin is at or past it).
    pub fn covers(&self, csn: &Csn) -> bool {
        self.csn_for(csn.sid()).is_some_and(|held| !csn.is_newer_than(held))
    }

    /// True when, for every origin in `other`, this cookie is the same or newer.
    pub fn dominates(&self, other: &SyncCookie) -> bool {
        other.csns.iter().all(|c| self.covers(c))
    }

    /// Compare positions under the dominance partial order.
    pub fn compare(&self, other: &SyncCookie) -> CookieOrder {
        match (self.dominates(other), other.dominates(self)) {
            (true, true) => CookieOrder::Equal,
            (true, false) => CookieOrder::Newer,
            (false, true) => CookieOrder::Older,
            (false, false) => CookieOrder::Diverged,
        }
    }

    /// Fold one CSN in; returns true when it advanced the position.
    pub fn merge_csn(&mut self, incoming: &Csn) -> bool {
        match self.index_of(incoming.sid()) {
            Ok(i) => {
                if incoming.is_newer_than(&self.csns[i]) {
                    self.csns[i] = incoming.clone();
                    true
                } else {
                    false
                }
            }
            Err(i) => {
                self.csns.insert(i, incoming.clone());
                true
            }
        }
    }

    /// Fold another cookie in. Origins only ever move forward.
    pub fn merge(&mut self, incoming: &SyncCookie) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();
        let mut leader: Option<&Csn> = None;
        for c in &incoming.csns {
            if self.merge_csn(c) {
                outcome.advanced = true;
                if leader.map_or(true, |l| c.is_newer_than(l)) {
                    leader = Some(c);
                }
            }
        }
        outcome.leader = leader.map(Csn::sid);
        outcome
    }

    /// Strictly advance one origin.
    ///
    /// Returns `Ok(true)` when the position moved, `Ok(false)` when `incoming`
    /// equals the held CSN and an ordering violation when it is older.
    pub fn advance(&mut self, incoming: &Csn) -> Result<bool> {
        if let Some(held) = self.csn_for(incoming.sid()) {
            if held.is_newer_than(incoming) {
                return Err(ReplError::OrderingViolation {
                    sid: incoming.sid(),
                    current: held.to_string(),
                    incoming: incoming.to_string(),
                });
            }
        }
        Ok(self.merge_csn(incoming))
    }

    /// Drop an origin (used when resetting a position for full resync).
    pub fn forget(&mut self, sid: Sid) -> Option<Csn> {
        self.index_of(sid).ok().map(|i| self.csns.remove(i))
    }

    /// Keep only the CSN list (strip rid/sid tags).
    pub fn positions(&self) -> SyncCookie {
        SyncCookie {
            rid: None,
            sid: None,
            csns: self.csns.clone(),
        }
    }

    fn index_of(&self, sid: Sid) -> std::result::Result<usize, usize> {
        self.csns.binary_search_by_key(&sid, Csn::sid)
    }
}

fn parse_field(value: &str, radix: u32, name: &str) -> Result<u16> {
    if value.is_empty() || value.len() > 3 {
        return Err(ReplError::protocol(format!("{} must be 1-3 digits: {:?}", name, value)));
    }
    u16::from_str_radix(value, radix)
        .map_err(|e| ReplError::protocol(format!("bad {} {:?}: {}", name, value, e)))
}

impl fmt::Display for SyncCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl FromStr for SyncCookie {
    type Err = ReplError;

    fn from_str(s: &str) -> Result<Self> {
        SyncCookie::parse(s)
    }
}

impl TryFrom<String> for SyncCookie {
    type Error = ReplError;

    fn try_from(value: String) -> Result<Self> {
        SyncCookie::parse(&value)
    }
}

impl From<SyncCookie> for String {
    fn from(cookie: SyncCookie) -> Self {
        cookie.render()
    }
}

/// Check a raw id list without building a cookie.
pub fn validate_ids<S: AsRef<str>>(ids: &[S]) -> Result<()> {
    ids.iter().try_for_each(|id| csn::validate(id.as_ref()))
}
