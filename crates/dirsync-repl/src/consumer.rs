//! Sync consumer: one replication agreement pulling from one provider.
//!
//! A [`Consumer`] is a [`ScheduledTask`]. Each run does one slice of work:
//! a whole refresh round, or one batch of persist-phase deliveries. Between
//! slices the worker goes back to the pool.

use crate::config::AgreementConfig;
use crate::conflict;
use crate::cookie::SyncCookie;
use crate::csn::{Csn, CsnGenerator, Sid};
use crate::entry::{Entry, EntryUuid};
use crate::error::{ApplyError, ErrorClass, ReplError, Result};
use crate::position::SharedPosition;
use crate::protocol::{
    self, ConsumerMessage, EntryState, ProviderMessage, RefusalKind, SyncInfo, SyncMode,
    SyncRequest, SyncState,
};
use crate::quorum::{LinkStatus, QuorumHandle};
use crate::reconcile::{self, PresentList};
use crate::scheduler::{ScheduledTask, TaskOutcome};
use crate::store::ChangeKind;
use crate::transport::{Conduit, Connector};
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Delay before asking for refresh admission again.
const ADMISSION_BACKOFF: Duration = Duration::from_secs(1);

/// Lifecycle of one agreement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerState {
    /// Not connected.
    Idle,
    /// Opening a session.
    Connecting,
    /// Receiving refresh content.
    Refreshing,
    /// Refresh-only round finished; waiting for the next interval.
    Steady,
    /// Receiving persist-phase changes.
    Persisting,
    /// Waiting out a retry delay.
    RetryWait,
    /// Retry schedule exhausted or shut down.
    Dead,
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConsumerState::Idle => "idle",
            ConsumerState::Connecting => "connecting",
            ConsumerState::Refreshing => "refreshing",
            ConsumerState::Steady => "steady",
            ConsumerState::Persisting => "persisting",
            ConsumerState::RetryWait => "retry-wait",
            ConsumerState::Dead => "dead",
        };
        f.write_str(s)
    }
}

/// Per-agreement counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerCounters {
    /// Completed refresh rounds.
    pub rounds: u64,
    /// Rounds that reloaded everything.
    pub full_rounds: u64,
    /// Entries added (including adopted placeholders).
    pub adds: u64,
    /// Entries modified.
    pub modifies: u64,
    /// Entries moved.
    pub renames: u64,
    /// Entries deleted.
    pub deletes: u64,
    /// Entries turned into glue instead of deleted.
    pub glued: u64,
    /// Glue parents created for orphans.
    pub placeholders: u64,
    /// Deliveries skipped as already applied.
    pub echoes_skipped: u64,
    /// Changes skipped on a local conflict.
    pub conflicts: u64,
    /// Entries removed or glued by reconciliation.
    pub reconciled: u64,
    /// Persist batches applied.
    pub batches: u64,
    /// Retries scheduled.
    pub retries: u64,
    /// Positions that moved backward.
    pub ordering_violations: u64,
}

/// Snapshot of one agreement for status reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgreementStatus {
    /// Agreement id.
    pub rid: u16,
    /// Provider endpoint.
    pub provider: String,
    /// Current state.
    pub state: ConsumerState,
    /// Position last received from the provider.
    pub remote_cookie: String,
    /// Most recent failure.
    pub last_error: Option<String>,
    /// Counters.
    pub counters: ConsumerCounters,
}

struct ConsumerInner {
    state: ConsumerState,
    conduit: Option<Conduit>,
    remote: SyncCookie,
    link_sid: Option<Sid>,
    retry: crate::retry::RetryState,
    reload_next: bool,
    last_error: Option<String>,
    counters: ConsumerCounters,
}

/// Work in flight for one refresh round or persist batch.
#[derive(Default)]
struct Round {
    persist: bool,
    full: bool,
    present: PresentList,
    deletes: Vec<EntryUuid>,
    cookie: SyncCookie,
}

struct RoundEnd {
    cookie: Option<String>,
    refresh_deletes: bool,
}

/// One replication agreement.
pub struct Consumer {
    config: AgreementConfig,
    local_sid: Sid,
    store: Arc<dyn crate::store::LocalStore>,
    position: Arc<SharedPosition>,
    quorum: QuorumHandle,
    connector: Arc<dyn Connector>,
    csn_gen: CsnGenerator,
    cancel: CancellationToken,
    inner: Mutex<ConsumerInner>,
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("rid", &self.config.rid)
            .field("provider", &self.config.provider)
            .finish()
    }
}

impl Consumer {
    /// Build the agreement and register its quorum link.
    pub fn new(
        config: AgreementConfig,
        local_sid: Sid,
        store: Arc<dyn crate::store::LocalStore>,
        position: Arc<SharedPosition>,
        quorum: QuorumHandle,
        connector: Arc<dyn Connector>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let csn_gen = CsnGenerator::new(local_sid)?;
        quorum.register_link(config.rid);
        info!(rid = config.rid, provider = %config.provider, mode = ?config.mode, "agreement created");
        Ok(Arc::new(Self {
            config,
            local_sid,
            store,
            position,
            quorum,
            connector,
            csn_gen,
            cancel: CancellationToken::new(),
            inner: Mutex::new(ConsumerInner {
                state: ConsumerState::Idle,
                conduit: None,
                remote: SyncCookie::new(),
                link_sid: None,
                retry: Default::default(),
                reload_next: false,
                last_error: None,
                counters: ConsumerCounters::default(),
            }),
        }))
    }

    /// Agreement id.
    pub fn rid(&self) -> u16 {
        self.config.rid
    }

    /// Agreement settings.
    pub fn config(&self) -> &AgreementConfig {
        &self.config
    }

    /// Current state.
    pub async fn state(&self) -> ConsumerState {
        self.inner.lock().await.state
    }

    /// Ask for a full reload on the next round.
    pub async fn request_reload(&self) {
        self.inner.lock().await.reload_next = true;
    }

    /// Status snapshot.
    pub async fn status(&self) -> AgreementStatus {
        let inner = self.inner.lock().await;
        AgreementStatus {
            rid: self.config.rid,
            provider: self.connector.endpoint(),
            state: inner.state,
            remote_cookie: inner.remote.render(),
            last_error: inner.last_error.clone(),
            counters: inner.counters.clone(),
        }
    }

    /// Abandon the session and stop for good.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let mut inner = self.inner.lock().await;
        if let Some(conduit) = inner.conduit.take() {
            let _ = conduit.send(&ConsumerMessage::Abandon).await;
            conduit.close();
        }
        inner.state = ConsumerState::Dead;
        self.quorum.set_status(self.config.rid, LinkStatus::Dead);
        info!(rid = self.config.rid, "agreement stopped");
    }

    /// Run one slice of work.
    pub async fn step(&self) -> TaskOutcome {
        if self.cancel.is_cancelled() {
            return TaskOutcome::Remove;
        }
        let mut inner = self.inner.lock().await;
        let result = match inner.state {
            ConsumerState::Dead => return TaskOutcome::Remove,
            ConsumerState::Persisting => self.persist_poll(&mut inner).await,
            _ => self.refresh_round(&mut inner).await,
        };
        match result {
            Ok(outcome) => outcome,
            Err(e) => self.fail(&mut inner, e),
        }
    }

    async fn recv(&self, conduit: &Conduit, timeout: Duration) -> Result<Option<ProviderMessage>> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ReplError::Cancelled),
            r = conduit.recv(timeout) => r,
        }
    }

    async fn refresh_round(&self, inner: &mut ConsumerInner) -> Result<TaskOutcome> {
        let rid = self.config.rid;
        let Some(_permit) = self.quorum.try_begin_refresh(rid) else {
            return Ok(TaskOutcome::Reschedule(ADMISSION_BACKOFF));
        };
        inner.state = ConsumerState::Connecting;
        let conduit = self.connector.connect().await?;
        inner.conduit = Some(conduit.clone());
        inner.state = ConsumerState::Refreshing;
        self.quorum.set_status(rid, LinkStatus::Refreshing);

        let position = self.position.snapshot();
        let reload = inner.reload_next;
        if reload {
            inner.remote = SyncCookie::new();
        }
        let mut round = Round {
            full: reload || position.is_empty(),
            ..Default::default()
        };
        let cookie = position.with_rid(rid).with_sid(self.local_sid);
        debug!(rid, %cookie, reload, "requesting refresh");
        conduit
            .send(&ConsumerMessage::Request(SyncRequest {
                mode: self.config.mode,
                cookie: Some(cookie.render()),
                reload_hint: reload,
                base: self.config.base.clone(),
                scope: self.config.scope,
                filter: self.config.filter.clone(),
            }))
            .await?;

        let end = loop {
            let Some(msg) = self.recv(&conduit, self.config.timeout()).await? else {
                return Err(ReplError::network(format!(
                    "{}: session ended during refresh",
                    conduit.label()
                )));
            };
            if let Some(end) = self.handle(inner, &mut round, msg)? {
                break end;
            }
        };
        let full = round.full;
        self.finish_refresh(inner, round, end).await?;

        inner.reload_next = false;
        inner.retry.reset();
        inner.last_error = None;
        inner.counters.rounds += 1;
        if full {
            inner.counters.full_rounds += 1;
        }
        self.quorum.set_status(rid, LinkStatus::Ready);
        match self.config.mode {
            SyncMode::RefreshOnly => {
                inner.conduit = None;
                inner.state = ConsumerState::Steady;
                Ok(TaskOutcome::Reschedule(self.config.interval()))
            }
            SyncMode::RefreshAndPersist => {
                inner.state = ConsumerState::Persisting;
                info!(rid, "refresh complete, persisting");
                Ok(TaskOutcome::Resubmit)
            }
        }
    }

    async fn finish_refresh(
        &self,
        inner: &mut ConsumerInner,
        mut round: Round,
        end: RoundEnd,
    ) -> Result<()> {
        let rid = self.config.rid;
        let mut last = round.cookie.clone();
        if let Some(cookie) = protocol::parse_cookie(end.cookie.as_deref())? {
            self.learn_sid(inner, &cookie);
            last.merge(&cookie);
        }
        if let Some(held) = inner
            .remote
            .csns()
            .iter()
            .find(|held| last.csn_for(held.sid()).is_some_and(|fresh| held.is_newer_than(fresh)))
        {
            let err = ReplError::OrderingViolation {
                sid: held.sid(),
                current: held.to_string(),
                incoming: last
                    .csn_for(held.sid())
                    .map(Csn::to_string)
                    .unwrap_or_default(),
            };
            inner.counters.ordering_violations += 1;
            if self.config.strict {
                return Err(err);
            }
            warn!(rid, error = %err, "provider position moved backward");
        }

        let csn = match last.max_csn() {
            Some(csn) => csn.clone(),
            None => self.csn_gen.next()?,
        };
        for uuid in std::mem::take(&mut round.deletes) {
            let r = self.delete_entry(inner, &uuid, &csn);
            self.absorb(inner, &uuid, r)?;
        }
        if !end.refresh_deletes {
            let report = reconcile::reconcile(
                self.store.as_ref(),
                &self.config.base,
                self.config.scope,
                &self.config.filter,
                &round.present,
                &last,
                &csn,
            )?;
            inner.counters.reconciled += (report.deleted.len() + report.glued.len()) as u64;
            if report.skipped_newer > 0 {
                debug!(rid, kept = report.skipped_newer, "entries newer than the refresh kept");
            }
        }

        let outcome = self.position.publish(rid, &last.positions()).await;
        inner.remote.merge(&last.positions());
        info!(
            rid,
            cookie = %inner.remote,
            full = round.full,
            refresh_deletes = end.refresh_deletes,
            present = round.present.len(),
            advanced = outcome.advanced,
            "refresh round finished"
        );
        Ok(())
    }

    async fn persist_poll(&self, inner: &mut ConsumerInner) -> Result<TaskOutcome> {
        let rid = self.config.rid;
        let Some(conduit) = inner.conduit.clone() else {
            inner.state = ConsumerState::Idle;
            return Ok(TaskOutcome::Resubmit);
        };
        let first = match self.recv(&conduit, self.config.poll_wait()).await {
            Err(ReplError::Timeout { .. }) => return Ok(TaskOutcome::Resubmit),
            Err(e) => return Err(e),
            Ok(None) => {
                return Err(ReplError::network(format!("{}: provider ended the session", conduit.label())))
            }
            Ok(Some(msg)) => msg,
        };
        self.quorum.set_status(rid, LinkStatus::Processing);
        let mut round = Round {
            persist: true,
            ..Default::default()
        };
        let mut next = Some(first);
        let mut applied = 0;
        while let Some(msg) = next {
            if let Some(end) = self.handle(inner, &mut round, msg)? {
                if let Some(cookie) = protocol::parse_cookie(end.cookie.as_deref())? {
                    round.cookie.merge(&cookie);
                }
            }
            applied += 1;
            if applied >= self.config.persist_batch {
                break;
            }
            next = conduit.try_recv().await?;
        }
        let last = round.cookie.positions();
        if !last.is_empty() {
            self.position.publish(rid, &last).await;
        }
        inner.counters.batches += 1;
        self.quorum.set_status(rid, LinkStatus::Ready);
        debug!(rid, applied, cookie = %inner.remote, "persist batch applied");
        Ok(TaskOutcome::Resubmit)
    }

    fn fail(&self, inner: &mut ConsumerInner, err: ReplError) -> TaskOutcome {
        let rid = self.config.rid;
        inner.last_error = Some(err.to_string());
        if let Some(conduit) = inner.conduit.take() {
            conduit.close();
        }
        if self.cancel.is_cancelled() {
            inner.state = ConsumerState::Dead;
            return TaskOutcome::Remove;
        }
        match err.class() {
            ErrorClass::Ordering => {
                warn!(rid, error = %err, "ordering violation, full reload after retry delay");
                inner.reload_next = true;
                self.quorum.set_status(rid, LinkStatus::Dirty);
            }
            ErrorClass::Protocol | ErrorClass::Conflict => {
                warn!(rid, error = %err, "session torn down");
                self.quorum.set_status(rid, LinkStatus::Dirty);
            }
            ErrorClass::Transient => {
                warn!(rid, error = %err, "provider unreachable");
                self.quorum.set_status(rid, LinkStatus::Dead);
            }
            ErrorClass::Fatal => {
                error!(rid, error = %err, "local store failure");
                self.quorum.set_status(rid, LinkStatus::Dead);
            }
        }
        match self.config.retry.next_delay(&mut inner.retry) {
            Some(delay) => {
                inner.state = ConsumerState::RetryWait;
                inner.counters.retries += 1;
                debug!(rid, delay_secs = delay.as_secs(), "retry scheduled");
                TaskOutcome::Reschedule(delay)
            }
            None => {
                error!(rid, schedule = %self.config.retry, "retry schedule exhausted, agreement dead");
                inner.state = ConsumerState::Dead;
                self.quorum.set_status(rid, LinkStatus::Dead);
                TaskOutcome::Remove
            }
        }
    }

    // --- deliveries -------------------------------------------------------

    fn learn_sid(&self, inner: &mut ConsumerInner, cookie: &SyncCookie) {
        if let Some(sid) = cookie.sid {
            if inner.link_sid != Some(sid) {
                inner.link_sid = Some(sid);
                self.quorum.set_link_sid(self.config.rid, sid);
            }
        }
    }

    /// Swallow a per-entry conflict so the rest of the stream still applies.
    fn absorb(&self, inner: &mut ConsumerInner, uuid: &EntryUuid, r: Result<()>) -> Result<()> {
        match r {
            Err(e) if e.class() == ErrorClass::Conflict => {
                warn!(rid = self.config.rid, %uuid, error = %e, "change skipped");
                inner.counters.conflicts += 1;
                Ok(())
            }
            r => r,
        }
    }

    fn handle(
        &self,
        inner: &mut ConsumerInner,
        round: &mut Round,
        msg: ProviderMessage,
    ) -> Result<Option<RoundEnd>> {
        match msg {
            ProviderMessage::State(state) => {
                self.handle_state(inner, round, state)?;
                Ok(None)
            }
            ProviderMessage::Info(SyncInfo::NewCookie { cookie }) => {
                if let Some(cookie) = protocol::parse_cookie(Some(&cookie))? {
                    self.learn_sid(inner, &cookie);
                    if round.persist {
                        inner.remote.merge(&cookie.positions());
                    }
                    round.cookie.merge(&cookie);
                }
                Ok(None)
            }
            ProviderMessage::Info(SyncInfo::RefreshDelete { cookie, done }) => {
                Ok(done.then_some(RoundEnd {
                    cookie,
                    refresh_deletes: true,
                }))
            }
            ProviderMessage::Info(SyncInfo::RefreshPresent { cookie, done }) => {
                Ok(done.then_some(RoundEnd {
                    cookie,
                    refresh_deletes: false,
                }))
            }
            ProviderMessage::Info(SyncInfo::IdSet {
                cookie,
                refresh_deletes,
                uuids,
            }) => {
                if let Some(cookie) = protocol::parse_cookie(cookie.as_deref())? {
                    round.cookie.merge(&cookie);
                }
                if !refresh_deletes {
                    round.present.extend(uuids);
                } else if round.persist {
                    let csn = match inner.remote.max_csn() {
                        Some(csn) => csn.clone(),
                        None => self.csn_gen.next()?,
                    };
                    for uuid in uuids {
                        let r = self.delete_entry(inner, &uuid, &csn);
                        self.absorb(inner, &uuid, r)?;
                    }
                } else {
                    round.deletes.extend(uuids);
                }
                Ok(None)
            }
            ProviderMessage::Done(done) => Ok(Some(RoundEnd {
                cookie: done.cookie,
                refresh_deletes: done.refresh_deletes,
            })),
            ProviderMessage::Refused { kind, msg } => Err(match kind {
                RefusalKind::Busy => ReplError::Busy { msg },
                RefusalKind::ProtocolError => ReplError::protocol(msg),
                RefusalKind::Unavailable => ReplError::network(msg),
            }),
        }
    }

    fn handle_state(&self, inner: &mut ConsumerInner, round: &mut Round, state: SyncState) -> Result<()> {
        let rid = self.config.rid;
        let cookie = protocol::parse_cookie(state.cookie.as_deref())?;
        if let Some(cookie) = &cookie {
            self.learn_sid(inner, cookie);
        }
        let csn = cookie
            .as_ref()
            .and_then(|c| c.max_csn().cloned())
            .or_else(|| state.entry.as_ref().and_then(|e| e.csn.clone()));

        if let Some(csn) = &csn {
            // persist items queued before the refresh snapshot arrive again
            if round.persist && inner.remote.covers(csn) {
                inner.counters.echoes_skipped += 1;
                return Ok(());
            }
            if self.config.strict
                && !round.full
                && state.state != EntryState::Present
                && self.position.snapshot().covers(csn)
            {
                // still on the provider, so it must survive reconciliation
                if matches!(state.state, EntryState::Add | EntryState::Modify) {
                    round.present.insert(state.uuid);
                }
                debug!(rid, uuid = %state.uuid, %csn, "already applied, skipped");
                inner.counters.echoes_skipped += 1;
                return Ok(());
            }
        }
        if let Some(cookie) = &cookie {
            if round.persist {
                inner.remote.merge(&cookie.positions());
            }
            round.cookie.merge(cookie);
        }

        let uuid = state.uuid;
        match state.state {
            EntryState::Add | EntryState::Modify => {
                let entry = state.entry.ok_or_else(|| {
                    ReplError::protocol(format!("{:?} for {} carries no entry", state.state, uuid))
                })?;
                if entry.uuid != uuid {
                    return Err(ReplError::protocol(format!(
                        "entry {} delivered under uuid {}",
                        entry.uuid, uuid
                    )));
                }
                let csn = match csn {
                    Some(csn) => csn,
                    None => self.csn_gen.next()?,
                };
                if !round.persist {
                    round.present.insert(uuid);
                }
                let r = self.apply_entry(inner, entry, &csn);
                self.absorb(inner, &uuid, r)
            }
            EntryState::Delete => {
                let csn = match csn {
                    Some(csn) => csn,
                    None => self.csn_gen.next()?,
                };
                let r = self.delete_entry(inner, &uuid, &csn);
                self.absorb(inner, &uuid, r)
            }
            EntryState::Present => {
                if let Some(csn) = &csn {
                    let position = self.position.snapshot();
                    if !position.covers(csn) {
                        if !self.config.present_ahead_is_echo {
                            return Err(ReplError::OrderingViolation {
                                sid: csn.sid(),
                                current: position
                                    .csn_for(csn.sid())
                                    .map(Csn::to_string)
                                    .unwrap_or_default(),
                                incoming: csn.to_string(),
                            });
                        }
                        debug!(rid, %uuid, %csn, "present ahead of local position");
                    }
                }
                round.present.insert(uuid);
                Ok(())
            }
        }
    }

    fn apply_entry(&self, inner: &mut ConsumerInner, mut entry: Entry, csn: &Csn) -> Result<()> {
        let store = self.store.as_ref();
        if entry.csn.is_none() {
            entry.csn = Some(csn.clone());
        }
        let Some(local) = store.get(&entry.uuid)? else {
            return self.add_entry(inner, entry, csn);
        };
        if local.dn == entry.dn && local.attrs == entry.attrs {
            return Ok(());
        }
        let later = store.changes_since(&entry.uuid, csn)?;
        if local.dn != entry.dn {
            if later.iter().any(|c| c.kind == ChangeKind::Rename) {
                debug!(rid = self.config.rid, uuid = %entry.uuid, dn = %local.dn, "newer local rename kept");
            } else {
                inner.counters.placeholders +=
                    reconcile::ensure_parents(store, &self.config.base, &entry.dn, csn)? as u64;
                store.rename(&entry.uuid, &entry.dn, &[], csn)?;
                inner.counters.renames += 1;
                debug!(rid = self.config.rid, from = %local.dn, to = %entry.dn, "entry moved");
            }
        }
        let resolution = conflict::resolve(&local.diff(&entry), &later);
        if resolution.dropped > 0 || resolution.trimmed > 0 {
            debug!(
                rid = self.config.rid,
                uuid = %entry.uuid,
                dropped = resolution.dropped,
                trimmed = resolution.trimmed,
                "newer local changes kept"
            );
        }
        if !resolution.mods.is_empty() {
            store.modify(&entry.uuid, &resolution.mods, csn)?;
            inner.counters.modifies += 1;
        }
        Ok(())
    }

    fn add_entry(&self, inner: &mut ConsumerInner, entry: Entry, csn: &Csn) -> Result<()> {
        let store = self.store.as_ref();
        if let Some(existing) = store.get_by_dn(&entry.dn)? {
            if !existing.glue {
                return Err(ApplyError::AlreadyExists {
                    dn: entry.dn.to_string(),
                }
                .into());
            }
            debug!(rid = self.config.rid, dn = %entry.dn, "placeholder replaced");
            store.adopt(&existing.uuid, entry)?;
            inner.counters.adds += 1;
            return Ok(());
        }
        match store.add(entry.clone()) {
            Err(ApplyError::NoSuchObject { .. }) => {
                inner.counters.placeholders +=
                    reconcile::ensure_parents(store, &self.config.base, &entry.dn, csn)? as u64;
                store.add(entry)?;
            }
            r => r?,
        }
        inner.counters.adds += 1;
        Ok(())
    }

    fn delete_entry(&self, inner: &mut ConsumerInner, uuid: &EntryUuid, csn: &Csn) -> Result<()> {
        match reconcile::delete_or_glue(self.store.as_ref(), uuid, csn) {
            Ok(true) => inner.counters.glued += 1,
            Ok(false) => inner.counters.deletes += 1,
            Err(ReplError::Apply(ApplyError::NoSuchObject { .. })) => {
                debug!(rid = self.config.rid, %uuid, "delete of absent entry ignored");
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }
}

#[async_trait]
impl ScheduledTask for Consumer {
    fn name(&self) -> String {
        self.config.task_name()
    }

    async fn run(&self) -> TaskOutcome {
        self.step().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderConfig;
    use crate::entry::{Dn, Filter, ModOp, Modification};
    use crate::provider::Provider;
    use crate::quorum::{Quorum, QuorumConfig};
    use crate::retry::RetrySchedule;
    use crate::scheduler::{PoolConfig, WorkerPool};
    use crate::store::{LocalStore, MemoryStore};
    use crate::transport::{LoopbackConnector, SessionAcceptor};

    struct Pair {
        provider: Arc<Provider>,
        connector: Arc<LoopbackConnector>,
        store: Arc<MemoryStore>,
        position: Arc<SharedPosition>,
        quorum: QuorumHandle,
    }

    fn root() -> Entry {
        Entry::new(EntryUuid::from_u128(100), Dn::new("dc=example"))
    }

    fn person(n: u128, rdn: &str) -> Entry {
        Entry::new(EntryUuid::from_u128(n), Dn::new(&format!("{},dc=example", rdn)))
            .with_attr("cn", &[rdn])
    }

    fn pair(provider_config: ProviderConfig) -> Pair {
        let provider = Provider::open(
            1,
            ProviderConfig {
                suffix: Dn::new("dc=example"),
                checkpoint_ops: 0,
                checkpoint_interval_secs: 0,
                ..provider_config
            },
            Arc::new(MemoryStore::new()),
            WorkerPool::new(PoolConfig::default()),
        )
        .unwrap();
        provider.add_local(root()).unwrap();
        for i in 1..=3 {
            provider.add_local(person(i, &format!("cn=p{}", i))).unwrap();
        }
        let connector = Arc::new(LoopbackConnector::new(
            "mem://p1",
            Arc::clone(&provider) as Arc<dyn crate::transport::SessionAcceptor>,
            64,
        ));
        Pair {
            provider,
            connector,
            store: Arc::new(MemoryStore::new()),
            position: Arc::new(SharedPosition::default()),
            quorum: Quorum::new().attach("userRoot", QuorumConfig::default()),
        }
    }

    fn agreement(mode: SyncMode) -> AgreementConfig {
        AgreementConfig {
            mode,
            poll_wait_ms: 1000,
            timeout_ms: 2000,
            ..AgreementConfig::new(1, "mem://p1", "dc=example")
        }
    }

    fn consumer(p: &Pair, config: AgreementConfig) -> Arc<Consumer> {
        Consumer::new(
            config,
            2,
            Arc::clone(&p.store) as Arc<dyn LocalStore>,
            Arc::clone(&p.position),
            p.quorum.clone(),
            Arc::clone(&p.connector) as Arc<dyn Connector>,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_refresh_only_round() {
        let p = pair(ProviderConfig::default());
        let c = consumer(&p, agreement(SyncMode::RefreshOnly));
        let outcome = c.step().await;
        assert_eq!(outcome, TaskOutcome::Reschedule(Duration::from_secs(60)));
        assert_eq!(p.store.len(), 4);
        assert_eq!(p.position.snapshot(), p.provider.context());
        assert_eq!(c.state().await, ConsumerState::Steady);
        assert_eq!(p.quorum.links(), vec![(1, Some(1), LinkStatus::Ready)]);

        let status = c.status().await;
        assert_eq!(status.counters.adds, 4);
        assert_eq!(status.counters.full_rounds, 1);

        // nothing changed: the second round applies nothing
        c.step().await;
        let status = c.status().await;
        assert_eq!(status.counters.rounds, 2);
        assert_eq!(status.counters.adds, 4);
        assert_eq!(p.provider.stats().refresh_noop, 1);
    }

    #[tokio::test]
    async fn test_log_replay_applies_modify_and_delete() {
        let p = pair(ProviderConfig::default());
        let c = consumer(&p, agreement(SyncMode::RefreshOnly));
        c.step().await;
        p.provider
            .modify_local(
                &EntryUuid::from_u128(1),
                &[Modification::new(ModOp::Add, "mail", &["p1@x"])],
            )
            .unwrap();
        p.provider.delete_local(&EntryUuid::from_u128(2)).unwrap();
        c.step().await;
        let p1 = p.store.get(&EntryUuid::from_u128(1)).unwrap().unwrap();
        assert!(p1.values("mail").unwrap().contains("p1@x"));
        assert!(p.store.get(&EntryUuid::from_u128(2)).unwrap().is_none());
        assert_eq!(p.position.snapshot(), p.provider.context());
    }

    #[tokio::test]
    async fn test_present_round_reconciles_deletes() {
        let p = pair(ProviderConfig {
            session_log_depth: 0,
            ..Default::default()
        });
        let c = consumer(&p, agreement(SyncMode::RefreshOnly));
        c.step().await;
        p.provider.delete_local(&EntryUuid::from_u128(3)).unwrap();
        c.step().await;
        assert_eq!(p.provider.stats().refresh_present, 1);
        assert!(p.store.get(&EntryUuid::from_u128(3)).unwrap().is_none());
        assert_eq!(p.store.len(), 3);
        assert_eq!(c.status().await.counters.reconciled, 1);
    }

    /// Applies `entry` locally and publishes the provider's position, as a
    /// sibling agreement on the same backend would, before the provider gets
    /// to serve the session.
    struct SiblingFirst {
        provider: Arc<Provider>,
        store: Arc<MemoryStore>,
        position: Arc<SharedPosition>,
        entry: Entry,
    }

    impl SessionAcceptor for SiblingFirst {
        fn accept(self: Arc<Self>, conduit: Conduit) {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                self.store.add(self.entry.clone()).unwrap();
                self.position.publish(9, &self.provider.context()).await;
                Arc::clone(&self.provider).accept(conduit);
            });
        }
    }

    #[tokio::test]
    async fn test_strict_present_round_keeps_entries_applied_by_sibling() {
        let p = pair(ProviderConfig {
            session_log_depth: 0,
            ..Default::default()
        });
        let mut config = agreement(SyncMode::RefreshOnly);
        config.strict = true;
        let first = consumer(&p, config.clone());
        first.step().await;
        assert_eq!(p.store.len(), 4);

        let e = EntryUuid::from_u128(20);
        p.provider.add_local(person(20, "cn=e")).unwrap();
        let sibling = Arc::new(SiblingFirst {
            provider: Arc::clone(&p.provider),
            store: Arc::clone(&p.store),
            position: Arc::clone(&p.position),
            entry: p.provider.backing_store().get(&e).unwrap().unwrap(),
        });
        let connector = Arc::new(LoopbackConnector::new("mem://p1", sibling, 64));
        let c = Consumer::new(
            AgreementConfig {
                rid: 2,
                ..config
            },
            2,
            Arc::clone(&p.store) as Arc<dyn LocalStore>,
            Arc::clone(&p.position),
            p.quorum.clone(),
            connector as Arc<dyn Connector>,
        )
        .unwrap();

        assert_eq!(c.step().await, TaskOutcome::Reschedule(Duration::from_secs(60)));
        assert_eq!(p.provider.stats().refresh_present, 1);
        assert!(p.store.get(&e).unwrap().is_some());
        assert_eq!(p.store.len(), 5);
        let status = c.status().await;
        assert_eq!(status.counters.echoes_skipped, 1);
        assert_eq!(status.counters.reconciled, 0);
    }

    #[tokio::test]
    async fn test_rename_replicated() {
        let p = pair(ProviderConfig::default());
        let c = consumer(&p, agreement(SyncMode::RefreshOnly));
        c.step().await;
        let uuid = EntryUuid::from_u128(1);
        p.provider
            .rename_local(&uuid, &Dn::new("cn=q1,dc=example"), &[])
            .unwrap();
        c.step().await;
        let moved = p.store.get(&uuid).unwrap().unwrap();
        assert_eq!(moved.dn.as_str(), "cn=q1,dc=example");
        assert_eq!(c.status().await.counters.renames, 1);
    }

    #[tokio::test]
    async fn test_older_rename_does_not_undo_local_rename() {
        let p = pair(ProviderConfig::default());
        let c = consumer(&p, agreement(SyncMode::RefreshOnly));
        c.step().await;
        let uuid = EntryUuid::from_u128(1);
        p.provider
            .rename_local(&uuid, &Dn::new("cn=q1,dc=example"), &[])
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let newer = CsnGenerator::new(2).unwrap().next().unwrap();
        p.store
            .rename(&uuid, &Dn::new("cn=r1,dc=example"), &[], &newer)
            .unwrap();

        c.step().await;
        let local = p.store.get(&uuid).unwrap().unwrap();
        assert_eq!(local.dn.as_str(), "cn=r1,dc=example");
        assert_eq!(local.csn, Some(newer));
        assert_eq!(c.status().await.counters.renames, 0);
    }

    #[tokio::test]
    async fn test_ordering_violation_waits_for_retry() {
        let p = pair(ProviderConfig::default());
        let mut config = agreement(SyncMode::RefreshOnly);
        config.strict = true;
        config.retry = RetrySchedule::parse("7 1").unwrap();
        let c = consumer(&p, config);
        let ahead = Csn::from_parts(chrono::Utc::now() + chrono::Duration::days(1), 0, 1, 0).unwrap();
        c.inner.lock().await.remote = SyncCookie::from_csns([ahead]);

        assert_eq!(c.step().await, TaskOutcome::Reschedule(Duration::from_secs(7)));
        assert_eq!(c.state().await, ConsumerState::RetryWait);
        let status = c.status().await;
        assert_eq!(status.counters.ordering_violations, 1);
        assert_eq!(status.counters.retries, 1);

        // the retry reloads from scratch and succeeds
        assert_eq!(c.step().await, TaskOutcome::Reschedule(Duration::from_secs(60)));
        let status = c.status().await;
        assert_eq!(status.counters.full_rounds, 1);
        assert_eq!(p.position.snapshot(), p.provider.context());
    }

    #[tokio::test]
    async fn test_persist_applies_changes() {
        let p = pair(ProviderConfig::default());
        let c = consumer(&p, agreement(SyncMode::RefreshAndPersist));
        assert_eq!(c.step().await, TaskOutcome::Resubmit);
        assert_eq!(c.state().await, ConsumerState::Persisting);

        let csn = p.provider.delete_local(&EntryUuid::from_u128(1)).unwrap();
        assert_eq!(c.step().await, TaskOutcome::Resubmit);
        assert!(p.store.get(&EntryUuid::from_u128(1)).unwrap().is_none());
        assert_eq!(p.position.snapshot().csn_for(1), Some(&csn));
        assert_eq!(c.status().await.counters.deletes, 1);
    }

    #[tokio::test]
    async fn test_orphan_gets_glue_parent_then_adopted() {
        let p = pair(ProviderConfig::default());
        let ou = Entry::new(EntryUuid::from_u128(10), Dn::new("ou=x,dc=example"))
            .with_attr("ou", &["x"]);
        p.provider.add_local(ou).unwrap();
        let child = Entry::new(EntryUuid::from_u128(11), Dn::new("cn=c,ou=x,dc=example"))
            .with_attr("mail", &["c@x"]);
        p.provider.add_local(child).unwrap();
        p.store.add(root()).unwrap();

        let mut config = agreement(SyncMode::RefreshOnly);
        config.filter = Filter::Present("mail".into());
        let c = consumer(&p, config);
        c.step().await;
        let glue = p
            .store
            .get_by_dn(&Dn::new("ou=x,dc=example"))
            .unwrap()
            .unwrap();
        assert!(glue.glue);
        assert!(p.store.get(&EntryUuid::from_u128(11)).unwrap().is_some());

        p.provider
            .modify_local(
                &EntryUuid::from_u128(10),
                &[Modification::new(ModOp::Add, "mail", &["x@x"])],
            )
            .unwrap();
        c.step().await;
        let adopted = p
            .store
            .get_by_dn(&Dn::new("ou=x,dc=example"))
            .unwrap()
            .unwrap();
        assert_eq!(adopted.uuid, EntryUuid::from_u128(10));
        assert!(!adopted.glue);
        assert_eq!(c.status().await.counters.placeholders, 1);
    }

    #[tokio::test]
    async fn test_unreachable_provider_exhausts_retries() {
        let p = pair(ProviderConfig::default());
        p.connector.set_reachable(false);
        let mut config = agreement(SyncMode::RefreshOnly);
        config.retry = RetrySchedule::parse("5 2").unwrap();
        let c = consumer(&p, config);
        assert_eq!(c.step().await, TaskOutcome::Reschedule(Duration::from_secs(5)));
        assert_eq!(c.state().await, ConsumerState::RetryWait);
        assert_eq!(p.quorum.links()[0].2, LinkStatus::Dead);
        assert_eq!(c.step().await, TaskOutcome::Reschedule(Duration::from_secs(5)));
        assert_eq!(c.step().await, TaskOutcome::Remove);
        assert_eq!(c.state().await, ConsumerState::Dead);
        assert!(c.status().await.last_error.is_some());
    }

    #[tokio::test]
    async fn test_refresh_waits_for_admission() {
        let p = pair(ProviderConfig::default());
        let quorum = Quorum::new().attach(
            "userRoot",
            QuorumConfig {
                max_concurrent_refresh: 1,
                ..Default::default()
            },
        );
        let held = quorum.try_begin_refresh(9).unwrap();
        let c = Consumer::new(
            agreement(SyncMode::RefreshOnly),
            2,
            Arc::clone(&p.store) as Arc<dyn LocalStore>,
            Arc::clone(&p.position),
            quorum.clone(),
            Arc::clone(&p.connector) as Arc<dyn Connector>,
        )
        .unwrap();
        assert_eq!(c.step().await, TaskOutcome::Reschedule(ADMISSION_BACKOFF));
        assert_eq!(p.connector.connects(), 0);
        drop(held);
        assert_eq!(c.step().await, TaskOutcome::Reschedule(Duration::from_secs(60)));
        assert_eq!(quorum.refreshes_in_progress(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_releases_provider_session() {
        let p = pair(ProviderConfig::default());
        let c = consumer(&p, agreement(SyncMode::RefreshAndPersist));
        c.step().await;
        tokio::time::timeout(Duration::from_secs(2), async {
            while p.provider.sessions() != 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        c.shutdown().await;
        assert_eq!(c.step().await, TaskOutcome::Remove);
        tokio::time::timeout(Duration::from_secs(2), async {
            while p.provider.sessions() != 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }
}
