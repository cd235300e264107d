//! Sync provider: an overlay on the backend store.
//!
//! Every write, local or replicated, passes through [`Provider`]. It keeps
//! the context cookie and the session log current, fans changes out to live
//! persistent searches and checkpoints the context cookie into the store.
//! Consumers attach through [`SessionAcceptor::accept`].

use crate::checkpoint::CheckpointPolicy;
use crate::config::ProviderConfig;
use crate::cookie::SyncCookie;
use crate::csn::{Csn, CsnGenerator, Sid};
use crate::entry::{Dn, Entry, EntryUuid, Modification, Scope};
use crate::error::{ApplyError, ErrorClass, ReplError, Result};
use crate::position::now_us;
use crate::protocol::{
    self, ConsumerMessage, EntryState, ProviderMessage, RefusalKind, SyncDone, SyncInfo,
    SyncMode, SyncRequest, SyncState,
};
use crate::psearch::{
    Notification, NotifyKind, Pending, PersistentSearch, Registration, SessionId,
    SessionRegistry, SessionState,
};
use crate::scheduler::WorkerPool;
use crate::session_log::{LogEntry, SessionLog};
use crate::store::{AppliedChange, ChangeKind, LocalStore};
use crate::transport::{Conduit, SessionAcceptor};
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How a refresh request was served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshKind {
    /// Every in-scope entry was sent.
    Full,
    /// The consumer was already current.
    Noop,
    /// Replayed from the session log.
    Log,
    /// Changed entries sent, unchanged ones named as present.
    Present,
}

#[derive(Debug, Default)]
struct ProviderCounters {
    local_writes: AtomicU64,
    replicated_writes: AtomicU64,
    notifications: AtomicU64,
    delivered: AtomicU64,
    echo_suppressed: AtomicU64,
    sessions_opened: AtomicU64,
    sessions_released: AtomicU64,
    slow_sessions: AtomicU64,
    refresh_full: AtomicU64,
    refresh_noop: AtomicU64,
    refresh_log: AtomicU64,
    refresh_present: AtomicU64,
    refused: AtomicU64,
    checkpoints: AtomicU64,
}

/// Snapshot of provider counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProviderStats {
    /// Writes that minted a local CSN.
    pub local_writes: u64,
    /// Writes carrying a CSN from elsewhere.
    pub replicated_writes: u64,
    /// Items queued to persistent searches.
    pub notifications: u64,
    /// Items delivered to consumers.
    pub delivered: u64,
    /// Changes not sent back to the consumer they came from.
    pub echo_suppressed: u64,
    /// Persistent searches registered.
    pub sessions_opened: u64,
    /// Persistent searches released.
    pub sessions_released: u64,
    /// Sessions dropped because their queue overflowed.
    pub slow_sessions: u64,
    /// Full refreshes served.
    pub refresh_full: u64,
    /// Refreshes that found the consumer current.
    pub refresh_noop: u64,
    /// Refreshes served from the session log.
    pub refresh_log: u64,
    /// Present-phase refreshes served.
    pub refresh_present: u64,
    /// Requests refused.
    pub refused: u64,
    /// Context checkpoints written.
    pub checkpoints: u64,
    /// Live persistent searches.
    pub live_sessions: usize,
    /// Entries held in the session log.
    pub session_log_len: usize,
    /// Current context cookie.
    pub context: String,
}

type DrainFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Held while one write owns its target entry.
struct TargetGuard<'a> {
    provider: &'a Provider,
    uuid: EntryUuid,
}

impl Drop for TargetGuard<'_> {
    fn drop(&mut self) {
        relock(&self.provider.targets).remove(&self.uuid);
        self.provider.target_released.notify_all();
    }
}

fn relock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// The provider overlay for one backend.
pub struct Provider {
    me: Weak<Provider>,
    sid: Sid,
    config: ProviderConfig,
    store: Arc<dyn LocalStore>,
    pool: Arc<WorkerPool>,
    csn_gen: CsnGenerator,
    context: Mutex<SyncCookie>,
    log: Mutex<SessionLog>,
    checkpoint: Mutex<CheckpointPolicy>,
    targets: Mutex<HashSet<EntryUuid>>,
    target_released: Condvar,
    apply_lock: Mutex<()>,
    registry: SessionRegistry,
    counters: ProviderCounters,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("sid", &self.sid)
            .field("suffix", &self.config.suffix)
            .field("sessions", &self.registry.len())
            .finish()
    }
}

impl Provider {
    /// Attach to `store`, recovering the context cookie from the stored
    /// checkpoint or, when there is none, from the entries' CSNs.
    pub fn open(
        sid: Sid,
        config: ProviderConfig,
        store: Arc<dyn LocalStore>,
        pool: Arc<WorkerPool>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let csn_gen = CsnGenerator::new(sid)?;
        let context = match store.context_cookie(&config.suffix)? {
            Some(cookie) => {
                info!(suffix = %config.suffix, %cookie, "context cookie loaded from checkpoint");
                cookie
            }
            None => {
                let mut cookie = SyncCookie::new();
                let entries = store.search(&config.suffix, Scope::Subtree)?;
                for csn in entries.iter().filter_map(|e| e.csn.as_ref()) {
                    cookie.merge_csn(csn);
                }
                info!(
                    suffix = %config.suffix,
                    entries = entries.len(),
                    %cookie,
                    "context cookie rebuilt from entries"
                );
                cookie
            }
        };
        if let Some(own) = context.csn_for(sid) {
            csn_gen.observe(own);
        }
        let log = SessionLog::new(config.session_log_depth, context.clone());
        let checkpoint = CheckpointPolicy::new(config.checkpoint_ops, config.checkpoint_interval());
        Ok(Arc::new_cyclic(|me| Provider {
            me: me.clone(),
            sid,
            config,
            store,
            pool,
            csn_gen,
            context: Mutex::new(context),
            log: Mutex::new(log),
            checkpoint: Mutex::new(checkpoint),
            targets: Mutex::new(HashSet::new()),
            target_released: Condvar::new(),
            apply_lock: Mutex::new(()),
            registry: SessionRegistry::new(),
            counters: ProviderCounters::default(),
            shutdown: CancellationToken::new(),
        }))
    }

    /// Local replica id.
    pub fn sid(&self) -> Sid {
        self.sid
    }

    /// Context root.
    pub fn suffix(&self) -> &Dn {
        &self.config.suffix
    }

    /// The backing store (bypasses the overlay).
    pub fn backing_store(&self) -> &Arc<dyn LocalStore> {
        &self.store
    }

    /// Current context cookie.
    pub fn context(&self) -> SyncCookie {
        relock(&self.context).clone()
    }

    /// Live persistent searches.
    pub fn sessions(&self) -> usize {
        self.registry.len()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> ProviderStats {
        let c = &self.counters;
        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);
        ProviderStats {
            local_writes: load(&c.local_writes),
            replicated_writes: load(&c.replicated_writes),
            notifications: load(&c.notifications),
            delivered: load(&c.delivered),
            echo_suppressed: load(&c.echo_suppressed),
            sessions_opened: load(&c.sessions_opened),
            sessions_released: load(&c.sessions_released),
            slow_sessions: load(&c.slow_sessions),
            refresh_full: load(&c.refresh_full),
            refresh_noop: load(&c.refresh_noop),
            refresh_log: load(&c.refresh_log),
            refresh_present: load(&c.refresh_present),
            refused: load(&c.refused),
            checkpoints: load(&c.checkpoints),
            live_sessions: self.registry.len(),
            session_log_len: relock(&self.log).len(),
            context: self.context().render(),
        }
    }

    /// Stop serving: release every session and write a final checkpoint.
    pub fn shutdown(&self) -> Result<()> {
        self.shutdown.cancel();
        let released = self.registry.clear();
        self.counters
            .sessions_released
            .fetch_add(released as u64, Ordering::Relaxed);
        let context = self.context();
        self.store.store_context_cookie(&self.config.suffix, &context)?;
        relock(&self.checkpoint).mark_written(&context, now_us());
        self.counters.checkpoints.fetch_add(1, Ordering::Relaxed);
        info!(suffix = %self.config.suffix, %context, released, "provider stopped");
        Ok(())
    }

    // --- write path -------------------------------------------------------

    fn lock_target(&self, uuid: EntryUuid) -> TargetGuard<'_> {
        let mut busy = relock(&self.targets);
        while busy.contains(&uuid) {
            busy = self
                .target_released
                .wait(busy)
                .unwrap_or_else(|p| p.into_inner());
        }
        busy.insert(uuid);
        TargetGuard {
            provider: self,
            uuid,
        }
    }

    fn write<F>(
        &self,
        uuid: EntryUuid,
        carried: Option<Csn>,
        kind: ChangeKind,
        apply: F,
    ) -> std::result::Result<(Csn, Option<Entry>), ApplyError>
    where
        F: FnOnce(&Csn) -> std::result::Result<Option<Entry>, ApplyError>,
    {
        let _target = self.lock_target(uuid);
        let before = self.store.get(&uuid)?;
        let local = carried.is_none();
        let (csn, after) = {
            let _apply = relock(&self.apply_lock);
            let csn = match carried {
                Some(csn) => {
                    self.csn_gen.observe(&csn);
                    csn
                }
                None => self.csn_gen.next().map_err(|e| ApplyError::Unavailable {
                    msg: e.to_string(),
                })?,
            };
            let after = apply(&csn)?;
            relock(&self.context).merge_csn(&csn);
            relock(&self.log).append(LogEntry {
                uuid,
                csn: csn.clone(),
                kind,
            });
            (csn, after)
        };
        let counter = if local {
            &self.counters.local_writes
        } else {
            &self.counters.replicated_writes
        };
        counter.fetch_add(1, Ordering::Relaxed);
        debug!(%uuid, %csn, ?kind, local, "write committed");

        if let Some(dn) = after.as_ref().or(before.as_ref()).map(|e| e.dn.clone()) {
            self.notify(uuid, &dn, &csn, before.as_ref(), after.as_ref());
            self.maybe_checkpoint(&dn);
        }
        Ok((csn, after))
    }

    fn notify(
        &self,
        uuid: EntryUuid,
        dn: &Dn,
        csn: &Csn,
        before: Option<&Entry>,
        after: Option<&Entry>,
    ) {
        let mut shared: [Option<Arc<Notification>>; 3] = [None, None, None];
        for session in self.registry.snapshot() {
            if session.state() == SessionState::Dead {
                continue;
            }
            if session.is_echo(csn) {
                self.counters.echo_suppressed.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            let was = before.is_some_and(|e| session.matches(e));
            let is = after.is_some_and(|e| session.matches(e));
            let kind = match (was, is) {
                (true, true) => Some(NotifyKind::Modify),
                (false, true) => Some(NotifyKind::Add),
                (true, false) => Some(NotifyKind::Delete),
                (false, false) => None,
            };
            let item = match kind {
                Some(kind) => {
                    let slot = &mut shared[kind as usize];
                    let note = slot.get_or_insert_with(|| {
                        Arc::new(Notification {
                            kind,
                            uuid,
                            dn: dn.clone(),
                            csn: csn.clone(),
                            entry: if kind == NotifyKind::Delete {
                                None
                            } else {
                                after.cloned()
                            },
                        })
                    });
                    Pending::Change(Arc::clone(note))
                }
                None => Pending::Cookie(csn.clone()),
            };
            match session.enqueue(item) {
                None => continue,
                Some(len) if len > self.config.max_pending => {
                    warn!(session = %session.id(), pending = len, "session fell too far behind, dropping");
                    self.counters.slow_sessions.fetch_add(1, Ordering::Relaxed);
                    self.release(session.id());
                    continue;
                }
                Some(_) => {
                    self.counters.notifications.fetch_add(1, Ordering::Relaxed);
                }
            }
            if session.state() == SessionState::Detached {
                self.schedule_drain(&session);
            }
        }
    }

    fn maybe_checkpoint(&self, target: &Dn) {
        let due = relock(&self.checkpoint).record_write(target == &self.config.suffix);
        if !due {
            return;
        }
        let context = self.context();
        match self.store.store_context_cookie(&self.config.suffix, &context) {
            Ok(()) => {
                relock(&self.checkpoint).mark_written(&context, now_us());
                self.counters.checkpoints.fetch_add(1, Ordering::Relaxed);
                debug!(suffix = %self.config.suffix, %context, "context checkpoint written");
            }
            Err(e) => warn!(suffix = %self.config.suffix, error = %e, "context checkpoint failed"),
        }
    }

    /// Client add: mints a CSN.
    pub fn add_local(&self, entry: Entry) -> std::result::Result<Csn, ApplyError> {
        self.add_with(entry, None)
    }

    /// Client modify: mints a CSN.
    pub fn modify_local(
        &self,
        uuid: &EntryUuid,
        mods: &[Modification],
    ) -> std::result::Result<Csn, ApplyError> {
        let store = &self.store;
        self.write(*uuid, None, ChangeKind::Modify, |csn| {
            store.modify(uuid, mods, csn).map(Some)
        })
        .map(|(csn, _)| csn)
    }

    /// Client delete: mints a CSN.
    pub fn delete_local(&self, uuid: &EntryUuid) -> std::result::Result<Csn, ApplyError> {
        let store = &self.store;
        self.write(*uuid, None, ChangeKind::Delete, |csn| {
            store.delete(uuid, csn).map(|_| None)
        })
        .map(|(csn, _)| csn)
    }

    /// Client rename: mints a CSN.
    pub fn rename_local(
        &self,
        uuid: &EntryUuid,
        new_dn: &Dn,
        mods: &[Modification],
    ) -> std::result::Result<Csn, ApplyError> {
        let store = &self.store;
        self.write(*uuid, None, ChangeKind::Rename, |csn| {
            store.rename(uuid, new_dn, mods, csn).map(Some)
        })
        .map(|(csn, _)| csn)
    }

    fn add_with(&self, mut entry: Entry, carried: Option<Csn>) -> std::result::Result<Csn, ApplyError> {
        let uuid = entry.uuid;
        let store = &self.store;
        self.write(uuid, carried, ChangeKind::Add, move |csn| {
            entry.csn = Some(csn.clone());
            store.add(entry.clone())?;
            Ok(Some(entry))
        })
        .map(|(csn, _)| csn)
    }

    // --- delivery ---------------------------------------------------------

    fn release(&self, id: SessionId) {
        if self.registry.remove(id).is_some() {
            self.counters.sessions_released.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn schedule_drain(&self, session: &Arc<PersistentSearch>) {
        if !session.try_start_drain() {
            return;
        }
        let (Some(me), Ok(_)) = (self.me.upgrade(), tokio::runtime::Handle::try_current()) else {
            session.finish_drain();
            return;
        };
        self.pool.submit(me.drain_task(Arc::clone(session)));
    }

    fn session_cookie(&self, session: &PersistentSearch, cookie: SyncCookie) -> String {
        let cookie = cookie.with_sid(self.sid);
        match session.rid {
            Some(rid) => cookie.with_rid(rid).render(),
            None => cookie.render(),
        }
    }

    fn render(&self, session: &PersistentSearch, item: &Pending) -> ProviderMessage {
        let cookie = self.session_cookie(session, SyncCookie::from_csns([item.csn().clone()]));
        match item {
            Pending::Change(note) => ProviderMessage::State(SyncState {
                state: match note.kind {
                    NotifyKind::Add => EntryState::Add,
                    NotifyKind::Modify => EntryState::Modify,
                    NotifyKind::Delete => EntryState::Delete,
                },
                uuid: note.uuid,
                entry: note.entry.clone(),
                cookie: Some(cookie),
            }),
            Pending::Cookie(_) => ProviderMessage::Info(SyncInfo::NewCookie { cookie }),
        }
    }

    async fn send_batch(&self, session: &PersistentSearch, batch: Vec<Pending>) -> Result<()> {
        let n = batch.len();
        for item in batch {
            session.conduit().send(&self.render(session, &item)).await?;
        }
        session.mark_delivered(n);
        self.counters.delivered.fetch_add(n as u64, Ordering::Relaxed);
        Ok(())
    }

    fn drain_task(self: Arc<Self>, session: Arc<PersistentSearch>) -> DrainFuture {
        Box::pin(async move {
            let batch = session.take_batch(self.config.drain_batch);
            if let Err(e) = self.send_batch(&session, batch).await {
                debug!(session = %session.id(), error = %e, "delivery failed");
                session.finish_drain();
                self.release(session.id());
                return;
            }
            if session.pending() > 0 {
                let pool = Arc::clone(&self.pool);
                pool.resubmit(self.drain_task(session));
                return;
            }
            session.finish_drain();
            if session.pending() > 0 && session.state() == SessionState::Detached {
                self.schedule_drain(&session);
            }
        })
    }

    // --- serving ----------------------------------------------------------

    async fn refuse(&self, conduit: &Conduit, err: &ReplError) {
        let kind = match err.class() {
            _ if matches!(err, ReplError::Shutdown) => RefusalKind::Unavailable,
            ErrorClass::Protocol | ErrorClass::Ordering => RefusalKind::ProtocolError,
            ErrorClass::Transient => RefusalKind::Busy,
            ErrorClass::Conflict | ErrorClass::Fatal => RefusalKind::Unavailable,
        };
        self.counters.refused.fetch_add(1, Ordering::Relaxed);
        warn!(session = %conduit.label(), error = %err, ?kind, "sync request refused");
        let _ = conduit
            .send(&ProviderMessage::Refused {
                kind,
                msg: err.to_string(),
            })
            .await;
    }

    async fn serve(self: Arc<Self>, conduit: Conduit) {
        let first = tokio::select! {
            _ = self.shutdown.cancelled() => return,
            m = conduit.recv::<ConsumerMessage>(self.config.idle_timeout()) => m,
        };
        let request = match first {
            Ok(Some(ConsumerMessage::Request(req))) => req,
            Ok(Some(ConsumerMessage::Abandon)) | Ok(None) => return,
            Err(e) => {
                self.refuse(&conduit, &e).await;
                return;
            }
        };
        match self.handle_request(request, &conduit).await {
            Ok(Some(session)) => self.persist(session).await,
            Ok(None) => {}
            Err(e) => self.refuse(&conduit, &e).await,
        }
    }

    async fn handle_request(
        &self,
        req: SyncRequest,
        conduit: &Conduit,
    ) -> Result<Option<Arc<PersistentSearch>>> {
        if self.shutdown.is_cancelled() {
            return Err(ReplError::Shutdown);
        }
        let cookie = protocol::parse_cookie(req.cookie.as_deref())?.unwrap_or_default();
        if !req.base.is_within(&self.config.suffix) {
            return Err(ReplError::protocol(format!(
                "base {} is outside context {}",
                req.base, self.config.suffix
            )));
        }
        let session = (req.mode == SyncMode::RefreshAndPersist).then(|| {
            self.counters.sessions_opened.fetch_add(1, Ordering::Relaxed);
            self.registry.register(
                Registration {
                    rid: cookie.rid,
                    consumer_sid: cookie.sid,
                    base: req.base.clone(),
                    scope: req.scope,
                    filter: req.filter.clone(),
                },
                conduit.clone(),
            )
        });
        let context = self.context();
        let outcome = self.send_refresh(&req, &cookie, &context, conduit).await;
        let (kind, refresh_deletes) = match outcome {
            Ok(done) => done,
            Err(e) => {
                if let Some(s) = &session {
                    self.release(s.id());
                }
                return Err(e);
            }
        };
        let mut final_cookie = context.with_sid(self.sid);
        if let Some(rid) = cookie.rid {
            final_cookie = final_cookie.with_rid(rid);
        }
        let final_cookie = Some(final_cookie.render());
        let end = match req.mode {
            SyncMode::RefreshOnly => ProviderMessage::Done(SyncDone {
                cookie: final_cookie,
                refresh_deletes,
            }),
            SyncMode::RefreshAndPersist if refresh_deletes => {
                ProviderMessage::Info(SyncInfo::RefreshDelete {
                    cookie: final_cookie,
                    done: true,
                })
            }
            SyncMode::RefreshAndPersist => ProviderMessage::Info(SyncInfo::RefreshPresent {
                cookie: final_cookie,
                done: true,
            }),
        };
        if let Err(e) = conduit.send(&end).await {
            if let Some(s) = &session {
                self.release(s.id());
            }
            return Err(e);
        }
        info!(
            session = %conduit.label(),
            rid = ?cookie.rid,
            ?kind,
            refresh_deletes,
            mode = ?req.mode,
            "refresh served"
        );
        Ok(session)
    }

    fn in_view(req: &SyncRequest, entry: &Entry) -> bool {
        req.scope.contains(&req.base, &entry.dn) && (entry.glue || req.filter.matches(entry))
    }

    async fn send_idset(
        &self,
        conduit: &Conduit,
        uuids: Vec<EntryUuid>,
        refresh_deletes: bool,
    ) -> Result<()> {
        for chunk in uuids.chunks(self.config.idset_batch) {
            conduit
                .send(&ProviderMessage::Info(SyncInfo::IdSet {
                    cookie: None,
                    refresh_deletes,
                    uuids: chunk.to_vec(),
                }))
                .await?;
        }
        Ok(())
    }

    async fn send_add(&self, conduit: &Conduit, entry: Entry) -> Result<()> {
        conduit
            .send(&ProviderMessage::State(SyncState {
                state: EntryState::Add,
                uuid: entry.uuid,
                entry: Some(entry),
                cookie: None,
            }))
            .await
    }

    async fn send_refresh(
        &self,
        req: &SyncRequest,
        cookie: &SyncCookie,
        context: &SyncCookie,
        conduit: &Conduit,
    ) -> Result<(RefreshKind, bool)> {
        if cookie.is_empty() || req.reload_hint {
            self.counters.refresh_full.fetch_add(1, Ordering::Relaxed);
            for entry in self.store.search(&req.base, req.scope)? {
                if Self::in_view(req, &entry) {
                    self.send_add(conduit, entry).await?;
                }
            }
            return Ok((RefreshKind::Full, false));
        }
        if cookie.dominates(context) {
            self.counters.refresh_noop.fetch_add(1, Ordering::Relaxed);
            return Ok((RefreshKind::Noop, true));
        }
        let replay = {
            let log = relock(&self.log);
            log.covers(cookie).then(|| log.replay(cookie))
        };
        if let Some(replay) = replay {
            self.counters.refresh_log.fetch_add(1, Ordering::Relaxed);
            let mut deleted = replay.deleted;
            for uuid in replay.changed {
                match self.store.get(&uuid)? {
                    Some(entry) if Self::in_view(req, &entry) => self.send_add(conduit, entry).await?,
                    _ => deleted.push(uuid),
                }
            }
            self.send_idset(conduit, deleted, true).await?;
            return Ok((RefreshKind::Log, true));
        }
        self.counters.refresh_present.fetch_add(1, Ordering::Relaxed);
        let mut present = Vec::new();
        for entry in self.store.search(&req.base, req.scope)? {
            if !Self::in_view(req, &entry) {
                continue;
            }
            let changed = entry.csn.as_ref().map_or(true, |csn| !cookie.covers(csn));
            if changed {
                self.send_add(conduit, entry).await?;
            } else {
                present.push(entry.uuid);
            }
        }
        self.send_idset(conduit, present, false).await?;
        Ok((RefreshKind::Present, false))
    }

    async fn persist(&self, session: Arc<PersistentSearch>) {
        let conduit = session.conduit().clone();
        session.transition(SessionState::Steady);
        loop {
            let batch = session.take_batch(self.config.drain_batch);
            if batch.is_empty() {
                break;
            }
            if let Err(e) = self.send_batch(&session, batch).await {
                debug!(session = %session.id(), error = %e, "backlog delivery failed");
                self.release(session.id());
                return;
            }
        }
        session.transition(SessionState::Detached);
        if session.pending() > 0 {
            self.schedule_drain(&session);
        }
        loop {
            let msg = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                m = conduit.recv::<ConsumerMessage>(self.config.idle_timeout()) => m,
            };
            match msg {
                Ok(Some(ConsumerMessage::Abandon)) => {
                    debug!(session = %session.id(), "abandoned by consumer");
                    break;
                }
                Ok(None) => break,
                Err(ReplError::Timeout { .. }) => {
                    if session.state() == SessionState::Dead {
                        break;
                    }
                }
                Ok(Some(ConsumerMessage::Request(_))) | Err(_) => {
                    warn!(session = %session.id(), "unexpected message on persistent session");
                    break;
                }
            }
        }
        self.release(session.id());
    }
}

impl SessionAcceptor for Provider {
    fn accept(self: Arc<Self>, conduit: Conduit) {
        tokio::spawn(self.serve(conduit));
    }
}

/// Replicated writes: the CSN travels with the change.
impl LocalStore for Provider {
    fn add(&self, entry: Entry) -> std::result::Result<(), ApplyError> {
        let carried = entry.csn.clone();
        self.add_with(entry, carried).map(|_| ())
    }

    fn modify(
        &self,
        uuid: &EntryUuid,
        mods: &[Modification],
        csn: &Csn,
    ) -> std::result::Result<Entry, ApplyError> {
        let store = &self.store;
        let (_, after) = self.write(*uuid, Some(csn.clone()), ChangeKind::Modify, |csn| {
            store.modify(uuid, mods, csn).map(Some)
        })?;
        after.ok_or_else(|| ApplyError::NoSuchObject {
            target: uuid.to_string(),
        })
    }

    fn delete(&self, uuid: &EntryUuid, csn: &Csn) -> std::result::Result<Entry, ApplyError> {
        let store = &self.store;
        let mut removed = None;
        self.write(*uuid, Some(csn.clone()), ChangeKind::Delete, |csn| {
            removed = Some(store.delete(uuid, csn)?);
            Ok(None)
        })?;
        removed.ok_or_else(|| ApplyError::NoSuchObject {
            target: uuid.to_string(),
        })
    }

    fn rename(
        &self,
        uuid: &EntryUuid,
        new_dn: &Dn,
        mods: &[Modification],
        csn: &Csn,
    ) -> std::result::Result<Entry, ApplyError> {
        let store = &self.store;
        let (_, after) = self.write(*uuid, Some(csn.clone()), ChangeKind::Rename, |csn| {
            store.rename(uuid, new_dn, mods, csn).map(Some)
        })?;
        after.ok_or_else(|| ApplyError::NoSuchObject {
            target: uuid.to_string(),
        })
    }

    fn adopt(&self, placeholder: &EntryUuid, entry: Entry) -> std::result::Result<(), ApplyError> {
        let store = &self.store;
        let carried = entry.csn.clone();
        self.write(entry.uuid, carried, ChangeKind::Add, move |csn| {
            let mut entry = entry;
            entry.csn = Some(csn.clone());
            store.adopt(placeholder, entry.clone())?;
            Ok(Some(entry))
        })
        .map(|_| ())
    }

    fn get(&self, uuid: &EntryUuid) -> std::result::Result<Option<Entry>, ApplyError> {
        self.store.get(uuid)
    }

    fn get_by_dn(&self, dn: &Dn) -> std::result::Result<Option<Entry>, ApplyError> {
        self.store.get_by_dn(dn)
    }

    fn search(&self, base: &Dn, scope: Scope) -> std::result::Result<Vec<Entry>, ApplyError> {
        self.store.search(base, scope)
    }

    fn has_children(&self, dn: &Dn) -> std::result::Result<bool, ApplyError> {
        self.store.has_children(dn)
    }

    fn changes_since(
        &self,
        uuid: &EntryUuid,
        csn: &Csn,
    ) -> std::result::Result<Vec<AppliedChange>, ApplyError> {
        self.store.changes_since(uuid, csn)
    }

    fn context_cookie(&self, suffix: &Dn) -> std::result::Result<Option<SyncCookie>, ApplyError> {
        self.store.context_cookie(suffix)
    }

    fn store_context_cookie(
        &self,
        suffix: &Dn,
        cookie: &SyncCookie,
    ) -> std::result::Result<(), ApplyError> {
        self.store.store_context_cookie(suffix, cookie)
    }
}
