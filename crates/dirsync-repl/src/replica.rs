//! One replica: a provider over the local backend plus its outbound
//! agreements, a shared position, a quorum view and the scheduler that
//! drives the consumers.

use crate::config::{AgreementConfig, ReplicaConfig};
use crate::consumer::Consumer;
use crate::error::{ReplError, Result};
use crate::position::SharedPosition;
use crate::provider::Provider;
use crate::quorum::{Quorum, QuorumHandle};
use crate::scheduler::{Scheduler, WorkerPool};
use crate::status::ReplicaStatus;
use crate::store::LocalStore;
use crate::transport::Connector;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// A running replica.
pub struct Replica {
    config: ReplicaConfig,
    provider: Arc<Provider>,
    position: Arc<SharedPosition>,
    quorum: QuorumHandle,
    scheduler: Arc<Scheduler>,
    pool: Arc<WorkerPool>,
    consumers: Vec<Arc<Consumer>>,
    cancel: CancellationToken,
    runner: Option<JoinHandle<()>>,
}

impl Replica {
    /// Open the provider over `store` and attach this backend to `quorum`.
    pub fn open(config: ReplicaConfig, store: Arc<dyn LocalStore>, quorum: &Arc<Quorum>) -> Result<Self> {
        config.validate()?;
        let pool = WorkerPool::new(config.pool);
        let provider = Provider::open(config.sid, config.provider.clone(), store, Arc::clone(&pool))?;
        let position = Arc::new(SharedPosition::new(provider.context()));
        let handle = quorum.attach(&config.backend, config.quorum.clone());
        info!(sid = config.sid, backend = %config.backend, suffix = %config.provider.suffix, "replica opened");
        Ok(Self {
            config,
            provider,
            position,
            quorum: handle,
            scheduler: Scheduler::new(),
            pool,
            consumers: Vec::new(),
            cancel: CancellationToken::new(),
            runner: None,
        })
    }

    /// Local replica id.
    pub fn sid(&self) -> u16 {
        self.config.sid
    }

    /// The provider (also the store consumers write through).
    pub fn provider(&self) -> &Arc<Provider> {
        &self.provider
    }

    /// Shared consumer position.
    pub fn position(&self) -> &Arc<SharedPosition> {
        &self.position
    }

    /// Quorum view of this backend.
    pub fn quorum(&self) -> &QuorumHandle {
        &self.quorum
    }

    /// Task scheduler.
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Outbound agreements.
    pub fn consumers(&self) -> &[Arc<Consumer>] {
        &self.consumers
    }

    /// Add an agreement pulling through `connector` and schedule it now.
    pub fn add_agreement(
        &mut self,
        agreement: AgreementConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Arc<Consumer>> {
        if self.consumers.iter().any(|c| c.rid() == agreement.rid) {
            return Err(ReplError::config(format!("duplicate rid {:03}", agreement.rid)));
        }
        if !agreement.base.is_within(self.provider.suffix()) {
            return Err(ReplError::config(format!(
                "rid {:03}: base {} is outside suffix {}",
                agreement.rid,
                agreement.base,
                self.provider.suffix()
            )));
        }
        let consumer = Consumer::new(
            agreement,
            self.config.sid,
            Arc::clone(&self.provider) as Arc<dyn LocalStore>,
            Arc::clone(&self.position),
            self.quorum.clone(),
            connector,
        )?;
        self.scheduler.insert(consumer.clone(), Duration::ZERO);
        self.consumers.push(Arc::clone(&consumer));
        Ok(consumer)
    }

    /// Add every configured agreement, resolving endpoints with `resolve`.
    pub fn add_configured<F>(&mut self, resolve: F) -> Result<usize>
    where
        F: Fn(&str) -> Option<Arc<dyn Connector>>,
    {
        let agreements = self.config.agreements.clone();
        for agreement in &agreements {
            let connector = resolve(&agreement.provider).ok_or_else(|| {
                ReplError::config(format!(
                    "rid {:03}: unknown provider {}",
                    agreement.rid, agreement.provider
                ))
            })?;
            self.add_agreement(agreement.clone(), connector)?;
        }
        Ok(agreements.len())
    }

    /// Start driving the agreements.
    pub fn start(&mut self) {
        if self.runner.is_some() {
            return;
        }
        let scheduler = Arc::clone(&self.scheduler);
        self.runner = Some(tokio::spawn(scheduler.run(
            Arc::clone(&self.pool),
            self.cancel.clone(),
        )));
    }

    /// Status snapshot.
    pub async fn status(&self) -> ReplicaStatus {
        ReplicaStatus::collect(
            self.config.sid,
            &self.position,
            &self.quorum,
            &self.consumers,
            Some(&self.provider),
        )
        .await
    }

    /// Stop the scheduler, the agreements and the provider.
    pub async fn shutdown(mut self) -> Result<()> {
        self.cancel.cancel();
        for consumer in &self.consumers {
            consumer.shutdown().await;
            self.scheduler.remove(&consumer.config().task_name());
        }
        if let Some(runner) = self.runner.take() {
            let _ = runner.await;
        }
        self.provider.shutdown()?;
        info!(sid = self.config.sid, "replica stopped");
        Ok(())
    }
}
