//! Replica configuration, loaded from JSON.

use crate::cookie::MAX_RID;
use crate::csn::{Sid, MAX_SID};
use crate::entry::{Dn, Filter, Scope};
use crate::error::{ReplError, Result};
use crate::protocol::SyncMode;
use crate::quorum::QuorumConfig;
use crate::retry::RetrySchedule;
use crate::scheduler::PoolConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Provider-side settings for one backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Context root served by the provider.
    pub suffix: Dn,
    /// Session log depth (0 disables log replay).
    pub session_log_depth: usize,
    /// Checkpoint the context cookie after this many writes (0 = never).
    pub checkpoint_ops: u64,
    /// Checkpoint the context cookie after this many seconds (0 = never).
    pub checkpoint_interval_secs: u64,
    /// Notifications sent per run of a draining task.
    pub drain_batch: usize,
    /// Queue length at which a slow session is dropped.
    pub max_pending: usize,
    /// Uuids per id-set message.
    pub idset_batch: usize,
    /// How long a session may stay silent before the provider drops it.
    pub idle_timeout_secs: u64,
    /// Frames buffered per session direction.
    pub channel_capacity: usize,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            suffix: Dn::new("dc=example,dc=com"),
            session_log_depth: 1000,
            checkpoint_ops: 100,
            checkpoint_interval_secs: 300,
            drain_batch: 64,
            max_pending: 10_000,
            idset_batch: 256,
            idle_timeout_secs: 3600,
            channel_capacity: 256,
        }
    }
}

impl ProviderConfig {
    /// Checkpoint interval as a duration.
    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval_secs)
    }

    /// Session idle timeout as a duration.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Check batch and queue sizes.
    pub fn validate(&self) -> Result<()> {
        if self.drain_batch == 0 || self.idset_batch == 0 || self.channel_capacity == 0 {
            return Err(ReplError::config(
                "drain_batch, idset_batch and channel_capacity must be positive",
            ));
        }
        if self.max_pending < self.drain_batch {
            return Err(ReplError::config("max_pending must be at least drain_batch"));
        }
        Ok(())
    }
}

/// Consumer-side settings for one replication agreement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgreementConfig {
    /// Agreement id (1..=999).
    pub rid: u16,
    /// Provider endpoint.
    pub provider: String,
    /// Replicated subtree.
    pub base: Dn,
    /// Scope below `base`.
    pub scope: Scope,
    /// Entry filter.
    pub filter: Filter,
    /// Session mode.
    pub mode: SyncMode,
    /// Seconds between refresh-only rounds.
    pub interval_secs: u64,
    /// Retry schedule after failures.
    pub retry: RetrySchedule,
    /// Skip deliveries already covered by the committed position.
    pub strict: bool,
    /// Treat a present delivery ahead of the local position as a harmless echo.
    pub present_ahead_is_echo: bool,
    /// Per round-trip timeout during refresh.
    pub timeout_ms: u64,
    /// How long one persist poll waits for the first message.
    pub poll_wait_ms: u64,
    /// Messages applied per persist poll.
    pub persist_batch: usize,
}

impl Default for AgreementConfig {
    fn default() -> Self {
        Self {
            rid: 1,
            provider: String::new(),
            base: Dn::new("dc=example,dc=com"),
            scope: Scope::Subtree,
            filter: Filter::All,
            mode: SyncMode::RefreshAndPersist,
            interval_secs: 60,
            retry: RetrySchedule::default(),
            strict: false,
            present_ahead_is_echo: true,
            timeout_ms: 30_000,
            poll_wait_ms: 500,
            persist_batch: 128,
        }
    }
}

impl AgreementConfig {
    /// Agreement for `rid` pulling `base` from `provider`, other fields default.
    pub fn new(rid: u16, provider: &str, base: &str) -> Self {
        Self {
            rid,
            provider: provider.to_string(),
            base: Dn::new(base),
            ..Default::default()
        }
    }

    /// Round-trip timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Persist poll wait.
    pub fn poll_wait(&self) -> Duration {
        Duration::from_millis(self.poll_wait_ms)
    }

    /// Refresh-only interval.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Scheduler task name.
    pub fn task_name(&self) -> String {
        format!("rid={:03}", self.rid)
    }

    /// Check field ranges.
    pub fn validate(&self) -> Result<()> {
        if self.rid == 0 || self.rid > MAX_RID {
            return Err(ReplError::config(format!("rid {} out of range 1..={}", self.rid, MAX_RID)));
        }
        if self.provider.is_empty() {
            return Err(ReplError::config(format!("rid {:03}: provider is empty", self.rid)));
        }
        if self.timeout_ms == 0 || self.persist_batch == 0 {
            return Err(ReplError::config(format!(
                "rid {:03}: timeout_ms and persist_batch must be positive",
                self.rid
            )));
        }
        if self.mode == SyncMode::RefreshOnly && self.interval_secs == 0 {
            return Err(ReplError::config(format!(
                "rid {:03}: refresh-only needs an interval",
                self.rid
            )));
        }
        Ok(())
    }
}

/// Everything one replica needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicaConfig {
    /// Local replica id.
    pub sid: Sid,
    /// Backend name (quorum registry key).
    pub backend: String,
    /// Provider settings.
    pub provider: ProviderConfig,
    /// Outbound agreements.
    pub agreements: Vec<AgreementConfig>,
    /// Quorum settings.
    pub quorum: QuorumConfig,
    /// Worker pool settings.
    pub pool: PoolConfig,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            sid: 1,
            backend: "userRoot".to_string(),
            provider: ProviderConfig::default(),
            agreements: Vec::new(),
            quorum: QuorumConfig::default(),
            pool: PoolConfig::default(),
        }
    }
}

impl ReplicaConfig {
    /// Read and validate a JSON config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: ReplicaConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the whole configuration.
    pub fn validate(&self) -> Result<()> {
        if self.sid > MAX_SID {
            return Err(ReplError::config(format!("sid {} exceeds {:#x}", self.sid, MAX_SID)));
        }
        if self.backend.is_empty() {
            return Err(ReplError::config("backend name is empty"));
        }
        let p = &self.provider;
        p.validate()?;
        let mut rids = HashSet::new();
        for agreement in &self.agreements {
            agreement.validate()?;
            if !rids.insert(agreement.rid) {
                return Err(ReplError::config(format!("duplicate rid {:03}", agreement.rid)));
            }
            if !agreement.base.is_within(&p.suffix) {
                return Err(ReplError::config(format!(
                    "rid {:03}: base {} is outside suffix {}",
                    agreement.rid, agreement.base, p.suffix
                )));
            }
        }
        if self.pool.max_workers == 0 {
            return Err(ReplError::config("pool.max_workers must be positive"));
        }
        Ok(())
    }
}
