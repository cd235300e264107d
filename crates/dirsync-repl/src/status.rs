//! Read-only replica status report.

use crate::consumer::{AgreementStatus, Consumer};
use crate::csn::Sid;
use crate::error::Result;
use crate::position::{PublishRecord, SharedPosition};
use crate::provider::{Provider, ProviderStats};
use crate::quorum::{LinkStatus, QuorumHandle};
use serde::Serialize;
use std::sync::Arc;

/// Readiness of one replication link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkReport {
    /// Agreement id.
    pub rid: u16,
    /// Origin the link speaks for, once learned.
    pub sid: Option<Sid>,
    /// Current readiness.
    pub status: LinkStatus,
}

/// One recent position commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishReport {
    /// Agreement that published.
    pub rid: u16,
    /// Position after the commit.
    pub cookie: String,
    /// Commit time, microseconds since the Unix epoch.
    pub published_at_us: u64,
}

impl From<PublishRecord> for PublishReport {
    fn from(r: PublishRecord) -> Self {
        Self {
            rid: r.rid,
            cookie: r.cookie,
            published_at_us: r.published_at_us,
        }
    }
}

/// Everything an operator needs to see about one replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplicaStatus {
    /// Local replica id.
    pub sid: Sid,
    /// Backend name.
    pub backend: String,
    /// Committed consumer position.
    pub position: String,
    /// Commits that advanced the position.
    pub publishes: u64,
    /// Recent commits, oldest first.
    pub recent_publishes: Vec<PublishReport>,
    /// Whether the backend currently has quorum.
    pub has_quorum: bool,
    /// Human-readable quorum summary.
    pub quorum: String,
    /// Link readiness, by rid.
    pub links: Vec<LinkReport>,
    /// Outbound agreements.
    pub agreements: Vec<AgreementStatus>,
    /// Provider side, when this replica serves one.
    pub provider: Option<ProviderStats>,
}

impl ReplicaStatus {
    /// Gather a snapshot.
    pub async fn collect(
        sid: Sid,
        position: &SharedPosition,
        quorum: &QuorumHandle,
        consumers: &[Arc<Consumer>],
        provider: Option<&Provider>,
    ) -> Self {
        let mut agreements = Vec::with_capacity(consumers.len());
        for consumer in consumers {
            agreements.push(consumer.status().await);
        }
        agreements.sort_by_key(|a| a.rid);
        Self {
            sid,
            backend: quorum.backend().to_string(),
            position: position.snapshot().render(),
            publishes: position.publishes(),
            recent_publishes: position.history().into_iter().map(Into::into).collect(),
            has_quorum: quorum.has_quorum(),
            quorum: quorum.summary(),
            links: quorum
                .links()
                .into_iter()
                .map(|(rid, sid, status)| LinkReport { rid, sid, status })
                .collect(),
            agreements,
            provider: provider.map(Provider::stats),
        }
    }

    /// Pretty JSON for the CLI.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
