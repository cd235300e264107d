//! Sync wire sub-protocol.
//!
//! Messages ride inside the host protocol's search request/response envelope;
//! here they are framed with bincode. Cookies travel in their opaque string
//! form and are only parsed by the receiver.

use crate::cookie::SyncCookie;
use crate::entry::{Dn, Entry, EntryUuid, Filter, Scope};
use crate::error::{ReplError, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Requested session mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Catch up, then end the session.
    RefreshOnly,
    /// Catch up, then keep streaming changes.
    RefreshAndPersist,
}

/// Sync request control plus the search it is attached to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRequest {
    /// Session mode.
    pub mode: SyncMode,
    /// Opaque position cookie.
    pub cookie: Option<String>,
    /// Ask the provider for a full reload.
    pub reload_hint: bool,
    /// Search base.
    pub base: Dn,
    /// Search scope.
    pub scope: Scope,
    /// Search filter.
    pub filter: Filter,
}

/// Per-entry state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    /// New entry (or full content of a changed one during refresh).
    Add,
    /// Changed entry.
    Modify,
    /// Removed entry.
    Delete,
    /// Unchanged entry confirmed to still exist.
    Present,
}

/// Entry delivery with its state control.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    /// State.
    pub state: EntryState,
    /// Target uuid.
    pub uuid: EntryUuid,
    /// Entry content for add/modify.
    pub entry: Option<Entry>,
    /// Cookie reflecting the CSN that produced this delivery.
    pub cookie: Option<String>,
}

/// End-of-refresh control.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncDone {
    /// Final cookie.
    pub cookie: Option<String>,
    /// True when absent entries were already reported as deleted; false when
    /// the consumer must delete whatever was not confirmed present.
    pub refresh_deletes: bool,
}

/// Mid-stream informational messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncInfo {
    /// Position advanced without an entry payload.
    NewCookie {
        /// New cookie.
        cookie: String,
    },
    /// Delete phase transition.
    RefreshDelete {
        /// Cookie at the transition.
        cookie: Option<String>,
        /// Refresh finished.
        done: bool,
    },
    /// Present phase transition.
    RefreshPresent {
        /// Cookie at the transition.
        cookie: Option<String>,
        /// Refresh finished.
        done: bool,
    },
    /// Batch of uuids that are confirmed present or confirmed deleted.
    IdSet {
        /// Cookie for the batch.
        cookie: Option<String>,
        /// True for deletions, false for presence.
        refresh_deletes: bool,
        /// The uuids.
        uuids: Vec<EntryUuid>,
    },
}

/// Reason a provider ended a session abnormally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefusalKind {
    /// Try again later.
    Busy,
    /// The request or cookie was malformed.
    ProtocolError,
    /// The provider is shutting down or its store is gone.
    Unavailable,
}

/// Provider → consumer message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProviderMessage {
    /// Entry delivery.
    State(SyncState),
    /// Informational message.
    Info(SyncInfo),
    /// End of a refresh-only session.
    Done(SyncDone),
    /// Session refused or aborted.
    Refused {
        /// Kind.
        kind: RefusalKind,
        /// Details.
        msg: String,
    },
}

/// Consumer → provider message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConsumerMessage {
    /// Open the sync search.
    Request(SyncRequest),
    /// Abandon the running search.
    Abandon,
}

/// Serialize a message into a frame.
pub fn encode<T: Serialize>(msg: &T) -> Result<Bytes> {
    Ok(Bytes::from(bincode::serialize(msg)?))
}

/// Deserialize a frame; malformed frames are protocol errors.
pub fn decode<T: for<'de> Deserialize<'de>>(frame: &[u8]) -> Result<T> {
    bincode::deserialize(frame)
        .map_err(|e| ReplError::protocol(format!("undecodable frame: {}", e)))
}

/// Parse an optional wire cookie.
pub fn parse_cookie(raw: Option<&str>) -> Result<Option<SyncCookie>> {
    raw.map(SyncCookie::parse).transpose()
}
