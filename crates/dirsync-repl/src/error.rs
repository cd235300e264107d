//! Error types for the replication subsystem.

use thiserror::Error;

/// Outcome of a failed apply against the local store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplyError {
    /// The target DN or uuid is already present.
    #[error("entry already exists: {dn}")]
    AlreadyExists {
        /// DN of the conflicting entry.
        dn: String,
    },

    /// The target entry (or its parent) does not exist.
    #[error("no such object: {target}")]
    NoSuchObject {
        /// DN or uuid that was not found.
        target: String,
    },

    /// An attribute-level constraint rejected the change.
    #[error("constraint violation on {attr}: {msg}")]
    ConstraintViolation {
        /// Offending attribute.
        attr: String,
        /// Details.
        msg: String,
    },

    /// Delete of an entry that still has children.
    #[error("not allowed on non-leaf: {dn}")]
    NotAllowedOnNonLeaf {
        /// DN of the entry with children.
        dn: String,
    },

    /// The store cannot serve requests at all.
    #[error("store unavailable: {msg}")]
    Unavailable {
        /// Details.
        msg: String,
    },
}

/// How the engines react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed wire data: tear the session down, apply nothing.
    Protocol,
    /// A position moving backward (or not advancing in strict mode).
    Ordering,
    /// Network trouble or a busy peer: retry per schedule.
    Transient,
    /// A single change conflicts locally: skip it.
    Conflict,
    /// Local storage is gone: abort the agreement.
    Fatal,
}

/// Errors that can occur in the replication subsystem.
#[derive(Debug, Error)]
pub enum ReplError {
    /// Invalid CSN, cookie or control encoding.
    #[error("protocol error: {msg}")]
    Protocol {
        /// Error message describing the malformed data.
        msg: String,
    },

    /// A cookie tried to move an origin's position backward.
    #[error("ordering violation for sid {sid:03x}: {current} -> {incoming}")]
    OrderingViolation {
        /// Origin replica id.
        sid: u16,
        /// Position currently held.
        current: String,
        /// Rejected position.
        incoming: String,
    },

    /// Transport error.
    #[error("network error: {msg}")]
    Network {
        /// Error message describing the network issue.
        msg: String,
    },

    /// The remote side refused the session for now.
    #[error("remote busy: {msg}")]
    Busy {
        /// Details from the remote side.
        msg: String,
    },

    /// A round trip exceeded its timeout.
    #[error("timed out after {ms}ms")]
    Timeout {
        /// Timeout in milliseconds.
        ms: u64,
    },

    /// A change could not be applied locally.
    #[error("apply failed: {0}")]
    Apply(#[from] ApplyError),

    /// Local storage failed in a way that aborts the agreement.
    #[error("store unavailable: {msg}")]
    StoreUnavailable {
        /// Details.
        msg: String,
    },

    /// Invalid configuration.
    #[error("config error: {msg}")]
    Config {
        /// Details.
        msg: String,
    },

    /// Frame serialization/deserialization error.
    #[error("serialization error")]
    Serialization(#[from] bincode::Error),

    /// JSON (config/status) error.
    #[error("json error")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// The operation observed a cancellation request.
    #[error("operation cancelled")]
    Cancelled,

    /// Replication engine was shut down.
    #[error("replication engine shut down")]
    Shutdown,
}

impl ReplError {
    /// Shorthand for a protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        ReplError::Protocol { msg: msg.into() }
    }

    /// Shorthand for a network error.
    pub fn network(msg: impl Into<String>) -> Self {
        ReplError::Network { msg: msg.into() }
    }

    /// Shorthand for a config error.
    pub fn config(msg: impl Into<String>) -> Self {
        ReplError::Config { msg: msg.into() }
    }

    /// Classify the error for the consumer's reaction policy.
    pub fn class(&self) -> ErrorClass {
        match self {
            ReplError::Protocol { .. } | ReplError::Serialization(_) => ErrorClass::Protocol,
            ReplError::OrderingViolation { .. } => ErrorClass::Ordering,
            ReplError::Network { .. }
            | ReplError::Busy { .. }
            | ReplError::Timeout { .. }
            | ReplError::Cancelled
            | ReplError::Shutdown => ErrorClass::Transient,
            ReplError::Apply(ApplyError::Unavailable { .. }) => ErrorClass::Fatal,
            ReplError::Apply(_) => ErrorClass::Conflict,
            ReplError::StoreUnavailable { .. }
            | ReplError::Config { .. }
            | ReplError::Json(_)
            | ReplError::Io(_) => ErrorClass::Fatal,
        }
    }
}

/// Crate-wide result alias.
pub type Result<T, E = ReplError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_errors_classified() {
        assert_eq!(ReplError::protocol("bad csn").class(), ErrorClass::Protocol);
    }

    #[test]
    fn test_apply_conflicts_are_skippable() {
        let err = ReplError::from(ApplyError::AlreadyExists {
            dn: "cn=a,dc=example".into(),
        });
        assert_eq!(err.class(), ErrorClass::Conflict);
    }

    #[test]
    fn test_unavailable_store_is_fatal() {
        let err = ReplError::from(ApplyError::Unavailable { msg: "closed".into() });
        assert_eq!(err.class(), ErrorClass::Fatal);
        assert_eq!(
            ReplError::StoreUnavailable { msg: "x".into() }.class(),
            ErrorClass::Fatal
        );
    }

    #[test]
    fn test_transient_classes() {
        assert_eq!(ReplError::network("reset").class(), ErrorClass::Transient);
        assert_eq!(ReplError::Timeout { ms: 10 }.class(), ErrorClass::Transient);
        assert_eq!(ReplError::Busy { msg: "x".into() }.class(), ErrorClass::Transient);
    }

    #[test]
    fn test_ordering_display() {
        let err = ReplError::OrderingViolation {
            sid: 1,
            current: "b".into(),
            incoming: "a".into(),
        };
        assert_eq!(err.class(), ErrorClass::Ordering);
        assert!(err.to_string().contains("sid 001"));
    }
}
