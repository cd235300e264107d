#![warn(missing_docs)]

//! dirsync replication: multi-master directory replication built on change
//! sequence numbers and sync cookies, with a provider overlay, scheduled
//! consumers and a per-backend quorum.

pub mod checkpoint;
pub mod config;
pub mod conflict;
pub mod consumer;
pub mod cookie;
pub mod csn;
pub mod entry;
pub mod error;
pub mod metrics;
pub mod position;
pub mod protocol;
pub mod provider;
pub mod psearch;
pub mod quorum;
pub mod reconcile;
pub mod replica;
pub mod retry;
pub mod scheduler;
pub mod session_log;
pub mod status;
pub mod store;
pub mod transport;

pub use config::{AgreementConfig, ProviderConfig, ReplicaConfig};
pub use consumer::Consumer;
pub use cookie::SyncCookie;
pub use csn::{Csn, CsnGenerator};
pub use error::{ReplError, Result};
pub use provider::Provider;
pub use quorum::Quorum;
pub use replica::Replica;
pub use store::{LocalStore, MemoryStore};
