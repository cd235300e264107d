//! Shared fixtures for the replication integration tests.

#![allow(dead_code)]

use dirsync_repl::config::{AgreementConfig, ProviderConfig, ReplicaConfig};
use dirsync_repl::entry::{Dn, Entry, EntryUuid};
use dirsync_repl::protocol::SyncMode;
use dirsync_repl::store::LocalStore;
use dirsync_repl::transport::{Connector, LoopbackConnector, SessionAcceptor};
use dirsync_repl::{Consumer, MemoryStore, Quorum, Replica};
use std::sync::Arc;

pub const SUFFIX: &str = "dc=example";

/// Knobs for one test replica.
pub struct TestConfig {
    pub session_log_depth: usize,
    pub mode: SyncMode,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            session_log_depth: 100,
            mode: SyncMode::RefreshOnly,
        }
    }
}

/// A replica over an in-memory backend, with checkpoints off.
pub fn replica(sid: u16, test: &TestConfig) -> Replica {
    let config = ReplicaConfig {
        sid,
        backend: format!("userRoot-{}", sid),
        provider: ProviderConfig {
            suffix: Dn::new(SUFFIX),
            session_log_depth: test.session_log_depth,
            checkpoint_ops: 0,
            checkpoint_interval_secs: 0,
            ..Default::default()
        },
        ..Default::default()
    };
    Replica::open(config, Arc::new(MemoryStore::new()), &Quorum::new()).unwrap()
}

/// Make `consumer` pull from `provider` under agreement `rid`. The agreement
/// is driven by calling [`Consumer::step`] directly.
pub fn connect(consumer: &mut Replica, provider: &Replica, rid: u16, mode: SyncMode) -> Arc<Consumer> {
    let connector: Arc<dyn Connector> = Arc::new(LoopbackConnector::new(
        &format!("mem://{}", provider.sid()),
        Arc::clone(provider.provider()) as Arc<dyn SessionAcceptor>,
        64,
    ));
    let agreement = AgreementConfig {
        mode,
        poll_wait_ms: 500,
        timeout_ms: 2000,
        ..AgreementConfig::new(rid, &format!("mem://{}", provider.sid()), SUFFIX)
    };
    consumer.add_agreement(agreement, connector).unwrap()
}

pub fn uuid(n: u128) -> EntryUuid {
    EntryUuid::from_u128(n)
}

pub fn root() -> Entry {
    Entry::new(uuid(100), Dn::new(SUFFIX)).with_attr("objectclass", &["domain"])
}

pub fn person(n: u128, cn: &str) -> Entry {
    Entry::new(uuid(n), Dn::new(&format!("cn={},{}", cn, SUFFIX)))
        .with_attr("objectclass", &["person"])
        .with_attr("cn", &[cn])
}

/// Seed `replica` with the root and one person per name, uuids from 1.
pub fn seed(replica: &Replica, names: &[&str]) {
    replica.provider().add_local(root()).unwrap();
    for (i, name) in names.iter().enumerate() {
        replica
            .provider()
            .add_local(person(i as u128 + 1, name))
            .unwrap();
    }
}

pub fn get(replica: &Replica, n: u128) -> Option<Entry> {
    replica.provider().backing_store().get(&uuid(n)).unwrap()
}

/// Uuids and DNs of every real entry, sorted.
pub fn contents(replica: &Replica) -> Vec<(EntryUuid, Dn)> {
    let mut out: Vec<(EntryUuid, Dn)> = replica
        .provider()
        .backing_store()
        .search(&Dn::new(SUFFIX), dirsync_repl::entry::Scope::Subtree)
        .unwrap()
        .into_iter()
        .filter(|e| !e.glue)
        .map(|e| (e.uuid, e.dn))
        .collect();
    out.sort();
    out
}
