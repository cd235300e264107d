#![warn(missing_docs)]

//! `ds-repl`: replication configuration checks, cookie inspection and an
//! in-process demo of two replicas.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dirsync_repl::config::{AgreementConfig, ProviderConfig, ReplicaConfig};
use dirsync_repl::entry::{Dn, Entry, EntryUuid, ModOp, Modification};
use dirsync_repl::transport::{Connector, LoopbackConnector, SessionAcceptor};
use dirsync_repl::{metrics, MemoryStore, Quorum, Replica, SyncCookie};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "ds-repl")]
#[command(about = "Directory replication tool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a replica config file and print its agreements.
    Check { config: PathBuf },
    /// Parse a sync cookie and print its normalized form.
    Cookie { wire: String },
    /// Replicate between two in-process replicas and print their status.
    Demo {
        #[arg(short, long, default_value = "5")]
        entries: u32,
        #[arg(long)]
        metrics: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Check { config } => check(config),
        Command::Cookie { wire } => cookie(&wire),
        Command::Demo { entries, metrics } => demo(entries, metrics).await,
    }
}

fn check(path: PathBuf) -> Result<()> {
    let config = ReplicaConfig::from_file(&path)
        .with_context(|| format!("loading {}", path.display()))?;
    println!(
        "sid={:03x} backend={} suffix={}",
        config.sid, config.backend, config.provider.suffix
    );
    for a in &config.agreements {
        println!(
            "  {} provider={} base={} mode={:?} retry=\"{}\"",
            a.task_name(),
            a.provider,
            a.base,
            a.mode,
            a.retry
        );
    }
    Ok(())
}

fn cookie(wire: &str) -> Result<()> {
    let cookie = SyncCookie::parse(wire).context("parsing cookie")?;
    println!("{}", cookie);
    for csn in cookie.csns() {
        let when = csn
            .timestamp()
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "?".to_string());
        println!("  sid={:03x} {} ({})", csn.sid(), csn, when);
    }
    Ok(())
}

fn replica_config(sid: u16) -> ReplicaConfig {
    ReplicaConfig {
        sid,
        provider: ProviderConfig {
            suffix: Dn::new("dc=example,dc=com"),
            ..Default::default()
        },
        ..Default::default()
    }
}

async fn caught_up(replica: &Replica, target: &SyncCookie) {
    while !replica.provider().context().dominates(target) {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn demo(entries: u32, with_metrics: bool) -> Result<()> {
    let quorum = Quorum::new();
    let mut a = Replica::open(replica_config(1), Arc::new(MemoryStore::new()), &quorum)?;
    let mut b = Replica::open(
        ReplicaConfig {
            backend: "userRoot-b".to_string(),
            ..replica_config(2)
        },
        Arc::new(MemoryStore::new()),
        &quorum,
    )?;

    let root = Entry::new(EntryUuid::new_v4(), Dn::new("dc=example,dc=com"))
        .with_attr("objectclass", &["domain"]);
    a.provider().add_local(root)?;
    let mut people = Vec::new();
    for i in 0..entries {
        let cn = format!("user{}", i);
        let entry = Entry::new(EntryUuid::new_v4(), Dn::new(&format!("cn={},dc=example,dc=com", cn)))
            .with_attr("cn", &[cn.as_str()]);
        people.push(entry.uuid);
        a.provider().add_local(entry)?;
    }

    let to_a: Arc<dyn Connector> = Arc::new(LoopbackConnector::new(
        "mem://a",
        Arc::clone(a.provider()) as Arc<dyn SessionAcceptor>,
        256,
    ));
    let to_b: Arc<dyn Connector> = Arc::new(LoopbackConnector::new(
        "mem://b",
        Arc::clone(b.provider()) as Arc<dyn SessionAcceptor>,
        256,
    ));
    b.add_agreement(AgreementConfig::new(1, "mem://a", "dc=example,dc=com"), to_a)?;
    a.add_agreement(AgreementConfig::new(2, "mem://b", "dc=example,dc=com"), to_b)?;
    a.start();
    b.start();

    let target = a.provider().context();
    tokio::time::timeout(Duration::from_secs(10), caught_up(&b, &target))
        .await
        .context("replica b did not catch up")?;

    // one write on each side, then wait for both to converge
    if let Some(first) = people.first() {
        a.provider()
            .modify_local(first, &[Modification::new(ModOp::Add, "mail", &["user0@example.com"])])?;
    }
    let extra = Entry::new(EntryUuid::new_v4(), Dn::new("cn=from-b,dc=example,dc=com"))
        .with_attr("cn", &["from-b"]);
    b.provider().add_local(extra)?;
    let (ctx_a, ctx_b) = (a.provider().context(), b.provider().context());
    tokio::time::timeout(Duration::from_secs(10), async {
        caught_up(&b, &ctx_a).await;
        caught_up(&a, &ctx_b).await;
    })
    .await
    .context("replicas did not converge")?;

    for replica in [&a, &b] {
        let status = replica.status().await;
        if with_metrics {
            print!("{}", metrics::format_prometheus(&metrics::from_status(&status)));
        } else {
            println!("{}", status.to_json()?);
        }
    }
    a.shutdown().await?;
    b.shutdown().await?;
    Ok(())
}
