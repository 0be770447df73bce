//! The Reef worker daemon.
//!
//! Binds the TCP transport, starts a node runtime, waits for the
//! configured cluster size, and serves until interrupted or killed by a
//! fatal peer notice.

mod config;
mod telemetry;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use reef_net::{TcpWire, Wire};
use reef_node::NodeRuntime;
use reef_store::{BackendSet, FileStore, MemoryStore};
use reef_types::{BackendKind, RebootCause};
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::config::DaemonConfig;

#[derive(Debug, Parser)]
#[command(name = "reefd", about = "Reef cluster worker daemon", version)]
struct Args {
    /// Path to the TOML config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen address (`ip:port`).
    #[arg(long)]
    listen: Option<String>,

    /// Seed addresses to contact on startup (repeatable).
    #[arg(long = "seed")]
    seeds: Vec<String>,

    /// Override the expected cluster size to wait for.
    #[arg(long)]
    expect: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = DaemonConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.node.listen_addr = listen;
    }
    if !args.seeds.is_empty() {
        config.cluster.seeds = args.seeds;
    }
    if let Some(expect) = args.expect {
        config.cluster.expected_size = expect;
    }
    telemetry::init(&config.log.level);

    let listen = config.listen_addr()?;
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let wire = TcpWire::bind(listen, inbound_tx).await?;
    let backends = build_backends(&config)?;

    let dyn_wire: Arc<dyn Wire> = wire.clone();
    let runtime = NodeRuntime::start(dyn_wire, inbound_rx, backends, config.runtime_config());
    runtime.add_seeds(&config.seeds()?);

    let expected = config.cluster.expected_size.max(1);
    info!(listen = %runtime.local_addr(), expected, "waiting for the cluster to form");
    runtime.wait_for_members(expected).await;
    info!(members = runtime.cluster().view().len(), "cluster formed, serving");

    let mut fatal = runtime.fatal();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, announcing shutdown");
            runtime.broadcast_notice(RebootCause::Shutdown).await;
            wire.close();
            runtime.shutdown();
            Ok(())
        }
        _ = fatal.changed() => {
            let cause = (*fatal.borrow()).unwrap_or(RebootCause::Error);
            error!(%cause, "killed by peer notice");
            wire.close();
            runtime.shutdown();
            std::process::exit(1)
        }
    }
}

/// Assemble the byte backends from the config. Memory is always
/// present; disk is added when configured, rooted under the data dir.
fn build_backends(config: &DaemonConfig) -> anyhow::Result<BackendSet> {
    let mut backends =
        BackendSet::new().with(BackendKind::Memory, Arc::new(MemoryStore::unbounded()));
    if config.backend_kind() == BackendKind::Disk {
        let store = FileStore::new(config.node.data_dir.join("blobs"))?;
        backends = backends.with(BackendKind::Disk, Arc::new(store));
    }
    Ok(backends)
}
