// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Runs one process of a group.
//!
//! ```bash
//! # every process but 2 sends 10 messages to 2 (config: "10 2")
//! lattice-bcast --id 1 --hosts hosts.txt --output 1.out --config links.config links
//!
//! # lattice agreement with the failure detector running alongside
//! lattice-bcast --id 1 --hosts hosts.txt --output 1.out --config lattice.config \
//!     --detect-failures lattice
//! ```
//!
//! The hosts file has one `id host port` line per process. Output is written
//! when the process receives SIGINT or SIGTERM.

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use lattice_bcast::{
    load_hosts, runtime, FifoBroadcast, Hosts, LatticeAgreement, LinkCommand, Mode, Node,
    NodeConfig, OutputLog, PerfectFailureDetector, PerfectLinks, Propose, Protocol, Scenario,
    Tuning,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "lattice-bcast")]
#[command(version, about, long_about = None)]
struct Cli {
    /// This process's id in the hosts file
    #[arg(long)]
    id: u32,

    /// Hosts file, one `id host port` per line
    #[arg(long)]
    hosts: PathBuf,

    /// Where to write the event log
    #[arg(long)]
    output: PathBuf,

    /// Scenario config for the chosen mode
    #[arg(long)]
    config: PathBuf,

    /// Timing overrides (TOML)
    #[arg(long)]
    tuning: Option<PathBuf>,

    /// Run the heartbeat failure detector alongside the protocol
    #[arg(long)]
    detect_failures: bool,

    /// Log level filter (overridden by RUST_LOG)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[arg(value_enum)]
    mode: Mode,
}

impl Cli {
    fn load(&self) -> Result<NodeConfig> {
        let hosts = load_hosts(&self.hosts)
            .with_context(|| format!("loading hosts from {}", self.hosts.display()))?;
        let scenario = Scenario::load(self.mode, &self.config)
            .with_context(|| format!("loading scenario from {}", self.config.display()))?;
        let tuning = match &self.tuning {
            Some(path) => Tuning::load(path)
                .with_context(|| format!("loading tuning from {}", path.display()))?,
            None => Tuning::default(),
        };
        Ok(NodeConfig {
            local: self.id,
            hosts,
            scenario,
            tuning,
            output: self.output.clone(),
        })
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::warn!("cannot listen for ctrl-c: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received SIGTERM"),
    }
}

async fn drive<P>(
    cfg: &NodeConfig,
    hosts: Arc<Hosts>,
    protocol: P,
    detect_failures: bool,
    commands: Vec<P::Command>,
) -> Result<()>
where
    P: Protocol + Send + 'static,
    P::Command: Send + 'static,
{
    let local = cfg.local_identity()?;
    let mut node = Node::new(cfg.local, hosts.clone(), protocol)?;
    if detect_failures {
        node = node.with_failure_detector(PerfectFailureDetector::new(
            cfg.local,
            &hosts,
            &cfg.tuning,
        ));
    }
    let socket = UdpSocket::bind(local.addr)
        .await
        .with_context(|| format!("binding {}", local.addr))?;
    let sink = OutputLog::create(&cfg.output)
        .with_context(|| format!("creating {}", cfg.output.display()))?;

    let (handle, task) = runtime::spawn(node, socket, sink);
    for cmd in commands {
        if !handle.send(cmd).await {
            break;
        }
    }
    info!(id = cfg.local, "all commands issued, running until signalled");
    shutdown_signal().await;
    handle.shutdown();
    task.await
        .context("node task panicked")?
        .context("node failed")?;
    info!("output written to {}", cfg.output.display());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let cfg = cli.load()?;
    info!(id = cfg.local, hosts = cfg.hosts.len(), mode = ?cli.mode, "starting");
    let hosts = Arc::new(cfg.hosts.clone());
    let local = cfg.local;

    match &cfg.scenario {
        Scenario::Links { messages, receiver } => {
            let protocol = PerfectLinks::new(local, &hosts, &cfg.tuning);
            let commands = if local == *receiver {
                Vec::new()
            } else {
                (1..=*messages)
                    .map(|seq| LinkCommand {
                        to: *receiver,
                        seq,
                        payload: Bytes::from(seq.to_string()),
                    })
                    .collect()
            };
            drive(&cfg, hosts, protocol, cli.detect_failures, commands).await
        }
        Scenario::Fifo { messages } => {
            let protocol = FifoBroadcast::new(local, hosts.clone(), &cfg.tuning)?;
            let commands = (1..=*messages)
                .map(|seq| Bytes::from(seq.to_string()))
                .collect();
            drive(&cfg, hosts, protocol, cli.detect_failures, commands).await
        }
        Scenario::Lattice { proposals } => {
            let protocol = LatticeAgreement::new(local, hosts.clone(), &cfg.tuning)?;
            let commands = proposals
                .iter()
                .zip(1..)
                .map(|(values, slot)| Propose {
                    slot,
                    values: values.clone(),
                })
                .collect();
            drive(&cfg, hosts, protocol, cli.detect_failures, commands).await
        }
    }
}
