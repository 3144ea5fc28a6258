mod cli;
mod config;
mod error;
mod gossip;
mod logging;
mod markers;
mod network;
mod orchestrator;
mod power;
mod process;
mod selector;
mod state_machine;
mod transfer;

use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

use cli::Cli;
use config::NodeConfig;
use gossip::{GossipService, SelfStatus};
use orchestrator::SystemOrchestrator;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = NodeConfig::load(cli.config.as_deref())?;
    if cli.no_power_sensing {
        config.power.sensing_enabled = false;
    }

    let local = match config.node.address {
        Some(address) => address,
        None => network::local_address(&config.node.interface, config.workload.alias)
            .context("could not determine this node's address")?,
    };
    info!("node {local} starting");

    let (status_tx, status_rx) = watch::channel(SelfStatus::new(local, !config.power.sensing_enabled));
    let (gossip, peers) = GossipService::start(&config.gossip, local, status_rx)
        .await
        .context("failed to start gossip")?;

    let mut orchestrator = SystemOrchestrator::from_config(&config, peers, status_tx);
    let outcome = tokio::select! {
        result = orchestrator.run() => result.map_err(anyhow::Error::from),
        signal = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
            signal.context("failed to listen for ctrl-c")
        }
    };

    gossip
        .stop(Duration::from_millis(config.gossip.stop_grace_ms))
        .await;
    outcome
}
