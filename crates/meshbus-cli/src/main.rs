//! `meshbus` — run a bus node.

mod cli;

use anyhow::Context;
use clap::Parser;
use cli::{Cli, Commands};
use meshbus_cluster::{load_config, ClusterService, MembershipEvent};
use meshbus_types::{BusConfig, MemberKey};
use std::sync::Arc;
use tracing::{info, warn};

fn init_tracing(level: &str, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref());

    match cli.command {
        Some(Commands::Config) => {
            let rendered = toml::to_string_pretty(&config).context("rendering config")?;
            print!("{rendered}");
            Ok(())
        }
        Some(Commands::Start { seeds, topics }) => {
            init_tracing(&config.log_level, cli.json_logs);
            run(config, seeds, topics).await
        }
        None => {
            init_tracing(&config.log_level, cli.json_logs);
            run(config, Vec::new(), Vec::new()).await
        }
    }
}

async fn run(config: BusConfig, extra_seeds: Vec<MemberKey>, topics: Vec<String>) -> anyhow::Result<()> {
    let seeds: Vec<MemberKey> = config.seeds.iter().copied().chain(extra_seeds).collect();
    let node = ClusterService::start(config)
        .await
        .context("starting bus node")?;
    info!(member = %node.local_key(), addr = %node.local_addr(), "meshbus node running");

    for seed in seeds {
        if let Err(e) = node.add_peer(seed) {
            warn!(member = %seed, "Skipping seed: {}", e);
        }
    }

    for topic in topics {
        spawn_topic_logger(&node, topic);
    }
    spawn_membership_logger(&node);

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    node.shutdown();
    Ok(())
}

fn spawn_topic_logger(node: &Arc<ClusterService>, topic: String) {
    let mut subscription = node.add_listener(&topic);
    tokio::spawn(async move {
        while let Some(envelope) = subscription.recv().await {
            info!(
                topic = %envelope.topic,
                partition = %envelope.partition,
                sender = %envelope.sender,
                class_name = %envelope.class_name,
                bytes = envelope.payload.len(),
                "Received envelope"
            );
        }
    });
}

fn spawn_membership_logger(node: &Arc<ClusterService>) {
    let mut events = node.registry().subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(MembershipEvent::StatusChanged { key, status, sequence }) => {
                    info!(member = %key, %status, sequence, "Membership changed");
                }
                Ok(event) => info!(?event, "Membership event"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Membership log lagging");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
