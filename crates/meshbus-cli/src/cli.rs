//! Command-line definitions.

use clap::{Parser, Subcommand};
use meshbus_types::MemberKey;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "meshbus",
    version,
    about = "Decentralized publish/subscribe message bus node"
)]
pub struct Cli {
    /// Path to config file (default: ./meshbus.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a bus node until Ctrl-C (the default).
    Start {
        /// Extra peer to connect to, as ip:commandPort:dataPort. Repeatable.
        #[arg(long = "seed")]
        seeds: Vec<MemberKey>,

        /// Topic to subscribe to and log. Repeatable.
        #[arg(long = "topic")]
        topics: Vec<String>,
    },
    /// Print the effective configuration as TOML.
    Config,
}
