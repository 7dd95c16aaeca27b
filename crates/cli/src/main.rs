// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use clap::{Parser, Subcommand};
use concord_cli::commands::{demo, inspect};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "concord")]
#[command(about = "Concord - replicated state machines with log-ordered live subscriptions", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an in-process shard and walk through the subscription handshake.
    Demo {
        /// Number of replicas in the shard
        #[arg(long, short, default_value_t = 3)]
        replicas: u64,

        /// Events to post after the subscription starts
        #[arg(long, short, default_value_t = 5)]
        events: u64,

        /// Write a snapshot of replica 1 here when done
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },
    /// Show the header and table sizes of a state machine snapshot
    Inspect {
        snapshot_path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    concord_node::telemetry::init_telemetry();

    let cli = Cli::parse();

    match cli.command {
        Commands::Demo {
            replicas,
            events,
            snapshot,
        } => {
            let opts = demo::DemoOptions {
                replicas,
                events,
                snapshot,
            };
            demo::run(&opts).await.map(|_| ())
        }
        Commands::Inspect { snapshot_path } => inspect::run(&snapshot_path),
    }
}
