//! Parley relay administration binary.
//!
//! # Usage
//!
//! ```bash
//! # Every envelope between two users
//! parley-server --db relay.redb conversation a1 b2
//!
//! # Replay bookkeeping for one sender
//! parley-server --db relay.redb replay-state a1
//!
//! # Forget nonces older than one day
//! parley-server --db relay.redb prune-nonces --older-than-secs 86400
//!
//! # Last 20 security events
//! parley-server --db relay.redb security-log --limit 20
//! ```
//!
//! Results are printed to stdout as JSON; logs go to stderr.

use std::{
    io::{self, Write},
    path::PathBuf,
    time::Duration,
};

use clap::{Parser, Subcommand};
use parley_server::{RedbStorage, Relay, RelayConfig, SystemEnv};
use serde::Serialize;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Parley relay administration
#[derive(Parser, Debug)]
#[command(name = "parley-server")]
#[command(about = "Inspect and maintain a Parley relay database")]
#[command(version)]
struct Args {
    /// Path to the relay database (created if missing)
    #[arg(long, default_value = "parley.redb")]
    db: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print every envelope between two users, oldest first
    Conversation {
        /// First user id
        a: String,
        /// Second user id
        b: String,
    },

    /// Print replay state for a sender
    ReplayState {
        /// Sender user id
        sender: String,
    },

    /// Drop remembered nonces past the retention window
    PruneNonces {
        /// Override the default 7-day retention
        #[arg(long)]
        older_than_secs: Option<u64>,
    },

    /// Print the most recent security events
    SecurityLog {
        /// Maximum number of events
        #[arg(long, default_value = "50")]
        limit: usize,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer().with_writer(io::stderr)).with(filter).init();

    let storage = RedbStorage::open(&args.db)?;
    let relay = Relay::new(SystemEnv::new(), storage, RelayConfig::default());
    tracing::debug!(db = %args.db.display(), "relay database opened");

    match args.command {
        Command::Conversation { a, b } => print_json(&relay.conversation(&a, &b)?),
        Command::ReplayState { sender } => print_json(&relay.replay_state(&sender)?),
        Command::PruneNonces { older_than_secs } => {
            let pruned = match older_than_secs {
                Some(secs) => relay.prune_nonces_older_than(Duration::from_secs(secs))?,
                None => relay.maintenance()?,
            };
            print_json(&serde_json::json!({ "pruned": pruned }))
        },
        Command::SecurityLog { limit } => print_json(&relay.security_log(limit)?),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, value)?;
    writeln!(stdout)?;
    Ok(())
}
