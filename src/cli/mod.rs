// Keyfed — CLI Module
//
// Command-line interface using clap derive macros.
// Subcommands: serve, schedule, import, partner, batches.

mod commands;

use std::net::SocketAddr;

use clap::{Parser, Subcommand};

use crate::config::Settings;

pub use commands::execute;

/// Keyfed — imports signed diagnosis-key exports from federation partners.
#[derive(Parser, Debug)]
#[command(name = "keyfed")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub settings: Settings,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the HTTP trigger endpoints (/schedule, /import, /health).
    Serve {
        #[arg(long, env = "KEYFED_BIND", default_value = "0.0.0.0:8080")]
        bind: SocketAddr,
    },

    /// Run one due-mode pass over every partner and print the summary.
    Schedule,

    /// Force an import cycle for one partner, ignoring its cadence.
    Import {
        #[arg(long)]
        partner: String,
    },

    /// Manage federation partners.
    #[command(subcommand)]
    Partner(PartnerCommands),

    /// Show the ledger of merged batches for a partner.
    Batches {
        partner: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum PartnerCommands {
    /// Create a partner or update its configuration. Progress is kept.
    Add {
        name: String,

        /// Base URL the index and batch paths are resolved against.
        #[arg(long)]
        export_root: String,

        #[arg(long, default_value = "index.txt")]
        index_file: String,

        /// Environment variable holding the partner's bearer token.
        #[arg(long)]
        credential_env: Option<String>,

        /// Region label stamped on imported keys.
        #[arg(long)]
        region: String,

        /// Minimum interval between imports (e.g. "1h", "30m").
        #[arg(long, default_value = "1h", value_parser = humantime::parse_duration)]
        cadence: std::time::Duration,
    },

    /// List partners with their cursor and status.
    List,

    /// Remove a partner and its trusted keys. Imported keys are kept.
    Remove {
        name: String,
    },

    /// Trust an Ed25519 public key for a partner's batch signatures.
    AddKey {
        partner: String,

        #[arg(long)]
        key_id: String,

        #[arg(long)]
        key_version: String,

        /// Base64-encoded 32-byte Ed25519 public key.
        #[arg(long)]
        public_key: String,

        /// RFC 3339 start of validity (default: now).
        #[arg(long)]
        valid_from: Option<String>,

        /// RFC 3339 end of validity (default: open-ended).
        #[arg(long)]
        valid_until: Option<String>,
    },

    /// Re-enable a partner and clear its failure streak.
    Enable {
        name: String,
    },

    /// Stop importing from a partner.
    Disable {
        name: String,
    },
}
