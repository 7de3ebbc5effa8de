// Keyfed — Application Entry Point
//
// Parses CLI arguments, initializes structured logging, and dispatches to
// the command handler. Uses the tokio runtime for the HTTP server and the
// concurrent import pool.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use keyfed::cli::{execute, Cli};

#[tokio::main]
async fn main() {
    // RUST_LOG=keyfed=debug for verbose output. Partner tokens are never logged.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("keyfed=info,tower_http=info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    if let Err(e) = execute(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
