//! # Stagehand - Gradebook Server
//!
//! The main binary of the Stagehand orchestrator.
//!
//! ## Usage
//!
//! ```bash
//! # Start the HTTP server
//! stagehand serve --host 0.0.0.0 --port 8080
//!
//! # Watch a roster chain load in the terminal
//! stagehand watch --teacher 1 --switch-to 2
//!
//! # Show what the fixture gradebook holds
//! stagehand fixture
//! ```

mod cli;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// APPLICATION ENTRY POINT
// =============================================================================

#[tokio::main]
async fn main() {
    // STAGEHAND_LOG_FORMAT=json enables machine-parseable output.
    let log_format = std::env::var("STAGEHAND_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "stagehand=info,stagehand_core=info,tower_http=debug".into());

    // Logs go to stderr so `watch --json-mode` keeps stdout clean.
    match log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }

    let cli = cli::Cli::parse();

    if !cli.quiet && !cli.json_mode {
        print_banner();
    }

    if let Err(e) = cli::execute(cli).await {
        tracing::error!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Print the Stagehand startup banner.
fn print_banner() {
    println!(
        r#"
  ┌─┐┌┬┐┌─┐┌─┐┌─┐┬ ┬┌─┐┌┐┌┌┬┐
  └─┐ │ ├─┤│ ┬├┤ ├─┤├─┤│││ ││
  └─┘ ┴ ┴ ┴└─┘└─┘┴ ┴┴ ┴┘└┘─┴┘

  Dependent Data Orchestrator v{}

  Keyed • Deduplicated • Last Key Wins
"#,
        env!("CARGO_PKG_VERSION")
    );
}
