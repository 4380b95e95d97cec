//! # Stagehand CLI Module
//!
//! This module implements the CLI interface for Stagehand.
//!
//! ## Available Commands
//!
//! - `serve` - Start the HTTP server
//! - `watch` - Drive a roster chain and print every transition
//! - `fixture` - Summarize the configured gradebook fixture

mod commands;

use clap::{Parser, Subcommand};
use stagehand::config::Config;
use stagehand::error::AppError;
use std::path::PathBuf;

pub use commands::*;

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// Stagehand - Dependent Data Orchestrator
///
/// Screens are chains of keyed stages; each stage fetches once its
/// upstream is ready, and the last key set always wins.
#[derive(Parser, Debug)]
#[command(name = "stagehand")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Print stage values, not only statuses
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress banner output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to the TOML config (default: ./stagehand.toml if present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Output in JSON format (for programmatic access)
    #[arg(long, global = true)]
    pub json_mode: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start HTTP server
    Serve {
        /// Host to bind to (overrides `server.host`)
        #[arg(short = 'H', long)]
        host: Option<String>,

        /// Port to bind to (overrides `server.port`)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Open a roster screen and print its transitions until it settles
    Watch {
        /// Teacher whose classes are loaded
        #[arg(short, long)]
        teacher: String,

        /// Switch to this teacher as soon as the classes arrive
        #[arg(short, long)]
        switch_to: Option<String>,
    },

    /// Summarize the gradebook fixture
    Fixture,
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

/// Execute the CLI with parsed arguments.
pub async fn execute(cli: Cli) -> Result<(), AppError> {
    let config = Config::load(cli.config.as_deref())?;
    let json_mode = cli.json_mode;

    match cli.command {
        Some(Commands::Serve { host, port }) => cmd_serve(config, host, port).await,
        Some(Commands::Watch { teacher, switch_to }) => {
            cmd_watch(&config, json_mode, cli.verbose, teacher, switch_to).await
        }
        Some(Commands::Fixture) | None => {
            cmd_fixture(&config, json_mode);
            Ok(())
        }
    }
}
