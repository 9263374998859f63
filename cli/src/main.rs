// Copyright (c) 2026 Warden Contributors
// SPDX-License-Identifier: AGPL-3.0

//! # Warden Bot Host CLI
//!
//! The `warden` binary runs one bot host process against the upstream
//! bot-host API.
//!
//! ## Commands
//!
//! - `warden run` - Subscribe and serve personas until Ctrl+C / SIGTERM
//! - `warden config show|validate|generate` - Configuration management
//! - `warden schedule next` - Evaluate a recurrence specification

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

use warden_orchestrator::commands::{self, ConfigCommand, RunCommand, ScheduleCommand};

/// Warden Bot Host - run persona workers for a marketplace bot
#[derive(Parser)]
#[command(name = "warden")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "WARDEN_CONFIG_PATH",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "WARDEN_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log output format (text, json)
    #[arg(long, global = true, env = "WARDEN_LOG_FORMAT", default_value = "text")]
    log_format: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bot host
    #[command(name = "run")]
    Run {
        #[command(flatten)]
        command: RunCommand,
    },

    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },

    /// Recurrence schedule tools
    #[command(name = "schedule")]
    Schedule {
        #[command(subcommand)]
        command: ScheduleCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    init_logging(&cli.log_level, &cli.log_format)?;

    match cli.command {
        Some(Commands::Run { command }) => commands::run::execute(command, cli.config).await,
        Some(Commands::Config { command }) => {
            commands::config::handle_command(command, cli.config).await
        }
        Some(Commands::Schedule { command }) => commands::schedule::handle_command(command),
        None => {
            eprintln!("{}", "No command specified. Use --help for usage.".yellow());
            std::process::exit(1);
        }
    }
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str, format: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    match format {
        "json" => builder.json().init(),
        "text" => builder.compact().init(),
        other => anyhow::bail!("Unknown log format '{}', expected 'text' or 'json'", other),
    }

    Ok(())
}
