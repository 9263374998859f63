// Copyright (c) 2026 Warden Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use warden_orchestrator_core::domain::host_config::BotHostManifest;
use warden_orchestrator_core::domain::supervisor::RestartPolicy;

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,

        /// Print the effective configuration as YAML
        #[arg(long)]
        yaml: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate sample configuration
    Generate {
        /// Output path (default: ./warden-config.yaml)
        #[arg(short, long, default_value = "./warden-config.yaml")]
        output: PathBuf,

        /// Include examples and comments
        #[arg(long)]
        examples: bool,
    },
}

pub async fn handle_command(
    command: ConfigCommand,
    config_override: Option<PathBuf>,
) -> Result<()> {
    match command {
        ConfigCommand::Show { paths, yaml } => show(config_override, paths, yaml).await,
        ConfigCommand::Validate { file } => validate(file.or(config_override)).await,
        ConfigCommand::Generate { output, examples } => generate(output, examples).await,
    }
}

async fn show(config_override: Option<PathBuf>, show_paths: bool, as_yaml: bool) -> Result<()> {
    let config = BotHostManifest::load_or_default(config_override.clone())
        .context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        if let Some(path) = &config_override {
            println!("  1. --config flag: {}", path.display());
        } else {
            println!("  1. --config flag: {}", "(not set)".dimmed());
        }
        println!(
            "  2. WARDEN_CONFIG_PATH: {}",
            std::env::var("WARDEN_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./warden-config.yaml");
        println!("  4. ~/.warden/config.yaml");
        println!("  5. /etc/warden/config.yaml");
        println!();
    }

    if as_yaml {
        let yaml = serde_yaml::to_string(&config).context("Failed to render configuration")?;
        print!("{}", yaml);
        return Ok(());
    }

    let spec = &config.spec;
    println!("{}", "Current configuration:".bold());
    println!();

    println!("{}", "Host:".bold());
    println!("  Name: {}", config.metadata.name);
    if let Some(version) = &config.metadata.version {
        println!("  Version: {}", version);
    }
    println!();

    println!("{}", "Upstream:".bold());
    println!("  Endpoint: {}", spec.upstream.endpoint);
    println!(
        "  API key: {}",
        match spec.upstream.api_key.as_deref() {
            Some(key) if key.starts_with("env:") => key.to_string(),
            Some(_) => "(inline, hidden)".to_string(),
            None => "(none)".to_string(),
        }
    );
    println!("  Request timeout: {:?}", spec.upstream.request_timeout);
    println!();

    println!("{}", "Bot:".bold());
    println!("  Marketable name: {}", spec.bot.marketable_name);
    println!("  Marketable version: {}", spec.bot.marketable_version);
    println!("  Group: {}", spec.bot.group_id);
    println!("  Max threads: {}", spec.bot.max_threads);
    println!("  Tools: {}", spec.bot.tools.len());
    for tool in &spec.bot.tools {
        println!("    - {}", tool);
    }
    println!();

    println!("{}", "Workers:".bold());
    println!("  Idle timeout: {:?}", spec.worker.idle_timeout);
    println!("  Tool call mode: {:?}", spec.worker.tool_call_mode);
    match &spec.worker.restart {
        RestartPolicy::Fixed { cooldown } => println!("  Restart: fixed, {:?}", cooldown),
        RestartPolicy::Backoff {
            cooldown,
            max_cooldown,
        } => println!("  Restart: backoff, {:?} up to {:?}", cooldown, max_cooldown),
    }
    println!("  Thread overflow: {:?}", spec.worker.thread_overflow);
    println!();

    println!("{}", "Heartbeat:".bold());
    if spec.heartbeat.enabled {
        println!("  Interval: {:?}", spec.heartbeat.interval);
        println!("  Retry delay: {:?}", spec.heartbeat.retry_delay);
    } else {
        println!("  {}", "disabled".dimmed());
    }
    println!();

    Ok(())
}

async fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = BotHostManifest::load_or_default(config_path)
        .context("Failed to load configuration")?;

    config
        .validate()
        .context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());

    Ok(())
}

async fn generate(output: PathBuf, with_examples: bool) -> Result<()> {
    let sample = if with_examples {
        include_str!("../../../templates/config-with-examples.yaml")
    } else {
        include_str!("../../../templates/config-minimal.yaml")
    };

    std::fs::write(&output, sample)
        .with_context(|| format!("Failed to write config to {:?}", output))?;

    println!(
        "{}",
        format!("✓ Configuration generated: {}", output.display()).green()
    );

    Ok(())
}
