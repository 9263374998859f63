// Copyright (c) 2026 Warden Contributors
// SPDX-License-Identifier: AGPL-3.0

//! `warden run`: host the logging bot until interrupted.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

use warden_orchestrator_core::application::host::BotHost;
use warden_orchestrator_core::domain::host_config::BotHostManifest;
use warden_orchestrator_core::infrastructure::upstream_http::HttpUpstreamClient;

use crate::bot::LoggingBotFactory;

#[derive(Args)]
pub struct RunCommand {
    /// Override the target group id
    #[arg(long)]
    group_id: Option<String>,

    /// Skip heartbeats (useful against a local upstream mock)
    #[arg(long)]
    no_heartbeat: bool,
}

pub async fn execute(command: RunCommand, config_override: Option<PathBuf>) -> Result<()> {
    let mut config = BotHostManifest::load_or_default(config_override)
        .context("Failed to load configuration")?;

    if let Some(group_id) = command.group_id {
        config.spec.bot.group_id = group_id;
    }
    if command.no_heartbeat {
        config.spec.heartbeat.enabled = false;
    }

    // the logging bot registers no tools, so none may be declared
    if !config.spec.bot.tools.is_empty() {
        warn!(
            tools = ?config.spec.bot.tools,
            "Configured tools are ignored: the logging bot implements none"
        );
        config.spec.bot.tools.clear();
    }

    config
        .validate()
        .context("Configuration validation failed")?;

    let upstream = HttpUpstreamClient::from_config(&config.spec.upstream)
        .context("Failed to build upstream client")?;
    info!(endpoint = %upstream.endpoint(), host = %config.metadata.name, "Connecting to upstream");

    let host = Arc::new(BotHost::new(
        config.spec.clone(),
        Arc::new(upstream),
        Arc::new(LoggingBotFactory),
    ));

    let signals = {
        let host = host.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            host.shutdown();
        })
    };

    let result = host.run().await;
    signals.abort();

    match result {
        Ok(()) => {
            println!("{}", "✓ Bot host stopped".green());
            Ok(())
        }
        Err(e) => Err(anyhow::Error::new(e).context("Bot host stopped on a fatal configuration error")),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
