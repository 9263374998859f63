// Copyright (c) 2026 Warden Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Heartbeat Reporter
//!
//! Confirms liveness to the upstream on a fixed cadence, independently of the
//! subscription feed. Failures never stop the loop:
//!
//! - authentication/authorization failures (`HTTP 401` / `HTTP 403`) are
//!   logged at error level, since they mean the host is misconfigured
//! - anything else is transient: logged as a warning and retried after
//!   `retry_delay`
//!
//! Only the shutdown token ends the loop.

use crate::domain::host_config::HeartbeatConfig;
use crate::domain::upstream::{Heartbeat, UpstreamClient, UpstreamError};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How a heartbeat failure is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatFailure {
    /// Credentials or group binding rejected
    Fatal,
    Transient,
}

impl HeartbeatFailure {
    pub fn classify(error: &UpstreamError) -> Self {
        if error.is_auth_failure() {
            HeartbeatFailure::Fatal
        } else {
            HeartbeatFailure::Transient
        }
    }
}

pub struct HeartbeatReporter {
    upstream: Arc<dyn UpstreamClient>,
    heartbeat: Heartbeat,
    interval: Duration,
    retry_delay: Duration,
}

impl HeartbeatReporter {
    pub fn new(upstream: Arc<dyn UpstreamClient>, heartbeat: Heartbeat, config: &HeartbeatConfig) -> Self {
        Self {
            upstream,
            heartbeat,
            interval: config.interval,
            retry_delay: config.retry_delay,
        }
    }

    /// Send one heartbeat and return how long to wait before the next one.
    pub async fn beat(&self) -> Duration {
        match self.upstream.confirm_alive(&self.heartbeat).await {
            Ok(()) => {
                debug!(bot = %self.heartbeat.marketable_name, "Heartbeat confirmed");
                metrics::counter!("warden_heartbeats_total", "outcome" => "ok").increment(1);
                self.interval
            }
            Err(e) => match HeartbeatFailure::classify(&e) {
                HeartbeatFailure::Fatal => {
                    error!(
                        bot = %self.heartbeat.marketable_name,
                        version = self.heartbeat.marketable_version,
                        group_id = %self.heartbeat.group_id,
                        error = %e,
                        "Heartbeat rejected: check the API key and group id"
                    );
                    metrics::counter!("warden_heartbeats_total", "outcome" => "auth_failure").increment(1);
                    self.retry_delay
                }
                HeartbeatFailure::Transient => {
                    warn!(error = %e, retry_in_secs = self.retry_delay.as_secs(), "Heartbeat failed, will retry");
                    metrics::counter!("warden_heartbeats_total", "outcome" => "transient_failure").increment(1);
                    self.retry_delay
                }
            },
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "Heartbeat reporter started");
        loop {
            let wait = tokio::select! {
                _ = shutdown.cancelled() => break,
                wait = self.beat() => wait,
            };
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
        info!("Heartbeat reporter stopped");
    }

    pub fn spawn(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
