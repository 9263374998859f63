// Copyright (c) 2026 Warden Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Worker Supervisor Domain Service
//!
//! Keeps one persona's worker main loop alive until shutdown:
//!
//! | Main loop outcome | Action |
//! |-------------------|--------|
//! | cancelled (shutdown / replace / delete) | stop, no restart |
//! | returned `Ok(())` | logged as unexpected, restart after delay |
//! | returned `Err(_)` | logged with full chain, restart after delay |
//! | panicked | panic message logged, restart after delay |
//!
//! There is no retry limit. A persistently crashing worker keeps retrying at
//! the cadence the [`RestartPolicy`] dictates; nothing escapes to the caller
//! and no other worker is affected.

use crate::domain::persona::PersonaId;
use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How long to wait before restarting a worker whose main loop exited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum RestartPolicy {
    /// Always wait `cooldown`.
    Fixed {
        #[serde(with = "humantime_serde")]
        cooldown: Duration,
    },
    /// Double from `cooldown` up to `max_cooldown`; a run that stayed up longer
    /// than `max_cooldown` resets the delay.
    Backoff {
        #[serde(with = "humantime_serde")]
        cooldown: Duration,
        #[serde(with = "humantime_serde")]
        max_cooldown: Duration,
    },
}

impl Default for RestartPolicy {
    fn default() -> Self {
        RestartPolicy::Fixed {
            cooldown: Duration::from_secs(30),
        }
    }
}

impl RestartPolicy {
    /// Delay before restart number `consecutive_failures` (1-based).
    pub fn delay(&self, consecutive_failures: u32) -> Duration {
        match self {
            RestartPolicy::Fixed { cooldown } => *cooldown,
            RestartPolicy::Backoff { cooldown, max_cooldown } => {
                let exp = consecutive_failures.saturating_sub(1).min(16);
                cooldown.saturating_mul(1u32 << exp).min(*max_cooldown)
            }
        }
    }

    fn resets_after(&self, uptime: Duration) -> bool {
        match self {
            RestartPolicy::Fixed { .. } => false,
            RestartPolicy::Backoff { max_cooldown, .. } => uptime > *max_cooldown,
        }
    }
}

/// How a single supervised run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunExit {
    Returned,
    Failed(String),
    Panicked(String),
}

#[async_trait]
pub trait SupervisorObserver: Send + Sync {
    async fn on_run_started(&self, persona_id: &PersonaId, attempt: u64);
    async fn on_run_exited(&self, persona_id: &PersonaId, attempt: u64, exit: &RunExit, restart_in: Duration);
}

/// Default observer: counts starts and restarts.
pub struct MetricsSupervisorObserver;

#[async_trait]
impl SupervisorObserver for MetricsSupervisorObserver {
    async fn on_run_started(&self, _persona_id: &PersonaId, attempt: u64) {
        if attempt > 1 {
            metrics::counter!("warden_worker_restarts_total").increment(1);
        }
    }

    async fn on_run_exited(&self, _persona_id: &PersonaId, _attempt: u64, exit: &RunExit, _restart_in: Duration) {
        let outcome = match exit {
            RunExit::Returned => "returned",
            RunExit::Failed(_) => "failed",
            RunExit::Panicked(_) => "panicked",
        };
        metrics::counter!("warden_worker_exits_total", "outcome" => outcome).increment(1);
    }
}

pub struct WorkerSupervisor {
    policy: RestartPolicy,
    observer: Arc<dyn SupervisorObserver>,
}

impl WorkerSupervisor {
    pub fn new(policy: RestartPolicy, observer: Arc<dyn SupervisorObserver>) -> Self {
        Self { policy, observer }
    }

    pub fn policy(&self) -> &RestartPolicy {
        &self.policy
    }

    /// Run `main_loop` again and again until `shutdown` fires.
    ///
    /// The main loop future is dropped at its next suspension point once
    /// `shutdown` is cancelled, so cancellation never triggers a restart.
    pub async fn supervise<F, Fut>(&self, persona_id: &PersonaId, shutdown: CancellationToken, mut main_loop: F)
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = anyhow::Result<()>> + Send,
    {
        let mut attempt: u64 = 0;
        let mut consecutive_failures: u32 = 0;

        loop {
            attempt += 1;
            self.observer.on_run_started(persona_id, attempt).await;
            let started = Instant::now();

            let outcome = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(persona_id = %persona_id, attempt, "Worker cancelled");
                    return;
                }
                outcome = AssertUnwindSafe(main_loop()).catch_unwind() => outcome,
            };

            let exit = match outcome {
                Ok(Ok(())) => {
                    warn!(persona_id = %persona_id, attempt, "Worker main loop returned without shutdown");
                    RunExit::Returned
                }
                Ok(Err(e)) => {
                    error!(persona_id = %persona_id, attempt, error = %format!("{:#}", e), "Worker main loop failed");
                    RunExit::Failed(format!("{:#}", e))
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!(persona_id = %persona_id, attempt, panic = %message, "Worker main loop panicked");
                    RunExit::Panicked(message)
                }
            };

            if shutdown.is_cancelled() {
                return;
            }

            if self.policy.resets_after(started.elapsed()) {
                consecutive_failures = 0;
            }
            consecutive_failures = consecutive_failures.saturating_add(1);
            let delay = self.policy.delay(consecutive_failures);
            self.observer.on_run_exited(persona_id, attempt, &exit, delay).await;
            info!(persona_id = %persona_id, delay_ms = delay.as_millis() as u64, "Restarting worker after cooldown");

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(persona_id = %persona_id, "Worker cancelled during cooldown");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
