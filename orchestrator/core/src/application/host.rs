// Copyright (c) 2026 Warden Contributors
// SPDX-License-Identifier: AGPL-3.0

//! # Bot Host
//!
//! Top-level wiring for one bot host process.
//!
//! ```text
//! BotHost::run()
//!   ├─ HeartbeatReporter            (own task)
//!   └─ subscription loop
//!        ├─ subscribe → new router epoch
//!        ├─ route every envelope, publish status
//!        ├─ feed ends / transport error → wait reconnect_delay, resubscribe
//!        └─ fatal RouterError → global shutdown, return error
//! shutdown: cancel root token → every worker's child token, bounded join
//! ```
//!
//! # Architecture
//!
//! - **Layer:** Application
//! - **Purpose:** Own the global cancellation token and the lifetime of every task

use crate::application::event_router::{EventRouter, RouterError, RouterSettings, RouterStatus};
use crate::application::heartbeat::HeartbeatReporter;
use crate::application::worker::{SupervisedWorkerLauncher, WorkerSettings};
use crate::domain::handler::BotFactory;
use crate::domain::host_config::BotHostSpec;
use crate::domain::supervisor::{MetricsSupervisorObserver, SupervisorObserver, WorkerSupervisor};
use crate::domain::upstream::{SubscriptionParams, UpstreamClient, UpstreamError};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Status is also republished on this cadence while the feed is quiet, so
/// worker progress shows up without new envelopes.
const STATUS_REFRESH_INTERVAL: Duration = Duration::from_millis(500);

pub struct BotHost {
    spec: BotHostSpec,
    upstream: Arc<dyn UpstreamClient>,
    factory: Arc<dyn BotFactory>,
    observer: Arc<dyn SupervisorObserver>,
    shutdown: CancellationToken,
    status: watch::Sender<RouterStatus>,
}

impl BotHost {
    pub fn new(spec: BotHostSpec, upstream: Arc<dyn UpstreamClient>, factory: Arc<dyn BotFactory>) -> Self {
        let (status, _) = watch::channel(RouterStatus::default());
        Self {
            spec,
            upstream,
            factory,
            observer: Arc::new(MetricsSupervisorObserver),
            shutdown: CancellationToken::new(),
            status,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn SupervisorObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Token whose cancellation stops the whole host.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Request shutdown; `run` returns once workers are stopped.
    pub fn shutdown(&self) {
        info!("Shutdown requested");
        self.shutdown.cancel();
    }

    /// Latest status snapshot, refreshed after every routed envelope.
    pub fn status(&self) -> RouterStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<RouterStatus> {
        self.status.subscribe()
    }

    /// Run until shutdown or a fatal configuration error.
    pub async fn run(&self) -> Result<(), RouterError> {
        let supervisor = Arc::new(WorkerSupervisor::new(
            self.spec.worker.restart.clone(),
            self.observer.clone(),
        ));
        let launcher = Arc::new(SupervisedWorkerLauncher::new(
            self.factory.clone(),
            self.upstream.clone(),
            supervisor,
            WorkerSettings::from(&self.spec.worker),
        ));
        let mut router = EventRouter::new(RouterSettings::from(&self.spec), launcher, self.shutdown.clone());

        let heartbeat = self.spec.heartbeat.enabled.then(|| {
            HeartbeatReporter::new(self.upstream.clone(), self.spec.bot.heartbeat(), &self.spec.heartbeat)
                .spawn(self.shutdown.clone())
        });

        info!(
            bot = %self.spec.bot.marketable_name,
            version = self.spec.bot.marketable_version,
            group_id = %self.spec.bot.group_id,
            tools = ?self.spec.bot.tools,
            "Bot host starting"
        );

        let params = self.spec.bot.subscription_params();
        let result = self.subscription_loop(&mut router, &params).await;

        self.shutdown.cancel();
        let grace = self.spec.subscription.shutdown_grace;
        let aborted = router.shutdown_workers(grace).await;
        if aborted > 0 {
            warn!(aborted, "Some workers had to be aborted during shutdown");
        }
        if let Some(handle) = heartbeat {
            if tokio::time::timeout(grace, handle).await.is_err() {
                warn!("Heartbeat reporter did not stop in time");
            }
        }
        self.status.send_replace(router.status());

        match &result {
            Ok(()) => info!("Bot host stopped"),
            Err(e) => error!(error = %e, "Bot host stopped on fatal error"),
        }
        result
    }

    async fn subscription_loop(
        &self,
        router: &mut EventRouter,
        params: &SubscriptionParams,
    ) -> Result<(), RouterError> {
        loop {
            let subscribed = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                subscribed = self.upstream.subscribe(params) => subscribed,
            };

            match subscribed {
                Ok(mut feed) => {
                    let epoch = router.begin_subscription();
                    metrics::counter!("warden_subscriptions_total").increment(1);
                    self.status.send_replace(router.status());
                    let mut refresh = tokio::time::interval(STATUS_REFRESH_INTERVAL);

                    loop {
                        let next = tokio::select! {
                            biased;
                            _ = self.shutdown.cancelled() => return Ok(()),
                            next = feed.next() => next,
                            _ = refresh.tick() => {
                                self.status.send_replace(router.status());
                                continue;
                            }
                        };

                        match next {
                            Some(Ok(raw)) => {
                                router.route_envelope(&raw).await?;
                                self.status.send_replace(router.status());
                            }
                            Some(Err(UpstreamError::Protocol(problem))) => {
                                warn!(epoch, problem = %problem, "Skipping unreadable feed line");
                            }
                            Some(Err(e)) => {
                                warn!(epoch, error = %e, "Subscription feed failed");
                                break;
                            }
                            None => {
                                warn!(epoch, "Subscription feed ended");
                                break;
                            }
                        }
                    }
                }
                Err(e) if e.is_auth_failure() => {
                    error!(error = %e, "Subscription rejected: check the API key and group id");
                }
                Err(e) => {
                    warn!(error = %e, "Subscribe failed");
                }
            }

            let delay = self.spec.subscription.reconnect_delay;
            debug!(delay_ms = delay.as_millis() as u64, "Reconnecting after delay");
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
