// Copyright (c) 2026 Warden Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Event Router
//!
//! Single reader of the upstream feed. Every envelope is mapped to a
//! [`BotEvent`] and applied to the [`WorkerRegistry`]: workers are started,
//! replaced or retired, the thread tracker is updated, and updates are pushed
//! into the owning worker's inbox.
//!
//! # Event Flow
//!
//! ```text
//! Upstream feed (one subscription epoch)
//!   |
//!   | RawEnvelope
//!   v
//! EnvelopeMapper (ACL)
//!   |
//!   | BotEvent
//!   v
//! EventRouter::route()
//!   |-- persona  -> start / replace / retire worker
//!   |-- thread   -> tracker upsert/remove, push to owner
//!   |-- message  -> tracker cache, push to owner
//!   |-- tool call-> readiness poll, tool set check, push to owner
//!   |-- task     -> task cache, push to owner
//!   v
//! re-link threads (when dirty)
//! ```
//!
//! Malformed and unrecognized envelopes are logged and skipped. Only the two
//! configuration contract violations in [`RouterError`] stop routing; after
//! one of them the router raises global shutdown and refuses further events.

use crate::application::registry::{shutdown_slots, WorkerRegistry, WorkerSlot};
use crate::application::worker::WorkerLauncher;
use crate::domain::events::{BotEvent, MessagePayload, RawEnvelope, TaskId, TaskPayload, ThreadId, ThreadPayload, ToolCallInvocation};
use crate::domain::host_config::{BotHostSpec, ThreadOverflowPolicy};
use crate::domain::inbox::WorkerInbox;
use crate::domain::persona::{PersonaConfig, PersonaId};
use crate::infrastructure::envelope_mapper::EnvelopeMapper;
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouterError {
    #[error(
        "Worker for persona {persona_id} registered tools {registered:?} but this host declares {declared:?}"
    )]
    ToolSetMismatch {
        persona_id: PersonaId,
        declared: BTreeSet<String>,
        registered: BTreeSet<String>,
    },

    #[error("Tracking {tracked} threads exceeds max_threads={max_threads}; upstream did not send STOP_TRACKING in time")]
    ThreadCapExceeded { tracked: usize, max_threads: usize },

    #[error("Router stopped after a fatal configuration error")]
    Halted,
}

#[derive(Debug, Clone)]
pub struct RouterSettings {
    /// Tools every worker must register, no more and no fewer.
    pub declared_tools: BTreeSet<String>,
    pub max_threads: usize,
    pub thread_overflow: ThreadOverflowPolicy,
    pub tool_handler_poll_attempts: u32,
    pub tool_handler_poll_interval: Duration,
}

impl From<&BotHostSpec> for RouterSettings {
    fn from(spec: &BotHostSpec) -> Self {
        Self {
            declared_tools: spec.bot.declared_tools(),
            max_threads: spec.bot.max_threads,
            thread_overflow: spec.worker.thread_overflow,
            tool_handler_poll_attempts: spec.worker.tool_handler_poll_attempts,
            tool_handler_poll_interval: spec.worker.tool_handler_poll_interval,
        }
    }
}

/// Point-in-time view of one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStatus {
    pub persona_id: PersonaId,
    pub reached_main_loop: bool,
    pub completed_initial_catchup: bool,
    pub pending: usize,
    pub known_threads: usize,
    pub task_finished: bool,
}

/// Point-in-time view of the router.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RouterStatus {
    pub epoch: u64,
    pub initial_sync_complete: bool,
    pub tracked_threads: usize,
    pub halted: bool,
    pub workers: Vec<WorkerStatus>,
}

impl RouterStatus {
    /// Every live worker has drained its inbox at least once.
    pub fn all_caught_up(&self) -> bool {
        self.workers.iter().all(|w| w.completed_initial_catchup)
    }
}

pub struct EventRouter {
    registry: WorkerRegistry,
    launcher: Arc<dyn WorkerLauncher>,
    shutdown: CancellationToken,
    settings: RouterSettings,
    epoch: u64,
    /// Personas mentioned by the current epoch's replay, until it completes.
    replay_seen: Option<HashSet<PersonaId>>,
    initial_sync_complete: bool,
    relink_dirty: bool,
    halted: bool,
}

impl EventRouter {
    pub fn new(settings: RouterSettings, launcher: Arc<dyn WorkerLauncher>, shutdown: CancellationToken) -> Self {
        Self {
            registry: WorkerRegistry::new(settings.max_threads, settings.thread_overflow),
            launcher,
            shutdown,
            settings,
            epoch: 0,
            replay_seen: None,
            initial_sync_complete: false,
            relink_dirty: false,
            halted: false,
        }
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Start a new subscription epoch.
    ///
    /// The upstream replays full state on every subscribe, so tracked threads
    /// and cached tasks are forgotten here and rebuilt from the replay.
    /// Workers keep running.
    pub fn begin_subscription(&mut self) -> u64 {
        self.epoch += 1;
        self.registry.clear_threads();
        self.registry.clear_tasks();
        self.replay_seen = Some(HashSet::new());
        self.initial_sync_complete = false;
        self.relink_dirty = false;
        info!(epoch = self.epoch, workers = self.registry.worker_count(), "Subscription epoch started");
        self.epoch
    }

    /// Map and route one raw envelope.
    pub async fn route_envelope(&mut self, raw: &RawEnvelope) -> Result<(), RouterError> {
        match EnvelopeMapper::to_domain_event(raw) {
            Ok(event) => self.route(event).await,
            Err(e) => {
                warn!(
                    about = ?raw.news_about,
                    action = ?raw.news_action,
                    payload_id = %raw.news_payload_id,
                    error = %format!("{:#}", e),
                    "Skipping malformed envelope"
                );
                metrics::counter!("warden_envelopes_dropped_total", "reason" => "malformed").increment(1);
                Ok(())
            }
        }
    }

    /// Apply one event.
    pub async fn route(&mut self, event: BotEvent) -> Result<(), RouterError> {
        if self.halted {
            return Err(RouterError::Halted);
        }

        let kind = event.kind();
        metrics::counter!("warden_envelopes_routed_total", "kind" => kind).increment(1);

        let result = self.apply(event).await;
        let result = match result {
            Ok(()) if self.relink_dirty => {
                self.relink_dirty = false;
                self.registry.enforce_thread_cap().map(|_| {
                    self.registry.relink_threads();
                })
            }
            other => other,
        };

        if let Err(e) = &result {
            self.halt(e);
        }
        result
    }

    async fn apply(&mut self, event: BotEvent) -> Result<(), RouterError> {
        match event {
            BotEvent::PersonaUpserted(persona) => self.upsert_persona(persona).await,
            BotEvent::PersonaDeleted(persona_id) => self.delete_persona(&persona_id).await,
            BotEvent::ThreadUpserted(thread) => self.upsert_thread(thread),
            BotEvent::ThreadRemoved(thread_id) => self.remove_thread(&thread_id),
            BotEvent::MessageUpserted(message) => self.upsert_message(message),
            BotEvent::MessageDeleted(id) => {
                debug!(payload_id = %id, "Ignoring message delete");
            }
            BotEvent::ToolCall(call) => return self.route_tool_call(call).await,
            BotEvent::TaskUpserted(task) => self.upsert_task(task),
            BotEvent::TaskDeleted(task_id) => self.delete_task(&task_id),
            BotEvent::InitialSyncComplete => self.complete_initial_sync().await,
            BotEvent::Supertest => debug!("Supertest envelope"),
            BotEvent::Unrecognized { about, action } => {
                warn!(about = ?about, action = ?action, "Unrecognized envelope, skipping");
                metrics::counter!("warden_envelopes_dropped_total", "reason" => "unrecognized").increment(1);
            }
        }
        Ok(())
    }

    fn halt(&mut self, error: &RouterError) {
        if self.halted {
            return;
        }
        self.halted = true;
        error!(error = %error, "Fatal configuration error, shutting down bot host");
        self.shutdown.cancel();
    }

    // --- personas ---

    async fn upsert_persona(&mut self, persona: PersonaConfig) {
        let persona_id = persona.persona_id.clone();
        if let Some(seen) = &mut self.replay_seen {
            seen.insert(persona_id.clone());
        }

        let running = self
            .registry
            .inbox(&persona_id)
            .map(|inbox| (inbox.persona().settings_differ(&persona), inbox));

        match running {
            None => {
                info!(persona_id = %persona_id, "Starting worker");
                self.start_worker(persona);
            }
            Some((false, inbox)) => inbox.replace_persona(persona),
            Some((true, _)) => {
                info!(persona_id = %persona_id, "Persona settings changed, restarting worker");
                self.retire_worker(&persona_id).await;
                self.start_worker(persona);
            }
        }
    }

    async fn delete_persona(&mut self, persona_id: &PersonaId) {
        if let Some(seen) = &mut self.replay_seen {
            seen.remove(persona_id);
        }
        info!(persona_id = %persona_id, "Persona deleted, stopping worker");
        self.retire_worker(persona_id).await;
    }

    /// Launch a worker with a fresh inbox seeded from the task cache.
    fn start_worker(&mut self, persona: PersonaConfig) {
        let persona_id = persona.persona_id.clone();
        let inbox = Arc::new(WorkerInbox::new(persona));
        for task in self.registry.tasks_of(&persona_id) {
            inbox.push_task(task);
        }

        let cancel = self.shutdown.child_token();
        let handle = self.launcher.launch(inbox.clone(), cancel.clone());
        self.registry.insert_worker(WorkerSlot::new(inbox, cancel, handle));
        self.relink_dirty = true;
    }

    /// Cancel a worker and wait until its task has ended.
    async fn retire_worker(&mut self, persona_id: &PersonaId) {
        if let Some(slot) = self.registry.remove_worker(persona_id) {
            slot.cancel_and_wait().await;
            self.relink_dirty = true;
        }
    }

    async fn complete_initial_sync(&mut self) {
        self.initial_sync_complete = true;

        if let Some(seen) = self.replay_seen.take() {
            for persona_id in self.registry.persona_ids() {
                if !seen.contains(&persona_id) {
                    info!(persona_id = %persona_id, "Persona missing from replay, stopping worker");
                    self.retire_worker(&persona_id).await;
                }
            }
        }

        let workers = self.registry.worker_count();
        if workers == 0 {
            warn!(
                epoch = self.epoch,
                "Initial sync complete but no personas are installed; check the group id and bot name/version"
            );
        } else {
            info!(epoch = self.epoch, workers, tracked_threads = self.registry.tracked_threads(), "Initial sync complete");
        }
    }

    // --- threads and messages ---

    fn upsert_thread(&mut self, thread: ThreadPayload) {
        let owner = thread.ft_persona_id.clone();
        if let Some(previous) = self.registry.upsert_thread(thread.clone()) {
            debug!(thread_id = %thread.ft_id, from = %previous, to = %owner, "Thread changed owner");
        }
        if let Some(inbox) = self.registry.inbox(&owner) {
            inbox.push_thread(thread);
        }
        self.relink_dirty = true;
    }

    fn remove_thread(&mut self, thread_id: &ThreadId) {
        if self.registry.remove_thread(thread_id).is_some() {
            debug!(thread_id = %thread_id, "Stopped tracking thread");
        }
        self.relink_dirty = true;
    }

    fn upsert_message(&mut self, message: MessagePayload) {
        match self.registry.track_message(&message) {
            Some(owner) => {
                if let Some(inbox) = self.registry.inbox(&owner) {
                    inbox.push_message(message);
                }
            }
            None => {
                debug!(
                    thread_id = %message.ftm_belongs_to_ft_id,
                    alt = message.ftm_alt,
                    num = message.ftm_num,
                    "Message for untracked thread dropped"
                );
                metrics::counter!("warden_envelopes_dropped_total", "reason" => "untracked_thread").increment(1);
            }
        }
    }

    // --- tasks ---

    fn upsert_task(&mut self, task: TaskPayload) {
        if let Some(previous) = self.registry.record_task(&task) {
            if let Some(inbox) = self.registry.inbox(&previous) {
                inbox.forget_task(&task.ktask_id);
            }
        }
        if let Some(inbox) = self.registry.inbox(&task.ktask_persona_id) {
            inbox.push_task(task);
        }
    }

    fn delete_task(&mut self, task_id: &TaskId) {
        if let Some(owner) = self.registry.forget_task(task_id) {
            if let Some(inbox) = self.registry.inbox(&owner) {
                inbox.forget_task(task_id);
            }
        }
    }

    // --- tool calls ---

    async fn route_tool_call(&mut self, call: ToolCallInvocation) -> Result<(), RouterError> {
        let persona_id = call.connected_persona_id.clone();
        let Some(inbox) = self.registry.inbox(&persona_id) else {
            warn!(persona_id = %persona_id, fcall_id = %call.fcall_id, tool = %call.fcall_name, "Tool call for persona without a worker dropped");
            metrics::counter!("warden_envelopes_dropped_total", "reason" => "no_worker").increment(1);
            return Ok(());
        };

        if !self.wait_until_ready(&inbox).await {
            warn!(
                persona_id = %persona_id,
                fcall_id = %call.fcall_id,
                tool = %call.fcall_name,
                attempts = self.settings.tool_handler_poll_attempts,
                "Worker did not register its tools in time, tool call dropped"
            );
            metrics::counter!("warden_envelopes_dropped_total", "reason" => "worker_not_ready").increment(1);
            return Ok(());
        }

        let registered = inbox.registered_tools().unwrap_or_default();
        if registered != self.settings.declared_tools {
            return Err(RouterError::ToolSetMismatch {
                persona_id,
                declared: self.settings.declared_tools.clone(),
                registered,
            });
        }

        if !registered.contains(&call.fcall_name) {
            warn!(persona_id = %persona_id, fcall_id = %call.fcall_id, tool = %call.fcall_name, "Tool call for a tool this host does not implement dropped");
            metrics::counter!("warden_envelopes_dropped_total", "reason" => "unknown_tool").increment(1);
            return Ok(());
        }

        debug!(persona_id = %persona_id, fcall_id = %call.fcall_id, tool = %call.fcall_name, "Dispatching tool call");
        metrics::counter!("warden_tool_calls_dispatched_total").increment(1);
        inbox.push_tool_call(call);
        Ok(())
    }

    /// Poll until the worker reached its drain loop with its tools registered.
    async fn wait_until_ready(&self, inbox: &WorkerInbox) -> bool {
        let mut attempts = 0;
        while !(inbox.reached_main_loop() && inbox.registered_tools().is_some()) {
            if attempts >= self.settings.tool_handler_poll_attempts {
                return false;
            }
            attempts += 1;
            tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                _ = tokio::time::sleep(self.settings.tool_handler_poll_interval) => {}
            }
        }
        true
    }

    // --- status and shutdown ---

    pub fn status(&self) -> RouterStatus {
        let mut workers: Vec<_> = self
            .registry
            .workers()
            .map(|slot| WorkerStatus {
                persona_id: slot.persona_id().clone(),
                reached_main_loop: slot.inbox.reached_main_loop(),
                completed_initial_catchup: slot.inbox.completed_initial_catchup(),
                pending: slot.inbox.pending_len(),
                known_threads: slot.known_threads.len(),
                task_finished: slot.is_finished(),
            })
            .collect();
        workers.sort_by(|a, b| a.persona_id.cmp(&b.persona_id));

        RouterStatus {
            epoch: self.epoch,
            initial_sync_complete: self.initial_sync_complete,
            tracked_threads: self.registry.tracked_threads(),
            halted: self.halted,
            workers,
        }
    }

    /// Stop every worker, waiting at most `grace`. Returns how many had to be aborted.
    pub async fn shutdown_workers(&mut self, grace: Duration) -> usize {
        let slots = self.registry.drain_workers();
        if slots.is_empty() {
            return 0;
        }
        info!(workers = slots.len(), "Stopping workers");
        shutdown_slots(slots, grace).await
    }
}
