// Copyright (c) 2026 Warden Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Worker Drain Loop
//!
//! One worker per persona. The worker's main loop builds the persona's
//! business handler, publishes the tools it implements, then drains its
//! inbox over and over:
//!
//! ```text
//! unpark()
//!   ├─ mark reached_main_loop
//!   ├─ clear wake
//!   ├─ messages → threads → tasks   (each call isolated)
//!   ├─ tool calls, arrival order    (sequential or spawned)
//!   └─ nothing processed? mark caught up, wait for wake ≤ idle_timeout
//! ```
//!
//! # Architecture
//!
//! - **Layer:** Application
//! - **Purpose:** Consume one inbox and translate handler outcomes into tool results

use crate::domain::events::ToolCallInvocation;
use crate::domain::handler::{BotFactory, ToolCallOutcome, WorkerHandler};
use crate::domain::host_config::{ToolCallMode, WorkerConfig};
use crate::domain::inbox::WorkerInbox;
use crate::domain::persona::PersonaId;
use crate::domain::supervisor::WorkerSupervisor;
use crate::domain::upstream::UpstreamClient;
use anyhow::Context;
use futures::FutureExt;
use serde_json::{Map, Value};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Result posted back when a tool handler fails. Deliberately carries no detail.
pub const GENERIC_TOOL_FAILURE: &str =
    "Error: the tool failed unexpectedly. The failure was logged for the bot operator.";

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub idle_timeout: Duration,
    pub tool_call_mode: ToolCallMode,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from(&WorkerConfig::default())
    }
}

impl From<&WorkerConfig> for WorkerSettings {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            idle_timeout: config.idle_timeout,
            tool_call_mode: config.tool_call_mode,
        }
    }
}

/// What one drain tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub messages: usize,
    pub threads: usize,
    pub tasks: usize,
    pub tool_calls: usize,
    /// The tick found nothing and waited on the wake signal.
    pub idle: bool,
    /// The idle wait ended because of a wake rather than the timeout.
    pub woken: bool,
}

impl DrainReport {
    pub fn processed(&self) -> usize {
        self.messages + self.threads + self.tasks + self.tool_calls
    }
}

pub struct WorkerLoop {
    inbox: Arc<WorkerInbox>,
    handler: Arc<dyn WorkerHandler>,
    upstream: Arc<dyn UpstreamClient>,
    settings: WorkerSettings,
    cancel: CancellationToken,
}

impl WorkerLoop {
    pub fn new(
        inbox: Arc<WorkerInbox>,
        handler: Arc<dyn WorkerHandler>,
        upstream: Arc<dyn UpstreamClient>,
        settings: WorkerSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inbox,
            handler,
            upstream,
            settings,
            cancel,
        }
    }

    /// Drain ticks until cancelled.
    pub async fn run(&self) -> anyhow::Result<()> {
        info!(persona_id = %self.inbox.persona_id(), "Worker entered main loop");
        while !self.cancel.is_cancelled() {
            self.unpark().await;
        }
        Ok(())
    }

    /// One drain tick.
    pub async fn unpark(&self) -> DrainReport {
        self.inbox.mark_reached_main_loop();
        self.inbox.clear_wake();

        let persona_id = self.inbox.persona_id();
        let batch = self.inbox.take_all();
        let mut report = DrainReport {
            messages: batch.messages.len(),
            threads: batch.threads.len(),
            tasks: batch.tasks.len(),
            tool_calls: batch.tool_calls.len(),
            ..DrainReport::default()
        };

        for message in batch.messages {
            let key = message.key().to_string();
            isolated(persona_id, "message", &key, self.handler.on_message_updated(message)).await;
        }

        for thread in batch.threads {
            let thread_id = thread.ft_id.to_string();
            isolated(persona_id, "thread", &thread_id, self.handler.on_thread_updated(thread)).await;
        }

        for task in batch.tasks {
            let task_id = task.ktask_id.to_string();
            isolated(persona_id, "task", &task_id, self.handler.on_task_updated(task)).await;
        }

        for call in batch.tool_calls {
            match self.settings.tool_call_mode {
                ToolCallMode::Sequential => {
                    dispatch_tool_call(self.handler.as_ref(), self.upstream.as_ref(), persona_id, &call).await;
                }
                ToolCallMode::Concurrent => {
                    let handler = self.handler.clone();
                    let upstream = self.upstream.clone();
                    let cancel = self.cancel.clone();
                    let persona_id = persona_id.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                debug!(persona_id = %persona_id, fcall_id = %call.fcall_id, "Tool call abandoned on worker cancellation");
                            }
                            _ = dispatch_tool_call(handler.as_ref(), upstream.as_ref(), &persona_id, &call) => {}
                        }
                    });
                }
            }
        }

        if report.processed() == 0 {
            self.inbox.mark_completed_initial_catchup();
            report.idle = true;
            report.woken = self.inbox.wait_for_wake(self.settings.idle_timeout).await;
        } else {
            debug!(
                persona_id = %persona_id,
                messages = report.messages,
                threads = report.threads,
                tasks = report.tasks,
                tool_calls = report.tool_calls,
                "Drain tick processed updates"
            );
        }

        report
    }
}

/// Run one entity handler; failures and panics are logged and swallowed.
async fn isolated<F>(persona_id: &PersonaId, entity: &'static str, entity_id: &str, fut: F)
where
    F: Future<Output = anyhow::Result<()>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!(persona_id = %persona_id, entity, entity_id, error = %format!("{:#}", e), "Update handler failed");
            metrics::counter!("warden_handler_failures_total", "entity" => entity).increment(1);
        }
        Err(_) => {
            error!(persona_id = %persona_id, entity, entity_id, "Update handler panicked");
            metrics::counter!("warden_handler_failures_total", "entity" => entity).increment(1);
        }
    }
}

/// Execute one tool call and post its result, if one is owed.
pub async fn dispatch_tool_call(
    handler: &dyn WorkerHandler,
    upstream: &dyn UpstreamClient,
    persona_id: &PersonaId,
    call: &ToolCallInvocation,
) {
    let Some(content) = execute_tool_call(handler, persona_id, call).await else {
        return;
    };

    if let Err(e) = upstream.post_tool_result(call, &content).await {
        warn!(
            persona_id = %persona_id,
            fcall_id = %call.fcall_id,
            tool = %call.fcall_name,
            error = %e,
            "Failed to post tool result"
        );
    }
}

/// Returns the text to post back, or `None` when the handler owns the reply.
pub async fn execute_tool_call(
    handler: &dyn WorkerHandler,
    persona_id: &PersonaId,
    call: &ToolCallInvocation,
) -> Option<String> {
    let arguments = match parse_arguments(&call.fcall_arguments) {
        Ok(arguments) => arguments,
        Err(problem) => {
            info!(
                persona_id = %persona_id,
                fcall_id = %call.fcall_id,
                tool = %call.fcall_name,
                problem = %problem,
                "Rejected tool call with malformed arguments"
            );
            metrics::counter!("warden_tool_calls_total", "outcome" => "bad_arguments").increment(1);
            return Some(format!("Error: {}", problem));
        }
    };

    let outcome = AssertUnwindSafe(handler.on_tool_call(call, arguments))
        .catch_unwind()
        .await;

    let (label, reply) = match outcome {
        Ok(Ok(ToolCallOutcome::Immediate(Value::String(text)))) => ("immediate", Some(text)),
        Ok(Ok(ToolCallOutcome::Immediate(other))) => {
            error!(
                persona_id = %persona_id,
                fcall_id = %call.fcall_id,
                tool = %call.fcall_name,
                returned = json_kind(&other),
                "Tool handler returned a non-string result"
            );
            (
                "contract_violation",
                Some(format!(
                    "Error: tool '{}' produced {} instead of text; this is a bug in the bot",
                    call.fcall_name,
                    json_kind(&other)
                )),
            )
        }
        Ok(Ok(ToolCallOutcome::Deferred)) => {
            debug!(persona_id = %persona_id, fcall_id = %call.fcall_id, "Tool call deferred for confirmation");
            ("deferred", None)
        }
        Ok(Ok(ToolCallOutcome::AlreadyPosted)) => ("already_posted", None),
        Ok(Err(e)) => {
            error!(
                persona_id = %persona_id,
                fcall_id = %call.fcall_id,
                tool = %call.fcall_name,
                error = %format!("{:#}", e),
                "Tool handler failed"
            );
            ("failed", Some(GENERIC_TOOL_FAILURE.to_string()))
        }
        Err(_) => {
            error!(
                persona_id = %persona_id,
                fcall_id = %call.fcall_id,
                tool = %call.fcall_name,
                "Tool handler panicked"
            );
            ("panicked", Some(GENERIC_TOOL_FAILURE.to_string()))
        }
    };

    metrics::counter!("warden_tool_calls_total", "outcome" => label).increment(1);
    reply
}

fn parse_arguments(raw: &str) -> Result<Map<String, Value>, String> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(format!(
            "tool arguments must be a JSON object, got {}",
            json_kind(&other)
        )),
        Err(e) => Err(format!("tool arguments are not valid JSON: {}", e)),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Starts the supervised task for one worker.
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, inbox: Arc<WorkerInbox>, cancel: CancellationToken) -> JoinHandle<()>;
}

/// Default launcher: `WorkerSupervisor` around a `BotFactory`-built `WorkerLoop`.
pub struct SupervisedWorkerLauncher {
    factory: Arc<dyn BotFactory>,
    upstream: Arc<dyn UpstreamClient>,
    supervisor: Arc<WorkerSupervisor>,
    settings: WorkerSettings,
}

impl SupervisedWorkerLauncher {
    pub fn new(
        factory: Arc<dyn BotFactory>,
        upstream: Arc<dyn UpstreamClient>,
        supervisor: Arc<WorkerSupervisor>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            factory,
            upstream,
            supervisor,
            settings,
        }
    }
}

impl WorkerLauncher for SupervisedWorkerLauncher {
    fn launch(&self, inbox: Arc<WorkerInbox>, cancel: CancellationToken) -> JoinHandle<()> {
        let factory = self.factory.clone();
        let upstream = self.upstream.clone();
        let supervisor = self.supervisor.clone();
        let settings = self.settings.clone();

        tokio::spawn(async move {
            let persona_id = inbox.persona_id().clone();
            supervisor
                .supervise(&persona_id, cancel.clone(), || {
                    run_worker(
                        factory.clone(),
                        upstream.clone(),
                        inbox.clone(),
                        settings.clone(),
                        cancel.clone(),
                    )
                })
                .await;
        })
    }
}

/// Body of one supervised run.
async fn run_worker(
    factory: Arc<dyn BotFactory>,
    upstream: Arc<dyn UpstreamClient>,
    inbox: Arc<WorkerInbox>,
    settings: WorkerSettings,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let persona = inbox.persona();
    let handler = factory
        .build(&persona)
        .await
        .with_context(|| format!("Failed to build handler for persona {}", persona.persona_id))?;

    inbox.register_tools(handler.tool_names());
    WorkerLoop::new(inbox, handler, upstream, settings, cancel).run().await
}
