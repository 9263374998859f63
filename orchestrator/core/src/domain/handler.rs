// Copyright (c) 2026 Warden Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Business Logic Seam
//!
//! The engine knows nothing about what a bot actually does. Business code
//! implements [`WorkerHandler`] for one persona and a [`BotFactory`] that
//! builds one handler per supervised run of a worker.
//!
//! # Architecture
//!
//! - **Layer:** Domain
//! - **Purpose:** Ports implemented by bot business logic, injected at worker construction

use crate::domain::events::{MessagePayload, TaskPayload, ThreadPayload, ToolCallInvocation};
use crate::domain::persona::PersonaConfig;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;

/// What a tool handler produced.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolCallOutcome {
    /// Post this value back as the call result. Must be a JSON string.
    Immediate(Value),
    /// The handler asked a human for confirmation; the result comes later.
    Deferred,
    /// The handler already wrote its result through another channel.
    AlreadyPosted,
}

impl ToolCallOutcome {
    pub fn text(content: impl Into<String>) -> Self {
        ToolCallOutcome::Immediate(Value::String(content.into()))
    }
}

#[async_trait]
pub trait WorkerHandler: Send + Sync {
    /// Names of the tools this handler implements.
    fn tool_names(&self) -> BTreeSet<String>;

    async fn on_message_updated(&self, message: MessagePayload) -> anyhow::Result<()>;

    async fn on_thread_updated(&self, thread: ThreadPayload) -> anyhow::Result<()>;

    async fn on_task_updated(&self, task: TaskPayload) -> anyhow::Result<()>;

    /// Execute a tool call whose arguments already parsed as a JSON object.
    async fn on_tool_call(
        &self,
        call: &ToolCallInvocation,
        arguments: Map<String, Value>,
    ) -> anyhow::Result<ToolCallOutcome>;
}

#[async_trait]
pub trait BotFactory: Send + Sync {
    /// Build the handler for one run of a persona's worker.
    ///
    /// Called again after every crash, so it may re-read external state.
    async fn build(&self, persona: &PersonaConfig) -> anyhow::Result<Arc<dyn WorkerHandler>>;
}
