// Copyright (c) 2026 Warden Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Reference bot for `warden run`.
//!
//! Logs every update it receives and implements no tools. Useful to check a
//! configuration end to end before real business logic is plugged in.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};
use warden_orchestrator_core::domain::events::{MessagePayload, TaskPayload, ThreadPayload, ToolCallInvocation};
use warden_orchestrator_core::domain::handler::{BotFactory, ToolCallOutcome, WorkerHandler};
use warden_orchestrator_core::domain::persona::{PersonaConfig, PersonaId};

pub struct LoggingBot {
    persona_id: PersonaId,
}

impl LoggingBot {
    pub fn new(persona: &PersonaConfig) -> Self {
        Self {
            persona_id: persona.persona_id.clone(),
        }
    }
}

#[async_trait]
impl WorkerHandler for LoggingBot {
    fn tool_names(&self) -> BTreeSet<String> {
        BTreeSet::new()
    }

    async fn on_message_updated(&self, message: MessagePayload) -> anyhow::Result<()> {
        info!(
            persona_id = %self.persona_id,
            thread_id = %message.ftm_belongs_to_ft_id,
            alt = message.ftm_alt,
            num = message.ftm_num,
            role = %message.ftm_role,
            "Message updated"
        );
        Ok(())
    }

    async fn on_thread_updated(&self, thread: ThreadPayload) -> anyhow::Result<()> {
        info!(persona_id = %self.persona_id, thread_id = %thread.ft_id, title = %thread.ft_title, "Thread updated");
        Ok(())
    }

    async fn on_task_updated(&self, task: TaskPayload) -> anyhow::Result<()> {
        info!(
            persona_id = %self.persona_id,
            task_id = %task.ktask_id,
            column = %task.ktask_column,
            "Task updated"
        );
        Ok(())
    }

    async fn on_tool_call(
        &self,
        call: &ToolCallInvocation,
        _arguments: Map<String, Value>,
    ) -> anyhow::Result<ToolCallOutcome> {
        // unreachable in practice: the router only delivers registered tools
        warn!(persona_id = %self.persona_id, tool = %call.fcall_name, "Logging bot received a tool call");
        anyhow::bail!("logging bot implements no tools")
    }
}

pub struct LoggingBotFactory;

#[async_trait]
impl BotFactory for LoggingBotFactory {
    async fn build(&self, persona: &PersonaConfig) -> anyhow::Result<Arc<dyn WorkerHandler>> {
        info!(
            persona_id = %persona.persona_id,
            name = %persona.persona_name,
            settings = persona.settings.len(),
            "Building logging bot"
        );
        Ok(Arc::new(LoggingBot::new(persona)))
    }
}
