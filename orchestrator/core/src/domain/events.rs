// Copyright (c) 2026 Warden Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Upstream Feed Events
//!
//! Types for the single server-push feed the bot host subscribes to.
//!
//! - [`RawEnvelope`] is the wire shape, one per pushed update.
//! - [`BotEvent`] is the typed domain event the router works with; the
//!   translation lives in `infrastructure::envelope_mapper`.
//! - Payload structs keep every field they do not interpret in `extra`, so
//!   business handlers see exactly what the upstream sent.

use crate::domain::persona::{PersonaConfig, PersonaId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// What happened to the entity an envelope is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NewsAction {
    Insert,
    Update,
    Delete,
    Call,
    StopTracking,
    InitialUpdatesOver,
    Supertest,
    #[serde(other)]
    Unknown,
}

/// Which kind of entity an envelope is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NewsAbout {
    Persona,
    Thread,
    ThreadMessage,
    ToolCall,
    KanbanTask,
    #[serde(other)]
    Unknown,
}

/// One pushed update exactly as it arrives on the subscription stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEnvelope {
    pub news_action: NewsAction,

    /// Absent on envelopes that are not about an entity (INITIAL_UPDATES_OVER)
    #[serde(default = "unknown_about")]
    pub news_about: NewsAbout,

    #[serde(default)]
    pub news_payload_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub news_payload_persona: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub news_payload_thread: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub news_payload_thread_message: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub news_payload_tool_call: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub news_payload_kanban_task: Option<Value>,
}

fn unknown_about() -> NewsAbout {
    NewsAbout::Unknown
}

impl RawEnvelope {
    /// Envelope with no payload attached.
    pub fn bare(action: NewsAction, about: NewsAbout, payload_id: impl Into<String>) -> Self {
        Self {
            news_action: action,
            news_about: about,
            news_payload_id: payload_id.into(),
            news_payload_persona: None,
            news_payload_thread: None,
            news_payload_thread_message: None,
            news_payload_tool_call: None,
            news_payload_kanban_task: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadId(pub String);

impl ThreadId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A conversation thread owned by a persona.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadPayload {
    pub ft_id: ThreadId,
    pub ft_persona_id: PersonaId,
    #[serde(default)]
    pub ft_title: String,
    #[serde(default)]
    pub ft_error: Option<String>,
    #[serde(default)]
    pub ft_need_assistant: i64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Identifies a message inside a thread: alternative branch plus sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageKey {
    pub thread_id: ThreadId,
    pub alt: i64,
    pub num: i64,
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.thread_id, self.alt, self.num)
    }
}

/// One message of a conversation thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub ftm_belongs_to_ft_id: ThreadId,
    pub ftm_alt: i64,
    pub ftm_num: i64,
    #[serde(default)]
    pub ftm_role: String,
    #[serde(default)]
    pub ftm_content: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MessagePayload {
    pub fn key(&self) -> MessageKey {
        MessageKey {
            thread_id: self.ftm_belongs_to_ft_id.clone(),
            alt: self.ftm_alt,
            num: self.ftm_num,
        }
    }
}

/// A tool call the model issued that this host implements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallInvocation {
    pub fcall_id: String,
    pub fcall_ft_id: ThreadId,
    pub fcall_name: String,
    /// JSON text exactly as the model produced it; may be malformed.
    #[serde(default)]
    pub fcall_arguments: String,
    /// Persona whose worker must execute the call.
    pub connected_persona_id: PersonaId,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A task on a persona's kanban board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    pub ktask_id: TaskId,
    pub ktask_persona_id: PersonaId,
    #[serde(default)]
    pub ktask_title: String,
    #[serde(default)]
    pub ktask_column: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Typed view of one envelope.
#[derive(Debug, Clone)]
pub enum BotEvent {
    PersonaUpserted(PersonaConfig),
    PersonaDeleted(PersonaId),
    ThreadUpserted(ThreadPayload),
    /// DELETE or STOP_TRACKING
    ThreadRemoved(ThreadId),
    MessageUpserted(MessagePayload),
    MessageDeleted(String),
    ToolCall(ToolCallInvocation),
    TaskUpserted(TaskPayload),
    TaskDeleted(TaskId),
    InitialSyncComplete,
    Supertest,
    Unrecognized { about: NewsAbout, action: NewsAction },
}

impl BotEvent {
    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            BotEvent::PersonaUpserted(_) => "persona_upserted",
            BotEvent::PersonaDeleted(_) => "persona_deleted",
            BotEvent::ThreadUpserted(_) => "thread_upserted",
            BotEvent::ThreadRemoved(_) => "thread_removed",
            BotEvent::MessageUpserted(_) => "message_upserted",
            BotEvent::MessageDeleted(_) => "message_deleted",
            BotEvent::ToolCall(_) => "tool_call",
            BotEvent::TaskUpserted(_) => "task_upserted",
            BotEvent::TaskDeleted(_) => "task_deleted",
            BotEvent::InitialSyncComplete => "initial_sync_complete",
            BotEvent::Supertest => "supertest",
            BotEvent::Unrecognized { .. } => "unrecognized",
        }
    }
}
