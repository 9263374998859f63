// Copyright (c) 2026 Warden Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Envelope Mapper
//!
//! Translates raw upstream envelopes into typed domain [`BotEvent`]s.
//!
//! # DDD Pattern: Anti-Corruption Layer
//!
//! - **Layer:** Infrastructure
//! - **Responsibility:** Keep the upstream wire shape (`news_action` /
//!   `news_about` / `news_payload_<kind>`) out of the router
//! - **Collaborators:**
//!   - Domain: `BotEvent`, payload types
//!   - Application: `EventRouter` consumes the mapped events
//!
//! # Mapping
//!
//! | news_about | news_action | BotEvent |
//! |------------|-------------|----------|
//! | persona | INSERT / UPDATE | `PersonaUpserted` |
//! | persona | DELETE | `PersonaDeleted` |
//! | thread | INSERT / UPDATE | `ThreadUpserted` |
//! | thread | DELETE / STOP_TRACKING | `ThreadRemoved` |
//! | thread_message | INSERT / UPDATE | `MessageUpserted` |
//! | thread_message | DELETE | `MessageDeleted` |
//! | tool_call | CALL | `ToolCall` |
//! | kanban_task | INSERT / UPDATE | `TaskUpserted` |
//! | kanban_task | DELETE | `TaskDeleted` |
//! | any | INITIAL_UPDATES_OVER | `InitialSyncComplete` |
//! | any | SUPERTEST | `Supertest` |
//!
//! Every other combination maps to `BotEvent::Unrecognized` rather than an
//! error; only a missing or malformed payload is an error.

use crate::domain::events::{BotEvent, NewsAbout, NewsAction, RawEnvelope, TaskId, ThreadId};
use crate::domain::persona::PersonaId;
use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;

pub struct EnvelopeMapper;

impl EnvelopeMapper {
    /// Map one raw envelope to a domain event
    ///
    /// # Errors
    ///
    /// - Upsert or CALL envelope without its `news_payload_<kind>` object
    /// - Payload that does not match the entity's shape
    pub fn to_domain_event(raw: &RawEnvelope) -> Result<BotEvent> {
        use NewsAction::*;

        match raw.news_action {
            InitialUpdatesOver => return Ok(BotEvent::InitialSyncComplete),
            Supertest => return Ok(BotEvent::Supertest),
            _ => {}
        }

        let event = match (raw.news_about, raw.news_action) {
            (NewsAbout::Persona, Insert | Update) => {
                BotEvent::PersonaUpserted(payload(&raw.news_payload_persona, "news_payload_persona")?)
            }
            (NewsAbout::Persona, Delete) => {
                BotEvent::PersonaDeleted(PersonaId::new(required_id(raw)?))
            }

            (NewsAbout::Thread, Insert | Update) => {
                BotEvent::ThreadUpserted(payload(&raw.news_payload_thread, "news_payload_thread")?)
            }
            (NewsAbout::Thread, Delete | StopTracking) => {
                BotEvent::ThreadRemoved(ThreadId::new(required_id(raw)?))
            }

            (NewsAbout::ThreadMessage, Insert | Update) => BotEvent::MessageUpserted(payload(
                &raw.news_payload_thread_message,
                "news_payload_thread_message",
            )?),
            (NewsAbout::ThreadMessage, Delete) => BotEvent::MessageDeleted(raw.news_payload_id.clone()),

            (NewsAbout::ToolCall, Call) => {
                BotEvent::ToolCall(payload(&raw.news_payload_tool_call, "news_payload_tool_call")?)
            }

            (NewsAbout::KanbanTask, Insert | Update) => {
                BotEvent::TaskUpserted(payload(&raw.news_payload_kanban_task, "news_payload_kanban_task")?)
            }
            (NewsAbout::KanbanTask, Delete) => BotEvent::TaskDeleted(TaskId::new(required_id(raw)?)),

            (about, action) => BotEvent::Unrecognized { about, action },
        };

        Ok(event)
    }
}

fn payload<T: DeserializeOwned>(value: &Option<Value>, field: &str) -> Result<T> {
    let value = value
        .as_ref()
        .ok_or_else(|| anyhow!("Envelope is missing {}", field))?;
    serde_json::from_value(value.clone()).with_context(|| format!("Malformed {}", field))
}

fn required_id(raw: &RawEnvelope) -> Result<&str> {
    if raw.news_payload_id.is_empty() {
        return Err(anyhow!(
            "Envelope {:?}/{:?} has an empty news_payload_id",
            raw.news_about,
            raw.news_action
        ));
    }
    Ok(&raw.news_payload_id)
}
