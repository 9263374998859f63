// Copyright (c) 2026 Warden Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Upstream Port
//!
//! The bot host talks to exactly one upstream service: it opens a long-lived
//! subscription feed, posts tool-call results back, and confirms liveness.
//! Implementations live in `infrastructure` (HTTP and in-memory).

use crate::domain::events::{RawEnvelope, ToolCallInvocation};
use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use thiserror::Error;

/// Markers that identify an authentication or authorization failure in error text.
pub const AUTH_FAILURE_MARKERS: [&str; 2] = ["HTTP 401", "HTTP 403"];

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Subscription closed")]
    Closed,
}

impl UpstreamError {
    /// Whether this failure means our credentials or group binding are wrong.
    pub fn is_auth_failure(&self) -> bool {
        let text = self.to_string();
        AUTH_FAILURE_MARKERS.iter().any(|m| text.contains(m))
    }
}

/// Parameters sent when opening the subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionParams {
    pub group_id: String,
    pub marketable_name: String,
    pub marketable_version: u32,
    /// Tools this process implements locally.
    pub inprocess_tool_names: Vec<String>,
    /// The upstream emits STOP_TRACKING before exceeding this many threads.
    pub max_threads: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub marketable_name: String,
    pub marketable_version: u32,
    pub group_id: String,
}

pub type EnvelopeStream = Pin<Box<dyn Stream<Item = Result<RawEnvelope, UpstreamError>> + Send>>;

#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Open the feed. The upstream replays full current state first.
    async fn subscribe(&self, params: &SubscriptionParams) -> Result<EnvelopeStream, UpstreamError>;

    async fn post_tool_result(
        &self,
        call: &ToolCallInvocation,
        content: &str,
    ) -> Result<(), UpstreamError>;

    async fn confirm_alive(&self, heartbeat: &Heartbeat) -> Result<(), UpstreamError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_failure_classification() {
        let forbidden = UpstreamError::Http { status: 403, body: "bad group".into() };
        assert!(forbidden.is_auth_failure());
        let unauthorized = UpstreamError::Http { status: 401, body: String::new() };
        assert!(unauthorized.is_auth_failure());

        let unavailable = UpstreamError::Http { status: 503, body: "retry".into() };
        assert!(!unavailable.is_auth_failure());
        assert!(!UpstreamError::Transport("connection reset".into()).is_auth_failure());
    }
}
