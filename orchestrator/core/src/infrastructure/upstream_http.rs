// Copyright (c) 2026 Warden Contributors
// SPDX-License-Identifier: AGPL-3.0

//! HTTP Upstream Client
//!
//! reqwest-based [`UpstreamClient`].
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Wire transport for the subscription feed, tool results and heartbeats
//! - **Integration:** Upstream bot-host API → NDJSON stream → `RawEnvelope`
//!
//! # Endpoints
//!
//! | Method | Path | Body | Response |
//! |--------|------|------|----------|
//! | POST | `/v1/bot-host/subscribe` | `SubscriptionParams` | NDJSON envelopes, one per line |
//! | POST | `/v1/bot-host/tool-results` | `{fcall_id, content}` | empty |
//! | POST | `/v1/bot-host/heartbeat` | `Heartbeat` | empty |
//!
//! Any non-2xx status becomes [`UpstreamError::Http`], rendered as
//! `HTTP <status>: <body>` so auth failures can be recognised by marker.

use crate::domain::events::{RawEnvelope, ToolCallInvocation};
use crate::domain::host_config::UpstreamConfig;
use crate::domain::upstream::{EnvelopeStream, Heartbeat, SubscriptionParams, UpstreamClient, UpstreamError};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use reqwest::{Client, RequestBuilder, Response};
use serde::Serialize;
use std::fmt::Display;
use std::pin::Pin;
use std::time::Duration;
use tracing::debug;

const SUBSCRIBE_PATH: &str = "/v1/bot-host/subscribe";
const TOOL_RESULTS_PATH: &str = "/v1/bot-host/tool-results";
const HEARTBEAT_PATH: &str = "/v1/bot-host/heartbeat";

#[derive(Serialize)]
struct ToolResultRequest<'a> {
    fcall_id: &'a str,
    content: &'a str,
}

pub struct HttpUpstreamClient {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    request_timeout: Duration,
}

impl HttpUpstreamClient {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>, request_timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            api_key,
            request_timeout,
        }
    }

    /// Build from configuration, resolving `env:` API keys.
    pub fn from_config(config: &UpstreamConfig) -> anyhow::Result<Self> {
        Ok(Self::new(
            config.endpoint.clone(),
            config.resolved_api_key()?,
            config.request_timeout,
        ))
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn post(&self, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.endpoint, path);
        let request = self.client.post(url);
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn send(request: RequestBuilder) -> Result<Response, UpstreamError> {
        let response = request
            .send()
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Http {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl UpstreamClient for HttpUpstreamClient {
    async fn subscribe(&self, params: &SubscriptionParams) -> Result<EnvelopeStream, UpstreamError> {
        // no request timeout: the feed stays open for the life of the connection
        let request = self
            .post(SUBSCRIBE_PATH)
            .header("Accept", "application/x-ndjson")
            .json(params);

        let response = Self::send(request).await?;
        debug!(endpoint = %self.endpoint, group_id = %params.group_id, "Subscription stream opened");
        Ok(ndjson_envelopes(response.bytes_stream()))
    }

    async fn post_tool_result(&self, call: &ToolCallInvocation, content: &str) -> Result<(), UpstreamError> {
        let request = self
            .post(TOOL_RESULTS_PATH)
            .timeout(self.request_timeout)
            .json(&ToolResultRequest {
                fcall_id: &call.fcall_id,
                content,
            });
        Self::send(request).await?;
        Ok(())
    }

    async fn confirm_alive(&self, heartbeat: &Heartbeat) -> Result<(), UpstreamError> {
        let request = self
            .post(HEARTBEAT_PATH)
            .timeout(self.request_timeout)
            .json(heartbeat);
        Self::send(request).await?;
        Ok(())
    }
}

struct LineReader<S> {
    inner: Pin<Box<S>>,
    buffer: BytesMut,
    finished: bool,
}

/// Split a byte stream into newline-delimited JSON envelopes.
///
/// Blank lines are keep-alives and skipped. A line that is not an envelope
/// yields [`UpstreamError::Protocol`] and the stream continues; a transport
/// error yields [`UpstreamError::Transport`] and ends the stream.
pub fn ndjson_envelopes<S, E>(bytes: S) -> EnvelopeStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let reader = LineReader {
        inner: Box::pin(bytes),
        buffer: BytesMut::new(),
        finished: false,
    };

    futures::stream::unfold(reader, |mut reader| async move {
        loop {
            if let Some(pos) = reader.buffer.iter().position(|b| *b == b'\n') {
                let line = reader.buffer.split_to(pos + 1);
                let line = line[..pos].trim_ascii();
                if line.is_empty() {
                    continue;
                }
                return Some((parse_line(line), reader));
            }

            if reader.finished {
                let rest = reader.buffer.split();
                let rest = rest.trim_ascii();
                if rest.is_empty() {
                    return None;
                }
                return Some((parse_line(rest), reader));
            }

            match reader.inner.next().await {
                Some(Ok(chunk)) => reader.buffer.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    reader.finished = true;
                    reader.buffer.clear();
                    return Some((Err(UpstreamError::Transport(e.to_string())), reader));
                }
                None => reader.finished = true,
            }
        }
    })
    .boxed()
}

fn parse_line(line: &[u8]) -> Result<RawEnvelope, UpstreamError> {
    serde_json::from_slice(line)
        .map_err(|e| UpstreamError::Protocol(format!("invalid envelope line: {}", e)))
}
