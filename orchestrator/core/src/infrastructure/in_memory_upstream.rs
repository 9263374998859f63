// Copyright (c) 2026 Warden Contributors
// SPDX-License-Identifier: AGPL-3.0

//! In-Memory Upstream
//!
//! Channel-backed [`UpstreamClient`] for tests and local dry runs. Each call to
//! [`InMemoryUpstream::open_feed`] queues one subscription; the next
//! `subscribe` consumes it. Dropping the returned [`FeedSender`] ends that
//! subscription, which the host treats as a dropped connection.

use crate::domain::events::{RawEnvelope, ToolCallInvocation};
use crate::domain::upstream::{EnvelopeStream, Heartbeat, SubscriptionParams, UpstreamClient, UpstreamError};
use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Notify;

type FeedItem = Result<RawEnvelope, UpstreamError>;

/// A tool result the engine posted back.
#[derive(Debug, Clone, PartialEq)]
pub struct PostedResult {
    pub fcall_id: String,
    pub tool: String,
    pub content: String,
}

/// Producer side of one queued subscription.
#[derive(Clone)]
pub struct FeedSender {
    tx: mpsc::UnboundedSender<FeedItem>,
}

impl FeedSender {
    /// Returns `false` once the subscriber has gone away.
    pub fn send(&self, envelope: RawEnvelope) -> bool {
        self.tx.unbounded_send(Ok(envelope)).is_ok()
    }

    /// Send an envelope written as JSON.
    pub fn send_json(&self, value: serde_json::Value) -> Result<bool, serde_json::Error> {
        let envelope = serde_json::from_value(value)?;
        Ok(self.send(envelope))
    }

    /// Deliver a transport error as the next stream item.
    pub fn fail(&self, error: UpstreamError) -> bool {
        self.tx.unbounded_send(Err(error)).is_ok()
    }

    pub fn close(&self) {
        self.tx.close_channel();
    }
}

#[derive(Default)]
pub struct InMemoryUpstream {
    feeds: Mutex<VecDeque<mpsc::UnboundedReceiver<FeedItem>>>,
    subscriptions: Mutex<Vec<SubscriptionParams>>,
    posted: Mutex<Vec<PostedResult>>,
    posted_notify: Notify,
    heartbeats: Mutex<Vec<Heartbeat>>,
    heartbeat_failures: Mutex<VecDeque<UpstreamError>>,
    heartbeat_notify: Notify,
}

impl InMemoryUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a subscription for the next `subscribe` call.
    pub fn open_feed(&self) -> FeedSender {
        let (tx, rx) = mpsc::unbounded();
        self.feeds.lock().push_back(rx);
        FeedSender { tx }
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionParams> {
        self.subscriptions.lock().clone()
    }

    pub fn posted_results(&self) -> Vec<PostedResult> {
        self.posted.lock().clone()
    }

    pub fn heartbeats(&self) -> Vec<Heartbeat> {
        self.heartbeats.lock().clone()
    }

    /// Make the next heartbeat call fail with `error`.
    pub fn fail_next_heartbeat(&self, error: UpstreamError) {
        self.heartbeat_failures.lock().push_back(error);
    }

    /// Wait until at least `count` results were posted.
    pub async fn wait_for_posted(&self, count: usize, timeout: Duration) -> Option<Vec<PostedResult>> {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.posted_notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                {
                    let posted = self.posted.lock();
                    if posted.len() >= count {
                        return posted.clone();
                    }
                }
                notified.await;
            }
        })
        .await
        .ok()
    }

    /// Wait until at least `count` heartbeats were attempted (failed ones included).
    pub async fn wait_for_heartbeats(&self, count: usize, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.heartbeat_notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.heartbeats.lock().len() >= count {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }
}

#[async_trait]
impl UpstreamClient for InMemoryUpstream {
    async fn subscribe(&self, params: &SubscriptionParams) -> Result<EnvelopeStream, UpstreamError> {
        self.subscriptions.lock().push(params.clone());
        let rx = self
            .feeds
            .lock()
            .pop_front()
            .ok_or_else(|| UpstreamError::Transport("no subscription feed queued".to_string()))?;
        Ok(rx.boxed())
    }

    async fn post_tool_result(&self, call: &ToolCallInvocation, content: &str) -> Result<(), UpstreamError> {
        self.posted.lock().push(PostedResult {
            fcall_id: call.fcall_id.clone(),
            tool: call.fcall_name.clone(),
            content: content.to_string(),
        });
        self.posted_notify.notify_waiters();
        Ok(())
    }

    async fn confirm_alive(&self, heartbeat: &Heartbeat) -> Result<(), UpstreamError> {
        self.heartbeats.lock().push(heartbeat.clone());
        let failure = self.heartbeat_failures.lock().pop_front();
        self.heartbeat_notify.notify_waiters();
        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}
