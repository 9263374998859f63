// Copyright (c) 2026 Warden Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Worker Inbox
//!
//! Per-worker mailbox filled by the event router and drained by the worker's
//! own loop. Entity updates are keyed and latest-wins, so a slow worker skips
//! intermediate states instead of replaying them; tool calls are a FIFO and
//! are never collapsed.
//!
//! # Concurrency
//!
//! Exactly two parties touch an inbox: the router (append side) and the owning
//! worker (consume side). Maps sit behind short `parking_lot` critical
//! sections that never span an `.await`. The wake signal is an atomic flag
//! paired with a [`Notify`] so a sleeping worker can be woken early.

use crate::domain::events::{
    MessageKey, MessagePayload, TaskId, TaskPayload, ThreadId, ThreadPayload, ToolCallInvocation,
};
use crate::domain::persona::{PersonaConfig, PersonaId};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Everything removed from an inbox by one drain.
#[derive(Debug, Default)]
pub struct InboxBatch {
    pub messages: Vec<MessagePayload>,
    pub threads: Vec<ThreadPayload>,
    pub tasks: Vec<TaskPayload>,
    pub tool_calls: Vec<ToolCallInvocation>,
}

impl InboxBatch {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
            && self.threads.is_empty()
            && self.tasks.is_empty()
            && self.tool_calls.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len() + self.threads.len() + self.tasks.len() + self.tool_calls.len()
    }
}

#[derive(Default)]
struct Pending {
    messages: HashMap<MessageKey, MessagePayload>,
    threads: HashMap<ThreadId, ThreadPayload>,
    tasks: HashMap<TaskId, TaskPayload>,
    tool_calls: VecDeque<ToolCallInvocation>,
}

pub struct WorkerInbox {
    persona_id: PersonaId,
    persona: RwLock<Arc<PersonaConfig>>,
    pending: Mutex<Pending>,
    registered_tools: RwLock<Option<BTreeSet<String>>>,
    wake: AtomicBool,
    wake_notify: Notify,
    reached_main_loop: AtomicBool,
    completed_initial_catchup: AtomicBool,
}

impl WorkerInbox {
    pub fn new(persona: PersonaConfig) -> Self {
        Self {
            persona_id: persona.persona_id.clone(),
            persona: RwLock::new(Arc::new(persona)),
            pending: Mutex::new(Pending::default()),
            registered_tools: RwLock::new(None),
            wake: AtomicBool::new(false),
            wake_notify: Notify::new(),
            reached_main_loop: AtomicBool::new(false),
            completed_initial_catchup: AtomicBool::new(false),
        }
    }

    pub fn persona_id(&self) -> &PersonaId {
        &self.persona_id
    }

    /// Current persona snapshot.
    pub fn persona(&self) -> Arc<PersonaConfig> {
        self.persona.read().clone()
    }

    /// Swap in a new snapshot whose settings match the old one.
    pub fn replace_persona(&self, persona: PersonaConfig) {
        *self.persona.write() = Arc::new(persona);
    }

    // --- append side (router) ---

    pub fn push_message(&self, message: MessagePayload) {
        self.pending.lock().messages.insert(message.key(), message);
        self.raise_wake();
    }

    /// Hand over several messages under one lock and a single wake.
    pub fn push_messages(&self, messages: impl IntoIterator<Item = MessagePayload>) {
        let mut pushed = false;
        {
            let mut pending = self.pending.lock();
            for message in messages {
                pending.messages.insert(message.key(), message);
                pushed = true;
            }
        }
        if pushed {
            self.raise_wake();
        }
    }

    pub fn push_thread(&self, thread: ThreadPayload) {
        self.pending.lock().threads.insert(thread.ft_id.clone(), thread);
        self.raise_wake();
    }

    pub fn push_task(&self, task: TaskPayload) {
        self.pending.lock().tasks.insert(task.ktask_id.clone(), task);
        self.raise_wake();
    }

    /// Drop an undrained update for a task that no longer exists.
    pub fn forget_task(&self, task_id: &TaskId) -> bool {
        self.pending.lock().tasks.remove(task_id).is_some()
    }

    pub fn push_tool_call(&self, call: ToolCallInvocation) {
        self.pending.lock().tool_calls.push_back(call);
        self.raise_wake();
    }

    // --- consume side (worker) ---

    /// Remove everything pending. Tool calls keep arrival order.
    pub fn take_all(&self) -> InboxBatch {
        let mut pending = self.pending.lock();
        InboxBatch {
            messages: pending.messages.drain().map(|(_, v)| v).collect(),
            threads: pending.threads.drain().map(|(_, v)| v).collect(),
            tasks: pending.tasks.drain().map(|(_, v)| v).collect(),
            tool_calls: pending.tool_calls.drain(..).collect(),
        }
    }

    pub fn pending_len(&self) -> usize {
        let pending = self.pending.lock();
        pending.messages.len() + pending.threads.len() + pending.tasks.len() + pending.tool_calls.len()
    }

    /// Latest pending payload for a message key, if any.
    pub fn pending_message(&self, key: &MessageKey) -> Option<MessagePayload> {
        self.pending.lock().messages.get(key).cloned()
    }

    pub fn pending_tool_call_ids(&self) -> Vec<String> {
        self.pending
            .lock()
            .tool_calls
            .iter()
            .map(|c| c.fcall_id.clone())
            .collect()
    }

    // --- wake signal ---

    pub fn raise_wake(&self) {
        self.wake.store(true, Ordering::Release);
        self.wake_notify.notify_one();
    }

    pub fn clear_wake(&self) {
        self.wake.store(false, Ordering::Release);
    }

    pub fn is_woken(&self) -> bool {
        self.wake.load(Ordering::Acquire)
    }

    /// Wait until the wake signal is raised or `timeout` elapses.
    ///
    /// Returns `true` if woken. A timeout is not an error. Only the flag
    /// counts: a notification left over from a wake that was already
    /// cleared and drained is swallowed and the wait goes on.
    pub async fn wait_for_wake(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.wake_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_woken() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return false;
            }
        }
    }

    // --- readiness ---

    pub fn mark_reached_main_loop(&self) {
        self.reached_main_loop.store(true, Ordering::Release);
    }

    pub fn reached_main_loop(&self) -> bool {
        self.reached_main_loop.load(Ordering::Acquire)
    }

    pub fn mark_completed_initial_catchup(&self) {
        self.completed_initial_catchup.store(true, Ordering::Release);
    }

    pub fn completed_initial_catchup(&self) -> bool {
        self.completed_initial_catchup.load(Ordering::Acquire)
    }

    /// Publish the tool names the worker's handler implements.
    pub fn register_tools(&self, tools: BTreeSet<String>) {
        *self.registered_tools.write() = Some(tools);
    }

    pub fn registered_tools(&self) -> Option<BTreeSet<String>> {
        self.registered_tools.read().clone()
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.registered_tools
            .read()
            .as_ref()
            .is_some_and(|tools| tools.contains(name))
    }
}

impl std::fmt::Debug for WorkerInbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerInbox")
            .field("persona_id", &self.persona_id)
            .field("pending", &self.pending_len())
            .field("woken", &self.is_woken())
            .field("reached_main_loop", &self.reached_main_loop())
            .field("completed_initial_catchup", &self.completed_initial_catchup())
            .finish()
    }
}
