// Copyright (c) 2026 Warden Contributors
// SPDX-License-Identifier: AGPL-3.0

//! # Worker Registry
//!
//! Router-owned state: the live worker per persona, the shared thread tracker
//! and the latest payload of every task on the board.
//!
//! The registry has exactly one writer (the event router) and is therefore
//! plain `&mut self` state with no locks. Workers never look at it; they only
//! see what the router hands into their inbox.
//!
//! # Thread tracker
//!
//! The upstream promises to send `STOP_TRACKING` before the number of tracked
//! threads would exceed `max_threads`. The tracker is an [`LruCache`] so that
//! the [`ThreadOverflowPolicy::EvictOldest`] policy can drop the least
//! recently updated thread; under the default `Fail` policy exceeding the cap
//! is a fatal [`RouterError::ThreadCapExceeded`].

use crate::application::event_router::RouterError;
use crate::domain::events::{MessageKey, MessagePayload, TaskId, TaskPayload, ThreadId, ThreadPayload};
use crate::domain::host_config::ThreadOverflowPolicy;
use crate::domain::inbox::WorkerInbox;
use crate::domain::persona::PersonaId;
use lru::LruCache;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One running worker as seen by the router.
pub struct WorkerSlot {
    pub inbox: Arc<WorkerInbox>,
    /// Threads whose cached messages were already handed to this worker.
    pub known_threads: HashSet<ThreadId>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl WorkerSlot {
    pub fn new(inbox: Arc<WorkerInbox>, cancel: CancellationToken, handle: JoinHandle<()>) -> Self {
        Self {
            inbox,
            known_threads: HashSet::new(),
            cancel,
            handle,
        }
    }

    pub fn persona_id(&self) -> &PersonaId {
        self.inbox.persona_id()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancel the supervised task and wait for it to end.
    pub async fn cancel_and_wait(self) {
        let persona_id = self.inbox.persona_id().clone();
        self.cancel.cancel();
        match self.handle.await {
            Ok(()) => debug!(persona_id = %persona_id, "Worker task stopped"),
            Err(e) if e.is_cancelled() => debug!(persona_id = %persona_id, "Worker task was aborted"),
            Err(e) => warn!(persona_id = %persona_id, error = %e, "Worker task ended abnormally"),
        }
    }
}

/// Cached state of one tracked thread.
#[derive(Debug, Clone)]
pub struct ThreadTrackerEntry {
    pub owner: PersonaId,
    pub thread: ThreadPayload,
    pub messages: BTreeMap<MessageKey, MessagePayload>,
}

/// What a re-link pass changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RelinkReport {
    pub pruned: usize,
    pub seeded_threads: usize,
    pub seeded_messages: usize,
}

pub struct WorkerRegistry {
    workers: HashMap<PersonaId, WorkerSlot>,
    threads: LruCache<ThreadId, ThreadTrackerEntry>,
    tasks: HashMap<TaskId, TaskPayload>,
    max_threads: usize,
    overflow: ThreadOverflowPolicy,
}

impl WorkerRegistry {
    pub fn new(max_threads: usize, overflow: ThreadOverflowPolicy) -> Self {
        Self {
            workers: HashMap::new(),
            threads: LruCache::unbounded(),
            tasks: HashMap::new(),
            max_threads,
            overflow,
        }
    }

    // --- workers ---

    pub fn worker(&self, persona_id: &PersonaId) -> Option<&WorkerSlot> {
        self.workers.get(persona_id)
    }

    pub fn inbox(&self, persona_id: &PersonaId) -> Option<Arc<WorkerInbox>> {
        self.workers.get(persona_id).map(|slot| slot.inbox.clone())
    }

    /// Register a freshly launched worker. The caller must have removed any
    /// previous worker for the same persona first.
    pub fn insert_worker(&mut self, slot: WorkerSlot) {
        let persona_id = slot.persona_id().clone();
        debug_assert!(
            !self.workers.contains_key(&persona_id),
            "two live workers for persona {}",
            persona_id
        );
        self.workers.insert(persona_id, slot);
        metrics::gauge!("warden_live_workers").set(self.workers.len() as f64);
    }

    pub fn remove_worker(&mut self, persona_id: &PersonaId) -> Option<WorkerSlot> {
        let slot = self.workers.remove(persona_id);
        metrics::gauge!("warden_live_workers").set(self.workers.len() as f64);
        slot
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn persona_ids(&self) -> Vec<PersonaId> {
        let mut ids: Vec<_> = self.workers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn workers(&self) -> impl Iterator<Item = &WorkerSlot> {
        self.workers.values()
    }

    /// Remove every worker; the caller decides how long to wait for them.
    pub fn drain_workers(&mut self) -> Vec<WorkerSlot> {
        let slots = self.workers.drain().map(|(_, slot)| slot).collect();
        metrics::gauge!("warden_live_workers").set(0.0);
        slots
    }

    // --- thread tracker ---

    /// Insert or refresh a thread. Returns the previous owner when it changed.
    pub fn upsert_thread(&mut self, thread: ThreadPayload) -> Option<PersonaId> {
        let owner = thread.ft_persona_id.clone();
        let previous_owner = match self.threads.get_mut(&thread.ft_id) {
            Some(entry) => {
                let previous = (entry.owner != owner).then(|| entry.owner.clone());
                entry.owner = owner;
                entry.thread = thread;
                previous
            }
            None => {
                self.threads.put(
                    thread.ft_id.clone(),
                    ThreadTrackerEntry {
                        owner,
                        thread,
                        messages: BTreeMap::new(),
                    },
                );
                None
            }
        };
        metrics::gauge!("warden_tracked_threads").set(self.threads.len() as f64);
        previous_owner
    }

    pub fn remove_thread(&mut self, thread_id: &ThreadId) -> Option<ThreadTrackerEntry> {
        let entry = self.threads.pop(thread_id);
        metrics::gauge!("warden_tracked_threads").set(self.threads.len() as f64);
        entry
    }

    /// Cache a message under its tracked thread. Returns the thread owner, or
    /// `None` when the thread is not tracked.
    pub fn track_message(&mut self, message: &MessagePayload) -> Option<PersonaId> {
        let entry = self.threads.get_mut(&message.ftm_belongs_to_ft_id)?;
        entry.messages.insert(message.key(), message.clone());
        Some(entry.owner.clone())
    }

    pub fn thread(&self, thread_id: &ThreadId) -> Option<&ThreadTrackerEntry> {
        self.threads.peek(thread_id)
    }

    pub fn tracked_threads(&self) -> usize {
        self.threads.len()
    }

    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    /// Forget all tracked threads and what workers know about them.
    ///
    /// Called when a new subscription starts, since the upstream replays
    /// every tracked thread from scratch.
    pub fn clear_threads(&mut self) {
        self.threads.clear();
        for slot in self.workers.values_mut() {
            slot.known_threads.clear();
        }
        metrics::gauge!("warden_tracked_threads").set(0.0);
    }

    /// Check the tracker against `max_threads`, evicting if the policy allows.
    pub fn enforce_thread_cap(&mut self) -> Result<Vec<ThreadId>, RouterError> {
        if self.threads.len() <= self.max_threads {
            return Ok(Vec::new());
        }

        match self.overflow {
            ThreadOverflowPolicy::Fail => Err(RouterError::ThreadCapExceeded {
                tracked: self.threads.len(),
                max_threads: self.max_threads,
            }),
            ThreadOverflowPolicy::EvictOldest => {
                let mut evicted = Vec::new();
                while self.threads.len() > self.max_threads {
                    match self.threads.pop_lru() {
                        Some((thread_id, _)) => evicted.push(thread_id),
                        None => break,
                    }
                }
                warn!(
                    evicted = evicted.len(),
                    max_threads = self.max_threads,
                    "Thread cap exceeded, evicted least recently updated threads"
                );
                metrics::counter!("warden_threads_evicted_total").increment(evicted.len() as u64);
                metrics::gauge!("warden_tracked_threads").set(self.threads.len() as f64);
                Ok(evicted)
            }
        }
    }

    /// Bring every worker's view of its threads in line with the tracker.
    ///
    /// Threads no longer tracked (or now owned by someone else) are pruned
    /// from `known_threads`. Threads a live owner has not seen yet are handed
    /// into its inbox together with their cached messages.
    pub fn relink_threads(&mut self) -> RelinkReport {
        let mut report = RelinkReport::default();
        let threads = &self.threads;

        for slot in self.workers.values_mut() {
            let persona_id = slot.inbox.persona_id().clone();
            let before = slot.known_threads.len();
            slot.known_threads.retain(|thread_id| {
                threads
                    .peek(thread_id)
                    .is_some_and(|entry| entry.owner == persona_id)
            });
            report.pruned += before - slot.known_threads.len();
        }

        for (thread_id, entry) in threads.iter() {
            let Some(slot) = self.workers.get_mut(&entry.owner) else {
                continue;
            };
            if slot.known_threads.contains(thread_id) {
                continue;
            }
            slot.known_threads.insert(thread_id.clone());
            report.seeded_threads += 1;
            report.seeded_messages += entry.messages.len();
            slot.inbox.push_thread(entry.thread.clone());
            slot.inbox.push_messages(entry.messages.values().cloned());
        }

        if report != RelinkReport::default() {
            debug!(
                pruned = report.pruned,
                seeded_threads = report.seeded_threads,
                seeded_messages = report.seeded_messages,
                "Re-linked threads to workers"
            );
        }
        report
    }

    // --- tasks ---

    /// Cache the latest task payload. Returns the previous owner when it changed.
    pub fn record_task(&mut self, task: &TaskPayload) -> Option<PersonaId> {
        self.tasks
            .insert(task.ktask_id.clone(), task.clone())
            .map(|previous| previous.ktask_persona_id)
            .filter(|previous| previous != &task.ktask_persona_id)
    }

    /// Drop a task. Returns its owner.
    pub fn forget_task(&mut self, task_id: &TaskId) -> Option<PersonaId> {
        self.tasks.remove(task_id).map(|task| task.ktask_persona_id)
    }

    pub fn task_owner(&self, task_id: &TaskId) -> Option<&PersonaId> {
        self.tasks.get(task_id).map(|task| &task.ktask_persona_id)
    }

    /// Drop every cached task. A new subscription replays the live ones.
    pub fn clear_tasks(&mut self) {
        self.tasks.clear();
    }

    /// Cached tasks of one persona, used to seed a freshly started worker.
    pub fn tasks_of(&self, persona_id: &PersonaId) -> Vec<TaskPayload> {
        self.tasks
            .values()
            .filter(|task| &task.ktask_persona_id == persona_id)
            .cloned()
            .collect()
    }
}

/// Cancel every slot and wait for all of them, at most `grace` in total.
///
/// Returns how many workers did not stop in time; those are aborted.
pub async fn shutdown_slots(slots: Vec<WorkerSlot>, grace: Duration) -> usize {
    for slot in &slots {
        slot.cancel.cancel();
    }

    let mut pending = Vec::with_capacity(slots.len());
    let mut waiters = Vec::with_capacity(slots.len());
    for slot in slots {
        pending.push((slot.inbox.persona_id().clone(), slot.handle.abort_handle()));
        waiters.push(slot.cancel_and_wait());
    }

    match tokio::time::timeout(grace, futures::future::join_all(waiters)).await {
        Ok(_) => 0,
        Err(_) => {
            let mut stuck = 0;
            for (persona_id, abort) in pending {
                if !abort.is_finished() {
                    warn!(persona_id = %persona_id, "Worker did not stop within grace period, aborting");
                    abort.abort();
                    stuck += 1;
                }
            }
            stuck
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    fn thread(id: &str, owner: &str) -> ThreadPayload {
        serde_json::from_value(json!({"ft_id": id, "ft_persona_id": owner})).unwrap()
    }

    fn message(thread_id: &str, num: i64) -> MessagePayload {
        serde_json::from_value(json!({
            "ftm_belongs_to_ft_id": thread_id,
            "ftm_alt": 100,
            "ftm_num": num,
            "ftm_content": format!("m{}", num)
        }))
        .unwrap()
    }

    fn idle_slot(persona_id: &str) -> WorkerSlot {
        let inbox = Arc::new(WorkerInbox::new(
            crate::domain::persona::PersonaConfig::new(persona_id, Map::new()),
        ));
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { token.cancelled().await });
        WorkerSlot::new(inbox, cancel, handle)
    }

    #[tokio::test]
    async fn test_message_for_untracked_thread_is_not_cached() {
        let mut registry = WorkerRegistry::new(10, ThreadOverflowPolicy::Fail);
        assert!(registry.track_message(&message("t-1", 1)).is_none());

        registry.upsert_thread(thread("t-1", "p-1"));
        assert_eq!(registry.track_message(&message("t-1", 1)), Some(PersonaId::new("p-1")));
        assert_eq!(registry.thread(&ThreadId::new("t-1")).unwrap().messages.len(), 1);
    }

    #[tokio::test]
    async fn test_relink_seeds_and_prunes() {
        let mut registry = WorkerRegistry::new(10, ThreadOverflowPolicy::Fail);
        registry.upsert_thread(thread("t-1", "p-1"));
        registry.track_message(&message("t-1", 1));
        registry.track_message(&message("t-1", 2));
        registry.insert_worker(idle_slot("p-1"));

        let report = registry.relink_threads();
        assert_eq!(report.seeded_threads, 1);
        assert_eq!(report.seeded_messages, 2);
        let inbox = registry.inbox(&PersonaId::new("p-1")).unwrap();
        let batch = inbox.take_all();
        assert_eq!(batch.threads.len(), 1);
        assert_eq!(batch.messages.len(), 2);

        // second pass is a no-op
        assert_eq!(registry.relink_threads(), RelinkReport::default());

        registry.remove_thread(&ThreadId::new("t-1"));
        let report = registry.relink_threads();
        assert_eq!(report.pruned, 1);
        assert!(registry.worker(&PersonaId::new("p-1")).unwrap().known_threads.is_empty());

        for slot in registry.drain_workers() {
            slot.cancel_and_wait().await;
        }
    }

    #[tokio::test]
    async fn test_thread_owner_change_moves_thread() {
        let mut registry = WorkerRegistry::new(10, ThreadOverflowPolicy::Fail);
        registry.insert_worker(idle_slot("p-1"));
        registry.insert_worker(idle_slot("p-2"));
        registry.upsert_thread(thread("t-1", "p-1"));
        registry.relink_threads();

        assert_eq!(registry.upsert_thread(thread("t-1", "p-2")), Some(PersonaId::new("p-1")));
        let report = registry.relink_threads();
        assert_eq!(report.pruned, 1);
        assert_eq!(report.seeded_threads, 1);
        assert!(registry
            .worker(&PersonaId::new("p-2"))
            .unwrap()
            .known_threads
            .contains(&ThreadId::new("t-1")));

        shutdown_slots(registry.drain_workers(), Duration::from_secs(5)).await;
    }

    #[test]
    fn test_thread_cap_fail_policy() {
        let mut registry = WorkerRegistry::new(2, ThreadOverflowPolicy::Fail);
        for id in ["t-1", "t-2"] {
            registry.upsert_thread(thread(id, "p-1"));
        }
        assert!(registry.enforce_thread_cap().unwrap().is_empty());

        registry.upsert_thread(thread("t-3", "p-1"));
        assert!(matches!(
            registry.enforce_thread_cap(),
            Err(RouterError::ThreadCapExceeded { tracked: 3, max_threads: 2 })
        ));
    }

    #[test]
    fn test_thread_cap_evicts_least_recently_updated() {
        let mut registry = WorkerRegistry::new(2, ThreadOverflowPolicy::EvictOldest);
        registry.upsert_thread(thread("t-1", "p-1"));
        registry.upsert_thread(thread("t-2", "p-1"));
        // touching t-1 makes t-2 the oldest
        registry.track_message(&message("t-1", 1));
        registry.upsert_thread(thread("t-3", "p-1"));

        let evicted = registry.enforce_thread_cap().unwrap();
        assert_eq!(evicted, vec![ThreadId::new("t-2")]);
        assert_eq!(registry.tracked_threads(), 2);
    }

    #[test]
    fn test_task_cache_tracks_owner() {
        let mut registry = WorkerRegistry::new(10, ThreadOverflowPolicy::Fail);
        let task: TaskPayload =
            serde_json::from_value(json!({"ktask_id": "k-1", "ktask_persona_id": "p-1"})).unwrap();
        assert!(registry.record_task(&task).is_none());
        assert_eq!(registry.tasks_of(&PersonaId::new("p-1")).len(), 1);

        let moved: TaskPayload =
            serde_json::from_value(json!({"ktask_id": "k-1", "ktask_persona_id": "p-2"})).unwrap();
        assert_eq!(registry.record_task(&moved), Some(PersonaId::new("p-1")));
        assert!(registry.tasks_of(&PersonaId::new("p-1")).is_empty());
        assert_eq!(registry.forget_task(&TaskId::new("k-1")), Some(PersonaId::new("p-2")));
        assert!(registry.task_owner(&TaskId::new("k-1")).is_none());
    }

    #[test]
    fn test_clear_tasks() {
        let mut registry = WorkerRegistry::new(10, ThreadOverflowPolicy::Fail);
        let task: TaskPayload =
            serde_json::from_value(json!({"ktask_id": "k-1", "ktask_persona_id": "p-1"})).unwrap();
        registry.record_task(&task);
        registry.clear_tasks();
        assert!(registry.tasks_of(&PersonaId::new("p-1")).is_empty());
        assert!(registry.task_owner(&TaskId::new("k-1")).is_none());
    }

    #[test]
    fn test_clear_threads() {
        let mut registry = WorkerRegistry::new(10, ThreadOverflowPolicy::Fail);
        registry.upsert_thread(thread("t-1", "p-1"));
        registry.clear_threads();
        assert_eq!(registry.tracked_threads(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_slots_waits_for_all() {
        let slots = vec![idle_slot("p-1"), idle_slot("p-2")];
        assert_eq!(shutdown_slots(slots, Duration::from_secs(5)).await, 0);
    }

    #[tokio::test]
    async fn test_shutdown_slots_aborts_stuck_worker() {
        let inbox = Arc::new(WorkerInbox::new(
            crate::domain::persona::PersonaConfig::new("p-stuck", Map::new()),
        ));
        let handle = tokio::spawn(std::future::pending::<()>());
        let slot = WorkerSlot::new(inbox, CancellationToken::new(), handle);
        assert_eq!(shutdown_slots(vec![slot], Duration::from_millis(50)).await, 1);
    }
}
