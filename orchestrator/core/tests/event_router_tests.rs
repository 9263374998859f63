// Copyright (c) 2026 Warden Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Integration tests for the event router.
//!
//! Covers the routing guarantees the rest of the host relies on:
//! - at most one live worker per persona, including across settings changes
//! - latest-wins message delivery and untracked-thread drops
//! - tool calls delivered in arrival order, after the worker is ready
//! - fatal tool-set mismatch and thread cap violations
//! - retirement of personas and tasks missing from a re-subscribe replay

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use warden_orchestrator_core::application::event_router::{EventRouter, RouterError, RouterSettings};
use warden_orchestrator_core::application::worker::{SupervisedWorkerLauncher, WorkerLauncher, WorkerSettings};
use warden_orchestrator_core::domain::events::{
    BotEvent, MessagePayload, TaskId, TaskPayload, ThreadId, ThreadPayload, ToolCallInvocation,
};
use warden_orchestrator_core::domain::handler::{BotFactory, ToolCallOutcome, WorkerHandler};
use warden_orchestrator_core::domain::host_config::{ThreadOverflowPolicy, ToolCallMode};
use warden_orchestrator_core::domain::inbox::WorkerInbox;
use warden_orchestrator_core::domain::persona::{PersonaConfig, PersonaId};
use warden_orchestrator_core::domain::supervisor::{MetricsSupervisorObserver, RestartPolicy, WorkerSupervisor};
use warden_orchestrator_core::infrastructure::in_memory_upstream::InMemoryUpstream;

// ============================================================================
// Fixtures
// ============================================================================

/// Launcher whose workers do nothing but count how many are alive at once.
#[derive(Default)]
struct CountingLauncher {
    launches: AtomicUsize,
    live: Arc<Mutex<HashMap<PersonaId, usize>>>,
    max_live_per_persona: Arc<AtomicUsize>,
}

impl WorkerLauncher for CountingLauncher {
    fn launch(&self, inbox: Arc<WorkerInbox>, cancel: CancellationToken) -> JoinHandle<()> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let persona_id = inbox.persona_id().clone();
        let live = self.live.clone();
        let max_live = self.max_live_per_persona.clone();

        {
            let mut live = live.lock();
            let count = live.entry(persona_id.clone()).or_default();
            *count += 1;
            max_live.fetch_max(*count, Ordering::SeqCst);
        }

        tokio::spawn(async move {
            cancel.cancelled().await;
            // a slow shutdown widens any window in which two workers could overlap
            tokio::time::sleep(Duration::from_millis(20)).await;
            *live.lock().entry(persona_id).or_default() -= 1;
        })
    }
}

impl CountingLauncher {
    fn live(&self, persona_id: &str) -> usize {
        self.live.lock().get(&PersonaId::new(persona_id)).copied().unwrap_or(0)
    }
}

/// Handler that records tool calls and answers with the call id.
struct RecordingBot {
    tools: BTreeSet<String>,
    calls: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl WorkerHandler for RecordingBot {
    fn tool_names(&self) -> BTreeSet<String> {
        self.tools.clone()
    }

    async fn on_message_updated(&self, _message: MessagePayload) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_thread_updated(&self, _thread: ThreadPayload) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_task_updated(&self, _task: TaskPayload) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_tool_call(
        &self,
        call: &ToolCallInvocation,
        _arguments: Map<String, Value>,
    ) -> anyhow::Result<ToolCallOutcome> {
        self.calls.lock().push(call.fcall_id.clone());
        // give later calls a chance to overtake if ordering were broken
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok(ToolCallOutcome::text(format!("done {}", call.fcall_id)))
    }
}

struct RecordingFactory {
    tools: BTreeSet<String>,
    calls: Arc<Mutex<Vec<String>>>,
    build_delay: Duration,
}

#[async_trait]
impl BotFactory for RecordingFactory {
    async fn build(&self, _persona: &PersonaConfig) -> anyhow::Result<Arc<dyn WorkerHandler>> {
        tokio::time::sleep(self.build_delay).await;
        Ok(Arc::new(RecordingBot {
            tools: self.tools.clone(),
            calls: self.calls.clone(),
        }))
    }
}

fn tools(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|n| n.to_string()).collect()
}

fn settings(declared: &[&str], max_threads: usize) -> RouterSettings {
    RouterSettings {
        declared_tools: tools(declared),
        max_threads,
        thread_overflow: ThreadOverflowPolicy::Fail,
        tool_handler_poll_attempts: 20,
        tool_handler_poll_interval: Duration::from_millis(25),
    }
}

/// Router backed by real supervised workers and an in-memory upstream.
fn live_router(
    declared: &[&str],
    registered: &[&str],
    build_delay: Duration,
) -> (EventRouter, Arc<InMemoryUpstream>, Arc<Mutex<Vec<String>>>, CancellationToken) {
    let upstream = Arc::new(InMemoryUpstream::new());
    let calls = Arc::new(Mutex::new(Vec::new()));
    let factory = Arc::new(RecordingFactory {
        tools: tools(registered),
        calls: calls.clone(),
        build_delay,
    });
    let supervisor = Arc::new(WorkerSupervisor::new(
        RestartPolicy::Fixed {
            cooldown: Duration::from_millis(50),
        },
        Arc::new(MetricsSupervisorObserver),
    ));
    let launcher = Arc::new(SupervisedWorkerLauncher::new(
        factory,
        upstream.clone(),
        supervisor,
        WorkerSettings {
            idle_timeout: Duration::from_millis(50),
            tool_call_mode: ToolCallMode::Sequential,
        },
    ));
    let shutdown = CancellationToken::new();
    let router = EventRouter::new(settings(declared, 100), launcher, shutdown.clone());
    (router, upstream, calls, shutdown)
}

fn persona(id: &str, tone: &str) -> BotEvent {
    let mut settings = Map::new();
    settings.insert("tone".to_string(), json!(tone));
    BotEvent::PersonaUpserted(PersonaConfig::new(id, settings))
}

fn thread(id: &str, owner: &str) -> BotEvent {
    BotEvent::ThreadUpserted(serde_json::from_value(json!({"ft_id": id, "ft_persona_id": owner})).unwrap())
}

fn task(id: &str, owner: &str) -> BotEvent {
    BotEvent::TaskUpserted(serde_json::from_value(json!({"ktask_id": id, "ktask_persona_id": owner})).unwrap())
}

fn message(thread_id: &str, alt: i64, num: i64, content: &str) -> BotEvent {
    BotEvent::MessageUpserted(
        serde_json::from_value(json!({
            "ftm_belongs_to_ft_id": thread_id,
            "ftm_alt": alt,
            "ftm_num": num,
            "ftm_role": "user",
            "ftm_content": content
        }))
        .unwrap(),
    )
}

fn tool_call(id: &str, persona_id: &str, name: &str) -> BotEvent {
    BotEvent::ToolCall(
        serde_json::from_value(json!({
            "fcall_id": id,
            "fcall_ft_id": "t-1",
            "fcall_name": name,
            "fcall_arguments": "{}",
            "connected_persona_id": persona_id
        }))
        .unwrap(),
    )
}

// ============================================================================
// Worker lifecycle
// ============================================================================

#[tokio::test]
async fn test_one_worker_per_persona() {
    let launcher = Arc::new(CountingLauncher::default());
    let mut router = EventRouter::new(settings(&[], 100), launcher.clone(), CancellationToken::new());
    router.begin_subscription();

    router.route(persona("p-1", "formal")).await.unwrap();
    router.route(persona("p-1", "formal")).await.unwrap();
    router.route(persona("p-2", "formal")).await.unwrap();

    assert_eq!(launcher.launches.load(Ordering::SeqCst), 2);
    assert_eq!(router.registry().worker_count(), 2);
    assert_eq!(launcher.live("p-1"), 1);

    router.shutdown_workers(Duration::from_secs(5)).await;
    assert_eq!(launcher.live("p-1"), 0);
    assert_eq!(launcher.live("p-2"), 0);
}

#[tokio::test]
async fn test_settings_change_replaces_worker_without_overlap() {
    let launcher = Arc::new(CountingLauncher::default());
    let mut router = EventRouter::new(settings(&[], 100), launcher.clone(), CancellationToken::new());
    router.begin_subscription();

    router.route(persona("p-1", "formal")).await.unwrap();
    let old_inbox = router.registry().inbox(&PersonaId::new("p-1")).unwrap();
    router.route(thread("t-1", "p-1")).await.unwrap();
    assert!(old_inbox.pending_len() > 0);

    router.route(persona("p-1", "casual")).await.unwrap();

    assert_eq!(launcher.launches.load(Ordering::SeqCst), 2);
    assert_eq!(launcher.max_live_per_persona.load(Ordering::SeqCst), 1);
    assert_eq!(launcher.live("p-1"), 1);

    // the replacement starts from a fresh inbox, re-seeded with the tracked thread
    let new_inbox = router.registry().inbox(&PersonaId::new("p-1")).unwrap();
    assert!(!Arc::ptr_eq(&old_inbox, &new_inbox));
    assert_eq!(new_inbox.take_all().threads.len(), 1);
    assert_eq!(new_inbox.persona().setting("tone"), Some(&json!("casual")));

    router.shutdown_workers(Duration::from_secs(5)).await;
    assert_eq!(launcher.live("p-1"), 0);
}

#[tokio::test]
async fn test_unchanged_settings_swap_snapshot_only() {
    let launcher = Arc::new(CountingLauncher::default());
    let mut router = EventRouter::new(settings(&[], 100), launcher.clone(), CancellationToken::new());

    let mut renamed = PersonaConfig::new("p-1", Map::new());
    router.route(BotEvent::PersonaUpserted(renamed.clone())).await.unwrap();
    renamed.persona_name = "Support Desk".to_string();
    router.route(BotEvent::PersonaUpserted(renamed)).await.unwrap();

    assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
    let inbox = router.registry().inbox(&PersonaId::new("p-1")).unwrap();
    assert_eq!(inbox.persona().persona_name, "Support Desk");
    router.shutdown_workers(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_persona_delete_stops_worker() {
    let launcher = Arc::new(CountingLauncher::default());
    let mut router = EventRouter::new(settings(&[], 100), launcher.clone(), CancellationToken::new());

    router.route(persona("p-1", "formal")).await.unwrap();
    router
        .route(BotEvent::PersonaDeleted(PersonaId::new("p-1")))
        .await
        .unwrap();

    assert_eq!(router.registry().worker_count(), 0);
    assert_eq!(launcher.live("p-1"), 0);
}

#[tokio::test]
async fn test_replay_retires_personas_missing_after_resubscribe() {
    let launcher = Arc::new(CountingLauncher::default());
    let mut router = EventRouter::new(settings(&[], 100), launcher.clone(), CancellationToken::new());

    router.begin_subscription();
    router.route(persona("p-1", "formal")).await.unwrap();
    router.route(persona("p-2", "formal")).await.unwrap();
    router.route(BotEvent::InitialSyncComplete).await.unwrap();
    assert_eq!(router.registry().worker_count(), 2);

    router.begin_subscription();
    router.route(persona("p-1", "formal")).await.unwrap();
    router.route(BotEvent::InitialSyncComplete).await.unwrap();

    assert_eq!(router.registry().persona_ids(), vec![PersonaId::new("p-1")]);
    assert_eq!(launcher.live("p-2"), 0);
    // p-1 kept its worker across the reconnect
    assert_eq!(launcher.launches.load(Ordering::SeqCst), 2);

    router.shutdown_workers(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_tasks_from_previous_subscription_are_not_reseeded() {
    let launcher = Arc::new(CountingLauncher::default());
    let mut router = EventRouter::new(settings(&[], 100), launcher.clone(), CancellationToken::new());

    router.begin_subscription();
    router.route(persona("p-1", "formal")).await.unwrap();
    router.route(task("k-old", "p-1")).await.unwrap();
    router.route(BotEvent::InitialSyncComplete).await.unwrap();

    // k-old was deleted upstream while disconnected, so the replay omits it
    router.begin_subscription();
    router.route(persona("p-1", "formal")).await.unwrap();
    router.route(task("k-live", "p-1")).await.unwrap();
    router.route(BotEvent::InitialSyncComplete).await.unwrap();
    assert!(router.registry().task_owner(&TaskId::new("k-old")).is_none());

    // a settings change restarts the worker, seeded from the task cache
    router.route(persona("p-1", "casual")).await.unwrap();
    let inbox = router.registry().inbox(&PersonaId::new("p-1")).unwrap();
    let ids: Vec<String> = inbox
        .take_all()
        .tasks
        .iter()
        .map(|t| t.ktask_id.to_string())
        .collect();
    assert_eq!(ids, vec!["k-live".to_string()]);

    router.shutdown_workers(Duration::from_secs(5)).await;
}

// ============================================================================
// Threads and messages
// ============================================================================

#[tokio::test]
async fn test_duplicate_message_is_idempotent() {
    let launcher = Arc::new(CountingLauncher::default());
    let mut router = EventRouter::new(settings(&[], 100), launcher, CancellationToken::new());
    router.route(persona("p-1", "formal")).await.unwrap();
    router.route(thread("t-1", "p-1")).await.unwrap();
    let inbox = router.registry().inbox(&PersonaId::new("p-1")).unwrap();
    inbox.take_all();

    router.route(message("t-1", 100, 1, "hello")).await.unwrap();
    router.route(message("t-1", 100, 1, "hello")).await.unwrap();
    let once = inbox.take_all();

    router.route(message("t-1", 100, 1, "hello")).await.unwrap();
    let single = inbox.take_all();

    assert_eq!(once.messages, single.messages);
    assert_eq!(once.messages.len(), 1);
    router.shutdown_workers(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_message_for_untracked_thread_is_dropped() {
    let launcher = Arc::new(CountingLauncher::default());
    let mut router = EventRouter::new(settings(&[], 100), launcher, CancellationToken::new());
    router.route(persona("p-1", "formal")).await.unwrap();
    let inbox = router.registry().inbox(&PersonaId::new("p-1")).unwrap();

    router.route(message("t-unknown", 100, 1, "lost")).await.unwrap();
    assert_eq!(inbox.pending_len(), 0);

    // the thread arrives right after: earlier messages are not resurrected, later ones flow
    router.route(thread("t-unknown", "p-1")).await.unwrap();
    router.route(message("t-unknown", 100, 2, "kept")).await.unwrap();
    let batch = inbox.take_all();
    assert_eq!(batch.threads.len(), 1);
    assert_eq!(batch.messages.len(), 1);
    assert_eq!(batch.messages[0].ftm_num, 2);
    router.shutdown_workers(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_messages_cached_before_worker_are_seeded() {
    let launcher = Arc::new(CountingLauncher::default());
    let mut router = EventRouter::new(settings(&[], 100), launcher, CancellationToken::new());
    router.begin_subscription();

    router.route(thread("t-1", "p-1")).await.unwrap();
    router.route(message("t-1", 100, 1, "a")).await.unwrap();
    router.route(message("t-1", 100, 2, "b")).await.unwrap();
    router.route(persona("p-1", "formal")).await.unwrap();

    let inbox = router.registry().inbox(&PersonaId::new("p-1")).unwrap();
    let batch = inbox.take_all();
    assert_eq!(batch.messages.len(), 2);
    assert_eq!(batch.threads.len(), 1);
    router.shutdown_workers(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_stop_tracking_prunes_known_threads() {
    let launcher = Arc::new(CountingLauncher::default());
    let mut router = EventRouter::new(settings(&[], 100), launcher, CancellationToken::new());
    router.route(persona("p-1", "formal")).await.unwrap();
    router.route(thread("t-1", "p-1")).await.unwrap();
    assert_eq!(router.status().workers[0].known_threads, 1);

    router
        .route(BotEvent::ThreadRemoved(ThreadId::new("t-1")))
        .await
        .unwrap();
    assert_eq!(router.registry().tracked_threads(), 0);
    assert_eq!(router.status().workers[0].known_threads, 0);
    router.shutdown_workers(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_thread_cap_evict_oldest_policy() {
    let launcher = Arc::new(CountingLauncher::default());
    let mut settings = settings(&[], 2);
    settings.thread_overflow = ThreadOverflowPolicy::EvictOldest;
    let shutdown = CancellationToken::new();
    let mut router = EventRouter::new(settings, launcher, shutdown.clone());

    for id in ["t-1", "t-2", "t-3"] {
        router.route(thread(id, "p-1")).await.unwrap();
    }

    assert_eq!(router.registry().tracked_threads(), 2);
    assert!(router.registry().thread(&ThreadId::new("t-1")).is_none());
    assert!(!shutdown.is_cancelled());
}

#[tokio::test]
async fn test_thread_cap_fail_policy_stops_routing() {
    let launcher = Arc::new(CountingLauncher::default());
    let shutdown = CancellationToken::new();
    let mut router = EventRouter::new(settings(&[], 2), launcher, shutdown.clone());

    router.route(thread("t-1", "p-1")).await.unwrap();
    router.route(thread("t-2", "p-1")).await.unwrap();
    let err = router.route(thread("t-3", "p-1")).await.unwrap_err();

    assert!(matches!(err, RouterError::ThreadCapExceeded { .. }));
    assert!(shutdown.is_cancelled());
    assert!(router.is_halted());
}

// ============================================================================
// Tool calls
// ============================================================================

#[tokio::test]
async fn test_tool_calls_processed_in_arrival_order() {
    let (mut router, upstream, calls, _shutdown) = live_router(&["search"], &["search"], Duration::ZERO);
    router.route(persona("p-1", "formal")).await.unwrap();

    for id in ["A", "B", "C"] {
        router.route(tool_call(id, "p-1", "search")).await.unwrap();
    }

    let posted = upstream
        .wait_for_posted(3, Duration::from_secs(5))
        .await
        .expect("three results");
    let order: Vec<_> = posted.iter().map(|r| r.fcall_id.as_str()).collect();
    assert_eq!(order, vec!["A", "B", "C"]);
    assert_eq!(*calls.lock(), vec!["A", "B", "C"]);
    assert_eq!(posted[0].content, "done A");

    router.shutdown_workers(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_tool_call_before_registration_is_delivered() {
    // the handler takes a while to build; the call arrives immediately
    let (mut router, upstream, _calls, _shutdown) =
        live_router(&["search"], &["search"], Duration::from_millis(150));
    router.route(persona("p-1", "formal")).await.unwrap();
    router.route(tool_call("early", "p-1", "search")).await.unwrap();

    let inbox = router.registry().inbox(&PersonaId::new("p-1")).unwrap();
    assert!(inbox.reached_main_loop());
    assert!(inbox.has_tool("search"));

    let posted = upstream.wait_for_posted(1, Duration::from_secs(5)).await.unwrap();
    assert_eq!(posted[0].fcall_id, "early");
    router.shutdown_workers(Duration::from_secs(5)).await;
}

/// Launcher that marks the worker ready on its own schedule and never drains.
struct SlowRegistrationLauncher {
    tools: BTreeSet<String>,
    delay: Duration,
}

impl WorkerLauncher for SlowRegistrationLauncher {
    fn launch(&self, inbox: Arc<WorkerInbox>, cancel: CancellationToken) -> JoinHandle<()> {
        let tools = self.tools.clone();
        let delay = self.delay;
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            inbox.register_tools(tools);
            inbox.mark_reached_main_loop();
            cancel.cancelled().await;
        })
    }
}

#[tokio::test]
async fn test_ready_flag_observed_before_call_is_queued() {
    let launcher = Arc::new(SlowRegistrationLauncher {
        tools: tools(&["search"]),
        delay: Duration::from_millis(60),
    });
    let mut router = EventRouter::new(settings(&["search"], 100), launcher, CancellationToken::new());
    router.route(persona("p-1", "formal")).await.unwrap();

    let inbox = router.registry().inbox(&PersonaId::new("p-1")).unwrap();
    assert!(!inbox.reached_main_loop());

    router.route(tool_call("c-1", "p-1", "search")).await.unwrap();
    assert!(inbox.reached_main_loop());
    assert_eq!(inbox.pending_tool_call_ids(), vec!["c-1".to_string()]);
    router.shutdown_workers(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_registration_outside_poll_window_drops_call() {
    let launcher = Arc::new(SlowRegistrationLauncher {
        tools: tools(&["search"]),
        delay: Duration::from_secs(30),
    });
    let mut settings = settings(&["search"], 100);
    settings.tool_handler_poll_attempts = 3;
    settings.tool_handler_poll_interval = Duration::from_millis(5);
    let mut router = EventRouter::new(settings, launcher, CancellationToken::new());
    router.route(persona("p-1", "formal")).await.unwrap();

    router.route(tool_call("c-1", "p-1", "search")).await.unwrap();
    let inbox = router.registry().inbox(&PersonaId::new("p-1")).unwrap();
    assert!(inbox.pending_tool_call_ids().is_empty());
    router.shutdown_workers(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_tool_set_mismatch_shuts_everything_down() {
    let (mut router, upstream, calls, shutdown) = live_router(&["A", "B"], &["A"], Duration::ZERO);
    router.route(persona("p-1", "formal")).await.unwrap();
    router.route(persona("p-2", "formal")).await.unwrap();

    let err = router.route(tool_call("c-1", "p-1", "B")).await.unwrap_err();
    match err {
        RouterError::ToolSetMismatch {
            persona_id,
            declared,
            registered,
        } => {
            assert_eq!(persona_id, PersonaId::new("p-1"));
            assert_eq!(declared, tools(&["A", "B"]));
            assert_eq!(registered, tools(&["A"]));
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert!(shutdown.is_cancelled());

    // no further calls are accepted, for any worker
    assert_eq!(
        router.route(tool_call("c-2", "p-2", "A")).await,
        Err(RouterError::Halted)
    );
    router.shutdown_workers(Duration::from_secs(5)).await;
    assert!(calls.lock().is_empty());
    assert!(upstream.posted_results().is_empty());
}
