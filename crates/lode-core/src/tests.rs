// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
/// End-to-end tests for the agent loop and the tool dispatcher.
///
/// Uses `ScriptedMockClient` so every scenario is deterministic and needs no
/// network access.  Time-sensitive tests run under a paused tokio clock.
mod loop_tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    use lode_config::RuntimeConfig;
    use lode_memory::{MemoryFileStore, WorkingMemory};
    use lode_model::{
        GenerationPipeline, ModelClient, Router, ScriptedMockClient, ScriptedReply,
    };
    use lode_tools::{Tool, ToolCall, ToolOutput, ToolRegistry, ToolSpec};
    use lode_trace::{FailureObserver, TraceStore};

    use crate::{
        event_channel, Agent, AgentDeps, AgentHandle, BasicPolicy, BatchMode, CallSpec,
        ConfirmationGate, DispatchOutcome, DoneStatus, Event, EventReceiver, ResearchPolicy,
        SessionParams, ToolCallStatus, ToolDispatcher, ToolResultStatus,
    };

    // ── Test tools ────────────────────────────────────────────────────────────

    #[derive(Debug)]
    struct EchoTool {
        spec: ToolSpec,
    }

    impl EchoTool {
        fn new() -> Self {
            Self {
                spec: ToolSpec::new(
                    "echo",
                    "echoes the msg argument",
                    json!({
                        "type": "object",
                        "properties": { "msg": { "type": "string" } },
                        "required": ["msg"]
                    }),
                ),
            }
        }
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn spec(&self) -> &ToolSpec {
            &self.spec
        }
        async fn execute(&self, call: &ToolCall) -> ToolOutput {
            ToolOutput::ok(&call.id, call.args["msg"].as_str().unwrap_or_default())
        }
    }

    /// Always fails with a permission error.
    #[derive(Debug)]
    struct DeniedTool {
        spec: ToolSpec,
    }

    impl DeniedTool {
        fn new() -> Self {
            Self {
                spec: ToolSpec::new("locked", "always denied", json!({"type": "object"})),
            }
        }
    }

    #[async_trait]
    impl Tool for DeniedTool {
        fn spec(&self) -> &ToolSpec {
            &self.spec
        }
        async fn execute(&self, call: &ToolCall) -> ToolOutput {
            ToolOutput::err(&call.id, "permission denied")
        }
    }

    /// Sleeps for a configured duration, then reports its own name.
    #[derive(Debug)]
    struct SleepTool {
        spec: ToolSpec,
        sleep: Duration,
    }

    impl SleepTool {
        fn new(name: &str, sleep_ms: u64) -> Self {
            Self {
                spec: ToolSpec::new(name, "sleeps then returns", json!({"type": "object"})),
                sleep: Duration::from_millis(sleep_ms),
            }
        }
    }

    #[async_trait]
    impl Tool for SleepTool {
        fn spec(&self) -> &ToolSpec {
            &self.spec
        }
        async fn execute(&self, call: &ToolCall) -> ToolOutput {
            tokio::time::sleep(self.sleep).await;
            ToolOutput::ok(&call.id, self.spec.name.clone())
        }
    }

    /// Tracks how many executions overlap, for the concurrency bound check.
    #[derive(Debug)]
    struct CountingTool {
        spec: ToolSpec,
        current: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for CountingTool {
        fn spec(&self) -> &ToolSpec {
            &self.spec
        }
        async fn execute(&self, call: &ToolCall) -> ToolOutput {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            ToolOutput::ok(&call.id, "counted")
        }
    }

    /// Requires operator confirmation before running.
    #[derive(Debug)]
    struct GuardedTool {
        spec: ToolSpec,
    }

    impl GuardedTool {
        fn new() -> Self {
            Self {
                spec: ToolSpec::new("deploy", "pushes to production", json!({"type": "object"}))
                    .confirmed(),
            }
        }
    }

    #[async_trait]
    impl Tool for GuardedTool {
        fn spec(&self) -> &ToolSpec {
            &self.spec
        }
        async fn execute(&self, call: &ToolCall) -> ToolOutput {
            ToolOutput::ok(&call.id, "deployed")
        }
    }

    // ── Helpers ───────────────────────────────────────────────────────────────

    fn fast_config() -> RuntimeConfig {
        let mut config = RuntimeConfig::default();
        config.fallback.retry_delay_ms = 0;
        config
    }

    fn deps_with(
        client: ScriptedMockClient,
        registry: ToolRegistry,
        config: RuntimeConfig,
    ) -> AgentDeps {
        let config = Arc::new(config);
        let observer = Arc::new(FailureObserver::new(config.strike_threshold));
        let store = Arc::new(TraceStore::new(observer));
        let router = Arc::new(Router::new(config.breaker.clone()));
        let pipeline = Arc::new(
            GenerationPipeline::new(router, config.fallback.clone())
                .with_trace_store(Arc::clone(&store))
                .with_client(
                    "anthropic/claude-3-5-sonnet",
                    Arc::new(client) as Arc<dyn ModelClient>,
                ),
        );
        let memory = Arc::new(WorkingMemory::new(
            Arc::new(MemoryFileStore::new()),
            "s1",
            config.memory.clone(),
            config.strike_threshold as u32,
        ));
        AgentDeps {
            config,
            registry: Arc::new(registry),
            pipeline,
            store,
            memory,
        }
    }

    fn agent_with(
        client: ScriptedMockClient,
        registry: ToolRegistry,
        config: RuntimeConfig,
        policy: Box<dyn crate::LoopPolicy>,
    ) -> (Agent, AgentHandle) {
        let deps = deps_with(client, registry, config);
        Agent::new(SessionParams::new("s1", "u1", "w1"), policy, deps)
    }

    /// Drain the channel into a Vec after the run has finished.
    async fn collect_events(mut rx: EventReceiver) -> Vec<Event> {
        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
        events
    }

    fn content_text(events: &[Event]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                Event::Content { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    fn done_of(events: &[Event]) -> (DoneStatus, u32) {
        match events.last() {
            Some(Event::Done {
                status, iterations, ..
            }) => (*status, *iterations),
            other => panic!("last event must be Done, got {other:?}"),
        }
    }

    // ── Scenario: no-tool answer ──────────────────────────────────────────────

    #[tokio::test]
    async fn no_tool_answer() {
        let client = ScriptedMockClient::always_text("hi");
        let (mut agent, _handle) = agent_with(
            client,
            ToolRegistry::new(),
            fast_config(),
            Box::new(BasicPolicy),
        );
        let (tx, rx) = event_channel(256);

        agent.run("say hi", tx).await.unwrap();
        let events = collect_events(rx).await;

        assert!(events
            .iter()
            .any(|e| matches!(e, Event::Thinking { .. })));
        assert_eq!(content_text(&events), "hi");
        let (status, iterations) = done_of(&events);
        assert_eq!(status, DoneStatus::Completed);
        assert_eq!(iterations, 1);
    }

    // ── Scenario: single tool call then answer ────────────────────────────────

    #[tokio::test]
    async fn single_tool_call_then_answer() {
        let client =
            ScriptedMockClient::tool_then_text("c1", "echo", json!({"msg": "pong"}), "done");
        let registry = ToolRegistry::new();
        registry.register(EchoTool::new()).unwrap();
        let (mut agent, _handle) = agent_with(
            client,
            registry,
            fast_config(),
            Box::new(ResearchPolicy::new()),
        );
        let (tx, rx) = event_channel(256);

        agent.run("ping", tx).await.unwrap();
        let events = collect_events(rx).await;

        let pending = events.iter().position(|e| {
            matches!(e, Event::ToolCall { call_id, status: ToolCallStatus::Pending, .. } if call_id == "c1")
        });
        let running = events.iter().position(|e| {
            matches!(e, Event::ToolCall { call_id, status: ToolCallStatus::Running, .. } if call_id == "c1")
        });
        let result = events.iter().position(|e| {
            matches!(e, Event::ToolResult { call_id, status: ToolResultStatus::Success, result: Some(r), .. }
                if call_id == "c1" && r == "pong")
        });
        assert!(pending.is_some(), "missing pending event");
        assert!(
            pending < running && running < result,
            "lifecycle events out of order: {pending:?} {running:?} {result:?}"
        );

        assert_eq!(content_text(&events), "done");
        let (status, iterations) = done_of(&events);
        assert_eq!(status, DoneStatus::Completed);
        assert_eq!(iterations, 2);
    }

    #[tokio::test]
    async fn tool_result_lands_in_conversation_history() {
        let client =
            ScriptedMockClient::tool_then_text("c1", "echo", json!({"msg": "42"}), "done");
        let registry = ToolRegistry::new();
        registry.register(EchoTool::new()).unwrap();
        let (mut agent, _handle) = agent_with(
            client,
            registry,
            fast_config(),
            Box::new(ResearchPolicy::new()),
        );
        let (tx, rx) = event_channel(256);
        agent.run("ping", tx).await.unwrap();
        let _ = collect_events(rx).await;

        let history = &agent.context().messages;
        assert!(history.iter().any(|m| matches!(
            &m.content,
            lode_model::MessageContent::ToolResult { content, .. } if content == "42"
        )));
    }

    // ── Scenario: 3-strike abort then reboot ─────────────────────────────────

    #[tokio::test]
    async fn three_strikes_trigger_reboot_and_loop_resumes() {
        let client = ScriptedMockClient::new(vec![ScriptedReply::ToolCall {
            id: String::new(),
            name: "locked".into(),
            input: json!({}),
        }])
        .repeating();
        let registry = ToolRegistry::new();
        registry.register(DeniedTool::new()).unwrap();
        let mut config = fast_config();
        config.max_iterations = 4;
        let (mut agent, _handle) = agent_with(
            client,
            registry,
            config,
            Box::new(ResearchPolicy::new()),
        );
        let (tx, rx) = event_channel(512);

        agent.run("try it", tx).await.unwrap();
        let events = collect_events(rx).await;

        let errors = events
            .iter()
            .filter(|e| matches!(e, Event::ToolResult { status: ToolResultStatus::Error, .. }))
            .count();
        assert!(errors >= 3, "expected at least three failing tool results");

        let strike = events
            .iter()
            .position(|e| matches!(e, Event::Error { kind, .. } if kind == "3-Strike"))
            .expect("3-Strike error event missing");

        // The reboot review: five numbered thinking events after the strike.
        for marker in ["1.", "2.", "3.", "4.", "5."] {
            assert!(
                events[strike..].iter().any(
                    |e| matches!(e, Event::Thinking { text } if text.starts_with(marker))
                ),
                "missing reboot question {marker}"
            );
        }

        // The loop resumed after the reboot: a fourth iteration ran.
        let (status, iterations) = done_of(&events);
        assert_eq!(iterations, 4);
        assert_eq!(status, DoneStatus::Stopped);
    }

    // ── Scenario: context-clear substitution ──────────────────────────────────

    #[tokio::test]
    async fn context_clear_substitutes_history_with_summary() {
        let client = ScriptedMockClient::always_text("ok");
        let (mut agent, _handle) = agent_with(
            client,
            ToolRegistry::new(),
            fast_config(),
            Box::new(BasicPolicy),
        );
        agent.memory().write_plan("# Plan\n\n## Goal\ntest goal\n").unwrap();
        for i in 0..16 {
            agent
                .context_mut()
                .messages
                .push(lode_model::Message::user(format!("earlier turn {i}")));
        }
        let (tx, rx) = event_channel(256);

        agent.run("latest question", tx).await.unwrap();
        let _ = collect_events(rx).await;

        let history = &agent.context().messages;
        // Synthetic system message plus the final assistant answer.
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, lode_model::Role::System);
        let body = history[0].as_text().unwrap();
        assert!(body.contains("## Objective"));
        assert!(body.contains("test goal"));

        let progress = agent.memory().read_progress(10_000).unwrap();
        assert!(progress.contains("Context Cleared"));
    }

    // ── Boundary: zero iterations ─────────────────────────────────────────────

    #[tokio::test]
    async fn zero_max_iterations_emits_only_done_stopped() {
        let client = ScriptedMockClient::always_text("never used");
        let mut config = fast_config();
        config.max_iterations = 0;
        let (mut agent, _handle) = agent_with(
            client,
            ToolRegistry::new(),
            config,
            Box::new(BasicPolicy),
        );
        let (tx, rx) = event_channel(16);

        agent.run("hello", tx).await.unwrap();
        let events = collect_events(rx).await;

        assert_eq!(events.len(), 1, "expected exactly one event: {events:?}");
        assert!(matches!(
            events[0],
            Event::Done {
                status: DoneStatus::Stopped,
                iterations: 0,
                ..
            }
        ));
    }

    // ── Boundary: tool request with empty registry ────────────────────────────

    #[tokio::test]
    async fn tool_request_without_tools_aborts() {
        let client = ScriptedMockClient::new(vec![ScriptedReply::ToolCall {
            id: "c1".into(),
            name: "ghost".into(),
            input: json!({}),
        }]);
        let (mut agent, _handle) = agent_with(
            client,
            ToolRegistry::new(),
            fast_config(),
            Box::new(ResearchPolicy::new()),
        );
        let (tx, rx) = event_channel(256);

        agent.run("go", tx).await.unwrap();
        let events = collect_events(rx).await;

        assert!(events.iter().any(|e| matches!(
            e,
            Event::ToolResult { status: ToolResultStatus::Error, error: Some(msg), .. }
                if msg.contains("not found")
        )));
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::Error { kind, .. } if kind == "tool_not_found")));
        let (status, _) = done_of(&events);
        assert_eq!(status, DoneStatus::Aborted);
    }

    // ── Boundary: model failure aborts the run ────────────────────────────────

    #[tokio::test]
    async fn all_model_attempts_failed_aborts() {
        let client = ScriptedMockClient::always_network_error("down");
        let mut config = fast_config();
        // Keep the chain to registered models only so the walk stays short.
        config.fallback.fallback_chain = vec!["anthropic/claude-3-5-sonnet".into()];
        config.fallback.use_default_model = false;
        let (mut agent, _handle) = agent_with(
            client,
            ToolRegistry::new(),
            config,
            Box::new(BasicPolicy),
        );
        let (tx, rx) = event_channel(256);

        agent.run("hello", tx).await.unwrap();
        let events = collect_events(rx).await;

        assert!(events.iter().any(|e| matches!(
            e,
            Event::Error { kind, recoverable: false, .. } if kind == "all_attempts_failed"
        )));
        let (status, _) = done_of(&events);
        assert_eq!(status, DoneStatus::Aborted);
    }

    // ── Operator control ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn stop_before_run_yields_stopped_with_zero_iterations() {
        let client = ScriptedMockClient::always_text("unused");
        let (mut agent, handle) = agent_with(
            client,
            ToolRegistry::new(),
            fast_config(),
            Box::new(BasicPolicy),
        );
        handle.stop();
        let (tx, rx) = event_channel(16);

        agent.run("hello", tx).await.unwrap();
        let events = collect_events(rx).await;

        let (status, iterations) = done_of(&events);
        assert_eq!(status, DoneStatus::Stopped);
        assert_eq!(iterations, 0);
    }

    #[tokio::test]
    async fn confirmation_accept_runs_the_tool() {
        let client =
            ScriptedMockClient::tool_then_text("c1", "deploy", json!({}), "released");
        let registry = ToolRegistry::new();
        registry.register(GuardedTool::new()).unwrap();
        let (mut agent, handle) = agent_with(
            client,
            registry,
            fast_config(),
            Box::new(ResearchPolicy::new()),
        );
        let (tx, mut rx) = event_channel(256);

        let approver = tokio::spawn(async move {
            let mut events = Vec::new();
            while let Some(ev) = rx.recv().await {
                if let Event::ConfirmRequired { action_id, .. } = &ev {
                    handle.confirm(action_id, true);
                }
                events.push(ev);
            }
            events
        });

        agent.run("ship it", tx).await.unwrap();
        let events = approver.await.unwrap();

        assert!(events.iter().any(|e| matches!(
            e,
            Event::ToolResult { status: ToolResultStatus::Success, result: Some(r), .. }
                if r == "deployed"
        )));
        let (status, _) = done_of(&events);
        assert_eq!(status, DoneStatus::Completed);
    }

    #[tokio::test]
    async fn confirmation_reject_cancels_and_stops() {
        let client =
            ScriptedMockClient::tool_then_text("c1", "deploy", json!({}), "unreachable");
        let registry = ToolRegistry::new();
        registry.register(GuardedTool::new()).unwrap();
        let (mut agent, handle) = agent_with(
            client,
            registry,
            fast_config(),
            Box::new(ResearchPolicy::new()),
        );
        let (tx, mut rx) = event_channel(256);

        let rejecter = tokio::spawn(async move {
            let mut events = Vec::new();
            while let Some(ev) = rx.recv().await {
                if let Event::ConfirmRequired { action_id, .. } = &ev {
                    handle.confirm(action_id, false);
                }
                events.push(ev);
            }
            events
        });

        agent.run("ship it", tx).await.unwrap();
        let events = rejecter.await.unwrap();

        assert!(events.iter().any(|e| matches!(
            e,
            Event::ToolResult { status: ToolResultStatus::Cancelled, .. }
        )));
        let (status, _) = done_of(&events);
        assert_eq!(status, DoneStatus::Stopped);
    }

    // ── Dispatcher: batch modes ───────────────────────────────────────────────

    fn dispatcher_fixture(
        registry: ToolRegistry,
        config: RuntimeConfig,
    ) -> (ToolDispatcher, CancellationToken) {
        let observer = Arc::new(FailureObserver::new(3));
        let store = Arc::new(TraceStore::new(observer));
        let memory = Arc::new(WorkingMemory::new(
            Arc::new(MemoryFileStore::new()),
            "s1",
            config.memory.clone(),
            3,
        ));
        let cancel = CancellationToken::new();
        let dispatcher = ToolDispatcher::new(
            Arc::new(registry),
            store,
            memory,
            Arc::new(ConfirmationGate::new()),
            cancel.clone(),
            &config,
            "s1",
        );
        (dispatcher, cancel)
    }

    #[tokio::test(start_paused = true)]
    async fn streaming_batch_emits_in_completion_order() {
        let registry = ToolRegistry::new();
        registry.register(SleepTool::new("slow", 120)).unwrap();
        registry.register(SleepTool::new("fast", 30)).unwrap();
        registry.register(SleepTool::new("mid", 60)).unwrap();
        let mut config = fast_config();
        config.max_concurrent_tools = 2;
        let (dispatcher, _cancel) = dispatcher_fixture(registry, config);
        let (tx, rx) = event_channel(256);

        let specs = vec![
            CallSpec::with_id("c-slow", "slow", json!({})),
            CallSpec::with_id("c-fast", "fast", json!({})),
            CallSpec::with_id("c-mid", "mid", json!({})),
        ];
        let results = dispatcher
            .execute_batch(&specs, BatchMode::Streaming, &tx)
            .await;
        drop(tx);
        let events = collect_events(rx).await;

        assert!(matches!(
            &events[0],
            Event::Status { text } if text.contains("Streaming 3 tools")
        ));

        // Completion order under a 2-permit semaphore: fast (30ms),
        // mid (starts at 30, done at 90), slow (120ms).
        let order: Vec<(&str, &str)> = events
            .iter()
            .filter_map(|e| match e {
                Event::ToolResult {
                    call_id,
                    progress: Some(p),
                    ..
                } => Some((call_id.as_str(), p.as_str())),
                _ => None,
            })
            .collect();
        assert_eq!(
            order,
            vec![("c-fast", "1/3"), ("c-mid", "2/3"), ("c-slow", "3/3")]
        );

        assert!(matches!(
            events.last().unwrap(),
            Event::Status { text } if text.contains("complete: 3 succeeded")
        ));
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.outcome.is_success()));
    }

    #[tokio::test(start_paused = true)]
    async fn gather_all_batch_emits_in_submission_order() {
        let registry = ToolRegistry::new();
        registry.register(SleepTool::new("slow", 120)).unwrap();
        registry.register(SleepTool::new("fast", 30)).unwrap();
        let (dispatcher, _cancel) = dispatcher_fixture(registry, fast_config());
        let (tx, rx) = event_channel(256);

        let specs = vec![
            CallSpec::with_id("c-slow", "slow", json!({})),
            CallSpec::with_id("c-fast", "fast", json!({})),
        ];
        let results = dispatcher
            .execute_batch(&specs, BatchMode::GatherAll, &tx)
            .await;
        drop(tx);
        let events = collect_events(rx).await;

        // Results come back in submission order regardless of timing.
        let result_ids: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                Event::ToolResult { call_id, .. } => Some(call_id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(result_ids, vec!["c-slow", "c-fast"]);
        assert_eq!(results[0].call_id, "c-slow");
        assert_eq!(results[1].call_id, "c-fast");
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_executions_never_exceed_the_bound() {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let registry = ToolRegistry::new();
        registry
            .register(CountingTool {
                spec: ToolSpec::new("count", "concurrency probe", json!({"type": "object"})),
                current: Arc::clone(&current),
                peak: Arc::clone(&peak),
            })
            .unwrap();
        let mut config = fast_config();
        config.max_concurrent_tools = 2;
        let (dispatcher, _cancel) = dispatcher_fixture(registry, config);
        let (tx, rx) = event_channel(256);

        let specs: Vec<CallSpec> = (0..6)
            .map(|i| CallSpec::with_id(format!("c{i}"), "count", json!({})))
            .collect();
        let results = dispatcher
            .execute_batch(&specs, BatchMode::Streaming, &tx)
            .await;
        drop(tx);
        let _ = collect_events(rx).await;

        assert_eq!(results.len(), 6);
        assert!(
            peak.load(Ordering::SeqCst) <= 2,
            "in-flight executions exceeded the semaphore bound"
        );
    }

    // ── Dispatcher: timeout & cancellation ────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn tool_timeout_produces_error_and_releases_the_permit() {
        let registry = ToolRegistry::new();
        registry.register(SleepTool::new("glacial", 5_000)).unwrap();
        registry.register(SleepTool::new("quick", 10)).unwrap();
        let mut config = fast_config();
        config.tool_timeout_secs = Some(1);
        config.max_concurrent_tools = 1;
        let (dispatcher, _cancel) = dispatcher_fixture(registry, config);
        let (tx, rx) = event_channel(256);

        let late = dispatcher
            .execute_one(&CallSpec::with_id("c1", "glacial", json!({})), false, &tx)
            .await;
        assert_eq!(late.outcome, DispatchOutcome::Failed);
        assert!(late.content.contains("timeout"));

        // The single permit must have been released.
        let ok = dispatcher
            .execute_one(&CallSpec::with_id("c2", "quick", json!({})), false, &tx)
            .await;
        assert_eq!(ok.outcome, DispatchOutcome::Success);
        drop(tx);
        let _ = collect_events(rx).await;
    }

    #[tokio::test]
    async fn cancellation_surfaces_as_cancelled_not_error() {
        let registry = ToolRegistry::new();
        registry.register(SleepTool::new("forever", 3_600_000)).unwrap();
        let (dispatcher, cancel) = dispatcher_fixture(registry, fast_config());
        let dispatcher = Arc::new(dispatcher);
        let (tx, rx) = event_channel(256);

        let worker = {
            let dispatcher = Arc::clone(&dispatcher);
            let tx = tx.clone();
            tokio::spawn(async move {
                dispatcher
                    .execute_one(&CallSpec::with_id("c1", "forever", json!({})), false, &tx)
                    .await
            })
        };
        // Let the call reach its suspension point, then cancel.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        cancel.cancel();

        let result = worker.await.unwrap();
        assert_eq!(result.outcome, DispatchOutcome::Cancelled);
        drop(tx);
        let events = collect_events(rx).await;
        assert!(events.iter().any(|e| matches!(
            e,
            Event::ToolResult { status: ToolResultStatus::Cancelled, .. }
        )));
        assert!(!events.iter().any(|e| matches!(
            e,
            Event::ToolResult { status: ToolResultStatus::Error, .. }
        )));
    }

    #[tokio::test]
    async fn invalid_args_surface_as_tool_result_error() {
        let registry = ToolRegistry::new();
        registry.register(EchoTool::new()).unwrap();
        let (dispatcher, _cancel) = dispatcher_fixture(registry, fast_config());
        let (tx, rx) = event_channel(64);

        let result = dispatcher
            .execute_one(
                &CallSpec::with_id("c1", "echo", json!({"wrong": true})),
                false,
                &tx,
            )
            .await;
        assert_eq!(result.outcome, DispatchOutcome::Invalid);
        drop(tx);
        let events = collect_events(rx).await;
        assert!(events.iter().any(|e| matches!(
            e,
            Event::ToolResult { status: ToolResultStatus::Error, error: Some(msg), .. }
                if msg.contains("missing required parameter")
        )));
    }

    // ── Event-stream invariants ───────────────────────────────────────────────

    #[tokio::test]
    async fn every_pending_call_reaches_exactly_one_terminal_result() {
        let client =
            ScriptedMockClient::tool_then_text("c1", "echo", json!({"msg": "x"}), "done");
        let registry = ToolRegistry::new();
        registry.register(EchoTool::new()).unwrap();
        let (mut agent, _handle) = agent_with(
            client,
            registry,
            fast_config(),
            Box::new(ResearchPolicy::new()),
        );
        let (tx, rx) = event_channel(256);
        agent.run("go", tx).await.unwrap();
        let events = collect_events(rx).await;

        let pending_ids: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                Event::ToolCall {
                    call_id,
                    status: ToolCallStatus::Pending,
                    ..
                } => Some(call_id.as_str()),
                _ => None,
            })
            .collect();
        let done_index = events.len() - 1;
        for id in pending_ids {
            let terminals = events
                .iter()
                .enumerate()
                .filter(|(_, e)| matches!(e, Event::ToolResult { call_id, .. } if call_id == id))
                .collect::<Vec<_>>();
            assert_eq!(terminals.len(), 1, "call {id} must have one terminal result");
            assert!(terminals[0].0 < done_index, "terminal result must precede Done");
        }
        assert!(matches!(events.last(), Some(Event::Done { .. })));
    }

    #[tokio::test]
    async fn done_is_always_the_last_event_and_channel_closes() {
        let client = ScriptedMockClient::always_text("bye");
        let (mut agent, _handle) = agent_with(
            client,
            ToolRegistry::new(),
            fast_config(),
            Box::new(BasicPolicy),
        );
        let (tx, mut rx) = event_channel(256);
        agent.run("hi", tx).await.unwrap();

        let mut last = None;
        while let Some(ev) = rx.recv().await {
            last = Some(ev);
        }
        assert!(matches!(last, Some(Event::Done { .. })));
        // Channel is closed after Done.
        assert!(rx.recv().await.is_none());
    }
}
