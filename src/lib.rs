// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Lode – an agent execution runtime.
//!
//! Given a user request, a configured model client, and a registry of
//! callable tools, the runtime drives a bounded think→decide→act loop that
//! streams typed events to a consumer while enforcing concurrency, failure,
//! and memory-budget invariants.
//!
//! The [`Runtime`] facade wires the pieces together with explicit
//! dependencies; there are no process-wide registries.  Construction order
//! is acyclic: failure observer first, then the trace store holding the
//! observer, then sessions holding everything.
//!
//! ```no_run
//! use std::sync::Arc;
//! use lode::{
//!     BasicPolicy, GenerationPipeline, Router, Runtime, RuntimeConfig, SessionParams,
//!     ToolRegistry, event_channel, DEFAULT_EVENT_CAPACITY,
//! };
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let config = Arc::new(RuntimeConfig::default());
//! let registry = Arc::new(ToolRegistry::new());
//! let router = Arc::new(Router::new(config.breaker.clone()));
//! let pipeline = Arc::new(GenerationPipeline::new(router, config.fallback.clone()));
//! let runtime = Runtime::new(config, registry, pipeline)?;
//!
//! let (mut agent, handle) = runtime.session(
//!     SessionParams::new("session-1", "user-1", "workspace-1"),
//!     Box::new(BasicPolicy),
//! );
//! let (tx, mut rx) = event_channel(DEFAULT_EVENT_CAPACITY);
//! let consumer = tokio::spawn(async move { while rx.recv().await.is_some() {} });
//! agent.run("hello", tx).await?;
//! consumer.await?;
//! # let _ = handle;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

pub use lode_config::{
    load as load_config, BreakerConfig, ConfigError, FallbackConfig, MemoryThresholds,
    RuntimeConfig,
};
pub use lode_core::{
    event_channel, sse_decode, sse_encode, Agent, AgentAction, AgentContext, AgentDeps,
    AgentHandle, BasicPolicy, BatchMode, CallSpec, ConfirmationGate, DeepResearchPolicy,
    DispatchOutcome, DispatchResult, DoneStatus, Event, EventReceiver, EventSender,
    FinancialResearchPolicy, LoopError, LoopPolicy, PptPolicy, ResearchPolicy, SessionParams,
    SseError, ToolCallStatus, ToolDispatcher, ToolResultStatus, DEFAULT_EVENT_CAPACITY,
};
pub use lode_memory::{
    ContextInjection, DiskFileStore, FileStore, MemoryError, MemoryFileStore, StateSnapshot,
    WorkingMemory,
};
pub use lode_model::{
    Capability, CatalogEntry, Completion, CompletionRequest, Constraints, GenerationPipeline,
    Message, MessageContent, MockClient, ModelClient, ModelError, ModelToolCall, PipelineError,
    Role, Router, ScriptedMockClient, ScriptedReply, Selection, StopReason, TaskClass,
    ToolSchema, Usage,
};
pub use lode_tools::{
    OperationCategory, RegistryError, RiskLevel, Tool, ToolCall, ToolError, ToolOutput,
    ToolRegistry, ToolSpec,
};
pub use lode_trace::{
    classify, DecisionKind, DecisionTrace, FailureObserver, FailureSignal, FailureSource,
    FailureTaxonomy, RecoveryStrategy, SessionSummary, TraceStore,
};

/// The assembled runtime: one validated configuration plus the shared
/// services every session uses.  Sessions are cheap; the runtime is built
/// once.
pub struct Runtime {
    config: Arc<RuntimeConfig>,
    registry: Arc<ToolRegistry>,
    pipeline: Arc<GenerationPipeline>,
    store: Arc<TraceStore>,
    files: Arc<dyn FileStore>,
}

impl Runtime {
    /// Assemble a runtime from explicit parts.  The configuration is
    /// validated here; an invalid knob never reaches a running loop.
    ///
    /// Builds the failure observer and trace store internally in the
    /// required acyclic order, and defaults working-memory persistence to
    /// the in-memory store.  Use [`with_file_store`](Self::with_file_store)
    /// for disk-backed session files.
    pub fn new(
        config: Arc<RuntimeConfig>,
        registry: Arc<ToolRegistry>,
        pipeline: Arc<GenerationPipeline>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let observer = Arc::new(FailureObserver::new(config.strike_threshold));
        let store = Arc::new(TraceStore::new(observer));
        Ok(Self {
            config,
            registry,
            pipeline,
            store,
            files: Arc::new(MemoryFileStore::new()),
        })
    }

    /// Assemble a runtime that shares an externally built trace store
    /// (and through it, the failure observer).
    pub fn with_store(
        config: Arc<RuntimeConfig>,
        registry: Arc<ToolRegistry>,
        pipeline: Arc<GenerationPipeline>,
        store: Arc<TraceStore>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            registry,
            pipeline,
            store,
            files: Arc::new(MemoryFileStore::new()),
        })
    }

    /// Convenience constructor with default configuration, an empty tool
    /// registry and a client-less pipeline.  Register tools and clients
    /// before running sessions.
    pub fn with_defaults() -> Self {
        let config = Arc::new(RuntimeConfig::default());
        let registry = Arc::new(ToolRegistry::new());
        let router = Arc::new(Router::new(config.breaker.clone()));
        let pipeline = Arc::new(GenerationPipeline::new(router, config.fallback.clone()));
        Self::new(config, registry, pipeline).expect("default config is valid")
    }

    /// Persist working-memory files through `files` (e.g. [`DiskFileStore`]).
    pub fn with_file_store(mut self, files: Arc<dyn FileStore>) -> Self {
        self.files = files;
        self
    }

    pub fn config(&self) -> &Arc<RuntimeConfig> {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn pipeline(&self) -> &Arc<GenerationPipeline> {
        &self.pipeline
    }

    pub fn store(&self) -> &Arc<TraceStore> {
        &self.store
    }

    pub fn observer(&self) -> &Arc<FailureObserver> {
        self.store.observer()
    }

    /// Build a session: its working memory, its agent, and the operator
    /// handle.  The caller drives the agent with [`Agent::run`] and reads
    /// the event channel it passes in.
    pub fn session(
        &self,
        params: SessionParams,
        policy: Box<dyn LoopPolicy>,
    ) -> (Agent, AgentHandle) {
        let memory = Arc::new(WorkingMemory::new(
            Arc::clone(&self.files),
            params.session_id.clone(),
            self.config.memory.clone(),
            self.config.strike_threshold as u32,
        ));
        let deps = AgentDeps {
            config: Arc::clone(&self.config),
            registry: Arc::clone(&self.registry),
            pipeline: Arc::clone(&self.pipeline),
            store: Arc::clone(&self.store),
            memory,
        };
        Agent::new(params, policy, deps)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime_with_client(client: ScriptedMockClient) -> Runtime {
        let mut config = RuntimeConfig::default();
        config.fallback.retry_delay_ms = 0;
        let config = Arc::new(config);
        let registry = Arc::new(ToolRegistry::new());
        let router = Arc::new(Router::new(config.breaker.clone()));
        let pipeline = Arc::new(
            GenerationPipeline::new(router, config.fallback.clone()).with_client(
                "anthropic/claude-3-5-sonnet",
                Arc::new(client) as Arc<dyn ModelClient>,
            ),
        );
        Runtime::new(config, registry, pipeline).unwrap()
    }

    #[test]
    fn invalid_config_is_rejected_at_construction() {
        let mut config = RuntimeConfig::default();
        config.max_concurrent_tools = 0;
        let config = Arc::new(config);
        let registry = Arc::new(ToolRegistry::new());
        let router = Arc::new(Router::new(config.breaker.clone()));
        let pipeline = Arc::new(GenerationPipeline::new(router, config.fallback.clone()));
        assert!(Runtime::new(config, registry, pipeline).is_err());
    }

    #[test]
    fn default_runtime_builds() {
        let rt = Runtime::with_defaults();
        assert_eq!(rt.config().max_iterations, 50);
        assert!(rt.registry().is_empty());
    }

    #[tokio::test]
    async fn session_runs_end_to_end() {
        let rt = runtime_with_client(ScriptedMockClient::always_text("hello back"));
        let (mut agent, _handle) = rt.session(
            SessionParams::new("s1", "u1", "w1"),
            Box::new(BasicPolicy),
        );
        let (tx, mut rx) = event_channel(DEFAULT_EVENT_CAPACITY);

        agent.run("hello", tx).await.unwrap();

        let mut saw_content = false;
        let mut last = None;
        while let Some(ev) = rx.recv().await {
            if matches!(ev, Event::Content { .. }) {
                saw_content = true;
            }
            last = Some(ev);
        }
        assert!(saw_content);
        assert!(matches!(
            last,
            Some(Event::Done {
                status: DoneStatus::Completed,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn sessions_share_the_trace_store() {
        let rt = runtime_with_client(ScriptedMockClient::always_text("ok"));
        let (mut agent, _handle) = rt.session(
            SessionParams::new("shared", "u1", "w1"),
            Box::new(BasicPolicy),
        );
        let (tx, mut rx) = event_channel(DEFAULT_EVENT_CAPACITY);
        let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });
        agent.run("hi", tx).await.unwrap();
        drain.await.unwrap();

        // The shared pipeline recorded its attempt; the runtime-level store
        // and observer are the same instances the session used.
        assert_eq!(rt.pipeline().attempts().len(), 1);
        assert_eq!(rt.observer().stats().total_failures, 0);
    }

    #[tokio::test]
    async fn disk_file_store_persists_session_memory() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime_with_client(ScriptedMockClient::always_text("done"))
            .with_file_store(Arc::new(DiskFileStore::new(dir.path())));
        let (mut agent, _handle) = rt.session(
            SessionParams::new("persisted", "u1", "w1"),
            Box::new(BasicPolicy),
        );
        let (tx, mut rx) = event_channel(DEFAULT_EVENT_CAPACITY);
        let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });
        agent.run("remember this", tx).await.unwrap();
        drain.await.unwrap();

        let progress = dir.path().join("sessions/persisted/progress.md");
        let body = std::fs::read_to_string(progress).unwrap();
        assert!(body.contains("User Input Received"));
        assert!(body.contains("Answer Generated"));
    }
}
