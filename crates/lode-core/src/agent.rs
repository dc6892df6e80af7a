// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use lode_config::RuntimeConfig;
use lode_memory::WorkingMemory;
use lode_model::{GenerationPipeline, Message, Role};
use lode_tools::ToolRegistry;
use lode_trace::{FailureObserver, TraceStore};

use crate::confirm::ConfirmationGate;
use crate::context::{AgentContext, ToolCallRecord, ToolCallState};
use crate::dispatcher::{CallSpec, DispatchOutcome, ToolDispatcher};
use crate::events::{DoneStatus, Event, EventSender};
use crate::policy::{AgentAction, LoopError, LoopPolicy, TurnIo};

/// Identity of one session.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub session_id: String,
    pub user_id: String,
    pub workspace_id: String,
}

impl SessionParams {
    pub fn new(
        session_id: impl Into<String>,
        user_id: impl Into<String>,
        workspace_id: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            workspace_id: workspace_id.into(),
        }
    }
}

/// Explicit dependency bundle for an agent.  Built outside and passed in;
/// there are no process-wide registries.
#[derive(Clone)]
pub struct AgentDeps {
    pub config: Arc<RuntimeConfig>,
    pub registry: Arc<ToolRegistry>,
    pub pipeline: Arc<GenerationPipeline>,
    pub store: Arc<TraceStore>,
    pub memory: Arc<WorkingMemory>,
}

/// Operator control surface for a running agent: cancellation, confirmation
/// answers, and message injection (applied between iterations only).
#[derive(Clone)]
pub struct AgentHandle {
    cancel: CancellationToken,
    confirmations: Arc<ConfirmationGate>,
    inject_tx: mpsc::Sender<Message>,
}

impl AgentHandle {
    /// Initiate cancellation.  Observed at every suspension point; in-flight
    /// tool calls surface as cancelled, not as errors.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Resolve a pending confirmation.  Returns `false` when nothing was
    /// waiting on the id.
    pub fn confirm(&self, action_id: &str, accepted: bool) -> bool {
        self.confirmations.resolve(action_id, accepted)
    }

    /// Queue a message for the next iteration boundary.
    pub async fn inject_message(&self, role: Role, content: &str) -> bool {
        let msg = match role {
            Role::System => Message::system(content),
            Role::User => Message::user(content),
            Role::Assistant => Message::assistant(content),
            Role::Tool => return false,
        };
        self.inject_tx.send(msg).await.is_ok()
    }
}

/// The agent loop: iteration control, think/decide phases, event emission,
/// cancellation and termination.  One `run()` call per user turn; `Done` is
/// always the final event.
pub struct Agent {
    context: AgentContext,
    policy: Box<dyn LoopPolicy>,
    deps: AgentDeps,
    dispatcher: ToolDispatcher,
    observer: Arc<FailureObserver>,
    cancel: CancellationToken,
    confirmations: Arc<ConfirmationGate>,
    inject_rx: mpsc::Receiver<Message>,
}

impl Agent {
    pub fn new(
        params: SessionParams,
        policy: Box<dyn LoopPolicy>,
        deps: AgentDeps,
    ) -> (Self, AgentHandle) {
        let cancel = CancellationToken::new();
        let confirmations = Arc::new(ConfirmationGate::new());
        let (inject_tx, inject_rx) = mpsc::channel(16);
        let dispatcher = ToolDispatcher::new(
            Arc::clone(&deps.registry),
            Arc::clone(&deps.store),
            Arc::clone(&deps.memory),
            Arc::clone(&confirmations),
            cancel.clone(),
            &deps.config,
            params.session_id.clone(),
        );
        let context = AgentContext::new(
            params.session_id,
            params.user_id,
            params.workspace_id,
            deps.config.max_tokens,
            deps.config.max_iterations,
        );
        let observer = Arc::clone(deps.store.observer());
        let handle = AgentHandle {
            cancel: cancel.clone(),
            confirmations: Arc::clone(&confirmations),
            inject_tx,
        };
        (
            Self {
                context,
                policy,
                deps,
                dispatcher,
                observer,
                cancel,
                confirmations,
                inject_rx,
            },
            handle,
        )
    }

    pub fn context(&self) -> &AgentContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut AgentContext {
        &mut self.context
    }

    pub fn memory(&self) -> &Arc<WorkingMemory> {
        &self.deps.memory
    }

    /// Drive one user turn to completion, streaming events through `tx`.
    /// The final event is always `Done`.
    pub async fn run(&mut self, user_input: &str, tx: EventSender) -> anyhow::Result<()> {
        // The message id exists before the first event of the turn.
        self.context.begin_turn();
        self.context.messages.push(Message::user(user_input));
        self.log_progress("User Input Received", user_input, "📥");

        let session_id = self.context.session_id.clone();
        let mut status = DoneStatus::Stopped;

        while self.should_continue() {
            self.context.increment_iteration();

            // Operator-injected messages land between iterations only.
            while let Ok(msg) = self.inject_rx.try_recv() {
                self.context.messages.push(msg);
            }

            if self
                .deps
                .memory
                .should_recite_plan(self.context.iteration)
            {
                self.recite_plan();
            }

            let estimated = self.context.estimated_context_tokens();
            if self
                .deps
                .memory
                .should_clear_context(self.context.messages.len(), Some(estimated))
            {
                match self.deps.memory.clear_and_summarize() {
                    Ok(injection) => {
                        self.context.messages =
                            vec![Message::system(injection.as_system_message())];
                    }
                    Err(e) => warn!("context clear failed, continuing uncleared: {e}"),
                }
            }

            let mut io = TurnIo::new(
                &tx,
                &self.deps.pipeline,
                &self.deps.registry,
                &session_id,
            );

            if let Err(e) = self.policy.think(&mut self.context, &mut io).await {
                self.emit_fatal(&tx, &e).await;
                status = DoneStatus::Aborted;
                break;
            }

            let action = match self.policy.decide(&mut self.context, &mut io).await {
                Ok(action) => action,
                Err(e) => {
                    self.emit_fatal(&tx, &e).await;
                    status = DoneStatus::Aborted;
                    break;
                }
            };
            drop(io);

            match action {
                AgentAction::ToolCall { id, name, args } => {
                    let spec = if id.is_empty() {
                        CallSpec::new(&name, args.clone())
                    } else {
                        CallSpec::with_id(id, &name, args.clone())
                    };
                    match self.run_tool_call(&spec, &tx).await {
                        ToolStep::Continue => {}
                        ToolStep::Abort => {
                            status = DoneStatus::Aborted;
                            break;
                        }
                        ToolStep::Stop => {
                            status = DoneStatus::Stopped;
                            break;
                        }
                    }
                }
                AgentAction::Answer { text } => {
                    let final_text = self.policy.finalize_answer(text);
                    self.stream_answer(&final_text, &tx).await;
                    self.context.messages.push(Message::assistant(&final_text));
                    self.log_progress("Answer Generated", "final answer provided to user", "✅");
                    status = DoneStatus::Completed;
                    break;
                }
                AgentAction::ConfirmRequired {
                    action_id,
                    tool_name,
                    args,
                    description,
                } => {
                    self.context
                        .set_pending_confirmation(&action_id, &tool_name);
                    let rx = self.confirmations.subscribe(&action_id);
                    let _ = tx
                        .send(Event::ConfirmRequired {
                            action_id: action_id.clone(),
                            tool_name,
                            args,
                            description,
                        })
                        .await;
                    let accepted = self.await_operator(rx).await;
                    self.context.resolve_confirmation(accepted == Some(true));
                    if accepted != Some(true) {
                        status = DoneStatus::Stopped;
                        break;
                    }
                }
            }

            if self.observer.should_abort() {
                let taxonomy = self
                    .observer
                    .consecutive_taxonomy()
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "unknown".into());
                let _ = tx
                    .send(Event::Error {
                        kind: "3-Strike".into(),
                        message: format!(
                            "{} consecutive {taxonomy} failures",
                            self.observer.strike_threshold()
                        ),
                        recoverable: true,
                    })
                    .await;
                self.reboot_cycle(&tx).await;
                self.observer.clear_consecutive();
                self.deps.memory.reset_error_streaks();
            }
        }

        // A completed answer stays completed even when cancellation raced
        // the final stretch.
        if self.cancel.is_cancelled() && status != DoneStatus::Completed {
            status = DoneStatus::Stopped;
        }

        let _ = tx
            .send(Event::Done {
                status,
                iterations: self.context.iteration,
                tokens_used: self.context.tokens_used,
                message_id: self.context.message_id(),
            })
            .await;
        Ok(())
    }

    fn should_continue(&self) -> bool {
        !self.cancel.is_cancelled()
            && self.context.should_continue()
            && !self.context.has_pending_confirmation()
    }

    /// Dispatch one tool call and fold its outcome back into the loop.
    async fn run_tool_call(&mut self, spec: &CallSpec, tx: &EventSender) -> ToolStep {
        self.context.messages.push(Message::tool_call(
            &spec.call_id,
            &spec.tool_name,
            &spec.args,
        ));
        self.context.add_tool_call(ToolCallRecord::new(
            &spec.call_id,
            &spec.tool_name,
            spec.args.clone(),
        ));

        let pre_confirmed = self.context.confirmation_result == Some(true);
        self.context.confirmation_result = None;
        let result = self.dispatcher.execute_one(spec, pre_confirmed, tx).await;

        if let Some(record) = self.context.tool_call_mut(&spec.call_id) {
            let _ = record.advance(ToolCallState::Running);
            let terminal = match result.outcome {
                DispatchOutcome::Success => ToolCallState::Success,
                DispatchOutcome::Cancelled | DispatchOutcome::Rejected => {
                    ToolCallState::Cancelled
                }
                _ => ToolCallState::Error,
            };
            let _ = record.advance(terminal);
            if terminal == ToolCallState::Success {
                record.result = Some(result.content.clone());
            } else {
                record.error = Some(result.content.clone());
            }
        }

        self.context
            .messages
            .push(Message::tool_result(&spec.call_id, &result.content));
        self.log_progress(
            &format!("Tool Call: {}", spec.tool_name),
            &format!("args: {}\nresult: {}", spec.args, head(&result.content, 200)),
            "🔧",
        );

        let step = match result.outcome {
            DispatchOutcome::Success => {
                self.observer.clear_consecutive();
                let before = self.policy.current_phase();
                self.policy.phase_transition(&spec.tool_name);
                let after = self.policy.current_phase();
                if let (Some(from), Some(to)) = (before, after) {
                    if from != to {
                        self.deps.store.record_state_transition(
                            from,
                            to,
                            &spec.tool_name,
                            Some(&self.context.session_id),
                            None,
                        );
                    }
                }
                ToolStep::Continue
            }
            DispatchOutcome::NotFound if self.deps.registry.is_empty() => {
                // Nothing is registered; a tool-requesting policy can never
                // make progress.
                let _ = tx
                    .send(Event::Error {
                        kind: "tool_not_found".into(),
                        message: result.content.clone(),
                        recoverable: false,
                    })
                    .await;
                ToolStep::Abort
            }
            DispatchOutcome::Rejected | DispatchOutcome::Cancelled => ToolStep::Stop,
            _ => {
                let taxonomy =
                    lode_trace::classify(1, &result.content, &spec.tool_name).to_string();
                if let Err(e) =
                    self.deps
                        .memory
                        .log_error(&taxonomy, &result.content, Some(&spec.tool_name))
                {
                    warn!("failed to log tool error to working memory: {e}");
                }
                ToolStep::Continue
            }
        };

        // The 2-Action Rule: force a findings write after every N tool
        // actions so intermediate results outlive context clearing.
        if self.deps.memory.should_record_finding() {
            let _ = tx
                .send(Event::Thinking {
                    text: "[2-Action Rule] Recording findings to working memory\n".into(),
                })
                .await;
            if let Err(e) = self
                .deps
                .memory
                .record_finding("Recent tool results", &head(&result.content, 500))
            {
                warn!("failed to record finding: {e}");
            }
        }

        step
    }

    /// Re-read the plan into the prompt context, with the failure digest
    /// appended so the model avoids repeating known dead ends.
    fn recite_plan(&mut self) {
        let plan = match self.deps.memory.plan_excerpt(600) {
            Ok(p) => p,
            Err(e) => {
                warn!("plan recitation skipped: {e}");
                return;
            }
        };
        if plan.trim().len() <= 50 {
            return;
        }
        let mut body = format!("Plan recitation, stay aligned with the task plan:\n\n{plan}");
        let failures = self.observer.summary();
        if !failures.is_empty() {
            body.push_str("\n\n");
            body.push_str(&failures);
        }
        self.context.messages.push(Message::system(body));
        self.log_progress("Plan Recitation", "task plan reviewed", "📖");
    }

    /// The 5-Question Reboot: five review thinking events, then resume.
    async fn reboot_cycle(&mut self, tx: &EventSender) {
        let emit = |text: String| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(Event::Thinking { text }).await;
            }
        };

        emit("5-Question Reboot\n\n".into()).await;
        let plan = self.deps.memory.plan_excerpt(300).unwrap_or_default();
        let plan = if plan.trim().is_empty() {
            "(no plan recorded)".to_string()
        } else {
            plan
        };
        emit(format!("1. Original goal:\n{plan}\n\n")).await;
        let progress = self.deps.memory.read_progress(500).unwrap_or_default();
        emit(format!("2. What has been tried:\n{progress}\n\n")).await;
        let failures = self.observer.summary();
        emit(format!("3. What went wrong:\n{failures}\n\n")).await;
        emit(
            "4. What to try differently: change the approach or arguments before repeating \
             the failing action.\n\n"
                .into(),
        )
        .await;
        emit(
            "5. Escalation check: continue autonomously; ask the operator only if the next \
             attempt fails the same way.\n\n"
                .into(),
        )
        .await;
        emit("Reboot complete. Resuming execution.\n".into()).await;
        self.log_progress("Reboot Cycle", "5-question review completed", "🔄");
    }

    /// Stream the final answer as bounded `Content` chunks.
    async fn stream_answer(&self, text: &str, tx: &EventSender) {
        const CHUNK: usize = 40;
        let mut buf = String::with_capacity(CHUNK);
        for ch in text.chars() {
            buf.push(ch);
            if buf.len() >= CHUNK {
                let _ = tx
                    .send(Event::Content {
                        text: std::mem::take(&mut buf),
                    })
                    .await;
            }
        }
        if !buf.is_empty() {
            let _ = tx.send(Event::Content { text: buf }).await;
        }
    }

    async fn emit_fatal(&self, tx: &EventSender, error: &LoopError) {
        let _ = tx
            .send(Event::Error {
                kind: "all_attempts_failed".into(),
                message: error.to_string(),
                recoverable: false,
            })
            .await;
    }

    async fn await_operator(
        &self,
        rx: tokio::sync::oneshot::Receiver<bool>,
    ) -> Option<bool> {
        let deadline = async {
            match self.deps.config.confirm_timeout_secs {
                Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
                None => futures::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            _ = deadline => None,
            answer = rx => answer.ok(),
        }
    }

    fn log_progress(&self, title: &str, details: &str, glyph: &str) {
        if let Err(e) = self.deps.memory.log_action(title, details, glyph) {
            warn!("progress log write failed: {e}");
        }
    }
}

enum ToolStep {
    Continue,
    Stop,
    Abort,
}

fn head(text: &str, cap: usize) -> String {
    if text.len() <= cap {
        return text.to_string();
    }
    let end = (0..=cap).rev().find(|i| text.is_char_boundary(*i)).unwrap_or(0);
    format!("{}...", &text[..end])
}
