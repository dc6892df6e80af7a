// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{FuturesOrdered, FuturesUnordered};
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use lode_config::RuntimeConfig;
use lode_memory::WorkingMemory;
use lode_tools::{RegistryError, Tool, ToolCall, ToolOutput, ToolRegistry};
use lode_trace::TraceStore;

use crate::confirm::ConfirmationGate;
use crate::events::{Event, EventSender, ToolCallStatus, ToolResultStatus};

/// Event payloads carry at most this much result text; the full content is
/// returned to the loop for the conversation history.
const EVENT_RESULT_CAP: usize = 500;

/// One tool call as submitted to the dispatcher.
#[derive(Debug, Clone)]
pub struct CallSpec {
    pub call_id: String,
    pub tool_name: String,
    pub args: Value,
}

impl CallSpec {
    pub fn new(tool_name: impl Into<String>, args: Value) -> Self {
        Self {
            call_id: format!("tc_{}", Uuid::new_v4()),
            tool_name: tool_name.into(),
            args,
        }
    }

    pub fn with_id(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        args: Value,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            args,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchMode {
    /// Wait for every call, then emit results in submission order.
    GatherAll,
    /// Emit each result as its call finishes, annotated `"k/N"`.
    Streaming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Success,
    Failed,
    Cancelled,
    NotFound,
    NotAllowed,
    Invalid,
    Rejected,
}

impl DispatchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// What the loop gets back from a dispatch: the terminal outcome plus the
/// full result (or error) text for the conversation history.
#[derive(Debug, Clone)]
pub struct DispatchResult {
    pub call_id: String,
    pub tool_name: String,
    pub outcome: DispatchOutcome,
    pub content: String,
}

enum TaskOutput {
    Done(ToolOutput),
    Cancelled,
}

/// Runs tool calls through the admission protocol: pending event, registry
/// resolution, confirmation gate, running event, arg validation, semaphore
/// permit, execution with timeout, terminal event, trace records.
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    store: Arc<TraceStore>,
    memory: Arc<WorkingMemory>,
    confirmations: Arc<ConfirmationGate>,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
    tool_timeout: Option<Duration>,
    confirm_timeout: Option<Duration>,
    session_id: String,
}

impl ToolDispatcher {
    pub fn new(
        registry: Arc<ToolRegistry>,
        store: Arc<TraceStore>,
        memory: Arc<WorkingMemory>,
        confirmations: Arc<ConfirmationGate>,
        cancel: CancellationToken,
        config: &RuntimeConfig,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            store,
            memory,
            confirmations,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_tools)),
            cancel,
            tool_timeout: config.tool_timeout_secs.map(Duration::from_secs),
            confirm_timeout: config.confirm_timeout_secs.map(Duration::from_secs),
            session_id: session_id.into(),
        }
    }

    /// Run a single call through the full admission and event protocol.
    ///
    /// `pre_confirmed` short-circuits the confirmation gate when the
    /// operator already approved this action id.
    pub async fn execute_one(
        &self,
        spec: &CallSpec,
        pre_confirmed: bool,
        tx: &EventSender,
    ) -> DispatchResult {
        let _ = tx
            .send(Event::ToolCall {
                call_id: spec.call_id.clone(),
                tool_name: spec.tool_name.clone(),
                args: spec.args.clone(),
                status: ToolCallStatus::Pending,
            })
            .await;

        let tool = match self.registry.get(&spec.tool_name) {
            Ok(tool) => tool,
            Err(err) => {
                let outcome = match &err {
                    RegistryError::NotAllowed { .. } => DispatchOutcome::NotAllowed,
                    _ => DispatchOutcome::NotFound,
                };
                let message = err.to_string();
                let _ = tx
                    .send(Event::ToolResult {
                        call_id: spec.call_id.clone(),
                        status: ToolResultStatus::Error,
                        result: None,
                        error: Some(message.clone()),
                        progress: None,
                    })
                    .await;
                self.store.record_tool_result(
                    &spec.tool_name,
                    &spec.args,
                    1,
                    0.0,
                    "",
                    &message,
                    Some(&self.session_id),
                    None,
                );
                return DispatchResult {
                    call_id: spec.call_id.clone(),
                    tool_name: spec.tool_name.clone(),
                    outcome,
                    content: message,
                };
            }
        };

        if tool.spec().requires_confirmation && !pre_confirmed {
            let rx = self.confirmations.subscribe(&spec.call_id);
            let _ = tx
                .send(Event::ConfirmRequired {
                    action_id: spec.call_id.clone(),
                    tool_name: spec.tool_name.clone(),
                    args: spec.args.clone(),
                    description: tool.spec().description.clone(),
                })
                .await;
            match self.await_confirmation(rx).await {
                Some(true) => {}
                answer => {
                    let message = match answer {
                        Some(false) => "rejected by operator",
                        _ => "cancelled while awaiting confirmation",
                    };
                    let _ = tx
                        .send(Event::ToolResult {
                            call_id: spec.call_id.clone(),
                            status: ToolResultStatus::Cancelled,
                            result: None,
                            error: Some(message.to_string()),
                            progress: None,
                        })
                        .await;
                    self.store.record_tool_cancelled(
                        &spec.tool_name,
                        &spec.args,
                        0.0,
                        Some(&self.session_id),
                    );
                    return DispatchResult {
                        call_id: spec.call_id.clone(),
                        tool_name: spec.tool_name.clone(),
                        outcome: if answer == Some(false) {
                            DispatchOutcome::Rejected
                        } else {
                            DispatchOutcome::Cancelled
                        },
                        content: message.to_string(),
                    };
                }
            }
        }

        let _ = tx
            .send(Event::ToolCall {
                call_id: spec.call_id.clone(),
                tool_name: spec.tool_name.clone(),
                args: spec.args.clone(),
                status: ToolCallStatus::Running,
            })
            .await;

        if let Err(err) = tool.validate(&spec.args) {
            let message = err.to_string();
            let _ = tx
                .send(Event::ToolResult {
                    call_id: spec.call_id.clone(),
                    status: ToolResultStatus::Error,
                    result: None,
                    error: Some(message.clone()),
                    progress: None,
                })
                .await;
            self.store.record_tool_result(
                &spec.tool_name,
                &spec.args,
                1,
                0.0,
                "",
                &message,
                Some(&self.session_id),
                None,
            );
            return DispatchResult {
                call_id: spec.call_id.clone(),
                tool_name: spec.tool_name.clone(),
                outcome: DispatchOutcome::Invalid,
                content: message,
            };
        }

        self.store.record_tool_call(
            &spec.tool_name,
            &spec.args,
            Some(&self.session_id),
            None,
        );
        self.registry.note_invocation(&spec.tool_name);

        let started = Instant::now();
        let output = guarded_execute(
            tool,
            spec.clone(),
            Arc::clone(&self.semaphore),
            self.cancel.clone(),
            self.tool_timeout,
        )
        .await;
        self.finish_call(spec, output, started, None, tx).await
    }

    /// Run a batch of calls, bounded by the semaphore.
    pub async fn execute_batch(
        &self,
        specs: &[CallSpec],
        mode: BatchMode,
        tx: &EventSender,
    ) -> Vec<DispatchResult> {
        if specs.is_empty() {
            return Vec::new();
        }
        let n = specs.len();

        if mode == BatchMode::Streaming {
            let _ = tx
                .send(Event::Status {
                    text: format!("Streaming {n} tools..."),
                })
                .await;
        }

        // Phase 1: every call is announced before anything runs.
        for spec in specs {
            let _ = tx
                .send(Event::ToolCall {
                    call_id: spec.call_id.clone(),
                    tool_name: spec.tool_name.clone(),
                    args: spec.args.clone(),
                    status: ToolCallStatus::Pending,
                })
                .await;
        }
        for spec in specs {
            let _ = tx
                .send(Event::ToolCall {
                    call_id: spec.call_id.clone(),
                    tool_name: spec.tool_name.clone(),
                    args: spec.args.clone(),
                    status: ToolCallStatus::Running,
                })
                .await;
        }

        // Phase 2: spawn every call; the semaphore bounds real concurrency.
        let mut tasks = Vec::with_capacity(n);
        for (index, spec) in specs.iter().enumerate() {
            let spec = spec.clone();
            let registry = Arc::clone(&self.registry);
            let semaphore = Arc::clone(&self.semaphore);
            let cancel = self.cancel.clone();
            let timeout = self.tool_timeout;
            let started = Instant::now();

            self.store.record_tool_call(
                &spec.tool_name,
                &spec.args,
                Some(&self.session_id),
                None,
            );

            let handle = tokio::spawn(async move {
                let output = run_batch_call(&registry, &spec, semaphore, cancel, timeout).await;
                (index, spec, output, started)
            });
            tasks.push(handle);
        }

        let mut results: Vec<DispatchResult> = Vec::with_capacity(n);
        match mode {
            BatchMode::GatherAll => {
                // Collect everything first, then emit in submission order.
                let mut ordered: FuturesOrdered<_> = tasks.into_iter().collect();
                let mut finished = Vec::with_capacity(n);
                while let Some(joined) = ordered.next().await {
                    match joined {
                        Ok(item) => finished.push(item),
                        Err(e) => warn!("batch tool task panicked: {e}"),
                    }
                }
                for (_, spec, output, started) in finished {
                    let result = self.finish_call(&spec, output, started, None, tx).await;
                    results.push(result);
                }
            }
            BatchMode::Streaming => {
                // Emit each result as it lands, in completion order.
                let mut unordered: FuturesUnordered<_> = tasks.into_iter().collect();
                let mut done = 0usize;
                while let Some(joined) = unordered.next().await {
                    let Ok((_, spec, output, started)) = joined else {
                        warn!("batch tool task panicked");
                        continue;
                    };
                    done += 1;
                    let progress = Some(format!("{done}/{n}"));
                    let result = self.finish_call(&spec, output, started, progress, tx).await;
                    results.push(result);
                }
            }
        }

        let succeeded = results.iter().filter(|r| r.outcome.is_success()).count();
        let failed = results.len() - succeeded;
        let _ = tx
            .send(Event::Status {
                text: format!("Tool batch complete: {succeeded} succeeded, {failed} failed"),
            })
            .await;

        results
    }

    /// Emit the terminal event, record traces, and count the action toward
    /// the findings trigger.
    async fn finish_call(
        &self,
        spec: &CallSpec,
        output: TaskOutput,
        started: Instant,
        progress: Option<String>,
        tx: &EventSender,
    ) -> DispatchResult {
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        let result = match output {
            TaskOutput::Done(out) if !out.is_error => {
                let _ = tx
                    .send(Event::ToolResult {
                        call_id: spec.call_id.clone(),
                        status: ToolResultStatus::Success,
                        result: Some(truncate(&out.content, EVENT_RESULT_CAP)),
                        error: None,
                        progress,
                    })
                    .await;
                self.store.record_tool_result(
                    &spec.tool_name,
                    &spec.args,
                    0,
                    duration_ms,
                    &out.content,
                    "",
                    Some(&self.session_id),
                    None,
                );
                DispatchResult {
                    call_id: spec.call_id.clone(),
                    tool_name: spec.tool_name.clone(),
                    outcome: DispatchOutcome::Success,
                    content: out.content,
                }
            }
            TaskOutput::Done(out) => {
                let _ = tx
                    .send(Event::ToolResult {
                        call_id: spec.call_id.clone(),
                        status: ToolResultStatus::Error,
                        result: None,
                        error: Some(truncate(&out.content, EVENT_RESULT_CAP)),
                        progress,
                    })
                    .await;
                self.store.record_tool_result(
                    &spec.tool_name,
                    &spec.args,
                    out.exit_code,
                    duration_ms,
                    "",
                    &out.stderr,
                    Some(&self.session_id),
                    None,
                );
                DispatchResult {
                    call_id: spec.call_id.clone(),
                    tool_name: spec.tool_name.clone(),
                    outcome: DispatchOutcome::Failed,
                    content: out.content,
                }
            }
            TaskOutput::Cancelled => {
                let _ = tx
                    .send(Event::ToolResult {
                        call_id: spec.call_id.clone(),
                        status: ToolResultStatus::Cancelled,
                        result: None,
                        error: Some("cancelled".into()),
                        progress,
                    })
                    .await;
                self.store.record_tool_cancelled(
                    &spec.tool_name,
                    &spec.args,
                    duration_ms,
                    Some(&self.session_id),
                );
                DispatchResult {
                    call_id: spec.call_id.clone(),
                    tool_name: spec.tool_name.clone(),
                    outcome: DispatchOutcome::Cancelled,
                    content: "cancelled".into(),
                }
            }
        };
        self.memory.note_tool_action();
        result
    }

    /// Wait for the operator's confirmation answer; `None` means the run was
    /// cancelled or the confirmation timed out.
    async fn await_confirmation(
        &self,
        rx: tokio::sync::oneshot::Receiver<bool>,
    ) -> Option<bool> {
        let deadline = async {
            match self.confirm_timeout {
                Some(d) => tokio::time::sleep(d).await,
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
}

/// Resolve + validate + execute one batch member.  Resolution failures come
/// back as error outputs so batch slots always produce a terminal result.
async fn run_batch_call(
    registry: &ToolRegistry,
    spec: &CallSpec,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
    timeout: Option<Duration>,
) -> TaskOutput {
    let tool = match registry.get(&spec.tool_name) {
        Ok(tool) => tool,
        Err(err) => {
            return TaskOutput::Done(ToolOutput::err(&spec.call_id, err.to_string()));
        }
    };
    if tool.spec().requires_confirmation {
        return TaskOutput::Done(ToolOutput::err(
            &spec.call_id,
            format!(
                "tool `{}` requires confirmation and cannot run in a batch",
                spec.tool_name
            ),
        ));
    }
    if let Err(err) = tool.validate(&spec.args) {
        return TaskOutput::Done(ToolOutput::err(&spec.call_id, err.to_string()));
    }
    registry.note_invocation(&spec.tool_name);
    guarded_execute(tool, spec.clone(), semaphore, cancel, timeout).await
}

/// The execution core shared by single and batch dispatch: semaphore permit,
/// cooperative cancellation at every suspension point, optional timeout.
async fn guarded_execute(
    tool: Arc<dyn Tool>,
    spec: CallSpec,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
    timeout: Option<Duration>,
) -> TaskOutput {
    let permit = tokio::select! {
        biased;
        _ = cancel.cancelled() => return TaskOutput::Cancelled,
        permit = semaphore.acquire_owned() => match permit {
            Ok(p) => p,
            Err(_) => return TaskOutput::Cancelled,
        },
    };

    let call = ToolCall {
        id: spec.call_id.clone(),
        name: spec.tool_name.clone(),
        args: spec.args.clone(),
    };
    let execution = tool.execute(&call);

    let output = match timeout {
        Some(limit) => tokio::select! {
            biased;
            _ = cancel.cancelled() => TaskOutput::Cancelled,
            res = tokio::time::timeout(limit, execution) => match res {
                Ok(out) => TaskOutput::Done(out),
                Err(_) => TaskOutput::Done(ToolOutput::err_with_code(
                    &spec.call_id,
                    format!("tool `{}` execution timeout after {limit:?}", spec.tool_name),
                    124,
                )),
            },
        },
        None => tokio::select! {
            biased;
            _ = cancel.cancelled() => TaskOutput::Cancelled,
            out = execution => TaskOutput::Done(out),
        },
    };
    // Permit released here; the timeout path must not leak it.
    drop(permit);
    output
}

fn truncate(text: &str, cap: usize) -> String {
    if text.len() <= cap {
        return text.to_string();
    }
    let end = (0..=cap).rev().find(|i| text.is_char_boundary(*i)).unwrap_or(0);
    format!("{}...", &text[..end])
}
