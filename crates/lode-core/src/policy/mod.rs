// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod basic;
mod deep_research;
mod financial;
mod ppt;
mod research;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use lode_memory::MemoryError;
use lode_model::{
    Completion, CompletionRequest, GenerationPipeline, PipelineError, TaskClass,
};
use lode_tools::ToolRegistry;

use crate::context::AgentContext;
use crate::events::{Event, EventSender};

pub use basic::BasicPolicy;
pub use deep_research::DeepResearchPolicy;
pub use financial::FinancialResearchPolicy;
pub use ppt::PptPolicy;
pub use research::ResearchPolicy;

/// Failures that cross the policy/loop boundary.
#[derive(Debug, Error)]
pub enum LoopError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("memory error: {0}")]
    Memory(#[from] MemoryError),
}

/// The single decision a policy returns per turn.
#[derive(Debug, Clone)]
pub enum AgentAction {
    ToolCall {
        id: String,
        name: String,
        args: Value,
    },
    Answer {
        text: String,
    },
    ConfirmRequired {
        action_id: String,
        tool_name: String,
        args: Value,
        description: String,
    },
}

/// Per-turn IO surface handed to policies: event emission and model access
/// through the fallback pipeline.  Token accounting happens here so every
/// policy gets it for free.
pub struct TurnIo<'a> {
    tx: &'a EventSender,
    pipeline: &'a GenerationPipeline,
    registry: &'a ToolRegistry,
    session_id: &'a str,
}

impl<'a> TurnIo<'a> {
    pub fn new(
        tx: &'a EventSender,
        pipeline: &'a GenerationPipeline,
        registry: &'a ToolRegistry,
        session_id: &'a str,
    ) -> Self {
        Self {
            tx,
            pipeline,
            registry,
            session_id,
        }
    }

    pub async fn emit(&self, event: Event) {
        let _ = self.tx.send(event).await;
    }

    pub async fn emit_thinking(&self, text: impl Into<String>) {
        self.emit(Event::Thinking { text: text.into() }).await;
    }

    /// Tool schemas visible under the current action space.
    pub fn model_tools(&self) -> Vec<lode_model::ToolSchema> {
        self.registry
            .as_model_tools(None)
            .into_iter()
            .map(|s| lode_model::ToolSchema {
                name: s.name,
                description: s.description,
                parameters: s.parameters,
            })
            .collect()
    }

    /// Unary generation through the fallback pipeline, with token usage
    /// booked into the context.
    pub async fn generate(
        &self,
        ctx: &mut AgentContext,
        task: TaskClass,
        system: Option<&str>,
        with_tools: bool,
    ) -> Result<Completion, LoopError> {
        let tools = if with_tools {
            self.model_tools()
        } else {
            Vec::new()
        };
        let req = CompletionRequest {
            messages: ctx.messages.clone(),
            system: system.map(str::to_owned),
            tools,
            params: Default::default(),
        };
        let completion = self
            .pipeline
            .generate(task, None, req, Some(self.session_id))
            .await?;
        ctx.add_tokens(
            completion.usage.input_tokens,
            completion.usage.output_tokens,
        );
        Ok(completion)
    }

    /// Stream model reasoning as `Thinking` events, accumulating the text
    /// into the context.  Degrades to a single static line when no client is
    /// reachable; thinking must never sink a run.
    pub async fn stream_thinking(
        &self,
        ctx: &mut AgentContext,
        task: TaskClass,
        system: Option<&str>,
    ) {
        let Some(client) = self.pipeline.client_for(task) else {
            self.emit_thinking("Analyzing the task...").await;
            return;
        };
        let req = CompletionRequest {
            messages: ctx.messages.clone(),
            system: system.map(str::to_owned),
            tools: Vec::new(),
            params: Default::default(),
        };
        match client.stream(req).await {
            Ok(mut stream) => {
                while let Some(chunk) = stream.next().await {
                    match chunk {
                        Ok(text) => {
                            ctx.append_thinking(&text);
                            self.emit(Event::Thinking { text }).await;
                        }
                        Err(e) => {
                            warn!("thinking stream error: {e}");
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                warn!("thinking stream unavailable: {e}");
                self.emit_thinking("Analyzing the task...").await;
            }
        }
    }
}

/// The polymorphic point of the loop.  Variants are different values of this
/// capability, not different loop types: `think` streams reasoning events
/// and must not call tools, `decide` proposes exactly one action, and
/// `phase_transition` advances any internal phase machine from the name of
/// the tool that just ran.
#[async_trait]
pub trait LoopPolicy: Send {
    fn name(&self) -> &'static str;

    /// Task classification used for routing.
    fn task_class(&self) -> TaskClass {
        TaskClass::General
    }

    async fn think(
        &mut self,
        ctx: &mut AgentContext,
        io: &mut TurnIo<'_>,
    ) -> Result<(), LoopError>;

    /// The only component that proposes tool calls.
    async fn decide(
        &mut self,
        ctx: &mut AgentContext,
        io: &mut TurnIo<'_>,
    ) -> Result<AgentAction, LoopError>;

    fn phase_transition(&mut self, _tool_name: &str) {}

    fn current_phase(&self) -> Option<&'static str> {
        None
    }

    /// Post-process a final answer before it is streamed (compliance
    /// footers, structural rewrites).
    fn finalize_answer(&self, answer: String) -> String {
        answer
    }
}
