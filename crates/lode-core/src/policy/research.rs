// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;

use lode_model::TaskClass;

use crate::context::AgentContext;
use crate::policy::{AgentAction, LoopError, LoopPolicy, TurnIo};

const THINK_PROMPT: &str = "You are a research assistant. Analyze the user's question: \
     identify what information is needed, which tools to use, and plan the approach. \
     Be concise.";

const DECIDE_PROMPT: &str = "You are a research assistant. Based on the conversation: \
     if you need more information, call one of the available tools; \
     if you have enough, provide a comprehensive final answer.";

/// Tool-using policy: the model decides between calling a tool and giving
/// the final answer.  The first tool call of a completion wins.
#[derive(Debug, Default)]
pub struct ResearchPolicy {
    /// Stream thinking from the model instead of emitting a fixed line.
    /// Off by default: model-streamed thinking costs a completion per turn.
    model_thinking: bool,
}

impl ResearchPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model_thinking(mut self) -> Self {
        self.model_thinking = true;
        self
    }
}

#[async_trait]
impl LoopPolicy for ResearchPolicy {
    fn name(&self) -> &'static str {
        "research"
    }

    async fn think(
        &mut self,
        ctx: &mut AgentContext,
        io: &mut TurnIo<'_>,
    ) -> Result<(), LoopError> {
        if self.model_thinking {
            io.stream_thinking(ctx, self.task_class(), Some(THINK_PROMPT))
                .await;
        } else {
            io.emit_thinking("Planning the next research step...\n").await;
            ctx.append_thinking("Planning the next research step.");
        }
        Ok(())
    }

    async fn decide(
        &mut self,
        ctx: &mut AgentContext,
        io: &mut TurnIo<'_>,
    ) -> Result<AgentAction, LoopError> {
        let completion = io
            .generate(ctx, self.task_class(), Some(DECIDE_PROMPT), true)
            .await?;
        if let Some(tc) = completion.first_tool_call() {
            return Ok(AgentAction::ToolCall {
                id: tc.id,
                name: tc.name,
                args: tc.input,
            });
        }
        Ok(AgentAction::Answer {
            text: completion.content.trim().to_string(),
        })
    }
}
