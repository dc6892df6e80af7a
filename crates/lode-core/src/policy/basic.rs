// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;

use lode_model::TaskClass;

use crate::context::AgentContext;
use crate::policy::{AgentAction, LoopError, LoopPolicy, TurnIo};

const SYSTEM_PROMPT: &str =
    "You are a helpful AI assistant. Provide clear and concise answers.";

/// The simplest policy: no tools, one thinking line, answer directly.
/// Useful for plain conversation and for exercising the loop end to end.
#[derive(Debug, Default)]
pub struct BasicPolicy;

#[async_trait]
impl LoopPolicy for BasicPolicy {
    fn name(&self) -> &'static str {
        "basic"
    }

    fn task_class(&self) -> TaskClass {
        TaskClass::QuickQa
    }

    async fn think(
        &mut self,
        ctx: &mut AgentContext,
        io: &mut TurnIo<'_>,
    ) -> Result<(), LoopError> {
        io.emit_thinking("Analyzing your question...\n").await;
        let question = ctx
            .messages
            .iter()
            .rev()
            .find(|m| m.role == lode_model::Role::User)
            .and_then(|m| m.as_text())
            .unwrap_or("N/A")
            .to_string();
        ctx.append_thinking(&format!("User question: {question}"));
        Ok(())
    }

    async fn decide(
        &mut self,
        ctx: &mut AgentContext,
        io: &mut TurnIo<'_>,
    ) -> Result<AgentAction, LoopError> {
        let completion = io
            .generate(ctx, self.task_class(), Some(SYSTEM_PROMPT), false)
            .await?;
        Ok(AgentAction::Answer {
            text: completion.content.trim().to_string(),
        })
    }
}
