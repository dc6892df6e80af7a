// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;

use lode_model::TaskClass;

use crate::context::AgentContext;
use crate::policy::{AgentAction, LoopError, LoopPolicy, TurnIo};

const DECIDE_PROMPT: &str = "You are a financial research agent. Work through scoping, data \
     collection, analysis, valuation and sentiment before reporting. Use the available \
     tools for market and filing data. You aggregate information; you never give \
     investment advice.";

const DISCLAIMER: &str = "This material aggregates publicly available information for \
     research purposes only. It is not investment advice, and no representation is made \
     as to its accuracy or completeness.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Scoping,
    Collecting,
    Analyzing,
    Valuating,
    Sentiment,
    Reporting,
}

impl Phase {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Scoping => "scoping",
            Self::Collecting => "collecting",
            Self::Analyzing => "analyzing",
            Self::Valuating => "valuating",
            Self::Sentiment => "sentiment",
            Self::Reporting => "reporting",
        }
    }
}

/// Financial-research policy: a six-phase workflow plus a compliance footer.
/// Every final answer carries the disclaimer and a references section.
#[derive(Debug)]
pub struct FinancialResearchPolicy {
    phase: Phase,
    tools_used: Vec<String>,
}

impl Default for FinancialResearchPolicy {
    fn default() -> Self {
        Self {
            phase: Phase::Scoping,
            tools_used: Vec::new(),
        }
    }
}

impl FinancialResearchPolicy {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LoopPolicy for FinancialResearchPolicy {
    fn name(&self) -> &'static str {
        "financial_research"
    }

    fn task_class(&self) -> TaskClass {
        TaskClass::FinancialAnalysis
    }

    async fn think(
        &mut self,
        ctx: &mut AgentContext,
        io: &mut TurnIo<'_>,
    ) -> Result<(), LoopError> {
        let line = format!("Phase: {} – deciding the next step...\n", self.phase.as_str());
        ctx.append_thinking(&line);
        io.emit_thinking(line).await;
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
        self.phase = Phase::Reporting;
        Ok(AgentAction::Answer {
            text: completion.content.trim().to_string(),
        })
    }

    fn phase_transition(&mut self, tool_name: &str) {
        let name = tool_name.to_lowercase();
        self.phase = if name.contains("valuat") {
            Phase::Valuating
        } else if name.contains("sentiment") || name.contains("news") {
            Phase::Sentiment
        } else if name.contains("analy") {
            Phase::Analyzing
        } else if name.contains("search") || name.contains("data") || name.contains("read") {
            Phase::Collecting
        } else if name.contains("report") {
            Phase::Reporting
        } else {
            self.phase
        };
        if !self.tools_used.contains(&tool_name.to_string()) {
            self.tools_used.push(tool_name.to_string());
        }
    }

    fn current_phase(&self) -> Option<&'static str> {
        Some(self.phase.as_str())
    }

    /// Compliance footer: every final answer carries the disclaimer and a
    /// references section.
    fn finalize_answer(&self, answer: String) -> String {
        let mut out = answer;
        out.push_str("\n\n## References\n");
        if self.tools_used.is_empty() {
            out.push_str("- Conversation context only; no external data sources were queried.\n");
        } else {
            for tool in &self.tools_used {
                out.push_str(&format!("- Data gathered via `{tool}`\n"));
            }
        }
        out.push_str("\n## Disclaimer\n");
        out.push_str(DISCLAIMER);
        out
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
