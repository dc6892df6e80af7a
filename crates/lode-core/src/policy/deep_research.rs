// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;

use lode_model::TaskClass;

use crate::context::AgentContext;
use crate::policy::{AgentAction, LoopError, LoopPolicy, TurnIo};

const DECIDE_PROMPT: &str = "You are a deep-research agent. Gather information with the \
     available tools, cross-check sources, and record findings as you go. \
     When the evidence is sufficient, write the final report.";

const REPORT_PROMPT: &str = "You are a deep-research agent. Using everything gathered in \
     this conversation, write the final structured report with sections and citations.";

/// Hard ceiling after which report generation is forced regardless of how
/// many sources were read.
const MAX_RESEARCH_ITERATIONS: u32 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Init,
    Searching,
    Reading,
    Synthesizing,
    Reporting,
}

impl Phase {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Searching => "searching",
            Self::Reading => "reading",
            Self::Synthesizing => "synthesizing",
            Self::Reporting => "reporting",
        }
    }
}

/// Research policy with an explicit phase machine driven by the last tool
/// invoked.  Report generation is forced once enough sources were read or
/// the iteration ceiling is hit.
#[derive(Debug)]
pub struct DeepResearchPolicy {
    phase: Phase,
    sources_read: usize,
    source_cap: usize,
}

impl Default for DeepResearchPolicy {
    fn default() -> Self {
        Self {
            phase: Phase::Init,
            sources_read: 0,
            source_cap: 12,
        }
    }
}

impl DeepResearchPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source_cap(mut self, cap: usize) -> Self {
        self.source_cap = cap;
        self
    }

    fn must_report(&self, ctx: &AgentContext) -> bool {
        self.phase == Phase::Reporting
            || self.sources_read >= self.source_cap
            || ctx.iteration > MAX_RESEARCH_ITERATIONS
    }
}

#[async_trait]
impl LoopPolicy for DeepResearchPolicy {
    fn name(&self) -> &'static str {
        "deep_research"
    }

    fn task_class(&self) -> TaskClass {
        TaskClass::DeepResearch
    }

    async fn think(
        &mut self,
        ctx: &mut AgentContext,
        io: &mut TurnIo<'_>,
    ) -> Result<(), LoopError> {
        let line = match self.phase {
            Phase::Init => "Scoping the research question...\n".to_string(),
            Phase::Searching => "Searching for sources...\n".to_string(),
            Phase::Reading => format!(
                "Reading sources ({}/{} collected)...\n",
                self.sources_read, self.source_cap
            ),
            Phase::Synthesizing => "Synthesizing collected material...\n".to_string(),
            Phase::Reporting => "Writing the final report...\n".to_string(),
        };
        ctx.append_thinking(&line);
        io.emit_thinking(line).await;
        Ok(())
    }

    async fn decide(
        &mut self,
        ctx: &mut AgentContext,
        io: &mut TurnIo<'_>,
    ) -> Result<AgentAction, LoopError> {
        if self.must_report(ctx) {
            self.phase = Phase::Reporting;
            let completion = io
                .generate(ctx, self.task_class(), Some(REPORT_PROMPT), false)
                .await?;
            return Ok(AgentAction::Answer {
                text: completion.content.trim().to_string(),
            });
        }

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

    fn phase_transition(&mut self, tool_name: &str) {
        let name = tool_name.to_lowercase();
        self.phase = if name.contains("search") {
            Phase::Searching
        } else if name.contains("read") || name.contains("url") || name.contains("file") {
            self.sources_read += 1;
            Phase::Reading
        } else if name.contains("finding") || name.contains("synth") {
            Phase::Synthesizing
        } else if name.contains("report") || name.contains("export") {
            Phase::Reporting
        } else {
            self.phase
        };
    }

    fn current_phase(&self) -> Option<&'static str> {
        Some(self.phase.as_str())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
