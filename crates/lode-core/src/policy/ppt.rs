// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde::Serialize;

use lode_model::TaskClass;

use crate::context::AgentContext;
use crate::policy::{AgentAction, LoopError, LoopPolicy, TurnIo};

const DECIDE_PROMPT: &str = "You are a presentation-building agent. Research the topic with \
     the available tools if needed, then produce the deck content: a title line followed \
     by one `## ` heading per slide with bullet points underneath.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Init,
    Analyzing,
    Outlining,
    Filling,
    Styling,
    Exporting,
}

impl Phase {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Analyzing => "analyzing",
            Self::Outlining => "outlining",
            Self::Filling => "filling",
            Self::Styling => "styling",
            Self::Exporting => "exporting",
        }
    }
}

#[derive(Debug, Serialize)]
struct Slide {
    kind: &'static str,
    title: String,
    bullets: Vec<String>,
}

#[derive(Debug, Serialize)]
struct SlideOutline {
    title: String,
    slides: Vec<Slide>,
}

/// Presentation-building policy.  The final answer is a structured slide
/// outline (JSON), not prose.
#[derive(Debug)]
pub struct PptPolicy {
    phase: Phase,
}

impl Default for PptPolicy {
    fn default() -> Self {
        Self { phase: Phase::Init }
    }
}

impl PptPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Turn deck prose (`title`, `## slide`, `- bullet`) into the outline
    /// structure.
    fn outline_from(content: &str) -> SlideOutline {
        let mut lines = content.lines().peekable();
        let title = lines
            .peek()
            .map(|l| l.trim_start_matches('#').trim().to_string())
            .unwrap_or_else(|| "Untitled deck".into());

        let mut slides: Vec<Slide> = vec![Slide {
            kind: "title",
            title: title.clone(),
            bullets: Vec::new(),
        }];
        for line in content.lines() {
            let trimmed = line.trim();
            if let Some(heading) = trimmed.strip_prefix("## ") {
                slides.push(Slide {
                    kind: "content",
                    title: heading.to_string(),
                    bullets: Vec::new(),
                });
            } else if let Some(bullet) = trimmed.strip_prefix("- ") {
                if let Some(last) = slides.last_mut() {
                    last.bullets.push(bullet.to_string());
                }
            }
        }
        SlideOutline { title, slides }
    }
}

#[async_trait]
impl LoopPolicy for PptPolicy {
    fn name(&self) -> &'static str {
        "ppt"
    }

    fn task_class(&self) -> TaskClass {
        TaskClass::PptGeneration
    }

    async fn think(
        &mut self,
        ctx: &mut AgentContext,
        io: &mut TurnIo<'_>,
    ) -> Result<(), LoopError> {
        let line = format!("Deck build phase: {}...\n", self.phase.as_str());
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
        self.phase = Phase::Exporting;
        Ok(AgentAction::Answer {
            text: completion.content.trim().to_string(),
        })
    }

    fn phase_transition(&mut self, tool_name: &str) {
        let name = tool_name.to_lowercase();
        self.phase = if name.contains("search") || name.contains("read") {
            Phase::Analyzing
        } else if name.contains("outline") {
            Phase::Outlining
        } else if name.contains("fill") || name.contains("content") {
            Phase::Filling
        } else if name.contains("style") || name.contains("theme") {
            Phase::Styling
        } else if name.contains("export") || name.contains("render") {
            Phase::Exporting
        } else {
            self.phase
        };
    }

    fn current_phase(&self) -> Option<&'static str> {
        Some(self.phase.as_str())
    }

    /// The final answer is the slide-outline structure, not prose.
    fn finalize_answer(&self, answer: String) -> String {
        let outline = Self::outline_from(&answer);
        serde_json::to_string_pretty(&outline).unwrap_or(answer)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
