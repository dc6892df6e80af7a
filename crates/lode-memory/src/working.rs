// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use lode_config::MemoryThresholds;

use crate::store::{FileStore, MemoryError};

/// The content substituted for the conversation history when the context is
/// cleared: file-backed summaries instead of messages.
#[derive(Debug, Clone)]
pub struct ContextInjection {
    pub summary: String,
    pub recent_findings: String,
    pub current_objective: String,
    pub token_estimate: usize,
}

impl ContextInjection {
    /// Render as a single synthetic system message body.
    pub fn as_system_message(&self) -> String {
        format!(
            "Context restored from working memory.\n\n\
             ## Objective\n{}\n\n## Summary\n{}\n\n## Recent findings\n{}",
            self.current_objective, self.summary, self.recent_findings
        )
    }
}

/// Best-effort snapshot of session state inferred from the memory files.
/// A checkpoint for inspection, never a recovery protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub topic: String,
    pub phase: String,
    pub entry_count: usize,
    pub recent_queries: Vec<String>,
    pub findings_summary: String,
}

/// `length / 4` token estimate; a monotonic upper bound is all callers need.
pub fn estimate_tokens(text: &str) -> usize {
    text.len() / 4
}

struct MemoryState {
    actions_since_finding: u32,
    error_streaks: HashMap<String, u32>,
}

/// Three-file working memory for one session: `plan` (written once, then
/// read), `progress` (append-only action log), `findings` (append-only with
/// periodic compaction).
///
/// Plan and progress are never truncated; findings is the only file subject
/// to compaction.
pub struct WorkingMemory {
    files: Arc<dyn FileStore>,
    session_id: String,
    thresholds: MemoryThresholds,
    strike_threshold: u32,
    state: Mutex<MemoryState>,
}

impl WorkingMemory {
    pub fn new(
        files: Arc<dyn FileStore>,
        session_id: impl Into<String>,
        thresholds: MemoryThresholds,
        strike_threshold: u32,
    ) -> Self {
        Self {
            files,
            session_id: session_id.into(),
            thresholds,
            strike_threshold,
            state: Mutex::new(MemoryState {
                actions_since_finding: 0,
                error_streaks: HashMap::new(),
            }),
        }
    }

    fn path(&self, file: &str) -> String {
        format!("sessions/{}/{}", self.session_id, file)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    // ── plan ─────────────────────────────────────────────────────────────────

    /// Write the plan once.  Returns `false` (and leaves the file untouched)
    /// when a plan already exists – the original plan is never truncated.
    pub fn write_plan(&self, content: &str) -> Result<bool, MemoryError> {
        let path = self.path("plan.md");
        if self.files.exists(&path) && !self.files.read(&path)?.trim().is_empty() {
            return Ok(false);
        }
        self.files.write(&path, content)?;
        Ok(true)
    }

    pub fn read_plan(&self) -> Result<String, MemoryError> {
        match self.files.read(&self.path("plan.md")) {
            Ok(c) => Ok(c),
            Err(MemoryError::NotFound(_)) => Ok(String::new()),
            Err(e) => Err(e),
        }
    }

    /// Leading excerpt of the plan for prompt injection.
    pub fn plan_excerpt(&self, max_chars: usize) -> Result<String, MemoryError> {
        let plan = self.read_plan()?;
        Ok(plan.chars().take(max_chars).collect())
    }

    // ── progress ─────────────────────────────────────────────────────────────

    /// Append one timestamped entry to the progress log.
    pub fn log_action(
        &self,
        title: &str,
        details: &str,
        status_glyph: &str,
    ) -> Result<(), MemoryError> {
        let entry = format!(
            "### {status_glyph} {title} – {}\n{details}\n\n",
            Utc::now().format("%Y-%m-%d %H:%M:%S")
        );
        self.files.append(&self.path("progress.md"), &entry)
    }

    /// Trailing `tail_chars` of the progress log.
    pub fn read_progress(&self, tail_chars: usize) -> Result<String, MemoryError> {
        let progress = match self.files.read(&self.path("progress.md")) {
            Ok(c) => c,
            Err(MemoryError::NotFound(_)) => return Ok(String::new()),
            Err(e) => return Err(e),
        };
        if progress.len() <= tail_chars {
            return Ok(progress);
        }
        let cut = progress.len() - tail_chars;
        // Avoid splitting a UTF-8 sequence.
        let start = (cut..progress.len())
            .find(|i| progress.is_char_boundary(*i))
            .unwrap_or(0);
        Ok(format!("...{}", &progress[start..]))
    }

    // ── findings ─────────────────────────────────────────────────────────────

    /// Append a discovery to the findings file and reset the 2-Action
    /// counter.
    pub fn record_finding(&self, title: &str, content: &str) -> Result<(), MemoryError> {
        let entry = format!(
            "## {title} – {}\n\n{content}\n\n",
            Utc::now().format("%Y-%m-%d %H:%M:%S")
        );
        self.files.append(&self.path("findings.md"), &entry)?;
        self.state.lock().unwrap().actions_since_finding = 0;
        debug!(title, "finding recorded");
        Ok(())
    }

    pub fn read_findings(&self) -> Result<String, MemoryError> {
        match self.files.read(&self.path("findings.md")) {
            Ok(c) => Ok(c),
            Err(MemoryError::NotFound(_)) => Ok(String::new()),
            Err(e) => Err(e),
        }
    }

    /// Count one significant tool action toward the 2-Action Rule.
    pub fn note_tool_action(&self) {
        self.state.lock().unwrap().actions_since_finding += 1;
    }

    /// True every N tool actions since the last finding write.
    pub fn should_record_finding(&self) -> bool {
        self.state.lock().unwrap().actions_since_finding >= self.thresholds.finding_interval
    }

    // ── triggers ─────────────────────────────────────────────────────────────

    /// True every M iterations.
    pub fn should_recite_plan(&self, iteration: u32) -> bool {
        iteration > 0 && iteration % self.thresholds.recite_interval == 0
    }

    /// True when the context is over budget: too many messages, too many
    /// estimated tokens, or findings past the compaction watermark.
    pub fn should_clear_context(&self, message_count: usize, token_count: Option<usize>) -> bool {
        if message_count > self.thresholds.max_messages {
            info!(message_count, "context clear triggered by message count");
            return true;
        }
        if let Some(tokens) = token_count {
            if tokens > self.thresholds.max_context_tokens {
                info!(tokens, "context clear triggered by token estimate");
                return true;
            }
        }
        let findings_len = self.read_findings().map(|f| f.len()).unwrap_or(0);
        if findings_len > self.thresholds.findings_compact_bytes {
            info!(findings_len, "context clear triggered by findings size");
            return true;
        }
        false
    }

    // ── error streaks ────────────────────────────────────────────────────────

    /// Track a per-kind error streak.  Returns `true` when the streak for
    /// `kind` reaches the strike threshold (caller enters a reboot cycle).
    pub fn log_error(
        &self,
        kind: &str,
        details: &str,
        tool_name: Option<&str>,
    ) -> Result<bool, MemoryError> {
        let streak = {
            let mut state = self.state.lock().unwrap();
            let streak = state.error_streaks.entry(kind.to_string()).or_insert(0);
            *streak += 1;
            *streak
        };
        let tool = tool_name.unwrap_or("-");
        self.log_action(
            &format!("Error: {kind}"),
            &format!("tool: {tool}\n{details}"),
            "⚠️",
        )?;
        Ok(streak >= self.strike_threshold)
    }

    pub fn reset_error_streaks(&self) {
        self.state.lock().unwrap().error_streaks.clear();
    }

    // ── clearing & compaction ────────────────────────────────────────────────

    /// Compact findings, log the event, and return the injection that
    /// replaces the conversation history.
    pub fn clear_and_summarize(&self) -> Result<ContextInjection, MemoryError> {
        self.maybe_compact_findings()?;

        let summary = self.findings_summary(self.thresholds.summary_max_len)?;
        let recent_findings = {
            let findings = self.read_findings()?;
            tail(&findings, 500)
        };
        let current_objective = self.current_objective()?;

        self.log_action(
            "Context Cleared",
            "conversation history substituted with working-memory summary",
            "📖",
        )?;

        let total = summary.len() + recent_findings.len() + current_objective.len();
        Ok(ContextInjection {
            summary,
            recent_findings,
            current_objective,
            token_estimate: total / 4,
        })
    }

    /// Compact the findings file down to a bounded summary when it is past
    /// the watermark.  The most recent entries survive verbatim; older ones
    /// are reduced to their titles.
    fn maybe_compact_findings(&self) -> Result<(), MemoryError> {
        let findings = self.read_findings()?;
        if findings.len() <= self.thresholds.findings_compact_bytes {
            return Ok(());
        }

        let entries = split_entries(&findings);
        let keep = self.thresholds.keep_recent_findings;
        let (old, recent) = if entries.len() > keep {
            entries.split_at(entries.len() - keep)
        } else {
            (&entries[..0], &entries[..])
        };

        let mut compacted = String::from("## Earlier findings (compacted)\n\n");
        for entry in old {
            compacted.push_str(&format!("- {}\n", entry_title(entry)));
        }
        compacted.push('\n');
        for entry in recent {
            compacted.push_str(entry);
            compacted.push('\n');
        }
        if compacted.len() > self.thresholds.findings_compact_bytes {
            compacted.truncate(floor_char_boundary(
                &compacted,
                self.thresholds.findings_compact_bytes,
            ));
        }
        self.files.write(&self.path("findings.md"), &compacted)?;
        info!(
            before = findings.len(),
            after = compacted.len(),
            "findings compacted"
        );
        Ok(())
    }

    /// Bounded digest of findings: entry titles plus the trailing content.
    fn findings_summary(&self, max_len: usize) -> Result<String, MemoryError> {
        let findings = self.read_findings()?;
        if findings.is_empty() {
            return Ok(String::from("No findings recorded yet."));
        }
        let titles: Vec<String> = split_entries(&findings)
            .iter()
            .map(|e| format!("- {}", entry_title(e)))
            .collect();
        let mut summary = titles.join("\n");
        if summary.len() > max_len {
            summary.truncate(floor_char_boundary(&summary, max_len));
        }
        Ok(summary)
    }

    /// Objective from the plan's `## Goal` section, or its first content
    /// line.
    fn current_objective(&self) -> Result<String, MemoryError> {
        let plan = self.read_plan()?;
        let mut in_goal = false;
        let mut goal_lines = Vec::new();
        for line in plan.lines() {
            let trimmed = line.trim();
            if trimmed.starts_with("## Goal") {
                in_goal = true;
                continue;
            }
            if trimmed.starts_with("##") && in_goal {
                break;
            }
            if in_goal {
                goal_lines.push(line);
            }
        }
        let goal = goal_lines.join("\n").trim().to_string();
        if !goal.is_empty() {
            return Ok(goal.chars().take(300).collect());
        }
        // Fall back to the first non-heading line.
        Ok(plan
            .lines()
            .find(|l| !l.trim().is_empty() && !l.starts_with('#'))
            .unwrap_or("No specific objective defined.")
            .chars()
            .take(300)
            .collect())
    }

    // ── snapshot ─────────────────────────────────────────────────────────────

    /// Infer a session snapshot from the memory files.
    pub fn snapshot(&self) -> Result<StateSnapshot, MemoryError> {
        let findings = self.read_findings()?;
        let entries = split_entries(&findings);
        let phase = match entries.len() {
            0 => "init",
            1..=2 => "searching",
            3..=7 => "reading",
            8..=14 => "synthesizing",
            _ => "reporting",
        };
        let recent_queries: Vec<String> = entries
            .iter()
            .map(|e| entry_title(e))
            .filter(|t| t.to_lowercase().contains("search"))
            .rev()
            .take(10)
            .collect();
        let topic = self
            .read_plan()?
            .lines()
            .find(|l| !l.trim().is_empty() && !l.starts_with('#'))
            .unwrap_or("unknown")
            .chars()
            .take(100)
            .collect();
        Ok(StateSnapshot {
            topic,
            phase: phase.to_string(),
            entry_count: entries.len(),
            recent_queries,
            findings_summary: self.findings_summary(1000)?,
        })
    }

    /// Persist an opaque state blob next to the memory files.
    pub fn save_state(&self, state: &serde_json::Value) -> Result<(), MemoryError> {
        let body = serde_json::to_string_pretty(state).unwrap_or_else(|_| "{}".into());
        self.files.write(&self.path("agent_state.json"), &body)
    }

    pub fn load_state(&self) -> Result<Option<serde_json::Value>, MemoryError> {
        match self.files.read(&self.path("agent_state.json")) {
            Ok(body) => Ok(serde_json::from_str(&body).ok()),
            Err(MemoryError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Split a findings document into `## `-headed entries.
fn split_entries(findings: &str) -> Vec<String> {
    let mut entries = Vec::new();
    let mut current = String::new();
    for line in findings.lines() {
        if line.starts_with("## ") && !current.trim().is_empty() {
            entries.push(std::mem::take(&mut current));
        }
        current.push_str(line);
        current.push('\n');
    }
    if !current.trim().is_empty() {
        entries.push(current);
    }
    entries
}

fn entry_title(entry: &str) -> String {
    entry
        .lines()
        .next()
        .unwrap_or("")
        .trim_start_matches("## ")
        .to_string()
}

fn tail(text: &str, max_chars: usize) -> String {
    if text.len() <= max_chars {
        return text.to_string();
    }
    let cut = text.len() - max_chars;
    let start = (cut..text.len())
        .find(|i| text.is_char_boundary(*i))
        .unwrap_or(0);
    format!("...{}", &text[start..])
}

fn floor_char_boundary(text: &str, index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    (0..=index).rev().find(|i| text.is_char_boundary(*i)).unwrap_or(0)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryFileStore;

    fn memory() -> WorkingMemory {
        WorkingMemory::new(
            Arc::new(MemoryFileStore::new()),
            "s1",
            MemoryThresholds::default(),
            3,
        )
    }

    fn memory_with(thresholds: MemoryThresholds) -> WorkingMemory {
        WorkingMemory::new(Arc::new(MemoryFileStore::new()), "s1", thresholds, 3)
    }

    // ── Plan ──────────────────────────────────────────────────────────────────

    #[test]
    fn plan_is_written_once() {
        let m = memory();
        assert!(m.write_plan("# Plan\n\n## Goal\nship it\n").unwrap());
        assert!(!m.write_plan("overwrite attempt").unwrap());
        assert!(m.read_plan().unwrap().contains("ship it"));
    }

    #[test]
    fn plan_excerpt_truncates() {
        let m = memory();
        m.write_plan(&"x".repeat(1000)).unwrap();
        assert_eq!(m.plan_excerpt(100).unwrap().len(), 100);
    }

    #[test]
    fn missing_plan_reads_empty() {
        assert_eq!(memory().read_plan().unwrap(), "");
    }

    // ── Progress ──────────────────────────────────────────────────────────────

    #[test]
    fn log_action_appends_timestamped_entries() {
        let m = memory();
        m.log_action("User Input Received", "hello", "📥").unwrap();
        m.log_action("Tool Call: shell", "ls", "🔧").unwrap();
        let progress = m.read_progress(10_000).unwrap();
        assert!(progress.contains("User Input Received"));
        assert!(progress.contains("Tool Call: shell"));
        let first = progress.find("User Input").unwrap();
        let second = progress.find("Tool Call").unwrap();
        assert!(first < second, "progress is append-only");
    }

    #[test]
    fn read_progress_tail_is_bounded() {
        let m = memory();
        for i in 0..50 {
            m.log_action(&format!("step {i}"), "details", "🔧").unwrap();
        }
        let progress_tail = m.read_progress(200).unwrap();
        assert!(progress_tail.len() <= 203); // "..." prefix
        assert!(progress_tail.starts_with("..."));
    }

    // ── 2-Action Rule ─────────────────────────────────────────────────────────

    #[test]
    fn finding_due_after_two_actions() {
        let m = memory();
        assert!(!m.should_record_finding());
        m.note_tool_action();
        assert!(!m.should_record_finding());
        m.note_tool_action();
        assert!(m.should_record_finding());
    }

    #[test]
    fn recording_a_finding_resets_the_counter() {
        let m = memory();
        m.note_tool_action();
        m.note_tool_action();
        m.record_finding("Search results", "three useful links").unwrap();
        assert!(!m.should_record_finding());
    }

    // ── Recitation & clearing triggers ────────────────────────────────────────

    #[test]
    fn recite_fires_on_interval_multiples() {
        let m = memory();
        assert!(!m.should_recite_plan(0));
        assert!(!m.should_recite_plan(4));
        assert!(m.should_recite_plan(5));
        assert!(m.should_recite_plan(10));
    }

    #[test]
    fn clear_triggers_on_message_count() {
        let m = memory();
        assert!(!m.should_clear_context(15, None));
        assert!(m.should_clear_context(16, None));
    }

    #[test]
    fn clear_triggers_on_token_estimate() {
        let m = memory();
        assert!(!m.should_clear_context(1, Some(50_000)));
        assert!(m.should_clear_context(1, Some(50_001)));
    }

    #[test]
    fn clear_triggers_on_findings_watermark() {
        let thresholds = MemoryThresholds {
            findings_compact_bytes: 100,
            ..Default::default()
        };
        let m = memory_with(thresholds);
        assert!(!m.should_clear_context(1, None));
        m.record_finding("Big", &"x".repeat(200)).unwrap();
        assert!(m.should_clear_context(1, None));
    }

    // ── Error streaks ─────────────────────────────────────────────────────────

    #[test]
    fn error_streak_crosses_threshold() {
        let m = memory();
        assert!(!m.log_error("ToolExecError", "boom", Some("shell")).unwrap());
        assert!(!m.log_error("ToolExecError", "boom", Some("shell")).unwrap());
        assert!(m.log_error("ToolExecError", "boom", Some("shell")).unwrap());
    }

    #[test]
    fn streaks_are_per_kind() {
        let m = memory();
        m.log_error("A", "x", None).unwrap();
        m.log_error("A", "x", None).unwrap();
        assert!(!m.log_error("B", "y", None).unwrap());
    }

    #[test]
    fn reset_clears_streaks() {
        let m = memory();
        m.log_error("A", "x", None).unwrap();
        m.log_error("A", "x", None).unwrap();
        m.reset_error_streaks();
        assert!(!m.log_error("A", "x", None).unwrap());
    }

    // ── Clear & summarize ─────────────────────────────────────────────────────

    #[test]
    fn clear_and_summarize_returns_injection() {
        let m = memory();
        m.write_plan("# Research\n\n## Goal\nmap the field\n").unwrap();
        m.record_finding("Source A", "useful data").unwrap();
        let injection = m.clear_and_summarize().unwrap();
        assert!(injection.summary.contains("Source A"));
        assert_eq!(injection.current_objective, "map the field");
        assert!(injection.token_estimate > 0);
        // The event lands in the progress log.
        assert!(m.read_progress(10_000).unwrap().contains("Context Cleared"));
    }

    #[test]
    fn clear_and_summarize_leaves_plan_untouched() {
        let m = memory();
        let plan = "# Plan\n\n## Goal\noriginal goal\n";
        m.write_plan(plan).unwrap();
        m.record_finding("F", "data").unwrap();
        let _ = m.clear_and_summarize().unwrap();
        assert_eq!(m.read_plan().unwrap(), plan);
    }

    #[test]
    fn injection_renders_as_system_message() {
        let m = memory();
        m.write_plan("## Goal\nanswer the question\n").unwrap();
        let injection = m.clear_and_summarize().unwrap();
        let body = injection.as_system_message();
        assert!(body.contains("## Objective"));
        assert!(body.contains("answer the question"));
    }

    // ── Compaction ────────────────────────────────────────────────────────────

    #[test]
    fn oversized_findings_are_compacted_keeping_recent_entries() {
        let thresholds = MemoryThresholds {
            findings_compact_bytes: 600,
            keep_recent_findings: 2,
            ..Default::default()
        };
        let m = memory_with(thresholds);
        for i in 0..6 {
            m.record_finding(&format!("Entry {i}"), &"data ".repeat(40)).unwrap();
        }
        let before = m.read_findings().unwrap();
        assert!(before.len() > 600);

        let _ = m.clear_and_summarize().unwrap();
        let after = m.read_findings().unwrap();
        assert!(after.len() <= 600);
        assert!(after.contains("Earlier findings (compacted)"));
        // The most recent entry survives with content, the oldest as title only.
        assert!(after.contains("Entry 5"));
        assert!(after.contains("- Entry 0"));
    }

    #[test]
    fn small_findings_are_not_compacted() {
        let m = memory();
        m.record_finding("Only entry", "short").unwrap();
        let before = m.read_findings().unwrap();
        let _ = m.clear_and_summarize().unwrap();
        assert_eq!(m.read_findings().unwrap(), before);
    }

    // ── Snapshot & state ──────────────────────────────────────────────────────

    #[test]
    fn snapshot_infers_phase_from_entry_count() {
        let m = memory();
        assert_eq!(m.snapshot().unwrap().phase, "init");
        m.record_finding("Search: topic", "r").unwrap();
        assert_eq!(m.snapshot().unwrap().phase, "searching");
        for i in 0..7 {
            m.record_finding(&format!("F{i}"), "r").unwrap();
        }
        assert_eq!(m.snapshot().unwrap().phase, "synthesizing");
    }

    #[test]
    fn snapshot_collects_search_queries() {
        let m = memory();
        m.record_finding("Search: rust agents", "r").unwrap();
        m.record_finding("Plain note", "r").unwrap();
        let snap = m.snapshot().unwrap();
        assert_eq!(snap.recent_queries.len(), 1);
        assert!(snap.recent_queries[0].contains("rust agents"));
    }

    #[test]
    fn state_blob_round_trips() {
        let m = memory();
        assert!(m.load_state().unwrap().is_none());
        m.save_state(&serde_json::json!({"phase": "reading"})).unwrap();
        let loaded = m.load_state().unwrap().unwrap();
        assert_eq!(loaded["phase"], "reading");
    }

    // ── Token estimate ────────────────────────────────────────────────────────

    #[test]
    fn token_estimate_is_len_over_four() {
        assert_eq!(estimate_tokens("12345678"), 2);
        assert_eq!(estimate_tokens(""), 0);
    }
}
