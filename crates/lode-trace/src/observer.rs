// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use serde::Serialize;
use tracing::warn;

use crate::failure::{FailureSignal, FailureTaxonomy};

const DEFAULT_MAX_HISTORY: usize = 100;

/// Aggregate failure statistics for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct ObserverStats {
    pub total_failures: u64,
    pub by_taxonomy: HashMap<String, u64>,
    pub consecutive_count: usize,
    pub consecutive_taxonomy: Option<FailureTaxonomy>,
    pub should_abort: bool,
}

#[derive(Default)]
struct ObserverState {
    history: VecDeque<FailureSignal>,
    counts: HashMap<FailureTaxonomy, u64>,
    consecutive: Vec<FailureSignal>,
    total: u64,
}

/// Collects failure signals, tracks consecutive identical-taxonomy streaks
/// and answers the 3-strike question.
///
/// Runs on the loop's own task; the internal mutex only makes the store
/// safe to share across concurrent runs, it carries no parallelism of its
/// own.
pub struct FailureObserver {
    state: Mutex<ObserverState>,
    strike_threshold: usize,
    max_history: usize,
}

impl FailureObserver {
    pub fn new(strike_threshold: usize) -> Self {
        Self {
            state: Mutex::new(ObserverState::default()),
            strike_threshold,
            max_history: DEFAULT_MAX_HISTORY,
        }
    }

    pub fn with_max_history(mut self, max_history: usize) -> Self {
        self.max_history = max_history.max(1);
        self
    }

    pub fn strike_threshold(&self) -> usize {
        self.strike_threshold
    }

    /// Record a failure signal: bounded history (newest kept), per-taxonomy
    /// counter, and the consecutive streak tracker.
    pub fn observe(&self, signal: FailureSignal) {
        let mut state = self.state.lock().unwrap();

        warn!(
            taxonomy = %signal.taxonomy,
            exit_code = signal.exit_code,
            retry = signal.retry_count,
            "failure observed"
        );

        *state.counts.entry(signal.taxonomy).or_insert(0) += 1;
        state.total += 1;

        match state.consecutive.last() {
            Some(last) if last.taxonomy == signal.taxonomy => {
                state.consecutive.push(signal.clone())
            }
            _ => state.consecutive = vec![signal.clone()],
        }

        state.history.push_back(signal);
        while state.history.len() > self.max_history {
            state.history.pop_front();
        }
    }

    /// True iff the consecutive identical-taxonomy streak has reached the
    /// strike threshold.
    pub fn should_abort(&self) -> bool {
        self.state.lock().unwrap().consecutive.len() >= self.strike_threshold
    }

    /// The taxonomy of the active strike, if one has triggered.
    pub fn consecutive_taxonomy(&self) -> Option<FailureTaxonomy> {
        let state = self.state.lock().unwrap();
        if state.consecutive.len() >= self.strike_threshold {
            state.consecutive.first().map(|s| s.taxonomy)
        } else {
            None
        }
    }

    /// Clear the consecutive streak.  Called after any successful action and
    /// on reboot exit.
    pub fn clear_consecutive(&self) {
        self.state.lock().unwrap().consecutive.clear();
    }

    /// Best-effort retrieval of similar past failures by keyword overlap
    /// against tool name, error message and taxonomy.
    pub fn get_similar(&self, query: &str, limit: usize) -> Vec<FailureSignal> {
        let keywords: std::collections::HashSet<String> = query
            .to_lowercase()
            .split_whitespace()
            .map(str::to_owned)
            .collect();
        if keywords.is_empty() {
            return Vec::new();
        }

        let state = self.state.lock().unwrap();
        let mut scored: Vec<(usize, &FailureSignal)> = state
            .history
            .iter()
            .filter_map(|f| {
                let text = format!(
                    "{} {} {}",
                    f.tool_name.as_deref().unwrap_or(""),
                    f.error_message,
                    f.taxonomy
                )
                .to_lowercase();
                let words: std::collections::HashSet<&str> =
                    text.split_whitespace().collect();
                let overlap = keywords.iter().filter(|k| words.contains(k.as_str())).count();
                (overlap > 0).then_some((overlap, f))
            })
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored.into_iter().take(limit).map(|(_, f)| f.clone()).collect()
    }

    /// Markdown digest of recent failures, suitable for injection into the
    /// next prompt during plan recitation.  Empty when nothing has failed.
    pub fn summary(&self) -> String {
        let state = self.state.lock().unwrap();
        if state.history.is_empty() {
            return String::new();
        }

        let mut lines = vec!["## Past failures (avoid repeating)".to_string()];
        for f in state.history.iter().rev().take(5).collect::<Vec<_>>().into_iter().rev() {
            lines.push(format!(
                "- [{}] {} (exit_code={})",
                f.taxonomy,
                f.learning(),
                f.exit_code
            ));
        }
        if state.consecutive.len() >= 2 {
            lines.push(String::new());
            lines.push(format!(
                "WARNING: {} consecutive {} failures",
                state.consecutive.len(),
                state.consecutive[0].taxonomy
            ));
        }
        lines.join("\n")
    }

    pub fn stats(&self) -> ObserverStats {
        let state = self.state.lock().unwrap();
        ObserverStats {
            total_failures: state.total,
            by_taxonomy: state
                .counts
                .iter()
                .map(|(t, c)| (t.to_string(), *c))
                .collect(),
            consecutive_count: state.consecutive.len(),
            consecutive_taxonomy: state.consecutive.first().map(|s| s.taxonomy),
            should_abort: state.consecutive.len() >= self.strike_threshold,
        }
    }

    /// Number of signals currently held in the bounded history.
    pub fn history_len(&self) -> usize {
        self.state.lock().unwrap().history.len()
    }

    /// Drop all recorded state.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        *state = ObserverState::default();
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
