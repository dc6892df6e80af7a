// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use lode_config::BreakerConfig;

use crate::breaker::BreakerState;
use crate::catalog::{estimate_cost, static_catalog, Capability, CatalogEntry};

const HISTORY_CAP: usize = 100;

/// Coarse task classification used for model selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskClass {
    DeepResearch,
    FinancialAnalysis,
    PptGeneration,
    CodeGeneration,
    QuickQa,
    Multimodal,
    General,
}

impl TaskClass {
    /// Capabilities a model should carry for this task.  Drives the
    /// task-fit term of the score.
    fn required_capabilities(&self) -> &'static [Capability] {
        use Capability as C;
        match self {
            Self::DeepResearch | Self::FinancialAnalysis => &[C::Reasoning, C::Analysis],
            Self::PptGeneration => &[C::Balanced, C::Coding],
            Self::CodeGeneration => &[C::Coding],
            Self::QuickQa => &[C::Fast, C::SimpleQa],
            Self::Multimodal => &[C::Multimodal, C::Vision],
            Self::General => &[C::Balanced],
        }
    }

    /// Unconstrained task → model table.
    fn default_model(&self) -> &'static str {
        match self {
            Self::DeepResearch => "anthropic/claude-3-opus",
            Self::FinancialAnalysis => "anthropic/claude-3-5-sonnet",
            Self::PptGeneration => "anthropic/claude-3-5-sonnet",
            Self::CodeGeneration => "deepseek/deepseek-coder",
            Self::QuickQa => "anthropic/claude-3-haiku",
            Self::Multimodal => "google/gemini-pro-vision",
            Self::General => "anthropic/claude-3-5-sonnet",
        }
    }
}

/// Optional constraints narrowing the candidate set.
#[derive(Debug, Clone, Default)]
pub struct Constraints {
    /// Maximum estimated cost per call (USD).
    pub max_cost_per_call: Option<f64>,
    /// Maximum acceptable average latency.
    pub max_latency_ms: Option<f64>,
    /// Input context length in tokens.
    pub context_length: Option<u32>,
    /// Expected output length in tokens.
    pub expected_output_length: Option<u32>,
    /// Capabilities the model must carry.
    pub required_capabilities: Vec<Capability>,
    /// First matching preferred model short-circuits the scorer.
    pub preferred_models: Vec<String>,
    pub excluded_models: Vec<String>,
}

/// The routing decision handed back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub model: String,
    pub reason: &'static str,
}

/// One remembered routing decision, kept for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct RoutingContext {
    pub task: TaskClass,
    pub selected_model: String,
    pub reason: &'static str,
    pub candidates: Vec<String>,
    pub constrained: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Default)]
struct RouterState {
    history: VecDeque<RoutingContext>,
    breakers: HashMap<String, BreakerState>,
}

/// Selects a model for a task class under optional constraints, and owns the
/// per-model circuit breakers consulted by the generation pipeline.
///
/// Routing history and breaker state live behind a single lock per router
/// instance.
pub struct Router {
    catalog: Vec<CatalogEntry>,
    breaker_cfg: BreakerConfig,
    state: Mutex<RouterState>,
}

impl Router {
    pub fn new(breaker_cfg: BreakerConfig) -> Self {
        Self::with_catalog(static_catalog(), breaker_cfg)
    }

    /// Build against an explicit catalog.  Entry order is the stable
    /// tie-break for equal scores.
    pub fn with_catalog(catalog: Vec<CatalogEntry>, breaker_cfg: BreakerConfig) -> Self {
        Self {
            catalog,
            breaker_cfg,
            state: Mutex::new(RouterState::default()),
        }
    }

    pub fn catalog(&self) -> &[CatalogEntry] {
        &self.catalog
    }

    /// Select a model for `task` under the given constraints.
    pub fn select(&self, task: TaskClass, constraints: Option<&Constraints>) -> Selection {
        let (selection, candidates) = match constraints {
            None => (
                Selection {
                    model: self.table_model(task),
                    reason: "task_table",
                },
                Vec::new(),
            ),
            Some(c) => self.select_constrained(task, c),
        };

        info!(task = ?task, model = %selection.model, reason = selection.reason, "routed");

        let mut state = self.state.lock().unwrap();
        state.history.push_back(RoutingContext {
            task,
            selected_model: selection.model.clone(),
            reason: selection.reason,
            candidates,
            constrained: constraints.is_some(),
            timestamp: Utc::now(),
        });
        while state.history.len() > HISTORY_CAP {
            state.history.pop_front();
        }

        selection
    }

    /// Task-table lookup, falling back to the first catalog entry if the
    /// table names a model missing from a custom catalog.
    fn table_model(&self, task: TaskClass) -> String {
        let name = task.default_model();
        if self.catalog.iter().any(|e| e.name == name) {
            name.to_string()
        } else {
            self.catalog
                .first()
                .map(|e| e.name.clone())
                .unwrap_or_else(|| name.to_string())
        }
    }

    fn select_constrained(
        &self,
        task: TaskClass,
        c: &Constraints,
    ) -> (Selection, Vec<String>) {
        let candidates: Vec<&CatalogEntry> = self
            .catalog
            .iter()
            .filter(|e| !c.excluded_models.contains(&e.name))
            .filter(|e| c.context_length.map_or(true, |len| e.context_window >= len))
            .filter(|e| c.max_latency_ms.map_or(true, |max| e.avg_latency_ms <= max))
            .filter(|e| {
                c.max_cost_per_call.map_or(true, |max| {
                    let est = estimate_cost(
                        e,
                        c.context_length.unwrap_or(1000),
                        c.expected_output_length.unwrap_or(1000),
                    );
                    est <= max
                })
            })
            .filter(|e| {
                c.required_capabilities
                    .iter()
                    .all(|cap| e.has_capability(*cap))
            })
            .collect();

        if candidates.is_empty() {
            warn!(task = ?task, "no candidates satisfy constraints, relaxing to task table");
            return (
                Selection {
                    model: self.table_model(task),
                    reason: "constraints_relaxed",
                },
                Vec::new(),
            );
        }

        let names: Vec<String> = candidates.iter().map(|e| e.name.clone()).collect();

        // Preferred models short-circuit scoring.
        for preferred in &c.preferred_models {
            if names.contains(preferred) {
                return (
                    Selection {
                        model: preferred.clone(),
                        reason: "user_preference",
                    },
                    names,
                );
            }
        }

        // Argmax over the weighted score; strict greater-than keeps the
        // earliest catalog entry on ties (stable ordering).
        let mut best = candidates[0];
        let mut best_score = self.score(best, task, c);
        for e in &candidates[1..] {
            let s = self.score(e, task, c);
            if s > best_score {
                best = e;
                best_score = s;
            }
        }

        let reason = if best.has_capability(Capability::Fast) {
            "latency_optimized"
        } else if best.has_capability(Capability::Cheap) {
            "cost_optimized"
        } else if best.has_capability(Capability::Reasoning) {
            "quality_optimized"
        } else {
            "balanced"
        };
        (
            Selection {
                model: best.name.clone(),
                reason,
            },
            names,
        )
    }

    /// Weighted score on a 0–100 scale: task fit 40, cost 30, latency 20,
    /// capability breadth 10.
    fn score(&self, entry: &CatalogEntry, task: TaskClass, c: &Constraints) -> f64 {
        let required: Vec<Capability> = if c.required_capabilities.is_empty() {
            task.required_capabilities().to_vec()
        } else {
            c.required_capabilities.clone()
        };

        let matched = required
            .iter()
            .filter(|cap| entry.has_capability(**cap))
            .count();
        let task_fit = matched as f64 / required.len().max(1) as f64;

        let est_cost = estimate_cost(
            entry,
            c.context_length.unwrap_or(1000),
            c.expected_output_length.unwrap_or(1000),
        );
        let cost_score = (30.0 - est_cost * 100.0).max(0.0);
        let latency_score = (20.0 - entry.avg_latency_ms / 500.0).max(0.0);
        let capability_breadth = (entry.capabilities.len() as f64 * 2.0).min(10.0);

        40.0 * task_fit + cost_score + latency_score + capability_breadth
    }

    /// Last-N routing decisions, oldest first.
    pub fn history(&self) -> Vec<RoutingContext> {
        self.state.lock().unwrap().history.iter().cloned().collect()
    }

    pub fn clear_history(&self) {
        self.state.lock().unwrap().history.clear();
    }

    // ── Circuit breakers ─────────────────────────────────────────────────────

    /// True while the model's breaker is open (skip it for this window).
    pub fn breaker_open(&self, model: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        state
            .breakers
            .entry(model.to_string())
            .or_default()
            .is_open(&self.breaker_cfg)
    }

    pub fn record_model_error(&self, model: &str) {
        let mut state = self.state.lock().unwrap();
        state
            .breakers
            .entry(model.to_string())
            .or_default()
            .record_error(&self.breaker_cfg);
    }

    pub fn record_model_success(&self, model: &str) {
        let mut state = self.state.lock().unwrap();
        state
            .breakers
            .entry(model.to_string())
            .or_default()
            .record_success();
    }

    pub fn breaker_error_count(&self, model: &str) -> u32 {
        let state = self.state.lock().unwrap();
        state
            .breakers
            .get(model)
            .map(|b| b.error_count())
            .unwrap_or(0)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
