// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Model catalog: static metadata for known models.

use serde::{Deserialize, Serialize};

/// A routing-relevant model capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Reasoning,
    Coding,
    Analysis,
    Balanced,
    Fast,
    Cheap,
    SimpleQa,
    Multimodal,
    Vision,
    LongContext,
    Thinking,
}

/// Metadata for a single model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CatalogEntry {
    /// Gateway-scoped model identifier (e.g. "anthropic/claude-3-5-sonnet")
    pub name: String,
    /// Gateway or provider identifier
    pub provider: String,
    /// USD per 1000 input tokens
    pub cost_per_1k_input: f64,
    /// USD per 1000 output tokens
    pub cost_per_1k_output: f64,
    /// Total context window in tokens
    pub context_window: u32,
    /// Rolling average request latency
    pub avg_latency_ms: f64,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
}

impl CatalogEntry {
    pub fn has_capability(&self, cap: Capability) -> bool {
        self.capabilities.contains(&cap)
    }
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    models: Vec<CatalogEntry>,
}

/// Return all entries from the bundled static catalog, in declaration order.
/// Declaration order is the router's stable tie-break.
pub fn static_catalog() -> Vec<CatalogEntry> {
    let yaml = include_str!("../models.yaml");
    let catalog: CatalogFile =
        serde_yaml::from_str(yaml).expect("bundled models.yaml must be valid");
    catalog.models
}

/// Look up a single model by name.  Returns `None` if not in the catalog.
pub fn lookup(name: &str) -> Option<CatalogEntry> {
    static_catalog().into_iter().find(|e| e.name == name)
}

/// Estimated call cost in USD: `(in/1000)·rate_in + (out/1000)·rate_out`.
pub fn estimate_cost(entry: &CatalogEntry, input_tokens: u32, output_tokens: u32) -> f64 {
    (input_tokens as f64 / 1000.0) * entry.cost_per_1k_input
        + (output_tokens as f64 / 1000.0) * entry.cost_per_1k_output
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_catalog_is_non_empty() {
        assert!(!static_catalog().is_empty());
    }

    #[test]
    fn all_names_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for e in static_catalog() {
            assert!(seen.insert(e.name.clone()), "duplicate model: {}", e.name);
        }
    }

    #[test]
    fn sonnet_is_in_catalog() {
        let e = lookup("anthropic/claude-3-5-sonnet").expect("sonnet must be bundled");
        assert!(e.context_window >= 200_000);
        assert!(e.has_capability(Capability::Balanced));
    }

    #[test]
    fn lookup_unknown_returns_none() {
        assert!(lookup("nonexistent/model-xyz").is_none());
    }

    #[test]
    fn estimate_cost_matches_formula() {
        let e = lookup("anthropic/claude-3-5-sonnet").unwrap();
        // 1000 in @ 3.0 + 1000 out @ 15.0 = 0.018 USD
        let cost = estimate_cost(&e, 1000, 1000);
        assert!((cost - 0.018).abs() < 1e-9);
    }

    #[test]
    fn free_models_cost_nothing() {
        let e = lookup("meta-llama/llama-3.3-70b-instruct").unwrap();
        assert_eq!(estimate_cost(&e, 100_000, 100_000), 0.0);
    }

    #[test]
    fn all_entries_have_positive_windows_and_latency() {
        for e in static_catalog() {
            assert!(e.context_window > 0, "{} has zero context_window", e.name);
            assert!(e.avg_latency_ms > 0.0, "{} has zero latency", e.name);
        }
    }

    #[test]
    fn capabilities_deserialize_snake_case() {
        let e = lookup("google/gemini-2.0-flash").unwrap();
        assert!(e.has_capability(Capability::LongContext));
    }
}
