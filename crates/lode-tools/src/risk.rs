// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Risk levels and operation categories for tool authorization.

use serde::{Deserialize, Serialize};

/// Risk level of a tool operation, ordered from harmless to irreversible.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    /// Pure read, no side effects.
    #[default]
    None,
    /// Creates new artifacts without touching existing ones.
    Low,
    /// Mutates existing files or state.
    Medium,
    /// Can lose data or change the system.
    High,
    /// Irreversible; always requires confirmation.
    Critical,
}

/// Category of the operation a tool performs.  Operators can pre-authorize
/// whole categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationCategory {
    WebSearch,
    WebRead,
    WebInteract,
    FileRead,
    FileCreate,
    FileModify,
    FileDelete,
    ShellSafe,
    ShellWrite,
    ShellDangerous,
    DocumentCreate,
}

/// Default risk level for an operation category.
pub fn default_risk_for(category: OperationCategory) -> RiskLevel {
    use OperationCategory as C;
    match category {
        C::WebSearch | C::WebRead | C::FileRead => RiskLevel::None,
        C::WebInteract | C::FileCreate | C::DocumentCreate | C::ShellSafe => RiskLevel::Low,
        C::FileModify | C::FileDelete => RiskLevel::Medium,
        C::ShellWrite => RiskLevel::High,
        C::ShellDangerous => RiskLevel::Critical,
    }
}

/// True when `risk` does not exceed `threshold`.
pub fn risk_within(risk: RiskLevel, threshold: RiskLevel) -> bool {
    risk <= threshold
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
