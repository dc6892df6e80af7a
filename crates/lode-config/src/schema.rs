// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation failure.  Raised at construction time so a run
/// never starts with an unusable knob.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config value for `{field}`: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: String,
    },
}

fn default_max_iterations() -> u32 {
    50
}
fn default_max_tokens() -> usize {
    200_000
}
fn default_max_concurrent_tools() -> usize {
    10
}
fn default_strike_threshold() -> usize {
    3
}

/// Per-run configuration of the agent runtime.
///
/// Every field has an enumerated default; `validate()` is called by
/// `Runtime::new` so invalid combinations are rejected before the first
/// event is emitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Maximum number of loop iterations before the run stops.
    /// Zero is legal and produces an immediate `Done{Stopped}`.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Token budget for the run.  The loop terminates once usage reaches
    /// 95% of this value.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    /// Upper bound on concurrently executing tool calls (semaphore capacity).
    #[serde(default = "default_max_concurrent_tools")]
    pub max_concurrent_tools: usize,
    /// Per-tool execution timeout in seconds.  `None` leaves tool calls
    /// unbounded (a cap is recommended for production runs).
    #[serde(default)]
    pub tool_timeout_secs: Option<u64>,
    /// How long to wait for an operator answer to a confirmation request.
    /// `None` waits until confirmation or cancellation.
    #[serde(default)]
    pub confirm_timeout_secs: Option<u64>,
    /// Consecutive identical-taxonomy failures that trigger the reboot cycle.
    #[serde(default = "default_strike_threshold")]
    pub strike_threshold: usize,
    #[serde(default)]
    pub fallback: FallbackConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub memory: MemoryThresholds,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_tokens: default_max_tokens(),
            max_concurrent_tools: default_max_concurrent_tools(),
            tool_timeout_secs: None,
            confirm_timeout_secs: None,
            strike_threshold: default_strike_threshold(),
            fallback: FallbackConfig::default(),
            breaker: BreakerConfig::default(),
            memory: MemoryThresholds::default(),
        }
    }
}

impl RuntimeConfig {
    /// Check every knob for a usable value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_tokens == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_tokens",
                reason: "must be at least 1".into(),
            });
        }
        if self.max_concurrent_tools == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_concurrent_tools",
                reason: "must be at least 1".into(),
            });
        }
        if self.strike_threshold == 0 {
            return Err(ConfigError::InvalidValue {
                field: "strike_threshold",
                reason: "must be at least 1".into(),
            });
        }
        self.fallback.validate()?;
        self.breaker.validate()?;
        self.memory.validate()
    }
}

fn default_max_retries() -> usize {
    3
}
fn default_retry_delay_ms() -> u64 {
    1_000
}
fn default_fallback_chain() -> Vec<String> {
    vec![
        "anthropic/claude-3-5-sonnet".into(),
        "anthropic/claude-3-haiku".into(),
        "deepseek/deepseek-coder".into(),
    ]
}
fn default_default_model() -> String {
    "anthropic/claude-3-5-sonnet".into()
}
fn default_true() -> bool {
    true
}

/// Retry/degradation behaviour of the generation path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// Maximum retries after the primary model.  The attempt chain is capped
    /// at `max_retries + 1` entries.
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    /// Sleep between attempts, in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Declared degradation chain appended after the routed primary model.
    #[serde(default = "default_fallback_chain")]
    pub fallback_chain: Vec<String>,
    /// Append `default_model` as the final attempt.
    #[serde(default = "default_true")]
    pub use_default_model: bool,
    /// Model of last resort.
    #[serde(default = "default_default_model")]
    pub default_model: String,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            fallback_chain: default_fallback_chain(),
            use_default_model: true,
            default_model: default_default_model(),
        }
    }
}

impl FallbackConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.use_default_model && self.default_model.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "fallback.default_model",
                reason: "must name a model when use_default_model is set".into(),
            });
        }
        Ok(())
    }
}

fn default_breaker_threshold() -> u32 {
    5
}
fn default_breaker_window_secs() -> u64 {
    300
}

/// Per-model circuit breaker tuning.
///
/// A model is skipped while its error count within the sliding window is at
/// or above the threshold.  The first evaluation after the window elapses
/// resets the breaker to closed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_breaker_threshold")]
    pub threshold: u32,
    #[serde(default = "default_breaker_window_secs")]
    pub window_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: default_breaker_threshold(),
            window_secs: default_breaker_window_secs(),
        }
    }
}

impl BreakerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.threshold == 0 {
            return Err(ConfigError::InvalidValue {
                field: "breaker.threshold",
                reason: "must be at least 1".into(),
            });
        }
        if self.window_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "breaker.window_secs",
                reason: "must be at least 1 second".into(),
            });
        }
        Ok(())
    }
}

fn default_max_messages() -> usize {
    15
}
fn default_max_context_tokens() -> usize {
    50_000
}
fn default_finding_interval() -> u32 {
    2
}
fn default_recite_interval() -> u32 {
    5
}
fn default_findings_compact_bytes() -> usize {
    16_384
}
fn default_summary_max_len() -> usize {
    3_000
}
fn default_keep_recent_findings() -> usize {
    5
}

/// Working-memory trigger thresholds.
///
/// The message and token ceilings drive context clearing; the finding
/// interval is the 2-Action Rule; the recite interval controls plan
/// recitation cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryThresholds {
    /// Message count above which the context is cleared and substituted.
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    /// Estimated token count above which the context is cleared.
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: usize,
    /// Tool actions between forced findings writes (the 2-Action Rule).
    #[serde(default = "default_finding_interval")]
    pub finding_interval: u32,
    /// Iterations between plan recitations.
    #[serde(default = "default_recite_interval")]
    pub recite_interval: u32,
    /// Findings size (bytes) above which compaction is due.
    #[serde(default = "default_findings_compact_bytes")]
    pub findings_compact_bytes: usize,
    /// Upper bound on the compacted findings summary.
    #[serde(default = "default_summary_max_len")]
    pub summary_max_len: usize,
    /// Findings entries preserved verbatim through compaction.
    #[serde(default = "default_keep_recent_findings")]
    pub keep_recent_findings: usize,
}

impl Default for MemoryThresholds {
    fn default() -> Self {
        Self {
            max_messages: default_max_messages(),
            max_context_tokens: default_max_context_tokens(),
            finding_interval: default_finding_interval(),
            recite_interval: default_recite_interval(),
            findings_compact_bytes: default_findings_compact_bytes(),
            summary_max_len: default_summary_max_len(),
            keep_recent_findings: default_keep_recent_findings(),
        }
    }
}

impl MemoryThresholds {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_messages == 0 {
            return Err(ConfigError::InvalidValue {
                field: "memory.max_messages",
                reason: "must be at least 1".into(),
            });
        }
        if self.max_context_tokens == 0 {
            return Err(ConfigError::InvalidValue {
                field: "memory.max_context_tokens",
                reason: "must be at least 1".into(),
            });
        }
        if self.finding_interval == 0 {
            return Err(ConfigError::InvalidValue {
                field: "memory.finding_interval",
                reason: "must be at least 1".into(),
            });
        }
        if self.recite_interval == 0 {
            return Err(ConfigError::InvalidValue {
                field: "memory.recite_interval",
                reason: "must be at least 1".into(),
            });
        }
        if self.summary_max_len == 0 {
            return Err(ConfigError::InvalidValue {
                field: "memory.summary_max_len",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
