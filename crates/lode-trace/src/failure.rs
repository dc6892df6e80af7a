// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Closed classification of runtime failures.
///
/// Every failure the runtime observes lands in exactly one of these buckets;
/// retry policy and recovery advice key off the bucket, never off free text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureTaxonomy {
    ToolExecError,
    ToolTimeout,
    ToolPermissionDenied,
    SelectionMiss,
    PatchConflict,
    TestFail,
    LintFail,
    TypeCheckFail,
    NetworkUnreachable,
    ApiRateLimited,
    ApiError,
    ContextOverflow,
    BudgetExceeded,
    MaxRetriesReached,
    UserRejected,
    UserCancelled,
    Unknown,
}

impl FailureTaxonomy {
    /// One-line lesson attached to failure summaries.
    pub fn learning(&self) -> &'static str {
        match self {
            Self::ToolExecError => "tool execution failed; inspect the error output",
            Self::ToolTimeout => "operation timed out; raise the timeout or narrow the work",
            Self::ToolPermissionDenied => "insufficient permission; check file/API access",
            Self::SelectionMiss => "target not found; widen the search or check the path",
            Self::PatchConflict => "patch conflict; rebase or merge by hand",
            Self::TestFail => "tests failed; check the implementation or expectations",
            Self::LintFail => "lint violations; run the auto-fixer",
            Self::TypeCheckFail => "type errors; fix the annotations",
            Self::NetworkUnreachable => "network unreachable; check connectivity and retry",
            Self::ApiRateLimited => "rate limited; back off before retrying",
            Self::ApiError => "upstream API error; retry or switch models",
            Self::ContextOverflow => "context overflow; compact or split the work",
            Self::BudgetExceeded => "budget exhausted; operator confirmation needed",
            Self::MaxRetriesReached => "retry budget exhausted; replan the approach",
            Self::UserRejected => "operator rejected the action; adjust the plan",
            Self::UserCancelled => "operator cancelled the run",
            Self::Unknown => "unclassified failure",
        }
    }
}

impl std::fmt::Display for FailureTaxonomy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_else(|| "unknown".into());
        write!(f, "{s}")
    }
}

/// Where a failure signal originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureSource {
    Tool,
    Validation,
    Timeout,
    User,
    System,
}

/// Advisory recovery action paired with a failure.
///
/// The runtime never acts on these itself; they are hints surfaced to the
/// caller alongside the signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RecoveryStrategy {
    Retry { delay_secs: f32 },
    Replan { reason: String },
    ExpandContext { window_size: u32 },
    Rollback { checkpoint: String },
    Escalate { reason: String },
    Abort { reason: String },
}

impl RecoveryStrategy {
    pub fn retry(delay_secs: f32) -> Self {
        Self::Retry { delay_secs }
    }

    pub fn replan(reason: impl Into<String>) -> Self {
        Self::Replan {
            reason: reason.into(),
        }
    }

    pub fn expand_context(window_size: u32) -> Self {
        Self::ExpandContext { window_size }
    }

    pub fn rollback(checkpoint: impl Into<String>) -> Self {
        Self::Rollback {
            checkpoint: checkpoint.into(),
        }
    }

    pub fn escalate(reason: impl Into<String>) -> Self {
        Self::Escalate {
            reason: reason.into(),
        }
    }

    pub fn abort(reason: impl Into<String>) -> Self {
        Self::Abort {
            reason: reason.into(),
        }
    }

    /// Default strategy for a failure bucket.
    pub fn for_taxonomy(taxonomy: FailureTaxonomy) -> Self {
        use FailureTaxonomy as T;
        match taxonomy {
            T::ToolTimeout => Self::retry(2.0),
            T::ToolPermissionDenied => Self::escalate("authorization required"),
            T::SelectionMiss => Self::expand_context(30),
            T::PatchConflict => Self::replan("conflict needs manual resolution"),
            T::TestFail => Self::replan("tests failed, revise the implementation"),
            T::LintFail => Self::retry(1.0),
            T::TypeCheckFail => Self::replan("type errors need fixing"),
            T::NetworkUnreachable => Self::retry(5.0),
            T::ApiRateLimited => Self::retry(60.0),
            T::ContextOverflow => Self::replan("context must be compacted"),
            T::BudgetExceeded => Self::escalate("budget exceeded"),
            T::MaxRetriesReached => Self::abort("retry budget exhausted"),
            T::UserRejected => Self::replan("operator rejected the proposal"),
            T::UserCancelled => Self::abort("operator cancelled"),
            _ => Self::retry(1.0),
        }
    }
}

/// A single observed failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureSignal {
    pub signal_id: String,
    pub timestamp: DateTime<Utc>,
    pub source: FailureSource,
    pub tool_name: Option<String>,
    pub tool_args: Option<Value>,
    pub taxonomy: FailureTaxonomy,
    /// Zero means success and never produces a signal; anything else is a failure.
    pub exit_code: i32,
    pub error_message: String,
    pub stderr: Option<String>,
    pub state_name: Option<String>,
    pub task_id: Option<String>,
    pub session_id: Option<String>,
    pub retry_count: u32,
    pub is_retryable: bool,
    pub recovery_strategy: Option<RecoveryStrategy>,
}

impl FailureSignal {
    /// Build a signal from a raw tool result.  Returns `None` on exit code 0.
    #[allow(clippy::too_many_arguments)]
    pub fn from_tool_result(
        tool_name: &str,
        tool_args: &Value,
        exit_code: i32,
        stderr: &str,
        state_name: Option<&str>,
        task_id: Option<&str>,
        session_id: Option<&str>,
    ) -> Option<Self> {
        if exit_code == 0 {
            return None;
        }
        let taxonomy = classify(exit_code, stderr, tool_name);
        let error_message = if stderr.is_empty() {
            format!("exit code {exit_code}")
        } else {
            stderr.chars().take(500).collect()
        };
        Some(Self {
            signal_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            source: FailureSource::Tool,
            tool_name: Some(tool_name.to_string()),
            tool_args: Some(tool_args.clone()),
            taxonomy,
            exit_code,
            error_message,
            stderr: Some(stderr.to_string()),
            state_name: state_name.map(str::to_owned),
            task_id: task_id.map(str::to_owned),
            session_id: session_id.map(str::to_owned),
            retry_count: 0,
            is_retryable: is_retryable(taxonomy),
            recovery_strategy: Some(RecoveryStrategy::for_taxonomy(taxonomy)),
        })
    }

    /// Build a signal for a non-tool source (model errors, user actions).
    pub fn new(
        source: FailureSource,
        taxonomy: FailureTaxonomy,
        error_message: impl Into<String>,
        session_id: Option<&str>,
    ) -> Self {
        Self {
            signal_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            source,
            tool_name: None,
            tool_args: None,
            taxonomy,
            exit_code: 1,
            error_message: error_message.into(),
            stderr: None,
            state_name: None,
            task_id: None,
            session_id: session_id.map(str::to_owned),
            retry_count: 0,
            is_retryable: is_retryable(taxonomy),
            recovery_strategy: Some(RecoveryStrategy::for_taxonomy(taxonomy)),
        }
    }

    /// One-line lesson for failure summaries.
    pub fn learning(&self) -> String {
        match self.taxonomy {
            FailureTaxonomy::Unknown | FailureTaxonomy::ToolExecError
                if !self.error_message.is_empty() =>
            {
                format!("execution failed: {}", self.error_message)
            }
            t => t.learning().to_string(),
        }
    }
}

/// Fixed classification table from raw tool-result data.
///
/// Ordering matters: the first matching rule wins, and tool-name based
/// verification buckets are only consulted after the stderr patterns.
pub fn classify(exit_code: i32, stderr: &str, tool_name: &str) -> FailureTaxonomy {
    let stderr_lower = stderr.to_lowercase();
    let name_lower = tool_name.to_lowercase();

    if stderr_lower.contains("timeout") || exit_code == 124 {
        return FailureTaxonomy::ToolTimeout;
    }
    if stderr_lower.contains("permission") || stderr_lower.contains("denied") {
        return FailureTaxonomy::ToolPermissionDenied;
    }
    if stderr_lower.contains("not found") || stderr_lower.contains("no such file") {
        return FailureTaxonomy::SelectionMiss;
    }
    if stderr_lower.contains("connection") || stderr_lower.contains("network") {
        return FailureTaxonomy::NetworkUnreachable;
    }
    if stderr_lower.contains("rate limit") || stderr.contains("429") {
        return FailureTaxonomy::ApiRateLimited;
    }
    if name_lower.contains("test") {
        return FailureTaxonomy::TestFail;
    }
    if name_lower.contains("lint") {
        return FailureTaxonomy::LintFail;
    }
    if name_lower.contains("mypy") || name_lower.contains("type") {
        return FailureTaxonomy::TypeCheckFail;
    }
    FailureTaxonomy::ToolExecError
}

/// Retryability is a property of the bucket, not the individual failure.
pub fn is_retryable(taxonomy: FailureTaxonomy) -> bool {
    !matches!(
        taxonomy,
        FailureTaxonomy::UserCancelled
            | FailureTaxonomy::UserRejected
            | FailureTaxonomy::BudgetExceeded
            | FailureTaxonomy::MaxRetriesReached
    )
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ── Classification table ──────────────────────────────────────────────────

    #[test]
    fn classify_timeout_by_stderr() {
        assert_eq!(
            classify(1, "operation timeout after 30s", "shell"),
            FailureTaxonomy::ToolTimeout
        );
    }

    #[test]
    fn classify_timeout_by_exit_code_124() {
        assert_eq!(classify(124, "", "shell"), FailureTaxonomy::ToolTimeout);
    }

    #[test]
    fn classify_permission_denied() {
        assert_eq!(
            classify(1, "Permission denied: /etc/shadow", "read_file"),
            FailureTaxonomy::ToolPermissionDenied
        );
    }

    #[test]
    fn classify_selection_miss() {
        assert_eq!(
            classify(2, "cat: nope.txt: No such file or directory", "shell"),
            FailureTaxonomy::SelectionMiss
        );
    }

    #[test]
    fn classify_network() {
        assert_eq!(
            classify(1, "connection refused", "web_search"),
            FailureTaxonomy::NetworkUnreachable
        );
    }

    #[test]
    fn classify_rate_limited() {
        assert_eq!(
            classify(1, "HTTP 429 too many requests", "read_url"),
            FailureTaxonomy::ApiRateLimited
        );
    }

    #[test]
    fn classify_test_tool_by_name() {
        assert_eq!(
            classify(1, "2 assertions failed", "run_tests"),
            FailureTaxonomy::TestFail
        );
    }

    #[test]
    fn classify_lint_tool_by_name() {
        assert_eq!(classify(1, "E501", "lint_check"), FailureTaxonomy::LintFail);
    }

    #[test]
    fn classify_type_check_tool_by_name() {
        assert_eq!(
            classify(1, "incompatible types", "type_check"),
            FailureTaxonomy::TypeCheckFail
        );
    }

    #[test]
    fn classify_default_is_exec_error() {
        assert_eq!(
            classify(1, "something else entirely", "shell"),
            FailureTaxonomy::ToolExecError
        );
    }

    #[test]
    fn stderr_patterns_beat_tool_name_buckets() {
        // A test tool that times out is a timeout, not a test failure.
        assert_eq!(
            classify(124, "timeout", "run_tests"),
            FailureTaxonomy::ToolTimeout
        );
    }

    // ── Signal construction ───────────────────────────────────────────────────

    #[test]
    fn exit_code_zero_never_produces_a_signal() {
        assert!(FailureSignal::from_tool_result(
            "shell",
            &json!({}),
            0,
            "stderr noise",
            None,
            None,
            None
        )
        .is_none());
    }

    #[test]
    fn nonzero_exit_produces_exactly_one_signal() {
        let sig = FailureSignal::from_tool_result(
            "shell",
            &json!({"command": "ls"}),
            1,
            "permission denied",
            Some("collecting"),
            None,
            Some("s1"),
        )
        .unwrap();
        assert_eq!(sig.taxonomy, FailureTaxonomy::ToolPermissionDenied);
        assert_eq!(sig.exit_code, 1);
        assert_eq!(sig.session_id.as_deref(), Some("s1"));
        assert!(sig.recovery_strategy.is_some());
    }

    #[test]
    fn empty_stderr_fills_error_message_from_exit_code() {
        let sig =
            FailureSignal::from_tool_result("shell", &json!({}), 7, "", None, None, None).unwrap();
        assert_eq!(sig.error_message, "exit code 7");
    }

    // ── Retryability ──────────────────────────────────────────────────────────

    #[test]
    fn user_and_budget_taxa_are_non_retryable() {
        assert!(!is_retryable(FailureTaxonomy::UserCancelled));
        assert!(!is_retryable(FailureTaxonomy::UserRejected));
        assert!(!is_retryable(FailureTaxonomy::BudgetExceeded));
        assert!(!is_retryable(FailureTaxonomy::MaxRetriesReached));
    }

    #[test]
    fn everything_else_is_retryable() {
        assert!(is_retryable(FailureTaxonomy::ToolTimeout));
        assert!(is_retryable(FailureTaxonomy::NetworkUnreachable));
        assert!(is_retryable(FailureTaxonomy::Unknown));
    }

    // ── Recovery strategies ───────────────────────────────────────────────────

    #[test]
    fn rate_limit_recovery_is_long_retry() {
        match RecoveryStrategy::for_taxonomy(FailureTaxonomy::ApiRateLimited) {
            RecoveryStrategy::Retry { delay_secs } => assert_eq!(delay_secs, 60.0),
            other => panic!("unexpected strategy: {other:?}"),
        }
    }

    #[test]
    fn cancelled_recovery_is_abort() {
        assert!(matches!(
            RecoveryStrategy::for_taxonomy(FailureTaxonomy::UserCancelled),
            RecoveryStrategy::Abort { .. }
        ));
    }

    #[test]
    fn recovery_strategy_serialises_with_action_tag() {
        let s = RecoveryStrategy::expand_context(30);
        let json = serde_json::to_string(&s).unwrap();
        assert!(json.contains("\"action\":\"expand_context\""));
        assert!(json.contains("\"window_size\":30"));
    }

    #[test]
    fn taxonomy_display_is_snake_case() {
        assert_eq!(
            FailureTaxonomy::ToolPermissionDenied.to_string(),
            "tool_permission_denied"
        );
    }
}
