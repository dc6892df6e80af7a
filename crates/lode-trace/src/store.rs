// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::failure::{FailureSignal, FailureTaxonomy};
use crate::observer::FailureObserver;

const DEFAULT_CAP: usize = 1_000;

/// What kind of decision a trace records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    StateTransition,
    ToolCall,
    ToolResult,
    Failure,
    Recovery,
}

/// One immutable entry in the decision log.
///
/// Written append-only by the runtime; everything else reads.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionTrace {
    pub trace_id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: DecisionKind,
    pub session_id: Option<String>,
    pub task_id: Option<String>,
    pub from_state: Option<String>,
    pub to_state: Option<String>,
    pub signal: Option<String>,
    pub tool_name: Option<String>,
    pub tool_args: Option<Value>,
    pub exit_code: Option<i32>,
    pub duration_ms: Option<f64>,
    pub context: serde_json::Map<String, Value>,
}

impl DecisionTrace {
    fn new(kind: DecisionKind) -> Self {
        Self {
            trace_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            kind,
            session_id: None,
            task_id: None,
            from_state: None,
            to_state: None,
            signal: None,
            tool_name: None,
            tool_args: None,
            exit_code: None,
            duration_ms: None,
            context: serde_json::Map::new(),
        }
    }

    /// Identity ignoring trace id and timestamp; used to collapse duplicate
    /// writes of the same logical record.
    fn same_content(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.session_id == other.session_id
            && self.task_id == other.task_id
            && self.from_state == other.from_state
            && self.to_state == other.to_state
            && self.signal == other.signal
            && self.tool_name == other.tool_name
            && self.tool_args == other.tool_args
            && self.exit_code == other.exit_code
    }
}

/// Per-session counters derived from the log.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub total_traces: usize,
    pub tool_calls: usize,
    pub state_transitions: usize,
    pub failures: usize,
    pub failure_taxonomies: Vec<String>,
    pub unique_tools: Vec<String>,
}

#[derive(Default)]
struct StoreInner {
    traces: VecDeque<DecisionTrace>,
    failures: VecDeque<FailureSignal>,
}

/// Append-only decision-trace store (memory mode is authoritative).
///
/// The store owns the write paths; a non-zero tool exit additionally
/// synthesizes a [`FailureSignal`] and forwards it to the observer.  The
/// observer is built first, so no reference cycle exists.
pub struct TraceStore {
    inner: Mutex<StoreInner>,
    observer: Arc<FailureObserver>,
    cap: usize,
}

impl TraceStore {
    pub fn new(observer: Arc<FailureObserver>) -> Self {
        Self {
            inner: Mutex::new(StoreInner::default()),
            observer,
            cap: DEFAULT_CAP,
        }
    }

    pub fn with_cap(mut self, cap: usize) -> Self {
        self.cap = cap.max(2);
        self
    }

    pub fn observer(&self) -> &Arc<FailureObserver> {
        &self.observer
    }

    // ── Write paths ──────────────────────────────────────────────────────────

    pub fn record_state_transition(
        &self,
        from: &str,
        to: &str,
        signal: &str,
        session_id: Option<&str>,
        task_id: Option<&str>,
    ) -> String {
        let mut trace = DecisionTrace::new(DecisionKind::StateTransition);
        trace.from_state = Some(from.to_string());
        trace.to_state = Some(to.to_string());
        trace.signal = Some(signal.to_string());
        trace.session_id = session_id.map(str::to_owned);
        trace.task_id = task_id.map(str::to_owned);
        self.append(trace)
    }

    /// Start of a tool call.
    pub fn record_tool_call(
        &self,
        tool_name: &str,
        tool_args: &Value,
        session_id: Option<&str>,
        state_name: Option<&str>,
    ) -> String {
        let mut trace = DecisionTrace::new(DecisionKind::ToolCall);
        trace.tool_name = Some(tool_name.to_string());
        trace.tool_args = Some(tool_args.clone());
        trace.session_id = session_id.map(str::to_owned);
        trace.from_state = state_name.map(str::to_owned);
        self.append(trace)
    }

    /// Completion of a tool call.  On non-zero exit this synthesizes exactly
    /// one failure signal and forwards it to the observer.
    #[allow(clippy::too_many_arguments)]
    pub fn record_tool_result(
        &self,
        tool_name: &str,
        tool_args: &Value,
        exit_code: i32,
        duration_ms: f64,
        stdout: &str,
        stderr: &str,
        session_id: Option<&str>,
        state_name: Option<&str>,
    ) -> String {
        let mut trace = DecisionTrace::new(DecisionKind::ToolResult);
        trace.tool_name = Some(tool_name.to_string());
        trace.tool_args = Some(tool_args.clone());
        trace.exit_code = Some(exit_code);
        trace.duration_ms = Some(duration_ms);
        trace.session_id = session_id.map(str::to_owned);
        trace.from_state = state_name.map(str::to_owned);
        trace.context.insert(
            "stdout_preview".into(),
            Value::String(stdout.chars().take(200).collect()),
        );
        trace.context.insert(
            "stderr_preview".into(),
            Value::String(stderr.chars().take(200).collect()),
        );
        let id = self.append(trace);

        if let Some(signal) = FailureSignal::from_tool_result(
            tool_name, tool_args, exit_code, stderr, state_name, None, session_id,
        ) {
            self.record_failure(signal);
        }
        id
    }

    /// A cancelled tool call leaves a trace but no failure signal; a cancel
    /// is not a tool failure.
    pub fn record_tool_cancelled(
        &self,
        tool_name: &str,
        tool_args: &Value,
        duration_ms: f64,
        session_id: Option<&str>,
    ) -> String {
        let mut trace = DecisionTrace::new(DecisionKind::ToolResult);
        trace.tool_name = Some(tool_name.to_string());
        trace.tool_args = Some(tool_args.clone());
        trace.duration_ms = Some(duration_ms);
        trace.session_id = session_id.map(str::to_owned);
        trace
            .context
            .insert("cancelled".into(), Value::Bool(true));
        self.append(trace)
    }

    /// Record a failure that did not come from a tool exit code (model
    /// errors, user rejections).  Also forwards to the observer.
    pub fn record_failure(&self, signal: FailureSignal) -> String {
        let mut trace = DecisionTrace::new(DecisionKind::Failure);
        trace.tool_name = signal.tool_name.clone();
        trace.session_id = signal.session_id.clone();
        trace.task_id = signal.task_id.clone();
        trace.exit_code = Some(signal.exit_code);
        trace.signal = Some(signal.taxonomy.to_string());
        trace
            .context
            .insert("error".into(), Value::String(signal.error_message.clone()));
        let id = self.append(trace);

        {
            let mut inner = self.inner.lock().unwrap();
            inner.failures.push_back(signal.clone());
            let cap = self.cap;
            while inner.failures.len() > cap {
                inner.failures.pop_front();
            }
        }
        self.observer.observe(signal);
        id
    }

    /// Record that a recovery strategy was applied.
    pub fn record_recovery(
        &self,
        strategy: &str,
        detail: &str,
        session_id: Option<&str>,
    ) -> String {
        let mut trace = DecisionTrace::new(DecisionKind::Recovery);
        trace.signal = Some(strategy.to_string());
        trace.session_id = session_id.map(str::to_owned);
        trace
            .context
            .insert("detail".into(), Value::String(detail.to_string()));
        self.append(trace)
    }

    fn append(&self, trace: DecisionTrace) -> String {
        let mut inner = self.inner.lock().unwrap();

        // Idempotence for identical inputs: a write whose content equals the
        // most recent trace collapses into it.
        if let Some(last) = inner.traces.back() {
            if last.same_content(&trace) {
                debug!(trace_id = %last.trace_id, "collapsed duplicate trace write");
                return last.trace_id.clone();
            }
        }

        let id = trace.trace_id.clone();
        inner.traces.push_back(trace);
        if inner.traces.len() > self.cap {
            // FIFO eviction down to half capacity.
            let keep = self.cap / 2;
            while inner.traces.len() > keep {
                inner.traces.pop_front();
            }
        }
        id
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    pub fn recent(
        &self,
        limit: usize,
        kind: Option<DecisionKind>,
        session_id: Option<&str>,
    ) -> Vec<DecisionTrace> {
        let inner = self.inner.lock().unwrap();
        let matching: Vec<&DecisionTrace> = inner
            .traces
            .iter()
            .filter(|t| kind.map_or(true, |k| t.kind == k))
            .filter(|t| session_id.map_or(true, |s| t.session_id.as_deref() == Some(s)))
            .collect();
        matching
            .into_iter()
            .rev()
            .take(limit)
            .rev()
            .cloned()
            .collect()
    }

    pub fn tool_calls(
        &self,
        tool_name: Option<&str>,
        session_id: Option<&str>,
        limit: usize,
    ) -> Vec<DecisionTrace> {
        let inner = self.inner.lock().unwrap();
        let matching: Vec<&DecisionTrace> = inner
            .traces
            .iter()
            .filter(|t| matches!(t.kind, DecisionKind::ToolCall | DecisionKind::ToolResult))
            .filter(|t| tool_name.map_or(true, |n| t.tool_name.as_deref() == Some(n)))
            .filter(|t| session_id.map_or(true, |s| t.session_id.as_deref() == Some(s)))
            .collect();
        matching
            .into_iter()
            .rev()
            .take(limit)
            .rev()
            .cloned()
            .collect()
    }

    pub fn failures(
        &self,
        taxonomy: Option<FailureTaxonomy>,
        session_id: Option<&str>,
        limit: usize,
    ) -> Vec<FailureSignal> {
        let inner = self.inner.lock().unwrap();
        let matching: Vec<&FailureSignal> = inner
            .failures
            .iter()
            .filter(|f| taxonomy.map_or(true, |t| f.taxonomy == t))
            .filter(|f| session_id.map_or(true, |s| f.session_id.as_deref() == Some(s)))
            .collect();
        matching
            .into_iter()
            .rev()
            .take(limit)
            .rev()
            .cloned()
            .collect()
    }

    pub fn session_summary(&self, session_id: &str) -> SessionSummary {
        let inner = self.inner.lock().unwrap();
        let traces: Vec<&DecisionTrace> = inner
            .traces
            .iter()
            .filter(|t| t.session_id.as_deref() == Some(session_id))
            .collect();
        let failures: Vec<&FailureSignal> = inner
            .failures
            .iter()
            .filter(|f| f.session_id.as_deref() == Some(session_id))
            .collect();

        let mut unique_tools: Vec<String> = traces
            .iter()
            .filter(|t| t.kind == DecisionKind::ToolCall)
            .filter_map(|t| t.tool_name.clone())
            .collect();
        unique_tools.sort();
        unique_tools.dedup();

        let mut taxonomies: Vec<String> =
            failures.iter().map(|f| f.taxonomy.to_string()).collect();
        taxonomies.sort();
        taxonomies.dedup();

        SessionSummary {
            session_id: session_id.to_string(),
            total_traces: traces.len(),
            tool_calls: traces
                .iter()
                .filter(|t| t.kind == DecisionKind::ToolCall)
                .count(),
            state_transitions: traces
                .iter()
                .filter(|t| t.kind == DecisionKind::StateTransition)
                .count(),
            failures: failures.len(),
            failure_taxonomies: taxonomies,
            unique_tools,
        }
    }

    /// Export traces (optionally one session) as JSON values.
    pub fn export(&self, session_id: Option<&str>) -> Vec<Value> {
        let inner = self.inner.lock().unwrap();
        inner
            .traces
            .iter()
            .filter(|t| session_id.map_or(true, |s| t.session_id.as_deref() == Some(s)))
            .map(|t| serde_json::to_value(t).unwrap_or(Value::Null))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().traces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop data for one session, or everything when `None`.
    pub fn clear(&self, session_id: Option<&str>) {
        let mut inner = self.inner.lock().unwrap();
        match session_id {
            Some(s) => {
                inner.traces.retain(|t| t.session_id.as_deref() != Some(s));
                inner.failures.retain(|f| f.session_id.as_deref() != Some(s));
            }
            None => {
                inner.traces.clear();
                inner.failures.clear();
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
