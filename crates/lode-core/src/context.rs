// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use lode_model::Message;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("illegal tool call transition {from:?} -> {to:?}")]
    IllegalTransition {
        from: ToolCallState,
        to: ToolCallState,
    },
}

/// Tool call lifecycle: `Pending → Running → (Success | Error | Cancelled)`.
/// No other transitions are legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCallState {
    Pending,
    Running,
    Success,
    Error,
    Cancelled,
}

impl ToolCallState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Cancelled)
    }

    fn can_transition(&self, to: ToolCallState) -> bool {
        matches!(
            (self, to),
            (Self::Pending, ToolCallState::Running)
                | (Self::Running, ToolCallState::Success)
                | (Self::Running, ToolCallState::Error)
                | (Self::Pending, ToolCallState::Cancelled)
                | (Self::Running, ToolCallState::Cancelled)
        )
    }
}

/// Record of one tool invocation inside a turn.
#[derive(Debug, Clone)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub args: Value,
    pub status: ToolCallState,
    pub result: Option<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ToolCallRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>, args: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            args,
            status: ToolCallState::Pending,
            result: None,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Advance the lifecycle, rejecting illegal transitions.
    pub fn advance(&mut self, to: ToolCallState) -> Result<(), ContextError> {
        if !self.status.can_transition(to) {
            return Err(ContextError::IllegalTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        if to.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }
}

/// Pending operator confirmation.
#[derive(Debug, Clone)]
pub struct PendingConfirmation {
    pub action_id: String,
    pub tool_name: String,
    pub requested_at: DateTime<Utc>,
}

/// Per-session runtime state, owned by the loop for the lifetime of one
/// `run()` invocation.  Tools only ever see read-only projections.
#[derive(Debug)]
pub struct AgentContext {
    pub session_id: String,
    pub user_id: String,
    pub workspace_id: String,
    pub messages: Vec<Message>,
    pub current_message_id: Option<String>,
    pub current_thinking: String,
    pub current_tool_calls: Vec<ToolCallRecord>,
    pub plan: Option<String>,
    /// Opaque per-session cache handed to policies.
    pub kv_cache: serde_json::Map<String, Value>,
    pub tokens_used: usize,
    pub max_tokens: usize,
    pub iteration: u32,
    pub max_iterations: u32,
    pub pending_confirmation: Option<PendingConfirmation>,
    pub confirmation_result: Option<bool>,
}

impl AgentContext {
    pub fn new(
        session_id: impl Into<String>,
        user_id: impl Into<String>,
        workspace_id: impl Into<String>,
        max_tokens: usize,
        max_iterations: u32,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            workspace_id: workspace_id.into(),
            messages: Vec::new(),
            current_message_id: None,
            current_thinking: String::new(),
            current_tool_calls: Vec::new(),
            plan: None,
            kv_cache: serde_json::Map::new(),
            tokens_used: 0,
            max_tokens,
            iteration: 0,
            max_iterations,
            pending_confirmation: None,
            confirmation_result: None,
        }
    }

    /// Start a new turn: assign the message id (set before the first event
    /// emission) and clear per-turn scratch state.
    pub fn begin_turn(&mut self) {
        self.current_message_id = Some(Uuid::new_v4().to_string());
        self.current_thinking.clear();
        self.current_tool_calls.clear();
    }

    pub fn message_id(&self) -> String {
        self.current_message_id.clone().unwrap_or_default()
    }

    pub fn increment_iteration(&mut self) {
        self.iteration += 1;
    }

    pub fn add_tokens(&mut self, input_tokens: u32, output_tokens: u32) {
        self.tokens_used += (input_tokens + output_tokens) as usize;
    }

    pub fn append_thinking(&mut self, text: &str) {
        self.current_thinking.push_str(text);
    }

    pub fn add_tool_call(&mut self, record: ToolCallRecord) {
        self.current_tool_calls.push(record);
    }

    pub fn tool_call_mut(&mut self, id: &str) -> Option<&mut ToolCallRecord> {
        self.current_tool_calls.iter_mut().find(|tc| tc.id == id)
    }

    pub fn set_pending_confirmation(&mut self, action_id: &str, tool_name: &str) {
        self.pending_confirmation = Some(PendingConfirmation {
            action_id: action_id.to_string(),
            tool_name: tool_name.to_string(),
            requested_at: Utc::now(),
        });
        self.confirmation_result = None;
    }

    pub fn resolve_confirmation(&mut self, accepted: bool) {
        self.confirmation_result = Some(accepted);
        self.pending_confirmation = None;
    }

    pub fn has_pending_confirmation(&self) -> bool {
        self.pending_confirmation.is_some()
    }

    /// Estimated token footprint of the current message history.
    pub fn estimated_context_tokens(&self) -> usize {
        self.messages.iter().map(Message::approx_tokens).sum()
    }

    /// Budget gate: iteration and token ceilings, with a 5% token reserve.
    pub fn should_continue(&self) -> bool {
        if self.iteration >= self.max_iterations {
            return false;
        }
        if self.tokens_used as f64 >= self.max_tokens as f64 * 0.95 {
            return false;
        }
        true
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
