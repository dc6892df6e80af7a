// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// Default bound of the event channel.  The producer blocks when the
/// consumer falls this far behind; unbounded buffering is forbidden.
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

pub type EventSender = mpsc::Sender<Event>;
pub type EventReceiver = mpsc::Receiver<Event>;

/// Create the bounded event channel for one run.  Exactly one consumer
/// reads it; `Done` is the last event and the sender side is dropped right
/// after.
pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    mpsc::channel(capacity.max(1))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Pending,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolResultStatus {
    Success,
    Error,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoneStatus {
    Completed,
    Stopped,
    Aborted,
}

/// Events emitted to the consumer during a run.
///
/// The serialized form is adjacently tagged (`event` + `data`), which is
/// also the wire shape of the SSE encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum Event {
    /// A chunk of model reasoning; many may arrive per turn.
    Thinking { text: String },
    /// A tool call changed lifecycle state (pending, then running).
    ToolCall {
        call_id: String,
        tool_name: String,
        args: Value,
        status: ToolCallStatus,
    },
    /// Terminal outcome of a tool call.
    ToolResult {
        call_id: String,
        status: ToolResultStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        /// `"k/N"` annotation in streaming batch mode.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        progress: Option<String>,
    },
    /// A chunk of the streamed final answer.
    Content { text: String },
    /// The run is suspended awaiting an operator decision.
    ConfirmRequired {
        action_id: String,
        tool_name: String,
        args: Value,
        description: String,
    },
    /// Operator-readable one-liner.
    Status { text: String },
    Error {
        kind: String,
        message: String,
        recoverable: bool,
    },
    /// Always the last event of a run.
    Done {
        status: DoneStatus,
        iterations: u32,
        tokens_used: usize,
        message_id: String,
    },
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Thinking { .. } => "thinking",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::Content { .. } => "content",
            Self::ConfirmRequired { .. } => "confirm_required",
            Self::Status { .. } => "status",
            Self::Error { .. } => "error",
            Self::Done { .. } => "done",
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
