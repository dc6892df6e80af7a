// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use lode_trace::FailureTaxonomy;

// ─── Message types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// The content of a message.
///
/// - `Text` – simple string (most messages)
/// - `ToolCall` – the assistant requests a tool invocation
/// - `ToolResult` – the textual result of a tool call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    ToolCall {
        tool_call_id: String,
        function: FunctionCall,
    },
    ToolResult {
        tool_call_id: String,
        content: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded argument object
    pub arguments: String,
}

/// A single message in the conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn tool_call(id: impl Into<String>, name: impl Into<String>, args: &Value) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::ToolCall {
                tool_call_id: id.into(),
                function: FunctionCall {
                    name: name.into(),
                    arguments: args.to_string(),
                },
            },
        }
    }

    pub fn tool_result(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: MessageContent::ToolResult {
                tool_call_id: id.into(),
                content: content.into(),
            },
        }
    }

    /// Return the plain text of this message, if it is a text message.
    pub fn as_text(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Text(t) => Some(t),
            _ => None,
        }
    }

    /// Approximate token count used for context management.
    /// A 4-chars-per-token heuristic; a monotonic upper bound is all the
    /// budget gate needs.
    pub fn approx_tokens(&self) -> usize {
        let chars = match &self.content {
            MessageContent::Text(t) => t.len(),
            MessageContent::ToolCall { function, .. } => {
                function.name.len() + function.arguments.len()
            }
            MessageContent::ToolResult { content, .. } => content.len(),
        };
        (chars / 4).max(1)
    }
}

// ─── Tool schema & request ────────────────────────────────────────────────────

/// A tool definition provided to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object
    pub parameters: Value,
}

/// Sampling parameters forwarded to the model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

/// Request sent to a model client.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub system: Option<String>,
    pub tools: Vec<ToolSchema>,
    pub params: GenerationParams,
}

// ─── Completion ───────────────────────────────────────────────────────────────

/// One tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelToolCall {
    /// Provider-assigned id; may be empty, in which case the runtime
    /// synthesizes one and correlates by position.
    pub id: String,
    pub name: String,
    pub input: Value,
}

impl ModelToolCall {
    /// Guarantee a globally unique id, generating one when the provider
    /// omitted it.
    pub fn ensure_id(mut self) -> Self {
        if self.id.is_empty() {
            self.id = format!("tc_{}", Uuid::new_v4());
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
}

/// Token usage from one completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl Usage {
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

/// Unary completion result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub content: String,
    pub tool_calls: Vec<ModelToolCall>,
    pub stop_reason: StopReason,
    pub usage: Usage,
}

impl Completion {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_calls: Vec::new(),
            stop_reason: StopReason::EndTurn,
            usage: Usage::default(),
        }
    }

    /// The single tool call the runtime acts on this turn.
    ///
    /// Providers may return several; only index 0 is consumed (single-tool-
    /// per-step policy).
    pub fn first_tool_call(&self) -> Option<ModelToolCall> {
        self.tool_calls.first().cloned().map(ModelToolCall::ensure_id)
    }
}

// ─── Errors ───────────────────────────────────────────────────────────────────

/// Failure modes surfaced by `generate` / `stream`.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("api error: {0}")]
    Api(String),
    #[error("context overflow: {0}")]
    ContextOverflow(String),
}

impl ModelError {
    /// Map onto the failure taxonomy.
    pub fn taxonomy(&self) -> FailureTaxonomy {
        match self {
            Self::NetworkUnreachable(_) => FailureTaxonomy::NetworkUnreachable,
            Self::RateLimited(_) => FailureTaxonomy::ApiRateLimited,
            Self::Api(_) => FailureTaxonomy::ApiError,
            Self::ContextOverflow(_) => FailureTaxonomy::ContextOverflow,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
