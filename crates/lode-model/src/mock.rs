// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream;
use serde_json::Value;

use crate::client::{ModelClient, TextStream};
use crate::types::{
    Completion, CompletionRequest, ModelError, ModelToolCall, Role, StopReason, Usage,
};

/// Deterministic mock client for tests.  Echoes the last user message back
/// as the assistant response.
#[derive(Default)]
pub struct MockClient;

#[async_trait]
impl ModelClient for MockClient {
    fn name(&self) -> &str {
        "mock"
    }
    fn model_name(&self) -> &str {
        "mock-model"
    }

    async fn generate(&self, req: CompletionRequest) -> Result<Completion, ModelError> {
        let reply = req
            .messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, Role::User))
            .and_then(|m| m.as_text())
            .unwrap_or("[no input]")
            .to_string();
        Ok(Completion {
            content: format!("MOCK: {reply}"),
            tool_calls: Vec::new(),
            stop_reason: StopReason::EndTurn,
            usage: Usage {
                input_tokens: 10,
                output_tokens: 10,
            },
        })
    }

    async fn stream(&self, req: CompletionRequest) -> Result<TextStream, ModelError> {
        let completion = self.generate(req).await?;
        Ok(Box::pin(stream::iter(vec![Ok(completion.content)])))
    }
}

/// One pre-scripted model response.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// A plain text completion.
    Text(String),
    /// A completion carrying a single tool call.
    ToolCall {
        id: String,
        name: String,
        input: Value,
    },
    /// Fail with `ModelError::NetworkUnreachable`.
    NetworkUnreachable(String),
    /// Fail with `ModelError::RateLimited`.
    RateLimited(String),
    /// Fail with `ModelError::Api`.
    ApiError(String),
    /// Fail with `ModelError::ContextOverflow`.
    ContextOverflow(String),
}

impl ScriptedReply {
    fn into_result(self) -> Result<Completion, ModelError> {
        match self {
            Self::Text(t) => Ok(Completion {
                content: t,
                tool_calls: Vec::new(),
                stop_reason: StopReason::EndTurn,
                usage: Usage {
                    input_tokens: 5,
                    output_tokens: 5,
                },
            }),
            Self::ToolCall { id, name, input } => Ok(Completion {
                content: String::new(),
                tool_calls: vec![ModelToolCall { id, name, input }],
                stop_reason: StopReason::ToolUse,
                usage: Usage {
                    input_tokens: 10,
                    output_tokens: 10,
                },
            }),
            Self::NetworkUnreachable(m) => Err(ModelError::NetworkUnreachable(m)),
            Self::RateLimited(m) => Err(ModelError::RateLimited(m)),
            Self::ApiError(m) => Err(ModelError::Api(m)),
            Self::ContextOverflow(m) => Err(ModelError::ContextOverflow(m)),
        }
    }
}

/// A pre-scripted mock client.  Each call pops the next reply from the front
/// of the queue, so tests can specify exact sequences – including tool calls
/// and failures – without network access.
pub struct ScriptedMockClient {
    name: String,
    model: String,
    scripts: Mutex<VecDeque<ScriptedReply>>,
    /// When set, an exhausted queue replays its final script forever instead
    /// of falling back to the placeholder text.
    repeat_last: bool,
    calls: AtomicUsize,
    /// The last `CompletionRequest` seen.  Written on each call so tests can
    /// inspect what was sent.
    pub last_request: Mutex<Option<CompletionRequest>>,
}

impl ScriptedMockClient {
    pub fn new(scripts: Vec<ScriptedReply>) -> Self {
        Self {
            name: "scripted-mock".into(),
            model: "scripted-mock-model".into(),
            scripts: Mutex::new(scripts.into()),
            repeat_last: false,
            calls: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        }
    }

    /// Convenience: client that replies with a single text completion.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![ScriptedReply::Text(reply.into())]).repeating()
    }

    /// Convenience: a tool call on the first request, text on the second.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        input: Value,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            ScriptedReply::ToolCall {
                id: tool_id.into(),
                name: tool_name.into(),
                input,
            },
            ScriptedReply::Text(final_text.into()),
        ])
    }

    /// Convenience: client that always fails with a network error.
    pub fn always_network_error(msg: impl Into<String>) -> Self {
        Self::new(vec![ScriptedReply::NetworkUnreachable(msg.into())]).repeating()
    }

    /// Replay the final script forever once the queue empties.
    pub fn repeating(mut self) -> Self {
        self.repeat_last = true;
        self
    }

    /// Override the model identity (used when registering with a pipeline).
    pub fn with_model_name(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Number of completed `generate`/`stream` invocations.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_script(&self) -> ScriptedReply {
        let mut scripts = self.scripts.lock().unwrap();
        if scripts.len() == 1 && self.repeat_last {
            return scripts.front().cloned().unwrap();
        }
        scripts
            .pop_front()
            .unwrap_or_else(|| ScriptedReply::Text("[no more scripts]".into()))
    }
}

#[async_trait]
impl ModelClient for ScriptedMockClient {
    fn name(&self) -> &str {
        &self.name
    }
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, req: CompletionRequest) -> Result<Completion, ModelError> {
        *self.last_request.lock().unwrap() = Some(req);
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.next_script().into_result()
    }

    async fn stream(&self, req: CompletionRequest) -> Result<TextStream, ModelError> {
        *self.last_request.lock().unwrap() = Some(req);
        self.calls.fetch_add(1, Ordering::SeqCst);
        let completion = self.next_script().into_result()?;
        // Chunk the text so consumers exercise real multi-chunk streaming.
        let chunks: Vec<Result<String, ModelError>> = completion
            .content
            .as_bytes()
            .chunks(16)
            .map(|c| Ok(String::from_utf8_lossy(c).into_owned()))
            .collect();
        Ok(Box::pin(stream::iter(chunks)))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
