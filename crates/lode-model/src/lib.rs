// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod breaker;
mod catalog;
mod client;
mod fallback;
mod mock;
mod router;
mod types;

pub use breaker::BreakerState;
pub use catalog::{estimate_cost, lookup, static_catalog, Capability, CatalogEntry};
pub use client::{ModelClient, TextStream};
pub use fallback::{GenerationAttempt, GenerationPipeline, PipelineError};
pub use mock::{MockClient, ScriptedMockClient, ScriptedReply};
pub use router::{Constraints, Router, RoutingContext, Selection, TaskClass};
pub use types::{
    Completion, CompletionRequest, FunctionCall, GenerationParams, Message, MessageContent,
    ModelError, ModelToolCall, Role, StopReason, ToolSchema, Usage,
};
