// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::{catalog, Completion, CompletionRequest, ModelError};

/// A finite, non-restartable sequence of text chunks.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, ModelError>> + Send>>;

/// Capability over a language model: unary and streaming text generation
/// with optional tool-call output.
///
/// Provider wire formats are entirely the implementer's concern; the runtime
/// only ever sees [`Completion`] values and chunk streams.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Human-readable client name for status display.
    fn name(&self) -> &str;

    /// Model identifier as reported to users and the catalog.
    fn model_name(&self) -> &str;

    /// Send a completion request and return the full result.
    async fn generate(&self, req: CompletionRequest) -> Result<Completion, ModelError>;

    /// Send a completion request and return a lazy sequence of text chunks.
    async fn stream(&self, req: CompletionRequest) -> Result<TextStream, ModelError>;

    /// Context window size for this model, from the bundled catalog.
    /// Returns `None` if the model is unknown.
    fn catalog_context_window(&self) -> Option<u32> {
        catalog::lookup(self.model_name()).map(|e| e.context_window)
    }
}
