// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod failure;
mod observer;
mod store;

pub use failure::{
    classify, is_retryable, FailureSignal, FailureSource, FailureTaxonomy, RecoveryStrategy,
};
pub use observer::{FailureObserver, ObserverStats};
pub use store::{DecisionKind, DecisionTrace, SessionSummary, TraceStore};
