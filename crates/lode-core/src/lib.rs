// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod agent;
mod confirm;
mod context;
mod dispatcher;
mod events;
mod policy;
mod sse;
#[cfg(test)]
mod tests;

pub use agent::{Agent, AgentDeps, AgentHandle, SessionParams};
pub use confirm::ConfirmationGate;
pub use context::{
    AgentContext, ContextError, PendingConfirmation, ToolCallRecord, ToolCallState,
};
pub use dispatcher::{BatchMode, CallSpec, DispatchOutcome, DispatchResult, ToolDispatcher};
pub use events::{
    event_channel, DoneStatus, Event, EventReceiver, EventSender, ToolCallStatus,
    ToolResultStatus, DEFAULT_EVENT_CAPACITY,
};
pub use policy::{
    AgentAction, BasicPolicy, DeepResearchPolicy, FinancialResearchPolicy, LoopError,
    LoopPolicy, PptPolicy, ResearchPolicy, TurnIo,
};
pub use sse::{decode as sse_decode, encode as sse_encode, SseError};
