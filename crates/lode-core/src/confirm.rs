// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;
use tracing::debug;

/// Rendezvous between a suspended tool call and the operator's
/// `confirm(action_id, accepted)` answer.
///
/// The dispatcher subscribes before emitting `ConfirmRequired`; the operator
/// resolves through the agent handle.  Waiters for ids that never resolve
/// are dropped with the gate.
#[derive(Default)]
pub struct ConfirmationGate {
    pending: Mutex<HashMap<String, oneshot::Sender<bool>>>,
}

impl ConfirmationGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in an action id.  A second subscription for the
    /// same id replaces the first (its receiver resolves as cancelled).
    pub fn subscribe(&self, action_id: &str) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(action_id.to_string(), tx);
        rx
    }

    /// Deliver the operator's decision.  Returns `false` when nothing was
    /// waiting on the id.
    pub fn resolve(&self, action_id: &str, accepted: bool) -> bool {
        match self.pending.lock().unwrap().remove(action_id) {
            Some(tx) => {
                debug!(action_id, accepted, "confirmation resolved");
                tx.send(accepted).is_ok()
            }
            None => false,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
