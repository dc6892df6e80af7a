// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::{Duration, Instant};

use lode_config::BreakerConfig;

/// Per-model circuit-breaker state.
///
/// Open iff the error count within the sliding window is at or above the
/// threshold.  The first evaluation after the window elapses resets both the
/// counter and the timestamp.
#[derive(Debug, Default)]
pub struct BreakerState {
    pub(crate) error_count: u32,
    pub(crate) last_error_at: Option<Instant>,
}

impl BreakerState {
    /// Reset the breaker when its window has elapsed.  Called before every
    /// evaluation and before every increment.
    fn expire(&mut self, cfg: &BreakerConfig) {
        if let Some(at) = self.last_error_at {
            if at.elapsed() > Duration::from_secs(cfg.window_secs) {
                self.error_count = 0;
                self.last_error_at = None;
            }
        }
    }

    pub fn record_error(&mut self, cfg: &BreakerConfig) {
        self.expire(cfg);
        self.error_count += 1;
        self.last_error_at = Some(Instant::now());
    }

    pub fn record_success(&mut self) {
        self.error_count = 0;
        self.last_error_at = None;
    }

    pub fn is_open(&mut self, cfg: &BreakerConfig) -> bool {
        self.expire(cfg);
        self.error_count >= cfg.threshold
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
