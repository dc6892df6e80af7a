// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Thin SSE codec for [`Event`]: `event: <kind>\ndata: <json>\n\n`.

use serde_json::Value;
use thiserror::Error;

use crate::events::Event;

#[derive(Debug, Error)]
pub enum SseError {
    #[error("malformed SSE frame: {0}")]
    Malformed(&'static str),
    #[error("invalid SSE payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode one event as an SSE frame.  `data` carries the non-kind fields.
pub fn encode(event: &Event) -> String {
    let value = serde_json::to_value(event).expect("events always serialize");
    let data = value.get("data").cloned().unwrap_or(Value::Null);
    format!("event: {}\ndata: {}\n\n", event.kind(), data)
}

/// Decode one SSE frame back into an event.  Inverse of [`encode`].
pub fn decode(frame: &str) -> Result<Event, SseError> {
    let mut kind = None;
    let mut data = None;
    for line in frame.lines() {
        if let Some(rest) = line.strip_prefix("event: ") {
            kind = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("data: ") {
            data = Some(rest.trim().to_string());
        }
    }
    let kind = kind.ok_or(SseError::Malformed("missing event line"))?;
    let data = data.ok_or(SseError::Malformed("missing data line"))?;
    let payload: Value = serde_json::from_str(&data)?;
    let tagged = serde_json::json!({ "event": kind, "data": payload });
    Ok(serde_json::from_value(tagged)?)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
