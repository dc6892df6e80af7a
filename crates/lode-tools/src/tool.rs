// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::risk::{OperationCategory, RiskLevel};

/// A single tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Globally unique call id (forwarded from the model or synthesized).
    pub id: String,
    pub name: String,
    /// Parsed JSON arguments
    pub args: Value,
}

/// Static description of a tool: what it is called, what it takes, and how
/// dangerous it is.  Two tools with the same name may not coexist;
/// re-registration is idempotent only when the specs are equal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema of the argument object
    pub parameters: Value,
    #[serde(default)]
    pub risk: RiskLevel,
    #[serde(default)]
    pub categories: BTreeSet<OperationCategory>,
    #[serde(default)]
    pub requires_confirmation: bool,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            risk: RiskLevel::None,
            categories: BTreeSet::new(),
            requires_confirmation: false,
        }
    }

    pub fn with_risk(mut self, risk: RiskLevel) -> Self {
        self.risk = risk;
        self
    }

    pub fn with_category(mut self, category: OperationCategory) -> Self {
        self.categories.insert(category);
        self
    }

    pub fn confirmed(mut self) -> Self {
        self.requires_confirmation = true;
        self
    }
}

/// The result of executing a tool.
///
/// `exit_code` and `stderr` feed failure classification: zero is success,
/// anything else is a failure with the stderr text as the evidence.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub call_id: String,
    pub content: String,
    pub is_error: bool,
    pub exit_code: i32,
    pub stderr: String,
}

impl ToolOutput {
    /// Successful plain-text result.
    pub fn ok(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: content.into(),
            is_error: false,
            exit_code: 0,
            stderr: String::new(),
        }
    }

    /// Error result with exit code 1.
    pub fn err(call_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::err_with_code(call_id, msg, 1)
    }

    /// Error result with an explicit exit code.
    pub fn err_with_code(call_id: impl Into<String>, msg: impl Into<String>, exit_code: i32) -> Self {
        let text = msg.into();
        Self {
            call_id: call_id.into(),
            content: text.clone(),
            is_error: true,
            exit_code,
            stderr: text,
        }
    }
}

/// Validation failure for tool arguments.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid tool args: {0}")]
    InvalidArgs(String),
}

/// Trait every tool must implement.
///
/// `validate` is side-effect-free; the default implementation checks the
/// args against the spec's parameter schema.  `execute` wraps failures in
/// [`ToolOutput::err`] rather than returning `Err` – a failing tool is data,
/// not a crashed runtime.
#[async_trait]
pub trait Tool: Send + Sync + std::fmt::Debug {
    fn spec(&self) -> &ToolSpec;

    /// Reject args that do not conform to the parameter schema.
    fn validate(&self, args: &Value) -> Result<(), ToolError> {
        validate_args(&self.spec().parameters, args)
    }

    /// Execute the tool.  Errors should be wrapped in [`ToolOutput::err`].
    async fn execute(&self, call: &ToolCall) -> ToolOutput;
}

/// Structural JSON-Schema validation: required fields, declared property
/// types, and `additionalProperties: false` enforcement.
pub fn validate_args(schema: &Value, args: &Value) -> Result<(), ToolError> {
    let Some(obj) = args.as_object() else {
        return Err(ToolError::InvalidArgs("arguments must be an object".into()));
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for field in required.iter().filter_map(Value::as_str) {
            if !obj.contains_key(field) {
                return Err(ToolError::InvalidArgs(format!(
                    "missing required parameter: {field}"
                )));
            }
        }
    }

    let properties = schema.get("properties").and_then(Value::as_object);
    if let Some(props) = properties {
        for (key, value) in obj {
            match props.get(key) {
                Some(prop_schema) => {
                    if let Some(expected) = prop_schema.get("type").and_then(Value::as_str) {
                        if !json_type_matches(expected, value) {
                            return Err(ToolError::InvalidArgs(format!(
                                "parameter `{key}` must be of type {expected}"
                            )));
                        }
                    }
                }
                None => {
                    let closed = schema
                        .get("additionalProperties")
                        .and_then(Value::as_bool)
                        .map(|b| !b)
                        .unwrap_or(false);
                    if closed {
                        return Err(ToolError::InvalidArgs(format!(
                            "unknown parameter: {key}"
                        )));
                    }
                }
            }
        }
    }

    Ok(())
}

fn json_type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
