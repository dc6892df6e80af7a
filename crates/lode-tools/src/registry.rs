// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use serde_json::Value;
use thiserror::Error;
use tracing::info;

use crate::tool::Tool;

/// A tool schema as handed to the model – mirrors the model crate's shape
/// but keeps this crate independent from it.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("tool `{name}` is already registered with a different spec")]
    DuplicateName { name: String },
    #[error("tool `{name}` not found; available: {}", .available.join(", "))]
    NotFound {
        name: String,
        available: Vec<String>,
    },
    #[error("tool `{name}` is registered but not allowed in the current action space")]
    NotAllowed { name: String },
}

/// Central registry holding all available tools.
///
/// Read-mostly after startup; the locks exist so one registry can serve
/// concurrent runs.  Supports action-space pruning: an allowed subset makes
/// `get` fail for everything outside it without touching registration.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
    allowed: RwLock<Option<BTreeSet<String>>>,
    usage: RwLock<HashMap<String, u64>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            allowed: RwLock::new(None),
            usage: RwLock::new(HashMap::new()),
        }
    }

    /// Register a tool.  Re-registering an identical spec is a no-op; a
    /// different spec under the same name is rejected.
    pub fn register(&self, tool: impl Tool + 'static) -> Result<(), RegistryError> {
        self.register_arc(Arc::new(tool))
    }

    pub fn register_arc(&self, tool: Arc<dyn Tool>) -> Result<(), RegistryError> {
        let name = tool.spec().name.clone();
        let mut tools = self.tools.write().unwrap();
        if let Some(existing) = tools.get(&name) {
            if existing.spec() == tool.spec() {
                return Ok(());
            }
            return Err(RegistryError::DuplicateName { name });
        }
        info!(tool = %name, "registered tool");
        tools.insert(name, tool);
        Ok(())
    }

    /// Resolve a tool by name, honouring the allowed subset.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Tool>, RegistryError> {
        let tools = self.tools.read().unwrap();
        let Some(tool) = tools.get(name) else {
            let mut available: Vec<String> = tools.keys().cloned().collect();
            available.sort();
            return Err(RegistryError::NotFound {
                name: name.to_string(),
                available,
            });
        };
        if let Some(allowed) = self.allowed.read().unwrap().as_ref() {
            if !allowed.contains(name) {
                return Err(RegistryError::NotAllowed {
                    name: name.to_string(),
                });
            }
        }
        Ok(Arc::clone(tool))
    }

    /// Restrict the action space to `names`.  Unknown names are ignored with
    /// a log line; registration itself is never changed.
    pub fn allow_only<I, S>(&self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tools = self.tools.read().unwrap();
        let (valid, unknown): (BTreeSet<String>, Vec<String>) = {
            let (valid, unknown): (Vec<String>, Vec<String>) = names
                .into_iter()
                .map(Into::into)
                .partition(|n| tools.contains_key(n));
            (valid.into_iter().collect(), unknown)
        };
        if !unknown.is_empty() {
            info!(?unknown, "ignoring unknown tools in allowed subset");
        }
        *self.allowed.write().unwrap() = Some(valid);
    }

    /// Clear the allowed subset; every registered tool becomes visible again.
    pub fn allow_all(&self) {
        *self.allowed.write().unwrap() = None;
    }

    pub fn allowed_subset(&self) -> Option<BTreeSet<String>> {
        self.allowed.read().unwrap().clone()
    }

    /// Schemas consumable by the model, honouring pruning, sorted by name.
    /// An explicit `subset` narrows the result further.
    pub fn as_model_tools(&self, subset: Option<&[String]>) -> Vec<ToolSchema> {
        let tools = self.tools.read().unwrap();
        let allowed = self.allowed.read().unwrap();
        let mut schemas: Vec<ToolSchema> = tools
            .values()
            .filter(|t| {
                allowed
                    .as_ref()
                    .map_or(true, |a| a.contains(&t.spec().name))
            })
            .filter(|t| subset.map_or(true, |s| s.contains(&t.spec().name)))
            .map(|t| {
                let spec = t.spec();
                ToolSchema {
                    name: spec.name.clone(),
                    description: spec.description.clone(),
                    parameters: spec.parameters.clone(),
                }
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// All registered names, sorted, ignoring pruning.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Names visible under the current action space, sorted.
    pub fn active_names(&self) -> Vec<String> {
        self.as_model_tools(None).into_iter().map(|s| s.name).collect()
    }

    /// Tools filtered by their confirmation requirement.
    pub fn tools_with_confirmation(&self, requires: bool) -> Vec<Arc<dyn Tool>> {
        self.tools
            .read()
            .unwrap()
            .values()
            .filter(|t| t.spec().requires_confirmation == requires)
            .cloned()
            .collect()
    }

    /// Record one invocation of `name` for usage statistics.
    pub fn note_invocation(&self, name: &str) {
        *self
            .usage
            .write()
            .unwrap()
            .entry(name.to_string())
            .or_insert(0) += 1;
    }

    pub fn usage_stats(&self) -> HashMap<String, u64> {
        self.usage.read().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.tools.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
