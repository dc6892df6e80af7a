// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use lode_config::FallbackConfig;
use lode_trace::{FailureSignal, FailureSource, FailureTaxonomy, TraceStore};

use crate::catalog::estimate_cost;
use crate::client::ModelClient;
use crate::router::{Constraints, Router, TaskClass};
use crate::types::{Completion, CompletionRequest};

const ATTEMPT_LOG_CAP: usize = 100;

/// Raised when the whole attempt chain has been exhausted.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("all model attempts failed: {last_error}")]
    AllAttemptsFailed {
        last_error: String,
        taxonomy: FailureTaxonomy,
    },
}

/// One recorded generation attempt.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationAttempt {
    pub model: String,
    pub task: TaskClass,
    pub success: bool,
    pub cost_usd: f64,
    pub latency_ms: f64,
    pub timestamp: DateTime<Utc>,
}

/// The router-fronted generation path with retry and degradation.
///
/// Builds an attempt chain from the routed primary model, the declared
/// fallback chain and the model of last resort, skips models whose breaker
/// is open, and walks the chain with a fixed delay between attempts.
pub struct GenerationPipeline {
    router: Arc<Router>,
    clients: HashMap<String, Arc<dyn ModelClient>>,
    config: FallbackConfig,
    store: Option<Arc<TraceStore>>,
    attempts: Mutex<VecDeque<GenerationAttempt>>,
}

impl GenerationPipeline {
    pub fn new(router: Arc<Router>, config: FallbackConfig) -> Self {
        Self {
            router,
            clients: HashMap::new(),
            config,
            store: None,
            attempts: Mutex::new(VecDeque::new()),
        }
    }

    /// Register the client that serves `model`.
    pub fn with_client(mut self, model: impl Into<String>, client: Arc<dyn ModelClient>) -> Self {
        self.clients.insert(model.into(), client);
        self
    }

    /// Forward failed attempts to the decision-trace store.
    pub fn with_trace_store(mut self, store: Arc<TraceStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// The ordered, deduplicated attempt chain for a routed primary model,
    /// capped at `max_retries + 1` entries.
    pub fn attempt_chain(&self, primary: &str) -> Vec<String> {
        let mut chain: Vec<String> = Vec::new();
        let mut push = |m: &str, chain: &mut Vec<String>| {
            if !m.is_empty() && !chain.iter().any(|c| c == m) {
                chain.push(m.to_string());
            }
        };
        push(primary, &mut chain);
        for m in &self.config.fallback_chain {
            push(m, &mut chain);
        }
        if self.config.use_default_model {
            push(&self.config.default_model, &mut chain);
        }
        chain.truncate(self.config.max_retries + 1);
        chain
    }

    /// Generate a completion, degrading through the attempt chain on failure.
    pub async fn generate(
        &self,
        task: TaskClass,
        constraints: Option<&Constraints>,
        req: CompletionRequest,
        session_id: Option<&str>,
    ) -> Result<Completion, PipelineError> {
        let primary = self.router.select(task, constraints).model;
        let chain = self.attempt_chain(&primary);

        let mut last_error: Option<(String, FailureTaxonomy)> = None;

        for (attempt, model) in chain.iter().enumerate() {
            if self.router.breaker_open(model) {
                warn!(model = %model, "circuit breaker open, skipping");
                continue;
            }
            let Some(client) = self.clients.get(model) else {
                warn!(model = %model, "no client registered, skipping");
                continue;
            };

            let started = Instant::now();
            match client.generate(req.clone()).await {
                Ok(completion) => {
                    let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
                    let cost = crate::catalog::lookup(model)
                        .map(|e| {
                            estimate_cost(
                                &e,
                                completion.usage.input_tokens,
                                completion.usage.output_tokens,
                            )
                        })
                        .unwrap_or(0.0);
                    self.record_attempt(model, task, true, cost, latency_ms);
                    self.router.record_model_success(model);
                    info!(model = %model, attempt = attempt + 1, "generation succeeded");
                    return Ok(completion);
                }
                Err(e) => {
                    let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
                    warn!(model = %model, error = %e, "generation attempt failed");
                    self.router.record_model_error(model);
                    self.record_attempt(model, task, false, 0.0, latency_ms);
                    if let Some(store) = &self.store {
                        store.record_failure(FailureSignal::new(
                            FailureSource::System,
                            e.taxonomy(),
                            format!("{model}: {e}"),
                            session_id,
                        ));
                    }
                    last_error = Some((e.to_string(), e.taxonomy()));
                    if attempt + 1 < chain.len() {
                        tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms))
                            .await;
                    }
                }
            }
        }

        let (last_error, taxonomy) = last_error.unwrap_or_else(|| {
            (
                "no model client was available to attempt".to_string(),
                FailureTaxonomy::ApiError,
            )
        });
        Err(PipelineError::AllAttemptsFailed {
            last_error,
            taxonomy,
        })
    }

    fn record_attempt(
        &self,
        model: &str,
        task: TaskClass,
        success: bool,
        cost_usd: f64,
        latency_ms: f64,
    ) {
        let mut attempts = self.attempts.lock().unwrap();
        attempts.push_back(GenerationAttempt {
            model: model.to_string(),
            task,
            success,
            cost_usd,
            latency_ms,
            timestamp: Utc::now(),
        });
        while attempts.len() > ATTEMPT_LOG_CAP {
            attempts.pop_front();
        }
    }

    /// The bounded attempt log, oldest first.
    pub fn attempts(&self) -> Vec<GenerationAttempt> {
        self.attempts.lock().unwrap().iter().cloned().collect()
    }

    /// The first usable client along the attempt chain for `task`: routed
    /// primary first, skipping open breakers and unregistered models.
    /// Used for streaming calls, which bypass the unary retry walk.
    pub fn client_for(&self, task: TaskClass) -> Option<Arc<dyn ModelClient>> {
        let primary = self.router.select(task, None).model;
        for model in self.attempt_chain(&primary) {
            if self.router.breaker_open(&model) {
                continue;
            }
            if let Some(client) = self.clients.get(&model) {
                return Some(Arc::clone(client));
            }
        }
        None
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
