//! Request orchestration.
//!
//! The single path every request takes: admission gate → embedding →
//! classification → weighting (semantic cache first, meta control on a
//! miss) → routing → pool checkout → generation → optional refinement →
//! audit. Every collaborator is injected at construction; the only
//! process-wide state is the metrics registry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use uuid::Uuid;

use crate::audit::{AuditRecord, AuditSink};
use crate::cache::SemanticCache;
use crate::cascade::CascadeOracle;
use crate::classify::Classifier;
use crate::control::{ControlContext, MetaControl};
use crate::embedding::EmbeddingService;
use crate::error::{MindgateError, Result};
use crate::health::HealthMonitor;
use crate::metrics::Metrics;
use crate::pool::{GenerationParams, ModelPool};
use crate::refine::{refine, should_refine};
use crate::request::{InferenceRequest, RouteDecision, Weights};
use crate::route::Router;
use crate::settings::Settings;

/// Upper bound on one generation pass when the request carries no
/// deadline of its own.
const GENERATE_DEADLINE: Duration = Duration::from_secs(30);

/// What the surface returns to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct ResponsePayload {
    pub request_id: Uuid,
    pub text: String,
    pub decision: RouteDecision,
    pub tier: Option<u8>,
    pub model: String,
    pub alpha: f64,
    pub beta: f64,
    pub refined: bool,
    pub cache_hit: bool,
    pub latency_ms: u64,
    pub degraded: bool,
}

pub struct Orchestrator {
    settings: Arc<Settings>,
    embeddings: Arc<EmbeddingService>,
    classifier: Arc<Classifier>,
    cache: Arc<SemanticCache>,
    control: Arc<MetaControl>,
    router: Router,
    pool: Arc<ModelPool>,
    health: Arc<HealthMonitor>,
    metrics: Arc<Metrics>,
    audit: Arc<dyn AuditSink>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: Arc<Settings>,
        embeddings: Arc<EmbeddingService>,
        classifier: Arc<Classifier>,
        cache: Arc<SemanticCache>,
        control: Arc<MetaControl>,
        pool: Arc<ModelPool>,
        health: Arc<HealthMonitor>,
        metrics: Arc<Metrics>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let router = Router::new(
            settings.router.clone(),
            CascadeOracle::new(&settings.cascade),
        );
        Self {
            settings,
            embeddings,
            classifier,
            cache,
            control,
            router,
            pool,
            health,
            metrics,
            audit,
        }
    }

    pub fn pool(&self) -> &Arc<ModelPool> {
        &self.pool
    }

    /// Drive one request end to end.
    pub async fn respond(&self, request: InferenceRequest) -> Result<ResponsePayload> {
        let started = Instant::now();
        let request_id = request.id;

        if request.text.trim().is_empty() {
            return Err(MindgateError::InvalidRequest(
                "request text is empty or whitespace".into(),
            ));
        }
        if request.is_cancelled() {
            return Err(MindgateError::Cancelled);
        }
        let deadline = request.deadline.unwrap_or(GENERATE_DEADLINE);

        // Advisory health gate; in-flight work is never touched.
        self.health.admit()?;

        let embedding = self.embeddings.embed(&request.text).await;
        let scores = self.classifier.classify(&request.text, &embedding);

        // A degraded embedder produces the zero vector for every text;
        // those keys would all collide, so the cache sits out.
        let cacheable = !self.embeddings.is_degraded();
        let cached = if cacheable { self.cache.get(&embedding) } else { None };
        self.metrics.record_cache_lookup(cached.is_some());

        let weights = match &cached {
            Some(hit) => hit.weights,
            None => {
                let ctx =
                    ControlContext::from_embedding(&embedding, request.text.chars().count());
                self.control.weights(&scores, &ctx)
            }
        };

        let decision = self.router.route(&request, &scores, &weights);
        if cached.is_none() && cacheable {
            self.cache.set(&embedding, weights, Some(decision));
        }

        tracing::debug!(
            request_id = %request_id,
            %decision,
            alpha = weights.alpha,
            beta = weights.beta,
            hard = scores.hard(),
            soft = scores.soft(),
            web = scores.web_query(),
            "request routed"
        );

        let wanted = self.router.model_for(decision, &self.settings.cascade);
        let lease = match request.deadline {
            Some(d) => self.pool.get_with_deadline(&wanted, d).await?,
            None => self.pool.get(&wanted).await?,
        };
        let served = lease.model_name().to_string();

        let params = GenerationParams::default();
        let prompt = compose_prompt(&request.text, &weights, decision);

        let generated = tokio::select! {
            _ = wait_cancelled(&request) => {
                // Cooperative: no side effects beyond the release.
                self.pool.release(&served);
                return Err(MindgateError::Cancelled);
            }
            result = tokio::time::timeout(deadline, lease.generate(&prompt, &params)) => {
                match result {
                    Ok(Ok(text)) => text,
                    Ok(Err(e)) => {
                        self.pool.release(&served);
                        tracing::warn!(request_id = %request_id, error = %e, "generation failed");
                        return Err(e);
                    }
                    Err(_) => {
                        // Forced release on deadline expiry.
                        self.pool.release(&served);
                        return Err(MindgateError::Timeout(deadline));
                    }
                }
            }
        };

        if request.is_cancelled() {
            self.pool.release(&served);
            return Err(MindgateError::Cancelled);
        }

        let (text, refined) =
            if should_refine(&self.settings.refiner, decision, &weights, &request.text) {
                let lease = &lease;
                let params = &params;
                let outcome = refine(
                    &self.settings.refiner,
                    &request.text,
                    generated,
                    move |prompt| async move {
                        match tokio::time::timeout(
                            deadline,
                            lease.generate(&prompt, params),
                        )
                        .await
                        {
                            Ok(result) => result,
                            Err(_) => Err(MindgateError::Timeout(deadline)),
                        }
                    },
                )
                .await;
                tracing::debug!(
                    request_id = %request_id,
                    iterations = outcome.iterations,
                    converged = outcome.converged,
                    quality = outcome.quality,
                    "refinement finished"
                );
                (outcome.text, outcome.iterations > 0)
            } else {
                (generated, false)
            };

        self.pool.release(&served);
        self.control.observe_labelled();

        let degraded = self.health.is_degraded() || self.embeddings.is_degraded();
        let latency = started.elapsed();
        self.metrics.observe_route(&decision.to_string(), latency);
        self.audit.emit(AuditRecord {
            request_id,
            decision: decision.to_string(),
            tier: decision.cascade_tier().map(|t| t.number()),
            model_name: served.clone(),
            latency_ms: latency.as_millis() as u64,
            degraded,
            at: chrono::Utc::now(),
        });

        Ok(ResponsePayload {
            request_id,
            text,
            decision,
            tier: decision.cascade_tier().map(|t| t.number()),
            model: served,
            alpha: weights.alpha,
            beta: weights.beta,
            refined,
            cache_hit: cached.is_some(),
            latency_ms: latency.as_millis() as u64,
            degraded,
        })
    }
}

/// Resolves when the request's cancellation signal flips to true; pends
/// forever for requests without one, or when the sender side goes away
/// without cancelling.
async fn wait_cancelled(request: &InferenceRequest) {
    let Some(rx) = &request.cancelled else {
        return std::future::pending::<()>().await;
    };
    let mut rx = rx.clone();
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return std::future::pending::<()>().await;
        }
    }
}

/// Tone modulation: the weight pair picks the generation preamble.
fn compose_prompt(text: &str, weights: &Weights, decision: RouteDecision) -> String {
    let preamble = if weights.alpha >= 0.9 {
        "Answer precisely and technically, with concrete steps."
    } else if weights.beta >= 0.9 {
        "Respond with warmth first; acknowledge the feeling before any advice."
    } else {
        "Balance clear technical content with a considerate tone."
    };
    match decision {
        RouteDecision::WebSynthesis => {
            format!("{preamble} Synthesise what is known, flagging anything time-sensitive.\n\n{text}")
        }
        _ => format!("{preamble}\n\n{text}"),
    }
}
