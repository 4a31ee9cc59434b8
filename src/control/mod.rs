//! Meta control: mixing-weight policy.
//!
//! Produces the (α, β) pair that biases technical generation against
//! empathic modulation. The policy is phase-staged: thresholded rules at
//! bootstrap, a small projection once enough labelled observations have
//! accumulated, and a sequence-aware variant after that. The active
//! implementation sits behind a read–write lock so in-flight requests
//! observe one consistent policy for the duration of a call.
//!
//! Only the observation counter is persisted; it survives restarts and
//! tolerates a missing or corrupt file by starting cold.

use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::request::{
    AXIS_CREATIVE, AXIS_PROGRAMMING, AXIS_REASONING, ScoreVector, Weights,
};

/// Labelled observations required before each promotion.
pub const PROMOTE_TO_PROJECTION_AT: u64 = 200;
pub const PROMOTE_TO_SEQUENCE_AT: u64 = 2_000;

/// Context the policy may consult beyond the scores.
#[derive(Debug, Clone, Default)]
pub struct ControlContext {
    /// Reduced context embedding (a prefix of the full vector).
    pub context_embedding: Vec<f32>,
    pub text_len: usize,
}

impl ControlContext {
    /// Reduce a full embedding to the slice the policies consume.
    pub fn from_embedding(embedding: &[f32], text_len: usize) -> Self {
        let keep = embedding.len().min(32);
        Self { context_embedding: embedding[..keep].to_vec(), text_len }
    }
}

/// Policy lifecycle stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Bootstrap,
    Projection,
    Sequence,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bootstrap => write!(f, "bootstrap"),
            Self::Projection => write!(f, "projection"),
            Self::Sequence => write!(f, "sequence"),
        }
    }
}

/// One weight policy implementation behind the swap lock.
pub trait WeightPolicy: Send + Sync {
    fn phase(&self) -> Phase;
    fn weights(&self, scores: &ScoreVector, ctx: &ControlContext) -> Weights;
}

// ---------------------------------------------------------------------------
// Phase 1: thresholded rules
// ---------------------------------------------------------------------------

pub struct RulePolicy;

impl WeightPolicy for RulePolicy {
    fn phase(&self) -> Phase {
        Phase::Bootstrap
    }

    fn weights(&self, scores: &ScoreVector, _ctx: &ControlContext) -> Weights {
        let hard = scores.hard();
        let soft = scores.soft();
        if hard > 0.8 && soft < 0.3 {
            Weights::from_alpha(0.95)
        } else if soft > 0.7 && hard < 0.4 {
            Weights::from_alpha(0.20)
        } else {
            Weights::from_alpha(0.60)
        }
    }
}

// ---------------------------------------------------------------------------
// Phase 2: projection
// ---------------------------------------------------------------------------

/// Linear projection over scores plus the reduced context embedding. The
/// coefficients reproduce the bootstrap rule table in expectation; training
/// is out of scope, so they are fixed.
pub struct ProjectionPolicy {
    hard_w: f64,
    soft_w: f64,
    programming_w: f64,
    reasoning_w: f64,
    creative_w: f64,
    ctx_w: f64,
    bias: f64,
}

impl Default for ProjectionPolicy {
    fn default() -> Self {
        Self {
            hard_w: 2.4,
            soft_w: -2.6,
            programming_w: 0.8,
            reasoning_w: 0.5,
            creative_w: -0.6,
            ctx_w: 0.2,
            bias: 0.4,
        }
    }
}

impl ProjectionPolicy {
    fn alpha_logit(&self, scores: &ScoreVector, ctx: &ControlContext) -> f64 {
        let ctx_mean = if ctx.context_embedding.is_empty() {
            0.0
        } else {
            f64::from(
                ctx.context_embedding.iter().sum::<f32>()
                    / ctx.context_embedding.len() as f32,
            )
        };
        self.bias
            + self.hard_w * scores.hard()
            + self.soft_w * scores.soft()
            + self.programming_w * scores.get(AXIS_PROGRAMMING)
            + self.reasoning_w * scores.get(AXIS_REASONING)
            + self.creative_w * scores.get(AXIS_CREATIVE)
            + self.ctx_w * ctx_mean
    }
}

impl WeightPolicy for ProjectionPolicy {
    fn phase(&self) -> Phase {
        Phase::Projection
    }

    fn weights(&self, scores: &ScoreVector, ctx: &ControlContext) -> Weights {
        let logit = self.alpha_logit(scores, ctx);
        let alpha = 1.0 / (1.0 + (-logit).exp());
        Weights::from_alpha(alpha)
    }
}

// ---------------------------------------------------------------------------
// Phase 3: sequence-aware projection
// ---------------------------------------------------------------------------

/// Sequence-model stage. The projection output is tempered by a length
/// prior: longer contexts drift toward the technical side more slowly.
/// Still a pure function of its inputs.
pub struct SequencePolicy {
    inner: ProjectionPolicy,
}

impl Default for SequencePolicy {
    fn default() -> Self {
        Self { inner: ProjectionPolicy::default() }
    }
}

impl WeightPolicy for SequencePolicy {
    fn phase(&self) -> Phase {
        Phase::Sequence
    }

    fn weights(&self, scores: &ScoreVector, ctx: &ControlContext) -> Weights {
        let base = self.inner.weights(scores, ctx).alpha;
        let damping = 1.0 / (1.0 + (ctx.text_len as f64 / 2_000.0));
        let alpha = 0.5 + (base - 0.5) * (0.6 + 0.4 * damping);
        Weights::from_alpha(alpha)
    }
}

// ---------------------------------------------------------------------------
// Meta control
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct PersistedCounter {
    observations: u64,
}

pub struct MetaControl {
    active: RwLock<Arc<dyn WeightPolicy>>,
    observations: AtomicU64,
    state_path: Option<PathBuf>,
}

impl MetaControl {
    pub fn new(state_path: Option<PathBuf>) -> Self {
        let observations = state_path
            .as_deref()
            .and_then(load_counter)
            .unwrap_or(0);
        let control = Self {
            active: RwLock::new(policy_for(observations)),
            observations: AtomicU64::new(observations),
            state_path,
        };
        tracing::info!(observations, phase = %control.phase(), "meta control initialised");
        control
    }

    /// Compute mixing weights. The read guard is held for the duration of
    /// the call so a concurrent promotion cannot swap the policy mid-way.
    pub fn weights(&self, scores: &ScoreVector, ctx: &ControlContext) -> Weights {
        let guard = self.active.read().unwrap_or_else(|p| p.into_inner());
        guard.weights(scores, ctx)
    }

    pub fn phase(&self) -> Phase {
        self.active.read().unwrap_or_else(|p| p.into_inner()).phase()
    }

    pub fn observations(&self) -> u64 {
        self.observations.load(Ordering::Relaxed)
    }

    /// Record one labelled observation; promotes the policy when a counter
    /// threshold is crossed.
    pub fn observe_labelled(&self) {
        let count = self.observations.fetch_add(1, Ordering::Relaxed) + 1;
        let target = phase_for(count);
        if self.phase() != target {
            let mut guard = self.active.write().unwrap_or_else(|p| p.into_inner());
            // A racing caller may already have promoted.
            if guard.phase() != target {
                tracing::info!(observations = count, phase = %target, "meta control promoted");
                *guard = policy_for(count);
            }
        }
        if count % 32 == 0 {
            self.persist();
        }
    }

    /// Write the counter file; called periodically and on shutdown.
    pub fn persist(&self) {
        let Some(path) = self.state_path.as_deref() else {
            return;
        };
        let state = PersistedCounter { observations: self.observations() };
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string(&state) {
            Ok(json) => {
                if let Err(e) = std::fs::write(path, json) {
                    tracing::warn!(error = %e, "failed to persist meta-control counter");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to encode meta-control counter"),
        }
    }
}

fn phase_for(observations: u64) -> Phase {
    if observations >= PROMOTE_TO_SEQUENCE_AT {
        Phase::Sequence
    } else if observations >= PROMOTE_TO_PROJECTION_AT {
        Phase::Projection
    } else {
        Phase::Bootstrap
    }
}

fn policy_for(observations: u64) -> Arc<dyn WeightPolicy> {
    match phase_for(observations) {
        Phase::Bootstrap => Arc::new(RulePolicy),
        Phase::Projection => Arc::new(ProjectionPolicy::default()),
        Phase::Sequence => Arc::new(SequencePolicy::default()),
    }
}

fn load_counter(path: &Path) -> Option<u64> {
    let raw = std::fs::read_to_string(path).ok()?;
    let state: PersistedCounter = serde_json::from_str(&raw).ok()?;
    Some(state.observations)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scores(hard: f64, soft: f64) -> ScoreVector {
        let mut s = ScoreVector::new();
        s.set(crate::request::AXIS_HARD, hard);
        s.set(crate::request::AXIS_SOFT, soft);
        s
    }

    #[test]
    fn bootstrap_rules_match_policy_table() {
        let ctx = ControlContext::default();
        let p = RulePolicy;
        assert_eq!(p.weights(&scores(0.9, 0.1), &ctx), Weights::from_alpha(0.95));
        assert_eq!(p.weights(&scores(0.1, 0.85), &ctx), Weights::from_alpha(0.20));
        assert_eq!(p.weights(&scores(0.5, 0.5), &ctx), Weights::from_alpha(0.60));
    }

    #[test]
    fn all_phases_keep_weights_balanced() {
        let ctx = ControlContext::default();
        let policies: Vec<Box<dyn WeightPolicy>> = vec![
            Box::new(RulePolicy),
            Box::new(ProjectionPolicy::default()),
            Box::new(SequencePolicy::default()),
        ];
        for policy in &policies {
            for h in 0..=10 {
                for s in 0..=10 {
                    let w = policy.weights(&scores(h as f64 / 10.0, s as f64 / 10.0), &ctx);
                    assert!(w.is_balanced(), "{:?} from {h}/{s}", w);
                }
            }
        }
    }

    #[test]
    fn projection_leans_technical_for_hard_queries() {
        let ctx = ControlContext::default();
        let p = ProjectionPolicy::default();
        assert!(p.weights(&scores(0.9, 0.1), &ctx).alpha > 0.8);
        assert!(p.weights(&scores(0.1, 0.9), &ctx).alpha < 0.3);
    }

    #[test]
    fn empty_scores_fall_to_the_middle_rule() {
        let ctx = ControlContext::default();
        let w = RulePolicy.weights(&ScoreVector::new(), &ctx);
        assert_eq!(w, Weights::from_alpha(0.60));
    }

    #[test]
    fn promotion_after_counter_threshold() {
        let control = MetaControl::new(None);
        assert_eq!(control.phase(), Phase::Bootstrap);
        for _ in 0..PROMOTE_TO_PROJECTION_AT {
            control.observe_labelled();
        }
        assert_eq!(control.phase(), Phase::Projection);
    }

    #[test]
    fn counter_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.json");

        let control = MetaControl::new(Some(path.clone()));
        for _ in 0..PROMOTE_TO_PROJECTION_AT + 5 {
            control.observe_labelled();
        }
        control.persist();

        let reloaded = MetaControl::new(Some(path));
        assert_eq!(reloaded.observations(), PROMOTE_TO_PROJECTION_AT + 5);
        assert_eq!(reloaded.phase(), Phase::Projection);
    }

    #[test]
    fn corrupt_counter_starts_cold() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.json");
        std::fs::write(&path, "{\"observ").unwrap();

        let control = MetaControl::new(Some(path));
        assert_eq!(control.observations(), 0);
        assert_eq!(control.phase(), Phase::Bootstrap);
    }

    #[test]
    fn weights_call_holds_one_policy() {
        let control = Arc::new(MetaControl::new(None));
        let ctx = ControlContext::default();
        // Promote concurrently while reading; every read must stay balanced.
        let reader = {
            let control = Arc::clone(&control);
            std::thread::spawn(move || {
                for _ in 0..500 {
                    let w = control.weights(&ScoreVector::new(), &ControlContext::default());
                    assert!(w.is_balanced());
                }
            })
        };
        for _ in 0..PROMOTE_TO_SEQUENCE_AT {
            control.observe_labelled();
        }
        reader.join().unwrap();
        let w = control.weights(&ScoreVector::new(), &ctx);
        assert!(w.is_balanced());
    }
}
