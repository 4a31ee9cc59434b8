//! Core request and routing data model.
//!
//! A request is immutable once built; deadline and cancellation ride
//! alongside it rather than inside it. Routing decisions are produced once
//! per request and never mutated.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// Non-text payload attached to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attachment {
    Audio(Vec<u8>),
    Image(Vec<u8>),
}

/// Optional hints supplied by the client alongside the payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientHints {
    /// Session identifier for affinity across turns.
    #[serde(default)]
    pub session_id: Option<String>,
    /// BCP 47 locale tag, if the client knows it.
    #[serde(default)]
    pub locale: Option<String>,
}

/// An inbound inference request. The payload is immutable once built;
/// deadline and cancellation ride alongside it, orthogonal to the content.
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub id: Uuid,
    pub received_at: DateTime<Utc>,
    pub text: String,
    pub attachment: Option<Attachment>,
    pub hints: Option<ClientHints>,
    /// Per-request deadline; bounds every downstream call.
    pub deadline: Option<Duration>,
    /// Cooperative cancellation signal; flips to true when the caller
    /// gives up.
    pub cancelled: Option<watch::Receiver<bool>>,
}

impl InferenceRequest {
    /// Build a text-only request with a fresh id.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            received_at: Utc::now(),
            text: text.into(),
            attachment: None,
            hints: None,
            deadline: None,
            cancelled: None,
        }
    }

    /// Attach a non-text payload.
    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachment = Some(attachment);
        self
    }

    /// Attach client hints.
    pub fn with_hints(mut self, hints: ClientHints) -> Self {
        self.hints = Some(hints);
        self
    }

    /// Attach a deadline.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Attach a cancellation signal.
    pub fn with_cancellation(mut self, cancelled: watch::Receiver<bool>) -> Self {
        self.cancelled = Some(cancelled);
        self
    }

    pub fn has_image(&self) -> bool {
        matches!(self.attachment, Some(Attachment::Image(_)))
    }

    pub fn has_audio(&self) -> bool {
        matches!(self.attachment, Some(Attachment::Audio(_)))
    }

    /// Whether the caller has already given up.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.as_ref().is_some_and(|rx| *rx.borrow())
    }
}

// ---------------------------------------------------------------------------
// Score vector
// ---------------------------------------------------------------------------

/// Required intent axes. `hard` and `soft` are independent scores; they do
/// not sum to one.
pub const AXIS_HARD: &str = "hard";
pub const AXIS_SOFT: &str = "soft";
pub const AXIS_WEB_QUERY: &str = "web_query";

/// Optional skill axes produced by the long-tail pattern table.
pub const AXIS_PROGRAMMING: &str = "programming";
pub const AXIS_CREATIVE: &str = "creative";
pub const AXIS_REASONING: &str = "reasoning";

/// Mapping from named axis to a score in `[0, 1]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreVector(BTreeMap<String, f64>);

impl ScoreVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an axis score, clamped into `[0, 1]`.
    pub fn set(&mut self, axis: &str, value: f64) {
        self.0.insert(axis.to_string(), value.clamp(0.0, 1.0));
    }

    /// Score for an axis, `0.0` when absent.
    pub fn get(&self, axis: &str) -> f64 {
        self.0.get(axis).copied().unwrap_or(0.0)
    }

    pub fn hard(&self) -> f64 {
        self.get(AXIS_HARD)
    }

    pub fn soft(&self) -> f64 {
        self.get(AXIS_SOFT)
    }

    pub fn web_query(&self) -> f64 {
        self.get(AXIS_WEB_QUERY)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate axes in lexicographic order (BTreeMap ordering).
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Highest-scoring skill axis at or above `threshold`, ties broken by
    /// lexicographic axis name.
    pub fn top_skill(&self, threshold: f64) -> Option<(&str, f64)> {
        let mut best: Option<(&str, f64)> = None;
        for (axis, value) in self.iter() {
            if matches!(axis, AXIS_HARD | AXIS_SOFT | AXIS_WEB_QUERY) {
                continue;
            }
            if value < threshold {
                continue;
            }
            // Strictly-greater keeps the lexicographically first axis on ties.
            match best {
                Some((_, b)) if value <= b => {}
                _ => best = Some((axis, value)),
            }
        }
        best
    }
}

// ---------------------------------------------------------------------------
// Weights
// ---------------------------------------------------------------------------

/// Tolerance on the α + β = 1 constraint.
pub const WEIGHT_EPSILON: f64 = 1e-6;

/// Mixing weights: α biases technical generation, β empathic modulation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Weights {
    pub alpha: f64,
    pub beta: f64,
}

impl Weights {
    /// Build from α; β is the complement so the constraint holds by
    /// construction.
    pub fn from_alpha(alpha: f64) -> Self {
        let alpha = alpha.clamp(0.0, 1.0);
        Self { alpha, beta: 1.0 - alpha }
    }

    /// A decision is pure when one weight dominates.
    pub fn is_pure(&self) -> bool {
        self.alpha >= 0.9 || self.beta >= 0.9
    }

    /// Whether α + β is within tolerance of one.
    pub fn is_balanced(&self) -> bool {
        (self.alpha + self.beta - 1.0).abs() <= WEIGHT_EPSILON
    }
}

impl Default for Weights {
    fn default() -> Self {
        Self::from_alpha(0.6)
    }
}

// ---------------------------------------------------------------------------
// Routing decision
// ---------------------------------------------------------------------------

/// One of the three pre-declared cascade tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CascadeTier {
    T1,
    T2,
    T3,
}

impl CascadeTier {
    pub fn number(self) -> u8 {
        match self {
            Self::T1 => 1,
            Self::T2 => 2,
            Self::T3 => 3,
        }
    }
}

impl std::fmt::Display for CascadeTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tier{}", self.number())
    }
}

/// Where a request is dispatched. Immutable once produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteDecision {
    Vision,
    CodeExpert,
    WebSynthesis,
    MultimodalLoop,
    Audio,
    Cascade(CascadeTier),
    EmpathicFallback,
}

impl RouteDecision {
    pub fn cascade_tier(&self) -> Option<CascadeTier> {
        match self {
            Self::Cascade(t) => Some(*t),
            _ => None,
        }
    }
}

impl std::fmt::Display for RouteDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Vision => write!(f, "vision"),
            Self::CodeExpert => write!(f, "code_expert"),
            Self::WebSynthesis => write!(f, "web_synthesis"),
            Self::MultimodalLoop => write!(f, "multimodal_loop"),
            Self::Audio => write!(f, "audio"),
            Self::Cascade(t) => write!(f, "cascade_{t}"),
            Self::EmpathicFallback => write!(f, "empathic_fallback"),
        }
    }
}

// ---------------------------------------------------------------------------
// Model descriptors
// ---------------------------------------------------------------------------

/// How a model is hosted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    LocalFile,
    RemoteRpc,
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "local-file" => Ok(Self::LocalFile),
            "remote-rpc" => Ok(Self::RemoteRpc),
            other => Err(format!(
                "unknown backend kind '{other}', expected: local-file, remote-rpc"
            )),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LocalFile => write!(f, "local-file"),
            Self::RemoteRpc => write!(f, "remote-rpc"),
        }
    }
}

/// Static description of one logical model the pool can host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Logical name (`expert_short`, `tiny`, `cascade.t3`, ...). Filled
    /// from the `[models]` table key when omitted.
    #[serde(default)]
    pub name: String,
    pub backend: BackendKind,
    /// Filesystem path for `local-file`, URL for `remote-rpc`.
    pub location: String,
    pub context_window: u32,
    #[serde(default)]
    pub quantization: Option<String>,
    /// Rough wall-clock load cost, used for scheduling hints only.
    #[serde(default)]
    pub load_secs_estimate: f64,
    pub idle_ttl_seconds: u64,
    pub ram_estimate_bytes: u64,
    /// Members of the same swap group may not be co-resident.
    #[serde(default)]
    pub swap_group: Option<String>,
    /// Ordered logical names to try when this model fails to load.
    #[serde(default)]
    pub fallback: Vec<String>,
}
