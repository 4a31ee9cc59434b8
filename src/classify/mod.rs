//! Intent classifier.
//!
//! Scores a query across the intent axes {hard, soft, web_query} plus
//! auxiliary skill axes. Two modes return the same axis set:
//!
//! - *Cold*: keyword and rule tables, plus a long-tail table of unordered
//!   token pairs for the skill axes. A pair fires only when both tokens
//!   appear; the highest firing weight above threshold wins skill
//!   selection, ties breaking by lexicographic axis name.
//! - *Warm*: a small fixed projection over the embedding.
//!
//! Classification is a pure function of (text, embedding) with no network
//! side effects.

use std::sync::LazyLock as Lazy;

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::embedding::EMBEDDING_DIM;
use crate::request::{
    AXIS_CREATIVE, AXIS_HARD, AXIS_PROGRAMMING, AXIS_REASONING, AXIS_SOFT, AXIS_WEB_QUERY,
    ScoreVector,
};

/// Skill axis scores below this never win selection.
pub const SKILL_THRESHOLD: f64 = 0.5;

// ---------------------------------------------------------------------------
// Cold-mode tables
// ---------------------------------------------------------------------------

static HARD_KEYWORDS: &[&str] = &[
    "configure", "install", "setup", "set up", "compile", "deploy", "server",
    "ssh", "kernel", "database", "network", "optimize", "algorithm", "debug",
    "build", "encrypt", "partition", "firewall", "remote", "docker",
    "kubernetes", "api", "script", "terminal", "benchmark",
];

static SOFT_KEYWORDS: &[&str] = &[
    "feel", "feeling", "overwhelmed", "sad", "anxious", "lonely", "stressed",
    "worried", "afraid", "tired", "miss you", "lost", "hurt", "upset",
    "frustrated", "grateful", "angry", "cry", "alone", "hopeless",
];

static WEB_KEYWORDS: &[&str] = &[
    "who won", "latest", "news", "today's", "yesterday", "current", "price of",
    "weather", "score", "match", "election", "release date", "stock",
    "happening now", "right now",
];

static WEB_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i)who (won|is winning|is leading)").unwrap(),
        Regex::new(r"(?i)what('s| is) the (score|price|weather|exchange rate)").unwrap(),
        Regex::new(r"(?i)\b(this|last) (week|night|morning)\b").unwrap(),
    ]
});

/// Long-tail skill table: unordered token pair, target axis, weight.
static SKILL_PAIRS: &[(&str, &str, &str, f64)] = &[
    ("write", "function", AXIS_PROGRAMMING, 0.85),
    ("python", "function", AXIS_PROGRAMMING, 0.9),
    ("fix", "bug", AXIS_PROGRAMMING, 0.8),
    ("code", "review", AXIS_PROGRAMMING, 0.7),
    ("implement", "class", AXIS_PROGRAMMING, 0.8),
    ("rust", "trait", AXIS_PROGRAMMING, 0.9),
    ("sql", "query", AXIS_PROGRAMMING, 0.75),
    ("unit", "test", AXIS_PROGRAMMING, 0.7),
    ("write", "story", AXIS_CREATIVE, 0.85),
    ("write", "poem", AXIS_CREATIVE, 0.9),
    ("compose", "song", AXIS_CREATIVE, 0.8),
    ("imagine", "world", AXIS_CREATIVE, 0.7),
    ("invent", "character", AXIS_CREATIVE, 0.75),
    ("prove", "theorem", AXIS_REASONING, 0.95),
    ("derive", "equation", AXIS_REASONING, 0.85),
    ("logic", "puzzle", AXIS_REASONING, 0.8),
    ("chain", "thought", AXIS_REASONING, 0.7),
    ("compare", "tradeoffs", AXIS_REASONING, 0.65),
];

fn count_matches(text: &str, keywords: &[&str]) -> usize {
    keywords.iter().filter(|kw| text.contains(*kw)).count()
}

fn hard_score(matches: usize) -> f64 {
    match matches {
        0 => 0.05,
        1 => 0.6,
        2 => 0.8,
        _ => 0.9,
    }
}

fn soft_score(matches: usize) -> f64 {
    match matches {
        0 => 0.1,
        1 => 0.55,
        2 => 0.85,
        _ => 0.9,
    }
}

fn web_score(matches: usize) -> f64 {
    match matches {
        0 => 0.0,
        1 => 0.35,
        2 => 0.75,
        _ => 0.9,
    }
}

// ---------------------------------------------------------------------------
// Warm projection
// ---------------------------------------------------------------------------

/// Axis order shared by both modes.
const AXES: &[&str] = &[
    AXIS_HARD, AXIS_SOFT, AXIS_WEB_QUERY, AXIS_PROGRAMMING, AXIS_CREATIVE, AXIS_REASONING,
];

/// Fixed projection over the embedding. Rows are derived from the axis
/// names so the matrix is identical in every process.
struct WarmProjection {
    rows: Vec<Vec<f32>>,
}

impl WarmProjection {
    fn new() -> Self {
        let rows = AXES.iter().map(|axis| Self::row(axis)).collect();
        Self { rows }
    }

    fn row(axis: &str) -> Vec<f32> {
        let mut out = Vec::with_capacity(EMBEDDING_DIM);
        let mut counter: u32 = 0;
        while out.len() < EMBEDDING_DIM {
            let mut hasher = Sha256::new();
            hasher.update(axis.as_bytes());
            hasher.update(counter.to_le_bytes());
            let digest = hasher.finalize();
            for chunk in digest.chunks_exact(2) {
                if out.len() == EMBEDDING_DIM {
                    break;
                }
                let raw = i16::from_le_bytes([chunk[0], chunk[1]]);
                out.push(raw as f32 / i16::MAX as f32);
            }
            counter += 1;
        }
        out
    }

    fn project(&self, embedding: &[f32]) -> ScoreVector {
        let mut scores = ScoreVector::new();
        for (axis, row) in AXES.iter().zip(&self.rows) {
            let dot: f32 = row
                .iter()
                .zip(embedding.iter())
                .map(|(a, b)| a * b)
                .sum();
            let score = 1.0 / (1.0 + (-4.0 * f64::from(dot)).exp());
            scores.set(axis, score);
        }
        scores
    }
}

// ---------------------------------------------------------------------------
// Classifier
// ---------------------------------------------------------------------------

/// Which scoring path is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClassifierMode {
    #[default]
    Cold,
    Warm,
}

pub struct Classifier {
    mode: ClassifierMode,
    warm: WarmProjection,
}

impl Classifier {
    pub fn new(mode: ClassifierMode) -> Self {
        Self { mode, warm: WarmProjection::new() }
    }

    pub fn mode(&self) -> ClassifierMode {
        self.mode
    }

    /// Score a query. Pure function of the inputs.
    pub fn classify(&self, text: &str, embedding: &[f32]) -> ScoreVector {
        match self.mode {
            ClassifierMode::Cold => cold_classify(text),
            ClassifierMode::Warm => {
                // A zero embedding carries no signal; fall back to the tables.
                if embedding.iter().all(|v| *v == 0.0) {
                    cold_classify(text)
                } else {
                    self.warm.project(embedding)
                }
            }
        }
    }

    /// Cheap scoring over a prefix of partial input, for the prefetcher.
    /// Less precise than `classify`: long tails of the input are ignored.
    pub fn quick_classify(&self, partial_text: &str) -> ScoreVector {
        let prefix: String = partial_text.chars().take(160).collect();
        cold_classify(&prefix)
    }
}

fn cold_classify(text: &str) -> ScoreVector {
    let lower = text.to_lowercase();
    let words: std::collections::BTreeSet<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();

    let mut scores = ScoreVector::new();
    scores.set(AXIS_HARD, hard_score(count_matches(&lower, HARD_KEYWORDS)));
    scores.set(AXIS_SOFT, soft_score(count_matches(&lower, SOFT_KEYWORDS)));
    let web_matches = count_matches(&lower, WEB_KEYWORDS)
        + WEB_PATTERNS.iter().filter(|re| re.is_match(&lower)).count();
    scores.set(AXIS_WEB_QUERY, web_score(web_matches));

    // Collect every firing pair, then let a single skill axis win:
    // highest weight above threshold, lexicographic axis name on ties.
    let mut fired = ScoreVector::new();
    for (a, b, axis, weight) in SKILL_PAIRS {
        if words.contains(a) && words.contains(b) && *weight > fired.get(axis) {
            fired.set(axis, *weight);
        }
    }
    if let Some((axis, weight)) = fired.top_skill(SKILL_THRESHOLD) {
        scores.set(axis, weight);
    }
    scores
}
