//! Cascade oracle.
//!
//! Confidence-driven selection over three pre-declared tiers. High
//! confidence means a cheap model will do; low confidence escalates.
//! Certain phrases force the deep-reasoning tier outright.
//!
//! Confidence is a weighted sum of lexical, syntactic, and semantic
//! difficulty signals, each normalised to `[0, 1]`. The feature extraction
//! is pluggable behind [`DifficultySignals`]; the default weights are
//! 0.4 / 0.3 / 0.3. Ties at a threshold break toward the cheaper tier.

use aho_corasick::AhoCorasick;

use crate::request::{AXIS_CREATIVE, AXIS_REASONING, CascadeTier, ScoreVector};
use crate::settings::CascadeSettings;

const LEXICAL_WEIGHT: f64 = 0.4;
const SYNTACTIC_WEIGHT: f64 = 0.3;
const SEMANTIC_WEIGHT: f64 = 0.3;

/// Difficulty feature extraction. Each signal is an *ease* score in
/// `[0, 1]`: 1 means trivially answerable by the cheapest tier.
pub trait DifficultySignals: Send + Sync {
    fn lexical(&self, text: &str) -> f64;
    fn syntactic(&self, text: &str) -> f64;
    fn semantic(&self, text: &str, scores: &ScoreVector) -> f64;
}

/// Default signal set.
pub struct DefaultSignals;

impl DifficultySignals for DefaultSignals {
    /// Short texts of short, common-looking words read as easy.
    fn lexical(&self, text: &str) -> f64 {
        let words: Vec<&str> = text.split_whitespace().collect();
        if words.is_empty() {
            return 1.0;
        }
        let avg_len =
            words.iter().map(|w| w.chars().count()).sum::<usize>() as f64 / words.len() as f64;
        let word_ease = (1.0 - (avg_len - 3.0) / 9.0).clamp(0.0, 1.0);
        let length_ease = (1.0 - words.len() as f64 / 120.0).clamp(0.0, 1.0);
        0.7 * word_ease + 0.3 * length_ease
    }

    /// Flat, single-clause sentences read as easy; nesting and clause
    /// stacking read as hard.
    fn syntactic(&self, text: &str) -> f64 {
        let sentences = text
            .split(['.', '!', '?'])
            .filter(|s| !s.trim().is_empty())
            .count()
            .max(1);
        let clause_marks = text
            .chars()
            .filter(|c| matches!(c, ',' | ';' | ':' | '(' | ')'))
            .count();
        let subordinators = ["because", "although", "whereas", "unless", "however", "therefore"]
            .iter()
            .filter(|w| text.to_lowercase().contains(*w))
            .count();
        let depth = (clause_marks + 2 * subordinators) as f64 / sentences as f64;
        (1.0 - depth / 6.0).clamp(0.0, 1.0)
    }

    /// Reasoning-heavy intent is the strongest difficulty signal; hard and
    /// creative intent contribute less.
    fn semantic(&self, _text: &str, scores: &ScoreVector) -> f64 {
        let difficulty = 0.6 * scores.get(AXIS_REASONING)
            + 0.2 * scores.hard()
            + 0.2 * scores.get(AXIS_CREATIVE);
        (1.0 - difficulty).clamp(0.0, 1.0)
    }
}

/// The oracle. Deterministic for fixed inputs.
pub struct CascadeOracle {
    tier1_min: f64,
    tier2_min: f64,
    force: Option<AhoCorasick>,
    signals: Box<dyn DifficultySignals>,
}

impl CascadeOracle {
    pub fn new(settings: &CascadeSettings) -> Self {
        Self::with_signals(settings, Box::new(DefaultSignals))
    }

    pub fn with_signals(settings: &CascadeSettings, signals: Box<dyn DifficultySignals>) -> Self {
        let force = if settings.force_patterns.is_empty() {
            None
        } else {
            AhoCorasick::builder()
                .ascii_case_insensitive(true)
                .build(&settings.force_patterns)
                .ok()
        };
        Self {
            tier1_min: settings.tier1.min_confidence,
            tier2_min: settings.tier2.min_confidence,
            force,
            signals,
        }
    }

    /// Select a tier and report the confidence that drove it.
    ///
    /// Force patterns short-circuit to Tier 3 with zero confidence. The
    /// threshold comparisons are inclusive, so landing exactly on a tier
    /// boundary selects the cheaper tier.
    pub fn decide(&self, text: &str, scores: &ScoreVector) -> (CascadeTier, f64) {
        if let Some(force) = &self.force {
            if force.is_match(text) {
                tracing::debug!("force pattern matched, selecting tier 3");
                return (CascadeTier::T3, 0.0);
            }
        }

        let confidence = self.confidence(text, scores);
        let tier = if confidence >= self.tier1_min {
            CascadeTier::T1
        } else if confidence >= self.tier2_min {
            CascadeTier::T2
        } else {
            CascadeTier::T3
        };
        (tier, confidence)
    }

    fn confidence(&self, text: &str, scores: &ScoreVector) -> f64 {
        let lexical = self.signals.lexical(text).clamp(0.0, 1.0);
        let syntactic = self.signals.syntactic(text).clamp(0.0, 1.0);
        let semantic = self.signals.semantic(text, scores).clamp(0.0, 1.0);
        LEXICAL_WEIGHT * lexical + SYNTACTIC_WEIGHT * syntactic + SEMANTIC_WEIGHT * semantic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::AXIS_HARD;

    fn oracle() -> CascadeOracle {
        CascadeOracle::new(&CascadeSettings::default())
    }

    fn hard_scores(hard: f64) -> ScoreVector {
        let mut s = ScoreVector::new();
        s.set(AXIS_HARD, hard);
        s
    }

    /// Signals pinned to a constant, for exact threshold tests.
    struct FixedSignals(f64);

    impl DifficultySignals for FixedSignals {
        fn lexical(&self, _: &str) -> f64 {
            self.0
        }
        fn syntactic(&self, _: &str) -> f64 {
            self.0
        }
        fn semantic(&self, _: &str, _: &ScoreVector) -> f64 {
            self.0
        }
    }

    #[test]
    fn short_technical_query_selects_tier1() {
        let (tier, confidence) = oracle().decide("Configure SSH on a remote host", &hard_scores(0.9));
        assert_eq!(tier, CascadeTier::T1, "confidence={confidence}");
        assert!(confidence >= 0.75);
    }

    #[test]
    fn force_pattern_selects_tier3_unconditionally() {
        let (tier, _) = oracle().decide("please PROVE this little lemma", &hard_scores(0.1));
        assert_eq!(tier, CascadeTier::T3);
    }

    #[test]
    fn force_pattern_is_case_insensitive_substring() {
        let (tier, _) = oracle().decide("walk me through it Step By Step", &ScoreVector::new());
        assert_eq!(tier, CascadeTier::T3);
    }

    #[test]
    fn exact_tier1_boundary_selects_tier1() {
        let settings = CascadeSettings::default();
        // All signals equal means confidence == the pinned value.
        let oracle = CascadeOracle::with_signals(
            &settings,
            Box::new(FixedSignals(settings.tier1.min_confidence)),
        );
        let (tier, confidence) = oracle.decide("whatever", &ScoreVector::new());
        assert!((confidence - settings.tier1.min_confidence).abs() < 1e-9);
        assert_eq!(tier, CascadeTier::T1);
    }

    #[test]
    fn just_below_tier1_boundary_selects_tier2() {
        let settings = CascadeSettings::default();
        let oracle = CascadeOracle::with_signals(
            &settings,
            Box::new(FixedSignals(settings.tier1.min_confidence - 1e-6)),
        );
        let (tier, _) = oracle.decide("whatever", &ScoreVector::new());
        assert_eq!(tier, CascadeTier::T2);
    }

    #[test]
    fn low_confidence_selects_tier3() {
        let settings = CascadeSettings::default();
        let oracle = CascadeOracle::with_signals(&settings, Box::new(FixedSignals(0.1)));
        let (tier, _) = oracle.decide("whatever", &ScoreVector::new());
        assert_eq!(tier, CascadeTier::T3);
    }

    #[test]
    fn reasoning_scores_drag_confidence_down() {
        let o = oracle();
        let text = "Summarise the main argument of this essay";
        let (_, easy) = o.decide(text, &ScoreVector::new());
        let mut reasoning = ScoreVector::new();
        reasoning.set(AXIS_REASONING, 1.0);
        let (_, hard) = o.decide(text, &reasoning);
        assert!(hard < easy);
    }

    #[test]
    fn decide_is_deterministic() {
        let o = oracle();
        let scores = hard_scores(0.6);
        let a = o.decide("compare these two database designs", &scores);
        let b = o.decide("compare these two database designs", &scores);
        assert_eq!(a, b);
    }

    #[test]
    fn signal_weights_sum_to_one() {
        assert!((LEXICAL_WEIGHT + SYNTACTIC_WEIGHT + SEMANTIC_WEIGHT - 1.0).abs() < 1e-12);
    }
}
