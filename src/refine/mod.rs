//! Iterative refiner.
//!
//! Optional post-pass over a generated answer: re-generate up to N times,
//! keep the iteration with the best composite quality, and stop early once
//! consecutive outputs converge (LCS similarity at or above the
//! threshold). A failure mid-loop returns the best text so far with an
//! error annotation instead of surfacing the failure.

use std::future::Future;

use crate::request::{RouteDecision, Weights};
use crate::settings::RefinerSettings;

/// Outcome of a refinement run.
#[derive(Debug, Clone)]
pub struct RefineOutcome {
    pub text: String,
    pub iterations: usize,
    pub converged: bool,
    pub quality: f64,
    pub error: Option<String>,
}

/// Whether the post-pass applies at all. Empathic answers, web synthesis,
/// trivially short queries, and a disabled refiner all skip it.
pub fn should_refine(
    settings: &RefinerSettings,
    decision: RouteDecision,
    weights: &Weights,
    query: &str,
) -> bool {
    if !settings.enabled || settings.max_iterations == 0 {
        return false;
    }
    // Inclusive: an 0.80/0.20 empathic split already skips.
    if weights.beta >= 0.8 {
        return false;
    }
    if decision == RouteDecision::WebSynthesis {
        return false;
    }
    if query.chars().count() < settings.min_query_len {
        return false;
    }
    matches!(
        decision,
        RouteDecision::Cascade(_) | RouteDecision::EmpathicFallback
    )
}

/// Run the refinement loop. `generate` is called with the refinement
/// prompt for each pass; with `max_iterations = 0` the initial text is
/// returned unchanged.
pub async fn refine<F, Fut>(
    settings: &RefinerSettings,
    query: &str,
    initial: String,
    mut generate: F,
) -> RefineOutcome
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = crate::error::Result<String>>,
{
    let mut best_text = initial.clone();
    let mut best_quality = quality_score(&settings.quality_weights, query, &initial);
    let mut current = initial;
    let mut converged = false;
    let mut error = None;
    let mut iterations = 0;

    for round in 0..settings.max_iterations {
        let prompt = refinement_prompt(query, &current);
        let candidate = match generate(prompt).await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(round, error = %e, "refinement pass failed, keeping best so far");
                error = Some(e.to_string());
                break;
            }
        };
        iterations = round + 1;

        let quality = quality_score(&settings.quality_weights, query, &candidate);
        if quality > best_quality {
            best_quality = quality;
            best_text = candidate.clone();
        }

        let similarity = lcs_similarity(&current, &candidate);
        current = candidate;
        if similarity >= settings.convergence_threshold {
            converged = true;
            break;
        }
    }

    RefineOutcome { text: best_text, iterations, converged, quality: best_quality, error }
}

fn refinement_prompt(query: &str, draft: &str) -> String {
    format!(
        "Improve the following answer. Keep what is correct, tighten what is \
         vague, and close with a clear conclusion.\n\nQuestion: {query}\n\nDraft: {draft}"
    )
}

// ---------------------------------------------------------------------------
// Similarity
// ---------------------------------------------------------------------------

/// Word-level longest-common-subsequence ratio in `[0, 1]`.
pub fn lcs_similarity(a: &str, b: &str) -> f64 {
    let a_words: Vec<&str> = a.split_whitespace().take(512).collect();
    let b_words: Vec<&str> = b.split_whitespace().take(512).collect();
    if a_words.is_empty() && b_words.is_empty() {
        return 1.0;
    }
    if a_words.is_empty() || b_words.is_empty() {
        return 0.0;
    }

    let mut prev = vec![0usize; b_words.len() + 1];
    let mut row = vec![0usize; b_words.len() + 1];
    for &aw in &a_words {
        for (j, &bw) in b_words.iter().enumerate() {
            row[j + 1] = if aw == bw {
                prev[j] + 1
            } else {
                prev[j + 1].max(row[j])
            };
        }
        std::mem::swap(&mut prev, &mut row);
        row.fill(0);
    }
    let lcs = prev[b_words.len()] as f64;
    2.0 * lcs / (a_words.len() + b_words.len()) as f64
}

// ---------------------------------------------------------------------------
// Quality
// ---------------------------------------------------------------------------

static CONCLUSION_MARKERS: &[&str] =
    &["in conclusion", "in summary", "to summarize", "overall", "therefore"];

/// Composite quality: weighted sum over length, keyword overlap with the
/// query, sentence count, and a conclusion marker.
pub fn quality_score(weights: &[f64; 4], query: &str, answer: &str) -> f64 {
    let words = answer.split_whitespace().count();
    let length_norm = (words as f64 / 150.0).min(1.0);

    let query_words: std::collections::BTreeSet<String> = query
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
        .map(str::to_string)
        .collect();
    let overlap = if query_words.is_empty() {
        0.0
    } else {
        let lower = answer.to_lowercase();
        let hit = query_words.iter().filter(|w| lower.contains(w.as_str())).count();
        hit as f64 / query_words.len() as f64
    };

    let sentences = answer
        .split(['.', '!', '?'])
        .filter(|s| !s.trim().is_empty())
        .count();
    let sentence_norm = (sentences as f64 / 8.0).min(1.0);

    let lower = answer.to_lowercase();
    let conclusion = if CONCLUSION_MARKERS.iter().any(|m| lower.contains(m)) {
        1.0
    } else {
        0.0
    };

    weights[0] * length_norm
        + weights[1] * overlap
        + weights[2] * sentence_norm
        + weights[3] * conclusion
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::CascadeTier;

    fn settings() -> RefinerSettings {
        RefinerSettings::default()
    }

    #[tokio::test]
    async fn zero_iterations_returns_input_unchanged() {
        let cfg = RefinerSettings { max_iterations: 0, ..settings() };
        let outcome = refine(&cfg, "a question", "the answer".to_string(), |_| async {
            panic!("generator must not run")
        })
        .await;
        assert_eq!(outcome.text, "the answer");
        assert_eq!(outcome.iterations, 0);
        assert!(!outcome.converged);
    }

    #[tokio::test]
    async fn converges_when_outputs_stabilise() {
        let cfg = settings();
        let stable = "The configuration steps are listed and verified. In conclusion, \
                      apply them in order and the host will accept connections.";
        let outcome = refine(&cfg, "configure the host", "first draft".to_string(), |_| async {
            Ok(stable.to_string())
        })
        .await;
        assert!(outcome.converged);
        assert_eq!(outcome.iterations, 2, "identical second output converges");
        assert_eq!(outcome.text, stable);
    }

    #[tokio::test]
    async fn returns_best_quality_iteration() {
        let cfg = settings();
        let weak = "Short.";
        let strong = "The answer covers the configure steps for the host in detail, \
                      sentence by sentence, with checks. In conclusion, the setup holds.";
        let mut round = 0;
        let outcome = refine(&cfg, "configure the host", weak.to_string(), move |_| {
            round += 1;
            let text = if round == 1 { strong } else { "Different short reply." };
            async move { Ok(text.to_string()) }
        })
        .await;
        assert_eq!(outcome.text, strong);
    }

    #[tokio::test]
    async fn error_mid_loop_keeps_best_so_far() {
        let cfg = settings();
        let mut round = 0;
        let outcome = refine(&cfg, "a question about things", "base draft".to_string(), move |_| {
            round += 1;
            async move {
                if round == 1 {
                    Ok("An improved draft about the question, with things covered. \
                        In conclusion, done."
                        .to_string())
                } else {
                    Err(crate::error::MindgateError::GenerationFailed("boom".into()))
                }
            }
        })
        .await;
        assert!(outcome.error.is_some());
        assert!(outcome.text.contains("improved draft"));
    }

    #[test]
    fn lcs_similarity_bounds() {
        assert_eq!(lcs_similarity("a b c", "a b c"), 1.0);
        assert_eq!(lcs_similarity("a b c", "x y z"), 0.0);
        let partial = lcs_similarity("the quick brown fox", "the slow brown fox");
        assert!(partial > 0.5 && partial < 1.0);
    }

    #[test]
    fn quality_rewards_conclusions_and_overlap() {
        let w = [0.3, 0.3, 0.2, 0.2];
        let query = "configure the database server";
        let with = quality_score(&w, query, "Configure the database server carefully. In conclusion, done.");
        let without = quality_score(&w, query, "Something unrelated and short.");
        assert!(with > without);
    }

    #[test]
    fn skip_rules() {
        let cfg = settings();
        let long_query = "please explain this at proper length";
        // Empathic weighting skips.
        assert!(!should_refine(
            &cfg,
            RouteDecision::Cascade(CascadeTier::T1),
            &Weights::from_alpha(0.1),
            long_query
        ));
        // Web synthesis skips.
        assert!(!should_refine(
            &cfg,
            RouteDecision::WebSynthesis,
            &Weights::from_alpha(0.9),
            long_query
        ));
        // Short queries skip.
        assert!(!should_refine(
            &cfg,
            RouteDecision::Cascade(CascadeTier::T1),
            &Weights::from_alpha(0.9),
            "hi"
        ));
        // Disabled refiner skips.
        let disabled = RefinerSettings { enabled: false, ..settings() };
        assert!(!should_refine(
            &disabled,
            RouteDecision::Cascade(CascadeTier::T1),
            &Weights::from_alpha(0.9),
            long_query
        ));
        // Cascade with technical weighting refines.
        assert!(should_refine(
            &cfg,
            RouteDecision::Cascade(CascadeTier::T1),
            &Weights::from_alpha(0.9),
            long_query
        ));
    }
}
