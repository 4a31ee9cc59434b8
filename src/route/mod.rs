//! Routing state machine.
//!
//! One pure function maps (request, scores, weights) onto a routing
//! decision using a strict priority ladder:
//!
//! 1. short image input or vision cues          → Vision
//! 2. programming skill above threshold         → CodeExpert
//! 3. web_query above threshold                 → WebSynthesis
//! 4. image input with long accompanying text   → MultimodalLoop
//! 5. audio input                               → Audio
//! 6. α above threshold                         → Cascade tier per oracle
//! 7. otherwise                                 → EmpathicFallback
//!
//! Earlier rules always win; adding an image to a request that routed
//! elsewhere re-routes it up the ladder.

use crate::cascade::CascadeOracle;
use crate::request::{AXIS_PROGRAMMING, InferenceRequest, RouteDecision, ScoreVector, Weights};
use crate::settings::RouterSettings;

/// Textual cues that pull a request toward the vision path even without an
/// image attached (e.g. a follow-up about an earlier photo).
static VISION_CUES: &[&str] = &[
    "photo", "picture", "image", "screenshot", "diagram", "this chart", "look at this",
];

pub struct Router {
    settings: RouterSettings,
    oracle: CascadeOracle,
}

impl Router {
    pub fn new(settings: RouterSettings, oracle: CascadeOracle) -> Self {
        Self { settings, oracle }
    }

    /// Dispatch. Pure: same inputs, same decision.
    pub fn route(
        &self,
        request: &InferenceRequest,
        scores: &ScoreVector,
        weights: &Weights,
    ) -> RouteDecision {
        let cfg = &self.settings;
        let text = request.text.to_lowercase();
        let long_text = request.text.chars().count() > cfg.multimodal_min_text_len;
        let vision_cue = VISION_CUES.iter().any(|cue| text.contains(cue));

        // 1. Image with little text, or explicit vision cues. An image
        //    accompanied by long text falls through to the multimodal loop.
        if (request.has_image() && !long_text) || vision_cue {
            return RouteDecision::Vision;
        }

        // 2. Code expertise.
        if scores.get(AXIS_PROGRAMMING) > cfg.code_threshold {
            return RouteDecision::CodeExpert;
        }

        // 3. Freshness-dependent queries.
        if scores.web_query() > cfg.web_threshold {
            return RouteDecision::WebSynthesis;
        }

        // 4. Image plus substantial text.
        if request.has_image() && long_text {
            return RouteDecision::MultimodalLoop;
        }

        // 5. Audio input.
        if request.has_audio() {
            return RouteDecision::Audio;
        }

        // 6. Technical weighting enters the cascade.
        if weights.alpha > cfg.alpha_cascade_threshold {
            let (tier, confidence) = self.oracle.decide(&request.text, scores);
            tracing::debug!(%tier, confidence, "cascade tier selected");
            return RouteDecision::Cascade(tier);
        }

        // 7. Everything else gets the empathic path.
        RouteDecision::EmpathicFallback
    }

    /// Pool name a decision resolves to.
    pub fn model_for(&self, decision: RouteDecision, cascade: &crate::settings::CascadeSettings) -> String {
        let cfg = &self.settings;
        match decision {
            RouteDecision::Vision => cfg.vision_model.clone(),
            RouteDecision::CodeExpert => cfg.code_model.clone(),
            RouteDecision::WebSynthesis => cfg.web_model.clone(),
            RouteDecision::MultimodalLoop => cfg.multimodal_model.clone(),
            RouteDecision::Audio => cfg.audio_model.clone(),
            RouteDecision::Cascade(tier) => match tier {
                crate::request::CascadeTier::T1 => cascade.tier1_model.clone(),
                crate::request::CascadeTier::T2 => cascade.tier2_model.clone(),
                crate::request::CascadeTier::T3 => cascade.tier3_model.clone(),
            },
            RouteDecision::EmpathicFallback => cfg.empathic_model.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{AXIS_HARD, AXIS_SOFT, AXIS_WEB_QUERY, Attachment, CascadeTier};
    use crate::settings::CascadeSettings;

    fn router() -> Router {
        Router::new(
            RouterSettings::default(),
            CascadeOracle::new(&CascadeSettings::default()),
        )
    }

    fn scores(pairs: &[(&str, f64)]) -> ScoreVector {
        let mut s = ScoreVector::new();
        for (axis, v) in pairs {
            s.set(axis, *v);
        }
        s
    }

    fn balanced() -> Weights {
        Weights::from_alpha(0.6)
    }

    #[test]
    fn image_payload_routes_to_vision() {
        let request = InferenceRequest::text("What is in this photo?")
            .with_attachment(Attachment::Image(vec![0xff, 0xd8]));
        let decision = router().route(&request, &ScoreVector::new(), &balanced());
        assert_eq!(decision, RouteDecision::Vision);
    }

    #[test]
    fn adding_an_image_reroutes_to_vision() {
        let r = router();
        let s = scores(&[(AXIS_HARD, 0.9)]);
        let technical = Weights::from_alpha(0.95);

        let plain = InferenceRequest::text("Summarise this for me");
        let routed = r.route(&plain, &s, &technical);
        assert_ne!(routed, RouteDecision::Vision);

        let with_image = plain.with_attachment(Attachment::Image(vec![1, 2, 3]));
        assert_eq!(r.route(&with_image, &s, &technical), RouteDecision::Vision);
    }

    #[test]
    fn programming_skill_beats_cascade() {
        let request = InferenceRequest::text("Write a Python function");
        let s = scores(&[(AXIS_PROGRAMMING, 0.9), (AXIS_HARD, 0.9)]);
        let decision = router().route(&request, &s, &Weights::from_alpha(0.95));
        assert_eq!(decision, RouteDecision::CodeExpert);
    }

    #[test]
    fn web_query_beats_cascade() {
        let request = InferenceRequest::text("Who won yesterday's match?");
        let s = scores(&[(AXIS_WEB_QUERY, 0.9), (AXIS_HARD, 0.9)]);
        let decision = router().route(&request, &s, &Weights::from_alpha(0.95));
        assert_eq!(decision, RouteDecision::WebSynthesis);
    }

    #[test]
    fn long_text_with_image_enters_multimodal_loop() {
        let long = "Walk through every element of the attached rendering and explain how \
                    the layers interact, then suggest improvements to the composition."
            .to_string();
        assert!(long.chars().count() > RouterSettings::default().multimodal_min_text_len);
        let request =
            InferenceRequest::text(long).with_attachment(Attachment::Image(vec![9, 9]));
        let decision = router().route(&request, &ScoreVector::new(), &balanced());
        assert_eq!(decision, RouteDecision::MultimodalLoop);
    }

    #[test]
    fn audio_routes_to_audio() {
        let request = InferenceRequest::text("transcribe and answer")
            .with_attachment(Attachment::Audio(vec![0, 1]));
        let decision = router().route(&request, &ScoreVector::new(), &balanced());
        assert_eq!(decision, RouteDecision::Audio);
    }

    #[test]
    fn technical_alpha_enters_cascade() {
        let request = InferenceRequest::text("Configure SSH on a remote host");
        let s = scores(&[(AXIS_HARD, 0.9), (AXIS_SOFT, 0.1)]);
        let decision = router().route(&request, &s, &Weights::from_alpha(0.95));
        assert_eq!(decision, RouteDecision::Cascade(CascadeTier::T1));
    }

    #[test]
    fn empty_scores_fall_back_to_empathic() {
        let request = InferenceRequest::text("hmm");
        let decision = router().route(&request, &ScoreVector::new(), &balanced());
        assert_eq!(decision, RouteDecision::EmpathicFallback);
    }

    #[test]
    fn empathic_weights_fall_back_to_empathic() {
        let request = InferenceRequest::text("I feel overwhelmed today");
        let s = scores(&[(AXIS_SOFT, 0.85), (AXIS_HARD, 0.1)]);
        let decision = router().route(&request, &s, &Weights::from_alpha(0.2));
        assert_eq!(decision, RouteDecision::EmpathicFallback);
    }

    #[test]
    fn decisions_resolve_to_catalog_models() {
        let r = router();
        let cascade = CascadeSettings::default();
        assert_eq!(r.model_for(RouteDecision::Vision, &cascade), "vision");
        assert_eq!(r.model_for(RouteDecision::CodeExpert, &cascade), "code");
        assert_eq!(r.model_for(RouteDecision::Cascade(CascadeTier::T1), &cascade), "tiny");
        assert_eq!(
            r.model_for(RouteDecision::Cascade(CascadeTier::T3), &cascade),
            "cascade.t3"
        );
        assert_eq!(r.model_for(RouteDecision::EmpathicFallback, &cascade), "expert_short");
    }
}
