//! Speculative model prefetch.
//!
//! A debounced classifier watches partial input while the user is still
//! typing. After a quiet period it predicts which model the final request
//! will need and hands the pool a prefetch hint. Prefetched handles sit in
//! the pool's side map until the real `get` promotes them.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use crate::classify::{Classifier, SKILL_THRESHOLD};
use crate::request::{AXIS_PROGRAMMING, ScoreVector};
use crate::settings::Settings;

use super::ModelPool;

#[derive(Clone)]
pub struct Prefetcher {
    tx: mpsc::UnboundedSender<String>,
}

impl Prefetcher {
    /// Spawn the debounce loop. Dropping the returned handle (or flipping
    /// the shutdown signal) ends it.
    pub fn spawn(
        pool: Arc<ModelPool>,
        classifier: Arc<Classifier>,
        settings: Arc<Settings>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let debounce = Duration::from_millis(settings.runtime.prefetch_debounce_ms);
        tokio::spawn(run(pool, classifier, settings, rx, debounce, shutdown));
        Self { tx }
    }

    /// Feed a snapshot of the partial input. Cheap; called per keystroke
    /// batch.
    pub fn observe_partial(&self, text: &str) {
        let _ = self.tx.send(text.to_string());
    }
}

async fn run(
    pool: Arc<ModelPool>,
    classifier: Arc<Classifier>,
    settings: Arc<Settings>,
    mut rx: mpsc::UnboundedReceiver<String>,
    debounce: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut latest: Option<String> = None;
    loop {
        tokio::select! {
            received = rx.recv() => match received {
                // Each new snapshot restarts the quiet period.
                Some(text) => latest = Some(text),
                None => break,
            },
            _ = tokio::time::sleep(debounce), if latest.is_some() => {
                let text = latest.take().unwrap_or_default();
                let scores = classifier.quick_classify(&text);
                if let Some(name) = predict_model(&scores, &settings) {
                    tracing::debug!(model = %name, "prefetch predicted");
                    pool.prefetch(&name);
                }
            },
            _ = shutdown.changed() => break,
        }
    }
}

/// Map quick scores onto the model the full router would most plausibly
/// pick. Less precise than real routing; a wrong guess only costs a
/// discarded prefetch.
fn predict_model(scores: &ScoreVector, settings: &Settings) -> Option<String> {
    let router = &settings.router;
    if scores.get(AXIS_PROGRAMMING) >= router.code_threshold.max(SKILL_THRESHOLD) {
        return Some(router.code_model.clone());
    }
    if scores.web_query() > router.web_threshold {
        return Some(router.web_model.clone());
    }
    if scores.soft() > 0.7 && scores.hard() < 0.4 {
        return Some(router.empathic_model.clone());
    }
    if scores.hard() > 0.7 {
        return Some(settings.cascade.tier1_model.clone());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::ClassifierMode;
    use crate::request::{AXIS_HARD, AXIS_SOFT, AXIS_WEB_QUERY};

    fn scores(pairs: &[(&str, f64)]) -> ScoreVector {
        let mut s = ScoreVector::new();
        for (axis, v) in pairs {
            s.set(axis, *v);
        }
        s
    }

    #[test]
    fn programming_predicts_code_model() {
        let settings = Settings::default();
        let s = scores(&[(AXIS_PROGRAMMING, 0.9), (AXIS_HARD, 0.8)]);
        assert_eq!(predict_model(&s, &settings), Some("code".to_string()));
    }

    #[test]
    fn web_predicts_web_model() {
        let settings = Settings::default();
        let s = scores(&[(AXIS_WEB_QUERY, 0.9)]);
        assert_eq!(predict_model(&s, &settings), Some("expert_short".to_string()));
    }

    #[test]
    fn soft_predicts_empathic_model() {
        let settings = Settings::default();
        let s = scores(&[(AXIS_SOFT, 0.85), (AXIS_HARD, 0.1)]);
        assert_eq!(predict_model(&s, &settings), Some("expert_short".to_string()));
    }

    #[test]
    fn weak_signal_predicts_nothing() {
        let settings = Settings::default();
        let s = scores(&[(AXIS_HARD, 0.3), (AXIS_SOFT, 0.3)]);
        assert_eq!(predict_model(&s, &settings), None);
    }

    #[test]
    fn quick_classification_of_code_prefix_predicts_code() {
        let settings = Settings::default();
        let classifier = Classifier::new(ClassifierMode::Cold);
        let s = classifier.quick_classify("Write a Python function");
        assert_eq!(predict_model(&s, &settings), Some("code".to_string()));
    }
}
