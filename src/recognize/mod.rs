pub mod engine;
pub mod service;

pub use engine::{plan_batches, Batch, FailedClip, RecognitionEngine, RecognitionReport};
pub use service::{HttpRecognizer, HttpTextClassifier};

use crate::audio::DecodedAudio;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Class scores returned by a model for one input.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EmotionScores {
    pub labels: Vec<String>,
    pub scores: Vec<f32>,
}

impl EmotionScores {
    pub fn new(labels: Vec<String>, scores: Vec<f32>) -> Self {
        Self { labels, scores }
    }

    /// Label with the highest score; the first one wins on ties.
    pub fn top(&self) -> Option<(&str, f32)> {
        let mut best: Option<(&str, f32)> = None;
        for (label, &score) in self.labels.iter().zip(&self.scores) {
            if score.is_nan() {
                continue;
            }
            match best {
                Some((_, s)) if score <= s => {}
                _ => best = Some((label.as_str(), score)),
            }
        }
        best
    }
}

/// Reduce bilingual model labels such as `开心/happy` to their first part.
pub fn normalize_label(label: &str) -> &str {
    label.split('/').next().unwrap_or(label).trim()
}

/// Audio emotion recognition model.
#[async_trait]
pub trait Recognizer: Send + Sync {
    /// Score every clip of `batch`; result `i` belongs to clip `i`.
    async fn infer(&self, batch: &[DecodedAudio], sample_rate: u32) -> Result<Vec<EmotionScores>>;
    fn name(&self) -> &'static str;
}

/// Text emotion classifier used to cross-check filenames.
#[async_trait]
pub trait TextClassifier: Send + Sync {
    async fn classify(&self, text: &str) -> Result<EmotionScores>;
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scores(pairs: &[(&str, f32)]) -> EmotionScores {
        EmotionScores::new(
            pairs.iter().map(|(l, _)| l.to_string()).collect(),
            pairs.iter().map(|(_, s)| *s).collect(),
        )
    }

    #[test]
    fn test_top_picks_max() {
        let s = scores(&[("生气/angry", 0.1), ("开心/happy", 0.7), ("难过/sad", 0.2)]);
        assert_eq!(s.top(), Some(("开心/happy", 0.7)));
    }

    #[test]
    fn test_top_first_wins_on_tie() {
        let s = scores(&[("a", 0.5), ("b", 0.5)]);
        assert_eq!(s.top(), Some(("a", 0.5)));
    }

    #[test]
    fn test_top_skips_nan_and_empty() {
        let s = scores(&[("a", f32::NAN), ("b", 0.2)]);
        assert_eq!(s.top(), Some(("b", 0.2)));
        assert_eq!(EmotionScores::default().top(), None);
    }

    #[test]
    fn test_normalize_label() {
        assert_eq!(normalize_label("开心/happy"), "开心");
        assert_eq!(normalize_label("中立"), "中立");
        assert_eq!(normalize_label("<unk>"), "<unk>");
    }
}
