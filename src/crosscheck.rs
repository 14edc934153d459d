//! Second opinion on each clip's emotion, taken from the words in its name.

use crate::error::{EmotagError, Result};
use crate::recognize::{normalize_label, TextClassifier};
use crate::results::{read_result_log, write_result_log, ResultLog, SchemaVersion};
use futures::stream::{FuturesUnordered, StreamExt};
use regex::Regex;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn, Instrument};

/// Text classifier labels and their audio-label equivalents.
pub const LABEL_MAP: &[(&str, &str)] = &[
    ("高兴", "开心"),
    ("喜好", "开心"),
    ("悲伤", "难过"),
    ("愤怒", "生气"),
    ("厌恶", "厌恶"),
    ("恐惧", "恐惧"),
    ("惊讶", "吃惊"),
];

/// Translate a text classifier label into the audio label space.
pub fn map_text_label(label: &str) -> &str {
    LABEL_MAP
        .iter()
        .find(|(from, _)| *from == label)
        .map(|(_, to)| *to)
        .unwrap_or(label)
}

fn han_regex() -> &'static Regex {
    static HAN: OnceLock<Regex> = OnceLock::new();
    HAN.get_or_init(|| Regex::new(r"\p{Han}+").expect("Invalid regex"))
}

/// Han characters of `text`, concatenated; `None` when there are none.
pub fn extract_script_text(text: &str) -> Option<String> {
    let joined: String = han_regex().find_iter(text).map(|m| m.as_str()).collect();
    if joined.is_empty() {
        None
    } else {
        Some(joined)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrossCheckReport {
    pub classified: usize,
    /// Records whose name holds no Han text.
    pub no_script: usize,
    pub failed: usize,
    pub already_set: usize,
}

enum Outcome {
    Classified(String),
    NoScript,
    Failed,
}

pub struct CrossChecker {
    classifier: Arc<dyn TextClassifier>,
    max_workers: usize,
}

impl CrossChecker {
    pub fn new(classifier: Box<dyn TextClassifier>, max_workers: usize) -> Self {
        Self {
            classifier: Arc::from(classifier),
            max_workers: max_workers.max(1),
        }
    }

    /// Fill the `TextEmotion` column of the log at `log_path`.
    pub async fn run(&self, log_path: &Path) -> Result<CrossCheckReport> {
        let span = tracing::info_span!("stage", name = "crosscheck");
        self.run_inner(log_path).instrument(span).await
    }

    async fn run_inner(&self, log_path: &Path) -> Result<CrossCheckReport> {
        let mut log = read_result_log(log_path).await?;
        let mut report = CrossCheckReport::default();

        info!(
            "Cross-checking {} records with {}",
            log.records.len(),
            self.classifier.name()
        );

        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let mut futures = FuturesUnordered::new();

        for (index, record) in log.records.iter().enumerate() {
            if record.text_emotion.is_some() {
                report.already_set += 1;
                continue;
            }

            let stem = record
                .audio_path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let sem = semaphore.clone();
            let classifier = self.classifier.clone();

            futures.push(async move {
                let Some(text) = extract_script_text(&stem) else {
                    return (index, Outcome::NoScript);
                };
                let _permit = sem.acquire().await.ok();
                match classifier.classify(&text).await {
                    Ok(scores) => match scores.top() {
                        Some((label, _)) => {
                            let mapped = map_text_label(normalize_label(label)).to_string();
                            debug!("{} -> {}", text, mapped);
                            (index, Outcome::Classified(mapped))
                        }
                        None => (index, Outcome::Failed),
                    },
                    Err(e) => {
                        warn!(text = %text, "Text classification failed: {}", e);
                        (index, Outcome::Failed)
                    }
                }
            });
        }

        while let Some((index, outcome)) = futures.next().await {
            match outcome {
                Outcome::Classified(label) => {
                    log.records[index].text_emotion = Some(label);
                    report.classified += 1;
                }
                Outcome::NoScript => report.no_script += 1,
                Outcome::Failed => report.failed += 1,
            }
        }

        let updated = ResultLog {
            version: SchemaVersion::V2,
            records: log.records,
        };
        let path = log_path.to_path_buf();
        tokio::task::spawn_blocking(move || write_result_log(&path, &updated))
            .await
            .map_err(|e| EmotagError::Io(std::io::Error::other(e)))??;

        info!(
            "Cross-check complete: {} classified, {} without text, {} failed, {} already set",
            report.classified, report.no_script, report.failed, report.already_set
        );
        Ok(report)
    }
}
