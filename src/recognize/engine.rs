use crate::audio::{collect_audio_files, AudioDecoder, DecodedAudio};
use crate::config::{RetryPolicy, DEFAULT_SAMPLE_RATE};
use crate::error::{EmotagError, Result};
use crate::recognize::{normalize_label, EmotionScores, Recognizer};
use crate::results::{AudioFileRecord, ResultLogWriter, SchemaVersion};
use futures::stream::{FuturesUnordered, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn, Instrument};

/// An ordered group of clips submitted to the model together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub index: usize,
    pub paths: Vec<PathBuf>,
}

/// Split `paths` into consecutive batches of at most `batch_size` clips.
pub fn plan_batches(paths: Vec<PathBuf>, batch_size: usize) -> Vec<Batch> {
    let batch_size = batch_size.max(1);
    let mut batches = Vec::with_capacity(paths.len().div_ceil(batch_size));
    let mut current = Vec::with_capacity(batch_size);

    for path in paths {
        current.push(path);
        if current.len() == batch_size {
            batches.push(Batch {
                index: batches.len(),
                paths: std::mem::replace(&mut current, Vec::with_capacity(batch_size)),
            });
        }
    }
    if !current.is_empty() {
        batches.push(Batch {
            index: batches.len(),
            paths: current,
        });
    }

    batches
}

/// A clip that did not make it into the result log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedClip {
    pub path: PathBuf,
    pub reason: String,
}

/// Result of processing one batch.
#[derive(Debug)]
struct BatchOutcome {
    index: usize,
    records: Vec<AudioFileRecord>,
    failed: Vec<FailedClip>,
    duration_ms: u64,
}

/// Statistics from a recognition run.
#[derive(Debug, Clone)]
pub struct RecognitionReport {
    pub total_files: usize,
    pub batches: usize,
    /// Rows written to the result log.
    pub recognized: usize,
    pub failed: Vec<FailedClip>,
    pub elapsed: Duration,
    pub log_path: PathBuf,
}

/// Runs the recognition model over a folder of clips in bounded concurrent
/// batches and streams the results into a result log.
pub struct RecognitionEngine {
    recognizer: Arc<dyn Recognizer>,
    decoder: Arc<dyn AudioDecoder>,
    batch_size: usize,
    max_workers: usize,
    sample_rate: u32,
    retry: RetryPolicy,
    show_progress: bool,
}

impl RecognitionEngine {
    pub fn new(
        recognizer: Box<dyn Recognizer>,
        decoder: Arc<dyn AudioDecoder>,
        batch_size: usize,
        max_workers: usize,
    ) -> Self {
        Self {
            recognizer: Arc::from(recognizer),
            decoder,
            batch_size,
            max_workers,
            sample_rate: DEFAULT_SAMPLE_RATE,
            retry: RetryPolicy::default(),
            show_progress: true,
        }
    }

    /// Enable or disable progress bar display.
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Sample rate every clip is resampled to before inference.
    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Recognize every clip under `folder` and write the results to `log_path`.
    ///
    /// Batches complete in any order; each one is appended to the log as
    /// soon as it finishes. A failing batch only loses its own clips.
    pub async fn run(&self, folder: &Path, log_path: &Path) -> Result<RecognitionReport> {
        let span = tracing::info_span!("stage", name = "recognize");
        self.run_inner(folder, log_path).instrument(span).await
    }

    async fn run_inner(&self, folder: &Path, log_path: &Path) -> Result<RecognitionReport> {
        if !folder.is_dir() {
            return Err(EmotagError::MissingInput(folder.display().to_string()));
        }
        if self.batch_size == 0 || self.max_workers == 0 {
            return Err(EmotagError::Config(
                "Batch size and max workers must be greater than 0".to_string(),
            ));
        }

        let start_time = Instant::now();
        let paths = collect_audio_files(folder);
        let total_files = paths.len();
        let batches = plan_batches(paths, self.batch_size);
        let total_batches = batches.len();

        info!(
            "Recognizing {} clips in {} batches of up to {} with {} workers using {}",
            total_files,
            total_batches,
            self.batch_size,
            self.max_workers,
            self.recognizer.name()
        );

        let writer = ResultLogWriter::create(log_path, SchemaVersion::V1).await?;
        let sender = writer.sender();

        let progress_bar = if self.show_progress && total_batches > 0 {
            let pb = ProgressBar::new(total_batches as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} batches ({eta})")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("#>-"),
            );
            Some(pb)
        } else {
            None
        };

        // Use semaphore to limit concurrency
        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let mut futures = FuturesUnordered::new();

        for batch in batches {
            let sem = semaphore.clone();
            futures.push(async move {
                // Acquire permit (waits if at concurrency limit)
                let _permit = sem.acquire().await.ok();
                self.process_batch(batch).await
            });
        }

        let mut failed = Vec::new();
        let mut total_batch_ms: u64 = 0;

        while let Some(outcome) = futures.next().await {
            total_batch_ms += outcome.duration_ms;
            debug!(
                "Batch {} finished in {}ms: {} recognized, {} failed",
                outcome.index,
                outcome.duration_ms,
                outcome.records.len(),
                outcome.failed.len()
            );

            failed.extend(outcome.failed);
            if !outcome.records.is_empty() && sender.send(outcome.records).await.is_err() {
                // The writer only stops on an I/O error, reported by finish().
                warn!("Result log writer stopped, batch {} not logged", outcome.index);
            }

            if let Some(ref pb) = progress_bar {
                pb.inc(1);
            }
        }

        if let Some(pb) = progress_bar {
            pb.finish_with_message("Recognition complete");
        }

        drop(sender);
        let summary = writer.finish().await?;
        failed.extend(summary.rejected.into_iter().map(|r| FailedClip {
            path: r.path,
            reason: r.reason,
        }));
        let elapsed = start_time.elapsed();

        info!(
            "Recognition complete: {}/{} clips logged, {} failed in {:.2}s (avg {:.2}s/batch)",
            summary.written,
            total_files,
            failed.len(),
            elapsed.as_secs_f64(),
            if total_batches > 0 {
                total_batch_ms as f64 / total_batches as f64 / 1000.0
            } else {
                0.0
            }
        );

        Ok(RecognitionReport {
            total_files,
            batches: total_batches,
            recognized: summary.written,
            failed,
            elapsed,
            log_path: log_path.to_path_buf(),
        })
    }

    async fn process_batch(&self, batch: Batch) -> BatchOutcome {
        let batch_start = Instant::now();
        let index = batch.index;
        debug!("Starting batch {} ({} clips)", index, batch.paths.len());

        let (paths, audio, mut failed) = self.decode_batch(batch.paths).await;
        let mut records = Vec::new();

        if !paths.is_empty() {
            match self.infer(&paths, &audio).await {
                Ok((ok, bad)) => {
                    records = ok;
                    failed.extend(bad);
                }
                Err(e) => {
                    warn!("Batch {} failed: {}", index, e);
                    match self.retry {
                        RetryPolicy::None => failed.extend(paths.iter().map(|p| FailedClip {
                            path: p.clone(),
                            reason: e.to_string(),
                        })),
                        RetryPolicy::Individually => {
                            let (ok, bad) = self.retry_individually(&paths, &audio).await;
                            records = ok;
                            failed.extend(bad);
                        }
                    }
                }
            }
        }

        for clip in &failed {
            warn!(path = %clip.path.display(), "Not recognized: {}", clip.reason);
        }

        BatchOutcome {
            index,
            records,
            failed,
            duration_ms: batch_start.elapsed().as_millis() as u64,
        }
    }

    /// Decode and resample every clip on the blocking pool.
    ///
    /// Clips that fail to decode are split off; the rest keep their order.
    async fn decode_batch(&self, paths: Vec<PathBuf>) -> (Vec<PathBuf>, Vec<DecodedAudio>, Vec<FailedClip>) {
        let decoder = self.decoder.clone();
        let sample_rate = self.sample_rate;
        let fallback = paths.clone();

        let decoded = tokio::task::spawn_blocking(move || {
            paths
                .into_iter()
                .map(|path| {
                    let result = decoder.load(&path).map(|a| a.resampled(sample_rate));
                    (path, result)
                })
                .collect::<Vec<_>>()
        })
        .await;

        let mut ok_paths = Vec::new();
        let mut audio = Vec::new();
        let mut failed = Vec::new();

        match decoded {
            Ok(results) => {
                for (path, result) in results {
                    match result {
                        Ok(a) => {
                            ok_paths.push(path);
                            audio.push(a);
                        }
                        Err(e) => failed.push(FailedClip {
                            path,
                            reason: e.to_string(),
                        }),
                    }
                }
            }
            Err(e) => {
                failed.extend(fallback.into_iter().map(|path| FailedClip {
                    path,
                    reason: format!("decoder task failed: {}", e),
                }));
            }
        }

        (ok_paths, audio, failed)
    }

    /// One model call for the whole batch.
    async fn infer(
        &self,
        paths: &[PathBuf],
        audio: &[DecodedAudio],
    ) -> Result<(Vec<AudioFileRecord>, Vec<FailedClip>)> {
        let results = self.recognizer.infer(audio, self.sample_rate).await?;
        if results.len() != paths.len() {
            return Err(EmotagError::Recognition(format!(
                "{} returned {} results for {} clips",
                self.recognizer.name(),
                results.len(),
                paths.len()
            )));
        }
        Ok(reduce_results(paths, &results))
    }

    async fn retry_individually(
        &self,
        paths: &[PathBuf],
        audio: &[DecodedAudio],
    ) -> (Vec<AudioFileRecord>, Vec<FailedClip>) {
        let mut records = Vec::new();
        let mut failed = Vec::new();

        for i in 0..paths.len() {
            match self.infer(&paths[i..=i], &audio[i..=i]).await {
                Ok((ok, bad)) => {
                    records.extend(ok);
                    failed.extend(bad);
                }
                Err(e) => failed.push(FailedClip {
                    path: paths[i].clone(),
                    reason: format!("retry failed: {}", e),
                }),
            }
        }

        debug!(
            "Individual retry recovered {}/{} clips",
            records.len(),
            paths.len()
        );
        (records, failed)
    }
}

/// Pair model results with their clips and keep the top label of each.
pub fn reduce_results(
    paths: &[PathBuf],
    results: &[EmotionScores],
) -> (Vec<AudioFileRecord>, Vec<FailedClip>) {
    let mut records = Vec::with_capacity(paths.len());
    let mut failed = Vec::new();

    for (path, scores) in paths.iter().zip(results) {
        match scores.top() {
            Some((label, confidence)) => records.push(AudioFileRecord::new(
                path.clone(),
                normalize_label(label),
                confidence,
            )),
            None => failed.push(FailedClip {
                path: path.clone(),
                reason: "model returned no scores".to_string(),
            }),
        }
    }

    (records, failed)
}
