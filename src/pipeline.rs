use crate::audio::{AudioDecoder, WavDecoder};
use crate::classify::{SortReport, Sorter};
use crate::config::{Config, FolderLayout, RenameMethod, RetryPolicy, TransferMode};
use crate::crosscheck::{CrossCheckReport, CrossChecker};
use crate::error::{EmotagError, Result};
use crate::filter::{filter_by_duration, FilterConfig, FilterReport};
use crate::recognize::{
    HttpRecognizer, HttpTextClassifier, RecognitionEngine, RecognitionReport, Recognizer,
    TextClassifier,
};
use crate::rename::{apply_renames, strategy_for, RenameReport};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Default folder for clips kept by the duration filter.
pub const DEFAULT_FILTERED_DIR: &str = "referenceaudio";

/// Default result log location.
pub const DEFAULT_LOG_PATH: &str = "csv_opt/recognition_result.csv";

/// Default root of the sorted output tree.
pub const DEFAULT_OUTPUT_DIR: &str = "output";

/// Configuration for an end-to-end run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Destination of the duration filter.
    pub filtered_dir: PathBuf,
    /// Result log shared by the recognition, cross-check and sort stages.
    pub log_path: PathBuf,
    /// Root of the sorted output tree.
    pub output_dir: PathBuf,
    /// Skip the duration filter and work on the input folder directly.
    pub disable_filter: bool,
    pub min_duration: f64,
    pub max_duration: f64,
    pub layout: FolderLayout,
    /// `None` skips the rename stage.
    pub rename_method: Option<RenameMethod>,
    pub manifest: Option<PathBuf>,
    pub batch_size: usize,
    pub max_workers: usize,
    pub sample_rate: u32,
    pub retry: RetryPolicy,
    /// Run the text cross-check stage when a text classifier is available.
    pub text_emotion: bool,
    pub neutral_label: String,
    /// How the sorter materializes clips.
    pub sort_mode: TransferMode,
    /// Show progress bars.
    pub show_progress: bool,
}

impl PipelineConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            filtered_dir: PathBuf::from(DEFAULT_FILTERED_DIR),
            log_path: PathBuf::from(DEFAULT_LOG_PATH),
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            disable_filter: false,
            min_duration: config.min_duration,
            max_duration: config.max_duration,
            layout: config.layout,
            rename_method: Some(config.rename_method),
            manifest: None,
            batch_size: config.batch_size,
            max_workers: config.max_workers,
            sample_rate: config.sample_rate,
            retry: config.retry_policy,
            text_emotion: true,
            neutral_label: config.neutral_label.clone(),
            sort_mode: config.transfer_mode,
            show_progress: true,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Model bindings used by a run.
pub struct Backends {
    pub recognizer: Box<dyn Recognizer>,
    pub text_classifier: Option<Box<dyn TextClassifier>>,
    pub decoder: Arc<dyn AudioDecoder>,
}

impl Backends {
    /// HTTP services from `config`, WAV decoding with hound.
    pub fn http(config: &Config) -> Self {
        // Both services share one connection pool.
        let client = reqwest::Client::new();

        let text_classifier: Option<Box<dyn TextClassifier>> =
            if config.text_classifier_url.trim().is_empty() {
                None
            } else {
                Some(Box::new(
                    HttpTextClassifier::new(config.text_classifier_url.clone())
                        .with_client(client.clone()),
                ))
            };

        Self {
            recognizer: Box::new(
                HttpRecognizer::new(config.recognizer_url.clone()).with_client(client),
            ),
            text_classifier,
            decoder: Arc::new(WavDecoder::new()),
        }
    }
}

/// Per-stage reports of a run. A stage that did not run has no report.
#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    pub total_time: Duration,
    pub filter: Option<FilterReport>,
    pub rename: Option<RenameReport>,
    pub recognition: Option<RecognitionReport>,
    pub crosscheck: Option<CrossCheckReport>,
    pub sort: Option<SortReport>,
}

/// Result of a pipeline run.
#[derive(Debug)]
pub struct PipelineResult {
    /// One human-readable line per stage, in run order.
    pub messages: Vec<String>,
    pub stats: PipelineStats,
    /// Stage-fatal error that stopped the run early.
    pub fatal: Option<EmotagError>,
    pub cancelled: bool,
}

impl PipelineResult {
    pub fn completed(&self) -> bool {
        self.fatal.is_none() && !self.cancelled
    }
}

/// Run every stage from filtering to sorting on `input`.
pub async fn run_pipeline(
    input: &Path,
    config: &PipelineConfig,
    backends: Backends,
) -> Result<PipelineResult> {
    let cancelled = Arc::new(AtomicBool::new(false));
    run_pipeline_with_cancel(input, config, backends, cancelled).await
}

/// Run the pipeline, stopping before the next stage once `cancelled` is set.
///
/// A missing input folder or an invalid configuration is returned as an
/// error. A stage-fatal error later on stops the run; it is reported in
/// `PipelineResult::fatal` together with the messages gathered so far.
pub async fn run_pipeline_with_cancel(
    input: &Path,
    config: &PipelineConfig,
    backends: Backends,
    cancelled: Arc<AtomicBool>,
) -> Result<PipelineResult> {
    let start_time = Instant::now();

    if !input.is_dir() {
        return Err(EmotagError::MissingInput(input.display().to_string()));
    }
    if config.batch_size == 0 || config.max_workers == 0 {
        return Err(EmotagError::Config(
            "Batch size and max workers must be greater than 0".to_string(),
        ));
    }
    if !(config.min_duration >= 0.0 && config.min_duration <= config.max_duration) {
        return Err(EmotagError::Config(format!(
            "Invalid duration range [{}, {}]",
            config.min_duration, config.max_duration
        )));
    }

    let Backends {
        recognizer,
        text_classifier,
        decoder,
    } = backends;

    let mut result = PipelineResult {
        messages: Vec::new(),
        stats: PipelineStats::default(),
        fatal: None,
        cancelled: false,
    };

    // ═══════════════════════════════════════════════════════════════════════
    // Stage 1: Duration filter
    // ═══════════════════════════════════════════════════════════════════════
    let audio_folder = if config.disable_filter {
        result.messages.push("Duration filter skipped.".to_string());
        input.to_path_buf()
    } else {
        info!(
            "Stage 1/5: Filtering {:?} to {:.1}-{:.1}s",
            input, config.min_duration, config.max_duration
        );
        let filter_config = FilterConfig {
            destination: Some(config.filtered_dir.clone()),
            min_duration: config.min_duration,
            max_duration: config.max_duration,
            layout: config.layout,
            mode: TransferMode::Copy,
        };
        let source = input.to_path_buf();
        let filter_decoder = decoder.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            filter_by_duration(&source, &filter_config, filter_decoder.as_ref())
        })
        .await
        .map_err(|e| EmotagError::Io(std::io::Error::other(e)))?;

        match outcome {
            Ok(report) => {
                result.messages.push(format!(
                    "Duration filter kept {} of {} clips in {}.",
                    report.kept,
                    report.scanned,
                    report.output_dir.display()
                ));
                let folder = report.output_dir.clone();
                // Nothing kept still hands an (empty) folder to recognition.
                tokio::fs::create_dir_all(&folder).await?;
                result.stats.filter = Some(report);
                folder
            }
            Err(e) => return Ok(abort(result, "Duration filter", e, start_time)),
        }
    };

    if stop_requested(&cancelled, &mut result) {
        return Ok(finish(result, start_time));
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Stage 2: Rename
    // ═══════════════════════════════════════════════════════════════════════
    match config.rename_method {
        None => result.messages.push("Rename skipped.".to_string()),
        Some(method) => {
            info!("Stage 2/5: Renaming clips ({})", method);
            let root = audio_folder.clone();
            let manifest = config.manifest.clone();
            let outcome = tokio::task::spawn_blocking(move || {
                let strategy = strategy_for(method, &root, manifest.as_deref())?;
                apply_renames(strategy.as_ref())
            })
            .await
            .map_err(|e| EmotagError::Io(std::io::Error::other(e)))?;

            match outcome {
                Ok(report) => {
                    result.messages.push(format!(
                        "Renamed {} clips from {} metadata ({} unchanged, {} rejected, {} missing).",
                        report.renamed, method, report.unchanged, report.rejected, report.missing
                    ));
                    result.stats.rename = Some(report);
                }
                Err(e) => return Ok(abort(result, "Rename", e, start_time)),
            }
        }
    }

    if stop_requested(&cancelled, &mut result) {
        return Ok(finish(result, start_time));
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Stage 3: Recognition
    // ═══════════════════════════════════════════════════════════════════════
    info!(
        "Stage 3/5: Recognizing with {} (batch size: {}, workers: {})",
        recognizer.name(),
        config.batch_size,
        config.max_workers
    );
    let engine = RecognitionEngine::new(recognizer, decoder, config.batch_size, config.max_workers)
        .with_sample_rate(config.sample_rate)
        .with_retry(config.retry)
        .with_progress(config.show_progress);

    match engine.run(&audio_folder, &config.log_path).await {
        Ok(report) => {
            result.messages.push(format!(
                "Recognized {} of {} clips, results saved to {}.",
                report.recognized,
                report.total_files,
                report.log_path.display()
            ));
            result.stats.recognition = Some(report);
        }
        Err(e) => return Ok(abort(result, "Recognition", e, start_time)),
    }

    if stop_requested(&cancelled, &mut result) {
        return Ok(finish(result, start_time));
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Stage 4: Text cross-check
    // ═══════════════════════════════════════════════════════════════════════
    match (config.text_emotion, text_classifier) {
        (true, Some(classifier)) => {
            info!("Stage 4/5: Cross-checking labels with {}", classifier.name());
            let checker = CrossChecker::new(classifier, config.max_workers);
            match checker.run(&config.log_path).await {
                Ok(report) => {
                    result.messages.push(format!(
                        "Text labels added to {} records ({} without text, {} failed).",
                        report.classified, report.no_script, report.failed
                    ));
                    result.stats.crosscheck = Some(report);
                }
                Err(e) => return Ok(abort(result, "Text cross-check", e, start_time)),
            }
        }
        _ => result.messages.push("Text cross-check skipped.".to_string()),
    }

    if stop_requested(&cancelled, &mut result) {
        return Ok(finish(result, start_time));
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Stage 5: Sort
    // ═══════════════════════════════════════════════════════════════════════
    info!("Stage 5/5: Sorting into {:?}", config.output_dir);
    let sorter = Sorter::new(&config.output_dir, config.max_workers)
        .with_mode(config.sort_mode)
        .with_neutral_label(config.neutral_label.clone())
        .with_progress(config.show_progress);

    match sorter.run(&config.log_path).await {
        Ok(report) => {
            result.messages.push(format!(
                "Sorted {} clips into {} ({} held back on label disagreement).",
                report.relocated,
                config.output_dir.display(),
                report.disagreements
            ));
            result.stats.sort = Some(report);
        }
        Err(e) => return Ok(abort(result, "Sort", e, start_time)),
    }

    Ok(finish(result, start_time))
}

fn stop_requested(cancelled: &AtomicBool, result: &mut PipelineResult) -> bool {
    if cancelled.load(Ordering::Relaxed) {
        warn!("Pipeline cancelled, remaining stages skipped");
        result.messages.push("Cancelled.".to_string());
        result.cancelled = true;
    }
    result.cancelled
}

fn abort(mut result: PipelineResult, stage: &str, error: EmotagError, start_time: Instant) -> PipelineResult {
    warn!("{} failed, downstream stages skipped: {}", stage, error);
    result.messages.push(format!("{} failed: {}", stage, error));
    result.fatal = Some(error);
    finish(result, start_time)
}

fn finish(mut result: PipelineResult, start_time: Instant) -> PipelineResult {
    result.stats.total_time = start_time.elapsed();
    result
}

/// Print a summary of the pipeline results.
pub fn print_summary(result: &PipelineResult) {
    let title = if result.completed() {
        "                   Emotion Tagging Complete                    "
    } else {
        "                   Emotion Tagging Stopped                     "
    };

    println!();
    println!("═══════════════════════════════════════════════════════════════");
    println!("{}", title);
    println!("═══════════════════════════════════════════════════════════════");
    println!();
    for message in &result.messages {
        println!("  {}", message);
    }

    if let Some(ref recognition) = result.stats.recognition {
        println!();
        println!("  Recognition:");
        println!(
            "    Batches:     {} ({} clips)",
            recognition.batches, recognition.total_files
        );
        println!("    Failed:      {}", recognition.failed.len());
        println!(
            "    Time:        {:.2}s",
            recognition.elapsed.as_secs_f64()
        );
    }
    if let Some(ref sort) = result.stats.sort {
        println!();
        println!("  Sorting:");
        println!("    Relocated:   {}", sort.relocated);
        println!("    Disagreed:   {}", sort.disagreements);
        println!("    Collisions:  {}", sort.collisions);
        println!("    Missing:     {}", sort.missing);
    }

    println!();
    println!("  Total:         {:.2}s", result.stats.total_time.as_secs_f64());
    println!();
    println!("═══════════════════════════════════════════════════════════════");
}
