use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use emotag::audio::WavDecoder;
use emotag::classify::Sorter;
use emotag::config::{Config, FolderLayout, RenameMethod, RetryPolicy, TransferMode};
use emotag::crosscheck::CrossChecker;
use emotag::filter::{filter_by_duration, FilterConfig};
use emotag::interactive::run_interactive_wizard;
use emotag::pipeline::{
    print_summary, run_pipeline_with_cancel, Backends, PipelineConfig, DEFAULT_LOG_PATH,
    DEFAULT_OUTPUT_DIR,
};
use emotag::recognize::{HttpRecognizer, HttpTextClassifier, RecognitionEngine};
use emotag::rename::{apply_renames, strategy_for};
use emotag::EmotagError;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "emotag")]
#[command(version, about = "Batch emotion tagging for reference audio clips")]
#[command(long_about = "Filter, rename, recognize and sort a folder tree of .wav clips by the emotion a recognition model hears in them.")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Keep clips whose duration is within a range
    Filter {
        /// Folder to scan
        input: PathBuf,

        /// Destination folder (filters in place when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[command(flatten)]
        durations: DurationArgs,

        /// Folder layout: flatten, mirror, mirror-root, auto
        #[arg(long)]
        layout: Option<String>,

        /// Move kept clips instead of copying them
        #[arg(long = "move")]
        move_files: bool,
    },

    /// Rename clips from sidecar label files or a manifest
    Rename {
        /// Folder holding the clips
        folder: PathBuf,

        #[command(flatten)]
        rename: RenameArgs,
    },

    /// Recognize the emotion of every clip and write the result log
    Recognize {
        /// Folder holding the clips
        folder: PathBuf,

        /// Result log path
        #[arg(short, long, default_value = DEFAULT_LOG_PATH)]
        output: PathBuf,

        #[command(flatten)]
        batching: BatchArgs,
    },

    /// Add text-derived labels to a result log
    Crosscheck {
        /// Result log to update
        log: PathBuf,

        /// Number of concurrent classifier requests
        #[arg(long)]
        max_workers: Option<usize>,
    },

    /// Sort clips into character/emotion folders from a result log
    Classify {
        /// Result log to read
        log: PathBuf,

        /// Root of the sorted tree
        #[arg(short, long, default_value = DEFAULT_OUTPUT_DIR)]
        output: PathBuf,

        /// Number of concurrent file operations
        #[arg(long)]
        max_workers: Option<usize>,

        /// Move clips instead of copying them
        #[arg(long = "move")]
        move_files: bool,

        /// Directory that relative paths in the log are resolved against
        #[arg(long)]
        source_root: Option<PathBuf>,
    },

    /// Run every stage from filtering to sorting
    Run {
        /// Folder to process
        input: PathBuf,

        #[command(flatten)]
        durations: DurationArgs,

        /// Use the input folder as is
        #[arg(long)]
        disable_filter: bool,

        /// Skip the rename stage
        #[arg(long, conflicts_with_all = ["rename_method", "manifest"])]
        no_rename: bool,

        #[command(flatten)]
        rename: RenameArgs,

        #[command(flatten)]
        batching: BatchArgs,

        /// Skip the text cross-check
        #[arg(long)]
        disable_text_emotion: bool,

        /// Folder layout of the filtered copy
        #[arg(long)]
        layout: Option<String>,

        /// Move clips into the sorted tree instead of copying them
        #[arg(long = "move")]
        move_files: bool,
    },

    /// Step-by-step wizard
    Interactive,
}

#[derive(Args)]
struct DurationArgs {
    /// Minimum clip duration in seconds
    #[arg(long)]
    min_duration: Option<f64>,

    /// Maximum clip duration in seconds
    #[arg(long)]
    max_duration: Option<f64>,
}

#[derive(Args)]
struct RenameArgs {
    /// Rename method: sidecar (lab) or manifest (list)
    #[arg(long)]
    rename_method: Option<String>,

    /// Manifest file for the manifest method
    #[arg(long)]
    manifest: Option<PathBuf>,
}

#[derive(Args)]
struct BatchArgs {
    /// Clips per model call
    #[arg(long)]
    batch_size: Option<usize>,

    /// Number of batches in flight
    #[arg(long)]
    max_workers: Option<usize>,

    /// Retry each clip of a failed batch on its own
    #[arg(long)]
    retry_individually: bool,
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}

fn parse_arg<T: std::str::FromStr<Err = String>>(value: Option<&str>) -> Result<Option<T>> {
    value
        .map(|v| v.parse().map_err(|e: String| anyhow::anyhow!(e)))
        .transpose()
}

impl DurationArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(min) = self.min_duration {
            config.min_duration = min;
        }
        if let Some(max) = self.max_duration {
            config.max_duration = max;
        }
    }
}

impl BatchArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(size) = self.batch_size {
            config.batch_size = size;
        }
        if let Some(workers) = self.max_workers {
            config.max_workers = workers;
        }
        if self.retry_individually {
            config.retry_policy = RetryPolicy::Individually;
        }
    }
}

impl RenameArgs {
    fn apply(&self, config: &mut Config) -> Result<()> {
        if let Some(method) = parse_arg::<RenameMethod>(self.rename_method.as_deref())? {
            config.rename_method = method;
        }
        Ok(())
    }
}

fn load_config() -> Result<Config> {
    Config::load().context("Failed to load configuration")
}

fn validated(config: Config) -> Result<Config> {
    config
        .validate()
        .context("Configuration validation failed")?;
    Ok(config)
}

fn cancel_flag() -> Arc<AtomicBool> {
    let cancelled = Arc::new(AtomicBool::new(false));
    let flag = cancelled.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        if flag.swap(true, Ordering::Relaxed) {
            std::process::exit(130);
        }
        eprintln!("\nStopping after the current stage (Ctrl+C again to quit now)");
    }) {
        warn!("Could not install Ctrl+C handler: {}", e);
    }
    cancelled
}

async fn run_filter(
    input: PathBuf,
    output: Option<PathBuf>,
    durations: DurationArgs,
    layout: Option<String>,
    move_files: bool,
) -> Result<()> {
    let mut config = load_config()?;
    durations.apply(&mut config);
    if let Some(layout) = parse_arg::<FolderLayout>(layout.as_deref())? {
        config.layout = layout;
    }
    let config = validated(config)?;

    let filter_config = FilterConfig {
        destination: output,
        min_duration: config.min_duration,
        max_duration: config.max_duration,
        layout: config.layout,
        mode: if move_files { TransferMode::Move } else { config.transfer_mode },
    };

    let report = tokio::task::spawn_blocking(move || {
        filter_by_duration(&input, &filter_config, &WavDecoder::new())
    })
    .await??;

    println!(
        "Kept {} of {} clips in {} ({} out of range, {} failed, {} already present)",
        report.kept,
        report.scanned,
        report.output_dir.display(),
        report.rejected,
        report.failed,
        report.existing
    );
    Ok(())
}

async fn run_rename(folder: PathBuf, rename: RenameArgs) -> Result<()> {
    let mut config = load_config()?;
    rename.apply(&mut config)?;
    let method = config.rename_method;
    let manifest = rename.manifest;

    let report = tokio::task::spawn_blocking(move || {
        let strategy = strategy_for(method, &folder, manifest.as_deref())?;
        apply_renames(strategy.as_ref())
    })
    .await??;

    println!(
        "Renamed {} clips ({} unchanged, {} rejected, {} missing, {} malformed)",
        report.renamed, report.unchanged, report.rejected, report.missing, report.malformed
    );
    Ok(())
}

async fn run_recognize(folder: PathBuf, output: PathBuf, batching: BatchArgs) -> Result<()> {
    let mut config = load_config()?;
    batching.apply(&mut config);
    let config = validated(config)?;

    let engine = RecognitionEngine::new(
        Box::new(HttpRecognizer::new(config.recognizer_url.clone())),
        Arc::new(WavDecoder::new()),
        config.batch_size,
        config.max_workers,
    )
    .with_sample_rate(config.sample_rate)
    .with_retry(config.retry_policy);

    let report = engine.run(&folder, &output).await?;
    println!(
        "Recognized {} of {} clips in {} batches ({:.1}s), results saved to {}",
        report.recognized,
        report.total_files,
        report.batches,
        report.elapsed.as_secs_f64(),
        report.log_path.display()
    );
    for clip in &report.failed {
        println!("  failed: {} ({})", clip.path.display(), clip.reason);
    }
    Ok(())
}

async fn run_crosscheck(log: PathBuf, max_workers: Option<usize>) -> Result<()> {
    let config = load_config()?;
    if config.text_classifier_url.trim().is_empty() {
        return Err(EmotagError::Config(
            "Text classifier URL not set. Export EMOTAG_TEXT_CLASSIFIER_URL=http://host:port"
                .to_string(),
        )
        .into());
    }

    let checker = CrossChecker::new(
        Box::new(HttpTextClassifier::new(config.text_classifier_url.clone())),
        max_workers.unwrap_or(config.max_workers),
    );
    let report = checker.run(&log).await?;
    println!(
        "Text labels added to {} records ({} without text, {} failed, {} already set)",
        report.classified, report.no_script, report.failed, report.already_set
    );
    Ok(())
}

async fn run_classify(
    log: PathBuf,
    output: PathBuf,
    max_workers: Option<usize>,
    move_files: bool,
    source_root: Option<PathBuf>,
) -> Result<()> {
    let config = load_config()?;
    let mode = if move_files { TransferMode::Move } else { config.transfer_mode };

    let mut sorter = Sorter::new(&output, max_workers.unwrap_or(config.max_workers))
        .with_mode(mode)
        .with_neutral_label(config.neutral_label.clone());
    if let Some(root) = &source_root {
        sorter = sorter.with_source_root(root);
    }
    let report = sorter.run(&log).await?;

    println!(
        "Sorted {} clips into {} ({} disagreements, {} collisions, {} missing, {} failed)",
        report.relocated,
        output.display(),
        report.disagreements,
        report.collisions,
        report.missing,
        report.failed
    );
    Ok(())
}

async fn run_all(input: PathBuf, config: Config, pipeline_config: PipelineConfig) -> Result<()> {
    info!("Input:    {}", input.display());
    info!("Service:  {}", config.recognizer_url);
    info!(
        "Batching: {} clips x {} workers",
        pipeline_config.batch_size, pipeline_config.max_workers
    );

    let backends = Backends::http(&config);
    let result = run_pipeline_with_cancel(&input, &pipeline_config, backends, cancel_flag()).await?;
    print_summary(&result);

    match result.fatal {
        Some(e) if e.is_missing_input() || matches!(e, EmotagError::Config(_)) => Err(e.into()),
        Some(e) => {
            error!("Pipeline stopped: {}", e);
            Ok(())
        }
        None => Ok(()),
    }
}

async fn dispatch(command: Command) -> Result<()> {
    match command {
        Command::Filter {
            input,
            output,
            durations,
            layout,
            move_files,
        } => run_filter(input, output, durations, layout, move_files).await,
        Command::Rename { folder, rename } => run_rename(folder, rename).await,
        Command::Recognize {
            folder,
            output,
            batching,
        } => run_recognize(folder, output, batching).await,
        Command::Crosscheck { log, max_workers } => run_crosscheck(log, max_workers).await,
        Command::Classify {
            log,
            output,
            max_workers,
            move_files,
            source_root,
        } => run_classify(log, output, max_workers, move_files, source_root).await,
        Command::Run {
            input,
            durations,
            disable_filter,
            no_rename,
            rename,
            batching,
            disable_text_emotion,
            layout,
            move_files,
        } => {
            let mut config = load_config()?;
            durations.apply(&mut config);
            batching.apply(&mut config);
            rename.apply(&mut config)?;
            if let Some(layout) = parse_arg::<FolderLayout>(layout.as_deref())? {
                config.layout = layout;
            }
            if move_files {
                config.transfer_mode = TransferMode::Move;
            }
            let config = validated(config)?;

            let mut pipeline_config = PipelineConfig::from_config(&config);
            pipeline_config.disable_filter = disable_filter;
            pipeline_config.text_emotion = !disable_text_emotion;
            pipeline_config.manifest = rename.manifest;
            if no_rename {
                pipeline_config.rename_method = None;
            }

            run_all(input, config, pipeline_config).await
        }
        Command::Interactive => {
            let wizard = run_interactive_wizard()?;
            let config = validated(wizard.config)?;
            run_all(wizard.input, config, wizard.pipeline_config).await
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    match dispatch(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_flags() {
        let cli = Cli::try_parse_from([
            "emotag",
            "run",
            "input",
            "--min-duration",
            "2.5",
            "--batch-size",
            "16",
            "--rename-method",
            "list",
            "--manifest",
            "names.list",
            "--disable-text-emotion",
            "--retry-individually",
        ])
        .unwrap();

        let Command::Run {
            durations,
            rename,
            batching,
            disable_text_emotion,
            ..
        } = cli.command
        else {
            panic!("expected run");
        };

        let mut config = Config::default();
        durations.apply(&mut config);
        batching.apply(&mut config);
        rename.apply(&mut config).unwrap();

        assert_eq!(config.min_duration, 2.5);
        assert_eq!(config.max_duration, 10.0);
        assert_eq!(config.batch_size, 16);
        assert_eq!(config.retry_policy, RetryPolicy::Individually);
        assert_eq!(config.rename_method, RenameMethod::Manifest);
        assert_eq!(rename.manifest, Some(PathBuf::from("names.list")));
        assert!(disable_text_emotion);
    }

    #[test]
    fn test_parse_classify_source_root() {
        let cli = Cli::try_parse_from([
            "emotag",
            "classify",
            "results.csv",
            "--source-root",
            "dataset",
            "--move",
        ])
        .unwrap();

        let Command::Classify {
            log,
            move_files,
            source_root,
            ..
        } = cli.command
        else {
            panic!("expected classify");
        };

        assert_eq!(log, PathBuf::from("results.csv"));
        assert!(move_files);
        assert_eq!(source_root, Some(PathBuf::from("dataset")));
    }

    #[test]
    fn test_parse_arg_rejects_unknown() {
        assert!(parse_arg::<FolderLayout>(Some("sideways")).is_err());
        assert_eq!(
            parse_arg::<FolderLayout>(Some("flatten")).unwrap(),
            Some(FolderLayout::Flatten)
        );
        assert_eq!(parse_arg::<FolderLayout>(None).unwrap(), None);
    }
}
