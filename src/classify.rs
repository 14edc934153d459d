//! Final stage: reconcile audio and text labels and sort clips into
//! per-character, per-emotion folders.

use crate::config::{TransferMode, DEFAULT_NEUTRAL_LABEL};
use crate::error::{EmotagError, Result};
use crate::rename::sanitize_filename;
use crate::results::{read_result_log, AudioFileRecord};
use futures::stream::{FuturesUnordered, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn, Instrument};

/// What the sorter does with one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Relocate,
    /// The text label contradicts a non-neutral audio label.
    Disagree { audio: String, text: String },
}

/// Decide whether `record` is relocated.
///
/// A clip is held back only when its text label is present, differs from
/// the audio label, and the audio label is not `neutral`.
pub fn decide(record: &AudioFileRecord, neutral: &str) -> Decision {
    match record.text_emotion.as_deref() {
        Some(text)
            if !text.is_empty() && text != record.audio_emotion && record.audio_emotion != neutral =>
        {
            Decision::Disagree {
                audio: record.audio_emotion.clone(),
                text: text.to_string(),
            }
        }
        _ => Decision::Relocate,
    }
}

/// `dest/<character>/<emotion>/【<emotion>】<file name>`
pub fn destination_for(dest_root: &Path, record: &AudioFileRecord) -> PathBuf {
    let emotion = sanitize_filename(&record.audio_emotion);
    let file_name = record
        .audio_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    dest_root
        .join(sanitize_filename(&record.parent_folder))
        .join(&emotion)
        .join(format!("【{}】{}", emotion, file_name))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SortReport {
    pub relocated: usize,
    pub disagreements: usize,
    /// Destination already present.
    pub collisions: usize,
    /// Source clip no longer on disk.
    pub missing: usize,
    pub failed: usize,
}

#[derive(Debug)]
enum Outcome {
    Relocated,
    Collision,
    Missing,
    Failed,
}

pub struct Sorter {
    dest_root: PathBuf,
    max_workers: usize,
    mode: TransferMode,
    neutral_label: String,
    source_root: Option<PathBuf>,
    show_progress: bool,
}

impl Sorter {
    pub fn new(dest_root: &Path, max_workers: usize) -> Self {
        Self {
            dest_root: dest_root.to_path_buf(),
            max_workers: max_workers.max(1),
            mode: TransferMode::Copy,
            neutral_label: DEFAULT_NEUTRAL_LABEL.to_string(),
            source_root: None,
            show_progress: true,
        }
    }

    pub fn with_mode(mut self, mode: TransferMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_neutral_label(mut self, label: impl Into<String>) -> Self {
        self.neutral_label = label.into();
        self
    }

    /// Resolve relative clip paths in the log against `root`.
    pub fn with_source_root(mut self, root: &Path) -> Self {
        self.source_root = Some(root.to_path_buf());
        self
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    fn source_path(&self, audio_path: &Path) -> PathBuf {
        match &self.source_root {
            Some(root) if audio_path.is_relative() => root.join(audio_path),
            _ => audio_path.to_path_buf(),
        }
    }

    /// Sort every record of the log at `log_path` into the destination tree.
    pub async fn run(&self, log_path: &Path) -> Result<SortReport> {
        let span = tracing::info_span!("stage", name = "classify");
        self.run_inner(log_path).instrument(span).await
    }

    async fn run_inner(&self, log_path: &Path) -> Result<SortReport> {
        let log = read_result_log(log_path).await?;
        let mut report = SortReport::default();

        info!(
            "Sorting {} records into {} ({} mode)",
            log.records.len(),
            self.dest_root.display(),
            self.mode
        );

        let progress_bar = if self.show_progress && !log.records.is_empty() {
            let pb = ProgressBar::new(log.records.len() as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} clips")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("#>-"),
            );
            Some(pb)
        } else {
            None
        };

        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let mut futures = FuturesUnordered::new();

        for record in &log.records {
            if let Decision::Disagree { audio, text } = decide(record, &self.neutral_label) {
                info!(
                    path = %record.audio_path.display(),
                    "Labels disagree (audio {}, text {}), not moved", audio, text
                );
                report.disagreements += 1;
                if let Some(ref pb) = progress_bar {
                    pb.inc(1);
                }
                continue;
            }

            let source = self.source_path(&record.audio_path);
            let target = destination_for(&self.dest_root, record);
            let sem = semaphore.clone();
            let mode = self.mode;

            futures.push(async move {
                let _permit = sem.acquire().await.ok();
                relocate(&source, &target, mode).await
            });
        }

        while let Some(outcome) = futures.next().await {
            match outcome {
                Outcome::Relocated => report.relocated += 1,
                Outcome::Collision => report.collisions += 1,
                Outcome::Missing => report.missing += 1,
                Outcome::Failed => report.failed += 1,
            }
            if let Some(ref pb) = progress_bar {
                pb.inc(1);
            }
        }

        if let Some(pb) = progress_bar {
            pb.finish_with_message("Sorting complete");
        }

        info!(
            "Sorting complete: {} relocated, {} disagreements, {} collisions, {} missing, {} failed",
            report.relocated, report.disagreements, report.collisions, report.missing, report.failed
        );
        Ok(report)
    }
}

async fn relocate(source: &Path, target: &Path, mode: TransferMode) -> Outcome {
    if !tokio::fs::try_exists(source).await.unwrap_or(false) {
        warn!(path = %source.display(), "Source clip missing, skipped");
        return Outcome::Missing;
    }

    match transfer(source, target, mode).await {
        Ok(()) => {
            debug!(path = %source.display(), "-> {}", target.display());
            Outcome::Relocated
        }
        Err(EmotagError::DestinationCollision(existing)) => {
            warn!(path = %source.display(), "Destination {} exists, skipped", existing);
            Outcome::Collision
        }
        Err(e) => {
            warn!(path = %source.display(), "Relocation failed: {}", e);
            Outcome::Failed
        }
    }
}

/// Copy `source` to a destination that must not exist yet, then remove the
/// source in move mode.
async fn transfer(source: &Path, target: &Path, mode: TransferMode) -> Result<()> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut output = match tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(target)
        .await
    {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            return Err(EmotagError::DestinationCollision(target.display().to_string()));
        }
        Err(e) => return Err(e.into()),
    };

    let copied = async {
        let mut input = tokio::fs::File::open(source).await?;
        tokio::io::copy(&mut input, &mut output).await?;
        output.sync_all().await
    }
    .await;

    if let Err(e) = copied {
        // Drop the partial copy.
        let _ = tokio::fs::remove_file(target).await;
        return Err(e.into());
    }

    if mode == TransferMode::Move {
        tokio::fs::remove_file(source).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::{write_result_log, ResultLog, SchemaVersion};
    use std::fs;
    use tempfile::TempDir;

    fn record(path: &Path, audio: &str, text: Option<&str>) -> AudioFileRecord {
        let mut r = AudioFileRecord::new(path.to_path_buf(), audio, 0.8);
        r.text_emotion = text.map(str::to_string);
        r
    }

    fn write_log(path: &Path, records: Vec<AudioFileRecord>) {
        write_result_log(
            path,
            &ResultLog {
                version: SchemaVersion::V2,
                records,
            },
        )
        .unwrap();
    }

    #[test]
    fn test_decide() {
        let p = Path::new("spk/a.wav");
        assert_eq!(
            decide(&record(p, "开心", Some("难过")), "中立"),
            Decision::Disagree {
                audio: "开心".to_string(),
                text: "难过".to_string()
            }
        );
        assert_eq!(decide(&record(p, "中立", Some("难过")), "中立"), Decision::Relocate);
        assert_eq!(decide(&record(p, "开心", Some("开心")), "中立"), Decision::Relocate);
        assert_eq!(decide(&record(p, "开心", None), "中立"), Decision::Relocate);
        assert_eq!(decide(&record(p, "开心", Some("")), "中立"), Decision::Relocate);
    }

    #[test]
    fn test_destination_for() {
        let r = record(Path::new("/data/派蒙/你好.wav"), "开心", None);
        assert_eq!(
            destination_for(Path::new("/out"), &r),
            PathBuf::from("/out/派蒙/开心/【开心】你好.wav")
        );
    }

    #[tokio::test]
    async fn test_sorter_relocates_and_skips_disagreements() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("spk");
        fs::create_dir_all(&src).unwrap();
        for name in ["a.wav", "b.wav", "c.wav"] {
            fs::write(src.join(name), name.as_bytes()).unwrap();
        }
        let log_path = dir.path().join("results.csv");
        write_log(
            &log_path,
            vec![
                record(&src.join("a.wav"), "开心", Some("难过")),
                record(&src.join("b.wav"), "中立", Some("难过")),
                record(&src.join("c.wav"), "生气", None),
            ],
        );

        let dest = dir.path().join("sorted");
        let report = Sorter::new(&dest, 2)
            .with_progress(false)
            .run(&log_path)
            .await
            .unwrap();

        assert_eq!(report.relocated, 2);
        assert_eq!(report.disagreements, 1);
        assert!(!dest.join("spk/开心/【开心】a.wav").exists());
        assert_eq!(
            fs::read(dest.join("spk/中立/【中立】b.wav")).unwrap(),
            b"b.wav"
        );
        assert!(dest.join("spk/生气/【生气】c.wav").exists());
        // Copy mode keeps the sources.
        assert!(src.join("b.wav").exists());
    }

    #[tokio::test]
    async fn test_sorter_never_overwrites() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("spk");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("a.wav"), b"new").unwrap();
        let log_path = dir.path().join("results.csv");
        write_log(&log_path, vec![record(&src.join("a.wav"), "开心", None)]);

        let dest = dir.path().join("sorted");
        let existing = dest.join("spk/开心/【开心】a.wav");
        fs::create_dir_all(existing.parent().unwrap()).unwrap();
        fs::write(&existing, b"old").unwrap();

        let report = Sorter::new(&dest, 1)
            .with_progress(false)
            .with_mode(TransferMode::Move)
            .run(&log_path)
            .await
            .unwrap();

        assert_eq!(report.collisions, 1);
        assert_eq!(report.relocated, 0);
        assert_eq!(fs::read(&existing).unwrap(), b"old");
        assert!(src.join("a.wav").exists());
    }

    #[tokio::test]
    async fn test_sorter_move_and_missing_source() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("spk");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("a.wav"), b"a").unwrap();
        let log_path = dir.path().join("results.csv");
        write_log(
            &log_path,
            vec![
                record(Path::new("spk/a.wav"), "难过", None),
                record(Path::new("spk/gone.wav"), "难过", None),
            ],
        );

        let dest = dir.path().join("sorted");
        let report = Sorter::new(&dest, 2)
            .with_progress(false)
            .with_mode(TransferMode::Move)
            .with_source_root(dir.path())
            .run(&log_path)
            .await
            .unwrap();

        assert_eq!(report.relocated, 1);
        assert_eq!(report.missing, 1);
        assert!(dest.join("spk/难过/【难过】a.wav").exists());
        assert!(!src.join("a.wav").exists());
    }

    #[tokio::test]
    async fn test_sorter_missing_log() {
        let dir = TempDir::new().unwrap();
        let result = Sorter::new(dir.path(), 1).run(&dir.path().join("none.csv")).await;
        assert!(matches!(result, Err(EmotagError::MissingInput(_))));
    }
}
