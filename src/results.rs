//! The result log: a `|`-separated record file passed between the
//! recognition, cross-check and sorting stages.
//!
//! The header names the columns. Two schema versions exist:
//!
//! - v1: `AudioPath|ParentFolder|AudioEmotion|Confidence`
//! - v2: v1 plus `TextEmotion`
//!
//! Rows whose field count differs from the header are rejected with the
//! offending line number instead of being read positionally.

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{EmotagError, Result};

pub const DELIMITER: char = '|';

/// Completed batches buffered between the workers and the writer.
const WRITER_QUEUE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Column {
    AudioPath,
    ParentFolder,
    AudioEmotion,
    Confidence,
    TextEmotion,
}

impl Column {
    pub fn header_name(&self) -> &'static str {
        match self {
            Column::AudioPath => "AudioPath",
            Column::ParentFolder => "ParentFolder",
            Column::AudioEmotion => "AudioEmotion",
            Column::Confidence => "Confidence",
            Column::TextEmotion => "TextEmotion",
        }
    }

    fn from_header(name: &str) -> Option<Self> {
        match name.trim() {
            "AudioPath" => Some(Column::AudioPath),
            "ParentFolder" => Some(Column::ParentFolder),
            // Older logs name the audio label column `Emotion`.
            "AudioEmotion" | "Emotion" => Some(Column::AudioEmotion),
            "Confidence" => Some(Column::Confidence),
            "TextEmotion" => Some(Column::TextEmotion),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaVersion {
    V1,
    V2,
}

impl SchemaVersion {
    pub fn columns(&self) -> &'static [Column] {
        const V1: &[Column] = &[
            Column::AudioPath,
            Column::ParentFolder,
            Column::AudioEmotion,
            Column::Confidence,
        ];
        const V2: &[Column] = &[
            Column::AudioPath,
            Column::ParentFolder,
            Column::AudioEmotion,
            Column::Confidence,
            Column::TextEmotion,
        ];
        match self {
            SchemaVersion::V1 => V1,
            SchemaVersion::V2 => V2,
        }
    }

    pub fn header(&self) -> String {
        self.columns()
            .iter()
            .map(Column::header_name)
            .collect::<Vec<_>>()
            .join("|")
    }
}

/// One recognized clip.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFileRecord {
    pub audio_path: PathBuf,
    /// Grouping key: the directory the clip was found in.
    pub parent_folder: String,
    pub audio_emotion: String,
    /// Maximum class score, kept at full precision.
    pub confidence: f32,
    pub text_emotion: Option<String>,
}

impl AudioFileRecord {
    pub fn new(audio_path: PathBuf, audio_emotion: impl Into<String>, confidence: f32) -> Self {
        let parent_folder = parent_folder_of(&audio_path);
        Self {
            audio_path,
            parent_folder,
            audio_emotion: audio_emotion.into(),
            confidence,
            text_emotion: None,
        }
    }

    /// Format as a log row for `version`.
    pub fn to_row(&self, version: SchemaVersion) -> Result<String> {
        let path = self.audio_path.to_string_lossy();
        let confidence = format!("{:.2}", self.confidence);
        let text = self.text_emotion.as_deref().unwrap_or("");

        let fields: Vec<&str> = version
            .columns()
            .iter()
            .map(|c| match c {
                Column::AudioPath => &*path,
                Column::ParentFolder => self.parent_folder.as_str(),
                Column::AudioEmotion => self.audio_emotion.as_str(),
                Column::Confidence => confidence.as_str(),
                Column::TextEmotion => text,
            })
            .collect();

        if let Some(bad) = fields
            .iter()
            .find(|f| f.contains(DELIMITER) || f.contains('\n') || f.contains('\r'))
        {
            return Err(EmotagError::Schema(format!(
                "field {:?} cannot be stored in a {} separated log",
                bad, DELIMITER
            )));
        }

        Ok(fields.join("|"))
    }
}

/// Name of the directory directly containing `path`.
pub fn parent_folder_of(path: &Path) -> String {
    path.parent()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResultLog {
    pub version: SchemaVersion,
    pub records: Vec<AudioFileRecord>,
}

impl ResultLog {
    pub fn to_text(&self) -> Result<String> {
        let mut out = self.version.header();
        out.push('\n');
        for record in &self.records {
            out.push_str(&record.to_row(self.version)?);
            out.push('\n');
        }
        Ok(out)
    }
}

/// Parse the text of a result log.
pub fn parse_result_log(contents: &str) -> Result<ResultLog> {
    let mut lines = contents
        .trim_start_matches('\u{feff}')
        .lines()
        .enumerate()
        .map(|(i, l)| (i + 1, l.trim_end_matches('\r')));

    let header = loop {
        match lines.next() {
            Some((_, line)) if line.trim().is_empty() => continue,
            Some((_, line)) => break line,
            None => return Err(EmotagError::Schema("empty result log".to_string())),
        }
    };

    let mut columns = Vec::new();
    for name in header.split(DELIMITER) {
        let column = Column::from_header(name)
            .ok_or_else(|| EmotagError::Schema(format!("unknown column {:?}", name)))?;
        if columns.contains(&column) {
            return Err(EmotagError::Schema(format!("duplicate column {:?}", name)));
        }
        columns.push(column);
    }
    for required in [Column::AudioPath, Column::AudioEmotion, Column::Confidence] {
        if !columns.contains(&required) {
            return Err(EmotagError::Schema(format!(
                "missing required column {}",
                required.header_name()
            )));
        }
    }

    let version = if columns.contains(&Column::TextEmotion) {
        SchemaVersion::V2
    } else {
        SchemaVersion::V1
    };

    let mut seen = HashSet::new();
    let mut records = Vec::new();

    for (line_no, line) in lines {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(DELIMITER).collect();
        if fields.len() != columns.len() {
            return Err(EmotagError::Schema(format!(
                "line {}: expected {} fields, found {}",
                line_no,
                columns.len(),
                fields.len()
            )));
        }

        let mut record = AudioFileRecord::new(PathBuf::new(), String::new(), 0.0);
        let mut parent = None;
        for (column, value) in columns.iter().zip(fields) {
            match column {
                Column::AudioPath => record.audio_path = PathBuf::from(value),
                Column::ParentFolder => parent = Some(value.to_string()),
                Column::AudioEmotion => record.audio_emotion = value.to_string(),
                Column::Confidence => {
                    record.confidence = value.trim().parse().map_err(|_| {
                        EmotagError::Schema(format!(
                            "line {}: invalid confidence {:?}",
                            line_no, value
                        ))
                    })?
                }
                Column::TextEmotion => {
                    let value = value.trim();
                    record.text_emotion = (!value.is_empty()).then(|| value.to_string());
                }
            }
        }
        record.parent_folder = parent.unwrap_or_else(|| parent_folder_of(&record.audio_path));

        if !seen.insert(record.audio_path.clone()) {
            warn!(path = %record.audio_path.display(), "Duplicate row at line {}, keeping the first", line_no);
            continue;
        }
        records.push(record);
    }

    Ok(ResultLog { version, records })
}

/// Read a result log from disk.
pub async fn read_result_log(path: &Path) -> Result<ResultLog> {
    if !path.is_file() {
        return Err(EmotagError::MissingInput(path.display().to_string()));
    }
    let contents = tokio::fs::read_to_string(path).await?;
    parse_result_log(&contents)
}

/// Replace the log at `path` with `log`.
///
/// The new contents go to a temporary file in the same directory which is
/// then renamed over the original, so readers never see a partial log.
pub fn write_result_log(path: &Path, log: &ResultLog) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;

    let text = log.to_text()?;
    let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
    tmp.write_all(text.as_bytes())?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| EmotagError::Io(e.error))?;
    Ok(())
}

/// A record the writer refused to log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRecord {
    pub path: PathBuf,
    pub reason: String,
}

/// Totals reported by the writer when it shuts down.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub written: usize,
    /// Records refused because of a duplicate path or an unstorable field.
    pub rejected: Vec<RejectedRecord>,
}

/// Single writer for an append-only result log.
///
/// Workers send whole batches through `sender()`; the writer task owns the
/// file, appends each batch in one go and flushes it, so a finished batch
/// is on disk before the next one arrives.
pub struct ResultLogWriter {
    sender: mpsc::Sender<Vec<AudioFileRecord>>,
    task: JoinHandle<Result<WriteSummary>>,
}

impl ResultLogWriter {
    /// Truncate `path`, write the header and start the writer task.
    pub async fn create(path: &Path, version: SchemaVersion) -> Result<Self> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                tokio::fs::create_dir_all(dir).await?;
            }
        }

        let mut file = tokio::fs::File::create(path).await?;
        file.write_all(format!("{}\n", version.header()).as_bytes())
            .await?;
        file.flush().await?;

        let (sender, mut receiver) = mpsc::channel::<Vec<AudioFileRecord>>(WRITER_QUEUE);
        let log_path = path.to_path_buf();

        let task = tokio::spawn(async move {
            let mut summary = WriteSummary::default();
            let mut seen: HashSet<PathBuf> = HashSet::new();

            while let Some(batch) = receiver.recv().await {
                let mut chunk = String::new();
                for record in batch {
                    if seen.contains(&record.audio_path) {
                        warn!(path = %record.audio_path.display(), "Already logged, dropping duplicate");
                        summary.rejected.push(RejectedRecord {
                            path: record.audio_path,
                            reason: "duplicate path in result log".to_string(),
                        });
                        continue;
                    }
                    match record.to_row(version) {
                        Ok(row) => {
                            chunk.push_str(&row);
                            chunk.push('\n');
                            seen.insert(record.audio_path);
                            summary.written += 1;
                        }
                        Err(e) => {
                            warn!(path = %record.audio_path.display(), "Not logged: {}", e);
                            summary.rejected.push(RejectedRecord {
                                path: record.audio_path,
                                reason: e.to_string(),
                            });
                        }
                    }
                }
                file.write_all(chunk.as_bytes()).await?;
                file.flush().await?;
            }

            file.sync_all().await?;
            debug!("Closed {} after {} rows", log_path.display(), summary.written);
            Ok::<_, EmotagError>(summary)
        });

        Ok(Self { sender, task })
    }

    pub fn sender(&self) -> mpsc::Sender<Vec<AudioFileRecord>> {
        self.sender.clone()
    }

    /// Close the channel and wait for every queued batch to be written.
    ///
    /// Outstanding clones of the sender must be dropped first.
    pub async fn finish(self) -> Result<WriteSummary> {
        drop(self.sender);
        self.task
            .await
            .map_err(|e| EmotagError::Io(std::io::Error::other(e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(path: &str, emotion: &str, confidence: f32) -> AudioFileRecord {
        AudioFileRecord::new(PathBuf::from(path), emotion, confidence)
    }

    #[test]
    fn test_headers() {
        assert_eq!(
            SchemaVersion::V1.header(),
            "AudioPath|ParentFolder|AudioEmotion|Confidence"
        );
        assert_eq!(
            SchemaVersion::V2.header(),
            "AudioPath|ParentFolder|AudioEmotion|Confidence|TextEmotion"
        );
    }

    #[test]
    fn test_row_rounds_confidence() {
        let r = record("in/alice/a.wav", "开心", 0.876_543);
        assert_eq!(r.parent_folder, "alice");
        assert_eq!(r.to_row(SchemaVersion::V1).unwrap(), "in/alice/a.wav|alice|开心|0.88");
        assert_eq!(r.to_row(SchemaVersion::V2).unwrap(), "in/alice/a.wav|alice|开心|0.88|");
        assert!((r.confidence - 0.876_543).abs() < 1e-9);
    }

    #[test]
    fn test_row_rejects_delimiter() {
        let r = record("in/a|b.wav", "开心", 0.5);
        assert!(matches!(r.to_row(SchemaVersion::V1), Err(EmotagError::Schema(_))));
    }

    #[test]
    fn test_parse_v1_and_v2() {
        let log = parse_result_log(
            "AudioPath|ParentFolder|AudioEmotion|Confidence\nx/a.wav|x|开心|0.91\n\n",
        )
        .unwrap();
        assert_eq!(log.version, SchemaVersion::V1);
        assert_eq!(log.records.len(), 1);
        assert_eq!(log.records[0].text_emotion, None);

        let log = parse_result_log(
            "AudioPath|ParentFolder|AudioEmotion|Confidence|TextEmotion\r\n\
             x/a.wav|x|开心|0.91|难过\r\n\
             x/b.wav|x|中立|0.40|\r\n",
        )
        .unwrap();
        assert_eq!(log.version, SchemaVersion::V2);
        assert_eq!(log.records[0].text_emotion.as_deref(), Some("难过"));
        assert_eq!(log.records[1].text_emotion, None);
    }

    #[test]
    fn test_parse_legacy_emotion_column() {
        let log = parse_result_log("AudioPath|ParentFolder|Emotion|Confidence\nq/z.wav|q|吃惊|0.50\n")
            .unwrap();
        assert_eq!(log.records[0].audio_emotion, "吃惊");
    }

    #[test]
    fn test_parse_fails_fast() {
        let err = parse_result_log("AudioPath|ParentFolder|AudioEmotion|Confidence\na.wav|x|开心\n")
            .unwrap_err();
        assert!(err.to_string().contains("line 2"));

        assert!(parse_result_log("AudioPath|Mood|Confidence\n").is_err());
        assert!(parse_result_log("AudioPath|ParentFolder|Confidence\n").is_err());
        assert!(parse_result_log("AudioPath|AudioPath|AudioEmotion|Confidence\n").is_err());
        assert!(parse_result_log("").is_err());
        assert!(parse_result_log(
            "AudioPath|ParentFolder|AudioEmotion|Confidence\na.wav|x|开心|high\n"
        )
        .is_err());
    }

    #[test]
    fn test_parse_drops_duplicate_paths() {
        let log = parse_result_log(
            "AudioPath|ParentFolder|AudioEmotion|Confidence\na.wav|x|开心|0.9\na.wav|x|难过|0.8\n",
        )
        .unwrap();
        assert_eq!(log.records.len(), 1);
        assert_eq!(log.records[0].audio_emotion, "开心");
    }

    #[test]
    fn test_write_result_log_replaces_atomically() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.csv");
        std::fs::write(&path, "old contents").unwrap();

        let mut r = record("x/a.wav", "开心", 0.9);
        r.text_emotion = Some("开心".to_string());
        let log = ResultLog {
            version: SchemaVersion::V2,
            records: vec![r],
        };
        write_result_log(&path, &log).unwrap();

        let back = parse_result_log(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(back.version, SchemaVersion::V2);
        assert_eq!(back.records[0].text_emotion.as_deref(), Some("开心"));
    }

    #[tokio::test]
    async fn test_writer_serializes_batches_and_dedups() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/results.csv");

        let writer = ResultLogWriter::create(&path, SchemaVersion::V1).await.unwrap();
        let tx = writer.sender();
        tx.send(vec![record("d/a.wav", "开心", 0.9), record("d/b.wav", "难过", 0.8)])
            .await
            .unwrap();
        tx.send(vec![record("d/a.wav", "中立", 0.1), record("d/c|.wav", "中立", 0.1)])
            .await
            .unwrap();
        drop(tx);

        let summary = writer.finish().await.unwrap();
        assert_eq!(summary.written, 2);
        let refused: Vec<_> = summary.rejected.iter().map(|r| r.path.clone()).collect();
        assert_eq!(refused, vec![PathBuf::from("d/a.wav"), PathBuf::from("d/c|.wav")]);
        assert!(summary.rejected[0].reason.contains("duplicate"));

        let log = read_result_log(&path).await.unwrap();
        assert_eq!(log.records.len(), 2);
        assert_eq!(log.records[0].audio_emotion, "开心");
    }

    #[tokio::test]
    async fn test_read_missing_log() {
        let result = read_result_log(Path::new("/nonexistent/emotag/log.csv")).await;
        assert!(matches!(result, Err(EmotagError::MissingInput(_))));
    }
}
