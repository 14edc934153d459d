//! Duration filter: keeps clips whose length falls in an inclusive range and
//! materializes them in a destination tree.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, info_span, warn};

use crate::audio::{collect_audio_files, AudioDecoder, AUDIO_EXTENSION};
use crate::config::{FolderLayout, TransferMode};
use crate::error::{EmotagError, Result};
use crate::rename::sidecar::SIDECAR_EXTENSION;

/// Prefix given to kept files when filtering in place.
pub const IN_PLACE_PREFIX: &str = "filtered_";

/// Above this many top-level entries `FolderLayout::Auto` keeps the source
/// root name as an extra folder level.
const AUTO_ROOT_THRESHOLD: usize = 5;

#[derive(Debug, Clone)]
pub struct FilterConfig {
    /// Destination root. `None` filters in place by prefixing kept files.
    pub destination: Option<PathBuf>,
    /// Minimum duration in seconds (inclusive).
    pub min_duration: f64,
    /// Maximum duration in seconds (inclusive).
    pub max_duration: f64,
    pub layout: FolderLayout,
    pub mode: TransferMode,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            destination: None,
            min_duration: 3.0,
            max_duration: 10.0,
            layout: FolderLayout::default(),
            mode: TransferMode::default(),
        }
    }
}

impl FilterConfig {
    pub fn accepts(&self, duration: Duration) -> bool {
        let secs = duration.as_secs_f64();
        self.min_duration <= secs && secs <= self.max_duration
    }
}

#[derive(Debug, Clone, Default)]
pub struct FilterReport {
    /// Folder holding the kept clips.
    pub output_dir: PathBuf,
    pub scanned: usize,
    pub kept: usize,
    /// Clips outside the duration range.
    pub rejected: usize,
    /// Clips that could not be decoded or materialized.
    pub failed: usize,
    /// Kept clips whose destination already existed.
    pub existing: usize,
}

/// Resolve `Auto` against the shape of the source root.
pub fn resolve_layout(layout: FolderLayout, source: &Path) -> FolderLayout {
    if layout != FolderLayout::Auto {
        return layout;
    }
    let entries = fs::read_dir(source).map(|rd| rd.count()).unwrap_or(0);
    if entries > AUTO_ROOT_THRESHOLD {
        FolderLayout::MirrorWithRoot
    } else {
        FolderLayout::Mirror
    }
}

/// Where a kept clip lands.
///
/// `layout` must already be resolved; `Auto` is treated as `Mirror`.
pub fn destination_path(
    source_root: &Path,
    file: &Path,
    destination: Option<&Path>,
    layout: FolderLayout,
) -> PathBuf {
    let file_name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let Some(dest) = destination else {
        let parent = file.parent().unwrap_or_else(|| Path::new(""));
        return parent.join(format!("{IN_PLACE_PREFIX}{file_name}"));
    };

    let rel = file.strip_prefix(source_root).unwrap_or(file);

    match layout {
        FolderLayout::Flatten => {
            let parent_name = rel
                .parent()
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy().into_owned());
            match parent_name {
                Some(parent) => dest.join(format!("{parent}_{file_name}")),
                None => dest.join(file_name),
            }
        }
        FolderLayout::MirrorWithRoot => {
            let root_name = source_root
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_default();
            dest.join(root_name).join(rel)
        }
        FolderLayout::Mirror | FolderLayout::Auto => dest.join(rel),
    }
}

fn materialize(src: &Path, dst: &Path, mode: TransferMode) -> std::io::Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    match mode {
        TransferMode::Copy => fs::copy(src, dst).map(|_| ()),
        TransferMode::Move => {
            if fs::rename(src, dst).is_err() {
                // Cross-device moves fall back to copy + delete.
                fs::copy(src, dst)?;
                fs::remove_file(src)?;
            }
            Ok(())
        }
    }
}

/// Bring the clip's `.lab` sidecar along so it can still be renamed later.
fn carry_sidecar(src: &Path, dst: &Path, mode: TransferMode) {
    let sidecar = src.with_extension(SIDECAR_EXTENSION);
    if !sidecar.is_file() {
        return;
    }
    let target = dst.with_extension(SIDECAR_EXTENSION);
    if target.exists() {
        return;
    }
    if let Err(e) = materialize(&sidecar, &target, mode) {
        warn!(path = %sidecar.display(), "Sidecar not carried over: {}", e);
    }
}

/// Keep every clip under `source` whose duration is within the configured
/// range.
///
/// Per-file failures are logged and counted; only a missing source root or
/// an invalid range fail the stage.
pub fn filter_by_duration(
    source: &Path,
    config: &FilterConfig,
    decoder: &dyn AudioDecoder,
) -> Result<FilterReport> {
    let _span = info_span!("stage", name = "filter").entered();

    if !source.is_dir() {
        return Err(EmotagError::MissingInput(source.display().to_string()));
    }
    if !(config.min_duration >= 0.0 && config.min_duration <= config.max_duration) {
        return Err(EmotagError::Config(format!(
            "Invalid duration range [{}, {}]",
            config.min_duration, config.max_duration
        )));
    }

    let layout = resolve_layout(config.layout, source);
    let destination = config.destination.as_deref();
    let output_dir = match (destination, layout) {
        (Some(dest), FolderLayout::MirrorWithRoot) => dest.join(source.file_name().unwrap_or_default()),
        (Some(dest), _) => dest.to_path_buf(),
        (None, _) => source.to_path_buf(),
    };

    info!(
        "Filtering {} to [{:.2}s, {:.2}s] ({} layout, {})",
        source.display(),
        config.min_duration,
        config.max_duration,
        layout,
        config.mode
    );

    let mut report = FilterReport {
        output_dir,
        ..Default::default()
    };

    for file in collect_audio_files(source) {
        report.scanned += 1;

        if destination.is_none()
            && file
                .file_name()
                .map(|n| n.to_string_lossy().starts_with(IN_PLACE_PREFIX))
                .unwrap_or(false)
        {
            debug!(path = %file.display(), "Already filtered in place");
            report.kept += 1;
            continue;
        }

        let duration = match decoder.duration(&file) {
            Ok(d) => d,
            Err(e) => {
                warn!(path = %file.display(), "Skipping undecodable clip: {}", e);
                report.failed += 1;
                continue;
            }
        };

        if !config.accepts(duration) {
            warn!(
                path = %file.display(),
                "Skipped (duration: {:.2}s)",
                duration.as_secs_f64()
            );
            report.rejected += 1;
            continue;
        }

        let dst = destination_path(source, &file, destination, layout);
        if dst.exists() {
            warn!(path = %file.display(), "Destination exists, not overwriting: {}", dst.display());
            report.existing += 1;
            continue;
        }

        // In-place filtering always renames; a copy would leave the clip twice.
        let mode = if destination.is_none() {
            TransferMode::Move
        } else {
            config.mode
        };

        match materialize(&file, &dst, mode) {
            Ok(()) => {
                debug!(path = %file.display(), "Kept -> {}", dst.display());
                report.kept += 1;
                if destination.is_some() {
                    carry_sidecar(&file, &dst, mode);
                }
            }
            Err(e) => {
                warn!(path = %file.display(), "Failed to write {}: {}", dst.display(), e);
                report.failed += 1;
            }
        }
    }

    info!(
        "Filter complete: {} scanned, {} kept, {} out of range, {} failed, {} already present",
        report.scanned, report.kept, report.rejected, report.failed, report.existing
    );
    debug!("Filtered .{} clips saved under {}", AUDIO_EXTENSION, report.output_dir.display());

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Decoder reporting durations from a lookup table keyed by file name.
    struct TableDecoder {
        durations: HashMap<String, f64>,
        calls: Mutex<usize>,
    }

    impl TableDecoder {
        fn new(entries: &[(&str, f64)]) -> Self {
            Self {
                durations: entries.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
                calls: Mutex::new(0),
            }
        }
    }

    impl AudioDecoder for TableDecoder {
        fn duration(&self, path: &Path) -> Result<Duration> {
            *self.calls.lock().unwrap() += 1;
            let name = path.file_name().unwrap().to_string_lossy().to_string();
            self.durations
                .get(&name)
                .map(|d| Duration::from_secs_f64(*d))
                .ok_or_else(|| EmotagError::Decode(name))
        }

        fn load(&self, _path: &Path) -> Result<crate::audio::DecodedAudio> {
            unimplemented!("filter only reads durations")
        }
    }

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"clip").unwrap();
    }

    #[test]
    fn test_accepts_is_inclusive() {
        let config = FilterConfig::default();
        assert!(config.accepts(Duration::from_secs(3)));
        assert!(config.accepts(Duration::from_secs(10)));
        assert!(!config.accepts(Duration::from_secs_f64(2.99)));
        assert!(!config.accepts(Duration::from_secs_f64(10.01)));
    }

    #[test]
    fn test_destination_layouts() {
        let root = Path::new("/data/voices");
        let file = Path::new("/data/voices/alice/a.wav");
        let dest = Path::new("/out");

        assert_eq!(
            destination_path(root, file, Some(dest), FolderLayout::Mirror),
            PathBuf::from("/out/alice/a.wav")
        );
        assert_eq!(
            destination_path(root, file, Some(dest), FolderLayout::MirrorWithRoot),
            PathBuf::from("/out/voices/alice/a.wav")
        );
        assert_eq!(
            destination_path(root, file, Some(dest), FolderLayout::Flatten),
            PathBuf::from("/out/alice_a.wav")
        );
        assert_eq!(
            destination_path(root, Path::new("/data/voices/b.wav"), Some(dest), FolderLayout::Flatten),
            PathBuf::from("/out/b.wav")
        );
        assert_eq!(
            destination_path(root, file, None, FolderLayout::Mirror),
            PathBuf::from("/data/voices/alice/filtered_a.wav")
        );
    }

    #[test]
    fn test_filter_keeps_boundaries_and_skips_failures() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        for name in ["min.wav", "max.wav", "short.wav", "long.wav", "broken.wav"] {
            touch(&src.path().join("spk").join(name));
        }
        let decoder = TableDecoder::new(&[
            ("min.wav", 3.0),
            ("max.wav", 10.0),
            ("short.wav", 1.0),
            ("long.wav", 12.5),
        ]);

        let config = FilterConfig {
            destination: Some(dst.path().to_path_buf()),
            layout: FolderLayout::Mirror,
            ..Default::default()
        };
        let report = filter_by_duration(src.path(), &config, &decoder).unwrap();

        assert_eq!(report.scanned, 5);
        assert_eq!(report.kept, 2);
        assert_eq!(report.rejected, 2);
        assert_eq!(report.failed, 1);
        assert!(dst.path().join("spk/min.wav").exists());
        assert!(dst.path().join("spk/max.wav").exists());
        assert!(!dst.path().join("spk/short.wav").exists());
        // Copy mode leaves the source intact.
        assert!(src.path().join("spk/min.wav").exists());
    }

    #[test]
    fn test_filter_in_place_prefixes_and_is_rerunnable() {
        let src = TempDir::new().unwrap();
        touch(&src.path().join("a.wav"));
        touch(&src.path().join("b.wav"));
        let decoder = TableDecoder::new(&[("a.wav", 5.0), ("b.wav", 1.0), ("filtered_a.wav", 5.0)]);

        let config = FilterConfig::default();
        let report = filter_by_duration(src.path(), &config, &decoder).unwrap();
        assert_eq!(report.kept, 1);
        assert!(src.path().join("filtered_a.wav").exists());
        assert!(!src.path().join("a.wav").exists());
        assert_eq!(report.output_dir, src.path());

        let again = filter_by_duration(src.path(), &config, &decoder).unwrap();
        assert_eq!(again.kept, 1);
        assert!(!src.path().join("filtered_filtered_a.wav").exists());
    }

    #[test]
    fn test_filter_never_overwrites() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        touch(&src.path().join("a.wav"));
        fs::write(dst.path().join("a.wav"), b"keep me").unwrap();
        let decoder = TableDecoder::new(&[("a.wav", 4.0)]);

        let config = FilterConfig {
            destination: Some(dst.path().to_path_buf()),
            layout: FolderLayout::Mirror,
            ..Default::default()
        };
        let report = filter_by_duration(src.path(), &config, &decoder).unwrap();
        assert_eq!(report.existing, 1);
        assert_eq!(fs::read(dst.path().join("a.wav")).unwrap(), b"keep me");
    }

    #[test]
    fn test_auto_layout_threshold() {
        let few = TempDir::new().unwrap();
        for i in 0..3 {
            fs::create_dir(few.path().join(format!("d{i}"))).unwrap();
        }
        assert_eq!(resolve_layout(FolderLayout::Auto, few.path()), FolderLayout::Mirror);

        let many = TempDir::new().unwrap();
        for i in 0..6 {
            fs::create_dir(many.path().join(format!("d{i}"))).unwrap();
        }
        assert_eq!(
            resolve_layout(FolderLayout::Auto, many.path()),
            FolderLayout::MirrorWithRoot
        );
        assert_eq!(resolve_layout(FolderLayout::Flatten, many.path()), FolderLayout::Flatten);
    }

    #[test]
    fn test_filter_missing_source() {
        let decoder = TableDecoder::new(&[]);
        let result = filter_by_duration(
            Path::new("/nonexistent/emotag/src"),
            &FilterConfig::default(),
            &decoder,
        );
        assert!(matches!(result, Err(EmotagError::MissingInput(_))));
        assert_eq!(*decoder.calls.lock().unwrap(), 0);
    }

    #[test]
    fn test_filter_carries_sidecars() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        touch(&src.path().join("spk/a.wav"));
        fs::write(src.path().join("spk/a.lab"), "你好").unwrap();
        touch(&src.path().join("spk/b.wav"));
        fs::write(src.path().join("spk/b.lab"), "太短").unwrap();
        let decoder = TableDecoder::new(&[("a.wav", 4.0), ("b.wav", 1.0)]);

        let config = FilterConfig {
            destination: Some(dst.path().to_path_buf()),
            layout: FolderLayout::Flatten,
            ..Default::default()
        };
        filter_by_duration(src.path(), &config, &decoder).unwrap();

        assert_eq!(
            fs::read_to_string(dst.path().join("spk_a.lab")).unwrap(),
            "你好"
        );
        assert!(!dst.path().join("spk_b.lab").exists());
    }
}
