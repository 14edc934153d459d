//! Rename resolver: gives clips human-readable names from sidecar label
//! files or from a manifest.

pub mod manifest;
pub mod sidecar;

pub use manifest::ManifestStrategy;
pub use sidecar::SidecarStrategy;

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, info_span, warn};

use crate::config::RenameMethod;
use crate::error::{EmotagError, Result};

/// Characters that are not allowed in file names on common filesystems.
const DISALLOWED_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Longest file stem produced by `sanitize_filename`.
pub const MAX_NAME_LEN: usize = 255;

/// Make `name` usable as a file stem.
///
/// Leading and trailing spaces and dots are trimmed, disallowed characters
/// become `_`, and the result is capped at `MAX_NAME_LEN` characters.
pub fn sanitize_filename(name: &str) -> String {
    name.trim_matches(|c: char| c == ' ' || c == '.')
        .chars()
        .map(|c| if DISALLOWED_CHARS.contains(&c) { '_' } else { c })
        .take(MAX_NAME_LEN)
        .collect()
}

/// Outcome of resolving a new name for one clip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The clip already carries the requested name.
    Unchanged,
    Rename(PathBuf),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    #[error("target name is empty after sanitizing")]
    Empty,

    #[error("target {0} already exists")]
    Collision(PathBuf),
}

/// Compute where `audio_path` should be renamed to for `raw_name`.
///
/// The clip keeps its directory and extension.
pub fn resolve(audio_path: &Path, raw_name: &str) -> std::result::Result<Resolution, RejectReason> {
    let stem = sanitize_filename(raw_name);
    if stem.is_empty() {
        return Err(RejectReason::Empty);
    }

    let file_name = match audio_path.extension() {
        Some(ext) => format!("{}.{}", stem, ext.to_string_lossy()),
        None => stem,
    };
    let target = audio_path.with_file_name(file_name);

    if target == audio_path {
        return Ok(Resolution::Unchanged);
    }
    if fs::symlink_metadata(&target).is_ok() {
        return Err(RejectReason::Collision(target));
    }

    Ok(Resolution::Rename(target))
}

/// A request to rename one clip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenameRequest {
    pub audio_path: PathBuf,
    /// Unsanitized target stem.
    pub raw_name: String,
    /// Sidecar label file the name came from, if any.
    pub sidecar: Option<PathBuf>,
}

/// One entry of a strategy's rename plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanEntry {
    Request(RenameRequest),
    /// The referenced clip could not be found.
    Missing(String),
    /// The clip already carries its target name.
    Applied(PathBuf),
    /// The metadata entry could not be parsed.
    Malformed(String),
}

/// Rename entries, produced lazily so each one sees the renames before it.
pub type Plan<'a> = Box<dyn Iterator<Item = PlanEntry> + 'a>;

/// A source of rename metadata.
pub trait RenameStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Read the rename metadata and turn it into a plan.
    ///
    /// Entries are pulled one at a time by `apply_renames`, after the
    /// previous entry was applied.
    fn plan(&self) -> Result<Plan<'_>>;

    /// Called after `request` was applied and the clip now lives at `target`.
    fn on_renamed(&self, _request: &RenameRequest, _target: &Path) -> Result<()> {
        Ok(())
    }
}

/// Build the strategy selected by `method`.
pub fn strategy_for(
    method: RenameMethod,
    root: &Path,
    manifest: Option<&Path>,
) -> Result<Box<dyn RenameStrategy>> {
    match method {
        RenameMethod::Sidecar => Ok(Box::new(SidecarStrategy::new(root))),
        RenameMethod::Manifest => {
            let manifest = manifest.ok_or_else(|| {
                EmotagError::Config("Manifest rename requires a manifest file path".to_string())
            })?;
            Ok(Box::new(ManifestStrategy::new(manifest, root)))
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenameReport {
    pub renamed: usize,
    pub unchanged: usize,
    pub rejected: usize,
    pub missing: usize,
    pub malformed: usize,
}

/// Apply every entry of `strategy`'s plan.
///
/// Rejections and failures are logged and counted; the original clip is
/// left untouched.
pub fn apply_renames(strategy: &dyn RenameStrategy) -> Result<RenameReport> {
    let _span = info_span!("stage", name = "rename", strategy = strategy.name()).entered();

    let plan = strategy.plan()?;
    let mut report = RenameReport::default();

    for entry in plan {
        let request = match entry {
            PlanEntry::Request(request) => request,
            PlanEntry::Missing(what) => {
                warn!("Audio file not found: {}", what);
                report.missing += 1;
                continue;
            }
            PlanEntry::Applied(path) => {
                debug!(path = %path.display(), "Already renamed");
                report.unchanged += 1;
                continue;
            }
            PlanEntry::Malformed(line) => {
                warn!("Malformed rename entry: {}", line);
                report.malformed += 1;
                continue;
            }
        };

        let path = &request.audio_path;
        if !path.exists() {
            warn!(path = %path.display(), "Audio file disappeared before rename");
            report.missing += 1;
            continue;
        }

        match resolve(path, &request.raw_name) {
            Ok(Resolution::Unchanged) => {
                debug!(path = %path.display(), "Name unchanged");
                report.unchanged += 1;
            }
            Ok(Resolution::Rename(target)) => match fs::rename(path, &target) {
                Ok(()) => {
                    info!(path = %path.display(), "Renamed -> {}", target.display());
                    report.renamed += 1;
                    if let Err(e) = strategy.on_renamed(&request, &target) {
                        warn!(path = %path.display(), "Post-rename cleanup failed: {}", e);
                    }
                }
                Err(e) => {
                    warn!(path = %path.display(), "Rename to {} failed: {}", target.display(), e);
                    report.rejected += 1;
                }
            },
            Err(reason) => {
                warn!(
                    path = %path.display(),
                    "{}",
                    EmotagError::InvalidRename(format!("{:?}: {}", request.raw_name, reason))
                );
                report.rejected += 1;
            }
        }
    }

    info!(
        "Rename complete: {} renamed, {} unchanged, {} rejected, {} missing, {} malformed",
        report.renamed, report.unchanged, report.rejected, report.missing, report.malformed
    );

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sanitize_replaces_disallowed() {
        assert_eq!(sanitize_filename("happy/sad"), "happy_sad");
        assert_eq!(sanitize_filename(r#"a<b>c:d"e\f|g?h*i"#), "a_b_c_d_e_f_g_h_i");
    }

    #[test]
    fn test_sanitize_trims_space_and_dots() {
        assert_eq!(sanitize_filename("  .hello world. "), "hello world");
        assert_eq!(sanitize_filename(" .. "), "");
    }

    #[test]
    fn test_sanitize_caps_length() {
        let long = "你".repeat(300);
        let out = sanitize_filename(&long);
        assert_eq!(out.chars().count(), MAX_NAME_LEN);
    }

    #[test]
    fn test_resolve_outcomes() {
        let dir = TempDir::new().unwrap();
        let clip = dir.path().join("old.wav");
        fs::write(&clip, b"x").unwrap();
        fs::write(dir.path().join("taken.wav"), b"y").unwrap();
        fs::create_dir(dir.path().join("folder.wav")).unwrap();

        assert_eq!(resolve(&clip, "old"), Ok(Resolution::Unchanged));
        assert_eq!(
            resolve(&clip, "happy/sad"),
            Ok(Resolution::Rename(dir.path().join("happy_sad.wav")))
        );
        assert_eq!(resolve(&clip, " . "), Err(RejectReason::Empty));
        assert_eq!(
            resolve(&clip, "taken"),
            Err(RejectReason::Collision(dir.path().join("taken.wav")))
        );
        assert!(matches!(resolve(&clip, "folder"), Err(RejectReason::Collision(_))));
    }

    #[test]
    fn test_strategy_for_manifest_requires_path() {
        let dir = TempDir::new().unwrap();
        assert!(strategy_for(RenameMethod::Manifest, dir.path(), None).is_err());
        let sidecar = strategy_for(RenameMethod::Sidecar, dir.path(), None).unwrap();
        assert_eq!(sidecar.name(), "sidecar");
    }
}
