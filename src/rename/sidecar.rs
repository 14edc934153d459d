use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::audio::{collect_files_with_extension, AUDIO_EXTENSION};
use crate::error::Result;

use super::{Plan, PlanEntry, RenameRequest, RenameStrategy};

/// Extension of sidecar label files.
pub const SIDECAR_EXTENSION: &str = "lab";

/// Renames each clip after the contents of its same-named `.lab` file.
#[derive(Debug, Clone)]
pub struct SidecarStrategy {
    root: PathBuf,
}

impl SidecarStrategy {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }
}

/// Non-empty trimmed lines of a sidecar file, joined with `_`.
pub fn sidecar_name(contents: &str) -> String {
    contents
        .trim_start_matches('\u{feff}')
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

impl RenameStrategy for SidecarStrategy {
    fn name(&self) -> &'static str {
        "sidecar"
    }

    fn plan(&self) -> Result<Plan<'_>> {
        let sidecars = collect_files_with_extension(&self.root, SIDECAR_EXTENSION);
        debug!("Found {} .{} files", sidecars.len(), SIDECAR_EXTENSION);

        let entries = sidecars.into_iter().map(|sidecar| {
            let audio_path = sidecar.with_extension(AUDIO_EXTENSION);
            if !audio_path.is_file() {
                return PlanEntry::Missing(audio_path.display().to_string());
            }
            match fs::read_to_string(&sidecar) {
                Ok(contents) => PlanEntry::Request(RenameRequest {
                    audio_path,
                    raw_name: sidecar_name(&contents),
                    sidecar: Some(sidecar),
                }),
                Err(e) => PlanEntry::Malformed(format!("{}: {}", sidecar.display(), e)),
            }
        });

        Ok(Box::new(entries))
    }

    fn on_renamed(&self, request: &RenameRequest, _target: &Path) -> Result<()> {
        if let Some(sidecar) = &request.sidecar {
            fs::remove_file(sidecar)?;
            debug!(path = %sidecar.display(), "Removed sidecar");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rename::apply_renames;
    use tempfile::TempDir;

    #[test]
    fn test_sidecar_name_joins_lines() {
        assert_eq!(sidecar_name("  hello \n\n world\n"), "hello_world");
        assert_eq!(sidecar_name("\u{feff}单行"), "单行");
        assert_eq!(sidecar_name("\n  \n"), "");
    }

    #[test]
    fn test_sidecar_rename_and_cleanup() {
        let dir = TempDir::new().unwrap();
        let spk = dir.path().join("speaker");
        fs::create_dir(&spk).unwrap();
        fs::write(spk.join("clip001.wav"), b"a").unwrap();
        fs::write(spk.join("clip001.lab"), "happy/sad\n").unwrap();

        let report = apply_renames(&SidecarStrategy::new(dir.path())).unwrap();

        assert_eq!(report.renamed, 1);
        assert!(spk.join("happy_sad.wav").exists());
        assert!(!spk.join("clip001.wav").exists());
        assert!(!spk.join("clip001.lab").exists());
    }

    #[test]
    fn test_sidecar_rejections_leave_files_untouched() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.wav"), b"a").unwrap();
        fs::write(dir.path().join("a.lab"), "b").unwrap();
        fs::write(dir.path().join("b.wav"), b"b").unwrap();
        fs::write(dir.path().join("c.wav"), b"c").unwrap();
        fs::write(dir.path().join("c.lab"), "  ").unwrap();
        fs::write(dir.path().join("orphan.lab"), "x").unwrap();

        let report = apply_renames(&SidecarStrategy::new(dir.path())).unwrap();

        assert_eq!(report.renamed, 0);
        assert_eq!(report.rejected, 2);
        assert_eq!(report.missing, 1);
        assert_eq!(fs::read(dir.path().join("a.wav")).unwrap(), b"a");
        assert_eq!(fs::read(dir.path().join("b.wav")).unwrap(), b"b");
        assert!(dir.path().join("a.lab").exists());
    }

    #[test]
    fn test_sidecar_rerun_is_noop() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("x.wav"), b"x").unwrap();
        fs::write(dir.path().join("x.lab"), "named").unwrap();

        let strategy = SidecarStrategy::new(dir.path());
        assert_eq!(apply_renames(&strategy).unwrap().renamed, 1);

        let again = apply_renames(&strategy).unwrap();
        assert_eq!(again, Default::default());
        assert!(dir.path().join("named.wav").exists());
    }

    #[test]
    fn test_sidecar_matching_name_is_unchanged() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("same.wav"), b"x").unwrap();
        fs::write(dir.path().join("same.lab"), "same").unwrap();

        let report = apply_renames(&SidecarStrategy::new(dir.path())).unwrap();
        assert_eq!(report.unchanged, 1);
        assert!(dir.path().join("same.lab").exists());
    }
}
