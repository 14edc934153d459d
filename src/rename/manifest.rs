use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use tracing::debug;

use crate::audio::{collect_audio_files, AUDIO_EXTENSION};
use crate::error::{EmotagError, Result};

use super::{sanitize_filename, Plan, PlanEntry, RenameRequest, RenameStrategy};

/// Minimum number of `|`-separated fields on a manifest line.
pub const MIN_FIELDS: usize = 4;

/// Renames clips from a `.list` manifest: `original path|...|...|new name`.
///
/// Clips are looked up by basename anywhere below the search root. When a
/// basename occurs more than once the first file in walk order wins; the
/// walk is sorted by file name, so the choice is stable. Lookups see every
/// rename made by earlier lines.
#[derive(Debug)]
pub struct ManifestStrategy {
    manifest: PathBuf,
    root: PathBuf,
    index: Mutex<ClipIndex>,
}

impl ManifestStrategy {
    pub fn new(manifest: &Path, root: &Path) -> Self {
        Self {
            manifest: manifest.to_path_buf(),
            root: root.to_path_buf(),
            index: Mutex::new(ClipIndex::default()),
        }
    }

    fn index(&self) -> MutexGuard<'_, ClipIndex> {
        self.index.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn entry_for(&self, line: &str) -> PlanEntry {
        let Some(entry) = parse_line(line) else {
            return PlanEntry::Malformed(line.to_string());
        };

        let index = self.index();

        if let Some(matches) = index.get(&entry.basename) {
            if matches.len() > 1 {
                debug!(
                    "{} matches {} files, using {}",
                    entry.basename,
                    matches.len(),
                    matches[0].display()
                );
            }
            return PlanEntry::Request(RenameRequest {
                audio_path: matches[0].clone(),
                raw_name: entry.target,
                sidecar: None,
            });
        }

        let extension = Path::new(&entry.basename)
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_else(|| AUDIO_EXTENSION.to_string());
        let renamed = format!("{}.{}", sanitize_filename(&entry.target), extension);

        match index.get(&renamed) {
            Some(existing) => PlanEntry::Applied(existing[0].clone()),
            None => PlanEntry::Missing(entry.basename),
        }
    }
}

/// Parsed manifest line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Basename of the original clip.
    pub basename: String,
    /// Unsanitized target stem.
    pub target: String,
}

/// Parse one manifest line; `None` when it has too few fields.
pub fn parse_line(line: &str) -> Option<ManifestEntry> {
    let fields: Vec<&str> = line.split('|').collect();
    if fields.len() < MIN_FIELDS {
        return None;
    }

    // Manifests are written on both Windows and Unix.
    let basename = fields[0]
        .trim()
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .to_string();
    if basename.is_empty() {
        return None;
    }

    Some(ManifestEntry {
        basename,
        target: fields[fields.len() - 1].trim().to_string(),
    })
}

/// Clips below the search root keyed by basename, each list in walk order.
#[derive(Debug, Default)]
struct ClipIndex {
    by_name: HashMap<String, Vec<PathBuf>>,
}

impl ClipIndex {
    fn build(files: Vec<PathBuf>) -> Self {
        let mut index = Self::default();
        for file in files {
            index.insert(file);
        }
        index
    }

    fn get(&self, basename: &str) -> Option<&Vec<PathBuf>> {
        self.by_name.get(basename)
    }

    fn insert(&mut self, path: PathBuf) {
        let Some(name) = path.file_name() else {
            return;
        };
        let paths = self
            .by_name
            .entry(name.to_string_lossy().into_owned())
            .or_default();
        // Component-wise order matches the sorted walk.
        if let Err(pos) = paths.binary_search(&path) {
            paths.insert(pos, path);
        }
    }

    fn remove(&mut self, path: &Path) {
        let Some(name) = path.file_name() else {
            return;
        };
        let name = name.to_string_lossy();
        if let Some(paths) = self.by_name.get_mut(name.as_ref()) {
            paths.retain(|p| p != path);
            if paths.is_empty() {
                self.by_name.remove(name.as_ref());
            }
        }
    }

    fn len(&self) -> usize {
        self.by_name.len()
    }
}

impl RenameStrategy for ManifestStrategy {
    fn name(&self) -> &'static str {
        "manifest"
    }

    fn plan(&self) -> Result<Plan<'_>> {
        if !self.manifest.is_file() {
            return Err(EmotagError::MissingInput(
                self.manifest.display().to_string(),
            ));
        }

        let contents = fs::read_to_string(&self.manifest)?;
        let index = ClipIndex::build(collect_audio_files(&self.root));
        debug!(
            "Indexed {} distinct basenames under {}",
            index.len(),
            self.root.display()
        );
        *self.index() = index;

        let lines: Vec<String> = contents
            .trim_start_matches('\u{feff}')
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect();

        Ok(Box::new(lines.into_iter().map(move |line| self.entry_for(&line))))
    }

    fn on_renamed(&self, request: &RenameRequest, target: &Path) -> Result<()> {
        let mut index = self.index();
        index.remove(&request.audio_path);
        index.insert(target.to_path_buf());
        Ok(())
    }
}
