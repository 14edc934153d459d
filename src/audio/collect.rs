use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use super::AUDIO_EXTENSION;

/// Case-insensitive extension check.
pub fn has_extension(path: &Path, extension: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case(extension))
        .unwrap_or(false)
}

/// Recursively list files under `root` with the given extension.
///
/// Entries are visited sorted by file name at every level, so the result
/// is stable for a fixed filesystem state. Unreadable entries are logged
/// and skipped.
pub fn collect_files_with_extension(root: &Path, extension: &str) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry under {}: {}", root.display(), e);
                continue;
            }
        };

        if entry.file_type().is_file() && has_extension(entry.path(), extension) {
            files.push(entry.into_path());
        }
    }

    debug!(
        "Collected {} .{} files under {}",
        files.len(),
        extension,
        root.display()
    );
    files
}

/// Recursively list audio clips under `root`.
pub fn collect_audio_files(root: &Path) -> Vec<PathBuf> {
    collect_files_with_extension(root, AUDIO_EXTENSION)
}
