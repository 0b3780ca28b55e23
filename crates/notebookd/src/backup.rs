//! Pre-mutation snapshots of notebook files.
//!
//! Backups copy the persisted file, not the in-memory document, so a
//! snapshot always captures the last successfully saved state. Names are
//! timestamped to the second; collisions within the same second get a
//! `-N` suffix. Backups are write-once and never pruned here.

use std::path::{Path, PathBuf};

use log::info;

use crate::error::{NotebookError, Result};

/// Copy `path` to a timestamped sibling and return the backup path.
pub fn snapshot(path: &Path) -> Result<PathBuf> {
    if !path.exists() {
        return Err(NotebookError::SourceMissing(path.to_path_buf()));
    }

    let target = backup_path(path);
    std::fs::copy(path, &target).map_err(|e| NotebookError::WriteFailed {
        path: target.clone(),
        detail: e.to_string(),
    })?;

    info!("backed up {:?} -> {:?}", path, target);
    Ok(target)
}

/// First non-existing `{stem}_backup_{YYYYmmdd_HHMMSS}[-N]{ext}` sibling.
fn backup_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "notebook".to_string());
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");

    let mut candidate = path.with_file_name(format!("{stem}_backup_{stamp}{ext}"));
    let mut counter = 1;
    while candidate.exists() {
        candidate = path.with_file_name(format!("{stem}_backup_{stamp}-{counter}{ext}"));
        counter += 1;
    }
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_snapshot_copies_persisted_bytes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("analysis.ipynb");
        std::fs::write(&path, b"{\"cells\": []}").unwrap();

        let backup = snapshot(&path).unwrap();
        assert!(backup.exists());
        assert_eq!(
            std::fs::read(&path).unwrap(),
            std::fs::read(&backup).unwrap()
        );

        let name = backup.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("analysis_backup_"));
        assert!(name.ends_with(".ipynb"));
    }

    #[test]
    fn test_snapshot_missing_source() {
        let dir = TempDir::new().unwrap();
        let err = snapshot(&dir.path().join("never-saved.ipynb")).unwrap_err();
        assert_eq!(err.kind(), "source_missing");
    }

    #[test]
    fn test_same_second_snapshots_do_not_collide() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nb.ipynb");
        std::fs::write(&path, b"one").unwrap();

        let first = snapshot(&path).unwrap();
        std::fs::write(&path, b"two").unwrap();
        let second = snapshot(&path).unwrap();
        std::fs::write(&path, b"three").unwrap();
        let third = snapshot(&path).unwrap();

        assert_ne!(first, second);
        assert_ne!(second, third);
        assert_eq!(std::fs::read(&first).unwrap(), b"one");
        assert_eq!(std::fs::read(&second).unwrap(), b"two");
        assert_eq!(std::fs::read(&third).unwrap(), b"three");
    }
}
