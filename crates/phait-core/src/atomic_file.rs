//! Crash-safe file replacement: write to a sibling temp file, fsync, rename over the target.
//! A reader sees either the old file or the complete new one, never a prefix.

use crate::error::PhaitResult;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Suffix marking in-progress writes. Anything carrying it after a crash is garbage.
pub(crate) const TEMP_SUFFIX: &str = ".tmp";

fn temp_path_for(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    target.with_file_name(format!(
        ".{}.{}{}",
        name,
        uuid::Uuid::new_v4().simple(),
        TEMP_SUFFIX
    ))
}

/// Stage `bytes` next to `target` without making them visible. Call [`commit`] to publish.
pub(crate) fn stage(target: &Path, bytes: &[u8]) -> PhaitResult<PathBuf> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = temp_path_for(target);
    let result = (|| -> std::io::Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()
    })();
    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(tmp)
}

/// Publish a staged file.
pub(crate) fn commit(staged: &Path, target: &Path) -> PhaitResult<()> {
    fs::rename(staged, target)?;
    #[cfg(unix)]
    if let Some(parent) = target.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub(crate) fn write_atomic(target: &Path, bytes: &[u8]) -> PhaitResult<()> {
    let staged = stage(target, bytes)?;
    if let Err(e) = commit(&staged, target) {
        let _ = fs::remove_file(&staged);
        return Err(e);
    }
    Ok(())
}

/// Remove temp files left behind by an interrupted write. Returns how many were removed.
pub(crate) fn sweep_temp_files(dir: &Path) -> PhaitResult<usize> {
    if !dir.is_dir() {
        return Ok(0);
    }
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_temp = path
            .file_name()
            .map(|n| {
                let n = n.to_string_lossy();
                n.starts_with('.') && n.ends_with(TEMP_SUFFIX)
            })
            .unwrap_or(false);
        if is_temp && fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_atomic_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a.enc");
        write_atomic(&target, b"first").unwrap();
        write_atomic(&target, b"second").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"second");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn staged_file_is_invisible_until_commit_and_swept() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("b.enc");
        let staged = stage(&target, b"pending").unwrap();
        assert!(!target.exists());
        assert!(staged.exists());

        assert_eq!(sweep_temp_files(dir.path()).unwrap(), 1);
        assert!(!staged.exists());
    }
}
