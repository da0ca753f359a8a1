use std::fs;
use std::io;
use std::path::Path;

use crate::error::{AppError, Result};

/// What happened to one archive entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum EntryOutcome {
    Written,
    Skipped,
}

#[cfg(unix)]
fn apply_unix_mode(path: &Path, mode: Option<u32>) -> Result<()> {
    use std::os::unix::fs::PermissionsExt as _;

    if let Some(mode) = mode.map(|m| m & 0o7777).filter(|&m| m != 0) {
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .map_err(|e| AppError::extract(format!("failed to set permissions on {path:?}: {e}")))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn apply_unix_mode(_path: &Path, _mode: Option<u32>) -> Result<()> {
    Ok(())
}

/// Materialize one entry at `out_path`.
///
/// A file entry whose target is already a directory is skipped; the
/// directory wins. Any I/O failure while writing is an extraction error.
pub(super) fn write_entry<R>(
    out_path: &Path,
    is_dir: bool,
    reader: &mut R,
    unix_mode: Option<u32>,
    declared_size: Option<u64>,
) -> Result<EntryOutcome>
where
    R: io::Read,
{
    if is_dir {
        fs::create_dir_all(out_path)
            .map_err(|e| AppError::extract(format!("failed to create directory {out_path:?}: {e}")))?;
        return Ok(EntryOutcome::Written);
    }

    if out_path.is_dir() {
        log::warn!(
            "Skipping file entry {:?}: a directory already exists there",
            out_path
        );
        return Ok(EntryOutcome::Skipped);
    }

    if let Some(parent) = out_path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| AppError::extract(format!("failed to create directory {parent:?}: {e}")))?;
    }

    let mut outfile = fs::File::create(out_path)
        .map_err(|e| AppError::extract(format!("failed to create {out_path:?}: {e}")))?;
    let written = io::copy(reader, &mut outfile)
        .map_err(|e| AppError::extract(format!("failed to write {out_path:?}: {e}")))?;
    if let Some(expected) = declared_size {
        if written != expected {
            return Err(AppError::extract(format!(
                "size mismatch for {out_path:?}: expected {expected} bytes, wrote {written}"
            )));
        }
    }
    apply_unix_mode(out_path, unix_mode)?;
    Ok(EntryOutcome::Written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_lands_with_parents() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("a/b/c.txt");
        let outcome = write_entry(&out, false, &mut &b"hello"[..], None, Some(5)).unwrap();
        assert_eq!(outcome, EntryOutcome::Written);
        assert_eq!(fs::read(&out).unwrap(), b"hello");
    }

    #[test]
    fn directory_wins_over_file() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("data");
        fs::create_dir(&out).unwrap();

        let outcome = write_entry(&out, false, &mut &b"x"[..], None, None).unwrap();

        assert_eq!(outcome, EntryOutcome::Skipped);
        assert!(out.is_dir());
    }

    #[test]
    fn size_mismatch_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("short.bin");
        let err = write_entry(&out, false, &mut &b"abc"[..], None, Some(10)).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Extract);
    }

    #[test]
    fn file_blocking_parent_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("blocker"), b"").unwrap();
        let out = dir.path().join("blocker/inner.txt");
        assert!(write_entry(&out, false, &mut &b"x"[..], None, None).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn keeps_executable_bit() {
        use std::os::unix::fs::PermissionsExt as _;

        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("start.sh");
        write_entry(&out, false, &mut &b"#!/bin/sh"[..], Some(0o100755), None).unwrap();
        let mode = fs::metadata(&out).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }
}
