//! Deferred symlink creation.
//!
//! Links are queued while entries are written and created at the end, so a
//! link can never redirect a later entry outside the destination.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{AppError, Result};

use super::path::{resolve_within_dir, validate_rel_link_target};

pub(super) struct QueuedSymlink {
    link_path: PathBuf,
    target: PathBuf,
    resolved_target: PathBuf,
}

/// Validate a link entry and queue it for creation.
pub(super) fn queue_symlink(link_path: &Path, target: &Path, dest_dir: &Path) -> Result<QueuedSymlink> {
    validate_rel_link_target(target)?;
    let parent = link_path
        .parent()
        .ok_or_else(|| AppError::extract("symlink entry has no parent directory"))?;
    let resolved_target = resolve_within_dir(dest_dir, &parent.join(target))?;
    Ok(QueuedSymlink {
        link_path: link_path.to_path_buf(),
        target: target.to_path_buf(),
        resolved_target,
    })
}

#[cfg(unix)]
fn create_symlink(link: &QueuedSymlink) -> std::io::Result<()> {
    std::os::unix::fs::symlink(&link.target, &link.link_path)
}

#[cfg(windows)]
fn create_symlink(link: &QueuedSymlink) -> std::io::Result<()> {
    if link.resolved_target.is_dir() {
        std::os::windows::fs::symlink_dir(&link.target, &link.link_path)
    } else {
        std::os::windows::fs::symlink_file(&link.target, &link.link_path)
    }
}

/// Create every queued link. Existing entries at the link path are replaced.
pub(super) fn create_queued_symlinks(pending: Vec<QueuedSymlink>) -> Result<()> {
    for link in pending {
        if let Some(parent) = link.link_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| AppError::extract(format!("failed to create directory {parent:?}: {e}")))?;
        }
        if fs::symlink_metadata(&link.link_path).is_ok_and(|m| !m.is_dir()) {
            let _ = fs::remove_file(&link.link_path);
        }
        if !link.resolved_target.exists() {
            log::debug!("Symlink {:?} points at a missing target", link.link_path);
        }
        create_symlink(&link).map_err(|e| {
            AppError::extract(format!("failed to create symlink at {:?}: {e}", link.link_path))
        })?;
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn creates_relative_link() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path();
        fs::create_dir_all(base.join("lib")).unwrap();
        fs::write(base.join("lib/npm-cli.js"), b"cli").unwrap();

        let link = base.join("bin/npm");
        let queued = queue_symlink(&link, Path::new("../lib/npm-cli.js"), base).unwrap();
        create_queued_symlinks(vec![queued]).unwrap();

        assert_eq!(fs::read(&link).unwrap(), b"cli");
    }

    #[test]
    fn escaping_link_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let link = dir.path().join("bin/evil");
        assert!(queue_symlink(&link, Path::new("../../../etc/passwd"), dir.path()).is_err());
    }
}
