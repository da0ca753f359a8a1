//! Package deployment: extract into staging, then swap the install directory.
//!
//! The old install is renamed to a sibling `*.retired` directory before the
//! new content moves in, and renamed back if the move fails. Extraction
//! happens entirely in the staging area, so a broken archive never touches
//! the install directory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::archive::{self, ExtractMethod, ExtractStats};
use crate::error::{AppError, Result};
use crate::progress::ProgressFn;

const RETIRED_SUFFIX: &str = ".retired";

/// Extracts a package into the staging area and deploys it.
pub struct PackageDeployer {
    staging_dir: PathBuf,
    native_threshold_bytes: u64,
}

impl PackageDeployer {
    pub fn new(staging_dir: impl Into<PathBuf>, native_threshold_bytes: u64) -> Self {
        Self {
            staging_dir: staging_dir.into(),
            native_threshold_bytes,
        }
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Extract `archive` into a fresh staging directory.
    pub async fn extract(&self, archive: &Path, on_progress: ProgressFn<'_>) -> Result<ExtractStats> {
        remove_dir_if_present(&self.staging_dir)
            .map_err(|e| AppError::extract(format!("failed to clear staging: {e}")))?;

        let size = fs::metadata(archive)
            .map_err(|e| AppError::extract(format!("cannot read {}: {e}", archive.display())))?
            .len();
        let method = ExtractMethod::for_archive_size(size, self.native_threshold_bytes);

        let result = archive::extract_package(archive, &self.staging_dir, method, on_progress).await;
        if result.is_err() {
            self.discard_staging();
        }
        result
    }

    /// Move the staged content into `install_dir`.
    pub async fn deploy(&self, install_dir: &Path) -> Result<()> {
        let staging = self.staging_dir.clone();
        let install_dir = install_dir.to_path_buf();
        tokio::task::spawn_blocking(move || deploy_staged(&staging, &install_dir, &FsSteps))
            .await
            .map_err(|e| AppError::deploy(format!("deploy task failed: {e}")))?
    }

    /// Remove the staging directory, ignoring a missing one.
    pub fn discard_staging(&self) {
        if let Err(e) = remove_dir_if_present(&self.staging_dir) {
            log::warn!("Failed to remove staging {:?}: {}", self.staging_dir, e);
        }
    }
}

/// The directory to deploy: the only child of `staging` if it is a lone
/// directory, otherwise `staging` itself.
pub fn select_extracted_root(staging: &Path) -> Result<PathBuf> {
    let entries: Vec<fs::DirEntry> = fs::read_dir(staging)
        .map_err(|e| AppError::deploy(format!("cannot read staging {}: {e}", staging.display())))?
        .collect::<io::Result<_>>()
        .map_err(|e| AppError::deploy(format!("cannot read staging {}: {e}", staging.display())))?;

    match entries.as_slice() {
        [] => Err(AppError::deploy("the package archive contained nothing")),
        [only] if only.file_type().is_ok_and(|t| t.is_dir()) => Ok(only.path()),
        _ => Ok(staging.to_path_buf()),
    }
}

fn retired_path(install_dir: &Path) -> PathBuf {
    let mut name = install_dir.as_os_str().to_owned();
    name.push(RETIRED_SUFFIX);
    PathBuf::from(name)
}

fn remove_dir_if_present(dir: &Path) -> io::Result<()> {
    match fs::remove_dir_all(dir) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Filesystem operations of a deploy, one per step.
trait DeploySteps {
    fn retire(&self, install_dir: &Path, retired: &Path) -> io::Result<()>;
    fn move_in(&self, root: &Path, install_dir: &Path) -> io::Result<()>;
    fn restore(&self, retired: &Path, install_dir: &Path) -> io::Result<()>;
    fn remove(&self, dir: &Path) -> io::Result<()>;
}

struct FsSteps;

impl DeploySteps for FsSteps {
    fn retire(&self, install_dir: &Path, retired: &Path) -> io::Result<()> {
        fs::rename(install_dir, retired)
    }

    fn move_in(&self, root: &Path, install_dir: &Path) -> io::Result<()> {
        match fs::rename(root, install_dir) {
            Ok(()) => Ok(()),
            Err(e) => {
                log::info!("Rename into place failed ({}), copying instead", e);
                copy_tree(root, install_dir)
            }
        }
    }

    fn restore(&self, retired: &Path, install_dir: &Path) -> io::Result<()> {
        fs::rename(retired, install_dir)
    }

    fn remove(&self, dir: &Path) -> io::Result<()> {
        remove_dir_if_present(dir)
    }
}

fn copy_tree(from: &Path, to: &Path) -> io::Result<()> {
    for entry in walkdir::WalkDir::new(from) {
        let entry = entry.map_err(io::Error::other)?;
        let relative = entry.path().strip_prefix(from).map_err(io::Error::other)?;
        let target = to.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(link: &Path, target: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(fs::read_link(link)?, target)
}

#[cfg(not(unix))]
fn copy_symlink(link: &Path, target: &Path) -> io::Result<()> {
    fs::copy(link, target).map(|_| ())
}

fn deploy_staged(staging: &Path, install_dir: &Path, steps: &dyn DeploySteps) -> Result<()> {
    let root = select_extracted_root(staging)?;
    if let Some(parent) = install_dir.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| AppError::deploy(format!("cannot create {}: {e}", parent.display())))?;
    }

    let retired = retired_path(install_dir);
    steps.remove(&retired).map_err(|e| {
        AppError::deploy(format!("stale {} cannot be removed: {e}", retired.display()))
    })?;

    let had_install = install_dir.exists();
    if had_install {
        steps.retire(install_dir, &retired).map_err(|e| {
            AppError::deploy(format!(
                "failed to move {} aside: {e}",
                install_dir.display()
            ))
        })?;
    }

    if let Err(e) = steps.move_in(&root, install_dir) {
        log::error!("Failed to move new content into {:?}: {}", install_dir, e);
        if let Err(cleanup) = steps.remove(install_dir) {
            log::warn!("Failed to remove partial install: {}", cleanup);
        }
        if had_install {
            if let Err(restore) = steps.restore(&retired, install_dir) {
                log::error!(
                    "Rollback failed, {:?} is now absent (previous install kept at {:?}): {}",
                    install_dir,
                    retired,
                    restore
                );
                return Err(AppError::deploy(format!(
                    "failed to install new content ({e}) and to restore the previous install ({restore})"
                )));
            }
            log::info!("Restored previous install at {:?}", install_dir);
        }
        return Err(AppError::deploy(format!("failed to install new content: {e}")));
    }

    if had_install {
        if let Err(e) = steps.remove(&retired) {
            log::warn!("Failed to remove retired install {:?}: {}", retired, e);
        }
    }
    if let Err(e) = steps.remove(staging) {
        log::warn!("Failed to remove staging {:?}: {}", staging, e);
    }

    log::info!("Deployed new content to {:?}", install_dir);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[derive(Default)]
    struct Faults {
        retire: bool,
        move_in: bool,
        restore: bool,
        remove_after_success: bool,
        moved: Cell<bool>,
    }

    impl DeploySteps for Faults {
        fn retire(&self, install_dir: &Path, retired: &Path) -> io::Result<()> {
            if self.retire {
                return Err(io::Error::other("retire refused"));
            }
            FsSteps.retire(install_dir, retired)
        }

        fn move_in(&self, root: &Path, install_dir: &Path) -> io::Result<()> {
            if self.move_in {
                // Leave a partial copy behind, like an interrupted copy would.
                fs::create_dir_all(install_dir)?;
                fs::write(install_dir.join("partial"), b"x")?;
                return Err(io::Error::other("disk full"));
            }
            FsSteps.move_in(root, install_dir)?;
            self.moved.set(true);
            Ok(())
        }

        fn restore(&self, retired: &Path, install_dir: &Path) -> io::Result<()> {
            if self.restore {
                return Err(io::Error::other("restore refused"));
            }
            FsSteps.restore(retired, install_dir)
        }

        fn remove(&self, dir: &Path) -> io::Result<()> {
            if self.remove_after_success && self.moved.get() {
                return Err(io::Error::other("busy"));
            }
            FsSteps.remove(dir)
        }
    }

    struct Layout {
        _dir: tempfile::TempDir,
        staging: PathBuf,
        install: PathBuf,
    }

    fn layout() -> Layout {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join("update_staging");
        let install = dir.path().join("app");
        fs::create_dir_all(staging.join("OmanSwissArmy-1.1.0")).unwrap();
        fs::write(staging.join("OmanSwissArmy-1.1.0/version.txt"), b"new").unwrap();
        fs::create_dir_all(&install).unwrap();
        fs::write(install.join("version.txt"), b"old").unwrap();
        Layout {
            _dir: dir,
            staging,
            install,
        }
    }

    fn version(install: &Path) -> Option<String> {
        fs::read_to_string(install.join("version.txt")).ok()
    }

    #[test]
    fn single_directory_is_unwrapped() {
        let l = layout();
        assert_eq!(
            select_extracted_root(&l.staging).unwrap(),
            l.staging.join("OmanSwissArmy-1.1.0")
        );

        fs::write(l.staging.join("README.md"), b"").unwrap();
        assert_eq!(select_extracted_root(&l.staging).unwrap(), l.staging);
    }

    #[test]
    fn empty_staging_is_a_deploy_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = select_extracted_root(dir.path()).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Deploy);
    }

    #[test]
    fn successful_deploy_swaps_content() {
        let l = layout();
        deploy_staged(&l.staging, &l.install, &FsSteps).unwrap();

        assert_eq!(version(&l.install).as_deref(), Some("new"));
        assert!(!retired_path(&l.install).exists());
        assert!(!l.staging.exists());
    }

    #[test]
    fn first_install_needs_no_retire() {
        let l = layout();
        fs::remove_dir_all(&l.install).unwrap();
        deploy_staged(&l.staging, &l.install, &FsSteps).unwrap();
        assert_eq!(version(&l.install).as_deref(), Some("new"));
    }

    #[test]
    fn retire_failure_keeps_old_content() {
        let l = layout();
        let faults = Faults {
            retire: true,
            ..Default::default()
        };
        assert!(deploy_staged(&l.staging, &l.install, &faults).is_err());
        assert_eq!(version(&l.install).as_deref(), Some("old"));
    }

    #[test]
    fn move_failure_rolls_back() {
        let l = layout();
        let faults = Faults {
            move_in: true,
            ..Default::default()
        };
        let err = deploy_staged(&l.staging, &l.install, &faults).unwrap_err();

        assert_eq!(err.kind(), crate::ErrorKind::Deploy);
        assert_eq!(version(&l.install).as_deref(), Some("old"));
        assert!(!l.install.join("partial").exists());
        assert!(!retired_path(&l.install).exists());
    }

    #[test]
    fn failed_rollback_leaves_install_absent() {
        let l = layout();
        let faults = Faults {
            move_in: true,
            restore: true,
            ..Default::default()
        };
        assert!(deploy_staged(&l.staging, &l.install, &faults).is_err());
        assert!(!l.install.exists());
        assert_eq!(version(&retired_path(&l.install)).as_deref(), Some("old"));
    }

    #[test]
    fn cleanup_failure_is_not_fatal() {
        let l = layout();
        let faults = Faults {
            remove_after_success: true,
            ..Default::default()
        };
        deploy_staged(&l.staging, &l.install, &faults).unwrap();
        assert_eq!(version(&l.install).as_deref(), Some("new"));
    }

    #[test]
    fn copy_tree_reproduces_layout() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("from");
        fs::create_dir_all(from.join("nested/deeper")).unwrap();
        fs::write(from.join("nested/deeper/file.txt"), b"deep").unwrap();

        let to = dir.path().join("to");
        copy_tree(&from, &to).unwrap();

        assert_eq!(fs::read(to.join("nested/deeper/file.txt")).unwrap(), b"deep");
    }

    #[tokio::test]
    async fn broken_archive_leaves_install_untouched() {
        let l = layout();
        let archive = l.staging.parent().unwrap().join("update.zip");
        fs::write(&archive, b"not a zip").unwrap();
        let deployer = PackageDeployer::new(&l.staging, 0);

        let err = deployer.extract(&archive, &|_| {}).await.unwrap_err();

        assert_eq!(err.kind(), crate::ErrorKind::Extract);
        assert_eq!(version(&l.install).as_deref(), Some("old"));
        assert!(!l.staging.exists());
    }
}
