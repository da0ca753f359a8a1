//! Filesystem layout of the launcher, derived from one base directory.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{AppError, Result};

/// Directory name of the deployed application inside the base directory.
pub const APP_DIR_NAME: &str = "oman-swiss-army-tool";

pub const CONFIG_FILENAME: &str = "runner-config.json";
pub const LOCK_FILENAME: &str = "launcher.lock";
pub const LOG_FILENAME: &str = "launcher.log";

/// Every location the launcher touches.
///
/// Built once at startup and shared read-only afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LauncherPaths {
    pub base: PathBuf,
    /// Default install directory; the settings may point elsewhere.
    pub install_dir: PathBuf,
    pub config_file: PathBuf,
    /// Download target for the application archive.
    pub package_download: PathBuf,
    /// Download target for the managed runtime archive.
    pub runtime_download: PathBuf,
    pub extract_staging_dir: PathBuf,
    pub lock_file: PathBuf,
    pub log_file: PathBuf,
    /// Persisted auxiliary binaries. Must survive install directory wipes.
    pub tools_bin_dir: PathBuf,
}

impl LauncherPaths {
    pub fn from_base(base: impl Into<PathBuf>) -> Self {
        let base = base.into();
        Self {
            install_dir: base.join(APP_DIR_NAME),
            config_file: base.join(CONFIG_FILENAME),
            package_download: base.join("update.zip"),
            runtime_download: base.join(format!(
                "runtime-download.{}",
                crate::platform::runtime_archive_extension()
            )),
            extract_staging_dir: base.join("update_staging"),
            lock_file: base.join(LOCK_FILENAME),
            log_file: base.join(LOG_FILENAME),
            tools_bin_dir: base.join("tools"),
            base,
        }
    }

    /// Default base directory (`<local data dir>/oman-launcher`).
    pub fn default_base() -> Result<PathBuf> {
        dirs::data_local_dir()
            .or_else(dirs::home_dir)
            .map(|dir| dir.join("oman-launcher"))
            .ok_or_else(|| AppError::config("Cannot determine a data directory"))
    }

    /// Download staging files, one per artifact.
    pub fn download_staging_files(&self) -> [&Path; 2] {
        [&self.package_download, &self.runtime_download]
    }

    /// Create the base and tools directories.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.base, &self.tools_bin_dir] {
            fs::create_dir_all(dir)
                .map_err(|e| AppError::io(format!("Failed to create {}: {}", dir.display(), e)))?;
        }
        Ok(())
    }

    /// Reject install directories that would swallow launcher-owned state.
    ///
    /// The install directory is deleted wholesale on every deploy, so it must not
    /// contain the tools directory, the base directory or the staging area.
    pub fn validate_install_dir(&self, install_dir: &Path) -> Result<()> {
        let install_dir = lexical_normalize(install_dir);
        let guarded = [
            ("tools directory", &self.tools_bin_dir),
            ("launcher base directory", &self.base),
            ("staging directory", &self.extract_staging_dir),
        ];
        for (label, path) in guarded {
            if lexical_normalize(path).starts_with(&install_dir) {
                return Err(AppError::config(format!(
                    "Install directory {} would contain the {} {}",
                    install_dir.display(),
                    label,
                    path.display()
                )));
            }
        }
        Ok(())
    }
}

/// Resolve `.` and `..` without touching the filesystem.
fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
