//! Managed Node.js runtime kept in the tools directory.
//!
//! Downloaded once from nodejs.org and reused across application updates;
//! it lives outside the install directory so deploys never wipe it.

use std::path::{Path, PathBuf};

use crate::archive;
use crate::download::{discard_file, Downloader};
use crate::error::{AppError, Result};
use crate::paths::LauncherPaths;
use crate::platform::{node_dist_target, runtime_archive_extension, runtime_archive_kind};
use crate::progress::ProgressFn;

pub const NODE_VERSION: &str = "v20.18.0";

/// Executable name of the runtime, as seen by process listings.
pub const RUNTIME_PROCESS_NAME: &str = "node";

pub fn runtime_root(tools_bin_dir: &Path) -> PathBuf {
    tools_bin_dir.join("node")
}

/// Directory holding `node` and `npm`, suitable for `PATH`.
pub fn managed_bin_dir(tools_bin_dir: &Path) -> PathBuf {
    if cfg!(target_os = "windows") {
        runtime_root(tools_bin_dir)
    } else {
        runtime_root(tools_bin_dir).join("bin")
    }
}

pub fn managed_node(tools_bin_dir: &Path) -> PathBuf {
    if cfg!(target_os = "windows") {
        managed_bin_dir(tools_bin_dir).join("node.exe")
    } else {
        managed_bin_dir(tools_bin_dir).join("node")
    }
}

pub fn managed_npm(tools_bin_dir: &Path) -> PathBuf {
    if cfg!(target_os = "windows") {
        managed_bin_dir(tools_bin_dir).join("npm.cmd")
    } else {
        managed_bin_dir(tools_bin_dir).join("npm")
    }
}

pub fn is_runtime_installed(tools_bin_dir: &Path) -> bool {
    managed_node(tools_bin_dir).is_file() && managed_npm(tools_bin_dir).exists()
}

/// Official distribution URL for this host.
pub fn runtime_download_url() -> Result<String> {
    let target = node_dist_target().map_err(AppError::other)?;
    Ok(format!(
        "https://nodejs.org/dist/{v}/node-{v}-{target}.{ext}",
        v = NODE_VERSION,
        ext = runtime_archive_extension()
    ))
}

/// Install the runtime unless it is already present.
///
/// Returns whether anything was installed.
pub async fn ensure_runtime(
    downloader: &dyn Downloader,
    paths: &LauncherPaths,
    on_progress: ProgressFn<'_>,
) -> Result<bool> {
    if is_runtime_installed(&paths.tools_bin_dir) {
        log::debug!("Managed runtime already present");
        return Ok(false);
    }
    let url = runtime_download_url()?;
    install_from(downloader, &url, paths, on_progress).await?;
    Ok(true)
}

async fn install_from(
    downloader: &dyn Downloader,
    url: &str,
    paths: &LauncherPaths,
    on_progress: ProgressFn<'_>,
) -> Result<()> {
    let root = runtime_root(&paths.tools_bin_dir);
    let archive_path = &paths.runtime_download;
    log::info!("Installing Node.js {} into {:?}", NODE_VERSION, root);

    let result = async {
        downloader.download(url, archive_path, on_progress).await?;

        // A half-extracted runtime from an earlier attempt is not reusable.
        if root.exists() {
            std::fs::remove_dir_all(&root).map_err(|e| {
                AppError::extract(format!("failed to clear {}: {e}", root.display()))
            })?;
        }
        archive::extract_runtime(archive_path, &root, runtime_archive_kind(), on_progress).await?;

        if !is_runtime_installed(&paths.tools_bin_dir) {
            return Err(AppError::extract(format!(
                "Node.js {} extracted but {} is missing",
                NODE_VERSION,
                managed_node(&paths.tools_bin_dir).display()
            )));
        }
        Ok(())
    }
    .await;

    discard_file(archive_path);
    if result.is_err() && root.exists() {
        if let Err(e) = std::fs::remove_dir_all(&root) {
            log::warn!("Failed to remove partial runtime {:?}: {}", root, e);
        }
    }
    result
}
