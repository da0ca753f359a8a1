//! Download engine: fetch a URL to a local file with progress.
//!
//! Two interchangeable strategies implement [`Downloader`]:
//! - [`HttpDownloader`] streams the body in-process with byte-accurate progress
//! - [`NativeToolDownloader`] delegates the transfer to `curl`
//!
//! Both write to `<dest>.part` and rename it into place only once the transfer
//! is complete, so `dest` is either absent or fully written.

mod meter;
mod native;
mod stream;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::progress::ProgressFn;

pub use meter::{format_speed, TransferMeter};
pub use native::NativeToolDownloader;
pub use stream::HttpDownloader;

pub(crate) const USER_AGENT: &str = concat!("oman-launcher/", env!("CARGO_PKG_VERSION"));

/// Which transfer implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStrategy {
    #[default]
    Stream,
    Native,
}

#[async_trait]
pub trait Downloader: Send + Sync {
    /// Fetch `url` into `dest`, reporting progress along the way.
    async fn download(&self, url: &str, dest: &Path, on_progress: ProgressFn<'_>) -> Result<()>;
}

/// Build the downloader for a strategy.
pub fn downloader_for(strategy: DownloadStrategy, client: &Client) -> Arc<dyn Downloader> {
    match strategy {
        DownloadStrategy::Stream => Arc::new(HttpDownloader::new(client.clone())),
        DownloadStrategy::Native => Arc::new(NativeToolDownloader::default()),
    }
}

pub(crate) fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

/// Remove a file, treating "already gone" as success.
pub fn discard_file(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => log::debug!("Removed {:?}", path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("Failed to remove {:?}: {}", path, e),
    }
}

/// Prepare a transfer: make room for the file and clear anything stale.
pub(crate) fn prepare_destination(url: &str, dest: &Path) -> Result<PathBuf> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| AppError::download(url, e.to_string()))?;
    }
    discard_file(dest);
    let part = part_path(dest);
    discard_file(&part);
    Ok(part)
}

/// Promote a finished part file, or remove it when the transfer failed.
pub(crate) fn settle_part(url: &str, part: &Path, dest: &Path, outcome: Result<()>) -> Result<()> {
    match outcome {
        Ok(()) => fs::rename(part, dest).map_err(|e| {
            discard_file(part);
            AppError::download(url, format!("failed to finalize {}: {}", dest.display(), e))
        }),
        Err(e) => {
            discard_file(part);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_path_appends_suffix() {
        assert_eq!(
            part_path(Path::new("/tmp/update.zip")),
            PathBuf::from("/tmp/update.zip.part")
        );
    }

    #[test]
    fn failed_transfer_removes_part_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("update.zip");
        let part = prepare_destination("http://x", &dest).unwrap();
        fs::write(&part, b"half").unwrap();

        let result = settle_part("http://x", &part, &dest, Err(AppError::download("http://x", "boom")));

        assert!(result.is_err());
        assert!(!part.exists());
        assert!(!dest.exists());
    }

    #[test]
    fn finished_transfer_is_promoted() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("nested").join("update.zip");
        let part = prepare_destination("http://x", &dest).unwrap();
        fs::write(&part, b"complete").unwrap();

        settle_part("http://x", &part, &dest, Ok(())).unwrap();

        assert_eq!(fs::read(&dest).unwrap(), b"complete");
        assert!(!part.exists());
    }

    #[test]
    fn strategy_parses_lowercase() {
        let strategy: DownloadStrategy = serde_json::from_str("\"native\"").unwrap();
        assert_eq!(strategy, DownloadStrategy::Native);
        assert_eq!(DownloadStrategy::default(), DownloadStrategy::Stream);
    }
}
