//! Archive extraction with progress.
//!
//! The application package (zip) goes through one of two interchangeable
//! strategies picked by size. The managed runtime archive (zip or tar.gz) is
//! always extracted in-process and flattened.

mod extract;
mod links;
mod native;
mod path;
mod tar_gz;
mod zip_ops;

use std::path::{Path, PathBuf};

use tokio::sync::mpsc;

use crate::error::{AppError, Result};
use crate::platform::RuntimeArchiveKind;
use crate::progress::{ProgressFn, ProgressUpdate};

/// Entry counts of a finished extraction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractStats {
    pub written: u64,
    pub skipped: u64,
}

/// How to extract the application package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractMethod {
    InProcess,
    NativeTool,
}

impl ExtractMethod {
    /// Archives larger than the threshold go to the native tool.
    /// A zero threshold keeps everything in-process.
    pub fn for_archive_size(size: u64, threshold_bytes: u64) -> Self {
        if threshold_bytes > 0 && size > threshold_bytes {
            Self::NativeTool
        } else {
            Self::InProcess
        }
    }
}

/// Run a blocking extraction job on the blocking pool, relaying its progress.
async fn run_blocking<F>(job: F, on_progress: ProgressFn<'_>) -> Result<ExtractStats>
where
    F: FnOnce(ProgressFn<'_>) -> Result<ExtractStats> + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<ProgressUpdate>();
    let mut task = tokio::task::spawn_blocking(move || {
        job(&move |update| {
            let _ = tx.send(update);
        })
    });

    loop {
        tokio::select! {
            Some(update) = rx.recv() => on_progress(update),
            joined = &mut task => {
                while let Ok(update) = rx.try_recv() {
                    on_progress(update);
                }
                return joined
                    .map_err(|e| AppError::extract(format!("extraction task failed: {e}")))?;
            }
        }
    }
}

/// Extract the application package into `dest` without reshaping it.
pub async fn extract_package(
    archive: &Path,
    dest: &Path,
    method: ExtractMethod,
    on_progress: ProgressFn<'_>,
) -> Result<ExtractStats> {
    let stats = match method {
        ExtractMethod::NativeTool => native::extract_with_tool(archive, dest, on_progress).await?,
        ExtractMethod::InProcess => {
            let (archive, dest) = (archive.to_path_buf(), dest.to_path_buf());
            run_blocking(
                move |progress| zip_ops::extract_zip(&archive, &dest, false, progress),
                on_progress,
            )
            .await?
        }
    };
    log::info!(
        "Extracted {:?} via {:?}: {} written, {} skipped",
        archive,
        method,
        stats.written,
        stats.skipped
    );
    Ok(stats)
}

/// Extract a runtime distribution into `dest`, dropping its top-level directory.
pub async fn extract_runtime(
    archive: &Path,
    dest: &Path,
    kind: RuntimeArchiveKind,
    on_progress: ProgressFn<'_>,
) -> Result<ExtractStats> {
    let (archive, dest): (PathBuf, PathBuf) = (archive.to_path_buf(), dest.to_path_buf());
    run_blocking(
        move |progress| match kind {
            RuntimeArchiveKind::Zip => zip_ops::extract_zip(&archive, &dest, true, progress),
            RuntimeArchiveKind::TarGz => tar_gz::extract_tar_gz_flat(&archive, &dest, progress),
        },
        on_progress,
    )
    .await
}
