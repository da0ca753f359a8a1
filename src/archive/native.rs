//! Extraction through the platform's own unzip tool.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio::task::JoinHandle;

use crate::error::{AppError, Result};
use crate::process::ToolProcess;
use crate::progress::{ratio_percent, ProgressFn, ProgressUpdate};

use super::zip_ops::count_zip_files;
use super::ExtractStats;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[cfg(target_os = "windows")]
fn ps_quote(path: &Path) -> String {
    format!("'{}'", path.display().to_string().replace('\'', "''"))
}

#[cfg(target_os = "windows")]
fn extract_command(archive: &Path, dest: &Path) -> (Command, &'static str) {
    let script = format!(
        "Expand-Archive -LiteralPath {} -DestinationPath {} -Force",
        ps_quote(archive),
        ps_quote(dest)
    );
    let mut cmd = Command::new("powershell");
    cmd.args(["-NoProfile", "-NonInteractive", "-Command", &script]);
    (cmd, "Expand-Archive")
}

#[cfg(not(target_os = "windows"))]
fn extract_command(archive: &Path, dest: &Path) -> (Command, &'static str) {
    let mut cmd = Command::new("unzip");
    cmd.arg("-o").arg("-q").arg(archive).arg("-d").arg(dest);
    (cmd, "unzip")
}

fn count_files(dir: &Path) -> u64 {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| !e.file_type().is_dir())
        .count() as u64
}

async fn count_files_blocking(dir: PathBuf) -> u64 {
    tokio::task::spawn_blocking(move || count_files(&dir))
        .await
        .unwrap_or(0)
}

/// Background file count of a directory, walked on the blocking pool.
struct FileCounter {
    count: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

impl FileCounter {
    fn start(dir: PathBuf, every: Duration) -> Self {
        let count = Arc::new(AtomicU64::new(0));
        let latest = Arc::clone(&count);
        let task = tokio::spawn(async move {
            loop {
                latest.store(count_files_blocking(dir.clone()).await, Ordering::Relaxed);
                tokio::time::sleep(every).await;
            }
        });
        Self { count, task }
    }

    fn current(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Drop for FileCounter {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Run the native unzip tool and report progress by counting written files.
///
/// Success is the tool's exit code 0. Entry-level conflict handling is
/// whatever the tool does.
pub(super) async fn extract_with_tool(
    archive: &Path,
    dest: &Path,
    on_progress: ProgressFn<'_>,
) -> Result<ExtractStats> {
    std::fs::create_dir_all(dest)
        .map_err(|e| AppError::extract(format!("failed to create {dest:?}: {e}")))?;
    let total = count_zip_files(archive)?;

    let (cmd, label) = extract_command(archive, dest);
    log::info!("Extracting {:?} with {}", archive, label);
    let tool = ToolProcess::spawn(cmd, label)
        .map_err(|e| AppError::extract(format!("failed to run {label}: {e}")))?;

    let report = |done: u64| {
        let done = done.min(total);
        on_progress(ProgressUpdate::determinate(
            ratio_percent(done, total),
            format!("Extracting: {done}/{total} files"),
        ));
    };
    let outcome = {
        let counter = FileCounter::start(dest.to_path_buf(), POLL_INTERVAL);
        tool.supervise(POLL_INTERVAL, || report(counter.current()))
            .await
            .map_err(|e| AppError::extract(e.to_string()))?
    };
    outcome.check(label).map_err(AppError::extract)?;

    let written = count_files_blocking(dest.to_path_buf()).await;
    report(written);
    Ok(ExtractStats {
        written,
        skipped: 0,
    })
}
