use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;

use super::{prepare_destination, settle_part, Downloader, TransferMeter, USER_AGENT};
use crate::error::{AppError, Result};
use crate::process::ToolProcess;
use crate::progress::ProgressFn;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Delegates the transfer to an external `curl`.
///
/// Progress comes from watching the part file grow; the total size is unknown
/// to us, so reports are indeterminate and carry the byte count in the label.
pub struct NativeToolDownloader {
    program: PathBuf,
}

impl Default for NativeToolDownloader {
    fn default() -> Self {
        Self::with_program("curl")
    }
}

impl NativeToolDownloader {
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self, url: &str, part: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("--location")
            .arg("--fail")
            .arg("--silent")
            .arg("--show-error")
            .arg("--user-agent")
            .arg(USER_AGENT)
            .arg("--output")
            .arg(part)
            .arg(url);
        cmd
    }

    async fn fetch_into(&self, url: &str, part: &Path, on_progress: ProgressFn<'_>) -> Result<()> {
        let tool = ToolProcess::spawn(self.command(url, part), "curl")
            .map_err(|e| AppError::download(url, e.to_string()))?;

        let mut meter = TransferMeter::new(None);
        let outcome = tool
            .supervise(POLL_INTERVAL, || {
                let size = fs::metadata(part).map(|m| m.len()).unwrap_or(0);
                if size > 0 {
                    on_progress(meter.observe_received_at(size, Instant::now()));
                }
            })
            .await
            .map_err(|e| AppError::download(url, e.to_string()))?;

        outcome
            .check("curl")
            .map_err(|detail| AppError::download(url, detail))?;

        if !part.is_file() {
            return Err(AppError::download(url, "curl produced no output file"));
        }
        Ok(())
    }
}

#[async_trait]
impl Downloader for NativeToolDownloader {
    async fn download(&self, url: &str, dest: &Path, on_progress: ProgressFn<'_>) -> Result<()> {
        let part = prepare_destination(url, dest)?;
        log::info!("Downloading {} -> {:?} via {:?}", url, dest, self.program);
        let outcome = self.fetch_into(url, &part, on_progress).await;
        settle_part(url, &part, dest, outcome)
    }
}
