//! Short-lived helper processes (curl, unzip, PowerShell).
//!
//! Each spawn hands back its own output channel and exit receiver, so callers
//! never have to filter a shared event stream by PID.

use std::collections::VecDeque;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt as _, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};

use crate::error::{AppError, Result};

/// Lines of output kept for error messages.
const OUTPUT_TAIL_LINES: usize = 20;

/// A spawned helper process.
pub struct ToolProcess {
    pub label: String,
    pub pid: Option<u32>,
    /// Interleaved stdout/stderr lines. Closed once both pipes hit EOF.
    pub output: mpsc::Receiver<String>,
    /// Resolves once the process has exited and been reaped.
    pub exit: oneshot::Receiver<io::Result<ExitStatus>>,
}

/// How a helper process ended.
#[derive(Debug)]
pub struct ToolOutcome {
    pub status: ExitStatus,
    pub tail: Vec<String>,
}

impl ToolOutcome {
    /// Succeed on exit code 0, otherwise describe the failure with the output tail.
    pub fn check(&self, label: &str) -> std::result::Result<(), String> {
        if self.status.success() {
            return Ok(());
        }
        let detail = self.tail.join(" | ");
        Err(if detail.is_empty() {
            format!("{label} exited with {}", self.status)
        } else {
            format!("{label} exited with {}: {detail}", self.status)
        })
    }
}

impl ToolProcess {
    pub fn spawn(mut command: Command, label: &str) -> Result<Self> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(target_os = "windows")]
        {
            use windows::Win32::System::Threading::CREATE_NO_WINDOW;
            command.creation_flags(CREATE_NO_WINDOW.0);
        }

        let mut child = command
            .spawn()
            .map_err(|e| AppError::process(format!("Failed to spawn {label}: {e}")))?;
        let pid = child.id();
        log::debug!("Spawned {} (pid: {:?})", label, pid);

        let (line_tx, output) = mpsc::channel(256);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, line_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, line_tx));
        }

        let (exit_tx, exit) = oneshot::channel();
        tokio::spawn(async move {
            let _ = exit_tx.send(child.wait().await);
        });

        Ok(Self {
            label: label.to_string(),
            pid,
            output,
            exit,
        })
    }

    /// Wait for the process to exit, calling `on_tick` every `tick` meanwhile.
    pub async fn supervise<F>(mut self, tick: Duration, mut on_tick: F) -> Result<ToolOutcome>
    where
        F: FnMut() + Send,
    {
        let mut tail = VecDeque::with_capacity(OUTPUT_TAIL_LINES);
        let mut ticker = tokio::time::interval(tick);

        let exit = loop {
            tokio::select! {
                Some(line) = self.output.recv() => {
                    log::debug!("[{}] {}", self.label, line);
                    push_tail(&mut tail, line);
                }
                _ = ticker.tick() => on_tick(),
                exit = &mut self.exit => break exit,
            }
        };

        while let Ok(line) = self.output.try_recv() {
            push_tail(&mut tail, line);
        }
        on_tick();

        let status = exit
            .map_err(|_| AppError::process(format!("{} exit status was lost", self.label)))?
            .map_err(|e| AppError::process(format!("Failed to wait for {}: {e}", self.label)))?;

        Ok(ToolOutcome {
            status,
            tail: tail.into_iter().collect(),
        })
    }
}

fn push_tail(tail: &mut VecDeque<String>, line: String) {
    if tail.len() == OUTPUT_TAIL_LINES {
        tail.pop_front();
    }
    tail.push_back(line);
}

async fn forward_lines<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        if tx.send(line).await.is_err() {
            break;
        }
    }
}
