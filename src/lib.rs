//! Self-updating launcher for Oman Swiss Army Tool.
//!
//! Checks the GitHub release feed, downloads and deploys new packages,
//! supervises the application process and guards against a second launcher.

pub mod archive;
pub mod commands;
pub mod config;
pub mod deploy;
pub mod download;
mod error;
pub mod github;
pub mod lock;
pub mod logging;
pub mod orchestrator;
pub mod paths;
pub mod platform;
pub mod process;
pub mod progress;
pub mod runtime;

pub use config::{ConfigStore, Settings};
pub use error::{AppError, ErrorKind, Result};
pub use lock::{InstanceLock, LockGuard};
pub use orchestrator::{
    LauncherEvent, NotificationLevel, Orchestrator, OrchestratorBuilder, RunState, UpdateCheck,
    UpdateOutcome,
};
pub use paths::LauncherPaths;
pub use process::{ProcessHandle, ProcessState};
pub use progress::{ProgressFn, ProgressUpdate};
