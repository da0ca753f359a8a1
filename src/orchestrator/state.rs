use std::time::SystemTime;

use serde::Serialize;

use crate::process::ProcessState;

/// Snapshot of what the launcher currently knows. Never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct RunState {
    pub installed: bool,
    pub running: bool,
    pub busy: bool,
    /// Only set when this launcher spawned the application.
    pub managed_pid: Option<u32>,
    pub process_state: ProcessState,
    pub local_version: String,
    pub latest_tag: Option<String>,
    pub feed_online: bool,
    pub last_progress_at: Option<SystemTime>,
    pub last_progress_percent: Option<f64>,
    pub stalled: bool,
}

/// Result of a finished `run_update`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UpdateOutcome {
    UpToDate { tag: String },
    /// `started` is false when the deploy succeeded but the relaunch did not.
    Updated { tag: String, started: bool },
}

/// Result of comparing the local version with the feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UpdateCheck {
    InstallAvailable { tag: String },
    UpdateAvailable { tag: String, local: String },
    UpToDate { tag: String },
}

impl UpdateCheck {
    pub fn compare(installed: bool, local: &str, tag: &str) -> Self {
        if !installed {
            Self::InstallAvailable {
                tag: tag.to_string(),
            }
        } else if local == tag {
            Self::UpToDate {
                tag: tag.to_string(),
            }
        } else {
            Self::UpdateAvailable {
                tag: tag.to_string(),
                local: local.to_string(),
            }
        }
    }

    pub fn has_work(&self) -> bool {
        !matches!(self, Self::UpToDate { .. })
    }

    pub fn message(&self) -> String {
        match self {
            Self::InstallAvailable { tag } => format!("Install available ({tag})"),
            Self::UpdateAvailable { tag, .. } => format!("Update available ({tag})"),
            Self::UpToDate { tag } => format!("Up to date ({tag})"),
        }
    }
}

/// Progress bookkeeping shared with the stall monitor.
#[derive(Debug, Clone, Default)]
pub(crate) struct ProgressMark {
    pub at: Option<SystemTime>,
    pub percent: Option<f64>,
    pub stalled: bool,
}
