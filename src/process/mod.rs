//! Process management: the supervised application and short-lived helper tools.

mod control;
mod ports;
mod supervisor;
mod tool;

#[cfg(target_os = "windows")]
pub(crate) mod win_api;

use std::time::Duration;

pub use control::{force_kill, is_process_alive, kill_by_name, kill_process, wait_for_exit};
pub use ports::{find_listening_pid, is_port_listening};
pub use supervisor::{ExitReport, LaunchPlan, ProcessHandle, ProcessState, ProcessSupervisor};
pub use tool::{ToolOutcome, ToolProcess};

/// How long a freshly spawned process must survive to count as started.
const EARLY_EXIT_WINDOW: Duration = Duration::from_secs(1);

/// How long to wait for a killed process to disappear.
const STOP_WAIT: Duration = Duration::from_secs(5);

const READINESS_POLL: Duration = Duration::from_secs(1);
const READINESS_TIMEOUT: Duration = Duration::from_secs(120);
