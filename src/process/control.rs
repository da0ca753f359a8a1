//! Platform-agnostic process control functions.

use std::time::{Duration, Instant};

use crate::error::{AppError, Result};

/// Check if a process is alive by PID.
#[cfg(target_os = "windows")]
pub fn is_process_alive(pid: u32) -> bool {
    super::win_api::is_process_alive(pid)
}

/// Check if a process is alive by PID.
///
/// Zombies count as dead: a child that exited but was not reaped yet
/// still answers signal 0.
#[cfg(not(target_os = "windows"))]
pub fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    if kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }
    !is_zombie(pid)
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    // Format: "pid (comm) S ...". comm may contain spaces and parens.
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            let rest = &stat[stat.rfind(')')? + 1..];
            rest.split_whitespace().next().map(|state| state == "Z")
        })
        .unwrap_or(false)
}

#[cfg(all(unix, not(target_os = "linux")))]
fn is_zombie(_pid: u32) -> bool {
    false
}

/// Kill a process and its children.
#[cfg(target_os = "windows")]
pub fn force_kill(pid: u32) -> Result<()> {
    use std::os::windows::process::CommandExt as _;
    use windows::Win32::System::Threading::CREATE_NO_WINDOW;

    let output = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .creation_flags(CREATE_NO_WINDOW.0)
        .output()
        .map_err(|e| AppError::process(format!("Failed to run taskkill: {e}")))?;

    if output.status.success() {
        Ok(())
    } else {
        Err(AppError::process(format!(
            "taskkill failed for pid {}: {}",
            pid,
            command_detail(&output)
        )))
    }
}

/// Kill a process this launcher spawned, and its children.
///
/// Managed processes are spawned as group leaders, so signalling the group
/// takes the whole tree down. Not for processes found by port.
#[cfg(not(target_os = "windows"))]
pub fn force_kill(pid: u32) -> Result<()> {
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::{getpgid, getpgrp, Pid};

    let target = Pid::from_raw(pid as i32);
    match getpgid(Some(target)) {
        // Never signal our own group.
        Ok(pgid) if pgid != getpgrp() => killpg(pgid, Signal::SIGKILL).map_err(|e| {
            AppError::process(format!(
                "Failed to kill process group {} (from pid {}): {}",
                pgid.as_raw(),
                pid,
                e
            ))
        }),
        Ok(_) => kill(target, Signal::SIGKILL)
            .map_err(|e| AppError::process(format!("Failed to kill process {pid}: {e}"))),
        Err(e) => kill(target, Signal::SIGKILL).map_err(|kill_err| {
            AppError::process(format!(
                "Failed to kill process {} (getpgid failed: {}): {}",
                pid, e, kill_err
            ))
        }),
    }
}

/// Kill one process that this launcher did not spawn, plus its descendants.
///
/// Unlike [`force_kill`], processes that merely share its group survive.
#[cfg(target_os = "windows")]
pub fn kill_process(pid: u32) -> Result<()> {
    // taskkill /T only walks children of `pid`.
    force_kill(pid)
}

/// Kill one process that this launcher did not spawn.
///
/// Unlike [`force_kill`], processes that merely share its group survive.
#[cfg(not(target_os = "windows"))]
pub fn kill_process(pid: u32) -> Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if pid == 0 || pid > i32::MAX as u32 {
        return Err(AppError::process(format!("invalid pid {pid}")));
    }
    kill(Pid::from_raw(pid as i32), Signal::SIGKILL)
        .map_err(|e| AppError::process(format!("Failed to kill process {pid}: {e}")))
}

/// Kill every process with the given executable name.
///
/// Returns `Ok(false)` when no such process existed.
#[cfg(target_os = "windows")]
pub fn kill_by_name(name: &str) -> Result<bool> {
    use std::os::windows::process::CommandExt as _;
    use windows::Win32::System::Threading::CREATE_NO_WINDOW;

    let image = if name.to_ascii_lowercase().ends_with(".exe") {
        name.to_string()
    } else {
        format!("{name}.exe")
    };
    let output = std::process::Command::new("taskkill")
        .args(["/F", "/IM", &image])
        .creation_flags(CREATE_NO_WINDOW.0)
        .output()
        .map_err(|e| AppError::process(format!("Failed to run taskkill: {e}")))?;

    // 128: no task matched the image name.
    match output.status.code() {
        Some(0) => Ok(true),
        Some(128) => Ok(false),
        _ => Err(AppError::process(format!(
            "taskkill /IM {} failed: {}",
            image,
            command_detail(&output)
        ))),
    }
}

/// Kill every process with the given executable name.
///
/// Returns `Ok(false)` when no such process existed.
#[cfg(not(target_os = "windows"))]
pub fn kill_by_name(name: &str) -> Result<bool> {
    let output = std::process::Command::new("pkill")
        .args(["-KILL", "-x", name])
        .output()
        .map_err(|e| AppError::process(format!("Failed to run pkill: {e}")))?;

    // pkill: 0 matched, 1 nothing matched.
    match output.status.code() {
        Some(0) => Ok(true),
        Some(1) => Ok(false),
        _ => Err(AppError::process(format!(
            "pkill -x {} failed: {}",
            name,
            command_detail(&output)
        ))),
    }
}

/// Poll until the process is gone or the timeout elapses. Blocking.
pub fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !is_process_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}

fn command_detail(output: &std::process::Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let detail = stderr.trim();
    let detail = if detail.is_empty() {
        stdout.trim()
    } else {
        detail
    };
    if detail.is_empty() {
        "(no output)".to_string()
    } else {
        detail.to_string()
    }
}
