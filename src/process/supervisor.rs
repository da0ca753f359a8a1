//! Supervision of the managed application process.

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::io::{AsyncBufReadExt as _, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::watch;

use super::control::{force_kill, is_process_alive, kill_by_name, kill_process, wait_for_exit};
use super::ports::{find_listening_pid, is_port_listening};
use super::{EARLY_EXIT_WINDOW, READINESS_POLL, READINESS_TIMEOUT, STOP_WAIT};
use crate::config::Settings;
use crate::error::{AppError, Result};
use crate::runtime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    NotInstalled,
    Stopped,
    Starting,
    Running,
    Stopping,
    StartFailed,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::NotInstalled => "Not installed",
            Self::Stopped => "Stopped",
            Self::Starting => "Starting",
            Self::Running => "Running",
            Self::Stopping => "Stopping",
            Self::StartFailed => "Start failed",
        };
        f.write_str(label)
    }
}

/// Exit code of a finished process; `None` when it was killed by a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    pub code: Option<i32>,
}

/// A process started by this launcher.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: u32,
    port: u16,
    exit: watch::Receiver<Option<ExitReport>>,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Exit report if the process has already finished.
    pub fn exited(&self) -> Option<ExitReport> {
        *self.exit.borrow()
    }

    /// Wait for the process to exit.
    pub async fn wait(&mut self) -> Option<ExitReport> {
        self.exit
            .wait_for(|report| report.is_some())
            .await
            .ok()
            .and_then(|report| *report)
    }
}

/// How the application gets launched, in order of preference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchPlan {
    /// Operator supplied command line, run through the platform shell.
    Shell(String),
    /// Launch script shipped inside the install directory.
    Script(PathBuf),
    /// `npm run start`, optionally with a private runtime prepended to `PATH`.
    Npm {
        program: PathBuf,
        path_prefix: Option<PathBuf>,
    },
}

#[cfg(target_os = "windows")]
const LAUNCH_SCRIPT: &str = "start.bat";
#[cfg(not(target_os = "windows"))]
const LAUNCH_SCRIPT: &str = "start.sh";

impl LaunchPlan {
    pub fn resolve(settings: &Settings, install_dir: &Path, tools_bin_dir: &Path) -> Result<Self> {
        let command = settings.start_command.trim();
        if !command.is_empty() {
            return Ok(Self::Shell(command.to_string()));
        }

        let script = install_dir.join(LAUNCH_SCRIPT);
        if script.is_file() {
            return Ok(Self::Script(script));
        }

        let managed = runtime::managed_npm(tools_bin_dir);
        if managed.is_file() {
            return Ok(Self::Npm {
                program: managed,
                path_prefix: Some(runtime::managed_bin_dir(tools_bin_dir)),
            });
        }

        if let Ok(global) = which::which("npm") {
            log::info!("Using system npm at {:?}", global);
            return Ok(Self::Npm {
                program: global,
                path_prefix: None,
            });
        }

        Err(AppError::start(format!(
            "no start command configured, no {} in {} and npm was not found",
            LAUNCH_SCRIPT,
            install_dir.display()
        )))
    }

    fn command(&self) -> Result<Command> {
        let cmd = match self {
            Self::Shell(line) => shell_command(line),
            Self::Script(script) => script_command(script),
            Self::Npm {
                program,
                path_prefix,
            } => {
                let mut cmd = npm_command(program);
                cmd.args(["run", "start"]);
                if let Some(prefix) = path_prefix {
                    cmd.env("PATH", prepend_path(prefix)?);
                }
                cmd
            }
        };
        Ok(cmd)
    }
}

impl fmt::Display for LaunchPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shell(line) => write!(f, "{line}"),
            Self::Script(script) => write!(f, "{}", script.display()),
            Self::Npm { program, .. } => write!(f, "{} run start", program.display()),
        }
    }
}

#[cfg(target_os = "windows")]
fn shell_command(line: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").raw_arg(line);
    cmd
}

#[cfg(not(target_os = "windows"))]
fn shell_command(line: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(line);
    cmd
}

#[cfg(target_os = "windows")]
fn script_command(script: &Path) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(script);
    cmd
}

#[cfg(not(target_os = "windows"))]
fn script_command(script: &Path) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg(script);
    cmd
}

#[cfg(target_os = "windows")]
fn npm_command(program: &Path) -> Command {
    // npm ships as a .cmd shim on Windows.
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(program);
    cmd
}

#[cfg(not(target_os = "windows"))]
fn npm_command(program: &Path) -> Command {
    Command::new(program)
}

fn prepend_path(dir: &Path) -> Result<OsString> {
    let mut paths = vec![dir.to_path_buf()];
    if let Some(existing) = std::env::var_os("PATH") {
        paths.extend(std::env::split_paths(&existing));
    }
    std::env::join_paths(paths)
        .map_err(|e| AppError::start(format!("Failed to build PATH: {e}")))
}

struct OwnedProcess {
    pid: u32,
    exit: watch::Receiver<Option<ExitReport>>,
}

struct Shared {
    state: watch::Sender<ProcessState>,
    owned: Mutex<Option<OwnedProcess>>,
}

impl Shared {
    fn set_state(&self, next: ProcessState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            log::info!("Application state: {} -> {}", previous, next);
        }
    }
}

/// Owns the lifecycle of the managed application process.
///
/// Only a process spawned here is "owned"; an application found already
/// listening on the port is attached to, which means it can be stopped by
/// port but its pid is never recorded.
pub struct ProcessSupervisor {
    tools_bin_dir: PathBuf,
    shared: Arc<Shared>,
}

impl ProcessSupervisor {
    pub fn new(tools_bin_dir: impl Into<PathBuf>) -> Self {
        let (state, _) = watch::channel(ProcessState::Stopped);
        Self {
            tools_bin_dir: tools_bin_dir.into(),
            shared: Arc::new(Shared {
                state,
                owned: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ProcessState {
        *self.shared.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ProcessState> {
        self.shared.state.subscribe()
    }

    /// PID of the process this launcher spawned, if it is still tracked.
    pub fn managed_pid(&self) -> Option<u32> {
        let owned = self.shared.owned.lock().unwrap_or_else(|e| e.into_inner());
        owned.as_ref().map(|p| p.pid)
    }

    /// Reflect whether an installation exists.
    pub fn set_installed(&self, installed: bool) {
        match (installed, self.state()) {
            (false, ProcessState::Running | ProcessState::Starting) => {}
            (false, _) => self.shared.set_state(ProcessState::NotInstalled),
            (true, ProcessState::NotInstalled | ProcessState::StartFailed) => {
                self.shared.set_state(ProcessState::Stopped)
            }
            (true, _) => {}
        }
    }

    /// Launch the application from `install_dir`.
    pub async fn start(&self, settings: &Settings, install_dir: &Path) -> Result<ProcessHandle> {
        if !install_dir.is_dir() {
            self.shared.set_state(ProcessState::NotInstalled);
            return Err(AppError::start(format!(
                "install directory {} does not exist",
                install_dir.display()
            )));
        }
        if let Some(pid) = self.managed_pid() {
            if is_process_alive(pid) {
                return Err(AppError::start(format!(
                    "application is already running (pid {pid})"
                )));
            }
        }

        self.shared.set_state(ProcessState::Starting);
        match self.spawn(settings, install_dir).await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                log::error!("Failed to start application: {}", e);
                self.shared.set_state(ProcessState::StartFailed);
                Err(e)
            }
        }
    }

    async fn spawn(&self, settings: &Settings, install_dir: &Path) -> Result<ProcessHandle> {
        let plan = LaunchPlan::resolve(settings, install_dir, &self.tools_bin_dir)?;
        let port = settings.listen_port;
        log::info!("Starting application: {} (port {})", plan, port);

        let mut cmd = plan.command()?;
        cmd.current_dir(install_dir)
            .env("PORT", port.to_string())
            .env("APP_PORT", port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(target_os = "windows")]
        {
            use windows::Win32::System::Threading::CREATE_NO_WINDOW;
            cmd.creation_flags(CREATE_NO_WINDOW.0);
        }

        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| AppError::start(format!("Failed to spawn {plan}: {e}")))?;
        let pid = child
            .id()
            .ok_or_else(|| AppError::start("Failed to get process ID"))?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(log_lines(stdout, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_lines(stderr, "stderr"));
        }

        let (exit_tx, mut exit_rx) = watch::channel(None);
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let report = match child.wait().await {
                Ok(status) => {
                    log::info!("Application process {} exited: {}", pid, status);
                    ExitReport {
                        code: status.code(),
                    }
                }
                Err(e) => {
                    log::warn!("Failed to wait for application process {}: {}", pid, e);
                    ExitReport { code: None }
                }
            };
            exit_tx.send_replace(Some(report));

            let mut owned = shared.owned.lock().unwrap_or_else(|e| e.into_inner());
            if owned.as_ref().is_some_and(|p| p.pid == pid) {
                *owned = None;
                if *shared.state.borrow() == ProcessState::Running {
                    shared.set_state(ProcessState::Stopped);
                }
            }
        });

        let early_exit =
            tokio::time::timeout(EARLY_EXIT_WINDOW, exit_rx.wait_for(|r| r.is_some()))
                .await
                .ok()
                .and_then(|r| r.ok().and_then(|report| *report));
        if let Some(report) = early_exit {
            return Err(AppError::start(match report.code {
                Some(code) => format!("application exited immediately with code {code}"),
                None => "application was terminated immediately".to_string(),
            }));
        }

        {
            let mut owned = self.shared.owned.lock().unwrap_or_else(|e| e.into_inner());
            if exit_rx.borrow().is_some() {
                return Err(AppError::start("application exited during startup"));
            }
            *owned = Some(OwnedProcess {
                pid,
                exit: exit_rx.clone(),
            });
            self.shared.set_state(ProcessState::Running);
        }
        log::info!("Application started (pid: {}, port: {})", pid, port);

        tokio::spawn(probe_readiness(port, exit_rx.clone()));

        Ok(ProcessHandle {
            pid,
            port,
            exit: exit_rx,
        })
    }

    /// Best-effort stop. Never fails; every step logs and moves on.
    pub async fn stop(&self, settings: &Settings) {
        let was_installed = self.state() != ProcessState::NotInstalled;
        self.shared.set_state(ProcessState::Stopping);

        let owned = self
            .shared
            .owned
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(process) = owned {
            if process.exit.borrow().is_none() {
                let pid = process.pid;
                log::info!("Stopping spawned process tree (pid: {})", pid);
                let stopped = tokio::task::spawn_blocking(move || {
                    if let Err(e) = force_kill(pid) {
                        log::warn!("Failed to kill pid {}: {}", pid, e);
                    }
                    wait_for_exit(pid, STOP_WAIT)
                })
                .await
                .unwrap_or(false);
                if !stopped {
                    log::warn!("Process {} still alive after stop", pid);
                }
            }
        }

        let port = settings.listen_port;
        let own_pid = std::process::id();
        match tokio::task::spawn_blocking(move || find_listening_pid(port))
            .await
            .ok()
            .flatten()
        {
            Some(pid) if pid == own_pid => {
                log::warn!("Port {} is held by the launcher itself; not killing", port);
            }
            Some(pid) => {
                log::info!("Stopping process {} listening on port {}", pid, port);
                let outcome = tokio::task::spawn_blocking(move || {
                    kill_process(pid).map(|()| wait_for_exit(pid, STOP_WAIT))
                })
                .await;
                match outcome {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => log::warn!("Failed to kill process on port {}: {}", port, e),
                    Err(e) => log::warn!("Port kill task failed: {}", e),
                }
            }
            None => log::info!("No process found on port {}", port),
        }

        if settings.allow_force_kill_by_name {
            let name = runtime::RUNTIME_PROCESS_NAME;
            match tokio::task::spawn_blocking(move || kill_by_name(name)).await {
                Ok(Ok(true)) => log::warn!("Forced stop for every {} process", name),
                Ok(Ok(false)) => {}
                Ok(Err(e)) => log::warn!("Failed to kill {} processes: {}", name, e),
                Err(e) => log::warn!("Kill-by-name task failed: {}", e),
            }
        }

        self.shared.set_state(if was_installed {
            ProcessState::Stopped
        } else {
            ProcessState::NotInstalled
        });
    }

    /// Whether something already serves the application port.
    pub async fn detect_running(&self, port: u16) -> bool {
        is_port_listening(port).await
    }

    /// Adopt an application that is already listening on `port`.
    ///
    /// The state becomes `Running` without a managed pid.
    pub async fn attach_if_running(&self, port: u16) -> bool {
        if !self.detect_running(port).await {
            return false;
        }
        log::info!("Attached to application already listening on port {}", port);
        self.shared.set_state(ProcessState::Running);
        true
    }

    /// Re-probe an attached application and drop to `Stopped` once it is gone.
    ///
    /// A reported start failure also settles back to `Stopped` here.
    pub async fn refresh(&self, port: u16) -> ProcessState {
        let state = self.state();
        if state == ProcessState::StartFailed {
            self.shared.set_state(ProcessState::Stopped);
            return ProcessState::Stopped;
        }
        if state == ProcessState::Running
            && self.managed_pid().is_none()
            && !self.detect_running(port).await
        {
            log::info!("Attached application on port {} is gone", port);
            self.shared.set_state(ProcessState::Stopped);
        }
        self.state()
    }
}

async fn log_lines<R>(reader: R, stream: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if stream == "stderr" {
            log::warn!("[app {}] {}", stream, line);
        } else {
            log::info!("[app {}] {}", stream, line);
        }
    }
}

async fn probe_readiness(port: u16, exit: watch::Receiver<Option<ExitReport>>) {
    let deadline = tokio::time::Instant::now() + READINESS_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if exit.borrow().is_some() {
            return;
        }
        if is_port_listening(port).await {
            log::info!("Application is listening on port {}", port);
            return;
        }
        tokio::time::sleep(READINESS_POLL).await;
    }
    log::warn!(
        "Application did not open port {} within {}s",
        port,
        READINESS_TIMEOUT.as_secs()
    );
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::paths::LauncherPaths;

    fn settings_in(dir: &Path) -> Settings {
        let paths = LauncherPaths::from_base(dir);
        let mut settings = Settings::defaults_for(&paths);
        settings.listen_port = portpicker::pick_unused_port().unwrap();
        settings
    }

    #[test]
    fn override_wins_over_script() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(LAUNCH_SCRIPT), "exit 0").unwrap();
        let mut settings = settings_in(dir.path());
        settings.start_command = "  run-me --now ".to_string();

        let plan = LaunchPlan::resolve(&settings, dir.path(), &dir.path().join("tools")).unwrap();
        assert_eq!(plan, LaunchPlan::Shell("run-me --now".to_string()));
    }

    #[test]
    fn script_wins_over_npm() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join(LAUNCH_SCRIPT);
        std::fs::write(&script, "exit 0").unwrap();
        let settings = settings_in(dir.path());

        let plan = LaunchPlan::resolve(&settings, dir.path(), &dir.path().join("tools")).unwrap();
        assert_eq!(plan, LaunchPlan::Script(script));
    }

    #[test]
    fn managed_npm_preferred_over_system() {
        let dir = tempfile::tempdir().unwrap();
        let tools = dir.path().join("tools");
        let npm = runtime::managed_npm(&tools);
        std::fs::create_dir_all(npm.parent().unwrap()).unwrap();
        std::fs::write(&npm, "").unwrap();
        let settings = settings_in(dir.path());

        let plan = LaunchPlan::resolve(&settings, dir.path(), &tools).unwrap();
        assert_eq!(
            plan,
            LaunchPlan::Npm {
                program: npm,
                path_prefix: Some(runtime::managed_bin_dir(&tools)),
            }
        );
    }

    #[tokio::test]
    async fn missing_install_dir_means_not_installed() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = ProcessSupervisor::new(dir.path().join("tools"));
        let settings = settings_in(dir.path());

        let err = supervisor
            .start(&settings, &dir.path().join("absent"))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), crate::ErrorKind::Start);
        assert_eq!(supervisor.state(), ProcessState::NotInstalled);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn immediate_exit_is_a_start_failure() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = ProcessSupervisor::new(dir.path().join("tools"));
        let mut settings = settings_in(dir.path());
        settings.start_command = "exit 4".to_string();

        let err = supervisor.start(&settings, dir.path()).await.unwrap_err();

        assert!(err.to_string().contains("code 4"), "{err}");
        assert_eq!(supervisor.state(), ProcessState::StartFailed);
        assert_eq!(supervisor.managed_pid(), None);

        assert_eq!(
            supervisor.refresh(settings.listen_port).await,
            ProcessState::Stopped
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn start_failure_settles_when_install_changes() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = ProcessSupervisor::new(dir.path().join("tools"));
        let mut settings = settings_in(dir.path());
        settings.start_command = "exit 1".to_string();

        assert!(supervisor.start(&settings, dir.path()).await.is_err());
        assert_eq!(supervisor.state(), ProcessState::StartFailed);

        supervisor.set_installed(true);
        assert_eq!(supervisor.state(), ProcessState::Stopped);
    }

    /// `python3 -c` program that listens on `$PORT` until killed.
    #[cfg(unix)]
    const LISTEN_ON_PORT: &str = "import os, socket, time; s = socket.socket(); \
s.setsockopt(socket.SOL_SOCKET, socket.SO_REUSEADDR, 1); \
s.bind(('127.0.0.1', int(os.environ['PORT']))); s.listen(); time.sleep(300)";

    #[cfg(unix)]
    async fn wait_until_listening(port: u16) -> bool {
        for _ in 0..50 {
            if is_port_listening(port).await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        false
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn port_stop_spares_the_listeners_group() {
        use std::os::unix::process::CommandExt as _;

        if which::which("python3").is_err() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_in(dir.path());
        let sibling_file = dir.path().join("sibling");

        // A foreign group: a bystander plus the listener as group leader.
        let mut foreign = std::process::Command::new("sh")
            .arg("-c")
            .arg(format!(
                "sleep 300 & echo $! > {}; exec python3 -c \"{}\"",
                sibling_file.display(),
                LISTEN_ON_PORT
            ))
            .env("PORT", settings.listen_port.to_string())
            .process_group(0)
            .spawn()
            .unwrap();
        assert!(wait_until_listening(settings.listen_port).await);
        let sibling: u32 = std::fs::read_to_string(&sibling_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();

        ProcessSupervisor::new(dir.path().join("tools"))
            .stop(&settings)
            .await;

        assert!(!foreign.wait().unwrap().success());
        assert!(!is_port_listening(settings.listen_port).await);
        let sibling_alive = is_process_alive(sibling);
        let _ = force_kill(sibling);
        assert!(sibling_alive);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn start_then_stop_twice() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = ProcessSupervisor::new(dir.path().join("tools"));
        let mut settings = settings_in(dir.path());
        settings.start_command = "sleep 30".to_string();

        let mut handle = supervisor.start(&settings, dir.path()).await.unwrap();
        assert_eq!(supervisor.state(), ProcessState::Running);
        assert_eq!(supervisor.managed_pid(), Some(handle.pid()));

        supervisor.stop(&settings).await;
        assert_eq!(supervisor.state(), ProcessState::Stopped);
        assert_eq!(supervisor.managed_pid(), None);
        assert!(handle.wait().await.is_some());
        assert!(!is_process_alive(handle.pid()));

        supervisor.stop(&settings).await;
        assert_eq!(supervisor.state(), ProcessState::Stopped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exit_after_start_returns_to_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = ProcessSupervisor::new(dir.path().join("tools"));
        let mut settings = settings_in(dir.path());
        settings.start_command = "sleep 2".to_string();

        let mut handle = supervisor.start(&settings, dir.path()).await.unwrap();
        let report = handle.wait().await.unwrap();
        assert_eq!(report.code, Some(0));

        let mut states = supervisor.subscribe();
        states
            .wait_for(|s| *s == ProcessState::Stopped)
            .await
            .unwrap();
        assert_eq!(supervisor.managed_pid(), None);
    }

    #[tokio::test]
    async fn attach_and_detach_follow_the_port() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = ProcessSupervisor::new(dir.path().join("tools"));
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();

        assert!(supervisor.attach_if_running(port).await);
        assert_eq!(supervisor.state(), ProcessState::Running);
        assert_eq!(supervisor.managed_pid(), None);

        drop(listener);
        assert_eq!(supervisor.refresh(port).await, ProcessState::Stopped);
    }

    #[tokio::test]
    async fn nothing_to_attach_to() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = ProcessSupervisor::new(dir.path().join("tools"));
        let port = portpicker::pick_unused_port().unwrap();
        assert!(!supervisor.attach_if_running(port).await);
        assert_eq!(supervisor.state(), ProcessState::Stopped);
    }
}
