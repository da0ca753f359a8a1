//! Operator commands behind the CLI, plus the console view of launcher events.

use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use crate::error::{AppError, Result};
use crate::orchestrator::{
    LauncherEvent, NotificationLevel, Orchestrator, RunState, UpdateOutcome, AUTO_CHECK_INTERVAL,
};
use crate::progress::ProgressUpdate;

/// Set to any value to disable progress bars.
pub const NO_PROGRESS_ENV: &str = "OMAN_NO_PROGRESS";

fn is_progress_disabled() -> bool {
    std::env::var_os(NO_PROGRESS_ENV).is_some()
}

/// Renders launcher events on the terminal.
///
/// Only one bar exists at a time: determinate steps get a percentage bar,
/// unknown totals a spinner.
struct ConsoleView {
    bar: Option<ProgressBar>,
    spinning: bool,
    enabled: bool,
}

impl ConsoleView {
    fn new() -> Self {
        Self {
            bar: None,
            spinning: false,
            enabled: !is_progress_disabled(),
        }
    }

    fn print(&self, line: &str) {
        match &self.bar {
            Some(bar) => bar.println(line),
            None => println!("{line}"),
        }
    }

    fn bar_for(&mut self, indeterminate: bool) -> Option<&ProgressBar> {
        if !self.enabled {
            return None;
        }
        if self.bar.is_some() && self.spinning != indeterminate {
            self.finish();
        }
        if self.bar.is_none() {
            let bar = if indeterminate {
                let bar = ProgressBar::new_spinner();
                if let Ok(style) = ProgressStyle::with_template("{spinner} {msg}") {
                    bar.set_style(style);
                }
                bar.enable_steady_tick(Duration::from_millis(120));
                bar
            } else {
                let bar = ProgressBar::new(100);
                if let Ok(style) = ProgressStyle::with_template("[{bar:30}] {pos:>3}% {msg}") {
                    bar.set_style(style.progress_chars("=> "));
                }
                bar
            };
            self.spinning = indeterminate;
            self.bar = Some(bar);
        }
        self.bar.as_ref()
    }

    fn progress(&mut self, update: &ProgressUpdate) {
        let whole = update.whole_percent();
        if let Some(bar) = self.bar_for(whole.is_none()) {
            if let Some(percent) = whole {
                bar.set_position(u64::from(percent));
            }
            bar.set_message(update.label.clone());
        }
    }

    fn finish(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }

    fn handle(&mut self, event: LauncherEvent) {
        match event {
            LauncherEvent::Status { message } => {
                self.finish();
                self.print(&format!("> {message}"));
            }
            LauncherEvent::Progress(update) => self.progress(&update),
            LauncherEvent::Stall { stalled: true } => {
                self.print("! No progress for a while; the transfer may be stuck");
            }
            LauncherEvent::Stall { stalled: false } => self.print("  progress resumed"),
            LauncherEvent::ProcessState { state } => self.print(&format!("  application: {state}")),
            LauncherEvent::Notification {
                level,
                message,
                error,
            } => {
                let line = match (level, error) {
                    (NotificationLevel::Error, Some(e)) => format!("x {message}: {e}"),
                    (NotificationLevel::Error, None) => format!("x {message}"),
                    (NotificationLevel::Warn, _) => format!("! {message}"),
                    (NotificationLevel::Info, _) => format!("  {message}"),
                };
                self.print(&line);
            }
            LauncherEvent::UpdateFinished { .. } => self.finish(),
        }
    }
}

/// Print events until the channel closes.
pub fn spawn_console_observer(mut rx: broadcast::Receiver<LauncherEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut view = ConsoleView::new();
        loop {
            match rx.recv().await {
                Ok(event) => view.handle(event),
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("Console observer lagged, skipped {} events", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
        view.finish();
    })
}

pub fn print_state(state: &RunState) {
    println!("installed:     {}", state.installed);
    println!("version:       {}", state.local_version);
    if let Some(tag) = &state.latest_tag {
        println!("latest:        {tag}");
    }
    println!("application:   {}", state.process_state);
    match state.managed_pid {
        Some(pid) => println!("pid:           {pid}"),
        None if state.running => println!("pid:           (attached, not owned)"),
        None => {}
    }
    if state.busy {
        println!("busy:          update in progress");
    }
}

/// `check`: compare local and latest versions.
pub async fn check(orchestrator: &Orchestrator) -> Result<()> {
    orchestrator.initialize().await?;
    orchestrator.check_for_updates(false).await?;
    Ok(())
}

/// `update`: run one update cycle.
pub async fn update(orchestrator: &Orchestrator, force: bool) -> Result<()> {
    orchestrator.initialize().await?;
    match orchestrator.run_update(force).await? {
        UpdateOutcome::Updated { started: false, tag } => Err(AppError::start(format!(
            "{tag} was installed but the application did not start"
        ))),
        _ => Ok(()),
    }
}

pub async fn start(orchestrator: &Orchestrator) -> Result<()> {
    let state = orchestrator.initialize().await?;
    if state.running {
        log::info!("Application already running");
        return Ok(());
    }
    orchestrator.start_app().await.map(|_| ())
}

pub async fn stop(orchestrator: &Orchestrator) -> Result<()> {
    orchestrator.initialize().await?;
    orchestrator.stop_app().await
}

pub async fn status(orchestrator: &Orchestrator) -> Result<()> {
    orchestrator.initialize().await?;
    let _ = orchestrator.check_for_updates(true).await;
    print_state(&orchestrator.refresh_state().await);
    Ok(())
}

/// `run`: install or update if needed, keep the application running and
/// check for updates hourly until `shutdown` resolves.
///
/// `shutdown` is polled from the start, so an interrupt during the first
/// update abandons it and cleans up. The application keeps running after
/// the launcher exits.
pub async fn run<F>(orchestrator: &Orchestrator, shutdown: F) -> Result<()>
where
    F: std::future::Future<Output = ()>,
{
    tokio::pin!(shutdown);

    tokio::select! {
        result = bring_up(orchestrator) => result?,
        () = &mut shutdown => {
            log::warn!("Interrupted before the application was up");
            orchestrator.discard_partial_work();
            return Ok(());
        }
    }

    let auto_check = orchestrator.spawn_auto_check(AUTO_CHECK_INTERVAL);
    shutdown.await;
    auto_check.abort();
    log::info!("Launcher shutting down");
    Ok(())
}

async fn bring_up(orchestrator: &Orchestrator) -> Result<()> {
    let state = orchestrator.initialize().await?;
    let auto_update = orchestrator.config().snapshot().auto_update;

    if !state.installed || auto_update {
        match orchestrator.run_update(false).await {
            Ok(_) => {}
            Err(e) if state.installed => log::warn!("Update skipped: {}", e),
            Err(e) => return Err(e),
        }
    }

    let state = orchestrator.refresh_state().await;
    if !state.running {
        if let Err(e) = orchestrator.start_app().await {
            log::error!("Application did not start: {}", e);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;
    use crate::config::ConfigStore;
    use crate::download::{part_path, Downloader};
    use crate::github::{ReleaseFeed, ReleaseInfo};
    use crate::paths::LauncherPaths;
    use crate::process::ProcessState;
    use crate::progress::ProgressFn;

    struct NewRelease;

    #[async_trait]
    impl ReleaseFeed for NewRelease {
        async fn fetch_latest(&self) -> Result<ReleaseInfo> {
            Ok(ReleaseInfo {
                tag: "v1.1.0".into(),
                asset_url: Some("https://example.com/oman.zip".into()),
                asset_name: Some("oman.zip".into()),
                asset_size: None,
            })
        }
    }

    /// Writes part of the file, then never finishes.
    struct Hangs;

    #[async_trait]
    impl Downloader for Hangs {
        async fn download(&self, _url: &str, dest: &Path, on_progress: ProgressFn<'_>) -> Result<()> {
            std::fs::write(part_path(dest), b"partial").unwrap();
            on_progress(ProgressUpdate::determinate(10.0, "Downloading"));
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn shutdown_during_first_update_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let paths = LauncherPaths::from_base(dir.path());
        let config = ConfigStore::load(&paths).unwrap();
        config
            .with_settings_mut(|s| {
                s.managed_runtime = false;
                Ok(())
            })
            .unwrap();
        let orchestrator = Orchestrator::builder(paths.clone(), config)
            .feed(Arc::new(NewRelease))
            .downloader(Arc::new(Hangs))
            .build()
            .unwrap();
        let part = part_path(&paths.package_download);

        let result = tokio::time::timeout(
            Duration::from_secs(10),
            run(
                &orchestrator,
                tokio::time::sleep(Duration::from_millis(200)),
            ),
        )
        .await
        .expect("run ignored shutdown");

        assert!(result.is_ok());
        assert!(!orchestrator.is_busy());
        assert!(!part.exists());
        assert!(!paths.package_download.exists());
    }

    #[test]
    fn view_switches_between_bar_and_spinner() {
        let mut view = ConsoleView {
            bar: None,
            spinning: false,
            enabled: true,
        };

        view.progress(&ProgressUpdate::determinate(42.0, "Downloading"));
        assert!(!view.spinning);
        assert_eq!(view.bar.as_ref().map(|b| b.position()), Some(42));

        view.progress(&ProgressUpdate::indeterminate("Downloading: 3.0 MB"));
        assert!(view.spinning);

        view.handle(LauncherEvent::UpdateFinished { success: true });
        assert!(view.bar.is_none());
    }

    #[test]
    fn disabled_view_draws_no_bar() {
        let mut view = ConsoleView {
            bar: None,
            spinning: false,
            enabled: false,
        };
        view.progress(&ProgressUpdate::determinate(10.0, "Extracting"));
        view.handle(LauncherEvent::ProcessState {
            state: ProcessState::Running,
        });
        assert!(view.bar.is_none());
    }
}
