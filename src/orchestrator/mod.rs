//! Update orchestration: release check, download, deploy and relaunch.
//!
//! [`Orchestrator`] is the single context object of the launcher. Observers
//! follow it through [`Orchestrator::subscribe`].

mod events;
mod stall;
mod state;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use reqwest::Client;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::{ConfigStore, Settings};
use crate::deploy::PackageDeployer;
use crate::download::{discard_file, downloader_for, part_path, Downloader, USER_AGENT};
use crate::error::{AppError, Result};
use crate::github::{GitHubReleaseFeed, ReleaseFeed, ReleaseInfo};
use crate::paths::LauncherPaths;
use crate::platform;
use crate::process::{ProcessHandle, ProcessState, ProcessSupervisor};
use crate::progress::ProgressUpdate;
use crate::runtime;

pub use events::{LauncherEvent, NotificationLevel};
pub use stall::{STALL_THRESHOLD, STALL_TICK};
pub use state::{RunState, UpdateCheck, UpdateOutcome};

use stall::{ProgressProbe, StallMonitor};

/// A resolved release is reused for this long.
pub const RELEASE_CACHE_TTL: Duration = Duration::from_secs(60);

pub const AUTO_CHECK_INTERVAL: Duration = Duration::from_secs(60 * 60);

const EVENT_CAPACITY: usize = 256;

/// Clears the busy flag when dropped.
struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| AppError::busy())?;
        Ok(Self(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct CachedRelease {
    fetched_at: Instant,
    info: ReleaseInfo,
}

struct Inner {
    paths: LauncherPaths,
    config: ConfigStore,
    client: Client,
    feed: Arc<dyn ReleaseFeed>,
    downloader: Option<Arc<dyn Downloader>>,
    supervisor: ProcessSupervisor,
    busy: AtomicBool,
    feed_online: AtomicBool,
    forwarding: AtomicBool,
    release: Mutex<Option<CachedRelease>>,
    events: broadcast::Sender<LauncherEvent>,
    probe: Arc<ProgressProbe>,
}

/// Configures an [`Orchestrator`]. Feed and downloader default to the real ones.
pub struct OrchestratorBuilder {
    paths: LauncherPaths,
    config: ConfigStore,
    client: Option<Client>,
    feed: Option<Arc<dyn ReleaseFeed>>,
    downloader: Option<Arc<dyn Downloader>>,
}

impl OrchestratorBuilder {
    pub fn client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    pub fn feed(mut self, feed: Arc<dyn ReleaseFeed>) -> Self {
        self.feed = Some(feed);
        self
    }

    /// Use this downloader regardless of the `downloadStrategy` setting.
    pub fn downloader(mut self, downloader: Arc<dyn Downloader>) -> Self {
        self.downloader = Some(downloader);
        self
    }

    pub fn build(self) -> Result<Orchestrator> {
        let client = match self.client {
            Some(client) => client,
            None => Client::builder()
                .user_agent(USER_AGENT)
                .connect_timeout(Duration::from_secs(15))
                .read_timeout(Duration::from_secs(60))
                .build()
                .map_err(|e| AppError::network(format!("Failed to create HTTP client: {e}")))?,
        };
        let feed = match self.feed {
            Some(feed) => feed,
            None => {
                let proxy = self.config.snapshot().github_proxy.clone();
                Arc::new(GitHubReleaseFeed::new(client.clone(), proxy))
            }
        };
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let probe = Arc::new(ProgressProbe::new(events.clone()));
        let supervisor = ProcessSupervisor::new(&self.paths.tools_bin_dir);

        Ok(Orchestrator {
            inner: Arc::new(Inner {
                paths: self.paths,
                config: self.config,
                client,
                feed,
                downloader: self.downloader,
                supervisor,
                busy: AtomicBool::new(false),
                feed_online: AtomicBool::new(true),
                forwarding: AtomicBool::new(false),
                release: Mutex::new(None),
                events,
                probe,
            }),
        })
    }
}

/// Drives update cycles and the managed application. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

/// Whether a cycle should provision the managed runtime.
///
/// Hosts without an official Node.js build fall back to the system npm.
fn needs_managed_runtime(
    settings: &Settings,
    dist_target: std::result::Result<&'static str, String>,
) -> bool {
    if !settings.managed_runtime || settings.has_start_override() {
        return false;
    }
    match dist_target {
        Ok(_) => true,
        Err(e) => {
            log::warn!("{}; using the system npm instead of a managed Node.js", e);
            false
        }
    }
}

/// Whether `install_dir` holds an installation.
fn is_installed(install_dir: &Path) -> bool {
    std::fs::read_dir(install_dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

impl Orchestrator {
    pub fn builder(paths: LauncherPaths, config: ConfigStore) -> OrchestratorBuilder {
        OrchestratorBuilder {
            paths,
            config,
            client: None,
            feed: None,
            downloader: None,
        }
    }

    pub fn paths(&self) -> &LauncherPaths {
        &self.inner.paths
    }

    pub fn config(&self) -> &ConfigStore {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LauncherEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_busy(&self) -> bool {
        self.inner.busy.load(Ordering::Acquire)
    }

    fn emit(&self, event: LauncherEvent) {
        let _ = self.inner.events.send(event);
    }

    fn status(&self, message: impl Into<String>) {
        let message = message.into();
        log::info!("{}", message);
        self.emit(LauncherEvent::status(message));
    }

    fn install_dir(&self, settings: &Settings) -> PathBuf {
        settings.resolved_install_dir(&self.inner.paths)
    }

    /// Probe the install directory and the application port.
    pub async fn initialize(&self) -> Result<RunState> {
        self.inner.paths.ensure_dirs()?;
        self.forward_process_state();

        let settings = self.inner.config.snapshot();
        let install_dir = self.install_dir(&settings);
        self.inner.paths.validate_install_dir(&install_dir)?;

        let installed = is_installed(&install_dir);
        self.inner.supervisor.set_installed(installed);
        if installed {
            if self
                .inner
                .supervisor
                .attach_if_running(settings.listen_port)
                .await
            {
                self.status(format!(
                    "Application already running on port {}",
                    settings.listen_port
                ));
            }
        } else {
            self.status("Not installed");
        }
        Ok(self.run_state())
    }

    /// Republish supervisor state changes as events. Runs once per orchestrator.
    fn forward_process_state(&self) {
        if self.inner.forwarding.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut rx = self.inner.supervisor.subscribe();
        let events = self.inner.events.clone();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let state = *rx.borrow_and_update();
                let _ = events.send(LauncherEvent::ProcessState { state });
            }
        });
    }

    pub fn run_state(&self) -> RunState {
        let settings = self.inner.config.snapshot();
        let process_state = self.inner.supervisor.state();
        let mark = self.inner.probe.mark();
        let latest_tag = self
            .inner
            .release
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|cached| cached.info.tag.clone());

        RunState {
            installed: is_installed(&self.install_dir(&settings)),
            running: process_state == ProcessState::Running,
            busy: self.is_busy(),
            managed_pid: self.inner.supervisor.managed_pid(),
            process_state,
            local_version: settings.local_version.clone(),
            latest_tag,
            feed_online: self.inner.feed_online.load(Ordering::Acquire),
            last_progress_at: mark.at,
            last_progress_percent: mark.percent,
            stalled: mark.stalled,
        }
    }

    /// Re-probe an attached application before reporting state.
    pub async fn refresh_state(&self) -> RunState {
        let port = self.inner.config.snapshot().listen_port;
        if !self.is_busy() {
            self.inner.supervisor.refresh(port).await;
        }
        self.run_state()
    }

    async fn resolve_release(&self, allow_cached: bool) -> Result<ReleaseInfo> {
        if allow_cached {
            let cached = self.inner.release.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(cached) = cached
                .as_ref()
                .filter(|c| c.fetched_at.elapsed() < RELEASE_CACHE_TTL)
            {
                log::debug!("Using cached release {}", cached.info.tag);
                return Ok(cached.info.clone());
            }
        }

        match self.inner.feed.fetch_latest().await {
            Ok(info) => {
                self.inner.feed_online.store(true, Ordering::Release);
                *self.inner.release.lock().unwrap_or_else(|e| e.into_inner()) =
                    Some(CachedRelease {
                        fetched_at: Instant::now(),
                        info: info.clone(),
                    });
                Ok(info)
            }
            Err(e) => {
                self.inner.feed_online.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    /// Compare the local version with the latest release.
    ///
    /// With `silent` only the status line changes; otherwise the result is
    /// also sent as a notification.
    pub async fn check_for_updates(&self, silent: bool) -> Result<UpdateCheck> {
        let release = match self.resolve_release(false).await {
            Ok(release) => release,
            Err(e) => {
                log::warn!("Update check failed: {}", e);
                self.emit(LauncherEvent::status("Offline"));
                if !silent {
                    self.emit(LauncherEvent::error("Could not reach the release feed", e.clone()));
                }
                return Err(e);
            }
        };

        let settings = self.inner.config.snapshot();
        let check = UpdateCheck::compare(
            is_installed(&self.install_dir(&settings)),
            &settings.local_version,
            &release.tag,
        );
        self.status(check.message());
        if !silent {
            self.emit(LauncherEvent::info(check.message()));
        }
        Ok(check)
    }

    /// Run one update cycle.
    ///
    /// Without `force`, an installed application whose version matches the
    /// latest tag is left alone. Fails with a busy error if a cycle or a
    /// start/stop is already in progress.
    pub async fn run_update(&self, force: bool) -> Result<UpdateOutcome> {
        let _busy = BusyGuard::acquire(&self.inner.busy)?;
        let result = self.update_cycle(force).await;

        match &result {
            Ok(UpdateOutcome::UpToDate { tag }) => self.status(format!("Up to date ({tag})")),
            Ok(UpdateOutcome::Updated { tag, started }) => {
                let message = if *started {
                    format!("Updated to {tag}")
                } else {
                    format!("Updated to {tag}, but the application did not start")
                };
                self.status(message.clone());
                self.emit(LauncherEvent::info(message));
            }
            Err(e) => {
                log::error!("Update failed: {}", e);
                self.discard_partial_work();
                let settings = self.inner.config.snapshot();
                self.inner
                    .supervisor
                    .set_installed(is_installed(&self.install_dir(&settings)));
                self.status("Update failed");
                self.emit(LauncherEvent::error("Update failed", e.clone()));
            }
        }
        self.emit(LauncherEvent::UpdateFinished {
            success: result.is_ok(),
        });
        result
    }

    /// Remove download and extraction leftovers of an abandoned cycle.
    pub fn discard_partial_work(&self) {
        for file in self.inner.paths.download_staging_files() {
            discard_file(file);
            discard_file(&part_path(file));
        }
        if let Err(e) = std::fs::remove_dir_all(&self.inner.paths.extract_staging_dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!(
                    "Failed to remove staging {:?}: {}",
                    self.inner.paths.extract_staging_dir,
                    e
                );
            }
        }
    }

    fn downloader(&self, settings: &Settings) -> Arc<dyn Downloader> {
        match &self.inner.downloader {
            Some(downloader) => Arc::clone(downloader),
            None => downloader_for(settings.download_strategy, &self.inner.client),
        }
    }

    async fn update_cycle(&self, force: bool) -> Result<UpdateOutcome> {
        let paths = &self.inner.paths;
        let settings = self.inner.config.snapshot();
        let install_dir = self.install_dir(&settings);
        paths.validate_install_dir(&install_dir)?;

        self.status("Checking for updates");
        let release = self.resolve_release(true).await?;
        let tag = release.tag.clone();
        if !force && is_installed(&install_dir) && settings.local_version == tag {
            log::info!("Already at {}", tag);
            return Ok(UpdateOutcome::UpToDate { tag });
        }
        let url = release.asset_url.clone().ok_or_else(|| {
            AppError::network(format!("release {tag} has no downloadable archive"))
        })?;

        paths.ensure_dirs()?;
        let downloader = self.downloader(&settings);
        let probe = Arc::clone(&self.inner.probe);
        let on_progress = move |update: ProgressUpdate| probe.observe(update);

        if needs_managed_runtime(&settings, platform::node_dist_target()) {
            self.status(format!("Preparing Node.js {}", runtime::NODE_VERSION));
            let _monitor = StallMonitor::start(Arc::clone(&self.inner.probe));
            if runtime::ensure_runtime(downloader.as_ref(), paths, &on_progress).await? {
                self.status("Node.js runtime installed");
            }
        }

        {
            self.status(format!("Downloading {tag}"));
            let _monitor = StallMonitor::start(Arc::clone(&self.inner.probe));
            downloader
                .download(&url, &paths.package_download, &on_progress)
                .await?;
        }

        self.status("Stopping application");
        self.inner.supervisor.stop(&settings).await;

        let deployer = PackageDeployer::new(
            &paths.extract_staging_dir,
            settings.native_extract_threshold_bytes(),
        );
        {
            self.status("Extracting package");
            let _monitor = StallMonitor::start(Arc::clone(&self.inner.probe));
            deployer.extract(&paths.package_download, &on_progress).await?;
        }

        self.status("Installing");
        paths.validate_install_dir(&install_dir)?;
        deployer.deploy(&install_dir).await?;
        discard_file(&paths.package_download);
        self.inner.supervisor.set_installed(true);

        self.inner.config.with_settings_mut(|s| {
            s.local_version.clone_from(&tag);
            Ok(())
        })?;
        log::info!("Installed {} into {:?}", tag, install_dir);

        self.status("Starting application");
        let settings = self.inner.config.snapshot();
        let started = match self.inner.supervisor.start(&settings, &install_dir).await {
            Ok(handle) => {
                log::info!("Application relaunched (pid {})", handle.pid());
                true
            }
            Err(e) => {
                self.emit(LauncherEvent::error(
                    format!("{tag} is installed but failed to start"),
                    e,
                ));
                false
            }
        };
        Ok(UpdateOutcome::Updated { tag, started })
    }

    /// Start the application outside of an update cycle.
    pub async fn start_app(&self) -> Result<ProcessHandle> {
        let _busy = BusyGuard::acquire(&self.inner.busy)?;
        let settings = self.inner.config.snapshot();
        let install_dir = self.install_dir(&settings);
        match self.inner.supervisor.start(&settings, &install_dir).await {
            Ok(handle) => {
                self.status(format!("Running (pid {})", handle.pid()));
                Ok(handle)
            }
            Err(e) => {
                self.emit(LauncherEvent::error("Failed to start the application", e.clone()));
                Err(e)
            }
        }
    }

    /// Stop the application. Best effort; only a busy launcher refuses.
    pub async fn stop_app(&self) -> Result<()> {
        let _busy = BusyGuard::acquire(&self.inner.busy)?;
        let settings = self.inner.config.snapshot();
        self.inner.supervisor.stop(&settings).await;
        self.status("Stopped");
        Ok(())
    }

    /// Check periodically and update unattended when allowed.
    pub fn spawn_auto_check(&self, every: Duration) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; the startup check covers it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                this.auto_check_once().await;
            }
        })
    }

    async fn auto_check_once(&self) {
        if !self.inner.config.snapshot().auto_update || self.is_busy() {
            return;
        }
        match self.check_for_updates(true).await {
            Ok(check) if check.has_work() && !self.is_busy() => {
                log::info!("Auto-update: {}", check.message());
                if let Err(e) = self.run_update(false).await {
                    log::warn!("Auto-update did not complete: {}", e);
                }
            }
            Ok(_) => {}
            Err(e) => log::debug!("Auto-check skipped: {}", e),
        }
    }
}
