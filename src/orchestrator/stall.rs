//! Stall detection for long-running steps.
//!
//! A step is "stalled" when its visible progress has not changed for
//! [`STALL_THRESHOLD`]. The signal is advisory: nothing is cancelled.

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::events::LauncherEvent;
use super::state::ProgressMark;
use crate::progress::ProgressUpdate;

pub const STALL_TICK: Duration = Duration::from_secs(1);
pub const STALL_THRESHOLD: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct ProbeInner {
    last_change: Instant,
    whole_percent: Option<u8>,
    label: String,
    mark: ProgressMark,
}

/// Records progress, publishes it and tracks when it last changed.
#[derive(Debug)]
pub(crate) struct ProgressProbe {
    inner: Mutex<ProbeInner>,
    events: broadcast::Sender<LauncherEvent>,
}

impl ProgressProbe {
    pub fn new(events: broadcast::Sender<LauncherEvent>) -> Self {
        Self {
            inner: Mutex::new(ProbeInner {
                last_change: Instant::now(),
                whole_percent: None,
                label: String::new(),
                mark: ProgressMark::default(),
            }),
            events,
        }
    }

    /// Start tracking a new step.
    pub fn begin(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.last_change = Instant::now();
        inner.whole_percent = None;
        inner.label.clear();
    }

    /// Record an update. A new whole percentage, or a new label while the
    /// total is unknown, counts as activity.
    pub fn observe(&self, update: ProgressUpdate) {
        let cleared = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let whole = update.whole_percent();
            let changed = match whole {
                Some(_) => whole != inner.whole_percent,
                None => inner.whole_percent.is_some() || update.label != inner.label,
            };
            inner.mark.percent = update.percent;
            if changed {
                inner.last_change = Instant::now();
                inner.whole_percent = whole;
                inner.label.clone_from(&update.label);
                inner.mark.at = Some(SystemTime::now());
            }
            let cleared = changed && inner.mark.stalled;
            if cleared {
                inner.mark.stalled = false;
            }
            cleared
        };

        let _ = self.events.send(LauncherEvent::Progress(update));
        if cleared {
            log::info!("Progress resumed");
            let _ = self.events.send(LauncherEvent::Stall { stalled: false });
        }
    }

    pub fn mark(&self) -> ProgressMark {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .mark
            .clone()
    }

    fn check(&self, threshold: Duration) {
        let raised = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if !inner.mark.stalled && inner.last_change.elapsed() >= threshold {
                inner.mark.stalled = true;
                true
            } else {
                false
            }
        };
        if raised {
            log::warn!("No progress for {}s, transfer may be stuck", threshold.as_secs());
            let _ = self.events.send(LauncherEvent::Stall { stalled: true });
        }
    }

    fn clear_stall(&self) {
        let was_stalled = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut inner.mark.stalled, false)
        };
        if was_stalled {
            let _ = self.events.send(LauncherEvent::Stall { stalled: false });
        }
    }
}

/// Watches a [`ProgressProbe`] until dropped.
///
/// Dropping the guard stops the watcher and clears any raised stall signal.
pub(crate) struct StallMonitor {
    probe: Arc<ProgressProbe>,
    task: JoinHandle<()>,
}

impl StallMonitor {
    pub fn start(probe: Arc<ProgressProbe>) -> Self {
        Self::with_timing(probe, STALL_TICK, STALL_THRESHOLD)
    }

    pub fn with_timing(probe: Arc<ProgressProbe>, tick: Duration, threshold: Duration) -> Self {
        probe.begin();
        let watched = Arc::clone(&probe);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                watched.check(threshold);
            }
        });
        Self { probe, task }
    }
}

impl Drop for StallMonitor {
    fn drop(&mut self) {
        self.task.abort();
        self.probe.clear_stall();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stall_events(rx: &mut broadcast::Receiver<LauncherEvent>) -> Vec<bool> {
        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let LauncherEvent::Stall { stalled } = event {
                seen.push(stalled);
            }
        }
        seen
    }

    fn probe() -> (Arc<ProgressProbe>, broadcast::Receiver<LauncherEvent>) {
        let (tx, rx) = broadcast::channel(256);
        (Arc::new(ProgressProbe::new(tx)), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn raises_after_threshold_and_clears_on_change() {
        let (probe, mut rx) = probe();
        let _monitor = StallMonitor::start(Arc::clone(&probe));
        probe.observe(ProgressUpdate::determinate(10.0, "Downloading"));

        tokio::time::sleep(Duration::from_millis(4500)).await;
        assert!(stall_events(&mut rx).is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(stall_events(&mut rx), vec![true]);
        assert!(probe.mark().stalled);

        // Same whole percent: still stuck.
        probe.observe(ProgressUpdate::determinate(10.7, "Downloading"));
        assert!(stall_events(&mut rx).is_empty());

        probe.observe(ProgressUpdate::determinate(11.0, "Downloading"));
        assert_eq!(stall_events(&mut rx), vec![false]);
        assert!(!probe.mark().stalled);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_progress_is_not_a_stall() {
        let (probe, mut rx) = probe();
        let _monitor = StallMonitor::start(Arc::clone(&probe));

        for percent in 1..=8 {
            probe.observe(ProgressUpdate::determinate(percent as f64, "Downloading"));
            tokio::time::sleep(Duration::from_secs(3)).await;
        }

        assert!(stall_events(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn indeterminate_label_change_counts() {
        let (probe, mut rx) = probe();
        let _monitor = StallMonitor::start(Arc::clone(&probe));

        for mb in 1..=4 {
            probe.observe(ProgressUpdate::indeterminate(format!("Downloading: {mb}.0 MB")));
            tokio::time::sleep(Duration::from_secs(3)).await;
        }
        assert!(stall_events(&mut rx).is_empty());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(stall_events(&mut rx), vec![true]);
    }

    #[tokio::test(start_paused = true)]
    async fn drop_clears_signal() {
        let (probe, mut rx) = probe();
        let monitor = StallMonitor::start(Arc::clone(&probe));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(stall_events(&mut rx), vec![true]);

        drop(monitor);
        assert_eq!(stall_events(&mut rx), vec![false]);
        assert!(!probe.mark().stalled);

        // Nothing is left running that could raise it again.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(stall_events(&mut rx).is_empty());
    }
}
