use std::time::{Duration, Instant};

use crate::progress::{ratio_percent, ProgressUpdate};

const MIB: f64 = 1024.0 * 1024.0;

/// Tracks a transfer and turns byte counts into progress reports.
///
/// Percentages never go backwards and never leave `[0, 100]`, even when the
/// server sends more bytes than it announced.
#[derive(Debug, Clone)]
pub struct TransferMeter {
    started: Instant,
    received: u64,
    total: Option<u64>,
    last_percent: f64,
}

impl TransferMeter {
    pub fn new(total: Option<u64>) -> Self {
        Self::starting_at(total, Instant::now())
    }

    pub fn starting_at(total: Option<u64>, started: Instant) -> Self {
        Self {
            started,
            received: 0,
            total: total.filter(|&t| t > 0),
            last_percent: 0.0,
        }
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn total(&self) -> Option<u64> {
        self.total
    }

    /// Record one received chunk.
    pub fn record_chunk(&mut self, len: u64) -> ProgressUpdate {
        self.record_chunk_at(len, Instant::now())
    }

    pub fn record_chunk_at(&mut self, len: u64, now: Instant) -> ProgressUpdate {
        self.received = self.received.saturating_add(len);
        self.report(now)
    }

    /// Record an absolute byte count, e.g. the size of a file another process writes.
    ///
    /// Counts lower than what was already seen are ignored.
    pub fn observe_received_at(&mut self, received: u64, now: Instant) -> ProgressUpdate {
        self.received = self.received.max(received);
        self.report(now)
    }

    fn report(&mut self, now: Instant) -> ProgressUpdate {
        let elapsed = now
            .saturating_duration_since(self.started)
            .max(Duration::from_millis(1));
        let bytes_per_sec = self.received as f64 / elapsed.as_secs_f64();
        let speed = format_speed(bytes_per_sec);
        let downloaded_mb = self.received as f64 / MIB;

        match self.total {
            Some(total) => {
                let percent = ratio_percent(self.received, total).max(self.last_percent);
                self.last_percent = percent;
                ProgressUpdate::determinate(
                    percent,
                    format!(
                        "Downloading: {:.1}/{:.1} MB ({})",
                        downloaded_mb,
                        total as f64 / MIB,
                        speed
                    ),
                )
            }
            None => ProgressUpdate::indeterminate(format!(
                "Downloading: {:.1} MB ({})",
                downloaded_mb, speed
            )),
        }
    }
}

/// Human readable throughput: `MB/s` from one MiB per second up, `KB/s` below.
pub fn format_speed(bytes_per_sec: f64) -> String {
    let mb_per_sec = bytes_per_sec / MIB;
    if mb_per_sec < 1.0 {
        format!("{:.0} KB/s", mb_per_sec * 1024.0)
    } else {
        format!("{:.2} MB/s", mb_per_sec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentage_is_monotonic_and_bounded() {
        let start = Instant::now();
        let mut meter = TransferMeter::starting_at(Some(1000), start);
        let mut previous = 0.0;

        for (i, chunk) in [0u64, 100, 0, 250, 1, 400, 249, 500].into_iter().enumerate() {
            let update = meter.record_chunk_at(chunk, start + Duration::from_millis(i as u64 * 10));
            let percent = update.percent.unwrap();
            assert!(percent >= previous, "{percent} < {previous}");
            assert!((0.0..=100.0).contains(&percent));
            previous = percent;
        }
        assert_eq!(previous, 100.0);
    }

    #[test]
    fn unknown_total_is_indeterminate() {
        let start = Instant::now();
        let mut meter = TransferMeter::starting_at(None, start);
        let update = meter.record_chunk_at(2 * 1024 * 1024, start + Duration::from_secs(1));
        assert_eq!(update.percent, None);
        assert_eq!(update.label, "Downloading: 2.0 MB (2.00 MB/s)");
    }

    #[test]
    fn zero_total_counts_as_unknown() {
        let meter = TransferMeter::new(Some(0));
        assert_eq!(meter.total(), None);
    }

    #[test]
    fn label_embeds_throughput() {
        let start = Instant::now();
        let mut meter = TransferMeter::starting_at(Some(10 * 1024 * 1024), start);
        let update = meter.record_chunk_at(512 * 1024, start + Duration::from_secs(1));
        assert_eq!(update.label, "Downloading: 0.5/10.0 MB (512 KB/s)");
        assert_eq!(update.whole_percent(), Some(5));
    }

    #[test]
    fn observed_counts_never_shrink() {
        let start = Instant::now();
        let mut meter = TransferMeter::starting_at(Some(100), start);
        meter.observe_received_at(60, start);
        let update = meter.observe_received_at(20, start + Duration::from_secs(1));
        assert_eq!(meter.received(), 60);
        assert_eq!(update.percent, Some(60.0));
    }

    #[test]
    fn speed_switches_units() {
        assert_eq!(format_speed(3.0 * MIB), "3.00 MB/s");
        assert_eq!(format_speed(100.0 * 1024.0), "100 KB/s");
    }
}
