//! Progress reporting shared by downloads, extraction and the stall monitor.

use serde::Serialize;

/// One progress report from a long-running step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressUpdate {
    /// Percentage in `[0, 100]`; `None` when the total is unknown.
    pub percent: Option<f64>,
    pub label: String,
}

impl ProgressUpdate {
    pub fn determinate(percent: f64, label: impl Into<String>) -> Self {
        let percent = if percent.is_finite() {
            percent.clamp(0.0, 100.0)
        } else {
            0.0
        };
        Self {
            percent: Some(percent),
            label: label.into(),
        }
    }

    pub fn indeterminate(label: impl Into<String>) -> Self {
        Self {
            percent: None,
            label: label.into(),
        }
    }

    /// Percentage truncated to a whole number, as shown to the operator.
    pub fn whole_percent(&self) -> Option<u8> {
        self.percent.map(|p| p.floor().clamp(0.0, 100.0) as u8)
    }
}

/// Progress sink handed to pipeline steps.
pub type ProgressFn<'a> = &'a (dyn Fn(ProgressUpdate) + Send + Sync);

/// `done / total` as a clamped percentage. A zero total counts as complete.
pub fn ratio_percent(done: u64, total: u64) -> f64 {
    if total == 0 {
        return 100.0;
    }
    ((done as f64 / total as f64) * 100.0).clamp(0.0, 100.0)
}
