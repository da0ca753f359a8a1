use serde::Serialize;

use crate::error::AppError;
use crate::process::ProcessState;
use crate::progress::ProgressUpdate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Warn,
    Error,
}

/// Everything an observer of the launcher can see.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LauncherEvent {
    /// Short status line, e.g. "Update available (v1.2.0)".
    Status { message: String },
    Progress(ProgressUpdate),
    /// Advisory: no progress for a while. Never aborts anything.
    Stall { stalled: bool },
    ProcessState { state: ProcessState },
    Notification {
        level: NotificationLevel,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<AppError>,
    },
    /// An update cycle ended, successfully or not.
    UpdateFinished { success: bool },
}

impl LauncherEvent {
    pub fn status(message: impl Into<String>) -> Self {
        Self::Status {
            message: message.into(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::Notification {
            level: NotificationLevel::Info,
            message: message.into(),
            error: None,
        }
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self::Notification {
            level: NotificationLevel::Warn,
            message: message.into(),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>, error: AppError) -> Self {
        Self::Notification {
            level: NotificationLevel::Error,
            message: message.into(),
            error: Some(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_type_tag() {
        let value = serde_json::to_value(LauncherEvent::Stall { stalled: true }).unwrap();
        assert_eq!(value, serde_json::json!({ "type": "stall", "stalled": true }));

        let value = serde_json::to_value(LauncherEvent::ProcessState {
            state: ProcessState::StartFailed,
        })
        .unwrap();
        assert_eq!(value["state"], "start_failed");
    }

    #[test]
    fn error_notification_carries_error() {
        let value = serde_json::to_value(LauncherEvent::error(
            "Update failed",
            AppError::download("https://example.com/a.zip", "reset"),
        ))
        .unwrap();
        assert_eq!(value["level"], "error");
        assert!(value.get("error").is_some());

        let value = serde_json::to_value(LauncherEvent::info("ok")).unwrap();
        assert!(value.get("error").is_none());
    }
}
