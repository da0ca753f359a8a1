//! `fern` dispatch behind the `log` facade.
//!
//! Lines look like `[2024-05-01 12:00:00] [INFO] [oman_launcher::deploy] message`.

use std::fs::{self, File};
use std::io;
use std::path::Path;

use log::LevelFilter;

use crate::error::{AppError, Result};

/// Log files above this size are truncated at startup.
pub const MAX_LOG_BYTES: u64 = 5 * 1024 * 1024;

/// Dependencies that are chatty at info level.
const QUIET_TARGETS: &[&str] = &["hyper", "hyper_util", "reqwest", "rustls", "h2", "mio"];

/// Build the dispatch: `launcher.log` always, stdout when `echo` is set.
pub fn dispatch(path: &Path, level: LevelFilter, echo: bool) -> Result<fern::Dispatch> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| AppError::io(format!("Failed to create log dir: {e}")))?;
    }
    let file = fern::log_file(path)
        .map_err(|e| AppError::io(format!("Failed to open {}: {e}", path.display())))?;

    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}] [{}] [{}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level);
    for target in QUIET_TARGETS {
        dispatch = dispatch.level_for(*target, level.min(LevelFilter::Warn));
    }
    dispatch = dispatch.chain(file);
    if echo {
        dispatch = dispatch.chain(io::stdout());
    }
    Ok(dispatch)
}

/// Truncate the log when it has grown past `max_bytes`. Returns whether it did.
pub fn rotate_if_oversized(path: &Path, max_bytes: u64) -> io::Result<bool> {
    match fs::metadata(path) {
        Ok(meta) if meta.len() > max_bytes => {
            File::create(path)?;
            Ok(true)
        }
        Ok(_) => Ok(false),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Install the dispatch as the global `log` backend.
pub fn init(path: &Path, level: LevelFilter, echo: bool) -> Result<()> {
    let truncated = rotate_if_oversized(path, MAX_LOG_BYTES)
        .map_err(|e| AppError::io(format!("Failed to check log size: {e}")))?;
    dispatch(path, level, echo)?
        .apply()
        .map_err(|e| AppError::other(format!("Logger already installed: {e}")))?;
    if truncated {
        log::info!("Log file exceeded {} bytes and was truncated", MAX_LOG_BYTES);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use log::Record;

    use super::*;

    fn write_records(level: LevelFilter, records: &[(log::Level, &str, &str)]) -> String {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/launcher.log");
        let (_, logger) = dispatch(&path, level, false).unwrap().into_log();

        for (level, target, msg) in records {
            logger.log(
                &Record::builder()
                    .level(*level)
                    .target(target)
                    .args(format_args!("{msg}"))
                    .build(),
            );
        }
        logger.flush();
        fs::read_to_string(&path).unwrap()
    }

    #[test]
    fn line_format() {
        let content = write_records(
            LevelFilter::Info,
            &[(log::Level::Warn, "oman_launcher::deploy", "disk almost full")],
        );
        let line = content.lines().next().unwrap();
        // "[YYYY-MM-DD HH:MM:SS] " is 22 bytes.
        assert_eq!(line.as_bytes()[0], b'[');
        assert_eq!(line.as_bytes()[20], b']');
        assert_eq!(&line[22..], "[WARN] [oman_launcher::deploy] disk almost full");
    }

    #[test]
    fn filters_level_and_quiet_targets() {
        let content = write_records(
            LevelFilter::Info,
            &[
                (log::Level::Info, "oman_launcher", "kept"),
                (log::Level::Debug, "oman_launcher", "too verbose"),
                (log::Level::Info, "hyper::proto", "noise"),
                (log::Level::Warn, "hyper::proto", "worth keeping"),
            ],
        );
        assert!(content.contains("kept"));
        assert!(content.contains("worth keeping"));
        assert!(!content.contains("too verbose"));
        assert!(!content.contains("noise"));
    }

    #[test]
    fn oversized_log_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("launcher.log");
        fs::write(&path, vec![b'x'; 64]).unwrap();

        assert!(!rotate_if_oversized(&path, 100).unwrap());
        assert!(rotate_if_oversized(&path, 10).unwrap());
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);
        assert!(!rotate_if_oversized(&dir.path().join("missing.log"), 10).unwrap());
    }
}
