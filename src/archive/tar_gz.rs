use std::fs;
use std::path::Path;

use crate::error::{AppError, Result};
use crate::progress::{ratio_percent, ProgressFn, ProgressUpdate};

use super::extract::{write_entry, EntryOutcome};
use super::links::{create_queued_symlinks, queue_symlink, QueuedSymlink};
use super::path::{parse_entry_rel_path, resolve_within_dir, strip_top_dir, TopDirScan};
use super::ExtractStats;

fn open_tar_gz(archive_path: &Path) -> Result<tar::Archive<flate2::read::GzDecoder<fs::File>>> {
    let file = fs::File::open(archive_path)
        .map_err(|e| AppError::extract(format!("failed to open {archive_path:?}: {e}")))?;
    Ok(tar::Archive::new(flate2::read::GzDecoder::new(file)))
}

fn entry_name<R: std::io::Read>(entry: &tar::Entry<'_, R>) -> Result<String> {
    let path = entry
        .path()
        .map_err(|e| AppError::extract(format!("bad entry path: {e}")))?;
    path.to_str()
        .map(str::to_string)
        .ok_or_else(|| AppError::extract(format!("entry path is not valid UTF-8: {path:?}")))
}

/// Extract a `.tar.gz` into `dest_dir`, dropping a shared top-level directory.
///
/// Reads the archive twice: once to find the top directory and count
/// entries, once to write them.
pub(super) fn extract_tar_gz_flat(
    archive_path: &Path,
    dest_dir: &Path,
    on_progress: ProgressFn<'_>,
) -> Result<ExtractStats> {
    let mut scan = TopDirScan::default();
    let mut total = 0u64;
    let mut archive = open_tar_gz(archive_path)?;
    for entry in archive
        .entries()
        .map_err(|e| AppError::extract(format!("failed to read {archive_path:?}: {e}")))?
    {
        let entry = entry.map_err(|e| AppError::extract(format!("corrupt archive: {e}")))?;
        scan.observe(&entry_name(&entry)?);
        total += 1;
    }
    let top_dir = scan.finish();

    fs::create_dir_all(dest_dir)
        .map_err(|e| AppError::extract(format!("failed to create {dest_dir:?}: {e}")))?;
    let mut archive = open_tar_gz(archive_path)?;
    let mut stats = ExtractStats::default();
    let mut pending_symlinks: Vec<QueuedSymlink> = Vec::new();
    let mut processed = 0u64;

    for entry in archive
        .entries()
        .map_err(|e| AppError::extract(format!("failed to read {archive_path:?}: {e}")))?
    {
        let mut entry = entry.map_err(|e| AppError::extract(format!("corrupt archive: {e}")))?;
        let raw_name = entry_name(&entry)?;
        processed += 1;

        let relative = match parse_entry_rel_path(&raw_name) {
            Some(rel) => strip_top_dir(&rel, top_dir.as_deref()),
            None => {
                log::warn!("Skipping unsafe archive entry {:?}", raw_name);
                stats.skipped += 1;
                continue;
            }
        };
        let Some(relative) = relative else {
            continue;
        };
        let out_path = resolve_within_dir(dest_dir, &relative)?;

        let entry_type = entry.header().entry_type();
        if entry_type == tar::EntryType::Symlink {
            let target = entry
                .link_name()
                .map_err(|e| AppError::extract(e.to_string()))?
                .ok_or_else(|| AppError::extract(format!("symlink {raw_name:?} has no target")))?;
            pending_symlinks.push(queue_symlink(&out_path, &target, dest_dir)?);
            stats.written += 1;
        } else if entry_type.is_dir() || entry_type.is_file() {
            let is_dir = entry_type.is_dir();
            let unix_mode = entry.header().mode().ok();
            let declared_size = if is_dir {
                None
            } else {
                Some(
                    entry
                        .header()
                        .size()
                        .map_err(|e| AppError::extract(e.to_string()))?,
                )
            };
            match write_entry(&out_path, is_dir, &mut entry, unix_mode, declared_size)? {
                EntryOutcome::Written => stats.written += 1,
                EntryOutcome::Skipped => stats.skipped += 1,
            }
        } else {
            log::warn!(
                "Skipping unsupported entry {:?} of type {:?}",
                raw_name,
                entry_type
            );
            stats.skipped += 1;
        }

        on_progress(ProgressUpdate::determinate(
            ratio_percent(processed, total),
            format!("Extracting: {processed}/{total} entries"),
        ));
    }

    create_queued_symlinks(pending_symlinks)?;
    Ok(stats)
}
