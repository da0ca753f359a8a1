use std::fs;
use std::io::Read as _;
use std::path::Path;

use crate::error::{AppError, Result};
use crate::progress::{ratio_percent, ProgressFn, ProgressUpdate};

use super::extract::{write_entry, EntryOutcome};
use super::links::{create_queued_symlinks, queue_symlink, QueuedSymlink};
use super::path::{parse_entry_rel_path, resolve_within_dir, strip_top_dir, TopDirScan};
use super::ExtractStats;

fn open_zip(archive_path: &Path) -> Result<zip::ZipArchive<fs::File>> {
    let file = fs::File::open(archive_path)
        .map_err(|e| AppError::extract(format!("failed to open {archive_path:?}: {e}")))?;
    zip::ZipArchive::new(file)
        .map_err(|e| AppError::extract(format!("{archive_path:?} is not a valid zip archive: {e}")))
}

/// Number of file (non-directory) entries in a zip archive.
pub(super) fn count_zip_files(archive_path: &Path) -> Result<u64> {
    let archive = open_zip(archive_path)?;
    Ok(archive.file_names().filter(|n| !n.ends_with('/')).count() as u64)
}

/// Extract a zip archive into `dest_dir`.
///
/// With `strip_top` set, a single shared top-level directory is removed from
/// every entry path. Progress advances once per entry, after it is written.
pub(super) fn extract_zip(
    archive_path: &Path,
    dest_dir: &Path,
    strip_top: bool,
    on_progress: ProgressFn<'_>,
) -> Result<ExtractStats> {
    fs::create_dir_all(dest_dir)
        .map_err(|e| AppError::extract(format!("failed to create {dest_dir:?}: {e}")))?;
    let mut archive = open_zip(archive_path)?;

    let top_dir = if strip_top {
        let mut scan = TopDirScan::default();
        archive.file_names().for_each(|name| scan.observe(name));
        scan.finish()
    } else {
        None
    };

    let total = archive.len() as u64;
    let mut stats = ExtractStats::default();
    let mut pending_symlinks: Vec<QueuedSymlink> = Vec::new();

    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| AppError::extract(format!("failed to read entry {index}: {e}")))?;
        let raw_name = entry.name().to_string();

        let target = parse_entry_rel_path(&raw_name)
            .map(|rel| strip_top_dir(&rel, top_dir.as_deref()));
        match target {
            None => {
                log::warn!("Skipping unsafe archive entry {:?}", raw_name);
                stats.skipped += 1;
            }
            // The stripped top directory itself.
            Some(None) => {}
            Some(Some(relative)) => {
                let out_path = resolve_within_dir(dest_dir, &relative)?;
                if entry.is_symlink() {
                    let mut link_target = String::new();
                    entry
                        .read_to_string(&mut link_target)
                        .map_err(|e| AppError::extract(format!("failed to read link {raw_name:?}: {e}")))?;
                    pending_symlinks.push(queue_symlink(&out_path, Path::new(&link_target), dest_dir)?);
                    stats.written += 1;
                } else {
                    let is_dir = entry.is_dir();
                    let unix_mode = entry.unix_mode();
                    let declared_size = (!is_dir).then(|| entry.size());
                    match write_entry(&out_path, is_dir, &mut entry, unix_mode, declared_size)? {
                        EntryOutcome::Written => stats.written += 1,
                        EntryOutcome::Skipped => stats.skipped += 1,
                    }
                }
            }
        }

        let processed = index as u64 + 1;
        on_progress(ProgressUpdate::determinate(
            ratio_percent(processed, total),
            format!("Extracting: {processed}/{total} entries"),
        ));
    }

    create_queued_symlinks(pending_symlinks)?;
    Ok(stats)
}
