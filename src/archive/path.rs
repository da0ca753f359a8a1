use std::ffi::OsString;
use std::io;
use std::path::{Component, Path, PathBuf};

use crate::error::{AppError, Result};

fn normalize_entry_path(path: &str) -> String {
    path.replace('\\', "/")
}

fn has_windows_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic()
}

/// Convert an archive entry name to a relative path.
///
/// Absolute names, drive letters and any `..` segment are rejected.
pub(crate) fn parse_entry_rel_path(raw: &str) -> Option<PathBuf> {
    let normalized = normalize_entry_path(raw);
    if normalized.starts_with('/') || has_windows_drive_prefix(&normalized) {
        return None;
    }

    let mut relative = PathBuf::new();
    for part in normalized.split('/') {
        match part {
            "" | "." => {}
            ".." => return None,
            _ => relative.push(part),
        }
    }

    (!relative.as_os_str().is_empty()).then_some(relative)
}

/// Lexically resolve `.`/`..`, then canonicalize the longest prefix that exists.
fn canonicalize_existing_prefix(path: &Path) -> Result<PathBuf> {
    let mut lexical = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => lexical.push(component.as_os_str()),
            Component::CurDir => {}
            Component::Normal(segment) => lexical.push(segment),
            Component::ParentDir => {
                if !lexical.pop() && !lexical.has_root() {
                    return Err(AppError::extract(format!(
                        "path {path:?} escapes the filesystem root"
                    )));
                }
            }
        }
    }

    let mut existing = lexical.clone();
    let mut missing: Vec<OsString> = Vec::new();
    loop {
        match existing.canonicalize() {
            Ok(mut resolved) => {
                resolved.extend(missing.into_iter().rev());
                return Ok(resolved);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let Some(name) = existing.file_name().map(|n| n.to_owned()) else {
                    return Err(AppError::extract(format!(
                        "no existing ancestor for {lexical:?}"
                    )));
                };
                missing.push(name);
                existing.pop();
            }
            Err(e) => {
                return Err(AppError::extract(format!(
                    "failed to resolve {existing:?}: {e}"
                )))
            }
        }
    }
}

/// Resolve `path` and make sure it stays inside `base_dir`.
///
/// Catches escapes through symlinks created by earlier entries.
pub(super) fn resolve_within_dir(base_dir: &Path, path: &Path) -> Result<PathBuf> {
    let base = base_dir
        .canonicalize()
        .map_err(|e| AppError::extract(format!("failed to resolve {base_dir:?}: {e}")))?;
    let candidate = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    };
    let resolved = canonicalize_existing_prefix(&candidate)?;

    if resolved.starts_with(&base) {
        Ok(resolved)
    } else {
        Err(AppError::extract(format!(
            "entry {path:?} resolves outside of {base_dir:?}"
        )))
    }
}

/// Reject link targets that are empty, absolute or drive-qualified.
pub(super) fn validate_rel_link_target(target: &Path) -> Result<()> {
    if target.as_os_str().is_empty() {
        return Err(AppError::extract("link target is empty"));
    }
    let drive = target.to_str().is_some_and(has_windows_drive_prefix);
    let prefixed = target
        .components()
        .any(|c| matches!(c, Component::Prefix(_)));
    if target.is_absolute() || drive || prefixed {
        return Err(AppError::extract(format!(
            "absolute link target {target:?} is not allowed"
        )));
    }
    Ok(())
}

/// Tracks whether every entry of an archive lives under one top-level directory.
#[derive(Debug, Default)]
pub(super) struct TopDirScan {
    candidate: Option<String>,
    saw_nested: bool,
    mixed: bool,
}

impl TopDirScan {
    pub(super) fn observe(&mut self, raw: &str) {
        if self.mixed {
            return;
        }
        let Some(relative) = parse_entry_rel_path(raw) else {
            return;
        };
        let mut components = relative.components();
        let Some(first) = components.next() else {
            return;
        };
        let first = first.as_os_str().to_string_lossy();
        if components.next().is_some() {
            self.saw_nested = true;
        }
        match self.candidate.as_deref() {
            None => self.candidate = Some(first.into_owned()),
            Some(existing) if existing == first => {}
            Some(_) => self.mixed = true,
        }
    }

    /// The shared top-level directory, if there is exactly one and it has content.
    pub(super) fn finish(self) -> Option<String> {
        if self.mixed || !self.saw_nested {
            None
        } else {
            self.candidate
        }
    }
}

/// Drop `top_dir` from the front of `relative`. The top directory entry itself maps to `None`.
pub(super) fn strip_top_dir(relative: &Path, top_dir: Option<&str>) -> Option<PathBuf> {
    let Some(top) = top_dir else {
        return Some(relative.to_path_buf());
    };
    let stripped = relative.strip_prefix(top).ok()?;
    (!stripped.as_os_str().is_empty()).then(|| stripped.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unsafe_names() {
        assert_eq!(parse_entry_rel_path("../evil"), None);
        assert_eq!(parse_entry_rel_path("a/../../evil"), None);
        assert_eq!(parse_entry_rel_path("/etc/passwd"), None);
        assert_eq!(parse_entry_rel_path("C:/Windows/x"), None);
        assert_eq!(parse_entry_rel_path("./"), None);
    }

    #[test]
    fn normalizes_safe_names() {
        assert_eq!(
            parse_entry_rel_path("app\\bin\\./run.cmd"),
            Some(PathBuf::from("app/bin/run.cmd"))
        );
        assert_eq!(parse_entry_rel_path("dir/"), Some(PathBuf::from("dir")));
    }

    #[test]
    fn detects_single_top_dir() {
        let mut scan = TopDirScan::default();
        for name in ["node-v20/", "node-v20/bin/node", "node-v20/README.md"] {
            scan.observe(name);
        }
        assert_eq!(scan.finish().as_deref(), Some("node-v20"));
    }

    #[test]
    fn mixed_roots_have_no_top_dir() {
        let mut scan = TopDirScan::default();
        for name in ["a/x", "b/y"] {
            scan.observe(name);
        }
        assert_eq!(scan.finish(), None);

        let mut flat = TopDirScan::default();
        flat.observe("only-file.txt");
        assert_eq!(flat.finish(), None);
    }

    #[test]
    fn strips_top_dir() {
        let rel = Path::new("node-v20/bin/node");
        assert_eq!(
            strip_top_dir(rel, Some("node-v20")),
            Some(PathBuf::from("bin/node"))
        );
        assert_eq!(strip_top_dir(Path::new("node-v20"), Some("node-v20")), None);
        assert_eq!(strip_top_dir(rel, None), Some(rel.to_path_buf()));
    }

    #[test]
    fn resolve_within_dir_blocks_escape() {
        let dir = tempfile::tempdir().unwrap();
        assert!(resolve_within_dir(dir.path(), Path::new("a/b/c.txt")).is_ok());
        assert!(resolve_within_dir(dir.path(), Path::new("../outside.txt")).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn resolve_within_dir_follows_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();
        assert!(resolve_within_dir(dir.path(), Path::new("link/file")).is_err());
    }

    #[test]
    fn link_targets_must_be_relative() {
        assert!(validate_rel_link_target(Path::new("../lib/npm-cli.js")).is_ok());
        assert!(validate_rel_link_target(Path::new("/usr/bin/node")).is_err());
        assert!(validate_rel_link_target(Path::new("")).is_err());
    }
}
