use std::env::consts::{ARCH, OS};

/// Archive flavour published for the managed runtime on each platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeArchiveKind {
    Zip,
    TarGz,
}

/// Node.js distribution suffix for the host, e.g. `linux-x64`.
pub fn node_dist_target() -> Result<&'static str, String> {
    node_dist_target_for(OS, ARCH)
}

pub(crate) fn node_dist_target_for(os: &str, arch: &str) -> Result<&'static str, String> {
    match (os, arch) {
        ("windows", "x86_64") => Ok("win-x64"),
        ("windows", "aarch64") => Ok("win-arm64"),
        ("windows", "x86") => Ok("win-x86"),
        ("linux", "x86_64") => Ok("linux-x64"),
        ("linux", "aarch64") => Ok("linux-arm64"),
        ("linux", "arm") => Ok("linux-armv7l"),
        ("macos", "x86_64") => Ok("darwin-x64"),
        ("macos", "aarch64") => Ok("darwin-arm64"),
        _ => Err(format!("Unsupported platform: {os} {arch}")),
    }
}

pub fn runtime_archive_kind() -> RuntimeArchiveKind {
    if cfg!(target_os = "windows") {
        RuntimeArchiveKind::Zip
    } else {
        RuntimeArchiveKind::TarGz
    }
}

pub fn runtime_archive_extension() -> &'static str {
    match runtime_archive_kind() {
        RuntimeArchiveKind::Zip => "zip",
        RuntimeArchiveKind::TarGz => "tar.gz",
    }
}
