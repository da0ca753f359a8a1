//! Port probes: is anything listening, and who owns the listener.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::net::TcpStream;

const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

/// Whether something accepts TCP connections on `port` on the loopback interface.
pub async fn is_port_listening(port: u16) -> bool {
    let candidates = [
        SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
        SocketAddr::from((Ipv6Addr::LOCALHOST, port)),
    ];
    for addr in candidates {
        if let Ok(Ok(_)) = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            return true;
        }
    }
    false
}

/// PID of the process listening on `port`, when it can be determined.
#[cfg(target_os = "windows")]
pub fn find_listening_pid(port: u16) -> Option<u32> {
    super::win_api::get_pid_on_port(port)
}

/// PID of the process listening on `port`, when it can be determined.
#[cfg(target_os = "linux")]
pub fn find_listening_pid(port: u16) -> Option<u32> {
    let mut inodes = Vec::new();
    for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
        if let Ok(content) = std::fs::read_to_string(table) {
            inodes.extend(parse_listen_inodes(&content, port));
        }
    }
    if inodes.is_empty() {
        return None;
    }
    find_socket_owner(&inodes)
}

/// PID of the process listening on `port`, when it can be determined.
#[cfg(all(unix, not(target_os = "linux")))]
pub fn find_listening_pid(port: u16) -> Option<u32> {
    let output = std::process::Command::new("lsof")
        .args(["-nP", &format!("-iTCP:{port}"), "-sTCP:LISTEN", "-t"])
        .output()
        .ok()?;
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .find_map(|line| line.trim().parse().ok())
}

/// Socket inodes of LISTEN entries for `port` in a `/proc/net/tcp{,6}` table.
#[cfg(any(target_os = "linux", test))]
fn parse_listen_inodes(table: &str, port: u16) -> Vec<u64> {
    const TCP_LISTEN: &str = "0A";

    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let local = fields.get(1)?;
            let state = fields.get(3)?;
            let inode = fields.get(9)?;

            let (_, port_hex) = local.rsplit_once(':')?;
            let local_port = u16::from_str_radix(port_hex, 16).ok()?;
            if local_port != port || *state != TCP_LISTEN {
                return None;
            }
            inode.parse::<u64>().ok().filter(|&i| i != 0)
        })
        .collect()
}

#[cfg(target_os = "linux")]
fn find_socket_owner(inodes: &[u64]) -> Option<u32> {
    let targets: Vec<String> = inodes.iter().map(|i| format!("socket:[{i}]")).collect();

    for entry in std::fs::read_dir("/proc").ok()?.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        // Processes of other users are unreadable; skip them.
        let Ok(fds) = std::fs::read_dir(entry.path().join("fd")) else {
            continue;
        };
        for fd in fds.flatten() {
            if let Ok(link) = std::fs::read_link(fd.path()) {
                let link = link.to_string_lossy();
                if targets.iter().any(|t| *t == link) {
                    return Some(pid);
                }
            }
        }
    }
    None
}
