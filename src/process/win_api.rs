//! Win32 helpers: listener lookup and liveness checks.

use windows::Win32::Foundation::{CloseHandle, ERROR_INSUFFICIENT_BUFFER, NO_ERROR, STILL_ACTIVE};
use windows::Win32::NetworkManagement::IpHelper::{
    GetExtendedTcpTable, MIB_TCP6ROW_OWNER_PID, MIB_TCP6TABLE_OWNER_PID, MIB_TCPROW_OWNER_PID,
    MIB_TCPTABLE_OWNER_PID, TCP_TABLE_OWNER_PID_LISTENER,
};
use windows::Win32::Networking::WinSock::{AF_INET, AF_INET6};
use windows::Win32::System::Threading::{
    GetExitCodeProcess, OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION,
};

/// The table can grow between the size query and the fetch.
const TABLE_FETCH_ATTEMPTS: usize = 4;

/// A row of an owner-pid listener table.
trait ListenerRow: Copy {
    fn local_port(&self) -> u16;
    fn owner_pid(&self) -> u32;
}

impl ListenerRow for MIB_TCPROW_OWNER_PID {
    fn local_port(&self) -> u16 {
        // Network byte order in the low 16 bits.
        u16::from_be((self.dwLocalPort & 0xFFFF) as u16)
    }

    fn owner_pid(&self) -> u32 {
        self.dwOwningPid
    }
}

impl ListenerRow for MIB_TCP6ROW_OWNER_PID {
    fn local_port(&self) -> u16 {
        u16::from_be((self.dwLocalPort & 0xFFFF) as u16)
    }

    fn owner_pid(&self) -> u32 {
        self.dwOwningPid
    }
}

/// Raw listener table for one address family, in an 8-byte aligned buffer.
fn listener_table(family: u32) -> Option<Vec<u64>> {
    for _ in 0..TABLE_FETCH_ATTEMPTS {
        let mut size: u32 = 0;
        let ret = unsafe {
            GetExtendedTcpTable(None, &mut size, false, family, TCP_TABLE_OWNER_PID_LISTENER, 0)
        };
        if ret != ERROR_INSUFFICIENT_BUFFER.0 || size == 0 {
            return None;
        }

        let mut buffer = vec![0u64; (size as usize).div_ceil(8)];
        let ret = unsafe {
            GetExtendedTcpTable(
                Some(buffer.as_mut_ptr().cast()),
                &mut size,
                false,
                family,
                TCP_TABLE_OWNER_PID_LISTENER,
                0,
            )
        };
        match ret {
            r if r == NO_ERROR.0 => {
                buffer.truncate((size as usize).div_ceil(8));
                return Some(buffer);
            }
            r if r == ERROR_INSUFFICIENT_BUFFER.0 => continue,
            _ => return None,
        }
    }
    None
}

/// Walk the rows of a table buffer: a `u32` count followed by rows at `rows_offset`.
fn find_owner<R: ListenerRow>(buffer: &[u64], rows_offset: usize, port: u16) -> Option<u32> {
    let buf_bytes = buffer.len() * 8;
    let row_size = std::mem::size_of::<R>();
    let base = buffer.as_ptr() as *const u8;
    let count = unsafe { std::ptr::read_unaligned(base as *const u32) } as usize;

    for i in 0..count {
        let offset = rows_offset.checked_add(i.checked_mul(row_size)?)?;
        if offset.checked_add(row_size)? > buf_bytes {
            break;
        }
        let row = unsafe { std::ptr::read_unaligned(base.add(offset) as *const R) };
        if row.local_port() == port {
            return Some(row.owner_pid());
        }
    }
    None
}

/// PID listening on `port`, IPv4 first, then IPv6.
pub fn get_pid_on_port(port: u16) -> Option<u32> {
    let v4 = listener_table(AF_INET.0 as u32).and_then(|buf| {
        find_owner::<MIB_TCPROW_OWNER_PID>(
            &buf,
            std::mem::offset_of!(MIB_TCPTABLE_OWNER_PID, table),
            port,
        )
    });
    v4.or_else(|| {
        listener_table(AF_INET6.0 as u32).and_then(|buf| {
            find_owner::<MIB_TCP6ROW_OWNER_PID>(
                &buf,
                std::mem::offset_of!(MIB_TCP6TABLE_OWNER_PID, table),
                port,
            )
        })
    })
}

/// Whether the process exists and has not reported an exit code yet.
pub fn is_process_alive(pid: u32) -> bool {
    unsafe {
        let Ok(handle) = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, false, pid) else {
            return false;
        };
        let mut exit_code: u32 = 0;
        let alive = GetExitCodeProcess(handle, &mut exit_code).is_ok()
            && (exit_code as i32) == STILL_ACTIVE.0;
        let _ = CloseHandle(handle);
        alive
    }
}
