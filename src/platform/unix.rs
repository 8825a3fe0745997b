//! Unix process signaling via libc

use anyhow::Result;

/// Send a signal to a single process
pub fn send_signal(pid: u32, signal: i32) -> Result<()> {
    // pid 0 and values above i32::MAX would address process groups
    let Some(raw) = checked_pid(pid) else {
        anyhow::bail!("Refusing to signal invalid pid {}", pid)
    };

    unsafe {
        let result = libc::kill(raw, signal);
        if result == 0 {
            Ok(())
        } else {
            anyhow::bail!(
                "Failed to send signal {} to {}: {}",
                signal,
                pid,
                std::io::Error::last_os_error()
            )
        }
    }
}

/// Check if a process is running
pub fn is_process_running(pid: u32) -> bool {
    let Some(raw) = checked_pid(pid) else {
        return false;
    };

    unsafe {
        // kill with signal 0 checks if process exists without sending a signal
        if libc::kill(raw, 0) == 0 {
            return true;
        }
    }

    // EPERM means the process exists but belongs to someone else
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

fn checked_pid(pid: u32) -> Option<i32> {
    match i32::try_from(pid) {
        Ok(raw) if raw > 0 => Some(raw),
        _ => None,
    }
}
