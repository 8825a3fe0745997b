//! Platform-specific process signaling

#[cfg(unix)]
pub mod unix;

use anyhow::Result;

/// Signal number for a forced kill
#[cfg(unix)]
pub const SIGKILL: i32 = libc::SIGKILL;
#[cfg(not(unix))]
pub const SIGKILL: i32 = 9;

/// Signal number for a graceful termination request
#[cfg(unix)]
pub const SIGTERM: i32 = libc::SIGTERM;
#[cfg(not(unix))]
pub const SIGTERM: i32 = 15;

/// Send `signal` to a process
pub fn send_signal(pid: u32, signal: i32) -> Result<()> {
    #[cfg(unix)]
    {
        unix::send_signal(pid, signal)
    }
    #[cfg(not(unix))]
    {
        let _ = (pid, signal);
        anyhow::bail!("Unsupported platform")
    }
}

/// Check if a process is running
pub fn is_process_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        unix::is_process_running(pid)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}
