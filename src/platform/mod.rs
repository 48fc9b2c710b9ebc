//! Platform-specific process signalling
//!
//! Only Unix-like systems are supported; elsewhere every call reports
//! `Unsupported` and no process is ever considered alive.

use std::io;

/// Terminate a process gracefully (SIGTERM)
pub fn terminate_process(pid: u32) -> io::Result<()> {
    #[cfg(unix)]
    {
        send_signal(pid, libc::SIGTERM)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        Err(unsupported())
    }
}

/// Force kill a process (SIGKILL)
pub fn kill_process(pid: u32) -> io::Result<()> {
    #[cfg(unix)]
    {
        send_signal(pid, libc::SIGKILL)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        Err(unsupported())
    }
}

/// Check if a process exists
///
/// A process we may not signal (EPERM) still exists. Zombies also answer
/// here; callers that care inspect the process status separately.
pub fn is_process_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        if pid == 0 || pid > i32::MAX as u32 {
            return false;
        }
        // kill with signal 0 checks if process exists without sending a signal
        let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
        result == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: libc::c_int) -> io::Result<()> {
    if pid == 0 || pid > i32::MAX as u32 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid pid {}", pid),
        ));
    }
    let result = unsafe { libc::kill(pid as libc::pid_t, signal) };
    if result == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn unsupported() -> io::Error {
    io::Error::new(io::ErrorKind::Unsupported, "unsupported platform")
}
