//! Signals and liveness checks by pid.

use std::io;

/// Whether `pid` names a live process.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    // SAFETY: signal 0 performs only the existence and permission check.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Send SIGKILL. A process that is already gone is not an error.
#[cfg(unix)]
pub fn force_kill(pid: u32) -> io::Result<()> {
    // SAFETY: plain syscall, no memory is shared with the target.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}

// Without unix signals only our own `Child` handles can observe or kill workers.
#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    false
}

#[cfg(not(unix))]
pub fn force_kill(pid: u32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("cannot kill process {pid} by pid on this platform"),
    ))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn test_kill_and_liveness() {
        assert!(pid_alive(std::process::id()));

        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        assert!(pid_alive(pid));

        force_kill(pid).unwrap();
        child.wait().unwrap();
        assert!(!pid_alive(pid));
        // Already gone.
        force_kill(pid).unwrap();
    }
}
