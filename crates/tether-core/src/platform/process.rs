//! Child process supervision.

use crate::error::{Result, TetherError};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Check if a process with the given PID exists.
pub fn is_process_alive(pid: u32) -> bool {
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        // Exists, but belongs to someone else.
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

fn describe(status: WaitStatus) -> String {
    match status {
        WaitStatus::Exited(_, code) => format!("exited with return code {}", code),
        WaitStatus::Signaled(_, signal, _) => format!("exited due to signal {}", signal),
        other => format!("{:?}", other),
    }
}

/// Collect an exited child, or send it SIGTERM and collect it in the
/// background.
///
/// A child that is not ours to signal (`EPERM`) or already gone (`ESRCH`,
/// `ECHILD`) is not an error.
pub fn reap_child(pid: u32, name: &str) -> Result<()> {
    let nix_pid = Pid::from_raw(pid as i32);
    match waitpid(nix_pid, Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::StillAlive) => {}
        Ok(status) => {
            debug!("{}: child process {} {}", name, pid, describe(status));
            return Ok(());
        }
        Err(Errno::ECHILD) => {
            debug!("{}: child process {} already reaped", name, pid);
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    }

    debug!("{}: child process {} still running after disconnect; sending SIGTERM", name, pid);
    match kill(nix_pid, Signal::SIGTERM) {
        Ok(()) | Err(Errno::EPERM) | Err(Errno::ESRCH) => {}
        Err(e) => return Err(e.into()),
    }

    let name = name.to_string();
    thread::Builder::new()
        .name("tether-reaper".to_string())
        .spawn(move || match waitpid(nix_pid, None) {
            Ok(status) => debug!("{}: child process {} {}", name, pid, describe(status)),
            Err(Errno::ECHILD) => {}
            Err(e) => warn!("{}: waitpid({}) failed: {}", name, pid, e),
        })
        .map_err(|e| TetherError::io("cannot start reaper thread", e))?;
    Ok(())
}

/// Terminate a process with SIGTERM, then SIGKILL if it outlives `grace`.
pub fn terminate_process(pid: u32, grace: Duration) -> Result<bool> {
    let nix_pid = Pid::from_raw(pid as i32);
    if !is_process_alive(pid) {
        return Ok(true);
    }
    if let Err(e) = kill(nix_pid, Signal::SIGTERM) {
        if e == Errno::ESRCH {
            return Ok(true);
        }
        warn!("Failed to send SIGTERM to {}: {}", pid, e);
    }

    let interval = Duration::from_millis(50);
    let rounds = (grace.as_millis() / interval.as_millis()).max(1);
    for _ in 0..rounds {
        thread::sleep(interval);
        let _ = waitpid(nix_pid, Some(WaitPidFlag::WNOHANG));
        if !is_process_alive(pid) {
            return Ok(true);
        }
    }

    debug!("Process {} still running, sending SIGKILL", pid);
    match kill(nix_pid, Signal::SIGKILL) {
        Ok(()) => {}
        Err(Errno::ESRCH) => return Ok(true),
        Err(e) => {
            return Err(TetherError::Other(format!("Failed to kill process {}: {}", pid, e)));
        }
    }
    thread::sleep(interval);
    let _ = waitpid(nix_pid, Some(WaitPidFlag::WNOHANG));
    Ok(!is_process_alive(pid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn test_own_process_alive() {
        assert!(is_process_alive(std::process::id()));
    }

    #[test]
    fn test_reap_exited_child() {
        let child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        thread::sleep(Duration::from_millis(200));
        reap_child(pid, "test").unwrap();
        assert!(!is_process_alive(pid));
    }

    #[test]
    fn test_terminate_running_child() {
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        assert!(terminate_process(pid, Duration::from_secs(2)).unwrap());
    }
}
