//! Process liveness and termination helpers.

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

/// True when `pid` names a live process we may signal.
pub fn alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

/// Asks a process to terminate.
pub fn terminate(pid: i32) -> nix::Result<()> {
    kill(Pid::from_raw(pid), Signal::SIGTERM)
}

/// Kills a process outright.
pub fn force_kill(pid: i32) -> nix::Result<()> {
    kill(Pid::from_raw(pid), Signal::SIGKILL)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_process_is_alive() {
        assert!(alive(std::process::id() as i32));
    }

    #[test]
    fn nonexistent_pid_is_not_alive() {
        // Pids near the max are vanishingly unlikely to be in use.
        assert!(!alive(i32::MAX - 1));
    }

    #[test]
    fn terminate_nonexistent_pid_errors() {
        assert!(terminate(i32::MAX - 1).is_err());
    }
}
