//! Supervisor liveness checks.
//!
//! A worker must not outlive the process that spawned it. The worker polls
//! the supervisor's pid and shuts down once it is gone.

use std::time::Duration;

/// Whether a process with `pid` exists.
///
/// A process we may not signal (`EPERM`) still counts as alive. An exited
/// but unreaped child also counts as alive until its parent waits on it.
pub fn is_process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }

    // SAFETY: signal 0 performs only the existence and permission check.
    let result = unsafe { libc::kill(pid, 0) };
    if result == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Resolve once `pid` no longer exists, checking every `interval`.
pub async fn wait_for_exit(pid: u32, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if !is_process_alive(pid) {
            tracing::debug!("Process {} is gone", pid);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_process_is_alive() {
        assert!(is_process_alive(std::process::id()));
    }

    #[test]
    fn test_invalid_pids() {
        assert!(!is_process_alive(0));
        assert!(!is_process_alive(u32::MAX));
    }

    #[tokio::test]
    async fn test_wait_for_exit_after_kill() {
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let pid = child.id();
        assert!(is_process_alive(pid));

        child.kill().unwrap();
        child.wait().unwrap();

        tokio::time::timeout(
            Duration::from_secs(5),
            wait_for_exit(pid, Duration::from_millis(10)),
        )
        .await
        .expect("process should be reported gone");
    }
}
