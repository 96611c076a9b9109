use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, Signal, System};

fn refreshed(pid: u32) -> (System, Pid) {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    (system, pid)
}

fn is_live(process: &sysinfo::Process) -> bool {
    !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead)
}

/// Zombies count as dead: they only wait to be reaped by whoever spawned them.
pub fn is_alive(pid: u32) -> bool {
    let (system, pid) = refreshed(pid);
    system.process(pid).map(is_live).unwrap_or(false)
}

/// Start time of `pid` in seconds since the epoch, if it is running.
pub fn start_time(pid: u32) -> Option<u64> {
    let (system, pid) = refreshed(pid);
    system
        .process(pid)
        .filter(|process| is_live(process))
        .map(|process| process.start_time())
}

/// True when `pid` is alive and, if `started` is known, is still the process
/// that started at that time rather than a later one reusing the PID.
pub fn is_running(pid: u32, started: Option<u64>) -> bool {
    match started {
        Some(started) => start_time(pid) == Some(started),
        None => is_alive(pid),
    }
}

/// Sends SIGTERM where supported, SIGKILL otherwise. Returns false when the PID
/// is gone or now belongs to a different process than the one recorded.
pub fn terminate(pid: u32, started: Option<u64>) -> bool {
    let (system, sys_pid) = refreshed(pid);
    let Some(process) = system.process(sys_pid).filter(|p| is_live(p)) else {
        return false;
    };
    if let Some(started) = started {
        if process.start_time() != started {
            tracing::warn!(pid, "PID was reused by another process, not signalling it");
            return false;
        }
    }

    match process.kill_with(Signal::Term) {
        Some(sent) => sent,
        None => process.kill(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_process_is_alive() {
        let me = std::process::id();
        assert!(is_alive(me));
        let started = start_time(me);
        assert!(started.is_some());
        assert!(is_running(me, started));
        assert!(is_running(me, None));
    }

    #[test]
    fn test_missing_pid_is_not_alive() {
        assert!(!is_alive(u32::MAX - 1));
        assert!(start_time(u32::MAX - 1).is_none());
        assert!(!terminate(u32::MAX - 1, None));
    }

    #[cfg(unix)]
    #[test]
    fn test_reused_pid_is_left_alone() {
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        let started = start_time(pid).unwrap();

        // A record whose start time differs describes some earlier process.
        let recorded = Some(started.saturating_sub(3600));
        assert!(!is_running(pid, recorded));
        assert!(!terminate(pid, recorded));
        assert!(is_alive(pid));

        assert!(terminate(pid, Some(started)));
        child.wait().unwrap();
    }
}
