//! Shared helpers that don't belong to any one module.

#[cfg(test)]
pub mod tests {
    use nix::sys::ptrace;
    use nix::sys::signal::{kill, Signal};
    use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
    use nix::unistd::{fork, getpid, ForkResult, Pid};

    /// Forks a child that immediately `PTRACE_TRACEME`s and `SIGSTOP`s
    /// itself, waits for that stop, then hands the tracer-side closure the
    /// now-stopped, ptrace-attached child pid. The child is killed and
    /// reaped once `func` returns, regardless of what state it left the
    /// child in. Grounded on this crate's teacher's `utils.rs::fork_test`,
    /// trimmed to a single-process debug-interface/breakpoint test harness
    /// (no filesystem root, no `PTRACE_SYSCALL` restart loop).
    pub fn fork_test<F: FnOnce(Pid)>(func: F) {
        match unsafe { fork() }.expect("fork in test") {
            ForkResult::Child => {
                ptrace::traceme().expect("test ptrace traceme");
                kill(getpid(), Signal::SIGSTOP).expect("test child sigstop");
                std::process::exit(0);
            }
            ForkResult::Parent { child } => {
                assert_eq!(
                    waitpid(child, Some(WaitPidFlag::__WALL)),
                    Ok(WaitStatus::Stopped(child, Signal::SIGSTOP))
                );

                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    func(child);
                }));

                let _ = kill(child, Signal::SIGKILL);
                let _ = waitpid(child, Some(WaitPidFlag::__WALL));

                if let Err(e) = result {
                    std::panic::resume_unwind(e);
                }
            }
        }
    }
}
