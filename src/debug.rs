//! The debug-interface primitive: a thin wrapper over the OS's
//! process-control syscall (spec.md §4.1). Every operation here fails with
//! an `os-error`-kind `Error` on syscall failure, except the memory
//! read/write pair, which reports `memory-error` so the breakpoint and PLT
//! layers can distinguish "the tracee went away mid-patch" from an ordinary
//! ptrace failure.

use crate::errors::{Error, ErrorKind, Result};
use libc::user_regs_struct;
use nix::sys::ptrace;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs;

pub type Address = u64;

fn os_error(err: nix::Error) -> Error {
    Error::from(err)
}

fn memory_error(err: nix::Error, addr: Address) -> Error {
    Error::new(ErrorKind::MemoryError)
        .with_msg(format!("address {:#x}: {}", addr, err))
}

/// Causes the tracee to receive a stop signal. The caller must wait for the
/// stop before issuing any further operation.
pub fn attach(pid: Pid) -> Result<()> {
    ptrace::attach(pid).map_err(os_error)
}

/// Releases control of the tracee, optionally delivering `signal`.
pub fn detach(pid: Pid, signal: Option<Signal>) -> Result<()> {
    ptrace::detach(pid, signal).map_err(os_error)
}

/// Resumes the tracee; the next stop will be the next syscall or breakpoint
/// trap hit.
pub fn cont(pid: Pid, signal: Option<Signal>) -> Result<()> {
    ptrace::cont(pid, signal).map_err(os_error)
}

/// Resumes the tracee in syscall-stop mode: the next stop is either a
/// breakpoint or the entry/return of the tracee's next system call. This
/// is `continue_process`'s default resume flavor (spec.md §4.2).
pub fn cont_syscall(pid: Pid, signal: Option<Signal>) -> Result<()> {
    ptrace::syscall(pid, signal).map_err(os_error)
}

/// Executes exactly one instruction in the tracee, then stops it.
pub fn single_step(pid: Pid, signal: Option<Signal>) -> Result<()> {
    ptrace::step(pid, signal).map_err(os_error)
}

/// Reads one machine word from the tracee's address space.
pub fn read_word(pid: Pid, addr: Address) -> Result<i64> {
    ptrace::read(pid, addr as ptrace::AddressType).map_err(|e| memory_error(e, addr))
}

/// Writes one machine word to the tracee's address space. Breakpoint
/// patching always goes through here, never through a bulk write, so a
/// write is always word-granular (spec.md §4.1).
pub fn write_word(pid: Pid, addr: Address, word: i64) -> Result<()> {
    ptrace::write(pid, addr as ptrace::AddressType, word).map_err(|e| memory_error(e, addr))
}

/// Bulk read; returns the number of bytes actually read, which may be
/// shorter than `buf` if the read crosses an unmapped page.
pub fn read_memory(pid: Pid, addr: Address, buf: &mut [u8]) -> Result<usize> {
    let word_size = std::mem::size_of::<i64>();
    let mut read = 0;
    while read < buf.len() {
        let word = read_word(pid, addr + read as Address)?;
        let bytes = word.to_ne_bytes();
        let n = std::cmp::min(word_size, buf.len() - read);
        buf[read..read + n].copy_from_slice(&bytes[..n]);
        read += n;
    }
    Ok(read)
}

pub fn read_regs(pid: Pid) -> Result<user_regs_struct> {
    ptrace::getregs(pid).map_err(os_error)
}

pub fn write_regs(pid: Pid, regs: user_regs_struct) -> Result<()> {
    ptrace::setregs(pid, regs).map_err(os_error)
}

/// Freezes a single thread without disturbing its siblings. Used only
/// around hardware single-step windows (spec.md §4.5, §5).
pub fn suspend_thread(tid: Pid) -> Result<()> {
    kill(tid, Signal::SIGSTOP).map_err(os_error)
}

pub fn resume_thread(tid: Pid) -> Result<()> {
    kill(tid, Signal::SIGCONT).map_err(os_error)
}

pub fn send_signal(pid: Pid, signal: Signal) -> Result<()> {
    kill(pid, signal).map_err(os_error)
}

/// Returns the sorted list of LWP ids belonging to `pid`'s thread-group, by
/// reading `/proc/<pid>/task`.
pub fn enum_threads(pid: Pid) -> Result<Vec<Pid>> {
    let mut threads = Vec::new();
    let entries = fs::read_dir(format!("/proc/{}/task", pid))
        .map_err(|e| Error::from(e).with_msg(format!("enumerating threads of {}", pid)))?;

    for entry in entries {
        let entry = entry.map_err(Error::from)?;
        if let Some(name) = entry.file_name().to_str() {
            if let Ok(tid) = name.parse::<i32>() {
                threads.push(Pid::from_raw(tid));
            }
        }
    }
    threads.sort();
    Ok(threads)
}

/// Reads the pid of the just-created child after a fork/vfork/clone
/// ptrace-event stop (spec.md §4.6, concrete scenario 3).
pub fn get_event_child(pid: Pid) -> Result<Pid> {
    ptrace::getevent(pid)
        .map(|raw| Pid::from_raw(raw as i32))
        .map_err(os_error)
}

/// Requests automatic attach on child at fork/vfork/clone, plus the options
/// needed to unambiguously recognize syscall-stops and exec/exit events
/// (spec.md §4.6, §4.7, concrete scenario 3).
pub fn set_follow_fork(pid: Pid) -> Result<()> {
    let options = ptrace::Options::PTRACE_O_TRACESYSGOOD
        | ptrace::Options::PTRACE_O_TRACEFORK
        | ptrace::Options::PTRACE_O_TRACEVFORK
        | ptrace::Options::PTRACE_O_TRACEVFORKDONE
        | ptrace::Options::PTRACE_O_TRACEEXEC
        | ptrace::Options::PTRACE_O_TRACECLONE
        | ptrace::Options::PTRACE_O_TRACEEXIT;

    ptrace::setoptions(pid, options).map_err(os_error)
}

/// Reads `/proc/<pid>/stat`'s state character; used by the stopping
/// coordinator's bootstrap to skip tasks the OS already reports stopped
/// (spec.md §4.5 "Skip tasks already stopped").
pub fn is_stopped(pid: Pid) -> bool {
    let stat = match fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(s) => s,
        Err(_) => return false,
    };
    // Field 3 is the state char; it follows the `(comm)` parenthesized
    // field, which may itself contain spaces or parentheses.
    match stat.rfind(')') {
        Some(paren) => stat[paren + 1..]
            .split_whitespace()
            .next()
            .map(|s| s == "T" || s == "t")
            .unwrap_or(false),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Arch;
    use crate::utils::tests::fork_test;

    #[test]
    fn word_round_trips_through_tracee_memory() {
        fork_test(|pid| {
            // the tracee's own text segment, at its current instruction
            // pointer, is readable and (on most systems) writable under
            // ptrace once stopped.
            let ip = crate::arch::x86_64::X86_64::new()
                .get_instruction_pointer(pid)
                .expect("read ip");
            let word = read_word(pid, ip).expect("read word");
            assert!(write_word(pid, ip, word).is_ok());
        });
    }

    #[test]
    fn enum_threads_includes_self_for_single_threaded_process() {
        let me = nix::unistd::getpid();
        let threads = enum_threads(me).expect("enum threads");
        assert!(threads.contains(&me));
    }
}
