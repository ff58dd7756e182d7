//! The tracer context (spec.md §9 "thread a tracer-context through handler
//! interfaces"). Ties the process directory, the event queue, and the
//! architecture adapter together, and implements the routing/dispatch
//! policy of spec.md §4.2. Grounded on the teacher's `PRoot::event_loop`
//! (`process/proot.rs`), generalized from an inline `match` over
//! `WaitStatus` into typed events routed through an explicit handler stack.

use crate::arch::{Arch, SwSinglestepStatus};
use crate::debug::{self, Address};
use crate::errors::Result;
use crate::process::breakpoint::{DefaultCallbacks, HitContext};
use crate::process::event::{Event, EventKind, EventQueue};
use crate::process::handler::exiting::ExitingHandler;
use crate::process::handler::vfork::VforkHandler;
use crate::process::{ArchTag, Directory, Process, ProcessState};
use log::{debug as trace_debug, warn};
use nix::sys::ptrace;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::sync::atomic::{AtomicBool, Ordering};

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn request_shutdown(_: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

/// Installs the single SIGINT handler the tracer reacts to (spec.md §5
/// "Signal handling"). The handler only sets a flag; all real work happens
/// on the next main-loop iteration, never inside the signal handler
/// itself.
pub fn install_sigint_handler() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(request_shutdown),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe { nix::sys::signal::sigaction(Signal::SIGINT, &action) }
        .map(|_| ())
        .map_err(crate::errors::Error::from)
}

pub struct Tracer {
    pub directory: Directory,
    pub queue: EventQueue,
    pub arch: Box<dyn Arch>,
}

impl Tracer {
    pub fn new(arch: Box<dyn Arch>) -> Self {
        Tracer {
            directory: Directory::new(),
            queue: EventQueue::new(),
            arch,
        }
    }

    pub fn leader_of(&self, pid: Pid) -> Option<Pid> {
        self.directory.get(pid).map(|p| p.leader)
    }

    /// Registers a newly attached or spawned leader process.
    pub fn add_leader(&mut self, pid: Pid, attached_via_pid_list: bool) {
        self.directory
            .insert(Process::new_leader(pid, ArchTag::X86_64, attached_via_pid_list));
    }

    /// Runs the main event loop until every tracked process is gone
    /// (spec.md §4.2 "The main loop").
    pub fn run(&mut self) {
        while !self.directory.is_empty() {
            self.step();
        }
    }

    /// One iteration of the main loop: drain a queued event if one is
    /// eligible, otherwise block on the OS wait and translate the result.
    pub fn step(&mut self) {
        if SHUTDOWN_REQUESTED.swap(false, Ordering::SeqCst) {
            self.begin_shutdown();
        }

        if let Some(event) = self.queue.pop_front() {
            self.route_event(event);
            return;
        }

        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::__WALL)) {
            Ok(status) => {
                if let Some(event) = self.translate_wait_status(status) {
                    self.route_event(event);
                }
            }
            Err(nix::errno::Errno::ECHILD) => {
                // No children left to wait for; the directory will be
                // empty already in the common case, but guard against the
                // directory being stale relative to the kernel's view.
                self.directory = Directory::new();
            }
            Err(nix::errno::Errno::EINTR) => {
                // Likely our own SIGINT handler firing; re-checked at the
                // top of the next call to `step`.
            }
            Err(e) => {
                warn!("wait failed: {}", e);
            }
        }
    }

    /// `os_ltrace_exiting` (spec.md §5 "Signal handling"): installs the
    /// exiting handler on every currently tracked leader.
    fn begin_shutdown(&mut self) {
        for leader in self.directory.leader_pids() {
            ExitingHandler::install(self, leader);
        }
    }

    /// Converts a raw `WaitStatus` into a typed `Event`, rewinding the IP
    /// past a breakpoint trap before it is ever seen by a handler (spec.md
    /// §4.3 `undo_breakpoint`).
    fn translate_wait_status(&mut self, status: WaitStatus) -> Option<Event> {
        match status {
            WaitStatus::Exited(pid, code) => Some(Event::new(pid, EventKind::Exit(code))),
            WaitStatus::Signaled(pid, sig, _core) => {
                Some(Event::new(pid, EventKind::ExitSignal(sig)))
            }
            WaitStatus::PtraceSyscall(pid) => {
                self.ensure_options(pid);
                let in_sysenter = self.toggle_syscall_stage(pid);
                let kind = if in_sysenter {
                    EventKind::SyscallEntry(0)
                } else {
                    EventKind::SyscallReturn
                };
                Some(Event::new(pid, kind))
            }
            WaitStatus::PtraceEvent(pid, _sig, raw_event) => {
                self.ensure_options(pid);
                self.translate_ptrace_event(pid, raw_event)
            }
            WaitStatus::Stopped(pid, Signal::SIGTRAP) => {
                self.ensure_options(pid);
                Some(self.translate_sigtrap(pid))
            }
            WaitStatus::Stopped(pid, sig) => {
                self.ensure_options(pid);
                Some(Event::new(pid, EventKind::Signal(sig)))
            }
            WaitStatus::Continued(_) | WaitStatus::StillAlive => None,
        }
    }

    fn translate_ptrace_event(&mut self, pid: Pid, raw_event: i32) -> Option<Event> {
        let kind = if raw_event == ptrace::Event::PTRACE_EVENT_FORK as i32 {
            match debug::get_event_child(pid) {
                Ok(child) => EventKind::Fork(child),
                Err(e) => {
                    warn!("PTRACE_GETEVENTMSG failed for {}: {}", pid, e);
                    return None;
                }
            }
        } else if raw_event == ptrace::Event::PTRACE_EVENT_CLONE as i32 {
            // A CLONE_THREAD LWP joins the reporting task's own group,
            // unlike FORK's independent thread-group leader.
            match debug::get_event_child(pid) {
                Ok(child) => EventKind::Clone(child),
                Err(e) => {
                    warn!("PTRACE_GETEVENTMSG failed for {}: {}", pid, e);
                    return None;
                }
            }
        } else if raw_event == ptrace::Event::PTRACE_EVENT_VFORK as i32 {
            match debug::get_event_child(pid) {
                Ok(child) => EventKind::Vfork(child),
                Err(e) => {
                    warn!("PTRACE_GETEVENTMSG failed for {}: {}", pid, e);
                    return None;
                }
            }
        } else if raw_event == ptrace::Event::PTRACE_EVENT_EXEC as i32 {
            EventKind::Exec
        } else {
            // VFORK_DONE, SECCOMP, etc: no counterpart in the spec's event
            // kind set; treated as a bare stop with nothing to report.
            EventKind::None
        };
        Some(Event::new(pid, kind))
    }

    fn translate_sigtrap(&mut self, pid: Pid) -> Event {
        let leader = self.leader_of(pid);
        let ip = self.arch.get_instruction_pointer(pid).unwrap_or(0);
        let trap_offset = self.arch.trap_offset();
        let candidate = ip.wrapping_sub(trap_offset);

        let is_breakpoint = leader
            .and_then(|l| self.directory.get(l))
            .map(|p| p.breakpoints.contains(candidate))
            .unwrap_or(false);

        if is_breakpoint {
            if let Err(e) = self.arch.set_instruction_pointer(pid, candidate) {
                warn!("failed to rewind ip for {}: {}", pid, e);
            }
            Event::new(pid, EventKind::Breakpoint(candidate))
        } else {
            Event::new(pid, EventKind::Signal(Signal::SIGTRAP))
        }
    }

    fn ensure_options(&mut self, pid: Pid) {
        let needs_init = self
            .directory
            .get(pid)
            .map(|p| p.state == ProcessState::BeingCreated)
            .unwrap_or(false);
        if needs_init {
            if let Err(e) = debug::set_follow_fork(pid) {
                warn!("failed to set ptrace options for {}: {}", pid, e);
            }
            if let Some(proc) = self.directory.get_mut(pid) {
                proc.state = ProcessState::Stopped;
            }
        } else if let Some(proc) = self.directory.get_mut(pid) {
            proc.state = ProcessState::Stopped;
        }
    }

    /// Alternates sysenter/sysexit purely for event-kind labeling; the
    /// tracing core doesn't decode syscall arguments (out of scope,
    /// spec.md §6), it only needs to report entry vs. return distinctly.
    fn toggle_syscall_stage(&mut self, pid: Pid) -> bool {
        match self.directory.get_mut(pid) {
            Some(proc) => {
                let was_enter = proc.in_syscall;
                proc.in_syscall = !was_enter;
                !was_enter
            }
            None => true,
        }
    }

    /// Routing (spec.md §4.2): if the event's leader has an installed
    /// handler, call it; the handler returns either the event (to be
    /// routed to default processing) or nothing (sunk).
    pub fn route_event(&mut self, event: Event) {
        log::info!("{} {:?}", event.pid, event.kind);
        let routed = match self.leader_of(event.pid) {
            Some(leader) => self.deliver_to_handler(leader, event),
            None => Some(event),
        };
        if let Some(event) = routed {
            self.default_process(event);
        }
    }

    /// Swaps the leader's handler out, calls it, and swaps it back in
    /// unless the handler replaced or destroyed itself while running
    /// (single-slot stack, spec.md §3 "Ownership").
    pub fn deliver_to_handler(&mut self, leader: Pid, event: Event) -> Option<Event> {
        let handler = self.directory.get_mut(leader).and_then(|p| p.handler.take());
        match handler {
            Some(mut handler) => {
                let result = handler.on_event(self, leader, event);
                if !handler.is_finished() {
                    if let Some(proc) = self.directory.get_mut(leader) {
                        if proc.handler.is_none() {
                            proc.handler = Some(handler);
                        }
                    }
                }
                result
            }
            None => Some(event),
        }
    }

    fn default_process(&mut self, event: Event) {
        match event.kind {
            EventKind::Breakpoint(addr) => {
                self.handle_breakpoint_hit(event.pid, addr);
            }
            EventKind::Fork(child) => {
                self.handle_fork(event.pid, child);
                self.continue_process(event.pid);
            }
            EventKind::Clone(child) => {
                self.handle_clone(event.pid, child);
                self.continue_process(event.pid);
            }
            EventKind::Vfork(child) => {
                self.handle_vfork(event.pid, child);
                self.continue_process(event.pid);
            }
            EventKind::Exit(_) | EventKind::ExitSignal(_) => {
                self.handle_exit(event.pid);
            }
            EventKind::None | EventKind::Signal(_) | EventKind::SyscallEntry(_)
            | EventKind::SyscallReturn | EventKind::Exec | EventKind::New => {
                self.continue_process(event.pid);
            }
        }
    }

    fn handle_fork(&mut self, parent: Pid, child: Pid) {
        trace_debug!("fork: {} -> {}", parent, child);
        self.add_leader(child, false);
        if let Some(proc) = self.directory.get_mut(child) {
            proc.state = ProcessState::Stopped;
        }
        self.continue_process(child);
    }

    /// `CLONE_THREAD`: the new LWP joins `parent`'s own thread-group instead
    /// of becoming an independent leader, so the stopping coordinator's
    /// `thread_group` walk (and thus its sibling-SIGSTOP bootstrap) actually
    /// reaches it.
    fn handle_clone(&mut self, parent: Pid, child: Pid) {
        trace_debug!("clone: {} -> {}", parent, child);
        let leader = self.leader_of(parent).unwrap_or(parent);
        self.directory
            .insert(Process::new_sibling(child, leader, ArchTag::X86_64));
        if let Some(proc) = self.directory.get_mut(child) {
            proc.state = ProcessState::Stopped;
        }
        self.continue_process(child);
    }

    fn handle_vfork(&mut self, parent: Pid, child: Pid) {
        trace_debug!("vfork: {} -> {}", parent, child);
        let parent_leader = self.leader_of(parent).unwrap_or(parent);

        self.add_leader(child, false);
        if let Some(proc) = self.directory.get_mut(child) {
            proc.state = ProcessState::Stopped;
        }
        // The child shares the parent's address space; model it as a
        // second thread of the parent's leader (spec.md §4.6).
        self.directory.change_process_leader(child, parent_leader);
        if let Some(parent_proc) = self.directory.get_mut(parent_leader) {
            parent_proc.vfork_blocked = true;
        }

        let handler = VforkHandler::new(parent_leader, child);
        if let Some(proc) = self.directory.get_mut(parent_leader) {
            proc.handler = Some(Box::new(handler));
        }
        self.continue_process(child);
    }

    fn handle_exit(&mut self, pid: Pid) {
        trace_debug!("exit: {}", pid);
        self.directory.remove(pid);
    }

    fn handle_breakpoint_hit(&mut self, pid: Pid, addr: Address) {
        let leader = match self.leader_of(pid) {
            Some(l) => l,
            None => return,
        };

        let mut callbacks = match self.directory.get_mut(leader) {
            Some(proc) => match proc.breakpoints.get_mut(addr) {
                Some(bp) => std::mem::replace(&mut bp.callbacks, Box::new(DefaultCallbacks)),
                None => return,
            },
            None => return,
        };

        {
            let mut ctx = HitContext {
                tracer: self,
                leader,
                hitter: pid,
                addr,
            };
            callbacks.on_hit(&mut ctx);
        }
        {
            let mut ctx = HitContext {
                tracer: self,
                leader,
                hitter: pid,
                addr,
            };
            callbacks.on_continue(&mut ctx);
        }

        if let Some(proc) = self.directory.get_mut(leader) {
            if let Some(bp) = proc.breakpoints.get_mut(addr) {
                bp.callbacks = callbacks;
            }
        }
    }

    /// `continue_process` policy (spec.md §4.2): if events are already
    /// queued for `pid`, don't resume — they are snapshots of its current
    /// stop and must be drained first. This is what lets the stopping
    /// coordinator queue events without losing them.
    pub fn continue_process(&mut self, pid: Pid) {
        if self.queue.has_event_for(pid) {
            return;
        }
        if let Err(e) = debug::cont_syscall(pid, None) {
            warn!("continue failed for {}: {}", pid, e);
        }
    }

    /// Attempts hardware single-step; falls back to the architecture
    /// adapter's software single-step, recording every transient
    /// breakpoint address it installs.
    pub fn arch_sw_singlestep(
        &mut self,
        leader: Pid,
        pid: Pid,
        collected: &mut Vec<Address>,
    ) -> Result<SwSinglestepStatus> {
        let trap_instruction_owner = self.arch.as_ref();
        let arch_ptr = trap_instruction_owner as *const dyn Arch;
        // SAFETY: `arch` is never reassigned or moved while this reference
        // is alive; it only outlives the reborrow of `directory` below
        // because both are disjoint fields of the same `Tracer`.
        let arch_ref: &dyn Arch = unsafe { &*arch_ptr };

        let directory = &mut self.directory;
        arch_ref.sw_singlestep(pid, &mut |addr: Address| -> Result<()> {
            if let Some(proc) = directory.get_mut(leader) {
                proc.breakpoints.insert_breakpoint(
                    arch_ref,
                    leader,
                    addr,
                    None,
                    Box::new(DefaultCallbacks),
                )?;
            }
            collected.push(addr);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::x86_64::X86_64;
    use crate::process::breakpoint::DefaultCallbacks;
    use crate::process::Process;
    use crate::utils::tests::fork_test;

    /// Drives the tracer for exactly one OS event belonging to `pid`,
    /// bypassing `step`'s `waitpid(-1, ...)` so concurrently running tests
    /// that also fork children never reap each other's.
    fn step_on(tracer: &mut Tracer, pid: Pid) {
        if let Some(event) = tracer.queue.pop_front() {
            tracer.route_event(event);
            return;
        }
        if let Ok(status) = waitpid(pid, Some(WaitPidFlag::__WALL)) {
            if let Some(event) = tracer.translate_wait_status(status) {
                tracer.route_event(event);
            }
        }
    }

    #[test]
    fn breakpoint_hit_is_rearmed_after_the_stopping_episode() {
        fork_test(|pid| {
            debug::set_follow_fork(pid).expect("set options");

            let mut tracer = Tracer::new(Box::new(X86_64::new()));
            tracer
                .directory
                .insert(Process::new_leader(pid, ArchTag::X86_64, false));
            if let Some(proc) = tracer.directory.get_mut(pid) {
                proc.state = ProcessState::Stopped;
            }

            let ip = tracer.arch.get_instruction_pointer(pid).expect("get ip");
            {
                let arch = X86_64::new();
                let proc = tracer.directory.get_mut(pid).expect("leader present");
                proc.breakpoints
                    .insert_breakpoint(&arch, pid, ip, None, Box::new(DefaultCallbacks))
                    .expect("insert breakpoint");
            }

            debug::cont(pid, None).expect("continue past the initial sigstop");

            for _ in 0..200 {
                if !tracer.directory.contains(pid) {
                    break;
                }
                step_on(&mut tracer, pid);
            }

            // The tracee either re-armed the breakpoint and kept running
            // (most likely) or exited before we could observe it again;
            // either is a legitimate outcome of running real, unpredictable
            // child code, but if it's still tracked, the breakpoint must be
            // restored exactly as the stopping coordinator promises.
            if let Some(proc) = tracer.directory.get(pid) {
                let bp = proc.breakpoints.get(ip).expect("breakpoint still tracked");
                assert!(bp.enabled);
                assert_eq!(bp.enable_count, 1);
            }
        });
    }
}
