//! The stopping coordinator (spec.md §4.5) — quiesces every thread in a
//! leader's group before rewriting a breakpoint's patched bytes, so no
//! sibling ever observes a half-restored trap instruction. Grounded on the
//! `process_stopping`/`ugly_workaround` state machine named in
//! `examples/original_source/sysdeps/freebsd/trace.c`; the teacher repo has
//! no direct counterpart (proot-rs never multiplexes breakpoints across a
//! thread-group), so the state machine itself is rebuilt from the original
//! source while keeping this crate's `Handler`/`Tracer` idiom.

use crate::arch::SwSinglestepStatus;
use crate::debug::{self, Address};
use crate::errors::{Error, ErrorKind, Result};
use crate::process::breakpoint::DefaultCallbacks;
use crate::process::event::{Event, EventKind};
use crate::process::handler::Handler;
use crate::process::ProcessState;
use crate::tracer::Tracer;
use log::warn;
use nix::sys::signal::Signal;
use nix::unistd::Pid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepDecision {
    Continue,
    Stop,
}

pub type KeepSteppingPredicate = Box<dyn FnMut(&mut Tracer) -> Result<StepDecision>>;

#[derive(Debug)]
struct TaskRecord {
    /// Zeroed when the task exits mid-episode (spec.md §4.5 boundary case).
    pid: Option<Pid>,
    /// Whether this task needed an explicit SIGSTOP to quiesce.
    sigstopped: bool,
    /// Whether that SIGSTOP (or the lack of one) has been accounted for.
    delivered: bool,
    /// Whether this task is a vfork parent, which the kernel already keeps
    /// blocked; never SIGSTOPped, always counted as accounted-for.
    vforked: bool,
    /// At least one event has been seen for this task during this episode.
    got_event: bool,
    /// The most recent event seen for this task was a syscall return; used
    /// to suppress a redundant `continue_process` at SINKING (spec.md §3).
    sysret: bool,
}

impl TaskRecord {
    fn accounted_for(&self) -> bool {
        self.pid.is_none() || self.vforked || self.delivered || !self.sigstopped
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Stopping,
    SingleStep,
    UglyWorkaround,
}

pub struct StoppingHandler {
    leader: Pid,
    hitter: Pid,
    addr: Address,
    state: State,
    tasks: Vec<TaskRecord>,
    keep_stepping: Option<KeepSteppingPredicate>,
    /// True only when this episode exists to force a clean stop ahead of an
    /// imminent detach (DESIGN.md's `ugly_workaround_p` open-question
    /// decision), false for an ordinary breakpoint re-arm.
    for_detach: bool,
    transient_bp_addrs: Vec<Address>,
    used_hw_singlestep: bool,
    finished: bool,
}

impl std::fmt::Debug for StoppingHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoppingHandler")
            .field("leader", &self.leader)
            .field("hitter", &self.hitter)
            .field("addr", &self.addr)
            .field("state", &self.state)
            .finish()
    }
}

/// Installs the coordinator to re-arm an ordinary breakpoint.
pub fn install(tracer: &mut Tracer, leader: Pid, hitter: Pid, addr: Address) {
    install_with(tracer, leader, hitter, addr, None, false);
}

/// Installs the coordinator ahead of a detach, so `ugly_workaround_p` holds
/// if the kernel misdelivers the post-single-step trap (spec.md §4.5 last
/// bullet).
pub fn install_for_detach(tracer: &mut Tracer, leader: Pid, hitter: Pid, addr: Address) {
    install_with(tracer, leader, hitter, addr, None, true);
}

/// Installs the coordinator with a custom `keep_stepping_p` predicate,
/// consulted after every single-step instead of stopping unconditionally —
/// the PLT UNRESOLVED loop (spec.md §4.4) is the only user of this.
pub fn install_with_keep_stepping(
    tracer: &mut Tracer,
    leader: Pid,
    hitter: Pid,
    addr: Address,
    keep_stepping: KeepSteppingPredicate,
) {
    install_with(tracer, leader, hitter, addr, Some(keep_stepping), false);
}

fn install_with(
    tracer: &mut Tracer,
    leader: Pid,
    hitter: Pid,
    addr: Address,
    keep_stepping: Option<KeepSteppingPredicate>,
    for_detach: bool,
) {
    let mut handler = StoppingHandler {
        leader,
        hitter,
        addr,
        state: State::Stopping,
        tasks: Vec::new(),
        keep_stepping,
        for_detach,
        transient_bp_addrs: Vec::new(),
        used_hw_singlestep: false,
        finished: false,
    };

    if let Err(e) = handler.begin(tracer) {
        warn!(
            "stopping coordinator failed to start for {} at {:#x}: {}",
            leader, addr, e
        );
        return;
    }

    let all_stopped_already = handler.all_stopped();
    if let Some(proc) = tracer.directory.get_mut(leader) {
        proc.handler = Some(Box::new(handler));
    }
    if all_stopped_already {
        // Nothing will arrive from the OS to prompt the transition; drive
        // it synchronously via the same path a real event would take.
        tracer.deliver_to_handler(leader, Event::new(leader, EventKind::None));
    }
}

impl StoppingHandler {
    fn begin(&mut self, tracer: &mut Tracer) -> Result<()> {
        let group = tracer.directory.thread_group(self.leader);
        for pid in group {
            let state = tracer.directory.get(pid).map(|p| p.state);
            let vfork_blocked = tracer
                .directory
                .get(pid)
                .map(|p| p.vfork_blocked)
                .unwrap_or(false);

            let mut rec = TaskRecord {
                pid: Some(pid),
                sigstopped: false,
                delivered: false,
                vforked: false,
                got_event: false,
                sysret: false,
            };

            match state {
                Some(ProcessState::BeingCreated) => {
                    // Not attached yet; nothing to quiesce.
                }
                _ if vfork_blocked => {
                    rec.vforked = true;
                }
                _ if debug::is_stopped(pid) => {
                    // Already stopped at the OS level.
                }
                _ => match debug::suspend_thread(pid) {
                    Ok(()) => rec.sigstopped = true,
                    Err(e) => {
                        return Err(Error::new(ErrorKind::HandlerInstallFail)
                            .with_msg(format!("send_sigstop({}): {}", pid, e)));
                    }
                },
            }
            self.tasks.push(rec);
        }
        Ok(())
    }

    fn task_mut(&mut self, pid: Pid) -> Option<&mut TaskRecord> {
        self.tasks.iter_mut().find(|t| t.pid == Some(pid))
    }

    fn all_stopped(&self) -> bool {
        self.tasks.iter().all(TaskRecord::accounted_for)
    }

    fn other_threads(&self) -> Vec<Pid> {
        self.tasks
            .iter()
            .filter_map(|t| t.pid)
            .filter(|&p| p != self.hitter)
            .collect()
    }

    fn on_event_stopping(&mut self, tracer: &mut Tracer, event: Event) -> Option<Event> {
        let mut our_sigstop = false;
        match self.task_mut(event.pid) {
            Some(rec) => {
                rec.got_event = true;
                rec.sysret = matches!(event.kind, EventKind::SyscallReturn);
                if matches!(event.kind, EventKind::Signal(Signal::SIGSTOP))
                    && rec.sigstopped
                    && !rec.delivered
                {
                    rec.delivered = true;
                    our_sigstop = true;
                }
                if event.is_exit() {
                    rec.pid = None;
                }
            }
            None => {
                // spec.md §9 open question: task_info == NULL is logged and
                // the event continues as an ordinary, untracked stop.
                warn!("stopping coordinator: event for untracked task {}", event.pid);
            }
        }

        let routed = if our_sigstop {
            None
        } else if event.is_exit() || event.is_none() {
            Some(event)
        } else {
            tracer.queue.push(event);
            None
        };

        if self.all_stopped() {
            self.begin_singlestep(tracer);
        }

        routed
    }

    fn begin_singlestep(&mut self, tracer: &mut Tracer) {
        if let Some(leader_proc) = tracer.directory.get_mut(self.leader) {
            if let Err(e) = leader_proc
                .breakpoints
                .disable_breakpoint(self.leader, self.addr)
            {
                warn!(
                    "failed to disable breakpoint {:#x} on {}: {}",
                    self.addr, self.leader, e
                );
                self.destroy(tracer);
                return;
            }
        }

        let mut collected = Vec::new();
        match tracer.arch_sw_singlestep(self.leader, self.hitter, &mut collected) {
            Ok(SwSinglestepStatus::Hw) => {
                self.used_hw_singlestep = true;
                for pid in self.other_threads() {
                    if let Err(e) = debug::suspend_thread(pid) {
                        warn!("failed to pin sibling {} during single-step: {}", pid, e);
                    }
                }
                if let Err(e) = debug::single_step(self.hitter, None) {
                    warn!("single-step failed for {}: {}", self.hitter, e);
                    self.destroy(tracer);
                    return;
                }
            }
            Ok(SwSinglestepStatus::Ok) => {
                self.used_hw_singlestep = false;
                self.transient_bp_addrs = collected;
                if let Err(e) = debug::cont(self.hitter, None) {
                    warn!("continue after sw-singlestep setup failed for {}: {}", self.hitter, e);
                    self.destroy(tracer);
                    return;
                }
            }
            Ok(SwSinglestepStatus::Fail) | Err(_) => {
                warn!(
                    "architecture cannot single-step {}; breakpoint {:#x} stays disarmed",
                    self.hitter, self.addr
                );
                self.destroy(tracer);
                return;
            }
        }
        self.state = State::SingleStep;
    }

    fn on_event_singlestep(&mut self, tracer: &mut Tracer, event: Event) -> Option<Event> {
        let step_completed = event.pid == self.hitter
            && (matches!(event.kind, EventKind::Signal(Signal::SIGTRAP))
                || matches!(event.kind, EventKind::Breakpoint(_)));

        if !step_completed {
            // spec.md §4.5 SINGLESTEP: a non-trap signal delivered to the
            // hitter while a hardware single-step is in flight must not
            // lose the step; keep it paused and re-issue the step with the
            // signal queued for delivery once it completes.
            if event.pid == self.hitter && self.used_hw_singlestep {
                if let EventKind::Signal(sig) = event.kind {
                    if let Err(e) = debug::single_step(self.hitter, Some(sig)) {
                        warn!(
                            "failed to re-issue single-step for {} after {:?}: {}",
                            self.hitter, sig, e
                        );
                        self.destroy(tracer);
                    }
                    return None;
                }
            }
            if event.is_exit() || event.is_none() {
                return Some(event);
            }
            tracer.queue.push(event);
            return None;
        }

        // Remove any software-single-step transient breakpoints, whether
        // this stop is the hardware single-step's own trap or one of them.
        if let Some(leader_proc) = tracer.directory.get_mut(self.leader) {
            for addr in self.transient_bp_addrs.drain(..) {
                let _ = leader_proc.breakpoints.delete_breakpoint(self.leader, addr);
            }
        }

        self.sink(tracer);
        None
    }

    /// SINKING (spec.md §4.5): release the group, then either finish or
    /// fall into `UGLY_WORKAROUND`.
    fn sink(&mut self, tracer: &mut Tracer) {
        if self.used_hw_singlestep {
            for pid in self.other_threads() {
                if let Err(e) = debug::resume_thread(pid) {
                    warn!("failed to release sibling {}: {}", pid, e);
                }
            }
        }

        let keep_stepping = self.keep_stepping.as_mut().map(|p| p(tracer));
        match keep_stepping {
            Some(Ok(StepDecision::Continue)) => {
                // Re-enable and single-step again without leaving STOPPING.
                self.state = State::Stopping;
                self.begin_singlestep(tracer);
                return;
            }
            Some(Err(e)) => {
                warn!("keep_stepping predicate failed: {}", e);
            }
            _ => {}
        }

        if let Some(leader_proc) = tracer.directory.get_mut(self.leader) {
            if let Err(e) = leader_proc
                .breakpoints
                .enable_breakpoint(tracer.arch.as_ref(), self.leader, self.addr)
            {
                warn!("failed to re-arm breakpoint {:#x}: {}", self.addr, e);
            }
        }

        if self.for_detach && self.used_hw_singlestep {
            self.enter_ugly_workaround(tracer);
            return;
        }

        self.destroy(tracer);
    }

    /// A kernel misdelivering the post-single-step trap means the hitter
    /// may land back on the just-re-armed breakpoint instead of the
    /// instruction after it; sidestep by planting a one-shot breakpoint at
    /// the hitter's current IP and detaching once it's hit (spec.md §4.5
    /// last bullet, DESIGN.md's `ugly_workaround_p` decision).
    fn enter_ugly_workaround(&mut self, tracer: &mut Tracer) {
        let ip = match tracer.arch.get_instruction_pointer(self.hitter) {
            Ok(ip) => ip,
            Err(e) => {
                warn!("ugly workaround: failed to read ip for {}: {}", self.hitter, e);
                self.destroy(tracer);
                return;
            }
        };

        if let Some(leader_proc) = tracer.directory.get_mut(self.leader) {
            if let Err(e) = leader_proc.breakpoints.insert_breakpoint(
                tracer.arch.as_ref(),
                self.leader,
                ip,
                None,
                Box::new(DefaultCallbacks),
            ) {
                warn!("ugly workaround: failed to plant breakpoint at {:#x}: {}", ip, e);
                self.destroy(tracer);
                return;
            }
        }
        self.transient_bp_addrs.push(ip);
        if let Err(e) = debug::cont(self.hitter, None) {
            warn!("ugly workaround: continue failed for {}: {}", self.hitter, e);
        }
        self.state = State::UglyWorkaround;
    }

    fn on_event_ugly(&mut self, tracer: &mut Tracer, event: Event) -> Option<Event> {
        if event.pid != self.hitter {
            if event.is_exit() || event.is_none() {
                return Some(event);
            }
            tracer.queue.push(event);
            return None;
        }

        if let Some(leader_proc) = tracer.directory.get_mut(self.leader) {
            for addr in self.transient_bp_addrs.drain(..) {
                let _ = leader_proc.breakpoints.delete_breakpoint(self.leader, addr);
            }
        }
        if let Err(e) = debug::detach(self.hitter, None) {
            warn!("ugly workaround: detach failed for {}: {}", self.hitter, e);
        }
        self.destroy(tracer);
        None
    }

    /// SINKING's release step (spec.md §4.5): only a task whose prior event
    /// is already accounted for — its own SIGSTOP was sunk, or its most
    /// recent event was a syscall return — gets an explicit
    /// `continue_process` here. Anything else either needs no resume (a
    /// vfork parent the kernel already holds) or will be resumed once its
    /// still-pending queued event is routed.
    fn destroy(&mut self, tracer: &mut Tracer) {
        self.finished = true;
        for task in &self.tasks {
            if task.pid == Some(self.hitter) {
                continue;
            }
            if let Some(pid) = task.pid {
                if (task.delivered || task.sysret) && tracer.directory.get(pid).is_some() {
                    tracer.continue_process(pid);
                }
            }
        }
        tracer.continue_process(self.hitter);
    }
}

impl Handler for StoppingHandler {
    fn on_event(&mut self, tracer: &mut Tracer, _leader: Pid, event: Event) -> Option<Event> {
        match self.state {
            State::Stopping => self.on_event_stopping(tracer, event),
            State::SingleStep => self.on_event_singlestep(tracer, event),
            State::UglyWorkaround => self.on_event_ugly(tracer, event),
        }
    }

    fn is_finished(&self) -> bool {
        self.finished
    }
}
