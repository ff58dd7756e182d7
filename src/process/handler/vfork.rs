//! Vfork handler (spec.md §4.6). The child temporarily shares the parent's
//! address space, so any breakpoint byte it happens to run into during that
//! window belongs to the parent, not to it; this handler retracts such a
//! breakpoint on first sight and restores it once the child execs or exits.
//! No teacher counterpart (proot-rs doesn't special-case vfork); rebuilt
//! from `examples/original_source/sysdeps/freebsd/trace.c`'s
//! `event_vfork`/`event_exec` handling in this crate's `Handler` idiom.

use crate::debug;
use crate::process::event::{Event, EventKind};
use crate::process::handler::Handler;
use crate::tracer::Tracer;
use log::warn;
use nix::unistd::Pid;

#[derive(Debug)]
pub struct VforkHandler {
    parent_leader: Pid,
    child: Pid,
    /// The first breakpoint address seen hit during the vfork window,
    /// retracted immediately and re-inserted once the child is done.
    vfork_return_addr: Option<u64>,
    finished: bool,
}

impl VforkHandler {
    pub fn new(parent_leader: Pid, child: Pid) -> Self {
        VforkHandler {
            parent_leader,
            child,
            vfork_return_addr: None,
            finished: false,
        }
    }
}

impl Handler for VforkHandler {
    fn on_event(&mut self, tracer: &mut Tracer, leader: Pid, event: Event) -> Option<Event> {
        match event.kind {
            EventKind::Breakpoint(addr) if self.vfork_return_addr.is_none() => {
                self.vfork_return_addr = Some(addr);
                if let Some(proc) = tracer.directory.get_mut(leader) {
                    if let Err(e) = proc.breakpoints.disable_breakpoint(leader, addr) {
                        warn!(
                            "vfork: failed to retract vfork-return breakpoint at {:#x}: {}",
                            addr, e
                        );
                    }
                }
                if let Err(e) = debug::cont(event.pid, None) {
                    warn!("vfork: continue failed for {}: {}", event.pid, e);
                }
                None
            }
            EventKind::Exec | EventKind::Exit(_) | EventKind::ExitSignal(_)
                if event.pid == self.child =>
            {
                if let Some(addr) = self.vfork_return_addr {
                    if let Some(proc) = tracer.directory.get_mut(self.parent_leader) {
                        if let Err(e) =
                            proc.breakpoints
                                .enable_breakpoint(tracer.arch.as_ref(), self.parent_leader, addr)
                        {
                            warn!(
                                "vfork: failed to re-insert vfork-return breakpoint at {:#x}: {}",
                                addr, e
                            );
                        }
                    }
                }
                tracer
                    .directory
                    .change_process_leader(self.child, self.child);
                if let Some(proc) = tracer.directory.get_mut(self.parent_leader) {
                    proc.vfork_blocked = false;
                }
                tracer.continue_process(self.parent_leader);
                self.finished = true;
                // Let the event continue to default processing (e.g.
                // reaping an exited child).
                Some(event)
            }
            _ => Some(event),
        }
    }

    fn is_finished(&self) -> bool {
        self.finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::x86_64::X86_64;
    use crate::arch::Arch;
    use crate::process::breakpoint::DefaultCallbacks;
    use crate::process::event::Event;
    use crate::process::{ArchTag, Process};
    use crate::tracer::Tracer;
    use crate::utils::tests::fork_test;

    #[test]
    fn retracts_on_first_hit_and_restores_on_child_exit() {
        fork_test(|leader| {
            let arch = X86_64::new();
            let ip = arch.get_instruction_pointer(leader).expect("get ip");

            let mut tracer = Tracer::new(Box::new(X86_64::new()));
            tracer
                .directory
                .insert(Process::new_leader(leader, ArchTag::X86_64, true));
            {
                let proc = tracer.directory.get_mut(leader).expect("leader present");
                proc.vfork_blocked = true;
                proc.breakpoints
                    .insert_breakpoint(&arch, leader, ip, None, Box::new(DefaultCallbacks))
                    .expect("insert breakpoint");
            }

            // A vfork child shares no pid space of its own worth forking for
            // real here; the handler never issues a ptrace call keyed on the
            // child's pid except a best-effort `cont` it's fine for this
            // fake pid to fail.
            let child = Pid::from_raw(leader.as_raw() + 1_000_000);
            let mut handler = VforkHandler::new(leader, child);

            let hit = Event::new(child, EventKind::Breakpoint(ip));
            let routed = handler.on_event(&mut tracer, leader, hit);
            assert!(routed.is_none(), "the first hit during the window is sunk");
            assert!(!handler.is_finished());
            assert!(
                !tracer
                    .directory
                    .get(leader)
                    .unwrap()
                    .breakpoints
                    .get(ip)
                    .unwrap()
                    .enabled,
                "breakpoint must be retracted for the duration of the window"
            );

            let child_exit = Event::new(child, EventKind::Exit(0));
            let routed = handler.on_event(&mut tracer, leader, child_exit);
            assert!(routed.is_some(), "exit still reaches default processing");
            assert!(handler.is_finished());
            assert!(
                tracer
                    .directory
                    .get(leader)
                    .unwrap()
                    .breakpoints
                    .get(ip)
                    .unwrap()
                    .enabled,
                "breakpoint must be re-armed once the child is done"
            );
            assert!(!tracer.directory.get(leader).unwrap().vfork_blocked);
        });
    }
}
