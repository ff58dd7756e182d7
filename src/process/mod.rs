//! Process & thread model (spec.md §3 "Process"). An in-memory directory of
//! tracees, keyed by pid exactly as the teacher's `PRoot` keys its tracees
//! (`process/proot.rs`'s `HashMap<Pid, Tracee>`), sidestepping the
//! leader/sibling/parent cyclic references spec.md §9 calls out by storing
//! them as `Pid`s that index back into the directory.

pub mod breakpoint;
pub mod event;
pub mod handler;
pub mod plt;

use crate::debug::Address;
use crate::process::breakpoint::BreakpointMap;
use crate::process::handler::Handler;
use nix::unistd::Pid;
use std::collections::HashMap;

/// Architecture tag carried per spec.md §3; only one adapter ships (see
/// `arch` module) but the tag still lets a process record which one a
/// given tracee was attached under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchTag {
    X86_64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    BeingCreated,
    Stopped,
    Running,
    AboutToDetach,
}

pub struct Process {
    pub pid: Pid,
    /// Self for a thread-group leader, else the pid of the leader.
    pub leader: Pid,
    /// Set for a vfork child while it shares its parent's address space
    /// (spec.md §4.6).
    pub parent: Option<Pid>,
    pub state: ProcessState,
    pub arch: ArchTag,
    /// Instruction pointer observed at the last stop.
    pub saved_ip: Address,
    /// The currently installed event handler, if any. A single-slot stack:
    /// replacing it is a plain assignment, since only one handler can be
    /// installed on a leader at a time (spec.md §3 "Ownership").
    pub handler: Option<Box<dyn Handler>>,
    /// Whether this leader was attached via the `-p` attach list, rather
    /// than spawned by the tracer itself (spec.md §4.7 point 4).
    pub attached_via_pid_list: bool,
    /// Toggled on every `PtraceSyscall` stop to distinguish sysenter from
    /// sysexit without decoding the syscall itself (out of scope, §6).
    pub in_syscall: bool,
    /// Set on a vfork parent's leader while a child shares its address
    /// space; the stopping coordinator must not SIGSTOP it (spec.md §4.5
    /// bootstrap, §4.6).
    pub vfork_blocked: bool,

    /// Leader-only: breakpoint dictionary.
    pub breakpoints: BreakpointMap,
    /// Leader-only: the other threads in this thread-group.
    pub siblings: Vec<Pid>,
}

impl Process {
    pub fn new_leader(pid: Pid, arch: ArchTag, attached_via_pid_list: bool) -> Self {
        Process {
            pid,
            leader: pid,
            parent: None,
            state: ProcessState::BeingCreated,
            arch,
            saved_ip: 0,
            handler: None,
            attached_via_pid_list,
            in_syscall: false,
            vfork_blocked: false,
            breakpoints: BreakpointMap::new(),
            siblings: Vec::new(),
        }
    }

    pub fn new_sibling(pid: Pid, leader: Pid, arch: ArchTag) -> Self {
        Process {
            pid,
            leader,
            parent: None,
            state: ProcessState::BeingCreated,
            arch,
            saved_ip: 0,
            handler: None,
            attached_via_pid_list: false,
            in_syscall: false,
            vfork_blocked: false,
            breakpoints: BreakpointMap::new(),
            siblings: Vec::new(),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.pid == self.leader
    }
}

/// Owns the lifetime of every tracked `Process`; the sole collaborator
/// that may create or destroy one.
#[derive(Default)]
pub struct Directory {
    processes: HashMap<Pid, Process>,
}

impl Directory {
    pub fn new() -> Self {
        Directory {
            processes: HashMap::new(),
        }
    }

    pub fn insert(&mut self, process: Process) {
        let pid = process.pid;
        let leader = process.leader;
        if leader != pid {
            if let Some(leader_proc) = self.processes.get_mut(&leader) {
                leader_proc.siblings.push(pid);
            }
        }
        self.processes.insert(pid, process);
    }

    pub fn get(&self, pid: Pid) -> Option<&Process> {
        self.processes.get(&pid)
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.processes.get_mut(&pid)
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.processes.contains_key(&pid)
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    /// All pids belonging to `leader`'s thread-group, leader first.
    pub fn thread_group(&self, leader: Pid) -> Vec<Pid> {
        let mut group = vec![leader];
        if let Some(leader_proc) = self.processes.get(&leader) {
            group.extend(leader_proc.siblings.iter().copied());
        }
        group
    }

    pub fn remove(&mut self, pid: Pid) -> Option<Process> {
        let removed = self.processes.remove(&pid);
        if let Some(proc) = &removed {
            if proc.leader != pid {
                if let Some(leader_proc) = self.processes.get_mut(&proc.leader) {
                    leader_proc.siblings.retain(|&s| s != pid);
                }
            }
        }
        removed
    }

    /// Re-parents `child` so it is treated as a second thread of `new_leader`
    /// (spec.md §4.6: vfork child shares the parent's address space). The
    /// child keeps its own pid as the map key.
    pub fn change_process_leader(&mut self, child: Pid, new_leader: Pid) {
        if let Some(old_leader) = self.processes.get(&child).map(|p| p.leader) {
            if old_leader != new_leader {
                if let Some(old_leader_proc) = self.processes.get_mut(&old_leader) {
                    old_leader_proc.siblings.retain(|&s| s != child);
                }
            }
        }
        if let Some(proc) = self.processes.get_mut(&child) {
            proc.leader = new_leader;
        }
        if new_leader != child {
            if let Some(new_leader_proc) = self.processes.get_mut(&new_leader) {
                if !new_leader_proc.siblings.contains(&child) {
                    new_leader_proc.siblings.push(child);
                }
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Process> {
        self.processes.values()
    }

    pub fn leader_pids(&self) -> Vec<Pid> {
        self.processes
            .values()
            .filter(|p| p.is_leader())
            .map(|p| p.pid)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(n: i32) -> Pid {
        Pid::from_raw(n)
    }

    #[test]
    fn insert_and_lookup_leader() {
        let mut dir = Directory::new();
        dir.insert(Process::new_leader(pid(100), ArchTag::X86_64, true));
        assert!(dir.get(pid(100)).unwrap().is_leader());
    }

    #[test]
    fn sibling_joins_leaders_group() {
        let mut dir = Directory::new();
        dir.insert(Process::new_leader(pid(100), ArchTag::X86_64, true));
        dir.insert(Process::new_sibling(pid(101), pid(100), ArchTag::X86_64));

        assert_eq!(dir.thread_group(pid(100)), vec![pid(100), pid(101)]);
    }

    #[test]
    fn removing_sibling_leaves_leaders_group_intact() {
        let mut dir = Directory::new();
        dir.insert(Process::new_leader(pid(100), ArchTag::X86_64, true));
        dir.insert(Process::new_sibling(pid(101), pid(100), ArchTag::X86_64));

        dir.remove(pid(101));
        assert_eq!(dir.thread_group(pid(100)), vec![pid(100)]);
    }

    #[test]
    fn change_process_leader_reparents_vfork_child() {
        let mut dir = Directory::new();
        dir.insert(Process::new_leader(pid(100), ArchTag::X86_64, true));
        dir.insert(Process::new_leader(pid(200), ArchTag::X86_64, false));

        // vfork: child 200 becomes a thread of parent 100's leader.
        dir.change_process_leader(pid(200), pid(100));
        assert_eq!(dir.thread_group(pid(100)), vec![pid(100), pid(200)]);
        assert_eq!(dir.get(pid(200)).unwrap().leader, pid(100));

        // exec/exit: restore the child's own leader.
        dir.change_process_leader(pid(200), pid(200));
        assert_eq!(dir.thread_group(pid(100)), vec![pid(100)]);
        assert_eq!(dir.get(pid(200)).unwrap().leader, pid(200));
    }
}
