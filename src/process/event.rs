//! Event queue & dispatch (spec.md §4.2). Generalizes the teacher's inline
//! `match waitpid(...) { ... }` in `process/proot.rs::event_loop` into a
//! typed, queueable value so the stopping coordinator can sink or defer
//! events without losing them (spec.md §4.5 "Sink/queue policy").

use crate::debug::Address;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    None,
    Signal(Signal),
    Breakpoint(Address),
    SyscallEntry(i64),
    SyscallReturn,
    Exec,
    Fork(Pid),
    /// `PTRACE_EVENT_CLONE`, specifically a `CLONE_THREAD` LWP: a new thread
    /// of the reporting task's own group, as opposed to `Fork`'s new,
    /// independent thread-group leader.
    Clone(Pid),
    Vfork(Pid),
    Exit(i32),
    ExitSignal(Signal),
    /// A thread the directory doesn't know about yet reported a stop; see
    /// DESIGN.md's "task_info == NULL" open-question decision.
    New,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub pid: Pid,
    pub kind: EventKind,
}

impl Event {
    pub fn new(pid: Pid, kind: EventKind) -> Self {
        Event { pid, kind }
    }

    pub fn is_exit(&self) -> bool {
        matches!(self.kind, EventKind::Exit(_) | EventKind::ExitSignal(_))
    }

    pub fn is_none(&self) -> bool {
        matches!(self.kind, EventKind::None)
    }
}

/// FIFO of pending events. Every OS-reported stop ends up routed, sunk, or
/// queued-then-routed (spec.md §8 invariant) — never dropped.
#[derive(Default)]
pub struct EventQueue {
    queue: VecDeque<Event>,
}

impl EventQueue {
    pub fn new() -> Self {
        EventQueue {
            queue: VecDeque::new(),
        }
    }

    pub fn push(&mut self, event: Event) {
        self.queue.push_back(event);
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn pop_front(&mut self) -> Option<Event> {
        self.queue.pop_front()
    }

    /// Returns and removes the first queued event matching `predicate`,
    /// preserving the relative order of the remaining events.
    pub fn each_queued_event<F>(&mut self, predicate: F) -> Option<Event>
    where
        F: Fn(&Event) -> bool,
    {
        let pos = self.queue.iter().position(predicate)?;
        self.queue.remove(pos)
    }

    pub fn has_event_for(&self, pid: Pid) -> bool {
        self.queue.iter().any(|e| e.pid == pid)
    }

    /// Drains every queued event belonging to `pid`, FIFO, leaving events
    /// for other pids in place and in order.
    pub fn drain_for(&mut self, pid: Pid) -> Vec<Event> {
        let mut matching = Vec::new();
        let mut rest = VecDeque::with_capacity(self.queue.len());
        for event in self.queue.drain(..) {
            if event.pid == pid {
                matching.push(event);
            } else {
                rest.push_back(event);
            }
        }
        self.queue = rest;
        matching
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(n: i32) -> Pid {
        Pid::from_raw(n)
    }

    #[test]
    fn fifo_order_is_preserved() {
        let mut q = EventQueue::new();
        q.push(Event::new(pid(1), EventKind::None));
        q.push(Event::new(pid(2), EventKind::SyscallReturn));

        assert_eq!(q.pop_front(), Some(Event::new(pid(1), EventKind::None)));
        assert_eq!(q.pop_front(), Some(Event::new(pid(2), EventKind::SyscallReturn)));
        assert_eq!(q.pop_front(), None);
    }

    #[test]
    fn each_queued_event_removes_only_the_first_match() {
        let mut q = EventQueue::new();
        q.push(Event::new(pid(1), EventKind::Breakpoint(0x1000)));
        q.push(Event::new(pid(1), EventKind::Breakpoint(0x2000)));

        let found = q.each_queued_event(|e| matches!(e.kind, EventKind::Breakpoint(_)));
        assert_eq!(found, Some(Event::new(pid(1), EventKind::Breakpoint(0x1000))));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn drain_for_only_takes_matching_pid_in_order() {
        let mut q = EventQueue::new();
        q.push(Event::new(pid(1), EventKind::None));
        q.push(Event::new(pid(2), EventKind::SyscallReturn));
        q.push(Event::new(pid(1), EventKind::Exit(0)));

        let drained = q.drain_for(pid(1));
        assert_eq!(
            drained,
            vec![Event::new(pid(1), EventKind::None), Event::new(pid(1), EventKind::Exit(0))]
        );
        assert_eq!(q.pop_front(), Some(Event::new(pid(2), EventKind::SyscallReturn)));
    }
}
