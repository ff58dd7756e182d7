//! Handler protocol (spec.md §3 "Handler"). A leader's installed handler
//! gets first look at every event routed to its thread-group; returning
//! `Some(event)` passes it on to default processing, `None` sinks it.

pub mod exiting;
pub mod stopping;
pub mod vfork;

use crate::process::event::Event;
use crate::tracer::Tracer;
use nix::unistd::Pid;

pub trait Handler: std::fmt::Debug {
    /// `leader` is always the thread-group leader the handler is installed
    /// on, even when `event.pid` names a sibling thread.
    fn on_event(&mut self, tracer: &mut Tracer, leader: Pid, event: Event) -> Option<Event>;

    /// Once true, the handler is dropped instead of reinstalled after the
    /// `on_event` call that made it true returns (spec.md §3 "Ownership":
    /// a handler is the only thing that can retire itself).
    fn is_finished(&self) -> bool {
        false
    }
}
