//! PLT lazy-binding resolution (spec.md §4.4). Grounded on
//! `examples/original_source/sysdeps/linux-gnu/ppc/plt.c`'s
//! `plt_default_t` → `plt_unresolved_t` → resolved-value state machine,
//! reground onto this crate's breakpoint-callback idiom instead of a
//! `library_symbol_t` linked list.

use crate::arch::PltRelocation;
use crate::debug::{self, Address};
use crate::errors::{Error, ErrorKind, Result};
use crate::process::breakpoint::{BreakpointCallbacks, HitContext};
use crate::process::handler::stopping::{self, StepDecision};
use crate::tracer::Tracer;
use nix::unistd::Pid;
use std::cell::RefCell;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PltState {
    /// The slot still points at the PLT's own lazy-binding stub.
    Stub,
    /// The dynamic linker has been entered but hasn't written the slot yet.
    Unresolved,
    /// The slot holds the real callee address.
    Resolved,
}

/// Shared between a PLT breakpoint's callbacks and whatever external table
/// wants to read the resolved address later (spec.md §4.4 "shared mutable
/// state"); `Rc<RefCell<>>` is the idiomatic shape for single-threaded,
/// multiply-referenced tracer state like this.
#[derive(Debug)]
pub struct PltSymbol {
    pub state: PltState,
    pub relocation: PltRelocation,
    pub resolved_value: Address,
    pub symbol: String,
}

impl PltSymbol {
    /// The common case: a PLT entry shared by every caller, starting
    /// unresolved with `resolved_value` holding the PLT entry address
    /// itself (spec.md §4.4 UNRESOLVED) until the dynamic linker writes the
    /// real callee into the slot.
    pub fn new(symbol: String, relocation: PltRelocation) -> Self {
        let resolved_value = relocation.plt_entry_addr;
        PltSymbol {
            state: PltState::Unresolved,
            relocation,
            resolved_value,
            symbol,
        }
    }

    /// Platforms where each PLT call has a private stub symbol (spec.md
    /// §4.4 STUB): treated as an ordinary, never-transitioning breakpoint.
    pub fn new_stub(symbol: String, relocation: PltRelocation) -> Self {
        PltSymbol {
            state: PltState::Stub,
            relocation,
            resolved_value: 0,
            symbol,
        }
    }
}

#[derive(Debug)]
pub struct PltCallbacks {
    symbol: Rc<RefCell<PltSymbol>>,
}

impl PltCallbacks {
    pub fn new(symbol: Rc<RefCell<PltSymbol>>) -> Self {
        PltCallbacks { symbol }
    }
}

impl BreakpointCallbacks for PltCallbacks {
    fn on_continue(&mut self, ctx: &mut HitContext) {
        let state = self.symbol.borrow().state;
        let leader = ctx.leader;
        let hitter = ctx.hitter;
        let addr = ctx.addr;

        match state {
            PltState::Stub => {
                // Never transitions; a private stub symbol is just an
                // ordinary breakpoint (spec.md §4.4 STUB).
                ctx.start_stopping_episode();
            }
            PltState::Unresolved => {
                // A second thread racing in while resolution is already in
                // flight rides the same stopping episode as the first.
                let symbol = self.symbol.clone();
                stopping::install_with_keep_stepping(
                    ctx.tracer,
                    leader,
                    hitter,
                    addr,
                    Box::new(move |tracer| keep_stepping_unresolved(tracer, leader, &symbol)),
                );
            }
            PltState::Resolved => {
                let resolved = self.symbol.borrow().resolved_value;
                if let Err(e) = ctx.tracer.arch.set_instruction_pointer(hitter, resolved) {
                    log::warn!("plt: failed to redirect {} to resolved callee: {}", hitter, e);
                }
                if let Err(e) = debug::cont(hitter, None) {
                    log::warn!("plt: continue after redirect failed for {}: {}", hitter, e);
                }
            }
        }
    }
}

/// Consulted once per single-step while resolving a PLT slot (spec.md §4.4
/// "keep stepping until the slot changes"). Reads the slot on the leader,
/// since the PLT lives in memory shared by the whole thread-group.
fn keep_stepping_unresolved(
    tracer: &mut Tracer,
    leader: Pid,
    symbol: &Rc<RefCell<PltSymbol>>,
) -> Result<StepDecision> {
    let (slot_addr, entry_addr) = {
        let sym = symbol.borrow();
        (sym.relocation.plt_slot_addr, sym.relocation.plt_entry_addr)
    };

    let word = debug::read_word(leader, slot_addr)
        .map_err(|e| Error::new(ErrorKind::PltFail).with_msg(format!("reading plt slot: {}", e)))?;
    let value = word as u64;

    if value == entry_addr || value == 0 {
        return Ok(StepDecision::Continue);
    }

    debug::write_word(leader, slot_addr, entry_addr as i64)
        .map_err(|e| Error::new(ErrorKind::PltFail).with_msg(format!("restoring plt slot: {}", e)))?;

    let mut sym = symbol.borrow_mut();
    sym.resolved_value = value;
    sym.state = PltState::Resolved;
    Ok(StepDecision::Stop)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_symbol_starts_unresolved_at_the_plt_entry() {
        let sym = PltSymbol::new(
            "malloc".to_string(),
            PltRelocation {
                plt_slot_addr: 0x404000,
                plt_entry_addr: 0x401020,
            },
        );
        assert_eq!(sym.state, PltState::Unresolved);
        assert_eq!(sym.resolved_value, 0x401020);
    }

    #[test]
    fn stub_symbol_never_transitions_on_construction() {
        let sym = PltSymbol::new_stub(
            "printf".to_string(),
            PltRelocation {
                plt_slot_addr: 0x404010,
                plt_entry_addr: 0x401030,
            },
        );
        assert_eq!(sym.state, PltState::Stub);
    }
}
