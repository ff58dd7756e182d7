//! The architecture adapter (spec.md §6). Declared an external collaborator
//! by the spec, but the tracing core still needs one concrete
//! implementation to be exercisable — see SPEC_FULL.md. `x86_64` is the
//! only adapter shipped; its hardware single-step is always available, so
//! `sw_singlestep` always returns `Hw` and the software-single-step path
//! (transient breakpoints at possible next PCs) exists in the stopping
//! coordinator but is only reachable via `Arch` impls this crate doesn't
//! ship, exactly like ltrace's own tree where only PPC needs it.

pub mod x86_64;

use crate::debug::Address;
use crate::errors::Result;
use nix::unistd::Pid;

/// Outcome of `Arch::sw_singlestep`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwSinglestepStatus {
    /// Hardware single-step is available; the coordinator should issue it.
    Hw,
    /// The adapter already installed transient breakpoints via `add_cb`;
    /// the coordinator should simply continue the tracee.
    Ok,
    /// Neither hardware nor software single-step is usable here. Aborts
    /// the stopping episode (spec.md §9 open question: surfaced as a
    /// runtime warning, not silently dropped).
    Fail,
}

/// What the ELF front-end (out of scope, spec.md §6) would hand the
/// tracing core for one PLT relocation: the slot the dynamic linker
/// writes the resolved callee into, and the PLT entry/stub address a
/// breakpoint is placed at before resolution.
#[derive(Debug, Clone, Copy)]
pub struct PltRelocation {
    pub plt_slot_addr: Address,
    pub plt_entry_addr: Address,
}

pub trait Arch {
    /// The trap instruction's bytes, as installed by the breakpoint
    /// subsystem (e.g. `0xCC` for x86's `int3`).
    fn trap_instruction_bytes(&self) -> &'static [u8];

    /// How far past `address` the reported stop PC lands after hitting the
    /// trap instruction; used to rewind the IP back to `address` before
    /// invoking callbacks (spec.md §4.3 `undo_breakpoint`).
    fn trap_offset(&self) -> Address;

    fn get_instruction_pointer(&self, pid: Pid) -> Result<Address>;
    fn set_instruction_pointer(&self, pid: Pid, addr: Address) -> Result<()>;

    /// Attempt a software single-step by installing transient breakpoints
    /// at every address the current instruction could branch to, via
    /// `add_cb`. Returns `Hw` without calling `add_cb` when hardware
    /// single-step should be used instead.
    fn sw_singlestep(
        &self,
        pid: Pid,
        add_cb: &mut dyn FnMut(Address) -> Result<()>,
    ) -> Result<SwSinglestepStatus>;

    /// Resolves the address of a PLT relocation's slot, accounting for
    /// this architecture's PLT layout (secure-plt vs. BSS-auxiliary-table).
    fn plt_sym_val(&self, lte: &PltRelocation) -> Address {
        lte.plt_slot_addr
    }

    /// `.opd` → text indirection on architectures with function
    /// descriptors (e.g. ppc64 ELFv1); identity everywhere else.
    fn translate_address(&self, _pid: Pid, addr: Address) -> Result<Address> {
        Ok(addr)
    }
}
