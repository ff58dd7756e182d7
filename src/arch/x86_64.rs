//! x86_64/linux-gnu architecture adapter.
//!
//! The `InstrPointer`/`StackPointer` field mapping mirrors the teacher's
//! `register/abi.rs` `get_reg!` macro, trimmed to the two registers the
//! tracing core actually touches (the syscall-argument registers that
//! macro also maps belong to the out-of-scope argument-decoding front-end).

use crate::arch::{Arch, SwSinglestepStatus};
use crate::debug::{self, Address};
use crate::errors::Result;
use nix::unistd::Pid;

/// `0xCC`: the `int3` trap instruction.
const TRAP_INSTRUCTION: [u8; 1] = [0xCC];

pub struct X86_64;

impl X86_64 {
    pub fn new() -> Self {
        X86_64
    }
}

impl Default for X86_64 {
    fn default() -> Self {
        Self::new()
    }
}

impl Arch for X86_64 {
    fn trap_instruction_bytes(&self) -> &'static [u8] {
        &TRAP_INSTRUCTION
    }

    fn trap_offset(&self) -> Address {
        TRAP_INSTRUCTION.len() as Address
    }

    fn get_instruction_pointer(&self, pid: Pid) -> Result<Address> {
        let regs = debug::read_regs(pid)?;
        Ok(regs.rip)
    }

    fn set_instruction_pointer(&self, pid: Pid, addr: Address) -> Result<()> {
        let mut regs = debug::read_regs(pid)?;
        regs.rip = addr;
        debug::write_regs(pid, regs)
    }

    /// amd64 always has a working hardware single-step (`PTRACE_SINGLESTEP`),
    /// so the coordinator should use it directly; `add_cb` is never called.
    fn sw_singlestep(
        &self,
        _pid: Pid,
        _add_cb: &mut dyn FnMut(Address) -> Result<()>,
    ) -> Result<SwSinglestepStatus> {
        Ok(SwSinglestepStatus::Hw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::tests::fork_test;

    #[test]
    fn instruction_pointer_round_trips() {
        fork_test(|pid| {
            let arch = X86_64::new();
            let ip = arch.get_instruction_pointer(pid).expect("get ip");
            arch.set_instruction_pointer(pid, ip).expect("set ip");
            assert_eq!(arch.get_instruction_pointer(pid).expect("get ip again"), ip);
        });
    }
}
