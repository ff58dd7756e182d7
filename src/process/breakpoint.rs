//! Breakpoint subsystem (spec.md §4.3). Grounded on the teacher's
//! word-granular `ptrace` write loop in `register/writer.rs::write_data`,
//! specialized here to a fixed-size trap-instruction patch instead of an
//! arbitrary-length buffer.

use crate::arch::Arch;
use crate::debug::{self, Address};
use crate::errors::{Error, ErrorKind, Result};
use crate::tracer::Tracer;
use nix::unistd::Pid;
use std::collections::HashMap;
use std::mem::size_of;

/// Passed to a breakpoint's callbacks on a hit; gives them just enough of
/// the tracer to install a new handler (the usual thing `on_continue` does)
/// without handing out the whole `Tracer` API surface.
pub struct HitContext<'a> {
    pub tracer: &'a mut Tracer,
    pub leader: Pid,
    pub hitter: Pid,
    pub addr: Address,
}

impl<'a> HitContext<'a> {
    /// Installs the stopping coordinator on `leader` to re-arm the
    /// breakpoint at `addr` that `hitter` just tripped over. This is the
    /// default `on_continue` behavior spec.md §4.3 describes.
    pub fn start_stopping_episode(&mut self) {
        crate::process::handler::stopping::install(
            self.tracer,
            self.leader,
            self.hitter,
            self.addr,
        );
    }
}

/// Callback protocol for a breakpoint (spec.md §4.3, §4.4). PLT symbols
/// override `on_continue` to redirect the IP (RESOLVED) or single-step the
/// dynamic linker to completion (UNRESOLVED) instead of the default
/// re-arm-via-stopping-coordinator behavior.
pub trait BreakpointCallbacks: std::fmt::Debug {
    fn on_hit(&mut self, _ctx: &mut HitContext) {}

    fn on_continue(&mut self, ctx: &mut HitContext) {
        ctx.start_stopping_episode();
    }

    fn on_insert(&mut self, _leader: Pid, _addr: Address) {}
    fn on_retract(&mut self, _leader: Pid, _addr: Address) {}
}

/// The default callback set used by a plain, non-PLT breakpoint.
#[derive(Debug, Default)]
pub struct DefaultCallbacks;

impl BreakpointCallbacks for DefaultCallbacks {}

#[derive(Debug)]
pub struct Breakpoint {
    pub address: Address,
    /// Read exactly once at first enable (invariant (b), spec.md §3).
    pub original_bytes: Vec<u8>,
    /// Zero means logically disabled; invariant (a) only holds while > 0.
    pub enable_count: u32,
    /// Whether the trap bytes are currently installed in the tracee. Flips
    /// transiently during a stopping episode without touching
    /// `enable_count` (spec.md §4.3 enable/disable).
    pub enabled: bool,
    pub symbol: Option<String>,
    pub callbacks: Box<dyn BreakpointCallbacks>,
}

/// Per-leader dictionary from tracee address to breakpoint record.
#[derive(Default)]
pub struct BreakpointMap {
    by_address: HashMap<Address, Breakpoint>,
}

impl BreakpointMap {
    pub fn new() -> Self {
        BreakpointMap {
            by_address: HashMap::new(),
        }
    }

    pub fn get(&self, addr: Address) -> Option<&Breakpoint> {
        self.by_address.get(&addr)
    }

    pub fn get_mut(&mut self, addr: Address) -> Option<&mut Breakpoint> {
        self.by_address.get_mut(&addr)
    }

    pub fn contains(&self, addr: Address) -> bool {
        self.by_address.contains_key(&addr)
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.by_address.keys().copied().collect()
    }

    /// If a breakpoint already exists at `addr`, bumps its enable count.
    /// Otherwise reads the original bytes (exactly once, per invariant
    /// (b)), writes the trap instruction, and installs a new record.
    pub fn insert_breakpoint(
        &mut self,
        arch: &dyn Arch,
        leader_pid: Pid,
        addr: Address,
        symbol: Option<String>,
        callbacks: Box<dyn BreakpointCallbacks>,
    ) -> Result<()> {
        if let Some(bp) = self.by_address.get_mut(&addr) {
            bp.enable_count += 1;
            return Ok(());
        }

        let trap = arch.trap_instruction_bytes();
        let mut original_bytes = vec![0u8; trap.len()];
        debug::read_memory(leader_pid, addr, &mut original_bytes)?;
        write_patch(leader_pid, addr, trap)?;

        let mut bp = Breakpoint {
            address: addr,
            original_bytes,
            enable_count: 1,
            enabled: true,
            symbol,
            callbacks,
        };
        bp.callbacks.on_insert(leader_pid, addr);
        self.by_address.insert(addr, bp);
        Ok(())
    }

    /// Writes the trap bytes without touching `enable_count`. Idempotent
    /// with respect to the `enabled` flag.
    pub fn enable_breakpoint(&mut self, arch: &dyn Arch, leader_pid: Pid, addr: Address) -> Result<()> {
        let trap = arch.trap_instruction_bytes().to_vec();
        let bp = self
            .by_address
            .get_mut(&addr)
            .ok_or_else(|| Error::new(ErrorKind::NoSuchBreakpoint))?;
        if bp.enabled {
            return Ok(());
        }
        write_patch(leader_pid, addr, &trap)?;
        bp.enabled = true;
        Ok(())
    }

    /// Restores the original bytes without touching `enable_count`.
    /// Idempotent with respect to the `enabled` flag.
    pub fn disable_breakpoint(&mut self, leader_pid: Pid, addr: Address) -> Result<()> {
        let bp = self
            .by_address
            .get_mut(&addr)
            .ok_or_else(|| Error::new(ErrorKind::NoSuchBreakpoint))?;
        if !bp.enabled {
            return Ok(());
        }
        write_patch(leader_pid, addr, &bp.original_bytes.clone())?;
        bp.enabled = false;
        Ok(())
    }

    /// Decrements the enable count; at zero, restores the original bytes
    /// and removes the record, invoking `on_retract`.
    pub fn delete_breakpoint(&mut self, leader_pid: Pid, addr: Address) -> Result<()> {
        let exhausted = {
            let bp = self
                .by_address
                .get_mut(&addr)
                .ok_or_else(|| Error::new(ErrorKind::NoSuchBreakpoint))?;
            bp.enable_count = bp.enable_count.saturating_sub(1);
            bp.enable_count == 0
        };

        if !exhausted {
            return Ok(());
        }

        if let Some(bp) = self.by_address.get(&addr) {
            if bp.enabled {
                let original = bp.original_bytes.clone();
                write_patch(leader_pid, addr, &original)?;
            }
        }
        if let Some(mut bp) = self.by_address.remove(&addr) {
            bp.callbacks.on_retract(leader_pid, addr);
        }
        Ok(())
    }
}

/// Word-granular patch: merges `bytes` into the tracee's memory at `addr`
/// one machine word at a time, preserving whatever surrounding bytes
/// aren't part of the patch, exactly as ptrace requires (spec.md §4.1).
fn write_patch(pid: Pid, addr: Address, bytes: &[u8]) -> Result<()> {
    let word_size = size_of::<i64>();
    let mut offset = 0;
    while offset < bytes.len() {
        let word_addr = addr + offset as Address;
        let existing = debug::read_word(pid, word_addr)?;
        let mut word_bytes = existing.to_ne_bytes();
        let n = std::cmp::min(word_size, bytes.len() - offset);
        word_bytes[..n].copy_from_slice(&bytes[offset..offset + n]);
        debug::write_word(pid, word_addr, i64::from_ne_bytes(word_bytes))?;
        offset += n;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::x86_64::X86_64;
    use crate::arch::Arch;
    use crate::utils::tests::fork_test;

    #[test]
    fn insert_then_delete_restores_original_bytes() {
        fork_test(|pid| {
            let arch = X86_64::new();
            let ip = arch.get_instruction_pointer(pid).expect("get ip");
            let mut original = vec![0u8; arch.trap_instruction_bytes().len()];
            debug::read_memory(pid, ip, &mut original).expect("read original");

            let mut map = BreakpointMap::new();
            map.insert_breakpoint(&arch, pid, ip, None, Box::new(DefaultCallbacks))
                .expect("insert breakpoint");

            let mut patched = vec![0u8; original.len()];
            debug::read_memory(pid, ip, &mut patched).expect("read patched");
            assert_eq!(patched, arch.trap_instruction_bytes());

            map.delete_breakpoint(pid, ip).expect("delete breakpoint");
            assert!(!map.contains(ip));

            let mut restored = vec![0u8; original.len()];
            debug::read_memory(pid, ip, &mut restored).expect("read restored");
            assert_eq!(restored, original);
        });
    }

    #[test]
    fn enable_disable_is_a_no_op_on_enable_count() {
        fork_test(|pid| {
            let arch = X86_64::new();
            let ip = arch.get_instruction_pointer(pid).expect("get ip");

            let mut map = BreakpointMap::new();
            map.insert_breakpoint(&arch, pid, ip, None, Box::new(DefaultCallbacks))
                .expect("insert breakpoint");

            map.disable_breakpoint(pid, ip).expect("disable");
            map.enable_breakpoint(&arch, pid, ip).expect("enable");

            assert_eq!(map.get(ip).unwrap().enable_count, 1);
            map.delete_breakpoint(pid, ip).expect("delete");
        });
    }

    #[test]
    fn repeated_insert_bumps_enable_count_instead_of_rewriting() {
        fork_test(|pid| {
            let arch = X86_64::new();
            let ip = arch.get_instruction_pointer(pid).expect("get ip");

            let mut map = BreakpointMap::new();
            map.insert_breakpoint(&arch, pid, ip, None, Box::new(DefaultCallbacks))
                .expect("first insert");
            map.insert_breakpoint(&arch, pid, ip, None, Box::new(DefaultCallbacks))
                .expect("second insert");

            assert_eq!(map.get(ip).unwrap().enable_count, 2);

            map.delete_breakpoint(pid, ip).expect("first delete");
            assert!(map.contains(ip));
            map.delete_breakpoint(pid, ip).expect("second delete");
            assert!(!map.contains(ip));
        });
    }
}
