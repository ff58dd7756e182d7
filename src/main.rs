extern crate clap;
extern crate libc;
extern crate nix;

mod arch;
mod cli;
mod debug;
mod errors;
mod process;
mod tracer;
mod utils;

use crate::arch::x86_64::X86_64;
use crate::process::ProcessState;
use crate::tracer::Tracer;
use nix::sys::ptrace;
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::{execvp, fork, ForkResult, Pid};
use std::ffi::CString;
use std::process::exit;

fn main() {
    env_logger::init();

    if let Err(e) = tracer::install_sigint_handler() {
        eprintln!("failed to install SIGINT handler: {}", e);
        exit(1);
    }

    let config = cli::parse_config();
    let mut tracer = Tracer::new(Box::new(X86_64::new()));

    if config.list_only {
        println!("ltrace-core: PLT symbol listing requires an ELF front-end (out of scope)");
        return;
    }

    if !config.attach_pids.is_empty() {
        for pid in &config.attach_pids {
            if let Err(e) = debug::attach(*pid) {
                eprintln!("failed to attach to {}: {}", pid, e);
                exit(1);
            }
            wait_for_initial_stop(*pid);
            tracer.add_leader(*pid, true);
        }
    } else if !config.command.is_empty() {
        match spawn_traced(&config.command) {
            Ok(pid) => {
                wait_for_initial_stop(pid);
                tracer.add_leader(pid, false);
            }
            Err(e) => {
                eprintln!("failed to launch {:?}: {}", config.command, e);
                exit(1);
            }
        }
    } else {
        eprintln!("usage: ltrace-core [-p PID]... | -- COMMAND [ARGS]...");
        exit(1);
    }

    for pid in tracer.directory.leader_pids() {
        if let Some(proc) = tracer.directory.get_mut(pid) {
            proc.state = ProcessState::BeingCreated;
        }
        tracer.continue_process(pid);
    }

    tracer.run();
}

/// Blocks until `pid`'s attach-stop (`PTRACE_ATTACH`'s `SIGSTOP`) or
/// exec-stop (`PTRACE_TRACEME` + `execvp`'s `SIGTRAP`) has actually been
/// observed, so the first `continue_process` below never races a tracee
/// that hasn't stopped yet.
fn wait_for_initial_stop(pid: Pid) {
    if let Err(e) = waitpid(pid, Some(WaitPidFlag::__WALL)) {
        eprintln!("failed waiting for {} to stop: {}", pid, e);
        exit(1);
    }
}

/// Forks and execs `command`, with the child requesting `PTRACE_TRACEME`
/// before the exec so the resulting `SIGTRAP` is delivered to the tracer
/// (spec.md §4.1 "attach").
fn spawn_traced(command: &[String]) -> nix::Result<Pid> {
    match unsafe { fork() }? {
        ForkResult::Parent { child } => Ok(child),
        ForkResult::Child => {
            ptrace::traceme().expect("traceme");
            let program = CString::new(command[0].as_str()).expect("program name");
            let args: Vec<CString> = command
                .iter()
                .map(|s| CString::new(s.as_str()).expect("arg"))
                .collect();
            let err = execvp(&program, &args).expect_err("execvp only returns on failure");
            panic!("execvp failed: {}", err);
        }
    }
}
