//! Command-line surface (spec.md §6 "CLI surface (delegated to driver)").
//! Grounded on the teacher's `cli.rs` `App`/`Arg` builder style, trimmed to
//! this crate's attach list and symbol-filter flags.

use clap::{App, Arg};
use nix::unistd::Pid;

pub struct Config {
    /// Pids to attach to via the `-p`/`--pid` attach list (spec.md §6).
    pub attach_pids: Vec<Pid>,
    /// Breakpoint expression(s) supplied via `-e`/`--expr`.
    pub expr: Vec<String>,
    /// Whether `-l`/`--list` was given: list resolvable symbols and exit
    /// instead of tracing.
    pub list_only: bool,
    /// A command to spawn and trace, if no `-p` attach list was given.
    pub command: Vec<String>,
}

pub fn parse_config() -> Config {
    let matches = App::new("ltrace-core")
        .about("userspace call tracer")
        .arg(
            Arg::with_name("pid")
                .short("p")
                .long("pid")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1)
                .help("attach to an already-running process"),
        )
        .arg(
            Arg::with_name("expr")
                .short("e")
                .long("expr")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1)
                .help("trace only symbols matching this expression"),
        )
        .arg(
            Arg::with_name("list")
                .short("l")
                .long("list")
                .help("list resolvable PLT symbols and exit"),
        )
        .arg(
            Arg::with_name("command")
                .multiple(true)
                .help("command to launch and trace"),
        )
        .get_matches();

    let attach_pids = matches
        .values_of("pid")
        .map(|vs| {
            vs.filter_map(|v| v.parse::<i32>().ok().map(Pid::from_raw))
                .collect()
        })
        .unwrap_or_default();

    let expr = matches
        .values_of("expr")
        .map(|vs| vs.map(str::to_string).collect())
        .unwrap_or_default();

    let command = matches
        .values_of("command")
        .map(|vs| vs.map(str::to_string).collect())
        .unwrap_or_default();

    Config {
        attach_pids,
        expr,
        list_only: matches.is_present("list"),
        command,
    }
}
