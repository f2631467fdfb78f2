use std::io::{stdin, stdout, Write};

use anyhow::Result;
use cache_sim::{
    cache::{DirectMappedCache, TraceKind},
    memory::Addr,
    program::Access,
    sim::Simulator,
};

#[cfg(feature = "stat")]
use terminal_size::terminal_size;

peg::parser!(grammar command() for str {
    rule usize() -> usize
        = n:$(quiet!{['0'..='9']+}) {? n.parse().map_err(|_| "usize") }
        / expected!("usize")
    rule radix() -> usize
        = quiet!{"0" ['x' | 'X']} n:$(quiet!{['0'..='9'|'a'..='f'|'A'..='F']+}) {?
            usize::from_str_radix(n, 16).map_err(|_| "hexadecimal")
        }
        / usize()
    rule addr() -> Addr
        = r:radix() { Addr::new(r) }
    rule value() -> u32
        = r:radix() {? u32::try_from(r).map_err(|_| "32-bit value") }
    rule read() = "read" / "r"
    rule write() = "write" / "w"
    rule mem() = "memory" / "mem"
    rule access() -> Access
        = write() __ addr:addr() __ v:value() { Access::Write(addr, v) }
        / read() __ addr:addr() { Access::Read(addr) }
    rule trace_kind() -> TraceKind
        = "all" { TraceKind::Hit | TraceKind::Miss | TraceKind::Write }
        / "off" { TraceKind::none() }
        / "hit" "s"? { TraceKind::Hit }
        / "miss" "es"? { TraceKind::Miss }
        / "write" "s"? { TraceKind::Write }
    rule show_kind() -> ShowKind
        = "lines" { ShowKind::AllLines }
        / "line" __ n:radix() { ShowKind::Line(n) }
        / mem() __ addr:addr() { ShowKind::Memory(addr) }
        / "stat" "s"? { ShowKind::Stat }
        / ("geometry" / "geo") { ShowKind::Geometry }
        / "time" { ShowKind::Time }
    pub(crate) rule parse_command() -> Command
        = _ a:access() _ { Command::Access(a) }
        / _ "show" __ s:show_kind() _ { Command::Show(s) }
        / _ "trace" __ k:trace_kind() _ { Command::Trace(k) }
        / _ ("exit" / "quit") _ { Command::Exit }
        / expected!("command")

    rule ws() = quiet!{[' ' | '\t' | '\r' | '\n']}
        / expected!("whitespace")
    rule _() = ws()*
    rule __() = ws()+
});

pub(crate) enum Command {
    Access(Access),
    Show(ShowKind),
    Trace(TraceKind),
    Exit,
}

pub(crate) enum ShowKind {
    Line(usize),
    AllLines,
    Memory(Addr),
    Stat,
    Geometry,
    Time,
}

#[cfg(feature = "stat")]
fn get_terminal_width() -> Option<u16> {
    terminal_size().map(|(w, _)| w.0.saturating_sub(20))
}

fn show(sim: &Simulator<DirectMappedCache>, kind: ShowKind) {
    let cache = sim.port();
    match kind {
        ShowKind::Line(index) => match cache.line(index) {
            Some(l) => println!("[{index:>3}] {l}"),
            None => println!("no line {index}: cache has {}", cache.geometry().num_lines),
        },
        ShowKind::AllLines => {
            for (index, l) in cache.lines().iter().enumerate() {
                println!("[{index:>3}] {l}");
            }
        }
        ShowKind::Memory(addr) => {
            let Some(store) = cache.store() else {
                println!("no backing store bound");
                return;
            };
            match store.borrow().as_slice().get(addr.inner()) {
                Some(v) => println!("M[{addr}] == {v:#04x}"),
                None => println!("{addr} is out of range"),
            }
        }
        #[cfg(feature = "stat")]
        ShowKind::Stat => {
            let width = get_terminal_width().unwrap_or(60) as usize;
            println!("{}", sim.collect_stat().view(width));
        }
        #[cfg(not(feature = "stat"))]
        ShowKind::Stat => {
            println!("try compile with `--features stat`");
        }
        ShowKind::Geometry => println!("{}", cache.geometry()),
        ShowKind::Time => println!("total time: {}", sim.time()),
    }
}

/// Runs one access and prints its outcome. The latency is only reported
/// for accesses that completed.
fn issue(
    sim: &mut Simulator<DirectMappedCache>,
    access: Access,
    out: &mut impl Write,
) -> Result<()> {
    match sim.step(access) {
        Ok(Some(v)) => {
            writeln!(out, "{v:#04x}")?;
            writeln!(out, "took {}", sim.port().last_access_latency())?;
        }
        Ok(None) => writeln!(out, "took {}", sim.port().last_access_latency())?,
        Err(e) => writeln!(out, "{e}")?,
    }
    for event in sim.port_mut().drain_trace() {
        writeln!(out, "  {event}")?;
    }
    Ok(())
}

pub fn execute_interactive(sim: &mut Simulator<DirectMappedCache>) -> Result<()> {
    println!("entering interactive.");
    loop {
        print!("t={} > ", sim.time());
        stdout().flush()?;
        let mut str = String::new();
        if stdin().read_line(&mut str)? == 0 {
            break;
        }
        if str.trim().is_empty() {
            continue;
        }
        let parsed = match command::parse_command(&str) {
            Ok(p) => p,
            Err(e) => {
                println!("parse error: expected {}", e.expected);
                continue;
            }
        };
        match parsed {
            Command::Access(access) => issue(sim, access, &mut stdout())?,
            Command::Show(kind) => show(sim, kind),
            Command::Trace(kind) => {
                sim.port_mut().set_trace(kind);
                println!("trace updated");
            }
            Command::Exit => break,
        }
    }
    println!("exiting interactive.");
    Ok(())
}
