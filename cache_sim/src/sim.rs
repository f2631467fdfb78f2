use anyhow::Result;

use crate::{
    memory::Addr,
    program::{Access, Program},
};

#[cfg(feature = "stat")]
use crate::stat::{AddStats, Stats};

/// What the access driver talks to: either the raw memory or a cache in front of it.
pub trait Port {
    fn read(&mut self, addr: Addr) -> Result<u8>;
    /// stores the low byte of `value`.
    fn write(&mut self, addr: Addr, value: u32) -> Result<()>;
    /// cost of the most recently completed access.
    fn last_access_latency(&self) -> u64;
}

impl<P: Port + ?Sized> Port for &mut P {
    fn read(&mut self, addr: Addr) -> Result<u8> {
        (**self).read(addr)
    }
    fn write(&mut self, addr: Addr, value: u32) -> Result<()> {
        (**self).write(addr, value)
    }
    fn last_access_latency(&self) -> u64 {
        (**self).last_access_latency()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub total_time: u64,
    pub accesses: usize,
    /// values returned by the reads, in program order.
    pub reads: Vec<u8>,
}

/// Issues accesses one at a time, in order, and accumulates their latency.
pub struct Simulator<P> {
    port: P,
    time: u64,
    accesses: usize,
}

impl<P: Port> Simulator<P> {
    pub fn new(port: P) -> Self {
        Self {
            port,
            time: 0,
            accesses: 0,
        }
    }
    pub fn time(&self) -> u64 {
        self.time
    }
    pub fn port(&self) -> &P {
        &self.port
    }
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }
    pub fn into_inner(self) -> P {
        self.port
    }
    /// value read, if `access` is a read.
    pub fn step(&mut self, access: Access) -> Result<Option<u8>> {
        let r = match access {
            Access::Read(addr) => {
                let data = self.port.read(addr)?;
                log::info!("read {addr} -> {data:#04x}");
                Some(data)
            }
            Access::Write(addr, v) => {
                log::info!("write {addr} {v:#x}");
                self.port.write(addr, v)?;
                None
            }
        };
        self.time += self.port.last_access_latency();
        self.accesses += 1;
        Ok(r)
    }
    /// Runs the whole program; the first failing access aborts the run.
    pub fn run(&mut self, program: &Program) -> Result<RunReport> {
        let start = self.time;
        let mut reads = Vec::new();
        for &access in program.accesses() {
            if let Some(v) = self.step(access)? {
                reads.push(v);
            }
        }
        let report = RunReport {
            total_time: self.time - start,
            accesses: program.len(),
            reads,
        };
        log::info!("total time = {}", report.total_time);
        Ok(report)
    }
}

#[cfg(feature = "stat")]
impl<P: AddStats> AddStats for Simulator<P> {
    fn add_stats(&self, buf: &mut Stats) {
        buf.push(Box::new(stat::SimStat {
            accesses: self.accesses,
            time: self.time,
        }));
        self.port.add_stats(buf);
    }
}

#[cfg(feature = "stat")]
impl<P: AddStats> Simulator<P> {
    pub fn collect_stat(&self) -> Stats {
        let mut ss = Stats::default();
        self.add_stats(&mut ss);
        ss
    }
}

#[cfg(feature = "stat")]
mod stat {
    use std::fmt;

    use crate::stat::*;

    pub struct SimStat {
        pub accesses: usize,
        pub time: u64,
    }

    impl Stat for SimStat {
        fn view(&self, _: usize) -> Box<dyn StatView + '_> {
            Box::new(self)
        }
    }

    impl StatView for &'_ SimStat {
        fn header(&self) -> &'static str {
            "simulator stat"
        }
        fn width(&self) -> usize {
            33
        }
    }

    impl fmt::Display for &'_ SimStat {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let accesses = format!("#{}", self.accesses);
            writeln!(f, "  accesses total: {accesses:>10}")?;
            writeln!(f, "  time total: {:>14}", self.time)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::FillPolicy, memory::Memory};

    #[test]
    fn test_uncached_reference_run() {
        let mut mem = Memory::with_bus_width(10, FillPolicy::Random { seed: 3 }).unwrap();
        let expected = mem.as_slice()[..6].to_vec();
        let mut sim = Simulator::new(&mut mem);
        let report = sim.run(&Program::reference()).unwrap();
        assert_eq!(60, report.total_time);
        assert_eq!(6, report.accesses);
        assert_eq!(expected, report.reads);
    }
    /// tokens after `label` on the first stat row starting with it.
    #[cfg(feature = "stat")]
    fn row<'a>(view: &'a str, label: &str) -> Vec<&'a str> {
        view.lines()
            .map(str::trim_start)
            .find_map(|l| l.strip_prefix(label))
            .map(|rest| rest.split_whitespace().collect())
            .unwrap_or_default()
    }
    #[cfg(feature = "stat")]
    #[test]
    fn test_reference_run_stat() {
        use std::{cell::RefCell, rc::Rc};

        use crate::cache::DirectMappedCache;

        let mem = Memory::with_bus_width(10, FillPolicy::Zero).unwrap();
        let mut cache = DirectMappedCache::new(10, 8, 4).unwrap();
        cache.bind(Rc::new(RefCell::new(mem))).unwrap();
        let mut sim = Simulator::new(cache);
        sim.run(&Program::reference()).unwrap();

        let view = sim.collect_stat().view(80).to_string();
        assert_eq!(vec!["#6"], row(&view, "accesses total:"));
        assert_eq!(vec!["24"], row(&view, "time total:"));
        assert_eq!(vec!["4"], row(&view, "hit:"));
        assert_eq!(vec!["2"], row(&view, "miss:"));
        assert_eq!(vec!["2"], row(&view, "fill:"));
        assert_eq!(vec!["0"], row(&view, "write:"));
        assert_eq!(vec!["66.67", "%"], row(&view, "hit rate:"));
        // two bursts of four bytes
        assert_eq!(vec!["8", "/", "0"], row(&view, "bytes:"));
    }
    #[test]
    fn test_failing_access_aborts() {
        let mut mem = Memory::new(4, FillPolicy::Zero).unwrap();
        let p = Program::new(vec![
            Access::Write(Addr::new(0), 9),
            Access::Read(Addr::new(4)),
            Access::Write(Addr::new(1), 9),
        ]);
        let mut sim = Simulator::new(&mut mem);
        assert!(sim.run(&p).is_err());
        assert_eq!(10, sim.time());
        assert_eq!(&[9, 0, 0, 0], mem.as_slice());
    }
}
