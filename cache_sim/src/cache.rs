use std::{cell::RefCell, fmt, rc::Rc};

use bitmask_enum::bitmask;
use thiserror::Error;

use crate::{
    bin::{bit_range, bit_range_lower, exact_log2, extract},
    config::{bus_width_for, CacheConfig, ConfigurationError, Latencies},
    line::{CacheLine, LineByteIndexError},
    memory::{Addr, BackingStore, Memory, MemoryAccessError},
    sim::Port,
};

#[cfg(feature = "stat")]
use crate::stat::{AddStats, Stats};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("cache is not bound to a backing store")]
    Unbound,
    #[error("cache is already bound to a backing store")]
    AlreadyBound,
    #[error(transparent)]
    MemoryAccess(#[from] MemoryAccessError),
    #[error(transparent)]
    LineByteIndex(#[from] LineByteIndexError),
}

type Result<T, E = CacheError> = std::result::Result<T, E>;

/// Field widths and masks of an address, computed once per cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub bus_width: u32,
    pub num_lines: usize,
    pub block_size: usize,
    pub offset_bits: u32,
    pub index_bits: u32,
    pub tag_bits: u32,
    pub offset_mask: usize,
    pub index_mask: usize,
    pub tag_mask: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decomposed {
    pub tag: usize,
    pub index: usize,
    pub offset: usize,
}

impl Geometry {
    pub fn new(
        bus_width: u32,
        num_lines: usize,
        block_size: usize,
    ) -> Result<Self, ConfigurationError> {
        if bus_width >= usize::BITS {
            return Err(ConfigurationError::BusTooWide { bus_width });
        }
        let index_bits = exact_log2(num_lines).ok_or(ConfigurationError::NotPowerOfTwo {
            what: "number of lines",
            value: num_lines,
        })?;
        let offset_bits = exact_log2(block_size).ok_or(ConfigurationError::NotPowerOfTwo {
            what: "block size",
            value: block_size,
        })?;
        if offset_bits + index_bits > bus_width {
            return Err(ConfigurationError::AddressFieldsExceedBus {
                offset_bits,
                index_bits,
                bus_width,
            });
        }
        let tag_bits = bus_width - offset_bits - index_bits;
        Ok(Self {
            bus_width,
            num_lines,
            block_size,
            offset_bits,
            index_bits,
            tag_bits,
            offset_mask: bit_range_lower(offset_bits),
            index_mask: bit_range(offset_bits, index_bits),
            tag_mask: bit_range(offset_bits + index_bits, tag_bits),
        })
    }
    /// number of addresses reachable through the bus.
    pub fn address_space(&self) -> usize {
        1 << self.bus_width
    }
    pub fn decompose(&self, addr: Addr) -> Decomposed {
        let a = addr.inner();
        Decomposed {
            tag: extract(a, self.offset_bits + self.index_bits, self.tag_bits),
            index: extract(a, self.offset_bits, self.index_bits),
            offset: a & self.offset_mask,
        }
    }
    pub fn compose(&self, d: Decomposed) -> Addr {
        Addr::new(
            (d.tag << (self.offset_bits + self.index_bits))
                | (d.index << self.offset_bits)
                | d.offset,
        )
    }
    /// first address of the block containing `addr`.
    pub fn block_base(&self, addr: Addr) -> Addr {
        Addr::new(addr.inner() & !self.offset_mask)
    }
    fn check(&self, addr: Addr) -> Result<(), MemoryAccessError> {
        if addr.inner() >= self.address_space() {
            return Err(MemoryAccessError::OutOfBounds {
                accessed_address: addr,
                capacity: self.address_space(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-bit bus, {} lines x {} bytes (tag {} / index {} / offset {} bits)",
            self.bus_width,
            self.num_lines,
            self.block_size,
            self.tag_bits,
            self.index_bits,
            self.offset_bits
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Hit,
    Miss,
    Write,
}

impl fmt::Display for AccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessKind::Hit => write!(f, "hit"),
            AccessKind::Miss => write!(f, "miss"),
            AccessKind::Write => write!(f, "write"),
        }
    }
}

#[bitmask(u8)]
pub enum TraceKind {
    Hit,
    Miss,
    Write,
}

impl From<AccessKind> for TraceKind {
    fn from(k: AccessKind) -> Self {
        match k {
            AccessKind::Hit => TraceKind::Hit,
            AccessKind::Miss => TraceKind::Miss,
            AccessKind::Write => TraceKind::Write,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessEvent {
    pub kind: AccessKind,
    pub address: Addr,
    pub index: usize,
    pub tag: usize,
}

impl fmt::Display for AccessEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cache {} at {} (index {}, tag {:#x})",
            self.kind, self.address, self.index, self.tag
        )
    }
}

/// Direct-mapped, write-through cache in front of a [`BackingStore`].
///
/// Writes never consult the tag: the byte at the addressed index and offset is
/// overwritten even when the line holds another block (or nothing at all), and
/// the line keeps its validity and tag. A later read hitting that line sees the
/// written byte.
pub struct DirectMappedCache<S = Memory> {
    geometry: Geometry,
    latency: Latencies,
    lines: Vec<CacheLine>,
    store: Option<Rc<RefCell<S>>>,
    last_access_latency: u64,
    trace_kind: TraceKind,
    trace: Vec<AccessEvent>,
    #[cfg(feature = "stat")]
    stat: stat::CacheStat,
}

impl<S: BackingStore> DirectMappedCache<S> {
    pub fn new(
        bus_width: u32,
        num_lines: usize,
        block_size: usize,
    ) -> Result<Self, ConfigurationError> {
        let geometry = Geometry::new(bus_width, num_lines, block_size)?;
        log::debug!("cache geometry: {geometry}");
        Ok(Self {
            geometry,
            latency: Latencies::default(),
            lines: (0..num_lines).map(|_| CacheLine::new(block_size)).collect(),
            store: None,
            last_access_latency: 0,
            trace_kind: TraceKind::none(),
            trace: Vec::new(),
            #[cfg(feature = "stat")]
            stat: Default::default(),
        })
    }
    /// cache for an address space of `capacity` bytes, which must be a power of two.
    pub fn with_capacity(
        capacity: usize,
        num_lines: usize,
        block_size: usize,
    ) -> Result<Self, ConfigurationError> {
        Self::new(bus_width_for(capacity)?, num_lines, block_size)
    }
    pub fn from_config(config: &CacheConfig) -> Result<Self, ConfigurationError> {
        let cache = match config.capacity {
            Some(capacity) => Self::with_capacity(capacity, config.num_lines, config.block_size)?,
            None => Self::new(config.bus_width, config.num_lines, config.block_size)?,
        };
        Ok(cache.with_latencies(config.latency))
    }
    pub fn with_latencies(mut self, latency: Latencies) -> Self {
        self.latency = latency;
        self
    }
    /// associates the backing store. Allowed once.
    pub fn bind(&mut self, store: Rc<RefCell<S>>) -> Result<()> {
        if self.store.is_some() {
            return Err(CacheError::AlreadyBound);
        }
        self.store = Some(store);
        Ok(())
    }
    pub fn store(&self) -> Option<&Rc<RefCell<S>>> {
        self.store.as_ref()
    }
    fn bound_store(&self) -> Result<Rc<RefCell<S>>> {
        self.store.clone().ok_or(CacheError::Unbound)
    }
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }
    pub fn latencies(&self) -> &Latencies {
        &self.latency
    }
    pub fn last_access_latency(&self) -> u64 {
        self.last_access_latency
    }
    pub fn line(&self, index: usize) -> Option<&CacheLine> {
        self.lines.get(index)
    }
    pub fn lines(&self) -> &[CacheLine] {
        &self.lines
    }
    /// records events of the given kinds until changed.
    pub fn set_trace(&mut self, kind: TraceKind) {
        self.trace_kind = kind;
    }
    pub fn drain_trace(&mut self) -> Vec<AccessEvent> {
        std::mem::take(&mut self.trace)
    }
    fn emit(&mut self, event: AccessEvent) {
        log::debug!("{event}");
        #[cfg(feature = "stat")]
        self.stat.on_access(event.kind);
        if self.trace_kind.contains(TraceKind::from(event.kind)) {
            self.trace.push(event);
        }
    }

    pub fn read(&mut self, addr: Addr) -> Result<u8> {
        let store = self.bound_store()?;
        self.geometry.check(addr)?;
        let Decomposed { tag, index, offset } = self.geometry.decompose(addr);
        let kind = if self.lines[index].holds(tag) {
            self.last_access_latency = self.latency.hit;
            AccessKind::Hit
        } else {
            self.fill(&store, addr, index, tag)?;
            AccessKind::Miss
        };
        self.emit(AccessEvent {
            kind,
            address: addr,
            index,
            tag,
        });
        Ok(self.lines[index].read(offset)?)
    }

    /// Loads the aligned block containing `addr` into line `index`. The line is
    /// untouched unless every byte of the block could be read.
    fn fill(&mut self, store: &RefCell<S>, addr: Addr, index: usize, tag: usize) -> Result<()> {
        let base = self.geometry.block_base(addr);
        log::debug!("reloading line {index} from {base}");
        // counted even if the burst fails
        #[cfg(feature = "stat")]
        self.stat.on_fill();
        let block = {
            let store = store.borrow();
            (0..self.geometry.block_size)
                .map(|byte_id| -> Result<u8, MemoryAccessError> {
                    let a = base.disp(byte_id);
                    let b = BackingStore::read(&*store, a)?;
                    log::trace!("burst {a} -> {b:#04x}");
                    Ok(b)
                })
                .collect::<Result<Vec<u8>, MemoryAccessError>>()?
        };
        self.lines[index].fill(tag, &block)?;
        self.last_access_latency = self.latency.miss;
        Ok(())
    }

    /// Write-through: the store is written first so a rejected address leaves
    /// the lines as they were. `value` is truncated to its low byte.
    pub fn write(&mut self, addr: Addr, value: u32) -> Result<()> {
        let store = self.bound_store()?;
        self.geometry.check(addr)?;
        let byte = (value & 0xff) as u8;
        let Decomposed { tag, index, offset } = self.geometry.decompose(addr);
        BackingStore::write(&mut *store.borrow_mut(), addr, byte)?;
        self.lines[index].write(offset, byte)?;
        self.last_access_latency = self.latency.write;
        self.emit(AccessEvent {
            kind: AccessKind::Write,
            address: addr,
            index,
            tag,
        });
        Ok(())
    }
}

impl<S: BackingStore> Port for DirectMappedCache<S> {
    fn read(&mut self, addr: Addr) -> anyhow::Result<u8> {
        Ok(DirectMappedCache::read(self, addr)?)
    }
    fn write(&mut self, addr: Addr, value: u32) -> anyhow::Result<()> {
        Ok(DirectMappedCache::write(self, addr, value)?)
    }
    fn last_access_latency(&self) -> u64 {
        self.last_access_latency
    }
}

#[cfg(feature = "stat")]
impl<S: BackingStore + AddStats> AddStats for DirectMappedCache<S> {
    fn add_stats(&self, buf: &mut Stats) {
        buf.push(Box::new(self.stat));
        if let Some(store) = &self.store {
            store.borrow().add_stats(buf);
        }
    }
}

#[cfg(feature = "stat")]
mod stat {
    use std::fmt;

    use super::AccessKind;
    use crate::stat::*;

    #[derive(Clone, Copy, Default)]
    pub struct CacheStat {
        hit: usize,
        miss: usize,
        write: usize,
        fill: usize,
    }

    impl CacheStat {
        pub fn on_access(&mut self, kind: AccessKind) {
            match kind {
                AccessKind::Hit => self.hit += 1,
                AccessKind::Miss => self.miss += 1,
                AccessKind::Write => self.write += 1,
            }
        }
        pub fn on_fill(&mut self) {
            self.fill += 1;
        }
        fn hit_rate(&self) -> f64 {
            let reads = self.hit + self.miss;
            if reads == 0 {
                0.0
            } else {
                self.hit as f64 / reads as f64 * 100.0
            }
        }
    }

    impl Stat for CacheStat {
        fn view(&self, _: usize) -> Box<dyn StatView + '_> {
            Box::new(self)
        }
    }

    impl StatView for &'_ CacheStat {
        fn header(&self) -> &'static str {
            "cache stat"
        }
        fn width(&self) -> usize {
            30
        }
    }

    impl fmt::Display for &'_ CacheStat {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            writeln!(f, "  hit:   {:>12}", self.hit)?;
            writeln!(f, "  miss:  {:>12}", self.miss)?;
            writeln!(f, "  fill:  {:>12}", self.fill)?;
            writeln!(f, "  write: {:>12}", self.write)?;
            let rate = format!("{:.2} %", self.hit_rate());
            writeln!(f, "  hit rate: {rate:>9}")
        }
    }

    #[cfg(test)]
    mod tests {
        use std::{cell::RefCell, rc::Rc};

        use crate::{
            cache::DirectMappedCache,
            config::FillPolicy,
            memory::{Addr, Memory},
            program::{Access, Program},
            sim::Simulator,
            stat::Stat,
        };

        fn run(mem: Memory, program: &Program) -> Simulator<DirectMappedCache> {
            let mut cache = DirectMappedCache::new(10, 8, 4).unwrap();
            cache.bind(Rc::new(RefCell::new(mem))).unwrap();
            let mut sim = Simulator::new(cache);
            let _ = sim.run(program);
            sim
        }

        #[test]
        fn test_reference_counts() {
            let mem = Memory::with_bus_width(10, FillPolicy::Zero).unwrap();
            let sim = run(mem, &Program::reference());
            let s = sim.port().stat;
            assert_eq!((4, 2, 2, 0), (s.hit, s.miss, s.fill, s.write));
            assert!(s.view(80).to_string().contains("hit rate:   66.67 %"));
        }
        #[test]
        fn test_failed_fill_is_counted() {
            // 0x104 is on the bus but past the end of the store
            let mem = Memory::new(0x100, FillPolicy::Zero).unwrap();
            let p = Program::new(vec![
                Access::Read(Addr::new(0)),
                Access::Read(Addr::new(0x104)),
            ]);
            let sim = run(mem, &p);
            let s = sim.port().stat;
            assert_eq!((0, 1, 2), (s.hit, s.miss, s.fill));
        }
        #[test]
        fn test_no_reads_has_zero_hit_rate() {
            let mem = Memory::with_bus_width(10, FillPolicy::Zero).unwrap();
            let sim = run(mem, &Program::new(vec![Access::Write(Addr::new(3), 1)]));
            let s = sim.port().stat;
            assert_eq!((0, 0, 0, 1), (s.hit, s.miss, s.fill, s.write));
            assert_eq!(0.0, s.hit_rate());
            assert!(s.view(80).to_string().contains("hit rate:    0.00 %"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FillPolicy;

    fn reference_cache() -> (DirectMappedCache, Rc<RefCell<Memory>>) {
        let mem = Rc::new(RefCell::new(
            Memory::with_bus_width(10, FillPolicy::Random { seed: 1 }).unwrap(),
        ));
        let mut cache = DirectMappedCache::new(10, 8, 4).unwrap();
        cache.bind(mem.clone()).unwrap();
        (cache, mem)
    }

    #[test]
    fn test_geometry() {
        let g = Geometry::new(10, 8, 4).unwrap();
        assert_eq!((2, 3, 5), (g.offset_bits, g.index_bits, g.tag_bits));
        assert_eq!(0b00_0000_0011, g.offset_mask);
        assert_eq!(0b00_0001_1100, g.index_mask);
        assert_eq!(0b11_1110_0000, g.tag_mask);
        assert_eq!(0, g.offset_mask & g.index_mask);
        assert_eq!(0, g.index_mask & g.tag_mask);
        assert_eq!(
            g.address_space() - 1,
            g.offset_mask | g.index_mask | g.tag_mask
        );
        let d = g.decompose(Addr::new(0b10110_101_11));
        assert_eq!(
            Decomposed {
                tag: 0b10110,
                index: 0b101,
                offset: 0b11
            },
            d
        );
        assert_eq!(Addr::new(0b10110_101_11), g.compose(d));
        assert_eq!(Addr::new(0b10110_101_00), g.block_base(Addr::new(0b10110_101_11)));
    }
    #[test]
    fn test_geometry_errors() {
        assert_eq!(
            Err(ConfigurationError::NotPowerOfTwo {
                what: "number of lines",
                value: 6
            }),
            Geometry::new(10, 6, 4)
        );
        assert_eq!(
            Err(ConfigurationError::NotPowerOfTwo {
                what: "block size",
                value: 0
            }),
            Geometry::new(10, 8, 0)
        );
        assert_eq!(
            Err(ConfigurationError::AddressFieldsExceedBus {
                offset_bits: 3,
                index_bits: 3,
                bus_width: 5
            }),
            Geometry::new(5, 8, 8)
        );
        let g = Geometry::new(6, 8, 8).unwrap();
        assert_eq!(0, g.tag_bits);
        assert_eq!(0, g.decompose(Addr::new(63)).tag);
    }
    #[test]
    fn test_with_capacity() {
        let cache = DirectMappedCache::<Memory>::with_capacity(1024, 8, 4).unwrap();
        assert_eq!(&Geometry::new(10, 8, 4).unwrap(), cache.geometry());
        assert_eq!(
            Err(ConfigurationError::NotPowerOfTwo {
                what: "capacity",
                value: 1000
            }),
            DirectMappedCache::<Memory>::with_capacity(1000, 8, 4).map(|c| *c.geometry())
        );
        assert!(matches!(
            DirectMappedCache::<Memory>::with_capacity(0, 8, 4),
            Err(ConfigurationError::NotPowerOfTwo { value: 0, .. })
        ));
        // block and lines still have to fit in the address space
        assert!(matches!(
            DirectMappedCache::<Memory>::with_capacity(16, 8, 4),
            Err(ConfigurationError::AddressFieldsExceedBus { .. })
        ));
    }
    #[test]
    fn test_from_config_with_capacity() {
        let config = CacheConfig {
            bus_width: 4,
            capacity: Some(256),
            latency: Latencies {
                hit: 2,
                ..Default::default()
            },
            ..Default::default()
        };
        let cache = DirectMappedCache::<Memory>::from_config(&config).unwrap();
        assert_eq!(8, cache.geometry().bus_width);
        assert_eq!(2, cache.latencies().hit);
    }
    #[test]
    fn test_unbound() {
        let mut cache = DirectMappedCache::<Memory>::new(10, 8, 4).unwrap();
        assert_eq!(Err(CacheError::Unbound), cache.read(Addr::new(0)));
        assert_eq!(Err(CacheError::Unbound), cache.write(Addr::new(0), 1));
    }
    #[test]
    fn test_rebind_fails() {
        let (mut cache, mem) = reference_cache();
        assert_eq!(Err(CacheError::AlreadyBound), cache.bind(mem));
    }
    #[test]
    fn test_miss_then_hit() {
        let (mut cache, mem) = reference_cache();
        cache.set_trace(TraceKind::Hit | TraceKind::Miss);
        let expected = mem.borrow().as_slice()[0x2a];
        assert_eq!(expected, cache.read(Addr::new(0x2a)).unwrap());
        assert_eq!(10, cache.last_access_latency());
        assert_eq!(expected, cache.read(Addr::new(0x2a)).unwrap());
        assert_eq!(1, cache.last_access_latency());
        let trace = cache.drain_trace();
        assert_eq!(
            vec![AccessKind::Miss, AccessKind::Hit],
            trace.iter().map(|e| e.kind).collect::<Vec<_>>()
        );
        assert_eq!(Addr::new(0x2a), trace[0].address);
        assert_eq!(2, trace[0].index);
        assert_eq!(1, trace[0].tag);
        assert!(cache.drain_trace().is_empty());
    }
    #[test]
    fn test_write_does_not_check_tag() {
        let (mut cache, mem) = reference_cache();
        cache.read(Addr::new(0x20)).unwrap();
        assert_eq!(Some(1), cache.line(0).unwrap().tag());
        // same index and offset, different tag
        cache.write(Addr::new(0x40), 0x1ab).unwrap();
        assert_eq!(200, cache.last_access_latency());
        assert_eq!(0xab, mem.borrow().as_slice()[0x40]);
        let line = cache.line(0).unwrap();
        assert_eq!(Some(1), line.tag());
        assert_eq!(0xab, line.read(0).unwrap());
        // the stale byte is served for the resident block
        assert_eq!(0xab, cache.read(Addr::new(0x20)).unwrap());
        assert_eq!(1, cache.last_access_latency());
    }
    #[test]
    fn test_write_into_invalid_line() {
        let (mut cache, _) = reference_cache();
        cache.write(Addr::new(0x05), 0x42).unwrap();
        let line = cache.line(1).unwrap();
        assert!(!line.is_valid());
        assert_eq!(0x42, line.read(1).unwrap());
    }
    #[test]
    fn test_trace_filter() {
        let (mut cache, _) = reference_cache();
        cache.set_trace(TraceKind::Write);
        cache.read(Addr::new(0)).unwrap();
        cache.write(Addr::new(0), 3).unwrap();
        let trace = cache.drain_trace();
        assert_eq!(1, trace.len());
        assert_eq!(AccessKind::Write, trace[0].kind);
    }
    #[test]
    fn test_address_beyond_bus() {
        let (mut cache, _) = reference_cache();
        assert!(matches!(
            cache.read(Addr::new(1 << 10)),
            Err(CacheError::MemoryAccess(MemoryAccessError::OutOfBounds { .. }))
        ));
        assert!(cache.lines().iter().all(|l| !l.is_valid()));
    }
}
