use std::fmt::Display;

#[cfg(feature = "stat")]
use std::cell::RefCell;

use rand::{rngs::StdRng, Rng, SeedableRng};
use thiserror::Error;

use crate::{
    config::{ConfigurationError, FillPolicy, MemoryConfig},
    sim::Port,
};

#[cfg(feature = "stat")]
use crate::stat::{AddStats, Stats};

/// access latency of the backing store, in simulated time units.
pub const MEMORY_LATENCY: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Addr(usize);

impl Addr {
    pub fn new(v: usize) -> Self {
        Self(v)
    }
    pub fn inner(self) -> usize {
        self.0
    }
    pub fn disp(&self, amount: usize) -> Self {
        Self(self.0 + amount)
    }
}

impl From<usize> for Addr {
    fn from(v: usize) -> Self {
        Self(v)
    }
}

impl Display for Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryAccessError {
    #[error("address {accessed_address} out of range for memory of {capacity} bytes")]
    OutOfBounds {
        accessed_address: Addr,
        capacity: usize,
    },
}

pub type Result<T> = std::result::Result<T, MemoryAccessError>;

/// Byte-addressable device sitting behind a cache.
pub trait BackingStore {
    fn read(&self, addr: Addr) -> Result<u8>;
    fn write(&mut self, addr: Addr, byte: u8) -> Result<()>;
}

macro_rules! bounds_check {
    ($addr:ident < $self:ident) => {
        if $addr.inner() >= $self.inner.len() {
            return Err(MemoryAccessError::OutOfBounds {
                accessed_address: $addr,
                capacity: $self.inner.len(),
            });
        }
    };
}

/// Flat byte array with a fixed per-access latency.
pub struct Memory {
    inner: Vec<u8>,
    latency: u64,
    #[cfg(feature = "stat")]
    stat_mem: RefCell<stat::MemoryStat>,
}

impl Memory {
    pub fn new(capacity: usize, fill: FillPolicy) -> std::result::Result<Self, ConfigurationError> {
        if capacity == 0 {
            return Err(ConfigurationError::ZeroCapacity);
        }
        let inner = match fill {
            FillPolicy::Zero => vec![0; capacity],
            FillPolicy::Random { seed } => {
                let mut rng = StdRng::seed_from_u64(seed);
                (0..capacity).map(|_| rng.gen::<u8>()).collect()
            }
        };
        log::debug!("memory of {capacity} bytes initialized ({fill})");
        Ok(Self {
            inner,
            latency: MEMORY_LATENCY,
            #[cfg(feature = "stat")]
            stat_mem: RefCell::default(),
        })
    }
    /// memory covering the whole address space of a `bus_width`-bit bus.
    pub fn with_bus_width(
        bus_width: u32,
        fill: FillPolicy,
    ) -> std::result::Result<Self, ConfigurationError> {
        if bus_width >= usize::BITS {
            return Err(ConfigurationError::BusTooWide { bus_width });
        }
        Self::new(1 << bus_width, fill)
    }
    pub fn from_config(
        config: &MemoryConfig,
        bus_width: u32,
    ) -> std::result::Result<Self, ConfigurationError> {
        let mut m = match config.capacity {
            Some(capacity) => Self::new(capacity, config.fill)?,
            None => Self::with_bus_width(bus_width, config.fill)?,
        };
        m.latency = config.latency;
        Ok(m)
    }
    pub fn capacity(&self) -> usize {
        self.inner.len()
    }
    pub fn latency(&self) -> u64 {
        self.latency
    }
    pub fn get(&self, addr: Addr) -> Result<u8> {
        bounds_check!(addr < self);
        #[cfg(feature = "stat")]
        self.stat_mem.borrow_mut().on_read();
        Ok(self.inner[addr.inner()])
    }
    pub fn set(&mut self, addr: Addr, byte: u8) -> Result<()> {
        bounds_check!(addr < self);
        #[cfg(feature = "stat")]
        self.stat_mem.borrow_mut().on_write();
        self.inner[addr.inner()] = byte;
        Ok(())
    }
    /// contents without touching the access counters.
    pub fn as_slice(&self) -> &[u8] {
        &self.inner
    }
}

impl BackingStore for Memory {
    fn read(&self, addr: Addr) -> Result<u8> {
        self.get(addr)
    }
    fn write(&mut self, addr: Addr, byte: u8) -> Result<()> {
        self.set(addr, byte)
    }
}

/// Uncached access: every read and write costs the memory latency.
impl Port for Memory {
    fn read(&mut self, addr: Addr) -> anyhow::Result<u8> {
        Ok(self.get(addr)?)
    }
    fn write(&mut self, addr: Addr, value: u32) -> anyhow::Result<()> {
        Ok(self.set(addr, (value & 0xff) as u8)?)
    }
    fn last_access_latency(&self) -> u64 {
        self.latency
    }
}

#[cfg(feature = "stat")]
impl AddStats for Memory {
    fn add_stats(&self, buf: &mut Stats) {
        buf.push(Box::new(self.stat_mem.borrow().to_owned()));
    }
}

#[cfg(feature = "stat")]
mod stat {
    use std::fmt;

    use crate::stat::*;

    #[derive(Clone, Copy, Default)]
    pub struct MemoryStat {
        read: usize,
        write: usize,
    }

    impl MemoryStat {
        pub fn on_read(&mut self) {
            self.read += 1;
        }
        pub fn on_write(&mut self) {
            self.write += 1;
        }
    }

    impl Stat for MemoryStat {
        fn view(&self, _: usize) -> Box<dyn StatView + '_> {
            Box::new(MemoryStatView::new(self))
        }
    }

    pub struct MemoryStatView<'a> {
        stat: &'a MemoryStat,
    }

    impl<'a> MemoryStatView<'a> {
        pub fn new(stat: &'a MemoryStat) -> Self {
            Self { stat }
        }
    }

    impl StatView for MemoryStatView<'_> {
        fn header(&self) -> &'static str {
            "access count of backing store (format: `# of read / # of write`)"
        }
        fn width(&self) -> usize {
            40
        }
    }

    impl fmt::Display for MemoryStatView<'_> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let r = self.stat.read;
            let w = self.stat.write;
            writeln!(f, "  {:>13}:{r:>11} /{w:>11}", "bytes")
        }
    }
}
