//! Simulation parameters

use std::fmt;

use anyhow::Result;
use serde::Deserialize;
use thiserror::Error;

use crate::{bin::exact_log2, memory::MEMORY_LATENCY};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("{what} must be a power of two, but got {value}")]
    NotPowerOfTwo { what: &'static str, value: usize },
    #[error("{offset_bits} offset bits and {index_bits} index bits do not fit in a {bus_width}-bit bus")]
    AddressFieldsExceedBus {
        offset_bits: u32,
        index_bits: u32,
        bus_width: u32,
    },
    #[error("bus width {bus_width} is not addressable on this host")]
    BusTooWide { bus_width: u32 },
    #[error("backing store must hold at least one byte")]
    ZeroCapacity,
}

/// Initial contents of the backing store.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FillPolicy {
    #[default]
    Zero,
    Random {
        seed: u64,
    },
}

impl fmt::Display for FillPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FillPolicy::Zero => write!(f, "zero-filled"),
            FillPolicy::Random { seed } => write!(f, "random, seed {seed}"),
        }
    }
}

/// Per-operation cost reported by the cache.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct Latencies {
    pub hit: u64,
    pub miss: u64,
    pub write: u64,
}

impl Default for Latencies {
    fn default() -> Self {
        Self {
            hit: 1,
            miss: 10,
            write: 200,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    pub bus_width: u32,
    /// addressable bytes; overrides `bus_width` when given.
    pub capacity: Option<usize>,
    pub num_lines: usize,
    pub block_size: usize,
    pub latency: Latencies,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            bus_width: 10,
            capacity: None,
            num_lines: 8,
            block_size: 4,
            latency: Latencies::default(),
        }
    }
}

impl CacheConfig {
    pub fn resolved_bus_width(&self) -> Result<u32, ConfigurationError> {
        match self.capacity {
            Some(capacity) => bus_width_for(capacity),
            None => Ok(self.bus_width),
        }
    }
}

/// width of a bus addressing exactly `capacity` bytes.
pub(crate) fn bus_width_for(capacity: usize) -> Result<u32, ConfigurationError> {
    exact_log2(capacity).ok_or(ConfigurationError::NotPowerOfTwo {
        what: "capacity",
        value: capacity,
    })
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct MemoryConfig {
    /// bytes; `None` covers the whole bus address space.
    pub capacity: Option<usize>,
    pub fill: FillPolicy,
    pub latency: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            capacity: None,
            fill: FillPolicy::default(),
            latency: MEMORY_LATENCY,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(default)]
pub struct SimConfig {
    pub cache: CacheConfig,
    pub memory: MemoryConfig,
}

impl SimConfig {
    pub fn deser(file: impl std::io::Read) -> Result<Self> {
        Ok(serde_json::from_reader(file)?)
    }
}
