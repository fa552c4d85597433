//! Worker-pool sizing from host resources
//!
//! `HostResources::snapshot()` reads RAM and CPU once; `PoolTuning::for_host`
//! turns a snapshot into a batch concurrency. The heuristic is pure so it
//! can be tested against made-up hosts.

use sysinfo::{MemoryRefreshKind, RefreshKind, System};

const GIB: u64 = 1 << 30;

/// Upper bound on concurrently running batches.
const MAX_CONCURRENCY: usize = 16;

/// Below this much RAM, batches run one at a time.
const SMALL_HOST_BYTES: u64 = 2 * GIB;

/// Share of RAM in use above which concurrency is halved.
const HIGH_PRESSURE: f64 = 0.85;

/// What the pool heuristic needs to know about the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostResources {
    pub memory_bytes: u64,
    pub free_memory_bytes: u64,
    pub cpus: usize,
}

impl HostResources {
    pub fn snapshot() -> Self {
        let sys = System::new_with_specifics(RefreshKind::new().with_memory(MemoryRefreshKind::new().with_ram()));
        Self {
            memory_bytes: sys.total_memory(),
            free_memory_bytes: sys.available_memory(),
            cpus: std::thread::available_parallelism().map_or(1, |n| n.get()),
        }
    }

    /// Fraction of RAM in use, 1.0 when unknown.
    pub fn pressure(&self) -> f64 {
        match self.memory_bytes {
            0 => 1.0,
            total => (1.0 - self.free_memory_bytes as f64 / total as f64).clamp(0.0, 1.0),
        }
    }
}

/// Pool size chosen for a host.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolTuning {
    pub concurrency: usize,
    pub memory_pressure: f64,
}

impl PoolTuning {
    /// One batch per CPU (at most `MAX_CONCURRENCY`), a single batch on
    /// small hosts, halved under memory pressure.
    pub fn for_host(host: &HostResources) -> Self {
        let memory_pressure = host.pressure();
        let mut concurrency = if host.memory_bytes < SMALL_HOST_BYTES {
            1
        } else {
            host.cpus.clamp(1, MAX_CONCURRENCY)
        };
        if memory_pressure > HIGH_PRESSURE {
            concurrency = (concurrency / 2).max(1);
        }
        Self {
            concurrency,
            memory_pressure,
        }
    }

    /// Read the running host and size the pool for it.
    pub fn detect() -> Self {
        Self::for_host(&HostResources::snapshot())
    }
}
