//! Process memory observation for eviction and OOM reporting.
//!
//! The sweeper and the compilation service only need two numbers: how much
//! heap the process is using and how much it may use. Both are read through
//! the [`MemoryGauge`] trait so tests can drive memory-pressure paths
//! deterministically.

use std::sync::atomic::{AtomicU64, Ordering};

const DEFAULT_MAX_HEAP_MB: u64 = 4096;

pub trait MemoryGauge: Send + Sync {
    fn used_bytes(&self) -> u64;
    fn max_bytes(&self) -> u64;

    fn used_mb(&self) -> u64 {
        self.used_bytes() / (1024 * 1024)
    }

    fn max_mb(&self) -> u64 {
        self.max_bytes() / (1024 * 1024)
    }

    /// True when used heap has crossed `threshold` (a fraction in (0, 1]) of
    /// the configured maximum.
    fn under_pressure(&self, threshold: f64) -> bool {
        let max = self.max_bytes();
        max > 0 && self.used_bytes() as f64 >= threshold * max as f64
    }
}

/// Gauge backed by the operating system's view of the current process.
///
/// On Linux the resident set size is read from `/proc/self/statm`; elsewhere
/// usage reads as zero and pressure eviction never triggers.
#[derive(Debug)]
pub struct ProcessMemoryGauge {
    max_bytes: u64,
}

impl ProcessMemoryGauge {
    pub fn new(max_heap_mb: Option<u64>) -> Self {
        Self {
            max_bytes: max_heap_mb.unwrap_or(DEFAULT_MAX_HEAP_MB) * 1024 * 1024,
        }
    }

    #[cfg(target_os = "linux")]
    fn resident_bytes() -> u64 {
        let page_size = 4096;
        std::fs::read_to_string("/proc/self/statm")
            .ok()
            .and_then(|statm| {
                statm
                    .split_whitespace()
                    .nth(1)
                    .and_then(|pages| pages.parse::<u64>().ok())
            })
            .map(|pages| pages * page_size)
            .unwrap_or(0)
    }

    #[cfg(not(target_os = "linux"))]
    fn resident_bytes() -> u64 {
        0
    }
}

impl MemoryGauge for ProcessMemoryGauge {
    fn used_bytes(&self) -> u64 {
        Self::resident_bytes()
    }

    fn max_bytes(&self) -> u64 {
        self.max_bytes
    }
}

/// Fixed gauge for tests: usage is set explicitly.
#[derive(Debug)]
pub struct FixedMemoryGauge {
    used: AtomicU64,
    max: u64,
}

impl FixedMemoryGauge {
    pub fn new(used_bytes: u64, max_bytes: u64) -> Self {
        Self {
            used: AtomicU64::new(used_bytes),
            max: max_bytes,
        }
    }

    pub fn set_used(&self, used_bytes: u64) {
        self.used.store(used_bytes, Ordering::Relaxed);
    }
}

impl MemoryGauge for FixedMemoryGauge {
    fn used_bytes(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    fn max_bytes(&self) -> u64 {
        self.max
    }
}
