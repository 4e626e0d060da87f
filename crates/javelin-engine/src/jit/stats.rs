//! Compile statistics
//!
//! Counters the driver updates under the compiler lock; snapshots are for
//! diagnostics and tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Monotonic compile counters.
#[derive(Debug, Default)]
pub struct CompileStats {
    methods_compiled: AtomicU64,
    bytecode_bytes: AtomicU64,
    mcode_bytes: AtomicU64,
    dseg_bytes: AtomicU64,
    compile_nanos: AtomicU64,
}

/// A point-in-time view of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub methods_compiled: u64,
    pub bytecode_bytes: u64,
    pub mcode_bytes: u64,
    pub dseg_bytes: u64,
    pub compile_nanos: u64,
}

impl CompileStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_compile(
        &self,
        bytecode: usize,
        mcode: usize,
        dseg: usize,
        elapsed: Duration,
    ) {
        self.methods_compiled.fetch_add(1, Ordering::Relaxed);
        self.bytecode_bytes
            .fetch_add(bytecode as u64, Ordering::Relaxed);
        self.mcode_bytes.fetch_add(mcode as u64, Ordering::Relaxed);
        self.dseg_bytes.fetch_add(dseg as u64, Ordering::Relaxed);
        self.compile_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            methods_compiled: self.methods_compiled.load(Ordering::Relaxed),
            bytecode_bytes: self.bytecode_bytes.load(Ordering::Relaxed),
            mcode_bytes: self.mcode_bytes.load(Ordering::Relaxed),
            dseg_bytes: self.dseg_bytes.load(Ordering::Relaxed),
            compile_nanos: self.compile_nanos.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_snapshot() {
        let stats = CompileStats::new();
        stats.record_compile(10, 100, 24, Duration::from_micros(5));
        stats.record_compile(4, 40, 8, Duration::from_micros(3));
        let s = stats.snapshot();
        assert_eq!(s.methods_compiled, 2);
        assert_eq!(s.bytecode_bytes, 14);
        assert_eq!(s.mcode_bytes, 140);
        assert_eq!(s.dseg_bytes, 32);
        assert!(s.compile_nanos >= 8_000);
    }
}
