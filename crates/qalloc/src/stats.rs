//! Pool statistics.

use std::fmt;

/// Counters kept by a pool across its lifetime.
///
/// All counters are mutated under the pool lock, so plain integers suffice;
/// [`crate::Pool::stats`] returns a copy taken under the same lock.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Requests served, from the bump cursor or the free list.
    pub allocations: u64,
    /// Regions returned by callers.
    pub deallocations: u64,
    /// Allocations served by reusing a free-list block.
    pub reused_blocks: u64,
    /// Subpools appended by growth.
    pub subpools_added: u64,
    /// Completed sweep runs.
    pub gc_runs: u64,
    /// Bytes returned to the host allocator by sweeps.
    pub bytes_reclaimed: u64,
    /// High-water mark of `bytes_used`.
    pub peak_bytes_used: u64,
}

impl PoolStats {
    pub(crate) fn record_peak(&mut self, bytes_used: usize) {
        self.peak_bytes_used = self.peak_bytes_used.max(bytes_used as u64);
    }
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "allocs: {} (reused: {}), deallocs: {}, subpools added: {}, \
             gc runs: {} ({} bytes reclaimed), peak usage: {} bytes",
            self.allocations,
            self.reused_blocks,
            self.deallocations,
            self.subpools_added,
            self.gc_runs,
            self.bytes_reclaimed,
            self.peak_bytes_used,
        )
    }
}
