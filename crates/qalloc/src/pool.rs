//! The pool: subpool vector, free list and the allocation algorithms.
//!
//! A pool owns an ordered vector of [`Subpool`]s, a sorted free list and a
//! running total of all live subpool bytes. Fresh bytes come from the bump
//! cursor of the *current* (last appended) subpool; deallocated regions are
//! recorded in the free list and reused first-fit with a trailing split.
//! When the cursor cannot satisfy a request, a larger subpool is appended
//! and the old cursor's slack is published as an unmerged free block.
//!
//! # Safety
//!
//! Pool state lives in an `UnsafeCell` arbitrated by a re-entrant owner
//! lock ([`crate::lock::OwnerLock`]):
//! - every public entry point claims ownership before touching the state;
//! - a claim grants exclusive access: no two threads hold it at once, and a
//!   nested claim on the same thread reuses the outer one;
//! - each claim scope creates exactly one `&mut PoolState`, and no method
//!   of this module re-enters another public entry point while that
//!   reference is live, so no aliasing `&mut` can exist;
//! - buffers are freed exactly once (sweep tombstones or the vector drop).

use std::cell::UnsafeCell;
use std::cmp;
use std::fmt::Write as _;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{debug, trace};

use crate::error::{AllocError, AllocResult};
use crate::freelist::{CanMerge, FreeBlock, FreeList};
use crate::header::{self, BlockHeader, HEADER_SIZE};
use crate::lock::OwnerLock;
use crate::stats::PoolStats;
use crate::subpool::{LiveSubpool, Subpool};
use crate::utils::thread_ordinal;

/// Construction parameters for a [`Pool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Size of the first subpool in bytes. Must be non-zero.
    pub initial_bytes: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { initial_bytes: 4096 }
    }
}

/// A user-space memory pool serving allocations out of bump-carved subpools.
///
/// All entry points take `&self`; the pool arbitrates between threads with a
/// re-entrant owner lock and is safe to share by reference.
///
/// # Examples
///
/// ```
/// use qalloc::Pool;
///
/// let pool = Pool::new(256)?;
/// let p = pool.allocate(64)?;
/// pool.deallocate(p, 64);
/// assert_eq!(pool.bytes_used(), 0);
/// # Ok::<(), qalloc::AllocError>(())
/// ```
pub struct Pool {
    lock: OwnerLock,
    state: UnsafeCell<PoolState>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool").finish_non_exhaustive()
    }
}

// SAFETY: all access to the UnsafeCell contents is serialised by the owner
// lock (see the module-level safety notes); the raw buffer pointers inside
// are exclusively owned by this pool.
unsafe impl Send for Pool {}
// SAFETY: as above; `&Pool` only exposes entry points that claim the lock.
unsafe impl Sync for Pool {}

struct PoolState {
    /// Ordered, never-shrinking vector of subpools. Indices are stable for
    /// the pool's lifetime; released slots stay as tombstones.
    subpools: Vec<Subpool>,
    /// Index of the current subpool. Atomic as a documentary handoff after
    /// growth; all access happens under the pool lock today.
    cur: AtomicUsize,
    free_blocks: FreeList,
    /// Sum of all non-released subpool sizes.
    total: usize,
    stats: PoolStats,
}

impl Pool {
    /// Create a pool whose first subpool holds `initial_bytes`.
    pub fn new(initial_bytes: usize) -> AllocResult<Self> {
        Self::with_config(PoolConfig { initial_bytes })
    }

    /// Create a pool from a [`PoolConfig`].
    pub fn with_config(config: PoolConfig) -> AllocResult<Self> {
        if config.initial_bytes == 0 {
            return Err(AllocError::invalid_size(0, "pool size must be non-zero"));
        }
        let first = LiveSubpool::allocate(config.initial_bytes)?;
        debug!(bytes = config.initial_bytes, "pool constructed");
        Ok(Self {
            lock: OwnerLock::new(),
            state: UnsafeCell::new(PoolState {
                subpools: vec![Subpool::Live(first)],
                cur: AtomicUsize::new(0),
                free_blocks: FreeList::default(),
                total: config.initial_bytes,
                stats: PoolStats::default(),
            }),
        })
    }

    /// Claim the pool and run `f` on its state.
    fn with_state<R>(&self, f: impl FnOnce(&mut PoolState) -> R) -> R {
        let _claim = self.lock.acquire();
        // SAFETY: the claim grants this thread exclusive access to the state
        // and `f` is the only borrower within this scope (module safety
        // notes).
        let state = unsafe { &mut *self.state.get() };
        f(state)
    }

    /// Allocate `n_bytes` (> 0) of raw storage.
    ///
    /// Returns the host allocator's failure as [`AllocError::OutOfMemory`].
    pub fn allocate(&self, n_bytes: usize) -> AllocResult<NonNull<u8>> {
        self.with_state(|state| state.allocate(n_bytes))
    }

    /// Return `n_bytes` at `p` to the pool.
    ///
    /// `p` must have been produced by [`allocate`](Self::allocate) on this
    /// pool and `n_bytes` must match the original request; violations are
    /// programmer errors caught by debug assertions.
    pub fn deallocate(&self, p: NonNull<u8>, n_bytes: usize) {
        self.with_state(|state| {
            let address = p.as_ptr() as usize;
            debug_assert!(n_bytes > 0, "deallocation size must be non-zero");
            debug_assert!(state.is_valid(address), "pointer outside every subpool");
            state.stats.deallocations += 1;
            state.free_blocks.insert(FreeBlock { n_bytes, address }, CanMerge::Yes);
            trace!(
                bytes = n_bytes,
                address,
                thread = thread_ordinal(),
                "deallocated"
            );
        });
    }

    /// Allocate `n_bytes` prefixed by an introspection header for `T`.
    ///
    /// The effective allocation is `n_bytes + HEADER_SIZE`; the returned
    /// pointer is just past the header.
    pub fn detailed_allocate<T>(&self, n_bytes: usize) -> AllocResult<NonNull<u8>> {
        self.with_state(|state| {
            let total = n_bytes.checked_add(HEADER_SIZE).ok_or_else(|| {
                AllocError::invalid_size(n_bytes, "allocation size overflows with the block header")
            })?;
            let head = state.allocate(total)?;
            let block = BlockHeader {
                type_token: header::tag_of::<T>(),
                subpool_index: state.cur_index(),
            };
            // SAFETY: `head` starts a region of `total >= HEADER_SIZE` bytes
            // exclusively owned by this allocation.
            unsafe {
                header::write_header(head, block);
                Ok(NonNull::new_unchecked(head.as_ptr().add(HEADER_SIZE)))
            }
        })
    }

    /// Counterpart of [`detailed_allocate`](Self::detailed_allocate).
    ///
    /// In debug builds the stored header is checked against `T` and against
    /// the subpool table before the full region (header included) is
    /// returned to the free list.
    pub fn detailed_deallocate<T>(&self, p: NonNull<u8>, n_bytes: usize) {
        self.with_state(|state| {
            debug_assert!(n_bytes > 0, "deallocation size must be non-zero");
            // SAFETY: `p` was produced by detailed_allocate, so the header
            // sits HEADER_SIZE bytes before it within the same region.
            let head = unsafe { NonNull::new_unchecked(p.as_ptr().sub(HEADER_SIZE)) };
            #[cfg(debug_assertions)]
            {
                // SAFETY: as above; the header bytes are readable.
                let stored = unsafe { header::read_header(head) };
                debug_assert_eq!(
                    stored.type_token,
                    header::tag_of::<T>(),
                    "type mismatch on deallocation"
                );
                debug_assert!(
                    stored.subpool_index < state.subpools.len(),
                    "header names an unknown subpool"
                );
            }
            let address = head.as_ptr() as usize;
            debug_assert!(state.is_valid(address), "pointer outside every subpool");
            state.stats.deallocations += 1;
            state
                .free_blocks
                .insert(FreeBlock { n_bytes: n_bytes + HEADER_SIZE, address }, CanMerge::Yes);
            trace!(
                bytes = n_bytes + HEADER_SIZE,
                address,
                thread = thread_ordinal(),
                "deallocated (detailed)"
            );
        });
    }

    /// Sweep phase: release every non-current subpool whose bytes are fully
    /// present as one coalesced free block.
    ///
    /// Returns the number of bytes given back to the host allocator.
    /// Surviving subpool indices are never invalidated; released slots
    /// become tombstones.
    pub fn gc(&self) -> usize {
        self.with_state(PoolState::gc)
    }

    /// Bytes currently handed out to callers.
    pub fn bytes_used(&self) -> usize {
        self.with_state(|state| state.bytes_used())
    }

    /// Sum of all non-released subpool sizes.
    pub fn pool_size(&self) -> usize {
        self.with_state(|state| state.total)
    }

    /// Snapshot of the pool's lifetime counters.
    pub fn stats(&self) -> PoolStats {
        self.with_state(|state| state.stats)
    }

    /// Render diagnostic text: usage, subpools and deallocated blocks.
    ///
    /// With `usage_only`, only the usage line is produced.
    pub fn format_info(&self, usage_only: bool) -> String {
        self.with_state(|state| state.format_info(usage_only))
    }

    /// Print [`format_info`](Self::format_info) to standard output.
    pub fn print_info(&self, usage_only: bool) {
        println!("{}", self.format_info(usage_only));
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        // Buffers are freed by the subpool drops; this is just the exit log.
        let state = self.state.get_mut();
        debug!(
            total = state.total,
            stats = %state.stats,
            "pool destructed"
        );
    }
}

impl PoolState {
    #[inline]
    fn cur_index(&self) -> usize {
        self.cur.load(Ordering::Relaxed)
    }

    fn cur_live(&self) -> &LiveSubpool {
        match self.subpools[self.cur_index()].as_live() {
            Some(live) => live,
            // The sweep never releases the current subpool and growth always
            // points `cur` at a freshly appended live one.
            None => unreachable!("current subpool is never a tombstone"),
        }
    }

    fn allocate(&mut self, n_bytes: usize) -> AllocResult<NonNull<u8>> {
        debug_assert!(n_bytes > 0, "allocation size must be non-zero");

        if self.cur_live().can_advance(n_bytes) {
            // The cursor could serve the request, so the free list is worth
            // scanning: its blocks are assumed no larger than what the
            // cursor could hand out.
            if let Some(reused) = self.free_blocks.take_first_fit(n_bytes) {
                let mut address = reused.address;
                if reused.n_bytes > n_bytes {
                    // Hand out the trailing bytes and re-publish the leading
                    // remainder: the block header at the original start must
                    // survive for the sweep to recognise the subpool.
                    let leading = reused.n_bytes - n_bytes;
                    self.free_blocks
                        .insert(FreeBlock { n_bytes: leading, address }, CanMerge::Yes);
                    address += leading;
                }
                self.stats.allocations += 1;
                self.stats.reused_blocks += 1;
                self.note_usage();
                trace!(
                    bytes = n_bytes,
                    block_bytes = reused.n_bytes,
                    address,
                    thread = thread_ordinal(),
                    "reused free block"
                );
                return Ok(self.ptr_at(address));
            }
        } else {
            let cur_size = self.cur_live().size();
            let grow_to = cmp::max(n_bytes.saturating_mul(2), cur_size.saturating_mul(2));
            self.grow(grow_to)?;
        }

        let address = self.cur_live().advance(n_bytes);
        self.stats.allocations += 1;
        self.note_usage();
        trace!(
            bytes = n_bytes,
            address,
            subpool = self.cur_index(),
            thread = thread_ordinal(),
            "bump allocated"
        );
        Ok(self.cur_live().ptr_to(address))
    }

    /// Append a subpool of `n_bytes`, freezing the current one.
    ///
    /// Trailing bytes of the old current subpool are skipped and published
    /// as an unmerged free block before the handoff.
    fn grow(&mut self, n_bytes: usize) -> AllocResult<()> {
        // Obtain the buffer first so a host failure leaves the pool intact.
        let fresh = LiveSubpool::allocate(n_bytes)?;

        let (old_pos, slack) = self.cur_live().advance_to_end();
        if slack > 0 {
            debug!(
                subpool = self.cur_index(),
                bytes = slack,
                address = old_pos,
                "publishing end-of-subpool slack"
            );
            self.free_blocks
                .insert(FreeBlock { n_bytes: slack, address: old_pos }, CanMerge::No);
        }

        self.subpools.push(Subpool::Live(fresh));
        self.cur.store(self.subpools.len() - 1, Ordering::Relaxed);
        self.total += n_bytes;
        self.stats.subpools_added += 1;
        debug!(
            bytes = n_bytes,
            subpools = self.subpools.len(),
            total = self.total,
            thread = thread_ordinal(),
            "appended subpool"
        );
        Ok(())
    }

    fn gc(&mut self) -> usize {
        let mut reclaimed = 0usize;
        let cur = self.cur_index();
        let mut i = 0;
        while i < self.free_blocks.len() {
            let block = self.free_blocks.blocks()[i];
            // Too short to have ever carried a header.
            if block.n_bytes < HEADER_SIZE {
                i += 1;
                continue;
            }
            let Some(stored) = self.header_at(block.address) else {
                i += 1;
                continue;
            };
            // A header overwritten by a reuse split no longer names a
            // subpool the pool recognises; skip the entry and keep going.
            if stored.subpool_index >= self.subpools.len() || stored.subpool_index == cur {
                i += 1;
                continue;
            }
            let covers_whole = match self.subpools[stored.subpool_index].as_live() {
                Some(live) => {
                    live.begin_addr() == block.address && live.size() == block.n_bytes
                }
                None => false,
            };
            if !covers_whole {
                i += 1;
                continue;
            }

            debug!(
                subpool = stored.subpool_index,
                bytes = block.n_bytes,
                "sweep released subpool"
            );
            self.subpools[stored.subpool_index].release();
            self.total -= block.n_bytes;
            reclaimed += block.n_bytes;
            self.free_blocks.remove_at(i);
        }
        self.stats.gc_runs += 1;
        self.stats.bytes_reclaimed += reclaimed as u64;
        reclaimed
    }

    fn bytes_used(&self) -> usize {
        self.total - self.free_blocks.total_free_bytes() - self.cur_live().size_left()
    }

    fn note_usage(&mut self) {
        let used = self.bytes_used();
        self.stats.record_peak(used);
    }

    /// Whether `addr` lies inside some live subpool.
    fn is_valid(&self, addr: usize) -> bool {
        self.subpools
            .iter()
            .filter_map(Subpool::as_live)
            .any(|live| live.contains(addr))
    }

    /// Owning live subpool of `addr`, if any.
    fn owner_of(&self, addr: usize) -> Option<&LiveSubpool> {
        self.subpools
            .iter()
            .filter_map(Subpool::as_live)
            .find(|live| live.contains(addr))
    }

    /// Pointer to `addr` with the owning subpool's provenance.
    fn ptr_at(&self, addr: usize) -> NonNull<u8> {
        match self.owner_of(addr) {
            Some(live) => live.ptr_to(addr),
            None => unreachable!("address not owned by any live subpool"),
        }
    }

    /// Read the header stored at `addr`, when `addr` belongs to a live
    /// subpool with room for one.
    fn header_at(&self, addr: usize) -> Option<BlockHeader> {
        let live = self.owner_of(addr)?;
        if addr + HEADER_SIZE > live.end_addr() {
            return None;
        }
        // SAFETY: HEADER_SIZE readable bytes inside `live`; header fields
        // are plain integers, so stale or overwritten bytes read back as
        // garbage values, never as invalid ones.
        Some(unsafe { header::read_header(live.ptr_to(addr)) })
    }

    fn format_info(&self, usage_only: bool) -> String {
        let mut out = String::new();
        let used = self.bytes_used();
        out.push_str("Memory Pool:\n");
        let _ = write!(out, "  Usage: {used} of {} bytes", self.total);
        if self.total != 0 {
            let _ = write!(out, " ({}%)", used * 100 / self.total);
        }
        out.push('\n');
        if usage_only {
            return out;
        }

        out.push_str("  Subpools:\n");
        for (i, sub) in self.subpools.iter().enumerate() {
            match sub.as_live() {
                None => {
                    let _ = writeln!(out, "    {}: released by gc", i + 1);
                }
                Some(live) => {
                    let _ = writeln!(
                        out,
                        "    {}: {:#x} ~ {:#x} ({} bytes)",
                        i + 1,
                        live.begin_addr(),
                        live.end_addr(),
                        live.size()
                    );
                    let _ = writeln!(out, "      Position @ {:#x}", live.pos());
                }
            }
        }
        let cur = self.cur_live();
        if cur.size_left() != 0 {
            let _ = writeln!(out, "      {} bytes unused", cur.size_left());
        }

        out.push_str("  Deallocated blocks:\n");
        for block in self.free_blocks.blocks() {
            let _ = writeln!(out, "    {:#x}: {} bytes", block.address, block.n_bytes);
            let attribution = if block.n_bytes >= HEADER_SIZE {
                self.header_at(block.address)
            } else {
                None
            };
            match attribution.filter(|h| h.subpool_index < self.subpools.len()) {
                Some(stored) => {
                    let name =
                        header::name_of_token(stored.type_token).unwrap_or("N/A");
                    let _ = writeln!(
                        out,
                        "      Subpool: {}, type: {}",
                        stored.subpool_index + 1,
                        name
                    );
                }
                None => {
                    let _ = writeln!(out, "      Subpool: N/A, type: N/A");
                }
            }
        }
        out
    }
}
