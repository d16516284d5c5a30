//! Subpools: contiguous host buffers carved by a bump cursor.
//!
//! A pool owns an ordered vector of subpools. Exactly one is *current* and is
//! the only one fresh bytes may be bumped from; the rest are either frozen
//! (full, possibly still holding live allocations) or released tombstones.
//! Slots are never removed from the vector so that subpool indices recorded
//! in block headers stay meaningful for the lifetime of the pool.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::AllocResult;
use crate::platform;

/// One slot in the pool's subpool vector.
///
/// `Released` is a tombstone: the buffer is gone but the slot (and therefore
/// every index after it) keeps its position.
pub(crate) enum Subpool {
    /// Backed by a live host buffer.
    Live(LiveSubpool),
    /// Released by the sweep phase; reports a size of zero.
    Released,
}

impl Subpool {
    /// Buffer size in bytes; zero for a tombstone.
    pub(crate) fn size(&self) -> usize {
        match self {
            Self::Live(live) => live.size(),
            Self::Released => 0,
        }
    }

    pub(crate) fn as_live(&self) -> Option<&LiveSubpool> {
        match self {
            Self::Live(live) => Some(live),
            Self::Released => None,
        }
    }

    pub(crate) fn is_released(&self) -> bool {
        matches!(self, Self::Released)
    }

    /// Free the host buffer and turn this slot into a tombstone.
    ///
    /// Precondition: the cursor has reached the end of the buffer (all bytes
    /// were either handed out or skipped as slack).
    pub(crate) fn release(&mut self) {
        if let Self::Live(live) = self {
            debug_assert_eq!(live.pos(), live.end_addr(), "released subpool must be exhausted");
        } else {
            debug_assert!(false, "release of an already-released subpool");
        }
        // Dropping the Live variant frees the buffer.
        *self = Self::Released;
    }
}

/// A live subpool: `[begin, end)` plus a monotonically advancing cursor.
///
/// The cursor is an atomic only as a documentary measure: all mutation
/// happens under the pool lock today, so relaxed ordering is sufficient.
pub(crate) struct LiveSubpool {
    begin: NonNull<u8>,
    end: usize,
    pos: AtomicUsize,
}

impl LiveSubpool {
    /// Obtain a fresh buffer of `n_bytes` from the host allocator.
    pub(crate) fn allocate(n_bytes: usize) -> AllocResult<Self> {
        debug_assert!(n_bytes > 0, "subpool size must be non-zero");
        let begin = platform::raw_alloc(n_bytes)?;
        let begin_addr = begin.as_ptr() as usize;
        Ok(Self {
            begin,
            end: begin_addr + n_bytes,
            pos: AtomicUsize::new(begin_addr),
        })
    }

    #[inline]
    pub(crate) fn begin_addr(&self) -> usize {
        self.begin.as_ptr() as usize
    }

    #[inline]
    pub(crate) fn end_addr(&self) -> usize {
        self.end
    }

    #[inline]
    pub(crate) fn pos(&self) -> usize {
        self.pos.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn size(&self) -> usize {
        self.end - self.begin_addr()
    }

    #[inline]
    pub(crate) fn size_left(&self) -> usize {
        self.end - self.pos()
    }

    /// Whether the cursor can move forward by `n_bytes` without leaving the
    /// buffer.
    #[inline]
    pub(crate) fn can_advance(&self, n_bytes: usize) -> bool {
        self.pos().checked_add(n_bytes).is_some_and(|p| p <= self.end)
    }

    /// Move the cursor forward by `n_bytes`, returning the pre-advance
    /// cursor. Precondition: `can_advance(n_bytes)`.
    pub(crate) fn advance(&self, n_bytes: usize) -> usize {
        debug_assert!(self.can_advance(n_bytes), "cursor advance past subpool end");
        self.pos.fetch_add(n_bytes, Ordering::Relaxed)
    }

    /// Clamp the cursor to the end of the buffer.
    ///
    /// Returns the pre-advance cursor and the number of bytes skipped.
    pub(crate) fn advance_to_end(&self) -> (usize, usize) {
        let old = self.pos.swap(self.end, Ordering::Relaxed);
        (old, self.end - old)
    }

    /// Strict half-open range check: `begin <= addr < end`.
    #[inline]
    pub(crate) fn contains(&self, addr: usize) -> bool {
        addr >= self.begin_addr() && addr < self.end
    }

    /// Derive a pointer to `addr` with this buffer's provenance.
    ///
    /// Precondition: `contains(addr)`.
    #[inline]
    pub(crate) fn ptr_to(&self, addr: usize) -> NonNull<u8> {
        debug_assert!(self.contains(addr), "address outside subpool");
        // SAFETY: `addr` lies within `[begin, end)`, so offsetting `begin`
        // stays inside the same allocation and cannot produce null.
        unsafe { NonNull::new_unchecked(self.begin.as_ptr().add(addr - self.begin_addr())) }
    }
}

impl Drop for LiveSubpool {
    fn drop(&mut self) {
        // SAFETY: `begin` came from the host shim and is freed exactly once:
        // release() drops the Live variant, and pool teardown drops the
        // vector.
        unsafe { platform::raw_free(self.begin) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_bookkeeping() {
        let sub = LiveSubpool::allocate(256).unwrap();
        assert_eq!(sub.size(), 256);
        assert_eq!(sub.size_left(), 256);
        assert!(sub.can_advance(256));
        assert!(!sub.can_advance(257));

        let first = sub.advance(32);
        assert_eq!(first, sub.begin_addr());
        let second = sub.advance(56);
        assert_eq!(second, sub.begin_addr() + 32);
        assert_eq!(sub.size_left(), 256 - 88);

        let (old, skipped) = sub.advance_to_end();
        assert_eq!(old, sub.begin_addr() + 88);
        assert_eq!(skipped, 256 - 88);
        assert_eq!(sub.size_left(), 0);
        assert!(!sub.can_advance(1));
        assert!(sub.can_advance(0));
    }

    #[test]
    fn range_check_is_half_open() {
        let sub = LiveSubpool::allocate(64).unwrap();
        assert!(sub.contains(sub.begin_addr()));
        assert!(sub.contains(sub.end_addr() - 1));
        assert!(!sub.contains(sub.end_addr()));
    }

    #[test]
    fn release_leaves_a_tombstone() {
        let live = LiveSubpool::allocate(64).unwrap();
        live.advance_to_end();
        let mut slot = Subpool::Live(live);
        assert_eq!(slot.size(), 64);
        slot.release();
        assert!(slot.is_released());
        assert_eq!(slot.size(), 0);
        assert!(slot.as_live().is_none());
    }
}
