//! Address-ordered free list with adjacency coalescing.
//!
//! Deallocated regions are recorded as `{n_bytes, address}` entries kept
//! strictly ascending by address. Inserting a block that is left-adjacent to
//! its successor extends that entry in place and triggers a coalesce pass,
//! so after any merging insert no two entries are byte-adjacent. Lookup is
//! first-fit: within a type-specialised pool most requests are similar in
//! size, so scanning beats best-fit bookkeeping.

use tracing::trace;

/// A previously allocated, now unused, contiguous byte region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FreeBlock {
    pub(crate) n_bytes: usize,
    pub(crate) address: usize,
}

impl FreeBlock {
    /// Whether `self` ends exactly where `other` begins.
    #[inline]
    fn is_adjacent_to(&self, other: &FreeBlock) -> bool {
        self.address + self.n_bytes == other.address
    }
}

/// Whether an insert may merge with neighbouring entries.
///
/// End-of-subpool slack is published unmerged: it is address-adjacent to no
/// live region, and merging it would let a reused block straddle the
/// subpool boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CanMerge {
    Yes,
    No,
}

/// The pool's record of deallocated regions.
#[derive(Debug, Default)]
pub(crate) struct FreeList {
    blocks: Vec<FreeBlock>,
}

impl FreeList {
    pub(crate) fn len(&self) -> usize {
        self.blocks.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub(crate) fn blocks(&self) -> &[FreeBlock] {
        &self.blocks
    }

    /// Sum of all recorded free bytes.
    pub(crate) fn total_free_bytes(&self) -> usize {
        self.blocks.iter().map(|b| b.n_bytes).sum()
    }

    /// Record `block`, keeping the list sorted by address.
    ///
    /// With `CanMerge::Yes`, a block left-adjacent to its successor extends
    /// that entry leftward; either way one coalesce pass then folds any
    /// adjacency the insert created, so no two entries are ever left
    /// byte-adjacent after a merging insert.
    pub(crate) fn insert(&mut self, block: FreeBlock, merge: CanMerge) {
        debug_assert!(block.n_bytes > 0, "free block must be non-empty");

        if self.blocks.is_empty() {
            self.blocks.push(block);
            return;
        }

        let at = self.blocks.partition_point(|b| b.address < block.address);
        debug_assert!(
            at >= self.blocks.len() || self.blocks[at].address != block.address,
            "double free of the same address"
        );

        if merge == CanMerge::No {
            self.blocks.insert(at, block);
            return;
        }

        if at < self.blocks.len() && block.is_adjacent_to(&self.blocks[at]) {
            let next = self.blocks[at];
            trace!(
                address = block.address,
                bytes = block.n_bytes,
                next_address = next.address,
                next_bytes = next.n_bytes,
                "merged free block with successor"
            );
            self.blocks[at].address = block.address;
            self.blocks[at].n_bytes += block.n_bytes;
        } else {
            self.blocks.insert(at, block);
        }
        // The insert may have created adjacency with the predecessor (and,
        // through it, a longer chain); one pass folds all of it.
        self.coalesce_pass();
    }

    /// Remove and return the first entry with at least `n_bytes`.
    pub(crate) fn take_first_fit(&mut self, n_bytes: usize) -> Option<FreeBlock> {
        let i = self.blocks.iter().position(|b| b.n_bytes >= n_bytes)?;
        Some(self.blocks.remove(i))
    }

    /// Remove the entry at `index`.
    pub(crate) fn remove_at(&mut self, index: usize) -> FreeBlock {
        self.blocks.remove(index)
    }

    /// Absorb every byte-adjacent successor into its predecessor.
    pub(crate) fn coalesce_pass(&mut self) {
        let mut i = 1;
        while i < self.blocks.len() {
            let prev = self.blocks[i - 1];
            let next = self.blocks[i];
            if prev.is_adjacent_to(&next) {
                trace!(
                    address = prev.address,
                    bytes = prev.n_bytes + next.n_bytes,
                    "coalesced adjacent free blocks"
                );
                self.blocks[i - 1].n_bytes += next.n_bytes;
                self.blocks.remove(i);
            } else {
                i += 1;
            }
        }
    }

    /// Invariant check: strictly ascending, non-overlapping, non-adjacent.
    #[cfg(test)]
    pub(crate) fn assert_well_formed(&self) {
        for pair in self.blocks.windows(2) {
            assert!(pair[0].address < pair[1].address, "free list out of order");
            assert!(
                pair[0].address + pair[0].n_bytes <= pair[1].address,
                "overlapping free blocks"
            );
            assert!(
                !pair[0].is_adjacent_to(&pair[1]),
                "byte-adjacent free blocks survived a coalesce"
            );
        }
    }
}
