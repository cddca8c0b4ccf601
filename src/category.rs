//! Per-class free-range bookkeeping.

use crate::layout::block_stride;

/// Management entry for the blocks of one size class, stored in the region's
/// category table. Addresses are absolute; zero means "none". Field order is
/// part of the on-memory format.
///
/// The free window `[first_free_address, last_free_address]` is conservative:
/// no free block lies outside it, but stale entries inside it are possible
/// because the window is never retracted on allocation, only advanced from
/// the front. This keeps the allocation hot path linear in the number of
/// occupied blocks scanned.
#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct BlockCategory {
    /// Start address of the first block of this class.
    pub(crate) start_address: usize,

    /// Start address of the first free block, the allocation scan origin.
    pub(crate) first_free_address: usize,

    /// Start address of the last known free block, the allocation scan bound.
    pub(crate) last_free_address: usize,

    /// Start address of the last block of this class (inclusive).
    pub(crate) last_address: usize,

    /// The payload size of each block.
    pub(crate) block_size: usize,

    /// The number of blocks configured for this class.
    pub(crate) total_blocks: usize,

    /// The number of blocks currently serving allocations.
    pub(crate) occupied_blocks: usize,
}

impl BlockCategory {
    /// Distance between adjacent block start addresses in this arena.
    #[must_use]
    pub(crate) fn stride(&self) -> usize {
        block_stride(self.block_size)
    }

    /// Whether at least one block of this class is unoccupied.
    #[must_use]
    pub(crate) fn has_free_blocks(&self) -> bool {
        self.occupied_blocks < self.total_blocks
    }

    /// Whether `size` bytes fit into a single free block of this class.
    #[must_use]
    pub(crate) fn fits_single_block(&self, size: usize) -> bool {
        self.block_size >= size && self.has_free_blocks()
    }

    /// Whether `address` is a position inside this class arena.
    #[must_use]
    pub(crate) fn contains(&self, address: usize) -> bool {
        self.start_address != 0 && address >= self.start_address && address <= self.last_address
    }

    /// The free window, or `None` if either bound is unset.
    #[must_use]
    pub(crate) fn free_window(&self) -> Option<(usize, usize)> {
        if self.first_free_address == 0 || self.last_free_address == 0 {
            None
        } else {
            Some((self.first_free_address, self.last_free_address))
        }
    }

    /// Pins the class as fully occupied and clears the free window.
    pub(crate) fn mark_exhausted(&mut self) {
        self.occupied_blocks = self.total_blocks;
        self.first_free_address = 0;
        self.last_free_address = 0;
    }

    /// Widens the free window to cover a block freed at `address`. The window
    /// is only ever extended here, never retracted.
    pub(crate) fn extend_free_window(&mut self, address: usize) {
        if self.first_free_address == 0 || self.first_free_address > address {
            self.first_free_address = address;
        }

        if self.last_free_address == 0 || self.last_free_address < address {
            self.last_free_address = address;
        }
    }

    /// The payload bytes this class would still have free after
    /// hypothetically occupying `consumed` more blocks. Used by the planner
    /// to pick between a larger single block and a run of smaller ones.
    #[must_use]
    pub(crate) fn residual_free_payload(&self, consumed: usize) -> usize {
        self.block_size * (self.total_blocks - self.occupied_blocks - consumed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn category(total: usize, occupied: usize) -> BlockCategory {
        BlockCategory {
            start_address: 0x1000,
            first_free_address: 0x1000,
            last_free_address: 0x1000 + (total.max(1) - 1) * block_stride(32),
            last_address: 0x1000 + (total.max(1) - 1) * block_stride(32),
            block_size: 32,
            total_blocks: total,
            occupied_blocks: occupied,
        }
    }

    #[test]
    fn single_block_fit_requires_size_and_space() {
        let entry = category(2, 0);
        assert!(entry.fits_single_block(32));
        assert!(!entry.fits_single_block(33));

        let full = category(2, 2);
        assert!(!full.fits_single_block(32));
    }

    #[test]
    fn window_extends_but_never_retracts() {
        let mut entry = category(4, 4);
        entry.first_free_address = 0;
        entry.last_free_address = 0;

        entry.extend_free_window(0x2000);
        assert_eq!(entry.free_window(), Some((0x2000, 0x2000)));

        entry.extend_free_window(0x1000);
        assert_eq!(entry.free_window(), Some((0x1000, 0x2000)));

        entry.extend_free_window(0x1800);
        assert_eq!(entry.free_window(), Some((0x1000, 0x2000)));
    }

    #[test]
    fn exhausted_class_has_no_window() {
        let mut entry = category(4, 3);
        entry.mark_exhausted();

        assert_eq!(entry.occupied_blocks, entry.total_blocks);
        assert_eq!(entry.free_window(), None);
        assert!(!entry.has_free_blocks());
    }

    #[test]
    fn residual_counts_remaining_payload() {
        let entry = category(4, 1);
        assert_eq!(entry.residual_free_payload(1), 2 * 32);
        assert_eq!(entry.residual_free_payload(3), 0);
    }

    #[test]
    fn containment_is_inclusive_of_last_block() {
        let entry = category(2, 0);
        assert!(entry.contains(entry.start_address));
        assert!(entry.contains(entry.last_address));
        assert!(!entry.contains(entry.last_address + 1));
        assert!(!entry.contains(entry.start_address - 1));
    }
}
