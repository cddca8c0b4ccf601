//! Byte-level layout of the pool region.
//!
//! The region is a single contiguous allocation with five sections, in order:
//! start sentinel, settings copy, block-category table, auxiliary data and
//! the per-class block arenas, followed by the end sentinel. Every section is
//! padded to [`ALIGNMENT`]. The sentinel byte patterns and the in-block
//! offsets defined here are part of the on-memory format consumed by error
//! dump readers and must not change.

use crate::category::BlockCategory;
use crate::report::AuxData;
use crate::settings::SettingsWire;
use crate::size_class::{CLASS_COUNT, CLASS_SIZES};

/// Section and block alignment: two machine words.
pub(crate) const ALIGNMENT: usize = 2 * size_of::<usize>();

/// Length of every sentinel pattern.
pub(crate) const SENTINEL_LEN: usize = 16;

// The sentinel patterns are written into ALIGNMENT-sized slots, so the two
// must agree. This limits the crate to 64-bit targets.
const _: () = assert!(ALIGNMENT == SENTINEL_LEN);

/// The "free" marker stored in both block counter words.
pub(crate) const NOT_SET: usize = usize::MAX;

/// Canonical fill value for free payload and allocator-owned slack regions.
pub(crate) const INIT_BYTE: u8 = 0xAC;

/// Stamped at offset 0 of the region.
pub(crate) const POOL_START_SENTINEL: [u8; SENTINEL_LEN] = [
    0xDE, 0xCE, 0xCA, 0xDE, 0xF0, 0xCA, 0xAC, 0xDC, 0xF0, 0x0D, 0xFA, 0xCE, 0xDE, 0xAD, 0xBE,
    0xEF,
];

/// Stamped in the last [`ALIGNMENT`] bytes of the region.
pub(crate) const POOL_END_SENTINEL: [u8; SENTINEL_LEN] = [
    0xDE, 0xAD, 0xBE, 0xEF, 0xF0, 0x0D, 0xFA, 0xCE, 0xAC, 0xDC, 0xDE, 0xCE, 0xCA, 0xDE, 0xF0,
    0xCA,
];

/// Stamped at offset 0 of every free block and of the head block of an
/// allocated run.
pub(crate) const BLOCK_START_SENTINEL: [u8; SENTINEL_LEN] = [
    0xF0, 0x0D, 0xFA, 0xCE, 0xDE, 0xAD, 0xBE, 0xEF, 0xDE, 0xCE, 0xCA, 0xDE, 0xF0, 0xCA, 0xAC,
    0xDC,
];

/// Stamped after the payload span of every free block and of an allocated run.
pub(crate) const BLOCK_END_SENTINEL: [u8; SENTINEL_LEN] = [
    0xAC, 0xDC, 0xDE, 0xCE, 0xCA, 0xDE, 0xF0, 0xCA, 0xDE, 0xAD, 0xBE, 0xEF, 0xF0, 0x0D, 0xFA,
    0xCE,
];

/// Bytes between the start of a block and its payload: the start sentinel
/// plus the `used_blocks` and `data_size` counter words.
pub(crate) const BLOCK_HEADER_SIZE: usize = 2 * ALIGNMENT;

/// Total non-payload bytes of a block: the header plus the end sentinel.
pub(crate) const BLOCK_OVERHEAD: usize = 3 * ALIGNMENT;

/// Rounds `size` up to the next [`ALIGNMENT`] boundary.
pub(crate) const fn align_up(size: usize) -> usize {
    (size + (ALIGNMENT - 1)) & !(ALIGNMENT - 1)
}

/// Distance between the start addresses of two adjacent blocks of one class.
pub(crate) const fn block_stride(block_size: usize) -> usize {
    block_size + BLOCK_OVERHEAD
}

/// Number of consecutive blocks of one class needed to serve `size` payload
/// bytes, accounting for the header and sentinel bytes reclaimed from the
/// intermediate blocks when a run is merged.
pub(crate) const fn blocks_for_size(size: usize, block_size: usize) -> usize {
    (size + BLOCK_OVERHEAD).div_ceil(block_stride(block_size))
}

/// The contiguous user-addressable byte count of a (possibly merged) run of
/// `used_blocks` blocks.
pub(crate) const fn payload_span(block_size: usize, used_blocks: usize) -> usize {
    block_size + (used_blocks - 1) * block_stride(block_size)
}

/// Precomputed section offsets for one pool region.
///
/// All offsets are relative to the region base. The settings, category and
/// auxiliary sections are sized from their wire structs rounded up to
/// [`ALIGNMENT`], so the arena offsets are fully determined by the per-class
/// block counts.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct RegionPlan {
    /// Offset of the settings copy, directly after the start sentinel.
    pub(crate) settings_offset: usize,

    /// Offset of the eight-entry block-category table.
    pub(crate) categories_offset: usize,

    /// Offset of the auxiliary data (lock word, last-error slot).
    pub(crate) aux_offset: usize,

    /// Offset of the first block of the first non-empty class arena.
    pub(crate) first_block_offset: usize,

    /// Total region size including both sentinels.
    pub(crate) total_size: usize,
}

impl RegionPlan {
    /// Computes the plan for the given per-class block counts.
    ///
    /// # Panics
    ///
    /// Panics if the region size calculation overflows `usize`.
    #[must_use]
    pub(crate) fn for_block_counts(block_counts: &[usize; CLASS_COUNT]) -> Self {
        let settings_offset = ALIGNMENT;
        let categories_offset = settings_offset + align_up(size_of::<SettingsWire>());
        let aux_offset = categories_offset + align_up(CLASS_COUNT * size_of::<BlockCategory>());
        let first_block_offset = aux_offset + align_up(size_of::<AuxData>());

        let mut arenas_size: usize = 0;
        let mut index = 0;
        while index < CLASS_COUNT {
            arenas_size = block_counts[index]
                .checked_mul(block_stride(CLASS_SIZES[index]))
                .and_then(|arena| arenas_size.checked_add(arena))
                .expect("pool region size calculation overflows usize");
            index += 1;
        }

        let total_size = first_block_offset
            .checked_add(arenas_size)
            .and_then(|size| size.checked_add(ALIGNMENT))
            .expect("pool region size calculation overflows usize");

        Self {
            settings_offset,
            categories_offset,
            aux_offset,
            first_block_offset,
            total_size,
        }
    }

    /// Offset of the region end sentinel.
    #[must_use]
    pub(crate) fn end_sentinel_offset(&self) -> usize {
        // Cannot underflow: total_size always includes both sentinels.
        self.total_size - ALIGNMENT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_is_two_words() {
        assert_eq!(ALIGNMENT, 2 * size_of::<usize>());
        assert_eq!(ALIGNMENT, 16);
    }

    #[test]
    fn align_up_rounds_to_boundary() {
        assert_eq!(align_up(0), 0);
        assert_eq!(align_up(1), ALIGNMENT);
        assert_eq!(align_up(ALIGNMENT), ALIGNMENT);
        assert_eq!(align_up(ALIGNMENT + 1), 2 * ALIGNMENT);
    }

    #[test]
    fn stride_includes_overhead() {
        assert_eq!(block_stride(32), 32 + 3 * ALIGNMENT);
        assert_eq!(block_stride(4096), 4096 + 3 * ALIGNMENT);
    }

    #[test]
    fn run_length_for_single_block_requests() {
        // Anything up to the class payload size fits into one block.
        assert_eq!(blocks_for_size(1, 32), 1);
        assert_eq!(blocks_for_size(32, 32), 1);
    }

    #[test]
    fn run_length_counts_reclaimed_overhead() {
        // Two merged 32-byte blocks give 32 + 48 + 32 = 112 payload bytes.
        assert_eq!(blocks_for_size(33, 32), 2);
        assert_eq!(blocks_for_size(112, 32), 2);
        assert_eq!(blocks_for_size(113, 32), 3);
    }

    #[test]
    fn payload_span_matches_run_length() {
        assert_eq!(payload_span(32, 1), 32);
        assert_eq!(payload_span(32, 2), 112);
        for size in [1_usize, 31, 32, 33, 100, 112, 113, 500] {
            let blocks = blocks_for_size(size, 32);
            assert!(payload_span(32, blocks) >= size);
        }
    }

    #[test]
    fn plan_sections_are_aligned_and_ordered() {
        let plan = RegionPlan::for_block_counts(&[4, 2, 1, 0, 0, 0, 0, 1]);

        assert_eq!(plan.settings_offset, ALIGNMENT);
        assert!(plan.categories_offset > plan.settings_offset);
        assert!(plan.aux_offset > plan.categories_offset);
        assert!(plan.first_block_offset > plan.aux_offset);

        for offset in [
            plan.settings_offset,
            plan.categories_offset,
            plan.aux_offset,
            plan.first_block_offset,
            plan.total_size,
        ] {
            assert_eq!(offset % ALIGNMENT, 0);
        }

        let arenas = 4 * block_stride(32) + 2 * block_stride(64) + block_stride(128)
            + block_stride(4096);
        assert_eq!(plan.total_size, plan.first_block_offset + arenas + ALIGNMENT);
    }

    #[test]
    fn empty_pool_plan_is_control_data_only() {
        let plan = RegionPlan::for_block_counts(&[0; CLASS_COUNT]);
        assert_eq!(plan.total_size, plan.first_block_offset + ALIGNMENT);
    }
}
