//! Raw view over a single block within a class arena.

use std::ptr::NonNull;

use crate::layout::{
    ALIGNMENT, BLOCK_END_SENTINEL, BLOCK_HEADER_SIZE, BLOCK_START_SENTINEL, NOT_SET, SENTINEL_LEN,
};

/// A typed view over one block of a class arena.
///
/// The view is a plain address wrapper; creating one performs no reads. Every
/// accessor touches only bytes of the block (or of the merged run rooted at
/// it), which the construction contract guarantees to be inside the pool
/// region.
///
/// Block layout, offsets relative to the block start:
///
/// | Offset | Size | Content |
/// |---|---|---|
/// | 0 | 16 | start sentinel |
/// | 16 | word | `used_blocks`, or `NOT_SET` when free |
/// | 24 | word | `data_size`, or `NOT_SET` when free |
/// | 32 | payload span | user-visible bytes |
/// | 32 + span | 16 | end sentinel |
#[derive(Clone, Copy, Debug)]
pub(crate) struct BlockPtr {
    start: NonNull<u8>,
}

impl BlockPtr {
    /// Creates a view over the block starting at `start`.
    ///
    /// # Safety
    ///
    /// `start` must be a block start position of a class arena inside a live
    /// pool region, so that the block header and the payload span addressed
    /// through this view stay within that region.
    #[must_use]
    pub(crate) unsafe fn from_start(start: NonNull<u8>) -> Self {
        Self { start }
    }

    /// Creates a view over the block whose payload starts at `user_ptr`.
    ///
    /// # Safety
    ///
    /// `user_ptr` must be a block payload position of a class arena inside a
    /// live pool region (block start at `user_ptr - BLOCK_HEADER_SIZE`).
    #[must_use]
    pub(crate) unsafe fn from_user_ptr(user_ptr: NonNull<u8>) -> Self {
        // SAFETY: The caller guarantees the block header precedes the payload
        // within the same region allocation.
        let start = unsafe { user_ptr.byte_sub(BLOCK_HEADER_SIZE) };
        Self { start }
    }

    /// The block start address.
    #[must_use]
    pub(crate) fn addr(self) -> usize {
        self.start.as_ptr() as usize
    }

    /// Pointer to the first payload byte.
    #[must_use]
    pub(crate) fn user_ptr(self) -> NonNull<u8> {
        // SAFETY: The payload directly follows the block header inside the
        // region, per the construction contract.
        unsafe { self.start.byte_add(BLOCK_HEADER_SIZE) }
    }

    /// The view `strides` whole blocks further into the same arena.
    ///
    /// # Safety
    ///
    /// The target block must still lie within the same class arena.
    #[must_use]
    pub(crate) unsafe fn add_blocks(self, strides: usize, stride: usize) -> Self {
        // SAFETY: The caller keeps the result within the arena.
        let start = unsafe { self.start.byte_add(strides * stride) };
        Self { start }
    }

    /// Whether the block begins with the block-start sentinel.
    #[must_use]
    pub(crate) fn has_start_sentinel(self) -> bool {
        // SAFETY: The first SENTINEL_LEN bytes of a block are within the
        // region, per the construction contract.
        let header = unsafe { std::slice::from_raw_parts(self.start.as_ptr(), SENTINEL_LEN) };
        header == BLOCK_START_SENTINEL
    }

    /// Writes the block-start sentinel.
    pub(crate) fn stamp_start_sentinel(self) {
        // SAFETY: Same bounds as has_start_sentinel(); the region is uniquely
        // borrowed by the pool core while block views are in use.
        unsafe {
            self.start
                .as_ptr()
                .copy_from_nonoverlapping(BLOCK_START_SENTINEL.as_ptr(), SENTINEL_LEN);
        }
    }

    /// Overwrites the whole block header (sentinel and both counters) with
    /// `fill`, as done for the intermediate blocks of a merged run.
    pub(crate) fn clear_start_header(self, fill: u8) {
        // SAFETY: The BLOCK_HEADER_SIZE bytes are within the region, per the
        // construction contract.
        unsafe {
            self.start.as_ptr().write_bytes(fill, BLOCK_HEADER_SIZE);
        }
    }

    /// The `used_blocks` counter: the run length rooted at this block, or
    /// `NOT_SET` when the block is free.
    #[must_use]
    pub(crate) fn used_blocks(self) -> usize {
        // SAFETY: The counter word sits at an ALIGNMENT offset inside the
        // block header, properly aligned for usize and within the region.
        unsafe { self.start.byte_add(ALIGNMENT).cast::<usize>().read() }
    }

    pub(crate) fn set_used_blocks(self, value: usize) {
        // SAFETY: Same location as used_blocks(); exclusive region access is
        // guaranteed by the pool core.
        unsafe {
            self.start.byte_add(ALIGNMENT).cast::<usize>().write(value);
        }
    }

    /// The `data_size` counter: the user-requested byte count, or `NOT_SET`
    /// when the block is free.
    #[must_use]
    pub(crate) fn data_size(self) -> usize {
        // SAFETY: The counter word follows used_blocks, aligned for usize and
        // within the region.
        unsafe {
            self.start
                .byte_add(ALIGNMENT + size_of::<usize>())
                .cast::<usize>()
                .read()
        }
    }

    pub(crate) fn set_data_size(self, value: usize) {
        // SAFETY: Same location as data_size(); exclusive region access is
        // guaranteed by the pool core.
        unsafe {
            self.start
                .byte_add(ALIGNMENT + size_of::<usize>())
                .cast::<usize>()
                .write(value);
        }
    }

    /// Whether the block is free (not serving any allocation).
    #[must_use]
    pub(crate) fn is_free(self) -> bool {
        self.used_blocks() == NOT_SET
    }

    /// Marks the block free by resetting both counters.
    pub(crate) fn reset_counters(self) {
        self.set_used_blocks(NOT_SET);
        self.set_data_size(NOT_SET);
    }

    /// Whether the end sentinel after a payload span of `payload_span` bytes
    /// is intact.
    #[must_use]
    pub(crate) fn has_end_sentinel(self, payload_span: usize) -> bool {
        // SAFETY: The end sentinel of the span rooted at this block is within
        // the region, per the construction contract.
        let sentinel = unsafe {
            std::slice::from_raw_parts(
                self.user_ptr().byte_add(payload_span).as_ptr(),
                SENTINEL_LEN,
            )
        };
        sentinel == BLOCK_END_SENTINEL
    }

    /// Writes the end sentinel after a payload span of `payload_span` bytes.
    pub(crate) fn stamp_end_sentinel(self, payload_span: usize) {
        // SAFETY: Same bounds as has_end_sentinel(); exclusive region access
        // is guaranteed by the pool core.
        unsafe {
            self.user_ptr()
                .byte_add(payload_span)
                .as_ptr()
                .copy_from_nonoverlapping(BLOCK_END_SENTINEL.as_ptr(), SENTINEL_LEN);
        }
    }

    /// Overwrites the end sentinel slot after `payload_span` bytes with
    /// `fill`, dissolving it into the surrounding run.
    pub(crate) fn clear_end_sentinel(self, payload_span: usize, fill: u8) {
        // SAFETY: Same bounds as has_end_sentinel(); exclusive region access
        // is guaranteed by the pool core.
        unsafe {
            self.user_ptr()
                .byte_add(payload_span)
                .as_ptr()
                .write_bytes(fill, ALIGNMENT);
        }
    }

    /// Address of the end sentinel after a payload span of `payload_span`
    /// bytes, for error reporting.
    #[must_use]
    pub(crate) fn end_sentinel_addr(self, payload_span: usize) -> usize {
        self.addr() + BLOCK_HEADER_SIZE + payload_span
    }

    /// Address of the `used_blocks` counter, for error reporting.
    #[must_use]
    pub(crate) fn used_blocks_addr(self) -> usize {
        self.addr() + ALIGNMENT
    }

    /// Address of the `data_size` counter, for error reporting.
    #[must_use]
    pub(crate) fn data_size_addr(self) -> usize {
        self.addr() + ALIGNMENT + size_of::<usize>()
    }

    /// Whether payload bytes `[from, from + length)` all equal `expected`.
    #[must_use]
    pub(crate) fn payload_is_filled_with(self, from: usize, length: usize, expected: u8) -> bool {
        if length == 0 {
            return true;
        }

        // SAFETY: The caller only audits ranges within the payload span of
        // the run rooted at this block, which is within the region.
        let payload = unsafe {
            std::slice::from_raw_parts(self.user_ptr().byte_add(from).as_ptr(), length)
        };
        payload.iter().all(|&byte| byte == expected)
    }

    /// Fills payload bytes `[from, from + length)` with `fill`.
    pub(crate) fn fill_payload(self, from: usize, length: usize, fill: u8) {
        // SAFETY: Same bounds as payload_is_filled_with(); exclusive region
        // access is guaranteed by the pool core.
        unsafe {
            self.user_ptr().byte_add(from).as_ptr().write_bytes(fill, length);
        }
    }

    /// Zero-fills payload bytes `[from, from + length)`.
    pub(crate) fn zero_payload(self, from: usize, length: usize) {
        self.fill_payload(from, length, 0);
    }
}
