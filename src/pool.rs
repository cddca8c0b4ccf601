//! The pool handle and the block-management engine behind it.

use std::num::NonZero;
use std::ptr::NonNull;

use parking_lot::Mutex;

use crate::block::BlockPtr;
use crate::builder::SentinelPoolBuilder;
use crate::error::PoolError;
use crate::layout::{BLOCK_HEADER_SIZE, INIT_BYTE, NOT_SET, blocks_for_size, payload_span};
use crate::region::Region;
use crate::report;
use crate::settings::PoolSettings;
use crate::size_class::{CLASS_COUNT, CLASS_SIZES, SizeClass};

/// A fixed-capacity memory pool segregated into eight block size classes,
/// with sentinel-based corruption detection.
///
/// The pool acquires one contiguous backing region at creation and serves
/// every request out of it: small requests from a single block of the
/// best-fitting class, larger ones from a contiguous run of smaller blocks
/// merged into one span. The region never grows, never shrinks and is only
/// returned to the allocator when the pool is dropped, which makes
/// allocation latency independent of the process heap.
///
/// Every structural boundary of the region is stamped with a fixed 16-byte
/// sentinel and every block carries its counters in-band, so out-of-bounds
/// writes by callers are detected on the next operation touching the damaged
/// block and published through the last-error slot, the optional error
/// callback and the optional dump file.
///
/// # Example
///
/// ```rust
/// use std::num::NonZero;
///
/// use sentinel_pool::{SentinelPool, SizeClass};
///
/// let pool = SentinelPool::builder()
///     .block_count(SizeClass::B32, 4)
///     .block_count(SizeClass::B64, 2)
///     .build();
///
/// // 40 bytes are served from the best-fitting class.
/// let ptr = pool.allocate(NonZero::new(40).unwrap()).unwrap();
/// assert_eq!(pool.occupied_blocks(SizeClass::B64), 1);
///
/// // SAFETY: the returned pointer addresses 40 writable bytes until freed.
/// unsafe { ptr.as_ptr().write_bytes(0x5A, 40) };
///
/// pool.free(ptr.as_ptr());
/// assert!(pool.is_empty());
/// ```
///
/// # Pointer contract
///
/// [`allocate()`](Self::allocate) hands out raw pointers into the pool's own
/// region. Dereferencing one is `unsafe` and subject to the usual contract:
/// stay within the requested size and do not touch the memory after freeing
/// it. Writing past the requested size is exactly the corruption this pool
/// exists to catch: it is detected, reported and repaired best-effort, but
/// it is still a bug in the caller.
///
/// # Thread safety
///
/// The pool is [`Send`] and [`Sync`]; every state-touching operation is
/// serialized by a per-pool lock regardless of the `threadsafe` creation
/// flag (the flag is retained in the settings and the region image).
#[derive(Debug)]
pub struct SentinelPool {
    /// The region and the engine state, behind the per-pool lock.
    core: Mutex<PoolCore>,

    /// Handle-side settings copy for lock-free reads; settings are immutable
    /// after creation.
    settings: PoolSettings,
}

impl SentinelPool {
    /// Creates a builder for configuring and constructing a [`SentinelPool`].
    ///
    /// # Example
    ///
    /// ```rust
    /// use sentinel_pool::{SentinelPool, SizeClass};
    ///
    /// let pool = SentinelPool::builder()
    ///     .block_count(SizeClass::B128, 8)
    ///     .zero_on_allocate(true)
    ///     .build();
    ///
    /// assert_eq!(pool.settings().total_size(), 8 * 128);
    /// ```
    #[inline]
    pub fn builder() -> SentinelPoolBuilder {
        SentinelPoolBuilder::new()
    }

    /// Creates the pool from sanitized settings.
    ///
    /// `consistent_settings` records whether the caller's declared total size
    /// agreed with the recomputed one; a disagreement is published as
    /// [`PoolError::InconsistentSettings`] but does not prevent creation.
    #[must_use]
    pub(crate) fn new_inner(settings: PoolSettings, consistent_settings: bool) -> Self {
        let region = Region::new(&settings);

        let pool = Self {
            core: Mutex::new(PoolCore {
                region,
                settings: settings.clone(),
            }),
            settings,
        };

        if !consistent_settings {
            pool.core
                .lock()
                .publish(PoolError::InconsistentSettings, None);
        }

        pool
    }

    /// The effective settings this pool was created with.
    ///
    /// The total size always reflects the per-class block counts, even when
    /// the creation request declared a different value.
    #[must_use]
    #[inline]
    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Allocates `size` bytes from the pool.
    ///
    /// The request is served from a single block of the best-fitting class
    /// when one is free, or from a contiguous run of smaller blocks merged
    /// into one span. When both options exist, the pool picks the class that
    /// keeps more residual free payload after the allocation.
    ///
    /// The payload is zeroed only when the pool was built with
    /// `zero_on_allocate`; otherwise it carries the allocator's fill pattern.
    ///
    /// # Errors
    ///
    /// [`PoolError::NoMemory`] when no class can serve the request, and
    /// [`PoolError::InvalidPool`] when the region's start sentinel is
    /// damaged. Errors are also published through the last-error slot and
    /// the configured callback and dump sinks.
    pub fn allocate(&self, size: NonZero<usize>) -> Result<NonNull<u8>, PoolError> {
        let mut core = self.core.lock();

        if !core.region.pool_sentinel_ok() {
            return Err(PoolError::InvalidPool);
        }

        core.region.aux_mut().clear_error();
        core.allocate(size.get())
    }

    /// Returns an allocation to the pool.
    ///
    /// The pointer must have been returned by [`allocate()`](Self::allocate)
    /// or [`reallocate()`](Self::reallocate) of this pool and not freed
    /// since. Invalid pointers are rejected without touching any block and
    /// the rejection is published through the error sinks; corruption found
    /// around a valid pointer is published as well, and the free still
    /// completes after restoring the damaged markers.
    ///
    /// Freeing a null pointer is a no-op that leaves the last-error slot
    /// untouched.
    pub fn free(&self, ptr: *mut u8) {
        let Some(user_ptr) = NonNull::new(ptr) else {
            return;
        };

        let mut core = self.core.lock();

        if !core.region.pool_sentinel_ok() {
            return;
        }

        core.region.aux_mut().clear_error();
        _ = core.release(user_ptr);
    }

    /// Resizes an allocation, preserving its leading `min(old, new)` bytes.
    ///
    /// Shrinking and growing within the span of the current block run happen
    /// in place and return the same pointer. Growing beyond the span first
    /// tries to extend the run with the free blocks directly behind it, and
    /// only then falls back to allocate-copy-free, which returns a new
    /// pointer. If that fresh allocation fails, the original allocation is
    /// left valid and untouched.
    ///
    /// A null `ptr` makes this equivalent to [`allocate()`](Self::allocate);
    /// a zero `size` makes it equivalent to [`free()`](Self::free) and
    /// returns `Ok(None)`.
    ///
    /// # Errors
    ///
    /// [`PoolError::PointerParam`] for pointers that do not refer to a live
    /// allocation, [`PoolError::NoMemory`] when migration cannot find space,
    /// [`PoolError::Overflow`] when the block's markers were damaged, and
    /// [`PoolError::InvalidPool`] when the region's start sentinel is
    /// damaged.
    pub fn reallocate(
        &self,
        ptr: *mut u8,
        size: usize,
    ) -> Result<Option<NonNull<u8>>, PoolError> {
        let mut core = self.core.lock();

        if !core.region.pool_sentinel_ok() {
            return Err(PoolError::InvalidPool);
        }

        core.region.aux_mut().clear_error();

        match (NonNull::new(ptr), size) {
            (None, 0) => Ok(None),
            (None, _) => core.allocate(size).map(Some),
            (Some(user_ptr), 0) => core.release(user_ptr).map(|()| None),
            (Some(user_ptr), _) => core.reallocate(user_ptr, size).map(Some),
        }
    }

    /// The error recorded by the most recent operation on this pool, or
    /// `None` if that operation succeeded.
    ///
    /// The slot is cleared on entry of every allocate, free and reallocate
    /// call, so it always describes the latest operation. Returns
    /// [`PoolError::InvalidPool`] when the region's start sentinel is
    /// damaged.
    #[must_use]
    pub fn last_error(&self) -> Option<PoolError> {
        let core = self.core.lock();

        if !core.region.pool_sentinel_ok() {
            return Some(PoolError::InvalidPool);
        }

        core.region.aux().error()
    }

    /// The human-readable rendering of [`last_error()`](Self::last_error),
    /// including the offending address when one is known. Empty when the
    /// most recent operation succeeded.
    #[must_use]
    pub fn last_error_message(&self) -> String {
        let core = self.core.lock();

        if !core.region.pool_sentinel_ok() {
            return PoolError::InvalidPool.to_string();
        }

        core.region.aux().message()
    }

    /// The number of blocks of one class currently serving allocations.
    #[must_use]
    pub fn occupied_blocks(&self, class: SizeClass) -> usize {
        self.core
            .lock()
            .region
            .category(class.index())
            .occupied_blocks
    }

    /// The number of blocks configured for one class.
    #[must_use]
    #[inline]
    pub fn total_blocks(&self, class: SizeClass) -> usize {
        self.settings.block_counts[class.index()]
    }

    /// Whether no allocation is live in any class.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        let core = self.core.lock();
        (0..CLASS_COUNT).all(|index| core.region.category(index).occupied_blocks == 0)
    }
}

impl Drop for SentinelPool {
    fn drop(&mut self) {
        let report_callback = |error: PoolError| {
            if let Some(callback) = &self.settings.error_callback {
                callback(error, &error.to_string());
            }
        };

        match self.core.try_lock() {
            Some(core) => {
                if !core.region.pool_sentinel_ok() {
                    report_callback(PoolError::InvalidPool);
                }
            }
            None => {
                // Reachable only through unsafe aliasing misuse: ownership
                // already guarantees no call is in progress through this
                // handle. Report instead of silently racing the scrub.
                report_callback(PoolError::ThreadSync);
            }
        }

        // The region scrubs and releases its allocation when the core drops.
    }
}

/// The lock-protected engine state: the region plus the settings the engine
/// consults on every operation.
#[derive(Debug)]
struct PoolCore {
    region: Region,
    settings: PoolSettings,
}

impl PoolCore {
    fn publish(&mut self, error: PoolError, location: Option<usize>) {
        report::publish(&mut self.region, &self.settings, error, location);
    }

    /// Chooses the serving class and strategy for a request of `size` bytes
    /// and commits the allocation.
    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, PoolError> {
        // The smallest class is never anyone's multi-block fallback; take it
        // directly whenever it fits.
        if self.region.category(0).fits_single_block(size) {
            return self.allocate_single(0, size);
        }

        // The smallest single-block class with free space that is not the
        // strict best fit.
        let mut single_candidate: Option<usize> = None;

        // The largest class whose blocks are smaller than the request but
        // which holds a long enough contiguous free run.
        let mut run_candidate: Option<(usize, usize, usize)> = None;

        for index in (1..CLASS_COUNT).rev() {
            let category = self.region.category(index);
            if !category.has_free_blocks() {
                continue;
            }

            if category.block_size >= size {
                if CLASS_SIZES[index - 1] < size {
                    // The smallest class that still fits the whole request:
                    // strict best fit, no further comparison needed.
                    return self.allocate_single(index, size);
                }
                single_candidate = Some(index);
            } else if let Some((run_start, count)) = self.find_run(index, size) {
                run_candidate = Some((index, run_start, count));
                break;
            }
        }

        if run_candidate.is_none() {
            let first = self.region.category(0);
            if first.has_free_blocks() && size > first.block_size {
                if let Some((run_start, count)) = self.find_run(0, size) {
                    run_candidate = Some((0, run_start, count));
                }
            }
        }

        match (single_candidate, run_candidate) {
            (Some(single_index), Some((run_index, run_start, count))) => {
                let single = self.region.category(single_index);
                let run = self.region.category(run_index);

                // Serve from whichever class keeps more residual free
                // payload after the hypothetical allocation; ties go to the
                // multi-block side.
                if single.residual_free_payload(1) > run.residual_free_payload(count) {
                    self.allocate_single(single_index, size)
                } else {
                    self.allocate_run(run_index, size, run_start, count)
                }
            }
            (Some(single_index), None) => self.allocate_single(single_index, size),
            (None, Some((run_index, run_start, count))) => {
                self.allocate_run(run_index, size, run_start, count)
            }
            (None, None) => {
                self.publish(PoolError::NoMemory, None);
                Err(PoolError::NoMemory)
            }
        }
    }

    /// Commits a single-block allocation from the first free block of a
    /// class.
    fn allocate_single(&mut self, index: usize, size: usize) -> Result<NonNull<u8>, PoolError> {
        let mut category = self.region.category(index);

        if category.occupied_blocks >= category.total_blocks {
            let location = self.region.category_addr(index);
            self.publish(PoolError::InconsistentBlocks, Some(location));
            return Err(PoolError::InconsistentBlocks);
        }

        let Some((first_free, _)) = category.free_window() else {
            let location = self.region.category_addr(index);
            self.publish(PoolError::InconsistentBlocks, Some(location));
            category.mark_exhausted();
            self.region.store_category(index, &category);
            return Err(PoolError::InconsistentBlocks);
        };

        // SAFETY: first_free_address always holds a block start of this
        // arena while the window is set.
        let block = unsafe { self.region.block_at(first_free) };

        self.merge_blocks(index, block, 1, true, true);

        if self.settings.zero_on_allocate {
            block.zero_payload(0, size);
        }

        block.set_used_blocks(1);
        block.set_data_size(size);

        category.occupied_blocks += 1;

        if category.occupied_blocks < category.total_blocks {
            self.region.store_category(index, &category);
            self.settle_first_free_after(index, first_free);
        } else {
            category.mark_exhausted();
            self.region.store_category(index, &category);
        }

        Ok(block.user_ptr())
    }

    /// Commits a multi-block allocation over `count` consecutive free blocks
    /// starting at `run_start`.
    fn allocate_run(
        &mut self,
        index: usize,
        size: usize,
        run_start: usize,
        count: usize,
    ) -> Result<NonNull<u8>, PoolError> {
        let mut category = self.region.category(index);

        if category.occupied_blocks >= category.total_blocks {
            let location = self.region.category_addr(index);
            self.publish(PoolError::InconsistentBlocks, Some(location));
            return Err(PoolError::InconsistentBlocks);
        }

        let Some((first_free, _)) = category.free_window() else {
            let location = self.region.category_addr(index);
            self.publish(PoolError::InconsistentBlocks, Some(location));
            category.mark_exhausted();
            self.region.store_category(index, &category);
            return Err(PoolError::InconsistentBlocks);
        };

        // SAFETY: find_run() selected the run inside this arena.
        let block = unsafe { self.region.block_at(run_start) };

        self.merge_blocks(index, block, count, true, true);

        if self.settings.zero_on_allocate {
            block.zero_payload(0, size);
        }

        block.set_used_blocks(count);
        block.set_data_size(size);

        category.occupied_blocks += count;

        if category.occupied_blocks < category.total_blocks {
            self.region.store_category(index, &category);

            if first_free == run_start {
                let consumed_last = run_start + (count - 1) * category.stride();
                self.settle_first_free_after(index, consumed_last);
            }
        } else {
            category.mark_exhausted();
            self.region.store_category(index, &category);
        }

        Ok(block.user_ptr())
    }

    /// Searches one class for a contiguous run of free blocks long enough to
    /// serve `size` bytes. Returns the run start address and length.
    fn find_run(&mut self, index: usize, size: usize) -> Option<(usize, usize)> {
        let mut category = self.region.category(index);

        if category.occupied_blocks >= category.total_blocks {
            let location = self.region.category_addr(index);
            self.publish(PoolError::InconsistentBlocks, Some(location));
            return None;
        }

        let Some((first_free, last_free)) = category.free_window() else {
            let location = self.region.category_addr(index);
            self.publish(PoolError::InconsistentBlocks, Some(location));
            category.mark_exhausted();
            self.region.store_category(index, &category);
            return None;
        };

        let count = blocks_for_size(size, category.block_size);
        if category.occupied_blocks + count > category.total_blocks {
            return None;
        }

        let stride = category.stride();
        let mut run_start: Option<usize> = None;
        let mut consecutive = 0;
        let mut address = first_free;

        while address <= last_free {
            // SAFETY: the scan walks block starts between the free window
            // bounds, which lie within this arena.
            let candidate = unsafe { self.region.block_at(address) };

            if candidate.is_free() {
                if run_start.is_none() {
                    run_start = Some(address);
                }

                consecutive += 1;
                if consecutive == count {
                    let start = run_start.expect("a counted run always has a recorded start");
                    return Some((start, count));
                }
            } else {
                run_start = None;
                consecutive = 0;

                // The rest of the window cannot hold a full run anymore.
                if (last_free - address) / stride < count {
                    return None;
                }
            }

            address += stride;
        }

        None
    }

    /// Verifies and restamps `count` consecutive blocks starting at `start`,
    /// dissolving the interior boundaries so the run serves one allocation.
    ///
    /// With `keep_start` the first block keeps its start header (restamped
    /// clean), otherwise it is overwritten with the init fill; likewise
    /// `keep_end` for the last block's end sentinel. Every violation found
    /// along the way is published before the bytes are rewritten.
    fn merge_blocks(
        &mut self,
        index: usize,
        start: BlockPtr,
        count: usize,
        keep_start: bool,
        keep_end: bool,
    ) {
        let category = self.region.category(index);
        let block_size = category.block_size;
        let stride = category.stride();

        for cell_index in 0..count {
            // SAFETY: the caller selected a run of `count` cells inside this
            // arena.
            let cell = unsafe { start.add_blocks(cell_index, stride) };

            if !cell.has_start_sentinel() {
                self.publish(PoolError::Overflow, Some(cell.addr()));
            }

            if !cell.has_end_sentinel(block_size) {
                self.publish(PoolError::Overflow, Some(cell.end_sentinel_addr(block_size)));
            }

            if cell.used_blocks() != NOT_SET {
                self.publish(PoolError::Overflow, Some(cell.used_blocks_addr()));
            }

            if cell.data_size() != NOT_SET {
                self.publish(PoolError::Overflow, Some(cell.data_size_addr()));
            }

            if self.settings.full_overflow_checks
                && !cell.payload_is_filled_with(0, block_size, INIT_BYTE)
            {
                self.publish(PoolError::Overflow, Some(cell.user_ptr().as_ptr() as usize));
                cell.fill_payload(0, block_size, INIT_BYTE);
            }

            if keep_start && cell_index == 0 {
                cell.stamp_start_sentinel();
                cell.reset_counters();
            } else {
                cell.clear_start_header(INIT_BYTE);
            }

            if keep_end && cell_index == count - 1 {
                cell.stamp_end_sentinel(block_size);
            } else {
                cell.clear_end_sentinel(block_size, INIT_BYTE);
            }
        }
    }

    /// Advances `first_free_address` past a consumed run ending at
    /// `consumed_last`, scanning forward one stride at a time.
    fn settle_first_free_after(&mut self, index: usize, consumed_last: usize) {
        let mut category = self.region.category(index);

        let Some((_, last_free)) = category.free_window() else {
            return;
        };

        let stride = category.stride();
        let mut address = consumed_last;
        let mut settled = false;

        while address < last_free {
            address += stride;

            // SAFETY: the scan stays at or below last_free_address, a block
            // start within this arena.
            let candidate = unsafe { self.region.block_at(address) };

            if candidate.is_free() {
                category.first_free_address = address;
                settled = true;
                break;
            }
        }

        if !settled {
            // Safety net: the window held no free block despite the
            // occupancy count saying otherwise.
            category.first_free_address = 0;
            category.last_free_address = 0;
        }

        self.region.store_category(index, &category);
    }

    /// Validates a user pointer down to its head block: region bounds, block
    /// start sentinel, owning class, counters, run containment and the end
    /// sentinel at the span end (restored if damaged).
    fn locate_block(&mut self, user_ptr: NonNull<u8>) -> Result<(usize, BlockPtr), PoolError> {
        let user_addr = user_ptr.as_ptr() as usize;
        let base = self.region.base_addr();
        let arenas_start = base + self.region.plan().first_block_offset;
        let arenas_end = base + self.region.plan().end_sentinel_offset();

        // The block header precedes the payload; both must be inside the
        // arenas before any header byte is read.
        if user_addr < arenas_start + BLOCK_HEADER_SIZE || user_addr >= arenas_end {
            self.publish(PoolError::PointerParam, None);
            return Err(PoolError::PointerParam);
        }

        // SAFETY: the bounds established above place the header inside the
        // arenas section of the region.
        let block = unsafe { BlockPtr::from_user_ptr(user_ptr) };

        if !block.has_start_sentinel() {
            self.publish(PoolError::PointerParam, None);
            return Err(PoolError::PointerParam);
        }

        let Some(index) =
            (0..CLASS_COUNT).find(|&index| self.region.category(index).contains(block.addr()))
        else {
            self.publish(PoolError::PointerParam, None);
            return Err(PoolError::PointerParam);
        };

        let used = block.used_blocks();
        let data = block.data_size();

        if used == NOT_SET {
            // Half-reset counters mean the header was partially overwritten;
            // force the block fully free so it stays allocatable.
            block.set_data_size(NOT_SET);
            self.publish(PoolError::Overflow, Some(block.used_blocks_addr()));
            return Err(PoolError::Overflow);
        }

        if data == NOT_SET {
            block.set_used_blocks(NOT_SET);
            self.publish(PoolError::Overflow, Some(block.data_size_addr()));
            return Err(PoolError::Overflow);
        }

        let category = self.region.category(index);

        // A forged used_blocks must not send the span end outside the arena.
        let run_within_arena =
            used >= 1 && used - 1 <= (category.last_address - block.addr()) / category.stride();
        if !run_within_arena {
            self.publish(PoolError::InconsistentBlocks, Some(block.used_blocks_addr()));
            return Err(PoolError::InconsistentBlocks);
        }

        let span = payload_span(category.block_size, used);

        if data > span {
            self.publish(PoolError::InconsistentBlocks, Some(block.data_size_addr()));
            return Err(PoolError::InconsistentBlocks);
        }

        if !block.has_end_sentinel(span) {
            self.publish(PoolError::Overflow, Some(block.end_sentinel_addr(span)));
            block.stamp_end_sentinel(span);
        }

        Ok((index, block))
    }

    /// Returns an allocation's span to the free pool: scrub, restamp every
    /// cell as an individual free block and widen the free window.
    fn release(&mut self, user_ptr: NonNull<u8>) -> Result<(), PoolError> {
        let (index, block) = self.locate_block(user_ptr)?;
        let mut category = self.region.category(index);

        let used = block.used_blocks();
        let data = block.data_size();
        let span = payload_span(category.block_size, used);

        if self.settings.full_overflow_checks
            && !block.payload_is_filled_with(data, span - data, INIT_BYTE)
        {
            // The overflow is reported but the free still completes below.
            self.publish(PoolError::Overflow, Some(user_ptr.as_ptr() as usize + data));
        }

        block.fill_payload(0, span, INIT_BYTE);

        for cell_index in 0..used {
            // SAFETY: locate_block() verified the run stays inside the arena.
            let cell = unsafe { block.add_blocks(cell_index, category.stride()) };
            cell.stamp_start_sentinel();
            cell.stamp_end_sentinel(category.block_size);
            cell.reset_counters();
        }

        // Forged headers could claim more cells than the table counts as
        // occupied; saturate rather than wrap.
        category.occupied_blocks = category.occupied_blocks.saturating_sub(used);
        category.extend_free_window(block.addr());
        self.region.store_category(index, &category);

        Ok(())
    }

    /// The reallocation state machine: no-op, in-place shrink, in-place
    /// grow, contiguous extension, then migrate.
    fn reallocate(&mut self, user_ptr: NonNull<u8>, size: usize) -> Result<NonNull<u8>, PoolError> {
        let (index, block) = self.locate_block(user_ptr)?;
        let category = self.region.category(index);

        let data = block.data_size();
        let span = payload_span(category.block_size, block.used_blocks());

        if self.settings.full_overflow_checks
            && !block.payload_is_filled_with(data, span - data, INIT_BYTE)
        {
            self.publish(PoolError::Overflow, Some(user_ptr.as_ptr() as usize + data));
            block.fill_payload(data, span - data, INIT_BYTE);
        }

        if size == data {
            return Ok(user_ptr);
        }

        if size < data {
            // Trailing blocks of a multi-block run are not returned to the
            // class here; the capacity is reclaimed when the pointer is
            // freed.
            block.fill_payload(size, data - size, INIT_BYTE);
            block.set_data_size(size);
            return Ok(user_ptr);
        }

        if size <= span {
            if self.settings.zero_on_allocate {
                block.zero_payload(data, size - data);
            }
            block.set_data_size(size);
            return Ok(user_ptr);
        }

        if let Some(pointer) = self.try_extend_in_place(index, block, size) {
            return Ok(pointer);
        }

        // Migrate: fresh allocation, copy, release the original. When the
        // fresh allocation fails, the original stays valid and allocated.
        let new_ptr = self.allocate(size)?;

        // SAFETY: the new run and the still-allocated original are disjoint
        // spans of the region; `data` bytes are readable at the source and
        // writable at the destination.
        unsafe {
            new_ptr
                .as_ptr()
                .copy_from_nonoverlapping(user_ptr.as_ptr(), data);
        }

        _ = self.release(user_ptr);

        Ok(new_ptr)
    }

    /// Grows a run in place by merging the free blocks directly behind it,
    /// when they exist. Returns the unchanged user pointer on success.
    fn try_extend_in_place(
        &mut self,
        index: usize,
        block: BlockPtr,
        size: usize,
    ) -> Option<NonNull<u8>> {
        let mut category = self.region.category(index);

        let used = block.used_blocks();
        let data = block.data_size();
        let span = payload_span(category.block_size, used);
        let stride = category.stride();

        let extra = (size - span).div_ceil(stride);
        if extra > category.total_blocks - category.occupied_blocks {
            return None;
        }

        let extension_start = block.addr() + used * stride;
        let extension_last = block.addr() + (used + extra - 1) * stride;
        if extension_last > category.last_address {
            return None;
        }

        // SAFETY: the extension cells were just bounded within this arena.
        let extension = unsafe { self.region.block_at(extension_start) };

        for cell_index in 0..extra {
            // SAFETY: same bound as above.
            let cell = unsafe { extension.add_blocks(cell_index, stride) };
            if !cell.is_free() {
                return None;
            }
        }

        self.merge_blocks(index, extension, extra, false, true);

        // The old end sentinel dissolves into the grown run.
        block.clear_end_sentinel(span, INIT_BYTE);

        if self.settings.zero_on_allocate {
            block.zero_payload(data, size - data);
        }

        block.set_used_blocks(used + extra);
        block.set_data_size(size);

        category.occupied_blocks += extra;

        if category.occupied_blocks >= category.total_blocks {
            category.mark_exhausted();
            self.region.store_category(index, &category);
        } else {
            self.region.store_category(index, &category);

            if let Some((first_free, _)) = category.free_window() {
                if first_free >= extension_start && first_free <= extension_last {
                    self.settle_first_free_after(index, extension_last);
                }
            }
        }

        Some(block.user_ptr())
    }
}

#[cfg(test)]
mod tests {
    use std::fmt::Debug;
    use std::num::NonZero;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(SentinelPool: Send, Sync, Debug);

    fn request(size: usize) -> NonZero<usize> {
        NonZero::new(size).expect("test sizes are non-zero")
    }

    #[test]
    fn smoke_test() {
        let pool = SentinelPool::builder()
            .block_count(SizeClass::B32, 4)
            .block_count(SizeClass::B64, 2)
            .build();

        let first = pool.allocate(request(10)).unwrap();
        let second = pool.allocate(request(32)).unwrap();
        let third = pool.allocate(request(33)).unwrap();

        assert_eq!(pool.occupied_blocks(SizeClass::B32), 2);
        assert_eq!(pool.occupied_blocks(SizeClass::B64), 1);
        assert_eq!(pool.last_error(), None);

        pool.free(second.as_ptr());
        assert_eq!(pool.occupied_blocks(SizeClass::B32), 1);

        pool.free(first.as_ptr());
        pool.free(third.as_ptr());
        assert!(pool.is_empty());
    }

    #[test]
    fn distinct_allocations_do_not_overlap() {
        let pool = SentinelPool::builder()
            .block_count(SizeClass::B32, 4)
            .build();

        let mut pointers = Vec::new();
        for _ in 0..4 {
            pointers.push(pool.allocate(request(32)).unwrap());
        }

        for (left_index, left) in pointers.iter().enumerate() {
            for right in &pointers[left_index + 1..] {
                let distance = left.as_ptr().addr().abs_diff(right.as_ptr().addr());
                assert!(distance >= 32);
            }
        }
    }

    #[test]
    fn exhausted_class_reports_no_memory() {
        let pool = SentinelPool::builder()
            .block_count(SizeClass::B32, 1)
            .build();

        let only = pool.allocate(request(32)).unwrap();

        let result = pool.allocate(request(1));
        assert_eq!(result, Err(PoolError::NoMemory));
        assert_eq!(pool.last_error(), Some(PoolError::NoMemory));
        assert_eq!(
            pool.last_error_message(),
            "the pool is full, cannot allocate memory"
        );

        // A successful operation clears the slot again.
        pool.free(only.as_ptr());
        assert_eq!(pool.last_error(), None);
    }

    #[test]
    fn free_pointer_window_reuses_earliest_hole() {
        let pool = SentinelPool::builder()
            .block_count(SizeClass::B32, 3)
            .build();

        let first = pool.allocate(request(32)).unwrap();
        let second = pool.allocate(request(32)).unwrap();
        let third = pool.allocate(request(32)).unwrap();

        // Free the middle block; the next allocation must land exactly there.
        pool.free(second.as_ptr());
        let refill = pool.allocate(request(32)).unwrap();
        assert_eq!(refill, second);

        pool.free(first.as_ptr());
        pool.free(third.as_ptr());
        pool.free(refill.as_ptr());
        assert!(pool.is_empty());
    }

    #[test]
    fn payload_carries_init_fill_unless_zeroing_requested() {
        let pool = SentinelPool::builder()
            .block_count(SizeClass::B32, 1)
            .build();

        let ptr = pool.allocate(request(8)).unwrap();
        // SAFETY: 8 payload bytes are readable behind a live allocation.
        let payload = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 8) };
        assert!(payload.iter().all(|&byte| byte == 0xAC));
        pool.free(ptr.as_ptr());

        let zeroing = SentinelPool::builder()
            .block_count(SizeClass::B32, 1)
            .zero_on_allocate(true)
            .build();

        let ptr = zeroing.allocate(request(8)).unwrap();
        // SAFETY: as above.
        let payload = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 8) };
        assert!(payload.iter().all(|&byte| byte == 0));
        zeroing.free(ptr.as_ptr());
    }

    #[test]
    fn free_rejects_foreign_pointers() {
        let pool = SentinelPool::builder()
            .block_count(SizeClass::B32, 1)
            .build();

        let mut outside = 0_u8;
        pool.free(&raw mut outside);

        assert_eq!(pool.last_error(), Some(PoolError::PointerParam));
    }

    #[test]
    fn free_rejects_mid_payload_pointers() {
        let pool = SentinelPool::builder()
            .block_count(SizeClass::B32, 2)
            .build();

        let ptr = pool.allocate(request(32)).unwrap();

        // SAFETY: one byte into a 32-byte live allocation stays in bounds.
        let inside = unsafe { ptr.as_ptr().add(1) };
        pool.free(inside);
        assert_eq!(pool.last_error(), Some(PoolError::PointerParam));

        // The allocation itself is untouched and still freeable.
        pool.free(ptr.as_ptr());
        assert_eq!(pool.last_error(), None);
        assert!(pool.is_empty());
    }

    #[test]
    fn double_free_is_detected() {
        let pool = SentinelPool::builder()
            .block_count(SizeClass::B32, 1)
            .build();

        let ptr = pool.allocate(request(16)).unwrap();
        pool.free(ptr.as_ptr());
        assert_eq!(pool.last_error(), None);

        pool.free(ptr.as_ptr());
        assert_eq!(pool.last_error(), Some(PoolError::Overflow));

        // The block stays free and allocatable.
        let again = pool.allocate(request(16)).unwrap();
        assert_eq!(again, ptr);
    }

    #[test]
    fn planner_prefers_strict_best_fit() {
        let pool = SentinelPool::builder()
            .block_count(SizeClass::B64, 1)
            .block_count(SizeClass::B128, 1)
            .block_count(SizeClass::B256, 1)
            .build();

        // 100 bytes: 128 is the strict best fit.
        _ = pool.allocate(request(100)).unwrap();

        assert_eq!(pool.occupied_blocks(SizeClass::B64), 0);
        assert_eq!(pool.occupied_blocks(SizeClass::B128), 1);
        assert_eq!(pool.occupied_blocks(SizeClass::B256), 0);
    }

    #[test]
    fn planner_residual_comparison_prefers_heavier_class() {
        // Best fit (128) is exhausted; a single block in 256 retains 256
        // residual bytes, the two-block run in 64 would retain none. The
        // single block wins.
        let pool = SentinelPool::builder()
            .block_count(SizeClass::B64, 2)
            .block_count(SizeClass::B128, 1)
            .block_count(SizeClass::B256, 2)
            .build();

        _ = pool.allocate(request(100)).unwrap();
        assert_eq!(pool.occupied_blocks(SizeClass::B128), 1);

        _ = pool.allocate(request(100)).unwrap();
        assert_eq!(pool.occupied_blocks(SizeClass::B256), 1);
        assert_eq!(pool.occupied_blocks(SizeClass::B64), 0);
    }

    #[test]
    fn planner_residual_tie_takes_the_run() {
        // After exhausting 128, both remaining candidates would end up with
        // zero residual free payload; the tie goes to the multi-block run.
        let pool = SentinelPool::builder()
            .block_count(SizeClass::B64, 2)
            .block_count(SizeClass::B128, 1)
            .block_count(SizeClass::B256, 1)
            .build();

        _ = pool.allocate(request(100)).unwrap();
        assert_eq!(pool.occupied_blocks(SizeClass::B128), 1);

        _ = pool.allocate(request(100)).unwrap();
        assert_eq!(pool.occupied_blocks(SizeClass::B64), 2);
        assert_eq!(pool.occupied_blocks(SizeClass::B256), 0);
    }

    #[test]
    fn run_scan_skips_fragmented_stretches() {
        let pool = SentinelPool::builder()
            .block_count(SizeClass::B32, 5)
            .build();

        // Occupy the arena, then free blocks 0, 2, 3 and 4: the only
        // two-block run starts at block 2.
        let pointers: Vec<_> = (0..5)
            .map(|_| pool.allocate(request(32)).unwrap())
            .collect();
        pool.free(pointers[0].as_ptr());
        pool.free(pointers[2].as_ptr());
        pool.free(pointers[3].as_ptr());
        pool.free(pointers[4].as_ptr());

        let run = pool.allocate(request(60)).unwrap();
        assert_eq!(run, pointers[2]);
        assert_eq!(pool.occupied_blocks(SizeClass::B32), 3);
    }

    #[test]
    fn reallocate_same_size_is_a_no_op() {
        let pool = SentinelPool::builder()
            .block_count(SizeClass::B32, 2)
            .build();

        let ptr = pool.allocate(request(20)).unwrap();
        let same = pool.reallocate(ptr.as_ptr(), 20).unwrap();

        assert_eq!(same, Some(ptr));
        assert_eq!(pool.occupied_blocks(SizeClass::B32), 1);
    }

    #[test]
    fn reallocate_zero_frees() {
        let pool = SentinelPool::builder()
            .block_count(SizeClass::B32, 1)
            .build();

        let ptr = pool.allocate(request(20)).unwrap();
        let freed = pool.reallocate(ptr.as_ptr(), 0).unwrap();

        assert_eq!(freed, None);
        assert!(pool.is_empty());
    }

    #[test]
    fn reallocate_null_allocates() {
        let pool = SentinelPool::builder()
            .block_count(SizeClass::B32, 1)
            .build();

        let ptr = pool
            .reallocate(std::ptr::null_mut(), 20)
            .unwrap()
            .expect("a non-zero size through a null pointer must allocate");

        assert_eq!(pool.occupied_blocks(SizeClass::B32), 1);
        pool.free(ptr.as_ptr());

        // Null pointer and zero size together do nothing at all.
        assert_eq!(pool.reallocate(std::ptr::null_mut(), 0).unwrap(), None);
        assert!(pool.is_empty());
    }

    #[test]
    fn reallocate_shrink_keeps_pointer_and_data() {
        let pool = SentinelPool::builder()
            .block_count(SizeClass::B32, 1)
            .build();

        let ptr = pool.allocate(request(32)).unwrap();
        // SAFETY: 32 payload bytes are writable behind a live allocation.
        unsafe { ptr.as_ptr().write_bytes(0x42, 32) };

        let shrunk = pool.reallocate(ptr.as_ptr(), 8).unwrap().unwrap();
        assert_eq!(shrunk, ptr);

        // SAFETY: the shrunken allocation still owns its first 8 bytes.
        let kept = unsafe { std::slice::from_raw_parts(shrunk.as_ptr(), 8) };
        assert!(kept.iter().all(|&byte| byte == 0x42));

        // The released tail is scrubbed back to the init fill.
        // SAFETY: the tail bytes are allocator-owned slack inside the block.
        let tail = unsafe { std::slice::from_raw_parts(shrunk.as_ptr().add(8), 24) };
        assert!(tail.iter().all(|&byte| byte == 0xAC));

        pool.free(shrunk.as_ptr());
    }

    #[test]
    fn reallocate_grows_within_block_in_place() {
        let pool = SentinelPool::builder()
            .block_count(SizeClass::B32, 1)
            .build();

        let ptr = pool.allocate(request(10)).unwrap();
        let grown = pool.reallocate(ptr.as_ptr(), 30).unwrap().unwrap();

        assert_eq!(grown, ptr);
        assert_eq!(pool.occupied_blocks(SizeClass::B32), 1);
    }

    #[test]
    fn reallocate_extends_contiguously() {
        let pool = SentinelPool::builder()
            .block_count(SizeClass::B32, 4)
            .build();

        let ptr = pool.allocate(request(20)).unwrap();
        // SAFETY: 20 payload bytes are writable behind a live allocation.
        unsafe { ptr.as_ptr().write_bytes(0x7E, 20) };

        let grown = pool.reallocate(ptr.as_ptr(), 50).unwrap().unwrap();

        assert_eq!(grown, ptr, "the run must grow in place");
        assert_eq!(pool.occupied_blocks(SizeClass::B32), 2);

        // SAFETY: the grown allocation owns 50 bytes; the first 20 carry the
        // original data.
        let kept = unsafe { std::slice::from_raw_parts(grown.as_ptr(), 20) };
        assert!(kept.iter().all(|&byte| byte == 0x7E));

        pool.free(grown.as_ptr());
        assert!(pool.is_empty());
    }

    #[test]
    fn reallocate_migrates_when_neighbor_is_occupied() {
        let pool = SentinelPool::builder()
            .block_count(SizeClass::B32, 2)
            .block_count(SizeClass::B64, 1)
            .build();

        let victim = pool.allocate(request(20)).unwrap();
        let neighbor = pool.allocate(request(20)).unwrap();
        // SAFETY: 20 payload bytes are writable behind a live allocation.
        unsafe { victim.as_ptr().write_bytes(0x33, 20) };

        let moved = pool.reallocate(victim.as_ptr(), 50).unwrap().unwrap();

        assert_ne!(moved, victim);
        assert_eq!(pool.occupied_blocks(SizeClass::B32), 1);
        assert_eq!(pool.occupied_blocks(SizeClass::B64), 1);

        // SAFETY: the migrated allocation owns 50 bytes; the first 20 carry
        // the original data.
        let kept = unsafe { std::slice::from_raw_parts(moved.as_ptr(), 20) };
        assert!(kept.iter().all(|&byte| byte == 0x33));

        pool.free(moved.as_ptr());
        pool.free(neighbor.as_ptr());
        assert!(pool.is_empty());
    }

    #[test]
    fn failed_migration_keeps_original_allocation() {
        let pool = SentinelPool::builder()
            .block_count(SizeClass::B32, 2)
            .build();

        let victim = pool.allocate(request(20)).unwrap();
        let _neighbor = pool.allocate(request(20)).unwrap();
        // SAFETY: 20 payload bytes are writable behind a live allocation.
        unsafe { victim.as_ptr().write_bytes(0x44, 20) };

        // No room to extend and nothing else to migrate into.
        let result = pool.reallocate(victim.as_ptr(), 200);
        assert_eq!(result, Err(PoolError::NoMemory));

        // The original allocation survived intact.
        assert_eq!(pool.occupied_blocks(SizeClass::B32), 2);
        // SAFETY: the original allocation still owns its 20 bytes.
        let kept = unsafe { std::slice::from_raw_parts(victim.as_ptr(), 20) };
        assert!(kept.iter().all(|&byte| byte == 0x44));
    }

    #[test]
    fn null_free_preserves_last_error() {
        let pool = SentinelPool::builder()
            .block_count(SizeClass::B32, 1)
            .build();

        _ = pool.allocate(request(32)).unwrap();
        assert_eq!(pool.allocate(request(1)), Err(PoolError::NoMemory));
        assert_eq!(pool.last_error(), Some(PoolError::NoMemory));

        pool.free(std::ptr::null_mut());
        assert_eq!(pool.last_error(), Some(PoolError::NoMemory));
    }

    #[test]
    fn inconsistent_settings_are_flagged_but_pool_works() {
        let pool = SentinelPool::builder()
            .block_count(SizeClass::B32, 2)
            .total_size(12345)
            .build();

        assert_eq!(pool.last_error(), Some(PoolError::InconsistentSettings));
        // The recomputed total wins.
        assert_eq!(pool.settings().total_size(), 64);

        let ptr = pool.allocate(request(10)).unwrap();
        assert_eq!(pool.last_error(), None);
        pool.free(ptr.as_ptr());
    }

    #[test]
    fn empty_pool_cannot_allocate() {
        let pool = SentinelPool::builder().build();

        assert_eq!(pool.allocate(request(1)), Err(PoolError::NoMemory));
        assert!(pool.is_empty());
    }
}
