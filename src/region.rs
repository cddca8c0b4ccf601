//! Ownership and initialization of the backing region.

use std::alloc::{Layout, alloc, dealloc};
use std::ptr::NonNull;

use crate::block::BlockPtr;
use crate::category::BlockCategory;
use crate::layout::{
    ALIGNMENT, INIT_BYTE, POOL_END_SENTINEL, POOL_START_SENTINEL, RegionPlan, SENTINEL_LEN,
    block_stride,
};
use crate::report::AuxData;
use crate::settings::PoolSettings;
use crate::size_class::{CLASS_COUNT, CLASS_SIZES};

/// The backing region of one pool.
///
/// Owns a single contiguous allocation laid out per [`RegionPlan`] and fully
/// initialized on construction: init fill, both pool sentinels, the settings
/// copy, the category table, the auxiliary data and every stamped block.
///
/// The struct does not create or keep references into the allocation;
/// accessors hand out short-lived views derived from the base pointer, and
/// exclusivity is enforced by the `&mut self` requirements plus the pool-level
/// lock above this type.
#[derive(Debug)]
pub(crate) struct Region {
    /// Base of the owned allocation.
    base: NonNull<u8>,

    /// Section offsets, fixed at creation.
    plan: RegionPlan,

    /// The allocation layout, kept for deallocation.
    alloc_layout: Layout,
}

impl Region {
    /// Allocates and initializes a region for the given settings.
    ///
    /// # Panics
    ///
    /// Panics if the backing allocation fails; allocator OOM is not treated
    /// as a recoverable condition.
    #[must_use]
    pub(crate) fn new(settings: &PoolSettings) -> Self {
        let plan = RegionPlan::for_block_counts(&settings.block_counts);

        let alloc_layout = Layout::from_size_align(plan.total_size, ALIGNMENT)
            .expect("region layout is aligned and never approaches isize::MAX");

        // SAFETY: The layout has non-zero size: the plan always includes the
        // control sections and both sentinels.
        let base = NonNull::new(unsafe { alloc(alloc_layout) })
            .expect("we do not intend to handle allocation failure as a real possibility - OOM results in panic");

        let region = Self {
            base,
            plan,
            alloc_layout,
        };

        // SAFETY: The allocation spans plan.total_size bytes.
        unsafe {
            base.as_ptr().write_bytes(INIT_BYTE, plan.total_size);
        }

        // SAFETY: Both sentinel slots are within the allocation; the plan
        // reserves ALIGNMENT bytes at each end and ALIGNMENT == SENTINEL_LEN.
        unsafe {
            base.as_ptr()
                .copy_from_nonoverlapping(POOL_START_SENTINEL.as_ptr(), SENTINEL_LEN);
            base.as_ptr()
                .add(plan.end_sentinel_offset())
                .copy_from_nonoverlapping(POOL_END_SENTINEL.as_ptr(), SENTINEL_LEN);
        }

        // SAFETY: The settings section is within the allocation, aligned to
        // ALIGNMENT which satisfies SettingsWire's alignment.
        unsafe {
            base.as_ptr()
                .add(plan.settings_offset)
                .cast::<crate::settings::SettingsWire>()
                .write(settings.to_wire());
        }

        region.initialize_categories(settings);
        region.initialize_aux(settings);
        region.initialize_blocks();

        region
    }

    fn initialize_categories(&self, settings: &PoolSettings) {
        let mut current_start = self.base_addr() + self.plan.first_block_offset;

        for index in 0..CLASS_COUNT {
            let block_size = CLASS_SIZES[index];
            let total_blocks = settings.block_counts[index];
            let stride = block_stride(block_size);

            let entry = if total_blocks > 0 {
                let last_address = current_start + (total_blocks - 1) * stride;
                BlockCategory {
                    start_address: current_start,
                    first_free_address: current_start,
                    last_free_address: last_address,
                    last_address,
                    block_size,
                    total_blocks,
                    occupied_blocks: 0,
                }
            } else {
                BlockCategory {
                    start_address: 0,
                    first_free_address: 0,
                    last_free_address: 0,
                    last_address: 0,
                    block_size,
                    total_blocks: 0,
                    occupied_blocks: 0,
                }
            };

            // SAFETY: category_entry_ptr stays within the category section
            // for index < CLASS_COUNT, and the section is properly aligned.
            unsafe {
                self.category_entry_ptr(index).write(entry);
            }

            current_start += total_blocks * stride;
        }
    }

    fn initialize_aux(&self, settings: &PoolSettings) {
        let aux = AuxData {
            lock_word: 0,
            lock_initialized: usize::from(settings.threadsafe),
            last_error: 0,
            message: [0; crate::report::ERROR_MESSAGE_CAPACITY],
        };

        // SAFETY: The aux section is within the allocation, aligned to
        // ALIGNMENT which satisfies AuxData's alignment.
        unsafe {
            self.aux_ptr().write(aux);
        }
    }

    fn initialize_blocks(&self) {
        for index in 0..CLASS_COUNT {
            let category = self.category(index);
            if category.total_blocks == 0 {
                continue;
            }

            for block_index in 0..category.total_blocks {
                let address = category.start_address + block_index * category.stride();

                // SAFETY: The address is a block start within this arena by
                // construction of the category entry.
                let block = unsafe { self.block_at(address) };

                block.stamp_start_sentinel();
                block.stamp_end_sentinel(category.block_size);
                block.reset_counters();
            }
        }
    }

    /// The region base address.
    #[must_use]
    pub(crate) fn base_addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    #[must_use]
    pub(crate) fn plan(&self) -> &RegionPlan {
        &self.plan
    }

    /// Whether the region still begins with the pool-start sentinel.
    #[must_use]
    pub(crate) fn pool_sentinel_ok(&self) -> bool {
        // SAFETY: The first SENTINEL_LEN bytes are within the allocation.
        let head = unsafe { std::slice::from_raw_parts(self.base.as_ptr(), SENTINEL_LEN) };
        head == POOL_START_SENTINEL
    }

    /// The whole region as bytes, for dump rendering.
    #[must_use]
    pub(crate) fn as_bytes(&self) -> &[u8] {
        // SAFETY: The allocation spans plan.total_size initialized bytes and
        // is uniquely reachable through this region while the reference
        // lives (callers hold the pool lock).
        unsafe { std::slice::from_raw_parts(self.base.as_ptr(), self.plan.total_size) }
    }

    fn category_entry_ptr(&self, index: usize) -> *mut BlockCategory {
        assert!(
            index < CLASS_COUNT,
            "category index {index} out of bounds ({CLASS_COUNT} classes)"
        );

        // SAFETY: The category section holds CLASS_COUNT entries and index is
        // bounds-checked above.
        unsafe {
            self.base
                .as_ptr()
                .add(self.plan.categories_offset)
                .cast::<BlockCategory>()
                .add(index)
        }
    }

    /// Reads one category table entry.
    #[must_use]
    pub(crate) fn category(&self, index: usize) -> BlockCategory {
        // SAFETY: The entry was initialized in new() and the pointer is in
        // bounds and aligned per category_entry_ptr().
        unsafe { self.category_entry_ptr(index).read() }
    }

    /// Writes one category table entry back.
    pub(crate) fn store_category(&mut self, index: usize, entry: &BlockCategory) {
        // SAFETY: Same bounds as category(); &mut self guarantees exclusive
        // region access.
        unsafe {
            self.category_entry_ptr(index).write(*entry);
        }
    }

    /// Address of one category table entry, for error reporting.
    #[must_use]
    pub(crate) fn category_addr(&self, index: usize) -> usize {
        self.category_entry_ptr(index) as usize
    }

    fn aux_ptr(&self) -> *mut AuxData {
        // SAFETY: The aux section is within the allocation and aligned.
        unsafe { self.base.as_ptr().add(self.plan.aux_offset).cast::<AuxData>() }
    }

    #[must_use]
    pub(crate) fn aux(&self) -> &AuxData {
        // SAFETY: Initialized in new(); shared access is serialized by the
        // pool lock above this type.
        unsafe { &*self.aux_ptr() }
    }

    pub(crate) fn aux_mut(&mut self) -> &mut AuxData {
        // SAFETY: Initialized in new(); &mut self guarantees exclusivity.
        unsafe { &mut *self.aux_ptr() }
    }

    /// A block view at `address`.
    ///
    /// # Safety
    ///
    /// `address` must be a block start position of one of this region's
    /// class arenas.
    #[must_use]
    pub(crate) unsafe fn block_at(&self, address: usize) -> BlockPtr {
        let pointer = NonNull::new(address as *mut u8)
            .expect("block addresses in the category table are never null");

        // SAFETY: Forwarded from the caller: address is a block start within
        // one of this region's arenas.
        unsafe { BlockPtr::from_start(pointer) }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        // The whole region is scrubbed before release.
        //
        // SAFETY: The allocation is still live here and spans total_size
        // bytes; it was allocated with alloc_layout in new().
        unsafe {
            self.base.as_ptr().write_bytes(0, self.plan.total_size);
            dealloc(self.base.as_ptr(), self.alloc_layout);
        }
    }
}

// SAFETY: Region owns its allocation outright; the raw base pointer is not
// shared outside the pool that wraps this region, and all access is gated by
// the pool's lock. Moving the region between threads moves sole ownership.
unsafe impl Send for Region {}
