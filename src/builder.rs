//! Builder for configuring and constructing a pool.

use std::path::PathBuf;
use std::sync::Arc;

use crate::error::PoolError;
use crate::pool::SentinelPool;
use crate::settings::{ErrorCallback, PoolSettings};
use crate::size_class::{CLASS_COUNT, SizeClass};

/// Builder for creating an instance of [`SentinelPool`].
///
/// Every setting is optional; an unconfigured builder produces an empty pool
/// that rejects every allocation with
/// [`PoolError::NoMemory`](crate::PoolError::NoMemory). Configure capacity by
/// giving one or more size classes a block count.
///
/// # Examples
///
/// ```rust
/// use sentinel_pool::{SentinelPool, SizeClass};
///
/// let pool = SentinelPool::builder()
///     .block_count(SizeClass::B32, 16)
///     .block_count(SizeClass::B1K, 4)
///     .full_overflow_checks(true)
///     .build();
///
/// assert_eq!(pool.total_blocks(SizeClass::B32), 16);
/// assert_eq!(pool.settings().total_size(), 16 * 32 + 4 * 1024);
/// ```
#[must_use]
pub struct SentinelPoolBuilder {
    block_counts: [usize; CLASS_COUNT],
    total_size: Option<usize>,
    threadsafe: bool,
    full_overflow_checks: bool,
    zero_on_allocate: bool,
    dump_path: Option<PathBuf>,
    error_callback: Option<ErrorCallback>,
}

impl std::fmt::Debug for SentinelPoolBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SentinelPoolBuilder")
            .field("block_counts", &self.block_counts)
            .field("total_size", &self.total_size)
            .field("threadsafe", &self.threadsafe)
            .field("full_overflow_checks", &self.full_overflow_checks)
            .field("zero_on_allocate", &self.zero_on_allocate)
            .field("dump_path", &self.dump_path)
            .field("error_callback", &self.error_callback.as_ref().map(|_| "<callback>"))
            .finish()
    }
}

impl SentinelPoolBuilder {
    pub(crate) fn new() -> Self {
        Self {
            block_counts: [0; CLASS_COUNT],
            total_size: None,
            threadsafe: false,
            full_overflow_checks: false,
            zero_on_allocate: false,
            dump_path: None,
            error_callback: None,
        }
    }

    /// Sets the number of blocks of one size class.
    pub fn block_count(mut self, class: SizeClass, count: usize) -> Self {
        self.block_counts[class.index()] = count;
        self
    }

    /// Declares the expected total payload size in bytes.
    ///
    /// Creation always recomputes the total from the block counts; declaring
    /// a disagreeing value still creates the pool but flags it with
    /// [`PoolError::InconsistentSettings`](crate::PoolError::InconsistentSettings).
    /// Leaving this unset skips the consistency check.
    pub fn total_size(mut self, total_size: usize) -> Self {
        self.total_size = Some(total_size);
        self
    }

    /// Marks the pool as intended for cross-thread use. The flag is recorded
    /// in the settings and the region image; operations are serialized
    /// either way.
    pub fn threadsafe(mut self, threadsafe: bool) -> Self {
        self.threadsafe = threadsafe;
        self
    }

    /// Audits every payload byte of affected blocks against the init fill on
    /// allocation, reallocation and free, instead of only the structural
    /// markers. Catches overflows into slack bytes at the cost of scanning
    /// whole blocks.
    pub fn full_overflow_checks(mut self, full_overflow_checks: bool) -> Self {
        self.full_overflow_checks = full_overflow_checks;
        self
    }

    /// Zeroes allocated payload bytes. When disabled, fresh allocations
    /// carry the allocator's fill pattern.
    pub fn zero_on_allocate(mut self, zero_on_allocate: bool) -> Self {
        self.zero_on_allocate = zero_on_allocate;
        self
    }

    /// Enables the error dump file: every published error appends its
    /// message and a full hex dump of the region to this path. A file
    /// already present at the path is deleted when the pool is created.
    pub fn error_dump_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.dump_path = Some(path.into());
        self
    }

    /// Registers a callback invoked synchronously for every published error,
    /// once per error event, before the failing operation returns.
    ///
    /// # Example
    ///
    /// ```rust
    /// use std::num::NonZero;
    ///
    /// use sentinel_pool::{SentinelPool, SizeClass};
    ///
    /// let pool = SentinelPool::builder()
    ///     .block_count(SizeClass::B32, 1)
    ///     .error_callback(|error, message| eprintln!("pool error {error:?}: {message}"))
    ///     .build();
    /// ```
    pub fn error_callback(
        mut self,
        callback: impl Fn(PoolError, &str) + Send + Sync + 'static,
    ) -> Self {
        self.error_callback = Some(Arc::new(callback));
        self
    }

    /// Builds the pool, acquiring and initializing its backing region.
    ///
    /// # Panics
    ///
    /// Panics if the backing region cannot be allocated or its size
    /// calculation overflows `usize`.
    #[must_use]
    pub fn build(self) -> SentinelPool {
        let mut settings = PoolSettings {
            total_size: 0,
            block_counts: self.block_counts,
            threadsafe: self.threadsafe,
            full_overflow_checks: self.full_overflow_checks,
            zero_on_allocate: self.zero_on_allocate,
            dump_path: self.dump_path,
            error_callback: self.error_callback,
        };

        let consistent_settings = settings.sanitize(self.total_size);

        SentinelPool::new_inner(settings, consistent_settings)
    }
}
