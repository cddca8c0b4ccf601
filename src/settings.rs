//! Immutable pool creation settings and their in-region wire form.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::PoolError;
use crate::size_class::{CLASS_COUNT, CLASS_SIZES, SizeClass};

/// Capacity of the in-region dump path buffer.
pub(crate) const DUMP_PATH_CAPACITY: usize = 128;

/// Callback invoked synchronously, once per error event, before the failing
/// operation returns.
pub type ErrorCallback = Arc<dyn Fn(PoolError, &str) + Send + Sync>;

/// The settings a pool was created with.
///
/// Settings are fixed at creation time and immutable afterwards; a verbatim
/// copy of the POD portion is embedded in the pool region itself. Obtain the
/// effective settings of a live pool through
/// [`SentinelPool::settings()`](crate::SentinelPool::settings); they can
/// differ from what was requested, because creation recomputes the total
/// size from the per-class block counts.
#[derive(Clone)]
pub struct PoolSettings {
    pub(crate) total_size: usize,
    pub(crate) block_counts: [usize; CLASS_COUNT],
    pub(crate) threadsafe: bool,
    pub(crate) full_overflow_checks: bool,
    pub(crate) zero_on_allocate: bool,
    pub(crate) dump_path: Option<PathBuf>,
    pub(crate) error_callback: Option<ErrorCallback>,
}

impl PoolSettings {
    /// The usable payload capacity of the pool in bytes, summed over all
    /// classes. Recomputed from the block counts at creation.
    #[must_use]
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// The number of blocks configured for one size class.
    #[must_use]
    pub fn block_count(&self, class: SizeClass) -> usize {
        self.block_counts[class.index()]
    }

    /// Whether the pool was requested to serialize operations for cross-thread
    /// use. The pool always serializes its state-touching operations; the
    /// flag is retained verbatim from the creation request.
    #[must_use]
    pub fn threadsafe(&self) -> bool {
        self.threadsafe
    }

    /// Whether every payload byte of affected blocks is audited against the
    /// init fill on allocation, reallocation and free.
    #[must_use]
    pub fn full_overflow_checks(&self) -> bool {
        self.full_overflow_checks
    }

    /// Whether allocated payload bytes are zeroed. When disabled, fresh
    /// allocations carry the init fill pattern, not zeroes.
    #[must_use]
    pub fn zero_on_allocate(&self) -> bool {
        self.zero_on_allocate
    }

    /// The error dump file path, if dumping is enabled.
    #[must_use]
    pub fn dump_path(&self) -> Option<&Path> {
        self.dump_path.as_deref()
    }

    /// Reconciles the settings the way creation does: the total size is
    /// recomputed from the block counts, overwriting `requested_total_size`,
    /// and a pre-existing dump file is deleted. Returns whether the caller's
    /// declared total size (if any) agreed with the recomputed one.
    pub(crate) fn sanitize(&mut self, requested_total_size: Option<usize>) -> bool {
        self.total_size = self
            .block_counts
            .iter()
            .zip(CLASS_SIZES)
            .map(|(&count, size)| {
                count
                    .checked_mul(size)
                    .expect("pool payload size calculation overflows usize")
            })
            .fold(0_usize, |total, class_total| {
                total
                    .checked_add(class_total)
                    .expect("pool payload size calculation overflows usize")
            });

        if let Some(path) = &self.dump_path {
            // Every pool starts with a fresh dump file; deletion failure is
            // not actionable.
            _ = std::fs::remove_file(path);
        }

        requested_total_size.is_none_or(|requested| requested == self.total_size)
    }

    pub(crate) fn to_wire(&self) -> SettingsWire {
        let mut dump_path = [0_u8; DUMP_PATH_CAPACITY];

        if let Some(path) = &self.dump_path {
            let bytes = path.as_os_str().as_encoded_bytes();
            let length = bytes.len().min(DUMP_PATH_CAPACITY);
            dump_path[..length].copy_from_slice(&bytes[..length]);
        }

        SettingsWire {
            total_size: self.total_size,
            block_counts: self.block_counts,
            threadsafe: u8::from(self.threadsafe),
            full_overflow_checks: u8::from(self.full_overflow_checks),
            zero_on_allocate: u8::from(self.zero_on_allocate),
            dump_path,
        }
    }
}

impl fmt::Debug for PoolSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolSettings")
            .field("total_size", &self.total_size)
            .field("block_counts", &self.block_counts)
            .field("threadsafe", &self.threadsafe)
            .field("full_overflow_checks", &self.full_overflow_checks)
            .field("zero_on_allocate", &self.zero_on_allocate)
            .field("dump_path", &self.dump_path)
            .field(
                "error_callback",
                &self.error_callback.as_ref().map(|_| "<callback>"),
            )
            .finish()
    }
}

/// The POD portion of the settings as embedded in the region's settings
/// section. Field order is part of the on-memory format.
#[repr(C)]
#[derive(Clone, Copy)]
#[allow(
    dead_code,
    reason = "the fields exist to be written into the region image; readers consume the raw bytes"
)]
pub(crate) struct SettingsWire {
    pub(crate) total_size: usize,
    pub(crate) block_counts: [usize; CLASS_COUNT],
    pub(crate) threadsafe: u8,
    pub(crate) full_overflow_checks: u8,
    pub(crate) zero_on_allocate: u8,
    pub(crate) dump_path: [u8; DUMP_PATH_CAPACITY],
}
