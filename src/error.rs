//! The pool error taxonomy.

use thiserror::Error;

/// Errors reported by pool operations.
///
/// Every error is recovered locally: no operation panics on a corrupted pool
/// or aborts the process. Failing operations return the error and publish it
/// through the pool's last-error slot, the registered error callback and the
/// optional dump file. Overflow errors additionally trigger best-effort
/// restoration of sentinels and counters so that subsequent operations have a
/// chance of succeeding.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
#[non_exhaustive]
pub enum PoolError {
    /// The caller-declared total size disagreed with the per-class block
    /// counts at creation. The pool is still created with the recomputed
    /// total size.
    #[error("the pool settings are inconsistent")]
    InconsistentSettings,

    /// A thread synchronization operation failed.
    #[error("a thread synchronization operation failed")]
    ThreadSync,

    /// An output parameter is not valid.
    #[error("invalid output parameter")]
    OutputParam,

    /// The region does not start with the pool sentinel; the handle no longer
    /// refers to an intact pool.
    #[error("the handle does not point to a valid pool")]
    InvalidPool,

    /// No single block and no contiguous run of one class can serve the
    /// requested size.
    #[error("the pool is full, cannot allocate memory")]
    NoMemory,

    /// A sentinel, counter or slack byte did not have its expected value:
    /// something wrote outside its allocation.
    #[error("memory overflow detected")]
    Overflow,

    /// The block-category table violated its own invariants.
    #[error("inconsistency found in the block management data")]
    InconsistentBlocks,

    /// A pointer parameter does not refer to an allocated block of this pool.
    #[error("invalid pointer input parameter")]
    PointerParam,
}

impl PoolError {
    /// Encodes a last-error slot value; `None` (no error) is zero.
    pub(crate) fn to_code(error: Option<Self>) -> usize {
        match error {
            None => 0,
            Some(Self::InconsistentSettings) => 1,
            Some(Self::ThreadSync) => 2,
            Some(Self::OutputParam) => 3,
            Some(Self::InvalidPool) => 4,
            Some(Self::NoMemory) => 5,
            Some(Self::Overflow) => 6,
            Some(Self::InconsistentBlocks) => 7,
            Some(Self::PointerParam) => 8,
        }
    }

    /// Decodes a last-error slot value. Unknown codes decode as no error;
    /// they can only appear if the auxiliary section itself was overwritten.
    pub(crate) fn from_code(code: usize) -> Option<Self> {
        match code {
            1 => Some(Self::InconsistentSettings),
            2 => Some(Self::ThreadSync),
            3 => Some(Self::OutputParam),
            4 => Some(Self::InvalidPool),
            5 => Some(Self::NoMemory),
            6 => Some(Self::Overflow),
            7 => Some(Self::InconsistentBlocks),
            8 => Some(Self::PointerParam),
            _ => None,
        }
    }
}
