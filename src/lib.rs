//! A fixed-capacity, segregated-size memory pool with sentinel-based
//! corruption detection.
//!
//! This crate provides [`SentinelPool`], a user-space allocator that acquires
//! one contiguous backing region up front, partitions it into eight block
//! size classes (32 B through 4 KiB of payload) and serves variable-sized
//! requests out of that region for its whole lifetime. It targets embedded
//! and long-running server workloads where fragmentation, nondeterministic
//! latency and undiagnosed heap corruption from the general-purpose
//! allocator are unacceptable.
//!
//! # Key Features
//!
//! - **Fixed capacity**: the backing region is acquired once and never
//!   grows, shrinks or returns memory to the operating system before drop
//! - **Segregated size classes**: each request is served from the
//!   best-fitting class, or from a contiguous run of smaller blocks merged
//!   into a single span
//! - **O(1) common-path allocation**: each class tracks its free window, so
//!   the usual allocation is a pointer bump plus a short settle scan
//! - **Corruption detection**: fixed 16-byte sentinels guard the region and
//!   every block; damaged markers are detected, reported and restored
//!   best-effort on the next operation touching them
//! - **In-place reallocation**: shrink and grow reuse the current block run
//!   where possible, extending it with adjacent free blocks before falling
//!   back to allocate-copy-free
//! - **Three error sinks**: a per-pool last-error slot, a synchronous error
//!   callback and an append-only hex dump file
//!
//! # Example
//!
//! ```rust
//! use std::num::NonZero;
//!
//! use sentinel_pool::{SentinelPool, SizeClass};
//!
//! let pool = SentinelPool::builder()
//!     .block_count(SizeClass::B32, 8)
//!     .block_count(SizeClass::B256, 2)
//!     .build();
//!
//! // Served from a single 32-byte block.
//! let small = pool.allocate(NonZero::new(24).unwrap()).unwrap();
//!
//! // Too big for one 32-byte block, best served by a 256-byte block.
//! let large = pool.allocate(NonZero::new(200).unwrap()).unwrap();
//! assert_eq!(pool.occupied_blocks(SizeClass::B256), 1);
//!
//! // Grow in place when the neighboring blocks are free.
//! let grown = pool.reallocate(small.as_ptr(), 60).unwrap().unwrap();
//! assert_eq!(grown, small);
//!
//! pool.free(grown.as_ptr());
//! pool.free(large.as_ptr());
//! assert!(pool.is_empty());
//! ```
//!
//! # What this pool is not
//!
//! It is not a drop-in replacement for a general-purpose allocator: a
//! request can only ever be served from blocks of a single class, so it
//! fails with [`PoolError::NoMemory`] when no class can serve it
//! contiguously, even if the summed free capacity across classes would
//! suffice. The largest possible request is bounded by the largest
//! configured class arena.

mod block;
mod builder;
mod category;
mod error;
mod layout;
mod pool;
mod region;
mod report;
mod settings;
mod size_class;

pub use builder::SentinelPoolBuilder;
pub use error::PoolError;
pub use pool::SentinelPool;
pub use settings::{ErrorCallback, PoolSettings};
pub use size_class::SizeClass;
