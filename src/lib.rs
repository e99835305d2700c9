//! # shmheap
//!
//! A buddy allocator over an anonymous process-shared memory segment.
//!
//! The segment is created with `memfd_create` and mapped `MAP_SHARED`;
//! cooperating processes attach by inheriting the file descriptor. All
//! in-segment references are base-relative offsets, so every process
//! sees the same structure no matter where its mapping landed, and a
//! single process-shared mutex inside the segment serializes all
//! allocator operations.
//!
//! ## Features
//!
//! - **Buddy allocation**: power-of-two chunks from 64 bytes to 2GiB,
//!   split on demand and coalesced on release
//! - **Cross-process**: offset-linked free lists, `PTHREAD_PROCESS_SHARED`
//!   locking, attach-by-fd with header validation
//! - **Linux-optimized**: memfd segments, optional huge-page backing
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use shmheap::SharedHeap;
//!
//! // Create a 64MB heap.
//! let heap = SharedHeap::create(64 * 1024 * 1024, None)?;
//!
//! // Allocate and release.
//! let p = heap.alloc(4096).expect("heap not exhausted");
//! unsafe { heap.free(p.as_ptr()) };
//!
//! // Hand heap.raw_fd() to a child process; it attaches with
//! // SharedHeap::from_raw_fd and allocates from the same segment.
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod error;
pub mod heap;
pub mod list;
pub mod offset;
pub mod segment;
pub mod sync;

pub use error::{Error, Result};
pub use heap::{ClassStats, HeapStats, SharedHeap, MAX_CLASS, MIN_CLASS};
pub use segment::{HugePageSize, SharedSegment};
