//! Error types for shmheap.

use thiserror::Error;

/// Result type alias using shmheap's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for shmheap operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Segment creation failed (memfd, ftruncate, or mmap).
    #[error("segment creation failed: {0}")]
    SegmentCreation(String),

    /// An attached segment did not validate (wrong magic, version, or size).
    #[error("invalid segment: {0}")]
    InvalidSegment(String),

    /// A process-shared lock could not be initialized.
    #[error("lock initialization failed: {0}")]
    LockInit(rustix::io::Errno),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}
