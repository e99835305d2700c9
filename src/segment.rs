//! Anonymous shared memory segments backed by Linux memfd.
//!
//! A segment is created with `memfd_create` and mapped `MAP_SHARED`.
//! Other processes attach by inheriting the file descriptor (over `fork`
//! or an `SCM_RIGHTS` message; the channel is up to the embedding
//! application) and mapping it themselves. The kernel reclaims the
//! segment when the last mapping and the last descriptor are gone, which
//! gives the destroy-on-last-detach lifecycle without any explicit
//! removal step.
//!
//! Optionally the segment can be backed by huge pages (`MFD_HUGETLB`),
//! which reduces TLB pressure for large heaps. Huge pages must be
//! reserved at the system level (`/proc/sys/vm/nr_hugepages`); creation
//! fails if the reservation is insufficient.

use crate::error::{Error, Result};
use crate::offset::SegmentBase;
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::fs::MemfdFlags;
use rustix::mm::{MapFlags, ProtFlags};
use std::ffi::CString;
use std::os::unix::io::{AsRawFd, RawFd};
use std::ptr::NonNull;

/// Size of huge pages backing a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HugePageSize {
    /// 2MB huge pages (standard on x86_64).
    Mb2,
    /// 1GB gigantic pages.
    Gb1,
}

impl HugePageSize {
    /// Get the size in bytes.
    pub fn bytes(self) -> usize {
        match self {
            HugePageSize::Mb2 => 2 * 1024 * 1024,
            HugePageSize::Gb1 => 1024 * 1024 * 1024,
        }
    }

    /// memfd flags selecting this page size.
    fn memfd_flags(self) -> MemfdFlags {
        match self {
            HugePageSize::Mb2 => MemfdFlags::HUGETLB | MemfdFlags::HUGE_2MB,
            HugePageSize::Gb1 => MemfdFlags::HUGETLB | MemfdFlags::HUGE_1GB,
        }
    }
}

/// A memory segment shared between processes.
///
/// The mapped base address differs per process; anything stored inside
/// the segment must reference other in-segment structures by offset
/// (see [`SegmentBase`]).
pub struct SharedSegment {
    /// The memfd file descriptor.
    fd: OwnedFd,
    /// Pointer to the mmap'd region.
    ptr: NonNull<u8>,
    /// Size of the segment.
    len: usize,
    /// Optional name (for debugging, visible in `/proc/self/fd/`).
    name: Option<String>,
}

impl SharedSegment {
    /// Create a new shared memory segment.
    ///
    /// # Arguments
    ///
    /// * `name` - Debug name for the segment.
    /// * `size` - Size in bytes. Must be greater than 0. With huge-page
    ///   backing the size is rounded up to the next page boundary.
    /// * `huge` - Optional huge-page backing.
    ///
    /// # Errors
    ///
    /// Returns an error if `memfd_create`, `ftruncate`, or `mmap` fails
    /// (including insufficient huge-page reservation).
    pub fn create(name: &str, size: usize, huge: Option<HugePageSize>) -> Result<Self> {
        if size == 0 {
            return Err(Error::SegmentCreation("size must be greater than 0".into()));
        }

        let len = match huge {
            Some(page) => {
                let page_bytes = page.bytes();
                size.div_ceil(page_bytes) * page_bytes
            }
            None => size,
        };

        let mut flags = MemfdFlags::CLOEXEC;
        if let Some(page) = huge {
            flags |= page.memfd_flags();
        }

        let cname = CString::new(name).map_err(|e| Error::SegmentCreation(e.to_string()))?;
        let fd = rustix::fs::memfd_create(&cname, flags)?;
        rustix::fs::ftruncate(&fd, len as u64)?;

        // SAFETY: mapping a fresh fd of `len` bytes at a kernel-chosen address.
        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )?
        };

        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::SegmentCreation("mmap returned null".into()))?;

        tracing::debug!(name, size = len, huge = ?huge, "created shared segment");

        Ok(Self {
            fd,
            ptr,
            len,
            name: Some(name.to_string()),
        })
    }

    /// Open an existing shared memory segment from a file descriptor.
    ///
    /// This is used by a process that received the fd from the segment's
    /// creator.
    ///
    /// # Safety
    ///
    /// The caller must ensure that `fd` is a valid memfd and that `size`
    /// matches the actual size of the memfd.
    pub unsafe fn from_fd(fd: OwnedFd, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::SegmentCreation("size must be greater than 0".into()));
        }

        // SAFETY: the fd refers to a memfd of `size` bytes per the caller.
        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )?
        };

        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::SegmentCreation("mmap returned null".into()))?;

        Ok(Self {
            fd,
            ptr,
            len: size,
            name: None,
        })
    }

    /// Open an existing shared memory segment from a raw file descriptor.
    ///
    /// Duplicates the fd, so the original remains owned by the caller.
    ///
    /// # Safety
    ///
    /// Same contract as [`from_fd`](Self::from_fd): `fd` must be a valid
    /// memfd of exactly `size` bytes.
    pub unsafe fn from_raw_fd(fd: RawFd, size: usize) -> Result<Self> {
        // SAFETY: the fd is valid for the duration of this call per the caller.
        let dup_fd = rustix::io::fcntl_dupfd_cloexec(unsafe { BorrowedFd::borrow_raw(fd) }, 0)?;
        // SAFETY: forwarded caller contract.
        unsafe { Self::from_fd(dup_fd, size) }
    }

    /// Get the raw file descriptor.
    ///
    /// This number is the segment's identity in the creating process;
    /// send it to another process to let it attach.
    #[inline]
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Pointer to the start of the mapping.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Total size of the segment in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the segment has zero length.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Translation handle for this process's mapping of the segment.
    #[inline]
    pub fn base(&self) -> SegmentBase {
        SegmentBase::new(self.ptr, self.len)
    }

    /// Get the debug name of this segment.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Pre-fault the memory to avoid page faults during use.
    ///
    /// Touches every page so physical memory is allocated up front.
    pub fn prefault(&self) {
        let page_size = 4096;
        let ptr = self.ptr.as_ptr();
        for offset in (0..self.len).step_by(page_size) {
            // SAFETY: offset < len; volatile read to prevent optimization.
            unsafe {
                std::ptr::read_volatile(ptr.add(offset));
            }
        }
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        // SAFETY: unmapping the exact region this segment mapped.
        unsafe {
            let _ = rustix::mm::munmap(self.ptr.as_ptr().cast(), self.len);
        }
        // fd is automatically closed when OwnedFd is dropped
    }
}

// SAFETY: SharedSegment is Send + Sync because:
// - The memory is shared and can be accessed from any thread
// - The fd is reference-counted by the kernel
// - We don't hold any thread-local state
unsafe impl Send for SharedSegment {}
unsafe impl Sync for SharedSegment {}

impl AsFd for SharedSegment {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_creation() {
        let segment = SharedSegment::create("test-segment", 4096, None).unwrap();
        assert_eq!(segment.len(), 4096);
        assert_eq!(segment.name(), Some("test-segment"));
    }

    #[test]
    fn test_segment_zero_size_fails() {
        assert!(SharedSegment::create("test", 0, None).is_err());
    }

    #[test]
    fn test_segment_read_write() {
        let segment = SharedSegment::create("test-rw", 4096, None).unwrap();

        let ptr = segment.as_ptr();
        unsafe {
            std::ptr::write(ptr, 42);
            std::ptr::write(ptr.add(4095), 99);
            assert_eq!(std::ptr::read(ptr), 42);
            assert_eq!(std::ptr::read(ptr.add(4095)), 99);
        }
    }

    #[test]
    fn test_segment_modifications_visible_across_mappings() {
        let segment1 = SharedSegment::create("test-shared", 4096, None).unwrap();

        // Duplicate fd to simulate another process attaching.
        let segment2 = unsafe { SharedSegment::from_raw_fd(segment1.as_raw_fd(), 4096).unwrap() };

        unsafe {
            std::ptr::write(segment1.as_ptr(), 77);
            assert_eq!(std::ptr::read(segment2.as_ptr()), 77);

            std::ptr::write(segment2.as_ptr().add(100), 88);
            assert_eq!(std::ptr::read(segment1.as_ptr().add(100)), 88);
        }
    }

    #[test]
    fn test_segment_prefault() {
        let segment = SharedSegment::create("test-prefault", 1024 * 1024, None).unwrap();
        segment.prefault(); // Should not panic
    }

    #[test]
    fn test_huge_page_size_bytes() {
        assert_eq!(HugePageSize::Mb2.bytes(), 2 * 1024 * 1024);
        assert_eq!(HugePageSize::Gb1.bytes(), 1024 * 1024 * 1024);
    }

    #[test]
    fn test_huge_page_creation_needs_reservation() {
        // Succeeds only when the system has huge pages reserved; either
        // way the call must not panic and a success must be page-rounded.
        if let Ok(segment) = SharedSegment::create("test-huge", 4096, Some(HugePageSize::Mb2)) {
            assert_eq!(segment.len(), HugePageSize::Mb2.bytes());
        }
    }
}
