//! Buddy allocator over a process-shared memory segment.
//!
//! The segment is managed as chunks whose sizes are powers of two,
//! indexed by a size class (the base-2 logarithm of the chunk size).
//! Class constants span [`MIN_CLASS`] (64-byte chunks) through
//! [`MAX_CLASS`] (2GiB chunks). The segment header at offset 0 holds a
//! free list per class, advisory counters, and the process-shared mutex
//! that serializes every operation.
//!
//! # In-segment layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ HeapHeader (offset 0)                                        │
//! │   magic, version, segment_id, segment_size, data_offset      │
//! │   free_list[0..=31]  (offset-linked list heads)              │
//! │   num_active[0..=31], num_free[0..=31]                       │
//! │   lock (PTHREAD_PROCESS_SHARED mutex)                        │
//! ├──────────────────────────────────────────────────────────────┤
//! │ chunks from data_offset .. segment_size,                     │
//! │ each 1 << class bytes, aligned to its own size               │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each chunk begins with a one-byte class, a one-byte state, and an
//! intrusive [`ListNode`]. A free chunk is linked into its class's free
//! list through that node; an allocated chunk's payload begins at the
//! node's address, so the pointer handed to the caller is stable across
//! the chunk's free/active transitions.
//!
//! Allocation pops the head of the class's free list, splitting a larger
//! chunk recursively when the list is empty. Release walks the buddy
//! chain (the buddy of the chunk at offset `o` of class `c` is at
//! `o ^ (1 << c)`), re-merging as long as the buddy is a free chunk of
//! the same class.
//!
//! # Cross-process use
//!
//! Every link in the segment is an offset, so any process that maps the
//! segment (see [`SharedHeap::from_fd`]) sees the same structure no
//! matter where the mapping landed. All operations, including the
//! diagnostic snapshots, run under the in-segment mutex.

use crate::error::{Error, Result};
use crate::list::ListNode;
use crate::offset::SegmentBase;
use crate::segment::{HugePageSize, SharedSegment};
use crate::sync;
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use std::fmt;
use std::mem::{offset_of, size_of};
use std::os::unix::io::RawFd;
use std::ptr::{self, NonNull};

/// Smallest size class: 64-byte chunks.
pub const MIN_CLASS: u32 = 6;

/// Largest size class: 2GiB chunks.
pub const MAX_CLASS: u32 = 31;

/// Number of per-class slots in the header arrays.
pub const CLASS_COUNT: usize = MAX_CLASS as usize + 1;

/// Size in bytes of the smallest chunk.
pub const MIN_CHUNK: u64 = 1 << MIN_CLASS;

/// Magic number identifying an initialized heap header.
const HEAP_MAGIC: u64 = 0x53484D4845415031; // "SHMHEAP1" in ASCII

/// Current heap format version.
const HEAP_VERSION: u32 = 1;

/// Header at offset 0 of the segment. Single instance per segment.
#[repr(C)]
struct HeapHeader {
    /// Magic number for validation on attach.
    magic: u64,
    /// Format version.
    version: u32,
    /// The creator's file descriptor for the segment.
    segment_id: RawFd,
    /// Total segment size in bytes.
    segment_size: u64,
    /// First usable offset; chunks live in `[data_offset, segment_size)`.
    data_offset: u64,
    /// Per-class free list heads. Only `MIN_CLASS..=MAX_CLASS` are used.
    free_list: [ListNode; CLASS_COUNT],
    /// Count of allocated chunks per class (advisory).
    num_active: [u32; CLASS_COUNT],
    /// Count of free chunks per class (advisory).
    num_free: [u32; CLASS_COUNT],
    /// Process-shared mutex serializing every heap operation.
    lock: libc::pthread_mutex_t,
}

/// Chunk states (stored in the chunk header state byte).
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChunkState {
    /// Chunk is linked on its class's free list.
    Free = 0,
    /// Chunk is allocated and owned by the caller.
    Active = 1,
}

/// Header at the front of every chunk.
///
/// The payload handed to callers begins at `link`; when the chunk is
/// free the same bytes hold the free-list node. The class and state
/// bytes before it stay maintained for the chunk's whole life.
#[repr(C)]
struct ChunkHeader {
    /// The chunk's size class; chunk size is `1 << mclass`.
    mclass: u8,
    /// `ChunkState` as a raw byte. Shared memory can hold anything, so
    /// the byte is decoded defensively instead of being typed `bool`.
    state: u8,
    /// Free-list node, and the start of the caller payload.
    link: ListNode,
}

impl ChunkHeader {
    /// True unless the state byte says `Free`. An out-of-range byte
    /// reads as active, which keeps the coalescer off corrupt chunks.
    #[inline]
    fn is_active(&self) -> bool {
        self.state != ChunkState::Free as u8
    }
}

/// Bytes of chunk header before the payload: the offset of the link
/// field. A class-`c` chunk carries `(1 << c) - CHUNK_HEADER_BYTES`
/// bytes of payload.
const CHUNK_HEADER_BYTES: u64 = offset_of!(ChunkHeader, link) as u64;

/// Position of the highest set bit, 1-based; 0 for a zero value.
#[inline]
fn fls(value: u64) -> u32 {
    64 - value.leading_zeros()
}

/// Recover a chunk header from its embedded list node (which is also the
/// payload address handed to callers).
///
/// # Safety
///
/// `node` must be the `link` field of a live chunk header.
#[inline]
unsafe fn chunk_of(node: *mut ListNode) -> *mut ChunkHeader {
    // SAFETY: the link field sits CHUNK_HEADER_BYTES into the chunk.
    unsafe {
        node.cast::<u8>()
            .sub(CHUNK_HEADER_BYTES as usize)
            .cast::<ChunkHeader>()
    }
}

/// Smallest class whose chunk can hold `size` payload bytes plus the
/// chunk header, or `None` when the request exceeds the largest class.
fn class_for_request(size: usize) -> Option<u32> {
    let need = (size as u64).checked_add(CHUNK_HEADER_BYTES)?;
    let class = fls(need - 1).max(MIN_CLASS);
    if class > MAX_CLASS {
        return None;
    }
    Some(class)
}

/// First usable offset past the header: one power of two above the
/// highest bit of the header size, never below the minimum chunk size.
/// This can leave slack between the header and the first chunk; every
/// chunk offset stays naturally aligned and clear of the header.
fn bootstrap_offset() -> u64 {
    let past_header = 1u64 << (fls(size_of::<HeapHeader>() as u64) + 1);
    past_header.max(MIN_CHUNK)
}

/// A buddy-allocated heap inside a [`SharedSegment`].
///
/// The handle is a per-process view: several handles (in one process or
/// many) may map the same segment and allocate concurrently; the
/// in-segment mutex serializes them. Allocation returns `None` when no
/// chunk can be produced; there is no waiting for memory.
///
/// # Example
///
/// ```rust,ignore
/// use shmheap::SharedHeap;
///
/// let heap = SharedHeap::create(1024 * 1024, None)?;
/// let p = heap.alloc(100).expect("heap not exhausted");
/// // ... hand p (or heap.offset_of(p.as_ptr())) to a peer process ...
/// unsafe { heap.free(p.as_ptr()) };
/// ```
pub struct SharedHeap {
    /// The mapped segment; the heap header lives at its base.
    segment: SharedSegment,
}

impl SharedHeap {
    /// Create a segment of `size` bytes and initialize a heap in it.
    ///
    /// # Arguments
    ///
    /// * `size` - Segment size in bytes. Must leave room for the header
    ///   plus at least one minimum-size chunk.
    /// * `huge` - Optional huge-page backing for the segment.
    ///
    /// # Errors
    ///
    /// Fails when the segment cannot be created (see
    /// [`SharedSegment::create`]), when `size` is too small to carve a
    /// single chunk, or when the shared mutex cannot be initialized.
    pub fn create(size: usize, huge: Option<HugePageSize>) -> Result<Self> {
        Self::with_name("shmheap", size, huge)
    }

    /// Create a heap whose segment carries a debug name.
    pub fn with_name(name: &str, size: usize, huge: Option<HugePageSize>) -> Result<Self> {
        let data_offset = bootstrap_offset();
        if (size as u64) < data_offset + MIN_CHUNK {
            return Err(Error::SegmentCreation(format!(
                "segment of {size} bytes cannot hold the header and one {MIN_CHUNK}-byte chunk"
            )));
        }

        let segment = SharedSegment::create(name, size, huge)?;
        let heap = Self { segment };
        heap.bootstrap(data_offset)?;

        tracing::debug!(
            name,
            size = heap.segment.len(),
            data_offset,
            "created shared heap"
        );
        Ok(heap)
    }

    /// Attach a heap that another process created, from an inherited
    /// file descriptor. The header is validated before the heap is
    /// usable.
    ///
    /// # Safety
    ///
    /// `fd` must refer to a memfd of exactly `size` bytes that holds a
    /// live heap (created by [`SharedHeap::create`] and not torn down).
    pub unsafe fn from_fd(fd: OwnedFd, size: usize) -> Result<Self> {
        // SAFETY: forwarded caller contract.
        let segment = unsafe { SharedSegment::from_fd(fd, size)? };
        let heap = Self { segment };
        heap.validate()?;
        tracing::debug!(size, "attached shared heap");
        Ok(heap)
    }

    /// Attach from a raw file descriptor, duplicating it first.
    ///
    /// # Safety
    ///
    /// Same contract as [`from_fd`](Self::from_fd).
    pub unsafe fn from_raw_fd(fd: RawFd, size: usize) -> Result<Self> {
        // SAFETY: forwarded caller contract.
        let segment = unsafe { SharedSegment::from_raw_fd(fd, size)? };
        let heap = Self { segment };
        heap.validate()?;
        tracing::debug!(size, "attached shared heap");
        Ok(heap)
    }

    /// Allocate at least `size` bytes from the heap.
    ///
    /// Returns a pointer into the segment, or `None` when no chunk of a
    /// suitable class can be produced even by splitting: either the
    /// request exceeds the largest class or the heap is exhausted. A
    /// zero-byte request allocates a minimum-class chunk.
    pub fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        let class = class_for_request(size)?;
        let base = self.base();
        let hdr = self.header();

        // SAFETY: the header was initialized at create/attach; all
        // segment state below is read and written under the lock.
        unsafe {
            let _guard = sync::lock(ptr::addr_of_mut!((*hdr).lock));

            if !self.refill(class) {
                return None;
            }
            let head = self.free_head(class);
            debug_assert!(!ListNode::is_empty(base, head));

            let node = ListNode::first(base, head);
            let chunk = chunk_of(node);
            debug_assert_eq!((*chunk).mclass as u32, class);
            debug_assert!(!(*chunk).is_active());

            ListNode::remove(base, node);
            (*chunk).state = ChunkState::Active as u8;
            (*hdr).num_free[class as usize] -= 1;
            (*hdr).num_active[class as usize] += 1;

            NonNull::new(node.cast::<u8>())
        }
    }

    /// Return a chunk to the heap, coalescing it with its buddy as long
    /// as the buddy is a free chunk of the same class.
    ///
    /// Freeing a null pointer is a no-op.
    ///
    /// # Safety
    ///
    /// A non-null `ptr` must have been returned by [`alloc`](Self::alloc)
    /// on a heap mapping this same segment, and must not have been freed
    /// already.
    pub unsafe fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let base = self.base();
        let hdr = self.header();

        // SAFETY: ptr is a live allocation from this segment per the
        // caller; all segment state is read and written under the lock.
        unsafe {
            let _guard = sync::lock(ptr::addr_of_mut!((*hdr).lock));

            let mut chunk = chunk_of(ptr.cast::<ListNode>());
            let mut class = (*chunk).mclass as u32;
            let mut offset = base.offset_of(chunk);
            debug_assert!((*chunk).is_active(), "free of an inactive chunk");
            debug_assert!((MIN_CLASS..=MAX_CLASS).contains(&class));

            (*chunk).state = ChunkState::Free as u8;
            (*hdr).num_active[class as usize] -= 1;

            while class < MAX_CLASS {
                let buddy_offset = offset ^ (1u64 << class);
                // The header region holds no chunks, and a buddy range
                // that does not fit inside the segment cannot be a chunk
                // of this class.
                if buddy_offset < size_of::<HeapHeader>() as u64 {
                    break;
                }
                if buddy_offset + (1u64 << class) > (*hdr).segment_size {
                    break;
                }
                let buddy = base.addr_of::<ChunkHeader>(buddy_offset);
                if (*buddy).is_active() || (*buddy).mclass as u32 != class {
                    break;
                }

                ListNode::remove(base, ptr::addr_of_mut!((*buddy).link));
                (*hdr).num_free[class as usize] -= 1;

                class += 1;
                offset &= !((1u64 << class) - 1);
                chunk = base.addr_of::<ChunkHeader>(offset);
                (*chunk).mclass = class as u8;
                (*chunk).state = ChunkState::Free as u8;
            }

            ListNode::insert_after(base, self.free_head(class), ptr::addr_of_mut!((*chunk).link));
            (*hdr).num_free[class as usize] += 1;
        }
    }

    /// Translate a pointer into the segment to its offset, for handing
    /// to a process with a different mapping. Null translates to 0.
    #[inline]
    pub fn offset_of(&self, ptr: *const u8) -> u64 {
        self.base().offset_of(ptr)
    }

    /// Translate an offset back to a pointer in this mapping. Offset 0
    /// translates to null.
    ///
    /// # Safety
    ///
    /// A non-zero `offset` must lie within the segment.
    #[inline]
    pub unsafe fn ptr_at(&self, offset: u64) -> *mut u8 {
        // SAFETY: forwarded caller contract.
        unsafe { self.base().addr_of::<u8>(offset) }
    }

    /// The underlying segment.
    #[inline]
    pub fn segment(&self) -> &SharedSegment {
        &self.segment
    }

    /// The local file descriptor for the segment.
    #[inline]
    pub fn raw_fd(&self) -> RawFd {
        self.segment.as_raw_fd()
    }

    /// Total segment size in bytes.
    #[inline]
    pub fn segment_size(&self) -> u64 {
        self.segment.len() as u64
    }

    /// First usable offset; chunks live in `[data_offset, segment_size)`.
    pub fn data_offset(&self) -> u64 {
        let hdr = self.header();
        // SAFETY: written once at bootstrap, never changed after.
        unsafe { ptr::addr_of!((*hdr).data_offset).read() }
    }

    /// The identifier recorded at creation: the creator's file
    /// descriptor for the segment. Only meaningful in the creating
    /// process and its forked children.
    pub fn segment_id(&self) -> RawFd {
        let hdr = self.header();
        // SAFETY: written once at bootstrap, never changed after.
        unsafe { ptr::addr_of!((*hdr).segment_id).read() }
    }

    /// Take a consistent snapshot of the per-class counters.
    ///
    /// The snapshot is taken under the heap lock.
    pub fn stats(&self) -> HeapStats {
        let hdr = self.header();
        // SAFETY: header is initialized; counters are read under the lock.
        unsafe {
            let _guard = sync::lock(ptr::addr_of_mut!((*hdr).lock));
            let mut classes = [ClassStats::default(); CLASS_COUNT];
            for (class, slot) in classes.iter_mut().enumerate() {
                *slot = ClassStats {
                    active: (*hdr).num_active[class],
                    free: (*hdr).num_free[class],
                };
            }
            HeapStats {
                segment_size: (*hdr).segment_size,
                data_offset: (*hdr).data_offset,
                classes,
            }
        }
    }

    /// Snapshot every chunk currently on a free list as `(class, offset)`
    /// pairs, taken under the heap lock. Diagnostic.
    pub fn free_chunks(&self) -> Vec<(u32, u64)> {
        let base = self.base();
        let hdr = self.header();
        // SAFETY: header is initialized; the lists are walked under the
        // lock, and every linked node is a valid free chunk (list
        // invariant).
        unsafe {
            let _guard = sync::lock(ptr::addr_of_mut!((*hdr).lock));
            let mut chunks = Vec::new();
            for class in MIN_CLASS..=MAX_CLASS {
                let head = self.free_head(class);
                let head_offset = base.offset_of(head);
                let mut offset = (*head).next_offset();
                while offset != head_offset {
                    let node = base.addr_of::<ListNode>(offset);
                    chunks.push((class, base.offset_of(chunk_of(node))));
                    offset = (*node).next_offset();
                }
            }
            chunks
        }
    }

    /// The heap header, at the base of the mapping.
    #[inline]
    fn header(&self) -> *mut HeapHeader {
        self.segment.as_ptr().cast()
    }

    /// Translation handle for this mapping.
    #[inline]
    fn base(&self) -> SegmentBase {
        self.segment.base()
    }

    /// The free-list head for `class`.
    ///
    /// # Safety
    ///
    /// The header must be initialized and `class` in range.
    #[inline]
    unsafe fn free_head(&self, class: u32) -> *mut ListNode {
        // SAFETY: per the caller.
        unsafe { ptr::addr_of_mut!((*self.header()).free_list[class as usize]) }
    }

    /// Make sure `free_list[class]` holds at least one chunk, splitting
    /// a larger chunk recursively when it is empty. Returns false when
    /// no chunk of this class can be produced.
    ///
    /// # Safety
    ///
    /// Must be called with the heap lock held.
    unsafe fn refill(&self, class: u32) -> bool {
        let base = self.base();
        let hdr = self.header();
        // SAFETY: lock held per the caller; list nodes are valid free
        // chunks by the list invariant.
        unsafe {
            let head = self.free_head(class);
            if !ListNode::is_empty(base, head) {
                return true;
            }
            if class == MAX_CLASS {
                return false;
            }
            if !self.refill(class + 1) {
                return false;
            }

            // Take the first larger chunk and cut it in half.
            let node = ListNode::first(base, self.free_head(class + 1));
            let lower = chunk_of(node);
            debug_assert_eq!((*lower).mclass as u32, class + 1);
            debug_assert!(!(*lower).is_active());
            ListNode::remove(base, node);
            (*hdr).num_free[class as usize + 1] -= 1;

            let offset = base.offset_of(lower);
            let upper = base.addr_of::<ChunkHeader>(offset + (1u64 << class));
            for half in [lower, upper] {
                (*half).mclass = class as u8;
                (*half).state = ChunkState::Free as u8;
                ListNode::insert_after(base, head, ptr::addr_of_mut!((*half).link));
            }
            (*hdr).num_free[class as usize] += 2;
            true
        }
    }

    /// Write the header and tile the region past it with the largest
    /// naturally-aligned chunks that fit, then arm the shared mutex.
    fn bootstrap(&self, data_offset: u64) -> Result<()> {
        let base = self.base();
        let hdr = self.header();
        let segment_size = self.segment.len() as u64;

        // SAFETY: the segment is fresh and private to this call; nothing
        // else can observe it until create() returns.
        unsafe {
            ptr::addr_of_mut!((*hdr).version).write(HEAP_VERSION);
            ptr::addr_of_mut!((*hdr).segment_id).write(self.segment.as_raw_fd());
            ptr::addr_of_mut!((*hdr).segment_size).write(segment_size);
            ptr::addr_of_mut!((*hdr).data_offset).write(data_offset);

            for class in 0..CLASS_COUNT {
                ListNode::init(base, self.free_head(class as u32));
                (*hdr).num_free[class] = 0;
                (*hdr).num_active[class] = 0;
            }

            let mut offset = data_offset;
            while segment_size - offset >= MIN_CHUNK {
                // Largest class the offset's alignment admits, shrunk
                // until the chunk fits before the end of the segment.
                let mut class = offset.trailing_zeros().min(MAX_CLASS);
                debug_assert!(class >= MIN_CLASS);
                while offset + (1u64 << class) > segment_size {
                    class -= 1;
                }
                if class < MIN_CLASS {
                    break;
                }

                let chunk = base.addr_of::<ChunkHeader>(offset);
                (*chunk).mclass = class as u8;
                (*chunk).state = ChunkState::Free as u8;
                ListNode::insert_after(
                    base,
                    self.free_head(class),
                    ptr::addr_of_mut!((*chunk).link),
                );
                (*hdr).num_free[class as usize] += 1;

                offset += 1u64 << class;
            }

            sync::init_shared_mutex(ptr::addr_of_mut!((*hdr).lock))?;
            ptr::addr_of_mut!((*hdr).magic).write(HEAP_MAGIC);
        }
        Ok(())
    }

    /// Validate an attached segment's header.
    fn validate(&self) -> Result<()> {
        if self.segment.len() < size_of::<HeapHeader>() {
            return Err(Error::InvalidSegment(format!(
                "segment of {} bytes is smaller than the heap header",
                self.segment.len()
            )));
        }
        let hdr = self.header();
        // SAFETY: the segment is at least header-sized; fields are read
        // by value.
        unsafe {
            let magic = ptr::addr_of!((*hdr).magic).read();
            if magic != HEAP_MAGIC {
                return Err(Error::InvalidSegment(format!(
                    "bad magic: expected {HEAP_MAGIC:#x}, got {magic:#x}"
                )));
            }
            let version = ptr::addr_of!((*hdr).version).read();
            if version != HEAP_VERSION {
                return Err(Error::InvalidSegment(format!(
                    "unsupported version: expected {HEAP_VERSION}, got {version}"
                )));
            }
            let segment_size = ptr::addr_of!((*hdr).segment_size).read();
            if segment_size != self.segment.len() as u64 {
                return Err(Error::InvalidSegment(format!(
                    "size mismatch: header says {segment_size}, mapping is {}",
                    self.segment.len()
                )));
            }
        }
        Ok(())
    }
}

impl AsFd for SharedHeap {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.segment.as_fd()
    }
}

/// Per-class counters from a [`HeapStats`] snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassStats {
    /// Allocated chunks of this class.
    pub active: u32,
    /// Chunks of this class on the free list.
    pub free: u32,
}

/// A consistent snapshot of the heap's counters, taken under the lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapStats {
    /// Total segment size in bytes.
    pub segment_size: u64,
    /// First usable offset.
    pub data_offset: u64,
    /// Counters per class; only `MIN_CLASS..=MAX_CLASS` are ever nonzero.
    pub classes: [ClassStats; CLASS_COUNT],
}

impl HeapStats {
    /// Total bytes in allocated chunks, derived from the counters.
    pub fn total_active_bytes(&self) -> u64 {
        self.classes
            .iter()
            .enumerate()
            .map(|(class, s)| (s.active as u64) << class)
            .sum()
    }

    /// Total bytes on the free lists, derived from the counters.
    pub fn total_free_bytes(&self) -> u64 {
        self.classes
            .iter()
            .enumerate()
            .map(|(class, s)| (s.free as u64) << class)
            .sum()
    }
}

impl fmt::Display for HeapStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "segment size: {}", self.segment_size)?;
        for class in MIN_CLASS..=MAX_CLASS {
            let s = self.classes[class as usize];
            let (scaled, unit) = match class {
                0..=9 => (1u64 << class, "B"),
                10..=19 => (1u64 << (class - 10), "KB"),
                20..=29 => (1u64 << (class - 20), "MB"),
                _ => (1u64 << (class - 30), "GB"),
            };
            writeln!(
                f,
                "{:>4}{:<2}: {:>6} of used, {:>6} of free",
                scaled, unit, s.active, s.free
            )?;
        }
        writeln!(f, "total active: {}", self.total_active_bytes())?;
        writeln!(f, "total free:   {}", self.total_free_bytes())?;
        write!(
            f,
            "total size:   {}",
            self.total_active_bytes() + self.total_free_bytes()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_header_layout() {
        // The payload must begin at the link field, 8 bytes in.
        assert_eq!(CHUNK_HEADER_BYTES, 8);
        assert!(size_of::<ChunkHeader>() as u64 <= MIN_CHUNK);
    }

    #[test]
    fn test_fls_matches_msb_position() {
        assert_eq!(fls(0), 0);
        assert_eq!(fls(1), 1);
        assert_eq!(fls(2), 2);
        assert_eq!(fls(3), 2);
        assert_eq!(fls(63), 6);
        assert_eq!(fls(64), 7);
        assert_eq!(fls(u64::MAX), 64);
    }

    #[test]
    fn test_class_selection() {
        // Zero-byte requests still carry the header.
        assert_eq!(class_for_request(0), Some(MIN_CLASS));
        // Largest payload that fits the smallest chunk.
        assert_eq!(
            class_for_request((MIN_CHUNK - CHUNK_HEADER_BYTES) as usize),
            Some(MIN_CLASS)
        );
        // One byte more spills into the next class.
        assert_eq!(
            class_for_request((MIN_CHUNK - CHUNK_HEADER_BYTES + 1) as usize),
            Some(MIN_CLASS + 1)
        );
        // Exactly one max-class chunk of payload.
        assert_eq!(
            class_for_request(((1u64 << MAX_CLASS) - CHUNK_HEADER_BYTES) as usize),
            Some(MAX_CLASS)
        );
        // Anything needing more than 1 << MAX_CLASS overflows.
        assert_eq!(class_for_request(1usize << MAX_CLASS), None);
        assert_eq!(class_for_request(usize::MAX), None);
    }

    #[test]
    fn test_bootstrap_offset_is_aligned_past_header() {
        let offset = bootstrap_offset();
        assert!(offset.is_power_of_two());
        assert!(offset >= MIN_CHUNK);
        assert!(offset > size_of::<HeapHeader>() as u64);
    }

    #[test]
    fn test_create_rejects_tiny_segment() {
        assert!(SharedHeap::create(64, None).is_err());
        assert!(SharedHeap::create(bootstrap_offset() as usize, None).is_err());
    }

    #[test]
    fn test_alloc_free_smoke() {
        let heap = SharedHeap::with_name("heap-smoke", 1 << 20, None).unwrap();
        let p = heap.alloc(100).expect("fresh heap must satisfy 100 bytes");
        // The payload is writable through the returned pointer.
        unsafe {
            std::ptr::write_bytes(p.as_ptr(), 0xAB, 100);
            heap.free(p.as_ptr());
        }
    }

    #[test]
    fn test_free_null_is_noop() {
        let heap = SharedHeap::with_name("heap-null", 1 << 20, None).unwrap();
        unsafe { heap.free(std::ptr::null_mut()) };
    }

    #[test]
    fn test_stats_display_renders() {
        let heap = SharedHeap::with_name("heap-dump", 1 << 20, None).unwrap();
        let dump = heap.stats().to_string();
        assert!(dump.starts_with("segment size: 1048576"));
        assert!(dump.contains("64B"));
        assert!(dump.contains("total active: 0"));
    }

    #[test]
    fn test_segment_id_is_recorded() {
        let heap = SharedHeap::with_name("heap-id", 1 << 20, None).unwrap();
        assert_eq!(heap.segment_id(), heap.raw_fd());
    }
}
