//! POSIX shared-memory heap: superblock segments with bump allocation.
//!
//! The producing process owns a heap of `shm_open` segments and bump
//! allocates packet payloads out of them. Each allocation carries a
//! cross-process atomic reference count in a 16-byte header directly
//! before its payload; the superblock header counts live allocations so
//! a fully released segment can be recycled instead of growing the heap.
//!
//! Consumers attach read-write to segments on demand through a
//! [`HeapClient`] and release their reference when the receiving buffer
//! drops, so payloads cross the process boundary without a copy.

use std::collections::HashMap;
use std::ffi::CString;
use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use tracing::{debug, trace};

use crate::error::{Result, StreamError};

/// Granularity of heap growth.
const SUPERBLOCK_SIZE: usize = 2 * 1024 * 1024;
/// Reserved at the start of each segment for the superblock header.
const SEGMENT_HEADER: usize = 64;
/// Per-allocation header holding the reference count.
const ALLOC_HEADER: usize = 16;
const ALLOC_ALIGN: usize = 16;

const SEGMENT_MAGIC: u32 = 0x5349_4f48;

#[repr(C)]
struct SegmentHeader {
    magic: u32,
    _pad: u32,
    /// Allocations with a nonzero reference count
    live: AtomicU32,
}

#[repr(C)]
struct AllocHeader {
    refcount: AtomicU32,
    _reserved: [u32; 3],
}

/// Wire-visible location of one shared allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRef {
    pub heap_id: String,
    pub superblock: u32,
    /// Byte offset of the allocation payload within the segment
    pub offset: u32,
}

struct Mapping {
    base: NonNull<u8>,
    len: usize,
}

// The mapping is plain shared memory; all mutation goes through atomics
// or happens before publication.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: base/len came from a successful mmap of this length
        unsafe {
            libc::munmap(self.base.as_ptr().cast(), self.len);
        }
    }
}

fn segment_name(heap_id: &str, index: u32) -> Result<CString> {
    CString::new(format!("/{heap_id}-{index}"))
        .map_err(|_| StreamError::shm("segment name contains an interior nul"))
}

fn map_fd(fd: libc::c_int, len: usize) -> Result<NonNull<u8>> {
    // SAFETY: fd is open and len matches the segment size
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(StreamError::shm_with_source("mmap", io::Error::last_os_error()));
    }
    NonNull::new(ptr.cast()).ok_or_else(|| StreamError::shm("mmap returned null"))
}

pub(crate) struct Superblock {
    mapping: Mapping,
    name: CString,
    owner: bool,
}

impl Superblock {
    fn create(name: CString, len: usize) -> Result<Superblock> {
        // SAFETY: name is a valid C string
        let fd = unsafe {
            libc::shm_open(name.as_ptr(), libc::O_CREAT | libc::O_EXCL | libc::O_RDWR, 0o600)
        };
        if fd < 0 {
            return Err(StreamError::shm_with_source("shm_open", io::Error::last_os_error()));
        }
        // SAFETY: fd is the segment just opened
        let rc = unsafe { libc::ftruncate(fd, len as libc::off_t) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(fd);
                libc::shm_unlink(name.as_ptr());
            }
            return Err(StreamError::shm_with_source("ftruncate", err));
        }
        let base = match map_fd(fd, len) {
            Ok(base) => base,
            Err(err) => {
                unsafe {
                    libc::close(fd);
                    libc::shm_unlink(name.as_ptr());
                }
                return Err(err);
            }
        };
        unsafe { libc::close(fd) };

        let block = Superblock { mapping: Mapping { base, len }, name, owner: true };
        // SAFETY: the mapping is fresh, zeroed, and exclusively ours
        unsafe {
            let header = block.mapping.base.as_ptr().cast::<SegmentHeader>();
            (*header).magic = SEGMENT_MAGIC;
            (*header).live = AtomicU32::new(0);
        }
        Ok(block)
    }

    fn attach(name: CString) -> Result<Superblock> {
        // SAFETY: name is a valid C string
        let fd = unsafe { libc::shm_open(name.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            return Err(StreamError::shm_with_source("shm_open", io::Error::last_os_error()));
        }
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        // SAFETY: fd is open and stat is a valid out-pointer
        let rc = unsafe { libc::fstat(fd, &mut stat) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(StreamError::shm_with_source("fstat", err));
        }
        let len = stat.st_size as usize;
        let base = match map_fd(fd, len) {
            Ok(base) => base,
            Err(err) => {
                unsafe { libc::close(fd) };
                return Err(err);
            }
        };
        unsafe { libc::close(fd) };

        let block = Superblock { mapping: Mapping { base, len }, name, owner: false };
        if len < SEGMENT_HEADER || block.header().magic != SEGMENT_MAGIC {
            return Err(StreamError::shm("attached segment has no valid header"));
        }
        Ok(block)
    }

    fn header(&self) -> &SegmentHeader {
        // SAFETY: every segment is at least SEGMENT_HEADER bytes and the
        // header was initialized at creation
        unsafe { &*self.mapping.base.as_ptr().cast::<SegmentHeader>() }
    }

    fn base(&self) -> *mut u8 {
        self.mapping.base.as_ptr()
    }

    fn len(&self) -> usize {
        self.mapping.len
    }
}

impl Drop for Superblock {
    fn drop(&mut self) {
        if self.owner {
            // SAFETY: we created this name; attached consumers keep their
            // mappings alive past the unlink
            unsafe {
                libc::shm_unlink(self.name.as_ptr());
            }
        }
    }
}

/// One shared allocation (or a byte window into one), reference counted
/// across processes.
pub struct ShmBlock {
    segment: Arc<Superblock>,
    mem: MemoryRef,
    /// Byte offset of the viewed data within the segment
    data_offset: usize,
    byte_len: usize,
}

// Shared-memory pointers; all shared mutation is atomic.
unsafe impl Send for ShmBlock {}
unsafe impl Sync for ShmBlock {}

impl ShmBlock {
    pub(crate) fn byte_len(&self) -> usize {
        self.byte_len
    }

    pub(crate) fn payload_ptr(&self) -> *const u8 {
        // SAFETY: data_offset was bounds checked against the segment
        unsafe { self.segment.base().add(self.data_offset) }
    }

    pub(crate) fn memory_ref(&self) -> &MemoryRef {
        &self.mem
    }

    /// Byte offset of the viewed window within the allocation payload.
    pub(crate) fn window_offset(&self) -> u64 {
        (self.data_offset - self.mem.offset as usize) as u64
    }

    fn alloc_header(&self) -> &AllocHeader {
        // SAFETY: the allocator placed the header ALLOC_HEADER bytes
        // before the payload offset
        unsafe {
            &*self
                .segment
                .base()
                .add(self.mem.offset as usize - ALLOC_HEADER)
                .cast::<AllocHeader>()
        }
    }

    /// Add one reference on behalf of a receiving process.
    pub(crate) fn retain(&self) {
        self.alloc_header().refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop the reference added by [`retain`](Self::retain) after a
    /// failed transfer.
    pub(crate) fn release_transfer(&self) {
        self.release();
    }

    fn release(&self) {
        if self.alloc_header().refcount.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.segment.header().live.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Fill the allocation before it is published. Callers must hold the
    /// only reference.
    pub(crate) fn copy_from_slice(&self, bytes: &[u8]) {
        debug_assert!(bytes.len() <= self.byte_len);
        // SAFETY: the payload is exclusively ours until the block is
        // handed to a transport
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.segment.base().add(self.data_offset),
                bytes.len(),
            );
        }
    }
}

impl Drop for ShmBlock {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for ShmBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmBlock").field("mem", &self.mem).field("len", &self.byte_len).finish()
    }
}

struct Slot {
    segment: Arc<Superblock>,
    index: u32,
    used: usize,
}

struct HeapInner {
    slots: Vec<Slot>,
    next_index: u32,
}

/// Producer-side shared-memory heap.
pub struct ShmHeap {
    id: String,
    inner: Mutex<HeapInner>,
}

impl ShmHeap {
    pub fn new(id: impl Into<String>) -> Self {
        ShmHeap { id: id.into(), inner: Mutex::new(HeapInner { slots: Vec::new(), next_index: 0 }) }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The heap shared by all transports in this process, created on
    /// first use.
    pub fn process_heap() -> Arc<ShmHeap> {
        static HEAP: OnceLock<Arc<ShmHeap>> = OnceLock::new();
        HEAP.get_or_init(|| Arc::new(ShmHeap::new(format!("sampleio-{}", std::process::id()))))
            .clone()
    }

    /// Allocate `nbytes` of shared payload with a reference count of one.
    pub fn allocate(&self, nbytes: usize) -> Result<Arc<ShmBlock>> {
        let need = (ALLOC_HEADER + nbytes + ALLOC_ALIGN - 1) & !(ALLOC_ALIGN - 1);
        let mut inner = self.inner.lock().unwrap();

        let slot_index = self.find_slot(&mut inner, need)?;
        let slot = &mut inner.slots[slot_index];

        let alloc_offset = slot.used;
        let payload_offset = alloc_offset + ALLOC_HEADER;
        // SAFETY: find_slot guaranteed room for the header and payload
        unsafe {
            let header = slot.segment.base().add(alloc_offset).cast::<AllocHeader>();
            (*header).refcount = AtomicU32::new(1);
        }
        slot.segment.header().live.fetch_add(1, Ordering::AcqRel);
        slot.used += need;
        trace!(heap = %self.id, superblock = slot.index, offset = payload_offset, nbytes,
               "allocated shared block");

        Ok(Arc::new(ShmBlock {
            segment: Arc::clone(&slot.segment),
            mem: MemoryRef {
                heap_id: self.id.clone(),
                superblock: slot.index,
                offset: payload_offset as u32,
            },
            data_offset: payload_offset,
            byte_len: nbytes,
        }))
    }

    fn find_slot(&self, inner: &mut HeapInner, need: usize) -> Result<usize> {
        // A segment with no live allocations starts over from the top
        for slot in inner.slots.iter_mut() {
            if slot.used > SEGMENT_HEADER
                && slot.segment.header().live.load(Ordering::Acquire) == 0
            {
                trace!(heap = %self.id, superblock = slot.index, "recycling superblock");
                slot.used = SEGMENT_HEADER;
            }
        }
        for (index, slot) in inner.slots.iter().enumerate() {
            if slot.used + need <= slot.segment.len() {
                return Ok(index);
            }
        }

        let len = (SEGMENT_HEADER + need).max(SUPERBLOCK_SIZE);
        let len = (len + 4095) & !4095;
        let index = inner.next_index;
        let name = segment_name(&self.id, index)?;
        debug!(heap = %self.id, superblock = index, len, "creating superblock");
        let segment = Superblock::create(name, len)?;
        inner.next_index += 1;
        inner.slots.push(Slot { segment: Arc::new(segment), index, used: SEGMENT_HEADER });
        Ok(inner.slots.len() - 1)
    }
}

/// Consumer-side attachment cache for other processes' heaps.
pub struct HeapClient {
    cache: Mutex<HashMap<(String, u32), Arc<Superblock>>>,
}

impl Default for HeapClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapClient {
    pub fn new() -> Self {
        HeapClient { cache: Mutex::new(HashMap::new()) }
    }

    /// Materialize a received memory reference as a readable block.
    /// `window` and `byte_len` select the span of the allocation the
    /// packet actually covers. The sender's transfer reference is
    /// adopted, so dropping the block releases the allocation.
    pub fn resolve(&self, mem: &MemoryRef, window: u64, byte_len: usize) -> Result<Arc<ShmBlock>> {
        let key = (mem.heap_id.clone(), mem.superblock);
        let segment = {
            let mut cache = self.cache.lock().unwrap();
            match cache.get(&key) {
                Some(segment) => Arc::clone(segment),
                None => {
                    let name = segment_name(&mem.heap_id, mem.superblock)?;
                    debug!(heap = %mem.heap_id, superblock = mem.superblock, "attaching segment");
                    let segment = Arc::new(Superblock::attach(name)?);
                    cache.insert(key, Arc::clone(&segment));
                    segment
                }
            }
        };

        let data_offset = mem.offset as usize + window as usize;
        if (mem.offset as usize) < ALLOC_HEADER + SEGMENT_HEADER
            || data_offset + byte_len > segment.len()
        {
            return Err(StreamError::shm("memory reference outside its segment"));
        }
        Ok(Arc::new(ShmBlock { segment, mem: mem.clone(), data_offset, byte_len }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_heap(tag: &str) -> ShmHeap {
        ShmHeap::new(format!("sampleio-{tag}-{}", std::process::id()))
    }

    #[test]
    fn allocate_write_and_resolve_in_process() {
        let heap = test_heap("t1");
        let block = heap.allocate(64).unwrap();
        block.copy_from_slice(&[7u8; 64]);
        block.retain();

        let client = HeapClient::new();
        let resolved = client.resolve(block.memory_ref(), 0, 64).unwrap();
        let data = unsafe { std::slice::from_raw_parts(resolved.payload_ptr(), 64) };
        assert_eq!(data, &[7u8; 64]);
    }

    #[test]
    fn windowed_resolve_sees_the_right_bytes() {
        let heap = test_heap("t2");
        let block = heap.allocate(16).unwrap();
        block.copy_from_slice(&[0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15]);
        block.retain();

        let client = HeapClient::new();
        let resolved = client.resolve(block.memory_ref(), 4, 8).unwrap();
        let data = unsafe { std::slice::from_raw_parts(resolved.payload_ptr(), 8) };
        assert_eq!(data, &[4, 5, 6, 7, 8, 9, 10, 11]);
    }

    #[test]
    fn released_superblock_is_recycled() {
        let heap = test_heap("recycle");
        let first = heap.allocate(1024).unwrap();
        let first_ref = first.memory_ref().clone();
        drop(first);

        let second = heap.allocate(1024).unwrap();
        assert_eq!(second.memory_ref().superblock, first_ref.superblock);
        assert_eq!(second.memory_ref().offset, first_ref.offset, "space was reused");
    }

    #[test]
    fn oversized_allocation_gets_its_own_segment() {
        let heap = test_heap("oversized");
        let big = heap.allocate(3 * 1024 * 1024).unwrap();
        assert_eq!(big.byte_len(), 3 * 1024 * 1024);
    }

    #[test]
    fn resolve_rejects_out_of_bounds_reference() {
        let heap = test_heap("t3");
        let block = heap.allocate(8).unwrap();
        let mut mem = block.memory_ref().clone();
        mem.offset = u32::MAX - 64;
        let client = HeapClient::new();
        assert!(client.resolve(&mem, 0, 8).is_err());
    }

    #[test]
    fn resolve_rejects_reference_into_segment_headers() {
        let heap = test_heap("t4");
        let block = heap.allocate(8).unwrap();
        let mut mem = block.memory_ref().clone();
        mem.offset = 0;
        let client = HeapClient::new();
        assert!(client.resolve(&mem, 0, 8).is_err());
    }
}
