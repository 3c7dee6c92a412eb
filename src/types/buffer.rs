//! Ownership-tagged sample buffers.
//!
//! A [`SampleBuffer`] is a contiguous run of elements backed either by
//! process-local memory (exclusively owned, freed on last drop of the
//! `Arc`) or by a shared-memory allocation whose deallocation is delegated
//! to the heap's refcount, safe to release from whichever process holds
//! the last reference.
//!
//! Slicing is zero-copy: a slice shares the backing storage and adjusts
//! its window.

use std::sync::Arc;

use super::element::Element;

#[cfg(unix)]
use crate::transport::shm::heap::ShmBlock;

#[derive(Clone)]
enum Repr<T: Element> {
    Owned(Arc<[T]>),
    #[cfg(unix)]
    Shared(Arc<ShmBlock>),
}

/// A contiguous, immutable, cheaply cloneable buffer of stream elements.
#[derive(Clone)]
pub struct SampleBuffer<T: Element> {
    repr: Repr<T>,
    /// Window start, in elements, from the backing storage base
    start: usize,
    /// Window length in elements
    len: usize,
}

impl<T: Element> SampleBuffer<T> {
    /// An empty buffer.
    pub fn empty() -> Self {
        SampleBuffer { repr: Repr::Owned(Arc::from(Vec::new())), start: 0, len: 0 }
    }

    /// Take ownership of a vector of elements.
    pub fn from_vec(data: Vec<T>) -> Self {
        let len = data.len();
        SampleBuffer { repr: Repr::Owned(Arc::from(data)), start: 0, len }
    }

    /// Copy a slice of elements into a new owned buffer.
    pub fn from_slice(data: &[T]) -> Self {
        SampleBuffer::from_vec(data.to_vec())
    }

    /// Wrap a resolved shared-memory block. The block's byte length must
    /// be a whole multiple of the element size and its payload must be
    /// aligned for `T`; the receive path guarantees both (copying out when
    /// the source is misaligned).
    #[cfg(unix)]
    pub(crate) fn from_shm(block: Arc<ShmBlock>) -> Self {
        let elem = std::mem::size_of::<T>();
        debug_assert_eq!(block.byte_len() % elem.max(1), 0);
        debug_assert_eq!(block.payload_ptr() as usize % std::mem::align_of::<T>(), 0);
        let len = block.byte_len() / elem.max(1);
        SampleBuffer { repr: Repr::Shared(block), start: 0, len }
    }

    /// Number of elements in the window.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// View the window as an element slice.
    pub fn as_slice(&self) -> &[T] {
        match &self.repr {
            Repr::Owned(data) => &data[self.start..self.start + self.len],
            #[cfg(unix)]
            Repr::Shared(block) => {
                // SAFETY: from_shm validated length and alignment; the
                // block keeps the mapping alive for our lifetime and the
                // payload is immutable after transfer
                unsafe {
                    let base = block.payload_ptr() as *const T;
                    std::slice::from_raw_parts(base.add(self.start), self.len)
                }
            }
        }
    }

    /// Zero-copy sub-window `[start, end)` relative to this window.
    ///
    /// # Panics
    /// Panics if `start > end` or `end > len`, like slice indexing.
    pub fn slice(&self, start: usize, end: usize) -> SampleBuffer<T> {
        assert!(start <= end && end <= self.len, "slice [{start}, {end}) out of range");
        SampleBuffer { repr: self.repr.clone(), start: self.start + start, len: end - start }
    }

    /// Whether the backing storage lives in process-shared memory.
    pub fn is_shared(&self) -> bool {
        match &self.repr {
            Repr::Owned(_) => false,
            #[cfg(unix)]
            Repr::Shared(_) => true,
        }
    }

    /// For shared buffers, the portable memory reference of the backing
    /// allocation plus the byte offset from its payload base to this
    /// window's first element.
    #[cfg(unix)]
    pub fn shm_location(&self) -> Option<(&crate::transport::shm::heap::MemoryRef, usize)> {
        match &self.repr {
            Repr::Owned(_) => None,
            Repr::Shared(block) => Some((
                block.memory_ref(),
                block.window_offset() as usize + self.start * std::mem::size_of::<T>(),
            )),
        }
    }

    /// The backing shared block, when there is one.
    #[cfg(unix)]
    pub(crate) fn shm_block(&self) -> Option<&Arc<ShmBlock>> {
        match &self.repr {
            Repr::Owned(_) => None,
            Repr::Shared(block) => Some(block),
        }
    }
}

impl<T: Element> std::ops::Deref for SampleBuffer<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.as_slice()
    }
}

impl<T: Element> std::fmt::Debug for SampleBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleBuffer")
            .field("len", &self.len)
            .field("shared", &self.is_shared())
            .finish()
    }
}

impl<T: Element> From<Vec<T>> for SampleBuffer<T> {
    fn from(data: Vec<T>) -> Self {
        SampleBuffer::from_vec(data)
    }
}
