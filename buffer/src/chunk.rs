//! Value-like views into managed buffers.

use crate::dtype::DType;
use crate::managed::ManagedBuffer;
use crate::shared::SharedBuffer;

/// A view of `length` bytes at `address` within a [`ManagedBuffer`].
///
/// Chunks are the currency of the runtime: accumulators queue them, input
/// ports expose them, output ports forward them. A chunk holds a reference
/// to its managed buffer, so the bytes stay valid for the life of the chunk.
/// A chunk with `length == 0` is *empty* but may still pin a buffer.
///
/// Two chunks `f` then `b` are contiguous when `b` starts where `f` ends,
/// either directly or through the alias mapping of a circular buffer.
#[derive(Clone, Default)]
pub struct BufferChunk {
    /// Start address of the viewed bytes.
    pub address: usize,
    /// Number of viewed bytes.
    pub length: usize,
    /// Element type of the contained samples.
    pub dtype: DType,
    /// Count of chained slabs behind `managed` spanned by this view.
    pub next_buffers: usize,
    managed: Option<ManagedBuffer>,
}

impl BufferChunk {
    /// The empty chunk referencing no storage.
    pub fn null() -> BufferChunk {
        BufferChunk::default()
    }

    /// A chunk covering an entire managed slab.
    pub fn from_managed(managed: ManagedBuffer, dtype: DType) -> BufferChunk {
        BufferChunk {
            address: managed.buffer().address(),
            length: managed.buffer().length(),
            dtype,
            next_buffers: 0,
            managed: Some(managed),
        }
    }

    /// True when the chunk references no managed storage.
    pub fn is_null(&self) -> bool {
        self.managed.is_none()
    }

    /// One past the last viewed byte.
    pub fn end(&self) -> usize {
        self.address + self.length
    }

    /// This chunk's start address translated into the second mapping of a
    /// circular buffer, when one exists.
    pub fn alias_address(&self) -> Option<usize> {
        let buffer = self.shared()?;
        buffer.alias().map(|alias| self.address + (alias - buffer.address()))
    }

    /// The managed buffer backing this view.
    pub fn managed(&self) -> Option<&ManagedBuffer> {
        self.managed.as_ref()
    }

    /// The shared region backing this view.
    pub fn shared(&self) -> Option<&SharedBuffer> {
        self.managed.as_ref().map(|m| m.buffer())
    }

    /// Whole elements contained in the view.
    pub fn elements(&self) -> usize {
        self.length / self.dtype.size()
    }

    /// A sub-view of the first `length` bytes, sharing the managed reference.
    pub fn front_view(&self, length: usize) -> BufferChunk {
        assert!(length <= self.length);
        BufferChunk {
            address: self.address,
            length,
            dtype: self.dtype,
            next_buffers: self.next_buffers,
            managed: self.managed.clone(),
        }
    }

    /// The viewed bytes.
    ///
    /// The runtime guarantees the backing mapping outlives the chunk; the
    /// actor's exclusivity contract keeps readers and the single writer of
    /// a region from overlapping.
    pub fn as_slice(&self) -> &[u8] {
        if self.length == 0 {
            return &[];
        }
        debug_assert!(self.managed.is_some());
        unsafe { std::slice::from_raw_parts(self.address as *const u8, self.length) }
    }

    /// The viewed bytes, writable.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        if self.length == 0 {
            return &mut [];
        }
        debug_assert!(self.managed.is_some());
        unsafe { std::slice::from_raw_parts_mut(self.address as *mut u8, self.length) }
    }

    /// True when both chunks are views into the same checkout.
    pub fn same_managed(&self, other: &BufferChunk) -> bool {
        match (&self.managed, &other.managed) {
            (Some(a), Some(b)) => a.same_buffer(b),
            _ => false,
        }
    }
}

impl std::fmt::Debug for BufferChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferChunk")
            .field("address", &format_args!("{:#x}", self.address))
            .field("length", &self.length)
            .field("dtype", &format_args!("{}", self.dtype))
            .field("next_buffers", &self.next_buffers)
            .field("managed", &self.managed.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::{BufferManager, GenericPool};

    #[test]
    fn null_chunk_is_empty() {
        let chunk = BufferChunk::null();
        assert!(chunk.is_null());
        assert_eq!(chunk.length, 0);
        assert!(chunk.as_slice().is_empty());
        assert!(chunk.alias_address().is_none());
    }

    #[test]
    fn contiguity_of_pool_neighbors() {
        let pool = GenericPool::new(2, 64).unwrap();
        let a = pool.pop().unwrap().as_chunk(DType::byte());
        let b = pool.pop().unwrap().as_chunk(DType::byte());
        // Slabs are carved in order from one arena.
        assert_eq!(a.end(), b.address);
        assert!(!a.same_managed(&b));
    }

    #[test]
    fn front_view_shares_checkout() {
        let pool = GenericPool::new(1, 64).unwrap();
        let chunk = pool.pop().unwrap().as_chunk(DType::byte());
        let view = chunk.front_view(16);
        assert_eq!(view.length, 16);
        assert!(view.same_managed(&chunk));
        assert!(pool.empty());
    }
}
