//! Checked-out buffers that return to their manager on last drop.

use std::sync::{Arc, Mutex, Weak};

use crate::chunk::BufferChunk;
use crate::dtype::DType;
use crate::manager::BufferManager;
use crate::shared::SharedBuffer;

/// A slab checked out of a [`BufferManager`].
///
/// Clones share one reference count. When the last clone drops and the
/// issuing manager is still alive, the slab returns to the manager's free
/// list; when the manager is gone, the storage is simply released.
///
/// Managed buffers can be chained: an accumulator that amalgamates chunks
/// from several slabs records the successors on the front slab so a single
/// chunk can keep every spanned slab alive (see
/// [`BufferChunk::next_buffers`](crate::BufferChunk)).
#[derive(Clone)]
pub struct ManagedBuffer {
    inner: Arc<Inner>,
}

struct Inner {
    buffer: SharedBuffer,
    slab_index: usize,
    manager: Weak<dyn BufferManager>,
    next: Mutex<Option<ManagedBuffer>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Terminal reference: hand the slab back if the issuer survives.
        if let Some(manager) = self.manager.upgrade() {
            manager.push(self.buffer.clone(), self.slab_index);
        }
    }
}

impl ManagedBuffer {
    /// Wraps a shared buffer for checkout accounting.
    pub fn new(buffer: SharedBuffer, slab_index: usize, manager: Weak<dyn BufferManager>) -> Self {
        ManagedBuffer {
            inner: Arc::new(Inner { buffer, slab_index, manager, next: Mutex::new(None) }),
        }
    }

    /// A managed buffer with no manager; its storage is released on last drop.
    pub fn orphan(buffer: SharedBuffer) -> Self {
        ManagedBuffer {
            inner: Arc::new(Inner {
                buffer,
                slab_index: 0,
                manager: Weak::<crate::manager::GenericPool>::new(),
                next: Mutex::new(None),
            }),
        }
    }

    /// The underlying shared region.
    pub fn buffer(&self) -> &SharedBuffer {
        &self.inner.buffer
    }

    /// Position of this slab within its manager's arena.
    pub fn slab_index(&self) -> usize {
        self.inner.slab_index
    }

    /// The issuing manager, if it is still alive.
    pub fn manager(&self) -> Option<Arc<dyn BufferManager>> {
        self.inner.manager.upgrade()
    }

    /// Number of live clones of this checkout.
    pub fn use_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// True when this is the only live clone.
    pub fn unique(&self) -> bool {
        self.use_count() == 1
    }

    /// True when both handles refer to the same checkout.
    pub fn same_buffer(&self, other: &ManagedBuffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Stable identity for debug bookkeeping.
    pub fn id(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }

    /// Records the next contiguous buffer in an amalgamated chain.
    pub fn set_next(&self, next: ManagedBuffer) {
        *self.inner.next.lock().unwrap() = Some(next);
    }

    /// The next contiguous buffer in the chain, if any.
    pub fn next(&self) -> Option<ManagedBuffer> {
        self.inner.next.lock().unwrap().clone()
    }

    /// Clears the contiguity chain.
    pub fn clear_next(&self) {
        *self.inner.next.lock().unwrap() = None;
    }

    /// A chunk covering the whole slab.
    pub fn as_chunk(&self, dtype: DType) -> BufferChunk {
        BufferChunk::from_managed(self.clone(), dtype)
    }
}

impl std::fmt::Debug for ManagedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedBuffer")
            .field("buffer", &self.inner.buffer)
            .field("slab_index", &self.inner.slab_index)
            .field("use_count", &self.use_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::GenericPool;

    #[test]
    fn returns_to_pool_on_last_drop() {
        let pool = GenericPool::new(1, 64).unwrap();
        let buff = pool.pop().unwrap();
        assert!(pool.empty());

        let clone = buff.clone();
        drop(buff);
        assert!(pool.empty()); // a clone is still live
        drop(clone);
        assert!(!pool.empty());
    }

    #[test]
    fn orphan_frees_without_manager() {
        let buff = ManagedBuffer::orphan(SharedBuffer::alloc(64).unwrap());
        assert!(buff.manager().is_none());
        drop(buff);
    }

    #[test]
    fn chain_links() {
        let pool = GenericPool::new(2, 64).unwrap();
        let a = pool.pop().unwrap();
        let b = pool.pop().unwrap();
        a.set_next(b.clone());
        assert!(a.next().unwrap().same_buffer(&b));
        a.clear_next();
        assert!(a.next().is_none());
    }
}
