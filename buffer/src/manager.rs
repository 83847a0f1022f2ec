//! Buffer managers: checkout pools for stream write buffers.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, Weak};

use crate::chunk::BufferChunk;
use crate::dtype::DType;
use crate::managed::ManagedBuffer;
use crate::shared::SharedBuffer;

/// Generic slabs align to the platform cache line.
const SLAB_ALIGNMENT: usize = 64;

/// Invoked after a slab returns to the free list, from whichever thread
/// dropped the last reference. Used by the runtime to re-flag a parked
/// producer when back-pressure releases.
pub type RecycleHook = Arc<dyn Fn() + Send + Sync>;

/// The checkout interface for stream buffers.
///
/// `push` is the automatic return path: the last clone of a
/// [`ManagedBuffer`] may drop on any thread, so implementations guard the
/// free list with an internal lock.
pub trait BufferManager: Send + Sync {
    /// Checks out a free buffer, or `None` when exhausted.
    fn pop(&self) -> Option<ManagedBuffer>;

    /// Returns a slab to the free list. Called when the last reference to a
    /// checkout drops; not normally invoked directly.
    fn push(&self, buffer: SharedBuffer, slab_index: usize);

    /// The chunk currently available for writing; empty when exhausted.
    ///
    /// The returned chunk holds a reference to the head slab without
    /// removing it from the free list.
    fn front(&self) -> BufferChunk;

    /// True when no free buffer is available.
    fn empty(&self) -> bool;

    /// Installs (or clears) the hook run after each recycle.
    fn set_recycle_hook(&self, hook: Option<RecycleHook>);

    /// Usable bytes per slab.
    fn slab_size(&self) -> usize;
}

struct PoolState {
    free: VecDeque<ManagedBuffer>,
    hook: Option<RecycleHook>,
}

/// Fixed-size slabs carved from one cache-line-aligned arena.
pub struct GenericPool {
    slab_size: usize,
    state: Mutex<PoolState>,
    weak: Weak<GenericPool>,
    // Keeps the arena mapped while orphaned slabs are still in flight.
    _arena: SharedBuffer,
}

impl GenericPool {
    /// Allocates `num_buffers` slabs of `buffer_size` usable bytes each.
    pub fn new(num_buffers: usize, buffer_size: usize) -> io::Result<Arc<GenericPool>> {
        assert!(num_buffers > 0 && buffer_size > 0);
        let slab = buffer_size.div_ceil(SLAB_ALIGNMENT) * SLAB_ALIGNMENT;
        let arena = SharedBuffer::alloc(slab * num_buffers)?;
        Ok(Arc::new_cyclic(|weak: &Weak<GenericPool>| {
            let issuer: Weak<dyn BufferManager> = weak.clone();
            let free = (0..num_buffers)
                .map(|index| {
                    let window = arena.window(index * slab, buffer_size);
                    ManagedBuffer::new(window, index, issuer.clone())
                })
                .collect();
            GenericPool {
                slab_size: buffer_size,
                state: Mutex::new(PoolState { free, hook: None }),
                weak: weak.clone(),
                _arena: arena,
            }
        }))
    }
}

impl BufferManager for GenericPool {
    fn pop(&self) -> Option<ManagedBuffer> {
        self.state.lock().unwrap().free.pop_front()
    }

    fn push(&self, buffer: SharedBuffer, slab_index: usize) {
        let hook = {
            let mut state = self.state.lock().unwrap();
            let issuer: Weak<dyn BufferManager> = self.weak.clone();
            state.free.push_back(ManagedBuffer::new(buffer, slab_index, issuer));
            state.hook.clone()
        };
        if let Some(hook) = hook {
            hook();
        }
    }

    fn front(&self) -> BufferChunk {
        match self.state.lock().unwrap().free.front() {
            Some(buff) => buff.as_chunk(DType::byte()),
            None => BufferChunk::null(),
        }
    }

    fn empty(&self) -> bool {
        self.state.lock().unwrap().free.is_empty()
    }

    fn set_recycle_hook(&self, hook: Option<RecycleHook>) {
        self.state.lock().unwrap().hook = hook;
    }

    fn slab_size(&self) -> usize {
        self.slab_size
    }
}

/// Page-granular slabs tiling one double-mapped circular arena.
///
/// The slabs tile the entire ring, so a chunk checked out at the highest
/// slab is alias-contiguous with one checked out at the lowest: consumers
/// amalgamate across the wrap and read straddling spans without a copy.
#[cfg(unix)]
pub struct CircularPool {
    slab_size: usize,
    state: Mutex<PoolState>,
    weak: Weak<CircularPool>,
    _arena: SharedBuffer,
}

#[cfg(unix)]
impl CircularPool {
    /// Allocates `num_buffers` slabs of at least `buffer_size` bytes each
    /// from one circular mapping. Slab sizes round up to the page size so
    /// the slabs tile the ring exactly.
    pub fn new(num_buffers: usize, buffer_size: usize) -> io::Result<Arc<CircularPool>> {
        assert!(num_buffers > 0 && buffer_size > 0);
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let slab = buffer_size.div_ceil(page) * page;
        let arena = SharedBuffer::alloc_circular(slab * num_buffers)?;
        debug_assert_eq!(arena.length(), slab * num_buffers);
        Ok(Arc::new_cyclic(|weak: &Weak<CircularPool>| {
            let issuer: Weak<dyn BufferManager> = weak.clone();
            let free = (0..num_buffers)
                .map(|index| {
                    let window = arena.window(index * slab, slab);
                    ManagedBuffer::new(window, index, issuer.clone())
                })
                .collect();
            CircularPool {
                slab_size: slab,
                state: Mutex::new(PoolState { free, hook: None }),
                weak: weak.clone(),
                _arena: arena,
            }
        }))
    }
}

#[cfg(unix)]
impl BufferManager for CircularPool {
    fn pop(&self) -> Option<ManagedBuffer> {
        self.state.lock().unwrap().free.pop_front()
    }

    fn push(&self, buffer: SharedBuffer, slab_index: usize) {
        let hook = {
            let mut state = self.state.lock().unwrap();
            let issuer: Weak<dyn BufferManager> = self.weak.clone();
            state.free.push_back(ManagedBuffer::new(buffer, slab_index, issuer));
            state.hook.clone()
        };
        if let Some(hook) = hook {
            hook();
        }
    }

    fn front(&self) -> BufferChunk {
        match self.state.lock().unwrap().free.front() {
            Some(buff) => buff.as_chunk(DType::byte()),
            None => BufferChunk::null(),
        }
    }

    fn empty(&self) -> bool {
        self.state.lock().unwrap().free.is_empty()
    }

    fn set_recycle_hook(&self, hook: Option<RecycleHook>) {
        self.state.lock().unwrap().hook = hook;
    }

    fn slab_size(&self) -> usize {
        self.slab_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn pop_until_exhausted() {
        let pool = GenericPool::new(3, 128).unwrap();
        let mut held = Vec::new();
        for _ in 0..3 {
            held.push(pool.pop().unwrap());
        }
        assert!(pool.empty());
        assert!(pool.pop().is_none());
        assert!(pool.front().is_null());

        held.clear();
        assert!(!pool.empty());
        assert_eq!(pool.pop().unwrap().buffer().length(), 128);
    }

    #[test]
    fn front_peeks_without_checkout() {
        let pool = GenericPool::new(1, 64).unwrap();
        let peek = pool.front();
        assert_eq!(peek.length, 64);
        assert!(!pool.empty());
        let popped = pool.pop().unwrap();
        assert!(peek.managed().unwrap().same_buffer(&popped));
    }

    #[test]
    fn recycle_hook_fires_on_return() {
        let pool = GenericPool::new(1, 64).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        pool.set_recycle_hook(Some(Arc::new(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        })));

        let buff = pool.pop().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
        drop(buff);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn recycle_from_foreign_thread() {
        let pool = GenericPool::new(1, 64).unwrap();
        let buff = pool.pop().unwrap();
        std::thread::spawn(move || drop(buff)).join().unwrap();
        assert!(!pool.empty());
    }

    #[cfg(unix)]
    #[test]
    fn circular_slabs_tile_the_ring() {
        let pool = CircularPool::new(2, 100).unwrap();
        let a = pool.pop().unwrap();
        let b = pool.pop().unwrap();
        let dtype = DType::byte();
        let (ca, cb) = (a.as_chunk(dtype), b.as_chunk(dtype));

        // In-order contiguity, and wrap contiguity through the alias.
        assert_eq!(ca.end(), cb.address);
        assert_eq!(ca.alias_address().unwrap(), cb.end());
    }
}
