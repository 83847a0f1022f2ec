//! Amalgamation of incoming buffer chunks into contiguous runs.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use sigflow_buffer::{BufferChunk, BufferManager, DType, GenericPool};

use crate::errors::{Error, Result};

/// A queue of buffer chunks with amalgamation and copy-on-require semantics.
///
/// Chunks pushed in arrival order are merged with their predecessors
/// whenever they are contiguous (directly or through a circular alias), so
/// the front of the queue always presents the largest contiguous run
/// available. [`BufferAccumulator::require`] can synthesize a larger front
/// by copying queued heads into a pool buffer when the natural layout falls
/// short.
///
/// The queue is never empty: a sentinel empty chunk stands in when all data
/// has drained.
pub struct BufferAccumulator {
    queue: VecDeque<BufferChunk>,
    bytes_available: usize,
    total_pushed: u64,
    in_pool_buffer: bool,
    pool: RequirePool,
}

impl Default for BufferAccumulator {
    fn default() -> Self {
        BufferAccumulator::new()
    }
}

impl BufferAccumulator {
    /// An empty accumulator holding the sentinel chunk.
    pub fn new() -> BufferAccumulator {
        let mut queue = VecDeque::with_capacity(64);
        queue.push_front(BufferChunk::null());
        BufferAccumulator {
            queue,
            bytes_available: 0,
            total_pushed: 0,
            in_pool_buffer: false,
            pool: RequirePool::default(),
        }
    }

    /// Drops all queued chunks and pool state.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.bytes_available = 0;
        self.total_pushed = 0;
        self.in_pool_buffer = false;
        self.pool.clear();
        self.queue.push_front(BufferChunk::null());
    }

    /// Sum of queued chunk lengths.
    pub fn bytes_available(&self) -> usize {
        self.bytes_available
    }

    /// Total bytes ever pushed; monotonic until [`clear`](Self::clear).
    ///
    /// Consumption never moves this count, so positions derived from it
    /// stay valid across pops: `total_bytes_pushed - bytes_available` is
    /// the all-time consumed prefix.
    pub fn total_bytes_pushed(&self) -> u64 {
        self.total_pushed
    }

    /// The front chunk: the largest contiguous run currently available.
    pub fn front(&self) -> &BufferChunk {
        self.queue.front().expect("accumulator queue is never empty")
    }

    /// Appends a chunk and amalgamates it toward the front.
    pub fn push(&mut self, buffer: BufferChunk) {
        self.bytes_available += buffer.length;
        self.total_pushed += buffer.length as u64;
        debug_assert!(!self.queue.is_empty());

        // Remember the chain so amalgamated upstream spans can be restored
        // as reference-holding entries below.
        let chain_head = buffer.managed().cloned();
        let nexts = buffer.next_buffers;

        // Remove a dummy empty buffer from the front.
        if self.queue.front().map(|f| f.length) == Some(0) && !self.in_pool_buffer {
            self.queue.pop_front();
        }

        self.queue.push_back(buffer);

        if self.queue.len() >= 2 {
            // Move contiguous bytes as far into the front as possible, so
            // the front presents the largest contiguous section.
            for i in (1..self.queue.len()).rev() {
                let (front_part, back_part) = split_pair(&mut self.queue, i);
                let f_end = front_part.end();
                let contiguous =
                    back_part.address == f_end || back_part.alias_address() == Some(f_end);
                if !contiguous {
                    break;
                }
                if back_part.length > 0 && !front_part.same_managed(back_part) {
                    link_chain(front_part, back_part);
                }
                // An alias join carries on in the second mapping, keeping
                // the merged run contiguous in virtual addresses.
                back_part.address = f_end + back_part.length;
                front_part.length += back_part.length;
                back_part.length = 0;
            }

            // A drained back chunk over the same buffer as its predecessor
            // holds no extra reference; drop it outright.
            let last = self.queue.len() - 1;
            if self.queue[last].length == 0 && self.queue[last].same_managed(&self.queue[last - 1]) {
                self.queue.pop_back();
            }
        }

        // The pushed chunk may have been an upstream amalgamation spanning
        // several managed buffers: restore its successors as empty entries
        // so their references survive until consumed.
        let mut node = chain_head;
        for _ in 0..nexts {
            node = node.as_ref().and_then(|managed| managed.next());
            let Some(managed) = node.clone() else { break };
            let mut entry = BufferChunk::from_managed(managed, self.front().dtype);
            entry.length = 0;
            self.queue.push_back(entry);
        }

        debug_assert!(!self.queue.is_empty());
    }

    /// Advances the front of the queue by `num_bytes`.
    ///
    /// The front chunk must hold at least `num_bytes` (callers size pops by
    /// the front's length).
    pub fn pop(&mut self, num_bytes: usize) {
        debug_assert!(self.bytes_available >= num_bytes);
        self.bytes_available -= num_bytes;

        debug_assert!(self.queue.front().map_or(false, |f| f.length >= num_bytes));
        {
            let front = self.queue.front_mut().expect("accumulator queue is never empty");
            front.address += num_bytes;
            front.length -= num_bytes;
        }
        let queue_size = self.queue.len();

        // A pool buffer in front whose remainder is covered by the
        // predecessor span of the next chunk merges into it.
        if self.in_pool_buffer && self.queue.len() > 1 && self.pool_front_absorbed() {
            let front_length = self.queue[0].length;
            self.queue[1].address -= front_length;
            self.queue[1].length += front_length;
            self.queue.pop_front();
        }
        // Drop an emptied front.
        else if self.queue.front().map(|f| f.length) == Some(0) {
            self.queue.pop_front();
        }
        // Past the boundary of the front buffer with a contiguous
        // successor: move the remainder into the successor.
        else if self.queue.len() > 1 {
            let over_bounds = {
                let front = &self.queue[0];
                match front.shared() {
                    Some(shared) => front.address >= shared.end(),
                    None => false,
                }
            };
            if over_bounds && self.queue[0].end() == self.queue[1].address {
                let front_length = self.queue[0].length;
                self.queue[1].address -= front_length;
                self.queue[1].length += front_length;
                self.queue.pop_front();
            }
        }

        if self.in_pool_buffer && queue_size != self.queue.len() {
            self.in_pool_buffer = false;
        }

        // Shed fully consumed reference holders at the front, then restore
        // the sentinel if everything drained.
        while self.queue.front().map(|f| f.length) == Some(0) {
            self.queue.pop_front();
            if self.queue.is_empty() {
                break;
            }
        }
        if self.queue.is_empty() {
            self.queue.push_front(BufferChunk::null());
        }
    }

    /// Guarantees that the front chunk holds at least `min_bytes`, copying
    /// queued heads into a pool buffer when necessary.
    ///
    /// Deferred without effect when the accumulator as a whole holds fewer
    /// than `min_bytes` but the requirement still fits in the front's
    /// underlying buffer (more contiguous bytes may simply arrive).
    pub fn require(&mut self, min_bytes: usize) -> Result<()> {
        debug_assert!(!self.queue.is_empty());

        if self.front().length >= min_bytes {
            return Ok(());
        }

        // Nothing to compact yet.
        if self.bytes_available == 0 {
            return Ok(());
        }

        // Not enough bytes overall, and a single underlying buffer can
        // still satisfy the requirement once more data lands.
        if self.bytes_available < min_bytes && self.queue.len() == 1 {
            let buffer_length = self.front().shared().map_or(0, |shared| shared.length());
            if min_bytes <= buffer_length {
                return Ok(());
            }
        }

        // A smaller pool buffer already in front is absorbed and popped.
        let mut new_buffer = self.pool.get(min_bytes)?;
        new_buffer.dtype = self.front().dtype;
        let mut budget = new_buffer.length;
        new_buffer.length = 0;

        while let Some(front) = self.queue.front_mut() {
            let copy_bytes = budget.min(front.length);
            unsafe {
                std::ptr::copy_nonoverlapping(
                    front.address as *const u8,
                    (new_buffer.address + new_buffer.length) as *mut u8,
                    copy_bytes,
                );
            }
            budget -= copy_bytes;
            new_buffer.length += copy_bytes;

            if front.length == copy_bytes {
                // Drained; its bytes now live in the pool buffer.
                self.queue.pop_front();
                if self.queue.is_empty() {
                    break;
                }
            } else {
                debug_assert_eq!(budget, 0);
                front.length -= copy_bytes;
                front.address += copy_bytes;
                break;
            }
        }

        self.in_pool_buffer = true;
        self.queue.push_front(new_buffer);
        Ok(())
    }

    /// Number of distinct managed buffers referenced by the queue.
    pub fn unique_managed_buffer_count(&self) -> usize {
        let mut set = BTreeSet::new();
        for chunk in &self.queue {
            if let Some(managed) = chunk.managed() {
                set.insert(managed.id());
            }
        }
        set.len()
    }

    fn pool_front_absorbed(&self) -> bool {
        let front = &self.queue[0];
        let next = &self.queue[1];
        match next.shared() {
            Some(shared) => front.length <= next.address - shared.address(),
            None => false,
        }
    }
}

/// Walks `front`'s managed chain and appends `back`'s buffer when absent,
/// bumping the front chunk's spanned-buffer count.
fn link_chain(front: &mut BufferChunk, back: &BufferChunk) {
    let (Some(front_managed), Some(back_managed)) = (front.managed(), back.managed()) else {
        return;
    };
    let mut tail = front_managed.clone();
    loop {
        if tail.same_buffer(back_managed) {
            return; // already chained
        }
        match tail.next() {
            Some(next) => tail = next,
            None => break,
        }
    }
    tail.set_next(back_managed.clone());
    front.next_buffers += 1;
}

/// Splits mutable references to `queue[i - 1]` and `queue[i]`.
fn split_pair(queue: &mut VecDeque<BufferChunk>, i: usize) -> (&mut BufferChunk, &mut BufferChunk) {
    debug_assert!(i >= 1 && i < queue.len());
    // Make the deque a single slice so a split borrow is possible.
    let slice = queue.make_contiguous();
    let (head, tail) = slice.split_at_mut(i);
    (&mut head[i - 1], &mut tail[0])
}

/// A small internal pool backing [`BufferAccumulator::require`].
///
/// Grown on demand with single-slab pools; recycled slabs are found again
/// by size on later requirements.
#[derive(Default)]
struct RequirePool {
    pools: Vec<Arc<GenericPool>>,
}

impl RequirePool {
    fn get(&mut self, num_bytes: usize) -> Result<BufferChunk> {
        for pool in &self.pools {
            if pool.slab_size() >= num_bytes {
                if let Some(buffer) = pool.pop() {
                    return Ok(buffer.as_chunk(DType::byte()));
                }
            }
        }
        let size = num_bytes.next_power_of_two().max(1024);
        let pool = GenericPool::new(1, size).map_err(|err| {
            Error::ResourceExhausted(format!("accumulator pool allocation of {} bytes failed: {}", size, err))
        })?;
        let buffer = pool.pop().expect("fresh pool has one slab");
        self.pools.push(pool);
        Ok(buffer.as_chunk(DType::byte()))
    }

    fn clear(&mut self) {
        self.pools.clear();
    }
}
