//! Output ports: write buffers, pending production, and fan-out.

use std::collections::VecDeque;
use std::sync::Arc;

use smallvec::SmallVec;

use sigflow_buffer::{BufferChunk, BufferManager, DType};

use crate::errors::{Error, Result};
use crate::label::Label;
use crate::ports::input::InputShared;
use crate::value::Value;

/// One downstream subscription of an output port.
pub(crate) struct Subscriber {
    pub(crate) shared: Arc<InputShared>,
    /// Uid of the subscribing block, for unsubscription and stats.
    pub(crate) block_uid: u64,
    /// Name of the subscribing input port.
    pub(crate) port: String,
}

/// A block's view of one of its output ports.
///
/// Everything a block does here is deferred: `produce`, `post_label`,
/// `post_message`, and `post_buffer` record intent, and the runtime
/// forwards to subscribers when `work()` returns.
pub struct OutputPort {
    name: String,
    alias: String,
    index: i32,
    dtype: DType,
    domain: String,
    is_signal: bool,
    circular: bool,

    manager: Option<Arc<dyn BufferManager>>,
    buffer: BufferChunk,
    elements: usize,

    pending_elements: usize,
    /// The write buffer is an inlined input buffer for this work call
    /// only.
    substituted: bool,
    /// Labels posted this work call, indices relative to the start of this
    /// call's production.
    pending_labels: SmallVec<[Label; 4]>,
    pending_messages: SmallVec<[Value; 4]>,
    posted_buffers: VecDeque<BufferChunk>,
    read_before_write: Option<usize>,

    total_elements: u64,
    total_messages: u64,

    pub(crate) subscribers: Vec<Subscriber>,
}

impl OutputPort {
    pub(crate) fn new(name: &str, index: i32, dtype: DType, domain: &str, is_signal: bool, circular: bool) -> OutputPort {
        OutputPort {
            name: name.to_owned(),
            alias: name.to_owned(),
            index,
            dtype,
            domain: domain.to_owned(),
            is_signal,
            circular,
            manager: None,
            buffer: BufferChunk::null(),
            elements: 0,
            pending_elements: 0,
            substituted: false,
            pending_labels: SmallVec::new(),
            pending_messages: SmallVec::new(),
            posted_buffers: VecDeque::new(),
            read_before_write: None,
            total_elements: 0,
            total_messages: 0,
            subscribers: Vec::new(),
        }
    }

    /// The string name identifier for this port.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// A displayable name for this port.
    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Sets the displayable alias.
    pub fn set_alias(&mut self, alias: &str) {
        self.alias = alias.to_owned();
    }

    /// The index of this port, or -1 when the name is not an integer.
    pub fn index(&self) -> i32 {
        self.index
    }

    /// The data type of this port.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// The buffer domain of this port.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// True when this port emits signal calls rather than stream data.
    pub fn is_signal(&self) -> bool {
        self.is_signal
    }

    /// True when this port prefers a circular buffer manager.
    pub(crate) fn wants_circular(&self) -> bool {
        self.circular
    }

    /// The current write buffer.
    pub fn buffer(&self) -> &BufferChunk {
        &self.buffer
    }

    /// The current write buffer, for filling in samples.
    pub fn buffer_mut(&mut self) -> &mut BufferChunk {
        &mut self.buffer
    }

    /// Whole elements writable in the current buffer.
    pub fn elements(&self) -> usize {
        self.elements
    }

    /// Total elements produced from this port.
    pub fn total_elements(&self) -> u64 {
        self.total_elements
    }

    /// Total messages posted to this port.
    pub fn total_messages(&self) -> u64 {
        self.total_messages
    }

    /// Produces elements from this port; must not exceed
    /// [`elements`](Self::elements). Forwarding happens when `work()`
    /// returns.
    pub fn produce(&mut self, num_elements: usize) {
        self.pending_elements += num_elements;
    }

    /// Removes bytes from the write buffer without producing them, for
    /// side-band uses of the buffer space.
    pub fn pop_buffer(&mut self, num_bytes: usize) {
        let num_bytes = num_bytes.min(self.buffer.length);
        self.buffer.address += num_bytes;
        self.buffer.length -= num_bytes;
        self.elements = self.buffer.length / self.dtype.size();
    }

    /// Posts a label anchored `label.index` elements past the start of
    /// this work call's production.
    pub fn post_label(&mut self, label: Label) {
        self.pending_labels.push(label);
    }

    /// Posts an async message to all subscribers. Counts immediately.
    pub fn post_message(&mut self, message: Value) {
        self.total_messages += 1;
        self.pending_messages.push(message);
    }

    /// Forwards an external buffer directly, bypassing the write buffer.
    /// Its length determines the produced element count; do not also call
    /// [`produce`](Self::produce) for these elements.
    pub fn post_buffer(&mut self, chunk: BufferChunk) {
        self.posted_buffers.push_back(chunk);
    }

    /// Declares that this output may reuse the indexed input's front
    /// buffer when it is uniquely owned and the dtypes match byte for
    /// byte.
    pub fn set_read_before_write(&mut self, input_index: usize) {
        self.read_before_write = Some(input_index);
    }

    pub(crate) fn read_before_write_index(&self) -> Option<usize> {
        self.read_before_write
    }

    /// Installs (or clears) this port's buffer manager and primes the
    /// write buffer.
    pub(crate) fn set_manager(&mut self, manager: Option<Arc<dyn BufferManager>>) {
        self.manager = manager;
        self.buffer = BufferChunk::null();
        self.elements = 0;
        if self.manager.is_some() {
            self.refresh_buffer();
        }
    }

    pub(crate) fn manager(&self) -> Option<&Arc<dyn BufferManager>> {
        self.manager.as_ref()
    }

    /// Re-checks the write buffer before `work()`; an earlier exhausted
    /// pop may succeed now that downstream recycled.
    pub(crate) fn stage(&mut self) {
        if self.buffer.length < self.dtype.size() {
            self.refresh_buffer();
        } else {
            self.elements = self.buffer.length / self.dtype.size();
        }
    }

    /// Substitutes an inlined buffer (read-before-write) for this work
    /// call; the replaced write buffer returns to its manager.
    pub(crate) fn substitute_buffer(&mut self, mut chunk: BufferChunk) {
        chunk.dtype = self.dtype;
        self.elements = chunk.length / self.dtype.size();
        self.buffer = chunk;
        self.substituted = true;
    }

    /// Forwards this work call's production: labels in index order, then
    /// buffer chunks, then async messages; finally refreshes the write
    /// buffer. Returns the number of elements sent downstream.
    pub(crate) fn flush(&mut self, block: &str) -> Result<u64> {
        let size = self.dtype.size();
        let produced_bytes = self.pending_elements * size;
        if produced_bytes > self.buffer.length {
            let pending = self.pending_elements;
            self.pending_elements = 0;
            return Err(Error::ContractViolation {
                block: block.to_owned(),
                message: format!(
                    "produced {} elements with only {} writable on output '{}'",
                    pending, self.elements, self.name
                ),
            });
        }

        let mut outgoing: SmallVec<[BufferChunk; 2]> = SmallVec::new();
        let mut sent_elements = 0u64;
        if produced_bytes > 0 {
            outgoing.push(self.buffer.front_view(produced_bytes));
            sent_elements += self.pending_elements as u64;
        }
        while let Some(posted) = self.posted_buffers.pop_front() {
            sent_elements += (posted.length / size) as u64;
            outgoing.push(posted);
        }

        // Labels forward in non-decreasing index order regardless of the
        // order they were posted in.
        self.pending_labels.sort_by_key(|label| label.index);
        let labels: SmallVec<[Label; 4]> = self.pending_labels.drain(..).collect();

        if !labels.is_empty() || !outgoing.is_empty() {
            for subscriber in &self.subscribers {
                subscriber.shared.deliver(labels.iter().cloned(), outgoing.iter().cloned());
            }
        }
        for message in self.pending_messages.drain(..) {
            for subscriber in &self.subscribers {
                subscriber.shared.push_message(message.clone());
            }
        }

        if produced_bytes > 0 {
            self.buffer.address += produced_bytes;
            self.buffer.length -= produced_bytes;
        }
        // An inlined buffer is only valid for the work call it was staged
        // for; whatever was not produced stays with the input port.
        if self.substituted {
            self.buffer = BufferChunk::null();
            self.substituted = false;
        }
        self.total_elements += sent_elements;
        self.pending_elements = 0;
        self.refresh_buffer();
        Ok(sent_elements)
    }

    fn refresh_buffer(&mut self) {
        let size = self.dtype.size();
        if self.buffer.length < size {
            self.buffer = match &self.manager {
                Some(manager) => match manager.pop() {
                    Some(managed) => managed.as_chunk(self.dtype),
                    // Exhausted: zero writable elements parks the block
                    // until a downstream recycle flags it again.
                    None => BufferChunk::null(),
                },
                None => BufferChunk::null(),
            };
        }
        self.elements = self.buffer.length / size;
    }

    pub(crate) fn add_subscriber(&mut self, subscriber: Subscriber) {
        self.subscribers.push(subscriber);
    }

    /// Removes the subscription for `(block_uid, port)`; true if found.
    pub(crate) fn remove_subscriber(&mut self, block_uid: u64, port: &str) -> bool {
        match self.subscribers.iter().position(|s| s.block_uid == block_uid && s.port == port) {
            Some(at) => {
                self.subscribers.remove(at);
                true
            }
            None => false,
        }
    }

    pub(crate) fn release_manager(&mut self) {
        if let Some(manager) = self.manager.take() {
            manager.set_recycle_hook(None);
        }
        self.buffer = BufferChunk::null();
        self.elements = 0;
    }
}

impl std::fmt::Debug for OutputPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputPort")
            .field("name", &self.name)
            .field("dtype", &format_args!("{}", self.dtype))
            .field("elements", &self.elements)
            .field("total_elements", &self.total_elements)
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}
