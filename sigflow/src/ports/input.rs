//! Input ports: accumulated stream buffers, labels, and async messages.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use smallvec::SmallVec;

use sigflow_buffer::{BufferChunk, DType};

use crate::accumulator::BufferAccumulator;
use crate::actor::ActorInterface;
use crate::errors::{Error, Result};
use crate::label::{insert_sorted, Label};
use crate::value::Value;

/// The producer-facing half of an input port.
///
/// Upstream output ports and external callers touch only this structure;
/// everything here is guarded so pushes are safe from any thread. A weak
/// back-reference to the owning actor lets every push flag readiness.
///
/// Queued labels are anchored against the accumulator's all-time delivered
/// count, which consumption cannot move; a delivery landing while the
/// owning actor is mid-pop therefore needs no compensation. The work side
/// re-bases onto the live front when it stages, under the same lock that
/// serializes pops.
pub(crate) struct InputShared {
    dtype_size: usize,
    accumulator: Mutex<BufferAccumulator>,
    labels: Mutex<Vec<Label>>,
    messages: Mutex<VecDeque<Value>>,
    actor: Mutex<Weak<ActorInterface>>,
    total_buffers: AtomicU64,
}

impl InputShared {
    fn new(dtype_size: usize) -> Arc<InputShared> {
        Arc::new(InputShared {
            dtype_size,
            accumulator: Mutex::new(BufferAccumulator::new()),
            labels: Mutex::new(Vec::new()),
            messages: Mutex::new(VecDeque::new()),
            actor: Mutex::new(Weak::new()),
            total_buffers: AtomicU64::new(0),
        })
    }

    /// Points pushes at the owning actor's wake flag.
    pub(crate) fn bind_actor(&self, actor: &Arc<ActorInterface>) {
        *self.actor.lock().unwrap() = Arc::downgrade(actor);
    }

    fn flag_actor(&self) {
        if let Some(actor) = self.actor.lock().unwrap().upgrade() {
            actor.flag_external_change();
        }
    }

    /// Delivers one work call's worth of labels and buffers atomically with
    /// respect to consumption. Label indices arrive relative to the start
    /// of the delivered span and are anchored against the all-time
    /// delivered count.
    pub(crate) fn deliver(
        &self,
        labels: impl IntoIterator<Item = Label>,
        chunks: impl IntoIterator<Item = BufferChunk>,
    ) {
        {
            let mut accumulator = self.accumulator.lock().unwrap();
            let base = accumulator.total_bytes_pushed() / self.dtype_size as u64;
            {
                let mut queue = self.labels.lock().unwrap();
                for mut label in labels {
                    label.index += base;
                    queue.push(label);
                }
            }
            for chunk in chunks {
                if chunk.length == 0 && chunk.managed().is_none() {
                    continue;
                }
                accumulator.push(chunk);
                self.total_buffers.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.flag_actor();
    }

    pub(crate) fn push_buffer(&self, chunk: BufferChunk) {
        {
            let mut accumulator = self.accumulator.lock().unwrap();
            accumulator.push(chunk);
            self.total_buffers.fetch_add(1, Ordering::Relaxed);
        }
        self.flag_actor();
    }

    pub(crate) fn push_label(&self, mut label: Label) {
        {
            // The caller's index is relative to the unconsumed front;
            // convert it to the consume-invariant anchor while pops are
            // locked out.
            let accumulator = self.accumulator.lock().unwrap();
            let consumed = (accumulator.total_bytes_pushed() - accumulator.bytes_available() as u64)
                / self.dtype_size as u64;
            label.index += consumed;
            self.labels.lock().unwrap().push(label);
        }
        self.flag_actor();
    }

    pub(crate) fn push_message(&self, message: Value) {
        self.messages.lock().unwrap().push_back(message);
        self.flag_actor();
    }

    pub(crate) fn has_message(&self) -> bool {
        !self.messages.lock().unwrap().is_empty()
    }

    fn pop_message(&self) -> Option<Value> {
        self.messages.lock().unwrap().pop_front()
    }

    pub(crate) fn total_buffers(&self) -> u64 {
        self.total_buffers.load(Ordering::Relaxed)
    }
}

/// A block's view of one of its input ports.
///
/// The staged fields (`buffer`, `elements`, visible labels) are refreshed
/// before each `work()` and stay stable throughout the call; totals update
/// after `work()` returns, except where noted.
pub struct InputPort {
    name: String,
    alias: String,
    index: i32,
    dtype: DType,
    domain: String,
    is_slot: bool,

    // Staged before each work call.
    buffer: BufferChunk,
    elements: usize,
    num_labels: usize,
    labels: Vec<Label>,

    // State changed by work.
    pending_elements: usize,
    reserve_elements: usize,

    // Port stats.
    total_elements: u64,
    total_labels: u64,
    total_messages: u64,

    pub(crate) upstream_count: usize,
    pub(crate) shared: Arc<InputShared>,
}

impl InputPort {
    pub(crate) fn new(name: &str, index: i32, dtype: DType, domain: &str, is_slot: bool) -> InputPort {
        InputPort {
            name: name.to_owned(),
            alias: name.to_owned(),
            index,
            dtype,
            domain: domain.to_owned(),
            is_slot,
            buffer: BufferChunk::null(),
            elements: 0,
            num_labels: 0,
            labels: Vec::new(),
            pending_elements: 0,
            reserve_elements: 0,
            total_elements: 0,
            total_labels: 0,
            total_messages: 0,
            upstream_count: 0,
            shared: InputShared::new(dtype.size()),
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

    /// True when this port receives slot calls rather than stream data.
    pub fn is_slot(&self) -> bool {
        self.is_slot
    }

    /// The staged stream buffer: the front of the accumulator.
    pub fn buffer(&self) -> &BufferChunk {
        &self.buffer
    }

    /// Whole elements available in the staged buffer.
    pub fn elements(&self) -> usize {
        self.elements
    }

    /// Labels whose index falls within [`elements`](Self::elements), oldest
    /// first by index.
    pub fn labels(&self) -> &[Label] {
        &self.labels[..self.num_labels]
    }

    /// Consumes elements from this port.
    ///
    /// Deferred: the accumulator advances and labels re-base after `work()`
    /// returns. Consuming more than [`elements`](Self::elements) is a
    /// contract violation surfaced when the work call completes.
    pub fn consume(&mut self, num_elements: usize) {
        self.pending_elements += num_elements;
    }

    /// Removes and returns one async message, if any is queued.
    pub fn pop_message(&mut self) -> Option<Value> {
        let message = self.shared.pop_message();
        if message.is_some() {
            self.total_messages += 1;
        }
        message
    }

    /// Does this port have an async message waiting?
    pub fn has_message(&self) -> bool {
        self.shared.has_message()
    }

    /// Removes a label from storage ahead of consumption.
    ///
    /// Returns true when the label was found. Counts towards
    /// [`total_labels`](Self::total_labels) immediately.
    pub fn remove_label(&mut self, label: &Label) -> bool {
        let start = self.labels.partition_point(|l| l.index < label.index);
        let end = self.labels.partition_point(|l| l.index <= label.index);
        for at in start..end {
            if self.labels[at] == *label {
                self.labels.remove(at);
                if at < self.num_labels {
                    self.num_labels -= 1;
                }
                self.total_labels += 1;
                return true;
            }
        }
        false
    }

    /// Sets the minimum element count the scheduler tries to satisfy
    /// before declaring this port ready.
    pub fn set_reserve(&mut self, num_elements: usize) {
        self.reserve_elements = num_elements;
    }

    /// The current reserve requirement.
    pub fn reserve(&self) -> usize {
        self.reserve_elements
    }

    /// Total elements consumed on this port.
    pub fn total_elements(&self) -> u64 {
        self.total_elements
    }

    /// Total buffers ever delivered to this port.
    pub fn total_buffers(&self) -> u64 {
        self.shared.total_buffers()
    }

    /// Total labels consumed from this port.
    pub fn total_labels(&self) -> u64 {
        self.total_labels
    }

    /// Total messages popped from this port.
    pub fn total_messages(&self) -> u64 {
        self.total_messages
    }

    /// Pushes a buffer into this port's accumulator. Thread-safe; useful
    /// for preloading history or feedback elements.
    pub fn push_buffer(&self, chunk: BufferChunk) {
        self.shared.push_buffer(chunk);
    }

    /// Pushes a label; its index is relative to the unconsumed stream.
    /// Push the buffer carrying the labeled element first. Thread-safe.
    pub fn push_label(&self, label: Label) {
        self.shared.push_label(label);
    }

    /// Enqueues an async message. Thread-safe.
    pub fn push_message(&self, message: Value) {
        self.shared.push_message(message);
    }

    /// Drops all buffered data, labels, and messages on this port.
    pub fn clear(&mut self) {
        self.shared.accumulator.lock().unwrap().clear();
        self.shared.labels.lock().unwrap().clear();
        self.shared.messages.lock().unwrap().clear();
        self.labels.clear();
        self.num_labels = 0;
        self.buffer = BufferChunk::null();
        self.elements = 0;
        self.pending_elements = 0;
    }

    /// Elements consumed by the current work call so far.
    pub(crate) fn pending(&self) -> usize {
        self.pending_elements
    }

    /// Refreshes the staged buffer, label window, and element count. Runs
    /// with the actor held, before `work()`.
    pub(crate) fn stage(&mut self) -> Result<()> {
        let mut front = {
            let mut accumulator = self.shared.accumulator.lock().unwrap();

            // Re-base queued labels from their delivery anchor onto the
            // live front, while the consumed prefix cannot move.
            let consumed = (accumulator.total_bytes_pushed() - accumulator.bytes_available() as u64)
                / self.dtype.size() as u64;
            {
                let mut incoming = self.shared.labels.lock().unwrap();
                for mut label in incoming.drain(..) {
                    label.index = label.index.saturating_sub(consumed);
                    insert_sorted(&mut self.labels, label);
                }
            }

            if self.reserve_elements > 0 {
                accumulator.require(self.reserve_elements * self.dtype.size())?;
            }
            accumulator.front().clone()
        };
        front.dtype = self.dtype;
        self.elements = front.length / self.dtype.size();
        self.buffer = front;
        self.num_labels = self.labels.partition_point(|l| l.index < self.elements as u64);
        self.pending_elements = 0;
        Ok(())
    }

    /// Applies the consumption recorded by `work()`: advances the
    /// accumulator, drops consumed labels (returning them for
    /// propagation), and re-bases the remainder.
    pub(crate) fn commit_work(&mut self, block: &str) -> Result<(SmallVec<[Label; 4]>, u64)> {
        let consumed = self.pending_elements;
        self.pending_elements = 0;
        if consumed > self.elements {
            return Err(Error::ContractViolation {
                block: block.to_owned(),
                message: format!(
                    "consumed {} elements with only {} available on input '{}'",
                    consumed, self.elements, self.name
                ),
            });
        }
        if consumed > 0 {
            self.shared.accumulator.lock().unwrap().pop(consumed * self.dtype.size());
            self.total_elements += consumed as u64;
        }

        let boundary = self.labels.partition_point(|l| l.index < consumed as u64);
        let dropped: SmallVec<[Label; 4]> = self.labels.drain(..boundary).collect();
        for label in &mut self.labels {
            label.index -= consumed as u64;
        }
        self.num_labels = 0;
        self.total_labels += dropped.len() as u64;
        Ok((dropped, consumed as u64))
    }

    /// First staged label anchored at index zero?
    pub(crate) fn has_label_at_front(&self) -> bool {
        self.labels.first().map_or(false, |label| label.index == 0)
    }
}

impl std::fmt::Debug for InputPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputPort")
            .field("name", &self.name)
            .field("dtype", &format_args!("{}", self.dtype))
            .field("elements", &self.elements)
            .field("total_elements", &self.total_elements)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sigflow_buffer::{ManagedBuffer, SharedBuffer};

    fn int32_port() -> InputPort {
        InputPort::new("0", 0, DType::from_markup("int32").unwrap(), "", false)
    }

    fn chunk(bytes: &[u8]) -> BufferChunk {
        let buffer = SharedBuffer::alloc(bytes.len()).unwrap();
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), buffer.address() as *mut u8, bytes.len());
        }
        ManagedBuffer::orphan(buffer).as_chunk(DType::byte())
    }

    #[test]
    fn consume_all_drops_and_rebases_labels() {
        let mut port = int32_port();
        port.push_buffer(chunk(&[0u8; 32])); // eight int32 elements
        port.push_label(Label::new("a", Value::Null, 2));
        port.push_label(Label::new("b", Value::Null, 11)); // past the window

        port.stage().unwrap();
        assert_eq!(port.elements(), 8);
        assert_eq!(port.labels().len(), 1);
        assert_eq!(port.labels()[0].id, "a");

        port.consume(port.elements());
        let (dropped, consumed) = port.commit_work("test").unwrap();
        assert_eq!(consumed, 8);
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].id, "a");
        assert_eq!(port.total_elements(), 8);
        assert_eq!(port.total_labels(), 1);

        // The surviving label has been re-based against the consumption.
        port.push_buffer(chunk(&[0u8; 16]));
        port.stage().unwrap();
        assert_eq!(port.labels().len(), 1);
        assert_eq!(port.labels()[0].id, "b");
        assert_eq!(port.labels()[0].index, 3);
    }

    #[test]
    fn labels_delivered_mid_pass_stay_aligned() {
        let mut port = int32_port();
        port.push_buffer(chunk(&[0u8; 32])); // eight elements staged
        port.stage().unwrap();
        port.consume(8);

        // An upstream flush lands between work() and the commit: four
        // more elements with a label on their first sample.
        port.shared.deliver(
            vec![Label::new("mid", Value::Null, 0)],
            vec![chunk(&[7u8; 16])],
        );

        port.commit_work("test").unwrap();
        port.stage().unwrap();
        assert_eq!(port.elements(), 4);
        assert_eq!(port.labels().len(), 1);
        // The pop did not drag the label off its element.
        assert_eq!(port.labels()[0].index, 0);
    }

    #[test]
    fn overconsumption_is_a_contract_violation() {
        let mut port = int32_port();
        port.push_buffer(chunk(&[0u8; 8]));
        port.stage().unwrap();
        assert_eq!(port.elements(), 2);
        port.consume(3);
        let err = port.commit_work("test").unwrap_err();
        assert!(matches!(err, Error::ContractViolation { .. }));
    }

    #[test]
    fn reserve_compacts_the_front() {
        let mut port = int32_port();
        // Two unrelated allocations cannot be contiguous.
        port.push_buffer(chunk(&[1u8; 16]));
        port.push_buffer(chunk(&[2u8; 16]));
        port.set_reserve(6);

        port.stage().unwrap();
        assert!(port.elements() >= 6);
        let bytes = port.buffer().as_slice();
        assert!(bytes[..16].iter().all(|b| *b == 1));
        assert!(bytes[16..24].iter().all(|b| *b == 2));
    }

    #[test]
    fn messages_pop_in_arrival_order() {
        let mut port = int32_port();
        port.push_message(Value::from(1i64));
        port.push_message(Value::from(2i64));
        assert!(port.has_message());
        assert_eq!(port.pop_message(), Some(Value::from(1i64)));
        assert_eq!(port.pop_message(), Some(Value::from(2i64)));
        assert_eq!(port.pop_message(), None);
        assert_eq!(port.total_messages(), 2);
    }

    #[test]
    fn remove_label_is_by_identity() {
        let mut port = int32_port();
        port.push_buffer(chunk(&[0u8; 32]));
        port.push_label(Label::new("keep", Value::from(1i64), 4));
        port.push_label(Label::new("drop", Value::from(2i64), 4));
        port.stage().unwrap();
        assert_eq!(port.labels().len(), 2);

        let target = Label::new("drop", Value::from(2i64), 4);
        assert!(port.remove_label(&target));
        assert!(!port.remove_label(&target));
        assert_eq!(port.labels().len(), 1);
        assert_eq!(port.labels()[0].id, "keep");
        assert_eq!(port.total_labels(), 1);
    }

    #[test]
    fn clear_empties_every_queue() {
        let mut port = int32_port();
        port.push_buffer(chunk(&[0u8; 16]));
        port.push_label(Label::new("l", Value::Null, 0));
        port.push_message(Value::Null);
        port.stage().unwrap();

        port.clear();
        assert!(!port.has_message());
        port.stage().unwrap();
        assert_eq!(port.elements(), 0);
        assert_eq!(port.labels().len(), 0);
    }
}
