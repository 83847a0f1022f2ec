//! Reference blocks for exercising the runtime.
//!
//! These mirror the self-test vocabulary the framework's own tests are
//! written against: a feeder that injects buffers, labels, and messages
//! from outside the graph; a collector that accumulates everything it
//! sees; a unit-ratio copier; and a rational resampler skeleton for label
//! propagation checks.

use std::collections::VecDeque;

use sigflow_buffer::{BufferChunk, DType, ManagedBuffer, SharedBuffer};

use crate::block::{Block, PortLayout, WorkIo};
use crate::errors::{Error, Result};
use crate::label::Label;
use crate::value::Value;

enum FeedItem {
    Buffer(BufferChunk),
    Label(Label),
    Message(Value),
}

/// Injects externally fed buffers, labels, and messages into the graph.
///
/// Feed through the callable registry (any thread):
/// - `feed_buffer(bytes)` forwards the bytes as one chunk;
/// - `feed_label(id, data, index)` anchors the label relative to the start
///   of the production it drains with;
/// - `feed_message(value)` enqueues an async message.
pub struct FeederSource {
    dtype: DType,
    pending: VecDeque<FeedItem>,
}

impl FeederSource {
    /// A feeder producing elements of `dtype` on output port `"0"`.
    pub fn new(dtype: DType) -> FeederSource {
        FeederSource { dtype, pending: VecDeque::new() }
    }

    /// The feeder's port layout.
    pub fn layout(dtype: DType) -> PortLayout {
        PortLayout::new().output("0", dtype)
    }

    fn stash_buffer(&mut self, bytes: &[u8]) -> Result<()> {
        let buffer = SharedBuffer::alloc(bytes.len().max(1))?;
        let mut chunk = ManagedBuffer::orphan(buffer).as_chunk(self.dtype);
        chunk.length = bytes.len();
        chunk.as_mut_slice().copy_from_slice(bytes);
        self.pending.push_back(FeedItem::Buffer(chunk));
        Ok(())
    }
}

impl Block for FeederSource {
    fn work(&mut self, io: &mut WorkIo) -> Result<()> {
        while let Some(item) = self.pending.pop_front() {
            match item {
                FeedItem::Buffer(chunk) => io.outputs[0].post_buffer(chunk),
                FeedItem::Label(label) => io.outputs[0].post_label(label),
                FeedItem::Message(message) => io.outputs[0].post_message(message),
            }
        }
        Ok(())
    }

    fn call(&mut self, name: &str, args: &[Value]) -> Result<Value> {
        match name {
            "feed_buffer" => {
                let bytes = args
                    .first()
                    .ok_or_else(|| Error::InvalidArgument("feed_buffer takes the bytes to feed".into()))?
                    .as_bytes()?;
                self.stash_buffer(bytes)?;
                Ok(Value::Null)
            }
            "feed_label" => {
                let id = args
                    .first()
                    .ok_or_else(|| Error::InvalidArgument("feed_label takes (id, data, index)".into()))?
                    .as_str()?
                    .to_owned();
                let data = args.get(1).cloned().unwrap_or(Value::Null);
                let index = args.get(2).map(Value::as_u64).transpose()?.unwrap_or(0);
                // Anchor relative to the buffer the label is fed against,
                // past anything already stashed ahead of it.
                let stashed: u64 = self
                    .pending
                    .iter()
                    .map(|item| match item {
                        FeedItem::Buffer(chunk) => chunk.elements() as u64,
                        _ => 0,
                    })
                    .sum();
                self.pending.push_back(FeedItem::Label(Label::new(id, data, index + stashed)));
                Ok(Value::Null)
            }
            "feed_message" => {
                let message = args
                    .first()
                    .cloned()
                    .ok_or_else(|| Error::InvalidArgument("feed_message takes the message value".into()))?;
                self.pending.push_back(FeedItem::Message(message));
                Ok(Value::Null)
            }
            other => Err(Error::CallNotFound { block: String::new(), call: other.to_owned() }),
        }
    }
}

/// Accumulates every byte, label, and message that arrives on its input.
///
/// Read back through `get_buffer`, `get_labels` (an opaque `Vec<Label>`
/// with indices rebased to the collected stream), and `get_messages`.
pub struct CollectorSink {
    collected: Vec<u8>,
    labels: Vec<Label>,
    messages: Vec<Value>,
    dtype: DType,
}

impl CollectorSink {
    /// A collector consuming elements of `dtype` on input port `"0"`.
    pub fn new(dtype: DType) -> CollectorSink {
        CollectorSink { collected: Vec::new(), labels: Vec::new(), messages: Vec::new(), dtype }
    }

    /// The collector's port layout.
    pub fn layout(dtype: DType) -> PortLayout {
        PortLayout::new().input("0", dtype)
    }
}

impl Block for CollectorSink {
    fn work(&mut self, io: &mut WorkIo) -> Result<()> {
        let input = &mut io.inputs[0];
        let elements_before = (self.collected.len() / self.dtype.size()) as u64;

        let num_elements = input.elements();
        for label in input.labels() {
            let mut label = label.clone();
            label.index += elements_before;
            self.labels.push(label);
        }
        if num_elements > 0 {
            let bytes = num_elements * self.dtype.size();
            self.collected.extend_from_slice(&input.buffer().as_slice()[..bytes]);
            input.consume(num_elements);
        }
        while let Some(message) = input.pop_message() {
            self.messages.push(message);
        }
        Ok(())
    }

    fn call(&mut self, name: &str, _args: &[Value]) -> Result<Value> {
        match name {
            "get_buffer" => Ok(Value::Bytes(self.collected.clone())),
            "get_labels" => Ok(Value::opaque(self.labels.clone())),
            "get_messages" => Ok(Value::List(self.messages.clone())),
            "clear" => {
                self.collected.clear();
                self.labels.clear();
                self.messages.clear();
                Ok(Value::Null)
            }
            other => Err(Error::CallNotFound { block: String::new(), call: other.to_owned() }),
        }
    }
}

/// Copies input to output one element for one element.
///
/// With `inline` enabled it declares read-before-write, letting the
/// runtime substitute the input buffer for the output buffer when that is
/// safe.
pub struct Copier {
    inline: bool,
}

impl Copier {
    /// A unit-ratio copier; `inline` requests buffer substitution.
    pub fn new(inline: bool) -> Copier {
        Copier { inline }
    }

    /// The copier's port layout for elements of `dtype`.
    pub fn layout(dtype: DType) -> PortLayout {
        PortLayout::new().input("0", dtype).output("0", dtype)
    }
}

impl Block for Copier {
    fn work(&mut self, io: &mut WorkIo) -> Result<()> {
        if self.inline {
            io.outputs[0].set_read_before_write(0);
        }
        let num_elements = io.info.min_elements;
        if num_elements == 0 {
            return Ok(());
        }
        let bytes = num_elements * io.inputs[0].dtype().size();

        // When the runtime inlined the input buffer, the copy is a no-op.
        if io.outputs[0].buffer().address != io.inputs[0].buffer().address {
            let source = &io.inputs[0].buffer().as_slice()[..bytes];
            io.outputs[0].buffer_mut().as_mut_slice()[..bytes].copy_from_slice(source);
        }
        io.inputs[0].consume(num_elements);
        io.outputs[0].produce(num_elements);
        Ok(())
    }
}

/// Repeats or drops whole elements by a rational `interp / decim` ratio,
/// carrying labels through the matching index rescale.
pub struct Resampler {
    interp: usize,
    decim: usize,
}

impl Resampler {
    /// A resampler emitting `interp` elements per `decim` consumed.
    pub fn new(interp: usize, decim: usize) -> Resampler {
        Resampler { interp: interp.max(1), decim: decim.max(1) }
    }

    /// The resampler's port layout for elements of `dtype`.
    pub fn layout(dtype: DType) -> PortLayout {
        PortLayout::new().input("0", dtype).output("0", dtype)
    }
}

impl Block for Resampler {
    fn work(&mut self, io: &mut WorkIo) -> Result<()> {
        let size = io.inputs[0].dtype().size();
        let groups = (io.inputs[0].elements() / self.decim).min(io.outputs[0].elements() / self.interp);
        if groups == 0 {
            return Ok(());
        }

        {
            let source = io.inputs[0].buffer().as_slice();
            let sink = io.outputs[0].buffer_mut().as_mut_slice();
            for group in 0..groups {
                let from = group * self.decim * size;
                for repeat in 0..self.interp {
                    let to = (group * self.interp + repeat) * size;
                    sink[to..to + size].copy_from_slice(&source[from..from + size]);
                }
            }
        }

        io.inputs[0].consume(groups * self.decim);
        io.outputs[0].produce(groups * self.interp);
        Ok(())
    }

    fn label_ratio(&self) -> (u64, u64) {
        (self.interp as u64, self.decim as u64)
    }
}
