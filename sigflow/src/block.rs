//! The block contract consumed by the runtime.

use std::sync::Arc;

use sigflow_buffer::DType;

use crate::actor::WorkerActor;
use crate::errors::{Error, Result};
use crate::label::Label;
use crate::ports::{InputPort, OutputPort};
use crate::value::Value;

/// Session-wide facts for one `work()` call.
#[derive(Clone, Copy, Debug, Default)]
pub struct WorkInfo {
    /// Minimum element count over all stream ports, for synchronous
    /// one-to-one blocks.
    pub min_elements: usize,
    /// Minimum element count over the stream inputs.
    pub min_in_elements: usize,
    /// Minimum element count over the stream outputs.
    pub min_out_elements: usize,
    /// Upper bound on how long `work()` may sleep internally before
    /// yielding back to the scheduler.
    pub max_timeout_ns: u64,
}

/// Port access handed to a block during `work()` and label propagation.
///
/// Inputs and outputs are plain slices so a block can hold both mutably at
/// once: `io.inputs[0]` while writing through `io.outputs[0]`.
pub struct WorkIo<'a> {
    /// The block's input ports, in declaration order.
    pub inputs: &'a mut [InputPort],
    /// The block's output ports, in declaration order.
    pub outputs: &'a mut [OutputPort],
    /// Facts about this work session.
    pub info: WorkInfo,
    pub(crate) yield_for_ns: Option<u64>,
}

impl WorkIo<'_> {
    /// Looks up an input port by name.
    pub fn input_named(&mut self, name: &str) -> Option<&mut InputPort> {
        self.inputs.iter_mut().find(|port| port.name() == name)
    }

    /// Looks up an output port by name.
    pub fn output_named(&mut self, name: &str) -> Option<&mut OutputPort> {
        self.outputs.iter_mut().find(|port| port.name() == name)
    }

    /// Asks the scheduler to revisit this block after at most
    /// `timeout_ns`, without occupying a worker thread meanwhile.
    pub fn yield_for(&mut self, timeout_ns: u64) {
        self.yield_for_ns = Some(timeout_ns);
    }
}

/// A unit of computation with typed streaming ports.
///
/// Implementations describe their ports with a [`PortLayout`] at
/// registration and overload [`work`](Block::work); the runtime guarantees
/// that `work`, the hooks, and [`call`](Block::call) never run
/// concurrently for one block instance.
pub trait Block: Send + 'static {
    /// Called when resources are available: consume inputs, produce
    /// outputs, post labels and messages.
    fn work(&mut self, io: &mut WorkIo) -> Result<()>;

    /// Called when this block enters the committed topology.
    fn activate(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called when this block leaves the committed topology.
    fn deactivate(&mut self) -> Result<()> {
        Ok(())
    }

    /// The `(interp, decim)` ratio used to rescale label indices during
    /// default propagation.
    fn label_ratio(&self) -> (u64, u64) {
        (1, 1)
    }

    /// Forwards labels consumed on `input` to downstream subscribers.
    ///
    /// The default forwards every consumed label to every output port with
    /// its index rescaled by [`label_ratio`](Block::label_ratio) (floor).
    fn propagate_labels(&mut self, input: usize, labels: &[Label], io: &mut WorkIo) -> Result<()> {
        let _ = input;
        let (interp, decim) = self.label_ratio();
        for output in io.outputs.iter_mut().filter(|output| !output.is_signal()) {
            for label in labels {
                output.post_label(label.rescaled(interp, decim));
            }
        }
        Ok(())
    }

    /// Dispatches a named call: setters, getters, and slot deliveries.
    fn call(&mut self, name: &str, args: &[Value]) -> Result<Value> {
        let _ = args;
        Err(Error::CallNotFound { block: String::new(), call: name.to_owned() })
    }
}

/// Kinds of declared ports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PortKind {
    Stream,
    Slot,
    Signal,
}

#[derive(Clone, Debug)]
pub(crate) struct PortDecl {
    pub(crate) name: String,
    pub(crate) dtype: DType,
    pub(crate) domain: String,
    pub(crate) kind: PortKind,
    pub(crate) circular: bool,
}

impl PortDecl {
    pub(crate) fn numeric_index(&self) -> i32 {
        self.name.parse().unwrap_or(-1)
    }
}

/// Declares a block's ports in order.
///
/// ```
/// use sigflow::{DType, PortLayout};
///
/// let dtype = DType::from_markup("float32").unwrap();
/// let layout = PortLayout::new()
///     .input("0", dtype)
///     .output("0", dtype)
///     .slot("setGain")
///     .signal("overflow");
/// ```
#[derive(Clone, Debug, Default)]
pub struct PortLayout {
    pub(crate) inputs: Vec<PortDecl>,
    pub(crate) outputs: Vec<PortDecl>,
}

impl PortLayout {
    /// An empty layout.
    pub fn new() -> PortLayout {
        PortLayout::default()
    }

    /// Adds a stream input port.
    pub fn input(self, name: &str, dtype: DType) -> PortLayout {
        self.input_with_domain(name, dtype, "")
    }

    /// Adds a stream input port with an explicit buffer domain.
    pub fn input_with_domain(mut self, name: &str, dtype: DType, domain: &str) -> PortLayout {
        self.inputs.push(PortDecl {
            name: name.to_owned(),
            dtype,
            domain: domain.to_owned(),
            kind: PortKind::Stream,
            circular: false,
        });
        self
    }

    /// Adds a stream output port.
    pub fn output(self, name: &str, dtype: DType) -> PortLayout {
        self.output_with_domain(name, dtype, "")
    }

    /// Adds a stream output port with an explicit buffer domain.
    pub fn output_with_domain(mut self, name: &str, dtype: DType, domain: &str) -> PortLayout {
        self.outputs.push(PortDecl {
            name: name.to_owned(),
            dtype,
            domain: domain.to_owned(),
            kind: PortKind::Stream,
            circular: false,
        });
        self
    }

    /// Adds a stream output port backed by a circular (double-mapped)
    /// buffer manager.
    pub fn circular_output(mut self, name: &str, dtype: DType) -> PortLayout {
        self.outputs.push(PortDecl {
            name: name.to_owned(),
            dtype,
            domain: String::new(),
            kind: PortKind::Stream,
            circular: true,
        });
        self
    }

    /// Adds a slot: a zero-element input port that delivers calls into the
    /// block's callable registry under the port's name.
    pub fn slot(mut self, name: &str) -> PortLayout {
        self.inputs.push(PortDecl {
            name: name.to_owned(),
            dtype: DType::byte(),
            domain: String::new(),
            kind: PortKind::Slot,
            circular: false,
        });
        self
    }

    /// Adds a signal: an output port that posts a call tuple to connected
    /// slots.
    pub fn signal(mut self, name: &str) -> PortLayout {
        self.outputs.push(PortDecl {
            name: name.to_owned(),
            dtype: DType::byte(),
            domain: String::new(),
            kind: PortKind::Signal,
            circular: false,
        });
        self
    }
}

/// A shared reference to an instantiated block and its worker actor.
///
/// Handles are what topologies connect; they stay valid for the life of
/// the runtime. [`call`](BlockHandle::call) mediates named calls through
/// the actor lock, so configuration is safe at any time, including while
/// the block is streaming.
#[derive(Clone)]
pub struct BlockHandle {
    pub(crate) actor: Arc<WorkerActor>,
}

impl BlockHandle {
    /// The block's name as registered.
    pub fn name(&self) -> &str {
        &self.actor.name
    }

    /// The runtime-unique identifier of this block.
    pub fn uid(&self) -> u64 {
        self.actor.uid
    }

    /// Invokes a named callable on the block, waiting for exclusive
    /// access. Never interleaves with `work()`.
    pub fn call(&self, name: &str, args: &[Value]) -> Result<Value> {
        let block_name = self.actor.name.clone();
        self.actor
            .external_call(|core| core.block.call(name, args).map_err(|err| err.attribute(&block_name)))
    }

    /// Sets the reserve requirement on a named input port.
    pub fn set_input_reserve(&self, port: &str, num_elements: usize) -> Result<()> {
        let block_name = self.actor.name.clone();
        self.actor.external_call(|core| {
            match core.inputs.iter_mut().find(|p| p.name() == port) {
                Some(input) => {
                    input.set_reserve(num_elements);
                    Ok(())
                }
                None => Err(Error::PortNotFound { block: block_name.clone(), port: port.to_owned() }),
            }
        })
    }

    /// Names of the input ports in declaration order.
    pub fn input_port_names(&self) -> Vec<String> {
        self.actor
            .external_call(|core| Ok(core.inputs.iter().map(|p| p.name().to_owned()).collect()))
            .unwrap_or_default()
    }

    /// Names of the output ports in declaration order.
    pub fn output_port_names(&self) -> Vec<String> {
        self.actor
            .external_call(|core| Ok(core.outputs.iter().map(|p| p.name().to_owned()).collect()))
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for BlockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockHandle")
            .field("name", &self.name())
            .field("uid", &self.uid())
            .finish()
    }
}
