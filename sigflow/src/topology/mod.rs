//! Graph assembly, flow resolution, and activation.

mod dot;
mod resolve;
mod stats;

pub use dot::DotOptions;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sigflow_buffer::{BufferManager, GenericPool};

use crate::block::BlockHandle;
use crate::errors::{Error, Result};
use crate::logging::{TopologyEvent, TopologyLogger, TOPOLOGY_STREAM};
use crate::ports::output::Subscriber;
use crate::runtime::Runtime;

/// Buffers per output-port pool.
const DEFAULT_NUM_BUFFERS: usize = 8;
/// Usable bytes per output-port buffer.
const DEFAULT_BUFFER_BYTES: usize = 8192;

/// A connectable node: a real block or a sub-topology boundary owner.
#[derive(Clone)]
pub enum Node {
    /// A block instance.
    Block(BlockHandle),
    /// A nested topology whose named ports alias its internal flows.
    Topology(Topology),
}

impl Node {
    pub(crate) fn uid(&self) -> u64 {
        match self {
            Node::Block(handle) => handle.uid(),
            Node::Topology(topology) => topology.uid(),
        }
    }

    pub(crate) fn name(&self) -> String {
        match self {
            Node::Block(handle) => handle.name().to_owned(),
            Node::Topology(topology) => topology.name(),
        }
    }
}

impl From<&BlockHandle> for Node {
    fn from(handle: &BlockHandle) -> Node {
        Node::Block(handle.clone())
    }
}

impl From<&Topology> for Node {
    fn from(topology: &Topology) -> Node {
        Node::Topology(topology.clone())
    }
}

/// One end of a declared flow. `node == None` marks the boundary of the
/// topology identified by `owner`.
#[derive(Clone)]
pub(crate) struct Endpoint {
    pub(crate) node: Option<Node>,
    pub(crate) port: String,
    pub(crate) owner: u64,
}

impl Endpoint {
    pub(crate) fn is_real(&self) -> bool {
        matches!(self.node, Some(Node::Block(_)))
    }

    pub(crate) fn block(&self) -> Option<&BlockHandle> {
        match &self.node {
            Some(Node::Block(handle)) => Some(handle),
            _ => None,
        }
    }

    pub(crate) fn same_as(&self, other: &Endpoint) -> bool {
        if self.port != other.port {
            return false;
        }
        match (&self.node, &other.node) {
            (None, None) => self.owner == other.owner,
            (Some(a), Some(b)) => a.uid() == b.uid(),
            _ => false,
        }
    }
}

/// A directed edge between two endpoints.
#[derive(Clone)]
pub(crate) struct Flow {
    pub(crate) src: Endpoint,
    pub(crate) dst: Endpoint,
}

impl Flow {
    pub(crate) fn same_as(&self, other: &Flow) -> bool {
        self.src.same_as(&other.src) && self.dst.same_as(&other.dst)
    }
}

pub(crate) struct TopologyInner {
    pub(crate) name: String,
    pub(crate) uid: u64,
    /// Declared flows, as connected.
    pub(crate) flows: Vec<Flow>,
    /// Real block-to-block edges currently installed.
    pub(crate) committed: Vec<Flow>,
    /// Blocks currently activated by this topology.
    pub(crate) active: Vec<BlockHandle>,
    logger: Option<TopologyLogger>,
}

/// The graph under construction or running.
///
/// Flows are declared with [`connect`](Topology::connect) and take effect
/// at [`commit`](Topology::commit): pass-through flows resolve across
/// sub-topologies, the resolved edge set is diffed against the installed
/// one, and blocks entering or leaving the graph are activated or
/// deactivated. Clones share the same graph.
#[derive(Clone)]
pub struct Topology {
    pub(crate) inner: Arc<Mutex<TopologyInner>>,
    runtime: Runtime,
    uid: u64,
}

impl Topology {
    pub(crate) fn new(runtime: Runtime, name: &str) -> Topology {
        let uid = runtime.next_uid();
        let logger = runtime.inner.log_registry.get::<TopologyEvent>(TOPOLOGY_STREAM);
        Topology {
            inner: Arc::new(Mutex::new(TopologyInner {
                name: name.to_owned(),
                uid,
                flows: Vec::new(),
                committed: Vec::new(),
                active: Vec::new(),
                logger,
            })),
            runtime,
            uid,
        }
    }

    /// The topology's name.
    pub fn name(&self) -> String {
        self.inner.lock().unwrap().name.clone()
    }

    /// The runtime-unique identifier of this topology.
    pub fn uid(&self) -> u64 {
        self.uid
    }

    /// Declares an edge from `src[src_port]` to `dst[dst_port]`.
    ///
    /// Stream ports and signal/slot names use the same call. Passing this
    /// topology itself as an endpoint declares a pass-through boundary
    /// port, resolved against real blocks at commit.
    pub fn connect(
        &self,
        src: impl Into<Node>,
        src_port: &str,
        dst: impl Into<Node>,
        dst_port: &str,
    ) -> Result<()> {
        let src = self.to_endpoint(src.into(), src_port);
        let dst = self.to_endpoint(dst.into(), dst_port);

        // Port names on real blocks are validated eagerly.
        if let Some(handle) = src.block() {
            let name = handle.name().to_owned();
            let port = src.port.clone();
            handle.actor.external_call(move |core| match core.output_index(&port) {
                Some(_) => Ok(()),
                None => Err(Error::PortNotFound { block: name.clone(), port: port.clone() }),
            })?;
        }
        if let Some(handle) = dst.block() {
            let name = handle.name().to_owned();
            let port = dst.port.clone();
            handle.actor.external_call(move |core| match core.input_index(&port) {
                Some(_) => Ok(()),
                None => Err(Error::PortNotFound { block: name.clone(), port: port.clone() }),
            })?;
        }

        let mut inner = self.inner.lock().unwrap();
        let flow = Flow { src, dst };
        if !inner.flows.iter().any(|f| f.same_as(&flow)) {
            inner.flows.push(flow);
        }
        Ok(())
    }

    /// Removes a previously declared edge.
    pub fn disconnect(
        &self,
        src: impl Into<Node>,
        src_port: &str,
        dst: impl Into<Node>,
        dst_port: &str,
    ) -> Result<()> {
        let src = self.to_endpoint(src.into(), src_port);
        let dst = self.to_endpoint(dst.into(), dst_port);
        let flow = Flow { src, dst };

        let mut inner = self.inner.lock().unwrap();
        match inner.flows.iter().position(|f| f.same_as(&flow)) {
            Some(at) => {
                inner.flows.remove(at);
                Ok(())
            }
            None => Err(Error::InvalidArgument(format!(
                "no declared flow matches {}[{}] -> {}[{}]",
                flow.src.node.as_ref().map(Node::name).unwrap_or_else(|| "self".into()),
                flow.src.port,
                flow.dst.node.as_ref().map(Node::name).unwrap_or_else(|| "self".into()),
                flow.dst.port,
            ))),
        }
    }

    /// Removes every declared edge. Takes effect at the next commit.
    pub fn disconnect_all(&self) {
        self.inner.lock().unwrap().flows.clear();
    }

    /// Resolves flows, installs the difference, and toggles activation.
    ///
    /// Newly included blocks are activated (buffer managers installed,
    /// `activate()` hook, scheduler registration); blocks leaving the
    /// committed graph are deactivated. A failed activation deactivates
    /// the blocks this commit activated and restores the previous
    /// subscriptions before returning the error.
    pub fn commit(&self) -> Result<()> {
        let flat: Vec<Flow> = {
            let inner = self.inner.lock().unwrap();
            resolve::squash(&inner)
                .into_iter()
                .filter(|flow| flow.src.is_real() && flow.dst.is_real())
                .collect()
        };

        let inner = self.inner.lock().unwrap();

        let added: Vec<Flow> = flat
            .iter()
            .filter(|flow| !inner.committed.iter().any(|have| have.same_as(flow)))
            .cloned()
            .collect();
        let removed: Vec<Flow> = inner
            .committed
            .iter()
            .filter(|flow| !flat.iter().any(|keep| keep.same_as(flow)))
            .cloned()
            .collect();

        // Validate every new edge before mutating any port state.
        for flow in &added {
            validate_edge(flow)?;
        }

        for flow in &removed {
            unsubscribe_edge(flow);
        }
        for flow in &added {
            subscribe_edge(flow)?;
        }

        // Activation diff.
        let mut wanted: Vec<BlockHandle> = Vec::new();
        for flow in &flat {
            for endpoint in [&flow.src, &flow.dst] {
                if let Some(handle) = endpoint.block() {
                    if !wanted.iter().any(|have| have.uid() == handle.uid()) {
                        wanted.push(handle.clone());
                    }
                }
            }
        }
        let to_activate: Vec<BlockHandle> = wanted
            .iter()
            .filter(|handle| !inner.active.iter().any(|have| have.uid() == handle.uid()))
            .cloned()
            .collect();
        let to_deactivate: Vec<BlockHandle> = inner
            .active
            .iter()
            .filter(|handle| !wanted.iter().any(|keep| keep.uid() == handle.uid()))
            .cloned()
            .collect();

        let mut activated: Vec<BlockHandle> = Vec::new();
        for handle in &to_activate {
            match activate_block(&self.runtime, handle, &inner.logger) {
                Ok(()) => activated.push(handle.clone()),
                Err(err) => {
                    // Roll back this commit's activations and connections.
                    for done in activated.iter().rev() {
                        deactivate_block(&self.runtime, done, &inner.logger);
                    }
                    for flow in &added {
                        unsubscribe_edge(flow);
                    }
                    for flow in &removed {
                        let _ = subscribe_edge(flow);
                    }
                    return Err(err);
                }
            }
        }
        for handle in &to_deactivate {
            deactivate_block(&self.runtime, handle, &inner.logger);
        }

        let mut inner = inner;
        inner.committed = flat;
        inner.active = wanted;
        if let Some(logger) = &inner.logger {
            logger.log(TopologyEvent::Commit { topology: inner.uid, flows: inner.committed.len() });
        }
        Ok(())
    }

    /// Waits until no block in the committed graph has performed work for
    /// `idle`, or until `timeout` expires. Returns true when the graph
    /// went inactive.
    pub fn wait_inactive(&self, idle: Duration, timeout: Duration) -> bool {
        let actors: Vec<BlockHandle> = self.inner.lock().unwrap().active.clone();
        let deadline = Instant::now() + timeout;
        let counts = |handles: &[BlockHandle]| -> Vec<u64> {
            handles.iter().map(|h| h.actor.work_events()).collect()
        };

        let mut last = counts(&actors);
        let mut stable_since = Instant::now();
        loop {
            std::thread::sleep(Duration::from_millis(1));
            let now = counts(&actors);
            if now != last {
                last = now;
                stable_since = Instant::now();
            } else if stable_since.elapsed() >= idle {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
        }
    }

    /// A JSON summary of the committed graph: per-block activity, errors,
    /// and per-port totals.
    pub fn query_json_stats(&self) -> Result<serde_json::Value> {
        stats::query(self)
    }

    /// A GraphViz rendering of the committed graph.
    pub fn to_dot_markup(&self, options: &DotOptions) -> String {
        dot::render(self, options)
    }

    fn to_endpoint(&self, node: Node, port: &str) -> Endpoint {
        // Connecting this topology itself addresses its boundary.
        if node.uid() == self.uid {
            Endpoint { node: None, port: port.to_owned(), owner: self.uid }
        } else {
            Endpoint { node: Some(node), port: port.to_owned(), owner: self.uid }
        }
    }
}

/// Checks dtype, domain, and signal/slot pairing for a resolved edge.
fn validate_edge(flow: &Flow) -> Result<()> {
    let (Some(src), Some(dst)) = (flow.src.block(), flow.dst.block()) else {
        return Ok(());
    };
    let src_port = flow.src.port.clone();
    let dst_port = flow.dst.port.clone();

    let dst_name = dst.name().to_owned();
    let dst_port_for_call = dst_port.clone();
    let (dst_dtype, dst_domain, dst_is_slot) = dst.actor.external_call(move |core| {
        let at = core
            .input_index(&dst_port_for_call)
            .ok_or_else(|| Error::PortNotFound { block: dst_name.clone(), port: dst_port_for_call.clone() })?;
        let input = &core.inputs[at];
        Ok((input.dtype(), input.domain().to_owned(), input.is_slot()))
    })?;

    let src_name = src.name().to_owned();
    let src_port_for_call = src_port.clone();
    let src_describe = format!("{}[{}]", src.name(), src_port);
    let dst_describe = format!("{}[{}]", dst.name(), dst_port);
    src.actor.external_call(move |core| {
        let at = core
            .output_index(&src_port_for_call)
            .ok_or_else(|| Error::PortNotFound { block: src_name.clone(), port: src_port_for_call.clone() })?;
        let output = &core.outputs[at];

        if output.is_signal() != dst_is_slot {
            return Err(Error::TypeMismatch {
                src: src_describe.clone(),
                dst: dst_describe.clone(),
                reason: "signal ports pair with slot ports".to_owned(),
            });
        }
        if !output.is_signal() {
            if output.dtype().size() != dst_dtype.size() {
                return Err(Error::TypeMismatch {
                    src: src_describe.clone(),
                    dst: dst_describe.clone(),
                    reason: format!("element sizes differ: {} vs {}", output.dtype(), dst_dtype),
                });
            }
            if !output.domain().is_empty() && !dst_domain.is_empty() && output.domain() != dst_domain {
                return Err(Error::TypeMismatch {
                    src: src_describe.clone(),
                    dst: dst_describe.clone(),
                    reason: format!("domains differ: '{}' vs '{}'", output.domain(), dst_domain),
                });
            }
        }
        Ok(())
    })
}

/// Installs the port-level subscription for a validated edge.
fn subscribe_edge(flow: &Flow) -> Result<()> {
    let (src, dst) = match (flow.src.block(), flow.dst.block()) {
        (Some(src), Some(dst)) => (src, dst),
        _ => return Ok(()),
    };
    let src_port = flow.src.port.clone();
    let dst_port = flow.dst.port.clone();

    let dst_port_for_call = dst_port.clone();
    let shared = dst.actor.external_call(move |core| {
        let at = core
            .input_index(&dst_port_for_call)
            .ok_or_else(|| Error::PortNotFound { block: String::new(), port: dst_port_for_call.clone() })?;
        core.inputs[at].upstream_count += 1;
        Ok(core.inputs[at].shared.clone())
    })?;

    let dst_uid = dst.uid();
    let dst_port_for_sub = dst_port.clone();
    src.actor.external_call(move |core| {
        let at = core
            .output_index(&src_port)
            .ok_or_else(|| Error::PortNotFound { block: String::new(), port: src_port.clone() })?;
        core.outputs[at].add_subscriber(Subscriber {
            shared: shared.clone(),
            block_uid: dst_uid,
            port: dst_port_for_sub.clone(),
        });
        Ok(())
    })?;

    dst.actor.iface().flag_external_change();
    Ok(())
}

/// Removes the port-level subscription for an edge, draining the
/// destination's queues once its last upstream is gone.
fn unsubscribe_edge(flow: &Flow) {
    let (src, dst) = match (flow.src.block(), flow.dst.block()) {
        (Some(src), Some(dst)) => (src, dst),
        _ => return,
    };
    let src_port = flow.src.port.clone();
    let dst_port = flow.dst.port.clone();
    let dst_uid = dst.uid();

    let dst_port_for_remove = dst_port.clone();
    let _ = src.actor.external_call(move |core| {
        if let Some(at) = core.output_index(&src_port) {
            core.outputs[at].remove_subscriber(dst_uid, &dst_port_for_remove);
        }
        Ok(())
    });
    let _ = dst.actor.external_call(move |core| {
        if let Some(at) = core.input_index(&dst_port) {
            let input = &mut core.inputs[at];
            input.upstream_count = input.upstream_count.saturating_sub(1);
            if input.upstream_count == 0 {
                input.clear();
            }
        }
        Ok(())
    });
}

#[cfg(unix)]
fn circular_manager() -> Result<Arc<dyn BufferManager>> {
    Ok(sigflow_buffer::CircularPool::new(DEFAULT_NUM_BUFFERS, DEFAULT_BUFFER_BYTES)?)
}

#[cfg(not(unix))]
fn circular_manager() -> Result<Arc<dyn BufferManager>> {
    Ok(GenericPool::new(DEFAULT_NUM_BUFFERS, DEFAULT_BUFFER_BYTES)?)
}

fn activate_block(runtime: &Runtime, handle: &BlockHandle, logger: &Option<TopologyLogger>) -> Result<()> {
    let wake_target = Arc::downgrade(handle.actor.iface());
    let block_name = handle.name().to_owned();

    handle.actor.external_call(move |core| {
        if core.active {
            return Err(Error::AlreadyActive(block_name.clone()));
        }
        for output in core.outputs.iter_mut() {
            if output.is_signal() {
                continue;
            }
            let manager: Arc<dyn BufferManager> = if output.wants_circular() {
                circular_manager()?
            } else {
                GenericPool::new(DEFAULT_NUM_BUFFERS, DEFAULT_BUFFER_BYTES)?
            };
            // Downstream recycles release back-pressure: re-flag the
            // producer when a slab comes home.
            let wake = wake_target.clone();
            manager.set_recycle_hook(Some(Arc::new(move || {
                if let Some(iface) = wake.upgrade() {
                    iface.flag_external_change();
                }
            })));
            output.set_manager(Some(manager));
        }
        core.block.activate()?;
        core.active = true;
        Ok(())
    })?;

    runtime.pool().add_actor(handle.actor.clone());
    handle.actor.iface().flag_external_change();
    if let Some(logger) = logger {
        logger.log(TopologyEvent::Activate { block: handle.uid() });
    }
    Ok(())
}

fn deactivate_block(runtime: &Runtime, handle: &BlockHandle, logger: &Option<TopologyLogger>) {
    runtime.pool().remove_actor(handle.uid());
    let _ = handle.actor.external_call(|core| {
        if core.active {
            core.active = false;
            let result = core.block.deactivate();
            for output in core.outputs.iter_mut() {
                output.release_manager();
            }
            result?;
        }
        Ok(())
    });
    if let Some(logger) = logger {
        logger.log(TopologyEvent::Deactivate { block: handle.uid() });
    }
}
