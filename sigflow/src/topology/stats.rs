//! JSON activity summaries for a committed topology.

use serde::Serialize;

use super::Topology;
use crate::errors::{Error, Result};

#[derive(Serialize)]
struct InputStats {
    name: String,
    dtype: String,
    total_elements: u64,
    total_buffers: u64,
    total_labels: u64,
    total_messages: u64,
    reserve: usize,
}

#[derive(Serialize)]
struct OutputStats {
    name: String,
    dtype: String,
    total_elements: u64,
    total_messages: u64,
    subscribers: usize,
}

#[derive(Serialize)]
struct BlockStats {
    name: String,
    uid: u64,
    active: bool,
    error_count: u64,
    work_events: u64,
    inputs: Vec<InputStats>,
    outputs: Vec<OutputStats>,
}

#[derive(Serialize)]
struct TopologyStats {
    name: String,
    uid: u64,
    connections: usize,
    blocks: Vec<BlockStats>,
}

pub(crate) fn query(topology: &Topology) -> Result<serde_json::Value> {
    let (name, uid, connections, handles) = {
        let inner = topology.inner.lock().unwrap();
        (inner.name.clone(), inner.uid, inner.committed.len(), inner.active.clone())
    };

    let mut blocks = Vec::with_capacity(handles.len());
    for handle in &handles {
        let work_events = handle.actor.work_events();
        let stats = handle.actor.external_call(|core| {
            Ok(BlockStats {
                name: String::new(),
                uid: 0,
                active: core.active,
                error_count: core.error_count,
                work_events,
                inputs: core
                    .inputs
                    .iter()
                    .map(|port| InputStats {
                        name: port.name().to_owned(),
                        dtype: port.dtype().to_string(),
                        total_elements: port.total_elements(),
                        total_buffers: port.total_buffers(),
                        total_labels: port.total_labels(),
                        total_messages: port.total_messages(),
                        reserve: port.reserve(),
                    })
                    .collect(),
                outputs: core
                    .outputs
                    .iter()
                    .map(|port| OutputStats {
                        name: port.name().to_owned(),
                        dtype: port.dtype().to_string(),
                        total_elements: port.total_elements(),
                        total_messages: port.total_messages(),
                        subscribers: port.subscribers.len(),
                    })
                    .collect(),
            })
        })?;
        blocks.push(BlockStats { name: handle.name().to_owned(), uid: handle.uid(), ..stats });
    }

    serde_json::to_value(TopologyStats { name, uid, connections, blocks })
        .map_err(|err| Error::InvalidArgument(format!("stats serialization failed: {}", err)))
}
