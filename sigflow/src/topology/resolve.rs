//! Pass-through flow resolution across sub-topologies.

use itertools::Itertools;

use super::{Endpoint, Flow, Node, TopologyInner};

/// Flattens a topology's declared flows into edges between real blocks.
///
/// Endpoints that name a sub-topology resolve to the set of real ports its
/// boundary aliases; each declared flow contributes the cartesian product
/// of its source and destination resolutions. Sub-topology flows flatten
/// recursively, pure pass-through chains join head-to-tail, and duplicate
/// real edges collapse.
///
/// Flows between two boundaries of this topology survive in the output so
/// an enclosing topology can resolve through them.
pub(crate) fn squash(inner: &TopologyInner) -> Vec<Flow> {
    let mut flat: Vec<Flow> = Vec::new();

    for flow in &inner.flows {
        // A flow across this topology's own boundaries resolves at the
        // enclosing scope; it re-enters below.
        if flow.src.node.is_none() && flow.dst.node.is_none() {
            continue;
        }
        let sources = resolve_endpoint(&flow.src, true);
        let destinations = resolve_endpoint(&flow.dst, false);
        for (src, dst) in sources.iter().cartesian_product(destinations.iter()) {
            flat.push(Flow { src: src.clone(), dst: dst.clone() });
        }
    }

    // Flatten each referenced sub-topology once.
    let mut visited: Vec<u64> = Vec::new();
    for flow in &inner.flows {
        for node in [&flow.src.node, &flow.dst.node] {
            if let Some(Node::Topology(sub)) = node {
                if !visited.contains(&sub.uid()) {
                    visited.push(sub.uid());
                    let sub_inner = sub.inner.lock().unwrap();
                    flat.extend(squash(&sub_inner));
                }
            }
        }
    }

    let mut complete = complete_flows(&flat);
    for flow in &inner.flows {
        if flow.src.node.is_none() && flow.dst.node.is_none() {
            complete.push(flow.clone());
        }
    }
    dedup(complete)
}

/// Resolves one endpoint to the real or boundary endpoints it stands for.
fn resolve_endpoint(endpoint: &Endpoint, is_source: bool) -> Vec<Endpoint> {
    let sub = match &endpoint.node {
        Some(Node::Topology(sub)) => sub.clone(),
        // Real blocks and boundaries stand for themselves.
        _ => return vec![endpoint.clone()],
    };

    let inner = sub.inner.lock().unwrap();
    let mut resolved = Vec::new();
    for flow in &inner.flows {
        if is_source && flow.dst.node.is_none() && flow.dst.port == endpoint.port {
            match &flow.src.node {
                // A boundary feeding a boundary: bubble it upward.
                None => resolved.push(flow.src.clone()),
                Some(_) => resolved.extend(resolve_endpoint(&flow.src, is_source)),
            }
        }
        if !is_source && flow.src.node.is_none() && flow.src.port == endpoint.port {
            match &flow.dst.node {
                None => resolved.push(flow.dst.clone()),
                Some(_) => resolved.extend(resolve_endpoint(&flow.dst, is_source)),
            }
        }
    }
    resolved
}

/// Keeps real-to-real flows and materializes pure pass-through chains:
/// a boundary-to-boundary flow joins every real producer of its source
/// boundary to every real consumer of its destination boundary.
fn complete_flows(flows: &[Flow]) -> Vec<Flow> {
    let mut complete = Vec::new();
    for flow in flows {
        if flow.src.is_real() && flow.dst.is_real() {
            complete.push(flow.clone());
        }
        if flow.src.node.is_none() && flow.dst.node.is_none() {
            for tail in flows.iter().filter(|tail| tail.dst.is_real() && tail.src.same_as(&flow.src)) {
                for head in flows.iter().filter(|head| head.src.is_real() && head.dst.same_as(&flow.dst)) {
                    complete.push(Flow { src: head.src.clone(), dst: tail.dst.clone() });
                }
            }
        }
    }
    complete
}

fn dedup(flows: Vec<Flow>) -> Vec<Flow> {
    let mut unique: Vec<Flow> = Vec::new();
    for flow in flows {
        if !unique.iter().any(|have| have.same_as(&flow)) {
            unique.push(flow);
        }
    }
    unique
}
