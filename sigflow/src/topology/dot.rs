//! GraphViz rendering of a committed topology.

use std::collections::BTreeMap;
use std::fmt::Write;

use super::Topology;

/// Options for [`Topology::to_dot_markup`].
#[derive(Clone, Debug)]
pub struct DotOptions {
    /// Render only ports that participate in a committed edge; otherwise
    /// every declared port appears.
    pub connected_only: bool,
}

impl Default for DotOptions {
    fn default() -> DotOptions {
        DotOptions { connected_only: true }
    }
}

pub(crate) fn render(topology: &Topology, options: &DotOptions) -> String {
    let inner = topology.inner.lock().unwrap();

    // Gather blocks and the ports each committed edge touches.
    let mut connected_in: BTreeMap<u64, Vec<String>> = BTreeMap::new();
    let mut connected_out: BTreeMap<u64, Vec<String>> = BTreeMap::new();
    for flow in &inner.committed {
        if let (Some(src), Some(dst)) = (flow.src.block(), flow.dst.block()) {
            let outs = connected_out.entry(src.uid()).or_default();
            if !outs.contains(&flow.src.port) {
                outs.push(flow.src.port.clone());
            }
            let ins = connected_in.entry(dst.uid()).or_default();
            if !ins.contains(&flow.dst.port) {
                ins.push(flow.dst.port.clone());
            }
        }
    }

    let mut markup = String::new();
    let _ = writeln!(markup, "digraph flat_flows {{");
    let _ = writeln!(markup, "    rankdir=LR;");
    let _ = writeln!(markup, "    node [shape=record, fontsize=10];");

    for handle in &inner.active {
        let uid = handle.uid();
        let (in_ports, out_ports) = if options.connected_only {
            (
                connected_in.get(&uid).cloned().unwrap_or_default(),
                connected_out.get(&uid).cloned().unwrap_or_default(),
            )
        } else {
            (handle.input_port_names(), handle.output_port_names())
        };

        let ins = port_fields("in", &in_ports);
        let outs = port_fields("out", &out_ports);
        let mut label = String::new();
        if !ins.is_empty() {
            let _ = write!(label, "{{{}}}|", ins);
        }
        let _ = write!(label, "{}", escape(handle.name()));
        if !outs.is_empty() {
            let _ = write!(label, "|{{{}}}", outs);
        }
        let _ = writeln!(markup, "    {} [label=\"{{{}}}\"];", uid, label);
    }

    for flow in &inner.committed {
        if let (Some(src), Some(dst)) = (flow.src.block(), flow.dst.block()) {
            let _ = writeln!(
                markup,
                "    {}:__out__{} -> {}:__in__{};",
                src.uid(),
                sanitize(&flow.src.port),
                dst.uid(),
                sanitize(&flow.dst.port),
            );
        }
    }

    let _ = writeln!(markup, "}}");
    markup
}

fn port_fields(prefix: &str, ports: &[String]) -> String {
    ports
        .iter()
        .map(|port| format!("<__{}__{}> {}", prefix, sanitize(port), escape(port)))
        .collect::<Vec<_>>()
        .join("|")
}

/// Record-field ports must be identifier-like.
fn sanitize(name: &str) -> String {
    name.chars().map(|c| if c.is_ascii_alphanumeric() { c } else { '_' }).collect()
}

fn escape(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"").replace(['{', '}', '|', '<', '>'], "_")
}
