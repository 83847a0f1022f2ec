//! End-to-end streaming scenarios over running topologies.

use std::time::Duration;

use sigflow::testers::{CollectorSink, Copier, FeederSource, Resampler};
use sigflow::{Block, DType, Label, PortLayout, Result, Runtime, Value, WorkIo};

/// Polls the collector until it holds `expected` bytes or patience runs out.
fn collect_bytes(collector: &sigflow::BlockHandle, expected: usize) -> Vec<u8> {
    let mut collected = Vec::new();
    for _ in 0..2000 {
        collected = collector
            .call("get_buffer", &[])
            .unwrap()
            .as_bytes()
            .unwrap()
            .to_vec();
        if collected.len() >= expected {
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    collected
}

fn collected_labels(collector: &sigflow::BlockHandle) -> Vec<Label> {
    let value = collector.call("get_labels", &[]).unwrap();
    value.downcast_ref::<Vec<Label>>().unwrap().clone()
}

fn int32_bytes(values: &[i32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_ne_bytes()).collect()
}

#[test]
fn feed_and_collect_one_block() {
    let runtime = Runtime::new().unwrap();
    let dtype = DType::from_markup("int32").unwrap();
    let feeder = runtime.block("feeder", FeederSource::new(dtype), &FeederSource::layout(dtype));
    let collector = runtime.block("collector", CollectorSink::new(dtype), &CollectorSink::layout(dtype));

    let topology = runtime.topology("top");
    topology.connect(&feeder, "0", &collector, "0").unwrap();
    topology.commit().unwrap();

    let samples = int32_bytes(&[1, 2, 3, 4, 5, 6, 7, 8]);
    feeder.call("feed_buffer", &[Value::from(samples.clone())]).unwrap();

    assert_eq!(collect_bytes(&collector, samples.len()), samples);
    assert!(topology.wait_inactive(Duration::from_millis(20), Duration::from_secs(5)));

    // elements_consumed visible through the stats dump.
    let stats = topology.query_json_stats().unwrap();
    let blocks = stats["blocks"].as_array().unwrap();
    let collector_stats = blocks
        .iter()
        .find(|b| b["name"] == "collector")
        .expect("collector in stats");
    assert_eq!(collector_stats["inputs"][0]["total_elements"], 8);
    runtime.shutdown();
}

#[test]
fn label_propagation_with_decimation() {
    let runtime = Runtime::new().unwrap();
    let dtype = DType::from_markup("int32").unwrap();
    let feeder = runtime.block("feeder", FeederSource::new(dtype), &FeederSource::layout(dtype));
    let resampler = runtime.block("decim", Resampler::new(1, 2), &Resampler::layout(dtype));
    let collector = runtime.block("collector", CollectorSink::new(dtype), &CollectorSink::layout(dtype));

    let topology = runtime.topology("top");
    topology.connect(&feeder, "0", &resampler, "0").unwrap();
    topology.connect(&resampler, "0", &collector, "0").unwrap();
    topology.commit().unwrap();

    // The label rides ahead of the buffer that carries its element.
    feeder
        .call(
            "feed_label",
            &[Value::from("rxTime"), Value::from(1_000_000_000u64), Value::from(6u64)],
        )
        .unwrap();
    feeder
        .call("feed_buffer", &[Value::from(int32_bytes(&[10, 11, 12, 13, 14, 15, 16, 17]))])
        .unwrap();

    // Eight elements in, four out, every second sample kept.
    let collected = collect_bytes(&collector, 16);
    assert_eq!(collected, int32_bytes(&[10, 12, 14, 16]));

    let labels = collected_labels(&collector);
    assert_eq!(labels.len(), 1);
    assert_eq!(labels[0].id, "rxTime");
    assert_eq!(labels[0].data, Value::from(1_000_000_000u64));
    // floor(6 * 1 / 2) relative to the output's pre-produce count.
    assert_eq!(labels[0].index, 3);
    runtime.shutdown();
}

#[test]
fn copier_chain_preserves_data() {
    let runtime = Runtime::new().unwrap();
    let dtype = DType::from_markup("float32").unwrap();
    let feeder = runtime.block("feeder", FeederSource::new(dtype), &FeederSource::layout(dtype));
    let copier = runtime.block("copier", Copier::new(false), &Copier::layout(dtype));
    let inline = runtime.block("inline", Copier::new(true), &Copier::layout(dtype));
    let collector = runtime.block("collector", CollectorSink::new(dtype), &CollectorSink::layout(dtype));

    let topology = runtime.topology("top");
    topology.connect(&feeder, "0", &copier, "0").unwrap();
    topology.connect(&copier, "0", &inline, "0").unwrap();
    topology.connect(&inline, "0", &collector, "0").unwrap();
    topology.commit().unwrap();

    let samples: Vec<u8> = (0..256u32).flat_map(|v| (v as f32).to_ne_bytes()).collect();
    feeder.call("feed_buffer", &[Value::from(samples.clone())]).unwrap();

    assert_eq!(collect_bytes(&collector, samples.len()), samples);
    runtime.shutdown();
}

#[test]
fn inline_copier_reuses_upstream_buffers() {
    // Orphan chunks from the feeder arrive uniquely owned, so after the
    // first work call declares read-before-write the runtime substitutes
    // them for the copier's write buffer.
    let runtime = Runtime::new().unwrap();
    let dtype = DType::from_markup("int32").unwrap();
    let feeder = runtime.block("feeder", FeederSource::new(dtype), &FeederSource::layout(dtype));
    let inline = runtime.block("inline", Copier::new(true), &Copier::layout(dtype));
    let collector = runtime.block("collector", CollectorSink::new(dtype), &CollectorSink::layout(dtype));

    let topology = runtime.topology("top");
    topology.connect(&feeder, "0", &inline, "0").unwrap();
    topology.connect(&inline, "0", &collector, "0").unwrap();
    topology.commit().unwrap();

    let mut expected = Vec::new();
    for round in 0..4i32 {
        let samples = int32_bytes(&[round * 10, round * 10 + 1, round * 10 + 2]);
        expected.extend_from_slice(&samples);
        feeder.call("feed_buffer", &[Value::from(samples)]).unwrap();
    }

    assert_eq!(collect_bytes(&collector, expected.len()), expected);
    runtime.shutdown();
}

#[test]
fn messages_arrive_in_order() {
    let runtime = Runtime::new().unwrap();
    let dtype = DType::byte();
    let feeder = runtime.block("feeder", FeederSource::new(dtype), &FeederSource::layout(dtype));
    let collector = runtime.block("collector", CollectorSink::new(dtype), &CollectorSink::layout(dtype));

    let topology = runtime.topology("top");
    topology.connect(&feeder, "0", &collector, "0").unwrap();
    topology.commit().unwrap();

    for index in 0..16i64 {
        feeder.call("feed_message", &[Value::from(index)]).unwrap();
    }

    let mut messages = Vec::new();
    for _ in 0..2000 {
        let value = collector.call("get_messages", &[]).unwrap();
        messages = value.as_list().unwrap().to_vec();
        if messages.len() == 16 {
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    let expected: Vec<Value> = (0..16i64).map(Value::from).collect();
    assert_eq!(messages, expected);
    runtime.shutdown();
}

#[test]
fn pass_through_flows_materialize_and_stream() {
    // T2 exposes `out` from an internal feeder; T1 exposes `in` feeding an
    // internal collector. One outer edge connects them.
    let runtime = Runtime::new().unwrap();
    let dtype = DType::from_markup("int32").unwrap();
    let feeder = runtime.block("feeder", FeederSource::new(dtype), &FeederSource::layout(dtype));
    let collector = runtime.block("collector", CollectorSink::new(dtype), &CollectorSink::layout(dtype));

    let t2 = runtime.topology("t2");
    t2.connect(&feeder, "0", &t2, "out").unwrap();
    let t1 = runtime.topology("t1");
    t1.connect(&t1, "in", &collector, "0").unwrap();

    let outer = runtime.topology("outer");
    outer.connect(&t2, "out", &t1, "in").unwrap();
    outer.commit().unwrap();

    let samples = int32_bytes(&[9, 8, 7]);
    feeder.call("feed_buffer", &[Value::from(samples.clone())]).unwrap();
    assert_eq!(collect_bytes(&collector, samples.len()), samples);

    // Exactly the one real edge was installed.
    let stats = outer.query_json_stats().unwrap();
    assert_eq!(stats["connections"], 1);
    runtime.shutdown();
}

/// Emits a rolling byte counter through a circular (double-mapped) output
/// in odd-sized strides so produced spans straddle slab and ring edges.
struct RingSource {
    next: u8,
    remaining: usize,
}

impl Block for RingSource {
    fn work(&mut self, io: &mut WorkIo) -> Result<()> {
        let stride = io.outputs[0].elements().min(self.remaining).min(1500);
        if stride == 0 {
            return Ok(());
        }
        {
            let sink = &mut io.outputs[0].buffer_mut().as_mut_slice()[..stride];
            for byte in sink.iter_mut() {
                *byte = self.next;
                self.next = self.next.wrapping_add(1);
            }
        }
        io.outputs[0].produce(stride);
        self.remaining -= stride;
        Ok(())
    }
}

#[cfg(unix)]
#[test]
fn circular_output_streams_across_the_wrap() {
    let runtime = Runtime::new().unwrap();
    let dtype = DType::byte();
    let total = 200_000usize; // several times around the ring

    let source = runtime.block(
        "ring",
        RingSource { next: 0, remaining: total },
        &PortLayout::new().circular_output("0", dtype),
    );
    let collector = runtime.block("collector", CollectorSink::new(dtype), &CollectorSink::layout(dtype));

    let topology = runtime.topology("top");
    topology.connect(&source, "0", &collector, "0").unwrap();
    topology.commit().unwrap();

    let collected = collect_bytes(&collector, total);
    assert_eq!(collected.len(), total);
    for (at, byte) in collected.iter().enumerate() {
        assert_eq!(*byte, at as u8, "stream corrupted at offset {}", at);
    }
    runtime.shutdown();
}
