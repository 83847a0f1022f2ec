//! Commit semantics: activation diffing, rollback, and introspection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sigflow::testers::{CollectorSink, FeederSource};
use sigflow::{Block, DType, DotOptions, Error, PortLayout, Result, Runtime, Value, WorkIo};

/// A pass-through block that counts its activation hooks.
struct Counting {
    activations: Arc<AtomicUsize>,
    deactivations: Arc<AtomicUsize>,
    fail_activation: bool,
}

impl Counting {
    fn layout() -> PortLayout {
        let dtype = DType::from_markup("int32").unwrap();
        PortLayout::new().input("0", dtype).output("0", dtype)
    }
}

impl Block for Counting {
    fn work(&mut self, io: &mut WorkIo) -> Result<()> {
        let n = io.info.min_elements;
        if n > 0 {
            let bytes = n * io.inputs[0].dtype().size();
            let source = &io.inputs[0].buffer().as_slice()[..bytes];
            io.outputs[0].buffer_mut().as_mut_slice()[..bytes].copy_from_slice(source);
            io.inputs[0].consume(n);
            io.outputs[0].produce(n);
        }
        Ok(())
    }

    fn activate(&mut self) -> Result<()> {
        if self.fail_activation {
            return Err(Error::InvalidArgument("refusing to activate".into()));
        }
        self.activations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn deactivate(&mut self) -> Result<()> {
        self.deactivations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Hooks {
    activations: Arc<AtomicUsize>,
    deactivations: Arc<AtomicUsize>,
}

fn counting_block(runtime: &Runtime, name: &str, fail_activation: bool) -> (sigflow::BlockHandle, Hooks) {
    let activations = Arc::new(AtomicUsize::new(0));
    let deactivations = Arc::new(AtomicUsize::new(0));
    let block = Counting {
        activations: activations.clone(),
        deactivations: deactivations.clone(),
        fail_activation,
    };
    let handle = runtime.block(name, block, &Counting::layout());
    (handle, Hooks { activations, deactivations })
}

#[test]
fn double_commit_causes_no_churn() {
    let runtime = Runtime::new().unwrap();
    let (a, a_hooks) = counting_block(&runtime, "a", false);
    let (b, b_hooks) = counting_block(&runtime, "b", false);

    let topology = runtime.topology("top");
    topology.connect(&a, "0", &b, "0").unwrap();
    topology.commit().unwrap();
    assert_eq!(a_hooks.activations.load(Ordering::SeqCst), 1);
    assert_eq!(b_hooks.activations.load(Ordering::SeqCst), 1);

    // No intervening edit: the second commit is a no-op.
    topology.commit().unwrap();
    assert_eq!(a_hooks.activations.load(Ordering::SeqCst), 1);
    assert_eq!(b_hooks.activations.load(Ordering::SeqCst), 1);
    assert_eq!(a_hooks.deactivations.load(Ordering::SeqCst), 0);

    topology.disconnect_all();
    topology.commit().unwrap();
    assert_eq!(a_hooks.deactivations.load(Ordering::SeqCst), 1);
    assert_eq!(b_hooks.deactivations.load(Ordering::SeqCst), 1);
    runtime.shutdown();
}

#[test]
fn failed_activation_rolls_back() {
    let runtime = Runtime::new().unwrap();
    let (good, good_hooks) = counting_block(&runtime, "good", false);
    let (bad, _bad_hooks) = counting_block(&runtime, "bad", true);

    let topology = runtime.topology("top");
    topology.connect(&good, "0", &bad, "0").unwrap();
    let err = topology.commit().unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    // Whatever was activated during the failed commit has been undone.
    assert_eq!(
        good_hooks.activations.load(Ordering::SeqCst),
        good_hooks.deactivations.load(Ordering::SeqCst),
    );

    // The topology remains usable once the offender is unplugged.
    topology.disconnect(&good, "0", &bad, "0").unwrap();
    let (sink, _sink_hooks) = counting_block(&runtime, "sink", false);
    topology.connect(&good, "0", &sink, "0").unwrap();
    topology.commit().unwrap();
    runtime.shutdown();
}

#[test]
fn disconnect_requires_a_declared_flow() {
    let runtime = Runtime::new().unwrap();
    let (a, _ah) = counting_block(&runtime, "a", false);
    let (b, _bh) = counting_block(&runtime, "b", false);

    let topology = runtime.topology("top");
    let err = topology.disconnect(&a, "0", &b, "0").unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
    runtime.shutdown();
}

#[test]
fn connect_validates_port_names() {
    let runtime = Runtime::new().unwrap();
    let (a, _ah) = counting_block(&runtime, "a", false);
    let (b, _bh) = counting_block(&runtime, "b", false);

    let topology = runtime.topology("top");
    let err = topology.connect(&a, "7", &b, "0").unwrap_err();
    assert!(matches!(err, Error::PortNotFound { .. }));
    let err = topology.connect(&a, "0", &b, "widgets").unwrap_err();
    assert!(matches!(err, Error::PortNotFound { .. }));
    runtime.shutdown();
}

#[test]
fn commit_rejects_mismatched_dtypes() {
    let runtime = Runtime::new().unwrap();
    let narrow = DType::from_markup("int32").unwrap();
    let wide = DType::from_markup("float64").unwrap();
    let feeder = runtime.block("feeder", FeederSource::new(narrow), &FeederSource::layout(narrow));
    let collector = runtime.block("collector", CollectorSink::new(wide), &CollectorSink::layout(wide));

    let topology = runtime.topology("top");
    topology.connect(&feeder, "0", &collector, "0").unwrap();
    let err = topology.commit().unwrap_err();
    assert!(matches!(err, Error::TypeMismatch { .. }));
    runtime.shutdown();
}

#[test]
fn dot_markup_describes_the_graph() {
    let runtime = Runtime::new().unwrap();
    let dtype = DType::from_markup("int32").unwrap();
    let feeder = runtime.block("feeder", FeederSource::new(dtype), &FeederSource::layout(dtype));
    let collector = runtime.block("collector", CollectorSink::new(dtype), &CollectorSink::layout(dtype));

    let topology = runtime.topology("top");
    topology.connect(&feeder, "0", &collector, "0").unwrap();
    topology.commit().unwrap();

    let markup = topology.to_dot_markup(&DotOptions::default());
    assert!(markup.starts_with("digraph flat_flows {"));
    assert!(markup.contains("rankdir=LR"));
    assert!(markup.contains("feeder"));
    assert!(markup.contains("collector"));
    assert!(markup.contains(&format!("{}:__out__0 -> {}:__in__0;", feeder.uid(), collector.uid())));
    runtime.shutdown();
}

#[test]
fn stats_track_errors_and_drain() {
    /// Fails its third work call.
    struct Flaky {
        runs: usize,
    }
    impl Block for Flaky {
        fn work(&mut self, io: &mut WorkIo) -> Result<()> {
            self.runs += 1;
            if self.runs == 3 {
                return Err(Error::InvalidArgument("synthetic failure".into()));
            }
            let n = io.inputs[0].elements();
            io.inputs[0].consume(n);
            Ok(())
        }
    }

    let runtime = Runtime::new().unwrap();
    let dtype = DType::byte();
    let feeder = runtime.block("feeder", FeederSource::new(dtype), &FeederSource::layout(dtype));
    let flaky = runtime.block(
        "flaky",
        Flaky { runs: 0 },
        &PortLayout::new().input("0", dtype),
    );

    let topology = runtime.topology("top");
    topology.connect(&feeder, "0", &flaky, "0").unwrap();
    topology.commit().unwrap();

    // Feed until the third work call fires the synthetic failure.
    let mut stats = serde_json::Value::Null;
    for _ in 0..200 {
        feeder.call("feed_buffer", &[Value::from(vec![1u8, 2, 3])]).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        stats = topology.query_json_stats().unwrap();
        if stats["blocks"]
            .as_array()
            .unwrap()
            .iter()
            .any(|b| b["name"] == "flaky" && b["error_count"] == 1)
        {
            break;
        }
    }

    let blocks = stats["blocks"].as_array().unwrap();
    let flaky_stats = blocks.iter().find(|b| b["name"] == "flaky").unwrap();
    // The failing work call was counted and the block deactivated; the
    // rest of the topology (the feeder) kept running.
    assert_eq!(flaky_stats["error_count"], 1);
    assert_eq!(flaky_stats["active"], false);
    assert!(feeder.call("feed_buffer", &[Value::from(vec![9u8])]).is_ok());
    runtime.shutdown();
}
