//! A dataflow execution runtime for streaming signal processing.
//!
//! Computational [blocks](Block) connected by typed streaming ports form a
//! [`Topology`]; a scheduler thread pool moves bulk sample buffers between
//! them with minimal copying while preserving ordering, back-pressure, and
//! stream-aligned metadata ([labels](Label)). The pieces:
//!
//! * buffers and managers live in [`sigflow_buffer`], re-exported under
//!   [`buffer`];
//! * a [`BufferAccumulator`] amalgamates arriving chunks so each input
//!   port presents the largest contiguous run it can;
//! * a worker actor grants exclusive block access, mediating between the
//!   scheduler and external configuration calls;
//! * the [`Topology`] resolves declared flows (including pass-through
//!   boundaries of nested topologies) into real edges at
//!   [`commit`](Topology::commit).
//!
//! # Examples
//!
//! ```
//! use sigflow::{testers, DType, Runtime, Value};
//! use std::time::Duration;
//!
//! let runtime = Runtime::new().unwrap();
//! let dtype = DType::from_markup("int32").unwrap();
//! let feeder = runtime.block(
//!     "feeder",
//!     testers::FeederSource::new(dtype),
//!     &testers::FeederSource::layout(dtype),
//! );
//! let collector = runtime.block(
//!     "collector",
//!     testers::CollectorSink::new(dtype),
//!     &testers::CollectorSink::layout(dtype),
//! );
//!
//! let topology = runtime.topology("demo");
//! topology.connect(&feeder, "0", &collector, "0").unwrap();
//! topology.commit().unwrap();
//!
//! let samples: Vec<u8> = (1i32..=4).flat_map(|v| v.to_ne_bytes()).collect();
//! feeder.call("feed_buffer", &[Value::from(samples.clone())]).unwrap();
//!
//! let mut collected = Vec::new();
//! for _ in 0..500 {
//!     collected = collector.call("get_buffer", &[]).unwrap().as_bytes().unwrap().to_vec();
//!     if collected.len() == samples.len() {
//!         break;
//!     }
//!     std::thread::sleep(Duration::from_millis(2));
//! }
//! assert_eq!(collected, samples);
//! runtime.shutdown();
//! ```

#![forbid(missing_docs)]

pub mod accumulator;
pub mod block;
pub mod errors;
pub mod label;
pub mod logging;
pub mod ports;
pub mod runtime;
pub mod scheduler;
pub mod testers;
pub mod topology;
pub mod value;

mod actor;

/// The buffer and memory layer.
pub use sigflow_buffer as buffer;

#[cfg(unix)]
pub use sigflow_buffer::CircularPool;
pub use sigflow_buffer::{BufferChunk, BufferManager, DType, GenericPool, ManagedBuffer, SharedBuffer, TypeCode};

pub use crate::accumulator::BufferAccumulator;
pub use crate::block::{Block, BlockHandle, PortLayout, WorkInfo, WorkIo};
pub use crate::errors::{Error, Result};
pub use crate::label::Label;
pub use crate::ports::{InputPort, OutputPort};
pub use crate::runtime::{BlockFactory, Runtime};
pub use crate::scheduler::{Config, YieldMode};
pub use crate::topology::{DotOptions, Node, Topology};
pub use crate::value::Value;
