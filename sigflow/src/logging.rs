//! Event vocabulary for the runtime's logging streams.
//!
//! Install actions on the runtime's registry before building topologies:
//!
//! ```
//! use sigflow::logging::{SCHEDULER_STREAM, SchedulerEvent};
//!
//! let runtime = sigflow::Runtime::new().unwrap();
//! runtime.log_registry().insert::<SchedulerEvent>(
//!     SCHEDULER_STREAM,
//!     Box::new(|_lower, batch| for (time, event) in batch {
//!         eprintln!("{:?}\t{:?}", time, event);
//!     }),
//! );
//! ```

use serde::Serialize;

/// Name of the scheduler event stream.
pub const SCHEDULER_STREAM: &str = "sigflow/scheduler";

/// Name of the topology event stream.
pub const TOPOLOGY_STREAM: &str = "sigflow/topology";

/// Events emitted by scheduler threads and worker actors.
#[derive(Clone, Debug, Serialize)]
pub enum SchedulerEvent {
    /// A worker thread came up.
    ThreadStart {
        /// Index of the thread within its pool.
        thread: usize,
    },
    /// A worker thread exited.
    ThreadStop {
        /// Index of the thread within its pool.
        thread: usize,
    },
    /// A block's `work()` ran.
    Work {
        /// Uid of the block.
        block: u64,
        /// Elements consumed across input ports.
        consumed: u64,
        /// Elements produced across output ports.
        produced: u64,
    },
    /// A block's `work()` or slot call failed; the block was deactivated.
    BlockError {
        /// Uid of the block.
        block: u64,
        /// Rendered error message.
        message: String,
    },
}

/// Events emitted while editing and committing topologies.
#[derive(Clone, Debug, Serialize)]
pub enum TopologyEvent {
    /// A commit resolved and installed a flow set.
    Commit {
        /// Uid of the topology.
        topology: u64,
        /// Real edges installed after resolution.
        flows: usize,
    },
    /// A block was activated.
    Activate {
        /// Uid of the block.
        block: u64,
    },
    /// A block was deactivated.
    Deactivate {
        /// Uid of the block.
        block: u64,
    },
}

/// A logger of scheduler events.
pub type SchedulerLogger = sigflow_logging::Logger<SchedulerEvent>;

/// A logger of topology events.
pub type TopologyLogger = sigflow_logging::Logger<TopologyEvent>;
