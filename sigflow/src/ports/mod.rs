//! Typed stream ports connecting blocks.
//!
//! Each block owns its ports exclusively while the worker actor holds it;
//! the producer-facing side of an input port (its accumulator, label and
//! message queues) is shared behind internal locks so upstream ports and
//! external callers can push from any thread.

pub mod input;
pub mod output;

pub use input::InputPort;
pub use output::OutputPort;
