//! Shared sample-buffer allocations and checkout for the sigflow runtime.
//!
//! The types here move bulk sample data between blocks without copying:
//!
//! * [`SharedBuffer`]: a contiguous allocation owned by a reference-counted
//!   storage container, optionally mapped twice at consecutive virtual
//!   addresses so reads past the end wrap without modulo arithmetic.
//! * [`ManagedBuffer`]: a checked-out slab that returns itself to the
//!   issuing [`BufferManager`] when the last clone drops.
//! * [`BufferChunk`]: a value-like `(address, length, dtype)` view into a
//!   managed buffer, the unit that accumulators and ports traffic in.
//! * [`BufferManager`]: the checkout interface, with a generic slab pool
//!   and a circular (double-mapped) pool.
//!
//! # Examples
//!
//! ```
//! use sigflow_buffer::{BufferManager, DType, GenericPool};
//!
//! let pool = GenericPool::new(4, 1024).unwrap();
//! let mut chunk = pool.pop().unwrap().as_chunk(DType::from_markup("int32").unwrap());
//! chunk.as_mut_slice()[..4].copy_from_slice(&7i32.to_ne_bytes());
//! drop(chunk); // slab returns to the pool
//! assert!(!pool.empty());
//! ```

pub mod chunk;
pub mod dtype;
pub mod managed;
pub mod manager;
pub mod shared;

pub use chunk::BufferChunk;
pub use dtype::{DType, TypeCode};
pub use managed::ManagedBuffer;
pub use manager::{BufferManager, CircularPool, GenericPool};
pub use shared::SharedBuffer;
