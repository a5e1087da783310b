//! Shared utilities.
//!
//! - Buffer pooling for the streaming I/O layer

pub mod pool;

pub use pool::{BufferPool, PooledBuffer};
