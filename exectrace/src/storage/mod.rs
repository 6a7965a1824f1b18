//! Storage primitives used by the trace engine
//!
//! - [`ring_buffer`]: single-writer/single-reader circular buffer with explicit growth
//! - [`registry`]: stable-address tables mapping host ids to records

pub mod registry;
pub mod ring_buffer;

pub use registry::Registry;
pub use ring_buffer::RingBuffer;
