//! Bounded in-memory history: per-symbol ring buffers owned by a manager
//! that enforces a global memory ceiling.

pub mod manager;
pub mod ring_buffer;

pub use manager::{points_for_retention, recommended_memory_limit_mb, MemoryManager};
pub use ring_buffer::RingBuffer;
