//! State providers

mod memory;
mod redis;

pub use memory::MemoryState;
pub use redis::{RedisState, RedisStateConfig};
