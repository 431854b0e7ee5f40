//! Historical writers

mod local;
mod memory;

pub use local::{LocalWriter, LocalWriterConfig};
pub use memory::MemoryWriter;
