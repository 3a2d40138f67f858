pub mod engine;
mod memory;

pub use engine::{Engine, KeyRange, ScanIterator, Status};
pub use memory::Memory;
