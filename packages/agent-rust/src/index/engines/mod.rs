//! Concrete [`IndexEngine`](super::IndexEngine) implementations.

pub mod memory;
#[cfg(feature = "redb")]
pub mod redb;

pub use memory::MemoryIndexEngine;
#[cfg(feature = "redb")]
pub use self::redb::RedbIndexEngine;
