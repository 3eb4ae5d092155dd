//! Per-partition signature index.
//!
//! The index is layered:
//!
//! - [`IndexEngine`]: ordered byte tables with atomic batches
//!   ([`MemoryIndexEngine`], and `RedbIndexEngine` with the `redb` feature)
//! - [`PartitionIndex`]: reference-counted signatures, archive files and
//!   zero-reference records on top of an engine
//! - [`IndexFactory`]: opens the engine stored at a partition path

pub mod engine;
pub mod engines;
pub mod factory;
pub mod partition_index;

pub use engine::{BatchOp, FetchResult, IndexEngine, IndexTable, IterationCursor};
pub use engines::MemoryIndexEngine;
#[cfg(feature = "redb")]
pub use engines::RedbIndexEngine;
#[cfg(feature = "redb")]
pub use factory::RedbIndexFactory;
pub use factory::{IndexFactory, MemoryIndexFactory};
pub use partition_index::{AddOutcome, IndexStats, PartitionIndex, SweepReport};
