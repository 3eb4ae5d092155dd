//! The three-phase pruning pipeline.
//!
//! 1. [`delete_job`]: logical deletion, driven by job deletion
//! 2. [`run_catalog_cleanup`]: catalog cleanup, driven by the scheduler
//! 3. [`run_phase3`]: mark-and-sweep and zero-ref reclamation per partition

pub mod cleanup;
pub mod logical;
pub mod reclaim;

pub use cleanup::{run_catalog_cleanup, CleanupReport};
pub use logical::delete_job;
pub use reclaim::{mark_and_sweep_interval, record_usage, run_phase3, sweep_due, Phase3Report};
