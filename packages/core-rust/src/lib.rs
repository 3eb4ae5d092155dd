//! Deduplication store core: catalog identifiers, typed flag bitsets,
//! content signatures, routing hash, injectable clock and maintenance codes.

pub mod clock;
pub mod flags;
pub mod hash;
pub mod ids;
pub mod maintenance;
pub mod signature;
pub mod types;

pub use clock::{ClockSource, ManualClock, SystemClock, DAY_MS};
pub use flags::{
    RecoveryFlags, ResyncFlags, StoreExtendedFlags, StoreFlags, SubstoreExtendedFlags,
    SubstoreFlags,
};
pub use ids::{ArchFileId, JobId, StoreId, SubstoreId};
pub use maintenance::{
    MaintenanceReason, ReconstructionMode, ResyncStatus, AF_DIFF_FAILED_CODE,
    SKIP_VALIDATION_MARKER,
};
pub use signature::Signature;
pub use types::{
    AfState, AfValidity, ArchiveFile, ChunkRef, DedupStore, DeletedAfTracking, PartitionState,
    PendingDeleteEntry, RecoveryHistoryEntry, RecoveryStatus, ResyncHistoryEntry, ResyncRequest,
    Substore, UsageSample,
};
