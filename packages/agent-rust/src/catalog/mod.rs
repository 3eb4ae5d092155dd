//! Catalog access: the single source of truth shared by every partition.
//!
//! The agent only touches the handful of tables modeled in `ddb_core::types`.
//! [`Catalog`] is the seam; [`InMemoryCatalog`] is the implementation used by
//! tests and by the standalone binary.

pub mod memory;

use async_trait::async_trait;
use ddb_core::{
    AfValidity, ArchFileId, ArchiveFile, ChunkRef, DedupStore, DeletedAfTracking, JobId,
    PartitionState, PendingDeleteEntry, RecoveryHistoryEntry, ResyncHistoryEntry, ResyncRequest,
    StoreExtendedFlags, StoreFlags, StoreId, Substore, SubstoreId, UsageSample,
};

pub use memory::{AfDiffFault, FaultMode, InMemoryCatalog};

/// Partition description supplied when provisioning a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPartition {
    pub path: String,
    pub media_agent: String,
}

/// Store description supplied when provisioning.
#[derive(Debug, Clone, PartialEq)]
pub struct NewStore {
    pub name: String,
    pub created_time_ms: u64,
    pub flags: StoreFlags,
    pub extended_flags: StoreExtendedFlags,
    pub partitions: Vec<NewPartition>,
}

/// Catalog tables used by the deduplication engine.
///
/// All methods are async to allow remote catalogs. Implementations must make
/// each method atomic with respect to the others.
#[async_trait]
pub trait Catalog: Send + Sync {
    // -- Stores -------------------------------------------------------------

    /// Inserts a store and its partitions, assigning identifiers.
    /// Partitions start `Online` with no distributor bit.
    async fn create_store(&self, new: NewStore) -> anyhow::Result<DedupStore>;

    async fn store(&self, id: StoreId) -> anyhow::Result<Option<DedupStore>>;

    async fn store_by_name(&self, name: &str) -> anyhow::Result<Option<DedupStore>>;

    async fn stores(&self) -> anyhow::Result<Vec<DedupStore>>;

    /// Removes the store and every row that belongs to it.
    async fn delete_store(&self, id: StoreId) -> anyhow::Result<bool>;

    /// Sets `insert` and clears `remove` in one step, returning the new flags.
    async fn update_store_flags(
        &self,
        id: StoreId,
        insert: StoreFlags,
        remove: StoreFlags,
    ) -> anyhow::Result<StoreFlags>;

    async fn set_store_created_time(&self, id: StoreId, created_time_ms: u64)
        -> anyhow::Result<()>;

    async fn set_mark_and_sweep_interval(
        &self,
        id: StoreId,
        interval_secs: Option<u64>,
    ) -> anyhow::Result<()>;

    /// Queues resync work and sets `NEEDS_AUTO_RESYNC`.
    async fn request_resync(&self, id: StoreId, request: ResyncRequest) -> anyhow::Result<()>;

    /// Clears the queued resync and records the completion time.
    async fn complete_resync(&self, id: StoreId, now_ms: u64) -> anyhow::Result<()>;

    // -- Substores ----------------------------------------------------------

    /// Partitions of a store ordered by id.
    async fn substores(&self, store: StoreId) -> anyhow::Result<Vec<Substore>>;

    async fn substore(&self, id: SubstoreId) -> anyhow::Result<Option<Substore>>;

    async fn set_substore_state(&self, id: SubstoreId, state: PartitionState)
        -> anyhow::Result<()>;

    /// Gives `substore` the distributor bit and clears it on every other
    /// partition of `store`, atomically.
    async fn set_distributor(&self, store: StoreId, substore: SubstoreId) -> anyhow::Result<()>;

    // -- Archive files ------------------------------------------------------

    async fn insert_archive_file(
        &self,
        job: JobId,
        store: StoreId,
        created_ms: u64,
        chunks: Vec<ChunkRef>,
    ) -> anyhow::Result<ArchiveFile>;

    async fn archive_file(&self, id: ArchFileId) -> anyhow::Result<Option<ArchiveFile>>;

    /// Every archive file row of a store, valid or not, ordered by id.
    async fn archive_files(&self, store: StoreId) -> anyhow::Result<Vec<ArchiveFile>>;

    async fn job_archive_files(&self, job: JobId) -> anyhow::Result<Vec<ArchiveFile>>;

    /// Phase 1: marks every valid archive file of `job` invalid and inserts a
    /// pending-delete row for each. Returns only the newly invalidated files.
    async fn invalidate_job(&self, job: JobId, now_ms: u64) -> anyhow::Result<Vec<ArchFileId>>;

    /// Phase 1 for individual archive files, e.g. a backup that failed after
    /// its row was written. Returns only the newly invalidated files.
    async fn invalidate_archive_files(
        &self,
        ids: &[ArchFileId],
        now_ms: u64,
    ) -> anyhow::Result<Vec<ArchFileId>>;

    /// AF-diff procedure: reports what the catalog knows about each id.
    ///
    /// A well-behaved catalog answers with exactly one row per requested id.
    async fn validate_archive_files(
        &self,
        store: StoreId,
        ids: &[ArchFileId],
    ) -> anyhow::Result<Vec<AfValidity>>;

    /// Deletes an archive file row outright.
    async fn remove_archive_file(&self, id: ArchFileId) -> anyhow::Result<bool>;

    // -- Pending deletes ----------------------------------------------------

    async fn pending_deletes(&self, store: StoreId) -> anyhow::Result<Vec<PendingDeleteEntry>>;

    /// Creates one tracking row per partition and marks the entry expanded.
    async fn expand_pending(
        &self,
        arch_file: ArchFileId,
        substores: &[SubstoreId],
        now_ms: u64,
    ) -> anyhow::Result<()>;

    async fn tracking_rows(&self, store: StoreId) -> anyhow::Result<Vec<DeletedAfTracking>>;

    async fn complete_tracking(
        &self,
        arch_file: ArchFileId,
        substore: SubstoreId,
    ) -> anyhow::Result<bool>;

    /// Removes the pending entry and the archive file row once the entry is
    /// expanded and no tracking rows remain. Returns `true` if removed.
    async fn finalize_pending(&self, arch_file: ArchFileId) -> anyhow::Result<bool>;

    /// Pending-delete rows plus outstanding tracking rows for a store.
    async fn pending_delete_count(&self, store: StoreId) -> anyhow::Result<u64>;

    // -- Usage history ------------------------------------------------------

    async fn record_usage(&self, sample: UsageSample) -> anyhow::Result<()>;

    async fn latest_usage(&self, substore: SubstoreId) -> anyhow::Result<Option<UsageSample>>;

    // -- Ledgers ------------------------------------------------------------

    /// Appends a resync row. `attempt_no` must be one more than the latest.
    async fn append_resync_history(&self, entry: ResyncHistoryEntry) -> anyhow::Result<()>;

    /// Replaces the row with the same store and attempt number.
    async fn update_resync_history(&self, entry: ResyncHistoryEntry) -> anyhow::Result<()>;

    async fn latest_resync_history(
        &self,
        store: StoreId,
    ) -> anyhow::Result<Option<ResyncHistoryEntry>>;

    async fn resync_history(&self, store: StoreId) -> anyhow::Result<Vec<ResyncHistoryEntry>>;

    async fn append_recovery_history(&self, entry: RecoveryHistoryEntry) -> anyhow::Result<()>;

    async fn recovery_history(&self, store: StoreId)
        -> anyhow::Result<Vec<RecoveryHistoryEntry>>;
}
