//! Catalog entities shared by every layer of the engine.
//!
//! These mirror the handful of catalog tables the media agent reads and
//! writes: stores, substores (partitions), archive files, pending-delete and
//! tracking rows, usage history, and the resync and recovery ledgers.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::flags::{
    RecoveryFlags, ResyncFlags, StoreExtendedFlags, StoreFlags, SubstoreExtendedFlags,
    SubstoreFlags,
};
use crate::ids::{ArchFileId, JobId, StoreId, SubstoreId};
use crate::maintenance::{MaintenanceReason, ResyncStatus};
use crate::signature::Signature;

// ---------------------------------------------------------------------------
// Stores and partitions
// ---------------------------------------------------------------------------

/// Resync work queued on a store until an attempt succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResyncRequest {
    pub reason: MaintenanceReason,
    pub flags: ResyncFlags,
    pub requested_ms: u64,
}

/// A deduplication store: one logical dedup unit made of 1..N partitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DedupStore {
    pub id: StoreId,
    pub name: String,
    /// `CreatedTime`, milliseconds since Unix epoch.
    pub created_time_ms: u64,
    pub last_resync_ms: Option<u64>,
    pub flags: StoreFlags,
    pub extended_flags: StoreExtendedFlags,
    /// Per-store mark-and-sweep interval, overriding the agent setting.
    pub mark_and_sweep_interval_secs: Option<u64>,
    pub resync_request: Option<ResyncRequest>,
}

impl DedupStore {
    /// Age of the store at `now_ms`, saturating at zero for future timestamps.
    #[must_use]
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.created_time_ms)
    }
}

/// Availability of a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PartitionState {
    Online,
    /// The backing path is unreachable and the index process is down.
    Offline,
    /// An operator marked the partition for recovery; it needs reconstruction.
    MarkedOffline,
}

/// One signature-index shard of a store (`idxsidbsubstore` row).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Substore {
    pub id: SubstoreId,
    pub store_id: StoreId,
    pub path: String,
    /// Host that owns the partition.
    pub media_agent: String,
    pub state: PartitionState,
    pub flags: SubstoreFlags,
    pub extended_flags: SubstoreExtendedFlags,
}

impl Substore {
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.state == PartitionState::Online
    }

    #[must_use]
    pub fn is_distributor(&self) -> bool {
        self.extended_flags.is_distributor()
    }
}

// ---------------------------------------------------------------------------
// Archive files
// ---------------------------------------------------------------------------

/// A chunk referenced by an archive file, with the partition that indexes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRef {
    pub signature: Signature,
    pub size: u64,
    pub substore_id: SubstoreId,
}

/// Catalog record for a unit of backed-up data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveFile {
    pub id: ArchFileId,
    pub job_id: JobId,
    pub store_id: StoreId,
    /// Cleared by phase-1 logical deletion.
    pub valid: bool,
    pub created_ms: u64,
    /// Chunks in file order.
    pub chunks: Vec<ChunkRef>,
}

impl ArchiveFile {
    /// Partitions that index at least one chunk of this file.
    #[must_use]
    pub fn substores(&self) -> BTreeSet<SubstoreId> {
        self.chunks.iter().map(|c| c.substore_id).collect()
    }

    /// Chunks of this file indexed by `substore`, in file order.
    pub fn chunks_on(&self, substore: SubstoreId) -> impl Iterator<Item = &ChunkRef> {
        self.chunks.iter().filter(move |c| c.substore_id == substore)
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.chunks.iter().map(|c| c.size).sum()
    }
}

/// What the catalog knows about an archive file during an AF diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AfState {
    Valid,
    /// Logically deleted, awaiting pruning.
    Invalid,
    /// No catalog row.
    Unknown,
}

/// One row of an AF-diff response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AfValidity {
    pub arch_file_id: ArchFileId,
    pub state: AfState,
}

// ---------------------------------------------------------------------------
// Pruning rows
// ---------------------------------------------------------------------------

/// Phase-1 logical deletion awaiting phase-2 processing (`mmdeletedaf`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingDeleteEntry {
    pub arch_file_id: ArchFileId,
    pub store_id: StoreId,
    pub job_id: JobId,
    pub added_ms: u64,
    /// Tracking rows have been created for every partition of the file.
    pub expanded: bool,
}

/// Per-partition phase-2 work item (`mmdeletedarchfiletracking`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletedAfTracking {
    pub arch_file_id: ArchFileId,
    pub store_id: StoreId,
    pub substore_id: SubstoreId,
    pub added_ms: u64,
}

/// Counters reported by a running partition index (`idxSidbUsageHistory`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSample {
    pub store_id: StoreId,
    pub substore_id: SubstoreId,
    pub primary_entries: u64,
    pub zero_ref_count: u64,
    pub modified_ms: u64,
}

// ---------------------------------------------------------------------------
// Ledgers
// ---------------------------------------------------------------------------

/// One row of `IdxSIDBResyncHistory`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResyncHistoryEntry {
    pub store_id: StoreId,
    /// Monotonic per store, starting at 1.
    pub attempt_no: u32,
    pub maintenance_time_ms: u64,
    pub maintenance_reason: MaintenanceReason,
    pub resync_flags: ResyncFlags,
    pub status: ResyncStatus,
    #[serde(rename = "numResyncedAFIDs")]
    pub num_resynced_afids: u64,
    pub added_ms: u64,
}

impl ResyncHistoryEntry {
    #[must_use]
    pub fn has_reason(&self, reason: MaintenanceReason) -> bool {
        self.maintenance_reason == reason
    }

    #[must_use]
    pub fn maintenance_reason_desc(&self) -> &'static str {
        self.maintenance_reason.description()
    }
}

/// Outcome of a reconstruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecoveryStatus {
    Succeeded,
    Failed,
}

/// One row of `IdxSIDBRecoveryHistory`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryHistoryEntry {
    pub store_id: StoreId,
    pub substore_id: SubstoreId,
    pub recovery_flags: RecoveryFlags,
    pub status: RecoveryStatus,
    pub started_ms: u64,
    pub finished_ms: u64,
    /// Archive files added back to the index.
    pub restored_afs: u64,
    /// Archive files removed from the index by validation.
    pub pruned_afs: u64,
}
