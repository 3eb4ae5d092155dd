//! Resync and reconstruction.
//!
//! A resync attempt diffs every partition index of a store against the
//! catalog and prunes what the catalog no longer confirms. Each attempt owns
//! one ledger row; attempt numbers are strictly sequential per store.
//! Reconstruction rebuilds a single partition index from the catalog.

pub mod af_diff;
pub mod reconstruction;

use std::collections::BTreeSet;
use std::sync::Arc;

use ddb_core::{
    ArchFileId, DedupStore, MaintenanceReason, ResyncFlags, ResyncHistoryEntry, ResyncRequest,
    ResyncStatus, StoreFlags, AF_DIFF_FAILED_CODE,
};
use tracing::{error, info};

use crate::catalog::Catalog;
use crate::error::{ContextExt, EngineError, EngineResult, OperationContext, Phase};
use crate::process::IndexProcessHandle;

pub use af_diff::{af_diff, AfDiffOutcome};
pub use reconstruction::{run_reconstruction, ReconstructionReport};

/// Request recorded when an attempt is aborted, so the next cycle retries.
const RETRY_REQUEST_REASON: MaintenanceReason = MaintenanceReason::ControlledValidation;

/// Runs resync attempts for stores.
pub struct ResyncManager {
    catalog: Arc<dyn Catalog>,
    batch_size: usize,
}

impl ResyncManager {
    #[must_use]
    pub fn new(catalog: Arc<dyn Catalog>, batch_size: usize) -> Self {
        Self {
            catalog,
            batch_size: batch_size.max(1),
        }
    }

    /// Runs one attempt over `partitions` and returns its final ledger row.
    ///
    /// The diff of every partition completes before anything is pruned. A
    /// failed diff is recorded as `[53006, flags 5, reason 11, 0]` and the
    /// store stays queued for the next cycle; it is not an error here.
    ///
    /// # Errors
    ///
    /// Returns a wrapped catalog error if the ledger or store flags cannot
    /// be written.
    pub async fn run_attempt(
        &self,
        store: &DedupStore,
        partitions: &[Arc<IndexProcessHandle>],
        now_ms: u64,
    ) -> EngineResult<ResyncHistoryEntry> {
        let ctx = OperationContext::new(Phase::Resync).store(store.id);
        let catalog = self.catalog.as_ref();

        let attempt_no = catalog
            .latest_resync_history(store.id)
            .await
            .catalog_ctx(ctx)?
            .map_or(1, |latest| latest.attempt_no + 1);
        let request = store.resync_request.unwrap_or(ResyncRequest {
            reason: MaintenanceReason::ControlledValidation,
            flags: ResyncFlags::SCHEDULED,
            requested_ms: now_ms,
        });
        let mut entry = ResyncHistoryEntry {
            store_id: store.id,
            attempt_no,
            maintenance_time_ms: now_ms,
            maintenance_reason: request.reason,
            resync_flags: request.flags,
            status: ResyncStatus::InProgress,
            num_resynced_afids: 0,
            added_ms: now_ms,
        };
        catalog
            .append_resync_history(entry.clone())
            .await
            .catalog_ctx(ctx)?;
        catalog
            .update_store_flags(store.id, StoreFlags::RESYNC_IN_PROGRESS, StoreFlags::empty())
            .await
            .catalog_ctx(ctx)?;
        info!(
            store_id = %store.id,
            attempt = attempt_no,
            reason = request.reason.code(),
            partitions = partitions.len(),
            "{}",
            request.reason.description()
        );

        match self.resync_partitions(store, partitions).await {
            Ok(pruned) => {
                entry.status = ResyncStatus::Success;
                entry.num_resynced_afids = pruned;
                catalog
                    .update_resync_history(entry.clone())
                    .await
                    .catalog_ctx(ctx)?;
                catalog
                    .complete_resync(store.id, now_ms)
                    .await
                    .catalog_ctx(ctx)?;
                info!(store_id = %store.id, attempt = attempt_no, pruned, "resync succeeded");
            }
            Err(err) => {
                error!(
                    store_id = %store.id,
                    attempt = attempt_no,
                    error = %err,
                    "DDB and CS Af diff failed. iRet [{AF_DIFF_FAILED_CODE}]"
                );
                entry.status = ResyncStatus::AfDiffFailed;
                entry.resync_flags = ResyncFlags::SCHEDULED;
                entry.maintenance_reason = RETRY_REQUEST_REASON;
                entry.num_resynced_afids = 0;
                catalog
                    .update_resync_history(entry.clone())
                    .await
                    .catalog_ctx(ctx)?;
                catalog
                    .request_resync(
                        store.id,
                        ResyncRequest {
                            reason: RETRY_REQUEST_REASON,
                            flags: ResyncFlags::SCHEDULED,
                            requested_ms: now_ms,
                        },
                    )
                    .await
                    .catalog_ctx(ctx)?;
            }
        }

        catalog
            .update_store_flags(store.id, StoreFlags::empty(), StoreFlags::RESYNC_IN_PROGRESS)
            .await
            .catalog_ctx(ctx)?;
        metrics::counter!(
            "ddb_resync_attempts_total",
            "status" => entry.status.code().to_string()
        )
        .increment(1);
        Ok(entry)
    }

    /// Diffs every partition, then prunes. Returns the archive files pruned.
    async fn resync_partitions(
        &self,
        store: &DedupStore,
        partitions: &[Arc<IndexProcessHandle>],
    ) -> EngineResult<u64> {
        let mut plan: Vec<(&Arc<IndexProcessHandle>, BTreeSet<ArchFileId>)> =
            Vec::with_capacity(partitions.len());
        for handle in partitions {
            let outcome = af_diff(self.catalog.as_ref(), handle, store.id, self.batch_size).await?;
            plan.push((handle, outcome.prunable));
        }

        let mut pruned = BTreeSet::new();
        for (handle, prunable) in plan {
            if prunable.is_empty() {
                continue;
            }
            let ctx = OperationContext::new(Phase::Resync)
                .store(store.id)
                .partition(handle.substore());
            handle
                .drop_archive_files(prunable.iter().copied().collect())
                .await
                .index_ctx(ctx)?;
            pruned.extend(prunable);
        }
        Ok(pruned.len() as u64)
    }
}

impl std::fmt::Debug for ResyncManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResyncManager")
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

/// Maps a resync failure to the error callers see when they need one.
#[must_use]
pub fn af_diff_failed(store: &DedupStore) -> EngineError {
    EngineError::AfDiffFailed {
        store: store.id,
        code: AF_DIFF_FAILED_CODE,
    }
}
