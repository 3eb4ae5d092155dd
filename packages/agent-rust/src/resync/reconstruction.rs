//! Partition index reconstruction.
//!
//! Regular reconstruction restores the archive files the index is missing
//! and then validates the index against the catalog. Full reconstruction
//! drops the index, restores every valid archive file and leaves
//! verification to a follow-up resync.

use std::collections::BTreeSet;

use ddb_core::{
    ArchFileId, ClockSource, DedupStore, MaintenanceReason, ReconstructionMode,
    RecoveryHistoryEntry, RecoveryStatus, ResyncFlags, ResyncRequest, StoreId, Substore,
    SubstoreId, AF_DIFF_FAILED_CODE, DAY_MS, SKIP_VALIDATION_MARKER,
};
use tracing::{error, info, warn};

use super::af_diff::af_diff;
use super::af_diff_failed;
use crate::catalog::Catalog;
use crate::config::ResyncConfig;
use crate::error::{ContextExt, EngineResult, OperationContext, Phase};
use crate::process::{IndexProcessHandle, RebuildPlan, RoutedArchiveFile};

/// What a reconstruction did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconstructionReport {
    pub store: StoreId,
    pub substore: SubstoreId,
    pub requested: ReconstructionMode,
    /// Differs from `requested` when the store is too old for Regular.
    pub performed: ReconstructionMode,
    pub restored_afs: u64,
    pub pruned_afs: u64,
    /// DDB validation ran against the rebuilt index.
    pub validated: bool,
    /// Operator-facing markers logged during the run.
    pub markers: Vec<String>,
}

impl ReconstructionReport {
    #[must_use]
    pub fn skipped_validation(&self) -> bool {
        self.markers.iter().any(|m| m == SKIP_VALIDATION_MARKER)
    }
}

/// Mode actually used for a request against `store` at `now_ms`.
#[must_use]
pub fn effective_mode(
    requested: ReconstructionMode,
    store: &DedupStore,
    config: &ResyncConfig,
    now_ms: u64,
) -> ReconstructionMode {
    let window = config.reconstruction_validity_days.saturating_mul(DAY_MS);
    if requested == ReconstructionMode::Regular && store.age_ms(now_ms) > window {
        ReconstructionMode::Full
    } else {
        requested
    }
}

/// Rebuilds the index served by `handle` and records the outcome in the
/// recovery ledger.
///
/// # Errors
///
/// Returns `EngineError::AfDiffFailed` when Regular validation cannot
/// complete, or a wrapped catalog or index error. A failed run is still
/// recorded in the recovery ledger.
#[allow(clippy::too_many_arguments)]
pub async fn run_reconstruction(
    catalog: &dyn Catalog,
    handle: &IndexProcessHandle,
    store: &DedupStore,
    substore: &Substore,
    requested: ReconstructionMode,
    config: &ResyncConfig,
    batch_size: usize,
    clock: &dyn ClockSource,
) -> EngineResult<ReconstructionReport> {
    let ctx = OperationContext::new(Phase::Reconstruction)
        .store(store.id)
        .partition(substore.id);
    let started_ms = clock.now();
    let performed = effective_mode(requested, store, config, started_ms);
    if performed != requested {
        warn!(
            store_id = %store.id,
            substore_id = %substore.id,
            age_days = store.age_ms(started_ms) / DAY_MS,
            "store is older than the reconstruction validity window, running full reconstruction"
        );
    }
    info!(
        store_id = %store.id,
        substore_id = %substore.id,
        mode = %performed,
        "reconstruction started"
    );

    let mut report = ReconstructionReport {
        store: store.id,
        substore: substore.id,
        requested,
        performed,
        restored_afs: 0,
        pruned_afs: 0,
        validated: false,
        markers: Vec::new(),
    };
    let result = rebuild(
        catalog,
        handle,
        store,
        substore,
        batch_size,
        started_ms,
        &mut report,
    )
    .await;

    let status = if result.is_ok() {
        RecoveryStatus::Succeeded
    } else {
        RecoveryStatus::Failed
    };
    catalog
        .append_recovery_history(RecoveryHistoryEntry {
            store_id: store.id,
            substore_id: substore.id,
            recovery_flags: performed.recovery_flags(),
            status,
            started_ms,
            finished_ms: clock.now(),
            restored_afs: report.restored_afs,
            pruned_afs: report.pruned_afs,
        })
        .await
        .catalog_ctx(ctx)?;
    metrics::counter!("ddb_reconstructions_total", "mode" => performed.to_string()).increment(1);

    result?;
    info!(
        store_id = %store.id,
        substore_id = %substore.id,
        mode = %performed,
        restored = report.restored_afs,
        pruned = report.pruned_afs,
        "reconstruction finished"
    );
    Ok(report)
}

async fn rebuild(
    catalog: &dyn Catalog,
    handle: &IndexProcessHandle,
    store: &DedupStore,
    substore: &Substore,
    batch_size: usize,
    now_ms: u64,
    report: &mut ReconstructionReport,
) -> EngineResult<()> {
    let ctx = OperationContext::new(Phase::Reconstruction)
        .store(store.id)
        .partition(substore.id);
    let catalog_files: Vec<RoutedArchiveFile> = catalog
        .archive_files(store.id)
        .await
        .catalog_ctx(ctx)?
        .into_iter()
        .filter(|af| af.valid)
        .filter_map(|af| {
            let chunks: Vec<_> = af
                .chunks_on(substore.id)
                .map(|c| (c.signature, c.size))
                .collect();
            (!chunks.is_empty()).then_some(RoutedArchiveFile {
                arch_file: af.id,
                chunks,
            })
        })
        .collect();

    match report.performed {
        ReconstructionMode::Regular => {
            let present: BTreeSet<ArchFileId> = handle
                .all_archive_files()
                .await
                .index_ctx(ctx)?
                .into_iter()
                .collect();
            let delta = catalog_files
                .into_iter()
                .filter(|af| !present.contains(&af.arch_file))
                .collect();
            report.restored_afs = handle
                .rebuild(RebuildPlan {
                    clear: false,
                    archive_files: delta,
                    now_ms,
                })
                .await
                .index_ctx(ctx)?;

            let outcome = match af_diff(catalog, handle, store.id, batch_size).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    let failure = af_diff_failed(store);
                    error!(
                        store_id = %store.id,
                        substore_id = %substore.id,
                        error = %err,
                        "DDB and CS Af diff failed. iRet [{AF_DIFF_FAILED_CODE}]"
                    );
                    return Err(failure);
                }
            };
            report.validated = true;
            if !outcome.prunable.is_empty() {
                report.pruned_afs = handle
                    .drop_archive_files(outcome.prunable.into_iter().collect())
                    .await
                    .index_ctx(ctx)?;
            }
        }
        ReconstructionMode::Full => {
            report.restored_afs = handle
                .rebuild(RebuildPlan {
                    clear: true,
                    archive_files: catalog_files,
                    now_ms,
                })
                .await
                .index_ctx(ctx)?;
            info!(store_id = %store.id, substore_id = %substore.id, "{SKIP_VALIDATION_MARKER}");
            report.markers.push(SKIP_VALIDATION_MARKER.to_string());
            catalog
                .request_resync(
                    store.id,
                    ResyncRequest {
                        reason: MaintenanceReason::PostReconstruction,
                        flags: ResyncFlags::SCHEDULED,
                        requested_ms: now_ms,
                    },
                )
                .await
                .catalog_ctx(ctx)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use ddb_core::{ChunkRef, JobId, ManualClock, Signature, StoreExtendedFlags, StoreFlags};

    use super::*;
    use crate::catalog::{AfDiffFault, FaultMode, InMemoryCatalog, NewPartition, NewStore};
    use crate::chunk_store::MemoryChunkStore;
    use crate::config::ConfigHandle;
    use crate::error::EngineError;
    use crate::index::MemoryIndexFactory;
    use crate::process::IndexProcesses;
    use crate::pruning::delete_job;

    const NOW: u64 = 10 * DAY_MS;

    struct Fixture {
        catalog: InMemoryCatalog,
        factory: Arc<MemoryIndexFactory>,
        processes: IndexProcesses,
        store: DedupStore,
        part: Substore,
        clock: ManualClock,
    }

    async fn fixture() -> Fixture {
        let catalog = InMemoryCatalog::new();
        let store = catalog
            .create_store(NewStore {
                name: "pool".to_string(),
                created_time_ms: 0,
                flags: StoreFlags::PRUNING_ENABLED,
                extended_flags: StoreExtendedFlags::DEFAULT,
                partitions: vec![NewPartition {
                    path: "/ddb/p0".to_string(),
                    media_agent: "ma1".to_string(),
                }],
            })
            .await
            .unwrap();
        let part = catalog.substores(store.id).await.unwrap().remove(0);
        let factory = Arc::new(MemoryIndexFactory::new());
        let processes = IndexProcesses::new(
            factory.clone(),
            Arc::new(MemoryChunkStore::new()),
            Arc::new(ConfigHandle::default()),
        );
        Fixture {
            catalog,
            factory,
            processes,
            store,
            part,
            clock: ManualClock::new(NOW),
        }
    }

    impl Fixture {
        async fn backup(&self, job: JobId, count: usize) -> Vec<ArchFileId> {
            let (handle, _) = self.processes.ensure_running(&self.part).unwrap();
            let mut ids = Vec::new();
            for i in 0..count {
                let data = Bytes::from(format!("{job}-{i}"));
                let sig = Signature::of(&data);
                let af = self
                    .catalog
                    .insert_archive_file(
                        job,
                        self.store.id,
                        0,
                        vec![ChunkRef {
                            signature: sig,
                            size: data.len() as u64,
                            substore_id: self.part.id,
                        }],
                    )
                    .await
                    .unwrap();
                handle.ingest(af.id, vec![(sig, data)]).await.unwrap();
                ids.push(af.id);
            }
            ids
        }

        /// Loses the index contents, as after a crash.
        async fn crash_index(&self) -> Arc<IndexProcessHandle> {
            self.processes.request_stop(self.part.id);
            self.processes.wait_till_down(self.part.id).await.unwrap();
            self.factory.wipe(&self.part.path);
            self.processes.ensure_running(&self.part).unwrap().0
        }

        async fn reconstruct(
            &self,
            handle: &IndexProcessHandle,
            mode: ReconstructionMode,
        ) -> EngineResult<ReconstructionReport> {
            let store = self.catalog.store(self.store.id).await.unwrap().unwrap();
            run_reconstruction(
                &self.catalog,
                handle,
                &store,
                &self.part,
                mode,
                &ResyncConfig::default(),
                10,
                &self.clock,
            )
            .await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn regular_restores_the_delta_and_validates() {
        let fx = fixture().await;
        let kept = fx.backup(JobId(1), 4).await;
        let handle = fx.crash_index().await;
        assert!(handle.all_archive_files().await.unwrap().is_empty());

        let report = fx
            .reconstruct(&handle, ReconstructionMode::Regular)
            .await
            .unwrap();

        assert_eq!(report.performed, ReconstructionMode::Regular);
        assert_eq!(report.restored_afs, 4);
        assert!(report.validated);
        assert!(!report.skipped_validation());
        assert_eq!(handle.all_archive_files().await.unwrap(), kept);

        let history = fx.catalog.recovery_history(fx.store.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, RecoveryStatus::Succeeded);
        assert_eq!(history[0].recovery_flags, ReconstructionMode::Regular.recovery_flags());
    }

    #[tokio::test]
    async fn regular_prunes_what_the_catalog_no_longer_confirms() {
        let fx = fixture().await;
        fx.backup(JobId(1), 3).await;
        fx.backup(JobId(2), 2).await;
        delete_job(&fx.catalog, JobId(2), NOW).await.unwrap();
        let handle = fx.processes.handle(fx.part.id).unwrap();

        let report = fx
            .reconstruct(&handle, ReconstructionMode::Regular)
            .await
            .unwrap();

        assert_eq!(report.restored_afs, 0);
        assert_eq!(report.pruned_afs, 2);
        assert_eq!(handle.all_archive_files().await.unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn full_skips_validation_and_queues_a_resync() {
        let fx = fixture().await;
        fx.backup(JobId(1), 3).await;
        let handle = fx.crash_index().await;

        let report = fx.reconstruct(&handle, ReconstructionMode::Full).await.unwrap();

        assert_eq!(report.restored_afs, 3);
        assert!(!report.validated);
        assert!(report.skipped_validation());
        let store = fx.catalog.store(fx.store.id).await.unwrap().unwrap();
        assert!(store.flags.needs_auto_resync());
        assert_eq!(
            store.resync_request.map(|r| r.reason),
            Some(MaintenanceReason::PostReconstruction)
        );
    }

    #[tokio::test]
    async fn aged_store_escalates_regular_to_full() {
        let fx = fixture().await;
        fx.backup(JobId(1), 2).await;
        let handle = fx.processes.handle(fx.part.id).unwrap();
        fx.clock.set(60 * DAY_MS);

        let report = fx
            .reconstruct(&handle, ReconstructionMode::Regular)
            .await
            .unwrap();

        assert_eq!(report.requested, ReconstructionMode::Regular);
        assert_eq!(report.performed, ReconstructionMode::Full);
        assert!(report.skipped_validation());
    }

    #[tokio::test]
    async fn failed_validation_is_recorded_and_surfaced() {
        let fx = fixture().await;
        fx.backup(JobId(1), 2).await;
        let handle = fx.processes.handle(fx.part.id).unwrap();
        fx.catalog.inject_af_diff_fault(AfDiffFault {
            probability: 1.0,
            mode: FaultMode::Truncate,
            seed: 9,
        });

        let err = fx
            .reconstruct(&handle, ReconstructionMode::Regular)
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::AfDiffFailed { code: 53_006, .. }));
        let history = fx.catalog.recovery_history(fx.store.id).await.unwrap();
        assert_eq!(history[0].status, RecoveryStatus::Failed);
        assert_eq!(handle.all_archive_files().await.unwrap().len(), 2);
    }
}
