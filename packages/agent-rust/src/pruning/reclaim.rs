//! Phase 3: mark-and-sweep and zero-ref reclamation, plus usage sampling.

use std::time::Duration;

use ddb_core::{DedupStore, Substore, UsageSample};
use tracing::debug;

use crate::catalog::Catalog;
use crate::config::PruningConfig;
use crate::error::{ContextExt, EngineResult, OperationContext, Phase};
use crate::index::SweepReport;
use crate::process::IndexProcessHandle;

/// What one phase-3 pass did on a partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Phase3Report {
    /// Zero-ref signatures physically reclaimed.
    pub drained: u64,
    /// Set when a mark-and-sweep ran during this pass.
    pub sweep: Option<SweepReport>,
}

/// Mark-and-sweep interval for `store`: its own override, else the agent's.
#[must_use]
pub fn mark_and_sweep_interval(store: &DedupStore, config: &PruningConfig) -> Duration {
    store
        .mark_and_sweep_interval_secs
        .map_or_else(|| config.mark_and_sweep_interval(), |secs| {
            Duration::from_secs(secs.max(1))
        })
}

/// Whether a sweep last run at `last_sweep_ms` is due again at `now_ms`.
#[must_use]
pub fn sweep_due(last_sweep_ms: u64, interval: Duration, now_ms: u64) -> bool {
    let interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
    now_ms.saturating_sub(last_sweep_ms) >= interval_ms
}

/// Runs phase 3 on one partition.
///
/// Zero-ref entries left by earlier sweeps are drained first (unless phase 3
/// is disabled), then a mark-and-sweep runs if `sweep_is_due`. Signatures a
/// sweep moves to zero-ref are therefore reclaimed on the next pass. Offline
/// partitions are left untouched.
///
/// # Errors
///
/// Returns a wrapped index error.
pub async fn run_phase3(
    handle: &IndexProcessHandle,
    store: &DedupStore,
    substore: &Substore,
    config: &PruningConfig,
    sweep_is_due: bool,
    now_ms: u64,
) -> EngineResult<Phase3Report> {
    let ctx = OperationContext::new(Phase::Reclamation)
        .store(store.id)
        .partition(substore.id);
    let mut report = Phase3Report::default();
    if !substore.is_online() {
        debug!(substore_id = %substore.id, "partition not online, phase 3 skipped");
        return Ok(report);
    }

    if config.disable_phase3 {
        debug!(substore_id = %substore.id, "phase 3 disabled, zero-ref entries retained");
    } else {
        report.drained = handle
            .drain_zero_ref(config.zero_ref_drain_batch)
            .await
            .index_ctx(ctx)?;
        metrics::counter!("ddb_zero_ref_drained_total").increment(report.drained);
    }

    if sweep_is_due && store.extended_flags.is_mark_and_sweep_enabled() {
        let sweep = handle.mark_and_sweep(now_ms).await.index_ctx(ctx)?;
        debug!(
            store_id = %store.id,
            substore_id = %substore.id,
            live = sweep.live,
            swept = sweep.swept,
            "mark and sweep finished"
        );
        metrics::counter!("ddb_zero_ref_swept_total").increment(sweep.swept);
        report.sweep = Some(sweep);
    }
    Ok(report)
}

/// Records a usage sample for a running Online partition.
///
/// # Errors
///
/// Returns a wrapped index or catalog error.
pub async fn record_usage(
    catalog: &dyn Catalog,
    handle: &IndexProcessHandle,
    substore: &Substore,
    now_ms: u64,
) -> EngineResult<UsageSample> {
    let ctx = OperationContext::new(Phase::Usage)
        .store(substore.store_id)
        .partition(substore.id);
    let stats = handle.stats().await.index_ctx(ctx)?;
    let sample = UsageSample {
        store_id: substore.store_id,
        substore_id: substore.id,
        primary_entries: stats.primary_entries,
        zero_ref_count: stats.zero_ref_count,
        modified_ms: now_ms,
    };
    catalog.record_usage(sample).await.catalog_ctx(ctx)?;
    #[allow(clippy::cast_precision_loss)]
    let zero_ref = stats.zero_ref_count as f64;
    metrics::gauge!("ddb_zero_ref_count", "substore" => substore.id.to_string()).set(zero_ref);
    Ok(sample)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use ddb_core::{
        ArchFileId, PartitionState, Signature, StoreExtendedFlags, StoreFlags, StoreId,
        SubstoreExtendedFlags, SubstoreFlags, SubstoreId,
    };

    use super::*;
    use crate::catalog::InMemoryCatalog;
    use crate::chunk_store::MemoryChunkStore;
    use crate::config::ConfigHandle;
    use crate::index::MemoryIndexFactory;
    use crate::process::IndexProcesses;

    fn store() -> DedupStore {
        DedupStore {
            id: StoreId(1),
            name: "pool".to_string(),
            created_time_ms: 0,
            last_resync_ms: None,
            flags: StoreFlags::PRUNING_ENABLED,
            extended_flags: StoreExtendedFlags::DEFAULT | StoreExtendedFlags::MARK_AND_SWEEP_ENABLED,
            mark_and_sweep_interval_secs: None,
            resync_request: None,
        }
    }

    fn partition() -> Substore {
        Substore {
            id: SubstoreId(1),
            store_id: StoreId(1),
            path: "/ddb/p1".to_string(),
            media_agent: "ma1".to_string(),
            state: PartitionState::Online,
            flags: SubstoreFlags::empty(),
            extended_flags: SubstoreExtendedFlags::empty(),
        }
    }

    async fn orphaned(processes: &IndexProcesses) -> Arc<IndexProcessHandle> {
        let (handle, _) = processes.ensure_running(&partition()).unwrap();
        let chunks = (0u8..5)
            .map(|i| (Signature::of(&[i]), Bytes::from(vec![i])))
            .collect();
        handle.ingest(ArchFileId(1), chunks).await.unwrap();
        handle.drop_archive_files(vec![ArchFileId(1)]).await.unwrap();
        handle
    }

    fn processes() -> IndexProcesses {
        IndexProcesses::new(
            Arc::new(MemoryIndexFactory::new()),
            Arc::new(MemoryChunkStore::new()),
            Arc::new(ConfigHandle::default()),
        )
    }

    #[test]
    fn store_override_wins_over_agent_interval() {
        let config = PruningConfig::default();
        let mut store = store();
        assert_eq!(mark_and_sweep_interval(&store, &config), config.mark_and_sweep_interval());
        store.mark_and_sweep_interval_secs = Some(2 * 3600);
        assert_eq!(mark_and_sweep_interval(&store, &config), Duration::from_secs(7200));
    }

    #[test]
    fn sweep_due_after_interval() {
        let interval = Duration::from_secs(120);
        assert!(!sweep_due(1_000, interval, 60_000));
        assert!(sweep_due(1_000, interval, 121_000));
    }

    #[tokio::test]
    async fn sweep_then_drain_on_next_pass() {
        let processes = processes();
        let handle = orphaned(&processes).await;
        let config = PruningConfig::default();

        let first = run_phase3(&handle, &store(), &partition(), &config, true, 10)
            .await
            .unwrap();
        assert_eq!(first.drained, 0);
        assert_eq!(first.sweep.unwrap().swept, 5);
        assert_eq!(handle.stats().await.unwrap().zero_ref_count, 5);

        let second = run_phase3(&handle, &store(), &partition(), &config, false, 20)
            .await
            .unwrap();
        assert_eq!(second.drained, 5);
        assert!(second.sweep.is_none());
        assert_eq!(handle.stats().await.unwrap().zero_ref_count, 0);
        processes.stop_all().await;
    }

    #[tokio::test]
    async fn disabled_phase3_never_drains() {
        let processes = processes();
        let handle = orphaned(&processes).await;
        let config = PruningConfig {
            disable_phase3: true,
            ..PruningConfig::default()
        };

        run_phase3(&handle, &store(), &partition(), &config, true, 10)
            .await
            .unwrap();
        for now in [20, 30, 40] {
            let report = run_phase3(&handle, &store(), &partition(), &config, false, now)
                .await
                .unwrap();
            assert_eq!(report.drained, 0);
        }
        assert_eq!(handle.stats().await.unwrap().zero_ref_count, 5);
        processes.stop_all().await;
    }

    #[tokio::test]
    async fn offline_partition_is_skipped() {
        let processes = processes();
        let handle = orphaned(&processes).await;
        let mut offline = partition();
        offline.state = PartitionState::Offline;

        let report = run_phase3(&handle, &store(), &offline, &PruningConfig::default(), true, 10)
            .await
            .unwrap();
        assert_eq!(report, Phase3Report::default());
        processes.stop_all().await;
    }

    #[tokio::test]
    async fn usage_sample_reflects_index() {
        let catalog = InMemoryCatalog::new();
        let processes = processes();
        let handle = orphaned(&processes).await;
        handle.mark_and_sweep(1).await.unwrap();

        let sample = record_usage(&catalog, &handle, &partition(), 42).await.unwrap();
        assert_eq!(sample.zero_ref_count, 5);
        assert_eq!(sample.primary_entries, 0);
        assert_eq!(
            catalog.latest_usage(SubstoreId(1)).await.unwrap(),
            Some(sample)
        );
        processes.stop_all().await;
    }
}
