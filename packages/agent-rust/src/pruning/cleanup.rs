//! Phase 2: catalog cleanup.
//!
//! Each pending-delete entry is expanded into one tracking row per partition
//! that holds chunks of the archive file. A tracking row is completed once
//! the partition's index has released the archive file's references, and the
//! archive file leaves the catalog only when every tracking row is done.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use ddb_core::{ArchFileId, StoreId, SubstoreId};
use tracing::{debug, info};

use crate::catalog::Catalog;
use crate::error::{ContextExt, EngineResult, OperationContext, Phase};
use crate::process::IndexProcessHandle;

/// What one phase-2 pass did for a store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Pending entries expanded into tracking rows this pass.
    pub expanded: u64,
    /// Tracking rows applied to a partition index.
    pub applied: u64,
    /// Archive files removed from the catalog.
    pub pruned: Vec<ArchFileId>,
    /// Partitions with tracking rows left because no local index process serves them.
    pub deferred: BTreeSet<SubstoreId>,
}

/// Runs one phase-2 pass for `store`.
///
/// `handles` holds the running index processes of the store's Online
/// partitions on this agent. Tracking rows for any other partition stay
/// outstanding until a later pass can apply them.
///
/// # Errors
///
/// Returns a wrapped catalog or index error; work done before the failure is kept.
pub async fn run_catalog_cleanup(
    catalog: &dyn Catalog,
    store: StoreId,
    handles: &BTreeMap<SubstoreId, Arc<IndexProcessHandle>>,
    now_ms: u64,
) -> EngineResult<CleanupReport> {
    let ctx = OperationContext::new(Phase::CatalogCleanup).store(store);
    let mut report = CleanupReport::default();

    let pending = catalog.pending_deletes(store).await.catalog_ctx(ctx)?;
    if pending.is_empty() {
        return Ok(report);
    }

    for entry in pending.iter().filter(|entry| !entry.expanded) {
        let substores: Vec<SubstoreId> = catalog
            .archive_file(entry.arch_file_id)
            .await
            .catalog_ctx(ctx)?
            .map(|af| af.substores().into_iter().collect())
            .unwrap_or_default();
        catalog
            .expand_pending(entry.arch_file_id, &substores, now_ms)
            .await
            .catalog_ctx(ctx)?;
        report.expanded += 1;
    }

    let mut by_partition: BTreeMap<SubstoreId, Vec<ArchFileId>> = BTreeMap::new();
    for row in catalog.tracking_rows(store).await.catalog_ctx(ctx)? {
        by_partition
            .entry(row.substore_id)
            .or_default()
            .push(row.arch_file_id);
    }

    for (substore, arch_files) in by_partition {
        let Some(handle) = handles.get(&substore) else {
            debug!(store_id = %store, substore_id = %substore, "tracking rows deferred");
            report.deferred.insert(substore);
            continue;
        };
        let pctx = ctx.partition(substore);
        handle
            .drop_archive_files(arch_files.clone())
            .await
            .index_ctx(pctx)?;
        for arch_file in arch_files {
            if catalog
                .complete_tracking(arch_file, substore)
                .await
                .catalog_ctx(pctx)?
            {
                report.applied += 1;
            }
        }
    }

    for entry in &pending {
        if catalog
            .finalize_pending(entry.arch_file_id)
            .await
            .catalog_ctx(ctx)?
        {
            info!(store_id = %store, "Pruned AfId [{}] completely", entry.arch_file_id);
            report.pruned.push(entry.arch_file_id);
        }
    }
    metrics::counter!("ddb_phase2_pruned_afs_total").increment(report.pruned.len() as u64);
    Ok(report)
}
