//! AF diff: compares a partition's registered archive files with the catalog.
//!
//! The partition index is paged in batches of `SIDBAfDiffBatchSize` ids and
//! every batch is validated against the catalog. A response whose length does
//! not match the request is never trusted; the diff aborts before anything
//! is pruned.

use std::collections::BTreeSet;

use ddb_core::{AfState, ArchFileId, StoreId};
use tracing::{debug, error, warn};

use crate::catalog::Catalog;
use crate::error::{ContextExt, EngineError, EngineResult, OperationContext, Phase};
use crate::index::IterationCursor;
use crate::process::IndexProcessHandle;

/// Result of diffing one partition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AfDiffOutcome {
    /// Archive files the partition index holds.
    pub examined: u64,
    /// Archive files the catalog reports as invalid or unknown.
    pub prunable: BTreeSet<ArchFileId>,
}

/// Diffs the archive files registered on `handle` against the catalog.
///
/// # Errors
///
/// Returns `EngineError::BatchSizeMismatch` when the catalog answers a batch
/// with a different number of rows, `EngineError::Catalog` when the catalog
/// call fails, and `EngineError::Index` when the partition cannot be paged.
pub async fn af_diff(
    catalog: &dyn Catalog,
    handle: &IndexProcessHandle,
    store: StoreId,
    batch_size: usize,
) -> EngineResult<AfDiffOutcome> {
    let ctx = OperationContext::new(Phase::Resync)
        .store(store)
        .partition(handle.substore());
    let batch_size = batch_size.max(1);
    let mut outcome = AfDiffOutcome::default();
    let mut cursor = IterationCursor::start();

    while !cursor.finished {
        let page = handle
            .list_archive_files(cursor, batch_size)
            .await
            .index_ctx(ctx)?;
        cursor = page.next_cursor;
        if page.items.is_empty() {
            continue;
        }

        let response = match catalog.validate_archive_files(store, &page.items).await {
            Ok(response) => response,
            Err(err) => {
                error!(store_id = %store, substore_id = %handle.substore(), "{err:#}");
                return Err(EngineError::Catalog { context: ctx, source: err });
            }
        };
        if response.len() != page.items.len() {
            warn!(
                store_id = %store,
                substore_id = %handle.substore(),
                "DoAfDiff Mismatched sizes - request Afs [{}] response Afs [{}]. Aborting.",
                page.items.len(),
                response.len()
            );
            return Err(EngineError::BatchSizeMismatch {
                requested: page.items.len(),
                received: response.len(),
            });
        }

        let requested: BTreeSet<ArchFileId> = page.items.iter().copied().collect();
        outcome.examined += page.items.len() as u64;
        outcome.prunable.extend(
            response
                .iter()
                .filter(|row| row.state != AfState::Valid && requested.contains(&row.arch_file_id))
                .map(|row| row.arch_file_id),
        );
    }

    debug!(
        store_id = %store,
        substore_id = %handle.substore(),
        examined = outcome.examined,
        prunable = outcome.prunable.len(),
        "AF diff complete"
    );
    Ok(outcome)
}
