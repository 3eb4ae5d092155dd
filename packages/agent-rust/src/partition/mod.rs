//! Partition lifecycle: distributor election, routing and availability.

pub mod distributor;
pub mod router;

use ddb_core::{PartitionState, Substore};
use tracing::info;

use crate::catalog::Catalog;
use crate::error::{ContextExt, EngineResult, OperationContext, Phase};
use crate::process::IndexProcesses;

pub use distributor::{
    elect_new_distributor, ensure_distributor, identify_among, identify_distributor,
    DistributorCheck,
};
pub use router::ChunkRouter;

/// Takes a partition Offline once its index process has fully stopped.
///
/// The distributor bit is left in place; the next election pass skips
/// Offline partitions and moves it.
///
/// # Errors
///
/// Returns `WaitTimeout` if the index process does not stop within the
/// shutdown budget (the partition stays in its previous state), or a
/// wrapped catalog error.
pub async fn mark_offline(
    catalog: &dyn Catalog,
    processes: &IndexProcesses,
    substore: &Substore,
) -> EngineResult<()> {
    processes.request_stop(substore.id);
    processes.wait_till_down(substore.id).await?;
    catalog
        .set_substore_state(substore.id, PartitionState::Offline)
        .await
        .catalog_ctx(
            OperationContext::new(Phase::Health)
                .store(substore.store_id)
                .partition(substore.id),
        )?;
    info!(
        store_id = %substore.store_id,
        substore_id = %substore.id,
        was_distributor = substore.is_distributor(),
        "partition marked offline"
    );
    Ok(())
}

/// Returns a partition to service.
///
/// # Errors
///
/// Returns a wrapped catalog error.
pub async fn mark_online(catalog: &dyn Catalog, substore: &Substore) -> EngineResult<()> {
    catalog
        .set_substore_state(substore.id, PartitionState::Online)
        .await
        .catalog_ctx(
            OperationContext::new(Phase::Health)
                .store(substore.store_id)
                .partition(substore.id),
        )?;
    info!(store_id = %substore.store_id, substore_id = %substore.id, "partition back online");
    Ok(())
}
