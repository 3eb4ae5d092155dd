//! Distributor election.
//!
//! Exactly one Online partition of a store carries the distributor bit.
//! Election follows the same rule the cluster layer uses for its master:
//! among eligible members the lowest identifier wins, so every agent that
//! looks at the same catalog picks the same partition.

use ddb_core::{StoreId, Substore, SubstoreId};
use tracing::{info, warn};

use crate::catalog::Catalog;
use crate::error::{ContextExt, EngineError, EngineResult, OperationContext, Phase};

/// Outcome of [`ensure_distributor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DistributorCheck {
    /// Exactly one Online partition already held the bit.
    Healthy(SubstoreId),
    /// Several Online partitions held the bit; all but `kept` were cleared.
    Repaired {
        kept: SubstoreId,
        cleared: Vec<SubstoreId>,
    },
    /// No Online partition held the bit, so one was elected.
    Elected(SubstoreId),
}

impl DistributorCheck {
    /// The distributor after the check.
    #[must_use]
    pub fn distributor(&self) -> SubstoreId {
        match self {
            Self::Healthy(id) | Self::Elected(id) => *id,
            Self::Repaired { kept, .. } => *kept,
        }
    }
}

/// Returns the store's distributor by scanning its Online partitions.
///
/// Offline partitions are ignored even if they still carry the bit.
///
/// # Errors
///
/// - `StoreDegraded` if no partition is Online
/// - `MultipleDistributors` if more than one Online partition has the bit
/// - `NoDistributor` if none has it
pub fn identify_among(store: StoreId, substores: &[Substore]) -> EngineResult<SubstoreId> {
    let online: Vec<&Substore> = substores.iter().filter(|s| s.is_online()).collect();
    if online.is_empty() {
        return Err(EngineError::StoreDegraded { store });
    }
    let mut flagged: Vec<SubstoreId> = online
        .iter()
        .filter(|s| s.is_distributor())
        .map(|s| s.id)
        .collect();
    flagged.sort_unstable();
    match flagged.as_slice() {
        [single] => Ok(*single),
        [] => Err(EngineError::NoDistributor { store }),
        _ => Err(EngineError::MultipleDistributors {
            store,
            partitions: flagged,
        }),
    }
}

/// Catalog-backed [`identify_among`].
///
/// # Errors
///
/// See [`identify_among`]; catalog failures are wrapped with context.
pub async fn identify_distributor(
    catalog: &dyn Catalog,
    store: StoreId,
) -> EngineResult<SubstoreId> {
    let ctx = OperationContext::new(Phase::Distributor).store(store);
    let substores = catalog.substores(store).await.catalog_ctx(ctx)?;
    identify_among(store, &substores)
}

/// Gives the distributor bit to the lowest-id Online partition.
///
/// # Errors
///
/// Returns `StoreDegraded` if no partition is Online, or a wrapped catalog error.
pub async fn elect_new_distributor(
    catalog: &dyn Catalog,
    store: StoreId,
) -> EngineResult<SubstoreId> {
    let ctx = OperationContext::new(Phase::Distributor).store(store);
    let substores = catalog.substores(store).await.catalog_ctx(ctx)?;
    let elected = substores
        .iter()
        .filter(|s| s.is_online())
        .map(|s| s.id)
        .min()
        .ok_or(EngineError::StoreDegraded { store })?;
    catalog
        .set_distributor(store, elected)
        .await
        .catalog_ctx(ctx.partition(elected))?;
    info!(store_id = %store, substore_id = %elected, "elected new distributor partition");
    metrics::counter!("ddb_distributor_elections_total").increment(1);
    Ok(elected)
}

/// Detects and repairs a missing or duplicated distributor.
///
/// # Errors
///
/// Returns `StoreDegraded` if no partition is Online, or a wrapped catalog error.
pub async fn ensure_distributor(
    catalog: &dyn Catalog,
    store: StoreId,
) -> EngineResult<DistributorCheck> {
    match identify_distributor(catalog, store).await {
        Ok(id) => Ok(DistributorCheck::Healthy(id)),
        Err(EngineError::MultipleDistributors { partitions, .. }) => {
            let ctx = OperationContext::new(Phase::Distributor).store(store);
            // `partitions` is sorted, so the first entry is the lowest id.
            let Some((&kept, rest)) = partitions.split_first() else {
                return Err(EngineError::NoDistributor { store });
            };
            warn!(
                store_id = %store,
                partitions = ?partitions,
                "multiple distributor partitions, keeping {kept}"
            );
            catalog
                .set_distributor(store, kept)
                .await
                .catalog_ctx(ctx.partition(kept))?;
            Ok(DistributorCheck::Repaired {
                kept,
                cleared: rest.to_vec(),
            })
        }
        Err(EngineError::NoDistributor { .. }) => {
            warn!(store_id = %store, "no online distributor partition");
            elect_new_distributor(catalog, store)
                .await
                .map(DistributorCheck::Elected)
        }
        Err(err) => Err(err),
    }
}
