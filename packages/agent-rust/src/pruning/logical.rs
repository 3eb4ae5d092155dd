//! Phase 1: logical deletion.

use ddb_core::{ArchFileId, JobId};
use tracing::{debug, info};

use crate::catalog::Catalog;
use crate::error::{ContextExt, EngineResult, OperationContext, Phase};

/// Invalidates every archive file of `job` and queues it for pruning.
///
/// Deleting a job that is already deleted (or unknown) returns an empty list.
///
/// # Errors
///
/// Returns a wrapped catalog error.
pub async fn delete_job(
    catalog: &dyn Catalog,
    job: JobId,
    now_ms: u64,
) -> EngineResult<Vec<ArchFileId>> {
    let invalidated = catalog
        .invalidate_job(job, now_ms)
        .await
        .catalog_ctx(OperationContext::new(Phase::LogicalDelete))?;
    if invalidated.is_empty() {
        debug!(job_id = %job, "job has no valid archive files left, nothing to delete");
    } else {
        info!(job_id = %job, archive_files = invalidated.len(), "job logically deleted");
    }
    Ok(invalidated)
}

#[cfg(test)]
mod tests {
    use ddb_core::{ChunkRef, Signature, StoreExtendedFlags, StoreFlags};

    use super::*;
    use crate::catalog::{InMemoryCatalog, NewPartition, NewStore};

    #[tokio::test]
    async fn deleting_twice_is_a_no_op() {
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
        let substore = catalog.substores(store.id).await.unwrap()[0].id;
        for _ in 0..2 {
            catalog
                .insert_archive_file(
                    JobId(7),
                    store.id,
                    0,
                    vec![ChunkRef {
                        signature: Signature::of(b"x"),
                        size: 1,
                        substore_id: substore,
                    }],
                )
                .await
                .unwrap();
        }

        assert_eq!(delete_job(&catalog, JobId(7), 5).await.unwrap().len(), 2);
        assert!(delete_job(&catalog, JobId(7), 6).await.unwrap().is_empty());
        assert!(delete_job(&catalog, JobId(99), 6).await.unwrap().is_empty());
        assert_eq!(catalog.pending_delete_count(store.id).await.unwrap(), 2);
    }
}
