//! The media-agent facade.
//!
//! [`MediaAgent`] owns the index processes of the partitions hosted on this
//! agent and exposes the administrative, backup and query operations the job
//! subsystem and operators drive. Periodic work lives in
//! [`crate::scheduler::MaintenanceScheduler`].

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use ddb_core::{
    ArchFileId, ChunkRef, ClockSource, DedupStore, JobId, MaintenanceReason, PartitionState,
    ReconstructionMode, ResyncFlags, ResyncHistoryEntry, ResyncRequest, ResyncStatus, Signature,
    StoreExtendedFlags, StoreFlags, StoreId, Substore, SubstoreId, DAY_MS,
};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::catalog::{Catalog, NewPartition, NewStore};
use crate::chunk_store::ChunkStore;
use crate::config::ConfigHandle;
use crate::error::{ContextExt, EngineError, EngineResult, OperationContext, Phase};
use crate::index::IndexFactory;
use crate::partition::{ensure_distributor, identify_distributor, ChunkRouter};
use crate::process::{IndexProcessHandle, IndexProcesses};
use crate::pruning;
use crate::resync::{self, ReconstructionReport, ResyncManager};
use crate::wait::{poll_until, PollBudget};

/// One media agent: the partitions it hosts and the stores they belong to.
pub struct MediaAgent {
    name: String,
    config: Arc<ConfigHandle>,
    catalog: Arc<dyn Catalog>,
    chunks: Arc<dyn ChunkStore>,
    processes: IndexProcesses,
    clock: Arc<dyn ClockSource>,
    /// Serializes resync and reconstruction per store.
    maintenance_locks: DashMap<StoreId, Arc<Mutex<()>>>,
}

impl MediaAgent {
    #[must_use]
    pub fn new(
        config: Arc<ConfigHandle>,
        catalog: Arc<dyn Catalog>,
        chunks: Arc<dyn ChunkStore>,
        factory: Arc<dyn IndexFactory>,
        clock: Arc<dyn ClockSource>,
    ) -> Self {
        let name = config.current().media_agent.clone();
        let processes = IndexProcesses::new(factory, Arc::clone(&chunks), Arc::clone(&config));
        Self {
            name,
            config,
            catalog,
            chunks,
            processes,
            clock,
            maintenance_locks: DashMap::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn config(&self) -> &Arc<ConfigHandle> {
        &self.config
    }

    #[must_use]
    pub fn catalog(&self) -> &dyn Catalog {
        self.catalog.as_ref()
    }

    #[must_use]
    pub fn processes(&self) -> &IndexProcesses {
        &self.processes
    }

    #[must_use]
    pub fn now_ms(&self) -> u64 {
        self.clock.now()
    }

    #[must_use]
    pub fn clock(&self) -> &dyn ClockSource {
        self.clock.as_ref()
    }

    /// Lock held while a resync or reconstruction runs against `store`.
    #[must_use]
    pub fn maintenance_lock(&self, store: StoreId) -> Arc<Mutex<()>> {
        Arc::clone(
            self.maintenance_locks
                .entry(store)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    // -----------------------------------------------------------------------
    // Catalog lookups
    // -----------------------------------------------------------------------

    /// # Errors
    ///
    /// Returns `StoreNotFound` or a wrapped catalog error.
    pub async fn store(&self, store: StoreId) -> EngineResult<DedupStore> {
        self.catalog
            .store(store)
            .await
            .catalog_ctx(OperationContext::new(Phase::Provisioning).store(store))?
            .ok_or(EngineError::StoreNotFound { store })
    }

    /// # Errors
    ///
    /// Returns a wrapped catalog error.
    pub async fn stores(&self) -> EngineResult<Vec<DedupStore>> {
        self.catalog
            .stores()
            .await
            .catalog_ctx(OperationContext::new(Phase::Provisioning))
    }

    /// # Errors
    ///
    /// Returns a wrapped catalog error.
    pub async fn substores(&self, store: StoreId) -> EngineResult<Vec<Substore>> {
        self.catalog
            .substores(store)
            .await
            .catalog_ctx(OperationContext::new(Phase::Provisioning).store(store))
    }

    /// Partitions of `store` hosted on this agent.
    ///
    /// # Errors
    ///
    /// Returns a wrapped catalog error.
    pub async fn local_substores(&self, store: StoreId) -> EngineResult<Vec<Substore>> {
        Ok(self
            .substores(store)
            .await?
            .into_iter()
            .filter(|s| s.media_agent == self.name)
            .collect())
    }

    /// # Errors
    ///
    /// Returns `PartitionNotFound` or a wrapped catalog error.
    pub async fn substore(&self, substore: SubstoreId) -> EngineResult<Substore> {
        self.catalog
            .substore(substore)
            .await
            .catalog_ctx(OperationContext::new(Phase::Provisioning).partition(substore))?
            .ok_or(EngineError::PartitionNotFound {
                partition: substore,
            })
    }

    // -----------------------------------------------------------------------
    // Index processes
    // -----------------------------------------------------------------------

    /// Returns the running index process of a local partition, starting it
    /// if needed. A fresh start re-evaluates the store's distributor.
    ///
    /// # Errors
    ///
    /// Returns `PathInaccessible` if the partition path is gone, or a
    /// distributor or catalog error from the election.
    pub async fn ensure_index(&self, substore: &Substore) -> EngineResult<Arc<IndexProcessHandle>> {
        let (handle, started) = self.processes.ensure_running(substore)?;
        if started {
            let check = ensure_distributor(self.catalog(), substore.store_id).await?;
            info!(
                store_id = %substore.store_id,
                substore_id = %substore.id,
                distributor = %check.distributor(),
                "distributor checked after index start"
            );
        }
        Ok(handle)
    }

    /// Running index processes of the store's local Online partitions.
    ///
    /// Partitions that cannot be started are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns a wrapped catalog error.
    pub async fn online_handles(
        &self,
        store: StoreId,
    ) -> EngineResult<BTreeMap<SubstoreId, Arc<IndexProcessHandle>>> {
        let mut handles = BTreeMap::new();
        for substore in self.local_substores(store).await? {
            if !substore.is_online() {
                continue;
            }
            match self.ensure_index(&substore).await {
                Ok(handle) => {
                    handles.insert(substore.id, handle);
                }
                Err(err) => {
                    warn!(store_id = %store, substore_id = %substore.id, "index unavailable: {err}");
                }
            }
        }
        Ok(handles)
    }

    // -----------------------------------------------------------------------
    // Provisioning
    // -----------------------------------------------------------------------

    /// Creates a store with one partition per path, all hosted on this agent.
    ///
    /// Mark-and-sweep and pruning are enabled; the lowest partition id
    /// becomes the distributor.
    ///
    /// # Errors
    ///
    /// - `NoPartitions` for an empty path list
    /// - `MissingPartitionPath` for an empty path, or a relative one when
    ///   volume-backed paths are required
    /// - `DuplicateStoreName` if the name is taken
    pub async fn create_store(&self, name: &str, paths: &[String]) -> EngineResult<DedupStore> {
        let ctx = OperationContext::new(Phase::Provisioning);
        if paths.is_empty() {
            return Err(EngineError::NoPartitions);
        }
        let require_volume = self.config.current().index.require_volume_backed_paths;
        for (index, path) in paths.iter().enumerate() {
            if path.trim().is_empty() || (require_volume && !Path::new(path).is_absolute()) {
                return Err(EngineError::MissingPartitionPath { index });
            }
        }
        if self
            .catalog
            .store_by_name(name)
            .await
            .catalog_ctx(ctx)?
            .is_some()
        {
            return Err(EngineError::DuplicateStoreName {
                name: name.to_string(),
            });
        }

        let store = self
            .catalog
            .create_store(NewStore {
                name: name.to_string(),
                created_time_ms: self.now_ms(),
                flags: StoreFlags::PRUNING_ENABLED,
                extended_flags: StoreExtendedFlags::DEFAULT
                    | StoreExtendedFlags::MARK_AND_SWEEP_ENABLED,
                partitions: paths
                    .iter()
                    .map(|path| NewPartition {
                        path: path.clone(),
                        media_agent: self.name.clone(),
                    })
                    .collect(),
            })
            .await
            .catalog_ctx(ctx)?;
        let ctx = ctx.store(store.id);
        let substores = self.substores(store.id).await?;
        if let Some(first) = substores.iter().map(|s| s.id).min() {
            self.catalog
                .set_distributor(store.id, first)
                .await
                .catalog_ctx(ctx.partition(first))?;
        }
        for substore in &substores {
            self.processes.ensure_running(substore)?;
        }
        info!(store_id = %store.id, name, partitions = substores.len(), "store created");
        self.store(store.id).await
    }

    /// Stops the store's local index processes and removes it everywhere.
    ///
    /// # Errors
    ///
    /// Returns `WaitTimeout` if an index process does not stop, or a
    /// wrapped catalog or chunk-store error.
    pub async fn delete_store(&self, store: StoreId) -> EngineResult<bool> {
        let ctx = OperationContext::new(Phase::Provisioning).store(store);
        for substore in self.local_substores(store).await? {
            if self.processes.is_running(substore.id) {
                self.processes.request_stop(substore.id);
                self.processes.wait_till_down(substore.id).await?;
            }
        }
        let removed = self.catalog.delete_store(store).await.catalog_ctx(ctx)?;
        let purged = self.chunks.purge_store(store).await.index_ctx(ctx)?;
        self.maintenance_locks.remove(&store);
        info!(store_id = %store, removed, purged_chunks = purged, "store deleted");
        Ok(removed)
    }

    /// Seals a store; later backups are refused.
    ///
    /// # Errors
    ///
    /// Returns a wrapped catalog error.
    pub async fn seal_store(&self, store: StoreId) -> EngineResult<()> {
        self.catalog
            .update_store_flags(store, StoreFlags::STORE_SEALED, StoreFlags::empty())
            .await
            .catalog_ctx(OperationContext::new(Phase::Provisioning).store(store))?;
        info!(store_id = %store, "store sealed");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Backup and restore
    // -----------------------------------------------------------------------

    /// Writes one archive file per entry of `files`, each given as its chunk
    /// payloads in file order.
    ///
    /// Chunks are routed by the store's distributor; each partition indexes
    /// the chunks routed to it and writes the bytes it has not seen.
    ///
    /// # Errors
    ///
    /// - `StoreSealed` for a sealed store
    /// - `IndexProcessDown` if a chunk routes to a partition this agent
    ///   cannot serve
    /// - distributor, catalog or index errors
    ///
    /// A file whose ingest fails after its catalog row was written is
    /// invalidated and left to pruning.
    pub async fn backup(
        &self,
        store: StoreId,
        job: JobId,
        files: Vec<Vec<Bytes>>,
    ) -> EngineResult<Vec<ArchFileId>> {
        let ctx = OperationContext::new(Phase::Ingest).store(store);
        let row = self.store(store).await?;
        if row.flags.is_sealed() {
            return Err(EngineError::StoreSealed { store });
        }
        let distributor = ensure_distributor(self.catalog(), store).await?.distributor();
        let substores = self.substores(store).await?;
        let router = ChunkRouter::new(store, distributor, &substores)?;
        let by_id: BTreeMap<SubstoreId, &Substore> =
            substores.iter().map(|s| (s.id, s)).collect();

        let mut written = Vec::with_capacity(files.len());
        for payloads in files {
            let chunks: Vec<(Signature, Bytes, SubstoreId)> = payloads
                .into_iter()
                .map(|data| {
                    let signature = Signature::of(&data);
                    let target = router.route(&signature);
                    (signature, data, target)
                })
                .collect();
            let refs = chunks
                .iter()
                .map(|(signature, data, target)| ChunkRef {
                    signature: *signature,
                    size: data.len() as u64,
                    substore_id: *target,
                })
                .collect();
            let mut routed: BTreeMap<SubstoreId, Vec<(Signature, Bytes)>> = BTreeMap::new();
            for (signature, data, target) in chunks {
                routed.entry(target).or_default().push((signature, data));
            }
            // Every target must be servable before the file is recorded.
            let mut targets = Vec::with_capacity(routed.len());
            for (target, chunks) in routed {
                let substore = by_id
                    .get(&target)
                    .filter(|s| s.media_agent == self.name)
                    .ok_or(EngineError::IndexProcessDown { partition: target })?;
                targets.push((target, self.ensure_index(substore).await?, chunks));
            }

            let af = self
                .catalog
                .insert_archive_file(job, store, self.now_ms(), refs)
                .await
                .catalog_ctx(ctx)?;
            for (target, handle, chunks) in targets {
                if let Err(err) = handle.ingest(af.id, chunks).await {
                    warn!(
                        store_id = %store,
                        arch_file_id = %af.id,
                        partition = %target,
                        error = %err,
                        "ingest failed, invalidating archive file"
                    );
                    self.catalog
                        .invalidate_archive_files(&[af.id], self.now_ms())
                        .await
                        .catalog_ctx(ctx)?;
                    return Err(EngineError::Index {
                        context: ctx.partition(target),
                        source: err,
                    });
                }
            }
            written.push(af.id);
        }
        info!(store_id = %store, job_id = %job, archive_files = written.len(), "backup written");
        Ok(written)
    }

    /// Reads an archive file's chunks back in file order.
    ///
    /// # Errors
    ///
    /// Returns `ArchiveFileUnavailable` if the file is unknown, logically
    /// deleted, or missing a chunk.
    pub async fn read_archive_file(&self, arch_file: ArchFileId) -> EngineResult<Vec<Bytes>> {
        let ctx = OperationContext::new(Phase::Restore);
        let unavailable = |reason: String| EngineError::ArchiveFileUnavailable { arch_file, reason };
        let af = self
            .catalog
            .archive_file(arch_file)
            .await
            .catalog_ctx(ctx)?
            .ok_or_else(|| unavailable("not in catalog".to_string()))?;
        if !af.valid {
            return Err(unavailable("logically deleted".to_string()));
        }
        let ctx = ctx.store(af.store_id);
        let mut data = Vec::with_capacity(af.chunks.len());
        for chunk in &af.chunks {
            let bytes = self
                .chunks
                .get(af.store_id, chunk.substore_id, &chunk.signature)
                .await
                .index_ctx(ctx.partition(chunk.substore_id))?
                .ok_or_else(|| unavailable(format!("chunk {} is missing", chunk.signature)))?;
            data.push(bytes);
        }
        Ok(data)
    }

    /// Whether every archive file of `job` can be read back.
    ///
    /// # Errors
    ///
    /// Returns a wrapped catalog or chunk-store error.
    pub async fn is_job_restorable(&self, job: JobId) -> EngineResult<bool> {
        let files = self
            .catalog
            .job_archive_files(job)
            .await
            .catalog_ctx(OperationContext::new(Phase::Restore))?;
        if files.is_empty() {
            return Ok(false);
        }
        for af in files {
            match self.read_archive_file(af.id).await {
                Ok(_) => {}
                Err(EngineError::ArchiveFileUnavailable { .. }) => return Ok(false),
                Err(err) => return Err(err),
            }
        }
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Pruning triggers
    // -----------------------------------------------------------------------

    /// Job-deletion callback: phase 1.
    ///
    /// # Errors
    ///
    /// Returns a wrapped catalog error.
    pub async fn delete_job(&self, job: JobId) -> EngineResult<Vec<ArchFileId>> {
        pruning::delete_job(self.catalog(), job, self.now_ms()).await
    }

    /// Overrides the store's mark-and-sweep interval (`SetDDBMarkAndSweepInterval`).
    ///
    /// # Errors
    ///
    /// Returns a wrapped catalog error.
    pub async fn set_mark_and_sweep_interval(&self, store: StoreId, hours: u64) -> EngineResult<()> {
        self.catalog
            .set_mark_and_sweep_interval(store, Some(hours.saturating_mul(3600)))
            .await
            .catalog_ctx(OperationContext::new(Phase::Reclamation).store(store))?;
        info!(store_id = %store, hours, "mark and sweep interval set");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Recovery
    // -----------------------------------------------------------------------

    /// Queues a resync that prunes archive files the catalog rejects.
    ///
    /// # Errors
    ///
    /// Returns a wrapped catalog error.
    pub async fn mark_store_for_recovery(&self, store: StoreId) -> EngineResult<()> {
        self.catalog
            .request_resync(
                store,
                ResyncRequest {
                    reason: MaintenanceReason::ArchiveFileValidation,
                    flags: ResyncFlags::PRUNE_INVALID_AFS,
                    requested_ms: self.now_ms(),
                },
            )
            .await
            .catalog_ctx(OperationContext::new(Phase::Resync).store(store))?;
        info!(store_id = %store, "store marked for recovery");
        Ok(())
    }

    /// Marks a partition as needing reconstruction.
    ///
    /// # Errors
    ///
    /// Returns a wrapped catalog error.
    pub async fn mark_partition_for_recovery(&self, substore: SubstoreId) -> EngineResult<()> {
        let row = self.substore(substore).await?;
        self.catalog
            .set_substore_state(substore, PartitionState::MarkedOffline)
            .await
            .catalog_ctx(
                OperationContext::new(Phase::Reconstruction)
                    .store(row.store_id)
                    .partition(substore),
            )?;
        info!(store_id = %row.store_id, substore_id = %substore, "partition marked for recovery");
        Ok(())
    }

    /// Rebuilds a local partition's index in `mode`.
    ///
    /// The partition is `MarkedOffline` while it rebuilds and returns Online
    /// on success; a failed run leaves it marked for recovery.
    ///
    /// # Errors
    ///
    /// Returns `PartitionNotFound`, `PathInaccessible`, `AfDiffFailed` or a
    /// wrapped catalog or index error.
    pub async fn run_reconstruction(
        &self,
        store: StoreId,
        substore: SubstoreId,
        mode: ReconstructionMode,
    ) -> EngineResult<ReconstructionReport> {
        let ctx = OperationContext::new(Phase::Reconstruction)
            .store(store)
            .partition(substore);
        let lock = self.maintenance_lock(store);
        let _held = lock.lock().await;

        let row = self.store(store).await?;
        let part = self.substore(substore).await?;
        if part.store_id != store || part.media_agent != self.name {
            return Err(EngineError::PartitionNotFound {
                partition: substore,
            });
        }
        self.catalog
            .set_substore_state(substore, PartitionState::MarkedOffline)
            .await
            .catalog_ctx(ctx)?;
        let (handle, _) = self.processes.ensure_running(&part)?;

        let config = self.config.current();
        let report = resync::run_reconstruction(
            self.catalog(),
            &handle,
            &row,
            &part,
            mode,
            &config.resync,
            config.resync.af_diff_batch_size,
            self.clock(),
        )
        .await?;

        self.catalog
            .set_substore_state(substore, PartitionState::Online)
            .await
            .catalog_ctx(ctx)?;
        ensure_distributor(self.catalog(), store).await?;
        Ok(report)
    }

    /// Runs one resync attempt over the store's local Online partitions.
    ///
    /// # Errors
    ///
    /// Returns `StoreNotFound` or a wrapped catalog error. A failed AF diff
    /// is reported through the returned ledger row.
    pub async fn run_resync(&self, store: StoreId) -> EngineResult<ResyncHistoryEntry> {
        let lock = self.maintenance_lock(store);
        let _held = lock.lock().await;
        let row = self.store(store).await?;
        let handles: Vec<Arc<IndexProcessHandle>> =
            self.online_handles(store).await?.into_values().collect();
        let manager = ResyncManager::new(
            Arc::clone(&self.catalog),
            self.config.current().resync.af_diff_batch_size,
        );
        manager.run_attempt(&row, &handles, self.now_ms()).await
    }

    /// Moves `CreatedTime` back by `days`, for validation scheduling tests
    /// and operator drills.
    ///
    /// # Errors
    ///
    /// Returns `StoreNotFound` or a wrapped catalog error.
    pub async fn age_store(&self, store: StoreId, days: u64) -> EngineResult<u64> {
        let row = self.store(store).await?;
        let created = row
            .created_time_ms
            .saturating_sub(days.saturating_mul(DAY_MS));
        self.catalog
            .set_store_created_time(store, created)
            .await
            .catalog_ctx(OperationContext::new(Phase::Resync).store(store))?;
        info!(store_id = %store, days, "store creation time moved back");
        Ok(created)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// `GetDistributorPartition`.
    ///
    /// # Errors
    ///
    /// Returns `NoDistributor`, `MultipleDistributors`, `StoreDegraded` or a
    /// wrapped catalog error.
    pub async fn distributor_partition(&self, store: StoreId) -> EngineResult<SubstoreId> {
        identify_distributor(self.catalog(), store).await
    }

    /// `GetPendingDeleteCount`.
    ///
    /// # Errors
    ///
    /// Returns a wrapped catalog error.
    pub async fn pending_delete_count(&self, store: StoreId) -> EngineResult<u64> {
        self.catalog
            .pending_delete_count(store)
            .await
            .catalog_ctx(OperationContext::new(Phase::CatalogCleanup).store(store))
    }

    /// `GetZeroRefCount`: the latest usage sample of the partition.
    ///
    /// # Errors
    ///
    /// Returns a wrapped catalog error.
    pub async fn zero_ref_count(&self, substore: SubstoreId) -> EngineResult<u64> {
        Ok(self
            .catalog
            .latest_usage(substore)
            .await
            .catalog_ctx(OperationContext::new(Phase::Usage).partition(substore))?
            .map_or(0, |sample| sample.zero_ref_count))
    }

    /// Zero-ref records across every partition of the store.
    ///
    /// # Errors
    ///
    /// Returns a wrapped catalog error.
    pub async fn store_zero_ref_count(&self, store: StoreId) -> EngineResult<u64> {
        let mut total = 0;
        for substore in self.substores(store).await? {
            total += self.zero_ref_count(substore.id).await?;
        }
        Ok(total)
    }

    /// Primary records across every partition of the store.
    ///
    /// # Errors
    ///
    /// Returns a wrapped catalog error.
    pub async fn store_primary_count(&self, store: StoreId) -> EngineResult<u64> {
        let mut total = 0;
        for substore in self.substores(store).await? {
            total += self
                .catalog
                .latest_usage(substore.id)
                .await
                .catalog_ctx(OperationContext::new(Phase::Usage).store(store))?
                .map_or(0, |sample| sample.primary_entries);
        }
        Ok(total)
    }

    /// # Errors
    ///
    /// Returns a wrapped catalog error.
    pub async fn latest_resync_history(
        &self,
        store: StoreId,
    ) -> EngineResult<Option<ResyncHistoryEntry>> {
        self.catalog
            .latest_resync_history(store)
            .await
            .catalog_ctx(OperationContext::new(Phase::Resync).store(store))
    }

    /// # Errors
    ///
    /// Returns a wrapped catalog error.
    pub async fn resync_history(&self, store: StoreId) -> EngineResult<Vec<ResyncHistoryEntry>> {
        self.catalog
            .resync_history(store)
            .await
            .catalog_ctx(OperationContext::new(Phase::Resync).store(store))
    }

    /// Valid archive files of the store according to the catalog.
    ///
    /// # Errors
    ///
    /// Returns a wrapped catalog error.
    pub async fn catalog_archive_files(&self, store: StoreId) -> EngineResult<Vec<ArchFileId>> {
        Ok(self
            .catalog
            .archive_files(store)
            .await
            .catalog_ctx(OperationContext::new(Phase::Restore).store(store))?
            .into_iter()
            .filter(|af| af.valid)
            .map(|af| af.id)
            .collect())
    }

    /// Archive files registered in the store's running local indexes.
    ///
    /// # Errors
    ///
    /// Returns a wrapped catalog or index error.
    pub async fn index_archive_files(&self, store: StoreId) -> EngineResult<BTreeSet<ArchFileId>> {
        let mut ids = BTreeSet::new();
        for substore in self.local_substores(store).await? {
            let Some(handle) = self.processes.handle(substore.id) else {
                continue;
            };
            ids.extend(handle.all_archive_files().await.index_ctx(
                OperationContext::new(Phase::Restore)
                    .store(store)
                    .partition(substore.id),
            )?);
        }
        Ok(ids)
    }

    /// `IsDdbOnline`: every partition of the store is Online.
    ///
    /// # Errors
    ///
    /// Returns a wrapped catalog error.
    pub async fn is_ddb_online(&self, store: StoreId) -> EngineResult<bool> {
        let substores = self.substores(store).await?;
        Ok(!substores.is_empty() && substores.iter().all(Substore::is_online))
    }

    // -----------------------------------------------------------------------
    // Bounded waits
    // -----------------------------------------------------------------------

    /// Waits until the store's distributor is an Online partition other
    /// than `previous`.
    ///
    /// # Errors
    ///
    /// Returns `WaitTimeout` once the distributor-change budget is spent.
    pub async fn wait_for_distributor_change(
        &self,
        store: StoreId,
        previous: SubstoreId,
    ) -> EngineResult<SubstoreId> {
        let budget = self.config.current().waits.distributor_change();
        let what = format!("distributor of store {store} to move off partition {previous}");
        poll_until(&what, budget, || async move {
            match identify_distributor(self.catalog(), store).await {
                Ok(current) if current != previous => Ok(Some(current)),
                Ok(_)
                | Err(
                    EngineError::NoDistributor { .. }
                    | EngineError::MultipleDistributors { .. }
                    | EngineError::StoreDegraded { .. },
                ) => Ok(None),
                Err(err) => Err(err),
            }
        })
        .await
    }

    /// Waits until no pending-delete or tracking rows remain for the store.
    ///
    /// # Errors
    ///
    /// Returns `WaitTimeout` once the pruning budget is spent.
    pub async fn wait_for_pruning(&self, store: StoreId) -> EngineResult<()> {
        let budget = self.config.current().waits.pruning();
        let what = format!("pending deletes of store {store} to drain");
        poll_until(&what, budget, || async move {
            Ok((self.pending_delete_count(store).await? == 0).then_some(()))
        })
        .await
    }

    /// Waits until the partition's reported zero-ref count reaches zero.
    ///
    /// # Errors
    ///
    /// Returns `WaitTimeout` once the zero-ref budget is spent.
    pub async fn wait_for_zero_ref_drain(&self, substore: SubstoreId) -> EngineResult<()> {
        let budget = self.config.current().waits.zero_ref_drain();
        let what = format!("zero-ref records of partition {substore} to drain");
        poll_until(&what, budget, || async move {
            Ok((self.zero_ref_count(substore).await? == 0).then_some(()))
        })
        .await
    }

    /// Waits for a successful resync attempt numbered after `after_attempt`,
    /// polling once per scheduler cycle.
    ///
    /// # Errors
    ///
    /// Returns `WaitTimeout` once `resync_poll_attempts` cycles have passed.
    pub async fn wait_for_resync(
        &self,
        store: StoreId,
        after_attempt: u32,
    ) -> EngineResult<ResyncHistoryEntry> {
        let config = self.config.current();
        let budget = PollBudget::new(
            config.pruning.prune_interval(),
            config.waits.resync_poll_attempts,
        );
        let what = format!("resync of store {store} to succeed");
        poll_until(&what, budget, || async move {
            Ok(self.latest_resync_history(store).await?.filter(|entry| {
                entry.attempt_no > after_attempt && entry.status == ResyncStatus::Success
            }))
        })
        .await
    }

    /// Stops every index process this agent runs.
    pub async fn shutdown(&self) {
        self.processes.stop_all().await;
        info!(media_agent = %self.name, "index processes stopped");
    }
}

impl std::fmt::Debug for MediaAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaAgent")
            .field("name", &self.name)
            .field("running", &self.processes.running())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use ddb_core::ManualClock;

    use super::*;
    use crate::catalog::InMemoryCatalog;
    use crate::chunk_store::MemoryChunkStore;
    use crate::config::AgentConfig;
    use crate::index::MemoryIndexFactory;

    struct Fixture {
        agent: MediaAgent,
        catalog: Arc<InMemoryCatalog>,
        chunks: Arc<MemoryChunkStore>,
        factory: Arc<MemoryIndexFactory>,
        clock: Arc<ManualClock>,
    }

    fn fixture_with(config: AgentConfig) -> Fixture {
        let catalog = Arc::new(InMemoryCatalog::new());
        let chunks = Arc::new(MemoryChunkStore::new());
        let factory = Arc::new(MemoryIndexFactory::new());
        let clock = Arc::new(ManualClock::new(DAY_MS));
        let agent = MediaAgent::new(
            Arc::new(ConfigHandle::new(config)),
            catalog.clone(),
            chunks.clone(),
            factory.clone(),
            clock.clone(),
        );
        Fixture {
            agent,
            catalog,
            chunks,
            factory,
            clock,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(AgentConfig::default())
    }

    fn paths(name: &str, n: usize) -> Vec<String> {
        (0..n).map(|i| format!("/ddb/{name}/p{i}")).collect()
    }

    fn file(tag: &str, chunks: usize) -> Vec<Bytes> {
        (0..chunks)
            .map(|i| Bytes::from(format!("{tag}-chunk-{i}")))
            .collect()
    }

    #[tokio::test]
    async fn create_store_elects_lowest_partition_and_starts_indexes() {
        let fx = fixture();
        let store = fx.agent.create_store("pool", &paths("pool", 3)).await.unwrap();

        assert!(store.flags.is_pruning_enabled());
        assert!(store.extended_flags.is_mark_and_sweep_enabled());
        let parts = fx.agent.substores(store.id).await.unwrap();
        assert_eq!(
            fx.agent.distributor_partition(store.id).await.unwrap(),
            parts[0].id
        );
        assert_eq!(fx.agent.processes().running().len(), 3);
        assert!(fx.agent.is_ddb_online(store.id).await.unwrap());
    }

    #[tokio::test]
    async fn create_store_rejects_bad_input() {
        let fx = fixture_with(AgentConfig {
            index: crate::config::IndexConfig {
                require_volume_backed_paths: true,
                ..Default::default()
            },
            ..Default::default()
        });
        assert!(matches!(
            fx.agent.create_store("a", &[]).await,
            Err(EngineError::NoPartitions)
        ));
        assert!(matches!(
            fx.agent
                .create_store("a", &["/ddb/a".to_string(), "relative/p1".to_string()])
                .await,
            Err(EngineError::MissingPartitionPath { index: 1 })
        ));
        fx.agent.create_store("a", &paths("a", 1)).await.unwrap();
        assert!(matches!(
            fx.agent.create_store("a", &paths("b", 1)).await,
            Err(EngineError::DuplicateStoreName { .. })
        ));
    }

    #[tokio::test]
    async fn backup_round_trips_and_deduplicates() {
        let fx = fixture();
        let store = fx.agent.create_store("pool", &paths("pool", 4)).await.unwrap();
        let shared = file("shared", 20);

        let first = fx
            .agent
            .backup(store.id, JobId(1), vec![shared.clone()])
            .await
            .unwrap();
        let second = fx
            .agent
            .backup(store.id, JobId(2), vec![shared.clone()])
            .await
            .unwrap();

        assert_eq!(fx.agent.read_archive_file(first[0]).await.unwrap(), shared);
        assert_eq!(fx.agent.read_archive_file(second[0]).await.unwrap(), shared);
        assert_eq!(fx.chunks.chunk_count(store.id).await.unwrap(), 20);
        assert!(fx.agent.is_job_restorable(JobId(1)).await.unwrap());
        assert_eq!(
            fx.agent.index_archive_files(store.id).await.unwrap(),
            first.iter().chain(&second).copied().collect::<BTreeSet<_>>()
        );
    }

    #[tokio::test]
    async fn sealed_store_refuses_backups() {
        let fx = fixture();
        let store = fx.agent.create_store("pool", &paths("pool", 1)).await.unwrap();
        fx.agent.seal_store(store.id).await.unwrap();
        assert!(matches!(
            fx.agent.backup(store.id, JobId(1), vec![file("x", 1)]).await,
            Err(EngineError::StoreSealed { .. })
        ));
    }

    #[tokio::test]
    async fn deleted_job_is_no_longer_restorable() {
        let fx = fixture();
        let store = fx.agent.create_store("pool", &paths("pool", 2)).await.unwrap();
        let ids = fx
            .agent
            .backup(store.id, JobId(7), vec![file("a", 3)])
            .await
            .unwrap();

        assert_eq!(fx.agent.delete_job(JobId(7)).await.unwrap(), ids);
        assert!(fx.agent.delete_job(JobId(7)).await.unwrap().is_empty());
        assert!(!fx.agent.is_job_restorable(JobId(7)).await.unwrap());
        assert!(matches!(
            fx.agent.read_archive_file(ids[0]).await,
            Err(EngineError::ArchiveFileUnavailable { .. })
        ));
        assert_eq!(fx.agent.pending_delete_count(store.id).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn backup_to_unreachable_partition_records_nothing() {
        let fx = fixture();
        let store = fx.agent.create_store("pool", &paths("pool", 2)).await.unwrap();
        let part = fx.agent.substores(store.id).await.unwrap().remove(1);
        fx.agent.processes().request_stop(part.id);
        fx.agent.processes().wait_till_down(part.id).await.unwrap();
        fx.factory.set_path_available(&part.path, false);
        assert!(fx.agent.substore(part.id).await.unwrap().is_online());

        let result = fx
            .agent
            .backup(store.id, JobId(1), vec![file("a", 40)])
            .await;
        assert!(matches!(result, Err(EngineError::PathInaccessible { .. })));
        assert!(fx.catalog.archive_files(store.id).await.unwrap().is_empty());
        assert_eq!(fx.chunks.chunk_count(store.id).await.unwrap(), 0);

        fx.factory.set_path_available(&part.path, true);
        let ids = fx
            .agent
            .backup(store.id, JobId(1), vec![file("a", 40)])
            .await
            .unwrap();
        assert_eq!(fx.agent.catalog_archive_files(store.id).await.unwrap(), ids);
        assert!(fx.agent.is_job_restorable(JobId(1)).await.unwrap());
        assert_eq!(fx.chunks.chunk_count(store.id).await.unwrap(), 40);
    }

    #[tokio::test(start_paused = true)]
    async fn delete_store_stops_indexes_and_purges_chunks() {
        let fx = fixture();
        let store = fx.agent.create_store("pool", &paths("pool", 2)).await.unwrap();
        fx.agent
            .backup(store.id, JobId(1), vec![file("a", 4)])
            .await
            .unwrap();

        assert!(fx.agent.delete_store(store.id).await.unwrap());
        assert!(fx.agent.processes().running().is_empty());
        assert_eq!(fx.chunks.chunk_count(store.id).await.unwrap(), 0);
        assert!(matches!(
            fx.agent.store(store.id).await,
            Err(EngineError::StoreNotFound { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn reconstruction_brings_partition_back_online() {
        let fx = fixture();
        let store = fx.agent.create_store("pool", &paths("pool", 2)).await.unwrap();
        let ids = fx
            .agent
            .backup(store.id, JobId(1), vec![file("a", 8), file("b", 8)])
            .await
            .unwrap();
        let part = fx.agent.substores(store.id).await.unwrap().remove(1);
        fx.agent.mark_partition_for_recovery(part.id).await.unwrap();
        fx.agent.processes().request_stop(part.id);
        fx.agent.processes().wait_till_down(part.id).await.unwrap();
        fx.factory.wipe(&part.path);

        let report = fx
            .agent
            .run_reconstruction(store.id, part.id, ReconstructionMode::Regular)
            .await
            .unwrap();

        assert!(report.validated);
        assert!(report.restored_afs > 0);
        assert!(fx.agent.substore(part.id).await.unwrap().is_online());
        assert_eq!(
            fx.agent.index_archive_files(store.id).await.unwrap(),
            ids.into_iter().collect::<BTreeSet<_>>()
        );
    }

    #[tokio::test]
    async fn manual_resync_records_a_successful_attempt() {
        let fx = fixture();
        let store = fx.agent.create_store("pool", &paths("pool", 2)).await.unwrap();
        fx.agent
            .backup(store.id, JobId(1), vec![file("a", 4)])
            .await
            .unwrap();
        fx.agent.mark_store_for_recovery(store.id).await.unwrap();

        let entry = fx.agent.run_resync(store.id).await.unwrap();
        assert_eq!(entry.status, ResyncStatus::Success);
        assert_eq!(entry.maintenance_reason, MaintenanceReason::ArchiveFileValidation);
        assert_eq!(entry.resync_flags, ResyncFlags::PRUNE_INVALID_AFS);
        assert!(!fx.agent.store(store.id).await.unwrap().flags.needs_auto_resync());
    }

    #[tokio::test]
    async fn age_store_and_mark_and_sweep_interval_update_the_catalog() {
        let fx = fixture();
        fx.clock.set(40 * DAY_MS);
        let store = fx.agent.create_store("pool", &paths("pool", 1)).await.unwrap();

        let created = fx.agent.age_store(store.id, 31).await.unwrap();
        assert_eq!(created, 9 * DAY_MS);
        fx.agent.set_mark_and_sweep_interval(store.id, 2).await.unwrap();

        let row = fx.catalog.store(store.id).await.unwrap().unwrap();
        assert_eq!(row.created_time_ms, 9 * DAY_MS);
        assert_eq!(row.mark_and_sweep_interval_secs, Some(7200));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_pruning_times_out_without_a_scheduler() {
        let fx = fixture();
        let store = fx.agent.create_store("pool", &paths("pool", 1)).await.unwrap();
        fx.agent
            .backup(store.id, JobId(1), vec![file("a", 1)])
            .await
            .unwrap();
        fx.agent.delete_job(JobId(1)).await.unwrap();

        let start = tokio::time::Instant::now();
        let err = fx.agent.wait_for_pruning(store.id).await.unwrap_err();
        assert!(matches!(err, EngineError::WaitTimeout { .. }));
        assert_eq!(start.elapsed(), Duration::from_secs(10 * 300));
    }
}
