//! In-memory [`Catalog`] with deterministic AF-diff fault injection.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use ddb_core::{
    AfState, AfValidity, ArchFileId, ArchiveFile, ChunkRef, DedupStore, DeletedAfTracking, JobId,
    PartitionState, PendingDeleteEntry, RecoveryHistoryEntry, ResyncHistoryEntry, ResyncRequest,
    StoreFlags, StoreId, Substore, SubstoreExtendedFlags, SubstoreFlags, SubstoreId, UsageSample,
};
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use super::{Catalog, NewStore};

// ---------------------------------------------------------------------------
// Fault injection
// ---------------------------------------------------------------------------

/// How a faulted AF-diff call misbehaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultMode {
    /// Answer with an empty response batch.
    Truncate,
    /// Fail the call outright.
    Error,
}

/// Corrupts a fraction of AF-diff calls, reproducibly for a given seed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AfDiffFault {
    /// Probability in `[0, 1]` that a call is faulted.
    pub probability: f64,
    pub mode: FaultMode,
    pub seed: u64,
}

struct ActiveFault {
    fault: AfDiffFault,
    rng: StdRng,
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Usage samples kept per partition; older samples are discarded.
pub const USAGE_HISTORY_LEN: usize = 168;

#[derive(Default)]
struct CatalogState {
    next_store: u64,
    next_substore: u64,
    next_arch_file: u64,
    stores: BTreeMap<StoreId, DedupStore>,
    substores: BTreeMap<SubstoreId, Substore>,
    archive_files: BTreeMap<ArchFileId, ArchiveFile>,
    pending: BTreeMap<ArchFileId, PendingDeleteEntry>,
    tracking: BTreeMap<(ArchFileId, SubstoreId), DeletedAfTracking>,
    usage: HashMap<SubstoreId, VecDeque<UsageSample>>,
    resync: BTreeMap<StoreId, Vec<ResyncHistoryEntry>>,
    recovery: BTreeMap<StoreId, Vec<RecoveryHistoryEntry>>,
}

impl CatalogState {
    fn store_mut(&mut self, id: StoreId) -> anyhow::Result<&mut DedupStore> {
        self.stores
            .get_mut(&id)
            .ok_or_else(|| anyhow!("store {id} not found"))
    }

    fn substore_mut(&mut self, id: SubstoreId) -> anyhow::Result<&mut Substore> {
        self.substores
            .get_mut(&id)
            .ok_or_else(|| anyhow!("substore {id} not found"))
    }

    /// Marks the valid archive files matching `select` invalid and queues a
    /// pending-delete row for each.
    fn invalidate(
        &mut self,
        select: impl Fn(&ArchiveFile) -> bool,
        now_ms: u64,
    ) -> Vec<ArchFileId> {
        let mut entries = Vec::new();
        for af in self
            .archive_files
            .values_mut()
            .filter(|af| af.valid && select(af))
        {
            af.valid = false;
            entries.push(PendingDeleteEntry {
                arch_file_id: af.id,
                store_id: af.store_id,
                job_id: af.job_id,
                added_ms: now_ms,
                expanded: false,
            });
        }
        let invalidated = entries.iter().map(|e| e.arch_file_id).collect();
        for entry in entries {
            self.pending.insert(entry.arch_file_id, entry);
        }
        invalidated
    }
}

/// Catalog held entirely in memory.
///
/// A single `RwLock` guards all tables, so every trait method is atomic.
/// Several media agents may share one instance through an `Arc`.
pub struct InMemoryCatalog {
    state: RwLock<CatalogState>,
    fault: Mutex<Option<ActiveFault>>,
    af_diff_calls: AtomicU64,
    af_diff_faults: AtomicU64,
}

impl InMemoryCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(CatalogState::default()),
            fault: Mutex::new(None),
            af_diff_calls: AtomicU64::new(0),
            af_diff_faults: AtomicU64::new(0),
        }
    }

    /// Starts corrupting AF-diff responses.
    pub fn inject_af_diff_fault(&self, fault: AfDiffFault) {
        *self.fault.lock() = Some(ActiveFault {
            fault,
            rng: StdRng::seed_from_u64(fault.seed),
        });
    }

    pub fn clear_af_diff_fault(&self) {
        *self.fault.lock() = None;
    }

    /// Number of AF-diff calls served, faulted or not.
    #[must_use]
    pub fn af_diff_calls(&self) -> u64 {
        self.af_diff_calls.load(Ordering::Relaxed)
    }

    /// Number of AF-diff calls that were faulted.
    #[must_use]
    pub fn af_diff_faults(&self) -> u64 {
        self.af_diff_faults.load(Ordering::Relaxed)
    }

    /// Retained usage samples of a partition, oldest first.
    #[must_use]
    pub fn usage_history(&self, substore: SubstoreId) -> Vec<UsageSample> {
        self.state
            .read()
            .usage
            .get(&substore)
            .map(|history| history.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Raw partition row update for operators and tests that flip flag bits
    /// directly, bypassing the election logic.
    ///
    /// # Errors
    ///
    /// Returns an error if the substore does not exist.
    pub fn set_substore_extended_flags(
        &self,
        id: SubstoreId,
        flags: SubstoreExtendedFlags,
    ) -> anyhow::Result<()> {
        self.state.write().substore_mut(id)?.extended_flags = flags;
        Ok(())
    }

    /// Returns the fault verdict for the next AF-diff call.
    fn next_fault(&self) -> Option<FaultMode> {
        let mut guard = self.fault.lock();
        let active = guard.as_mut()?;
        let probability = active.fault.probability.clamp(0.0, 1.0);
        active
            .rng
            .random_bool(probability)
            .then_some(active.fault.mode)
    }
}

impl Default for InMemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Catalog for InMemoryCatalog {
    // -- Stores -------------------------------------------------------------

    async fn create_store(&self, new: NewStore) -> anyhow::Result<DedupStore> {
        let mut state = self.state.write();
        if state.stores.values().any(|s| s.name == new.name) {
            bail!("store name {:?} already exists", new.name);
        }

        state.next_store += 1;
        let id = StoreId(state.next_store);
        let store = DedupStore {
            id,
            name: new.name,
            created_time_ms: new.created_time_ms,
            last_resync_ms: None,
            flags: new.flags,
            extended_flags: new.extended_flags,
            mark_and_sweep_interval_secs: None,
            resync_request: None,
        };
        state.stores.insert(id, store.clone());

        for partition in new.partitions {
            state.next_substore += 1;
            let substore_id = SubstoreId(state.next_substore);
            state.substores.insert(
                substore_id,
                Substore {
                    id: substore_id,
                    store_id: id,
                    path: partition.path,
                    media_agent: partition.media_agent,
                    state: PartitionState::Online,
                    flags: SubstoreFlags::empty(),
                    extended_flags: SubstoreExtendedFlags::empty(),
                },
            );
        }
        Ok(store)
    }

    async fn store(&self, id: StoreId) -> anyhow::Result<Option<DedupStore>> {
        Ok(self.state.read().stores.get(&id).cloned())
    }

    async fn store_by_name(&self, name: &str) -> anyhow::Result<Option<DedupStore>> {
        Ok(self
            .state
            .read()
            .stores
            .values()
            .find(|s| s.name == name)
            .cloned())
    }

    async fn stores(&self) -> anyhow::Result<Vec<DedupStore>> {
        Ok(self.state.read().stores.values().cloned().collect())
    }

    async fn delete_store(&self, id: StoreId) -> anyhow::Result<bool> {
        let mut state = self.state.write();
        if state.stores.remove(&id).is_none() {
            return Ok(false);
        }
        let substores: Vec<SubstoreId> = state
            .substores
            .values()
            .filter(|s| s.store_id == id)
            .map(|s| s.id)
            .collect();
        for substore in &substores {
            state.substores.remove(substore);
            state.usage.remove(substore);
        }
        state.archive_files.retain(|_, af| af.store_id != id);
        state.pending.retain(|_, p| p.store_id != id);
        state.tracking.retain(|_, t| t.store_id != id);
        state.resync.remove(&id);
        state.recovery.remove(&id);
        Ok(true)
    }

    async fn update_store_flags(
        &self,
        id: StoreId,
        insert: StoreFlags,
        remove: StoreFlags,
    ) -> anyhow::Result<StoreFlags> {
        let mut state = self.state.write();
        let store = state.store_mut(id)?;
        store.flags.insert(insert);
        store.flags.remove(remove);
        Ok(store.flags)
    }

    async fn set_store_created_time(
        &self,
        id: StoreId,
        created_time_ms: u64,
    ) -> anyhow::Result<()> {
        self.state.write().store_mut(id)?.created_time_ms = created_time_ms;
        Ok(())
    }

    async fn set_mark_and_sweep_interval(
        &self,
        id: StoreId,
        interval_secs: Option<u64>,
    ) -> anyhow::Result<()> {
        self.state.write().store_mut(id)?.mark_and_sweep_interval_secs = interval_secs;
        Ok(())
    }

    async fn request_resync(&self, id: StoreId, request: ResyncRequest) -> anyhow::Result<()> {
        let mut state = self.state.write();
        let store = state.store_mut(id)?;
        store.flags.insert(StoreFlags::NEEDS_AUTO_RESYNC);
        store.resync_request = Some(request);
        Ok(())
    }

    async fn complete_resync(&self, id: StoreId, now_ms: u64) -> anyhow::Result<()> {
        let mut state = self.state.write();
        let store = state.store_mut(id)?;
        store.flags.remove(StoreFlags::NEEDS_AUTO_RESYNC);
        store.resync_request = None;
        store.last_resync_ms = Some(now_ms);
        Ok(())
    }

    // -- Substores ----------------------------------------------------------

    async fn substores(&self, store: StoreId) -> anyhow::Result<Vec<Substore>> {
        Ok(self
            .state
            .read()
            .substores
            .values()
            .filter(|s| s.store_id == store)
            .cloned()
            .collect())
    }

    async fn substore(&self, id: SubstoreId) -> anyhow::Result<Option<Substore>> {
        Ok(self.state.read().substores.get(&id).cloned())
    }

    async fn set_substore_state(
        &self,
        id: SubstoreId,
        partition_state: PartitionState,
    ) -> anyhow::Result<()> {
        self.state.write().substore_mut(id)?.state = partition_state;
        Ok(())
    }

    async fn set_distributor(&self, store: StoreId, substore: SubstoreId) -> anyhow::Result<()> {
        let mut state = self.state.write();
        match state.substores.get(&substore) {
            Some(s) if s.store_id == store => {}
            Some(_) => bail!("substore {substore} does not belong to store {store}"),
            None => bail!("substore {substore} not found"),
        }
        for s in state.substores.values_mut().filter(|s| s.store_id == store) {
            s.extended_flags
                .set(SubstoreExtendedFlags::DISTRIBUTOR, s.id == substore);
        }
        Ok(())
    }

    // -- Archive files ------------------------------------------------------

    async fn insert_archive_file(
        &self,
        job: JobId,
        store: StoreId,
        created_ms: u64,
        chunks: Vec<ChunkRef>,
    ) -> anyhow::Result<ArchiveFile> {
        let mut state = self.state.write();
        if !state.stores.contains_key(&store) {
            bail!("store {store} not found");
        }
        state.next_arch_file += 1;
        let af = ArchiveFile {
            id: ArchFileId(state.next_arch_file),
            job_id: job,
            store_id: store,
            valid: true,
            created_ms,
            chunks,
        };
        state.archive_files.insert(af.id, af.clone());
        Ok(af)
    }

    async fn archive_file(&self, id: ArchFileId) -> anyhow::Result<Option<ArchiveFile>> {
        Ok(self.state.read().archive_files.get(&id).cloned())
    }

    async fn archive_files(&self, store: StoreId) -> anyhow::Result<Vec<ArchiveFile>> {
        Ok(self
            .state
            .read()
            .archive_files
            .values()
            .filter(|af| af.store_id == store)
            .cloned()
            .collect())
    }

    async fn job_archive_files(&self, job: JobId) -> anyhow::Result<Vec<ArchiveFile>> {
        Ok(self
            .state
            .read()
            .archive_files
            .values()
            .filter(|af| af.job_id == job)
            .cloned()
            .collect())
    }

    async fn invalidate_job(&self, job: JobId, now_ms: u64) -> anyhow::Result<Vec<ArchFileId>> {
        Ok(self.state.write().invalidate(|af| af.job_id == job, now_ms))
    }

    async fn invalidate_archive_files(
        &self,
        ids: &[ArchFileId],
        now_ms: u64,
    ) -> anyhow::Result<Vec<ArchFileId>> {
        Ok(self
            .state
            .write()
            .invalidate(|af| ids.contains(&af.id), now_ms))
    }

    async fn validate_archive_files(
        &self,
        store: StoreId,
        ids: &[ArchFileId],
    ) -> anyhow::Result<Vec<AfValidity>> {
        self.af_diff_calls.fetch_add(1, Ordering::Relaxed);
        if let Some(mode) = self.next_fault() {
            self.af_diff_faults.fetch_add(1, Ordering::Relaxed);
            debug!(store_id = %store, ?mode, "injected AF diff fault");
            match mode {
                FaultMode::Truncate => return Ok(Vec::new()),
                FaultMode::Error => bail!(
                    "Unable to get AFInfoList for SIDBStoreId [{store}] from MM. RetCode [-1]"
                ),
            }
        }

        let state = self.state.read();
        Ok(ids
            .iter()
            .map(|&id| {
                let af_state = match state.archive_files.get(&id) {
                    Some(af) if af.store_id == store && af.valid => AfState::Valid,
                    Some(af) if af.store_id == store => AfState::Invalid,
                    _ => AfState::Unknown,
                };
                AfValidity {
                    arch_file_id: id,
                    state: af_state,
                }
            })
            .collect())
    }

    async fn remove_archive_file(&self, id: ArchFileId) -> anyhow::Result<bool> {
        Ok(self.state.write().archive_files.remove(&id).is_some())
    }

    // -- Pending deletes ----------------------------------------------------

    async fn pending_deletes(&self, store: StoreId) -> anyhow::Result<Vec<PendingDeleteEntry>> {
        Ok(self
            .state
            .read()
            .pending
            .values()
            .filter(|p| p.store_id == store)
            .cloned()
            .collect())
    }

    async fn expand_pending(
        &self,
        arch_file: ArchFileId,
        substores: &[SubstoreId],
        now_ms: u64,
    ) -> anyhow::Result<()> {
        let mut state = self.state.write();
        let store_id = {
            let entry = state
                .pending
                .get_mut(&arch_file)
                .ok_or_else(|| anyhow!("no pending delete for archive file {arch_file}"))?;
            if entry.expanded {
                return Ok(());
            }
            entry.expanded = true;
            entry.store_id
        };
        for &substore_id in substores {
            state.tracking.insert(
                (arch_file, substore_id),
                DeletedAfTracking {
                    arch_file_id: arch_file,
                    store_id,
                    substore_id,
                    added_ms: now_ms,
                },
            );
        }
        Ok(())
    }

    async fn tracking_rows(&self, store: StoreId) -> anyhow::Result<Vec<DeletedAfTracking>> {
        Ok(self
            .state
            .read()
            .tracking
            .values()
            .filter(|t| t.store_id == store)
            .cloned()
            .collect())
    }

    async fn complete_tracking(
        &self,
        arch_file: ArchFileId,
        substore: SubstoreId,
    ) -> anyhow::Result<bool> {
        Ok(self
            .state
            .write()
            .tracking
            .remove(&(arch_file, substore))
            .is_some())
    }

    async fn finalize_pending(&self, arch_file: ArchFileId) -> anyhow::Result<bool> {
        let mut state = self.state.write();
        let expanded = state.pending.get(&arch_file).is_some_and(|p| p.expanded);
        let outstanding = state.tracking.keys().any(|(af, _)| *af == arch_file);
        if !expanded || outstanding {
            return Ok(false);
        }
        state.pending.remove(&arch_file);
        state.archive_files.remove(&arch_file);
        Ok(true)
    }

    async fn pending_delete_count(&self, store: StoreId) -> anyhow::Result<u64> {
        let state = self.state.read();
        let pending = state.pending.values().filter(|p| p.store_id == store).count();
        let tracking = state.tracking.values().filter(|t| t.store_id == store).count();
        Ok((pending + tracking) as u64)
    }

    // -- Usage history ------------------------------------------------------

    async fn record_usage(&self, sample: UsageSample) -> anyhow::Result<()> {
        let mut state = self.state.write();
        let history = state.usage.entry(sample.substore_id).or_default();
        if history.len() == USAGE_HISTORY_LEN {
            history.pop_front();
        }
        history.push_back(sample);
        Ok(())
    }

    async fn latest_usage(&self, substore: SubstoreId) -> anyhow::Result<Option<UsageSample>> {
        Ok(self
            .state
            .read()
            .usage
            .get(&substore)
            .and_then(|history| history.back().copied()))
    }

    // -- Ledgers ------------------------------------------------------------

    async fn append_resync_history(&self, entry: ResyncHistoryEntry) -> anyhow::Result<()> {
        let mut state = self.state.write();
        let history = state.resync.entry(entry.store_id).or_default();
        let expected = history.last().map_or(1, |last| last.attempt_no + 1);
        if entry.attempt_no != expected {
            bail!(
                "resync attempt {} for store {} out of sequence, expected {expected}",
                entry.attempt_no,
                entry.store_id
            );
        }
        history.push(entry);
        Ok(())
    }

    async fn update_resync_history(&self, entry: ResyncHistoryEntry) -> anyhow::Result<()> {
        let mut state = self.state.write();
        let row = state
            .resync
            .get_mut(&entry.store_id)
            .and_then(|history| {
                history
                    .iter_mut()
                    .find(|row| row.attempt_no == entry.attempt_no)
            })
            .ok_or_else(|| {
                anyhow!(
                    "no resync attempt {} for store {}",
                    entry.attempt_no,
                    entry.store_id
                )
            })?;
        *row = entry;
        Ok(())
    }

    async fn latest_resync_history(
        &self,
        store: StoreId,
    ) -> anyhow::Result<Option<ResyncHistoryEntry>> {
        Ok(self
            .state
            .read()
            .resync
            .get(&store)
            .and_then(|history| history.last().cloned()))
    }

    async fn resync_history(&self, store: StoreId) -> anyhow::Result<Vec<ResyncHistoryEntry>> {
        Ok(self
            .state
            .read()
            .resync
            .get(&store)
            .cloned()
            .unwrap_or_default())
    }

    async fn append_recovery_history(&self, entry: RecoveryHistoryEntry) -> anyhow::Result<()> {
        self.state
            .write()
            .recovery
            .entry(entry.store_id)
            .or_default()
            .push(entry);
        Ok(())
    }

    async fn recovery_history(
        &self,
        store: StoreId,
    ) -> anyhow::Result<Vec<RecoveryHistoryEntry>> {
        Ok(self
            .state
            .read()
            .recovery
            .get(&store)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use ddb_core::{
        MaintenanceReason, ResyncFlags, ResyncStatus, Signature, StoreExtendedFlags,
    };

    use super::*;
    use crate::catalog::NewPartition;

    fn new_store(name: &str, partitions: usize) -> NewStore {
        NewStore {
            name: name.to_string(),
            created_time_ms: 1_000,
            flags: StoreFlags::PRUNING_ENABLED,
            extended_flags: StoreExtendedFlags::DEFAULT,
            partitions: (0..partitions)
                .map(|i| NewPartition {
                    path: format!("/ddb/{name}/p{i}"),
                    media_agent: "ma1".to_string(),
                })
                .collect(),
        }
    }

    fn chunk(tag: &str, substore: SubstoreId) -> ChunkRef {
        ChunkRef {
            signature: Signature::of(tag.as_bytes()),
            size: 4,
            substore_id: substore,
        }
    }

    fn resync_row(store: StoreId, attempt_no: u32) -> ResyncHistoryEntry {
        ResyncHistoryEntry {
            store_id: store,
            attempt_no,
            maintenance_time_ms: 0,
            maintenance_reason: MaintenanceReason::ControlledValidation,
            resync_flags: ResyncFlags::SCHEDULED,
            status: ResyncStatus::InProgress,
            num_resynced_afids: 0,
            added_ms: 0,
        }
    }

    #[tokio::test]
    async fn create_store_assigns_ids_and_online_partitions() {
        let catalog = InMemoryCatalog::new();
        let store = catalog.create_store(new_store("pool", 3)).await.unwrap();
        let substores = catalog.substores(store.id).await.unwrap();

        assert_eq!(store.id, StoreId(1));
        assert_eq!(substores.len(), 3);
        assert!(substores.iter().all(Substore::is_online));
        assert!(substores.iter().all(|s| !s.is_distributor()));
    }

    #[tokio::test]
    async fn duplicate_store_name_is_rejected() {
        let catalog = InMemoryCatalog::new();
        catalog.create_store(new_store("pool", 1)).await.unwrap();
        assert!(catalog.create_store(new_store("pool", 1)).await.is_err());
    }

    #[tokio::test]
    async fn set_distributor_moves_the_bit_atomically() {
        let catalog = InMemoryCatalog::new();
        let store = catalog.create_store(new_store("pool", 3)).await.unwrap();
        let ids: Vec<SubstoreId> = catalog
            .substores(store.id)
            .await
            .unwrap()
            .iter()
            .map(|s| s.id)
            .collect();

        catalog.set_distributor(store.id, ids[0]).await.unwrap();
        catalog.set_distributor(store.id, ids[2]).await.unwrap();

        let flagged: Vec<SubstoreId> = catalog
            .substores(store.id)
            .await
            .unwrap()
            .into_iter()
            .filter(Substore::is_distributor)
            .map(|s| s.id)
            .collect();
        assert_eq!(flagged, vec![ids[2]]);
    }

    #[tokio::test]
    async fn set_distributor_rejects_foreign_partition() {
        let catalog = InMemoryCatalog::new();
        let a = catalog.create_store(new_store("a", 1)).await.unwrap();
        let b = catalog.create_store(new_store("b", 1)).await.unwrap();
        let foreign = catalog.substores(b.id).await.unwrap()[0].id;
        assert!(catalog.set_distributor(a.id, foreign).await.is_err());
    }

    #[tokio::test]
    async fn invalidate_job_is_idempotent() {
        let catalog = InMemoryCatalog::new();
        let store = catalog.create_store(new_store("pool", 1)).await.unwrap();
        let substore = catalog.substores(store.id).await.unwrap()[0].id;
        catalog
            .insert_archive_file(JobId(2), store.id, 0, vec![chunk("a", substore)])
            .await
            .unwrap();

        let first = catalog.invalidate_job(JobId(2), 10).await.unwrap();
        let second = catalog.invalidate_job(JobId(2), 20).await.unwrap();

        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
        assert_eq!(catalog.pending_delete_count(store.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn pending_entry_finalizes_only_after_tracking_rows_complete() {
        let catalog = InMemoryCatalog::new();
        let store = catalog.create_store(new_store("pool", 2)).await.unwrap();
        let subs: Vec<SubstoreId> = catalog
            .substores(store.id)
            .await
            .unwrap()
            .iter()
            .map(|s| s.id)
            .collect();
        let af = catalog
            .insert_archive_file(
                JobId(1),
                store.id,
                0,
                vec![chunk("a", subs[0]), chunk("b", subs[1])],
            )
            .await
            .unwrap();
        catalog.invalidate_job(JobId(1), 5).await.unwrap();

        // Not expanded yet.
        assert!(!catalog.finalize_pending(af.id).await.unwrap());

        catalog.expand_pending(af.id, &subs, 6).await.unwrap();
        assert_eq!(catalog.pending_delete_count(store.id).await.unwrap(), 3);

        catalog.complete_tracking(af.id, subs[0]).await.unwrap();
        assert!(!catalog.finalize_pending(af.id).await.unwrap());

        catalog.complete_tracking(af.id, subs[1]).await.unwrap();
        assert!(catalog.finalize_pending(af.id).await.unwrap());
        assert_eq!(catalog.pending_delete_count(store.id).await.unwrap(), 0);
        assert!(catalog.archive_file(af.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn validate_reports_valid_invalid_and_unknown() {
        let catalog = InMemoryCatalog::new();
        let store = catalog.create_store(new_store("pool", 1)).await.unwrap();
        let substore = catalog.substores(store.id).await.unwrap()[0].id;
        let keep = catalog
            .insert_archive_file(JobId(1), store.id, 0, vec![chunk("a", substore)])
            .await
            .unwrap();
        let dropped = catalog
            .insert_archive_file(JobId(2), store.id, 0, vec![chunk("b", substore)])
            .await
            .unwrap();
        catalog.invalidate_job(JobId(2), 1).await.unwrap();

        let rows = catalog
            .validate_archive_files(store.id, &[keep.id, dropped.id, ArchFileId(999)])
            .await
            .unwrap();
        let states: Vec<AfState> = rows.iter().map(|r| r.state).collect();
        assert_eq!(states, vec![AfState::Valid, AfState::Invalid, AfState::Unknown]);
    }

    #[tokio::test]
    async fn certain_truncate_fault_returns_empty_batch() {
        let catalog = InMemoryCatalog::new();
        let store = catalog.create_store(new_store("pool", 1)).await.unwrap();
        catalog.inject_af_diff_fault(AfDiffFault {
            probability: 1.0,
            mode: FaultMode::Truncate,
            seed: 7,
        });

        let rows = catalog
            .validate_archive_files(store.id, &[ArchFileId(1), ArchFileId(2)])
            .await
            .unwrap();
        assert!(rows.is_empty());
        assert_eq!(catalog.af_diff_faults(), 1);

        catalog.clear_af_diff_fault();
        let rows = catalog
            .validate_archive_files(store.id, &[ArchFileId(1)])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(catalog.af_diff_calls(), 2);
    }

    #[tokio::test]
    async fn error_fault_carries_catalog_diagnostic() {
        let catalog = InMemoryCatalog::new();
        let store = catalog.create_store(new_store("pool", 1)).await.unwrap();
        catalog.inject_af_diff_fault(AfDiffFault {
            probability: 1.0,
            mode: FaultMode::Error,
            seed: 1,
        });
        let err = catalog
            .validate_archive_files(store.id, &[ArchFileId(1)])
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Unable to get AFInfoList for SIDBStoreId [1] from MM. RetCode [-1]"
        );
    }

    #[tokio::test]
    async fn seeded_fault_sequence_is_reproducible() {
        async fn verdicts(seed: u64) -> Vec<bool> {
            let catalog = InMemoryCatalog::new();
            let store = catalog.create_store(new_store("pool", 1)).await.unwrap();
            catalog.inject_af_diff_fault(AfDiffFault {
                probability: 0.4,
                mode: FaultMode::Truncate,
                seed,
            });
            let mut out = Vec::new();
            for _ in 0..32 {
                let rows = catalog
                    .validate_archive_files(store.id, &[ArchFileId(1)])
                    .await
                    .unwrap();
                out.push(rows.is_empty());
            }
            out
        }

        assert_eq!(verdicts(42).await, verdicts(42).await);
    }

    #[tokio::test]
    async fn resync_ledger_rejects_out_of_sequence_attempts() {
        let catalog = InMemoryCatalog::new();
        let store = catalog.create_store(new_store("pool", 1)).await.unwrap();

        catalog
            .append_resync_history(resync_row(store.id, 1))
            .await
            .unwrap();
        assert!(catalog
            .append_resync_history(resync_row(store.id, 3))
            .await
            .is_err());
        catalog
            .append_resync_history(resync_row(store.id, 2))
            .await
            .unwrap();

        let mut done = resync_row(store.id, 2);
        done.status = ResyncStatus::Success;
        catalog.update_resync_history(done).await.unwrap();

        let latest = catalog.latest_resync_history(store.id).await.unwrap().unwrap();
        assert_eq!(latest.attempt_no, 2);
        assert_eq!(latest.status, ResyncStatus::Success);
        assert_eq!(catalog.resync_history(store.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn request_and_complete_resync_toggle_flag() {
        let catalog = InMemoryCatalog::new();
        let store = catalog.create_store(new_store("pool", 1)).await.unwrap();
        catalog
            .request_resync(
                store.id,
                ResyncRequest {
                    reason: MaintenanceReason::ArchiveFileValidation,
                    flags: ResyncFlags::PRUNE_INVALID_AFS,
                    requested_ms: 5,
                },
            )
            .await
            .unwrap();
        let flagged = catalog.store(store.id).await.unwrap().unwrap();
        assert!(flagged.flags.needs_auto_resync());
        assert!(flagged.resync_request.is_some());

        catalog.complete_resync(store.id, 99).await.unwrap();
        let done = catalog.store(store.id).await.unwrap().unwrap();
        assert!(!done.flags.needs_auto_resync());
        assert_eq!(done.last_resync_ms, Some(99));
    }

    #[tokio::test]
    async fn latest_usage_returns_most_recent_sample() {
        let catalog = InMemoryCatalog::new();
        let sample = |zero_ref, at| UsageSample {
            store_id: StoreId(1),
            substore_id: SubstoreId(1),
            primary_entries: 10,
            zero_ref_count: zero_ref,
            modified_ms: at,
        };
        catalog.record_usage(sample(5, 1)).await.unwrap();
        catalog.record_usage(sample(0, 2)).await.unwrap();
        let latest = catalog.latest_usage(SubstoreId(1)).await.unwrap().unwrap();
        assert_eq!(latest.zero_ref_count, 0);
        assert!(catalog.latest_usage(SubstoreId(2)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn usage_history_keeps_only_recent_samples() {
        let catalog = InMemoryCatalog::new();
        for at in 0..(USAGE_HISTORY_LEN as u64 + 25) {
            catalog
                .record_usage(UsageSample {
                    store_id: StoreId(1),
                    substore_id: SubstoreId(1),
                    primary_entries: 1,
                    zero_ref_count: 0,
                    modified_ms: at,
                })
                .await
                .unwrap();
        }
        let history = catalog.usage_history(SubstoreId(1));
        assert_eq!(history.len(), USAGE_HISTORY_LEN);
        assert_eq!(history[0].modified_ms, 25);
        let latest = catalog.latest_usage(SubstoreId(1)).await.unwrap().unwrap();
        assert_eq!(latest.modified_ms, USAGE_HISTORY_LEN as u64 + 24);
    }

    #[tokio::test]
    async fn invalidate_archive_files_queues_only_named_files() {
        let catalog = InMemoryCatalog::new();
        let store = catalog.create_store(new_store("pool", 1)).await.unwrap();
        let substore = catalog.substores(store.id).await.unwrap()[0].id;
        let first = catalog
            .insert_archive_file(JobId(1), store.id, 0, vec![chunk("a", substore)])
            .await
            .unwrap();
        let second = catalog
            .insert_archive_file(JobId(1), store.id, 0, vec![chunk("b", substore)])
            .await
            .unwrap();

        let done = catalog
            .invalidate_archive_files(&[first.id], 10)
            .await
            .unwrap();
        assert_eq!(done, vec![first.id]);
        assert!(catalog
            .invalidate_archive_files(&[first.id], 20)
            .await
            .unwrap()
            .is_empty());
        assert!(!catalog.archive_file(first.id).await.unwrap().unwrap().valid);
        assert!(catalog.archive_file(second.id).await.unwrap().unwrap().valid);
        assert_eq!(catalog.pending_delete_count(store.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn delete_store_removes_related_rows() {
        let catalog = InMemoryCatalog::new();
        let store = catalog.create_store(new_store("pool", 2)).await.unwrap();
        let substore = catalog.substores(store.id).await.unwrap()[0].id;
        catalog
            .insert_archive_file(JobId(1), store.id, 0, vec![chunk("a", substore)])
            .await
            .unwrap();

        assert!(catalog.delete_store(store.id).await.unwrap());
        assert!(catalog.substores(store.id).await.unwrap().is_empty());
        assert!(catalog.archive_files(store.id).await.unwrap().is_empty());
        assert!(!catalog.delete_store(store.id).await.unwrap());
    }
}
