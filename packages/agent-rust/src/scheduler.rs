//! The maintenance scheduler.
//!
//! One [`MaintenanceScheduler`] runs per media agent. Every tick walks the
//! stores with partitions on this agent and, for each one and in order:
//!
//! 1. reconciles partition availability with the state of their paths
//! 2. starts missing index processes, then detects and repairs the distributor
//! 3. runs phase-2 catalog cleanup
//! 4. runs phase 3 on every Online partition
//! 5. records usage samples
//! 6. queues a controlled validation for stores past the age threshold
//! 7. runs a resync attempt for stores that need one
//! 8. reconstructs partitions marked for recovery
//!
//! A failure on one item is logged and counted; the tick moves on.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use ddb_core::{
    ArchFileId, DedupStore, MaintenanceReason, PartitionState, ReconstructionMode, ResyncFlags,
    ResyncHistoryEntry, ResyncRequest, StoreId, Substore, SubstoreId, DAY_MS,
};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::agent::MediaAgent;
use crate::config::AgentConfig;
use crate::error::{ContextExt, EngineError, ErrorKind, OperationContext, Phase};
use crate::partition::{ensure_distributor, mark_offline, mark_online};
use crate::process::IndexProcessHandle;
use crate::pruning::{
    mark_and_sweep_interval, record_usage, run_catalog_cleanup, run_phase3, sweep_due,
};
use crate::resync::ReconstructionReport;
use crate::shutdown::ShutdownController;

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Stores with at least one local partition.
    pub stores: u64,
    pub failures: u64,
    pub marked_offline: Vec<SubstoreId>,
    pub marked_online: Vec<SubstoreId>,
    /// Archive files removed from the catalog by phase 2.
    pub pruned_afs: Vec<ArchFileId>,
    pub swept: u64,
    pub drained: u64,
    /// Stores queued for validation because of their age.
    pub aged: Vec<StoreId>,
    pub resync_attempts: Vec<ResyncHistoryEntry>,
    pub reconstructions: Vec<ReconstructionReport>,
}

#[derive(Default)]
struct SchedulerState {
    /// Last mark-and-sweep per partition, first seen counts as swept.
    last_sweep_ms: HashMap<SubstoreId, u64>,
    last_age_check_ms: HashMap<StoreId, u64>,
    ticks: u64,
}

/// Periodic driver of pruning, resync and distributor health.
pub struct MaintenanceScheduler {
    agent: Arc<MediaAgent>,
    shutdown: Arc<ShutdownController>,
    state: Mutex<SchedulerState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MaintenanceScheduler {
    #[must_use]
    pub fn new(agent: Arc<MediaAgent>, shutdown: Arc<ShutdownController>) -> Self {
        Self {
            agent,
            shutdown,
            state: Mutex::new(SchedulerState::default()),
            task: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn agent(&self) -> &Arc<MediaAgent> {
        &self.agent
    }

    /// Ticks completed so far.
    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.state.lock().ticks
    }

    /// Spawns the periodic loop. The first tick runs immediately; the
    /// interval is re-read after every tick, so an override of
    /// `MM_CONFIG_PRUNE_PROCESS_INTERVAL_MINS` applies from the next wait.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        let scheduler = Arc::clone(self);
        let mut shutdown_rx = self.shutdown.shutdown_receiver();
        self.shutdown.set_running();
        *task = Some(tokio::spawn(async move {
            info!(media_agent = %scheduler.agent.name(), "maintenance scheduler started");
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                {
                    let _work = scheduler.shutdown.work_guard();
                    scheduler.tick_once().await;
                }
                let interval = scheduler.agent.config().current().pruning.prune_interval();
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    () = tokio::time::sleep(interval) => {}
                }
            }
            info!(media_agent = %scheduler.agent.name(), "maintenance scheduler stopped");
        }));
    }

    /// Stops the loop, waits up to `timeout` for a running tick, then stops
    /// the agent's index processes.
    ///
    /// Returns `false` if the running tick did not finish in time.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.shutdown.trigger_shutdown();
        let drained = self.shutdown.wait_for_drain(timeout).await;
        let task = self.task.lock().take();
        if let Some(task) = task {
            if drained {
                if let Err(err) = task.await {
                    error!("maintenance scheduler task failed: {err}");
                }
            } else {
                warn!("maintenance tick still running after {timeout:?}, aborting it");
                task.abort();
            }
        }
        self.agent.shutdown().await;
        drained
    }

    /// Runs one maintenance pass over every store with local partitions.
    pub async fn tick_once(&self) -> TickReport {
        let mut report = TickReport::default();
        let config = self.agent.config().current();
        let stores = match self.agent.stores().await {
            Ok(stores) => stores,
            Err(err) => {
                self.failure(&mut report, &err);
                return report;
            }
        };

        for store in stores {
            let local = match self.agent.local_substores(store.id).await {
                Ok(local) => local,
                Err(err) => {
                    self.failure(&mut report, &err);
                    continue;
                }
            };
            if local.is_empty() {
                continue;
            }
            report.stores += 1;
            self.maintain_store(store, local, &config, &mut report).await;
        }

        let ticks = {
            let mut state = self.state.lock();
            state.ticks += 1;
            state.ticks
        };
        metrics::counter!("ddb_scheduler_ticks_total").increment(1);
        debug!(
            tick = ticks,
            stores = report.stores,
            failures = report.failures,
            pruned = report.pruned_afs.len(),
            drained = report.drained,
            "maintenance tick finished"
        );
        report
    }

    async fn maintain_store(
        &self,
        store: DedupStore,
        local: Vec<Substore>,
        config: &AgentConfig,
        report: &mut TickReport,
    ) {
        let agent = self.agent.as_ref();
        let now = agent.now_ms();

        self.reconcile_health(&local, report).await;
        let local = match agent.local_substores(store.id).await {
            Ok(local) => local,
            Err(err) => {
                self.failure(report, &err);
                return;
            }
        };

        let mut handles: BTreeMap<SubstoreId, Arc<IndexProcessHandle>> = BTreeMap::new();
        for substore in local.iter().filter(|s| s.is_online()) {
            match agent.ensure_index(substore).await {
                Ok(handle) => {
                    handles.insert(substore.id, handle);
                }
                Err(err) => self.failure(report, &err),
            }
        }

        // Pruning only proceeds once the store has exactly one distributor.
        match ensure_distributor(agent.catalog(), store.id).await {
            Ok(check) => {
                debug!(store_id = %store.id, distributor = %check.distributor(), "distributor ok");
                self.prune(&store, &local, &handles, config, now, report).await;
            }
            Err(err) => self.failure(report, &err),
        }

        for substore in local.iter().filter(|s| s.is_online()) {
            if let Some(handle) = handles.get(&substore.id) {
                if let Err(err) = record_usage(agent.catalog(), handle, substore, now).await {
                    self.failure(report, &err);
                }
            }
        }

        self.check_age(&store, config, now, report).await;
        self.resync_if_needed(store.id, report).await;
        if config.resync.auto_reconstruct_marked_offline {
            self.reconstruct_marked(&local, report).await;
        }
    }

    /// Takes partitions with lost paths Offline and brings recovered ones back.
    async fn reconcile_health(&self, local: &[Substore], report: &mut TickReport) {
        let agent = self.agent.as_ref();
        let factory = agent.processes().factory();
        for substore in local {
            let accessible = factory.path_accessible(&substore.path);
            match substore.state {
                PartitionState::Online if !accessible => {
                    warn!(
                        store_id = %substore.store_id,
                        substore_id = %substore.id,
                        path = %substore.path,
                        "partition path is not accessible"
                    );
                    match mark_offline(agent.catalog(), agent.processes(), substore).await {
                        Ok(()) => report.marked_offline.push(substore.id),
                        Err(err) => self.failure(report, &err),
                    }
                }
                PartitionState::Offline if accessible => {
                    match mark_online(agent.catalog(), substore).await {
                        Ok(()) => report.marked_online.push(substore.id),
                        Err(err) => self.failure(report, &err),
                    }
                }
                _ => {}
            }
        }
    }

    async fn prune(
        &self,
        store: &DedupStore,
        local: &[Substore],
        handles: &BTreeMap<SubstoreId, Arc<IndexProcessHandle>>,
        config: &AgentConfig,
        now: u64,
        report: &mut TickReport,
    ) {
        let catalog = self.agent.catalog();
        if store.flags.is_pruning_enabled() {
            match run_catalog_cleanup(catalog, store.id, handles, now).await {
                Ok(cleanup) => report.pruned_afs.extend(cleanup.pruned),
                Err(err) => self.failure(report, &err),
            }
        }

        let interval = mark_and_sweep_interval(store, &config.pruning);
        for substore in local.iter().filter(|s| s.is_online()) {
            let Some(handle) = handles.get(&substore.id) else {
                continue;
            };
            let last = *self
                .state
                .lock()
                .last_sweep_ms
                .entry(substore.id)
                .or_insert(now);
            let due = sweep_due(last, interval, now);
            match run_phase3(handle, store, substore, &config.pruning, due, now).await {
                Ok(phase3) => {
                    report.drained += phase3.drained;
                    if let Some(sweep) = phase3.sweep {
                        report.swept += sweep.swept;
                        self.state.lock().last_sweep_ms.insert(substore.id, now);
                    }
                }
                Err(err) => self.failure(report, &err),
            }
        }
    }

    /// Queues a controlled validation once a store has gone too long
    /// without one. Evaluated once per maintenance interval per store.
    async fn check_age(
        &self,
        store: &DedupStore,
        config: &AgentConfig,
        now: u64,
        report: &mut TickReport,
    ) {
        {
            let mut state = self.state.lock();
            let interval_ms =
                u64::try_from(config.pruning.maintenance_interval().as_millis()).unwrap_or(u64::MAX);
            if let Some(last) = state.last_age_check_ms.get(&store.id) {
                if now.saturating_sub(*last) < interval_ms {
                    return;
                }
            }
            state.last_age_check_ms.insert(store.id, now);
        }

        let threshold = config.resync.resync_age_threshold_days.saturating_mul(DAY_MS);
        let validated_recently = store
            .last_resync_ms
            .is_some_and(|at| now.saturating_sub(at) <= threshold);
        if store.flags.needs_auto_resync() || validated_recently || store.age_ms(now) <= threshold {
            return;
        }
        info!(
            store_id = %store.id,
            age_days = store.age_ms(now) / DAY_MS,
            "store exceeded the validation age threshold"
        );
        let request = ResyncRequest {
            reason: MaintenanceReason::ControlledValidation,
            flags: ResyncFlags::SCHEDULED,
            requested_ms: now,
        };
        match self
            .agent
            .catalog()
            .request_resync(store.id, request)
            .await
            .catalog_ctx(OperationContext::new(Phase::Resync).store(store.id))
        {
            Ok(()) => report.aged.push(store.id),
            Err(err) => self.failure(report, &err),
        }
    }

    async fn resync_if_needed(&self, store: StoreId, report: &mut TickReport) {
        let row = match self.agent.store(store).await {
            Ok(row) => row,
            Err(err) => {
                self.failure(report, &err);
                return;
            }
        };
        if !row.flags.needs_auto_resync() || row.flags.is_resync_in_progress() {
            return;
        }
        match self.agent.run_resync(store).await {
            Ok(entry) => report.resync_attempts.push(entry),
            Err(err) => self.failure(report, &err),
        }
    }

    async fn reconstruct_marked(&self, local: &[Substore], report: &mut TickReport) {
        let factory = self.agent.processes().factory();
        for substore in local
            .iter()
            .filter(|s| s.state == PartitionState::MarkedOffline)
        {
            if !factory.path_accessible(&substore.path) {
                continue;
            }
            match self
                .agent
                .run_reconstruction(substore.store_id, substore.id, ReconstructionMode::Regular)
                .await
            {
                Ok(done) => report.reconstructions.push(done),
                Err(err) => self.failure(report, &err),
            }
        }
    }

    fn failure(&self, report: &mut TickReport, err: &EngineError) {
        report.failures += 1;
        metrics::counter!("ddb_scheduler_item_failures_total").increment(1);
        match err.kind() {
            ErrorKind::Consistency | ErrorKind::Internal => {
                error!(media_agent = %self.agent.name(), "maintenance item failed: {err}");
            }
            ErrorKind::Timeout | ErrorKind::Precondition | ErrorKind::Degraded => {
                warn!(media_agent = %self.agent.name(), "maintenance item skipped: {err}");
            }
        }
    }
}

impl std::fmt::Debug for MaintenanceScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaintenanceScheduler")
            .field("agent", &self.agent.name())
            .field("ticks", &self.ticks())
            .finish_non_exhaustive()
    }
}
