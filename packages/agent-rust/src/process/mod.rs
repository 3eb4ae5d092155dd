//! Index process management.
//!
//! [`IndexProcesses`] owns the index process of every partition this agent
//! hosts. Processes are started on demand, stop on request or when their
//! path disappears, and are always waited on with a bounded budget.

pub mod index_process;
pub mod worker;

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ddb_core::{Substore, SubstoreId};
use tracing::{error, info};

use crate::chunk_store::ChunkStore;
use crate::config::ConfigHandle;
use crate::error::{ContextExt, EngineError, EngineResult, OperationContext, Phase};
use crate::index::{IndexFactory, PartitionIndex};
use crate::wait::poll_until;

pub use index_process::{
    IndexProcessHandle, IndexRunnable, IndexTask, IngestOutcome, RebuildPlan, RoutedArchiveFile,
};
pub use worker::{BackgroundRunnable, BackgroundWorker};

/// Table of index processes keyed by partition.
pub struct IndexProcesses {
    factory: Arc<dyn IndexFactory>,
    chunks: Arc<dyn ChunkStore>,
    config: Arc<ConfigHandle>,
    processes: DashMap<SubstoreId, Arc<IndexProcessHandle>>,
}

impl IndexProcesses {
    #[must_use]
    pub fn new(
        factory: Arc<dyn IndexFactory>,
        chunks: Arc<dyn ChunkStore>,
        config: Arc<ConfigHandle>,
    ) -> Self {
        Self {
            factory,
            chunks,
            config,
            processes: DashMap::new(),
        }
    }

    #[must_use]
    pub fn factory(&self) -> &Arc<dyn IndexFactory> {
        &self.factory
    }

    /// Handle of the partition's process, if it is running.
    #[must_use]
    pub fn handle(&self, substore: SubstoreId) -> Option<Arc<IndexProcessHandle>> {
        self.processes
            .get(&substore)
            .filter(|handle| handle.is_running())
            .map(|handle| Arc::clone(&handle))
    }

    #[must_use]
    pub fn is_running(&self, substore: SubstoreId) -> bool {
        self.handle(substore).is_some()
    }

    /// Partitions whose process is currently running.
    #[must_use]
    pub fn running(&self) -> Vec<SubstoreId> {
        let mut ids: Vec<SubstoreId> = self
            .processes
            .iter()
            .filter(|entry| entry.value().is_running())
            .map(|entry| *entry.key())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Starts the partition's index process unless it is already running.
    ///
    /// Returns the handle and whether a new process was started.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::PathInaccessible` if the partition path cannot
    /// be reached, or an index error if the engine cannot be opened.
    pub fn ensure_running(
        &self,
        substore: &Substore,
    ) -> EngineResult<(Arc<IndexProcessHandle>, bool)> {
        let ctx = OperationContext::new(Phase::Health)
            .store(substore.store_id)
            .partition(substore.id);
        match self.processes.entry(substore.id) {
            Entry::Occupied(entry) if entry.get().is_running() => {
                Ok((Arc::clone(entry.get()), false))
            }
            entry => {
                if !self.factory.path_accessible(&substore.path) {
                    return Err(EngineError::PathInaccessible {
                        path: substore.path.clone(),
                    });
                }
                let engine = self.factory.open(&substore.path).index_ctx(ctx)?;
                let config = self.config.current();
                let index_config = &config.index;
                let runnable = IndexRunnable::new(
                    substore.store_id,
                    substore.id,
                    substore.path.clone(),
                    PartitionIndex::new(engine),
                    Arc::clone(&self.chunks),
                    Arc::clone(&self.factory),
                );
                let handle = Arc::new(IndexProcessHandle::spawn(
                    runnable,
                    index_config.path_probe_interval(),
                    index_config.task_channel_capacity,
                ));
                match entry {
                    Entry::Occupied(mut occupied) => {
                        occupied.insert(Arc::clone(&handle));
                    }
                    Entry::Vacant(vacant) => {
                        vacant.insert(Arc::clone(&handle));
                    }
                }
                info!(
                    store = %substore.store_id,
                    partition = %substore.id,
                    path = %substore.path,
                    "index process started"
                );
                Ok((handle, true))
            }
        }
    }

    /// Asks the partition's process to stop without waiting.
    pub fn request_stop(&self, substore: SubstoreId) {
        if let Some(handle) = self.processes.get(&substore) {
            handle.request_stop();
        }
    }

    /// Waits until the partition's process has exited.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::WaitTimeout` if the process is still alive once
    /// the shutdown budget is spent.
    pub async fn wait_till_down(&self, substore: SubstoreId) -> EngineResult<()> {
        let budget = self.config.current().waits.index_shutdown();
        let what = format!("index process of partition {substore} to stop");
        let result = poll_until(&what, budget, || async {
            Ok::<_, EngineError>((!self.is_running(substore)).then_some(()))
        })
        .await;
        match result {
            Ok(()) => {
                self.processes.remove(&substore);
                Ok(())
            }
            Err(err) => {
                error!(partition = %substore, "index process did not stop: {err}");
                Err(err)
            }
        }
    }

    /// Stops every process and waits for each to exit.
    pub async fn stop_all(&self) {
        let handles: Vec<Arc<IndexProcessHandle>> = self
            .processes
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for handle in handles {
            handle.stop().await;
        }
        self.processes.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use ddb_core::{PartitionState, StoreId, SubstoreExtendedFlags, SubstoreFlags};

    use super::*;
    use crate::chunk_store::MemoryChunkStore;
    use crate::config::AgentConfig;
    use crate::index::MemoryIndexFactory;

    fn substore(id: u64, path: &str) -> Substore {
        Substore {
            id: SubstoreId(id),
            store_id: StoreId(1),
            path: path.to_string(),
            media_agent: "ma1".to_string(),
            state: PartitionState::Online,
            flags: SubstoreFlags::empty(),
            extended_flags: SubstoreExtendedFlags::empty(),
        }
    }

    fn processes() -> (Arc<MemoryIndexFactory>, IndexProcesses) {
        let factory = Arc::new(MemoryIndexFactory::new());
        let processes = IndexProcesses::new(
            factory.clone(),
            Arc::new(MemoryChunkStore::new()),
            Arc::new(ConfigHandle::new(AgentConfig::default())),
        );
        (factory, processes)
    }

    #[tokio::test]
    async fn ensure_running_starts_once() {
        let (_factory, processes) = processes();
        let partition = substore(1, "/p1");

        let (_, started) = processes.ensure_running(&partition).unwrap();
        assert!(started);
        let (_, started_again) = processes.ensure_running(&partition).unwrap();
        assert!(!started_again);
        assert_eq!(processes.running(), vec![SubstoreId(1)]);

        processes.stop_all().await;
        assert!(processes.running().is_empty());
    }

    #[tokio::test]
    async fn inaccessible_path_refuses_to_start() {
        let (factory, processes) = processes();
        factory.set_path_available("/p1", false);

        let err = processes.ensure_running(&substore(1, "/p1")).unwrap_err();
        assert!(matches!(err, EngineError::PathInaccessible { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn request_stop_then_wait_till_down() {
        let (_factory, processes) = processes();
        processes.ensure_running(&substore(1, "/p1")).unwrap();

        processes.request_stop(SubstoreId(1));
        processes.wait_till_down(SubstoreId(1)).await.unwrap();
        assert!(!processes.is_running(SubstoreId(1)));
        assert!(processes.handle(SubstoreId(1)).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn restart_after_path_loss_sees_same_index() {
        let (factory, processes) = processes();
        let partition = substore(1, "/p1");
        let (handle, _) = processes.ensure_running(&partition).unwrap();
        handle
            .ingest(
                ddb_core::ArchFileId(1),
                vec![(ddb_core::Signature::of(b"x"), bytes::Bytes::from_static(b"x"))],
            )
            .await
            .unwrap();

        factory.set_path_available("/p1", false);
        processes.wait_till_down(SubstoreId(1)).await.unwrap();

        factory.set_path_available("/p1", true);
        let (handle, started) = processes.ensure_running(&partition).unwrap();
        assert!(started);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(handle.stats().await.unwrap().archive_files, 1);
    }
}
