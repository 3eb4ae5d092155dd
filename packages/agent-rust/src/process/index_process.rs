//! The per-partition index process.
//!
//! Each online partition hosted by this agent runs one [`IndexRunnable`]
//! inside a [`BackgroundWorker`]. All access to a partition's index goes
//! through its task channel, so index mutations are serialized. On every
//! tick the process probes its partition path and terminates itself once
//! the path is gone.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use ddb_core::{ArchFileId, Signature, StoreId, SubstoreId};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::worker::{BackgroundRunnable, BackgroundWorker};
use crate::chunk_store::ChunkStore;
use crate::index::{
    FetchResult, IndexFactory, IndexStats, IterationCursor, PartitionIndex, SweepReport,
};

pub type Reply<T> = oneshot::Sender<anyhow::Result<T>>;

/// An archive file's chunks as routed to one partition.
#[derive(Debug, Clone)]
pub struct RoutedArchiveFile {
    pub arch_file: ArchFileId,
    pub chunks: Vec<(Signature, u64)>,
}

/// Index contents to restore during reconstruction.
#[derive(Debug, Clone, Default)]
pub struct RebuildPlan {
    /// Drop every table before restoring. Chunk bytes no restored file
    /// references are then indexed as zero-ref.
    pub clear: bool,
    pub archive_files: Vec<RoutedArchiveFile>,
    /// Timestamp given to zero-ref records written by a clearing rebuild.
    pub now_ms: u64,
}

/// Result of an ingest on one partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestOutcome {
    pub references: u64,
    pub new_primaries: u64,
    pub chunks_written: u64,
}

// ---------------------------------------------------------------------------
// IndexTask
// ---------------------------------------------------------------------------

/// Requests served by an index process.
pub enum IndexTask {
    Ingest {
        arch_file: ArchFileId,
        chunks: Vec<(Signature, Bytes)>,
        reply: Reply<IngestOutcome>,
    },
    DropArchiveFiles {
        ids: Vec<ArchFileId>,
        reply: Reply<u64>,
    },
    MarkAndSweep {
        now_ms: u64,
        reply: Reply<SweepReport>,
    },
    DrainZeroRef {
        limit: usize,
        reply: Reply<u64>,
    },
    Stats {
        reply: Reply<IndexStats>,
    },
    ListArchiveFiles {
        cursor: IterationCursor,
        size: usize,
        reply: Reply<FetchResult<ArchFileId>>,
    },
    Rebuild {
        plan: RebuildPlan,
        reply: Reply<u64>,
    },
}

// ---------------------------------------------------------------------------
// IndexRunnable
// ---------------------------------------------------------------------------

/// Serves [`IndexTask`]s for one partition.
pub struct IndexRunnable {
    store: StoreId,
    substore: SubstoreId,
    path: String,
    index: PartitionIndex,
    chunks: Arc<dyn ChunkStore>,
    factory: Arc<dyn IndexFactory>,
}

impl IndexRunnable {
    #[must_use]
    pub fn new(
        store: StoreId,
        substore: SubstoreId,
        path: String,
        index: PartitionIndex,
        chunks: Arc<dyn ChunkStore>,
        factory: Arc<dyn IndexFactory>,
    ) -> Self {
        Self {
            store,
            substore,
            path,
            index,
            chunks,
            factory,
        }
    }

    async fn ingest(
        &self,
        arch_file: ArchFileId,
        chunks: Vec<(Signature, Bytes)>,
    ) -> anyhow::Result<IngestOutcome> {
        // Bytes land before the index references them.
        let mut written = 0;
        for (signature, data) in &chunks {
            if !self.chunks.contains(self.store, self.substore, signature).await? {
                self.chunks
                    .put(self.store, self.substore, *signature, data.clone())
                    .await?;
                written += 1;
            }
        }
        let refs: Vec<(Signature, u64)> = chunks
            .iter()
            .map(|(signature, data)| (*signature, data.len() as u64))
            .collect();
        let added = self.index.add_archive_file(arch_file, &refs)?;
        Ok(IngestOutcome {
            references: added.references,
            new_primaries: added.new_primaries,
            chunks_written: written,
        })
    }

    fn drop_archive_files(&self, ids: &[ArchFileId]) -> anyhow::Result<u64> {
        let mut dropped = 0;
        for id in ids {
            if self.index.drop_archive_file(*id)? > 0 {
                dropped += 1;
            }
        }
        Ok(dropped)
    }

    async fn drain_zero_ref(&self, limit: usize) -> anyhow::Result<u64> {
        let batch = self.index.zero_ref_batch(limit)?;
        if batch.is_empty() {
            return Ok(0);
        }
        info!(
            store = %self.store,
            partition = %self.substore,
            entries = batch.len(),
            "Finalizing SI entries in chunk"
        );
        for signature in &batch {
            self.chunks.delete(self.store, self.substore, signature).await?;
        }
        self.index.forget_zero_ref(&batch)?;
        Ok(batch.len() as u64)
    }

    async fn rebuild(&self, plan: RebuildPlan) -> anyhow::Result<u64> {
        if plan.clear {
            self.index.clear()?;
        }
        let mut restored = 0;
        for file in plan.archive_files {
            if !self.index.add_archive_file(file.arch_file, &file.chunks)?.already_present {
                restored += 1;
            }
        }
        if plan.clear {
            let stored = self.chunks.list_partition(self.store, self.substore).await?;
            let adopted = self.index.adopt_unreferenced(&stored, plan.now_ms)?;
            if adopted > 0 {
                info!(
                    store = %self.store,
                    partition = %self.substore,
                    adopted,
                    "unreferenced chunks queued for reclamation after rebuild"
                );
            }
        }
        Ok(restored)
    }
}

#[async_trait]
impl BackgroundRunnable for IndexRunnable {
    type Task = IndexTask;

    async fn run(&mut self, task: IndexTask) {
        match task {
            IndexTask::Ingest {
                arch_file,
                chunks,
                reply,
            } => {
                let _ = reply.send(self.ingest(arch_file, chunks).await);
            }
            IndexTask::DropArchiveFiles { ids, reply } => {
                let _ = reply.send(self.drop_archive_files(&ids));
            }
            IndexTask::MarkAndSweep { now_ms, reply } => {
                let result = self.index.mark_and_sweep(now_ms);
                if let Ok(report) = &result {
                    debug!(partition = %self.substore, ?report, "mark and sweep finished");
                }
                let _ = reply.send(result);
            }
            IndexTask::DrainZeroRef { limit, reply } => {
                let _ = reply.send(self.drain_zero_ref(limit).await);
            }
            IndexTask::Stats { reply } => {
                let _ = reply.send(self.index.stats());
            }
            IndexTask::ListArchiveFiles {
                cursor,
                size,
                reply,
            } => {
                let _ = reply.send(self.index.list_archive_files(&cursor, size));
            }
            IndexTask::Rebuild { plan, reply } => {
                let _ = reply.send(self.rebuild(plan).await);
            }
        }
    }

    async fn on_tick(&mut self) -> ControlFlow<()> {
        if self.factory.path_accessible(&self.path) {
            ControlFlow::Continue(())
        } else {
            warn!(
                store = %self.store,
                partition = %self.substore,
                path = %self.path,
                "index path is no longer accessible, terminating index process"
            );
            ControlFlow::Break(())
        }
    }

    async fn shutdown(&mut self) {
        info!(partition = %self.substore, "index process stopped");
    }
}

// ---------------------------------------------------------------------------
// IndexProcessHandle
// ---------------------------------------------------------------------------

/// Client side of a running index process.
pub struct IndexProcessHandle {
    store: StoreId,
    substore: SubstoreId,
    worker: BackgroundWorker<IndexRunnable>,
}

impl std::fmt::Debug for IndexProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexProcessHandle")
            .field("store", &self.store)
            .field("substore", &self.substore)
            .finish_non_exhaustive()
    }
}

impl IndexProcessHandle {
    /// Spawns the process loop for `runnable`.
    #[must_use]
    pub fn spawn(runnable: IndexRunnable, probe_interval: Duration, capacity: usize) -> Self {
        let store = runnable.store;
        let substore = runnable.substore;
        Self {
            store,
            substore,
            worker: BackgroundWorker::start(runnable, probe_interval, capacity),
        }
    }

    #[must_use]
    pub fn store(&self) -> StoreId {
        self.store
    }

    #[must_use]
    pub fn substore(&self) -> SubstoreId {
        self.substore
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    pub fn request_stop(&self) {
        self.worker.request_stop();
    }

    pub async fn stop(&self) {
        self.worker.stop().await;
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> IndexTask) -> anyhow::Result<T> {
        let (tx, rx) = oneshot::channel();
        self.worker.submit(make(tx)).await?;
        rx.await
            .map_err(|_| anyhow::anyhow!("index process for partition {} exited", self.substore))?
    }

    /// # Errors
    ///
    /// Returns an error if the process is down or the write fails.
    pub async fn ingest(
        &self,
        arch_file: ArchFileId,
        chunks: Vec<(Signature, Bytes)>,
    ) -> anyhow::Result<IngestOutcome> {
        self.request(|reply| IndexTask::Ingest {
            arch_file,
            chunks,
            reply,
        })
        .await
    }

    /// Drops archive files; returns how many were registered.
    ///
    /// # Errors
    ///
    /// Returns an error if the process is down or the index fails.
    pub async fn drop_archive_files(&self, ids: Vec<ArchFileId>) -> anyhow::Result<u64> {
        self.request(|reply| IndexTask::DropArchiveFiles { ids, reply })
            .await
    }

    /// # Errors
    ///
    /// Returns an error if the process is down or the index fails.
    pub async fn mark_and_sweep(&self, now_ms: u64) -> anyhow::Result<SweepReport> {
        self.request(|reply| IndexTask::MarkAndSweep { now_ms, reply })
            .await
    }

    /// Reclaims up to `limit` zero-reference signatures; returns how many.
    ///
    /// # Errors
    ///
    /// Returns an error if the process is down, the index fails or a chunk
    /// cannot be deleted.
    pub async fn drain_zero_ref(&self, limit: usize) -> anyhow::Result<u64> {
        self.request(|reply| IndexTask::DrainZeroRef { limit, reply })
            .await
    }

    /// # Errors
    ///
    /// Returns an error if the process is down or the index fails.
    pub async fn stats(&self) -> anyhow::Result<IndexStats> {
        self.request(|reply| IndexTask::Stats { reply }).await
    }

    /// # Errors
    ///
    /// Returns an error if the process is down or the index fails.
    pub async fn list_archive_files(
        &self,
        cursor: IterationCursor,
        size: usize,
    ) -> anyhow::Result<FetchResult<ArchFileId>> {
        self.request(|reply| IndexTask::ListArchiveFiles {
            cursor,
            size,
            reply,
        })
        .await
    }

    /// Every archive file registered on the partition.
    ///
    /// # Errors
    ///
    /// Returns an error if the process is down or the index fails.
    pub async fn all_archive_files(&self) -> anyhow::Result<Vec<ArchFileId>> {
        let mut ids = Vec::new();
        let mut cursor = IterationCursor::start();
        while !cursor.finished {
            let page = self.list_archive_files(cursor, 1024).await?;
            ids.extend(page.items);
            cursor = page.next_cursor;
        }
        Ok(ids)
    }

    /// Restores index contents; returns how many archive files were added.
    ///
    /// # Errors
    ///
    /// Returns an error if the process is down or the index fails.
    pub async fn rebuild(&self, plan: RebuildPlan) -> anyhow::Result<u64> {
        self.request(|reply| IndexTask::Rebuild { plan, reply }).await
    }
}
