//! Content-addressed chunk storage.
//!
//! Defines [`ChunkStore`], the durable home of chunk bytes. The engine writes
//! a chunk the first time a partition indexes its signature and deletes it
//! when phase 3 reclaims the signature; otherwise it only manipulates
//! catalog and index metadata. Bytes belong to the partition that indexes
//! them, so a signature routed to two partitions across a failover is held
//! (and reclaimed) independently by each.

pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use ddb_core::{Signature, StoreId, SubstoreId};

pub use memory::MemoryChunkStore;

/// Durable chunk bytes keyed by store, partition and signature.
///
/// Used as `Arc<dyn ChunkStore>`.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Stores `data` under `signature`. Writing an existing chunk is a no-op.
    async fn put(
        &self,
        store: StoreId,
        substore: SubstoreId,
        signature: Signature,
        data: Bytes,
    ) -> anyhow::Result<()>;

    /// Loads a chunk, or `None` if it was never written or has been deleted.
    async fn get(
        &self,
        store: StoreId,
        substore: SubstoreId,
        signature: &Signature,
    ) -> anyhow::Result<Option<Bytes>>;

    async fn contains(
        &self,
        store: StoreId,
        substore: SubstoreId,
        signature: &Signature,
    ) -> anyhow::Result<bool>;

    /// Physically deletes a chunk. Returns `false` if it was absent.
    async fn delete(
        &self,
        store: StoreId,
        substore: SubstoreId,
        signature: &Signature,
    ) -> anyhow::Result<bool>;

    /// Signatures and sizes of the chunks one partition holds.
    async fn list_partition(
        &self,
        store: StoreId,
        substore: SubstoreId,
    ) -> anyhow::Result<Vec<(Signature, u64)>>;

    /// Number of chunks held across every partition of a store.
    async fn chunk_count(&self, store: StoreId) -> anyhow::Result<u64>;

    /// Deletes every chunk of a store.
    async fn purge_store(&self, store: StoreId) -> anyhow::Result<u64>;
}
