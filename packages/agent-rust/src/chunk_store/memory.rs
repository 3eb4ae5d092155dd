//! In-memory [`ChunkStore`] backed by [`DashMap`].

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use ddb_core::{Signature, StoreId, SubstoreId};

use super::ChunkStore;

type ChunkKey = (StoreId, SubstoreId, Signature);

/// Chunk bytes held in a concurrent map.
///
/// `Bytes` clones are reference-counted, so reads never copy chunk data.
pub struct MemoryChunkStore {
    chunks: DashMap<ChunkKey, Bytes>,
}

impl MemoryChunkStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            chunks: DashMap::new(),
        }
    }

    /// Total bytes held across all stores.
    #[must_use]
    pub fn stored_bytes(&self) -> u64 {
        self.chunks.iter().map(|entry| entry.value().len() as u64).sum()
    }
}

impl Default for MemoryChunkStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChunkStore for MemoryChunkStore {
    async fn put(
        &self,
        store: StoreId,
        substore: SubstoreId,
        signature: Signature,
        data: Bytes,
    ) -> anyhow::Result<()> {
        self.chunks.entry((store, substore, signature)).or_insert(data);
        Ok(())
    }

    async fn get(
        &self,
        store: StoreId,
        substore: SubstoreId,
        signature: &Signature,
    ) -> anyhow::Result<Option<Bytes>> {
        Ok(self
            .chunks
            .get(&(store, substore, *signature))
            .map(|entry| entry.value().clone()))
    }

    async fn contains(
        &self,
        store: StoreId,
        substore: SubstoreId,
        signature: &Signature,
    ) -> anyhow::Result<bool> {
        Ok(self.chunks.contains_key(&(store, substore, *signature)))
    }

    async fn delete(
        &self,
        store: StoreId,
        substore: SubstoreId,
        signature: &Signature,
    ) -> anyhow::Result<bool> {
        Ok(self.chunks.remove(&(store, substore, *signature)).is_some())
    }

    async fn list_partition(
        &self,
        store: StoreId,
        substore: SubstoreId,
    ) -> anyhow::Result<Vec<(Signature, u64)>> {
        Ok(self
            .chunks
            .iter()
            .filter(|entry| entry.key().0 == store && entry.key().1 == substore)
            .map(|entry| (entry.key().2, entry.value().len() as u64))
            .collect())
    }

    async fn chunk_count(&self, store: StoreId) -> anyhow::Result<u64> {
        Ok(self.chunks.iter().filter(|entry| entry.key().0 == store).count() as u64)
    }

    async fn purge_store(&self, store: StoreId) -> anyhow::Result<u64> {
        let before = self.chunks.len();
        self.chunks.retain(|(owner, _, _), _| *owner != store);
        Ok((before - self.chunks.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const P1: SubstoreId = SubstoreId(1);
    const P2: SubstoreId = SubstoreId(2);

    #[tokio::test]
    async fn put_is_first_writer_wins() {
        let chunks = MemoryChunkStore::new();
        let sig = Signature::of(b"abc");
        chunks.put(StoreId(1), P1, sig, Bytes::from_static(b"abc")).await.unwrap();
        chunks.put(StoreId(1), P1, sig, Bytes::from_static(b"zzz")).await.unwrap();

        let got = chunks.get(StoreId(1), P1, &sig).await.unwrap().unwrap();
        assert_eq!(&got[..], b"abc");
        assert_eq!(chunks.chunk_count(StoreId(1)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn stores_are_isolated() {
        let chunks = MemoryChunkStore::new();
        let sig = Signature::of(b"shared");
        chunks.put(StoreId(1), P1, sig, Bytes::from_static(b"shared")).await.unwrap();

        assert!(!chunks.contains(StoreId(2), P1, &sig).await.unwrap());
        assert!(!chunks.delete(StoreId(2), P1, &sig).await.unwrap());
        assert!(chunks.delete(StoreId(1), P1, &sig).await.unwrap());
        assert!(chunks.get(StoreId(1), P1, &sig).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn partitions_hold_their_own_copy() {
        let chunks = MemoryChunkStore::new();
        let data = Bytes::from_static(b"rerouted");
        let sig = Signature::of(&data);
        chunks.put(StoreId(1), P1, sig, data.clone()).await.unwrap();
        chunks.put(StoreId(1), P2, sig, data).await.unwrap();

        assert!(chunks.delete(StoreId(1), P1, &sig).await.unwrap());
        assert!(chunks.contains(StoreId(1), P2, &sig).await.unwrap());
        assert_eq!(chunks.chunk_count(StoreId(1)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn list_partition_reports_one_partition() {
        let chunks = MemoryChunkStore::new();
        let data = Bytes::from_static(b"abc");
        let sig = Signature::of(&data);
        chunks.put(StoreId(1), P1, sig, data.clone()).await.unwrap();
        let other = Bytes::from_static(b"x");
        chunks
            .put(StoreId(1), P2, Signature::of(&other), other)
            .await
            .unwrap();
        chunks.put(StoreId(2), P1, sig, data).await.unwrap();

        assert_eq!(
            chunks.list_partition(StoreId(1), P1).await.unwrap(),
            vec![(sig, 3)]
        );
        assert!(chunks.list_partition(StoreId(3), P1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn purge_store_only_touches_one_store() {
        let chunks = MemoryChunkStore::new();
        for i in 0..3u8 {
            let data = Bytes::from(vec![i; 4]);
            chunks
                .put(StoreId(1), P1, Signature::of(&data), data.clone())
                .await
                .unwrap();
            chunks.put(StoreId(2), P2, Signature::of(&data), data).await.unwrap();
        }
        assert_eq!(chunks.purge_store(StoreId(1)).await.unwrap(), 3);
        assert_eq!(chunks.chunk_count(StoreId(2)).await.unwrap(), 3);
        assert_eq!(chunks.stored_bytes(), 12);
    }
}
