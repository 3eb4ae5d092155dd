//! Chunk-to-partition routing performed by the distributor.

use ddb_core::hash::route_slot;
use ddb_core::{Signature, StoreId, Substore, SubstoreId};

use crate::error::{EngineError, EngineResult};

/// Routes chunk signatures onto a store's Online partitions.
///
/// Every partition owns a fixed slot in id order. When a slot's partition is
/// not Online, the chunk moves forward to the next Online slot, so routing
/// stays stable for the partitions that remain.
#[derive(Debug, Clone)]
pub struct ChunkRouter {
    distributor: SubstoreId,
    slots: Vec<(SubstoreId, bool)>,
}

impl ChunkRouter {
    /// Builds a router for the partitions of one store.
    ///
    /// # Errors
    ///
    /// Returns `NoPartitions` for an empty list and `StoreDegraded` if no
    /// partition is Online.
    pub fn new(
        store: StoreId,
        distributor: SubstoreId,
        substores: &[Substore],
    ) -> EngineResult<Self> {
        if substores.is_empty() {
            return Err(EngineError::NoPartitions);
        }
        let mut slots: Vec<(SubstoreId, bool)> =
            substores.iter().map(|s| (s.id, s.is_online())).collect();
        slots.sort_unstable_by_key(|(id, _)| *id);
        if !slots.iter().any(|(_, online)| *online) {
            return Err(EngineError::StoreDegraded { store });
        }
        Ok(Self { distributor, slots })
    }

    #[must_use]
    pub fn distributor(&self) -> SubstoreId {
        self.distributor
    }

    /// Partition that stores `signature`.
    #[must_use]
    pub fn route(&self, signature: &Signature) -> SubstoreId {
        let start = route_slot(signature, self.slots.len());
        (0..self.slots.len())
            .map(|step| self.slots[(start + step) % self.slots.len()])
            .find(|(_, online)| *online)
            .map_or(self.distributor, |(id, _)| id)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use ddb_core::{PartitionState, SubstoreExtendedFlags, SubstoreFlags};

    use super::*;

    fn partition(id: u64, state: PartitionState) -> Substore {
        Substore {
            id: SubstoreId(id),
            store_id: StoreId(1),
            path: format!("/ddb/p{id}"),
            media_agent: "ma1".to_string(),
            state,
            flags: SubstoreFlags::empty(),
            extended_flags: SubstoreExtendedFlags::empty(),
        }
    }

    fn signatures(n: u32) -> Vec<Signature> {
        (0..n).map(|i| Signature::of(&i.to_le_bytes())).collect()
    }

    #[test]
    fn spreads_chunks_over_every_online_partition() {
        let parts: Vec<Substore> = (1..=4).map(|i| partition(i, PartitionState::Online)).collect();
        let router = ChunkRouter::new(StoreId(1), SubstoreId(1), &parts).unwrap();

        let mut counts: BTreeMap<SubstoreId, usize> = BTreeMap::new();
        for sig in signatures(400) {
            *counts.entry(router.route(&sig)).or_default() += 1;
        }
        assert_eq!(counts.len(), 4);
    }

    #[test]
    fn offline_slot_moves_to_next_online_partition() {
        let all_online: Vec<Substore> =
            (1..=3).map(|i| partition(i, PartitionState::Online)).collect();
        let mut degraded = all_online.clone();
        degraded[1].state = PartitionState::Offline;

        let healthy = ChunkRouter::new(StoreId(1), SubstoreId(1), &all_online).unwrap();
        let routed = ChunkRouter::new(StoreId(1), SubstoreId(1), &degraded).unwrap();

        for sig in signatures(200) {
            let before = healthy.route(&sig);
            let after = routed.route(&sig);
            assert_ne!(after, SubstoreId(2));
            if before != SubstoreId(2) {
                assert_eq!(before, after);
            } else {
                assert_eq!(after, SubstoreId(3));
            }
        }
    }

    #[test]
    fn routing_ignores_input_order() {
        let parts: Vec<Substore> = (1..=4).map(|i| partition(i, PartitionState::Online)).collect();
        let mut reversed = parts.clone();
        reversed.reverse();
        let a = ChunkRouter::new(StoreId(1), SubstoreId(1), &parts).unwrap();
        let b = ChunkRouter::new(StoreId(1), SubstoreId(1), &reversed).unwrap();
        for sig in signatures(50) {
            assert_eq!(a.route(&sig), b.route(&sig));
        }
    }

    #[test]
    fn rejects_stores_without_online_partitions() {
        let parts = vec![partition(1, PartitionState::Offline)];
        let err = ChunkRouter::new(StoreId(1), SubstoreId(1), &parts).unwrap_err();
        assert!(matches!(err, EngineError::StoreDegraded { .. }));
        assert!(matches!(
            ChunkRouter::new(StoreId(1), SubstoreId(1), &[]).unwrap_err(),
            EngineError::NoPartitions
        ));
    }

    mod props {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            #[test]
            fn route_always_lands_on_an_online_partition(
                data in any::<Vec<u8>>(),
                online in proptest::collection::vec(any::<bool>(), 1..8),
            ) {
                prop_assume!(online.iter().any(|up| *up));
                let parts: Vec<Substore> = online
                    .iter()
                    .enumerate()
                    .map(|(i, up)| {
                        let state = if *up { PartitionState::Online } else { PartitionState::Offline };
                        partition(i as u64 + 1, state)
                    })
                    .collect();
                let router = ChunkRouter::new(StoreId(1), SubstoreId(1), &parts).unwrap();
                let target = router.route(&Signature::of(&data));
                let chosen = parts.iter().find(|p| p.id == target).unwrap();
                prop_assert!(chosen.is_online());
            }
        }
    }
}
