//! In-memory [`IndexEngine`] implementation backed by ordered maps.
//!
//! Suitable for tests and for agents whose partitions are rebuilt from the
//! catalog on restart.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::index::engine::{
    advance_cursor, decode_cursor_offset, BatchOp, FetchResult, IndexEngine, IndexTable,
    IterationCursor,
};

type Table = BTreeMap<Vec<u8>, Vec<u8>>;

/// In-memory index engine: one `BTreeMap` per [`IndexTable`].
pub struct MemoryIndexEngine {
    tables: RwLock<[Table; 3]>,
}

impl MemoryIndexEngine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tables: RwLock::new([Table::new(), Table::new(), Table::new()]),
        }
    }
}

impl Default for MemoryIndexEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexEngine for MemoryIndexEngine {
    fn get(&self, table: IndexTable, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.tables.read()[table.slot()].get(key).cloned())
    }

    fn apply(&self, batch: Vec<BatchOp>) -> anyhow::Result<()> {
        let mut tables = self.tables.write();
        for op in batch {
            match op {
                BatchOp::Put { table, key, value } => {
                    tables[table.slot()].insert(key, value);
                }
                BatchOp::Remove { table, key } => {
                    tables[table.slot()].remove(&key);
                }
            }
        }
        Ok(())
    }

    fn len(&self, table: IndexTable) -> anyhow::Result<u64> {
        Ok(self.tables.read()[table.slot()].len() as u64)
    }

    fn clear(&self, table: IndexTable) -> anyhow::Result<()> {
        self.tables.write()[table.slot()].clear();
        Ok(())
    }

    fn fetch_entries(
        &self,
        table: IndexTable,
        cursor: &IterationCursor,
        size: usize,
    ) -> anyhow::Result<FetchResult<(Vec<u8>, Vec<u8>)>> {
        let tables = self.tables.read();
        let entries = &tables[table.slot()];
        let offset = decode_cursor_offset(cursor);
        // Cursor offsets are bounded by table size, so truncation is safe.
        #[allow(clippy::cast_possible_truncation)]
        let skip = offset as usize;

        let items: Vec<(Vec<u8>, Vec<u8>)> = entries
            .iter()
            .skip(skip)
            .take(size)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let has_more = skip + items.len() < entries.len();

        Ok(FetchResult {
            next_cursor: advance_cursor(offset, items.len(), has_more),
            items,
        })
    }
}
