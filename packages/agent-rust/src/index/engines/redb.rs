//! Durable [`IndexEngine`] backed by a `redb` database file.
//!
//! Each partition index owns one database file under its partition path.
//! Every [`IndexTable`] maps onto a `&[u8] -> &[u8]` redb table.

use std::path::Path;

use anyhow::Context;
use redb::{Database, ReadableTable, TableDefinition};

use crate::index::engine::{
    advance_cursor, decode_cursor_offset, BatchOp, FetchResult, IndexEngine, IndexTable,
    IterationCursor,
};

const PRIMARY: TableDefinition<&[u8], &[u8]> = TableDefinition::new("primary");
const ARCHIVE_FILES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("archive_files");
const ZERO_REF: TableDefinition<&[u8], &[u8]> = TableDefinition::new("zero_ref");

fn definition(table: IndexTable) -> TableDefinition<'static, &'static [u8], &'static [u8]> {
    match table {
        IndexTable::Primary => PRIMARY,
        IndexTable::ArchiveFiles => ARCHIVE_FILES,
        IndexTable::ZeroRef => ZERO_REF,
    }
}

/// Index engine persisted in a single redb file.
pub struct RedbIndexEngine {
    db: Database,
}

impl RedbIndexEngine {
    /// Opens (or creates) the database at `path` and makes sure every table exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or is not a redb database.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let db = Database::create(path)
            .with_context(|| format!("opening index database {}", path.display()))?;
        let txn = db.begin_write()?;
        for table in IndexTable::ALL {
            txn.open_table(definition(table))?;
        }
        txn.commit()?;
        Ok(Self { db })
    }
}

impl IndexEngine for RedbIndexEngine {
    fn get(&self, table: IndexTable, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        let txn = self.db.begin_read()?;
        let handle = txn.open_table(definition(table))?;
        let value = handle.get(key)?.map(|guard| guard.value().to_vec());
        Ok(value)
    }

    fn apply(&self, batch: Vec<BatchOp>) -> anyhow::Result<()> {
        let txn = self.db.begin_write()?;
        for op in &batch {
            match op {
                BatchOp::Put { table, key, value } => {
                    let mut handle = txn.open_table(definition(*table))?;
                    handle.insert(key.as_slice(), value.as_slice())?;
                }
                BatchOp::Remove { table, key } => {
                    let mut handle = txn.open_table(definition(*table))?;
                    handle.remove(key.as_slice())?;
                }
            }
        }
        txn.commit()?;
        Ok(())
    }

    fn len(&self, table: IndexTable) -> anyhow::Result<u64> {
        let txn = self.db.begin_read()?;
        let handle = txn.open_table(definition(table))?;
        let mut count = 0u64;
        for entry in handle.iter()? {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    fn clear(&self, table: IndexTable) -> anyhow::Result<()> {
        let txn = self.db.begin_write()?;
        txn.delete_table(definition(table))?;
        txn.open_table(definition(table))?;
        txn.commit()?;
        Ok(())
    }

    fn fetch_entries(
        &self,
        table: IndexTable,
        cursor: &IterationCursor,
        size: usize,
    ) -> anyhow::Result<FetchResult<(Vec<u8>, Vec<u8>)>> {
        let txn = self.db.begin_read()?;
        let handle = txn.open_table(definition(table))?;
        let offset = decode_cursor_offset(cursor);
        // Cursor offsets are bounded by table size, so truncation is safe.
        #[allow(clippy::cast_possible_truncation)]
        let skip = offset as usize;

        let mut items = Vec::with_capacity(size.min(1024));
        let mut has_more = false;
        for entry in handle.iter()?.skip(skip) {
            let (key, value) = entry?;
            if items.len() == size {
                has_more = true;
                break;
            }
            items.push((key.value().to_vec(), value.value().to_vec()));
        }

        Ok(FetchResult {
            next_cursor: advance_cursor(offset, items.len(), has_more),
            items,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, RedbIndexEngine) {
        let dir = tempfile::tempdir().unwrap();
        let engine = RedbIndexEngine::open(&dir.path().join("index.redb")).unwrap();
        (dir, engine)
    }

    #[test]
    fn writes_are_visible_to_reads() {
        let (_dir, engine) = open_temp();
        engine
            .apply(vec![BatchOp::Put {
                table: IndexTable::Primary,
                key: b"sig".to_vec(),
                value: b"rec".to_vec(),
            }])
            .unwrap();

        assert_eq!(
            engine.get(IndexTable::Primary, b"sig").unwrap(),
            Some(b"rec".to_vec())
        );
        assert_eq!(engine.len(IndexTable::Primary).unwrap(), 1);
        assert!(engine.get(IndexTable::ZeroRef, b"sig").unwrap().is_none());
    }

    #[test]
    fn contents_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.redb");
        {
            let engine = RedbIndexEngine::open(&path).unwrap();
            engine
                .apply(vec![BatchOp::Put {
                    table: IndexTable::ArchiveFiles,
                    key: 7u64.to_be_bytes().to_vec(),
                    value: vec![1, 2, 3],
                }])
                .unwrap();
        }

        let reopened = RedbIndexEngine::open(&path).unwrap();
        assert_eq!(
            reopened
                .get(IndexTable::ArchiveFiles, &7u64.to_be_bytes())
                .unwrap(),
            Some(vec![1, 2, 3])
        );
    }

    #[test]
    fn clear_then_page() {
        let (_dir, engine) = open_temp();
        let batch = (0u64..5)
            .map(|i| BatchOp::Put {
                table: IndexTable::ZeroRef,
                key: i.to_be_bytes().to_vec(),
                value: Vec::new(),
            })
            .collect();
        engine.apply(batch).unwrap();

        let first = engine
            .fetch_entries(IndexTable::ZeroRef, &IterationCursor::start(), 3)
            .unwrap();
        assert_eq!(first.items.len(), 3);
        assert!(!first.next_cursor.finished);
        let second = engine
            .fetch_entries(IndexTable::ZeroRef, &first.next_cursor, 3)
            .unwrap();
        assert_eq!(second.items.len(), 2);
        assert!(second.next_cursor.finished);

        engine.clear(IndexTable::ZeroRef).unwrap();
        assert_eq!(engine.len(IndexTable::ZeroRef).unwrap(), 0);
    }
}
