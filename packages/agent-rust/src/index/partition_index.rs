//! Typed signature index for one partition.
//!
//! Three tables back every index: reference-counted primary records, the
//! archive files known to the partition (with the signatures each one
//! references) and zero-reference records left behind by mark-and-sweep.
//! Records are MsgPack encoded (`rmp_serde::to_vec_named()`).

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use ddb_core::{ArchFileId, Signature};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::engine::{BatchOp, FetchResult, IndexEngine, IndexTable, IterationCursor};

/// Page size used when a full table scan is needed.
const SCAN_PAGE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PrimaryRecord {
    ref_count: u64,
    size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArchiveFileRecord {
    chunks: Vec<(Signature, u64)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ZeroRefRecord {
    size: u64,
    since_ms: u64,
}

/// Outcome of registering an archive file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddOutcome {
    /// References recorded (one per chunk occurrence).
    pub references: u64,
    /// Signatures this partition had never held a primary record for.
    pub new_primaries: u64,
    /// Signatures brought back from the zero-reference table.
    pub revived: u64,
    /// `true` when the archive file was already registered.
    pub already_present: bool,
}

/// Outcome of one mark-and-sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Primary records still referenced after the pass.
    pub live: u64,
    /// Primary records moved to the zero-reference table.
    pub swept: u64,
    /// Primary records whose stored reference count disagreed with the archive files.
    pub repaired: u64,
}

/// Point-in-time counters for a partition index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexStats {
    pub primary_entries: u64,
    pub zero_ref_count: u64,
    pub archive_files: u64,
}

/// Reference-counted signature index over an [`IndexEngine`].
#[derive(Clone)]
pub struct PartitionIndex {
    engine: Arc<dyn IndexEngine>,
}

impl PartitionIndex {
    #[must_use]
    pub fn new(engine: Arc<dyn IndexEngine>) -> Self {
        Self { engine }
    }

    /// Registers an archive file and the chunks it stores on this partition.
    ///
    /// Registering the same archive file twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine fails or a stored record is corrupt.
    pub fn add_archive_file(
        &self,
        arch_file: ArchFileId,
        chunks: &[(Signature, u64)],
    ) -> anyhow::Result<AddOutcome> {
        let key = af_key(arch_file);
        if self.engine.get(IndexTable::ArchiveFiles, &key)?.is_some() {
            return Ok(AddOutcome {
                already_present: true,
                ..AddOutcome::default()
            });
        }

        let mut outcome = AddOutcome::default();
        let mut primaries: HashMap<Signature, PrimaryRecord> = HashMap::new();
        let mut batch = Vec::new();

        for (signature, size) in chunks {
            outcome.references += 1;
            if let Some(record) = primaries.get_mut(signature) {
                record.ref_count += 1;
                continue;
            }
            let record = match self.primary(signature)? {
                Some(mut existing) => {
                    existing.ref_count += 1;
                    existing
                }
                None => {
                    if self
                        .engine
                        .get(IndexTable::ZeroRef, signature.as_bytes())?
                        .is_some()
                    {
                        outcome.revived += 1;
                        batch.push(BatchOp::Remove {
                            table: IndexTable::ZeroRef,
                            key: signature.as_bytes().to_vec(),
                        });
                    } else {
                        outcome.new_primaries += 1;
                    }
                    PrimaryRecord {
                        ref_count: 1,
                        size: *size,
                    }
                }
            };
            primaries.insert(*signature, record);
        }

        for (signature, record) in &primaries {
            batch.push(BatchOp::Put {
                table: IndexTable::Primary,
                key: signature.as_bytes().to_vec(),
                value: encode(record)?,
            });
        }
        batch.push(BatchOp::Put {
            table: IndexTable::ArchiveFiles,
            key: key.to_vec(),
            value: encode(&ArchiveFileRecord {
                chunks: chunks.to_vec(),
            })?,
        });
        self.engine.apply(batch)?;
        Ok(outcome)
    }

    /// Forgets an archive file and releases the references it held.
    ///
    /// Reference counts saturate at zero; the primary records stay until
    /// the next mark-and-sweep moves them. Returns the number of references
    /// released, `0` when the archive file was unknown.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine fails or a stored record is corrupt.
    pub fn drop_archive_file(&self, arch_file: ArchFileId) -> anyhow::Result<u64> {
        let key = af_key(arch_file);
        let Some(raw) = self.engine.get(IndexTable::ArchiveFiles, &key)? else {
            return Ok(0);
        };
        let record: ArchiveFileRecord = decode(&raw)?;

        let mut releases: HashMap<Signature, u64> = HashMap::new();
        for (signature, _) in &record.chunks {
            *releases.entry(*signature).or_default() += 1;
        }

        let mut batch = vec![BatchOp::Remove {
            table: IndexTable::ArchiveFiles,
            key: key.to_vec(),
        }];
        for (signature, count) in &releases {
            if let Some(mut primary) = self.primary(signature)? {
                primary.ref_count = primary.ref_count.saturating_sub(*count);
                batch.push(BatchOp::Put {
                    table: IndexTable::Primary,
                    key: signature.as_bytes().to_vec(),
                    value: encode(&primary)?,
                });
            }
        }
        self.engine.apply(batch)?;
        Ok(record.chunks.len() as u64)
    }

    /// Whether `arch_file` is registered on this partition.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine fails.
    pub fn contains_archive_file(&self, arch_file: ArchFileId) -> anyhow::Result<bool> {
        Ok(self
            .engine
            .get(IndexTable::ArchiveFiles, &af_key(arch_file))?
            .is_some())
    }

    /// Pages through registered archive file ids in ascending order.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine fails or a key is malformed.
    pub fn list_archive_files(
        &self,
        cursor: &IterationCursor,
        size: usize,
    ) -> anyhow::Result<FetchResult<ArchFileId>> {
        let page = self
            .engine
            .fetch_entries(IndexTable::ArchiveFiles, cursor, size)?;
        let items = page
            .items
            .iter()
            .map(|(key, _)| af_from_key(key))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(FetchResult {
            items,
            next_cursor: page.next_cursor,
        })
    }

    /// Every registered archive file id, ascending.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine fails or a key is malformed.
    pub fn archive_file_ids(&self) -> anyhow::Result<BTreeSet<ArchFileId>> {
        let mut ids = BTreeSet::new();
        let mut cursor = IterationCursor::start();
        while !cursor.finished {
            let page = self.list_archive_files(&cursor, SCAN_PAGE)?;
            ids.extend(page.items);
            cursor = page.next_cursor;
        }
        Ok(ids)
    }

    /// Recomputes reference counts from the archive file table and moves
    /// unreferenced primary records to the zero-reference table.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine fails or a stored record is corrupt.
    pub fn mark_and_sweep(&self, now_ms: u64) -> anyhow::Result<SweepReport> {
        let mut live: HashMap<Signature, u64> = HashMap::new();
        let mut sizes: HashMap<Signature, u64> = HashMap::new();
        self.scan(IndexTable::ArchiveFiles, |_, value| {
            let record: ArchiveFileRecord = decode(value)?;
            for (signature, size) in record.chunks {
                *live.entry(signature).or_default() += 1;
                sizes.entry(signature).or_insert(size);
            }
            Ok(())
        })?;

        let mut report = SweepReport::default();
        let mut batch = Vec::new();
        self.scan(IndexTable::Primary, |key, value| {
            let signature = signature_from_key(key)?;
            let mut record: PrimaryRecord = decode(value)?;
            match live.remove(&signature) {
                Some(count) => {
                    report.live += 1;
                    if record.ref_count != count {
                        report.repaired += 1;
                        record.ref_count = count;
                        batch.push(BatchOp::Put {
                            table: IndexTable::Primary,
                            key: key.to_vec(),
                            value: encode(&record)?,
                        });
                    }
                }
                None => {
                    report.swept += 1;
                    batch.push(BatchOp::Remove {
                        table: IndexTable::Primary,
                        key: key.to_vec(),
                    });
                    batch.push(BatchOp::Put {
                        table: IndexTable::ZeroRef,
                        key: key.to_vec(),
                        value: encode(&ZeroRefRecord {
                            size: record.size,
                            since_ms: now_ms,
                        })?,
                    });
                }
            }
            Ok(())
        })?;

        // Referenced signatures with no primary record left.
        for (signature, count) in live {
            report.live += 1;
            report.repaired += 1;
            batch.push(BatchOp::Put {
                table: IndexTable::Primary,
                key: signature.as_bytes().to_vec(),
                value: encode(&PrimaryRecord {
                    ref_count: count,
                    size: sizes.get(&signature).copied().unwrap_or_default(),
                })?,
            });
            batch.push(BatchOp::Remove {
                table: IndexTable::ZeroRef,
                key: signature.as_bytes().to_vec(),
            });
        }

        self.engine.apply(batch)?;
        Ok(report)
    }

    /// Up to `limit` signatures awaiting physical reclamation.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine fails or a key is malformed.
    pub fn zero_ref_batch(&self, limit: usize) -> anyhow::Result<Vec<Signature>> {
        let page = self
            .engine
            .fetch_entries(IndexTable::ZeroRef, &IterationCursor::start(), limit)?;
        page.items
            .iter()
            .map(|(key, _)| signature_from_key(key))
            .collect()
    }

    /// Removes reclaimed signatures from the zero-reference table.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine fails.
    pub fn forget_zero_ref(&self, signatures: &[Signature]) -> anyhow::Result<()> {
        let batch = signatures
            .iter()
            .map(|signature| BatchOp::Remove {
                table: IndexTable::ZeroRef,
                key: signature.as_bytes().to_vec(),
            })
            .collect();
        self.engine.apply(batch)
    }

    /// Records every `stored` signature with no primary record as zero-ref,
    /// so bytes no archive file references can still be reclaimed. Returns
    /// how many records were written.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine fails.
    pub fn adopt_unreferenced(
        &self,
        stored: &[(Signature, u64)],
        now_ms: u64,
    ) -> anyhow::Result<u64> {
        let mut batch = Vec::new();
        for (signature, size) in stored {
            if self.primary(signature)?.is_some()
                || self
                    .engine
                    .get(IndexTable::ZeroRef, signature.as_bytes())?
                    .is_some()
            {
                continue;
            }
            batch.push(BatchOp::Put {
                table: IndexTable::ZeroRef,
                key: signature.as_bytes().to_vec(),
                value: encode(&ZeroRefRecord {
                    size: *size,
                    since_ms: now_ms,
                })?,
            });
        }
        let adopted = batch.len() as u64;
        self.engine.apply(batch)?;
        Ok(adopted)
    }

    /// # Errors
    ///
    /// Returns an error if the engine fails.
    pub fn stats(&self) -> anyhow::Result<IndexStats> {
        Ok(IndexStats {
            primary_entries: self.engine.len(IndexTable::Primary)?,
            zero_ref_count: self.engine.len(IndexTable::ZeroRef)?,
            archive_files: self.engine.len(IndexTable::ArchiveFiles)?,
        })
    }

    /// Drops every table. Used before a full rebuild.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine fails.
    pub fn clear(&self) -> anyhow::Result<()> {
        for table in IndexTable::ALL {
            self.engine
                .clear(table)
                .with_context(|| format!("clearing {} table", table.name()))?;
        }
        Ok(())
    }

    fn primary(&self, signature: &Signature) -> anyhow::Result<Option<PrimaryRecord>> {
        self.engine
            .get(IndexTable::Primary, signature.as_bytes())?
            .map(|raw| decode(&raw))
            .transpose()
    }

    fn scan(
        &self,
        table: IndexTable,
        mut visit: impl FnMut(&[u8], &[u8]) -> anyhow::Result<()>,
    ) -> anyhow::Result<()> {
        let mut cursor = IterationCursor::start();
        while !cursor.finished {
            let page = self.engine.fetch_entries(table, &cursor, SCAN_PAGE)?;
            for (key, value) in &page.items {
                visit(key, value)?;
            }
            cursor = page.next_cursor;
        }
        Ok(())
    }
}

fn encode<T: Serialize>(value: &T) -> anyhow::Result<Vec<u8>> {
    Ok(rmp_serde::to_vec_named(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> anyhow::Result<T> {
    Ok(rmp_serde::from_slice(bytes)?)
}

fn af_key(id: ArchFileId) -> [u8; 8] {
    id.get().to_be_bytes()
}

fn af_from_key(key: &[u8]) -> anyhow::Result<ArchFileId> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| anyhow!("malformed archive file key of {} bytes", key.len()))?;
    Ok(ArchFileId(u64::from_be_bytes(bytes)))
}

fn signature_from_key(key: &[u8]) -> anyhow::Result<Signature> {
    let bytes: [u8; 32] = key
        .try_into()
        .map_err(|_| anyhow!("malformed signature key of {} bytes", key.len()))?;
    Ok(Signature::from_bytes(bytes))
}
