//! Low-level index engine trait and cursor-based iteration types.
//!
//! [`IndexEngine`] is the innermost layer of a partition's signature index:
//! a small set of ordered byte tables with atomic batched writes. Typed
//! records live one level up in [`PartitionIndex`](super::PartitionIndex).

/// Tables every partition index carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexTable {
    /// Signature -> reference-counted primary record.
    Primary,
    /// Archive file id -> signatures it references on this partition.
    ArchiveFiles,
    /// Signature -> zero-reference record awaiting physical reclamation.
    ZeroRef,
}

impl IndexTable {
    pub const ALL: [IndexTable; 3] = [Self::Primary, Self::ArchiveFiles, Self::ZeroRef];

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::ArchiveFiles => "archive_files",
            Self::ZeroRef => "zero_ref",
        }
    }

    pub(crate) fn slot(self) -> usize {
        match self {
            Self::Primary => 0,
            Self::ArchiveFiles => 1,
            Self::ZeroRef => 2,
        }
    }
}

/// Opaque cursor for resumable iteration over table entries.
///
/// Implementations encode their internal position in the `state` field.
/// Consumers should treat `state` as opaque and only check `finished`.
#[derive(Debug, Clone)]
pub struct IterationCursor {
    /// Opaque state for the engine to resume iteration.
    pub state: Vec<u8>,
    /// Whether iteration has completed (no more entries).
    pub finished: bool,
}

impl IterationCursor {
    /// Creates a cursor positioned at the beginning of a table.
    #[must_use]
    pub fn start() -> Self {
        Self {
            state: Vec::new(),
            finished: false,
        }
    }
}

/// Result of a cursor-based fetch operation.
#[derive(Debug)]
pub struct FetchResult<T> {
    pub items: Vec<T>,
    /// Updated cursor for the next fetch call.
    pub next_cursor: IterationCursor,
}

impl<T> FetchResult<T> {
    /// Converts the fetched items while keeping the cursor.
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> FetchResult<U> {
        FetchResult {
            items: self.items.into_iter().map(f).collect(),
            next_cursor: self.next_cursor,
        }
    }
}

/// One write inside an atomic [`IndexEngine::apply`] batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put {
        table: IndexTable,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Remove {
        table: IndexTable,
        key: Vec<u8>,
    },
}

/// Ordered byte-table storage with cursor-based iteration.
///
/// Keys iterate in ascending byte order. All operations are synchronous;
/// the owning index process serializes access, so implementations only
/// need to be safe to share, not fast under contention.
///
/// Wrapped in `Arc<dyn IndexEngine>` for sharing across async boundaries.
pub trait IndexEngine: Send + Sync + 'static {
    /// Retrieve a value by key, or `None` if not present.
    fn get(&self, table: IndexTable, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>>;

    /// Apply every operation in `batch` atomically.
    fn apply(&self, batch: Vec<BatchOp>) -> anyhow::Result<()>;

    /// Number of entries in `table`.
    fn len(&self, table: IndexTable) -> anyhow::Result<u64>;

    /// Remove every entry in `table`.
    fn clear(&self, table: IndexTable) -> anyhow::Result<()>;

    /// Fetch up to `size` entries starting from `cursor`.
    fn fetch_entries(
        &self,
        table: IndexTable,
        cursor: &IterationCursor,
        size: usize,
    ) -> anyhow::Result<FetchResult<(Vec<u8>, Vec<u8>)>>;
}

/// Decodes a cursor's opaque state into a `u64` offset.
///
/// Empty state (from `IterationCursor::start()`) is treated as offset 0.
pub(crate) fn decode_cursor_offset(cursor: &IterationCursor) -> u64 {
    if cursor.state.is_empty() {
        0
    } else {
        let mut buf = [0u8; 8];
        let len = cursor.state.len().min(8);
        buf[..len].copy_from_slice(&cursor.state[..len]);
        u64::from_le_bytes(buf)
    }
}

/// Encodes an offset into cursor state bytes (little-endian `u64`).
pub(crate) fn encode_cursor_offset(offset: u64) -> Vec<u8> {
    offset.to_le_bytes().to_vec()
}

/// Builds the cursor that follows a page of `fetched` items read at `offset`.
pub(crate) fn advance_cursor(offset: u64, fetched: usize, has_more: bool) -> IterationCursor {
    IterationCursor {
        state: encode_cursor_offset(offset + fetched as u64),
        finished: !has_more,
    }
}
