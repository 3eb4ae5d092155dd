//! Error types surfaced by the media agent.
//!
//! Trait seams (catalog, index engine, chunk store) return `anyhow::Result`.
//! Everything the agent hands back to callers is an [`EngineError`]; seam
//! errors are wrapped with an [`OperationContext`] naming the store,
//! partition and phase that failed.

use std::fmt;
use std::time::Duration;

use ddb_core::{ArchFileId, StoreId, SubstoreId};

// ---------------------------------------------------------------------------
// OperationContext
// ---------------------------------------------------------------------------

/// Stage of the engine an operation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Provisioning,
    Ingest,
    Restore,
    /// Phase 1: logical deletion.
    LogicalDelete,
    /// Phase 2: catalog cleanup.
    CatalogCleanup,
    /// Phase 3: mark-and-sweep and zero-ref drain.
    Reclamation,
    Usage,
    Distributor,
    Health,
    Resync,
    Reconstruction,
}

impl Phase {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Provisioning => "provisioning",
            Self::Ingest => "ingest",
            Self::Restore => "restore",
            Self::LogicalDelete => "phase1",
            Self::CatalogCleanup => "phase2",
            Self::Reclamation => "phase3",
            Self::Usage => "usage",
            Self::Distributor => "distributor",
            Self::Health => "health",
            Self::Resync => "resync",
            Self::Reconstruction => "reconstruction",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationContext {
    pub phase: Phase,
    pub store: Option<StoreId>,
    pub partition: Option<SubstoreId>,
}

impl OperationContext {
    #[must_use]
    pub const fn new(phase: Phase) -> Self {
        Self {
            phase,
            store: None,
            partition: None,
        }
    }

    #[must_use]
    pub const fn store(mut self, store: StoreId) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub const fn partition(mut self, partition: SubstoreId) -> Self {
        self.partition = Some(partition);
        self
    }
}

impl fmt::Display for OperationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "phase={}", self.phase)?;
        if let Some(store) = self.store {
            write!(f, " store={store}")?;
        }
        if let Some(partition) = self.partition {
            write!(f, " partition={partition}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// EngineError
// ---------------------------------------------------------------------------

/// Coarse classification used for logging and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A bounded wait ran out of budget.
    Timeout,
    /// The catalog and the indexes disagree in a way that must not be papered over.
    Consistency,
    /// Bad input or configuration; retrying will not help.
    Precondition,
    /// Part of the store is unavailable.
    Degraded,
    /// A lower layer failed.
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("store {store} has multiple distributor partitions: {partitions:?}")]
    MultipleDistributors {
        store: StoreId,
        partitions: Vec<SubstoreId>,
    },
    #[error("store {store} has no distributor partition")]
    NoDistributor { store: StoreId },
    #[error("store {store} is degraded: no partition is online")]
    StoreDegraded { store: StoreId },
    #[error("store {store} not found")]
    StoreNotFound { store: StoreId },
    #[error("partition {partition} not found")]
    PartitionNotFound { partition: SubstoreId },
    #[error("a store named {name:?} already exists")]
    DuplicateStoreName { name: String },
    #[error("partition #{index} has no path configured")]
    MissingPartitionPath { index: usize },
    #[error("store needs at least one partition")]
    NoPartitions,
    #[error("path {path:?} is not accessible")]
    PathInaccessible { path: String },
    #[error("store {store} is sealed")]
    StoreSealed { store: StoreId },
    #[error("timed out waiting for {what} after {budget:?}")]
    WaitTimeout { what: String, budget: Duration },
    #[error("AF diff batch size mismatch: requested {requested}, received {received}")]
    BatchSizeMismatch { requested: usize, received: usize },
    #[error("AF diff for store {store} failed. iRet [{code}]")]
    AfDiffFailed { store: StoreId, code: i32 },
    #[error("index process for partition {partition} is not running")]
    IndexProcessDown { partition: SubstoreId },
    #[error("archive file {arch_file} is unavailable: {reason}")]
    ArchiveFileUnavailable { arch_file: ArchFileId, reason: String },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("catalog error ({context}): {source}")]
    Catalog {
        context: OperationContext,
        source: anyhow::Error,
    },
    #[error("index error ({context}): {source}")]
    Index {
        context: OperationContext,
        source: anyhow::Error,
    },
}

impl EngineError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::WaitTimeout { .. } => ErrorKind::Timeout,
            Self::MultipleDistributors { .. }
            | Self::NoDistributor { .. }
            | Self::BatchSizeMismatch { .. }
            | Self::AfDiffFailed { .. } => ErrorKind::Consistency,
            Self::DuplicateStoreName { .. }
            | Self::MissingPartitionPath { .. }
            | Self::NoPartitions
            | Self::StoreNotFound { .. }
            | Self::PartitionNotFound { .. }
            | Self::StoreSealed { .. }
            | Self::Config(_) => ErrorKind::Precondition,
            Self::StoreDegraded { .. }
            | Self::PathInaccessible { .. }
            | Self::IndexProcessDown { .. }
            | Self::ArchiveFileUnavailable { .. } => ErrorKind::Degraded,
            Self::Catalog { .. } | Self::Index { .. } => ErrorKind::Internal,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Wraps seam errors with the operation context.
pub trait ContextExt<T> {
    /// Wraps a catalog failure.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Catalog` if `self` is an error.
    fn catalog_ctx(self, context: OperationContext) -> EngineResult<T>;

    /// Wraps an index failure.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Index` if `self` is an error.
    fn index_ctx(self, context: OperationContext) -> EngineResult<T>;
}

impl<T> ContextExt<T> for anyhow::Result<T> {
    fn catalog_ctx(self, context: OperationContext) -> EngineResult<T> {
        self.map_err(|source| EngineError::Catalog { context, source })
    }

    fn index_ctx(self, context: OperationContext) -> EngineResult<T> {
        self.map_err(|source| EngineError::Index { context, source })
    }
}

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown setting: {key}")]
    UnknownSetting { key: String },
    #[error("invalid value {value:?} for setting {key}")]
    InvalidValue { key: String, value: String },
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
}
