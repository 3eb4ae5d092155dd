//! Codes recorded in the resync and recovery ledgers.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::flags::RecoveryFlags;

/// Log marker emitted by Full reconstruction when it skips the pruning
/// (validation) pass and leaves verification to the follow-up resync.
///
/// Regular reconstruction never emits it.
pub const SKIP_VALIDATION_MARKER: &str = "Skip Pruning phase and go to DDB verify";

/// Catalog return code for a failed AF diff.
pub const AF_DIFF_FAILED_CODE: i32 = 53_006;

// ---------------------------------------------------------------------------
// MaintenanceReason
// ---------------------------------------------------------------------------

/// Why a resync attempt was started (`MaintenanceReason` column).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub enum MaintenanceReason {
    /// The store was explicitly marked for recovery; invalid AFs are pruned.
    ArchiveFileValidation,
    /// Scheduled validation of an aged store, or an aborted attempt.
    ControlledValidation,
    /// Verification following a reconstruction.
    PostReconstruction,
    /// A code this crate does not name.
    Other(u32),
}

impl MaintenanceReason {
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::ArchiveFileValidation => 9,
            Self::ControlledValidation => 11,
            Self::PostReconstruction => 13,
            Self::Other(code) => code,
        }
    }

    /// `MaintenanceReasonDesc` column text.
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::ArchiveFileValidation => {
                "Archive file validation is in progress. Invalid archive files will be pruned."
            }
            Self::ControlledValidation => "Controlled archive file validation is in progress.",
            Self::PostReconstruction => "Archive file validation after DDB reconstruction.",
            Self::Other(_) => "",
        }
    }
}

impl From<u32> for MaintenanceReason {
    fn from(code: u32) -> Self {
        match code {
            9 => Self::ArchiveFileValidation,
            11 => Self::ControlledValidation,
            13 => Self::PostReconstruction,
            other => Self::Other(other),
        }
    }
}

impl From<MaintenanceReason> for u32 {
    fn from(reason: MaintenanceReason) -> Self {
        reason.code()
    }
}

// ---------------------------------------------------------------------------
// ResyncStatus
// ---------------------------------------------------------------------------

/// `Status` column of a resync ledger row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum ResyncStatus {
    InProgress,
    Success,
    /// The AF diff between index and catalog failed or was aborted.
    AfDiffFailed,
    Failed(i32),
}

impl ResyncStatus {
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::InProgress => -1,
            Self::Success => 0,
            Self::AfDiffFailed => AF_DIFF_FAILED_CODE,
            Self::Failed(code) => code,
        }
    }

    /// Returns `true` for every status other than `InProgress`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

impl From<i32> for ResyncStatus {
    fn from(code: i32) -> Self {
        match code {
            -1 => Self::InProgress,
            0 => Self::Success,
            AF_DIFF_FAILED_CODE => Self::AfDiffFailed,
            other => Self::Failed(other),
        }
    }
}

impl From<ResyncStatus> for i32 {
    fn from(status: ResyncStatus) -> Self {
        status.code()
    }
}

// ---------------------------------------------------------------------------
// ReconstructionMode
// ---------------------------------------------------------------------------

/// How a partition index is rebuilt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReconstructionMode {
    /// Catch up the delta against the catalog, then validate.
    Regular,
    /// Rebuild everything from the catalog; validation is skipped.
    Full,
}

impl ReconstructionMode {
    #[must_use]
    pub const fn recovery_flags(self) -> RecoveryFlags {
        match self {
            Self::Regular => RecoveryFlags::REGULAR,
            Self::Full => RecoveryFlags::FULL,
        }
    }

    /// Returns `true` if the mode runs DDB validation after rebuilding.
    #[must_use]
    pub const fn validates(self) -> bool {
        matches!(self, Self::Regular)
    }
}

impl fmt::Display for ReconstructionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Regular => f.write_str("regular"),
            Self::Full => f.write_str("full"),
        }
    }
}
