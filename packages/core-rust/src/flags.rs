//! Typed flag bitsets stored as integers in the catalog.
//!
//! Each set wraps the raw column value and exposes named constants with the
//! exact bit values the catalog uses. Unknown bits are preserved on
//! round-trip so a newer catalog never loses information through this layer.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};

macro_rules! flag_set {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$fmeta:meta])* const $flag:ident = $value:expr; )+
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u32);

        impl $name {
            $( $(#[$fmeta])* pub const $flag: Self = Self($value); )+

            /// The empty set.
            #[must_use]
            pub const fn empty() -> Self {
                Self(0)
            }

            /// Wraps a raw column value, keeping bits this type does not name.
            #[must_use]
            pub const fn from_bits(bits: u32) -> Self {
                Self(bits)
            }

            /// The raw column value.
            #[must_use]
            pub const fn bits(self) -> u32 {
                self.0
            }

            #[must_use]
            pub const fn is_empty(self) -> bool {
                self.0 == 0
            }

            /// Returns `true` if every bit of `other` is set.
            #[must_use]
            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            pub fn insert(&mut self, other: Self) {
                self.0 |= other.0;
            }

            pub fn remove(&mut self, other: Self) {
                self.0 &= !other.0;
            }

            /// Sets or clears `other` depending on `value`.
            pub fn set(&mut self, other: Self, value: bool) {
                if value {
                    self.insert(other);
                } else {
                    self.remove(other);
                }
            }

            /// Returns a copy with `other` set.
            #[must_use]
            pub const fn with(self, other: Self) -> Self {
                Self(self.0 | other.0)
            }

            /// Returns a copy with `other` cleared.
            #[must_use]
            pub const fn without(self, other: Self) -> Self {
                Self(self.0 & !other.0)
            }

            fn names(self) -> Vec<&'static str> {
                let mut names = Vec::new();
                $( if $value != 0 && self.contains(Self::$flag) { names.push(stringify!($flag)); } )+
                names
            }
        }

        impl BitOr for $name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }

        impl BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) {
                self.0 |= rhs.0;
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({} {:?})", stringify!($name), self.0, self.names())
            }
        }
    };
}

flag_set! {
    /// `DEDUPLICATION_STORE_FLAGS` of a store row.
    StoreFlags {
        const SW_COMPRESSION = 2;
        const GLOBAL_DEDUPE = 16;
        const SINGLE_THREAD_DB = 32;
        const SIDB_SUSPENDED = 64;
        const STORE_SEALED = 32_768;
        const DEDUP_FACTOR_ENABLED = 65_536;
        const SILO_PREPARED = 1_048_576;
        const VALIDATION_FAILED = 4_194_304;
        const VALIDATION_ENABLED = 8_388_608;
        const UNDER_MAINTENANCE = 16_777_216;
        /// The maintenance scheduler must run a resync attempt.
        const NEEDS_AUTO_RESYNC = 33_554_432;
        const VERIFICATION_IN_PROGRESS = 67_108_864;
        const TIMESTAMP_MISMATCH = 134_217_728;
        const PRUNING_ENABLED = 536_870_912;
        /// A resync attempt is currently running.
        const RESYNC_IN_PROGRESS = 1_073_741_824;
    }
}

impl StoreFlags {
    #[must_use]
    pub const fn is_sealed(self) -> bool {
        self.contains(Self::STORE_SEALED)
    }

    #[must_use]
    pub const fn needs_auto_resync(self) -> bool {
        self.contains(Self::NEEDS_AUTO_RESYNC)
    }

    #[must_use]
    pub const fn is_resync_in_progress(self) -> bool {
        self.contains(Self::RESYNC_IN_PROGRESS)
    }

    #[must_use]
    pub const fn is_pruning_enabled(self) -> bool {
        self.contains(Self::PRUNING_ENABLED)
    }
}

flag_set! {
    /// Extended flags of a store row.
    StoreExtendedFlags {
        const DEFAULT = 2;
        const MARK_AND_SWEEP_ENABLED = 4;
        const ZERO_REF_LOGGING_ENABLED = 8;
    }
}

impl StoreExtendedFlags {
    #[must_use]
    pub const fn is_mark_and_sweep_enabled(self) -> bool {
        self.contains(Self::MARK_AND_SWEEP_ENABLED)
    }
}

flag_set! {
    /// Flags of a substore (partition) row.
    SubstoreFlags {
        const MOVE_IN_PROGRESS = 64;
    }
}

flag_set! {
    /// Extended flags of a substore row (`idxsidbsubstore.extendedflags`).
    SubstoreExtendedFlags {
        /// The partition distributes chunks for its store.
        const DISTRIBUTOR = 32;
    }
}

impl SubstoreExtendedFlags {
    #[must_use]
    pub const fn is_distributor(self) -> bool {
        self.contains(Self::DISTRIBUTOR)
    }
}

flag_set! {
    /// `ResyncFlags` column of the resync ledger.
    ResyncFlags {
        /// Archive files the catalog does not confirm are pruned from the index.
        const PRUNE_INVALID_AFS = 1;
        /// AF-diff batches are exchanged under the batch-size guard.
        const CONTROLLED_VALIDATION = 4;
    }
}

impl ResyncFlags {
    /// Flags recorded for scheduled (controlled) validation runs.
    pub const SCHEDULED: Self = Self(1 | 4);
}

flag_set! {
    /// Recovery type flags recorded in the recovery ledger.
    RecoveryFlags {
        const DELTA = 1;
        const REGULAR = 2;
        const FULL = 4;
    }
}
