//! Identifier newtypes for catalog entities.
//!
//! Every entity the engine touches is keyed by a catalog-assigned integer.
//! Wrapping them keeps a `StoreId` from being passed where a `SubstoreId`
//! is expected; serde keeps the bare integer on the wire.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! catalog_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            /// Returns the raw catalog value.
            #[must_use]
            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }
    };
}

catalog_id!(
    /// Identifier of a deduplication store (`SIDBStoreId`).
    StoreId
);
catalog_id!(
    /// Identifier of one partition of a store (`SubStoreId`).
    SubstoreId
);
catalog_id!(
    /// Identifier of an archive file (`archFileId`).
    ArchFileId
);
catalog_id!(
    /// Identifier of the backup job that produced archive files.
    JobId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_serialize_as_bare_integers() {
        let json = serde_json::to_string(&StoreId(17)).unwrap();
        assert_eq!(json, "17");
        let back: SubstoreId = serde_json::from_str("42").unwrap();
        assert_eq!(back, SubstoreId(42));
    }

    #[test]
    fn ids_order_by_raw_value() {
        let mut ids = vec![SubstoreId(9), SubstoreId(2), SubstoreId(5)];
        ids.sort();
        assert_eq!(ids, vec![SubstoreId(2), SubstoreId(5), SubstoreId(9)]);
    }

    #[test]
    fn display_prints_raw_value() {
        assert_eq!(ArchFileId(1234).to_string(), "1234");
        assert_eq!(JobId::from(7).get(), 7);
    }
}
