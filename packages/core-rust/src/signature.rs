//! Content signatures identifying deduplicated chunks.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// BLAKE3 digest of a chunk's bytes.
///
/// Two chunks with equal signatures are stored once. Serializes as a
/// lowercase hex string.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Signature([u8; 32]);

impl Signature {
    /// Computes the signature of `data`.
    #[must_use]
    pub fn of(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short prefix is enough to tell signatures apart in logs.
        write!(f, "Signature({})", &self.to_hex()[..12])
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Error returned when parsing a malformed hex signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseSignatureError(String);

impl fmt::Display for ParseSignatureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid signature: {}", self.0)
    }
}

impl std::error::Error for ParseSignatureError {}

impl FromStr for Signature {
    type Err = ParseSignatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = hex::decode(s).map_err(|e| ParseSignatureError(e.to_string()))?;
        let bytes: [u8; 32] = raw
            .try_into()
            .map_err(|v: Vec<u8>| ParseSignatureError(format!("expected 32 bytes, got {}", v.len())))?;
        Ok(Self(bytes))
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_content_yields_equal_signature() {
        assert_eq!(Signature::of(b"chunk-a"), Signature::of(b"chunk-a"));
        assert_ne!(Signature::of(b"chunk-a"), Signature::of(b"chunk-b"));
    }

    #[test]
    fn hex_parse_round_trips() {
        let sig = Signature::of(b"payload");
        let parsed: Signature = sig.to_hex().parse().unwrap();
        assert_eq!(parsed, sig);
    }

    #[test]
    fn parse_rejects_wrong_length() {
        assert!("abcd".parse::<Signature>().is_err());
        assert!("zz".parse::<Signature>().is_err());
    }

    #[test]
    fn serializes_as_hex_string() {
        let sig = Signature::from_bytes([0xab; 32]);
        let json = serde_json::to_string(&sig).unwrap();
        assert_eq!(json, format!("\"{}\"", "ab".repeat(32)));
    }
}
