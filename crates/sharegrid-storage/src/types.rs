//! Identity and response types for the storage interface.
//!
//! These types are shared by storage servers and by the placement
//! engine that talks to them.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// One erasure-coded fragment, in `0..total_shares`.
pub type ShareIndex = u32;

/// Opaque, stable identifier of a storage server.
pub type ServerId = String;

/// Stable per-file identifier addressing all of a file's shares.
///
/// Serialized as lowercase hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct StorageIndex([u8; 16]);

impl StorageIndex {
    pub const LEN: usize = 16;

    pub fn new(bytes: [u8; Self::LEN]) -> Self {
        Self(bytes)
    }

    /// Build a storage index from the first 16 bytes of a longer digest.
    ///
    /// Returns `None` if `digest` is shorter than 16 bytes.
    pub fn from_digest(digest: &[u8]) -> Option<Self> {
        let bytes: [u8; Self::LEN] = digest.get(..Self::LEN)?.try_into().ok()?;
        Some(Self(bytes))
    }

    /// Parse the lowercase hex form produced by `Display`.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let bytes: [u8; Self::LEN] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.0
    }
}

impl fmt::Display for StorageIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl From<StorageIndex> for String {
    fn from(si: StorageIndex) -> Self {
        si.to_string()
    }
}

impl TryFrom<String> for StorageIndex {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_hex(&s).ok_or_else(|| format!("invalid storage index: {s}"))
    }
}

/// Whether a server accepts new shares, as the server itself reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Writability {
    #[default]
    Writable,
    ReadOnly,
    Full,
}

/// Shares a server holds for one storage index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeldShares {
    /// Fully written (closed) shares.
    pub shares: BTreeSet<ShareIndex>,
    pub writability: Writability,
}

/// Answer to a bucket allocation request.
///
/// Requested shares that appear in neither set were refused.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Allocation {
    /// Shares the server already holds in full.
    pub already_held: BTreeSet<ShareIndex>,
    /// Shares that now have an open bucket ready for writes.
    pub allocated: BTreeSet<ShareIndex>,
    /// The server's writability when it answered.
    pub writability: Writability,
}

/// Lease renewal and cancellation secrets.
///
/// Opaque to everything except the storage server; passed through
/// unmodified.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct LeaseSecrets {
    pub renew: [u8; 32],
    pub cancel: [u8; 32],
}

impl LeaseSecrets {
    pub fn new(renew: [u8; 32], cancel: [u8; 32]) -> Self {
        Self { renew, cancel }
    }
}

impl fmt::Debug for LeaseSecrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LeaseSecrets(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_index_hex_round_trips() {
        let si = StorageIndex::new([0xab; 16]);
        let text = si.to_string();
        assert_eq!(text.len(), 32);
        assert_eq!(StorageIndex::from_hex(&text), Some(si));
    }

    #[test]
    fn storage_index_rejects_wrong_length() {
        assert!(StorageIndex::from_hex("abcd").is_none());
        assert!(StorageIndex::from_digest(&[1, 2, 3]).is_none());
    }

    #[test]
    fn storage_index_truncates_digest() {
        let digest = [7u8; 32];
        let si = StorageIndex::from_digest(&digest).unwrap();
        assert_eq!(si.as_bytes(), &[7u8; 16]);
    }

    #[test]
    fn secrets_are_redacted_in_debug() {
        let secrets = LeaseSecrets::new([1; 32], [2; 32]);
        assert_eq!(format!("{secrets:?}"), "LeaseSecrets(..)");
    }

    #[test]
    fn storage_index_serializes_as_hex() {
        let si = StorageIndex::new([0x01; 16]);
        let json = serde_json::to_string(&si).unwrap();
        assert_eq!(json, format!("\"{}\"", "01".repeat(16)));
        let back: StorageIndex = serde_json::from_str(&json).unwrap();
        assert_eq!(back, si);
        assert!(serde_json::from_str::<StorageIndex>("\"zz\"").is_err());
    }

    #[test]
    fn writability_uses_kebab_case() {
        let json = serde_json::to_string(&Writability::ReadOnly).unwrap();
        assert_eq!(json, "\"read-only\"");
    }
}
