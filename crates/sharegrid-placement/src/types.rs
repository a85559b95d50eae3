//! Upload parameters and per-server planning records.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::warn;

use sharegrid_storage::{ServerId, ShareIndex, StorageIndex, Writability};

use crate::error::{PlacementError, PlacementResult};

/// Erasure-coding shape of an upload: `needed`-of-`total`, with at least
/// `happy` servers required to hold distinct shares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EncodingParams {
    /// Shares needed to reconstruct (K).
    pub needed: u32,
    /// Happiness threshold (H).
    pub happy: u32,
    /// Total shares produced (N).
    pub total: u32,
}

impl Default for EncodingParams {
    fn default() -> Self {
        Self {
            needed: 3,
            happy: 7,
            total: 10,
        }
    }
}

impl EncodingParams {
    pub fn new(needed: u32, happy: u32, total: u32) -> Self {
        Self { needed, happy, total }
    }

    /// Check `1 <= needed <= total` and `1 <= happy <= total`.
    ///
    /// A `happy` below `needed` is accepted, but logged: such an upload
    /// can be "happy" without being recoverable.
    pub fn validate(&self) -> PlacementResult<()> {
        if self.total == 0 {
            return Err(PlacementError::InvalidParams(
                "total shares must be at least 1".to_string(),
            ));
        }
        if self.needed == 0 || self.needed > self.total {
            return Err(PlacementError::InvalidParams(format!(
                "shares needed ({}) must be between 1 and total shares ({})",
                self.needed, self.total
            )));
        }
        if self.happy == 0 || self.happy > self.total {
            return Err(PlacementError::InvalidParams(format!(
                "happiness threshold ({}) must be between 1 and total shares ({})",
                self.happy, self.total
            )));
        }
        if self.happy < self.needed {
            warn!(
                needed = self.needed,
                happy = self.happy,
                "happiness threshold is below shares needed"
            );
        }
        Ok(())
    }
}

/// What one upload asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadParams {
    pub storage_index: StorageIndex,
    pub encoding: EncodingParams,
}

impl UploadParams {
    pub fn new(storage_index: StorageIndex, encoding: EncodingParams) -> Self {
        Self {
            storage_index,
            encoding,
        }
    }
}

/// A server's standing within one upload attempt.
///
/// States only ever move toward more restrictive ones during an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServerState {
    Writable,
    ReadOnly,
    Full,
    Unreachable,
}

impl ServerState {
    fn restriction(self) -> u8 {
        match self {
            ServerState::Writable => 0,
            ServerState::ReadOnly | ServerState::Full => 1,
            ServerState::Unreachable => 2,
        }
    }

    /// Can receive new shares.
    pub fn is_writable(self) -> bool {
        self == ServerState::Writable
    }

    /// Existing shares on this server count toward happiness.
    pub fn is_reachable(self) -> bool {
        self != ServerState::Unreachable
    }

    /// Move to `to` if it is strictly more restrictive. Returns whether
    /// the state changed.
    pub fn demote(&mut self, to: ServerState) -> bool {
        if to.restriction() > self.restriction() {
            *self = to;
            true
        } else {
            false
        }
    }
}

impl From<Writability> for ServerState {
    fn from(w: Writability) -> Self {
        match w {
            Writability::Writable => ServerState::Writable,
            Writability::ReadOnly => ServerState::ReadOnly,
            Writability::Full => ServerState::Full,
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ServerState::Writable => "writable",
            ServerState::ReadOnly => "read-only",
            ServerState::Full => "full",
            ServerState::Unreachable => "unreachable",
        })
    }
}

/// Position of a server on the permuted ring of one storage index.
///
/// Lower ranks sort first and are preferred.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServerRank([u8; 32]);

impl ServerRank {
    pub fn new(server_id: &str, storage_index: &StorageIndex) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(server_id.as_bytes());
        hasher.update(storage_index.as_bytes());
        Self(hasher.finalize().into())
    }
}

impl fmt::Debug for ServerRank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServerRank({})", hex::encode(&self.0[..6]))
    }
}

/// Everything the planner knows about one server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerRecord {
    pub id: ServerId,
    pub state: ServerState,
    /// Shares of this storage index the server holds in full.
    pub held: BTreeSet<ShareIndex>,
    pub rank: ServerRank,
}

impl ServerRecord {
    pub fn new(id: impl Into<ServerId>, state: ServerState, storage_index: &StorageIndex) -> Self {
        let id = id.into();
        let rank = ServerRank::new(&id, storage_index);
        Self {
            id,
            state,
            held: BTreeSet::new(),
            rank,
        }
    }

    pub fn with_held(mut self, shares: impl IntoIterator<Item = ShareIndex>) -> Self {
        self.held.extend(shares);
        self
    }
}

/// Rank order: ascending rank, ties broken by id.
pub fn rank_order(a: &ServerRecord, b: &ServerRecord) -> Ordering {
    a.rank.cmp(&b.rank).then_with(|| a.id.cmp(&b.id))
}

/// Sort records into rank order.
pub fn sort_by_rank(records: &mut [ServerRecord]) {
    records.sort_by(rank_order);
}

/// A server offered to the selector by the caller.
#[derive(Debug)]
pub struct Candidate<S> {
    pub id: ServerId,
    pub server: Arc<S>,
    /// Caller's prior knowledge of the server's state. The more
    /// restrictive of hint and queried state wins.
    pub hint: Option<ServerState>,
}

impl<S> Clone for Candidate<S> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            server: Arc::clone(&self.server),
            hint: self.hint,
        }
    }
}

impl<S> Candidate<S> {
    pub fn new(id: impl Into<ServerId>, server: Arc<S>) -> Self {
        Self {
            id: id.into(),
            server,
            hint: None,
        }
    }

    pub fn with_hint(mut self, hint: ServerState) -> Self {
        self.hint = Some(hint);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn si() -> StorageIndex {
        StorageIndex::new([9; 16])
    }

    #[test]
    fn default_params_are_three_of_ten_happy_seven() {
        let params = EncodingParams::default();
        assert_eq!((params.needed, params.happy, params.total), (3, 7, 10));
        assert!(params.validate().is_ok());
    }

    #[test]
    fn rejects_zero_total() {
        assert!(EncodingParams::new(1, 1, 0).validate().is_err());
    }

    #[test]
    fn rejects_needed_above_total() {
        assert!(EncodingParams::new(5, 4, 4).validate().is_err());
    }

    #[test]
    fn rejects_happy_above_total() {
        assert!(EncodingParams::new(2, 5, 4).validate().is_err());
        assert!(EncodingParams::new(2, 0, 4).validate().is_err());
    }

    #[test]
    fn happy_below_needed_is_permitted() {
        assert!(EncodingParams::new(3, 2, 10).validate().is_ok());
    }

    #[test]
    fn demotion_only_tightens() {
        let mut state = ServerState::Writable;
        assert!(state.demote(ServerState::Full));
        assert_eq!(state, ServerState::Full);

        assert!(!state.demote(ServerState::Writable));
        assert!(!state.demote(ServerState::ReadOnly));
        assert_eq!(state, ServerState::Full);

        assert!(state.demote(ServerState::Unreachable));
        assert!(!state.demote(ServerState::Full));
        assert_eq!(state, ServerState::Unreachable);
    }

    #[test]
    fn rank_depends_on_storage_index() {
        let a = ServerRank::new("v0-server", &StorageIndex::new([1; 16]));
        let b = ServerRank::new("v0-server", &StorageIndex::new([2; 16]));
        assert_ne!(a, b);
        assert_eq!(a, ServerRank::new("v0-server", &StorageIndex::new([1; 16])));
    }

    #[test]
    fn sort_is_independent_of_input_order() {
        let ids = ["alpha", "bravo", "charlie", "delta", "echo"];
        let mut forward: Vec<ServerRecord> = ids
            .iter()
            .map(|id| ServerRecord::new(*id, ServerState::Writable, &si()))
            .collect();
        let mut backward: Vec<ServerRecord> = forward.iter().rev().cloned().collect();

        sort_by_rank(&mut forward);
        sort_by_rank(&mut backward);
        assert_eq!(forward, backward);
    }

    #[test]
    fn writability_maps_to_state() {
        assert_eq!(ServerState::from(Writability::ReadOnly), ServerState::ReadOnly);
        assert_eq!(ServerState::from(Writability::Full), ServerState::Full);
        assert!(ServerState::from(Writability::Writable).is_writable());
    }
}
