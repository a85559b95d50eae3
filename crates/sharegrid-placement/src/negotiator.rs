//! AllocationNegotiator: reserve, write, close and abort against one
//! server.
//!
//! Every call is bounded by the negotiation timeout. Failures are
//! classified into [`ServerFault`] so the selector can decide how to
//! demote the server without looking at raw storage errors.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tracing::debug;

use sharegrid_storage::{
    LeaseSecrets, ServerId, ShareIndex, StorageError, StorageIndex, StorageResult, StorageServer,
    Writability,
};

use crate::types::ServerState;

/// Why a server refused shares it was asked to take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Full,
    ReadOnly,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RejectReason::Full => "full",
            RejectReason::ReadOnly => "read-only",
        })
    }
}

impl From<Writability> for RejectReason {
    fn from(w: Writability) -> Self {
        match w {
            Writability::ReadOnly => RejectReason::ReadOnly,
            // A server that refuses while still claiming to be writable
            // has run out of room for this request.
            Writability::Writable | Writability::Full => RejectReason::Full,
        }
    }
}

/// A negotiation failure, classified.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServerFault {
    /// Could not reach the server (connection error or timeout).
    #[error("transient failure: {0}")]
    Transient(StorageError),

    /// The server answered and refused.
    #[error("server is {0}")]
    Rejected(RejectReason),

    /// The server answered with something the protocol does not allow.
    #[error("protocol error: {0}")]
    Protocol(StorageError),
}

impl From<StorageError> for ServerFault {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Connection(_) | StorageError::Timeout(_) => ServerFault::Transient(err),
            StorageError::Full => ServerFault::Rejected(RejectReason::Full),
            StorageError::ReadOnly => ServerFault::Rejected(RejectReason::ReadOnly),
            other => ServerFault::Protocol(other),
        }
    }
}

impl ServerFault {
    /// The state the server drops to after this fault.
    pub fn demoted_state(&self) -> ServerState {
        match self {
            ServerFault::Transient(_) | ServerFault::Protocol(_) => ServerState::Unreachable,
            ServerFault::Rejected(RejectReason::Full) => ServerState::Full,
            ServerFault::Rejected(RejectReason::ReadOnly) => ServerState::ReadOnly,
        }
    }
}

/// Result of one reservation request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReserveOutcome {
    /// Open buckets, ready for writes.
    pub accepted: BTreeSet<ShareIndex>,
    /// Already stored in full. Counts as accepted and needs no write.
    pub already_held: BTreeSet<ShareIndex>,
    /// Requested but refused.
    pub rejected: BTreeSet<ShareIndex>,
    /// Set whenever `rejected` is non-empty.
    pub reason: Option<RejectReason>,
}

/// Negotiates share buckets with a single storage server.
pub struct AllocationNegotiator<S> {
    server_id: ServerId,
    server: Arc<S>,
    timeout: Duration,
    secrets: LeaseSecrets,
    allocated_size: u64,
}

impl<S: StorageServer> AllocationNegotiator<S> {
    pub fn new(server_id: impl Into<ServerId>, server: Arc<S>, allocated_size: u64) -> Self {
        Self {
            server_id: server_id.into(),
            server,
            timeout: Duration::from_secs(60),
            secrets: LeaseSecrets::default(),
            allocated_size,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_secrets(mut self, secrets: LeaseSecrets) -> Self {
        self.secrets = secrets;
        self
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Ask the server for buckets for `shares`.
    pub async fn reserve(
        &self,
        storage_index: &StorageIndex,
        shares: &BTreeSet<ShareIndex>,
    ) -> Result<ReserveOutcome, ServerFault> {
        let allocation = with_timeout(
            self.timeout,
            self.server
                .allocate_buckets(storage_index, &self.secrets, shares, self.allocated_size),
        )
        .await?;

        let accepted: BTreeSet<ShareIndex> =
            allocation.allocated.intersection(shares).copied().collect();
        let already_held: BTreeSet<ShareIndex> = allocation
            .already_held
            .intersection(shares)
            .filter(|share| !accepted.contains(*share))
            .copied()
            .collect();
        let rejected: BTreeSet<ShareIndex> = shares
            .iter()
            .filter(|share| !accepted.contains(*share) && !already_held.contains(*share))
            .copied()
            .collect();
        let reason = (!rejected.is_empty()).then(|| RejectReason::from(allocation.writability));

        debug!(
            server = %self.server_id,
            accepted = accepted.len(),
            already_held = already_held.len(),
            rejected = rejected.len(),
            "reservation answered"
        );
        Ok(ReserveOutcome {
            accepted,
            already_held,
            rejected,
            reason,
        })
    }

    /// Write a whole share into its reserved bucket. The bucket stays
    /// open, so [`abort`](Self::abort) can still release it.
    ///
    /// Safe to re-issue: a share the server already closed is success.
    pub async fn write(
        &self,
        storage_index: &StorageIndex,
        share: ShareIndex,
        data: Bytes,
    ) -> Result<(), ServerFault> {
        let written = with_timeout(
            self.timeout,
            self.server.write_share(storage_index, share, 0, data),
        )
        .await;
        match written {
            Ok(()) | Err(StorageError::AlreadyClosed(_)) => {
                debug!(server = %self.server_id, share, "share written");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Seal a written share. After this the server holds it for good.
    pub async fn close(
        &self,
        storage_index: &StorageIndex,
        share: ShareIndex,
    ) -> Result<(), ServerFault> {
        with_timeout(self.timeout, self.server.close_share(storage_index, share)).await?;
        debug!(server = %self.server_id, share, "share closed");
        Ok(())
    }

    /// Release every reservation on this server that was not written.
    pub async fn abort(&self, storage_index: &StorageIndex) -> Result<usize, ServerFault> {
        let released = with_timeout(self.timeout, self.server.abort(storage_index)).await?;
        debug!(server = %self.server_id, released, "reservations aborted");
        Ok(released)
    }
}

/// Bound a storage call by `timeout`, reporting expiry as
/// [`StorageError::Timeout`].
pub(crate) async fn with_timeout<T>(
    timeout: Duration,
    call: impl Future<Output = StorageResult<T>>,
) -> StorageResult<T> {
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| StorageError::Timeout(timeout))?
}
