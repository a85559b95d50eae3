//! The capability-set interface of one storage server.
//!
//! Transport, authentication and secret handling live behind this trait.
//! Implementations must tolerate concurrent calls from independent
//! uploads; serializing calls for the same storage index is their job.

use std::collections::BTreeSet;
use std::future::Future;

use bytes::Bytes;

use crate::error::StorageResult;
use crate::types::{Allocation, HeldShares, LeaseSecrets, ShareIndex, StorageIndex};

/// Operations an uploader may invoke on a storage server.
pub trait StorageServer: Send + Sync {
    /// Which shares of `storage_index` the server holds, and whether it
    /// accepts new ones.
    fn query_held_shares(
        &self,
        storage_index: &StorageIndex,
    ) -> impl Future<Output = StorageResult<HeldShares>> + Send;

    /// Reserve buckets of `allocated_size` bytes for `shares`.
    fn allocate_buckets(
        &self,
        storage_index: &StorageIndex,
        secrets: &LeaseSecrets,
        shares: &BTreeSet<ShareIndex>,
        allocated_size: u64,
    ) -> impl Future<Output = StorageResult<Allocation>> + Send;

    /// Write `data` at `offset` into an open bucket.
    fn write_share(
        &self,
        storage_index: &StorageIndex,
        share: ShareIndex,
        offset: u64,
        data: Bytes,
    ) -> impl Future<Output = StorageResult<()>> + Send;

    /// Seal a bucket. A closed share is held and readable.
    fn close_share(
        &self,
        storage_index: &StorageIndex,
        share: ShareIndex,
    ) -> impl Future<Output = StorageResult<()>> + Send;

    /// Read up to `length` bytes of a closed share starting at `offset`.
    fn read_share(
        &self,
        storage_index: &StorageIndex,
        share: ShareIndex,
        offset: u64,
        length: u64,
    ) -> impl Future<Output = StorageResult<Bytes>> + Send;

    /// Release every bucket of `storage_index` that has not been closed.
    /// Returns the number of buckets released.
    fn abort(&self, storage_index: &StorageIndex)
    -> impl Future<Output = StorageResult<usize>> + Send;
}
