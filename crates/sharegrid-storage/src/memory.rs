//! MemoryStorageServer: an in-process storage server.
//!
//! Keeps buckets in a map keyed by storage index. Capacity is charged
//! per allocated bucket, or per written byte when the server is
//! configured to overcommit (accept every reservation and discover the
//! shortage on write). Availability can be switched to simulate
//! unreachable peers.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{StorageError, StorageResult};
use crate::server::StorageServer;
use crate::types::*;

/// Whether calls reach the server at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Availability {
    #[default]
    Online,
    /// Every call fails with a connection error.
    Offline,
    /// Every call never completes.
    Hanging,
}

/// Per-operation call counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub queries: usize,
    pub allocations: usize,
    pub writes: usize,
    pub closes: usize,
    pub reads: usize,
    pub aborts: usize,
    /// Every share offered through `allocate_buckets`, in call order.
    pub offered: Vec<(StorageIndex, ShareIndex)>,
}

#[derive(Debug)]
struct Bucket {
    data: Vec<u8>,
    allocated_size: u64,
    closed: bool,
    /// Bytes charged against capacity for this bucket.
    charged: u64,
}

#[derive(Debug, Default)]
struct Inner {
    availability: Availability,
    read_only: bool,
    capacity: Option<u64>,
    overcommit: bool,
    used: u64,
    buckets: HashMap<StorageIndex, BTreeMap<ShareIndex, Bucket>>,
    calls: CallCounts,
}

impl Inner {
    fn remaining(&self) -> Option<u64> {
        self.capacity.map(|cap| cap.saturating_sub(self.used))
    }

    fn writability(&self) -> Writability {
        if self.read_only {
            Writability::ReadOnly
        } else if self.remaining() == Some(0) {
            Writability::Full
        } else {
            Writability::Writable
        }
    }

    fn bucket_mut(
        &mut self,
        storage_index: &StorageIndex,
        share: ShareIndex,
    ) -> StorageResult<&mut Bucket> {
        self.buckets
            .get_mut(storage_index)
            .and_then(|shares| shares.get_mut(&share))
            .ok_or(StorageError::NoBucket(share))
    }
}

/// Thread-safe in-memory storage server.
#[derive(Debug, Default)]
pub struct MemoryStorageServer {
    inner: Mutex<Inner>,
}

impl MemoryStorageServer {
    /// An online, writable server with unlimited capacity.
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse every new allocation.
    pub fn read_only(mut self) -> Self {
        self.inner.get_mut().read_only = true;
        self
    }

    /// Limit the bytes this server will store.
    pub fn with_capacity(mut self, bytes: u64) -> Self {
        self.inner.get_mut().capacity = Some(bytes);
        self
    }

    /// Accept every reservation and enforce capacity on write instead.
    pub fn overcommitting(mut self) -> Self {
        self.inner.get_mut().overcommit = true;
        self
    }

    pub fn with_availability(mut self, availability: Availability) -> Self {
        self.inner.get_mut().availability = availability;
        self
    }

    /// Preload a closed share, as if an earlier upload had written it.
    pub fn with_share(mut self, storage_index: StorageIndex, share: ShareIndex, data: &[u8]) -> Self {
        let inner = self.inner.get_mut();
        let size = data.len() as u64;
        inner.used += size;
        inner.buckets.entry(storage_index).or_default().insert(
            share,
            Bucket {
                data: data.to_vec(),
                allocated_size: size,
                closed: true,
                charged: size,
            },
        );
        self
    }

    pub async fn set_availability(&self, availability: Availability) {
        self.inner.lock().await.availability = availability;
    }

    /// Snapshot of the call counters.
    pub async fn calls(&self) -> CallCounts {
        self.inner.lock().await.calls.clone()
    }

    /// Bytes currently charged against capacity.
    pub async fn used_bytes(&self) -> u64 {
        self.inner.lock().await.used
    }

    /// Shares with an open (allocated but unclosed) bucket.
    pub async fn open_buckets(&self, storage_index: &StorageIndex) -> BTreeSet<ShareIndex> {
        let inner = self.inner.lock().await;
        inner
            .buckets
            .get(storage_index)
            .map(|shares| {
                shares
                    .iter()
                    .filter(|(_, b)| !b.closed)
                    .map(|(share, _)| *share)
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn gate(&self) -> StorageResult<()> {
        let availability = self.inner.lock().await.availability;
        match availability {
            Availability::Online => Ok(()),
            Availability::Offline => Err(StorageError::Connection("server offline".to_string())),
            Availability::Hanging => std::future::pending().await,
        }
    }
}

impl StorageServer for MemoryStorageServer {
    async fn query_held_shares(&self, storage_index: &StorageIndex) -> StorageResult<HeldShares> {
        self.gate().await?;
        let mut inner = self.inner.lock().await;
        inner.calls.queries += 1;

        let shares = inner
            .buckets
            .get(storage_index)
            .map(|shares| {
                shares
                    .iter()
                    .filter(|(_, b)| b.closed)
                    .map(|(share, _)| *share)
                    .collect()
            })
            .unwrap_or_default();

        Ok(HeldShares {
            shares,
            writability: inner.writability(),
        })
    }

    async fn allocate_buckets(
        &self,
        storage_index: &StorageIndex,
        _secrets: &LeaseSecrets,
        shares: &BTreeSet<ShareIndex>,
        allocated_size: u64,
    ) -> StorageResult<Allocation> {
        self.gate().await?;
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        inner.calls.allocations += 1;
        inner
            .calls
            .offered
            .extend(shares.iter().map(|share| (*storage_index, *share)));

        let mut allocation = Allocation::default();
        for &share in shares {
            if let Some(existing) = inner.buckets.get(storage_index).and_then(|b| b.get(&share)) {
                if existing.closed {
                    allocation.already_held.insert(share);
                } else {
                    // Re-allocating an open bucket returns the same answer.
                    allocation.allocated.insert(share);
                }
                continue;
            }
            if inner.read_only {
                continue;
            }

            let charged = if inner.overcommit { 0 } else { allocated_size };
            if let Some(remaining) = inner.remaining() {
                if charged > remaining || (!inner.overcommit && remaining == 0) {
                    continue;
                }
            }

            inner.used += charged;
            inner.buckets.entry(*storage_index).or_default().insert(
                share,
                Bucket {
                    data: Vec::new(),
                    allocated_size,
                    closed: false,
                    charged,
                },
            );
            allocation.allocated.insert(share);
        }

        allocation.writability = inner.writability();
        debug!(
            %storage_index,
            requested = shares.len(),
            allocated = allocation.allocated.len(),
            already_held = allocation.already_held.len(),
            "buckets allocated"
        );
        Ok(allocation)
    }

    async fn write_share(
        &self,
        storage_index: &StorageIndex,
        share: ShareIndex,
        offset: u64,
        data: Bytes,
    ) -> StorageResult<()> {
        self.gate().await?;
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        inner.calls.writes += 1;

        let overcommit = inner.overcommit;
        let remaining = inner.remaining();
        let bucket = inner.bucket_mut(storage_index, share)?;
        if bucket.closed {
            return Err(StorageError::AlreadyClosed(share));
        }

        let len = data.len() as u64;
        let end = offset + len;
        if end > bucket.allocated_size {
            return Err(StorageError::OutOfBounds {
                offset,
                len,
                allocated: bucket.allocated_size,
            });
        }

        let growth = end.saturating_sub(bucket.data.len() as u64);
        if overcommit && remaining.is_some_and(|r| growth > r) {
            return Err(StorageError::Full);
        }

        let (start, end) = (offset as usize, end as usize);
        if bucket.data.len() < end {
            bucket.data.resize(end, 0);
        }
        bucket.data[start..end].copy_from_slice(&data);

        if overcommit {
            bucket.charged += growth;
            inner.used += growth;
        }
        Ok(())
    }

    async fn close_share(&self, storage_index: &StorageIndex, share: ShareIndex) -> StorageResult<()> {
        self.gate().await?;
        let mut inner = self.inner.lock().await;
        inner.calls.closes += 1;
        let bucket = inner.bucket_mut(storage_index, share)?;
        bucket.closed = true;
        Ok(())
    }

    async fn read_share(
        &self,
        storage_index: &StorageIndex,
        share: ShareIndex,
        offset: u64,
        length: u64,
    ) -> StorageResult<Bytes> {
        self.gate().await?;
        let mut inner = self.inner.lock().await;
        inner.calls.reads += 1;

        let bucket = inner
            .buckets
            .get(storage_index)
            .and_then(|shares| shares.get(&share))
            .filter(|b| b.closed)
            .ok_or(StorageError::NotFound(share))?;

        let len = bucket.data.len();
        let start = (offset as usize).min(len);
        let end = (offset.saturating_add(length) as usize).min(len);
        Ok(Bytes::copy_from_slice(&bucket.data[start..end]))
    }

    async fn abort(&self, storage_index: &StorageIndex) -> StorageResult<usize> {
        self.gate().await?;
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        inner.calls.aborts += 1;

        let Some(shares) = inner.buckets.get_mut(storage_index) else {
            return Ok(0);
        };
        let open: Vec<ShareIndex> = shares
            .iter()
            .filter(|(_, b)| !b.closed)
            .map(|(share, _)| *share)
            .collect();
        let mut released = 0;
        for share in &open {
            if let Some(bucket) = shares.remove(share) {
                released += bucket.charged;
            }
        }
        if shares.is_empty() {
            inner.buckets.remove(storage_index);
        }
        inner.used = inner.used.saturating_sub(released);

        debug!(%storage_index, buckets = open.len(), "open buckets released");
        Ok(open.len())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn si(byte: u8) -> StorageIndex {
        StorageIndex::new([byte; 16])
    }

    fn set(shares: impl IntoIterator<Item = ShareIndex>) -> BTreeSet<ShareIndex> {
        shares.into_iter().collect()
    }

    #[tokio::test]
    async fn allocate_on_new_index_returns_all_shares() {
        let server = MemoryStorageServer::new();
        let alloc = server
            .allocate_buckets(&si(1), &LeaseSecrets::default(), &set(0..5), 1024)
            .await
            .unwrap();

        assert!(alloc.already_held.is_empty());
        assert_eq!(alloc.allocated, set(0..5));
    }

    #[tokio::test]
    async fn repeated_allocation_before_writes_is_stable() {
        let server = MemoryStorageServer::new();
        let secrets = LeaseSecrets::default();
        let first = server.allocate_buckets(&si(1), &secrets, &set(0..5), 1024).await.unwrap();
        let second = server.allocate_buckets(&si(1), &secrets, &set(0..5), 1024).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn only_closed_shares_count_as_held() {
        let server = MemoryStorageServer::new();
        let secrets = LeaseSecrets::default();
        server.allocate_buckets(&si(2), &secrets, &set(0..5), 1024).await.unwrap();

        // Share 1 in one go, share 2 in two steps, share 0 left partial.
        server.write_share(&si(2), 1, 0, Bytes::from(vec![b'1'; 1024])).await.unwrap();
        server.close_share(&si(2), 1).await.unwrap();
        server.write_share(&si(2), 2, 0, Bytes::from(vec![b'1'; 512])).await.unwrap();
        server.write_share(&si(2), 2, 512, Bytes::from(vec![b'2'; 512])).await.unwrap();
        server.close_share(&si(2), 2).await.unwrap();
        server.write_share(&si(2), 0, 0, Bytes::from(vec![b'1'; 512])).await.unwrap();

        let alloc = server.allocate_buckets(&si(2), &secrets, &set(0..5), 1024).await.unwrap();
        assert_eq!(alloc.already_held, set([1, 2]));

        let held = server.query_held_shares(&si(2)).await.unwrap();
        assert_eq!(held.shares, set([1, 2]));
        assert_eq!(held.writability, Writability::Writable);
    }

    #[tokio::test]
    async fn writes_land_by_offset_and_latest_wins() {
        let server = MemoryStorageServer::new();
        let secrets = LeaseSecrets::default();
        server.allocate_buckets(&si(3), &secrets, &set([1, 2, 3]), 1024).await.unwrap();

        server.write_share(&si(3), 2, 512, Bytes::from(vec![b'4'; 512])).await.unwrap();
        server.write_share(&si(3), 2, 0, Bytes::from(vec![b'3'; 512])).await.unwrap();
        server.close_share(&si(3), 2).await.unwrap();

        server.write_share(&si(3), 3, 0, Bytes::from(vec![b'5'; 20])).await.unwrap();
        server.write_share(&si(3), 3, 0, Bytes::from(vec![b'6'; 24])).await.unwrap();
        server.write_share(&si(3), 3, 24, Bytes::from(vec![b'7'; 1000])).await.unwrap();
        server.close_share(&si(3), 3).await.unwrap();

        let two = server.read_share(&si(3), 2, 0, 1024).await.unwrap();
        let mut expected = vec![b'3'; 512];
        expected.extend(vec![b'4'; 512]);
        assert_eq!(two.as_ref(), expected.as_slice());

        let three = server.read_share(&si(3), 3, 0, 1024).await.unwrap();
        let mut expected = vec![b'6'; 24];
        expected.extend(vec![b'7'; 1000]);
        assert_eq!(three.as_ref(), expected.as_slice());

        // Share 1 was never closed.
        assert_eq!(
            server.read_share(&si(3), 1, 0, 10).await,
            Err(StorageError::NotFound(1))
        );
    }

    #[tokio::test]
    async fn reads_past_the_end_are_truncated() {
        let server = MemoryStorageServer::new().with_share(si(4), 0, b"abcdefg");
        assert_eq!(server.read_share(&si(4), 0, 6, 8).await.unwrap().as_ref(), b"g");
        assert!(server.read_share(&si(4), 0, 100, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn write_beyond_allocation_is_rejected() {
        let server = MemoryStorageServer::new();
        server
            .allocate_buckets(&si(5), &LeaseSecrets::default(), &set([0]), 4)
            .await
            .unwrap();
        let err = server.write_share(&si(5), 0, 2, Bytes::from_static(b"xyz")).await;
        assert!(matches!(err, Err(StorageError::OutOfBounds { .. })));
    }

    #[tokio::test]
    async fn read_only_server_allocates_nothing() {
        let server = MemoryStorageServer::new().read_only();
        let alloc = server
            .allocate_buckets(&si(6), &LeaseSecrets::default(), &set(0..3), 10)
            .await
            .unwrap();
        assert!(alloc.allocated.is_empty());
        let held = server.query_held_shares(&si(6)).await.unwrap();
        assert_eq!(held.writability, Writability::ReadOnly);
    }

    #[tokio::test]
    async fn capacity_limits_allocation() {
        let server = MemoryStorageServer::new().with_capacity(25);
        let alloc = server
            .allocate_buckets(&si(7), &LeaseSecrets::default(), &set(0..5), 10)
            .await
            .unwrap();
        assert_eq!(alloc.allocated, set([0, 1]));
        assert_eq!(server.used_bytes().await, 20);
    }

    #[tokio::test]
    async fn overcommitted_server_rejects_on_write() {
        let server = MemoryStorageServer::new().with_capacity(4).overcommitting();
        let alloc = server
            .allocate_buckets(&si(8), &LeaseSecrets::default(), &set([0, 1]), 4)
            .await
            .unwrap();
        assert_eq!(alloc.allocated, set([0, 1]));

        server.write_share(&si(8), 0, 0, Bytes::from_static(b"abcd")).await.unwrap();
        let err = server.write_share(&si(8), 1, 0, Bytes::from_static(b"efgh")).await;
        assert_eq!(err, Err(StorageError::Full));
        assert_eq!(
            server.query_held_shares(&si(8)).await.unwrap().writability,
            Writability::Full
        );
    }

    #[tokio::test]
    async fn abort_releases_only_open_buckets() {
        let server = MemoryStorageServer::new().with_capacity(100);
        server
            .allocate_buckets(&si(9), &LeaseSecrets::default(), &set([0, 1, 2]), 10)
            .await
            .unwrap();
        server.write_share(&si(9), 0, 0, Bytes::from(vec![0; 10])).await.unwrap();
        server.close_share(&si(9), 0).await.unwrap();

        assert_eq!(server.abort(&si(9)).await.unwrap(), 2);
        assert!(server.open_buckets(&si(9)).await.is_empty());
        assert_eq!(server.used_bytes().await, 10);
        assert_eq!(server.query_held_shares(&si(9)).await.unwrap().shares, set([0]));
    }

    #[tokio::test]
    async fn offline_server_fails_every_call() {
        let server = MemoryStorageServer::new().with_availability(Availability::Offline);
        let err = server.query_held_shares(&si(1)).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn hanging_server_never_answers() {
        let server = MemoryStorageServer::new().with_availability(Availability::Hanging);
        let result =
            tokio::time::timeout(Duration::from_millis(20), server.query_held_shares(&si(1))).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn offered_shares_are_recorded() {
        let server = MemoryStorageServer::new();
        server
            .allocate_buckets(&si(1), &LeaseSecrets::default(), &set([3, 4]), 1)
            .await
            .unwrap();
        let calls = server.calls().await;
        assert_eq!(calls.allocations, 1);
        assert_eq!(calls.offered, vec![(si(1), 3), (si(1), 4)]);
    }
}
