//! File → shares.
//!
//! The file is zero-padded and split into `needed` data shares, and
//! Reed-Solomon parity fills the remaining `total - needed`. The storage
//! index is the leading half of the content's SHA-256.

use anyhow::Context;
use bytes::Bytes;
use reed_solomon_erasure::galois_8::ReedSolomon;
use sha2::{Digest, Sha256};

use sharegrid_placement::EncodingParams;
use sharegrid_storage::StorageIndex;

pub fn storage_index_for(data: &[u8]) -> StorageIndex {
    let digest = Sha256::digest(data);
    let mut bytes = [0u8; StorageIndex::LEN];
    bytes.copy_from_slice(&digest[..StorageIndex::LEN]);
    StorageIndex::new(bytes)
}

/// Encode `data` into `encoding.total` equally sized shares.
pub fn encode(data: &[u8], encoding: &EncodingParams) -> anyhow::Result<Vec<Bytes>> {
    let needed = encoding.needed as usize;
    let parity = (encoding.total - encoding.needed) as usize;
    let share_size = data.len().div_ceil(needed).max(1);

    let mut shares: Vec<Vec<u8>> = (0..needed)
        .map(|i| {
            let start = (i * share_size).min(data.len());
            let end = (start + share_size).min(data.len());
            let mut share = data[start..end].to_vec();
            share.resize(share_size, 0);
            share
        })
        .collect();

    if parity > 0 {
        shares.resize(needed + parity, vec![0; share_size]);
        let coder = ReedSolomon::new(needed, parity)
            .with_context(|| format!("unsupported encoding {needed}-of-{}", encoding.total))?;
        coder.encode(&mut shares).context("erasure coding failed")?;
    }

    Ok(shares.into_iter().map(Bytes::from).collect())
}
