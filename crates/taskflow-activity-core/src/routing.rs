use std::collections::BTreeMap;

use tracing::debug;

use crate::{ActivityError, Result};

const FNV32_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV32_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a over raw key bytes. Stable across platforms and releases.
#[must_use]
pub fn fnv1a_32(bytes: &[u8]) -> u32 {
    let mut hash = FNV32_OFFSET_BASIS;
    for byte in bytes {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(FNV32_PRIME);
    }
    hash
}

/// Total mapping from every bucket in `[0, bucket_count)` to a shard index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketMap {
    shard_count: usize,
    shards_by_bucket: Vec<usize>,
}

impl BucketMap {
    /// Round-robin map: bucket `i` lives on shard `i % shard_count`.
    ///
    /// # Errors
    /// Returns [`ActivityError::InvalidShardTopology`] when either count is zero.
    pub fn round_robin(shard_count: usize, bucket_count: usize) -> Result<Self> {
        ensure_counts(shard_count, bucket_count)?;
        Ok(Self {
            shard_count,
            shards_by_bucket: (0..bucket_count).map(|bucket| bucket % shard_count).collect(),
        })
    }

    /// Builds a map from explicit `bucket -> shard` entries.
    ///
    /// # Errors
    /// Returns [`ActivityError::InvalidShardTopology`] when an entry names a
    /// bucket or shard out of range, or when any bucket is left unmapped.
    pub fn from_entries(
        shard_count: usize,
        bucket_count: usize,
        entries: &BTreeMap<usize, usize>,
    ) -> Result<Self> {
        ensure_counts(shard_count, bucket_count)?;

        for (&bucket, &shard) in entries {
            if bucket >= bucket_count {
                return Err(ActivityError::InvalidShardTopology(format!(
                    "invalid bucket_id {bucket}: must be in range [0, {bucket_count})"
                )));
            }
            if shard >= shard_count {
                return Err(ActivityError::InvalidShardTopology(format!(
                    "invalid shard_id {shard} for bucket {bucket}: must be in range [0, {shard_count})"
                )));
            }
        }

        let mut shards_by_bucket = Vec::with_capacity(bucket_count);
        for bucket in 0..bucket_count {
            let Some(&shard) = entries.get(&bucket) else {
                return Err(ActivityError::InvalidShardTopology(format!(
                    "bucket {bucket} has no mapping to shard (expected {bucket_count} buckets, got {})",
                    entries.len()
                )));
            };
            shards_by_bucket.push(shard);
        }

        Ok(Self {
            shard_count,
            shards_by_bucket,
        })
    }

    /// Resolves the configured topology. `bucket_count` defaults to
    /// `shard_count`; an absent or empty mapping falls back to round-robin.
    ///
    /// # Errors
    /// Returns [`ActivityError::InvalidShardTopology`] for invalid topologies.
    pub fn from_config(
        shard_count: usize,
        bucket_count: Option<usize>,
        entries: Option<&BTreeMap<usize, usize>>,
    ) -> Result<Self> {
        let bucket_count = bucket_count.filter(|value| *value > 0).unwrap_or(shard_count);
        match entries {
            Some(entries) if !entries.is_empty() => {
                Self::from_entries(shard_count, bucket_count, entries)
            }
            _ => Self::round_robin(shard_count, bucket_count),
        }
    }

    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.shard_count
    }

    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.shards_by_bucket.len()
    }

    #[must_use]
    pub fn shard_of(&self, bucket: usize) -> Option<usize> {
        self.shards_by_bucket.get(bucket).copied()
    }

    #[must_use]
    pub fn buckets_for_shard(&self, shard: usize) -> Vec<usize> {
        self.shards_by_bucket
            .iter()
            .enumerate()
            .filter(|(_, owner)| **owner == shard)
            .map(|(bucket, _)| bucket)
            .collect()
    }

    #[must_use]
    pub fn entries(&self) -> BTreeMap<usize, usize> {
        self.shards_by_bucket.iter().copied().enumerate().collect()
    }
}

fn ensure_counts(shard_count: usize, bucket_count: usize) -> Result<()> {
    if shard_count == 0 {
        return Err(ActivityError::InvalidShardTopology(
            "shard_count MUST be >= 1".to_string(),
        ));
    }
    if bucket_count == 0 {
        return Err(ActivityError::InvalidShardTopology(
            "bucket_count MUST be >= 1".to_string(),
        ));
    }
    Ok(())
}

/// Partition-key router: `user_id -> bucket -> shard`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketRouter {
    map: BucketMap,
}

impl BucketRouter {
    #[must_use]
    pub fn new(map: BucketMap) -> Self {
        Self { map }
    }

    #[must_use]
    pub fn map(&self) -> &BucketMap {
        &self.map
    }

    #[must_use]
    pub fn bucket_for(&self, user_id: &str) -> usize {
        let hash = u64::from(fnv1a_32(user_id.as_bytes()));
        // bucket_count is validated non-zero and bounded by memory, so the
        // remainder always fits back into usize.
        #[allow(clippy::cast_possible_truncation)]
        let bucket = (hash % self.map.bucket_count() as u64) as usize;
        bucket
    }

    #[must_use]
    pub fn shard_for(&self, user_id: &str) -> usize {
        let bucket = self.bucket_for(user_id);
        // Every bucket below bucket_count has an entry by construction.
        let shard = self.map.shards_by_bucket[bucket];
        debug!(bucket, shard, "routed partition key");
        shard
    }
}
