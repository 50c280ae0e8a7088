//! Shard partitioning.
//!
//! The [`Partitioner`] assigns every discovered [`TestItem`] to exactly one of
//! N shards. Partitioning is deterministic: the same items in the same order
//! with the same shard count always produce the same [`ShardAssignment`],
//! which is what makes re-running a single failed shard meaningful.
//!
//! # Strategies
//!
//! | Strategy | Placement | Use Case |
//! |----------|-----------|----------|
//! | [`RoundRobin`](PartitionStrategy::RoundRobin) | item i → shard (i mod N) + 1 | Default, even counts |
//! | [`Hash`](PartitionStrategy::Hash) | SHA-256 of the id mod N | Stable as tests are added |
//! | [`CostBalanced`](PartitionStrategy::CostBalanced) | Greedy on estimated cost | Uneven test durations |
//!
//! Within a shard, items always keep their discovery order.
//!
//! # Example
//!
//! ```
//! use shardcov::discovery::TestItem;
//! use shardcov::partition::{PartitionStrategy, Partitioner};
//!
//! let items: Vec<TestItem> = (0..10).map(|i| TestItem::new(format!("test_{}", i))).collect();
//! let assignment = Partitioner::new(4, PartitionStrategy::RoundRobin)?.partition(&items);
//!
//! assert_eq!(assignment.shard_count(), 4);
//! assert_eq!(assignment.shard(1), Some(&["test_0", "test_4", "test_8"].map(String::from)[..]));
//! # Ok::<(), shardcov::config::ConfigurationError>(())
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::ConfigurationError;
use crate::discovery::TestItem;

/// How test items are spread over shards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PartitionStrategy {
    /// Deal items out in discovery order.
    #[default]
    RoundRobin,
    /// Place each item by a stable hash of its id.
    Hash,
    /// Balance estimated cost across shards.
    CostBalanced,
}

/// The shards of one run, indexed 1..=N.
///
/// Every test id appears in exactly one shard and shard indices are
/// contiguous. Trailing shards may be empty when there are fewer tests than
/// shards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardAssignment {
    shards: BTreeMap<usize, Vec<String>>,
}

impl ShardAssignment {
    /// Number of shards, including empty ones.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Test ids of shard `index` (1-based) in discovery order.
    pub fn shard(&self, index: usize) -> Option<&[String]> {
        self.shards.get(&index).map(Vec::as_slice)
    }

    /// Iterates `(index, test ids)` in shard order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &[String])> {
        self.shards.iter().map(|(idx, ids)| (*idx, ids.as_slice()))
    }

    /// Returns the shard a test id was assigned to.
    pub fn shard_of(&self, id: &str) -> Option<usize> {
        self.shards
            .iter()
            .find(|(_, ids)| ids.iter().any(|t| t == id))
            .map(|(idx, _)| *idx)
    }

    /// Total number of assigned test ids.
    pub fn total_tests(&self) -> usize {
        self.shards.values().map(Vec::len).sum()
    }
}

/// Distributes test items over a fixed number of shards.
#[derive(Debug, Clone, Copy)]
pub struct Partitioner {
    shard_count: usize,
    strategy: PartitionStrategy,
}

impl Partitioner {
    /// Creates a partitioner.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::InvalidShardCount`] if `shard_count` is 0.
    pub fn new(shard_count: usize, strategy: PartitionStrategy) -> Result<Self, ConfigurationError> {
        if shard_count == 0 {
            return Err(ConfigurationError::InvalidShardCount(shard_count));
        }
        Ok(Self {
            shard_count,
            strategy,
        })
    }

    pub fn shard_count(&self) -> usize {
        self.shard_count
    }

    /// Partitions `items` into a [`ShardAssignment`].
    pub fn partition(&self, items: &[TestItem]) -> ShardAssignment {
        let placement: Vec<usize> = match self.strategy {
            PartitionStrategy::RoundRobin => (0..items.len()).map(|i| i % self.shard_count).collect(),
            PartitionStrategy::Hash => items
                .iter()
                .map(|item| (stable_hash(&item.id) % self.shard_count as u64) as usize)
                .collect(),
            PartitionStrategy::CostBalanced => self.balance_by_cost(items),
        };

        let mut shards: BTreeMap<usize, Vec<String>> =
            (1..=self.shard_count).map(|idx| (idx, Vec::new())).collect();

        // Walking items in discovery order keeps each shard's order stable.
        for (item, slot) in items.iter().zip(placement) {
            if let Some(shard) = shards.get_mut(&(slot + 1)) {
                shard.push(item.id.clone());
            }
        }

        ShardAssignment { shards }
    }

    /// Longest-processing-time greedy placement; returns a 0-based slot per item.
    fn balance_by_cost(&self, items: &[TestItem]) -> Vec<usize> {
        let mut order: Vec<usize> = (0..items.len()).collect();
        order.sort_by(|&a, &b| {
            let (ca, cb) = (cost_of(&items[a]), cost_of(&items[b]));
            cb.total_cmp(&ca).then(a.cmp(&b))
        });

        let mut loads = vec![0.0f64; self.shard_count];
        let mut placement = vec![0usize; items.len()];
        for idx in order {
            let lightest = loads
                .iter()
                .enumerate()
                .min_by(|(ia, la), (ib, lb)| la.total_cmp(lb).then(ia.cmp(ib)))
                .map(|(slot, _)| slot)
                .unwrap_or(0);
            loads[lightest] += cost_of(&items[idx]);
            placement[idx] = lightest;
        }
        placement
    }
}

fn cost_of(item: &TestItem) -> f64 {
    item.cost.unwrap_or(1.0)
}

fn stable_hash(id: &str) -> u64 {
    let digest = Sha256::digest(id.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}
