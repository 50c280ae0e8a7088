//! Staging area for shard artifacts.
//!
//! The [`ArtifactStore`] holds at most one [`CoverageArtifact`] per shard
//! index until the run is ready to merge. It is an explicit object handed to
//! whoever needs it (usually behind an `Arc`), never global state, so merge
//! logic can be tested without real concurrency.
//!
//! [`put`](ArtifactStore::put) is the only mutation and is safe to call from
//! every in-flight shard at once. A second `put` for the same shard replaces
//! the first. Nothing is ever removed during a run.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use shardcov::coverage::{ArtifactStatus, CoverageArtifact};
//! use shardcov::store::ArtifactStore;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let store = ArtifactStore::new(2);
//! store.put(1, CoverageArtifact::new(1, ArtifactStatus::Success));
//! assert!(!store.snapshot().complete);
//!
//! store.put(2, CoverageArtifact::new(2, ArtifactStatus::Success));
//! let snapshot = store.wait_for_all(Duration::from_secs(1)).await;
//! assert!(snapshot.complete);
//! # }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::coverage::CoverageArtifact;

/// Which shards have delivered, at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSnapshot {
    /// Every shard index with an artifact, including out-of-range ones.
    pub collected: BTreeSet<usize>,

    /// Whether every index in 1..=N has an artifact.
    pub complete: bool,
}

/// Thread-safe, per-shard artifact staging.
pub struct ArtifactStore {
    expected: usize,
    artifacts: Mutex<BTreeMap<usize, CoverageArtifact>>,
    /// Bumped on every `put`; observers wait on changes.
    arrivals: watch::Sender<u64>,
}

impl ArtifactStore {
    /// Creates an empty store expecting shards 1..=`expected`.
    pub fn new(expected: usize) -> Self {
        let (arrivals, _) = watch::channel(0);
        Self {
            expected,
            artifacts: Mutex::new(BTreeMap::new()),
            arrivals,
        }
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    /// Stores the artifact for `shard`, replacing any earlier one, and
    /// notifies observers. Returns `true` if an artifact was replaced.
    pub fn put(&self, shard: usize, artifact: CoverageArtifact) -> bool {
        let replaced = self.lock().insert(shard, artifact).is_some();
        if replaced {
            debug!("Replaced artifact for shard {}", shard);
        } else {
            debug!("Stored artifact for shard {}", shard);
        }
        self.arrivals.send_modify(|generation| *generation += 1);
        replaced
    }

    /// Returns the collected shard indices and whether all are present.
    pub fn snapshot(&self) -> StoreSnapshot {
        let collected: BTreeSet<usize> = self.lock().keys().copied().collect();
        let complete = (1..=self.expected).all(|idx| collected.contains(&idx));
        StoreSnapshot {
            collected,
            complete,
        }
    }

    /// Copies out the current artifacts for merging.
    pub fn artifacts(&self) -> BTreeMap<usize, CoverageArtifact> {
        self.lock().clone()
    }

    /// Returns a receiver that changes on every `put`.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.arrivals.subscribe()
    }

    /// Waits until every expected shard has an artifact or `bound` elapses,
    /// then returns the snapshot at that moment.
    pub async fn wait_for_all(&self, bound: Duration) -> StoreSnapshot {
        let mut arrivals = self.subscribe();
        let all_present = async {
            while !self.snapshot().complete {
                if arrivals.changed().await.is_err() {
                    break;
                }
            }
        };

        if tokio::time::timeout(bound, all_present).await.is_err() {
            let snapshot = self.snapshot();
            warn!(
                "Stopped waiting after {:?}: {} of {} shards delivered",
                bound,
                snapshot
                    .collected
                    .iter()
                    .filter(|idx| (1..=self.expected).contains(*idx))
                    .count(),
                self.expected
            );
            return snapshot;
        }
        self.snapshot()
    }

    // A panic while holding the lock cannot leave a half-written entry, so a
    // poisoned map is still usable.
    fn lock(&self) -> MutexGuard<'_, BTreeMap<usize, CoverageArtifact>> {
        self.artifacts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
