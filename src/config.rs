//! Compile-time protocol parameters and the runtime cluster topology.

use serde::{Deserialize, Serialize};

use crate::{Result, ShardError};

/// Maximum requests pulled into one worker batch.
pub const WORKER_MAX_BATCH: usize = 16;

/// Initial broadcast credits granted toward each remote peer.
pub const COH_CREDITS: u8 = 30;

/// Credits restored by a single credit-return message.
///
/// Must stay below [`COH_CREDITS`] so a returner never over-grants.
pub const CREDITS_PER_MESSAGE: u8 = 3;

/// Maximum broadcasts staged before a chain is posted.
pub const MAX_BCAST_BATCH: usize = 4;

/// Maximum coherence updates consumed from the receive ring per pass.
pub const BCAST_TO_CACHE_BATCH: usize = 90;

/// A broadcast send is completion-signaled every this many posts.
pub const BROADCAST_SS_BATCH: u64 = 4;

/// A credit send is completion-signaled every this many posts.
pub const CREDIT_SS_BATCH: u64 = 1;

/// A client response send is completion-signaled every this many posts.
pub const WORKER_SS_BATCH: u64 = 4;

/// Maximum value payload carried by an op.
pub const VALUE_MAX: usize = 32;

/// Associativity of a cache/store bucket.
pub const BUCKET_WAYS: usize = 8;

/// Depth of a queue pair's send queue. Must exceed [`WORKER_MAX_BATCH`]
/// so a full batch of responses can always be posted.
pub const SEND_Q_DEPTH: usize = 128;

/// Queue-pair slots owned by each worker: requests, broadcasts, credits,
/// and the reserved invalidation channel.
pub const WORKER_REQ_QP: usize = 0;
/// Queue pair carrying coherence UPDATE broadcasts.
pub const WORKER_BROADCAST_QP: usize = 1;
/// Queue pair carrying zero-payload credit returns.
pub const WORKER_CREDIT_QP: usize = 2;
/// Reserved for the linearizable invalidation variant; never bound.
pub const WORKER_INV_QP: usize = 3;
/// Number of queue pairs a worker publishes.
pub const WORKER_NUM_QPS: usize = 3;

/// Cluster topology and sizing, built once at bootstrap and threaded
/// into every worker as immutable configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Number of nodes in the deployment (N).
    pub nodes: usize,
    /// Workers per node (W).
    pub workers: usize,
    /// Bucket count of the replicated cache index (power of two).
    pub cache_buckets: usize,
    /// Entry slots in the cache's circular value log.
    pub cache_log_slots: usize,
    /// Bucket count of each worker's store shard (power of two).
    pub store_buckets: usize,
    /// Entry slots in each store shard's circular value log.
    pub store_log_slots: usize,
    /// Slots in each worker's coherence receive ring (R).
    pub ring_slots: usize,
}

impl ClusterConfig {
    /// A small topology with sizing suitable for tests and benches.
    pub fn small(nodes: usize, workers: usize) -> Self {
        let ring_slots = nodes.saturating_sub(1).max(1) * COH_CREDITS as usize;
        ClusterConfig {
            nodes,
            workers,
            cache_buckets: 1024,
            cache_log_slots: 4096,
            store_buckets: 1024,
            store_log_slots: 4096,
            ring_slots,
        }
    }

    /// Total worker count across the cluster.
    pub fn total_workers(&self) -> usize {
        self.nodes * self.workers
    }

    /// Checks the layout and flow-control invariants that the original
    /// deployment asserts at startup. Violations are fatal.
    pub fn validate(&self) -> Result<()> {
        if self.nodes == 0 || self.workers == 0 {
            return Err(ShardError::Config(
                "cluster needs at least one node and one worker".to_owned(),
            ));
        }
        if !self.cache_buckets.is_power_of_two() || !self.store_buckets.is_power_of_two() {
            return Err(ShardError::Config(
                "bucket counts must be powers of two".to_owned(),
            ));
        }
        if SEND_Q_DEPTH <= WORKER_MAX_BATCH {
            return Err(ShardError::Config(
                "send queue depth must exceed the worker batch bound".to_owned(),
            ));
        }
        if CREDITS_PER_MESSAGE >= COH_CREDITS {
            return Err(ShardError::Config(
                "credits per message must be below the credit ceiling".to_owned(),
            ));
        }
        // The ring must absorb every in-flight broadcast the credit
        // scheme admits, otherwise deposits could overrun unconsumed
        // slots.
        let in_flight = self.nodes.saturating_sub(1) * COH_CREDITS as usize;
        if self.nodes > 1 && self.ring_slots < in_flight {
            return Err(ShardError::Config(format!(
                "receive ring of {} slots cannot hold {} credited broadcasts",
                self.ring_slots, in_flight
            )));
        }
        Ok(())
    }
}
