use crate::key::KeyFingerprint;
use crate::protocol::Op;

/// Hash-partitioned shard routing: which node owns a key, which worker
/// on that node serves it, and how a miss batch splits between the
/// local shard and remote peers.
#[derive(Debug, Clone, Copy)]
pub struct ShardRouter {
    /// This node's id.
    pub self_node: u8,
    /// Nodes in the deployment (N).
    pub nodes: usize,
    /// Workers per node (W).
    pub workers: usize,
}

/// A miss batch split into its local and remote halves. Indices refer
/// to the batch the misses came from, so responses merge back in place.
#[derive(Debug, Default)]
pub struct Partitioned {
    /// Ops owned by this node, in original relative order.
    pub local_ops: Vec<Op>,
    /// Original batch index of each local op.
    pub local_indices: Vec<usize>,
    /// Ops owned elsewhere, in original relative order.
    pub remote_ops: Vec<Op>,
    /// Original batch index of each remote op.
    pub remote_indices: Vec<usize>,
    /// Owning node of each remote op.
    pub remote_targets: Vec<u8>,
}

impl ShardRouter {
    /// The node that owns `key`.
    pub fn key_owner(&self, key: &KeyFingerprint) -> u8 {
        (key.bucket % self.nodes as u64) as u8
    }

    /// The worker on the owning node that serves `key`.
    pub fn owner_worker(&self, key: &KeyFingerprint) -> usize {
        ((key.bucket / self.nodes as u64) % self.workers as u64) as usize
    }

    /// Whether this node owns `key`.
    pub fn is_local(&self, key: &KeyFingerprint) -> bool {
        self.key_owner(key) == self.self_node
    }

    /// Global worker id `node * W + worker` for the owner of `key`.
    pub fn owner_worker_gid(&self, key: &KeyFingerprint) -> usize {
        self.key_owner(key) as usize * self.workers + self.owner_worker(key)
    }

    /// Splits miss ops into local-shard and remote-shard partitions,
    /// preserving relative order within each.
    pub fn separate_local_remote(&self, miss_ops: &[Op], miss_indices: &[usize]) -> Partitioned {
        debug_assert_eq!(miss_ops.len(), miss_indices.len());
        let mut out = Partitioned::default();
        for (op, &idx) in miss_ops.iter().zip(miss_indices) {
            if self.is_local(&op.key) {
                out.local_ops.push(*op);
                out.local_indices.push(idx);
            } else {
                out.remote_targets.push(self.key_owner(&op.key));
                out.remote_ops.push(*op);
                out.remote_indices.push(idx);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Op;

    fn k(bucket: u64) -> KeyFingerprint {
        KeyFingerprint::from_parts(bucket, bucket)
    }

    #[test]
    fn ownership_is_total_and_consistent() {
        let router = ShardRouter {
            self_node: 1,
            nodes: 3,
            workers: 4,
        };
        for bucket in 0..1000u64 {
            let key = k(bucket);
            let owner = router.key_owner(&key);
            assert!((owner as usize) < router.nodes);
            assert_eq!(router.is_local(&key), owner == router.self_node);
            assert!(router.owner_worker(&key) < router.workers);
        }
    }

    #[test]
    fn owner_worker_gid_layout() {
        let router = ShardRouter {
            self_node: 0,
            nodes: 2,
            workers: 2,
        };
        // bucket 5: owner = 1, worker = (5 / 2) % 2 = 0 -> gid 2.
        assert_eq!(router.owner_worker_gid(&k(5)), 2);
        // bucket 6: owner = 0, worker = (6 / 2) % 2 = 1 -> gid 1.
        assert_eq!(router.owner_worker_gid(&k(6)), 1);
    }

    #[test]
    fn separation_preserves_order_and_indices() {
        let router = ShardRouter {
            self_node: 0,
            nodes: 2,
            workers: 1,
        };
        // Buckets 0,2 local; 1,3 remote.
        let ops: Vec<Op> = [0u64, 1, 2, 3].iter().map(|&b| Op::get(k(b))).collect();
        let indices = [4usize, 5, 6, 7];
        let parts = router.separate_local_remote(&ops, &indices);

        assert_eq!(parts.local_indices, vec![4, 6]);
        assert_eq!(parts.remote_indices, vec![5, 7]);
        assert_eq!(parts.remote_targets, vec![1, 1]);
        assert_eq!(parts.local_ops.len(), 2);
        assert_eq!(parts.remote_ops.len(), 2);
    }
}
