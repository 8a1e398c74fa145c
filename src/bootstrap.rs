//! Address-handle publication and startup population: the glue a node
//! runs before its workers start serving.

use std::thread;
use std::time::Duration;

use log::debug;
use rayon::prelude::*;

use crate::config::{ClusterConfig, WORKER_NUM_QPS};
use crate::key::KeyFingerprint;
use crate::protocol::Op;
use crate::router::ShardRouter;
use crate::store::KvStore;
use crate::transport::{PeerAddr, Transport};
use crate::{Result, ShardError};

/// How long a worker waits for the rest of the cluster to publish its
/// queue pairs before giving up.
const AH_WAIT: Duration = Duration::from_secs(10);
const AH_POLL: Duration = Duration::from_millis(2);

/// The published name of a worker queue pair.
pub fn qp_name(node: usize, worker: usize, qp: usize) -> String {
    format!("worker-dgram-{}-{}-{}", node, worker, qp)
}

/// Parses a published worker queue-pair name back into its
/// `(node, worker, qp)` coordinates.
pub fn parse_qp_name(name: &str) -> Option<(usize, usize, usize)> {
    let rest = name.strip_prefix("worker-dgram-")?;
    let mut parts = rest.splitn(3, '-');
    let node = parts.next()?.parse().ok()?;
    let worker = parts.next()?.parse().ok()?;
    let qp = parts.next()?.parse().ok()?;
    Some((node, worker, qp))
}

/// The peer-address table: every worker queue pair in the cluster,
/// indexed by `(node * W + worker) * WORKER_NUM_QPS + qp`.
pub struct AddressTable {
    qps: Vec<PeerAddr>,
    workers_per_node: usize,
}

impl AddressTable {
    /// Resolves every published worker queue pair, waiting for peers
    /// that have not come up yet. Errors out if the cluster does not
    /// converge within the bootstrap window.
    pub fn build(transport: &dyn Transport, config: &ClusterConfig) -> Result<AddressTable> {
        let mut qps = Vec::with_capacity(config.total_workers() * WORKER_NUM_QPS);
        for node in 0..config.nodes {
            for worker in 0..config.workers {
                for qp in 0..WORKER_NUM_QPS {
                    let name = qp_name(node, worker, qp);
                    let addr = wait_resolve(transport, &name)?;
                    qps.push(addr);
                }
            }
        }
        debug!("address table complete: {} queue pairs", qps.len());
        Ok(AddressTable {
            qps,
            workers_per_node: config.workers,
        })
    }

    /// Address of queue pair `qp` on the worker with global id `gid`.
    pub fn worker_qp(&self, gid: usize, qp: usize) -> PeerAddr {
        self.qps[gid * WORKER_NUM_QPS + qp]
    }

    /// Address of queue pair `qp` on `(node, worker)`.
    pub fn worker_qp_at(&self, node: usize, worker: usize, qp: usize) -> PeerAddr {
        self.worker_qp(node * self.workers_per_node + worker, qp)
    }
}

fn wait_resolve(transport: &dyn Transport, name: &str) -> Result<PeerAddr> {
    let mut waited = Duration::ZERO;
    loop {
        if let Some(addr) = transport.resolve(name) {
            return Ok(addr);
        }
        if waited >= AH_WAIT {
            return Err(ShardError::Config(format!(
                "peer queue pair {} never published",
                name
            )));
        }
        thread::sleep(AH_POLL);
        waited += AH_POLL;
    }
}

/// Pre-loads store shards with the node's owned slice of a fixed key
/// range, one shard per worker, populated in parallel.
///
/// Key `i` is fingerprinted from its little-endian bytes and lands in
/// the shard of its owning worker; other keys are skipped.
pub fn populate(
    shards: &[KvStore],
    router: &ShardRouter,
    num_keys: u64,
    value: &[u8],
) -> Result<()> {
    if value.len() > crate::config::VALUE_MAX {
        return Err(ShardError::ValueTooLarge(value.len()));
    }
    shards.par_iter().enumerate().for_each(|(worker, shard)| {
        let mut loaded = 0u64;
        for i in 0..num_keys {
            let key = KeyFingerprint::from_key(&i.to_le_bytes());
            if !router.is_local(&key) || router.owner_worker(&key) != worker {
                continue;
            }
            let op = Op::put(key, value).expect("length checked above");
            let mut resp = [crate::protocol::Response::empty(); 1];
            shard.batch_op(&[op], &mut resp);
            loaded += 1;
        }
        debug!("worker {} populated {} keys", worker, loaded);
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qp_names_round_trip() {
        let name = qp_name(2, 7, 1);
        assert_eq!(name, "worker-dgram-2-7-1");
        assert_eq!(parse_qp_name(&name), Some((2, 7, 1)));
        assert_eq!(parse_qp_name("client-3"), None);
    }

    #[test]
    fn populate_respects_shard_ownership() {
        let shards = vec![KvStore::new(64, 1024), KvStore::new(64, 1024)];
        let router = ShardRouter {
            self_node: 0,
            nodes: 2,
            workers: 2,
        };
        populate(&shards, &router, 500, b"seed").unwrap();

        // Every populated key answers from its own shard only.
        let mut hits = 0;
        for i in 0..500u64 {
            let key = KeyFingerprint::from_key(&i.to_le_bytes());
            if !router.is_local(&key) {
                continue;
            }
            let shard = &shards[router.owner_worker(&key)];
            let ops = [Op::get(key)];
            let mut resp = [crate::protocol::Response::empty(); 1];
            shard.batch_op(&ops, &mut resp);
            assert_eq!(resp[0].kind, crate::protocol::RespKind::GetSuccess);
            hits += 1;
        }
        assert!(hits > 0);
    }
}
