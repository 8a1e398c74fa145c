//! Node assembly: builds the shared cache replica, carves the store
//! into per-worker shards, publishes queue pairs, and spawns the
//! worker threads.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Sender};
use log::{error, info};

use crate::bootstrap::{populate, qp_name, AddressTable};
use crate::cache::CacheIndex;
use crate::config::{
    ClusterConfig, WORKER_BROADCAST_QP, WORKER_CREDIT_QP, WORKER_REQ_QP,
};
use crate::protocol::{Op, Response};
use crate::router::ShardRouter;
use crate::store::KvStore;
use crate::transport::Transport;
use crate::worker::{LocalRequest, Worker, WorkerStats};
use crate::{Result, ShardError};

/// How long [`Node::wait_ready`] waits for the cluster to converge.
const READY_WAIT: Duration = Duration::from_secs(10);

/// One node of the deployment: W workers over a shared cache replica.
pub struct Node {
    node_id: u8,
    config: ClusterConfig,
    cache: Arc<CacheIndex>,
    local_txs: Vec<Sender<LocalRequest>>,
    stats: Vec<Arc<WorkerStats>>,
    ready: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl Node {
    /// Starts a node with empty store shards.
    pub fn start(
        node_id: u8,
        config: ClusterConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Node> {
        Node::start_seeded(node_id, config, transport, 0, &[])
    }

    /// Starts a node, pre-loading each worker shard with its owned
    /// slice of the key range `0..seed_keys` mapped to `seed_value`.
    pub fn start_seeded(
        node_id: u8,
        config: ClusterConfig,
        transport: Arc<dyn Transport>,
        seed_keys: u64,
        seed_value: &[u8],
    ) -> Result<Node> {
        config.validate()?;
        if usize::from(node_id) >= config.nodes {
            return Err(ShardError::Config(format!(
                "node id {} outside cluster of {}",
                node_id, config.nodes
            )));
        }

        let cache = Arc::new(CacheIndex::new(config.cache_buckets, config.cache_log_slots));
        let router = ShardRouter {
            self_node: node_id,
            nodes: config.nodes,
            workers: config.workers,
        };

        let mut shards: Vec<KvStore> = (0..config.workers)
            .map(|_| KvStore::new(config.store_buckets, config.store_log_slots))
            .collect();
        if seed_keys > 0 {
            populate(&shards, &router, seed_keys, seed_value)?;
        }

        let ready = Arc::new(AtomicUsize::new(0));
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut local_txs = Vec::with_capacity(config.workers);
        let mut stats = Vec::with_capacity(config.workers);
        let mut handles = Vec::with_capacity(config.workers);

        for lid in (0..config.workers).rev() {
            let kv = shards.pop().expect("one shard per worker");
            // Publishing the queue pairs here, before any thread runs,
            // lets peers resolve this node while it is still waiting
            // for them.
            let req_qp = transport.create_qp(&qp_name(node_id as usize, lid, WORKER_REQ_QP))?;
            let bcast_qp =
                transport.create_qp(&qp_name(node_id as usize, lid, WORKER_BROADCAST_QP))?;
            let credit_qp =
                transport.create_qp(&qp_name(node_id as usize, lid, WORKER_CREDIT_QP))?;

            let (local_tx, local_rx) = channel::unbounded();
            local_txs.push(local_tx);
            let worker_stats = Arc::new(WorkerStats::default());
            stats.push(worker_stats.clone());

            let transport = transport.clone();
            let config = config.clone();
            let cache = cache.clone();
            let ready = ready.clone();
            let shutdown = shutdown.clone();
            let handle = thread::Builder::new()
                .name(format!("worker-{}-{}", node_id, lid))
                .spawn(move || {
                    let addrs = match AddressTable::build(transport.as_ref(), &config) {
                        Ok(addrs) => addrs,
                        Err(e) => {
                            error!("worker {}-{}: bootstrap failed: {}", node_id, lid, e);
                            return;
                        }
                    };
                    ready.fetch_add(1, Ordering::SeqCst);
                    Worker::new(
                        node_id,
                        lid,
                        &config,
                        cache,
                        kv,
                        req_qp,
                        bcast_qp,
                        credit_qp,
                        addrs,
                        local_rx,
                        worker_stats,
                        shutdown,
                    )
                    .run();
                })
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }
        // Channels and stats were pushed in reverse worker order.
        local_txs.reverse();
        stats.reverse();

        info!(
            "node {} started: {} workers, {} peers",
            node_id,
            config.workers,
            config.nodes - 1
        );
        Ok(Node {
            node_id,
            config,
            cache,
            local_txs,
            stats,
            ready,
            shutdown,
            handles,
        })
    }

    /// Blocks until every worker has resolved the full cluster and is
    /// serving.
    pub fn wait_ready(&self) -> Result<()> {
        let deadline = Instant::now() + READY_WAIT;
        while self.ready.load(Ordering::SeqCst) < self.config.workers {
            if Instant::now() >= deadline {
                return Err(ShardError::Config(format!(
                    "node {}: workers never became ready",
                    self.node_id
                )));
            }
            thread::sleep(Duration::from_millis(2));
        }
        Ok(())
    }

    /// This node's id.
    pub fn node_id(&self) -> u8 {
        self.node_id
    }

    /// The shared cache replica. Exposed so bootstrap can seed hot
    /// keys before traffic arrives.
    pub fn cache(&self) -> &Arc<CacheIndex> {
        &self.cache
    }

    /// Counters for one worker.
    pub fn worker_stats(&self, lid: usize) -> &Arc<WorkerStats> {
        &self.stats[lid]
    }

    /// A handle for co-located clients. Requests bypass the transport
    /// and land directly on the owning worker's queue.
    pub fn local_client(&self) -> LocalClient {
        LocalClient {
            router: ShardRouter {
                self_node: self.node_id,
                nodes: self.config.nodes,
                workers: self.config.workers,
            },
            local_txs: self.local_txs.clone(),
        }
    }

    /// Stops the workers and joins their threads.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A co-located client: ops go straight onto the owning worker's local
/// queue. Only keys owned by this node can be served here; remote keys
/// need the datagram client.
pub struct LocalClient {
    router: ShardRouter,
    local_txs: Vec<Sender<LocalRequest>>,
}

impl LocalClient {
    /// Sends one op to its owning worker and waits for the response.
    pub fn request(&self, op: Op) -> Result<Response> {
        if !self.router.is_local(&op.key) {
            return Err(ShardError::StringError(format!(
                "key owned by node {}, not this node",
                self.router.key_owner(&op.key)
            )));
        }
        let worker = self.router.owner_worker(&op.key);
        let (reply_tx, reply_rx) = channel::bounded(1);
        self.local_txs[worker]
            .send(LocalRequest {
                op,
                reply: reply_tx,
            })
            .map_err(|_| ShardError::ChannelClosed)?;
        reply_rx.recv().map_err(|_| ShardError::ChannelClosed)
    }
}
