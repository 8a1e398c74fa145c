use std::thread;
use std::time::{Duration, Instant};

use crate::bootstrap::AddressTable;
use crate::config::{ClusterConfig, WORKER_REQ_QP};
use crate::key::KeyFingerprint;
use crate::protocol::{Op, Response, OP_WIRE_SIZE};
use crate::router::ShardRouter;
use crate::transport::{QueuePair, Transport};
use crate::{Result, ShardError};

/// How long a request waits for its response. A dropped cross-shard
/// forward surfaces here as a timeout; the server never retries.
const RESPONSE_WAIT: Duration = Duration::from_secs(5);

/// A client of the store, speaking the datagram protocol over its own
/// queue pair. Requests are routed to the worker that owns the key.
pub struct KvClient {
    qp: Box<dyn QueuePair>,
    router: ShardRouter,
    addrs: AddressTable,
}

impl KvClient {
    /// Connects to the cluster: creates a queue pair under `name` and
    /// resolves every worker's address.
    pub fn connect(
        transport: &dyn Transport,
        config: &ClusterConfig,
        name: &str,
    ) -> Result<KvClient> {
        let qp = transport.create_qp(name)?;
        let addrs = AddressTable::build(transport, config)?;
        Ok(KvClient {
            qp,
            router: ShardRouter {
                self_node: 0,
                nodes: config.nodes,
                workers: config.workers,
            },
            addrs,
        })
    }

    /// Gets the value for a key from its owning worker.
    pub fn get(&mut self, key: KeyFingerprint) -> Result<Response> {
        let op = Op::get(key);
        self.request_at(
            self.router.key_owner(&key) as usize,
            self.router.owner_worker(&key),
            &op,
        )
    }

    /// Puts a value at the key's owning worker.
    pub fn put(&mut self, key: KeyFingerprint, value: &[u8]) -> Result<Response> {
        let op = Op::put(key, value)?;
        self.request_at(
            self.router.key_owner(&key) as usize,
            self.router.owner_worker(&key),
            &op,
        )
    }

    /// Sends an op to a specific worker and waits for the response.
    ///
    /// Sending to a worker that does not own the key exercises the
    /// server's forwarding path: the response then arrives from the
    /// owning node instead of the addressed one.
    pub fn request_at(&mut self, node: usize, worker: usize, op: &Op) -> Result<Response> {
        let mut frame = [0u8; OP_WIRE_SIZE];
        op.encode(&mut frame);
        self.qp.post_send(
            self.addrs.worker_qp_at(node, worker, WORKER_REQ_QP),
            &frame,
            0,
            false,
        )?;

        let deadline = Instant::now() + RESPONSE_WAIT;
        let mut dgrams = Vec::with_capacity(1);
        loop {
            if self.qp.poll_recv(1, &mut dgrams) > 0 {
                return Response::decode(&dgrams[0].payload);
            }
            if Instant::now() >= deadline {
                return Err(ShardError::StringError(
                    "timed out waiting for response".to_owned(),
                ));
            }
            thread::sleep(Duration::from_micros(100));
        }
    }
}
