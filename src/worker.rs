//! The worker request loop. Each worker owns its store shard, its
//! queue pairs, and its coherence context; workers share only the
//! replicated cache index.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::channel::{Receiver, Sender};
use log::{debug, error, info};

use crate::bootstrap::AddressTable;
use crate::cache::CacheIndex;
use crate::coherence::CoherenceContext;
use crate::config::{ClusterConfig, BCAST_TO_CACHE_BATCH, WORKER_MAX_BATCH, WORKER_SS_BATCH};
use crate::forward::{forward_batch, handle_forwarded};
use crate::protocol::{decode_request, Op, Opcode, RequestFrame, RespKind, Response, RESP_WIRE_SIZE};
use crate::router::ShardRouter;
use crate::store::KvStore;
use crate::transport::{PeerAddr, QueuePair};

/// A request from a co-located client, bypassing the transport.
pub struct LocalRequest {
    /// The op to serve.
    pub op: Op,
    /// Where the response goes.
    pub reply: Sender<Response>,
}

/// Per-worker counters, shared with the node for observation.
#[derive(Debug, Default)]
pub struct WorkerStats {
    /// Batches that contained at least one request.
    pub batches: AtomicU64,
    /// Passes that found no request.
    pub empty_polls: AtomicU64,
    /// Requests answered from the replicated cache.
    pub cache_hits: AtomicU64,
    /// Requests that missed the cache.
    pub cache_misses: AtomicU64,
    /// Miss ops served by the local store shard.
    pub local_ops: AtomicU64,
    /// Miss ops forwarded to owning peers.
    pub remote_forwards: AtomicU64,
    /// Foreign UPDATEs applied to the cache replica.
    pub updates_applied: AtomicU64,
    /// Forwarded requests served on behalf of peers.
    pub forwarded_served: AtomicU64,
    /// UPDATE messages posted by the coherence engine.
    pub broadcasts_sent: AtomicU64,
    /// Credit messages posted.
    pub credits_sent: AtomicU64,
    /// Broadcast passes stalled on exhausted credits.
    pub credit_stalls: AtomicU64,
}

/// Where a batched request came from, and therefore where its response
/// goes.
enum Origin {
    /// Co-located client; answered over its reply channel.
    Local(Sender<Response>),
    /// Remote client; answered over the request queue pair.
    Remote(PeerAddr),
}

/// One worker's owned state.
pub(crate) struct Worker {
    node_id: u8,
    lid: usize,
    router: ShardRouter,
    cache: Arc<CacheIndex>,
    kv: KvStore,
    req_qp: Box<dyn QueuePair>,
    bcast_qp: Box<dyn QueuePair>,
    credit_qp: Box<dyn QueuePair>,
    addrs: AddressTable,
    coh: CoherenceContext,
    local_rx: Receiver<LocalRequest>,
    /// Writes awaiting broadcast; survives credit stalls.
    pending_broadcasts: VecDeque<Op>,
    resp_tx: u64,
    stats: Arc<WorkerStats>,
    shutdown: Arc<AtomicBool>,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        node_id: u8,
        lid: usize,
        config: &ClusterConfig,
        cache: Arc<CacheIndex>,
        kv: KvStore,
        req_qp: Box<dyn QueuePair>,
        bcast_qp: Box<dyn QueuePair>,
        credit_qp: Box<dyn QueuePair>,
        addrs: AddressTable,
        local_rx: Receiver<LocalRequest>,
        stats: Arc<WorkerStats>,
        shutdown: Arc<AtomicBool>,
    ) -> Worker {
        Worker {
            node_id,
            lid,
            router: ShardRouter {
                self_node: node_id,
                nodes: config.nodes,
                workers: config.workers,
            },
            cache,
            kv,
            req_qp,
            bcast_qp,
            credit_qp,
            addrs,
            coh: CoherenceContext::new(node_id, lid, config.nodes, config.ring_slots),
            local_rx,
            pending_broadcasts: VecDeque::new(),
            resp_tx: 0,
            stats,
            shutdown,
        }
    }

    /// Runs the request loop until shutdown.
    pub(crate) fn run(mut self) {
        info!("worker {}-{} serving", self.node_id, self.lid);
        while !self.shutdown.load(Ordering::Relaxed) {
            self.iterate();
        }
        debug!(
            "worker {}-{} stopping: {} batches, {} empty polls",
            self.node_id,
            self.lid,
            self.stats.batches.load(Ordering::Relaxed),
            self.stats.empty_polls.load(Ordering::Relaxed),
        );
    }

    /// One pass of the nine-step dataflow.
    fn iterate(&mut self) {
        // 1. Coherence receive path: drain the ring, apply foreign
        //    updates, return credits.
        self.drain_coherence();

        // 2 + 3. Gather a batch: local clients first, then the remote
        //        request ring, up to the batch bound.
        let mut ops: Vec<Op> = Vec::with_capacity(WORKER_MAX_BATCH);
        let mut origins: Vec<Origin> = Vec::with_capacity(WORKER_MAX_BATCH);
        self.gather_batch(&mut ops, &mut origins);

        if ops.is_empty() {
            self.stats.empty_polls.fetch_add(1, Ordering::Relaxed);
            // Stalled broadcasts still drain once credits come back.
            self.drain_pending_broadcasts();
            self.reclaim_completions();
            self.publish_coherence_stats();
            std::thread::yield_now();
            return;
        }
        self.stats.batches.fetch_add(1, Ordering::Relaxed);

        // 4. Cache lookup; hits are answered in place.
        let mut resp = vec![Response::empty(); ops.len()];
        let miss_indices = self.cache.lookup_batch(&ops, &mut resp);
        let hits = ops.len() - miss_indices.len();
        self.stats.cache_hits.fetch_add(hits as u64, Ordering::Relaxed);
        self.stats
            .cache_misses
            .fetch_add(miss_indices.len() as u64, Ordering::Relaxed);

        // 5. Split misses into local shard and remote shards.
        let miss_ops: Vec<Op> = miss_indices.iter().map(|&i| ops[i]).collect();
        let parts = self.router.separate_local_remote(&miss_ops, &miss_indices);

        // 6. Owner-side batch against the local shard, merged back by
        //    original index.
        if !parts.local_ops.is_empty() {
            let mut kv_resp = vec![Response::empty(); parts.local_ops.len()];
            self.kv.batch_op(&parts.local_ops, &mut kv_resp);
            merge_responses(&mut resp, &kv_resp, &parts.local_indices);
            self.stats
                .local_ops
                .fetch_add(parts.local_ops.len() as u64, Ordering::Relaxed);
        }

        // 7. Forward remote-shard misses to their owners.
        if !parts.remote_ops.is_empty() {
            let client_returns: Vec<PeerAddr> = parts
                .remote_indices
                .iter()
                .map(|&i| match &origins[i] {
                    Origin::Remote(addr) => *addr,
                    // A co-located client has no transport address;
                    // the owner's direct response cannot reach it, so
                    // the placeholder is all it gets.
                    Origin::Local(_) => PeerAddr { host: 0, port: 0 },
                })
                .collect();
            let posted = forward_batch(
                &self.router,
                &parts,
                &client_returns,
                &mut *self.req_qp,
                &self.addrs,
                &mut resp,
            );
            self.stats
                .remote_forwards
                .fetch_add(posted as u64, Ordering::Relaxed);
        }

        // 8. Every completed local write becomes visible in the local
        //    cache replica, then queues one broadcast.
        for (i, op) in ops.iter().enumerate() {
            if op.opcode == Opcode::Put
                && matches!(resp[i].kind, RespKind::PutSuccess | RespKind::CachePutSuccess)
            {
                self.cache.insert(op);
                let mut bcast = *op;
                bcast.opcode = Opcode::Broadcast;
                self.pending_broadcasts.push_back(bcast);
            }
        }
        self.drain_pending_broadcasts();

        // 9. Answer clients and reclaim send completions.
        self.respond(&origins, &resp);
        self.reclaim_completions();
        self.publish_coherence_stats();
    }

    /// Step 1: deposit incoming UPDATEs, consume the ring, apply to the
    /// cache replica, and emit credit returns to the senders.
    fn drain_coherence(&mut self) {
        let mut dgrams = Vec::new();
        self.bcast_qp.poll_recv(BCAST_TO_CACHE_BATCH, &mut dgrams);
        let mut senders = Vec::with_capacity(dgrams.len());
        for dgram in dgrams {
            match Op::decode(&dgram.payload) {
                Ok(op) => {
                    self.coh.deposit(op);
                    senders.push(dgram.immediate as u8);
                }
                Err(e) => {
                    // Failed receive: log and skip the slot.
                    error!(
                        "worker {}-{}: undecodable coherence frame: {}",
                        self.node_id, self.lid, e
                    );
                }
            }
        }

        let mut updates = Vec::new();
        self.coh.poll_coherence(&mut updates);
        if !updates.is_empty() {
            self.cache.apply_updates(&updates);
            self.stats
                .updates_applied
                .fetch_add(updates.len() as u64, Ordering::Relaxed);
        }
        if !senders.is_empty() {
            self.coh
                .credit_returns(&senders, &mut *self.credit_qp, &self.addrs);
        }
    }

    /// Steps 2 and 3: co-located clients drain first so remote
    /// requests have time to accumulate, then the receive ring fills
    /// the rest of the batch. Forwarded requests are served on the
    /// spot; they never join the batch.
    fn gather_batch(&mut self, ops: &mut Vec<Op>, origins: &mut Vec<Origin>) {
        while ops.len() < WORKER_MAX_BATCH {
            match self.local_rx.try_recv() {
                Ok(req) => {
                    ops.push(req.op);
                    origins.push(Origin::Local(req.reply));
                }
                Err(_) => break,
            }
        }

        let budget = WORKER_MAX_BATCH - ops.len();
        if budget == 0 {
            return;
        }
        let mut dgrams = Vec::new();
        self.req_qp.poll_recv(budget, &mut dgrams);
        for dgram in dgrams {
            match decode_request(&dgram.payload) {
                Ok(RequestFrame::Client(op)) => {
                    ops.push(op);
                    origins.push(Origin::Remote(dgram.src));
                }
                Ok(RequestFrame::Forwarded(fr)) => {
                    if let Err(e) =
                        handle_forwarded(&fr, &self.kv, &mut *self.req_qp, self.node_id)
                    {
                        error!(
                            "worker {}-{}: forwarded response dropped: {}",
                            self.node_id, self.lid, e
                        );
                    }
                    self.stats.forwarded_served.fetch_add(1, Ordering::Relaxed);
                    // The forwarded write must replicate from here: the
                    // owner is the broadcast origin for its shard.
                    if fr.op.opcode == Opcode::Put {
                        self.cache.insert(&fr.op);
                        let mut bcast = fr.op;
                        bcast.opcode = Opcode::Broadcast;
                        self.pending_broadcasts.push_back(bcast);
                    }
                }
                Err(e) => {
                    error!(
                        "worker {}-{}: undecodable request frame: {}",
                        self.node_id, self.lid, e
                    );
                }
            }
        }
    }

    /// Step 8 tail: push queued broadcasts through the credit gate.
    /// Whatever stalls stays queued for the next pass.
    fn drain_pending_broadcasts(&mut self) {
        if self.pending_broadcasts.is_empty() {
            return;
        }
        let queued: Vec<Op> = self.pending_broadcasts.iter().copied().collect();
        let sent = self.coh.broadcast_updates(
            &queued,
            &mut *self.bcast_qp,
            &mut *self.credit_qp,
            &self.addrs,
        );
        self.pending_broadcasts.drain(..sent);
    }

    /// Step 9: deliver responses. Placeholder slots for forwarded
    /// requests stay off the wire; the owner answers those clients.
    fn respond(&mut self, origins: &[Origin], resp: &[Response]) {
        for (origin, r) in origins.iter().zip(resp) {
            match origin {
                Origin::Local(reply) => {
                    // Local clients always hear back, placeholders
                    // included, so they never block on a forward.
                    let _ = reply.send(*r);
                }
                Origin::Remote(addr) => {
                    if r.kind == RespKind::Empty {
                        continue;
                    }
                    let mut frame = [0u8; RESP_WIRE_SIZE];
                    r.encode(&mut frame);
                    self.resp_tx += 1;
                    let signaled = self.resp_tx % WORKER_SS_BATCH == 0;
                    if let Err(e) = self.req_qp.post_send(
                        *addr,
                        &frame,
                        u32::from(self.node_id),
                        signaled,
                    ) {
                        error!(
                            "worker {}-{}: response to {:?} dropped: {}",
                            self.node_id, self.lid, addr, e
                        );
                    }
                }
            }
        }
    }

    fn reclaim_completions(&mut self) {
        self.req_qp.poll_send_completions();
        self.bcast_qp.poll_send_completions();
        self.credit_qp.poll_send_completions();
    }

    fn publish_coherence_stats(&self) {
        let s = &self.coh.stats;
        self.stats
            .broadcasts_sent
            .store(s.broadcasts_sent, Ordering::Relaxed);
        self.stats.credits_sent.store(s.credits_sent, Ordering::Relaxed);
        self.stats.credit_stalls.store(s.stalls, Ordering::Relaxed);
    }
}

/// Merges owner responses back into the batch response array at their
/// original indices.
fn merge_responses(resp: &mut [Response], owner_resp: &[Response], indices: &[usize]) {
    for (r, &idx) in owner_resp.iter().zip(indices) {
        resp[idx] = *r;
    }
}
