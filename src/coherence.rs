//! The credited broadcast protocol that keeps the replicated caches
//! convergent under writes.
//!
//! Every worker grants each peer `COH_CREDITS` broadcast credits. A
//! broadcast consumes one credit per peer; receivers return credits in
//! batches of `CREDITS_PER_MESSAGE` as zero-payload messages. Updates
//! from one sender are delivered in send order; cross-sender order is
//! not defined.

use log::error;

use crate::bootstrap::AddressTable;
use crate::config::{
    BCAST_TO_CACHE_BATCH, BROADCAST_SS_BATCH, COH_CREDITS, CREDITS_PER_MESSAGE, CREDIT_SS_BATCH,
    MAX_BCAST_BATCH, WORKER_BROADCAST_QP, WORKER_CREDIT_QP,
};
use crate::protocol::{Op, Opcode, OP_WIRE_SIZE};
use crate::transport::{QueuePair, SendDesc};

/// Per-peer credit flow state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditState {
    /// At least one credit remains toward the peer.
    Flowing,
    /// The peer's credits are exhausted; broadcasts stall.
    Stalled,
}

/// Counters mirrored from the worker statistics of the original
/// deployment.
#[derive(Debug, Default, Clone, Copy)]
pub struct CoherenceStats {
    /// UPDATE messages posted (one per peer per broadcast).
    pub broadcasts_sent: u64,
    /// UPDATE messages consumed from the receive ring.
    pub broadcasts_received: u64,
    /// Credit messages posted.
    pub credits_sent: u64,
    /// Credit messages received.
    pub credits_received: u64,
    /// Broadcast passes deferred because a peer had zero credits.
    pub stalls: u64,
}

struct RingSlot {
    /// Raw opcode: 0 when empty, `Opcode::Update` when ready. Anything
    /// else halts the consumer pass.
    opcode: u8,
    op: Op,
}

/// Per-worker coherence state: credits, staged broadcast copies, and
/// the circular receive ring.
pub struct CoherenceContext {
    self_node: u8,
    self_worker: usize,
    nodes: usize,

    /// credits[p] is how many broadcasts this worker may still send to
    /// peer p; credits[self] stays zero.
    credits: Vec<u8>,
    br_tx: u64,
    credit_tx: u64,

    /// Staged UPDATE copies, `MAX_BCAST_BATCH * (N - 1)` slots.
    coh_buf: Vec<Op>,

    ring: Vec<RingSlot>,
    /// Next deposit position.
    push_ptr: usize,
    /// Last consumed position; consumption begins at `pull_ptr + 1`.
    pull_ptr: usize,

    /// Updates seen per sender since the last credit return to it.
    broadcasts_seen: Vec<u8>,

    /// Protocol counters.
    pub stats: CoherenceStats,
}

impl CoherenceContext {
    /// Creates the context with full credits toward every peer.
    pub fn new(self_node: u8, self_worker: usize, nodes: usize, ring_slots: usize) -> Self {
        let credits = (0..nodes)
            .map(|p| if p == self_node as usize { 0 } else { COH_CREDITS })
            .collect();
        let zero = Op::get(crate::key::KeyFingerprint::from_parts(0, 0));
        CoherenceContext {
            self_node,
            self_worker,
            nodes,
            credits,
            br_tx: 0,
            credit_tx: 0,
            coh_buf: vec![zero; MAX_BCAST_BATCH * nodes.saturating_sub(1).max(1)],
            ring: (0..ring_slots.max(1))
                .map(|_| RingSlot { opcode: 0, op: zero })
                .collect(),
            push_ptr: 0,
            pull_ptr: ring_slots.max(1) - 1,
            broadcasts_seen: vec![0; nodes],
            stats: CoherenceStats::default(),
        }
    }

    /// Credits currently held toward `peer`.
    pub fn credits(&self, peer: usize) -> u8 {
        self.credits[peer]
    }

    /// Flow state toward `peer`.
    pub fn peer_state(&self, peer: usize) -> CreditState {
        if self.credits[peer] == 0 {
            CreditState::Stalled
        } else {
            CreditState::Flowing
        }
    }

    /// Deposits an incoming UPDATE into the receive ring. The credit
    /// scheme bounds in-flight broadcasts below the ring size, so an
    /// occupied slot means a protocol violation.
    pub fn deposit(&mut self, op: Op) {
        let slot = &mut self.ring[self.push_ptr];
        if slot.opcode != 0 {
            error!(
                "worker {}-{}: coherence ring overrun at slot {}",
                self.self_node, self.self_worker, self.push_ptr
            );
            return;
        }
        slot.opcode = op.opcode as u8;
        slot.op = op;
        self.push_ptr = (self.push_ptr + 1) % self.ring.len();
    }

    /// Consumes ready UPDATE slots from the ring, at most
    /// `BCAST_TO_CACHE_BATCH` per pass. Consumed slots have their
    /// opcode reset to zero. A slot holding any other opcode halts the
    /// pass.
    pub fn poll_coherence(&mut self, out: &mut Vec<Op>) -> usize {
        let mut taken = 0;
        while taken < BCAST_TO_CACHE_BATCH {
            let next = (self.pull_ptr + 1) % self.ring.len();
            let slot = &mut self.ring[next];
            if slot.opcode != Opcode::Update as u8 {
                if slot.opcode != 0 {
                    error!(
                        "worker {}-{}: invalid coherence opcode {} in ring",
                        self.self_node, self.self_worker, slot.opcode
                    );
                }
                break;
            }
            out.push(slot.op);
            slot.opcode = 0;
            self.pull_ptr = next;
            taken += 1;
            self.stats.broadcasts_received += 1;
        }
        taken
    }

    /// Drains the credit queue pair, restoring `CREDITS_PER_MESSAGE`
    /// credits per message, saturated at the ceiling.
    pub fn poll_credits(&mut self, credit_qp: &mut dyn QueuePair) {
        let mut incoming = Vec::new();
        credit_qp.poll_recv(self.nodes.max(4), &mut incoming);
        for dgram in incoming {
            let sender = dgram.immediate as usize;
            if sender >= self.nodes || sender == self.self_node as usize {
                continue;
            }
            self.credits[sender] =
                (self.credits[sender] + CREDITS_PER_MESSAGE).min(COH_CREDITS);
            self.stats.credits_received += 1;
        }
    }

    /// Whether every peer can absorb one more broadcast. Polls for
    /// incoming credits once before declaring a stall.
    fn check_broadcast_credits(&mut self, credit_qp: &mut dyn QueuePair) -> bool {
        let exhausted = |credits: &[u8], self_node: usize| {
            credits
                .iter()
                .enumerate()
                .any(|(p, &c)| p != self_node && c == 0)
        };
        if exhausted(&self.credits, self.self_node as usize) {
            self.poll_credits(credit_qp);
        }
        if exhausted(&self.credits, self.self_node as usize) {
            self.stats.stalls += 1;
            return false;
        }
        true
    }

    /// Broadcasts pending write ops to every peer, consuming one credit
    /// per peer per op. Stops at the first op for which some peer has
    /// no credits even after polling. Returns how many ops were
    /// broadcast; the caller keeps the rest queued for the next pass.
    pub fn broadcast_updates(
        &mut self,
        ops: &[Op],
        bcast_qp: &mut dyn QueuePair,
        credit_qp: &mut dyn QueuePair,
        addrs: &AddressTable,
    ) -> usize {
        if self.nodes < 2 {
            return ops.len();
        }
        let peers = self.nodes - 1;
        let mut br_i = 0;
        let mut consumed = 0;

        for op in ops {
            debug_assert_eq!(op.opcode, Opcode::Broadcast);
            if !self.check_broadcast_credits(credit_qp) {
                break;
            }
            // Stage one UPDATE copy per peer and take its credit.
            let mut peer_idx = 0;
            for p in 0..self.nodes {
                if p == self.self_node as usize {
                    continue;
                }
                let mut update = *op;
                update.opcode = Opcode::Update;
                self.coh_buf[br_i * peers + peer_idx] = update;
                self.credits[p] -= 1;
                peer_idx += 1;
            }
            br_i += 1;
            consumed += 1;
            if br_i == MAX_BCAST_BATCH {
                self.post_broadcast_chain(br_i, bcast_qp, addrs);
                br_i = 0;
            }
        }
        if br_i > 0 {
            self.post_broadcast_chain(br_i, bcast_qp, addrs);
        }
        consumed
    }

    /// Posts the staged chain of `br_i * (N - 1)` UPDATEs with a single
    /// chain call. A post failure drops the batch and the loop goes on.
    fn post_broadcast_chain(
        &mut self,
        br_i: usize,
        bcast_qp: &mut dyn QueuePair,
        addrs: &AddressTable,
    ) {
        let peers = self.nodes - 1;
        let count = br_i * peers;

        let mut encoded = vec![[0u8; OP_WIRE_SIZE]; count];
        for (i, buf) in encoded.iter_mut().enumerate() {
            self.coh_buf[i].encode(buf);
        }

        let peer_nodes: Vec<usize> = (0..self.nodes)
            .filter(|&p| p != self.self_node as usize)
            .collect();
        let mut descs = Vec::with_capacity(count);
        for (i, buf) in encoded.iter().enumerate() {
            let p = peer_nodes[i % peers];
            self.br_tx += 1;
            descs.push(SendDesc {
                dst: addrs.worker_qp_at(p, self.self_worker, WORKER_BROADCAST_QP),
                payload: buf,
                immediate: u32::from(self.self_node),
                signaled: self.br_tx % BROADCAST_SS_BATCH == 0,
            });
        }

        match bcast_qp.post_send_chain(&descs) {
            Ok(()) => self.stats.broadcasts_sent += count as u64,
            Err(e) => error!(
                "worker {}-{}: broadcast chain of {} dropped: {}",
                self.self_node, self.self_worker, count, e
            ),
        }
    }

    /// Accounts received broadcasts by sender and returns one credit
    /// message per `CREDITS_PER_MESSAGE` updates seen, as a single
    /// chain of zero-payload sends.
    pub fn credit_returns(
        &mut self,
        senders: &[u8],
        credit_qp: &mut dyn QueuePair,
        addrs: &AddressTable,
    ) {
        let mut dests = Vec::new();
        for &sender in senders {
            let s = sender as usize;
            if s >= self.nodes || s == self.self_node as usize {
                continue;
            }
            self.broadcasts_seen[s] += 1;
            if self.broadcasts_seen[s] == CREDITS_PER_MESSAGE {
                self.broadcasts_seen[s] = 0;
                self.credit_tx += 1;
                dests.push(SendDesc {
                    dst: addrs.worker_qp_at(s, self.self_worker, WORKER_CREDIT_QP),
                    payload: &[],
                    immediate: u32::from(self.self_node),
                    signaled: self.credit_tx % CREDIT_SS_BATCH == 0,
                });
            }
        }
        if dests.is_empty() {
            return;
        }
        let n = dests.len() as u64;
        match credit_qp.post_send_chain(&dests) {
            Ok(()) => self.stats.credits_sent += n,
            Err(e) => error!(
                "worker {}-{}: credit chain of {} dropped: {}",
                self.self_node, self.self_worker, n, e
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::{qp_name, AddressTable};
    use crate::config::{ClusterConfig, WORKER_NUM_QPS};
    use crate::key::KeyFingerprint;
    use crate::transport::{LoopbackTransport, Transport};

    /// Publishes every worker QP for a 2-node, 1-worker cluster and
    /// hands back this node's QPs plus the address table.
    fn two_node_fabric() -> (
        Vec<Box<dyn QueuePair>>,
        Vec<Box<dyn QueuePair>>,
        AddressTable,
    ) {
        let fabric = LoopbackTransport::new();
        let cfg = ClusterConfig::small(2, 1);
        let mut node0 = Vec::new();
        let mut node1 = Vec::new();
        for qp in 0..WORKER_NUM_QPS {
            node0.push(fabric.create_qp(&qp_name(0, 0, qp)).unwrap());
        }
        for qp in 0..WORKER_NUM_QPS {
            node1.push(fabric.create_qp(&qp_name(1, 0, qp)).unwrap());
        }
        let table = AddressTable::build(fabric.as_ref(), &cfg).unwrap();
        (node0, node1, table)
    }

    fn broadcast_and_credit_qps(
        node: &mut [Box<dyn QueuePair>],
    ) -> (&mut dyn QueuePair, &mut dyn QueuePair) {
        let (left, right) = node.split_at_mut(WORKER_CREDIT_QP);
        (&mut *left[WORKER_BROADCAST_QP], &mut *right[0])
    }

    fn bcast_op(tag: u64) -> Op {
        let mut op = Op::put(KeyFingerprint::from_parts(2, tag), b"v").unwrap();
        op.opcode = Opcode::Broadcast;
        op
    }

    #[test]
    fn broadcast_consumes_credits_and_reaches_peer() {
        let (mut node0, mut node1, table) = two_node_fabric();
        let mut ctx = CoherenceContext::new(0, 0, 2, 64);

        let (bcast_qp, credit_qp) = broadcast_and_credit_qps(&mut node0);
        let sent = ctx.broadcast_updates(
            &[bcast_op(1)],
            bcast_qp,
            credit_qp,
            &table,
        );
        assert_eq!(sent, 1);
        assert_eq!(ctx.credits(1), COH_CREDITS - 1);
        assert_eq!(ctx.stats.broadcasts_sent, 1);

        let mut got = Vec::new();
        node1[WORKER_BROADCAST_QP].poll_recv(8, &mut got);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].immediate, 0);
        let update = Op::decode(&got[0].payload).unwrap();
        assert_eq!(update.opcode, Opcode::Update);
    }

    #[test]
    fn zero_credits_stall_until_credit_arrives() {
        let (mut node0, mut node1, table) = two_node_fabric();
        let mut ctx = CoherenceContext::new(0, 0, 2, 64);

        // Exhaust all credits toward node 1.
        let pending: Vec<Op> = (0..u64::from(COH_CREDITS) + 3).map(bcast_op).collect();
        let (bcast_qp, credit_qp) = broadcast_and_credit_qps(&mut node0);
        let sent = ctx.broadcast_updates(
            &[],
            bcast_qp,
            credit_qp,
            &table,
        );
        assert_eq!(sent, 0);
        let (bcast_qp, credit_qp) = broadcast_and_credit_qps(&mut node0);
        let sent = ctx.broadcast_updates(
            &pending,
            bcast_qp,
            credit_qp,
            &table,
        );
        assert_eq!(sent, COH_CREDITS as usize);
        assert_eq!(ctx.peer_state(1), CreditState::Stalled);
        assert_eq!(ctx.stats.stalls, 1);

        // Still stalled on the next pass; the stall counter moves.
        let (bcast_qp, credit_qp) = broadcast_and_credit_qps(&mut node0);
        let sent = ctx.broadcast_updates(
            &pending[COH_CREDITS as usize..],
            bcast_qp,
            credit_qp,
            &table,
        );
        assert_eq!(sent, 0);
        assert_eq!(ctx.stats.stalls, 2);

        // Node 1 returns one credit message; the queue drains.
        let mut peer = CoherenceContext::new(1, 0, 2, 64);
        let seen = vec![0u8; CREDITS_PER_MESSAGE as usize];
        peer.credit_returns(&seen, &mut *node1[WORKER_CREDIT_QP], &table);
        assert_eq!(peer.stats.credits_sent, 1);

        let (bcast_qp, credit_qp) = broadcast_and_credit_qps(&mut node0);
        let sent = ctx.broadcast_updates(
            &pending[COH_CREDITS as usize..],
            bcast_qp,
            credit_qp,
            &table,
        );
        assert_eq!(sent, CREDITS_PER_MESSAGE as usize);
        assert_eq!(ctx.peer_state(1), CreditState::Stalled);
        assert!(ctx.credits(1) <= COH_CREDITS);
    }

    #[test]
    fn ring_consumes_in_order_and_resets_slots() {
        let mut ctx = CoherenceContext::new(0, 0, 2, 8);
        for tag in 1..=3u64 {
            let mut op = Op::put(KeyFingerprint::from_parts(1, tag), b"u").unwrap();
            op.opcode = Opcode::Update;
            ctx.deposit(op);
        }
        let mut out = Vec::new();
        assert_eq!(ctx.poll_coherence(&mut out), 3);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].key.tag, 1);
        assert_eq!(out[2].key.tag, 3);

        // Ring is drained; nothing more to consume.
        let mut again = Vec::new();
        assert_eq!(ctx.poll_coherence(&mut again), 0);
    }

    #[test]
    fn invalid_ring_opcode_halts_the_pass() {
        let mut ctx = CoherenceContext::new(0, 0, 2, 8);
        let mut good = Op::put(KeyFingerprint::from_parts(1, 1), b"u").unwrap();
        good.opcode = Opcode::Update;
        ctx.deposit(good);
        // A GET must never appear on the coherence ring.
        ctx.deposit(Op::get(KeyFingerprint::from_parts(1, 2)));
        let mut bad = Op::put(KeyFingerprint::from_parts(1, 3), b"u").unwrap();
        bad.opcode = Opcode::Update;
        ctx.deposit(bad);

        let mut out = Vec::new();
        assert_eq!(ctx.poll_coherence(&mut out), 1);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn credit_conservation_bounds_hold() {
        let (mut node0, _node1, table) = two_node_fabric();
        let mut ctx = CoherenceContext::new(0, 0, 2, 64);
        let pending: Vec<Op> = (0..100u64).map(bcast_op).collect();
        let mut sent_total = 0;
        for chunk in pending.chunks(7) {
            let (bcast_qp, credit_qp) = broadcast_and_credit_qps(&mut node0);
            sent_total += ctx.broadcast_updates(
                chunk,
                bcast_qp,
                credit_qp,
                &table,
            );
            // P2: credits stay within [0, C_MAX] at every observation.
            assert!(ctx.credits(1) <= COH_CREDITS);
            // P3: sent minus returned stays within the credit window.
            assert!(sent_total <= COH_CREDITS as usize);
        }
        assert_eq!(sent_total, COH_CREDITS as usize);
    }
}
