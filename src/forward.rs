//! Inter-node request forwarding. A worker that receives a request for
//! a shard it does not own re-addresses it to the owning worker, which
//! answers the client directly.

use log::error;

use crate::bootstrap::AddressTable;
use crate::config::WORKER_REQ_QP;
use crate::protocol::{ForwardRequest, Response, FORWARD_WIRE_SIZE, RESP_WIRE_SIZE};
use crate::router::{Partitioned, ShardRouter};
use crate::store::KvStore;
use crate::transport::{PeerAddr, QueuePair, SendDesc};
use crate::Result;

/// Forwards the remote partition of a miss batch, one linked chain,
/// one post call. Fire-and-forget: no response is synthesized here
/// beyond the placeholder that keeps the response array aligned; the
/// owner responds to the client directly.
///
/// Returns the number of forwards posted (zero when the chain fails;
/// a dropped chain is logged, not retried).
pub fn forward_batch(
    router: &ShardRouter,
    parts: &Partitioned,
    client_returns: &[PeerAddr],
    req_qp: &mut dyn QueuePair,
    addrs: &AddressTable,
    resp: &mut [Response],
) -> usize {
    if parts.remote_ops.is_empty() {
        return 0;
    }
    debug_assert_eq!(parts.remote_ops.len(), client_returns.len());

    let mut frames = vec![[0u8; FORWARD_WIRE_SIZE]; parts.remote_ops.len()];
    for (i, op) in parts.remote_ops.iter().enumerate() {
        let fr = ForwardRequest {
            op: *op,
            client_ip: client_returns[i].host,
            client_port: client_returns[i].port,
            origin_node: router.self_node,
            target_node: parts.remote_targets[i],
            request_id: parts.remote_indices[i] as u64,
        };
        fr.encode(&mut frames[i]);
    }

    let descs: Vec<SendDesc<'_>> = frames
        .iter()
        .enumerate()
        .map(|(i, frame)| SendDesc {
            dst: addrs.worker_qp_at(
                parts.remote_targets[i] as usize,
                router.owner_worker(&parts.remote_ops[i].key),
                WORKER_REQ_QP,
            ),
            payload: frame,
            immediate: u32::from(router.self_node),
            signaled: true,
        })
        .collect();

    let posted = match req_qp.post_send_chain(&descs) {
        Ok(()) => descs.len(),
        Err(e) => {
            error!(
                "node {}: forward chain of {} dropped: {}",
                router.self_node,
                descs.len(),
                e
            );
            0
        }
    };

    // Placeholder responses keep the batch aligned; they are never put
    // on the wire.
    for &idx in &parts.remote_indices {
        resp[idx] = Response::empty();
    }
    posted
}

/// Serves a forwarded request against the local store and answers the
/// originating client directly, echoing the request id.
pub fn handle_forwarded(
    fr: &ForwardRequest,
    kv: &KvStore,
    req_qp: &mut dyn QueuePair,
    self_node: u8,
) -> Result<()> {
    let mut resp = [Response::empty(); 1];
    kv.batch_op(std::slice::from_ref(&fr.op), &mut resp);
    resp[0].request_id = fr.request_id;

    let mut frame = [0u8; RESP_WIRE_SIZE];
    resp[0].encode(&mut frame);
    req_qp.post_send(
        PeerAddr {
            host: fr.client_ip,
            port: fr.client_port,
        },
        &frame,
        u32::from(self_node),
        false,
    )
}
