//! The datagram transport: message-oriented queue pairs offering
//! post-send, post-receive draining, and completion polling. Queue
//! pairs are single-owner; workers never share them.

mod loopback;
mod udp;

pub use self::loopback::LoopbackTransport;
pub use self::udp::UdpTransport;

use crate::Result;

/// A peer address: host half and port half. On UDP this is a literal
/// IPv4 socket address; the loopback transport synthesizes compatible
/// values so the same wire format carries return addresses everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerAddr {
    /// Host half (IPv4 in network order on UDP).
    pub host: u32,
    /// Port half.
    pub port: u16,
}

/// One received datagram, stripped of the transport envelope.
#[derive(Debug)]
pub struct Datagram {
    /// Sender's address, taken from the envelope.
    pub src: PeerAddr,
    /// 32-bit immediate carried alongside the payload; coherence and
    /// credit messages put the sender's node id here.
    pub immediate: u32,
    /// Message payload.
    pub payload: Vec<u8>,
}

/// One element of a linked send chain.
pub struct SendDesc<'a> {
    /// Destination queue pair.
    pub dst: PeerAddr,
    /// Payload bytes (may be empty for credit returns).
    pub payload: &'a [u8],
    /// Immediate value for the envelope.
    pub immediate: u32,
    /// Whether this send produces a completion to reap.
    pub signaled: bool,
}

/// A datagram queue pair owned by exactly one worker (or client).
pub trait QueuePair: Send {
    /// The address this queue pair receives on.
    fn addr(&self) -> PeerAddr;

    /// Posts one datagram send. Fails when the send queue is full of
    /// unreaped signaled sends.
    fn post_send(
        &mut self,
        dst: PeerAddr,
        payload: &[u8],
        immediate: u32,
        signaled: bool,
    ) -> Result<()>;

    /// Posts a whole chain with a single call. The chain either posts
    /// in order or stops at the first failure.
    fn post_send_chain(&mut self, chain: &[SendDesc<'_>]) -> Result<()> {
        for desc in chain {
            self.post_send(desc.dst, desc.payload, desc.immediate, desc.signaled)?;
        }
        Ok(())
    }

    /// Drains up to `max` pending datagrams into `out`. Non-blocking.
    fn poll_recv(&mut self, max: usize, out: &mut Vec<Datagram>) -> usize;

    /// Reaps completions of signaled sends, freeing send-queue slots.
    fn poll_send_completions(&mut self) -> usize;
}

/// A transport fabric: creates queue pairs and resolves published
/// queue-pair names to addresses.
pub trait Transport: Send + Sync + 'static {
    /// Creates a queue pair, publishing it under `name` for peers to
    /// resolve.
    fn create_qp(&self, name: &str) -> Result<Box<dyn QueuePair>>;

    /// Resolves a published queue-pair name. Returns `None` until the
    /// peer has created it.
    fn resolve(&self, name: &str) -> Option<PeerAddr>;
}
