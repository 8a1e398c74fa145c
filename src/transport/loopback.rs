use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam::channel::{self, Receiver, Sender};
use log::warn;

use super::{Datagram, PeerAddr, QueuePair, Transport};
use crate::config::SEND_Q_DEPTH;
use crate::{Result, ShardError};

/// Loopback host half: all synthetic addresses live on 127.0.0.1 so a
/// return address round-trips through the wire format unchanged.
const LOOPBACK_HOST: u32 = 0x7f00_0001;

/// An in-process transport backed by unbounded channels. Used by tests
/// and by single-host deployments where every node is co-located.
pub struct LoopbackTransport {
    endpoints: Arc<Mutex<HashMap<PeerAddr, Sender<Datagram>>>>,
    names: Arc<Mutex<HashMap<String, PeerAddr>>>,
    next_port: AtomicU32,
}

impl LoopbackTransport {
    /// Creates an empty fabric.
    pub fn new() -> Arc<LoopbackTransport> {
        Arc::new(LoopbackTransport {
            endpoints: Arc::new(Mutex::new(HashMap::new())),
            names: Arc::new(Mutex::new(HashMap::new())),
            next_port: AtomicU32::new(1),
        })
    }
}

impl Transport for LoopbackTransport {
    fn create_qp(&self, name: &str) -> Result<Box<dyn QueuePair>> {
        let port = self.next_port.fetch_add(1, Ordering::Relaxed);
        if port > u16::MAX as u32 {
            return Err(ShardError::Config(
                "loopback fabric exhausted its port space".to_owned(),
            ));
        }
        let addr = PeerAddr {
            host: LOOPBACK_HOST,
            port: port as u16,
        };
        let (tx, rx) = channel::unbounded();
        self.endpoints
            .lock()
            .expect("loopback endpoint table poisoned")
            .insert(addr, tx);
        self.names
            .lock()
            .expect("loopback name table poisoned")
            .insert(name.to_owned(), addr);
        Ok(Box::new(LoopbackQp {
            addr,
            rx,
            endpoints: self.endpoints.clone(),
            outstanding: 0,
        }))
    }

    fn resolve(&self, name: &str) -> Option<PeerAddr> {
        self.names
            .lock()
            .expect("loopback name table poisoned")
            .get(name)
            .copied()
    }
}

struct LoopbackQp {
    addr: PeerAddr,
    rx: Receiver<Datagram>,
    endpoints: Arc<Mutex<HashMap<PeerAddr, Sender<Datagram>>>>,
    /// Signaled sends posted but not yet reaped.
    outstanding: usize,
}

impl QueuePair for LoopbackQp {
    fn addr(&self) -> PeerAddr {
        self.addr
    }

    fn post_send(
        &mut self,
        dst: PeerAddr,
        payload: &[u8],
        immediate: u32,
        signaled: bool,
    ) -> Result<()> {
        if self.outstanding >= SEND_Q_DEPTH {
            return Err(ShardError::StringError(
                "send queue full; completions not reaped".to_owned(),
            ));
        }
        let tx = {
            let endpoints = self
                .endpoints
                .lock()
                .expect("loopback endpoint table poisoned");
            endpoints
                .get(&dst)
                .cloned()
                .ok_or(ShardError::UnknownPeer(u32::from(dst.port)))?
        };
        let dgram = Datagram {
            src: self.addr,
            immediate,
            payload: payload.to_vec(),
        };
        if tx.send(dgram).is_err() {
            // Receiver dropped; a dead peer behaves like a lossy wire.
            warn!("loopback send to departed peer {:?}", dst);
        }
        if signaled {
            self.outstanding += 1;
        }
        Ok(())
    }

    fn poll_recv(&mut self, max: usize, out: &mut Vec<Datagram>) -> usize {
        let mut n = 0;
        while n < max {
            match self.rx.try_recv() {
                Ok(dgram) => {
                    out.push(dgram);
                    n += 1;
                }
                Err(_) => break,
            }
        }
        n
    }

    fn poll_send_completions(&mut self) -> usize {
        // Channel sends complete synchronously, so every outstanding
        // signaled send has already finished by the time we reap.
        let reaped = self.outstanding;
        self.outstanding = 0;
        reaped
    }
}
