use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};

use byteorder::{ByteOrder, LittleEndian};
use log::warn;

use super::{Datagram, PeerAddr, QueuePair, Transport};
use crate::bootstrap::parse_qp_name;
use crate::config::{SEND_Q_DEPTH, WORKER_NUM_QPS};
use crate::{Result, ShardError};

/// Bytes of transport envelope prepended to every payload: the 32-bit
/// immediate.
const ENVELOPE: usize = 4;

/// A UDP datagram transport. Worker queue pairs bind deterministic
/// ports derived from their published name, so peer addresses resolve
/// arithmetically with no external registry.
pub struct UdpTransport {
    /// One IPv4 host per node, indexed by node id.
    hosts: Vec<Ipv4Addr>,
    /// First port of this deployment's port range.
    base_port: u16,
}

impl UdpTransport {
    /// Creates a fabric over the given per-node hosts.
    pub fn new(hosts: Vec<Ipv4Addr>, base_port: u16) -> UdpTransport {
        UdpTransport { hosts, base_port }
    }

    fn qp_port(&self, worker: usize, qp: usize) -> u16 {
        self.base_port + (worker * WORKER_NUM_QPS + qp) as u16
    }
}

impl Transport for UdpTransport {
    fn create_qp(&self, name: &str) -> Result<Box<dyn QueuePair>> {
        let socket = match parse_qp_name(name) {
            // A worker queue pair binds its deterministic port.
            Some((_node, worker, qp)) => UdpSocket::bind(SocketAddrV4::new(
                Ipv4Addr::UNSPECIFIED,
                self.qp_port(worker, qp),
            ))?,
            // Anything else (clients) takes an ephemeral port.
            None => UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))?,
        };
        socket.set_nonblocking(true)?;
        let local = socket.local_addr()?;
        let host = match local.ip() {
            std::net::IpAddr::V4(v4) => u32::from(v4),
            std::net::IpAddr::V6(_) => {
                return Err(ShardError::Config("IPv6 endpoints unsupported".to_owned()))
            }
        };
        Ok(Box::new(UdpQp {
            addr: PeerAddr {
                host,
                port: local.port(),
            },
            socket,
            outstanding: 0,
        }))
    }

    fn resolve(&self, name: &str) -> Option<PeerAddr> {
        let (node, worker, qp) = parse_qp_name(name)?;
        let host = self.hosts.get(node)?;
        Some(PeerAddr {
            host: u32::from(*host),
            port: self.qp_port(worker, qp),
        })
    }
}

struct UdpQp {
    addr: PeerAddr,
    socket: UdpSocket,
    outstanding: usize,
}

impl QueuePair for UdpQp {
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
        let mut frame = vec![0u8; ENVELOPE + payload.len()];
        LittleEndian::write_u32(&mut frame[..ENVELOPE], immediate);
        frame[ENVELOPE..].copy_from_slice(payload);
        let dest = SocketAddr::from((Ipv4Addr::from(dst.host), dst.port));
        self.socket.send_to(&frame, dest)?;
        if signaled {
            self.outstanding += 1;
        }
        Ok(())
    }

    fn poll_recv(&mut self, max: usize, out: &mut Vec<Datagram>) -> usize {
        let mut buf = [0u8; 2048];
        let mut n = 0;
        while n < max {
            match self.socket.recv_from(&mut buf) {
                Ok((len, src)) => {
                    if len < ENVELOPE {
                        warn!("runt datagram of {} bytes dropped", len);
                        continue;
                    }
                    let host = match src.ip() {
                        std::net::IpAddr::V4(v4) => u32::from(v4),
                        std::net::IpAddr::V6(_) => continue,
                    };
                    out.push(Datagram {
                        src: PeerAddr {
                            host,
                            port: src.port(),
                        },
                        immediate: LittleEndian::read_u32(&buf[..ENVELOPE]),
                        payload: buf[ENVELOPE..len].to_vec(),
                    });
                    n += 1;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("recv error on {:?}: {}", self.addr, e);
                    break;
                }
            }
        }
        n
    }

    fn poll_send_completions(&mut self) -> usize {
        let reaped = self.outstanding;
        self.outstanding = 0;
        reaped
    }
}
