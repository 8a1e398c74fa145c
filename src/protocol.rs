//! Fixed-size wire formats: ops, responses, and forwarded requests.
//! Frames are told apart purely by byte length.

use byteorder::{ByteOrder, LittleEndian};

use crate::config::VALUE_MAX;
use crate::key::KeyFingerprint;
use crate::{Result, ShardError};

/// Wire size of an [`Op`]: 16-byte key, opcode, pad, length, pad, value.
pub const OP_WIRE_SIZE: usize = 16 + 1 + 1 + 2 + 4 + VALUE_MAX;

/// Wire size of a [`ForwardRequest`]: the op plus client return address
/// (4 + 2), origin and target node (1 + 1), and a request id (8).
pub const FORWARD_WIRE_SIZE: usize = OP_WIRE_SIZE + 4 + 2 + 1 + 1 + 8;

/// Wire size of a [`Response`].
pub const RESP_WIRE_SIZE: usize = 1 + 1 + 2 + 4 + 8 + VALUE_MAX;

/// Operation codes carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Read a key.
    Get = 1,
    /// Write a key at its owner.
    Put = 2,
    /// A completed local write pending replication to peers.
    Broadcast = 3,
    /// A replicated write arriving from a peer.
    Update = 4,
}

impl Opcode {
    fn from_u8(raw: u8) -> Result<Opcode> {
        match raw {
            1 => Ok(Opcode::Get),
            2 => Ok(Opcode::Put),
            3 => Ok(Opcode::Broadcast),
            4 => Ok(Opcode::Update),
            other => Err(ShardError::InvalidOpcode(other)),
        }
    }
}

/// A fixed-size key-value operation. The value buffer is always
/// `VALUE_MAX` bytes on the wire; `val_len` bounds the live prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Op {
    /// Key fingerprint this op addresses.
    pub key: KeyFingerprint,
    /// What to do.
    pub opcode: Opcode,
    /// Live bytes in `value`.
    pub val_len: u16,
    /// Value payload (writes only; zeroed for reads).
    pub value: [u8; VALUE_MAX],
}

impl Op {
    /// Builds a GET for `key`.
    pub fn get(key: KeyFingerprint) -> Op {
        Op {
            key,
            opcode: Opcode::Get,
            val_len: 0,
            value: [0; VALUE_MAX],
        }
    }

    /// Builds a PUT of `value` to `key`.
    pub fn put(key: KeyFingerprint, value: &[u8]) -> Result<Op> {
        if value.len() > VALUE_MAX {
            return Err(ShardError::ValueTooLarge(value.len()));
        }
        let mut buf = [0u8; VALUE_MAX];
        buf[..value.len()].copy_from_slice(value);
        Ok(Op {
            key,
            opcode: Opcode::Put,
            val_len: value.len() as u16,
            value: buf,
        })
    }

    /// The live value bytes.
    pub fn value(&self) -> &[u8] {
        &self.value[..self.val_len as usize]
    }

    /// Encodes into exactly [`OP_WIRE_SIZE`] bytes.
    pub fn encode(&self, buf: &mut [u8]) {
        assert_eq!(buf.len(), OP_WIRE_SIZE);
        LittleEndian::write_u64(&mut buf[0..8], self.key.bucket);
        LittleEndian::write_u64(&mut buf[8..16], self.key.tag);
        buf[16] = self.opcode as u8;
        buf[17] = 0;
        LittleEndian::write_u16(&mut buf[18..20], self.val_len);
        LittleEndian::write_u32(&mut buf[20..24], 0);
        buf[24..24 + VALUE_MAX].copy_from_slice(&self.value);
    }

    /// Decodes from exactly [`OP_WIRE_SIZE`] bytes.
    pub fn decode(buf: &[u8]) -> Result<Op> {
        if buf.len() != OP_WIRE_SIZE {
            return Err(ShardError::BadFrameLength(buf.len()));
        }
        let key = KeyFingerprint::from_parts(
            LittleEndian::read_u64(&buf[0..8]),
            LittleEndian::read_u64(&buf[8..16]),
        );
        let opcode = Opcode::from_u8(buf[16])?;
        let val_len = LittleEndian::read_u16(&buf[18..20]);
        if val_len as usize > VALUE_MAX {
            return Err(ShardError::ValueTooLarge(val_len as usize));
        }
        let mut value = [0u8; VALUE_MAX];
        value.copy_from_slice(&buf[24..24 + VALUE_MAX]);
        Ok(Op {
            key,
            opcode,
            val_len,
            value,
        })
    }
}

/// Response kinds carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RespKind {
    /// Placeholder; nothing to report (forwarded slots).
    Empty = 0,
    /// GET found the key; the value is attached.
    GetSuccess = 1,
    /// GET did not find the key.
    GetMiss = 2,
    /// PUT installed at the owner's store.
    PutSuccess = 3,
    /// PUT applied to the replicated cache.
    CachePutSuccess = 4,
}

impl RespKind {
    fn from_u8(raw: u8) -> Result<RespKind> {
        match raw {
            0 => Ok(RespKind::Empty),
            1 => Ok(RespKind::GetSuccess),
            2 => Ok(RespKind::GetMiss),
            3 => Ok(RespKind::PutSuccess),
            4 => Ok(RespKind::CachePutSuccess),
            other => Err(ShardError::InvalidOpcode(other)),
        }
    }
}

/// A response to a single op. Values are copied out of the index at
/// lookup time, so a response stays valid across later batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    /// Outcome of the op.
    pub kind: RespKind,
    /// Correlates a forwarded op's owner response with the client's
    /// original request; zero on direct responses.
    pub request_id: u64,
    /// Live bytes in `value`.
    pub val_len: u16,
    /// Value payload for successful reads.
    pub value: [u8; VALUE_MAX],
}

impl Response {
    /// A placeholder response.
    pub fn empty() -> Response {
        Response {
            kind: RespKind::Empty,
            request_id: 0,
            val_len: 0,
            value: [0; VALUE_MAX],
        }
    }

    /// A response of the given kind with no value attached.
    pub fn of_kind(kind: RespKind) -> Response {
        Response {
            kind,
            ..Response::empty()
        }
    }

    /// A GET_SUCCESS carrying `value`.
    pub fn get_success(value: &[u8]) -> Response {
        let mut buf = [0u8; VALUE_MAX];
        buf[..value.len()].copy_from_slice(value);
        Response {
            kind: RespKind::GetSuccess,
            request_id: 0,
            val_len: value.len() as u16,
            value: buf,
        }
    }

    /// The live value bytes.
    pub fn value(&self) -> &[u8] {
        &self.value[..self.val_len as usize]
    }

    /// Encodes into exactly [`RESP_WIRE_SIZE`] bytes.
    pub fn encode(&self, buf: &mut [u8]) {
        assert_eq!(buf.len(), RESP_WIRE_SIZE);
        buf[0] = self.kind as u8;
        buf[1] = 0;
        LittleEndian::write_u16(&mut buf[2..4], self.val_len);
        LittleEndian::write_u32(&mut buf[4..8], 0);
        LittleEndian::write_u64(&mut buf[8..16], self.request_id);
        buf[16..16 + VALUE_MAX].copy_from_slice(&self.value);
    }

    /// Decodes from exactly [`RESP_WIRE_SIZE`] bytes.
    pub fn decode(buf: &[u8]) -> Result<Response> {
        if buf.len() != RESP_WIRE_SIZE {
            return Err(ShardError::BadFrameLength(buf.len()));
        }
        let kind = RespKind::from_u8(buf[0])?;
        let val_len = LittleEndian::read_u16(&buf[2..4]);
        if val_len as usize > VALUE_MAX {
            return Err(ShardError::ValueTooLarge(val_len as usize));
        }
        let request_id = LittleEndian::read_u64(&buf[8..16]);
        let mut value = [0u8; VALUE_MAX];
        value.copy_from_slice(&buf[16..16 + VALUE_MAX]);
        Ok(Response {
            kind,
            request_id,
            val_len,
            value,
        })
    }
}

/// A client request re-addressed to the owning node. Travels verbatim
/// on the wire and is told apart from a plain client op purely by byte
/// length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardRequest {
    /// The original op.
    pub op: Op,
    /// Client return address, host half.
    pub client_ip: u32,
    /// Client return address, port half.
    pub client_port: u16,
    /// Node that first received the request.
    pub origin_node: u8,
    /// Node that owns the key.
    pub target_node: u8,
    /// Correlation id echoed in the owner's response.
    pub request_id: u64,
}

impl ForwardRequest {
    /// Encodes into exactly [`FORWARD_WIRE_SIZE`] bytes.
    pub fn encode(&self, buf: &mut [u8]) {
        assert_eq!(buf.len(), FORWARD_WIRE_SIZE);
        self.op.encode(&mut buf[..OP_WIRE_SIZE]);
        let rest = &mut buf[OP_WIRE_SIZE..];
        LittleEndian::write_u32(&mut rest[0..4], self.client_ip);
        LittleEndian::write_u16(&mut rest[4..6], self.client_port);
        rest[6] = self.origin_node;
        rest[7] = self.target_node;
        LittleEndian::write_u64(&mut rest[8..16], self.request_id);
    }

    /// Decodes from exactly [`FORWARD_WIRE_SIZE`] bytes.
    pub fn decode(buf: &[u8]) -> Result<ForwardRequest> {
        if buf.len() != FORWARD_WIRE_SIZE {
            return Err(ShardError::BadFrameLength(buf.len()));
        }
        let op = Op::decode(&buf[..OP_WIRE_SIZE])?;
        let rest = &buf[OP_WIRE_SIZE..];
        Ok(ForwardRequest {
            op,
            client_ip: LittleEndian::read_u32(&rest[0..4]),
            client_port: LittleEndian::read_u16(&rest[4..6]),
            origin_node: rest[6],
            target_node: rest[7],
            request_id: LittleEndian::read_u64(&rest[8..16]),
        })
    }
}

/// A frame received on a worker's request queue pair.
#[derive(Debug)]
pub enum RequestFrame {
    /// A plain client op.
    Client(Op),
    /// An op forwarded by a peer worker.
    Forwarded(ForwardRequest),
}

/// Classifies an incoming request payload by byte length.
pub fn decode_request(payload: &[u8]) -> Result<RequestFrame> {
    match payload.len() {
        OP_WIRE_SIZE => Ok(RequestFrame::Client(Op::decode(payload)?)),
        FORWARD_WIRE_SIZE => Ok(RequestFrame::Forwarded(ForwardRequest::decode(payload)?)),
        other => Err(ShardError::BadFrameLength(other)),
    }
}
