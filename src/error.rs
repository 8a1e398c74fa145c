use std::io;
use thiserror::Error;

/// Error type for shardkv operations.
#[derive(Error, Debug)]
pub enum ShardError {
    /// IO error from socket operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Serialization/deserialization error (cluster config files).
    #[error("Serde error: {0}")]
    Serde(#[from] serde_json::Error),

    /// A datagram was addressed to a peer with no published address handle.
    #[error("No address handle for peer {0}")]
    UnknownPeer(u32),

    /// A wire frame carried an opcode outside the protocol.
    #[error("Invalid opcode {0}")]
    InvalidOpcode(u8),

    /// A wire frame was neither a client request nor a forward request.
    #[error("Unrecognized frame length {0}")]
    BadFrameLength(usize),

    /// A value exceeded the fixed wire capacity.
    #[error("Value length {0} exceeds maximum")]
    ValueTooLarge(usize),

    /// Topology or layout configuration violated a startup invariant.
    #[error("Config error: {0}")]
    Config(String),

    /// A local request channel was closed on the other side.
    #[error("Local request channel disconnected")]
    ChannelClosed,

    /// Error message from a remote node.
    #[error("{0}")]
    StringError(String),
}

/// Result type alias for shardkv operations.
pub type Result<T> = std::result::Result<T, ShardError>;
