use std::io;
use thiserror::Error;

use crate::network::address::PeerId;
use crate::network::message::MessagePriority;

/// Errors produced by the overlay network.
#[derive(Error, Debug)]
pub enum P2PError {
    #[error("message too short: {len} bytes")]
    MessageTooShort { len: usize },
    #[error("invalid data checksum: header {expected:#010x}, computed {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
    #[error("unmatched data length: header {declared}, actual {actual}")]
    LengthMismatch { declared: u32, actual: usize },
    #[error("payload corrupt: {0}")]
    PayloadCorrupt(String),
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
    #[error("mismatched chain id: expected {expected}, got {actual}")]
    ChainIdMismatch { expected: u32, actual: u32 },
    #[error("mismatched version: expected {expected}, got {actual}")]
    VersionMismatch { expected: u16, actual: u16 },

    #[error("{priority:?} mailbox is full")]
    MailboxFull { priority: MessagePriority },
    #[error("stream count exceeded (max {max})")]
    StreamCountExceeded { max: usize },
    #[error("too many neighbors (max {max})")]
    TooManyNeighbors { max: usize },

    #[error("port {0} is unavailable")]
    PortUnavailable(u16),
    #[error("no external IPv4 address found, are you connected to the network?")]
    NoExternalAddress,
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("invalid peer id: {0}")]
    InvalidPeerId(String),
    #[error("identity error: {0}")]
    Identity(String),
    #[error("config error: {0}")]
    Config(String),

    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("peer id mismatch: expected {expected}, got {actual}")]
    PeerIdMismatch { expected: PeerId, actual: PeerId },
    #[error("peer not found: {0}")]
    PeerNotFound(PeerId),
    #[error("peer is closed")]
    PeerClosed,
    #[error("write deadline of {0:?} exceeded")]
    WriteTimeout(std::time::Duration),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

impl P2PError {
    /// Malformed or foreign frames. Never worth retrying.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            P2PError::MessageTooShort { .. }
                | P2PError::ChecksumMismatch { .. }
                | P2PError::LengthMismatch { .. }
                | P2PError::PayloadCorrupt(_)
                | P2PError::FrameTooLarge { .. }
                | P2PError::ChainIdMismatch { .. }
                | P2PError::VersionMismatch { .. }
                | P2PError::Handshake(_)
                | P2PError::PeerIdMismatch { .. }
        )
    }

    /// Backpressure rejections; the caller may retry later.
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(
            self,
            P2PError::MailboxFull { .. }
                | P2PError::StreamCountExceeded { .. }
                | P2PError::TooManyNeighbors { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, P2PError>;
