//! Wire frame codec.
//!
//! ```text
//!  0               1               2               3
//! +-------------------------------+-------------------------------+
//! |                           Chain ID                            |
//! +-------------------------------+-------------------------------+
//! |         Message Type          |            Version            |
//! +-------------------------------+-------------------------------+
//! |                 Data Length (compressed bytes)                |
//! +---------------------------------------------------------------+
//! |                 Data Checksum (CRC32, IEEE)                   |
//! +---------------------------------------------------------------+
//! |                     Data (snappy, raw block)                  |
//! +---------------------------------------------------------------+
//! ```
//!
//! All integers are big-endian.

use std::fmt;

use sha2::{Digest, Sha256};

use crate::network::address::PeerId;
use crate::network::error::{P2PError, Result};
use crate::network::MAX_MESSAGE_SIZE;

pub const CHAIN_ID_RANGE: std::ops::Range<usize> = 0..4;
pub const MESSAGE_TYPE_RANGE: std::ops::Range<usize> = 4..6;
pub const VERSION_RANGE: std::ops::Range<usize> = 6..8;
pub const DATA_LENGTH_RANGE: std::ops::Range<usize> = 8..12;
pub const CHECKSUM_RANGE: std::ops::Range<usize> = 12..16;
/// Size of the fixed frame header.
pub const HEADER_SIZE: usize = 16;

/// Network message types. Unrecognised values are kept as `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Ping,
    Pong,
    RoutingTableQuery,
    RoutingTableResponse,
    PublishTx,
    Unknown(u16),
}

impl MessageType {
    pub fn as_u16(self) -> u16 {
        match self {
            MessageType::Ping => 1,
            MessageType::Pong => 2,
            MessageType::RoutingTableQuery => 3,
            MessageType::RoutingTableResponse => 4,
            MessageType::PublishTx => 5,
            MessageType::Unknown(v) => v,
        }
    }

    /// Gossip-class messages are subject to duplicate suppression.
    pub fn is_gossip(self) -> bool {
        matches!(self, MessageType::PublishTx | MessageType::Unknown(_))
    }
}

impl From<u16> for MessageType {
    fn from(value: u16) -> Self {
        match value {
            1 => MessageType::Ping,
            2 => MessageType::Pong,
            3 => MessageType::RoutingTableQuery,
            4 => MessageType::RoutingTableResponse,
            5 => MessageType::PublishTx,
            v => MessageType::Unknown(v),
        }
    }
}

impl From<MessageType> for u16 {
    fn from(value: MessageType) -> Self {
        value.as_u16()
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::Ping => write!(f, "Ping"),
            MessageType::Pong => write!(f, "Pong"),
            MessageType::RoutingTableQuery => write!(f, "RoutingTableQuery"),
            MessageType::RoutingTableResponse => write!(f, "RoutingTableResponse"),
            MessageType::PublishTx => write!(f, "PublishTx"),
            MessageType::Unknown(v) => write!(f, "Unknown({})", v),
        }
    }
}

/// Outbound delivery class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessagePriority {
    Urgent,
    Normal,
}

/// One decoded wire frame. `data` holds the compressed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    chain_id: u32,
    message_type: MessageType,
    version: u16,
    checksum: u32,
    data: Vec<u8>,
}

impl Frame {
    /// Compresses `payload` and builds a frame around it.
    pub fn new(chain_id: u32, message_type: MessageType, version: u16, payload: &[u8]) -> Result<Self> {
        let data = if payload.is_empty() {
            Vec::new()
        } else {
            snap::raw::Encoder::new()
                .compress_vec(payload)
                .map_err(|e| P2PError::PayloadCorrupt(e.to_string()))?
        };
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(P2PError::FrameTooLarge {
                size: data.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        let checksum = crc32fast::hash(&data);

        Ok(Self {
            chain_id,
            message_type,
            version,
            checksum,
            data,
        })
    }

    /// Parses a complete frame, checking checksum then length.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(P2PError::MessageTooShort { len: bytes.len() });
        }

        let header = FrameHeader::parse(&bytes[..HEADER_SIZE]);
        let data = &bytes[HEADER_SIZE..];

        let actual = crc32fast::hash(data);
        if actual != header.checksum {
            return Err(P2PError::ChecksumMismatch {
                expected: header.checksum,
                actual,
            });
        }
        if data.len() != header.data_length as usize {
            return Err(P2PError::LengthMismatch {
                declared: header.data_length,
                actual: data.len(),
            });
        }

        Ok(Self {
            chain_id: header.chain_id,
            message_type: header.message_type,
            version: header.version,
            checksum: header.checksum,
            data: data.to_vec(),
        })
    }

    /// Serialises header and compressed payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; HEADER_SIZE + self.data.len()];
        out[CHAIN_ID_RANGE].copy_from_slice(&self.chain_id.to_be_bytes());
        out[MESSAGE_TYPE_RANGE].copy_from_slice(&self.message_type.as_u16().to_be_bytes());
        out[VERSION_RANGE].copy_from_slice(&self.version.to_be_bytes());
        out[DATA_LENGTH_RANGE].copy_from_slice(&(self.data.len() as u32).to_be_bytes());
        out[CHECKSUM_RANGE].copy_from_slice(&self.checksum.to_be_bytes());
        out[HEADER_SIZE..].copy_from_slice(&self.data);
        out
    }

    /// Decompresses the payload.
    pub fn payload(&self) -> Result<Vec<u8>> {
        if self.data.is_empty() {
            return Ok(Vec::new());
        }
        snap::raw::Decoder::new()
            .decompress_vec(&self.data)
            .map_err(|e| P2PError::PayloadCorrupt(e.to_string()))
    }

    pub fn chain_id(&self) -> u32 {
        self.chain_id
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn version(&self) -> u16 {
        self.version
    }

    /// Encoded size on the wire.
    pub fn len(&self) -> usize {
        HEADER_SIZE + self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Digest used by the recently-seen filters.
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.message_type.as_u16().to_be_bytes());
        hasher.update(&self.data);
        hasher.finalize().into()
    }
}

/// Fixed header fields, readable before the payload arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub chain_id: u32,
    pub message_type: MessageType,
    pub version: u16,
    pub data_length: u32,
    pub checksum: u32,
}

impl FrameHeader {
    /// `header` must be exactly `HEADER_SIZE` bytes.
    pub fn parse(header: &[u8]) -> Self {
        let u32_at = |r: std::ops::Range<usize>| {
            let mut b = [0u8; 4];
            b.copy_from_slice(&header[r]);
            u32::from_be_bytes(b)
        };
        let u16_at = |r: std::ops::Range<usize>| {
            let mut b = [0u8; 2];
            b.copy_from_slice(&header[r]);
            u16::from_be_bytes(b)
        };

        Self {
            chain_id: u32_at(CHAIN_ID_RANGE),
            message_type: MessageType::from(u16_at(MESSAGE_TYPE_RANGE)),
            version: u16_at(VERSION_RANGE),
            data_length: u32_at(DATA_LENGTH_RANGE),
            checksum: u32_at(CHECKSUM_RANGE),
        }
    }
}

/// Encodes a frame straight to bytes.
pub fn encode(chain_id: u32, message_type: MessageType, version: u16, payload: &[u8]) -> Result<Vec<u8>> {
    Ok(Frame::new(chain_id, message_type, version, payload)?.to_bytes())
}

/// A decoded message as handed to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub from: PeerId,
    pub message_type: MessageType,
    pub data: Vec<u8>,
}
