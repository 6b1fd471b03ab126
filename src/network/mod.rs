//! Peer-to-peer overlay: framed messages over authenticated TCP streams,
//! per-peer priority mailboxes, and an XOR routing table persisted to disk.

use std::time::Duration;

pub mod address;
pub mod error;
pub mod identity;
pub mod message;
pub mod peer;
pub mod peer_manager;
pub mod routing;
pub mod service;
pub mod transport;

pub use address::{PeerAddr, PeerId};
pub use error::{P2PError, Result};
pub use message::{Frame, IncomingMessage, MessagePriority, MessageType};
pub use peer::{Peer, PeerEvent, PeerSettings};
pub use peer_manager::{PeerManager, Subscription};
pub use routing::RoutingTable;
pub use service::NetService;

/// Application protocol spoken on every stream.
pub const PROTOCOL_ID: &str = "/tamchain/1.0";

pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);
pub const PORT_PROBE_TIMEOUT: Duration = Duration::from_secs(1);
pub const MAX_MESSAGE_SIZE: usize = 32 * 1024 * 1024; // 32MB compressed

// Recently-seen filter sizing
pub const BLOOM_MAX_ITEMS: usize = 100_000;
pub const BLOOM_ERROR_RATE: f64 = 0.001;

pub const DEFAULT_LISTEN_PORT: u16 = 30333;
pub const DEFAULT_MAX_STREAMS: usize = 4;
pub const DEFAULT_MAILBOX_CAPACITY: usize = 1024;
pub const DEFAULT_MAX_NEIGHBORS: usize = 32;
pub const DEFAULT_BUCKET_SIZE: usize = 20;
pub const DEFAULT_MIN_WRITE_THROUGHPUT: u64 = 5 * 1024; // 5kB/s
pub const DEFAULT_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(120);
pub const DEFAULT_ROUTING_SYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Address-book snapshot file name under the data directory.
pub const ROUTING_TABLE_FILE: &str = "routing.table";
