use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use sha2::{Digest, Sha256};

use crate::network::error::{P2PError, Result};

/// Separator between the transport address and the peer id.
pub const PEER_SEPARATOR: &str = "/peer/";

/// Stable identifier of a node: SHA-256 of its ed25519 verifying key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; 32]);

impl PeerId {
    pub fn from_public_key(public_key: &[u8]) -> Self {
        Self(Sha256::digest(public_key).into())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// XOR distance between two ids.
    pub fn distance(&self, other: &PeerId) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    /// Abbreviated form for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

impl FromStr for PeerId {
    type Err = P2PError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| P2PError::InvalidPeerId(format!("{}: {}", s, e)))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| P2PError::InvalidPeerId(format!("{}: expected 32 bytes", s)))?;
        Ok(Self(bytes))
    }
}

/// Renders a socket address as `/ip4/<ip>/tcp/<port>` (or `/ip6/...`).
pub fn format_transport_addr(addr: &SocketAddr) -> String {
    match addr.ip() {
        IpAddr::V4(ip) => format!("/ip4/{}/tcp/{}", ip, addr.port()),
        IpAddr::V6(ip) => format!("/ip6/{}/tcp/{}", ip, addr.port()),
    }
}

/// Parses `/ip4/<ip>/tcp/<port>` or `/ip6/<ip>/tcp/<port>`.
pub fn parse_transport_addr(s: &str) -> Result<SocketAddr> {
    let invalid = || P2PError::InvalidAddress(s.to_string());

    let parts: Vec<&str> = s.split('/').collect();
    // Leading '/' yields an empty first component.
    if parts.len() != 5 || !parts[0].is_empty() || parts[3] != "tcp" {
        return Err(invalid());
    }
    let ip: IpAddr = match parts[1] {
        "ip4" => IpAddr::V4(parts[2].parse().map_err(|_| invalid())?),
        "ip6" => IpAddr::V6(parts[2].parse().map_err(|_| invalid())?),
        _ => return Err(invalid()),
    };
    let port: u16 = parts[4].parse().map_err(|_| invalid())?;
    Ok(SocketAddr::new(ip, port))
}

/// A reachable peer: `<transport-address>/peer/<PeerID>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerAddr {
    pub peer_id: PeerId,
    pub addr: SocketAddr,
}

impl PeerAddr {
    pub fn new(peer_id: PeerId, addr: SocketAddr) -> Self {
        Self { peer_id, addr }
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", format_transport_addr(&self.addr), PEER_SEPARATOR, self.peer_id)
    }
}

impl FromStr for PeerAddr {
    type Err = P2PError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let parts: Vec<&str> = s.split(PEER_SEPARATOR).collect();
        if parts.len() != 2 {
            return Err(P2PError::InvalidAddress(s.to_string()));
        }
        let addr = parse_transport_addr(parts[0])?;
        let peer_id = parts[1].parse()?;
        Ok(Self { peer_id, addr })
    }
}
