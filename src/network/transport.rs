//! TCP transport: stream opening, the per-stream identity handshake, and the
//! local host probes the service needs before binding.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::network::address::{PeerAddr, PeerId};
use crate::network::error::{P2PError, Result};
use crate::network::identity::{verify_signature, Identity};
use crate::network::{CONNECTION_TIMEOUT, PORT_PROBE_TIMEOUT, PROTOCOL_ID};

const MAX_HANDSHAKE_SIZE: usize = 4096;
const HANDSHAKE_DOMAIN: &[u8] = b"tamchain-stream-handshake";

/// A bidirectional byte stream to a remote node.
pub trait PeerStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> PeerStream for T {}

pub type BoxedStream = Box<dyn PeerStream>;

/// Opens new authenticated streams to a known peer.
#[async_trait]
pub trait StreamOpener: Send + Sync {
    async fn open(&self, target: PeerAddr) -> Result<BoxedStream>;
}

/// Requests an external port mapping for the listener.
#[async_trait]
pub trait PortMapper: Send + Sync {
    /// Returns the externally reachable address if a mapping was made.
    async fn map_port(&self, local: SocketAddr) -> Result<Option<SocketAddr>>;
}

/// Port mapper that maps nothing.
pub struct NoPortMapping;

#[async_trait]
impl PortMapper for NoPortMapping {
    async fn map_port(&self, local: SocketAddr) -> Result<Option<SocketAddr>> {
        debug!("No port mapper configured. local={}", local);
        Ok(None)
    }
}

#[derive(Serialize, Deserialize)]
struct Hello {
    protocol: String,
    public_key: Vec<u8>,
    listen_port: u16,
    nonce: [u8; 32],
}

#[derive(Serialize, Deserialize)]
struct HelloProof {
    signature: Vec<u8>,
}

/// What the remote proved about itself during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteHello {
    pub peer_id: PeerId,
    pub listen_port: u16,
}

fn proof_message(nonce: &[u8; 32], public_key: &[u8], listen_port: u16) -> Vec<u8> {
    let mut msg = Vec::with_capacity(HANDSHAKE_DOMAIN.len() + 32 + public_key.len() + 2);
    msg.extend_from_slice(HANDSHAKE_DOMAIN);
    msg.extend_from_slice(nonce);
    msg.extend_from_slice(public_key);
    msg.extend_from_slice(&listen_port.to_be_bytes());
    msg
}

async fn write_frame<S: AsyncWrite + Unpin>(stream: &mut S, bytes: &[u8]) -> Result<()> {
    stream.write_u32(bytes.len() as u32).await?;
    stream.write_all(bytes).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Vec<u8>> {
    let len = stream.read_u32().await? as usize;
    if len > MAX_HANDSHAKE_SIZE {
        return Err(P2PError::Handshake(format!("handshake message of {} bytes", len)));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Runs the symmetric stream handshake. Both sides send a hello with a fresh
/// nonce, then sign the other side's nonce.
pub async fn handshake<S>(stream: &mut S, identity: &Identity, listen_port: u16) -> Result<RemoteHello>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut nonce = [0u8; 32];
    OsRng.fill_bytes(&mut nonce);
    let public_key = identity.public_key().to_vec();

    let hello = Hello {
        protocol: PROTOCOL_ID.to_string(),
        public_key: public_key.clone(),
        listen_port,
        nonce,
    };
    write_frame(stream, &bincode::serialize(&hello)?).await?;

    let remote: Hello = bincode::deserialize(&read_frame(stream).await?)?;
    if remote.protocol != PROTOCOL_ID {
        return Err(P2PError::Handshake(format!("unsupported protocol {}", remote.protocol)));
    }

    let proof = HelloProof {
        signature: identity.sign(&proof_message(&remote.nonce, &public_key, listen_port)),
    };
    write_frame(stream, &bincode::serialize(&proof)?).await?;

    let remote_proof: HelloProof = bincode::deserialize(&read_frame(stream).await?)?;
    let expected = proof_message(&nonce, &remote.public_key, remote.listen_port);
    if !verify_signature(&remote.public_key, &expected, &remote_proof.signature) {
        return Err(P2PError::Handshake("invalid handshake signature".to_string()));
    }

    Ok(RemoteHello {
        peer_id: PeerId::from_public_key(&remote.public_key),
        listen_port: remote.listen_port,
    })
}

/// Dials peers over TCP and authenticates every new stream.
pub struct TcpDialer {
    identity: Arc<Identity>,
    listen_port: u16,
}

impl TcpDialer {
    pub fn new(identity: Arc<Identity>, listen_port: u16) -> Self {
        Self { identity, listen_port }
    }
}

#[async_trait]
impl StreamOpener for TcpDialer {
    async fn open(&self, target: PeerAddr) -> Result<BoxedStream> {
        let mut stream = match timeout(CONNECTION_TIMEOUT, TcpStream::connect(target.addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(P2PError::Io(e)),
            Err(_) => {
                return Err(P2PError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connection timeout to {}", target.addr),
                )))
            }
        };
        stream.set_nodelay(true)?;

        let remote = timeout(
            CONNECTION_TIMEOUT,
            handshake(&mut stream, &self.identity, self.listen_port),
        )
        .await
        .map_err(|_| P2PError::Handshake(format!("timeout with {}", target.addr)))??;

        if remote.peer_id != target.peer_id {
            warn!(
                "Dialed peer proved another identity. addr={} expected={} actual={}",
                target.addr, target.peer_id, remote.peer_id
            );
            return Err(P2PError::PeerIdMismatch {
                expected: target.peer_id,
                actual: remote.peer_id,
            });
        }

        Ok(Box::new(stream))
    }
}

/// Returns false if something already accepts connections on `port`.
pub async fn is_port_available(port: u16) -> bool {
    !matches!(
        timeout(PORT_PROBE_TIMEOUT, TcpStream::connect((Ipv4Addr::LOCALHOST, port))).await,
        Ok(Ok(_))
    )
}

pub async fn check_port(port: u16) -> Result<()> {
    if is_port_available(port).await {
        Ok(())
    } else {
        Err(P2PError::PortUnavailable(port))
    }
}

/// First non-loopback IPv4 address in interface order.
pub fn first_external_ipv4(interfaces: &[(String, IpAddr)]) -> Option<Ipv4Addr> {
    interfaces.iter().find_map(|(_, ip)| match ip {
        IpAddr::V4(v4) if !v4.is_loopback() && !v4.is_unspecified() => Some(*v4),
        _ => None,
    })
}

/// Enumerates local interfaces and picks the first external IPv4 address.
pub fn external_ipv4() -> Result<Ipv4Addr> {
    let interfaces = local_ip_address::list_afinet_netifas().map_err(|e| {
        P2PError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
    })?;
    first_external_ipv4(&interfaces).ok_or(P2PError::NoExternalAddress)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_handshake_over_duplex() {
        let a = Identity::generate();
        let b = Identity::generate();
        let (mut left, mut right) = tokio::io::duplex(8192);

        let (ra, rb) = tokio::join!(handshake(&mut left, &a, 1111), handshake(&mut right, &b, 2222));
        let ra = ra.unwrap();
        let rb = rb.unwrap();

        assert_eq!(ra.peer_id, b.peer_id());
        assert_eq!(ra.listen_port, 2222);
        assert_eq!(rb.peer_id, a.peer_id());
        assert_eq!(rb.listen_port, 1111);
    }

    #[tokio::test]
    async fn test_handshake_rejects_foreign_protocol() {
        let a = Identity::generate();
        let (mut left, mut right) = tokio::io::duplex(8192);

        let bogus = Hello {
            protocol: "/other/9.9".to_string(),
            public_key: vec![0u8; 32],
            listen_port: 1,
            nonce: [0u8; 32],
        };
        write_frame(&mut right, &bincode::serialize(&bogus).unwrap()).await.unwrap();

        let result = handshake(&mut left, &a, 1111).await;
        assert!(matches!(result, Err(P2PError::Handshake(_))));
    }

    #[tokio::test]
    async fn test_dialer_checks_peer_id() {
        let server_identity = Identity::generate();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let _ = handshake(&mut stream, &server_identity, addr.port()).await;
            }
        });

        let dialer = TcpDialer::new(Arc::new(Identity::generate()), 0);
        let wrong = PeerAddr::new(PeerId::from_bytes([9u8; 32]), addr);
        let result = dialer.open(wrong).await;
        assert!(matches!(result, Err(P2PError::PeerIdMismatch { .. })));
    }

    #[tokio::test]
    async fn test_port_probe() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        assert!(!is_port_available(port).await);
        assert!(matches!(check_port(port).await, Err(P2PError::PortUnavailable(p)) if p == port));

        drop(listener);
        assert!(is_port_available(port).await);
    }

    #[test]
    fn test_first_external_ipv4() {
        let ifaces = vec![
            ("lo".to_string(), IpAddr::V4(Ipv4Addr::LOCALHOST)),
            ("eth0".to_string(), "fe80::1".parse().unwrap()),
            ("eth0".to_string(), IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20))),
            ("eth1".to_string(), IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))),
        ];
        assert_eq!(first_external_ipv4(&ifaces), Some(Ipv4Addr::new(192, 168, 1, 20)));
        assert_eq!(first_external_ipv4(&ifaces[..2]), None);
    }
}
