/*!
TamChain P2P - the peer-to-peer overlay of a TamChain node

Nodes exchange framed, compressed and checksummed messages over authenticated
TCP streams. Each neighbor gets a bounded pool of streams and two mailboxes,
urgent and normal. Known nodes live in an XOR-distance routing table that is
snapshotted to disk and restored on restart.

# Main Components

- `network::message`: the wire frame codec
- `network::peer`: one neighbor, its stream pool and mailboxes
- `network::peer_manager`: neighbors, routing table persistence and subscriptions
- `network::service`: the TCP listener and node bootstrap
- `config`: node configuration
- `cli`: command-line interface of the `tamchain-node` binary

# Example Usage

```no_run
use tamchain_p2p::{MessageType, NetService, P2PConfig};

# async fn run() -> Result<(), Box<dyn std::error::Error>> {
let service = NetService::new(P2PConfig::default()).await?;
service.start().await?;
let mut txs = service.peer_manager().subscribe(MessageType::PublishTx, 64).await;
while let Some(msg) = txs.recv().await {
    println!("tx from {}: {} bytes", msg.from, msg.data.len());
}
# Ok(())
# }
```
*/

/// Command-line interface of the node binary.
pub mod cli;

/// Node configuration loaded from JSON and command-line flags.
pub mod config;

/// The overlay network.
pub mod network;

// Re-export commonly used types
pub use config::P2PConfig;
pub use network::{
    Frame, IncomingMessage, MessagePriority, MessageType, NetService, P2PError, PeerAddr, PeerId,
    PeerManager, Subscription,
};
