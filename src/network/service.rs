use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::P2PConfig;
use crate::network::address::{PeerAddr, PeerId};
use crate::network::error::{P2PError, Result};
use crate::network::identity::Identity;
use crate::network::peer_manager::PeerManager;
use crate::network::transport::{
    check_port, external_ipv4, handshake, NoPortMapping, PortMapper, StreamOpener, TcpDialer,
};
use crate::network::CONNECTION_TIMEOUT;

/// The network service: a TCP listener in front of a [`PeerManager`].
pub struct NetService {
    identity: Arc<Identity>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    external_addr: Mutex<Option<SocketAddr>>,
    port_mapper: Arc<dyn PortMapper>,
    peer_manager: Arc<PeerManager>,
    quit_tx: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl NetService {
    pub async fn new(config: P2PConfig) -> Result<Self> {
        Self::with_port_mapper(config, Arc::new(NoPortMapping)).await
    }

    /// Builds the service with a custom port mapper. The mapper is only
    /// consulted when `nat_port_map` is set.
    pub async fn with_port_mapper(config: P2PConfig, port_mapper: Arc<dyn PortMapper>) -> Result<Self> {
        config.validate()?;
        tokio::fs::create_dir_all(&config.data_path).await?;

        let identity = Arc::new(Identity::load_or_create(&config.key_path()).map_err(|e| {
            error!("Failed to load or create key. path={} err={}", config.key_path().display(), e);
            e
        })?);

        let ip = match config.listen_ip {
            Some(ip) => ip,
            None => IpAddr::V4(external_ipv4().map_err(|e| {
                error!("Failed to get external IPv4 address. err={}", e);
                e
            })?),
        };

        if config.listen_port != 0 {
            check_port(config.listen_port).await.map_err(|e| {
                error!("Listen port is in use. port={}", config.listen_port);
                e
            })?;
        }

        let listener = TcpListener::bind(SocketAddr::new(ip, config.listen_port)).await?;
        let local_addr = listener.local_addr()?;

        let dialer: Arc<dyn StreamOpener> = Arc::new(TcpDialer::new(identity.clone(), local_addr.port()));
        let peer_manager = PeerManager::new(identity.peer_id(), Arc::new(config), dialer);
        let (quit_tx, _) = watch::channel(false);

        Ok(Self {
            identity,
            listener: Mutex::new(Some(listener)),
            local_addr,
            external_addr: Mutex::new(None),
            port_mapper,
            peer_manager,
            quit_tx,
            accept_task: Mutex::new(None),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn peer_id(&self) -> PeerId {
        self.identity.peer_id()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Dialable address of this node.
    pub fn local_peer_addr(&self) -> PeerAddr {
        PeerAddr::new(self.peer_id(), self.local_addr)
    }

    pub async fn external_addr(&self) -> Option<SocketAddr> {
        *self.external_addr.lock().await
    }

    pub fn peer_manager(&self) -> &Arc<PeerManager> {
        &self.peer_manager
    }

    pub async fn start(&self) -> Result<()> {
        let mut listener_slot = self.listener.lock().await;
        if listener_slot.is_none() {
            warn!("Net service is already started.");
            return Ok(());
        }
        if self.stopped.load(Ordering::SeqCst) {
            return Err(P2PError::PeerClosed);
        }

        // The listener stays in place until the manager is up, so a failed
        // start can be retried.
        self.peer_manager.start().await?;
        let Some(listener) = listener_slot.take() else {
            return Ok(());
        };
        drop(listener_slot);

        if self.peer_manager.config().nat_port_map {
            match self.port_mapper.map_port(self.local_addr).await {
                Ok(Some(external)) => {
                    info!("Mapped external port. external={}", external);
                    *self.external_addr.lock().await = Some(external);
                }
                Ok(None) => {}
                Err(e) => warn!("Port mapping failed. err={}", e),
            }
        }

        let manager = self.peer_manager.clone();
        let identity = self.identity.clone();
        let listen_port = self.local_addr.port();
        let quit = self.quit_tx.subscribe();
        let task = tokio::spawn(accept_loop(listener, manager, identity, listen_port, quit));
        *self.accept_task.lock().await = Some(task);

        info!("Listening on address. addr={}", self.local_peer_addr());
        Ok(())
    }

    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.quit_tx.send_replace(true);
        if let Some(task) = self.accept_task.lock().await.take() {
            if let Err(e) = task.await {
                error!("Accept loop failed. err={}", e);
            }
        }
        self.peer_manager.stop().await;
        info!("Net service stopped. id={}", self.peer_id());
    }
}

async fn accept_loop(
    listener: TcpListener,
    manager: Arc<PeerManager>,
    identity: Arc<Identity>,
    listen_port: u16,
    mut quit: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = quit.wait_for(|stopped| *stopped) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    let manager = manager.clone();
                    let identity = identity.clone();
                    tokio::spawn(async move {
                        if let Err(e) = accept_stream(stream, remote, &manager, &identity, listen_port).await {
                            warn!("Inbound stream rejected. remote={} err={}", remote, e);
                        }
                    });
                }
                Err(e) => error!("Accepting connection failed. err={}", e),
            },
        }
    }
    debug!("Accept loop exited.");
}

async fn accept_stream(
    mut stream: TcpStream,
    remote: SocketAddr,
    manager: &Arc<PeerManager>,
    identity: &Identity,
    listen_port: u16,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let hello = timeout(CONNECTION_TIMEOUT, handshake(&mut stream, identity, listen_port))
        .await
        .map_err(|_| P2PError::Handshake(format!("timeout with {}", remote)))??;

    let peer = PeerAddr::new(hello.peer_id, SocketAddr::new(remote.ip(), hello.listen_port));
    debug!("Accepted stream. peer={}", peer);
    manager.add_inbound_stream(peer, Box::new(stream)).await
}
