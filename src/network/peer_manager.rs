use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use futures::future::join_all;
use log::{debug, error, info, warn};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::config::P2PConfig;
use crate::network::address::{PeerAddr, PeerId};
use crate::network::error::{P2PError, Result};
use crate::network::message::{Frame, IncomingMessage, MessagePriority, MessageType};
use crate::network::peer::{Peer, PeerEvent};
use crate::network::routing::{ContactOutcome, RoutingTable};
use crate::network::transport::{BoxedStream, StreamOpener};

const EVENT_CHANNEL_SIZE: usize = 1024;
const ROUTING_RESPONSE_LIMIT: usize = 256;

/// A registration for one message type. Call
/// [`PeerManager::unsubscribe`] when done.
pub struct Subscription {
    id: u64,
    message_type: MessageType,
    receiver: mpsc::Receiver<IncomingMessage>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub async fn recv(&mut self) -> Option<IncomingMessage> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<IncomingMessage> {
        self.receiver.try_recv().ok()
    }
}

type SubscriberMap = HashMap<MessageType, HashMap<u64, mpsc::Sender<IncomingMessage>>>;

/// Owns the neighbor set, the routing table and its on-disk snapshot, and the
/// subscriber registry that decoded messages are dispatched to.
pub struct PeerManager {
    local_id: PeerId,
    config: Arc<P2PConfig>,
    opener: Arc<dyn StreamOpener>,

    neighbors: RwLock<HashMap<PeerId, Arc<Peer>>>,
    subscribers: RwLock<SubscriberMap>,
    next_subscription: AtomicU64,

    routing_table: RwLock<RoutingTable>,
    epoch: Instant,
    last_update: AtomicU64,

    events_tx: mpsc::Sender<PeerEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<PeerEvent>>>,
    quit_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl PeerManager {
    pub fn new(local_id: PeerId, config: Arc<P2PConfig>, opener: Arc<dyn StreamOpener>) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let (quit_tx, _) = watch::channel(false);
        let routing_table = RoutingTable::new(local_id, config.bucket_size);

        Arc::new(Self {
            local_id,
            config,
            opener,
            neighbors: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
            routing_table: RwLock::new(routing_table),
            epoch: Instant::now(),
            last_update: AtomicU64::new(0),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            quit_tx,
            tasks: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    pub fn config(&self) -> &P2PConfig {
        &self.config
    }

    /// Bootstraps from seeds and the snapshot, then starts the background tasks.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let seeds = self.config.seeds()?;
        if self.stopped.load(Ordering::SeqCst) {
            return Err(P2PError::PeerClosed);
        }
        let Some(events) = self.events_rx.lock().await.take() else {
            warn!("Peer manager is already started.");
            return Ok(());
        };

        for seed in seeds.iter() {
            self.store_peer(seed.peer_id, seed.addr).await;
        }

        match self.load_routing_table().await {
            Ok(count) => info!("Loaded routing table. entries={}", count),
            Err(e) => error!("Reading routing table file failed. err={}", e),
        }

        let mut tasks = self.tasks.lock().await;
        if self.stopped.load(Ordering::SeqCst) {
            return Err(P2PError::PeerClosed);
        }
        let manager = self.clone();
        let quit = self.quit_tx.subscribe();
        tasks.push(tokio::spawn(async move { manager.event_loop(events, quit).await }));

        let manager = self.clone();
        let quit = self.quit_tx.subscribe();
        tasks.push(tokio::spawn(async move { manager.maintenance_loop(quit).await }));

        info!("Peer manager started. id={} seeds={}", self.local_id, seeds.len());
        Ok(())
    }

    /// Stops the background tasks and waits for them, so no snapshot write
    /// happens after this returns.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.quit_tx.send_replace(true);

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for result in join_all(tasks).await {
            if let Err(e) = result {
                error!("Peer manager task failed. err={}", e);
            }
        }

        let peers: Vec<Arc<Peer>> = self.neighbors.write().await.drain().map(|(_, p)| p).collect();
        for peer in peers {
            peer.stop();
        }
        info!("Peer manager stopped. id={}", self.local_id);
    }

    /// Records a successful contact with `peer_id`.
    pub async fn store_peer(&self, peer_id: PeerId, addr: SocketAddr) {
        let outcome = self.routing_table.write().await.update(peer_id, addr);
        match outcome {
            ContactOutcome::Ignored => return,
            ContactOutcome::Evicted(old) => {
                debug!("Evicted routing entry. evicted={} inserted={}", old.short(), peer_id.short())
            }
            _ => {}
        }
        self.touch();
    }

    fn touch(&self) {
        let now = self.epoch.elapsed().as_nanos() as u64 + 1;
        self.last_update.fetch_max(now, Ordering::SeqCst);
    }

    /// Monotonic time of the last routing table change; 0 if never changed.
    pub fn last_update(&self) -> u64 {
        self.last_update.load(Ordering::SeqCst)
    }

    pub async fn routing_table_entries(&self) -> Vec<PeerAddr> {
        self.routing_table.read().await.entries()
    }

    pub async fn find_peer(&self, peer_id: &PeerId) -> Option<SocketAddr> {
        self.routing_table.read().await.find(peer_id)
    }

    pub async fn neighbor(&self, peer_id: &PeerId) -> Option<Arc<Peer>> {
        self.neighbors.read().await.get(peer_id).cloned()
    }

    pub async fn neighbor_ids(&self) -> Vec<PeerId> {
        self.neighbors.read().await.keys().copied().collect()
    }

    pub async fn neighbor_count(&self) -> usize {
        self.neighbors.read().await.len()
    }

    /// Attaches an authenticated inbound stream, creating the peer if needed.
    pub async fn add_inbound_stream(self: &Arc<Self>, remote: PeerAddr, stream: BoxedStream) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(P2PError::PeerClosed);
        }
        if remote.peer_id == self.local_id {
            return Err(P2PError::Handshake("connection to self".to_string()));
        }

        {
            let mut neighbors = self.neighbors.write().await;
            if let Some(peer) = neighbors.get(&remote.peer_id) {
                peer.add_stream(stream)?;
            } else {
                if neighbors.len() >= self.config.max_neighbors {
                    warn!("Max neighbors reached, rejecting peer. id={}", remote.peer_id);
                    return Err(P2PError::TooManyNeighbors {
                        max: self.config.max_neighbors,
                    });
                }
                let peer = self.new_peer(remote);
                peer.add_stream(stream)?;
                peer.start();
                neighbors.insert(remote.peer_id, peer);
            }
        }

        self.store_peer(remote.peer_id, remote.addr).await;
        Ok(())
    }

    /// Dials a peer from the routing table. No retry on failure.
    pub async fn connect(self: &Arc<Self>, peer_id: PeerId) -> Result<Arc<Peer>> {
        if let Some(peer) = self.neighbor(&peer_id).await {
            return Ok(peer);
        }
        let addr = self
            .find_peer(&peer_id)
            .await
            .ok_or(P2PError::PeerNotFound(peer_id))?;
        self.connect_addr(PeerAddr::new(peer_id, addr)).await
    }

    /// Dials `target` directly.
    pub async fn connect_addr(self: &Arc<Self>, target: PeerAddr) -> Result<Arc<Peer>> {
        if self.neighbor_count().await >= self.config.max_neighbors {
            return Err(P2PError::TooManyNeighbors {
                max: self.config.max_neighbors,
            });
        }
        let stream = self.opener.open(target).await?;

        let peer = {
            let mut neighbors = self.neighbors.write().await;
            match neighbors.get(&target.peer_id) {
                Some(existing) => {
                    // Raced with an inbound connection from the same node.
                    existing.add_stream(stream)?;
                    existing.clone()
                }
                None => {
                    let peer = self.new_peer(target);
                    peer.add_stream(stream)?;
                    peer.start();
                    neighbors.insert(target.peer_id, peer.clone());
                    peer
                }
            }
        };

        self.store_peer(target.peer_id, target.addr).await;
        info!("Connected to peer. id={} addr={}", target.peer_id, target.addr);
        Ok(peer)
    }

    fn new_peer(&self, remote: PeerAddr) -> Arc<Peer> {
        Peer::new(
            remote.peer_id,
            remote.addr,
            self.config.peer_settings(),
            self.opener.clone(),
            self.events_tx.clone(),
        )
    }

    async fn remove_neighbor(&self, peer_id: PeerId) {
        let mut neighbors = self.neighbors.write().await;
        let idle = neighbors.get(&peer_id).map(|p| p.stream_count() == 0).unwrap_or(false);
        if idle {
            if let Some(peer) = neighbors.remove(&peer_id) {
                peer.stop();
                info!("Peer disconnected. id={} addr={}", peer_id, peer.addr());
            }
        }
    }

    fn frame(&self, message_type: MessageType, payload: &[u8]) -> Result<Frame> {
        Frame::new(self.config.chain_id, message_type, self.config.version, payload)
    }

    /// Queues a message on a connected peer's mailbox.
    pub async fn send_to_peer(
        &self,
        peer_id: PeerId,
        message_type: MessageType,
        payload: &[u8],
        priority: MessagePriority,
    ) -> Result<()> {
        let peer = self
            .neighbor(&peer_id)
            .await
            .ok_or(P2PError::PeerNotFound(peer_id))?;
        peer.send_message(self.frame(message_type, payload)?, priority)
    }

    /// Sends to every neighbor that has not seen the message yet. Returns how
    /// many peers it was queued for.
    pub async fn broadcast(
        &self,
        message_type: MessageType,
        payload: &[u8],
        priority: MessagePriority,
    ) -> Result<usize> {
        let frame = self.frame(message_type, payload)?;
        let digest = frame.digest();
        let peers: Vec<Arc<Peer>> = self.neighbors.read().await.values().cloned().collect();

        let mut sent = 0;
        for peer in peers {
            if peer.has_seen(&digest) {
                continue;
            }
            match peer.send_message(frame.clone(), priority) {
                Ok(()) => {
                    peer.mark_seen(&digest);
                    sent += 1;
                }
                Err(e) if e.is_resource_exhausted() => {
                    debug!("Peer is backed up, skipping broadcast. id={} err={}", peer.id(), e)
                }
                Err(e) => warn!("Broadcast to peer failed. id={} err={}", peer.id(), e),
            }
        }
        Ok(sent)
    }

    /// Registers interest in `message_type`. Messages beyond `capacity`
    /// unread ones are dropped for this subscriber.
    pub async fn subscribe(&self, message_type: MessageType, capacity: usize) -> Subscription {
        let id = self.next_subscription.fetch_add(1, Ordering::SeqCst);
        let (tx, receiver) = mpsc::channel(capacity.max(1));
        self.subscribers
            .write()
            .await
            .entry(message_type)
            .or_default()
            .insert(id, tx);
        Subscription {
            id,
            message_type,
            receiver,
        }
    }

    pub async fn unsubscribe(&self, subscription: Subscription) {
        let mut subscribers = self.subscribers.write().await;
        if let Some(subs) = subscribers.get_mut(&subscription.message_type) {
            subs.remove(&subscription.id);
            if subs.is_empty() {
                subscribers.remove(&subscription.message_type);
            }
        }
    }

    /// Fans a message out to every subscriber of its type. Messages nobody
    /// subscribed to are dropped.
    pub async fn handle_message(&self, message: IncomingMessage) {
        let mut gone = Vec::new();
        {
            let subscribers = self.subscribers.read().await;
            let Some(subs) = subscribers.get(&message.message_type) else {
                debug!("No subscriber for message. type={} from={}", message.message_type, message.from.short());
                return;
            };
            for (id, tx) in subs.iter() {
                match tx.try_send(message.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!("Subscriber is lagging, dropping message. type={} subscription={}", message.message_type, id)
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => gone.push(*id),
                }
            }
        }

        if !gone.is_empty() {
            let mut subscribers = self.subscribers.write().await;
            if let Some(subs) = subscribers.get_mut(&message.message_type) {
                for id in gone {
                    subs.remove(&id);
                }
            }
        }
    }

    async fn event_loop(self: Arc<Self>, mut events: mpsc::Receiver<PeerEvent>, mut quit: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                biased;
                _ = async { let _ = quit.wait_for(|stopped| *stopped).await; } => break,
                event = events.recv() => match event {
                    Some(PeerEvent::Frame { from, frame }) => self.handle_frame(from, frame).await,
                    Some(PeerEvent::Closed { peer_id }) => self.remove_neighbor(peer_id).await,
                    None => break,
                },
            }
        }
        debug!("Peer manager event loop exited.");
    }

    async fn handle_frame(&self, from: PeerId, frame: Frame) {
        let Some(peer) = self.neighbor(&from).await else {
            debug!("Frame from unknown peer dropped. from={}", from.short());
            return;
        };

        let message_type = frame.message_type();
        let already_seen = peer.mark_seen(&frame.digest());
        self.store_peer(from, peer.addr()).await;

        if already_seen && message_type.is_gossip() {
            debug!("Duplicate message dropped. type={} from={}", message_type, from.short());
            return;
        }

        let data = match frame.payload() {
            Ok(data) => data,
            Err(e) => {
                warn!("Dropping corrupt payload. type={} from={} err={}", message_type, from.short(), e);
                return;
            }
        };

        if let Err(e) = self.handle_builtin(from, message_type, &data).await {
            warn!("Handling message failed. type={} from={} err={}", message_type, from.short(), e);
        }

        self.handle_message(IncomingMessage {
            from,
            message_type,
            data,
        })
        .await;
    }

    async fn handle_builtin(&self, from: PeerId, message_type: MessageType, data: &[u8]) -> Result<()> {
        match message_type {
            MessageType::Ping => {
                self.send_to_peer(from, MessageType::Pong, data, MessagePriority::Urgent)
                    .await
            }
            MessageType::RoutingTableQuery => {
                let lines: Vec<String> = self
                    .routing_table
                    .read()
                    .await
                    .nearest(&from, self.config.bucket_size + 1)
                    .into_iter()
                    .filter(|p| p.peer_id != from)
                    .take(self.config.bucket_size)
                    .map(|p| p.to_string())
                    .collect();
                let payload = bincode::serialize(&lines)?;
                self.send_to_peer(from, MessageType::RoutingTableResponse, &payload, MessagePriority::Normal)
                    .await
            }
            MessageType::RoutingTableResponse => {
                let lines: Vec<String> = bincode::deserialize(data)?;
                for line in lines.iter().take(ROUTING_RESPONSE_LIMIT) {
                    match line.parse::<PeerAddr>() {
                        Ok(entry) => self.store_peer(entry.peer_id, entry.addr).await,
                        Err(e) => debug!("Skipping routing entry. entry={} err={}", line, e),
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn maintenance_loop(self: Arc<Self>, mut quit: watch::Receiver<bool>) {
        let mut snapshot_tick = interval(self.config.snapshot_interval());
        snapshot_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sync_tick = interval(self.config.routing_sync_interval());
        sync_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of an interval completes immediately.
        snapshot_tick.tick().await;
        sync_tick.tick().await;

        let mut last_snapshot = 0u64;
        loop {
            tokio::select! {
                biased;
                _ = async { let _ = quit.wait_for(|stopped| *stopped).await; } => break,
                _ = snapshot_tick.tick() => self.snapshot_if_dirty(&mut last_snapshot).await,
                _ = sync_tick.tick() => self.query_neighbors().await,
            }
        }

        self.snapshot_if_dirty(&mut last_snapshot).await;
        debug!("Peer manager maintenance loop exited.");
    }

    async fn snapshot_if_dirty(&self, last_snapshot: &mut u64) {
        if self.last_update() <= *last_snapshot {
            return;
        }
        let mark = self.epoch.elapsed().as_nanos() as u64 + 1;
        match self.dump_routing_table().await {
            Ok(count) => {
                *last_snapshot = mark;
                debug!("Saved routing table. entries={}", count);
            }
            Err(e) => error!("Writing routing table file failed. err={}", e),
        }
    }

    async fn query_neighbors(&self) {
        for peer_id in self.neighbor_ids().await {
            if let Err(e) = self
                .send_to_peer(peer_id, MessageType::RoutingTableQuery, &[], MessagePriority::Normal)
                .await
            {
                debug!("Routing table query failed. id={} err={}", peer_id.short(), e);
            }
        }
    }

    /// Overwrites the snapshot file with the full routing table.
    pub async fn dump_routing_table(&self) -> Result<usize> {
        let entries = self.routing_table_entries().await;
        let written_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let mut contents = format!("# {}\n", written_at);
        for entry in entries.iter() {
            contents.push_str(&entry.to_string());
            contents.push('\n');
        }

        let path = self.config.routing_table_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        write_atomic(&path, contents.as_bytes()).await?;
        Ok(entries.len())
    }

    /// Merges the snapshot file into the routing table. A missing file is
    /// not an error.
    pub async fn load_routing_table(&self) -> Result<usize> {
        let path = self.config.routing_table_path();
        let contents = match fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut count = 0;
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match line.parse::<PeerAddr>() {
                Ok(entry) if entry.peer_id == self.local_id => {}
                Ok(entry) => {
                    self.store_peer(entry.peer_id, entry.addr).await;
                    count += 1;
                }
                Err(e) => warn!("Parsing routing table entry failed. line={} err={}", line, e),
            }
        }
        Ok(count)
    }
}

async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let temp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&temp_path).await?;
    file.write_all(contents).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&temp_path, path).await?;
    Ok(())
}
