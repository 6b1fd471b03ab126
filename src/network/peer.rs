use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use bloomfilter::Bloom;
use log::{debug, error, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::time::timeout;

use crate::network::address::{PeerAddr, PeerId};
use crate::network::error::{P2PError, Result};
use crate::network::message::{Frame, FrameHeader, MessagePriority, HEADER_SIZE};
use crate::network::transport::{BoxedStream, StreamOpener};
use crate::network::{BLOOM_ERROR_RATE, BLOOM_MAX_ITEMS, MAX_MESSAGE_SIZE};

/// Per-peer limits and the local chain parameters frames are checked against.
#[derive(Debug, Clone)]
pub struct PeerSettings {
    pub chain_id: u32,
    pub version: u16,
    pub max_streams: usize,
    pub mailbox_capacity: usize,
    /// Assumed minimum link throughput in bytes per second.
    pub min_write_throughput: u64,
}

/// Notifications a peer sends to its owner.
#[derive(Debug)]
pub enum PeerEvent {
    Frame { from: PeerId, frame: Frame },
    /// The last stream of the peer closed.
    Closed { peer_id: PeerId },
}

/// Deadline for writing `len` bytes at `min_throughput` bytes/s, plus one
/// second of slack.
pub fn write_deadline(len: usize, min_throughput: u64) -> Duration {
    let secs = len as f64 / min_throughput.max(1) as f64;
    Duration::from_secs_f64(secs) + Duration::from_secs(1)
}

struct PooledStream {
    id: u64,
    writer: WriteHalf<BoxedStream>,
}

#[derive(Default)]
struct StreamBook {
    open: HashMap<u64, Arc<Notify>>,
    reserved: usize,
}

impl StreamBook {
    fn total(&self) -> usize {
        self.open.len() + self.reserved
    }
}

/// A directly connected neighbor.
///
/// A peer owns up to `max_streams` streams. Each stream has its own read loop;
/// idle write halves wait in a pool. One write loop drains the urgent and
/// normal mailboxes, urgent first.
pub struct Peer {
    id: PeerId,
    addr: SocketAddr,
    settings: PeerSettings,
    opener: Arc<dyn StreamOpener>,
    events: mpsc::Sender<PeerEvent>,

    pool_tx: mpsc::Sender<PooledStream>,
    pool_rx: Mutex<mpsc::Receiver<PooledStream>>,
    streams: StdMutex<StreamBook>,
    next_stream_id: AtomicU64,
    stream_closed: Notify,

    recent: StdMutex<Bloom<[u8; 32]>>,

    urgent_tx: mpsc::Sender<Frame>,
    normal_tx: mpsc::Sender<Frame>,
    mailboxes: StdMutex<Option<(mpsc::Receiver<Frame>, mpsc::Receiver<Frame>)>>,

    quit_tx: watch::Sender<bool>,
    stopped: AtomicBool,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Peer {
    pub fn new(
        id: PeerId,
        addr: SocketAddr,
        settings: PeerSettings,
        opener: Arc<dyn StreamOpener>,
        events: mpsc::Sender<PeerEvent>,
    ) -> Arc<Self> {
        let (pool_tx, pool_rx) = mpsc::channel(settings.max_streams.max(1));
        let (urgent_tx, urgent_rx) = mpsc::channel(settings.mailbox_capacity.max(1));
        let (normal_tx, normal_rx) = mpsc::channel(settings.mailbox_capacity.max(1));
        let (quit_tx, _) = watch::channel(false);

        Arc::new(Self {
            id,
            addr,
            settings,
            opener,
            events,
            pool_tx,
            pool_rx: Mutex::new(pool_rx),
            streams: StdMutex::new(StreamBook::default()),
            next_stream_id: AtomicU64::new(0),
            stream_closed: Notify::new(),
            recent: StdMutex::new(Bloom::new_for_fp_rate(BLOOM_MAX_ITEMS, BLOOM_ERROR_RATE)),
            urgent_tx,
            normal_tx,
            mailboxes: StdMutex::new(Some((urgent_rx, normal_rx))),
            quit_tx,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Number of open streams.
    pub fn stream_count(&self) -> usize {
        lock(&self.streams).open.len()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Starts the write loop.
    pub fn start(self: &Arc<Self>) {
        let Some((urgent, normal)) = lock(&self.mailboxes).take() else {
            warn!("Peer is already started. id={}", self.id);
            return;
        };
        info!("Peer is started. id={} addr={}", self.id, self.addr);

        let peer = self.clone();
        let quit = self.quit_tx.subscribe();
        tokio::spawn(async move { peer.write_loop(urgent, normal, quit).await });
    }

    /// Stops the write loop and closes every stream.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.quit_tx.send_replace(true);

        let notifies: Vec<Arc<Notify>> = lock(&self.streams).open.drain().map(|(_, n)| n).collect();
        for notify in notifies {
            notify.notify_one();
        }
        self.stream_closed.notify_one();
        info!("Peer is stopped. id={} addr={}", self.id, self.addr);
    }

    /// Adds an accepted stream to the pool.
    pub fn add_stream(self: &Arc<Self>, stream: BoxedStream) -> Result<()> {
        if self.is_stopped() {
            return Err(P2PError::PeerClosed);
        }
        self.reserve_stream()?;
        let pooled = self.register_stream(stream);
        self.release_stream(pooled);
        Ok(())
    }

    /// Queues `frame` for sending. Never blocks: a full mailbox is an error.
    pub fn send_message(&self, frame: Frame, priority: MessagePriority) -> Result<()> {
        if self.is_stopped() {
            return Err(P2PError::PeerClosed);
        }
        let mailbox = match priority {
            MessagePriority::Urgent => &self.urgent_tx,
            MessagePriority::Normal => &self.normal_tx,
        };
        match mailbox.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                error!("Sending message failed. Mailbox is full. id={} priority={:?}", self.id, priority);
                Err(P2PError::MailboxFull { priority })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(P2PError::PeerClosed),
        }
    }

    /// Whether `digest` was probably sent to or received from this peer.
    pub fn has_seen(&self, digest: &[u8; 32]) -> bool {
        lock(&self.recent).check(digest)
    }

    /// Records `digest`; returns whether it was already present.
    pub fn mark_seen(&self, digest: &[u8; 32]) -> bool {
        lock(&self.recent).check_and_set(digest)
    }

    async fn write_loop(
        self: Arc<Self>,
        mut urgent: mpsc::Receiver<Frame>,
        mut normal: mpsc::Receiver<Frame>,
        mut quit: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = quit.wait_for(|stopped| *stopped) => return,
                Some(frame) = urgent.recv() => self.spawn_write(frame),
                Some(frame) = normal.recv() => {
                    // Urgent traffic queued meanwhile goes out first.
                    while let Ok(u) = urgent.try_recv() {
                        self.spawn_write(u);
                    }
                    self.spawn_write(frame);
                }
                else => return,
            }
        }
    }

    fn spawn_write(self: &Arc<Self>, frame: Frame) {
        let peer = self.clone();
        tokio::spawn(async move {
            if let Err(e) = peer.write(&frame).await {
                warn!("Write message failed. id={} type={} err={}", peer.id, frame.message_type(), e);
            }
        });
    }

    /// Writes one frame on a pooled stream under the size-based deadline.
    pub(crate) async fn write(self: &Arc<Self>, frame: &Frame) -> Result<()> {
        let mut stream = self.acquire_stream().await?;
        let deadline = write_deadline(frame.len(), self.settings.min_write_throughput);
        let bytes = frame.to_bytes();

        let result = timeout(deadline, async {
            stream.writer.write_all(&bytes).await?;
            stream.writer.flush().await
        })
        .await;

        match result {
            Ok(Ok(())) => {
                self.release_stream(stream);
                Ok(())
            }
            Ok(Err(e)) => {
                self.discard_stream(stream).await;
                Err(P2PError::Io(e))
            }
            Err(_) => {
                self.discard_stream(stream).await;
                Err(P2PError::WriteTimeout(deadline))
            }
        }
    }

    /// Takes a pooled stream, opens a new one below the cap, or waits for
    /// one to come back. The pool lock is never held while dialing.
    async fn acquire_stream(self: &Arc<Self>) -> Result<PooledStream> {
        let mut quit = self.quit_tx.subscribe();

        loop {
            if self.is_stopped() {
                return Err(P2PError::PeerClosed);
            }
            if let Some(stream) = self.try_pooled_stream().await {
                return Ok(stream);
            }
            match self.open_stream().await {
                Ok(stream) => return Ok(stream),
                Err(P2PError::StreamCountExceeded { .. }) => {}
                Err(e) => return Err(e),
            }

            let mut pool = self.pool_rx.lock().await;
            tokio::select! {
                stream = pool.recv() => match stream {
                    Some(stream) if self.is_open(stream.id) => return Ok(stream),
                    Some(_) => continue,
                    None => return Err(P2PError::PeerClosed),
                },
                // A slot freed up; try opening again.
                _ = self.stream_closed.notified() => continue,
                _ = quit.wait_for(|stopped| *stopped) => return Err(P2PError::PeerClosed),
            }
        }
    }

    async fn try_pooled_stream(&self) -> Option<PooledStream> {
        let mut pool = self.pool_rx.lock().await;
        while let Ok(stream) = pool.try_recv() {
            if self.is_open(stream.id) {
                return Some(stream);
            }
        }
        None
    }

    async fn open_stream(self: &Arc<Self>) -> Result<PooledStream> {
        self.reserve_stream()?;
        match self.opener.open(PeerAddr::new(self.id, self.addr)).await {
            Ok(stream) => {
                let pooled = self.register_stream(stream);
                debug!("Opened stream. id={} stream={}", self.id, pooled.id);
                Ok(pooled)
            }
            Err(e) => {
                lock(&self.streams).reserved -= 1;
                error!("Creating stream failed. id={} err={}", self.id, e);
                Err(e)
            }
        }
    }

    fn reserve_stream(&self) -> Result<()> {
        let mut book = lock(&self.streams);
        if book.total() >= self.settings.max_streams {
            return Err(P2PError::StreamCountExceeded {
                max: self.settings.max_streams,
            });
        }
        book.reserved += 1;
        Ok(())
    }

    /// Turns a reserved slot into an open stream and starts its read loop.
    fn register_stream(self: &Arc<Self>, stream: BoxedStream) -> PooledStream {
        let id = self.next_stream_id.fetch_add(1, Ordering::SeqCst);
        let (reader, writer) = tokio::io::split(stream);
        let closed = Arc::new(Notify::new());
        {
            let mut book = lock(&self.streams);
            book.reserved -= 1;
            book.open.insert(id, closed.clone());
        }

        let peer = self.clone();
        tokio::spawn(async move { peer.read_loop(id, reader, closed).await });

        PooledStream { id, writer }
    }

    fn release_stream(&self, stream: PooledStream) {
        if !self.is_open(stream.id) {
            return;
        }
        if self.pool_tx.try_send(stream).is_err() {
            warn!("Stream pool is full. id={}", self.id);
        }
    }

    async fn discard_stream(&self, mut stream: PooledStream) {
        let _ = stream.writer.shutdown().await;
        self.close_stream(stream.id).await;
    }

    fn is_open(&self, stream_id: u64) -> bool {
        lock(&self.streams).open.contains_key(&stream_id)
    }

    async fn close_stream(&self, stream_id: u64) {
        let (closed, remaining) = {
            let mut book = lock(&self.streams);
            let closed = book.open.remove(&stream_id);
            (closed, book.total())
        };
        let Some(closed) = closed else {
            return;
        };

        closed.notify_one();
        self.stream_closed.notify_one();
        debug!("Closed stream. id={} stream={} remaining={}", self.id, stream_id, remaining);

        if remaining == 0 && !self.is_stopped() {
            if self.events.send(PeerEvent::Closed { peer_id: self.id }).await.is_err() {
                debug!("Peer owner is gone, dropping close report. id={}", self.id);
            }
        }
    }

    async fn read_loop(self: Arc<Self>, stream_id: u64, mut reader: ReadHalf<BoxedStream>, closed: Arc<Notify>) {
        loop {
            let frame = tokio::select! {
                result = self.read_frame(&mut reader) => match result {
                    Ok(frame) => frame,
                    Err(e) if e.is_protocol_error() => {
                        warn!("Protocol violation, closing stream. id={} stream={} err={}", self.id, stream_id, e);
                        break;
                    }
                    Err(e) => {
                        debug!("Read message failed. id={} stream={} err={}", self.id, stream_id, e);
                        break;
                    }
                },
                _ = closed.notified() => break,
            };

            let event = PeerEvent::Frame { from: self.id, frame };
            if self.events.send(event).await.is_err() {
                break;
            }
        }
        self.close_stream(stream_id).await;
    }

    /// Reads one frame, rejecting foreign chain ids and versions before the
    /// payload is read.
    async fn read_frame(&self, reader: &mut ReadHalf<BoxedStream>) -> Result<Frame> {
        let mut header = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header).await?;
        let parsed = FrameHeader::parse(&header);

        if parsed.chain_id != self.settings.chain_id {
            return Err(P2PError::ChainIdMismatch {
                expected: self.settings.chain_id,
                actual: parsed.chain_id,
            });
        }
        if parsed.version != self.settings.version {
            return Err(P2PError::VersionMismatch {
                expected: self.settings.version,
                actual: parsed.version,
            });
        }
        let length = parsed.data_length as usize;
        if length > MAX_MESSAGE_SIZE {
            return Err(P2PError::FrameTooLarge {
                size: length,
                max: MAX_MESSAGE_SIZE,
            });
        }

        let mut data = vec![0u8; HEADER_SIZE + length];
        data[..HEADER_SIZE].copy_from_slice(&header);
        reader.read_exact(&mut data[HEADER_SIZE..]).await?;
        Frame::decode(&data)
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("streams", &self.stream_count())
            .field("stopped", &self.is_stopped())
            .field("recent", &"<bloom>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::message::MessageType;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::DuplexStream;
    use tokio_test::{assert_err, assert_ok};

    const CHAIN_ID: u32 = 7;
    const VERSION: u16 = 1;

    struct DuplexOpener {
        buffer: usize,
        fail: bool,
        opened: AtomicUsize,
        remotes: Mutex<Vec<DuplexStream>>,
    }

    impl DuplexOpener {
        fn new(buffer: usize) -> Arc<Self> {
            Arc::new(Self {
                buffer,
                fail: false,
                opened: AtomicUsize::new(0),
                remotes: Mutex::new(Vec::new()),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                buffer: 1024,
                fail: true,
                opened: AtomicUsize::new(0),
                remotes: Mutex::new(Vec::new()),
            })
        }

        fn opened(&self) -> usize {
            self.opened.load(Ordering::SeqCst)
        }

        async fn take_remotes(&self) -> Vec<DuplexStream> {
            std::mem::take(&mut *self.remotes.lock().await)
        }
    }

    #[async_trait]
    impl StreamOpener for DuplexOpener {
        async fn open(&self, _target: PeerAddr) -> Result<BoxedStream> {
            if self.fail {
                return Err(P2PError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "refused",
                )));
            }
            let (local, remote) = tokio::io::duplex(self.buffer);
            self.opened.fetch_add(1, Ordering::SeqCst);
            self.remotes.lock().await.push(remote);
            Ok(Box::new(local))
        }
    }

    /// Opens the first `fast` streams at once and stalls every later dial.
    struct SlowOpener {
        inner: Arc<DuplexOpener>,
        fast: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl StreamOpener for SlowOpener {
        async fn open(&self, target: PeerAddr) -> Result<BoxedStream> {
            let fast = self
                .fast
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if !fast {
                tokio::time::sleep(self.delay).await;
            }
            self.inner.open(target).await
        }
    }

    fn settings(max_streams: usize, mailbox_capacity: usize) -> PeerSettings {
        PeerSettings {
            chain_id: CHAIN_ID,
            version: VERSION,
            max_streams,
            mailbox_capacity,
            min_write_throughput: 5 * 1024,
        }
    }

    fn new_peer(
        settings: PeerSettings,
        opener: Arc<dyn StreamOpener>,
    ) -> (Arc<Peer>, mpsc::Receiver<PeerEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let peer = Peer::new(
            PeerId::from_bytes([1u8; 32]),
            "127.0.0.1:30333".parse().unwrap(),
            settings,
            opener,
            tx,
        );
        (peer, rx)
    }

    fn frame(payload: &[u8]) -> Frame {
        Frame::new(CHAIN_ID, MessageType::PublishTx, VERSION, payload).unwrap()
    }

    async fn read_one(remote: &mut DuplexStream) -> Frame {
        let mut header = [0u8; HEADER_SIZE];
        remote.read_exact(&mut header).await.unwrap();
        let len = FrameHeader::parse(&header).data_length as usize;
        let mut data = header.to_vec();
        data.resize(HEADER_SIZE + len, 0);
        remote.read_exact(&mut data[HEADER_SIZE..]).await.unwrap();
        Frame::decode(&data).unwrap()
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_write_deadline() {
        assert_eq!(write_deadline(0, 5 * 1024), Duration::from_secs(1));
        assert_eq!(write_deadline(10 * 1024, 5 * 1024), Duration::from_secs(3));
        assert_eq!(write_deadline(100, 0), Duration::from_secs(101));
    }

    #[tokio::test]
    async fn test_full_mailbox_fails_fast() {
        let (peer, _events) = new_peer(settings(1, 2), DuplexOpener::new(1024));

        assert_ok!(peer.send_message(frame(b"1"), MessagePriority::Normal));
        assert_ok!(peer.send_message(frame(b"2"), MessagePriority::Normal));

        let result = timeout(Duration::from_millis(100), async {
            peer.send_message(frame(b"3"), MessagePriority::Normal)
        })
        .await
        .expect("send_message must not block");
        assert!(matches!(
            result,
            Err(P2PError::MailboxFull { priority: MessagePriority::Normal })
        ));

        // The urgent mailbox is separate.
        assert_ok!(peer.send_message(frame(b"u"), MessagePriority::Urgent));
    }

    #[tokio::test]
    async fn test_urgent_messages_preempt_normal() {
        let opener = DuplexOpener::new(64 * 1024);
        let (peer, _events) = new_peer(settings(1, 16), opener.clone());

        assert_ok!(peer.send_message(frame(b"normal"), MessagePriority::Normal));
        for p in [b"urgent-1", b"urgent-2", b"urgent-3"] {
            assert_ok!(peer.send_message(frame(p), MessagePriority::Urgent));
        }
        peer.start();

        wait_for(|| opener.opened() == 1).await;
        let mut remote = opener.take_remotes().await.remove(0);

        let mut order = Vec::new();
        for _ in 0..4 {
            order.push(read_one(&mut remote).await.payload().unwrap());
        }
        assert_eq!(
            order,
            vec![
                b"urgent-1".to_vec(),
                b"urgent-2".to_vec(),
                b"urgent-3".to_vec(),
                b"normal".to_vec()
            ]
        );
        assert_eq!(opener.opened(), 1);
    }

    #[tokio::test]
    async fn test_stream_cap_is_never_exceeded() {
        // A tiny buffer keeps writers busy so concurrent sends contend.
        let opener = DuplexOpener::new(32);
        let (peer, _events) = new_peer(settings(2, 16), opener.clone());
        peer.start();

        for _ in 0..3 {
            let payload: Vec<u8> = (0..512).map(|_| rand::random::<u8>()).collect();
            assert_ok!(peer.send_message(frame(&payload), MessagePriority::Urgent));
        }

        let received = Arc::new(AtomicUsize::new(0));
        for _ in 0..200 {
            for mut remote in opener.take_remotes().await {
                let received = received.clone();
                tokio::spawn(async move {
                    loop {
                        let mut header = [0u8; HEADER_SIZE];
                        if remote.read_exact(&mut header).await.is_err() {
                            return;
                        }
                        let len = FrameHeader::parse(&header).data_length as usize;
                        let mut body = vec![0u8; len];
                        if remote.read_exact(&mut body).await.is_err() {
                            return;
                        }
                        received.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
            assert!(opener.opened() <= 2);
            assert!(peer.stream_count() <= 2);
            if received.load(Ordering::SeqCst) == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(received.load(Ordering::SeqCst), 3);
        assert!(opener.opened() <= 2);
    }

    #[tokio::test]
    async fn test_add_stream_over_cap_is_rejected() {
        let (peer, _events) = new_peer(settings(1, 4), DuplexOpener::new(1024));
        let (a, _ra) = tokio::io::duplex(1024);
        let (b, _rb) = tokio::io::duplex(1024);

        assert_ok!(peer.add_stream(Box::new(a)));
        let err = assert_err!(peer.add_stream(Box::new(b)));
        assert!(matches!(err, P2PError::StreamCountExceeded { max: 1 }));
        assert_eq!(peer.stream_count(), 1);
    }

    #[tokio::test]
    async fn test_open_failure_is_reported() {
        let opener = DuplexOpener::failing();
        let (peer, _events) = new_peer(settings(2, 4), opener);

        let result = peer.write(&frame(b"x")).await;
        assert!(matches!(result, Err(P2PError::Io(_))));
        assert_eq!(peer.stream_count(), 0);
    }

    #[tokio::test]
    async fn test_read_loop_delivers_frames() {
        let (peer, mut events) = new_peer(settings(2, 4), DuplexOpener::new(1024));
        let (local, mut remote) = tokio::io::duplex(4096);
        assert_ok!(peer.add_stream(Box::new(local)));

        remote.write_all(&frame(b"hi").to_bytes()).await.unwrap();

        match events.recv().await {
            Some(PeerEvent::Frame { from, frame }) => {
                assert_eq!(from, peer.id());
                assert_eq!(frame.payload().unwrap(), b"hi".to_vec());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_chain_id_mismatch_terminates_stream() {
        let (peer, mut events) = new_peer(settings(2, 4), DuplexOpener::new(1024));
        let (local, mut remote) = tokio::io::duplex(4096);
        assert_ok!(peer.add_stream(Box::new(local)));

        let foreign = Frame::new(CHAIN_ID + 1, MessageType::Ping, VERSION, b"hi").unwrap();
        remote.write_all(&foreign.to_bytes()).await.unwrap();

        match events.recv().await {
            Some(PeerEvent::Closed { peer_id }) => assert_eq!(peer_id, peer.id()),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(peer.stream_count(), 0);
    }

    #[tokio::test]
    async fn test_version_mismatch_terminates_only_that_stream() {
        let (peer, mut events) = new_peer(settings(2, 4), DuplexOpener::new(1024));
        let (first, mut first_remote) = tokio::io::duplex(4096);
        let (second, mut second_remote) = tokio::io::duplex(4096);
        assert_ok!(peer.add_stream(Box::new(first)));
        assert_ok!(peer.add_stream(Box::new(second)));

        let old = Frame::new(CHAIN_ID, MessageType::Ping, VERSION + 1, b"hi").unwrap();
        first_remote.write_all(&old.to_bytes()).await.unwrap();
        wait_for(|| peer.stream_count() == 1).await;

        second_remote.write_all(&frame(b"still here").to_bytes()).await.unwrap();
        match events.recv().await {
            Some(PeerEvent::Frame { frame, .. }) => {
                assert_eq!(frame.payload().unwrap(), b"still here".to_vec())
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_write_timeout_closes_stream_but_not_peer() {
        // Nobody reads the remote end, so the write stalls past its deadline.
        let opener = DuplexOpener::new(64);
        let (peer, mut events) = new_peer(settings(2, 4), opener.clone());

        let payload: Vec<u8> = (0..2048).map(|_| rand::random::<u8>()).collect();
        let result = peer.write(&frame(&payload)).await;
        assert!(matches!(result, Err(P2PError::WriteTimeout(_))));
        assert_eq!(peer.stream_count(), 0);
        assert!(matches!(events.recv().await, Some(PeerEvent::Closed { .. })));
        assert!(!peer.is_stopped());

        // The next write opens a fresh stream.
        let _remotes = opener.take_remotes().await;
        let pending = tokio::spawn({
            let peer = peer.clone();
            async move { peer.write(&frame(b"small")).await }
        });
        wait_for(|| opener.opened() == 2).await;
        let mut remote = opener.take_remotes().await.remove(0);
        assert_eq!(read_one(&mut remote).await.payload().unwrap(), b"small".to_vec());
        assert_ok!(pending.await.unwrap());
    }

    #[tokio::test]
    async fn test_stop_rejects_further_sends() {
        let (peer, _events) = new_peer(settings(1, 4), DuplexOpener::new(1024));
        peer.start();
        peer.stop();
        assert!(matches!(
            peer.send_message(frame(b"late"), MessagePriority::Urgent),
            Err(P2PError::PeerClosed)
        ));
    }

    #[tokio::test]
    async fn test_recently_seen_filter() {
        let (peer, _events) = new_peer(settings(1, 4), DuplexOpener::new(1024));
        let digest = frame(b"tx").digest();

        assert!(!peer.has_seen(&digest));
        assert!(!peer.mark_seen(&digest));
        assert!(peer.has_seen(&digest));
        assert!(peer.mark_seen(&digest));
    }

    #[tokio::test]
    async fn test_pooled_stream_is_not_blocked_by_a_slow_dial() {
        let inner = DuplexOpener::new(1024);
        let opener = Arc::new(SlowOpener {
            inner: inner.clone(),
            fast: AtomicUsize::new(1),
            delay: Duration::from_secs(3),
        });
        let (peer, _events) = new_peer(settings(2, 4), opener);

        let first = assert_ok!(peer.acquire_stream().await);
        let first_id = first.id;

        // A second writer finds the pool empty and starts a slow dial.
        let dialing = tokio::spawn({
            let peer = peer.clone();
            async move { peer.acquire_stream().await.map(|s| s.id) }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        peer.release_stream(first);
        let started = std::time::Instant::now();
        let reused = timeout(Duration::from_millis(500), peer.acquire_stream())
            .await
            .expect("a pooled stream must be handed out while another dial is pending");
        assert_eq!(assert_ok!(reused).id, first_id);
        assert!(started.elapsed() < Duration::from_millis(500));

        let second_id = assert_ok!(dialing.await.unwrap());
        assert_ne!(second_id, first_id);
        assert_eq!(inner.opened(), 2);
    }

    #[tokio::test]
    async fn test_close_report_waits_for_a_full_event_channel() {
        let (tx, mut events) = mpsc::channel(1);
        let peer = Peer::new(
            PeerId::from_bytes([1u8; 32]),
            "127.0.0.1:30333".parse().unwrap(),
            settings(1, 4),
            DuplexOpener::new(1024),
            tx.clone(),
        );
        let queued = PeerId::from_bytes([2u8; 32]);
        assert_ok!(tx.try_send(PeerEvent::Closed { peer_id: queued }));

        let (local, remote) = tokio::io::duplex(1024);
        assert_ok!(peer.add_stream(Box::new(local)));
        drop(remote);
        wait_for(|| peer.stream_count() == 0).await;

        match events.recv().await {
            Some(PeerEvent::Closed { peer_id }) => assert_eq!(peer_id, queued),
            other => panic!("unexpected event {:?}", other),
        }
        match timeout(Duration::from_secs(2), events.recv()).await {
            Ok(Some(PeerEvent::Closed { peer_id })) => assert_eq!(peer_id, peer.id()),
            other => panic!("close report was lost: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stop_before_start_ends_write_loop() {
        let (peer, _events) = new_peer(settings(1, 4), DuplexOpener::new(1024));
        peer.stop();
        // The write loop sees the earlier stop and exits at once.
        peer.start();
        assert!(matches!(
            peer.send_message(frame(b"late"), MessagePriority::Urgent),
            Err(P2PError::PeerClosed)
        ));
        let result = timeout(Duration::from_secs(1), peer.acquire_stream()).await;
        assert!(matches!(result, Ok(Err(P2PError::PeerClosed))));
    }
}
