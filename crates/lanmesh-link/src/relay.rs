//! Pooled relay sessions
//!
//! Relays are expensive, so the process keeps exactly one TCP session
//! per relay endpoint and shares it across every connection whose peer
//! is reached through that relay. The [`RelayPool`] owns the shared
//! state: per endpoint, one mutex guards the (session, refcount,
//! cancellation) tuple, so dialing, publishing, and teardown can never
//! interleave.
//!
//! A [`RelaySession`] demultiplexes inbound datagrams onto its logical
//! targets by `relay_from`, which is how one TCP stream fans out to many
//! [`RelayConnection`]s. Datagrams from peers with no registered target
//! are discarded.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use lanmesh_core::{
    Inbound, LinkConfig, LinkFrame, LinkStatus, OverlayMessage, PeerId, PeerLink, RelayConfig,
    RelayError, RoomInfo, SessionId, SessionLink, TransportError, next_session_id,
};

use crate::connection::Connection;
use crate::tcp::{read_frame, write_frame};

/// One live TCP session to a relay endpoint, shared by many connections
pub struct RelaySession {
    id: SessionId,
    endpoint: SocketAddr,
    writer: Mutex<OwnedWriteHalf>,
    targets: DashMap<PeerId, mpsc::Sender<LinkFrame>>,
    open: Arc<AtomicBool>,
    last_heartbeat: std::sync::Mutex<Instant>,
    cancel: CancellationToken,
}

impl RelaySession {
    /// Dial a relay and perform the link-creation handshake
    pub async fn dial(
        endpoint: SocketAddr,
        user_id: PeerId,
        room: &dyn RoomInfo,
        cfg: &RelayConfig,
    ) -> Result<Arc<Self>, RelayError> {
        let stream = tokio::time::timeout(cfg.dial_timeout, TcpStream::connect(endpoint))
            .await
            .map_err(|_| RelayError::DialFailed("dial timed out".into()))?
            .map_err(|e| RelayError::DialFailed(e.to_string()))?;

        let (mut read_half, mut write_half) = stream.into_split();

        let request = LinkFrame::CreateRelayLink {
            user_id,
            room_id: room.room_id(),
        };
        write_frame(&mut write_half, &request)
            .await
            .map_err(|e| RelayError::HandshakeFailed(e.to_string()))?;

        match read_frame(&mut read_half).await {
            Ok(LinkFrame::RelayLinkCreated { accepted: true }) => {}
            Ok(LinkFrame::RelayLinkCreated { accepted: false }) => {
                return Err(RelayError::Rejected);
            }
            Ok(_) => return Err(RelayError::HandshakeFailed("unexpected frame".into())),
            Err(e) => return Err(RelayError::HandshakeFailed(e.to_string())),
        }

        let session = Arc::new(Self {
            id: next_session_id(),
            endpoint,
            writer: Mutex::new(write_half),
            targets: DashMap::new(),
            open: Arc::new(AtomicBool::new(true)),
            last_heartbeat: std::sync::Mutex::new(Instant::now()),
            cancel: CancellationToken::new(),
        });

        tokio::spawn(session.clone().read_loop(read_half));

        info!(endpoint = %endpoint, "Relay session established");
        Ok(session)
    }

    /// Register a logical target and get its inbound datagram channel
    ///
    /// Datagrams whose `relay_from` matches the target are routed to the
    /// returned channel; everything else never reaches this target.
    pub fn open_target(
        self: &Arc<Self>,
        remote: PeerId,
        inbox_capacity: usize,
    ) -> (Arc<RelayTarget>, mpsc::Receiver<LinkFrame>) {
        let (tx, rx) = mpsc::channel(inbox_capacity);
        self.targets.insert(remote, tx);
        (
            Arc::new(RelayTarget {
                session: self.clone(),
                target: remote,
            }),
            rx,
        )
    }

    /// Whether the session can still carry frames
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Process-unique identity of this session
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Time since the relay last sent a heartbeat
    pub fn heartbeat_age(&self) -> Duration {
        self.last_heartbeat
            .lock()
            .expect("heartbeat clock poisoned")
            .elapsed()
    }

    /// Write a heartbeat frame
    pub async fn send_heartbeat(&self) -> Result<(), TransportError> {
        self.send_raw(LinkFrame::HeartBeat).await
    }

    /// Close the session and drop every target channel
    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
        self.cancel.cancel();
        self.targets.clear();
    }

    async fn send_raw(&self, frame: LinkFrame) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ConnectionClosed);
        }
        let mut writer = self.writer.lock().await;
        match write_frame(&mut *writer, &frame).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.open.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    async fn read_loop(self: Arc<Self>, mut reader: OwnedReadHalf) {
        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => break,
                frame = read_frame(&mut reader) => frame,
            };
            match frame {
                Ok(LinkFrame::Datagram(datagram)) => {
                    let Some(from) = datagram.relay_from else {
                        trace!("Relay datagram without relay_from, dropping");
                        continue;
                    };
                    let target = self.targets.get(&from).map(|t| t.clone());
                    match target {
                        Some(tx) => {
                            if tx.send(LinkFrame::Datagram(datagram)).await.is_err() {
                                self.targets.remove(&from);
                            }
                        }
                        None => {
                            trace!(from = %from.short_id(), "No target for relayed datagram, dropping")
                        }
                    }
                }
                Ok(LinkFrame::HeartBeat) => {
                    *self
                        .last_heartbeat
                        .lock()
                        .expect("heartbeat clock poisoned") = Instant::now();
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(endpoint = %self.endpoint, error = %e, "Relay session read ended");
                    break;
                }
            }
        }
        self.open.store(false, Ordering::Release);
        self.targets.clear();
    }
}

/// One logical target on a shared relay session
///
/// Implements [`SessionLink`] so a [`Connection`] can run over it.
/// Closing a target only unregisters its demux entry; the shared TCP
/// session stays up for other holders.
pub struct RelayTarget {
    session: Arc<RelaySession>,
    target: PeerId,
}

#[async_trait]
impl SessionLink for RelayTarget {
    fn id(&self) -> SessionId {
        // Shared identity: every target of one relay session reports the
        // same id, which is what split-horizon flooding keys on
        self.session.id
    }

    fn is_open(&self) -> bool {
        self.session.is_open() && self.session.targets.contains_key(&self.target)
    }

    async fn send_frame(&self, frame: LinkFrame) -> Result<(), TransportError> {
        self.session.send_raw(frame).await
    }

    fn close(&self) {
        self.session.targets.remove(&self.target);
    }
}

#[derive(Default)]
struct EndpointState {
    session: Option<Arc<RelaySession>>,
    refs: u32,
    cancel: Option<CancellationToken>,
}

#[derive(Default)]
struct EndpointEntry {
    state: Mutex<EndpointState>,
}

/// Process-wide pool of shared relay sessions
pub struct RelayPool {
    user_id: PeerId,
    room: Arc<dyn RoomInfo>,
    entries: DashMap<SocketAddr, Arc<EndpointEntry>>,
    cfg: RelayConfig,
    cancel: CancellationToken,
}

impl RelayPool {
    /// Create a pool for this process
    pub fn new(
        user_id: PeerId,
        room: Arc<dyn RoomInfo>,
        cfg: RelayConfig,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            user_id,
            room,
            entries: DashMap::new(),
            cfg,
            cancel,
        })
    }

    /// Acquire the shared session for an endpoint, dialing if needed
    ///
    /// Bumps the endpoint's reference count. Every successful call must
    /// be paired with a [`RelayPool::release`].
    pub async fn acquire(self: &Arc<Self>, endpoint: SocketAddr) -> Result<Arc<RelaySession>, RelayError> {
        // Spread concurrent dial storms apart
        let jitter = rand::rng().random_range(self.cfg.jitter_min_ms..=self.cfg.jitter_max_ms);
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(jitter)) => {}
            _ = self.cancel.cancelled() => return Err(RelayError::Cancelled),
        }

        let entry = {
            let entry = self.entries.entry(endpoint).or_default();
            entry.value().clone()
        };

        let mut state = tokio::select! {
            guard = entry.state.lock() => guard,
            _ = self.cancel.cancelled() => return Err(RelayError::Cancelled),
        };

        let reusable = state.session.as_ref().filter(|s| s.is_open()).cloned();
        if let Some(session) = reusable {
            state.refs += 1;
            trace!(endpoint = %endpoint, refs = state.refs, "Reusing pooled relay session");
            return Ok(session);
        }

        let session = tokio::select! {
            dialed = RelaySession::dial(endpoint, self.user_id, self.room.as_ref(), &self.cfg) => dialed?,
            _ = self.cancel.cancelled() => return Err(RelayError::Cancelled),
        };

        // Publish, closing any predecessor
        if let Some(previous) = state.session.take() {
            previous.close();
        }
        if let Some(previous) = state.cancel.take() {
            previous.cancel();
        }

        let token = self.cancel.child_token();
        tokio::spawn(keepalive(
            self.clone(),
            endpoint,
            session.clone(),
            token.clone(),
            self.cfg.clone(),
        ));

        state.session = Some(session.clone());
        state.cancel = Some(token);
        state.refs += 1;
        Ok(session)
    }

    /// Drop one reference to an endpoint's session
    ///
    /// At zero the shared cancellation fires, the session closes, and
    /// the endpoint is evicted from the pool.
    pub async fn release(&self, endpoint: SocketAddr) {
        let Some(entry) = self.entries.get(&endpoint).map(|e| e.clone()) else {
            return;
        };
        let mut state = entry.state.lock().await;
        state.refs = state.refs.saturating_sub(1);
        if state.refs == 0 {
            debug!(endpoint = %endpoint, "Last holder released relay session");
            if let Some(token) = state.cancel.take() {
                token.cancel();
            }
            if let Some(session) = state.session.take() {
                session.close();
            }
            drop(state);
            self.entries.remove(&endpoint);
        }
    }

    /// Current reference count of an endpoint
    pub async fn ref_count(&self, endpoint: SocketAddr) -> u32 {
        match self.entries.get(&endpoint).map(|e| e.clone()) {
            Some(entry) => entry.state.lock().await.refs,
            None => 0,
        }
    }

    /// Whether the pool holds an entry for an endpoint
    pub fn contains(&self, endpoint: SocketAddr) -> bool {
        self.entries.contains_key(&endpoint)
    }

    async fn teardown(&self, endpoint: SocketAddr, failed: &Arc<RelaySession>) {
        if let Some(entry) = self.entries.get(&endpoint).map(|e| e.clone()) {
            let mut state = entry.state.lock().await;
            let is_current = state
                .session
                .as_ref()
                .map(|s| s.id() == failed.id())
                .unwrap_or(false);
            if is_current {
                if let Some(token) = state.cancel.take() {
                    token.cancel();
                }
                state.session = None;
                drop(state);
                self.entries.remove(&endpoint);
            }
        }
        failed.close();
    }
}

/// Heartbeat writer and liveness probe of one published session
async fn keepalive(
    pool: Arc<RelayPool>,
    endpoint: SocketAddr,
    session: Arc<RelaySession>,
    token: CancellationToken,
    cfg: RelayConfig,
) {
    let mut heartbeat = tokio::time::interval(cfg.heartbeat_interval);
    let mut liveness = tokio::time::interval(cfg.heartbeat_interval);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = heartbeat.tick() => {
                if session.send_heartbeat().await.is_err() {
                    debug!(endpoint = %endpoint, "Relay heartbeat write failed");
                }
            }
            _ = liveness.tick() => {
                if !session.is_open() || session.heartbeat_age() > cfg.liveness_timeout {
                    warn!(endpoint = %endpoint, "Relay session failed liveness, tearing down");
                    pool.teardown(endpoint, &session).await;
                    break;
                }
            }
        }
    }
}

/// Reliable stream to one peer over a pooled relay session
pub struct RelayConnection {
    local: PeerId,
    remote: PeerId,
    endpoint: SocketAddr,
    pool: Arc<RelayPool>,
    inner: std::sync::Mutex<Option<Arc<Connection>>>,
    connect_lock: Mutex<()>,
    sink: std::sync::Mutex<Option<mpsc::Sender<Inbound>>>,
    cfg: LinkConfig,
}

impl RelayConnection {
    /// Create a relay-backed link to `remote` through `endpoint`
    pub fn new(
        local: PeerId,
        remote: PeerId,
        endpoint: SocketAddr,
        pool: Arc<RelayPool>,
        cfg: LinkConfig,
    ) -> Self {
        Self {
            local,
            remote,
            endpoint,
            pool,
            inner: std::sync::Mutex::new(None),
            connect_lock: Mutex::new(()),
            sink: std::sync::Mutex::new(None),
            cfg,
        }
    }

    fn current(&self) -> Option<Arc<Connection>> {
        self.inner.lock().expect("relay connection poisoned").clone()
    }
}

#[async_trait]
impl PeerLink for RelayConnection {
    fn peer(&self) -> PeerId {
        self.remote
    }

    fn status(&self) -> LinkStatus {
        self.current()
            .map(|c| c.status())
            .unwrap_or(LinkStatus::Disconnected)
    }

    fn session_id(&self) -> Option<SessionId> {
        self.current().and_then(|c| c.session_id())
    }

    async fn connect(&self) -> bool {
        let _connecting = self.connect_lock.lock().await;

        if let Some(conn) = self.current() {
            if conn.status() == LinkStatus::Connected {
                return true;
            }
        }

        // Tear down a stale holder before re-acquiring
        let stale = self
            .inner
            .lock()
            .expect("relay connection poisoned")
            .take();
        if let Some(conn) = stale {
            conn.shutdown().await;
            self.pool.release(self.endpoint).await;
        }

        let session = match self.pool.acquire(self.endpoint).await {
            Ok(session) => session,
            Err(e) => {
                debug!(peer = %self.remote.short_id(), error = %e, "Relay connect failed");
                return false;
            }
        };

        let (target, inbox) = session.open_target(self.remote, self.cfg.inbox_capacity);
        let conn = Connection::spawn(self.local, self.remote, target, inbox, self.cfg.clone());
        if let Some(sink) = self.sink.lock().expect("sink poisoned").clone() {
            conn.install_sink(sink);
        }

        if conn.establish().await {
            *self.inner.lock().expect("relay connection poisoned") = Some(conn);
            true
        } else {
            conn.shutdown().await;
            self.pool.release(self.endpoint).await;
            false
        }
    }

    async fn disconnect(&self) {
        let _connecting = self.connect_lock.lock().await;
        let taken = self
            .inner
            .lock()
            .expect("relay connection poisoned")
            .take();
        if let Some(conn) = taken {
            conn.shutdown().await;
            self.pool.release(self.endpoint).await;
        }
    }

    async fn send(&self, msg: &OverlayMessage) -> Result<(), TransportError> {
        match self.current() {
            Some(conn) => conn.send_message(msg).await,
            None => {
                warn!(peer = %self.remote.short_id(), "Link not ready, dropping message");
                Err(TransportError::LinkNotReady)
            }
        }
    }

    fn install_sink(&self, sink: mpsc::Sender<Inbound>) {
        *self.sink.lock().expect("sink poisoned") = Some(sink.clone());
        if let Some(conn) = self.current() {
            conn.install_sink(sink);
        }
    }

    fn clear_sink(&self) {
        *self.sink.lock().expect("sink poisoned") = None;
        if let Some(conn) = self.current() {
            conn.clear_sink();
        }
    }

    async fn check_ping(&self) -> u32 {
        match self.current() {
            Some(conn) => conn.probe().await,
            None => u32::MAX,
        }
    }

    fn record_rtt(&self, ms: u32) {
        if let Some(conn) = self.current() {
            conn.record_rtt(ms);
        }
    }
}
