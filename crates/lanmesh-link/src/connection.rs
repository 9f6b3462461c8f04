//! Reliable windowed message stream over a session
//!
//! A [`Connection`] turns a raw framed session into one reliable,
//! in-order stream of [`OverlayMessage`]s to a single remote peer:
//!
//! - outbound messages ride SYN datagrams sequenced by the send ring;
//!   unacked datagrams are retransmitted once their age exceeds an
//!   RTT-derived bound
//! - inbound SYN datagrams are dispatched in sequence order and
//!   acknowledged; retransmits of already-delivered datagrams are
//!   re-acknowledged without dispatching
//! - a FIRST/SECOND handshake brings the stream up
//!
//! Used directly, a `Connection` is the direct peer adapter; the relay
//! adapter wraps one over a pooled session (see [`crate::relay`]).

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU8, AtomicU16, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use lanmesh_core::{
    DatagramFlags, Inbound, LinkConfig, LinkFrame, LinkStatus, OverlayMessage, PeerId, PeerLink,
    SEQ_MASK, SessionId, SessionLink, TransDatagram, TransportError, decode_overlay,
    encode_overlay,
};

use crate::ping::PingChecker;
use crate::window::SendWindow;

const STATUS_DISCONNECTED: u8 = 0;
const STATUS_HANDSHAKING: u8 = 1;
const STATUS_CONNECTED: u8 = 2;

/// Point-in-time counters of a connection
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    /// Total SYN datagrams sent
    pub sent: u32,
    /// Acknowledged-and-consumed datagrams
    pub acked: u32,
    /// Datagrams currently in flight
    pub in_flight: u32,
    /// Latest smoothed round-trip estimate, if any
    pub rtt_ms: Option<u32>,
}

/// One reliable message stream to a remote peer
pub struct Connection {
    local: PeerId,
    remote: PeerId,
    session: Arc<dyn SessionLink>,
    window: SendWindow,
    status: AtomicU8,
    came_up: Notify,
    sink: Mutex<Option<mpsc::Sender<Inbound>>>,
    pending_pings: Mutex<HashMap<u32, oneshot::Sender<()>>>,
    recv_next: AtomicU16,
    last_ack_time: Mutex<Option<Instant>>,
    rtt_ms: AtomicU32,
    pinger: PingChecker,
    cfg: LinkConfig,
    cancel: CancellationToken,
}

impl Connection {
    /// Create a connection over an open session and start its receive
    /// and retransmit tasks
    pub fn spawn(
        local: PeerId,
        remote: PeerId,
        session: Arc<dyn SessionLink>,
        inbox: mpsc::Receiver<LinkFrame>,
        cfg: LinkConfig,
    ) -> Arc<Self> {
        let conn = Arc::new(Self {
            local,
            remote,
            session,
            window: SendWindow::new(),
            status: AtomicU8::new(STATUS_DISCONNECTED),
            came_up: Notify::new(),
            sink: Mutex::new(None),
            pending_pings: Mutex::new(HashMap::new()),
            recv_next: AtomicU16::new(0),
            last_ack_time: Mutex::new(None),
            rtt_ms: AtomicU32::new(0),
            pinger: PingChecker::new(cfg.ping_timeout),
            cfg,
            cancel: CancellationToken::new(),
        });

        tokio::spawn(conn.clone().recv_loop(inbox));
        tokio::spawn(conn.clone().retransmit_loop());

        conn
    }

    fn state(&self) -> LinkStatus {
        match self.status.load(Ordering::Acquire) {
            STATUS_CONNECTED => LinkStatus::Connected,
            STATUS_HANDSHAKING => LinkStatus::Handshaking,
            _ => LinkStatus::Disconnected,
        }
    }

    fn set_state(&self, status: LinkStatus) {
        let raw = match status {
            LinkStatus::Disconnected => STATUS_DISCONNECTED,
            LinkStatus::Handshaking => STATUS_HANDSHAKING,
            LinkStatus::Connected => STATUS_CONNECTED,
        };
        self.status.store(raw, Ordering::Release);
        if status == LinkStatus::Connected {
            self.came_up.notify_waiters();
        }
    }

    /// Perform the handshake; returns whether the stream came up
    pub(crate) async fn establish(&self) -> bool {
        if self.state() == LinkStatus::Connected {
            return true;
        }
        if !self.session.is_open() {
            return false;
        }

        self.set_state(LinkStatus::Handshaking);
        let opener = TransDatagram::first_handshake(self.local, self.remote);
        if let Err(e) = self.session.send_frame(LinkFrame::Datagram(opener)).await {
            debug!(peer = %self.remote.short_id(), error = %e, "Handshake send failed");
            self.set_state(LinkStatus::Disconnected);
            return false;
        }

        let wait = tokio::time::timeout(self.cfg.handshake_timeout, async {
            loop {
                let notified = self.came_up.notified();
                if self.state() == LinkStatus::Connected {
                    return;
                }
                notified.await;
            }
        });

        match wait.await {
            Ok(()) => true,
            Err(_) => {
                if self.state() == LinkStatus::Connected {
                    true
                } else {
                    debug!(peer = %self.remote.short_id(), "Handshake timed out");
                    self.set_state(LinkStatus::Disconnected);
                    false
                }
            }
        }
    }

    /// Tear the connection down and close its session
    pub(crate) async fn shutdown(&self) {
        self.set_state(LinkStatus::Disconnected);
        self.cancel.cancel();
        self.session.close();
    }

    /// Send one message over the reliable stream
    ///
    /// Waits for ring space when the window is full. Fails without
    /// queueing when the link is not up; the partner supervisor brings
    /// it back.
    pub(crate) async fn send_message(&self, msg: &OverlayMessage) -> Result<(), TransportError> {
        if self.state() != LinkStatus::Connected {
            warn!(peer = %self.remote.short_id(), "Link not ready, dropping message");
            return Err(TransportError::LinkNotReady);
        }

        let payload = encode_overlay(msg)?;
        let counter = self.window.reserve().await;
        let seq = SendWindow::seq_of(counter);
        self.window.record(counter, payload.clone());

        let datagram = TransDatagram::syn(seq, self.local, self.remote, payload);
        match self.session.send_frame(LinkFrame::Datagram(datagram)).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // The retransmit sweep re-sends the recorded slot if the
                // session comes back; a dead session downs the link.
                if !self.session.is_open() {
                    self.set_state(LinkStatus::Disconnected);
                }
                Err(e)
            }
        }
    }

    /// Probe the round trip once
    pub(crate) async fn probe(&self) -> u32 {
        self.pinger.check_ping(self).await
    }

    pub(crate) fn register_ping(&self, token: u32, done: oneshot::Sender<()>) {
        self.pending_pings
            .lock()
            .expect("ping table poisoned")
            .insert(token, done);
    }

    pub(crate) fn forget_ping(&self, token: u32) {
        self.pending_pings
            .lock()
            .expect("ping table poisoned")
            .remove(&token);
    }

    pub(crate) fn set_sink(&self, sink: Option<mpsc::Sender<Inbound>>) {
        let mut slot = self.sink.lock().expect("sink poisoned");
        if let (Some(current), Some(new)) = (&*slot, &sink) {
            if current.same_channel(new) {
                return;
            }
        }
        *slot = sink;
    }

    fn rtt_sample(&self, ms: u32) {
        if ms == u32::MAX {
            return;
        }
        let previous = self.rtt_ms.load(Ordering::Acquire);
        let smoothed = if previous == 0 {
            ms
        } else {
            // 7/8 old + 1/8 new
            previous - previous / 8 + ms / 8
        };
        self.rtt_ms.store(smoothed.max(1), Ordering::Release);
    }

    fn retransmit_age(&self) -> Duration {
        match self.rtt_ms.load(Ordering::Acquire) {
            0 => self.cfg.initial_retransmit_age,
            rtt => Duration::from_millis(4 * rtt as u64).clamp(
                self.cfg.retransmit_age_floor,
                self.cfg.retransmit_age_ceiling,
            ),
        }
    }

    /// When the most recent acknowledgment arrived
    pub fn last_ack_time(&self) -> Option<Instant> {
        *self.last_ack_time.lock().expect("ack time poisoned")
    }

    /// Snapshot the connection's counters
    pub fn stats(&self) -> ConnectionStats {
        let (sent, acked) = self.window.pointers();
        let rtt = self.rtt_ms.load(Ordering::Acquire);
        ConnectionStats {
            sent,
            acked,
            in_flight: sent.wrapping_sub(acked),
            rtt_ms: (rtt != 0).then_some(rtt),
        }
    }

    /// The send window, for inspection
    pub fn window(&self) -> &SendWindow {
        &self.window
    }

    async fn recv_loop(self: Arc<Self>, mut inbox: mpsc::Receiver<LinkFrame>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                frame = inbox.recv() => match frame {
                    Some(LinkFrame::Datagram(datagram)) => self.handle_datagram(datagram).await,
                    Some(_) => {} // heartbeats and relay control stay below this layer
                    None => break,
                }
            }
        }
        self.set_state(LinkStatus::Disconnected);
        trace!(peer = %self.remote.short_id(), "Connection receive loop ended");
    }

    async fn handle_datagram(&self, datagram: TransDatagram) {
        if datagram.flags.contains(DatagramFlags::FIRST_HANDSHAKE) {
            let reply = TransDatagram::second_handshake(self.local, self.remote);
            if let Err(e) = self.session.send_frame(LinkFrame::Datagram(reply)).await {
                debug!(peer = %self.remote.short_id(), error = %e, "Handshake reply failed");
                return;
            }
            self.set_state(LinkStatus::Connected);
            return;
        }

        if datagram.flags.contains(DatagramFlags::SECOND_HANDSHAKE) {
            self.set_state(LinkStatus::Connected);
            return;
        }

        if datagram.flags.contains(DatagramFlags::ACK) {
            if self.window.acknowledge(datagram.seq) {
                *self.last_ack_time.lock().expect("ack time poisoned") = Some(Instant::now());
            }
            return;
        }

        if datagram.flags.contains(DatagramFlags::SYN) {
            let Some(payload) = datagram.payload else {
                warn!(peer = %self.remote.short_id(), "SYN without payload, dropping");
                return;
            };

            let expected = self.recv_next.load(Ordering::Acquire);
            if datagram.seq != expected {
                // Retransmit of a delivered datagram whose ACK was lost:
                // acknowledge again, dispatch nothing
                self.send_ack(datagram.seq).await;
                return;
            }

            match decode_overlay(&payload) {
                Ok(msg) => {
                    self.recv_next
                        .store(expected.wrapping_add(1) & SEQ_MASK, Ordering::Release);
                    self.send_ack(datagram.seq).await;
                    self.dispatch(msg).await;
                }
                Err(e) => {
                    // A malformed payload is not acknowledged
                    warn!(peer = %self.remote.short_id(), error = %e, "Dropping malformed datagram");
                }
            }
        }
    }

    async fn send_ack(&self, seq: u16) {
        let ack = TransDatagram::ack(seq, self.local, self.remote);
        if let Err(e) = self.session.send_frame(LinkFrame::Datagram(ack)).await {
            debug!(peer = %self.remote.short_id(), error = %e, "ACK send failed");
        }
    }

    async fn dispatch(&self, msg: OverlayMessage) {
        match msg {
            OverlayMessage::PingReq { token } => {
                let _ = self.send_message(&OverlayMessage::PingResp { token }).await;
            }
            OverlayMessage::PingResp { token } => {
                let done = self
                    .pending_pings
                    .lock()
                    .expect("ping table poisoned")
                    .remove(&token);
                if let Some(done) = done {
                    let _ = done.send(());
                }
            }
            other => {
                let sink = self.sink.lock().expect("sink poisoned").clone();
                match sink {
                    Some(sink) => {
                        let inbound = Inbound {
                            peer: self.remote,
                            session: self.session.id(),
                            message: other,
                        };
                        if sink.send(inbound).await.is_err() {
                            debug!(peer = %self.remote.short_id(), "Sink closed, dropping message");
                        }
                    }
                    None => trace!(peer = %self.remote.short_id(), "No sink installed, dropping message"),
                }
            }
        }
    }

    async fn retransmit_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.cfg.retransmit_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if self.state() != LinkStatus::Connected {
                        continue;
                    }
                    let age = self.retransmit_age();
                    for (seq, payload) in self.window.stale_payloads(age) {
                        trace!(peer = %self.remote.short_id(), seq, "Retransmitting unacked datagram");
                        let datagram = TransDatagram::syn(seq, self.local, self.remote, payload);
                        if self.session.send_frame(LinkFrame::Datagram(datagram)).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl PeerLink for Connection {
    fn peer(&self) -> PeerId {
        self.remote
    }

    fn status(&self) -> LinkStatus {
        self.state()
    }

    fn session_id(&self) -> Option<SessionId> {
        self.session.is_open().then(|| self.session.id())
    }

    async fn connect(&self) -> bool {
        self.establish().await
    }

    async fn disconnect(&self) {
        self.shutdown().await;
    }

    async fn send(&self, msg: &OverlayMessage) -> Result<(), TransportError> {
        self.send_message(msg).await
    }

    fn install_sink(&self, sink: mpsc::Sender<Inbound>) {
        self.set_sink(Some(sink));
    }

    fn clear_sink(&self) {
        self.set_sink(None);
    }

    async fn check_ping(&self) -> u32 {
        self.probe().await
    }

    fn record_rtt(&self, ms: u32) {
        self.rtt_sample(ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use lanmesh_core::{OverlayPacket, memory_pair};

    fn peer(b: u8) -> PeerId {
        PeerId::from_bytes([b; 16])
    }

    fn pair() -> (Arc<Connection>, Arc<Connection>) {
        let (a, b) = memory_pair(64);
        let conn_a = Connection::spawn(peer(1), peer(2), a.session, a.inbox, LinkConfig::default());
        let conn_b = Connection::spawn(peer(2), peer(1), b.session, b.inbox, LinkConfig::default());
        (conn_a, conn_b)
    }

    fn packet_msg(from: u8, to: u8, body: Vec<u8>) -> OverlayMessage {
        OverlayMessage::Packet(OverlayPacket {
            from: peer(from),
            to: peer(to),
            ttl: 32,
            payload: Bytes::from(body),
        })
    }

    #[tokio::test]
    async fn test_handshake_brings_both_sides_up() {
        let (a, b) = pair();

        assert!(a.establish().await);
        assert_eq!(a.status(), LinkStatus::Connected);

        // The responder came up on seeing the opener
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(b.status(), LinkStatus::Connected);
    }

    #[tokio::test]
    async fn test_send_requires_connected() {
        let (a, _b) = pair();

        let result = a.send_message(&packet_msg(1, 2, b"early".to_vec())).await;
        assert!(matches!(result, Err(TransportError::LinkNotReady)));
    }

    #[tokio::test]
    async fn test_messages_dispatch_in_order() {
        let (a, b) = pair();
        assert!(a.establish().await);

        let (tx, mut rx) = mpsc::channel(64);
        b.install_sink(tx);

        for i in 0..20u8 {
            a.send_message(&packet_msg(1, 2, vec![i])).await.unwrap();
        }

        for i in 0..20u8 {
            let inbound = rx.recv().await.unwrap();
            assert_eq!(inbound.peer, peer(1));
            match inbound.message {
                OverlayMessage::Packet(p) => assert_eq!(p.payload.as_ref(), &[i]),
                other => panic!("Unexpected message: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_acks_drain_the_window() {
        let (a, b) = pair();
        assert!(a.establish().await);

        let (tx, mut rx) = mpsc::channel(64);
        b.install_sink(tx);

        for _ in 0..50 {
            a.send_message(&packet_msg(1, 2, b"data".to_vec())).await.unwrap();
        }
        for _ in 0..50 {
            rx.recv().await.unwrap();
        }

        // Give the acks time to flow back
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stats = a.stats();
        assert_eq!(stats.sent, 50);
        assert_eq!(stats.acked, 50);
        assert_eq!(stats.in_flight, 0);
        assert!(a.last_ack_time().is_some());
    }

    #[tokio::test]
    async fn test_ping_roundtrip_and_timeout() {
        let (a, b) = pair();
        assert!(a.establish().await);

        let rtt = a.probe().await;
        assert_ne!(rtt, u32::MAX);

        // A downed responder cannot answer
        b.shutdown().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(a.probe().await, u32::MAX);
    }

    #[tokio::test]
    async fn test_malformed_payload_not_acked() {
        let (a, b) = memory_pair(64);
        let conn_b =
            Connection::spawn(peer(2), peer(1), b.session, b.inbox, LinkConfig::default());
        let (tx, _rx) = mpsc::channel(64);
        conn_b.install_sink(tx);

        // Handshake by hand from the raw side
        let mut a_inbox = a.inbox;
        a.session
            .send_frame(LinkFrame::Datagram(TransDatagram::first_handshake(
                peer(1),
                peer(2),
            )))
            .await
            .unwrap();
        match a_inbox.recv().await.unwrap() {
            LinkFrame::Datagram(d) => {
                assert!(d.flags.contains(DatagramFlags::SECOND_HANDSHAKE))
            }
            _ => panic!("Expected handshake reply"),
        }

        // A SYN carrying garbage must not be acknowledged
        let garbage = TransDatagram::syn(0, peer(1), peer(2), Bytes::from_static(&[0xFF; 8]));
        a.session
            .send_frame(LinkFrame::Datagram(garbage))
            .await
            .unwrap();

        let got_ack =
            tokio::time::timeout(Duration::from_millis(100), a_inbox.recv()).await;
        assert!(got_ack.is_err(), "malformed datagram was acknowledged");
    }

    #[tokio::test]
    async fn test_retransmit_is_reacked_without_redelivery() {
        let (a, b) = memory_pair(64);
        let conn_b =
            Connection::spawn(peer(2), peer(1), b.session, b.inbox, LinkConfig::default());
        let (tx, mut delivered) = mpsc::channel(64);
        conn_b.install_sink(tx);

        let mut a_inbox = a.inbox;
        a.session
            .send_frame(LinkFrame::Datagram(TransDatagram::first_handshake(
                peer(1),
                peer(2),
            )))
            .await
            .unwrap();
        let _handshake = a_inbox.recv().await.unwrap();

        let payload = encode_overlay(&packet_msg(1, 2, b"once".to_vec())).unwrap();
        let syn = TransDatagram::syn(0, peer(1), peer(2), payload);

        // Deliver the same seq twice, as a lost-ACK retransmit would
        a.session
            .send_frame(LinkFrame::Datagram(syn.clone()))
            .await
            .unwrap();
        a.session
            .send_frame(LinkFrame::Datagram(syn))
            .await
            .unwrap();

        // Two ACKs come back
        for _ in 0..2 {
            match a_inbox.recv().await.unwrap() {
                LinkFrame::Datagram(d) => {
                    assert!(d.flags.contains(DatagramFlags::ACK));
                    assert_eq!(d.seq, 0);
                }
                _ => panic!("Expected ACK"),
            }
        }

        // But only one delivery happened
        let first = delivered.recv().await.unwrap();
        assert!(matches!(first.message, OverlayMessage::Packet(_)));
        let second =
            tokio::time::timeout(Duration::from_millis(100), delivered.recv()).await;
        assert!(second.is_err(), "retransmit was dispatched twice");
    }
}
