//! Relay pool behavior against a fake relay server
//!
//! The fake relay speaks the real wire protocol: it accepts
//! CreateRelayLink, stamps `relay_from` on forwarded datagrams, routes
//! them by destination, and (optionally) echoes heartbeats.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use lanmesh_core::{
    LinkConfig, LinkFrame, LinkStatus, OverlayMessage, OverlayPacket, PeerId, PeerLink,
    RelayConfig, RoomId, RoomInfo, StaticRoomInfo,
};
use lanmesh_link::tcp::{read_frame, write_frame};
use lanmesh_link::{RelayConnection, RelayPool};

fn peer(b: u8) -> PeerId {
    PeerId::from_bytes([b; 16])
}

fn fast_relay_config() -> RelayConfig {
    RelayConfig {
        jitter_min_ms: 1,
        jitter_max_ms: 2,
        ..Default::default()
    }
}

fn room() -> Arc<dyn RoomInfo> {
    Arc::new(StaticRoomInfo::new(RoomId::random()))
}

async fn spawn_fake_relay(echo_heartbeats: bool) -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let dials = Arc::new(AtomicUsize::new(0));
    let clients: Arc<DashMap<PeerId, mpsc::Sender<LinkFrame>>> = Arc::new(DashMap::new());

    let dial_counter = dials.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            dial_counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(serve_relay_client(stream, clients.clone(), echo_heartbeats));
        }
    });

    (addr, dials)
}

async fn serve_relay_client(
    stream: TcpStream,
    clients: Arc<DashMap<PeerId, mpsc::Sender<LinkFrame>>>,
    echo_heartbeats: bool,
) {
    let (mut reader, mut writer) = stream.into_split();

    let user = match read_frame(&mut reader).await {
        Ok(LinkFrame::CreateRelayLink { user_id, .. }) => user_id,
        _ => return,
    };
    if write_frame(&mut writer, &LinkFrame::RelayLinkCreated { accepted: true })
        .await
        .is_err()
    {
        return;
    }

    let (tx, mut rx) = mpsc::channel::<LinkFrame>(256);
    clients.insert(user, tx);

    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if write_frame(&mut writer, &frame).await.is_err() {
                break;
            }
        }
    });

    while let Ok(frame) = read_frame(&mut reader).await {
        match frame {
            LinkFrame::Datagram(mut datagram) => {
                datagram.relay_from = Some(user);
                let out = clients.get(&datagram.destination).map(|t| t.clone());
                if let Some(out) = out {
                    let _ = out.send(LinkFrame::Datagram(datagram)).await;
                }
            }
            LinkFrame::HeartBeat => {
                if echo_heartbeats {
                    let out = clients.get(&user).map(|t| t.clone());
                    if let Some(out) = out {
                        let _ = out.send(LinkFrame::HeartBeat).await;
                    }
                }
            }
            _ => {}
        }
    }
    clients.remove(&user);
}

#[tokio::test]
async fn test_one_dial_shared_across_connections() {
    let (relay, dials) = spawn_fake_relay(true).await;
    let cfg = fast_relay_config();

    let pool_a = RelayPool::new(peer(1), room(), cfg.clone(), CancellationToken::new());
    let pool_b = RelayPool::new(peer(2), room(), cfg.clone(), CancellationToken::new());
    let pool_c = RelayPool::new(peer(3), room(), cfg.clone(), CancellationToken::new());

    let a_to_b = RelayConnection::new(peer(1), peer(2), relay, pool_a.clone(), LinkConfig::default());
    let a_to_c = RelayConnection::new(peer(1), peer(3), relay, pool_a.clone(), LinkConfig::default());
    let b_to_a = RelayConnection::new(peer(2), peer(1), relay, pool_b, LinkConfig::default());
    let c_to_a = RelayConnection::new(peer(3), peer(1), relay, pool_c, LinkConfig::default());

    let (up_ab, up_ba) = tokio::join!(a_to_b.connect(), b_to_a.connect());
    assert!(up_ab && up_ba);
    let (up_ac, up_ca) = tokio::join!(a_to_c.connect(), c_to_a.connect());
    assert!(up_ac && up_ca);

    // Two logical connections on host A share one relay dial
    assert_eq!(pool_a.ref_count(relay).await, 2);
    assert_eq!(dials.load(Ordering::SeqCst), 3);

    // First release keeps the shared session alive
    a_to_b.disconnect().await;
    assert_eq!(pool_a.ref_count(relay).await, 1);
    assert!(pool_a.contains(relay));
    assert_eq!(a_to_c.status(), LinkStatus::Connected);

    // Last release closes and evicts it
    a_to_c.disconnect().await;
    assert_eq!(pool_a.ref_count(relay).await, 0);
    assert!(!pool_a.contains(relay));
}

#[tokio::test]
async fn test_relay_demux_keeps_streams_apart() {
    let (relay, _dials) = spawn_fake_relay(true).await;
    let cfg = fast_relay_config();

    let pool_a = RelayPool::new(peer(1), room(), cfg.clone(), CancellationToken::new());
    let pool_b = RelayPool::new(peer(2), room(), cfg.clone(), CancellationToken::new());
    let pool_c = RelayPool::new(peer(3), room(), cfg.clone(), CancellationToken::new());

    let a_to_b = RelayConnection::new(peer(1), peer(2), relay, pool_a.clone(), LinkConfig::default());
    let a_to_c = RelayConnection::new(peer(1), peer(3), relay, pool_a.clone(), LinkConfig::default());
    let b_to_a = RelayConnection::new(peer(2), peer(1), relay, pool_b, LinkConfig::default());
    let c_to_a = RelayConnection::new(peer(3), peer(1), relay, pool_c, LinkConfig::default());

    let (up_ab, up_ba) = tokio::join!(a_to_b.connect(), b_to_a.connect());
    assert!(up_ab && up_ba);
    let (up_ac, up_ca) = tokio::join!(a_to_c.connect(), c_to_a.connect());
    assert!(up_ac && up_ca);

    let (sink_b, mut from_b) = mpsc::channel(16);
    let (sink_c, mut from_c) = mpsc::channel(16);
    a_to_b.install_sink(sink_b);
    a_to_c.install_sink(sink_c);

    let msg = OverlayMessage::Packet(OverlayPacket {
        from: peer(2),
        to: peer(1),
        ttl: 32,
        payload: bytes::Bytes::from_static(b"via relay"),
    });
    b_to_a.send(&msg).await.unwrap();

    // The datagram reaches the logical connection for B and no other
    let inbound = tokio::time::timeout(Duration::from_secs(2), from_b.recv())
        .await
        .expect("nothing arrived from B")
        .unwrap();
    assert_eq!(inbound.peer, peer(2));

    let stray = tokio::time::timeout(Duration::from_millis(200), from_c.recv()).await;
    assert!(stray.is_err(), "datagram leaked to the wrong connection");

    // Both logical links share one underlying session identity
    assert_eq!(a_to_b.session_id(), a_to_c.session_id());
}

#[tokio::test]
async fn test_silent_relay_fails_liveness() {
    let (relay, _dials) = spawn_fake_relay(false).await;
    let cfg = RelayConfig {
        heartbeat_interval: Duration::from_millis(50),
        liveness_timeout: Duration::from_millis(150),
        ..fast_relay_config()
    };

    let pool_a = RelayPool::new(peer(1), room(), cfg.clone(), CancellationToken::new());
    let pool_b = RelayPool::new(peer(2), room(), cfg, CancellationToken::new());

    let a_to_b = RelayConnection::new(peer(1), peer(2), relay, pool_a.clone(), LinkConfig::default());
    let b_to_a = RelayConnection::new(peer(2), peer(1), relay, pool_b, LinkConfig::default());

    let (up_ab, up_ba) = tokio::join!(a_to_b.connect(), b_to_a.connect());
    assert!(up_ab && up_ba);
    assert!(pool_a.contains(relay));

    // No inbound heartbeats: the liveness probe tears the session down
    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            if !pool_a.contains(relay) && a_to_b.status() == LinkStatus::Disconnected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("silent relay session was never torn down");
}
