//! End-to-end swarm scenarios over loopback TCP.

use std::sync::Arc;
use std::time::Duration;

use lattice_net_primitives::{Keypair, Multiaddr, Peer};
use lattice_net_swarm::{ping, AutoDialer, PeerMonitor, Swarm, SwarmConfig, SwarmEvent};
use tokio_util::sync::CancellationToken;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn test_config() -> SwarmConfig {
    SwarmConfig {
        min_connections: 0,
        connect_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

fn new_swarm() -> Arc<Swarm> {
    init_tracing();
    Swarm::new(Keypair::generate_ed25519(), test_config())
}

async fn listening_swarm() -> (Arc<Swarm>, Multiaddr) {
    let swarm = new_swarm();
    swarm.start();
    let addr = swarm
        .start_listening(&"/ip4/127.0.0.1/tcp/0".parse().unwrap())
        .await
        .unwrap();
    (swarm, addr)
}

async fn wait_until<F: Fn() -> bool>(what: &str, pred: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !pred() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for: {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn happy_dial_identifies_both_sides() {
    let (b, b_addr) = listening_swarm().await;
    let a = new_swarm();
    a.start();

    let conn = a
        .connect_address(&b_addr, CancellationToken::new())
        .await
        .unwrap();
    assert!(conn.is_active());

    // The three handshake completions are all resolved.
    assert_eq!(conn.security_slot().peek(), Some(true));
    assert!(conn.muxer_slot().peek().is_some());
    let remote = conn.identity_slot().peek().unwrap();
    assert_eq!(remote.id(), b.local_peer().id());
    assert_eq!(
        remote.public_key().unwrap().to_peer_id(),
        b.local_peer().id()
    );

    // A knows B, with a connected address.
    let b_entry = a.get_peer(&b.local_peer().id()).unwrap();
    assert!(b_entry.connected_address().is_some());

    // B learns A shortly after.
    let a_id = a.local_peer().id();
    wait_until("B registers A as connected", || {
        b.get_peer(&a_id)
            .is_some_and(|p| p.connected_address().is_some())
    })
    .await;

    a.stop();
    b.stop();
}

#[tokio::test]
async fn disconnect_then_reconnect() {
    let (b, b_addr) = listening_swarm().await;
    let a = new_swarm();
    a.start();

    let conn = a
        .connect_address(&b_addr, CancellationToken::new())
        .await
        .unwrap();
    let b_id = b.local_peer().id();
    let a_id = a.local_peer().id();

    a.disconnect(&b_addr).unwrap();
    assert!(!conn.is_active());

    wait_until("A clears B's connected address", || {
        a.get_peer(&b_id).is_some_and(|p| p.connected_address().is_none())
    })
    .await;
    wait_until("B clears A's connected address", || {
        b.get_peer(&a_id).is_some_and(|p| p.connected_address().is_none())
    })
    .await;

    let fresh = a
        .connect(a.get_peer(&b_id).unwrap(), CancellationToken::new())
        .await
        .unwrap();
    assert!(fresh.is_active());
    assert!(!Arc::ptr_eq(&conn, &fresh));

    a.stop();
    b.stop();
}

#[tokio::test]
async fn concurrent_dials_share_one_connection() {
    let (b, b_addr) = listening_swarm().await;
    let a = new_swarm();
    a.start();

    let peer = a.register_peer_address(&b_addr).unwrap();
    let (first, second) = tokio::join!(
        a.connect(peer.clone(), CancellationToken::new()),
        a.connect(peer.clone(), CancellationToken::new()),
    );
    assert!(Arc::ptr_eq(&first.unwrap(), &second.unwrap()));

    a.stop();
    b.stop();
}

#[tokio::test]
async fn duplicate_inbound_is_dropped() {
    use tokio::io::AsyncReadExt;

    let a = new_swarm();
    a.start();

    let local: Multiaddr = "/ip4/127.0.0.1/tcp/4001".parse().unwrap();
    let remote: Multiaddr = "/ip4/127.0.0.1/tcp/55555".parse().unwrap();

    let (first_near, _first_far) = tokio::io::duplex(4096);
    let (second_near, mut second_far) = tokio::io::duplex(4096);

    // First inbound from the remote address claims the slot and keeps
    // it while its handshake is pending.
    let a1 = a.clone();
    let (l1, r1) = (local.clone(), remote.clone());
    tokio::spawn(async move {
        a1.on_remote_connect(Box::new(first_near), l1, r1).await;
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Second inbound from the same remote address is closed outright.
    a.clone()
        .on_remote_connect(Box::new(second_near), local, remote)
        .await;

    let mut buf = [0u8; 8];
    let n = tokio::time::timeout(Duration::from_secs(1), second_far.read(&mut buf))
        .await
        .expect("second stream should be closed promptly")
        .unwrap();
    assert_eq!(n, 0);

    a.stop();
}

#[tokio::test]
async fn self_dial_is_rejected() {
    let (a, a_addr) = listening_swarm().await;
    let err = a
        .connect_address(&a_addr, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, lattice_net_swarm::SwarmError::SelfDial));
    a.stop();
}

#[tokio::test]
async fn deny_list_blocks_dial() {
    let (b, b_addr) = listening_swarm().await;
    let a = new_swarm();
    a.start();

    a.policy().deny.add(b_addr.clone());
    let err = a
        .connect_address(&b_addr, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, lattice_net_swarm::SwarmError::PeerDenied(_)));

    a.stop();
    b.stop();
}

#[tokio::test]
async fn allow_list_admits_only_listed_peers() {
    let (b, b_addr) = listening_swarm().await;
    let (c, c_addr) = listening_swarm().await;
    let a = new_swarm();
    a.start();

    a.policy().allow.add(c_addr.clone());

    let err = a
        .connect_address(&b_addr, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, lattice_net_swarm::SwarmError::PeerDenied(_)));

    let conn = a
        .connect_address(&c_addr, CancellationToken::new())
        .await
        .unwrap();
    assert!(conn.is_active());

    a.stop();
    b.stop();
    c.stop();
}

#[tokio::test]
async fn ping_measures_latency() {
    let (b, b_addr) = listening_swarm().await;
    let a = new_swarm();
    a.start();

    let conn = a
        .connect_address(&b_addr, CancellationToken::new())
        .await
        .unwrap();
    let rtt = ping::ping(&conn, &CancellationToken::new()).await.unwrap();
    assert!(rtt > Duration::ZERO);
    assert_eq!(conn.remote_peer().unwrap().latency(), Some(rtt));

    a.stop();
    b.stop();
}

#[tokio::test]
async fn autodialer_dials_discovered_peers() {
    let (x, x_addr) = listening_swarm().await;
    let a = new_swarm();
    a.start();

    let dialer = AutoDialer::with_min_connections(a.clone(), 16);
    dialer.start();
    tokio::time::sleep(Duration::from_millis(50)).await;

    a.register_peer_address(&x_addr).unwrap();
    let x_id = x.local_peer().id();
    wait_until("auto-dialer connects to X", || {
        a.manager().is_connected(&x_id)
    })
    .await;

    dialer.stop();
    a.stop();
    x.stop();
}

#[tokio::test]
async fn autodialer_with_zero_floor_stays_idle() {
    let (x, x_addr) = listening_swarm().await;
    let a = new_swarm();
    a.start();

    let dialer = AutoDialer::with_min_connections(a.clone(), 0);
    dialer.start();
    tokio::time::sleep(Duration::from_millis(50)).await;

    a.register_peer_address(&x_addr).unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!a.manager().is_connected(&x.local_peer().id()));

    dialer.stop();
    a.stop();
    x.stop();
}

#[tokio::test]
async fn stop_start_stop_is_clean() {
    let a = new_swarm();
    a.start();
    a.start_listening(&"/ip4/127.0.0.1/tcp/0".parse().unwrap())
        .await
        .unwrap();
    assert!(!a.local_peer().addresses().is_empty());

    a.stop();
    assert!(a.local_peer().addresses().is_empty());

    let mut events = a.events().subscribe();
    a.start();
    a.stop();
    assert!(a.local_peer().addresses().is_empty());
    assert!(matches!(
        events.try_recv(),
        Err(tokio::sync::broadcast::error::TryRecvError::Empty)
    ));

    // A stopped swarm refuses dials.
    let peer = Arc::new(Peer::from_public_key(
        Keypair::generate_ed25519().public(),
    ));
    assert!(matches!(
        a.connect(peer, CancellationToken::new()).await,
        Err(lattice_net_swarm::SwarmError::NotRunning)
    ));
}

#[tokio::test]
async fn double_dispose_publishes_one_closed_event() {
    let (b, b_addr) = listening_swarm().await;
    let a = new_swarm();
    a.start();

    let conn = a
        .connect_address(&b_addr, CancellationToken::new())
        .await
        .unwrap();
    let mut events = a.events().subscribe();

    conn.dispose();
    conn.dispose();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut closed = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, SwarmEvent::ConnectionClosed(_)) {
            closed += 1;
        }
    }
    assert_eq!(closed, 1);

    a.stop();
    b.stop();
}

#[tokio::test]
async fn registering_twice_keeps_registry_size() {
    let a = new_swarm();
    a.start();

    let id = Keypair::generate_ed25519().public().to_peer_id();
    let addr: Multiaddr = format!("/ip4/127.0.0.1/tcp/4001/p2p/{id}").parse().unwrap();
    let first = a.register_peer_address(&addr).unwrap();
    let second = a.register_peer_address(&addr).unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(a.known_peers().len(), 1);
    assert_eq!(first.addresses().len(), 1);

    a.stop();
}

#[tokio::test]
async fn bandwidth_meter_tracks_connection_traffic() {
    let (b, b_addr) = listening_swarm().await;
    let a = new_swarm();
    a.start();

    let conn = a
        .connect_address(&b_addr, CancellationToken::new())
        .await
        .unwrap();
    assert!(conn.is_active());

    // The handshake alone moves bytes through the metered streams.
    assert!(a.bandwidth().total_outbound() > 0);
    assert!(a.bandwidth().total_inbound() > 0);
    assert!(b.bandwidth().total_inbound() > 0);

    // The rate ticker runs while the swarm does: the window holding the
    // handshake bytes shows up as a non-zero rate after the first tick.
    wait_until("rate window captures handshake bytes", || {
        a.bandwidth().inbound_rate() > 0
    })
    .await;

    a.stop();
    b.stop();
}

#[tokio::test]
async fn monitor_backs_off_then_gives_up_on_dead_peer() {
    let config = SwarmConfig {
        min_connections: 0,
        connect_timeout: Duration::from_secs(2),
        initial_backoff: Duration::from_millis(100),
        max_backoff: Duration::from_millis(300),
        ..Default::default()
    };
    init_tracing();
    let a = Swarm::new(Keypair::generate_ed25519(), config);
    a.start();

    let monitor = PeerMonitor::new(a.clone());
    monitor.start();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Nothing listens on port 1.
    let id = Keypair::generate_ed25519().public().to_peer_id();
    let dead_addr: Multiaddr = format!("/ip4/127.0.0.1/tcp/1/p2p/{id}").parse().unwrap();
    assert!(a
        .connect_address(&dead_addr, CancellationToken::new())
        .await
        .is_err());

    wait_until("peer marked dead", || monitor.is_dead(&id)).await;

    // Retries double the backoff past the ceiling; the peer is then
    // deregistered for good.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while a.get_peer(&id).is_some() {
        if tokio::time::Instant::now() > deadline {
            panic!("peer was never deregistered");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(!monitor.is_dead(&id));

    monitor.stop();
    a.stop();
}

#[tokio::test]
async fn established_connection_carries_agent_versions() {
    let (b, b_addr) = listening_swarm().await;
    let a = new_swarm();
    a.start();

    let conn = a
        .connect_address(&b_addr, CancellationToken::new())
        .await
        .unwrap();
    let remote = conn.remote_peer().unwrap();
    assert_eq!(
        remote.agent_version(),
        b.local_peer().agent_version()
    );
    assert_eq!(
        remote.protocol_version(),
        b.local_peer().protocol_version()
    );

    a.stop();
    b.stop();
}
