//! End-to-end tunnel tests: two in-process daemons bridged over loopback
//! UDP with channel-backed tunnel devices
//!
//! Run with: cargo test --test tunnel_test -- --nocapture

use std::sync::Arc;
use std::time::Duration;

use fastd::config::{Config, PeerConfig, RemoteEndpoint};
use fastd::daemon::{Command, Daemon};
use fastd::handshake::fhmqvc::IdentityKey;
use fastd::iface::{channel_device, DeviceTestHandle};
use fastd::types::Mode;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Broadcast frame from 02:00:00:00:00:01 (the S1 frame).
const FRAME_FROM_A: &[u8] = &[
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x02, 0x00, 0x00, 0x00, 0x00, 0x01, 0x08, 0x00,
];

/// Unicast frame back to 02:00:00:00:00:01 from 02:00:00:00:00:02.
const FRAME_FROM_B: &[u8] = &[
    0x02, 0x00, 0x00, 0x00, 0x00, 0x01, 0x02, 0x00, 0x00, 0x00, 0x00, 0x02, 0x08, 0x00,
];

struct TestNode {
    secret: [u8; 32],
    public: fastd::PublicKeyBytes,
}

impl TestNode {
    fn generate(seed: u8) -> TestNode {
        let secret = [seed; 32];
        let public = IdentityKey::from_secret_bytes(secret).public_bytes();
        TestNode { secret, public }
    }
}

fn fast_config(node: &TestNode, peers: Vec<PeerConfig>) -> Config {
    let mut config = Config::default();
    config.secret = Some(node.secret);
    config.add_method("null+salsa20-gmac");
    config.bind_addrs =
        vec![fastd::config::BindAddress { addr: "127.0.0.1:0".parse().unwrap(), device: None }];
    config.peers = peers;
    // Timings scaled down so handshakes, keepalives, and rekeys all
    // happen within the test budget.
    config.min_handshake_interval = Duration::from_millis(200);
    config.maintenance_interval = Duration::from_millis(200);
    config.keepalive_timeout = Duration::from_millis(500);
    config
}

fn peer_entry(remote: Option<std::net::SocketAddr>, key: fastd::PublicKeyBytes) -> PeerConfig {
    PeerConfig {
        name: Some("test-peer".to_string()),
        key,
        remotes: remote.into_iter().map(RemoteEndpoint::Addr).collect(),
        floating: false,
        group: "default".to_string(),
        source: None,
    }
}

struct RunningDaemon {
    device: DeviceTestHandle,
    commands: mpsc::Sender<Command>,
    addr: std::net::SocketAddr,
}

async fn start_daemon(config: Config) -> RunningDaemon {
    let (device, handle) = channel_device("test", config.max_payload());
    let daemon = Daemon::new(Arc::new(config), device).await.unwrap();
    let addr = daemon.local_addr().unwrap();
    let (cmd_tx, cmd_rx) = mpsc::channel(4);
    tokio::spawn(daemon.run(cmd_rx));
    RunningDaemon { device: handle, commands: cmd_tx, addr }
}

/// Inject `frame` into `from` until it pops out of `to` (handshakes take
/// a few round trips to settle).
async fn pump_until_delivered(
    from: &RunningDaemon,
    to: &mut RunningDaemon,
    frame: &[u8],
    budget: Duration,
) -> Option<Vec<u8>> {
    let deadline = tokio::time::Instant::now() + budget;
    loop {
        from.device.inject.send(frame.to_vec()).await.ok()?;
        match timeout(Duration::from_millis(300), to.device.written.recv()).await {
            Ok(Some(delivered)) => return Some(delivered),
            Ok(None) => return None,
            Err(_) => {
                if tokio::time::Instant::now() >= deadline {
                    return None;
                }
            }
        }
    }
}

#[tokio::test]
async fn test_connect_and_deliver_frames() {
    let node_a = TestNode::generate(0x11);
    let node_b = TestNode::generate(0x22);

    // B listens; A connects out to B.
    let mut b = start_daemon(fast_config(&node_b, vec![peer_entry(None, node_a.public)])).await;
    let mut a =
        start_daemon(fast_config(&node_a, vec![peer_entry(Some(b.addr), node_b.public)])).await;

    // The S1 broadcast frame crosses from A's device to B's.
    let delivered = pump_until_delivered(&a, &mut b, FRAME_FROM_A, Duration::from_secs(5))
        .await
        .expect("frame never delivered");
    assert_eq!(delivered, FRAME_FROM_A);

    // B learned A's source address from the decrypted frame, so the
    // unicast reply needs no flooding.
    let reply = pump_until_delivered(&b, &mut a, FRAME_FROM_B, Duration::from_secs(5))
        .await
        .expect("reply never delivered");
    assert_eq!(reply, FRAME_FROM_B);

    let _ = a.commands.send(Command::Shutdown).await;
    let _ = b.commands.send(Command::Shutdown).await;
}

#[tokio::test]
async fn test_rekey_keeps_traffic_flowing() {
    let node_a = TestNode::generate(0x33);
    let node_b = TestNode::generate(0x44);

    let mut config_b = fast_config(&node_b, vec![peer_entry(None, node_a.public)]);
    config_b.key_refresh = Duration::from_secs(1);
    config_b.key_refresh_splay = Duration::ZERO;

    let mut b = start_daemon(config_b).await;

    let mut config_a = fast_config(&node_a, vec![peer_entry(Some(b.addr), node_b.public)]);
    config_a.key_refresh = Duration::from_secs(1);
    config_a.key_refresh_splay = Duration::ZERO;
    let a = start_daemon(config_a).await;

    // Initial establishment.
    assert!(pump_until_delivered(&a, &mut b, FRAME_FROM_A, Duration::from_secs(5))
        .await
        .is_some());

    // Keep frames moving across several refresh deadlines; delivery must
    // never stop while sessions roll over underneath.
    for round in 0..4 {
        tokio::time::sleep(Duration::from_millis(700)).await;
        let delivered = pump_until_delivered(&a, &mut b, FRAME_FROM_A, Duration::from_secs(5)).await;
        assert!(delivered.is_some(), "delivery stopped after rekey round {}", round);
    }

    let _ = a.commands.send(Command::Shutdown).await;
    let _ = b.commands.send(Command::Shutdown).await;
}

#[tokio::test]
async fn test_unknown_peer_cannot_connect() {
    let node_a = TestNode::generate(0x55);
    let node_b = TestNode::generate(0x66);
    let stranger = TestNode::generate(0x77);

    // B only knows A; the stranger dials B anyway.
    let mut b = start_daemon(fast_config(&node_b, vec![peer_entry(None, node_a.public)])).await;
    let s =
        start_daemon(fast_config(&stranger, vec![peer_entry(Some(b.addr), node_b.public)])).await;

    // Nothing the stranger injects may come out of B's tunnel device.
    let delivered = pump_until_delivered(&s, &mut b, FRAME_FROM_A, Duration::from_secs(2)).await;
    assert!(delivered.is_none(), "unknown peer moved traffic into the tunnel");

    let _ = s.commands.send(Command::Shutdown).await;
    let _ = b.commands.send(Command::Shutdown).await;
}
