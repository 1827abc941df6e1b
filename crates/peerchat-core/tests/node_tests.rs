//! Node integration tests over loopback TCP.
//!
//! Each test binds real listeners on ephemeral ports with short accept
//! timeouts so reconnect sweeps run quickly.

use peerchat_core::net::{
    event_channel, DialOutcome, EventReceiver, Link, MaxAttempts, Node, NodeEvent, NodeHandle,
    RefusalReason,
};
use peerchat_core::protocol::{encode_frame, Payload, CLOSE_NOTICE};
use peerchat_core::{Error, NodeConfig, PeerId, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("peerchat_core=debug")
        .with_test_writer()
        .try_init();
}

fn peer(id: &str) -> PeerId {
    PeerId::parse(id).expect("valid peer id")
}

fn config(id: &str) -> NodeConfig {
    NodeConfig {
        peer_id: id.to_string(),
        accept_timeout: Duration::from_millis(50),
        handshake_timeout: Duration::from_secs(2),
        read_timeout: Duration::from_millis(200),
        stop_grace: Duration::from_millis(20),
        ..NodeConfig::default()
    }
}

struct TestNode {
    handle: NodeHandle,
    task: JoinHandle<Result<()>>,
    events: EventReceiver,
}

impl TestNode {
    async fn start(config: NodeConfig) -> Self {
        init_tracing();
        let (tx, events) = event_channel();
        let node = Node::bind(config, tx).await.expect("bind node");
        let (handle, task) = node.spawn();
        Self {
            handle,
            task,
            events,
        }
    }

    fn port(&self) -> u16 {
        self.handle.local_addr().port()
    }

    async fn next_matching<F>(&mut self, mut pred: F) -> NodeEvent
    where
        F: FnMut(&NodeEvent) -> bool,
    {
        tokio::time::timeout(WAIT, async {
            loop {
                let event = self.events.recv().await.expect("event channel open");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    async fn outbound_link(&mut self) -> Arc<Link> {
        match self
            .next_matching(|e| matches!(e, NodeEvent::OutboundConnected(_)))
            .await
        {
            NodeEvent::OutboundConnected(link) => link,
            _ => unreachable!(),
        }
    }

    async fn inbound_link(&mut self) -> Arc<Link> {
        match self
            .next_matching(|e| matches!(e, NodeEvent::InboundConnected(_)))
            .await
        {
            NodeEvent::InboundConnected(link) => link,
            _ => unreachable!(),
        }
    }

    async fn stop(self) {
        self.handle.shutdown().await;
        self.task
            .await
            .expect("node task joined")
            .expect("node stopped cleanly");
    }
}

/// Dialing registers an outbound Link on one side and an inbound Link on
/// the other, and frames flow across.
#[tokio::test]
async fn test_dial_and_exchange() {
    let mut alice = TestNode::start(config("alice")).await;
    let mut bob = TestNode::start(config("bob")).await;

    let outcome = alice
        .handle
        .connect("127.0.0.1", bob.port(), false)
        .await
        .expect("dial");
    assert_eq!(outcome, DialOutcome::Connected(peer("bob")));

    let out_link = alice.outbound_link().await;
    let in_link = bob.inbound_link().await;
    assert_eq!(out_link.peer_id().as_str(), "bob");
    assert_eq!(in_link.peer_id().as_str(), "alice");
    // The acceptor records the dialer's advertised listening port.
    assert_eq!(in_link.remote_port(), alice.port());

    out_link
        .send(&Payload::Text("hello bob".into()))
        .await
        .expect("send");
    let event = bob
        .next_matching(|e| matches!(e, NodeEvent::MessageReceived { .. }))
        .await;
    match event {
        NodeEvent::MessageReceived { link, payload } => {
            assert_eq!(link.peer_id().as_str(), "alice");
            assert_eq!(payload, Payload::Text("hello bob".into()));
        }
        _ => unreachable!(),
    }

    assert_eq!(alice.handle.total_connections().await.expect("links"), 1);
    assert_eq!(bob.handle.total_connections().await.expect("links"), 1);

    alice.stop().await;
    bob.stop().await;
}

/// With an inbound cap of 1 a second dialer is closed before the handshake
/// and the first Link keeps working.
#[tokio::test]
async fn test_admission_cap() {
    let mut bob = TestNode::start(config("bob")).await;
    let alice = TestNode::start(config("alice")).await;
    let carol = TestNode::start(config("carol")).await;

    alice
        .handle
        .connect("127.0.0.1", bob.port(), false)
        .await
        .expect("first dial");
    let first = bob.inbound_link().await;

    let second = carol.handle.connect("127.0.0.1", bob.port(), false).await;
    assert!(second.is_err(), "second inbound must be rejected: {second:?}");
    assert!(carol.handle.links().await.expect("links").is_empty());

    let links = bob.handle.links().await.expect("links");
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].peer_id.as_str(), "alice");
    assert_eq!(links[0].id, first.id());

    first
        .send(&Payload::Text("still here".into()))
        .await
        .expect("first link still active");

    alice.stop().await;
    bob.stop().await;
    carol.stop().await;
}

/// Dialing our own address fails and creates nothing, whether it is given
/// as the bound address, the wildcard address or a name.
#[tokio::test]
async fn test_self_connection_rejected() {
    let alice = TestNode::start(config("alice")).await;

    for host in ["127.0.0.1", "0.0.0.0", "localhost"] {
        let result = alice.handle.connect(host, alice.port(), true).await;
        assert!(matches!(result, Err(Error::SelfConnection)), "{host}: {result:?}");
    }
    assert!(alice.handle.links().await.expect("links").is_empty());
    assert!(alice
        .handle
        .reconnect_targets()
        .await
        .expect("targets")
        .is_empty());

    alice.stop().await;
}

/// A second dial to the same address is an idempotent success.
#[tokio::test]
async fn test_dial_is_idempotent() {
    let alice = TestNode::start(config("alice")).await;
    let bob = TestNode::start(config("bob")).await;

    alice
        .handle
        .connect("127.0.0.1", bob.port(), true)
        .await
        .expect("dial");
    let again = alice
        .handle
        .connect("127.0.0.1", bob.port(), true)
        .await
        .expect("dial again");
    assert_eq!(again, DialOutcome::AlreadyConnected(peer("bob")));
    assert_eq!(alice.handle.total_connections().await.expect("links"), 1);
    assert_eq!(
        alice.handle.reconnect_targets().await.expect("targets").len(),
        1
    );

    alice.stop().await;
    bob.stop().await;
}

/// Dialing back a peer that already holds an inbound Link to us is refused
/// and the remote tears down its half.
#[tokio::test]
async fn test_duplicate_peer_refused() {
    let mut alice = TestNode::start(config("alice")).await;
    let bob = TestNode::start(config("bob")).await;

    alice
        .handle
        .connect("127.0.0.1", bob.port(), false)
        .await
        .expect("dial");

    let outcome = bob
        .handle
        .connect("127.0.0.1", alice.port(), false)
        .await
        .expect("dial back");
    assert_eq!(
        outcome,
        DialOutcome::Refused(RefusalReason::DuplicatePeer(peer("alice")))
    );

    // Alice accepted bob's dial, then saw the close notice.
    let event = alice
        .next_matching(|e| matches!(e, NodeEvent::InboundDisconnected(_)))
        .await;
    match event {
        NodeEvent::InboundDisconnected(link) => assert_eq!(link.peer_id().as_str(), "bob"),
        _ => unreachable!(),
    }
    assert_eq!(bob.handle.total_connections().await.expect("links"), 1);

    alice.stop().await;
    bob.stop().await;
}

/// A remote announcing our own id is refused.
#[tokio::test]
async fn test_same_id_refused() {
    let first = TestNode::start(config("twin")).await;
    let second = TestNode::start(config("twin")).await;

    let outcome = first
        .handle
        .connect("127.0.0.1", second.port(), true)
        .await
        .expect("dial");
    assert_eq!(outcome, DialOutcome::Refused(RefusalReason::SameId));
    assert!(first.handle.links().await.expect("links").is_empty());
    assert!(first
        .handle
        .reconnect_targets()
        .await
        .expect("targets")
        .is_empty());

    first.stop().await;
    second.stop().await;
}

/// A flagged outbound Link that drops is redialed by the next sweep.
#[tokio::test]
async fn test_reconnects_dropped_link() {
    let mut alice = TestNode::start(config("alice")).await;
    let bob = TestNode::start(NodeConfig {
        max_inbound: 4,
        ..config("bob")
    })
    .await;

    alice
        .handle
        .connect("127.0.0.1", bob.port(), true)
        .await
        .expect("dial");
    let first = alice.outbound_link().await;

    first.stop();
    alice
        .next_matching(|e| matches!(e, NodeEvent::OutboundDisconnected(_)))
        .await;

    let second = alice.outbound_link().await;
    assert_ne!(first.id(), second.id());
    assert_eq!(second.peer_id().as_str(), "bob");

    let targets = alice.handle.reconnect_targets().await.expect("targets");
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].port, bob.port());

    alice.stop().await;
    bob.stop().await;
}

/// A retry policy that says no removes the target for good.
#[tokio::test]
async fn test_retry_policy_gives_up() {
    init_tracing();
    let (tx, mut events) = event_channel();
    let node = Node::bind(config("alice"), tx)
        .await
        .expect("bind")
        .with_retry_policy(MaxAttempts(2));
    let (alice, alice_task) = node.spawn();
    let bob = TestNode::start(config("bob")).await;

    alice
        .connect("127.0.0.1", bob.port(), true)
        .await
        .expect("dial");
    bob.stop().await;

    tokio::time::timeout(WAIT, async {
        loop {
            if let Some(NodeEvent::OutboundDisconnected(_)) = events.recv().await {
                break;
            }
        }
    })
    .await
    .expect("disconnect seen");

    tokio::time::timeout(WAIT, async {
        while !alice
            .reconnect_targets()
            .await
            .expect("targets")
            .is_empty()
        {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("target dropped");

    alice.shutdown().await;
    alice_task.await.expect("join").expect("clean stop");
}

/// Shutdown announces itself first, then reports every Link as closed.
#[tokio::test]
async fn test_shutdown_order() {
    let mut alice = TestNode::start(config("alice")).await;
    let bob = TestNode::start(config("bob")).await;

    bob.handle
        .connect("127.0.0.1", alice.port(), false)
        .await
        .expect("dial");
    alice.inbound_link().await;

    alice.handle.shutdown().await;
    alice
        .next_matching(|e| matches!(e, NodeEvent::StopRequested { .. }))
        .await;
    let event = alice
        .next_matching(|e| matches!(e, NodeEvent::InboundDisconnected(_)))
        .await;
    match event {
        NodeEvent::InboundDisconnected(link) => {
            assert_eq!(link.peer_id().as_str(), "bob");
        }
        _ => unreachable!(),
    }
    alice
        .task
        .await
        .expect("node task joined")
        .expect("clean stop");

    bob.stop().await;
}

/// Bytes sent right after the handshake line are delivered as frames, and
/// a dialer that announces no port is recorded with its socket port.
#[tokio::test]
async fn test_raw_client_handshake() {
    let mut bob = TestNode::start(config("bob")).await;

    let mut raw = TcpStream::connect(("127.0.0.1", bob.port()))
        .await
        .expect("connect");
    let local_port = raw.local_addr().expect("addr").port();

    let mut wire = encode_frame(b"raw").expect("encode");
    wire.extend(encode_frame(b"early bird").expect("encode"));
    raw.write_all(&wire).await.expect("write");

    let mut reply = [0u8; 4];
    raw.read_exact(&mut reply).await.expect("reply");
    assert_eq!(&reply, b"bob\x04");

    let link = bob.inbound_link().await;
    assert_eq!(link.peer_id().as_str(), "raw");
    assert_eq!(link.remote_port(), local_port);

    match bob
        .next_matching(|e| matches!(e, NodeEvent::MessageReceived { .. }))
        .await
    {
        NodeEvent::MessageReceived { payload, .. } => {
            assert_eq!(payload, Payload::Text("early bird".into()));
        }
        _ => unreachable!(),
    }

    // Past the first frame the close notice is plain text.
    raw.write_all(&encode_frame(CLOSE_NOTICE.as_bytes()).expect("encode"))
        .await
        .expect("write");
    match bob
        .next_matching(|e| matches!(e, NodeEvent::MessageReceived { .. }))
        .await
    {
        NodeEvent::MessageReceived { payload, .. } => {
            assert_eq!(payload, Payload::Text(CLOSE_NOTICE.into()));
        }
        _ => unreachable!(),
    }

    drop(raw);
    bob.next_matching(|e| matches!(e, NodeEvent::InboundDisconnected(_)))
        .await;

    bob.stop().await;
}

/// Two nodes dialing each other at the same moment both get an answer and
/// settle on a single connection.
#[tokio::test]
async fn test_mutual_dial_settles_on_one_link() {
    let alice = TestNode::start(config("alice")).await;
    let bob = TestNode::start(config("bob")).await;

    let (from_alice, from_bob) = tokio::join!(
        alice.handle.connect("127.0.0.1", bob.port(), false),
        bob.handle.connect("127.0.0.1", alice.port(), false),
    );
    from_alice.expect("alice's dial answered");
    from_bob.expect("bob's dial answered");

    let settled = tokio::time::timeout(WAIT, async {
        loop {
            let mut a = alice.handle.links().await.expect("links");
            let mut b = bob.handle.links().await.expect("links");
            if a.len() == 1 && b.len() == 1 {
                return (a.remove(0), b.remove(0));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("one link on each side");

    let (a, b) = settled;
    assert_eq!(a.peer_id.as_str(), "bob");
    assert_eq!(b.peer_id.as_str(), "alice");
    assert_ne!(a.direction, b.direction);

    alice.stop().await;
    bob.stop().await;
}

/// A client that connects and never sends its hello does not hold up
/// commands or other dialers while its handshake times out.
#[tokio::test]
async fn test_silent_client_does_not_stall_node() {
    let alice = TestNode::start(NodeConfig {
        max_inbound: 2,
        ..config("alice")
    })
    .await;
    let bob = TestNode::start(config("bob")).await;

    let mut silent = TcpStream::connect(("127.0.0.1", alice.port()))
        .await
        .expect("connect");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let links = tokio::time::timeout(
        Duration::from_millis(500),
        alice.handle.total_connections(),
    )
    .await
    .expect("node answers while a handshake is pending")
    .expect("links");
    assert_eq!(links, 0);

    let outcome = tokio::time::timeout(
        Duration::from_millis(500),
        bob.handle.connect("127.0.0.1", alice.port(), false),
    )
    .await
    .expect("dial finishes before the silent handshake expires")
    .expect("dial");
    assert_eq!(outcome, DialOutcome::Connected(peer("alice")));

    // Once the handshake timeout passes the silent client is dropped.
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(WAIT, silent.read(&mut buf))
        .await
        .expect("silent client closed");
    assert!(matches!(read, Ok(0) | Err(_)));
    assert_eq!(alice.handle.total_connections().await.expect("links"), 1);

    alice.stop().await;
    bob.stop().await;
}

/// Concurrent dials to one address share a single handshake.
#[tokio::test]
async fn test_concurrent_dials_share_handshake() {
    let alice = TestNode::start(config("alice")).await;
    let bob = TestNode::start(config("bob")).await;

    let (first, second) = tokio::join!(
        alice.handle.connect("127.0.0.1", bob.port(), true),
        alice.handle.connect("127.0.0.1", bob.port(), false),
    );
    let outcomes = [first.expect("first"), second.expect("second")];
    assert!(outcomes
        .iter()
        .any(|o| *o == DialOutcome::Connected(peer("bob"))));
    assert!(outcomes.iter().all(|o| matches!(
        o,
        DialOutcome::Connected(_) | DialOutcome::AlreadyConnected(_)
    )));

    assert_eq!(alice.handle.total_connections().await.expect("links"), 1);
    assert_eq!(
        alice.handle.reconnect_targets().await.expect("targets").len(),
        1
    );

    alice.stop().await;
    bob.stop().await;
}
