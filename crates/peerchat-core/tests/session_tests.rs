//! End-to-end chat sessions: two full stacks (Node, router, Session) talking
//! over loopback.

use peerchat_core::crypto::CipherRegistry;
use peerchat_core::protocol::encode_frame;
use peerchat_core::session::{sort_batch, MessageLog};
use peerchat_core::{
    launch, ChatHandle, Message, NodeConfig, PeerId, Session, SessionCommand, SessionConfig,
};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;

const WAIT: Duration = Duration::from_secs(5);

fn node_config(id: &str) -> NodeConfig {
    NodeConfig {
        peer_id: id.to_string(),
        accept_timeout: Duration::from_millis(50),
        handshake_timeout: Duration::from_secs(2),
        read_timeout: Duration::from_millis(200),
        stop_grace: Duration::from_millis(20),
        ..NodeConfig::default()
    }
}

async fn start(id: &str) -> ChatHandle {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("peerchat_core=debug")
        .with_test_writer()
        .try_init();
    launch(
        node_config(id),
        SessionConfig::default(),
        CipherRegistry::default(),
    )
    .await
    .expect("launch")
}

async fn wait_for_view<F>(view: &mut watch::Receiver<Vec<Message>>, pred: F)
where
    F: Fn(&Message) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            if view.borrow_and_update().iter().any(&pred) {
                return;
            }
            view.changed().await.expect("session still running");
        }
    })
    .await
    .expect("timed out waiting for log entry");
}

fn from(message: &Message, source: &str, body: &str) -> bool {
    message.source.as_str() == source && message.body == body
}

fn notice_containing(message: &Message, needle: &str) -> bool {
    message.source.is_system() && message.body.contains(needle)
}

async fn stop(handle: ChatHandle) -> Session {
    handle
        .commands
        .send(SessionCommand::Shutdown)
        .await
        .expect("send shutdown");
    let session = tokio::time::timeout(WAIT, handle.session_task)
        .await
        .expect("session ended in time")
        .expect("session task joined");
    handle
        .node_task
        .await
        .expect("node task joined")
        .expect("node stopped cleanly");
    session
}

async fn connect(a: &mut ChatHandle, b: &mut ChatHandle) {
    let port = b.node.local_addr().port();
    a.commands
        .send(SessionCommand::Connect {
            host: "127.0.0.1".into(),
            port,
        })
        .await
        .expect("send connect");
    wait_for_view(&mut b.view, |m| notice_containing(m, "connected by")).await;
    wait_for_view(&mut a.view, |m| notice_containing(m, "connected to")).await;
}

/// Alice enables `eg` and talks first: her key travels with her first
/// message, so Bob's reply is encrypted and Alice decrypts it.
#[tokio::test]
async fn test_encryption_negotiation() {
    let mut alice = start("alice").await;
    let mut bob = start("bob").await;
    connect(&mut alice, &mut bob).await;

    alice
        .commands
        .send(SessionCommand::EnableCipher("eg".into()))
        .await
        .expect("enable");
    alice
        .commands
        .send(SessionCommand::SendText("hi".into()))
        .await
        .expect("send");

    wait_for_view(&mut bob.view, |m| notice_containing(m, "received eg key from alice")).await;
    wait_for_view(&mut bob.view, |m| from(m, "alice", "hi")).await;

    bob.commands
        .send(SessionCommand::SendText("yo".into()))
        .await
        .expect("send");
    wait_for_view(&mut alice.view, |m| from(m, "bob", "yo")).await;

    let alice = stop(alice).await;
    let bob = stop(bob).await;

    assert!(alice.negotiator().local().enabled());
    assert!(alice.negotiator().local().has_sent_own_key());
    assert_eq!(alice.discarded(), 0);

    let alice_id = PeerId::parse("alice").expect("id");
    let record = bob.negotiator().peer_record(&alice_id).expect("alice's key");
    assert_eq!(record.cipher_kind(), "eg");
    assert!(!bob.negotiator().local().enabled());
    assert_eq!(bob.discarded(), 0);
}

/// Without encryption both sides see each other's lines, and their own.
#[tokio::test]
async fn test_plain_exchange() {
    let mut alice = start("alice").await;
    let mut bob = start("bob").await;
    connect(&mut alice, &mut bob).await;

    alice
        .commands
        .send(SessionCommand::SendText("ping".into()))
        .await
        .expect("send");
    wait_for_view(&mut bob.view, |m| from(m, "alice", "ping")).await;

    bob.commands
        .send(SessionCommand::SendText("pong".into()))
        .await
        .expect("send");
    wait_for_view(&mut alice.view, |m| from(m, "bob", "pong")).await;
    wait_for_view(&mut alice.view, |m| from(m, "alice", "ping")).await;

    let mut alice = stop(alice).await;
    stop(bob).await;

    let bodies: Vec<&str> = alice
        .messages()
        .iter()
        .filter(|m| !m.source.is_system())
        .map(|m| m.body.as_str())
        .collect();
    assert_eq!(bodies, vec!["ping", "pong"]);
}

/// A second connect while a peer is active is refused locally.
#[tokio::test]
async fn test_single_active_peer() {
    let mut alice = start("alice").await;
    let mut bob = start("bob").await;
    let mut carol = start("carol").await;
    connect(&mut alice, &mut bob).await;

    alice
        .commands
        .send(SessionCommand::Connect {
            host: "127.0.0.1".into(),
            port: carol.node.local_addr().port(),
        })
        .await
        .expect("send connect");
    wait_for_view(&mut alice.view, |m| notice_containing(m, "already have peer bob")).await;

    assert_eq!(alice.node.total_connections().await.expect("links"), 1);
    assert!(carol.view.borrow_and_update().iter().all(|m| !m.body.contains("connected by")));

    let alice = stop(alice).await;
    assert_eq!(alice.peer(), None);
    stop(bob).await;
    stop(carol).await;
}

/// A dial to a listener that never answers does not hold up typed text;
/// the failure shows up in the log once the handshake times out.
#[tokio::test]
async fn test_session_responsive_during_dial() {
    let mut alice = start("alice").await;
    let mute = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let port = mute.local_addr().expect("addr").port();

    alice
        .commands
        .send(SessionCommand::Connect {
            host: "127.0.0.1".into(),
            port,
        })
        .await
        .expect("send connect");
    alice
        .commands
        .send(SessionCommand::SendText("meanwhile".into()))
        .await
        .expect("send");

    tokio::time::timeout(
        Duration::from_millis(1000),
        wait_for_view(&mut alice.view, |m| from(m, "alice", "meanwhile")),
    )
    .await
    .expect("text logged while the dial is pending");
    wait_for_view(&mut alice.view, |m| notice_containing(m, "connect failed")).await;

    drop(mute);
    let alice = stop(alice).await;
    assert_eq!(alice.peer(), None);
}

/// Bytes that carry no cipher marker are counted and dropped; the Link and
/// the Session keep going.
#[tokio::test]
async fn test_unrecognized_payload_discarded() {
    let mut bob = start("bob").await;

    let mut raw = TcpStream::connect(("127.0.0.1", bob.node.local_addr().port()))
        .await
        .expect("connect");
    raw.write_all(&encode_frame(b"raw:40000").expect("encode"))
        .await
        .expect("hello");
    let mut reply = [0u8; 4];
    raw.read_exact(&mut reply).await.expect("reply");
    assert_eq!(&reply, b"bob\x04");

    let mut wire = encode_frame(&[0xFF, 0x00, 0x9F, 0x92]).expect("encode");
    wire.extend(encode_frame(b"after").expect("encode"));
    raw.write_all(&wire).await.expect("write");

    wait_for_view(&mut bob.view, |m| from(m, "raw", "after")).await;

    let bob = stop(bob).await;
    assert_eq!(bob.discarded(), 1);
}

/// Text typed before any peer connects is logged but not sent.
#[tokio::test]
async fn test_text_without_peer_stays_local() {
    let mut alice = start("alice").await;
    alice
        .commands
        .send(SessionCommand::SendText("anyone?".into()))
        .await
        .expect("send");
    wait_for_view(&mut alice.view, |m| from(m, "alice", "anyone?")).await;

    let alice = stop(alice).await;
    assert_eq!(alice.peer(), None);
    assert!(alice.negotiator().peer_record(&PeerId::parse("bob").expect("id")).is_none());
}

/// Sorting an already sorted batch changes nothing.
#[test]
fn test_sort_is_idempotent() {
    let base = chrono::Utc::now();
    let id = PeerId::parse("alice").expect("id");
    let mut batch: Vec<Message> = [3i64, 1, 2, 1]
        .iter()
        .enumerate()
        .map(|(i, secs)| {
            Message::new(
                id.clone(),
                base + chrono::Duration::seconds(*secs),
                format!("m{i}"),
            )
        })
        .collect();

    sort_batch(&mut batch);
    let once = batch.clone();
    sort_batch(&mut batch);
    assert_eq!(batch, once);

    let bodies: Vec<&str> = batch.iter().map(|m| m.body.as_str()).collect();
    assert_eq!(bodies, vec!["m1", "m3", "m2", "m0"]);

    let mut log = MessageLog::new();
    for message in once {
        log.stage(message);
    }
    log.flush();
    assert_eq!(log.len(), 4);
    assert_eq!(log.pop(1)[0].body, "m0");
}
