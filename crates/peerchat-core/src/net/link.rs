//! A single framed stream connection.

use super::{EventSender, NodeEvent};
use crate::error::{Error, Result};
use crate::logging::RedactedBytes;
use crate::protocol::{encode_frame, FrameReader, Payload, PeerId, CLOSE_NOTICE};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Bytes requested per socket read.
pub const READ_CHUNK: usize = 4096;

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique Link identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(u64);

impl LinkId {
    fn next() -> Self {
        Self(NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Accepted by our listener.
    Inbound,
    /// Dialed by us.
    Outbound,
}

/// Link lifecycle. `Disconnected` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LinkState {
    /// Handshake done, read task not yet running.
    Connecting = 0,
    /// Reading and writing.
    Active = 1,
    /// Closed; sends fail.
    Disconnected = 2,
}

impl LinkState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => LinkState::Connecting,
            1 => LinkState::Active,
            _ => LinkState::Disconnected,
        }
    }
}

/// Snapshot of a Link for queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    /// Link id.
    pub id: LinkId,
    /// Remote peer id.
    pub peer_id: PeerId,
    /// Remote host.
    pub host: String,
    /// Remote listening port (inbound: as advertised in the handshake).
    pub port: u16,
    /// Inbound or outbound.
    pub direction: Direction,
    /// Current state.
    pub state: LinkState,
    /// Frames received so far.
    pub frames_received: u64,
}

struct ReadSide {
    reader: OwnedReadHalf,
    frames: FrameReader,
    closed_tx: mpsc::UnboundedSender<LinkId>,
}

/// One stream connection to a remote peer.
///
/// Created by the Node after a successful handshake. The read half runs on
/// its own task once [`Link::start`] is called; [`Link::send`] may be called
/// from any task.
pub struct Link {
    id: LinkId,
    peer_id: PeerId,
    host: String,
    port: u16,
    direction: Direction,
    established: Instant,
    state: AtomicU8,
    frames_received: AtomicU64,
    read_timeout: Duration,
    writer: Mutex<Option<OwnedWriteHalf>>,
    read_side: std::sync::Mutex<Option<ReadSide>>,
    task: Mutex<Option<JoinHandle<()>>>,
    stop_tx: watch::Sender<bool>,
    events: EventSender,
}

impl Link {
    /// Wrap a handshaken stream.
    ///
    /// `leftover` holds bytes that arrived together with the handshake line.
    /// `closed_tx` receives this Link's id once its read task has ended.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stream: TcpStream,
        peer_id: PeerId,
        host: String,
        port: u16,
        direction: Direction,
        leftover: Vec<u8>,
        read_timeout: Duration,
        events: EventSender,
        closed_tx: mpsc::UnboundedSender<LinkId>,
    ) -> Arc<Self> {
        let (reader, writer) = stream.into_split();
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            id: LinkId::next(),
            peer_id,
            host,
            port,
            direction,
            established: Instant::now(),
            state: AtomicU8::new(LinkState::Connecting as u8),
            frames_received: AtomicU64::new(0),
            read_timeout,
            writer: Mutex::new(Some(writer)),
            read_side: std::sync::Mutex::new(Some(ReadSide {
                reader,
                frames: FrameReader::with_leftover(leftover),
                closed_tx,
            })),
            task: Mutex::new(None),
            stop_tx,
            events,
        })
    }

    /// Link id.
    pub fn id(&self) -> LinkId {
        self.id
    }

    /// Remote peer id.
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Remote host.
    pub fn remote_host(&self) -> &str {
        &self.host
    }

    /// Remote listening port.
    pub fn remote_port(&self) -> u16 {
        self.port
    }

    /// Inbound or outbound.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// When the handshake finished and the Link was created.
    pub fn established_at(&self) -> Instant {
        self.established
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LinkState {
        LinkState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Frames received so far.
    pub fn frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }

    /// Snapshot for queries.
    pub fn info(&self) -> LinkInfo {
        LinkInfo {
            id: self.id,
            peer_id: self.peer_id.clone(),
            host: self.host.clone(),
            port: self.port,
            direction: self.direction,
            state: self.state(),
            frames_received: self.frames_received(),
        }
    }

    fn set_state(&self, state: LinkState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Spawn the read task. Calling it twice is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let side = match self.read_side.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(side) = side else {
            return;
        };

        if self.state() == LinkState::Connecting {
            self.set_state(LinkState::Active);
        }
        let stop_rx = self.stop_tx.subscribe();
        let handle = tokio::spawn(Arc::clone(self).read_loop(side, stop_rx));
        *self.task.lock().await = Some(handle);
    }

    /// Ask the read task to end. The Node is notified once it has.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Wait for the read task to finish.
    pub async fn join(&self) {
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(link = %self.id, error = %e, "link task panicked");
            }
        }
    }

    /// Send one payload as a single frame.
    ///
    /// A write failure stops the Link; the caller gets the error and the
    /// Node later emits the disconnect.
    pub async fn send(&self, payload: &Payload) -> Result<()> {
        if self.state() == LinkState::Disconnected {
            return Err(Error::LinkClosed);
        }
        let frame = encode_frame(&payload.to_wire()?)?;

        let written = {
            let mut guard = self.writer.lock().await;
            let writer = guard.as_mut().ok_or(Error::LinkClosed)?;
            match writer.write_all(&frame).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            }
        };

        match written {
            Ok(()) => {
                trace!(peer = %self.peer_id, kind = payload.kind(), size = %RedactedBytes(&frame), "frame sent");
                let _ = self.events.send(NodeEvent::SendSucceeded {
                    peer_id: self.peer_id.clone(),
                    kind: payload.kind(),
                    bytes: frame.len(),
                });
                Ok(())
            }
            Err(e) => {
                warn!(peer = %self.peer_id, error = %e, "send failed, closing link");
                self.stop();
                Err(e.into())
            }
        }
    }

    /// Emit every buffered frame. Returns `false` when the remote asked us
    /// to close.
    ///
    /// The close notice only counts as the first frame after the handshake;
    /// later on the same bytes are an ordinary text message.
    fn dispatch(self: &Arc<Self>, frames: &mut FrameReader) -> Result<bool> {
        while let Some(frame) = frames.next_frame()? {
            if self.frames_received() == 0 && frame == CLOSE_NOTICE.as_bytes() {
                info!(peer = %self.peer_id, "remote closed duplicate connection");
                return Ok(false);
            }
            self.frames_received.fetch_add(1, Ordering::Relaxed);
            let payload = Payload::decode(frame);
            trace!(peer = %self.peer_id, kind = payload.kind(), "frame received");
            let _ = self.events.send(NodeEvent::MessageReceived {
                link: Arc::clone(self),
                payload,
            });
        }
        Ok(true)
    }

    async fn read_loop(self: Arc<Self>, side: ReadSide, mut stop_rx: watch::Receiver<bool>) {
        let ReadSide {
            mut reader,
            mut frames,
            closed_tx,
        } = side;
        let mut buf = vec![0u8; READ_CHUNK];

        debug!(peer = %self.peer_id, link = %self.id, direction = ?self.direction, "link started");

        loop {
            match self.dispatch(&mut frames) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    warn!(peer = %self.peer_id, error = %e, "framing violation, closing link");
                    break;
                }
            }
            if *stop_rx.borrow() {
                break;
            }

            tokio::select! {
                _ = stop_rx.changed() => {
                    debug!(peer = %self.peer_id, "link stop requested");
                    break;
                }
                read = tokio::time::timeout(self.read_timeout, reader.read(&mut buf)) => match read {
                    Err(_) => {
                        trace!(peer = %self.peer_id, "read timeout");
                    }
                    Ok(Ok(0)) => {
                        debug!(peer = %self.peer_id, "connection closed by remote");
                        break;
                    }
                    Ok(Ok(n)) => frames.push(&buf[..n]),
                    Ok(Err(e)) => {
                        debug!(peer = %self.peer_id, error = %e, "read failed");
                        break;
                    }
                }
            }
        }

        self.set_state(LinkState::Disconnected);
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        debug!(peer = %self.peer_id, link = %self.id, "link ended");
        let _ = closed_tx.send(self.id);
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("id", &self.id)
            .field("peer_id", &self.peer_id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("direction", &self.direction)
            .field("state", &self.state())
            .finish()
    }
}
