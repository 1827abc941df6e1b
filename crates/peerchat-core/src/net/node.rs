//! Listener, dialer and owner of the Link sets.

use super::link::{Direction, Link, LinkId, LinkInfo};
use super::retry::{policy_from_config, ReconnectTarget, RetryPolicy};
use super::{EventSender, NodeEvent};
use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::protocol::{read_line, write_line, Hello, PeerId, CLOSE_NOTICE};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Result of a dial that did not fail outright.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialOutcome {
    /// New outbound Link registered.
    Connected(PeerId),
    /// An outbound Link to that address already exists.
    AlreadyConnected(PeerId),
    /// The remote answered but we closed the connection.
    Refused(RefusalReason),
}

/// Why a handshaken dial was abandoned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefusalReason {
    /// The remote announced our own id.
    SameId,
    /// That peer already holds an inbound Link from the same host.
    DuplicatePeer(PeerId),
}

/// Requests served by the Node task.
#[derive(Debug)]
pub enum NodeCommand {
    /// Dial `host:port`.
    Connect {
        /// Remote host.
        host: String,
        /// Remote port.
        port: u16,
        /// Keep redialing if the Link drops.
        reconnect: bool,
        /// Dial result.
        reply: oneshot::Sender<Result<DialOutcome>>,
    },
    /// Snapshot every Link.
    Links {
        /// Inbound and outbound snapshots.
        reply: oneshot::Sender<Vec<LinkInfo>>,
    },
    /// Snapshot the reconnect targets.
    ReconnectTargets {
        /// Current targets.
        reply: oneshot::Sender<Vec<ReconnectTarget>>,
    },
    /// Begin shutdown.
    Shutdown,
}

/// Cloneable handle for talking to a running Node.
#[derive(Debug, Clone)]
pub struct NodeHandle {
    tx: mpsc::Sender<NodeCommand>,
    local_id: PeerId,
    local_addr: SocketAddr,
}

impl NodeHandle {
    /// Our id.
    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// Bound listener address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> NodeCommand) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| Error::NodeStopped)?;
        rx.await.map_err(|_| Error::NodeStopped)
    }

    /// Dial a remote node.
    pub async fn connect(&self, host: &str, port: u16, reconnect: bool) -> Result<DialOutcome> {
        let host = host.to_string();
        self.request(|reply| NodeCommand::Connect {
            host,
            port,
            reconnect,
            reply,
        })
        .await?
    }

    /// Snapshot every Link.
    pub async fn links(&self) -> Result<Vec<LinkInfo>> {
        self.request(|reply| NodeCommand::Links { reply }).await
    }

    /// Number of live Links, inbound and outbound.
    pub async fn total_connections(&self) -> Result<usize> {
        Ok(self.links().await?.len())
    }

    /// Snapshot the reconnect targets.
    pub async fn reconnect_targets(&self) -> Result<Vec<ReconnectTarget>> {
        self.request(|reply| NodeCommand::ReconnectTargets { reply })
            .await
    }

    /// Ask the Node to shut down. A Node that already stopped is not an error.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(NodeCommand::Shutdown).await;
    }
}

/// Dial requests waiting on one in-flight handshake to `host:port`.
#[derive(Default)]
struct PendingDial {
    reconnect: bool,
    waiters: Vec<oneshot::Sender<Result<DialOutcome>>>,
}

#[derive(Default)]
struct LinkSets {
    inbound: HashMap<LinkId, Arc<Link>>,
    outbound: HashMap<LinkId, Arc<Link>>,
    targets: Vec<ReconnectTarget>,
    /// Accepted connections still in the handshake.
    handshaking: usize,
    dialing: HashMap<(String, u16), PendingDial>,
}

impl LinkSets {
    fn all(&self) -> impl Iterator<Item = &Arc<Link>> {
        self.inbound.values().chain(self.outbound.values())
    }

    fn outbound_to(&self, host: &str, port: u16) -> Option<&Arc<Link>> {
        self.outbound
            .values()
            .find(|l| l.remote_host() == host && l.remote_port() == port)
    }

    fn inbound_from(&self, peer: &PeerId, host: &str) -> Option<&Arc<Link>> {
        self.inbound
            .values()
            .find(|l| l.peer_id() == peer && l.remote_host() == host)
    }

    fn outbound_peer(&self, peer: &PeerId, host: &str) -> Option<&Arc<Link>> {
        self.outbound
            .values()
            .find(|l| l.peer_id() == peer && l.remote_host() == host)
    }
}

/// A handshake that finished on its own task.
enum Handshake {
    Inbound {
        addr: SocketAddr,
        accepted: Instant,
        result: Result<(TcpStream, Hello, Vec<u8>)>,
    },
    Outbound {
        host: String,
        port: u16,
        started: Instant,
        result: Result<(TcpStream, PeerId, Vec<u8>)>,
    },
}

/// Whether a connection to `target` would land on our own listener.
///
/// Loopback and unspecified addresses all reach a listener bound to either.
pub(crate) fn is_self_addr(target: SocketAddr, local: SocketAddr) -> bool {
    if target.port() != local.port() {
        return false;
    }
    let (target, local) = (target.ip(), local.ip());
    let local_any = local.is_loopback() || local.is_unspecified();
    let target_any = target.is_loopback() || target.is_unspecified();
    target == local || (local_any && target_any)
}

/// Acceptor side of the handshake: read the dialer's line, answer with our id.
async fn accept_handshake(
    mut stream: TcpStream,
    local_id: PeerId,
    limit: Duration,
) -> Result<(TcpStream, Hello, Vec<u8>)> {
    let (line, leftover) = read_line(&mut stream, limit).await?;
    let hello = Hello::parse(&line)?;
    tokio::time::timeout(limit, write_line(&mut stream, local_id.as_str())).await??;
    Ok((stream, hello, leftover))
}

/// Dialer side of the handshake. Names are resolved first so that aliases
/// of our own listener are caught before connecting.
async fn dial_handshake(
    host: String,
    port: u16,
    local_id: PeerId,
    local_addr: SocketAddr,
    limit: Duration,
) -> Result<(TcpStream, PeerId, Vec<u8>)> {
    let addrs: Vec<SocketAddr> =
        tokio::time::timeout(limit, lookup_host((host.as_str(), port))).await??.collect();
    if addrs.iter().any(|addr| is_self_addr(*addr, local_addr)) {
        return Err(Error::SelfConnection);
    }

    let mut stream = tokio::time::timeout(limit, TcpStream::connect(&addrs[..])).await??;
    let hello = Hello::dialer_line(&local_id, local_addr.port());
    tokio::time::timeout(limit, write_line(&mut stream, &hello)).await??;
    let (line, leftover) = read_line(&mut stream, limit).await?;
    let remote = Hello::parse(&line)?.peer_id;
    Ok((stream, remote, leftover))
}

/// Send the close notice on a connection we will not keep, then close it.
fn refuse(mut stream: TcpStream, limit: Duration) {
    tokio::spawn(async move {
        let _ = tokio::time::timeout(limit, write_line(&mut stream, CLOSE_NOTICE)).await;
        let _ = stream.shutdown().await;
    });
}

/// A listening peer.
///
/// The Node owns the listener and both Link sets. All mutation happens on
/// the task running [`Node::run`]: accepted connections, [`NodeCommand`]s,
/// finished handshakes and Link termination notices are served from one
/// `select!` loop. Handshake I/O runs on short-lived tasks so a slow or
/// silent remote never stalls that loop.
pub struct Node {
    config: NodeConfig,
    local_id: PeerId,
    local_addr: SocketAddr,
    listener: TcpListener,
    events: EventSender,
    retry: Arc<dyn RetryPolicy>,
    cmd_tx: mpsc::Sender<NodeCommand>,
    cmd_rx: mpsc::Receiver<NodeCommand>,
    closed_tx: mpsc::UnboundedSender<LinkId>,
    closed_rx: mpsc::UnboundedReceiver<LinkId>,
}

impl Node {
    /// Bind the listener and emit `ServerStarted`.
    pub async fn bind(config: NodeConfig, events: EventSender) -> Result<Self> {
        let local_id = config.validate()?;

        let addr: SocketAddr = format!("{}:{}", config.host, config.port)
            .parse()
            .map_err(|e| Error::Config(format!("invalid listen address: {e}")))?;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(128)?;
        let local_addr = listener.local_addr()?;

        info!(id = %local_id, address = %local_addr, "node listening");
        let _ = events.send(NodeEvent::ServerStarted {
            local_id: local_id.clone(),
            addr: local_addr,
        });

        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_buffer);
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        let retry = policy_from_config(&config.reconnect);

        Ok(Self {
            config,
            local_id,
            local_addr,
            listener,
            events,
            retry,
            cmd_tx,
            cmd_rx,
            closed_tx,
            closed_rx,
        })
    }

    /// Replace the retry policy chosen from the configuration.
    pub fn with_retry_policy(mut self, policy: impl RetryPolicy + 'static) -> Self {
        self.retry = Arc::new(policy);
        self
    }

    /// Our id.
    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// Bound listener address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// A handle for sending commands once the Node runs.
    pub fn handle(&self) -> NodeHandle {
        NodeHandle {
            tx: self.cmd_tx.clone(),
            local_id: self.local_id.clone(),
            local_addr: self.local_addr,
        }
    }

    /// Run the Node on its own task.
    pub fn spawn(self) -> (NodeHandle, JoinHandle<Result<()>>) {
        let handle = self.handle();
        (handle, tokio::spawn(self.run()))
    }

    /// Accept, dial and reconnect until shutdown.
    ///
    /// Returns `Err` only for a fatal accept failure; Links are stopped
    /// either way.
    pub async fn run(self) -> Result<()> {
        let Node {
            config,
            local_id,
            local_addr,
            listener,
            events,
            retry,
            cmd_tx,
            mut cmd_rx,
            closed_tx,
            mut closed_rx,
        } = self;
        // Dropping our sender lets the loop see when every handle is gone.
        drop(cmd_tx);

        let (handshake_tx, mut handshake_rx) = mpsc::unbounded_channel();
        let mut core = NodeCore {
            config,
            local_id,
            local_addr,
            events,
            retry,
            closed_tx,
            handshake_tx,
            sets: LinkSets::default(),
        };

        let result = loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(NodeCommand::Shutdown) => {
                        info!(id = %core.local_id, "node stop requested");
                        break Ok(());
                    }
                    None => {
                        debug!(id = %core.local_id, "all node handles dropped");
                        break Ok(());
                    }
                    Some(cmd) => core.handle_command(cmd),
                },
                Some(id) = closed_rx.recv() => core.link_closed(id),
                Some(done) = handshake_rx.recv() => core.handshake_done(done).await,
                accepted = tokio::time::timeout(core.config.accept_timeout, listener.accept()) => {
                    match accepted {
                        Ok(Ok((stream, addr))) => core.admit(stream, addr),
                        Ok(Err(e)) => {
                            error!(error = %e, "accept failed");
                            break Err(Error::from(e));
                        }
                        Err(_) => trace!("accept timed out"),
                    }
                    core.reconnect_sweep();
                }
            }
        };

        core.shutdown(closed_rx).await;
        drop(listener);
        info!(id = %core.local_id, "node stopped");
        result
    }
}

struct NodeCore {
    config: NodeConfig,
    local_id: PeerId,
    local_addr: SocketAddr,
    events: EventSender,
    retry: Arc<dyn RetryPolicy>,
    closed_tx: mpsc::UnboundedSender<LinkId>,
    handshake_tx: mpsc::UnboundedSender<Handshake>,
    sets: LinkSets,
}

impl NodeCore {
    fn handle_command(&mut self, cmd: NodeCommand) {
        match cmd {
            NodeCommand::Connect {
                host,
                port,
                reconnect,
                reply,
            } => self.dial(host, port, reconnect, Some(reply)),
            NodeCommand::Links { reply } => {
                let _ = reply.send(self.sets.all().map(|l| l.info()).collect());
            }
            NodeCommand::ReconnectTargets { reply } => {
                let _ = reply.send(self.sets.targets.clone());
            }
            NodeCommand::Shutdown => {}
        }
    }

    fn new_link(
        &self,
        stream: TcpStream,
        peer_id: PeerId,
        host: String,
        port: u16,
        direction: Direction,
        leftover: Vec<u8>,
    ) -> Arc<Link> {
        Link::new(
            stream,
            peer_id,
            host,
            port,
            direction,
            leftover,
            self.config.read_timeout,
            self.events.clone(),
            self.closed_tx.clone(),
        )
    }

    /// Admission control, then the acceptor handshake on its own task.
    ///
    /// Connections still in the handshake count against `max_inbound`.
    fn admit(&mut self, stream: TcpStream, addr: SocketAddr) {
        if self.sets.inbound.len() + self.sets.handshaking >= self.config.max_inbound {
            debug!(address = %addr, limit = self.config.max_inbound, "inbound limit reached, closing");
            drop(stream);
            return;
        }

        self.sets.handshaking += 1;
        let accepted = Instant::now();
        let local_id = self.local_id.clone();
        let limit = self.config.handshake_timeout;
        let done = self.handshake_tx.clone();
        tokio::spawn(async move {
            let result = accept_handshake(stream, local_id, limit).await;
            let _ = done.send(Handshake::Inbound {
                addr,
                accepted,
                result,
            });
        });
    }

    /// Cheap check for literal addresses; names are resolved by the dial task.
    fn is_self(&self, host: &str, port: u16) -> bool {
        if port != self.local_addr.port() {
            return false;
        }
        host == self.config.host
            || host
                .parse::<IpAddr>()
                .is_ok_and(|ip| is_self_addr(SocketAddr::new(ip, port), self.local_addr))
    }

    /// Start a dial, or join one already in flight to the same address.
    fn dial(
        &mut self,
        host: String,
        port: u16,
        reconnect: bool,
        reply: Option<oneshot::Sender<Result<DialOutcome>>>,
    ) {
        if self.is_self(&host, port) {
            warn!(host = %host, port, "refusing to connect to self");
            if let Some(reply) = reply {
                let _ = reply.send(Err(Error::SelfConnection));
            }
            return;
        }
        if let Some(link) = self.sets.outbound_to(&host, port) {
            debug!(peer = %link.peer_id(), host = %host, port, "already connected");
            if let Some(reply) = reply {
                let _ = reply.send(Ok(DialOutcome::AlreadyConnected(link.peer_id().clone())));
            }
            return;
        }

        let key = (host.clone(), port);
        if let Some(pending) = self.sets.dialing.get_mut(&key) {
            debug!(host = %host, port, "dial already in progress");
            pending.reconnect |= reconnect;
            pending.waiters.extend(reply);
            return;
        }
        self.sets.dialing.insert(
            key,
            PendingDial {
                reconnect,
                waiters: reply.into_iter().collect(),
            },
        );

        debug!(host = %host, port, "connecting");
        let started = Instant::now();
        let local_id = self.local_id.clone();
        let local_addr = self.local_addr;
        let limit = self.config.handshake_timeout;
        let done = self.handshake_tx.clone();
        tokio::spawn(async move {
            let result = dial_handshake(host.clone(), port, local_id, local_addr, limit).await;
            let _ = done.send(Handshake::Outbound {
                host,
                port,
                started,
                result,
            });
        });
    }

    async fn handshake_done(&mut self, done: Handshake) {
        match done {
            Handshake::Inbound {
                addr,
                accepted,
                result,
            } => {
                self.sets.handshaking = self.sets.handshaking.saturating_sub(1);
                match result {
                    Ok((stream, hello, leftover)) => {
                        self.inbound_ready(stream, addr, accepted, hello, leftover)
                            .await
                    }
                    Err(e) => warn!(address = %addr, error = %e, "inbound handshake failed"),
                }
            }
            Handshake::Outbound {
                host,
                port,
                started,
                result,
            } => {
                let pending = self
                    .sets
                    .dialing
                    .remove(&(host.clone(), port))
                    .unwrap_or_default();
                let outcome = match result {
                    Ok((stream, remote, leftover)) => {
                        let reconnect = pending.reconnect;
                        self.outbound_ready(stream, &host, port, started, remote, leftover, reconnect)
                            .await
                    }
                    Err(e) => {
                        debug!(host = %host, port, error = %e, "dial failed");
                        Err(e)
                    }
                };
                for waiter in pending.waiters {
                    let _ = waiter.send(outcome.clone());
                }
            }
        }
    }

    /// Register an accepted connection.
    ///
    /// When both sides dialed each other at once, each node keeps the
    /// connection opened by the lower id so exactly one pair survives.
    async fn inbound_ready(
        &mut self,
        stream: TcpStream,
        addr: SocketAddr,
        accepted: Instant,
        hello: Hello,
        leftover: Vec<u8>,
    ) {
        let host = addr.ip().to_string();
        if let Some(ours) = self.sets.outbound_peer(&hello.peer_id, &host).cloned() {
            if ours.established_at() >= accepted {
                if self.local_id < hello.peer_id {
                    info!(peer = %hello.peer_id, "crossed dial, keeping our outbound link");
                    drop(stream);
                    return;
                }
                info!(peer = %hello.peer_id, "crossed dial, keeping their link");
                ours.stop();
            }
        }

        let port = hello.port.unwrap_or(addr.port());
        let link = self.new_link(
            stream,
            hello.peer_id,
            host,
            port,
            Direction::Inbound,
            leftover,
        );
        info!(peer = %link.peer_id(), address = %addr, "inbound link established");
        self.sets.inbound.insert(link.id(), Arc::clone(&link));
        let _ = self.events.send(NodeEvent::InboundConnected(Arc::clone(&link)));
        link.start().await;
    }

    /// Checks that need the Link sets, then registration of a dialed stream.
    #[allow(clippy::too_many_arguments)]
    async fn outbound_ready(
        &mut self,
        stream: TcpStream,
        host: &str,
        port: u16,
        started: Instant,
        remote: PeerId,
        leftover: Vec<u8>,
        reconnect: bool,
    ) -> Result<DialOutcome> {
        let limit = self.config.handshake_timeout;
        if remote == self.local_id {
            warn!(host, port, "remote announced our own id");
            refuse(stream, limit);
            return Ok(DialOutcome::Refused(RefusalReason::SameId));
        }
        if let Some(theirs) = self.sets.inbound_from(&remote, host).cloned() {
            let crossed = theirs.established_at() >= started;
            if !crossed || self.local_id > remote {
                info!(peer = %remote, host, "peer already connected to us");
                refuse(stream, limit);
                return Ok(DialOutcome::Refused(RefusalReason::DuplicatePeer(remote)));
            }
            info!(peer = %remote, "crossed dial, keeping our outbound link");
            theirs.stop();
        }

        let link = self.new_link(
            stream,
            remote.clone(),
            host.to_string(),
            port,
            Direction::Outbound,
            leftover,
        );
        info!(peer = %remote, host, port, "outbound link established");
        self.sets.outbound.insert(link.id(), Arc::clone(&link));
        let _ = self.events.send(NodeEvent::OutboundConnected(Arc::clone(&link)));
        link.start().await;

        if reconnect && !self.sets.targets.iter().any(|t| t.matches(host, port)) {
            debug!(host, port, "reconnection enabled");
            self.sets.targets.push(ReconnectTarget::new(host, port));
        }
        Ok(DialOutcome::Connected(remote))
    }

    fn link_closed(&mut self, id: LinkId) {
        if let Some(link) = self.sets.inbound.remove(&id) {
            info!(peer = %link.peer_id(), "inbound link closed");
            let _ = self.events.send(NodeEvent::InboundDisconnected(link));
        } else if let Some(link) = self.sets.outbound.remove(&id) {
            info!(peer = %link.peer_id(), "outbound link closed");
            let _ = self.events.send(NodeEvent::OutboundDisconnected(link));
        }
    }

    fn reconnect_sweep(&mut self) {
        let targets = std::mem::take(&mut self.sets.targets);
        let mut kept = Vec::with_capacity(targets.len());

        for mut target in targets {
            if self.sets.outbound_to(&target.host, target.port).is_some() {
                target.tries = 0;
                kept.push(target);
                continue;
            }
            if self
                .sets
                .dialing
                .contains_key(&(target.host.clone(), target.port))
            {
                kept.push(target);
                continue;
            }

            target.tries += 1;
            if !self.retry.should_retry(&target.host, target.port, target.tries) {
                info!(host = %target.host, port = target.port, tries = target.tries, "giving up on reconnection");
                continue;
            }

            debug!(host = %target.host, port = target.port, tries = target.tries, "reconnecting");
            self.dial(target.host.clone(), target.port, false, None);
            kept.push(target);
        }

        self.sets.targets = kept;
    }

    async fn shutdown(&mut self, mut closed_rx: mpsc::UnboundedReceiver<LinkId>) {
        let _ = self.events.send(NodeEvent::StopRequested {
            local_id: self.local_id.clone(),
        });

        for (_, pending) in self.sets.dialing.drain() {
            for waiter in pending.waiters {
                let _ = waiter.send(Err(Error::NodeStopped));
            }
        }

        let links: Vec<Arc<Link>> = self.sets.all().cloned().collect();
        for link in &links {
            link.stop();
        }
        tokio::time::sleep(self.config.stop_grace).await;
        for link in &links {
            link.join().await;
        }

        while let Ok(id) = closed_rx.try_recv() {
            self.link_closed(id);
        }
        self.sets.targets.clear();
    }
}
