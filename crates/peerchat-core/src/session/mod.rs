//! Chat session: the consumer of routed events.
//!
//! The Session tracks the single active peer, runs encryption negotiation,
//! turns inbound payloads into log entries and encodes outgoing user text.
//! It runs as one task fed by two channels:
//!
//! ```text
//! EventRouter ──RoutedEvent──▶ ┌─────────┐ ──watch──▶ view (log window)
//! front end ──SessionCommand─▶ │ Session │ ──NodeHandle / LinkRegistry──▶ network
//!                              └─────────┘
//! ```

mod log;
mod negotiation;

pub use log::{sort_batch, Message, MessageLog};
pub use negotiation::{
    DiscardReason, InboundBytes, LocalEncryptionState, Negotiator, PeerEncryptionRecord,
};

use crate::config::{NodeConfig, SessionConfig};
use crate::crypto::CipherRegistry;
use crate::error::Result;
use crate::logging::{preview, RedactedBytes};
use crate::net::{event_channel, DialOutcome, EventReceiver, Node, NodeHandle};
use crate::protocol::{Payload, PeerId, RecordContent, SENTINEL};
use crate::router::{EventBody, EventKind, EventRouter, LinkRegistry, RoutedEvent};
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Requests from the front end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    /// Log and send a line of user text.
    SendText(String),
    /// Dial a peer with reconnection enabled.
    Connect {
        /// Remote host.
        host: String,
        /// Remote port.
        port: u16,
    },
    /// Enable a cipher by id.
    EnableCipher(String),
    /// Clear the log.
    ResetLog,
    /// Stop the Node and end the Session once its events drain.
    Shutdown,
}

/// How a dial started by [`Session::connect`] ended.
#[derive(Debug)]
struct DialReport {
    host: String,
    port: u16,
    result: Result<DialOutcome>,
}

/// One chat session bound to a running Node.
#[derive(Debug)]
pub struct Session {
    local_id: PeerId,
    node: NodeHandle,
    links: LinkRegistry,
    negotiator: Negotiator,
    log: MessageLog,
    config: SessionConfig,
    peer: Option<PeerId>,
    live_links: HashMap<PeerId, usize>,
    online: bool,
    stopping: bool,
    discarded: u64,
    dials_tx: mpsc::UnboundedSender<DialReport>,
    dials_rx: Option<mpsc::UnboundedReceiver<DialReport>>,
}

impl Session {
    /// Build a session over a Node handle and the router's registry.
    pub fn new(
        node: NodeHandle,
        links: LinkRegistry,
        ciphers: CipherRegistry,
        config: SessionConfig,
    ) -> Self {
        let (dials_tx, dials_rx) = mpsc::unbounded_channel();
        Self {
            local_id: node.local_id().clone(),
            node,
            links,
            negotiator: Negotiator::new(ciphers),
            log: MessageLog::new(),
            config,
            peer: None,
            live_links: HashMap::new(),
            online: false,
            stopping: false,
            discarded: 0,
            dials_tx,
            dials_rx: Some(dials_rx),
        }
    }

    /// Our id.
    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// The active peer, if any.
    pub fn peer(&self) -> Option<&PeerId> {
        self.peer.as_ref()
    }

    /// Whether the Node reported that it is listening.
    pub fn is_online(&self) -> bool {
        self.online
    }

    /// Inbound payloads dropped as unrecognized.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Negotiation state.
    pub fn negotiator(&self) -> &Negotiator {
        &self.negotiator
    }

    /// Flush staged messages and return the full log.
    pub fn messages(&mut self) -> &[Message] {
        self.log.flush();
        self.log.entries()
    }

    /// Flush staged messages and return the visible window.
    pub fn window(&mut self) -> Vec<Message> {
        self.log.flush();
        self.log.window(self.config.log_window).to_vec()
    }

    /// Mutable access to the log, for front ends that edit it.
    pub fn log_mut(&mut self) -> &mut MessageLog {
        &mut self.log
    }

    fn notice(&mut self, text: impl Into<String>) {
        self.log.stage(Message::notice(text));
    }

    /// Enable local encryption with a fresh keypair.
    pub fn enable_encryption(&mut self, cipher_id: &str) -> Result<()> {
        self.negotiator.enable(cipher_id)?;
        info!(cipher = cipher_id, "encryption enabled");
        self.notice(format!("encryption enabled: {cipher_id}"));
        Ok(())
    }

    /// Log a line of user text and send it to the active peer.
    ///
    /// The text is always logged. It is sent only while online with a peer.
    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        let text: String = text.chars().filter(|&c| c != char::from(SENTINEL)).collect();
        let now = Utc::now();
        self.log
            .stage(Message::new(self.local_id.clone(), now, text.clone()));

        let Some(peer) = self.peer.clone() else {
            debug!("no peer, message kept locally");
            return Ok(());
        };
        if !self.online {
            return Ok(());
        }

        let payloads =
            self.negotiator
                .outgoing(&peer, &text, now, self.config.plain_text_as_record)?;
        for payload in &payloads {
            match self.links.send_to(&peer, payload).await {
                Ok(()) => {}
                Err(e) if e.should_silent_drop() => {
                    warn!(peer = %peer, kind = payload.kind(), error = %e, "payload dropped");
                }
                Err(e) => return Err(e),
            }
        }
        debug!(peer = %peer, frames = payloads.len(), text = %preview(&text), "message sent");
        Ok(())
    }

    /// Start dialing a peer with reconnection enabled.
    ///
    /// Returns `false` without dialing while a peer is active. The dial runs
    /// on its own task; [`Session::run`] logs how it ended.
    pub fn connect(&mut self, host: &str, port: u16) -> bool {
        if let Some(peer) = &self.peer {
            let text = format!("already have peer {peer}");
            self.notice(text);
            return false;
        }
        self.notice(format!("connecting to {host}:{port}"));

        let node = self.node.clone();
        let reports = self.dials_tx.clone();
        let host = host.to_string();
        tokio::spawn(async move {
            let result = node.connect(&host, port, true).await;
            let _ = reports.send(DialReport { host, port, result });
        });
        true
    }

    fn dial_finished(&mut self, report: DialReport) {
        let DialReport { host, port, result } = report;
        match result {
            Ok(DialOutcome::Refused(reason)) => {
                self.notice(format!("connection refused: {reason:?}"));
            }
            Ok(outcome) => debug!(host = %host, port, ?outcome, "dial finished"),
            Err(e) => {
                warn!(host = %host, port, error = %e, "connect failed");
                self.notice(format!("connect failed: {e}"));
            }
        }
    }

    /// Apply one front-end command. Returns `false` once the Session should
    /// stop taking commands.
    pub async fn handle_command(&mut self, command: SessionCommand) -> bool {
        match command {
            SessionCommand::SendText(text) => {
                if let Err(e) = self.send_text(&text).await {
                    warn!(error = %e, "send failed");
                    self.notice(format!("send failed: {e}"));
                }
            }
            SessionCommand::Connect { host, port } => {
                self.connect(&host, port);
            }
            SessionCommand::EnableCipher(id) => {
                if let Err(e) = self.enable_encryption(&id) {
                    self.notice(format!("cannot enable encryption: {e}"));
                }
            }
            SessionCommand::ResetLog => {
                self.log.flush();
                self.log.reset();
            }
            SessionCommand::Shutdown => {
                self.notice("closing...");
                self.node.shutdown().await;
                self.stopping = true;
                return false;
            }
        }
        true
    }

    /// Apply one routed event.
    pub fn handle_event(&mut self, event: RoutedEvent) {
        let RoutedEvent {
            kind,
            source,
            dest,
            body,
        } = event;

        match (kind, body) {
            (EventKind::MessageReceived, EventBody::Payload(payload)) => {
                self.on_payload(source, payload);
            }
            (kind, EventBody::Notice(text)) => {
                match kind {
                    EventKind::ServerStarted => self.online = true,
                    EventKind::StopRequested => self.online = false,
                    EventKind::OutboundConnected => self.peer_connected(dest),
                    EventKind::InboundConnected => self.peer_connected(source),
                    EventKind::OutboundDisconnected => self.peer_disconnected(&dest),
                    EventKind::InboundDisconnected => self.peer_disconnected(&source),
                    EventKind::MessageReceived => {}
                }
                self.notice(text);
            }
            (kind, EventBody::Payload(payload)) => {
                warn!(kind = %kind, payload = payload.kind(), "payload on a lifecycle event");
            }
        }
    }

    fn peer_connected(&mut self, peer: PeerId) {
        *self.live_links.entry(peer.clone()).or_default() += 1;
        if let Some(old) = &self.peer {
            if old != &peer {
                debug!(old = %old, new = %peer, "replacing active peer");
            }
        }
        self.negotiator.reset_key_sent();
        self.peer = Some(peer);
    }

    fn peer_disconnected(&mut self, peer: &PeerId) {
        if let Some(count) = self.live_links.get_mut(peer) {
            *count = count.saturating_sub(1);
            if *count > 0 {
                return;
            }
            self.live_links.remove(peer);
        }
        if self.peer.as_ref() == Some(peer) {
            self.peer = None;
        }
    }

    fn on_payload(&mut self, source: PeerId, payload: Payload) {
        match payload {
            Payload::Text(text) => {
                self.log.stage(Message::new(source, Utc::now(), text));
            }
            Payload::Record(record) => match record.content {
                RecordContent::Text(text) => {
                    self.log.stage(Message::new(source, record.timestamp, text));
                }
                RecordContent::Bytes(bytes) => self.on_bytes(source, &bytes),
            },
            Payload::Bytes(bytes) => self.on_bytes(source, &bytes),
        }
    }

    fn on_bytes(&mut self, source: PeerId, bytes: &[u8]) {
        match self.negotiator.inbound_bytes(&source, bytes) {
            InboundBytes::Plaintext(text) => {
                self.log.stage(Message::new(source, Utc::now(), text));
            }
            InboundBytes::KeyStored { cipher } => {
                info!(peer = %source, cipher, "stored peer key");
                self.notice(format!("received {cipher} key from {source}"));
            }
            InboundBytes::Discarded(reason) => {
                self.discarded += 1;
                warn!(peer = %source, reason = %reason, size = %RedactedBytes(bytes), "discarding unrecognized payload");
            }
        }
    }

    /// Serve events, commands and dial results, publishing the log window
    /// after each one.
    ///
    /// After a shutdown command the Session keeps applying events until the
    /// router closes the event stream, then returns itself.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<RoutedEvent>,
        mut commands: mpsc::Receiver<SessionCommand>,
        view: watch::Sender<Vec<Message>>,
    ) -> Self {
        info!(id = %self.local_id, "session started");
        view.send_replace(self.window());
        let Some(mut dials) = self.dials_rx.take() else {
            warn!("session already ran");
            return self;
        };

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        debug!("event stream closed");
                        break;
                    }
                },
                Some(report) = dials.recv() => self.dial_finished(report),
                command = commands.recv(), if !self.stopping => match command {
                    Some(command) => {
                        self.handle_command(command).await;
                    }
                    None => {
                        debug!("command stream closed, shutting down");
                        self.handle_command(SessionCommand::Shutdown).await;
                    }
                },
            }
            view.send_replace(self.window());
        }

        info!(id = %self.local_id, "session ended");
        self
    }
}

/// Everything a front end needs to drive a running peer.
#[derive(Debug)]
pub struct ChatHandle {
    /// Send commands here.
    pub commands: mpsc::Sender<SessionCommand>,
    /// Latest log window.
    pub view: watch::Receiver<Vec<Message>>,
    /// Direct Node access.
    pub node: NodeHandle,
    /// Shared Link registry.
    pub links: LinkRegistry,
    /// Node task.
    pub node_task: JoinHandle<Result<()>>,
    /// Router task.
    pub router_task: JoinHandle<()>,
    /// Session task; yields the final Session.
    pub session_task: JoinHandle<Session>,
}

/// Bind a Node and start the Node, router and Session tasks.
pub async fn launch(
    node_config: NodeConfig,
    session_config: SessionConfig,
    ciphers: CipherRegistry,
) -> Result<ChatHandle> {
    let (events_tx, events_rx) = event_channel();
    let node = Node::bind(node_config, events_tx).await?;
    Ok(launch_with(node, events_rx, session_config, ciphers))
}

/// Start the tasks for an already bound Node.
pub fn launch_with(
    node: Node,
    events: EventReceiver,
    session_config: SessionConfig,
    ciphers: CipherRegistry,
) -> ChatHandle {
    let router = EventRouter::new(node.local_id().clone());
    let links = router.registry();
    let (routed_tx, routed_rx) = mpsc::unbounded_channel();
    let (command_tx, command_rx) = mpsc::channel(64);

    let (node, node_task) = node.spawn();
    let router_task = tokio::spawn(router.run(events, routed_tx));

    let session = Session::new(node.clone(), links.clone(), ciphers, session_config);
    let (view_tx, view_rx) = watch::channel(Vec::new());
    let session_task = tokio::spawn(session.run(routed_rx, command_rx, view_tx));

    ChatHandle {
        commands: command_tx,
        view: view_rx,
        node,
        links,
        node_task,
        router_task,
        session_task,
    }
}
