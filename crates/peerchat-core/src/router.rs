//! Event normalisation and the peer id -> Link registry.
//!
//! Every [`NodeEvent`] becomes a [`RoutedEvent`] with an explicit source and
//! destination:
//!
//! | event                | source | dest   |
//! |----------------------|--------|--------|
//! | server started/stop  | `sys`  | self   |
//! | outbound (dis)conn   | self   | remote |
//! | inbound (dis)conn    | remote | self   |
//! | message received     | remote | self   |
//!
//! Send confirmations are logged here and not forwarded.

use crate::error::{Error, Result};
use crate::net::{EventReceiver, Link, NodeEvent};
use crate::protocol::{Payload, PeerId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

/// Kinds of routed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Listener bound.
    ServerStarted,
    /// We dialed a peer.
    OutboundConnected,
    /// A dialed Link went away.
    OutboundDisconnected,
    /// A peer dialed us.
    InboundConnected,
    /// An accepted Link went away.
    InboundDisconnected,
    /// A frame arrived.
    MessageReceived,
    /// The Node is shutting down.
    StopRequested,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::ServerStarted => "server_started",
            EventKind::OutboundConnected => "outbound_connected",
            EventKind::OutboundDisconnected => "outbound_disconnected",
            EventKind::InboundConnected => "inbound_connected",
            EventKind::InboundDisconnected => "inbound_disconnected",
            EventKind::MessageReceived => "message_received",
            EventKind::StopRequested => "stop_requested",
        };
        f.write_str(name)
    }
}

/// Body of a routed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventBody {
    /// Human-readable lifecycle notice.
    Notice(String),
    /// Classified frame body.
    Payload(Payload),
}

/// Uniform `(kind, source, dest, body)` envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedEvent {
    /// What happened.
    pub kind: EventKind,
    /// Originator.
    pub source: PeerId,
    /// Recipient.
    pub dest: PeerId,
    /// Notice or payload.
    pub body: EventBody,
}

/// Shared peer id -> Link map.
///
/// Written by the router task; read by anyone holding a clone. A peer briefly
/// holding two Links (a refused duplicate, or a reconnect racing the old
/// Link's disconnect) resolves to the newest one still registered.
#[derive(Clone, Default)]
pub struct LinkRegistry {
    links: Arc<RwLock<HashMap<PeerId, Vec<Arc<Link>>>>>,
}

impl LinkRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    async fn insert(&self, link: Arc<Link>) {
        let mut links = self.links.write().await;
        let entry = links.entry(link.peer_id().clone()).or_default();
        if !entry.is_empty() {
            debug!(peer = %link.peer_id(), link = %link.id(), "peer already registered, newest link wins");
        }
        entry.push(link);
    }

    /// Remove `link` by id. Other Links for the same peer stay registered.
    async fn remove(&self, link: &Link) -> bool {
        let mut links = self.links.write().await;
        let Some(entry) = links.get_mut(link.peer_id()) else {
            return false;
        };
        let before = entry.len();
        entry.retain(|l| l.id() != link.id());
        let removed = entry.len() != before;
        if entry.is_empty() {
            links.remove(link.peer_id());
        }
        removed
    }

    /// Link registered for a peer.
    pub async fn get(&self, peer: &PeerId) -> Option<Arc<Link>> {
        self.links
            .read()
            .await
            .get(peer)
            .and_then(|entry| entry.last())
            .cloned()
    }

    /// Whether a Link is registered for a peer.
    pub async fn contains(&self, peer: &PeerId) -> bool {
        self.links.read().await.contains_key(peer)
    }

    /// Registered peer ids, sorted.
    pub async fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.links.read().await.keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Number of registered peers.
    pub async fn len(&self) -> usize {
        self.links.read().await.len()
    }

    /// Whether no Link is registered.
    pub async fn is_empty(&self) -> bool {
        self.links.read().await.is_empty()
    }

    /// Send a payload to one peer.
    pub async fn send_to(&self, peer: &PeerId, payload: &Payload) -> Result<()> {
        let link = self
            .get(peer)
            .await
            .ok_or_else(|| Error::UnknownPeer(peer.to_string()))?;
        link.send(payload).await
    }

    /// Send a payload to every registered peer. Returns how many sends succeeded.
    pub async fn broadcast(&self, payload: &Payload) -> usize {
        let links: Vec<Arc<Link>> = self
            .links
            .read()
            .await
            .values()
            .filter_map(|entry| entry.last().cloned())
            .collect();
        let mut sent = 0;
        for link in links {
            match link.send(payload).await {
                Ok(()) => sent += 1,
                Err(e) => debug!(peer = %link.peer_id(), error = %e, "broadcast send failed"),
            }
        }
        sent
    }
}

impl fmt::Debug for LinkRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkRegistry").finish_non_exhaustive()
    }
}

/// Turns Node events into routed events.
#[derive(Debug, Clone)]
pub struct EventRouter {
    local_id: PeerId,
    registry: LinkRegistry,
}

impl EventRouter {
    /// Router for the node `local_id`.
    pub fn new(local_id: PeerId) -> Self {
        Self {
            local_id,
            registry: LinkRegistry::new(),
        }
    }

    /// Shared registry maintained by this router.
    pub fn registry(&self) -> LinkRegistry {
        self.registry.clone()
    }

    /// Route one event, updating the registry. `None` for events that are
    /// not escalated.
    pub async fn route(&self, event: NodeEvent) -> Option<RoutedEvent> {
        let me = self.local_id.clone();
        let routed = match event {
            NodeEvent::ServerStarted { local_id, addr } => RoutedEvent {
                kind: EventKind::ServerStarted,
                source: PeerId::system(),
                dest: me,
                body: EventBody::Notice(format!("server started: {local_id} @{addr}")),
            },
            NodeEvent::OutboundConnected(link) => {
                self.registry.insert(Arc::clone(&link)).await;
                RoutedEvent {
                    kind: EventKind::OutboundConnected,
                    body: notice("connected to", &link),
                    source: me,
                    dest: link.peer_id().clone(),
                }
            }
            NodeEvent::OutboundDisconnected(link) => {
                self.registry.remove(&link).await;
                RoutedEvent {
                    kind: EventKind::OutboundDisconnected,
                    body: notice("disconnected from", &link),
                    source: me,
                    dest: link.peer_id().clone(),
                }
            }
            NodeEvent::InboundConnected(link) => {
                self.registry.insert(Arc::clone(&link)).await;
                RoutedEvent {
                    kind: EventKind::InboundConnected,
                    body: notice("connected by", &link),
                    source: link.peer_id().clone(),
                    dest: me,
                }
            }
            NodeEvent::InboundDisconnected(link) => {
                self.registry.remove(&link).await;
                RoutedEvent {
                    kind: EventKind::InboundDisconnected,
                    body: notice("disconnected by", &link),
                    source: link.peer_id().clone(),
                    dest: me,
                }
            }
            NodeEvent::MessageReceived { link, payload } => RoutedEvent {
                kind: EventKind::MessageReceived,
                source: link.peer_id().clone(),
                dest: me,
                body: EventBody::Payload(payload),
            },
            NodeEvent::SendSucceeded {
                peer_id,
                kind,
                bytes,
            } => {
                debug!(peer = %peer_id, kind, bytes, "send succeeded");
                return None;
            }
            NodeEvent::StopRequested { local_id } => RoutedEvent {
                kind: EventKind::StopRequested,
                source: PeerId::system(),
                dest: me,
                body: EventBody::Notice(format!("node {local_id} is stopping")),
            },
        };

        if let EventBody::Notice(text) = &routed.body {
            info!(kind = %routed.kind, notice = %text, "node event");
        }
        Some(routed)
    }

    /// Route events until the Node side of the channel closes or the
    /// consumer goes away.
    pub async fn run(self, mut events: EventReceiver, out: mpsc::UnboundedSender<RoutedEvent>) {
        debug!(id = %self.local_id, "event router started");
        while let Some(event) = events.recv().await {
            if let Some(routed) = self.route(event).await {
                if out.send(routed).is_err() {
                    debug!("routed event consumer gone");
                    break;
                }
            }
        }
        debug!(id = %self.local_id, "event router stopped");
    }
}

fn notice(verb: &str, link: &Link) -> EventBody {
    EventBody::Notice(format!(
        "{verb} {} @{}:{}",
        link.peer_id(),
        link.remote_host(),
        link.remote_port()
    ))
}
