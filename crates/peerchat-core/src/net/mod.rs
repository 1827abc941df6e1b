//! Connection management.
//!
//! ```text
//!              ┌──────────── Node task ─────────────┐
//!  accept ───▶ │ admission ─▶ handshake ─▶ Link set │ ◀── NodeCommand (dial, query, shutdown)
//!              │        reconnect sweep             │ ◀── closed LinkIds
//!              └──────────────────┬─────────────────┘
//!                                 │ NodeEvent
//!     Link read tasks ────────────┴──────────────▶ EventRouter
//! ```
//!
//! The Node task is the only owner of the inbound and outbound Link sets.
//! Link read tasks push frames straight onto the event channel and report
//! their own termination back to the Node, which emits the matching
//! disconnect event.

mod link;
mod node;
mod retry;

pub use link::{Direction, Link, LinkId, LinkInfo, LinkState, READ_CHUNK};
pub use node::{DialOutcome, Node, NodeCommand, NodeHandle, RefusalReason};
pub use retry::{policy_from_config, AlwaysRetry, MaxAttempts, ReconnectTarget, RetryPolicy};

use crate::protocol::{Payload, PeerId};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Sender half of the Node event channel.
pub type EventSender = mpsc::UnboundedSender<NodeEvent>;

/// Receiver half of the Node event channel.
pub type EventReceiver = mpsc::UnboundedReceiver<NodeEvent>;

/// Raw events produced by the Node and its Links.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// Listener bound.
    ServerStarted {
        /// Our id.
        local_id: PeerId,
        /// Bound address.
        addr: SocketAddr,
    },
    /// A dialed Link completed its handshake.
    OutboundConnected(Arc<Link>),
    /// A dialed Link went away.
    OutboundDisconnected(Arc<Link>),
    /// An accepted Link completed its handshake.
    InboundConnected(Arc<Link>),
    /// An accepted Link went away.
    InboundDisconnected(Arc<Link>),
    /// A frame arrived on a Link.
    MessageReceived {
        /// Link the frame arrived on.
        link: Arc<Link>,
        /// Classified frame body.
        payload: Payload,
    },
    /// A payload was written to a Link.
    SendSucceeded {
        /// Destination peer.
        peer_id: PeerId,
        /// Payload shape.
        kind: &'static str,
        /// Bytes written, sentinel included.
        bytes: usize,
    },
    /// Shutdown has begun.
    StopRequested {
        /// Our id.
        local_id: PeerId,
    },
}

/// Create a Node event channel.
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
