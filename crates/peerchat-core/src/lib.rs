//! # PeerChat Core Library
//!
//! A peer-to-peer text messaging node. Peers talk over plain TCP streams
//! carrying sentinel-terminated frames, identify each other with a one-line
//! handshake, and negotiate per-peer encryption in-band.
//!
//! ## Guarantees
//!
//! - At most one outbound Link per remote address
//! - At most one registered Link per peer id
//! - Malformed or unrecognized payloads are dropped, never fatal
//! - Text sent to a peer whose key is known is always encrypted
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │               session                   │
//! ├─────────────────────────────────────────┤
//! │      router       │       crypto        │
//! ├─────────────────────────────────────────┤
//! │          net (Node, Link)               │
//! ├─────────────────────────────────────────┤
//! │        protocol (frames, wire)          │
//! └─────────────────────────────────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, clippy::all)]
#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod crypto;
pub mod error;
pub mod logging;
pub mod net;
pub mod protocol;
pub mod router;
pub mod session;

pub use config::{NodeConfig, ReconnectConfig, SessionConfig};
pub use error::{Error, Result};
pub use net::{DialOutcome, Node, NodeEvent, NodeHandle};
pub use protocol::{Payload, PeerId};
pub use router::{EventRouter, LinkRegistry, RoutedEvent};
pub use session::{launch, ChatHandle, Message, Session, SessionCommand};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
