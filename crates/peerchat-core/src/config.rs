//! Node and session configuration.

use crate::error::{Error, Result};
use crate::protocol::{PeerId, SYSTEM_ID};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default inbound Link cap.
pub const DEFAULT_MAX_INBOUND: usize = 1;

/// Default per-read wait on a Link before looping.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Default wait on `accept` before running a reconnect sweep.
pub const DEFAULT_ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default limit for completing the identity handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default pause between stopping Links and joining them on shutdown.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_millis(500);

/// Default number of log entries shown.
pub const DEFAULT_LOG_WINDOW: usize = 30;

/// Configuration for a [`crate::net::Node`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Address to bind and advertise.
    pub host: String,
    /// Port to bind. `0` picks an ephemeral port.
    pub port: u16,
    /// Id announced in the handshake.
    pub peer_id: String,
    /// Inbound Links accepted before new connections are closed.
    pub max_inbound: usize,
    /// Per-read wait on a Link.
    pub read_timeout: Duration,
    /// Wait on `accept` per loop iteration.
    pub accept_timeout: Duration,
    /// Limit for the identity handshake.
    pub handshake_timeout: Duration,
    /// Pause between stopping Links and joining them.
    pub stop_grace: Duration,
    /// Capacity of the node command channel.
    pub command_buffer: usize,
    /// Automatic reconnection of flagged outbound Links.
    pub reconnect: ReconnectConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            peer_id: random_peer_id(),
            max_inbound: DEFAULT_MAX_INBOUND,
            read_timeout: DEFAULT_READ_TIMEOUT,
            accept_timeout: DEFAULT_ACCEPT_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            stop_grace: DEFAULT_STOP_GRACE,
            command_buffer: 100,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Check the configuration and return the parsed peer id.
    pub fn validate(&self) -> Result<PeerId> {
        if self.host.trim().is_empty() {
            return Err(Error::Config("host must not be empty".into()));
        }
        if self.max_inbound == 0 {
            return Err(Error::Config("max_inbound must be at least 1".into()));
        }
        if self.command_buffer == 0 {
            return Err(Error::Config("command_buffer must be at least 1".into()));
        }
        if self.peer_id == SYSTEM_ID {
            return Err(Error::Config(format!("peer id {SYSTEM_ID:?} is reserved")));
        }
        PeerId::parse(&self.peer_id).map_err(|_| {
            Error::Config(format!("invalid peer id {:?}", self.peer_id))
        })
    }
}

/// Retry behaviour for flagged outbound Links.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Give up on a target after this many failed sweeps. `None` retries forever.
    pub max_attempts: Option<u32>,
}

/// Configuration for a [`crate::session::Session`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Number of newest entries published to the view.
    pub log_window: usize,
    /// Wrap plain outgoing text in a timestamped record.
    pub plain_text_as_record: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            log_window: DEFAULT_LOG_WINDOW,
            plain_text_as_record: true,
        }
    }
}

/// Eight random hex characters.
pub fn random_peer_id() -> String {
    let mut bytes = [0u8; 4];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
