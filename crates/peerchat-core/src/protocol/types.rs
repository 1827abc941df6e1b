//! Peer identifiers.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Longest accepted peer id, in bytes.
pub const MAX_PEER_ID_LEN: usize = 32;

/// Pseudo-id used as the source of node-originated notices.
pub const SYSTEM_ID: &str = "sys";

/// Opaque short identifier a node announces during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Parse and validate a peer id.
    ///
    /// Ids travel inside the `id:port` handshake line, so they may not
    /// contain `:`, whitespace or the frame sentinel.
    pub fn parse(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(Error::Handshake("empty peer id".into()));
        }
        if s.len() > MAX_PEER_ID_LEN {
            return Err(Error::Handshake(format!("peer id longer than {MAX_PEER_ID_LEN} bytes")));
        }
        if s
            .chars()
            .any(|c| c == ':' || c.is_whitespace() || c.is_control())
        {
            return Err(Error::Handshake(format!("invalid character in peer id {s:?}")));
        }
        Ok(Self(s.to_string()))
    }

    /// The `sys` pseudo-peer.
    pub fn system() -> Self {
        Self(SYSTEM_ID.to_string())
    }

    /// Whether this is the `sys` pseudo-peer.
    pub fn is_system(&self) -> bool {
        self.0 == SYSTEM_ID
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PeerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
