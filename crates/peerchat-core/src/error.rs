//! Error types for PeerChat.
//!
//! Display messages stay generic; the attached detail string is meant for
//! debug logs, not for the remote side.

use thiserror::Error;

/// Core error type for PeerChat operations.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Underlying socket or stream failure.
    #[error("i/o error: {0}")]
    Io(String),

    /// Framing or payload violation on the wire.
    /// Malformed payloads are dropped, the Link keeps running.
    #[error("protocol error")]
    Protocol(String),

    /// Identity handshake failed or was malformed.
    #[error("handshake failed")]
    Handshake(String),

    /// Attempted to dial our own listening address.
    #[error("refusing to connect to self")]
    SelfConnection,

    /// No registered Link for the requested peer.
    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    /// The Link is no longer able to carry data.
    #[error("link closed")]
    LinkClosed,

    /// Cryptographic operation failed.
    /// Details are intentionally vague to prevent oracle attacks.
    #[error("cryptographic operation failed")]
    Crypto(String),

    /// Key material could not be parsed or validated.
    #[error("invalid key material")]
    InvalidKey(String),

    /// Cipher id not present in the registry.
    #[error("unknown cipher: {0}")]
    UnknownCipher(String),

    /// Encoding/decoding error.
    #[error("encoding error")]
    Encoding(String),

    /// Rejected configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// The Node task has stopped and no longer accepts commands.
    #[error("node stopped")]
    NodeStopped,
}

/// Result type alias using PeerChat's Error.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Errors that discard a single payload instead of failing the component
    /// that produced them.
    pub fn should_silent_drop(&self) -> bool {
        matches!(
            self,
            Error::Protocol(_) | Error::Crypto(_) | Error::InvalidKey(_) | Error::Encoding(_)
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::TimedOut {
            Error::Timeout
        } else {
            Error::Io(e.to_string())
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Encoding(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout
    }
}
