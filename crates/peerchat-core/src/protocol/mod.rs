//! Wire protocol for PeerChat.
//!
//! A raw byte stream carrying sentinel-terminated frames. There is no length
//! prefix and no version byte; the receiver splits on the sentinel and then
//! classifies each body by shape.
//!
//! ## Frame Structure
//!
//! ```text
//! ┌───────────────────────────────┬──────────┐
//! │           Payload             │   0x04   │
//! │  (text | JSON record | bytes) │ (1 byte) │
//! └───────────────────────────────┴──────────┘
//! ```
//!
//! Key and ciphertext packets end in an 8-byte cipher marker; see
//! [`crate::crypto`].

mod frame;
mod handshake;
mod payload;
mod types;

pub use frame::{encode_frame, extract_frames, FrameReader, MAX_FRAME_SIZE, SENTINEL};
pub use handshake::{read_line, write_line, Hello, CLOSE_NOTICE};
pub use payload::{Payload, Record, RecordContent};
pub use types::{PeerId, MAX_PEER_ID_LEN, SYSTEM_ID};
