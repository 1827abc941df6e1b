//! Sentinel-delimited framing.
//!
//! Every frame on the wire is `payload || SENTINEL`. There is no length
//! prefix, so a payload may never contain the sentinel byte itself.

use crate::error::{Error, Result};

/// Frame terminator (ASCII EOT).
pub const SENTINEL: u8 = 0x04;

/// Largest sentinel-free run the reader will buffer (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Append the sentinel to a payload.
///
/// Fails if the payload already contains the sentinel, since the receiver
/// would split it into two frames. Empty payloads are rejected too: readers
/// skip empty frames, so one would never arrive.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.is_empty() {
        return Err(Error::Protocol("empty payload".into()));
    }
    if payload.contains(&SENTINEL) {
        return Err(Error::Protocol("payload contains frame sentinel".into()));
    }
    if payload.len() > MAX_FRAME_SIZE {
        return Err(Error::Protocol("payload too large".into()));
    }
    let mut bytes = Vec::with_capacity(payload.len() + 1);
    bytes.extend_from_slice(payload);
    bytes.push(SENTINEL);
    Ok(bytes)
}

/// Frame reader for streaming data.
///
/// Accumulates bytes and extracts complete frames. One `push` may make zero,
/// one, or several frames available.
#[derive(Debug)]
pub struct FrameReader {
    buffer: Vec<u8>,
}

impl FrameReader {
    /// Create an empty frame reader.
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Create a reader seeded with bytes that arrived ahead of it, such as
    /// data that followed the handshake line in the same read.
    pub fn with_leftover(leftover: Vec<u8>) -> Self {
        Self { buffer: leftover }
    }

    /// Add received bytes to the buffer.
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to extract the next complete frame.
    ///
    /// Returns `Ok(Some(payload))` with the sentinel stripped, `Ok(None)` if
    /// more data is needed, or `Err` when the pending run exceeds
    /// [`MAX_FRAME_SIZE`]. Empty frames are skipped.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            let Some(pos) = self.buffer.iter().position(|&b| b == SENTINEL) else {
                if self.buffer.len() > MAX_FRAME_SIZE {
                    self.buffer.clear();
                    return Err(Error::Protocol("frame exceeds maximum size".into()));
                }
                return Ok(None);
            };

            let mut frame: Vec<u8> = self.buffer.drain(..=pos).collect();
            frame.pop();
            if !frame.is_empty() {
                return Ok(Some(frame));
            }
        }
    }

    /// Drain every complete frame currently buffered.
    pub fn drain_frames(&mut self) -> Result<Vec<Vec<u8>>> {
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Consume the reader, returning any bytes not yet terminated.
    pub fn into_remainder(self) -> Vec<u8> {
        self.buffer
    }

    /// Clear the buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Get current buffer size.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

/// Extract every complete frame from a byte buffer, returning the frames and
/// the unterminated remainder.
pub fn extract_frames(bytes: &[u8]) -> Result<(Vec<Vec<u8>>, Vec<u8>)> {
    let mut reader = FrameReader::with_leftover(bytes.to_vec());
    let frames = reader.drain_frames()?;
    Ok((frames, reader.into_remainder()))
}
