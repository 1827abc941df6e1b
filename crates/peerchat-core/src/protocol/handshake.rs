//! Identity handshake.
//!
//! ```text
//! dialer                      acceptor
//!   |---- "<id>:<port>" EOT ---->|
//!   |<--------- "<id>" EOT ------|
//! ```
//!
//! Both lines are sentinel-terminated frames. Bytes that follow a line in the
//! same read belong to the first data frame and are handed back to the caller.

use super::frame::{encode_frame, FrameReader};
use super::types::PeerId;
use crate::error::{Error, Result};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Sent before closing a connection that duplicates an existing Link.
pub const CLOSE_NOTICE: &str = "CLOSING: Already have connection together";

/// Parsed handshake line: `id` or `id:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    /// Announced peer id.
    pub peer_id: PeerId,
    /// Listening port advertised by a dialer.
    pub port: Option<u16>,
}

impl Hello {
    /// Parse a handshake line.
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        match line.split_once(':') {
            Some((id, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| Error::Handshake(format!("invalid port in hello: {port:?}")))?;
                Ok(Self {
                    peer_id: PeerId::parse(id)?,
                    port: Some(port),
                })
            }
            None => Ok(Self {
                peer_id: PeerId::parse(line)?,
                port: None,
            }),
        }
    }

    /// Render the line a dialer sends.
    pub fn dialer_line(id: &PeerId, port: u16) -> String {
        format!("{id}:{port}")
    }
}

/// Write one handshake line.
pub async fn write_line<W>(stream: &mut W, line: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode_frame(line.as_bytes())?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one handshake line within `limit`.
///
/// Returns the line and any bytes received after it.
pub async fn read_line<R>(stream: &mut R, limit: Duration) -> Result<(String, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    tokio::time::timeout(limit, read_line_inner(stream)).await?
}

async fn read_line_inner<R>(stream: &mut R) -> Result<(String, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let mut reader = FrameReader::new();
    let mut buf = [0u8; 512];
    loop {
        if let Some(frame) = reader.next_frame()? {
            let line = String::from_utf8(frame)
                .map_err(|_| Error::Handshake("hello is not valid UTF-8".into()))?;
            return Ok((line, reader.into_remainder()));
        }
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(Error::Handshake("connection closed during handshake".into()));
        }
        reader.push(&buf[..n]);
    }
}
