//! ## Tunnel control channel codec
//!
//! Everything a client and a broker say to each other on the control
//! channel is a single JSON object of the shape `{type, sessionId, data,
//! timestamp}`. A frame on the wire is a 4-byte big-endian length prefix
//! followed by exactly that many bytes of UTF-8 JSON, so a message can
//! never be split or coalesced by the transport.
//!
//! The same framing carries the one-shot `data_connection` handshake that
//! a client sends as the first frame on a freshly dialed data socket.
//! After that frame the data socket is opaque bytes and is handed to the
//! [`splice`] module.

pub mod datagram;
pub mod message;
pub mod splice;

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub use message::{ControlMessage, Payload};

/// Number of bytes in the frame length prefix.
pub const LENGTH_PREFIX: usize = 4;

/// Frames larger than this are a protocol violation and fail the
/// connection.
pub const DEFAULT_MAX_FRAME: usize = 1024 * 1024;

#[derive(Debug)]
pub enum Error {
    /// The length prefix announced a frame beyond the configured maximum.
    FrameTooLarge(usize),
    /// The frame body is not the JSON object the protocol expects.
    Json(serde_json::Error),
    Io(io::Error),
    /// A splice ran past its configured deadline.
    DeadlineElapsed,
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

/// Appends one framed message to the buffer.
///
/// # Example
///
/// ```
/// use bytes::BytesMut;
/// use tunnel_codec::{ControlMessage, Payload, encode, message::Heartbeat};
///
/// let message = ControlMessage::new(Payload::Heartbeat(Heartbeat {
///     client_id: "client-1".to_string(),
///     timestamp: 0,
/// }));
///
/// let mut buf = BytesMut::new();
/// encode(&message, &mut buf).unwrap();
///
/// assert!(buf.len() > 4);
/// ```
pub fn encode(message: &ControlMessage, buf: &mut BytesMut) -> Result<(), Error> {
    let body = serde_json::to_vec(message)?;
    if body.len() > DEFAULT_MAX_FRAME {
        return Err(Error::FrameTooLarge(body.len()));
    }

    buf.reserve(LENGTH_PREFIX + body.len());
    buf.put_u32(body.len() as u32);
    buf.put_slice(&body);
    Ok(())
}

/// Takes one complete message off the front of the buffer.
///
/// Returns `None` when the buffer does not yet hold a whole frame; the
/// caller keeps reading from the socket and retries.
///
/// # Example
///
/// ```
/// use bytes::BytesMut;
/// use tunnel_codec::{ControlMessage, Payload, decode, encode, message::Heartbeat};
///
/// let message = ControlMessage::new(Payload::Heartbeat(Heartbeat {
///     client_id: "client-1".to_string(),
///     timestamp: 0,
/// }));
///
/// let mut buf = BytesMut::new();
/// encode(&message, &mut buf).unwrap();
///
/// assert!(decode(&mut buf, 1024).unwrap().is_some());
/// assert!(decode(&mut buf, 1024).unwrap().is_none());
/// ```
pub fn decode(buf: &mut BytesMut, max_frame: usize) -> Result<Option<ControlMessage>, Error> {
    if buf.len() < LENGTH_PREFIX {
        return Ok(None);
    }

    let size = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if size > max_frame {
        return Err(Error::FrameTooLarge(size));
    }

    if buf.len() < LENGTH_PREFIX + size {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX);
    let body = buf.split_to(size);
    Ok(Some(serde_json::from_slice(&body)?))
}

/// Reads exactly one framed message from the stream.
pub async fn read_message<R>(reader: &mut R, max_frame: usize) -> Result<ControlMessage, Error>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX];
    reader.read_exact(&mut prefix).await?;

    let size = u32::from_be_bytes(prefix) as usize;
    if size > max_frame {
        return Err(Error::FrameTooLarge(size));
    }

    let mut body = vec![0u8; size];
    reader.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

/// Writes one framed message to the stream and flushes it.
///
/// Callers are responsible for serializing writes on a shared socket, a
/// frame interrupted halfway poisons the stream for the peer.
pub async fn write_message<W>(writer: &mut W, message: &ControlMessage) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(message)?;
    if body.len() > DEFAULT_MAX_FRAME {
        return Err(Error::FrameTooLarge(body.len()));
    }

    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}
