//! Length-framed datagrams over a byte stream.
//!
//! UDP flows ride their paired data connection as a sequence of
//! `u16` big-endian length prefixes followed by the datagram payload,
//! which a UDP datagram can never exceed. Both sides of the tunnel use
//! the same framing.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Appends one framed datagram to the buffer.
pub fn encode(payload: &[u8], buf: &mut BytesMut) {
    debug_assert!(payload.len() <= u16::MAX as usize);

    buf.reserve(2 + payload.len());
    buf.put_u16(payload.len() as u16);
    buf.put_slice(payload);
}

/// Takes one complete datagram off the front of the buffer, or nothing
/// when the buffer does not yet hold a whole frame.
///
/// # Example
///
/// ```
/// use bytes::BytesMut;
/// use tunnel_codec::datagram;
///
/// let mut buf = BytesMut::new();
/// datagram::encode(b"ping", &mut buf);
///
/// assert_eq!(datagram::decode(&mut buf).unwrap().as_ref(), b"ping");
/// assert!(datagram::decode(&mut buf).is_none());
/// ```
pub fn decode(buf: &mut BytesMut) -> Option<Bytes> {
    if buf.len() < 2 {
        return None;
    }

    let size = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    if buf.len() < 2 + size {
        return None;
    }

    buf.advance(2);
    Some(buf.split_to(size).freeze())
}

/// Writes one framed datagram to the stream and flushes it.
pub async fn write_datagram<W>(writer: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&(payload.len() as u16).to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}
