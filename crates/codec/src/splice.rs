//! Bidirectional byte pump between two streams.
//!
//! Both copy directions run until their own EOF. A clean half-close on one
//! side shuts down the opposite write side and lets the reverse copy keep
//! draining; a hard error tears both streams down at once. Byte counters
//! live behind a shared handle so traffic accounting can observe them
//! while the splice is still running and after it terminated.

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::Error;

/// Copy buffer size per direction.
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone)]
pub struct SpliceOptions {
    pub buffer_size: usize,
    /// Bound on the total wall time of the splice. `None` runs until both
    /// directions finish.
    pub deadline: Option<Duration>,
}

impl Default for SpliceOptions {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            deadline: None,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    a_to_b: AtomicU64,
    b_to_a: AtomicU64,
}

/// Observable byte counters of one splice.
///
/// Clone it before starting the splice and read totals from the clone at
/// any point, including after termination.
///
/// # Example
///
/// ```
/// use tunnel_codec::splice::Traffic;
///
/// let traffic = Traffic::default();
///
/// assert_eq!(traffic.a_to_b(), 0);
/// assert_eq!(traffic.b_to_a(), 0);
/// ```
#[derive(Debug, Default, Clone)]
pub struct Traffic(Arc<Counters>);

impl Traffic {
    pub fn a_to_b(&self) -> u64 {
        self.0.a_to_b.load(Ordering::Relaxed)
    }

    pub fn b_to_a(&self) -> u64 {
        self.0.b_to_a.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.a_to_b() + self.b_to_a()
    }
}

async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    buffer_size: usize,
    counter: &AtomicU64,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    let mut total = 0;

    loop {
        let size = reader.read(&mut buf).await?;
        if size == 0 {
            break;
        }

        writer.write_all(&buf[..size]).await?;
        counter.fetch_add(size as u64, Ordering::Relaxed);
        total += size as u64;
    }

    // Propagate the half-close so the peer sees EOF on this direction
    // while the reverse copy keeps going.
    writer.shutdown().await.ok();
    Ok(total)
}

/// Shuttles bytes between `a` and `b` until both directions reached EOF,
/// either direction failed, or the deadline elapsed. Both streams are
/// closed on return and the per-direction totals are reported.
pub async fn splice<A, B>(
    a: A,
    b: B,
    options: &SpliceOptions,
    traffic: &Traffic,
) -> Result<(u64, u64), Error>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_reader, mut a_writer) = tokio::io::split(a);
    let (mut b_reader, mut b_writer) = tokio::io::split(b);

    let run = async {
        tokio::try_join!(
            pump(
                &mut a_reader,
                &mut b_writer,
                options.buffer_size,
                &traffic.0.a_to_b,
            ),
            pump(
                &mut b_reader,
                &mut a_writer,
                options.buffer_size,
                &traffic.0.b_to_a,
            ),
        )
    };

    match options.deadline {
        Some(deadline) => {
            timeout(deadline, run).await.map_err(|_| Error::DeadlineElapsed)??;
        }
        None => {
            run.await?;
        }
    }

    Ok((traffic.a_to_b(), traffic.b_to_a()))
}
