use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use tunnel_codec::{
    Error,
    splice::{SpliceOptions, Traffic, splice},
};

#[tokio::test]
async fn shuttles_both_directions() -> Result<()> {
    let (mut public, public_remote) = tokio::io::duplex(4096);
    let (mut backend, backend_remote) = tokio::io::duplex(4096);

    let traffic = Traffic::default();
    let handle = {
        let traffic = traffic.clone();
        tokio::spawn(async move {
            splice(public_remote, backend_remote, &SpliceOptions::default(), &traffic).await
        })
    };

    public.write_all(b"hello").await?;
    let mut buf = [0u8; 5];
    backend.read_exact(&mut buf).await?;
    assert_eq!(&buf, b"hello");

    backend.write_all(b"hi back").await?;
    let mut buf = [0u8; 7];
    public.read_exact(&mut buf).await?;
    assert_eq!(&buf, b"hi back");

    drop(public);
    drop(backend);

    let (a_to_b, b_to_a) = handle.await??;
    assert_eq!(a_to_b, 5);
    assert_eq!(b_to_a, 7);
    assert_eq!(traffic.total(), 12);
    Ok(())
}

#[tokio::test]
async fn half_close_keeps_reverse_copy_alive() -> Result<()> {
    let (mut public, public_remote) = tokio::io::duplex(4096);
    let (mut backend, backend_remote) = tokio::io::duplex(4096);

    let traffic = Traffic::default();
    let handle = {
        let traffic = traffic.clone();
        tokio::spawn(async move {
            splice(public_remote, backend_remote, &SpliceOptions::default(), &traffic).await
        })
    };

    public.write_all(b"push").await?;
    public.shutdown().await?;

    // The backend sees the propagated EOF once the forward copy drains.
    let mut drained = Vec::new();
    backend.read_to_end(&mut drained).await?;
    assert_eq!(drained, b"push");

    // The reverse direction still flows after the forward half closed.
    backend.write_all(b"late reply").await?;
    let mut buf = [0u8; 10];
    public.read_exact(&mut buf).await?;
    assert_eq!(&buf, b"late reply");

    backend.shutdown().await?;

    let (a_to_b, b_to_a) = handle.await??;
    assert_eq!(a_to_b, 4);
    assert_eq!(b_to_a, 10);
    Ok(())
}

#[tokio::test]
async fn deadline_bounds_wall_time() -> Result<()> {
    let (_public, public_remote) = tokio::io::duplex(4096);
    let (_backend, backend_remote) = tokio::io::duplex(4096);

    let options = SpliceOptions {
        deadline: Some(Duration::from_millis(50)),
        ..Default::default()
    };

    let traffic = Traffic::default();
    match splice(public_remote, backend_remote, &options, &traffic).await {
        Err(Error::DeadlineElapsed) => {}
        other => panic!("expected deadline error, got {:?}", other),
    }

    assert_eq!(traffic.total(), 0);
    Ok(())
}

#[tokio::test]
async fn buffer_size_is_respected_for_large_transfers() -> Result<()> {
    let (mut public, public_remote) = tokio::io::duplex(64 * 1024);
    let (mut backend, backend_remote) = tokio::io::duplex(64 * 1024);

    let options = SpliceOptions {
        buffer_size: 1024,
        ..Default::default()
    };

    let traffic = Traffic::default();
    let handle = {
        let traffic = traffic.clone();
        tokio::spawn(
            async move { splice(public_remote, backend_remote, &options, &traffic).await },
        )
    };

    let payload = vec![0xabu8; 256 * 1024];
    let writer = {
        let payload = payload.clone();
        tokio::spawn(async move {
            public.write_all(&payload).await?;
            public.shutdown().await?;
            std::io::Result::Ok(public)
        })
    };

    let mut received = Vec::new();
    backend.read_to_end(&mut received).await?;
    assert_eq!(received, payload);

    backend.shutdown().await?;
    let mut public = writer.await??;

    let mut rest = Vec::new();
    public.read_to_end(&mut rest).await?;
    assert!(rest.is_empty());

    let (a_to_b, _) = handle.await??;
    assert_eq!(a_to_b, 256 * 1024);
    Ok(())
}
