//! Data-connection workers.
//!
//! Every `proxy_request` spawns one of these: dial the broker's control
//! port again, identify with a `data_connection` handshake, connect to
//! the local service, and shuttle bytes until either side is done. The
//! control session is never touched from here.

use std::{sync::Arc, time::{Duration, Instant}};

use anyhow::{Result, bail};
use bytes::BytesMut;
use codec::{
    ControlMessage, Payload, datagram,
    message::{DataConnection, ProxyRequest, ServiceKind},
    splice::{SpliceOptions, Traffic, splice},
};
use tokio::{
    io::AsyncReadExt,
    net::{TcpStream, UdpSocket},
};

use crate::{
    config::{Config, Service},
    tls,
    tls::ClientStream,
};

/// A UDP flow with no traffic for this long ends, matching the broker's
/// idea of an idle flow.
const UDP_IDLE: Duration = Duration::from_secs(60);

pub async fn handle(config: Arc<Config>, request: ProxyRequest) {
    if let Err(e) = run(&config, &request).await {
        log::warn!(
            "proxy request failed: connection={}, service={}, {}",
            request.connection_id,
            request.service_name,
            e
        );
    }
}

async fn run(config: &Config, request: &ProxyRequest) -> Result<()> {
    let Some(service) = config
        .services
        .iter()
        .find(|it| it.name == request.service_name)
    else {
        bail!("service not configured: {}", request.service_name);
    };

    let mut stream = tls::connect(config).await?;

    let handshake = ControlMessage::new(Payload::DataConnection(DataConnection {
        connection_id: request.connection_id.clone(),
        client_id: config.client.client_id.clone(),
        service_id: Some(request.service_id.clone()),
    }));

    codec::write_message(&mut stream, &handshake).await?;

    match service.kind {
        ServiceKind::Udp => udp_worker(service, stream, request).await,
        _ => tcp_worker(service, stream, request).await,
    }
}

async fn tcp_worker(
    service: &Service,
    stream: ClientStream,
    request: &ProxyRequest,
) -> Result<()> {
    let local =
        TcpStream::connect((service.local_address.as_str(), service.local_port)).await?;
    local.set_nodelay(true).ok();

    let traffic = Traffic::default();
    let result = splice(stream, local, &SpliceOptions::default(), &traffic).await;

    log::debug!(
        "data connection finished: connection={}, from-public={}, to-public={}",
        request.connection_id,
        traffic.a_to_b(),
        traffic.b_to_a()
    );

    result?;
    Ok(())
}

/// Datagrams ride the data connection u16-length framed; locally they
/// are plain UDP against the service address.
async fn udp_worker(
    service: &Service,
    stream: ClientStream,
    request: &ProxyRequest,
) -> Result<()> {
    let local = UdpSocket::bind("0.0.0.0:0").await?;
    local
        .connect((service.local_address.as_str(), service.local_port))
        .await?;

    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut framed = BytesMut::with_capacity(64 * 1024);
    let mut buf = vec![0u8; 64 * 1024];
    let mut from_public = 0u64;
    let mut to_public = 0u64;
    let mut last_activity = Instant::now();
    let mut idle_check = tokio::time::interval(Duration::from_secs(5));

    'flow: loop {
        while let Some(payload) = datagram::decode(&mut framed) {
            if local.send(&payload).await.is_err() {
                break 'flow;
            }

            from_public += payload.len() as u64;
            last_activity = Instant::now();
        }

        tokio::select! {
            result = reader.read_buf(&mut framed) => match result {
                Ok(0) => break,
                Ok(_) => {}
                Err(_) => break,
            },
            result = local.recv(&mut buf) => match result {
                Ok(size) => {
                    if datagram::write_datagram(&mut writer, &buf[..size]).await.is_err() {
                        break;
                    }

                    to_public += size as u64;
                    last_activity = Instant::now();
                }
                Err(_) => break,
            },
            _ = idle_check.tick() => {
                if last_activity.elapsed() >= UDP_IDLE {
                    break;
                }
            }
        }
    }

    log::debug!(
        "udp data connection finished: connection={}, from-public={}, to-public={}",
        request.connection_id,
        from_public,
        to_public
    );

    Ok(())
}
