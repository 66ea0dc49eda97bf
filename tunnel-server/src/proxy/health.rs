//! Active health checking for static-server backend pools.
//!
//! TCP pools are probed with a plain connect. http pools get a minimal
//! GET against the configured path and a 2xx/3xx status line counts as
//! healthy. https pools fall back to the connect probe, the backends
//! terminate their own TLS and a reachability check is what the pool
//! needs to keep routing. UDP pools have no meaningful probe and are
//! left to dial-time failure accounting.

use std::{sync::Arc, time::Duration};

use codec::message::ServiceKind;
use service::balance::Node;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};

use super::StaticProxy;

pub async fn health_loop(proxy: Arc<StaticProxy>) {
    if proxy.config.transport == ServiceKind::Udp {
        return;
    }

    let mut shutdown = proxy.shutdown_signal();
    let mut tick =
        tokio::time::interval(Duration::from_secs(proxy.config.health_check.interval.max(1)));

    loop {
        tokio::select! {
            _ = tick.tick() => {
                for node in proxy.pool.nodes() {
                    let was = node.health();
                    let (healthy, status) = probe(&proxy, node).await;
                    node.mark_checked(healthy, &status, proxy.config.health_check.max_failures);

                    if node.health() != was {
                        log::info!(
                            "node health changed: name={}, node={}, {} -> {}, status={}",
                            proxy.config.name,
                            node.node_id,
                            was.as_str(),
                            node.health().as_str(),
                            status
                        );
                    }
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}

async fn probe(proxy: &StaticProxy, node: &Arc<Node>) -> (bool, String) {
    let probe_timeout = Duration::from_secs(proxy.config.health_check.timeout);

    let result = match proxy.config.transport {
        ServiceKind::Http => {
            let path = proxy
                .config
                .health_check
                .url
                .clone()
                .unwrap_or_else(|| "/".to_string());

            timeout(probe_timeout, http_probe(node, path)).await
        }
        _ => timeout(probe_timeout, connect_probe(node)).await,
    };

    match result {
        Ok(outcome) => outcome,
        Err(_) => (false, "probe timeout".to_string()),
    }
}

async fn connect_probe(node: &Arc<Node>) -> (bool, String) {
    match TcpStream::connect(node.target()).await {
        Ok(_) => (true, "ok".to_string()),
        Err(e) => (false, e.to_string()),
    }
}

/// One GET, one status line. Anything in 2xx/3xx keeps the node in
/// rotation.
async fn http_probe(node: &Arc<Node>, path: String) -> (bool, String) {
    let mut stream = match TcpStream::connect(node.target()).await {
        Ok(stream) => stream,
        Err(e) => return (false, e.to_string()),
    };

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path,
        node.target_address
    );

    if let Err(e) = stream.write_all(request.as_bytes()).await {
        return (false, e.to_string());
    }

    let mut buf = [0u8; 1024];
    let size = match stream.read(&mut buf).await {
        Ok(0) => return (false, "empty response".to_string()),
        Ok(size) => size,
        Err(e) => return (false, e.to_string()),
    };

    match parse_status(&buf[..size]) {
        Some(status) if (200..400).contains(&status) => (true, format!("http {}", status)),
        Some(status) => (false, format!("http {}", status)),
        None => (false, "malformed status line".to_string()),
    }
}

fn parse_status(response: &[u8]) -> Option<u16> {
    let text = std::str::from_utf8(response).ok()?;
    let mut parts = text.split_whitespace();

    if !parts.next()?.starts_with("HTTP/") {
        return None;
    }

    parts.next()?.parse().ok()
}
