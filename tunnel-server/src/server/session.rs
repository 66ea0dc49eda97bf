use std::{net::SocketAddr, sync::Arc, time::Duration};

use ahash::AHashMap;
use bytes::BytesMut;
use codec::{
    ControlMessage, Payload,
    message::{
        ClientRecord, Notification, NotificationLevel, Response, ServiceRecord,
        UnregisterService, codes,
    },
};
use parking_lot::RwLock;
use service::{
    counters::Number,
    services::ServiceEntry,
    session::Session,
    unique_id,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::{mpsc, oneshot},
};

use super::{ControlStream, TunnelServer, listener};

/// Outbound frame queues, one per live session.
///
/// The queue plus its single writer task is what serializes frames on the
/// control socket. Anyone holding a session id can push; the service
/// listeners re-resolve the id on every use instead of keeping a handle
/// to the session itself.
#[derive(Default)]
pub struct Outbounds(RwLock<AHashMap<String, mpsc::Sender<ControlMessage>>>);

impl Outbounds {
    fn insert(&self, session_id: &str, sender: mpsc::Sender<ControlMessage>) {
        self.0.write().insert(session_id.to_string(), sender);
    }

    fn remove(&self, session_id: &str) {
        self.0.write().remove(session_id);
    }

    /// Queues a frame for the session's writer. False means the session
    /// is gone or going.
    pub async fn send(&self, session_id: &str, message: ControlMessage) -> bool {
        let sender = match self.0.read().get(session_id) {
            Some(sender) => sender.clone(),
            None => return false,
        };

        sender.send(message).await.is_ok()
    }
}

async fn write_loop(
    mut writer: WriteHalf<ControlStream>,
    mut receiver: mpsc::Receiver<ControlMessage>,
) {
    while let Some(message) = receiver.recv().await {
        if let Err(e) = codec::write_message(&mut writer, &message).await {
            log::debug!("control write failed: {}", e);
            break;
        }
    }

    let _ = writer.shutdown().await;
}

/// Replies on a connection that never made it to an established session.
async fn refuse(stream: &mut ControlStream, response: Response) {
    let frame = ControlMessage::new(Payload::Response(response));
    let _ = codec::write_message(stream, &frame).await;
    let _ = stream.shutdown().await;
}

/// Runs one control session from its `auth` frame to CLOSED.
pub async fn run(
    server: Arc<TunnelServer>,
    mut stream: ControlStream,
    peer: SocketAddr,
    record: ClientRecord,
) {
    let broker = &server.config.server;

    if let Some(token) = &broker.token {
        if record.auth_token != *token {
            server
                .observer
                .authentication_failed(&record.client_id, peer, "bad token");
            refuse(&mut stream, Response::failure(codes::AUTH_FAILED, "bad token")).await;
            return;
        }
    }

    if server.sessions.len() >= broker.max_clients {
        server
            .observer
            .authentication_failed(&record.client_id, peer, "client limit reached");
        refuse(
            &mut stream,
            Response::failure(codes::CLIENT_LIMIT, "client limit reached"),
        )
        .await;
        return;
    }

    let tenant_id = if record.tenant_id.is_empty() {
        broker.tenant_id.clone()
    } else {
        record.tenant_id.clone()
    };

    let session = Arc::new(Session::new(
        unique_id("session"),
        record.client_id.clone(),
        tenant_id,
        peer,
    ));

    if server.sessions.insert(session.clone()).is_err() {
        server
            .observer
            .authentication_failed(&record.client_id, peer, "client already connected");
        refuse(
            &mut stream,
            Response::failure(codes::CLIENT_BUSY, "client already connected"),
        )
        .await;
        return;
    }

    let (reader, writer) = tokio::io::split(stream);
    let (sender, receiver) = mpsc::channel(64);
    server.outbounds.insert(&session.session_id, sender.clone());

    let (kick, kicked) = oneshot::channel();
    server.kicks.lock().insert(session.session_id.clone(), kick);

    tokio::spawn(write_loop(writer, receiver));

    {
        let mut response = Response::success("authenticated");
        response.client_id = Some(session.client_id.clone());
        response.session_id = Some(session.session_id.clone());
        let _ = sender
            .send(ControlMessage::with_session(
                &session.session_id,
                Payload::Response(response),
            ))
            .await;
    }

    server.observer.connected(&session, &record);

    let reason = read_loop(&server, &session, reader, &sender, kicked).await;
    close(&server, &session, reason);
}

/// Parses frames off the control socket until something ends the session.
/// Returns the close reason.
async fn read_loop(
    server: &Arc<TunnelServer>,
    session: &Arc<Session>,
    mut reader: ReadHalf<ControlStream>,
    sender: &mpsc::Sender<ControlMessage>,
    mut kicked: oneshot::Receiver<()>,
) -> &'static str {
    let broker = &server.config.server;
    let mut shutdown = server.shutdown_signal();
    let mut buf = BytesMut::with_capacity(broker.control_read_buffer);
    let mut check = tokio::time::interval(Duration::from_secs(1));

    loop {
        // Drain every complete frame before going back to the socket, a
        // single read may have carried several.
        loop {
            match codec::decode(&mut buf, broker.max_frame_size) {
                Ok(Some(message)) => {
                    if let Some(reason) = dispatch(server, session, sender, message).await {
                        return reason;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    log::warn!(
                        "protocol error: session={}, client={}, {}",
                        session.session_id,
                        session.client_id,
                        e
                    );

                    let _ = sender
                        .send(ControlMessage::with_session(
                            &session.session_id,
                            Payload::Error(codec::message::ErrorInfo::new(
                                codes::PROTOCOL_ERROR,
                                "unparseable frame",
                            )),
                        ))
                        .await;

                    return "protocol error";
                }
            }
        }

        tokio::select! {
            result = reader.read_buf(&mut buf) => match result {
                Ok(0) => return "peer closed",
                Ok(_) => {}
                Err(e) => {
                    log::debug!("control read failed: session={}, {}", session.session_id, e);
                    return "socket error";
                }
            },
            _ = check.tick() => {
                if session.idle_secs() >= broker.heartbeat_timeout {
                    return "heartbeat timeout";
                }
            }
            _ = &mut kicked => {
                let _ = sender
                    .send(ControlMessage::with_session(
                        &session.session_id,
                        Payload::Notification(Notification {
                            level: NotificationLevel::Warning,
                            title: "kicked".to_string(),
                            message: "the session was terminated by the server".to_string(),
                        }),
                    ))
                    .await;

                return "kicked";
            }
            _ = shutdown.recv() => {
                let _ = sender
                    .send(ControlMessage::with_session(
                        &session.session_id,
                        Payload::Notification(Notification {
                            level: NotificationLevel::Warning,
                            title: "server stopping".to_string(),
                            message: "the broker is shutting down".to_string(),
                        }),
                    ))
                    .await;

                return "server stopping";
            }
        }
    }
}

/// Handles one frame on an established session. A returned reason closes
/// the session.
async fn dispatch(
    server: &Arc<TunnelServer>,
    session: &Arc<Session>,
    sender: &mpsc::Sender<ControlMessage>,
    message: ControlMessage,
) -> Option<&'static str> {
    match message.payload {
        Payload::Heartbeat(heartbeat) => {
            // Only heartbeats count as liveness; other control traffic
            // does not hold the session open past the grace.
            session.touch();
            session.heartbeats.add();
            log::trace!(
                "heartbeat: session={}, client={}, count={}",
                session.session_id,
                heartbeat.client_id,
                session.heartbeats.get()
            );

            None
        }
        Payload::RegisterService(record) => {
            let response = register(server, session, record).await;
            let _ = sender
                .send(ControlMessage::with_session(
                    &session.session_id,
                    Payload::Response(response),
                ))
                .await;

            None
        }
        Payload::UnregisterService(request) => {
            let response = unregister(server, session, request).await;
            let _ = sender
                .send(ControlMessage::with_session(
                    &session.session_id,
                    Payload::Response(response),
                ))
                .await;

            None
        }
        Payload::Auth(_) => {
            let _ = sender
                .send(ControlMessage::with_session(
                    &session.session_id,
                    Payload::Error(codec::message::ErrorInfo::new(
                        codes::DUPLICATE_AUTH,
                        "session is already authenticated",
                    )),
                ))
                .await;

            Some("duplicate auth")
        }
        Payload::Unknown => {
            log::warn!(
                "unknown frame type discarded: session={}, client={}",
                session.session_id,
                session.client_id
            );

            None
        }
        _ => {
            let _ = sender
                .send(ControlMessage::with_session(
                    &session.session_id,
                    Payload::Error(codec::message::ErrorInfo::new(
                        codes::PROTOCOL_ERROR,
                        "unexpected frame type on a control session",
                    )),
                ))
                .await;

            Some("unexpected frame")
        }
    }
}

/// Service registration: quota, then name, then port, then bind, then
/// publish. The first check that fails is the one the client hears about.
async fn register(
    server: &Arc<TunnelServer>,
    session: &Arc<Session>,
    mut record: ServiceRecord,
) -> Response {
    let broker = &server.config.server;

    if session.service_count() >= broker.max_services_per_client {
        return Response::failure(codes::SERVICE_LIMIT, "per-client service limit reached");
    }

    if session.service_name_in_use(&record.service_name) {
        return Response::failure(
            codes::NAME_IN_USE,
            format!("service name {:?} already registered", record.service_name),
        );
    }

    let port = {
        let mut ports = server.ports.lock();
        match ports.acquire(record.remote_port) {
            Ok(port) => port,
            Err(service::ports::PortError::InUse(port)) => {
                return Response::failure(codes::PORT_IN_USE, format!("port {} in use", port));
            }
            Err(service::ports::PortError::NotAllowed(port)) => {
                return Response::failure(
                    codes::PORT_NOT_ALLOWED,
                    format!("port {} outside the allowed ranges", port),
                );
            }
            Err(service::ports::PortError::Exhausted) => {
                return Response::failure(codes::PORT_NOT_ALLOWED, "no free port left");
            }
        }
    };

    if record.service_id.is_empty() {
        record.service_id = unique_id("service");
    }
    record.client_id = session.client_id.clone();
    record.tenant_id = session.tenant_id.clone();
    record.remote_port = Some(port);

    let entry = Arc::new(ServiceEntry::from_record(
        &record,
        &session.session_id,
        port,
    ));

    // Registered before the listener goes live so a public connection
    // accepted right after the bind already resolves.
    server.services.insert(entry.clone());
    session.track_service(&entry.service_id, &entry.name);

    let handle = match listener::spawn(server.clone(), entry.clone()).await {
        Ok(handle) => handle,
        Err(e) => {
            server.services.remove(&entry.service_id);
            session.forget_service(&entry.service_id);
            server.ports.lock().release(port);

            log::warn!(
                "listener bind failed: service={}, port={}, {}",
                record.service_id,
                port,
                e
            );

            return Response::failure(codes::PORT_IN_USE, format!("bind failed: {}", e));
        }
    };

    server.listeners.insert(handle);

    // The structural write must land; on failure everything above is
    // rolled back and the client sees the failure.
    if let Err(e) = server.observer.registered(&record) {
        if let Some(handle) = server.listeners.remove(&entry.service_id) {
            handle.close();
        }

        server.services.remove(&entry.service_id);
        session.forget_service(&entry.service_id);
        server.ports.lock().release(port);

        return Response::failure(codes::PERSISTENCE_FAILED, format!("persistence failed: {}", e));
    }

    let mut response = Response::success("service registered");
    response.service_id = Some(entry.service_id.clone());
    response.remote_port = Some(port);
    response
}

async fn unregister(
    server: &Arc<TunnelServer>,
    session: &Arc<Session>,
    request: UnregisterService,
) -> Response {
    let entry = if !request.service_id.is_empty() {
        server.services.get(&request.service_id)
    } else {
        server
            .services
            .find_by_name(&session.client_id, &request.service_name)
    };

    let Some(entry) = entry else {
        return Response::failure(codes::UNKNOWN_SERVICE, "no such service");
    };

    if entry.session_id != session.session_id {
        return Response::failure(codes::UNKNOWN_SERVICE, "service belongs to another session");
    }

    drop_service(server, session, &entry, "unregistered by client");

    let mut response = Response::success("service unregistered");
    response.service_id = Some(entry.service_id.clone());
    response
}

/// Tears one service down: listener, registry entry, its waiting public
/// connections, and the remote port.
fn drop_service(
    server: &Arc<TunnelServer>,
    session: &Arc<Session>,
    entry: &Arc<ServiceEntry>,
    reason: &str,
) {
    if let Some(handle) = server.listeners.remove(&entry.service_id) {
        handle.close();
    }

    server.services.remove(&entry.service_id);
    session.forget_service(&entry.service_id);

    let swept = server
        .pending
        .take_services(std::slice::from_ref(&entry.service_id));
    for pending in swept {
        log::debug!(
            "pending request dropped with its service: connection={}",
            pending.connection_id
        );

        // The public socket closes when the entry drops.
        entry.counts.current_connections.sub(1);
    }

    server.ports.lock().release(entry.remote_port);
    server.observer.unregistered(entry, reason);
}

/// CLOSING: everything the session owns goes away, then the registries
/// and the client record learn about it.
fn close(server: &Arc<TunnelServer>, session: &Arc<Session>, reason: &'static str) {
    server.outbounds.remove(&session.session_id);
    server.kicks.lock().remove(&session.session_id);

    for service_id in session.service_ids() {
        if let Some(entry) = server.services.get(&service_id) {
            drop_service(server, session, &entry, "session closed");
        }
    }

    server.sessions.remove(&session.session_id);
    server.observer.disconnected(session, reason);
}
