use std::{
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
    time::Duration,
};

use anyhow::{Result, anyhow, bail};
use bytes::BytesMut;
use codec::{
    ControlMessage, Payload,
    message::{Heartbeat, UnregisterService, unix_ms},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, WriteHalf},
    sync::{broadcast, mpsc},
    time,
};

use crate::{config::Config, tls, tls::ClientStream, worker};

/// Where the client currently stands against the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    Connecting,
    Authenticating,
    Connected,
    Backoff,
    Stopped,
}

impl ClientState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Connected => "connected",
            Self::Backoff => "backoff",
            Self::Stopped => "stopped",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Connecting,
            2 => Self::Authenticating,
            3 => Self::Connected,
            4 => Self::Backoff,
            _ => Self::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Connecting => 1,
            Self::Authenticating => 2,
            Self::Connected => 3,
            Self::Backoff => 4,
            Self::Stopped => 5,
        }
    }
}

/// The single control session to one broker, with auto-reconnect.
pub struct Connector {
    config: Arc<Config>,
    state: AtomicU8,
    session_id: parking_lot::Mutex<String>,
    shutdown: broadcast::Sender<()>,
}

impl Connector {
    pub fn new(config: Arc<Config>) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: AtomicU8::new(ClientState::Idle.as_u8()),
            session_id: parking_lot::Mutex::new(String::new()),
            shutdown: broadcast::channel(1).0,
        })
    }

    pub fn state(&self) -> ClientState {
        ClientState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub fn session_id(&self) -> String {
        self.session_id.lock().clone()
    }

    /// Asks the running session to unregister its services and go away.
    pub fn stop(&self) {
        let _ = self.shutdown.send(());
    }

    fn set_state(&self, state: ClientState) {
        self.state.store(state.as_u8(), Ordering::Relaxed);
        log::debug!("client state: {}", state.as_str());
    }

    /// Connect, serve, reconnect. Returns when stopped, when reconnect
    /// is disabled, or with an error once the retry budget is spent.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        let reconnect = &self.config.reconnect;
        let mut shutdown = self.shutdown.subscribe();
        let mut retries = 0u32;

        loop {
            self.set_state(ClientState::Connecting);

            let result = tokio::select! {
                result = self.connect_once() => result,
                _ = shutdown.recv() => {
                    self.set_state(ClientState::Stopped);
                    return Ok(());
                }
            };

            match result {
                Ok(()) => {
                    if self.state() == ClientState::Stopped {
                        return Ok(());
                    }

                    // The session was up and then ended; start the retry
                    // budget over.
                    retries = 0;
                }
                Err(e) => {
                    log::warn!("connection attempt failed: {}", e);
                }
            }

            if !reconnect.enabled {
                self.set_state(ClientState::Stopped);
                return Ok(());
            }

            retries += 1;
            if retries > reconnect.max_retries {
                self.set_state(ClientState::Stopped);
                bail!("giving up after {} attempts", reconnect.max_retries);
            }

            self.set_state(ClientState::Backoff);
            log::info!(
                "reconnecting in {}s: attempt {}/{}",
                reconnect.retry_interval,
                retries,
                reconnect.max_retries
            );

            tokio::select! {
                _ = time::sleep(Duration::from_secs(reconnect.retry_interval)) => {}
                _ = shutdown.recv() => {
                    self.set_state(ClientState::Stopped);
                    return Ok(());
                }
            }
        }
    }

    async fn connect_once(self: &Arc<Self>) -> Result<()> {
        let mut stream = tls::connect(&self.config).await?;
        self.set_state(ClientState::Authenticating);

        let auth = ControlMessage::new(Payload::Auth(self.config.client_record()));
        codec::write_message(&mut stream, &auth).await?;

        let reply = codec::read_message(&mut stream, codec::DEFAULT_MAX_FRAME).await?;
        let session_id = match reply.payload {
            Payload::Response(response) if response.success => response
                .session_id
                .unwrap_or_else(|| reply.session_id.clone()),
            Payload::Response(response) => {
                bail!(
                    "authentication rejected: {} (code={:?})",
                    response.message,
                    response.code
                );
            }
            _ => bail!("unexpected reply to auth"),
        };

        *self.session_id.lock() = session_id.clone();
        self.set_state(ClientState::Connected);

        log::info!(
            "control session established: server={}, session={}",
            self.config.client.server,
            session_id
        );

        self.serve(stream, session_id).await
    }

    /// The CONNECTED half of the state machine: heartbeats out, frames
    /// in, proxy requests fanned out to workers.
    async fn serve(self: &Arc<Self>, stream: ClientStream, session_id: String) -> Result<()> {
        let (mut reader, writer) = tokio::io::split(stream);
        let (sender, receiver) = mpsc::channel(64);
        let writer_task = tokio::spawn(write_loop(writer, receiver));

        for service in &self.config.services {
            let record = self.config.service_record(service);
            sender
                .send(ControlMessage::with_session(
                    &session_id,
                    Payload::RegisterService(record),
                ))
                .await
                .map_err(|_| anyhow!("control writer is gone"))?;
        }

        let mut shutdown = self.shutdown.subscribe();
        let mut heartbeat = time::interval(Duration::from_secs(
            self.config.client.heartbeat_interval.max(1),
        ));

        let mut buf = BytesMut::with_capacity(32 * 1024);

        let result = 'session: loop {
            loop {
                match codec::decode(&mut buf, codec::DEFAULT_MAX_FRAME) {
                    Ok(Some(message)) => {
                        if let Err(e) = self.dispatch(message) {
                            break 'session Err(e);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => break 'session Err(e.into()),
                }
            }

            tokio::select! {
                result = reader.read_buf(&mut buf) => match result {
                    Ok(0) => {
                        log::warn!("server closed the control session");
                        break Ok(());
                    }
                    Ok(_) => {}
                    Err(e) => break Err(e.into()),
                },
                _ = heartbeat.tick() => {
                    let frame = ControlMessage::with_session(
                        &session_id,
                        Payload::Heartbeat(Heartbeat {
                            client_id: self.config.client.client_id.clone(),
                            timestamp: unix_ms(),
                        }),
                    );

                    if sender.send(frame).await.is_err() {
                        break Ok(());
                    }
                }
                _ = shutdown.recv() => {
                    // Unregister everything before going, then let the
                    // writer drain.
                    for service in &self.config.services {
                        let _ = sender
                            .send(ControlMessage::with_session(
                                &session_id,
                                Payload::UnregisterService(UnregisterService {
                                    service_id: String::new(),
                                    service_name: service.name.clone(),
                                }),
                            ))
                            .await;
                    }

                    time::sleep(Duration::from_millis(100)).await;
                    self.set_state(ClientState::Stopped);
                    break Ok(());
                }
            }
        };

        drop(sender);
        let _ = writer_task.await;
        result
    }

    fn dispatch(self: &Arc<Self>, message: ControlMessage) -> Result<()> {
        match message.payload {
            Payload::Response(response) => {
                if response.success {
                    log::info!(
                        "request acknowledged: {} (service={:?}, remote-port={:?})",
                        response.message,
                        response.service_id,
                        response.remote_port
                    );
                } else {
                    log::warn!(
                        "request rejected: {} (code={:?})",
                        response.message,
                        response.code
                    );
                }

                Ok(())
            }
            Payload::ProxyRequest(request) => {
                log::debug!(
                    "proxy request: connection={}, service={}",
                    request.connection_id,
                    request.service_name
                );

                tokio::spawn(worker::handle(self.config.clone(), request));
                Ok(())
            }
            Payload::Notification(notification) => {
                log::info!(
                    "notification from server: [{}] {}: {}",
                    match notification.level {
                        codec::message::NotificationLevel::Info => "info",
                        codec::message::NotificationLevel::Warning => "warning",
                        codec::message::NotificationLevel::Error => "error",
                    },
                    notification.title,
                    notification.message
                );

                Ok(())
            }
            Payload::Error(error) => {
                log::warn!("error from server: code={}, {}", error.code, error.message);
                Ok(())
            }
            Payload::Unknown => {
                log::warn!("unknown frame type discarded");
                Ok(())
            }
            _ => Err(anyhow!("unexpected frame type from the server")),
        }
    }
}

async fn write_loop(
    mut writer: WriteHalf<ClientStream>,
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
