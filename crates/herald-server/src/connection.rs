//! Per-connection reader and writer pumps.

use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use herald_core::codec::{self, ProtocolError};
use herald_core::ids::UserId;

use crate::config::ServerConfig;
use crate::registry::{ConnectionHandle, Outbound, RegistryHandle};

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("no frame within {0:?}")]
    ReadTimeout(Duration),

    #[error("write did not complete within {0:?}")]
    WriteTimeout(Duration),

    #[error("frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("registry unavailable")]
    RegistryClosed,
}

#[derive(Clone, Debug)]
pub struct ConnectionSettings {
    pub outbound_capacity: usize,
    pub max_frame_bytes: usize,
    pub ping_interval: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

impl From<&ServerConfig> for ConnectionSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            outbound_capacity: config.outbound_queue_capacity,
            max_frame_bytes: config.max_frame_bytes,
            ping_interval: config.ping_interval(),
            read_timeout: config.read_timeout(),
            write_timeout: config.write_timeout(),
        }
    }
}

/// Run one authenticated socket until the peer leaves, the connection is
/// evicted or replaced, or the server shuts down.
pub async fn serve(
    socket: WebSocket,
    user_id: UserId,
    registry: RegistryHandle,
    settings: ConnectionSettings,
    shutdown: CancellationToken,
) {
    let (handle, Outbound { rx, closed }) =
        ConnectionHandle::new(user_id.clone(), settings.outbound_capacity);
    let connection_id = handle.id().clone();
    let span = tracing::info_span!("connection", user_id = %user_id, connection_id = %connection_id);

    async move {
        if registry.register(handle).await.is_err() {
            warn!("registry unavailable, dropping socket");
            return;
        }

        let (sink, stream) = socket.split();
        let mut writer = tokio::spawn(write_pump(sink, rx, settings.clone()).in_current_span());

        let mut writer_done = false;
        let outcome = tokio::select! {
            res = read_pump(stream, &user_id, &registry, &settings) => res,
            _ = closed.cancelled() => Ok(()),
            _ = shutdown.cancelled() => Ok(()),
            res = &mut writer => {
                writer_done = true;
                match res {
                    Ok(res) => res,
                    Err(e) => Err(ConnectionError::Transport(e.to_string())),
                }
            }
        };

        match &outcome {
            Ok(()) => info!("connection ended"),
            Err(e) => info!(error = %e, "connection failed"),
        }

        // Conditional on still being current; a no-op after replacement.
        let _ = registry.unregister(user_id.clone(), connection_id.clone()).await;

        if !writer_done {
            // The writer exits once the registry has dropped its sender; a
            // stuck socket is bounded by the write timeout.
            match writer.await {
                Ok(Err(e)) => debug!(error = %e, "writer ended with error"),
                Err(e) => debug!(error = %e, "writer task failed"),
                Ok(Ok(())) => {}
            }
        }
    }
    .instrument(span)
    .await
}

async fn read_pump(
    mut stream: SplitStream<WebSocket>,
    user_id: &UserId,
    registry: &RegistryHandle,
    settings: &ConnectionSettings,
) -> Result<(), ConnectionError> {
    loop {
        let next = timeout(settings.read_timeout, stream.next())
            .await
            .map_err(|_| ConnectionError::ReadTimeout(settings.read_timeout))?;

        let msg = match next {
            None => return Ok(()),
            Some(Err(e)) => return Err(ConnectionError::Transport(e.to_string())),
            Some(Ok(msg)) => msg,
        };

        match msg {
            WsMessage::Text(text) => {
                let text = text.as_str();
                if text.len() > settings.max_frame_bytes {
                    return Err(ConnectionError::FrameTooLarge {
                        size: text.len(),
                        max: settings.max_frame_bytes,
                    });
                }
                match codec::decode(text) {
                    Ok(command) => registry
                        .dispatch(user_id.clone(), command)
                        .await
                        .map_err(|_| ConnectionError::RegistryClosed)?,
                    Err(ProtocolError::UnknownType(kind)) => {
                        warn!(kind = %kind, "dropping frame with unrecognized type");
                    }
                    Err(e) => debug!(error = %e, "dropping malformed frame"),
                }
            }
            WsMessage::Binary(data) => {
                debug!(len = data.len(), "dropping binary frame");
            }
            WsMessage::Close(_) => return Ok(()),
            // Any frame refreshes the read deadline; pongs need no other handling.
            WsMessage::Ping(_) | WsMessage::Pong(_) => {}
        }
    }
}

async fn write_pump(
    mut sink: SplitSink<WebSocket, WsMessage>,
    mut rx: mpsc::Receiver<String>,
    settings: ConnectionSettings,
) -> Result<(), ConnectionError> {
    let mut ping = interval_at(Instant::now() + settings.ping_interval, settings.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Some(text) => {
                    send(&mut sink, WsMessage::Text(text.into()), settings.write_timeout).await?;
                }
                None => {
                    let _ = send(&mut sink, WsMessage::Close(None), settings.write_timeout).await;
                    return Ok(());
                }
            },
            _ = ping.tick() => {
                send(&mut sink, WsMessage::Ping(Vec::new().into()), settings.write_timeout).await?;
            }
        }
    }
}

async fn send(
    sink: &mut SplitSink<WebSocket, WsMessage>,
    msg: WsMessage,
    limit: Duration,
) -> Result<(), ConnectionError> {
    timeout(limit, sink.send(msg))
        .await
        .map_err(|_| ConnectionError::WriteTimeout(limit))?
        .map_err(|e| ConnectionError::Transport(e.to_string()))
}
