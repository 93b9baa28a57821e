//! Websocket connection from an agent to the server.

use crate::config::AgentConfig;
use async_trait::async_trait;
use cimple_core::messages::Envelope;
use cimple_core::ports::MessageChannel;
use cimple_core::{Error, Result};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closed,
}

/// Binary websocket frames, one bincode envelope per frame.
///
/// Writes are serialized and bounded by the write wait. Reads fail when
/// nothing, keepalives included, arrives within the pong wait.
pub struct ServerConnection {
    writer: Mutex<SplitSink<WsStream, WsMessage>>,
    reader: Mutex<SplitStream<WsStream>>,
    write_wait: Duration,
    pong_wait: Duration,
    state: watch::Sender<ConnectionState>,
}

impl ServerConnection {
    pub async fn connect(url: &str, config: &AgentConfig) -> Result<Self> {
        info!(url = %url, "Connecting to server");

        let (stream, _response) = timeout(config.connect_timeout(), connect_async(url))
            .await
            .map_err(|_| Error::Transport(format!("Timed out connecting to {}", url)))?
            .map_err(|e| Error::Transport(format!("Failed to connect to {}: {}", url, e)))?;

        let (writer, reader) = stream.split();
        let (state, _) = watch::channel(ConnectionState::Open);

        Ok(Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            write_wait: config.write_wait(),
            pong_wait: config.pong_wait(),
            state,
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Send a ping every `period` until the connection closes or a ping
    /// cannot be written.
    pub fn spawn_keepalive(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let connection = Arc::clone(self);
        let mut state = self.subscribe();

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = connection.write(WsMessage::Ping(Vec::new().into())).await {
                            warn!(error = %e, "Failed to send ping");
                            connection.mark_closed();
                            break;
                        }
                        debug!("Ping sent");
                    }
                    changed = state.changed() => {
                        if changed.is_err() || *state.borrow() == ConnectionState::Closed {
                            break;
                        }
                    }
                }
            }
        })
    }

    async fn write(&self, message: WsMessage) -> Result<()> {
        if self.state() == ConnectionState::Closed {
            return Err(Error::ConnectionClosed);
        }

        let mut writer = self.writer.lock().await;
        match timeout(self.write_wait, writer.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.mark_closed();
                Err(transport_error(e))
            }
            Err(_) => {
                self.mark_closed();
                Err(Error::Transport(format!(
                    "Write did not complete within {:?}",
                    self.write_wait
                )))
            }
        }
    }

    fn mark_closed(&self) {
        self.state.send_replace(ConnectionState::Closed);
    }
}

fn transport_error(e: tungstenite::Error) -> Error {
    match e {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            Error::ConnectionClosed
        }
        other => Error::Transport(other.to_string()),
    }
}

#[async_trait]
impl MessageChannel for ServerConnection {
    async fn send_message(&self, envelope: Envelope) -> Result<()> {
        debug!(message_id = %envelope.id, kind = %envelope.kind(), "Sending message");
        let bytes = envelope.encode()?;
        self.write(WsMessage::Binary(bytes.into())).await
    }

    async fn read_message(&self) -> Result<Envelope> {
        let mut reader = self.reader.lock().await;

        loop {
            let frame = match timeout(self.pong_wait, reader.next()).await {
                Ok(frame) => frame,
                Err(_) => {
                    self.mark_closed();
                    return Err(Error::Transport(format!(
                        "Nothing received from server within {:?}",
                        self.pong_wait
                    )));
                }
            };

            match frame {
                Some(Ok(WsMessage::Binary(data))) => return Envelope::decode(&data),
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_))) => {}
                Some(Ok(WsMessage::Text(text))) => {
                    warn!(len = text.len(), "Ignoring text frame from server");
                }
                Some(Ok(WsMessage::Close(_))) | None => {
                    self.mark_closed();
                    return Err(Error::ConnectionClosed);
                }
                Some(Err(e)) => {
                    self.mark_closed();
                    return Err(transport_error(e));
                }
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if self.state() == ConnectionState::Closed {
            return Ok(());
        }
        self.mark_closed();

        let mut writer = self.writer.lock().await;
        let _ = timeout(self.write_wait, writer.send(WsMessage::Close(None))).await;
        let _ = writer.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cimple_core::messages::{BuildComplete, Message};
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    async fn listener() -> (TcpListener, AgentConfig) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = AgentConfig::default()
            .with_server("127.0.0.1", port)
            .with_tls(false);
        (listener, config)
    }

    fn url(config: &AgentConfig) -> String {
        config.connection_url(cimple_core::AgentId::new())
    }

    #[tokio::test]
    async fn test_envelopes_travel_as_binary_frames() {
        let (listener, config) = listener().await;

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let frame = ws.next().await.unwrap().unwrap();
            let WsMessage::Binary(data) = frame else {
                panic!("expected binary frame");
            };
            let envelope = Envelope::decode(&data).unwrap();
            ws.send(WsMessage::Text("noise".into())).await.unwrap();
            ws.send(WsMessage::Binary(envelope.encode().unwrap().into()))
                .await
                .unwrap();
            envelope.id
        });

        let connection = ServerConnection::connect(&url(&config), &config).await.unwrap();
        connection
            .send_message(Envelope::new(BuildComplete {}))
            .await
            .unwrap();

        let echoed = connection.read_message().await.unwrap();
        assert!(matches!(echoed.body, Message::BuildComplete(_)));
        assert_eq!(echoed.id, server.await.unwrap());
    }

    #[tokio::test]
    async fn test_server_close_ends_reads_and_writes() {
        let (listener, config) = listener().await;

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            ws.close(None).await.unwrap();
        });

        let connection = ServerConnection::connect(&url(&config), &config).await.unwrap();

        assert!(matches!(connection.read_message().await, Err(Error::ConnectionClosed)));
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(matches!(
            connection.send_message(Envelope::new(BuildComplete {})).await,
            Err(Error::ConnectionClosed)
        ));
        assert!(connection.close().await.is_ok());
    }

    #[tokio::test]
    async fn test_keepalive_sends_pings() {
        let (listener, config) = listener().await;

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            loop {
                match ws.next().await {
                    Some(Ok(WsMessage::Ping(_))) => return true,
                    Some(Ok(_)) => continue,
                    _ => return false,
                }
            }
        });

        let connection = Arc::new(ServerConnection::connect(&url(&config), &config).await.unwrap());
        let keepalive = connection.spawn_keepalive(Duration::from_millis(20));

        assert!(server.await.unwrap());
        connection.close().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), keepalive)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused_is_transport_error() {
        let (listener, config) = listener().await;
        drop(listener);

        let result = ServerConnection::connect(&url(&config), &config).await;
        assert!(matches!(result, Err(Error::Transport(_))));
    }
}
