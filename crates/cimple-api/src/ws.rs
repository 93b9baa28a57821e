//! Agent websocket endpoint.

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade, rejection::WebSocketUpgradeRejection};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use cimple_core::ids::AgentId;
use cimple_core::messages::Envelope;
use cimple_core::ports::MessageChannel;
use cimple_core::{Error, Result};
use cimple_scheduler::AgentHandle;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::state::AppState;

/// Longest a single frame write may take.
pub const WRITE_WAIT: Duration = Duration::from_secs(10);
/// Longest the agent may stay silent. Agents ping well within this.
pub const PONG_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
pub struct ConnectionParams {
    pub id: Option<String>,
}

/// `GET /agents/connection?id=<uuid>`. The id is checked before upgrading.
pub async fn agent_connection(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ConnectionParams>,
    ws: std::result::Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let agent_id = match params.id.as_deref().map(str::parse::<AgentId>) {
        Some(Ok(id)) => id,
        Some(Err(_)) => return (StatusCode::BAD_REQUEST, "Invalid agent id").into_response(),
        None => return (StatusCode::BAD_REQUEST, "Missing agent id").into_response(),
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    info!(agent_id = %agent_id, "Agent connecting");
    ws.on_upgrade(move |socket| serve_agent(state, agent_id, socket))
}

async fn serve_agent(state: Arc<AppState>, agent_id: AgentId, socket: WebSocket) {
    let connection = Arc::new(AgentSocket::new(socket));
    let mut handle = AgentHandle::new(agent_id, connection);
    if let Some(timeout) = state.perform_timeout {
        handle = handle.with_perform_timeout(timeout);
    }

    if let Err(e) = state.agents.serve(Arc::new(handle)).await {
        warn!(agent_id = %agent_id, error = %e, "Agent connection failed");
    }
}

/// Server side of an agent connection: one bincode envelope per binary
/// frame. Pings from the agent are answered by the websocket layer and
/// count as activity for the read deadline.
pub struct AgentSocket {
    writer: Mutex<SplitSink<WebSocket, WsMessage>>,
    reader: Mutex<SplitStream<WebSocket>>,
    closed: AtomicBool,
    write_wait: Duration,
    pong_wait: Duration,
}

impl AgentSocket {
    pub fn new(socket: WebSocket) -> Self {
        let (writer, reader) = socket.split();
        Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            closed: AtomicBool::new(false),
            write_wait: WRITE_WAIT,
            pong_wait: PONG_WAIT,
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl MessageChannel for AgentSocket {
    async fn send_message(&self, envelope: Envelope) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        debug!(message_id = %envelope.id, kind = %envelope.kind(), "Sending message to agent");
        let bytes = envelope.encode()?;
        let mut writer = self.writer.lock().await;

        match timeout(self.write_wait, writer.send(WsMessage::Binary(bytes.into()))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.mark_closed();
                Err(Error::Transport(e.to_string()))
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

    async fn read_message(&self) -> Result<Envelope> {
        let mut reader = self.reader.lock().await;

        loop {
            let frame = timeout(self.pong_wait, reader.next()).await.map_err(|_| {
                self.mark_closed();
                Error::Transport(format!("Nothing received from agent within {:?}", self.pong_wait))
            })?;

            match frame {
                Some(Ok(WsMessage::Binary(data))) => return Envelope::decode(&data),
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => {}
                Some(Ok(WsMessage::Text(text))) => {
                    warn!(len = text.len(), "Ignoring text frame from agent");
                }
                Some(Ok(WsMessage::Close(_))) | None => {
                    self.mark_closed();
                    return Err(Error::ConnectionClosed);
                }
                Some(Err(e)) => {
                    self.mark_closed();
                    return Err(Error::Transport(e.to_string()));
                }
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut writer = self.writer.lock().await;
        let _ = timeout(self.write_wait, writer.send(WsMessage::Close(None))).await;
        let _ = writer.close().await;
        Ok(())
    }
}
