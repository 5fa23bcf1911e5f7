//! Headless WebSocket client for the board server.
//!
//! Connects with a token, waits for the INITIALIZE snapshot, then lets the
//! caller propose points and follow `UPDATE_STATE` broadcasts. The latest
//! received state is kept so callers can compare boards across clients.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::{ProtocolError, SyncError};
use crate::identity::Identity;
use crate::protocol::{ClientMessage, Envelope, InitializeData, ServerMessage};

/// How long `connect` waits for the INITIALIZE envelope.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A connected board client.
pub struct BoardClient {
    ws: Socket,
    user: Identity,
    settings: Value,
    /// Most recent state: INITIALIZE snapshot, then each UPDATE_STATE
    state: Value,
    updates_received: u64,
}

impl BoardClient {
    /// Connect to `server_url` (e.g. `ws://127.0.0.1:8080`) as `token`.
    pub async fn connect(server_url: &str, token: &str) -> Result<Self, SyncError> {
        let url = format!("{}/?token={token}", server_url.trim_end_matches('/'));
        Self::connect_url(&url).await
    }

    /// Connect to a full URL, token included.
    pub async fn connect_url(url: &str) -> Result<Self, SyncError> {
        let (mut ws, _) = tokio_tungstenite::connect_async(url).await?;
        let init = tokio::time::timeout(HANDSHAKE_TIMEOUT, wait_initialize(&mut ws))
            .await
            .map_err(|_| ProtocolError::Timeout)??;

        log::debug!("Connected as {} ({})", init.user.token, init.user.color);
        Ok(Self {
            ws,
            user: init.user,
            settings: init.settings,
            state: init.state,
            updates_received: 0,
        })
    }

    /// Identity assigned by the server.
    pub fn user(&self) -> &Identity {
        &self.user
    }

    pub fn settings(&self) -> &Value {
        &self.settings
    }

    /// Latest known board state.
    pub fn state(&self) -> &Value {
        &self.state
    }

    pub fn updates_received(&self) -> u64 {
        self.updates_received
    }

    /// Propose a point. The result arrives as an `UPDATE_STATE` broadcast.
    pub async fn add_point(&mut self, data: Value) -> Result<(), SyncError> {
        self.send_envelope(&ClientMessage::AddPoint(data).into_envelope())
            .await
    }

    pub async fn send_envelope(&mut self, envelope: &Envelope) -> Result<(), SyncError> {
        let text = envelope.encode()?;
        self.send_raw(&text).await
    }

    /// Send an arbitrary text frame.
    pub async fn send_raw(&mut self, text: &str) -> Result<(), SyncError> {
        self.ws.send(Message::text(text.to_owned())).await?;
        Ok(())
    }

    /// Wait for the next server envelope.
    pub async fn next_message(&mut self) -> Result<ServerMessage, SyncError> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Text(text))) => return Ok(ServerMessage::decode(text.as_str())?),
                Some(Ok(Message::Close(frame))) => return Err(closed(frame).into()),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => return Err(ProtocolError::ConnectionClosed.into()),
            }
        }
    }

    /// Wait for the next `UPDATE_STATE` and return its state.
    pub async fn next_update(&mut self) -> Result<Value, SyncError> {
        loop {
            if let ServerMessage::UpdateState(state) = self.next_message().await? {
                self.state = state.clone();
                self.updates_received += 1;
                return Ok(state);
            }
        }
    }

    /// Like [`next_update`](Self::next_update) but gives up after `wait`.
    pub async fn next_update_within(&mut self, wait: Duration) -> Result<Option<Value>, SyncError> {
        match tokio::time::timeout(wait, self.next_update()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Close the connection politely.
    pub async fn close(mut self) -> Result<(), SyncError> {
        self.ws.close(None).await?;
        Ok(())
    }
}

async fn wait_initialize(ws: &mut Socket) -> Result<InitializeData, SyncError> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => match ServerMessage::decode(text.as_str())? {
                ServerMessage::Initialize(data) => return Ok(data),
                other => log::debug!("Skipping {:?} before INITIALIZE", other.message_type()),
            },
            Some(Ok(Message::Close(frame))) => return Err(closed(frame).into()),
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
            None => return Err(ProtocolError::ConnectionClosed.into()),
        }
    }
}

fn closed(frame: Option<tokio_tungstenite::tungstenite::protocol::CloseFrame>) -> ProtocolError {
    match frame {
        Some(frame) => ProtocolError::Rejected {
            code: u16::from(frame.code),
            reason: frame.reason.as_str().to_string(),
        },
        None => ProtocolError::ConnectionClosed,
    }
}
