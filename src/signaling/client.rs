//! WebSocket Client für den Signaling-Server
//!
//! Verwaltet die WebSocket-Verbindung zum Chat-Server:
//! - Handshake (`hello` → `ready`) mit Timeout
//! - Heartbeat-Keeping
//! - Event-basierte Kommunikation über einen Broadcast-Kanal

use super::messages::*;
use super::relay::SignalingRelay;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// Maximale Wartezeit auf `ready`
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum SignalingError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to signaling server")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Server error: {code} - {message}")]
    ServerError { code: i32, message: String },
}

// ============================================================================
// SIGNALING EVENTS
// ============================================================================

/// Events die vom SignalingClient ausgelöst werden
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    Connected,
    Disconnected,

    /// Handshake abgeschlossen
    Ready { user_id: String },

    Roster {
        channel_id: String,
        user_ids: Vec<String>,
    },

    JoinedVoice { channel_id: String, user_id: String },

    LeftVoice { channel_id: String, user_id: String },

    Signal {
        channel_id: String,
        from_user_id: String,
        payload: crate::transport::SignalPayload,
    },

    /// Fehler vom Server
    Error { code: i32, message: String },
}

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ClientState {
    is_connected: bool,
    user_id: Option<String>,
}

type HandshakeSender = Arc<parking_lot::Mutex<Option<oneshot::Sender<Result<String, SignalingError>>>>>;

// ============================================================================
// SIGNALING CLIENT
// ============================================================================

/// WebSocket Client für Signaling-Server Kommunikation
pub struct SignalingClient {
    server_url: url::Url,
    state: Arc<RwLock<ClientState>>,
    tx: Option<mpsc::Sender<String>>,
    event_tx: broadcast::Sender<SignalingEvent>,
}

impl SignalingClient {
    /// Erstellt einen neuen SignalingClient
    pub fn new(server_url: url::Url) -> Self {
        let (event_tx, _) = broadcast::channel(256);

        Self {
            server_url,
            state: Arc::new(RwLock::new(ClientState::default())),
            tx: None,
            event_tx,
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.event_tx.subscribe()
    }

    /// Gibt die angemeldete User-ID zurück (nach dem Handshake)
    pub fn user_id(&self) -> Option<String> {
        self.state.read().user_id.clone()
    }

    /// Prüft ob verbunden
    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }

    /// Verbindet mit dem Signaling-Server und meldet den Benutzer an
    pub async fn connect(&mut self, user_id: &str) -> Result<String, SignalingError> {
        tracing::info!("Connecting to signaling server: {}", self.server_url);

        let (ws_stream, _) = connect_async(self.server_url.as_str())
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        let (tx, mut rx) = mpsc::channel::<String>(256);
        self.tx = Some(tx);

        self.state.write().is_connected = true;
        let _ = self.event_tx.send(SignalingEvent::Connected);

        // Channel für die Handshake-Response
        let (ready_tx, ready_rx) = oneshot::channel();
        let ready_tx: HandshakeSender = Arc::new(parking_lot::Mutex::new(Some(ready_tx)));

        // Read-Task starten
        let state_clone = Arc::clone(&self.state);
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(server_msg) => {
                            Self::handle_server_message(server_msg, &state_clone, &event_tx, &ready_tx)
                        }
                        Err(e) => tracing::debug!("Ignoring unknown server message: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by server");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            state_clone.write().is_connected = false;
            let _ = event_tx.send(SignalingEvent::Disconnected);
        });

        // Write-Task starten
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(Message::Text(msg)).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
        });

        self.send_message(ClientMessage::Hello {
            user_id: user_id.to_string(),
        })
        .await?;

        tokio::select! {
            result = ready_rx => {
                match result {
                    Ok(result) => result,
                    Err(_) => Err(SignalingError::HandshakeFailed("No response".to_string())),
                }
            }
            _ = tokio::time::sleep(HANDSHAKE_TIMEOUT) => {
                Err(SignalingError::HandshakeFailed("Timeout".to_string()))
            }
        }
    }

    /// Sendet eine Nachricht mit aktuellem Timestamp
    pub async fn send_message(&self, message: ClientMessage) -> Result<(), SignalingError> {
        let tx = self.tx.as_ref().ok_or(SignalingError::NotConnected)?;
        if !self.is_connected() {
            return Err(SignalingError::NotConnected);
        }

        let msg_string = serde_json::to_string(&TimestampedMessage::now(&message))
            .map_err(|e| SignalingError::SendFailed(e.to_string()))?;

        tx.send(msg_string)
            .await
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }

    /// Sendet einen Heartbeat
    pub async fn send_heartbeat(&self) -> Result<(), SignalingError> {
        self.send_message(ClientMessage::Heartbeat).await
    }

    /// Schließt die Verbindung; der Write-Task beendet sich danach
    pub fn disconnect(&mut self) {
        self.tx = None;
        self.state.write().is_connected = false;
    }

    /// Verarbeitet eingehende Server-Nachrichten
    fn handle_server_message(
        msg: ServerMessage,
        state: &Arc<RwLock<ClientState>>,
        event_tx: &broadcast::Sender<SignalingEvent>,
        ready_tx: &HandshakeSender,
    ) {
        match msg {
            ServerMessage::Ready { user_id } => {
                tracing::info!("Signaling ready as {}", user_id);
                state.write().user_id = Some(user_id.clone());
                if let Some(tx) = ready_tx.lock().take() {
                    let _ = tx.send(Ok(user_id.clone()));
                }
                let _ = event_tx.send(SignalingEvent::Ready { user_id });
            }

            ServerMessage::VoiceRoster {
                channel_id,
                user_ids,
            } => {
                let _ = event_tx.send(SignalingEvent::Roster {
                    channel_id,
                    user_ids,
                });
            }

            ServerMessage::JoinedVoice {
                channel_id,
                user_id,
            } => {
                let _ = event_tx.send(SignalingEvent::JoinedVoice {
                    channel_id,
                    user_id,
                });
            }

            ServerMessage::LeftVoice {
                channel_id,
                user_id,
            } => {
                let _ = event_tx.send(SignalingEvent::LeftVoice {
                    channel_id,
                    user_id,
                });
            }

            ServerMessage::Signal {
                channel_id,
                from_user_id,
                payload,
            } => {
                let _ = event_tx.send(SignalingEvent::Signal {
                    channel_id,
                    from_user_id,
                    payload,
                });
            }

            ServerMessage::Error { code, message } => {
                tracing::error!("Server error {}: {}", code, message);
                // Fehler vor `ready` beenden den Handshake
                if let Some(tx) = ready_tx.lock().take() {
                    let _ = tx.send(Err(SignalingError::ServerError {
                        code,
                        message: message.clone(),
                    }));
                }
                let _ = event_tx.send(SignalingEvent::Error { code, message });
            }

            ServerMessage::Pong => {
                // Heartbeat-Response - nichts zu tun
            }
        }
    }

    /// Startet einen Heartbeat-Task
    pub fn start_heartbeat(self: Arc<Self>, interval: Duration) {
        let client = Arc::clone(&self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // Erster Tick feuert sofort
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !client.is_connected() {
                    break;
                }
                if let Err(e) = client.send_heartbeat().await {
                    tracing::warn!("Failed to send heartbeat: {}", e);
                }
            }
        });
    }
}

#[async_trait]
impl SignalingRelay for SignalingClient {
    async fn join_voice(&self, channel_id: &str) -> Result<(), SignalingError> {
        self.send_message(ClientMessage::JoinVoice {
            channel_id: channel_id.to_string(),
        })
        .await
    }

    async fn leave_voice(&self, channel_id: &str) -> Result<(), SignalingError> {
        self.send_message(ClientMessage::LeaveVoice {
            channel_id: channel_id.to_string(),
        })
        .await
    }

    async fn send_signal(&self, envelope: SignalEnvelope) -> Result<(), SignalingError> {
        self.send_message(envelope.into()).await
    }
}

impl std::fmt::Debug for SignalingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingClient")
            .field("server_url", &self.server_url.as_str())
            .field("state", &*self.state.read())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SignalPayload;
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    /// Minimaler Server: beantwortet `hello`, leitet alle weiteren
    /// Client-Nachrichten an den Test weiter und sendet `script` nach dem Handshake
    async fn spawn_server(script: Vec<serde_json::Value>) -> (url::Url, mpsc::Receiver<ClientMessage>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (seen_tx, seen_rx) = mpsc::channel(16);

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();

            while let Some(Ok(Message::Text(text))) = ws.next().await {
                let message: ClientMessage = serde_json::from_str(&text).unwrap();
                if let ClientMessage::Hello { user_id } = &message {
                    let ready = json!({ "type": "ready", "userId": user_id });
                    ws.send(Message::Text(ready.to_string())).await.unwrap();
                    for msg in &script {
                        ws.send(Message::Text(msg.to_string())).await.unwrap();
                    }
                    continue;
                }
                if seen_tx.send(message).await.is_err() {
                    break;
                }
            }
        });

        let url = url::Url::parse(&format!("ws://{}/ws", addr)).unwrap();
        (url, seen_rx)
    }

    #[tokio::test]
    async fn test_connect_handshake_and_relay_messages() {
        let (url, mut seen) = spawn_server(vec![]).await;
        let mut client = SignalingClient::new(url);

        let user_id = client.connect("alice").await.unwrap();
        assert_eq!(user_id, "alice");
        assert_eq!(client.user_id().as_deref(), Some("alice"));
        assert!(client.is_connected());

        client.join_voice("c1").await.unwrap();
        client
            .send_signal(SignalEnvelope {
                channel_id: "c1".to_string(),
                to_user_id: "bob".to_string(),
                payload: SignalPayload(json!({ "type": "renegotiate" })),
            })
            .await
            .unwrap();

        assert_eq!(
            seen.recv().await.unwrap(),
            ClientMessage::JoinVoice {
                channel_id: "c1".to_string()
            }
        );
        assert!(matches!(
            seen.recv().await.unwrap(),
            ClientMessage::Signal { ref to_user_id, .. } if to_user_id == "bob"
        ));
    }

    #[tokio::test]
    async fn test_server_messages_become_events() {
        let (url, _seen) = spawn_server(vec![
            json!({ "type": "joined_voice", "channelId": "c1", "userId": "bob" }),
            json!({ "type": "signal", "channelId": "c1", "fromUserId": "bob", "payload": { "type": "renegotiate" } }),
        ])
        .await;
        let mut client = SignalingClient::new(url);
        let mut events = client.subscribe();

        client.connect("alice").await.unwrap();

        let mut received = Vec::new();
        while received.len() < 4 {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap();
            received.push(event);
        }

        assert_eq!(received[0], SignalingEvent::Connected);
        assert_eq!(
            received[1],
            SignalingEvent::Ready {
                user_id: "alice".to_string()
            }
        );
        assert_eq!(
            received[2],
            SignalingEvent::JoinedVoice {
                channel_id: "c1".to_string(),
                user_id: "bob".to_string()
            }
        );
        assert!(matches!(received[3], SignalingEvent::Signal { .. }));
    }

    #[tokio::test]
    async fn test_send_without_connection_fails() {
        let client = SignalingClient::new(url::Url::parse("ws://127.0.0.1:9/ws").unwrap());
        let result = client.join_voice("c1").await;
        assert!(matches!(result, Err(SignalingError::NotConnected)));
    }
}
