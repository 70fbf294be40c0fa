//! Message Types für das Voice-Signaling-Protokoll
//!
//! Alle Nachrichten sind JSON-Objekte mit einem `type`-Feld. Feldnamen
//! verwenden camelCase, wie sie der Chat-Server erwartet. Signaling-Payloads
//! werden vom Server unverändert zwischen den Teilnehmern weitergereicht.

use crate::transport::SignalPayload;
use serde::{Deserialize, Serialize};

// ============================================================================
// CLIENT → SERVER MESSAGES
// ============================================================================

/// Alle Client-Nachrichten
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Anmeldung der Verbindung für einen Benutzer
    Hello {
        #[serde(rename = "userId")]
        user_id: String,
    },

    /// Lokaler Benutzer betritt einen Voice-Channel
    JoinVoice {
        #[serde(rename = "channelId")]
        channel_id: String,
    },

    /// Lokaler Benutzer verlässt einen Voice-Channel
    LeaveVoice {
        #[serde(rename = "channelId")]
        channel_id: String,
    },

    /// Signaling-Payload an einen Teilnehmer
    Signal {
        #[serde(rename = "channelId")]
        channel_id: String,
        #[serde(rename = "toUserId")]
        to_user_id: String,
        payload: SignalPayload,
    },

    Heartbeat,
}

/// Client-Nachricht mit Sendezeitpunkt
#[derive(Debug, Clone, Serialize)]
pub struct TimestampedMessage<'a> {
    #[serde(flatten)]
    pub message: &'a ClientMessage,
    pub timestamp: i64,
}

impl<'a> TimestampedMessage<'a> {
    pub fn now(message: &'a ClientMessage) -> Self {
        Self {
            message,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

// ============================================================================
// SERVER → CLIENT MESSAGES
// ============================================================================

/// Alle möglichen Server-Nachrichten
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Antwort auf `hello`
    Ready {
        #[serde(rename = "userId")]
        user_id: String,
    },

    /// Vollständige Teilnehmerliste eines Voice-Channels
    VoiceRoster {
        #[serde(rename = "channelId")]
        channel_id: String,
        #[serde(rename = "userIds")]
        user_ids: Vec<String>,
    },

    /// Teilnehmer hat einen Voice-Channel betreten
    JoinedVoice {
        #[serde(rename = "channelId")]
        channel_id: String,
        #[serde(rename = "userId")]
        user_id: String,
    },

    /// Teilnehmer hat einen Voice-Channel verlassen
    LeftVoice {
        #[serde(rename = "channelId")]
        channel_id: String,
        #[serde(rename = "userId")]
        user_id: String,
    },

    /// Eingehender Signaling-Payload
    Signal {
        #[serde(rename = "channelId")]
        channel_id: String,
        #[serde(rename = "fromUserId")]
        from_user_id: String,
        payload: SignalPayload,
    },

    /// Fehler
    Error { code: i32, message: String },

    /// Heartbeat Antwort
    Pong,
}

// ============================================================================
// HELPER TYPES
// ============================================================================

/// Ausgehender Signaling-Payload an genau einen Teilnehmer
#[derive(Debug, Clone, PartialEq)]
pub struct SignalEnvelope {
    pub channel_id: String,
    pub to_user_id: String,
    pub payload: SignalPayload,
}

impl From<SignalEnvelope> for ClientMessage {
    fn from(envelope: SignalEnvelope) -> Self {
        ClientMessage::Signal {
            channel_id: envelope.channel_id,
            to_user_id: envelope.to_user_id,
            payload: envelope.payload,
        }
    }
}
