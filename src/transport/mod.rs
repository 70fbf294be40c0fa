//! Transport Module - Peer-Media-Verbindungen
//!
//! Dieses Modul definiert die Schnittstelle zum Peer Transport (eine
//! Verbindung pro Remote-Teilnehmer) und enthält die webrtc-rs Implementierung.
//!
//! Callbacks des Transports werden nicht direkt ausgeführt, sondern als
//! `TransportEvent` über einen `TransportEventSink` an den Besitzer gemeldet.

mod webrtc_transport;

pub use webrtc_transport::{WebRtcTransport, WebRtcTransportFactory};

use crate::config::IceServer;
use crate::media::{MediaStream, MediaTrack};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("WebRTC error: {0}")]
    WebRTC(String),

    #[error("Invalid signal payload: {0}")]
    InvalidSignal(String),

    #[error("Transport already closed")]
    Closed,
}

// ============================================================================
// TYPES
// ============================================================================

/// Eindeutige ID einer Transport-Instanz (für das Verwerfen veralteter Events)
pub type TransportId = u64;

/// Signaling-Payload; für den Voice-Core undurchsichtig
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignalPayload(pub serde_json::Value);

/// Events die von einem Peer Transport ausgelöst werden
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Lokaler Signaling-Payload, muss an den Remote-Peer weitergeleitet werden
    Signal(SignalPayload),
    /// Remote-Track empfangen
    Track { track: MediaTrack, stream_id: String },
    TrackEnded { track_id: String },
    StreamEnded { stream_id: String },
    Connected,
    Closed,
    Error(String),
}

/// Optionen beim Erstellen eines Transports
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub initiator: bool,
    /// Der höfliche Peer erstellt nie selbst ein Offer, er fordert es per `renegotiate` an
    pub polite: bool,
    pub ice_servers: Vec<IceServer>,
}

type EmitFn = Arc<dyn Fn(TransportId, TransportEvent) + Send + Sync>;

/// Meldet Events einer Transport-Instanz an ihren Besitzer
#[derive(Clone)]
pub struct TransportEventSink {
    id: TransportId,
    emit: EmitFn,
}

impl TransportEventSink {
    pub fn new<F>(id: TransportId, emit: F) -> Self
    where
        F: Fn(TransportId, TransportEvent) + Send + Sync + 'static,
    {
        Self {
            id,
            emit: Arc::new(emit),
        }
    }

    pub fn id(&self) -> TransportId {
        self.id
    }

    pub fn emit(&self, event: TransportEvent) {
        (self.emit)(self.id, event);
    }
}

impl fmt::Debug for TransportEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportEventSink")
            .field("id", &self.id)
            .finish()
    }
}

// ============================================================================
// TRAITS
// ============================================================================

#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Wendet einen eingehenden Signaling-Payload an
    async fn signal(&self, payload: SignalPayload) -> Result<(), TransportError>;

    async fn add_stream(&self, stream: &MediaStream) -> Result<(), TransportError>;

    async fn remove_stream(&self, stream: &MediaStream) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        options: TransportOptions,
        events: TransportEventSink,
    ) -> Result<Box<dyn PeerTransport>, TransportError>;
}
