//! Pulse Voice - Multi-Party Voice/Video Calls
//!
//! Orchestriert Voice-Channels eines Chat-Clients:
//! - WebSocket-Signaling über den Chat-Server
//! - Eine WebRTC-Verbindung pro Teilnehmer (Mesh)
//! - Mikrofon mit Voice Activity Detection, Kamera und Screen-Share
//! - Mute/Deafen und Sprechanzeige pro Teilnehmer

pub mod config;
pub mod media;
pub mod signaling;
pub mod transport;
pub mod vad;
pub mod voice;

#[cfg(test)]
mod testing;

pub use config::{ConfigError, VoiceConfig};
pub use signaling::{SignalingClient, SignalingEvent};
pub use voice::{VoiceCoordinator, VoiceDeps, VoiceError, VoiceHandle, VoiceService, VoiceSnapshot};

/// Initialisiert das Logging (`RUST_LOG` überschreibt die Standard-Filter)
pub fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("pulse_voice=debug,webrtc=warn"));

    // Ein zweiter Aufruf (z.B. in Tests) ist kein Fehler
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
