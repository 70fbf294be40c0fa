//! VAD Module - Voice Activity Detection
//!
//! Dieses Modul verwaltet:
//! - Energie-basierte Erkennung von Voice-Start/Stop-Flanken
//! - VAD-Instanzen pro Audio-Stream mit Callbacks

mod detector;
mod monitor;

pub use detector::{VadEdge, VadOptions, VoiceActivityDetector};
pub use monitor::{EnergyVadFactory, VadCallbacks, VadError, VadFactory, VadInstance};
