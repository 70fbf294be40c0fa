//! Media Capture Adapter - Schnittstelle für lokale Geräte
//!
//! Der Voice-Core erwirbt Mikrofon-, Kamera- und Bildschirm-Streams
//! ausschließlich über `MediaCapture`; die cpal-Implementierung liegt
//! in `cpal_backend`.

use super::stream::MediaStream;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum CaptureError {
    #[error("No audio input device found")]
    NoInputDevice,

    #[error("No audio output device found")]
    NoOutputDevice,

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Capture not supported: {0}")]
    Unsupported(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Unsupported audio configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Failed to build media stream: {0}")]
    StreamBuild(String),

    #[error("Failed to start media stream: {0}")]
    StreamPlay(String),

    #[error("Failed to enumerate devices: {0}")]
    Enumerate(String),
}

// ============================================================================
// DEVICES & CONSTRAINTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    AudioInput,
    AudioOutput,
    VideoInput,
}

/// Repräsentiert ein Media-Gerät
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaDevice {
    /// Stabile ID; bei cpal der Gerätename
    pub id: String,
    pub label: String,
    pub kind: DeviceKind,
    pub is_default: bool,
}

/// Anforderungen an Kamera- oder Bildschirmaufnahme
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoConstraints {
    pub device_id: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<u32>,
}

// ============================================================================
// CAPTURE TRAIT
// ============================================================================

#[async_trait]
pub trait MediaCapture: Send + Sync {
    /// Erwirbt einen neuen, unabhängigen Mikrofon-Stream
    async fn acquire_audio(&self, device_id: Option<&str>) -> Result<MediaStream, CaptureError>;

    async fn acquire_video(
        &self,
        constraints: &VideoConstraints,
    ) -> Result<MediaStream, CaptureError>;

    async fn acquire_display(
        &self,
        constraints: &VideoConstraints,
    ) -> Result<MediaStream, CaptureError>;

    async fn enumerate_devices(&self, kind: DeviceKind) -> Result<Vec<MediaDevice>, CaptureError>;
}
