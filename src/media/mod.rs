//! Media Module - lokale Streams, Capture und Playback
//!
//! Dieses Modul verwaltet:
//! - Media Streams / Tracks (Handles mit Enable-Gating)
//! - Capture-Schnittstelle (Mikrofon, Kamera, Bildschirm)
//! - Playback von Remote-Audio
//! - cpal-Backend für Audio I/O

mod capture;
mod cpal_backend;
mod playback;
mod stream;

pub use capture::{CaptureError, DeviceKind, MediaCapture, MediaDevice, VideoConstraints};
pub use cpal_backend::{CpalCapture, CpalRenderer};
pub use playback::{AudioRenderer, RenderSink};
pub use stream::{
    AudioFrame, FramePublisher, MediaStream, MediaTrack, TrackKind, FRAME_SIZE, SAMPLE_RATE,
};
