//! Lokale Voice-Session
//!
//! Höchstens eine Session existiert gleichzeitig. Sie besitzt alle lokalen
//! Capture-Streams; Transports referenzieren sie nur.

use super::events::VadId;
use crate::media::MediaStream;
use crate::vad::VadInstance;

/// Lokale VAD mit eigenem Capture-Stream (unabhängig vom gesendeten Mikrofon)
pub(crate) struct LocalVad {
    pub id: VadId,
    pub instance: Box<dyn VadInstance>,
    pub capture: MediaStream,
}

pub struct VoiceSession {
    channel_id: String,
    pub(crate) mic_stream: Option<MediaStream>,
    pub(crate) video_stream: Option<MediaStream>,
    pub(crate) vad: Option<LocalVad>,
    pub(crate) muted: bool,
    pub(crate) deafened: bool,
    pub(crate) voice_activity: bool,
}

impl VoiceSession {
    /// Neue Session; Medien starten stummgeschaltet
    pub fn new(channel_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            mic_stream: None,
            video_stream: None,
            vad: None,
            muted: true,
            deafened: false,
            voice_activity: false,
        }
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn mic_stream(&self) -> Option<&MediaStream> {
        self.mic_stream.as_ref()
    }

    /// Kamera- oder Bildschirm-Stream
    pub fn video_stream(&self) -> Option<&MediaStream> {
        self.video_stream.as_ref()
    }

    pub fn vad_capture_stream(&self) -> Option<&MediaStream> {
        self.vad.as_ref().map(|vad| &vad.capture)
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn is_deafened(&self) -> bool {
        self.deafened
    }

    /// Eigene Sprachaktivität; beim Deafen unterdrückt
    pub fn voice_activity(&self) -> bool {
        self.voice_activity && !self.deafened
    }

    pub fn mic_enabled(&self) -> bool {
        self.mic_stream.is_some() && !self.muted
    }

    pub fn video_enabled(&self) -> bool {
        self.video_stream.is_some()
    }

    /// Streams, die an jeden Transport gehängt werden
    pub fn outgoing_streams(&self) -> impl Iterator<Item = &MediaStream> {
        self.mic_stream.iter().chain(self.video_stream.iter())
    }

    pub(crate) fn destroy_vad(&mut self) {
        if let Some(vad) = self.vad.take() {
            vad.instance.destroy();
            vad.capture.stop();
            tracing::debug!(vad = vad.id, "Local VAD destroyed");
        }
        self.voice_activity = false;
    }

    /// Stoppt alle lokalen Streams und die VAD
    pub(crate) fn release_media(&mut self) {
        if let Some(mic) = self.mic_stream.take() {
            mic.stop();
        }
        if let Some(video) = self.video_stream.take() {
            video.stop();
        }
        self.destroy_vad();
        self.muted = true;
    }
}

impl std::fmt::Debug for VoiceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceSession")
            .field("channel_id", &self.channel_id)
            .field("mic_stream", &self.mic_stream.as_ref().map(|s| s.id()))
            .field("video_stream", &self.video_stream.as_ref().map(|s| s.id()))
            .field("vad", &self.vad.as_ref().map(|v| v.id))
            .field("muted", &self.muted)
            .field("deafened", &self.deafened)
            .field("voice_activity", &self.voice_activity)
            .finish()
    }
}
