//! Peer-Connection-Datensätze
//!
//! Ein `PeerConnection` existiert pro Remote-Teilnehmer eines Channels.
//! Remote-Tracks werden nach Stream-Identität in `StreamBundle`s gruppiert:
//! ein reines Audio-Bundle bekommt VAD und Playback, ein Bundle mit
//! Video-Track gilt als Kamera/Bildschirm.

use super::events::VadId;
use crate::media::{MediaStream, MediaTrack, RenderSink};
use crate::transport::{PeerTransport, TransportId};
use crate::vad::VadInstance;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PeerStatus {
    Connecting,
    Connected,
    Disconnected,
    /// Endzustand; der Datensatz wird danach entfernt
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BundleKind {
    Audio,
    Video,
}

/// Alle Tracks eines Remote-Streams
#[derive(Debug, Clone)]
pub struct StreamBundle {
    stream: MediaStream,
}

impl StreamBundle {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream: MediaStream::with_id(stream_id, Vec::new()),
        }
    }

    pub fn stream_id(&self) -> &str {
        self.stream.id()
    }

    pub fn stream(&self) -> &MediaStream {
        &self.stream
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        self.stream.tracks()
    }

    pub fn kind(&self) -> BundleKind {
        if self.stream.has_video() {
            BundleKind::Video
        } else {
            BundleKind::Audio
        }
    }

    pub(crate) fn stream_mut(&mut self) -> &mut MediaStream {
        &mut self.stream
    }
}

pub(crate) struct TransportSlot {
    pub id: TransportId,
    pub handle: Box<dyn PeerTransport>,
}

pub(crate) struct RemoteVad {
    pub id: VadId,
    pub stream_id: String,
    pub instance: Box<dyn VadInstance>,
}

pub struct PeerConnection {
    channel_id: String,
    user_id: String,
    pub(crate) status: PeerStatus,
    pub(crate) transport: Option<TransportSlot>,
    pub(crate) bundles: Vec<StreamBundle>,
    pub(crate) remote_vad: Option<RemoteVad>,
    pub(crate) voice_activity: bool,
    pub(crate) render_sink: Option<Box<dyn RenderSink>>,
}

impl PeerConnection {
    pub fn new(channel_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            user_id: user_id.into(),
            status: PeerStatus::Connecting,
            transport: None,
            bundles: Vec::new(),
            remote_vad: None,
            voice_activity: false,
            render_sink: None,
        }
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn status(&self) -> PeerStatus {
        self.status
    }

    pub fn has_transport(&self) -> bool {
        self.transport.is_some()
    }

    pub fn transport_id(&self) -> Option<TransportId> {
        self.transport.as_ref().map(|t| t.id)
    }

    pub fn bundles(&self) -> &[StreamBundle] {
        &self.bundles
    }

    pub fn voice_activity(&self) -> bool {
        self.voice_activity
    }

    pub fn has_remote_vad(&self) -> bool {
        self.remote_vad.is_some()
    }

    /// Stream-ID des gebundenen Playbacks
    pub fn render_stream_id(&self) -> Option<&str> {
        self.render_sink.as_ref().map(|sink| sink.stream_id())
    }

    /// Zuletzt hinzugefügtes Bundle der gewünschten Art
    pub fn active_bundle(&self, kind: BundleKind) -> Option<&StreamBundle> {
        self.bundles.iter().rev().find(|b| b.kind() == kind)
    }

    pub fn mic_enabled(&self) -> bool {
        self.active_bundle(BundleKind::Audio)
            .map(|b| b.stream().audio_tracks().any(|t| t.is_enabled() && !t.is_ended()))
            .unwrap_or(false)
    }

    pub fn video_enabled(&self) -> bool {
        self.active_bundle(BundleKind::Video).is_some()
    }

    pub(crate) fn bundle_index(&self, stream_id: &str) -> Option<usize> {
        self.bundles.iter().position(|b| b.stream_id() == stream_id)
    }

    /// Entfernt VAD und Sprachaktivität
    pub(crate) fn clear_remote_vad(&mut self) {
        if let Some(vad) = self.remote_vad.take() {
            tracing::debug!(user = %self.user_id, vad = vad.id, "Remote VAD destroyed");
            vad.instance.destroy();
        }
        self.voice_activity = false;
    }

    pub(crate) fn detach_render_sink(&mut self) {
        if let Some(sink) = self.render_sink.take() {
            sink.detach();
        }
    }

    /// Räumt alles auf, was an einem Stream hängt
    pub(crate) fn release_stream(&mut self, stream_id: &str) {
        if self.remote_vad.as_ref().map(|v| v.stream_id.as_str()) == Some(stream_id) {
            self.clear_remote_vad();
        }
        if self.render_stream_id() == Some(stream_id) {
            self.detach_render_sink();
        }
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("channel_id", &self.channel_id)
            .field("user_id", &self.user_id)
            .field("status", &self.status)
            .field("transport", &self.transport_id())
            .field("bundles", &self.bundles)
            .field("remote_vad", &self.remote_vad.as_ref().map(|v| v.id))
            .field("voice_activity", &self.voice_activity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::TrackKind;

    #[test]
    fn test_bundle_kind_follows_tracks() {
        let mut bundle = StreamBundle::new("s1");
        bundle
            .stream_mut()
            .add_track(MediaTrack::new(TrackKind::Audio, "a"));
        assert_eq!(bundle.kind(), BundleKind::Audio);

        bundle
            .stream_mut()
            .add_track(MediaTrack::new(TrackKind::Video, "v"));
        assert_eq!(bundle.kind(), BundleKind::Video);
    }

    #[test]
    fn test_active_bundle_prefers_latest() {
        let mut peer = PeerConnection::new("c1", "bob");
        for id in ["s1", "s2"] {
            let mut bundle = StreamBundle::new(id);
            bundle
                .stream_mut()
                .add_track(MediaTrack::new(TrackKind::Video, "v"));
            peer.bundles.push(bundle);
        }
        assert_eq!(
            peer.active_bundle(BundleKind::Video).map(|b| b.stream_id()),
            Some("s2")
        );
        assert!(peer.active_bundle(BundleKind::Audio).is_none());
        assert!(peer.video_enabled());
        assert!(!peer.mic_enabled());
    }

    #[test]
    fn test_status_serializes_uppercase() {
        let json = serde_json::to_string(&PeerStatus::Disconnected).unwrap();
        assert_eq!(json, "\"DISCONNECTED\"");
    }
}
