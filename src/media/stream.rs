//! Media Streams und Tracks
//!
//! Ein `MediaTrack` ist ein günstig klonbarer Handle (Arc) auf einen lokalen
//! oder entfernten Track. Audio-Tracks verteilen PCM-Frames über einen
//! Broadcast-Kanal, damit VAD und Playback unabhängig mitlesen können.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, watch};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate (48kHz ist der Standard für WebRTC Audio)
pub const SAMPLE_RATE: u32 = 48000;

/// Frame Size in Samples (20ms @ 48kHz = 960 samples)
pub const FRAME_SIZE: usize = 960;

/// Anzahl gepufferter Frames pro Track-Abonnent
const FRAME_CHANNEL_CAPACITY: usize = 64;

/// Ein Frame Mono-PCM (f32, 48kHz)
pub type AudioFrame = Arc<[f32]>;

type StopHook = Box<dyn FnOnce() + Send>;

// ============================================================================
// MEDIA TRACK
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

struct TrackInner {
    id: String,
    kind: TrackKind,
    label: String,
    enabled: AtomicBool,
    ended: watch::Sender<bool>,
    frames: broadcast::Sender<AudioFrame>,
    stop_hook: Mutex<Option<StopHook>>,
}

/// Handle auf einen einzelnen Media Track
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    /// Erstellt einen Track mit zufälliger ID
    pub fn new(kind: TrackKind, label: impl Into<String>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), kind, label)
    }

    /// Erstellt einen Track mit vorgegebener ID (z.B. Remote-Track-ID)
    pub fn with_id(id: impl Into<String>, kind: TrackKind, label: impl Into<String>) -> Self {
        let (ended, _) = watch::channel(false);
        let (frames, _) = broadcast::channel(FRAME_CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(TrackInner {
                id: id.into(),
                kind,
                label: label.into(),
                enabled: AtomicBool::new(true),
                ended,
                frames,
                stop_hook: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    /// Aktiviert/deaktiviert den Track. Deaktivierte Tracks liefern keine Frames.
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_ended(&self) -> bool {
        *self.inner.ended.borrow()
    }

    /// Registriert die Freigabe des zugrundeliegenden Geräts beim Stoppen
    pub fn set_stop_hook<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        *self.inner.stop_hook.lock() = Some(Box::new(hook));
    }

    /// Stoppt den Track endgültig (idempotent)
    pub fn stop(&self) {
        let was_ended = self.inner.ended.send_replace(true);
        if was_ended {
            return;
        }
        if let Some(hook) = self.inner.stop_hook.lock().take() {
            hook();
        }
        tracing::debug!(track = %self.inner.id, "Track stopped");
    }

    /// Wartet bis der Track beendet wurde
    pub async fn ended(&self) {
        let mut rx = self.inner.ended.subscribe();
        let _ = rx.wait_for(|ended| *ended).await;
    }

    /// Veröffentlicht einen PCM-Frame an alle Abonnenten
    pub fn publish_frame(&self, frame: AudioFrame) {
        if !self.is_enabled() || self.is_ended() {
            return;
        }
        // Kein Abonnent ist kein Fehler
        let _ = self.inner.frames.send(frame);
    }

    pub fn subscribe_frames(&self) -> broadcast::Receiver<AudioFrame> {
        self.inner.frames.subscribe()
    }

    /// Schwacher Publisher für Capture-Threads; hält den Track nicht am Leben
    pub fn frame_publisher(&self) -> FramePublisher {
        FramePublisher {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Prüft ob beide Handles auf denselben Track zeigen
    pub fn same_track(&self, other: &MediaTrack) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("enabled", &self.is_enabled())
            .field("ended", &self.is_ended())
            .finish()
    }
}

/// Schreibt Frames in einen Track, solange dieser noch existiert
#[derive(Clone)]
pub struct FramePublisher {
    inner: Weak<TrackInner>,
}

impl FramePublisher {
    /// Gibt `false` zurück sobald der Track verworfen oder gestoppt wurde
    pub fn publish(&self, frame: AudioFrame) -> bool {
        match self.inner.upgrade() {
            Some(inner) => {
                let track = MediaTrack { inner };
                if track.is_ended() {
                    return false;
                }
                track.publish_frame(frame);
                true
            }
            None => false,
        }
    }
}

// ============================================================================
// MEDIA STREAM
// ============================================================================

/// Gruppe von Tracks mit gemeinsamer Stream-ID
#[derive(Debug, Clone)]
pub struct MediaStream {
    id: String,
    tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), tracks)
    }

    pub fn with_id(id: impl Into<String>, tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Audio)
    }

    pub fn video_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Video)
    }

    pub fn has_video(&self) -> bool {
        self.video_tracks().next().is_some()
    }

    /// Nicht leer und ausschließlich Audio-Tracks
    pub fn is_audio_only(&self) -> bool {
        !self.tracks.is_empty() && !self.has_video()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn contains_track(&self, track_id: &str) -> bool {
        self.tracks.iter().any(|t| t.id() == track_id)
    }

    /// Fügt einen Track hinzu; gibt `false` zurück wenn er schon enthalten ist
    pub fn add_track(&mut self, track: MediaTrack) -> bool {
        if self.contains_track(track.id()) {
            return false;
        }
        self.tracks.push(track);
        true
    }

    pub fn remove_track(&mut self, track_id: &str) -> Option<MediaTrack> {
        let idx = self.tracks.iter().position(|t| t.id() == track_id)?;
        Some(self.tracks.remove(idx))
    }

    pub fn set_audio_enabled(&self, enabled: bool) {
        for track in self.audio_tracks() {
            track.set_enabled(enabled);
        }
    }

    /// Stoppt alle Tracks und gibt damit die Geräte frei
    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_stop_runs_hook_once() {
        let track = MediaTrack::new(TrackKind::Audio, "mic");
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        track.set_stop_hook(move || {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        track.stop();
        track.stop();

        assert!(track.is_ended());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disabled_track_publishes_nothing() {
        let track = MediaTrack::new(TrackKind::Audio, "mic");
        let mut rx = track.subscribe_frames();

        track.set_enabled(false);
        track.publish_frame(Arc::from(vec![0.5f32; 4]));
        track.set_enabled(true);
        track.publish_frame(Arc::from(vec![0.25f32; 4]));

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame[0], 0.25);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_ended_resolves_after_stop() {
        let track = MediaTrack::new(TrackKind::Video, "screen");
        let waiter = {
            let track = track.clone();
            tokio::spawn(async move { track.ended().await })
        };
        track.stop();
        waiter.await.unwrap();
    }

    #[test]
    fn test_stream_classification() {
        let mut stream = MediaStream::with_id("s1", vec![]);
        assert!(!stream.is_audio_only());

        assert!(stream.add_track(MediaTrack::with_id("t1", TrackKind::Audio, "a")));
        assert!(!stream.add_track(MediaTrack::with_id("t1", TrackKind::Audio, "a")));
        assert!(stream.is_audio_only());

        stream.add_track(MediaTrack::with_id("t2", TrackKind::Video, "v"));
        assert!(stream.has_video());
        assert!(!stream.is_audio_only());

        assert!(stream.remove_track("t2").is_some());
        assert!(stream.remove_track("t2").is_none());
        assert_eq!(stream.tracks().len(), 1);
    }
}
