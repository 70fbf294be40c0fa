//! In-Memory-Fakes für Capture, Transport, Signaling, VAD und Playback

use crate::config::VoiceConfig;
use crate::media::{
    AudioRenderer, CaptureError, DeviceKind, MediaCapture, MediaDevice, MediaStream, MediaTrack,
    RenderSink, TrackKind, VideoConstraints,
};
use crate::signaling::{SignalEnvelope, SignalingError, SignalingRelay};
use crate::transport::{
    PeerTransport, SignalPayload, TransportError, TransportEvent, TransportEventSink,
    TransportFactory, TransportOptions,
};
use crate::vad::{VadCallbacks, VadError, VadFactory, VadInstance, VadOptions};
use crate::voice::{VoiceCoordinator, VoiceDeps};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

// ============================================================================
// CAPTURE
// ============================================================================

#[derive(Default)]
pub struct FakeCapture {
    pub fail_audio: AtomicBool,
    pub acquired: Mutex<Vec<MediaStream>>,
}

#[async_trait]
impl MediaCapture for FakeCapture {
    async fn acquire_audio(&self, _device_id: Option<&str>) -> Result<MediaStream, CaptureError> {
        if self.fail_audio.load(Ordering::SeqCst) {
            return Err(CaptureError::PermissionDenied("microphone".to_string()));
        }
        let stream = MediaStream::new(vec![MediaTrack::new(TrackKind::Audio, "fake-mic")]);
        self.acquired.lock().push(stream.clone());
        Ok(stream)
    }

    async fn acquire_video(&self, _constraints: &VideoConstraints) -> Result<MediaStream, CaptureError> {
        let stream = MediaStream::new(vec![MediaTrack::new(TrackKind::Video, "fake-cam")]);
        self.acquired.lock().push(stream.clone());
        Ok(stream)
    }

    async fn acquire_display(&self, _constraints: &VideoConstraints) -> Result<MediaStream, CaptureError> {
        let stream = MediaStream::new(vec![MediaTrack::new(TrackKind::Video, "fake-screen")]);
        self.acquired.lock().push(stream.clone());
        Ok(stream)
    }

    async fn enumerate_devices(&self, kind: DeviceKind) -> Result<Vec<MediaDevice>, CaptureError> {
        Ok(vec![MediaDevice {
            id: "fake".to_string(),
            label: "Fake Device".to_string(),
            kind,
            is_default: true,
        }])
    }
}

// ============================================================================
// TRANSPORT
// ============================================================================

pub struct FakeTransportState {
    pub options: TransportOptions,
    pub sink: TransportEventSink,
    pub signals: Mutex<Vec<SignalPayload>>,
    pub added: Mutex<Vec<String>>,
    pub removed: Mutex<Vec<String>>,
    pub closed: AtomicBool,
}

impl FakeTransportState {
    pub fn emit(&self, event: TransportEvent) {
        self.sink.emit(event);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct FakeTransport {
    state: Arc<FakeTransportState>,
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn signal(&self, payload: SignalPayload) -> Result<(), TransportError> {
        self.state.signals.lock().push(payload);
        Ok(())
    }

    async fn add_stream(&self, stream: &MediaStream) -> Result<(), TransportError> {
        self.state.added.lock().push(stream.id().to_string());
        Ok(())
    }

    async fn remove_stream(&self, stream: &MediaStream) -> Result<(), TransportError> {
        self.state.removed.lock().push(stream.id().to_string());
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.state.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeTransportFactory {
    pub fail: AtomicBool,
    created: Mutex<Vec<Arc<FakeTransportState>>>,
}

impl FakeTransportFactory {
    pub fn created(&self) -> Vec<Arc<FakeTransportState>> {
        self.created.lock().clone()
    }

    pub fn live(&self) -> usize {
        self.created.lock().iter().filter(|t| !t.is_closed()).count()
    }

    /// Zuletzt erstellter Transport
    pub fn last(&self) -> Arc<FakeTransportState> {
        self.created
            .lock()
            .last()
            .cloned()
            .expect("no transport created")
    }
}

#[async_trait]
impl TransportFactory for FakeTransportFactory {
    async fn create(
        &self,
        options: TransportOptions,
        events: TransportEventSink,
    ) -> Result<Box<dyn PeerTransport>, TransportError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(TransportError::WebRTC("fake failure".to_string()));
        }
        let state = Arc::new(FakeTransportState {
            options,
            sink: events,
            signals: Mutex::new(Vec::new()),
            added: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        self.created.lock().push(Arc::clone(&state));
        Ok(Box::new(FakeTransport { state }))
    }
}

// ============================================================================
// SIGNALING
// ============================================================================

#[derive(Default)]
pub struct FakeRelay {
    pub joined: Mutex<Vec<String>>,
    pub left: Mutex<Vec<String>>,
    pub signals: Mutex<Vec<SignalEnvelope>>,
    pub fail_leave: AtomicBool,
    /// Wenn gesetzt, blockiert `join_voice` bis `release` benachrichtigt wird
    pub join_gate: Mutex<Option<(Arc<Notify>, Arc<Notify>)>>,
}

impl FakeRelay {
    /// Gibt (entered, release) zurück
    pub fn gate_joins(&self) -> (Arc<Notify>, Arc<Notify>) {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        *self.join_gate.lock() = Some((Arc::clone(&entered), Arc::clone(&release)));
        (entered, release)
    }
}

#[async_trait]
impl SignalingRelay for FakeRelay {
    async fn join_voice(&self, channel_id: &str) -> Result<(), SignalingError> {
        self.joined.lock().push(channel_id.to_string());
        let gate = self.join_gate.lock().clone();
        if let Some((entered, release)) = gate {
            entered.notify_one();
            release.notified().await;
        }
        Ok(())
    }

    async fn leave_voice(&self, channel_id: &str) -> Result<(), SignalingError> {
        self.left.lock().push(channel_id.to_string());
        if self.fail_leave.load(Ordering::SeqCst) {
            return Err(SignalingError::NotConnected);
        }
        Ok(())
    }

    async fn send_signal(&self, envelope: SignalEnvelope) -> Result<(), SignalingError> {
        self.signals.lock().push(envelope);
        Ok(())
    }
}

// ============================================================================
// VAD
// ============================================================================

pub struct FakeVadCreation {
    pub stream_id: String,
    pub options: VadOptions,
    pub callbacks: VadCallbacks,
}

#[derive(Default)]
pub struct FakeVadFactory {
    pub fail: AtomicBool,
    live: Arc<AtomicUsize>,
    created: Mutex<Vec<FakeVadCreation>>,
}

impl FakeVadFactory {
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn created(&self) -> usize {
        self.created.lock().len()
    }

    pub fn stream_of(&self, index: usize) -> String {
        self.created.lock()[index].stream_id.clone()
    }

    pub fn options_of(&self, index: usize) -> VadOptions {
        self.created.lock()[index].options
    }

    pub fn voice_start(&self, index: usize) {
        let callbacks = self.created.lock()[index].callbacks.clone();
        callbacks.voice_start();
    }

    pub fn voice_stop(&self, index: usize) {
        let callbacks = self.created.lock()[index].callbacks.clone();
        callbacks.voice_stop();
    }
}

struct FakeVad {
    live: Arc<AtomicUsize>,
}

impl VadInstance for FakeVad {
    fn destroy(self: Box<Self>) {}
}

impl Drop for FakeVad {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl VadFactory for FakeVadFactory {
    fn create(
        &self,
        stream: &MediaStream,
        options: VadOptions,
        callbacks: VadCallbacks,
    ) -> Result<Box<dyn VadInstance>, VadError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(VadError::NoAudioTrack(stream.id().to_string()));
        }
        self.live.fetch_add(1, Ordering::SeqCst);
        self.created.lock().push(FakeVadCreation {
            stream_id: stream.id().to_string(),
            options,
            callbacks,
        });
        Ok(Box::new(FakeVad {
            live: Arc::clone(&self.live),
        }))
    }
}

// ============================================================================
// PLAYBACK
// ============================================================================

#[derive(Default)]
pub struct FakeRenderer {
    live: Arc<AtomicUsize>,
    muted: Arc<Mutex<Vec<(String, bool)>>>,
}

impl FakeRenderer {
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Letzter Mute-Zustand pro gebundenem Stream
    pub fn muted(&self, stream_id: &str) -> Option<bool> {
        self.muted
            .lock()
            .iter()
            .rev()
            .find(|(id, _)| id == stream_id)
            .map(|(_, muted)| *muted)
    }
}

struct FakeSink {
    stream_id: String,
    live: Arc<AtomicUsize>,
    muted: Arc<Mutex<Vec<(String, bool)>>>,
}

impl RenderSink for FakeSink {
    fn stream_id(&self) -> &str {
        &self.stream_id
    }

    fn set_muted(&self, muted: bool) {
        self.muted.lock().push((self.stream_id.clone(), muted));
    }

    fn detach(self: Box<Self>) {}
}

impl Drop for FakeSink {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl AudioRenderer for FakeRenderer {
    fn bind(&self, stream: &MediaStream) -> Result<Box<dyn RenderSink>, CaptureError> {
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSink {
            stream_id: stream.id().to_string(),
            live: Arc::clone(&self.live),
            muted: Arc::clone(&self.muted),
        }))
    }
}

// ============================================================================
// HARNESS
// ============================================================================

#[derive(Clone)]
pub struct Fakes {
    pub capture: Arc<FakeCapture>,
    pub transports: Arc<FakeTransportFactory>,
    pub relay: Arc<FakeRelay>,
    pub vads: Arc<FakeVadFactory>,
    pub renderer: Arc<FakeRenderer>,
}

impl Fakes {
    pub fn new() -> Self {
        Self {
            capture: Arc::new(FakeCapture::default()),
            transports: Arc::new(FakeTransportFactory::default()),
            relay: Arc::new(FakeRelay::default()),
            vads: Arc::new(FakeVadFactory::default()),
            renderer: Arc::new(FakeRenderer::default()),
        }
    }

    pub fn deps(&self) -> VoiceDeps {
        VoiceDeps {
            capture: self.capture.clone(),
            transports: self.transports.clone(),
            vads: self.vads.clone(),
            renderer: self.renderer.clone(),
            relay: self.relay.clone(),
        }
    }
}

/// Coordinator mit Fakes für den lokalen Benutzer `local`
pub fn coordinator(local: &str) -> (VoiceCoordinator, Fakes) {
    let fakes = Fakes::new();
    let coordinator = VoiceCoordinator::new(VoiceConfig::default(), local, fakes.deps());
    (coordinator, fakes)
}

pub fn remote_track(kind: TrackKind, id: &str) -> MediaTrack {
    MediaTrack::with_id(id, kind, "remote")
}
