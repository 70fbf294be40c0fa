//! Voice Session Coordinator
//!
//! Einziger Besitzer der lokalen `VoiceSession` und des `PeerConnectionManager`.
//! Alle Zustandsänderungen laufen über `&mut self`; Transport- und VAD-Callbacks
//! kommen als `VoiceEvent` über `next_event` herein. Nach jedem logischen
//! Ereignis wird genau ein `VoiceSnapshot` veröffentlicht.

use super::events::{EventSender, VoiceEvent};
use super::manager::PeerConnectionManager;
use super::peer::{BundleKind, PeerConnection, StreamBundle};
use super::session::{LocalVad, VoiceSession};
use super::snapshot::VoiceSnapshot;
use crate::config::{ConfigError, VoiceConfig};
use crate::media::{
    AudioRenderer, CaptureError, DeviceKind, MediaCapture, MediaDevice, MediaStream, VideoConstraints,
};
use crate::signaling::{SignalingError, SignalingEvent, SignalingRelay};
use crate::transport::{TransportError, TransportFactory};
use crate::vad::{VadError, VadFactory};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("VAD error: {0}")]
    Vad(#[from] VadError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Not in a voice channel")]
    NotInChannel,

    #[error("Another join/leave is still in progress")]
    TransitionInProgress,

    #[error("Voice service stopped")]
    ServiceStopped,
}

// ============================================================================
// DEPENDENCIES
// ============================================================================

/// Externe Kollaborateure des Voice-Cores
#[derive(Clone)]
pub struct VoiceDeps {
    pub capture: Arc<dyn MediaCapture>,
    pub transports: Arc<dyn TransportFactory>,
    pub vads: Arc<dyn VadFactory>,
    pub renderer: Arc<dyn AudioRenderer>,
    pub relay: Arc<dyn SignalingRelay>,
}

// ============================================================================
// COORDINATOR
// ============================================================================

pub struct VoiceCoordinator {
    config: VoiceConfig,
    local_user_id: String,
    capture: Arc<dyn MediaCapture>,
    vads: Arc<dyn VadFactory>,
    relay: Arc<dyn SignalingRelay>,
    manager: PeerConnectionManager,
    session: Option<VoiceSession>,
    events: EventSender,
    events_rx: mpsc::UnboundedReceiver<VoiceEvent>,
    snapshot_tx: watch::Sender<VoiceSnapshot>,
}

impl VoiceCoordinator {
    pub fn new(config: VoiceConfig, local_user_id: impl Into<String>, deps: VoiceDeps) -> Self {
        let local_user_id = local_user_id.into();
        let (events, events_rx) = EventSender::channel();
        let manager = PeerConnectionManager::new(
            local_user_id.clone(),
            &config,
            deps.transports,
            deps.vads.clone(),
            deps.renderer,
            deps.relay.clone(),
            events.clone(),
        );
        let (snapshot_tx, _) = watch::channel(VoiceSnapshot::empty(&local_user_id));

        Self {
            config,
            local_user_id,
            capture: deps.capture,
            vads: deps.vads,
            relay: deps.relay,
            manager,
            session: None,
            events,
            events_rx,
            snapshot_tx,
        }
    }

    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }

    pub fn config(&self) -> &VoiceConfig {
        &self.config
    }

    pub fn manager(&self) -> &PeerConnectionManager {
        &self.manager
    }

    /// Abonniert die veröffentlichten Snapshots
    pub fn subscribe(&self) -> watch::Receiver<VoiceSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Nächstes internes Event (Transport, VAD, lokale Tracks)
    pub async fn next_event(&mut self) -> Option<VoiceEvent> {
        self.events_rx.recv().await
    }

    // ========================================================================
    // JOIN / LEAVE
    // ========================================================================

    /// Betritt einen Voice-Channel; ein anderer aktiver Channel wird vorher verlassen
    pub async fn join_channel(&mut self, channel_id: &str) -> Result<(), VoiceError> {
        if self.session.as_ref().map(VoiceSession::channel_id) == Some(channel_id) {
            tracing::debug!(channel = %channel_id, "Already in voice channel");
            return Ok(());
        }
        if self.session.is_some() {
            self.leave_channel().await?;
        }

        self.relay.join_voice(channel_id).await?;

        let session = VoiceSession::new(channel_id);
        tracing::info!(channel = %channel_id, "Joined voice channel");
        self.manager.connect_channel(&session).await;
        self.session = Some(session);

        self.commit();
        Ok(())
    }

    /// Verlässt den aktuellen Channel (idempotent)
    pub async fn leave_channel(&mut self) -> Result<(), VoiceError> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };
        let channel_id = session.channel_id().to_string();

        self.manager.destroy_all_peers(Some(&channel_id)).await;
        session.release_media();

        if let Err(e) = self.relay.leave_voice(&channel_id).await {
            tracing::warn!(channel = %channel_id, "Failed to announce leave: {}", e);
        }
        tracing::info!(channel = %channel_id, "Left voice channel");

        self.commit();
        Ok(())
    }

    // ========================================================================
    // LOCAL MEDIA
    // ========================================================================

    /// Mikrofon an/aus; gibt den neuen Zustand zurück
    pub async fn toggle_mic(&mut self) -> Result<bool, VoiceError> {
        let session = self.session.as_mut().ok_or(VoiceError::NotInChannel)?;
        let channel_id = session.channel_id().to_string();

        if let Some(mic) = session.mic_stream.take() {
            self.manager.remove_stream_from_all(&channel_id, &mic).await;
            mic.stop();
            let session = self.session.as_mut().ok_or(VoiceError::NotInChannel)?;
            session.destroy_vad();
            session.muted = true;
            tracing::info!("Microphone off");
            self.commit();
            return Ok(false);
        }

        let device = self.config.input_device.as_deref();
        let mic = self.capture.acquire_audio(device).await?;
        let vad_capture = match self.capture.acquire_audio(device).await {
            Ok(stream) => stream,
            Err(e) => {
                mic.stop();
                return Err(e.into());
            }
        };

        // Gesendet wird erst, wenn die lokale VAD Sprache erkennt
        mic.set_audio_enabled(false);
        let vad_id = self.events.next_id();
        let vad = match self
            .vads
            .create(&vad_capture, self.config.local_vad, self.events.vad_callbacks(vad_id))
        {
            Ok(instance) => Some(LocalVad {
                id: vad_id,
                instance,
                capture: vad_capture,
            }),
            Err(e) => {
                tracing::warn!("Local VAD unavailable, sending ungated: {}", e);
                vad_capture.stop();
                mic.set_audio_enabled(true);
                None
            }
        };

        self.manager.add_stream_to_all(&channel_id, &mic).await;
        self.events.watch_stream_end(&mic);

        let session = self.session.as_mut().ok_or(VoiceError::NotInChannel)?;
        session.mic_stream = Some(mic);
        session.vad = vad;
        session.muted = false;
        tracing::info!("Microphone on");

        self.commit();
        Ok(true)
    }

    /// Ersetzt den Kamera-/Bildschirm-Stream; `None` beendet ihn
    pub async fn set_video_stream(&mut self, stream: Option<MediaStream>) -> Result<(), VoiceError> {
        let session = self.session.as_mut().ok_or(VoiceError::NotInChannel)?;
        let channel_id = session.channel_id().to_string();
        let old = session.video_stream.take();

        if let Some(old) = old {
            self.manager.remove_stream_from_all(&channel_id, &old).await;
            old.stop();
        }

        if let Some(stream) = stream {
            self.manager.add_stream_to_all(&channel_id, &stream).await;
            self.events.watch_stream_end(&stream);
            tracing::info!(stream = %stream.id(), "Video stream set");
            if let Some(session) = self.session.as_mut() {
                session.video_stream = Some(stream);
            }
        }

        self.commit();
        Ok(())
    }

    pub async fn start_camera(&mut self, constraints: &VideoConstraints) -> Result<(), VoiceError> {
        if self.session.is_none() {
            return Err(VoiceError::NotInChannel);
        }
        let stream = self.capture.acquire_video(constraints).await?;
        self.set_video_stream(Some(stream)).await
    }

    pub async fn start_screen_share(&mut self, constraints: &VideoConstraints) -> Result<(), VoiceError> {
        if self.session.is_none() {
            return Err(VoiceError::NotInChannel);
        }
        let stream = self.capture.acquire_display(constraints).await?;
        self.set_video_stream(Some(stream)).await
    }

    /// Deafen an/aus; gibt den neuen Zustand zurück
    pub fn toggle_deafen(&mut self) -> Result<bool, VoiceError> {
        let session = self.session.as_mut().ok_or(VoiceError::NotInChannel)?;
        session.deafened = !session.deafened;
        let deafened = session.deafened;
        self.manager.set_deafened(deafened);
        tracing::info!("Deafened: {}", deafened);

        self.commit();
        Ok(deafened)
    }

    pub async fn enumerate_devices(&self, kind: DeviceKind) -> Result<Vec<MediaDevice>, VoiceError> {
        Ok(self.capture.enumerate_devices(kind).await?)
    }

    // ========================================================================
    // INCOMING EVENTS
    // ========================================================================

    /// Verarbeitet ein Event des Signaling-Servers
    pub async fn handle_signaling(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::Roster {
                channel_id,
                user_ids,
            } => {
                self.manager
                    .sync_roster(self.session.as_ref(), &channel_id, &user_ids)
                    .await;
            }
            SignalingEvent::JoinedVoice {
                channel_id,
                user_id,
            } => {
                self.manager
                    .upsert_roster_entry(self.session.as_ref(), &channel_id, &user_id)
                    .await;
            }
            SignalingEvent::LeftVoice {
                channel_id,
                user_id,
            } => {
                if user_id != self.local_user_id {
                    self.manager.remove_roster_entry(&channel_id, &user_id).await;
                }
            }
            SignalingEvent::Signal {
                channel_id,
                from_user_id,
                payload,
            } => {
                self.manager
                    .handle_remote_signal(self.session.as_ref(), &channel_id, &from_user_id, payload)
                    .await;
            }
            SignalingEvent::Disconnected => {
                tracing::warn!("Signaling disconnected; peers keep their current transports");
            }
            other => tracing::debug!("Signaling event: {:?}", other),
        }
        self.commit();
    }

    /// Verarbeitet ein internes Event aus `next_event`
    pub async fn handle_event(&mut self, event: VoiceEvent) {
        match event {
            VoiceEvent::Transport { id, event } => {
                self.manager.handle_transport_event(id, event).await;
            }
            VoiceEvent::Vad { id, speaking } => {
                let local = self
                    .session
                    .as_mut()
                    .filter(|s| s.vad.as_ref().is_some_and(|vad| vad.id == id));
                match local {
                    Some(session) => {
                        session.voice_activity = speaking;
                        // Gating des gesendeten Tracks
                        if let Some(mic) = &session.mic_stream {
                            mic.set_audio_enabled(speaking);
                        }
                        tracing::debug!(speaking, "Local voice activity");
                    }
                    None => {
                        if !self.manager.handle_vad(id, speaking) {
                            tracing::debug!(vad = id, "Ignoring event of destroyed VAD");
                        }
                    }
                }
            }
            VoiceEvent::LocalTrackEnded { stream_id } => {
                self.handle_local_track_ended(&stream_id).await;
            }
        }
        self.commit();
    }

    async fn handle_local_track_ended(&mut self, stream_id: &str) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let is_video = session.video_stream().is_some_and(|s| s.id() == stream_id);
        let is_mic = session.mic_stream().is_some_and(|s| s.id() == stream_id);

        if is_video {
            tracing::info!(stream = %stream_id, "Video track ended");
            if let Err(e) = self.set_video_stream(None).await {
                tracing::warn!("Failed to clear video stream: {}", e);
            }
        } else if is_mic {
            tracing::warn!(stream = %stream_id, "Microphone track ended");
            if let Err(e) = self.toggle_mic().await {
                tracing::warn!("Failed to turn off microphone: {}", e);
            }
        }
    }

    /// Verwirft abgelaufene Early-Signals
    pub fn purge_early_signals(&mut self) {
        if self.manager.purge_early_signals() > 0 {
            self.commit();
        }
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    pub fn current_session(&self) -> Option<&VoiceSession> {
        self.session.as_ref()
    }

    pub fn roster_for(&self, channel_id: &str) -> Vec<&PeerConnection> {
        self.manager.roster_for(channel_id)
    }

    pub fn is_mic_muted(&self) -> bool {
        self.session.as_ref().map_or(true, VoiceSession::is_muted)
    }

    pub fn is_deafened(&self) -> bool {
        self.session.as_ref().is_some_and(VoiceSession::is_deafened)
    }

    pub fn local_voice_activity(&self) -> bool {
        self.session.as_ref().is_some_and(VoiceSession::voice_activity)
    }

    pub fn remote_voice_activity(&self, user_id: &str) -> bool {
        self.session_peer(user_id)
            .is_some_and(PeerConnection::voice_activity)
    }

    pub fn active_bundle(&self, user_id: &str, kind: BundleKind) -> Option<&StreamBundle> {
        self.session_peer(user_id)?.active_bundle(kind)
    }

    pub fn mic_enabled(&self, user_id: &str) -> bool {
        if user_id == self.local_user_id {
            return self.session.as_ref().is_some_and(VoiceSession::mic_enabled);
        }
        self.session_peer(user_id).is_some_and(PeerConnection::mic_enabled)
    }

    pub fn video_enabled(&self, user_id: &str) -> bool {
        if user_id == self.local_user_id {
            return self.session.as_ref().is_some_and(VoiceSession::video_enabled);
        }
        self.session_peer(user_id).is_some_and(PeerConnection::video_enabled)
    }

    pub fn voice_activity(&self, user_id: &str) -> bool {
        if user_id == self.local_user_id {
            return self.local_voice_activity();
        }
        self.remote_voice_activity(user_id)
    }

    fn session_peer(&self, user_id: &str) -> Option<&PeerConnection> {
        let session = self.session.as_ref()?;
        self.manager.peer(session.channel_id(), user_id)
    }

    /// Aktueller Zustand als Snapshot
    pub fn snapshot(&self) -> VoiceSnapshot {
        VoiceSnapshot::capture(&self.local_user_id, self.session.as_ref(), &self.manager)
    }

    fn commit(&self) {
        self.snapshot_tx.send_replace(self.snapshot());
    }

    /// Arbeitet alle bereits eingereihten Events ab
    #[cfg(test)]
    pub(crate) async fn drain_events(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_event(event).await;
            handled += 1;
        }
        handled
    }
}

impl std::fmt::Debug for VoiceCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceCoordinator")
            .field("local_user_id", &self.local_user_id)
            .field("session", &self.session)
            .field("manager", &self.manager)
            .finish()
    }
}
