//! Peer Connection Manager
//!
//! Besitzt die Roster aller Voice-Channels (`channel_id -> user_id -> PeerConnection`)
//! und steuert den Lebenszyklus der einzelnen Verbindungen:
//! - Transport erstellen, lokale Streams anhängen, Signale anwenden
//! - Remote-Tracks in Bundles einsortieren, VAD und Playback binden
//! - Aufräumen über `destroy_peer` / `destroy_all_peers`
//!
//! Nur der Manager schreibt in die Roster.

use super::early_signals::EarlySignalBuffer;
use super::events::{EventSender, VadId};
use super::peer::{BundleKind, PeerConnection, PeerStatus, RemoteVad, StreamBundle, TransportSlot};
use super::session::VoiceSession;
use crate::config::{IceServer, VoiceConfig};
use crate::media::{AudioRenderer, MediaStream, MediaTrack};
use crate::signaling::{SignalEnvelope, SignalingRelay};
use crate::transport::{SignalPayload, TransportEvent, TransportFactory, TransportId, TransportOptions};
use crate::vad::{VadFactory, VadOptions};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

type Roster = BTreeMap<String, PeerConnection>;

pub struct PeerConnectionManager {
    local_user_id: String,
    rosters: BTreeMap<String, Roster>,
    early_signals: EarlySignalBuffer,
    transports: Arc<dyn TransportFactory>,
    vads: Arc<dyn VadFactory>,
    renderer: Arc<dyn AudioRenderer>,
    relay: Arc<dyn SignalingRelay>,
    events: EventSender,
    ice_servers: Vec<IceServer>,
    remote_vad: VadOptions,
    close_timeout: Duration,
    deafened: bool,
}

impl PeerConnectionManager {
    pub(crate) fn new(
        local_user_id: String,
        config: &VoiceConfig,
        transports: Arc<dyn TransportFactory>,
        vads: Arc<dyn VadFactory>,
        renderer: Arc<dyn AudioRenderer>,
        relay: Arc<dyn SignalingRelay>,
        events: EventSender,
    ) -> Self {
        Self {
            local_user_id,
            rosters: BTreeMap::new(),
            early_signals: EarlySignalBuffer::new(config.early_signal_ttl(), config.max_early_signals),
            transports,
            vads,
            renderer,
            relay,
            events,
            ice_servers: config.ice_servers.clone(),
            remote_vad: config.remote_vad,
            close_timeout: config.close_timeout(),
            deafened: false,
        }
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    pub fn roster_for(&self, channel_id: &str) -> Vec<&PeerConnection> {
        self.rosters
            .get(channel_id)
            .map(|roster| roster.values().collect())
            .unwrap_or_default()
    }

    pub fn peer(&self, channel_id: &str, user_id: &str) -> Option<&PeerConnection> {
        self.rosters.get(channel_id)?.get(user_id)
    }

    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.rosters.keys().map(String::as_str)
    }

    pub fn live_transports(&self) -> usize {
        self.all_peers().filter(|p| p.has_transport()).count()
    }

    pub fn live_remote_vads(&self) -> usize {
        self.all_peers().filter(|p| p.has_remote_vad()).count()
    }

    pub fn pending_signals(&self) -> usize {
        self.early_signals.len()
    }

    fn all_peers(&self) -> impl Iterator<Item = &PeerConnection> {
        self.rosters.values().flat_map(|roster| roster.values())
    }

    fn entry_mut(&mut self, channel_id: &str, user_id: &str) -> Option<&mut PeerConnection> {
        self.rosters.get_mut(channel_id)?.get_mut(user_id)
    }

    fn find_by_transport(&self, id: TransportId) -> Option<(String, String)> {
        self.all_peers()
            .find(|p| p.transport_id() == Some(id))
            .map(|p| (p.channel_id().to_string(), p.user_id().to_string()))
    }

    // ========================================================================
    // ROSTER
    // ========================================================================

    /// Legt einen Roster-Eintrag an; im eigenen Channel zusätzlich den Transport
    pub async fn upsert_roster_entry(
        &mut self,
        session: Option<&VoiceSession>,
        channel_id: &str,
        user_id: &str,
    ) {
        if user_id == self.local_user_id {
            return;
        }

        let roster = self.rosters.entry(channel_id.to_string()).or_default();
        if roster.contains_key(user_id) {
            tracing::debug!(channel = %channel_id, user = %user_id, "Roster entry already present");
            return;
        }
        roster.insert(user_id.to_string(), PeerConnection::new(channel_id, user_id));
        tracing::info!(channel = %channel_id, user = %user_id, "Participant joined voice");

        if let Some(session) = session.filter(|s| s.channel_id() == channel_id) {
            self.open_peer(session, user_id).await;
        }
    }

    /// Teilnehmer hat den Channel verlassen
    pub async fn remove_roster_entry(&mut self, channel_id: &str, user_id: &str) {
        self.early_signals.take(channel_id, user_id, Instant::now());
        if self.peer(channel_id, user_id).is_some() {
            tracing::info!(channel = %channel_id, user = %user_id, "Participant left voice");
            self.destroy_peer(channel_id, user_id).await;
        }
    }

    /// Gleicht den Roster eines Channels mit einer vollständigen Teilnehmerliste ab
    pub async fn sync_roster(
        &mut self,
        session: Option<&VoiceSession>,
        channel_id: &str,
        user_ids: &[String],
    ) {
        let listed: HashSet<&str> = user_ids.iter().map(String::as_str).collect();
        let stale: Vec<String> = self
            .roster_for(channel_id)
            .into_iter()
            .map(|p| p.user_id().to_string())
            .filter(|user| !listed.contains(user.as_str()))
            .collect();

        for user_id in stale {
            self.remove_roster_entry(channel_id, &user_id).await;
        }
        for user_id in user_ids {
            self.upsert_roster_entry(session, channel_id, user_id).await;
        }
    }

    /// Erstellt Transports zu allen Teilnehmern des neu betretenen Channels
    pub async fn connect_channel(&mut self, session: &VoiceSession) {
        let users: Vec<String> = self
            .roster_for(session.channel_id())
            .into_iter()
            .map(|p| p.user_id().to_string())
            .collect();

        for user_id in users {
            self.open_peer(session, &user_id).await;
        }
    }

    /// Transport erstellen; gepufferte Signale machen uns zum Antwortenden
    async fn open_peer(&mut self, session: &VoiceSession, user_id: &str) {
        let mut early = self
            .early_signals
            .take(session.channel_id(), user_id, Instant::now())
            .into_iter();

        match early.next() {
            Some(first) => {
                tracing::debug!(user = %user_id, "Replaying buffered signals");
                self.create_peer(session, user_id, Some(first)).await;
                for payload in early {
                    self.apply_signal(session.channel_id(), user_id, payload).await;
                }
            }
            None => self.create_peer(session, user_id, None).await,
        }
    }

    // ========================================================================
    // PEER LIFECYCLE
    // ========================================================================

    /// Erstellt den Transport eines Eintrags im Channel der Session.
    ///
    /// Ohne Payload sind wir Initiator. Existiert bereits ein Transport, wird
    /// der Payload nur weitergereicht.
    pub async fn create_peer(
        &mut self,
        session: &VoiceSession,
        user_id: &str,
        payload: Option<SignalPayload>,
    ) {
        let channel_id = session.channel_id();
        let has_transport = match self.peer(channel_id, user_id) {
            Some(entry) => entry.has_transport(),
            None => {
                tracing::warn!(channel = %channel_id, user = %user_id, "No roster entry for peer");
                return;
            }
        };

        if has_transport {
            if let Some(payload) = payload {
                self.apply_signal(channel_id, user_id, payload).await;
            }
            return;
        }

        let initiator = payload.is_none();
        let options = TransportOptions {
            initiator,
            polite: self.local_user_id.as_str() < user_id,
            ice_servers: self.ice_servers.clone(),
        };
        let id = self.events.next_id();

        let handle = match self.transports.create(options, self.events.transport_sink(id)).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!(user = %user_id, "Failed to create transport: {}", e);
                if let Some(entry) = self.entry_mut(channel_id, user_id) {
                    entry.status = PeerStatus::Disconnected;
                }
                return;
            }
        };

        for stream in session.outgoing_streams() {
            if let Err(e) = handle.add_stream(stream).await {
                tracing::warn!(user = %user_id, "Failed to add local stream: {}", e);
            }
        }

        if let Some(payload) = payload {
            if let Err(e) = handle.signal(payload).await {
                tracing::warn!(user = %user_id, "Failed to apply signal: {}", e);
            }
        }

        if let Some(entry) = self.entry_mut(channel_id, user_id) {
            entry.transport = Some(TransportSlot { id, handle });
            entry.status = PeerStatus::Connecting;
            tracing::info!(
                channel = %channel_id,
                user = %user_id,
                transport = id,
                initiator,
                "Peer transport created"
            );
        }
    }

    /// Reicht einen Payload an den Transport weiter; `false` ohne Transport
    pub async fn apply_signal(&mut self, channel_id: &str, user_id: &str, payload: SignalPayload) -> bool {
        let Some(slot) = self
            .peer(channel_id, user_id)
            .and_then(|entry| entry.transport.as_ref())
        else {
            tracing::warn!(channel = %channel_id, user = %user_id, "No transport for signal, dropping");
            return false;
        };

        if let Err(e) = slot.handle.signal(payload).await {
            tracing::warn!(user = %user_id, transport = slot.id, "Failed to apply signal: {}", e);
        }
        true
    }

    /// Eingehendes Signal eines Remote-Teilnehmers
    pub async fn handle_remote_signal(
        &mut self,
        session: Option<&VoiceSession>,
        channel_id: &str,
        from_user_id: &str,
        payload: SignalPayload,
    ) {
        let Some(session) = session.filter(|s| s.channel_id() == channel_id) else {
            tracing::warn!(channel = %channel_id, user = %from_user_id, "Signal for a channel we are not in, dropping");
            return;
        };

        match self.peer(channel_id, from_user_id).map(PeerConnection::has_transport) {
            Some(true) => {
                self.apply_signal(channel_id, from_user_id, payload).await;
            }
            Some(false) => self.create_peer(session, from_user_id, Some(payload)).await,
            None => {
                if self
                    .early_signals
                    .push(channel_id, from_user_id, payload, Instant::now())
                {
                    tracing::debug!(user = %from_user_id, "Buffered signal from unknown participant");
                } else {
                    tracing::warn!(user = %from_user_id, "Early signal buffer full, dropping signal");
                }
            }
        }
    }

    /// Schließt den Transport und entfernt den Eintrag
    pub async fn destroy_peer(&mut self, channel_id: &str, user_id: &str) {
        let Some(mut entry) = self
            .rosters
            .get_mut(channel_id)
            .and_then(|roster| roster.remove(user_id))
        else {
            return;
        };
        if self.rosters.get(channel_id).is_some_and(|r| r.is_empty()) {
            self.rosters.remove(channel_id);
        }
        self.teardown(&mut entry).await;
    }

    /// Zerstört alle Peers eines Channels, ohne Angabe alle Peers
    pub async fn destroy_all_peers(&mut self, channel_id: Option<&str>) {
        let channels: Vec<String> = match channel_id {
            Some(channel) => vec![channel.to_string()],
            None => self.rosters.keys().cloned().collect(),
        };

        for channel in channels {
            let dropped = self.early_signals.clear_channel(&channel);
            if dropped > 0 {
                tracing::debug!(channel = %channel, "Dropped {} buffered signals", dropped);
            }
            let Some(roster) = self.rosters.remove(&channel) else {
                continue;
            };
            for (_, mut entry) in roster {
                self.teardown(&mut entry).await;
            }
        }
    }

    async fn teardown(&self, entry: &mut PeerConnection) {
        if let Some(slot) = entry.transport.take() {
            match tokio::time::timeout(self.close_timeout, slot.handle.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(transport = slot.id, "Failed to close transport: {}", e),
                Err(_) => tracing::warn!(transport = slot.id, "Transport close timed out"),
            }
        }
        entry.clear_remote_vad();
        entry.detach_render_sink();
        entry.bundles.clear();
        entry.status = PeerStatus::Closed;
        tracing::info!(channel = %entry.channel_id(), user = %entry.user_id(), "Peer destroyed");
    }

    // ========================================================================
    // LOCAL STREAMS
    // ========================================================================

    pub async fn add_stream_to_all(&self, channel_id: &str, stream: &MediaStream) {
        for entry in self.rosters.get(channel_id).into_iter().flat_map(|r| r.values()) {
            if let Some(slot) = &entry.transport {
                if let Err(e) = slot.handle.add_stream(stream).await {
                    tracing::warn!(user = %entry.user_id(), "Failed to add stream: {}", e);
                }
            }
        }
    }

    pub async fn remove_stream_from_all(&self, channel_id: &str, stream: &MediaStream) {
        for entry in self.rosters.get(channel_id).into_iter().flat_map(|r| r.values()) {
            if let Some(slot) = &entry.transport {
                if let Err(e) = slot.handle.remove_stream(stream).await {
                    tracing::warn!(user = %entry.user_id(), "Failed to remove stream: {}", e);
                }
            }
        }
    }

    // ========================================================================
    // TRACKS
    // ========================================================================

    /// Sortiert einen Remote-Track in das Bundle seines Streams ein
    pub fn attach_track(&mut self, channel_id: &str, user_id: &str, track: MediaTrack, stream_id: &str) {
        let Some(entry) = self.entry_mut(channel_id, user_id) else {
            return;
        };

        let index = match entry.bundle_index(stream_id) {
            Some(index) => index,
            None => {
                entry.bundles.push(StreamBundle::new(stream_id));
                entry.bundles.len() - 1
            }
        };
        let track_id = track.id().to_string();
        if !entry.bundles[index].stream_mut().add_track(track) {
            tracing::debug!(user = %user_id, track = %track_id, "Track already attached");
            return;
        }
        tracing::debug!(user = %user_id, track = %track_id, stream = %stream_id, "Remote track attached");

        self.refresh_outputs(channel_id, user_id, stream_id);
    }

    pub fn detach_track(&mut self, channel_id: &str, user_id: &str, track_id: &str) {
        let Some(entry) = self.entry_mut(channel_id, user_id) else {
            return;
        };
        let Some(index) = entry
            .bundles
            .iter()
            .position(|b| b.stream().contains_track(track_id))
        else {
            return;
        };

        entry.bundles[index].stream_mut().remove_track(track_id);
        let stream_id = entry.bundles[index].stream_id().to_string();

        if entry.bundles[index].tracks().is_empty() {
            entry.bundles.remove(index);
            entry.release_stream(&stream_id);
            tracing::debug!(user = %user_id, stream = %stream_id, "Bundle removed");
            self.rebind_audio(channel_id, user_id);
        } else {
            self.refresh_outputs(channel_id, user_id, &stream_id);
        }
    }

    /// Remote-Stream beendet: alle Tracks des Streams entfernen
    pub fn detach_stream(&mut self, channel_id: &str, user_id: &str, stream_id: &str) {
        let Some(entry) = self.entry_mut(channel_id, user_id) else {
            return;
        };
        if let Some(index) = entry.bundle_index(stream_id) {
            entry.bundles.remove(index);
            entry.release_stream(stream_id);
            tracing::debug!(user = %user_id, stream = %stream_id, "Remote stream ended");
            self.rebind_audio(channel_id, user_id);
        }
    }

    /// Hängt VAD und Playback an das aktive Audio-Bundle, falls noch eines existiert
    fn rebind_audio(&mut self, channel_id: &str, user_id: &str) {
        let Some(stream_id) = self
            .peer(channel_id, user_id)
            .and_then(|p| p.active_bundle(BundleKind::Audio))
            .map(|b| b.stream_id().to_string())
        else {
            return;
        };
        self.refresh_outputs(channel_id, user_id, &stream_id);
    }

    /// Bindet VAD und Playback an ein reines Audio-Bundle bzw. löst sie von einem Video-Bundle
    fn refresh_outputs(&mut self, channel_id: &str, user_id: &str, stream_id: &str) {
        let Some(entry) = self
            .rosters
            .get_mut(channel_id)
            .and_then(|roster| roster.get_mut(user_id))
        else {
            return;
        };
        let Some(bundle) = entry.bundles.iter().find(|b| b.stream_id() == stream_id).cloned() else {
            return;
        };

        if bundle.kind() == BundleKind::Video {
            // Erst Audio, dann Video auf demselben Stream: Ausgaben zurück zum Mikrofon
            entry.release_stream(stream_id);
            self.rebind_audio(channel_id, user_id);
            return;
        }

        let vad_bound = entry
            .remote_vad
            .as_ref()
            .is_some_and(|vad| vad.stream_id == stream_id);
        if !vad_bound {
            entry.clear_remote_vad();
            let id = self.events.next_id();
            match self
                .vads
                .create(bundle.stream(), self.remote_vad, self.events.vad_callbacks(id))
            {
                Ok(instance) => {
                    entry.remote_vad = Some(RemoteVad {
                        id,
                        stream_id: stream_id.to_string(),
                        instance,
                    });
                }
                Err(e) => tracing::warn!(user = %user_id, "Failed to create remote VAD: {}", e),
            }
        }

        if entry.render_stream_id() != Some(stream_id) {
            entry.detach_render_sink();
            match self.renderer.bind(bundle.stream()) {
                Ok(sink) => {
                    sink.set_muted(self.deafened);
                    entry.render_sink = Some(sink);
                }
                Err(e) => tracing::warn!(user = %user_id, "Failed to bind playback: {}", e),
            }
        }
    }

    // ========================================================================
    // EVENTS
    // ========================================================================

    pub async fn handle_transport_event(&mut self, id: TransportId, event: TransportEvent) {
        let Some((channel_id, user_id)) = self.find_by_transport(id) else {
            tracing::debug!(transport = id, "Ignoring event of closed transport: {:?}", event);
            return;
        };

        match event {
            TransportEvent::Signal(payload) => {
                let envelope = SignalEnvelope {
                    channel_id,
                    to_user_id: user_id,
                    payload,
                };
                if let Err(e) = self.relay.send_signal(envelope).await {
                    tracing::warn!(transport = id, "Failed to relay signal: {}", e);
                }
            }
            TransportEvent::Track { track, stream_id } => {
                self.attach_track(&channel_id, &user_id, track, &stream_id);
            }
            TransportEvent::TrackEnded { track_id } => {
                self.detach_track(&channel_id, &user_id, &track_id);
            }
            TransportEvent::StreamEnded { stream_id } => {
                self.detach_stream(&channel_id, &user_id, &stream_id);
            }
            TransportEvent::Connected => {
                if let Some(entry) = self.entry_mut(&channel_id, &user_id) {
                    entry.status = PeerStatus::Connected;
                }
                tracing::info!(user = %user_id, "Peer connected");
            }
            TransportEvent::Closed => {
                if let Some(entry) = self.entry_mut(&channel_id, &user_id) {
                    entry.status = PeerStatus::Disconnected;
                }
                tracing::warn!(user = %user_id, "Peer transport closed by remote");
            }
            TransportEvent::Error(reason) => {
                if let Some(entry) = self.entry_mut(&channel_id, &user_id) {
                    entry.status = PeerStatus::Disconnected;
                }
                tracing::warn!(user = %user_id, "Peer transport error: {}", reason);
            }
        }
    }

    /// Remote-VAD-Flanke; `false` wenn die ID keinem Peer gehört
    pub fn handle_vad(&mut self, id: VadId, speaking: bool) -> bool {
        let Some(entry) = self
            .rosters
            .values_mut()
            .flat_map(|roster| roster.values_mut())
            .find(|p| p.remote_vad.as_ref().is_some_and(|vad| vad.id == id))
        else {
            return false;
        };
        entry.voice_activity = speaking;
        tracing::debug!(user = %entry.user_id(), speaking, "Remote voice activity");
        true
    }

    /// Schaltet alle Render-Sinks stumm bzw. wieder laut
    pub fn set_deafened(&mut self, deafened: bool) {
        self.deafened = deafened;
        for entry in self.rosters.values().flat_map(|roster| roster.values()) {
            if let Some(sink) = &entry.render_sink {
                sink.set_muted(deafened);
            }
        }
    }

    pub fn purge_early_signals(&mut self) -> usize {
        let dropped = self.early_signals.purge(Instant::now());
        if dropped > 0 {
            tracing::warn!("Dropped {} expired early signals", dropped);
        }
        dropped
    }
}

impl std::fmt::Debug for PeerConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnectionManager")
            .field("local_user_id", &self.local_user_id)
            .field("rosters", &self.rosters)
            .field("pending_signals", &self.early_signals.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::TrackKind;
    use crate::testing::{remote_track, Fakes};
    use crate::voice::events::VoiceEvent;
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn manager(local: &str) -> (PeerConnectionManager, Fakes, UnboundedReceiver<VoiceEvent>) {
        let fakes = Fakes::new();
        let (events, rx) = EventSender::channel();
        let manager = PeerConnectionManager::new(
            local.to_string(),
            &VoiceConfig::default(),
            fakes.transports.clone(),
            fakes.vads.clone(),
            fakes.renderer.clone(),
            fakes.relay.clone(),
            events,
        );
        (manager, fakes, rx)
    }

    fn payload(kind: &str) -> SignalPayload {
        SignalPayload(json!({ "type": kind }))
    }

    #[tokio::test]
    async fn test_upsert_outside_session_has_no_transport() {
        let (mut manager, fakes, _rx) = manager("alice");
        manager.upsert_roster_entry(None, "c1", "bob").await;
        manager.upsert_roster_entry(None, "c1", "bob").await;
        manager.upsert_roster_entry(None, "c1", "alice").await;

        assert_eq!(manager.roster_for("c1").len(), 1);
        assert!(!manager.peer("c1", "bob").unwrap().has_transport());
        assert!(fakes.transports.created().is_empty());
    }

    #[tokio::test]
    async fn test_upsert_in_session_creates_initiator() {
        let (mut manager, fakes, _rx) = manager("alice");
        let session = VoiceSession::new("c1");
        manager.upsert_roster_entry(Some(&session), "c1", "bob").await;

        let transports = fakes.transports.created();
        assert_eq!(transports.len(), 1);
        assert!(transports[0].options.initiator);
        assert!(transports[0].options.polite);
        assert_eq!(manager.peer("c1", "bob").unwrap().status(), PeerStatus::Connecting);
    }

    #[tokio::test]
    async fn test_second_create_forwards_signal() {
        let (mut manager, fakes, _rx) = manager("alice");
        let session = VoiceSession::new("c1");
        manager.upsert_roster_entry(Some(&session), "c1", "bob").await;
        manager
            .create_peer(&session, "bob", Some(payload("offer")))
            .await;

        let transports = fakes.transports.created();
        assert_eq!(transports.len(), 1);
        assert_eq!(*transports[0].signals.lock(), vec![payload("offer")]);
    }

    #[tokio::test]
    async fn test_apply_signal_without_transport_is_non_fatal() {
        let (mut manager, _fakes, _rx) = manager("alice");
        manager.upsert_roster_entry(None, "c1", "bob").await;
        assert!(!manager.apply_signal("c1", "bob", payload("answer")).await);
        assert!(!manager.apply_signal("c1", "nobody", payload("answer")).await);
    }

    #[tokio::test]
    async fn test_early_signal_creates_answering_peer() {
        let (mut manager, fakes, _rx) = manager("bob");
        let session = VoiceSession::new("c1");

        manager
            .handle_remote_signal(Some(&session), "c1", "alice", payload("offer"))
            .await;
        manager
            .handle_remote_signal(Some(&session), "c1", "alice", payload("candidate"))
            .await;
        assert_eq!(manager.pending_signals(), 2);
        assert!(fakes.transports.created().is_empty());

        manager.upsert_roster_entry(Some(&session), "c1", "alice").await;

        let transport = fakes.transports.last();
        assert!(!transport.options.initiator);
        assert!(!transport.options.polite);
        assert_eq!(
            *transport.signals.lock(),
            vec![payload("offer"), payload("candidate")]
        );
        assert_eq!(manager.pending_signals(), 0);
    }

    #[tokio::test]
    async fn test_signal_for_other_channel_is_dropped() {
        let (mut manager, _fakes, _rx) = manager("bob");
        let session = VoiceSession::new("c1");
        manager
            .handle_remote_signal(Some(&session), "c2", "alice", payload("offer"))
            .await;
        manager
            .handle_remote_signal(None, "c1", "alice", payload("offer"))
            .await;
        assert_eq!(manager.pending_signals(), 0);
    }

    #[tokio::test]
    async fn test_two_tracks_on_one_stream_share_bundle_and_vad() {
        let (mut manager, fakes, _rx) = manager("alice");
        manager.upsert_roster_entry(None, "c1", "bob").await;

        manager.attach_track("c1", "bob", remote_track(TrackKind::Audio, "t1"), "s1");
        manager.attach_track("c1", "bob", remote_track(TrackKind::Audio, "t2"), "s1");

        let peer = manager.peer("c1", "bob").unwrap();
        assert_eq!(peer.bundles().len(), 1);
        let ids: Vec<&str> = peer.bundles()[0].tracks().iter().map(|t| t.id()).collect();
        assert_eq!(ids, vec!["t1", "t2"]);
        assert_eq!(fakes.vads.created(), 1);
        assert_eq!(fakes.vads.stream_of(0), "s1");
        assert_eq!(fakes.vads.options_of(0), VadOptions::remote());
        assert_eq!(peer.render_stream_id(), Some("s1"));
    }

    #[tokio::test]
    async fn test_video_bundle_gets_no_vad() {
        let (mut manager, fakes, _rx) = manager("alice");
        manager.upsert_roster_entry(None, "c1", "bob").await;

        manager.attach_track("c1", "bob", remote_track(TrackKind::Audio, "a1"), "mic");
        manager.attach_track("c1", "bob", remote_track(TrackKind::Video, "v1"), "cam");

        let peer = manager.peer("c1", "bob").unwrap();
        assert_eq!(peer.bundles().len(), 2);
        assert_eq!(peer.active_bundle(BundleKind::Video).unwrap().stream_id(), "cam");
        assert_eq!(fakes.vads.created(), 1);
        assert_eq!(fakes.vads.live(), 1);
        assert!(peer.video_enabled());
        assert!(peer.mic_enabled());
    }

    #[tokio::test]
    async fn test_screen_audio_before_video_returns_outputs_to_mic() {
        let (mut manager, fakes, _rx) = manager("alice");
        manager.upsert_roster_entry(None, "c1", "bob").await;

        manager.attach_track("c1", "bob", remote_track(TrackKind::Audio, "mic"), "s1");
        manager.attach_track("c1", "bob", remote_track(TrackKind::Audio, "scr_a"), "s2");
        assert_eq!(manager.peer("c1", "bob").unwrap().render_stream_id(), Some("s2"));

        manager.attach_track("c1", "bob", remote_track(TrackKind::Video, "scr_v"), "s2");

        let bob = manager.peer("c1", "bob").unwrap();
        assert_eq!(bob.active_bundle(BundleKind::Audio).unwrap().stream_id(), "s1");
        assert_eq!(bob.active_bundle(BundleKind::Video).unwrap().stream_id(), "s2");
        assert_eq!(bob.render_stream_id(), Some("s1"));
        assert_eq!(bob.remote_vad.as_ref().unwrap().stream_id, "s1");
        assert_eq!(fakes.vads.live(), 1);
        assert_eq!(fakes.renderer.live(), 1);

        let vad = bob.remote_vad.as_ref().unwrap().id;
        assert!(manager.handle_vad(vad, true));
        assert!(manager.peer("c1", "bob").unwrap().voice_activity());
    }

    #[tokio::test]
    async fn test_ended_audio_stream_falls_back_to_previous_bundle() {
        let (mut manager, fakes, _rx) = manager("alice");
        manager.upsert_roster_entry(None, "c1", "bob").await;
        manager.attach_track("c1", "bob", remote_track(TrackKind::Audio, "mic"), "s1");
        manager.attach_track("c1", "bob", remote_track(TrackKind::Audio, "extra"), "s2");

        manager.detach_stream("c1", "bob", "s2");
        let bob = manager.peer("c1", "bob").unwrap();
        assert_eq!(bob.render_stream_id(), Some("s1"));
        assert_eq!(bob.remote_vad.as_ref().unwrap().stream_id, "s1");

        manager.attach_track("c1", "bob", remote_track(TrackKind::Audio, "extra2"), "s3");
        manager.detach_track("c1", "bob", "extra2");
        let bob = manager.peer("c1", "bob").unwrap();
        assert_eq!(bob.render_stream_id(), Some("s1"));
        assert_eq!(bob.remote_vad.as_ref().unwrap().stream_id, "s1");
        assert_eq!(fakes.vads.live(), 1);
        assert_eq!(fakes.renderer.live(), 1);
    }

    #[tokio::test]
    async fn test_removing_last_audio_track_clears_only_that_peer() {
        let (mut manager, fakes, _rx) = manager("alice");
        manager.upsert_roster_entry(None, "c1", "bob").await;
        manager.upsert_roster_entry(None, "c1", "carol").await;
        manager.attach_track("c1", "bob", remote_track(TrackKind::Audio, "b1"), "sb");
        manager.attach_track("c1", "carol", remote_track(TrackKind::Audio, "tc"), "sc");
        let bob_vad = manager.peer("c1", "bob").unwrap().remote_vad.as_ref().unwrap().id;
        let carol_vad = manager.peer("c1", "carol").unwrap().remote_vad.as_ref().unwrap().id;
        assert!(manager.handle_vad(bob_vad, true));
        assert!(manager.handle_vad(carol_vad, true));

        manager.detach_track("c1", "bob", "b1");

        let bob = manager.peer("c1", "bob").unwrap();
        assert!(bob.bundles().is_empty());
        assert!(!bob.has_remote_vad());
        assert!(bob.render_stream_id().is_none());
        assert!(!bob.voice_activity());

        let carol = manager.peer("c1", "carol").unwrap();
        assert!(carol.has_remote_vad());
        assert_eq!(carol.render_stream_id(), Some("sc"));
        assert!(carol.voice_activity());
        assert_eq!(fakes.vads.live(), 1);
        assert_eq!(fakes.renderer.live(), 1);
    }

    #[tokio::test]
    async fn test_stream_ended_releases_audio_outputs() {
        let (mut manager, fakes, _rx) = manager("alice");
        manager.upsert_roster_entry(None, "c1", "bob").await;
        manager.attach_track("c1", "bob", remote_track(TrackKind::Audio, "t1"), "s1");
        manager.attach_track("c1", "bob", remote_track(TrackKind::Audio, "t2"), "s1");

        manager.detach_stream("c1", "bob", "s1");

        let bob = manager.peer("c1", "bob").unwrap();
        assert!(bob.bundles().is_empty());
        assert_eq!(fakes.vads.live(), 0);
        assert_eq!(fakes.renderer.live(), 0);
    }

    #[tokio::test]
    async fn test_transport_events_drive_status() {
        let (mut manager, fakes, _rx) = manager("alice");
        let session = VoiceSession::new("c1");
        manager.upsert_roster_entry(Some(&session), "c1", "bob").await;
        let id = manager.peer("c1", "bob").unwrap().transport_id().unwrap();

        manager.handle_transport_event(id, TransportEvent::Connected).await;
        assert_eq!(manager.peer("c1", "bob").unwrap().status(), PeerStatus::Connected);

        manager
            .handle_transport_event(id, TransportEvent::Error("ice failed".to_string()))
            .await;
        let bob = manager.peer("c1", "bob").unwrap();
        assert_eq!(bob.status(), PeerStatus::Disconnected);
        assert!(bob.has_transport());

        manager.handle_transport_event(id, TransportEvent::Connected).await;
        assert_eq!(manager.peer("c1", "bob").unwrap().status(), PeerStatus::Connected);

        manager.handle_transport_event(id, TransportEvent::Closed).await;
        let bob = manager.peer("c1", "bob").unwrap();
        assert_eq!(bob.status(), PeerStatus::Disconnected);
        assert!(bob.has_transport());
        assert_eq!(manager.roster_for("c1").len(), 1);
        assert!(!fakes.transports.last().is_closed());

        manager
            .handle_transport_event(id, TransportEvent::Signal(payload("answer")))
            .await;
        let relayed = fakes.relay.signals.lock().clone();
        assert_eq!(relayed.len(), 1);
        assert_eq!(relayed[0].to_user_id, "bob");
        assert_eq!(relayed[0].channel_id, "c1");
    }

    #[tokio::test]
    async fn test_stale_transport_events_are_ignored() {
        let (mut manager, fakes, _rx) = manager("alice");
        let session = VoiceSession::new("c1");
        manager.upsert_roster_entry(Some(&session), "c1", "bob").await;
        let id = manager.peer("c1", "bob").unwrap().transport_id().unwrap();

        manager.destroy_peer("c1", "bob").await;
        manager.upsert_roster_entry(None, "c1", "bob").await;
        manager
            .handle_transport_event(
                id,
                TransportEvent::Track {
                    track: remote_track(TrackKind::Audio, "t1"),
                    stream_id: "s1".to_string(),
                },
            )
            .await;

        assert!(manager.peer("c1", "bob").unwrap().bundles().is_empty());
        assert_eq!(fakes.transports.live(), 0);
    }

    #[tokio::test]
    async fn test_destroy_all_peers_scoped_to_channel() {
        let (mut manager, fakes, _rx) = manager("alice");
        let session = VoiceSession::new("c1");
        manager.upsert_roster_entry(Some(&session), "c1", "bob").await;
        manager.upsert_roster_entry(Some(&session), "c1", "carol").await;
        manager.upsert_roster_entry(Some(&session), "c2", "dave").await;
        manager.attach_track("c1", "bob", remote_track(TrackKind::Audio, "t1"), "s1");

        manager.destroy_all_peers(Some("c1")).await;

        assert!(manager.roster_for("c1").is_empty());
        assert_eq!(manager.roster_for("c2").len(), 1);
        assert_eq!(fakes.transports.live(), 0);
        assert_eq!(fakes.vads.live(), 0);
        assert_eq!(fakes.renderer.live(), 0);

        manager.destroy_all_peers(None).await;
        assert_eq!(manager.channels().count(), 0);
    }

    #[tokio::test]
    async fn test_sync_roster_removes_unlisted() {
        let (mut manager, _fakes, _rx) = manager("alice");
        manager.upsert_roster_entry(None, "c1", "bob").await;
        manager.upsert_roster_entry(None, "c1", "carol").await;

        manager
            .sync_roster(None, "c1", &["carol".to_string(), "dave".to_string(), "alice".to_string()])
            .await;

        let users: Vec<&str> = manager.roster_for("c1").iter().map(|p| p.user_id()).collect();
        assert_eq!(users, vec!["carol", "dave"]);
    }

    #[tokio::test]
    async fn test_deafen_mutes_bound_sinks() {
        let (mut manager, fakes, _rx) = manager("alice");
        manager.upsert_roster_entry(None, "c1", "bob").await;
        manager.attach_track("c1", "bob", remote_track(TrackKind::Audio, "t1"), "s1");
        assert_eq!(fakes.renderer.muted("s1"), Some(false));

        manager.set_deafened(true);
        assert_eq!(fakes.renderer.muted("s1"), Some(true));

        manager.attach_track("c1", "bob", remote_track(TrackKind::Audio, "t2"), "s2");
        assert_eq!(fakes.renderer.muted("s2"), Some(true));
    }

    #[tokio::test]
    async fn test_failed_transport_marks_disconnected() {
        let (mut manager, fakes, _rx) = manager("alice");
        fakes
            .transports
            .fail
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let session = VoiceSession::new("c1");
        manager.upsert_roster_entry(Some(&session), "c1", "bob").await;

        let bob = manager.peer("c1", "bob").unwrap();
        assert_eq!(bob.status(), PeerStatus::Disconnected);
        assert!(!bob.has_transport());
    }
}
