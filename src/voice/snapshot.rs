//! Serialisierbare Sicht auf den Voice-Zustand
//!
//! Wird nach jedem verarbeiteten Ereignis komplett neu erzeugt und über einen
//! `watch`-Kanal veröffentlicht. Leser sehen daher nie einen halben Zustand.

use super::manager::PeerConnectionManager;
use super::peer::{BundleKind, PeerConnection, PeerStatus, StreamBundle};
use super::session::VoiceSession;
use crate::media::TrackKind;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub channel_id: String,
    pub muted: bool,
    pub deafened: bool,
    pub voice_activity: bool,
    pub mic_enabled: bool,
    pub video_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackSnapshot {
    pub id: String,
    pub kind: TrackKind,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BundleSnapshot {
    pub stream_id: String,
    pub kind: BundleKind,
    pub tracks: Vec<TrackSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerSnapshot {
    pub user_id: String,
    pub status: PeerStatus,
    pub has_transport: bool,
    pub voice_activity: bool,
    pub mic_enabled: bool,
    pub video_enabled: bool,
    pub bundles: Vec<BundleSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VoiceSnapshot {
    pub local_user_id: String,
    pub session: Option<SessionSnapshot>,
    pub rosters: BTreeMap<String, Vec<PeerSnapshot>>,
    pub pending_signals: usize,
}

impl From<&StreamBundle> for BundleSnapshot {
    fn from(bundle: &StreamBundle) -> Self {
        Self {
            stream_id: bundle.stream_id().to_string(),
            kind: bundle.kind(),
            tracks: bundle
                .tracks()
                .iter()
                .map(|t| TrackSnapshot {
                    id: t.id().to_string(),
                    kind: t.kind(),
                    enabled: t.is_enabled(),
                })
                .collect(),
        }
    }
}

impl From<&PeerConnection> for PeerSnapshot {
    fn from(peer: &PeerConnection) -> Self {
        Self {
            user_id: peer.user_id().to_string(),
            status: peer.status(),
            has_transport: peer.has_transport(),
            voice_activity: peer.voice_activity(),
            mic_enabled: peer.mic_enabled(),
            video_enabled: peer.video_enabled(),
            bundles: peer.bundles().iter().map(BundleSnapshot::from).collect(),
        }
    }
}

impl From<&VoiceSession> for SessionSnapshot {
    fn from(session: &VoiceSession) -> Self {
        Self {
            channel_id: session.channel_id().to_string(),
            muted: session.is_muted(),
            deafened: session.is_deafened(),
            voice_activity: session.voice_activity(),
            mic_enabled: session.mic_enabled(),
            video_enabled: session.video_enabled(),
        }
    }
}

impl VoiceSnapshot {
    pub fn empty(local_user_id: &str) -> Self {
        Self {
            local_user_id: local_user_id.to_string(),
            session: None,
            rosters: BTreeMap::new(),
            pending_signals: 0,
        }
    }

    pub(crate) fn capture(
        local_user_id: &str,
        session: Option<&VoiceSession>,
        manager: &PeerConnectionManager,
    ) -> Self {
        let rosters = manager
            .channels()
            .map(|channel| {
                let peers = manager
                    .roster_for(channel)
                    .into_iter()
                    .map(PeerSnapshot::from)
                    .collect();
                (channel.to_string(), peers)
            })
            .collect();

        Self {
            local_user_id: local_user_id.to_string(),
            session: session.map(SessionSnapshot::from),
            rosters,
            pending_signals: manager.pending_signals(),
        }
    }

    pub fn current_session(&self) -> Option<&SessionSnapshot> {
        self.session.as_ref()
    }

    pub fn roster_for(&self, channel_id: &str) -> &[PeerSnapshot] {
        self.rosters
            .get(channel_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn is_mic_muted(&self) -> bool {
        self.session.as_ref().map_or(true, |s| s.muted)
    }

    pub fn is_deafened(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.deafened)
    }

    pub fn local_voice_activity(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.voice_activity)
    }

    pub fn remote_voice_activity(&self, user_id: &str) -> bool {
        self.session_peer(user_id).is_some_and(|p| p.voice_activity)
    }

    pub fn active_bundle(&self, user_id: &str, kind: BundleKind) -> Option<&BundleSnapshot> {
        self.session_peer(user_id)?
            .bundles
            .iter()
            .rev()
            .find(|b| b.kind == kind)
    }

    pub fn mic_enabled(&self, user_id: &str) -> bool {
        if user_id == self.local_user_id {
            return self.session.as_ref().is_some_and(|s| s.mic_enabled);
        }
        self.session_peer(user_id).is_some_and(|p| p.mic_enabled)
    }

    pub fn video_enabled(&self, user_id: &str) -> bool {
        if user_id == self.local_user_id {
            return self.session.as_ref().is_some_and(|s| s.video_enabled);
        }
        self.session_peer(user_id).is_some_and(|p| p.video_enabled)
    }

    pub fn voice_activity(&self, user_id: &str) -> bool {
        if user_id == self.local_user_id {
            return self.local_voice_activity();
        }
        self.remote_voice_activity(user_id)
    }

    fn session_peer(&self, user_id: &str) -> Option<&PeerSnapshot> {
        let session = self.session.as_ref()?;
        self.roster_for(&session.channel_id)
            .iter()
            .find(|p| p.user_id == user_id)
    }
}
