//! WebRTC Peer Transport
//!
//! Eine `RTCPeerConnection` pro Remote-Teilnehmer. Signaling-Payloads sind
//! JSON-Objekte (`offer`, `answer`, `candidate`, `renegotiate`).
//!
//! Offers erstellt nur der unhöfliche Peer (höhere User-ID). Der höfliche
//! Peer beantwortet sie und bittet bei eigenen Stream-Änderungen per
//! `renegotiate` um ein neues Offer. Ohne Rollback in webrtc-rs darf es keine
//! zwei gleichzeitigen Offers geben.

use super::{
    PeerTransport, SignalPayload, TransportError, TransportEvent, TransportEventSink,
    TransportFactory, TransportOptions,
};
use crate::config::IceServer;
use crate::media::{MediaStream, MediaTrack, TrackKind, SAMPLE_RATE};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

// ============================================================================
// WIRE FORMAT
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireSignal {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate { candidate: RTCIceCandidateInit },
    Renegotiate,
}

impl WireSignal {
    fn into_payload(self) -> Option<SignalPayload> {
        match serde_json::to_value(self) {
            Ok(value) => Some(SignalPayload(value)),
            Err(e) => {
                tracing::error!("Failed to encode signal: {}", e);
                None
            }
        }
    }
}

fn webrtc_err(e: webrtc::Error) -> TransportError {
    TransportError::WebRTC(e.to_string())
}

// ============================================================================
// FACTORY
// ============================================================================

/// Erstellt `WebRtcTransport`s
#[derive(Debug, Clone, Default)]
pub struct WebRtcTransportFactory;

impl WebRtcTransportFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        options: TransportOptions,
        events: TransportEventSink,
    ) -> Result<Box<dyn PeerTransport>, TransportError> {
        let transport = WebRtcTransport::connect(options, events).await?;
        Ok(Box::new(transport))
    }
}

// ============================================================================
// TRANSPORT
// ============================================================================

struct Shared {
    initiator: bool,
    /// Höflich = beantwortet nur, unhöflich = erstellt die Offers
    polite: bool,
    events: TransportEventSink,
    /// ICE Candidates, die vor der Remote Description eintreffen
    pending_candidates: Mutex<Vec<RTCIceCandidateInit>>,
    /// Serialisiert Offers aus `on_negotiation_needed` und `renegotiate`
    negotiating: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    shared: Arc<Shared>,
    /// RTP Sender pro lokaler Track-ID
    senders: Mutex<HashMap<String, Arc<RTCRtpSender>>>,
}

impl WebRtcTransport {
    /// Erstellt eine neue Peer Connection und registriert die Event Handler
    pub async fn connect(
        options: TransportOptions,
        events: TransportEventSink,
    ) -> Result<Self, TransportError> {
        // Media Engine mit Standard-Codecs (Opus, VP8, ...)
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(webrtc_err)?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(webrtc_err)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: options.ice_servers.iter().map(to_rtc_ice_server).collect(),
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await.map_err(webrtc_err)?);

        let shared = Arc::new(Shared {
            initiator: options.initiator,
            polite: options.polite,
            events,
            pending_candidates: Mutex::new(Vec::new()),
            negotiating: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        });

        Self::setup_handlers(&pc, &shared);

        if !options.polite {
            // Empfangs-Transceiver, damit der Remote-Peer Audio/Video senden kann.
            // Löst `on_negotiation_needed` und damit das erste Offer aus.
            for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
                pc.add_transceiver_from_kind(
                    kind,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await
                .map_err(webrtc_err)?;
            }
        }

        if options.initiator && options.polite {
            // Der Remote-Peer soll das erste Offer schicken
            if let Some(payload) = WireSignal::Renegotiate.into_payload() {
                shared.events.emit(TransportEvent::Signal(payload));
            }
        }

        tracing::debug!(
            transport = shared.events.id(),
            initiator = options.initiator,
            polite = options.polite,
            "Peer connection created"
        );

        Ok(Self {
            pc,
            shared,
            senders: Mutex::new(HashMap::new()),
        })
    }

    /// Registriert Event Handler für die Peer Connection
    fn setup_handlers(pc: &Arc<RTCPeerConnection>, shared: &Arc<Shared>) {
        // Connection State Handler
        let state_shared = Arc::clone(shared);
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            tracing::info!(transport = state_shared.events.id(), "Peer connection state: {:?}", s);

            if !state_shared.closed.load(Ordering::Acquire) {
                match s {
                    RTCPeerConnectionState::Connected => {
                        state_shared.events.emit(TransportEvent::Connected)
                    }
                    RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Failed => {
                        state_shared
                            .events
                            .emit(TransportEvent::Error(format!("connection {}", s)))
                    }
                    RTCPeerConnectionState::Closed => state_shared.events.emit(TransportEvent::Closed),
                    _ => {}
                }
            }

            Box::pin(async {})
        }));

        // ICE Candidate Handler
        let ice_shared = Arc::clone(shared);
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            if let Some(c) = candidate {
                match c.to_json() {
                    Ok(candidate) => {
                        if let Some(payload) = (WireSignal::Candidate { candidate }).into_payload() {
                            ice_shared.events.emit(TransportEvent::Signal(payload));
                        }
                    }
                    Err(e) => tracing::warn!("Failed to serialize ICE candidate: {}", e),
                }
            }
            Box::pin(async {})
        }));

        // Track Handler (für eingehendes Audio/Video)
        let track_shared = Arc::clone(shared);
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>, _: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| {
                let shared = Arc::clone(&track_shared);
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Audio => TrackKind::Audio,
                        RTPCodecType::Video => TrackKind::Video,
                        other => {
                            tracing::warn!("Ignoring remote track of kind {}", other);
                            return;
                        }
                    };
                    let track_id = track.id();
                    let stream_id = track.stream_id();
                    tracing::info!(
                        transport = shared.events.id(),
                        "Received {:?} track {} on stream {}",
                        kind,
                        track_id,
                        stream_id
                    );

                    let media_track = MediaTrack::with_id(track_id.clone(), kind, "remote");
                    shared.events.emit(TransportEvent::Track {
                        track: media_track,
                        stream_id,
                    });

                    // RTP lesen hält die Interceptors am Laufen; Dekodierung ist
                    // Sache des Codec-Layers. Lese-Fehler = Track beendet.
                    tokio::spawn(async move {
                        while track.read_rtp().await.is_ok() {}
                        if !shared.closed.load(Ordering::Acquire) {
                            shared.events.emit(TransportEvent::TrackEnded { track_id });
                        }
                    });
                })
            },
        ));

        // Negotiation Handler
        let pc_weak = Arc::downgrade(pc);
        let negotiation_shared = Arc::clone(shared);
        pc.on_negotiation_needed(Box::new(move || {
            let pc_weak = pc_weak.clone();
            let shared = Arc::clone(&negotiation_shared);
            Box::pin(async move {
                tokio::spawn(async move {
                    if let Err(e) = negotiate(pc_weak, shared).await {
                        tracing::warn!("Negotiation failed: {}", e);
                    }
                });
            })
        }));
    }

    async fn flush_pending_candidates(&self) -> Result<(), TransportError> {
        let pending: Vec<RTCIceCandidateInit> = self.shared.pending_candidates.lock().drain(..).collect();
        for candidate in pending {
            self.pc
                .add_ice_candidate(candidate)
                .await
                .map_err(webrtc_err)?;
        }
        Ok(())
    }

    async fn handle_offer(&self, sdp: String) -> Result<(), TransportError> {
        if self.pc.signaling_state() == RTCSignalingState::HaveLocalOffer {
            // Nur ein nicht konformer Remote-Peer schickt uns ein Offer, während wir offerieren
            tracing::warn!(
                transport = self.shared.events.id(),
                "Ignoring colliding remote offer"
            );
            return Ok(());
        }

        let offer = RTCSessionDescription::offer(sdp)
            .map_err(|e| TransportError::InvalidSignal(e.to_string()))?;
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(webrtc_err)?;
        self.flush_pending_candidates().await?;

        let answer = self.pc.create_answer(None).await.map_err(webrtc_err)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(webrtc_err)?;

        if let Some(payload) = (WireSignal::Answer { sdp: answer.sdp }).into_payload() {
            self.shared.events.emit(TransportEvent::Signal(payload));
        }
        Ok(())
    }
}

/// Erstellt ein Offer (unhöflich) oder bittet den Remote-Peer darum (höflich)
async fn negotiate(pc: Weak<RTCPeerConnection>, shared: Arc<Shared>) -> Result<(), TransportError> {
    if shared.closed.load(Ordering::Acquire) {
        return Ok(());
    }

    if shared.polite {
        if let Some(payload) = WireSignal::Renegotiate.into_payload() {
            shared.events.emit(TransportEvent::Signal(payload));
        }
        return Ok(());
    }

    let _guard = shared.negotiating.lock().await;
    let Some(pc) = pc.upgrade() else {
        return Ok(());
    };
    if pc.signaling_state() != RTCSignalingState::Stable {
        tracing::debug!("Skipping negotiation, signaling state {}", pc.signaling_state());
        return Ok(());
    }

    let offer = pc.create_offer(None).await.map_err(webrtc_err)?;
    pc.set_local_description(offer.clone())
        .await
        .map_err(webrtc_err)?;

    if let Some(payload) = (WireSignal::Offer { sdp: offer.sdp }).into_payload() {
        shared.events.emit(TransportEvent::Signal(payload));
    }
    Ok(())
}

fn to_rtc_ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone(),
        credential: server.credential.clone(),
        ..Default::default()
    }
}

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_string(),
            clock_rate: SAMPLE_RATE,
            channels: 1,
            ..Default::default()
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_string(),
            clock_rate: 90000,
            ..Default::default()
        },
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn signal(&self, payload: SignalPayload) -> Result<(), TransportError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        let signal: WireSignal = serde_json::from_value(payload.0)
            .map_err(|e| TransportError::InvalidSignal(e.to_string()))?;

        match signal {
            WireSignal::Offer { sdp } => self.handle_offer(sdp).await,
            WireSignal::Answer { sdp } => {
                let answer = RTCSessionDescription::answer(sdp)
                    .map_err(|e| TransportError::InvalidSignal(e.to_string()))?;
                self.pc
                    .set_remote_description(answer)
                    .await
                    .map_err(webrtc_err)?;
                self.flush_pending_candidates().await
            }
            WireSignal::Candidate { candidate } => {
                if self.pc.remote_description().await.is_none() {
                    self.shared.pending_candidates.lock().push(candidate);
                    return Ok(());
                }
                self.pc
                    .add_ice_candidate(candidate)
                    .await
                    .map_err(webrtc_err)
            }
            WireSignal::Renegotiate => {
                if self.shared.polite {
                    tracing::debug!(transport = self.shared.events.id(), "Ignoring renegotiation request");
                    return Ok(());
                }
                negotiate(Arc::downgrade(&self.pc), Arc::clone(&self.shared)).await
            }
        }
    }

    async fn add_stream(&self, stream: &MediaStream) -> Result<(), TransportError> {
        for track in stream.tracks() {
            if self.senders.lock().contains_key(track.id()) {
                continue;
            }

            // TODO: Opus/VP8-Encoder anbinden und Frames aktivierter Tracks schreiben
            let local_track = Arc::new(TrackLocalStaticRTP::new(
                codec_for(track.kind()),
                track.id().to_string(),
                stream.id().to_string(),
            ));

            let sender = self
                .pc
                .add_track(Arc::clone(&local_track) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(webrtc_err)?;
            self.senders.lock().insert(track.id().to_string(), sender);
        }
        Ok(())
    }

    async fn remove_stream(&self, stream: &MediaStream) -> Result<(), TransportError> {
        for track in stream.tracks() {
            let sender = self.senders.lock().remove(track.id());
            if let Some(sender) = sender {
                self.pc.remove_track(&sender).await.map_err(webrtc_err)?;
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.senders.lock().clear();
        self.pc.close().await.map_err(webrtc_err)
    }
}

impl std::fmt::Debug for WebRtcTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcTransport")
            .field("id", &self.shared.events.id())
            .field("initiator", &self.shared.initiator)
            .field("polite", &self.shared.polite)
            .field("signaling_state", &self.pc.signaling_state())
            .finish()
    }
}
