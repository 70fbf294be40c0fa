//! Interne Events des Voice-Cores
//!
//! Transport- und VAD-Callbacks verändern keinen Zustand. Sie landen als
//! `VoiceEvent` in einer Queue, die der Besitzer (Coordinator) nacheinander
//! abarbeitet. Jede Instanz trägt eine eindeutige ID, damit Events bereits
//! zerstörter Instanzen verworfen werden können.

use crate::media::MediaStream;
use crate::transport::{TransportEvent, TransportEventSink, TransportId};
use crate::vad::VadCallbacks;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Eindeutige ID einer VAD-Instanz
pub type VadId = u64;

#[derive(Debug, Clone)]
pub enum VoiceEvent {
    Transport {
        id: TransportId,
        event: TransportEvent,
    },
    Vad {
        id: VadId,
        speaking: bool,
    },
    /// Ein lokaler Capture-Track wurde beendet (z.B. Gerät entfernt)
    LocalTrackEnded { stream_id: String },
}

/// Erzeugt IDs und Callbacks, die in die Event-Queue schreiben
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<VoiceEvent>,
    ids: Arc<AtomicU64>,
}

impl EventSender {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<VoiceEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                ids: Arc::new(AtomicU64::new(1)),
            },
            rx,
        )
    }

    pub fn next_id(&self) -> u64 {
        self.ids.fetch_add(1, Ordering::Relaxed)
    }

    pub fn transport_sink(&self, id: TransportId) -> TransportEventSink {
        let tx = self.tx.clone();
        TransportEventSink::new(id, move |id, event| {
            // Empfänger weg = Coordinator beendet
            let _ = tx.send(VoiceEvent::Transport { id, event });
        })
    }

    pub fn vad_callbacks(&self, id: VadId) -> VadCallbacks {
        let start_tx = self.tx.clone();
        let stop_tx = self.tx.clone();
        VadCallbacks::new(
            move || {
                let _ = start_tx.send(VoiceEvent::Vad { id, speaking: true });
            },
            move || {
                let _ = stop_tx.send(VoiceEvent::Vad { id, speaking: false });
            },
        )
    }

    /// Meldet `LocalTrackEnded` sobald der erste Track des Streams endet
    pub fn watch_stream_end(&self, stream: &MediaStream) {
        let Some(track) = stream.tracks().first().cloned() else {
            return;
        };
        let stream_id = stream.id().to_string();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            track.ended().await;
            let _ = tx.send(VoiceEvent::LocalTrackEnded { stream_id });
        });
    }
}
