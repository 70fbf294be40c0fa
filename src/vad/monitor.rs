//! VAD-Instanzen pro Audio-Stream
//!
//! Eine Instanz liest die Frames des ersten Audio-Tracks eines Streams und
//! ruft bei jeder Flanke den passenden Callback auf. Die Callbacks selbst
//! verändern keinen Zustand, sondern reichen das Ereignis an den Besitzer
//! weiter.

use super::detector::{VadEdge, VadOptions, VoiceActivityDetector};
use crate::media::MediaStream;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

#[derive(Error, Debug, Clone)]
pub enum VadError {
    #[error("Stream {0} has no audio track")]
    NoAudioTrack(String),
}

type Callback = Arc<dyn Fn() + Send + Sync>;

/// `on_voice_start` / `on_voice_stop` einer VAD-Instanz
#[derive(Clone)]
pub struct VadCallbacks {
    on_voice_start: Callback,
    on_voice_stop: Callback,
}

impl VadCallbacks {
    pub fn new<S, E>(on_voice_start: S, on_voice_stop: E) -> Self
    where
        S: Fn() + Send + Sync + 'static,
        E: Fn() + Send + Sync + 'static,
    {
        Self {
            on_voice_start: Arc::new(on_voice_start),
            on_voice_stop: Arc::new(on_voice_stop),
        }
    }

    pub fn voice_start(&self) {
        (self.on_voice_start)();
    }

    pub fn voice_stop(&self) {
        (self.on_voice_stop)();
    }
}

impl fmt::Debug for VadCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VadCallbacks").finish_non_exhaustive()
    }
}

pub trait VadInstance: Send + Sync {
    /// Beendet die Analyse; danach werden keine Callbacks mehr aufgerufen
    fn destroy(self: Box<Self>);
}

pub trait VadFactory: Send + Sync {
    fn create(
        &self,
        stream: &MediaStream,
        options: VadOptions,
        callbacks: VadCallbacks,
    ) -> Result<Box<dyn VadInstance>, VadError>;
}

// ============================================================================
// ENERGY VAD
// ============================================================================

/// Startet pro Instanz einen Tokio-Task mit einem `VoiceActivityDetector`
#[derive(Debug, Default, Clone)]
pub struct EnergyVadFactory;

impl EnergyVadFactory {
    pub fn new() -> Self {
        Self
    }
}

struct EnergyVad {
    task: JoinHandle<()>,
}

impl VadInstance for EnergyVad {
    fn destroy(self: Box<Self>) {
        // Drop bricht den Task ab
    }
}

impl Drop for EnergyVad {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl VadFactory for EnergyVadFactory {
    fn create(
        &self,
        stream: &MediaStream,
        options: VadOptions,
        callbacks: VadCallbacks,
    ) -> Result<Box<dyn VadInstance>, VadError> {
        let track = stream
            .audio_tracks()
            .next()
            .ok_or_else(|| VadError::NoAudioTrack(stream.id().to_string()))?;

        let mut frames = track.subscribe_frames();
        let stream_id = stream.id().to_string();

        let task = tokio::spawn(async move {
            let mut detector = VoiceActivityDetector::new(options);
            loop {
                match frames.recv().await {
                    Ok(frame) => match detector.process(&frame) {
                        Some(VadEdge::VoiceStart) => callbacks.voice_start(),
                        Some(VadEdge::VoiceStop) => callbacks.voice_stop(),
                        None => {}
                    },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(stream = %stream_id, "VAD lagged, skipped {} frames", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            tracing::debug!(stream = %stream_id, "VAD task finished");
        });

        Ok(Box::new(EnergyVad { task }))
    }
}
