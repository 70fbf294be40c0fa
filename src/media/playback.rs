//! Playback-Schnittstelle für Remote-Audio
//!
//! Ein `RenderSink` ist an genau ein Audio-Bundle gebunden und wird beim
//! Entfernen des Bundles wieder gelöst.

use super::capture::CaptureError;
use super::stream::MediaStream;

pub trait AudioRenderer: Send + Sync {
    /// Bindet die Wiedergabe an den ersten Audio-Track des Streams
    fn bind(&self, stream: &MediaStream) -> Result<Box<dyn RenderSink>, CaptureError>;
}

pub trait RenderSink: Send + Sync {
    fn stream_id(&self) -> &str;

    /// Stummschalten der lokalen Wiedergabe (Deafen)
    fn set_muted(&self, muted: bool);

    /// Löst die Wiedergabe und gibt das Ausgabegerät frei
    fn detach(self: Box<Self>);
}
