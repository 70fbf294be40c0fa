//! Voice Module - Channel-Beitritt, Peers und lokale Medien
//!
//! Dieses Modul hält den gesamten Zustand eines Voice-Calls:
//! - `VoiceSession`: lokaler Channel, Mikrofon, Video, Mute/Deafen
//! - `PeerConnectionManager`: Roster pro Channel, Transports, Remote-Streams
//! - `VoiceCoordinator`: verarbeitet Kommandos und Ereignisse nacheinander
//! - `VoiceService`/`VoiceHandle`: Actor-Frontend mit Snapshot-Abfragen
//!

mod coordinator;
mod early_signals;
mod events;
mod manager;
mod peer;
mod service;
mod session;
mod snapshot;

pub use coordinator::{VoiceCoordinator, VoiceDeps, VoiceError};
pub use events::{VadId, VoiceEvent};
pub use manager::PeerConnectionManager;
pub use peer::{BundleKind, PeerConnection, PeerStatus, StreamBundle};
pub use service::{VoiceHandle, VoiceService};
pub use session::VoiceSession;
pub use snapshot::{BundleSnapshot, PeerSnapshot, SessionSnapshot, TrackSnapshot, VoiceSnapshot};
