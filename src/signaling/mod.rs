//! Signaling Module - WebSocket Client für den Chat-Server
//!
//! Dieses Modul verwaltet die Kommunikation mit dem Signaling-Server:
//! - WebSocket-Verbindung aufbauen und halten
//! - Voice-Join/Leave melden und Signaling-Payloads weiterleiten
//! - Eingehende Nachrichten parsen und als Events verteilen
//!

mod client;
mod messages;
mod relay;

pub use client::{SignalingClient, SignalingError, SignalingEvent};
pub use messages::*;
pub use relay::SignalingRelay;
