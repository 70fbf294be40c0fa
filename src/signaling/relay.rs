use super::client::SignalingError;
use super::messages::SignalEnvelope;
use async_trait::async_trait;

/// Ausgehende Richtung des Signalings, wie sie der Voice-Core benötigt
#[async_trait]
pub trait SignalingRelay: Send + Sync {
    /// Meldet dem Server, dass der lokale Benutzer den Channel betritt
    async fn join_voice(&self, channel_id: &str) -> Result<(), SignalingError>;

    async fn leave_voice(&self, channel_id: &str) -> Result<(), SignalingError>;

    /// Leitet einen lokalen Signaling-Payload an genau einen Teilnehmer weiter
    async fn send_signal(&self, envelope: SignalEnvelope) -> Result<(), SignalingError>;
}
