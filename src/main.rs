//! Kommandozeilen-Client: tritt einem Voice-Channel bei und bleibt bis Ctrl-C

use anyhow::Context;
use pulse_voice::media::{CpalCapture, CpalRenderer};
use pulse_voice::transport::WebRtcTransportFactory;
use pulse_voice::vad::EnergyVadFactory;
use pulse_voice::{init_logging, SignalingClient, VoiceConfig, VoiceCoordinator, VoiceDeps, VoiceService};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let config = VoiceConfig::load().context("failed to load voice config")?;
    let channel_id = std::env::var("VOICE_CHANNEL").context("VOICE_CHANNEL is not set")?;
    let user_id = std::env::var("VOICE_USER_ID").unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());

    let mut signaling = SignalingClient::new(config.websocket_url()?);
    let user_id = signaling
        .connect(&user_id)
        .await
        .context("failed to connect to signaling server")?;
    tracing::info!("Connected as '{}'", user_id);

    let signaling = Arc::new(signaling);
    Arc::clone(&signaling).start_heartbeat(config.heartbeat_interval());

    let deps = VoiceDeps {
        capture: Arc::new(CpalCapture::new()),
        transports: Arc::new(WebRtcTransportFactory::new()),
        vads: Arc::new(EnergyVadFactory::new()),
        renderer: Arc::new(CpalRenderer::new()),
        relay: signaling.clone(),
    };

    let coordinator = VoiceCoordinator::new(config, user_id, deps);
    let (voice, service) = VoiceService::spawn(coordinator);
    let forwarder = voice.forward_signaling(signaling.subscribe());

    voice.join_channel(&channel_id).await?;
    let mic_on = voice.toggle_mic().await?;
    tracing::info!("Microphone enabled: {}", mic_on);

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");

    voice.leave_channel().await?;
    voice.shutdown().await?;
    service.await?;
    forwarder.abort();

    Ok(())
}
