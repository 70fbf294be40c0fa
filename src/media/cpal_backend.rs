//! cpal-Backend - Mikrofon Capture und Playback
//!
//! cpal Streams sind nicht `Send`. Jeder Stream lebt deshalb auf einem
//! eigenen Thread, der ihn bis zum Stoppen des Tracks (bzw. Lösen des
//! Sinks) hält.

use super::capture::{
    CaptureError, DeviceKind, MediaCapture, MediaDevice, VideoConstraints,
};
use super::playback::{AudioRenderer, RenderSink};
use super::stream::{AudioFrame, MediaStream, MediaTrack, TrackKind, FRAME_SIZE, SAMPLE_RATE};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig, SupportedStreamConfigRange};
use ringbuf::{traits::*, HeapRb};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use tokio::sync::{broadcast, oneshot};

/// Buffer Size für Audio-Ring-Buffer
const RING_BUFFER_SIZE: usize = FRAME_SIZE * 10;

// ============================================================================
// CAPTURE
// ============================================================================

/// Media Capture über cpal (nur Audio)
#[derive(Debug, Default, Clone)]
pub struct CpalCapture;

impl CpalCapture {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MediaCapture for CpalCapture {
    async fn acquire_audio(&self, device_id: Option<&str>) -> Result<MediaStream, CaptureError> {
        let device_id = device_id.map(str::to_string);
        let track = MediaTrack::new(TrackKind::Audio, device_id.as_deref().unwrap_or("default"));
        let publisher = track.frame_publisher();

        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), CaptureError>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        std::thread::Builder::new()
            .name("pulse-audio-capture".to_string())
            .spawn(move || {
                let stream = match open_input_device(device_id.as_deref())
                    .and_then(|device| build_capture_stream(&device, publisher))
                {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                // Blockiert bis der Track gestoppt oder verworfen wird
                let _ = stop_rx.recv();
                drop(stream);
                tracing::info!("Audio capture stopped");
            })
            .map_err(|e| CaptureError::StreamBuild(e.to_string()))?;

        ready_rx
            .await
            .map_err(|_| CaptureError::StreamBuild("capture thread exited".to_string()))??;

        track.set_stop_hook(move || {
            let _ = stop_tx.send(());
        });

        Ok(MediaStream::new(vec![track]))
    }

    async fn acquire_video(
        &self,
        _constraints: &VideoConstraints,
    ) -> Result<MediaStream, CaptureError> {
        Err(CaptureError::Unsupported(
            "camera capture is not available in the cpal backend".to_string(),
        ))
    }

    async fn acquire_display(
        &self,
        _constraints: &VideoConstraints,
    ) -> Result<MediaStream, CaptureError> {
        Err(CaptureError::Unsupported(
            "display capture is not available in the cpal backend".to_string(),
        ))
    }

    async fn enumerate_devices(&self, kind: DeviceKind) -> Result<Vec<MediaDevice>, CaptureError> {
        tokio::task::spawn_blocking(move || list_devices(kind))
            .await
            .map_err(|e| CaptureError::Enumerate(e.to_string()))?
    }
}

fn list_devices(kind: DeviceKind) -> Result<Vec<MediaDevice>, CaptureError> {
    let host = cpal::default_host();

    let (default_name, devices) = match kind {
        DeviceKind::AudioInput => (
            host.default_input_device().and_then(|d| d.name().ok()),
            host.input_devices()
                .map_err(|e| CaptureError::Enumerate(e.to_string()))?
                .collect::<Vec<_>>(),
        ),
        DeviceKind::AudioOutput => (
            host.default_output_device().and_then(|d| d.name().ok()),
            host.output_devices()
                .map_err(|e| CaptureError::Enumerate(e.to_string()))?
                .collect::<Vec<_>>(),
        ),
        DeviceKind::VideoInput => return Ok(Vec::new()),
    };

    Ok(devices
        .into_iter()
        .filter_map(|d| {
            d.name().ok().map(|name| MediaDevice {
                is_default: Some(&name) == default_name.as_ref(),
                id: name.clone(),
                label: name,
                kind,
            })
        })
        .collect())
}

fn open_input_device(device_id: Option<&str>) -> Result<Device, CaptureError> {
    let host = cpal::default_host();
    match device_id {
        None => host.default_input_device().ok_or(CaptureError::NoInputDevice),
        Some(id) => host
            .input_devices()
            .map_err(|e| CaptureError::Enumerate(e.to_string()))?
            .find(|d| d.name().map(|n| n == id).unwrap_or(false))
            .ok_or_else(|| CaptureError::DeviceNotFound(id.to_string())),
    }
}

/// Baut den Input-Stream: Downmix auf Mono, Resampling auf 48kHz,
/// Ausgabe in Frames zu `FRAME_SIZE` Samples
fn build_capture_stream(
    device: &Device,
    publisher: super::stream::FramePublisher,
) -> Result<Stream, CaptureError> {
    let configs = device
        .supported_input_configs()
        .map_err(|e| CaptureError::UnsupportedConfig(e.to_string()))?;
    let config = select_best_config(configs.collect())?;

    tracing::info!(
        "Starting audio capture: {} Hz, {} channels",
        config.sample_rate.0,
        config.channels
    );

    let channels = config.channels.max(1) as usize;
    let source_sample_rate = config.sample_rate.0;
    let mut ring = HeapRb::<f32>::new(RING_BUFFER_SIZE);

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let mono: Vec<f32> = data
                    .chunks(channels)
                    .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
                    .collect();
                let samples = resample(&mono, source_sample_rate, SAMPLE_RATE);
                ring.push_slice(&samples);

                while ring.occupied_len() >= FRAME_SIZE {
                    let mut frame = vec![0.0f32; FRAME_SIZE];
                    ring.pop_slice(&mut frame);
                    let frame: AudioFrame = Arc::from(frame);
                    if !publisher.publish(frame) {
                        ring.clear();
                        break;
                    }
                }
            },
            |err| {
                tracing::error!("Audio capture error: {}", err);
            },
            None,
        )
        .map_err(|e| CaptureError::StreamBuild(e.to_string()))?;

    stream
        .play()
        .map_err(|e| CaptureError::StreamPlay(e.to_string()))?;

    Ok(stream)
}

/// Einfaches Linear-Resampling
fn resample(data: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    if source_rate == target_rate || data.is_empty() {
        return data.to_vec();
    }
    let ratio = target_rate as f32 / source_rate as f32;
    let new_len = (data.len() as f32 * ratio) as usize;
    (0..new_len)
        .map(|i| {
            let src_idx = i as f32 / ratio;
            let idx = src_idx as usize;
            let frac = src_idx - idx as f32;
            let s1 = data.get(idx).copied().unwrap_or(0.0);
            let s2 = data.get(idx + 1).copied().unwrap_or(s1);
            s1 + (s2 - s1) * frac
        })
        .collect()
}

/// Wählt die beste Konfiguration aus einer Liste
fn select_best_config(
    configs: Vec<SupportedStreamConfigRange>,
) -> Result<StreamConfig, CaptureError> {
    // Priorität: 48kHz > andere, F32 > andere
    let target_rate = cpal::SampleRate(SAMPLE_RATE);

    for config in &configs {
        if config.min_sample_rate() <= target_rate
            && config.max_sample_rate() >= target_rate
            && config.sample_format() == SampleFormat::F32
        {
            return Ok(config.with_sample_rate(target_rate).into());
        }
    }

    for config in &configs {
        if config.sample_format() == SampleFormat::F32 {
            return Ok(config.with_max_sample_rate().into());
        }
    }

    if let Some(config) = configs.first() {
        return Ok(config.with_max_sample_rate().into());
    }

    Err(CaptureError::UnsupportedConfig(
        "No suitable audio configuration found".to_string(),
    ))
}

// ============================================================================
// PLAYBACK
// ============================================================================

/// Spielt Remote-Audio auf dem Standard-Ausgabegerät ab
#[derive(Debug, Default, Clone)]
pub struct CpalRenderer;

impl CpalRenderer {
    pub fn new() -> Self {
        Self
    }
}

struct CpalSink {
    stream_id: String,
    muted: Arc<AtomicBool>,
    // Drop beendet den Playback-Thread
    _stop_tx: std_mpsc::Sender<()>,
}

impl RenderSink for CpalSink {
    fn stream_id(&self) -> &str {
        &self.stream_id
    }

    fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Release);
        tracing::debug!(stream = %self.stream_id, "Playback muted: {}", muted);
    }

    fn detach(self: Box<Self>) {
        tracing::debug!(stream = %self.stream_id, "Playback detached");
    }
}

impl AudioRenderer for CpalRenderer {
    fn bind(&self, stream: &MediaStream) -> Result<Box<dyn RenderSink>, CaptureError> {
        let track = stream
            .audio_tracks()
            .next()
            .cloned()
            .ok_or_else(|| CaptureError::StreamBuild("stream has no audio track".to_string()))?;

        let frames = track.subscribe_frames();
        let muted = Arc::new(AtomicBool::new(false));
        let muted_clone = Arc::clone(&muted);
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), CaptureError>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        std::thread::Builder::new()
            .name("pulse-audio-playback".to_string())
            .spawn(move || {
                let stream = match build_playback_stream(frames, muted_clone) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| CaptureError::StreamBuild(e.to_string()))?;

        ready_rx
            .recv()
            .map_err(|_| CaptureError::StreamBuild("playback thread exited".to_string()))??;

        Ok(Box::new(CpalSink {
            stream_id: stream.id().to_string(),
            muted,
            _stop_tx: stop_tx,
        }))
    }
}

fn build_playback_stream(
    mut frames: broadcast::Receiver<AudioFrame>,
    muted: Arc<AtomicBool>,
) -> Result<Stream, CaptureError> {
    let device = cpal::default_host()
        .default_output_device()
        .ok_or(CaptureError::NoOutputDevice)?;
    let configs = device
        .supported_output_configs()
        .map_err(|e| CaptureError::UnsupportedConfig(e.to_string()))?;
    let config = select_best_config(configs.collect())?;

    tracing::info!(
        "Starting audio playback: {} Hz, {} channels",
        config.sample_rate.0,
        config.channels
    );

    let channels = config.channels.max(1) as usize;
    let target_sample_rate = config.sample_rate.0;
    let mut ring = HeapRb::<f32>::new(RING_BUFFER_SIZE);

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                // Neue Frames nicht-blockierend einsammeln
                loop {
                    match frames.try_recv() {
                        Ok(frame) => {
                            let samples = resample(&frame, SAMPLE_RATE, target_sample_rate);
                            ring.push_slice(&samples);
                        }
                        Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                        Err(_) => break,
                    }
                }

                let silent = muted.load(Ordering::Acquire);
                for frame in data.chunks_mut(channels) {
                    let sample = ring.try_pop().unwrap_or(0.0);
                    let sample = if silent { 0.0 } else { sample };
                    for s in frame.iter_mut() {
                        *s = sample;
                    }
                }
            },
            |err| {
                tracing::error!("Audio playback error: {}", err);
            },
            None,
        )
        .map_err(|e| CaptureError::StreamBuild(e.to_string()))?;

    stream
        .play()
        .map_err(|e| CaptureError::StreamPlay(e.to_string()))?;

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resample_identity() {
        let data = vec![0.1, 0.2, 0.3];
        assert_eq!(resample(&data, 48000, 48000), data);
    }

    #[test]
    fn test_resample_upsamples_length() {
        let data = vec![0.0f32; 441];
        let out = resample(&data, 44100, 48000);
        assert_eq!(out.len(), 480);
    }

    #[test]
    fn test_select_best_config_empty() {
        assert!(matches!(
            select_best_config(Vec::new()),
            Err(CaptureError::UnsupportedConfig(_))
        ));
    }
}
