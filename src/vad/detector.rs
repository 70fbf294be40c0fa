//! Energie-basierte Voice Activity Detection
//!
//! Misst zu Beginn für `noise_capture_duration` den Grundpegel, klemmt ihn auf
//! `[min_noise_level, max_noise_level]` und multipliziert ihn mit
//! `avg_noise_multiplier`. Danach zählt ein Aktivitätszähler Frames über bzw.
//! unter dieser Schwelle; das Überschreiten von `ACTIVITY_THRESHOLD` erzeugt
//! die Voice-Start/Stop-Flanken (Hysterese).

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::media::SAMPLE_RATE;

/// Obergrenze des Aktivitätszählers (~600ms Nachlauf bei 20ms Frames)
const ACTIVITY_MAX: u32 = 30;

/// Zählerstand, ab dem Sprache als aktiv gilt
const ACTIVITY_THRESHOLD: u32 = 5;

/// Dynamikbereich der Pegel-Normalisierung in dB
const LEVEL_RANGE_DB: f32 = 60.0;

// ============================================================================
// OPTIONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VadOptions {
    /// Untergrenze des Noise-Floors (normalisierter Pegel 0.0 - 1.0)
    pub min_noise_level: f32,
    /// Obergrenze des Noise-Floors
    pub max_noise_level: f32,
    /// Dauer der Noise-Floor-Messung in Millisekunden
    pub noise_capture_duration_ms: u64,
    pub avg_noise_multiplier: f32,
}

impl VadOptions {
    /// Eigenes Mikrofon: ein bekannter Sprecher, daher breiterer Bereich
    pub fn local() -> Self {
        Self {
            min_noise_level: 0.15,
            max_noise_level: 0.8,
            noise_capture_duration_ms: 500,
            avg_noise_multiplier: 1.2,
        }
    }

    pub fn remote() -> Self {
        Self {
            min_noise_level: 0.3,
            max_noise_level: 0.7,
            noise_capture_duration_ms: 1000,
            avg_noise_multiplier: 1.1,
        }
    }

    pub fn noise_capture_duration(&self) -> Duration {
        Duration::from_millis(self.noise_capture_duration_ms)
    }
}

impl Default for VadOptions {
    fn default() -> Self {
        Self::remote()
    }
}

// ============================================================================
// DETECTOR
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEdge {
    VoiceStart,
    VoiceStop,
}

#[derive(Debug)]
pub struct VoiceActivityDetector {
    options: VadOptions,
    captured: Duration,
    noise_sum: f32,
    noise_frames: u32,
    base_level: Option<f32>,
    activity: u32,
    speaking: bool,
}

impl VoiceActivityDetector {
    pub fn new(options: VadOptions) -> Self {
        Self {
            options,
            captured: Duration::ZERO,
            noise_sum: 0.0,
            noise_frames: 0,
            base_level: None,
            activity: 0,
            speaking: false,
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// Schwelle nach abgeschlossener Noise-Messung
    pub fn base_level(&self) -> Option<f32> {
        self.base_level
    }

    /// RMS-Pegel, logarithmisch auf 0.0 - 1.0 normalisiert
    pub fn level(samples: &[f32]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }
        let rms = (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt();
        if rms <= f32::EPSILON {
            return 0.0;
        }
        let db = 20.0 * rms.log10();
        ((db + LEVEL_RANGE_DB) / LEVEL_RANGE_DB).clamp(0.0, 1.0)
    }

    /// Verarbeitet einen Frame; gibt eine Flanke zurück wenn sich der Zustand ändert
    pub fn process(&mut self, samples: &[f32]) -> Option<VadEdge> {
        let level = Self::level(samples);

        let base_level = match self.base_level {
            Some(base) => base,
            None => {
                self.capture_noise(level, samples.len());
                return None;
            }
        };

        if level >= base_level {
            self.activity = (self.activity + 1).min(ACTIVITY_MAX);
        } else {
            self.activity = self.activity.saturating_sub(1);
        }

        if self.activity > ACTIVITY_THRESHOLD && !self.speaking {
            self.speaking = true;
            return Some(VadEdge::VoiceStart);
        }
        if self.activity < ACTIVITY_THRESHOLD && self.speaking {
            self.speaking = false;
            return Some(VadEdge::VoiceStop);
        }
        None
    }

    fn capture_noise(&mut self, level: f32, sample_count: usize) {
        self.noise_sum += level;
        self.noise_frames += 1;
        self.captured += Duration::from_secs_f64(sample_count as f64 / SAMPLE_RATE as f64);

        if self.captured >= self.options.noise_capture_duration() {
            let average = self.noise_sum / self.noise_frames as f32;
            let clamped = average.clamp(self.options.min_noise_level, self.options.max_noise_level);
            let base = clamped * self.options.avg_noise_multiplier;
            tracing::debug!(
                "VAD noise floor captured: avg={:.3}, threshold={:.3}",
                average,
                base
            );
            self.base_level = Some(base);
        }
    }
}
