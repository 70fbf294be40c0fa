//! Konfiguration des Voice-Subsystems
//!
//! Lädt `voice.json` aus dem App-Konfigurationsverzeichnis (falls vorhanden)
//! und wendet danach Umgebungsvariablen an:
//! - `SIGNALING_URL`
//! - `VOICE_INPUT_DEVICE`
//! - `VOICE_TURN_URL`, `VOICE_TURN_USERNAME`, `VOICE_TURN_CREDENTIAL`

use crate::vad::VadOptions;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid signaling url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
}

// ============================================================================
// ICE SERVER CONFIGURATION
// ============================================================================

/// STUN/TURN Server, wie er an den Peer Transport übergeben wird
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

/// Standard STUN Server (Google, reicht für die meisten Verbindungen)
pub fn default_ice_servers() -> Vec<IceServer> {
    vec![IceServer {
        urls: vec![
            "stun:stun.l.google.com:19302".to_string(),
            "stun:stun1.l.google.com:19302".to_string(),
            "stun:stun2.l.google.com:19302".to_string(),
        ],
        username: String::new(),
        credential: String::new(),
    }]
}

// ============================================================================
// VOICE CONFIG
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    pub signaling_url: String,
    pub ice_servers: Vec<IceServer>,
    /// Geräte-ID des Mikrofons, `None` = Standardgerät
    pub input_device: Option<String>,
    /// VAD für das eigene Mikrofon (ein bekannter Sprecher, lockerer Noise-Floor)
    pub local_vad: VadOptions,
    /// VAD für Remote-Teilnehmer
    pub remote_vad: VadOptions,
    pub early_signal_ttl_ms: u64,
    pub max_early_signals: usize,
    pub close_timeout_ms: u64,
    pub heartbeat_interval_secs: u64,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            signaling_url: "ws://localhost:8080/ws".to_string(),
            ice_servers: default_ice_servers(),
            input_device: None,
            local_vad: VadOptions::local(),
            remote_vad: VadOptions::remote(),
            early_signal_ttl_ms: 5_000,
            max_early_signals: 32,
            close_timeout_ms: 2_000,
            heartbeat_interval_secs: 25,
        }
    }
}

impl VoiceConfig {
    /// Lädt die Konfiguration aus dem Standardpfad und wendet Env-Overrides an
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match Self::config_path() {
            Some(path) if path.exists() => {
                tracing::info!("Loading voice config from {:?}", path);
                Self::read_file(&path)?
            }
            _ => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Lädt die Konfiguration aus einer bestimmten Datei (ohne Env-Overrides)
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let config = Self::read_file(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn early_signal_ttl(&self) -> Duration {
        Duration::from_millis(self.early_signal_ttl_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// WebSocket-URL des Signaling-Servers (`http(s)` → `ws(s)`, Pfad `/ws`)
    pub fn websocket_url(&self) -> Result<url::Url, ConfigError> {
        let mut url = self.parsed_signaling_url()?;
        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme).map_err(|_| ConfigError::InvalidUrl {
            url: self.signaling_url.clone(),
            reason: "cannot switch to websocket scheme".to_string(),
        })?;
        if url.path() == "/" || url.path().is_empty() {
            url.set_path("/ws");
        }
        Ok(url)
    }

    fn parsed_signaling_url(&self) -> Result<url::Url, ConfigError> {
        url::Url::parse(&self.signaling_url).map_err(|e| ConfigError::InvalidUrl {
            url: self.signaling_url.clone(),
            reason: e.to_string(),
        })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let url = self.parsed_signaling_url()?;
        match url.scheme() {
            "http" | "https" | "ws" | "wss" => Ok(()),
            other => Err(ConfigError::InvalidUrl {
                url: self.signaling_url.clone(),
                reason: format!("unsupported scheme '{}'", other),
            }),
        }
    }

    fn read_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("SIGNALING_URL") {
            self.signaling_url = url;
        }
        if let Some(device) = lookup("VOICE_INPUT_DEVICE") {
            self.input_device = Some(device);
        }
        if let Some(turn_url) = lookup("VOICE_TURN_URL") {
            self.ice_servers.push(IceServer {
                urls: vec![turn_url],
                username: lookup("VOICE_TURN_USERNAME").unwrap_or_default(),
                credential: lookup("VOICE_TURN_CREDENTIAL").unwrap_or_default(),
            });
        }
    }

    fn config_path() -> Option<PathBuf> {
        let proj_dirs = directories::ProjectDirs::from("com", "kaufm", "call-app")?;
        let mut path = proj_dirs.config_dir().to_path_buf();
        path.push("voice.json");
        Some(path)
    }
}
