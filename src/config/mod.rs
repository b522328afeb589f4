use crate::global;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub media: MediaConfig,
    pub signaling: SignalingConfig,
    pub capture: CaptureConfig,
    pub speech: SpeechConfig,
    pub relay: RelayConfig,
    pub throttle: ThrottleConfig,
}

/// HTTP API and WebSocket signaling listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_ip: String,
    pub http_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub listen_ip: String,
    pub announced_ip: Option<String>,
    /// Applied to every WebRTC transport right after it is created.
    pub max_incoming_bitrate: Option<u32>,
    pub initial_available_outgoing_bitrate: u32,
    /// Extra consumers created per (peer, producer) pair. Load testing only.
    pub consumer_replicas: u32,
    pub audio_level: AudioLevelConfig,
    pub media_codecs: Vec<Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioLevelConfig {
    pub max_entries: u16,
    pub threshold: i8,
    pub interval_ms: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Upper bound for `newConsumer` / `newDataConsumer` round trips.
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub enabled: bool,
    /// Address the tap transport sends RTP to and the transcoder listens on.
    pub listen_ip: String,
    pub port_min: u16,
    pub port_max: u16,
    pub max_port_attempts: u32,
    /// Pause between claiming the room and creating the tap transport.
    pub start_delay_ms: u64,
    pub ffmpeg_path: Option<String>,
    pub work_dir: Option<PathBuf>,
    pub sample_rate: u32,
    pub channels: u8,
    pub language: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Shared secret for applyNetworkThrottle / resetNetworkThrottle. Unset
    /// means both requests are always refused.
    pub secret: Option<String>,
    pub command: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_ip: "0.0.0.0".to_string(),
            http_port: 4443,
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            listen_ip: "0.0.0.0".to_string(),
            announced_ip: None,
            max_incoming_bitrate: Some(1_500_000),
            initial_available_outgoing_bitrate: 1_000_000,
            consumer_replicas: 0,
            audio_level: AudioLevelConfig::default(),
            media_codecs: default_media_codecs(),
        }
    }
}

impl Default for AudioLevelConfig {
    fn default() -> Self {
        Self {
            max_entries: 1,
            threshold: -80,
            interval_ms: 800,
        }
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 20,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_ip: "127.0.0.1".to_string(),
            port_min: 8000,
            port_max: 9000,
            max_port_attempts: 128,
            start_delay_ms: 1000,
            ffmpeg_path: None,
            work_dir: None,
            sample_rate: 16000,
            channels: 1,
            language: "en-US".to_string(),
        }
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            secret: None,
            command: "throttle".to_string(),
        }
    }
}

fn default_media_codecs() -> Vec<Value> {
    vec![
        json!({
            "kind": "audio",
            "mimeType": "audio/opus",
            "clockRate": 48000,
            "channels": 2
        }),
        json!({
            "kind": "video",
            "mimeType": "video/VP8",
            "clockRate": 90000,
            "parameters": { "x-google-start-bitrate": 1000 }
        }),
        json!({
            "kind": "video",
            "mimeType": "video/VP9",
            "clockRate": 90000,
            "parameters": { "profile-id": 2, "x-google-start-bitrate": 1000 }
        }),
        json!({
            "kind": "video",
            "mimeType": "video/h264",
            "clockRate": 90000,
            "parameters": {
                "packetization-mode": 1,
                "profile-level-id": "4d0032",
                "level-asymmetry-allowed": 1,
                "x-google-start-bitrate": 1000
            }
        }),
        json!({
            "kind": "video",
            "mimeType": "video/h264",
            "clockRate": 90000,
            "parameters": {
                "packetization-mode": 1,
                "profile-level-id": "42e01f",
                "level-asymmetry-allowed": 1,
                "x-google-start-bitrate": 1000
            }
        }),
    ]
}

impl CaptureConfig {
    /// Directory for SDP and transcript files.
    pub fn work_dir(&self) -> Result<PathBuf> {
        match &self.work_dir {
            Some(dir) => Ok(dir.clone()),
            None => global::capture_dir(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        if !config_path.exists() {
            info!(
                "Config file not found, creating default at {:?}",
                config_path
            );
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content =
            std::fs::read_to_string(&config_path).context("Failed to read config file")?;

        let config: Self = toml::from_str(&content).context("Failed to parse config file")?;

        info!("Loaded config from {:?}", config_path);
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(&config_path, content).context("Failed to write config file")?;

        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        global::config_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.capture.port_min, 8000);
        assert_eq!(config.capture.port_max, 9000);
        assert_eq!(config.capture.sample_rate, 16000);
        assert_eq!(config.media.audio_level.threshold, -80);
        assert_eq!(config.media.audio_level.interval_ms, 800);
        assert_eq!(config.signaling.request_timeout_secs, 20);
        assert!(config.throttle.secret.is_none());
        assert!(config.relay.url.is_none());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [media]
            consumer_replicas = 2

            [throttle]
            secret = "s3cret"
            "#,
        )
        .unwrap();

        assert_eq!(config.media.consumer_replicas, 2);
        assert_eq!(config.media.media_codecs.len(), 5);
        assert_eq!(config.throttle.secret.as_deref(), Some("s3cret"));
        assert_eq!(config.throttle.command, "throttle");
        assert_eq!(config.server.http_port, 4443);
    }

    #[test]
    fn test_default_config_round_trips_through_toml() {
        let text = toml::to_string_pretty(&Config::default()).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.media.media_codecs, Config::default().media.media_codecs);
    }

    #[test]
    fn test_explicit_work_dir() {
        let capture = CaptureConfig {
            work_dir: Some(PathBuf::from("/tmp/carecall-test")),
            ..CaptureConfig::default()
        };
        assert_eq!(
            capture.work_dir().unwrap(),
            PathBuf::from("/tmp/carecall-test")
        );
    }
}
