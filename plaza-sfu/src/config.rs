use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::engine::{RtpCodecCapability, TransportOptions};
use crate::types::MediaKind;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub media: MediaConfig,
    pub registry: RegistryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5001,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Media-engine configuration: workers, per-room routing and transports
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub worker: WorkerConfig,
    pub router: RouterConfig,
    pub transport: TransportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of media workers to spawn at startup (0 = one per core)
    pub num_workers: usize,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub log_level: String,
    pub log_tags: Vec<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            num_workers: 0,
            rtc_min_port: 9000,
            rtc_max_port: 9501,
            log_level: "warn".to_string(),
            log_tags: [
                "info", "ice", "dtls", "rtp", "srtp", "rtcp", "simulcast",
            ]
            .iter()
            .map(ToString::to_string)
            .collect(),
        }
    }
}

impl WorkerConfig {
    /// Resolved pool size: explicit value, or one worker per available core
    #[must_use]
    pub fn effective_num_workers(&self) -> usize {
        if self.num_workers > 0 {
            return self.num_workers;
        }
        std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Codecs every room's routing context is created with
    pub media_codecs: Vec<RtpCodecCapability>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            media_codecs: vec![
                RtpCodecCapability {
                    kind: MediaKind::Audio,
                    mime_type: "audio/opus".to_string(),
                    clock_rate: 48000,
                    channels: Some(2),
                    parameters: serde_json::Value::Null,
                },
                RtpCodecCapability {
                    kind: MediaKind::Video,
                    mime_type: "video/VP8".to_string(),
                    clock_rate: 90000,
                    channels: None,
                    parameters: serde_json::json!({ "x-google-start-bitrate": 1000 }),
                },
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub listen_ip: String,
    /// Address announced to remote peers; autodetected when unset
    pub announced_ip: Option<String>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    /// Cap applied to each transport after creation (0 = uncapped)
    pub max_incoming_bitrate: u32,
    pub initial_available_outgoing_bitrate: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            listen_ip: "0.0.0.0".to_string(),
            announced_ip: None,
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            max_incoming_bitrate: 1_500_000,
            initial_available_outgoing_bitrate: 1_000_000,
        }
    }
}

impl TransportConfig {
    /// Build the engine-facing transport options, resolving the announced
    /// address if none was configured.
    #[must_use]
    pub fn to_options(&self) -> TransportOptions {
        TransportOptions {
            listen_ip: self.listen_ip.clone(),
            announced_ip: Some(
                self.announced_ip
                    .clone()
                    .unwrap_or_else(detect_local_ipv4),
            ),
            enable_udp: self.enable_udp,
            enable_tcp: self.enable_tcp,
            prefer_udp: self.prefer_udp,
            initial_available_outgoing_bitrate: self.initial_available_outgoing_bitrate,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Interval between empty-room sweeps, in seconds
    pub sweep_interval_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 60,
        }
    }
}

/// Best local IPv4 as seen from the default route, without sending traffic
fn detect_local_ipv4() -> String {
    use std::net::UdpSocket;

    UdpSocket::bind("0.0.0.0:0")
        .and_then(|s| s.connect("8.8.8.8:80").map(|()| s))
        .and_then(|s| s.local_addr())
        .map_or_else(|_| "127.0.0.1".to_string(), |addr| addr.ip().to_string())
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // Override with environment variables (PLAZA_SERVER_HOST, etc.)
        builder = builder.add_source(
            Environment::with_prefix("PLAZA")
                .separator("_")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Get signaling HTTP address
    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.server.port, 5001);
        assert_eq!(config.media.worker.rtc_min_port, 9000);
        assert_eq!(config.media.worker.rtc_max_port, 9501);
        assert!(config.media.worker.effective_num_workers() >= 1);
        assert_eq!(config.media.router.media_codecs.len(), 2);
        assert_eq!(config.media.transport.max_incoming_bitrate, 1_500_000);
    }

    #[test]
    fn test_http_address() {
        let config = Config {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 5001,
            },
            ..Config::default()
        };

        assert_eq!(config.http_address(), "127.0.0.1:5001");
    }

    #[test]
    fn test_transport_options_resolve_announced_ip() {
        let transport = TransportConfig {
            announced_ip: Some("203.0.113.10".to_string()),
            ..TransportConfig::default()
        };

        let options = transport.to_options();
        assert_eq!(options.announced_ip.as_deref(), Some("203.0.113.10"));

        // Autodetection always yields some address
        let options = TransportConfig::default().to_options();
        assert!(options.announced_ip.is_some());
    }
}
