//! # Configuration Management Module
//!
//! Provisioning-time settings: broker address and credentials, topics,
//! detector thresholds, clock and retry behaviour, sample source and payload
//! format. Loaded once at startup; nothing is written back while running.
//!
//! ## Storage Location
//! - `$ECG_TELEMETRY_CONFIG` when set
//! - otherwise the platform config dir, e.g. `~/.config/ecg-telemetry/config.toml`
//!
//! A missing file is created with defaults so it can be edited in place.

use crate::clock::{ClockAnchor, TimeSourceKind};
use crate::detector::Thresholds;
use crate::error::ConfigError;
use crate::retry::RetryPolicy;
use crate::sample::SourceKind;
use crate::telemetry::PayloadFormat;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable pointing at an explicit config file
pub const CONFIG_PATH_ENV: &str = "ECG_TELEMETRY_CONFIG";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub broker: BrokerConfig,
    pub topics: TopicConfig,
    pub detector: Thresholds,
    pub clock: ClockConfig,
    pub retry: RetryConfig,
    pub acquisition: AcquisitionConfig,
    pub payload: PayloadConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
    /// How long one handshake attempt may wait for CONNACK
    pub handshake_timeout_ms: u64,
    /// PEM CA bundle; when set the session runs over TLS
    pub tls_ca_path: Option<PathBuf>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "arduino".to_string(),
            username: None,
            password: None,
            keep_alive_secs: 60,
            handshake_timeout_ms: 5_000,
            tls_ca_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicConfig {
    pub data: String,
    /// Subscribed after every (re)connect, reserved for remote commands
    pub control: String,
    pub retain: bool,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            data: "device/22/data".to_string(),
            control: "test/topic".to_string(),
            retain: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    pub time_source: TimeSourceKind,
    pub sntp_server: String,
    pub sntp_timeout_ms: u64,
    /// Seconds added to every timestamp; defaults per time source
    pub skew_correction_secs: Option<u64>,
    /// Uptime between queries while the time source stays silent
    pub retry_interval_ms: u64,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            time_source: TimeSourceKind::System,
            sntp_server: "pool.ntp.org:123".to_string(),
            sntp_timeout_ms: 1_000,
            skew_correction_secs: None,
            retry_interval_ms: 10_000,
        }
    }
}

impl ClockConfig {
    pub fn skew_correction(&self) -> u64 {
        self.skew_correction_secs
            .unwrap_or_else(|| self.time_source.default_skew_correction_secs())
    }

    pub fn anchor(&self) -> ClockAnchor {
        ClockAnchor::new(self.skew_correction())
            .with_retry_interval(Duration::from_millis(self.retry_interval_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub network_delay_ms: u64,
    pub session_delay_ms: u64,
    /// Unbounded when absent
    pub max_attempts: Option<u32>,
    pub clock_attempts_per_cycle: u32,
    pub clock_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            network_delay_ms: 5_000,
            session_delay_ms: 1_000,
            max_attempts: None,
            clock_attempts_per_cycle: 1,
            clock_delay_ms: 0,
        }
    }
}

impl RetryConfig {
    pub fn network_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_millis(self.network_delay_ms))
    }

    pub fn session_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_millis(self.session_delay_ms))
    }

    pub fn clock_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Some(self.clock_attempts_per_cycle.max(1)),
            Duration::from_millis(self.clock_delay_ms),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    pub channel: u8,
    pub vref_mv: u16,
    pub source: SourceKind,
    pub replay_path: Option<PathBuf>,
    pub synthetic_bpm: u16,
    /// Minimum cycle length; absent runs at the natural loop rate
    pub sample_interval_ms: Option<u64>,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            channel: 3,
            vref_mv: 3300,
            source: SourceKind::Synthetic,
            replay_path: None,
            synthetic_bpm: 72,
            sample_interval_ms: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PayloadConfig {
    pub format: PayloadFormat,
    pub measurement: String,
    pub device: String,
}

impl Default for PayloadConfig {
    fn default() -> Self {
        Self {
            format: PayloadFormat::Json,
            measurement: "ecg_001".to_string(),
            device: "device1".to_string(),
        }
    }
}

impl Config {
    /// Get the path to the config file
    pub fn config_path() -> PathBuf {
        if let Some(path) = std::env::var_os(CONFIG_PATH_ENV) {
            return PathBuf::from(path);
        }
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("ecg-telemetry")
            .join("config.toml")
    }

    /// Load config from the default location, creating it if missing
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let config = toml::from_str(&contents).map_err(ConfigError::ParseFailed)?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("No config at {}, writing defaults", path.display());
                let config = Self::default();
                config.save_to(path)?;
                Ok(config)
            }
            Err(e) => Err(ConfigError::ReadFailed(e)),
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(ConfigError::WriteFailed)?;
        }

        let toml_string = toml::to_string_pretty(self).map_err(ConfigError::SerializeFailed)?;
        fs::write(path, toml_string).map_err(ConfigError::WriteFailed)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{MonotonicUptime, SystemTimeSource, DAY_SKEW_CORRECTION_SECS};
    use crate::retry::CountingSleeper;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.detector, Thresholds::default());
        assert_eq!(config.topics.data, "device/22/data");
        assert_eq!(config.topics.control, "test/topic");
        assert_eq!(config.clock.skew_correction(), 0);
        assert_eq!(config.payload.format, PayloadFormat::Json);
        assert_eq!(config.acquisition.sample_interval_ms, None);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let toml_str = r#"
            [broker]
            host = "10.0.0.5"

            [detector]
            upper = 2000
            lower = 1600

            [payload]
            format = "line_protocol"
        "#;

        let config: Config = toml::from_str(toml_str).expect("Failed to deserialize");
        assert_eq!(config.broker.host, "10.0.0.5");
        assert_eq!(config.broker.port, 1883);
        assert_eq!(config.detector.upper(), 2000);
        assert_eq!(config.payload.format, PayloadFormat::LineProtocol);
        assert_eq!(config.retry, RetryConfig::default());
    }

    #[test]
    fn test_inverted_thresholds_rejected() {
        let toml_str = r#"
            [detector]
            upper = 600
            lower = 700
        "#;
        assert!(toml::from_str::<Config>(toml_str).is_err());
    }

    #[test]
    fn test_skew_follows_time_source() {
        let toml_str = r#"
            [clock]
            time_source = "sntp"
        "#;
        let config: Config = toml::from_str(toml_str).expect("Failed to deserialize");
        assert_eq!(config.clock.skew_correction(), DAY_SKEW_CORRECTION_SECS);

        let toml_str = r#"
            [clock]
            time_source = "sntp"
            skew_correction_secs = 0
        "#;
        let config: Config = toml::from_str(toml_str).expect("Failed to deserialize");
        assert_eq!(config.clock.skew_correction(), 0);
    }

    #[test]
    fn test_default_clock_stamps_wall_time() {
        let clock = Config::default().clock;
        let mut anchor = clock.anchor();
        let uptime = MonotonicUptime::new();
        let mut sleeper = CountingSleeper::default();

        let stamped = anchor
            .resolve(&mut SystemTimeSource, &uptime, &RetryPolicy::once(), &mut sleeper)
            .expect("host clock answers");
        let now = chrono::Utc::now().timestamp_millis() as u64;
        assert!(stamped.abs_diff(now) < 1_000, "stamped {} vs now {}", stamped, now);
    }

    #[test]
    fn test_retry_policies() {
        let retry = RetryConfig {
            max_attempts: Some(5),
            ..RetryConfig::default()
        };
        assert_eq!(retry.network_policy().delay, Duration::from_secs(5));
        assert_eq!(retry.session_policy().delay, Duration::from_secs(1));
        assert_eq!(retry.session_policy().max_attempts, Some(5));
        assert_eq!(retry.clock_policy(), RetryPolicy::once());
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("nested").join("config.toml");

        let config = Config::load_from(&path).expect("Failed to load config");
        assert_eq!(config, Config::default());
        assert!(path.exists());

        let reloaded = Config::load_from(&path).expect("Failed to reload config");
        assert_eq!(reloaded, config);
    }

    #[test]
    fn test_round_trip_keeps_custom_values() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.broker.username = Some("ecg".to_string());
        config.acquisition.sample_interval_ms = Some(50);
        config.detector = Thresholds::new(1200, 1000).expect("thresholds");
        config.save_to(&path).expect("save");

        assert_eq!(Config::load_from(&path).expect("load"), config);
    }

    #[test]
    fn test_parse_error_surfaces() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "broker = 5").expect("write");
        assert!(matches!(Config::load_from(&path), Err(ConfigError::ParseFailed(_))));
    }
}
