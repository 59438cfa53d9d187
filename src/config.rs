//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `hub.toml`.
//!     loads configuration from file or falls back to defaults.
//!
//! structure:
//!     - HeartbeatConfig: UDP port, silence threshold and sweep cadence.
//!     - PollingConfig: How often each connected device is polled.
//!     - RequestConfig: Deadline for a reply to any issued request.
//!     - SessionConfig: Device websocket location and reconnect policy.
//!     - AggregationConfig: Display rounding for running averages.
//!     - DashboardConfig: Where the read API listens.
//!
//! ==============================================================================

use crate::error::ConfigError;
use serde::Deserialize;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct HubConfig {
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub requests: RequestConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub aggregation: AggregationConfig,
    #[serde(default)]
    pub dashboard: DashboardConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub bind: IpAddr,
    pub port: u16,
    /// ms of silence before a device is marked DOWN
    pub expiry_ms: u64,
    pub sweep_interval_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PollingConfig {
    /// ms between telemetry polls
    pub frequency_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RequestConfig {
    pub timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SessionConfig {
    /// ms without inbound traffic before a connected session is restarted
    pub reconnect_check_ms: u64,
    pub connect_timeout_ms: u64,
    pub socket_port: u16,
    pub socket_path: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AggregationConfig {
    pub decimal_places: u32,
}

/// Beyond this, `10^places` stops being exact and rounding degrades.
pub const MAX_DECIMAL_PLACES: u32 = 10;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DashboardConfig {
    pub enabled: bool,
    pub bind: IpAddr,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::from([0, 0, 0, 0]),
            port: 6842,
            expiry_ms: 5000,
            sweep_interval_ms: 1000,
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self { frequency_ms: 1000 }
    }
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self { timeout_ms: 2000 }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconnect_check_ms: 5000,
            connect_timeout_ms: 3000,
            socket_port: 80,
            socket_path: "/ws".to_string(),
        }
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self { decimal_places: 2 }
    }
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: IpAddr::from([0, 0, 0, 0]),
            port: 5702,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

impl HeartbeatConfig {
    pub fn expiry(&self) -> Duration {
        Duration::from_millis(self.expiry_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl HubConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: HubConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load with default fallback
    pub fn load_or_default() -> Self {
        let paths = [
            std::path::PathBuf::from("config").join("hub.toml"),
            std::path::PathBuf::from("..").join("config").join("hub.toml"),
        ];

        for path in &paths {
            if path.exists() {
                match Self::load(path) {
                    Ok(config) => {
                        tracing::info!("[CONFIG] Loaded from {}", path.display());
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("[CONFIG] Failed to load {}: {}", path.display(), e);
                    }
                }
            }
        }

        tracing::warn!("[CONFIG] No config file found - using defaults");
        Self::default()
    }

    /// Reject combinations that would make liveness or polling meaningless.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let intervals = [
            ("heartbeat.expiry_ms", self.heartbeat.expiry_ms),
            ("heartbeat.sweep_interval_ms", self.heartbeat.sweep_interval_ms),
            ("polling.frequency_ms", self.polling.frequency_ms),
            ("requests.timeout_ms", self.requests.timeout_ms),
            ("session.reconnect_check_ms", self.session.reconnect_check_ms),
            ("session.connect_timeout_ms", self.session.connect_timeout_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be non-zero")));
            }
        }

        if self.heartbeat.expiry_ms <= self.heartbeat.sweep_interval_ms {
            return Err(ConfigError::Invalid(format!(
                "heartbeat.expiry_ms ({}) must exceed heartbeat.sweep_interval_ms ({})",
                self.heartbeat.expiry_ms, self.heartbeat.sweep_interval_ms
            )));
        }

        if !self.session.socket_path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "session.socket_path {:?} must start with '/'",
                self.session.socket_path
            )));
        }

        if self.aggregation.decimal_places > MAX_DECIMAL_PLACES {
            return Err(ConfigError::Invalid(format!(
                "aggregation.decimal_places ({}) must be at most {MAX_DECIMAL_PLACES}",
                self.aggregation.decimal_places
            )));
        }

        Ok(())
    }

    /// Log configuration summary
    pub fn log_summary(&self) {
        tracing::info!(
            heartbeat_port = self.heartbeat.port,
            expiry_ms = self.heartbeat.expiry_ms,
            sweep_ms = self.heartbeat.sweep_interval_ms,
            poll_ms = self.polling.frequency_ms,
            request_timeout_ms = self.requests.timeout_ms,
            reconnect_check_ms = self.session.reconnect_check_ms,
            dashboard = %format!("{}:{}", self.dashboard.bind, self.dashboard.port),
            log_level = %self.logging.level,
            "hub configuration"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_firmware_expectations() {
        let config = HubConfig::default();
        assert_eq!(config.heartbeat.port, 6842);
        assert_eq!(config.heartbeat.expiry_ms, 5000);
        assert_eq!(config.heartbeat.sweep_interval_ms, 1000);
        assert_eq!(config.polling.frequency_ms, 1000);
        assert_eq!(config.requests.timeout_ms, 2000);
        assert_eq!(config.session.socket_path, "/ws");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_keys() {
        let config: HubConfig = toml::from_str(
            r#"
            [heartbeat]
            expiry_ms = 8000

            [session]
            socket_port = 8080
            "#,
        )
        .unwrap();
        assert_eq!(config.heartbeat.expiry_ms, 8000);
        assert_eq!(config.heartbeat.port, 6842);
        assert_eq!(config.session.socket_port, 8080);
        assert_eq!(config.session.socket_path, "/ws");
        assert_eq!(config.aggregation.decimal_places, 2);
    }

    #[test]
    fn expiry_must_exceed_sweep_interval() {
        let mut config = HubConfig::default();
        config.heartbeat.expiry_ms = 1000;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("must exceed"));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let mut config = HubConfig::default();
        config.polling.frequency_ms = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn socket_path_needs_leading_slash() {
        let mut config = HubConfig::default();
        config.session.socket_path = "ws".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn decimal_places_are_bounded() {
        let mut config = HubConfig::default();
        config.aggregation.decimal_places = MAX_DECIMAL_PLACES;
        assert!(config.validate().is_ok());

        config.aggregation.decimal_places = 400;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("aggregation.decimal_places"));
    }
}
