//! Gateway configuration: the machine-readable form of every tunable
//! threshold named across the router, safety subsystem, and heartbeat
//! scheduler, with environment presets and JSON persistence.

use std::fs;
use std::path::Path;
use std::time::Duration;

use nutype::nutype;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Idempotency cache size, per patient.
#[nutype(validate(greater = 0), derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Into))]
pub struct IdempotencyCacheSize(usize);

/// Rate-limit threshold: max `USER_MESSAGE`s per window before throttling.
#[nutype(validate(greater = 0), derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Into))]
pub struct RateLimitThreshold(usize);

/// Circuit breaker: maximum chain depth before an event is dropped.
#[nutype(validate(greater = 0), derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Into))]
pub struct CircuitBreakerDepth(u32);

/// Dead-letter queue capacity.
#[nutype(validate(greater = 0), derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Into))]
pub struct DlqCapacity(usize);

/// Background-save retry count.
#[nutype(derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Into))]
pub struct SaveRetryCount(u32);

/// Flat, validated configuration for every Gateway subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Per-patient idempotency cache size (FIFO eviction).
    pub idempotency_cache_size: IdempotencyCacheSize,
    /// Rate-limit window, in seconds.
    pub rate_limit_window_secs: u64,
    /// Rate-limit threshold within the window.
    pub rate_limit_threshold: RateLimitThreshold,
    /// Maximum chain depth before the circuit breaker trips.
    pub circuit_breaker_depth: CircuitBreakerDepth,
    /// Dead-letter queue capacity.
    pub dlq_capacity: DlqCapacity,
    /// Conversation log cap.
    pub conversation_log_cap: usize,
    /// Monitoring entries cap.
    pub monitoring_entries_cap: usize,
    /// Cross-phase follow-up timeout, in seconds.
    pub cross_phase_timeout_secs: u64,
    /// Stalled-assessment timeout, in hours.
    pub assessment_timeout_hours: u64,
    /// Queue worker idle-reclamation timeout, in seconds.
    pub queue_idle_timeout_secs: u64,
    /// Heartbeat scheduler tick interval, in seconds.
    pub heartbeat_tick_secs: u64,
    /// Background-save retry backoff schedule, in milliseconds.
    pub save_retry_backoff_ms: Vec<u64>,
    /// Background-save retry count.
    pub save_retry_count: SaveRetryCount,
    /// Path to the SQLite database file (or `:memory:`).
    pub database_path: String,
    /// Bind address for the HTTP ingress adapter.
    pub http_bind_address: String,
    /// Base directory for the best-effort chat-history mirror files.
    pub chat_mirror_dir: String,
}

impl GatewayConfig {
    /// Conservative defaults matching spec-mandated constants, suitable for
    /// local development against a file-backed SQLite database.
    #[must_use]
    pub fn development() -> Self {
        Self {
            idempotency_cache_size: IdempotencyCacheSize::try_new(100).expect("100 > 0"),
            rate_limit_window_secs: 60,
            rate_limit_threshold: RateLimitThreshold::try_new(15).expect("15 > 0"),
            circuit_breaker_depth: CircuitBreakerDepth::try_new(10).expect("10 > 0"),
            dlq_capacity: DlqCapacity::try_new(500).expect("500 > 0"),
            conversation_log_cap: 100,
            monitoring_entries_cap: 50,
            cross_phase_timeout_secs: 600,
            assessment_timeout_hours: 48,
            queue_idle_timeout_secs: 1800,
            heartbeat_tick_secs: 3600,
            save_retry_backoff_ms: vec![100, 300, 900],
            save_retry_count: SaveRetryCount::new(3),
            database_path: "gateway.db".to_string(),
            http_bind_address: "127.0.0.1:8080".to_string(),
            chat_mirror_dir: "patient_data".to_string(),
        }
    }

    /// Production preset: same thresholds, durable database path, all
    /// interfaces bind.
    #[must_use]
    pub fn production() -> Self {
        Self {
            database_path: "/var/lib/diary-gateway/gateway.db".to_string(),
            http_bind_address: "0.0.0.0:8080".to_string(),
            ..Self::development()
        }
    }

    /// Testing preset: in-memory database, tight timeouts for fast tests.
    #[must_use]
    pub fn testing() -> Self {
        Self {
            database_path: ":memory:".to_string(),
            queue_idle_timeout_secs: 2,
            heartbeat_tick_secs: 1,
            cross_phase_timeout_secs: 2,
            assessment_timeout_hours: 0,
            http_bind_address: "127.0.0.1:0".to_string(),
            ..Self::development()
        }
    }

    /// Cross-field validation beyond what the individual `nutype` fields enforce.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.save_retry_backoff_ms.len() != usize::try_from(u32::from(self.save_retry_count)).unwrap_or(0) {
            return Err(ConfigError::Validation {
                field: "save_retry_backoff_ms".to_string(),
                reason: "must have one entry per retry attempt".to_string(),
            });
        }
        if self.database_path.is_empty() {
            return Err(ConfigError::Validation {
                field: "database_path".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    /// The idle-reclamation timeout as a [`Duration`].
    #[must_use]
    pub fn queue_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.queue_idle_timeout_secs)
    }

    /// The heartbeat tick interval as a [`Duration`].
    #[must_use]
    pub fn heartbeat_tick(&self) -> Duration {
        Duration::from_secs(self.heartbeat_tick_secs)
    }

    /// Loads a config from a JSON file.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Saves this config as JSON to a file.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let raw = serde_json::to_string_pretty(self)?;
        fs::write(path, raw)?;
        Ok(())
    }
}

/// Builder for [`GatewayConfig`], starting from the development preset.
#[derive(Debug, Clone)]
pub struct GatewayConfigBuilder {
    config: GatewayConfig,
}

impl Default for GatewayConfigBuilder {
    fn default() -> Self {
        Self {
            config: GatewayConfig::development(),
        }
    }
}

impl GatewayConfigBuilder {
    /// Overrides the database path.
    #[must_use]
    pub fn database_path(mut self, path: impl Into<String>) -> Self {
        self.config.database_path = path.into();
        self
    }

    /// Overrides the HTTP bind address.
    #[must_use]
    pub fn http_bind_address(mut self, address: impl Into<String>) -> Self {
        self.config.http_bind_address = address.into();
        self
    }

    /// Overrides the queue idle-reclamation timeout.
    #[must_use]
    pub fn queue_idle_timeout_secs(mut self, secs: u64) -> Self {
        self.config.queue_idle_timeout_secs = secs;
        self
    }

    /// Validates and builds the final config.
    pub fn build(self) -> Result<GatewayConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn development_preset_validates() {
        assert!(GatewayConfig::development().validate().is_ok());
    }

    #[test]
    fn testing_preset_uses_in_memory_database() {
        assert_eq!(GatewayConfig::testing().database_path, ":memory:");
    }

    #[test]
    fn builder_overrides_apply() {
        let config = GatewayConfigBuilder::default()
            .database_path("custom.db")
            .queue_idle_timeout_secs(5)
            .build()
            .unwrap();
        assert_eq!(config.database_path, "custom.db");
        assert_eq!(config.queue_idle_timeout_secs, 5);
    }

    #[test]
    fn json_round_trip_preserves_values() {
        let config = GatewayConfig::development();
        let json = serde_json::to_string(&config).unwrap();
        let back: GatewayConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.database_path, config.database_path);
    }
}
