use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::incidents::{default_scenarios, IncidentScenario};
use crate::resources::ResourceKind;

// Engine cadence: one tick every 5 seconds, one hour of history
const DEFAULT_TICK_INTERVAL_MS: u64 = 5000;
const DEFAULT_HISTORY_RETENTION_SECS: u64 = 3600;

const DEFAULT_SUCCESS_PROBABILITY: f64 = 0.95;
const DEFAULT_COMPLETION_DELAY_MS: u64 = 2000;

const DEFAULT_NOISE_STD_DEV: f64 = 0.05;
const DEFAULT_WEEKEND_FACTOR: f64 = 0.6;

const SLA_TARGET_PERCENT: f64 = 99.5;
const SLA_AT_RISK_PERCENT: f64 = 99.0;
const SLA_RECENT_SAMPLES: usize = 60;

const DEFAULT_SUBSCRIBER_CHANNEL_CAPACITY: usize = 16;
const DEFAULT_SUBSCRIBER_SEND_TIMEOUT_MS: u64 = 1000;

const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:8080";
const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;

/// Top-level engine configuration. Every section has working defaults, so an
/// empty YAML document is a valid config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub tick_interval_ms: u64,
    pub history_retention_secs: u64,
    /// Seed for the engine's random source. `None` seeds from OS entropy.
    pub seed: Option<u64>,
    pub lifecycle: LifecycleConfig,
    pub telemetry: TelemetryConfig,
    pub incidents: IncidentConfig,
    pub sla: SlaConfig,
    pub hub: HubConfig,
    pub server: ServerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            history_retention_secs: DEFAULT_HISTORY_RETENTION_SECS,
            seed: None,
            lifecycle: LifecycleConfig::default(),
            telemetry: TelemetryConfig::default(),
            incidents: IncidentConfig::default(),
            sla: SlaConfig::default(),
            hub: HubConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = if text.trim().is_empty() {
            EngineConfig::default()
        } else {
            serde_yaml::from_str(text)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Number of ticks that fit in the retention window.
    pub fn history_capacity(&self) -> usize {
        let ticks = self.history_retention_secs.saturating_mul(1000) / self.tick_interval_ms.max(1);
        usize::try_from(ticks).unwrap_or(usize::MAX).max(1)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval_ms == 0 {
            return Err(invalid("tick_interval_ms", "must be positive"));
        }
        let retention_ms = self
            .history_retention_secs
            .checked_mul(1000)
            .ok_or_else(|| invalid("history_retention_secs", "too large"))?;
        if retention_ms < self.tick_interval_ms {
            return Err(invalid("history_retention_secs", "must cover at least one tick"));
        }
        check_probability("lifecycle.success_probability", self.lifecycle.success_probability)?;
        for (kind, range) in &self.lifecycle.delays {
            if range.min_ms > range.max_ms {
                return Err(invalid(
                    "lifecycle.delays",
                    format!("{kind}: min_ms {} exceeds max_ms {}", range.min_ms, range.max_ms),
                ));
            }
        }
        if self.lifecycle.node_pool.is_empty() {
            return Err(invalid("lifecycle.node_pool", "must name at least one node"));
        }
        if self.telemetry.noise_std_dev < 0.0 {
            return Err(invalid("telemetry.noise_std_dev", "must not be negative"));
        }
        if !(-12..=14).contains(&self.telemetry.utc_offset_hours) {
            return Err(invalid("telemetry.utc_offset_hours", "must lie in -12..=14"));
        }
        for scenario in &self.incidents.scenarios {
            check_probability("incidents.scenarios.per_tick_probability", scenario.per_tick_probability)?;
            if scenario.duration_seconds == 0 {
                return Err(invalid(
                    "incidents.scenarios.duration_seconds",
                    format!("{} has a zero duration", scenario.name),
                ));
            }
        }
        if self.sla.at_risk_percent > self.sla.target_percent {
            return Err(invalid("sla.at_risk_percent", "must not exceed target_percent"));
        }
        if self.sla.recent_samples == 0 {
            return Err(invalid("sla.recent_samples", "must be positive"));
        }
        if self.hub.channel_capacity == 0 {
            return Err(invalid("hub.channel_capacity", "must be positive"));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

fn check_probability(field: &'static str, p: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&p) {
        Ok(())
    } else {
        Err(invalid(field, format!("{p} is not a probability")))
    }
}

/// Inclusive range a completion delay is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayRange {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl DelayRange {
    pub const fn new(min_ms: u64, max_ms: u64) -> Self {
        Self { min_ms, max_ms }
    }

    pub const fn fixed(ms: u64) -> Self {
        Self::new(ms, ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub success_probability: f64,
    pub default_delay_ms: u64,
    /// Completion delay per kind name; kinds not listed use `default_delay_ms`.
    pub delays: BTreeMap<String, DelayRange>,
    /// Simulated nodes pods get assigned to.
    pub node_pool: Vec<String>,
    /// First two octets of allocated service cluster IPs.
    pub service_ip_prefix: String,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        let delays = [
            ("Pod", DelayRange::new(2000, 5000)),
            ("Deployment", DelayRange::new(3000, 8000)),
            ("ConfigMap", DelayRange::new(500, 1000)),
            ("Secret", DelayRange::new(500, 1000)),
        ]
        .into_iter()
        .map(|(kind, range)| (kind.to_string(), range))
        .collect();

        Self {
            success_probability: DEFAULT_SUCCESS_PROBABILITY,
            default_delay_ms: DEFAULT_COMPLETION_DELAY_MS,
            delays,
            node_pool: vec![
                "sim-node-1".to_string(),
                "sim-node-2".to_string(),
                "sim-node-3".to_string(),
            ],
            service_ip_prefix: "10.96".to_string(),
        }
    }
}

impl LifecycleConfig {
    pub fn delay_for(&self, kind: &ResourceKind) -> DelayRange {
        self.delays
            .get(kind.as_str())
            .copied()
            .unwrap_or(DelayRange::fixed(self.default_delay_ms))
    }

    /// Longest delay any completion can take.
    pub fn max_delay(&self) -> Duration {
        let longest = self
            .delays
            .values()
            .map(|range| range.max_ms)
            .chain(std::iter::once(self.default_delay_ms))
            .max()
            .unwrap_or(self.default_delay_ms);
        Duration::from_millis(longest)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub noise_std_dev: f64,
    pub weekend_factor: f64,
    /// Offset applied to UTC before computing hour of day and weekday.
    pub utc_offset_hours: i32,
    pub base_response_time_ms: f64,
    pub error_rate_baseline_percent: f64,
    pub default_cpu_request_millicores: u64,
    pub default_memory_request_mb: f64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            noise_std_dev: DEFAULT_NOISE_STD_DEV,
            weekend_factor: DEFAULT_WEEKEND_FACTOR,
            utc_offset_hours: 0,
            base_response_time_ms: 45.0,
            error_rate_baseline_percent: 0.1,
            default_cpu_request_millicores: 100,
            default_memory_request_mb: 128.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IncidentConfig {
    /// Random triggering on/off. Manually injected incidents apply regardless.
    pub enabled: bool,
    pub scenarios: Vec<IncidentScenario>,
}

impl Default for IncidentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scenarios: default_scenarios(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlaConfig {
    pub target_percent: f64,
    pub at_risk_percent: f64,
    pub recent_samples: usize,
}

impl Default for SlaConfig {
    fn default() -> Self {
        Self {
            target_percent: SLA_TARGET_PERCENT,
            at_risk_percent: SLA_AT_RISK_PERCENT,
            recent_samples: SLA_RECENT_SAMPLES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub channel_capacity: usize,
    /// Per-subscriber delivery deadline.
    pub send_timeout_ms: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_SUBSCRIBER_CHANNEL_CAPACITY,
            send_timeout_ms: DEFAULT_SUBSCRIBER_SEND_TIMEOUT_MS,
        }
    }
}

impl HubConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub max_line_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.history_capacity(), 720);
        assert_eq!(config.lifecycle.max_delay(), Duration::from_millis(8000));
    }

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config = EngineConfig::from_yaml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_partial_yaml_overrides() {
        let config = EngineConfig::from_yaml_str(
            "tick_interval_ms: 1000\nseed: 9\nlifecycle:\n  success_probability: 0.5\n",
        )
        .unwrap();
        assert_eq!(config.tick_interval_ms, 1000);
        assert_eq!(config.seed, Some(9));
        assert_eq!(config.lifecycle.success_probability, 0.5);
        assert_eq!(config.lifecycle.node_pool.len(), 3);
        assert_eq!(config.history_capacity(), 3600);
    }

    #[test]
    fn test_delay_lookup() {
        let lifecycle = LifecycleConfig::default();
        assert_eq!(lifecycle.delay_for(&ResourceKind::Pod), DelayRange::new(2000, 5000));
        assert_eq!(lifecycle.delay_for(&ResourceKind::Service), DelayRange::fixed(2000));
    }

    #[test]
    fn test_invalid_probability_rejected() {
        let err = EngineConfig::from_yaml_str("lifecycle:\n  success_probability: 1.5\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "lifecycle.success_probability", .. }));
    }

    #[test]
    fn test_oversized_retention_rejected() {
        let err = EngineConfig::from_yaml_str("history_retention_secs: 18446744073709551615\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "history_retention_secs", .. }));

        let config = EngineConfig {
            history_retention_secs: u64::MAX,
            ..EngineConfig::default()
        };
        assert!(config.history_capacity() > 0);
    }
}
