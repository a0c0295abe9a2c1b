use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::config::IncidentConfig;
use crate::error::{EngineError, EngineResult};
use crate::random::RandomSource;

const MAX_INCIDENT_SECONDS: i64 = 365 * 24 * 3600;

/// Metric an incident scales.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImpactMetric {
    Cpu,
    Memory,
    ErrorRate,
    ResponseTime,
    Requests,
    Network,
    Disk,
}

/// Template for a transient fault.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentScenario {
    pub name: String,
    pub per_tick_probability: f64,
    pub duration_seconds: u64,
    pub impact_multipliers: BTreeMap<ImpactMetric, f64>,
}

impl IncidentScenario {
    pub fn new(
        name: &str,
        per_tick_probability: f64,
        duration_seconds: u64,
        impacts: &[(ImpactMetric, f64)],
    ) -> Self {
        Self {
            name: name.to_string(),
            per_tick_probability,
            duration_seconds,
            impact_multipliers: impacts.iter().copied().collect(),
        }
    }
}

/// Built-in scenarios. Probabilities are per service per tick.
pub fn default_scenarios() -> Vec<IncidentScenario> {
    use ImpactMetric::*;
    vec![
        IncidentScenario::new("cpu_spike", 0.002, 180, &[(Cpu, 2.0), (ResponseTime, 1.5)]),
        IncidentScenario::new("memory_leak", 0.001, 600, &[(Memory, 1.6)]),
        IncidentScenario::new(
            "network_latency",
            0.003,
            120,
            &[(ResponseTime, 3.0), (ErrorRate, 2.0), (Network, 0.7)],
        ),
        IncidentScenario::new("error_burst", 0.002, 120, &[(ErrorRate, 8.0)]),
        IncidentScenario::new(
            "traffic_surge",
            0.002,
            300,
            &[(Requests, 2.5), (Cpu, 1.5), (Network, 2.0)],
        ),
        IncidentScenario::new("disk_pressure", 0.001, 240, &[(Disk, 2.5), (ResponseTime, 1.3)]),
    ]
}

/// A scenario bound to a service until `expires_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveIncident {
    pub id: u64,
    pub scenario: String,
    pub service: String,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub impact_multipliers: BTreeMap<ImpactMetric, f64>,
    /// Injected by an operator rather than triggered at random.
    pub manual: bool,
}

impl ActiveIncident {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncidentStats {
    pub total_triggered: u64,
    pub manually_injected: u64,
    pub expired: u64,
    pub cleared: u64,
    pub currently_active: usize,
    pub by_scenario: BTreeMap<String, u64>,
}

/// Per-service table of active incidents plus the stochastic trigger.
///
/// Identical scenarios may be active on the same service at once; their
/// multipliers compose like any other pair of incidents.
#[derive(Debug)]
pub struct IncidentModel {
    config: IncidentConfig,
    active: BTreeMap<String, Vec<ActiveIncident>>,
    stats: IncidentStats,
    next_id: u64,
}

impl IncidentModel {
    pub fn new(config: IncidentConfig) -> Self {
        Self {
            config,
            active: BTreeMap::new(),
            stats: IncidentStats::default(),
            next_id: 1,
        }
    }

    /// Remove every incident whose deadline has passed. Calling it again with
    /// the same `now` removes nothing.
    pub fn expire(&mut self, now: DateTime<Utc>) -> Vec<ActiveIncident> {
        let mut expired = Vec::new();
        for incidents in self.active.values_mut() {
            let (gone, kept): (Vec<_>, Vec<_>) = incidents.drain(..).partition(|i| i.is_expired(now));
            *incidents = kept;
            expired.extend(gone);
        }
        self.active.retain(|_, incidents| !incidents.is_empty());

        for incident in &expired {
            info!("🩹 Incident {} on {} expired", incident.scenario, incident.service);
        }
        self.stats.expired += expired.len() as u64;
        self.refresh_count();
        expired
    }

    /// Run one Bernoulli trial per scenario for `service`.
    pub fn evaluate(
        &mut self,
        service: &str,
        now: DateTime<Utc>,
        rng: &mut dyn RandomSource,
    ) -> Vec<ActiveIncident> {
        if !self.config.enabled {
            return Vec::new();
        }

        let triggered: Vec<IncidentScenario> = self
            .config
            .scenarios
            .iter()
            .filter(|scenario| rng.chance(scenario.per_tick_probability))
            .cloned()
            .collect();

        triggered
            .into_iter()
            .map(|scenario| {
                let incident = self.activate(service, &scenario, now, false);
                warn!(
                    "⚠️  Incident {} triggered on {} for {}s",
                    scenario.name, service, scenario.duration_seconds
                );
                incident
            })
            .collect()
    }

    /// Start a named scenario on a service regardless of probability.
    pub fn inject(&mut self, service: &str, scenario: &str, now: DateTime<Utc>) -> EngineResult<ActiveIncident> {
        let scenario = self
            .config
            .scenarios
            .iter()
            .find(|s| s.name == scenario)
            .cloned()
            .ok_or_else(|| EngineError::InvalidRequest(format!("unknown incident scenario '{scenario}'")))?;
        info!("💉 Injecting incident {} on {}", scenario.name, service);
        Ok(self.activate(service, &scenario, now, true))
    }

    fn activate(
        &mut self,
        service: &str,
        scenario: &IncidentScenario,
        now: DateTime<Utc>,
        manual: bool,
    ) -> ActiveIncident {
        let seconds = i64::try_from(scenario.duration_seconds)
            .unwrap_or(i64::MAX)
            .min(MAX_INCIDENT_SECONDS);
        let duration = Duration::seconds(seconds);
        let incident = ActiveIncident {
            id: self.next_id,
            scenario: scenario.name.clone(),
            service: service.to_string(),
            started_at: now,
            expires_at: now + duration,
            impact_multipliers: scenario.impact_multipliers.clone(),
            manual,
        };
        self.next_id += 1;

        self.active
            .entry(service.to_string())
            .or_default()
            .push(incident.clone());

        self.stats.total_triggered += 1;
        if manual {
            self.stats.manually_injected += 1;
        }
        *self.stats.by_scenario.entry(scenario.name.clone()).or_insert(0) += 1;
        self.refresh_count();
        incident
    }

    /// Clear incidents on one service, or on every service.
    pub fn clear(&mut self, service: Option<&str>) -> usize {
        let cleared = match service {
            Some(service) => self.active.remove(service).map_or(0, |incidents| incidents.len()),
            None => {
                let count = self.active.values().map(Vec::len).sum();
                self.active.clear();
                count
            }
        };
        self.stats.cleared += cleared as u64;
        self.refresh_count();
        cleared
    }

    /// Drop incidents bound to services that are no longer monitored.
    pub fn retain_services(&mut self, is_monitored: impl Fn(&str) -> bool) {
        let before = self.active_count();
        self.active.retain(|service, _| is_monitored(service));
        let dropped = before - self.active_count();
        if dropped > 0 {
            debug!("dropped {} incidents on services that went away", dropped);
        }
        self.refresh_count();
    }

    /// Combined multiplier of every active incident on `service` for `metric`.
    pub fn multiplier(&self, service: &str, metric: ImpactMetric) -> f64 {
        self.active_for(service)
            .iter()
            .filter_map(|incident| incident.impact_multipliers.get(&metric))
            .product()
    }

    pub fn active_for(&self, service: &str) -> &[ActiveIncident] {
        self.active.get(service).map_or(&[], Vec::as_slice)
    }

    pub fn active(&self) -> impl Iterator<Item = &ActiveIncident> {
        self.active.values().flatten()
    }

    pub fn active_count(&self) -> usize {
        self.active.values().map(Vec::len).sum()
    }

    fn refresh_count(&mut self) {
        self.stats.currently_active = self.active_count();
    }

    pub fn stats(&self) -> &IncidentStats {
        &self.stats
    }

    pub fn scenarios(&self) -> &[IncidentScenario] {
        &self.config.scenarios
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.config.enabled = enabled;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::{FixedRandom, SeededRandom};
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 5, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_model_creation() {
        let model = IncidentModel::new(IncidentConfig::default());
        assert!(model.is_enabled());
        assert_eq!(model.active_count(), 0);
        assert_eq!(model.stats().total_triggered, 0);
        assert_eq!(model.multiplier("api", ImpactMetric::Cpu), 1.0);
    }

    #[test]
    fn test_disabled_model_never_triggers() {
        let mut model = IncidentModel::new(IncidentConfig {
            enabled: false,
            ..IncidentConfig::default()
        });
        let mut always = FixedRandom::new(0.0);
        assert!(model.evaluate("api", start(), &mut always).is_empty());
    }

    #[test]
    fn test_forced_trigger_activates_every_scenario() {
        let mut model = IncidentModel::new(IncidentConfig::default());
        let mut always = FixedRandom::new(0.0);
        let triggered = model.evaluate("api", start(), &mut always);
        assert_eq!(triggered.len(), default_scenarios().len());
        assert_eq!(model.stats().currently_active, triggered.len());
        // cpu_spike (2.0) and traffic_surge (1.5) both scale cpu
        assert!((model.multiplier("api", ImpactMetric::Cpu) - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_rare_scenarios_rarely_trigger() {
        let mut model = IncidentModel::new(IncidentConfig::default());
        let mut rng = SeededRandom::new(11);
        let mut total = 0;
        for _ in 0..100 {
            total += model.evaluate("api", start(), &mut rng).len();
        }
        // Expected ≈ 1.1 incidents over 100 ticks
        assert!(total < 10);
    }

    #[test]
    fn test_identical_incidents_stack() {
        let mut model = IncidentModel::new(IncidentConfig::default());
        model.inject("api", "error_burst", start()).unwrap();
        model.inject("api", "error_burst", start()).unwrap();
        assert_eq!(model.active_for("api").len(), 2);
        assert!((model.multiplier("api", ImpactMetric::ErrorRate) - 64.0).abs() < 1e-9);
    }

    #[test]
    fn test_expiry_is_idempotent() {
        let mut model = IncidentModel::new(IncidentConfig::default());
        model.inject("api", "error_burst", start()).unwrap();

        assert!(model.expire(start() + Duration::seconds(119)).is_empty());
        let at = start() + Duration::seconds(120);
        assert_eq!(model.expire(at).len(), 1);
        assert!(model.expire(at).is_empty());
        assert_eq!(model.stats().expired, 1);
        assert_eq!(model.multiplier("api", ImpactMetric::ErrorRate), 1.0);
    }

    #[test]
    fn test_unknown_scenario_rejected() {
        let mut model = IncidentModel::new(IncidentConfig::default());
        let err = model.inject("api", "meteor_strike", start()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidRequest(_)));
    }

    #[test]
    fn test_manual_clearing() {
        let mut model = IncidentModel::new(IncidentConfig::default());
        model.inject("api", "cpu_spike", start()).unwrap();
        model.inject("db", "memory_leak", start()).unwrap();

        assert_eq!(model.clear(Some("api")), 1);
        assert_eq!(model.active_count(), 1);
        assert_eq!(model.clear(None), 1);
        assert_eq!(model.stats().cleared, 2);
    }
}
