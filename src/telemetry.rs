//! Per-tick telemetry synthesis and the bounded snapshot history.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tracing::debug;

use crate::baseline::{BaselineTable, ServiceBaseline};
use crate::clock::Clock;
use crate::config::TelemetryConfig;
use crate::error::EngineResult;
use crate::incidents::{ImpactMetric, IncidentModel};
use crate::random::{RandomSource, SharedRandom};
use crate::resources::ResourceKind;
use crate::store::{ResourceStore, StatusCounts};
use crate::traffic::TrafficShape;

// Health thresholds shared by services and the cluster rollup
const HEALTHY_ERROR_RATE_PERCENT: f64 = 1.0;
const WARNING_ERROR_RATE_PERCENT: f64 = 5.0;
const HEALTHY_CPU_PERCENT: f64 = 90.0;
const HEALTHY_SERVICE_RATIO: f64 = 0.8;
const WARNING_SERVICE_RATIO: f64 = 0.5;

// Load shaping
const ERROR_KNEE_CPU_PERCENT: f64 = 70.0;
const MEMORY_FIXED_SHARE: f64 = 0.85;
const P99_OVER_MEAN: f64 = 2.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

impl HealthStatus {
    pub fn classify(error_rate_percent: f64, cpu_percent: f64) -> Self {
        if error_rate_percent < HEALTHY_ERROR_RATE_PERCENT && cpu_percent < HEALTHY_CPU_PERCENT {
            HealthStatus::Healthy
        } else if error_rate_percent < WARNING_ERROR_RATE_PERCENT {
            HealthStatus::Warning
        } else {
            HealthStatus::Critical
        }
    }

    /// Healthy and warning both count as available.
    pub fn is_available(self) -> bool {
        !matches!(self, HealthStatus::Critical)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuMetrics {
    pub usage_percent: f64,
    pub cores_used: f64,
    pub cores_requested: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryMetrics {
    pub usage_percent: f64,
    pub used_mb: f64,
    pub capacity_mb: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskMetrics {
    pub usage_percent: f64,
    pub read_iops: f64,
    pub write_iops: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkMetrics {
    pub rx_mbps: f64,
    pub tx_mbps: f64,
    pub active_connections: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMetrics {
    pub requests_per_second: f64,
    pub error_rate_percent: f64,
    /// Failed requests during the tick interval.
    pub error_count: u64,
    pub response_time_ms: f64,
    pub p99_response_time_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaMetrics {
    pub desired: u32,
    pub ready: u32,
}

/// One service's metric bundle for a tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceMetrics {
    pub namespace: String,
    pub kind: ResourceKind,
    pub cpu: CpuMetrics,
    pub memory: MemoryMetrics,
    pub disk: DiskMetrics,
    pub network: NetworkMetrics,
    pub requests: RequestMetrics,
    pub replicas: ReplicaMetrics,
    pub health: HealthStatus,
    pub traffic_multiplier: f64,
    /// Scenario names of incidents active on the service.
    pub incidents: Vec<String>,
}

/// Cluster-wide rollup entry of a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSummary {
    pub total_services: usize,
    pub healthy_services: usize,
    pub warning_services: usize,
    pub critical_services: usize,
    pub avg_cpu_percent: f64,
    pub avg_memory_percent: f64,
    pub total_requests_per_second: f64,
    pub total_error_count: u64,
    pub error_rate_percent: f64,
    pub overall_health: HealthStatus,
    /// Share of services currently available (healthy or warning).
    pub sla_percentage: f64,
    pub active_incidents: usize,
    pub resources: StatusCounts,
}

impl ClusterSummary {
    pub fn aggregate(
        services: &BTreeMap<String, ServiceMetrics>,
        resources: StatusCounts,
        active_incidents: usize,
    ) -> Self {
        let total = services.len();
        let count = |status: HealthStatus| services.values().filter(|s| s.health == status).count();
        let healthy = count(HealthStatus::Healthy);
        let warning = count(HealthStatus::Warning);
        let critical = count(HealthStatus::Critical);

        if total == 0 {
            return Self {
                total_services: 0,
                healthy_services: 0,
                warning_services: 0,
                critical_services: 0,
                avg_cpu_percent: 0.0,
                avg_memory_percent: 0.0,
                total_requests_per_second: 0.0,
                total_error_count: 0,
                error_rate_percent: 0.0,
                overall_health: HealthStatus::Healthy,
                sla_percentage: 100.0,
                active_incidents,
                resources,
            };
        }

        let n = total as f64;
        let avg_cpu = services.values().map(|s| s.cpu.usage_percent).sum::<f64>() / n;
        let avg_memory = services.values().map(|s| s.memory.usage_percent).sum::<f64>() / n;
        let total_rps: f64 = services.values().map(|s| s.requests.requests_per_second).sum();
        let total_errors: u64 = services.values().map(|s| s.requests.error_count).sum();
        let failing_rps: f64 = services
            .values()
            .map(|s| s.requests.requests_per_second * s.requests.error_rate_percent / 100.0)
            .sum();
        let error_rate = if total_rps > 0.0 {
            failing_rps / total_rps * 100.0
        } else {
            0.0
        };

        let healthy_ratio = healthy as f64 / n;
        let overall_health = if error_rate < HEALTHY_ERROR_RATE_PERCENT
            && avg_cpu < HEALTHY_CPU_PERCENT
            && healthy_ratio >= HEALTHY_SERVICE_RATIO
        {
            HealthStatus::Healthy
        } else if error_rate < WARNING_ERROR_RATE_PERCENT && healthy_ratio >= WARNING_SERVICE_RATIO {
            HealthStatus::Warning
        } else {
            HealthStatus::Critical
        };

        Self {
            total_services: total,
            healthy_services: healthy,
            warning_services: warning,
            critical_services: critical,
            avg_cpu_percent: avg_cpu,
            avg_memory_percent: avg_memory,
            total_requests_per_second: total_rps,
            total_error_count: total_errors,
            error_rate_percent: error_rate,
            overall_health,
            sla_percentage: (healthy + warning) as f64 / n * 100.0,
            active_incidents,
            resources,
        }
    }
}

/// One tick's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub timestamp: DateTime<Utc>,
    pub tick: u64,
    pub services: BTreeMap<String, ServiceMetrics>,
    pub summary: ClusterSummary,
}

impl MetricSnapshot {
    /// Snapshot of a cluster with nothing to monitor.
    pub fn empty(timestamp: DateTime<Utc>, resources: StatusCounts) -> Self {
        let services = BTreeMap::new();
        let summary = ClusterSummary::aggregate(&services, resources, 0);
        Self {
            timestamp,
            tick: 0,
            services,
            summary,
        }
    }
}

/// Generates a [`MetricSnapshot`] per call from the store's running workloads.
pub struct TelemetrySynthesizer {
    config: TelemetryConfig,
    tick_seconds: f64,
    store: Arc<ResourceStore>,
    clock: Arc<dyn Clock>,
    random: SharedRandom,
    baselines: BaselineTable,
    incidents: IncidentModel,
    tick_count: u64,
}

impl TelemetrySynthesizer {
    pub fn new(
        config: TelemetryConfig,
        tick_interval: std::time::Duration,
        incidents: IncidentModel,
        store: Arc<ResourceStore>,
        clock: Arc<dyn Clock>,
        random: SharedRandom,
    ) -> Self {
        Self {
            config,
            tick_seconds: tick_interval.as_secs_f64(),
            store,
            clock,
            random,
            baselines: BaselineTable::new(),
            incidents,
            tick_count: 0,
        }
    }

    /// Produce the next snapshot. Fails only when the store cannot be read.
    pub fn synthesize(&mut self) -> EngineResult<MetricSnapshot> {
        let now = self.clock.now();

        let generation = self.store.workload_generation()?;
        if !self.baselines.is_current(generation) {
            let workloads = self.store.running_workloads()?;
            self.baselines.rebuild(generation, &workloads, &self.config);
            let baselines = &self.baselines;
            self.incidents.retain_services(|service| baselines.get(service).is_some());
            debug!("rebuilt baselines for {} services", self.baselines.len());
        }
        let resources = self.store.status_counts()?;

        self.incidents.expire(now);
        let shape = TrafficShape::at(now, self.config.utc_offset_hours, self.config.weekend_factor);

        let mut services = BTreeMap::new();
        {
            let mut rng = self.random.lock();
            for baseline in self.baselines.iter() {
                self.incidents.evaluate(&baseline.service, now, &mut **rng);
                let metrics = service_metrics(
                    baseline,
                    &shape,
                    &self.config,
                    &self.incidents,
                    self.tick_seconds,
                    &mut **rng,
                );
                services.insert(baseline.service.clone(), metrics);
            }
        }

        self.tick_count += 1;
        let summary = ClusterSummary::aggregate(&services, resources, self.incidents.active_count());
        Ok(MetricSnapshot {
            timestamp: now,
            tick: self.tick_count,
            services,
            summary,
        })
    }

    pub fn incidents(&self) -> &IncidentModel {
        &self.incidents
    }

    pub fn incidents_mut(&mut self) -> &mut IncidentModel {
        &mut self.incidents
    }

    pub fn baselines(&self) -> &BaselineTable {
        &self.baselines
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }
}

impl std::fmt::Debug for TelemetrySynthesizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetrySynthesizer")
            .field("tick_count", &self.tick_count)
            .field("services", &self.baselines.len())
            .field("incidents", &self.incidents.active_count())
            .finish_non_exhaustive()
    }
}

fn service_metrics(
    baseline: &ServiceBaseline,
    shape: &TrafficShape,
    config: &TelemetryConfig,
    incidents: &IncidentModel,
    tick_seconds: f64,
    rng: &mut dyn RandomSource,
) -> ServiceMetrics {
    let impact = |metric| incidents.multiplier(&baseline.service, metric);

    let noise = rng.gaussian(1.0, config.noise_std_dev).clamp(0.5, 1.5);
    let load = shape.multiplier() * noise;

    // Base metrics, clamped, then incident impact, clamped again
    let cpu_percent = (baseline.cpu_baseline_percent * load).clamp(0.0, 100.0);
    let cpu_percent = (cpu_percent * impact(ImpactMetric::Cpu)).clamp(0.0, 100.0);

    let capacity_mb = baseline.memory_capacity_mb;
    let memory_mb = baseline.memory_baseline_mb
        * (MEMORY_FIXED_SHARE + (1.0 - MEMORY_FIXED_SHARE) * load)
        * impact(ImpactMetric::Memory);
    let memory_percent = (memory_mb / capacity_mb * 100.0).clamp(0.0, 100.0);

    let rps = baseline.requests_per_second_baseline * load * impact(ImpactMetric::Requests);

    let cpu_load = cpu_percent / 100.0;
    let response_time_ms =
        config.base_response_time_ms * (1.0 + 3.0 * cpu_load * cpu_load) * impact(ImpactMetric::ResponseTime);
    let overload = (cpu_percent - ERROR_KNEE_CPU_PERCENT).max(0.0) / 10.0;
    let error_rate_percent =
        (baseline.error_rate_baseline * (1.0 + overload) * impact(ImpactMetric::ErrorRate)).clamp(0.0, 100.0);
    let error_count = (rps * tick_seconds * error_rate_percent / 100.0).round() as u64;

    let disk_impact = impact(ImpactMetric::Disk);
    let disk = DiskMetrics {
        usage_percent: ((35.0 + 5.0 * load) * disk_impact).clamp(0.0, 100.0),
        read_iops: rps * 0.8 * rng.range(0.9, 1.1) * disk_impact,
        write_iops: rps * 0.4 * rng.range(0.9, 1.1) * disk_impact,
    };

    let network_impact = impact(ImpactMetric::Network);
    let network = NetworkMetrics {
        rx_mbps: rps * 0.012 * rng.range(0.9, 1.1) * network_impact,
        tx_mbps: rps * 0.03 * rng.range(0.9, 1.1) * network_impact,
        active_connections: (rps * 0.6).round() as u64,
    };

    let cores_requested =
        baseline.cpu_request_millicores as f64 * f64::from(baseline.replica_count) / 1000.0;

    ServiceMetrics {
        namespace: baseline.namespace.clone(),
        kind: baseline.kind.clone(),
        cpu: CpuMetrics {
            usage_percent: cpu_percent,
            cores_used: cores_requested * cpu_load,
            cores_requested,
        },
        memory: MemoryMetrics {
            usage_percent: memory_percent,
            used_mb: memory_percent / 100.0 * capacity_mb,
            capacity_mb,
        },
        disk,
        network,
        requests: RequestMetrics {
            requests_per_second: rps,
            error_rate_percent,
            error_count,
            response_time_ms,
            p99_response_time_ms: response_time_ms * P99_OVER_MEAN,
        },
        replicas: ReplicaMetrics {
            desired: baseline.replica_count,
            ready: baseline.ready_replicas,
        },
        health: HealthStatus::classify(error_rate_percent, cpu_percent),
        traffic_multiplier: shape.multiplier(),
        incidents: incidents
            .active_for(&baseline.service)
            .iter()
            .map(|incident| incident.scenario.clone())
            .collect(),
    }
}

/// Bounded, append-only snapshot history. Oldest entries are evicted first.
#[derive(Debug)]
pub struct TelemetryHistory {
    capacity: usize,
    retention: Duration,
    snapshots: VecDeque<MetricSnapshot>,
}

impl TelemetryHistory {
    pub fn new(capacity: usize, retention: std::time::Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            retention: Duration::from_std(retention).unwrap_or(Duration::hours(1)),
            snapshots: VecDeque::with_capacity(capacity.min(4096)),
        }
    }

    /// Append a snapshot; returns how many old ones were evicted.
    pub fn push(&mut self, snapshot: MetricSnapshot) -> usize {
        let cutoff = snapshot.timestamp - self.retention;
        self.snapshots.push_back(snapshot);

        let mut evicted = 0;
        while self.snapshots.len() > self.capacity
            || self.snapshots.front().is_some_and(|s| s.timestamp < cutoff)
        {
            self.snapshots.pop_front();
            evicted += 1;
        }
        evicted
    }

    pub fn latest(&self) -> Option<&MetricSnapshot> {
        self.snapshots.back()
    }

    /// Snapshots taken at or after `since`, oldest first.
    pub fn since(&self, since: DateTime<Utc>) -> Vec<MetricSnapshot> {
        self.snapshots
            .iter()
            .filter(|s| s.timestamp >= since)
            .cloned()
            .collect()
    }

    /// The most recent `count` snapshots, oldest first.
    pub fn recent(&self, count: usize) -> Vec<&MetricSnapshot> {
        let skip = self.snapshots.len().saturating_sub(count);
        self.snapshots.iter().skip(skip).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MetricSnapshot> {
        self.snapshots.iter()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 5, 12, minute, 0).unwrap()
    }

    #[test]
    fn test_health_classification() {
        assert_eq!(HealthStatus::classify(0.5, 50.0), HealthStatus::Healthy);
        assert_eq!(HealthStatus::classify(0.5, 95.0), HealthStatus::Warning);
        assert_eq!(HealthStatus::classify(3.0, 20.0), HealthStatus::Warning);
        assert_eq!(HealthStatus::classify(5.0, 20.0), HealthStatus::Critical);
        assert!(HealthStatus::Warning.is_available());
        assert!(!HealthStatus::Critical.is_available());
    }

    #[test]
    fn test_empty_summary_is_healthy() {
        let snapshot = MetricSnapshot::empty(at(0), StatusCounts::default());
        assert!(snapshot.services.is_empty());
        assert_eq!(snapshot.summary.overall_health, HealthStatus::Healthy);
        assert_eq!(snapshot.summary.sla_percentage, 100.0);
    }

    #[test]
    fn test_history_evicts_by_count() {
        let mut history = TelemetryHistory::new(3, std::time::Duration::from_secs(3600));
        for minute in 0..5 {
            history.push(MetricSnapshot::empty(at(minute), StatusCounts::default()));
        }
        assert_eq!(history.len(), 3);
        assert_eq!(history.iter().next().unwrap().timestamp, at(2));
        assert_eq!(history.latest().unwrap().timestamp, at(4));
    }

    #[test]
    fn test_history_evicts_by_age() {
        let mut history = TelemetryHistory::new(100, std::time::Duration::from_secs(120));
        for minute in 0..6 {
            history.push(MetricSnapshot::empty(at(minute), StatusCounts::default()));
        }
        // Retains minutes 3, 4 and 5
        assert_eq!(history.len(), 3);
        assert_eq!(history.since(at(4)).len(), 2);
        assert_eq!(history.recent(2).len(), 2);
        assert_eq!(history.recent(10).len(), 3);
    }
}
