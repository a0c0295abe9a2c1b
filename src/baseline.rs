//! Steady-state metric baselines derived from workload resource requests.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::config::TelemetryConfig;
use crate::resources::{ResourceKind, SimulatedResource, DEFAULT_NAMESPACE};

// Share of the memory request a pod sits at when idle-to-average loaded
const MEMORY_BASELINE_RATIO: f64 = 0.75;
// Capacity over request when no memory limit is declared
const MEMORY_HEADROOM_RATIO: f64 = 1.5;
const MIN_CPU_BASELINE_PERCENT: f64 = 10.0;
const MAX_CPU_BASELINE_PERCENT: f64 = 75.0;
const RPS_PER_REPLICA: f64 = 20.0;

const MIB: f64 = 1024.0 * 1024.0;

/// Baseline for one monitored service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceBaseline {
    pub service: String,
    pub namespace: String,
    pub kind: ResourceKind,
    pub replica_count: u32,
    pub ready_replicas: u32,
    pub cpu_request_millicores: u64,
    pub cpu_baseline_percent: f64,
    pub memory_baseline_mb: f64,
    pub memory_capacity_mb: f64,
    pub requests_per_second_baseline: f64,
    pub error_rate_baseline: f64,
}

impl ServiceBaseline {
    /// Derive a baseline from a Deployment or StatefulSet record.
    pub fn from_workload(resource: &SimulatedResource, config: &TelemetryConfig) -> Self {
        let requests = ContainerRequests::from_spec(&resource.spec);
        let cpu_millicores = requests
            .cpu_millicores
            .unwrap_or(config.default_cpu_request_millicores);
        let memory_request_mb = requests
            .memory_request_mb
            .unwrap_or(config.default_memory_request_mb);
        let memory_capacity_mb = requests
            .memory_limit_mb
            .unwrap_or(memory_request_mb * MEMORY_HEADROOM_RATIO)
            .max(1.0);
        let (ready_replicas, replica_count) = resource.replica_readiness();

        Self {
            service: service_name(&resource.namespace, &resource.name),
            namespace: resource.namespace.clone(),
            kind: resource.kind.clone(),
            replica_count,
            ready_replicas,
            cpu_request_millicores: cpu_millicores,
            cpu_baseline_percent: (15.0 + cpu_millicores as f64 / 10.0)
                .clamp(MIN_CPU_BASELINE_PERCENT, MAX_CPU_BASELINE_PERCENT),
            memory_baseline_mb: memory_request_mb * MEMORY_BASELINE_RATIO,
            memory_capacity_mb,
            requests_per_second_baseline: f64::from(replica_count.max(1))
                * (RPS_PER_REPLICA + cpu_millicores as f64 / 10.0),
            error_rate_baseline: config.error_rate_baseline_percent,
        }
    }
}

/// Name a service is reported under: bare in the default namespace,
/// `namespace/name` elsewhere.
pub fn service_name(namespace: &str, name: &str) -> String {
    if namespace == DEFAULT_NAMESPACE {
        name.to_string()
    } else {
        format!("{namespace}/{name}")
    }
}

/// Summed per-pod container requests/limits. `None` when no container declares one.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
struct ContainerRequests {
    cpu_millicores: Option<u64>,
    memory_request_mb: Option<f64>,
    memory_limit_mb: Option<f64>,
}

impl ContainerRequests {
    fn from_spec(spec: &Value) -> Self {
        let containers = spec
            .pointer("/template/spec/containers")
            .or_else(|| spec.get("containers"))
            .and_then(Value::as_array);

        let mut totals = ContainerRequests::default();
        for container in containers.into_iter().flatten() {
            let resources = container.get("resources");
            let quantity = |section: &str, name: &str| {
                resources
                    .and_then(|r| r.get(section))
                    .and_then(|s| s.get(name))
                    .and_then(quantity_str)
            };

            if let Some(cpu) = quantity("requests", "cpu").and_then(|q| parse_cpu_millicores(&q)) {
                totals.cpu_millicores = Some(totals.cpu_millicores.unwrap_or(0) + cpu);
            }
            if let Some(mem) = quantity("requests", "memory").and_then(|q| parse_memory_mb(&q)) {
                totals.memory_request_mb = Some(totals.memory_request_mb.unwrap_or(0.0) + mem);
            }
            if let Some(mem) = quantity("limits", "memory").and_then(|q| parse_memory_mb(&q)) {
                totals.memory_limit_mb = Some(totals.memory_limit_mb.unwrap_or(0.0) + mem);
            }
        }
        totals
    }
}

fn quantity_str(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parse a CPU quantity (`"300m"`, `"0.5"`, `"2"`) into millicores.
pub fn parse_cpu_millicores(quantity: &str) -> Option<u64> {
    let quantity = quantity.trim();
    let millicores = match quantity.strip_suffix('m') {
        Some(milli) => milli.parse::<f64>().ok()?,
        None => quantity.parse::<f64>().ok()? * 1000.0,
    };
    (millicores.is_finite() && millicores >= 0.0).then(|| millicores.round() as u64)
}

/// Parse a memory quantity (`"512Mi"`, `"1Gi"`, `"500M"`, plain bytes) into MiB.
pub fn parse_memory_mb(quantity: &str) -> Option<f64> {
    let quantity = quantity.trim();
    let split = quantity
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(quantity.len());
    let (number, suffix) = quantity.split_at(split);
    let number: f64 = number.parse().ok()?;

    let bytes_per_unit = match suffix {
        "" => 1.0,
        "Ki" => 1024.0,
        "Mi" => MIB,
        "Gi" => MIB * 1024.0,
        "Ti" => MIB * 1024.0 * 1024.0,
        "k" | "K" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        _ => return None,
    };
    Some(number * bytes_per_unit / MIB)
}

/// Baselines of the currently monitored services, rebuilt when the store's
/// workload generation moves.
#[derive(Debug, Default)]
pub struct BaselineTable {
    generation: Option<u64>,
    entries: BTreeMap<String, ServiceBaseline>,
}

impl BaselineTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.generation == Some(generation)
    }

    pub fn rebuild(&mut self, generation: u64, workloads: &[SimulatedResource], config: &TelemetryConfig) {
        self.entries = workloads
            .iter()
            .map(|resource| {
                let baseline = ServiceBaseline::from_workload(resource, config);
                (baseline.service.clone(), baseline)
            })
            .collect();
        self.generation = Some(generation);
    }

    pub fn get(&self, service: &str) -> Option<&ServiceBaseline> {
        self.entries.get(service)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServiceBaseline> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
