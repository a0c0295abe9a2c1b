//! Resource declarations and the live records simulated from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

pub const DEFAULT_NAMESPACE: &str = "default";

/// Kind of a declared resource. Unknown kinds are kept verbatim as `Custom`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ResourceKind {
    Namespace,
    Deployment,
    StatefulSet,
    DaemonSet,
    Pod,
    Service,
    Ingress,
    ConfigMap,
    Secret,
    PersistentVolumeClaim,
    Job,
    CronJob,
    Custom(String),
}

impl ResourceKind {
    pub fn parse(kind: &str) -> Self {
        match kind.to_ascii_lowercase().as_str() {
            "namespace" => ResourceKind::Namespace,
            "deployment" => ResourceKind::Deployment,
            "statefulset" => ResourceKind::StatefulSet,
            "daemonset" => ResourceKind::DaemonSet,
            "pod" => ResourceKind::Pod,
            "service" => ResourceKind::Service,
            "ingress" => ResourceKind::Ingress,
            "configmap" => ResourceKind::ConfigMap,
            "secret" => ResourceKind::Secret,
            "persistentvolumeclaim" => ResourceKind::PersistentVolumeClaim,
            "job" => ResourceKind::Job,
            "cronjob" => ResourceKind::CronJob,
            _ => ResourceKind::Custom(kind.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ResourceKind::Namespace => "Namespace",
            ResourceKind::Deployment => "Deployment",
            ResourceKind::StatefulSet => "StatefulSet",
            ResourceKind::DaemonSet => "DaemonSet",
            ResourceKind::Pod => "Pod",
            ResourceKind::Service => "Service",
            ResourceKind::Ingress => "Ingress",
            ResourceKind::ConfigMap => "ConfigMap",
            ResourceKind::Secret => "Secret",
            ResourceKind::PersistentVolumeClaim => "PersistentVolumeClaim",
            ResourceKind::Job => "Job",
            ResourceKind::CronJob => "CronJob",
            ResourceKind::Custom(kind) => kind,
        }
    }

    /// Kinds that carry replicas and get a telemetry baseline.
    pub fn is_workload(&self) -> bool {
        matches!(self, ResourceKind::Deployment | ResourceKind::StatefulSet)
    }

    /// Order used to resolve a delete that names no kind. Lower wins.
    pub fn delete_priority(&self) -> u8 {
        match self {
            ResourceKind::Deployment => 0,
            ResourceKind::StatefulSet => 1,
            ResourceKind::DaemonSet => 2,
            ResourceKind::Job => 3,
            ResourceKind::CronJob => 4,
            ResourceKind::Pod => 5,
            ResourceKind::Service => 6,
            ResourceKind::Ingress => 7,
            ResourceKind::ConfigMap => 8,
            ResourceKind::Secret => 9,
            ResourceKind::PersistentVolumeClaim => 10,
            ResourceKind::Custom(_) => 11,
            ResourceKind::Namespace => 12,
        }
    }
}

impl From<String> for ResourceKind {
    fn from(kind: String) -> Self {
        ResourceKind::parse(&kind)
    }
}

impl From<ResourceKind> for String {
    fn from(kind: ResourceKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Composite identity of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub namespace: String,
    pub kind: ResourceKind,
    pub name: String,
}

impl ResourceKey {
    pub fn new(namespace: impl Into<String>, kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            kind,
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.kind, self.name)
    }
}

/// One parsed manifest document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDeclaration {
    pub kind: ResourceKind,
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub spec: Value,
}

impl ResourceDeclaration {
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(self.namespace.clone(), self.kind.clone(), self.name.clone())
    }

    /// `spec.replicas`, defaulting to one.
    pub fn replicas(&self) -> u32 {
        self.spec
            .get("replicas")
            .and_then(Value::as_u64)
            .map_or(1, |r| r.min(u64::from(u32::MAX)) as u32)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceStatus {
    Pending,
    Running,
    Failed,
}

impl ResourceStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ResourceStatus::Pending)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    Pending,
    Running,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServicePort {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub port: u16,
    pub target_port: u16,
    pub protocol: String,
}

/// Kind-specific fields derived from the declaration and the lifecycle outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResourceDetails {
    Workload {
        desired_replicas: u32,
        ready_replicas: u32,
        available_replicas: u32,
    },
    Pod {
        phase: PodPhase,
        node_assignment: Option<String>,
    },
    Service {
        service_type: String,
        cluster_ip: Option<String>,
        ports: Vec<ServicePort>,
    },
    Ingress {
        hosts: Vec<String>,
    },
    Config {
        key_count: usize,
    },
    Generic,
}

impl ResourceDetails {
    /// Details of a freshly created, not yet scheduled record.
    pub fn pending_for(decl: &ResourceDeclaration) -> Self {
        match decl.kind {
            ResourceKind::Deployment | ResourceKind::StatefulSet | ResourceKind::DaemonSet => {
                ResourceDetails::Workload {
                    desired_replicas: decl.replicas(),
                    ready_replicas: 0,
                    available_replicas: 0,
                }
            }
            ResourceKind::Pod => ResourceDetails::Pod {
                phase: PodPhase::Pending,
                node_assignment: None,
            },
            ResourceKind::Service => ResourceDetails::Service {
                service_type: decl
                    .spec
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("ClusterIP")
                    .to_string(),
                cluster_ip: None,
                ports: service_ports(&decl.spec),
            },
            ResourceKind::Ingress => ResourceDetails::Ingress {
                hosts: ingress_hosts(&decl.spec),
            },
            ResourceKind::ConfigMap | ResourceKind::Secret => ResourceDetails::Config {
                key_count: ["data", "stringData", "binaryData"]
                    .iter()
                    .filter_map(|field| decl.spec.get(field).and_then(Value::as_object))
                    .map(serde_json::Map::len)
                    .sum(),
            },
            _ => ResourceDetails::Generic,
        }
    }
}

fn service_ports(spec: &Value) -> Vec<ServicePort> {
    let Some(ports) = spec.get("ports").and_then(Value::as_array) else {
        return Vec::new();
    };

    ports
        .iter()
        .filter_map(|entry| {
            let port = u16::try_from(entry.get("port")?.as_u64()?).ok()?;
            let target_port = entry
                .get("targetPort")
                .and_then(Value::as_u64)
                .and_then(|p| u16::try_from(p).ok())
                .unwrap_or(port);
            Some(ServicePort {
                name: entry.get("name").and_then(Value::as_str).map(str::to_string),
                port,
                target_port,
                protocol: entry
                    .get("protocol")
                    .and_then(Value::as_str)
                    .unwrap_or("TCP")
                    .to_string(),
            })
        })
        .collect()
}

fn ingress_hosts(spec: &Value) -> Vec<String> {
    spec.get("rules")
        .and_then(Value::as_array)
        .map(|rules| {
            rules
                .iter()
                .filter_map(|rule| rule.get("host").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Terminal outcome applied by a completion task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Running {
        node: Option<String>,
        cluster_ip: Option<String>,
    },
    Failed {
        reason: String,
    },
}

/// Live record of a simulated resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatedResource {
    pub uid: Uuid,
    pub namespace: String,
    pub kind: ResourceKind,
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub status: ResourceStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub details: ResourceDetails,
    #[serde(default)]
    pub spec: Value,
}

impl SimulatedResource {
    pub fn pending(decl: &ResourceDeclaration, now: DateTime<Utc>) -> Self {
        Self {
            uid: Uuid::new_v4(),
            namespace: decl.namespace.clone(),
            kind: decl.kind.clone(),
            name: decl.name.clone(),
            labels: decl.labels.clone(),
            status: ResourceStatus::Pending,
            created_at: now,
            updated_at: now,
            failure_reason: None,
            details: ResourceDetails::pending_for(decl),
            spec: decl.spec.clone(),
        }
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(self.namespace.clone(), self.kind.clone(), self.name.clone())
    }

    /// Apply a terminal transition. Returns false, leaving the record untouched,
    /// unless the record is still Pending.
    pub fn complete(&mut self, transition: &Transition, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }

        match transition {
            Transition::Running { node, cluster_ip } => {
                self.status = ResourceStatus::Running;
                match &mut self.details {
                    ResourceDetails::Workload {
                        desired_replicas,
                        ready_replicas,
                        available_replicas,
                    } => {
                        *ready_replicas = *desired_replicas;
                        *available_replicas = *desired_replicas;
                    }
                    ResourceDetails::Pod { phase, node_assignment } => {
                        *phase = PodPhase::Running;
                        node_assignment.clone_from(node);
                    }
                    ResourceDetails::Service { cluster_ip: ip, .. } => {
                        ip.clone_from(cluster_ip);
                    }
                    _ => {}
                }
            }
            Transition::Failed { reason } => {
                self.status = ResourceStatus::Failed;
                self.failure_reason = Some(reason.clone());
                if let ResourceDetails::Pod { phase, .. } = &mut self.details {
                    *phase = PodPhase::Failed;
                }
            }
        }

        self.updated_at = now;
        true
    }

    /// Replica readiness as (ready, desired); single-instance kinds report 1/1 when running.
    pub fn replica_readiness(&self) -> (u32, u32) {
        match self.details {
            ResourceDetails::Workload {
                desired_replicas,
                ready_replicas,
                ..
            } => (ready_replicas, desired_replicas),
            _ => (u32::from(self.status == ResourceStatus::Running), 1),
        }
    }
}

/// Optional namespace/kind filter for listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceFilter {
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub kind: Option<ResourceKind>,
}

impl ResourceFilter {
    pub fn matches(&self, key: &ResourceKey) -> bool {
        self.namespace.as_ref().map_or(true, |ns| *ns == key.namespace)
            && self.kind.as_ref().map_or(true, |kind| *kind == key.kind)
    }
}
