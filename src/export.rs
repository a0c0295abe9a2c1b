//! Flat time-series rows for an external metrics store.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};

use crate::error::EngineResult;
use crate::telemetry::{MetricSnapshot, ServiceMetrics};

/// Rows older than this are purged by the sink.
pub const ROW_RETENTION_DAYS: i64 = 7;

/// Service name used for the cluster rollup rows. Resource names cannot
/// start with an underscore, so no service collides with it.
pub const CLUSTER_SERVICE: &str = "_cluster";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRow {
    pub service: String,
    pub metric_type: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub unit: String,
}

impl MetricRow {
    fn new(service: &str, metric_type: &str, timestamp: DateTime<Utc>, value: f64, unit: &str) -> Self {
        Self {
            service: service.to_string(),
            metric_type: metric_type.to_string(),
            timestamp,
            value,
            unit: unit.to_string(),
        }
    }
}

impl MetricSnapshot {
    /// One row per (service, metric type) plus the cluster rollup.
    pub fn to_rows(&self) -> Vec<MetricRow> {
        let ts = self.timestamp;
        let mut rows = Vec::with_capacity(self.services.len() * 12 + 6);

        for (service, m) in &self.services {
            rows.extend(service_rows(service, m, ts));
        }

        let s = &self.summary;
        rows.extend([
            MetricRow::new(CLUSTER_SERVICE, "cpu_usage", ts, s.avg_cpu_percent, "percent"),
            MetricRow::new(CLUSTER_SERVICE, "memory_usage", ts, s.avg_memory_percent, "percent"),
            MetricRow::new(CLUSTER_SERVICE, "requests_per_second", ts, s.total_requests_per_second, "rps"),
            MetricRow::new(CLUSTER_SERVICE, "error_count", ts, s.total_error_count as f64, "count"),
            MetricRow::new(CLUSTER_SERVICE, "error_rate", ts, s.error_rate_percent, "percent"),
            MetricRow::new(CLUSTER_SERVICE, "sla_percentage", ts, s.sla_percentage, "percent"),
        ]);
        rows
    }
}

fn service_rows(service: &str, m: &ServiceMetrics, ts: DateTime<Utc>) -> [MetricRow; 12] {
    [
        MetricRow::new(service, "cpu_usage", ts, m.cpu.usage_percent, "percent"),
        MetricRow::new(service, "cpu_cores", ts, m.cpu.cores_used, "cores"),
        MetricRow::new(service, "memory_usage", ts, m.memory.usage_percent, "percent"),
        MetricRow::new(service, "memory_used", ts, m.memory.used_mb, "MB"),
        MetricRow::new(service, "disk_usage", ts, m.disk.usage_percent, "percent"),
        MetricRow::new(service, "network_rx", ts, m.network.rx_mbps, "Mbps"),
        MetricRow::new(service, "network_tx", ts, m.network.tx_mbps, "Mbps"),
        MetricRow::new(service, "requests_per_second", ts, m.requests.requests_per_second, "rps"),
        MetricRow::new(service, "error_rate", ts, m.requests.error_rate_percent, "percent"),
        MetricRow::new(service, "error_count", ts, m.requests.error_count as f64, "count"),
        MetricRow::new(service, "response_time", ts, m.requests.response_time_ms, "ms"),
        MetricRow::new(service, "ready_replicas", ts, f64::from(m.replicas.ready), "count"),
    ]
}

/// Receiver for each tick's rows.
pub trait MetricSink: Send + Sync {
    fn write(&self, rows: &[MetricRow]) -> EngineResult<()>;

    /// Drop rows older than `cutoff`, returning how many went.
    fn purge_before(&self, cutoff: DateTime<Utc>) -> EngineResult<usize>;
}

/// Cutoff for a purge run at `now`.
pub fn retention_cutoff(now: DateTime<Utc>) -> DateTime<Utc> {
    now - Duration::days(ROW_RETENTION_DAYS)
}

/// Sink that keeps rows in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    rows: Mutex<Vec<MetricRow>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> Vec<MetricRow> {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MetricSink for MemorySink {
    fn write(&self, rows: &[MetricRow]) -> EngineResult<()> {
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(rows);
        Ok(())
    }

    fn purge_before(&self, cutoff: DateTime<Utc>) -> EngineResult<usize> {
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        let before = rows.len();
        rows.retain(|row| row.timestamp >= cutoff);
        Ok(before - rows.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StatusCounts;
    use chrono::TimeZone;

    #[test]
    fn test_empty_snapshot_has_cluster_rows_only() {
        let ts = Utc.with_ymd_and_hms(2024, 6, 5, 12, 0, 0).unwrap();
        let rows = MetricSnapshot::empty(ts, StatusCounts::default()).to_rows();
        assert_eq!(rows.len(), 6);
        assert!(rows.iter().all(|r| r.service == CLUSTER_SERVICE && r.timestamp == ts));
        let sla = rows.iter().find(|r| r.metric_type == "sla_percentage").unwrap();
        assert_eq!(sla.value, 100.0);
        assert_eq!(sla.unit, "percent");
    }

    #[test]
    fn test_memory_sink_purges_old_rows() {
        let now = Utc.with_ymd_and_hms(2024, 6, 15, 0, 0, 0).unwrap();
        let sink = MemorySink::new();
        let old = MetricSnapshot::empty(now - Duration::days(8), StatusCounts::default());
        let fresh = MetricSnapshot::empty(now - Duration::days(1), StatusCounts::default());
        sink.write(&old.to_rows()).unwrap();
        sink.write(&fresh.to_rows()).unwrap();

        assert_eq!(sink.purge_before(retention_cutoff(now)).unwrap(), 6);
        assert_eq!(sink.len(), 6);
        assert!(sink.rows().iter().all(|r| r.timestamp == fresh.timestamp));
    }
}
