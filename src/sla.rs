//! Availability over a sliding window of cluster snapshots.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::SlaConfig;
use crate::telemetry::{MetricSnapshot, TelemetryHistory};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlaStatus {
    Meeting,
    AtRisk,
    Breached,
    InsufficientData,
}

impl fmt::Display for SlaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SlaStatus::Meeting => "meeting",
            SlaStatus::AtRisk => "at_risk",
            SlaStatus::Breached => "breached",
            SlaStatus::InsufficientData => "insufficient_data",
        };
        f.write_str(s)
    }
}

/// Which part of the history availability is computed over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlaWindow {
    /// The most recent `recent_samples` snapshots.
    #[default]
    Recent,
    /// Everything still retained.
    Hour,
}

impl SlaWindow {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "recent" => Some(SlaWindow::Recent),
            "hour" => Some(SlaWindow::Hour),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlaReport {
    pub availability_percent: f64,
    pub status: SlaStatus,
    pub sample_count: usize,
    pub healthy_sample_count: usize,
    pub target_percent: f64,
    pub window: SlaWindow,
}

/// Classifies availability against the configured target.
#[derive(Debug, Clone)]
pub struct SlaAggregator {
    config: SlaConfig,
}

impl SlaAggregator {
    pub fn new(config: SlaConfig) -> Self {
        Self { config }
    }

    pub fn compute(&self, history: &TelemetryHistory, window: SlaWindow) -> SlaReport {
        let samples: Vec<&MetricSnapshot> = match window {
            SlaWindow::Recent => history.recent(self.config.recent_samples),
            SlaWindow::Hour => history.iter().collect(),
        };
        self.over(&samples, window)
    }

    pub fn over(&self, samples: &[&MetricSnapshot], window: SlaWindow) -> SlaReport {
        let sample_count = samples.len();
        let healthy_sample_count = samples
            .iter()
            .filter(|s| s.summary.overall_health.is_available())
            .count();

        if sample_count == 0 {
            return SlaReport {
                availability_percent: 0.0,
                status: SlaStatus::InsufficientData,
                sample_count,
                healthy_sample_count,
                target_percent: self.config.target_percent,
                window,
            };
        }

        let availability_percent = healthy_sample_count as f64 / sample_count as f64 * 100.0;
        SlaReport {
            availability_percent,
            status: self.classify(availability_percent),
            sample_count,
            healthy_sample_count,
            target_percent: self.config.target_percent,
            window,
        }
    }

    pub fn classify(&self, availability_percent: f64) -> SlaStatus {
        if availability_percent >= self.config.target_percent {
            SlaStatus::Meeting
        } else if availability_percent >= self.config.at_risk_percent {
            SlaStatus::AtRisk
        } else {
            SlaStatus::Breached
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StatusCounts;
    use crate::telemetry::HealthStatus;
    use chrono::{Duration, TimeZone, Utc};

    fn history_with(healths: &[HealthStatus]) -> TelemetryHistory {
        let start = Utc.with_ymd_and_hms(2024, 6, 5, 12, 0, 0).unwrap();
        let mut history = TelemetryHistory::new(1000, std::time::Duration::from_secs(3600));
        for (i, health) in healths.iter().enumerate() {
            let mut snapshot =
                MetricSnapshot::empty(start + Duration::seconds(5 * i as i64), StatusCounts::default());
            snapshot.summary.overall_health = *health;
            history.push(snapshot);
        }
        history
    }

    #[test]
    fn test_empty_history_is_insufficient_data() {
        let aggregator = SlaAggregator::new(SlaConfig::default());
        let report = aggregator.compute(&history_with(&[]), SlaWindow::Recent);
        assert_eq!(report.status, SlaStatus::InsufficientData);
        assert_eq!(report.availability_percent, 0.0);
        assert_eq!(report.sample_count, 0);
    }

    #[test]
    fn test_warning_counts_as_available() {
        let aggregator = SlaAggregator::new(SlaConfig::default());
        let history = history_with(&[HealthStatus::Healthy, HealthStatus::Warning]);
        let report = aggregator.compute(&history, SlaWindow::Hour);
        assert_eq!(report.availability_percent, 100.0);
        assert_eq!(report.status, SlaStatus::Meeting);
    }

    #[test]
    fn test_classification_thresholds() {
        let aggregator = SlaAggregator::new(SlaConfig::default());
        assert_eq!(aggregator.classify(99.5), SlaStatus::Meeting);
        assert_eq!(aggregator.classify(99.2), SlaStatus::AtRisk);
        assert_eq!(aggregator.classify(99.0), SlaStatus::AtRisk);
        assert_eq!(aggregator.classify(98.9), SlaStatus::Breached);
    }

    #[test]
    fn test_recent_window_only_sees_latest_samples() {
        let aggregator = SlaAggregator::new(SlaConfig {
            recent_samples: 4,
            ..SlaConfig::default()
        });
        let mut healths = vec![HealthStatus::Critical; 6];
        healths.extend([HealthStatus::Healthy; 4]);
        let history = history_with(&healths);

        let recent = aggregator.compute(&history, SlaWindow::Recent);
        assert_eq!(recent.sample_count, 4);
        assert_eq!(recent.status, SlaStatus::Meeting);

        let hour = aggregator.compute(&history, SlaWindow::Hour);
        assert_eq!(hour.sample_count, 10);
        assert_eq!(hour.availability_percent, 40.0);
        assert_eq!(hour.status, SlaStatus::Breached);
    }
}
