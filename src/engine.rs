//! The owned engine instance: resource operations, the periodic tick driver
//! and the query surface.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::baseline::service_name;
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::{ConfigError, EngineError, EngineResult};
use crate::export::{retention_cutoff, MetricSink};
use crate::hub::{BroadcastHub, HubMessage, HubStats, Subscriber};
use crate::incidents::{ActiveIncident, IncidentModel, IncidentStats};
use crate::lifecycle::{DeploySummary, DeploymentSimulator};
use crate::manifest::parse_manifest;
use crate::protocol::{Command, CommandResponse, CommandType, ResponseStatus};
use crate::random::{RandomSource, SeededRandom, SharedRandom};
use crate::resources::{ResourceFilter, ResourceKey, ResourceKind, SimulatedResource, DEFAULT_NAMESPACE};
use crate::sla::{SlaAggregator, SlaReport, SlaWindow};
use crate::store::{DeleteOutcome, ResourceStore, StatusCounts};
use crate::telemetry::{MetricSnapshot, TelemetryHistory, TelemetrySynthesizer};

/// Outcome of `delete_resource`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteStatus {
    Deleted,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteReport {
    pub status: DeleteStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<SimulatedResource>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStatus {
    pub started_at: DateTime<Utc>,
    pub uptime_seconds: i64,
    pub tick_interval_ms: u64,
    pub ticks: u64,
    pub driver_running: bool,
    pub resources: StatusCounts,
    pub pending_completions: usize,
    pub monitored_services: usize,
    pub active_incidents: usize,
    pub incident_injection_enabled: bool,
    pub history_len: usize,
    pub hub: HubStats,
}

struct Shared {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    store: Arc<ResourceStore>,
    simulator: DeploymentSimulator,
    synthesizer: Mutex<TelemetrySynthesizer>,
    history: RwLock<TelemetryHistory>,
    sla: SlaAggregator,
    hub: BroadcastHub,
    sink: Option<Arc<dyn MetricSink>>,
    last_purge: Mutex<Option<DateTime<Utc>>>,
    // Serialises ticks between the driver and direct callers
    tick_lock: tokio::sync::Mutex<()>,
    driver: Mutex<Option<JoinHandle<()>>>,
    started_at: DateTime<Utc>,
}

/// Handle to the virtual cluster engine. Clones share one instance.
#[derive(Clone)]
pub struct ClusterEngine {
    shared: Arc<Shared>,
}

impl ClusterEngine {
    /// Engine on the wall clock, seeded from `config.seed` or OS entropy.
    pub fn new(config: EngineConfig) -> Result<Self, ConfigError> {
        let random = match config.seed {
            Some(seed) => SeededRandom::new(seed),
            None => SeededRandom::from_entropy(),
        };
        Self::with_parts(config, Arc::new(SystemClock), random)
    }

    pub fn with_parts(
        config: EngineConfig,
        clock: Arc<dyn Clock>,
        random: impl RandomSource + 'static,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let random = SharedRandom::new(random);
        let store = Arc::new(ResourceStore::new());
        let simulator = DeploymentSimulator::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            random.clone(),
            config.lifecycle.clone(),
        );
        let synthesizer = TelemetrySynthesizer::new(
            config.telemetry.clone(),
            config.tick_interval(),
            IncidentModel::new(config.incidents.clone()),
            Arc::clone(&store),
            Arc::clone(&clock),
            random,
        );
        let history = TelemetryHistory::new(
            config.history_capacity(),
            std::time::Duration::from_secs(config.history_retention_secs),
        );

        Ok(Self {
            shared: Arc::new(Shared {
                sla: SlaAggregator::new(config.sla.clone()),
                hub: BroadcastHub::new(config.hub.clone(), Arc::clone(&clock)),
                started_at: clock.now(),
                config,
                clock,
                store,
                simulator,
                synthesizer: Mutex::new(synthesizer),
                history: RwLock::new(history),
                sink: None,
                last_purge: Mutex::new(None),
                tick_lock: tokio::sync::Mutex::new(()),
                driver: Mutex::new(None),
            }),
        })
    }

    /// Attach a sink for per-tick metric rows. Only valid before the engine
    /// is shared.
    pub fn with_sink(mut self, sink: Arc<dyn MetricSink>) -> EngineResult<Self> {
        let shared = Arc::get_mut(&mut self.shared)
            .ok_or_else(|| EngineError::InvalidRequest("engine is already shared".to_string()))?;
        shared.sink = Some(sink);
        Ok(self)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    fn synthesizer(&self) -> EngineResult<MutexGuard<'_, TelemetrySynthesizer>> {
        self.shared
            .synthesizer
            .lock()
            .map_err(|_| EngineError::poisoned("telemetry synthesizer"))
    }

    fn history(&self) -> EngineResult<std::sync::RwLockReadGuard<'_, TelemetryHistory>> {
        self.shared
            .history
            .read()
            .map_err(|_| EngineError::poisoned("telemetry history"))
    }

    // ----- resources -----

    /// Parse a manifest and start simulating every declared resource.
    /// A malformed manifest creates nothing.
    pub fn deploy(&self, manifest: &str) -> EngineResult<DeploySummary> {
        let declarations = parse_manifest(manifest)?;
        self.shared.simulator.deploy(declarations)
    }

    pub fn list_resources(
        &self,
        namespace: Option<&str>,
        kind: Option<&str>,
    ) -> EngineResult<Vec<SimulatedResource>> {
        let filter = ResourceFilter {
            namespace: namespace.map(str::to_string),
            kind: kind.map(ResourceKind::parse),
        };
        self.shared.store.list(&filter)
    }

    /// Look up one resource. Without a kind, every kind sharing the name is
    /// considered and the first in delete priority order is returned.
    pub fn get_resource(
        &self,
        name: &str,
        namespace: &str,
        kind: Option<&str>,
    ) -> EngineResult<SimulatedResource> {
        let key = match kind {
            Some(kind) => ResourceKey::new(namespace, ResourceKind::parse(kind), name),
            None => self
                .shared
                .store
                .keys_named(namespace, name)?
                .into_iter()
                .min_by_key(|key| key.kind.delete_priority())
                .unwrap_or_else(|| ResourceKey::new(namespace, ResourceKind::Custom("*".to_string()), name)),
        };
        self.shared
            .store
            .get(&key)?
            .ok_or(EngineError::ResourceNotFound(key))
    }

    pub fn delete_resource(
        &self,
        name: &str,
        namespace: &str,
        kind: Option<&str>,
    ) -> EngineResult<DeleteReport> {
        let kind = kind.map(ResourceKind::parse);
        Ok(match self.shared.simulator.delete(name, namespace, kind)? {
            DeleteOutcome::Deleted(resource) => DeleteReport {
                status: DeleteStatus::Deleted,
                resource: Some(resource),
            },
            DeleteOutcome::NotFound => DeleteReport {
                status: DeleteStatus::NotFound,
                resource: None,
            },
        })
    }

    // ----- telemetry -----

    /// Latest snapshot, or an empty one when no tick has run yet.
    pub fn get_snapshot(&self) -> EngineResult<MetricSnapshot> {
        if let Some(latest) = self.history()?.latest() {
            return Ok(latest.clone());
        }
        Ok(MetricSnapshot::empty(
            self.shared.clock.now(),
            self.shared.store.status_counts()?,
        ))
    }

    /// Snapshots from the last `window_minutes`, oldest first.
    pub fn get_history(&self, window_minutes: u64) -> EngineResult<Vec<MetricSnapshot>> {
        let minutes = i64::try_from(window_minutes).unwrap_or(i64::MAX).min(i64::from(i32::MAX));
        let since = self.shared.clock.now() - Duration::minutes(minutes);
        Ok(self.history()?.since(since))
    }

    pub fn get_sla(&self) -> EngineResult<SlaReport> {
        self.get_sla_window(SlaWindow::Recent)
    }

    pub fn get_sla_window(&self, window: SlaWindow) -> EngineResult<SlaReport> {
        let history = self.history()?;
        Ok(self.shared.sla.compute(&history, window))
    }

    // ----- subscriptions -----

    pub async fn subscribe(
        &self,
        remote_address: Option<String>,
    ) -> EngineResult<(Subscriber, mpsc::Receiver<HubMessage>)> {
        self.shared.hub.connect(remote_address).await
    }

    pub async fn unsubscribe(&self, subscriber_id: u64) -> bool {
        self.shared.hub.disconnect(subscriber_id).await
    }

    /// Whether the hub still delivers to `subscriber_id`.
    pub async fn is_subscribed(&self, subscriber_id: u64) -> bool {
        self.shared.hub.is_connected(subscriber_id).await
    }

    // ----- incidents -----

    /// Start a scenario on a monitored service.
    pub fn inject_incident(&self, service: &str, scenario: &str) -> EngineResult<ActiveIncident> {
        let monitored = self
            .shared
            .store
            .running_workloads()?
            .iter()
            .any(|r| service_name(&r.namespace, &r.name) == service);
        if !monitored {
            return Err(EngineError::InvalidRequest(format!(
                "service '{service}' is not a running workload"
            )));
        }
        let now = self.shared.clock.now();
        self.synthesizer()?.incidents_mut().inject(service, scenario, now)
    }

    pub fn clear_incidents(&self, service: Option<&str>) -> EngineResult<usize> {
        let cleared = self.synthesizer()?.incidents_mut().clear(service);
        info!("🧹 Cleared {} incidents", cleared);
        Ok(cleared)
    }

    pub fn set_incident_injection(&self, enabled: bool) -> EngineResult<()> {
        self.synthesizer()?.incidents_mut().set_enabled(enabled);
        info!("🎲 Random incident injection {}", if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    pub fn active_incidents(&self) -> EngineResult<Vec<ActiveIncident>> {
        Ok(self.synthesizer()?.incidents().active().cloned().collect())
    }

    pub fn incident_stats(&self) -> EngineResult<IncidentStats> {
        Ok(self.synthesizer()?.incidents().stats().clone())
    }

    fn incident_overview(&self) -> EngineResult<Value> {
        let synthesizer = self.synthesizer()?;
        let incidents: &IncidentModel = synthesizer.incidents();
        Ok(json!({
            "enabled": incidents.is_enabled(),
            "active": incidents.active().collect::<Vec<_>>(),
            "stats": incidents.stats(),
            "scenarios": incidents.scenarios(),
        }))
    }

    // ----- driver -----

    /// Run one generation → aggregation → broadcast cycle.
    pub async fn tick(&self) -> EngineResult<MetricSnapshot> {
        let _tick = self.shared.tick_lock.lock().await;

        let snapshot = self.synthesizer()?.synthesize()?;
        {
            let mut history = self
                .shared
                .history
                .write()
                .map_err(|_| EngineError::poisoned("telemetry history"))?;
            history.push(snapshot.clone());
        }

        if let Some(sink) = &self.shared.sink {
            self.export(sink.as_ref(), &snapshot);
        }

        let report = self
            .shared
            .hub
            .broadcast(&HubMessage::Snapshot(snapshot.clone()))
            .await;
        debug!(
            "tick {}: {} services, {} subscribers served",
            snapshot.tick,
            snapshot.services.len(),
            report.delivered
        );
        Ok(snapshot)
    }

    fn export(&self, sink: &dyn MetricSink, snapshot: &MetricSnapshot) {
        if let Err(e) = sink.write(&snapshot.to_rows()) {
            warn!("Failed to export metric rows: {}", e);
        }

        let mut last_purge = self
            .shared
            .last_purge
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let due = last_purge.map_or(true, |at| snapshot.timestamp - at >= Duration::days(1));
        if due {
            match sink.purge_before(retention_cutoff(snapshot.timestamp)) {
                Ok(purged) => debug!("purged {} expired metric rows", purged),
                Err(e) => warn!("Failed to purge metric rows: {}", e),
            }
            *last_purge = Some(snapshot.timestamp);
        }
    }

    /// Start the periodic driver. A second call while it runs is a no-op.
    pub fn start(&self) -> EngineResult<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| EngineError::InvalidRequest("start requires a tokio runtime".to_string()))?;

        let mut driver = self
            .shared
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if driver.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!("tick driver already running");
            return Ok(());
        }

        let engine = self.clone();
        let period = self.shared.config.tick_interval();
        *driver = Some(runtime.spawn(async move {
            let mut interval = time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if let Err(e) = engine.tick().await {
                    error!("⏭️  Tick skipped: {}", e);
                }
            }
        }));
        info!("▶️  Engine started, ticking every {:?}", period);
        Ok(())
    }

    /// Stop the periodic driver. In-flight completions keep running.
    pub fn shutdown(&self) -> bool {
        let handle = self
            .shared
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match handle {
            Some(handle) => {
                handle.abort();
                info!("⏹️  Engine stopped");
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Wait for every pending completion to land.
    pub async fn drain(&self) {
        self.shared.simulator.drain().await;
    }

    /// Cancel every pending completion.
    pub fn abort_pending(&self) -> usize {
        self.shared.simulator.abort_pending()
    }

    pub async fn status(&self) -> EngineResult<EngineStatus> {
        let now = self.shared.clock.now();
        let (ticks, monitored_services, active_incidents, incident_injection_enabled) = {
            let synthesizer = self.synthesizer()?;
            (
                synthesizer.tick_count(),
                synthesizer.baselines().len(),
                synthesizer.incidents().active_count(),
                synthesizer.incidents().is_enabled(),
            )
        };
        let history_len = self.history()?.len();
        let hub = self.shared.hub.stats().await;
        Ok(EngineStatus {
            started_at: self.shared.started_at,
            uptime_seconds: (now - self.shared.started_at).num_seconds(),
            tick_interval_ms: self.shared.config.tick_interval_ms,
            ticks,
            driver_running: self.is_running(),
            resources: self.shared.store.status_counts()?,
            pending_completions: self.shared.simulator.pending_completions(),
            monitored_services,
            active_incidents,
            incident_injection_enabled,
            history_len,
            hub,
        })
    }

    // ----- command surface -----

    /// Execute a request-response command. Subscriptions are tied to a
    /// connection and are handled by the server.
    pub async fn execute(&self, command: &Command) -> CommandResponse {
        let result = self.dispatch(&command.command_type).await;
        let (status, message, data) = match result {
            Ok((message, data)) => (ResponseStatus::Success, message, data),
            Err(e) => {
                debug!("{} failed: {}", command.command_type.name(), e);
                (ResponseStatus::for_error(&e), e.to_string(), None)
            }
        };
        CommandResponse {
            id: command.id,
            timestamp: crate::protocol::now_millis(),
            status,
            message: Some(message),
            data,
        }
    }

    async fn dispatch(&self, command: &CommandType) -> EngineResult<(String, Option<Value>)> {
        fn namespace_or_default(namespace: &Option<String>) -> &str {
            namespace.as_deref().unwrap_or(DEFAULT_NAMESPACE)
        }

        match command {
            CommandType::Ping => Ok(("pong".to_string(), None)),
            CommandType::Status => {
                let status = self.status().await?;
                Ok(("engine status".to_string(), Some(to_value(&status)?)))
            }
            CommandType::Deploy { manifest } => {
                let summary = self.deploy(manifest)?;
                Ok((
                    format!("accepted {} resources", summary.deployed_count),
                    Some(to_value(&summary)?),
                ))
            }
            CommandType::ListResources { namespace, kind } => {
                let resources = self.list_resources(namespace.as_deref(), kind.as_deref())?;
                Ok((format!("{} resources", resources.len()), Some(to_value(&resources)?)))
            }
            CommandType::GetResource { name, namespace, kind } => {
                let resource = self.get_resource(name, namespace_or_default(namespace), kind.as_deref())?;
                Ok((resource.key().to_string(), Some(to_value(&resource)?)))
            }
            CommandType::DeleteResource { name, namespace, kind } => {
                let report = self.delete_resource(name, namespace_or_default(namespace), kind.as_deref())?;
                let message = match report.status {
                    DeleteStatus::Deleted => format!("deleted {name}"),
                    DeleteStatus::NotFound => format!("{name} not found"),
                };
                Ok((message, Some(to_value(&report)?)))
            }
            CommandType::GetSnapshot => {
                let snapshot = self.get_snapshot()?;
                Ok(("latest snapshot".to_string(), Some(to_value(&snapshot)?)))
            }
            CommandType::GetHistory { window_minutes } => {
                let history = self.get_history(*window_minutes)?;
                Ok((format!("{} snapshots", history.len()), Some(to_value(&history)?)))
            }
            CommandType::GetSla { window } => {
                let report = self.get_sla_window(*window)?;
                Ok((format!("sla {}", report.status), Some(to_value(&report)?)))
            }
            CommandType::InjectIncident { service, scenario } => {
                let incident = self.inject_incident(service, scenario)?;
                Ok((
                    format!("incident {} injected on {}", incident.scenario, incident.service),
                    Some(to_value(&incident)?),
                ))
            }
            CommandType::ClearIncidents { service } => {
                let cleared = self.clear_incidents(service.as_deref())?;
                Ok((format!("cleared {cleared} incidents"), Some(json!({ "cleared": cleared }))))
            }
            CommandType::SetIncidentInjection { enabled } => {
                self.set_incident_injection(*enabled)?;
                Ok((
                    format!("incident injection {}", if *enabled { "enabled" } else { "disabled" }),
                    Some(json!({ "enabled": enabled })),
                ))
            }
            CommandType::GetIncidents => Ok(("incidents".to_string(), Some(self.incident_overview()?))),
            CommandType::Subscribe | CommandType::Unsubscribe => Err(EngineError::InvalidRequest(format!(
                "{} requires a streaming connection",
                command.name()
            ))),
        }
    }
}

fn to_value<T: Serialize>(value: &T) -> EngineResult<Value> {
    serde_json::to_value(value).map_err(|e| EngineError::InvalidRequest(format!("unserializable response: {e}")))
}

impl std::fmt::Debug for ClusterEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterEngine")
            .field("tick_interval_ms", &self.shared.config.tick_interval_ms)
            .field("simulator", &self.shared.simulator)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::random::FixedRandom;
    use chrono::TimeZone;

    fn engine() -> ClusterEngine {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 5, 12, 0, 0).unwrap()));
        ClusterEngine::with_parts(EngineConfig::default(), clock, FixedRandom::new(0.5)).unwrap()
    }

    #[tokio::test]
    async fn test_snapshot_before_first_tick_is_empty() {
        let engine = engine();
        let snapshot = engine.get_snapshot().unwrap();
        assert!(snapshot.services.is_empty());
        assert_eq!(snapshot.summary.sla_percentage, 100.0);
        assert!(engine.get_history(60).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_manifest_creates_nothing() {
        let engine = engine();
        let err = engine.deploy("kind: [unclosed").unwrap_err();
        assert!(matches!(err, EngineError::MalformedManifest(_)));
        assert!(engine.list_resources(None, None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_commands_need_a_connection() {
        let engine = engine();
        let response = engine
            .execute(&Command {
                id: 5,
                timestamp: 0,
                command_type: CommandType::Subscribe,
            })
            .await;
        assert_eq!(response.id, 5);
        assert_eq!(response.status, ResponseStatus::InvalidCommand);
    }

    #[tokio::test]
    async fn test_get_missing_resource_is_not_found() {
        let engine = engine();
        let err = engine.get_resource("ghost", "default", None).unwrap_err();
        assert!(matches!(err, EngineError::ResourceNotFound(_)));
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let engine = engine();
        engine.start().unwrap();
        engine.start().unwrap();
        assert!(engine.is_running());
        assert!(engine.shutdown());
        assert!(!engine.shutdown());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = EngineConfig {
            tick_interval_ms: 0,
            ..EngineConfig::default()
        };
        assert!(ClusterEngine::new(config).is_err());
    }
}
