use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;
use vcluster::clock::{Clock, ManualClock};
use vcluster::config::{IncidentConfig, TelemetryConfig};
use vcluster::incidents::IncidentModel;
use vcluster::manifest::parse_manifest;
use vcluster::random::{FixedRandom, RandomSource, SeededRandom, SharedRandom};
use vcluster::resources::{ResourceKey, ResourceKind, SimulatedResource, Transition};
use vcluster::store::ResourceStore;
use vcluster::telemetry::{HealthStatus, TelemetrySynthesizer};

fn wednesday_noon() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 5, 12, 0, 0).unwrap()
}

fn workload(name: &str, replicas: u32, cpu: &str, memory: &str) -> String {
    format!(
        r#"
kind: Deployment
metadata:
  name: {name}
spec:
  replicas: {replicas}
  template:
    spec:
      containers:
        - name: app
          resources:
            requests:
              cpu: {cpu}
              memory: {memory}
"#
    )
}

fn put_running(store: &ResourceStore, manifest: &str, now: DateTime<Utc>) {
    for decl in parse_manifest(manifest).unwrap() {
        let mut resource = SimulatedResource::pending(&decl, now);
        resource.complete(&Transition::Running { node: None, cluster_ip: None }, now);
        store.put(resource).unwrap();
    }
}

fn synthesizer(
    store: &Arc<ResourceStore>,
    clock: &Arc<ManualClock>,
    random: impl RandomSource + 'static,
    incidents_enabled: bool,
) -> TelemetrySynthesizer {
    TelemetrySynthesizer::new(
        TelemetryConfig::default(),
        std::time::Duration::from_secs(5),
        IncidentModel::new(IncidentConfig {
            enabled: incidents_enabled,
            ..IncidentConfig::default()
        }),
        Arc::clone(store),
        clock.clone(),
        SharedRandom::new(random),
    )
}

#[test]
fn test_no_services_yields_healthy_empty_snapshot() {
    let store = Arc::new(ResourceStore::new());
    let clock = Arc::new(ManualClock::new(wednesday_noon()));
    let mut synth = synthesizer(&store, &clock, SeededRandom::new(1), true);

    let snapshot = synth.synthesize().unwrap();
    assert!(snapshot.services.is_empty());
    assert_eq!(snapshot.summary.overall_health, HealthStatus::Healthy);
    assert_eq!(snapshot.summary.sla_percentage, 100.0);
    assert_eq!(snapshot.summary.total_services, 0);
}

#[test]
fn test_fixed_seed_and_clock_are_bit_identical() {
    let run = || {
        let store = Arc::new(ResourceStore::new());
        let clock = Arc::new(ManualClock::new(wednesday_noon()));
        put_running(&store, &workload("web", 3, "300m", "512Mi"), wednesday_noon());
        put_running(&store, &workload("api", 2, "500m", "1Gi"), wednesday_noon());
        let mut synth = synthesizer(&store, &clock, SeededRandom::new(99), true);

        (0..20)
            .map(|_| {
                clock.advance(Duration::seconds(5));
                serde_json::to_string(&synth.synthesize().unwrap()).unwrap()
            })
            .collect::<Vec<_>>()
    };
    assert_eq!(run(), run());
}

#[test]
fn test_baseline_metrics_at_noon() {
    let store = Arc::new(ResourceStore::new());
    let clock = Arc::new(ManualClock::new(wednesday_noon()));
    put_running(&store, &workload("web", 3, "300m", "512Mi"), wednesday_noon());
    let mut synth = synthesizer(&store, &clock, FixedRandom::new(0.5), false);

    let snapshot = synth.synthesize().unwrap();
    let web = &snapshot.services["web"];
    assert_eq!(web.replicas.desired, 3);
    assert_eq!(web.replicas.ready, 3);
    assert!((web.cpu.usage_percent - 45.0 * web.traffic_multiplier).abs() < 1e-9);
    assert!((web.requests.error_rate_percent - 0.1).abs() < 1e-9);
    assert_eq!(web.health, HealthStatus::Healthy);
    assert!(web.incidents.is_empty());
    assert_eq!(snapshot.summary.total_services, 1);
    assert_eq!(snapshot.summary.resources.running, 1);
}

#[test]
fn test_percentages_stay_clamped_under_stacked_incidents() {
    let store = Arc::new(ResourceStore::new());
    let clock = Arc::new(ManualClock::new(wednesday_noon()));
    put_running(&store, &workload("hot", 1, "4", "64Mi"), wednesday_noon());
    let mut synth = synthesizer(&store, &clock, SeededRandom::new(5), true);
    synth.synthesize().unwrap();

    for scenario in ["cpu_spike", "traffic_surge", "memory_leak", "cpu_spike"] {
        synth
            .incidents_mut()
            .inject("hot", scenario, clock.now())
            .unwrap();
    }

    for _ in 0..50 {
        clock.advance(Duration::seconds(5));
        let snapshot = synth.synthesize().unwrap();
        for metrics in snapshot.services.values() {
            assert!((0.0..=100.0).contains(&metrics.cpu.usage_percent));
            assert!((0.0..=100.0).contains(&metrics.memory.usage_percent));
            assert!((0.0..=100.0).contains(&metrics.requests.error_rate_percent));
        }
        assert!((0.0..=100.0).contains(&snapshot.summary.avg_cpu_percent));
    }
}

#[test]
fn test_incident_inflates_error_rate_then_reverts() {
    let store = Arc::new(ResourceStore::new());
    let clock = Arc::new(ManualClock::new(wednesday_noon()));
    put_running(&store, &workload("web", 3, "300m", "512Mi"), wednesday_noon());
    let mut synth = synthesizer(&store, &clock, FixedRandom::new(0.5), false);

    let before = synth.synthesize().unwrap();
    let baseline_error = before.services["web"].requests.error_rate_percent;

    synth
        .incidents_mut()
        .inject("web", "error_burst", clock.now())
        .unwrap();

    // Active for the full 120 s
    for _ in 0..23 {
        clock.advance(Duration::seconds(5));
        let snapshot = synth.synthesize().unwrap();
        let web = &snapshot.services["web"];
        assert!(web.requests.error_rate_percent > baseline_error * 7.0);
        assert_eq!(web.incidents, vec!["error_burst".to_string()]);
    }

    // First tick at the deadline sees the incident gone
    clock.advance(Duration::seconds(5));
    let after = synth.synthesize().unwrap();
    let web = &after.services["web"];
    assert!((web.requests.error_rate_percent - baseline_error).abs() < 1e-6);
    assert!(web.incidents.is_empty());
    assert_eq!(synth.incidents().stats().expired, 1);
}

#[test]
fn test_removed_workload_leaves_telemetry_and_drops_incidents() {
    let store = Arc::new(ResourceStore::new());
    let clock = Arc::new(ManualClock::new(wednesday_noon()));
    put_running(&store, &workload("web", 3, "300m", "512Mi"), wednesday_noon());
    put_running(&store, &workload("api", 1, "100m", "128Mi"), wednesday_noon());
    let mut synth = synthesizer(&store, &clock, FixedRandom::new(0.5), false);

    assert_eq!(synth.synthesize().unwrap().services.len(), 2);
    synth
        .incidents_mut()
        .inject("api", "cpu_spike", clock.now())
        .unwrap();

    store
        .delete(&ResourceKey::new("default", ResourceKind::Deployment, "api"))
        .unwrap();
    let snapshot = synth.synthesize().unwrap();
    assert_eq!(snapshot.services.keys().collect::<Vec<_>>(), vec!["web"]);
    assert_eq!(synth.incidents().active_count(), 0);
    assert_eq!(snapshot.summary.active_incidents, 0);
}

#[test]
fn test_night_traffic_is_lower_than_afternoon() {
    let store = Arc::new(ResourceStore::new());
    let afternoon = Utc.with_ymd_and_hms(2024, 6, 5, 14, 30, 0).unwrap();
    let clock = Arc::new(ManualClock::new(afternoon));
    put_running(&store, &workload("web", 3, "300m", "512Mi"), afternoon);
    let mut synth = synthesizer(&store, &clock, FixedRandom::new(0.5), false);

    let peak = synth.synthesize().unwrap().services["web"].requests.requests_per_second;
    clock.set(Utc.with_ymd_and_hms(2024, 6, 6, 2, 0, 0).unwrap());
    let night = synth.synthesize().unwrap().services["web"].requests.requests_per_second;
    assert!(night < peak * 0.3);
}
