use std::sync::Arc;
use std::time::Duration;
use vcluster::clock::SystemClock;
use vcluster::config::LifecycleConfig;
use vcluster::lifecycle::DeploymentSimulator;
use vcluster::manifest::parse_manifest;
use vcluster::random::{FixedRandom, RandomSource, SeededRandom, SharedRandom};
use vcluster::resources::*;
use vcluster::store::{DeleteOutcome, ResourceStore};

const WEB: &str = r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
spec:
  replicas: 3
  template:
    spec:
      containers:
        - name: web
          image: nginx:1.25
          resources:
            requests:
              cpu: 300m
              memory: 512Mi
"#;

const WEB_SERVICE: &str = r#"
apiVersion: v1
kind: Service
metadata:
  name: web
spec:
  ports:
    - port: 80
      targetPort: 8080
"#;

fn simulator(random: impl RandomSource + 'static) -> (Arc<ResourceStore>, DeploymentSimulator) {
    let store = Arc::new(ResourceStore::new());
    let simulator = DeploymentSimulator::new(
        Arc::clone(&store),
        Arc::new(SystemClock),
        SharedRandom::new(random),
        LifecycleConfig::default(),
    );
    (store, simulator)
}

fn web_key() -> ResourceKey {
    ResourceKey::new("default", ResourceKind::Deployment, "web")
}

#[tokio::test(start_paused = true)]
async fn test_deploy_returns_pending_immediately() {
    let (store, simulator) = simulator(FixedRandom::new(0.5));
    let manifest = format!("{WEB}\n---\n{WEB_SERVICE}");

    let summary = simulator.deploy(parse_manifest(&manifest).unwrap()).unwrap();
    assert_eq!(summary.deployed_count, 2);
    assert_eq!(summary.failed_count, 0);
    assert!(summary
        .initial_resources
        .iter()
        .all(|r| r.status == ResourceStatus::Pending));
    assert_eq!(store.len().unwrap(), 2);
    assert_eq!(simulator.pending_completions(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_deployment_runs_after_drawn_delay() {
    // uniform 0.5 draws 5.5s from the 3-8s Deployment range and succeeds
    let (store, simulator) = simulator(FixedRandom::new(0.5));
    simulator.deploy(parse_manifest(WEB).unwrap()).unwrap();

    tokio::time::sleep(Duration::from_millis(5400)).await;
    let record = store.get(&web_key()).unwrap().unwrap();
    assert_eq!(record.status, ResourceStatus::Pending);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let record = store.get(&web_key()).unwrap().unwrap();
    assert_eq!(record.status, ResourceStatus::Running);
    assert_eq!(record.replica_readiness(), (3, 3));
    assert!(record.failure_reason.is_none());
    assert_eq!(simulator.pending_completions(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_forced_failure_carries_reason() {
    let (store, simulator) = simulator(FixedRandom::new(0.99));
    simulator.deploy(parse_manifest(WEB).unwrap()).unwrap();
    simulator.drain().await;

    let record = store.get(&web_key()).unwrap().unwrap();
    assert_eq!(record.status, ResourceStatus::Failed);
    assert!(record.failure_reason.is_some());
    assert_eq!(record.replica_readiness(), (0, 3));
}

#[tokio::test(start_paused = true)]
async fn test_pod_and_service_derived_fields() {
    let (store, simulator) = simulator(FixedRandom::new(0.5));
    let manifest = r#"
kind: Pod
metadata:
  name: worker
spec:
  containers: [{ name: worker, image: busybox }]
---
kind: Service
metadata:
  name: web
spec:
  ports: [{ port: 80 }]
"#;
    simulator.deploy(parse_manifest(manifest).unwrap()).unwrap();
    simulator.drain().await;

    let pod = store
        .get(&ResourceKey::new("default", ResourceKind::Pod, "worker"))
        .unwrap()
        .unwrap();
    match pod.details {
        ResourceDetails::Pod { phase, node_assignment } => {
            assert_eq!(phase, PodPhase::Running);
            assert_eq!(node_assignment.as_deref(), Some("sim-node-2"));
        }
        other => panic!("unexpected details {:?}", other),
    }

    let service = store
        .get(&ResourceKey::new("default", ResourceKind::Service, "web"))
        .unwrap()
        .unwrap();
    match service.details {
        ResourceDetails::Service { cluster_ip, ports, .. } => {
            assert_eq!(cluster_ip.as_deref(), Some("10.96.0.10"));
            assert_eq!(ports[0].target_port, 80);
        }
        other => panic!("unexpected details {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_deleting_pending_record_cancels_completion() {
    let (store, simulator) = simulator(FixedRandom::new(0.5));
    simulator.deploy(parse_manifest(WEB).unwrap()).unwrap();

    let outcome = simulator.delete("web", "default", Some(ResourceKind::Deployment)).unwrap();
    assert!(matches!(outcome, DeleteOutcome::Deleted(_)));
    assert_eq!(simulator.pending_completions(), 0);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(store.is_empty().unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_redeploy_replaces_record_and_timer() {
    let (store, simulator) = simulator(SeededRandom::new(3));
    let first = simulator.deploy(parse_manifest(WEB).unwrap()).unwrap();
    let second = simulator.deploy(parse_manifest(WEB).unwrap()).unwrap();
    let first_uid = first.initial_resources[0].uid;
    let second_uid = second.initial_resources[0].uid;
    assert_ne!(first_uid, second_uid);
    assert_eq!(simulator.pending_completions(), 1);

    simulator.drain().await;
    let record = store.get(&web_key()).unwrap().unwrap();
    assert_eq!(record.uid, second_uid);
    assert!(record.status.is_terminal());
}

#[tokio::test(start_paused = true)]
async fn test_delete_without_kind_prefers_workloads() {
    let (store, simulator) = simulator(FixedRandom::new(0.5));
    let manifest = format!("{WEB_SERVICE}\n---\n{WEB}");
    simulator.deploy(parse_manifest(&manifest).unwrap()).unwrap();

    match simulator.delete("web", "default", None).unwrap() {
        DeleteOutcome::Deleted(resource) => assert_eq!(resource.kind, ResourceKind::Deployment),
        DeleteOutcome::NotFound => panic!("expected a deletion"),
    }
    let remaining = store.list(&ResourceFilter::default()).unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].kind, ResourceKind::Service);

    assert_eq!(
        simulator.delete("nothing", "default", None).unwrap(),
        DeleteOutcome::NotFound
    );
}

#[tokio::test(start_paused = true)]
async fn test_abort_pending_leaves_records_pending() {
    let (store, simulator) = simulator(FixedRandom::new(0.5));
    simulator.deploy(parse_manifest(WEB).unwrap()).unwrap();
    assert_eq!(simulator.abort_pending(), 1);

    tokio::time::sleep(Duration::from_secs(10)).await;
    let record = store.get(&web_key()).unwrap().unwrap();
    assert_eq!(record.status, ResourceStatus::Pending);
}

#[tokio::test(start_paused = true)]
async fn test_success_rate_over_many_deployments() {
    let (store, simulator) = simulator(SeededRandom::new(2024));
    let manifest: String = (0..200)
        .map(|i| WEB.replace("name: web\n", &format!("name: web-{i}\n")))
        .collect::<Vec<_>>()
        .join("\n---\n");
    let summary = simulator.deploy(parse_manifest(&manifest).unwrap()).unwrap();
    assert_eq!(summary.deployed_count, 200);

    simulator.drain().await;
    let records = store.list(&ResourceFilter::default()).unwrap();
    assert_eq!(records.len(), 200);

    let mut running = 0;
    for record in &records {
        match record.status {
            ResourceStatus::Running => {
                running += 1;
                assert_eq!(record.replica_readiness(), (3, 3));
            }
            ResourceStatus::Failed => assert!(record.failure_reason.is_some()),
            ResourceStatus::Pending => panic!("{} never completed", record.name),
        }
    }
    // Expected 190 of 200
    assert!(running >= 175, "only {running} of 200 running");
}
