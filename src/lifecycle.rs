//! Deployment lifecycle simulation.
//!
//! Every declaration becomes a Pending record at once. Its terminal state is
//! decided up front and applied by a per-resource task after a kind-dependent
//! delay, so `deploy` never waits on the simulated cluster.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::LifecycleConfig;
use crate::error::{EngineError, EngineResult};
use crate::random::SharedRandom;
use crate::resources::{ResourceDeclaration, ResourceKey, ResourceKind, SimulatedResource, Transition};
use crate::store::{DeleteOutcome, ResourceStore};

const WORKLOAD_FAILURES: [&str; 4] = [
    "ImagePullBackOff: back-off pulling image",
    "CrashLoopBackOff: container exited with code 1",
    "FailedScheduling: 0/3 nodes are available: insufficient cpu",
    "ErrImagePull: manifest unknown",
];
const CONFIG_FAILURES: [&str; 2] = [
    "admission webhook denied the request",
    "object exceeds maximum size of 1MiB",
];
const SERVICE_FAILURES: [&str; 1] = ["port allocation failed: provided port is already allocated"];
const GENERIC_FAILURES: [&str; 1] = ["simulated provisioning failure"];

// First host octet pair handed out for cluster IPs (x.y.0.10 onwards)
const FIRST_SERVICE_HOST: u32 = 10;

/// Result of a `deploy` call. Counts reflect call time, when every record is
/// still Pending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploySummary {
    pub initial_resources: Vec<SimulatedResource>,
    pub deployed_count: usize,
    pub failed_count: usize,
}

#[derive(Debug)]
struct PendingCompletion {
    key: ResourceKey,
    handle: JoinHandle<()>,
}

type CompletionTable = Arc<Mutex<HashMap<Uuid, PendingCompletion>>>;

fn lock_table(table: &CompletionTable) -> MutexGuard<'_, HashMap<Uuid, PendingCompletion>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drives resources from Pending to a terminal state.
pub struct DeploymentSimulator {
    store: Arc<ResourceStore>,
    clock: Arc<dyn Clock>,
    random: SharedRandom,
    config: LifecycleConfig,
    completions: CompletionTable,
    next_service_host: AtomicU32,
}

impl DeploymentSimulator {
    pub fn new(
        store: Arc<ResourceStore>,
        clock: Arc<dyn Clock>,
        random: SharedRandom,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            store,
            clock,
            random,
            config,
            completions: Arc::new(Mutex::new(HashMap::new())),
            next_service_host: AtomicU32::new(FIRST_SERVICE_HOST),
        }
    }

    /// Create Pending records and schedule their completion. Must be called
    /// from within a tokio runtime.
    pub fn deploy(&self, declarations: Vec<ResourceDeclaration>) -> EngineResult<DeploySummary> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| EngineError::InvalidRequest("deploy requires a tokio runtime".to_string()))?;

        let mut initial_resources = Vec::with_capacity(declarations.len());
        for decl in &declarations {
            let resource = SimulatedResource::pending(decl, self.clock.now());
            let (delay, transition) = self.plan(&resource.kind);

            if let Some(replaced) = self.store.put(resource.clone())? {
                debug!("{} redeployed, replacing uid {}", resource.key(), replaced.uid);
                self.cancel(replaced.uid);
            }

            let handle = runtime.spawn(completion_task(
                Arc::clone(&self.store),
                Arc::clone(&self.clock),
                Arc::clone(&self.completions),
                resource.key(),
                resource.uid,
                delay,
                transition,
            ));

            let mut table = lock_table(&self.completions);
            table.retain(|_, pending| !pending.handle.is_finished());
            table.insert(
                resource.uid,
                PendingCompletion {
                    key: resource.key(),
                    handle,
                },
            );
            drop(table);

            initial_resources.push(resource);
        }

        info!("🚀 Accepted deployment of {} resources", initial_resources.len());
        Ok(DeploySummary {
            deployed_count: initial_resources.len(),
            failed_count: 0,
            initial_resources,
        })
    }

    /// Draw the completion delay and terminal outcome for a new record.
    fn plan(&self, kind: &ResourceKind) -> (Duration, Transition) {
        let range = self.config.delay_for(kind);
        let mut rng = self.random.lock();

        let delay_ms = rng.range(range.min_ms as f64, range.max_ms as f64);
        let delay = Duration::from_millis(delay_ms.round() as u64);

        let transition = if rng.chance(self.config.success_probability) {
            let node = match kind {
                ResourceKind::Pod if !self.config.node_pool.is_empty() => {
                    let index = rng.index(self.config.node_pool.len());
                    self.config.node_pool.get(index).cloned()
                }
                _ => None,
            };
            let cluster_ip = (*kind == ResourceKind::Service).then(|| self.allocate_cluster_ip());
            Transition::Running { node, cluster_ip }
        } else {
            let reasons: &[&str] = match kind {
                ResourceKind::Deployment
                | ResourceKind::StatefulSet
                | ResourceKind::DaemonSet
                | ResourceKind::Pod
                | ResourceKind::Job
                | ResourceKind::CronJob => &WORKLOAD_FAILURES,
                ResourceKind::ConfigMap | ResourceKind::Secret => &CONFIG_FAILURES,
                ResourceKind::Service => &SERVICE_FAILURES,
                _ => &GENERIC_FAILURES,
            };
            Transition::Failed {
                reason: reasons[rng.index(reasons.len())].to_string(),
            }
        };

        (delay, transition)
    }

    fn allocate_cluster_ip(&self) -> String {
        let host = self.next_service_host.fetch_add(1, Ordering::Relaxed);
        format!(
            "{}.{}.{}",
            self.config.service_ip_prefix,
            (host >> 8) & 0xff,
            host & 0xff
        )
    }

    /// Delete a record by name. Without a kind, the match with the lowest
    /// [`ResourceKind::delete_priority`] is removed.
    pub fn delete(
        &self,
        name: &str,
        namespace: &str,
        kind: Option<ResourceKind>,
    ) -> EngineResult<DeleteOutcome> {
        let key = match kind {
            Some(kind) => ResourceKey::new(namespace, kind, name),
            None => {
                let candidates = self.store.keys_named(namespace, name)?;
                match candidates
                    .into_iter()
                    .min_by(|a, b| {
                        a.kind
                            .delete_priority()
                            .cmp(&b.kind.delete_priority())
                            .then_with(|| a.kind.cmp(&b.kind))
                    }) {
                    Some(key) => key,
                    None => return Ok(DeleteOutcome::NotFound),
                }
            }
        };

        let outcome = self.store.delete(&key)?;
        if let DeleteOutcome::Deleted(resource) = &outcome {
            self.cancel(resource.uid);
            info!("🗑️  Deleted {}", key);
        }
        Ok(outcome)
    }

    fn cancel(&self, uid: Uuid) {
        if let Some(pending) = lock_table(&self.completions).remove(&uid) {
            pending.handle.abort();
            debug!("cancelled pending completion for {}", pending.key);
        }
    }

    /// Completion tasks still waiting to fire.
    pub fn pending_completions(&self) -> usize {
        lock_table(&self.completions)
            .values()
            .filter(|pending| !pending.handle.is_finished())
            .count()
    }

    /// Wait for every in-flight completion to fire.
    pub async fn drain(&self) {
        let pending: Vec<PendingCompletion> = lock_table(&self.completions)
            .drain()
            .map(|(_, pending)| pending)
            .collect();
        for pending in pending {
            if let Err(e) = pending.handle.await {
                if !e.is_cancelled() {
                    error!("completion task for {} failed: {}", pending.key, e);
                }
            }
        }
    }

    /// Cancel every in-flight completion, leaving those records Pending.
    pub fn abort_pending(&self) -> usize {
        let mut table = lock_table(&self.completions);
        let count = table.len();
        for (_, pending) in table.drain() {
            pending.handle.abort();
        }
        count
    }
}

impl std::fmt::Debug for DeploymentSimulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentSimulator")
            .field("config", &self.config)
            .field("pending_completions", &self.pending_completions())
            .finish_non_exhaustive()
    }
}

async fn completion_task(
    store: Arc<ResourceStore>,
    clock: Arc<dyn Clock>,
    completions: CompletionTable,
    key: ResourceKey,
    uid: Uuid,
    delay: Duration,
    transition: Transition,
) {
    tokio::time::sleep(delay).await;

    match store.complete(&key, uid, &transition, clock.now()) {
        Ok(true) => match &transition {
            Transition::Running { .. } => info!("✅ {} is Running", key),
            Transition::Failed { reason } => warn!("❌ {} Failed: {}", key, reason),
        },
        Ok(false) => debug!("completion for {} skipped, record replaced or removed", key),
        Err(e) => error!("completion for {} could not be written: {}", key, e),
    }

    lock_table(&completions).remove(&uid);
}
