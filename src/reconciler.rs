//! Reconciler tying refresh, planning and execution together.
//!
//! This module is the facade the CLI drives. It refreshes recorded state
//! through the adapters, plans against the desired graph and applies the plan
//! under the run lock.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::graph::DependencyGraph;
use crate::model::{Properties, ResourceId, ResourceKind, ResourceNode, Value};
use crate::planner::{DiffEngine, Plan, PlanSummary};
use crate::provider::{CurrentState, OperationContext, ProviderRegistry};
use crate::scheduler::{retry_with_backoff, RetryPolicy, RunReport, Scheduler, SchedulerSettings};
use crate::state::{generate_holder_id, AppliedState, StateSnapshot, StateStore};

/// Engine settings.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Maximum number of nodes running at once.
    pub concurrency: usize,
    /// Read live state through the adapters before planning.
    pub refresh: bool,
    /// Cancels the run when exceeded.
    pub run_timeout: Option<Duration>,
    /// Retry policy for provider calls.
    pub retry: RetryPolicy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        let scheduler = SchedulerSettings::default();
        Self {
            concurrency: scheduler.concurrency,
            refresh: true,
            run_timeout: scheduler.run_timeout,
            retry: scheduler.retry,
        }
    }
}

impl EngineSettings {
    fn scheduler(&self) -> SchedulerSettings {
        SchedulerSettings {
            concurrency: self.concurrency,
            retry: self.retry.clone(),
            run_timeout: self.run_timeout,
        }
    }
}

/// What a refresh read found for one record.
enum Observation {
    /// The resource no longer exists.
    Gone,
    /// Keys whose live value differs from the record.
    Differs {
        properties: Properties,
        outputs: Properties,
    },
}

/// Reconciler for maintaining desired state.
pub struct Reconciler<'a> {
    registry: &'a ProviderRegistry,
    store: Arc<dyn StateStore>,
    settings: EngineSettings,
}

impl std::fmt::Debug for Reconciler<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("registry", self.registry)
            .field("store", &self.store.backend_type())
            .field("settings", &self.settings)
            .finish()
    }
}

impl<'a> Reconciler<'a> {
    /// Creates a new reconciler.
    #[must_use]
    pub fn new(registry: &'a ProviderRegistry, store: Arc<dyn StateStore>, settings: EngineSettings) -> Self {
        Self {
            registry,
            store,
            settings,
        }
    }

    /// Returns the state store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Loads recorded state, refreshed through the adapters if enabled.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn snapshot(&self) -> Result<StateSnapshot> {
        let records = self.store.list_all().await?;
        debug!("Loaded {} records from {} state", records.len(), self.store.backend_type());

        if !self.settings.refresh {
            return Ok(StateSnapshot::from_records(records));
        }
        Ok(self.refresh(records).await)
    }

    /// Reads every record's live resource and merges what it reports.
    ///
    /// The merge happens in memory only; the store is written by apply.
    pub async fn refresh(&self, records: Vec<AppliedState>) -> StateSnapshot {
        self.refresh_tracked(records).await.0
    }

    async fn refresh_tracked(&self, records: Vec<AppliedState>) -> (StateSnapshot, Vec<DriftedResource>) {
        let mut refreshed = Vec::with_capacity(records.len());
        let mut vanished = Vec::new();
        let mut drifted = Vec::new();

        for mut record in records {
            match self.observe(&record).await {
                Some(Observation::Gone) => {
                    warn!(id = %record.id, external_id = %record.external_id, "Resource vanished");
                    vanished.push(record.id.clone());
                }
                Some(Observation::Differs { properties, outputs }) => {
                    let keys: Vec<String> = properties.keys().chain(outputs.keys()).cloned().collect();
                    if !keys.is_empty() {
                        info!(id = %record.id, changed = keys.len(), "Live state differs from record");
                        drifted.push(DriftedResource {
                            id: record.id.clone(),
                            kind: record.kind.clone(),
                            keys,
                        });
                    }
                    record.properties.extend(properties);
                    record.outputs.extend(outputs);
                }
                None => {}
            }
            refreshed.push(record);
        }

        let mut snapshot = StateSnapshot::from_records(refreshed);
        snapshot.vanished.extend(vanished);
        (snapshot, drifted)
    }

    /// Reads one record's live resource. `None` if it could not be read.
    async fn observe(&self, record: &AppliedState) -> Option<Observation> {
        let provider = match self.registry.get(&record.id, &record.kind) {
            Ok(provider) => provider,
            Err(e) => {
                warn!(id = %record.id, error = %e, "Skipping refresh");
                return None;
            }
        };

        let cancel = CancellationToken::new();
        let out = retry_with_backoff(&self.settings.retry, "read", &cancel, |attempt| {
            let ctx = OperationContext {
                resource: record.id.clone(),
                attempt,
                cancel: cancel.clone(),
            };
            let provider = Arc::clone(&provider);
            async move { provider.read(&ctx, &record.external_id).await }
        })
        .await;

        match out.result {
            Ok(None) => Some(Observation::Gone),
            Ok(Some(current)) => Some(differences(record, current)),
            Err(e) if e.is_not_found() => Some(Observation::Gone),
            Err(e) => {
                warn!(id = %record.id, error = %e, "Refresh read failed, keeping recorded state");
                None
            }
        }
    }

    /// Plans the given desired resources.
    ///
    /// # Errors
    ///
    /// Returns a graph error for invalid input, or a state error if the store
    /// cannot be read.
    pub async fn plan(&self, nodes: Vec<ResourceNode>) -> Result<Plan> {
        let graph = DependencyGraph::build(nodes)?;
        self.plan_graph(&graph).await
    }

    /// Plans an already built graph.
    ///
    /// # Errors
    ///
    /// Returns an error if the graph references unknown kinds or the store
    /// cannot be read.
    pub async fn plan_graph(&self, graph: &DependencyGraph) -> Result<Plan> {
        let snapshot = self.snapshot().await?;
        let plan = DiffEngine::new(self.registry).plan(graph, &snapshot)?;
        info!("Plan: {}", plan.summary());
        Ok(plan)
    }

    /// Plans the removal of every recorded resource.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn plan_destroy(&self) -> Result<Plan> {
        self.plan_graph(&DependencyGraph::build(Vec::new())?).await
    }

    /// Applies a plan under the run lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is held elsewhere or a state write fails.
    pub async fn apply(&self, plan: Plan, cancel: &CancellationToken) -> Result<RunReport> {
        let lock = self.store.acquire_lock(&generate_holder_id()).await?;
        debug!("Acquired state lock {}", lock.lock_id);

        let result = Scheduler::new(self.registry, Arc::clone(&self.store), self.settings.scheduler())
            .execute(plan, cancel)
            .await;

        if let Err(e) = self.store.release_lock(&lock.lock_id).await {
            warn!("Failed to release state lock: {e}");
        }
        result
    }

    /// Plans and applies in one step.
    ///
    /// # Errors
    ///
    /// Returns an error if planning fails or the run hits a state error.
    pub async fn reconcile(&self, nodes: Vec<ResourceNode>, cancel: &CancellationToken) -> Result<RunReport> {
        let plan = self.plan(nodes).await?;
        if !plan.has_changes() {
            info!("No changes required - state is converged");
        }
        self.apply(plan, cancel).await
    }

    /// Checks for drift without applying changes.
    ///
    /// # Errors
    ///
    /// Returns an error if the graph is invalid or the store cannot be read.
    pub async fn check_drift(&self, nodes: Vec<ResourceNode>) -> Result<DriftReport> {
        let graph = DependencyGraph::build(nodes)?;
        let records = self.store.list_all().await?;
        let total_records = records.len();

        let (snapshot, drifted) = self.refresh_tracked(records).await;
        let vanished: Vec<ResourceId> = snapshot.vanished.iter().cloned().collect();
        let plan = DiffEngine::new(self.registry).plan(&graph, &snapshot)?;

        Ok(DriftReport {
            has_drift: !drifted.is_empty() || !vanished.is_empty() || plan.has_changes(),
            drifted,
            vanished,
            pending: plan.summary(),
            total_resources: graph.len(),
            total_records,
        })
    }
}

/// Keys whose live value differs from the recorded one, compared key by key.
///
/// Only recorded properties are compared. Keys an adapter reports but the
/// record never declared are not drift. Outputs are taken whole.
fn differences(record: &AppliedState, current: CurrentState) -> Observation {
    let properties = current
        .properties
        .into_iter()
        .filter(|(key, value)| record.properties.get(key).is_some_and(|recorded| recorded != value))
        .collect::<BTreeMap<String, Value>>();
    let outputs = current
        .outputs
        .into_iter()
        .filter(|(key, value)| record.outputs.get(key) != Some(value))
        .collect::<BTreeMap<String, Value>>();

    Observation::Differs { properties, outputs }
}

/// A resource whose live state no longer matches its record.
#[derive(Debug, Clone, Serialize)]
pub struct DriftedResource {
    /// Resource id.
    pub id: ResourceId,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Keys that differ.
    pub keys: Vec<String>,
}

/// Report of drift detection.
#[derive(Debug, Serialize)]
pub struct DriftReport {
    /// Whether drift was detected.
    pub has_drift: bool,
    /// Resources whose live state differs from the record.
    pub drifted: Vec<DriftedResource>,
    /// Recorded resources that no longer exist.
    pub vanished: Vec<ResourceId>,
    /// Changes an apply would make.
    pub pending: PlanSummary,
    /// Total number of resources in the desired graph.
    pub total_resources: usize,
    /// Number of recorded resources.
    pub total_records: usize,
}

impl DriftReport {
    /// Returns true if the state is converged (no drift).
    #[must_use]
    pub const fn is_converged(&self) -> bool {
        !self.has_drift
    }
}

impl std::fmt::Display for DriftReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.has_drift {
            return write!(f, "No drift detected - state is converged");
        }

        writeln!(f, "Drift detected:")?;
        for resource in &self.drifted {
            writeln!(f, "  ~ {}.{}: {}", resource.kind, resource.id, resource.keys.join(", "))?;
        }
        for id in &self.vanished {
            writeln!(f, "  - {id}: no longer exists")?;
        }
        write!(f, "Pending: {}", self.pending)
    }
}
