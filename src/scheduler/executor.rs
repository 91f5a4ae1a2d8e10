//! Plan execution in dependency order with bounded concurrency.
//!
//! Ready nodes run on a `JoinSet`, limited by the configured concurrency.
//! Every confirmed provider operation is written to the state store before
//! the node settles, so an interrupted run leaves exactly the confirmed
//! results behind.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{EngineError, ProviderError, ReconcileError, Result};
use crate::model::{ExternalId, Properties, ResourceId, ResourceKind};
use crate::planner::{changed_properties, resolve_strict, OutputTable, Plan, PlanAction, PlannedAction};
use crate::provider::{OperationContext, PropertyMode, Provider, ProviderOutput, ProviderRegistry, ReplaceOrder};
use crate::state::{AppliedState, StateStore};

use super::report::{NodeReport, NodeStatus, RunReport};
use super::retry::{retry_with_backoff, RetryPolicy};

/// Default number of concurrent provider calls.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Scheduler settings.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Maximum number of nodes running at once.
    pub concurrency: usize,
    /// Retry policy for provider calls.
    pub retry: RetryPolicy,
    /// Cancels the run when exceeded.
    pub run_timeout: Option<Duration>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            retry: RetryPolicy::default(),
            run_timeout: None,
        }
    }
}

/// Executes plans against provider adapters.
pub struct Scheduler<'a> {
    registry: &'a ProviderRegistry,
    store: Arc<dyn StateStore>,
    settings: SchedulerSettings,
}

impl std::fmt::Debug for Scheduler<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("registry", self.registry)
            .field("store", &self.store.backend_type())
            .field("settings", &self.settings)
            .finish()
    }
}

/// What a node confirmed.
#[derive(Debug, Default)]
struct Confirmed {
    external_id: Option<ExternalId>,
    outputs: Option<Properties>,
}

/// Why a node did not complete.
#[derive(Debug)]
enum StepError {
    /// The adapter failed; contained to the node.
    Provider(ProviderError),
    /// The planned action cannot be executed; contained to the node.
    Plan(ReconcileError),
    /// The state store failed; fatal to the run.
    Store(EngineError),
}

impl From<ProviderError> for StepError {
    fn from(err: ProviderError) -> Self {
        Self::Provider(err)
    }
}

impl From<EngineError> for StepError {
    fn from(err: EngineError) -> Self {
        Self::Store(err)
    }
}

impl std::fmt::Display for StepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Provider(e) => write!(f, "{e}"),
            Self::Plan(e) => write!(f, "{e}"),
            Self::Store(e) => write!(f, "{e}"),
        }
    }
}

/// Result of one worker task.
#[derive(Debug)]
struct NodeOutcome {
    id: ResourceId,
    attempts: u32,
    result: std::result::Result<Confirmed, StepError>,
}

/// Everything a worker needs to execute one action.
struct NodeJob {
    id: ResourceId,
    kind: ResourceKind,
    action: PlanAction,
    replace_order: ReplaceOrder,
    prior: Option<AppliedState>,
    vanished: bool,
    desired: Option<Properties>,
    dependencies: BTreeSet<ResourceId>,
    provider: Arc<dyn Provider>,
    old_provider: Arc<dyn Provider>,
    store: Arc<dyn StateStore>,
    retry: RetryPolicy,
    cancel: CancellationToken,
    attempts: u32,
}

impl NodeJob {
    fn ctx(&self, attempt: u32) -> OperationContext {
        OperationContext {
            resource: self.id.clone(),
            attempt,
            cancel: self.cancel.clone(),
        }
    }

    async fn run(mut self) -> NodeOutcome {
        let result = self.execute().await;
        NodeOutcome {
            id: self.id,
            attempts: self.attempts,
            result,
        }
    }

    async fn create(
        &mut self,
        provider: &Arc<dyn Provider>,
        desired: &Properties,
    ) -> std::result::Result<ProviderOutput, StepError> {
        let out = retry_with_backoff(&self.retry, "create", &self.cancel, |attempt| {
            let ctx = self.ctx(attempt);
            async move { provider.create(&ctx, desired).await }
        })
        .await;
        self.attempts += out.attempts;
        Ok(out.result?)
    }

    async fn update(
        &mut self,
        provider: &Arc<dyn Provider>,
        external_id: &ExternalId,
        changed: &Properties,
    ) -> std::result::Result<ProviderOutput, StepError> {
        let out = retry_with_backoff(&self.retry, "update", &self.cancel, |attempt| {
            let ctx = self.ctx(attempt);
            async move { provider.update(&ctx, external_id, changed).await }
        })
        .await;
        self.attempts += out.attempts;
        Ok(out.result?)
    }

    /// Deletes a live instance. `NotFound` counts as confirmed.
    async fn delete(
        &mut self,
        provider: &Arc<dyn Provider>,
        external_id: &ExternalId,
    ) -> std::result::Result<(), StepError> {
        let out = retry_with_backoff(&self.retry, "delete", &self.cancel, |attempt| {
            let ctx = self.ctx(attempt);
            async move { provider.delete(&ctx, external_id).await }
        })
        .await;
        self.attempts += out.attempts;

        match out.result {
            Err(e) if e.is_not_found() => {
                debug!(id = %self.id, external_id = %external_id, "Instance already gone");
                Ok(())
            }
            other => Ok(other?),
        }
    }

    fn missing(&self, what: &str) -> StepError {
        StepError::Plan(ReconcileError::InvalidPlan {
            id: self.id.clone(),
            reason: format!("{} action has no {what}", self.action),
        })
    }

    fn new_record(&self, out: ProviderOutput, desired: Properties, revision: u64) -> AppliedState {
        AppliedState::new(
            self.id.clone(),
            self.kind.clone(),
            out.external_id,
            desired,
            out.outputs,
            revision,
        )
        .with_dependencies(self.dependencies.clone())
    }

    /// Deletes instances left behind by an interrupted replacement.
    async fn clean_deposed(
        &mut self,
        mut record: AppliedState,
    ) -> std::result::Result<AppliedState, StepError> {
        let provider = Arc::clone(&self.old_provider);
        for external_id in record.deposed.clone() {
            self.delete(&provider, &external_id).await?;
            record = record.next_revision();
            record.deposed.retain(|e| e != &external_id);
            self.store.put(&record).await?;
            info!(id = %self.id, external_id = %external_id, "Deleted deposed instance");
        }
        Ok(record)
    }

    async fn execute(&mut self) -> std::result::Result<Confirmed, StepError> {
        let mut current = self.prior.clone();
        if let Some(record) = current.take() {
            current = Some(if record.has_deposed() {
                self.clean_deposed(record).await?
            } else {
                record
            });
        }

        let provider = Arc::clone(&self.provider);
        let old_provider = Arc::clone(&self.old_provider);

        match self.action {
            PlanAction::NoOp => {
                let record = current.ok_or_else(|| self.missing("prior state"))?;
                Ok(Confirmed {
                    external_id: Some(record.external_id),
                    outputs: Some(record.outputs),
                })
            }
            PlanAction::Create => {
                let desired = self.desired.clone().ok_or_else(|| self.missing("desired properties"))?;
                let out = self.create(&provider, &desired).await?;
                let revision = current.as_ref().map_or(1, |r| r.revision + 1);
                let record = self.new_record(out, desired, revision);
                self.store.put(&record).await?;
                Ok(confirmed(record))
            }
            PlanAction::Update => {
                let prior = current.ok_or_else(|| self.missing("prior state"))?;
                let desired = self.desired.clone().ok_or_else(|| self.missing("desired properties"))?;
                let changed = changed_properties(&desired, &prior.properties);
                let out = self.update(&provider, &prior.external_id, &changed).await?;

                let mut record = prior.next_revision();
                record.external_id = out.external_id;
                record.properties = desired;
                record.outputs = out.outputs;
                record.dependencies.clone_from(&self.dependencies);
                self.store.put(&record).await?;
                Ok(confirmed(record))
            }
            PlanAction::Replace => {
                let prior = current.ok_or_else(|| self.missing("prior state"))?;
                let desired = self.desired.clone().ok_or_else(|| self.missing("desired properties"))?;

                match self.replace_order {
                    ReplaceOrder::CreateBeforeDelete => {
                        let out = self.create(&provider, &desired).await?;
                        let mut record = self.new_record(out, desired, prior.revision + 1);
                        record.created_at = Utc::now();
                        record.deposed.push(prior.external_id.clone());
                        self.store.put(&record).await?;
                        debug!(id = %self.id, old = %prior.external_id, "Successor confirmed, deleting old instance");

                        self.delete(&old_provider, &prior.external_id).await?;
                        let mut cleared = record.next_revision();
                        cleared.deposed.retain(|e| e != &prior.external_id);
                        self.store.put(&cleared).await?;
                        Ok(confirmed(cleared))
                    }
                    ReplaceOrder::DeleteBeforeCreate => {
                        self.delete(&old_provider, &prior.external_id).await?;
                        self.store.remove(&self.id).await?;
                        debug!(id = %self.id, old = %prior.external_id, "Old instance deleted, creating successor");

                        let out = self.create(&provider, &desired).await?;
                        let record = self.new_record(out, desired, prior.revision + 1);
                        self.store.put(&record).await?;
                        Ok(confirmed(record))
                    }
                }
            }
            PlanAction::Delete => {
                let prior = current.ok_or_else(|| self.missing("prior state"))?;
                if !self.vanished {
                    self.delete(&old_provider, &prior.external_id).await?;
                }
                self.store.remove(&self.id).await?;
                Ok(Confirmed::default())
            }
        }
    }
}

fn confirmed(record: AppliedState) -> Confirmed {
    Confirmed {
        external_id: Some(record.external_id),
        outputs: Some(record.outputs),
    }
}

/// Mutable bookkeeping of one run.
struct RunState {
    status: BTreeMap<ResourceId, NodeStatus>,
    waiting_on: BTreeMap<ResourceId, usize>,
    downstream: BTreeMap<ResourceId, BTreeSet<ResourceId>>,
    ready: VecDeque<ResourceId>,
    outputs: OutputTable,
    reports: BTreeMap<ResourceId, NodeReport>,
}

impl RunState {
    fn new(plan: &Plan) -> Self {
        let status = plan.actions.keys().map(|id| (id.clone(), NodeStatus::Pending)).collect();
        let waiting_on: BTreeMap<ResourceId, usize> = plan
            .actions
            .keys()
            .map(|id| {
                let count = plan
                    .upstream(id)
                    .map_or(0, |up| up.iter().filter(|u| plan.actions.contains_key(*u)).count());
                (id.clone(), count)
            })
            .collect();

        let mut state = Self {
            status,
            waiting_on,
            downstream: plan.downstream(),
            ready: VecDeque::new(),
            outputs: OutputTable::new(),
            reports: plan
                .actions
                .values()
                .map(|a| {
                    (
                        a.id.clone(),
                        NodeReport {
                            id: a.id.clone(),
                            kind: a.kind.clone(),
                            action: a.action,
                            status: NodeStatus::Pending,
                            attempts: 0,
                            external_id: a.external_id().cloned(),
                            error: None,
                        },
                    )
                })
                .collect(),
        };

        for id in &plan.order {
            if state.waiting_on.get(id) == Some(&0) {
                state.mark_ready(id);
            }
        }
        state
    }

    fn set(&mut self, id: &ResourceId, status: NodeStatus) {
        self.status.insert(id.clone(), status);
        if let Some(report) = self.reports.get_mut(id) {
            report.status = status;
        }
    }

    fn mark_ready(&mut self, id: &ResourceId) {
        self.set(id, NodeStatus::Ready);
        self.ready.push_back(id.clone());
    }

    /// Settles a node successfully and releases its dependents.
    fn settle(&mut self, id: &ResourceId, status: NodeStatus, outputs: Option<Properties>) {
        self.set(id, status);
        self.outputs.insert(id.clone(), outputs);

        let children: Vec<ResourceId> = self
            .downstream
            .get(id)
            .map(|c| c.iter().cloned().collect())
            .unwrap_or_default();
        for child in children {
            if let Some(count) = self.waiting_on.get_mut(&child) {
                *count = count.saturating_sub(1);
                if *count == 0 && self.status.get(&child) == Some(&NodeStatus::Pending) {
                    self.mark_ready(&child);
                }
            }
        }
    }

    /// Fails a node and blocks everything that transitively depends on it.
    fn fail(&mut self, id: &ResourceId, message: String) {
        self.set(id, NodeStatus::Failed);
        if let Some(report) = self.reports.get_mut(id) {
            report.error = Some(message);
        }

        let mut queue: VecDeque<ResourceId> = VecDeque::from([id.clone()]);
        let mut seen = BTreeSet::new();
        while let Some(current) = queue.pop_front() {
            let Some(children) = self.downstream.get(&current) else {
                continue;
            };
            for child in children.clone() {
                if !seen.insert(child.clone()) {
                    continue;
                }
                let terminal = self.status.get(&child).is_some_and(|s| s.is_terminal());
                if !terminal {
                    self.set(&child, NodeStatus::Blocked);
                    if let Some(report) = self.reports.get_mut(&child) {
                        report.error = Some(format!("blocked by failed upstream '{id}'"));
                    }
                    warn!(id = %child, upstream = %id, "Node blocked");
                }
                queue.push_back(child);
            }
        }
        self.ready.retain(|r| self.status.get(r) == Some(&NodeStatus::Ready));
    }

    fn finish_unstarted(&mut self, cancelled: bool) {
        let open: Vec<(ResourceId, NodeStatus)> = self
            .status
            .iter()
            .filter(|(_, s)| !s.is_terminal())
            .map(|(id, s)| (id.clone(), *s))
            .collect();

        for (id, status) in open {
            let (status, message) = match status {
                NodeStatus::Running => (NodeStatus::Failed, String::from("worker task aborted")),
                _ if cancelled => (NodeStatus::Cancelled, String::from("run cancelled before start")),
                _ => (NodeStatus::Blocked, String::from("upstream never settled")),
            };
            self.set(&id, status);
            if let Some(report) = self.reports.get_mut(&id) {
                report.error = Some(message);
            }
        }
        self.ready.clear();
    }
}

impl<'a> Scheduler<'a> {
    /// Creates a scheduler.
    #[must_use]
    pub fn new(registry: &'a ProviderRegistry, store: Arc<dyn StateStore>, settings: SchedulerSettings) -> Self {
        Self {
            registry,
            store,
            settings,
        }
    }

    /// Returns the settings.
    #[must_use]
    pub const fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    /// Executes a plan.
    ///
    /// Node failures are contained and reported. Cancelling `cancel`, or
    /// exceeding the run timeout, stops new nodes from starting and waits for
    /// running ones.
    ///
    /// # Errors
    ///
    /// Returns the state store error if any state write fails. Nodes already
    /// in flight are awaited first.
    pub async fn execute(&self, mut plan: Plan, cancel: &CancellationToken) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let concurrency = self.settings.concurrency.max(1);
        let deadline = self.settings.run_timeout.map(|t| Instant::now() + t);
        let run_cancel = cancel.child_token();

        info!(
            run_id = %run_id,
            actions = plan.len(),
            concurrency = concurrency,
            "Executing plan"
        );

        let mut run = RunState::new(&plan);
        let mut workers: JoinSet<NodeOutcome> = JoinSet::new();
        let mut cancelled = run_cancel.is_cancelled();
        let mut fatal: Option<EngineError> = None;

        loop {
            while !cancelled && fatal.is_none() && workers.len() < concurrency {
                let Some(id) = run.ready.pop_front() else {
                    break;
                };
                let Some(mut action) = plan.actions.remove(&id) else {
                    continue;
                };

                if let Err(message) = self.promote_stale(&mut run, &mut action) {
                    error!(id = %id, error = %message, "Node failed before start");
                    run.fail(&id, message);
                    continue;
                }

                if action.is_settled() {
                    Self::settle_noop(&mut run, &action);
                    continue;
                }

                match self.prepare(action, &run.outputs, &run_cancel) {
                    Ok(job) => {
                        info!(id = %job.id, action = %job.action, "Starting node");
                        run.set(&id, NodeStatus::Running);
                        workers.spawn(job.run());
                    }
                    Err(message) => {
                        error!(id = %id, error = %message, "Node failed before start");
                        run.fail(&id, message);
                    }
                }
            }

            if workers.is_empty() {
                break;
            }

            tokio::select! {
                joined = workers.join_next() => {
                    match joined {
                        Some(Ok(outcome)) => {
                            if let Some(err) = Self::handle_outcome(&mut run, outcome) {
                                error!(error = %err, "State store failure, stopping the run");
                                fatal.get_or_insert(err);
                            }
                        }
                        Some(Err(join_err)) => {
                            error!(error = %join_err, "Worker task failed");
                            fatal.get_or_insert(EngineError::internal(format!("worker task failed: {join_err}")));
                        }
                        None => {}
                    }
                }
                () = run_cancel.cancelled(), if !cancelled => {
                    warn!(run_id = %run_id, "Run cancelled, waiting for running nodes");
                    cancelled = true;
                }
                () = wait_until(deadline), if !cancelled => {
                    warn!(run_id = %run_id, "Run timeout exceeded, cancelling");
                    cancelled = true;
                    run_cancel.cancel();
                }
            }
        }

        run.finish_unstarted(cancelled || fatal.is_some());

        if let Some(err) = fatal {
            return Err(err);
        }

        let nodes: Vec<NodeReport> = plan
            .order
            .iter()
            .filter_map(|id| run.reports.remove(id))
            .collect();
        let status = RunReport::status_from(&nodes, cancelled);
        let report = RunReport {
            run_id,
            graph_hash: plan.graph_hash,
            started_at,
            finished_at: Utc::now(),
            status,
            nodes,
        };

        info!(run_id = %run_id, status = %report.status, "Run finished");
        Ok(report)
    }

    /// Turns a no-op into an update or replacement when outputs confirmed
    /// earlier in this run change its resolved properties.
    fn promote_stale(&self, run: &mut RunState, action: &mut PlannedAction) -> std::result::Result<(), String> {
        if action.action != PlanAction::NoOp {
            return Ok(());
        }
        let (Some(node), Some(prior)) = (&action.desired, &action.prior) else {
            return Ok(());
        };
        let Ok(resolved) = resolve_strict(&action.id, &node.properties, &run.outputs) else {
            return Ok(());
        };
        if resolved == prior.properties {
            return Ok(());
        }

        let caps = self
            .registry
            .capabilities(&action.id, &action.kind)
            .map_err(|e| e.to_string())?;
        let changed = changed_properties(&resolved, &prior.properties);
        let replace = changed
            .keys()
            .any(|key| caps.mode_of(key) == PropertyMode::ForceReplacement);

        if replace {
            action.action = PlanAction::Replace;
            action.replace_order = Some(caps.replace_order);
        } else {
            action.action = PlanAction::Update;
        }
        info!(
            id = %action.id,
            action = %action.action,
            changed = changed.len(),
            "Upstream outputs changed during apply"
        );
        if let Some(report) = run.reports.get_mut(&action.id) {
            report.action = action.action;
        }
        Ok(())
    }

    /// Settles a no-op without running it.
    fn settle_noop(run: &mut RunState, action: &PlannedAction) {
        let outputs = action.prior.as_ref().map(|p| p.outputs.clone());
        debug!(id = %action.id, "Node unchanged");
        run.settle(&action.id, NodeStatus::Unchanged, outputs);
    }

    /// Resolves references against confirmed outputs and builds the worker job.
    fn prepare(
        &self,
        action: PlannedAction,
        outputs: &OutputTable,
        cancel: &CancellationToken,
    ) -> std::result::Result<NodeJob, String> {
        let desired = match &action.desired {
            Some(node) => Some(resolve_strict(&action.id, &node.properties, outputs).map_err(|e| e.to_string())?),
            None => None,
        };
        let dependencies = action
            .desired
            .as_ref()
            .map(crate::model::ResourceNode::upstream_ids)
            .unwrap_or_default();

        let provider = self
            .registry
            .get(&action.id, &action.kind)
            .map_err(|e| e.to_string())?;
        let old_provider = match &action.prior {
            Some(prior) if prior.kind != action.kind => self
                .registry
                .get(&action.id, &prior.kind)
                .map_err(|e| e.to_string())?,
            _ => Arc::clone(&provider),
        };

        Ok(NodeJob {
            id: action.id,
            kind: action.kind,
            action: action.action,
            replace_order: action.replace_order.unwrap_or_default(),
            prior: action.prior,
            vanished: action.vanished,
            desired,
            dependencies,
            provider,
            old_provider,
            store: Arc::clone(&self.store),
            retry: self.settings.retry.clone(),
            cancel: cancel.clone(),
            attempts: 0,
        })
    }

    /// Records a worker outcome. Returns the error if the store failed.
    fn handle_outcome(run: &mut RunState, outcome: NodeOutcome) -> Option<EngineError> {
        let NodeOutcome { id, attempts, result } = outcome;
        if let Some(report) = run.reports.get_mut(&id) {
            report.attempts = attempts;
        }

        match result {
            Ok(confirmed) => {
                info!(id = %id, attempts = attempts, "Node succeeded");
                if let Some(report) = run.reports.get_mut(&id) {
                    report.external_id.clone_from(&confirmed.external_id);
                }
                run.settle(&id, NodeStatus::Succeeded, confirmed.outputs);
                None
            }
            Err(StepError::Store(err)) => {
                run.fail(&id, err.to_string());
                Some(err)
            }
            Err(err) => {
                error!(id = %id, attempts = attempts, error = %err, "Node failed");
                run.fail(&id, err.to_string());
                None
            }
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StateError;
    use crate::graph::DependencyGraph;
    use crate::model::{ResourceNode, Value};
    use crate::planner::DiffEngine;
    use crate::provider::Capabilities;
    use crate::scheduler::RunStatus;
    use crate::state::{MemoryStateStore, MockStateStore, StateSnapshot};
    use crate::testing::{registry_with, Op, Phase, TestProvider};

    fn settings(concurrency: usize) -> SchedulerSettings {
        SchedulerSettings {
            concurrency,
            retry: RetryPolicy {
                max_attempts: 3,
                initial_delay_ms: 1,
                max_delay_ms: 2,
                multiplier: 2.0,
                jitter: false,
            },
            run_timeout: None,
        }
    }

    fn bucket_nodes(versioning: bool) -> Vec<ResourceNode> {
        vec![
            ResourceNode::new("b1", "bucket").with_property("versioning", versioning),
            ResourceNode::new("p1", "policy").with_property("bucket_arn", Value::reference("b1", "arn")),
        ]
    }

    fn id(raw: &str) -> ResourceId {
        ResourceId::new(raw)
    }

    async fn plan_for(registry: &ProviderRegistry, store: &dyn StateStore, nodes: Vec<ResourceNode>) -> Plan {
        let graph = DependencyGraph::build(nodes).expect("valid graph");
        let snapshot = StateSnapshot::from_records(store.list_all().await.expect("list"));
        DiffEngine::new(registry).plan(&graph, &snapshot).expect("plan")
    }

    async fn run(
        registry: &ProviderRegistry,
        store: &Arc<MemoryStateStore>,
        settings: SchedulerSettings,
        nodes: Vec<ResourceNode>,
    ) -> RunReport {
        let plan = plan_for(registry, store.as_ref(), nodes).await;
        Scheduler::new(registry, store.clone(), settings)
            .execute(plan, &CancellationToken::new())
            .await
            .expect("run completes")
    }

    fn bucket_setup(caps: Capabilities) -> (Arc<TestProvider>, Arc<TestProvider>, ProviderRegistry) {
        let buckets = Arc::new(TestProvider::with_capabilities(caps));
        let policies = Arc::new(TestProvider::new());
        let registry = registry_with([("bucket", Arc::clone(&buckets)), ("policy", Arc::clone(&policies))]);
        (buckets, policies, registry)
    }

    #[tokio::test]
    async fn test_creates_then_converges() {
        let (buckets, policies, registry) = bucket_setup(Capabilities::updatable());
        let store = Arc::new(MemoryStateStore::new());

        let report = run(&registry, &store, settings(4), bucket_nodes(true)).await;
        assert!(report.is_success());
        assert_eq!(report.count(NodeStatus::Succeeded), 2);

        let policy = store.get(&id("p1")).await.expect("get").expect("record");
        assert_eq!(policy.properties.get("bucket_arn"), Some(&Value::from("arn:b1:1")));
        assert_eq!(policy.revision, 1);
        assert!(policy.dependencies.contains(&id("b1")));

        let second = run(&registry, &store, settings(4), bucket_nodes(true)).await;
        assert!(second.is_success());
        assert_eq!(second.count(NodeStatus::Unchanged), 2);
        assert_eq!(buckets.mutating_calls().len(), 1);
        assert_eq!(policies.mutating_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_replacement_creates_before_deleting_and_updates_dependents() {
        let (buckets, policies, registry) =
            bucket_setup(Capabilities::updatable().force_replacement("versioning"));
        let store = Arc::new(MemoryStateStore::new());
        run(&registry, &store, settings(4), bucket_nodes(true)).await;

        let report = run(&registry, &store, settings(4), bucket_nodes(false)).await;
        assert!(report.is_success());
        assert_eq!(report.node(&id("b1")).map(|n| n.action), Some(PlanAction::Replace));
        assert_eq!(report.node(&id("p1")).map(|n| n.action), Some(PlanAction::Update));

        assert_eq!(
            buckets.mutating_calls(),
            vec![
                (String::from("b1"), Op::Create),
                (String::from("b1"), Op::Create),
                (String::from("b1"), Op::Delete),
            ]
        );
        let deleted = buckets.calls_of(Op::Delete);
        assert_eq!(deleted[0].external_id, Some(ExternalId::new("b1-1")));

        let bucket = store.get(&id("b1")).await.expect("get").expect("record");
        assert_eq!(bucket.external_id, ExternalId::new("b1-2"));
        assert_eq!(bucket.revision, 3);
        assert!(!bucket.has_deposed());

        let updates = policies.calls_of(Op::Update);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].properties.get("bucket_arn"), Some(&Value::from("arn:b1:2")));
        let policy = store.get(&id("p1")).await.expect("get").expect("record");
        assert_eq!(policy.revision, 2);
    }

    #[tokio::test]
    async fn test_delete_before_create_replacement_order() {
        let (buckets, _, registry) = bucket_setup(
            Capabilities::updatable()
                .force_replacement("versioning")
                .delete_before_replace(),
        );
        let store = Arc::new(MemoryStateStore::new());
        run(&registry, &store, settings(4), bucket_nodes(true)).await;
        let report = run(&registry, &store, settings(4), bucket_nodes(false)).await;

        assert!(report.is_success());
        assert_eq!(
            buckets.mutating_calls(),
            vec![
                (String::from("b1"), Op::Create),
                (String::from("b1"), Op::Delete),
                (String::from("b1"), Op::Create),
            ]
        );
        let bucket = store.get(&id("b1")).await.expect("get").expect("record");
        assert_eq!(bucket.revision, 2);
        assert_eq!(bucket.external_id, ExternalId::new("b1-2"));
    }

    #[tokio::test]
    async fn test_deletes_dependents_first() {
        let shared = Arc::new(TestProvider::new());
        let registry = registry_with([("bucket", Arc::clone(&shared)), ("policy", Arc::clone(&shared))]);
        let store = Arc::new(MemoryStateStore::new());
        run(&registry, &store, settings(4), bucket_nodes(true)).await;

        let report = run(&registry, &store, settings(4), Vec::new()).await;
        assert!(report.is_success());
        assert_eq!(
            shared.mutating_calls()[2..],
            [(String::from("p1"), Op::Delete), (String::from("b1"), Op::Delete)]
        );
        assert!(store.list_all().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn test_failure_blocks_only_dependents() {
        let provider = Arc::new(TestProvider::new());
        let registry = registry_with([("node", Arc::clone(&provider))]);
        let store = Arc::new(MemoryStateStore::new());
        provider.fail_with("a", [ProviderError::validation("bad input")]);

        let nodes = vec![
            ResourceNode::new("a", "node"),
            ResourceNode::new("b", "node").with_dependency("a"),
            ResourceNode::new("c", "node"),
        ];
        let report = run(&registry, &store, settings(4), nodes).await;

        assert_eq!(report.status, RunStatus::PartialFailure);
        let a = report.node(&id("a")).expect("a");
        assert_eq!(a.status, NodeStatus::Failed);
        assert_eq!(a.attempts, 1);
        assert_eq!(report.node(&id("b")).map(|n| n.status), Some(NodeStatus::Blocked));
        assert_eq!(report.node(&id("c")).map(|n| n.status), Some(NodeStatus::Succeeded));

        assert!(store.get(&id("a")).await.expect("get").is_none());
        assert!(store.get(&id("b")).await.expect("get").is_none());
        assert!(store.get(&id("c")).await.expect("get").is_some());
        assert!(provider.calls().iter().all(|c| c.id != id("b")));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let provider = Arc::new(TestProvider::new());
        let registry = registry_with([("node", Arc::clone(&provider))]);
        let store = Arc::new(MemoryStateStore::new());
        provider.fail_with(
            "a",
            [
                ProviderError::Timeout {
                    message: String::from("slow"),
                },
                ProviderError::unavailable("busy"),
            ],
        );

        let report = run(&registry, &store, settings(2), vec![ResourceNode::new("a", "node")]).await;
        let a = report.node(&id("a")).expect("a");
        assert_eq!(a.status, NodeStatus::Succeeded);
        assert_eq!(a.attempts, 3);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let provider = Arc::new(TestProvider::new());
        let registry = registry_with([("node", Arc::clone(&provider))]);
        let store = Arc::new(MemoryStateStore::new());
        provider.fail_with("a", (0..5).map(|_| ProviderError::unavailable("down")));

        let report = run(&registry, &store, settings(2), vec![ResourceNode::new("a", "node")]).await;
        let a = report.node(&id("a")).expect("a");
        assert_eq!(a.status, NodeStatus::Failed);
        assert_eq!(a.attempts, 3);
        assert_eq!(provider.calls_of(Op::Create).len(), 3);
    }

    fn layered_nodes() -> Vec<ResourceNode> {
        (0..12_i64)
            .map(|i| {
                let mut node = ResourceNode::new(format!("n{i}"), "node").with_property("index", i);
                if i > 0 {
                    node = node.with_property("parent_arn", Value::reference(format!("n{}", (i - 1) / 2), "arn"));
                }
                if i % 4 == 3 {
                    node = node.with_dependency(format!("n{}", i - 2));
                }
                node
            })
            .collect()
    }

    #[tokio::test]
    async fn test_dependency_order_holds_under_random_timing() {
        for seed in 0..5 {
            let provider = Arc::new(TestProvider::new().with_delays(seed, 5));
            let registry = registry_with([("node", Arc::clone(&provider))]);
            let store = Arc::new(MemoryStateStore::new());
            let nodes = layered_nodes();

            let report = run(&registry, &store, settings(4), nodes.clone()).await;
            assert!(report.is_success(), "seed {seed}: {report}");

            let events = provider.events();
            let position = |node: &ResourceId, phase: Phase| {
                events
                    .iter()
                    .position(|e| &e.id == node && e.phase == phase)
                    .expect("event recorded")
            };
            for node in &nodes {
                for upstream in node.upstream_ids() {
                    assert!(
                        position(&upstream, Phase::Finish) < position(&node.id, Phase::Start),
                        "seed {seed}: {upstream} must finish before {} starts",
                        node.id
                    );
                }
            }

            let mut running = 0_i32;
            let mut peak = 0_i32;
            for event in &events {
                running += if event.phase == Phase::Start { 1 } else { -1 };
                peak = peak.max(running);
            }
            assert!(peak <= 4, "seed {seed}: {peak} calls in flight");

            for i in 1..12_i64 {
                let record = store.get(&id(&format!("n{i}"))).await.expect("get").expect("record");
                let parent = store
                    .get(&id(&format!("n{}", (i - 1) / 2)))
                    .await
                    .expect("get")
                    .expect("record");
                assert_eq!(record.properties.get("parent_arn"), parent.outputs.get("arn"));
            }
        }
    }

    #[tokio::test]
    async fn test_interrupted_run_keeps_exactly_confirmed_results() {
        let provider = Arc::new(TestProvider::new().hang_after_creates(3));
        let registry = registry_with([("node", Arc::clone(&provider))]);
        let store = Arc::new(MemoryStateStore::new());
        let nodes: Vec<ResourceNode> = (0..6).map(|i| ResourceNode::new(format!("s{i}"), "node")).collect();

        let plan = plan_for(&registry, store.as_ref(), nodes).await;
        let scheduler = Scheduler::new(&registry, store.clone(), settings(1));
        let cancel = CancellationToken::new();
        let outcome = tokio::time::timeout(Duration::from_millis(200), scheduler.execute(plan, &cancel)).await;
        assert!(outcome.is_err(), "run should still be hanging");

        let records = store.list_all().await.expect("list");
        assert_eq!(records.len(), 3);
        assert_eq!(provider.live_count(), 3);
        for record in &records {
            assert!(provider.is_live(record.external_id.as_str()));
        }
    }

    #[tokio::test]
    async fn test_run_timeout_cancels_remaining_nodes() {
        let provider = Arc::new(TestProvider::new().hang_after_creates(2));
        let registry = registry_with([("node", Arc::clone(&provider))]);
        let store = Arc::new(MemoryStateStore::new());
        let nodes: Vec<ResourceNode> = (0..4).map(|i| ResourceNode::new(format!("s{i}"), "node")).collect();

        let settings = SchedulerSettings {
            run_timeout: Some(Duration::from_millis(100)),
            ..settings(1)
        };
        let report = run(&registry, &store, settings, nodes).await;

        assert_eq!(report.status, RunStatus::Cancelled);
        assert_eq!(report.count(NodeStatus::Succeeded), 2);
        assert_eq!(report.count(NodeStatus::Failed), 1);
        assert_eq!(report.count(NodeStatus::Cancelled), 1);
        assert_eq!(store.list_all().await.expect("list").len(), 2);
    }

    #[tokio::test]
    async fn test_cancel_before_start_touches_nothing() {
        let provider = Arc::new(TestProvider::new());
        let registry = registry_with([("node", Arc::clone(&provider))]);
        let store = Arc::new(MemoryStateStore::new());
        let nodes = vec![ResourceNode::new("a", "node"), ResourceNode::new("b", "node").with_dependency("a")];

        let plan = plan_for(&registry, store.as_ref(), nodes).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = Scheduler::new(&registry, store.clone(), settings(2))
            .execute(plan, &cancel)
            .await
            .expect("run");

        assert_eq!(report.status, RunStatus::Cancelled);
        assert_eq!(report.count(NodeStatus::Cancelled), 2);
        assert!(provider.calls().is_empty());
        assert!(store.list_all().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn test_state_write_failure_stops_the_run() {
        let provider = Arc::new(TestProvider::new());
        let registry = registry_with([("node", Arc::clone(&provider))]);
        let mut store = MockStateStore::new();
        store
            .expect_put()
            .returning(|_| Err(StateError::io("disk full").into()));

        let graph = DependencyGraph::build([
            ResourceNode::new("a", "node"),
            ResourceNode::new("b", "node").with_dependency("a"),
            ResourceNode::new("c", "node"),
        ])
        .expect("graph");
        let plan = DiffEngine::new(&registry)
            .plan(&graph, &StateSnapshot::from_records(Vec::new()))
            .expect("plan");

        let result = Scheduler::new(&registry, Arc::new(store), settings(1))
            .execute(plan, &CancellationToken::new())
            .await;

        let err = result.expect_err("state failure is fatal");
        assert!(err.is_state_error());
        assert_eq!(provider.calls_of(Op::Create).len(), 1);
    }

    #[tokio::test]
    async fn test_deposed_instances_are_cleaned_up() {
        let provider = Arc::new(TestProvider::new());
        let registry = registry_with([("node", Arc::clone(&provider))]);

        let properties = Properties::from([(String::from("size"), Value::from(1_i64))]);
        let mut record = AppliedState::new(
            id("b1"),
            ResourceKind::new("node"),
            ExternalId::new("b1-1"),
            properties.clone(),
            Properties::new(),
            1,
        );
        record.deposed.push(ExternalId::new("b1-0"));
        let store = Arc::new(MemoryStateStore::with_records([record]));

        let report = run(
            &registry,
            &store,
            settings(1),
            vec![ResourceNode::new("b1", "node").with_property("size", 1_i64)],
        )
        .await;

        let node = report.node(&id("b1")).expect("b1");
        assert_eq!(node.action, PlanAction::NoOp);
        assert_eq!(node.status, NodeStatus::Succeeded);

        let deletes = provider.calls_of(Op::Delete);
        assert_eq!(deletes.len(), 1);
        assert_eq!(deletes[0].external_id, Some(ExternalId::new("b1-0")));

        let stored = store.get(&id("b1")).await.expect("get").expect("record");
        assert!(!stored.has_deposed());
        assert_eq!(stored.revision, 2);
        assert_eq!(stored.properties, properties);
    }

    #[tokio::test]
    async fn test_failed_deposed_delete_keeps_record_for_retry() {
        let provider = Arc::new(TestProvider::new());
        let registry = registry_with([("node", Arc::clone(&provider))]);

        let mut record = AppliedState::new(
            id("b1"),
            ResourceKind::new("node"),
            ExternalId::new("b1-1"),
            Properties::new(),
            Properties::new(),
            1,
        );
        record.deposed.push(ExternalId::new("b1-0"));
        let store = Arc::new(MemoryStateStore::with_records([record]));
        provider.fail_with("b1", [ProviderError::validation("bad")]);

        let first = run(&registry, &store, settings(1), Vec::new()).await;
        assert_eq!(first.node(&id("b1")).map(|n| n.status), Some(NodeStatus::Failed));
        let kept = store.get(&id("b1")).await.expect("get").expect("record kept");
        assert_eq!(kept.external_id, ExternalId::new("b1-1"));
        assert_eq!(kept.deposed, vec![ExternalId::new("b1-0")]);

        let second = run(&registry, &store, settings(1), Vec::new()).await;
        assert!(second.is_success());
        let deleted: Vec<Option<ExternalId>> = provider
            .calls_of(Op::Delete)
            .into_iter()
            .map(|call| call.external_id)
            .collect();
        assert_eq!(
            deleted,
            vec![
                Some(ExternalId::new("b1-0")),
                Some(ExternalId::new("b1-0")),
                Some(ExternalId::new("b1-1")),
            ]
        );
        assert!(store.list_all().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn test_noop_dependent_follows_upstream_update() {
        let registry = ProviderRegistry::with_builtin();
        let store = Arc::new(MemoryStateStore::new());
        let temp = tempfile::TempDir::new().expect("temp dir");
        let source = temp.path().join("f1.txt").to_string_lossy().to_string();
        let digest = temp.path().join("f2.txt").to_string_lossy().to_string();

        let desired = |content: &str| {
            vec![
                ResourceNode::new("f1", "local_file")
                    .with_property("path", source.as_str())
                    .with_property("content", content),
                ResourceNode::new("f2", "local_file")
                    .with_property("path", digest.as_str())
                    .with_property("content", Value::reference("f1", "sha256")),
            ]
        };

        assert!(run(&registry, &store, settings(4), desired("v1")).await.is_success());

        let report = run(&registry, &store, settings(4), desired("v2")).await;
        assert!(report.is_success());
        let f2 = report.node(&id("f2")).expect("f2");
        assert_eq!(f2.action, PlanAction::Update);
        assert_eq!(f2.status, NodeStatus::Succeeded);

        let f1 = store.get(&id("f1")).await.expect("get").expect("record");
        let written = std::fs::read_to_string(&digest).expect("read f2");
        assert_eq!(f1.outputs.get("sha256"), Some(&Value::string(written)));

        let plan = plan_for(&registry, store.as_ref(), desired("v2")).await;
        assert!(!plan.has_changes());
    }
}
