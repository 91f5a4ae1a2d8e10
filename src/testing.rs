//! Scriptable in-memory provider for engine tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{ProviderError, ProviderResult};
use crate::model::{ExternalId, Properties, ResourceId, Value};
use crate::provider::{
    Capabilities, CurrentState, OperationContext, Provider, ProviderOutput, ProviderRegistry,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Op {
    Read,
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Start,
    Finish,
}

/// One recorded adapter call.
#[derive(Debug, Clone)]
pub(crate) struct Call {
    pub id: ResourceId,
    pub op: Op,
    pub external_id: Option<ExternalId>,
    pub properties: Properties,
}

/// Start or end of a mutating call, used for ordering checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Event {
    pub id: ResourceId,
    pub op: Op,
    pub phase: Phase,
}

#[derive(Default)]
struct Recorded {
    calls: Vec<Call>,
    events: Vec<Event>,
    failures: HashMap<ResourceId, VecDeque<ProviderError>>,
    live: HashMap<ExternalId, (Properties, Properties)>,
    gone: HashSet<ExternalId>,
    creates: usize,
    counter: u64,
}

pub(crate) struct TestProvider {
    caps: Capabilities,
    recorded: Mutex<Recorded>,
    delays: Option<(Mutex<StdRng>, u64)>,
    hang_after_creates: Option<usize>,
}

impl TestProvider {
    pub fn new() -> Self {
        Self::with_capabilities(Capabilities::updatable())
    }

    pub fn with_capabilities(caps: Capabilities) -> Self {
        Self {
            caps,
            recorded: Mutex::new(Recorded::default()),
            delays: None,
            hang_after_creates: None,
        }
    }

    /// Sleeps a seeded random time up to `max_ms` inside every mutating call.
    pub fn with_delays(mut self, seed: u64, max_ms: u64) -> Self {
        self.delays = Some((Mutex::new(StdRng::seed_from_u64(seed)), max_ms));
        self
    }

    /// Lets `n` creates complete, then blocks until cancelled.
    pub const fn hang_after_creates(mut self, n: usize) -> Self {
        self.hang_after_creates = Some(n);
        self
    }

    /// Queues errors returned by the next mutating calls for `id`.
    pub fn fail_with(&self, id: &str, errors: impl IntoIterator<Item = ProviderError>) {
        self.lock()
            .failures
            .entry(ResourceId::new(id))
            .or_default()
            .extend(errors);
    }

    /// Makes the instance disappear out of band.
    pub fn mark_gone(&self, external_id: &str) {
        let mut recorded = self.lock();
        let external_id = ExternalId::new(external_id);
        recorded.live.remove(&external_id);
        recorded.gone.insert(external_id);
    }

    /// Seeds a live instance, as if created by an earlier run.
    pub fn seed_live(&self, external_id: &str, properties: Properties, outputs: Properties) {
        self.lock()
            .live
            .insert(ExternalId::new(external_id), (properties, outputs));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    /// Calls of one kind.
    pub fn calls_of(&self, op: Op) -> Vec<Call> {
        self.lock().calls.iter().filter(|c| c.op == op).cloned().collect()
    }

    pub fn mutating_calls(&self) -> Vec<(String, Op)> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.op != Op::Read)
            .map(|c| (c.id.to_string(), c.op))
            .collect()
    }

    pub fn events(&self) -> Vec<Event> {
        self.lock().events.clone()
    }

    pub fn is_live(&self, external_id: &str) -> bool {
        self.lock().live.contains_key(&ExternalId::new(external_id))
    }

    pub fn live_count(&self) -> usize {
        self.lock().live.len()
    }

    fn lock(&self) -> MutexGuard<'_, Recorded> {
        self.recorded.lock().expect("test provider lock poisoned")
    }

    /// Records the call and pops a scripted failure.
    fn begin(
        &self,
        ctx: &OperationContext,
        op: Op,
        external_id: Option<&ExternalId>,
        properties: &Properties,
    ) -> ProviderResult<()> {
        let mut recorded = self.lock();
        recorded.calls.push(Call {
            id: ctx.resource.clone(),
            op,
            external_id: external_id.cloned(),
            properties: properties.clone(),
        });
        recorded.events.push(Event {
            id: ctx.resource.clone(),
            op,
            phase: Phase::Start,
        });

        let failure = recorded
            .failures
            .get_mut(&ctx.resource)
            .and_then(VecDeque::pop_front);
        if let Some(err) = failure {
            recorded.events.push(Event {
                id: ctx.resource.clone(),
                op,
                phase: Phase::Finish,
            });
            return Err(err);
        }
        Ok(())
    }

    fn finish(&self, ctx: &OperationContext, op: Op) {
        self.lock().events.push(Event {
            id: ctx.resource.clone(),
            op,
            phase: Phase::Finish,
        });
    }

    async fn pause(&self) {
        let Some((rng, max_ms)) = &self.delays else {
            return;
        };
        let millis = rng.lock().expect("rng lock poisoned").gen_range(0..=*max_ms);
        tokio::time::sleep(Duration::from_millis(millis)).await;
    }
}

#[async_trait]
impl Provider for TestProvider {
    fn capabilities(&self) -> Capabilities {
        self.caps.clone()
    }

    async fn read(
        &self,
        ctx: &OperationContext,
        external_id: &ExternalId,
    ) -> ProviderResult<Option<CurrentState>> {
        let mut recorded = self.lock();
        recorded.calls.push(Call {
            id: ctx.resource.clone(),
            op: Op::Read,
            external_id: Some(external_id.clone()),
            properties: Properties::new(),
        });
        if recorded.gone.contains(external_id) {
            return Ok(None);
        }
        Ok(Some(recorded.live.get(external_id).map_or_else(
            CurrentState::default,
            |(properties, outputs)| CurrentState {
                properties: properties.clone(),
                outputs: outputs.clone(),
            },
        )))
    }

    async fn create(
        &self,
        ctx: &OperationContext,
        desired: &Properties,
    ) -> ProviderResult<ProviderOutput> {
        self.begin(ctx, Op::Create, None, desired)?;

        let hang = self
            .hang_after_creates
            .is_some_and(|n| self.lock().creates >= n);
        if hang {
            ctx.cancel.cancelled().await;
            self.finish(ctx, Op::Create);
            return Err(ProviderError::Cancelled);
        }

        self.pause().await;

        let mut recorded = self.lock();
        recorded.counter += 1;
        recorded.creates += 1;
        let n = recorded.counter;
        let external_id = ExternalId::new(format!("{}-{n}", ctx.resource));
        let outputs = Properties::from([
            (String::from("arn"), Value::string(format!("arn:{}:{n}", ctx.resource))),
            (String::from("name"), Value::string(ctx.resource.as_str())),
        ]);
        recorded
            .live
            .insert(external_id.clone(), (desired.clone(), outputs.clone()));
        drop(recorded);

        self.finish(ctx, Op::Create);
        Ok(ProviderOutput {
            external_id,
            outputs,
        })
    }

    async fn update(
        &self,
        ctx: &OperationContext,
        external_id: &ExternalId,
        changed: &Properties,
    ) -> ProviderResult<ProviderOutput> {
        self.begin(ctx, Op::Update, Some(external_id), changed)?;
        self.pause().await;

        let mut recorded = self.lock();
        if recorded.gone.contains(external_id) {
            drop(recorded);
            self.finish(ctx, Op::Update);
            return Err(ProviderError::NotFound {
                external_id: external_id.to_string(),
            });
        }
        let entry = recorded.live.entry(external_id.clone()).or_default();
        for (key, value) in changed {
            if value == &Value::Null {
                entry.0.remove(key);
            } else {
                entry.0.insert(key.clone(), value.clone());
            }
        }
        let outputs = entry.1.clone();
        drop(recorded);

        self.finish(ctx, Op::Update);
        Ok(ProviderOutput {
            external_id: external_id.clone(),
            outputs,
        })
    }

    async fn delete(&self, ctx: &OperationContext, external_id: &ExternalId) -> ProviderResult<()> {
        self.begin(ctx, Op::Delete, Some(external_id), &Properties::new())?;
        self.pause().await;

        let mut recorded = self.lock();
        let existed = recorded.live.remove(external_id).is_some();
        let already_gone = !recorded.gone.insert(external_id.clone());
        drop(recorded);

        self.finish(ctx, Op::Delete);
        if already_gone && !existed {
            return Err(ProviderError::NotFound {
                external_id: external_id.to_string(),
            });
        }
        Ok(())
    }
}

/// Builds a registry from test providers.
pub(crate) fn registry_with<I>(providers: I) -> ProviderRegistry
where
    I: IntoIterator<Item = (&'static str, Arc<TestProvider>)>,
{
    let mut registry = ProviderRegistry::new();
    for (kind, provider) in providers {
        registry.register(kind, provider);
    }
    registry
}
