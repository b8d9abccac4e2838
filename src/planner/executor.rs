//! Plan executor.
//!
//! Independent changes run concurrently on a bounded `JoinSet`. Each task
//! writes its record before reporting back, so a dependent never sees a
//! dependency that isn't durably recorded.
//!
//! A change runs as one or two steps. Destroys only tear down, creates and
//! updates only apply, and a replace tears down the previous object before
//! applying the new one. Apply steps wait for every dependency to succeed.
//! Teardown steps wait for the teardown of every destroyed or replaced
//! resource that recorded a dependency on them, so a chain of replaces
//! deletes dependents first and recreates dependencies first. Destroys of
//! undeclared resources also wait for every other change to finish.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::{Id, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ConvergeError, ErrorKind, GraphError, PlanError, RemoteError, Result};
use crate::graph::AttributeValue;
use crate::registry::{ExecutionContext, RemoteObject, ResourceDescriptor, ResourceRegistry};
use crate::state::{AttributeMap, RemoteStateRecord, ResourceAddress, StateStore};

use super::outcome::{ApplyOutcome, ApplyReport, NodeOutcome};
use super::plan::{ChangeAction, Plan, PlannedChange};
use super::retry::RetryPolicy;

/// Default number of concurrently applied changes.
pub const DEFAULT_PARALLELISM: usize = 4;

/// What to do after a change fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop scheduling new changes after the first failure.
    #[default]
    FailFast,
    /// Keep applying changes that don't depend on a failure.
    BestEffort,
}

/// Executor for plans.
#[derive(Clone)]
pub struct PlanExecutor {
    registry: Arc<ResourceRegistry>,
    store: Arc<dyn StateStore>,
    context: ExecutionContext,
    retry: RetryPolicy,
    parallelism: usize,
    failure_policy: FailurePolicy,
    cancellation: CancellationToken,
}

impl std::fmt::Debug for PlanExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanExecutor")
            .field("backend", &self.store.backend_type())
            .field("retry", &self.retry)
            .field("parallelism", &self.parallelism)
            .field("failure_policy", &self.failure_policy)
            .finish_non_exhaustive()
    }
}

/// Half of a change. Teardown sorts first so a replace is torn down
/// before it is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum Step {
    /// Delete the recorded remote object.
    Teardown,
    /// Create or update the desired object.
    Apply,
}

impl Step {
    fn for_action(action: ChangeAction) -> &'static [Self] {
        match action {
            ChangeAction::Destroy => &[Self::Teardown],
            ChangeAction::Replace => &[Self::Teardown, Self::Apply],
            ChangeAction::NoOp | ChangeAction::Create | ChangeAction::Update => &[Self::Apply],
        }
    }
}

/// Whether a step may start.
#[derive(Debug, PartialEq, Eq)]
enum Gate {
    Open,
    Waiting,
    Closed(String),
}

/// How far a node got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepState {
    Done,
    Pending,
    Failed,
}

/// Everything one task needs to run one step of one change.
struct NodeTask {
    step: Step,
    change: PlannedChange,
    descriptor: ResourceDescriptor,
    store: Arc<dyn StateStore>,
    context: ExecutionContext,
    retry: RetryPolicy,
}

/// Per-node bookkeeping while a plan runs.
struct Progress<'p> {
    plan: &'p Plan,
    index_of: HashMap<&'p ResourceAddress, usize>,
    outcomes: Vec<Option<NodeOutcome>>,
    /// Successful teardowns of replaces still waiting to apply.
    torn_down: Vec<Option<NodeOutcome>>,
    pending: BTreeSet<(usize, Step)>,
    running: HashSet<usize>,
}

impl PlanExecutor {
    /// Creates a new plan executor.
    #[must_use]
    pub fn new(registry: Arc<ResourceRegistry>, store: Arc<dyn StateStore>) -> Self {
        Self {
            registry,
            store,
            context: ExecutionContext::new(),
            retry: RetryPolicy::default(),
            parallelism: DEFAULT_PARALLELISM,
            failure_policy: FailurePolicy::default(),
            cancellation: CancellationToken::new(),
        }
    }

    /// Sets the execution context handed to remote operations.
    #[must_use]
    pub fn with_context(mut self, context: ExecutionContext) -> Self {
        self.context = context;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the maximum number of concurrent changes.
    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Sets the failure policy.
    #[must_use]
    pub const fn with_failure_policy(mut self, failure_policy: FailurePolicy) -> Self {
        self.failure_policy = failure_policy;
        self
    }

    /// Sets the token that stops scheduling new changes.
    #[must_use]
    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// Gets the cancellation token.
    #[must_use]
    pub const fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Applies a plan.
    ///
    /// Node failures are reported in the returned [`ApplyReport`], never as
    /// an error.
    ///
    /// # Errors
    ///
    /// Returns `PlanError::PlanStale` if the store moved past the plan's base
    /// version, or a state error if the store cannot be read.
    pub async fn execute(&self, plan: &Plan) -> Result<ApplyReport> {
        let started_at = chrono::Utc::now();

        let current = self.store.version().await?;
        if current != plan.base_version {
            warn!(
                "Plan {} was built at version {} but the store is at {current}",
                plan.id, plan.base_version
            );
            return Err(PlanError::PlanStale {
                planned: plan.base_version,
                current,
            }
            .into());
        }

        info!(
            "Applying plan {} ({} actionable of {} changes, parallelism {})",
            plan.id,
            plan.actionable().len(),
            plan.changes.len(),
            self.parallelism
        );

        let mut progress = Progress::new(plan);
        let mut in_flight: HashMap<Id, (usize, Step)> = HashMap::new();
        let mut join_set: JoinSet<NodeOutcome> = JoinSet::new();
        let mut halted: Option<&'static str> = None;
        let mut cancelled = false;

        loop {
            progress.settle();

            if halted.is_none() {
                if self.cancellation.is_cancelled() {
                    warn!("Apply cancelled; finishing {} in-flight change(s)", in_flight.len());
                    halted = Some("cancelled");
                    cancelled = true;
                } else if self.failure_policy == FailurePolicy::FailFast && progress.any_failed() {
                    warn!("Stopping apply after failure");
                    halted = Some("apply stopped after an earlier failure");
                }
            }

            if let Some(reason) = halted {
                progress.skip_pending(reason);
            } else {
                for (index, step) in progress.ready() {
                    if in_flight.len() >= self.parallelism {
                        break;
                    }
                    let task = self.task_for(&plan.changes[index], step)?;
                    progress.start(index, step);
                    let handle = join_set.spawn(task.run());
                    in_flight.insert(handle.id(), (index, step));
                }
            }

            if in_flight.is_empty() {
                if !progress.pending.is_empty() {
                    error!("{} change(s) have unsatisfiable dependencies", progress.pending.len());
                    progress.skip_pending("dependencies could not be satisfied");
                }
                break;
            }

            match join_set.join_next_with_id().await {
                Some(Ok((id, outcome))) => {
                    if let Some((index, step)) = in_flight.remove(&id) {
                        progress.complete(index, step, outcome);
                    }
                }
                Some(Err(e)) => {
                    error!("Apply task did not complete: {e}");
                    if let Some((index, step)) = in_flight.remove(&e.id()) {
                        progress.abort(index, step, format!("apply task did not complete: {e}"));
                    }
                }
                None => {
                    for (_, (index, step)) in in_flight.drain() {
                        progress.abort(index, step, String::from("apply task aborted"));
                    }
                }
            }
        }

        let final_version = self.store.version().await?;
        let report = ApplyReport {
            plan_id: plan.id,
            started_at,
            finished_at: chrono::Utc::now(),
            outcomes: progress.finish(),
            cancelled,
            final_version,
        };

        info!("{report}");
        Ok(report)
    }

    fn task_for(&self, change: &PlannedChange, step: Step) -> Result<NodeTask> {
        let descriptor = self
            .registry
            .get(change.address.resource_type())
            .cloned()
            .ok_or_else(|| {
                ConvergeError::internal(format!(
                    "plan contains {} but its type is not registered",
                    change.address
                ))
            })?;

        Ok(NodeTask {
            step,
            change: change.clone(),
            descriptor,
            store: Arc::clone(&self.store),
            context: self.context.clone(),
            retry: self.retry.clone(),
        })
    }
}

impl<'p> Progress<'p> {
    fn new(plan: &'p Plan) -> Self {
        Self {
            plan,
            index_of: plan
                .changes
                .iter()
                .enumerate()
                .map(|(i, change)| (&change.address, i))
                .collect(),
            outcomes: vec![None; plan.changes.len()],
            torn_down: vec![None; plan.changes.len()],
            pending: plan
                .changes
                .iter()
                .enumerate()
                .flat_map(|(i, change)| Step::for_action(change.action).iter().map(move |&step| (i, step)))
                .collect(),
            running: HashSet::new(),
        }
    }

    /// Completes no-ops and skips nodes whose gate closed until nothing
    /// changes.
    fn settle(&mut self) {
        let plan = self.plan;
        loop {
            let mut changed = false;

            for (index, step) in self.pending.clone() {
                if self.running.contains(&index) || self.outcomes[index].is_some() {
                    continue;
                }
                let change = &plan.changes[index];

                let outcome = if change.action == ChangeAction::NoOp {
                    change.prior.clone().map(|record| ApplyOutcome::Success { record })
                } else if let Gate::Closed(reason) = self.gate(index, step) {
                    Some(ApplyOutcome::skipped(self.teardown_note(index, reason)))
                } else {
                    None
                };

                if let Some(outcome) = outcome {
                    debug!("{} settled: {outcome}", change.address);
                    self.finalize(
                        index,
                        NodeOutcome::immediate(change.address.clone(), change.action, outcome),
                    );
                    changed = true;
                }
            }

            if !changed {
                break;
            }
        }
    }

    /// Decides whether one step of a node may start.
    fn gate(&self, index: usize, step: Step) -> Gate {
        let plan = self.plan;
        let change = &plan.changes[index];
        let mut gate = Gate::Open;

        match step {
            Step::Apply => {
                if change.action == ChangeAction::Replace && self.torn_down[index].is_none() {
                    gate = Gate::Waiting;
                }
                for dependency in &change.dependencies {
                    let Some(&i) = self.index_of.get(dependency) else {
                        continue;
                    };
                    match self.final_state(i) {
                        StepState::Done => {}
                        StepState::Pending => gate = Gate::Waiting,
                        StepState::Failed => {
                            return Gate::Closed(format!("dependency {dependency} did not succeed"));
                        }
                    }
                }
            }
            Step::Teardown => {
                for (j, other) in plan.changes.iter().enumerate() {
                    if j == index {
                        continue;
                    }
                    let depends = other
                        .prior
                        .as_ref()
                        .is_some_and(|record| record.dependencies.contains(&change.address));

                    let state = if change.action == ChangeAction::Destroy
                        && other.action != ChangeAction::Destroy
                    {
                        // A failed change only holds the destroy back if it
                        // still references the resource.
                        match self.final_state(j) {
                            StepState::Failed if !depends || self.torn_down[j].is_some() => StepState::Done,
                            state => state,
                        }
                    } else if depends && other.action.is_destructive() {
                        self.teardown_state(j)
                    } else {
                        continue;
                    };

                    match state {
                        StepState::Done => {}
                        StepState::Pending => gate = Gate::Waiting,
                        StepState::Failed => {
                            return Gate::Closed(format!("dependent {} still depends on it", other.address));
                        }
                    }
                }
            }
        }
        gate
    }

    fn final_state(&self, index: usize) -> StepState {
        match &self.outcomes[index] {
            Some(done) if done.outcome.is_success() => StepState::Done,
            Some(_) => StepState::Failed,
            None => StepState::Pending,
        }
    }

    fn teardown_state(&self, index: usize) -> StepState {
        if self.torn_down[index].is_some() {
            StepState::Done
        } else {
            self.final_state(index)
        }
    }

    /// Pending steps whose gate is open, in plan order.
    fn ready(&self) -> Vec<(usize, Step)> {
        self.pending
            .iter()
            .copied()
            .filter(|&(index, step)| {
                !self.running.contains(&index)
                    && self.outcomes[index].is_none()
                    && self.gate(index, step) == Gate::Open
            })
            .collect()
    }

    fn start(&mut self, index: usize, step: Step) {
        self.pending.remove(&(index, step));
        self.running.insert(index);
    }

    /// Records a finished step. A replace that was torn down goes back to
    /// waiting for its apply step.
    fn complete(&mut self, index: usize, step: Step, outcome: NodeOutcome) {
        self.running.remove(&index);

        let replace = self.plan.changes[index].action == ChangeAction::Replace;
        if replace && step == Step::Teardown && outcome.outcome.is_success() {
            debug!("{} previous object removed", outcome.address);
            self.torn_down[index] = Some(outcome);
            return;
        }
        self.finalize(index, outcome);
    }

    /// Fails a step whose task never reported back.
    fn abort(&mut self, index: usize, step: Step, message: String) {
        let change = &self.plan.changes[index];
        let outcome = NodeOutcome::immediate(
            change.address.clone(),
            change.action,
            ApplyOutcome::Failure {
                kind: ErrorKind::Internal,
                message,
            },
        );
        self.complete(index, step, outcome);
    }

    /// Sets a node's final outcome and drops its remaining steps.
    fn finalize(&mut self, index: usize, mut outcome: NodeOutcome) {
        self.pending.retain(|&(i, _)| i != index);
        if let Some(teardown) = &self.torn_down[index] {
            outcome.attempts += teardown.attempts;
            outcome.duration_ms += teardown.duration_ms;
        }
        self.outcomes[index] = Some(outcome);
    }

    fn teardown_note(&self, index: usize, reason: String) -> String {
        if self.torn_down[index].is_some() {
            format!("{reason}; the previous object was already removed")
        } else {
            reason
        }
    }

    fn any_failed(&self) -> bool {
        self.outcomes
            .iter()
            .flatten()
            .any(|done| done.outcome.is_failure())
    }

    /// Skips every pending node that has no step in flight.
    fn skip_pending(&mut self, reason: &str) {
        let plan = self.plan;
        let waiting: BTreeSet<usize> = self
            .pending
            .iter()
            .map(|&(index, _)| index)
            .filter(|index| !self.running.contains(index))
            .collect();

        for index in waiting {
            let change = &plan.changes[index];
            let outcome = ApplyOutcome::skipped(self.teardown_note(index, reason.to_string()));
            self.finalize(
                index,
                NodeOutcome::immediate(change.address.clone(), change.action, outcome),
            );
        }
    }

    fn finish(self) -> Vec<NodeOutcome> {
        self.outcomes
            .into_iter()
            .zip(&self.plan.changes)
            .map(|(outcome, change)| {
                outcome.unwrap_or_else(|| {
                    NodeOutcome::immediate(
                        change.address.clone(),
                        change.action,
                        ApplyOutcome::skipped("never scheduled"),
                    )
                })
            })
            .collect()
    }
}

impl NodeTask {
    async fn run(self) -> NodeOutcome {
        let started = Instant::now();
        let address = self.change.address.clone();
        let action = self.change.action;
        match (action, self.step) {
            (ChangeAction::Replace, Step::Teardown) => info!("Replace {address}: removing previous object"),
            (ChangeAction::Replace, Step::Apply) => info!("Replace {address}: creating new object"),
            _ => info!("{}", self.change.description()),
        }

        let mut attempts = 0;
        let result = self.apply(&mut attempts).await;

        let outcome = match result {
            Ok(record) => {
                info!("{action} {address} succeeded");
                ApplyOutcome::Success { record }
            }
            Err(e) => {
                error!("{action} {address} failed: {e}");
                ApplyOutcome::Failure {
                    kind: e.kind(),
                    message: e.to_string(),
                }
            }
        };

        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        NodeOutcome {
            address,
            action,
            outcome,
            attempts,
            duration_ms,
        }
    }

    async fn apply(&self, attempts: &mut u32) -> Result<RemoteStateRecord> {
        match (self.change.action, self.step) {
            (ChangeAction::Replace | ChangeAction::Destroy, Step::Teardown) => self.destroy(attempts).await,
            (ChangeAction::Create | ChangeAction::Replace, Step::Apply) => self.create(attempts).await,
            (ChangeAction::Update, Step::Apply) => self.update(attempts).await,
            _ => self.prior().cloned(),
        }
    }

    async fn create(&self, attempts: &mut u32) -> Result<RemoteStateRecord> {
        let attributes = self.resolve_desired().await?;
        let ops = &self.descriptor.operations;
        let address = &self.change.address;
        let label = format!("create {address}");

        let outcome = self
            .retry
            .run(&label, |_| {
                let ctx = self.context.for_call();
                let attributes = &attributes;
                async move { ops.create(&ctx, address, attributes).await }
            })
            .await;
        *attempts += outcome.attempts;
        let object = outcome.result?;

        self.persist(object, None).await
    }

    async fn update(&self, attempts: &mut u32) -> Result<RemoteStateRecord> {
        let prior = self.prior()?;
        let attributes = self.resolve_desired().await?;
        let ops = &self.descriptor.operations;
        let address = &self.change.address;
        let label = format!("update {address}");

        let outcome = self
            .retry
            .run(&label, |_| {
                let ctx = self.context.for_call();
                let attributes = &attributes;
                let remote_id = prior.remote_id.as_str();
                async move { ops.update(&ctx, address, remote_id, attributes).await }
            })
            .await;
        *attempts += outcome.attempts;
        let object = outcome.result?;

        self.persist(object, Some(prior.version)).await
    }

    /// Deletes the remote object and its record. A missing object counts as
    /// already deleted.
    async fn destroy(&self, attempts: &mut u32) -> Result<RemoteStateRecord> {
        let prior = self.prior()?;
        let ops = &self.descriptor.operations;
        let address = &self.change.address;
        let label = format!("delete {address}");

        let outcome = self
            .retry
            .run(&label, |_| {
                let ctx = self.context.for_call();
                let remote_id = prior.remote_id.as_str();
                async move { ops.delete(&ctx, address, remote_id).await }
            })
            .await;
        *attempts += outcome.attempts;

        match outcome.result {
            Ok(()) => {}
            Err(RemoteError::NotFound { .. }) => {
                info!("{address} ({}) was already gone", prior.remote_id);
            }
            Err(e) => return Err(e.into()),
        }

        self.store.delete(address, prior.version).await?;
        Ok(prior.clone())
    }

    async fn persist(&self, object: RemoteObject, expected: Option<u64>) -> Result<RemoteStateRecord> {
        let mut record = match (self.change.action, &self.change.prior) {
            (ChangeAction::Update, Some(prior)) => {
                let mut record = prior.clone();
                record.observe(object.remote_id, object.attributes);
                record
            }
            _ => RemoteStateRecord::new(
                self.change.address.clone(),
                object.remote_id,
                object.attributes,
                self.descriptor.schema.version,
            ),
        };
        record.schema_version = self.descriptor.schema.version;
        record.dependencies.clone_from(&self.change.dependencies);

        let remote_id = record.remote_id.clone();
        self.store.put(record, expected).await.inspect_err(|e| {
            error!(
                "{} exists remotely as {remote_id} but could not be recorded: {e}",
                self.change.address
            );
        })
    }

    /// Resolves references from the dependencies' persisted records.
    async fn resolve_desired(&self) -> Result<AttributeMap> {
        let mut resolved = AttributeMap::new();

        for (name, value) in &self.change.desired {
            let value = match value {
                AttributeValue::Literal(literal) => literal.clone(),
                AttributeValue::Reference(reference) => {
                    let unresolved = |reason: &str| GraphError::UnresolvedReference {
                        address: self.change.address.to_string(),
                        reference: reference.to_string(),
                        reason: reason.to_string(),
                    };

                    let record = self
                        .store
                        .get(&reference.address)
                        .await?
                        .ok_or_else(|| unresolved("dependency is not recorded in state"))?;

                    record
                        .attribute(&reference.attribute)
                        .cloned()
                        .ok_or_else(|| unresolved("dependency's recorded state lacks the attribute"))?
                }
            };
            resolved.insert(name.clone(), value);
        }

        Ok(resolved)
    }

    fn prior(&self) -> Result<&RemoteStateRecord> {
        self.change.prior.as_ref().ok_or_else(|| {
            ConvergeError::internal(format!(
                "{} planned as {} without a prior record",
                self.change.address, self.change.action
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{DesiredStateDocument, GraphBuilder};
    use crate::planner::Planner;
    use crate::registry::{
        AttributeSchema, AttributeType, MemoryProvider, MockRemoteOperations, Operation,
        ResourceSchema,
    };
    use crate::registry::RemoteOperations;
    use crate::state::MemoryStateStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    /// Panics on create for one resource name; delegates everything else.
    struct PanicOnCreate {
        inner: MemoryProvider,
        name: &'static str,
    }

    #[async_trait]
    impl RemoteOperations for PanicOnCreate {
        async fn create(
            &self,
            ctx: &ExecutionContext,
            address: &ResourceAddress,
            attributes: &AttributeMap,
        ) -> std::result::Result<RemoteObject, RemoteError> {
            assert_ne!(address.name(), self.name, "provider bug");
            self.inner.create(ctx, address, attributes).await
        }

        async fn read(
            &self,
            ctx: &ExecutionContext,
            address: &ResourceAddress,
            remote_id: &str,
        ) -> std::result::Result<RemoteObject, RemoteError> {
            self.inner.read(ctx, address, remote_id).await
        }

        async fn update(
            &self,
            ctx: &ExecutionContext,
            address: &ResourceAddress,
            remote_id: &str,
            attributes: &AttributeMap,
        ) -> std::result::Result<RemoteObject, RemoteError> {
            self.inner.update(ctx, address, remote_id, attributes).await
        }

        async fn delete(
            &self,
            ctx: &ExecutionContext,
            address: &ResourceAddress,
            remote_id: &str,
        ) -> std::result::Result<(), RemoteError> {
            self.inner.delete(ctx, address, remote_id).await
        }
    }

    fn node_schema() -> ResourceSchema {
        ResourceSchema::new("node", 1)
            .with_attribute("label", AttributeSchema::optional(AttributeType::String))
            .with_attribute("parent", AttributeSchema::optional(AttributeType::String).with_force_new())
            .with_attribute("id", AttributeSchema::computed(AttributeType::String))
    }

    fn setup(provider: Arc<MemoryProvider>) -> (Arc<ResourceRegistry>, Arc<MemoryStateStore>) {
        let registry = ResourceRegistry::new().with_type(node_schema(), provider);
        (Arc::new(registry), Arc::new(MemoryStateStore::new()))
    }

    fn node(document: DesiredStateDocument, name: &str, parent: Option<&str>) -> DesiredStateDocument {
        let mut attributes = AttributeMap::new();
        attributes.insert(String::from("label"), json!(name));
        if let Some(parent) = parent {
            attributes.insert(String::from("parent"), json!(format!("${{node.{parent}.id}}")));
        }
        document.with_resource("node", name, attributes)
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::default()
            .with_backoff(Duration::from_millis(1), Duration::from_millis(2))
            .with_jitter(false)
    }

    async fn plan_for(
        registry: &ResourceRegistry,
        store: &MemoryStateStore,
        document: &DesiredStateDocument,
    ) -> Plan {
        let graph = GraphBuilder::new(registry).build(document).expect("graph");
        let snapshot = store.snapshot().await.expect("snapshot");
        Planner::new(registry).plan(&graph, &snapshot).expect("plan")
    }

    fn address(name: &str) -> ResourceAddress {
        ResourceAddress::new("node", name).expect("valid")
    }

    #[tokio::test]
    async fn test_chain_applies_and_resolves_references() {
        let provider = Arc::new(MemoryProvider::new(node_schema()));
        let (registry, store) = setup(Arc::clone(&provider));
        let document = node(node(DesiredStateDocument::new(), "a", None), "b", Some("a"));

        let plan = plan_for(&registry, &store, &document).await;
        let executor = PlanExecutor::new(Arc::clone(&registry), store.clone());
        let report = executor.execute(&plan).await.expect("apply");

        assert!(report.is_success(), "{report}");
        let a = store.get(&address("a")).await.expect("get").expect("a recorded");
        let b = store.get(&address("b")).await.expect("get").expect("b recorded");
        assert_eq!(b.attributes["parent"], json!(a.remote_id));
        assert_eq!(b.dependencies, vec![address("a")]);
        assert_eq!(report.final_version, 2);
    }

    #[tokio::test]
    async fn test_stale_plan_rejected() {
        let provider = Arc::new(MemoryProvider::new(node_schema()));
        let (registry, store) = setup(provider);
        let document = node(DesiredStateDocument::new(), "a", None);

        let stale = plan_for(&registry, &store, &document).await;
        let fresh = plan_for(&registry, &store, &document).await;

        let executor = PlanExecutor::new(Arc::clone(&registry), store.clone());
        executor.execute(&fresh).await.expect("first apply");

        let err = executor.execute(&stale).await.expect_err("stale");
        assert!(matches!(
            err,
            ConvergeError::Plan(PlanError::PlanStale { planned: 0, current: 1 })
        ));
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let provider = Arc::new(MemoryProvider::new(node_schema()));
        provider
            .inject_fault(Operation::Create, RemoteError::transient("throttled"), 2)
            .await;
        let (registry, store) = setup(Arc::clone(&provider));
        let document = node(DesiredStateDocument::new(), "a", None);

        let plan = plan_for(&registry, &store, &document).await;
        let report = PlanExecutor::new(Arc::clone(&registry), store.clone())
            .with_retry_policy(fast_retry())
            .execute(&plan)
            .await
            .expect("apply");

        let outcome = report.outcome(&address("a")).expect("outcome");
        assert!(outcome.outcome.is_success());
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test]
    async fn test_fail_fast_skips_everything_after_failure() {
        let provider = Arc::new(MemoryProvider::new(node_schema()));
        provider
            .inject_fault(Operation::Create, RemoteError::permanent("quota exceeded"), 1)
            .await;
        let (registry, store) = setup(Arc::clone(&provider));
        let document = node(node(DesiredStateDocument::new(), "a", None), "b", Some("a"));

        let plan = plan_for(&registry, &store, &document).await;
        let report = PlanExecutor::new(Arc::clone(&registry), store.clone())
            .with_parallelism(1)
            .execute(&plan)
            .await
            .expect("apply");

        assert_eq!(report.failed(), 1);
        assert_eq!(report.skipped(), 1);
        assert!(matches!(
            report.outcome(&address("a")).map(|o| &o.outcome),
            Some(ApplyOutcome::Failure { kind: ErrorKind::PermanentRemote, .. })
        ));
        assert!(store.snapshot().await.expect("snapshot").is_empty());
    }

    #[tokio::test]
    async fn test_best_effort_applies_independent_subgraphs() {
        let provider = Arc::new(MemoryProvider::new(node_schema()));
        provider
            .inject_fault(Operation::Create, RemoteError::permanent("quota exceeded"), 1)
            .await;
        let (registry, store) = setup(Arc::clone(&provider));
        let document = node(
            node(node(DesiredStateDocument::new(), "a", None), "b", Some("a")),
            "c",
            None,
        );

        let plan = plan_for(&registry, &store, &document).await;
        let report = PlanExecutor::new(Arc::clone(&registry), store.clone())
            .with_parallelism(1)
            .with_failure_policy(FailurePolicy::BestEffort)
            .execute(&plan)
            .await
            .expect("apply");

        // a fails, b depends on a, c is independent
        assert!(report.outcome(&address("a")).is_some_and(|o| o.outcome.is_failure()));
        assert!(report.outcome(&address("b")).is_some_and(|o| o.outcome.is_skipped()));
        assert!(report.outcome(&address("c")).is_some_and(|o| o.outcome.is_success()));
        assert_eq!(report.outcomes.len(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_skips_all() {
        let provider = Arc::new(MemoryProvider::new(node_schema()));
        let (registry, store) = setup(Arc::clone(&provider));
        let document = node(node(DesiredStateDocument::new(), "a", None), "b", None);

        let plan = plan_for(&registry, &store, &document).await;
        let executor = PlanExecutor::new(Arc::clone(&registry), store.clone());
        executor.cancellation().cancel();

        let report = executor.execute(&plan).await.expect("apply");
        assert!(report.cancelled);
        assert_eq!(report.skipped(), 2);
        assert_eq!(provider.call_count(Operation::Create).await, 0);
    }

    #[tokio::test]
    async fn test_cancellation_lets_in_flight_finish() {
        let provider = Arc::new(MemoryProvider::new(node_schema()).with_latency(Duration::from_millis(50)));
        let (registry, store) = setup(Arc::clone(&provider));
        let document = node(node(DesiredStateDocument::new(), "a", None), "b", Some("a"));

        let plan = plan_for(&registry, &store, &document).await;
        let executor = PlanExecutor::new(Arc::clone(&registry), store.clone());
        let token = executor.cancellation().clone();

        let cancel = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        });
        let report = executor.execute(&plan).await.expect("apply");
        cancel.await.expect("cancel task");

        assert!(report.cancelled);
        assert!(report.outcome(&address("a")).is_some_and(|o| o.outcome.is_success()));
        assert!(report.outcome(&address("b")).is_some_and(|o| o.outcome.is_skipped()));
        assert!(store.get(&address("a")).await.expect("get").is_some());
    }

    #[tokio::test]
    async fn test_destroy_tolerates_not_found() {
        let provider = Arc::new(MemoryProvider::new(node_schema()));
        let (registry, store) = setup(Arc::clone(&provider));
        let document = node(DesiredStateDocument::new(), "a", None);

        let plan = plan_for(&registry, &store, &document).await;
        let executor = PlanExecutor::new(Arc::clone(&registry), store.clone());
        executor.execute(&plan).await.expect("apply");

        let record = store.get(&address("a")).await.expect("get").expect("recorded");
        assert!(provider.remove_out_of_band(&record.remote_id).await);

        let snapshot = store.snapshot().await.expect("snapshot");
        let destroy = Planner::new(&registry).plan_destroy(&snapshot).expect("plan");
        let report = executor.execute(&destroy).await.expect("destroy");

        assert!(report.is_success());
        assert!(store.snapshot().await.expect("snapshot").is_empty());
    }

    #[tokio::test]
    async fn test_mocked_permanent_update_failure() {
        let mut mock = MockRemoteOperations::new();
        mock.expect_create().returning(|_, address, attributes| {
            let mut observed = attributes.clone();
            observed.insert(String::from("id"), json!(format!("{}-1", address.name())));
            Ok(RemoteObject::new(format!("{}-1", address.name()), observed))
        });
        mock.expect_update()
            .times(1)
            .returning(|_, _, _, _| Err(RemoteError::permanent("immutable field")));

        let registry = Arc::new(ResourceRegistry::new().with_type(node_schema(), Arc::new(mock)));
        let store = Arc::new(MemoryStateStore::new());
        let executor = PlanExecutor::new(Arc::clone(&registry), store.clone());

        let document = node(DesiredStateDocument::new(), "a", None);
        let plan = plan_for(&registry, &store, &document).await;
        executor.execute(&plan).await.expect("create");

        let mut changed = document.clone();
        if let Some(block) = changed.get_mut("node.a") {
            block.attributes.insert(String::from("label"), json!("renamed"));
        }
        let plan = plan_for(&registry, &store, &changed).await;
        assert_eq!(plan.actions(), vec![(ChangeAction::Update, String::from("node.a"))]);

        let report = executor.execute(&plan).await.expect("apply");
        assert_eq!(report.failed(), 1);

        let record = store.get(&address("a")).await.expect("get").expect("recorded");
        assert_eq!(record.attributes["label"], json!("a"));
    }

    #[tokio::test]
    async fn test_best_effort_resumes_where_it_stopped() {
        let provider = Arc::new(MemoryProvider::new(node_schema()));
        provider
            .inject_fault(Operation::Create, RemoteError::permanent("quota exceeded"), 1)
            .await;
        let (registry, store) = setup(Arc::clone(&provider));
        let document = node(
            node(node(DesiredStateDocument::new(), "a", None), "b", Some("a")),
            "c",
            None,
        );
        let executor = PlanExecutor::new(Arc::clone(&registry), store.clone())
            .with_parallelism(1)
            .with_failure_policy(FailurePolicy::BestEffort);

        let plan = plan_for(&registry, &store, &document).await;
        let report = executor.execute(&plan).await.expect("apply");
        assert!(report.outcome(&address("a")).is_some_and(|o| o.outcome.is_failure()));
        assert!(report.outcome(&address("b")).is_some_and(|o| o.outcome.is_skipped()));
        assert!(report.outcome(&address("c")).is_some_and(|o| o.outcome.is_success()));

        // The injected fault is spent; only the missing pieces are planned.
        let plan = plan_for(&registry, &store, &document).await;
        assert_eq!(
            plan.actions(),
            vec![
                (ChangeAction::Create, String::from("node.a")),
                (ChangeAction::Create, String::from("node.b")),
            ]
        );
        assert_eq!(
            plan.change(&address("c")).map(|change| change.action),
            Some(ChangeAction::NoOp)
        );

        let report = executor.execute(&plan).await.expect("apply");
        assert!(report.is_success(), "{report}");
        assert_eq!(provider.object_count().await, 3);

        let plan = plan_for(&registry, &store, &document).await;
        assert!(plan.is_converged(), "{plan}");
    }

    #[tokio::test]
    async fn test_panicked_task_fails_its_node() {
        let provider = Arc::new(PanicOnCreate {
            inner: MemoryProvider::new(node_schema()),
            name: "a",
        });
        let registry = Arc::new(ResourceRegistry::new().with_type(node_schema(), provider));
        let store = Arc::new(MemoryStateStore::new());
        let document = node(
            node(node(DesiredStateDocument::new(), "a", None), "b", Some("a")),
            "c",
            None,
        );

        let plan = plan_for(&registry, &store, &document).await;
        let report = PlanExecutor::new(Arc::clone(&registry), store.clone())
            .with_failure_policy(FailurePolicy::BestEffort)
            .execute(&plan)
            .await
            .expect("apply");

        let a = report.outcome(&address("a")).expect("a outcome");
        assert!(matches!(
            &a.outcome,
            ApplyOutcome::Failure { kind: ErrorKind::Internal, message } if message.contains("did not complete")
        ));
        assert!(report.outcome(&address("b")).is_some_and(|o| o.outcome.is_skipped()));
        assert!(report.outcome(&address("c")).is_some_and(|o| o.outcome.is_success()));
        assert_eq!(report.outcomes.len(), 3);
    }
}
