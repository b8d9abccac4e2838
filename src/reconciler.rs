//! Reconciler for converging remote resources to a desired-state document.
//!
//! This is the orchestration layer: it builds the dependency graph,
//! optionally refreshes recorded state from the remote, plans against a
//! snapshot and hands the plan to the executor. It also owns the
//! state-maintenance operations that talk to remotes outside a plan:
//! refresh, import and drift detection.
//!
//! Data sources are read afresh every time a plan is built and are never
//! written to state.

use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{ApplyError, GraphError, PlanError, RemoteError, Result};
use crate::graph::{AttributeValue, DependencyGraph, DesiredStateDocument, DesiredStateNode, GraphBuilder};
use crate::planner::{
    ApplyReport, DataReadings, FailurePolicy, Plan, PlanExecutor, PlannedChange, Planner,
    RetryPolicy, DEFAULT_PARALLELISM,
};
use crate::registry::{ExecutionContext, RemoteObject, ResourceDescriptor, ResourceRegistry};
use crate::state::{AttributeMap, RemoteStateRecord, ResourceAddress, StateStore};

/// Reconciler for maintaining desired state.
#[derive(Clone)]
pub struct Reconciler {
    /// Registered resource types.
    registry: Arc<ResourceRegistry>,
    /// State store.
    store: Arc<dyn StateStore>,
    /// Context handed to every remote call.
    context: ExecutionContext,
    /// Retry policy for remote calls.
    retry: RetryPolicy,
    /// Concurrent changes during apply.
    parallelism: usize,
    /// Behaviour after a failed change.
    failure_policy: FailurePolicy,
    /// Refresh recorded state before planning.
    refresh_before_plan: bool,
    /// Stops scheduling new changes.
    cancellation: CancellationToken,
}

/// Result of a refresh.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshReport {
    /// Records rewritten with newly observed attributes.
    pub updated: Vec<ResourceAddress>,
    /// Records dropped because the remote object no longer exists.
    pub removed: Vec<ResourceAddress>,
    /// Records whose remote object matched.
    pub unchanged: usize,
}

/// Differences between remote reality and the desired state.
#[derive(Debug, Clone, Serialize)]
pub struct DriftReport {
    /// What the refresh changed in state.
    pub refresh: RefreshReport,
    /// Plan built from the refreshed state.
    pub plan: Plan,
}

impl RefreshReport {
    /// Returns true if the refresh wrote anything.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        !self.updated.is_empty() || !self.removed.is_empty()
    }
}

impl DriftReport {
    /// Changes needed to converge again.
    #[must_use]
    pub fn drifted(&self) -> Vec<&PlannedChange> {
        self.plan.actionable()
    }

    /// Returns true if remote state matches the document.
    #[must_use]
    pub fn is_converged(&self) -> bool {
        self.plan.is_converged()
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("registry", &self.registry)
            .field("backend", &self.store.backend_type())
            .field("parallelism", &self.parallelism)
            .field("failure_policy", &self.failure_policy)
            .field("refresh_before_plan", &self.refresh_before_plan)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Creates a new reconciler with default settings.
    #[must_use]
    pub fn new(registry: Arc<ResourceRegistry>, store: Arc<dyn StateStore>) -> Self {
        Self {
            registry,
            store,
            context: ExecutionContext::new(),
            retry: RetryPolicy::default(),
            parallelism: DEFAULT_PARALLELISM,
            failure_policy: FailurePolicy::default(),
            refresh_before_plan: true,
            cancellation: CancellationToken::new(),
        }
    }

    /// Creates a reconciler from engine configuration.
    ///
    /// Relative state paths resolve against `base_dir`.
    #[must_use]
    pub fn from_config(registry: Arc<ResourceRegistry>, config: &EngineConfig, base_dir: &Path) -> Self {
        let store = config.state.open(base_dir);
        info!("Using {} state backend", store.backend_type());

        Self::new(registry, store)
            .with_retry_policy(config.retry.to_policy())
            .with_parallelism(config.parallelism)
            .with_failure_policy(config.failure_policy)
            .with_refresh_before_plan(config.refresh_before_plan)
    }

    /// Sets the execution context.
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

    /// Sets the apply parallelism.
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

    /// Enables or disables refreshing before planning.
    #[must_use]
    pub const fn with_refresh_before_plan(mut self, refresh: bool) -> Self {
        self.refresh_before_plan = refresh;
        self
    }

    /// Sets the cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// Gets the registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<ResourceRegistry> {
        &self.registry
    }

    /// Gets the state store.
    #[must_use]
    pub const fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Gets the execution context.
    #[must_use]
    pub const fn context(&self) -> &ExecutionContext {
        &self.context
    }

    /// Gets the retry policy.
    #[must_use]
    pub const fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Gets the cancellation token.
    #[must_use]
    pub const fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Builds and validates the dependency graph for a document.
    ///
    /// # Errors
    ///
    /// Returns a graph error for invalid documents, unresolved references
    /// or cycles.
    pub fn build_graph(&self, document: &DesiredStateDocument) -> Result<DependencyGraph> {
        GraphBuilder::new(&self.registry).build(document)
    }

    /// Plans the changes needed to converge on `document`.
    ///
    /// # Errors
    ///
    /// Returns an error if the graph is invalid, the refresh fails or the
    /// recorded state cannot be planned against.
    pub async fn plan(&self, document: &DesiredStateDocument) -> Result<Plan> {
        let graph = self.build_graph(document)?;

        if self.refresh_before_plan {
            self.refresh().await?;
        }

        self.plan_graph(&graph).await
    }

    async fn plan_graph(&self, graph: &DependencyGraph) -> Result<Plan> {
        let data = self.read_data_sources(graph).await?;
        let snapshot = self.store.snapshot().await?;
        debug!("Planning against state version {}", snapshot.version);
        Planner::new(&self.registry).with_data(data).plan(graph, &snapshot)
    }

    /// Reads every declared data source, in dependency order.
    ///
    /// # Errors
    ///
    /// Returns an error for unregistered data source types and failed reads.
    pub async fn read_data_sources(&self, graph: &DependencyGraph) -> Result<DataReadings> {
        let mut readings = DataReadings::new();

        for node in graph.nodes().filter(|node| node.address.is_data()) {
            let descriptor = self
                .registry
                .data_source(node.address.resource_type())
                .ok_or_else(|| PlanError::UnknownResourceType {
                    address: node.address.to_string(),
                    resource_type: node.address.resource_type().to_string(),
                })?;
            let arguments = bind_arguments(node, &readings)?;

            let ops = &descriptor.operations;
            let address = &node.address;
            let arguments = &arguments;
            let label = format!("read {address}");
            let values = self
                .retry
                .run(&label, |_| {
                    let ctx = self.context.for_call();
                    async move { ops.read(&ctx, address, arguments).await }
                })
                .await
                .result?;

            debug!("Read {address}: {} attribute(s)", values.len());
            readings.insert(address.clone(), values);
        }

        if !readings.is_empty() {
            info!("Read {} data source(s)", readings.len());
        }
        Ok(readings)
    }

    /// Applies a plan.
    ///
    /// # Errors
    ///
    /// Returns `PlanError::PlanStale` if state moved since the plan was made.
    pub async fn apply(&self, plan: &Plan) -> Result<ApplyReport> {
        self.executor().execute(plan).await
    }

    /// Plans and applies `document`.
    ///
    /// # Errors
    ///
    /// Same as [`Self::plan`] and [`Self::apply`].
    pub async fn reconcile(&self, document: &DesiredStateDocument) -> Result<ApplyReport> {
        let plan = self.plan(document).await?;
        if plan.is_converged() {
            info!("No changes required - state is converged");
        }
        self.apply(&plan).await
    }

    /// Plans destroying every recorded resource.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be read or planned against.
    pub async fn plan_destroy(&self) -> Result<Plan> {
        let snapshot = self.store.snapshot().await?;
        Planner::new(&self.registry).plan_destroy(&snapshot)
    }

    /// Destroys every recorded resource, dependents first.
    ///
    /// # Errors
    ///
    /// Same as [`Self::plan_destroy`] and [`Self::apply`].
    pub async fn destroy(&self) -> Result<ApplyReport> {
        let plan = self.plan_destroy().await?;
        info!("Destroying {} recorded resource(s)", plan.changes.len());
        self.apply(&plan).await
    }

    /// Re-reads every recorded resource and writes back what was observed.
    ///
    /// A resource whose remote object is gone is removed from state, so the
    /// next plan creates it again.
    ///
    /// # Errors
    ///
    /// Returns an error for unregistered types, remote failures other than
    /// not-found, and state conflicts.
    pub async fn refresh(&self) -> Result<RefreshReport> {
        let snapshot = self.store.snapshot().await?;
        let mut report = RefreshReport::default();

        info!("Refreshing {} recorded resource(s)", snapshot.len());
        for record in snapshot.records.values() {
            self.refresh_record(record, &mut report).await?;
        }

        info!(
            "Refresh complete: {} updated, {} removed, {} unchanged",
            report.updated.len(),
            report.removed.len(),
            report.unchanged
        );
        Ok(report)
    }

    async fn refresh_record(&self, record: &RemoteStateRecord, report: &mut RefreshReport) -> Result<()> {
        let descriptor = self.descriptor(&record.address)?;
        let schema_version = descriptor.schema.version;

        if record.schema_version > schema_version {
            return Err(PlanError::SchemaVersionAhead {
                address: record.address.to_string(),
                recorded: record.schema_version,
                supported: schema_version,
            }
            .into());
        }

        let object = match self.read(descriptor, &record.address, &record.remote_id).await {
            Ok(object) => object,
            Err(RemoteError::NotFound { .. }) => {
                warn!(
                    "{} ({}) no longer exists remotely; removing it from state",
                    record.address, record.remote_id
                );
                self.store.delete(&record.address, record.version).await?;
                report.removed.push(record.address.clone());
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let attributes = if record.schema_version < schema_version {
            info!(
                "Upgrading {} from schema version {} to {schema_version}",
                record.address, record.schema_version
            );
            descriptor
                .operations
                .upgrade_state(record.schema_version, object.attributes)?
        } else {
            object.attributes
        };

        if object.remote_id == record.remote_id
            && attributes == record.attributes
            && record.schema_version == schema_version
        {
            report.unchanged += 1;
            return Ok(());
        }

        debug!("{} changed remotely", record.address);
        let mut refreshed = record.clone();
        refreshed.observe(object.remote_id, attributes);
        refreshed.schema_version = schema_version;
        self.store.put(refreshed, Some(record.version)).await?;
        report.updated.push(record.address.clone());
        Ok(())
    }

    /// Adopts an existing remote object into state.
    ///
    /// # Errors
    ///
    /// Returns `ApplyError::AlreadyManaged` if the address is recorded, or
    /// `RemoteError::NotFound` if the object does not exist.
    pub async fn import(&self, address: &ResourceAddress, remote_id: &str) -> Result<RemoteStateRecord> {
        if address.is_data() {
            return Err(GraphError::InvalidAddress {
                address: address.to_string(),
                reason: String::from("data sources are read on every plan and cannot be imported"),
            }
            .into());
        }
        let descriptor = self.descriptor(address)?;

        if let Some(existing) = self.store.get(address).await? {
            return Err(ApplyError::AlreadyManaged {
                address: address.to_string(),
                remote_id: existing.remote_id,
            }
            .into());
        }

        let object = self.read(descriptor, address, remote_id).await?;
        let record = RemoteStateRecord::new(
            address.clone(),
            object.remote_id,
            object.attributes,
            descriptor.schema.version,
        );

        let stored = self.store.put(record, None).await?;
        info!("Imported {address} as {}", stored.remote_id);
        Ok(stored)
    }

    /// Refreshes state and reports what would change to converge again.
    ///
    /// # Errors
    ///
    /// Same as [`Self::refresh`] and [`Self::plan`].
    pub async fn check_drift(&self, document: &DesiredStateDocument) -> Result<DriftReport> {
        let graph = self.build_graph(document)?;
        let refresh = self.refresh().await?;
        let plan = self.plan_graph(&graph).await?;

        if plan.is_converged() {
            info!("No drift detected");
        } else {
            warn!("Drift detected: {}", plan.summary());
        }

        Ok(DriftReport { refresh, plan })
    }

    fn executor(&self) -> PlanExecutor {
        PlanExecutor::new(Arc::clone(&self.registry), Arc::clone(&self.store))
            .with_context(self.context.clone())
            .with_retry_policy(self.retry.clone())
            .with_parallelism(self.parallelism)
            .with_failure_policy(self.failure_policy)
            .with_cancellation(self.cancellation.clone())
    }

    fn descriptor(&self, address: &ResourceAddress) -> Result<&ResourceDescriptor> {
        self.registry.get(address.resource_type()).ok_or_else(|| {
            PlanError::UnknownResourceType {
                address: address.to_string(),
                resource_type: address.resource_type().to_string(),
            }
            .into()
        })
    }

    async fn read(
        &self,
        descriptor: &ResourceDescriptor,
        address: &ResourceAddress,
        remote_id: &str,
    ) -> std::result::Result<RemoteObject, RemoteError> {
        let ops = &descriptor.operations;
        let label = format!("read {address}");
        self.retry
            .run(&label, |_| {
                let ctx = self.context.for_call();
                async move { ops.read(&ctx, address, remote_id).await }
            })
            .await
            .result
    }
}

/// Resolves a data block's arguments against data sources read before it.
fn bind_arguments(node: &DesiredStateNode, readings: &DataReadings) -> Result<AttributeMap> {
    let mut arguments = AttributeMap::new();
    for (name, value) in &node.attributes {
        let value = match value {
            AttributeValue::Literal(literal) => literal.clone(),
            AttributeValue::Reference(reference) => readings
                .get(&reference.address)
                .and_then(|reading| reading.get(&reference.attribute))
                .cloned()
                .ok_or_else(|| GraphError::UnresolvedReference {
                    address: node.address.to_string(),
                    reference: reference.to_string(),
                    reason: String::from("data source returned no such attribute"),
                })?,
        };
        arguments.insert(name.clone(), value);
    }
    Ok(arguments)
}
