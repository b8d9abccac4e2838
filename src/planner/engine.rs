//! Plan construction.
//!
//! The planner is a pure function of a dependency graph and a state
//! snapshot. It walks declared resources in topological order, then appends
//! destroys for recorded resources that are no longer declared.
//!
//! Data blocks never produce changes. References to them are bound to the
//! readings handed to the planner, so they plan as known literals.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info};

use crate::error::{ConvergeError, GraphError, PlanError, Result};
use crate::graph::{
    stable_topological_sort, AttributeValue, DependencyGraph, DesiredStateNode, ParsedAttributes,
};
use crate::registry::{ResourceRegistry, ResourceSchema};
use crate::state::{ResourceAddress, StateSnapshot};

use super::diff::{DiffEngine, PlannedAttributes, PlannedValue};
use super::plan::{ChangeAction, DataReadings, Plan, PlannedChange};

/// Builds plans against a registry.
#[derive(Debug)]
pub struct Planner<'a> {
    registry: &'a ResourceRegistry,
    diff: DiffEngine,
    data: DataReadings,
}

impl<'a> Planner<'a> {
    /// Creates a planner.
    #[must_use]
    pub const fn new(registry: &'a ResourceRegistry) -> Self {
        Self {
            registry,
            diff: DiffEngine::new(),
            data: DataReadings::new(),
        }
    }

    /// Binds data source references to these readings.
    #[must_use]
    pub fn with_data(mut self, data: DataReadings) -> Self {
        self.data = data;
        self
    }

    /// Plans the changes that take `snapshot` to `graph`.
    ///
    /// # Errors
    ///
    /// Returns `PlanError` if a record has an unregistered type, a schema
    /// version newer than the registry's, or recorded dependencies that form
    /// a cycle.
    pub fn plan(&self, graph: &DependencyGraph, snapshot: &StateSnapshot) -> Result<Plan> {
        self.check_records(snapshot)?;

        let mut changes = Vec::with_capacity(graph.len() + snapshot.len());
        let mut planned_actions: HashMap<ResourceAddress, ChangeAction> = HashMap::new();

        for node in graph.nodes().filter(|node| !node.address.is_data()) {
            let change = self.plan_node(node, snapshot, &planned_actions)?;
            debug!("Planned {change}");
            planned_actions.insert(change.address.clone(), change.action);
            changes.push(change);
        }

        changes.extend(Self::plan_destroys(graph, snapshot)?);

        let plan = Plan::new(graph.document_hash(), snapshot.version, changes).with_data(self.data.clone());
        info!("Plan {}: {}", plan.id, plan.summary());
        Ok(plan)
    }

    /// Plans destroying every recorded resource.
    ///
    /// # Errors
    ///
    /// Same as [`Self::plan`].
    pub fn plan_destroy(&self, snapshot: &StateSnapshot) -> Result<Plan> {
        self.plan(&DependencyGraph::empty(), snapshot)
    }

    /// Rejects records the registry cannot interpret.
    fn check_records(&self, snapshot: &StateSnapshot) -> Result<()> {
        for record in snapshot.records.values() {
            let resource_type = record.address.resource_type();
            let Some(schema) = self.registry.schema(resource_type) else {
                return Err(PlanError::UnknownResourceType {
                    address: record.address.to_string(),
                    resource_type: resource_type.to_string(),
                }
                .into());
            };

            if record.schema_version > schema.version {
                return Err(PlanError::SchemaVersionAhead {
                    address: record.address.to_string(),
                    recorded: record.schema_version,
                    supported: schema.version,
                }
                .into());
            }
        }
        Ok(())
    }

    /// Plans one declared resource.
    fn plan_node(
        &self,
        node: &DesiredStateNode,
        snapshot: &StateSnapshot,
        planned_actions: &HashMap<ResourceAddress, ChangeAction>,
    ) -> Result<PlannedChange> {
        let schema = self.schema_for(&node.address)?;
        let desired = self.bind_data(node)?;
        let planned = resolve_planned(&desired, snapshot, planned_actions);
        let prior = snapshot.get(&node.address).cloned();

        let (action, diffs, reason) = match &prior {
            None => (
                ChangeAction::Create,
                self.diff.diff_new(schema, &planned),
                String::from("not recorded in state"),
            ),
            Some(record) => {
                let diffs = self.diff.diff(schema, &planned, record);
                if diffs.is_empty() {
                    (ChangeAction::NoOp, diffs, String::from("up to date"))
                } else if DiffEngine::requires_replace(&diffs) {
                    let forcing: Vec<&str> = diffs
                        .iter()
                        .filter(|d| d.force_new)
                        .map(|d| d.attribute.as_str())
                        .collect();
                    let reason = format!("{} forces replacement", forcing.join(", "));
                    (ChangeAction::Replace, diffs, reason)
                } else {
                    let changed: Vec<&str> = diffs.iter().map(|d| d.attribute.as_str()).collect();
                    let reason = format!("{} changed", changed.join(", "));
                    (ChangeAction::Update, diffs, reason)
                }
            }
        };

        Ok(PlannedChange {
            address: node.address.clone(),
            action,
            reason,
            dependencies: node
                .dependencies
                .iter()
                .filter(|dependency| !dependency.is_data())
                .cloned()
                .collect(),
            desired,
            prior,
            diffs,
        })
    }

    /// Plans destroys of undeclared records, dependents first.
    fn plan_destroys(graph: &DependencyGraph, snapshot: &StateSnapshot) -> Result<Vec<PlannedChange>> {
        let orphans: Vec<ResourceAddress> = snapshot
            .records
            .keys()
            .filter(|address| !graph.contains(address))
            .cloned()
            .collect();

        if orphans.is_empty() {
            return Ok(Vec::new());
        }

        let dependencies: BTreeMap<ResourceAddress, BTreeSet<ResourceAddress>> = orphans
            .iter()
            .filter_map(|address| snapshot.get(address))
            .map(|record| {
                (
                    record.address.clone(),
                    record.dependencies.iter().cloned().collect(),
                )
            })
            .collect();

        let mut order = stable_topological_sort(&orphans, &dependencies).map_err(|members| {
            PlanError::RecordedCycle {
                members: members.iter().map(ToString::to_string).collect(),
            }
        })?;
        order.reverse();

        let destroyed: BTreeSet<&ResourceAddress> = orphans.iter().collect();
        let changes = order
            .into_iter()
            .map(|address| {
                // Destroy after every destroyed resource that depended on this one.
                let waits_for: Vec<ResourceAddress> = dependencies
                    .iter()
                    .filter(|(other, deps)| destroyed.contains(other) && deps.contains(&address))
                    .map(|(other, _)| other.clone())
                    .collect();

                PlannedChange {
                    prior: snapshot.get(&address).cloned(),
                    address,
                    action: ChangeAction::Destroy,
                    reason: String::from("no longer declared"),
                    dependencies: waits_for,
                    desired: BTreeMap::new(),
                    diffs: Vec::new(),
                }
            })
            .collect();

        Ok(changes)
    }

    /// Replaces data source references with the values read for them.
    fn bind_data(&self, node: &DesiredStateNode) -> Result<ParsedAttributes> {
        let mut bound = ParsedAttributes::new();
        for (name, value) in &node.attributes {
            let value = match value {
                AttributeValue::Reference(reference) if reference.address.is_data() => {
                    let unresolved = |reason: &str| GraphError::UnresolvedReference {
                        address: node.address.to_string(),
                        reference: reference.to_string(),
                        reason: reason.to_string(),
                    };
                    let reading = self
                        .data
                        .get(&reference.address)
                        .ok_or_else(|| unresolved("data source has not been read"))?;
                    let literal = reading
                        .get(&reference.attribute)
                        .ok_or_else(|| unresolved("data source returned no such attribute"))?;
                    AttributeValue::Literal(literal.clone())
                }
                other => other.clone(),
            };
            bound.insert(name.clone(), value);
        }
        Ok(bound)
    }

    fn schema_for(&self, address: &ResourceAddress) -> Result<&'a ResourceSchema> {
        self.registry.schema(address.resource_type()).ok_or_else(|| {
            ConvergeError::internal(format!(
                "graph contains {address} but its type is not registered"
            ))
        })
    }
}

/// Resolves a node's desired attributes to planned values.
///
/// References to a resource that is being created or replaced are unknown
/// until apply; otherwise the dependency's recorded value is used.
fn resolve_planned(
    desired: &ParsedAttributes,
    snapshot: &StateSnapshot,
    planned_actions: &HashMap<ResourceAddress, ChangeAction>,
) -> PlannedAttributes {
    desired
        .iter()
        .map(|(name, value)| {
            let planned = match value {
                AttributeValue::Literal(literal) => PlannedValue::Known(literal.clone()),
                AttributeValue::Reference(reference) => {
                    let pending = matches!(
                        planned_actions.get(&reference.address),
                        Some(ChangeAction::Create | ChangeAction::Replace) | None
                    );
                    let recorded = snapshot
                        .get(&reference.address)
                        .and_then(|record| record.attribute(&reference.attribute));

                    match (pending, recorded) {
                        (false, Some(value)) => PlannedValue::Known(value.clone()),
                        _ => PlannedValue::Unknown(reference.to_string()),
                    }
                }
            };
            (name.clone(), planned)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{DesiredStateDocument, GraphBuilder};
    use crate::registry::{AttributeSchema, AttributeType, MockDataSourceOperations, MockRemoteOperations};
    use crate::state::{AttributeMap, RemoteStateRecord};
    use serde_json::json;
    use std::sync::Arc;

    fn registry() -> ResourceRegistry {
        let environment = ResourceSchema::new("kx_environment", 1)
            .with_attribute("name", AttributeSchema::required(AttributeType::String).with_force_new())
            .with_attribute("description", AttributeSchema::optional(AttributeType::String))
            .with_attribute("id", AttributeSchema::computed(AttributeType::String));
        let database = ResourceSchema::new("kx_database", 2)
            .with_attribute("name", AttributeSchema::required(AttributeType::String).with_force_new())
            .with_attribute(
                "environment_id",
                AttributeSchema::required(AttributeType::String).with_force_new(),
            )
            .with_attribute("description", AttributeSchema::optional(AttributeType::String))
            .with_attribute("arn", AttributeSchema::computed(AttributeType::String));

        let identity = ResourceSchema::new("caller_identity", 1)
            .with_attribute("account_id", AttributeSchema::computed(AttributeType::String));

        ResourceRegistry::new()
            .with_type(environment, Arc::new(MockRemoteOperations::new()))
            .with_type(database, Arc::new(MockRemoteOperations::new()))
            .with_data_source(identity, Arc::new(MockDataSourceOperations::new()))
    }

    fn attrs(pairs: &[(&str, serde_json::Value)]) -> AttributeMap {
        pairs.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect()
    }

    fn address(text: &str) -> ResourceAddress {
        text.parse().expect("valid address")
    }

    fn document() -> DesiredStateDocument {
        DesiredStateDocument::new()
            .with_resource("kx_environment", "env", attrs(&[("name", json!("env"))]))
            .with_resource(
                "kx_database",
                "db",
                attrs(&[
                    ("name", json!("db")),
                    ("environment_id", json!("${kx_environment.env.id}")),
                ]),
            )
    }

    fn recorded(snapshot: &mut StateSnapshot, text: &str, attributes: AttributeMap, deps: &[&str]) {
        snapshot.version += 1;
        let mut record = RemoteStateRecord::new(address(text), format!("{text}-id"), attributes, 1)
            .with_dependencies(deps.iter().map(|d| address(d)).collect());
        record.version = snapshot.version;
        snapshot.records.insert(record.address.clone(), record);
    }

    fn converged_snapshot() -> StateSnapshot {
        let mut snapshot = StateSnapshot::default();
        recorded(&mut snapshot, "kx_environment.env", attrs(&[("name", json!("env")), ("id", json!("env-1"))]), &[]);
        recorded(
            &mut snapshot,
            "kx_database.db",
            attrs(&[("name", json!("db")), ("environment_id", json!("env-1")), ("arn", json!("arn:db"))]),
            &["kx_environment.env"],
        );
        snapshot
    }

    #[test]
    fn test_empty_state_creates_in_order() {
        let registry = registry();
        let graph = GraphBuilder::new(&registry).build(&document()).expect("graph");

        let plan = Planner::new(&registry)
            .plan(&graph, &StateSnapshot::default())
            .expect("plan");

        assert_eq!(
            plan.actions(),
            vec![
                (ChangeAction::Create, String::from("kx_environment.env")),
                (ChangeAction::Create, String::from("kx_database.db")),
            ]
        );
        let db = plan.change(&address("kx_database.db")).expect("db change");
        assert!(matches!(
            db.diffs.iter().find(|d| d.attribute == "environment_id").map(|d| &d.after),
            Some(PlannedValue::Unknown(_))
        ));
        assert_eq!(plan.base_version, 0);
    }

    #[test]
    fn test_converged_state_is_noop() {
        let registry = registry();
        let graph = GraphBuilder::new(&registry).build(&document()).expect("graph");

        let plan = Planner::new(&registry)
            .plan(&graph, &converged_snapshot())
            .expect("plan");

        assert!(plan.is_converged());
        assert_eq!(plan.changes.len(), 2);
        assert_eq!(plan.base_version, 2);
    }

    #[test]
    fn test_description_change_is_update() {
        let registry = registry();
        let mut document = document();
        if let Some(block) = document.get_mut("kx_database.db") {
            block.attributes.insert(String::from("description"), json!("second"));
        }
        let graph = GraphBuilder::new(&registry).build(&document).expect("graph");

        let plan = Planner::new(&registry)
            .plan(&graph, &converged_snapshot())
            .expect("plan");

        assert_eq!(plan.actions(), vec![(ChangeAction::Update, String::from("kx_database.db"))]);
    }

    #[test]
    fn test_replaced_dependency_propagates_unknown() {
        let registry = registry();
        let mut document = document();
        if let Some(block) = document.get_mut("kx_environment.env") {
            block.attributes.insert(String::from("name"), json!("renamed"));
        }
        let graph = GraphBuilder::new(&registry).build(&document).expect("graph");

        let plan = Planner::new(&registry)
            .plan(&graph, &converged_snapshot())
            .expect("plan");

        assert_eq!(
            plan.actions(),
            vec![
                (ChangeAction::Replace, String::from("kx_environment.env")),
                (ChangeAction::Replace, String::from("kx_database.db")),
            ]
        );
    }

    #[test]
    fn test_removed_block_is_destroyed() {
        let registry = registry();
        let mut document = document();
        document.remove("kx_database.db");
        let graph = GraphBuilder::new(&registry).build(&document).expect("graph");

        let plan = Planner::new(&registry)
            .plan(&graph, &converged_snapshot())
            .expect("plan");

        assert_eq!(plan.actions(), vec![(ChangeAction::Destroy, String::from("kx_database.db"))]);
    }

    #[test]
    fn test_destroy_all_orders_dependents_first() {
        let registry = registry();
        let plan = Planner::new(&registry)
            .plan_destroy(&converged_snapshot())
            .expect("plan");

        assert_eq!(
            plan.actions(),
            vec![
                (ChangeAction::Destroy, String::from("kx_database.db")),
                (ChangeAction::Destroy, String::from("kx_environment.env")),
            ]
        );
        let env = plan.change(&address("kx_environment.env")).expect("env change");
        assert_eq!(env.dependencies, vec![address("kx_database.db")]);
    }

    #[test]
    fn test_unregistered_record_type() {
        let registry = registry();
        let mut snapshot = StateSnapshot::default();
        recorded(&mut snapshot, "kx_cluster.c", AttributeMap::new(), &[]);

        let err = Planner::new(&registry).plan_destroy(&snapshot).expect_err("unknown type");
        assert!(matches!(
            err,
            ConvergeError::Plan(PlanError::UnknownResourceType { .. })
        ));
    }

    #[test]
    fn test_schema_version_ahead() {
        let registry = registry();
        let mut snapshot = converged_snapshot();
        if let Some(record) = snapshot.records.get_mut(&address("kx_environment.env")) {
            record.schema_version = 9;
        }

        let err = Planner::new(&registry).plan_destroy(&snapshot).expect_err("ahead");
        assert!(matches!(
            err,
            ConvergeError::Plan(PlanError::SchemaVersionAhead { recorded: 9, supported: 1, .. })
        ));
    }

    #[test]
    fn test_recorded_cycle() {
        let registry = registry();
        let mut snapshot = StateSnapshot::default();
        recorded(&mut snapshot, "kx_environment.a", AttributeMap::new(), &["kx_environment.b"]);
        recorded(&mut snapshot, "kx_environment.b", AttributeMap::new(), &["kx_environment.a"]);

        let err = Planner::new(&registry).plan_destroy(&snapshot).expect_err("cycle");
        assert!(matches!(err, ConvergeError::Plan(PlanError::RecordedCycle { .. })));
    }

    #[test]
    fn test_data_reference_binds_to_reading() {
        let registry = registry();
        let mut document = document();
        document = document.with_data("caller_identity", "current", AttributeMap::new());
        if let Some(block) = document.get_mut("kx_environment.env") {
            block
                .attributes
                .insert(String::from("description"), json!("${data.caller_identity.current.account_id}"));
        }
        let graph = GraphBuilder::new(&registry).build(&document).expect("graph");

        let err = Planner::new(&registry)
            .plan(&graph, &converged_snapshot())
            .expect_err("unread data source");
        assert!(err.to_string().contains("has not been read"));

        let readings = DataReadings::from([(
            address("data.caller_identity.current"),
            attrs(&[("account_id", json!("123456789012"))]),
        )]);
        let plan = Planner::new(&registry)
            .with_data(readings)
            .plan(&graph, &converged_snapshot())
            .expect("plan");

        assert_eq!(plan.actions(), vec![(ChangeAction::Update, String::from("kx_environment.env"))]);
        assert!(plan.change(&address("data.caller_identity.current")).is_none());
        let env = plan.change(&address("kx_environment.env")).expect("env change");
        assert!(env.dependencies.is_empty());
        assert_eq!(
            env.diffs[0].after,
            PlannedValue::Known(json!("123456789012"))
        );
        assert_eq!(plan.data.len(), 1);
    }
}
