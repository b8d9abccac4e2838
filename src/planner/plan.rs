//! Plan types.
//!
//! A plan is an ordered change-set built against one state snapshot. It
//! records the snapshot's store version so that applying it after the store
//! moved on is rejected.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::graph::AttributeValue;
use crate::state::{AttributeMap, RemoteStateRecord, ResourceAddress};

use super::diff::AttributeDiff;

/// A complete plan.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    /// Unique plan identifier.
    pub id: Uuid,
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Fingerprint of the desired-state document.
    pub document_hash: String,
    /// Store version of the snapshot the plan was built from.
    pub base_version: u64,
    /// Changes in execution order: declared resources topologically, then
    /// destroys in reverse dependency order.
    pub changes: Vec<PlannedChange>,
    /// Data source results the plan was bound against.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub data: DataReadings,
}

/// Results of data source reads, by data address.
pub type DataReadings = BTreeMap<ResourceAddress, AttributeMap>;

/// A single planned change.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedChange {
    /// Address of the resource.
    pub address: ResourceAddress,
    /// Action to take.
    pub action: ChangeAction,
    /// Why the action was chosen.
    pub reason: String,
    /// Addresses whose changes must finish first.
    pub dependencies: Vec<ResourceAddress>,
    /// Desired attributes, references unresolved; empty for destroys.
    pub desired: BTreeMap<String, AttributeValue>,
    /// Recorded state the change was planned against.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prior: Option<RemoteStateRecord>,
    /// Attribute differences.
    pub diffs: Vec<AttributeDiff>,
}

/// Types of change in a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    /// Nothing to do.
    NoOp,
    /// Create a new resource.
    Create,
    /// Update attributes in place.
    Update,
    /// Destroy then create, as one step.
    Replace,
    /// Destroy a resource no longer declared.
    Destroy,
}

/// Change counts by action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    /// Creates.
    pub create: usize,
    /// In-place updates.
    pub update: usize,
    /// Replacements.
    pub replace: usize,
    /// Destroys.
    pub destroy: usize,
    /// Unchanged resources.
    pub no_op: usize,
}

impl Plan {
    /// Creates a plan.
    #[must_use]
    pub fn new(document_hash: impl Into<String>, base_version: u64, changes: Vec<PlannedChange>) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            document_hash: document_hash.into(),
            base_version,
            changes,
            data: DataReadings::new(),
        }
    }

    /// Attaches the data source results the plan was bound against.
    #[must_use]
    pub fn with_data(mut self, data: DataReadings) -> Self {
        self.data = data;
        self
    }

    /// Returns changes that do something.
    #[must_use]
    pub fn actionable(&self) -> Vec<&PlannedChange> {
        self.changes
            .iter()
            .filter(|change| change.action != ChangeAction::NoOp)
            .collect()
    }

    /// Returns true if every change is a no-op.
    #[must_use]
    pub fn is_converged(&self) -> bool {
        self.changes.iter().all(|change| change.action == ChangeAction::NoOp)
    }

    /// Gets the change for an address.
    #[must_use]
    pub fn change(&self, address: &ResourceAddress) -> Option<&PlannedChange> {
        self.changes.iter().find(|change| &change.address == address)
    }

    /// Lists `(action, address)` pairs of actionable changes in order.
    #[must_use]
    pub fn actions(&self) -> Vec<(ChangeAction, String)> {
        self.actionable()
            .into_iter()
            .map(|change| (change.action, change.address.to_string()))
            .collect()
    }

    /// Counts changes by action.
    #[must_use]
    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for change in &self.changes {
            match change.action {
                ChangeAction::NoOp => summary.no_op += 1,
                ChangeAction::Create => summary.create += 1,
                ChangeAction::Update => summary.update += 1,
                ChangeAction::Replace => summary.replace += 1,
                ChangeAction::Destroy => summary.destroy += 1,
            }
        }
        summary
    }
}

impl PlannedChange {
    /// Returns a human-readable description of the change.
    #[must_use]
    pub fn description(&self) -> String {
        match self.action {
            ChangeAction::NoOp => format!("No change for {}", self.address),
            ChangeAction::Create => format!("Create {}", self.address),
            ChangeAction::Update => format!("Update {} in place", self.address),
            ChangeAction::Replace => format!("Replace {}", self.address),
            ChangeAction::Destroy => format!("Destroy {}", self.address),
        }
    }
}

impl ChangeAction {
    /// Returns true if the action removes the remote object at some point.
    #[must_use]
    pub const fn is_destructive(self) -> bool {
        matches!(self, Self::Replace | Self::Destroy)
    }

    /// Symbol used in rendered plans.
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::NoOp => " ",
            Self::Create => "+",
            Self::Update => "~",
            Self::Replace => "-/+",
            Self::Destroy => "-",
        }
    }
}

impl PlanSummary {
    /// Number of changes that do something.
    #[must_use]
    pub const fn total_changes(&self) -> usize {
        self.create + self.update + self.replace + self.destroy
    }
}

impl std::fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NoOp => "no-op",
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Destroy => "destroy",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for PlannedChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.action, self.address)?;
        if !self.reason.is_empty() {
            write!(f, " ({})", self.reason)?;
        }
        Ok(())
    }
}

impl std::fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to replace, {} to destroy",
            self.create, self.update, self.replace, self.destroy
        )
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_converged() {
            return write!(f, "No changes required");
        }

        let actionable = self.actionable();
        writeln!(f, "Plan ({} changes):", actionable.len())?;
        for (i, change) in actionable.iter().enumerate() {
            writeln!(f, "  {i}. {change}")?;
            for diff in &change.diffs {
                writeln!(f, "       {diff}")?;
            }
        }
        write!(f, "{}", self.summary())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(name: &str, action: ChangeAction) -> PlannedChange {
        PlannedChange {
            address: ResourceAddress::new("kx_database", name).expect("valid"),
            action,
            reason: String::new(),
            dependencies: Vec::new(),
            desired: BTreeMap::new(),
            prior: None,
            diffs: Vec::new(),
        }
    }

    #[test]
    fn test_summary_and_actionable() {
        let plan = Plan::new(
            "hash",
            3,
            vec![
                change("a", ChangeAction::NoOp),
                change("b", ChangeAction::Create),
                change("c", ChangeAction::Destroy),
            ],
        );

        let summary = plan.summary();
        assert_eq!(summary.no_op, 1);
        assert_eq!(summary.total_changes(), 2);
        assert!(!plan.is_converged());
        assert_eq!(
            plan.actions(),
            vec![
                (ChangeAction::Create, String::from("kx_database.b")),
                (ChangeAction::Destroy, String::from("kx_database.c")),
            ]
        );
    }

    #[test]
    fn test_converged_display() {
        let plan = Plan::new("hash", 0, vec![change("a", ChangeAction::NoOp)]);
        assert!(plan.is_converged());
        assert_eq!(plan.to_string(), "No changes required");
    }

    #[test]
    fn test_plan_serializes() {
        let plan = Plan::new("hash", 1, vec![change("a", ChangeAction::Replace)]);
        let json = serde_json::to_value(&plan).expect("serialize");
        assert_eq!(json["changes"][0]["action"], "replace");
        assert_eq!(json["changes"][0]["address"], "kx_database.a");
    }
}
