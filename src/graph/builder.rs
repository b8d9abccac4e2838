//! Dependency graph construction.
//!
//! Nodes are linked by their attribute references. The graph is ordered
//! once with Kahn's algorithm; ties are broken by declaration order so the
//! same document always yields the same plan. Data blocks are nodes too, so
//! a resource that reads a data source is ordered after it.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};
use tracing::{debug, info, warn};

use crate::error::{GraphError, Result};
use crate::registry::ResourceRegistry;
use crate::state::ResourceAddress;

use super::document::{AttributeValue, DesiredStateDocument, ParsedAttributes, Reference};
use super::hash::DocumentHasher;
use super::validator::DocumentValidator;

/// A declared resource with parsed attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredStateNode {
    /// Address of the resource.
    pub address: ResourceAddress,
    /// Position in the document.
    pub index: usize,
    /// Desired attributes.
    pub attributes: ParsedAttributes,
    /// Resources this node references.
    pub dependencies: BTreeSet<ResourceAddress>,
    /// Fingerprint of the declaring block.
    pub hash: String,
}

impl DesiredStateNode {
    /// Iterates over `(attribute, reference)` pairs.
    pub fn references(&self) -> impl Iterator<Item = (&str, &Reference)> {
        self.attributes
            .iter()
            .filter_map(|(name, value)| value.as_reference().map(|r| (name.as_str(), r)))
    }
}

/// Validated, acyclic graph of desired resources.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: BTreeMap<ResourceAddress, DesiredStateNode>,
    order: Vec<ResourceAddress>,
    dependents: BTreeMap<ResourceAddress, BTreeSet<ResourceAddress>>,
    document_hash: String,
}

impl DependencyGraph {
    /// Creates a graph with no nodes; planning against it destroys everything.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            document_hash: DocumentHasher::new().hash_document(&DesiredStateDocument::new()),
            ..Self::default()
        }
    }

    /// Gets a node by address.
    #[must_use]
    pub fn node(&self, address: &ResourceAddress) -> Option<&DesiredStateNode> {
        self.nodes.get(address)
    }

    /// Returns true if the address is declared.
    #[must_use]
    pub fn contains(&self, address: &ResourceAddress) -> bool {
        self.nodes.contains_key(address)
    }

    /// Addresses in topological order.
    #[must_use]
    pub fn order(&self) -> &[ResourceAddress] {
        &self.order
    }

    /// Nodes in topological order.
    pub fn nodes(&self) -> impl Iterator<Item = &DesiredStateNode> {
        self.order.iter().filter_map(|address| self.nodes.get(address))
    }

    /// Nodes that reference the given address.
    #[must_use]
    pub fn dependents(&self, address: &ResourceAddress) -> Option<&BTreeSet<ResourceAddress>> {
        self.dependents.get(address)
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if nothing is declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Fingerprint of the source document.
    #[must_use]
    pub fn document_hash(&self) -> &str {
        &self.document_hash
    }
}

/// Builds dependency graphs against a registry.
#[derive(Debug)]
pub struct GraphBuilder<'a> {
    registry: &'a ResourceRegistry,
    hasher: DocumentHasher,
}

impl<'a> GraphBuilder<'a> {
    /// Creates a builder.
    #[must_use]
    pub const fn new(registry: &'a ResourceRegistry) -> Self {
        Self {
            registry,
            hasher: DocumentHasher::new(),
        }
    }

    /// Validates a document and builds its graph.
    ///
    /// # Errors
    ///
    /// Returns a schema validation error, `UnresolvedReference` or
    /// `CycleDetected`.
    pub fn build(&self, document: &DesiredStateDocument) -> Result<DependencyGraph> {
        let validation = DocumentValidator::new(self.registry).validate(document)?;
        for warning in &validation.warnings {
            warn!("{warning}");
        }

        let mut nodes = BTreeMap::new();
        let mut declared = Vec::with_capacity(document.data.len() + document.resources.len());

        for (index, (mode, block)) in document.blocks().enumerate() {
            let address = block.address(mode)?;

            let mut attributes = ParsedAttributes::new();
            for (name, raw) in &block.attributes {
                attributes.insert(name.clone(), AttributeValue::parse(&address, name, raw)?);
            }

            let dependencies = attributes
                .values()
                .filter_map(AttributeValue::as_reference)
                .map(|reference| reference.address.clone())
                .collect();

            declared.push(address.clone());
            nodes.insert(
                address.clone(),
                DesiredStateNode {
                    address,
                    index,
                    attributes,
                    dependencies,
                    hash: self.hasher.hash_block(block),
                },
            );
        }

        self.resolve_references(&nodes)?;

        let dependencies: BTreeMap<_, _> = nodes
            .iter()
            .map(|(address, node)| (address.clone(), node.dependencies.clone()))
            .collect();

        let order = stable_topological_sort(&declared, &dependencies)
            .map_err(|remaining| GraphError::CycleDetected {
                cycle: find_cycle(&declared, &remaining, &dependencies),
            })?;

        let mut dependents: BTreeMap<ResourceAddress, BTreeSet<ResourceAddress>> = BTreeMap::new();
        for node in nodes.values() {
            for dependency in &node.dependencies {
                dependents
                    .entry(dependency.clone())
                    .or_default()
                    .insert(node.address.clone());
            }
        }

        info!("Built dependency graph with {} node(s)", nodes.len());
        debug!(
            "Topological order: {}",
            order.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
        );

        Ok(DependencyGraph {
            nodes,
            order,
            dependents,
            document_hash: self.hasher.hash_document(document),
        })
    }

    /// Checks every reference targets a declared attribute that is known
    /// at plan time or after its target is applied.
    ///
    /// Managed targets must expose a computed attribute; any attribute of
    /// a data source may be referenced. Data blocks may only reference
    /// other data blocks, since they are read before anything is applied.
    fn resolve_references(&self, nodes: &BTreeMap<ResourceAddress, DesiredStateNode>) -> Result<()> {
        for node in nodes.values() {
            for (_, reference) in node.references() {
                let unresolved = |reason: String| GraphError::UnresolvedReference {
                    address: node.address.to_string(),
                    reference: reference.to_string(),
                    reason,
                };

                if !nodes.contains_key(&reference.address) {
                    return Err(unresolved(format!(
                        "no resource is declared at {}",
                        reference.address
                    ))
                    .into());
                }

                if node.address.is_data() && !reference.address.is_data() {
                    return Err(unresolved(String::from(
                        "data sources may only reference other data sources",
                    ))
                    .into());
                }

                let target_type = reference.address.resource_type();
                let computed = self
                    .registry
                    .schema_for(&reference.address)
                    .and_then(|schema| schema.attribute(&reference.attribute))
                    .map(|attribute| attribute.computed || reference.address.is_data());

                match computed {
                    Some(true) => {}
                    Some(false) => {
                        return Err(unresolved(format!(
                            "'{}' of {target_type} is not a computed attribute",
                            reference.attribute
                        ))
                        .into());
                    }
                    None => {
                        return Err(unresolved(format!(
                            "{target_type} has no attribute '{}'",
                            reference.attribute
                        ))
                        .into());
                    }
                }
            }
        }
        Ok(())
    }
}

/// Orders `keys` so every key follows its dependencies.
///
/// Ties are broken by position in `keys`. Dependencies outside `keys` are
/// ignored. On a cycle, returns the keys that could not be ordered.
pub(crate) fn stable_topological_sort(
    keys: &[ResourceAddress],
    dependencies: &BTreeMap<ResourceAddress, BTreeSet<ResourceAddress>>,
) -> std::result::Result<Vec<ResourceAddress>, Vec<ResourceAddress>> {
    let position: HashMap<&ResourceAddress, usize> =
        keys.iter().enumerate().map(|(i, key)| (key, i)).collect();

    let mut in_degree = vec![0usize; keys.len()];
    let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); keys.len()];

    for (i, key) in keys.iter().enumerate() {
        let Some(deps) = dependencies.get(key) else {
            continue;
        };
        for dependency in deps {
            if let Some(&j) = position.get(dependency) {
                adjacency[j].push(i);
                in_degree[i] += 1;
            }
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, degree)| **degree == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut order = Vec::with_capacity(keys.len());
    while let Some(Reverse(current)) = ready.pop() {
        order.push(keys[current].clone());
        for &next in &adjacency[current] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.push(Reverse(next));
            }
        }
    }

    if order.len() == keys.len() {
        Ok(order)
    } else {
        Err(keys
            .iter()
            .enumerate()
            .filter(|(i, _)| in_degree[*i] > 0)
            .map(|(_, key)| key.clone())
            .collect())
    }
}

/// Walks dependency edges among unordered nodes until one repeats.
///
/// Every unordered node has an unordered dependency, so the walk always
/// closes. The result starts and ends with the same address.
fn find_cycle(
    declared: &[ResourceAddress],
    remaining: &[ResourceAddress],
    dependencies: &BTreeMap<ResourceAddress, BTreeSet<ResourceAddress>>,
) -> Vec<String> {
    let remaining: BTreeSet<&ResourceAddress> = remaining.iter().collect();
    let position: HashMap<&ResourceAddress, usize> =
        declared.iter().enumerate().map(|(i, key)| (key, i)).collect();

    let Some(start) = declared.iter().find(|address| remaining.contains(address)) else {
        return Vec::new();
    };

    let mut path: Vec<&ResourceAddress> = vec![start];
    let mut seen: HashMap<&ResourceAddress, usize> = HashMap::from([(start, 0)]);
    let mut current = start;

    loop {
        let next = dependencies
            .get(current)
            .into_iter()
            .flatten()
            .filter(|dependency| remaining.contains(dependency))
            .min_by_key(|dependency| position.get(dependency).copied().unwrap_or(usize::MAX));

        let Some(next) = next else {
            return path.iter().map(ToString::to_string).collect();
        };

        if let Some(&first) = seen.get(next) {
            let mut cycle: Vec<String> = path[first..].iter().map(ToString::to_string).collect();
            cycle.push(next.to_string());
            return cycle;
        }

        seen.insert(next, path.len());
        path.push(next);
        current = next;
    }
}
