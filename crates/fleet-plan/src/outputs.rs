//! Output table: provider identifiers produced by apply, keyed by node id.

use crate::node::OutputRef;
use crate::secret::SecretStore;
use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Named outputs of a single node (`arn`, `name`, `endpoint`, ...).
pub type NodeOutputs = BTreeMap<String, String>;

/// Resolved identifiers of every applied node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutputTable {
    nodes: BTreeMap<NodeId, NodeOutputs>,
}

impl OutputTable {
    /// Empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a node's outputs
    pub fn insert(&mut self, node: NodeId, outputs: NodeOutputs) {
        self.nodes.insert(node, outputs);
    }

    /// Outputs of a node
    #[must_use]
    pub fn node(&self, node: &NodeId) -> Option<&NodeOutputs> {
        self.nodes.get(node)
    }

    /// A single output value
    #[must_use]
    pub fn get(&self, node: &NodeId, key: &str) -> Option<&str> {
        self.nodes.get(node)?.get(key).map(String::as_str)
    }

    /// Resolve an output reference
    #[must_use]
    pub fn resolve(&self, output: &OutputRef) -> Option<&str> {
        self.get(&output.node, &output.key)
    }

    /// Drop a node's outputs
    pub fn remove(&mut self, node: &NodeId) -> Option<NodeOutputs> {
        self.nodes.remove(node)
    }

    /// Iterate in node id order
    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &NodeOutputs)> {
        self.nodes.iter()
    }

    /// Number of nodes with outputs
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when nothing was recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Scrub any registered secret value from every output.
    pub fn redact(&mut self, secrets: &SecretStore) {
        for outputs in self.nodes.values_mut() {
            for value in outputs.values_mut() {
                if secrets.leaks_into(value) {
                    tracing::warn!("secret value found in provider output; redacted");
                    *value = secrets.redact(value);
                }
            }
        }
    }

    /// Render as `node.key = value` lines, one per output.
    #[must_use]
    pub fn to_lines(&self) -> Vec<String> {
        self.nodes
            .iter()
            .flat_map(|(node, outputs)| {
                outputs
                    .iter()
                    .map(move |(key, value)| format!("{node}.{key} = {value}"))
            })
            .collect()
    }
}
