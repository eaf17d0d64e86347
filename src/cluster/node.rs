//! Node resource - a machine in the cluster that can host cache workers
//!
//! Placement state for cache runtimes lives entirely in node labels, so the
//! node is the object the placement labeler reads and writes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::resources::ObjectMeta;

/// A Node in the cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Metadata about the node (labels carry placement state)
    pub metadata: ObjectMeta,

    /// Desired node configuration
    #[serde(default)]
    pub spec: NodeSpec,

    /// Current node status
    #[serde(default)]
    pub status: NodeStatus,
}

/// Desired node configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Whether the node is cordoned
    #[serde(default)]
    pub unschedulable: bool,
}

/// Current status of a Node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    /// Whether the node reports Ready
    #[serde(default = "default_true")]
    pub ready: bool,

    /// Allocatable memory in bytes
    #[serde(rename = "allocatableMemory")]
    #[serde(default)]
    pub allocatable_memory: u64,
}

impl Default for NodeStatus {
    fn default() -> Self {
        Self {
            ready: true,
            allocatable_memory: 0,
        }
    }
}

fn default_true() -> bool {
    true
}

impl Node {
    /// Create a new ready, schedulable node
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta::cluster_scoped(name),
            spec: NodeSpec::default(),
            status: NodeStatus::default(),
        }
    }

    /// Add a label
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.labels.insert(key.into(), value.into());
        self
    }

    /// Mark as unschedulable (cordon)
    pub fn cordon(mut self) -> Self {
        self.spec.unschedulable = true;
        self
    }

    /// Node name
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Node labels
    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.metadata.labels
    }

    /// Check if node can accept new workloads
    pub fn can_schedule(&self) -> bool {
        self.status.ready && !self.spec.unschedulable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_node() {
        let node = Node::new("node-1");

        assert_eq!(node.name(), "node-1");
        assert!(node.metadata.namespace.is_empty());
        assert!(node.can_schedule());
    }

    #[test]
    fn test_node_builder() {
        let node = Node::new("gpu-node").with_label("fluid.io/dataset-num", "1");
        assert_eq!(
            node.labels().get("fluid.io/dataset-num"),
            Some(&"1".to_string())
        );
    }

    #[test]
    fn test_cordon() {
        let node = Node::new("node").cordon();
        assert!(!node.can_schedule());
    }

    #[test]
    fn test_deserialize_defaults() {
        let node: Node = serde_yaml::from_str("metadata:\n  name: n1\n").unwrap();
        assert!(node.status.ready);
        assert!(!node.spec.unschedulable);
        assert!(node.labels().is_empty());
    }
}
