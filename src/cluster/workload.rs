//! Workloads, pods, config maps and releases
//!
//! These are the minimal shapes the lifecycle core reads and writes: replica
//! counts and affinity on workloads, node placement on pods, string data on
//! config maps, and rendered values on releases.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::resources::{ObjectMeta, OwnerReference};
use crate::placement::affinity::WorkerAffinity;

/// Kind of a replicated workload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkloadKind {
    /// Ordered, per-replica identity; the modern worker form
    StatefulSet,
    /// One pod per selected node; the legacy worker form and the fuse form
    DaemonSet,
}

/// A replicated workload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workload {
    /// Metadata
    pub metadata: ObjectMeta,

    /// Workload kind
    pub kind: WorkloadKind,

    /// Desired state
    #[serde(default)]
    pub spec: WorkloadSpec,

    /// Observed state
    #[serde(default)]
    pub status: WorkloadStatus,
}

/// Desired workload state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkloadSpec {
    /// Desired replicas (StatefulSet only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicas: Option<u32>,

    /// Labels stamped onto the workload's pods
    #[serde(rename = "podLabels")]
    #[serde(default)]
    pub pod_labels: BTreeMap<String, String>,

    /// Node selector (DaemonSet placement)
    #[serde(rename = "nodeSelector")]
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,

    /// Scheduling affinity for the workload's pods
    #[serde(skip_serializing_if = "Option::is_none")]
    pub affinity: Option<WorkerAffinity>,
}

/// Observed workload state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkloadStatus {
    /// Pods the controller currently manages
    #[serde(default)]
    pub replicas: u32,

    /// Pods reporting ready
    #[serde(rename = "readyReplicas")]
    #[serde(default)]
    pub ready_replicas: u32,

    /// Pods ready for at least the minimum ready period
    #[serde(rename = "availableReplicas")]
    #[serde(default)]
    pub available_replicas: u32,

    /// Nodes that should run a pod (DaemonSet only)
    #[serde(rename = "desiredNumberScheduled")]
    #[serde(default)]
    pub desired_number_scheduled: u32,
}

impl Workload {
    /// Create a StatefulSet with the given replicas
    pub fn stateful_set(namespace: &str, name: &str, replicas: u32) -> Self {
        Self {
            metadata: ObjectMeta::namespaced(namespace, name),
            kind: WorkloadKind::StatefulSet,
            spec: WorkloadSpec {
                replicas: Some(replicas),
                ..Default::default()
            },
            status: WorkloadStatus::default(),
        }
    }

    /// Create a DaemonSet
    pub fn daemon_set(namespace: &str, name: &str) -> Self {
        Self {
            metadata: ObjectMeta::namespaced(namespace, name),
            kind: WorkloadKind::DaemonSet,
            spec: WorkloadSpec::default(),
            status: WorkloadStatus::default(),
        }
    }

    /// Desired replica count regardless of kind
    pub fn desired_replicas(&self) -> u32 {
        match self.kind {
            WorkloadKind::StatefulSet => self.spec.replicas.unwrap_or(0),
            WorkloadKind::DaemonSet => self.status.desired_number_scheduled,
        }
    }

    /// Owner reference a pod of this workload carries
    pub fn controller_reference(&self) -> OwnerReference {
        OwnerReference {
            kind: match self.kind {
                WorkloadKind::StatefulSet => "StatefulSet".to_string(),
                WorkloadKind::DaemonSet => "DaemonSet".to_string(),
            },
            name: self.metadata.name.clone(),
            uid: self.metadata.uid,
            controller: true,
        }
    }
}

/// A pod, reduced to its placement and readiness
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pod {
    /// Metadata (owner references identify the workload)
    pub metadata: ObjectMeta,

    /// Node the pod is bound to
    #[serde(rename = "nodeName")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,

    /// Whether all containers are ready
    #[serde(default)]
    pub ready: bool,
}

impl Pod {
    /// Whether this pod is controlled by the given workload
    pub fn is_controlled_by(&self, workload: &Workload) -> bool {
        self.metadata
            .controller_ref()
            .map(|r| r.name == workload.metadata.name && r.uid == workload.metadata.uid)
            .unwrap_or(false)
    }
}

/// A config map holding string data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigMap {
    /// Metadata
    pub metadata: ObjectMeta,

    /// String data
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl ConfigMap {
    /// Create a config map with a single data entry
    pub fn new(namespace: &str, name: &str, key: &str, value: impl Into<String>) -> Self {
        let mut data = BTreeMap::new();
        data.insert(key.to_string(), value.into());
        Self {
            metadata: ObjectMeta::namespaced(namespace, name),
            data,
        }
    }
}

/// An installed release: rendered values plus the workloads they produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
    /// Metadata (name is the release name)
    pub metadata: ObjectMeta,

    /// Chart the release was rendered from
    pub chart: String,

    /// Rendered values document
    pub values: String,

    /// Workloads created by installing the release
    #[serde(default)]
    pub workloads: Vec<Workload>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_desired_replicas_by_kind() {
        let sts = Workload::stateful_set("default", "hbase-worker", 3);
        assert_eq!(sts.desired_replicas(), 3);

        let mut ds = Workload::daemon_set("default", "hbase-fuse");
        assert_eq!(ds.desired_replicas(), 0);
        ds.status.desired_number_scheduled = 2;
        assert_eq!(ds.desired_replicas(), 2);
    }

    #[test]
    fn test_pod_controlled_by() {
        let sts = Workload::stateful_set("default", "hbase-worker", 1);
        let other = Workload::stateful_set("default", "hbase-worker", 1);

        let mut pod = Pod {
            metadata: ObjectMeta::namespaced("default", "hbase-worker-0"),
            node_name: Some("n1".to_string()),
            ready: true,
        };
        assert!(!pod.is_controlled_by(&sts));

        pod.metadata.owner_references.push(sts.controller_reference());
        assert!(pod.is_controlled_by(&sts));
        // Same name, different uid: a recreated workload does not adopt old pods
        assert!(!pod.is_controlled_by(&other));
    }
}
