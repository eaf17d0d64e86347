//! Scheduling affinity for cache worker pods
//!
//! Workers of an exclusive dataset refuse hosts running any other dataset's
//! workers. Workers of a shared dataset prefer spreading away from other
//! datasets and refuse hosts of exclusive datasets. Every worker prefers
//! nodes that already run the dataset's fuse client.

use serde::{Deserialize, Serialize};

use super::labels::{PlacementLabels, DATASET_ID_LABEL, DATASET_PLACEMENT_LABEL};
use crate::cluster::resources::LabelSelector;
use crate::cluster::runtime::RuntimeInfo;

/// Topology key for per-host terms
pub const HOSTNAME_TOPOLOGY: &str = "kubernetes.io/hostname";

/// A pod (anti-)affinity term
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodAffinityTerm {
    /// Pods this term refers to
    #[serde(rename = "labelSelector")]
    pub selector: LabelSelector,

    /// Topology domain the term applies within
    #[serde(rename = "topologyKey")]
    pub topology_key: String,
}

/// A weighted pod affinity term
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedPodAffinityTerm {
    pub weight: u32,

    #[serde(rename = "podAffinityTerm")]
    pub term: PodAffinityTerm,
}

/// A weighted node preference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreferredNodeTerm {
    pub weight: u32,

    /// Nodes matching this selector are preferred
    pub preference: LabelSelector,
}

/// Affinity carried by a worker workload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerAffinity {
    #[serde(rename = "requiredPodAntiAffinity")]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_pod_anti_affinity: Vec<PodAffinityTerm>,

    #[serde(rename = "preferredPodAntiAffinity")]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preferred_pod_anti_affinity: Vec<WeightedPodAffinityTerm>,

    #[serde(rename = "preferredNodeAffinity")]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preferred_node_affinity: Vec<PreferredNodeTerm>,
}

fn host_term(selector: LabelSelector) -> PodAffinityTerm {
    PodAffinityTerm {
        selector,
        topology_key: HOSTNAME_TOPOLOGY.to_string(),
    }
}

impl WorkerAffinity {
    /// Affinity for a runtime's workers, built on top of any existing one.
    ///
    /// An affinity that already prefers the fuse label is returned as is. An
    /// existing affinity without it only gains the fuse preference.
    pub fn for_runtime(info: &RuntimeInfo, existing: Option<&WorkerAffinity>) -> WorkerAffinity {
        let fuse_label = PlacementLabels::for_runtime(info).fuse;

        if let Some(existing) = existing {
            if existing.prefers_node_label(&fuse_label) {
                return existing.clone();
            }
            let mut updated = existing.clone();
            updated.preferred_node_affinity.push(fuse_preference(&fuse_label));
            return updated;
        }

        let mut affinity = WorkerAffinity::default();
        if info.is_exclusive() {
            affinity
                .required_pod_anti_affinity
                .push(host_term(LabelSelector::exists(DATASET_ID_LABEL)));
        } else {
            affinity
                .preferred_pod_anti_affinity
                .push(WeightedPodAffinityTerm {
                    weight: 50,
                    term: host_term(LabelSelector::exists(DATASET_ID_LABEL)),
                });
            affinity.required_pod_anti_affinity.push(host_term(LabelSelector::matching(
                DATASET_PLACEMENT_LABEL,
                "Exclusive",
            )));
        }
        affinity
            .preferred_node_affinity
            .push(fuse_preference(&fuse_label));
        affinity
    }

    /// Whether a node preference on `key` is present
    pub fn prefers_node_label(&self, key: &str) -> bool {
        self.preferred_node_affinity.iter().any(|term| {
            term.preference.match_labels.contains_key(key)
                || term.preference.match_exists.iter().any(|k| k == key)
        })
    }
}

fn fuse_preference(fuse_label: &str) -> PreferredNodeTerm {
    PreferredNodeTerm {
        weight: 100,
        preference: LabelSelector::matching(fuse_label, "true"),
    }
}
