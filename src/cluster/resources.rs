//! Shared metadata and selector types for cluster objects

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Metadata carried by every cluster object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    /// Object name, unique per namespace (or cluster-wide for nodes)
    pub name: String,

    /// Namespace; empty for cluster-scoped objects
    #[serde(default)]
    pub namespace: String,

    /// Unique identifier (generated)
    #[serde(default = "Uuid::new_v4")]
    pub uid: Uuid,

    /// Labels for organization and selection
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Annotations for metadata storage
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,

    /// Version stamp used for optimistic concurrency; bumped on every write
    #[serde(rename = "resourceVersion")]
    #[serde(default)]
    pub resource_version: u64,

    /// Objects that own this one
    #[serde(rename = "ownerReferences")]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,

    /// Creation timestamp
    #[serde(rename = "creationTimestamp")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,

    /// Set once deletion of the object has been requested
    #[serde(rename = "deletionTimestamp")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    /// Metadata for a namespaced object
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            uid: Uuid::new_v4(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            resource_version: 0,
            owner_references: vec![],
            creation_timestamp: Some(Utc::now()),
            deletion_timestamp: None,
        }
    }

    /// Metadata for a cluster-scoped object
    pub fn cluster_scoped(name: impl Into<String>) -> Self {
        Self::namespaced("", name)
    }

    /// Get the full qualified name (namespace/name)
    pub fn qualified_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.namespace, self.name)
        }
    }

    /// The owner reference marked as controller, if any
    pub fn controller_ref(&self) -> Option<&OwnerReference> {
        self.owner_references.iter().find(|r| r.controller)
    }
}

/// Reference from a dependent object to its owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerReference {
    /// Kind of the owner (e.g. "StatefulSet")
    pub kind: String,

    /// Name of the owner
    pub name: String,

    /// UID of the owner
    pub uid: Uuid,

    /// Whether the owner is the managing controller
    #[serde(default)]
    pub controller: bool,
}

/// Label selector for filtering resources
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LabelSelector {
    /// Match exact labels
    #[serde(rename = "matchLabels")]
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,

    /// Keys that must be present with any value
    #[serde(rename = "matchExists")]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_exists: Vec<String>,
}

impl LabelSelector {
    /// Create a selector that matches a specific label
    pub fn matching(key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(key.into(), value.into());
        Self {
            match_labels: labels,
            match_exists: vec![],
        }
    }

    /// Create a selector that matches objects carrying a key
    pub fn exists(key: impl Into<String>) -> Self {
        Self {
            match_labels: BTreeMap::new(),
            match_exists: vec![key.into()],
        }
    }

    /// Check if labels match this selector
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
            && self.match_exists.iter().all(|k| labels.contains_key(k))
    }
}
