//! Dataset resource - the data a cache runtime accelerates

use serde::{Deserialize, Serialize};

use super::resources::ObjectMeta;

/// Placement policy for a dataset's cache capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PlacementMode {
    /// A node hosts cache capacity for this dataset only
    Exclusive,
    /// A node may host cache capacity for many datasets
    #[default]
    Shared,
}

/// Phase of a dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DatasetPhase {
    /// Not yet bound to a runtime
    #[default]
    NotBound,
    /// Bound to a healthy runtime
    Bound,
    /// Bound runtime failed its health check
    Failed,
}

/// A Dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    /// Metadata
    pub metadata: ObjectMeta,

    /// Desired state
    #[serde(default)]
    pub spec: DatasetSpec,

    /// Observed state
    #[serde(default)]
    pub status: DatasetStatus,
}

/// Desired dataset configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetSpec {
    /// Placement mode
    #[serde(rename = "placement")]
    #[serde(default)]
    pub placement_mode: PlacementMode,
}

/// Dataset status
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetStatus {
    /// Current phase
    #[serde(default)]
    pub phase: DatasetPhase,
}

impl Dataset {
    /// Create a shared-mode dataset
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            metadata: ObjectMeta::namespaced(namespace, name),
            spec: DatasetSpec::default(),
            status: DatasetStatus::default(),
        }
    }

    /// Set the placement mode
    pub fn with_placement(mut self, mode: PlacementMode) -> Self {
        self.spec.placement_mode = mode;
        self
    }

    /// Whether the dataset demands exclusive nodes
    pub fn is_exclusive(&self) -> bool {
        self.spec.placement_mode == PlacementMode::Exclusive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_shared() {
        let ds = Dataset::new("default", "hbase");
        assert!(!ds.is_exclusive());
        assert_eq!(ds.status.phase, DatasetPhase::NotBound);
    }

    #[test]
    fn test_exclusive_from_yaml() {
        let yaml = "metadata:\n  name: spark\n  namespace: big-data\nspec:\n  placement: Exclusive\n";
        let ds: Dataset = serde_yaml::from_str(yaml).unwrap();
        assert!(ds.is_exclusive());
    }
}
