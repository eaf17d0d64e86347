//! CacheRuntime resource - one deployment of a cache engine
//!
//! A runtime has three component slots (master, worker, fuse). Each slot
//! reports replica counts and a phase derived from them; the runtime carries a
//! condition history unique by condition type.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::dataset::{Dataset, PlacementMode};
use super::resources::ObjectMeta;
use crate::placement::labels::SizeHints;

/// Supported cache engines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineType {
    Alluxio,
    Juicefs,
}

impl EngineType {
    /// Lowercase name used in label keys and object names
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineType::Alluxio => "alluxio",
            EngineType::Juicefs => "juicefs",
        }
    }
}

impl fmt::Display for EngineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Network mode for a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NetworkMode {
    /// Share the node's network namespace; ports must be cluster-unique
    #[default]
    HostNetwork,
    /// Pod network; ports are fixed defaults
    ContainerNetwork,
}

/// Desired state for a master or worker slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentSpec {
    /// Desired replicas
    #[serde(default = "default_replicas")]
    pub replicas: u32,

    /// Network mode
    #[serde(rename = "networkMode")]
    #[serde(default)]
    pub network_mode: NetworkMode,
}

impl Default for ComponentSpec {
    fn default() -> Self {
        Self {
            replicas: default_replicas(),
            network_mode: NetworkMode::default(),
        }
    }
}

fn default_replicas() -> u32 {
    1
}

/// Desired state for the fuse (client) slot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FuseSpec {
    /// Run fuse on every node matching `node_selector` rather than only
    /// where applications mount the dataset
    #[serde(default)]
    pub global: bool,

    /// Node selector used in global mode
    #[serde(rename = "nodeSelector")]
    #[serde(default)]
    pub node_selector: std::collections::BTreeMap<String, String>,

    /// Network mode
    #[serde(rename = "networkMode")]
    #[serde(default)]
    pub network_mode: NetworkMode,
}

/// Storage medium of a cache tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediumType {
    #[serde(rename = "MEM")]
    Mem,
    #[serde(rename = "SSD")]
    Ssd,
    #[serde(rename = "HDD")]
    Hdd,
}

/// One cache tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierLevel {
    /// Medium
    #[serde(rename = "mediumtype")]
    pub medium: MediumType,

    /// Cache directory on the worker
    pub path: String,

    /// Quota in bytes
    pub quota: u64,
}

/// Desired state of a cache runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeSpec {
    /// Engine implementing this runtime
    pub engine: EngineType,

    /// Master slot (ignored by engines without a master)
    #[serde(default)]
    pub master: ComponentSpec,

    /// Worker slot
    #[serde(default)]
    pub worker: ComponentSpec,

    /// Fuse slot
    #[serde(default)]
    pub fuse: FuseSpec,

    /// Cache tiers
    #[serde(rename = "tieredStore")]
    #[serde(default)]
    pub tiered_store: Vec<TierLevel>,
}

/// Phase of a component slot, derived from replica counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RuntimePhase {
    #[default]
    None,
    NotReady,
    PartialReady,
    Ready,
}

impl RuntimePhase {
    /// Compute the phase from desired and ready replicas
    pub fn from_replicas(desired: u32, ready: u32) -> Self {
        if desired == 0 {
            RuntimePhase::None
        } else if ready == 0 {
            RuntimePhase::NotReady
        } else if ready < desired {
            RuntimePhase::PartialReady
        } else {
            // ready above desired happens while a scale-in drains
            RuntimePhase::Ready
        }
    }
}

/// Observed state of one component slot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentStatus {
    /// Phase (always recomputed from the counts below)
    pub phase: RuntimePhase,

    #[serde(rename = "desiredReplicas")]
    pub desired: u32,

    #[serde(rename = "currentReplicas")]
    pub current: u32,

    #[serde(rename = "readyReplicas")]
    pub ready: u32,

    #[serde(rename = "availableReplicas")]
    pub available: u32,
}

impl ComponentStatus {
    /// Record observed counts and derive the phase
    pub fn observe(desired: u32, current: u32, ready: u32, available: u32) -> Self {
        Self {
            phase: RuntimePhase::from_replicas(desired, ready),
            desired,
            current,
            ready,
            available,
        }
    }
}

/// Condition types surfaced on the runtime status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuntimeConditionType {
    MasterInitialized,
    MasterReady,
    WorkersInitialized,
    WorkersReady,
    WorkersScaledIn,
    WorkersScaledOut,
    FusesInitialized,
    FusesReady,
    FusesScaledIn,
    FusesScaledOut,
}

/// Condition status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        }
    }
}

/// A condition of a runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeCondition {
    #[serde(rename = "type")]
    pub condition_type: RuntimeConditionType,

    pub status: ConditionStatus,

    /// Machine-readable reason
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition was probed
    #[serde(rename = "lastProbeTime")]
    pub last_probe_time: DateTime<Utc>,

    /// Last time the status value changed
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl RuntimeCondition {
    /// Create a new condition stamped now
    pub fn new(
        condition_type: RuntimeConditionType,
        status: impl Into<ConditionStatus>,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            condition_type,
            status: status.into(),
            reason: reason.into(),
            message: message.into(),
            last_probe_time: now,
            last_transition_time: now,
        }
    }
}

/// Observed state of a cache runtime
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeStatus {
    #[serde(default)]
    pub master: ComponentStatus,

    #[serde(default)]
    pub worker: ComponentStatus,

    #[serde(default)]
    pub fuse: ComponentStatus,

    /// Condition history, one entry per type
    #[serde(default)]
    pub conditions: Vec<RuntimeCondition>,

    /// Name of the persisted values config map
    #[serde(rename = "valueFile")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_file: Option<String>,
}

impl RuntimeStatus {
    /// Insert or refresh a condition.
    ///
    /// An existing condition of the same type is updated in place; its
    /// transition time only moves when the status value changes.
    pub fn set_condition(&mut self, condition: RuntimeCondition) {
        match self
            .conditions
            .iter_mut()
            .find(|c| c.condition_type == condition.condition_type)
        {
            Some(existing) => {
                if existing.status != condition.status {
                    existing.last_transition_time = condition.last_transition_time;
                }
                existing.status = condition.status;
                existing.reason = condition.reason;
                existing.message = condition.message;
                existing.last_probe_time = condition.last_probe_time;
            }
            None => self.conditions.push(condition),
        }
    }

    /// Find a condition by type
    pub fn condition(&self, condition_type: RuntimeConditionType) -> Option<&RuntimeCondition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }
}

/// A CacheRuntime object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRuntime {
    pub metadata: ObjectMeta,

    pub spec: RuntimeSpec,

    #[serde(default)]
    pub status: RuntimeStatus,
}

impl CacheRuntime {
    /// Create a runtime with default component specs
    pub fn new(namespace: &str, name: &str, engine: EngineType) -> Self {
        Self {
            metadata: ObjectMeta::namespaced(namespace, name),
            spec: RuntimeSpec {
                engine,
                master: ComponentSpec::default(),
                worker: ComponentSpec::default(),
                fuse: FuseSpec::default(),
                tiered_store: vec![],
            },
            status: RuntimeStatus::default(),
        }
    }

    /// Set desired worker replicas
    pub fn with_workers(mut self, replicas: u32) -> Self {
        self.spec.worker.replicas = replicas;
        self
    }

    /// Add a cache tier
    pub fn with_tier(mut self, medium: MediumType, path: &str, quota: u64) -> Self {
        self.spec.tiered_store.push(TierLevel {
            medium,
            path: path.to_string(),
            quota,
        });
        self
    }

    /// Whether deletion of the runtime has been requested
    pub fn deletion_requested(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}

/// Identity and placement facts for one runtime, shared by every lifecycle step.
///
/// The runtime and its dataset share a namespace and name.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeInfo {
    pub namespace: String,
    pub name: String,
    pub engine: EngineType,
    pub placement: PlacementMode,

    /// UID of the owning dataset, used to shorten overlong label keys
    pub owner_dataset_uid: Option<Uuid>,

    pub tiered_store: Vec<TierLevel>,
    pub fuse_global: bool,
}

impl RuntimeInfo {
    /// Build from a runtime and (when it exists) its dataset
    pub fn from_runtime(runtime: &CacheRuntime, dataset: Option<&Dataset>) -> Self {
        Self {
            namespace: runtime.metadata.namespace.clone(),
            name: runtime.metadata.name.clone(),
            engine: runtime.spec.engine,
            placement: dataset
                .map(|d| d.spec.placement_mode)
                .unwrap_or_default(),
            owner_dataset_uid: dataset.map(|d| d.metadata.uid),
            tiered_store: runtime.spec.tiered_store.clone(),
            fuse_global: runtime.spec.fuse.global,
        }
    }

    /// Minimal info for a shared-mode runtime
    pub fn new(namespace: &str, name: &str, engine: EngineType) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            engine,
            placement: PlacementMode::Shared,
            owner_dataset_uid: None,
            tiered_store: vec![],
            fuse_global: false,
        }
    }

    /// Set the placement mode
    pub fn with_placement(mut self, placement: PlacementMode) -> Self {
        self.placement = placement;
        self
    }

    /// namespace/name
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Whether the dataset demands exclusive nodes
    pub fn is_exclusive(&self) -> bool {
        self.placement == PlacementMode::Exclusive
    }

    /// Release name
    pub fn release_name(&self) -> &str {
        &self.name
    }

    pub fn master_name(&self) -> String {
        format!("{}-master", self.name)
    }

    pub fn worker_name(&self) -> String {
        format!("{}-worker", self.name)
    }

    pub fn fuse_name(&self) -> String {
        format!("{}-fuse", self.name)
    }

    /// Config map holding the rendered values of the release
    pub fn values_config_map_name(&self) -> String {
        format!("{}-{}-values", self.name, self.engine)
    }

    /// Config map holding engine configuration
    pub fn config_map_name(&self) -> String {
        format!("{}-config", self.name)
    }

    /// Per-node capacity hints derived from the cache tiers
    pub fn size_hints(&self) -> SizeHints {
        let mut hints = SizeHints::default();
        for level in &self.tiered_store {
            match level.medium {
                MediumType::Mem => hints.mem_bytes += level.quota,
                MediumType::Ssd | MediumType::Hdd => hints.disk_bytes += level.quota,
            }
        }
        hints
    }
}
