//! # Cluster Objects and Collaborators
//!
//! The slice of a container orchestrator the cache control plane depends on:
//!
//! - **Objects**: nodes, workloads (StatefulSet / DaemonSet) and their pods,
//!   config maps, releases, datasets and cache runtimes
//! - **Collaborators**: [`ClusterClient`] for object access with optimistic
//!   concurrency and [`ReleaseManager`] for chart releases
//! - **Retry**: [`retry_on_conflict`] for read-modify-write loops
//! - **In-memory cluster**: a faithful implementation of both collaborators
//!   with an optional simulated scheduler
//!
//! ```text
//!   EngineLifecycleController ──▶ ReleaseManager ──▶ Workloads ──▶ Pods
//!            │                                                      │
//!            └──▶ NodePlacementLabeler ──▶ Node labels ◀── scheduled onto
//! ```

pub mod client;
pub mod dataset;
pub mod memory;
pub mod node;
pub mod resources;
pub mod retry;
pub mod runtime;
pub mod workload;

pub use client::{ClientError, ClusterClient, ReleaseManager};
pub use dataset::{Dataset, DatasetPhase, PlacementMode};
pub use memory::{ClusterSeed, InMemoryCluster};
pub use node::Node;
pub use resources::{LabelSelector, ObjectMeta, OwnerReference};
pub use retry::{retry_on_conflict, ConflictError, RetryPolicy};
pub use runtime::{
    CacheRuntime, ComponentStatus, ConditionStatus, EngineType, RuntimeCondition,
    RuntimeConditionType, RuntimeInfo, RuntimePhase, RuntimeStatus,
};
pub use workload::{ConfigMap, Pod, Release, Workload, WorkloadKind};
