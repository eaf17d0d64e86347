//! Collaborator traits for the cluster API
//!
//! The lifecycle core never talks to an API server directly. Everything goes
//! through [`ClusterClient`] (object reads and writes with optimistic
//! concurrency) and [`ReleaseManager`] (chart releases), so a real client and
//! the in-memory cluster are interchangeable.

use async_trait::async_trait;
use thiserror::Error;

use super::dataset::Dataset;
use super::node::Node;
use super::resources::LabelSelector;
use super::retry::ConflictError;
use super::runtime::CacheRuntime;
use super::workload::{ConfigMap, Pod, Release, Workload};

/// Errors returned by cluster collaborators
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    #[error("Conflict writing {kind} '{name}': object was modified")]
    Conflict { kind: &'static str, name: String },

    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("Cluster API error: {0}")]
    Internal(String),
}

impl ClientError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        ClientError::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn conflict(kind: &'static str, name: impl Into<String>) -> Self {
        ClientError::Conflict {
            kind,
            name: name.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound { .. })
    }
}

impl ConflictError for ClientError {
    fn is_conflict(&self) -> bool {
        matches!(self, ClientError::Conflict { .. })
    }
}

/// Object access with optimistic concurrency.
///
/// Every `update_*` call must carry the resource version that was read; a
/// stale version fails with [`ClientError::Conflict`].
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get_node(&self, name: &str) -> Result<Node, ClientError>;

    async fn list_nodes(&self, selector: &LabelSelector) -> Result<Vec<Node>, ClientError>;

    async fn update_node(&self, node: &Node) -> Result<Node, ClientError>;

    /// Returns `Ok(None)` when the config map does not exist
    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, ClientError>;

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap, ClientError>;

    /// Deleting a missing config map succeeds
    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<(), ClientError>;

    async fn get_workload(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Workload>, ClientError>;

    async fn update_workload(&self, workload: &Workload) -> Result<Workload, ClientError>;

    async fn list_pods(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<Pod>, ClientError>;

    async fn get_dataset(&self, namespace: &str, name: &str)
        -> Result<Option<Dataset>, ClientError>;

    async fn update_dataset_status(&self, dataset: &Dataset) -> Result<Dataset, ClientError>;

    async fn get_runtime(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<CacheRuntime>, ClientError>;

    async fn list_runtimes(&self) -> Result<Vec<CacheRuntime>, ClientError>;

    async fn update_runtime_status(
        &self,
        runtime: &CacheRuntime,
    ) -> Result<CacheRuntime, ClientError>;

    /// Remove the runtime object once its shutdown has completed
    async fn delete_runtime(&self, namespace: &str, name: &str) -> Result<(), ClientError>;
}

/// Chart release management
#[async_trait]
pub trait ReleaseManager: Send + Sync {
    /// Whether a release with this name is installed
    async fn check_release(&self, namespace: &str, name: &str) -> Result<bool, ClientError>;

    /// Install a release and create its workloads
    async fn install_release(&self, release: Release) -> Result<(), ClientError>;

    /// Delete a release and its workloads; deleting a missing release succeeds
    async fn delete_release(&self, namespace: &str, name: &str) -> Result<(), ClientError>;
}
