//! In-memory cluster - an optimistic-concurrency object store
//!
//! Implements both [`ClusterClient`] and [`ReleaseManager`]. Every object
//! carries a resource version; writes against a stale version fail with a
//! conflict exactly like an API server would. Used by tests and by the
//! binary's local mode.
//!
//! The optional simulated scheduler binds StatefulSet replicas round-robin
//! over ready, schedulable nodes and runs one DaemonSet pod per node matching
//! the set's node selector. Bound pods are ready immediately. Affinity is
//! recorded on workloads but not evaluated.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::client::{ClientError, ClusterClient, ReleaseManager};
use super::dataset::Dataset;
use super::node::Node;
use super::resources::{LabelSelector, ObjectMeta};
use super::runtime::CacheRuntime;
use super::workload::{ConfigMap, Pod, Release, Workload, WorkloadKind};

/// Objects loaded into an [`InMemoryCluster`] at startup
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterSeed {
    #[serde(default)]
    pub nodes: Vec<Node>,

    #[serde(default)]
    pub datasets: Vec<Dataset>,

    #[serde(default)]
    pub runtimes: Vec<CacheRuntime>,

    #[serde(rename = "configMaps")]
    #[serde(default)]
    pub config_maps: Vec<ConfigMap>,
}

/// Objects with metadata, stored under a versioned key
trait Stored: Clone {
    const KIND: &'static str;
    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;

    fn key(&self) -> String {
        object_key(&self.meta().namespace, &self.meta().name)
    }
}

impl Stored for Node {
    const KIND: &'static str = "Node";
    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }
    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl Stored for Workload {
    const KIND: &'static str = "Workload";
    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }
    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl Stored for Dataset {
    const KIND: &'static str = "Dataset";
    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }
    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl Stored for CacheRuntime {
    const KIND: &'static str = "CacheRuntime";
    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }
    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl Stored for ConfigMap {
    const KIND: &'static str = "ConfigMap";
    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }
    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

fn object_key(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", namespace, name)
    }
}

/// Replace a stored object if the caller's resource version is current.
/// `apply` merges the caller's object into the stored one.
fn versioned_update<T: Stored>(
    map: &DashMap<String, T>,
    object: &T,
    apply: impl FnOnce(&mut T, &T),
) -> Result<T, ClientError> {
    let key = object.key();
    let mut stored = map
        .get_mut(&key)
        .ok_or_else(|| ClientError::not_found(T::KIND, &key))?;
    if stored.meta().resource_version != object.meta().resource_version {
        return Err(ClientError::conflict(T::KIND, &key));
    }
    apply(stored.value_mut(), object);
    stored.meta_mut().resource_version += 1;
    Ok(stored.value().clone())
}

/// In-memory implementation of the cluster collaborators
#[derive(Clone, Default)]
pub struct InMemoryCluster {
    nodes: Arc<DashMap<String, Node>>,
    config_maps: Arc<DashMap<String, ConfigMap>>,
    workloads: Arc<DashMap<String, Workload>>,
    pods: Arc<DashMap<String, Pod>>,
    datasets: Arc<DashMap<String, Dataset>>,
    runtimes: Arc<DashMap<String, CacheRuntime>>,
    releases: Arc<DashMap<String, Release>>,

    /// Successful node writes per node name
    node_writes: Arc<DashMap<String, u64>>,

    /// Conflicts still to be injected per node name
    pending_conflicts: Arc<DashMap<String, u32>>,

    /// Release installs still to be failed
    failing_installs: Arc<AtomicU32>,

    simulate_scheduler: bool,
    cursor: Arc<AtomicUsize>,
}

impl InMemoryCluster {
    /// Create an empty cluster without a scheduler
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable the simulated scheduler
    pub fn with_simulated_scheduler(mut self) -> Self {
        self.simulate_scheduler = true;
        self
    }

    /// Create a cluster populated from a seed
    pub fn from_seed(seed: ClusterSeed) -> Self {
        let cluster = Self::new();
        for node in seed.nodes {
            cluster.insert_node(node);
        }
        for dataset in seed.datasets {
            cluster.insert_dataset(dataset);
        }
        for runtime in seed.runtimes {
            cluster.insert_runtime(runtime);
        }
        for config_map in seed.config_maps {
            cluster.insert_config_map(config_map);
        }
        cluster
    }

    // =========================================================================
    // Direct access (test setup and inspection)
    // =========================================================================

    pub fn insert_node(&self, node: Node) {
        self.nodes.insert(node.key(), node);
        self.reschedule();
    }

    pub fn node(&self, name: &str) -> Option<Node> {
        self.nodes.get(name).map(|n| n.clone())
    }

    pub fn insert_dataset(&self, dataset: Dataset) {
        self.datasets.insert(dataset.key(), dataset);
    }

    pub fn dataset(&self, namespace: &str, name: &str) -> Option<Dataset> {
        self.datasets
            .get(&object_key(namespace, name))
            .map(|d| d.clone())
    }

    pub fn insert_runtime(&self, runtime: CacheRuntime) {
        self.runtimes.insert(runtime.key(), runtime);
    }

    pub fn runtime(&self, namespace: &str, name: &str) -> Option<CacheRuntime> {
        self.runtimes
            .get(&object_key(namespace, name))
            .map(|r| r.clone())
    }

    /// Mark a runtime for deletion
    pub fn request_deletion(&self, namespace: &str, name: &str) -> bool {
        match self.runtimes.get_mut(&object_key(namespace, name)) {
            Some(mut runtime) => {
                runtime.metadata.deletion_timestamp = Some(chrono::Utc::now());
                runtime.metadata.resource_version += 1;
                true
            }
            None => false,
        }
    }

    pub fn insert_config_map(&self, config_map: ConfigMap) {
        self.config_maps.insert(config_map.key(), config_map);
    }

    pub fn config_map(&self, namespace: &str, name: &str) -> Option<ConfigMap> {
        self.config_maps
            .get(&object_key(namespace, name))
            .map(|c| c.clone())
    }

    pub fn insert_workload(&self, workload: Workload) {
        self.workloads.insert(workload.key(), workload);
        self.reschedule();
    }

    pub fn workload(&self, namespace: &str, name: &str) -> Option<Workload> {
        self.workloads
            .get(&object_key(namespace, name))
            .map(|w| w.clone())
    }

    pub fn insert_pod(&self, pod: Pod) {
        self.pods
            .insert(object_key(&pod.metadata.namespace, &pod.metadata.name), pod);
    }

    pub fn release(&self, namespace: &str, name: &str) -> Option<Release> {
        self.releases
            .get(&object_key(namespace, name))
            .map(|r| r.clone())
    }

    /// Number of successful writes to a node
    pub fn node_writes(&self, name: &str) -> u64 {
        self.node_writes.get(name).map(|n| *n).unwrap_or(0)
    }

    /// Number of successful node writes across the cluster
    pub fn total_node_writes(&self) -> u64 {
        self.node_writes.iter().map(|n| *n.value()).sum()
    }

    /// Make the next `count` writes to a node fail with a conflict
    pub fn inject_conflicts(&self, node: &str, count: u32) {
        *self.pending_conflicts.entry(node.to_string()).or_insert(0) += count;
    }

    /// Make the next `count` release installs fail
    pub fn fail_next_installs(&self, count: u32) {
        self.failing_installs.fetch_add(count, Ordering::SeqCst);
    }

    fn take_injected_conflict(&self, node: &str) -> bool {
        match self.pending_conflicts.get_mut(node) {
            Some(mut remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    fn take_install_failure(&self) -> bool {
        self.failing_installs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    // =========================================================================
    // Simulated scheduler
    // =========================================================================

    /// Reconcile pods for every workload
    fn reschedule(&self) {
        if !self.simulate_scheduler {
            return;
        }
        let workloads: Vec<Workload> = self.workloads.iter().map(|w| w.clone()).collect();
        for workload in workloads {
            self.reconcile_pods(&workload);
        }
    }

    fn schedulable_nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self
            .nodes
            .iter()
            .filter(|n| n.can_schedule())
            .map(|n| n.clone())
            .collect();
        nodes.sort_by(|a, b| a.name().cmp(b.name()));
        nodes
    }

    fn owned_pods(&self, workload: &Workload) -> Vec<Pod> {
        self.pods
            .iter()
            .filter(|p| p.is_controlled_by(workload))
            .map(|p| p.clone())
            .collect()
    }

    fn new_pod(&self, workload: &Workload, name: String, node: Option<&str>) -> Pod {
        let mut metadata = ObjectMeta::namespaced(workload.metadata.namespace.clone(), name);
        metadata.labels = workload.spec.pod_labels.clone();
        metadata
            .owner_references
            .push(workload.controller_reference());
        Pod {
            metadata,
            node_name: node.map(str::to_string),
            ready: node.is_some(),
        }
    }

    fn reconcile_pods(&self, workload: &Workload) {
        let namespace = &workload.metadata.namespace;
        let owned = self.owned_pods(workload);
        let nodes = self.schedulable_nodes();
        let mut desired_scheduled = 0;

        match workload.kind {
            WorkloadKind::StatefulSet => {
                let replicas = workload.spec.replicas.unwrap_or(0);
                let prefix = format!("{}-", workload.metadata.name);
                for pod in &owned {
                    let ordinal = pod
                        .metadata
                        .name
                        .strip_prefix(&prefix)
                        .and_then(|s| s.parse::<u32>().ok());
                    if ordinal.map_or(true, |o| o >= replicas) {
                        self.pods
                            .remove(&object_key(namespace, &pod.metadata.name));
                    }
                }
                for ordinal in 0..replicas {
                    let name = format!("{}{}", prefix, ordinal);
                    if self.pods.contains_key(&object_key(namespace, &name)) {
                        continue;
                    }
                    let node = if nodes.is_empty() {
                        None
                    } else {
                        let index = self.cursor.fetch_add(1, Ordering::SeqCst) % nodes.len();
                        Some(nodes[index].name())
                    };
                    debug!(pod = %name, node = ?node, "Scheduling pod");
                    self.insert_pod(self.new_pod(workload, name, node));
                }
            }
            WorkloadKind::DaemonSet => {
                let selector = LabelSelector {
                    match_labels: workload.spec.node_selector.clone(),
                    match_exists: vec![],
                };
                let targets: Vec<&Node> = nodes
                    .iter()
                    .filter(|n| selector.matches(n.labels()))
                    .collect();
                desired_scheduled = targets.len() as u32;
                for pod in &owned {
                    let keep = pod
                        .node_name
                        .as_deref()
                        .is_some_and(|n| targets.iter().any(|t| t.name() == n));
                    if !keep {
                        self.pods
                            .remove(&object_key(namespace, &pod.metadata.name));
                    }
                }
                for node in targets {
                    let name = format!("{}-{}", workload.metadata.name, node.name());
                    if !self.pods.contains_key(&object_key(namespace, &name)) {
                        self.insert_pod(self.new_pod(workload, name, Some(node.name())));
                    }
                }
            }
        }

        let pods = self.owned_pods(workload);
        let ready = pods.iter().filter(|p| p.ready).count() as u32;
        if let Some(mut stored) = self.workloads.get_mut(&workload.key()) {
            stored.status.replicas = pods.len() as u32;
            stored.status.ready_replicas = ready;
            stored.status.available_replicas = ready;
            stored.status.desired_number_scheduled = desired_scheduled;
        }
    }
}

#[async_trait]
impl ClusterClient for InMemoryCluster {
    async fn get_node(&self, name: &str) -> Result<Node, ClientError> {
        self.node(name)
            .ok_or_else(|| ClientError::not_found("Node", name))
    }

    async fn list_nodes(&self, selector: &LabelSelector) -> Result<Vec<Node>, ClientError> {
        let mut nodes: Vec<Node> = self
            .nodes
            .iter()
            .filter(|n| selector.matches(n.labels()))
            .map(|n| n.clone())
            .collect();
        nodes.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(nodes)
    }

    async fn update_node(&self, node: &Node) -> Result<Node, ClientError> {
        if self.take_injected_conflict(node.name()) {
            return Err(ClientError::conflict("Node", node.name()));
        }
        let updated = versioned_update(&self.nodes, node, |stored, new| {
            stored.metadata.labels = new.metadata.labels.clone();
            stored.metadata.annotations = new.metadata.annotations.clone();
            stored.spec = new.spec.clone();
        })?;
        *self
            .node_writes
            .entry(node.name().to_string())
            .or_insert(0) += 1;
        self.reschedule();
        Ok(updated)
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, ClientError> {
        Ok(self.config_map(namespace, name))
    }

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap, ClientError> {
        let key = config_map.key();
        match self.config_maps.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(ClientError::AlreadyExists {
                kind: ConfigMap::KIND,
                name: key,
            }),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                Ok(slot.insert(config_map.clone()).clone())
            }
        }
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<(), ClientError> {
        self.config_maps.remove(&object_key(namespace, name));
        Ok(())
    }

    async fn get_workload(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Workload>, ClientError> {
        Ok(self.workload(namespace, name))
    }

    async fn update_workload(&self, workload: &Workload) -> Result<Workload, ClientError> {
        let updated = versioned_update(&self.workloads, workload, |stored, new| {
            stored.metadata.labels = new.metadata.labels.clone();
            stored.spec = new.spec.clone();
        })?;
        self.reschedule();
        Ok(self.workload(&updated.metadata.namespace, &updated.metadata.name)
            .unwrap_or(updated))
    }

    async fn list_pods(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<Pod>, ClientError> {
        let mut pods: Vec<Pod> = self
            .pods
            .iter()
            .filter(|p| p.metadata.namespace == namespace && selector.matches(&p.metadata.labels))
            .map(|p| p.clone())
            .collect();
        pods.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        Ok(pods)
    }

    async fn get_dataset(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Dataset>, ClientError> {
        Ok(self.dataset(namespace, name))
    }

    async fn update_dataset_status(&self, dataset: &Dataset) -> Result<Dataset, ClientError> {
        versioned_update(&self.datasets, dataset, |stored, new| {
            stored.status = new.status.clone();
        })
    }

    async fn get_runtime(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<CacheRuntime>, ClientError> {
        Ok(self.runtime(namespace, name))
    }

    async fn list_runtimes(&self) -> Result<Vec<CacheRuntime>, ClientError> {
        let mut runtimes: Vec<CacheRuntime> = self.runtimes.iter().map(|r| r.clone()).collect();
        runtimes.sort_by_key(|r| r.metadata.qualified_name());
        Ok(runtimes)
    }

    async fn update_runtime_status(
        &self,
        runtime: &CacheRuntime,
    ) -> Result<CacheRuntime, ClientError> {
        versioned_update(&self.runtimes, runtime, |stored, new| {
            stored.status = new.status.clone();
        })
    }

    async fn delete_runtime(&self, namespace: &str, name: &str) -> Result<(), ClientError> {
        self.runtimes.remove(&object_key(namespace, name));
        Ok(())
    }
}

#[async_trait]
impl ReleaseManager for InMemoryCluster {
    async fn check_release(&self, namespace: &str, name: &str) -> Result<bool, ClientError> {
        Ok(self.releases.contains_key(&object_key(namespace, name)))
    }

    async fn install_release(&self, release: Release) -> Result<(), ClientError> {
        let key = object_key(&release.metadata.namespace, &release.metadata.name);
        if self.take_install_failure() {
            return Err(ClientError::Internal(format!(
                "install of release '{}' failed",
                key
            )));
        }
        if self.releases.contains_key(&key) {
            return Err(ClientError::AlreadyExists {
                kind: "Release",
                name: key,
            });
        }
        for workload in &release.workloads {
            self.workloads.insert(workload.key(), workload.clone());
        }
        self.releases.insert(key, release);
        self.reschedule();
        Ok(())
    }

    async fn delete_release(&self, namespace: &str, name: &str) -> Result<(), ClientError> {
        let Some((_, release)) = self.releases.remove(&object_key(namespace, name)) else {
            return Ok(());
        };
        for workload in &release.workloads {
            if let Some((_, stored)) = self.workloads.remove(&workload.key()) {
                self.pods.retain(|_, pod| !pod.is_controlled_by(&stored));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stale_node_write_conflicts() {
        let cluster = InMemoryCluster::new();
        cluster.insert_node(Node::new("n1"));

        let first = cluster.get_node("n1").await.unwrap();
        let second = cluster.get_node("n1").await.unwrap();

        cluster
            .update_node(&first.clone().with_label("a", "1"))
            .await
            .unwrap();
        let err = cluster
            .update_node(&second.with_label("b", "1"))
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::Conflict { .. }));
        assert_eq!(cluster.node_writes("n1"), 1);
        assert_eq!(cluster.node("n1").unwrap().metadata.resource_version, 1);
    }

    #[tokio::test]
    async fn test_injected_conflicts() {
        let cluster = InMemoryCluster::new();
        cluster.insert_node(Node::new("n1"));
        cluster.inject_conflicts("n1", 2);

        let node = cluster.get_node("n1").await.unwrap();
        assert!(cluster.update_node(&node).await.is_err());
        assert!(cluster.update_node(&node).await.is_err());
        assert!(cluster.update_node(&node).await.is_ok());
    }

    #[tokio::test]
    async fn test_simulated_scheduler_places_stateful_set() {
        let cluster = InMemoryCluster::new().with_simulated_scheduler();
        cluster.insert_node(Node::new("n1"));
        cluster.insert_node(Node::new("n2"));
        cluster.insert_node(Node::new("n3").cordon());

        let mut sts = Workload::stateful_set("default", "hbase-worker", 2);
        sts.spec
            .pod_labels
            .insert("role".to_string(), "hbase-worker".to_string());
        cluster.insert_workload(sts);

        let pods = cluster
            .list_pods("default", &LabelSelector::matching("role", "hbase-worker"))
            .await
            .unwrap();
        assert_eq!(pods.len(), 2);
        assert!(pods.iter().all(|p| p.ready));
        assert!(pods.iter().all(|p| p.node_name.as_deref() != Some("n3")));

        let stored = cluster.workload("default", "hbase-worker").unwrap();
        assert_eq!(stored.status.ready_replicas, 2);

        let mut scaled = stored.clone();
        scaled.spec.replicas = Some(1);
        let updated = cluster.update_workload(&scaled).await.unwrap();
        assert_eq!(updated.status.ready_replicas, 1);
    }

    #[tokio::test]
    async fn test_simulated_scheduler_follows_daemon_set_selector() {
        let cluster = InMemoryCluster::new().with_simulated_scheduler();
        cluster.insert_node(Node::new("n1"));
        cluster.insert_node(Node::new("n2"));

        let mut ds = Workload::daemon_set("default", "hbase-fuse");
        ds.spec
            .node_selector
            .insert("fuse".to_string(), "true".to_string());
        cluster.insert_workload(ds);
        assert_eq!(
            cluster
                .workload("default", "hbase-fuse")
                .unwrap()
                .desired_replicas(),
            0
        );

        let node = cluster.get_node("n1").await.unwrap();
        cluster
            .update_node(&node.with_label("fuse", "true"))
            .await
            .unwrap();
        assert_eq!(
            cluster
                .workload("default", "hbase-fuse")
                .unwrap()
                .desired_replicas(),
            1
        );
    }

    #[tokio::test]
    async fn test_release_lifecycle() {
        let cluster = InMemoryCluster::new();
        let release = Release {
            metadata: ObjectMeta::namespaced("default", "hbase"),
            chart: "alluxio".to_string(),
            values: String::new(),
            workloads: vec![Workload::stateful_set("default", "hbase-worker", 0)],
        };

        cluster.fail_next_installs(1);
        assert!(cluster.install_release(release.clone()).await.is_err());
        assert!(!cluster.check_release("default", "hbase").await.unwrap());

        cluster.install_release(release).await.unwrap();
        assert!(cluster.check_release("default", "hbase").await.unwrap());
        assert!(cluster.workload("default", "hbase-worker").is_some());

        cluster.delete_release("default", "hbase").await.unwrap();
        cluster.delete_release("default", "hbase").await.unwrap();
        assert!(cluster.workload("default", "hbase-worker").is_none());
    }

    #[test]
    fn test_seed_from_yaml() {
        let yaml = r#"
nodes:
  - metadata:
      name: n1
datasets:
  - metadata:
      name: hbase
      namespace: default
runtimes:
  - metadata:
      name: hbase
      namespace: default
    spec:
      engine: alluxio
"#;
        let seed: ClusterSeed = serde_yaml::from_str(yaml).unwrap();
        let cluster = InMemoryCluster::from_seed(seed);
        assert!(cluster.node("n1").is_some());
        assert!(cluster.dataset("default", "hbase").is_some());
        assert!(cluster.runtime("default", "hbase").is_some());
    }
}
