//! Node placement labeler
//!
//! Records on node labels which datasets have cache capacity resident on each
//! node. Every mutation is a read-modify-write of one node retried on
//! conflict, touching only the keys owned by one runtime plus the shared
//! `fluid.io/dataset-num` counter.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::labels::{
    dataset_num, format_bytes, set_dataset_num, PlacementLabels, SizeHints, EXCLUSIVE_LABEL,
};
use crate::cluster::client::{ClientError, ClusterClient};
use crate::cluster::resources::LabelSelector;
use crate::cluster::retry::{retry_on_conflict, ConflictError, RetryPolicy};
use crate::cluster::runtime::RuntimeInfo;
use crate::cluster::workload::{Workload, WorkloadKind};

/// Serializes worker setup against worker teardown across all runtimes
pub type SchedulerLock = Arc<Mutex<()>>;

/// Errors from placement labeling
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlacementError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("Node '{node}' is held exclusively by '{holder}'")]
    ExclusiveConflict { node: String, holder: String },
}

impl ConflictError for PlacementError {
    fn is_conflict(&self) -> bool {
        match self {
            PlacementError::Client(err) => err.is_conflict(),
            PlacementError::ExclusiveConflict { .. } => false,
        }
    }
}

/// A runtime's worker, resolved to its workload form
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerWorkload {
    /// StatefulSet worker, or one not created yet
    Modern(WorkerHandle),
    /// DaemonSet worker from old releases; labeling is skipped
    Legacy,
}

/// Handle on a modern worker workload
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerHandle {
    pub namespace: String,
    pub name: String,
    pub workload: Option<Workload>,
}

/// Label changes made by a schedule sync
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl SyncOutcome {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

// =============================================================================
// Pure label transforms
// =============================================================================

/// Add a runtime's labels to a node's label map.
///
/// Returns whether the map changed. `dataset-num` only moves when the runtime
/// marker was absent.
pub fn apply_add(
    node: &str,
    labels: &mut BTreeMap<String, String>,
    keys: &PlacementLabels,
    exclusive: bool,
    hints: SizeHints,
) -> Result<bool, PlacementError> {
    let present = labels.contains_key(&keys.runtime);

    if let Some(holder) = labels.get(EXCLUSIVE_LABEL) {
        if holder != &keys.exclusive_value {
            return Err(PlacementError::ExclusiveConflict {
                node: node.to_string(),
                holder: holder.clone(),
            });
        }
    }
    let others = dataset_num(labels).saturating_sub(u32::from(present));
    if exclusive && others > 0 {
        return Err(PlacementError::ExclusiveConflict {
            node: node.to_string(),
            holder: format!("{} shared dataset(s)", others),
        });
    }

    let before = labels.clone();
    if !present {
        set_dataset_num(labels, dataset_num(labels) + 1);
    }
    labels.insert(keys.runtime.clone(), "true".to_string());
    labels.insert(keys.common.clone(), "true".to_string());
    if exclusive {
        labels.insert(EXCLUSIVE_LABEL.to_string(), keys.exclusive_value.clone());
    }
    if hints.mem_bytes > 0 {
        labels.insert(keys.memory.clone(), format_bytes(hints.mem_bytes));
    }
    if hints.disk_bytes > 0 {
        labels.insert(keys.disk.clone(), format_bytes(hints.disk_bytes));
    }
    labels.insert(keys.total.clone(), format_bytes(hints.total_bytes()));

    Ok(*labels != before)
}

/// Remove a runtime's labels from a node's label map; returns whether it changed
pub fn apply_remove(labels: &mut BTreeMap<String, String>, keys: &PlacementLabels) -> bool {
    let before = labels.clone();
    let present = labels.contains_key(&keys.runtime);

    for key in keys.owned_keys() {
        labels.remove(key);
    }
    if labels.get(EXCLUSIVE_LABEL) == Some(&keys.exclusive_value) {
        labels.remove(EXCLUSIVE_LABEL);
    }
    if present {
        set_dataset_num(labels, dataset_num(labels).saturating_sub(1));
    }

    *labels != before
}

// =============================================================================
// Labeler
// =============================================================================

/// Applies placement labels for cache runtimes
#[derive(Clone)]
pub struct NodePlacementLabeler {
    client: Arc<dyn ClusterClient>,
    retry: RetryPolicy,
    scheduler_lock: SchedulerLock,
}

impl NodePlacementLabeler {
    pub fn new(client: Arc<dyn ClusterClient>) -> Self {
        Self {
            client,
            retry: RetryPolicy::unbounded(),
            scheduler_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Use a specific conflict retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Share a scheduler lock with other components
    pub fn with_scheduler_lock(mut self, lock: SchedulerLock) -> Self {
        self.scheduler_lock = lock;
        self
    }

    /// The lock worker setup must hold while scaling
    pub fn scheduler_lock(&self) -> SchedulerLock {
        self.scheduler_lock.clone()
    }

    /// Determine whether the runtime's worker is a modern or legacy workload
    pub async fn resolve_worker(&self, info: &RuntimeInfo) -> Result<WorkerWorkload, PlacementError> {
        let name = info.worker_name();
        let workload = self.client.get_workload(&info.namespace, &name).await?;
        match workload {
            Some(w) if w.kind == WorkloadKind::DaemonSet => Ok(WorkerWorkload::Legacy),
            workload => Ok(WorkerWorkload::Modern(WorkerHandle {
                namespace: info.namespace.clone(),
                name,
                workload,
            })),
        }
    }

    /// Mark nodes as hosting cache capacity for a runtime
    pub async fn add_labels_to_cache_nodes(
        &self,
        node_names: &[String],
        info: &RuntimeInfo,
        hints: SizeHints,
    ) -> Result<(), PlacementError> {
        if let WorkerWorkload::Legacy = self.resolve_worker(info).await? {
            info!(runtime = %info.qualified_name(), "Legacy worker workload, skipping node labels");
            return Ok(());
        }
        let keys = PlacementLabels::for_runtime(info);
        for node in node_names {
            self.label_node(node, &keys, info.is_exclusive(), hints)
                .await?;
        }
        Ok(())
    }

    /// Unmark nodes for a runtime
    pub async fn remove_labels_from_cache_nodes(
        &self,
        node_names: &[String],
        info: &RuntimeInfo,
    ) -> Result<(), PlacementError> {
        if let WorkerWorkload::Legacy = self.resolve_worker(info).await? {
            info!(runtime = %info.qualified_name(), "Legacy worker workload, skipping node labels");
            return Ok(());
        }
        let keys = PlacementLabels::for_runtime(info);
        for node in node_names {
            self.unlabel_node(node, &keys).await?;
        }
        Ok(())
    }

    /// Bring node labels in line with where ready workers actually run.
    ///
    /// Only the symmetric difference is written, so an unchanged placement
    /// produces no writes.
    pub async fn sync_schedule_info_to_cache_nodes(
        &self,
        info: &RuntimeInfo,
        hints: SizeHints,
    ) -> Result<SyncOutcome, PlacementError> {
        let handle = match self.resolve_worker(info).await? {
            WorkerWorkload::Legacy => {
                info!(runtime = %info.qualified_name(), "Legacy worker workload, skipping schedule sync");
                return Ok(SyncOutcome::default());
            }
            WorkerWorkload::Modern(handle) => handle,
        };
        let Some(workload) = handle.workload else {
            debug!(runtime = %info.qualified_name(), "Worker workload not created yet");
            return Ok(SyncOutcome::default());
        };

        let selector = LabelSelector {
            match_labels: workload.spec.pod_labels.clone(),
            match_exists: vec![],
        };
        let scheduled: BTreeSet<String> = self
            .client
            .list_pods(&handle.namespace, &selector)
            .await?
            .into_iter()
            .filter(|p| p.ready && p.is_controlled_by(&workload))
            .filter_map(|p| p.node_name)
            .collect();
        let labeled: BTreeSet<String> = self.labeled_nodes(info).await?.into_iter().collect();

        let outcome = SyncOutcome {
            added: scheduled.difference(&labeled).cloned().collect(),
            removed: labeled.difference(&scheduled).cloned().collect(),
        };
        if outcome.is_empty() {
            return Ok(outcome);
        }

        let keys = PlacementLabels::for_runtime(info);
        for node in &outcome.added {
            self.label_node(node, &keys, info.is_exclusive(), hints)
                .await?;
        }
        for node in &outcome.removed {
            self.unlabel_node(node, &keys).await?;
        }
        info!(
            runtime = %info.qualified_name(),
            added = ?outcome.added,
            removed = ?outcome.removed,
            "Synced schedule info to cache nodes"
        );
        Ok(outcome)
    }

    /// Scale workers to zero and unlabel every node they occupied.
    ///
    /// Holds the scheduler lock for the whole teardown. Returns the number of
    /// nodes unlabeled.
    pub async fn tear_down_workers(&self, info: &RuntimeInfo) -> Result<usize, PlacementError> {
        let _guard = self.scheduler_lock.lock().await;

        let handle = match self.resolve_worker(info).await? {
            WorkerWorkload::Legacy => {
                info!(runtime = %info.qualified_name(), "Legacy worker workload, skipping worker teardown labels");
                return Ok(0);
            }
            WorkerWorkload::Modern(handle) => handle,
        };

        if handle.workload.is_some() {
            let client = self.client.as_ref();
            let handle = &handle;
            retry_on_conflict(&self.retry, || async move {
                let Some(mut workload) = client.get_workload(&handle.namespace, &handle.name).await?
                else {
                    return Ok(());
                };
                if workload.spec.replicas == Some(0) {
                    return Ok(());
                }
                workload.spec.replicas = Some(0);
                client.update_workload(&workload).await?;
                Ok::<(), PlacementError>(())
            })
            .await?;
        }

        let keys = PlacementLabels::for_runtime(info);
        let mut nodes: BTreeSet<String> = self.labeled_nodes(info).await?.into_iter().collect();
        nodes.extend(
            self.client
                .list_nodes(&LabelSelector::matching(&keys.common, "true"))
                .await?
                .into_iter()
                .map(|n| n.metadata.name),
        );
        for node in &nodes {
            self.unlabel_node(node, &keys).await?;
        }
        info!(runtime = %info.qualified_name(), nodes = nodes.len(), "Tore down workers");
        Ok(nodes.len())
    }

    /// Remove the fuse label from every node; returns the number of nodes cleaned
    pub async fn clean_up_fuse_labels(&self, info: &RuntimeInfo) -> Result<usize, PlacementError> {
        let fuse_label = PlacementLabels::for_runtime(info).fuse;
        let nodes = self
            .client
            .list_nodes(&LabelSelector::exists(&fuse_label))
            .await?;

        let client = self.client.as_ref();
        let fuse_label = &fuse_label;
        let mut cleaned = 0;
        for node in nodes {
            let name = node.metadata.name.as_str();
            let removed = retry_on_conflict(&self.retry, || async move {
                let mut node = match client.get_node(name).await {
                    Ok(node) => node,
                    Err(err) if err.is_not_found() => return Ok(false),
                    Err(err) => return Err(err.into()),
                };
                if node.metadata.labels.remove(fuse_label).is_none() {
                    return Ok(false);
                }
                client.update_node(&node).await?;
                Ok::<bool, PlacementError>(true)
            })
            .await?;
            if removed {
                cleaned += 1;
            }
        }
        info!(runtime = %info.qualified_name(), cleaned, "Cleaned up fuse labels");
        Ok(cleaned)
    }

    /// Nodes currently carrying the runtime marker
    pub async fn labeled_nodes(&self, info: &RuntimeInfo) -> Result<Vec<String>, PlacementError> {
        let keys = PlacementLabels::for_runtime(info);
        Ok(self
            .client
            .list_nodes(&LabelSelector::matching(&keys.runtime, "true"))
            .await?
            .into_iter()
            .map(|n| n.metadata.name)
            .collect())
    }

    async fn label_node(
        &self,
        name: &str,
        keys: &PlacementLabels,
        exclusive: bool,
        hints: SizeHints,
    ) -> Result<(), PlacementError> {
        let client = self.client.as_ref();
        let changed = retry_on_conflict(&self.retry, || async move {
            let mut node = client.get_node(name).await?;
            if !apply_add(name, &mut node.metadata.labels, keys, exclusive, hints)? {
                return Ok(false);
            }
            client.update_node(&node).await?;
            Ok::<bool, PlacementError>(true)
        })
        .await?;
        if changed {
            debug!(node = name, label = %keys.runtime, "Labeled cache node");
        }
        Ok(())
    }

    async fn unlabel_node(&self, name: &str, keys: &PlacementLabels) -> Result<(), PlacementError> {
        let client = self.client.as_ref();
        let changed = retry_on_conflict(&self.retry, || async move {
            let mut node = match client.get_node(name).await {
                Ok(node) => node,
                Err(err) if err.is_not_found() => return Ok(false),
                Err(err) => return Err(err.into()),
            };
            if !apply_remove(&mut node.metadata.labels, keys) {
                return Ok(false);
            }
            client.update_node(&node).await?;
            Ok::<bool, PlacementError>(true)
        })
        .await?;
        if changed {
            debug!(node = name, label = %keys.runtime, "Unlabeled cache node");
        }
        Ok(())
    }
}
