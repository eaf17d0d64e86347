//! Engine backend abstraction
//!
//! A backend describes one cache engine: which components it runs, which
//! named ports each component needs, how its release is rendered, and how
//! its cache is drained before shutdown. Exec-style probes inside running
//! containers go through [`CacheOperations`].

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use super::controller::EngineContext;
use super::values::{ComponentValues, RuntimeValues};
use super::EngineError;
use crate::cluster::resources::{LabelSelector, ObjectMeta};
use crate::cluster::runtime::{CacheRuntime, EngineType, NetworkMode, RuntimeInfo};
use crate::cluster::workload::{Pod, Release, Workload, WorkloadKind};
use crate::placement::labels::{PlacementLabels, DATASET_ID_LABEL, DATASET_PLACEMENT_LABEL};

/// Component role within a runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Worker,
    Fuse,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Master => "master",
            Role::Worker => "worker",
            Role::Fuse => "fuse",
        }
    }
}

/// Exec collaborator for commands run inside cache containers
#[async_trait]
pub trait CacheOperations: Send + Sync {
    /// Bytes currently cached by the runtime, as reported from `pod`
    async fn cached_bytes(&self, info: &RuntimeInfo, pod: &str) -> Result<u64, EngineError>;

    /// Drop cached data under `path`
    async fn clean_cache(&self, info: &RuntimeInfo, pod: &str, path: &str)
        -> Result<(), EngineError>;
}

/// Exec collaborator that reports an empty cache
#[derive(Debug, Clone, Default)]
pub struct NoopCacheOperations;

#[async_trait]
impl CacheOperations for NoopCacheOperations {
    async fn cached_bytes(&self, _info: &RuntimeInfo, _pod: &str) -> Result<u64, EngineError> {
        Ok(0)
    }

    async fn clean_cache(
        &self,
        _info: &RuntimeInfo,
        _pod: &str,
        _path: &str,
    ) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Run an exec-style call under a fixed timeout
pub async fn with_exec_timeout<T>(
    timeout: Duration,
    what: &str,
    fut: impl Future<Output = Result<T, EngineError>>,
) -> Result<T, EngineError> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| EngineError::ExecTimeout(what.to_string(), timeout))?
}

/// One cache engine
#[async_trait]
pub trait CacheBackend: Send + Sync {
    fn engine_type(&self) -> EngineType;

    /// Whether the engine runs a master component
    fn has_master(&self) -> bool;

    /// Port names a component needs, in allocation order
    fn port_names(&self, role: Role) -> &'static [&'static str];

    /// Fixed port used under container networking
    fn default_port(&self, role: Role, name: &str) -> u16;

    /// Drain cached data before the runtime is torn down
    async fn cleanup_cache(&self, ctx: &EngineContext, info: &RuntimeInfo)
        -> Result<(), EngineError>;

    /// Number of ports to allocate for the runtime's host-networked components
    fn ports_needed(&self, runtime: &CacheRuntime) -> usize {
        roles(self.has_master())
            .into_iter()
            .filter(|role| network_mode(runtime, *role) == NetworkMode::HostNetwork)
            .map(|role| self.port_names(role).len())
            .sum()
    }

    /// Render values, assigning `allocated` ports to host-networked components
    fn render_values(&self, runtime: &CacheRuntime, allocated: &[u16]) -> RuntimeValues {
        let mut allocated = allocated.iter().copied();
        let mut component = |role: Role, replicas: u32| {
            let host_network = network_mode(runtime, role) == NetworkMode::HostNetwork;
            let ports: BTreeMap<String, u16> = self
                .port_names(role)
                .iter()
                .map(|name| {
                    let port = if host_network {
                        allocated.next()
                    } else {
                        None
                    };
                    (
                        name.to_string(),
                        port.unwrap_or_else(|| self.default_port(role, name)),
                    )
                })
                .collect();
            ComponentValues {
                replicas,
                host_network,
                ports,
            }
        };

        let master = self
            .has_master()
            .then(|| component(Role::Master, runtime.spec.master.replicas));
        let worker = component(Role::Worker, runtime.spec.worker.replicas);
        let fuse = component(Role::Fuse, 0);
        RuntimeValues {
            engine: self.engine_type(),
            master,
            worker,
            fuse,
            cache_dirs: runtime
                .spec
                .tiered_store
                .iter()
                .map(|level| level.path.clone())
                .collect(),
        }
    }

    /// Render the release installing the runtime's workloads.
    ///
    /// Workers start at zero replicas and are scaled by worker setup.
    fn render_release(
        &self,
        info: &RuntimeInfo,
        values: &RuntimeValues,
        fuse_selector: BTreeMap<String, String>,
    ) -> Result<Release, EngineError> {
        let mut workloads = Vec::new();
        if let Some(master) = &values.master {
            let mut sts =
                Workload::stateful_set(&info.namespace, &info.master_name(), master.replicas);
            sts.spec.pod_labels = component_labels(info, Role::Master);
            workloads.push(sts);
        }

        let mut worker = Workload::stateful_set(&info.namespace, &info.worker_name(), 0);
        worker.spec.pod_labels = component_labels(info, Role::Worker);
        worker.spec.pod_labels.insert(
            DATASET_ID_LABEL.to_string(),
            PlacementLabels::dataset_id(info),
        );
        worker.spec.pod_labels.insert(
            DATASET_PLACEMENT_LABEL.to_string(),
            format!("{:?}", info.placement),
        );
        workloads.push(worker);

        let mut fuse = Workload::daemon_set(&info.namespace, &info.fuse_name());
        fuse.spec.pod_labels = component_labels(info, Role::Fuse);
        fuse.spec.node_selector = fuse_selector;
        workloads.push(fuse);

        Ok(Release {
            metadata: ObjectMeta::namespaced(info.namespace.clone(), info.release_name()),
            chart: self.engine_type().to_string(),
            values: values.to_yaml()?,
            workloads,
        })
    }
}

fn roles(has_master: bool) -> Vec<Role> {
    if has_master {
        vec![Role::Master, Role::Worker, Role::Fuse]
    } else {
        vec![Role::Worker, Role::Fuse]
    }
}

fn network_mode(runtime: &CacheRuntime, role: Role) -> NetworkMode {
    match role {
        Role::Master => runtime.spec.master.network_mode,
        Role::Worker => runtime.spec.worker.network_mode,
        Role::Fuse => runtime.spec.fuse.network_mode,
    }
}

/// Labels stamped on a component's pods
pub fn component_labels(info: &RuntimeInfo, role: Role) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), info.engine.to_string()),
        ("release".to_string(), info.name.clone()),
        ("role".to_string(), format!("{}-{}", info.engine, role.as_str())),
    ])
}

/// Ready, bound pods of the runtime's worker workload.
///
/// `None` when the worker workload no longer exists.
pub async fn running_worker_pods(
    ctx: &EngineContext,
    info: &RuntimeInfo,
) -> Result<Option<Vec<Pod>>, EngineError> {
    let Some(workload) = ctx
        .client
        .get_workload(&info.namespace, &info.worker_name())
        .await?
    else {
        return Ok(None);
    };
    if workload.kind != WorkloadKind::StatefulSet {
        return Ok(Some(vec![]));
    }
    let selector = LabelSelector {
        match_labels: workload.spec.pod_labels.clone(),
        match_exists: vec![],
    };
    let pods = ctx
        .client
        .list_pods(&info.namespace, &selector)
        .await?
        .into_iter()
        .filter(|p| p.ready && p.node_name.is_some() && p.is_controlled_by(&workload))
        .collect();
    Ok(Some(pods))
}
