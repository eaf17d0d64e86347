//! Per-runtime lifecycle controller
//!
//! One controller exists per runtime. It is cheap to construct but carries
//! state across reconcile ticks (shutdown progress, last observed fuse
//! count), so the reconciler keeps it cached for the runtime's lifetime.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::backend::{CacheBackend, CacheOperations, NoopCacheOperations, Role};
use super::shutdown::ShutdownProgress;
use super::values::RuntimeValues;
use super::EngineError;
use crate::cluster::client::{ClientError, ClusterClient, ReleaseManager};
use crate::cluster::dataset::DatasetPhase;
use crate::cluster::resources::LabelSelector;
use crate::cluster::retry::{retry_on_conflict, RetryPolicy};
use crate::cluster::runtime::{
    CacheRuntime, ComponentStatus, RuntimeCondition, RuntimeConditionType, RuntimeInfo,
    RuntimeStatus,
};
use crate::cluster::workload::{Workload, WorkloadKind};
use crate::placement::{NodePlacementLabeler, PlacementLabels, SyncOutcome, WorkerAffinity};
use crate::ports::PortAllocatorHandle;

/// Tunables shared by every controller
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Failed cache cleanups tolerated before shutdown proceeds anyway
    pub graceful_shutdown_limits: u32,

    /// Timeout applied to every exec-style cache operation
    pub exec_timeout: Duration,

    /// Retry policy for runtime and dataset status writes
    pub status_retry: RetryPolicy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            graceful_shutdown_limits: 5,
            exec_timeout: Duration::from_secs(1800),
            status_retry: RetryPolicy::bounded(5),
        }
    }
}

/// Collaborators shared by every controller in the process
#[derive(Clone)]
pub struct EngineContext {
    pub client: Arc<dyn ClusterClient>,
    pub releases: Arc<dyn ReleaseManager>,
    pub ports: Arc<PortAllocatorHandle>,
    pub labeler: NodePlacementLabeler,
    pub cache_ops: Arc<dyn CacheOperations>,
    pub settings: EngineSettings,
}

impl EngineContext {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        releases: Arc<dyn ReleaseManager>,
        ports: Arc<PortAllocatorHandle>,
    ) -> Self {
        Self {
            labeler: NodePlacementLabeler::new(client.clone()),
            client,
            releases,
            ports,
            cache_ops: Arc::new(NoopCacheOperations),
            settings: EngineSettings::default(),
        }
    }

    pub fn with_labeler(mut self, labeler: NodePlacementLabeler) -> Self {
        self.labeler = labeler;
        self
    }

    pub fn with_cache_operations(mut self, cache_ops: Arc<dyn CacheOperations>) -> Self {
        self.cache_ops = cache_ops;
        self
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }
}

/// What a setup call did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetupOutcome {
    /// The release was installed by this call
    pub installed: bool,
    /// Workers were scaled to their desired count by this call
    pub workers_scaled: bool,
}

impl SetupOutcome {
    pub fn is_noop(&self) -> bool {
        !self.installed && !self.workers_scaled
    }
}

/// Scale events observed by a replica sync, as `(from, to)`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScaleOutcome {
    pub workers: Option<(u32, u32)>,
    pub fuses: Option<(u32, u32)>,
}

/// Drives one runtime through its lifecycle
pub struct EngineLifecycleController {
    pub(super) ctx: EngineContext,
    pub(super) backend: Arc<dyn CacheBackend>,
    pub(super) info: RuntimeInfo,
    pub(super) shutdown: ShutdownProgress,
    last_fuse_desired: Option<u32>,
}

impl EngineLifecycleController {
    pub fn new(ctx: EngineContext, backend: Arc<dyn CacheBackend>, info: RuntimeInfo) -> Self {
        Self {
            ctx,
            backend,
            info,
            shutdown: ShutdownProgress::default(),
            last_fuse_desired: None,
        }
    }

    pub fn info(&self) -> &RuntimeInfo {
        &self.info
    }

    /// Replace the runtime facts, e.g. after the dataset's placement changed
    pub fn refresh_info(&mut self, info: RuntimeInfo) {
        self.info = info;
    }

    // =========================================================================
    // Setup
    // =========================================================================

    /// Install the runtime's release and bring workers to their desired count.
    ///
    /// Safe to call on every tick: an installed release and initialized
    /// workers make this a no-op.
    pub async fn setup(&self) -> Result<SetupOutcome, EngineError> {
        let runtime = self.fetch_runtime().await?;
        let mut outcome = SetupOutcome::default();

        if !self
            .ctx
            .releases
            .check_release(&self.info.namespace, self.info.release_name())
            .await?
        {
            self.install(&runtime).await?;
            outcome.installed = true;
        }

        if runtime
            .status
            .condition(RuntimeConditionType::WorkersInitialized)
            .is_none()
        {
            self.setup_workers(&runtime).await?;
            outcome.workers_scaled = true;
        }

        if outcome.is_noop() {
            return Ok(outcome);
        }

        let has_master = self.backend.has_master();
        let value_file = self.info.values_config_map_name();
        let workers = runtime.spec.worker.replicas;
        self.update_status(move |status| {
            if outcome.installed {
                if has_master {
                    status.set_condition(RuntimeCondition::new(
                        RuntimeConditionType::MasterInitialized,
                        true,
                        "MasterInitialized",
                        "The master release is installed",
                    ));
                }
                status.set_condition(RuntimeCondition::new(
                    RuntimeConditionType::FusesInitialized,
                    true,
                    "FusesInitialized",
                    "The fuse daemon set is created",
                ));
                status.value_file = Some(value_file.clone());
            }
            if outcome.workers_scaled {
                status.set_condition(RuntimeCondition::new(
                    RuntimeConditionType::WorkersInitialized,
                    true,
                    "WorkersInitialized",
                    format!("Workers scaled to {}", workers),
                ));
            }
        })
        .await?;
        Ok(outcome)
    }

    async fn install(&self, runtime: &CacheRuntime) -> Result<(), EngineError> {
        let values = self.ensure_values(runtime).await?;
        let release = self
            .backend
            .render_release(&self.info, &values, self.fuse_selector(runtime))?;
        self.ctx.releases.install_release(release).await?;
        info!(
            runtime = %self.info.qualified_name(),
            engine = %self.info.engine,
            "Installed release"
        );
        Ok(())
    }

    /// Load the persisted values, or allocate ports and persist new ones.
    ///
    /// Ports are released again when persisting fails, so a failed attempt
    /// leaks nothing and a retry after a later failure reuses the recorded set.
    async fn ensure_values(&self, runtime: &CacheRuntime) -> Result<RuntimeValues, EngineError> {
        let name = self.info.values_config_map_name();
        if let Some(config_map) = self
            .ctx
            .client
            .get_config_map(&self.info.namespace, &name)
            .await?
        {
            let values = RuntimeValues::from_config_map(&config_map)
                .map_err(|e| EngineError::Values(name.clone(), e.to_string()))?
                .ok_or_else(|| EngineError::Values(name.clone(), "missing data key".into()))?;
            debug!(runtime = %self.info.qualified_name(), "Reusing persisted values");
            return Ok(values);
        }

        let needed = self.backend.ports_needed(runtime);
        let allocator = if needed > 0 {
            Some(self.ctx.ports.get_runtime_port_allocator()?)
        } else {
            None
        };
        let ports = match &allocator {
            Some(allocator) => allocator.allocate_reserved_ports(needed)?,
            None => Vec::new(),
        };

        let values = self.backend.render_values(runtime, &ports);
        let persisted = match values.to_config_map(&self.info) {
            Ok(config_map) => self
                .ctx
                .client
                .create_config_map(&config_map)
                .await
                .map(|_| ())
                .map_err(EngineError::from),
            Err(err) => Err(err.into()),
        };
        if let Err(err) = persisted {
            if let Some(allocator) = &allocator {
                allocator.release_reserved_ports(&ports);
            }
            warn!(
                runtime = %self.info.qualified_name(),
                ?ports,
                error = %err,
                "Failed to persist values, released ports"
            );
            return Err(err);
        }

        if !ports.is_empty() {
            info!(runtime = %self.info.qualified_name(), ?ports, "Allocated host network ports");
        }
        Ok(values)
    }

    fn fuse_selector(&self, runtime: &CacheRuntime) -> BTreeMap<String, String> {
        if runtime.spec.fuse.global {
            runtime.spec.fuse.node_selector.clone()
        } else {
            BTreeMap::from([(PlacementLabels::for_runtime(&self.info).fuse, "true".to_string())])
        }
    }

    /// Scale workers to the desired count and stamp their affinity.
    ///
    /// Holds the scheduler lock so no worker teardown interleaves.
    async fn setup_workers(&self, runtime: &CacheRuntime) -> Result<(), EngineError> {
        let lock = self.ctx.labeler.scheduler_lock();
        let _guard = lock.lock().await;

        let desired = runtime.spec.worker.replicas;
        let client = self.ctx.client.as_ref();
        let info = &self.info;
        let name = info.worker_name();
        let name = name.as_str();
        retry_on_conflict(&self.ctx.settings.status_retry, || async move {
            let Some(mut workload) = client.get_workload(&info.namespace, name).await? else {
                return Err(EngineError::Client(ClientError::not_found("Workload", name)));
            };
            if workload.kind == WorkloadKind::DaemonSet {
                return Ok(());
            }
            workload.spec.affinity = Some(WorkerAffinity::for_runtime(
                info,
                workload.spec.affinity.as_ref(),
            ));
            workload.spec.replicas = Some(desired);
            client.update_workload(&workload).await?;
            Ok::<(), EngineError>(())
        })
        .await?;

        info!(runtime = %self.info.qualified_name(), replicas = desired, "Set up workers");
        Ok(())
    }

    // =========================================================================
    // Health
    // =========================================================================

    /// Probe master, then workers, then fuses, stopping at the first failure.
    ///
    /// Observed counts and readiness conditions are recorded on the runtime
    /// status. A failure marks the dataset Failed; success marks it Bound.
    pub async fn check_healthy(&self) -> Result<(), EngineError> {
        let runtime = self.fetch_runtime().await?;

        let mut probes = Vec::new();
        if self.backend.has_master() {
            probes.push((Role::Master, self.info.master_name(), runtime.spec.master.replicas));
        }
        probes.push((Role::Worker, self.info.worker_name(), runtime.spec.worker.replicas));
        probes.push((Role::Fuse, self.info.fuse_name(), 0));

        let mut observed = Vec::new();
        let mut failure = None;
        for (role, name, expected) in probes {
            let status = match self
                .ctx
                .client
                .get_workload(&self.info.namespace, &name)
                .await?
            {
                Some(workload) => ComponentStatus::observe(
                    workload.desired_replicas(),
                    workload.status.replicas,
                    workload.status.ready_replicas,
                    workload.status.available_replicas,
                ),
                None => ComponentStatus::observe(expected, 0, 0, 0),
            };
            let healthy = status.ready >= status.desired;
            if !healthy {
                failure = Some(EngineError::NotReady {
                    component: role.as_str(),
                    runtime: self.info.qualified_name(),
                    ready: status.ready,
                    desired: status.desired,
                });
            }
            observed.push((role, status));
            if failure.is_some() {
                break;
            }
        }

        self.update_status(move |status| {
            for (role, component) in &observed {
                let healthy = component.ready >= component.desired;
                let (slot, condition_type) = match role {
                    Role::Master => (&mut status.master, RuntimeConditionType::MasterReady),
                    Role::Worker => (&mut status.worker, RuntimeConditionType::WorkersReady),
                    Role::Fuse => (&mut status.fuse, RuntimeConditionType::FusesReady),
                };
                *slot = component.clone();
                let reason = if healthy { "Ready" } else { "NotReady" };
                status.set_condition(RuntimeCondition::new(
                    condition_type,
                    healthy,
                    reason,
                    format!(
                        "{}: {}/{} replicas ready",
                        role.as_str(),
                        component.ready,
                        component.desired
                    ),
                ));
            }
        })
        .await?;

        match failure {
            Some(err) => {
                warn!(runtime = %self.info.qualified_name(), error = %err, "Runtime unhealthy");
                self.set_dataset_phase(DatasetPhase::Failed).await?;
                Err(err)
            }
            None => {
                self.set_dataset_phase(DatasetPhase::Bound).await?;
                Ok(())
            }
        }
    }

    async fn set_dataset_phase(&self, phase: DatasetPhase) -> Result<(), EngineError> {
        let client = self.ctx.client.as_ref();
        let info = &self.info;
        retry_on_conflict(&self.ctx.settings.status_retry, || async move {
            let Some(mut dataset) = client.get_dataset(&info.namespace, &info.name).await? else {
                return Ok(());
            };
            if dataset.status.phase == phase {
                return Ok(());
            }
            dataset.status.phase = phase;
            client.update_dataset_status(&dataset).await?;
            debug!(dataset = %info.qualified_name(), ?phase, "Updated dataset phase");
            Ok::<(), EngineError>(())
        })
        .await
    }

    // =========================================================================
    // Scale events
    // =========================================================================

    /// Follow worker replica changes and record fuse count changes.
    ///
    /// Before a scale-in, placement labels come off the nodes whose workers
    /// are going away, under the scheduler lock.
    pub async fn sync_replicas(&mut self) -> Result<ScaleOutcome, EngineError> {
        let runtime = self.fetch_runtime().await?;
        let mut outcome = ScaleOutcome::default();
        let mut conditions = Vec::new();

        let worker = self
            .ctx
            .client
            .get_workload(&self.info.namespace, &self.info.worker_name())
            .await?;
        let initialized = runtime
            .status
            .condition(RuntimeConditionType::WorkersInitialized)
            .is_some();
        if let Some(worker) = worker.filter(|w| w.kind == WorkloadKind::StatefulSet) {
            let current = worker.spec.replicas.unwrap_or(0);
            let desired = runtime.spec.worker.replicas;
            if initialized && current != desired {
                self.scale_workers(&worker, current, desired).await?;
                outcome.workers = Some((current, desired));
                let (condition_type, reason) = if desired > current {
                    (RuntimeConditionType::WorkersScaledOut, "WorkersScaledOut")
                } else {
                    (RuntimeConditionType::WorkersScaledIn, "WorkersScaledIn")
                };
                conditions.push(RuntimeCondition::new(
                    condition_type,
                    true,
                    reason,
                    format!("Workers scaled from {} to {}", current, desired),
                ));
            }
        }

        if let Some(fuse) = self
            .ctx
            .client
            .get_workload(&self.info.namespace, &self.info.fuse_name())
            .await?
        {
            let desired = fuse.desired_replicas();
            if let Some(previous) = self.last_fuse_desired.replace(desired) {
                if previous != desired {
                    outcome.fuses = Some((previous, desired));
                    let (condition_type, reason) = if desired > previous {
                        (RuntimeConditionType::FusesScaledOut, "FusesScaledOut")
                    } else {
                        (RuntimeConditionType::FusesScaledIn, "FusesScaledIn")
                    };
                    conditions.push(RuntimeCondition::new(
                        condition_type,
                        true,
                        reason,
                        format!("Fuses scaled from {} to {}", previous, desired),
                    ));
                }
            }
        }

        if !conditions.is_empty() {
            info!(runtime = %self.info.qualified_name(), ?outcome, "Replicas changed");
            self.update_status(move |status| {
                for condition in &conditions {
                    status.set_condition(condition.clone());
                }
            })
            .await?;
        }
        Ok(outcome)
    }

    async fn scale_workers(
        &self,
        worker: &Workload,
        current: u32,
        desired: u32,
    ) -> Result<(), EngineError> {
        let lock = self.ctx.labeler.scheduler_lock();
        let _guard = lock.lock().await;

        if desired < current {
            let surplus = self.surplus_nodes(worker, desired).await?;
            if !surplus.is_empty() {
                debug!(runtime = %self.info.qualified_name(), ?surplus, "Unlabeling surplus nodes");
                self.ctx
                    .labeler
                    .remove_labels_from_cache_nodes(&surplus, &self.info)
                    .await?;
            }
        }

        let client = self.ctx.client.as_ref();
        let info = &self.info;
        let name = worker.metadata.name.as_str();
        retry_on_conflict(&self.ctx.settings.status_retry, || async move {
            let Some(mut workload) = client.get_workload(&info.namespace, name).await? else {
                return Err(EngineError::Client(ClientError::not_found("Workload", name)));
            };
            workload.spec.replicas = Some(desired);
            client.update_workload(&workload).await?;
            Ok::<(), EngineError>(())
        })
        .await
    }

    /// Nodes that only host worker pods a scale-in to `desired` removes
    async fn surplus_nodes(
        &self,
        worker: &Workload,
        desired: u32,
    ) -> Result<Vec<String>, EngineError> {
        let selector = LabelSelector {
            match_labels: worker.spec.pod_labels.clone(),
            match_exists: vec![],
        };
        let prefix = format!("{}-", worker.metadata.name);
        let mut leaving = BTreeSet::new();
        let mut staying = BTreeSet::new();
        for pod in self
            .ctx
            .client
            .list_pods(&self.info.namespace, &selector)
            .await?
        {
            if !pod.is_controlled_by(worker) {
                continue;
            }
            let Some(node) = pod.node_name.clone() else {
                continue;
            };
            let ordinal = pod
                .metadata
                .name
                .strip_prefix(&prefix)
                .and_then(|s| s.parse::<u32>().ok());
            match ordinal {
                Some(ordinal) if ordinal < desired => staying.insert(node),
                _ => leaving.insert(node),
            };
        }
        Ok(leaving.difference(&staying).cloned().collect())
    }

    // =========================================================================
    // Placement
    // =========================================================================

    /// Align node placement labels with where ready workers run
    pub async fn sync_schedule_info(&self) -> Result<SyncOutcome, EngineError> {
        Ok(self
            .ctx
            .labeler
            .sync_schedule_info_to_cache_nodes(&self.info, self.info.size_hints())
            .await?)
    }

    // =========================================================================
    // Status helpers
    // =========================================================================

    pub(super) async fn fetch_runtime(&self) -> Result<CacheRuntime, EngineError> {
        self.ctx
            .client
            .get_runtime(&self.info.namespace, &self.info.name)
            .await?
            .ok_or_else(|| EngineError::RuntimeNotFound(self.info.qualified_name()))
    }

    /// Re-read the runtime and apply `mutate` to its status, retrying conflicts
    async fn update_status(
        &self,
        mutate: impl Fn(&mut RuntimeStatus) + Send + Sync,
    ) -> Result<(), EngineError> {
        let client = self.ctx.client.as_ref();
        let info = &self.info;
        let mutate = &mutate;
        retry_on_conflict(&self.ctx.settings.status_retry, || async move {
            let Some(mut runtime) = client.get_runtime(&info.namespace, &info.name).await? else {
                return Err(EngineError::RuntimeNotFound(info.qualified_name()));
            };
            let before = runtime.status.clone();
            mutate(&mut runtime.status);
            if runtime.status == before {
                return Ok(());
            }
            client.update_runtime_status(&runtime).await?;
            Ok::<(), EngineError>(())
        })
        .await
    }
}
