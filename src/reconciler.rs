//! Reconcile loop - drives every runtime's lifecycle on a tick
//!
//! Each tick lists runtimes and reconciles them concurrently. Controllers are
//! cached per runtime so shutdown progress survives between ticks. A failed
//! step is logged and retried on the next tick.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::cluster::client::ClientError;
use crate::cluster::runtime::{CacheRuntime, RuntimeInfo};
use crate::engine::{EngineContext, EngineError, EngineLifecycleController};
use crate::engines::backend_for;

/// Configuration for the reconcile loop
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Seconds between reconcile passes
    pub reconcile_interval_secs: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: 10,
        }
    }
}

/// Result of reconciling one runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileState {
    /// Lifecycle steps all succeeded
    Running,
    /// Shutdown finished and the runtime object was removed
    Deleted,
}

/// Counts from one reconcile pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub running: usize,
    pub deleted: usize,
    pub requeued: usize,
}

type SharedController = Arc<Mutex<EngineLifecycleController>>;

/// Reconciles cache runtimes against the cluster
#[derive(Clone)]
pub struct Reconciler {
    ctx: EngineContext,
    controllers: Arc<DashMap<String, SharedController>>,
}

impl Reconciler {
    pub fn new(ctx: EngineContext) -> Self {
        Self {
            ctx,
            controllers: Arc::new(DashMap::new()),
        }
    }

    /// Number of cached controllers
    pub fn controller_count(&self) -> usize {
        self.controllers.len()
    }

    /// Reconcile every runtime once
    pub async fn reconcile_all(&self) -> Result<ReconcileSummary, ClientError> {
        let runtimes = self.ctx.client.list_runtimes().await?;
        debug!(count = runtimes.len(), "Reconciling runtimes");

        let results = join_all(runtimes.iter().map(|runtime| self.reconcile(runtime))).await;
        self.prune_controllers(&runtimes);

        let mut summary = ReconcileSummary::default();
        for (runtime, result) in runtimes.iter().zip(results) {
            let name = runtime.metadata.qualified_name();
            match result {
                Ok(ReconcileState::Running) => summary.running += 1,
                Ok(ReconcileState::Deleted) => summary.deleted += 1,
                Err(err) if err.is_precondition() => {
                    info!(runtime = %name, error = %err, "Precondition not met, requeueing");
                    summary.requeued += 1;
                }
                Err(err) => {
                    warn!(runtime = %name, error = %err, "Reconcile failed, requeueing");
                    summary.requeued += 1;
                }
            }
        }
        Ok(summary)
    }

    /// Drop cached controllers whose runtime no longer exists
    fn prune_controllers(&self, runtimes: &[CacheRuntime]) {
        let live: HashSet<String> = runtimes
            .iter()
            .map(|runtime| runtime.metadata.qualified_name())
            .collect();
        self.controllers.retain(|key, _| {
            let keep = live.contains(key);
            if !keep {
                debug!(runtime = %key, "Runtime gone, dropping its controller");
            }
            keep
        });
    }

    /// Run one runtime through setup, scaling, placement sync and health, or
    /// through shutdown when its deletion was requested.
    ///
    /// Health comes last so an unready runtime still follows spec changes.
    pub async fn reconcile(&self, runtime: &CacheRuntime) -> Result<ReconcileState, EngineError> {
        let key = runtime.metadata.qualified_name();
        let namespace = &runtime.metadata.namespace;
        let name = &runtime.metadata.name;

        let dataset = self.ctx.client.get_dataset(namespace, name).await?;
        let info = RuntimeInfo::from_runtime(runtime, dataset.as_ref());
        let controller = self
            .controllers
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(EngineLifecycleController::new(
                    self.ctx.clone(),
                    backend_for(runtime.spec.engine),
                    info.clone(),
                )))
            })
            .value()
            .clone();
        let mut controller = controller.lock().await;

        if runtime.deletion_requested() {
            controller.shutdown().await?;
            self.ctx.client.delete_runtime(namespace, name).await?;
            self.controllers.remove(&key);
            info!(runtime = %key, "Runtime shut down and deleted");
            return Ok(ReconcileState::Deleted);
        }

        controller.refresh_info(info);
        controller.setup().await?;
        controller.sync_replicas().await?;
        controller.sync_schedule_info().await?;
        controller.check_healthy().await?;
        Ok(ReconcileState::Running)
    }
}

/// Spawn the reconcile loop as a background task
pub fn spawn_reconciler(reconciler: Reconciler, config: ReconcilerConfig) -> watch::Sender<()> {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(());

    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(config.reconcile_interval_secs.max(1)));

        info!(
            "Reconciler started, reconciling every {}s",
            config.reconcile_interval_secs
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match reconciler.reconcile_all().await {
                        Ok(summary) => debug!(?summary, "Reconcile pass finished"),
                        Err(e) => warn!("Failed to list runtimes: {}", e),
                    }
                }
                _ = shutdown_rx.changed() => {
                    info!("Reconciler shutting down");
                    break;
                }
            }
        }
    });

    shutdown_tx
}
