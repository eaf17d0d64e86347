//! Graceful shutdown state machine
//!
//! Shutdown is a fixed sequence of steps. Progress is kept on the controller,
//! so a failed call resumes at the step that failed on the next tick instead
//! of repeating teardown already done. Only cache cleanup is bounded: after
//! `graceful_shutdown_limits` failures it is skipped.

use tracing::{debug, info, warn};

use super::controller::EngineLifecycleController;
use super::values::RuntimeValues;
use super::EngineError;

/// Shutdown steps, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum ShutdownStage {
    #[default]
    CleanupCache,
    DestroyWorkers,
    DestroyMaster,
    ReleasePorts,
    CleanAll,
    Done,
}

impl ShutdownStage {
    fn next(self) -> Self {
        match self {
            ShutdownStage::CleanupCache => ShutdownStage::DestroyWorkers,
            ShutdownStage::DestroyWorkers => ShutdownStage::DestroyMaster,
            ShutdownStage::DestroyMaster => ShutdownStage::ReleasePorts,
            ShutdownStage::ReleasePorts => ShutdownStage::CleanAll,
            ShutdownStage::CleanAll | ShutdownStage::Done => ShutdownStage::Done,
        }
    }
}

/// Shutdown progress carried across reconcile ticks
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownProgress {
    pub stage: ShutdownStage,

    /// Failed cache cleanup attempts so far
    pub cleanup_attempts: u32,
}

impl EngineLifecycleController {
    /// Current shutdown progress
    pub fn shutdown_progress(&self) -> &ShutdownProgress {
        &self.shutdown
    }

    /// Tear the runtime down, resuming wherever a previous call stopped.
    ///
    /// Returns `Ok` once every step has completed; further calls are no-ops.
    pub async fn shutdown(&mut self) -> Result<(), EngineError> {
        loop {
            let stage = self.shutdown.stage;
            match stage {
                ShutdownStage::CleanupCache => self.cleanup_cache().await?,
                ShutdownStage::DestroyWorkers => {
                    self.ctx.labeler.tear_down_workers(&self.info).await?;
                }
                ShutdownStage::DestroyMaster => self.destroy_master().await?,
                ShutdownStage::ReleasePorts => self.release_ports().await?,
                ShutdownStage::CleanAll => self.clean_all().await?,
                ShutdownStage::Done => return Ok(()),
            }
            self.shutdown.stage = stage.next();
            info!(
                runtime = %self.info.qualified_name(),
                completed = ?stage,
                "Shutdown step completed"
            );
        }
    }

    async fn cleanup_cache(&mut self) -> Result<(), EngineError> {
        let limit = self.ctx.settings.graceful_shutdown_limits;
        if self.shutdown.cleanup_attempts >= limit {
            warn!(
                runtime = %self.info.qualified_name(),
                attempts = self.shutdown.cleanup_attempts,
                "Giving up on cache cleanup"
            );
            return Ok(());
        }
        if let Err(err) = self.backend.cleanup_cache(&self.ctx, &self.info).await {
            self.shutdown.cleanup_attempts += 1;
            warn!(
                runtime = %self.info.qualified_name(),
                attempt = self.shutdown.cleanup_attempts,
                limit,
                error = %err,
                "Cache cleanup failed"
            );
            return Err(err);
        }
        Ok(())
    }

    async fn destroy_master(&self) -> Result<(), EngineError> {
        let namespace = &self.info.namespace;
        let release = self.info.release_name();
        if self.ctx.releases.check_release(namespace, release).await? {
            self.ctx.releases.delete_release(namespace, release).await?;
            info!(runtime = %self.info.qualified_name(), "Deleted release");
        }
        Ok(())
    }

    /// Return host-network ports recorded in the values config map.
    ///
    /// A missing config map means the ports cannot be known; that is logged
    /// and skipped. The allocator is only needed when there are ports to return.
    async fn release_ports(&self) -> Result<(), EngineError> {
        let name = self.info.values_config_map_name();
        let Some(config_map) = self
            .ctx
            .client
            .get_config_map(&self.info.namespace, &name)
            .await?
        else {
            info!(
                runtime = %self.info.qualified_name(),
                config_map = %name,
                "Values config map not found, skipping port release"
            );
            return Ok(());
        };

        let ports = RuntimeValues::from_config_map(&config_map)
            .map_err(|e| EngineError::Values(name.clone(), e.to_string()))?
            .map(|values| values.host_network_ports())
            .unwrap_or_default();
        if ports.is_empty() {
            debug!(runtime = %self.info.qualified_name(), "No host-network ports to release");
            return Ok(());
        }
        self.ctx
            .ports
            .get_runtime_port_allocator()?
            .release_reserved_ports(&ports);
        info!(runtime = %self.info.qualified_name(), ?ports, "Released ports");
        Ok(())
    }

    async fn clean_all(&self) -> Result<(), EngineError> {
        let cleaned = self.ctx.labeler.clean_up_fuse_labels(&self.info).await?;
        let namespace = &self.info.namespace;
        for name in [
            self.info.values_config_map_name(),
            self.info.config_map_name(),
        ] {
            self.ctx.client.delete_config_map(namespace, &name).await?;
        }
        info!(
            runtime = %self.info.qualified_name(),
            fuse_nodes = cleaned,
            "Cleaned up runtime leftovers"
        );
        Ok(())
    }
}
