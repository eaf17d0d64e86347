//! Alluxio engine
//!
//! Cache cleanup asks the master how much data is cached, frees the whole
//! namespace when anything is left, then checks again.

use async_trait::async_trait;
use tracing::{debug, info};

use crate::cluster::runtime::{EngineType, RuntimeInfo};
use crate::engine::backend::{with_exec_timeout, CacheBackend, Role};
use crate::engine::{EngineContext, EngineError};

const MASTER_PORTS: &[&str] = &["rpc", "web"];
const WORKER_PORTS: &[&str] = &["rpc", "web"];

/// Alluxio backend
#[derive(Debug, Clone, Copy, Default)]
pub struct AlluxioBackend;

/// Default port for a component port under container networking
pub fn default_port(role: Role, name: &str) -> u16 {
    match (role, name) {
        (Role::Master, "rpc") => 19998,
        (Role::Master, "web") => 19999,
        (Role::Worker, "rpc") => 29999,
        (Role::Worker, "web") => 30000,
        _ => 0,
    }
}

/// Pod the cache report is read from
fn master_pod(info: &RuntimeInfo) -> String {
    format!("{}-0", info.master_name())
}

#[async_trait]
impl CacheBackend for AlluxioBackend {
    fn engine_type(&self) -> EngineType {
        EngineType::Alluxio
    }

    fn has_master(&self) -> bool {
        true
    }

    fn port_names(&self, role: Role) -> &'static [&'static str] {
        match role {
            Role::Master => MASTER_PORTS,
            Role::Worker => WORKER_PORTS,
            Role::Fuse => &[],
        }
    }

    fn default_port(&self, role: Role, name: &str) -> u16 {
        default_port(role, name)
    }

    async fn cleanup_cache(
        &self,
        ctx: &EngineContext,
        info: &RuntimeInfo,
    ) -> Result<(), EngineError> {
        if ctx
            .client
            .get_workload(&info.namespace, &info.master_name())
            .await?
            .is_none()
        {
            debug!(runtime = %info.qualified_name(), "No master, nothing to clean");
            return Ok(());
        }

        let pod = master_pod(info);
        let timeout = ctx.settings.exec_timeout;
        let cached = with_exec_timeout(
            timeout,
            "alluxio report",
            ctx.cache_ops.cached_bytes(info, &pod),
        )
        .await?;
        if cached == 0 {
            return Ok(());
        }

        info!(runtime = %info.qualified_name(), cached, "Freeing cached data");
        with_exec_timeout(
            timeout,
            "alluxio free /",
            ctx.cache_ops.clean_cache(info, &pod, "/"),
        )
        .await?;

        let remaining = with_exec_timeout(
            timeout,
            "alluxio report",
            ctx.cache_ops.cached_bytes(info, &pod),
        )
        .await?;
        if remaining > 0 {
            return Err(EngineError::CacheNotCleaned {
                runtime: info.qualified_name(),
                bytes: remaining,
            });
        }
        Ok(())
    }
}
