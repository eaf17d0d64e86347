//! JuiceFS engine
//!
//! No master: the metadata engine lives outside the cluster. Cache cleanup
//! removes the cache directories on every running worker.

use async_trait::async_trait;
use tracing::{debug, info};

use crate::cluster::runtime::{EngineType, RuntimeInfo};
use crate::engine::backend::{running_worker_pods, with_exec_timeout, CacheBackend, Role};
use crate::engine::{EngineContext, EngineError};

/// Cache directory used when no tier is configured
pub const DEFAULT_CACHE_DIR: &str = "/var/jfsCache";

const METRICS_PORTS: &[&str] = &["metrics"];

/// JuiceFS backend
#[derive(Debug, Clone, Copy, Default)]
pub struct JuicefsBackend;

fn cache_dirs(info: &RuntimeInfo) -> Vec<String> {
    if info.tiered_store.is_empty() {
        return vec![DEFAULT_CACHE_DIR.to_string()];
    }
    info.tiered_store
        .iter()
        .map(|level| level.path.clone())
        .collect()
}

#[async_trait]
impl CacheBackend for JuicefsBackend {
    fn engine_type(&self) -> EngineType {
        EngineType::Juicefs
    }

    fn has_master(&self) -> bool {
        false
    }

    fn port_names(&self, role: Role) -> &'static [&'static str] {
        match role {
            Role::Master => &[],
            Role::Worker | Role::Fuse => METRICS_PORTS,
        }
    }

    fn default_port(&self, _role: Role, _name: &str) -> u16 {
        9567
    }

    async fn cleanup_cache(
        &self,
        ctx: &EngineContext,
        info: &RuntimeInfo,
    ) -> Result<(), EngineError> {
        let Some(pods) = running_worker_pods(ctx, info).await? else {
            debug!(runtime = %info.qualified_name(), "No workers, nothing to clean");
            return Ok(());
        };

        let dirs = cache_dirs(info);
        for pod in &pods {
            for dir in &dirs {
                with_exec_timeout(
                    ctx.settings.exec_timeout,
                    &format!("rm -rf {}", dir),
                    ctx.cache_ops.clean_cache(info, &pod.metadata.name, dir),
                )
                .await?;
            }
        }
        info!(
            runtime = %info.qualified_name(),
            pods = pods.len(),
            ?dirs,
            "Removed worker cache directories"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::cluster::memory::InMemoryCluster;
    use crate::cluster::node::Node;
    use crate::cluster::runtime::{CacheRuntime, MediumType};
    use crate::cluster::workload::Workload;
    use crate::engine::backend::{component_labels, CacheOperations};
    use crate::ports::PortAllocatorHandle;

    #[derive(Default)]
    struct RecordingCache {
        cleaned: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl CacheOperations for RecordingCache {
        async fn cached_bytes(&self, _info: &RuntimeInfo, _pod: &str) -> Result<u64, EngineError> {
            Ok(0)
        }

        async fn clean_cache(
            &self,
            _info: &RuntimeInfo,
            pod: &str,
            path: &str,
        ) -> Result<(), EngineError> {
            self.cleaned
                .lock()
                .unwrap()
                .push((pod.to_string(), path.to_string()));
            Ok(())
        }
    }

    #[test]
    fn test_metrics_ports() {
        let runtime = CacheRuntime::new("default", "jfs", EngineType::Juicefs);
        assert_eq!(JuicefsBackend.ports_needed(&runtime), 2);

        let values = JuicefsBackend.render_values(&runtime, &[21000, 21001]);
        assert!(values.master.is_none());
        assert_eq!(values.host_network_ports(), vec![21000, 21001]);
    }

    #[tokio::test]
    async fn test_cleanup_visits_every_running_worker() {
        let cluster = Arc::new(InMemoryCluster::new().with_simulated_scheduler());
        cluster.insert_node(Node::new("n1"));
        cluster.insert_node(Node::new("n2"));

        let runtime = CacheRuntime::new("default", "jfs", EngineType::Juicefs)
            .with_tier(MediumType::Ssd, "/mnt/ssd", 1 << 30);
        let info = RuntimeInfo::from_runtime(&runtime, None);
        let mut worker = Workload::stateful_set("default", "jfs-worker", 2);
        worker.spec.pod_labels = component_labels(&info, Role::Worker);
        cluster.insert_workload(worker);

        let cache = Arc::new(RecordingCache::default());
        let ctx = EngineContext::new(
            cluster.clone(),
            cluster.clone(),
            Arc::new(PortAllocatorHandle::new()),
        )
        .with_cache_operations(cache.clone());

        JuicefsBackend.cleanup_cache(&ctx, &info).await.unwrap();

        let cleaned = cache.cleaned.lock().unwrap().clone();
        assert_eq!(
            cleaned,
            vec![
                ("jfs-worker-0".to_string(), "/mnt/ssd".to_string()),
                ("jfs-worker-1".to_string(), "/mnt/ssd".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_cleanup_without_workers_is_noop() {
        let cluster = Arc::new(InMemoryCluster::new());
        let ctx = EngineContext::new(
            cluster.clone(),
            cluster,
            Arc::new(PortAllocatorHandle::new()),
        );
        let info = RuntimeInfo::new("default", "jfs", EngineType::Juicefs);

        JuicefsBackend.cleanup_cache(&ctx, &info).await.unwrap();
    }
}
