//! Sources of already-reserved ports for allocator bootstrap

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::allocator::PortError;
use crate::cluster::client::ClusterClient;
use crate::cluster::runtime::RuntimeInfo;
use crate::engine::values::RuntimeValues;

/// Supplies ports held by running runtimes when the allocator starts
#[async_trait]
pub trait ReservedPortsProvider: Send + Sync {
    async fn reserved_ports(&self) -> Result<Vec<u16>, PortError>;
}

/// Fixed list of reserved ports
#[derive(Debug, Clone, Default)]
pub struct StaticReservedPorts {
    ports: Vec<u16>,
}

impl StaticReservedPorts {
    pub fn new(ports: Vec<u16>) -> Self {
        Self { ports }
    }
}

#[async_trait]
impl ReservedPortsProvider for StaticReservedPorts {
    async fn reserved_ports(&self) -> Result<Vec<u16>, PortError> {
        Ok(self.ports.clone())
    }
}

/// Scans every runtime's persisted values for host-network ports.
///
/// Runtimes without a values config map hold no ports yet. A values
/// document that cannot be parsed fails the scan, since starting without it
/// could hand its ports out twice.
pub struct ValuesConfigMapScanner {
    client: Arc<dyn ClusterClient>,
}

impl ValuesConfigMapScanner {
    pub fn new(client: Arc<dyn ClusterClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ReservedPortsProvider for ValuesConfigMapScanner {
    async fn reserved_ports(&self) -> Result<Vec<u16>, PortError> {
        let runtimes = self
            .client
            .list_runtimes()
            .await
            .map_err(|e| PortError::Provider(e.to_string()))?;

        let mut reserved = Vec::new();
        for runtime in &runtimes {
            let info = RuntimeInfo::from_runtime(runtime, None);
            let name = info.values_config_map_name();
            let Some(config_map) = self
                .client
                .get_config_map(&info.namespace, &name)
                .await
                .map_err(|e| PortError::Provider(e.to_string()))?
            else {
                continue;
            };
            let values = RuntimeValues::from_config_map(&config_map)
                .map_err(|e| PortError::Provider(format!("{}/{}: {}", info.namespace, name, e)))?;
            if let Some(values) = values {
                let ports = values.host_network_ports();
                debug!(runtime = %info.qualified_name(), ?ports, "Found reserved ports");
                reserved.extend(ports);
            }
        }
        Ok(reserved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::memory::InMemoryCluster;
    use crate::cluster::runtime::{CacheRuntime, EngineType};
    use crate::cluster::workload::ConfigMap;
    use crate::engine::values::VALUES_DATA_KEY;

    #[tokio::test]
    async fn test_scan_collects_host_network_ports() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.insert_runtime(CacheRuntime::new("default", "hbase", EngineType::Alluxio));
        cluster.insert_runtime(CacheRuntime::new("default", "fresh", EngineType::Alluxio));
        cluster.insert_config_map(ConfigMap::new(
            "default",
            "hbase-alluxio-values",
            VALUES_DATA_KEY,
            "engine: alluxio\nworker:\n  hostNetwork: true\n  ports:\n    rpc: 20005\n",
        ));

        let scanner = ValuesConfigMapScanner::new(cluster);
        assert_eq!(scanner.reserved_ports().await.unwrap(), vec![20005]);
    }

    #[tokio::test]
    async fn test_scan_fails_on_corrupt_values() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.insert_runtime(CacheRuntime::new("default", "hbase", EngineType::Alluxio));
        cluster.insert_config_map(ConfigMap::new(
            "default",
            "hbase-alluxio-values",
            VALUES_DATA_KEY,
            "engine: [not an engine",
        ));

        let scanner = ValuesConfigMapScanner::new(cluster);
        assert!(matches!(
            scanner.reserved_ports().await,
            Err(PortError::Provider(_))
        ));
    }

    #[test]
    fn test_static_ports_are_returned_verbatim() {
        let provider = StaticReservedPorts::new(vec![20001, 20003]);
        let ports = tokio_test::block_on(provider.reserved_ports()).unwrap();
        assert_eq!(ports, vec![20001, 20003]);
    }
}
