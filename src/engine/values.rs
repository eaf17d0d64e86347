//! Rendered release values and their persisted config map
//!
//! The values document is stored under the `data` key of the
//! `<name>-<engine>-values` config map. It is the record of which ports a
//! runtime holds: the reserved-ports scan reads it at startup and shutdown
//! reads it to release them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::cluster::runtime::{EngineType, RuntimeInfo};
use crate::cluster::workload::ConfigMap;

/// Key of the values document inside the config map
pub const VALUES_DATA_KEY: &str = "data";

/// Values for one component
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentValues {
    #[serde(default)]
    pub replicas: u32,

    #[serde(rename = "hostNetwork")]
    #[serde(default)]
    pub host_network: bool,

    /// Named ports, e.g. `rpc`, `web`, `metrics`
    #[serde(default)]
    pub ports: BTreeMap<String, u16>,
}

/// Values rendered for a runtime release
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeValues {
    pub engine: EngineType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master: Option<ComponentValues>,

    #[serde(default)]
    pub worker: ComponentValues,

    #[serde(default)]
    pub fuse: ComponentValues,

    /// Cache directories, one per tier
    #[serde(rename = "cacheDirs")]
    #[serde(default)]
    pub cache_dirs: Vec<String>,
}

impl RuntimeValues {
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    /// Parse the values stored in a config map; `None` when the data key is absent
    pub fn from_config_map(config_map: &ConfigMap) -> Result<Option<Self>, serde_yaml::Error> {
        config_map
            .data
            .get(VALUES_DATA_KEY)
            .map(|text| Self::from_yaml(text))
            .transpose()
    }

    /// The config map persisting these values for a runtime
    pub fn to_config_map(&self, info: &RuntimeInfo) -> Result<ConfigMap, serde_yaml::Error> {
        Ok(ConfigMap::new(
            &info.namespace,
            &info.values_config_map_name(),
            VALUES_DATA_KEY,
            self.to_yaml()?,
        ))
    }

    /// Every port held by a host-networked component
    pub fn host_network_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self
            .master
            .iter()
            .chain([&self.worker, &self.fuse])
            .filter(|c| c.host_network)
            .flat_map(|c| c.ports.values().copied())
            .collect();
        ports.sort_unstable();
        ports.dedup();
        ports
    }
}
