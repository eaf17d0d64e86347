//! Node label keys and values used to record cache placement
//!
//! ```text
//! fluid.io/dataset-num                      = "2"
//! fluid.io/s-alluxio-default-hbase          = "true"
//! fluid.io/s-default-hbase                  = "true"
//! fluid.io/s-h-alluxio-m-default-hbase      = "1GiB"
//! fluid.io/s-h-alluxio-d-default-hbase      = "2GiB"
//! fluid.io/s-h-alluxio-t-default-hbase      = "3GiB"
//! fluid_exclusive                           = "default_hbase"
//! fluid.io/f-default-hbase                  = "true"
//! ```

use std::collections::BTreeMap;

use uuid::Uuid;

use crate::cluster::runtime::RuntimeInfo;

/// Counter of datasets with cache capacity on a node
pub const DATASET_NUM_LABEL: &str = "fluid.io/dataset-num";

/// Exclusive owner marker
pub const EXCLUSIVE_LABEL: &str = "fluid_exclusive";

/// Pod label naming the dataset a worker serves
pub const DATASET_ID_LABEL: &str = "fluid.io/dataset";

/// Pod label carrying the dataset's placement mode
pub const DATASET_PLACEMENT_LABEL: &str = "fluid.io/dataset-placement";

/// Prefix shared by all placement labels
pub const STORAGE_PREFIX: &str = "fluid.io/s-";

/// Prefix of fuse placement labels
pub const FUSE_PREFIX: &str = "fluid.io/f-";

/// Maximum length of a label key name segment
const MAX_LABEL_LENGTH: usize = 63;

/// Per-node capacity hints published next to the presence markers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SizeHints {
    pub mem_bytes: u64,
    pub disk_bytes: u64,
}

impl SizeHints {
    pub fn total_bytes(&self) -> u64 {
        self.mem_bytes + self.disk_bytes
    }
}

/// `prefix + "<namespace>-<name>"`, falling back to `prefix + uid` when the
/// namespaced form is too long and the dataset uid is known
pub fn namespaced_key(prefix: &str, namespace: &str, name: &str, uid: Option<Uuid>) -> String {
    let full = format!("{}{}-{}", prefix, namespace, name);
    if full.len() < MAX_LABEL_LENGTH {
        return full;
    }
    match uid {
        Some(uid) => format!("{}{}", prefix, uid),
        None => {
            tracing::info!(key = %full, "Dataset uid unknown, keeping overlong label key");
            full
        }
    }
}

/// The set of label keys one runtime owns on a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementLabels {
    /// `fluid.io/s-<engine>-<ns>-<ds>`
    pub runtime: String,
    /// `fluid.io/s-<ns>-<ds>`
    pub common: String,
    /// `fluid.io/s-h-<engine>-m-<ns>-<ds>`
    pub memory: String,
    /// `fluid.io/s-h-<engine>-d-<ns>-<ds>`
    pub disk: String,
    /// `fluid.io/s-h-<engine>-t-<ns>-<ds>`
    pub total: String,
    /// `fluid.io/f-<ns>-<ds>`
    pub fuse: String,
    /// `<ns>_<ds>`
    pub exclusive_value: String,
}

impl PlacementLabels {
    pub fn for_runtime(info: &RuntimeInfo) -> Self {
        let ns = info.namespace.as_str();
        let name = info.name.as_str();
        let uid = info.owner_dataset_uid;
        let engine = info.engine.as_str();
        let human = |medium: &str| format!("{}h-{}-{}-", STORAGE_PREFIX, engine, medium);

        Self {
            runtime: namespaced_key(&format!("{}{}-", STORAGE_PREFIX, engine), ns, name, uid),
            common: namespaced_key(STORAGE_PREFIX, ns, name, uid),
            memory: namespaced_key(&human("m"), ns, name, uid),
            disk: namespaced_key(&human("d"), ns, name, uid),
            total: namespaced_key(&human("t"), ns, name, uid),
            fuse: namespaced_key(FUSE_PREFIX, ns, name, uid),
            exclusive_value: format!("{}_{}", ns, name),
        }
    }

    /// Keys removed when the runtime leaves a node
    pub fn owned_keys(&self) -> [&str; 5] {
        [
            &self.runtime,
            &self.total,
            &self.disk,
            &self.memory,
            &self.common,
        ]
    }

    /// Dataset id stamped on worker pods
    pub fn dataset_id(info: &RuntimeInfo) -> String {
        namespaced_key("", &info.namespace, &info.name, info.owner_dataset_uid)
    }
}

/// Parsed `fluid.io/dataset-num`, treating a missing or garbled value as 0
pub fn dataset_num(labels: &BTreeMap<String, String>) -> u32 {
    labels
        .get(DATASET_NUM_LABEL)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

/// Write `fluid.io/dataset-num`, removing the key at zero
pub fn set_dataset_num(labels: &mut BTreeMap<String, String>, value: u32) {
    if value == 0 {
        labels.remove(DATASET_NUM_LABEL);
    } else {
        labels.insert(DATASET_NUM_LABEL.to_string(), value.to_string());
    }
}

/// Human-readable binary size, e.g. `2GiB` or `1.5GiB`
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];

    let mut unit = 0;
    let mut scaled = bytes as f64;
    while scaled >= 1024.0 && unit < UNITS.len() - 1 {
        scaled /= 1024.0;
        unit += 1;
    }

    let rounded = format!("{:.2}", scaled);
    let trimmed = rounded.trim_end_matches('0').trim_end_matches('.');
    format!("{}{}", trimmed, UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::runtime::EngineType;

    #[test]
    fn test_label_shapes() {
        let info = RuntimeInfo::new("default", "hbase", EngineType::Alluxio);
        let labels = PlacementLabels::for_runtime(&info);

        assert_eq!(labels.runtime, "fluid.io/s-alluxio-default-hbase");
        assert_eq!(labels.common, "fluid.io/s-default-hbase");
        assert_eq!(labels.memory, "fluid.io/s-h-alluxio-m-default-hbase");
        assert_eq!(labels.disk, "fluid.io/s-h-alluxio-d-default-hbase");
        assert_eq!(labels.total, "fluid.io/s-h-alluxio-t-default-hbase");
        assert_eq!(labels.fuse, "fluid.io/f-default-hbase");
        assert_eq!(labels.exclusive_value, "default_hbase");
    }

    #[test]
    fn test_long_key_falls_back_to_uid() {
        let name = "a-really-long-dataset-name-that-keeps-going-and-going";
        let uid = Uuid::new_v4();

        let short = namespaced_key(STORAGE_PREFIX, "default", "hbase", Some(uid));
        assert_eq!(short, "fluid.io/s-default-hbase");

        let long = namespaced_key(STORAGE_PREFIX, "default", name, Some(uid));
        assert_eq!(long, format!("fluid.io/s-{}", uid));

        let kept = namespaced_key(STORAGE_PREFIX, "default", name, None);
        assert_eq!(kept, format!("fluid.io/s-default-{}", name));
    }

    #[test]
    fn test_dataset_num_helpers() {
        let mut labels = BTreeMap::new();
        assert_eq!(dataset_num(&labels), 0);

        set_dataset_num(&mut labels, 2);
        assert_eq!(dataset_num(&labels), 2);

        set_dataset_num(&mut labels, 0);
        assert!(!labels.contains_key(DATASET_NUM_LABEL));

        labels.insert(DATASET_NUM_LABEL.to_string(), "garbage".to_string());
        assert_eq!(dataset_num(&labels), 0);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0B");
        assert_eq!(format_bytes(512), "512B");
        assert_eq!(format_bytes(2 << 30), "2GiB");
        assert_eq!(format_bytes(3 << 29), "1.5GiB");
        assert_eq!(format_bytes(100 << 20), "100MiB");
    }
}
