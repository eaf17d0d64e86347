//! # Cache Placement
//!
//! Placement state lives on node labels so any controller replica can rebuild
//! it after a restart:
//!
//! - [`labels`]: key naming, capacity hint formatting, `dataset-num` helpers
//! - [`labeler`]: conflict-retried read-modify-write of node labels
//! - [`affinity`]: scheduling affinity stamped onto worker workloads
//!
//! Exclusive datasets mark their nodes with `fluid_exclusive`; no other
//! dataset may be labeled onto such a node, and an exclusive dataset may not
//! join a node that already hosts others.

pub mod affinity;
pub mod labeler;
pub mod labels;

pub use affinity::WorkerAffinity;
pub use labeler::{
    NodePlacementLabeler, PlacementError, SchedulerLock, SyncOutcome, WorkerHandle,
    WorkerWorkload,
};
pub use labels::{PlacementLabels, SizeHints};
