//! # cacheplane
//!
//! Placement, port and lifecycle orchestration for distributed cache
//! runtimes.
//!
//! - [`ports`]: cluster-unique host-network port allocation
//! - [`placement`]: node labels recording where each dataset's cache lives
//! - [`engine`]: the lifecycle every cache engine goes through
//! - [`engines`]: Alluxio and JuiceFS backends
//! - [`reconciler`]: the loop driving all runtimes

pub mod cli;
pub mod cluster;
pub mod config;
pub mod engine;
pub mod engines;
pub mod placement;
pub mod ports;
pub mod reconciler;
