//! # Port Allocation
//!
//! Host-networked cache components share the node's network namespace, so
//! their ports must be unique across the cluster. A single allocator per
//! controller process hands them out from a configured range:
//!
//! - [`allocator`]: `PortRange`, the mutex-guarded `PortAllocator`, and the
//!   one-time-init `PortAllocatorHandle` passed to every controller
//! - [`bitmap`]: the lowest-first free set behind the allocator
//! - [`provider`]: bootstrap sources of ports already held by live runtimes

pub mod allocator;
pub mod bitmap;
pub mod provider;

pub use allocator::{AllocationStrategy, PortAllocator, PortAllocatorHandle, PortError, PortRange};
pub use bitmap::PortBitmap;
pub use provider::{ReservedPortsProvider, StaticReservedPorts, ValuesConfigMapScanner};
