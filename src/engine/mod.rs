//! # Engine Lifecycle
//!
//! Every cache engine runs through the same lifecycle, driven one reconcile
//! tick at a time:
//!
//! ```text
//!   setup ──▶ check_healthy ──▶ sync_replicas ──▶ sync_schedule_info
//!     │                                                   │
//!     └──────────────── (deletion requested) ─────────────┘
//!                               │
//!                               ▼
//!   shutdown: CleanupCache ▶ DestroyWorkers ▶ DestroyMaster ▶ ReleasePorts ▶ CleanAll
//! ```
//!
//! Engine-specific behavior (port names, rendered workloads, cache cleanup)
//! sits behind [`CacheBackend`]; everything else is shared.

pub mod backend;
pub mod controller;
pub mod shutdown;
pub mod values;

use std::time::Duration;

use thiserror::Error;

use crate::cluster::client::ClientError;
use crate::cluster::retry::ConflictError;
use crate::placement::PlacementError;
use crate::ports::PortError;

pub use backend::{CacheBackend, CacheOperations, NoopCacheOperations, Role};
pub use controller::{
    EngineContext, EngineLifecycleController, EngineSettings, ScaleOutcome, SetupOutcome,
};
pub use shutdown::{ShutdownProgress, ShutdownStage};
pub use values::{ComponentValues, RuntimeValues};

/// Errors raised by lifecycle operations; all of them requeue the runtime
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Port(#[from] PortError),

    #[error(transparent)]
    Placement(#[from] PlacementError),

    #[error("Invalid values for '{0}': {1}")]
    Values(String, String),

    #[error("Runtime '{0}' not found")]
    RuntimeNotFound(String),

    #[error("{component} of '{runtime}' not ready: {ready}/{desired} replicas ready")]
    NotReady {
        component: &'static str,
        runtime: String,
        ready: u32,
        desired: u32,
    },

    #[error("Cache of '{runtime}' still holds {bytes} bytes after cleanup")]
    CacheNotCleaned { runtime: String, bytes: u64 },

    #[error("Exec '{0}' timed out after {1:?}")]
    ExecTimeout(String, Duration),

    #[error("Exec failed: {0}")]
    Exec(String),
}

impl EngineError {
    /// Errors caused by allocator state rather than the runtime itself
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            EngineError::Port(PortError::NotInitialized)
                | EngineError::Port(PortError::InsufficientPorts { .. })
        )
    }
}

impl ConflictError for EngineError {
    fn is_conflict(&self) -> bool {
        match self {
            EngineError::Client(err) => err.is_conflict(),
            EngineError::Placement(err) => err.is_conflict(),
            _ => false,
        }
    }
}

impl From<serde_yaml::Error> for EngineError {
    fn from(err: serde_yaml::Error) -> Self {
        EngineError::Values("values document".to_string(), err.to_string())
    }
}
