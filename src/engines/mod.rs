//! Concrete cache engines
//!
//! - [`alluxio`]: master, workers and fuse; master and workers take
//!   host-network ports
//! - [`juicefs`]: workers and fuse only, each exposing a metrics port

pub mod alluxio;
pub mod juicefs;

use std::sync::Arc;

use crate::cluster::runtime::EngineType;
use crate::engine::CacheBackend;

pub use alluxio::AlluxioBackend;
pub use juicefs::JuicefsBackend;

/// The backend implementing an engine type
pub fn backend_for(engine: EngineType) -> Arc<dyn CacheBackend> {
    match engine {
        EngineType::Alluxio => Arc::new(AlluxioBackend),
        EngineType::Juicefs => Arc::new(JuicefsBackend),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_for_engine() {
        assert_eq!(backend_for(EngineType::Alluxio).engine_type(), EngineType::Alluxio);
        assert!(backend_for(EngineType::Alluxio).has_master());
        assert!(!backend_for(EngineType::Juicefs).has_master());
    }
}
