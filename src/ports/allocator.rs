//! Port allocator for host-networked runtime components
//!
//! One allocator exists per controller process. It is created by
//! [`PortAllocatorHandle::setup`], seeded with the ports that running
//! runtimes already hold, and shared by every lifecycle controller.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use super::bitmap::PortBitmap;
use super::provider::ReservedPortsProvider;

/// Errors from port allocation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PortError {
    #[error("Invalid port range '{0}': {1}")]
    InvalidRange(String, String),

    #[error("Unknown port allocation strategy '{0}'")]
    UnknownStrategy(String),

    #[error("Insufficient ports: requested {requested}, only {available} available")]
    InsufficientPorts { requested: usize, available: usize },

    #[error("Port allocator is not initialized")]
    NotInitialized,

    #[error("Port allocator is already initialized")]
    AlreadyInitialized,

    #[error("Failed to collect reserved ports: {0}")]
    Provider(String),
}

/// Inclusive port interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl PortRange {
    pub fn new(min: u16, max: u16) -> Result<Self, PortError> {
        let text = format!("{}-{}", min, max);
        if min == 0 {
            return Err(PortError::InvalidRange(text, "port 0 is reserved".into()));
        }
        if min > max {
            return Err(PortError::InvalidRange(text, "min exceeds max".into()));
        }
        Ok(Self { min, max })
    }

    /// Number of ports in the range
    pub fn len(&self) -> usize {
        usize::from(self.max - self.min) + 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.min..=self.max).contains(&port)
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            min: 20000,
            max: 26000,
        }
    }
}

impl FromStr for PortRange {
    type Err = PortError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| PortError::InvalidRange(s.to_string(), reason.to_string());
        let (min, max) = s
            .trim()
            .split_once('-')
            .ok_or_else(|| invalid("expected 'min-max'"))?;
        let min = min.trim().parse().map_err(|_| invalid("bad lower bound"))?;
        let max = max.trim().parse().map_err(|_| invalid("bad upper bound"))?;
        PortRange::new(min, max)
    }
}

impl TryFrom<String> for PortRange {
    type Error = PortError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PortRange> for String {
    fn from(range: PortRange) -> Self {
        range.to_string()
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.min, self.max)
    }
}

/// How free ports are chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationStrategy {
    /// Lowest free port first
    #[default]
    Bitmap,
    /// Uniformly chosen free port
    Random,
}

impl FromStr for AllocationStrategy {
    type Err = PortError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bitmap" => Ok(AllocationStrategy::Bitmap),
            "random" => Ok(AllocationStrategy::Random),
            other => Err(PortError::UnknownStrategy(other.to_string())),
        }
    }
}

/// Mutex-guarded allocator over a port range
#[derive(Debug)]
pub struct PortAllocator {
    range: PortRange,
    strategy: AllocationStrategy,
    bitmap: Mutex<PortBitmap>,
    rng: Mutex<StdRng>,
}

impl PortAllocator {
    /// Create an allocator with `reserved` already marked; out-of-range
    /// reservations are ignored
    pub fn new(range: PortRange, strategy: AllocationStrategy, reserved: &[u16]) -> Self {
        let mut bitmap = PortBitmap::new(range);
        for &port in reserved {
            if !bitmap.mark(port) && !range.contains(port) {
                debug!(port, %range, "Reserved port outside range, ignoring");
            }
        }
        Self {
            range,
            strategy,
            bitmap: Mutex::new(bitmap),
            rng: Mutex::new(StdRng::seed_from_u64(rand::random())),
        }
    }

    /// Make random picks reproducible
    pub fn with_seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            ..self
        }
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    pub fn strategy(&self) -> AllocationStrategy {
        self.strategy
    }

    // The bitmap has no multi-step updates, so a poisoned guard is still valid
    fn bitmap(&self) -> MutexGuard<'_, PortBitmap> {
        self.bitmap.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate `n` distinct free ports, all or nothing
    pub fn allocate_reserved_ports(&self, n: usize) -> Result<Vec<u16>, PortError> {
        let mut bitmap = self.bitmap();
        if bitmap.available() < n {
            return Err(PortError::InsufficientPorts {
                requested: n,
                available: bitmap.available(),
            });
        }

        let mut ports = Vec::with_capacity(n);
        while ports.len() < n {
            let next = match self.strategy {
                AllocationStrategy::Bitmap => bitmap.first_free(),
                AllocationStrategy::Random => {
                    let pick = self
                        .rng
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .random_range(0..bitmap.available());
                    bitmap.nth_free(pick)
                }
            };
            let Some(port) = next else {
                break;
            };
            bitmap.mark(port);
            ports.push(port);
        }
        debug!(?ports, "Allocated ports");
        Ok(ports)
    }

    /// Free ports; unknown or already-free ports are ignored
    pub fn release_reserved_ports(&self, ports: &[u16]) {
        let mut bitmap = self.bitmap();
        for &port in ports {
            if !bitmap.clear(port) {
                debug!(port, "Port not allocated, nothing to release");
            }
        }
    }

    /// Number of ports currently allocated
    pub fn allocated(&self) -> usize {
        self.bitmap().allocated()
    }

    pub fn is_allocated(&self, port: u16) -> bool {
        self.bitmap().is_allocated(port)
    }
}

/// One-time-initialized slot holding the process allocator
#[derive(Debug, Default)]
pub struct PortAllocatorHandle {
    slot: RwLock<Option<Arc<PortAllocator>>>,
    seed: Option<u64>,
}

impl PortAllocatorHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed every allocator this handle creates
    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    /// Initialize the allocator, seeding it from `provider`.
    ///
    /// Fails with [`PortError::AlreadyInitialized`] unless torn down first.
    pub async fn setup(
        &self,
        range: PortRange,
        strategy: AllocationStrategy,
        provider: &dyn ReservedPortsProvider,
    ) -> Result<Arc<PortAllocator>, PortError> {
        if self.read_slot().is_some() {
            return Err(PortError::AlreadyInitialized);
        }

        let reserved = provider.reserved_ports().await?;
        let mut allocator = PortAllocator::new(range, strategy, &reserved);
        if let Some(seed) = self.seed {
            allocator = allocator.with_seed(seed);
        }
        let allocator = Arc::new(allocator);

        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Err(PortError::AlreadyInitialized);
        }
        *slot = Some(allocator.clone());

        info!(
            %range,
            ?strategy,
            reserved = allocator.allocated(),
            "Port allocator initialized"
        );
        Ok(allocator)
    }

    /// Drop the allocator so `setup` can run again
    pub fn teardown(&self) {
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// The process allocator, or [`PortError::NotInitialized`]
    pub fn get_runtime_port_allocator(&self) -> Result<Arc<PortAllocator>, PortError> {
        self.read_slot().ok_or(PortError::NotInitialized)
    }

    fn read_slot(&self) -> Option<Arc<PortAllocator>> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::provider::StaticReservedPorts;

    #[test]
    fn test_parse_range() {
        let range: PortRange = "14000-14003".parse().unwrap();
        assert_eq!(range, PortRange::new(14000, 14003).unwrap());
        assert_eq!(range.len(), 4);
        assert_eq!(range.to_string(), "14000-14003");

        assert!("14003-14000".parse::<PortRange>().is_err());
        assert!("0-100".parse::<PortRange>().is_err());
        assert!("14000".parse::<PortRange>().is_err());
        assert!("a-b".parse::<PortRange>().is_err());
    }

    #[test]
    fn test_range_serde() {
        let range: PortRange = serde_yaml::from_str("\"20000-20010\"").unwrap();
        assert_eq!(range.min, 20000);
        assert!(serde_yaml::from_str::<PortRange>("\"9-1\"").is_err());
    }

    #[test]
    fn test_exhaustion_and_reuse() {
        let allocator = PortAllocator::new(
            PortRange::new(14000, 14003).unwrap(),
            AllocationStrategy::Bitmap,
            &[],
        );

        assert_eq!(
            allocator.allocate_reserved_ports(4).unwrap(),
            vec![14000, 14001, 14002, 14003]
        );
        assert_eq!(
            allocator.allocate_reserved_ports(1),
            Err(PortError::InsufficientPorts {
                requested: 1,
                available: 0
            })
        );

        allocator.release_reserved_ports(&[14001]);
        assert_eq!(allocator.allocate_reserved_ports(1).unwrap(), vec![14001]);
    }

    #[test]
    fn test_failed_allocation_takes_nothing() {
        let allocator = PortAllocator::new(
            PortRange::new(100, 104).unwrap(),
            AllocationStrategy::Bitmap,
            &[100, 102],
        );
        assert!(allocator.allocate_reserved_ports(4).is_err());
        assert_eq!(allocator.allocated(), 2);
        assert_eq!(allocator.allocate_reserved_ports(3).unwrap(), vec![101, 103, 104]);
    }

    #[test]
    fn test_release_is_idempotent() {
        let allocator = PortAllocator::new(
            PortRange::new(100, 109).unwrap(),
            AllocationStrategy::Bitmap,
            &[105, 9000],
        );
        assert_eq!(allocator.allocated(), 1);

        allocator.release_reserved_ports(&[105, 105, 101, 9000]);
        assert_eq!(allocator.allocated(), 0);
    }

    #[test]
    fn test_conservation() {
        let allocator = PortAllocator::new(
            PortRange::new(3000, 3031).unwrap(),
            AllocationStrategy::Bitmap,
            &[],
        );
        let mut held = Vec::new();
        for round in 0..8 {
            held.extend(allocator.allocate_reserved_ports(3).unwrap());
            if round % 2 == 1 {
                let released: Vec<u16> = held.drain(..2).collect();
                allocator.release_reserved_ports(&released);
            }
            assert_eq!(allocator.allocated(), held.len());
        }
    }

    #[test]
    fn test_parse_strategy() {
        assert_eq!(
            "Random".parse::<AllocationStrategy>(),
            Ok(AllocationStrategy::Random)
        );
        assert_eq!(
            "bitmap".parse::<AllocationStrategy>(),
            Ok(AllocationStrategy::Bitmap)
        );
        assert_eq!(
            "roundrobin".parse::<AllocationStrategy>(),
            Err(PortError::UnknownStrategy("roundrobin".into()))
        );
        let strategy: AllocationStrategy = serde_yaml::from_str("random").unwrap();
        assert_eq!(strategy, AllocationStrategy::Random);
    }

    #[test]
    fn test_random_respects_reservations_and_exhausts() {
        let reserved = [14000, 14002, 14005];
        let allocator = PortAllocator::new(
            PortRange::new(14000, 14007).unwrap(),
            AllocationStrategy::Random,
            &reserved,
        )
        .with_seed(7);

        let mut ports = allocator.allocate_reserved_ports(3).unwrap();
        ports.extend(allocator.allocate_reserved_ports(2).unwrap());
        ports.sort_unstable();
        assert_eq!(ports, vec![14001, 14003, 14004, 14006, 14007]);

        assert_eq!(
            allocator.allocate_reserved_ports(1),
            Err(PortError::InsufficientPorts {
                requested: 1,
                available: 0
            })
        );
        allocator.release_reserved_ports(&[14004]);
        assert_eq!(allocator.allocate_reserved_ports(1).unwrap(), vec![14004]);
        assert_eq!(allocator.allocated(), 8);
    }

    #[test]
    fn test_random_is_reproducible_for_a_seed() {
        let pick = |seed| {
            PortAllocator::new(
                PortRange::new(30000, 30999).unwrap(),
                AllocationStrategy::Random,
                &[30500],
            )
            .with_seed(seed)
            .allocate_reserved_ports(6)
            .unwrap()
        };
        let ports = pick(42);
        assert_eq!(ports, pick(42));
        assert!(!ports.contains(&30500));
        let mut distinct = ports.clone();
        distinct.sort_unstable();
        distinct.dedup();
        assert_eq!(distinct.len(), 6);
    }

    #[test]
    fn test_random_failed_allocation_takes_nothing() {
        let allocator = PortAllocator::new(
            PortRange::new(100, 104).unwrap(),
            AllocationStrategy::Random,
            &[100, 102],
        );
        assert_eq!(
            allocator.allocate_reserved_ports(4),
            Err(PortError::InsufficientPorts {
                requested: 4,
                available: 3
            })
        );
        assert_eq!(allocator.allocated(), 2);
    }

    #[tokio::test]
    async fn test_seeded_handle_hands_out_the_same_ports() {
        let range = PortRange::new(40000, 40999).unwrap();
        let provider = StaticReservedPorts::default();
        let mut picks = Vec::new();
        for _ in 0..2 {
            let handle = PortAllocatorHandle::new().with_seed(Some(9));
            let allocator = handle
                .setup(range, AllocationStrategy::Random, &provider)
                .await
                .unwrap();
            picks.push(allocator.allocate_reserved_ports(4).unwrap());
        }
        assert_eq!(picks[0], picks[1]);
    }

    #[tokio::test]
    async fn test_handle_lifecycle() {
        let handle = PortAllocatorHandle::new();
        assert_eq!(
            handle.get_runtime_port_allocator().unwrap_err(),
            PortError::NotInitialized
        );

        let range = PortRange::new(20000, 20010).unwrap();
        let provider = StaticReservedPorts::new(vec![20000]);
        let allocator = handle
            .setup(range, AllocationStrategy::Bitmap, &provider)
            .await
            .unwrap();
        assert!(allocator.is_allocated(20000));

        let again = handle
            .setup(range, AllocationStrategy::Bitmap, &provider)
            .await;
        assert_eq!(again.unwrap_err(), PortError::AlreadyInitialized);

        handle.teardown();
        assert!(handle.get_runtime_port_allocator().is_err());
        handle
            .setup(range, AllocationStrategy::Bitmap, &provider)
            .await
            .unwrap();
    }
}
