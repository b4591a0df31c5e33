//! Resource pool abstraction
//!
//! A resource pool is the totality of an actor's storage: a list of
//! sub-containers, each a fixed number of slots holding at most one stack.
//! The exchange engine only reads, writes and clears slots through this
//! trait, so hosts plug their own storage in and tests use [`MemoryPool`].

pub mod memory;

pub use memory::{MemoryContainer, MemoryDirectory, MemoryPool};

use crate::error::PoolError;
use crate::types::{ActorId, ItemKind, ResourceEntry};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Aggregated quantities per resource kind
pub type Bundle = BTreeMap<ItemKind, u64>;

/// Address of one slot inside a pool
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotRef {
    pub container: usize,
    pub index: usize,
}

impl SlotRef {
    pub fn new(container: usize, index: usize) -> Self {
        Self { container, index }
    }
}

impl fmt::Display for SlotRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.container, self.index)
    }
}

/// Minimal storage capability the exchange engine needs from a host
pub trait ResourcePool {
    /// Number of sub-containers
    fn container_count(&self) -> usize;

    /// Slot count of one sub-container (0 when it does not exist)
    fn capacity(&self, container: usize) -> usize;

    /// Stack held in a slot, `None` when empty or out of range
    fn read(&self, slot: SlotRef) -> Option<ResourceEntry>;

    fn write(&mut self, slot: SlotRef, entry: ResourceEntry) -> Result<(), PoolError>;

    fn clear(&mut self, slot: SlotRef) -> Result<(), PoolError>;

    /// Maximum stack size of a kind, when the host knows it
    fn max_stack_size(&self, _kind: &ItemKind) -> Option<u32> {
        None
    }

    /// Containers scanned for verification and withdrawal
    fn scan_order(&self) -> Vec<usize> {
        (0..self.container_count()).collect()
    }

    /// Containers in preferred deposit order
    fn deposit_order(&self) -> Vec<usize> {
        self.scan_order()
    }
}

/// Every slot address of the given containers, in order
pub fn slots_in<P: ResourcePool + ?Sized>(pool: &P, containers: &[usize]) -> Vec<SlotRef> {
    containers
        .iter()
        .flat_map(|&container| {
            (0..pool.capacity(container)).map(move |index| SlotRef::new(container, index))
        })
        .collect()
}

/// Quantities on hand per kind across the scan containers
pub fn holdings<P: ResourcePool + ?Sized>(pool: &P) -> Bundle {
    let mut totals = Bundle::new();
    for slot in slots_in(pool, &pool.scan_order()) {
        if let Some(entry) = pool.read(slot) {
            *totals.entry(entry.kind().clone()).or_default() += u64::from(entry.quantity());
        }
    }
    totals
}

/// Slot-level copy of every container a trade may touch
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolSnapshot {
    slots: Vec<(SlotRef, Option<ResourceEntry>)>,
}

impl PoolSnapshot {
    /// Capture the scan and deposit containers of a pool
    pub fn capture<P: ResourcePool + ?Sized>(pool: &P) -> Self {
        let containers: BTreeSet<usize> = pool
            .scan_order()
            .into_iter()
            .chain(pool.deposit_order())
            .collect();
        let containers: Vec<usize> = containers.into_iter().collect();

        let slots = slots_in(pool, &containers)
            .into_iter()
            .map(|slot| (slot, pool.read(slot)))
            .collect();

        Self { slots }
    }

    /// Write back every slot that differs from the captured state
    pub fn restore<P: ResourcePool + ?Sized>(&self, pool: &mut P) -> Result<(), PoolError> {
        for (slot, saved) in &self.slots {
            if pool.read(*slot) == *saved {
                continue;
            }
            match saved {
                Some(entry) => pool.write(*slot, entry.clone())?,
                None => pool.clear(*slot)?,
            }
        }
        Ok(())
    }

    /// True when the pool still matches the captured state exactly
    pub fn matches<P: ResourcePool + ?Sized>(&self, pool: &P) -> bool {
        self.slots
            .iter()
            .all(|(slot, saved)| pool.read(*slot) == *saved)
    }
}

/// Pool shared between the host and the registry; holding its lock grants
/// exclusive mutation for the duration of an exchange
pub type SharedPool = Arc<Mutex<dyn ResourcePool + Send>>;

/// Wrap a pool for sharing with the registry
pub fn shared<P: ResourcePool + Send + 'static>(pool: P) -> SharedPool {
    Arc::new(Mutex::new(pool))
}

/// Host lookup from actor to resource pool
pub trait PoolDirectory: Send + Sync {
    fn pool_for(&self, actor: &ActorId) -> Option<SharedPool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(kind: &str, qty: u32) -> ResourceEntry {
        ResourceEntry::new(kind, qty).unwrap()
    }

    #[test]
    fn test_holdings_aggregate_across_containers() {
        let mut pool = MemoryPool::new()
            .with_container("hotbar", 2)
            .with_container("backpack", 3);
        pool.put(SlotRef::new(0, 0), entry("wood", 4));
        pool.put(SlotRef::new(1, 2), entry("wood", 6));
        pool.put(SlotRef::new(1, 0), entry("stone", 1));

        let totals = holdings(&pool);
        assert_eq!(totals.get(&ItemKind::new("wood")), Some(&10));
        assert_eq!(totals.get(&ItemKind::new("stone")), Some(&1));
    }

    #[test]
    fn test_snapshot_restore() {
        let mut pool = MemoryPool::new().with_container("bag", 3);
        pool.put(SlotRef::new(0, 1), entry("wood", 5));
        let snapshot = PoolSnapshot::capture(&pool);

        pool.clear(SlotRef::new(0, 1)).unwrap();
        pool.write(SlotRef::new(0, 2), entry("stone", 9)).unwrap();
        assert!(!snapshot.matches(&pool));

        snapshot.restore(&mut pool).unwrap();
        assert!(snapshot.matches(&pool));
        assert_eq!(pool.read(SlotRef::new(0, 1)), Some(entry("wood", 5)));
        assert_eq!(pool.read(SlotRef::new(0, 2)), None);
    }

    #[test]
    fn test_slots_in_follows_container_order() {
        let pool = MemoryPool::new()
            .with_container("a", 1)
            .with_container("b", 2);
        let slots = slots_in(&pool, &[1, 0]);
        assert_eq!(
            slots,
            vec![SlotRef::new(1, 0), SlotRef::new(1, 1), SlotRef::new(0, 0)]
        );
    }
}
