//! In-memory resource pools

use crate::error::PoolError;
use crate::types::{ActorId, ItemKind, ResourceEntry};
use std::collections::HashMap;

use super::{PoolDirectory, ResourcePool, SharedPool, SlotRef};

/// Named container of fixed capacity
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryContainer {
    name: String,
    slots: Vec<Option<ResourceEntry>>,
}

impl MemoryContainer {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            slots: vec![None; capacity],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn slots(&self) -> &[Option<ResourceEntry>] {
        &self.slots
    }
}

/// Pool backed by plain vectors, used by tests and the simulator
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemoryPool {
    containers: Vec<MemoryContainer>,
    deposit_order: Option<Vec<usize>>,
    stack_limits: HashMap<ItemKind, u32>,
}

impl MemoryPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a container; its index is its position
    pub fn with_container(mut self, name: impl Into<String>, capacity: usize) -> Self {
        self.containers.push(MemoryContainer::new(name, capacity));
        self
    }

    pub fn with_deposit_order(mut self, order: Vec<usize>) -> Self {
        self.deposit_order = Some(order);
        self
    }

    pub fn with_stack_limit(mut self, kind: impl Into<String>, limit: u32) -> Self {
        self.stack_limits.insert(ItemKind::new(kind), limit);
        self
    }

    /// Place a stack directly; returns false for an unknown slot
    pub fn put(&mut self, slot: SlotRef, entry: ResourceEntry) -> bool {
        self.write(slot, entry).is_ok()
    }

    /// Fill empty slots with `quantity` of `kind`, `per_stack` at a time
    pub fn stock(&mut self, kind: &str, quantity: u32, per_stack: u32) -> bool {
        let mut remaining = quantity;
        for container in &mut self.containers {
            for slot in container.slots.iter_mut().filter(|slot| slot.is_none()) {
                if remaining == 0 {
                    return true;
                }
                let take = remaining.min(per_stack.max(1));
                *slot = ResourceEntry::new(kind, take);
                remaining -= take;
            }
        }
        remaining == 0
    }

    pub fn containers(&self) -> &[MemoryContainer] {
        &self.containers
    }

    /// Total quantity of one kind across all containers
    pub fn count(&self, kind: &str) -> u64 {
        self.containers
            .iter()
            .flat_map(|container| container.slots.iter().flatten())
            .filter(|entry| entry.kind().as_str() == kind)
            .map(|entry| u64::from(entry.quantity()))
            .sum()
    }

    pub fn empty_slots(&self) -> usize {
        self.containers
            .iter()
            .flat_map(|container| container.slots.iter())
            .filter(|slot| slot.is_none())
            .count()
    }

    fn slot_mut(&mut self, slot: SlotRef) -> Result<&mut Option<ResourceEntry>, PoolError> {
        self.containers
            .get_mut(slot.container)
            .and_then(|container| container.slots.get_mut(slot.index))
            .ok_or(PoolError::SlotOutOfRange(slot))
    }
}

impl ResourcePool for MemoryPool {
    fn container_count(&self) -> usize {
        self.containers.len()
    }

    fn capacity(&self, container: usize) -> usize {
        self.containers
            .get(container)
            .map_or(0, |container| container.slots.len())
    }

    fn read(&self, slot: SlotRef) -> Option<ResourceEntry> {
        self.containers
            .get(slot.container)
            .and_then(|container| container.slots.get(slot.index))
            .cloned()
            .flatten()
    }

    fn write(&mut self, slot: SlotRef, entry: ResourceEntry) -> Result<(), PoolError> {
        *self.slot_mut(slot)? = Some(entry);
        Ok(())
    }

    fn clear(&mut self, slot: SlotRef) -> Result<(), PoolError> {
        *self.slot_mut(slot)? = None;
        Ok(())
    }

    fn max_stack_size(&self, kind: &ItemKind) -> Option<u32> {
        self.stack_limits.get(kind).copied()
    }

    fn deposit_order(&self) -> Vec<usize> {
        self.deposit_order
            .clone()
            .unwrap_or_else(|| self.scan_order())
    }
}

/// Fixed actor-to-pool mapping
#[derive(Default)]
pub struct MemoryDirectory {
    pools: HashMap<ActorId, SharedPool>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pool for an actor and return the shared handle
    pub fn insert(&mut self, actor: ActorId, pool: MemoryPool) -> SharedPool {
        let shared = super::shared(pool);
        self.pools.insert(actor, shared.clone());
        shared
    }
}

impl PoolDirectory for MemoryDirectory {
    fn pool_for(&self, actor: &ActorId) -> Option<SharedPool> {
        self.pools.get(actor).cloned()
    }
}
