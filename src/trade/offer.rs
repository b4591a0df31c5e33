//! Offered resource bundles

use crate::pool::Bundle;
use crate::types::ResourceEntry;
use serde::Serialize;

/// Resources one side proposes to give up.
///
/// Entries keep insertion order. While locked every mutator is a no-op that
/// reports failure; this is how an accepted offer stays frozen.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Offer {
    entries: Vec<ResourceEntry>,
    locked: bool,
}

impl Offer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry
    pub fn add(&mut self, entry: ResourceEntry) -> bool {
        if self.locked {
            return false;
        }
        self.entries.push(entry);
        true
    }

    /// Remove the entry at `index`
    pub fn remove_at(&mut self, index: usize) -> Option<ResourceEntry> {
        if self.locked || index >= self.entries.len() {
            return None;
        }
        Some(self.entries.remove(index))
    }

    /// Reduce the entry at `index` by `amount`, removing it when nothing remains
    pub fn reduce_at(&mut self, index: usize, amount: u32) -> bool {
        if self.locked || amount == 0 {
            return false;
        }
        let Some(current) = self.entries.get(index) else {
            return false;
        };

        if amount >= current.quantity() {
            self.entries.remove(index);
            return true;
        }
        match current.with_quantity(current.quantity() - amount) {
            Some(reduced) => {
                self.entries[index] = reduced;
                true
            }
            None => false,
        }
    }

    /// Replace the quantity of the entry at `index`
    pub fn set_quantity_at(&mut self, index: usize, quantity: u32) -> bool {
        if self.locked {
            return false;
        }
        let Some(updated) = self
            .entries
            .get(index)
            .and_then(|current| current.with_quantity(quantity))
        else {
            return false;
        };
        self.entries[index] = updated;
        true
    }

    /// Remove every entry; does nothing while locked
    pub fn clear(&mut self) {
        if !self.locked {
            self.entries.clear();
        }
    }

    pub fn lock(&mut self) {
        self.locked = true;
    }

    pub fn unlock(&mut self) {
        self.locked = false;
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn get(&self, index: usize) -> Option<&ResourceEntry> {
        self.entries.get(index)
    }

    pub fn entries(&self) -> &[ResourceEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Declared quantity per kind, summing repeated kinds
    pub fn totals(&self) -> Bundle {
        let mut totals = Bundle::new();
        for entry in &self.entries {
            *totals.entry(entry.kind().clone()).or_default() += u64::from(entry.quantity());
        }
        totals
    }

    /// Deep copy, always unlocked
    pub fn copy(&self) -> Offer {
        Offer {
            entries: self.entries.clone(),
            locked: false,
        }
    }
}
