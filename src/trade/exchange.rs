//! Atomic two-sided resource exchange
//!
//! Runs verify, space check, withdraw and deposit against the two resource
//! pools of a session. Every slot the exchange may touch is captured before
//! the first mutation and written back on any failure, so a failed exchange
//! leaves both pools exactly as they were.

use crate::config::TradeConfig;
use crate::error::{ExchangeError, PoolError};
use crate::pool::{holdings, slots_in, Bundle, PoolSnapshot, ResourcePool, SlotRef};
use crate::types::{ItemKind, ResourceEntry};
use tracing::{debug, error, warn};

use super::offer::Offer;
use super::types::Role;

/// Pools an exchange runs against, already locked by the caller
pub enum Pools<'a> {
    Pair {
        initiator: &'a mut dyn ResourcePool,
        counterpart: &'a mut dyn ResourcePool,
    },
    /// Solo sessions trade against a single pool
    Solo(&'a mut dyn ResourcePool),
}

impl<'a> Pools<'a> {
    pub fn pair(initiator: &'a mut dyn ResourcePool, counterpart: &'a mut dyn ResourcePool) -> Self {
        Pools::Pair {
            initiator,
            counterpart,
        }
    }

    pub fn solo(pool: &'a mut dyn ResourcePool) -> Self {
        Pools::Solo(pool)
    }

    pub fn is_solo(&self) -> bool {
        matches!(self, Pools::Solo(_))
    }

    /// Pool of one side
    pub fn get(&mut self, role: Role) -> &mut (dyn ResourcePool + 'a) {
        match (self, role) {
            (Pools::Pair { initiator, .. }, Role::Initiator) => &mut **initiator,
            (Pools::Pair { counterpart, .. }, Role::Counterpart) => &mut **counterpart,
            (Pools::Solo(pool), _) => &mut **pool,
        }
    }

    fn view(&self, role: Role) -> &(dyn ResourcePool + 'a) {
        match (self, role) {
            (Pools::Pair { initiator, .. }, Role::Initiator) => &**initiator,
            (Pools::Pair { counterpart, .. }, Role::Counterpart) => &**counterpart,
            (Pools::Solo(pool), _) => &**pool,
        }
    }

    fn capture(&self) -> Vec<(Role, PoolSnapshot)> {
        let roles: &[Role] = if self.is_solo() {
            &[Role::Initiator]
        } else {
            &[Role::Initiator, Role::Counterpart]
        };
        roles
            .iter()
            .map(|&role| (role, PoolSnapshot::capture(self.view(role))))
            .collect()
    }

    fn restore(&mut self, snapshots: &[(Role, PoolSnapshot)]) -> Result<(), PoolError> {
        for (role, snapshot) in snapshots {
            snapshot.restore(self.get(*role))?;
        }
        Ok(())
    }
}

/// Executes the verify, reserve, withdraw and deposit phases of a trade
#[derive(Clone, Copy, Debug)]
pub struct ExchangeEngine {
    default_max_stack: u32,
}

impl ExchangeEngine {
    /// Create an engine; `default_max_stack` sizes kinds the pool cannot size
    pub fn new(default_max_stack: u32) -> Self {
        Self {
            default_max_stack: default_max_stack.max(1),
        }
    }

    pub fn from_config(config: &TradeConfig) -> Self {
        Self::new(config.default_max_stack)
    }

    /// Swap the two offers between the pools.
    ///
    /// On any error both pools hold exactly what they held before the call,
    /// except for `RollbackFailed`, where restoring them failed.
    pub fn exchange(
        &self,
        initiator_offer: &Offer,
        counterpart_offer: &Offer,
        pools: &mut Pools<'_>,
    ) -> Result<(), ExchangeError> {
        let from_initiator = initiator_offer.totals();
        let from_counterpart = counterpart_offer.totals();

        // Verification phase
        for (side, outgoing) in [
            (Role::Initiator, &from_initiator),
            (Role::Counterpart, &from_counterpart),
        ] {
            if !covers(&holdings(pools.view(side)), outgoing) {
                warn!(%side, "Offered resources no longer held");
                return Err(ExchangeError::MissingResources { side });
            }
        }

        // Space phase: each side must fit what the other gives up
        for (side, incoming) in [
            (Role::Initiator, &from_counterpart),
            (Role::Counterpart, &from_initiator),
        ] {
            if !self.has_space(pools.view(side), incoming) {
                warn!(%side, "Not enough space for incoming resources");
                return Err(ExchangeError::NoSpace { side });
            }
        }

        let snapshots = pools.capture();

        match self.transfer(pools, &from_initiator, &from_counterpart) {
            Ok(()) => {
                debug!("Exchange transferred all resources");
                Ok(())
            }
            Err(cause) => {
                warn!(%cause, "Exchange interrupted, restoring pools");
                if let Err(fault) = pools.restore(&snapshots) {
                    error!(%cause, %fault, "Failed to restore pools after exchange failure");
                    return Err(ExchangeError::RollbackFailed {
                        cause: cause.to_string(),
                        fault,
                    });
                }
                Err(cause)
            }
        }
    }

    fn transfer(
        &self,
        pools: &mut Pools<'_>,
        from_initiator: &Bundle,
        from_counterpart: &Bundle,
    ) -> Result<(), ExchangeError> {
        for (side, outgoing) in [
            (Role::Initiator, from_initiator),
            (Role::Counterpart, from_counterpart),
        ] {
            if !self.withdraw(pools.get(side), outgoing)? {
                return Err(ExchangeError::WithdrawFailed { side });
            }
        }

        for (side, incoming) in [
            (Role::Initiator, from_counterpart),
            (Role::Counterpart, from_initiator),
        ] {
            if !self.deposit(pools.get(side), incoming)? {
                return Err(ExchangeError::DepositFailed { side });
            }
        }

        Ok(())
    }

    /// Stack limit of a kind in a pool
    fn stack_limit<P: ResourcePool + ?Sized>(&self, pool: &P, kind: &ItemKind) -> u64 {
        let max = pool
            .max_stack_size(kind)
            .filter(|&max| max > 0)
            .unwrap_or(self.default_max_stack);
        u64::from(max)
    }

    /// Check that `incoming` fits into the pool's deposit containers, filling
    /// headroom in existing stacks before claiming empty slots
    fn has_space<P: ResourcePool + ?Sized>(&self, pool: &P, incoming: &Bundle) -> bool {
        let mut headroom = Bundle::new();
        let mut empty_slots = 0u64;

        for slot in slots_in(pool, &pool.deposit_order()) {
            match pool.read(slot) {
                None => empty_slots += 1,
                Some(entry) => {
                    let room = self
                        .stack_limit(pool, entry.kind())
                        .saturating_sub(u64::from(entry.quantity()));
                    *headroom.entry(entry.kind().clone()).or_default() += room;
                }
            }
        }

        let mut needed = 0u64;
        for (kind, &amount) in incoming {
            let room = headroom.get(kind).copied().unwrap_or(0);
            let rest = amount.saturating_sub(room);
            needed += rest.div_ceil(self.stack_limit(pool, kind));
        }

        needed <= empty_slots
    }

    /// Remove exactly `bundle` from the scan containers.
    ///
    /// Returns `Ok(false)` when a kind falls short; whatever was already taken
    /// is put back first.
    fn withdraw<P: ResourcePool + ?Sized>(
        &self,
        pool: &mut P,
        bundle: &Bundle,
    ) -> Result<bool, PoolError> {
        let slots = slots_in(&*pool, &pool.scan_order());
        let mut taken = Bundle::new();

        for (kind, &wanted) in bundle {
            let mut remaining = wanted;

            for &slot in &slots {
                if remaining == 0 {
                    break;
                }
                let Some(current) = pool.read(slot) else {
                    continue;
                };
                if !current.is_kind(kind) {
                    continue;
                }

                let held = u64::from(current.quantity());
                if held <= remaining {
                    pool.clear(slot)?;
                    remaining -= held;
                } else {
                    pool.write(slot, stack_of(kind, held - remaining, slot)?)?;
                    remaining = 0;
                }
            }

            if wanted > remaining {
                *taken.entry(kind.clone()).or_default() += wanted - remaining;
            }
            if remaining > 0 {
                warn!(%kind, wanted, missing = remaining, "Withdrawal fell short");
                if !self.deposit(pool, &taken)? {
                    error!(%kind, "Partial withdrawal could not be put back");
                }
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// Place `bundle` into the deposit containers: top up same-kind stacks
    /// first, then split the rest across empty slots.
    ///
    /// Returns `Ok(false)` when some quantity did not fit.
    fn deposit<P: ResourcePool + ?Sized>(
        &self,
        pool: &mut P,
        bundle: &Bundle,
    ) -> Result<bool, PoolError> {
        let slots = slots_in(&*pool, &pool.deposit_order());

        for (kind, &amount) in bundle {
            let max = self.stack_limit(&*pool, kind);
            let mut remaining = amount;

            for &slot in &slots {
                if remaining == 0 {
                    break;
                }
                let Some(current) = pool.read(slot) else {
                    continue;
                };
                if !current.is_kind(kind) {
                    continue;
                }
                let held = u64::from(current.quantity());
                let add = max.saturating_sub(held).min(remaining);
                if add > 0 {
                    pool.write(slot, stack_of(kind, held + add, slot)?)?;
                    remaining -= add;
                }
            }

            for &slot in &slots {
                if remaining == 0 {
                    break;
                }
                if pool.read(slot).is_some() {
                    continue;
                }
                let place = remaining.min(max);
                pool.write(slot, stack_of(kind, place, slot)?)?;
                remaining -= place;
            }

            if remaining > 0 {
                warn!(%kind, amount, left = remaining, "Deposit did not fit");
                return Ok(false);
            }
        }

        Ok(true)
    }
}

impl Default for ExchangeEngine {
    fn default() -> Self {
        Self::from_config(&TradeConfig::default())
    }
}

/// True when `held` has at least `wanted` of every kind
fn covers(held: &Bundle, wanted: &Bundle) -> bool {
    wanted
        .iter()
        .all(|(kind, &qty)| held.get(kind).copied().unwrap_or(0) >= qty)
}

fn stack_of(kind: &ItemKind, quantity: u64, slot: SlotRef) -> Result<ResourceEntry, PoolError> {
    u32::try_from(quantity)
        .ok()
        .and_then(|quantity| ResourceEntry::of(kind.clone(), quantity))
        .ok_or(PoolError::WriteRejected(slot))
}
