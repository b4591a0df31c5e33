//! Trade simulation over in-memory pools

use crate::config::TradeConfig;
use crate::error::{Result, TradeError};
use crate::pool::{holdings, Bundle, MemoryDirectory, MemoryPool, SharedPool};
use crate::trade::{
    ChannelNotifier, Delivery, LogNotifier, TradeEvent, TradeRegistry, TradeResult,
};
use crate::types::{ActorId, ResourceEntry};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Size of the hotbar container every simulated actor gets
const HOTBAR_SLOTS: usize = 9;

/// One scripted trade
#[derive(Debug, Clone)]
pub struct TradePlan {
    pub initiator: ActorId,
    pub counterpart: ActorId,
    pub give: Vec<ResourceEntry>,
    pub take: Vec<ResourceEntry>,
    pub storage_slots: usize,
    pub solo: bool,
}

/// What a simulation did
#[derive(Debug, Clone)]
pub struct SimulationReport {
    pub result: TradeResult,
    pub before: HashMap<ActorId, Bundle>,
    pub after: HashMap<ActorId, Bundle>,
    pub events: Vec<Delivery>,
}

/// Drives a registry through request, negotiation, countdown and execution
pub struct SimulationApp {
    registry: TradeRegistry,
    notifier: ChannelNotifier,
    pools: HashMap<ActorId, SharedPool>,
}

impl SimulationApp {
    /// Build the registry and stock each actor with what it will offer
    pub fn new(config: TradeConfig, plan: &TradePlan) -> Result<Self> {
        let config = config.normalized();
        let mut directory = MemoryDirectory::new();
        let mut pools = HashMap::new();

        let mut actors = vec![(plan.initiator.clone(), plan.give.clone())];
        if !plan.solo {
            actors.push((plan.counterpart.clone(), plan.take.clone()));
        }

        for (actor, stock) in actors {
            let mut pool = MemoryPool::new()
                .with_container("hotbar", HOTBAR_SLOTS)
                .with_container("storage", plan.storage_slots)
                .with_deposit_order(vec![1, 0]);
            for entry in &stock {
                if !pool.stock(entry.kind().as_str(), entry.quantity(), config.default_max_stack) {
                    return Err(TradeError::InvalidEntry(format!(
                        "{} does not fit into the pool of {}",
                        entry, actor
                    )));
                }
            }
            let shared = directory.insert(actor.clone(), pool);
            pools.insert(actor, shared);
        }

        let notifier = ChannelNotifier::new();
        let registry = TradeRegistry::new(
            config,
            Arc::new(directory),
            Arc::new((LogNotifier, notifier.clone())),
        );

        Ok(Self {
            registry,
            notifier,
            pools,
        })
    }

    pub fn registry(&self) -> &TradeRegistry {
        &self.registry
    }

    /// Current holdings of every simulated actor
    pub async fn holdings(&self) -> HashMap<ActorId, Bundle> {
        let mut totals = HashMap::new();
        for (actor, pool) in &self.pools {
            let pool = pool.lock().await;
            totals.insert(actor.clone(), holdings(&*pool));
        }
        totals
    }

    /// Run the plan to completion
    pub async fn run(&self, plan: &TradePlan) -> Result<SimulationReport> {
        let before = self.holdings().await;
        let mut events = Vec::new();

        if plan.solo {
            self.registry.start_solo(&plan.initiator).await?;
            self.offer(&plan.initiator, &plan.give).await?;
            self.registry.accept_offer(&plan.initiator).await;
        } else {
            self.registry
                .request(&plan.initiator, &plan.counterpart)
                .await?;
            self.registry.accept_request(&plan.counterpart).await?;
            self.offer(&plan.initiator, &plan.give).await?;
            self.offer(&plan.counterpart, &plan.take).await?;
            self.registry.accept_offer(&plan.initiator).await;
            self.registry.accept_offer(&plan.counterpart).await;
        }

        self.wait_for_countdown(&mut events).await;
        let result = self.registry.execute(&plan.initiator).await?;

        events.extend(self.notifier.drain().await);

        Ok(SimulationReport {
            result,
            before,
            after: self.holdings().await,
            events,
        })
    }

    async fn offer(&self, actor: &ActorId, entries: &[ResourceEntry]) -> Result<()> {
        let added = self
            .registry
            .update_offer(actor, |offer| {
                entries.iter().all(|entry| offer.add(entry.clone()))
            })
            .await?;
        if !added {
            return Err(TradeError::EditRejected(actor.to_string()));
        }
        Ok(())
    }

    /// Collect events until the countdown reports ready
    async fn wait_for_countdown(&self, events: &mut Vec<Delivery>) {
        let limit = self.registry.config().countdown() + Duration::from_secs(1);
        let waited = tokio::time::timeout(limit, async {
            while let Some(delivery) = self.notifier.next_event().await {
                let ready = matches!(delivery.event, TradeEvent::CountdownReady { .. });
                events.push(delivery);
                if ready {
                    break;
                }
            }
        })
        .await;

        if waited.is_err() {
            tracing::warn!("Countdown did not report ready in time");
        }
    }
}
