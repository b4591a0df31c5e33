//! Tradepost
//!
//! Atomic two-party exchange of stackable resources.
//!
//! Two actors negotiate offers inside a [`TradeSession`], both accept, a
//! countdown elapses, and the [`ExchangeEngine`] swaps the offers between
//! their resource pools with all-or-nothing semantics. The [`TradeRegistry`]
//! owns every session and pending request and drives the request timeout and
//! countdown timers.
//!
//! Hosts plug their storage in through [`ResourcePool`] and [`PoolDirectory`]
//! and receive [`TradeEvent`]s through a [`Notifier`].

pub mod cli;
pub mod config;
pub mod error;
pub mod pool;
pub mod trade;
pub mod types;

// Re-export commonly used types
pub use config::TradeConfig;
pub use error::{ExchangeError, PoolError, Result, TradeError};
pub use pool::{MemoryDirectory, MemoryPool, PoolDirectory, ResourcePool, SharedPool, SlotRef};
pub use trade::{
    ChannelNotifier, ExchangeEngine, FailureCause, LogNotifier, Notice, Notifier, Offer,
    RequestOutcome, Role, SessionView, TradeEvent, TradeRegistry, TradeResult, TradeSession,
    TradeState,
};
pub use types::{ActorId, ItemKind, ResourceEntry, SessionId};
