//! Trade sessions, the exchange engine and the session registry

pub mod exchange;
pub mod notify;
pub mod offer;
pub mod registry;
pub mod session;
pub mod timer;
pub mod types;

pub use exchange::{ExchangeEngine, Pools};
pub use notify::{
    ChannelNotifier, CloseReason, Delivery, LogNotifier, Notifier, RequestCloseReason, TradeEvent,
};
pub use offer::Offer;
pub use registry::{RequestOutcome, SharedSession, TradeRegistry};
pub use session::{SessionView, TradeSession};
pub use timer::TimerHandle;
pub use types::{FailureCause, Notice, Role, TradeResult, TradeState};
