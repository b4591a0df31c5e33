//! Trade notifications addressed to actors

use crate::types::{ActorId, SessionId};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::info;

use super::types::{FailureCause, Notice, TradeState};

/// Why a pending request went away without becoming a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestCloseReason {
    Expired,
    Declined,
    Cancelled,
    Disconnected,
}

/// Why a session window should close
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Completed,
    CancelledByYou,
    CancelledByPartner,
    PartnerDisconnected,
    /// Exchange failed and the pools could not be restored
    Failed,
    Shutdown,
}

/// Events the registry emits; delivery and wording are up to the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TradeEvent {
    /// Your request to `to` is waiting for an answer
    RequestSent { to: ActorId },
    /// `from` wants to trade with you
    RequestReceived { from: ActorId },
    /// A request between you and `other` was closed
    RequestClosed {
        other: ActorId,
        reason: RequestCloseReason,
    },
    /// A session opened; `partner` is `None` in solo mode
    TradeStarted {
        session: SessionId,
        partner: Option<ActorId>,
    },
    /// Session state or offers changed, refresh views
    Updated { session: SessionId, state: TradeState },
    /// An acceptance was withdrawn
    AcceptRevoked { by_partner: bool },
    /// Countdown elapsed, execution may be requested
    CountdownReady { session: SessionId },
    /// Execution failed and the session is back to negotiating
    ExchangeFailed { cause: FailureCause, notice: Notice },
    /// Session ended; close any open window
    SessionClosed {
        session: SessionId,
        reason: CloseReason,
    },
}

/// Sink for trade events
pub trait Notifier: Send + Sync {
    fn notify(&self, to: &ActorId, event: TradeEvent);
}

/// Writes every event to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, to: &ActorId, event: TradeEvent) {
        info!(actor = %to, ?event, "Trade event");
    }
}

/// An event together with its recipient
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub to: ActorId,
    pub event: TradeEvent,
}

/// Queues events on an unbounded channel for the host to drain
#[derive(Clone)]
pub struct ChannelNotifier {
    event_tx: mpsc::UnboundedSender<Delivery>,
    event_rx: Arc<Mutex<mpsc::UnboundedReceiver<Delivery>>>,
}

impl ChannelNotifier {
    pub fn new() -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            event_tx,
            event_rx: Arc::new(Mutex::new(event_rx)),
        }
    }

    /// Next queued event, if any
    pub async fn poll_events(&self) -> Option<Delivery> {
        self.event_rx.lock().await.try_recv().ok()
    }

    /// Wait for the next event
    pub async fn next_event(&self) -> Option<Delivery> {
        self.event_rx.lock().await.recv().await
    }

    /// Drain every queued event
    pub async fn drain(&self) -> Vec<Delivery> {
        let mut rx = self.event_rx.lock().await;
        let mut events = Vec::new();
        while let Ok(delivery) = rx.try_recv() {
            events.push(delivery);
        }
        events
    }
}

impl Default for ChannelNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, to: &ActorId, event: TradeEvent) {
        let delivery = Delivery {
            to: to.clone(),
            event,
        };
        if self.event_tx.send(delivery).is_err() {
            tracing::warn!(actor = %to, "Trade event dropped, receiver closed");
        }
    }
}

/// Fan an event out to two notifiers, first then second
impl<A: Notifier, B: Notifier> Notifier for (A, B) {
    fn notify(&self, to: &ActorId, event: TradeEvent) {
        self.0.notify(to, event.clone());
        self.1.notify(to, event);
    }
}
