//! Per-pair trade session state machine

use crate::error::ExchangeError;
use crate::types::{ActorId, SessionId};
use serde::Serialize;
use std::time::{Duration, SystemTime};
use tokio::time::Instant;
use tracing::{debug, error, info};

use super::exchange::{ExchangeEngine, Pools};
use super::offer::Offer;
use super::timer::TimerHandle;
use super::types::{Notice, Role, TradeResult, TradeState};

/// A trade between two actors, or one actor in solo mode.
///
/// Every method assumes exclusive access; the registry wraps each session in
/// its own mutex and holds it for the whole call.
#[derive(Debug)]
pub struct TradeSession {
    id: SessionId,
    initiator: ActorId,
    counterpart: ActorId,
    initiator_offer: Offer,
    counterpart_offer: Offer,
    state: TradeState,
    initiator_accepted: bool,
    counterpart_accepted: bool,
    created_at: SystemTime,
    countdown_started: Option<Instant>,
    countdown: Duration,
    solo: bool,
    countdown_timer: Option<TimerHandle>,
}

impl TradeSession {
    /// Create a pending session between two actors
    pub fn new(initiator: ActorId, counterpart: ActorId, countdown: Duration) -> Self {
        let solo = initiator == counterpart;
        Self {
            id: SessionId::generate(),
            initiator,
            counterpart,
            initiator_offer: Offer::new(),
            counterpart_offer: Offer::new(),
            state: TradeState::PendingRequest,
            initiator_accepted: false,
            counterpart_accepted: false,
            created_at: SystemTime::now(),
            countdown_started: None,
            countdown,
            solo,
            countdown_timer: None,
        }
    }

    /// Create a pending session where one actor fills both roles
    pub fn new_solo(actor: ActorId, countdown: Duration) -> Self {
        Self::new(actor.clone(), actor, countdown)
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn initiator(&self) -> &ActorId {
        &self.initiator
    }

    pub fn counterpart(&self) -> &ActorId {
        &self.counterpart
    }

    pub fn state(&self) -> TradeState {
        self.state
    }

    pub fn is_solo(&self) -> bool {
        self.solo
    }

    /// Actor playing a role
    pub fn actor(&self, role: Role) -> &ActorId {
        match role {
            Role::Initiator => &self.initiator,
            Role::Counterpart => &self.counterpart,
        }
    }

    /// Role of an actor; the initiator role in solo mode
    pub fn role_of(&self, actor: &ActorId) -> Option<Role> {
        if actor == &self.initiator {
            Some(Role::Initiator)
        } else if actor == &self.counterpart {
            Some(Role::Counterpart)
        } else {
            None
        }
    }

    /// The partner of an actor; `None` in solo mode or for outsiders
    pub fn other_party(&self, actor: &ActorId) -> Option<&ActorId> {
        if self.solo {
            return None;
        }
        self.role_of(actor).map(|role| self.actor(role.other()))
    }

    /// Distinct actors of the session (one in solo mode)
    pub fn participants(&self) -> Vec<ActorId> {
        if self.solo {
            vec![self.initiator.clone()]
        } else {
            vec![self.initiator.clone(), self.counterpart.clone()]
        }
    }

    pub fn offer(&self, role: Role) -> &Offer {
        match role {
            Role::Initiator => &self.initiator_offer,
            Role::Counterpart => &self.counterpart_offer,
        }
    }

    /// Mutable access to an actor's own offer; edits must be followed by
    /// [`TradeSession::on_offer_changed`]
    pub fn offer_mut_for(&mut self, actor: &ActorId) -> Option<&mut Offer> {
        match self.role_of(actor)? {
            Role::Initiator => Some(&mut self.initiator_offer),
            Role::Counterpart => Some(&mut self.counterpart_offer),
        }
    }

    pub fn has_accepted(&self, role: Role) -> bool {
        match role {
            Role::Initiator => self.initiator_accepted,
            Role::Counterpart => self.counterpart_accepted,
        }
    }

    /// PendingRequest -> Negotiating
    pub fn accept_request(&mut self) -> bool {
        if self.state != TradeState::PendingRequest {
            return false;
        }
        self.state = TradeState::Negotiating;
        debug!(session = %self.id, "Trade session moved to negotiating");
        true
    }

    /// Record an actor's acceptance and freeze their offer
    pub fn accept(&mut self, actor: &ActorId) -> bool {
        if !matches!(
            self.state,
            TradeState::Negotiating | TradeState::OneAccepted
        ) {
            return false;
        }
        let Some(role) = self.role_of(actor) else {
            return false;
        };

        if self.solo {
            self.set_acceptance(Role::Initiator, true);
            self.set_acceptance(Role::Counterpart, true);
        } else {
            self.set_acceptance(role, true);
        }

        if self.initiator_accepted && self.counterpart_accepted {
            self.state = TradeState::BothAcceptedCountdown;
            self.countdown_started = Some(Instant::now());
            debug!(session = %self.id, "Both sides accepted, countdown started");
        } else {
            self.state = TradeState::OneAccepted;
            debug!(session = %self.id, %role, "One side accepted");
        }
        true
    }

    /// Withdraw an actor's acceptance and return to negotiating.
    ///
    /// In solo mode both acceptances are withdrawn, mirroring `accept`.
    pub fn revoke_accept(&mut self, actor: &ActorId) -> bool {
        if !self.state.has_acceptance() {
            return false;
        }
        let Some(role) = self.role_of(actor) else {
            return false;
        };

        if self.solo {
            self.set_acceptance(Role::Initiator, false);
            self.set_acceptance(Role::Counterpart, false);
        } else {
            self.set_acceptance(role, false);
        }
        self.state = TradeState::Negotiating;
        self.clear_countdown();
        debug!(session = %self.id, %role, "Acceptance revoked");
        true
    }

    /// Any offer edit after an acceptance invalidates every acceptance,
    /// including one left standing by the partner's revoke.
    ///
    /// Returns true when acceptances were reset.
    pub fn on_offer_changed(&mut self) -> bool {
        let open = matches!(
            self.state,
            TradeState::Negotiating | TradeState::OneAccepted | TradeState::BothAcceptedCountdown
        );
        if !open || !(self.initiator_accepted || self.counterpart_accepted) {
            return false;
        }
        self.revoke_all_acceptances();
        true
    }

    /// Clear both acceptances, unlock both offers, back to negotiating
    pub fn revoke_all_acceptances(&mut self) {
        self.set_acceptance(Role::Initiator, false);
        self.set_acceptance(Role::Counterpart, false);
        self.state = TradeState::Negotiating;
        self.clear_countdown();
        debug!(session = %self.id, "All acceptances revoked");
    }

    pub fn is_countdown_complete(&self) -> bool {
        self.state == TradeState::BothAcceptedCountdown && self.remaining_countdown().is_zero()
    }

    /// Time left before execution is allowed; zero outside the countdown
    pub fn remaining_countdown(&self) -> Duration {
        match (self.state, self.countdown_started) {
            (TradeState::BothAcceptedCountdown, Some(started)) => {
                self.countdown.saturating_sub(started.elapsed())
            }
            _ => Duration::ZERO,
        }
    }

    /// Attach the countdown timer, replacing any previous one
    pub fn set_countdown_timer(&mut self, timer: TimerHandle) {
        if let Some(previous) = self.countdown_timer.replace(timer) {
            previous.cancel();
        }
    }

    pub fn has_countdown_timer(&self) -> bool {
        self.countdown_timer.is_some()
    }

    /// Run the exchange once the countdown has elapsed.
    ///
    /// Failures attributable to one side revert to negotiating with both
    /// acceptances cleared. A failed rollback leaves the session `Failed`.
    pub fn execute(&mut self, engine: &ExchangeEngine, mut pools: Pools<'_>) -> TradeResult {
        if !self.is_countdown_complete() {
            return TradeResult::not_ready();
        }

        self.state = TradeState::Executing;
        self.countdown_started = None;
        self.cancel_timer();
        debug!(session = %self.id, "Executing exchange");

        match engine.exchange(&self.initiator_offer, &self.counterpart_offer, &mut pools) {
            Ok(()) => {
                self.state = TradeState::Completed;
                info!(
                    session = %self.id,
                    initiator = %self.initiator,
                    counterpart = %self.counterpart,
                    "Trade completed"
                );
                TradeResult::completed()
            }
            Err(err @ ExchangeError::RollbackFailed { .. }) => {
                self.state = TradeState::Failed;
                error!(session = %self.id, %err, "Trade failed and pools could not be restored");
                TradeResult::system(Notice::SystemError(err.to_string()))
            }
            Err(err) => {
                self.revoke_all_acceptances();
                self.failure_result(&err)
            }
        }
    }

    /// Abort an execution attempt because a pool could not be resolved
    pub fn abort_unavailable(&mut self) -> TradeResult {
        if !self.is_countdown_complete() {
            return TradeResult::not_ready();
        }
        self.revoke_all_acceptances();
        TradeResult::system(Notice::PartnerUnavailable)
    }

    /// Move to `Cancelled` from any non-terminal state.
    ///
    /// Returns true if this call cancelled the session.
    pub fn cancel(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = TradeState::Cancelled;
        self.countdown_started = None;
        self.cancel_timer();
        debug!(session = %self.id, "Trade session cancelled");
        true
    }

    /// Copy of the session for presentation
    pub fn view(&self) -> SessionView {
        SessionView {
            id: self.id.clone(),
            initiator: self.initiator.clone(),
            counterpart: self.counterpart.clone(),
            state: self.state,
            initiator_offer: self.initiator_offer.clone(),
            counterpart_offer: self.counterpart_offer.clone(),
            initiator_accepted: self.initiator_accepted,
            counterpart_accepted: self.counterpart_accepted,
            solo: self.solo,
            created_at: self.created_at,
            remaining_countdown_ms: self.remaining_countdown().as_millis() as u64,
        }
    }

    fn set_acceptance(&mut self, role: Role, accepted: bool) {
        let (flag, offer) = match role {
            Role::Initiator => (&mut self.initiator_accepted, &mut self.initiator_offer),
            Role::Counterpart => (&mut self.counterpart_accepted, &mut self.counterpart_offer),
        };
        *flag = accepted;
        if accepted {
            offer.lock();
        } else {
            offer.unlock();
        }
    }

    fn clear_countdown(&mut self) {
        self.countdown_started = None;
        self.cancel_timer();
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.countdown_timer.take() {
            timer.cancel();
        }
    }

    fn failure_result(&self, err: &ExchangeError) -> TradeResult {
        let Some(side) = err.side() else {
            return TradeResult::system(Notice::SystemError(err.to_string()));
        };
        let actor = self.actor(side).clone();

        let (responsible, other) = match err {
            ExchangeError::MissingResources { .. } => {
                (Notice::ItemsNotFound, Notice::PartnerItemsNotFound(actor))
            }
            ExchangeError::NoSpace { .. } => (Notice::NoSpace, Notice::PartnerNoSpace(actor)),
            ExchangeError::WithdrawFailed { .. } => {
                (Notice::WithdrawFailed, Notice::PartnerWithdrawFailed(actor))
            }
            ExchangeError::DepositFailed { .. } => {
                (Notice::DepositFailed, Notice::PartnerDepositFailed(actor))
            }
            ExchangeError::Pool(_) | ExchangeError::RollbackFailed { .. } => {
                return TradeResult::system(Notice::SystemError(err.to_string()));
            }
        };
        TradeResult::side_failure(side, responsible, other)
    }
}

/// Snapshot of a session handed to presentation code
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SessionView {
    pub id: SessionId,
    pub initiator: ActorId,
    pub counterpart: ActorId,
    pub state: TradeState,
    pub initiator_offer: Offer,
    pub counterpart_offer: Offer,
    pub initiator_accepted: bool,
    pub counterpart_accepted: bool,
    pub solo: bool,
    pub created_at: SystemTime,
    pub remaining_countdown_ms: u64,
}
