//! Process-wide registry of trade sessions and pending requests
//!
//! Lock order: the registry state lock may be held while taking a session
//! lock, never the other way round. Execution takes the session lock and
//! then the pool locks, ordered by actor id.

use crate::config::TradeConfig;
use crate::error::{Result, TradeError};
use crate::pool::{PoolDirectory, SharedPool};
use crate::types::{ActorId, SessionId};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::exchange::{ExchangeEngine, Pools};
use super::notify::{CloseReason, Notifier, RequestCloseReason, TradeEvent};
use super::offer::Offer;
use super::session::{SessionView, TradeSession};
use super::timer::TimerHandle;
use super::types::{TradeResult, TradeState};

/// Session guarded for exclusive mutation
pub type SharedSession = Arc<Mutex<TradeSession>>;

/// Result of a trade request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Request is waiting for the target
    Sent(SessionId),
    /// The target had already asked us; the session started immediately
    Started(SessionId),
}

impl RequestOutcome {
    pub fn session_id(&self) -> &SessionId {
        match self {
            RequestOutcome::Sent(id) | RequestOutcome::Started(id) => id,
        }
    }
}

struct PendingRequest {
    initiator: ActorId,
    session: SharedSession,
    timeout: TimerHandle,
}

#[derive(Default)]
struct RegistryState {
    active: HashMap<SessionId, SharedSession>,
    by_actor: HashMap<ActorId, SessionId>,
    /// Keyed by target actor
    pending: HashMap<ActorId, PendingRequest>,
    closed: bool,
}

impl RegistryState {
    fn session_of(&self, actor: &ActorId) -> Option<SharedSession> {
        self.by_actor
            .get(actor)
            .and_then(|id| self.active.get(id))
            .cloned()
    }

    fn retire(&mut self, id: &SessionId) -> Option<SharedSession> {
        self.by_actor.retain(|_, session| *session != *id);
        self.active.remove(id)
    }

    /// Remove every pending request the actor sent or received
    fn take_pending_involving(&mut self, actor: &ActorId) -> Vec<(ActorId, PendingRequest)> {
        let targets: Vec<ActorId> = self
            .pending
            .iter()
            .filter(|(target, request)| *target == actor || &request.initiator == actor)
            .map(|(target, _)| target.clone())
            .collect();

        targets
            .into_iter()
            .filter_map(|target| {
                let request = self.pending.remove(&target)?;
                Some((target, request))
            })
            .collect()
    }
}

struct Inner {
    config: TradeConfig,
    engine: ExchangeEngine,
    pools: Arc<dyn PoolDirectory>,
    notifier: Arc<dyn Notifier>,
    state: Mutex<RegistryState>,
    timers: CancellationToken,
}

/// Tracks active sessions and pending requests, and drives the request
/// timeout and countdown timers.
///
/// Cheap to clone; every clone shares the same state.
#[derive(Clone)]
pub struct TradeRegistry {
    inner: Arc<Inner>,
}

impl TradeRegistry {
    pub fn new(
        config: TradeConfig,
        pools: Arc<dyn PoolDirectory>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let config = config.normalized();
        Self {
            inner: Arc::new(Inner {
                engine: ExchangeEngine::from_config(&config),
                config,
                pools,
                notifier,
                state: Mutex::new(RegistryState::default()),
                timers: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &TradeConfig {
        &self.inner.config
    }

    /// Ask `target` to trade.
    ///
    /// If `target` already asked `initiator`, that request is accepted on the
    /// spot and the session starts.
    pub async fn request(&self, initiator: &ActorId, target: &ActorId) -> Result<RequestOutcome> {
        if initiator == target {
            return Err(TradeError::SelfTrade(initiator.to_string()));
        }

        let mut state = self.inner.state.lock().await;
        if state.closed {
            return Err(TradeError::RegistryClosed);
        }
        if state.by_actor.contains_key(initiator) {
            return Err(TradeError::AlreadyInTrade(initiator.to_string()));
        }
        if state.by_actor.contains_key(target) {
            return Err(TradeError::TargetInTrade(target.to_string()));
        }

        let mirrored = state
            .pending
            .get(initiator)
            .is_some_and(|request| &request.initiator == target);
        if mirrored {
            let Some(request) = state.pending.remove(initiator) else {
                return Err(TradeError::NoPendingRequest(initiator.to_string()));
            };
            let id = Self::activate(&mut state, initiator, request).await;
            drop(state);

            info!(session = %id, %initiator, %target, "Mirrored requests started a trade");
            self.notify_started(&id, target, initiator);
            return Ok(RequestOutcome::Started(id));
        }

        if let Some(existing) = state.pending.get(target) {
            if &existing.initiator == initiator {
                return Err(TradeError::AlreadyPending(target.to_string()));
            }
            return Err(TradeError::TargetBusy(target.to_string()));
        }

        let session = TradeSession::new(
            initiator.clone(),
            target.clone(),
            self.inner.config.countdown(),
        );
        let id = session.id().clone();
        let session = Arc::new(Mutex::new(session));
        let timeout = self.schedule_request_timeout(target.clone(), session.clone());

        state.pending.insert(
            target.clone(),
            PendingRequest {
                initiator: initiator.clone(),
                session,
                timeout,
            },
        );
        drop(state);

        debug!(session = %id, %initiator, %target, "Trade request sent");
        self.notify(initiator, TradeEvent::RequestSent { to: target.clone() });
        self.notify(
            target,
            TradeEvent::RequestReceived {
                from: initiator.clone(),
            },
        );
        Ok(RequestOutcome::Sent(id))
    }

    /// Accept the request pending for `target` and start negotiating
    pub async fn accept_request(&self, target: &ActorId) -> Result<SessionId> {
        let mut state = self.inner.state.lock().await;
        if state.closed {
            return Err(TradeError::RegistryClosed);
        }
        let Some(request) = state.pending.remove(target) else {
            return Err(TradeError::NoPendingRequest(target.to_string()));
        };
        request.timeout.cancel();

        let conflict = if state.by_actor.contains_key(target) {
            Some(TradeError::AlreadyInTrade(target.to_string()))
        } else if state.by_actor.contains_key(&request.initiator) {
            Some(TradeError::TargetInTrade(request.initiator.to_string()))
        } else {
            None
        };

        if let Some(err) = conflict {
            request.session.lock().await.cancel();
            drop(state);

            warn!(%target, initiator = %request.initiator, "Request dropped, a party is already trading");
            self.notify(
                &request.initiator,
                TradeEvent::RequestClosed {
                    other: target.clone(),
                    reason: RequestCloseReason::Cancelled,
                },
            );
            return Err(err);
        }

        let initiator = request.initiator.clone();
        let id = Self::activate(&mut state, target, request).await;
        drop(state);

        info!(session = %id, %initiator, %target, "Trade started");
        self.notify_started(&id, &initiator, target);
        Ok(id)
    }

    /// Decline the request pending for `target`
    pub async fn decline_request(&self, target: &ActorId) -> bool {
        let request = self.inner.state.lock().await.pending.remove(target);
        let Some(request) = request else {
            return false;
        };
        request.timeout.cancel();
        request.session.lock().await.cancel();

        debug!(%target, initiator = %request.initiator, "Trade request declined");
        for (to, other) in [(&request.initiator, target), (target, &request.initiator)] {
            self.notify(
                to,
                TradeEvent::RequestClosed {
                    other: other.clone(),
                    reason: RequestCloseReason::Declined,
                },
            );
        }
        true
    }

    /// Cancel the actor's session and any request it sent or received.
    ///
    /// Returns false when there was nothing to cancel.
    pub async fn cancel(&self, actor: &ActorId) -> bool {
        self.close_for(actor, false).await
    }

    /// Treat a disconnect as a cancel; only the remaining parties are told
    pub async fn on_disconnect(&self, actor: &ActorId) {
        if self.close_for(actor, true).await {
            info!(%actor, "Closed trades of disconnected actor");
        }
    }

    /// Start a session where one actor trades with itself
    pub async fn start_solo(&self, actor: &ActorId) -> Result<SessionId> {
        if !self.inner.config.debug {
            return Err(TradeError::SoloDisabled);
        }

        let mut state = self.inner.state.lock().await;
        if state.closed {
            return Err(TradeError::RegistryClosed);
        }
        if state.by_actor.contains_key(actor) {
            return Err(TradeError::AlreadyInTrade(actor.to_string()));
        }

        let mut session = TradeSession::new_solo(actor.clone(), self.inner.config.countdown());
        session.accept_request();
        let id = session.id().clone();
        state
            .active
            .insert(id.clone(), Arc::new(Mutex::new(session)));
        state.by_actor.insert(actor.clone(), id.clone());
        drop(state);

        info!(session = %id, %actor, "Solo trade started");
        self.notify(
            actor,
            TradeEvent::TradeStarted {
                session: id.clone(),
                partner: None,
            },
        );
        Ok(id)
    }

    /// Record the actor's acceptance; the countdown timer is scheduled on
    /// the transition into the countdown state
    pub async fn accept_offer(&self, actor: &ActorId) -> bool {
        let Some(session) = self.session_of(actor).await else {
            return false;
        };
        let mut guard = session.lock().await;

        if !guard.accept(actor) {
            return false;
        }
        let after = guard.state();

        if after == TradeState::BothAcceptedCountdown && !guard.has_countdown_timer() {
            let timer = self.schedule_countdown(session.clone(), guard.remaining_countdown());
            guard.set_countdown_timer(timer);
        }
        let id = guard.id().clone();
        let participants = guard.participants();
        drop(guard);

        self.notify_all(
            &participants,
            TradeEvent::Updated {
                session: id,
                state: after,
            },
        );
        true
    }

    /// Withdraw the actor's acceptance
    pub async fn revoke_acceptance(&self, actor: &ActorId) -> bool {
        let Some(session) = self.session_of(actor).await else {
            return false;
        };
        let mut guard = session.lock().await;
        if !guard.revoke_accept(actor) {
            return false;
        }
        let id = guard.id().clone();
        let state = guard.state();
        let partner = guard.other_party(actor).cloned();
        let participants = guard.participants();
        drop(guard);

        self.notify_revoked(actor, partner.as_ref());
        self.notify_all(&participants, TradeEvent::Updated { session: id, state });
        true
    }

    /// Reset acceptances after an offer edit made outside [`TradeRegistry::update_offer`]
    pub async fn on_offer_changed(&self, actor: &ActorId) -> bool {
        let Some(session) = self.session_of(actor).await else {
            return false;
        };
        let mut guard = session.lock().await;
        let reset = guard.on_offer_changed();
        let id = guard.id().clone();
        let state = guard.state();
        let participants = guard.participants();
        drop(guard);

        if reset {
            self.notify_all(&participants, TradeEvent::Updated { session: id, state });
        }
        reset
    }

    /// Apply `edit` to the actor's own offer.
    ///
    /// Any change to the offer's entries resets both acceptances. Edits to a
    /// locked offer are rejected by the offer itself.
    pub async fn update_offer<F, R>(&self, actor: &ActorId, edit: F) -> Result<R>
    where
        F: FnOnce(&mut Offer) -> R,
    {
        let session = self
            .session_of(actor)
            .await
            .ok_or_else(|| TradeError::NoActiveSession(actor.to_string()))?;
        let mut guard = session.lock().await;

        if !matches!(
            guard.state(),
            TradeState::Negotiating | TradeState::OneAccepted | TradeState::BothAcceptedCountdown
        ) {
            return Err(TradeError::EditRejected(actor.to_string()));
        }

        let offer = guard
            .offer_mut_for(actor)
            .ok_or_else(|| TradeError::NotParticipant(actor.to_string()))?;
        let before = offer.entries().to_vec();
        let output = edit(offer);
        let changed = offer.entries() != before.as_slice();

        if !changed {
            return Ok(output);
        }
        guard.on_offer_changed();
        let id = guard.id().clone();
        let state = guard.state();
        let participants = guard.participants();
        drop(guard);

        self.notify_all(&participants, TradeEvent::Updated { session: id, state });
        Ok(output)
    }

    /// React to a change in the actor's resource pool.
    ///
    /// An acceptance the actor already gave is withdrawn, then both sides are
    /// told to refresh. Must not be called while holding the actor's pool
    /// lock, since execution takes the session lock before pool locks.
    pub async fn on_pool_changed(&self, actor: &ActorId) {
        let Some(session) = self.session_of(actor).await else {
            return;
        };
        let mut guard = session.lock().await;

        let state = guard.state();
        if state == TradeState::Executing || state.is_terminal() {
            return;
        }
        let Some(role) = guard.role_of(actor) else {
            return;
        };
        let revoked = guard.has_accepted(role) && guard.revoke_accept(actor);

        let id = guard.id().clone();
        let state = guard.state();
        let partner = guard.other_party(actor).cloned();
        let participants = guard.participants();
        drop(guard);

        if revoked {
            debug!(session = %id, %actor, "Pool changed, acceptance withdrawn");
            self.notify_revoked(actor, partner.as_ref());
        }
        self.notify_all(&participants, TradeEvent::Updated { session: id, state });
    }

    /// Execute the actor's session once its countdown has elapsed.
    ///
    /// Completed and failed sessions are retired; a side failure leaves the
    /// session negotiating.
    pub async fn execute(&self, actor: &ActorId) -> Result<TradeResult> {
        let session = self
            .session_of(actor)
            .await
            .ok_or_else(|| TradeError::NoActiveSession(actor.to_string()))?;
        let mut guard = session.lock().await;

        if guard.state().is_terminal() {
            return Err(TradeError::NoActiveSession(actor.to_string()));
        }
        if !guard.is_countdown_complete() {
            return Ok(TradeResult::not_ready());
        }

        let initiator = guard.initiator().clone();
        let counterpart = guard.counterpart().clone();
        let engine = self.inner.engine;

        let result = if guard.is_solo() {
            match self.inner.pools.pool_for(&initiator) {
                Some(pool) => {
                    let mut pool = pool.lock().await;
                    guard.execute(&engine, Pools::solo(&mut *pool))
                }
                None => {
                    warn!(actor = %initiator, "No resource pool for actor");
                    guard.abort_unavailable()
                }
            }
        } else {
            match self.resolve_pair(&initiator, &counterpart) {
                Some((first, second)) => {
                    let (mut first_guard, mut second_guard) = if initiator <= counterpart {
                        let a = first.lock().await;
                        let b = second.lock().await;
                        (a, b)
                    } else {
                        let b = second.lock().await;
                        let a = first.lock().await;
                        (a, b)
                    };
                    guard.execute(
                        &engine,
                        Pools::pair(&mut *first_guard, &mut *second_guard),
                    )
                }
                None => guard.abort_unavailable(),
            }
        };

        let id = guard.id().clone();
        let state = guard.state();
        let participants = guard.participants();
        let roles: Vec<_> = participants
            .iter()
            .filter_map(|actor| guard.role_of(actor).map(|role| (actor.clone(), role)))
            .collect();
        drop(guard);

        if state == TradeState::Completed || state == TradeState::Failed {
            self.inner.state.lock().await.retire(&id);
        }

        if result.success {
            self.notify_all(
                &participants,
                TradeEvent::SessionClosed {
                    session: id,
                    reason: CloseReason::Completed,
                },
            );
            return Ok(result);
        }

        for (to, role) in &roles {
            self.notify(
                to,
                TradeEvent::ExchangeFailed {
                    cause: result.cause,
                    notice: result.notice_for(*role).clone(),
                },
            );
        }
        let followup = if state == TradeState::Failed {
            TradeEvent::SessionClosed {
                session: id,
                reason: CloseReason::Failed,
            }
        } else {
            TradeEvent::Updated { session: id, state }
        };
        self.notify_all(&participants, followup);
        Ok(result)
    }

    /// Cancel every timer and force-cancel every session and request.
    ///
    /// Pools are left untouched.
    pub async fn shutdown(&self) {
        self.inner.timers.cancel();

        let mut state = self.inner.state.lock().await;
        state.closed = true;
        let requests: Vec<(ActorId, PendingRequest)> = state.pending.drain().collect();
        let sessions: Vec<SharedSession> = state.active.drain().map(|(_, session)| session).collect();
        state.by_actor.clear();
        drop(state);

        for (target, request) in &requests {
            request.session.lock().await.cancel();
            for (to, other) in [(&request.initiator, target), (target, &request.initiator)] {
                self.notify(
                    to,
                    TradeEvent::RequestClosed {
                        other: other.clone(),
                        reason: RequestCloseReason::Cancelled,
                    },
                );
            }
        }

        for session in &sessions {
            let mut guard = session.lock().await;
            if !guard.cancel() {
                continue;
            }
            let id = guard.id().clone();
            let participants = guard.participants();
            drop(guard);
            self.notify_all(
                &participants,
                TradeEvent::SessionClosed {
                    session: id,
                    reason: CloseReason::Shutdown,
                },
            );
        }

        info!(
            sessions = sessions.len(),
            requests = requests.len(),
            "Trade registry shut down"
        );
    }

    /// Copy of the actor's session
    pub async fn session_view(&self, actor: &ActorId) -> Option<SessionView> {
        let session = self.session_of(actor).await?;
        let view = session.lock().await.view();
        Some(view)
    }

    /// Who sent the request pending for `target`
    pub async fn pending_request_for(&self, target: &ActorId) -> Option<ActorId> {
        self.inner
            .state
            .lock()
            .await
            .pending
            .get(target)
            .map(|request| request.initiator.clone())
    }

    pub async fn is_in_trade(&self, actor: &ActorId) -> bool {
        self.inner.state.lock().await.by_actor.contains_key(actor)
    }

    pub async fn has_pending_request(&self, target: &ActorId) -> bool {
        self.inner.state.lock().await.pending.contains_key(target)
    }

    pub async fn active_session_count(&self) -> usize {
        self.inner.state.lock().await.active.len()
    }

    async fn session_of(&self, actor: &ActorId) -> Option<SharedSession> {
        self.inner.state.lock().await.session_of(actor)
    }

    /// Move a pending request into the active maps
    async fn activate(
        state: &mut RegistryState,
        target: &ActorId,
        request: PendingRequest,
    ) -> SessionId {
        request.timeout.cancel();
        let id = {
            let mut session = request.session.lock().await;
            session.accept_request();
            session.id().clone()
        };
        state.active.insert(id.clone(), request.session);
        state.by_actor.insert(request.initiator, id.clone());
        state.by_actor.insert(target.clone(), id.clone());
        id
    }

    fn resolve_pair(
        &self,
        initiator: &ActorId,
        counterpart: &ActorId,
    ) -> Option<(SharedPool, SharedPool)> {
        let Some(first) = self.inner.pools.pool_for(initiator) else {
            warn!(actor = %initiator, "No resource pool for actor");
            return None;
        };
        let Some(second) = self.inner.pools.pool_for(counterpart) else {
            warn!(actor = %counterpart, "No resource pool for actor");
            return None;
        };
        if Arc::ptr_eq(&first, &second) {
            warn!(%initiator, %counterpart, "Both actors resolve to the same pool");
            return None;
        }
        Some((first, second))
    }

    async fn close_for(&self, actor: &ActorId, disconnected: bool) -> bool {
        let mut state = self.inner.state.lock().await;
        let session = state
            .by_actor
            .get(actor)
            .cloned()
            .and_then(|id| state.retire(&id));
        let requests = state.take_pending_involving(actor);
        drop(state);

        let mut closed = false;

        if let Some(session) = session {
            let mut guard = session.lock().await;
            let cancelled = guard.cancel();
            let id = guard.id().clone();
            let participants = guard.participants();
            drop(guard);

            if cancelled {
                closed = true;
                for to in &participants {
                    let reason = match (to == actor, disconnected) {
                        (true, true) => continue,
                        (true, false) => CloseReason::CancelledByYou,
                        (false, true) => CloseReason::PartnerDisconnected,
                        (false, false) => CloseReason::CancelledByPartner,
                    };
                    self.notify(
                        to,
                        TradeEvent::SessionClosed {
                            session: id.clone(),
                            reason,
                        },
                    );
                }
                debug!(session = %id, %actor, "Trade session cancelled");
            }
        }

        let reason = if disconnected {
            RequestCloseReason::Disconnected
        } else {
            RequestCloseReason::Cancelled
        };
        for (target, request) in requests {
            request.timeout.cancel();
            request.session.lock().await.cancel();
            closed = true;

            let other = if &target == actor {
                request.initiator
            } else {
                target
            };
            self.notify(
                &other,
                TradeEvent::RequestClosed {
                    other: actor.clone(),
                    reason,
                },
            );
        }

        closed
    }

    fn schedule_request_timeout(&self, target: ActorId, session: SharedSession) -> TimerHandle {
        let registry = Arc::downgrade(&self.inner);
        TimerHandle::schedule(
            &self.inner.timers,
            self.inner.config.request_timeout(),
            async move {
                if let Some(registry) = upgrade(&registry) {
                    registry.expire_request(&target, &session).await;
                }
            },
        )
    }

    async fn expire_request(&self, target: &ActorId, session: &SharedSession) {
        let mut state = self.inner.state.lock().await;
        let same_request = state
            .pending
            .get(target)
            .is_some_and(|request| Arc::ptr_eq(&request.session, session));
        if !same_request {
            return;
        }
        let Some(request) = state.pending.remove(target) else {
            return;
        };
        drop(state);

        request.session.lock().await.cancel();
        info!(%target, initiator = %request.initiator, "Trade request expired");

        for (to, other) in [(&request.initiator, target), (target, &request.initiator)] {
            self.notify(
                to,
                TradeEvent::RequestClosed {
                    other: other.clone(),
                    reason: RequestCloseReason::Expired,
                },
            );
        }
    }

    fn schedule_countdown(&self, session: SharedSession, delay: std::time::Duration) -> TimerHandle {
        let registry = Arc::downgrade(&self.inner);
        TimerHandle::schedule(&self.inner.timers, delay, async move {
            if let Some(registry) = upgrade(&registry) {
                registry.countdown_elapsed(&session).await;
            }
        })
    }

    /// Countdown timer callback; only announces readiness
    async fn countdown_elapsed(&self, session: &SharedSession) {
        let guard = session.lock().await;
        if !guard.is_countdown_complete() {
            return;
        }
        let id = guard.id().clone();
        let participants = guard.participants();
        drop(guard);

        debug!(session = %id, "Countdown complete");
        self.notify_all(&participants, TradeEvent::CountdownReady { session: id });
    }

    fn notify(&self, to: &ActorId, event: TradeEvent) {
        self.inner.notifier.notify(to, event);
    }

    fn notify_all(&self, actors: &[ActorId], event: TradeEvent) {
        for actor in actors {
            self.notify(actor, event.clone());
        }
    }

    fn notify_started(&self, id: &SessionId, initiator: &ActorId, target: &ActorId) {
        self.notify(
            initiator,
            TradeEvent::TradeStarted {
                session: id.clone(),
                partner: Some(target.clone()),
            },
        );
        self.notify(
            target,
            TradeEvent::TradeStarted {
                session: id.clone(),
                partner: Some(initiator.clone()),
            },
        );
    }

    fn notify_revoked(&self, actor: &ActorId, partner: Option<&ActorId>) {
        self.notify(actor, TradeEvent::AcceptRevoked { by_partner: false });
        if let Some(partner) = partner {
            self.notify(partner, TradeEvent::AcceptRevoked { by_partner: true });
        }
    }
}

fn upgrade(inner: &Weak<Inner>) -> Option<TradeRegistry> {
    inner.upgrade().map(|inner| TradeRegistry { inner })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{MemoryDirectory, MemoryPool};
    use crate::trade::notify::{ChannelNotifier, Delivery};
    use crate::types::ResourceEntry;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    fn setup(config: TradeConfig) -> (TradeRegistry, ChannelNotifier) {
        let mut directory = MemoryDirectory::new();
        let mut alice = MemoryPool::new().with_container("bag", 4);
        alice.stock("wood", 30, 100);
        let mut bob = MemoryPool::new().with_container("bag", 4);
        bob.stock("stone", 10, 100);
        directory.insert(ActorId::new("alice"), alice);
        directory.insert(ActorId::new("bob"), bob);
        directory.insert(ActorId::new("carol"), MemoryPool::new().with_container("bag", 4));

        let notifier = ChannelNotifier::new();
        let registry = TradeRegistry::new(config, Arc::new(directory), Arc::new(notifier.clone()));
        (registry, notifier)
    }

    /// Let the paused clock run forward and spawned timers finish
    async fn settle(duration: Duration) {
        tokio::time::sleep(duration).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn events_for(deliveries: &[Delivery], actor: &ActorId) -> Vec<TradeEvent> {
        deliveries
            .iter()
            .filter(|delivery| &delivery.to == actor)
            .map(|delivery| delivery.event.clone())
            .collect()
    }

    #[tokio::test]
    async fn test_request_and_accept() {
        let (registry, notifier) = setup(TradeConfig::default());
        let (alice, bob) = (ActorId::new("alice"), ActorId::new("bob"));

        let outcome = assert_ok!(registry.request(&alice, &bob).await);
        assert!(matches!(outcome, RequestOutcome::Sent(_)));
        assert_eq!(registry.pending_request_for(&bob).await, Some(alice.clone()));

        let id = assert_ok!(registry.accept_request(&bob).await);
        assert_eq!(&id, outcome.session_id());
        assert!(registry.is_in_trade(&alice).await);
        assert!(registry.is_in_trade(&bob).await);
        assert!(!registry.has_pending_request(&bob).await);
        assert_eq!(registry.active_session_count().await, 1);

        let view = registry.session_view(&bob).await.unwrap();
        assert_eq!(view.state, TradeState::Negotiating);

        let deliveries = notifier.drain().await;
        assert!(events_for(&deliveries, &bob).contains(&TradeEvent::RequestReceived {
            from: alice.clone()
        }));
        assert!(events_for(&deliveries, &alice).contains(&TradeEvent::TradeStarted {
            session: id,
            partner: Some(bob.clone()),
        }));
    }

    #[tokio::test]
    async fn test_request_rejections() {
        let (registry, _notifier) = setup(TradeConfig::default());
        let (alice, bob, carol) = (
            ActorId::new("alice"),
            ActorId::new("bob"),
            ActorId::new("carol"),
        );

        assert!(matches!(
            registry.request(&alice, &alice).await,
            Err(TradeError::SelfTrade(_))
        ));

        assert_ok!(registry.request(&alice, &bob).await);
        assert!(matches!(
            registry.request(&alice, &bob).await,
            Err(TradeError::AlreadyPending(_))
        ));
        assert!(matches!(
            registry.request(&carol, &bob).await,
            Err(TradeError::TargetBusy(_))
        ));

        assert_ok!(registry.accept_request(&bob).await);
        assert!(matches!(
            registry.request(&alice, &carol).await,
            Err(TradeError::AlreadyInTrade(_))
        ));
        assert!(matches!(
            registry.request(&carol, &bob).await,
            Err(TradeError::TargetInTrade(_))
        ));
        assert_err!(registry.accept_request(&bob).await);
    }

    #[tokio::test]
    async fn test_mirror_request_starts_session() {
        let (registry, _notifier) = setup(TradeConfig::default());
        let (alice, bob) = (ActorId::new("alice"), ActorId::new("bob"));

        let sent = assert_ok!(registry.request(&alice, &bob).await);
        let started = assert_ok!(registry.request(&bob, &alice).await);

        assert_eq!(started, RequestOutcome::Started(sent.session_id().clone()));
        let view = registry.session_view(&alice).await.unwrap();
        assert_eq!(view.initiator, alice);
        assert_eq!(view.state, TradeState::Negotiating);
        assert!(!registry.has_pending_request(&bob).await);
    }

    #[tokio::test]
    async fn test_decline_request() {
        let (registry, notifier) = setup(TradeConfig::default());
        let (alice, bob) = (ActorId::new("alice"), ActorId::new("bob"));

        registry.request(&alice, &bob).await.unwrap();
        notifier.drain().await;

        assert!(registry.decline_request(&bob).await);
        assert!(!registry.decline_request(&bob).await);
        assert!(!registry.is_in_trade(&alice).await);

        let deliveries = notifier.drain().await;
        assert_eq!(
            events_for(&deliveries, &alice),
            vec![TradeEvent::RequestClosed {
                other: bob.clone(),
                reason: RequestCloseReason::Declined,
            }]
        );
        assert_eq!(
            events_for(&deliveries, &bob),
            vec![TradeEvent::RequestClosed {
                other: alice,
                reason: RequestCloseReason::Declined,
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_expires() {
        let (registry, notifier) = setup(TradeConfig::default());
        let (alice, bob) = (ActorId::new("alice"), ActorId::new("bob"));

        registry.request(&alice, &bob).await.unwrap();
        notifier.drain().await;

        settle(Duration::from_secs(29)).await;
        assert!(registry.has_pending_request(&bob).await);

        settle(Duration::from_secs(2)).await;
        assert!(!registry.has_pending_request(&bob).await);
        assert_err!(registry.accept_request(&bob).await);

        let deliveries = notifier.drain().await;
        assert_eq!(
            events_for(&deliveries, &bob),
            vec![TradeEvent::RequestClosed {
                other: alice.clone(),
                reason: RequestCloseReason::Expired,
            }]
        );
        assert_eq!(events_for(&deliveries, &alice).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_accepted_request_does_not_expire() {
        let (registry, notifier) = setup(TradeConfig::default());
        let (alice, bob) = (ActorId::new("alice"), ActorId::new("bob"));

        registry.request(&alice, &bob).await.unwrap();
        registry.accept_request(&bob).await.unwrap();
        notifier.drain().await;

        settle(Duration::from_secs(60)).await;
        assert!(registry.is_in_trade(&alice).await);
        assert!(notifier.drain().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_countdown_ready_notification() {
        let (registry, notifier) = setup(TradeConfig::default());
        let (alice, bob) = (ActorId::new("alice"), ActorId::new("bob"));

        registry.request(&alice, &bob).await.unwrap();
        let id = registry.accept_request(&bob).await.unwrap();
        assert!(registry.accept_offer(&alice).await);
        assert!(registry.accept_offer(&bob).await);
        assert!(!registry.accept_offer(&bob).await);
        notifier.drain().await;

        settle(Duration::from_secs(3)).await;
        let deliveries = notifier.drain().await;
        assert_eq!(
            events_for(&deliveries, &alice),
            vec![TradeEvent::CountdownReady {
                session: id.clone()
            }]
        );
        assert_eq!(
            events_for(&deliveries, &bob),
            vec![TradeEvent::CountdownReady { session: id }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_revoked_countdown_stays_silent() {
        let (registry, notifier) = setup(TradeConfig::default());
        let (alice, bob) = (ActorId::new("alice"), ActorId::new("bob"));

        registry.request(&alice, &bob).await.unwrap();
        registry.accept_request(&bob).await.unwrap();
        registry.accept_offer(&alice).await;
        registry.accept_offer(&bob).await;
        assert!(registry.revoke_acceptance(&alice).await);
        notifier.drain().await;

        settle(Duration::from_secs(5)).await;
        assert!(notifier.drain().await.is_empty());

        let result = registry.execute(&alice).await.unwrap();
        assert_eq!(result, TradeResult::not_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_retires_session() {
        let (registry, notifier) = setup(TradeConfig::default());
        let (alice, bob) = (ActorId::new("alice"), ActorId::new("bob"));

        registry.request(&alice, &bob).await.unwrap();
        registry.accept_request(&bob).await.unwrap();
        registry
            .update_offer(&alice, |offer| offer.add(ResourceEntry::new("wood", 10).unwrap()))
            .await
            .unwrap();
        registry.accept_offer(&alice).await;
        registry.accept_offer(&bob).await;
        settle(Duration::from_secs(3)).await;
        notifier.drain().await;

        let result = registry.execute(&bob).await.unwrap();
        assert!(result.success);
        assert!(!registry.is_in_trade(&alice).await);
        assert_eq!(registry.active_session_count().await, 0);
        assert!(matches!(
            registry.execute(&bob).await,
            Err(TradeError::NoActiveSession(_))
        ));

        let deliveries = notifier.drain().await;
        assert!(matches!(
            events_for(&deliveries, &alice).as_slice(),
            [TradeEvent::SessionClosed {
                reason: CloseReason::Completed,
                ..
            }]
        ));
    }

    #[tokio::test]
    async fn test_update_offer_resets_acceptance() {
        let (registry, _notifier) = setup(TradeConfig::default());
        let (alice, bob) = (ActorId::new("alice"), ActorId::new("bob"));

        registry.request(&alice, &bob).await.unwrap();
        registry.accept_request(&bob).await.unwrap();
        registry
            .update_offer(&alice, |offer| offer.add(ResourceEntry::new("wood", 5).unwrap()))
            .await
            .unwrap();
        registry.accept_offer(&alice).await;

        // Alice's offer is frozen, so her edit changes nothing
        let added = registry
            .update_offer(&alice, |offer| offer.add(ResourceEntry::new("wood", 1).unwrap()))
            .await
            .unwrap();
        assert!(!added);
        let view = registry.session_view(&alice).await.unwrap();
        assert_eq!(view.state, TradeState::OneAccepted);

        // Bob's edit resets Alice's acceptance
        registry
            .update_offer(&bob, |offer| offer.add(ResourceEntry::new("stone", 1).unwrap()))
            .await
            .unwrap();
        let view = registry.session_view(&alice).await.unwrap();
        assert_eq!(view.state, TradeState::Negotiating);
        assert!(!view.initiator_accepted);
        assert!(!view.initiator_offer.is_locked());

        assert!(matches!(
            registry.update_offer(&ActorId::new("carol"), |offer| offer.len()).await,
            Err(TradeError::NoActiveSession(_))
        ));
    }

    #[tokio::test]
    async fn test_edit_after_revoke_needs_fresh_acceptance() {
        let (registry, _notifier) = setup(TradeConfig::default());
        let (alice, bob) = (ActorId::new("alice"), ActorId::new("bob"));

        registry.request(&alice, &bob).await.unwrap();
        registry.accept_request(&bob).await.unwrap();
        registry
            .update_offer(&alice, |offer| offer.add(ResourceEntry::new("wood", 10).unwrap()))
            .await
            .unwrap();
        registry
            .update_offer(&bob, |offer| offer.add(ResourceEntry::new("stone", 5).unwrap()))
            .await
            .unwrap();
        assert!(registry.accept_offer(&alice).await);
        assert!(registry.accept_offer(&bob).await);

        assert!(registry.revoke_acceptance(&bob).await);
        let edited = registry
            .update_offer(&bob, |offer| offer.set_quantity_at(0, 1))
            .await
            .unwrap();
        assert!(edited);

        let view = registry.session_view(&alice).await.unwrap();
        assert!(!view.initiator_accepted);
        assert!(!view.initiator_offer.is_locked());

        assert!(registry.accept_offer(&bob).await);
        let view = registry.session_view(&alice).await.unwrap();
        assert_eq!(view.state, TradeState::OneAccepted);
        assert_eq!(view.remaining_countdown_ms, 0);
    }

    #[tokio::test]
    async fn test_pool_change_revokes_own_acceptance() {
        let (registry, notifier) = setup(TradeConfig::default());
        let (alice, bob) = (ActorId::new("alice"), ActorId::new("bob"));

        registry.request(&alice, &bob).await.unwrap();
        registry.accept_request(&bob).await.unwrap();
        registry.accept_offer(&alice).await;
        notifier.drain().await;

        registry.on_pool_changed(&alice).await;
        let view = registry.session_view(&bob).await.unwrap();
        assert_eq!(view.state, TradeState::Negotiating);

        let deliveries = notifier.drain().await;
        assert!(events_for(&deliveries, &alice).contains(&TradeEvent::AcceptRevoked {
            by_partner: false
        }));
        assert!(events_for(&deliveries, &bob).contains(&TradeEvent::AcceptRevoked {
            by_partner: true
        }));

        // Without an acceptance only a refresh goes out
        registry.on_pool_changed(&bob).await;
        let deliveries = notifier.drain().await;
        assert_eq!(deliveries.len(), 2);
        assert!(deliveries
            .iter()
            .all(|delivery| matches!(delivery.event, TradeEvent::Updated { .. })));
    }

    #[tokio::test]
    async fn test_cancel_and_disconnect() {
        let (registry, notifier) = setup(TradeConfig::default());
        let (alice, bob, carol) = (
            ActorId::new("alice"),
            ActorId::new("bob"),
            ActorId::new("carol"),
        );

        registry.request(&alice, &bob).await.unwrap();
        registry.accept_request(&bob).await.unwrap();
        notifier.drain().await;

        assert!(registry.cancel(&alice).await);
        assert!(!registry.cancel(&alice).await);
        assert!(!registry.is_in_trade(&bob).await);
        let deliveries = notifier.drain().await;
        assert!(events_for(&deliveries, &bob).iter().any(|event| matches!(
            event,
            TradeEvent::SessionClosed {
                reason: CloseReason::CancelledByPartner,
                ..
            }
        )));

        registry.request(&carol, &alice).await.unwrap();
        notifier.drain().await;
        registry.on_disconnect(&alice).await;
        assert!(!registry.has_pending_request(&alice).await);
        let deliveries = notifier.drain().await;
        assert!(events_for(&deliveries, &alice).is_empty());
        assert_eq!(
            events_for(&deliveries, &carol),
            vec![TradeEvent::RequestClosed {
                other: alice,
                reason: RequestCloseReason::Disconnected,
            }]
        );
    }

    #[tokio::test]
    async fn test_solo_requires_debug() {
        let (registry, _notifier) = setup(TradeConfig::default());
        let alice = ActorId::new("alice");
        assert!(matches!(
            registry.start_solo(&alice).await,
            Err(TradeError::SoloDisabled)
        ));

        let config = TradeConfig {
            debug: true,
            ..TradeConfig::default()
        };
        let (registry, notifier) = setup(config);
        assert_ok!(registry.start_solo(&alice).await);
        assert!(registry.accept_offer(&alice).await);

        let view = registry.session_view(&alice).await.unwrap();
        assert!(view.solo);
        assert_eq!(view.state, TradeState::BothAcceptedCountdown);

        // One delivery per event in solo mode
        let deliveries = notifier.drain().await;
        assert_eq!(deliveries.len(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_everything() {
        let (registry, _notifier) = setup(TradeConfig::default());
        let (alice, bob, carol) = (
            ActorId::new("alice"),
            ActorId::new("bob"),
            ActorId::new("carol"),
        );

        let dave = ActorId::new("dave");

        registry.request(&alice, &bob).await.unwrap();
        registry.accept_request(&bob).await.unwrap();
        registry.request(&carol, &dave).await.unwrap();

        registry.shutdown().await;
        assert_eq!(registry.active_session_count().await, 0);
        assert!(!registry.has_pending_request(&dave).await);
        assert!(!registry.is_in_trade(&alice).await);
        assert!(matches!(
            registry.request(&carol, &bob).await,
            Err(TradeError::RegistryClosed)
        ));
    }
}
