//! Trade state machine types and execution results

use crate::types::ActorId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Side of a trade session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Initiator,
    Counterpart,
}

impl Role {
    pub fn other(self) -> Role {
        match self {
            Role::Initiator => Role::Counterpart,
            Role::Counterpart => Role::Initiator,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => write!(f, "initiator"),
            Role::Counterpart => write!(f, "counterpart"),
        }
    }
}

/// Trade session state machine
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TradeState {
    /// Request sent, target has not answered
    PendingRequest,
    /// Both sides editing their offers
    Negotiating,
    /// Exactly one side accepted
    OneAccepted,
    /// Both accepted, waiting for the countdown to elapse
    BothAcceptedCountdown,
    /// Exchange in progress
    Executing,
    Completed,
    Cancelled,
    Failed,
}

impl TradeState {
    /// Check if the session has ended
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TradeState::Completed | TradeState::Cancelled | TradeState::Failed
        )
    }

    /// Check if at least one acceptance is recorded
    pub fn has_acceptance(&self) -> bool {
        matches!(
            self,
            TradeState::OneAccepted | TradeState::BothAcceptedCountdown
        )
    }
}

/// Which side a failed exchange is attributed to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureCause {
    None,
    Initiator,
    Counterpart,
    System,
}

impl From<Role> for FailureCause {
    fn from(role: Role) -> Self {
        match role {
            Role::Initiator => FailureCause::Initiator,
            Role::Counterpart => FailureCause::Counterpart,
        }
    }
}

/// Human-facing message keys produced by the trade core.
///
/// Wording and translation belong to the presentation layer; `Display`
/// gives a plain English default.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Notice {
    Completed,
    NotReady,
    PartnerUnavailable,
    ItemsNotFound,
    PartnerItemsNotFound(ActorId),
    NoSpace,
    PartnerNoSpace(ActorId),
    WithdrawFailed,
    PartnerWithdrawFailed(ActorId),
    DepositFailed,
    PartnerDepositFailed(ActorId),
    SystemError(String),
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::Completed => write!(f, "Trade completed successfully!"),
            Notice::NotReady => write!(f, "Trade not ready"),
            Notice::PartnerUnavailable => write!(f, "Other player not available"),
            Notice::ItemsNotFound => write!(f, "You don't have all the offered items anymore"),
            Notice::PartnerItemsNotFound(actor) => {
                write!(f, "{} doesn't have all offered items", actor)
            }
            Notice::NoSpace => write!(f, "You don't have enough inventory space"),
            Notice::PartnerNoSpace(actor) => write!(f, "{} doesn't have enough space", actor),
            Notice::WithdrawFailed => write!(f, "Failed to withdraw your items"),
            Notice::PartnerWithdrawFailed(actor) => {
                write!(f, "{} - failed to withdraw items", actor)
            }
            Notice::DepositFailed => write!(f, "Failed to receive items"),
            Notice::PartnerDepositFailed(actor) => write!(f, "{} couldn't receive items", actor),
            Notice::SystemError(reason) => write!(f, "Trade failed: {}", reason),
        }
    }
}

/// Outcome of an execution attempt.
///
/// `message` addresses the responsible side (or both sides for success and
/// system failures); `message_for_other` addresses the side that did not
/// cause the failure.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeResult {
    pub success: bool,
    pub cause: FailureCause,
    pub message: Notice,
    pub message_for_other: Notice,
}

impl TradeResult {
    pub fn completed() -> Self {
        Self {
            success: true,
            cause: FailureCause::None,
            message: Notice::Completed,
            message_for_other: Notice::Completed,
        }
    }

    pub fn not_ready() -> Self {
        Self::system(Notice::NotReady)
    }

    /// Failure both sides see the same way
    pub fn system(notice: Notice) -> Self {
        Self {
            success: false,
            cause: FailureCause::System,
            message_for_other: notice.clone(),
            message: notice,
        }
    }

    /// Failure attributed to one side
    pub fn side_failure(side: Role, responsible: Notice, other: Notice) -> Self {
        Self {
            success: false,
            cause: side.into(),
            message: responsible,
            message_for_other: other,
        }
    }

    /// Message routed to the given side
    pub fn notice_for(&self, role: Role) -> &Notice {
        match (self.cause, role) {
            (FailureCause::Initiator, Role::Counterpart)
            | (FailureCause::Counterpart, Role::Initiator) => &self.message_for_other,
            _ => &self.message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_terminal() {
        assert!(TradeState::Completed.is_terminal());
        assert!(TradeState::Cancelled.is_terminal());
        assert!(TradeState::Failed.is_terminal());
        assert!(!TradeState::Executing.is_terminal());
        assert!(!TradeState::PendingRequest.is_terminal());
    }

    #[test]
    fn test_notice_routing() {
        let bob = ActorId::new("bob");
        let result = TradeResult::side_failure(
            Role::Counterpart,
            Notice::NoSpace,
            Notice::PartnerNoSpace(bob),
        );

        assert_eq!(result.cause, FailureCause::Counterpart);
        assert_eq!(result.notice_for(Role::Counterpart), &Notice::NoSpace);
        assert_eq!(
            result.notice_for(Role::Initiator).to_string(),
            "bob doesn't have enough space"
        );
    }

    #[test]
    fn test_system_failure_same_for_both() {
        let result = TradeResult::not_ready();
        assert!(!result.success);
        assert_eq!(result.cause, FailureCause::System);
        assert_eq!(result.notice_for(Role::Initiator), &Notice::NotReady);
        assert_eq!(result.notice_for(Role::Counterpart), &Notice::NotReady);
    }
}
