//! Error types for tradepost

use crate::pool::SlotRef;
use crate::trade::Role;
use thiserror::Error;

/// Main error type for registry and configuration operations
#[derive(Error, Debug)]
pub enum TradeError {
    // Request errors
    #[error("Actor already in a trade: {0}")]
    AlreadyInTrade(String),

    #[error("Target already in a trade: {0}")]
    TargetInTrade(String),

    #[error("Request already pending to: {0}")]
    AlreadyPending(String),

    #[error("Target already has a pending request: {0}")]
    TargetBusy(String),

    #[error("Cannot trade with yourself: {0}")]
    SelfTrade(String),

    #[error("No pending trade request for: {0}")]
    NoPendingRequest(String),

    // Session errors
    #[error("No active trade session for: {0}")]
    NoActiveSession(String),

    #[error("Actor is not a participant: {0}")]
    NotParticipant(String),

    #[error("Solo trade sessions are disabled")]
    SoloDisabled,

    #[error("Trade registry has shut down")]
    RegistryClosed,

    // Offer errors
    #[error("Offer cannot be edited now: {0}")]
    EditRejected(String),

    #[error("Invalid offer entry: {0}")]
    InvalidEntry(String),

    // Configuration errors
    #[error("Invalid configuration value: {0}")]
    InvalidConfig(String),

    // General errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for tradepost operations
pub type Result<T> = std::result::Result<T, TradeError>;

/// Fault reported by a host resource pool
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Slot out of range: {0}")]
    SlotOutOfRange(SlotRef),

    #[error("Slot rejected write: {0}")]
    WriteRejected(SlotRef),
}

/// Why an exchange could not be carried out
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    #[error("{side} does not hold every offered resource")]
    MissingResources { side: Role },

    #[error("{side} lacks space for the incoming resources")]
    NoSpace { side: Role },

    #[error("withdrawal from {side} fell short")]
    WithdrawFailed { side: Role },

    #[error("deposit into {side} failed")]
    DepositFailed { side: Role },

    #[error("resource pool fault: {0}")]
    Pool(#[from] PoolError),

    #[error("rollback failed after {cause}: {fault}")]
    RollbackFailed { cause: String, fault: PoolError },
}

impl ExchangeError {
    /// Side held responsible, if the failure is attributable to one
    pub fn side(&self) -> Option<Role> {
        match self {
            ExchangeError::MissingResources { side }
            | ExchangeError::NoSpace { side }
            | ExchangeError::WithdrawFailed { side }
            | ExchangeError::DepositFailed { side } => Some(*side),
            ExchangeError::Pool(_) | ExchangeError::RollbackFailed { .. } => None,
        }
    }
}
