use crate::money::Money;
use crate::types::{EventKey, PaymentId, UserId};
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("insufficient funds for user {user}: balance {balance}, requested {requested}")]
    InsufficientFunds {
        user: UserId,
        balance: Money,
        requested: Money,
    },

    #[error("payment {0} was declined by the gateway")]
    PaymentDeclined(PaymentId),

    #[error("payment gateway unavailable: {0}")]
    GatewayUnavailable(String),

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("refund window closed at {deadline}")]
    RefundWindowClosed { deadline: DateTime<Utc> },

    #[error("data integrity error: {0}")]
    DataIntegrity(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("event {0} is at capacity")]
    CapacityExceeded(EventKey),

    #[error("user {user} is already registered for {event}")]
    AlreadyRegistered { user: UserId, event: EventKey },

    #[error("payment {0} expired before it was confirmed")]
    PaymentExpired(PaymentId),

    #[error("payment {payment} settled but registration failed ({cause}); {credited} credited to wallet")]
    RegistrationReversed {
        payment: PaymentId,
        credited: Money,
        cause: Box<EngineError>,
    },

    #[error("refund of {refunded} recorded for payment {payment}, registration removal still failing: {reason}")]
    CancellationIncomplete {
        payment: PaymentId,
        refunded: Money,
        reason: String,
    },
}

impl EngineError {
    /// Transient failures the caller may retry with the same identifiers.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::GatewayUnavailable(_) | EngineError::CancellationIncomplete { .. }
        )
    }

    /// Expected business outcomes, as opposed to infrastructure problems.
    pub fn is_business_outcome(&self) -> bool {
        matches!(
            self,
            EngineError::InsufficientFunds { .. }
                | EngineError::PaymentDeclined(_)
                | EngineError::InvalidAmount(_)
                | EngineError::RefundWindowClosed { .. }
                | EngineError::CapacityExceeded(_)
                | EngineError::AlreadyRegistered { .. }
                | EngineError::PaymentExpired(_)
                | EngineError::RegistrationReversed { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
