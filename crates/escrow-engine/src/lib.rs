use bet_domain::{BetId, BetStatus, DomainError, MoneyError};
use bet_store::BetStoreError;
use payment_gateway::{GatewayError, PaymentState, WebhookError};
use thiserror::Error;

pub mod fee;
pub mod guard;
pub mod reconciler;
pub mod service;

#[cfg(test)]
pub(crate) mod testing;

pub use fee::{FeePolicy, FeePolicyError, FeeSplit};
pub use guard::BetLockRegistry;
pub use reconciler::WebhookReconciler;
pub use service::{
    EscrowOpened, EscrowService, FailureSettlement, OpenEscrowRequest, ReconcileOutcome,
    StakeLimits, SuccessSettlement,
};

#[derive(Debug, Error)]
pub enum EscrowError {
    #[error("bet {0} not found")]
    BetNotFound(BetId),
    #[error("stake {amount} outside allowed range {min}..={max}")]
    InvalidAmount {
        amount: bet_domain::Amount,
        min: bet_domain::Amount,
        max: bet_domain::Amount,
    },
    #[error("bet {bet_id} already staked {recorded}, retry carried {requested}")]
    StakeMismatch {
        bet_id: BetId,
        recorded: bet_domain::Amount,
        requested: bet_domain::Amount,
    },
    #[error("bet {bet_id} is not active (status {status})")]
    NotActive { bet_id: BetId, status: BetStatus },
    #[error("bet {bet_id} already resolved as {status}")]
    AlreadyResolved { bet_id: BetId, status: BetStatus },
    #[error("bet {0} has no payee destination configured")]
    MissingPayeeDestination(BetId),
    #[error("bet {0} has no escrow hold")]
    MissingHoldRef(BetId),
    #[error("escrow for bet {0} could not be captured")]
    EscrowCaptureFailed(BetId),
    #[error("unexpected payment state for bet {bet_id}: {state:?}")]
    UnexpectedPaymentState { bet_id: BetId, state: PaymentState },
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Store(#[from] BetStoreError),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Money(#[from] MoneyError),
    #[error(transparent)]
    Webhook(#[from] WebhookError),
}

impl EscrowError {
    /// True when the caller may safely retry the same operation; nothing has
    /// advanced and the engine will pick up from persisted state.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Gateway(err) => err.is_retryable(),
            Self::Store(BetStoreError::StaleStatus { .. }) => true,
            _ => false,
        }
    }
}
