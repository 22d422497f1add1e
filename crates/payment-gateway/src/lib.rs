use async_trait::async_trait;
use bet_domain::{Amount, BetId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub mod rest;
pub mod webhook;

pub use rest::RestPaymentGateway;
pub use webhook::{parse_gateway_event, WebhookError, WebhookVerifier};

/// Gateway-side failure taxonomy. The three variants demand three different
/// reactions from the caller, so they are kept distinct rather than collapsed
/// into one opaque error:
/// - `Rejected`: the processor refused the call; nothing moved; retrying the
///   same call will fail the same way.
/// - `Transient`: nothing moved; safe to retry with the same idempotency key.
/// - `AmbiguousOutcome`: the call may or may not have taken effect; the caller
///   must re-query gateway state before deciding anything.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("gateway rejected request: {code}: {message}")]
    Rejected { code: String, message: String },
    #[error("transient gateway failure: {0}")]
    Transient(String),
    #[error("ambiguous outcome: {0}")]
    AmbiguousOutcome(String),
}

impl GatewayError {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

macro_rules! ref_type {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

ref_type!(HoldRef);
ref_type!(ChargeRef);
ref_type!(RefundRef);
ref_type!(ReleaseRef);
ref_type!(TransferRef);

/// Processor-side view of a hold/charge, from `get_payment_state`. Used to
/// resume after an ambiguous failure instead of guessing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentState {
    /// Funds authorized and earmarked, awaiting manual capture.
    RequiresCapture,
    /// The hold has been converted into a charge.
    Captured { charge_ref: ChargeRef },
    /// The hold was released; funds returned without a charge.
    Canceled,
    /// Authorization never succeeded.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenHoldRequest {
    pub bet_id: BetId,
    pub amount: Amount,
    pub currency: String,
    /// Derived from the bet id by the caller; the processor guarantees a
    /// retried open never creates a second hold under the same key.
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundRequest {
    pub charge_ref: ChargeRef,
    pub amount: Amount,
    pub bet_id: BetId,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub charge_ref: ChargeRef,
    pub destination: String,
    pub amount: Amount,
    pub bet_id: BetId,
    pub idempotency_key: String,
    pub metadata: Value,
}

/// The money movement gateway contract. One implementation talks to the real
/// processor over HTTP; tests substitute programmable mocks.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Opens a manual-capture hold: funds are earmarked, not moved.
    async fn open_hold(&self, request: &OpenHoldRequest) -> Result<HoldRef, GatewayError>;

    /// Converts the hold into an actual charge.
    async fn capture_hold(&self, hold_ref: &HoldRef) -> Result<ChargeRef, GatewayError>;

    /// Releases the hold; funds return to the payer, no charge exists.
    async fn cancel_hold(&self, hold_ref: &HoldRef) -> Result<ReleaseRef, GatewayError>;

    async fn refund_charge(&self, request: &RefundRequest) -> Result<RefundRef, GatewayError>;

    async fn transfer_from_charge(
        &self,
        request: &TransferRequest,
    ) -> Result<TransferRef, GatewayError>;

    async fn get_payment_state(&self, hold_ref: &HoldRef) -> Result<PaymentState, GatewayError>;
}
