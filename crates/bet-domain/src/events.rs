use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::BetId;
use crate::money::Amount;

/// Closed set of processor notifications the reconciler understands. Adding a
/// kind here forces every match over it to be revisited; there is no string
/// fallthrough anywhere downstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayEventKind {
    CheckoutCompleted {
        hold_ref: String,
    },
    HoldCaptured {
        hold_ref: String,
        charge_ref: String,
    },
    CaptureFailed {
        hold_ref: String,
    },
    HoldCanceled {
        hold_ref: String,
    },
    RefundIssued {
        charge_ref: String,
        refund_ref: String,
        amount: Amount,
    },
    TransferCreated {
        transfer_ref: String,
        amount: Amount,
    },
}

impl GatewayEventKind {
    #[must_use]
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::CheckoutCompleted { .. } => "checkout_completed",
            Self::HoldCaptured { .. } => "hold_captured",
            Self::CaptureFailed { .. } => "capture_failed",
            Self::HoldCanceled { .. } => "hold_canceled",
            Self::RefundIssued { .. } => "refund_issued",
            Self::TransferCreated { .. } => "transfer_created",
        }
    }

    /// The external reference the event carries, used to locate the bet when
    /// the payload has no bet id metadata.
    #[must_use]
    pub fn related_ref(&self) -> &str {
        match self {
            Self::CheckoutCompleted { hold_ref }
            | Self::HoldCaptured { hold_ref, .. }
            | Self::CaptureFailed { hold_ref }
            | Self::HoldCanceled { hold_ref } => hold_ref,
            Self::RefundIssued { charge_ref, .. } => charge_ref,
            Self::TransferCreated { transfer_ref, .. } => transfer_ref,
        }
    }
}

/// One verified, parsed notification from the processor's event stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayEvent {
    /// Processor-assigned id; the dedup key.
    pub event_id: String,
    pub bet_id: Option<BetId>,
    pub occurred_at: DateTime<Utc>,
    pub kind: GatewayEventKind,
}
