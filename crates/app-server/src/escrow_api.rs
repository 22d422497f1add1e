use std::sync::Arc;

use bet_domain::{Bet, BetId, BetStatus, PayeeId};
use bet_store::{BetRepository, BetStoreError, SettlementEventRepository};
use escrow_engine::{
    EscrowError, EscrowService, OpenEscrowRequest, ReconcileOutcome, SuccessSettlement,
    WebhookReconciler,
};
use payment_gateway::{PaymentGateway, WebhookError};
use serde::{Deserialize, Serialize};
use service_core::{ErrorCode, ResponseEnvelope};
use tracing::warn;

pub type DynEscrowService =
    EscrowService<dyn BetRepository, dyn SettlementEventRepository, dyn PaymentGateway>;
pub type DynWebhookReconciler =
    WebhookReconciler<dyn BetRepository, dyn SettlementEventRepository, dyn PaymentGateway>;

/// Application surface over the escrow engine: one method per lifecycle
/// operation, every outcome folded into a `ResponseEnvelope` with a public
/// error code.
pub struct EscrowApi {
    service: Arc<DynEscrowService>,
    reconciler: Arc<DynWebhookReconciler>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenEscrowBody {
    pub amount_cents: u64,
    pub payee_id: Option<PayeeId>,
    pub payee_destination: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EscrowOpenedBody {
    pub bet_id: BetId,
    pub hold_ref: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BetStatusBody {
    pub bet_id: BetId,
    pub status: BetStatus,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnChannel {
    /// The hold was released before capture.
    Released,
    /// The charge was refunded after an async capture.
    Refunded,
}

#[derive(Debug, Clone, Serialize)]
pub struct SuccessBody {
    pub bet_id: BetId,
    pub reference: String,
    pub channel: ReturnChannel,
    pub amount_cents: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureBody {
    pub bet_id: BetId,
    pub transfer_ref: String,
    pub fee_cents: u64,
    pub donation_cents: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WebhookAck {
    pub outcome: &'static str,
}

impl EscrowApi {
    pub fn new(service: Arc<DynEscrowService>, reconciler: Arc<DynWebhookReconciler>) -> Self {
        Self {
            service,
            reconciler,
        }
    }

    pub async fn open_escrow(
        &self,
        bet_id: BetId,
        body: OpenEscrowBody,
    ) -> ResponseEnvelope<EscrowOpenedBody> {
        let request = OpenEscrowRequest {
            bet_id,
            amount: bet_domain::Amount(body.amount_cents),
            payee_id: body.payee_id,
            payee_destination: body.payee_destination,
        };
        match self.service.open_escrow(request).await {
            Ok(opened) => ResponseEnvelope::ok(EscrowOpenedBody {
                bet_id: opened.bet_id,
                hold_ref: opened.hold_ref.0,
            }),
            Err(err) => error_envelope("open_escrow", bet_id, &err),
        }
    }

    pub async fn activate(&self, bet_id: BetId) -> ResponseEnvelope<BetStatusBody> {
        match self.service.activate(bet_id).await {
            Ok(status) => ResponseEnvelope::ok(BetStatusBody { bet_id, status }),
            Err(err) => error_envelope("activate", bet_id, &err),
        }
    }

    pub async fn resolve_success(&self, bet_id: BetId) -> ResponseEnvelope<SuccessBody> {
        match self.service.resolve_success(bet_id).await {
            Ok(settlement) => {
                let (channel, reference, amount) = match settlement {
                    SuccessSettlement::Released {
                        release_ref,
                        amount,
                    } => (ReturnChannel::Released, release_ref, amount),
                    SuccessSettlement::Refunded { refund_ref, amount } => {
                        (ReturnChannel::Refunded, refund_ref, amount)
                    }
                };
                ResponseEnvelope::ok(SuccessBody {
                    bet_id,
                    reference,
                    channel,
                    amount_cents: amount.as_minor(),
                })
            }
            Err(err) => error_envelope("resolve_success", bet_id, &err),
        }
    }

    pub async fn resolve_failure(&self, bet_id: BetId) -> ResponseEnvelope<FailureBody> {
        match self.service.resolve_failure(bet_id).await {
            Ok(settlement) => ResponseEnvelope::ok(FailureBody {
                bet_id,
                transfer_ref: settlement.transfer_ref,
                fee_cents: settlement.fee.as_minor(),
                donation_cents: settlement.donation.as_minor(),
            }),
            Err(err) => error_envelope("resolve_failure", bet_id, &err),
        }
    }

    pub async fn get_bet(&self, bet_id: BetId) -> ResponseEnvelope<Bet> {
        match self.service.get_bet(bet_id).await {
            Ok(bet) => ResponseEnvelope::ok(bet),
            Err(err) => error_envelope("get_bet", bet_id, &err),
        }
    }

    pub async fn handle_gateway_event(
        &self,
        payload: &[u8],
        signature_header: Option<&str>,
    ) -> ResponseEnvelope<WebhookAck> {
        let Some(signature) = signature_header else {
            return ResponseEnvelope::err(ErrorCode::InvalidSignature, "missing signature header");
        };
        match self
            .reconciler
            .handle_gateway_event(payload, signature)
            .await
        {
            Ok(outcome) => ResponseEnvelope::ok(WebhookAck {
                outcome: outcome_label(&outcome),
            }),
            Err(err) => {
                warn!(%err, "gateway event rejected");
                ResponseEnvelope::err(webhook_error_code(&err), err.to_string())
            }
        }
    }
}

fn outcome_label(outcome: &ReconcileOutcome) -> &'static str {
    match outcome {
        ReconcileOutcome::Applied { .. } => "applied",
        ReconcileOutcome::Duplicate => "duplicate",
        ReconcileOutcome::AlreadySettled { .. } => "already_settled",
        ReconcileOutcome::Ignored { .. } => "ignored",
        ReconcileOutcome::Unmatched => "unmatched",
        ReconcileOutcome::UnsupportedKind { .. } => "unsupported",
    }
}

fn error_code(err: &EscrowError) -> ErrorCode {
    match err {
        EscrowError::BetNotFound(_) | EscrowError::Store(BetStoreError::BetNotFound(_)) => {
            ErrorCode::BetNotFound
        }
        EscrowError::InvalidAmount { .. } | EscrowError::StakeMismatch { .. } => {
            ErrorCode::InvalidAmount
        }
        EscrowError::NotActive { .. } | EscrowError::MissingHoldRef(_) => ErrorCode::NotActive,
        EscrowError::AlreadyResolved { .. } => ErrorCode::AlreadyResolved,
        EscrowError::MissingPayeeDestination(_) => ErrorCode::MissingPayeeDestination,
        EscrowError::EscrowCaptureFailed(_) | EscrowError::UnexpectedPaymentState { .. } => {
            ErrorCode::PaymentFailed
        }
        EscrowError::Gateway(_) => ErrorCode::GatewayUnavailable,
        EscrowError::Webhook(_) => webhook_error_code(err),
        EscrowError::Store(_) | EscrowError::Domain(_) | EscrowError::Money(_) => {
            ErrorCode::InternalError
        }
    }
}

fn webhook_error_code(err: &EscrowError) -> ErrorCode {
    match err {
        EscrowError::Webhook(
            WebhookError::MalformedPayload(_) | WebhookError::UnsupportedEventType(_),
        ) => ErrorCode::RequestInvalid,
        EscrowError::Webhook(_) => ErrorCode::InvalidSignature,
        other => error_code(other),
    }
}

fn error_envelope<T>(operation: &str, bet_id: BetId, err: &EscrowError) -> ResponseEnvelope<T> {
    warn!(%bet_id, operation, %err, "escrow operation failed");
    ResponseEnvelope::err(error_code(err), err.to_string())
}
