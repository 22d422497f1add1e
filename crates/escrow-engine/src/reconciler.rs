use std::sync::Arc;

use bet_store::{BetRepository, SettlementEventRepository};
use payment_gateway::{parse_gateway_event, PaymentGateway, WebhookError, WebhookVerifier};
use tracing::{info, warn};

use crate::service::{EscrowService, ReconcileOutcome};
use crate::EscrowError;

/// Inbound side of reconciliation: verify, parse, then hand the event to the
/// engine's shared transition path. Events may arrive late, repeated or out of
/// order; everything after signature verification is idempotent.
pub struct WebhookReconciler<B: ?Sized, E: ?Sized, G: ?Sized> {
    verifier: WebhookVerifier,
    service: Arc<EscrowService<B, E, G>>,
}

impl<B, E, G> WebhookReconciler<B, E, G>
where
    B: BetRepository + ?Sized,
    E: SettlementEventRepository + ?Sized,
    G: PaymentGateway + ?Sized,
{
    pub fn new(verifier: WebhookVerifier, service: Arc<EscrowService<B, E, G>>) -> Self {
        Self { verifier, service }
    }

    pub async fn handle_gateway_event(
        &self,
        payload: &[u8],
        signature_header: &str,
    ) -> Result<ReconcileOutcome, EscrowError> {
        // Unverified payloads never reach the parser or the event store.
        self.verifier.verify(payload, signature_header)?;

        let event = match parse_gateway_event(payload) {
            Ok(event) => event,
            Err(WebhookError::UnsupportedEventType(kind)) => {
                warn!(%kind, "dropping unsupported gateway event type");
                return Ok(ReconcileOutcome::UnsupportedKind { kind });
            }
            Err(err) => return Err(err.into()),
        };

        let outcome = self.service.apply_gateway_event(&event).await?;
        info!(
            event_id = %event.event_id,
            kind = event.kind.kind_str(),
            outcome = ?outcome,
            "gateway event processed"
        );
        Ok(outcome)
    }
}
