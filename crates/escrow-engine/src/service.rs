use std::sync::Arc;

use bet_domain::{
    Amount, Bet, BetId, BetStatus, DomainError, GatewayEvent, GatewayEventKind, PayeeId, TraceId,
};
use bet_store::{
    BetRepository, BetStoreError, EventInsertOutcome, SettlementEventRecord,
    SettlementEventRepository,
};
use chrono::Utc;
use payment_gateway::{
    ChargeRef, GatewayError, HoldRef, OpenHoldRequest, PaymentGateway, PaymentState, RefundRequest,
    TransferRequest,
};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::fee::FeePolicy;
use crate::guard::BetLockRegistry;
use crate::EscrowError;

const SOURCE_CONTROLLER: &str = "controller";
const SOURCE_RESOLUTION: &str = "resolution";
const SOURCE_WEBHOOK: &str = "gateway_webhook";

/// Bounds on what a single bet may stake, in minor units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StakeLimits {
    pub min: Amount,
    pub max: Amount,
}

impl Default for StakeLimits {
    fn default() -> Self {
        Self {
            min: Amount(50_00),
            max: Amount(5000_00),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenEscrowRequest {
    pub bet_id: BetId,
    pub amount: Amount,
    pub payee_id: Option<PayeeId>,
    pub payee_destination: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscrowOpened {
    pub bet_id: BetId,
    pub hold_ref: HoldRef,
}

/// Outcome of a successful resolution. Which side the money came back through
/// depends on whether the hold had already been captured when the bet was won.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuccessSettlement {
    Released { release_ref: String, amount: Amount },
    Refunded { refund_ref: String, amount: Amount },
}

impl SuccessSettlement {
    #[must_use]
    pub fn reference(&self) -> &str {
        match self {
            Self::Released { release_ref, .. } => release_ref,
            Self::Refunded { refund_ref, .. } => refund_ref,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureSettlement {
    pub transfer_ref: String,
    pub fee: Amount,
    pub donation: Amount,
}

/// What a gateway notification did to local state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Applied { bet_id: BetId, status: BetStatus },
    /// The event id was seen before; nothing changed.
    Duplicate,
    /// The bet is already terminal; the event was recorded and discarded.
    AlreadySettled { bet_id: BetId },
    /// The event is legal for this bet but a no-op in its current state.
    Ignored { bet_id: BetId },
    /// No bet matches the reference the event carries.
    Unmatched,
    /// Parsed envelope with an event type this build does not handle.
    UnsupportedKind { kind: String },
}

/// The escrow state machine. All mutation of a bet goes through here: the
/// explicit lifecycle calls and the webhook reconciler share the same per-bet
/// lock, the same legality table and the same status-conditioned commit.
pub struct EscrowService<B: ?Sized, E: ?Sized, G: ?Sized> {
    bets: Arc<B>,
    events: Arc<E>,
    gateway: Arc<G>,
    fee_policy: FeePolicy,
    stake_limits: StakeLimits,
    currency: String,
    locks: BetLockRegistry,
}

impl<B, E, G> EscrowService<B, E, G>
where
    B: BetRepository + ?Sized,
    E: SettlementEventRepository + ?Sized,
    G: PaymentGateway + ?Sized,
{
    pub fn new(bets: Arc<B>, events: Arc<E>, gateway: Arc<G>, fee_policy: FeePolicy) -> Self {
        Self {
            bets,
            events,
            gateway,
            fee_policy,
            stake_limits: StakeLimits::default(),
            currency: "usd".to_string(),
            locks: BetLockRegistry::new(),
        }
    }

    #[must_use]
    pub fn with_stake_limits(mut self, limits: StakeLimits) -> Self {
        self.stake_limits = limits;
        self
    }

    #[must_use]
    pub fn with_currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = currency.into();
        self
    }

    /// Opens a manual-capture hold for the stake and moves the bet to Pending.
    /// Retrying after a crash is safe twice over: an already-recorded hold is
    /// returned as-is, and the gateway dedups the open under the derived
    /// idempotency key.
    pub async fn open_escrow(
        &self,
        request: OpenEscrowRequest,
    ) -> Result<EscrowOpened, EscrowError> {
        let bet_id = request.bet_id;
        if request.amount < self.stake_limits.min || request.amount > self.stake_limits.max {
            return Err(EscrowError::InvalidAmount {
                amount: request.amount,
                min: self.stake_limits.min,
                max: self.stake_limits.max,
            });
        }

        let _guard = self.locks.acquire(bet_id).await;

        let bet = match self.bets.get_bet(bet_id).await? {
            Some(existing) => {
                match existing.status {
                    BetStatus::Draft | BetStatus::Pending | BetStatus::Active => {}
                    BetStatus::Won | BetStatus::Lost => {
                        return Err(EscrowError::AlreadyResolved {
                            bet_id,
                            status: existing.status,
                        })
                    }
                    status => return Err(EscrowError::NotActive { bet_id, status }),
                }
                // A retry must carry the stake it carried the first time; the
                // hold was opened for the recorded amount.
                if existing.stake_amount != request.amount {
                    return Err(EscrowError::StakeMismatch {
                        bet_id,
                        recorded: existing.stake_amount,
                        requested: request.amount,
                    });
                }
                if let Some(hold) = existing.hold_ref.clone() {
                    debug!(%bet_id, hold_ref = %hold, "escrow already open");
                    return Ok(EscrowOpened {
                        bet_id,
                        hold_ref: HoldRef(hold),
                    });
                }
                existing
            }
            None => {
                let mut bet = Bet::new(bet_id, request.amount);
                bet.payee_id = request.payee_id;
                bet.payee_destination = request.payee_destination.clone();
                self.bets.insert_bet(&bet).await?;
                bet
            }
        };

        // On any gateway error the bet record stays untouched.
        let hold = self
            .gateway
            .open_hold(&OpenHoldRequest {
                bet_id,
                amount: bet.stake_amount,
                currency: self.currency.clone(),
                idempotency_key: format!("bet-{bet_id}-escrow"),
            })
            .await?;

        let prior = bet.status;
        let mut bet = bet;
        bet.hold_ref = Some(hold.0.clone());
        bet.status = BetStatus::Pending;
        self.commit(&bet, prior).await?;
        self.record_local_event(
            &bet,
            format!("open-{}", hold.0),
            "escrow_opened",
            SOURCE_CONTROLLER,
            Some(hold.0.clone()),
            Some(bet.stake_amount),
        )
        .await;

        info!(%bet_id, hold_ref = %hold, amount = %bet.stake_amount, "escrow hold opened");
        Ok(EscrowOpened {
            bet_id,
            hold_ref: hold,
        })
    }

    /// Checkout confirmation: Pending -> Active. Applying it again is a no-op.
    pub async fn activate(&self, bet_id: BetId) -> Result<BetStatus, EscrowError> {
        let _guard = self.locks.acquire(bet_id).await;
        let mut bet = self.load(bet_id).await?;
        match bet.status {
            BetStatus::Active => Ok(BetStatus::Active),
            BetStatus::Pending => {
                bet.status = BetStatus::Active;
                self.commit(&bet, BetStatus::Pending).await?;
                self.record_local_event(
                    &bet,
                    format!("activate-{bet_id}"),
                    "bet_activated",
                    SOURCE_CONTROLLER,
                    bet.hold_ref.clone(),
                    None,
                )
                .await;
                info!(%bet_id, "bet activated");
                Ok(BetStatus::Active)
            }
            BetStatus::Won | BetStatus::Lost => Err(EscrowError::AlreadyResolved {
                bet_id,
                status: bet.status,
            }),
            status => Err(EscrowError::NotActive { bet_id, status }),
        }
    }

    /// The bettor met their goal: give the whole stake back. If the hold was
    /// never captured it is released; if an async capture won the race, the
    /// resulting charge is refunded in full instead.
    pub async fn resolve_success(&self, bet_id: BetId) -> Result<SuccessSettlement, EscrowError> {
        let _guard = self.locks.acquire(bet_id).await;
        let mut bet = self.load(bet_id).await?;

        match bet.status {
            BetStatus::Won => return Self::recorded_success(&bet),
            BetStatus::Lost => {
                return Err(EscrowError::AlreadyResolved {
                    bet_id,
                    status: bet.status,
                })
            }
            BetStatus::Active => {}
            status => return Err(EscrowError::NotActive { bet_id, status }),
        }

        let hold_ref = HoldRef(
            bet.hold_ref
                .clone()
                .ok_or(EscrowError::MissingHoldRef(bet_id))?,
        );

        // Never guess whether funds moved; ask the processor first.
        let settlement = match self.gateway.get_payment_state(&hold_ref).await? {
            PaymentState::RequiresCapture => {
                let release = self.gateway.cancel_hold(&hold_ref).await?;
                bet.release_ref = Some(release.0.clone());
                SuccessSettlement::Released {
                    release_ref: release.0,
                    amount: bet.stake_amount,
                }
            }
            PaymentState::Captured { charge_ref } => {
                if bet.capture_ref.is_none() {
                    bet.capture_ref = Some(charge_ref.0.clone());
                    bet.escrow_captured_at = Some(Utc::now());
                }
                let refund = self
                    .gateway
                    .refund_charge(&RefundRequest {
                        charge_ref,
                        amount: bet.stake_amount,
                        bet_id,
                        idempotency_key: format!("bet-{bet_id}-refund"),
                    })
                    .await?;
                bet.refund_ref = Some(refund.0.clone());
                SuccessSettlement::Refunded {
                    refund_ref: refund.0,
                    amount: bet.stake_amount,
                }
            }
            PaymentState::Canceled => {
                // Already released out-of-band; record the hold as the
                // release reference so repeats have something to return.
                let release_ref = bet
                    .release_ref
                    .clone()
                    .unwrap_or_else(|| hold_ref.0.clone());
                bet.release_ref = Some(release_ref.clone());
                SuccessSettlement::Released {
                    release_ref,
                    amount: bet.stake_amount,
                }
            }
            state @ PaymentState::Failed => {
                self.mark_payment_failed(&mut bet).await?;
                return Err(EscrowError::UnexpectedPaymentState { bet_id, state });
            }
        };

        bet.refund_amount = Some(bet.stake_amount);
        bet.transfer_pending = false;
        bet.status = BetStatus::Won;
        bet.resolved_at = Some(Utc::now());
        self.commit(&bet, BetStatus::Active).await?;

        let (kind, reference) = match &settlement {
            SuccessSettlement::Released { release_ref, .. } => ("hold_canceled", release_ref),
            SuccessSettlement::Refunded { refund_ref, .. } => ("refund_issued", refund_ref),
        };
        self.record_local_event(
            &bet,
            format!("settle-{reference}"),
            kind,
            SOURCE_RESOLUTION,
            Some(reference.clone()),
            Some(bet.stake_amount),
        )
        .await;

        info!(%bet_id, reference = %settlement.reference(), "bet won, stake returned");
        Ok(settlement)
    }

    /// The bettor failed: capture the hold, keep the platform fee and transfer
    /// the rest to the anti-charity. The capture is committed as partial state
    /// before the transfer, so a retry after any later failure resumes at the
    /// transfer step instead of charging twice.
    pub async fn resolve_failure(&self, bet_id: BetId) -> Result<FailureSettlement, EscrowError> {
        let _guard = self.locks.acquire(bet_id).await;
        let mut bet = self.load(bet_id).await?;

        match bet.status {
            BetStatus::Lost => return Self::recorded_failure(&bet),
            BetStatus::Won => {
                return Err(EscrowError::AlreadyResolved {
                    bet_id,
                    status: bet.status,
                })
            }
            BetStatus::Active => {}
            status => return Err(EscrowError::NotActive { bet_id, status }),
        }

        let destination = bet
            .payee_destination
            .clone()
            .ok_or(EscrowError::MissingPayeeDestination(bet_id))?;
        let hold_ref = HoldRef(
            bet.hold_ref
                .clone()
                .ok_or(EscrowError::MissingHoldRef(bet_id))?,
        );

        let charge_ref = match bet.capture_ref.clone() {
            Some(existing) => {
                debug!(%bet_id, charge_ref = %existing, "resuming settlement with recorded capture");
                ChargeRef(existing)
            }
            None => {
                let charge = self.capture_escrow(&mut bet, &hold_ref).await?;
                bet.capture_ref = Some(charge.0.clone());
                bet.escrow_captured_at = Some(Utc::now());
                bet.transfer_pending = true;
                self.commit(&bet, BetStatus::Active).await?;
                self.record_local_event(
                    &bet,
                    format!("capture-{}", charge.0),
                    "hold_captured",
                    SOURCE_RESOLUTION,
                    Some(charge.0.clone()),
                    Some(bet.stake_amount),
                )
                .await;
                charge
            }
        };

        let split = self.fee_policy.split(bet.stake_amount)?;
        let transfer = self
            .gateway
            .transfer_from_charge(&TransferRequest {
                charge_ref,
                destination,
                amount: split.donation,
                bet_id,
                idempotency_key: format!("bet-{bet_id}-donation"),
                metadata: json!({
                    "bet_id": bet_id,
                    "platform_fee": split.fee,
                    "donation": split.donation,
                    "type": "anti_charity_donation",
                }),
            })
            .await?;

        bet.platform_fee_amount = Some(split.fee);
        bet.donation_amount = Some(split.donation);
        bet.fee_rate_bps_applied = Some(self.fee_policy.fee_bps());
        bet.transfer_ref = Some(transfer.0.clone());
        bet.transfer_pending = false;
        bet.status = BetStatus::Lost;
        bet.resolved_at = Some(Utc::now());
        self.commit(&bet, BetStatus::Active).await?;
        self.record_local_event(
            &bet,
            format!("settle-{}", transfer.0),
            "transfer_created",
            SOURCE_RESOLUTION,
            Some(transfer.0.clone()),
            Some(split.donation),
        )
        .await;

        info!(
            %bet_id,
            transfer_ref = %transfer,
            fee = %split.fee,
            donation = %split.donation,
            "bet lost, donation transferred"
        );
        Ok(FailureSettlement {
            transfer_ref: transfer.0,
            fee: split.fee,
            donation: split.donation,
        })
    }

    /// Applies one verified processor notification. Claims the event id first,
    /// so a redelivery stops before touching the bet.
    pub async fn apply_gateway_event(
        &self,
        event: &GatewayEvent,
    ) -> Result<ReconcileOutcome, EscrowError> {
        let Some(located) = self.locate_bet_for_event(event).await? else {
            warn!(
                event_id = %event.event_id,
                kind = event.kind.kind_str(),
                related_ref = event.kind.related_ref(),
                "no bet matches gateway event"
            );
            return Ok(ReconcileOutcome::Unmatched);
        };

        let _guard = self.locks.acquire(located.bet_id).await;
        // Re-read under the lock; the snapshot used for location may be stale.
        let mut bet = self.load(located.bet_id).await?;

        if self.claim_event(event, bet.bet_id).await? == EventInsertOutcome::Duplicate {
            debug!(event_id = %event.event_id, bet_id = %bet.bet_id, "duplicate gateway event");
            return Ok(ReconcileOutcome::Duplicate);
        }

        if bet.status.is_terminal() {
            info!(
                event_id = %event.event_id,
                bet_id = %bet.bet_id,
                status = %bet.status,
                "gateway event for settled bet recorded and discarded"
            );
            return Ok(ReconcileOutcome::AlreadySettled { bet_id: bet.bet_id });
        }

        // If the transition fails to commit, the claim is released so the
        // processor's redelivery gets another chance to apply the event.
        let applied = match self.apply_event_kind(&mut bet, event).await {
            Ok(applied) => applied,
            Err(err) => {
                self.release_claim(&event.event_id).await;
                return Err(err);
            }
        };

        if applied {
            info!(
                event_id = %event.event_id,
                bet_id = %bet.bet_id,
                kind = event.kind.kind_str(),
                status = %bet.status,
                "gateway event applied"
            );
            Ok(ReconcileOutcome::Applied {
                bet_id: bet.bet_id,
                status: bet.status,
            })
        } else {
            debug!(
                event_id = %event.event_id,
                bet_id = %bet.bet_id,
                kind = event.kind.kind_str(),
                status = %bet.status,
                "gateway event is a no-op in current state"
            );
            Ok(ReconcileOutcome::Ignored { bet_id: bet.bet_id })
        }
    }

    async fn apply_event_kind(
        &self,
        bet: &mut Bet,
        event: &GatewayEvent,
    ) -> Result<bool, EscrowError> {
        let applied = match &event.kind {
            GatewayEventKind::CheckoutCompleted { hold_ref } => match bet.status {
                BetStatus::Pending => {
                    if bet.hold_ref.is_none() {
                        bet.hold_ref = Some(hold_ref.clone());
                    }
                    bet.status = BetStatus::Active;
                    self.commit(&bet, BetStatus::Pending).await?;
                    true
                }
                _ => false,
            },
            GatewayEventKind::HoldCaptured { charge_ref, .. } => match bet.status {
                // Partial capture state: a later explicit resolve_failure
                // resumes at the transfer step.
                BetStatus::Active if bet.capture_ref.is_none() => {
                    bet.capture_ref = Some(charge_ref.clone());
                    bet.escrow_captured_at = Some(event.occurred_at);
                    bet.transfer_pending = true;
                    self.commit(&bet, BetStatus::Active).await?;
                    true
                }
                _ => false,
            },
            GatewayEventKind::CaptureFailed { .. } => match bet.status {
                // A failure notification after a recorded capture is
                // contradictory; the recorded capture wins.
                BetStatus::Pending | BetStatus::Active if bet.capture_ref.is_none() => {
                    let prior = bet.status;
                    bet.status = BetStatus::PaymentFailed;
                    self.commit(&bet, prior).await?;
                    true
                }
                BetStatus::Active => {
                    warn!(
                        bet_id = %bet.bet_id,
                        event_id = %event.event_id,
                        "capture failure event after recorded capture"
                    );
                    false
                }
                _ => false,
            },
            GatewayEventKind::HoldCanceled { .. } => match bet.status {
                BetStatus::Pending => {
                    bet.status = BetStatus::Cancelled;
                    self.commit(&bet, BetStatus::Pending).await?;
                    true
                }
                BetStatus::Active => {
                    warn!(
                        bet_id = %bet.bet_id,
                        event_id = %event.event_id,
                        "hold canceled while bet active"
                    );
                    false
                }
                _ => false,
            },
            GatewayEventKind::RefundIssued {
                charge_ref,
                refund_ref,
                amount,
            } => match bet.status {
                BetStatus::Active => {
                    if bet.capture_ref.is_none() {
                        bet.capture_ref = Some(charge_ref.clone());
                        bet.escrow_captured_at = Some(event.occurred_at);
                    }
                    bet.refund_ref = Some(refund_ref.clone());
                    bet.refund_amount = Some(*amount);
                    bet.transfer_pending = false;
                    bet.status = BetStatus::Won;
                    bet.resolved_at = Some(event.occurred_at);
                    self.commit(&bet, BetStatus::Active).await?;
                    true
                }
                _ => false,
            },
            GatewayEventKind::TransferCreated {
                transfer_ref,
                amount,
            } => match bet.status {
                BetStatus::Active if bet.capture_ref.is_some() => {
                    let fee = bet.stake_amount.checked_sub(*amount)?;
                    bet.platform_fee_amount = Some(fee);
                    bet.donation_amount = Some(*amount);
                    bet.fee_rate_bps_applied
                        .get_or_insert(self.fee_policy.fee_bps());
                    bet.transfer_ref = Some(transfer_ref.clone());
                    bet.transfer_pending = false;
                    bet.status = BetStatus::Lost;
                    bet.resolved_at = Some(event.occurred_at);
                    self.commit(&bet, BetStatus::Active).await?;
                    true
                }
                _ => false,
            },
        };
        Ok(applied)
    }

    pub async fn get_bet(&self, bet_id: BetId) -> Result<Bet, EscrowError> {
        self.load(bet_id).await
    }

    async fn load(&self, bet_id: BetId) -> Result<Bet, EscrowError> {
        self.bets
            .get_bet(bet_id)
            .await?
            .ok_or(EscrowError::BetNotFound(bet_id))
    }

    /// The single commit path: transition legality, record invariants, then
    /// the status-conditioned store write.
    async fn commit(&self, bet: &Bet, expected: BetStatus) -> Result<(), EscrowError> {
        if bet.status != expected && !expected.can_transition_to(bet.status) {
            return Err(DomainError::IllegalTransition {
                from: expected,
                to: bet.status,
            }
            .into());
        }
        bet.check_invariants()?;
        self.bets.update_bet(bet, expected).await?;
        Ok(())
    }

    async fn capture_escrow(
        &self,
        bet: &mut Bet,
        hold_ref: &HoldRef,
    ) -> Result<ChargeRef, EscrowError> {
        match self.gateway.capture_hold(hold_ref).await {
            Ok(charge) => Ok(charge),
            Err(GatewayError::AmbiguousOutcome(reason)) => {
                warn!(bet_id = %bet.bet_id, %reason, "capture outcome unknown, re-querying hold");
                match self.gateway.get_payment_state(hold_ref).await? {
                    PaymentState::Captured { charge_ref } => Ok(charge_ref),
                    PaymentState::RequiresCapture => Err(GatewayError::Transient(format!(
                        "capture did not take effect: {reason}"
                    ))
                    .into()),
                    state @ (PaymentState::Canceled | PaymentState::Failed) => {
                        self.mark_payment_failed(bet).await?;
                        Err(EscrowError::UnexpectedPaymentState {
                            bet_id: bet.bet_id,
                            state,
                        })
                    }
                }
            }
            Err(GatewayError::Rejected { code, message }) => {
                // A rejection can mean the capture already landed (a retry
                // after a lost response). Check the hold before giving up.
                warn!(bet_id = %bet.bet_id, %code, %message, "capture rejected, re-querying hold");
                match self.gateway.get_payment_state(hold_ref).await? {
                    PaymentState::Captured { charge_ref } => Ok(charge_ref),
                    PaymentState::RequiresCapture
                    | PaymentState::Canceled
                    | PaymentState::Failed => {
                        self.mark_payment_failed(bet).await?;
                        Err(EscrowError::EscrowCaptureFailed(bet.bet_id))
                    }
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn mark_payment_failed(&self, bet: &mut Bet) -> Result<(), EscrowError> {
        let prior = bet.status;
        bet.status = BetStatus::PaymentFailed;
        self.commit(bet, prior).await
    }

    fn recorded_success(bet: &Bet) -> Result<SuccessSettlement, EscrowError> {
        let amount = bet
            .refund_amount
            .ok_or(DomainError::SettlementAmountsMissing)?;
        if let Some(refund_ref) = bet.refund_ref.clone() {
            return Ok(SuccessSettlement::Refunded { refund_ref, amount });
        }
        let release_ref = bet
            .release_ref
            .clone()
            .ok_or(DomainError::SettlementAmountsMissing)?;
        Ok(SuccessSettlement::Released {
            release_ref,
            amount,
        })
    }

    fn recorded_failure(bet: &Bet) -> Result<FailureSettlement, EscrowError> {
        let fee = bet
            .platform_fee_amount
            .ok_or(DomainError::SettlementAmountsMissing)?;
        let donation = bet
            .donation_amount
            .ok_or(DomainError::SettlementAmountsMissing)?;
        let transfer_ref = bet
            .transfer_ref
            .clone()
            .ok_or(DomainError::SettlementAmountsMissing)?;
        Ok(FailureSettlement {
            transfer_ref,
            fee,
            donation,
        })
    }

    async fn locate_bet_for_event(
        &self,
        event: &GatewayEvent,
    ) -> Result<Option<Bet>, EscrowError> {
        if let Some(bet_id) = event.bet_id {
            return Ok(self.bets.get_bet(bet_id).await?);
        }
        let found = match &event.kind {
            GatewayEventKind::CheckoutCompleted { hold_ref }
            | GatewayEventKind::HoldCaptured { hold_ref, .. }
            | GatewayEventKind::CaptureFailed { hold_ref }
            | GatewayEventKind::HoldCanceled { hold_ref } => {
                self.bets.find_by_hold_ref(hold_ref).await?
            }
            GatewayEventKind::RefundIssued { charge_ref, .. } => {
                self.bets.find_by_charge_ref(charge_ref).await?
            }
            // Transfers are only locatable through bet id metadata.
            GatewayEventKind::TransferCreated { .. } => None,
        };
        Ok(found)
    }

    /// Claim the gateway event id before applying it. The unique insert is the
    /// dedup point; the claim must succeed for the apply to proceed.
    async fn claim_event(
        &self,
        event: &GatewayEvent,
        bet_id: BetId,
    ) -> Result<EventInsertOutcome, EscrowError> {
        let payload_json = serde_json::to_value(event)
            .map_err(|e| BetStoreError::Serialization(e.to_string()))?;
        let record = SettlementEventRecord {
            event_id: event.event_id.clone(),
            bet_id,
            event_kind: event.kind.kind_str().to_string(),
            event_source: SOURCE_WEBHOOK.to_string(),
            related_ref: Some(event.kind.related_ref().to_string()),
            amount: event_amount(&event.kind),
            payload_json,
            occurred_at: event.occurred_at,
            recorded_at: Utc::now(),
            trace_id: TraceId::new(),
        };
        Ok(self.events.insert_event(&record).await?)
    }

    async fn release_claim(&self, event_id: &str) {
        if let Err(err) = self.events.delete_event(event_id).await {
            warn!(%event_id, %err, "failed to release gateway event claim");
        }
    }

    /// Audit record for an engine-initiated movement. Failure to record never
    /// unwinds a settlement that already happened at the processor.
    async fn record_local_event(
        &self,
        bet: &Bet,
        event_id: String,
        kind: &str,
        source: &str,
        related_ref: Option<String>,
        amount: Option<Amount>,
    ) {
        let record = SettlementEventRecord {
            event_id,
            bet_id: bet.bet_id,
            event_kind: kind.to_string(),
            event_source: source.to_string(),
            related_ref,
            amount,
            payload_json: json!({ "status": bet.status }),
            occurred_at: Utc::now(),
            recorded_at: Utc::now(),
            trace_id: TraceId::new(),
        };
        if let Err(err) = self.events.insert_event(&record).await {
            warn!(bet_id = %bet.bet_id, %err, "failed to record settlement event");
        }
    }
}

fn event_amount(kind: &GatewayEventKind) -> Option<Amount> {
    match kind {
        GatewayEventKind::RefundIssued { amount, .. }
        | GatewayEventKind::TransferCreated { amount, .. } => Some(*amount),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{harness, seed_active_bet, seed_pending_bet, MockGateway};
    use bet_store::{InMemoryBetRepository, InMemorySettlementEventRepository};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn open_request(amount: Amount) -> OpenEscrowRequest {
        OpenEscrowRequest {
            bet_id: BetId::new(),
            amount,
            payee_id: Some(PayeeId::new()),
            payee_destination: Some("acct_anti_charity".to_string()),
        }
    }

    #[tokio::test]
    async fn open_escrow_rejects_out_of_range_stakes() {
        let h = harness();
        for amount in [Amount(10_00), Amount(6000_00)] {
            let err = h
                .service
                .open_escrow(open_request(amount))
                .await
                .expect_err("out of range");
            assert!(matches!(err, EscrowError::InvalidAmount { .. }));
        }
        assert_eq!(h.gateway.call_count("open_hold"), 0);
    }

    #[tokio::test]
    async fn open_escrow_opens_one_hold_even_when_retried() {
        let h = harness();
        let request = open_request(Amount::from_major(100));
        let bet_id = request.bet_id;

        let first = h.service.open_escrow(request.clone()).await.expect("open");
        let second = h.service.open_escrow(request).await.expect("retry");

        assert_eq!(first, second);
        assert_eq!(h.gateway.call_count("open_hold"), 1);

        let bet = h.service.get_bet(bet_id).await.expect("bet");
        assert_eq!(bet.status, BetStatus::Pending);
        assert_eq!(bet.hold_ref.as_deref(), Some(first.hold_ref.as_str()));
    }

    #[tokio::test]
    async fn open_escrow_retry_with_a_different_amount_is_rejected() {
        let h = harness();
        let request = open_request(Amount::from_major(100));
        let bet_id = request.bet_id;
        h.service.open_escrow(request.clone()).await.expect("open");

        let mut changed = request;
        changed.amount = Amount::from_major(200);
        let err = h.service.open_escrow(changed).await.expect_err("mismatch");
        assert!(matches!(err, EscrowError::StakeMismatch { .. }));
        assert_eq!(h.gateway.call_count("open_hold"), 1);

        let bet = h.service.get_bet(bet_id).await.expect("bet");
        assert_eq!(bet.stake_amount, Amount::from_major(100));
    }

    #[tokio::test]
    async fn service_is_usable_behind_trait_objects() {
        let bets: Arc<dyn BetRepository> = Arc::new(InMemoryBetRepository::new());
        let events: Arc<dyn SettlementEventRepository> =
            Arc::new(InMemorySettlementEventRepository::new());
        let gateway: Arc<dyn PaymentGateway> = Arc::new(MockGateway::new());
        let service: EscrowService<
            dyn BetRepository,
            dyn SettlementEventRepository,
            dyn PaymentGateway,
        > = EscrowService::new(bets, events, gateway, FeePolicy::twenty_percent());

        let err = service
            .resolve_success(BetId::new())
            .await
            .expect_err("unknown bet");
        assert!(matches!(err, EscrowError::BetNotFound(_)));
    }

    #[tokio::test]
    async fn activate_is_idempotent() {
        let h = harness();
        let bet_id = seed_pending_bet(&h, Amount::from_major(100)).await;

        assert_eq!(
            h.service.activate(bet_id).await.expect("activate"),
            BetStatus::Active
        );
        assert_eq!(
            h.service.activate(bet_id).await.expect("repeat"),
            BetStatus::Active
        );
    }

    #[tokio::test]
    async fn resolve_success_on_pending_bet_makes_no_gateway_call() {
        let h = harness();
        let bet_id = seed_pending_bet(&h, Amount::from_major(100)).await;

        let err = h
            .service
            .resolve_success(bet_id)
            .await
            .expect_err("pending bet");
        assert!(matches!(
            err,
            EscrowError::NotActive {
                status: BetStatus::Pending,
                ..
            }
        ));
        assert!(h.gateway.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn resolve_success_releases_an_uncaptured_hold() {
        let h = harness();
        let bet_id = seed_active_bet(&h, Amount::from_major(100)).await;

        let settlement = h.service.resolve_success(bet_id).await.expect("resolve");
        assert!(matches!(settlement, SuccessSettlement::Released { .. }));
        assert_eq!(h.gateway.call_count("cancel_hold"), 1);
        assert_eq!(h.gateway.call_count("refund_charge"), 0);

        let bet = h.service.get_bet(bet_id).await.expect("bet");
        assert_eq!(bet.status, BetStatus::Won);
        assert!(bet.release_ref.is_some());
        assert!(bet.refund_ref.is_none());
        assert_eq!(bet.refund_amount, Some(Amount::from_major(100)));
        bet.check_invariants().expect("invariants");
    }

    #[tokio::test]
    async fn resolve_success_refunds_when_capture_won_the_race() {
        let h = harness();
        let bet_id = seed_active_bet(&h, Amount::from_major(100)).await;
        h.gateway.set_payment_state(PaymentState::Captured {
            charge_ref: ChargeRef("ch_race".to_string()),
        });

        let settlement = h.service.resolve_success(bet_id).await.expect("resolve");
        assert!(matches!(settlement, SuccessSettlement::Refunded { .. }));
        assert_eq!(h.gateway.call_count("refund_charge"), 1);
        assert_eq!(h.gateway.call_count("cancel_hold"), 0);

        let bet = h.service.get_bet(bet_id).await.expect("bet");
        assert_eq!(bet.capture_ref.as_deref(), Some("ch_race"));
        assert!(bet.escrow_captured_at.is_some());
        bet.check_invariants().expect("invariants");
    }

    #[tokio::test]
    async fn repeated_resolve_success_returns_the_recorded_reference() {
        let h = harness();
        let bet_id = seed_active_bet(&h, Amount::from_major(100)).await;

        let first = h.service.resolve_success(bet_id).await.expect("resolve");
        let calls_after_first = h.gateway.calls.lock().unwrap().len();

        let second = h.service.resolve_success(bet_id).await.expect("repeat");
        assert_eq!(first, second);
        assert_eq!(h.gateway.calls.lock().unwrap().len(), calls_after_first);
    }

    #[tokio::test]
    async fn resolve_failure_splits_the_stake_and_transfers_the_donation() {
        let h = harness();
        let bet_id = seed_active_bet(&h, Amount::from_major(100)).await;

        let settlement = h.service.resolve_failure(bet_id).await.expect("resolve");
        assert_eq!(settlement.fee, Amount::from_major(20));
        assert_eq!(settlement.donation, Amount::from_major(80));
        assert_eq!(h.gateway.call_count("capture_hold"), 1);
        assert_eq!(h.gateway.call_count("transfer_from_charge"), 1);

        let bet = h.service.get_bet(bet_id).await.expect("bet");
        assert_eq!(bet.status, BetStatus::Lost);
        assert_eq!(bet.fee_rate_bps_applied, Some(2_000));
        assert!(bet.transfer_ref.is_some());
        assert!(bet.escrow_captured_at.is_some());
        assert!(!bet.transfer_pending);
        bet.check_invariants().expect("invariants");
    }

    #[tokio::test]
    async fn resolve_failure_requires_a_payee_destination() {
        let h = harness();
        let bet_id = BetId::new();
        let mut bet = Bet::new(bet_id, Amount::from_major(100));
        bet.status = BetStatus::Active;
        bet.hold_ref = Some("hold_nopayee".to_string());
        h.bets.insert_bet(&bet).await.expect("insert");

        let err = h
            .service
            .resolve_failure(bet_id)
            .await
            .expect_err("no payee");
        assert!(matches!(err, EscrowError::MissingPayeeDestination(_)));
        assert!(h.gateway.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_transfer_leaves_resumable_state_and_retry_skips_capture() {
        let h = harness();
        let bet_id = seed_active_bet(&h, Amount::from_major(100)).await;
        h.gateway
            .script_transfer(Err(GatewayError::Transient("503".to_string())));

        let err = h
            .service
            .resolve_failure(bet_id)
            .await
            .expect_err("transfer fails");
        assert!(err.is_retryable());

        let bet = h.service.get_bet(bet_id).await.expect("bet");
        assert_eq!(bet.status, BetStatus::Active);
        assert!(bet.capture_ref.is_some());
        assert!(bet.transfer_pending);

        let settlement = h.service.resolve_failure(bet_id).await.expect("retry");
        assert_eq!(settlement.donation, Amount::from_major(80));
        assert_eq!(h.gateway.call_count("capture_hold"), 1);
        assert_eq!(h.gateway.call_count("transfer_from_charge"), 2);

        let bet = h.service.get_bet(bet_id).await.expect("bet");
        assert_eq!(bet.status, BetStatus::Lost);
        bet.check_invariants().expect("invariants");
    }

    #[tokio::test]
    async fn ambiguous_capture_requeries_the_hold_and_resumes() {
        let h = harness();
        let bet_id = seed_active_bet(&h, Amount::from_major(100)).await;
        // The capture call times out, but it did land at the processor.
        h.gateway
            .script_capture(Err(GatewayError::AmbiguousOutcome("timeout".to_string())));
        h.gateway.set_payment_state(PaymentState::Captured {
            charge_ref: ChargeRef("ch_amb".to_string()),
        });

        let settlement = h.service.resolve_failure(bet_id).await.expect("resolve");
        assert_eq!(settlement.donation, Amount::from_major(80));
        assert_eq!(h.gateway.call_count("capture_hold"), 1);
        assert_eq!(h.gateway.call_count("get_payment_state"), 1);

        let bet = h.service.get_bet(bet_id).await.expect("bet");
        assert_eq!(bet.capture_ref.as_deref(), Some("ch_amb"));
        assert_eq!(bet.status, BetStatus::Lost);
    }

    #[tokio::test]
    async fn rejected_capture_resumes_when_the_hold_was_already_captured() {
        let h = harness();
        let bet_id = seed_active_bet(&h, Amount::from_major(100)).await;
        // A prior capture landed but its response was lost; the retry gets a
        // rejection even though the money moved.
        h.gateway.script_capture(Err(GatewayError::Rejected {
            code: "already_captured".to_string(),
            message: "hold has already been captured".to_string(),
        }));
        h.gateway.set_payment_state(PaymentState::Captured {
            charge_ref: ChargeRef("ch_prior".to_string()),
        });

        let settlement = h.service.resolve_failure(bet_id).await.expect("resolve");
        assert_eq!(settlement.donation, Amount::from_major(80));
        assert_eq!(h.gateway.call_count("get_payment_state"), 1);
        assert_eq!(h.gateway.call_count("transfer_from_charge"), 1);

        let bet = h.service.get_bet(bet_id).await.expect("bet");
        assert_eq!(bet.capture_ref.as_deref(), Some("ch_prior"));
        assert_eq!(bet.status, BetStatus::Lost);
        bet.check_invariants().expect("invariants");
    }

    #[tokio::test]
    async fn rejected_capture_marks_the_bet_payment_failed() {
        let h = harness();
        let bet_id = seed_active_bet(&h, Amount::from_major(100)).await;
        h.gateway.script_capture(Err(GatewayError::Rejected {
            code: "hold_expired".to_string(),
            message: "authorization expired".to_string(),
        }));

        let err = h
            .service
            .resolve_failure(bet_id)
            .await
            .expect_err("capture rejected");
        assert!(matches!(err, EscrowError::EscrowCaptureFailed(_)));

        let bet = h.service.get_bet(bet_id).await.expect("bet");
        assert_eq!(bet.status, BetStatus::PaymentFailed);
        assert_eq!(h.gateway.call_count("transfer_from_charge"), 0);
    }

    #[tokio::test]
    async fn concurrent_resolve_failure_captures_and_transfers_once() {
        let h = harness();
        let bet_id = seed_active_bet(&h, Amount::from_major(100)).await;

        let a = Arc::clone(&h.service);
        let b = Arc::clone(&h.service);
        let (first, second) = tokio::join!(
            tokio::spawn(async move { a.resolve_failure(bet_id).await }),
            tokio::spawn(async move { b.resolve_failure(bet_id).await }),
        );
        let first = first.expect("task").expect("resolve");
        let second = second.expect("task").expect("resolve");

        assert_eq!(first, second);
        assert_eq!(h.gateway.call_count("capture_hold"), 1);
        assert_eq!(h.gateway.call_count("transfer_from_charge"), 1);

        let bet = h.service.get_bet(bet_id).await.expect("bet");
        assert_eq!(bet.status, BetStatus::Lost);
        bet.check_invariants().expect("invariants");
    }

    #[tokio::test]
    async fn conflicting_resolutions_report_already_resolved() {
        let h = harness();
        let bet_id = seed_active_bet(&h, Amount::from_major(100)).await;
        h.service.resolve_success(bet_id).await.expect("resolve");

        let err = h
            .service
            .resolve_failure(bet_id)
            .await
            .expect_err("already won");
        assert!(matches!(
            err,
            EscrowError::AlreadyResolved {
                status: BetStatus::Won,
                ..
            }
        ));
    }

    /// Fails the next conditional commit, then behaves normally.
    struct FlakyBetRepository {
        inner: InMemoryBetRepository,
        fail_next_update: AtomicBool,
    }

    #[async_trait::async_trait]
    impl BetRepository for FlakyBetRepository {
        async fn insert_bet(&self, bet: &Bet) -> Result<(), BetStoreError> {
            self.inner.insert_bet(bet).await
        }

        async fn get_bet(&self, bet_id: BetId) -> Result<Option<Bet>, BetStoreError> {
            self.inner.get_bet(bet_id).await
        }

        async fn find_by_hold_ref(&self, hold_ref: &str) -> Result<Option<Bet>, BetStoreError> {
            self.inner.find_by_hold_ref(hold_ref).await
        }

        async fn find_by_charge_ref(&self, charge_ref: &str) -> Result<Option<Bet>, BetStoreError> {
            self.inner.find_by_charge_ref(charge_ref).await
        }

        async fn update_bet(
            &self,
            bet: &Bet,
            expected_status: BetStatus,
        ) -> Result<(), BetStoreError> {
            if self.fail_next_update.swap(false, Ordering::SeqCst) {
                return Err(BetStoreError::Database("connection reset".to_string()));
            }
            self.inner.update_bet(bet, expected_status).await
        }
    }

    #[tokio::test]
    async fn failed_commit_releases_the_event_claim_for_redelivery() {
        let bets = Arc::new(FlakyBetRepository {
            inner: InMemoryBetRepository::new(),
            fail_next_update: AtomicBool::new(true),
        });
        let events = Arc::new(InMemorySettlementEventRepository::new());
        let service = EscrowService::new(
            Arc::clone(&bets),
            Arc::clone(&events),
            Arc::new(MockGateway::new()),
            FeePolicy::twenty_percent(),
        );

        let bet_id = BetId::new();
        let mut bet = Bet::new(bet_id, Amount::from_major(100));
        bet.status = BetStatus::Pending;
        bet.hold_ref = Some(format!("hold_{bet_id}"));
        bets.insert_bet(&bet).await.expect("seed");

        let event = GatewayEvent {
            event_id: "evt_flaky".to_string(),
            bet_id: Some(bet_id),
            occurred_at: Utc::now(),
            kind: GatewayEventKind::CheckoutCompleted {
                hold_ref: format!("hold_{bet_id}"),
            },
        };

        let err = service
            .apply_gateway_event(&event)
            .await
            .expect_err("commit fails");
        assert!(matches!(err, EscrowError::Store(BetStoreError::Database(_))));
        // The claim must not survive the failed commit.
        assert!(events.events_snapshot().is_empty());

        let outcome = service
            .apply_gateway_event(&event)
            .await
            .expect("redelivery");
        assert_eq!(
            outcome,
            ReconcileOutcome::Applied {
                bet_id,
                status: BetStatus::Active
            }
        );
        assert_eq!(events.events_snapshot().len(), 1);
    }
}
