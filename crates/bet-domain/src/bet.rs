use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::DomainError;
use crate::ids::{BetId, PayeeId};
use crate::money::Amount;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetStatus {
    Draft,
    Pending,
    Active,
    Won,
    Lost,
    PaymentFailed,
    Cancelled,
}

impl BetStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Won | Self::Lost)
    }

    /// Lifecycle legality table. Both the resolution engine and the webhook
    /// reconciler go through this, so there is one source of truth for which
    /// transitions exist.
    #[must_use]
    pub fn can_transition_to(self, next: BetStatus) -> bool {
        use BetStatus::*;
        matches!(
            (self, next),
            (Draft, Pending)
                | (Pending, Pending)
                | (Pending, Active)
                | (Pending, PaymentFailed)
                | (Pending, Cancelled)
                | (Active, Won)
                | (Active, Lost)
                | (Active, PaymentFailed)
        )
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Won => "won",
            Self::Lost => "lost",
            Self::PaymentFailed => "payment_failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for BetStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable record of one bet's escrow lifecycle. External references are
/// write-once: each is set by exactly one transition and never overwritten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bet {
    pub bet_id: BetId,
    pub status: BetStatus,
    pub stake_amount: Amount,
    pub platform_fee_amount: Option<Amount>,
    pub donation_amount: Option<Amount>,
    pub refund_amount: Option<Amount>,
    /// Fee rate in basis points read at the moment of settlement. Persisted so
    /// later policy changes never alter an already-settled bet.
    pub fee_rate_bps_applied: Option<u16>,
    pub payee_id: Option<PayeeId>,
    pub payee_destination: Option<String>,
    pub hold_ref: Option<String>,
    pub capture_ref: Option<String>,
    pub transfer_ref: Option<String>,
    pub refund_ref: Option<String>,
    /// Set when the hold was cancelled without ever being captured. Kept
    /// separate from `refund_ref`: a release is not a refund.
    pub release_ref: Option<String>,
    /// Capture committed but the transfer has not happened yet. A retry of the
    /// failure path resumes at the fee/transfer step without re-capturing.
    pub transfer_pending: bool,
    pub created_at: DateTime<Utc>,
    pub escrow_captured_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Bet {
    #[must_use]
    pub fn new(bet_id: BetId, stake_amount: Amount) -> Self {
        Self {
            bet_id,
            status: BetStatus::Draft,
            stake_amount,
            platform_fee_amount: None,
            donation_amount: None,
            refund_amount: None,
            fee_rate_bps_applied: None,
            payee_id: None,
            payee_destination: None,
            hold_ref: None,
            capture_ref: None,
            transfer_ref: None,
            refund_ref: None,
            release_ref: None,
            transfer_pending: false,
            created_at: Utc::now(),
            escrow_captured_at: None,
            resolved_at: None,
        }
    }

    #[must_use]
    pub fn with_payee(mut self, payee_id: PayeeId, destination: impl Into<String>) -> Self {
        self.payee_id = Some(payee_id);
        self.payee_destination = Some(destination.into());
        self
    }

    /// Checks the record-level invariants that must hold after every guarded
    /// transition commit.
    pub fn check_invariants(&self) -> Result<(), DomainError> {
        if self.resolved_at.is_some() != self.status.is_terminal() {
            return Err(DomainError::ResolvedAtMismatch {
                status: self.status,
            });
        }
        let refunded = self.refund_amount.is_some() || self.release_ref.is_some();
        let donated = self.platform_fee_amount.is_some() || self.donation_amount.is_some();
        if refunded && donated {
            return Err(DomainError::SettlementSidesBothPopulated);
        }
        if self.status == BetStatus::Lost {
            let fee = self
                .platform_fee_amount
                .ok_or(DomainError::SettlementAmountsMissing)?;
            let donation = self
                .donation_amount
                .ok_or(DomainError::SettlementAmountsMissing)?;
            if fee.checked_add(donation) != Ok(self.stake_amount) {
                return Err(DomainError::FeeSplitMismatch {
                    fee,
                    donation,
                    stake: self.stake_amount,
                });
            }
        }
        if self.escrow_captured_at.is_some() {
            if self.hold_ref.is_none() {
                return Err(DomainError::CapturedWithoutHold);
            }
            if !matches!(
                self.status,
                BetStatus::Active | BetStatus::Won | BetStatus::Lost
            ) {
                return Err(DomainError::CapturedInStatus {
                    status: self.status,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_as_snake_case() {
        assert_eq!(
            serde_json::to_value(BetStatus::PaymentFailed).expect("serialize"),
            serde_json::json!("payment_failed")
        );
        assert_eq!(
            serde_json::to_value(BetStatus::Won).expect("serialize"),
            serde_json::json!("won")
        );
    }

    #[test]
    fn terminal_states_have_no_outgoing_transitions() {
        for next in [
            BetStatus::Draft,
            BetStatus::Pending,
            BetStatus::Active,
            BetStatus::Won,
            BetStatus::Lost,
            BetStatus::PaymentFailed,
            BetStatus::Cancelled,
        ] {
            assert!(!BetStatus::Won.can_transition_to(next));
            assert!(!BetStatus::Lost.can_transition_to(next));
        }
    }

    #[test]
    fn active_only_exits_to_won_lost_or_payment_failed() {
        assert!(BetStatus::Active.can_transition_to(BetStatus::Won));
        assert!(BetStatus::Active.can_transition_to(BetStatus::Lost));
        assert!(BetStatus::Active.can_transition_to(BetStatus::PaymentFailed));
        assert!(!BetStatus::Active.can_transition_to(BetStatus::Cancelled));
        assert!(!BetStatus::Active.can_transition_to(BetStatus::Pending));
    }

    #[test]
    fn invariants_reject_terminal_bet_without_resolved_at() {
        let mut bet = Bet::new(BetId::new(), Amount::from_major(100));
        bet.status = BetStatus::Won;
        assert!(matches!(
            bet.check_invariants(),
            Err(DomainError::ResolvedAtMismatch { .. })
        ));
    }

    #[test]
    fn invariants_require_exact_fee_split_on_lost_bet() {
        let mut bet = Bet::new(BetId::new(), Amount::from_major(100));
        bet.status = BetStatus::Lost;
        bet.resolved_at = Some(Utc::now());
        bet.hold_ref = Some("hold_1".to_string());
        bet.escrow_captured_at = Some(Utc::now());
        bet.platform_fee_amount = Some(Amount::from_major(20));
        bet.donation_amount = Some(Amount::from_major(79));
        assert!(matches!(
            bet.check_invariants(),
            Err(DomainError::FeeSplitMismatch { .. })
        ));

        bet.donation_amount = Some(Amount::from_major(80));
        bet.check_invariants().expect("exact split is valid");
    }

    #[test]
    fn invariants_restrict_capture_timestamp_to_funded_statuses() {
        let mut bet = Bet::new(BetId::new(), Amount::from_major(100));
        bet.status = BetStatus::PaymentFailed;
        bet.hold_ref = Some("hold_1".to_string());
        bet.capture_ref = Some("ch_1".to_string());
        bet.escrow_captured_at = Some(Utc::now());
        assert!(matches!(
            bet.check_invariants(),
            Err(DomainError::CapturedInStatus {
                status: BetStatus::PaymentFailed
            })
        ));

        bet.status = BetStatus::Active;
        bet.check_invariants().expect("captured while active is valid");
    }

    #[test]
    fn invariants_reject_refund_and_donation_both_set() {
        let mut bet = Bet::new(BetId::new(), Amount::from_major(50));
        bet.refund_amount = Some(Amount::from_major(50));
        bet.donation_amount = Some(Amount::from_major(40));
        assert!(matches!(
            bet.check_invariants(),
            Err(DomainError::SettlementSidesBothPopulated)
        ));
    }
}
