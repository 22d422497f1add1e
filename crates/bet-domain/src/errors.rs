use thiserror::Error;

use crate::bet::BetStatus;
use crate::money::Amount;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("illegal status transition {from} -> {to}")]
    IllegalTransition { from: BetStatus, to: BetStatus },
    #[error("resolved_at does not match terminal status {status}")]
    ResolvedAtMismatch { status: BetStatus },
    #[error("refund side and donation side both populated")]
    SettlementSidesBothPopulated,
    #[error("lost bet is missing fee or donation amount")]
    SettlementAmountsMissing,
    #[error("fee {fee} + donation {donation} != stake {stake}")]
    FeeSplitMismatch {
        fee: Amount,
        donation: Amount,
        stake: Amount,
    },
    #[error("escrow_captured_at set without a hold reference")]
    CapturedWithoutHold,
    #[error("escrow_captured_at set in status {status}")]
    CapturedInStatus { status: BetStatus },
}
