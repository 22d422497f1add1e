use bet_domain::{Amount, MoneyError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const MAX_FEE_BPS: u16 = 10_000;

/// Default platform cut on a lost bet: 20%.
pub const DEFAULT_FEE_BPS: u16 = 2_000;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FeePolicyError {
    #[error("fee rate {0} bps exceeds 10000")]
    RateOutOfRange(u16),
}

/// Platform fee rate in basis points of the stake. The rate in force at
/// settlement time is persisted on the bet, so a policy change never rewrites
/// history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeePolicy {
    fee_bps: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeSplit {
    pub fee: Amount,
    pub donation: Amount,
}

impl FeePolicy {
    pub fn new(fee_bps: u16) -> Result<Self, FeePolicyError> {
        if fee_bps > MAX_FEE_BPS {
            return Err(FeePolicyError::RateOutOfRange(fee_bps));
        }
        Ok(Self { fee_bps })
    }

    #[must_use]
    pub fn twenty_percent() -> Self {
        Self {
            fee_bps: DEFAULT_FEE_BPS,
        }
    }

    #[must_use]
    pub fn fee_bps(self) -> u16 {
        self.fee_bps
    }

    /// Fee rounds down; the donation absorbs the remainder, so
    /// `fee + donation == stake` holds for every stake.
    pub fn split(self, stake: Amount) -> Result<FeeSplit, MoneyError> {
        // The quotient is bounded by the stake, so the narrowing is exact.
        let fee = Amount((u128::from(stake.as_minor()) * u128::from(self.fee_bps) / 10_000) as u64);
        let donation = stake.checked_sub(fee)?;
        Ok(FeeSplit { fee, donation })
    }
}

impl Default for FeePolicy {
    fn default() -> Self {
        Self::twenty_percent()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn twenty_percent_of_one_hundred_splits_twenty_eighty() {
        let split = FeePolicy::twenty_percent()
            .split(Amount::from_major(100))
            .expect("split");
        assert_eq!(split.fee, Amount::from_major(20));
        assert_eq!(split.donation, Amount::from_major(80));
    }

    #[test]
    fn fee_floors_and_donation_absorbs_the_remainder() {
        let split = FeePolicy::twenty_percent()
            .split(Amount(99_99))
            .expect("split");
        assert_eq!(split.fee, Amount(19_99));
        assert_eq!(split.donation, Amount(80_00));
        assert_eq!(
            split.fee.checked_add(split.donation).expect("sum"),
            Amount(99_99)
        );
    }

    #[test]
    fn full_rate_donates_nothing() {
        let split = FeePolicy::new(10_000)
            .expect("full rate is valid")
            .split(Amount::from_major(50))
            .expect("split");
        assert_eq!(split.fee, Amount::from_major(50));
        assert_eq!(split.donation, Amount::ZERO);
    }

    #[test]
    fn rates_above_ten_thousand_bps_are_rejected() {
        assert_eq!(
            FeePolicy::new(10_001),
            Err(FeePolicyError::RateOutOfRange(10_001))
        );
    }
}
