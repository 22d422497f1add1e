use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Monetary amount in minor currency units (cents). The processor only ever
/// sees integers, so all arithmetic is exact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Amount(pub u64);

impl Amount {
    pub const ZERO: Self = Self(0);

    /// Converts whole currency units to minor units.
    ///
    /// # Panics
    ///
    /// Panics when `units * 100` overflows `u64`.
    #[must_use]
    pub fn from_major(units: u64) -> Self {
        Self(units.checked_mul(100).expect("major unit amount overflows u64"))
    }

    #[must_use]
    pub fn as_minor(self) -> u64 {
        self.0
    }

    pub fn checked_add(self, rhs: Self) -> Result<Self, MoneyError> {
        self.0
            .checked_add(rhs.0)
            .map(Self)
            .ok_or(MoneyError::Overflow)
    }

    pub fn checked_sub(self, rhs: Self) -> Result<Self, MoneyError> {
        self.0
            .checked_sub(rhs.0)
            .map(Self)
            .ok_or(MoneyError::Underflow)
    }
}

impl std::fmt::Display for Amount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MoneyError {
    #[error("amount overflow")]
    Overflow,
    #[error("amount underflow")]
    Underflow,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checked_sub_underflows_below_zero() {
        assert_eq!(Amount(5).checked_sub(Amount(6)), Err(MoneyError::Underflow));
        assert_eq!(Amount(6).checked_sub(Amount(6)), Ok(Amount::ZERO));
    }

    #[test]
    #[should_panic(expected = "major unit amount overflows u64")]
    fn from_major_panics_on_overflow() {
        let _ = Amount::from_major(u64::MAX / 10);
    }

    #[test]
    fn display_renders_major_units_with_two_decimals() {
        assert_eq!(Amount::from_major(100).to_string(), "100.00");
        assert_eq!(Amount(2050).to_string(), "20.50");
        assert_eq!(Amount(7).to_string(), "0.07");
    }
}
