// 1.0: all the primitives live here. nothing in the engine works without these types.
// IDs, money, prices, timestamps. each is a newtype so the compiler catches unit mixups
// (rupees vs satoshis is the one that bites).

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const SATS_PER_BTC: i64 = 100_000_000;
pub const MILLIS_PER_HOUR: i64 = 3_600_000;
pub const MILLIS_PER_DAY: i64 = 24 * MILLIS_PER_HOUR;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OperationId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PlanId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LoanId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Currency {
    Inr,
    Btc,
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Currency::Inr => write!(f, "INR"),
            Currency::Btc => write!(f, "BTC"),
        }
    }
}

// 1.1: whole rupees. the ledger never stores fractional rupees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Inr(pub i64);

impl Inr {
    pub const ZERO: Inr = Inr(0);

    pub fn value(&self) -> i64 {
        self.0
    }

    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }

    pub fn as_decimal(&self) -> Decimal {
        Decimal::from(self.0)
    }

    pub fn saturating_sub(&self, other: Inr) -> Inr {
        Inr((self.0 - other.0).max(0))
    }

    pub fn min(self, other: Inr) -> Inr {
        Inr(self.0.min(other.0))
    }

    pub fn max(self, other: Inr) -> Inr {
        Inr(self.0.max(other.0))
    }
}

impl std::ops::Add for Inr {
    type Output = Inr;
    fn add(self, rhs: Inr) -> Inr {
        Inr(self.0 + rhs.0)
    }
}

impl std::ops::Sub for Inr {
    type Output = Inr;
    fn sub(self, rhs: Inr) -> Inr {
        Inr(self.0 - rhs.0)
    }
}

impl fmt::Display for Inr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "₹{}", self.0)
    }
}

// 1.2: satoshis. 1e-8 BTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Sats(pub i64);

impl Sats {
    pub const ZERO: Sats = Sats(0);

    pub fn value(&self) -> i64 {
        self.0
    }

    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }

    pub fn as_btc(&self) -> Decimal {
        Decimal::from(self.0) / Decimal::from(SATS_PER_BTC)
    }
}

impl std::ops::Add for Sats {
    type Output = Sats;
    fn add(self, rhs: Sats) -> Sats {
        Sats(self.0 + rhs.0)
    }
}

impl std::ops::Sub for Sats {
    type Output = Sats;
    fn sub(self, rhs: Sats) -> Sats {
        Sats(self.0 - rhs.0)
    }
}

impl fmt::Display for Sats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} sats", self.0)
    }
}

// 1.3: INR per whole BTC. must be positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Price(Decimal);

impl Price {
    #[must_use]
    pub fn new(value: Decimal) -> Option<Self> {
        if value > Decimal::ZERO {
            Some(Self(value))
        } else {
            None
        }
    }

    pub fn new_unchecked(value: Decimal) -> Self {
        debug_assert!(value > Decimal::ZERO);
        Self(value)
    }

    pub fn from_rupees(rupees: i64) -> Option<Self> {
        Self::new(Decimal::from(rupees))
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    /// Exact INR value of `sats` at this price (may be fractional).
    pub fn value_of(&self, sats: Sats) -> Decimal {
        sats.as_btc() * self.0
    }

    /// Rupees received for selling `sats`, floored to whole rupees.
    pub fn sats_to_inr(&self, sats: Sats) -> Inr {
        Inr(floor_to_i64(self.value_of(sats)))
    }

    /// Satoshis bought with `inr`, floored to whole sats.
    pub fn inr_to_sats(&self, inr: Inr) -> Sats {
        let sats = inr.as_decimal() * Decimal::from(SATS_PER_BTC) / self.0;
        Sats(floor_to_i64(sats))
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub(crate) fn floor_to_i64(value: Decimal) -> i64 {
    value.floor().to_i64().unwrap_or(i64::MAX)
}

pub(crate) fn ceil_to_i64(value: Decimal) -> i64 {
    value.ceil().to_i64().unwrap_or(i64::MAX)
}

// 1.4: millisecond timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn now() -> Self {
        Self(chrono::Utc::now().timestamp_millis())
    }

    pub fn from_millis(ms: i64) -> Self {
        Self(ms)
    }

    pub fn as_millis(&self) -> i64 {
        self.0
    }

    pub fn plus_millis(&self, ms: i64) -> Self {
        Self(self.0.saturating_add(ms))
    }

    pub fn plus_hours(&self, hours: i64) -> Self {
        self.plus_millis(hours.saturating_mul(MILLIS_PER_HOUR))
    }

    pub fn plus_days(&self, days: i64) -> Self {
        self.plus_millis(days.saturating_mul(MILLIS_PER_DAY))
    }

    /// Millis from `self` until `later`; negative when `later` is earlier.
    pub fn millis_until(&self, later: &Timestamp) -> i64 {
        later.0 - self.0
    }

    /// Whole days from `self` until `later`. zero if `later` is not after `self`.
    pub fn whole_days_until(&self, later: &Timestamp) -> i64 {
        (self.millis_until(later) / MILLIS_PER_DAY).max(0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match chrono::DateTime::from_timestamp_millis(self.0) {
            Some(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M:%S")),
            None => write!(f, "{}ms", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn price_conversions_floor() {
        let price = Price::new_unchecked(dec!(8_900_000));

        // 10,000 INR buys 112359.55... sats
        assert_eq!(price.inr_to_sats(Inr(10_000)), Sats(112_359));
        // 1,000,000 sats = 0.01 BTC = 89,000 INR
        assert_eq!(price.sats_to_inr(Sats(1_000_000)), Inr(89_000));
        // 1 sat at 8.9M is 0.089 INR, floors to zero
        assert_eq!(price.sats_to_inr(Sats(1)), Inr(0));
    }

    #[test]
    fn price_rejects_non_positive() {
        assert!(Price::new(Decimal::ZERO).is_none());
        assert!(Price::new(dec!(-1)).is_none());
        assert!(Price::from_rupees(9_000_000).is_some());
    }

    #[test]
    fn timestamp_day_math() {
        let start = Timestamp::from_millis(0);
        let later = start.plus_days(3).plus_hours(5);
        assert_eq!(start.whole_days_until(&later), 3);
        assert_eq!(later.whole_days_until(&start), 0);
    }

    #[test]
    fn money_arithmetic() {
        assert_eq!(Inr(100) - Inr(40), Inr(60));
        assert_eq!(Inr(10).saturating_sub(Inr(40)), Inr::ZERO);
        assert_eq!(Sats(5) + Sats(7), Sats(12));
        assert_eq!(Sats(50_000_000).as_btc(), dec!(0.5));
    }
}
