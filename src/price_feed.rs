// Price Oracle Adapter
//
// The engine never ingests prices itself. It asks a PriceOracle for the current BTC/INR
// buy and sell rates and refuses to act on anything older than the configured tolerance.
// Rates are the USD price times the configured multipliers (91 buy / 88 sell by default).

use crate::config::{OracleParams, RateParams};
use crate::types::{Price, Timestamp};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One quote from the oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateQuote {
    /// INR per BTC a user pays when buying
    pub buy_rate: Price,
    /// INR per BTC a user receives when selling. also used to value collateral
    pub sell_rate: Price,
    pub btc_usd: Decimal,
    pub timestamp: Timestamp,
}

impl RateQuote {
    pub fn from_usd(btc_usd: Decimal, timestamp: Timestamp, params: &RateParams) -> Option<Self> {
        Some(Self {
            buy_rate: Price::new(btc_usd * params.buy_multiplier)?,
            sell_rate: Price::new(btc_usd * params.sell_multiplier)?,
            btc_usd,
            timestamp,
        })
    }

    /// Quote with explicit INR rates; `btc_usd` is left at zero.
    pub fn fixed(buy_rate: Price, sell_rate: Price, timestamp: Timestamp) -> Self {
        Self {
            buy_rate,
            sell_rate,
            btc_usd: Decimal::ZERO,
            timestamp,
        }
    }

    pub fn age_millis(&self, now: Timestamp) -> i64 {
        self.timestamp.millis_until(&now)
    }

    pub fn is_stale(&self, now: Timestamp, params: &OracleParams) -> bool {
        self.age_millis(now) > params.max_price_age_secs.saturating_mul(1_000)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OracleError {
    #[error("No price has been published yet")]
    NoPriceAvailable,

    #[error("Oracle unavailable: {0}")]
    Unavailable(String),
}

/// External collaborator supplying the current rates.
pub trait PriceOracle: Send + Sync {
    fn get_rate(&self) -> Result<RateQuote, OracleError>;
}

/// In-process oracle holding the last pushed quote. the feed side calls `publish`.
#[derive(Debug, Default)]
pub struct ManualOracle {
    latest: RwLock<Option<RateQuote>>,
    offline: RwLock<bool>,
}

impl ManualOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, quote: RateQuote) {
        *self.latest.write() = Some(quote);
    }

    pub fn publish_usd(&self, btc_usd: Decimal, timestamp: Timestamp, params: &RateParams) -> Option<RateQuote> {
        let quote = RateQuote::from_usd(btc_usd, timestamp, params)?;
        self.publish(quote);
        Some(quote)
    }

    /// Publishes the same INR rate on both sides.
    pub fn publish_flat(&self, rupees_per_btc: i64, timestamp: Timestamp) -> Option<RateQuote> {
        let price = Price::from_rupees(rupees_per_btc)?;
        let quote = RateQuote::fixed(price, price, timestamp);
        self.publish(quote);
        Some(quote)
    }

    pub fn set_offline(&self, offline: bool) {
        *self.offline.write() = offline;
    }
}

impl PriceOracle for ManualOracle {
    fn get_rate(&self) -> Result<RateQuote, OracleError> {
        if *self.offline.read() {
            return Err(OracleError::Unavailable("feed offline".to_string()));
        }
        (*self.latest.read()).ok_or(OracleError::NoPriceAvailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn rates_from_usd_use_multipliers() {
        let params = RateParams::default();
        let quote = RateQuote::from_usd(dec!(100_000), Timestamp::from_millis(0), &params).unwrap();
        assert_eq!(quote.buy_rate.value(), dec!(9_100_000));
        assert_eq!(quote.sell_rate.value(), dec!(8_800_000));
        assert!(RateQuote::from_usd(Decimal::ZERO, Timestamp::from_millis(0), &params).is_none());
    }

    #[test]
    fn staleness_uses_max_age() {
        let params = OracleParams::default();
        let quote = RateQuote::fixed(
            Price::from_rupees(9_000_000).unwrap(),
            Price::from_rupees(9_000_000).unwrap(),
            Timestamp::from_millis(0),
        );
        assert!(!quote.is_stale(Timestamp::from_millis(90_000), &params));
        assert!(quote.is_stale(Timestamp::from_millis(90_001), &params));
    }

    #[test]
    fn manual_oracle_publish_and_offline() {
        let oracle = ManualOracle::new();
        assert_eq!(oracle.get_rate().unwrap_err(), OracleError::NoPriceAvailable);

        oracle.publish_flat(9_000_000, Timestamp::from_millis(5));
        assert_eq!(oracle.get_rate().unwrap().timestamp, Timestamp::from_millis(5));

        oracle.set_offline(true);
        assert!(matches!(oracle.get_rate(), Err(OracleError::Unavailable(_))));
    }
}
