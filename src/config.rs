// 7.0 config.rs: all settings in one place. rate multipliers, loan thresholds, order limits,
// dca policy, oracle tolerance, scheduler cadence.
// 7.1 settings are versioned and injected per call so a (price, settings) pair always
// reproduces the same risk numbers. nothing here is global.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::types::{Inr, Sats};

/// Complete engine configuration. `version` must increase on every change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub version: u64,
    pub rates: RateParams,
    pub loans: LoanParams,
    pub orders: OrderParams,
    pub dca: DcaParams,
    pub oracle: OracleParams,
    pub scheduler: SchedulerParams,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            version: 1,
            rates: RateParams::default(),
            loans: LoanParams::default(),
            orders: OrderParams::default(),
            dca: DcaParams::default(),
            oracle: OracleParams::default(),
            scheduler: SchedulerParams::default(),
        }
    }
}

/** 7.2: INR quote = BTC/USD × multiplier. the spread between the two is the house margin */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateParams {
    pub buy_multiplier: Decimal,
    pub sell_multiplier: Decimal,
}

impl Default for RateParams {
    fn default() -> Self {
        Self {
            buy_multiplier: dec!(91),
            sell_multiplier: dec!(88),
        }
    }
}

// 7.3: loan thresholds are fractions (0.60 = 60% LTV)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoanParams {
    pub origination_ltv: Decimal,
    pub liquidation_ltv: Decimal,
    // LTV at which a loan is reported as MEDIUM risk
    pub medium_risk_ltv: Decimal,
    pub annual_interest_rate: Decimal,
    pub min_interest_days: u32,
    pub days_per_year: u32,
}

impl Default for LoanParams {
    fn default() -> Self {
        Self {
            origination_ltv: dec!(0.60),
            liquidation_ltv: dec!(0.90),
            medium_risk_ltv: dec!(0.85),
            annual_interest_rate: dec!(0.12),
            min_interest_days: 30,
            days_per_year: 365,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderParams {
    pub min_order_inr: Inr,
    pub min_order_sats: Sats,
    // pending limit orders older than this are expired by the sweep
    pub order_expiry_hours: i64,
}

impl Default for OrderParams {
    fn default() -> Self {
        Self {
            min_order_inr: Inr(100),
            min_order_sats: Sats(1_000),
            order_expiry_hours: 24 * 7,
        }
    }
}

/// What a DCA tick does when the price is outside the plan's bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DcaBoundPolicy {
    /// Leave the schedule untouched; the plan is retried on the next tick.
    #[default]
    Retry,
    /// Move `next_execution_at` to the next slot after now without consuming an execution.
    Defer,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DcaParams {
    pub bound_policy: DcaBoundPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleParams {
    // quotes older than this are stale. nothing executes on a stale quote
    pub max_price_age_secs: i64,
    pub timeout_ms: u64,
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
}

impl Default for OracleParams {
    fn default() -> Self {
        Self {
            max_price_age_secs: 90,
            timeout_ms: 5_000,
            retry_attempts: 3,
            retry_backoff_ms: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerParams {
    pub price_tick_ms: u64,
    pub dca_tick_ms: u64,
    pub interest_tick_ms: u64,
    pub expiry_sweep_ms: u64,
}

impl Default for SchedulerParams {
    fn default() -> Self {
        Self {
            price_tick_ms: 30_000,
            dca_tick_ms: 60_000,
            interest_tick_ms: 3_600_000,
            expiry_sweep_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("origination LTV {origination} must be below liquidation LTV {liquidation}")]
    LtvOrdering { origination: Decimal, liquidation: Decimal },

    #[error("{name} must be in (0, 1], got {value}")]
    FractionOutOfRange { name: &'static str, value: Decimal },

    #[error("{name} must be positive")]
    NonPositive { name: &'static str },

    #[error("sell multiplier {sell} exceeds buy multiplier {buy}")]
    InvertedSpread { buy: Decimal, sell: Decimal },
}

impl EngineSettings {
    /// Load settings from a TOML file. missing sections fall back to defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file: {}", path.display()))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("Failed to load settings file: {}", path.display()))
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let settings: EngineSettings =
            toml::from_str(contents).context("Failed to parse settings TOML")?;
        settings.validate()?;
        Ok(settings)
    }

    // Stricter preset: lower origination cap and shorter price tolerance
    pub fn conservative() -> Self {
        let mut settings = Self::default();
        settings.loans.origination_ltv = dec!(0.50);
        settings.loans.medium_risk_ltv = dec!(0.80);
        settings.oracle.max_price_age_secs = 45;
        settings.dca.bound_policy = DcaBoundPolicy::Defer;
        settings
    }

    /// Copy with the version bumped by one.
    pub fn next_version(&self) -> Self {
        let mut next = self.clone();
        next.version += 1;
        next
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let loans = &self.loans;
        for (name, value) in [
            ("origination_ltv", loans.origination_ltv),
            ("liquidation_ltv", loans.liquidation_ltv),
            ("medium_risk_ltv", loans.medium_risk_ltv),
        ] {
            if value <= Decimal::ZERO || value > Decimal::ONE {
                return Err(ConfigError::FractionOutOfRange { name, value });
            }
        }
        if loans.origination_ltv >= loans.liquidation_ltv {
            return Err(ConfigError::LtvOrdering {
                origination: loans.origination_ltv,
                liquidation: loans.liquidation_ltv,
            });
        }
        if loans.annual_interest_rate < Decimal::ZERO {
            return Err(ConfigError::NonPositive { name: "annual_interest_rate" });
        }
        if loans.days_per_year == 0 {
            return Err(ConfigError::NonPositive { name: "days_per_year" });
        }
        if self.rates.buy_multiplier <= Decimal::ZERO {
            return Err(ConfigError::NonPositive { name: "buy_multiplier" });
        }
        if self.rates.sell_multiplier <= Decimal::ZERO {
            return Err(ConfigError::NonPositive { name: "sell_multiplier" });
        }
        if self.rates.sell_multiplier > self.rates.buy_multiplier {
            return Err(ConfigError::InvertedSpread {
                buy: self.rates.buy_multiplier,
                sell: self.rates.sell_multiplier,
            });
        }
        if !self.orders.min_order_inr.is_positive() {
            return Err(ConfigError::NonPositive { name: "min_order_inr" });
        }
        if !self.orders.min_order_sats.is_positive() {
            return Err(ConfigError::NonPositive { name: "min_order_sats" });
        }
        if self.orders.order_expiry_hours <= 0 {
            return Err(ConfigError::NonPositive { name: "order_expiry_hours" });
        }
        if self.oracle.max_price_age_secs <= 0 {
            return Err(ConfigError::NonPositive { name: "max_price_age_secs" });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = EngineSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.rates.buy_multiplier, dec!(91));
        assert_eq!(settings.rates.sell_multiplier, dec!(88));
        assert_eq!(settings.loans.min_interest_days, 30);
        assert!(EngineSettings::conservative().validate().is_ok());
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let settings = EngineSettings::from_toml_str(
            r#"
            version = 4

            [loans]
            origination_ltv = "0.55"

            [dca]
            bound_policy = "defer"
            "#,
        )
        .unwrap();

        assert_eq!(settings.version, 4);
        assert_eq!(settings.loans.origination_ltv, dec!(0.55));
        assert_eq!(settings.loans.liquidation_ltv, dec!(0.90));
        assert_eq!(settings.dca.bound_policy, DcaBoundPolicy::Defer);
        assert_eq!(settings.orders.min_order_inr, Inr(100));
    }

    #[test]
    fn sample_file_matches_defaults() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("engine.toml");
        let settings = EngineSettings::load(path).unwrap();
        assert_eq!(settings, EngineSettings::default());
    }

    #[test]
    fn rejects_inverted_ltv_thresholds() {
        let mut settings = EngineSettings::default();
        settings.loans.origination_ltv = dec!(0.95);
        assert!(matches!(settings.validate(), Err(ConfigError::LtvOrdering { .. })));
    }

    #[test]
    fn rejects_inverted_spread() {
        let mut settings = EngineSettings::default();
        settings.rates.sell_multiplier = dec!(95);
        assert!(matches!(settings.validate(), Err(ConfigError::InvertedSpread { .. })));
    }

    #[test]
    fn next_version_increments() {
        let settings = EngineSettings::default();
        assert_eq!(settings.next_version().version, settings.version + 1);
    }
}
