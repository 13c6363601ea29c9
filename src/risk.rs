//! Risk evaluator: loan-to-value, borrowing capacity, liquidation price, interest due.
//!
//! Everything here is a pure function of its inputs and the loan parameters. The engine
//! calls these with the settings snapshot it is running under, and the dashboard calls the
//! same functions read-only.

use crate::config::LoanParams;
use crate::types::{ceil_to_i64, floor_to_i64, Inr, Price, Sats, SATS_PER_BTC};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

const HUNDRED: Decimal = dec!(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Low,
    Medium,
    /// at or past the liquidation threshold
    High,
}

/// Debt side of a loan as the risk functions see it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DebtState {
    pub borrowed: Inr,
    /// interest booked in the ledger and not yet paid
    pub interest_outstanding: Inr,
    /// lifetime interest booked, paid or not
    pub interest_charged: Inr,
}

/// How a payment splits across the debt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PaymentAllocation {
    pub to_interest: Inr,
    pub to_principal: Inr,
    pub surplus: Inr,
}

/// LTV as a percentage (54.5 = 54.5%). zero debt is 0; debt against nothing is Decimal::MAX.
pub fn current_ltv(borrowed: Inr, collateral: Sats, price: Price) -> Decimal {
    if !borrowed.is_positive() {
        return Decimal::ZERO;
    }
    let collateral_value = price.value_of(collateral);
    if collateral_value <= Decimal::ZERO {
        return Decimal::MAX;
    }
    borrowed.as_decimal() / collateral_value * HUNDRED
}

pub fn max_borrowable(collateral: Sats, price: Price, params: &LoanParams) -> Inr {
    if !collateral.is_positive() {
        return Inr::ZERO;
    }
    Inr(floor_to_i64(price.value_of(collateral) * params.origination_ltv))
}

/// Remaining borrowing capacity under the origination cap.
pub fn available_to_borrow(borrowed: Inr, collateral: Sats, price: Price, params: &LoanParams) -> Inr {
    max_borrowable(collateral, price, params).saturating_sub(borrowed)
}

// BTC price at which current_ltv reaches the liquidation threshold. None without debt or collateral
pub fn liquidation_price(borrowed: Inr, collateral: Sats, params: &LoanParams) -> Option<Price> {
    if !borrowed.is_positive() || !collateral.is_positive() {
        return None;
    }
    let btc = Decimal::from(collateral.value()) / Decimal::from(SATS_PER_BTC);
    let price = borrowed.as_decimal() / (btc * params.liquidation_ltv);
    Price::new(Decimal::from(ceil_to_i64(price)))
}

pub fn risk_level(ltv_percent: Decimal, params: &LoanParams) -> RiskLevel {
    if ltv_percent >= params.liquidation_ltv * HUNDRED {
        RiskLevel::High
    } else if ltv_percent >= params.medium_risk_ltv * HUNDRED {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}

pub fn is_liquidatable(borrowed: Inr, collateral: Sats, price: Price, params: &LoanParams) -> bool {
    borrowed.is_positive()
        && current_ltv(borrowed, collateral, price) >= params.liquidation_ltv * HUNDRED
}

/// Exact (fractional) simple interest for one day on `borrowed`.
pub fn daily_interest(borrowed: Inr, annual_rate: Decimal, params: &LoanParams) -> Decimal {
    borrowed.as_decimal() * annual_rate / Decimal::from(params.days_per_year)
}

/// Interest owed for the minimum charging period on the current principal, rounded up.
pub fn minimum_interest(borrowed: Inr, annual_rate: Decimal, params: &LoanParams) -> Inr {
    let days = Decimal::from(params.min_interest_days);
    Inr(ceil_to_i64(daily_interest(borrowed, annual_rate, params) * days))
}

/// Extra interest needed so lifetime charges reach the minimum-period floor.
pub fn floor_top_up(debt: &DebtState, annual_rate: Decimal, params: &LoanParams) -> Inr {
    minimum_interest(debt.borrowed, annual_rate, params).saturating_sub(debt.interest_charged)
}

pub fn minimum_interest_due(debt: &DebtState, annual_rate: Decimal, params: &LoanParams) -> Inr {
    debt.interest_outstanding + floor_top_up(debt, annual_rate, params)
}

pub fn total_due(debt: &DebtState, annual_rate: Decimal, params: &LoanParams) -> Inr {
    debt.borrowed + minimum_interest_due(debt, annual_rate, params)
}

// interest first, then principal, anything left is surplus
pub fn allocate_payment(amount: Inr, interest_due: Inr, principal: Inr) -> PaymentAllocation {
    let to_interest = amount.min(interest_due).max(Inr::ZERO);
    let after_interest = amount.saturating_sub(to_interest);
    let to_principal = after_interest.min(principal).max(Inr::ZERO);
    PaymentAllocation {
        to_interest,
        to_principal,
        surplus: after_interest.saturating_sub(to_principal),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn params() -> LoanParams {
        LoanParams::default()
    }

    fn price(rupees: i64) -> Price {
        Price::from_rupees(rupees).unwrap()
    }

    #[test]
    fn max_borrowable_at_sixty_percent() {
        // 0.01 BTC at 9,000,000 is 90,000 INR, 60% is 54,000
        assert_eq!(max_borrowable(Sats(1_000_000), price(9_000_000), &params()), Inr(54_000));
        assert_eq!(max_borrowable(Sats::ZERO, price(9_000_000), &params()), Inr::ZERO);
    }

    #[test]
    fn liquidation_price_at_ninety_percent() {
        let liq = liquidation_price(Inr(54_000), Sats(1_000_000), &params()).unwrap();
        assert_eq!(liq, price(6_000_000));
        assert!(liquidation_price(Inr::ZERO, Sats(1_000_000), &params()).is_none());
    }

    #[test]
    fn liquidation_price_rounds_up() {
        // 50,000 / (0.01 * 0.9) = 5,555,555.55...
        let liq = liquidation_price(Inr(50_000), Sats(1_000_000), &params()).unwrap();
        assert_eq!(liq, price(5_555_556));
    }

    #[test]
    fn ltv_and_risk_levels() {
        let collateral = Sats(1_000_000);
        let ltv = current_ltv(Inr(54_000), collateral, price(9_000_000));
        assert_eq!(ltv, dec!(60));
        assert_eq!(risk_level(ltv, &params()), RiskLevel::Low);

        let ltv = current_ltv(Inr(54_000), collateral, price(6_200_000));
        assert_eq!(risk_level(ltv, &params()), RiskLevel::Medium);

        let ltv = current_ltv(Inr(54_000), collateral, price(5_900_000));
        assert_eq!(risk_level(ltv, &params()), RiskLevel::High);
        assert!(is_liquidatable(Inr(54_000), collateral, price(5_900_000), &params()));
        assert!(is_liquidatable(Inr(54_000), collateral, price(6_000_000), &params()));
        assert!(!is_liquidatable(Inr(54_000), collateral, price(6_000_001), &params()));
    }

    #[test]
    fn ltv_edge_cases() {
        assert_eq!(current_ltv(Inr::ZERO, Sats::ZERO, price(1)), Decimal::ZERO);
        assert_eq!(current_ltv(Inr(1), Sats::ZERO, price(1)), Decimal::MAX);
    }

    #[test]
    fn thirty_day_floor() {
        // 36,500 at 12% is 12/day, 360 for 30 days
        let debt = DebtState {
            borrowed: Inr(36_500),
            interest_outstanding: Inr(24),
            interest_charged: Inr(24),
        };
        assert_eq!(minimum_interest(debt.borrowed, dec!(0.12), &params()), Inr(360));
        assert_eq!(floor_top_up(&debt, dec!(0.12), &params()), Inr(336));
        assert_eq!(minimum_interest_due(&debt, dec!(0.12), &params()), Inr(360));
        assert_eq!(total_due(&debt, dec!(0.12), &params()), Inr(36_860));
    }

    #[test]
    fn floor_is_spent_once_charges_exceed_it() {
        let debt = DebtState {
            borrowed: Inr(36_500),
            interest_outstanding: Inr(480),
            interest_charged: Inr(480),
        };
        assert_eq!(floor_top_up(&debt, dec!(0.12), &params()), Inr::ZERO);
        assert_eq!(total_due(&debt, dec!(0.12), &params()), Inr(36_980));
    }

    #[test]
    fn payment_goes_to_interest_first() {
        let alloc = allocate_payment(Inr(500), Inr(360), Inr(36_500));
        assert_eq!(alloc.to_interest, Inr(360));
        assert_eq!(alloc.to_principal, Inr(140));
        assert_eq!(alloc.surplus, Inr::ZERO);

        let alloc = allocate_payment(Inr(40_000), Inr(360), Inr(36_500));
        assert_eq!(alloc.to_principal, Inr(36_500));
        assert_eq!(alloc.surplus, Inr(3_140));

        let alloc = allocate_payment(Inr(100), Inr(360), Inr(36_500));
        assert_eq!(alloc.to_interest, Inr(100));
        assert_eq!(alloc.to_principal, Inr::ZERO);
    }
}
