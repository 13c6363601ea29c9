//! Property-based tests for the risk math, rate conversions and ledger primitives.
//!
//! These tests verify invariants hold under random inputs.

use btcinr_core::risk::{
    allocate_payment, available_to_borrow, current_ltv, floor_top_up, is_liquidatable,
    liquidation_price, max_borrowable, minimum_interest, risk_level, DebtState,
};
use btcinr_core::config::LoanParams;
use btcinr_core::*;
use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;

// Strategies for generating test data
fn price_strategy() -> impl Strategy<Value = i64> {
    1_000_000i64..20_000_000i64 // 10 lakh to 2 crore INR per BTC
}

fn sats_strategy() -> impl Strategy<Value = i64> {
    1_000i64..500_000_000i64 // 0.00001 to 5 BTC
}

fn rupee_strategy() -> impl Strategy<Value = i64> {
    0i64..5_000_000i64
}

fn price(rupees: i64) -> Price {
    Price::from_rupees(rupees).unwrap()
}

proptest! {
    /// Buying never yields more BTC than the rupees are worth
    #[test]
    fn buy_conversion_never_overpays(inr in 1i64..10_000_000, rate in price_strategy()) {
        let p = price(rate);
        let sats = p.inr_to_sats(Inr(inr));
        prop_assert!(p.value_of(sats) <= Decimal::from(inr));
        prop_assert!(p.value_of(Sats(sats.value() + 1)) > Decimal::from(inr));
    }

    /// Selling never yields more rupees than the BTC is worth
    #[test]
    fn sell_conversion_never_overpays(sats in sats_strategy(), rate in price_strategy()) {
        let p = price(rate);
        let inr = p.sats_to_inr(Sats(sats));
        prop_assert!(inr.as_decimal() <= p.value_of(Sats(sats)));
        prop_assert!(inr.as_decimal() + Decimal::ONE > p.value_of(Sats(sats)));
    }

    /// Borrowing the full capacity never puts LTV above the origination cap
    #[test]
    fn max_borrow_respects_origination(sats in sats_strategy(), rate in price_strategy()) {
        let params = LoanParams::default();
        let p = price(rate);
        let max = max_borrowable(Sats(sats), p, &params);
        let ltv = current_ltv(max, Sats(sats), p);
        prop_assert!(ltv <= params.origination_ltv * dec!(100));
        prop_assert_eq!(available_to_borrow(max, Sats(sats), p, &params), Inr::ZERO);
    }

    /// LTV only grows as the price falls
    #[test]
    fn ltv_monotonic_in_price(
        borrowed in 1i64..1_000_000,
        sats in sats_strategy(),
        high in price_strategy(),
        drop in 1i64..900_000,
    ) {
        let low = (high - drop).max(1);
        let at_high = current_ltv(Inr(borrowed), Sats(sats), price(high));
        let at_low = current_ltv(Inr(borrowed), Sats(sats), price(low));
        prop_assert!(at_low >= at_high);
    }

    /// One rupee below the liquidation price the loan is liquidatable; one above it is not
    #[test]
    fn liquidation_price_is_the_boundary(borrowed in 1_000i64..1_000_000, sats in 100_000i64..100_000_000) {
        let params = LoanParams::default();
        let Some(liq) = liquidation_price(Inr(borrowed), Sats(sats), &params) else {
            return Err(TestCaseError::fail("expected a liquidation price"));
        };
        let above = Price::new_unchecked(liq.value() + Decimal::ONE);
        prop_assert!(!is_liquidatable(Inr(borrowed), Sats(sats), above, &params));
        let below = Price::new(liq.value() - Decimal::ONE);
        if let Some(below) = below {
            prop_assert!(is_liquidatable(Inr(borrowed), Sats(sats), below, &params));
        }
    }

    /// A payment is split without creating or losing rupees
    #[test]
    fn payment_split_conserves(amount in rupee_strategy(), interest in rupee_strategy(), principal in rupee_strategy()) {
        let split = allocate_payment(Inr(amount), Inr(interest), Inr(principal));
        prop_assert_eq!(split.to_interest + split.to_principal + split.surplus, Inr(amount));
        prop_assert!(split.to_interest <= Inr(interest));
        prop_assert!(split.to_principal <= Inr(principal));
        if split.to_principal.is_positive() {
            prop_assert_eq!(split.to_interest, Inr(interest));
        }
    }

    /// Lifetime charges plus the top-up always reach the minimum-period interest
    #[test]
    fn floor_top_up_reaches_minimum(borrowed in rupee_strategy(), charged in 0i64..100_000) {
        let params = LoanParams::default();
        let debt = DebtState {
            borrowed: Inr(borrowed),
            interest_outstanding: Inr(charged),
            interest_charged: Inr(charged),
        };
        let minimum = minimum_interest(Inr(borrowed), params.annual_interest_rate, &params);
        let top_up = floor_top_up(&debt, params.annual_interest_rate, &params);
        prop_assert!(Inr(charged) + top_up >= minimum);
        prop_assert!(top_up >= Inr::ZERO);
    }

    /// Reserving then releasing the same amounts leaves every field where it started
    #[test]
    fn reserve_release_round_trip(
        deposit in 1i64..10_000_000,
        amounts in proptest::collection::vec(1i64..1_000_000, 1..20),
        btc in any::<bool>(),
    ) {
        let currency = if btc { Currency::Btc } else { Currency::Inr };
        let ledger = Ledger::new(Arc::new(SystemClock));
        let user = UserId(1);
        ledger.open_account(user);
        ledger
            .commit(user, ChangeSet::new().credit(BalanceField::available(currency), deposit))
            .unwrap();
        let start = ledger.balance(user).unwrap();

        let mut held = Vec::new();
        for amount in &amounts {
            if ledger.reserve(user, currency, *amount, None).is_ok() {
                held.push(*amount);
            }
        }
        let mid = ledger.balance(user).unwrap();
        prop_assert_eq!(mid.get(BalanceField::reserved(currency)), held.iter().sum::<i64>());
        prop_assert!(mid.get(BalanceField::available(currency)) >= 0);

        for amount in held {
            ledger.release(user, currency, amount, None).unwrap();
        }
        let end = ledger.balance(user).unwrap();
        for field in BalanceField::ALL {
            prop_assert_eq!(end.get(field), start.get(field));
        }
        prop_assert!(ledger.verify(user).is_ok());
    }
}

// Unit tests for fixed scenarios
#[cfg(test)]
mod unit_tests {
    use super::*;

    #[test]
    fn risk_bands_at_default_thresholds() {
        let params = LoanParams::default();
        assert_eq!(risk_level(dec!(60), &params), RiskLevel::Low);
        assert_eq!(risk_level(dec!(85), &params), RiskLevel::Medium);
        assert_eq!(risk_level(dec!(89.99), &params), RiskLevel::Medium);
        assert_eq!(risk_level(dec!(90), &params), RiskLevel::High);
    }

    #[test]
    fn extreme_prices_do_not_overflow() {
        let params = LoanParams::default();
        let huge = Price::from_rupees(i64::MAX / 1_000).unwrap();
        let max = max_borrowable(Sats(21_000_000 * SATS_PER_BTC), huge, &params);
        assert!(max.is_positive());

        let tiny = Price::new_unchecked(dec!(0.0001));
        assert_eq!(tiny.sats_to_inr(Sats(1)), Inr::ZERO);
        assert!(current_ltv(Inr(1), Sats(1), tiny) > dec!(100));
    }
}
