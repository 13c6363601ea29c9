// 8.6: read-only views. nothing here mutates state; a missing or stale quote just leaves the
// price-derived fields empty.

use super::core::Engine;
use super::results::EngineError;
use crate::ledger::UserBalance;
use crate::loan::Loan;
use crate::operation::Operation;
use crate::plan::ActivePlan;
use crate::price_feed::RateQuote;
use crate::risk::{self, RiskLevel};
use crate::types::{Inr, Price, UserId};
use rust_decimal::Decimal;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoanView {
    pub loan: Loan,
    pub current_ltv: Option<Decimal>,
    pub risk_level: Option<RiskLevel>,
    pub max_borrowable: Option<Inr>,
    pub available_to_borrow: Option<Inr>,
    pub liquidation_price: Option<Price>,
    pub interest_due: Inr,
    pub total_due: Inr,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Dashboard {
    pub user: UserId,
    pub balance: UserBalance,
    pub quote: Option<RateQuote>,
    /// available + reserved BTC valued at the sell rate
    pub btc_value_inr: Option<Inr>,
    pub loan: Option<LoanView>,
    pub pending_orders: Vec<Operation>,
    pub plans: Vec<ActivePlan>,
    pub settings_version: u64,
}

impl Engine {
    pub fn loan_view(&self, loan: Loan, quote: Option<&RateQuote>) -> LoanView {
        let settings = self.settings();
        let params = &settings.loans;
        let sell = quote.map(|q| q.sell_rate);
        let current_ltv =
            sell.map(|p| risk::current_ltv(loan.inr_borrowed_amount, loan.btc_collateral_amount, p));
        LoanView {
            current_ltv,
            risk_level: current_ltv.map(|ltv| risk::risk_level(ltv, params)),
            max_borrowable: sell.map(|p| risk::max_borrowable(loan.btc_collateral_amount, p, params)),
            available_to_borrow: sell.map(|p| {
                risk::available_to_borrow(loan.inr_borrowed_amount, loan.btc_collateral_amount, p, params)
            }),
            liquidation_price: risk::liquidation_price(
                loan.inr_borrowed_amount,
                loan.btc_collateral_amount,
                params,
            ),
            interest_due: loan.interest_due(params),
            total_due: loan.total_due(params),
            loan,
        }
    }

    pub fn dashboard(&self, user: UserId) -> Result<Dashboard, EngineError> {
        let settings = self.settings();
        let scope = self.user_scope(user);
        let _guard = scope.lock();

        let balance = self.ledger.balance(user)?;
        let quote = self.fresh_rate(&settings, self.now()).ok();
        let loan = self.loans.lock().active_for(user).ok().cloned();

        Ok(Dashboard {
            user,
            btc_value_inr: quote.map(|q| q.sell_rate.sats_to_inr(balance.btc_balance())),
            loan: loan.map(|l| self.loan_view(l, quote.as_ref())),
            pending_orders: self.pending_orders(user),
            plans: self.plans(user),
            settings_version: settings.version,
            balance,
            quote,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::EngineSettings;
    use crate::price_feed::ManualOracle;
    use crate::types::{Currency, Sats, Timestamp};
    use std::sync::Arc;

    #[test]
    fn dashboard_reflects_loan_risk() {
        let oracle = Arc::new(ManualOracle::new());
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(0)));
        let engine = Engine::new(EngineSettings::default(), oracle.clone(), clock.clone()).unwrap();
        engine.deposit(UserId(1), Currency::Btc, 2_000_000).unwrap();
        oracle.publish_flat(9_000_000, clock.now());
        engine.create_loan(UserId(1), Sats(1_000_000)).unwrap();
        engine.borrow(UserId(1), Inr(27_000)).unwrap();

        let view = engine.dashboard(UserId(1)).unwrap();
        assert_eq!(view.btc_value_inr, Some(Inr(90_000)));
        let loan = view.loan.unwrap();
        assert_eq!(loan.current_ltv, Some(Decimal::from(30)));
        assert_eq!(loan.risk_level, Some(RiskLevel::Low));
        assert_eq!(loan.available_to_borrow, Some(Inr(27_000)));
        assert_eq!(loan.liquidation_price, Price::from_rupees(3_000_000));

        // price gone stale: balances still shown, price fields empty
        clock.advance(200_000);
        let view = engine.dashboard(UserId(1)).unwrap();
        assert!(view.quote.is_none());
        assert_eq!(view.loan.unwrap().current_ltv, None);
        assert_eq!(view.balance.collateral_btc(), Sats(1_000_000));
    }
}
