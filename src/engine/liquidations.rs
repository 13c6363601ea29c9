//! Liquidation detection and execution.

use super::core::Engine;
use super::results::{EngineError, LiquidationResult, LiquidationTrigger};
use crate::config::EngineSettings;
use crate::ledger::{BalanceField, BalanceSnapshot, ChangeSet};
use crate::loan::{Loan, LoanStatus};
use crate::operation::{Operation, OperationType};
use crate::price_feed::RateQuote;
use crate::risk;
use crate::types::{Inr, Timestamp, UserId};
use tracing::{error, info, warn};

impl Engine {
    /// Checks every active loan against a fresh quote and liquidates the ones at or past
    /// the liquidation LTV.
    pub fn check_liquidations(&self) -> Result<Vec<LiquidationResult>, EngineError> {
        let settings = self.settings();
        let now = self.now();
        let quote = self.fresh_rate(&settings, now)?;
        let (_, liquidated, _) = self.sweep_loans(&settings, &quote, now);
        Ok(liquidated)
    }

    /// Force-closes the user's active loan at the current sell rate regardless of LTV.
    pub fn admin_liquidate(&self, user: UserId) -> Result<LiquidationResult, EngineError> {
        let settings = self.settings();
        let scope = self.user_scope(user);
        let _guard = scope.lock();

        let now = self.now();
        let quote = self.fresh_rate(&settings, now)?;
        let mut loan = self.loans.lock().active_for(user)?.clone();
        self.bring_interest_current(user, &mut loan, &settings, now)?;
        self.liquidate_locked(loan, &settings, &quote, LiquidationTrigger::Admin, now)
    }

    // 9.1: refresh LTV on every active loan and liquidate breaches. returns how many loans
    // were refreshed, the liquidations, and per-user failures
    pub(super) fn sweep_loans(
        &self,
        settings: &EngineSettings,
        quote: &RateQuote,
        now: Timestamp,
    ) -> (usize, Vec<LiquidationResult>, Vec<(UserId, EngineError)>) {
        let active = self.loans.lock().active_loans();
        let mut refreshed = 0;
        let mut liquidated = Vec::new();
        let mut failures = Vec::new();

        for (loan_id, user) in active {
            let scope = self.user_scope(user);
            let _guard = scope.lock();

            let current = self.loans.lock().get(loan_id).cloned();
            let Some(mut loan) = current.filter(Loan::is_active) else {
                continue;
            };
            if let Err(err) = self.bring_interest_current(user, &mut loan, settings, now) {
                warn!(loan = loan_id.0, error = %err, "accrual before LTV check failed");
            }
            loan.refresh_ltv(quote.sell_rate);
            loan.updated_at = now;
            self.loans.lock().store(loan.clone());
            refreshed += 1;

            if !risk::is_liquidatable(
                loan.inr_borrowed_amount,
                loan.btc_collateral_amount,
                quote.sell_rate,
                &settings.loans,
            ) {
                continue;
            }
            match self.liquidate_locked(loan, settings, quote, LiquidationTrigger::PriceBreach, now) {
                Ok(result) => liquidated.push(result),
                Err(err) => failures.push((user, err)),
            }
        }
        (refreshed, liquidated, failures)
    }

    // 9.2: sell all collateral at the sell rate, settle interest then principal, hand back the
    // surplus, write off any shortfall. the loan is claimed (LIQUIDATED) before the commit and
    // restored if the commit fails. caller holds the user scope
    fn liquidate_locked(
        &self,
        loan: Loan,
        settings: &EngineSettings,
        quote: &RateQuote,
        trigger: LiquidationTrigger,
        now: Timestamp,
    ) -> Result<LiquidationResult, EngineError> {
        let user = loan.user;
        let previous = loan.clone();
        let mut claimed = loan;
        claimed.close(LoanStatus::Liquidated, now);
        self.loans.lock().store(claimed.clone());

        let price = quote.sell_rate;
        let collateral = claimed.btc_collateral_amount;
        let proceeds = price.sats_to_inr(collateral);
        let top_up = claimed.floor_top_up(&settings.loans);
        let interest_due = claimed.interest_outstanding + top_up;
        let principal = claimed.inr_borrowed_amount;
        let split = risk::allocate_payment(proceeds, interest_due, principal);
        let written_off =
            (interest_due + principal).saturating_sub(split.to_interest + split.to_principal);

        let id = self.next_operation_id();
        let change = ChangeSet::new()
            .debit(BalanceField::CollateralBtc, collateral.value())
            .credit(BalanceField::InterestAccrued, top_up.value())
            .debit(BalanceField::InterestAccrued, interest_due.value())
            .debit(BalanceField::BorrowedInr, principal.value())
            .credit(BalanceField::AvailableInr, split.surplus.value())
            .with_reference(id);

        let snapshot = if change.is_empty() {
            self.ledger.balance(user).map(|b| BalanceSnapshot::from(&b))
        } else {
            self.ledger
                .commit(user, change)
                .map(|event| BalanceSnapshot::from(&event.balances_after))
        };
        let snapshot = match snapshot {
            Ok(snapshot) => snapshot,
            Err(err) => {
                error!(user = user.0, loan = previous.id.0, error = %err, "liquidation commit failed, loan restored");
                self.loans.lock().store(previous);
                return Err(err.into());
            }
        };

        claimed.record_floor_top_up(top_up);
        claimed.record_interest_paid(split.to_interest);
        claimed.written_off = written_off;
        claimed.btc_collateral_amount = snapshot.collateral_btc;
        claimed.inr_borrowed_amount = snapshot.borrowed_inr;
        claimed.interest_outstanding = Inr::ZERO;
        claimed.liquidation_price = None;
        claimed.refresh_ltv(price);
        self.loans.lock().store(claimed.clone());

        let op = Operation::new(id, user, OperationType::FullLiquidation, settings.version, now)
            .with_amounts(proceeds, collateral)
            .with_loan(claimed.id)
            .executed(Some(price), snapshot, now);
        self.record(op)?;

        if written_off.is_positive() {
            warn!(
                user = user.0,
                loan = claimed.id.0,
                written_off = written_off.value(),
                "liquidation proceeds short of debt"
            );
        }
        info!(
            user = user.0,
            loan = claimed.id.0,
            ?trigger,
            sats = collateral.value(),
            proceeds = proceeds.value(),
            surplus = split.surplus.value(),
            "loan liquidated"
        );

        Ok(LiquidationResult {
            loan_id: claimed.id,
            user,
            operation_id: id,
            trigger,
            price,
            collateral_sold: collateral,
            proceeds,
            to_interest: split.to_interest,
            to_principal: split.to_principal,
            surplus: split.surplus,
            written_off,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::engine::ErrorKind;
    use crate::price_feed::ManualOracle;
    use crate::types::{Currency, Sats};
    use std::sync::Arc;

    fn engine_with_loan(borrowed: i64) -> (Engine, Arc<ManualOracle>, Arc<ManualClock>) {
        let oracle = Arc::new(ManualOracle::new());
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(0)));
        let engine = Engine::new(EngineSettings::default(), oracle.clone(), clock.clone()).unwrap();
        engine.deposit(UserId(1), Currency::Btc, 1_000_000).unwrap();
        oracle.publish_flat(9_000_000, clock.now());
        engine.create_loan(UserId(1), Sats(1_000_000)).unwrap();
        engine.borrow(UserId(1), Inr(borrowed)).unwrap();
        (engine, oracle, clock)
    }

    #[test]
    fn breach_liquidates_and_returns_surplus() {
        let (engine, oracle, clock) = engine_with_loan(54_000);

        oracle.publish_flat(6_100_000, clock.now());
        assert!(engine.check_liquidations().unwrap().is_empty());

        oracle.publish_flat(5_900_000, clock.now());
        let results = engine.check_liquidations().unwrap();
        assert_eq!(results.len(), 1);
        let result = &results[0];
        // 59,000 proceeds: 533 interest floor, 54,000 principal, 4,467 back to the user
        assert_eq!(result.proceeds, Inr(59_000));
        assert_eq!(result.to_interest, Inr(533));
        assert_eq!(result.surplus, Inr(4_467));
        assert_eq!(result.written_off, Inr::ZERO);

        let balance = engine.balance(UserId(1)).unwrap();
        assert_eq!(balance.collateral_btc(), Sats::ZERO);
        assert_eq!(balance.borrowed_inr(), Inr::ZERO);
        assert_eq!(balance.available_inr(), Inr(54_000 + 4_467));
        assert_eq!(engine.loans(UserId(1))[0].status, LoanStatus::Liquidated);
        assert!(engine.audit(UserId(1)).is_ok());

        // nothing left to liquidate on the next tick
        assert!(engine.check_liquidations().unwrap().is_empty());
    }

    #[test]
    fn shortfall_is_written_off() {
        let (engine, oracle, clock) = engine_with_loan(54_000);
        oracle.publish_flat(4_000_000, clock.now());

        let result = engine.admin_liquidate(UserId(1)).unwrap();
        assert_eq!(result.trigger, LiquidationTrigger::Admin);
        assert_eq!(result.proceeds, Inr(40_000));
        assert_eq!(result.surplus, Inr::ZERO);
        assert_eq!(result.written_off, Inr(54_533 - 40_000));

        let loan = engine.loans(UserId(1)).pop().unwrap();
        assert_eq!(loan.written_off, Inr(14_533));
        let balance = engine.balance(UserId(1)).unwrap();
        assert_eq!(balance.borrowed_inr(), Inr::ZERO);
        assert_eq!(balance.interest_accrued(), Inr::ZERO);
    }

    #[test]
    fn liquidation_needs_fresh_price() {
        let (engine, _, clock) = engine_with_loan(10_000);
        clock.advance(120_000);
        assert_eq!(engine.check_liquidations().unwrap_err().kind(), ErrorKind::StalePrice);
        assert_eq!(engine.admin_liquidate(UserId(1)).unwrap_err().kind(), ErrorKind::StalePrice);
        assert!(engine.active_loan(UserId(1)).is_ok());
    }
}
