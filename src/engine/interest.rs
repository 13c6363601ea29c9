// 8.5: interest accrual. runs from the hourly job and in front of every loan mutation so the
// debt a user acts on is always current to the last whole day.

use super::core::Engine;
use super::results::{AccrualReport, EngineError};
use crate::config::EngineSettings;
use crate::ledger::BalanceField;
use crate::loan::Loan;
use crate::operation::{Operation, OperationType};
use crate::types::{OperationId, Sats, Timestamp, UserId};
use tracing::{debug, info, warn};

impl Engine {
    /// Books whole days of interest on `loan` into the ledger and stores the loan.
    /// caller holds the user scope. Ok(None) when no full day has passed or nothing rounds up.
    pub(super) fn bring_interest_current(
        &self,
        user: UserId,
        loan: &mut Loan,
        settings: &EngineSettings,
        now: Timestamp,
    ) -> Result<Option<OperationId>, EngineError> {
        let mut next = loan.clone();
        let booked = next.accrue(now, &settings.loans);
        if !booked.is_positive() {
            if next.accrued_through != loan.accrued_through {
                // days passed but the exact interest has not reached the next rupee
                self.loans.lock().store(next.clone());
                *loan = next;
            }
            return Ok(None);
        }

        let id = self.next_operation_id();
        let event = self
            .ledger
            .adjust(user, BalanceField::InterestAccrued, booked.value(), Some(id))?;
        next.sync_from_balance(&event.balances_after, None, &settings.loans, now);
        self.loans.lock().store(next.clone());
        *loan = next;

        let op = Operation::new(id, user, OperationType::InterestAccrual, settings.version, now)
            .with_amounts(booked, Sats::ZERO)
            .with_loan(loan.id)
            .executed(None, (&event.balances_after).into(), now);
        self.record(op)?;
        debug!(user = user.0, loan = loan.id.0, rupees = booked.value(), "interest booked");
        Ok(Some(id))
    }

    /// Accrues interest on every active loan.
    pub fn accrue_interest(&self) -> AccrualReport {
        let settings = self.settings();
        let now = self.now();
        let active = self.loans.lock().active_loans();
        let mut report = AccrualReport::default();

        for (loan_id, user) in active {
            let scope = self.user_scope(user);
            let _guard = scope.lock();

            let current = self.loans.lock().get(loan_id).cloned();
            let Some(mut loan) = current.filter(Loan::is_active) else {
                continue;
            };
            report.loans_checked += 1;
            match self.bring_interest_current(user, &mut loan, &settings, now) {
                Ok(Some(op)) => {
                    report.operations.push(op);
                    if let Some(booked) = self.operation(op).map(|o| o.inr_amount) {
                        report.total_booked = report.total_booked + booked;
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(loan = loan_id.0, error = %err, "interest accrual failed");
                    report.failures.push((loan_id, err));
                }
            }
        }
        if !report.operations.is_empty() {
            info!(
                loans = report.operations.len(),
                rupees = report.total_booked.value(),
                "interest accrued"
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::price_feed::ManualOracle;
    use crate::types::{Currency, Inr, MILLIS_PER_DAY};
    use std::sync::Arc;

    #[test]
    fn hourly_job_books_daily_interest_once() {
        let oracle = Arc::new(ManualOracle::new());
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(0)));
        let engine = Engine::new(EngineSettings::default(), oracle.clone(), clock.clone()).unwrap();
        engine.deposit(UserId(1), Currency::Btc, 10_000_000).unwrap();
        oracle.publish_flat(9_000_000, clock.now());
        engine.create_loan(UserId(1), Sats(10_000_000)).unwrap();
        engine.borrow(UserId(1), Inr(36_500)).unwrap();

        clock.advance(MILLIS_PER_DAY - 1);
        assert!(engine.accrue_interest().operations.is_empty());

        clock.advance(1);
        let report = engine.accrue_interest();
        assert_eq!(report.total_booked, Inr(12));
        // running again in the same day changes nothing
        assert!(engine.accrue_interest().operations.is_empty());

        clock.advance(2 * MILLIS_PER_DAY);
        assert_eq!(engine.accrue_interest().total_booked, Inr(24));

        let loan = engine.active_loan(UserId(1)).unwrap();
        assert_eq!(loan.interest_outstanding, Inr(36));
        assert_eq!(engine.balance(UserId(1)).unwrap().interest_accrued(), Inr(36));
        assert!(engine.audit(UserId(1)).is_ok());
    }

    #[test]
    fn borrowing_mid_day_restarts_day_count() {
        let oracle = Arc::new(ManualOracle::new());
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(0)));
        let engine = Engine::new(EngineSettings::default(), oracle.clone(), clock.clone()).unwrap();
        engine.deposit(UserId(1), Currency::Btc, 10_000_000).unwrap();
        oracle.publish_flat(9_000_000, clock.now());
        engine.create_loan(UserId(1), Sats(10_000_000)).unwrap();
        engine.borrow(UserId(1), Inr(36_500)).unwrap();

        // half a day at 36,500 is 6; the top-up then runs from noon
        clock.advance(MILLIS_PER_DAY / 2);
        oracle.publish_flat(9_000_000, clock.now());
        engine.borrow(UserId(1), Inr(36_500)).unwrap();
        let loan = engine.active_loan(UserId(1)).unwrap();
        assert_eq!(loan.accrued_through, Timestamp::from_millis(MILLIS_PER_DAY / 2));

        // a day after the loan opened, the larger principal has only had half a day
        clock.advance(MILLIS_PER_DAY / 2);
        assert!(engine.accrue_interest().operations.is_empty());

        // 6 for the morning plus a full day of 73,000 at 24
        clock.advance(MILLIS_PER_DAY / 2);
        assert_eq!(engine.accrue_interest().total_booked, Inr(30));
        let loan = engine.active_loan(UserId(1)).unwrap();
        assert_eq!(loan.interest_charged, Inr(30));
        assert_eq!(loan.accrued_through, Timestamp::from_millis(3 * MILLIS_PER_DAY / 2));
        assert!(engine.audit(UserId(1)).is_ok());
    }
}
