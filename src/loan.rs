//! Loan records, the single-active-loan store, and daily interest accrual.
//!
//! Balances stay in the ledger; a [`Loan`] mirrors the collateral and debt fields after every
//! mutation and carries the interest bookkeeping the ledger does not need (exact accrued
//! interest, lifetime charges, payments, write-offs).
//!
//! Accrual is simple daily interest on the principal, `borrowed × rate / days_per_year` per
//! whole elapsed day, counted from `accrued_through`. When the principal changes, the part-day
//! since `accrued_through` is charged pro rata at the old principal and the day count restarts
//! from that moment, so a borrow late in a day pays only for the time it was outstanding. The
//! exact amount accumulates as a `Decimal`; only whole rupees are booked into the ledger. The minimum-period floor is applied on top at repayment and liquidation
//! time (see [`crate::risk::floor_top_up`]), and since both paths share `interest_charged`
//! nothing is charged twice.

use crate::config::LoanParams;
use crate::ledger::UserBalance;
use crate::risk::{self, DebtState};
use crate::types::{floor_to_i64, Inr, LoanId, Price, Sats, Timestamp, UserId, MILLIS_PER_DAY};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoanStatus {
    Active,
    Repaid,
    Liquidated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Loan {
    pub id: LoanId,
    pub user: UserId,
    pub btc_collateral_amount: Sats,
    pub inr_borrowed_amount: Inr,
    pub interest_outstanding: Inr,
    /// percent, as of the last price the engine saw
    pub ltv_ratio: Decimal,
    /// annual, fixed when the loan was opened
    pub interest_rate: Decimal,
    pub liquidation_price: Option<Price>,
    pub status: LoanStatus,
    pub accrued_interest_exact: Decimal,
    pub interest_charged: Inr,
    pub interest_paid: Inr,
    pub accrued_through: Timestamp,
    pub written_off: Inr,
    pub settings_version: u64,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub closed_at: Option<Timestamp>,
}

impl Loan {
    pub fn debt_state(&self) -> DebtState {
        DebtState {
            borrowed: self.inr_borrowed_amount,
            interest_outstanding: self.interest_outstanding,
            interest_charged: self.interest_charged,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == LoanStatus::Active
    }

    pub fn total_due(&self, params: &LoanParams) -> Inr {
        risk::total_due(&self.debt_state(), self.interest_rate, params)
    }

    pub fn interest_due(&self, params: &LoanParams) -> Inr {
        risk::minimum_interest_due(&self.debt_state(), self.interest_rate, params)
    }

    pub fn floor_top_up(&self, params: &LoanParams) -> Inr {
        risk::floor_top_up(&self.debt_state(), self.interest_rate, params)
    }

    /// Copies the ledger's loan fields and refreshes derived risk figures. a principal change
    /// restarts the day count at `now`.
    pub fn sync_from_balance(
        &mut self,
        balance: &UserBalance,
        price: Option<Price>,
        params: &LoanParams,
        now: Timestamp,
    ) {
        if balance.borrowed_inr() != self.inr_borrowed_amount {
            self.restart_accrual(now, params);
        }
        self.btc_collateral_amount = balance.collateral_btc();
        self.inr_borrowed_amount = balance.borrowed_inr();
        self.interest_outstanding = balance.interest_accrued();
        self.liquidation_price =
            risk::liquidation_price(self.inr_borrowed_amount, self.btc_collateral_amount, params);
        if let Some(price) = price {
            self.refresh_ltv(price);
        }
        self.updated_at = now;
    }

    pub fn refresh_ltv(&mut self, price: Price) {
        self.ltv_ratio =
            risk::current_ltv(self.inr_borrowed_amount, self.btc_collateral_amount, price);
    }

    /// Accrues whole days up to `now` and returns the rupees to book into the ledger.
    pub fn accrue(&mut self, now: Timestamp, params: &LoanParams) -> Inr {
        let days = self.accrued_through.whole_days_until(&now);
        if days == 0 {
            return Inr::ZERO;
        }
        let per_day = risk::daily_interest(self.inr_borrowed_amount, self.interest_rate, params);
        self.accrued_interest_exact += per_day * Decimal::from(days);
        self.accrued_through = self.accrued_through.plus_days(days);

        let booked = Inr(floor_to_i64(self.accrued_interest_exact)).saturating_sub(self.interest_charged);
        self.interest_charged = self.interest_charged + booked;
        booked
    }

    // charges the part-day since `accrued_through` at the current principal. caller has
    // already accrued the whole days
    fn restart_accrual(&mut self, now: Timestamp, params: &LoanParams) {
        let elapsed = self.accrued_through.millis_until(&now);
        if elapsed <= 0 {
            return;
        }
        let per_day = risk::daily_interest(self.inr_borrowed_amount, self.interest_rate, params);
        self.accrued_interest_exact += per_day * Decimal::from(elapsed) / Decimal::from(MILLIS_PER_DAY);
        self.accrued_through = now;
    }

    pub fn record_floor_top_up(&mut self, amount: Inr) {
        self.interest_charged = self.interest_charged + amount;
    }

    pub fn record_interest_paid(&mut self, amount: Inr) {
        self.interest_paid = self.interest_paid + amount;
    }

    pub fn close(&mut self, status: LoanStatus, now: Timestamp) {
        self.status = status;
        self.closed_at = Some(now);
        self.updated_at = now;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoanError {
    #[error("User {user:?} already has active loan {loan:?}")]
    AlreadyActive { user: UserId, loan: LoanId },

    #[error("User {0:?} has no active loan")]
    NoActiveLoan(UserId),

    #[error("Loan {0:?} not found")]
    NotFound(LoanId),
}

/// Every loan ever opened, plus an index enforcing one ACTIVE loan per user.
#[derive(Debug, Default)]
pub struct LoanBook {
    loans: BTreeMap<LoanId, Loan>,
    active: HashMap<UserId, LoanId>,
    next_id: u64,
}

impl LoanBook {
    pub fn new() -> Self {
        Self {
            loans: BTreeMap::new(),
            active: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn open(
        &mut self,
        user: UserId,
        interest_rate: Decimal,
        settings_version: u64,
        now: Timestamp,
    ) -> Result<Loan, LoanError> {
        if let Some(loan) = self.active.get(&user) {
            return Err(LoanError::AlreadyActive { user, loan: *loan });
        }
        if self.next_id == 0 {
            self.next_id = 1;
        }
        let id = LoanId(self.next_id);
        self.next_id += 1;

        let loan = Loan {
            id,
            user,
            btc_collateral_amount: Sats::ZERO,
            inr_borrowed_amount: Inr::ZERO,
            interest_outstanding: Inr::ZERO,
            ltv_ratio: Decimal::ZERO,
            interest_rate,
            liquidation_price: None,
            status: LoanStatus::Active,
            accrued_interest_exact: Decimal::ZERO,
            interest_charged: Inr::ZERO,
            interest_paid: Inr::ZERO,
            accrued_through: now,
            written_off: Inr::ZERO,
            settings_version,
            created_at: now,
            updated_at: now,
            closed_at: None,
        };
        self.loans.insert(id, loan.clone());
        self.active.insert(user, id);
        Ok(loan)
    }

    pub fn get(&self, id: LoanId) -> Option<&Loan> {
        self.loans.get(&id)
    }

    pub fn find(&self, id: LoanId) -> Result<&Loan, LoanError> {
        self.get(id).ok_or(LoanError::NotFound(id))
    }

    pub fn active_for(&self, user: UserId) -> Result<&Loan, LoanError> {
        self.active
            .get(&user)
            .and_then(|id| self.loans.get(id))
            .ok_or(LoanError::NoActiveLoan(user))
    }

    pub fn for_user(&self, user: UserId) -> Vec<Loan> {
        self.loans.values().filter(|l| l.user == user).cloned().collect()
    }

    /// (loan, user) for every ACTIVE loan, in id order.
    pub fn active_loans(&self) -> Vec<(LoanId, UserId)> {
        let mut active: Vec<(LoanId, UserId)> = self.active.iter().map(|(u, l)| (*l, *u)).collect();
        active.sort();
        active
    }

    /// Writes back a loan. a loan leaving ACTIVE drops out of the user index.
    pub fn store(&mut self, loan: Loan) {
        if loan.is_active() {
            self.active.insert(loan.user, loan.id);
        } else if self.active.get(&loan.user) == Some(&loan.id) {
            self.active.remove(&loan.user);
        }
        self.loans.insert(loan.id, loan);
    }

    // drops a loan whose opening commit failed
    pub(crate) fn discard(&mut self, id: LoanId) {
        if let Some(loan) = self.loans.remove(&id) {
            if self.active.get(&loan.user) == Some(&id) {
                self.active.remove(&loan.user);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn t_days(days: i64) -> Timestamp {
        Timestamp::from_millis(0).plus_days(days)
    }

    fn loan_with_principal(rupees: i64) -> Loan {
        let mut book = LoanBook::new();
        let mut loan = book.open(UserId(1), dec!(0.12), 1, t_days(0)).unwrap();
        loan.inr_borrowed_amount = Inr(rupees);
        loan
    }

    #[test]
    fn one_active_loan_per_user() {
        let mut book = LoanBook::new();
        let loan = book.open(UserId(1), dec!(0.12), 1, t_days(0)).unwrap();
        assert!(matches!(
            book.open(UserId(1), dec!(0.12), 1, t_days(0)),
            Err(LoanError::AlreadyActive { .. })
        ));
        assert!(book.open(UserId(2), dec!(0.12), 1, t_days(0)).is_ok());

        let mut closed = loan.clone();
        closed.close(LoanStatus::Repaid, t_days(1));
        book.store(closed);
        assert_eq!(book.active_for(UserId(1)).unwrap_err(), LoanError::NoActiveLoan(UserId(1)));
        assert_eq!(book.find(loan.id).unwrap().status, LoanStatus::Repaid);
        assert_eq!(book.find(LoanId(99)).unwrap_err(), LoanError::NotFound(LoanId(99)));
        assert!(book.open(UserId(1), dec!(0.12), 1, t_days(2)).is_ok());
        assert_eq!(book.for_user(UserId(1)).len(), 2);
    }

    #[test]
    fn accrues_whole_days_only() {
        let params = LoanParams::default();
        let mut loan = loan_with_principal(36_500);

        // 12% of 36,500 over 365 days is 12 per day
        let booked = loan.accrue(t_days(0).plus_hours(23), &params);
        assert_eq!(booked, Inr::ZERO);

        let booked = loan.accrue(t_days(2).plus_hours(5), &params);
        assert_eq!(booked, Inr(24));
        assert_eq!(loan.accrued_through, t_days(2));
        assert_eq!(loan.interest_charged, Inr(24));
    }

    #[test]
    fn fractional_interest_carries() {
        let params = LoanParams::default();
        // 10,000 at 12% is 3.287.../day
        let mut loan = loan_with_principal(10_000);
        assert_eq!(loan.accrue(t_days(1), &params), Inr(3));
        assert_eq!(loan.accrue(t_days(2), &params), Inr(3));
        assert_eq!(loan.accrue(t_days(3), &params), Inr(3));
        // day 4 crosses 13.15 so 4 rupees land
        assert_eq!(loan.accrue(t_days(4), &params), Inr(4));
        assert_eq!(loan.interest_charged, Inr(13));
    }

    #[test]
    fn floor_top_up_suppresses_later_accrual() {
        let params = LoanParams::default();
        let mut loan = loan_with_principal(36_500);
        loan.record_floor_top_up(Inr(360));

        // 10 days of time interest (120) is already covered by the 30-day floor
        assert_eq!(loan.accrue(t_days(10), &params), Inr::ZERO);
        // day 31 pushes exact interest to 372
        assert_eq!(loan.accrue(t_days(31), &params), Inr(12));
    }
}
