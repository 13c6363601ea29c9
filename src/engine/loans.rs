//! Collateralised INR loans: open, add collateral, borrow, repay, close, partial liquidation.
//!
//! Each action runs under the user's scope lock, brings interest current first, then applies
//! one ledger commit. The [`Loan`] record is re-synced from the balance the commit produced.

use super::core::Engine;
use super::orders::validate_order_amount;
use super::results::EngineError;
use crate::config::EngineSettings;
use crate::ledger::{BalanceField, BalanceSnapshot, ChangeSet};
use crate::loan::{Loan, LoanStatus};
use crate::operation::{Operation, OperationType, TradeSide};
use crate::risk;
use crate::types::{Currency, Inr, Price, Sats, Timestamp, UserId};
use tracing::{info, warn};

/// Debt figures at the moment of a payment, with the floor top-up already folded in.
struct DebtDue {
    top_up: Inr,
    interest_due: Inr,
    principal: Inr,
}

impl DebtDue {
    fn of(loan: &Loan, settings: &EngineSettings) -> Self {
        let top_up = loan.floor_top_up(&settings.loans);
        Self {
            top_up,
            interest_due: loan.interest_outstanding + top_up,
            principal: loan.inr_borrowed_amount,
        }
    }

    fn total(&self) -> Inr {
        self.interest_due + self.principal
    }
}

impl Engine {
    fn active_loan_locked(&self, user: UserId) -> Result<Loan, EngineError> {
        Ok(self.loans.lock().active_for(user)?.clone())
    }

    // best-effort price for the LTV figure on the record. loan actions that don't depend on
    // price still go through when the oracle is down
    fn sell_rate_hint(&self, settings: &EngineSettings, now: Timestamp) -> Option<Price> {
        self.fresh_rate(settings, now).ok().map(|q| q.sell_rate)
    }

    /// Opens the user's loan and locks `collateral` sats out of available BTC.
    pub fn create_loan(&self, user: UserId, collateral: Sats) -> Result<Operation, EngineError> {
        if !collateral.is_positive() {
            return Err(EngineError::InvalidAmount(format!("collateral of {collateral}")));
        }
        self.ensure_account(user)?;
        let settings = self.settings();
        let scope = self.user_scope(user);
        let _guard = scope.lock();

        let now = self.now();
        let available = self.ledger.balance(user)?.available_btc();
        if available < collateral {
            return Err(EngineError::InsufficientFunds {
                currency: Currency::Btc,
                requested: collateral.value(),
                available: available.value(),
            });
        }

        let mut loan = self.loans.lock().open(
            user,
            settings.loans.annual_interest_rate,
            settings.version,
            now,
        )?;
        let id = self.next_operation_id();
        let change = ChangeSet::new()
            .debit(BalanceField::AvailableBtc, collateral.value())
            .credit(BalanceField::CollateralBtc, collateral.value())
            .with_reference(id);
        let event = match self.ledger.commit(user, change) {
            Ok(event) => event,
            Err(err) => {
                self.loans.lock().discard(loan.id);
                return Err(err.into());
            }
        };

        loan.sync_from_balance(
            &event.balances_after,
            self.sell_rate_hint(&settings, now),
            &settings.loans,
            now,
        );
        self.loans.lock().store(loan.clone());

        let op = Operation::new(id, user, OperationType::LoanCreate, settings.version, now)
            .with_amounts(Inr::ZERO, collateral)
            .with_loan(loan.id)
            .executed(None, BalanceSnapshot::from(&event.balances_after), now);
        info!(user = user.0, loan = loan.id.0, sats = collateral.value(), "loan opened");
        self.record(op)
    }

    pub fn add_collateral(&self, user: UserId, amount: Sats) -> Result<Operation, EngineError> {
        if !amount.is_positive() {
            return Err(EngineError::InvalidAmount(format!("collateral of {amount}")));
        }
        let settings = self.settings();
        let scope = self.user_scope(user);
        let _guard = scope.lock();

        let now = self.now();
        let mut loan = self.active_loan_locked(user)?;
        self.bring_interest_current(user, &mut loan, &settings, now)?;

        let available = self.ledger.balance(user)?.available_btc();
        if available < amount {
            return Err(EngineError::InsufficientFunds {
                currency: Currency::Btc,
                requested: amount.value(),
                available: available.value(),
            });
        }
        let id = self.next_operation_id();
        let event = self.ledger.commit(
            user,
            ChangeSet::new()
                .debit(BalanceField::AvailableBtc, amount.value())
                .credit(BalanceField::CollateralBtc, amount.value())
                .with_reference(id),
        )?;
        loan.sync_from_balance(
            &event.balances_after,
            self.sell_rate_hint(&settings, now),
            &settings.loans,
            now,
        );
        self.loans.lock().store(loan.clone());

        let op = Operation::new(id, user, OperationType::LoanAddCollateral, settings.version, now)
            .with_amounts(Inr::ZERO, amount)
            .with_loan(loan.id)
            .executed(None, BalanceSnapshot::from(&event.balances_after), now);
        info!(user = user.0, loan = loan.id.0, sats = amount.value(), "collateral added");
        self.record(op)
    }

    /// Draws INR against collateral, up to the origination cap at the current sell rate.
    pub fn borrow(&self, user: UserId, amount: Inr) -> Result<Operation, EngineError> {
        if !amount.is_positive() {
            return Err(EngineError::InvalidAmount(format!("borrow of {amount}")));
        }
        let settings = self.settings();
        let scope = self.user_scope(user);
        let _guard = scope.lock();

        let now = self.now();
        let mut loan = self.active_loan_locked(user)?;
        let quote = self.fresh_rate(&settings, now)?;
        self.bring_interest_current(user, &mut loan, &settings, now)?;

        let capacity = risk::available_to_borrow(
            loan.inr_borrowed_amount,
            loan.btc_collateral_amount,
            quote.sell_rate,
            &settings.loans,
        );
        if amount > capacity {
            return Err(EngineError::LtvExceeded {
                requested: amount,
                available: capacity,
            });
        }

        let id = self.next_operation_id();
        let event = self.ledger.commit(
            user,
            ChangeSet::new()
                .credit(BalanceField::BorrowedInr, amount.value())
                .credit(BalanceField::AvailableInr, amount.value())
                .with_reference(id),
        )?;
        loan.sync_from_balance(&event.balances_after, Some(quote.sell_rate), &settings.loans, now);
        self.loans.lock().store(loan.clone());

        let op = Operation::new(id, user, OperationType::LoanBorrow, settings.version, now)
            .with_amounts(amount, Sats::ZERO)
            .with_loan(loan.id)
            .executed(Some(quote.sell_rate), BalanceSnapshot::from(&event.balances_after), now);
        info!(
            user = user.0,
            loan = loan.id.0,
            rupees = amount.value(),
            ltv = %loan.ltv_ratio.round_dp(2),
            "borrowed"
        );
        self.record(op)
    }

    /// Pays down the loan from available INR, interest first. paying the full amount due
    /// closes the loan and returns the collateral in the same commit.
    pub fn repay(&self, user: UserId, amount: Inr) -> Result<Operation, EngineError> {
        if !amount.is_positive() {
            return Err(EngineError::InvalidAmount(format!("repayment of {amount}")));
        }
        let settings = self.settings();
        let scope = self.user_scope(user);
        let _guard = scope.lock();

        let now = self.now();
        let mut loan = self.active_loan_locked(user)?;
        self.bring_interest_current(user, &mut loan, &settings, now)?;

        let due = DebtDue::of(&loan, &settings);
        if !due.total().is_positive() {
            return Err(EngineError::InvalidAmount("loan has nothing to repay".to_string()));
        }
        if amount > due.total() {
            return Err(EngineError::InvalidAmount(format!(
                "repayment of {amount} exceeds total due {}",
                due.total()
            )));
        }
        let available = self.ledger.balance(user)?.available_inr();
        if available < amount {
            return Err(EngineError::InsufficientFunds {
                currency: Currency::Inr,
                requested: amount.value(),
                available: available.value(),
            });
        }

        let split = risk::allocate_payment(amount, due.interest_due, due.principal);
        let closes = amount == due.total();
        let returned = if closes { loan.btc_collateral_amount } else { Sats::ZERO };

        let id = self.next_operation_id();
        let change = ChangeSet::new()
            .debit(BalanceField::AvailableInr, amount.value())
            .credit(BalanceField::InterestAccrued, due.top_up.value())
            .debit(BalanceField::InterestAccrued, split.to_interest.value())
            .debit(BalanceField::BorrowedInr, split.to_principal.value())
            .debit(BalanceField::CollateralBtc, returned.value())
            .credit(BalanceField::AvailableBtc, returned.value())
            .with_reference(id);
        let event = self.ledger.commit(user, change)?;

        loan.record_floor_top_up(due.top_up);
        loan.record_interest_paid(split.to_interest);
        loan.sync_from_balance(
            &event.balances_after,
            self.sell_rate_hint(&settings, now),
            &settings.loans,
            now,
        );
        if closes {
            loan.close(LoanStatus::Repaid, now);
        }
        self.loans.lock().store(loan.clone());

        let op = Operation::new(id, user, OperationType::LoanRepay, settings.version, now)
            .with_amounts(amount, returned)
            .with_loan(loan.id)
            .executed(None, BalanceSnapshot::from(&event.balances_after), now);
        info!(
            user = user.0,
            loan = loan.id.0,
            rupees = amount.value(),
            to_interest = split.to_interest.value(),
            to_principal = split.to_principal.value(),
            closed = closes,
            "repayment"
        );
        self.record(op)
    }

    /// Closes a loan with no debt left and hands back any collateral.
    pub fn close_loan(&self, user: UserId) -> Result<Operation, EngineError> {
        let settings = self.settings();
        let scope = self.user_scope(user);
        let _guard = scope.lock();

        let now = self.now();
        let mut loan = self.active_loan_locked(user)?;
        self.bring_interest_current(user, &mut loan, &settings, now)?;

        let due = DebtDue::of(&loan, &settings).total();
        if due.is_positive() {
            return Err(EngineError::InvalidAmount(format!("loan still owes {due}")));
        }

        let id = self.next_operation_id();
        let returned = loan.btc_collateral_amount;
        let snapshot = if returned.is_positive() {
            let event = self.ledger.commit(
                user,
                ChangeSet::new()
                    .debit(BalanceField::CollateralBtc, returned.value())
                    .credit(BalanceField::AvailableBtc, returned.value())
                    .with_reference(id),
            )?;
            loan.sync_from_balance(&event.balances_after, None, &settings.loans, now);
            BalanceSnapshot::from(&event.balances_after)
        } else {
            BalanceSnapshot::from(&self.ledger.balance(user)?)
        };
        loan.close(LoanStatus::Repaid, now);
        self.loans.lock().store(loan.clone());

        let op = Operation::new(id, user, OperationType::LoanRepay, settings.version, now)
            .with_amounts(Inr::ZERO, returned)
            .with_loan(loan.id)
            .executed(None, snapshot, now);
        info!(user = user.0, loan = loan.id.0, sats = returned.value(), "loan closed");
        self.record(op)
    }

    /// Sells `sats` of collateral at the sell rate and applies the proceeds to the debt.
    /// proceeds beyond the debt go to available INR; if they clear it the loan closes.
    pub fn partial_liquidate(&self, user: UserId, sats: Sats) -> Result<Operation, EngineError> {
        let settings = self.settings();
        validate_order_amount(TradeSide::Sell, sats.value(), &settings.orders)?;
        let scope = self.user_scope(user);
        let _guard = scope.lock();

        let now = self.now();
        let mut loan = self.active_loan_locked(user)?;
        let quote = self.fresh_rate(&settings, now)?;
        self.bring_interest_current(user, &mut loan, &settings, now)?;

        if sats > loan.btc_collateral_amount {
            return Err(EngineError::InvalidAmount(format!(
                "{sats} exceeds collateral of {}",
                loan.btc_collateral_amount
            )));
        }
        let proceeds = quote.sell_rate.sats_to_inr(sats);
        if !proceeds.is_positive() {
            return Err(EngineError::InvalidAmount(format!(
                "{sats} rounds to nothing at {}",
                quote.sell_rate
            )));
        }
        let due = DebtDue::of(&loan, &settings);
        let split = risk::allocate_payment(proceeds, due.interest_due, due.principal);
        let cleared = split.to_interest == due.interest_due && split.to_principal == due.principal;
        let remaining = loan.btc_collateral_amount - sats;
        if !remaining.is_positive() && !cleared {
            return Err(EngineError::InvalidAmount(
                "selling all collateral leaves debt behind; use full liquidation".to_string(),
            ));
        }
        let returned = if cleared { remaining } else { Sats::ZERO };

        let id = self.next_operation_id();
        let change = ChangeSet::new()
            .debit(BalanceField::CollateralBtc, sats.value())
            .credit(BalanceField::InterestAccrued, due.top_up.value())
            .debit(BalanceField::InterestAccrued, split.to_interest.value())
            .debit(BalanceField::BorrowedInr, split.to_principal.value())
            .credit(BalanceField::AvailableInr, split.surplus.value())
            .debit(BalanceField::CollateralBtc, returned.value())
            .credit(BalanceField::AvailableBtc, returned.value())
            .with_reference(id);
        let event = self.ledger.commit(user, change)?;

        loan.record_floor_top_up(due.top_up);
        loan.record_interest_paid(split.to_interest);
        loan.sync_from_balance(&event.balances_after, Some(quote.sell_rate), &settings.loans, now);
        if cleared {
            loan.close(LoanStatus::Repaid, now);
        }
        self.loans.lock().store(loan.clone());

        let op = Operation::new(id, user, OperationType::PartialLiquidation, settings.version, now)
            .with_amounts(proceeds, sats)
            .with_loan(loan.id)
            .executed(Some(quote.sell_rate), BalanceSnapshot::from(&event.balances_after), now);
        warn!(
            user = user.0,
            loan = loan.id.0,
            sats = sats.value(),
            proceeds = proceeds.value(),
            closed = cleared,
            "partial liquidation"
        );
        self.record(op)
    }
}
