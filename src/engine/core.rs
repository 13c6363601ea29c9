// 8.0 engine/core.rs: main engine. owns the ledger and the three record stores, the settings
// snapshot, and the per-user locks every mutating call goes through.

use super::results::EngineError;
use crate::clock::Clock;
use crate::config::EngineSettings;
use crate::ledger::{BalanceSnapshot, ChangeSet, BalanceField, Ledger, UserBalance};
use crate::loan::{Loan, LoanBook};
use crate::operation::{Operation, OperationBook, OperationType};
use crate::plan::PlanBook;
use crate::price_feed::{PriceOracle, RateQuote};
use crate::types::{Currency, Inr, LoanId, OperationId, Sats, Timestamp, UserId};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/** 8.1: main engine struct. shared behind an Arc; every method takes &self */
pub struct Engine {
    pub(super) settings: RwLock<Arc<EngineSettings>>,
    pub(super) ledger: Ledger,
    pub(super) operations: Mutex<OperationBook>,
    pub(super) plans: Mutex<PlanBook>,
    pub(super) loans: Mutex<LoanBook>,
    pub(super) user_locks: Mutex<HashMap<UserId, Arc<Mutex<()>>>>,
    pub(super) oracle: Arc<dyn PriceOracle>,
    pub(super) clock: Arc<dyn Clock>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("settings_version", &self.settings.read().version)
            .field("ledger", &self.ledger)
            .field("operations", &self.operations.lock().len())
            .finish()
    }
}

impl Engine {
    pub fn new(
        settings: EngineSettings,
        oracle: Arc<dyn PriceOracle>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, EngineError> {
        settings.validate()?;
        Ok(Self {
            settings: RwLock::new(Arc::new(settings)),
            ledger: Ledger::new(clock.clone()),
            operations: Mutex::new(OperationBook::new()),
            plans: Mutex::new(PlanBook::new()),
            loans: Mutex::new(LoanBook::new()),
            user_locks: Mutex::new(HashMap::new()),
            oracle,
            clock,
        })
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Snapshot of the settings in force. a call keeps its snapshot even if an update lands.
    pub fn settings(&self) -> Arc<EngineSettings> {
        self.settings.read().clone()
    }

    /// Swaps in new settings. the version must move forward.
    pub fn update_settings(&self, next: EngineSettings) -> Result<Arc<EngineSettings>, EngineError> {
        next.validate()?;
        let mut current = self.settings.write();
        if next.version <= current.version {
            return Err(EngineError::SettingsConflict {
                current: current.version,
                proposed: next.version,
            });
        }
        info!(from = current.version, to = next.version, "settings updated");
        *current = Arc::new(next);
        Ok(current.clone())
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    // 8.1.1: one lock per user. held across a whole read-check-write sequence
    pub(super) fn user_scope(&self, user: UserId) -> Arc<Mutex<()>> {
        self.user_locks.lock().entry(user).or_default().clone()
    }

    pub(super) fn next_operation_id(&self) -> OperationId {
        self.operations.lock().next_id()
    }

    pub(super) fn record(&self, operation: Operation) -> Result<Operation, EngineError> {
        self.operations.lock().insert(operation.clone())?;
        Ok(operation)
    }

    // 8.1.2: fail closed. no quote, or a quote past tolerance, stops any price-dependent action
    pub(super) fn fresh_rate(
        &self,
        settings: &EngineSettings,
        now: Timestamp,
    ) -> Result<RateQuote, EngineError> {
        let quote = self.oracle.get_rate()?;
        if quote.is_stale(now, &settings.oracle) {
            let age_ms = quote.age_millis(now);
            debug!(age_ms, "rejecting stale quote");
            return Err(EngineError::StalePrice {
                age_ms,
                max_age_ms: settings.oracle.max_price_age_secs.saturating_mul(1_000),
            });
        }
        Ok(quote)
    }

    /// Current quote if fresh. the read-only surface uses this and tolerates its absence.
    pub fn current_rate(&self) -> Result<RateQuote, EngineError> {
        let settings = self.settings();
        self.fresh_rate(&settings, self.now())
    }

    pub fn open_account(&self, user: UserId) -> bool {
        let created = self.ledger.open_account(user);
        if created {
            info!(user = user.0, "account opened");
        }
        created
    }

    pub fn balance(&self, user: UserId) -> Result<UserBalance, EngineError> {
        Ok(self.ledger.balance(user)?)
    }

    pub(super) fn ensure_account(&self, user: UserId) -> Result<(), EngineError> {
        if self.ledger.has_account(user) {
            Ok(())
        } else {
            Err(EngineError::AccountNotFound(user))
        }
    }

    /// Credits external funds to available balance. opens the account on first deposit.
    pub fn deposit(&self, user: UserId, currency: Currency, amount: i64) -> Result<Operation, EngineError> {
        if amount <= 0 {
            return Err(EngineError::InvalidAmount(format!("deposit of {amount}")));
        }
        self.open_account(user);
        let settings = self.settings();
        let scope = self.user_scope(user);
        let _guard = scope.lock();

        let now = self.now();
        let id = self.next_operation_id();
        let change = ChangeSet::new()
            .credit(BalanceField::available(currency), amount)
            .with_reference(id);
        let event = self.ledger.commit(user, change)?;

        let op = Operation::new(id, user, OperationType::deposit(currency), settings.version, now)
            .with_amounts(inr_part(currency, amount), sats_part(currency, amount))
            .executed(None, BalanceSnapshot::from(&event.balances_after), now);
        info!(user = user.0, %currency, amount, "deposit");
        self.record(op)
    }

    /// Debits available balance. reserved and collateral funds are never withdrawable.
    pub fn withdraw(&self, user: UserId, currency: Currency, amount: i64) -> Result<Operation, EngineError> {
        if amount <= 0 {
            return Err(EngineError::InvalidAmount(format!("withdrawal of {amount}")));
        }
        self.ensure_account(user)?;
        let settings = self.settings();
        let scope = self.user_scope(user);
        let _guard = scope.lock();

        let now = self.now();
        let available = self.ledger.balance(user)?.get(BalanceField::available(currency));
        if available < amount {
            return Err(EngineError::InsufficientFunds {
                currency,
                requested: amount,
                available,
            });
        }
        let id = self.next_operation_id();
        let change = ChangeSet::new()
            .debit(BalanceField::available(currency), amount)
            .with_reference(id);
        let event = self.ledger.commit(user, change)?;

        let op = Operation::new(id, user, OperationType::withdraw(currency), settings.version, now)
            .with_amounts(inr_part(currency, amount), sats_part(currency, amount))
            .executed(None, BalanceSnapshot::from(&event.balances_after), now);
        info!(user = user.0, %currency, amount, "withdrawal");
        self.record(op)
    }

    pub fn operation(&self, id: OperationId) -> Option<Operation> {
        self.operations.lock().get(id).cloned()
    }

    /// A user's operation history, oldest first.
    pub fn operations(&self, user: UserId) -> Vec<Operation> {
        self.operations.lock().for_user(user)
    }

    pub fn pending_orders(&self, user: UserId) -> Vec<Operation> {
        self.operations.lock().pending_limit_orders_for(user)
    }

    pub fn active_loan(&self, user: UserId) -> Result<Loan, EngineError> {
        Ok(self.loans.lock().active_for(user)?.clone())
    }

    pub fn loans(&self, user: UserId) -> Vec<Loan> {
        self.loans.lock().for_user(user)
    }

    /// One of the user's loans by id, in any status. another user's loan reads as not found.
    pub fn loan(&self, user: UserId, id: LoanId) -> Result<Loan, EngineError> {
        let loan = self.loans.lock().find(id)?.clone();
        if loan.user != user {
            return Err(EngineError::LoanNotFound(id));
        }
        Ok(loan)
    }

    /// Replays the user's events and checks them against the live balance.
    pub fn audit(&self, user: UserId) -> Result<(), EngineError> {
        Ok(self.ledger.verify(user)?)
    }
}

pub(super) fn inr_part(currency: Currency, amount: i64) -> Inr {
    match currency {
        Currency::Inr => Inr(amount),
        Currency::Btc => Inr::ZERO,
    }
}

pub(super) fn sats_part(currency: Currency, amount: i64) -> Sats {
    match currency {
        Currency::Inr => Sats::ZERO,
        Currency::Btc => Sats(amount),
    }
}
