//! Balance ledger: the single owner of user fund state.
//!
//! Every balance field is private to this module. Other components describe what they want
//! through the four primitives (`reserve`, `release`, `commit`, `adjust`) and the ledger
//! either applies the whole change or none of it. Each applied change appends one
//! [`LedgerEvent`], so any balance can be rebuilt from the log.
//!
//! Accounts are locked individually. Two mutations for the same user never interleave, while
//! different users proceed in parallel.

use crate::clock::Clock;
use crate::events::{EntryKind, EventEmitter, EventLog, FieldDelta, LedgerEvent};
use crate::types::{Currency, Inr, OperationId, Sats, UserId};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceField {
    AvailableInr,
    AvailableBtc,
    ReservedInr,
    ReservedBtc,
    CollateralBtc,
    BorrowedInr,
    InterestAccrued,
}

impl BalanceField {
    pub const ALL: [BalanceField; 7] = [
        BalanceField::AvailableInr,
        BalanceField::AvailableBtc,
        BalanceField::ReservedInr,
        BalanceField::ReservedBtc,
        BalanceField::CollateralBtc,
        BalanceField::BorrowedInr,
        BalanceField::InterestAccrued,
    ];

    pub fn available(currency: Currency) -> Self {
        match currency {
            Currency::Inr => BalanceField::AvailableInr,
            Currency::Btc => BalanceField::AvailableBtc,
        }
    }

    pub fn reserved(currency: Currency) -> Self {
        match currency {
            Currency::Inr => BalanceField::ReservedInr,
            Currency::Btc => BalanceField::ReservedBtc,
        }
    }

    pub fn currency(&self) -> Currency {
        match self {
            BalanceField::AvailableBtc | BalanceField::ReservedBtc | BalanceField::CollateralBtc => {
                Currency::Btc
            }
            _ => Currency::Inr,
        }
    }
}

impl fmt::Display for BalanceField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BalanceField::AvailableInr => "available_inr",
            BalanceField::AvailableBtc => "available_btc",
            BalanceField::ReservedInr => "reserved_inr",
            BalanceField::ReservedBtc => "reserved_btc",
            BalanceField::CollateralBtc => "collateral_btc",
            BalanceField::BorrowedInr => "borrowed_inr",
            BalanceField::InterestAccrued => "interest_accrued",
        };
        write!(f, "{name}")
    }
}

/// Per-user fund state. INR fields are whole rupees, BTC fields are satoshis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UserBalance {
    available_inr: i64,
    available_btc: i64,
    reserved_inr: i64,
    reserved_btc: i64,
    collateral_btc: i64,
    borrowed_inr: i64,
    interest_accrued: i64,
    version: u64,
}

impl UserBalance {
    pub fn available_inr(&self) -> Inr {
        Inr(self.available_inr)
    }

    pub fn available_btc(&self) -> Sats {
        Sats(self.available_btc)
    }

    pub fn reserved_inr(&self) -> Inr {
        Inr(self.reserved_inr)
    }

    pub fn reserved_btc(&self) -> Sats {
        Sats(self.reserved_btc)
    }

    pub fn collateral_btc(&self) -> Sats {
        Sats(self.collateral_btc)
    }

    pub fn borrowed_inr(&self) -> Inr {
        Inr(self.borrowed_inr)
    }

    pub fn interest_accrued(&self) -> Inr {
        Inr(self.interest_accrued)
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// available + reserved INR
    pub fn inr_balance(&self) -> Inr {
        Inr(self.available_inr + self.reserved_inr)
    }

    /// available + reserved BTC. collateral is tracked separately.
    pub fn btc_balance(&self) -> Sats {
        Sats(self.available_btc + self.reserved_btc)
    }

    pub fn get(&self, field: BalanceField) -> i64 {
        match field {
            BalanceField::AvailableInr => self.available_inr,
            BalanceField::AvailableBtc => self.available_btc,
            BalanceField::ReservedInr => self.reserved_inr,
            BalanceField::ReservedBtc => self.reserved_btc,
            BalanceField::CollateralBtc => self.collateral_btc,
            BalanceField::BorrowedInr => self.borrowed_inr,
            BalanceField::InterestAccrued => self.interest_accrued,
        }
    }

    fn slot(&mut self, field: BalanceField) -> &mut i64 {
        match field {
            BalanceField::AvailableInr => &mut self.available_inr,
            BalanceField::AvailableBtc => &mut self.available_btc,
            BalanceField::ReservedInr => &mut self.reserved_inr,
            BalanceField::ReservedBtc => &mut self.reserved_btc,
            BalanceField::CollateralBtc => &mut self.collateral_btc,
            BalanceField::BorrowedInr => &mut self.borrowed_inr,
            BalanceField::InterestAccrued => &mut self.interest_accrued,
        }
    }

    // applies to a copy. the caller swaps it in only if every field stayed non-negative
    fn apply(&self, user: UserId, deltas: &[FieldDelta]) -> Result<UserBalance, LedgerError> {
        let mut next = *self;
        for d in deltas {
            let slot = next.slot(d.field);
            *slot = slot.checked_add(d.delta).ok_or(LedgerError::InvariantViolation {
                user,
                field: d.field,
                resulting: if d.delta < 0 { i64::MIN } else { i64::MAX },
            })?;
        }
        for field in BalanceField::ALL {
            let value = next.get(field);
            if value < 0 {
                return Err(LedgerError::InvariantViolation {
                    user,
                    field,
                    resulting: value,
                });
            }
        }
        next.version += 1;
        Ok(next)
    }
}

/// Balance totals copied onto operation rows for history display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub inr_balance: Inr,
    pub btc_balance: Sats,
    pub collateral_btc: Sats,
    pub borrowed_inr: Inr,
}

impl From<&UserBalance> for BalanceSnapshot {
    fn from(balance: &UserBalance) -> Self {
        Self {
            inr_balance: balance.inr_balance(),
            btc_balance: balance.btc_balance(),
            collateral_btc: balance.collateral_btc(),
            borrowed_inr: balance.borrowed_inr(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Posting {
    pub field: BalanceField,
    pub amount: i64,
}

/// A set of debits and credits applied by `commit` as one unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    debits: Vec<Posting>,
    credits: Vec<Posting>,
    reference: Option<OperationId>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn debit(mut self, field: BalanceField, amount: i64) -> Self {
        self.debits.push(Posting { field, amount });
        self
    }

    pub fn credit(mut self, field: BalanceField, amount: i64) -> Self {
        self.credits.push(Posting { field, amount });
        self
    }

    pub fn with_reference(mut self, reference: OperationId) -> Self {
        self.reference = Some(reference);
        self
    }

    pub fn reference(&self) -> Option<OperationId> {
        self.reference
    }

    pub fn is_empty(&self) -> bool {
        self.debits.iter().chain(&self.credits).all(|p| p.amount == 0)
    }

    fn validate(&self) -> Result<(), LedgerError> {
        if let Some(bad) = self.debits.iter().chain(&self.credits).find(|p| p.amount < 0) {
            return Err(LedgerError::InvalidAmount { amount: bad.amount });
        }
        if self.is_empty() {
            return Err(LedgerError::InvalidAmount { amount: 0 });
        }
        Ok(())
    }

    /// Signed per-field deltas; zero postings are dropped.
    pub fn deltas(&self) -> Vec<FieldDelta> {
        let credits = self.credits.iter().map(|p| FieldDelta {
            field: p.field,
            delta: p.amount,
        });
        let debits = self.debits.iter().map(|p| FieldDelta {
            field: p.field,
            delta: -p.amount,
        });
        credits.chain(debits).filter(|d| d.delta != 0).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("Account {0:?} not found")]
    AccountNotFound(UserId),

    #[error("Insufficient {currency} funds: requested {requested}, available {available}")]
    InsufficientFunds {
        user: UserId,
        currency: Currency,
        requested: i64,
        available: i64,
    },

    #[error("Invariant violation for {user:?}: {field} would become {resulting}")]
    InvariantViolation {
        user: UserId,
        field: BalanceField,
        resulting: i64,
    },

    #[error("Invalid amount {amount}")]
    InvalidAmount { amount: i64 },

    #[error("Audit mismatch for {0:?}: replayed balance differs from live balance")]
    AuditMismatch(UserId),
}

pub struct Ledger {
    accounts: RwLock<HashMap<UserId, Arc<Mutex<UserBalance>>>>,
    log: Mutex<EventLog>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for Ledger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ledger")
            .field("accounts", &self.accounts.read().len())
            .field("events", &self.log.lock().len())
            .finish()
    }
}

impl Ledger {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            log: Mutex::new(EventLog::new()),
            clock,
        }
    }

    /// Creates an empty account. returns false if it already existed.
    pub fn open_account(&self, user: UserId) -> bool {
        let mut accounts = self.accounts.write();
        if accounts.contains_key(&user) {
            return false;
        }
        accounts.insert(user, Arc::new(Mutex::new(UserBalance::default())));
        true
    }

    pub fn has_account(&self, user: UserId) -> bool {
        self.accounts.read().contains_key(&user)
    }

    pub fn users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.accounts.read().keys().copied().collect();
        users.sort();
        users
    }

    pub fn balance(&self, user: UserId) -> Result<UserBalance, LedgerError> {
        let account = self.account(user)?;
        let balance = *account.lock();
        Ok(balance)
    }

    /// Moves `amount` from available to reserved.
    pub fn reserve(
        &self,
        user: UserId,
        currency: Currency,
        amount: i64,
        reference: Option<OperationId>,
    ) -> Result<LedgerEvent, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount { amount });
        }
        self.mutate(user, EntryKind::Reserve, reference, |balance| {
            let available = balance.get(BalanceField::available(currency));
            if available < amount {
                return Err(LedgerError::InsufficientFunds {
                    user,
                    currency,
                    requested: amount,
                    available,
                });
            }
            Ok(vec![
                FieldDelta { field: BalanceField::available(currency), delta: -amount },
                FieldDelta { field: BalanceField::reserved(currency), delta: amount },
            ])
        })
    }

    /// Moves `amount` from reserved back to available.
    pub fn release(
        &self,
        user: UserId,
        currency: Currency,
        amount: i64,
        reference: Option<OperationId>,
    ) -> Result<LedgerEvent, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount { amount });
        }
        self.mutate(user, EntryKind::Release, reference, |_| {
            Ok(vec![
                FieldDelta { field: BalanceField::reserved(currency), delta: -amount },
                FieldDelta { field: BalanceField::available(currency), delta: amount },
            ])
        })
    }

    pub fn commit(&self, user: UserId, change: ChangeSet) -> Result<LedgerEvent, LedgerError> {
        change.validate()?;
        let deltas = change.deltas();
        self.mutate(user, EntryKind::Commit, change.reference(), move |_| Ok(deltas))
    }

    pub fn adjust(
        &self,
        user: UserId,
        field: BalanceField,
        delta: i64,
        reference: Option<OperationId>,
    ) -> Result<LedgerEvent, LedgerError> {
        if delta == 0 {
            return Err(LedgerError::InvalidAmount { amount: 0 });
        }
        self.mutate(user, EntryKind::Adjust, reference, |_| {
            Ok(vec![FieldDelta { field, delta }])
        })
    }

    pub fn events_for(&self, user: UserId) -> Vec<LedgerEvent> {
        self.log.lock().for_user(user)
    }

    pub fn events_for_reference(&self, reference: OperationId) -> Vec<LedgerEvent> {
        self.log.lock().for_reference(reference)
    }

    pub fn event_count(&self) -> usize {
        self.log.lock().len()
    }

    /// Rebuilds a balance by folding the user's events from zero.
    pub fn replay(&self, user: UserId) -> Result<UserBalance, LedgerError> {
        let events = self.events_for(user);
        let mut balance = UserBalance::default();
        for event in &events {
            balance = balance.apply(user, &event.deltas)?;
        }
        Ok(balance)
    }

    pub fn verify(&self, user: UserId) -> Result<(), LedgerError> {
        // hold the account lock so no event lands between the two reads
        let account = self.account(user)?;
        let live = account.lock();
        let replayed = self.replay(user)?;
        if replayed != *live {
            return Err(LedgerError::AuditMismatch(user));
        }
        Ok(())
    }

    fn account(&self, user: UserId) -> Result<Arc<Mutex<UserBalance>>, LedgerError> {
        self.accounts
            .read()
            .get(&user)
            .cloned()
            .ok_or(LedgerError::AccountNotFound(user))
    }

    fn mutate<F>(
        &self,
        user: UserId,
        kind: EntryKind,
        reference: Option<OperationId>,
        build: F,
    ) -> Result<LedgerEvent, LedgerError>
    where
        F: FnOnce(&UserBalance) -> Result<Vec<FieldDelta>, LedgerError>,
    {
        let account = self.account(user)?;
        let mut balance = account.lock();
        let deltas = build(&*balance)?;
        let next = balance.apply(user, &deltas)?;
        *balance = next;

        let mut log = self.log.lock();
        let event = LedgerEvent {
            id: log.next_id(),
            user,
            timestamp: self.clock.now(),
            kind,
            deltas,
            balances_after: next,
            reference,
        };
        log.emit(event.clone());
        Ok(event)
    }
}
