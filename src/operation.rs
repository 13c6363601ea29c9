//! Operation records and their status machine.
//!
//! An operation is the history row for one ledger-affecting action. Market trades, loan
//! actions, deposits and withdrawals are written straight to EXECUTED. Limit orders and DCA
//! installments start PENDING and move exactly once to EXECUTED, CANCELLED or EXPIRED.
//! Terminal rows never change again.

use crate::ledger::BalanceSnapshot;
use crate::types::{Currency, Inr, LoanId, OperationId, PlanId, Price, Sats, Timestamp, UserId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
    MarketBuy,
    MarketSell,
    LimitBuy,
    LimitSell,
    DcaBuy,
    DcaSell,
    LoanCreate,
    LoanBorrow,
    LoanRepay,
    LoanAddCollateral,
    PartialLiquidation,
    FullLiquidation,
    InterestAccrual,
    DepositInr,
    DepositBtc,
    WithdrawInr,
    WithdrawBtc,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::MarketBuy => "MARKET_BUY",
            OperationType::MarketSell => "MARKET_SELL",
            OperationType::LimitBuy => "LIMIT_BUY",
            OperationType::LimitSell => "LIMIT_SELL",
            OperationType::DcaBuy => "DCA_BUY",
            OperationType::DcaSell => "DCA_SELL",
            OperationType::LoanCreate => "LOAN_CREATE",
            OperationType::LoanBorrow => "LOAN_BORROW",
            OperationType::LoanRepay => "LOAN_REPAY",
            OperationType::LoanAddCollateral => "LOAN_ADD_COLLATERAL",
            OperationType::PartialLiquidation => "PARTIAL_LIQUIDATION",
            OperationType::FullLiquidation => "FULL_LIQUIDATION",
            OperationType::InterestAccrual => "INTEREST_ACCRUAL",
            OperationType::DepositInr => "DEPOSIT_INR",
            OperationType::DepositBtc => "DEPOSIT_BTC",
            OperationType::WithdrawInr => "WITHDRAW_INR",
            OperationType::WithdrawBtc => "WITHDRAW_BTC",
        }
    }

    pub fn is_limit(&self) -> bool {
        matches!(self, OperationType::LimitBuy | OperationType::LimitSell)
    }

    /// Side of a trade-like operation. None for loan, deposit and withdrawal operations.
    pub fn trade_side(&self) -> Option<TradeSide> {
        match self {
            OperationType::MarketBuy | OperationType::LimitBuy | OperationType::DcaBuy => {
                Some(TradeSide::Buy)
            }
            OperationType::MarketSell | OperationType::LimitSell | OperationType::DcaSell => {
                Some(TradeSide::Sell)
            }
            _ => None,
        }
    }

    pub fn deposit(currency: Currency) -> Self {
        match currency {
            Currency::Inr => OperationType::DepositInr,
            Currency::Btc => OperationType::DepositBtc,
        }
    }

    pub fn withdraw(currency: Currency) -> Self {
        match currency {
            Currency::Inr => OperationType::WithdrawInr,
            Currency::Btc => OperationType::WithdrawBtc,
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown operation type: {0}")]
pub struct UnknownOperationType(pub String);

impl FromStr for OperationType {
    type Err = UnknownOperationType;

    // accepts the legacy BUY/SELL tags and maps them onto the market variants
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tag = s.trim().to_ascii_uppercase();
        let parsed = match tag.as_str() {
            "BUY" | "MARKET_BUY" => OperationType::MarketBuy,
            "SELL" | "MARKET_SELL" => OperationType::MarketSell,
            "LIMIT_BUY" => OperationType::LimitBuy,
            "LIMIT_SELL" => OperationType::LimitSell,
            "DCA_BUY" => OperationType::DcaBuy,
            "DCA_SELL" => OperationType::DcaSell,
            "LOAN_CREATE" => OperationType::LoanCreate,
            "LOAN_BORROW" => OperationType::LoanBorrow,
            "LOAN_REPAY" => OperationType::LoanRepay,
            "LOAN_ADD_COLLATERAL" => OperationType::LoanAddCollateral,
            "PARTIAL_LIQUIDATION" => OperationType::PartialLiquidation,
            "FULL_LIQUIDATION" => OperationType::FullLiquidation,
            "INTEREST_ACCRUAL" => OperationType::InterestAccrual,
            "DEPOSIT_INR" => OperationType::DepositInr,
            "DEPOSIT_BTC" => OperationType::DepositBtc,
            "WITHDRAW_INR" => OperationType::WithdrawInr,
            "WITHDRAW_BTC" => OperationType::WithdrawBtc,
            _ => return Err(UnknownOperationType(s.to_string())),
        };
        Ok(parsed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    /// Currency the user gives up.
    pub fn source(&self) -> Currency {
        match self {
            TradeSide::Buy => Currency::Inr,
            TradeSide::Sell => Currency::Btc,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    Pending,
    Executed,
    Cancelled,
    Expired,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OperationStatus::Pending)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    UserRequested,
    AdminRequested,
    Expired,
    InsufficientFunds,
    ExecutionFailed,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            CancelReason::UserRequested => "user_requested",
            CancelReason::AdminRequested => "admin_requested",
            CancelReason::Expired => "expired",
            CancelReason::InsufficientFunds => "insufficient_funds",
            CancelReason::ExecutionFailed => "execution_failed",
        };
        f.write_str(reason)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    pub user: UserId,
    pub op_type: OperationType,
    pub status: OperationStatus,
    pub inr_amount: Inr,
    pub btc_amount: Sats,
    pub execution_price: Option<Price>,
    pub limit_price: Option<Price>,
    pub parent_id: Option<PlanId>,
    pub loan_id: Option<LoanId>,
    pub cancel_reason: Option<CancelReason>,
    pub balances_after: Option<BalanceSnapshot>,
    pub settings_version: u64,
    pub created_at: Timestamp,
    pub executed_at: Option<Timestamp>,
    pub updated_at: Timestamp,
}

impl Operation {
    pub fn new(
        id: OperationId,
        user: UserId,
        op_type: OperationType,
        settings_version: u64,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            id,
            user,
            op_type,
            status: OperationStatus::Pending,
            inr_amount: Inr::ZERO,
            btc_amount: Sats::ZERO,
            execution_price: None,
            limit_price: None,
            parent_id: None,
            loan_id: None,
            cancel_reason: None,
            balances_after: None,
            settings_version,
            created_at: timestamp,
            executed_at: None,
            updated_at: timestamp,
        }
    }

    pub fn with_amounts(mut self, inr: Inr, btc: Sats) -> Self {
        self.inr_amount = inr;
        self.btc_amount = btc;
        self
    }

    pub fn with_limit_price(mut self, price: Price) -> Self {
        self.limit_price = Some(price);
        self
    }

    pub fn with_parent(mut self, plan: PlanId) -> Self {
        self.parent_id = Some(plan);
        self
    }

    pub fn with_loan(mut self, loan: LoanId) -> Self {
        self.loan_id = Some(loan);
        self
    }

    /// Marks a fresh record executed in place. used for operations that never sit PENDING.
    pub fn executed(
        mut self,
        price: Option<Price>,
        balances_after: BalanceSnapshot,
        timestamp: Timestamp,
    ) -> Self {
        self.status = OperationStatus::Executed;
        self.execution_price = price;
        self.balances_after = Some(balances_after);
        self.executed_at = Some(timestamp);
        self.updated_at = timestamp;
        self
    }

    pub fn is_pending_limit(&self) -> bool {
        self.status == OperationStatus::Pending && self.op_type.is_limit()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OperationError {
    #[error("Operation {0:?} not found")]
    NotFound(OperationId),

    #[error("Operation {id:?} is {status:?} and can no longer change")]
    Terminal { id: OperationId, status: OperationStatus },

    #[error("Operation {0:?} already exists")]
    Duplicate(OperationId),
}

/// The terminal transition applied to a PENDING row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Settlement {
    Executed {
        inr_amount: Inr,
        btc_amount: Sats,
        price: Price,
    },
    Cancelled(CancelReason),
    Expired,
}

/// Store of every operation, keyed by id in creation order.
#[derive(Debug, Default)]
pub struct OperationBook {
    operations: BTreeMap<OperationId, Operation>,
    next_id: u64,
}

impl OperationBook {
    pub fn new() -> Self {
        Self {
            operations: BTreeMap::new(),
            next_id: 1,
        }
    }

    pub fn next_id(&mut self) -> OperationId {
        if self.next_id == 0 {
            self.next_id = 1;
        }
        let id = OperationId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn insert(&mut self, operation: Operation) -> Result<OperationId, OperationError> {
        let id = operation.id;
        if self.operations.contains_key(&id) {
            return Err(OperationError::Duplicate(id));
        }
        self.operations.insert(id, operation);
        Ok(id)
    }

    pub fn get(&self, id: OperationId) -> Option<&Operation> {
        self.operations.get(&id)
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Moves a PENDING row to its terminal state.
    pub fn settle(
        &mut self,
        id: OperationId,
        settlement: Settlement,
        timestamp: Timestamp,
    ) -> Result<Operation, OperationError> {
        let op = self.operations.get_mut(&id).ok_or(OperationError::NotFound(id))?;
        if op.status.is_terminal() {
            return Err(OperationError::Terminal { id, status: op.status });
        }
        match settlement {
            Settlement::Executed { inr_amount, btc_amount, price } => {
                op.status = OperationStatus::Executed;
                op.inr_amount = inr_amount;
                op.btc_amount = btc_amount;
                op.execution_price = Some(price);
                op.executed_at = Some(timestamp);
            }
            Settlement::Cancelled(reason) => {
                op.status = OperationStatus::Cancelled;
                op.cancel_reason = Some(reason);
            }
            Settlement::Expired => {
                op.status = OperationStatus::Expired;
                op.cancel_reason = Some(CancelReason::Expired);
            }
        }
        op.updated_at = timestamp;
        Ok(op.clone())
    }

    /// Attaches the post-commit balance snapshot to a row.
    pub fn record_balances(&mut self, id: OperationId, snapshot: BalanceSnapshot) {
        if let Some(op) = self.operations.get_mut(&id) {
            op.balances_after = Some(snapshot);
        }
    }

    // puts back a row captured before a claim whose ledger commit then failed
    pub(crate) fn restore(&mut self, previous: Operation) {
        self.operations.insert(previous.id, previous);
    }

    pub fn for_user(&self, user: UserId) -> Vec<Operation> {
        self.operations.values().filter(|op| op.user == user).cloned().collect()
    }

    pub fn by_parent(&self, plan: PlanId) -> Vec<Operation> {
        self.operations
            .values()
            .filter(|op| op.parent_id == Some(plan))
            .cloned()
            .collect()
    }

    /// Pending limit orders, oldest first.
    pub fn pending_limit_orders(&self) -> Vec<Operation> {
        self.operations
            .values()
            .filter(|op| op.is_pending_limit())
            .cloned()
            .collect()
    }

    pub fn pending_limit_orders_for(&self, user: UserId) -> Vec<Operation> {
        self.operations
            .values()
            .filter(|op| op.user == user && op.is_pending_limit())
            .cloned()
            .collect()
    }

    /// Pending limit orders created at or before `cutoff`.
    pub fn pending_created_before(&self, cutoff: Timestamp) -> Vec<Operation> {
        self.operations
            .values()
            .filter(|op| op.is_pending_limit() && op.created_at <= cutoff)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn limit_buy(book: &mut OperationBook, at: i64) -> OperationId {
        let id = book.next_id();
        let op = Operation::new(id, UserId(1), OperationType::LimitBuy, 1, Timestamp::from_millis(at))
            .with_amounts(Inr(10_000), Sats::ZERO)
            .with_limit_price(Price::from_rupees(9_000_000).unwrap());
        book.insert(op).unwrap()
    }

    #[test]
    fn legacy_tags_parse_to_canonical() {
        assert_eq!("BUY".parse::<OperationType>().unwrap(), OperationType::MarketBuy);
        assert_eq!("sell".parse::<OperationType>().unwrap(), OperationType::MarketSell);
        assert_eq!(
            "LOAN_ADD_COLLATERAL".parse::<OperationType>().unwrap(),
            OperationType::LoanAddCollateral
        );
        assert!("MARGIN_CALL".parse::<OperationType>().is_err());
        assert_eq!(OperationType::MarketBuy.to_string(), "MARKET_BUY");
    }

    #[test]
    fn serde_uses_canonical_tags() {
        let json = serde_json::to_string(&OperationType::PartialLiquidation).unwrap();
        assert_eq!(json, "\"PARTIAL_LIQUIDATION\"");
        let json = serde_json::to_string(&OperationStatus::Expired).unwrap();
        assert_eq!(json, "\"EXPIRED\"");
    }

    #[test]
    fn settle_once_then_terminal() {
        let mut book = OperationBook::new();
        let id = limit_buy(&mut book, 0);

        let executed = book
            .settle(
                id,
                Settlement::Executed {
                    inr_amount: Inr(10_000),
                    btc_amount: Sats(112_359),
                    price: Price::new_unchecked(dec!(8_900_000)),
                },
                Timestamp::from_millis(5),
            )
            .unwrap();
        assert_eq!(executed.status, OperationStatus::Executed);
        assert_eq!(executed.executed_at, Some(Timestamp::from_millis(5)));

        let again = book.settle(id, Settlement::Cancelled(CancelReason::UserRequested), Timestamp::from_millis(6));
        assert!(matches!(again, Err(OperationError::Terminal { .. })));
        assert_eq!(book.get(id).unwrap().status, OperationStatus::Executed);
    }

    #[test]
    fn expiry_selects_old_pending_only() {
        let mut book = OperationBook::new();
        let old = limit_buy(&mut book, 0);
        let young = limit_buy(&mut book, 10_000);
        let settled = limit_buy(&mut book, 0);
        book.settle(settled, Settlement::Cancelled(CancelReason::UserRequested), Timestamp::from_millis(1))
            .unwrap();

        let expiring: Vec<OperationId> = book
            .pending_created_before(Timestamp::from_millis(5_000))
            .iter()
            .map(|op| op.id)
            .collect();
        assert_eq!(expiring, vec![old]);
        assert_eq!(book.pending_limit_orders().len(), 2);
        assert!(book.get(young).is_some());

        let expired = book.settle(old, Settlement::Expired, Timestamp::from_millis(6_000)).unwrap();
        assert_eq!(expired.cancel_reason, Some(CancelReason::Expired));
    }

    #[test]
    fn duplicate_ids_rejected() {
        let mut book = OperationBook::new();
        let id = limit_buy(&mut book, 0);
        let dup = Operation::new(id, UserId(2), OperationType::MarketBuy, 1, Timestamp::from_millis(0));
        assert_eq!(book.insert(dup), Err(OperationError::Duplicate(id)));
    }
}
