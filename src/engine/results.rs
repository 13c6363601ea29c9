// 8.0.2: result types and errors for engine operations.

use crate::config::ConfigError;
use crate::ledger::LedgerError;
use crate::loan::LoanError;
use crate::operation::{OperationError, OperationStatus};
use crate::plan::{PlanError, PlanStatus};
use crate::price_feed::{OracleError, RateQuote};
use crate::types::{Currency, Inr, LoanId, OperationId, PlanId, Price, Sats, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LiquidationTrigger {
    /// LTV reached the liquidation threshold on a price tick
    PriceBreach,
    Admin,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiquidationResult {
    pub loan_id: LoanId,
    pub user: UserId,
    pub operation_id: OperationId,
    pub trigger: LiquidationTrigger,
    pub price: Price,
    pub collateral_sold: Sats,
    pub proceeds: Inr,
    pub to_interest: Inr,
    pub to_principal: Inr,
    /// returned to the user's available INR
    pub surplus: Inr,
    /// debt the proceeds could not cover
    pub written_off: Inr,
}

/// Outcome of one oracle tick: triggered limit orders and loan liquidations.
#[derive(Debug, Clone, Default)]
pub struct PriceTickReport {
    pub quote: Option<RateQuote>,
    pub executed_orders: Vec<OperationId>,
    pub loans_refreshed: usize,
    pub liquidations: Vec<LiquidationResult>,
    pub failures: Vec<(UserId, EngineError)>,
}

#[derive(Debug, Clone, Default)]
pub struct DcaTickReport {
    pub executed: Vec<OperationId>,
    /// outside price bounds, schedule untouched
    pub skipped: Vec<PlanId>,
    /// outside price bounds, schedule moved one interval
    pub deferred: Vec<PlanId>,
    pub completed: Vec<PlanId>,
    pub failed: Vec<(PlanId, OperationId, EngineError)>,
}

impl DcaTickReport {
    pub fn is_empty(&self) -> bool {
        self.executed.is_empty()
            && self.skipped.is_empty()
            && self.deferred.is_empty()
            && self.failed.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct AccrualReport {
    pub loans_checked: usize,
    pub operations: Vec<OperationId>,
    pub total_booked: Inr,
    pub failures: Vec<(LoanId, EngineError)>,
}

#[derive(Debug, Clone, Default)]
pub struct ExpiryReport {
    pub expired: Vec<OperationId>,
    pub failures: Vec<(OperationId, EngineError)>,
}

/// Stable error codes surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    InsufficientFunds,
    InvariantViolation,
    InvalidAmount,
    InvalidOrder,
    StalePrice,
    OracleUnavailable,
    OrderNotCancellable,
    OperationNotFound,
    LoanNotFound,
    NoActiveLoan,
    LoanAlreadyActive,
    LtvExceeded,
    PlanNotFound,
    InvalidPlanState,
    AccountNotFound,
    SettingsConflict,
    InvalidSettings,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InsufficientFunds => "INSUFFICIENT_FUNDS",
            ErrorKind::InvariantViolation => "INVARIANT_VIOLATION",
            ErrorKind::InvalidAmount => "INVALID_AMOUNT",
            ErrorKind::InvalidOrder => "INVALID_ORDER",
            ErrorKind::StalePrice => "STALE_PRICE",
            ErrorKind::OracleUnavailable => "ORACLE_UNAVAILABLE",
            ErrorKind::OrderNotCancellable => "ORDER_NOT_CANCELLABLE",
            ErrorKind::OperationNotFound => "OPERATION_NOT_FOUND",
            ErrorKind::LoanNotFound => "LOAN_NOT_FOUND",
            ErrorKind::NoActiveLoan => "NO_ACTIVE_LOAN",
            ErrorKind::LoanAlreadyActive => "LOAN_ALREADY_ACTIVE",
            ErrorKind::LtvExceeded => "LTV_EXCEEDED",
            ErrorKind::PlanNotFound => "PLAN_NOT_FOUND",
            ErrorKind::InvalidPlanState => "INVALID_PLAN_STATE",
            ErrorKind::AccountNotFound => "ACCOUNT_NOT_FOUND",
            ErrorKind::SettingsConflict => "SETTINGS_CONFLICT",
            ErrorKind::InvalidSettings => "INVALID_SETTINGS",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("Insufficient {currency} funds: requested {requested}, available {available}")]
    InsufficientFunds {
        currency: Currency,
        requested: i64,
        available: i64,
    },

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    #[error("Price is {age_ms}ms old, tolerance is {max_age_ms}ms")]
    StalePrice { age_ms: i64, max_age_ms: i64 },

    #[error("Price oracle unavailable: {0}")]
    OracleUnavailable(String),

    #[error("Order {id:?} is {status:?} and cannot be cancelled")]
    OrderNotCancellable { id: OperationId, status: OperationStatus },

    #[error("Operation {0:?} not found")]
    OperationNotFound(OperationId),

    #[error("Loan {0:?} not found")]
    LoanNotFound(LoanId),

    #[error("User {0:?} has no active loan")]
    NoActiveLoan(UserId),

    #[error("User {user:?} already has active loan {loan:?}")]
    LoanAlreadyActive { user: UserId, loan: LoanId },

    #[error("Borrow of {requested} exceeds available {available}")]
    LtvExceeded { requested: Inr, available: Inr },

    #[error("Plan {0:?} not found")]
    PlanNotFound(PlanId),

    #[error("Plan {id:?} is {status:?}; cannot {action}")]
    InvalidPlanState {
        id: PlanId,
        status: PlanStatus,
        action: &'static str,
    },

    #[error("Account {0:?} not found")]
    AccountNotFound(UserId),

    #[error("Settings version {proposed} is not newer than {current}")]
    SettingsConflict { current: u64, proposed: u64 },

    #[error("Invalid settings: {0}")]
    InvalidSettings(#[from] ConfigError),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            EngineError::InvariantViolation(_) => ErrorKind::InvariantViolation,
            EngineError::InvalidAmount(_) => ErrorKind::InvalidAmount,
            EngineError::InvalidOrder(_) => ErrorKind::InvalidOrder,
            EngineError::StalePrice { .. } => ErrorKind::StalePrice,
            EngineError::OracleUnavailable(_) => ErrorKind::OracleUnavailable,
            EngineError::OrderNotCancellable { .. } => ErrorKind::OrderNotCancellable,
            EngineError::OperationNotFound(_) => ErrorKind::OperationNotFound,
            EngineError::LoanNotFound(_) => ErrorKind::LoanNotFound,
            EngineError::NoActiveLoan(_) => ErrorKind::NoActiveLoan,
            EngineError::LoanAlreadyActive { .. } => ErrorKind::LoanAlreadyActive,
            EngineError::LtvExceeded { .. } => ErrorKind::LtvExceeded,
            EngineError::PlanNotFound(_) => ErrorKind::PlanNotFound,
            EngineError::InvalidPlanState { .. } => ErrorKind::InvalidPlanState,
            EngineError::AccountNotFound(_) => ErrorKind::AccountNotFound,
            EngineError::SettingsConflict { .. } => ErrorKind::SettingsConflict,
            EngineError::InvalidSettings(_) => ErrorKind::InvalidSettings,
        }
    }

    /// Price errors the scheduler retries with backoff.
    pub fn is_price_error(&self) -> bool {
        matches!(self, EngineError::StalePrice { .. } | EngineError::OracleUnavailable(_))
    }
}

impl From<LedgerError> for EngineError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::AccountNotFound(user) => EngineError::AccountNotFound(user),
            LedgerError::InsufficientFunds { currency, requested, available, .. } => {
                EngineError::InsufficientFunds { currency, requested, available }
            }
            LedgerError::InvalidAmount { amount } => {
                EngineError::InvalidAmount(format!("ledger posting of {amount}"))
            }
            other @ (LedgerError::InvariantViolation { .. } | LedgerError::AuditMismatch(_)) => {
                EngineError::InvariantViolation(other.to_string())
            }
        }
    }
}

impl From<OracleError> for EngineError {
    fn from(err: OracleError) -> Self {
        EngineError::OracleUnavailable(err.to_string())
    }
}

impl From<LoanError> for EngineError {
    fn from(err: LoanError) -> Self {
        match err {
            LoanError::AlreadyActive { user, loan } => EngineError::LoanAlreadyActive { user, loan },
            LoanError::NoActiveLoan(user) => EngineError::NoActiveLoan(user),
            LoanError::NotFound(id) => EngineError::LoanNotFound(id),
        }
    }
}

impl From<PlanError> for EngineError {
    fn from(err: PlanError) -> Self {
        match err {
            PlanError::NotFound(id) => EngineError::PlanNotFound(id),
            PlanError::InvalidState { id, status, action } => {
                EngineError::InvalidPlanState { id, status, action }
            }
        }
    }
}

impl From<OperationError> for EngineError {
    fn from(err: OperationError) -> Self {
        match err {
            OperationError::NotFound(id) => EngineError::OperationNotFound(id),
            OperationError::Terminal { id, status } => EngineError::OrderNotCancellable { id, status },
            OperationError::Duplicate(id) => {
                EngineError::InvariantViolation(format!("duplicate operation {id:?}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::BalanceField;

    #[test]
    fn ledger_errors_map_to_kinds() {
        let err: EngineError = LedgerError::InsufficientFunds {
            user: UserId(1),
            currency: Currency::Inr,
            requested: 10,
            available: 5,
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::InsufficientFunds);

        let err: EngineError = LedgerError::InvariantViolation {
            user: UserId(1),
            field: BalanceField::BorrowedInr,
            resulting: -1,
        }
        .into();
        assert_eq!(err.kind().as_str(), "INVARIANT_VIOLATION");
    }

    #[test]
    fn price_errors_are_retryable() {
        assert!(EngineError::StalePrice { age_ms: 100_000, max_age_ms: 90_000 }.is_price_error());
        assert!(EngineError::from(OracleError::NoPriceAvailable).is_price_error());
        assert!(!EngineError::NoActiveLoan(UserId(1)).is_price_error());
    }
}
