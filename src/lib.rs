// btcinr-core: BTC/INR balance ledger and lending engine.
// ledger-first architecture: every fund movement is one atomic ledger change with an event.
// the engine is synchronous and deterministic given its clock and oracle; the scheduler is
// the only async part.
//
// file map (search X.0 for structs, X.1+ for logic):
//   1.x  types.rs: primitives: UserId, Inr, Sats, Price, Timestamp
//   1.5  clock.rs: injectable time source
//   2.x  ledger.rs: balances, reserve/release/commit/adjust, replay audit
//   2.1  events.rs: ledger event log
//   3.x  risk.rs: LTV, borrowing capacity, liquidation price, interest floor
//   4.x  operation.rs: operation records and status machine
//   5.x  plan.rs: DCA plans and schedule math
//   6.x  loan.rs: loan records, daily accrual, single-active-loan store
//   7.x  config.rs: versioned settings, TOML loading, presets
//   8.x  engine/: orders, DCA, loans, liquidations, interest, dashboard
//   9.x  price_feed.rs: rate quotes and the oracle trait
//   10.x scheduler.rs: tokio job loops

pub mod clock;
pub mod config;
pub mod engine;
pub mod events;
pub mod ledger;
pub mod loan;
pub mod operation;
pub mod plan;
pub mod price_feed;
pub mod risk;
pub mod scheduler;
pub mod types;

// re exports for convenience
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{DcaBoundPolicy, EngineSettings};
pub use engine::*;
pub use events::{EntryKind, LedgerEvent};
pub use ledger::{BalanceField, BalanceSnapshot, ChangeSet, Ledger, LedgerError, UserBalance};
pub use loan::{Loan, LoanStatus};
pub use operation::{CancelReason, Operation, OperationStatus, OperationType, TradeSide};
pub use plan::{ActivePlan, Frequency, PlanRequest, PlanStatus};
pub use price_feed::{ManualOracle, OracleError, PriceOracle, RateQuote};
pub use risk::RiskLevel;
pub use scheduler::{Job, JobReport, Scheduler, SchedulerHandle};
pub use types::*;
