// 8.0: the engine. coordinates the ledger, order book, DCA plans and loans behind per-user
// locks. time comes from the injected clock and prices from the injected oracle; the engine
// does no I/O of its own. the scheduler drives the periodic entry points.

mod core;
mod dashboard;
mod dca;
mod interest;
mod liquidations;
mod loans;
mod orders;
mod pricing;
mod results;

pub use self::core::Engine;
pub use dashboard::{Dashboard, LoanView};
pub use orders::OrderRequest;
pub use results::{
    AccrualReport, DcaTickReport, EngineError, ErrorKind, ExpiryReport, LiquidationResult,
    LiquidationTrigger, PriceTickReport,
};
