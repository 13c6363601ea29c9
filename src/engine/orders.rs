//! Market and limit orders, cancellation, the limit monitor and the expiry sweep.
//!
//! Market orders settle against the current quote in one ledger commit. Limit orders reserve
//! their source funds at submission and wait PENDING until a quote crosses the limit, the
//! user cancels, or the expiry sweep closes them. A pending order settles exactly once: the
//! row is claimed (moved to its terminal status) before the ledger commit, and if the commit
//! fails the row is put back so the next tick can try again.

use super::core::Engine;
use super::results::{EngineError, ExpiryReport};
use crate::config::{EngineSettings, OrderParams};
use crate::ledger::{BalanceField, BalanceSnapshot, ChangeSet};
use crate::operation::{CancelReason, Operation, OperationType, Settlement, TradeSide};
use crate::price_feed::RateQuote;
use crate::types::{Inr, OperationId, Price, Sats, Timestamp, UserId};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

/// Order submission. `amount` is rupees for buys and satoshis for sells.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub order_type: OperationType,
    pub amount: i64,
    pub limit_price: Option<Price>,
}

impl OrderRequest {
    pub fn market(side: TradeSide, amount: i64) -> Self {
        let order_type = match side {
            TradeSide::Buy => OperationType::MarketBuy,
            TradeSide::Sell => OperationType::MarketSell,
        };
        Self { order_type, amount, limit_price: None }
    }

    pub fn limit(side: TradeSide, amount: i64, limit_price: Price) -> Self {
        let order_type = match side {
            TradeSide::Buy => OperationType::LimitBuy,
            TradeSide::Sell => OperationType::LimitSell,
        };
        Self { order_type, amount, limit_price: Some(limit_price) }
    }
}

/// Both legs of a swap at one rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct Fill {
    pub inr: Inr,
    pub sats: Sats,
    pub price: Price,
}

impl Fill {
    /// Buys spend `amount` rupees at the buy rate; sells spend `amount` sats at the sell rate.
    /// the counter amount is floored, and a fill that floors to nothing is rejected.
    pub(super) fn at_quote(side: TradeSide, amount: i64, quote: &RateQuote) -> Result<Self, EngineError> {
        let fill = match side {
            TradeSide::Buy => {
                let price = quote.buy_rate;
                let inr = Inr(amount);
                Fill { inr, sats: price.inr_to_sats(inr), price }
            }
            TradeSide::Sell => {
                let price = quote.sell_rate;
                let sats = Sats(amount);
                Fill { inr: price.sats_to_inr(sats), sats, price }
            }
        };
        if !fill.inr.is_positive() || !fill.sats.is_positive() {
            return Err(EngineError::InvalidAmount(format!(
                "{amount} rounds to nothing at {}",
                fill.price
            )));
        }
        Ok(fill)
    }

    fn settlement(&self) -> Settlement {
        Settlement::Executed {
            inr_amount: self.inr,
            btc_amount: self.sats,
            price: self.price,
        }
    }
}

pub(super) fn validate_order_amount(
    side: TradeSide,
    amount: i64,
    params: &OrderParams,
) -> Result<(), EngineError> {
    let minimum = match side {
        TradeSide::Buy => params.min_order_inr.value(),
        TradeSide::Sell => params.min_order_sats.value(),
    };
    if amount <= 0 || amount < minimum {
        return Err(EngineError::InvalidAmount(format!(
            "{amount} is below the {side:?} minimum of {minimum}"
        )));
    }
    Ok(())
}

// buy crosses when the ask is at or under the limit, sell when the bid is at or over it
fn limit_crossed(side: TradeSide, limit: Price, quote: &RateQuote) -> bool {
    match side {
        TradeSide::Buy => quote.buy_rate <= limit,
        TradeSide::Sell => quote.sell_rate >= limit,
    }
}

fn reserved_amount(op: &Operation, side: TradeSide) -> i64 {
    match side {
        TradeSide::Buy => op.inr_amount.value(),
        TradeSide::Sell => op.btc_amount.value(),
    }
}

impl Engine {
    pub fn submit_order(&self, user: UserId, request: OrderRequest) -> Result<Operation, EngineError> {
        let side = request.order_type.trade_side().ok_or_else(|| {
            EngineError::InvalidOrder(format!("{} is not an order type", request.order_type))
        })?;
        match (request.order_type, request.limit_price) {
            (OperationType::MarketBuy | OperationType::MarketSell, None) => {
                self.place_market_order(user, side, request.amount)
            }
            (OperationType::LimitBuy | OperationType::LimitSell, Some(limit)) => {
                self.place_limit_order(user, side, request.amount, limit)
            }
            (OperationType::LimitBuy | OperationType::LimitSell, None) => {
                Err(EngineError::InvalidOrder("limit order without a limit price".to_string()))
            }
            (order_type, _) => Err(EngineError::InvalidOrder(format!(
                "{order_type} cannot be submitted as an order"
            ))),
        }
    }

    /// Executes immediately at the current buy or sell rate.
    pub fn place_market_order(
        &self,
        user: UserId,
        side: TradeSide,
        amount: i64,
    ) -> Result<Operation, EngineError> {
        let settings = self.settings();
        validate_order_amount(side, amount, &settings.orders)?;
        self.ensure_account(user)?;

        let scope = self.user_scope(user);
        let _guard = scope.lock();

        let now = self.now();
        let quote = self.fresh_rate(&settings, now)?;
        let fill = Fill::at_quote(side, amount, &quote)?;
        let id = self.next_operation_id();
        let snapshot = self.commit_swap(user, side, &fill, false, id)?;

        let order_type = match side {
            TradeSide::Buy => OperationType::MarketBuy,
            TradeSide::Sell => OperationType::MarketSell,
        };
        let op = Operation::new(id, user, order_type, settings.version, now)
            .with_amounts(fill.inr, fill.sats)
            .executed(Some(fill.price), snapshot, now);
        info!(
            user = user.0,
            op = id.0,
            %order_type,
            inr = fill.inr.value(),
            sats = fill.sats.value(),
            price = %fill.price,
            "market order executed"
        );
        self.record(op)
    }

    /// Reserves the source amount and leaves the order PENDING, unless the current quote
    /// already crosses the limit, in which case it executes straight away.
    pub fn place_limit_order(
        &self,
        user: UserId,
        side: TradeSide,
        amount: i64,
        limit_price: Price,
    ) -> Result<Operation, EngineError> {
        let settings = self.settings();
        validate_order_amount(side, amount, &settings.orders)?;
        self.ensure_account(user)?;

        let scope = self.user_scope(user);
        let _guard = scope.lock();

        let now = self.now();
        let id = self.next_operation_id();
        let event = self.ledger.reserve(user, side.source(), amount, Some(id))?;

        let (order_type, inr, sats) = match side {
            TradeSide::Buy => (OperationType::LimitBuy, Inr(amount), Sats::ZERO),
            TradeSide::Sell => (OperationType::LimitSell, Inr::ZERO, Sats(amount)),
        };
        let mut op = Operation::new(id, user, order_type, settings.version, now)
            .with_amounts(inr, sats)
            .with_limit_price(limit_price);
        op.balances_after = Some(BalanceSnapshot::from(&event.balances_after));
        self.record(op.clone())?;
        info!(user = user.0, op = id.0, %order_type, amount, limit = %limit_price, "limit order placed");

        // a missing or stale quote just leaves the order for the monitor
        match self.fresh_rate(&settings, now) {
            Ok(quote) if limit_crossed(side, limit_price, &quote) => {
                match self.execute_limit_locked(id, &quote, now) {
                    Ok(Some(executed)) => Ok(executed),
                    Ok(None) => Ok(op),
                    Err(err) => {
                        warn!(op = id.0, error = %err, "immediate limit execution failed, left pending");
                        Ok(self.operation(id).unwrap_or(op))
                    }
                }
            }
            _ => Ok(op),
        }
    }

    // 8.2: settle one pending limit order at `quote`. caller holds the user scope.
    // Ok(None) when the row is no longer pending.
    pub(super) fn execute_limit_locked(
        &self,
        id: OperationId,
        quote: &RateQuote,
        now: Timestamp,
    ) -> Result<Option<Operation>, EngineError> {
        let previous = self.operation(id).ok_or(EngineError::OperationNotFound(id))?;
        if !previous.is_pending_limit() {
            return Ok(None);
        }
        let side = previous
            .op_type
            .trade_side()
            .ok_or_else(|| EngineError::InvalidOrder(format!("{} has no side", previous.op_type)))?;
        let fill = Fill::at_quote(side, reserved_amount(&previous, side), quote)?;

        // claim first so a concurrent cancel or second tick sees a terminal row
        let claimed = self.operations.lock().settle(id, fill.settlement(), now)?;
        match self.commit_swap(previous.user, side, &fill, true, id) {
            Ok(snapshot) => {
                self.operations.lock().record_balances(id, snapshot);
                info!(
                    user = previous.user.0,
                    op = id.0,
                    inr = fill.inr.value(),
                    sats = fill.sats.value(),
                    price = %fill.price,
                    "limit order executed"
                );
                Ok(Some(Operation { balances_after: Some(snapshot), ..claimed }))
            }
            Err(err) => {
                error!(op = id.0, error = %err, "limit commit failed, restoring pending order");
                self.operations.lock().restore(previous);
                Err(err)
            }
        }
    }

    // 8.3: one ledger commit for both legs. from_reserved draws the source leg out of the
    // reservation made at submission instead of available balance
    pub(super) fn commit_swap(
        &self,
        user: UserId,
        side: TradeSide,
        fill: &Fill,
        from_reserved: bool,
        reference: OperationId,
    ) -> Result<BalanceSnapshot, EngineError> {
        let source = side.source();
        let source_field = if from_reserved {
            BalanceField::reserved(source)
        } else {
            BalanceField::available(source)
        };
        let (spend, receive, receive_field) = match side {
            TradeSide::Buy => (fill.inr.value(), fill.sats.value(), BalanceField::AvailableBtc),
            TradeSide::Sell => (fill.sats.value(), fill.inr.value(), BalanceField::AvailableInr),
        };

        let held = self.ledger.balance(user)?.get(source_field);
        if held < spend {
            if from_reserved {
                return Err(EngineError::InvariantViolation(format!(
                    "{source_field} holds {held}, order needs {spend}"
                )));
            }
            return Err(EngineError::InsufficientFunds {
                currency: source,
                requested: spend,
                available: held,
            });
        }

        let change = ChangeSet::new()
            .debit(source_field, spend)
            .credit(receive_field, receive)
            .with_reference(reference);
        let event = self.ledger.commit(user, change)?;
        Ok(BalanceSnapshot::from(&event.balances_after))
    }

    /// Cancels one of the user's own pending limit orders and releases its reservation.
    pub fn cancel_order(&self, user: UserId, id: OperationId) -> Result<Operation, EngineError> {
        let owner = self.operation(id).map(|op| op.user);
        if owner != Some(user) {
            return Err(EngineError::OperationNotFound(id));
        }
        let scope = self.user_scope(user);
        let _guard = scope.lock();
        self.close_pending_locked(id, Settlement::Cancelled(CancelReason::UserRequested), self.now())
    }

    pub fn admin_cancel_order(&self, id: OperationId) -> Result<Operation, EngineError> {
        let user = self
            .operation(id)
            .map(|op| op.user)
            .ok_or(EngineError::OperationNotFound(id))?;
        let scope = self.user_scope(user);
        let _guard = scope.lock();
        let op = self.close_pending_locked(id, Settlement::Cancelled(CancelReason::AdminRequested), self.now())?;
        warn!(user = user.0, op = id.0, "order cancelled by admin");
        Ok(op)
    }

    // cancel or expire: claim the row, then hand the reservation back
    fn close_pending_locked(
        &self,
        id: OperationId,
        settlement: Settlement,
        now: Timestamp,
    ) -> Result<Operation, EngineError> {
        let previous = self.operation(id).ok_or(EngineError::OperationNotFound(id))?;
        if !previous.is_pending_limit() {
            return Err(EngineError::OrderNotCancellable { id, status: previous.status });
        }
        let side = previous
            .op_type
            .trade_side()
            .ok_or_else(|| EngineError::InvalidOrder(format!("{} has no side", previous.op_type)))?;

        let closed = self.operations.lock().settle(id, settlement, now)?;
        let amount = reserved_amount(&previous, side);
        match self.ledger.release(previous.user, side.source(), amount, Some(id)) {
            Ok(event) => {
                let snapshot = BalanceSnapshot::from(&event.balances_after);
                self.operations.lock().record_balances(id, snapshot);
                info!(user = previous.user.0, op = id.0, status = ?closed.status, "limit order closed");
                Ok(Operation { balances_after: Some(snapshot), ..closed })
            }
            Err(err) => {
                error!(op = id.0, error = %err, "release failed, restoring pending order");
                self.operations.lock().restore(previous);
                Err(err.into())
            }
        }
    }

    /// Executes every pending limit order the quote crosses. oldest orders go first.
    pub(super) fn execute_crossed_orders(
        &self,
        quote: &RateQuote,
        now: Timestamp,
    ) -> (Vec<OperationId>, Vec<(UserId, EngineError)>) {
        let pending = self.operations.lock().pending_limit_orders();
        let mut executed = Vec::new();
        let mut failures = Vec::new();

        for op in pending {
            let (Some(side), Some(limit)) = (op.op_type.trade_side(), op.limit_price) else {
                continue;
            };
            if !limit_crossed(side, limit, quote) {
                continue;
            }
            let scope = self.user_scope(op.user);
            let _guard = scope.lock();
            match self.execute_limit_locked(op.id, quote, now) {
                Ok(Some(done)) => executed.push(done.id),
                Ok(None) => debug!(op = op.id.0, "order settled elsewhere"),
                Err(err) => {
                    warn!(op = op.id.0, error = %err, "limit execution failed");
                    failures.push((op.user, err));
                }
            }
        }
        (executed, failures)
    }

    /// Expires pending limit orders older than the configured horizon.
    pub fn expire_stale_orders(&self) -> ExpiryReport {
        let settings = self.settings();
        let now = self.now();
        self.expire_orders_at(&settings, now)
    }

    pub(super) fn expire_orders_at(&self, settings: &EngineSettings, now: Timestamp) -> ExpiryReport {
        let cutoff = now.plus_hours(-settings.orders.order_expiry_hours);
        let stale = self.operations.lock().pending_created_before(cutoff);
        let mut report = ExpiryReport::default();

        for op in stale {
            let scope = self.user_scope(op.user);
            let _guard = scope.lock();
            match self.close_pending_locked(op.id, Settlement::Expired, now) {
                Ok(_) => report.expired.push(op.id),
                // executed or cancelled between the scan and the lock
                Err(EngineError::OrderNotCancellable { .. }) => {}
                Err(err) => {
                    warn!(op = op.id.0, error = %err, "expiry failed");
                    report.failures.push((op.id, err));
                }
            }
        }
        if !report.expired.is_empty() {
            info!(count = report.expired.len(), "expired stale limit orders");
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::engine::ErrorKind;
    use crate::operation::OperationStatus;
    use crate::price_feed::ManualOracle;
    use crate::types::Currency;
    use std::sync::Arc;

    struct Harness {
        engine: Engine,
        oracle: Arc<ManualOracle>,
        clock: Arc<ManualClock>,
    }

    impl Harness {
        fn new() -> Self {
            let oracle = Arc::new(ManualOracle::new());
            let clock = Arc::new(ManualClock::new(Timestamp::from_millis(1_000_000)));
            let engine = Engine::new(EngineSettings::default(), oracle.clone(), clock.clone()).unwrap();
            engine.deposit(UserId(1), Currency::Inr, 100_000).unwrap();
            engine.deposit(UserId(1), Currency::Btc, 2_000_000).unwrap();
            Self { engine, oracle, clock }
        }

        fn price(&self, rupees: i64) {
            self.oracle.publish_flat(rupees, self.clock.now());
        }
    }

    fn price(rupees: i64) -> Price {
        Price::from_rupees(rupees).unwrap()
    }

    #[test]
    fn market_buy_floors_sats() {
        let h = Harness::new();
        h.price(8_900_000);
        let op = h.engine.place_market_order(UserId(1), TradeSide::Buy, 10_000).unwrap();

        assert_eq!(op.btc_amount, Sats(112_359));
        assert_eq!(op.execution_price, Some(price(8_900_000)));
        let balance = h.engine.balance(UserId(1)).unwrap();
        assert_eq!(balance.available_inr(), Inr(90_000));
        assert_eq!(balance.available_btc(), Sats(2_112_359));
    }

    #[test]
    fn market_order_needs_fresh_price() {
        let h = Harness::new();
        h.price(9_000_000);
        h.clock.advance(120_000);
        let err = h.engine.place_market_order(UserId(1), TradeSide::Sell, 10_000).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StalePrice);
        assert_eq!(h.engine.balance(UserId(1)).unwrap().available_btc(), Sats(2_000_000));
    }

    #[test]
    fn below_minimum_rejected() {
        let h = Harness::new();
        h.price(9_000_000);
        let err = h.engine.place_market_order(UserId(1), TradeSide::Buy, 99).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidAmount);
        let err = h.engine.place_market_order(UserId(1), TradeSide::Sell, 999).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidAmount);
    }

    #[test]
    fn limit_buy_waits_then_executes() {
        let h = Harness::new();
        h.price(9_200_000);
        let op = h
            .engine
            .place_limit_order(UserId(1), TradeSide::Buy, 10_000, price(9_000_000))
            .unwrap();
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(h.engine.balance(UserId(1)).unwrap().reserved_inr(), Inr(10_000));

        let quote = RateQuote::fixed(price(8_900_000), price(8_900_000), h.clock.now());
        let (executed, failures) = h.engine.execute_crossed_orders(&quote, h.clock.now());
        assert_eq!(executed, vec![op.id]);
        assert!(failures.is_empty());

        let done = h.engine.operation(op.id).unwrap();
        assert_eq!(done.status, OperationStatus::Executed);
        assert_eq!(done.btc_amount, Sats(112_359));
        assert_eq!(done.execution_price, Some(price(8_900_000)));
        let balance = h.engine.balance(UserId(1)).unwrap();
        assert_eq!(balance.reserved_inr(), Inr::ZERO);
        assert_eq!(balance.available_inr(), Inr(90_000));

        // a second tick finds nothing to do
        let (again, _) = h.engine.execute_crossed_orders(&quote, h.clock.now());
        assert!(again.is_empty());
    }

    #[test]
    fn marketable_limit_executes_on_submission() {
        let h = Harness::new();
        h.price(8_800_000);
        let op = h
            .engine
            .place_limit_order(UserId(1), TradeSide::Sell, 100_000, price(8_500_000))
            .unwrap();
        assert_eq!(op.status, OperationStatus::Executed);
        assert_eq!(op.inr_amount, Inr(8_800));
        assert_eq!(h.engine.balance(UserId(1)).unwrap().reserved_btc(), Sats::ZERO);
    }

    #[test]
    fn cancel_releases_and_is_final() {
        let h = Harness::new();
        h.price(9_500_000);
        let op = h
            .engine
            .place_limit_order(UserId(1), TradeSide::Buy, 20_000, price(9_000_000))
            .unwrap();

        assert_eq!(
            h.engine.cancel_order(UserId(2), op.id).unwrap_err(),
            EngineError::OperationNotFound(op.id)
        );
        let cancelled = h.engine.cancel_order(UserId(1), op.id).unwrap();
        assert_eq!(cancelled.status, OperationStatus::Cancelled);
        assert_eq!(cancelled.cancel_reason, Some(CancelReason::UserRequested));
        assert_eq!(h.engine.balance(UserId(1)).unwrap().available_inr(), Inr(100_000));

        let err = h.engine.cancel_order(UserId(1), op.id).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OrderNotCancellable);
    }

    #[test]
    fn expiry_releases_old_orders() {
        let h = Harness::new();
        h.price(9_500_000);
        let op = h
            .engine
            .place_limit_order(UserId(1), TradeSide::Sell, 50_000, price(12_000_000))
            .unwrap();

        h.clock.advance(167 * 3_600_000);
        assert!(h.engine.expire_stale_orders().expired.is_empty());

        h.clock.advance(3_600_000);
        let report = h.engine.expire_stale_orders();
        assert_eq!(report.expired, vec![op.id]);
        let expired = h.engine.operation(op.id).unwrap();
        assert_eq!(expired.status, OperationStatus::Expired);
        assert_eq!(expired.cancel_reason, Some(CancelReason::Expired));
        assert_eq!(h.engine.balance(UserId(1)).unwrap().reserved_btc(), Sats::ZERO);
    }

    #[test]
    fn submit_order_dispatches_by_type() {
        let h = Harness::new();
        h.price(9_000_000);
        let op = h
            .engine
            .submit_order(UserId(1), OrderRequest::market(TradeSide::Buy, 9_000))
            .unwrap();
        assert_eq!(op.op_type, OperationType::MarketBuy);

        let bad = OrderRequest { order_type: OperationType::LoanBorrow, amount: 100, limit_price: None };
        assert_eq!(h.engine.submit_order(UserId(1), bad).unwrap_err().kind(), ErrorKind::InvalidOrder);

        let no_limit = OrderRequest { order_type: OperationType::LimitSell, amount: 5_000, limit_price: None };
        assert_eq!(h.engine.submit_order(UserId(1), no_limit).unwrap_err().kind(), ErrorKind::InvalidOrder);
    }
}
