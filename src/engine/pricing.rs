// 8.4: price tick. one fresh quote drives the limit monitor, the LTV refresh and the
// liquidation sweep, in that order.

use super::core::Engine;
use super::results::{EngineError, PriceTickReport};
use tracing::{debug, info};

impl Engine {
    pub fn on_price_tick(&self) -> Result<PriceTickReport, EngineError> {
        let settings = self.settings();
        let now = self.now();
        let quote = self.fresh_rate(&settings, now)?;
        debug!(buy = %quote.buy_rate, sell = %quote.sell_rate, "price tick");

        let (executed_orders, mut failures) = self.execute_crossed_orders(&quote, now);
        let (loans_refreshed, liquidations, loan_failures) = self.sweep_loans(&settings, &quote, now);
        failures.extend(loan_failures);

        if !executed_orders.is_empty() || !liquidations.is_empty() {
            info!(
                orders = executed_orders.len(),
                liquidations = liquidations.len(),
                "price tick settled"
            );
        }
        Ok(PriceTickReport {
            quote: Some(quote),
            executed_orders,
            loans_refreshed,
            liquidations,
            failures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::EngineSettings;
    use crate::operation::{OperationStatus, TradeSide};
    use crate::price_feed::ManualOracle;
    use crate::types::{Currency, Inr, Price, Sats, Timestamp, UserId};
    use std::sync::Arc;

    #[test]
    fn tick_fills_orders_and_liquidates() {
        let oracle = Arc::new(ManualOracle::new());
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(0)));
        let engine = Engine::new(EngineSettings::default(), oracle.clone(), clock.clone()).unwrap();
        engine.deposit(UserId(1), Currency::Btc, 1_000_000).unwrap();
        engine.deposit(UserId(2), Currency::Inr, 50_000).unwrap();
        oracle.publish_flat(9_000_000, clock.now());

        engine.create_loan(UserId(1), Sats(1_000_000)).unwrap();
        engine.borrow(UserId(1), Inr(54_000)).unwrap();
        let order = engine
            .place_limit_order(UserId(2), TradeSide::Buy, 10_000, Price::from_rupees(6_000_000).unwrap())
            .unwrap();

        clock.advance(30_000);
        oracle.publish_flat(5_950_000, clock.now());
        let report = engine.on_price_tick().unwrap();

        assert_eq!(report.executed_orders, vec![order.id]);
        assert_eq!(report.loans_refreshed, 1);
        assert_eq!(report.liquidations.len(), 1);
        assert!(report.failures.is_empty());
        assert_eq!(engine.operation(order.id).unwrap().status, OperationStatus::Executed);
    }

    #[test]
    fn tick_without_price_does_nothing() {
        let oracle = Arc::new(ManualOracle::new());
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(0)));
        let engine = Engine::new(EngineSettings::default(), oracle.clone(), clock).unwrap();
        oracle.set_offline(true);
        assert!(engine.on_price_tick().unwrap_err().is_price_error());
    }
}
