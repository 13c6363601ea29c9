//! Dollar-cost-averaging plans and the tick that runs them.
//!
//! A due plan produces one DCA_BUY or DCA_SELL row per tick. The row is written PENDING and the
//! plan advanced before the ledger commit; on success the row becomes EXECUTED, on failure
//! it is CANCELLED and the plan goes back to its previous schedule. A price outside the
//! plan's bounds either leaves the plan untouched (`retry`) or moves it one interval without
//! consuming an installment (`defer`). Running the same tick twice executes nothing twice,
//! because the first run has already pushed `next_execution_at` past `now`.

use super::core::Engine;
use super::orders::{validate_order_amount, Fill};
use super::results::{DcaTickReport, EngineError};
use crate::config::DcaBoundPolicy;
use crate::operation::{CancelReason, Operation, OperationType, Settlement, TradeSide};
use crate::plan::{ActivePlan, PlanRequest, PlanStatus};
use crate::types::{Inr, PlanId, Sats, UserId};
use tracing::{debug, info, warn};

impl Engine {
    pub fn create_plan(&self, user: UserId, request: PlanRequest) -> Result<ActivePlan, EngineError> {
        let settings = self.settings();
        validate_order_amount(request.plan_type, request.amount_per_execution, &settings.orders)?;
        if request.remaining_executions == Some(0) {
            return Err(EngineError::InvalidAmount("plan with zero executions".to_string()));
        }
        if let (Some(min), Some(max)) = (request.min_price, request.max_price) {
            if min > max {
                return Err(EngineError::InvalidAmount(format!(
                    "min price {min} above max price {max}"
                )));
            }
        }
        self.ensure_account(user)?;

        let plan = self.plans.lock().create(user, &request, self.now());
        info!(
            user = user.0,
            plan = plan.id.0,
            side = ?plan.plan_type,
            frequency = ?plan.frequency,
            amount = plan.amount_per_execution,
            "dca plan created"
        );
        Ok(plan)
    }

    pub fn plans(&self, user: UserId) -> Vec<ActivePlan> {
        self.plans.lock().for_user(user)
    }

    pub fn plan(&self, id: PlanId) -> Option<ActivePlan> {
        self.plans.lock().get(id).cloned()
    }

    /// DCA rows produced by one plan.
    pub fn plan_executions(&self, id: PlanId) -> Vec<Operation> {
        self.operations.lock().by_parent(id)
    }

    fn owned_plan(&self, user: UserId, id: PlanId) -> Result<(), EngineError> {
        match self.plan(id) {
            Some(plan) if plan.user == user => Ok(()),
            _ => Err(EngineError::PlanNotFound(id)),
        }
    }

    pub fn pause_plan(&self, user: UserId, id: PlanId) -> Result<ActivePlan, EngineError> {
        self.owned_plan(user, id)?;
        let scope = self.user_scope(user);
        let _guard = scope.lock();
        Ok(self.plans.lock().pause(id, self.now())?)
    }

    pub fn resume_plan(&self, user: UserId, id: PlanId) -> Result<ActivePlan, EngineError> {
        self.owned_plan(user, id)?;
        let scope = self.user_scope(user);
        let _guard = scope.lock();
        Ok(self.plans.lock().resume(id, self.now())?)
    }

    /// Cancels the plan. its history rows stay.
    pub fn delete_plan(&self, user: UserId, id: PlanId) -> Result<ActivePlan, EngineError> {
        self.owned_plan(user, id)?;
        let scope = self.user_scope(user);
        let _guard = scope.lock();
        Ok(self.plans.lock().cancel(id, self.now())?)
    }

    /// Runs every plan due now. fails closed without a fresh quote, leaving all schedules as
    /// they were.
    pub fn run_dca_tick(&self) -> Result<DcaTickReport, EngineError> {
        let settings = self.settings();
        let now = self.now();
        let due = self.plans.lock().due(now);
        let mut report = DcaTickReport::default();
        if due.is_empty() {
            return Ok(report);
        }
        let quote = self.fresh_rate(&settings, now)?;

        for (plan_id, user) in due {
            let scope = self.user_scope(user);
            let _guard = scope.lock();

            // re-read under the lock; a pause, delete or earlier run may have got here first
            let current = self.plan(plan_id);
            let Some(previous) = current.filter(|p| p.is_due(now)) else {
                continue;
            };
            let side = previous.plan_type;
            let price = match side {
                TradeSide::Buy => quote.buy_rate,
                TradeSide::Sell => quote.sell_rate,
            };

            if !previous.price_within_bounds(price) {
                match settings.dca.bound_policy {
                    DcaBoundPolicy::Retry => {
                        debug!(plan = plan_id.0, %price, "price outside plan bounds, retrying next tick");
                        report.skipped.push(plan_id);
                    }
                    DcaBoundPolicy::Defer => {
                        let mut deferred = previous.clone();
                        deferred.defer(now);
                        self.plans.lock().replace(deferred);
                        debug!(plan = plan_id.0, %price, "price outside plan bounds, deferred");
                        report.deferred.push(plan_id);
                    }
                }
                continue;
            }

            let (op_type, inr, sats) = match side {
                TradeSide::Buy => (OperationType::DcaBuy, Inr(previous.amount_per_execution), Sats::ZERO),
                TradeSide::Sell => (OperationType::DcaSell, Inr::ZERO, Sats(previous.amount_per_execution)),
            };
            let op_id = self.next_operation_id();
            let pending = Operation::new(op_id, user, op_type, settings.version, now)
                .with_amounts(inr, sats)
                .with_parent(plan_id);
            if let Err(err) = self.record(pending) {
                report.failed.push((plan_id, op_id, err));
                continue;
            }

            // claim the installment before touching balances
            let mut advanced = previous.clone();
            advanced.advance(now);
            self.plans.lock().replace(advanced.clone());

            let outcome = Fill::at_quote(side, previous.amount_per_execution, &quote).and_then(|fill| {
                self.commit_swap(user, side, &fill, false, op_id).map(|snapshot| (fill, snapshot))
            });
            match outcome {
                Ok((fill, snapshot)) => {
                    let mut book = self.operations.lock();
                    if let Err(err) = book.settle(op_id, Settlement::Executed {
                        inr_amount: fill.inr,
                        btc_amount: fill.sats,
                        price: fill.price,
                    }, now) {
                        warn!(op = op_id.0, error = %err, "dca row already settled");
                    }
                    book.record_balances(op_id, snapshot);
                    drop(book);

                    info!(
                        user = user.0,
                        plan = plan_id.0,
                        op = op_id.0,
                        inr = fill.inr.value(),
                        sats = fill.sats.value(),
                        price = %fill.price,
                        "dca installment executed"
                    );
                    report.executed.push(op_id);
                    if advanced.status == PlanStatus::Completed {
                        info!(plan = plan_id.0, "dca plan completed");
                        report.completed.push(plan_id);
                    }
                }
                Err(err) => {
                    let reason = match err {
                        EngineError::InsufficientFunds { .. } => CancelReason::InsufficientFunds,
                        _ => CancelReason::ExecutionFailed,
                    };
                    if let Err(settle_err) =
                        self.operations.lock().settle(op_id, Settlement::Cancelled(reason), now)
                    {
                        warn!(op = op_id.0, error = %settle_err, "dca row already settled");
                    }
                    self.plans.lock().replace(previous);
                    warn!(user = user.0, plan = plan_id.0, op = op_id.0, error = %err, "dca installment failed");
                    report.failed.push((plan_id, op_id, err));
                }
            }
        }
        Ok(report)
    }
}
