// 5.0: recurring DCA plans. 5.0 has the plan record, 5.1 the schedule math, 5.2 the store.
// the dca tick in engine/dca.rs is the only thing that advances a plan.

use crate::operation::TradeSide;
use crate::types::{PlanId, Price, Timestamp, UserId, MILLIS_PER_DAY, MILLIS_PER_HOUR};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Frequency {
    Hourly,
    Daily,
    Weekly,
    // 30 days flat, not calendar months
    Monthly,
}

impl Frequency {
    pub fn interval_millis(&self) -> i64 {
        match self {
            Frequency::Hourly => MILLIS_PER_HOUR,
            Frequency::Daily => MILLIS_PER_DAY,
            Frequency::Weekly => 7 * MILLIS_PER_DAY,
            Frequency::Monthly => 30 * MILLIS_PER_DAY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanStatus {
    Active,
    Paused,
    Completed,
    Cancelled,
}

impl PlanStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PlanStatus::Completed | PlanStatus::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivePlan {
    pub id: PlanId,
    pub user: UserId,
    pub plan_type: TradeSide,
    pub frequency: Frequency,
    /// rupees for buy plans, satoshis for sell plans
    pub amount_per_execution: i64,
    pub next_execution_at: Timestamp,
    /// None runs forever
    pub remaining_executions: Option<u32>,
    pub max_price: Option<Price>,
    pub min_price: Option<Price>,
    pub status: PlanStatus,
    pub executions_done: u32,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// Parameters for a new plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanRequest {
    pub plan_type: TradeSide,
    pub frequency: Frequency,
    pub amount_per_execution: i64,
    pub remaining_executions: Option<u32>,
    pub max_price: Option<Price>,
    pub min_price: Option<Price>,
    /// first run. None means the next tick
    pub start_at: Option<Timestamp>,
}

impl PlanRequest {
    pub fn buy(frequency: Frequency, rupees: i64) -> Self {
        Self {
            plan_type: TradeSide::Buy,
            frequency,
            amount_per_execution: rupees,
            remaining_executions: None,
            max_price: None,
            min_price: None,
            start_at: None,
        }
    }

    pub fn sell(frequency: Frequency, sats: i64) -> Self {
        Self {
            plan_type: TradeSide::Sell,
            ..Self::buy(frequency, sats)
        }
    }

    pub fn executions(mut self, count: u32) -> Self {
        self.remaining_executions = Some(count);
        self
    }

    pub fn max_price(mut self, price: Price) -> Self {
        self.max_price = Some(price);
        self
    }

    pub fn min_price(mut self, price: Price) -> Self {
        self.min_price = Some(price);
        self
    }

    pub fn starting_at(mut self, at: Timestamp) -> Self {
        self.start_at = Some(at);
        self
    }
}

impl ActivePlan {
    pub fn is_due(&self, now: Timestamp) -> bool {
        self.status == PlanStatus::Active && self.next_execution_at <= now
    }

    // 5.1: price must sit inside [min_price, max_price] wherever a bound is set
    pub fn price_within_bounds(&self, price: Price) -> bool {
        let below_max = self.max_price.map_or(true, |max| price <= max);
        let above_min = self.min_price.map_or(true, |min| price >= min);
        below_max && above_min
    }

    /// Consumes one installment: schedule moves one interval, the counter drops, and a
    /// plan with nothing left is COMPLETED. A plan that was behind skips the slots it missed
    /// instead of running them back to back.
    pub fn advance(&mut self, now: Timestamp) {
        self.step_past(now);
        self.executions_done += 1;
        if let Some(remaining) = self.remaining_executions.as_mut() {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                self.status = PlanStatus::Completed;
            }
        }
        self.updated_at = now;
    }

    /// Moves the schedule to its next slot after `now` without consuming an installment.
    pub fn defer(&mut self, now: Timestamp) {
        self.step_past(now);
        self.updated_at = now;
    }

    // 5.2: one interval forward, then whole intervals until the next run is after `now`.
    // keeps the plan on its original slot
    fn step_past(&mut self, now: Timestamp) {
        let interval = self.frequency.interval_millis();
        let next = self.next_execution_at.plus_millis(interval);
        let behind = next.millis_until(&now);
        self.next_execution_at = if behind >= 0 {
            next.plus_millis((behind / interval + 1) * interval)
        } else {
            next
        };
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("Plan {0:?} not found")]
    NotFound(PlanId),

    #[error("Plan {id:?} is {status:?}; cannot {action}")]
    InvalidState {
        id: PlanId,
        status: PlanStatus,
        action: &'static str,
    },
}

// 5.2: plan store
#[derive(Debug, Default)]
pub struct PlanBook {
    plans: BTreeMap<PlanId, ActivePlan>,
    next_id: u64,
}

impl PlanBook {
    pub fn new() -> Self {
        Self {
            plans: BTreeMap::new(),
            next_id: 1,
        }
    }

    pub fn create(&mut self, user: UserId, request: &PlanRequest, now: Timestamp) -> ActivePlan {
        if self.next_id == 0 {
            self.next_id = 1;
        }
        let id = PlanId(self.next_id);
        self.next_id += 1;

        let plan = ActivePlan {
            id,
            user,
            plan_type: request.plan_type,
            frequency: request.frequency,
            amount_per_execution: request.amount_per_execution,
            next_execution_at: request.start_at.unwrap_or(now),
            remaining_executions: request.remaining_executions,
            max_price: request.max_price,
            min_price: request.min_price,
            status: PlanStatus::Active,
            executions_done: 0,
            created_at: now,
            updated_at: now,
        };
        self.plans.insert(id, plan.clone());
        plan
    }

    pub fn get(&self, id: PlanId) -> Option<&ActivePlan> {
        self.plans.get(&id)
    }

    pub fn replace(&mut self, plan: ActivePlan) {
        self.plans.insert(plan.id, plan);
    }

    pub fn for_user(&self, user: UserId) -> Vec<ActivePlan> {
        self.plans.values().filter(|p| p.user == user).cloned().collect()
    }

    /// Ids of plans due at `now`, in id order.
    pub fn due(&self, now: Timestamp) -> Vec<(PlanId, UserId)> {
        self.plans
            .values()
            .filter(|p| p.is_due(now))
            .map(|p| (p.id, p.user))
            .collect()
    }

    pub fn pause(&mut self, id: PlanId, now: Timestamp) -> Result<ActivePlan, PlanError> {
        let plan = self.plans.get_mut(&id).ok_or(PlanError::NotFound(id))?;
        if plan.status != PlanStatus::Active {
            return Err(PlanError::InvalidState { id, status: plan.status, action: "pause" });
        }
        plan.status = PlanStatus::Paused;
        plan.updated_at = now;
        Ok(plan.clone())
    }

    // a long pause must not leave a backlog of missed runs, so the next run is clamped to now
    pub fn resume(&mut self, id: PlanId, now: Timestamp) -> Result<ActivePlan, PlanError> {
        let plan = self.plans.get_mut(&id).ok_or(PlanError::NotFound(id))?;
        if plan.status != PlanStatus::Paused {
            return Err(PlanError::InvalidState { id, status: plan.status, action: "resume" });
        }
        plan.status = PlanStatus::Active;
        plan.next_execution_at = plan.next_execution_at.max(now);
        plan.updated_at = now;
        Ok(plan.clone())
    }

    pub fn cancel(&mut self, id: PlanId, now: Timestamp) -> Result<ActivePlan, PlanError> {
        let plan = self.plans.get_mut(&id).ok_or(PlanError::NotFound(id))?;
        if plan.status.is_terminal() {
            return Err(PlanError::InvalidState { id, status: plan.status, action: "delete" });
        }
        plan.status = PlanStatus::Cancelled;
        plan.updated_at = now;
        Ok(plan.clone())
    }
}
