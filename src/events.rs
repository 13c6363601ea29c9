// 11.0: every ledger mutation produces exactly one event. used for the audit trail and to
// rebuild balances from scratch. events are append-only; nothing edits or drops them.

use crate::ledger::{BalanceField, UserBalance};
use crate::types::{OperationId, Timestamp, UserId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub u64);

/// Which ledger primitive produced the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryKind {
    Reserve,
    Release,
    Commit,
    Adjust,
}

/// One signed change to one balance field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDelta {
    pub field: BalanceField,
    pub delta: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub id: EventId,
    pub user: UserId,
    pub timestamp: Timestamp,
    pub kind: EntryKind,
    pub deltas: Vec<FieldDelta>,
    pub balances_after: UserBalance,
    pub reference: Option<OperationId>,
}

impl LedgerEvent {
    /// Net change for one field across this event.
    pub fn net(&self, field: BalanceField) -> i64 {
        self.deltas
            .iter()
            .filter(|d| d.field == field)
            .map(|d| d.delta)
            .sum()
    }
}

pub trait EventEmitter {
    fn emit(&mut self, event: LedgerEvent);
}

#[derive(Debug, Default)]
pub struct EventLog {
    events: Vec<LedgerEvent>,
    next_id: u64,
}

impl EventLog {
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            next_id: 1,
        }
    }

    pub fn events(&self) -> &[LedgerEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn for_user(&self, user: UserId) -> Vec<LedgerEvent> {
        self.events.iter().filter(|e| e.user == user).cloned().collect()
    }

    pub fn for_reference(&self, reference: OperationId) -> Vec<LedgerEvent> {
        self.events
            .iter()
            .filter(|e| e.reference == Some(reference))
            .cloned()
            .collect()
    }

    pub fn next_id(&mut self) -> EventId {
        if self.next_id == 0 {
            self.next_id = 1;
        }
        let id = EventId(self.next_id);
        self.next_id += 1;
        id
    }
}

impl EventEmitter for EventLog {
    fn emit(&mut self, event: LedgerEvent) {
        self.events.push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(log: &mut EventLog, user: u64, reference: Option<u64>) -> LedgerEvent {
        LedgerEvent {
            id: log.next_id(),
            user: UserId(user),
            timestamp: Timestamp::from_millis(1000),
            kind: EntryKind::Commit,
            deltas: vec![
                FieldDelta { field: BalanceField::AvailableInr, delta: -500 },
                FieldDelta { field: BalanceField::AvailableBtc, delta: 5_000 },
                FieldDelta { field: BalanceField::AvailableInr, delta: 100 },
            ],
            balances_after: UserBalance::default(),
            reference: reference.map(OperationId),
        }
    }

    #[test]
    fn log_assigns_sequential_ids() {
        let mut log = EventLog::new();
        let first = event(&mut log, 1, None);
        let second = event(&mut log, 2, Some(9));
        assert_eq!(first.id, EventId(1));
        assert_eq!(second.id, EventId(2));

        log.emit(first);
        log.emit(second);
        assert_eq!(log.len(), 2);
        assert_eq!(log.for_user(UserId(2)).len(), 1);
        assert_eq!(log.for_reference(OperationId(9)).len(), 1);
    }

    #[test]
    fn net_sums_same_field() {
        let mut log = EventLog::new();
        let e = event(&mut log, 1, None);
        assert_eq!(e.net(BalanceField::AvailableInr), -400);
        assert_eq!(e.net(BalanceField::AvailableBtc), 5_000);
        assert_eq!(e.net(BalanceField::BorrowedInr), 0);
    }
}
