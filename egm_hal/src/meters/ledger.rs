//! Persisted slot layout of the meter bank.
//!
//! Three blocks, one slot per meter in configuration order:
//!
//! | block                          | meaning                                        |
//! |--------------------------------|------------------------------------------------|
//! | `MechanicalMeter.Ledger`       | requested by `advance_meter`, not yet drained  |
//! | `MechanicalMeter.Remaining`    | drained, waiting for physical pulses           |
//! | `MechanicalMeter.Committed`    | confirmed by completed pulses                  |
//!
//! Value only moves ledger → remaining (drain) and remaining → committed
//! (one tick per pulse transaction), so the sum of the three slots of a
//! meter equals everything ever advanced.

use egm_common::persistence::{BlockHandle, PersistenceError, PersistentStore, Transaction};
use std::sync::Arc;
use tracing::debug;

/// Block holding requested but undrained amounts.
pub const LEDGER_BLOCK: &str = "MechanicalMeter.Ledger";
/// Block holding drained amounts awaiting pulses.
pub const REMAINING_BLOCK: &str = "MechanicalMeter.Remaining";
/// Block holding pulse-confirmed counts.
pub const COMMITTED_BLOCK: &str = "MechanicalMeter.Committed";

/// Slot access for the meter bank.
pub struct MeterLedger {
    store: Arc<PersistentStore>,
    ledger: BlockHandle,
    remaining: BlockHandle,
    committed: BlockHandle,
}

impl MeterLedger {
    /// Create or reopen the three blocks for `meters` meters.
    pub fn open(store: Arc<PersistentStore>, meters: usize) -> Result<Self, PersistenceError> {
        let ledger = store.create_block(LEDGER_BLOCK, meters)?;
        let remaining = store.create_block(REMAINING_BLOCK, meters)?;
        let committed = store.create_block(COMMITTED_BLOCK, meters)?;
        Ok(Self {
            store,
            ledger,
            remaining,
            committed,
        })
    }

    /// Start a transaction on the underlying store.
    pub fn begin(&self) -> Transaction {
        self.store.begin()
    }

    /// Committed ledger value.
    pub fn ledger(&self, index: usize) -> Result<i64, PersistenceError> {
        self.store.read(&self.ledger, index)
    }

    /// Committed remaining value.
    pub fn remaining(&self, index: usize) -> Result<i64, PersistenceError> {
        self.store.read(&self.remaining, index)
    }

    /// Committed pulse-confirmed count.
    pub fn committed(&self, index: usize) -> Result<i64, PersistenceError> {
        self.store.read(&self.committed, index)
    }

    /// Ledger value as seen by `tx`.
    pub fn ledger_in(&self, tx: &Transaction, index: usize) -> Result<i64, PersistenceError> {
        tx.read(&self.ledger, index)
    }

    /// Remaining value as seen by `tx`.
    pub fn remaining_in(&self, tx: &Transaction, index: usize) -> Result<i64, PersistenceError> {
        tx.read(&self.remaining, index)
    }

    /// Committed count as seen by `tx`.
    pub fn committed_in(&self, tx: &Transaction, index: usize) -> Result<i64, PersistenceError> {
        tx.read(&self.committed, index)
    }

    /// Record a requested amount in `tx`.
    pub fn stage_advance(
        &self,
        tx: &mut Transaction,
        index: usize,
        amount: i64,
    ) -> Result<(), PersistenceError> {
        tx.add(&self.ledger, index, amount)
    }

    /// Move one tick from remaining to committed in `tx`.
    pub fn stage_pulse(
        &self,
        tx: &mut Transaction,
        index: usize,
        tick: i64,
    ) -> Result<(), PersistenceError> {
        tx.add(&self.remaining, index, -tick)?;
        tx.add(&self.committed, index, tick)
    }

    /// Undo [`stage_pulse`](Self::stage_pulse) in `tx`.
    pub fn stage_rollback(
        &self,
        tx: &mut Transaction,
        index: usize,
        tick: i64,
    ) -> Result<(), PersistenceError> {
        tx.add(&self.committed, index, -tick)?;
        tx.add(&self.remaining, index, tick)
    }

    /// Drain every nonzero ledger slot into remaining in one transaction.
    ///
    /// Returns `(index, amount)` for each drained slot. Amounts added by
    /// concurrent advances after the read stay in the ledger.
    pub fn drain(&self) -> Result<Vec<(usize, i64)>, PersistenceError> {
        let mut tx = self.store.begin();
        let mut drained = Vec::new();
        for index in 0..self.ledger.slots() {
            let amount = tx.read(&self.ledger, index)?;
            if amount != 0 {
                tx.add(&self.ledger, index, -amount)?;
                tx.add(&self.remaining, index, amount)?;
                drained.push((index, amount));
            }
        }
        if drained.is_empty() {
            return Ok(drained);
        }
        tx.commit()?;
        debug!("Drained {} meter ledgers: {:?}", drained.len(), drained);
        Ok(drained)
    }

    /// Number of meters covered.
    pub fn len(&self) -> usize {
        self.ledger.slots()
    }

    /// Whether no meter is covered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_moves_all_ledgers_at_once() {
        let ledger = MeterLedger::open(PersistentStore::in_memory(), 3).unwrap();
        let mut tx = ledger.begin();
        ledger.stage_advance(&mut tx, 0, 30).unwrap();
        ledger.stage_advance(&mut tx, 2, 5).unwrap();
        tx.commit().unwrap();

        let drained = ledger.drain().unwrap();
        assert_eq!(drained, vec![(0, 30), (2, 5)]);
        assert_eq!(ledger.ledger(0).unwrap(), 0);
        assert_eq!(ledger.remaining(0).unwrap(), 30);
        assert_eq!(ledger.remaining(2).unwrap(), 5);
        assert!(ledger.drain().unwrap().is_empty());
    }

    #[test]
    fn pulse_and_rollback_are_inverse() {
        let ledger = MeterLedger::open(PersistentStore::in_memory(), 1).unwrap();
        let mut tx = ledger.begin();
        ledger.stage_advance(&mut tx, 0, 20).unwrap();
        tx.commit().unwrap();
        ledger.drain().unwrap();

        let mut tx = ledger.begin();
        ledger.stage_pulse(&mut tx, 0, 10).unwrap();
        assert_eq!(ledger.remaining_in(&tx, 0).unwrap(), 10);
        assert_eq!(ledger.committed_in(&tx, 0).unwrap(), 10);
        tx.commit().unwrap();

        let mut tx = ledger.begin();
        ledger.stage_rollback(&mut tx, 0, 10).unwrap();
        tx.commit().unwrap();
        assert_eq!(ledger.remaining(0).unwrap(), 20);
        assert_eq!(ledger.committed(0).unwrap(), 0);
    }

    #[test]
    fn reopening_keeps_values() {
        let store = PersistentStore::in_memory();
        let ledger = MeterLedger::open(store.clone(), 2).unwrap();
        let mut tx = ledger.begin();
        ledger.stage_advance(&mut tx, 1, 9).unwrap();
        tx.commit().unwrap();

        let reopened = MeterLedger::open(store, 2).unwrap();
        assert_eq!(reopened.ledger(1).unwrap(), 9);
        assert_eq!(reopened.len(), 2);
    }
}
