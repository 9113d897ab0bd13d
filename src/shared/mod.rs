use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::calls::{self, BatchError, CallOutcome, LedgerCall};
use crate::ledger::{
    Balance, Energy, FacilityId, GridLedger, LedgerError, LedgerSnapshot, StorageFacility,
};

/// Cloneable handle to one ledger shared between callers. Each mutation
/// holds the write lock for its whole body; reads share the lock and so
/// never observe a half-applied operation.
#[derive(Clone, Debug)]
pub struct SharedLedger {
    inner: Arc<RwLock<GridLedger>>,
}

impl SharedLedger {
    pub fn new(ledger: GridLedger) -> Self {
        Self {
            inner: Arc::new(RwLock::new(ledger)),
        }
    }

    // Operations check before writing, so a panic cannot leave a torn ledger
    // behind and a poisoned lock is safe to keep using.
    fn read(&self) -> RwLockReadGuard<'_, GridLedger> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, GridLedger> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_storage(&self, capacity: Energy, caller: &str) -> FacilityId {
        self.write().add_storage(capacity, caller)
    }

    pub fn store_energy(&self, id: FacilityId, amount: Energy) -> Result<(), LedgerError> {
        self.write().store_energy(id, amount)
    }

    pub fn release_energy(&self, id: FacilityId, amount: Energy) -> Result<(), LedgerError> {
        self.write().release_energy(id, amount)
    }

    pub fn update_grid_balance(
        &self,
        amount: Balance,
        caller: &str,
    ) -> Result<Balance, LedgerError> {
        self.write().update_grid_balance(amount, caller)
    }

    pub fn get_storage(&self, id: FacilityId) -> Result<StorageFacility, LedgerError> {
        self.read().get_storage(id).cloned()
    }

    pub fn get_grid_balance(&self) -> Balance {
        self.read().get_grid_balance()
    }

    pub fn apply(&self, caller: &str, call: &LedgerCall) -> Result<CallOutcome, LedgerError> {
        if let Some(result) = calls::query(&self.read(), call) {
            return result;
        }
        calls::apply(&mut self.write(), caller, call)
    }

    pub fn apply_batch(
        &self,
        caller: &str,
        batch: &[LedgerCall],
    ) -> Result<Vec<CallOutcome>, BatchError> {
        calls::apply_batch(&mut self.write(), caller, batch)
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        self.read().snapshot()
    }
}
