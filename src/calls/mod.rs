use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::ledger::{Balance, Energy, FacilityId, GridLedger, LedgerError, StorageFacility};

/// A single ledger operation as a host delivers it. Amounts are signed on
/// the wire and validated here before they reach the ledger.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LedgerCall {
    AddStorage {
        capacity: i64,
    },
    StoreEnergy {
        facility_id: FacilityId,
        amount: i64,
    },
    ReleaseEnergy {
        facility_id: FacilityId,
        amount: i64,
    },
    UpdateGridBalance {
        amount: Balance,
    },
    GetStorage {
        facility_id: FacilityId,
    },
    GetGridBalance,
}

impl LedgerCall {
    /// SHA-256 over a fixed binary encoding: one tag byte, then each
    /// field little-endian.
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(b"grid-ledger-call");
        match self {
            LedgerCall::AddStorage { capacity } => {
                hasher.update([0u8]);
                hasher.update(capacity.to_le_bytes());
            }
            LedgerCall::StoreEnergy {
                facility_id,
                amount,
            } => {
                hasher.update([1u8]);
                hasher.update(facility_id.to_le_bytes());
                hasher.update(amount.to_le_bytes());
            }
            LedgerCall::ReleaseEnergy {
                facility_id,
                amount,
            } => {
                hasher.update([2u8]);
                hasher.update(facility_id.to_le_bytes());
                hasher.update(amount.to_le_bytes());
            }
            LedgerCall::UpdateGridBalance { amount } => {
                hasher.update([3u8]);
                hasher.update(amount.to_le_bytes());
            }
            LedgerCall::GetStorage { facility_id } => {
                hasher.update([4u8]);
                hasher.update(facility_id.to_le_bytes());
            }
            LedgerCall::GetGridBalance => hasher.update([5u8]),
        }
        hasher.finalize().into()
    }

    /// The facility whose record this call can modify.
    fn touched_facility(&self) -> Option<FacilityId> {
        match self {
            LedgerCall::StoreEnergy { facility_id, .. }
            | LedgerCall::ReleaseEnergy { facility_id, .. } => Some(*facility_id),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum CallOutcome {
    FacilityId(FacilityId),
    Ok,
    Balance(Balance),
    Facility(StorageFacility),
}

/// Tagged success/failure form of a call result, as handed back to a host.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CallReceipt {
    Ok {
        outcome: CallOutcome,
    },
    Err {
        error: String,
        message: String,
    },
}

impl From<Result<CallOutcome, LedgerError>> for CallReceipt {
    fn from(result: Result<CallOutcome, LedgerError>) -> Self {
        match result {
            Ok(outcome) => CallReceipt::Ok { outcome },
            Err(err) => CallReceipt::Err {
                error: err.kind().to_string(),
                message: err.to_string(),
            },
        }
    }
}

fn energy_amount(amount: i64) -> Result<Energy, LedgerError> {
    Energy::try_from(amount).map_err(|_| LedgerError::InvalidAmount { amount })
}

/// Answers a read-only call, or returns `None` if the call mutates.
pub fn query(
    ledger: &GridLedger,
    call: &LedgerCall,
) -> Option<Result<CallOutcome, LedgerError>> {
    match call {
        LedgerCall::GetStorage { facility_id } => Some(facility_outcome(ledger, *facility_id)),
        LedgerCall::GetGridBalance => {
            Some(Ok(CallOutcome::Balance(ledger.get_grid_balance())))
        }
        _ => None,
    }
}

pub fn apply(
    ledger: &mut GridLedger,
    caller: &str,
    call: &LedgerCall,
) -> Result<CallOutcome, LedgerError> {
    match call {
        LedgerCall::AddStorage { capacity } => {
            let capacity = energy_amount(*capacity)?;
            Ok(CallOutcome::FacilityId(ledger.add_storage(capacity, caller)))
        }
        LedgerCall::StoreEnergy {
            facility_id,
            amount,
        } => {
            ledger.store_energy(*facility_id, energy_amount(*amount)?)?;
            Ok(CallOutcome::Ok)
        }
        LedgerCall::ReleaseEnergy {
            facility_id,
            amount,
        } => {
            ledger.release_energy(*facility_id, energy_amount(*amount)?)?;
            Ok(CallOutcome::Ok)
        }
        LedgerCall::UpdateGridBalance { amount } => ledger
            .update_grid_balance(*amount, caller)
            .map(CallOutcome::Balance),
        LedgerCall::GetStorage { facility_id } => facility_outcome(ledger, *facility_id),
        LedgerCall::GetGridBalance => Ok(CallOutcome::Balance(ledger.get_grid_balance())),
    }
}

fn facility_outcome(ledger: &GridLedger, id: FacilityId) -> Result<CallOutcome, LedgerError> {
    ledger
        .get_storage(id)
        .map(|facility| CallOutcome::Facility(facility.clone()))
}

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
#[error("batch call {index} failed: {source}")]
pub struct BatchError {
    pub index: usize,
    #[source]
    pub source: LedgerError,
}

/// Applies every call or none of them.
pub fn apply_batch(
    ledger: &mut GridLedger,
    caller: &str,
    calls: &[LedgerCall],
) -> Result<Vec<CallOutcome>, BatchError> {
    let mut checkpoint = ledger.checkpoint();
    let mut outcomes = Vec::with_capacity(calls.len());
    for (index, call) in calls.iter().enumerate() {
        if let Some(id) = call.touched_facility() {
            checkpoint.touch(ledger, id);
        }
        match apply(ledger, caller, call) {
            Ok(outcome) => outcomes.push(outcome),
            Err(source) => {
                warn!(index, error = %source, "batch rolled back");
                ledger.rollback(checkpoint);
                return Err(BatchError { index, source });
            }
        }
    }
    Ok(outcomes)
}
