use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

pub type FacilityId = u64;
pub type Principal = String;
pub type Energy = u64;
pub type Balance = i64;

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("storage facility {id} not found")]
    NotFound { id: FacilityId },
    #[error("storing {requested} in facility {id} exceeds capacity ({available} available)")]
    CapacityExceeded {
        id: FacilityId,
        requested: Energy,
        available: Energy,
    },
    #[error("releasing {requested} from facility {id} exceeds stored energy ({stored})")]
    InsufficientStored {
        id: FacilityId,
        requested: Energy,
        stored: Energy,
    },
    #[error("{caller} is not the grid administrator")]
    Unauthorized { caller: Principal },
    #[error("invalid amount {amount}: must be non-negative")]
    InvalidAmount { amount: i64 },
    #[error("grid balance out of range")]
    BalanceOverflow,
}

impl LedgerError {
    /// Stable wire name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            LedgerError::NotFound { .. } => "not_found",
            LedgerError::CapacityExceeded { .. } => "capacity_exceeded",
            LedgerError::InsufficientStored { .. } => "insufficient_stored",
            LedgerError::Unauthorized { .. } => "unauthorized",
            LedgerError::InvalidAmount { .. } => "invalid_amount",
            LedgerError::BalanceOverflow => "balance_overflow",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageFacility {
    pub id: FacilityId,
    pub capacity: Energy,
    pub current_level: Energy,
    pub owner: Principal,
}

impl StorageFacility {
    pub fn available_capacity(&self) -> Energy {
        self.capacity - self.current_level
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    StorageAdded {
        facility_id: FacilityId,
        capacity: Energy,
        owner: Principal,
    },
    EnergyStored {
        facility_id: FacilityId,
        amount: Energy,
        grid_balance: Balance,
    },
    EnergyReleased {
        facility_id: FacilityId,
        amount: Energy,
        grid_balance: Balance,
    },
    GridBalanceUpdated {
        caller: Principal,
        delta: Balance,
        grid_balance: Balance,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub height: u64,
    pub administrator: Principal,
    pub next_id: FacilityId,
    pub grid_balance: Balance,
    pub facilities: Vec<StorageFacility>,
    pub events: Vec<LedgerEvent>,
    #[serde(with = "hex_root")]
    pub state_root: [u8; 32],
}

/// Storage facilities and the aggregate grid balance, mutated one
/// operation at a time. Every operation validates before it writes, so a
/// failed call leaves the ledger exactly as it was.
///
/// The grid balance is an `i64`, so a single store or release larger than
/// `i64::MAX` fails with [`LedgerError::BalanceOverflow`] even when the
/// facility has room for it.
#[derive(Clone, Debug)]
pub struct GridLedger {
    administrator: Principal,
    facilities: BTreeMap<FacilityId, StorageFacility>,
    next_id: FacilityId,
    grid_balance: Balance,
    height: u64,
    events: Vec<LedgerEvent>,
    record_events: bool,
}

impl GridLedger {
    pub fn new(administrator: impl Into<Principal>) -> Self {
        Self {
            administrator: administrator.into(),
            facilities: BTreeMap::new(),
            next_id: 0,
            grid_balance: 0,
            height: 0,
            events: Vec::new(),
            record_events: true,
        }
    }

    /// Disables (or re-enables) the event journal. Height still advances.
    pub fn with_event_journal(mut self, enabled: bool) -> Self {
        self.record_events = enabled;
        self
    }

    pub fn administrator(&self) -> &str {
        &self.administrator
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn events(&self) -> &[LedgerEvent] {
        &self.events
    }

    pub fn facility_count(&self) -> usize {
        self.facilities.len()
    }

    pub fn add_storage(&mut self, capacity: Energy, caller: &str) -> FacilityId {
        self.next_id += 1;
        let id = self.next_id;
        self.facilities.insert(
            id,
            StorageFacility {
                id,
                capacity,
                current_level: 0,
                owner: caller.to_string(),
            },
        );
        debug!(facility_id = id, capacity, owner = caller, "storage facility added");
        self.commit(LedgerEvent::StorageAdded {
            facility_id: id,
            capacity,
            owner: caller.to_string(),
        });
        id
    }

    pub fn store_energy(&mut self, id: FacilityId, amount: Energy) -> Result<(), LedgerError> {
        let facility = self
            .facilities
            .get_mut(&id)
            .ok_or(LedgerError::NotFound { id })?;
        let available = facility.available_capacity();
        if amount > available {
            return Err(LedgerError::CapacityExceeded {
                id,
                requested: amount,
                available,
            });
        }
        let balance = self
            .grid_balance
            .checked_sub(signed(amount)?)
            .ok_or(LedgerError::BalanceOverflow)?;

        facility.current_level += amount;
        self.grid_balance = balance;
        debug!(facility_id = id, amount, balance, "energy stored");
        self.commit(LedgerEvent::EnergyStored {
            facility_id: id,
            amount,
            grid_balance: balance,
        });
        Ok(())
    }

    pub fn release_energy(&mut self, id: FacilityId, amount: Energy) -> Result<(), LedgerError> {
        let facility = self
            .facilities
            .get_mut(&id)
            .ok_or(LedgerError::NotFound { id })?;
        if facility.current_level < amount {
            return Err(LedgerError::InsufficientStored {
                id,
                requested: amount,
                stored: facility.current_level,
            });
        }
        let balance = self
            .grid_balance
            .checked_add(signed(amount)?)
            .ok_or(LedgerError::BalanceOverflow)?;

        facility.current_level -= amount;
        self.grid_balance = balance;
        debug!(facility_id = id, amount, balance, "energy released");
        self.commit(LedgerEvent::EnergyReleased {
            facility_id: id,
            amount,
            grid_balance: balance,
        });
        Ok(())
    }

    /// Adjusts the grid balance directly. Only the administrator may call this.
    pub fn update_grid_balance(
        &mut self,
        amount: Balance,
        caller: &str,
    ) -> Result<Balance, LedgerError> {
        if caller != self.administrator {
            warn!(caller, amount, "rejected grid balance update from non-administrator");
            return Err(LedgerError::Unauthorized {
                caller: caller.to_string(),
            });
        }
        let balance = self
            .grid_balance
            .checked_add(amount)
            .ok_or(LedgerError::BalanceOverflow)?;
        self.grid_balance = balance;
        debug!(amount, balance, "grid balance updated");
        self.commit(LedgerEvent::GridBalanceUpdated {
            caller: caller.to_string(),
            delta: amount,
            grid_balance: balance,
        });
        Ok(balance)
    }

    pub fn get_storage(&self, id: FacilityId) -> Result<&StorageFacility, LedgerError> {
        self.facilities.get(&id).ok_or(LedgerError::NotFound { id })
    }

    pub fn get_grid_balance(&self) -> Balance {
        self.grid_balance
    }

    pub fn facilities_owned_by<'a>(
        &'a self,
        owner: &'a str,
    ) -> impl Iterator<Item = &'a StorageFacility> + 'a {
        self.facilities.values().filter(move |f| f.owner == owner)
    }

    pub fn state_root(&self) -> [u8; 32] {
        compute_merkle_root(&self.facilities, self.grid_balance, self.next_id)
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            height: self.height,
            administrator: self.administrator.clone(),
            next_id: self.next_id,
            grid_balance: self.grid_balance,
            facilities: self.facilities.values().cloned().collect(),
            events: self.events.clone(),
            state_root: self.state_root(),
        }
    }

    /// Records the scalar state so a sequence of operations can be undone.
    /// Facilities the sequence modifies must be registered with
    /// [`Checkpoint::touch`] before they change.
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            next_id: self.next_id,
            grid_balance: self.grid_balance,
            height: self.height,
            events_len: self.events.len(),
            touched: BTreeMap::new(),
        }
    }

    pub fn rollback(&mut self, checkpoint: Checkpoint) {
        // facilities added after the checkpoint
        let _ = self.facilities.split_off(&(checkpoint.next_id + 1));
        for (id, facility) in checkpoint.touched {
            self.facilities.insert(id, facility);
        }
        self.next_id = checkpoint.next_id;
        self.grid_balance = checkpoint.grid_balance;
        self.height = checkpoint.height;
        self.events.truncate(checkpoint.events_len);
    }

    fn commit(&mut self, event: LedgerEvent) {
        self.height += 1;
        if self.record_events {
            self.events.push(event);
        }
    }
}

/// Undo point taken by [`GridLedger::checkpoint`]. Its size grows with the
/// facilities touched, not with the ledger's history.
#[derive(Clone, Debug)]
pub struct Checkpoint {
    next_id: FacilityId,
    grid_balance: Balance,
    height: u64,
    events_len: usize,
    touched: BTreeMap<FacilityId, StorageFacility>,
}

impl Checkpoint {
    /// Saves the current record of `id` unless it is already saved or was
    /// created after the checkpoint.
    pub fn touch(&mut self, ledger: &GridLedger, id: FacilityId) {
        if id > self.next_id || self.touched.contains_key(&id) {
            return;
        }
        if let Some(facility) = ledger.facilities.get(&id) {
            self.touched.insert(id, facility.clone());
        }
    }
}

fn signed(amount: Energy) -> Result<Balance, LedgerError> {
    Balance::try_from(amount).map_err(|_| LedgerError::BalanceOverflow)
}

fn compute_merkle_root(
    facilities: &BTreeMap<FacilityId, StorageFacility>,
    grid_balance: Balance,
    next_id: FacilityId,
) -> [u8; 32] {
    let mut leaves: Vec<[u8; 32]> = Vec::with_capacity(facilities.len() + 1);
    for (id, facility) in facilities {
        let mut hasher = Sha256::new();
        hasher.update(b"facility");
        hasher.update(id.to_le_bytes());
        hasher.update(facility.capacity.to_le_bytes());
        hasher.update(facility.current_level.to_le_bytes());
        hasher.update((facility.owner.len() as u64).to_le_bytes());
        hasher.update(facility.owner.as_bytes());
        leaves.push(hasher.finalize().into());
    }
    let mut hasher = Sha256::new();
    hasher.update(b"grid");
    hasher.update(grid_balance.to_le_bytes());
    hasher.update(next_id.to_le_bytes());
    leaves.push(hasher.finalize().into());
    build_merkle(leaves)
}

// `leaves` always holds at least the grid leaf.
fn build_merkle(mut leaves: Vec<[u8; 32]>) -> [u8; 32] {
    while leaves.len() > 1 {
        let mut next = Vec::with_capacity(leaves.len().div_ceil(2));
        for chunk in leaves.chunks(2) {
            let mut hasher = Sha256::new();
            hasher.update(b"node");
            hasher.update(chunk[0]);
            // odd tail is paired with itself
            hasher.update(chunk.get(1).unwrap_or(&chunk[0]));
            next.push(hasher.finalize().into());
        }
        leaves = next;
    }
    leaves[0]
}

mod hex_root {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let bytes = hex::decode(&encoded).map_err(D::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| D::Error::custom("state root must be 32 bytes"))
    }
}
