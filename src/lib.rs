//! Ledger for an energy grid.
//!
//! The crate tracks storage facilities (capacity plus current fill level) and
//! a single signed grid balance:
//!
//! * [`ledger`]: the [`GridLedger`] state machine, its journal and state root.
//! * [`calls`]: the typed call vocabulary a host uses to drive the ledger,
//!   amount validation and all-or-nothing batches.
//! * [`auth`]: ed25519 signed calls for hosts that authenticate callers.
//! * [`shared`]: a lock-serialised handle for multi-threaded hosts.
//! * [`config`]: ledger configuration loaded from JSON.

pub mod auth;
pub mod calls;
pub mod config;
pub mod ledger;
pub mod shared;

pub use calls::{CallOutcome, CallReceipt, LedgerCall};
pub use config::LedgerConfig;
pub use ledger::{GridLedger, LedgerError, StorageFacility};
pub use shared::SharedLedger;
