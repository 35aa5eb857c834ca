//! Persistence ports for the ledger.
//!
//! The services in this crate depend only on these traits. Adapters may back
//! onto any durable store as long as they honour the version checks: every
//! write names the version it was computed from, and a mismatch rejects the
//! whole write with [`RepositoryError::Conflict`].

pub mod in_memory;

use chrono::{DateTime, Utc};
use thiserror::Error;

use lotledger_core::{
    ExpectedVersion, LedgerError, LocationId, LotId, MaterialId, ReservationId,
};
use lotledger_inventory::{Lot, Movement, Reservation, StockKey, StockRecord};

pub use in_memory::InMemoryLedgerStore;

/// Repository operation error.
///
/// These are infrastructure errors; services map them into [`LedgerError`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RepositoryError {
    /// Optimistic version check failed.
    #[error("version conflict: {0}")]
    Conflict(String),

    /// Unique key already taken.
    #[error("duplicate key: {0}")]
    Duplicate(String),

    #[error("storage failure: {0}")]
    Storage(String),
}

impl From<RepositoryError> for LedgerError {
    fn from(value: RepositoryError) -> Self {
        match value {
            RepositoryError::Conflict(msg) => LedgerError::concurrent(msg),
            RepositoryError::Duplicate(msg) => LedgerError::invalid_transition(msg),
            RepositoryError::Storage(msg) => LedgerError::storage(msg),
        }
    }
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// Lot persistence. Lot numbers are unique per material.
pub trait LotRepository: Send + Sync {
    /// Insert a new lot. Fails with `Duplicate` if the material already has a
    /// lot with the same number.
    fn register(&self, lot: Lot) -> RepositoryResult<Lot>;

    fn get_by_id(&self, id: LotId) -> RepositoryResult<Option<Lot>>;

    fn get_by_code(&self, material_id: MaterialId, lot_number: &str) -> RepositoryResult<Option<Lot>>;

    /// Replace the stored lot (status/QC changes). Returns the lot with its
    /// new version.
    fn update_status(&self, lot: Lot, expected: ExpectedVersion) -> RepositoryResult<Lot>;

    /// Lots whose expiry falls within `days` of `now`, not yet expired.
    fn list_expiring_within(&self, now: DateTime<Utc>, days: u32) -> RepositoryResult<Vec<Lot>>;

    /// Lots expired by status or by date.
    fn list_expired(&self, now: DateTime<Utc>) -> RepositoryResult<Vec<Lot>>;

    fn list_by_material(&self, material_id: MaterialId) -> RepositoryResult<Vec<Lot>>;
}

/// One stock record to persist, with the version it was computed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockWrite {
    pub record: StockRecord,
    pub expected: ExpectedVersion,
}

impl StockWrite {
    /// Write guarded by the record's own (as-loaded) version.
    pub fn guarded(record: StockRecord) -> Self {
        let expected = ExpectedVersion::Exact(record.version());
        Self { record, expected }
    }
}

/// Stock record persistence.
///
/// A record that was never written has version 0; each successful write
/// bumps it by one.
pub trait StockRepository: Send + Sync {
    fn get(&self, key: StockKey) -> RepositoryResult<Option<StockRecord>>;

    /// Apply every write and append every movement as one atomic unit.
    ///
    /// If any write's expected version does not match, nothing is applied and
    /// `Conflict` is returned. Returns the written records with their new
    /// versions, in input order.
    fn upsert_quantities(
        &self,
        writes: Vec<StockWrite>,
        movements: Vec<Movement>,
    ) -> RepositoryResult<Vec<StockRecord>>;

    fn list_by_material(&self, material_id: MaterialId) -> RepositoryResult<Vec<StockRecord>>;

    fn list_by_location(&self, location_id: LocationId) -> RepositoryResult<Vec<StockRecord>>;

    fn list_by_lot(&self, lot_id: LotId) -> RepositoryResult<Vec<StockRecord>>;
}

/// Append-only movement log.
pub trait MovementRepository: Send + Sync {
    fn append(&self, movements: Vec<Movement>) -> RepositoryResult<()>;

    /// Movements of one lot across locations, in append order.
    fn list_by_lot(&self, lot_id: LotId) -> RepositoryResult<Vec<Movement>>;

    fn list_by_key(&self, key: StockKey) -> RepositoryResult<Vec<Movement>>;
}

/// Reservation bookkeeping.
pub trait ReservationRepository: Send + Sync {
    fn insert(&self, reservation: Reservation) -> RepositoryResult<Reservation>;

    fn get(&self, id: ReservationId) -> RepositoryResult<Option<Reservation>>;

    fn update(&self, reservation: Reservation, expected: ExpectedVersion) -> RepositoryResult<Reservation>;

    fn list_active(&self) -> RepositoryResult<Vec<Reservation>>;

    /// Active reservations whose `expires_at` is at or before `now`.
    fn list_due(&self, now: DateTime<Utc>) -> RepositoryResult<Vec<Reservation>>;
}
