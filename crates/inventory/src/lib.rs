//! Stock/lot ledger domain module.
//!
//! This crate contains the business rules for lots, per-location stock
//! records, reservations, the movement log and FEFO planning, implemented
//! purely as deterministic domain logic (no IO, no locking, no storage).

pub mod fefo;
pub mod lot;
pub mod movement;
pub mod reservation;
pub mod stock;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use fefo::{AllocationLine, AllocationPlan, FefoRequest, eligible_quantity, plan_fefo};
pub use lot::{Lot, LotStatus, NewLot, QcStatus, Transition};
pub use movement::{DocumentKind, DocumentRef, Movement, MovementDraft, MovementKind, net_delta};
pub use reservation::{Reservation, ReservationLine, ReservationStatus};
pub use stock::{StockKey, StockRecord, StockSummary};
