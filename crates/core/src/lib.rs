//! `lotledger-core`: building blocks shared by the stock/lot ledger.
//!
//! This crate contains **pure** primitives (no storage, no threads): typed
//! identifiers, the ledger error taxonomy, optimistic version checks, clocks,
//! cooperative cancellation and document-number sequences.

pub mod clock;
pub mod context;
pub mod entity;
pub mod error;
pub mod id;
pub mod sequence;
pub mod version;

pub use clock::{Clock, ManualClock, SystemClock};
pub use context::{CancellationFlag, OpContext};
pub use entity::Entity;
pub use error::{LedgerError, LedgerResult, checked_sum, ensure_positive};
pub use id::{LocationId, LotId, MaterialId, MovementId, ReservationId};
pub use sequence::SequenceService;
pub use version::ExpectedVersion;

/// Quantity in the material's smallest counting unit.
pub type Quantity = i64;
