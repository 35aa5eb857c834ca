//! Infrastructure layer: repository ports and adapters, the ledger services
//! built on them, configuration and background maintenance.

pub mod allocator;
pub mod config;
pub mod goods;
pub mod jobs;
pub mod ledger;
pub mod locks;
pub mod lots;
pub mod movements;
pub mod repository;
pub mod reservations;
pub mod services;

#[cfg(test)]
mod test_support;


pub use allocator::{Availability, FefoAllocator};
pub use config::{ConfigError, LedgerConfig};
pub use goods::{GoodsFlow, GoodsIssue, GoodsReceipt, IssueResult, ReceiptLot, ReceiptResult};
pub use jobs::{MaintenanceSweep, SweepHandle, SweepReport};
pub use ledger::{ReservationHandle, StockLedger};
pub use lots::{LotRegistration, LotRegistry};
pub use movements::{MovementRecorder, Reconciliation};
pub use repository::{InMemoryLedgerStore, RepositoryError};
pub use reservations::{ReservationManager, ReservationRequest};
pub use services::{LedgerPorts, LedgerServices};
