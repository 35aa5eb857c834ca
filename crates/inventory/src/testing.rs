//! Builders for lots and stock records in arbitrary states.
//!
//! Available to this crate's tests and, behind the `testing` feature, to
//! downstream test suites.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};

use lotledger_core::{LotId, MaterialId, Quantity, ReservationId};

use crate::lot::{Lot, LotStatus, QcStatus};
use crate::stock::{StockKey, StockRecord};

#[derive(Debug, Clone)]
pub struct LotBuilder {
    id: LotId,
    material_id: MaterialId,
    lot_number: Option<String>,
    received_at: DateTime<Utc>,
    expiry_date: DateTime<Utc>,
    qc_status: QcStatus,
    status: LotStatus,
}

impl Default for LotBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl LotBuilder {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: LotId::new(),
            material_id: MaterialId::new(),
            lot_number: None,
            received_at: now - Duration::days(1),
            expiry_date: now + Duration::days(365),
            qc_status: QcStatus::Pending,
            status: LotStatus::Available,
        }
    }

    pub fn id(mut self, id: LotId) -> Self {
        self.id = id;
        self
    }

    pub fn material(mut self, material_id: MaterialId) -> Self {
        self.material_id = material_id;
        self
    }

    pub fn number(mut self, lot_number: impl Into<String>) -> Self {
        self.lot_number = Some(lot_number.into());
        self
    }

    pub fn received(mut self, at: DateTime<Utc>) -> Self {
        self.received_at = at;
        self
    }

    pub fn expiry(mut self, at: DateTime<Utc>) -> Self {
        self.expiry_date = at;
        self
    }

    /// Expiry `days` whole days after `now`; negative means already past.
    pub fn expires_in(self, now: DateTime<Utc>, days: i64) -> Self {
        self.expiry(now + Duration::days(days))
    }

    pub fn qc(mut self, qc_status: QcStatus) -> Self {
        self.qc_status = qc_status;
        self
    }

    pub fn passed(self) -> Self {
        self.qc(QcStatus::Passed)
    }

    /// Failed QC, which also blocks the lot.
    pub fn failed(self) -> Self {
        self.qc(QcStatus::Failed).status(LotStatus::Blocked)
    }

    pub fn status(mut self, status: LotStatus) -> Self {
        self.status = status;
        self
    }

    pub fn build(self) -> Lot {
        let lot_number = self
            .lot_number
            .unwrap_or_else(|| format!("LOT-TEST-{}", &self.id.to_string()[..8]));
        Lot {
            id: self.id,
            lot_number,
            material_id: self.material_id,
            supplier_lot_number: None,
            received_at: self.received_at,
            expiry_date: self.expiry_date,
            qc_status: self.qc_status,
            status: self.status,
            updated_at: self.received_at,
            version: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StockRecordBuilder {
    key: StockKey,
    quantity: Quantity,
    holds: BTreeMap<ReservationId, Quantity>,
    version: u64,
}

impl StockRecordBuilder {
    pub fn new(key: StockKey) -> Self {
        Self {
            key,
            quantity: 0,
            holds: BTreeMap::new(),
            version: 0,
        }
    }

    pub fn quantity(mut self, quantity: Quantity) -> Self {
        self.quantity = quantity;
        self
    }

    /// Adds a hold. The caller keeps holds within the on-hand quantity.
    pub fn hold(mut self, reservation_id: ReservationId, quantity: Quantity) -> Self {
        self.holds.insert(reservation_id, quantity);
        self
    }

    pub fn version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn build(self) -> StockRecord {
        StockRecord {
            key: self.key,
            quantity: self.quantity,
            holds: self.holds,
            updated_at: None,
            version: self.version,
        }
    }
}
