use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use lotledger_core::{
    LedgerError, LedgerResult, LocationId, LotId, MaterialId, Quantity, ReservationId,
    ensure_positive,
};

/// Identity of a stock record: one lot (or unlotted stock) at one location.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StockKey {
    pub material_id: MaterialId,
    pub location_id: LocationId,
    pub lot_id: Option<LotId>,
}

impl StockKey {
    pub fn new(material_id: MaterialId, location_id: LocationId, lot_id: Option<LotId>) -> Self {
        Self {
            material_id,
            location_id,
            lot_id,
        }
    }

    /// Same material and lot, different location.
    pub fn at(self, location_id: LocationId) -> Self {
        Self {
            location_id,
            ..self
        }
    }
}

impl core::fmt::Display for StockKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.lot_id {
            Some(lot) => write!(f, "{}@{}#{}", self.material_id, self.location_id, lot),
            None => write!(f, "{}@{}", self.material_id, self.location_id),
        }
    }
}

/// Quantity of one lot at one location.
///
/// Reserved quantity is the sum of open holds, and available quantity is
/// always `quantity - reserved`; neither can be set independently. Every
/// mutator validates before changing anything, so a failed call leaves the
/// record untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockRecord {
    pub(crate) key: StockKey,
    pub(crate) quantity: Quantity,
    pub(crate) holds: BTreeMap<ReservationId, Quantity>,
    pub(crate) updated_at: Option<DateTime<Utc>>,
    pub(crate) version: u64,
}

impl StockRecord {
    /// Empty record, as created on first receipt into a location.
    pub fn new(key: StockKey) -> Self {
        Self {
            key,
            quantity: 0,
            holds: BTreeMap::new(),
            updated_at: None,
            version: 0,
        }
    }

    pub fn key(&self) -> StockKey {
        self.key
    }

    pub fn material_id(&self) -> MaterialId {
        self.key.material_id
    }

    pub fn location_id(&self) -> LocationId {
        self.key.location_id
    }

    pub fn lot_id(&self) -> Option<LotId> {
        self.key.lot_id
    }

    /// On-hand quantity.
    pub fn quantity(&self) -> Quantity {
        self.quantity
    }

    /// Holds never exceed on-hand, so the sum stays in range.
    pub fn reserved(&self) -> Quantity {
        self.holds.values().fold(0, |total, q| total.saturating_add(*q))
    }

    pub fn available(&self) -> Quantity {
        self.quantity - self.reserved()
    }

    pub fn hold(&self, reservation_id: ReservationId) -> Option<Quantity> {
        self.holds.get(&reservation_id).copied()
    }

    pub fn holds(&self) -> impl Iterator<Item = (ReservationId, Quantity)> + '_ {
        self.holds.iter().map(|(id, q)| (*id, *q))
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    /// Store-assigned version (0 = never persisted).
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Used by repository adapters when persisting.
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.quantity == 0 && self.holds.is_empty()
    }

    pub fn receive(&mut self, quantity: Quantity, at: DateTime<Utc>) -> LedgerResult<()> {
        ensure_positive(quantity, "receipt quantity")?;
        self.quantity = self
            .quantity
            .checked_add(quantity)
            .ok_or_else(|| LedgerError::invalid_quantity("on-hand quantity overflow"))?;
        self.updated_at = Some(at);
        Ok(())
    }

    /// Open a hold of `quantity` for `reservation_id`.
    pub fn reserve(
        &mut self,
        reservation_id: ReservationId,
        quantity: Quantity,
        at: DateTime<Utc>,
    ) -> LedgerResult<()> {
        ensure_positive(quantity, "reservation quantity")?;
        if self.holds.contains_key(&reservation_id) {
            return Err(LedgerError::invalid_transition(format!(
                "reservation {reservation_id} already holds stock on {}",
                self.key
            )));
        }
        let available = self.available();
        if quantity > available {
            return Err(LedgerError::insufficient(quantity, available));
        }
        self.holds.insert(reservation_id, quantity);
        self.updated_at = Some(at);
        Ok(())
    }

    /// Close the hold for `reservation_id`, returning its quantity to the
    /// available pool. Returns `None` if no such hold is open.
    pub fn release(&mut self, reservation_id: ReservationId, at: DateTime<Utc>) -> Option<Quantity> {
        let released = self.holds.remove(&reservation_id)?;
        self.updated_at = Some(at);
        Some(released)
    }

    /// Remove `quantity` from on-hand.
    ///
    /// With `from_reservation`, the hold is drawn down first and any excess
    /// must come from available stock. Without it, only available stock may
    /// be consumed: other consumers' holds are never touched. Returns the
    /// amount drawn from the hold.
    pub fn consume(
        &mut self,
        quantity: Quantity,
        from_reservation: Option<ReservationId>,
        at: DateTime<Utc>,
    ) -> LedgerResult<Quantity> {
        ensure_positive(quantity, "issue quantity")?;

        let held = match from_reservation {
            Some(id) => self.hold(id).ok_or_else(|| {
                LedgerError::invalid_transition(format!(
                    "reservation {id} holds no stock on {}",
                    self.key
                ))
            })?,
            None => 0,
        };
        let from_hold = quantity.min(held);
        let available = self.available();
        if quantity - from_hold > available {
            return Err(LedgerError::insufficient(quantity, available + from_hold));
        }

        if let Some(id) = from_reservation {
            if from_hold == held {
                self.holds.remove(&id);
            } else {
                self.holds.insert(id, held - from_hold);
            }
        }
        self.quantity -= quantity;
        self.updated_at = Some(at);
        Ok(from_hold)
    }

    /// Signed correction (cycle count). The result may not drop below the
    /// reserved quantity.
    pub fn adjust(&mut self, delta: Quantity, at: DateTime<Utc>) -> LedgerResult<()> {
        if delta == 0 {
            return Err(LedgerError::invalid_quantity("adjustment delta cannot be zero"));
        }
        let next = self
            .quantity
            .checked_add(delta)
            .ok_or_else(|| LedgerError::invalid_quantity("on-hand quantity overflow"))?;
        if next < self.reserved() {
            return Err(LedgerError::insufficient(-delta, self.available()));
        }
        self.quantity = next;
        self.updated_at = Some(at);
        Ok(())
    }
}

/// Aggregated quantities of one material across records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockSummary {
    pub material_id: MaterialId,
    pub on_hand: Quantity,
    pub reserved: Quantity,
    pub available: Quantity,
}

impl StockSummary {
    pub fn of<'a>(
        material_id: MaterialId,
        records: impl IntoIterator<Item = &'a StockRecord>,
    ) -> LedgerResult<Self> {
        let mut summary = Self {
            material_id,
            on_hand: 0,
            reserved: 0,
            available: 0,
        };
        for record in records {
            if record.material_id() != material_id {
                continue;
            }
            summary.on_hand = add(summary.on_hand, record.quantity(), "on-hand total")?;
            summary.reserved = add(summary.reserved, record.reserved(), "reserved total")?;
            summary.available = add(summary.available, record.available(), "available total")?;
        }
        Ok(summary)
    }
}

fn add(total: Quantity, quantity: Quantity, what: &str) -> LedgerResult<Quantity> {
    total
        .checked_add(quantity)
        .ok_or_else(|| LedgerError::invalid_quantity(format!("{what} overflows")))
}
