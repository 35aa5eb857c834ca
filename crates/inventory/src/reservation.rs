use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use lotledger_core::{Entity, LocationId, LotId, MaterialId, Quantity, ReservationId};

use crate::lot::Transition;
use crate::movement::DocumentRef;
use crate::stock::StockKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Active,
    Released,
    Fulfilled,
}

impl ReservationStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ReservationStatus::Active)
    }
}

/// One hold placed by a reservation on a stock record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationLine {
    pub key: StockKey,
    pub quantity: Quantity,
}

/// A promise of future consumption, backed by holds on one or more stock
/// records (one line per record).
///
/// Transitions out of `Active` are one-way; once `Released` or `Fulfilled`
/// every further event is a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    id: ReservationId,
    material_id: MaterialId,
    quantity: Quantity,
    lot_preference: Option<LotId>,
    location_preference: Option<LocationId>,
    lines: Vec<ReservationLine>,
    status: ReservationStatus,
    reference: Option<DocumentRef>,
    created_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    closed_at: Option<DateTime<Utc>>,
    version: u64,
}

impl Reservation {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: ReservationId,
        material_id: MaterialId,
        lot_preference: Option<LotId>,
        location_preference: Option<LocationId>,
        lines: Vec<ReservationLine>,
        reference: Option<DocumentRef>,
        created_at: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        let quantity = lines.iter().map(|l| l.quantity).sum();
        Self {
            id,
            material_id,
            quantity,
            lot_preference,
            location_preference,
            lines,
            status: ReservationStatus::Active,
            reference,
            created_at,
            expires_at,
            closed_at: None,
            version: 0,
        }
    }

    pub fn id_typed(&self) -> ReservationId {
        self.id
    }

    pub fn material_id(&self) -> MaterialId {
        self.material_id
    }

    pub fn quantity(&self) -> Quantity {
        self.quantity
    }

    pub fn lot_preference(&self) -> Option<LotId> {
        self.lot_preference
    }

    pub fn location_preference(&self) -> Option<LocationId> {
        self.location_preference
    }

    pub fn lines(&self) -> &[ReservationLine] {
        &self.lines
    }

    pub fn status(&self) -> ReservationStatus {
        self.status
    }

    pub fn reference(&self) -> Option<&DocumentRef> {
        self.reference.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn closed_at(&self) -> Option<DateTime<Utc>> {
        self.closed_at
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Used by repository adapters when persisting.
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == ReservationStatus::Active
    }

    /// Active and past its hold deadline.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_active() && self.expires_at.is_some_and(|at| at <= now)
    }

    /// Cancel or time out.
    pub fn release(&mut self, at: DateTime<Utc>) -> Transition {
        self.close(ReservationStatus::Released, at)
    }

    pub fn fulfill(&mut self, at: DateTime<Utc>) -> Transition {
        self.close(ReservationStatus::Fulfilled, at)
    }

    fn close(&mut self, to: ReservationStatus, at: DateTime<Utc>) -> Transition {
        if self.status.is_terminal() {
            return Transition::Unchanged;
        }
        self.status = to;
        self.closed_at = Some(at);
        Transition::Applied
    }
}

impl Entity for Reservation {
    type Id = ReservationId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}
