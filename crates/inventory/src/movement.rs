//! Append-only movement log entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use lotledger_core::{
    Entity, LedgerResult, LocationId, LotId, MaterialId, MovementId, Quantity, ReservationId,
    checked_sum,
};

use crate::stock::StockKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementKind {
    Receipt,
    Issue,
    Adjustment,
    TransferOut,
    TransferIn,
}

impl MovementKind {
    /// Prefix of the movement's document number.
    pub fn number_prefix(self) -> &'static str {
        match self {
            MovementKind::Receipt => "GR",
            MovementKind::Issue => "GI",
            MovementKind::Adjustment => "ADJ",
            MovementKind::TransferOut | MovementKind::TransferIn => "TRF",
        }
    }
}

/// Kind of business document a movement originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    GoodsReceipt,
    GoodsIssue,
    WorkOrder,
    SalesOrder,
    Transfer,
    Adjustment,
    Reservation,
}

/// Reference to the originating business document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentRef {
    pub kind: DocumentKind,
    pub id: Option<Uuid>,
    pub number: Option<String>,
}

impl DocumentRef {
    pub fn new(kind: DocumentKind) -> Self {
        Self {
            kind,
            id: None,
            number: None,
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_number(mut self, number: impl Into<String>) -> Self {
        self.number = Some(number.into());
        self
    }
}

/// A quantity change produced by a ledger mutation, before the recorder
/// gives it an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MovementDraft {
    pub kind: MovementKind,
    pub key: StockKey,
    pub delta: Quantity,
    pub reservation_id: Option<ReservationId>,
}

impl MovementDraft {
    pub fn new(kind: MovementKind, key: StockKey, delta: Quantity) -> Self {
        Self {
            kind,
            key,
            delta,
            reservation_id: None,
        }
    }

    /// Issue that settled a reservation's hold.
    pub fn settling(mut self, reservation_id: Option<ReservationId>) -> Self {
        self.reservation_id = reservation_id;
        self
    }
}

/// Immutable record of a signed quantity delta on one stock record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Movement {
    id: MovementId,
    number: String,
    kind: MovementKind,
    key: StockKey,
    delta: Quantity,
    occurred_at: DateTime<Utc>,
    reference: Option<DocumentRef>,
    #[serde(default)]
    reservation_id: Option<ReservationId>,
}

impl Movement {
    pub fn from_draft(
        id: MovementId,
        number: impl Into<String>,
        draft: MovementDraft,
        occurred_at: DateTime<Utc>,
        reference: Option<DocumentRef>,
    ) -> Self {
        Self {
            id,
            number: number.into(),
            kind: draft.kind,
            key: draft.key,
            delta: draft.delta,
            occurred_at,
            reference,
            reservation_id: draft.reservation_id,
        }
    }

    pub fn id_typed(&self) -> MovementId {
        self.id
    }

    pub fn number(&self) -> &str {
        &self.number
    }

    pub fn kind(&self) -> MovementKind {
        self.kind
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

    /// Signed: positive adds to on-hand, negative removes.
    pub fn delta(&self) -> Quantity {
        self.delta
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn reference(&self) -> Option<&DocumentRef> {
        self.reference.as_ref()
    }

    /// Reservation whose hold this issue consumed.
    pub fn reservation_id(&self) -> Option<ReservationId> {
        self.reservation_id
    }
}

impl Entity for Movement {
    type Id = MovementId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

/// Sum of deltas recorded against `key`.
pub fn net_delta<'a>(
    movements: impl IntoIterator<Item = &'a Movement>,
    key: StockKey,
) -> LedgerResult<Quantity> {
    checked_sum(
        movements.into_iter().filter(|m| m.key == key).map(|m| m.delta),
        "movement total",
    )
}
