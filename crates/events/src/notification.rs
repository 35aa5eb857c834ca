//! Notifications the ledger publishes to external collaborators.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use lotledger_core::{LocationId, LotId, MaterialId, Quantity, ReservationId};

use crate::event::Event;

/// Event: a lot transitioned to `expired`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LotExpired {
    pub material_id: MaterialId,
    pub lot_id: LotId,
    pub lot_number: String,
    pub expiry_date: DateTime<Utc>,
    /// On-hand quantity stranded in the lot at the time of expiry.
    pub on_hand: Quantity,
    pub occurred_at: DateTime<Utc>,
}

/// Event: a lot crossed one of the configured expiry alert thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LotExpiringSoon {
    pub material_id: MaterialId,
    pub lot_id: LotId,
    pub lot_number: String,
    pub expiry_date: DateTime<Utc>,
    pub days_until_expiry: i64,
    pub alert_threshold_days: u32,
    pub on_hand: Quantity,
    pub occurred_at: DateTime<Utc>,
}

/// Event: available stock of a material fell below its reorder threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockBelowReorder {
    pub material_id: MaterialId,
    /// Lot whose mutation triggered the alert, when there was one.
    pub lot_id: Option<LotId>,
    pub on_hand: Quantity,
    pub available: Quantity,
    pub reorder_threshold: Quantity,
    pub occurred_at: DateTime<Utc>,
}

/// One consumed line of a fulfilled reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FulfilledLine {
    pub lot_id: Option<LotId>,
    pub location_id: LocationId,
    pub quantity: Quantity,
    /// On-hand quantity left on the stock record after consumption.
    pub remaining_on_hand: Quantity,
}

/// Event: a reservation was converted into an actual issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationFulfilled {
    pub reservation_id: ReservationId,
    pub material_id: MaterialId,
    pub quantity: Quantity,
    pub lines: Vec<FulfilledLine>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum LedgerNotification {
    LotExpired(LotExpired),
    LotExpiringSoon(LotExpiringSoon),
    StockBelowReorder(StockBelowReorder),
    ReservationFulfilled(ReservationFulfilled),
}

impl LedgerNotification {
    pub fn material_id(&self) -> MaterialId {
        match self {
            LedgerNotification::LotExpired(e) => e.material_id,
            LedgerNotification::LotExpiringSoon(e) => e.material_id,
            LedgerNotification::StockBelowReorder(e) => e.material_id,
            LedgerNotification::ReservationFulfilled(e) => e.material_id,
        }
    }
}

impl Event for LedgerNotification {
    fn event_type(&self) -> &'static str {
        match self {
            LedgerNotification::LotExpired(_) => "ledger.lot.expired",
            LedgerNotification::LotExpiringSoon(_) => "ledger.lot.expiring_soon",
            LedgerNotification::StockBelowReorder(_) => "ledger.stock.below_reorder",
            LedgerNotification::ReservationFulfilled(_) => "ledger.reservation.fulfilled",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            LedgerNotification::LotExpired(e) => e.occurred_at,
            LedgerNotification::LotExpiringSoon(e) => e.occurred_at,
            LedgerNotification::StockBelowReorder(e) => e.occurred_at,
            LedgerNotification::ReservationFulfilled(e) => e.occurred_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notifications_serialize_with_type_tag() {
        let n = LedgerNotification::StockBelowReorder(StockBelowReorder {
            material_id: MaterialId::new(),
            lot_id: None,
            on_hand: 40,
            available: 25,
            reorder_threshold: 50,
            occurred_at: Utc::now(),
        });

        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["type"], "stock_below_reorder");
        assert_eq!(json["data"]["available"], 25);
        assert_eq!(n.event_type(), "ledger.stock.below_reorder");
    }
}
