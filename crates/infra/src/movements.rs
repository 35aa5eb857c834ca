//! Movement Recorder: numbering, traceability queries and reconciliation.
//!
//! Ledger mutations hand their movements to the stock port's atomic commit,
//! so the recorder only numbers them ([`MovementRecorder::stage`]). The
//! standalone [`MovementRecorder::record`] exists for movements whose
//! quantity change was committed by another system.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use lotledger_core::{LedgerResult, LotId, MovementId, Quantity, SequenceService};
use lotledger_inventory::{DocumentRef, Movement, MovementDraft, StockKey, net_delta};

use crate::repository::{MovementRepository, StockRepository};

const NUMBER_WIDTH: usize = 6;

/// Outcome of comparing the movement log with a stock record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Reconciliation {
    pub key: StockKey,
    pub movement_total: Quantity,
    pub record_quantity: Quantity,
}

impl Reconciliation {
    pub fn is_balanced(&self) -> bool {
        self.movement_total == self.record_quantity
    }
}

pub struct MovementRecorder {
    movements: Arc<dyn MovementRepository>,
    stock: Arc<dyn StockRepository>,
    sequences: Arc<SequenceService>,
}

impl MovementRecorder {
    pub fn new(
        movements: Arc<dyn MovementRepository>,
        stock: Arc<dyn StockRepository>,
        sequences: Arc<SequenceService>,
    ) -> Self {
        Self {
            movements,
            stock,
            sequences,
        }
    }

    /// Give drafts an identity and a document number (`GR-000001`, ...).
    ///
    /// Numbers are drawn even if the commit later fails; gaps are expected.
    pub fn stage(
        &self,
        drafts: &[MovementDraft],
        reference: Option<&DocumentRef>,
        at: DateTime<Utc>,
    ) -> Vec<Movement> {
        drafts
            .iter()
            .map(|draft| {
                let number = self
                    .sequences
                    .next_formatted(draft.kind.number_prefix(), NUMBER_WIDTH);
                Movement::from_draft(MovementId::new(), number, *draft, at, reference.cloned())
            })
            .collect()
    }

    /// Append an already-numbered movement on its own.
    pub fn record(&self, movement: Movement) -> LedgerResult<()> {
        let (number, kind, key, delta) = (
            movement.number().to_string(),
            movement.kind(),
            movement.key(),
            movement.delta(),
        );
        self.movements.append(vec![movement])?;
        info!(movement = %number, kind = ?kind, key = %key, delta, "movement recorded");
        Ok(())
    }

    pub fn history_by_lot(&self, lot_id: LotId) -> LedgerResult<Vec<Movement>> {
        Ok(self.movements.list_by_lot(lot_id)?)
    }

    pub fn history(&self, key: StockKey) -> LedgerResult<Vec<Movement>> {
        Ok(self.movements.list_by_key(key)?)
    }

    /// Sum of movement deltas for `key` against the record's on-hand quantity.
    pub fn reconcile(&self, key: StockKey) -> LedgerResult<Reconciliation> {
        let movements = self.movements.list_by_key(key)?;
        let record_quantity = self.stock.get(key)?.map(|r| r.quantity()).unwrap_or(0);
        Ok(Reconciliation {
            key,
            movement_total: net_delta(&movements, key)?,
            record_quantity,
        })
    }
}
