//! Lot Registry: lot identity, QC gating and the lifecycle transitions.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use lotledger_core::{
    Clock, ExpectedVersion, LedgerError, LedgerResult, LotId, MaterialId, Quantity,
    SequenceService, checked_sum,
};
use lotledger_events::{LedgerNotification, LotExpired, NotificationSink};
use lotledger_inventory::{Lot, NewLot, QcStatus, Transition};

use crate::config::LedgerConfig;
use crate::locks::{KeyGuard, KeyLocks};
use crate::repository::{LotRepository, RepositoryError, StockRepository};

const LOT_NUMBER_WIDTH: usize = 4;

/// Input for [`LotRegistry::register`]. Without a lot number one is generated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LotRegistration {
    pub material_id: MaterialId,
    pub lot_number: Option<String>,
    pub expiry_date: DateTime<Utc>,
    pub supplier_lot_number: Option<String>,
}

impl LotRegistration {
    pub fn new(material_id: MaterialId, expiry_date: DateTime<Utc>) -> Self {
        Self {
            material_id,
            lot_number: None,
            expiry_date,
            supplier_lot_number: None,
        }
    }

    pub fn number(mut self, lot_number: impl Into<String>) -> Self {
        self.lot_number = Some(lot_number.into());
        self
    }

    pub fn supplier_lot(mut self, supplier_lot_number: impl Into<String>) -> Self {
        self.supplier_lot_number = Some(supplier_lot_number.into());
        self
    }
}

pub struct LotRegistry {
    lots: Arc<dyn LotRepository>,
    stock: Arc<dyn StockRepository>,
    sequences: Arc<SequenceService>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn NotificationSink>,
    config: Arc<LedgerConfig>,
    locks: KeyLocks<LotId>,
}

impl LotRegistry {
    pub fn new(
        lots: Arc<dyn LotRepository>,
        stock: Arc<dyn StockRepository>,
        sequences: Arc<SequenceService>,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn NotificationSink>,
        config: Arc<LedgerConfig>,
    ) -> Self {
        Self {
            lots,
            stock,
            sequences,
            clock,
            sink,
            config,
            locks: KeyLocks::new(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Next `LOT-YYYYMM-NNNN` number for the month of `now`.
    pub fn next_lot_number(&self, now: DateTime<Utc>) -> String {
        let prefix = format!("LOT-{}", now.format("%Y%m"));
        self.sequences.next_formatted(&prefix, LOT_NUMBER_WIDTH)
    }

    pub fn register(&self, registration: LotRegistration) -> LedgerResult<Lot> {
        let now = self.now();
        let material_id = registration.material_id;
        let lot_number = match registration.lot_number {
            Some(number) => number.trim().to_string(),
            None => self.next_lot_number(now),
        };

        if self.lots.get_by_code(material_id, &lot_number)?.is_some() {
            return Err(LedgerError::duplicate_lot(material_id, lot_number));
        }

        let lot = Lot::new(
            LotId::new(),
            NewLot {
                material_id,
                lot_number: lot_number.clone(),
                expiry_date: registration.expiry_date,
                received_at: now,
                supplier_lot_number: registration.supplier_lot_number,
            },
        )?;

        let stored = self.lots.register(lot).map_err(|e| match e {
            RepositoryError::Duplicate(_) => LedgerError::duplicate_lot(material_id, lot_number.clone()),
            other => other.into(),
        })?;

        info!(
            lot_id = %stored.id_typed(),
            lot_number = %stored.lot_number(),
            material_id = %material_id,
            expiry_date = %stored.expiry_date(),
            "lot registered"
        );
        Ok(stored)
    }

    pub fn get(&self, id: LotId) -> LedgerResult<Lot> {
        self.lots
            .get_by_id(id)?
            .ok_or_else(|| LedgerError::not_found(format!("lot {id}")))
    }

    pub fn get_by_code(&self, material_id: MaterialId, lot_number: &str) -> LedgerResult<Option<Lot>> {
        Ok(self.lots.get_by_code(material_id, lot_number)?)
    }

    pub fn set_qc_status(&self, id: LotId, qc: QcStatus) -> LedgerResult<Lot> {
        let lot = self.transition(id, "qc", |lot, now| {
            if lot.needs_expiry_transition(now) {
                return Err(LedgerError::invalid_transition(format!(
                    "lot {} is past its expiry date",
                    lot.lot_number()
                )));
            }
            lot.set_qc_status(qc, now)
        })?;
        info!(lot_id = %id, qc = ?qc, status = ?lot.status(), "lot QC status set");
        Ok(lot)
    }

    pub fn block(&self, id: LotId) -> LedgerResult<Lot> {
        let lot = self.transition(id, "block", |lot, now| lot.block(now))?;
        info!(lot_id = %id, "lot blocked");
        Ok(lot)
    }

    pub fn unblock(&self, id: LotId) -> LedgerResult<Lot> {
        let lot = self.transition(id, "unblock", |lot, now| lot.unblock(now))?;
        info!(lot_id = %id, "lot unblocked");
        Ok(lot)
    }

    pub fn is_expiring_soon(&self, id: LotId, within_days: u32) -> LedgerResult<bool> {
        Ok(self.get(id)?.is_expiring_soon(self.now(), within_days))
    }

    pub fn days_until_expiry(&self, id: LotId) -> LedgerResult<i64> {
        Ok(self.get(id)?.days_until_expiry(self.now()))
    }

    /// Idempotent. Publishes `LotExpired` only for the call that applied the
    /// transition.
    pub fn mark_expired(&self, id: LotId) -> LedgerResult<Transition> {
        let mut applied = Transition::Unchanged;
        let lot = self.transition(id, "expire", |lot, now| {
            applied = lot.mark_expired(now);
            Ok(applied)
        })?;

        if applied.is_applied() {
            let on_hand = self.on_hand(id)?;
            warn!(
                lot_id = %id,
                lot_number = %lot.lot_number(),
                material_id = %lot.material_id(),
                on_hand,
                "lot expired"
            );
            self.sink.notify(LedgerNotification::LotExpired(LotExpired {
                material_id: lot.material_id(),
                lot_id: id,
                lot_number: lot.lot_number().to_string(),
                expiry_date: lot.expiry_date(),
                on_hand,
                occurred_at: lot.updated_at(),
            }));
        }
        Ok(applied)
    }

    /// Serialise stock additions to `ids` against [`Self::mark_consumed`].
    /// Must not be held while calling `mark_consumed`.
    pub fn lock_lots(&self, ids: &[LotId]) -> KeyGuard<'_> {
        self.locks.lock_all(ids)
    }

    /// Terminal transition once every record of the lot is at zero. A lot
    /// that still has stock anywhere is left unchanged.
    pub fn mark_consumed(&self, id: LotId) -> LedgerResult<Transition> {
        let _guard = self.locks.lock(&id);
        let mut applied = Transition::Unchanged;
        self.transition(id, "consume", |lot, now| {
            applied = if self.on_hand(id)? == 0 {
                lot.mark_consumed(now)
            } else {
                Transition::Unchanged
            };
            Ok(applied)
        })?;
        if applied.is_applied() {
            info!(lot_id = %id, "lot consumed");
        }
        Ok(applied)
    }

    /// Apply the `expired` transition to every lot whose date has passed.
    /// Returns the lots that transitioned.
    pub fn expire_overdue(&self) -> LedgerResult<Vec<LotId>> {
        let now = self.now();
        let mut expired = Vec::new();
        for lot in self.lots.list_expired(now)? {
            if !lot.needs_expiry_transition(now) {
                continue;
            }
            if self.mark_expired(lot.id_typed())?.is_applied() {
                expired.push(lot.id_typed());
            }
        }
        Ok(expired)
    }

    /// Load a lot for a stock mutation, applying a due expiry transition first.
    pub fn load_current(&self, id: LotId) -> LedgerResult<Lot> {
        let lot = self.get(id)?;
        if lot.needs_expiry_transition(self.now()) {
            self.mark_expired(id)?;
            return self.get(id);
        }
        Ok(lot)
    }

    pub fn list_expiring(&self, within_days: u32) -> LedgerResult<Vec<Lot>> {
        Ok(self.lots.list_expiring_within(self.now(), within_days)?)
    }

    pub fn list_expired(&self) -> LedgerResult<Vec<Lot>> {
        Ok(self.lots.list_expired(self.now())?)
    }

    pub fn list_by_material(&self, material_id: MaterialId) -> LedgerResult<Vec<Lot>> {
        Ok(self.lots.list_by_material(material_id)?)
    }

    /// On-hand quantity of the lot across all locations.
    pub fn on_hand(&self, id: LotId) -> LedgerResult<Quantity> {
        checked_sum(
            self.stock.list_by_lot(id)?.iter().map(|r| r.quantity()),
            "lot on-hand",
        )
    }

    /// Read-modify-write with version check, retried on conflicts.
    fn transition<F>(&self, id: LotId, action: &'static str, mut apply: F) -> LedgerResult<Lot>
    where
        F: FnMut(&mut Lot, DateTime<Utc>) -> LedgerResult<Transition>,
    {
        let mut attempt = 0;
        loop {
            let mut lot = self.get(id)?;
            let version = lot.version();
            if apply(&mut lot, self.now())? == Transition::Unchanged {
                return Ok(lot);
            }
            match self.lots.update_status(lot, ExpectedVersion::Exact(version)) {
                Ok(stored) => return Ok(stored),
                Err(RepositoryError::Conflict(msg)) if attempt < self.config.max_commit_retries => {
                    attempt += 1;
                    debug!(lot_id = %id, action, attempt, %msg, "lot update conflict, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
