//! Stock Ledger: the only writer of stock quantities.
//!
//! ## Commit pipeline
//!
//! Every mutation runs the same steps:
//!
//! ```text
//! validate input
//!   ↓
//! receipts: lock the touched lots (sorted stripes)
//!   ↓
//! lock the stripes of every touched StockKey (sorted)
//!   ↓
//! check context → gate lots → load records → apply domain rule → stage movements
//!   ↓
//! check context → upsert_quantities(records + movements, expected versions)
//!   ↓  conflict: retry from a fresh load, bounded by max_commit_retries
//! release locks → post-commit: low-stock alerts, retire depleted lots
//! ```
//!
//! Records and their movements are committed as one unit, so a storage fault
//! leaves neither behind.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use lotledger_core::{
    Clock, LedgerError, LedgerResult, LocationId, LotId, MaterialId, OpContext, Quantity,
    ReservationId, checked_sum, ensure_positive,
};
use lotledger_events::{LedgerNotification, NotificationSink, StockBelowReorder};
use lotledger_inventory::{
    DocumentRef, MovementDraft, MovementKind, ReservationLine, StockKey, StockRecord, StockSummary,
};

use crate::config::LedgerConfig;
use crate::locks::KeyLocks;
use crate::lots::LotRegistry;
use crate::movements::MovementRecorder;
use crate::repository::{RepositoryError, StockRepository, StockWrite};

/// Proof of a single-record hold, as returned by [`StockLedger::reserve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationHandle {
    pub reservation_id: ReservationId,
    pub key: StockKey,
    pub quantity: Quantity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LotGate {
    /// Receipts: lot must exist, match the material and not be terminal.
    Receipt,
    /// Reserve/consume: lot must be issuable.
    Issue,
    /// Lot must exist and match the material.
    Exists,
}

struct Loaded {
    original: StockRecord,
    current: StockRecord,
}

/// Working set of one commit attempt.
struct Mutation {
    at: DateTime<Utc>,
    records: BTreeMap<StockKey, Loaded>,
    drafts: Vec<MovementDraft>,
}

impl Mutation {
    fn load(stock: &dyn StockRepository, keys: &[StockKey], at: DateTime<Utc>) -> LedgerResult<Self> {
        let mut records = BTreeMap::new();
        for key in keys {
            if records.contains_key(key) {
                continue;
            }
            let record = stock.get(*key)?.unwrap_or_else(|| StockRecord::new(*key));
            records.insert(
                *key,
                Loaded {
                    original: record.clone(),
                    current: record,
                },
            );
        }
        Ok(Self {
            at,
            records,
            drafts: Vec::new(),
        })
    }

    fn record(&mut self, key: StockKey) -> LedgerResult<&mut StockRecord> {
        self.records
            .get_mut(&key)
            .map(|l| &mut l.current)
            .ok_or_else(|| LedgerError::storage(format!("stock record {key} was not loaded")))
    }

    fn emit(&mut self, kind: MovementKind, key: StockKey, delta: Quantity) {
        self.drafts.push(MovementDraft::new(kind, key, delta));
    }

    fn emit_settling(&mut self, key: StockKey, delta: Quantity, reservation_id: Option<ReservationId>) {
        self.drafts
            .push(MovementDraft::new(MovementKind::Issue, key, delta).settling(reservation_id));
    }

    /// Change in available quantity per material.
    fn available_deltas(&self) -> BTreeMap<MaterialId, (Quantity, Option<LotId>)> {
        let mut deltas: BTreeMap<MaterialId, (Quantity, Option<LotId>)> = BTreeMap::new();
        for (key, loaded) in &self.records {
            let delta = loaded.current.available() - loaded.original.available();
            if delta == 0 {
                continue;
            }
            let entry = deltas.entry(key.material_id).or_insert((0, None));
            entry.0 = entry.0.saturating_add(delta);
            if delta < 0 && entry.1.is_none() {
                entry.1 = key.lot_id;
            }
        }
        deltas
    }

    fn writes(&self) -> Vec<StockWrite> {
        self.records
            .values()
            .filter(|l| l.current != l.original)
            .map(|l| StockWrite::guarded(l.current.clone()))
            .collect()
    }
}

pub struct StockLedger {
    stock: Arc<dyn StockRepository>,
    lots: Arc<LotRegistry>,
    recorder: Arc<MovementRecorder>,
    locks: KeyLocks<StockKey>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn NotificationSink>,
    config: Arc<LedgerConfig>,
}

impl StockLedger {
    pub fn new(
        stock: Arc<dyn StockRepository>,
        lots: Arc<LotRegistry>,
        recorder: Arc<MovementRecorder>,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn NotificationSink>,
        config: Arc<LedgerConfig>,
    ) -> Self {
        Self {
            stock,
            lots,
            recorder,
            locks: KeyLocks::new(),
            clock,
            sink,
            config,
        }
    }

    pub fn receive(
        &self,
        ctx: &OpContext,
        key: StockKey,
        quantity: Quantity,
        reference: Option<&DocumentRef>,
    ) -> LedgerResult<StockRecord> {
        ensure_positive(quantity, "receipt quantity")?;
        let (_, records) = self.commit(ctx, "receive", &[key], LotGate::Receipt, reference, |m| {
            let at = m.at;
            m.record(key)?.receive(quantity, at)?;
            m.emit(MovementKind::Receipt, key, quantity);
            Ok(())
        })?;
        let record = Self::committed(records, key)?;
        info!(key = %key, quantity, on_hand = record.quantity(), "stock received");
        Ok(record)
    }

    /// Hold `quantity` of one record under a fresh reservation id.
    pub fn reserve(&self, ctx: &OpContext, key: StockKey, quantity: Quantity) -> LedgerResult<ReservationHandle> {
        let reservation_id = ReservationId::new();
        self.reserve_lines(ctx, reservation_id, &[ReservationLine { key, quantity }])?;
        Ok(ReservationHandle {
            reservation_id,
            key,
            quantity,
        })
    }

    /// Hold every line for `reservation_id`, all or nothing.
    pub fn reserve_lines(
        &self,
        ctx: &OpContext,
        reservation_id: ReservationId,
        lines: &[ReservationLine],
    ) -> LedgerResult<()> {
        let total = Self::validate_lines(lines, "reservation quantity")?;
        let keys: Vec<StockKey> = lines.iter().map(|l| l.key).collect();
        self.commit(ctx, "reserve", &keys, LotGate::Issue, None, |m| {
            let at = m.at;
            for line in lines {
                m.record(line.key)?.reserve(reservation_id, line.quantity, at)?;
            }
            Ok(())
        })?;
        info!(
            reservation_id = %reservation_id,
            lines = lines.len(),
            quantity = total,
            "stock reserved"
        );
        Ok(())
    }

    /// Idempotent: a second release of the same handle releases nothing.
    pub fn release(&self, ctx: &OpContext, handle: &ReservationHandle) -> LedgerResult<Quantity> {
        self.release_lines(ctx, handle.reservation_id, &[handle.key])
    }

    /// Close the holds of `reservation_id` on `keys`. Returns the quantity
    /// returned to the available pool (0 when nothing was held).
    pub fn release_lines(
        &self,
        ctx: &OpContext,
        reservation_id: ReservationId,
        keys: &[StockKey],
    ) -> LedgerResult<Quantity> {
        let (released, _) = self.commit(ctx, "release", keys, LotGate::Exists, None, |m| {
            let at = m.at;
            let mut released: Quantity = 0;
            for key in keys {
                let freed = m.record(*key)?.release(reservation_id, at).unwrap_or(0);
                released = released
                    .checked_add(freed)
                    .ok_or_else(|| LedgerError::invalid_quantity("released quantity overflows"))?;
            }
            Ok(released)
        })?;
        if released > 0 {
            info!(reservation_id = %reservation_id, released, "reservation released");
        } else {
            debug!(reservation_id = %reservation_id, "release was a no-op");
        }
        Ok(released)
    }

    pub fn consume(
        &self,
        ctx: &OpContext,
        key: StockKey,
        quantity: Quantity,
        from_reservation: Option<ReservationId>,
        reference: Option<&DocumentRef>,
    ) -> LedgerResult<StockRecord> {
        let mut records =
            self.consume_lines(ctx, &[ReservationLine { key, quantity }], from_reservation, reference)?;
        records
            .pop()
            .ok_or_else(|| LedgerError::storage(format!("no record committed for {key}")))
    }

    /// Consume every line in one commit. Returns the committed records in
    /// line order.
    pub fn consume_lines(
        &self,
        ctx: &OpContext,
        lines: &[ReservationLine],
        from_reservation: Option<ReservationId>,
        reference: Option<&DocumentRef>,
    ) -> LedgerResult<Vec<StockRecord>> {
        Self::validate_lines(lines, "issue quantity")?;
        let keys: Vec<StockKey> = lines.iter().map(|l| l.key).collect();
        let (_, committed) = self.commit(ctx, "consume", &keys, LotGate::Issue, reference, |m| {
            let at = m.at;
            for line in lines {
                m.record(line.key)?.consume(line.quantity, from_reservation, at)?;
                m.emit_settling(line.key, -line.quantity, from_reservation);
            }
            Ok(())
        })?;

        let mut records = Vec::with_capacity(lines.len());
        for line in lines {
            let record = Self::committed(committed.clone(), line.key)?;
            info!(
                key = %line.key,
                quantity = line.quantity,
                remaining = record.quantity(),
                reservation_id = ?from_reservation,
                "stock issued"
            );
            records.push(record);
        }
        Ok(records)
    }

    /// Signed correction, e.g. after a cycle count.
    pub fn adjust(
        &self,
        ctx: &OpContext,
        key: StockKey,
        delta: Quantity,
        reference: Option<&DocumentRef>,
    ) -> LedgerResult<StockRecord> {
        if delta == 0 {
            return Err(LedgerError::invalid_quantity("adjustment delta cannot be zero"));
        }
        // Positive corrections obey the receipt gate.
        let gate = if delta > 0 { LotGate::Receipt } else { LotGate::Exists };
        let (_, records) = self.commit(ctx, "adjust", &[key], gate, reference, |m| {
            let at = m.at;
            m.record(key)?.adjust(delta, at)?;
            m.emit(MovementKind::Adjustment, key, delta);
            Ok(())
        })?;
        let record = Self::committed(records, key)?;
        info!(key = %key, delta, on_hand = record.quantity(), "stock adjusted");
        Ok(record)
    }

    /// Move available stock to another location. Returns `(source, destination)`.
    pub fn transfer(
        &self,
        ctx: &OpContext,
        key: StockKey,
        to_location: LocationId,
        quantity: Quantity,
        reference: Option<&DocumentRef>,
    ) -> LedgerResult<(StockRecord, StockRecord)> {
        ensure_positive(quantity, "transfer quantity")?;
        if key.location_id == to_location {
            return Err(LedgerError::invalid_transition(format!(
                "transfer source and destination are both {to_location}"
            )));
        }
        let destination = key.at(to_location);
        let (_, records) = self.commit(ctx, "transfer", &[key, destination], LotGate::Exists, reference, |m| {
            let at = m.at;
            m.record(key)?.consume(quantity, None, at)?;
            m.emit(MovementKind::TransferOut, key, -quantity);
            m.record(destination)?.receive(quantity, at)?;
            m.emit(MovementKind::TransferIn, destination, quantity);
            Ok(())
        })?;

        let source = Self::committed(records.clone(), key)?;
        let dest = Self::committed(records, destination)?;
        info!(from = %key, to = %destination, quantity, "stock transferred");
        Ok((source, dest))
    }

    pub fn get(&self, key: StockKey) -> LedgerResult<Option<StockRecord>> {
        Ok(self.stock.get(key)?)
    }

    /// Read-only copy of a material's records, optionally at one location.
    pub fn snapshot(&self, material_id: MaterialId, location_id: Option<LocationId>) -> LedgerResult<Vec<StockRecord>> {
        let mut records = self.stock.list_by_material(material_id)?;
        if let Some(location_id) = location_id {
            records.retain(|r| r.location_id() == location_id);
        }
        Ok(records)
    }

    pub fn snapshot_location(&self, location_id: LocationId) -> LedgerResult<Vec<StockRecord>> {
        Ok(self.stock.list_by_location(location_id)?)
    }

    pub fn summary(&self, material_id: MaterialId) -> LedgerResult<StockSummary> {
        let records = self.stock.list_by_material(material_id)?;
        StockSummary::of(material_id, &records)
    }

    /// Reject empty, non-positive or duplicate lines. Returns the line total.
    fn validate_lines(lines: &[ReservationLine], what: &str) -> LedgerResult<Quantity> {
        if lines.is_empty() {
            return Err(LedgerError::invalid_quantity(format!("{what}: no lines")));
        }
        let mut seen = BTreeSet::new();
        for line in lines {
            ensure_positive(line.quantity, what)?;
            if !seen.insert(line.key) {
                return Err(LedgerError::invalid_transition(format!("duplicate line for {}", line.key)));
            }
        }
        checked_sum(lines.iter().map(|l| l.quantity), what)
    }

    fn committed(records: Vec<StockRecord>, key: StockKey) -> LedgerResult<StockRecord> {
        records
            .into_iter()
            .find(|r| r.key() == key)
            .ok_or_else(|| LedgerError::storage(format!("no record committed for {key}")))
    }

    fn gate_lots(&self, keys: &[StockKey], gate: LotGate, now: DateTime<Utc>) -> LedgerResult<()> {
        let mut checked = BTreeSet::new();
        for key in keys {
            let Some(lot_id) = key.lot_id else { continue };
            if !checked.insert(lot_id) {
                continue;
            }
            let lot = self.lots.load_current(lot_id)?;
            if lot.material_id() != key.material_id {
                return Err(LedgerError::invalid_transition(format!(
                    "lot {} belongs to material {}, not {}",
                    lot.lot_number(),
                    lot.material_id(),
                    key.material_id
                )));
            }
            match gate {
                LotGate::Receipt => lot.ensure_accepts_receipt(now)?,
                LotGate::Issue => lot.ensure_issuable(now)?,
                LotGate::Exists => {}
            }
        }
        Ok(())
    }

    /// Run one read-modify-write under the per-key locks, retrying version
    /// conflicts from a fresh load. Returns what `apply` returned and the
    /// committed records (empty when `apply` changed nothing).
    ///
    /// Receipt-gated commits also hold the lot locks, so a lot cannot be
    /// retired between the gate and the write. Post-commit work runs after
    /// every lock is released.
    fn commit<T, F>(
        &self,
        ctx: &OpContext,
        op: &'static str,
        keys: &[StockKey],
        gate: LotGate,
        reference: Option<&DocumentRef>,
        apply: F,
    ) -> LedgerResult<(T, Vec<StockRecord>)>
    where
        F: FnMut(&mut Mutation) -> LedgerResult<T>,
    {
        ctx.check()?;
        let (value, committed, mutation) = {
            let lot_ids: Vec<LotId> = keys.iter().filter_map(|k| k.lot_id).collect();
            let _lots = (gate == LotGate::Receipt).then(|| self.lots.lock_lots(&lot_ids));
            let _keys = self.locks.lock_all(keys);
            self.commit_locked(ctx, op, keys, gate, reference, apply)?
        };
        if let Some(mutation) = mutation {
            self.after_commit(&mutation);
        }
        Ok((value, committed))
    }

    fn commit_locked<T, F>(
        &self,
        ctx: &OpContext,
        op: &'static str,
        keys: &[StockKey],
        gate: LotGate,
        reference: Option<&DocumentRef>,
        mut apply: F,
    ) -> LedgerResult<(T, Vec<StockRecord>, Option<Mutation>)>
    where
        F: FnMut(&mut Mutation) -> LedgerResult<T>,
    {
        let mut attempt: u32 = 0;
        loop {
            ctx.check()?;
            let now = self.clock.now();
            self.gate_lots(keys, gate, now)?;

            let mut mutation = Mutation::load(self.stock.as_ref(), keys, now)?;
            let value = apply(&mut mutation)?;
            let writes = mutation.writes();
            if writes.is_empty() {
                return Ok((value, Vec::new(), None));
            }

            ctx.check()?;
            let movements = self.recorder.stage(&mutation.drafts, reference, now);
            match self.stock.upsert_quantities(writes, movements) {
                Ok(committed) => return Ok((value, committed, Some(mutation))),
                Err(RepositoryError::Conflict(msg)) if attempt < self.config.max_commit_retries => {
                    attempt += 1;
                    debug!(op, attempt, %msg, "stock commit conflict, retrying");
                }
                Err(RepositoryError::Conflict(msg)) => {
                    warn!(op, attempts = attempt + 1, %msg, "stock commit retries exhausted");
                    return Err(LedgerError::concurrent(format!(
                        "{op} gave up after {} attempts: {msg}",
                        attempt + 1
                    )));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn after_commit(&self, mutation: &Mutation) {
        for (material_id, (delta, lot_id)) in mutation.available_deltas() {
            if delta < 0 {
                self.check_reorder(material_id, lot_id, delta, mutation.at);
            }
        }

        let depleted: BTreeSet<LotId> = mutation
            .drafts
            .iter()
            .filter(|d| d.delta < 0 && matches!(d.kind, MovementKind::Issue | MovementKind::Adjustment))
            .filter_map(|d| d.key.lot_id)
            .collect();
        for lot_id in depleted {
            if let Err(err) = self.lots.mark_consumed(lot_id) {
                warn!(lot_id = %lot_id, error = %err, "could not retire depleted lot");
            }
        }
    }

    /// Alert when available stock falls from at-or-above the threshold to
    /// below it.
    fn check_reorder(&self, material_id: MaterialId, lot_id: Option<LotId>, delta: Quantity, now: DateTime<Utc>) {
        let Some(threshold) = self.config.reorder_threshold_for(material_id) else {
            return;
        };
        let summary = match self.summary(material_id) {
            Ok(summary) => summary,
            Err(err) => {
                warn!(material_id = %material_id, error = %err, "reorder check skipped");
                return;
            }
        };
        let before = summary.available.saturating_sub(delta);
        if before >= threshold && summary.available < threshold {
            warn!(
                material_id = %material_id,
                available = summary.available,
                reorder_threshold = threshold,
                "stock below reorder threshold"
            );
            self.sink.notify(LedgerNotification::StockBelowReorder(StockBelowReorder {
                material_id,
                lot_id,
                on_hand: summary.on_hand,
                available: summary.available,
                reorder_threshold: threshold,
                occurred_at: now,
            }));
        }
    }

}
