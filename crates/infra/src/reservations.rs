//! Reservation Manager: reservation entities on top of ledger holds.
//!
//! | state  | event   | next      | ledger effect             |
//! |--------|---------|-----------|---------------------------|
//! | -      | create  | active    | reserve (FEFO lines)      |
//! | active | cancel  | released  | release                   |
//! | active | fulfill | fulfilled | consume(from reservation) |
//! | active | timeout | released  | release                   |
//! | closed | any     | closed    | none                      |
//!
//! The ledger commit and the status write are separate. When a status write
//! is lost, the next fulfill or cancel reads the ledger to see how the holds
//! were closed and records that outcome instead of touching stock again.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use lotledger_core::{
    Clock, ExpectedVersion, LedgerError, LedgerResult, LocationId, LotId, MaterialId, OpContext,
    Quantity, ReservationId, ensure_positive,
};
use lotledger_events::{FulfilledLine, LedgerNotification, NotificationSink, ReservationFulfilled};
use lotledger_inventory::{
    DocumentRef, FefoRequest, Reservation, StockKey, StockRecord, Transition,
};

use crate::allocator::{FefoAllocator, is_replannable, plan_lines};
use crate::config::LedgerConfig;
use crate::ledger::StockLedger;
use crate::locks::KeyLocks;
use crate::movements::MovementRecorder;
use crate::repository::ReservationRepository;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationRequest {
    pub material_id: MaterialId,
    pub quantity: Quantity,
    pub lot_id: Option<LotId>,
    pub location_id: Option<LocationId>,
    /// Hold deadline; released by [`ReservationManager::expire_due`] after it.
    pub expires_at: Option<DateTime<Utc>>,
    pub reference: Option<DocumentRef>,
}

impl ReservationRequest {
    pub fn new(material_id: MaterialId, quantity: Quantity) -> Self {
        Self {
            material_id,
            quantity,
            lot_id: None,
            location_id: None,
            expires_at: None,
            reference: None,
        }
    }

    pub fn lot(mut self, lot_id: LotId) -> Self {
        self.lot_id = Some(lot_id);
        self
    }

    pub fn location(mut self, location_id: LocationId) -> Self {
        self.location_id = Some(location_id);
        self
    }

    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    pub fn reference(mut self, reference: DocumentRef) -> Self {
        self.reference = Some(reference);
        self
    }

    fn fefo(&self) -> FefoRequest {
        FefoRequest {
            material_id: self.material_id,
            quantity: self.quantity,
            location_id: self.location_id,
            lot_id: self.lot_id,
        }
    }
}

/// How the ledger closed the holds of a reservation still marked active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settled {
    Consumed,
    Released,
}

pub struct ReservationManager {
    reservations: Arc<dyn ReservationRepository>,
    ledger: Arc<StockLedger>,
    movements: Arc<MovementRecorder>,
    allocator: Arc<FefoAllocator>,
    sink: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    config: Arc<LedgerConfig>,
    locks: KeyLocks<ReservationId>,
}

impl ReservationManager {
    pub fn new(
        reservations: Arc<dyn ReservationRepository>,
        ledger: Arc<StockLedger>,
        movements: Arc<MovementRecorder>,
        allocator: Arc<FefoAllocator>,
        sink: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
        config: Arc<LedgerConfig>,
    ) -> Self {
        Self {
            reservations,
            ledger,
            movements,
            allocator,
            sink,
            clock,
            config,
            locks: KeyLocks::new(),
        }
    }

    /// Plan with FEFO and hold the planned lines. Re-plans when the commit
    /// loses a race, up to `max_commit_retries` times.
    pub fn create(&self, ctx: &OpContext, request: ReservationRequest) -> LedgerResult<Reservation> {
        ensure_positive(request.quantity, "reservation quantity")?;
        let id = ReservationId::new();

        let mut attempt = 0;
        let lines = loop {
            ctx.check()?;
            let plan = self.allocator.plan(&request.fefo())?;
            let lines = plan_lines(&plan);
            match self.ledger.reserve_lines(ctx, id, &lines) {
                Ok(()) => break lines,
                Err(err) if is_replannable(&err) && attempt < self.config.max_commit_retries => {
                    attempt += 1;
                    debug!(reservation_id = %id, attempt, error = %err, "reservation lost a race, re-planning");
                }
                Err(err) => return Err(err),
            }
        };

        let keys: Vec<StockKey> = lines.iter().map(|l| l.key).collect();
        let reservation = Reservation::new(
            id,
            request.material_id,
            request.lot_id,
            request.location_id,
            lines,
            request.reference,
            self.clock.now(),
            request.expires_at,
        );

        match self.reservations.insert(reservation) {
            Ok(stored) => {
                info!(
                    reservation_id = %id,
                    material_id = %stored.material_id(),
                    quantity = stored.quantity(),
                    lines = stored.lines().len(),
                    "reservation created"
                );
                Ok(stored)
            }
            Err(err) => {
                // The holds exist but nothing tracks them: give them back.
                if let Err(undo) = self.ledger.release_lines(&OpContext::background(), id, &keys) {
                    warn!(reservation_id = %id, error = %undo, "could not release orphaned holds");
                }
                Err(err.into())
            }
        }
    }

    pub fn get(&self, id: ReservationId) -> LedgerResult<Reservation> {
        self.reservations
            .get(id)?
            .ok_or_else(|| LedgerError::not_found(format!("reservation {id}")))
    }

    pub fn list_active(&self) -> LedgerResult<Vec<Reservation>> {
        Ok(self.reservations.list_active()?)
    }

    /// Release the holds. A closed reservation is returned unchanged.
    pub fn cancel(&self, ctx: &OpContext, id: ReservationId) -> LedgerResult<Reservation> {
        self.release(ctx, id, "cancelled").map(|(reservation, _)| reservation)
    }

    /// Consume the held stock. A closed reservation is returned unchanged.
    pub fn fulfill(
        &self,
        ctx: &OpContext,
        id: ReservationId,
        reference: Option<&DocumentRef>,
    ) -> LedgerResult<Reservation> {
        let _guard = self.locks.lock(&id);
        let mut reservation = self.get(id)?;
        if !reservation.is_active() {
            debug!(reservation_id = %id, status = ?reservation.status(), "fulfill on closed reservation ignored");
            return Ok(reservation);
        }

        let version = reservation.version();
        let records = match self.settled_in_ledger(&reservation)? {
            None => {
                let reference = reference.or(reservation.reference()).cloned();
                self.ledger
                    .consume_lines(ctx, reservation.lines(), Some(id), reference.as_ref())?
            }
            Some(Settled::Consumed) => {
                warn!(reservation_id = %id, "holds already consumed, recording fulfilment");
                self.current_records(&reservation)?
            }
            Some(Settled::Released) => {
                warn!(reservation_id = %id, "holds already released, recording release");
                reservation.release(self.clock.now());
                return Ok(self
                    .reservations
                    .update(reservation, ExpectedVersion::Exact(version))?);
            }
        };

        let now = self.clock.now();
        reservation.fulfill(now);
        let stored = self
            .reservations
            .update(reservation, ExpectedVersion::Exact(version))?;

        let lines = stored
            .lines()
            .iter()
            .zip(&records)
            .map(|(line, record)| FulfilledLine {
                lot_id: line.key.lot_id,
                location_id: line.key.location_id,
                quantity: line.quantity,
                remaining_on_hand: record.quantity(),
            })
            .collect();

        info!(reservation_id = %id, quantity = stored.quantity(), "reservation fulfilled");
        self.sink
            .notify(LedgerNotification::ReservationFulfilled(ReservationFulfilled {
                reservation_id: id,
                material_id: stored.material_id(),
                quantity: stored.quantity(),
                lines,
                occurred_at: now,
            }));
        Ok(stored)
    }

    /// Release every active reservation whose hold deadline is at or before
    /// `now`. Returns the ids that were released by this call.
    pub fn expire_due(&self, ctx: &OpContext, now: DateTime<Utc>) -> LedgerResult<Vec<ReservationId>> {
        let mut released = Vec::new();
        for due in self.reservations.list_due(now)? {
            ctx.check()?;
            let id = due.id_typed();
            if self.release(ctx, id, "timed out")?.1.is_applied() {
                released.push(id);
            }
        }
        Ok(released)
    }

    fn release(
        &self,
        ctx: &OpContext,
        id: ReservationId,
        reason: &'static str,
    ) -> LedgerResult<(Reservation, Transition)> {
        let _guard = self.locks.lock(&id);
        let mut reservation = self.get(id)?;
        if !reservation.is_active() {
            debug!(reservation_id = %id, status = ?reservation.status(), "release on closed reservation ignored");
            return Ok((reservation, Transition::Unchanged));
        }

        let version = reservation.version();
        if self.settled_in_ledger(&reservation)? == Some(Settled::Consumed) {
            warn!(reservation_id = %id, reason, "holds already consumed, recording fulfilment");
            reservation.fulfill(self.clock.now());
            let stored = self
                .reservations
                .update(reservation, ExpectedVersion::Exact(version))?;
            return Ok((stored, Transition::Unchanged));
        }

        let keys: Vec<StockKey> = reservation.lines().iter().map(|l| l.key).collect();
        let returned = self.ledger.release_lines(ctx, id, &keys)?;

        reservation.release(self.clock.now());
        let stored = self
            .reservations
            .update(reservation, ExpectedVersion::Exact(version))?;
        info!(reservation_id = %id, returned, reason, "reservation released");
        Ok((stored, Transition::Applied))
    }

    /// `None` while any line still holds stock for the reservation.
    /// Otherwise an issue movement tagged with the reservation tells a
    /// consumed reservation from a released one.
    fn settled_in_ledger(&self, reservation: &Reservation) -> LedgerResult<Option<Settled>> {
        let id = reservation.id_typed();
        let Some(first) = reservation.lines().first() else {
            return Ok(None);
        };
        for line in reservation.lines() {
            if self.ledger.get(line.key)?.and_then(|r| r.hold(id)).is_some() {
                return Ok(None);
            }
        }
        let consumed = self
            .movements
            .history(first.key)?
            .iter()
            .any(|m| m.reservation_id() == Some(id));
        Ok(Some(if consumed { Settled::Consumed } else { Settled::Released }))
    }

    fn current_records(&self, reservation: &Reservation) -> LedgerResult<Vec<StockRecord>> {
        reservation
            .lines()
            .iter()
            .map(|line| {
                Ok(self
                    .ledger
                    .get(line.key)?
                    .unwrap_or_else(|| StockRecord::new(line.key)))
            })
            .collect()
    }
}
