use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use lotledger_core::{Entity, ExpectedVersion, LocationId, LotId, MaterialId, ReservationId};
use lotledger_inventory::{Lot, Movement, Reservation, StockKey, StockRecord};

use super::{
    LotRepository, MovementRepository, RepositoryError, RepositoryResult, ReservationRepository,
    StockRepository, StockWrite,
};

/// Insert or replace by entity id, returning the stored copy.
fn put<E>(map: &mut HashMap<E::Id, E>, entity: E) -> E
where
    E: Entity + Clone,
{
    map.insert(entity.id().clone(), entity.clone());
    entity
}

#[derive(Debug, Default)]
struct State {
    lots: HashMap<LotId, Lot>,
    lot_codes: HashMap<(MaterialId, String), LotId>,
    stock: BTreeMap<StockKey, StockRecord>,
    movements: Vec<Movement>,
    reservations: HashMap<ReservationId, Reservation>,
}

/// In-memory implementation of every ledger port.
///
/// Intended for tests/dev. All state sits behind one `RwLock`, so a stock
/// commit and its movements become visible together. Readers take the shared
/// lock only for the duration of a copy.
#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    state: RwLock<State>,
    injected_faults: AtomicUsize,
    injected_conflicts: AtomicUsize,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` commits (stock upserts or movement appends) fail
    /// with a storage error, leaving state untouched.
    pub fn fail_next_commits(&self, n: usize) {
        self.injected_faults.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` stock upserts report a version conflict, as if a
    /// writer in another process got there first.
    pub fn conflict_next_commits(&self, n: usize) {
        self.injected_conflicts.store(n, Ordering::SeqCst);
    }

    pub fn movement_count(&self) -> usize {
        self.read().map(|s| s.movements.len()).unwrap_or(0)
    }

    fn read(&self) -> RepositoryResult<RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|_| RepositoryError::Storage("lock poisoned".to_string()))
    }

    fn write(&self) -> RepositoryResult<RwLockWriteGuard<'_, State>> {
        self.state
            .write()
            .map_err(|_| RepositoryError::Storage("lock poisoned".to_string()))
    }

    fn take_injected(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn check_faults(&self) -> RepositoryResult<()> {
        if Self::take_injected(&self.injected_faults) {
            return Err(RepositoryError::Storage("injected storage fault".to_string()));
        }
        Ok(())
    }
}

impl LotRepository for InMemoryLedgerStore {
    fn register(&self, lot: Lot) -> RepositoryResult<Lot> {
        let mut state = self.write()?;
        let code = (lot.material_id(), lot.lot_number().to_string());
        if state.lot_codes.contains_key(&code) {
            return Err(RepositoryError::Duplicate(format!(
                "lot '{}' already exists for material {}",
                code.1, code.0
            )));
        }
        if state.lots.contains_key(&lot.id_typed()) {
            return Err(RepositoryError::Duplicate(format!("lot id {}", lot.id_typed())));
        }

        state.lot_codes.insert(code, lot.id_typed());
        Ok(put(&mut state.lots, lot.with_version(1)))
    }

    fn get_by_id(&self, id: LotId) -> RepositoryResult<Option<Lot>> {
        Ok(self.read()?.lots.get(&id).cloned())
    }

    fn get_by_code(&self, material_id: MaterialId, lot_number: &str) -> RepositoryResult<Option<Lot>> {
        let state = self.read()?;
        Ok(state
            .lot_codes
            .get(&(material_id, lot_number.to_string()))
            .and_then(|id| state.lots.get(id))
            .cloned())
    }

    fn update_status(&self, lot: Lot, expected: ExpectedVersion) -> RepositoryResult<Lot> {
        let mut state = self.write()?;
        let current = state
            .lots
            .get(&lot.id_typed())
            .ok_or_else(|| RepositoryError::Conflict(format!("lot {} does not exist", lot.id_typed())))?;
        if !expected.matches(current.version()) {
            return Err(RepositoryError::Conflict(format!(
                "lot {}: expected {expected:?}, found {}",
                lot.id_typed(),
                current.version()
            )));
        }
        let next = current.version() + 1;
        Ok(put(&mut state.lots, lot.with_version(next)))
    }

    fn list_expiring_within(&self, now: DateTime<Utc>, days: u32) -> RepositoryResult<Vec<Lot>> {
        let state = self.read()?;
        let mut lots: Vec<Lot> = state
            .lots
            .values()
            .filter(|l| l.is_expiring_soon(now, days))
            .cloned()
            .collect();
        lots.sort_by_key(|l| (l.expiry_date(), l.id_typed()));
        Ok(lots)
    }

    fn list_expired(&self, now: DateTime<Utc>) -> RepositoryResult<Vec<Lot>> {
        let state = self.read()?;
        let mut lots: Vec<Lot> = state
            .lots
            .values()
            .filter(|l| l.is_expired(now))
            .cloned()
            .collect();
        lots.sort_by_key(|l| (l.expiry_date(), l.id_typed()));
        Ok(lots)
    }

    fn list_by_material(&self, material_id: MaterialId) -> RepositoryResult<Vec<Lot>> {
        let state = self.read()?;
        let mut lots: Vec<Lot> = state
            .lots
            .values()
            .filter(|l| l.material_id() == material_id)
            .cloned()
            .collect();
        lots.sort_by_key(|l| (l.expiry_date(), l.id_typed()));
        Ok(lots)
    }
}

impl StockRepository for InMemoryLedgerStore {
    fn get(&self, key: StockKey) -> RepositoryResult<Option<StockRecord>> {
        Ok(self.read()?.stock.get(&key).cloned())
    }

    fn upsert_quantities(
        &self,
        writes: Vec<StockWrite>,
        movements: Vec<Movement>,
    ) -> RepositoryResult<Vec<StockRecord>> {
        self.check_faults()?;
        if Self::take_injected(&self.injected_conflicts) {
            return Err(RepositoryError::Conflict("injected version conflict".to_string()));
        }

        let mut state = self.write()?;

        // Validate the whole batch before touching anything.
        for write in &writes {
            let key = write.record.key();
            let current = state.stock.get(&key).map(|r| r.version()).unwrap_or(0);
            if !write.expected.matches(current) {
                return Err(RepositoryError::Conflict(format!(
                    "stock {key}: expected {:?}, found {current}",
                    write.expected
                )));
            }
        }

        let mut committed = Vec::with_capacity(writes.len());
        for write in writes {
            let key = write.record.key();
            let next = state.stock.get(&key).map(|r| r.version()).unwrap_or(0) + 1;
            let stored = write.record.with_version(next);
            state.stock.insert(key, stored.clone());
            committed.push(stored);
        }
        state.movements.extend(movements);
        Ok(committed)
    }

    fn list_by_material(&self, material_id: MaterialId) -> RepositoryResult<Vec<StockRecord>> {
        let state = self.read()?;
        Ok(state
            .stock
            .values()
            .filter(|r| r.material_id() == material_id)
            .cloned()
            .collect())
    }

    fn list_by_location(&self, location_id: LocationId) -> RepositoryResult<Vec<StockRecord>> {
        let state = self.read()?;
        Ok(state
            .stock
            .values()
            .filter(|r| r.location_id() == location_id)
            .cloned()
            .collect())
    }

    fn list_by_lot(&self, lot_id: LotId) -> RepositoryResult<Vec<StockRecord>> {
        let state = self.read()?;
        Ok(state
            .stock
            .values()
            .filter(|r| r.lot_id() == Some(lot_id))
            .cloned()
            .collect())
    }
}

impl MovementRepository for InMemoryLedgerStore {
    fn append(&self, movements: Vec<Movement>) -> RepositoryResult<()> {
        self.check_faults()?;
        self.write()?.movements.extend(movements);
        Ok(())
    }

    fn list_by_lot(&self, lot_id: LotId) -> RepositoryResult<Vec<Movement>> {
        let state = self.read()?;
        Ok(state
            .movements
            .iter()
            .filter(|m| m.lot_id() == Some(lot_id))
            .cloned()
            .collect())
    }

    fn list_by_key(&self, key: StockKey) -> RepositoryResult<Vec<Movement>> {
        let state = self.read()?;
        Ok(state
            .movements
            .iter()
            .filter(|m| m.key() == key)
            .cloned()
            .collect())
    }
}

impl ReservationRepository for InMemoryLedgerStore {
    fn insert(&self, reservation: Reservation) -> RepositoryResult<Reservation> {
        let mut state = self.write()?;
        let id = reservation.id_typed();
        if state.reservations.contains_key(&id) {
            return Err(RepositoryError::Duplicate(format!("reservation {id}")));
        }
        Ok(put(&mut state.reservations, reservation.with_version(1)))
    }

    fn get(&self, id: ReservationId) -> RepositoryResult<Option<Reservation>> {
        Ok(self.read()?.reservations.get(&id).cloned())
    }

    fn update(&self, reservation: Reservation, expected: ExpectedVersion) -> RepositoryResult<Reservation> {
        let mut state = self.write()?;
        let id = reservation.id_typed();
        let current = state
            .reservations
            .get(&id)
            .map(|r| r.version())
            .ok_or_else(|| RepositoryError::Conflict(format!("reservation {id} does not exist")))?;
        if !expected.matches(current) {
            return Err(RepositoryError::Conflict(format!(
                "reservation {id}: expected {expected:?}, found {current}"
            )));
        }
        Ok(put(&mut state.reservations, reservation.with_version(current + 1)))
    }

    fn list_active(&self) -> RepositoryResult<Vec<Reservation>> {
        let state = self.read()?;
        let mut active: Vec<Reservation> = state
            .reservations
            .values()
            .filter(|r| r.is_active())
            .cloned()
            .collect();
        active.sort_by_key(|r| (r.created_at(), r.id_typed()));
        Ok(active)
    }

    fn list_due(&self, now: DateTime<Utc>) -> RepositoryResult<Vec<Reservation>> {
        let state = self.read()?;
        let mut due: Vec<Reservation> = state
            .reservations
            .values()
            .filter(|r| r.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|r| (r.expires_at(), r.id_typed()));
        Ok(due)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use lotledger_core::{MovementId, ReservationId};
    use lotledger_inventory::testing::{LotBuilder, StockRecordBuilder};
    use lotledger_inventory::{MovementDraft, MovementKind, ReservationLine};

    use super::*;

    fn key() -> StockKey {
        StockKey::new(MaterialId::new(), LocationId::new(), Some(LotId::new()))
    }

    fn receipt(key: StockKey, delta: i64) -> Movement {
        Movement::from_draft(
            MovementId::new(),
            "GR-000001",
            MovementDraft::new(MovementKind::Receipt, key, delta),
            Utc::now(),
            None,
        )
    }

    #[test]
    fn duplicate_lot_number_per_material_is_rejected() {
        let store = InMemoryLedgerStore::new();
        let material = MaterialId::new();
        let lot = LotBuilder::new().material(material).number("LOT-A").build();
        let stored = store.register(lot).unwrap();
        assert_eq!(stored.version(), 1);

        let again = LotBuilder::new().material(material).number("LOT-A").build();
        assert!(matches!(store.register(again), Err(RepositoryError::Duplicate(_))));

        // Same number under another material is fine.
        let other = LotBuilder::new().number("LOT-A").build();
        assert!(store.register(other).is_ok());

        let found = store.get_by_code(material, "LOT-A").unwrap().unwrap();
        assert_eq!(found.id_typed(), stored.id_typed());
    }

    #[test]
    fn lot_update_requires_current_version() {
        let store = InMemoryLedgerStore::new();
        let lot = store.register(LotBuilder::new().build()).unwrap();

        let updated = store
            .update_status(lot.clone(), ExpectedVersion::Exact(1))
            .unwrap();
        assert_eq!(updated.version(), 2);

        let stale = store.update_status(lot, ExpectedVersion::Exact(1));
        assert!(matches!(stale, Err(RepositoryError::Conflict(_))));
    }

    #[test]
    fn new_records_start_at_version_one() {
        let store = InMemoryLedgerStore::new();
        let k = key();
        let record = StockRecordBuilder::new(k).quantity(10).build();

        let committed = store
            .upsert_quantities(vec![StockWrite::guarded(record)], vec![receipt(k, 10)])
            .unwrap();
        assert_eq!(committed[0].version(), 1);
        assert_eq!(store.movement_count(), 1);

        // Writing the same unversioned record again loses the race.
        let stale = StockRecordBuilder::new(k).quantity(20).build();
        let err = store
            .upsert_quantities(vec![StockWrite::guarded(stale)], vec![receipt(k, 10)])
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
        assert_eq!(store.movement_count(), 1);
    }

    #[test]
    fn batch_is_all_or_nothing() {
        let store = InMemoryLedgerStore::new();
        let (a, b) = (key(), key());
        store
            .upsert_quantities(
                vec![StockWrite::guarded(StockRecordBuilder::new(a).quantity(5).build())],
                vec![receipt(a, 5)],
            )
            .unwrap();

        let fresh_a = StockRecordBuilder::new(a).quantity(6).version(1).build();
        let stale_b = StockRecordBuilder::new(b).quantity(1).version(3).build();
        let err = store
            .upsert_quantities(
                vec![StockWrite::guarded(fresh_a), StockWrite::guarded(stale_b)],
                vec![receipt(a, 1), receipt(b, 1)],
            )
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));

        assert_eq!(StockRepository::get(&store, a).unwrap().unwrap().quantity(), 5);
        assert!(StockRepository::get(&store, b).unwrap().is_none());
        assert_eq!(store.movement_count(), 1);
    }

    #[test]
    fn injected_faults_leave_state_untouched() {
        let store = InMemoryLedgerStore::new();
        let k = key();
        store.fail_next_commits(1);

        let record = StockRecordBuilder::new(k).quantity(10).build();
        let err = store
            .upsert_quantities(vec![StockWrite::guarded(record.clone())], vec![receipt(k, 10)])
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Storage(_)));
        assert!(StockRepository::get(&store, k).unwrap().is_none());
        assert_eq!(store.movement_count(), 0);

        assert!(store
            .upsert_quantities(vec![StockWrite::guarded(record)], vec![receipt(k, 10)])
            .is_ok());
    }

    #[test]
    fn expiring_and_expired_queries_partition_by_date() {
        let store = InMemoryLedgerStore::new();
        let now = Utc::now();
        let soon = store.register(LotBuilder::new().expires_in(now, 10).build()).unwrap();
        let later = store.register(LotBuilder::new().expires_in(now, 100).build()).unwrap();
        let past = store.register(LotBuilder::new().expires_in(now, -1).build()).unwrap();

        let expiring: Vec<LotId> = store
            .list_expiring_within(now, 30)
            .unwrap()
            .iter()
            .map(|l| l.id_typed())
            .collect();
        assert_eq!(expiring, vec![soon.id_typed()]);

        let expired: Vec<LotId> = store.list_expired(now).unwrap().iter().map(|l| l.id_typed()).collect();
        assert_eq!(expired, vec![past.id_typed()]);
        assert_ne!(later.id_typed(), past.id_typed());
    }

    #[test]
    fn due_reservations_are_listed_by_deadline() {
        let store = InMemoryLedgerStore::new();
        let now = Utc::now();
        let line = ReservationLine { key: key(), quantity: 1 };
        let make = |expires_at| {
            Reservation::new(
                ReservationId::new(),
                line.key.material_id,
                None,
                None,
                vec![line],
                None,
                now,
                expires_at,
            )
        };

        let due = store.insert(make(Some(now - Duration::minutes(1)))).unwrap();
        store.insert(make(Some(now + Duration::hours(1)))).unwrap();
        store.insert(make(None)).unwrap();

        let listed = store.list_due(now).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id_typed(), due.id_typed());
        assert_eq!(store.list_active().unwrap().len(), 3);
        let stored = ReservationRepository::get(&store, due.id_typed()).unwrap().unwrap();
        assert_eq!(stored.version(), 1);
        assert!(matches!(store.insert(due), Err(RepositoryError::Duplicate(_))));
    }
}
