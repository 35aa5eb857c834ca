//! Shared fixture for the service tests.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};

use lotledger_core::{LocationId, LotId, ManualClock, MaterialId, OpContext, Quantity};
use lotledger_events::{EventBus, LocalBus, LedgerNotification, Subscription};
use lotledger_inventory::{QcStatus, StockKey};

use crate::config::LedgerConfig;
use crate::lots::LotRegistration;
use crate::repository::InMemoryLedgerStore;
use crate::services::{LedgerPorts, LedgerServices};

pub(crate) fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).unwrap()
}

pub(crate) fn ctx() -> OpContext {
    OpContext::background()
}

pub(crate) struct Harness {
    pub services: LedgerServices,
    pub store: Arc<InMemoryLedgerStore>,
    pub clock: Arc<ManualClock>,
    pub notifications: Subscription<LedgerNotification>,
    pub material: MaterialId,
    pub location: LocationId,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(LedgerConfig::default())
    }

    pub fn with_config(config: LedgerConfig) -> Self {
        Self::with_ports(config, |ports| ports)
    }

    /// In-memory ports, with `wrap` free to swap any of them.
    pub fn with_ports(config: LedgerConfig, wrap: impl FnOnce(LedgerPorts) -> LedgerPorts) -> Self {
        lotledger_observability::init_for_tests();
        let store = Arc::new(InMemoryLedgerStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let bus = Arc::new(LocalBus::<LedgerNotification>::new());
        let notifications = bus.subscribe();
        let ports = wrap(LedgerPorts::in_memory(store.clone()));
        let services = LedgerServices::new(ports, config, clock.clone(), bus);
        Self {
            services,
            store,
            clock,
            notifications,
            material: MaterialId::new(),
            location: LocationId::new(),
        }
    }

    /// Register a QC-passed lot expiring `days` from t0.
    pub fn issuable_lot(&self, days: i64) -> LotId {
        let lot = self
            .services
            .lots
            .register(LotRegistration::new(self.material, t0() + Duration::days(days)))
            .unwrap();
        self.services
            .lots
            .set_qc_status(lot.id_typed(), QcStatus::Passed)
            .unwrap();
        lot.id_typed()
    }

    pub fn key(&self, lot: LotId) -> StockKey {
        StockKey::new(self.material, self.location, Some(lot))
    }

    /// Issuable lot with `quantity` received at the default location.
    pub fn stocked_lot(&self, days: i64, quantity: Quantity) -> LotId {
        let lot = self.issuable_lot(days);
        self.services
            .ledger
            .receive(&ctx(), self.key(lot), quantity, None)
            .unwrap();
        lot
    }

    pub fn drain(&self) -> Vec<LedgerNotification> {
        self.notifications.drain()
    }
}
