//! Wiring of the ledger components over a set of repository ports.

use std::sync::Arc;

use lotledger_core::{Clock, SequenceService};
use lotledger_events::NotificationSink;

use crate::allocator::FefoAllocator;
use crate::config::LedgerConfig;
use crate::goods::GoodsFlow;
use crate::jobs::MaintenanceSweep;
use crate::ledger::StockLedger;
use crate::lots::LotRegistry;
use crate::movements::MovementRecorder;
use crate::repository::{
    InMemoryLedgerStore, LotRepository, MovementRepository, ReservationRepository, StockRepository,
};
use crate::reservations::ReservationManager;

#[derive(Clone)]
pub struct LedgerPorts {
    pub lots: Arc<dyn LotRepository>,
    pub stock: Arc<dyn StockRepository>,
    pub movements: Arc<dyn MovementRepository>,
    pub reservations: Arc<dyn ReservationRepository>,
}

impl LedgerPorts {
    /// Every port backed by the same in-memory store.
    pub fn in_memory(store: Arc<InMemoryLedgerStore>) -> Self {
        Self {
            lots: store.clone(),
            stock: store.clone(),
            movements: store.clone(),
            reservations: store,
        }
    }
}

/// The five ledger components plus the flows built on them, sharing one
/// clock, sequence service, notification sink and configuration.
pub struct LedgerServices {
    pub lots: Arc<LotRegistry>,
    pub movements: Arc<MovementRecorder>,
    pub ledger: Arc<StockLedger>,
    pub allocator: Arc<FefoAllocator>,
    pub reservations: Arc<ReservationManager>,
    pub goods: GoodsFlow,
    pub sweep: Arc<MaintenanceSweep>,
    pub config: Arc<LedgerConfig>,
}

impl LedgerServices {
    pub fn new(
        ports: LedgerPorts,
        config: LedgerConfig,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        let config = Arc::new(config);
        let sequences = Arc::new(SequenceService::new());

        let lots = Arc::new(LotRegistry::new(
            ports.lots,
            ports.stock.clone(),
            sequences.clone(),
            clock.clone(),
            sink.clone(),
            config.clone(),
        ));
        let movements = Arc::new(MovementRecorder::new(
            ports.movements,
            ports.stock.clone(),
            sequences,
        ));
        let ledger = Arc::new(StockLedger::new(
            ports.stock.clone(),
            lots.clone(),
            movements.clone(),
            clock.clone(),
            sink.clone(),
            config.clone(),
        ));
        let allocator = Arc::new(FefoAllocator::new(ports.stock, lots.clone(), clock.clone()));
        let reservations = Arc::new(ReservationManager::new(
            ports.reservations,
            ledger.clone(),
            movements.clone(),
            allocator.clone(),
            sink.clone(),
            clock.clone(),
            config.clone(),
        ));
        let goods = GoodsFlow::new(lots.clone(), ledger.clone(), allocator.clone(), config.clone());
        let sweep = Arc::new(MaintenanceSweep::new(
            lots.clone(),
            ledger.clone(),
            reservations.clone(),
            sink,
            clock,
            config.clone(),
        ));

        Self {
            lots,
            movements,
            ledger,
            allocator,
            reservations,
            goods,
            sweep,
            config,
        }
    }
}
