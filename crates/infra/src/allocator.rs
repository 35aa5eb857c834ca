//! FEFO Allocator: plans against a read-only snapshot, never mutates.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use lotledger_core::{Clock, LedgerError, LedgerResult, LotId, Quantity};
use lotledger_inventory::{AllocationPlan, FefoRequest, Lot, ReservationLine, eligible_quantity, plan_fefo};

use crate::lots::LotRegistry;
use crate::repository::StockRepository;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Availability {
    pub requested: Quantity,
    pub eligible: Quantity,
    pub shortfall: Quantity,
}

impl Availability {
    pub fn is_sufficient(&self) -> bool {
        self.shortfall == 0
    }
}

pub struct FefoAllocator {
    stock: Arc<dyn StockRepository>,
    lots: Arc<LotRegistry>,
    clock: Arc<dyn Clock>,
}

impl FefoAllocator {
    pub fn new(stock: Arc<dyn StockRepository>, lots: Arc<LotRegistry>, clock: Arc<dyn Clock>) -> Self {
        Self { stock, lots, clock }
    }

    /// Ordered plan summing to exactly `request.quantity`, or
    /// `InsufficientStock` with the shortfall. The plan is advisory: the
    /// ledger re-checks every line when it is committed.
    pub fn plan(&self, request: &FefoRequest) -> LedgerResult<AllocationPlan> {
        let records = self.stock.list_by_material(request.material_id)?;
        let lots = self.lots_of(request)?;
        let plan = plan_fefo(request, &records, &lots, self.clock.now())?;
        debug!(
            material_id = %request.material_id,
            requested = request.quantity,
            lines = plan.lines.len(),
            "fefo plan built"
        );
        Ok(plan)
    }

    /// Eligible availability and shortfall, without building a plan.
    pub fn check_availability(&self, request: &FefoRequest) -> LedgerResult<Availability> {
        if request.quantity <= 0 {
            return Err(LedgerError::invalid_quantity(format!(
                "requested quantity must be positive, got {}",
                request.quantity
            )));
        }
        let records = self.stock.list_by_material(request.material_id)?;
        let lots = self.lots_of(request)?;
        let eligible = eligible_quantity(request, &records, &lots, self.clock.now())?;
        Ok(Availability {
            requested: request.quantity,
            eligible,
            shortfall: (request.quantity - eligible).max(0),
        })
    }

    fn lots_of(&self, request: &FefoRequest) -> LedgerResult<HashMap<LotId, Lot>> {
        Ok(self
            .lots
            .list_by_material(request.material_id)?
            .into_iter()
            .map(|lot| (lot.id_typed(), lot))
            .collect())
    }
}

/// Reservation lines for committing a plan.
pub fn plan_lines(plan: &AllocationPlan) -> Vec<ReservationLine> {
    plan.lines
        .iter()
        .map(|line| ReservationLine {
            key: line.key,
            quantity: line.quantity,
        })
        .collect()
}

/// Commit-time failures after which planning again against fresh state can
/// still succeed: a lost race for the same stock, or a lot that stopped
/// being issuable since the plan was made.
pub(crate) fn is_replannable(err: &LedgerError) -> bool {
    matches!(
        err,
        LedgerError::ConcurrentModification(_)
            | LedgerError::InsufficientStock { .. }
            | LedgerError::InvalidTransition(_)
    )
}
