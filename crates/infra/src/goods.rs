//! Goods receipt and goods issue: the two end-to-end flows.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use lotledger_core::{LedgerError, LedgerResult, LocationId, LotId, MaterialId, OpContext, Quantity};
use lotledger_inventory::{
    AllocationLine, DocumentKind, DocumentRef, FefoRequest, Lot, StockKey, StockRecord,
};

use crate::allocator::{FefoAllocator, is_replannable, plan_lines};
use crate::config::LedgerConfig;
use crate::ledger::StockLedger;
use crate::lots::{LotRegistration, LotRegistry};

/// Which lot a receipt lands in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiptLot {
    Unlotted,
    Existing(LotId),
    /// Reuse the material's lot with this number if there is one, otherwise
    /// register it.
    Register(LotRegistration),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoodsReceipt {
    pub material_id: MaterialId,
    pub location_id: LocationId,
    pub lot: ReceiptLot,
    pub quantity: Quantity,
    pub reference: Option<DocumentRef>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptResult {
    pub lot: Option<Lot>,
    pub record: StockRecord,
    pub reference: DocumentRef,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoodsIssue {
    pub material_id: MaterialId,
    pub quantity: Quantity,
    pub location_id: Option<LocationId>,
    pub reference: Option<DocumentRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IssueResult {
    pub lines: Vec<AllocationLine>,
    pub records: Vec<StockRecord>,
    pub attempts: u32,
}

impl IssueResult {
    pub fn total(&self) -> Quantity {
        self.lines.iter().map(|l| l.quantity).sum()
    }
}

pub struct GoodsFlow {
    lots: Arc<LotRegistry>,
    ledger: Arc<StockLedger>,
    allocator: Arc<FefoAllocator>,
    config: Arc<LedgerConfig>,
}

impl GoodsFlow {
    pub fn new(
        lots: Arc<LotRegistry>,
        ledger: Arc<StockLedger>,
        allocator: Arc<FefoAllocator>,
        config: Arc<LedgerConfig>,
    ) -> Self {
        Self {
            lots,
            ledger,
            allocator,
            config,
        }
    }

    /// Resolve or create the lot, then receive into the ledger (which records
    /// the receipt movement in the same commit).
    pub fn receive(&self, ctx: &OpContext, receipt: GoodsReceipt) -> LedgerResult<ReceiptResult> {
        ctx.check()?;
        let lot = match receipt.lot {
            ReceiptLot::Unlotted => None,
            ReceiptLot::Existing(id) => Some(self.lots.get(id)?),
            ReceiptLot::Register(registration) => Some(self.register_or_reuse(registration)?),
        };

        let reference = receipt
            .reference
            .unwrap_or_else(|| DocumentRef::new(DocumentKind::GoodsReceipt).with_id(Uuid::now_v7()));
        let key = StockKey::new(
            receipt.material_id,
            receipt.location_id,
            lot.as_ref().map(|l| l.id_typed()),
        );
        let record = self.ledger.receive(ctx, key, receipt.quantity, Some(&reference))?;

        info!(
            material_id = %receipt.material_id,
            location_id = %receipt.location_id,
            lot_number = lot.as_ref().map(|l| l.lot_number()).unwrap_or("-"),
            quantity = receipt.quantity,
            "goods received"
        );
        Ok(ReceiptResult { lot, record, reference })
    }

    /// FEFO-plan and consume in one commit. When the commit loses a race the
    /// plan is rebuilt from fresh state, up to `max_commit_retries` times.
    pub fn issue(&self, ctx: &OpContext, issue: GoodsIssue) -> LedgerResult<IssueResult> {
        let reference = issue
            .reference
            .unwrap_or_else(|| DocumentRef::new(DocumentKind::GoodsIssue).with_id(Uuid::now_v7()));
        let request = FefoRequest {
            material_id: issue.material_id,
            quantity: issue.quantity,
            location_id: issue.location_id,
            lot_id: None,
        };

        let mut attempt: u32 = 0;
        loop {
            ctx.check()?;
            let plan = self.allocator.plan(&request)?;
            match self
                .ledger
                .consume_lines(ctx, &plan_lines(&plan), None, Some(&reference))
            {
                Ok(records) => {
                    info!(
                        material_id = %issue.material_id,
                        quantity = issue.quantity,
                        lots = plan.lines.len(),
                        "goods issued"
                    );
                    return Ok(IssueResult {
                        lines: plan.lines,
                        records,
                        attempts: attempt + 1,
                    });
                }
                Err(err) if is_replannable(&err) && attempt < self.config.max_commit_retries => {
                    attempt += 1;
                    debug!(material_id = %issue.material_id, attempt, error = %err, "issue lost a race, re-planning");
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// A concurrent receipt may register the same number first; its lot is
    /// then reused.
    fn register_or_reuse(&self, registration: LotRegistration) -> LedgerResult<Lot> {
        let material_id = registration.material_id;
        let number = registration.lot_number.as_deref().map(|n| n.trim().to_string());
        if let Some(number) = number.as_deref() {
            if let Some(existing) = self.lots.get_by_code(material_id, number)? {
                return Ok(existing);
            }
        }
        match self.lots.register(registration) {
            Err(err @ LedgerError::DuplicateLot { .. }) => {
                let winner = match number.as_deref() {
                    Some(number) => self.lots.get_by_code(material_id, number)?,
                    None => None,
                };
                winner.ok_or(err)
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::thread;

    use chrono::Duration;

    use lotledger_inventory::{LotStatus, MovementKind};

    use super::*;
    use crate::test_support::{Harness, ctx, t0};

    fn receipt(h: &Harness, lot: ReceiptLot, quantity: Quantity) -> GoodsReceipt {
        GoodsReceipt {
            material_id: h.material,
            location_id: h.location,
            lot,
            quantity,
            reference: None,
        }
    }

    fn issue(h: &Harness, quantity: Quantity) -> GoodsIssue {
        GoodsIssue {
            material_id: h.material,
            quantity,
            location_id: None,
            reference: None,
        }
    }

    #[test]
    fn receipt_registers_then_reuses_lot_by_number() {
        let h = Harness::new();
        let registration =
            LotRegistration::new(h.material, t0() + Duration::days(90)).number("SUP-778");

        let first = h
            .services
            .goods
            .receive(&ctx(), receipt(&h, ReceiptLot::Register(registration.clone()), 30))
            .unwrap();
        let second = h
            .services
            .goods
            .receive(&ctx(), receipt(&h, ReceiptLot::Register(registration), 20))
            .unwrap();

        let lot = first.lot.unwrap();
        assert_eq!(second.lot.unwrap().id_typed(), lot.id_typed());
        assert_eq!(second.record.quantity(), 50);
        assert_eq!(first.reference.kind, DocumentKind::GoodsReceipt);
        assert_eq!(h.services.movements.history_by_lot(lot.id_typed()).unwrap().len(), 2);
    }

    #[test]
    fn simultaneous_receipts_of_a_new_lot_share_it() {
        let h = Harness::new();
        let goods = &h.services.goods;
        for round in 0..50 {
            let registration = LotRegistration::new(h.material, t0() + Duration::days(90))
                .number(format!("SUP-{round}"));
            let barrier = Barrier::new(2);

            let results: Vec<LedgerResult<ReceiptResult>> = thread::scope(|scope| {
                let handles: Vec<_> = (0..2)
                    .map(|_| {
                        let receipt = receipt(&h, ReceiptLot::Register(registration.clone()), 5);
                        let barrier = &barrier;
                        scope.spawn(move || {
                            barrier.wait();
                            goods.receive(&ctx(), receipt)
                        })
                    })
                    .collect();
                handles.into_iter().map(|j| j.join().unwrap()).collect()
            });

            let lots: Vec<LotId> = results
                .into_iter()
                .map(|r| r.unwrap().lot.unwrap().id_typed())
                .collect();
            assert_eq!(lots[0], lots[1]);
            assert_eq!(h.services.lots.on_hand(lots[0]).unwrap(), 10);
        }
    }

    #[test]
    fn unlotted_receipt_is_not_fefo_stock() {
        let h = Harness::new();
        h.services
            .goods
            .receive(&ctx(), receipt(&h, ReceiptLot::Unlotted, 30))
            .unwrap();
        let err = h.services.goods.issue(&ctx(), issue(&h, 1)).unwrap_err();
        assert_eq!(err.shortfall(), Some(1));
    }

    #[test]
    fn issue_consumes_in_expiry_order() {
        let h = Harness::new();
        let day10 = h.stocked_lot(10, 30);
        let day20 = h.stocked_lot(20, 50);
        let day5 = h.stocked_lot(5, 20);

        let result = h.services.goods.issue(&ctx(), issue(&h, 40)).unwrap();
        let lines: Vec<(LotId, Quantity)> = result.lines.iter().map(|l| (l.lot_id, l.quantity)).collect();
        assert_eq!(lines, vec![(day5, 20), (day10, 20)]);
        assert_eq!(result.total(), 40);
        assert_eq!(result.attempts, 1);

        assert_eq!(h.services.lots.get(day5).unwrap().status(), LotStatus::Consumed);
        assert_eq!(h.services.ledger.get(h.key(day10)).unwrap().unwrap().quantity(), 10);
        assert_eq!(h.services.ledger.get(h.key(day20)).unwrap().unwrap().quantity(), 50);

        let issued = h.services.movements.history(h.key(day10)).unwrap();
        assert_eq!(issued.last().map(|m| m.kind()), Some(MovementKind::Issue));
    }

    #[test]
    fn issue_replans_after_conflict() {
        let h = Harness::new();
        h.stocked_lot(10, 30);
        h.store.conflict_next_commits(4);

        let result = h.services.goods.issue(&ctx(), issue(&h, 10)).unwrap();
        assert!(result.attempts > 1);
        assert_eq!(h.services.ledger.summary(h.material).unwrap().on_hand, 20);
    }

    #[test]
    fn receipt_into_expired_lot_is_refused() {
        let h = Harness::new();
        let lot = h.issuable_lot(3);
        h.clock.advance(Duration::days(4));

        let err = h
            .services
            .goods
            .receive(&ctx(), receipt(&h, ReceiptLot::Existing(lot), 5))
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition(_)));
    }
}
