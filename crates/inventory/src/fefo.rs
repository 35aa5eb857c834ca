//! First-Expire-First-Out allocation planning.
//!
//! Planning is pure: it reads lot and stock snapshots and produces an
//! advisory plan. Committing the plan (reserve/consume) is the ledger's job
//! and must re-check availability at commit time.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use lotledger_core::{
    LedgerError, LedgerResult, LocationId, LotId, MaterialId, Quantity, checked_sum,
    ensure_positive,
};

use crate::lot::Lot;
use crate::stock::{StockKey, StockRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FefoRequest {
    pub material_id: MaterialId,
    pub quantity: Quantity,
    /// Only draw from this location.
    pub location_id: Option<LocationId>,
    /// Only draw from this lot.
    pub lot_id: Option<LotId>,
}

impl FefoRequest {
    pub fn new(material_id: MaterialId, quantity: Quantity) -> Self {
        Self {
            material_id,
            quantity,
            location_id: None,
            lot_id: None,
        }
    }

    pub fn at_location(mut self, location_id: LocationId) -> Self {
        self.location_id = Some(location_id);
        self
    }

    pub fn from_lot(mut self, lot_id: LotId) -> Self {
        self.lot_id = Some(lot_id);
        self
    }

    fn admits(&self, key: &StockKey) -> bool {
        key.material_id == self.material_id
            && self.location_id.is_none_or(|l| l == key.location_id)
            && self.lot_id.is_none_or(|l| key.lot_id == Some(l))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationLine {
    pub key: StockKey,
    pub lot_id: LotId,
    pub lot_number: String,
    pub expiry_date: DateTime<Utc>,
    pub quantity: Quantity,
}

impl AllocationLine {
    pub fn location_id(&self) -> LocationId {
        self.key.location_id
    }
}

/// Ordered allocation plan whose lines sum to exactly the requested quantity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationPlan {
    pub material_id: MaterialId,
    pub requested: Quantity,
    pub lines: Vec<AllocationLine>,
}

impl AllocationPlan {
    pub fn total(&self) -> Quantity {
        self.lines.iter().map(|l| l.quantity).sum()
    }
}

struct Candidate<'a> {
    record: &'a StockRecord,
    lot: &'a Lot,
}

/// Eligible candidates in FEFO order, with their available quantity.
///
/// Eligible means: lotted stock matching the request, lot issuable at `now`
/// (available, QC passed, not expired), and positive available quantity.
/// Unlotted stock carries no expiry and is never FEFO-allocated.
fn eligible<'a>(
    request: &FefoRequest,
    records: &'a [StockRecord],
    lots: &'a HashMap<LotId, Lot>,
    now: DateTime<Utc>,
) -> Vec<Candidate<'a>> {
    let mut candidates: Vec<Candidate<'a>> = records
        .iter()
        .filter(|r| request.admits(&r.key()) && r.available() > 0)
        .filter_map(|record| {
            let lot = lots.get(&record.lot_id()?)?;
            lot.can_be_issued(now).then_some(Candidate { record, lot })
        })
        .collect();

    // Expiry, then received date, then lot id, then location for determinism.
    candidates.sort_by(|a, b| {
        a.lot
            .expiry_date()
            .cmp(&b.lot.expiry_date())
            .then_with(|| a.lot.received_at().cmp(&b.lot.received_at()))
            .then_with(|| a.lot.id_typed().cmp(&b.lot.id_typed()))
            .then_with(|| a.record.location_id().cmp(&b.record.location_id()))
    });
    candidates
}

/// Total quantity FEFO could allocate for `request` right now.
pub fn eligible_quantity(
    request: &FefoRequest,
    records: &[StockRecord],
    lots: &HashMap<LotId, Lot>,
    now: DateTime<Utc>,
) -> LedgerResult<Quantity> {
    checked_sum(
        eligible(request, records, lots, now)
            .iter()
            .map(|c| c.record.available()),
        "eligible quantity",
    )
}

/// Plan a FEFO allocation. All-or-nothing: either the plan covers the full
/// request or `InsufficientStock` reports the shortfall.
pub fn plan_fefo(
    request: &FefoRequest,
    records: &[StockRecord],
    lots: &HashMap<LotId, Lot>,
    now: DateTime<Utc>,
) -> LedgerResult<AllocationPlan> {
    ensure_positive(request.quantity, "requested quantity")?;

    // Taken quantities never exceed the request, so the running total
    // cannot overflow however much stock is on hand.
    let mut remaining = request.quantity;
    let mut lines = Vec::new();
    for candidate in eligible(request, records, lots, now) {
        if remaining == 0 {
            break;
        }
        let take = remaining.min(candidate.record.available());
        lines.push(AllocationLine {
            key: candidate.record.key(),
            lot_id: candidate.lot.id_typed(),
            lot_number: candidate.lot.lot_number().to_string(),
            expiry_date: candidate.lot.expiry_date(),
            quantity: take,
        });
        remaining -= take;
    }
    if remaining > 0 {
        return Err(LedgerError::insufficient(
            request.quantity,
            request.quantity - remaining,
        ));
    }

    Ok(AllocationPlan {
        material_id: request.material_id,
        requested: request.quantity,
        lines,
    })
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use proptest::prelude::*;

    use super::*;
    use crate::lot::LotStatus;
    use crate::testing::{LotBuilder, StockRecordBuilder};

    struct Fixture {
        now: DateTime<Utc>,
        material: MaterialId,
        location: LocationId,
        records: Vec<StockRecord>,
        lots: HashMap<LotId, Lot>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                now: Utc::now(),
                material: MaterialId::new(),
                location: LocationId::new(),
                records: Vec::new(),
                lots: HashMap::new(),
            }
        }

        fn lot(&mut self, builder: LotBuilder, quantity: Quantity) -> LotId {
            self.lot_at(builder, quantity, self.location)
        }

        fn lot_at(&mut self, builder: LotBuilder, quantity: Quantity, location: LocationId) -> LotId {
            let lot = builder.material(self.material).build();
            let id = lot.id_typed();
            self.records.push(
                StockRecordBuilder::new(StockKey::new(self.material, location, Some(id)))
                    .quantity(quantity)
                    .build(),
            );
            self.lots.insert(id, lot);
            id
        }

        fn issuable(&self, days: i64) -> LotBuilder {
            LotBuilder::new().passed().expires_in(self.now, days)
        }

        fn plan(&self, quantity: Quantity) -> LedgerResult<AllocationPlan> {
            plan_fefo(
                &FefoRequest::new(self.material, quantity),
                &self.records,
                &self.lots,
                self.now,
            )
        }
    }

    fn summary(plan: &AllocationPlan) -> Vec<(LotId, Quantity)> {
        plan.lines.iter().map(|l| (l.lot_id, l.quantity)).collect()
    }

    #[test]
    fn earliest_expiry_is_drawn_first() {
        let mut f = Fixture::new();
        let day10 = f.lot(f.issuable(10), 30);
        let _day20 = f.lot(f.issuable(20), 50);
        let day5 = f.lot(f.issuable(5), 20);

        let plan = f.plan(40).unwrap();
        assert_eq!(summary(&plan), vec![(day5, 20), (day10, 20)]);
        assert_eq!(plan.total(), 40);
    }

    #[test]
    fn smaller_request_leaves_later_lot_untouched() {
        let mut f = Fixture::new();
        let l1 = f.lot(f.issuable(5), 10);
        let l2 = f.lot(f.issuable(50), 90);

        assert_eq!(summary(&f.plan(15).unwrap()), vec![(l1, 10), (l2, 5)]);
        assert_eq!(summary(&f.plan(5).unwrap()), vec![(l1, 5)]);
    }

    #[test]
    fn zero_request_is_invalid() {
        let mut f = Fixture::new();
        f.lot(f.issuable(5), 10);
        assert!(matches!(f.plan(0), Err(LedgerError::InvalidQuantity(_))));
    }

    #[test]
    fn shortfall_is_reported_without_partial_plan() {
        let mut f = Fixture::new();
        f.lot(f.issuable(5), 10);
        f.lot(f.issuable(9), 15);

        let err = f.plan(40).unwrap_err();
        assert_eq!(err, LedgerError::insufficient(40, 25));
        assert_eq!(err.shortfall(), Some(15));
    }

    #[test]
    fn ineligible_lots_are_invisible() {
        let mut f = Fixture::new();
        let now = f.now;
        f.lot(LotBuilder::new().passed().expires_in(now, 5).status(LotStatus::Expired), 100);
        f.lot(LotBuilder::new().passed().expires_in(now, -2), 100);
        f.lot(LotBuilder::new().expires_in(now, 5), 100);
        f.lot(LotBuilder::new().failed().expires_in(now, 5), 100);
        f.lot(LotBuilder::new().passed().expires_in(now, 5).status(LotStatus::Blocked), 100);

        let err = f.plan(1).unwrap_err();
        assert_eq!(err, LedgerError::insufficient(1, 0));
    }

    #[test]
    fn unlotted_stock_is_not_allocated() {
        let mut f = Fixture::new();
        f.records.push(
            StockRecordBuilder::new(StockKey::new(f.material, f.location, None))
                .quantity(500)
                .build(),
        );
        assert!(f.plan(1).is_err());
    }

    #[test]
    fn reserved_stock_is_excluded() {
        let mut f = Fixture::new();
        let early = f.issuable(3).material(f.material).build();
        let early_id = early.id_typed();
        f.records.push(
            StockRecordBuilder::new(StockKey::new(f.material, f.location, Some(early_id)))
                .quantity(10)
                .hold(lotledger_core::ReservationId::new(), 8)
                .build(),
        );
        f.lots.insert(early_id, early);
        let late = f.lot(f.issuable(30), 10);

        assert_eq!(summary(&f.plan(5).unwrap()), vec![(early_id, 2), (late, 3)]);
    }

    #[test]
    fn ties_break_on_received_date_then_lot_id() {
        let mut f = Fixture::new();
        let expiry = f.now + Duration::days(10);
        let newer = f.lot(
            LotBuilder::new().passed().expiry(expiry).received(f.now - Duration::days(1)),
            10,
        );
        let older = f.lot(
            LotBuilder::new().passed().expiry(expiry).received(f.now - Duration::days(5)),
            10,
        );

        assert_eq!(summary(&f.plan(15).unwrap()), vec![(older, 10), (newer, 5)]);
    }

    #[test]
    fn location_and_lot_filters_narrow_candidates() {
        let mut f = Fixture::new();
        let other_location = LocationId::new();
        let here = f.lot(f.issuable(20), 10);
        let there = f.lot_at(f.issuable(5), 10, other_location);

        let plan = plan_fefo(
            &FefoRequest::new(f.material, 5).at_location(f.location),
            &f.records,
            &f.lots,
            f.now,
        )
        .unwrap();
        assert_eq!(summary(&plan), vec![(here, 5)]);

        let plan = plan_fefo(
            &FefoRequest::new(f.material, 5).from_lot(here),
            &f.records,
            &f.lots,
            f.now,
        )
        .unwrap();
        assert_eq!(summary(&plan), vec![(here, 5)]);

        let eligible = eligible_quantity(&FefoRequest::new(f.material, 1), &f.records, &f.lots, f.now).unwrap();
        assert_eq!(eligible, 20);
        assert_ne!(here, there);
    }

    #[test]
    fn huge_balances_plan_without_overflow() {
        let mut f = Fixture::new();
        let half = Quantity::MAX / 2 + 1;
        let first = f.lot(f.issuable(5), half);
        f.lot_at(f.issuable(9), half, LocationId::new());

        let plan = f.plan(10).unwrap();
        assert_eq!(summary(&plan), vec![(first, 10)]);

        let total = eligible_quantity(&FefoRequest::new(f.material, 10), &f.records, &f.lots, f.now);
        assert!(matches!(total, Err(LedgerError::InvalidQuantity(_))));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            ..ProptestConfig::default()
        })]

        /// Property: any successful plan sums to the request, never exceeds a
        /// record's availability, and is non-decreasing by expiry.
        #[test]
        fn plans_are_exact_and_ordered_by_expiry(
            lots in prop::collection::vec((1i64..365, 1i64..100, any::<bool>()), 1..12),
            requested in 1i64..600,
        ) {
            let mut f = Fixture::new();
            for (days, quantity, issuable) in lots {
                let builder = if issuable { f.issuable(days) } else { LotBuilder::new().expires_in(f.now, days) };
                f.lot(builder, quantity);
            }

            let eligible = eligible_quantity(&FefoRequest::new(f.material, requested), &f.records, &f.lots, f.now).unwrap();
            match f.plan(requested) {
                Ok(plan) => {
                    prop_assert_eq!(plan.total(), requested);
                    for pair in plan.lines.windows(2) {
                        prop_assert!(pair[0].expiry_date <= pair[1].expiry_date);
                    }
                    for line in &plan.lines {
                        let record = f.records.iter().find(|r| r.key() == line.key).unwrap();
                        prop_assert!(line.quantity > 0 && line.quantity <= record.available());
                        prop_assert!(f.lots[&line.lot_id].can_be_issued(f.now));
                    }
                }
                Err(err) => {
                    prop_assert!(eligible < requested);
                    prop_assert_eq!(err.shortfall(), Some(requested - eligible));
                }
            }
        }
    }
}
