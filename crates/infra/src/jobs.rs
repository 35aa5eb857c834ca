//! Periodic maintenance sweep.
//!
//! One pass:
//! - applies the `expired` transition to lots past their date
//! - raises `LotExpiringSoon` once per lot per crossed alert threshold
//! - releases reservations past their hold deadline
//! - raises `StockBelowReorder` for materials with their own threshold that
//!   are below it

use std::collections::HashMap;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use lotledger_core::{Clock, LedgerResult, LotId, MaterialId, OpContext, Quantity, ReservationId};
use lotledger_events::{LedgerNotification, LotExpiringSoon, NotificationSink, StockBelowReorder};

use crate::config::LedgerConfig;
use crate::ledger::StockLedger;
use crate::lots::LotRegistry;
use crate::reservations::ReservationManager;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired_lots: Vec<LotId>,
    pub expiring_alerts: Vec<(LotId, u32)>,
    pub released_reservations: Vec<ReservationId>,
    pub below_reorder: Vec<MaterialId>,
}

pub struct MaintenanceSweep {
    lots: Arc<LotRegistry>,
    ledger: Arc<StockLedger>,
    reservations: Arc<ReservationManager>,
    sink: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    config: Arc<LedgerConfig>,
    /// Smallest threshold already alerted per lot.
    alerted: Mutex<HashMap<LotId, u32>>,
}

/// Handle to stop and join a running sweep.
#[derive(Debug)]
pub struct SweepHandle {
    interval: Duration,
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl SweepHandle {
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Request shutdown and wait for the sweep thread to stop.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

impl MaintenanceSweep {
    pub fn new(
        lots: Arc<LotRegistry>,
        ledger: Arc<StockLedger>,
        reservations: Arc<ReservationManager>,
        sink: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
        config: Arc<LedgerConfig>,
    ) -> Self {
        Self {
            lots,
            ledger,
            reservations,
            sink,
            clock,
            config,
            alerted: Mutex::new(HashMap::new()),
        }
    }

    pub fn run_once(&self) -> LedgerResult<SweepReport> {
        let ctx = OpContext::background();
        let mut report = SweepReport {
            expired_lots: self.lots.expire_overdue()?,
            ..SweepReport::default()
        };
        report.expiring_alerts = self.alert_expiring()?;
        report.released_reservations = self.reservations.expire_due(&ctx, self.clock.now())?;
        report.below_reorder = self.alert_low_stock()?;

        info!(
            expired = report.expired_lots.len(),
            expiring_alerts = report.expiring_alerts.len(),
            released = report.released_reservations.len(),
            below_reorder = report.below_reorder.len(),
            "maintenance sweep finished"
        );
        Ok(report)
    }

    /// Run [`run_once`](Self::run_once) every configured
    /// `sweep_interval_secs` on a background thread until the handle is shut
    /// down.
    pub fn spawn(self: Arc<Self>) -> std::io::Result<SweepHandle> {
        let interval = self.config.sweep_interval();
        self.spawn_every(interval)
    }

    pub fn spawn_every(self: Arc<Self>, interval: Duration) -> std::io::Result<SweepHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let join = thread::Builder::new()
            .name("lotledger-sweep".to_string())
            .spawn(move || {
                info!(interval_secs = interval.as_secs(), "maintenance sweep started");
                loop {
                    if let Err(err) = self.run_once() {
                        error!(error = %err, "maintenance sweep failed");
                    }
                    match shutdown_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                info!("maintenance sweep stopped");
            })?;
        Ok(SweepHandle {
            interval,
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }

    fn alert_expiring(&self) -> LedgerResult<Vec<(LotId, u32)>> {
        let thresholds = self.config.alert_thresholds();
        let Some(&widest) = thresholds.first() else {
            return Ok(Vec::new());
        };
        let now = self.clock.now();
        let mut alerts = Vec::new();

        let expiring: Vec<_> = self
            .lots
            .list_expiring(widest)?
            .into_iter()
            .filter(|lot| !lot.status().is_terminal())
            .collect();
        // Forget lots that left the window.
        self.alerted_lots()
            .retain(|id, _| expiring.iter().any(|lot| lot.id_typed() == *id));

        for lot in expiring {
            // Tightest threshold the lot is inside of.
            let Some(crossed) = thresholds
                .iter()
                .rev()
                .copied()
                .find(|&days| lot.is_expiring_soon(now, days))
            else {
                continue;
            };

            let id = lot.id_typed();
            if self.alerted_lots().get(&id).is_some_and(|&prev| prev <= crossed) {
                continue;
            }

            let on_hand = self.lots.on_hand(id)?;
            if on_hand == 0 {
                debug!(lot_id = %id, "expiring lot has no stock, alert deferred");
                continue;
            }
            warn!(
                lot_id = %id,
                lot_number = %lot.lot_number(),
                days_until_expiry = lot.days_until_expiry(now),
                threshold = crossed,
                on_hand,
                "lot expiring soon"
            );
            self.sink.notify(LedgerNotification::LotExpiringSoon(LotExpiringSoon {
                material_id: lot.material_id(),
                lot_id: id,
                lot_number: lot.lot_number().to_string(),
                expiry_date: lot.expiry_date(),
                days_until_expiry: lot.days_until_expiry(now),
                alert_threshold_days: crossed,
                on_hand,
                occurred_at: now,
            }));
            self.alerted_lots().insert(id, crossed);
            alerts.push((id, crossed));
        }
        Ok(alerts)
    }

    fn alerted_lots(&self) -> MutexGuard<'_, HashMap<LotId, u32>> {
        self.alerted.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn alert_low_stock(&self) -> LedgerResult<Vec<MaterialId>> {
        let now = self.clock.now();
        let mut materials: Vec<(MaterialId, Quantity)> = self
            .config
            .reorder_thresholds
            .iter()
            .map(|(m, t)| (*m, *t))
            .collect();
        materials.sort();

        let mut below = Vec::new();
        for (material_id, threshold) in materials {
            let summary = self.ledger.summary(material_id)?;
            if summary.available >= threshold {
                continue;
            }
            self.sink.notify(LedgerNotification::StockBelowReorder(StockBelowReorder {
                material_id,
                lot_id: None,
                on_hand: summary.on_hand,
                available: summary.available,
                reorder_threshold: threshold,
                occurred_at: now,
            }));
            below.push(material_id);
        }
        Ok(below)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration as StdDuration;

    use chrono::Duration;

    use crate::reservations::ReservationRequest;
    use crate::test_support::{Harness, ctx};

    use super::*;

    #[test]
    fn sweep_expires_lots_and_alerts_each_threshold_once() {
        let h = Harness::new();
        let soon = h.stocked_lot(25, 10);
        let gone = h.stocked_lot(1, 10);
        h.drain();

        h.clock.advance(Duration::days(2));
        let report = h.services.sweep.run_once().unwrap();
        assert_eq!(report.expired_lots, vec![gone]);
        assert_eq!(report.expiring_alerts, vec![(soon, 30)]);

        let notes = h.drain();
        assert!(notes.iter().any(|n| matches!(n, LedgerNotification::LotExpired(e) if e.lot_id == gone && e.on_hand == 10)));
        assert!(notes.iter().any(|n| matches!(
            n,
            LedgerNotification::LotExpiringSoon(e) if e.lot_id == soon && e.alert_threshold_days == 30
        )));

        // Same threshold again: quiet.
        let report = h.services.sweep.run_once().unwrap();
        assert!(report.expired_lots.is_empty());
        assert!(report.expiring_alerts.is_empty());

        // Crossing the 7-day threshold alerts again.
        h.clock.advance(Duration::days(17));
        let report = h.services.sweep.run_once().unwrap();
        assert_eq!(report.expiring_alerts, vec![(soon, 7)]);
    }

    #[test]
    fn sweep_releases_due_reservations_and_reports_low_stock() {
        let material = MaterialId::new();
        let mut config = LedgerConfig::default();
        config.reorder_thresholds.insert(material, 100);
        let h = Harness {
            material,
            ..Harness::with_config(config)
        };
        h.stocked_lot(60, 40);
        let deadline = h.clock.now() + Duration::minutes(30);
        let held = h
            .services
            .reservations
            .create(&ctx(), ReservationRequest::new(h.material, 10).expires_at(deadline))
            .unwrap();

        h.clock.advance(Duration::hours(1));
        let report = h.services.sweep.run_once().unwrap();
        assert_eq!(report.released_reservations, vec![held.id_typed()]);
        assert_eq!(report.below_reorder, vec![h.material]);
    }

    #[test]
    fn empty_lot_is_alerted_once_stock_arrives() {
        let h = Harness::new();
        let lot = h.issuable_lot(25);

        let report = h.services.sweep.run_once().unwrap();
        assert!(report.expiring_alerts.is_empty());

        h.services.ledger.receive(&ctx(), h.key(lot), 10, None).unwrap();
        let report = h.services.sweep.run_once().unwrap();
        assert_eq!(report.expiring_alerts, vec![(lot, 30)]);
    }

    #[test]
    fn alert_memory_forgets_consumed_lots() {
        let h = Harness::new();
        let lot = h.stocked_lot(25, 10);
        assert_eq!(h.services.sweep.run_once().unwrap().expiring_alerts, vec![(lot, 30)]);
        assert!(h.services.sweep.alerted_lots().contains_key(&lot));

        h.services.ledger.consume(&ctx(), h.key(lot), 10, None, None).unwrap();
        h.services.sweep.run_once().unwrap();
        assert!(h.services.sweep.alerted_lots().is_empty());
    }

    #[test]
    fn spawned_sweep_stops_on_shutdown() {
        let h = Harness::new();
        let handle = h.services.sweep.clone().spawn_every(StdDuration::from_millis(10)).unwrap();
        std::thread::sleep(StdDuration::from_millis(30));
        handle.shutdown();
    }

    #[test]
    fn spawn_uses_configured_interval() {
        let h = Harness::with_config(LedgerConfig {
            sweep_interval_secs: 7,
            ..LedgerConfig::default()
        });
        let handle = h.services.sweep.clone().spawn().unwrap();
        assert_eq!(handle.interval(), StdDuration::from_secs(7));
        handle.shutdown();
    }
}
