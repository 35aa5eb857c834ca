use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use lotledger_core::{Entity, LedgerError, LedgerResult, LotId, MaterialId};

/// Quality-control disposition of a lot. Only `Passed` lots may be issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QcStatus {
    Pending,
    Passed,
    Failed,
}

/// Lifecycle status of a lot. `Expired` and `Consumed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LotStatus {
    Available,
    Blocked,
    Expired,
    Consumed,
}

impl LotStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, LotStatus::Expired | LotStatus::Consumed)
    }
}

/// Outcome of an idempotent state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// State changed; the caller must persist it.
    Applied,
    /// Already in the target state; nothing to persist.
    Unchanged,
}

impl Transition {
    pub fn is_applied(self) -> bool {
        self == Transition::Applied
    }
}

/// Input for registering a lot on goods receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewLot {
    pub material_id: MaterialId,
    pub lot_number: String,
    pub expiry_date: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub supplier_lot_number: Option<String>,
}

/// A physically distinct, traceable batch of one material.
///
/// Quantities live on stock records, not here: a lot carries identity,
/// dating and disposition only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lot {
    pub(crate) id: LotId,
    pub(crate) lot_number: String,
    pub(crate) material_id: MaterialId,
    pub(crate) supplier_lot_number: Option<String>,
    pub(crate) received_at: DateTime<Utc>,
    pub(crate) expiry_date: DateTime<Utc>,
    pub(crate) qc_status: QcStatus,
    pub(crate) status: LotStatus,
    pub(crate) updated_at: DateTime<Utc>,
    pub(crate) version: u64,
}

impl Lot {
    /// New lots start QC `pending` and status `available`; they become
    /// issuable once QC passes.
    pub fn new(id: LotId, input: NewLot) -> LedgerResult<Self> {
        let lot_number = input.lot_number.trim().to_string();
        if lot_number.is_empty() {
            return Err(LedgerError::invalid_id("lot number cannot be empty"));
        }
        Ok(Self {
            id,
            lot_number,
            material_id: input.material_id,
            supplier_lot_number: input.supplier_lot_number,
            received_at: input.received_at,
            expiry_date: input.expiry_date,
            qc_status: QcStatus::Pending,
            status: LotStatus::Available,
            updated_at: input.received_at,
            version: 0,
        })
    }

    pub fn id_typed(&self) -> LotId {
        self.id
    }

    pub fn lot_number(&self) -> &str {
        &self.lot_number
    }

    pub fn material_id(&self) -> MaterialId {
        self.material_id
    }

    pub fn supplier_lot_number(&self) -> Option<&str> {
        self.supplier_lot_number.as_deref()
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    pub fn expiry_date(&self) -> DateTime<Utc> {
        self.expiry_date
    }

    pub fn qc_status(&self) -> QcStatus {
        self.qc_status
    }

    pub fn status(&self) -> LotStatus {
        self.status
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Store-assigned version (0 = never persisted).
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Used by repository adapters when persisting.
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Whole days until expiry (truncated; negative once past).
    pub fn days_until_expiry(&self, now: DateTime<Utc>) -> i64 {
        (self.expiry_date - now).num_days()
    }

    /// Expired either by transition or by date.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == LotStatus::Expired || self.expiry_date <= now
    }

    /// Date has passed but the `expired` transition has not been applied yet.
    pub fn needs_expiry_transition(&self, now: DateTime<Utc>) -> bool {
        !self.status.is_terminal() && self.expiry_date <= now
    }

    /// True iff `0 <= expiry - now <= within_days`, both ends inclusive.
    ///
    /// Already-expired lots are reported by the expired query, never here.
    pub fn is_expiring_soon(&self, now: DateTime<Utc>, within_days: u32) -> bool {
        if self.is_expired(now) {
            return false;
        }
        self.expiry_date <= now + Duration::days(i64::from(within_days))
    }

    pub fn can_be_issued(&self, now: DateTime<Utc>) -> bool {
        self.status == LotStatus::Available
            && self.qc_status == QcStatus::Passed
            && !self.is_expired(now)
    }

    /// Record an inspection result.
    ///
    /// `Passed` makes the lot available, `Failed` blocks it, `Pending` leaves
    /// the lifecycle status alone.
    pub fn set_qc_status(&mut self, qc: QcStatus, at: DateTime<Utc>) -> LedgerResult<Transition> {
        if self.status.is_terminal() {
            return Err(LedgerError::invalid_transition(format!(
                "cannot change QC of lot {} in status {:?}",
                self.lot_number, self.status
            )));
        }

        let status = match qc {
            QcStatus::Passed => LotStatus::Available,
            QcStatus::Failed => LotStatus::Blocked,
            QcStatus::Pending => self.status,
        };

        if self.qc_status == qc && self.status == status {
            return Ok(Transition::Unchanged);
        }

        self.qc_status = qc;
        self.status = status;
        self.updated_at = at;
        Ok(Transition::Applied)
    }

    /// Idempotent; a consumed lot stays consumed.
    pub fn mark_expired(&mut self, at: DateTime<Utc>) -> Transition {
        if self.status.is_terminal() {
            return Transition::Unchanged;
        }
        self.status = LotStatus::Expired;
        self.updated_at = at;
        Transition::Applied
    }

    /// All stock of the lot has been depleted. Idempotent.
    pub fn mark_consumed(&mut self, at: DateTime<Utc>) -> Transition {
        if self.status.is_terminal() {
            return Transition::Unchanged;
        }
        self.status = LotStatus::Consumed;
        self.updated_at = at;
        Transition::Applied
    }

    pub fn block(&mut self, at: DateTime<Utc>) -> LedgerResult<Transition> {
        match self.status {
            LotStatus::Blocked => Ok(Transition::Unchanged),
            LotStatus::Available => {
                self.status = LotStatus::Blocked;
                self.updated_at = at;
                Ok(Transition::Applied)
            }
            terminal => Err(LedgerError::invalid_transition(format!(
                "cannot block lot {} in status {terminal:?}",
                self.lot_number
            ))),
        }
    }

    pub fn unblock(&mut self, at: DateTime<Utc>) -> LedgerResult<Transition> {
        match self.status {
            LotStatus::Available => Ok(Transition::Unchanged),
            LotStatus::Blocked => {
                if self.qc_status != QcStatus::Passed {
                    return Err(LedgerError::invalid_transition(format!(
                        "lot {} cannot be unblocked with QC {:?}",
                        self.lot_number, self.qc_status
                    )));
                }
                if self.is_expired(at) {
                    return Err(LedgerError::invalid_transition(format!(
                        "lot {} is past its expiry date",
                        self.lot_number
                    )));
                }
                self.status = LotStatus::Available;
                self.updated_at = at;
                Ok(Transition::Applied)
            }
            terminal => Err(LedgerError::invalid_transition(format!(
                "cannot unblock lot {} in status {terminal:?}",
                self.lot_number
            ))),
        }
    }

    /// Receipts are refused once the lot reached a terminal state.
    pub fn ensure_accepts_receipt(&self, now: DateTime<Utc>) -> LedgerResult<()> {
        if self.status.is_terminal() || self.is_expired(now) {
            return Err(LedgerError::invalid_transition(format!(
                "lot {} cannot receive stock in status {:?}",
                self.lot_number, self.status
            )));
        }
        Ok(())
    }

    /// Gate for reserve/consume against this lot's stock.
    pub fn ensure_issuable(&self, now: DateTime<Utc>) -> LedgerResult<()> {
        if self.can_be_issued(now) {
            return Ok(());
        }
        Err(LedgerError::invalid_transition(format!(
            "lot {} is not issuable (status {:?}, QC {:?}, expires {})",
            self.lot_number, self.status, self.qc_status, self.expiry_date
        )))
    }
}

impl Entity for Lot {
    type Id = LotId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}
