//! Ledger error model.

use thiserror::Error;

use crate::Quantity;

/// Result type used across the ledger.
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Ledger-level error.
///
/// Input and domain-rule violations (`InvalidQuantity`, `InvalidId`,
/// `InsufficientStock`, `DuplicateLot`, `InvalidTransition`) are caller-correctable and are never
/// retried by the ledger. `ConcurrentModification` is the only retryable kind.
/// `StorageFault` is surfaced unmodified; retry policy for infrastructure
/// failures belongs to the caller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Non-positive or otherwise malformed quantity argument.
    #[error("invalid quantity: {0}")]
    InvalidQuantity(String),

    /// Requested quantity exceeds available/eligible stock.
    #[error("insufficient stock: requested {requested}, available {available}, shortfall {shortfall}")]
    InsufficientStock {
        requested: Quantity,
        available: Quantity,
        shortfall: Quantity,
    },

    /// Lot number already registered for the material.
    #[error("duplicate lot '{lot_number}' for material {material}")]
    DuplicateLot { material: String, lot_number: String },

    /// Operation attempted on a lot/reservation in a terminal or incompatible state.
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    /// Commit-time recheck failed because another operation got there first.
    #[error("concurrent modification: {0}")]
    ConcurrentModification(String),

    /// The persistence layer failed; no partial effects are visible.
    #[error("storage fault: {0}")]
    StorageFault(String),

    /// An identifier could not be parsed, or a lot number is blank.
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A referenced lot/reservation does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller cancelled the operation before any mutation was applied.
    #[error("operation cancelled")]
    Cancelled,

    /// The caller-supplied deadline passed before any mutation was applied.
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

impl LedgerError {
    pub fn invalid_quantity(msg: impl Into<String>) -> Self {
        Self::InvalidQuantity(msg.into())
    }

    /// Shortfall is derived; `available` is clamped at zero.
    pub fn insufficient(requested: Quantity, available: Quantity) -> Self {
        let available = available.max(0);
        Self::InsufficientStock {
            requested,
            available,
            shortfall: requested.saturating_sub(available).max(0),
        }
    }

    pub fn duplicate_lot(material: impl ToString, lot_number: impl Into<String>) -> Self {
        Self::DuplicateLot {
            material: material.to_string(),
            lot_number: lot_number.into(),
        }
    }

    pub fn invalid_transition(msg: impl Into<String>) -> Self {
        Self::InvalidTransition(msg.into())
    }

    pub fn concurrent(msg: impl Into<String>) -> Self {
        Self::ConcurrentModification(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::StorageFault(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// True only for kinds the ledger may retry internally (with re-planning).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrentModification(_))
    }

    /// Shortfall carried by an `InsufficientStock` error.
    pub fn shortfall(&self) -> Option<Quantity> {
        match self {
            Self::InsufficientStock { shortfall, .. } => Some(*shortfall),
            _ => None,
        }
    }
}

/// Validate a strictly positive quantity argument.
pub fn ensure_positive(quantity: Quantity, what: &str) -> LedgerResult<()> {
    if quantity <= 0 {
        return Err(LedgerError::invalid_quantity(format!(
            "{what} must be positive (got {quantity})"
        )));
    }
    Ok(())
}

/// Sum quantities, rejecting a total that does not fit in [`Quantity`].
pub fn checked_sum(quantities: impl IntoIterator<Item = Quantity>, what: &str) -> LedgerResult<Quantity> {
    quantities.into_iter().try_fold(0, |total: Quantity, q| {
        total
            .checked_add(q)
            .ok_or_else(|| LedgerError::invalid_quantity(format!("{what} overflows")))
    })
}
