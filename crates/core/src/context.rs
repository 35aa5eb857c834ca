//! Per-call operation context: deadline + cooperative cancellation.
//!
//! Mutating ledger operations call [`OpContext::check`] before each
//! read-modify-write attempt and again right before committing, so a
//! cancelled or timed-out caller never leaves a partial effect behind.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::error::{LedgerError, LedgerResult};

/// Shared cancellation switch. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default)]
pub struct OpContext {
    deadline: Option<Instant>,
    cancellation: Option<CancellationFlag>,
}

impl OpContext {
    /// Context with no deadline that can never be cancelled.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_cancellation(mut self, flag: CancellationFlag) -> Self {
        self.cancellation = Some(flag);
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Fail fast if the caller gave up.
    pub fn check(&self) -> LedgerResult<()> {
        if self
            .cancellation
            .as_ref()
            .is_some_and(CancellationFlag::is_cancelled)
        {
            return Err(LedgerError::Cancelled);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(LedgerError::DeadlineExceeded);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn background_context_never_fails() {
        assert!(OpContext::background().check().is_ok());
    }

    #[test]
    fn cancellation_is_observed_by_clones() {
        let flag = CancellationFlag::new();
        let ctx = OpContext::background().with_cancellation(flag.clone());
        assert!(ctx.check().is_ok());

        flag.cancel();
        assert_eq!(ctx.check(), Err(LedgerError::Cancelled));
    }

    #[test]
    fn passed_deadline_is_reported() {
        let ctx = OpContext::background().with_deadline(Instant::now());
        assert_eq!(ctx.check(), Err(LedgerError::DeadlineExceeded));

        let ctx = OpContext::background().with_timeout(Duration::from_secs(60));
        assert!(ctx.check().is_ok());
    }
}
