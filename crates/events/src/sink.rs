//! Fire-and-forget delivery of ledger notifications.

use tracing::warn;

use crate::bus::EventBus;
use crate::event::Event;
use crate::notification::LedgerNotification;

/// Where the ledger sends notifications.
///
/// `notify` never fails: a delivery problem must not roll back (or fail) the
/// stock mutation that triggered it.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: LedgerNotification);
}

impl<B> NotificationSink for B
where
    B: EventBus<LedgerNotification>,
{
    fn notify(&self, notification: LedgerNotification) {
        let event_type = notification.event_type();
        let material_id = notification.material_id();
        if let Err(err) = self.publish(notification) {
            warn!(
                event_type,
                %material_id,
                error = ?err,
                "failed to publish ledger notification"
            );
        }
    }
}

/// Sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl NotificationSink for NullSink {
    fn notify(&self, _notification: LedgerNotification) {}
}
