//! Outbound ledger notifications and the pub/sub mechanics that carry them.

pub mod bus;
pub mod event;
pub mod local_bus;
pub mod notification;
pub mod sink;

pub use bus::{EventBus, Subscription};
pub use event::Event;
pub use local_bus::{LocalBus, LocalBusError};
pub use notification::{
    FulfilledLine, LedgerNotification, LotExpired, LotExpiringSoon, ReservationFulfilled,
    StockBelowReorder,
};
pub use sink::{NotificationSink, NullSink};
