//! Process-local notification fan-out.
//!
//! Every subscriber owns an unbounded channel. Publishing clones the message
//! into each live channel; subscribers whose receiver was dropped are forgotten
//! on the next publish. After [`LocalBus::close`] publishing fails, which the
//! ledger's sink reports as a dropped notification.

use std::sync::mpsc::{self, Sender};
use std::sync::{Mutex, MutexGuard};

use thiserror::Error;

use crate::bus::{EventBus, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LocalBusError {
    #[error("notification bus lock poisoned")]
    Poisoned,
    #[error("notification bus closed")]
    Closed,
}

#[derive(Debug)]
struct Subscribers<M> {
    senders: Vec<Sender<M>>,
    closed: bool,
}

#[derive(Debug)]
pub struct LocalBus<M> {
    subscribers: Mutex<Subscribers<M>>,
}

impl<M> Default for LocalBus<M> {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Subscribers {
                senders: Vec::new(),
                closed: false,
            }),
        }
    }
}

impl<M> LocalBus<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop accepting notifications and hang up on every subscriber.
    pub fn close(&self) -> Result<(), LocalBusError> {
        let mut subscribers = self.subscribers()?;
        subscribers.closed = true;
        subscribers.senders.clear();
        Ok(())
    }

    /// Subscribers still attached as of the last publish.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers().map(|s| s.senders.len()).unwrap_or(0)
    }

    fn subscribers(&self) -> Result<MutexGuard<'_, Subscribers<M>>, LocalBusError> {
        self.subscribers.lock().map_err(|_| LocalBusError::Poisoned)
    }
}

impl<M> EventBus<M> for LocalBus<M>
where
    M: Clone + Send + 'static,
{
    type Error = LocalBusError;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        let mut subscribers = self.subscribers()?;
        if subscribers.closed {
            return Err(LocalBusError::Closed);
        }
        subscribers.senders.retain(|tx| tx.send(message.clone()).is_ok());
        Ok(())
    }

    /// A subscription taken after `close` (or on a poisoned bus) is already
    /// disconnected.
    fn subscribe(&self) -> Subscription<M> {
        let (tx, rx) = mpsc::channel();
        if let Ok(mut subscribers) = self.subscribers() {
            if !subscribers.closed {
                subscribers.senders.push(tx);
            }
        }
        Subscription::new(rx)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::TryRecvError;

    use super::*;

    #[test]
    fn notifications_reach_every_subscriber_in_order() {
        let bus = LocalBus::<&str>::new();
        let planning = bus.subscribe();
        let alerting = bus.subscribe();

        bus.publish("lot expired").unwrap();
        bus.publish("below reorder").unwrap();

        assert_eq!(planning.drain(), vec!["lot expired", "below reorder"]);
        assert_eq!(alerting.drain(), vec!["lot expired", "below reorder"]);
    }

    #[test]
    fn hung_up_subscribers_are_forgotten() {
        let bus = LocalBus::<u32>::new();
        let kept = bus.subscribe();
        drop(bus.subscribe());
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(7).unwrap();
        assert_eq!(kept.try_recv().unwrap(), 7);
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn closed_bus_rejects_notifications() {
        let bus = LocalBus::<u32>::new();
        let sub = bus.subscribe();
        bus.close().unwrap();

        assert_eq!(bus.publish(1), Err(LocalBusError::Closed));
        assert_eq!(sub.try_recv(), Err(TryRecvError::Disconnected));
        assert_eq!(bus.subscribe().try_recv(), Err(TryRecvError::Disconnected));
    }
}
