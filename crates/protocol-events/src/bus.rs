//! EventBus - fan-out of events to any number of subscribers.
//!
//! Publishing goes through a `tokio::sync::broadcast` channel: a send never
//! waits on a receiver. A subscriber that falls more than `capacity` events
//! behind loses the oldest ones and is told how many it missed.

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::event::RunEvent;
use crate::filter::EventFilter;

/// Default number of events buffered per subscriber.
pub const DEFAULT_CAPACITY: usize = 256;

/// Broadcast bus. Cloning shares the same channel.
#[derive(Debug, Clone)]
pub struct EventBus<T> {
    tx: broadcast::Sender<T>,
}

impl<T: Clone + Send + 'static> Default for EventBus<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl<T: Clone + Send + 'static> EventBus<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Sends to every current subscriber. Returns how many got it.
    pub fn publish(&self, event: T) -> usize {
        // No subscribers is not an error.
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Runs `callback` for every event on its own task, off the publisher's
    /// path. Must be called inside a tokio runtime.
    ///
    /// The task ends when every sender is dropped or the returned
    /// [`Subscription`] is cancelled or dropped.
    pub fn attach<F>(&self, mut callback: F) -> Subscription
    where
        F: FnMut(T) + Send + 'static,
    {
        let mut rx = self.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => callback(event),
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "event subscriber lagged, events dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("event subscriber finished");
        });
        Subscription { handle }
    }
}

impl EventBus<RunEvent> {
    /// Like [`EventBus::attach`], but only for events matching `filter`.
    pub fn attach_filtered<F>(&self, filter: EventFilter, mut callback: F) -> Subscription
    where
        F: FnMut(RunEvent) + Send + 'static,
    {
        self.attach(move |event| {
            if filter.matches(&event) {
                callback(event);
            }
        })
    }
}

/// Handle to an attached callback. Dropping it detaches the callback.
#[derive(Debug)]
pub struct Subscription {
    handle: JoinHandle<()>,
}

impl Subscription {
    pub fn cancel(self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus: EventBus<u32> = EventBus::new(4);
        assert_eq!(bus.publish(1), 0);
    }

    #[tokio::test]
    async fn test_multiple_subscribers_each_receive() {
        let bus: EventBus<u32> = EventBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        assert_eq!(bus.publish(7), 2);
        assert_eq!(a.recv().await.unwrap(), 7);
        assert_eq!(b.recv().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_slow_subscriber_never_blocks_publisher() {
        let bus: EventBus<u32> = EventBus::new(2);
        let mut rx = bus.subscribe();
        for i in 0..10 {
            bus.publish(i);
        }
        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(_))));
        assert_eq!(rx.recv().await.unwrap(), 8);
    }

    #[tokio::test]
    async fn test_attach_runs_callback() {
        let bus: EventBus<u32> = EventBus::new(8);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let subscription = bus.attach(move |n| sink.lock().unwrap().push(n));

        bus.publish(1);
        bus.publish(2);

        for _ in 0..50 {
            if seen.lock().unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);

        drop(bus);
        for _ in 0..50 {
            if subscription.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(subscription.is_finished());
    }
}
