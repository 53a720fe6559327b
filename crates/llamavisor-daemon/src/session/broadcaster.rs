//! Event fan-out to any number of live subscribers.
//!
//! Built on `tokio::sync::broadcast`: every subscriber has its own read
//! position over a bounded ring of `capacity` events. Publishing never waits.
//! A subscriber that falls more than `capacity` events behind loses the
//! oldest ones and resumes from the oldest event still retained; other
//! subscribers are unaffected. Events are delivered in publication order.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::{debug, warn};

use super::types::ServiceEvent;

/// Publish/subscribe hub for [`ServiceEvent`]s.
pub struct EventBroadcaster {
    tx: broadcast::Sender<ServiceEvent>,
    next_subscriber: AtomicU64,
}

impl EventBroadcaster {
    /// Create a broadcaster whose subscribers may lag by up to `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            next_subscriber: AtomicU64::new(1),
        }
    }

    /// Deliver an event to every currently registered subscriber.
    ///
    /// Returns the number of subscribers the event was queued for.
    pub fn publish(&self, event: ServiceEvent) -> usize {
        self.tx.send(event).map_or(0, |count| {
            debug!(receivers = count, "Event broadcast");
            count
        })
    }

    /// Register a subscriber that receives every event published from now on.
    pub fn subscribe(&self) -> Subscription {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        debug!(subscriber = id, "Subscriber registered");
        Subscription {
            id,
            rx: self.tx.subscribe(),
            dropped: 0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Receiving end of a subscription.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    rx: broadcast::Receiver<ServiceEvent>,
    dropped: u64,
}

impl Subscription {
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Events this subscriber lost to overflow so far.
    pub const fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Wait for the next event. `None` once the broadcaster is gone.
    pub async fn recv(&mut self) -> Option<ServiceEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => self.record_lag(skipped),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<ServiceEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(skipped)) => self.record_lag(skipped),
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    /// Stop receiving events.
    pub fn unsubscribe(self) {
        debug!(subscriber = self.id, dropped = self.dropped, "Subscriber removed");
    }

    fn record_lag(&mut self, skipped: u64) {
        self.dropped += skipped;
        warn!(
            subscriber = self.id,
            skipped,
            total_dropped = self.dropped,
            "Subscriber fell behind, oldest events dropped"
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::session::types::{Diagnostic, DiagnosticKind};

    fn marker(n: u64) -> ServiceEvent {
        ServiceEvent::Diagnostic(Diagnostic {
            kind: DiagnosticKind::StreamOverflow,
            generation: n,
            message: format!("event {n}"),
        })
    }

    fn generation_of(event: &ServiceEvent) -> u64 {
        match event {
            ServiceEvent::Diagnostic(d) => d.generation,
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn every_subscriber_gets_events_in_order() {
        let hub = EventBroadcaster::new(16);
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();

        for n in 1..=3 {
            assert_eq!(hub.publish(marker(n)), 2);
        }

        for sub in [&mut a, &mut b] {
            let got: Vec<u64> = [
                sub.recv().await.unwrap(),
                sub.recv().await.unwrap(),
                sub.recv().await.unwrap(),
            ]
            .iter()
            .map(generation_of)
            .collect();
            assert_eq!(got, [1, 2, 3]);
        }
    }

    #[tokio::test]
    async fn late_subscriber_sees_only_later_events() {
        let hub = EventBroadcaster::new(16);
        let _early = hub.subscribe();
        hub.publish(marker(1));
        hub.publish(marker(2));

        let mut late = hub.subscribe();
        assert!(late.try_recv().is_none());
        hub.publish(marker(3));
        assert_eq!(generation_of(&late.recv().await.unwrap()), 3);
    }

    #[tokio::test]
    async fn slow_subscriber_drops_oldest_without_blocking_publisher() {
        let hub = EventBroadcaster::new(4);
        let mut slow = hub.subscribe();
        let mut fast = hub.subscribe();

        for n in 1..=10 {
            hub.publish(marker(n));
            // The fast subscriber keeps up.
            assert_eq!(generation_of(&fast.recv().await.unwrap()), n);
        }

        let first = slow.recv().await.unwrap();
        assert_eq!(generation_of(&first), 7);
        assert_eq!(slow.dropped(), 6);
        let rest: Vec<u64> = std::iter::from_fn(|| slow.try_recv())
            .map(|e| generation_of(&e))
            .collect();
        assert_eq!(rest, [8, 9, 10]);
        assert_eq!(fast.dropped(), 0);
    }

    #[tokio::test]
    async fn unsubscribe_reduces_count() {
        let hub = EventBroadcaster::new(4);
        let sub = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 1);
        sub.unsubscribe();
        assert_eq!(hub.subscriber_count(), 0);
        assert_eq!(hub.publish(marker(1)), 0);
    }

    #[tokio::test]
    async fn recv_ends_when_broadcaster_dropped() {
        let hub = EventBroadcaster::new(4);
        let mut sub = hub.subscribe();
        drop(hub);
        assert!(sub.recv().await.is_none());
    }
}
