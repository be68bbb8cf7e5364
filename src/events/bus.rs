//! Broadcast-based event bus with periodic persist ticks
//!
//! Publishing is best-effort: events published with no subscribers are
//! dropped silently (the engine components subscribe before the crawl
//! starts). The bus owns the periodic `PersistState` ticker and guarantees
//! one final persist event on graceful close.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use log::{debug, trace, warn};
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;

use super::types::SystemEvent;

/// Error conditions for event bus operations.
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    /// Receiver couldn't keep up and missed messages.
    #[error("receiver lagged behind, missed {0} messages")]
    ReceiverLagged(u64),

    /// The bus was closed.
    #[error("event bus shutdown")]
    Shutdown,
}

/// Process-wide event bus.
#[derive(Debug)]
pub struct EventBus {
    sender: broadcast::Sender<SystemEvent>,
    shutdown_flag: AtomicBool,
    shutdown_notify: Notify,
    events_published: AtomicU64,
    events_dropped: AtomicU64,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            shutdown_flag: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
            events_published: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn shared(capacity: usize) -> Arc<Self> {
        Arc::new(Self::new(capacity))
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Subscribe to all events from this point on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SystemEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all current subscribers.
    ///
    /// Returns the number of subscribers the event reached. Events published
    /// after shutdown are dropped and counted.
    pub fn publish(&self, event: SystemEvent) -> Result<usize, EventBusError> {
        if self.shutdown_flag.load(Ordering::Acquire) {
            self.events_dropped.fetch_add(1, Ordering::Relaxed);
            return Err(EventBusError::Shutdown);
        }
        trace!("publishing event: {}", event.name());
        match self.sender.send(event) {
            Ok(receivers) => {
                self.events_published.fetch_add(1, Ordering::Relaxed);
                Ok(receivers)
            }
            Err(_) => {
                // No subscribers; best-effort delivery drops the event.
                self.events_dropped.fetch_add(1, Ordering::Relaxed);
                Ok(0)
            }
        }
    }

    /// Total events accepted for delivery.
    #[must_use]
    pub fn published_count(&self) -> u64 {
        self.events_published.load(Ordering::Relaxed)
    }

    /// Total events dropped (no subscribers, or published after shutdown).
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.events_dropped.load(Ordering::Relaxed)
    }

    /// Whether the bus has been closed.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown_flag.load(Ordering::Acquire)
    }

    /// Spawn the periodic `PersistState` ticker.
    ///
    /// Fires `PersistState {is_migrating: false}` every `interval` until the
    /// bus shuts down. The handle stops with the bus; aborting it early is
    /// also safe.
    pub fn start_persist_interval(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let bus = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The immediate first tick would persist before any work happened.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if bus
                            .publish(SystemEvent::PersistState { is_migrating: false })
                            .is_err()
                        {
                            break;
                        }
                    }
                    _ = bus.shutdown_notify.notified() => break,
                }
            }
            debug!("persist ticker stopped");
        })
    }

    /// Close the bus: emit one final `PersistState`, then refuse new events.
    pub fn close(&self) {
        if self.shutdown_flag.swap(true, Ordering::AcqRel) {
            return;
        }
        // Final persist goes out after the flag is set; send directly so the
        // publish-side rejection doesn't apply to it.
        if self
            .sender
            .send(SystemEvent::PersistState { is_migrating: false })
            .is_err()
        {
            warn!("final persist event had no subscribers");
        }
        self.shutdown_notify.notify_waiters();
        debug!(
            "event bus closed ({} published, {} dropped)",
            self.published_count(),
            self.dropped_count()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscribers() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        let reached = bus.publish(SystemEvent::Migrating).expect("publish");
        assert_eq!(reached, 1);

        match rx.recv().await.expect("receive") {
            SystemEvent::Migrating => {}
            other => panic!("expected Migrating, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_dropped_not_fatal() {
        let bus = EventBus::new(16);
        let reached = bus.publish(SystemEvent::Aborting).expect("publish");
        assert_eq!(reached, 0);
        assert_eq!(bus.dropped_count(), 1);
    }

    #[tokio::test]
    async fn close_emits_final_persist_and_rejects_later_events() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.close();
        match rx.recv().await.expect("receive") {
            SystemEvent::PersistState { is_migrating } => assert!(!is_migrating),
            other => panic!("expected PersistState, got {other:?}"),
        }

        assert!(bus.publish(SystemEvent::Migrating).is_err());
    }

    #[tokio::test]
    async fn persist_ticker_fires_periodically() {
        let bus = EventBus::shared(16);
        let mut rx = bus.subscribe();
        let handle = Arc::clone(&bus).start_persist_interval(Duration::from_millis(20));

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("ticker should fire within a second")
            .expect("receive");
        match event {
            SystemEvent::PersistState { is_migrating } => assert!(!is_migrating),
            other => panic!("expected PersistState, got {other:?}"),
        }

        bus.close();
        let _ = handle.await;
    }
}
