//! Publish/subscribe primitive behind the coordinator's event channel.
//!
//! Every listener owns an unbounded queue: it receives every event published
//! after it subscribed, in publish order, and nothing from before. Closing the
//! bus (or a listener scope) ends the affected streams for all their holders
//! at once.

use log::debug;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Groups listeners that are finished together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerScope {
    /// Lives as long as the hardware session.
    Session,
    /// Also ends when the active scan is stopped or replaced.
    Scan,
}

struct Listener<E> {
    tx: mpsc::UnboundedSender<E>,
    scope: ListenerScope,
}

pub struct EventBus<E> {
    listeners: Vec<Listener<E>>,
    closed: bool,
}

impl<E: Clone> EventBus<E> {
    pub fn new() -> Self {
        Self { listeners: Vec::new(), closed: false }
    }

    /// A bus that is already finished: every subscription ends immediately.
    pub fn finished() -> Self {
        Self { listeners: Vec::new(), closed: true }
    }

    pub fn subscribe(
        &mut self, scope: ListenerScope,
    ) -> UnboundedReceiverStream<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        if !self.closed {
            self.listeners.push(Listener { tx, scope });
        }
        UnboundedReceiverStream::new(rx)
    }

    /// Delivers `event` to every live listener, forgetting those whose
    /// stream was dropped.
    pub fn publish(&mut self, event: E) {
        self.listeners.retain(|listener| listener.tx.send(event.clone()).is_ok());
    }

    pub fn close_scope(&mut self, scope: ListenerScope) {
        let before = self.listeners.len();
        self.listeners.retain(|listener| listener.scope != scope);
        debug!(
            "Closed {} {:?} listener(s)",
            before - self.listeners.len(),
            scope
        );
    }

    pub fn close(&mut self) {
        self.listeners.clear();
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_listeners_only_see_later_events() {
        let mut bus = EventBus::new();
        let mut early = bus.subscribe(ListenerScope::Session);
        bus.publish(1);
        let late = bus.subscribe(ListenerScope::Session);
        bus.publish(2);
        bus.publish(3);
        bus.close();

        assert_eq!(early.by_ref().collect::<Vec<_>>().await, vec![1, 2, 3]);
        assert_eq!(late.collect::<Vec<_>>().await, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_close_scope_only_ends_that_scope() {
        let mut bus = EventBus::new();
        let scan = bus.subscribe(ListenerScope::Scan);
        let mut session = bus.subscribe(ListenerScope::Session);

        bus.close_scope(ListenerScope::Scan);
        bus.publish("after");

        assert!(scan.collect::<Vec<_>>().await.is_empty());
        assert_eq!(session.next().await, Some("after"));
        assert!(!bus.is_closed());
    }

    #[tokio::test]
    async fn test_finished_bus_ends_subscriptions() {
        let mut bus: EventBus<u8> = EventBus::finished();
        let stream = bus.subscribe(ListenerScope::Session);
        bus.publish(1);

        assert!(stream.collect::<Vec<_>>().await.is_empty());
        assert_eq!(bus.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_listeners_are_pruned() {
        let mut bus = EventBus::new();
        let dropped = bus.subscribe(ListenerScope::Session);
        let _kept = bus.subscribe(ListenerScope::Session);
        drop(dropped);

        bus.publish(1);
        assert_eq!(bus.listener_count(), 1);
    }
}
