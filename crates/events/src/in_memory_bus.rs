//! In-process ledger event bus, used by tests and single-node deployments.
//!
//! Subscribers either take the whole stream or only the envelopes of one item, which is what a
//! per-item notification consumer needs. Closing the bus makes later publications fail so the
//! ledger service reports them.

use std::sync::{Mutex, mpsc};

use thiserror::Error;

use inventrack_core::ItemId;

use crate::bus::{EventBus, Subscription};
use crate::envelope::EventEnvelope;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InMemoryBusError {
    #[error("event bus lock poisoned")]
    Poisoned,
    #[error("event bus is closed")]
    Closed,
}

type Filter<M> = Box<dyn Fn(&M) -> bool + Send + Sync>;

struct Subscriber<M> {
    sender: mpsc::Sender<M>,
    filter: Option<Filter<M>>,
}

impl<M: Clone> Subscriber<M> {
    /// Deliver if wanted; `false` once the receiving side is gone.
    fn offer(&self, message: &M) -> bool {
        match &self.filter {
            Some(wants) if !wants(message) => true,
            _ => self.sender.send(message.clone()).is_ok(),
        }
    }
}

struct Registry<M> {
    subscribers: Vec<Subscriber<M>>,
    closed: bool,
}

/// Broadcast bus over `std::sync::mpsc` channels.
///
/// Fan-out is synchronous inside `publish`. Receivers that were dropped are pruned on the next
/// publication.
pub struct InMemoryEventBus<M> {
    registry: Mutex<Registry<M>>,
}

impl<M> InMemoryEventBus<M> {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry {
                subscribers: Vec::new(),
                closed: false,
            }),
        }
    }

    /// Receive only the messages `filter` accepts.
    pub fn subscribe_where<F>(&self, filter: F) -> Subscription<M>
    where
        F: Fn(&M) -> bool + Send + Sync + 'static,
    {
        self.register(Some(Box::new(filter)))
    }

    /// Refuse further publications and disconnect every subscriber.
    ///
    /// Already queued messages stay readable.
    pub fn close(&self) {
        if let Ok(mut registry) = self.registry.lock() {
            registry.closed = true;
            registry.subscribers.clear();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.registry.lock().map(|r| r.closed).unwrap_or(true)
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.lock().map(|r| r.subscribers.len()).unwrap_or(0)
    }

    fn register(&self, filter: Option<Filter<M>>) -> Subscription<M> {
        let (sender, receiver) = mpsc::channel();

        // A closed or poisoned bus hands out a disconnected subscription.
        if let Ok(mut registry) = self.registry.lock() {
            if !registry.closed {
                registry.subscribers.push(Subscriber { sender, filter });
            }
        }

        Subscription::new(receiver)
    }
}

impl<E> InMemoryEventBus<EventEnvelope<E>> {
    /// Receive the envelopes of one item only.
    pub fn subscribe_item(&self, item_id: ItemId) -> Subscription<EventEnvelope<E>> {
        self.subscribe_where(move |envelope: &EventEnvelope<E>| envelope.item_id() == item_id)
    }
}

impl<M> Default for InMemoryEventBus<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> std::fmt::Debug for InMemoryEventBus<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryEventBus")
            .field("subscribers", &self.subscriber_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<M> EventBus<M> for InMemoryEventBus<M>
where
    M: Clone + Send + 'static,
{
    type Error = InMemoryBusError;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        let mut registry = self.registry.lock().map_err(|_| InMemoryBusError::Poisoned)?;
        if registry.closed {
            return Err(InMemoryBusError::Closed);
        }

        registry.subscribers.retain(|s| s.offer(&message));
        Ok(())
    }

    fn subscribe(&self) -> Subscription<M> {
        self.register(None)
    }
}

#[cfg(test)]
mod tests {
    use inventrack_core::{Actor, MovementId};
    use uuid::Uuid;

    use super::*;

    fn envelope(item: i64, movement: i64) -> EventEnvelope<&'static str> {
        EventEnvelope::new(
            Uuid::now_v7(),
            ItemId::new(item),
            MovementId::new(movement),
            "inventory.item.assigned",
            Actor::new("jperez").unwrap(),
            "assigned",
        )
    }

    #[test]
    fn every_subscriber_gets_a_copy() {
        let bus = InMemoryEventBus::<u32>::new();
        let a = bus.subscribe();
        let b = bus.subscribe();

        bus.publish(7).unwrap();

        assert_eq!(a.try_recv().unwrap(), 7);
        assert_eq!(b.try_recv().unwrap(), 7);
    }

    #[test]
    fn item_subscription_sees_only_its_item() {
        let bus = InMemoryEventBus::<EventEnvelope<&'static str>>::new();
        let all = bus.subscribe();
        let x1 = bus.subscribe_item(ItemId::new(1));

        bus.publish(envelope(1, 10)).unwrap();
        bus.publish(envelope(2, 11)).unwrap();
        bus.publish(envelope(1, 12)).unwrap();

        let movements: Vec<_> = x1.drain().iter().map(|e| e.movement_id()).collect();
        assert_eq!(movements, vec![MovementId::new(10), MovementId::new(12)]);
        assert_eq!(all.drain().len(), 3);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = InMemoryEventBus::<u32>::new();
        let kept = bus.subscribe();
        drop(bus.subscribe());
        drop(bus.subscribe_where(|n| n % 2 == 0));

        bus.publish(1).unwrap();
        bus.publish(2).unwrap();

        assert_eq!(kept.drain(), vec![1, 2]);
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn closed_bus_refuses_publications() {
        let bus = InMemoryEventBus::<u32>::new();
        let sub = bus.subscribe();
        bus.publish(1).unwrap();

        bus.close();

        assert_eq!(bus.publish(2), Err(InMemoryBusError::Closed));
        assert_eq!(sub.drain(), vec![1]);
        assert!(sub.try_recv().is_err());
        assert_eq!(bus.subscriber_count(), 0);
        assert!(bus.subscribe().try_recv().is_err());
    }
}
