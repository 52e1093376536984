use crate::stats::Stats;
use futures::{
    channel::mpsc::{self, UnboundedReceiver, UnboundedSender},
    Stream, StreamExt,
};
use std::{
    collections::BTreeMap,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

/// A serialized update, shared by every subscriber it is delivered to.
pub type Payload = Arc<str>;

/// A registered output channel.
#[derive(Clone, Debug)]
pub(crate) struct Listener {
    /// Change sequence the subscriber's snapshot already covers.
    pub joined_at: u64,
    pub sender: UnboundedSender<Payload>,
}

/// Output channels of connected subscribers, keyed by connection id.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    next: u64,
    subscribers: BTreeMap<u64, Listener>,
}

impl Registry {
    pub fn register(&mut self, joined_at: u64) -> (u64, UnboundedReceiver<Payload>) {
        let id = self.next;
        self.next += 1;
        let (sender, receiver) = mpsc::unbounded();
        self.subscribers.insert(id, Listener { joined_at, sender });
        (id, receiver)
    }

    /// Push `payload` to a single subscriber without removing it on failure.
    pub fn send(&self, id: u64, payload: Payload) -> bool {
        self.subscribers
            .get(&id)
            .is_some_and(|listener| listener.sender.unbounded_send(payload).is_ok())
    }

    pub fn remove(&mut self, id: u64) -> bool {
        match self.subscribers.remove(&id) {
            Some(listener) => {
                listener.sender.close_channel();
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) -> usize {
        let subscribers = std::mem::take(&mut self.subscribers);
        for listener in subscribers.values() {
            listener.sender.close_channel();
        }
        subscribers.len()
    }

    pub fn listeners(&self) -> Vec<(u64, Listener)> {
        self.subscribers
            .iter()
            .map(|(id, listener)| (*id, listener.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }
}

/// A live update subscription.
///
/// Yields serialized [chest_stats_types::api::Update]s, starting with a full
/// snapshot. The stream ends once the subscriber is deregistered; dropping the
/// handle deregisters it.
pub struct Subscription {
    id: u64,
    receiver: UnboundedReceiver<Payload>,
    stats: Stats,
}

impl Subscription {
    pub(crate) fn new(id: u64, receiver: UnboundedReceiver<Payload>, stats: Stats) -> Self {
        Self {
            id,
            receiver,
            stats,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Take the next queued payload without waiting.
    pub fn try_recv(&mut self) -> Option<Payload> {
        self.receiver.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = Payload;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Payload>> {
        self.receiver.poll_next_unpin(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.stats.unsubscribe(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_monotonic() {
        let mut registry = Registry::default();
        let (a, _ra) = registry.register(0);
        let (b, _rb) = registry.register(0);
        assert!(b > a);
        assert!(registry.remove(a));
        let (c, _rc) = registry.register(3);
        assert!(c > b);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_remove_closes_channel() {
        let mut registry = Registry::default();
        let (id, mut receiver) = registry.register(0);
        assert!(registry.send(id, Arc::from("hello")));
        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        assert!(!registry.send(id, Arc::from("late")));

        assert_eq!(receiver.try_recv().unwrap().as_ref(), "hello");
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn test_send_to_dropped_receiver_fails() {
        let mut registry = Registry::default();
        let (id, receiver) = registry.register(0);
        drop(receiver);
        assert!(!registry.send(id, Arc::from("lost")));
        assert_eq!(registry.len(), 1);
    }
}
