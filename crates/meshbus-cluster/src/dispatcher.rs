//! Topic dispatcher: fans inbound envelopes out to local subscribers.

use async_trait::async_trait;
use dashmap::DashMap;
use meshbus_types::Envelope;
use meshbus_wire::EnvelopeHandler;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{trace, warn};

/// Per-topic channel capacity. Slow subscribers skip ahead when it fills.
const TOPIC_CAPACITY: usize = 1024;

/// Per-topic broadcast of received envelopes.
pub struct Dispatcher {
    topics: DashMap<String, broadcast::Sender<Arc<Envelope>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            topics: DashMap::new(),
        }
    }

    /// Deliver an envelope to every subscriber of its topic.
    ///
    /// Returns the number of subscribers reached; envelopes for topics with no
    /// subscribers are discarded, and a topic whose subscribers have all gone
    /// is dropped.
    pub fn dispatch(&self, envelope: Envelope) -> usize {
        let topic = envelope.topic.clone();
        let sent = match self.topics.get(&topic) {
            Some(sender) => sender.send(Arc::new(envelope)),
            None => {
                trace!(%topic, sender = %envelope.sender, "No local subscribers");
                return 0;
            }
        };
        match sent {
            Ok(reached) => reached,
            Err(_) => {
                // Re-checked under the shard lock; subscribers attach under it too.
                if self
                    .topics
                    .remove_if(&topic, |_, sender| sender.receiver_count() == 0)
                    .is_some()
                {
                    trace!(%topic, "Dropped topic without subscribers");
                }
                0
            }
        }
    }

    /// Receive every envelope on `topic`.
    pub fn subscribe(&self, topic: &str) -> Subscription {
        Subscription {
            topic: topic.to_string(),
            partition: None,
            rx: self.receiver(topic),
        }
    }

    /// Receive only envelopes on `topic` whose partition equals `partition`.
    pub fn subscribe_partition(&self, topic: &str, partition: &str) -> Subscription {
        Subscription {
            topic: topic.to_string(),
            partition: Some(partition.to_string()),
            rx: self.receiver(topic),
        }
    }

    /// Drop a topic's channel. Open subscriptions end.
    pub fn close_topic(&self, topic: &str) -> bool {
        self.topics.remove(topic).is_some()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }

    /// Attach while holding the entry, so `dispatch` cannot drop the topic
    /// between lookup and subscribe.
    fn receiver(&self, topic: &str) -> broadcast::Receiver<Arc<Envelope>> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EnvelopeHandler for Dispatcher {
    async fn handle_envelope(&self, envelope: Envelope, from: SocketAddr) {
        trace!(peer = %from, topic = %envelope.topic, class_name = %envelope.class_name, "Envelope received");
        self.dispatch(envelope);
    }
}

/// A subscriber's view of one topic.
pub struct Subscription {
    topic: String,
    partition: Option<String>,
    rx: broadcast::Receiver<Arc<Envelope>>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next matching envelope, or `None` once the topic is closed.
    pub async fn recv(&mut self) -> Option<Arc<Envelope>> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) => {
                    if self.matches(&envelope) {
                        return Some(envelope);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(topic = %self.topic, skipped, "Subscriber lagging, envelopes skipped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    fn matches(&self, envelope: &Envelope) -> bool {
        match &self.partition {
            Some(partition) => envelope.partition == *partition,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(topic: &str, partition: &str) -> Envelope {
        Envelope::new(
            "127.0.0.1:1:2".parse().unwrap(),
            topic,
            "Msg",
            vec![1],
        )
        .with_partition(partition)
    }

    #[tokio::test]
    async fn test_dispatch_by_topic() {
        let dispatcher = Dispatcher::new();
        let mut a = dispatcher.subscribe("a");
        let mut b = dispatcher.subscribe("b");

        assert_eq!(dispatcher.dispatch(envelope("a", "")), 1);
        assert_eq!(dispatcher.dispatch(envelope("none", "")), 0);
        dispatcher.dispatch(envelope("b", ""));

        assert_eq!(a.recv().await.unwrap().topic, "a");
        assert_eq!(b.recv().await.unwrap().topic, "b");
        assert!(a.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_partition_filter() {
        let dispatcher = Dispatcher::new();
        let mut all = dispatcher.subscribe("t");
        let mut p1 = dispatcher.subscribe_partition("t", "p1");

        dispatcher.dispatch(envelope("t", "p0"));
        dispatcher.dispatch(envelope("t", "p1"));

        assert_eq!(all.recv().await.unwrap().partition, "p0");
        assert_eq!(all.recv().await.unwrap().partition, "p1");
        assert_eq!(p1.recv().await.unwrap().partition, "p1");
        assert_eq!(dispatcher.subscriber_count("t"), 2);
    }

    #[test]
    fn test_abandoned_topic_is_dropped() {
        let dispatcher = Dispatcher::new();
        let sub = dispatcher.subscribe("t");
        assert!(dispatcher.topics.contains_key("t"));
        drop(sub);

        assert_eq!(dispatcher.dispatch(envelope("t", "")), 0);
        assert!(!dispatcher.topics.contains_key("t"));
        assert_eq!(dispatcher.subscriber_count("t"), 0);

        // Subscribing again starts a fresh channel.
        let mut again = dispatcher.subscribe("t");
        assert_eq!(dispatcher.dispatch(envelope("t", "")), 1);
        assert!(again.rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_close_topic_ends_subscription() {
        let dispatcher = Dispatcher::new();
        let mut sub = dispatcher.subscribe("t");
        assert!(dispatcher.close_topic("t"));
        assert!(sub.recv().await.is_none());
        assert!(!dispatcher.close_topic("t"));
    }
}
