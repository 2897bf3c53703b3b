use crate::errors::Error;
use crate::metrics::{LIVE_SUBSCRIBERS, PUBLISHED_TOTAL, SUBSCRIBER_DROPS_TOTAL};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Message delivered to live subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub topic: String,
    pub ts: DateTime<Utc>,
    pub payload: Value,
}

struct SubscriberEntry {
    id: u64,
    tx: mpsc::UnboundedSender<Envelope>,
}

#[derive(Default)]
struct BrokerInner {
    next_id: u64,
    topics: HashMap<String, Vec<SubscriberEntry>>,
}

/// In-process publish/subscribe hub. Each subscription owns an unbounded
/// channel the broker writes into, so `publish` never waits on a subscriber
/// and one dead observer cannot affect the others. The handle is cheap to
/// clone and is injected wherever fan-out or live reads are needed; there is
/// no process-global registry.
#[derive(Clone, Default)]
pub struct TopicBroker {
    inner: Arc<Mutex<BrokerInner>>,
}

fn lock(inner: &Mutex<BrokerInner>) -> MutexGuard<'_, BrokerInner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TopicBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers `payload` to every subscriber currently registered on
    /// `topic` and returns how many received it. Subscribers registered
    /// after this call never see the message. A subscriber whose channel is
    /// closed counts as a `SubscriberError`: it is logged, pruned, and does
    /// not affect the remaining deliveries or the publisher.
    pub fn publish(&self, topic: &str, payload: Value) -> usize {
        let envelope = Envelope {
            topic: topic.to_string(),
            ts: Utc::now(),
            payload,
        };

        let mut inner = lock(&self.inner);
        let Some(entries) = inner.topics.get_mut(topic) else {
            PUBLISHED_TOTAL.inc();
            return 0;
        };

        let mut delivered = 0;
        entries.retain(|entry| match entry.tx.send(envelope.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(_) => {
                let err = Error::Subscriber {
                    topic: topic.to_string(),
                };
                warn!(subscriber = entry.id, "{err}");
                SUBSCRIBER_DROPS_TOTAL.inc();
                LIVE_SUBSCRIBERS.dec();
                false
            }
        });
        if entries.is_empty() {
            inner.topics.remove(topic);
        }
        PUBLISHED_TOTAL.inc();
        delivered
    }

    /// Registers a new subscription on `topic`. Subscribing the same
    /// observer twice yields two independent entries; each is removed
    /// individually (explicitly or on drop).
    pub fn subscribe(&self, topic: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = lock(&self.inner);
        let id = inner.next_id;
        inner.next_id += 1;
        inner
            .topics
            .entry(topic.to_string())
            .or_default()
            .push(SubscriberEntry { id, tx });
        LIVE_SUBSCRIBERS.inc();
        debug!(topic, id, "subscriber registered");
        Subscription {
            topic: topic.to_string(),
            id,
            rx: Some(rx),
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner).topics.values().map(Vec::len).sum()
    }
}

/// Live subscription handle. Dropping it (or calling `unsubscribe`) removes
/// the registration; messages published before the subscription existed are
/// never replayed.
pub struct Subscription {
    topic: String,
    id: u64,
    rx: Option<mpsc::UnboundedReceiver<Envelope>>,
    inner: Arc<Mutex<BrokerInner>>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn recv(&mut self) -> Option<Envelope> {
        match self.rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.rx.as_mut().and_then(|rx| rx.try_recv().ok())
    }

    pub fn unsubscribe(self) {
        drop(self);
    }

    /// Detaches the raw receiver, leaving the registration in place. The
    /// broker only notices the dead channel on the next publish; used to
    /// model an observer that failed without cleanly unsubscribing.
    #[cfg(test)]
    pub(crate) fn detach(mut self) -> mpsc::UnboundedReceiver<Envelope> {
        self.rx.take().expect("receiver taken twice")
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // A detached subscription is pruned by publish instead.
        if self.rx.is_none() {
            return;
        }
        let mut inner = lock(&self.inner);
        if let Some(entries) = inner.topics.get_mut(&self.topic) {
            entries.retain(|entry| entry.id != self.id);
            if entries.is_empty() {
                inner.topics.remove(&self.topic);
            }
            LIVE_SUBSCRIBERS.dec();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fan_out_reaches_all_current_subscribers() {
        tokio_test::block_on(async {
            let broker = TopicBroker::new();
            let mut first = broker.subscribe("sensor");
            let mut second = broker.subscribe("sensor");

            let delivered = broker.publish("sensor", json!({"temp": 21.5}));
            assert_eq!(delivered, 2);
            assert_eq!(first.recv().await.unwrap().payload["temp"], json!(21.5));
            assert_eq!(second.recv().await.unwrap().payload["temp"], json!(21.5));
        });
    }

    #[test]
    fn dead_subscriber_does_not_block_the_others() {
        tokio_test::block_on(async {
            let broker = TopicBroker::new();
            let mut first = broker.subscribe("sensor");
            // The second observer dies without unsubscribing.
            let failed = broker.subscribe("sensor");
            drop(failed.detach());
            let mut third = broker.subscribe("sensor");

            let delivered = broker.publish("sensor", json!({"v": 1}));
            assert_eq!(delivered, 2);
            assert!(first.try_recv().is_some());
            assert!(third.try_recv().is_some());

            // The dead entry was pruned; publishing again reaches two.
            assert_eq!(broker.subscriber_count(), 2);
        });
    }

    #[test]
    fn late_subscribers_get_no_replay() {
        tokio_test::block_on(async {
            let broker = TopicBroker::new();
            assert_eq!(broker.publish("x", json!(1)), 0);

            let mut sub = broker.subscribe("x");
            assert!(sub.try_recv().is_none());

            broker.publish("x", json!(2));
            assert_eq!(sub.recv().await.unwrap().payload, json!(2));
        });
    }

    #[test]
    fn duplicate_subscriptions_fire_and_unsubscribe_independently() {
        tokio_test::block_on(async {
            let broker = TopicBroker::new();
            let mut first = broker.subscribe("co2");
            let mut second = broker.subscribe("co2");

            assert_eq!(broker.publish("co2", json!(400)), 2);
            assert!(first.try_recv().is_some());
            assert!(second.try_recv().is_some());

            first.unsubscribe();
            assert_eq!(broker.publish("co2", json!(410)), 1);
            assert_eq!(second.recv().await.unwrap().payload, json!(410));
        });
    }

    #[test]
    fn topics_are_isolated() {
        tokio_test::block_on(async {
            let broker = TopicBroker::new();
            let mut temp = broker.subscribe("temperature");
            broker.publish("co2", json!(500));
            assert!(temp.try_recv().is_none());
        });
    }
}
