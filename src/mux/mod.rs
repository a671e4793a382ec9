//! Upstream topic multiplexing.
//!
//! One broker session serves every local subscriber. The multiplexer owns the
//! connection state, reference-counts local subscribers per topic so the
//! upstream sees exactly one subscribe per topic in use (and one unsubscribe
//! when the last local subscriber leaves), and keeps the last payload seen on
//! each topic so late joiners get an immediate replay — brokers do not
//! re-deliver retained messages to a client that is already subscribed.
//!
//! Fan-out is by exact topic match; wildcard subscriptions are not handled at
//! this layer. Messages are never buffered: publishing while disconnected is
//! a delivery failure, not a queue entry.

mod link;

#[cfg(test)]
mod tests;

pub use link::{BrokerLink, LinkError, MqttLink};

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use tracing::{debug, warn};

/// Local subscriber identity; item ids double as subscriber ids.
pub type SubscriberId = u32;

/// Upstream connection lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// Last payload seen on a topic.
#[derive(Clone, Debug, PartialEq)]
pub struct CachedMessage {
    pub payload: String,
    pub qos: u8,
    pub retain: bool,
}

/// Publish failures reported to the caller. Nothing is retried.
#[derive(Debug)]
pub enum PublishError {
    NotConnected,
    Link(LinkError),
}

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishError::NotConnected => f.write_str("not connected to broker"),
            PublishError::Link(e) => write!(f, "broker link error: {}", e),
        }
    }
}

impl std::error::Error for PublishError {}

struct TopicEntry {
    qos: u8,
    subscribers: BTreeSet<SubscriberId>,
}

/// Reference-counting topic multiplexer over a single broker link.
pub struct TopicMultiplexer<L> {
    link: L,
    state: LinkState,
    topics: BTreeMap<String, TopicEntry>,
    cache: HashMap<String, CachedMessage>,
    failed: BTreeSet<String>,
}

impl<L: BrokerLink> TopicMultiplexer<L> {
    pub fn new(link: L) -> Self {
        Self {
            link,
            state: LinkState::Disconnected,
            topics: BTreeMap::new(),
            cache: HashMap::new(),
            failed: BTreeSet::new(),
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Topics whose upstream subscription could not be established while
    /// connected. Surfaced in the driver's status string.
    pub fn degraded_topics(&self) -> impl Iterator<Item = &str> {
        self.failed.iter().map(|s| s.as_str())
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    /// A connect attempt is underway.
    pub fn link_connecting(&mut self) {
        self.state = LinkState::Connecting;
    }

    /// Handshake completed: re-issue the upstream subscription for every
    /// topic with at least one local subscriber.
    pub fn link_up(&mut self) {
        self.state = LinkState::Connected;
        self.failed.clear();
        for (topic, entry) in &self.topics {
            if entry.subscribers.is_empty() {
                continue;
            }
            if let Err(e) = self.link.subscribe(topic, entry.qos) {
                warn!(topic = %topic, error = %e, "Upstream subscribe failed");
                self.failed.insert(topic.clone());
            }
        }
    }

    /// Connection lost or released.
    pub fn link_down(&mut self) {
        self.state = LinkState::Disconnected;
        self.failed.clear();
    }

    /// Adds a local subscriber. The first subscriber on a topic triggers the
    /// single upstream subscribe (deferred to the next connect when
    /// offline). Later subscribers get the cached message back, if any, for
    /// immediate replay to them alone.
    pub fn subscribe(
        &mut self,
        topic: &str,
        subscriber: SubscriberId,
        qos: u8,
    ) -> Option<CachedMessage> {
        let entry = self
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| TopicEntry {
                qos,
                subscribers: BTreeSet::new(),
            });
        let first = entry.subscribers.is_empty();
        entry.subscribers.insert(subscriber);

        if first {
            if self.state == LinkState::Connected {
                if let Err(e) = self.link.subscribe(topic, entry.qos) {
                    warn!(topic = %topic, error = %e, "Upstream subscribe failed");
                    self.failed.insert(topic.to_string());
                }
            }
            None
        } else {
            self.cache.get(topic).cloned()
        }
    }

    /// Removes a local subscriber; the last one out triggers the single
    /// upstream unsubscribe and drops the topic entry.
    pub fn unsubscribe(&mut self, topic: &str, subscriber: SubscriberId) {
        let Some(entry) = self.topics.get_mut(topic) else {
            return;
        };
        entry.subscribers.remove(&subscriber);
        if !entry.subscribers.is_empty() {
            return;
        }
        self.topics.remove(topic);
        self.failed.remove(topic);
        if self.state == LinkState::Connected {
            if let Err(e) = self.link.unsubscribe(topic) {
                warn!(topic = %topic, error = %e, "Upstream unsubscribe failed");
            }
        }
    }

    /// Removes the subscriber from every topic, unsubscribing upstream where
    /// it was the last one.
    pub fn remove_subscriber(&mut self, subscriber: SubscriberId) {
        let topics: Vec<String> = self
            .topics
            .iter()
            .filter(|(_, e)| e.subscribers.contains(&subscriber))
            .map(|(t, _)| t.clone())
            .collect();
        for topic in topics {
            self.unsubscribe(&topic, subscriber);
        }
    }

    /// Forwards a publish while connected; otherwise a delivery failure.
    pub fn publish(
        &mut self,
        topic: &str,
        payload: &str,
        qos: u8,
        retain: bool,
    ) -> Result<(), PublishError> {
        if self.state != LinkState::Connected {
            return Err(PublishError::NotConnected);
        }
        self.link
            .publish(topic, payload, qos, retain)
            .map_err(PublishError::Link)
    }

    /// Records an inbound message in the cache and returns the current
    /// subscribers of the exact topic for fan-out.
    pub fn handle_incoming(
        &mut self,
        topic: &str,
        payload: &str,
        qos: u8,
        retain: bool,
    ) -> Vec<SubscriberId> {
        self.cache.insert(
            topic.to_string(),
            CachedMessage {
                payload: payload.to_string(),
                qos,
                retain,
            },
        );
        match self.topics.get(topic) {
            Some(entry) => entry.subscribers.iter().copied().collect(),
            None => {
                debug!(topic = %topic, "Inbound message with no local subscriber");
                Vec::new()
            }
        }
    }
}
