//! `TopicBus`: local subscriber fan-out plus cluster-wide pub/sub broadcast.
//!
//! Mirrors `ConnectionRegistry`'s DashMap-of-sets approach
//! (`packages/server-rust/src/network/connection.rs`) but keyed by topic name
//! rather than connection ID, since many clients can share one topic.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use regex::Regex;
use tracing::debug;

use super::errors::ClusterError;
use super::types::ClusterConfig;

/// `^[A-Za-z0-9_./:\-]+$`, compiled once.
static TOPIC_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_./:\-]+$").expect("static topic regex is valid"));

const MAX_TOPIC_LEN: usize = 256;

/// A message delivered to local subscribers and/or broadcast to the cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicMessage {
    pub topic: String,
    pub data: Vec<u8>,
    pub publisher_id: Option<String>,
    pub timestamp_ms: u64,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Validates a topic name against the spec's naming rule.
pub fn validate_topic(name: &str) -> Result<(), ClusterError> {
    if name.is_empty() || name.len() > MAX_TOPIC_LEN || !TOPIC_NAME_RE.is_match(name) {
        return Err(ClusterError::InvalidTopicName {
            name: name.to_string(),
        });
    }
    Ok(())
}

/// Outcome of a `publish` call: what to deliver locally, and whether to
/// also gossip a `CLUSTER_TOPIC_PUB` to the rest of the cluster.
pub struct PublishOutcome {
    pub deliver_to: Vec<String>,
    pub message: TopicMessage,
    pub broadcast_to_cluster: bool,
}

/// Local subscriber table plus per-client subscription accounting.
///
/// Cluster fan-out is modeled by the caller: `publish` returns a
/// [`PublishOutcome`] telling the caller which local clients to deliver to and
/// whether to also emit a `CLUSTER_TOPIC_PUB`; the caller owns the transport.
pub struct TopicBus {
    subscriptions: DashMap<String, HashSet<String>>,
    client_topic_counts: DashMap<String, usize>,
    subscription_cap: usize,
}

impl TopicBus {
    #[must_use]
    pub fn new(config: &ClusterConfig) -> Self {
        Self {
            subscriptions: DashMap::new(),
            client_topic_counts: DashMap::new(),
            subscription_cap: config.topic_subscription_cap,
        }
    }

    /// Subscribes `client_id` to `topic`. Idempotent; enforces the per-client cap.
    pub fn subscribe(&self, client_id: &str, topic: &str) -> Result<(), ClusterError> {
        validate_topic(topic)?;

        let already_subscribed = self
            .subscriptions
            .get(topic)
            .is_some_and(|subs| subs.contains(client_id));
        if already_subscribed {
            return Ok(());
        }

        let current = self
            .client_topic_counts
            .get(client_id)
            .map_or(0, |c| *c);
        if current >= self.subscription_cap {
            return Err(ClusterError::SubscriptionLimitReached {
                client_id: client_id.to_string(),
                limit: self.subscription_cap,
            });
        }

        self.subscriptions
            .entry(topic.to_string())
            .or_default()
            .insert(client_id.to_string());
        *self.client_topic_counts.entry(client_id.to_string()).or_insert(0) += 1;
        debug!(client_id, topic, "subscribed");
        Ok(())
    }

    /// Unsubscribes `client_id` from `topic`. No-op if not subscribed.
    pub fn unsubscribe(&self, client_id: &str, topic: &str) {
        let mut removed = false;
        if let Some(mut subs) = self.subscriptions.get_mut(topic) {
            removed = subs.remove(client_id);
            if subs.is_empty() {
                drop(subs);
                self.subscriptions.remove(topic);
            }
        }
        if removed {
            self.decrement_count(client_id);
        }
    }

    /// Removes `client_id` from every topic it was subscribed to.
    pub fn unsubscribe_all(&self, client_id: &str) {
        let topics: Vec<String> = self
            .subscriptions
            .iter()
            .filter(|entry| entry.value().contains(client_id))
            .map(|entry| entry.key().clone())
            .collect();
        for topic in topics {
            self.unsubscribe(client_id, &topic);
        }
        self.client_topic_counts.remove(client_id);
    }

    fn decrement_count(&self, client_id: &str) {
        let mut remove_entry = false;
        if let Some(mut count) = self.client_topic_counts.get_mut(client_id) {
            *count = count.saturating_sub(1);
            remove_entry = *count == 0;
        }
        if remove_entry {
            self.client_topic_counts.remove(client_id);
        }
    }

    /// Resolves local delivery targets and whether to gossip to the cluster.
    ///
    /// `from_cluster = true` means this publish already arrived via
    /// `CLUSTER_TOPIC_PUB`, so it must not be re-broadcast (prevents loops).
    pub fn publish(
        &self,
        topic: &str,
        data: Vec<u8>,
        sender_id: Option<&str>,
        from_cluster: bool,
    ) -> Result<PublishOutcome, ClusterError> {
        validate_topic(topic)?;

        let deliver_to: Vec<String> = self
            .subscriptions
            .get(topic)
            .map(|subs| {
                subs.iter()
                    .filter(|id| Some(id.as_str()) != sender_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        Ok(PublishOutcome {
            deliver_to,
            message: TopicMessage {
                topic: topic.to_string(),
                data,
                publisher_id: sender_id.map(str::to_string),
                timestamp_ms: now_ms(),
            },
            broadcast_to_cluster: !from_cluster,
        })
    }

    /// Number of distinct topics currently populated.
    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Number of topics `client_id` currently holds subscriptions to.
    #[must_use]
    pub fn subscription_count(&self, client_id: &str) -> usize {
        self.client_topic_counts.get(client_id).map_or(0, |c| *c)
    }
}

/// Shared handle, suitable for use from multiple connection-handler tasks.
pub type SharedTopicBus = Arc<TopicBus>;

#[cfg(test)]
mod tests {
    use super::*;

    fn bus() -> TopicBus {
        TopicBus::new(&ClusterConfig::default())
    }

    #[test]
    fn valid_topic_names_pass() {
        assert!(validate_topic("orders.created").is_ok());
        assert!(validate_topic("a/b:c-d_e").is_ok());
    }

    #[test]
    fn invalid_topic_names_are_rejected() {
        assert!(validate_topic("").is_err());
        assert!(validate_topic("has space").is_err());
        assert!(validate_topic("bad!char").is_err());
        assert!(validate_topic(&"x".repeat(257)).is_err());
    }

    #[test]
    fn subscribe_is_idempotent() {
        let bus = bus();
        bus.subscribe("c1", "t1").unwrap();
        bus.subscribe("c1", "t1").unwrap();
        assert_eq!(bus.subscription_count("c1"), 1);
    }

    #[test]
    fn subscription_cap_is_enforced() {
        let config = ClusterConfig {
            topic_subscription_cap: 2,
            ..ClusterConfig::default()
        };
        let bus = TopicBus::new(&config);
        bus.subscribe("c1", "t1").unwrap();
        bus.subscribe("c1", "t2").unwrap();
        let err = bus.subscribe("c1", "t3").unwrap_err();
        assert!(matches!(err, ClusterError::SubscriptionLimitReached { .. }));
    }

    #[test]
    fn unsubscribe_removes_empty_topic() {
        let bus = bus();
        bus.subscribe("c1", "t1").unwrap();
        bus.unsubscribe("c1", "t1");
        assert_eq!(bus.topic_count(), 0);
        assert_eq!(bus.subscription_count("c1"), 0);
    }

    #[test]
    fn unsubscribe_all_clears_every_topic() {
        let bus = bus();
        bus.subscribe("c1", "t1").unwrap();
        bus.subscribe("c1", "t2").unwrap();
        bus.unsubscribe_all("c1");
        assert_eq!(bus.subscription_count("c1"), 0);
        assert_eq!(bus.topic_count(), 0);
    }

    #[test]
    fn publish_excludes_sender_from_delivery() {
        let bus = bus();
        bus.subscribe("c1", "t1").unwrap();
        bus.subscribe("c2", "t1").unwrap();

        let outcome = bus.publish("t1", vec![1, 2, 3], Some("c1"), false).unwrap();
        assert_eq!(outcome.deliver_to, vec!["c2".to_string()]);
        assert!(outcome.broadcast_to_cluster);
    }

    #[test]
    fn publish_from_cluster_does_not_rebroadcast() {
        let bus = bus();
        bus.subscribe("c1", "t1").unwrap();
        let outcome = bus.publish("t1", vec![], None, true).unwrap();
        assert!(!outcome.broadcast_to_cluster);
    }

    #[test]
    fn publish_invalid_topic_errors() {
        let bus = bus();
        let err = bus.publish("bad topic!", vec![], None, false).unwrap_err();
        assert!(matches!(err, ClusterError::InvalidTopicName { .. }));
    }
}
