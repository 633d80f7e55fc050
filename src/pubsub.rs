//! Topic-based pub/sub adapter for subscriber acks and event notifications.
//!
//! Delivery is best-effort within a single process tree: a publish with
//! no live subscribers is silently dropped, and a slow subscriber may
//! lag and lose messages. That matches the contract the consistency
//! coordinator is written against -- acks are re-derivable facts, not
//! commands.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

/// Per-topic broadcast capacity. Slow subscribers past this many
/// buffered messages observe a `Lagged` error and skip ahead.
const TOPIC_CAPACITY: usize = 256;

/// Topic carrying event notifications for one stream.
pub fn stream_topic(stream_uuid: &str) -> String {
    format!("stream:{stream_uuid}")
}

/// Topic-based publish/subscribe of JSON messages.
#[async_trait]
pub trait PubSub: Send + Sync + 'static {
    /// Publish `message` to every current subscriber of `topic`.
    ///
    /// Best-effort: publishing to a topic with no subscribers is a no-op.
    async fn publish(&self, topic: &str, message: Value);

    /// Subscribe to `topic`, receiving messages published after this call.
    async fn subscribe(&self, topic: &str) -> broadcast::Receiver<Value>;
}

/// In-process pub/sub over per-topic `tokio::sync::broadcast` channels.
///
/// Channels are created lazily on first subscribe and kept for the
/// lifetime of the bus so later subscribers share the same topic.
#[derive(Debug, Default)]
pub struct LocalPubSub {
    topics: std::sync::Mutex<HashMap<String, broadcast::Sender<Value>>>,
}

impl LocalPubSub {
    /// Create a bus with no topics.
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Value> {
        let mut topics = self.topics.lock().expect("pubsub topic lock poisoned");
        topics
            .entry(topic.to_owned())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl PubSub for LocalPubSub {
    async fn publish(&self, topic: &str, message: Value) {
        let sender = {
            let topics = self.topics.lock().expect("pubsub topic lock poisoned");
            topics.get(topic).cloned()
        };
        if let Some(sender) = sender {
            // A send error just means nobody is listening right now.
            let _ = sender.send(message);
        }
    }

    async fn subscribe(&self, topic: &str) -> broadcast::Receiver<Value> {
        self.sender(topic).subscribe()
    }
}
