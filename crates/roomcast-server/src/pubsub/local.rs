//! In-process pub/sub on `tokio::sync::broadcast`.
//!
//! One broadcast channel per topic. A subscriber that falls more than
//! `capacity` frames behind skips the missed frames.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use futures::stream::BoxStream;
use roomcast_core::BackendError;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{trace, warn};

use super::PubSubBackend;

/// Default per-topic buffer.
pub const DEFAULT_CAPACITY: usize = 1024;

/// In-process bus. Share one instance (behind an `Arc`) between distributors
/// to simulate several processes in tests.
pub struct LocalPubSub {
    topics: DashMap<String, broadcast::Sender<Bytes>>,
    capacity: usize,
}

impl LocalPubSub {
    /// Create a bus with `capacity` frames buffered per topic.
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Number of topics with a live sender.
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    /// Number of live subscribers on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.topics
            .get(channel)
            .map_or(0, |sender| sender.receiver_count())
    }

    /// Attach a receiver while the entry guard is held, so a concurrent
    /// prune in `publish` cannot orphan the sender it hangs off.
    fn receiver(&self, channel: &str) -> broadcast::Receiver<Bytes> {
        self.topics
            .entry(channel.to_owned())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }
}

impl Default for LocalPubSub {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl PubSubBackend for LocalPubSub {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), BackendError> {
        let Some(sender) = self.topics.get(channel).map(|s| s.clone()) else {
            trace!(channel, "publish with no subscribers");
            return Ok(());
        };
        // An error only means nobody is listening right now.
        if sender.send(payload).is_err() {
            trace!(channel, "publish with no subscribers");
            let _ = self
                .topics
                .remove_if(channel, |_, sender| sender.receiver_count() == 0);
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, Bytes>, BackendError> {
        let receiver = self.receiver(channel);
        let topic = channel.to_owned();
        let stream = BroadcastStream::new(receiver).filter_map(move |item| {
            let frame = match item {
                Ok(frame) => Some(frame),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(channel = %topic, skipped, "subscriber lagged, frames skipped");
                    None
                }
            };
            futures::future::ready(frame)
        });
        Ok(stream.boxed())
    }
}
