//! Redis pub/sub backend, for rooms shared across processes.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use roomcast_core::BackendError;
use tracing::{debug, info, warn};

use super::PubSubBackend;

/// Redis `PUBLISH`/`SUBSCRIBE` bus.
///
/// Publishing goes through one multiplexed connection. Each subscription opens
/// its own pub/sub connection, since a subscribed Redis connection cannot
/// issue other commands.
pub struct RedisPubSub {
    client: Arc<redis::Client>,
    publisher: MultiplexedConnection,
}

impl RedisPubSub {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> Result<Self, BackendError> {
        let client = redis::Client::open(url).map_err(BackendError::unavailable)?;
        let publisher = client
            .get_multiplexed_async_connection()
            .await
            .map_err(BackendError::unavailable)?;
        info!(url, "connected to redis pub/sub");
        Ok(Self {
            client: Arc::new(client),
            publisher,
        })
    }
}

#[async_trait]
impl PubSubBackend for RedisPubSub {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), BackendError> {
        let mut conn = self.publisher.clone();
        let receivers: i64 = conn
            .publish(channel, payload.as_ref())
            .await
            .map_err(BackendError::unavailable)?;
        debug!(channel, receivers, "published to redis");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, Bytes>, BackendError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(BackendError::unavailable)?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(BackendError::unavailable)?;
        debug!(channel, "subscribed to redis channel");

        let stream = pubsub.into_on_message().filter_map(|msg| {
            let frame = match msg.get_payload::<Vec<u8>>() {
                Ok(payload) => Some(Bytes::from(payload)),
                Err(error) => {
                    warn!(channel = msg.get_channel_name(), %error, "unreadable redis payload");
                    None
                }
            };
            futures::future::ready(frame)
        });
        Ok(stream.boxed())
    }
}
