//! Cross-process message bus used for room broadcasts.
//!
//! A backend carries opaque frames on named channels. Publishing is
//! fire-and-forget; subscribing yields an infinite stream that ends only when
//! the backend drops the subscription.

pub mod local;
#[cfg(feature = "redis")]
pub mod redis;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use roomcast_core::BackendError;

pub use local::LocalPubSub;
#[cfg(feature = "redis")]
pub use self::redis::RedisPubSub;

/// A pub/sub bus shared by every process serving the same rooms.
#[async_trait]
pub trait PubSubBackend: Send + Sync {
    /// Publish `payload` on `channel`.
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), BackendError>;

    /// Subscribe to `channel`.
    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, Bytes>, BackendError>;
}
