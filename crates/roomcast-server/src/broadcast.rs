//! Room broadcast over the pub/sub bus.
//!
//! A broadcast is published once to the room's channel. Every process with
//! local members in that room runs one relay task subscribed to the channel;
//! the relay fans each frame out to its local members through the
//! [`ConnectionRegistry`]. The sender receives its own broadcast the same way.
//!
//! Frames carry a UUID v7 id. Each relay remembers the last `dedupe_window`
//! ids and drops repeats, so a frame reaches a connection at most once.
//!
//! When the bus is down the broadcast degrades to a unicast reply to the
//! sender, so an isolated process still answers its own client.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use futures::stream::BoxStream;
use metrics::counter;
use roomcast_core::codec;
use roomcast_core::{BackendError, OutboundMessage, RoomId};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::metrics::{
    BROADCAST_DEGRADED_TOTAL, BROADCAST_DELIVERED_TOTAL, BROADCAST_DUPLICATES_TOTAL,
    BROADCAST_PUBLISHED_TOTAL, BROADCAST_RESUBSCRIBES_TOTAL,
};
use crate::pubsub::PubSubBackend;
use crate::websocket::connection::ClientConnection;
use crate::websocket::registry::ConnectionRegistry;

/// Prefix of every room channel on the bus.
pub const CHANNEL_PREFIX: &str = "roomcast:room:";

/// Bus channel carrying broadcasts for `room`.
pub fn channel_name(room: &RoomId) -> String {
    format!("{CHANNEL_PREFIX}{room}")
}

/// How a broadcast was delivered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BroadcastOutcome {
    /// Published to the bus; relays deliver it to the room.
    Published,
    /// The bus was unavailable; only the sender was sent the message.
    DegradedToUnicast {
        /// Whether the sender's queue accepted it.
        delivered: bool,
    },
}

/// Envelope published on the bus.
#[derive(Debug, Serialize, Deserialize)]
struct BusFrame {
    id: Uuid,
    origin: Uuid,
    room: RoomId,
    payload: String,
}

struct RelayHandle {
    generation: u64,
    cancel: CancellationToken,
}

#[derive(Default)]
struct RoomSlot {
    relay: Option<RelayHandle>,
}

type SharedSlot = Arc<Mutex<RoomSlot>>;

/// Publishes room broadcasts and relays bus frames to local members.
pub struct BroadcastDistributor {
    instance_id: Uuid,
    backend: Arc<dyn PubSubBackend>,
    registry: Arc<ConnectionRegistry>,
    rooms: DashMap<RoomId, SharedSlot>,
    dedupe_window: usize,
    next_generation: AtomicU64,
    relays: TaskTracker,
    shutdown: CancellationToken,
}

impl BroadcastDistributor {
    /// Create a distributor delivering to `registry`'s connections.
    pub fn new(
        backend: Arc<dyn PubSubBackend>,
        registry: Arc<ConnectionRegistry>,
        dedupe_window: usize,
    ) -> Self {
        Self {
            instance_id: Uuid::now_v7(),
            backend,
            registry,
            rooms: DashMap::new(),
            dedupe_window: dedupe_window.max(1),
            next_generation: AtomicU64::new(0),
            relays: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Id stamped on frames this process publishes.
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Number of rooms with a relay running or reconnecting.
    ///
    /// Best effort: a slot locked by a concurrent subscribe or release is
    /// not counted.
    pub fn subscribed_rooms(&self) -> usize {
        self.rooms
            .iter()
            .filter(|entry| entry.value().try_lock().is_ok_and(|slot| slot.relay.is_some()))
            .count()
    }

    /// Make sure this process relays `room`'s channel. Idempotent.
    ///
    /// If the bus refuses the subscription the error is returned and a relay
    /// keeps retrying in the background while the room has local members.
    pub async fn subscribe_room(&self, room: &RoomId) -> Result<(), BackendError> {
        loop {
            let slot = Arc::clone(self.rooms.entry(room.clone()).or_default().value());
            let mut guard = slot.lock().await;
            if !self.is_current(room, &slot) {
                // Released while we waited for the lock.
                continue;
            }
            if guard.relay.is_some() {
                return Ok(());
            }

            let channel = channel_name(room);
            let subscribed = self.backend.subscribe(&channel).await;
            let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
            let cancel = self.shutdown.child_token();
            guard.relay = Some(RelayHandle {
                generation,
                cancel: cancel.clone(),
            });
            drop(guard);

            let relay = Relay {
                room: room.clone(),
                channel,
                backend: Arc::clone(&self.backend),
                registry: Arc::clone(&self.registry),
                slot,
                generation,
                recent: RecentFrames::new(self.dedupe_window),
            };
            return match subscribed {
                Ok(stream) => {
                    let _ = self.relays.spawn(relay.run(Some(stream), cancel));
                    debug!(%room, generation, "room relay started");
                    Ok(())
                }
                Err(error) => {
                    let _ = self.relays.spawn(relay.run(None, cancel));
                    debug!(%room, generation, "room relay waiting for the bus");
                    Err(error)
                }
            };
        }
    }

    /// Stop relaying `room` if it has no local members left.
    pub async fn release_room(&self, room: &RoomId) {
        if self.registry.has_members(room) {
            return;
        }
        let Some(slot) = self.rooms.get(room).map(|entry| Arc::clone(entry.value())) else {
            return;
        };
        let mut guard = slot.lock().await;
        if self.registry.has_members(room) {
            return;
        }
        if let Some(relay) = guard.relay.take() {
            relay.cancel.cancel();
            debug!(%room, generation = relay.generation, "room relay stopped");
        }
        let _ = self
            .rooms
            .remove_if(room, |_, current| Arc::ptr_eq(current, &slot));
    }

    /// Deliver `message` to every connection in `origin`'s room, on every
    /// process.
    pub async fn broadcast(
        &self,
        message: &OutboundMessage,
        origin: &Arc<ClientConnection>,
    ) -> BroadcastOutcome {
        let room = &origin.room;
        match self.publish(room, message).await {
            Ok(()) => {
                counter!(BROADCAST_PUBLISHED_TOTAL).increment(1);
                BroadcastOutcome::Published
            }
            Err(error) => {
                counter!(BROADCAST_DEGRADED_TOTAL).increment(1);
                warn!(%room, conn_id = %origin.id, %error, "broadcast unavailable, replying to sender only");
                let delivered = origin.send(codec::encode(message));
                BroadcastOutcome::DegradedToUnicast { delivered }
            }
        }
    }

    async fn publish(&self, room: &RoomId, message: &OutboundMessage) -> Result<(), BackendError> {
        // The sender must hear its own broadcast.
        self.subscribe_room(room).await?;
        let frame = BusFrame {
            id: Uuid::now_v7(),
            origin: self.instance_id,
            room: room.clone(),
            payload: codec::encode_string(message),
        };
        let bytes = serde_json::to_vec(&frame)?;
        self.backend
            .publish(&channel_name(room), Bytes::from(bytes))
            .await
    }

    /// Stop every relay and wait for them to exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let _ = self.relays.close();
        self.relays.wait().await;
        self.rooms.clear();
        info!(instance_id = %self.instance_id, "broadcast relays stopped");
    }

    fn is_current(&self, room: &RoomId, slot: &SharedSlot) -> bool {
        self.rooms
            .get(room)
            .is_some_and(|entry| Arc::ptr_eq(entry.value(), slot))
    }
}

/// Initial delay before resubscribing a dropped room channel.
const RESUBSCRIBE_BASE_DELAY: Duration = Duration::from_millis(100);
/// Upper bound on the resubscribe delay.
const RESUBSCRIBE_MAX_DELAY: Duration = Duration::from_secs(5);

/// Exponential resubscribe delay with up to 25% jitter.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]
fn resubscribe_delay(attempt: u32, random: f64) -> Duration {
    let base = RESUBSCRIBE_BASE_DELAY.as_millis() as u64;
    let max = RESUBSCRIBE_MAX_DELAY.as_millis() as u64;
    let capped = base.saturating_mul(1u64 << attempt.min(16)).min(max);
    let jitter = 1.0 + random.clamp(0.0, 1.0) * 0.25;
    Duration::from_millis(((capped as f64) * jitter).round() as u64)
}

struct Relay {
    room: RoomId,
    channel: String,
    backend: Arc<dyn PubSubBackend>,
    registry: Arc<ConnectionRegistry>,
    slot: SharedSlot,
    generation: u64,
    recent: RecentFrames,
}

impl Relay {
    /// Relay frames until cancelled. A dropped or refused subscription is
    /// retried while the room has local members.
    async fn run(
        mut self,
        mut stream: Option<BoxStream<'static, Bytes>>,
        cancel: CancellationToken,
    ) {
        loop {
            if let Some(current) = stream.take() {
                if !self.pump(current, &cancel).await {
                    break;
                }
                warn!(room = %self.room, "bus subscription ended, resubscribing");
            }
            stream = self.resubscribe(&cancel).await;
            if stream.is_none() && self.retire(&cancel).await {
                return;
            }
        }
        let _ = self.retire(&cancel).await;
    }

    /// Deliver frames from `stream`. Returns `false` once cancelled, `true`
    /// when the stream ended.
    async fn pump(
        &mut self,
        mut stream: BoxStream<'static, Bytes>,
        cancel: &CancellationToken,
    ) -> bool {
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return false,
                next = stream.next() => match next {
                    Some(raw) => self.deliver(&raw),
                    None => return true,
                },
            }
        }
    }

    /// Subscribe again with backoff. Gives up when cancelled or when the
    /// room has no local members left.
    async fn resubscribe(
        &self,
        cancel: &CancellationToken,
    ) -> Option<BoxStream<'static, Bytes>> {
        let mut attempt = 0u32;
        loop {
            let delay = resubscribe_delay(attempt, rand::random::<f64>());
            tokio::select! {
                biased;
                () = cancel.cancelled() => return None,
                () = tokio::time::sleep(delay) => {}
            }
            if !self.registry.has_members(&self.room) {
                debug!(room = %self.room, "room emptied, not resubscribing");
                return None;
            }
            match self.backend.subscribe(&self.channel).await {
                Ok(stream) => {
                    counter!(BROADCAST_RESUBSCRIBES_TOTAL).increment(1);
                    info!(room = %self.room, attempt, "bus subscription restored");
                    return Some(stream);
                }
                Err(error) => {
                    warn!(room = %self.room, attempt, %error, "resubscribe failed");
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    /// Clear this relay's slot unless a member joined while it was giving
    /// up. Returns `false` when the relay must keep going.
    async fn retire(&self, cancel: &CancellationToken) -> bool {
        let mut slot = self.slot.lock().await;
        if !cancel.is_cancelled() && self.registry.has_members(&self.room) {
            return false;
        }
        if slot
            .relay
            .as_ref()
            .is_some_and(|relay| relay.generation == self.generation)
        {
            slot.relay = None;
        }
        true
    }

    fn deliver(&mut self, raw: &[u8]) {
        let frame: BusFrame = match serde_json::from_slice(raw) {
            Ok(frame) => frame,
            Err(error) => {
                warn!(room = %self.room, %error, "discarding unreadable bus frame");
                return;
            }
        };
        if frame.room != self.room {
            warn!(room = %self.room, frame_room = %frame.room, "discarding frame for another room");
            return;
        }
        if !self.recent.insert(frame.id) {
            counter!(BROADCAST_DUPLICATES_TOTAL).increment(1);
            debug!(room = %self.room, frame_id = %frame.id, "duplicate frame dropped");
            return;
        }

        let report = self
            .registry
            .send_to_room(&self.room, &Bytes::from(frame.payload));
        counter!(BROADCAST_DELIVERED_TOTAL).increment(report.delivered as u64);
        debug!(
            room = %self.room,
            origin = %frame.origin,
            delivered = report.delivered,
            dropped = report.dropped,
            "broadcast relayed"
        );
    }
}

/// Bounded set of recently seen frame ids, evicting oldest first.
struct RecentFrames {
    order: VecDeque<Uuid>,
    seen: HashSet<Uuid>,
    capacity: usize,
}

impl RecentFrames {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Returns `false` if `id` was already seen.
    fn insert(&mut self, id: Uuid) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                let _ = self.seen.remove(&oldest);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::LocalPubSub;
    use async_trait::async_trait;
    use roomcast_core::ConnectionId;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);
    const QUIET: Duration = Duration::from_millis(100);

    struct FailingBackend;

    #[async_trait]
    impl PubSubBackend for FailingBackend {
        async fn publish(&self, _channel: &str, _payload: Bytes) -> Result<(), BackendError> {
            Err(BackendError::unavailable("connection refused"))
        }

        async fn subscribe(
            &self,
            _channel: &str,
        ) -> Result<BoxStream<'static, Bytes>, BackendError> {
            Err(BackendError::unavailable("connection refused"))
        }
    }

    fn join(
        registry: &ConnectionRegistry,
        id: &str,
        room: &str,
    ) -> (Arc<ClientConnection>, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(16);
        let conn = Arc::new(ClientConnection::new(
            ConnectionId::from(id),
            RoomId::from(room),
            tx,
        ));
        registry.register(Arc::clone(&conn)).unwrap();
        (conn, rx)
    }

    fn chat_line(text: &str) -> OutboundMessage {
        OutboundMessage::append("#chat-messages", format!("<p>{text}</p>")).broadcast()
    }

    async fn recv(rx: &mut mpsc::Receiver<Bytes>) -> serde_json::Value {
        let frame = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        serde_json::from_slice(&frame).unwrap()
    }

    /// Local bus whose open subscriptions can be cut and whose next
    /// subscribes can be refused.
    struct FlakyBus {
        inner: LocalPubSub,
        cut: parking_lot::Mutex<CancellationToken>,
        refuse: AtomicUsize,
        subscribes: AtomicUsize,
    }

    impl FlakyBus {
        fn new() -> Self {
            Self {
                inner: LocalPubSub::default(),
                cut: parking_lot::Mutex::new(CancellationToken::new()),
                refuse: AtomicUsize::new(0),
                subscribes: AtomicUsize::new(0),
            }
        }

        /// End every subscription handed out so far.
        fn cut(&self) {
            std::mem::take(&mut *self.cut.lock()).cancel();
        }

        fn refuse_next(&self, count: usize) {
            self.refuse.store(count, Ordering::SeqCst);
        }

        fn subscribes(&self) -> usize {
            self.subscribes.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PubSubBackend for FlakyBus {
        async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), BackendError> {
            self.inner.publish(channel, payload).await
        }

        async fn subscribe(
            &self,
            channel: &str,
        ) -> Result<BoxStream<'static, Bytes>, BackendError> {
            let refused = self
                .refuse
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if refused {
                return Err(BackendError::unavailable("bus down"));
            }
            let stream = self.inner.subscribe(channel).await?;
            let cut = self.cut.lock().clone();
            let _ = self.subscribes.fetch_add(1, Ordering::SeqCst);
            Ok(stream.take_until(cut.cancelled_owned()).boxed())
        }
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        timeout(WAIT, async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    async fn assert_quiet(rx: &mut mpsc::Receiver<Bytes>) {
        assert!(timeout(QUIET, rx.recv()).await.is_err(), "unexpected frame");
    }

    #[test]
    fn channel_names_are_prefixed() {
        assert_eq!(channel_name(&RoomId::from("abc")), "roomcast:room:abc");
    }

    #[test]
    fn recent_frames_evicts_oldest() {
        let mut recent = RecentFrames::new(2);
        let (a, b, c) = (Uuid::now_v7(), Uuid::now_v7(), Uuid::now_v7());
        assert!(recent.insert(a));
        assert!(!recent.insert(a));
        assert!(recent.insert(b));
        assert!(recent.insert(c));
        // `a` fell out of the window.
        assert!(recent.insert(a));
        assert!(!recent.insert(c));
    }

    #[tokio::test]
    async fn broadcast_reaches_room_members_only() {
        let registry = Arc::new(ConnectionRegistry::new());
        let dist = BroadcastDistributor::new(
            Arc::new(LocalPubSub::default()),
            Arc::clone(&registry),
            64,
        );
        let (a, mut rx_a) = join(&registry, "a", "abc");
        let (_b, mut rx_b) = join(&registry, "b", "abc");
        let (_c, mut rx_c) = join(&registry, "c", "other");
        dist.subscribe_room(&RoomId::from("abc")).await.unwrap();

        let outcome = dist.broadcast(&chat_line("hi"), &a).await;
        assert_eq!(outcome, BroadcastOutcome::Published);

        for rx in [&mut rx_a, &mut rx_b] {
            let json = recv(rx).await;
            assert_eq!(json["target"], "#chat-messages");
            assert_eq!(json["html"], "<p>hi</p>");
            assert_eq!(json["append"], true);
        }
        assert_quiet(&mut rx_c).await;
    }

    #[tokio::test]
    async fn broadcast_crosses_processes_on_shared_bus() {
        let bus: Arc<LocalPubSub> = Arc::new(LocalPubSub::default());
        let reg_one = Arc::new(ConnectionRegistry::new());
        let reg_two = Arc::new(ConnectionRegistry::new());
        let one = BroadcastDistributor::new(bus.clone(), Arc::clone(&reg_one), 64);
        let two = BroadcastDistributor::new(bus.clone(), Arc::clone(&reg_two), 64);
        assert_ne!(one.instance_id(), two.instance_id());

        let (a, mut rx_a) = join(&reg_one, "a", "abc");
        let (_b, mut rx_b) = join(&reg_two, "b", "abc");
        one.subscribe_room(&RoomId::from("abc")).await.unwrap();
        two.subscribe_room(&RoomId::from("abc")).await.unwrap();

        let _ = one.broadcast(&chat_line("across"), &a).await;

        assert_eq!(recv(&mut rx_a).await["html"], "<p>across</p>");
        assert_eq!(recv(&mut rx_b).await["html"], "<p>across</p>");
        assert_quiet(&mut rx_a).await;
        assert_quiet(&mut rx_b).await;
    }

    #[tokio::test]
    async fn broadcast_preserves_order() {
        let registry = Arc::new(ConnectionRegistry::new());
        let dist =
            BroadcastDistributor::new(Arc::new(LocalPubSub::default()), Arc::clone(&registry), 64);
        let (a, mut rx_a) = join(&registry, "a", "abc");

        for i in 0..5 {
            let _ = dist.broadcast(&chat_line(&i.to_string()), &a).await;
        }
        for i in 0..5 {
            assert_eq!(recv(&mut rx_a).await["html"], format!("<p>{i}</p>"));
        }
    }

    #[tokio::test]
    async fn failing_backend_degrades_to_unicast() {
        let registry = Arc::new(ConnectionRegistry::new());
        let dist = BroadcastDistributor::new(Arc::new(FailingBackend), Arc::clone(&registry), 64);
        let (a, mut rx_a) = join(&registry, "a", "abc");
        let (_b, mut rx_b) = join(&registry, "b", "abc");

        assert!(dist.subscribe_room(&RoomId::from("abc")).await.is_err());
        let outcome = dist.broadcast(&chat_line("alone"), &a).await;

        assert_eq!(outcome, BroadcastOutcome::DegradedToUnicast { delivered: true });
        assert_eq!(recv(&mut rx_a).await["html"], "<p>alone</p>");
        assert_quiet(&mut rx_b).await;
    }

    #[tokio::test]
    async fn duplicate_frames_are_delivered_once() {
        let bus = Arc::new(LocalPubSub::default());
        let registry = Arc::new(ConnectionRegistry::new());
        let dist = BroadcastDistributor::new(bus.clone(), Arc::clone(&registry), 64);
        let (_a, mut rx_a) = join(&registry, "a", "abc");
        dist.subscribe_room(&RoomId::from("abc")).await.unwrap();

        let frame = BusFrame {
            id: Uuid::now_v7(),
            origin: Uuid::now_v7(),
            room: RoomId::from("abc"),
            payload: r##"{"target":"#x","html":"once","append":true}"##.into(),
        };
        let bytes = Bytes::from(serde_json::to_vec(&frame).unwrap());
        let channel = channel_name(&RoomId::from("abc"));
        bus.publish(&channel, bytes.clone()).await.unwrap();
        bus.publish(&channel, bytes).await.unwrap();

        assert_eq!(recv(&mut rx_a).await["html"], "once");
        assert_quiet(&mut rx_a).await;
    }

    #[tokio::test]
    async fn garbage_and_foreign_frames_are_ignored() {
        let bus = Arc::new(LocalPubSub::default());
        let registry = Arc::new(ConnectionRegistry::new());
        let dist = BroadcastDistributor::new(bus.clone(), Arc::clone(&registry), 64);
        let (a, mut rx_a) = join(&registry, "a", "abc");
        dist.subscribe_room(&RoomId::from("abc")).await.unwrap();
        let channel = channel_name(&RoomId::from("abc"));

        bus.publish(&channel, Bytes::from_static(b"not json"))
            .await
            .unwrap();
        let foreign = BusFrame {
            id: Uuid::now_v7(),
            origin: Uuid::now_v7(),
            room: RoomId::from("elsewhere"),
            payload: "{}".into(),
        };
        bus.publish(&channel, Bytes::from(serde_json::to_vec(&foreign).unwrap()))
            .await
            .unwrap();
        let _ = dist.broadcast(&chat_line("still works"), &a).await;

        assert_eq!(recv(&mut rx_a).await["html"], "<p>still works</p>");
        assert_quiet(&mut rx_a).await;
    }

    #[tokio::test]
    async fn subscribe_is_idempotent() {
        let bus = Arc::new(LocalPubSub::default());
        let registry = Arc::new(ConnectionRegistry::new());
        let dist = BroadcastDistributor::new(bus.clone(), Arc::clone(&registry), 64);
        let room = RoomId::from("abc");
        dist.subscribe_room(&room).await.unwrap();
        dist.subscribe_room(&room).await.unwrap();
        assert_eq!(bus.subscriber_count(&channel_name(&room)), 1);
        assert_eq!(dist.subscribed_rooms(), 1);
    }

    #[tokio::test]
    async fn release_stops_relay_for_empty_room() {
        let bus = Arc::new(LocalPubSub::default());
        let registry = Arc::new(ConnectionRegistry::new());
        let dist = BroadcastDistributor::new(bus.clone(), Arc::clone(&registry), 64);
        let room = RoomId::from("abc");
        let (a, _rx) = join(&registry, "a", "abc");
        dist.subscribe_room(&room).await.unwrap();

        // Still has a member: release is a no-op.
        dist.release_room(&room).await;
        assert_eq!(dist.subscribed_rooms(), 1);

        let _ = registry.unregister(&a.id);
        dist.release_room(&room).await;
        assert_eq!(dist.subscribed_rooms(), 0);

        timeout(WAIT, async {
            while bus.subscriber_count(&channel_name(&room)) > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn shutdown_stops_all_relays() {
        let bus = Arc::new(LocalPubSub::default());
        let registry = Arc::new(ConnectionRegistry::new());
        let dist = BroadcastDistributor::new(bus.clone(), Arc::clone(&registry), 64);
        dist.subscribe_room(&RoomId::from("one")).await.unwrap();
        dist.subscribe_room(&RoomId::from("two")).await.unwrap();

        timeout(WAIT, dist.shutdown()).await.unwrap();
        assert_eq!(dist.subscribed_rooms(), 0);
        assert_eq!(bus.subscriber_count(&channel_name(&RoomId::from("one"))), 0);
    }

    #[test]
    fn resubscribe_delay_grows_and_caps() {
        assert_eq!(resubscribe_delay(0, 0.0), Duration::from_millis(100));
        assert_eq!(resubscribe_delay(3, 0.0), Duration::from_millis(800));
        assert_eq!(resubscribe_delay(40, 0.0), RESUBSCRIBE_MAX_DELAY);
        assert_eq!(resubscribe_delay(0, 1.0), Duration::from_millis(125));
    }

    #[tokio::test]
    async fn relay_resubscribes_after_bus_drop() {
        let bus = Arc::new(FlakyBus::new());
        let reg_one = Arc::new(ConnectionRegistry::new());
        let reg_two = Arc::new(ConnectionRegistry::new());
        let one = BroadcastDistributor::new(bus.clone(), Arc::clone(&reg_one), 64);
        let two = BroadcastDistributor::new(bus.clone(), Arc::clone(&reg_two), 64);
        let room = RoomId::from("abc");
        let (_a, mut rx_a) = join(&reg_one, "a", "abc");
        let (b, mut rx_b) = join(&reg_two, "b", "abc");
        one.subscribe_room(&room).await.unwrap();
        two.subscribe_room(&room).await.unwrap();
        assert_eq!(bus.subscribes(), 2);

        // One of the two relays is refused once before it gets back on.
        bus.refuse_next(1);
        bus.cut();
        eventually(|| bus.subscribes() == 4).await;
        assert_eq!(one.subscribed_rooms(), 1);

        for text in ["back", "again"] {
            assert_eq!(
                two.broadcast(&chat_line(text), &b).await,
                BroadcastOutcome::Published
            );
            let expected = format!("<p>{text}</p>");
            assert_eq!(recv(&mut rx_a).await["html"], expected.as_str());
            assert_eq!(recv(&mut rx_b).await["html"], expected.as_str());
        }
        assert_quiet(&mut rx_a).await;
    }

    #[tokio::test]
    async fn refused_subscribe_keeps_retrying() {
        let bus = Arc::new(FlakyBus::new());
        let reg_one = Arc::new(ConnectionRegistry::new());
        let reg_two = Arc::new(ConnectionRegistry::new());
        let one = BroadcastDistributor::new(bus.clone(), Arc::clone(&reg_one), 64);
        let two = BroadcastDistributor::new(bus.clone(), Arc::clone(&reg_two), 64);
        let room = RoomId::from("abc");
        let (_a, mut rx_a) = join(&reg_one, "a", "abc");
        let (b, _rx_b) = join(&reg_two, "b", "abc");

        bus.refuse_next(2);
        assert!(one.subscribe_room(&room).await.is_err());
        eventually(|| bus.subscribes() == 1).await;

        two.subscribe_room(&room).await.unwrap();
        let _ = two.broadcast(&chat_line("late"), &b).await;
        assert_eq!(recv(&mut rx_a).await["html"], "<p>late</p>");
    }

    #[tokio::test]
    async fn relay_gives_up_when_room_empties_during_outage() {
        let bus = Arc::new(FlakyBus::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let dist = BroadcastDistributor::new(bus.clone(), Arc::clone(&registry), 64);
        let room = RoomId::from("abc");
        let (a, _rx) = join(&registry, "a", "abc");
        dist.subscribe_room(&room).await.unwrap();

        bus.refuse_next(usize::MAX);
        bus.cut();
        let _ = registry.unregister(&a.id);

        eventually(|| dist.subscribed_rooms() == 0).await;
        assert_eq!(bus.subscribes(), 1);
    }
}
