//! Live connections and their room membership.
//!
//! Two sharded maps: the connection table and the room index. Writers always
//! touch the connection table first and never hold a guard on one map while
//! locking the other, so concurrent register/unregister cannot deadlock and
//! fan-out to one room never waits on another room's shard.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use metrics::{counter, gauge};
use roomcast_core::{ConnectionId, RegistryError, RoomId};
use tracing::{debug, warn};

use super::connection::ClientConnection;
use crate::metrics::{ROOMS_ACTIVE, WS_SEND_DROPS_TOTAL};

/// Result of delivering one frame to a room's local members.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FanOutReport {
    /// Frames queued successfully.
    pub delivered: usize,
    /// Members whose queue was full or closed.
    pub dropped: usize,
}

/// Registry of live connections grouped by room.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<ClientConnection>>,
    rooms: DashMap<RoomId, HashSet<ConnectionId>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection in its room.
    pub fn register(&self, connection: Arc<ClientConnection>) -> Result<(), RegistryError> {
        let id = connection.id.clone();
        let room = connection.room.clone();

        match self.connections.entry(id.clone()) {
            Entry::Occupied(_) => return Err(RegistryError::DuplicateConnection(id)),
            Entry::Vacant(slot) => {
                let _ = slot.insert(connection);
            }
        }

        let _ = self.rooms.entry(room.clone()).or_default().insert(id.clone());
        self.update_room_gauge();
        debug!(conn_id = %id, %room, "connection registered");
        Ok(())
    }

    /// Remove a connection. Idempotent: returns `None` if it was not present.
    pub fn unregister(&self, id: &ConnectionId) -> Option<Arc<ClientConnection>> {
        let (_, connection) = self.connections.remove(id)?;
        let room = &connection.room;

        if let Some(mut members) = self.rooms.get_mut(room) {
            let _ = members.remove(id);
        }
        let _ = self.rooms.remove_if(room, |_, members| members.is_empty());

        self.update_room_gauge();
        debug!(conn_id = %id, %room, "connection unregistered");
        Some(connection)
    }

    /// Snapshot of the connection ids in `room`. Empty for unknown rooms.
    pub fn members_of(&self, room: &RoomId) -> RoomMembers {
        let ids: Arc<[ConnectionId]> = self
            .rooms
            .get(room)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_else(|| Arc::from(Vec::new()));
        RoomMembers { ids, next: 0 }
    }

    /// Look up a connection.
    pub fn get(&self, id: &ConnectionId) -> Option<Arc<ClientConnection>> {
        self.connections.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Whether `room` has at least one local member.
    pub fn has_members(&self, room: &RoomId) -> bool {
        self.rooms.get(room).is_some_and(|members| !members.is_empty())
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no connections are registered.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Number of rooms with at least one member.
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Queue a frame for one connection.
    pub fn send_to(&self, id: &ConnectionId, frame: Bytes) -> bool {
        let Some(connection) = self.get(id) else {
            return false;
        };
        let sent = connection.send(frame);
        if !sent {
            counter!(WS_SEND_DROPS_TOTAL).increment(1);
            warn!(conn_id = %id, "outbound queue full or closed, dropping frame");
        }
        sent
    }

    /// Queue a frame for every local member of `room`.
    ///
    /// A member that disconnects mid-fan-out simply misses the frame. A full
    /// queue drops the frame for that member only.
    pub fn send_to_room(&self, room: &RoomId, frame: &Bytes) -> FanOutReport {
        let mut report = FanOutReport::default();
        for id in self.members_of(room) {
            let Some(connection) = self.get(&id) else {
                continue;
            };
            if connection.send(frame.clone()) {
                report.delivered += 1;
            } else {
                report.dropped += 1;
                warn!(conn_id = %id, %room, "outbound queue full or closed, dropping frame");
            }
        }
        if report.dropped > 0 {
            counter!(WS_SEND_DROPS_TOTAL).increment(report.dropped as u64);
        }
        report
    }

    #[allow(clippy::cast_precision_loss)]
    fn update_room_gauge(&self) {
        gauge!(ROOMS_ACTIVE).set(self.rooms.len() as f64);
    }
}

/// Lazy, restartable sequence of a room's member ids.
///
/// Iterates a snapshot taken by [`ConnectionRegistry::members_of`]; cloning
/// or calling [`RoomMembers::reset`] starts over from the first id.
#[derive(Clone, Debug)]
pub struct RoomMembers {
    ids: Arc<[ConnectionId]>,
    next: usize,
}

impl RoomMembers {
    /// Number of ids in the snapshot.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether the snapshot is empty.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Rewind to the first id.
    pub fn reset(&mut self) {
        self.next = 0;
    }
}

impl Iterator for RoomMembers {
    type Item = ConnectionId;

    fn next(&mut self) -> Option<ConnectionId> {
        let id = self.ids.get(self.next)?.clone();
        self.next += 1;
        Some(id)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.ids.len().saturating_sub(self.next);
        (remaining, Some(remaining))
    }
}
