//! Branded ID newtypes.
//!
//! Connections and rooms each get their own type so a room token can never be
//! passed where a connection id is expected (and vice versa).
//!
//! - [`ConnectionId`] is a UUID v7 with a `conn_` prefix, unique per process.
//! - [`RoomId`] is an opaque token. Server-generated tokens carry 128 bits from
//!   the thread-local CSPRNG so they cannot be guessed or enumerated.

use std::borrow::Borrow;
use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Longest room token accepted from a client.
pub const MAX_ROOM_ID_LEN: usize = 128;

/// Number of random bytes in a generated room token.
const ROOM_TOKEN_BYTES: usize = 16;

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create from an existing string value without validation.
            #[must_use]
            pub fn from_string(s: String) -> Self {
                Self(s)
            }

            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

branded_id! {
    /// Unique identifier for a live WebSocket connection.
    ConnectionId
}

branded_id! {
    /// Opaque room token grouping connections that share broadcasts.
    RoomId
}

impl ConnectionId {
    /// Create a new time-ordered connection id.
    #[must_use]
    pub fn new() -> Self {
        Self(format!("conn_{}", Uuid::now_v7()))
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomId {
    /// Generate a fresh, unguessable room token.
    #[must_use]
    pub fn generate() -> Self {
        let bytes: [u8; ROOM_TOKEN_BYTES] = rand::random();
        Self(URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Accept a client-supplied room token if it is well-formed.
    ///
    /// Tokens must be 1..=[`MAX_ROOM_ID_LEN`] characters of
    /// `[A-Za-z0-9_-]`, the alphabet of generated tokens.
    pub fn parse(raw: &str) -> Option<Self> {
        is_valid_token(raw).then(|| Self(raw.to_owned()))
    }
}

fn is_valid_token(raw: &str) -> bool {
    !raw.is_empty()
        && raw.len() <= MAX_ROOM_ID_LEN
        && raw
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn connection_ids_are_unique() {
        let ids: HashSet<ConnectionId> = (0..100).map(|_| ConnectionId::new()).collect();
        assert_eq!(ids.len(), 100);
    }

    #[test]
    fn connection_id_has_prefix() {
        let id = ConnectionId::new();
        assert!(id.starts_with("conn_"));
    }

    #[test]
    fn generated_room_is_url_safe_and_128_bit() {
        let room = RoomId::generate();
        // 16 bytes -> 22 base64 chars without padding
        assert_eq!(room.len(), 22);
        assert!(RoomId::parse(room.as_str()).is_some());
    }

    #[test]
    fn generated_rooms_do_not_repeat() {
        let rooms: HashSet<RoomId> = (0..1000).map(|_| RoomId::generate()).collect();
        assert_eq!(rooms.len(), 1000);
    }

    #[test]
    fn parse_accepts_short_tokens() {
        assert_eq!(RoomId::parse("abc").unwrap().as_str(), "abc");
    }

    #[test]
    fn parse_rejects_bad_tokens() {
        assert!(RoomId::parse("").is_none());
        assert!(RoomId::parse("has space").is_none());
        assert!(RoomId::parse("../etc").is_none());
        assert!(RoomId::parse("room:1").is_none());
        assert!(RoomId::parse(&"a".repeat(MAX_ROOM_ID_LEN + 1)).is_none());
        assert!(RoomId::parse(&"a".repeat(MAX_ROOM_ID_LEN)).is_some());
    }

    #[test]
    fn serde_is_transparent() {
        let room = RoomId::from("abc");
        let json = serde_json::to_string(&room).unwrap();
        assert_eq!(json, "\"abc\"");
        let back: RoomId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, room);
    }

    #[test]
    fn borrow_as_str_for_map_lookups() {
        let mut set = HashSet::new();
        let _ = set.insert(RoomId::from("lobby"));
        assert!(set.contains("lobby"));
    }
}
