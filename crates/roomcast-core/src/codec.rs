//! JSON wire codec.
//!
//! ```text
//! inbound:  {"action": <string>, "room": <string>, "form": {<string>: <string>, ...}}
//! outbound: {"target": <selector>, "html": <string>, "append": <bool>}
//! ```
//!
//! Decoding ignores unknown fields so older servers keep working with newer
//! clients. Encoding writes fields in a fixed order, so the same message always
//! produces the same bytes.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::errors::CodecError;
use crate::ids::RoomId;
use crate::messages::{InboundMessage, InsertMode, OutboundMessage, ServerEvent};

#[derive(Deserialize)]
struct InboundWire {
    action: String,
    #[serde(default)]
    room: Option<String>,
    #[serde(default)]
    form: Option<BTreeMap<String, String>>,
}

#[derive(Serialize)]
struct OutboundWire<'a> {
    target: &'a str,
    html: &'a str,
    append: bool,
}

/// Decode an inbound action envelope.
///
/// Fails with [`CodecError::Malformed`] when the bytes are not a JSON object,
/// the `action` is missing, empty or not a string, `form` is not a
/// string-to-string object, or `room` is not a valid room token. An empty
/// `room` is treated as absent.
pub fn decode(raw: &[u8]) -> Result<InboundMessage, CodecError> {
    let wire: InboundWire =
        serde_json::from_slice(raw).map_err(|e| CodecError::malformed(e.to_string()))?;

    if wire.action.trim().is_empty() {
        return Err(CodecError::malformed("action name is empty"));
    }

    let room = match wire.room.as_deref() {
        None | Some("") => None,
        Some(raw_room) => Some(
            RoomId::parse(raw_room).ok_or_else(|| CodecError::malformed("invalid room token"))?,
        ),
    };

    Ok(InboundMessage {
        action: wire.action,
        room,
        form: wire.form.unwrap_or_default(),
    })
}

/// Encode an outbound render instruction.
pub fn encode(message: &OutboundMessage) -> Bytes {
    Bytes::from(encode_string(message))
}

/// Encode an outbound render instruction as a `String`.
pub fn encode_string(message: &OutboundMessage) -> String {
    let wire = OutboundWire {
        target: &message.target,
        html: &message.html,
        append: message.mode == InsertMode::Append,
    };
    // Borrowed strings and a bool always serialize.
    serde_json::to_string(&wire).unwrap_or_default()
}

/// Encode a server control event.
pub fn encode_event(event: &ServerEvent) -> Bytes {
    match serde_json::to_vec(event) {
        Ok(json) => Bytes::from(json),
        Err(e) => {
            tracing::error!(event_type = %event.event_type, error = %e, "failed to serialize event");
            Bytes::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    #[test]
    fn decode_full_envelope() {
        let raw = br#"{"action":"send_message","room":"abc","form":{"username":"alice","message":"hi"}}"#;
        let msg = decode(raw).unwrap();
        assert_eq!(msg.action, "send_message");
        assert_eq!(msg.room.as_deref(), Some("abc"));
        assert_eq!(msg.field("username"), Some("alice"));
        assert_eq!(msg.field("message"), Some("hi"));
    }

    #[test]
    fn decode_action_only() {
        let msg = decode(br#"{"action":"ping"}"#).unwrap();
        assert_eq!(msg.action, "ping");
        assert!(msg.room.is_none());
        assert!(msg.form.is_empty());
    }

    #[test]
    fn decode_ignores_unknown_fields() {
        let msg = decode(br#"{"action":"ping","version":3,"extra":{"nested":true}}"#).unwrap();
        assert_eq!(msg.action, "ping");
    }

    #[test]
    fn decode_null_form_and_empty_room() {
        let msg = decode(br#"{"action":"ping","room":"","form":null}"#).unwrap();
        assert!(msg.room.is_none());
        assert!(msg.form.is_empty());
    }

    #[test]
    fn decode_missing_action_is_malformed() {
        assert_matches!(
            decode(br#"{"room":"abc","form":{}}"#),
            Err(CodecError::Malformed { .. })
        );
    }

    #[test]
    fn decode_empty_action_is_malformed() {
        assert_matches!(decode(br#"{"action":"  "}"#), Err(CodecError::Malformed { .. }));
    }

    #[test]
    fn decode_non_string_action_is_malformed() {
        assert_matches!(decode(br#"{"action":42}"#), Err(CodecError::Malformed { .. }));
    }

    #[test]
    fn decode_garbage_is_malformed() {
        assert_matches!(decode(b"not json at all"), Err(CodecError::Malformed { .. }));
        assert_matches!(decode(b""), Err(CodecError::Malformed { .. }));
        assert_matches!(decode(b"[1,2,3]"), Err(CodecError::Malformed { .. }));
        assert_matches!(decode(&[0xff, 0xfe, 0x00]), Err(CodecError::Malformed { .. }));
    }

    #[test]
    fn decode_non_string_form_value_is_malformed() {
        assert_matches!(
            decode(br#"{"action":"x","form":{"age":42}}"#),
            Err(CodecError::Malformed { .. })
        );
    }

    #[test]
    fn decode_bad_room_token_is_malformed() {
        assert_matches!(
            decode(br#"{"action":"x","room":"../../etc"}"#),
            Err(CodecError::Malformed { .. })
        );
    }

    #[test]
    fn encode_replace_fixture() {
        let msg = OutboundMessage::replace("#greeting", "<p>Hello, Bob!</p>");
        let bytes = encode(&msg);
        insta::assert_snapshot!(
            std::str::from_utf8(&bytes).unwrap(),
            @r###"{"target":"#greeting","html":"<p>Hello, Bob!</p>","append":false}"###
        );
    }

    #[test]
    fn encode_append_fixture() {
        let msg = OutboundMessage::append("#chat-messages", "<p>hi</p>").broadcast();
        insta::assert_snapshot!(
            encode_string(&msg),
            @r###"{"target":"#chat-messages","html":"<p>hi</p>","append":true}"###
        );
    }

    #[test]
    fn encode_escapes_quotes_and_newlines() {
        let msg = OutboundMessage::replace("#t", "a \"quoted\"\nline");
        let parsed: serde_json::Value = serde_json::from_slice(&encode(&msg)).unwrap();
        assert_eq!(parsed["html"], "a \"quoted\"\nline");
    }

    #[test]
    fn fan_out_is_not_on_the_wire() {
        let unicast = OutboundMessage::append("#t", "x");
        let broadcast = unicast.clone().broadcast();
        assert_eq!(encode(&unicast), encode(&broadcast));
    }

    #[test]
    fn encode_event_is_json() {
        let event = ServerEvent::new("connection.established", None);
        let parsed: serde_json::Value = serde_json::from_slice(&encode_event(&event)).unwrap();
        assert_eq!(parsed["type"], "connection.established");
    }

    proptest! {
        #[test]
        fn decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = decode(&bytes);
        }

        #[test]
        fn encode_is_byte_stable(target in ".{0,40}", html in ".{0,200}", append in any::<bool>()) {
            let msg = if append {
                OutboundMessage::append(target, html)
            } else {
                OutboundMessage::replace(target, html)
            };
            prop_assert_eq!(encode(&msg), encode(&msg.clone()));
        }

        #[test]
        fn well_formed_envelopes_decode(
            action in "[a-z_]{1,20}",
            name in "[a-z]{1,10}",
            value in ".{0,50}",
        ) {
            let mut form = serde_json::Map::new();
            let _ = form.insert(name.clone(), serde_json::Value::String(value.clone()));
            let raw = serde_json::json!({"action": action, "form": form}).to_string();
            let msg = decode(raw.as_bytes()).unwrap();
            prop_assert_eq!(msg.action, action);
            prop_assert_eq!(msg.form.get(&name), Some(&value));
        }
    }
}
