//! JSON wire protocol for the collaboration transport.
//!
//! Every transport frame is one UTF-8 text payload holding exactly one
//! JSON object, discriminated by its `type` field:
//!
//! ```text
//! {"type": "steps", "roomId": "room-1", "clientId": "c42",
//!  "version": 7, "steps": [{"stepType": "replace", ...}]}
//! ```
//!
//! The same message set is used in both directions; on server-originated
//! messages `clientId` identifies the *subject* client (the joiner in a
//! `join` broadcast, the evicted client in a `leave`), not the sender.
//! Heartbeat pings are stamped with the literal [`SERVER_CLIENT_ID`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Room identifier: opaque, non-empty, chosen by clients.
pub type RoomId = String;

/// Client identifier: opaque, non-empty, unique only within a room.
pub type ClientId = String;

/// `clientId` stamped on server-originated heartbeat pings.
pub const SERVER_CLIENT_ID: &str = "server";

/// Reserved error codes. Codes outside this set are opaque to clients
/// and delivered to the consumer as-is.
pub mod codes {
    /// The sender's step batch was bound to a stale version.
    pub const VERSION_MISMATCH: &str = "version_mismatch";
    /// The steps could not be applied against the authoritative document.
    pub const APPLY_FAILED: &str = "apply_failed";
}

/// User identity carried inside a presence record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

impl UserInfo {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            color: None,
        }
    }
}

/// A cursor or selection range in document positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorRange {
    pub from: usize,
    pub to: usize,
}

/// Ephemeral per-client presence: identity, cursor, arbitrary annotations.
///
/// `timestamp` is stamped by the server on upsert (integer milliseconds,
/// server wall clock); clients may omit it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPresence {
    pub user: UserInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

impl UserPresence {
    pub fn new(user: UserInfo) -> Self {
        Self {
            user,
            cursor: None,
            meta: None,
            timestamp: None,
        }
    }

    pub fn with_cursor(mut self, from: usize, to: usize) -> Self {
        self.cursor = Some(CursorRange { from, to });
        self
    }
}

/// One entry of a `presence-snapshot`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub client_id: ClientId,
    pub presence: UserPresence,
}

/// Discriminates what an `ack` acknowledges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckType {
    Steps,
    Presence,
    Join,
    Leave,
}

/// Top-level protocol message.
///
/// Steps and documents travel as raw JSON values; only the
/// operational-transform adapter interprets them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum Message {
    /// Client: enter a room. Server: broadcast that a client joined.
    Join {
        room_id: RoomId,
        client_id: ClientId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        presence: Option<UserPresence>,
    },
    /// Client: leave a room. Server: broadcast that a client left
    /// (also emitted on presence eviction).
    Leave { room_id: RoomId, client_id: ClientId },
    /// Client: a step batch bound to `version`. Server: an accepted batch
    /// rebroadcast at its new version.
    Steps {
        room_id: RoomId,
        client_id: ClientId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<u64>,
        steps: Vec<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_selection: Option<CursorRange>,
    },
    /// Presence update; echoed back to the sender on broadcast.
    Presence {
        room_id: RoomId,
        client_id: ClientId,
        presence: UserPresence,
    },
    /// Full presence table, sent to a client on join.
    PresenceSnapshot {
        room_id: RoomId,
        client_id: ClientId,
        presences: Vec<PresenceEntry>,
    },
    /// Client: request the current document snapshot.
    DocRequest { room_id: RoomId, client_id: ClientId },
    /// Authoritative document at `version`.
    DocSnapshot {
        room_id: RoomId,
        client_id: ClientId,
        version: u64,
        doc: Value,
    },
    /// Client: request the steps accepted after `since_version`.
    HistoryRequest {
        room_id: RoomId,
        client_id: ClientId,
        since_version: i64,
    },
    /// Flattened steps from the batches in `(from_version, to_version]`.
    History {
        room_id: RoomId,
        client_id: ClientId,
        from_version: u64,
        to_version: u64,
        steps: Vec<Value>,
    },
    /// Server heartbeat; `client_id` is [`SERVER_CLIENT_ID`].
    Ping {
        room_id: RoomId,
        client_id: ClientId,
        ts: u64,
    },
    /// Client reply to a heartbeat ping, echoing its timestamp.
    Pong {
        room_id: RoomId,
        client_id: ClientId,
        ts: u64,
    },
    /// Positive or negative acknowledgement of a client operation.
    Ack {
        room_id: RoomId,
        client_id: ClientId,
        ack_type: AckType,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Server-side failure report; see [`codes`] for the reserved codes.
    Error {
        room_id: RoomId,
        client_id: ClientId,
        code: String,
        reason: String,
    },
}

impl Message {
    /// Create a heartbeat ping for a room.
    pub fn ping(room_id: impl Into<RoomId>, ts: u64) -> Self {
        Message::Ping {
            room_id: room_id.into(),
            client_id: SERVER_CLIENT_ID.to_string(),
            ts,
        }
    }

    /// Create an error report addressed to `client_id`.
    pub fn error(
        room_id: impl Into<RoomId>,
        client_id: impl Into<ClientId>,
        code: &str,
        reason: impl Into<String>,
    ) -> Self {
        Message::Error {
            room_id: room_id.into(),
            client_id: client_id.into(),
            code: code.to_string(),
            reason: reason.into(),
        }
    }

    /// Create a positive steps acknowledgement at `version`.
    pub fn steps_ack(
        room_id: impl Into<RoomId>,
        client_id: impl Into<ClientId>,
        version: u64,
    ) -> Self {
        Message::Ack {
            room_id: room_id.into(),
            client_id: client_id.into(),
            ack_type: AckType::Steps,
            ok: true,
            version: Some(version),
            reason: None,
        }
    }

    /// The room this message addresses.
    pub fn room_id(&self) -> &str {
        match self {
            Message::Join { room_id, .. }
            | Message::Leave { room_id, .. }
            | Message::Steps { room_id, .. }
            | Message::Presence { room_id, .. }
            | Message::PresenceSnapshot { room_id, .. }
            | Message::DocRequest { room_id, .. }
            | Message::DocSnapshot { room_id, .. }
            | Message::HistoryRequest { room_id, .. }
            | Message::History { room_id, .. }
            | Message::Ping { room_id, .. }
            | Message::Pong { room_id, .. }
            | Message::Ack { room_id, .. }
            | Message::Error { room_id, .. } => room_id,
        }
    }

    /// The subject client of this message.
    pub fn client_id(&self) -> &str {
        match self {
            Message::Join { client_id, .. }
            | Message::Leave { client_id, .. }
            | Message::Steps { client_id, .. }
            | Message::Presence { client_id, .. }
            | Message::PresenceSnapshot { client_id, .. }
            | Message::DocRequest { client_id, .. }
            | Message::DocSnapshot { client_id, .. }
            | Message::HistoryRequest { client_id, .. }
            | Message::History { client_id, .. }
            | Message::Ping { client_id, .. }
            | Message::Pong { client_id, .. }
            | Message::Ack { client_id, .. }
            | Message::Error { client_id, .. } => client_id,
        }
    }

    /// Serialize to the wire text form.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Deserialize from the wire text form.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

/// Wire codec errors.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("failed to encode message: {0}")]
    Encode(String),
    #[error("failed to decode message: {0}")]
    Decode(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_join_wire_shape() {
        let msg = Message::Join {
            room_id: "room-1".into(),
            client_id: "alice".into(),
            presence: None,
        };
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "join", "roomId": "room-1", "clientId": "alice"})
        );
    }

    #[test]
    fn test_steps_roundtrip() {
        let msg = Message::Steps {
            room_id: "room-1".into(),
            client_id: "alice".into(),
            version: Some(3),
            steps: vec![json!({"stepType": "replace", "from": 0, "to": 0, "insert": "x"})],
            client_selection: Some(CursorRange { from: 1, to: 1 }),
        };
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_steps_version_optional() {
        let text = r#"{"type":"steps","roomId":"r","clientId":"c","steps":[]}"#;
        match Message::decode(text).unwrap() {
            Message::Steps { version, steps, .. } => {
                assert_eq!(version, None);
                assert!(steps.is_empty());
            }
            other => panic!("expected steps, got {other:?}"),
        }
    }

    #[test]
    fn test_snapshot_wire_names() {
        let msg = Message::DocSnapshot {
            room_id: "r".into(),
            client_id: "c".into(),
            version: 7,
            doc: json!({"type": "doc", "content": "hi"}),
        };
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "doc-snapshot");
        assert_eq!(value["version"], 7);
        assert_eq!(value["doc"]["content"], "hi");
    }

    #[test]
    fn test_history_request_wire_names() {
        let msg = Message::HistoryRequest {
            room_id: "r".into(),
            client_id: "c".into(),
            since_version: 4,
        };
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "history-request");
        assert_eq!(value["sinceVersion"], 4);
    }

    #[test]
    fn test_presence_snapshot_roundtrip() {
        let presence = UserPresence::new(UserInfo::new("u1")).with_cursor(3, 5);
        let msg = Message::PresenceSnapshot {
            room_id: "r".into(),
            client_id: "c".into(),
            presences: vec![PresenceEntry {
                client_id: "u1".into(),
                presence,
            }],
        };
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "presence-snapshot");
        assert_eq!(value["presences"][0]["clientId"], "u1");
        assert_eq!(value["presences"][0]["presence"]["cursor"]["from"], 3);

        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_ack_wire_shape() {
        let msg = Message::steps_ack("r", "c", 9);
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "ack", "roomId": "r", "clientId": "c",
                "ackType": "steps", "ok": true, "version": 9
            })
        );
    }

    #[test]
    fn test_ping_is_stamped_with_server_id() {
        let msg = Message::ping("r", 1234);
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["clientId"], "server");
        assert_eq!(value["ts"], 1234);
    }

    #[test]
    fn test_error_roundtrip() {
        let msg = Message::error("r", "c", codes::VERSION_MISMATCH, "expected 2, got 1");
        match Message::decode(&msg.encode().unwrap()).unwrap() {
            Message::Error { code, reason, .. } => {
                assert_eq!(code, "version_mismatch");
                assert_eq!(reason, "expected 2, got 1");
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_type_rejected() {
        let text = r#"{"type":"telemetry","roomId":"r","clientId":"c"}"#;
        assert!(Message::decode(text).is_err());
    }

    #[test]
    fn test_non_json_rejected() {
        assert!(Message::decode("not json at all").is_err());
    }

    #[test]
    fn test_presence_omits_empty_fields() {
        let msg = Message::Presence {
            room_id: "r".into(),
            client_id: "c".into(),
            presence: UserPresence::new(UserInfo::new("c")),
        };
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert!(value["presence"].get("cursor").is_none());
        assert!(value["presence"].get("timestamp").is_none());
    }
}
